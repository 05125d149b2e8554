//! Framework-independent application components.
//!
//! Each component owns its state and talks to the backend only through the
//! client traits, so it runs the same against [`LocalClient`] and
//! [`RemoteClient`].
//!
//! | Component | Screen |
//! |-----------|--------|
//! | [`board::PipelineBoard`] | Sales pipeline (kanban) |
//! | [`quiz_flow::QuizFlow`] | Public quiz wizard |
//! | [`quiz_builder::QuizBuilder`] | Quiz list and editor |
//! | [`contacts::ContactList`] | Clients |
//! | [`contracts::ContractBook`] | Contracts, KPIs, CSV export |
//! | [`agency::AgencyContext`] | Agency, role and team |
//! | [`notifications::NotificationCenter`] | Notification bell and toasts |
//! | [`theme::ThemeSettings`] | Appearance settings |
//! | [`plans::PlanGuard`] | Plan limits and upgrade |
//! | [`session::check_session`] | Route guard |
//!
//! [`LocalClient`]: crate::client::LocalClient
//! [`RemoteClient`]: crate::client::RemoteClient

pub mod agency;
pub mod board;
pub mod contacts;
pub mod contracts;
pub mod notifications;
pub mod plans;
pub mod quiz_builder;
pub mod quiz_flow;
pub mod session;
pub mod theme;

#[cfg(test)]
mod scenarios;
