//! AgencyFlow backend: tenant-scoped storage, the change feed and the HTTP
//! service that fronts them.
//!
//! ## Overview
//!
//! Every business row belongs to exactly one agency. The store filters each
//! read and write by the caller's agency, announces committed changes on a
//! broadcast feed and serves both over HTTP for remote clients.
//!
//! ## Module Map
//!
//! ```text
//! ┌─────────────┐  HTTP  ┌────────────────────────────────────────────────┐
//! │ RemoteClient│ ─────> │ server.rs  (Router, apikey check, CORS)        │
//! │  (reqwest)  │ <───── │   ├─ api.rs       (REST + checkout handlers)   │
//! └─────────────┘  SSE   │   └─ realtime.rs  (change stream)              │
//!                        │          │                                     │
//!                        │          │ LocalClient (per-caller)            │
//!                        │          v                                     │
//!                        │ authz.rs / validate.rs (role + field checks)   │
//!                        │          │                                     │
//!                        │          v                                     │
//!                        │ db.rs  (CrmDb on the blocking pool)            │
//!                        │ feed.rs (ChangeFeed broadcast)                 │
//!                        └────────────────────────────────────────────────┘
//! ```
//!
//! ## Supporting Modules
//!
//! | Module     | Responsibility                                           |
//! |------------|----------------------------------------------------------|
//! | `models`   | Shared types: `Deal`, `Contact`, `Quiz`, `Agency`, ...   |
//! | `auth`     | Bearer-token identities (`AuthProvider`, `DbTokenAuth`)  |
//! | `payments` | `PaymentProvider` trait and the Stripe form client       |
//!
//! ## Typical Request Flow (respondent completes a quiz)
//!
//! 1. `POST /rest/v1/public/quizzes/{id}/responses` reaches `api.rs`.
//! 2. The anonymous `LocalClient` calls `CrmDb::submit_response`, which
//!    writes contact, deal, response, answers and notification in one
//!    transaction.
//! 3. Each inserted row is published on the feed; open `/realtime/v1/stream`
//!    connections for that agency receive the matching frames.

pub mod api;
pub mod auth;
pub mod authz;
pub mod db;
pub mod feed;
pub mod models;
pub mod payments;
pub mod realtime;
pub mod server;
pub mod validate;
