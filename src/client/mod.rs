//! Persistence client contract.
//!
//! Components talk to storage only through these traits. Reads are scoped to
//! the caller's agency by the implementation, so no method takes a tenant id.
//! Two implementations exist: [`local::LocalClient`] runs in-process against
//! SQLite and [`remote::RemoteClient`] talks HTTP to `agencyflow serve`.

pub mod local;
pub mod remote;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::checkout::{CheckoutRequest, CheckoutResponse};
use crate::crm::feed::ChangeEvent;
use crate::crm::models::*;
use crate::errors::{CheckoutError, CrmError};

pub use crate::crm::feed::{ChangeFilter, ChangeKind, Table};
pub use local::LocalClient;
pub use remote::RemoteClient;

#[async_trait]
pub trait DealStore: Send + Sync {
    /// Deals of the caller's agency with contact names, newest first.
    async fn list_deals(&self) -> Result<Vec<DealWithContact>, CrmError>;
    async fn create_deal(&self, deal: NewDeal) -> Result<Deal, CrmError>;
    /// Change only the stage of a deal.
    async fn update_deal_stage(&self, id: Uuid, stage: Stage) -> Result<Deal, CrmError>;
    async fn delete_deal(&self, id: Uuid) -> Result<(), CrmError>;
}

#[async_trait]
pub trait ContactStore: Send + Sync {
    async fn list_contacts(&self) -> Result<Vec<Contact>, CrmError>;
    async fn create_contact(&self, contact: NewContact) -> Result<Contact, CrmError>;
    async fn delete_contact(&self, id: Uuid) -> Result<(), CrmError>;
}

#[async_trait]
pub trait ContractStore: Send + Sync {
    async fn list_contracts(&self) -> Result<Vec<ContractWithContact>, CrmError>;
    async fn create_contract(&self, contract: ContractInput) -> Result<Contract, CrmError>;
    async fn update_contract(&self, id: Uuid, contract: ContractInput) -> Result<Contract, CrmError>;
    async fn delete_contract(&self, id: Uuid) -> Result<(), CrmError>;
}

#[async_trait]
pub trait QuizStore: Send + Sync {
    async fn list_quizzes(&self) -> Result<Vec<QuizSummary>, CrmError>;
    async fn create_quiz(&self, title: String, description: String) -> Result<Quiz, CrmError>;
    async fn quiz_detail(&self, id: Uuid) -> Result<QuizDetail, CrmError>;
    async fn update_quiz(&self, id: Uuid, update: QuizUpdate) -> Result<Quiz, CrmError>;
    async fn delete_quiz(&self, id: Uuid) -> Result<(), CrmError>;

    async fn add_question(&self, quiz_id: Uuid, question: NewQuestion) -> Result<Question, CrmError>;
    async fn update_question(&self, id: Uuid, update: QuestionUpdate) -> Result<Question, CrmError>;
    async fn delete_question(&self, id: Uuid) -> Result<(), CrmError>;
    async fn reorder_questions(&self, quiz_id: Uuid, order: Vec<Uuid>) -> Result<Vec<Question>, CrmError>;

    async fn add_option(&self, question_id: Uuid, option: NewOption) -> Result<QuizOption, CrmError>;
    async fn update_option(&self, id: Uuid, update: OptionUpdate) -> Result<QuizOption, CrmError>;
    async fn delete_option(&self, id: Uuid) -> Result<(), CrmError>;

    async fn list_responses(&self, quiz_id: Uuid) -> Result<Vec<QuizResponse>, CrmError>;

    /// A published quiz for anonymous respondents.
    async fn published_quiz(&self, id: Uuid) -> Result<PublicQuiz, CrmError>;
    /// Store a completed quiz atomically. Works without an identity.
    async fn submit_response(&self, submission: QuizSubmission) -> Result<SubmissionReceipt, CrmError>;
}

#[async_trait]
pub trait AgencyStore: Send + Sync {
    async fn current_user(&self) -> Result<Option<AuthUser>, CrmError>;
    /// The caller's membership. `Ok(None)` when they belong to no agency.
    async fn membership(&self) -> Result<Option<Membership>, CrmError>;
    async fn agency(&self, id: Uuid) -> Result<Agency, CrmError>;
    async fn list_members(&self) -> Result<Vec<Member>, CrmError>;
    async fn create_agency(&self, name: String) -> Result<Agency, CrmError>;
    async fn update_agency_name(&self, name: String) -> Result<Agency, CrmError>;
    async fn add_member(&self, user_id: Uuid, role: Role) -> Result<Member, CrmError>;
    async fn remove_member(&self, member_id: Uuid) -> Result<(), CrmError>;
    async fn create_invitation(&self, email: String, role: Role) -> Result<Invitation, CrmError>;
    async fn invitation_details(&self, token: Uuid) -> Result<InvitationDetails, CrmError>;
    async fn accept_invitation(&self, token: Uuid) -> Result<Member, CrmError>;
}

#[async_trait]
pub trait NotificationStore: Send + Sync {
    async fn list_notifications(&self, limit: usize) -> Result<Vec<Notification>, CrmError>;
    async fn mark_read(&self, ids: Vec<Uuid>) -> Result<(), CrmError>;
    async fn mark_all_read(&self) -> Result<(), CrmError>;
}

#[async_trait]
pub trait ProfileStore: Send + Sync {
    async fn get_profile(&self) -> Result<Option<Profile>, CrmError>;
    /// Update the theme columns. `Ok(false)` when no profile row exists yet.
    async fn update_theme(&self, mode: ThemeMode, style: ThemeStyle) -> Result<bool, CrmError>;
    async fn upsert_profile(&self, profile: Profile) -> Result<Profile, CrmError>;
}

#[async_trait]
pub trait Realtime: Send + Sync {
    async fn subscribe(&self, filter: ChangeFilter) -> Result<Subscription, CrmError>;
}

#[async_trait]
pub trait Billing: Send + Sync {
    /// Invoke the checkout function and return the hosted checkout URL.
    async fn start_checkout(&self, request: CheckoutRequest) -> Result<CheckoutResponse, CheckoutError>;
}

/// Everything a component may need from the backend.
pub trait Persistence:
    DealStore
    + ContactStore
    + ContractStore
    + QuizStore
    + AgencyStore
    + NotificationStore
    + ProfileStore
    + Realtime
    + Billing
{
}

impl<T> Persistence for T where
    T: DealStore
        + ContactStore
        + ContractStore
        + QuizStore
        + AgencyStore
        + NotificationStore
        + ProfileStore
        + Realtime
        + Billing
{
}

/// Buffer between a feed pump and its subscriber.
pub(crate) const SUBSCRIPTION_BUFFER: usize = 64;

/// One item delivered by a [`Subscription`].
#[derive(Debug, Clone, PartialEq)]
pub enum RealtimeMessage {
    Change(ChangeEvent),
    /// The subscriber fell behind and `skipped` changes were dropped.
    /// Anything cached from the subscribed table must be refetched.
    Resync { skipped: u64 },
}

impl RealtimeMessage {
    pub fn change(&self) -> Option<&ChangeEvent> {
        match self {
            Self::Change(event) => Some(event),
            Self::Resync { .. } => None,
        }
    }
}

impl From<ChangeEvent> for RealtimeMessage {
    fn from(event: ChangeEvent) -> Self {
        Self::Change(event)
    }
}

/// A live realtime subscription. Dropping it unsubscribes.
pub struct Subscription {
    rx: mpsc::Receiver<RealtimeMessage>,
    task: JoinHandle<()>,
}

impl Subscription {
    pub(crate) fn new(rx: mpsc::Receiver<RealtimeMessage>, task: JoinHandle<()>) -> Self {
        Self { rx, task }
    }

    /// Wait for the next change or resync marker. `None` once the feed has
    /// closed or the caller lost access to the subscribed agency.
    pub async fn next(&mut self) -> Option<RealtimeMessage> {
        self.rx.recv().await
    }

    /// Return a message that is already buffered, without waiting.
    pub fn try_next(&mut self) -> Option<RealtimeMessage> {
        self.rx.try_recv().ok()
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.task.abort();
    }
}
