//! HTTP persistence client for a running `agencyflow serve`.
//!
//! Every request carries the anon key in the `apikey` header and, once a
//! user has signed in, their access token as a bearer credential. Error
//! bodies are turned back into typed errors. A client built from a disabled
//! configuration never touches the network.

use async_trait::async_trait;
use reqwest::{Method, RequestBuilder, Response, StatusCode};
use serde::Deserialize;
use serde::de::DeserializeOwned;
use tokio::sync::mpsc;
use uuid::Uuid;

use super::{
    AgencyStore, Billing, ContactStore, ContractStore, DealStore, NotificationStore, ProfileStore,
    QuizStore, Realtime, RealtimeMessage, SUBSCRIPTION_BUFFER, Subscription,
};
use crate::checkout::{CheckoutRequest, CheckoutResponse};
use crate::config::BackendStatus;
use crate::crm::api::{
    AddMemberRequest, AgencyNameRequest, CreateQuizRequest, InviteRequest, MarkReadRequest,
    ReorderRequest, ThemeRequest, ThemeUpdated, UpdateStageRequest,
};
use crate::crm::feed::{ChangeEvent, ChangeFilter};
use crate::crm::models::*;
use crate::crm::realtime::RESYNC_EVENT;
use crate::crm::server::APIKEY_HEADER;
use crate::errors::{CheckoutError, CrmError};

#[derive(Debug, Deserialize)]
struct WireError {
    error: String,
    code: Option<String>,
}

#[derive(Clone)]
pub struct RemoteClient {
    http: reqwest::Client,
    base_url: String,
    anon_key: String,
    access_token: Option<String>,
    /// Set when the configuration was rejected.
    disabled: Option<String>,
}

impl RemoteClient {
    pub fn new(base_url: impl Into<String>, anon_key: impl Into<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            anon_key: anon_key.into(),
            access_token: None,
            disabled: None,
        }
    }

    /// A client that fails every call with a configuration error.
    pub fn disabled(reason: impl Into<String>) -> Self {
        Self {
            disabled: Some(reason.into()),
            ..Self::new("", "")
        }
    }

    pub fn from_status(status: &BackendStatus) -> Self {
        match status {
            BackendStatus::Enabled { url, anon_key } => Self::new(url.as_str(), anon_key.as_str()),
            BackendStatus::Disabled { reason } => Self::disabled(reason.as_str()),
        }
    }

    /// The same client acting for a signed-in user.
    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.access_token = Some(token.into());
        self
    }

    /// Banner text while the backend is not configured.
    pub fn warning(&self) -> Option<String> {
        self.disabled.as_ref().map(|reason| {
            format!(
                "Backend is not configured ({}). Set AGENCYFLOW_URL and AGENCYFLOW_ANON_KEY.",
                reason
            )
        })
    }

    pub fn is_enabled(&self) -> bool {
        self.disabled.is_none()
    }

    fn request(&self, method: Method, path: &str) -> Result<RequestBuilder, CrmError> {
        if let Some(reason) = &self.disabled {
            return Err(CrmError::Configuration(reason.clone()));
        }
        let mut builder = self
            .http
            .request(method, format!("{}{}", self.base_url, path))
            .header(APIKEY_HEADER, &self.anon_key);
        if let Some(token) = &self.access_token {
            builder = builder.bearer_auth(token);
        }
        Ok(builder)
    }

    async fn dispatch(&self, builder: RequestBuilder) -> Result<Response, CrmError> {
        let resp = builder
            .send()
            .await
            .map_err(|e| CrmError::Transient(format!("request failed: {}", e)))?;
        if resp.status().is_success() {
            Ok(resp)
        } else {
            Err(error_from(resp).await)
        }
    }

    async fn fetch<T: DeserializeOwned>(&self, builder: RequestBuilder) -> Result<T, CrmError> {
        self.dispatch(builder)
            .await?
            .json()
            .await
            .map_err(|e| CrmError::Remote {
                status: 200,
                message: format!("invalid response body: {}", e),
            })
    }

    async fn execute(&self, builder: RequestBuilder) -> Result<(), CrmError> {
        self.dispatch(builder).await.map(|_| ())
    }
}

async fn error_from(resp: Response) -> CrmError {
    let status = resp.status().as_u16();
    match resp.json::<WireError>().await {
        Ok(body) => CrmError::from_wire(status, body.code.as_deref(), body.error),
        Err(_) => CrmError::from_wire(status, None, format!("HTTP {}", status)),
    }
}

// ── Stores ────────────────────────────────────────────────────────────

#[async_trait]
impl DealStore for RemoteClient {
    async fn list_deals(&self) -> Result<Vec<DealWithContact>, CrmError> {
        self.fetch(self.request(Method::GET, "/rest/v1/deals")?).await
    }

    async fn create_deal(&self, deal: NewDeal) -> Result<Deal, CrmError> {
        self.fetch(self.request(Method::POST, "/rest/v1/deals")?.json(&deal))
            .await
    }

    async fn update_deal_stage(&self, id: Uuid, stage: Stage) -> Result<Deal, CrmError> {
        let path = format!("/rest/v1/deals/{}", id);
        self.fetch(self.request(Method::PATCH, &path)?.json(&UpdateStageRequest { stage }))
            .await
    }

    async fn delete_deal(&self, id: Uuid) -> Result<(), CrmError> {
        let path = format!("/rest/v1/deals/{}", id);
        self.execute(self.request(Method::DELETE, &path)?).await
    }
}

#[async_trait]
impl ContactStore for RemoteClient {
    async fn list_contacts(&self) -> Result<Vec<Contact>, CrmError> {
        self.fetch(self.request(Method::GET, "/rest/v1/contacts")?).await
    }

    async fn create_contact(&self, contact: NewContact) -> Result<Contact, CrmError> {
        self.fetch(self.request(Method::POST, "/rest/v1/contacts")?.json(&contact))
            .await
    }

    async fn delete_contact(&self, id: Uuid) -> Result<(), CrmError> {
        let path = format!("/rest/v1/contacts/{}", id);
        self.execute(self.request(Method::DELETE, &path)?).await
    }
}

#[async_trait]
impl ContractStore for RemoteClient {
    async fn list_contracts(&self) -> Result<Vec<ContractWithContact>, CrmError> {
        self.fetch(self.request(Method::GET, "/rest/v1/contracts")?).await
    }

    async fn create_contract(&self, contract: ContractInput) -> Result<Contract, CrmError> {
        self.fetch(self.request(Method::POST, "/rest/v1/contracts")?.json(&contract))
            .await
    }

    async fn update_contract(&self, id: Uuid, contract: ContractInput) -> Result<Contract, CrmError> {
        let path = format!("/rest/v1/contracts/{}", id);
        self.fetch(self.request(Method::PUT, &path)?.json(&contract)).await
    }

    async fn delete_contract(&self, id: Uuid) -> Result<(), CrmError> {
        let path = format!("/rest/v1/contracts/{}", id);
        self.execute(self.request(Method::DELETE, &path)?).await
    }
}

#[async_trait]
impl QuizStore for RemoteClient {
    async fn list_quizzes(&self) -> Result<Vec<QuizSummary>, CrmError> {
        self.fetch(self.request(Method::GET, "/rest/v1/quizzes")?).await
    }

    async fn create_quiz(&self, title: String, description: String) -> Result<Quiz, CrmError> {
        let body = CreateQuizRequest { title, description };
        self.fetch(self.request(Method::POST, "/rest/v1/quizzes")?.json(&body))
            .await
    }

    async fn quiz_detail(&self, id: Uuid) -> Result<QuizDetail, CrmError> {
        let path = format!("/rest/v1/quizzes/{}", id);
        self.fetch(self.request(Method::GET, &path)?).await
    }

    async fn update_quiz(&self, id: Uuid, update: QuizUpdate) -> Result<Quiz, CrmError> {
        let path = format!("/rest/v1/quizzes/{}", id);
        self.fetch(self.request(Method::PATCH, &path)?.json(&update)).await
    }

    async fn delete_quiz(&self, id: Uuid) -> Result<(), CrmError> {
        let path = format!("/rest/v1/quizzes/{}", id);
        self.execute(self.request(Method::DELETE, &path)?).await
    }

    async fn add_question(&self, quiz_id: Uuid, question: NewQuestion) -> Result<Question, CrmError> {
        let path = format!("/rest/v1/quizzes/{}/questions", quiz_id);
        self.fetch(self.request(Method::POST, &path)?.json(&question)).await
    }

    async fn update_question(&self, id: Uuid, update: QuestionUpdate) -> Result<Question, CrmError> {
        let path = format!("/rest/v1/questions/{}", id);
        self.fetch(self.request(Method::PATCH, &path)?.json(&update)).await
    }

    async fn delete_question(&self, id: Uuid) -> Result<(), CrmError> {
        let path = format!("/rest/v1/questions/{}", id);
        self.execute(self.request(Method::DELETE, &path)?).await
    }

    async fn reorder_questions(&self, quiz_id: Uuid, order: Vec<Uuid>) -> Result<Vec<Question>, CrmError> {
        let path = format!("/rest/v1/quizzes/{}/questions/order", quiz_id);
        self.fetch(self.request(Method::PUT, &path)?.json(&ReorderRequest { order }))
            .await
    }

    async fn add_option(&self, question_id: Uuid, option: NewOption) -> Result<QuizOption, CrmError> {
        let path = format!("/rest/v1/questions/{}/options", question_id);
        self.fetch(self.request(Method::POST, &path)?.json(&option)).await
    }

    async fn update_option(&self, id: Uuid, update: OptionUpdate) -> Result<QuizOption, CrmError> {
        let path = format!("/rest/v1/options/{}", id);
        self.fetch(self.request(Method::PATCH, &path)?.json(&update)).await
    }

    async fn delete_option(&self, id: Uuid) -> Result<(), CrmError> {
        let path = format!("/rest/v1/options/{}", id);
        self.execute(self.request(Method::DELETE, &path)?).await
    }

    async fn list_responses(&self, quiz_id: Uuid) -> Result<Vec<QuizResponse>, CrmError> {
        let path = format!("/rest/v1/quizzes/{}/responses", quiz_id);
        self.fetch(self.request(Method::GET, &path)?).await
    }

    async fn published_quiz(&self, id: Uuid) -> Result<PublicQuiz, CrmError> {
        let path = format!("/rest/v1/public/quizzes/{}", id);
        self.fetch(self.request(Method::GET, &path)?).await
    }

    async fn submit_response(&self, submission: QuizSubmission) -> Result<SubmissionReceipt, CrmError> {
        let path = format!("/rest/v1/public/quizzes/{}/responses", submission.quiz_id);
        self.fetch(self.request(Method::POST, &path)?.json(&submission))
            .await
    }
}

#[async_trait]
impl AgencyStore for RemoteClient {
    async fn current_user(&self) -> Result<Option<AuthUser>, CrmError> {
        if self.access_token.is_none() {
            return Ok(None);
        }
        match self.fetch(self.request(Method::GET, "/auth/v1/user")?).await {
            Ok(user) => Ok(Some(user)),
            Err(CrmError::Unauthorized) => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn membership(&self) -> Result<Option<Membership>, CrmError> {
        self.fetch(self.request(Method::GET, "/rest/v1/membership")?).await
    }

    async fn agency(&self, id: Uuid) -> Result<Agency, CrmError> {
        let path = format!("/rest/v1/agencies/{}", id);
        self.fetch(self.request(Method::GET, &path)?).await
    }

    async fn list_members(&self) -> Result<Vec<Member>, CrmError> {
        self.fetch(self.request(Method::GET, "/rest/v1/members")?).await
    }

    async fn create_agency(&self, name: String) -> Result<Agency, CrmError> {
        self.fetch(self.request(Method::POST, "/rest/v1/agencies")?.json(&AgencyNameRequest { name }))
            .await
    }

    async fn update_agency_name(&self, name: String) -> Result<Agency, CrmError> {
        self.fetch(self.request(Method::PUT, "/rest/v1/agency/name")?.json(&AgencyNameRequest { name }))
            .await
    }

    async fn add_member(&self, user_id: Uuid, role: Role) -> Result<Member, CrmError> {
        self.fetch(self.request(Method::POST, "/rest/v1/members")?.json(&AddMemberRequest { user_id, role }))
            .await
    }

    async fn remove_member(&self, member_id: Uuid) -> Result<(), CrmError> {
        let path = format!("/rest/v1/members/{}", member_id);
        self.execute(self.request(Method::DELETE, &path)?).await
    }

    async fn create_invitation(&self, email: String, role: Role) -> Result<Invitation, CrmError> {
        self.fetch(self.request(Method::POST, "/rest/v1/invitations")?.json(&InviteRequest { email, role }))
            .await
    }

    async fn invitation_details(&self, token: Uuid) -> Result<InvitationDetails, CrmError> {
        let path = format!("/rest/v1/invitations/{}", token);
        self.fetch(self.request(Method::GET, &path)?).await
    }

    async fn accept_invitation(&self, token: Uuid) -> Result<Member, CrmError> {
        let path = format!("/rest/v1/invitations/{}/accept", token);
        self.fetch(self.request(Method::POST, &path)?).await
    }
}

#[async_trait]
impl NotificationStore for RemoteClient {
    async fn list_notifications(&self, limit: usize) -> Result<Vec<Notification>, CrmError> {
        let limit = limit.to_string();
        self.fetch(
            self.request(Method::GET, "/rest/v1/notifications")?
                .query(&[("limit", limit.as_str())]),
        )
        .await
    }

    async fn mark_read(&self, ids: Vec<Uuid>) -> Result<(), CrmError> {
        self.execute(self.request(Method::POST, "/rest/v1/notifications/read")?.json(&MarkReadRequest { ids }))
            .await
    }

    async fn mark_all_read(&self) -> Result<(), CrmError> {
        self.execute(self.request(Method::POST, "/rest/v1/notifications/read-all")?)
            .await
    }
}

#[async_trait]
impl ProfileStore for RemoteClient {
    async fn get_profile(&self) -> Result<Option<Profile>, CrmError> {
        self.fetch(self.request(Method::GET, "/rest/v1/profile")?).await
    }

    async fn update_theme(&self, mode: ThemeMode, style: ThemeStyle) -> Result<bool, CrmError> {
        let body = ThemeRequest {
            theme_mode: mode,
            theme_style: style,
        };
        let updated: ThemeUpdated = self
            .fetch(self.request(Method::PATCH, "/rest/v1/profile/theme")?.json(&body))
            .await?;
        Ok(updated.updated)
    }

    async fn upsert_profile(&self, profile: Profile) -> Result<Profile, CrmError> {
        self.fetch(self.request(Method::PUT, "/rest/v1/profile")?.json(&profile))
            .await
    }
}

// ── Realtime ──────────────────────────────────────────────────────────

#[async_trait]
impl Realtime for RemoteClient {
    async fn subscribe(&self, filter: ChangeFilter) -> Result<Subscription, CrmError> {
        let mut query = vec![("table", filter.table.as_str().to_string())];
        if let Some(kind) = filter.event {
            query.push(("event", kind.as_str().to_string()));
        }
        if let Some(agency_id) = filter.agency_id {
            query.push(("agency_id", agency_id.to_string()));
        }
        let mut resp = self
            .dispatch(self.request(Method::GET, "/realtime/v1/stream")?.query(&query))
            .await?;

        let (tx, rx) = mpsc::channel(SUBSCRIPTION_BUFFER);
        let task = tokio::spawn(async move {
            let mut buf = Vec::new();
            loop {
                match resp.chunk().await {
                    Ok(Some(bytes)) => {
                        buf.extend_from_slice(&bytes);
                        for message in drain_events(&mut buf) {
                            if tx.send(message).await.is_err() {
                                return;
                            }
                        }
                    }
                    Ok(None) => break,
                    Err(e) => {
                        tracing::warn!(error = %e, "realtime stream interrupted");
                        break;
                    }
                }
            }
        });
        Ok(Subscription::new(rx, task))
    }
}

/// Pop every complete SSE frame off the front of `buf` and decode the
/// messages they carry. Comment frames and undecodable data are skipped.
fn drain_events(buf: &mut Vec<u8>) -> Vec<RealtimeMessage> {
    let mut messages = Vec::new();
    while let Some(end) = buf.windows(2).position(|w| w == b"\n\n") {
        let frame: Vec<u8> = buf.drain(..end + 2).collect();
        let text = String::from_utf8_lossy(&frame);
        let field = |name: &str| -> Vec<String> {
            text.lines()
                .filter_map(|line| line.strip_prefix(name))
                .map(|v| v.strip_prefix(' ').unwrap_or(v).to_string())
                .collect()
        };
        let data = field("data:");
        if data.is_empty() {
            continue;
        }
        let data = data.join("\n");
        if field("event:").first().map(String::as_str) == Some(RESYNC_EVENT) {
            #[derive(Deserialize)]
            struct Resync {
                #[serde(default)]
                skipped: u64,
            }
            let skipped = serde_json::from_str::<Resync>(&data).map(|r| r.skipped).unwrap_or(0);
            messages.push(RealtimeMessage::Resync { skipped });
            continue;
        }
        match serde_json::from_str::<ChangeEvent>(&data) {
            Ok(event) => messages.push(RealtimeMessage::Change(event)),
            Err(e) => tracing::debug!(error = %e, "skipping undecodable realtime frame"),
        }
    }
    messages
}

// ── Billing ───────────────────────────────────────────────────────────

#[async_trait]
impl Billing for RemoteClient {
    async fn start_checkout(&self, request: CheckoutRequest) -> Result<CheckoutResponse, CheckoutError> {
        let builder = self
            .request(Method::POST, "/functions/v1/checkout")?
            .json(&request);
        let resp = builder
            .send()
            .await
            .map_err(|e| CrmError::Transient(format!("request failed: {}", e)))?;

        let status = resp.status();
        if status.is_success() {
            return resp
                .json()
                .await
                .map_err(|e| CheckoutError::Provider(format!("invalid checkout response: {}", e)));
        }
        if status != StatusCode::BAD_REQUEST {
            return Err(error_from(resp).await.into());
        }
        let message = resp
            .json::<WireError>()
            .await
            .map(|body| body.error)
            .unwrap_or_else(|_| format!("HTTP {}", status));
        Err(checkout_error(message))
    }
}

/// Rebuild a checkout error from the function's `{ "error" }` message.
fn checkout_error(message: String) -> CheckoutError {
    match message.as_str() {
        "User not found" => CheckoutError::UserNotFound,
        "User does not belong to an agency" => CheckoutError::NoAgency,
        "Only the agency owner can subscribe" => CheckoutError::NotOwner,
        "Payments are not configured" => CheckoutError::NotConfigured,
        _ => CheckoutError::Provider(message),
    }
}
