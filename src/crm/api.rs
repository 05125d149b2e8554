use std::sync::Arc;

use axum::{
    Json, Router,
    body::Bytes,
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode, header},
    response::{IntoResponse, Response},
    routing::{get, patch, post, put},
};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::auth::AuthProvider;
use super::db::DbHandle;
use super::feed::ChangeFeed;
use super::models::*;
use crate::checkout::{CheckoutRequest, CheckoutService};
use crate::client::{
    AgencyStore, ContactStore, ContractStore, DealStore, LocalClient, NotificationStore,
    ProfileStore, QuizStore,
};
use crate::errors::{CheckoutError, CrmError};

/// Default page size for notification listings.
pub const DEFAULT_NOTIFICATION_LIMIT: usize = 50;

// ── Shared application state ──────────────────────────────────────────

pub struct AppState {
    /// Anonymous client; requests get a copy bound to their caller.
    pub client: LocalClient,
    pub auth: Arc<dyn AuthProvider>,
    pub checkout: CheckoutService,
    /// Public key every request must present in the `apikey` header.
    pub anon_key: String,
}

impl AppState {
    pub fn new(
        db: DbHandle,
        feed: ChangeFeed,
        auth: Arc<dyn AuthProvider>,
        checkout: CheckoutService,
        anon_key: impl Into<String>,
    ) -> Self {
        Self {
            client: LocalClient::new(db, feed),
            auth,
            checkout,
            anon_key: anon_key.into(),
        }
    }
}

pub type SharedState = Arc<AppState>;

// ── Request payload types ─────────────────────────────────────────────

#[derive(Debug, Serialize, Deserialize)]
pub struct UpdateStageRequest {
    pub stage: Stage,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct CreateQuizRequest {
    pub title: String,
    #[serde(default)]
    pub description: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ReorderRequest {
    pub order: Vec<Uuid>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct AgencyNameRequest {
    pub name: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct AddMemberRequest {
    pub user_id: Uuid,
    pub role: Role,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct InviteRequest {
    pub email: String,
    pub role: Role,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct MarkReadRequest {
    pub ids: Vec<Uuid>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ThemeRequest {
    pub theme_mode: ThemeMode,
    pub theme_style: ThemeStyle,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ThemeUpdated {
    pub updated: bool,
}

#[derive(Debug, Deserialize)]
pub struct LimitQuery {
    pub limit: Option<usize>,
}

// ── Error handling ────────────────────────────────────────────────────

/// Wire form of a `CrmError`: `{ "error": message, "code": kind }`.
pub struct ApiError(pub CrmError);

impl From<CrmError> for ApiError {
    fn from(err: CrmError) -> Self {
        Self(err)
    }
}

pub fn status_for(err: &CrmError) -> StatusCode {
    match err {
        CrmError::Validation(_) => StatusCode::BAD_REQUEST,
        CrmError::Unauthorized => StatusCode::UNAUTHORIZED,
        CrmError::Forbidden(_) => StatusCode::FORBIDDEN,
        CrmError::NotFound(_) => StatusCode::NOT_FOUND,
        CrmError::Conflict(_) => StatusCode::CONFLICT,
        CrmError::Configuration(_) | CrmError::Transient(_) => StatusCode::SERVICE_UNAVAILABLE,
        CrmError::Database(_) | CrmError::Remote { .. } => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = status_for(&self.0);
        if status.is_server_error() {
            tracing::error!(error = %self.0, "request failed");
        }
        (
            status,
            Json(serde_json::json!({"error": self.0.to_string(), "code": self.0.code()})),
        )
            .into_response()
    }
}

// ── Router ────────────────────────────────────────────────────────────

pub fn api_router() -> Router<SharedState> {
    Router::new()
        .route("/rest/v1/deals", get(list_deals).post(create_deal))
        .route("/rest/v1/deals/{id}", patch(update_deal_stage).delete(delete_deal))
        .route("/rest/v1/contacts", get(list_contacts).post(create_contact))
        .route("/rest/v1/contacts/{id}", axum::routing::delete(delete_contact))
        .route("/rest/v1/contracts", get(list_contracts).post(create_contract))
        .route("/rest/v1/contracts/{id}", put(update_contract).delete(delete_contract))
        .route("/rest/v1/quizzes", get(list_quizzes).post(create_quiz))
        .route(
            "/rest/v1/quizzes/{id}",
            get(quiz_detail).patch(update_quiz).delete(delete_quiz),
        )
        .route("/rest/v1/quizzes/{id}/questions", post(add_question))
        .route("/rest/v1/quizzes/{id}/questions/order", put(reorder_questions))
        .route("/rest/v1/quizzes/{id}/responses", get(list_responses))
        .route("/rest/v1/questions/{id}", patch(update_question).delete(delete_question))
        .route("/rest/v1/questions/{id}/options", post(add_option))
        .route("/rest/v1/options/{id}", patch(update_option).delete(delete_option))
        .route("/rest/v1/public/quizzes/{id}", get(published_quiz))
        .route("/rest/v1/public/quizzes/{id}/responses", post(submit_response))
        .route("/rest/v1/membership", get(membership))
        .route("/rest/v1/agencies", post(create_agency))
        .route("/rest/v1/agencies/{id}", get(get_agency))
        .route("/rest/v1/agency/name", put(update_agency_name))
        .route("/rest/v1/members", get(list_members).post(add_member))
        .route("/rest/v1/members/{id}", axum::routing::delete(remove_member))
        .route("/rest/v1/invitations", post(create_invitation))
        .route("/rest/v1/invitations/{token}", get(invitation_details))
        .route("/rest/v1/invitations/{token}/accept", post(accept_invitation))
        .route("/rest/v1/notifications", get(list_notifications))
        .route("/rest/v1/notifications/read", post(mark_read))
        .route("/rest/v1/notifications/read-all", post(mark_all_read))
        .route("/rest/v1/profile", get(get_profile).put(upsert_profile))
        .route("/rest/v1/profile/theme", patch(update_theme))
        .route("/auth/v1/user", get(current_user))
        .route("/functions/v1/checkout", post(checkout).options(checkout_preflight))
        .route("/health", get(health_check))
}

// ── Helpers ───────────────────────────────────────────────────────────

/// Token from an `Authorization: Bearer <token>` header.
pub fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    let value = headers.get(header::AUTHORIZATION)?.to_str().ok()?;
    let (scheme, token) = value.split_once(' ')?;
    if !scheme.eq_ignore_ascii_case("bearer") {
        return None;
    }
    Some(token.trim()).filter(|t| !t.is_empty())
}

/// A client acting for the request's caller. Requests without a bearer
/// token are anonymous; an unknown token is rejected.
pub async fn caller(state: &AppState, headers: &HeaderMap) -> Result<LocalClient, CrmError> {
    match bearer_token(headers) {
        None => Ok(state.client.clone()),
        Some(token) => match state.auth.resolve(token).await? {
            Some(user) => Ok(state.client.as_user(user)),
            None => Err(CrmError::Unauthorized),
        },
    }
}

// ── Handlers: deals ───────────────────────────────────────────────────

async fn list_deals(
    State(state): State<SharedState>,
    headers: HeaderMap,
) -> Result<Json<Vec<DealWithContact>>, ApiError> {
    let client = caller(&state, &headers).await?;
    Ok(Json(client.list_deals().await?))
}

async fn create_deal(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Json(req): Json<NewDeal>,
) -> Result<impl IntoResponse, ApiError> {
    let client = caller(&state, &headers).await?;
    let deal = client.create_deal(req).await?;
    Ok((StatusCode::CREATED, Json(deal)))
}

async fn update_deal_stage(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Path(id): Path<Uuid>,
    Json(req): Json<UpdateStageRequest>,
) -> Result<Json<Deal>, ApiError> {
    let client = caller(&state, &headers).await?;
    Ok(Json(client.update_deal_stage(id, req.stage).await?))
}

async fn delete_deal(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Path(id): Path<Uuid>,
) -> Result<StatusCode, ApiError> {
    let client = caller(&state, &headers).await?;
    client.delete_deal(id).await?;
    Ok(StatusCode::NO_CONTENT)
}

// ── Handlers: contacts & contracts ────────────────────────────────────

async fn list_contacts(
    State(state): State<SharedState>,
    headers: HeaderMap,
) -> Result<Json<Vec<Contact>>, ApiError> {
    let client = caller(&state, &headers).await?;
    Ok(Json(client.list_contacts().await?))
}

async fn create_contact(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Json(req): Json<NewContact>,
) -> Result<impl IntoResponse, ApiError> {
    let client = caller(&state, &headers).await?;
    let contact = client.create_contact(req).await?;
    Ok((StatusCode::CREATED, Json(contact)))
}

async fn delete_contact(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Path(id): Path<Uuid>,
) -> Result<StatusCode, ApiError> {
    let client = caller(&state, &headers).await?;
    client.delete_contact(id).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn list_contracts(
    State(state): State<SharedState>,
    headers: HeaderMap,
) -> Result<Json<Vec<ContractWithContact>>, ApiError> {
    let client = caller(&state, &headers).await?;
    Ok(Json(client.list_contracts().await?))
}

async fn create_contract(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Json(req): Json<ContractInput>,
) -> Result<impl IntoResponse, ApiError> {
    let client = caller(&state, &headers).await?;
    let contract = client.create_contract(req).await?;
    Ok((StatusCode::CREATED, Json(contract)))
}

async fn update_contract(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Path(id): Path<Uuid>,
    Json(req): Json<ContractInput>,
) -> Result<Json<Contract>, ApiError> {
    let client = caller(&state, &headers).await?;
    Ok(Json(client.update_contract(id, req).await?))
}

async fn delete_contract(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Path(id): Path<Uuid>,
) -> Result<StatusCode, ApiError> {
    let client = caller(&state, &headers).await?;
    client.delete_contract(id).await?;
    Ok(StatusCode::NO_CONTENT)
}

// ── Handlers: quizzes ─────────────────────────────────────────────────

async fn list_quizzes(
    State(state): State<SharedState>,
    headers: HeaderMap,
) -> Result<Json<Vec<QuizSummary>>, ApiError> {
    let client = caller(&state, &headers).await?;
    Ok(Json(client.list_quizzes().await?))
}

async fn create_quiz(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Json(req): Json<CreateQuizRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let client = caller(&state, &headers).await?;
    let quiz = client.create_quiz(req.title, req.description).await?;
    Ok((StatusCode::CREATED, Json(quiz)))
}

async fn quiz_detail(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Path(id): Path<Uuid>,
) -> Result<Json<QuizDetail>, ApiError> {
    let client = caller(&state, &headers).await?;
    Ok(Json(client.quiz_detail(id).await?))
}

async fn update_quiz(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Path(id): Path<Uuid>,
    Json(req): Json<QuizUpdate>,
) -> Result<Json<Quiz>, ApiError> {
    let client = caller(&state, &headers).await?;
    Ok(Json(client.update_quiz(id, req).await?))
}

async fn delete_quiz(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Path(id): Path<Uuid>,
) -> Result<StatusCode, ApiError> {
    let client = caller(&state, &headers).await?;
    client.delete_quiz(id).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn add_question(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Path(quiz_id): Path<Uuid>,
    Json(req): Json<NewQuestion>,
) -> Result<impl IntoResponse, ApiError> {
    let client = caller(&state, &headers).await?;
    let question = client.add_question(quiz_id, req).await?;
    Ok((StatusCode::CREATED, Json(question)))
}

async fn reorder_questions(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Path(quiz_id): Path<Uuid>,
    Json(req): Json<ReorderRequest>,
) -> Result<Json<Vec<Question>>, ApiError> {
    let client = caller(&state, &headers).await?;
    Ok(Json(client.reorder_questions(quiz_id, req.order).await?))
}

async fn list_responses(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Path(quiz_id): Path<Uuid>,
) -> Result<Json<Vec<QuizResponse>>, ApiError> {
    let client = caller(&state, &headers).await?;
    Ok(Json(client.list_responses(quiz_id).await?))
}

async fn update_question(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Path(id): Path<Uuid>,
    Json(req): Json<QuestionUpdate>,
) -> Result<Json<Question>, ApiError> {
    let client = caller(&state, &headers).await?;
    Ok(Json(client.update_question(id, req).await?))
}

async fn delete_question(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Path(id): Path<Uuid>,
) -> Result<StatusCode, ApiError> {
    let client = caller(&state, &headers).await?;
    client.delete_question(id).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn add_option(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Path(question_id): Path<Uuid>,
    Json(req): Json<NewOption>,
) -> Result<impl IntoResponse, ApiError> {
    let client = caller(&state, &headers).await?;
    let option = client.add_option(question_id, req).await?;
    Ok((StatusCode::CREATED, Json(option)))
}

async fn update_option(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Path(id): Path<Uuid>,
    Json(req): Json<OptionUpdate>,
) -> Result<Json<QuizOption>, ApiError> {
    let client = caller(&state, &headers).await?;
    Ok(Json(client.update_option(id, req).await?))
}

async fn delete_option(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Path(id): Path<Uuid>,
) -> Result<StatusCode, ApiError> {
    let client = caller(&state, &headers).await?;
    client.delete_option(id).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn published_quiz(
    State(state): State<SharedState>,
    Path(id): Path<Uuid>,
) -> Result<Json<PublicQuiz>, ApiError> {
    Ok(Json(state.client.published_quiz(id).await?))
}

async fn submit_response(
    State(state): State<SharedState>,
    Path(id): Path<Uuid>,
    Json(req): Json<QuizSubmission>,
) -> Result<impl IntoResponse, ApiError> {
    if req.quiz_id != id {
        return Err(CrmError::Validation("Quiz id does not match the URL".into()).into());
    }
    let receipt = state.client.submit_response(req).await?;
    Ok((StatusCode::CREATED, Json(receipt)))
}

// ── Handlers: agency & membership ─────────────────────────────────────

async fn membership(
    State(state): State<SharedState>,
    headers: HeaderMap,
) -> Result<Json<Option<Membership>>, ApiError> {
    let client = caller(&state, &headers).await?;
    Ok(Json(client.membership().await?))
}

async fn create_agency(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Json(req): Json<AgencyNameRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let client = caller(&state, &headers).await?;
    let agency = client.create_agency(req.name).await?;
    Ok((StatusCode::CREATED, Json(agency)))
}

async fn get_agency(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Path(id): Path<Uuid>,
) -> Result<Json<Agency>, ApiError> {
    let client = caller(&state, &headers).await?;
    Ok(Json(client.agency(id).await?))
}

async fn update_agency_name(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Json(req): Json<AgencyNameRequest>,
) -> Result<Json<Agency>, ApiError> {
    let client = caller(&state, &headers).await?;
    Ok(Json(client.update_agency_name(req.name).await?))
}

async fn list_members(
    State(state): State<SharedState>,
    headers: HeaderMap,
) -> Result<Json<Vec<Member>>, ApiError> {
    let client = caller(&state, &headers).await?;
    Ok(Json(client.list_members().await?))
}

async fn add_member(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Json(req): Json<AddMemberRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let client = caller(&state, &headers).await?;
    let member = client.add_member(req.user_id, req.role).await?;
    Ok((StatusCode::CREATED, Json(member)))
}

async fn remove_member(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Path(id): Path<Uuid>,
) -> Result<StatusCode, ApiError> {
    let client = caller(&state, &headers).await?;
    client.remove_member(id).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn create_invitation(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Json(req): Json<InviteRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let client = caller(&state, &headers).await?;
    let invitation = client.create_invitation(req.email, req.role).await?;
    Ok((StatusCode::CREATED, Json(invitation)))
}

async fn invitation_details(
    State(state): State<SharedState>,
    Path(token): Path<Uuid>,
) -> Result<Json<InvitationDetails>, ApiError> {
    Ok(Json(state.client.invitation_details(token).await?))
}

async fn accept_invitation(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Path(token): Path<Uuid>,
) -> Result<Json<Member>, ApiError> {
    let client = caller(&state, &headers).await?;
    Ok(Json(client.accept_invitation(token).await?))
}

// ── Handlers: notifications & profile ─────────────────────────────────

async fn list_notifications(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Query(query): Query<LimitQuery>,
) -> Result<Json<Vec<Notification>>, ApiError> {
    let client = caller(&state, &headers).await?;
    let limit = query.limit.unwrap_or(DEFAULT_NOTIFICATION_LIMIT);
    Ok(Json(client.list_notifications(limit).await?))
}

async fn mark_read(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Json(req): Json<MarkReadRequest>,
) -> Result<StatusCode, ApiError> {
    let client = caller(&state, &headers).await?;
    client.mark_read(req.ids).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn mark_all_read(
    State(state): State<SharedState>,
    headers: HeaderMap,
) -> Result<StatusCode, ApiError> {
    let client = caller(&state, &headers).await?;
    client.mark_all_read().await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn get_profile(
    State(state): State<SharedState>,
    headers: HeaderMap,
) -> Result<Json<Option<Profile>>, ApiError> {
    let client = caller(&state, &headers).await?;
    Ok(Json(client.get_profile().await?))
}

async fn upsert_profile(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Json(req): Json<Profile>,
) -> Result<Json<Profile>, ApiError> {
    let client = caller(&state, &headers).await?;
    Ok(Json(client.upsert_profile(req).await?))
}

async fn update_theme(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Json(req): Json<ThemeRequest>,
) -> Result<Json<ThemeUpdated>, ApiError> {
    let client = caller(&state, &headers).await?;
    let updated = client.update_theme(req.theme_mode, req.theme_style).await?;
    Ok(Json(ThemeUpdated { updated }))
}

async fn current_user(
    State(state): State<SharedState>,
    headers: HeaderMap,
) -> Result<Json<AuthUser>, ApiError> {
    let client = caller(&state, &headers).await?;
    client
        .current_user()
        .await?
        .map(Json)
        .ok_or(ApiError(CrmError::Unauthorized))
}

// ── Checkout function ─────────────────────────────────────────────────

/// Every checkout failure is a 400 with `{ "error": message }`.
async fn checkout(State(state): State<SharedState>, headers: HeaderMap, body: Bytes) -> Response {
    let result = async {
        let user = match bearer_token(&headers) {
            Some(token) => state.auth.resolve(token).await?,
            None => None,
        };
        let user = user.ok_or(CheckoutError::UserNotFound)?;
        let request: CheckoutRequest = serde_json::from_slice(&body)
            .map_err(|e| CheckoutError::InvalidRequest(format!("Invalid request body: {}", e)))?;
        state.checkout.checkout(Some(&user), request).await
    }
    .await;

    match result {
        Ok(session) => (StatusCode::OK, Json(session)).into_response(),
        Err(err) => {
            tracing::warn!(error = %err, "checkout failed");
            (
                StatusCode::BAD_REQUEST,
                Json(serde_json::json!({"error": err.to_string()})),
            )
                .into_response()
        }
    }
}

async fn checkout_preflight() -> &'static str {
    "ok"
}

async fn health_check() -> &'static str {
    "ok"
}

// ── Tests ─────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crm::auth::DbTokenAuth;
    use crate::crm::db::CrmDb;
    use crate::crm::payments::DisabledProvider;
    use axum::body::Body;
    use axum::http::Request;
    use http_body_util::BodyExt;
    use tower::ServiceExt;

    struct TestApp {
        router: Router,
        feed: ChangeFeed,
        owner_token: String,
        staff_token: String,
        loner_token: String,
    }

    async fn test_app() -> TestApp {
        let db = DbHandle::new(CrmDb::new_in_memory().unwrap());
        let feed = ChangeFeed::new();
        let auth = DbTokenAuth::new(db.clone());
        let (owner, owner_token) = auth.register("owner@acme.test").await.unwrap();
        let (staff, staff_token) = auth.register("staff@acme.test").await.unwrap();
        let (_, loner_token) = auth.register("loner@else.test").await.unwrap();
        {
            let guard = db.lock_sync().unwrap();
            let (agency, _) = guard.create_agency("Acme", owner.id).unwrap();
            guard.add_member(agency.id, staff.id, Role::Staff).unwrap();
        }
        let checkout = CheckoutService::new(db.clone(), Arc::new(DisabledProvider));
        let state = Arc::new(AppState::new(db, feed.clone(), Arc::new(auth), checkout, "anon"));
        TestApp {
            router: api_router().with_state(state),
            feed,
            owner_token,
            staff_token,
            loner_token,
        }
    }

    fn request(method: &str, uri: &str, token: Option<&str>, body: Option<serde_json::Value>) -> Request<Body> {
        let mut builder = Request::builder().method(method).uri(uri);
        if let Some(token) = token {
            builder = builder.header("authorization", format!("Bearer {}", token));
        }
        match body {
            Some(json) => builder
                .header("content-type", "application/json")
                .body(Body::from(json.to_string()))
                .unwrap(),
            None => builder.body(Body::empty()).unwrap(),
        }
    }

    async fn body_json<T: serde::de::DeserializeOwned>(body: Body) -> T {
        let bytes = body.collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    // 1. Health check
    #[tokio::test]
    async fn test_health_check() {
        let app = test_app().await;
        let response = app.router.oneshot(request("GET", "/health", None, None)).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = response.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(&body[..], b"ok");
    }

    // 2. Anonymous and unknown callers
    #[tokio::test]
    async fn test_tenant_routes_require_identity() {
        let app = test_app().await;
        let response = app
            .router
            .clone()
            .oneshot(request("GET", "/rest/v1/deals", None, None))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        let body: serde_json::Value = body_json(response.into_body()).await;
        assert_eq!(body["code"], "unauthorized");

        let response = app
            .router
            .oneshot(request("GET", "/rest/v1/deals", Some("afk_bogus"), None))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    // 3. Create, move and delete a deal
    #[tokio::test]
    async fn test_deal_lifecycle() {
        let app = test_app().await;
        let token = Some(app.owner_token.as_str());

        let response = app
            .router
            .clone()
            .oneshot(request(
                "POST",
                "/rest/v1/deals",
                token,
                Some(serde_json::json!({"title": "Website", "value": 1200.0})),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CREATED);
        let deal: Deal = body_json(response.into_body()).await;
        assert_eq!(deal.stage, Stage::NewLeads);

        let response = app
            .router
            .clone()
            .oneshot(request(
                "PATCH",
                &format!("/rest/v1/deals/{}", deal.id),
                token,
                Some(serde_json::json!({"stage": "proposal"})),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let moved: Deal = body_json(response.into_body()).await;
        assert_eq!(moved.stage, Stage::Proposal);
        assert_eq!(moved.value, 1200.0);

        let response = app
            .router
            .clone()
            .oneshot(request("DELETE", &format!("/rest/v1/deals/{}", deal.id), token, None))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NO_CONTENT);

        let response = app
            .router
            .oneshot(request("GET", "/rest/v1/deals", token, None))
            .await
            .unwrap();
        let deals: Vec<DealWithContact> = body_json(response.into_body()).await;
        assert!(deals.is_empty());
    }

    // 4. Validation maps to 400
    #[tokio::test]
    async fn test_invalid_deal_is_bad_request() {
        let app = test_app().await;
        let response = app
            .router
            .oneshot(request(
                "POST",
                "/rest/v1/deals",
                Some(&app.owner_token),
                Some(serde_json::json!({"title": "", "value": 10.0})),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let body: serde_json::Value = body_json(response.into_body()).await;
        assert_eq!(body["code"], "validation");
        assert_eq!(body["error"], "Title is required");
    }

    // 5. Role checks map to 403
    #[tokio::test]
    async fn test_staff_cannot_rename_agency() {
        let app = test_app().await;
        let response = app
            .router
            .oneshot(request(
                "PUT",
                "/rest/v1/agency/name",
                Some(&app.staff_token),
                Some(serde_json::json!({"name": "Mine now"})),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
    }

    // 6. Membership is null for users without an agency
    #[tokio::test]
    async fn test_membership_null_without_agency() {
        let app = test_app().await;
        let response = app
            .router
            .oneshot(request("GET", "/rest/v1/membership", Some(&app.loner_token), None))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body: serde_json::Value = body_json(response.into_body()).await;
        assert!(body.is_null());
    }

    // 7. Public quiz flow end to end
    #[tokio::test]
    async fn test_public_quiz_submission() {
        let app = test_app().await;
        let token = Some(app.owner_token.as_str());

        let response = app
            .router
            .clone()
            .oneshot(request(
                "POST",
                "/rest/v1/quizzes",
                token,
                Some(serde_json::json!({"title": "Fit check"})),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CREATED);
        let quiz: Quiz = body_json(response.into_body()).await;

        let response = app
            .router
            .clone()
            .oneshot(request(
                "POST",
                &format!("/rest/v1/quizzes/{}/questions", quiz.id),
                token,
                Some(serde_json::json!({"text": "Budget?"})),
            ))
            .await
            .unwrap();
        let question: Question = body_json(response.into_body()).await;
        let response = app
            .router
            .clone()
            .oneshot(request(
                "POST",
                &format!("/rest/v1/questions/{}/options", question.id),
                token,
                Some(serde_json::json!({"text": "Large", "points": 70})),
            ))
            .await
            .unwrap();
        let option: QuizOption = body_json(response.into_body()).await;

        // unpublished quizzes are invisible
        let response = app
            .router
            .clone()
            .oneshot(request("GET", &format!("/rest/v1/public/quizzes/{}", quiz.id), None, None))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        app.router
            .clone()
            .oneshot(request(
                "PATCH",
                &format!("/rest/v1/quizzes/{}", quiz.id),
                token,
                Some(serde_json::json!({"is_published": true})),
            ))
            .await
            .unwrap();

        let response = app
            .router
            .clone()
            .oneshot(request("GET", &format!("/rest/v1/public/quizzes/{}", quiz.id), None, None))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let public: PublicQuiz = body_json(response.into_body()).await;
        assert_eq!(public.agency_name, "Acme");

        let mut rx = app.feed.subscribe();
        let submission = QuizSubmission {
            quiz_id: quiz.id,
            respondent: Respondent {
                name: "Ana".into(),
                email: "ana@x.test".into(),
                whatsapp: "+1".into(),
            },
            total_score: 70,
            answers: vec![SubmittedAnswer {
                question_id: question.id,
                option_id: Some(option.id),
                text_value: None,
            }],
        };
        let response = app
            .router
            .clone()
            .oneshot(request(
                "POST",
                &format!("/rest/v1/public/quizzes/{}/responses", quiz.id),
                None,
                Some(serde_json::to_value(&submission).unwrap()),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CREATED);

        let mut tables = Vec::new();
        while let Ok(event) = rx.try_recv() {
            tables.push(event.table);
        }
        assert!(tables.contains(&crate::crm::feed::Table::Notifications));

        let response = app
            .router
            .oneshot(request("GET", "/rest/v1/contacts", token, None))
            .await
            .unwrap();
        let contacts: Vec<Contact> = body_json(response.into_body()).await;
        assert_eq!(contacts.len(), 1);
        assert_eq!(contacts[0].status, LeadStatus::Hot);
    }

    // 8. Auth lookup
    #[tokio::test]
    async fn test_current_user() {
        let app = test_app().await;
        let response = app
            .router
            .clone()
            .oneshot(request("GET", "/auth/v1/user", Some(&app.owner_token), None))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let user: AuthUser = body_json(response.into_body()).await;
        assert_eq!(user.email, "owner@acme.test");

        let response = app
            .router
            .oneshot(request("GET", "/auth/v1/user", None, None))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    // 9. Checkout errors are always 400 with the wire message
    #[tokio::test]
    async fn test_checkout_error_contract() {
        let app = test_app().await;
        let body = serde_json::json!({"priceId": "price_pro", "returnUrl": "https://app.test/plans"});

        let cases = [
            (None, "User not found"),
            (Some(app.loner_token.as_str()), "User does not belong to an agency"),
            (Some(app.staff_token.as_str()), "Only the agency owner can subscribe"),
            (Some(app.owner_token.as_str()), "Payments are not configured"),
        ];
        for (token, expected) in cases {
            let response = app
                .router
                .clone()
                .oneshot(request("POST", "/functions/v1/checkout", token, Some(body.clone())))
                .await
                .unwrap();
            assert_eq!(response.status(), StatusCode::BAD_REQUEST);
            let json: serde_json::Value = body_json(response.into_body()).await;
            assert_eq!(json["error"], expected);
        }
    }

    // 10. Preflight
    #[tokio::test]
    async fn test_checkout_preflight() {
        let app = test_app().await;
        let response = app
            .router
            .oneshot(request("OPTIONS", "/functions/v1/checkout", None, None))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[test]
    fn test_bearer_token_parsing() {
        let mut headers = HeaderMap::new();
        assert_eq!(bearer_token(&headers), None);
        headers.insert(header::AUTHORIZATION, "Bearer abc".parse().unwrap());
        assert_eq!(bearer_token(&headers), Some("abc"));
        headers.insert(header::AUTHORIZATION, "bearer  xyz ".parse().unwrap());
        assert_eq!(bearer_token(&headers), Some("xyz"));
        headers.insert(header::AUTHORIZATION, "Basic abc".parse().unwrap());
        assert_eq!(bearer_token(&headers), None);
    }

    #[test]
    fn test_status_mapping() {
        assert_eq!(status_for(&CrmError::Validation("x".into())), StatusCode::BAD_REQUEST);
        assert_eq!(status_for(&CrmError::Unauthorized), StatusCode::UNAUTHORIZED);
        assert_eq!(status_for(&CrmError::Forbidden("x".into())), StatusCode::FORBIDDEN);
        assert_eq!(status_for(&CrmError::NotFound("x".into())), StatusCode::NOT_FOUND);
        assert_eq!(status_for(&CrmError::Conflict("x".into())), StatusCode::CONFLICT);
        assert_eq!(
            status_for(&CrmError::Configuration("x".into())),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            status_for(&CrmError::Database(anyhow::anyhow!("boom"))),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }
}
