use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::{
    Json, Router,
    extract::{Request, State},
    http::{HeaderName, Method, StatusCode, header},
    middleware::{self, Next},
    response::{IntoResponse, Response},
};
use tower_http::cors::{Any, CorsLayer};

use super::api::{self, AppState, SharedState};
use super::auth::DbTokenAuth;
use super::db::{CrmDb, DbHandle};
use super::feed::ChangeFeed;
use super::payments::{DisabledProvider, PaymentProvider, StripeProvider};
use super::realtime;
use crate::checkout::CheckoutService;

/// Header carrying the public anon key on every request.
pub const APIKEY_HEADER: &str = "apikey";

/// Configuration for the AgencyFlow service.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub db_path: PathBuf,
    pub anon_key: String,
    /// Payment provider secret. Checkout answers "not configured" without it.
    pub stripe_secret_key: Option<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 4173,
            db_path: PathBuf::from(".agencyflow/agencyflow.db"),
            anon_key: String::new(),
            stripe_secret_key: None,
        }
    }
}

/// Build the full application router: REST, realtime stream and checkout,
/// behind the apikey check and CORS.
pub fn build_router(state: SharedState) -> Router {
    api::api_router()
        .merge(realtime::realtime_router())
        .layer(middleware::from_fn_with_state(state.clone(), require_apikey))
        .layer(cors_layer())
        .with_state(state)
}

fn cors_layer() -> CorsLayer {
    CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([
            Method::GET,
            Method::POST,
            Method::PUT,
            Method::PATCH,
            Method::DELETE,
            Method::OPTIONS,
        ])
        .allow_headers([
            header::AUTHORIZATION,
            header::CONTENT_TYPE,
            HeaderName::from_static(APIKEY_HEADER),
            HeaderName::from_static("x-client-info"),
        ])
}

/// The anon key from the `apikey` header, or the `apikey` query parameter
/// for clients that cannot set headers on a stream.
fn presented_key(req: &Request) -> Option<&str> {
    if let Some(value) = req.headers().get(APIKEY_HEADER) {
        return value.to_str().ok();
    }
    req.uri()
        .query()?
        .split('&')
        .find_map(|pair| pair.strip_prefix("apikey="))
}

async fn require_apikey(State(state): State<SharedState>, req: Request, next: Next) -> Response {
    if req.method() == Method::OPTIONS || req.uri().path() == "/health" {
        return next.run(req).await;
    }
    if presented_key(&req) != Some(state.anon_key.as_str()) {
        tracing::debug!(path = %req.uri().path(), "rejected request without a valid apikey");
        return (
            StatusCode::UNAUTHORIZED,
            Json(serde_json::json!({"error": "Invalid API key", "code": "unauthorized"})),
        )
            .into_response();
    }
    next.run(req).await
}

/// Open the database and assemble shared state from a config.
pub fn build_state(config: &ServerConfig) -> Result<SharedState> {
    let db = CrmDb::new(&config.db_path).context("Failed to initialize AgencyFlow database")?;
    let db = DbHandle::new(db);
    let provider: Arc<dyn PaymentProvider> = match &config.stripe_secret_key {
        Some(key) => Arc::new(StripeProvider::new(key.clone())),
        None => {
            tracing::warn!("no payment provider key configured; checkout is disabled");
            Arc::new(DisabledProvider)
        }
    };
    let checkout = CheckoutService::new(db.clone(), provider);
    let auth = Arc::new(DbTokenAuth::new(db.clone()));
    Ok(Arc::new(AppState::new(
        db,
        ChangeFeed::new(),
        auth,
        checkout,
        config.anon_key.clone(),
    )))
}

/// Start the service and run until Ctrl+C.
pub async fn start_server(config: ServerConfig) -> Result<()> {
    if config.anon_key.is_empty() {
        anyhow::bail!("An anon key is required to start the server");
    }
    let state = build_state(&config)?;
    let app = build_router(state);

    let addr = format!("{}:{}", config.host, config.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind to {}", addr))?;

    let local_addr = listener.local_addr()?;
    tracing::info!(addr = %local_addr, db = %config.db_path.display(), "AgencyFlow listening");
    println!("AgencyFlow running at http://{}", local_addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;

    tracing::info!("server shut down gracefully");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "failed to listen for Ctrl+C");
        std::future::pending::<()>().await;
    }
    tracing::info!("shutting down");
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use http_body_util::BodyExt;
    use tower::ServiceExt;

    fn test_router() -> (Router, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let config = ServerConfig {
            db_path: dir.path().join("crm.db"),
            anon_key: "anon-test".into(),
            ..Default::default()
        };
        (build_router(build_state(&config).unwrap()), dir)
    }

    #[tokio::test]
    async fn test_health_needs_no_key() {
        let (app, _dir) = test_router();
        let req = Request::builder().uri("/health").body(Body::empty()).unwrap();
        let resp = app.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_missing_or_wrong_key_is_rejected() {
        let (app, _dir) = test_router();
        for key in [None, Some("wrong")] {
            let mut builder = Request::builder().uri("/rest/v1/deals");
            if let Some(key) = key {
                builder = builder.header(APIKEY_HEADER, key);
            }
            let resp = app.clone().oneshot(builder.body(Body::empty()).unwrap()).await.unwrap();
            assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
            let body = resp.into_body().collect().await.unwrap().to_bytes();
            let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
            assert_eq!(json["error"], "Invalid API key");
        }
    }

    #[tokio::test]
    async fn test_key_passes_through_to_routes() {
        let (app, _dir) = test_router();
        let req = Request::builder()
            .uri("/rest/v1/membership")
            .header(APIKEY_HEADER, "anon-test")
            .body(Body::empty())
            .unwrap();
        let resp = app.oneshot(req).await.unwrap();
        // anonymous callers have no membership
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_key_accepted_in_query() {
        let (app, _dir) = test_router();
        let req = Request::builder()
            .uri("/rest/v1/membership?apikey=anon-test")
            .body(Body::empty())
            .unwrap();
        let resp = app.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_cors_preflight_answered() {
        let (app, _dir) = test_router();
        let req = Request::builder()
            .method("OPTIONS")
            .uri("/functions/v1/checkout")
            .header("origin", "https://app.example")
            .header("access-control-request-method", "POST")
            .header("access-control-request-headers", "authorization,apikey,content-type")
            .body(Body::empty())
            .unwrap();
        let resp = app.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(resp.headers()["access-control-allow-origin"], "*");
    }

    #[tokio::test]
    async fn test_start_server_requires_anon_key() {
        let err = start_server(ServerConfig::default()).await.unwrap_err();
        assert!(err.to_string().contains("anon key"));
    }
}
