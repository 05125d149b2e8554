//! Bearer-token identity.
//!
//! Sessions and sign-up are handled elsewhere; the service only needs to map
//! an access token to a user. Tokens are stored as SHA-256 digests.

use async_trait::async_trait;
use sha2::{Digest, Sha256};
use uuid::Uuid;

use super::db::DbHandle;
use super::models::AuthUser;
use crate::errors::CrmError;

/// Prefix of tokens minted by [`issue_token`].
pub const TOKEN_PREFIX: &str = "afk_";

/// Prefix of public API keys minted by [`issue_anon_key`].
pub const ANON_KEY_PREFIX: &str = "afa_";

#[async_trait]
pub trait AuthProvider: Send + Sync {
    /// Resolve a bearer token. `Ok(None)` for unknown tokens.
    async fn resolve(&self, token: &str) -> Result<Option<AuthUser>, CrmError>;
}

pub fn hash_token(token: &str) -> String {
    hex::encode(Sha256::digest(token.as_bytes()))
}

/// Mint a fresh random access token.
pub fn issue_token() -> String {
    format!(
        "{}{}{}",
        TOKEN_PREFIX,
        Uuid::new_v4().simple(),
        Uuid::new_v4().simple()
    )
}

/// Mint a public API key for a new installation.
pub fn issue_anon_key() -> String {
    format!("{}{}", ANON_KEY_PREFIX, Uuid::new_v4().simple())
}

/// Token lookup against the `auth_users` table.
#[derive(Clone)]
pub struct DbTokenAuth {
    db: DbHandle,
}

impl DbTokenAuth {
    pub fn new(db: DbHandle) -> Self {
        Self { db }
    }

    /// Register a user and return it with its plaintext token. The token is
    /// not recoverable afterwards.
    pub async fn register(&self, email: &str) -> Result<(AuthUser, String), CrmError> {
        let email = email.trim().to_lowercase();
        if email.is_empty() {
            return Err(CrmError::Validation("Email is required".into()));
        }
        let token = issue_token();
        let digest = hash_token(&token);
        let user = self
            .db
            .call(move |db| db.create_auth_user(&email, &digest))
            .await?;
        tracing::info!(user_id = %user.id, "registered user");
        Ok((user, token))
    }
}

#[async_trait]
impl AuthProvider for DbTokenAuth {
    async fn resolve(&self, token: &str) -> Result<Option<AuthUser>, CrmError> {
        let token = token.trim();
        if token.is_empty() {
            return Ok(None);
        }
        let digest = hash_token(token);
        self.db
            .call(move |db| db.auth_user_by_token_hash(&digest))
            .await
    }
}
