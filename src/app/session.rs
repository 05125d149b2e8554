//! Route guard session check.

use std::time::Duration;

use crate::client::AgencyStore;
use crate::crm::models::AuthUser;

pub const SESSION_CHECK_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionState {
    Authenticated(AuthUser),
    Anonymous,
}

impl SessionState {
    pub fn user(&self) -> Option<&AuthUser> {
        match self {
            Self::Authenticated(user) => Some(user),
            Self::Anonymous => None,
        }
    }
}

/// Resolve the current user. A check that errors or outlives `timeout`
/// counts as no session.
pub async fn check_session<C: AgencyStore>(client: &C, timeout: Duration) -> SessionState {
    match tokio::time::timeout(timeout, client.current_user()).await {
        Ok(Ok(Some(user))) => SessionState::Authenticated(user),
        Ok(Ok(None)) => SessionState::Anonymous,
        Ok(Err(e)) => {
            tracing::warn!(error = %e, "session check failed");
            SessionState::Anonymous
        }
        Err(_) => {
            tracing::warn!(timeout_ms = timeout.as_millis() as u64, "session check timed out");
            SessionState::Anonymous
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::RemoteClient;
    use crate::client::local::tests::seeded;
    use crate::crm::models::{
        Agency, Invitation, InvitationDetails, Member, Membership, Role,
    };
    use crate::errors::CrmError;
    use async_trait::async_trait;
    use uuid::Uuid;

    #[tokio::test]
    async fn test_resolves_user_or_anonymous() {
        let (anon, owner, user) = seeded();
        assert_eq!(
            check_session(&owner, SESSION_CHECK_TIMEOUT).await,
            SessionState::Authenticated(user)
        );
        assert_eq!(check_session(&anon, SESSION_CHECK_TIMEOUT).await, SessionState::Anonymous);
    }

    #[tokio::test]
    async fn test_disabled_backend_is_anonymous() {
        let client = RemoteClient::disabled("AGENCYFLOW_URL is not set");
        assert_eq!(check_session(&client, SESSION_CHECK_TIMEOUT).await, SessionState::Anonymous);
    }

    /// Never answers.
    struct Hanging;

    #[async_trait]
    impl AgencyStore for Hanging {
        async fn current_user(&self) -> Result<Option<AuthUser>, CrmError> {
            std::future::pending().await
        }
        async fn membership(&self) -> Result<Option<Membership>, CrmError> {
            std::future::pending().await
        }
        async fn agency(&self, _id: Uuid) -> Result<Agency, CrmError> {
            std::future::pending().await
        }
        async fn list_members(&self) -> Result<Vec<Member>, CrmError> {
            std::future::pending().await
        }
        async fn create_agency(&self, _name: String) -> Result<Agency, CrmError> {
            std::future::pending().await
        }
        async fn update_agency_name(&self, _name: String) -> Result<Agency, CrmError> {
            std::future::pending().await
        }
        async fn add_member(&self, _user_id: Uuid, _role: Role) -> Result<Member, CrmError> {
            std::future::pending().await
        }
        async fn remove_member(&self, _member_id: Uuid) -> Result<(), CrmError> {
            std::future::pending().await
        }
        async fn create_invitation(&self, _email: String, _role: Role) -> Result<Invitation, CrmError> {
            std::future::pending().await
        }
        async fn invitation_details(&self, _token: Uuid) -> Result<InvitationDetails, CrmError> {
            std::future::pending().await
        }
        async fn accept_invitation(&self, _token: Uuid) -> Result<Member, CrmError> {
            std::future::pending().await
        }
    }

    #[tokio::test]
    async fn test_timeout_means_anonymous() {
        let state = check_session(&Hanging, Duration::from_millis(50)).await;
        assert_eq!(state, SessionState::Anonymous);
        assert!(state.user().is_none());
    }
}
