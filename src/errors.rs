//! Typed error hierarchy for AgencyFlow.
//!
//! `CrmError` is the shared taxonomy every persistence call returns. The
//! component enums wrap it:
//! - `BoardError` — pipeline board drag/drop and deletion failures
//! - `QuizFlowError` — respondent wizard navigation and submission failures
//! - `CheckoutError` — checkout function failures (always reported as 400)

use thiserror::Error;

/// Errors returned by the persistence layer and its clients.
#[derive(Debug, Error)]
pub enum CrmError {
    /// Missing or placeholder backend credentials. The app stays navigable.
    #[error("Backend is not configured: {0}")]
    Configuration(String),

    #[error("Not authenticated")]
    Unauthorized,

    /// Rejected by a tenant or role check.
    #[error("Permission denied: {0}")]
    Forbidden(String),

    /// Client-side required-field checks; never reaches the network.
    #[error("{0}")]
    Validation(String),

    #[error("{0} not found")]
    NotFound(String),

    /// Uniqueness violations ("already a member", duplicate agency).
    #[error("{0}")]
    Conflict(String),

    /// Network or availability failures that may succeed on retry.
    #[error("Service unavailable: {0}")]
    Transient(String),

    #[error("Database error: {0}")]
    Database(#[source] anyhow::Error),

    #[error("Unexpected response ({status}): {message}")]
    Remote { status: u16, message: String },
}

impl CrmError {
    pub fn not_found(entity: &str, id: impl std::fmt::Display) -> Self {
        Self::NotFound(format!("{} {}", entity, id))
    }

    /// Stable machine-readable code used on the wire.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Configuration(_) => "configuration",
            Self::Unauthorized => "unauthorized",
            Self::Forbidden(_) => "forbidden",
            Self::Validation(_) => "validation",
            Self::NotFound(_) => "not_found",
            Self::Conflict(_) => "conflict",
            Self::Transient(_) => "transient",
            Self::Database(_) => "database",
            Self::Remote { .. } => "remote",
        }
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_))
    }

    /// Rebuild an error from the `{ "error", "code" }` body the service returns.
    pub fn from_wire(status: u16, code: Option<&str>, message: String) -> Self {
        match code {
            Some("configuration") => Self::Configuration(message),
            Some("unauthorized") => Self::Unauthorized,
            Some("forbidden") => Self::Forbidden(
                message
                    .strip_prefix("Permission denied: ")
                    .map(str::to_string)
                    .unwrap_or(message),
            ),
            Some("validation") => Self::Validation(message),
            Some("not_found") => Self::NotFound(
                message
                    .strip_suffix(" not found")
                    .map(str::to_string)
                    .unwrap_or(message),
            ),
            Some("conflict") => Self::Conflict(message),
            Some("transient") => Self::Transient(message),
            _ if status >= 500 => Self::Transient(message),
            _ => Self::Remote { status, message },
        }
    }
}

impl From<anyhow::Error> for CrmError {
    /// Recovers a typed error raised inside a storage closure, falling back
    /// to `Database` for everything else.
    fn from(err: anyhow::Error) -> Self {
        match err.downcast::<CrmError>() {
            Ok(typed) => typed,
            Err(other) => Self::Database(other),
        }
    }
}

/// Errors from the pipeline board.
#[derive(Debug, Error)]
pub enum BoardError {
    #[error("Deal {0} is not on the board")]
    DealNotFound(uuid::Uuid),

    #[error("Deal {0} is already being dragged")]
    DragInProgress(uuid::Uuid),

    #[error("No drag in progress")]
    NoActiveDrag,

    #[error("Deletion was not confirmed")]
    NotConfirmed,

    #[error(transparent)]
    Store(#[from] CrmError),
}

/// Errors from the quiz response wizard.
#[derive(Debug, Error)]
pub enum QuizFlowError {
    #[error("Please fill in every field before continuing")]
    Incomplete,

    #[error("Question {0} is not part of this quiz")]
    UnknownQuestion(uuid::Uuid),

    #[error("Option {option} does not belong to question {question}")]
    UnknownOption {
        question: uuid::Uuid,
        option: uuid::Uuid,
    },

    #[error("Cannot {action} in the {state} state")]
    InvalidState {
        action: &'static str,
        state: &'static str,
    },

    #[error(transparent)]
    Store(#[from] CrmError),
}

/// Errors from the checkout function.
#[derive(Debug, Error)]
pub enum CheckoutError {
    #[error("User not found")]
    UserNotFound,

    #[error("User does not belong to an agency")]
    NoAgency,

    #[error("Only the agency owner can subscribe")]
    NotOwner,

    #[error("{0}")]
    InvalidRequest(String),

    #[error("Payments are not configured")]
    NotConfigured,

    #[error("Payment provider error: {0}")]
    Provider(String),

    #[error(transparent)]
    Store(#[from] CrmError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn crm_error_codes_are_distinct() {
        let codes = [
            CrmError::Configuration("x".into()).code(),
            CrmError::Unauthorized.code(),
            CrmError::Forbidden("x".into()).code(),
            CrmError::Validation("x".into()).code(),
            CrmError::NotFound("x".into()).code(),
            CrmError::Conflict("x".into()).code(),
            CrmError::Transient("x".into()).code(),
        ];
        let unique: std::collections::HashSet<_> = codes.iter().collect();
        assert_eq!(unique.len(), codes.len());
    }

    #[test]
    fn from_wire_restores_variants() {
        let err = CrmError::from_wire(404, Some("not_found"), "Deal 42 not found".into());
        match &err {
            CrmError::NotFound(what) => assert_eq!(what, "Deal 42"),
            other => panic!("Expected NotFound, got {:?}", other),
        }
        assert_eq!(err.to_string(), "Deal 42 not found");

        let err = CrmError::from_wire(403, Some("forbidden"), "Permission denied: owner only".into());
        assert_eq!(err.to_string(), "Permission denied: owner only");

        assert!(CrmError::from_wire(502, None, "bad gateway".into()).is_transient());
        assert!(matches!(
            CrmError::from_wire(418, None, "teapot".into()),
            CrmError::Remote { status: 418, .. }
        ));
    }

    #[test]
    fn anyhow_downcast_recovers_typed_errors() {
        let wrapped = anyhow::Error::new(CrmError::Conflict("already a member".into()))
            .context("Failed to add member");
        match CrmError::from(wrapped) {
            CrmError::Conflict(msg) => assert_eq!(msg, "already a member"),
            other => panic!("Expected Conflict, got {:?}", other),
        }

        let plain = anyhow::anyhow!("disk full");
        assert!(matches!(CrmError::from(plain), CrmError::Database(_)));
    }

    #[test]
    fn board_error_converts_from_crm_error() {
        let err: BoardError = CrmError::Transient("timeout".into()).into();
        assert!(matches!(err, BoardError::Store(CrmError::Transient(_))));
    }

    #[test]
    fn checkout_error_messages_match_wire_contract() {
        assert_eq!(CheckoutError::UserNotFound.to_string(), "User not found");
        assert_eq!(
            CheckoutError::NoAgency.to_string(),
            "User does not belong to an agency"
        );
        assert_eq!(
            CheckoutError::NotOwner.to_string(),
            "Only the agency owner can subscribe"
        );
    }

    #[test]
    fn all_error_types_implement_std_error_trait() {
        fn assert_std_error<E: std::error::Error>(_: &E) {}
        assert_std_error(&CrmError::Unauthorized);
        assert_std_error(&BoardError::NoActiveDrag);
        assert_std_error(&QuizFlowError::Incomplete);
        assert_std_error(&CheckoutError::NotOwner);
    }
}
