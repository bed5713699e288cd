//! Error taxonomy.
//!
//! Every fallible path in the server funnels into [`ServerError`]; the
//! variant decides the wire error code at the WS boundary and the status
//! code at the HTTP boundary.  Internal and database errors are logged with
//! context and surfaced to clients with an opaque message.

use arena_protocol::error_codes;
use axum::http::StatusCode;

#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("{0}")]
    InvalidInput(String),
    #[error("{0}")]
    Unauthenticated(String),
    #[error("{0}")]
    PermissionDenied(String),
    #[error("{0}")]
    NotFound(String),
    #[error("{0}")]
    FailedPrecondition(String),
    #[error("{0}")]
    AlreadyExists(String),
    #[error("{0}")]
    ResourceExhausted(String),
    #[error("{0}")]
    Unavailable(String),
    #[error("database error: {0}")]
    Db(#[from] sqlx::Error),
    #[error("internal error: {0}")]
    Internal(String),
}

impl ServerError {
    pub fn invalid_input(message: impl Into<String>) -> Self {
        Self::InvalidInput(message.into())
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal(message.into())
    }

    /// Wire error code for this kind.
    pub fn code(&self) -> &'static str {
        match self {
            Self::InvalidInput(_) => error_codes::INVALID_INPUT,
            Self::Unauthenticated(_) => error_codes::UNAUTHENTICATED,
            Self::PermissionDenied(_) => error_codes::PERMISSION_DENIED,
            Self::NotFound(_) => error_codes::NOT_FOUND,
            Self::FailedPrecondition(_) => error_codes::FAILED_PRECONDITION,
            Self::AlreadyExists(_) => error_codes::ALREADY_EXISTS,
            Self::ResourceExhausted(_) => error_codes::RESOURCE_EXHAUSTED,
            Self::Unavailable(_) => error_codes::UNAVAILABLE,
            Self::Db(_) | Self::Internal(_) => error_codes::INTERNAL,
        }
    }

    pub fn http_status(&self) -> StatusCode {
        match self {
            Self::InvalidInput(_) => StatusCode::BAD_REQUEST,
            Self::Unauthenticated(_) => StatusCode::UNAUTHORIZED,
            Self::PermissionDenied(_) => StatusCode::FORBIDDEN,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::FailedPrecondition(_) => StatusCode::PRECONDITION_FAILED,
            Self::AlreadyExists(_) => StatusCode::CONFLICT,
            Self::ResourceExhausted(_) => StatusCode::TOO_MANY_REQUESTS,
            Self::Unavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            Self::Db(_) | Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Message safe to show to a client.  Internal detail stays in the logs.
    pub fn client_message(&self) -> String {
        match self {
            Self::Db(_) | Self::Internal(_) => "an internal error occurred".to_owned(),
            other => other.to_string(),
        }
    }
}

impl From<crate::db::TxError> for ServerError {
    fn from(err: crate::db::TxError) -> Self {
        match err {
            crate::db::TxError::Db(db) => Self::Db(db),
            crate::db::TxError::TxnRestart(_) => {
                Self::Unavailable("transaction restart required".to_owned())
            }
            crate::db::TxError::AmbiguousCommit(db) => {
                Self::Internal(format!("ambiguous commit: {db}"))
            }
        }
    }
}

pub type ServerResult<T> = Result<T, ServerError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_map_one_to_one() {
        assert_eq!(
            ServerError::invalid_input("bad").code(),
            error_codes::INVALID_INPUT
        );
        assert_eq!(
            ServerError::PermissionDenied("no".to_owned()).code(),
            error_codes::PERMISSION_DENIED
        );
        assert_eq!(
            ServerError::internal("boom").code(),
            error_codes::INTERNAL
        );
    }

    #[test]
    fn internal_detail_is_not_shown_to_clients() {
        let err = ServerError::internal("connection refused to 10.0.0.5");
        assert_eq!(err.client_message(), "an internal error occurred");
        let err = ServerError::NotFound("leaderboard not found".to_owned());
        assert_eq!(err.client_message(), "leaderboard not found");
    }
}
