use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;
use tracing::{error, warn};
use uuid::Uuid;

use crate::{models::Rejection, store::StoreError};

#[derive(Error, Debug)]
pub enum LedgerError {
    #[error("{0}")]
    Validation(String),

    #[error("{0} {1} not found")]
    NotFound(&'static str, Uuid),

    #[error("store temporarily unavailable: {0}")]
    Transient(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl LedgerError {
    pub fn validation(message: impl Into<String>) -> Self {
        LedgerError::Validation(message.into())
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, LedgerError::Transient(_))
    }
}

impl From<StoreError> for LedgerError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Transient(reason) => LedgerError::Transient(reason),
            StoreError::Backend(reason) => LedgerError::Internal(reason),
        }
    }
}

#[derive(Error, Debug)]
pub enum AppError {
    #[error(transparent)]
    Ledger(#[from] LedgerError),

    #[error("{}", .0.message())]
    Rejected(Rejection),
}

impl AppError {
    pub fn status(&self) -> StatusCode {
        match self {
            AppError::Ledger(LedgerError::Validation(_)) => StatusCode::BAD_REQUEST,
            AppError::Ledger(LedgerError::NotFound(..)) => StatusCode::NOT_FOUND,
            AppError::Ledger(LedgerError::Transient(_)) => StatusCode::SERVICE_UNAVAILABLE,
            AppError::Ledger(LedgerError::Internal(_)) => StatusCode::INTERNAL_SERVER_ERROR,
            AppError::Rejected(_) => StatusCode::CONFLICT,
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            AppError::Ledger(LedgerError::Validation(_)) => "ValidationError",
            AppError::Ledger(LedgerError::NotFound(..)) => "NotFound",
            AppError::Ledger(LedgerError::Transient(_)) => "TransientStoreError",
            AppError::Ledger(LedgerError::Internal(_)) => "InternalError",
            AppError::Rejected(rejection) => rejection.code(),
        }
    }

    fn public_message(&self) -> String {
        match self {
            AppError::Ledger(LedgerError::Transient(reason)) => {
                warn!("Transient store failure: {reason}");
                "The service is temporarily unavailable, please retry".to_string()
            }
            AppError::Ledger(LedgerError::Internal(reason)) => {
                error!("Internal failure: {reason}");
                "Internal server error".to_string()
            }
            other => other.to_string(),
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status();
        let body = json!({
            "error": self.public_message(),
            "code": self.code(),
        });

        (status, Json(body)).into_response()
    }
}

/// Failures while bringing the service up.
#[derive(Error, Debug)]
pub enum BootstrapError {
    #[error("database connection failed: {0}")]
    Database(#[from] sqlx::Error),

    #[error("database migration failed: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn statuses_follow_error_taxonomy() {
        let cases = [
            (AppError::from(LedgerError::validation("bad")), 400, "ValidationError"),
            (AppError::from(LedgerError::NotFound("poll", Uuid::nil())), 404, "NotFound"),
            (AppError::from(LedgerError::Transient("down".into())), 503, "TransientStoreError"),
            (AppError::from(LedgerError::Internal("boom".into())), 500, "InternalError"),
            (AppError::Rejected(Rejection::DuplicateVote), 409, "DuplicateVote"),
            (AppError::Rejected(Rejection::PollClosed), 409, "PollClosed"),
        ];

        for (err, status, code) in cases {
            assert_eq!(err.status().as_u16(), status);
            assert_eq!(err.code(), code);
        }
    }

    #[test]
    fn internal_details_are_not_exposed() {
        let err = AppError::from(LedgerError::Internal("relation \"votes\" missing".into()));
        assert_eq!(err.public_message(), "Internal server error");

        let err = AppError::from(LedgerError::Transient("pool timed out".into()));
        assert!(!err.public_message().contains("pool"));
    }

    #[test]
    fn store_errors_keep_their_retry_class() {
        assert!(LedgerError::from(StoreError::Transient("io".into())).is_transient());
        assert!(!LedgerError::from(StoreError::Backend("syntax".into())).is_transient());
    }
}
