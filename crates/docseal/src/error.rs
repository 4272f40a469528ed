use axum::http::StatusCode;
use axum_core::response::{IntoResponse as AxumCoreIntoResponse, Response};
use eyre::Report;
use uuid::Uuid;

use crate::model::RequestStatus;

#[derive(Debug, thiserror::Error)]
pub enum SealError {
    #[error(transparent)]
    Unexpected(#[from] Report),
    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: String },
    #[error("Validation failed: {0}")]
    Validation(String),
    #[error("Stamp {0} is inactive")]
    InactiveStamp(Uuid),
    #[error("Missing caller identity: {0}")]
    Unauthenticated(String),
    #[error("Permission denied: {0}")]
    PermissionDenied(String),
    #[error("Conflict: {0}")]
    Conflict(String),
    #[error("Invalid state transition: {0}")]
    State(String),
    #[error("Signature request {id} is not pending (status {status})")]
    NotPending { id: Uuid, status: RequestStatus },
    #[error("Signature request {0} has expired")]
    AlreadyExpired(Uuid),
    #[error("Document version {0} already has a signed request; revoke it before requesting again")]
    AlreadySigned(Uuid),
    #[error("Stamp composition failed: {0}")]
    Composition(String),
    #[error("Signing key is not loaded")]
    KeyUnavailable,
    #[error("External I/O failed: {0}")]
    ExternalIo(String),
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),
}

impl SealError {
    pub fn not_found(kind: &'static str, id: impl ToString) -> Self {
        Self::NotFound {
            kind,
            id: id.to_string(),
        }
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            SealError::NotFound { .. } => StatusCode::NOT_FOUND,
            SealError::Validation(_)
            | SealError::InactiveStamp(_)
            | SealError::Composition(_) => StatusCode::UNPROCESSABLE_ENTITY,
            SealError::Unauthenticated(_) => StatusCode::UNAUTHORIZED,
            SealError::PermissionDenied(_) => StatusCode::FORBIDDEN,
            SealError::Conflict(_)
            | SealError::AlreadySigned(_)
            | SealError::State(_)
            | SealError::NotPending { .. }
            | SealError::AlreadyExpired(_) => StatusCode::CONFLICT,
            SealError::ExternalIo(_) => StatusCode::BAD_GATEWAY,
            SealError::Unexpected(_) | SealError::KeyUnavailable | SealError::Database(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }
}

/// Trait implementation to convert this error into an axum http response
impl AxumCoreIntoResponse for SealError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status == StatusCode::INTERNAL_SERVER_ERROR {
            tracing::error!(error = %self, "request failed");
            return (status, "Something wrong happened.").into_response();
        }
        (status, self.to_string()).into_response()
    }
}
