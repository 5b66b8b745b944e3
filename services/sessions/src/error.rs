use crate::blob_store::BlobError;
use crate::session_store::StoreError;
use thiserror::Error;
use tracing::error;

/// Error kinds surfaced by the session service.
///
/// Callers branch on the variant: `Validation` and `InvalidArgument` are the
/// client's fault, `NotFound` means a referenced entity is absent and
/// `Internal` covers store outages and anything unexpected.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ServiceError {
    #[error("{0}")]
    Validation(String),

    #[error("{0}")]
    NotFound(String),

    #[error("{0}")]
    InvalidArgument(String),

    #[error("{0}")]
    Internal(String),
}

impl ServiceError {
    /// Stable machine-readable code for API responses
    pub fn code(&self) -> &'static str {
        match self {
            ServiceError::Validation(_) => "VALIDATION_ERROR",
            ServiceError::NotFound(_) => "NOT_FOUND",
            ServiceError::InvalidArgument(_) => "INVALID_ARGUMENT",
            ServiceError::Internal(_) => "INTERNAL_ERROR",
        }
    }

    pub fn validation(message: impl Into<String>) -> Self {
        ServiceError::Validation(message.into())
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        ServiceError::NotFound(message.into())
    }

    pub fn internal(message: impl Into<String>) -> Self {
        ServiceError::Internal(message.into())
    }
}

impl From<StoreError> for ServiceError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound(_) => ServiceError::not_found("Session not found"),
            StoreError::Database(e) => {
                error!(error = %e, "Session store failure");
                ServiceError::internal("Session store unavailable")
            }
        }
    }
}

impl From<BlobError> for ServiceError {
    fn from(err: BlobError) -> Self {
        match err {
            BlobError::NotFound(_) => ServiceError::not_found("Video file not found in storage"),
            BlobError::Backend(message) => {
                error!(error = %message, "Blob store failure");
                ServiceError::internal("Video storage unavailable")
            }
        }
    }
}
