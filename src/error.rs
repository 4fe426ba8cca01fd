use thiserror::Error;

use crate::capabilities::ApiError;
use crate::model::ValidationError;
use crate::offline_store::StoreError;
use crate::outbox::OutboxError;

/// Errors surfaced to callers of the sync engine.
///
/// Transport failures are folded into the first four variants so the UI
/// layer can branch on them without knowing about the adapter.
#[derive(Debug, Error)]
pub enum SyncError {
    #[error("network unreachable: {0}")]
    NetworkUnreachable(String),

    #[error("server rejected request ({status}): {message}")]
    ServerRejected { status: u16, message: String },

    #[error("authentication required")]
    AuthRequired,

    #[error("local storage corrupt: {0}")]
    StorageCorrupt(String),

    #[error("queue error: {0}")]
    Queue(#[from] OutboxError),

    #[error("cache error: {0}")]
    Store(#[from] StoreError),

    #[error("api error: {0}")]
    Api(ApiError),

    #[error("validation error: {0}")]
    Validation(String),

    #[error("unknown trip: {0}")]
    UnknownTrip(String),
}

impl SyncError {
    pub fn is_network(&self) -> bool {
        matches!(self, SyncError::NetworkUnreachable(_))
    }
}

impl From<ApiError> for SyncError {
    fn from(e: ApiError) -> Self {
        match e {
            ApiError::NetworkUnreachable(msg) => SyncError::NetworkUnreachable(msg),
            ApiError::ServerRejected { status, message } => {
                SyncError::ServerRejected { status, message }
            }
            ApiError::AuthRequired => SyncError::AuthRequired,
            other => SyncError::Api(other),
        }
    }
}

impl From<ValidationError> for SyncError {
    fn from(e: ValidationError) -> Self {
        SyncError::Validation(e.to_string())
    }
}
