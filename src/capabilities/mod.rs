//! External collaborators of the sync engine: the backend, the credential
//! source and the reachability probe. Each sits behind a trait so the
//! orchestrator can be driven by fakes in tests.

pub mod http;
pub mod network;

use async_trait::async_trait;
use bytes::Bytes;
use secrecy::SecretString;
use thiserror::Error;

use crate::model::{Trip, TripDraft, TripId, TripPatch};

pub use self::http::{HttpRemoteApi, ValidatedUrl};
pub use self::network::{HttpProbe, ManualProbe};

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ApiError {
    #[error("network unreachable: {0}")]
    NetworkUnreachable(String),

    #[error("server rejected request ({status}): {message}")]
    ServerRejected { status: u16, message: String },

    #[error("authentication required")]
    AuthRequired,

    #[error("invalid response: {0}")]
    InvalidResponse(String),

    #[error("invalid URL '{url}': {reason}")]
    InvalidUrl { url: String, reason: String },

    #[error("invalid payload: {0}")]
    InvalidPayload(String),
}

impl ApiError {
    /// The request never produced an HTTP response.
    pub fn is_network(&self) -> bool {
        matches!(self, ApiError::NetworkUnreachable(_))
    }

    /// Whether replaying the same request later could succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            ApiError::NetworkUnreachable(_) => true,
            ApiError::ServerRejected { status, .. } => {
                matches!(status, 408 | 425 | 429) || *status >= 500
            }
            ApiError::AuthRequired => true,
            ApiError::InvalidResponse(_) => true,
            ApiError::InvalidUrl { .. } | ApiError::InvalidPayload(_) => false,
        }
    }

    pub fn status(&self) -> Option<u16> {
        match self {
            ApiError::ServerRejected { status, .. } => Some(*status),
            ApiError::AuthRequired => Some(401),
            _ => None,
        }
    }
}

/// An image to send to `POST /uploads`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageUpload {
    pub file_name: String,
    pub data: Bytes,
}

impl ImageUpload {
    /// Name the upload after the last segment of the picker's uri.
    pub fn from_uri(uri: &str, data: impl Into<Bytes>) -> Self {
        let file_name = uri
            .rsplit('/')
            .next()
            .filter(|name| !name.is_empty())
            .unwrap_or("photo.jpg")
            .to_string();
        Self {
            file_name,
            data: data.into(),
        }
    }

    /// `image/<ext>`, or `image/jpeg` when the name carries no extension.
    pub fn content_type(&self) -> String {
        match self.file_name.rsplit_once('.') {
            Some((_, ext))
                if !ext.is_empty() && ext.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') =>
            {
                format!("image/{}", ext.to_ascii_lowercase())
            }
            _ => "image/jpeg".to_string(),
        }
    }
}

/// Single-attempt transport to the trips backend. Implementations never retry.
#[async_trait]
pub trait RemoteApi: Send + Sync {
    async fn list_trips(&self) -> Result<Vec<Trip>, ApiError>;

    async fn create_trip(&self, draft: &TripDraft) -> Result<Trip, ApiError>;

    async fn update_trip(&self, id: &TripId, patch: &TripPatch) -> Result<Trip, ApiError>;

    async fn delete_trip(&self, id: &TripId) -> Result<(), ApiError>;

    /// Returns the public URL of the stored image.
    async fn upload_image(&self, image: ImageUpload) -> Result<String, ApiError>;

    async fn get_trip(&self, id: &TripId) -> Result<Option<Trip>, ApiError> {
        let trips = self.list_trips().await?;
        Ok(trips.into_iter().find(|trip| &trip.id == id))
    }
}

/// Source of the bearer credential. `None` means the user must log in again.
#[async_trait]
pub trait CredentialProvider: Send + Sync {
    async fn bearer_token(&self) -> Option<SecretString>;
}

/// Fixed credential, for tests and embedders that manage tokens themselves.
#[derive(Clone, Default)]
pub struct StaticCredentials {
    token: Option<String>,
}

impl StaticCredentials {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: Some(token.into()),
        }
    }

    pub fn none() -> Self {
        Self { token: None }
    }
}

impl std::fmt::Debug for StaticCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StaticCredentials")
            .field("token", &self.token.as_ref().map(|_| "[REDACTED]"))
            .finish()
    }
}

#[async_trait]
impl CredentialProvider for StaticCredentials {
    async fn bearer_token(&self) -> Option<SecretString> {
        self.token.clone().map(SecretString::new)
    }
}

/// Point-in-time reachability check. Errors count as offline.
#[async_trait]
pub trait ReachabilityProbe: Send + Sync {
    async fn probe(&self) -> Result<bool, ApiError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn upload_name_and_type_follow_the_uri() {
        let image = ImageUpload::from_uri("file:///cache/ImagePicker/IMG_01.PNG", vec![1u8, 2]);
        assert_eq!(image.file_name, "IMG_01.PNG");
        assert_eq!(image.content_type(), "image/png");

        let bare = ImageUpload::from_uri("content://media/1234", Bytes::new());
        assert_eq!(bare.file_name, "1234");
        assert_eq!(bare.content_type(), "image/jpeg");

        let trailing = ImageUpload::from_uri("file:///dir/", Bytes::new());
        assert_eq!(trailing.file_name, "photo.jpg");
    }

    #[test]
    fn classification() {
        assert!(ApiError::NetworkUnreachable("dns".into()).is_network());
        assert!(!ApiError::AuthRequired.is_network());

        let bad_request = ApiError::ServerRejected {
            status: 400,
            message: "title required".into(),
        };
        assert!(!bad_request.is_retryable());
        assert_eq!(bad_request.status(), Some(400));

        let unavailable = ApiError::ServerRejected {
            status: 503,
            message: "maintenance".into(),
        };
        assert!(unavailable.is_retryable());
    }

    #[tokio::test]
    async fn static_credentials() {
        use secrecy::ExposeSecret;

        let token = StaticCredentials::new("abc").bearer_token().await.unwrap();
        assert_eq!(token.expose_secret(), "abc");
        assert!(StaticCredentials::none().bearer_token().await.is_none());
    }
}
