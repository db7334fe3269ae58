//! Error types shared across the sync engine.

use thiserror::Error;

use crate::domain::LifecycleError;
use crate::ingest::PendingQueueError;

/// Result type alias for sync engine operations.
pub type Result<T> = std::result::Result<T, SyncError>;

/// Errors surfaced by the sync engine and its collaborators.
#[derive(Debug, Error)]
pub enum SyncError {
    /// No connectivity, timeouts, refused connections
    #[error("Network unavailable: {0}")]
    NetworkUnavailable(String),

    /// Session expired or the record belongs to someone else
    #[error("Unauthorized")]
    Unauthorized,

    #[error("Not found")]
    NotFound,

    #[error("Server error ({0})")]
    ServerError(u16),

    /// A single protected field could not be decrypted
    #[error("Decryption failed: {0}")]
    DecryptionFailed(String),

    /// Caller asked for something that cannot be done (bad index, missing audio)
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error(transparent)]
    Lifecycle(#[from] LifecycleError),

    #[error(transparent)]
    Queue(#[from] PendingQueueError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Malformed payload: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The reconciler task has shut down
    #[error("Timeline reconciler is not running")]
    ReconcilerClosed,

    #[error("{0}")]
    Unknown(String),
}

impl SyncError {
    /// Map an HTTP status to the taxonomy
    pub fn from_status(status: u16, body: impl Into<String>) -> Self {
        match status {
            401 | 403 => Self::Unauthorized,
            404 => Self::NotFound,
            408 | 429 | 500..=599 => Self::ServerError(status),
            _ => {
                let body = body.into();
                if body.is_empty() {
                    Self::ServerError(status)
                } else {
                    Self::Unknown(format!("HTTP {}: {}", status, body))
                }
            }
        }
    }

    pub fn unknown(message: impl Into<String>) -> Self {
        Self::Unknown(message.into())
    }

    pub fn invalid_request(message: impl Into<String>) -> Self {
        Self::InvalidRequest(message.into())
    }

    /// Whether trying the same call again may succeed
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::NetworkUnavailable(_) | Self::ServerError(_))
    }

    /// Message suitable for showing to the user
    pub fn user_message(&self) -> String {
        match self {
            Self::NetworkUnavailable(_) => {
                "Unable to connect. Please check your internet connection.".to_string()
            }
            Self::Unauthorized => "Your session has expired. Please sign in again.".to_string(),
            Self::NotFound => "The requested content was not found.".to_string(),
            Self::ServerError(code) => format!("Server error ({}). Please try again later.", code),
            Self::DecryptionFailed(_) => "Some content could not be decrypted.".to_string(),
            Self::Unknown(message) if message.is_empty() => {
                "An unexpected error occurred.".to_string()
            }
            other => other.to_string(),
        }
    }
}

impl From<reqwest::Error> for SyncError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_connect() || err.is_timeout() || err.is_request() {
            return Self::NetworkUnavailable(err.to_string());
        }
        if let Some(status) = err.status() {
            return Self::from_status(status.as_u16(), String::new());
        }
        Self::Unknown(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        assert!(matches!(SyncError::from_status(401, ""), SyncError::Unauthorized));
        assert!(matches!(SyncError::from_status(403, "denied"), SyncError::Unauthorized));
        assert!(matches!(SyncError::from_status(404, ""), SyncError::NotFound));
        assert!(matches!(SyncError::from_status(503, ""), SyncError::ServerError(503)));
        assert!(matches!(SyncError::from_status(422, "bad"), SyncError::Unknown(_)));
    }

    #[test]
    fn test_retry_classification() {
        assert!(SyncError::NetworkUnavailable("offline".into()).is_retryable());
        assert!(SyncError::ServerError(500).is_retryable());
        assert!(!SyncError::Unauthorized.is_retryable());
        assert!(!SyncError::NotFound.is_retryable());
        assert!(!SyncError::unknown("x").is_retryable());
    }

    #[test]
    fn test_user_messages() {
        assert_eq!(
            SyncError::Unauthorized.user_message(),
            "Your session has expired. Please sign in again."
        );
        assert_eq!(
            SyncError::ServerError(502).user_message(),
            "Server error (502). Please try again later."
        );
        assert_eq!(SyncError::unknown("").user_message(), "An unexpected error occurred.");
    }
}
