use resilience::TimeoutError;
use std::time::Duration;
use thiserror::Error;

pub type SyncResult<T> = Result<T, SyncError>;
pub type BackendResult<T> = Result<T, BackendError>;

/// Distinguishes between retryable and permanent errors
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Retryable,
    Permanent,
}

/// Failures reported by the backing store, realtime transport, or their adapters.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum BackendError {
    #[error("network error: {0}")]
    Network(String),

    #[error("request timed out after {0:?}")]
    Timeout(Duration),

    #[error("request rejected: {0}")]
    Rejected(String),

    #[error("not found")]
    NotFound,

    #[error("malformed payload: {0}")]
    Decode(String),
}

impl BackendError {
    /// Check if error is transient (worth retrying)
    pub fn is_transient(&self) -> bool {
        matches!(self, BackendError::Network(_) | BackendError::Timeout(_))
    }
}

impl From<TimeoutError> for BackendError {
    fn from(e: TimeoutError) -> Self {
        BackendError::Timeout(e.0)
    }
}

impl From<serde_json::Error> for BackendError {
    fn from(e: serde_json::Error) -> Self {
        BackendError::Decode(e.to_string())
    }
}

/// Errors surfaced to the presentation layer.
///
/// The message store itself never fails; everything here comes from the edges
/// (sending, history paging, read markers, lifecycle misuse).
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SyncError {
    #[error("message is empty")]
    EmptyMessage,

    #[error("another send is still in flight")]
    SendInFlight,

    #[error("send failed (idempotent insert: {primary}; fallback insert: {fallback})")]
    SendFailed {
        primary: BackendError,
        fallback: BackendError,
    },

    #[error("loading older messages failed: {0}")]
    LoadOlderFailed(BackendError),

    #[error("read marker update failed: {0}")]
    ReadMarker(BackendError),

    #[error("backend error: {0}")]
    Backend(#[from] BackendError),

    #[error("conversation {conversation_id} does not include user {user_id}")]
    NotParticipant {
        conversation_id: i64,
        user_id: uuid::Uuid,
    },
}

impl SyncError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            SyncError::SendFailed { primary, fallback } => {
                if primary.is_transient() || fallback.is_transient() {
                    ErrorKind::Retryable
                } else {
                    ErrorKind::Permanent
                }
            }
            SyncError::LoadOlderFailed(e) | SyncError::ReadMarker(e) | SyncError::Backend(e) => {
                if e.is_transient() {
                    ErrorKind::Retryable
                } else {
                    ErrorKind::Permanent
                }
            }
            SyncError::SendInFlight => ErrorKind::Retryable,
            SyncError::EmptyMessage | SyncError::NotParticipant { .. } => ErrorKind::Permanent,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        assert!(BackendError::Network("reset".into()).is_transient());
        assert!(BackendError::Timeout(Duration::from_secs(1)).is_transient());
        assert!(!BackendError::Rejected("rls".into()).is_transient());
        assert!(!BackendError::Decode("bad".into()).is_transient());
    }

    #[test]
    fn test_send_failure_kind_follows_backend_errors() {
        let retryable = SyncError::SendFailed {
            primary: BackendError::Network("offline".into()),
            fallback: BackendError::Rejected("constraint".into()),
        };
        assert_eq!(retryable.kind(), ErrorKind::Retryable);

        let permanent = SyncError::SendFailed {
            primary: BackendError::Rejected("rls".into()),
            fallback: BackendError::Rejected("rls".into()),
        };
        assert_eq!(permanent.kind(), ErrorKind::Permanent);
        assert_eq!(SyncError::EmptyMessage.kind(), ErrorKind::Permanent);
    }

    #[test]
    fn test_timeout_maps_to_backend_timeout() {
        let err: BackendError = TimeoutError(Duration::from_millis(250)).into();
        assert_eq!(err, BackendError::Timeout(Duration::from_millis(250)));
    }
}
