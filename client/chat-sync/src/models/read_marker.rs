use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use super::message::{ConversationId, UserId};
use crate::error::BackendError;

/// Last-read position of one user in one conversation.
///
/// `last_read_at` only ever moves forward for a given (conversation, user).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReadMarker {
    pub conversation_id: ConversationId,
    pub user_id: UserId,
    pub last_read_at: DateTime<Utc>,
}

impl ReadMarker {
    pub fn from_payload(payload: JsonValue) -> Result<Self, BackendError> {
        Ok(serde_json::from_value(payload)?)
    }
}

/// Delivery state of the local user's own messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryState {
    /// Still an optimistic placeholder
    Pending,
    /// Stored, not yet read by the other participant
    Sent,
    /// Other participant's read marker is at or past the message
    Seen,
}

impl DeliveryState {
    pub fn derive(
        is_placeholder: bool,
        created_at: DateTime<Utc>,
        other_last_read_at: Option<DateTime<Utc>>,
    ) -> Self {
        if is_placeholder {
            return DeliveryState::Pending;
        }
        match other_last_read_at {
            Some(read_at) if read_at >= created_at => DeliveryState::Seen,
            _ => DeliveryState::Sent,
        }
    }
}
