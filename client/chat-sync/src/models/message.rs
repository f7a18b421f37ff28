use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::cmp::Ordering;
use std::fmt;
use uuid::Uuid;

use super::read_marker::DeliveryState;
use crate::error::BackendError;

pub type UserId = Uuid;
pub type ConversationId = i64;

/// Identifier assigned by the backing store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MessageId(pub i64);

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Client-generated idempotency token attached at send time.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ClientKey(String);

impl ClientKey {
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn new(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ClientKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Who a message is, independent of what it says.
///
/// Derived ordering puts authoritative ids before placeholders; it is only used
/// to break `created_at` ties.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum MessageIdentity {
    Authoritative(MessageId),
    Placeholder(ClientKey),
}

impl fmt::Display for MessageIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MessageIdentity::Authoritative(id) => write!(f, "#{}", id),
            MessageIdentity::Placeholder(key) => write!(f, "pending:{}", key),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub identity: MessageIdentity,
    pub conversation_id: ConversationId,
    pub sender: UserId,
    pub content: String,
    pub created_at: DateTime<Utc>,
    pub client_key: Option<ClientKey>,
}

impl Message {
    pub fn authoritative(
        id: MessageId,
        conversation_id: ConversationId,
        sender: UserId,
        content: impl Into<String>,
        created_at: DateTime<Utc>,
        client_key: Option<ClientKey>,
    ) -> Self {
        Self {
            identity: MessageIdentity::Authoritative(id),
            conversation_id,
            sender,
            content: content.into(),
            created_at,
            client_key,
        }
    }

    /// Optimistic local copy shown before the backing store confirms the send.
    pub fn placeholder(
        conversation_id: ConversationId,
        sender: UserId,
        content: impl Into<String>,
        created_at: DateTime<Utc>,
        client_key: ClientKey,
    ) -> Self {
        Self {
            identity: MessageIdentity::Placeholder(client_key.clone()),
            conversation_id,
            sender,
            content: content.into(),
            created_at,
            client_key: Some(client_key),
        }
    }

    pub fn id(&self) -> Option<MessageId> {
        match &self.identity {
            MessageIdentity::Authoritative(id) => Some(*id),
            MessageIdentity::Placeholder(_) => None,
        }
    }

    pub fn is_placeholder(&self) -> bool {
        matches!(self.identity, MessageIdentity::Placeholder(_))
    }

    /// Timeline order: `created_at` ascending, ties broken by identity.
    pub fn timeline_cmp(&self, other: &Message) -> Ordering {
        self.created_at
            .cmp(&other.created_at)
            .then_with(|| self.identity.cmp(&other.identity))
    }

    /// Wire form; placeholders never leave the device.
    pub fn to_row(&self) -> Option<MessageRow> {
        self.id().map(|id| MessageRow {
            id: id.0,
            conversation_id: self.conversation_id,
            sender_id: self.sender,
            content: self.content.clone(),
            created_at: self.created_at,
            client_key: self.client_key.as_ref().map(|k| k.as_str().to_string()),
        })
    }
}

/// Row shape used by the backing store and its change feed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageRow {
    pub id: i64,
    pub conversation_id: ConversationId,
    pub sender_id: UserId,
    pub content: String,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_key: Option<String>,
}

impl MessageRow {
    /// Decode a change-feed payload; anything missing or mistyped is a decode error.
    pub fn from_payload(payload: JsonValue) -> Result<Self, BackendError> {
        Ok(serde_json::from_value(payload)?)
    }
}

impl From<MessageRow> for Message {
    fn from(row: MessageRow) -> Self {
        Message::authoritative(
            MessageId(row.id),
            row.conversation_id,
            row.sender_id,
            row.content,
            row.created_at,
            row.client_key.filter(|k| !k.is_empty()).map(ClientKey::new),
        )
    }
}

/// Outgoing message as handed to the insert endpoints.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewMessage {
    pub conversation_id: ConversationId,
    pub sender: UserId,
    pub content: String,
    pub client_key: ClientKey,
}

/// A message plus its derived delivery state, ready for rendering.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TimelineEntry {
    pub message: Message,
    /// `None` for the other participant's messages
    pub delivery: Option<DeliveryState>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    #[test]
    fn test_timeline_order_breaks_ties_by_identity() {
        let sender = Uuid::new_v4();
        let a = Message::authoritative(MessageId(2), 1, sender, "a", at(0), None);
        let b = Message::authoritative(MessageId(1), 1, sender, "b", at(0), None);
        let p = Message::placeholder(1, sender, "p", at(0), ClientKey::new("k"));

        assert_eq!(b.timeline_cmp(&a), Ordering::Less);
        assert_eq!(a.timeline_cmp(&p), Ordering::Less);
        assert_eq!(p.timeline_cmp(&b), Ordering::Greater);
    }

    #[test]
    fn test_placeholder_carries_key_in_both_places() {
        let key = ClientKey::generate();
        let p = Message::placeholder(7, Uuid::new_v4(), "hi", at(0), key.clone());
        assert!(p.is_placeholder());
        assert_eq!(p.id(), None);
        assert_eq!(p.client_key, Some(key.clone()));
        assert_eq!(p.identity, MessageIdentity::Placeholder(key));
        assert!(p.to_row().is_none());
    }

    #[test]
    fn test_row_payload_decoding() {
        let sender = Uuid::new_v4();
        let payload = json!({
            "id": 55,
            "conversation_id": 9,
            "sender_id": sender,
            "content": "hello",
            "created_at": "2024-05-01T10:00:00Z",
            "client_key": "abc"
        });

        let message: Message = MessageRow::from_payload(payload).unwrap().into();
        assert_eq!(message.id(), Some(MessageId(55)));
        assert_eq!(message.client_key, Some(ClientKey::new("abc")));
        assert_eq!(message.sender, sender);
    }

    #[test]
    fn test_partial_payload_is_rejected() {
        let payload = json!({ "id": 55, "content": "hello" });
        assert!(matches!(
            MessageRow::from_payload(payload),
            Err(BackendError::Decode(_))
        ));
    }

    #[test]
    fn test_empty_client_key_is_dropped() {
        let row = MessageRow {
            id: 1,
            conversation_id: 1,
            sender_id: Uuid::new_v4(),
            content: "x".into(),
            created_at: at(0),
            client_key: Some(String::new()),
        };
        assert_eq!(Message::from(row).client_key, None);
    }
}
