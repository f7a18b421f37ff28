//! Contracts consumed from the backing store and its realtime change feed.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value as JsonValue;
use tokio::sync::mpsc::UnboundedReceiver;

use crate::error::BackendResult;
use crate::models::{ConversationId, Message, MessageId, NewMessage, ReadMarker, UserId};

pub mod memory;

pub use memory::{InMemoryBackend, Operation};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SortOrder {
    #[default]
    Asc,
    Desc,
}

/// Filter for [`MessageBackend::list_messages`].
///
/// `after` drives forward gap-filling, `before_id` + `Desc` drives backward paging.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageQuery {
    pub after: Option<DateTime<Utc>>,
    pub before_id: Option<MessageId>,
    pub limit: usize,
    pub order: SortOrder,
}

impl MessageQuery {
    pub fn newer_than(after: DateTime<Utc>, limit: usize) -> Self {
        Self {
            after: Some(after),
            before_id: None,
            limit,
            order: SortOrder::Asc,
        }
    }

    pub fn older_than(before_id: MessageId, limit: usize) -> Self {
        Self {
            after: None,
            before_id: Some(before_id),
            limit,
            order: SortOrder::Desc,
        }
    }

    /// Newest page, newest first.
    pub fn latest(limit: usize) -> Self {
        Self {
            after: None,
            before_id: None,
            limit,
            order: SortOrder::Desc,
        }
    }
}

#[async_trait]
pub trait MessageBackend: Send + Sync {
    /// Insert-if-absent keyed by `client_key`.
    ///
    /// Calling this more than once with the same key must return the same row.
    async fn insert_message_idempotent(&self, message: &NewMessage) -> BackendResult<Message>;

    /// Plain insert, only used when the idempotent path errors.
    async fn insert_message(&self, message: &NewMessage) -> BackendResult<Message>;

    async fn list_messages(
        &self,
        conversation_id: ConversationId,
        query: &MessageQuery,
    ) -> BackendResult<Vec<Message>>;
}

#[async_trait]
pub trait ReadMarkerBackend: Send + Sync {
    async fn upsert_read_marker(&self, marker: &ReadMarker) -> BackendResult<()>;

    async fn get_read_marker(
        &self,
        conversation_id: ConversationId,
        user_id: UserId,
    ) -> BackendResult<Option<ReadMarker>>;
}

/// Raw change-feed event; payloads are decoded (and rejected) by the ingester.
#[derive(Debug, Clone, PartialEq)]
pub enum RealtimeEvent {
    MessageInserted(JsonValue),
    ReadMarkerChanged(JsonValue),
}

/// Tears a subscription down exactly once, on [`Unsubscribe::call`] or drop.
pub struct Unsubscribe(Option<Box<dyn FnOnce() + Send>>);

impl Unsubscribe {
    pub fn new(f: impl FnOnce() + Send + 'static) -> Self {
        Self(Some(Box::new(f)))
    }

    pub fn noop() -> Self {
        Self(None)
    }

    pub fn call(mut self) {
        if let Some(f) = self.0.take() {
            f();
        }
    }
}

impl Drop for Unsubscribe {
    fn drop(&mut self) {
        if let Some(f) = self.0.take() {
            f();
        }
    }
}

impl std::fmt::Debug for Unsubscribe {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("Unsubscribe")
            .field(&self.0.is_some())
            .finish()
    }
}

#[derive(Debug)]
pub struct RealtimeSubscription {
    pub events: UnboundedReceiver<RealtimeEvent>,
    pub unsubscribe: Unsubscribe,
}

#[async_trait]
pub trait RealtimeTransport: Send + Sync {
    /// Subscribe to inserts and read-marker changes scoped to one conversation.
    ///
    /// Reconnection after a transport drop is the transport's job; it may
    /// redeliver events and it may lose some.
    async fn subscribe(&self, conversation_id: ConversationId)
        -> BackendResult<RealtimeSubscription>;
}
