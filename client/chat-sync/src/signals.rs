//! Explicit publish/subscribe handle for cross-cutting signals.
//!
//! Consumers receive a cloned [`SignalBus`] instead of registering on a
//! module-level listener set, so every subscription has an owner and a
//! well-defined end.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};
use uuid::Uuid;

use crate::models::{ClientKey, ConversationId};

/// Unique identifier for a bus subscriber
///
/// Each subscriber gets its own id when it registers, which allows precise
/// cleanup when the consumer goes away.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriberId(Uuid);

impl SubscriberId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for SubscriberId {
    fn default() -> Self {
        Self::new()
    }
}

struct Subscriber<E> {
    id: SubscriberId,
    sender: UnboundedSender<E>,
}

pub struct SignalBus<E> {
    inner: Arc<Mutex<Vec<Subscriber<E>>>>,
}

impl<E> Clone for SignalBus<E> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<E> Default for SignalBus<E> {
    fn default() -> Self {
        Self {
            inner: Arc::new(Mutex::new(Vec::new())),
        }
    }
}

impl<E: Clone> SignalBus<E> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the subscriber id (for [`SignalBus::unsubscribe`]) and the receiving end.
    pub fn subscribe(&self) -> (SubscriberId, UnboundedReceiver<E>) {
        let (tx, rx) = unbounded_channel();
        let id = SubscriberId::new();

        let mut guard = self.inner.lock();
        guard.push(Subscriber { id, sender: tx });

        tracing::debug!(subscriber = ?id, total = guard.len(), "Signal subscriber added");
        (id, rx)
    }

    pub fn unsubscribe(&self, id: SubscriberId) -> bool {
        let mut guard = self.inner.lock();
        let before = guard.len();
        guard.retain(|s| s.id != id);
        before != guard.len()
    }

    /// Deliver `event` to every live subscriber; dropped receivers are pruned.
    pub fn publish(&self, event: E) -> usize {
        let mut guard = self.inner.lock();
        let before = guard.len();

        guard.retain(|subscriber| subscriber.sender.send(event.clone()).is_ok());

        let after = guard.len();
        if before != after {
            tracing::debug!(
                pruned = before - after,
                active = after,
                "Dead signal subscribers cleaned up"
            );
        }
        after
    }

    pub fn subscriber_count(&self) -> usize {
        self.inner.lock().len()
    }
}

/// Signals emitted by the sync engine for the presentation layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncEvent {
    /// The visible list changed; `tail_changed` means the newest message is different
    MessagesChanged {
        conversation_id: ConversationId,
        tail_changed: bool,
    },
    /// Both insert paths failed and the optimistic copy was rolled back
    SendFailed {
        conversation_id: ConversationId,
        client_key: ClientKey,
        reason: String,
    },
    /// The other participant's read marker moved forward
    SeenUpdated {
        conversation_id: ConversationId,
        seen_through: DateTime<Utc>,
    },
    /// Backward paging reached the start of the conversation
    HistoryExhausted { conversation_id: ConversationId },
}
