//! Per-conversation entry point for the presentation layer.
//!
//! Wires the store, the three producers (realtime, polling, pagination), the
//! send path and read tracking together, and owns their lifecycle.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{info, warn};

use crate::backend::{MessageBackend, ReadMarkerBackend, RealtimeTransport};
use crate::config::SyncConfig;
use crate::error::{SyncError, SyncResult};
use crate::models::{Conversation, DeliveryState, Message, TimelineEntry, UserId};
use crate::services::{
    PageOutcome, PaginationLoader, PollingFallback, ReadTracker, RealtimeIngester,
    SendCoordinator, TickOutcome,
};
use crate::signals::{SignalBus, SyncEvent};
use crate::store::{MessageStore, SharedStore};

/// Collaborator handles the engine talks to.
#[derive(Clone)]
pub struct Backends {
    pub messages: Arc<dyn MessageBackend>,
    pub read_markers: Arc<dyn ReadMarkerBackend>,
    pub realtime: Arc<dyn RealtimeTransport>,
}

impl Backends {
    /// Use one value for every contract.
    pub fn shared<B>(backend: B) -> Self
    where
        B: MessageBackend + ReadMarkerBackend + RealtimeTransport + 'static,
    {
        let backend = Arc::new(backend);
        Self {
            messages: backend.clone(),
            read_markers: backend.clone(),
            realtime: backend,
        }
    }
}

pub struct ConversationSync {
    conversation: Conversation,
    local_user: UserId,
    store: SharedStore,
    signals: SignalBus<SyncEvent>,
    realtime: Arc<dyn RealtimeTransport>,
    sender: SendCoordinator,
    ingester: RealtimeIngester,
    poller: PollingFallback,
    pages: PaginationLoader,
    read_tracker: ReadTracker,
    active: AtomicBool,
}

impl ConversationSync {
    pub fn new(
        conversation: Conversation,
        local_user: UserId,
        backends: Backends,
        config: &SyncConfig,
        signals: SignalBus<SyncEvent>,
    ) -> SyncResult<Self> {
        let other = conversation
            .other_participant(local_user)
            .ok_or(SyncError::NotParticipant {
                conversation_id: conversation.id,
                user_id: local_user,
            })?;

        let id = conversation.id;
        let store = MessageStore::shared(id);

        let read_tracker = ReadTracker::new(
            id,
            local_user,
            Some(other),
            backends.read_markers.clone(),
            signals.clone(),
            config,
        );
        let sender = SendCoordinator::new(
            id,
            local_user,
            store.clone(),
            backends.messages.clone(),
            signals.clone(),
            config,
        );
        let ingester = RealtimeIngester::new(
            id,
            local_user,
            store.clone(),
            signals.clone(),
            read_tracker.clone(),
        );
        let poller = PollingFallback::new(
            id,
            local_user,
            store.clone(),
            backends.messages.clone(),
            read_tracker.clone(),
            signals.clone(),
            config,
        );
        let pages = PaginationLoader::new(
            id,
            store.clone(),
            backends.messages.clone(),
            signals.clone(),
            config,
        );

        Ok(Self {
            conversation,
            local_user,
            store,
            signals,
            realtime: backends.realtime,
            sender,
            ingester,
            poller,
            pages,
            read_tracker,
            active: AtomicBool::new(false),
        })
    }

    pub fn conversation(&self) -> &Conversation {
        &self.conversation
    }

    pub fn local_user(&self) -> UserId {
        self.local_user
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    /// Open the view: subscribe, start polling, load the newest page and the
    /// other participant's read marker. Calling it again is a no-op.
    ///
    /// A failed subscription is tolerated (polling covers it); a failed
    /// initial page is returned, with the producers left running.
    pub async fn activate(&self) -> SyncResult<()> {
        if self.active.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let conversation_id = self.conversation.id;
        info!(conversation_id, user_id = %self.local_user, "Activating conversation sync");

        match self.realtime.subscribe(conversation_id).await {
            Ok(subscription) => self.ingester.start(subscription),
            Err(e) => warn!(
                conversation_id,
                error = %e,
                "Realtime subscription failed, relying on polling"
            ),
        }
        self.poller.start();

        let (page, marker) = futures::join!(
            self.pages.load_latest(),
            self.read_tracker.refresh_remote()
        );
        if let Err(e) = marker {
            warn!(conversation_id, error = %e, "Initial read marker fetch failed");
        }
        page.map(|_| ())
    }

    /// Close the view: flush the read marker, stop realtime and polling.
    ///
    /// A send already in flight keeps running and reconciles into the store.
    pub async fn deactivate(&self) {
        if !self.active.swap(false, Ordering::AcqRel) {
            return;
        }
        let conversation_id = self.conversation.id;

        if self.read_tracker.is_at_bottom() || self.read_tracker.has_pending() {
            if let Err(e) = self.read_tracker.mark_read_immediate().await {
                warn!(conversation_id, error = %e, "Read marker flush failed");
            }
        }

        self.ingester.stop();
        self.poller.stop();
        info!(conversation_id, "Conversation sync deactivated");
    }

    pub async fn send(&self, content: &str) -> SyncResult<Message> {
        self.sender.send(content).await
    }

    pub async fn load_older(&self) -> SyncResult<PageOutcome> {
        self.pages.load_older().await
    }

    pub fn has_more_history(&self) -> bool {
        self.pages.has_more()
    }

    /// Run a poll tick now instead of waiting for the interval.
    pub async fn poll_now(&self) -> SyncResult<TickOutcome> {
        self.poller.tick().await
    }

    pub fn set_at_bottom(&self, at_bottom: bool) {
        self.read_tracker.set_at_bottom(at_bottom);
    }

    pub fn mark_read(&self) {
        self.read_tracker.mark_read();
    }

    pub fn snapshot(&self) -> Vec<Message> {
        self.store.lock().snapshot()
    }

    pub fn delivery_state(&self, message: &Message) -> Option<DeliveryState> {
        self.read_tracker.delivery_state(message)
    }

    /// Messages in timeline order with the delivery state of own messages.
    pub fn timeline(&self) -> Vec<TimelineEntry> {
        self.snapshot()
            .into_iter()
            .map(|message| TimelineEntry {
                delivery: self.read_tracker.delivery_state(&message),
                message,
            })
            .collect()
    }

    pub fn signals(&self) -> SignalBus<SyncEvent> {
        self.signals.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{InMemoryBackend, Operation};
    use crate::error::BackendError;
    use uuid::Uuid;

    fn conversation(a: UserId, b: UserId) -> Conversation {
        Conversation {
            id: 1,
            participant_a: a,
            participant_b: b,
            last_message_at: None,
        }
    }

    #[test]
    fn test_non_participant_is_rejected() {
        let result = ConversationSync::new(
            conversation(Uuid::new_v4(), Uuid::new_v4()),
            Uuid::new_v4(),
            Backends::shared(InMemoryBackend::new()),
            &SyncConfig::default(),
            SignalBus::new(),
        );
        assert!(matches!(result, Err(SyncError::NotParticipant { .. })));
    }

    #[tokio::test]
    async fn test_activate_is_idempotent() {
        let backend = InMemoryBackend::new();
        let local = Uuid::new_v4();
        let sync = ConversationSync::new(
            conversation(local, Uuid::new_v4()),
            local,
            Backends::shared(backend.clone()),
            &SyncConfig::default(),
            SignalBus::new(),
        )
        .unwrap();

        sync.activate().await.unwrap();
        sync.activate().await.unwrap();

        assert_eq!(backend.calls(Operation::Subscribe), 1);
        assert_eq!(backend.subscriber_count(1), 1);

        sync.deactivate().await;
        assert_eq!(backend.subscriber_count(1), 0);
        assert!(!sync.is_active());
    }

    #[tokio::test]
    async fn test_subscription_failure_is_tolerated() {
        let backend = InMemoryBackend::new();
        backend.fail_next(Operation::Subscribe, BackendError::Network("ws".into()));
        let local = Uuid::new_v4();
        let sync = ConversationSync::new(
            conversation(local, Uuid::new_v4()),
            local,
            Backends::shared(backend.clone()),
            &SyncConfig::default(),
            SignalBus::new(),
        )
        .unwrap();

        sync.activate().await.unwrap();
        assert!(sync.is_active());
        sync.deactivate().await;
    }
}
