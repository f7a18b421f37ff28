//! Consumes the realtime change feed for one conversation.
//!
//! The feed is best effort: events may arrive twice (merge is idempotent) or
//! not at all (the poller fills gaps). Payloads that do not decode are dropped.

use parking_lot::Mutex;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::ReadTracker;
use crate::backend::{RealtimeEvent, RealtimeSubscription, Unsubscribe};
use crate::models::{ConversationId, Message, MessageRow, ReadMarker, UserId};
use crate::signals::{SignalBus, SyncEvent};
use crate::store::SharedStore;

/// What happened to one change-feed event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ingested {
    Merged { tail_changed: bool },
    Duplicate,
    SeenAdvanced,
    Ignored,
    Malformed,
}

struct IngestContext {
    conversation_id: ConversationId,
    local_user: UserId,
    store: SharedStore,
    signals: SignalBus<SyncEvent>,
    read_tracker: ReadTracker,
}

impl IngestContext {
    fn handle(&self, event: RealtimeEvent) -> Ingested {
        match event {
            RealtimeEvent::MessageInserted(payload) => match MessageRow::from_payload(payload) {
                Ok(row) => self.ingest_message(Message::from(row)),
                Err(e) => {
                    warn!(
                        conversation_id = self.conversation_id,
                        error = %e,
                        "Dropping malformed realtime message payload"
                    );
                    Ingested::Malformed
                }
            },
            RealtimeEvent::ReadMarkerChanged(payload) => match ReadMarker::from_payload(payload) {
                Ok(marker) => self.ingest_marker(marker),
                Err(e) => {
                    warn!(
                        conversation_id = self.conversation_id,
                        error = %e,
                        "Dropping malformed realtime read marker payload"
                    );
                    Ingested::Malformed
                }
            },
        }
    }

    fn ingest_message(&self, message: Message) -> Ingested {
        if message.conversation_id != self.conversation_id {
            debug!(
                conversation_id = self.conversation_id,
                foreign_conversation_id = message.conversation_id,
                "Ignoring realtime insert for another conversation"
            );
            return Ingested::Ignored;
        }

        let incoming_from_other = message.sender != self.local_user;
        let identity = message.identity.clone();

        let (outcome, tail_is_incoming) = {
            let mut store = self.store.lock();
            let outcome = store.merge([message]);
            let tail_is_incoming = store.tail().is_some_and(|m| m.identity == identity);
            (outcome, tail_is_incoming)
        };

        if !outcome.changed() {
            debug!(
                conversation_id = self.conversation_id,
                identity = %identity,
                "Realtime redelivery ignored"
            );
            return Ingested::Duplicate;
        }

        debug!(
            conversation_id = self.conversation_id,
            identity = %identity,
            tail_changed = outcome.tail_changed,
            "Realtime insert merged"
        );
        self.signals.publish(SyncEvent::MessagesChanged {
            conversation_id: self.conversation_id,
            tail_changed: outcome.tail_changed,
        });

        if outcome.tail_changed && tail_is_incoming && incoming_from_other {
            self.read_tracker.on_incoming_delivered();
        }

        Ingested::Merged {
            tail_changed: outcome.tail_changed,
        }
    }

    fn ingest_marker(&self, marker: ReadMarker) -> Ingested {
        if marker.user_id == self.local_user {
            // Echo of our own write
            return Ingested::Ignored;
        }
        if self.read_tracker.apply_remote(&marker) {
            Ingested::SeenAdvanced
        } else {
            Ingested::Ignored
        }
    }
}

struct Running {
    task: JoinHandle<()>,
    unsubscribe: Unsubscribe,
}

pub struct RealtimeIngester {
    ctx: Arc<IngestContext>,
    running: Mutex<Option<Running>>,
}

impl RealtimeIngester {
    pub fn new(
        conversation_id: ConversationId,
        local_user: UserId,
        store: SharedStore,
        signals: SignalBus<SyncEvent>,
        read_tracker: ReadTracker,
    ) -> Self {
        Self {
            ctx: Arc::new(IngestContext {
                conversation_id,
                local_user,
                store,
                signals,
                read_tracker,
            }),
            running: Mutex::new(None),
        }
    }

    /// Start consuming `subscription`; an existing one is torn down first.
    pub fn start(&self, subscription: RealtimeSubscription) {
        self.stop();

        let RealtimeSubscription {
            mut events,
            unsubscribe,
        } = subscription;
        let ctx = self.ctx.clone();

        let task = tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                ctx.handle(event);
            }
            debug!(
                conversation_id = ctx.conversation_id,
                "Realtime stream closed"
            );
        });

        info!(
            conversation_id = self.ctx.conversation_id,
            "Realtime ingestion started"
        );
        *self.running.lock() = Some(Running { task, unsubscribe });
    }

    /// Abort the consumer task and release the transport subscription.
    pub fn stop(&self) {
        let running = self.running.lock().take();
        if let Some(running) = running {
            running.task.abort();
            running.unsubscribe.call();
            info!(
                conversation_id = self.ctx.conversation_id,
                "Realtime ingestion stopped"
            );
        }
    }

    pub fn is_running(&self) -> bool {
        self.running
            .lock()
            .as_ref()
            .is_some_and(|r| !r.task.is_finished())
    }

    /// Process one event synchronously, bypassing the consumer task.
    pub fn handle_event(&self, event: RealtimeEvent) -> Ingested {
        self.ctx.handle(event)
    }
}

impl Drop for RealtimeIngester {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{InMemoryBackend, RealtimeTransport};
    use crate::config::SyncConfig;
    use crate::models::{ClientKey, MessageId};
    use crate::store::MessageStore;
    use chrono::{Duration as ChronoDuration, Utc};
    use serde_json::json;
    use uuid::Uuid;

    struct Fixture {
        backend: InMemoryBackend,
        store: SharedStore,
        ingester: RealtimeIngester,
        tracker: ReadTracker,
        local: UserId,
        other: UserId,
    }

    fn fixture() -> Fixture {
        let backend = InMemoryBackend::new();
        let store = MessageStore::shared(1);
        let signals = SignalBus::new();
        let local = Uuid::new_v4();
        let other = Uuid::new_v4();
        let tracker = ReadTracker::new(
            1,
            local,
            Some(other),
            Arc::new(backend.clone()),
            signals.clone(),
            &SyncConfig::default(),
        );
        let ingester = RealtimeIngester::new(1, local, store.clone(), signals, tracker.clone());
        Fixture {
            backend,
            store,
            ingester,
            tracker,
            local,
            other,
        }
    }

    fn row(id: i64, conversation_id: i64, sender: Uuid, key: Option<&str>) -> serde_json::Value {
        json!({
            "id": id,
            "conversation_id": conversation_id,
            "sender_id": sender,
            "content": "hey",
            "created_at": "2024-05-01T10:00:00Z",
            "client_key": key,
        })
    }

    async fn settle() {
        for _ in 0..5 {
            tokio::task::yield_now().await;
        }
    }

    #[test]
    fn test_redelivery_is_a_duplicate() {
        let f = fixture();
        let event = RealtimeEvent::MessageInserted(row(55, 1, f.other, None));

        assert_eq!(
            f.ingester.handle_event(event.clone()),
            Ingested::Merged { tail_changed: true }
        );
        assert_eq!(f.ingester.handle_event(event), Ingested::Duplicate);
        assert_eq!(f.store.lock().len(), 1);
    }

    #[test]
    fn test_realtime_row_reconciles_placeholder() {
        let f = fixture();
        let key = ClientKey::new("k");
        f.store.lock().merge([Message::placeholder(
            1,
            f.local,
            "hello",
            Utc::now(),
            key.clone(),
        )]);

        f.ingester
            .handle_event(RealtimeEvent::MessageInserted(row(55, 1, f.local, Some("k"))));

        let messages = f.store.lock().snapshot();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].id(), Some(MessageId(55)));
        assert_eq!(messages[0].client_key, Some(key));
    }

    #[test]
    fn test_malformed_and_foreign_payloads_leave_store_untouched() {
        let f = fixture();

        assert_eq!(
            f.ingester
                .handle_event(RealtimeEvent::MessageInserted(json!({ "id": "nope" }))),
            Ingested::Malformed
        );
        assert_eq!(
            f.ingester
                .handle_event(RealtimeEvent::MessageInserted(row(7, 2, f.other, None))),
            Ingested::Ignored
        );
        assert_eq!(
            f.ingester
                .handle_event(RealtimeEvent::ReadMarkerChanged(json!({ "user_id": 1 }))),
            Ingested::Malformed
        );
        assert!(f.store.lock().is_empty());
    }

    #[test]
    fn test_own_marker_echo_is_ignored() {
        let f = fixture();
        let echo = json!({
            "conversation_id": 1,
            "user_id": f.local,
            "last_read_at": "2024-05-01T10:00:00Z",
        });
        assert_eq!(
            f.ingester.handle_event(RealtimeEvent::ReadMarkerChanged(echo)),
            Ingested::Ignored
        );
        assert_eq!(f.tracker.seen_through(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_incoming_tail_schedules_read_marker_when_at_bottom() {
        let f = fixture();
        f.tracker.set_at_bottom(true);
        f.tracker.mark_read_immediate().await.unwrap();
        let written = f.backend.calls(crate::backend::Operation::UpsertReadMarker);

        f.ingester
            .handle_event(RealtimeEvent::MessageInserted(row(1, 1, f.other, None)));
        assert!(f.tracker.has_pending());

        tokio::time::sleep(std::time::Duration::from_secs(2)).await;
        settle().await;
        assert_eq!(
            f.backend.calls(crate::backend::Operation::UpsertReadMarker),
            written + 1
        );
    }

    #[tokio::test]
    async fn test_subscription_feeds_store_until_stopped() {
        let f = fixture();
        let subscription = f.backend.subscribe(1).await.unwrap();
        f.ingester.start(subscription);
        assert!(f.ingester.is_running());

        f.backend.deliver_message(1, f.other, "first");
        settle().await;
        assert_eq!(f.store.lock().len(), 1);

        f.backend.deliver_read_marker(ReadMarker {
            conversation_id: 1,
            user_id: f.other,
            last_read_at: Utc::now() + ChronoDuration::seconds(1),
        });
        settle().await;
        assert!(f.tracker.seen_through().is_some());

        f.ingester.stop();
        assert_eq!(f.backend.subscriber_count(1), 0);
        assert!(!f.ingester.is_running());

        f.backend.deliver_message(1, f.other, "missed");
        settle().await;
        assert_eq!(f.store.lock().len(), 1);
    }

    #[tokio::test]
    async fn test_duplicate_redelivery_through_transport() {
        let f = fixture();
        f.backend.redeliver_duplicates(true);
        f.ingester.start(f.backend.subscribe(1).await.unwrap());

        f.backend.deliver_message(1, f.other, "twice");
        settle().await;

        assert_eq!(f.store.lock().len(), 1);
    }
}
