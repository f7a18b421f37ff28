//! In-process backing store and change feed.
//!
//! Implements every backend contract against in-memory tables, with a
//! per-conversation subscriber registry for realtime fan-out. Tests and demo
//! builds use it to script network behavior: injected failures, latency,
//! muted (lost) realtime events and duplicate redelivery.

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use super::{
    MessageBackend, MessageQuery, ReadMarkerBackend, RealtimeEvent, RealtimeSubscription,
    RealtimeTransport, SortOrder, Unsubscribe,
};
use crate::error::{BackendError, BackendResult};
use crate::models::{
    ClientKey, ConversationId, Message, MessageId, NewMessage, ReadMarker, UserId,
};
use crate::signals::SignalBus;

/// Backend call kinds, for failure injection and call accounting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    InsertIdempotent,
    Insert,
    ListMessages,
    UpsertReadMarker,
    GetReadMarker,
    Subscribe,
}

#[derive(Default)]
struct State {
    rows: Vec<Message>,
    next_id: i64,
    last_created_at: Option<DateTime<Utc>>,
    markers: HashMap<(ConversationId, UserId), ReadMarker>,
    failures: HashMap<Operation, VecDeque<BackendError>>,
    delays: HashMap<Operation, Duration>,
    calls: HashMap<Operation, usize>,
    realtime_muted: bool,
    redeliver: bool,
}

impl State {
    fn next_created_at(&mut self) -> DateTime<Utc> {
        let now = Utc::now();
        let created_at = match self.last_created_at {
            Some(last) if now <= last => last + ChronoDuration::microseconds(1),
            _ => now,
        };
        self.last_created_at = Some(created_at);
        created_at
    }

    fn push_row(
        &mut self,
        conversation_id: ConversationId,
        sender: UserId,
        content: &str,
        client_key: Option<ClientKey>,
        created_at: Option<DateTime<Utc>>,
    ) -> Message {
        self.next_id += 1;
        let created_at = match created_at {
            Some(at) => {
                if self.last_created_at.map_or(true, |last| at > last) {
                    self.last_created_at = Some(at);
                }
                at
            }
            None => self.next_created_at(),
        };
        let message = Message::authoritative(
            MessageId(self.next_id),
            conversation_id,
            sender,
            content,
            created_at,
            client_key,
        );
        self.rows.push(message.clone());
        message
    }
}

#[derive(Clone, Default)]
pub struct InMemoryBackend {
    state: Arc<Mutex<State>>,
    // conversation_id -> change-feed subscribers
    channels: Arc<Mutex<HashMap<ConversationId, SignalBus<RealtimeEvent>>>>,
}

impl InMemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next call of `op` fail with `error`. Queued failures are consumed in order.
    pub fn fail_next(&self, op: Operation, error: BackendError) {
        self.state
            .lock()
            .failures
            .entry(op)
            .or_default()
            .push_back(error);
    }

    pub fn fail_times(&self, op: Operation, error: BackendError, times: usize) {
        for _ in 0..times {
            self.fail_next(op, error.clone());
        }
    }

    pub fn set_delay(&self, op: Operation, delay: Duration) {
        self.state.lock().delays.insert(op, delay);
    }

    /// Drop change-feed events instead of delivering them (simulates a lossy transport).
    pub fn mute_realtime(&self, muted: bool) {
        self.state.lock().realtime_muted = muted;
    }

    /// Deliver every change-feed event twice.
    pub fn redeliver_duplicates(&self, enabled: bool) {
        self.state.lock().redeliver = enabled;
    }

    pub fn calls(&self, op: Operation) -> usize {
        self.state.lock().calls.get(&op).copied().unwrap_or(0)
    }

    pub fn rows(&self, conversation_id: ConversationId) -> Vec<Message> {
        self.state
            .lock()
            .rows
            .iter()
            .filter(|m| m.conversation_id == conversation_id)
            .cloned()
            .collect()
    }

    pub fn read_marker(
        &self,
        conversation_id: ConversationId,
        user_id: UserId,
    ) -> Option<ReadMarker> {
        self.state
            .lock()
            .markers
            .get(&(conversation_id, user_id))
            .cloned()
    }

    pub fn subscriber_count(&self, conversation_id: ConversationId) -> usize {
        self.channels
            .lock()
            .get(&conversation_id)
            .map(|bus| bus.subscriber_count())
            .unwrap_or(0)
    }

    /// Store history without notifying subscribers.
    pub fn seed(
        &self,
        conversation_id: ConversationId,
        sender: UserId,
        content: &str,
        created_at: DateTime<Utc>,
    ) -> Message {
        self.state
            .lock()
            .push_row(conversation_id, sender, content, None, Some(created_at))
    }

    /// Another device (usually the other participant) wrote a message.
    pub fn deliver_message(
        &self,
        conversation_id: ConversationId,
        sender: UserId,
        content: &str,
    ) -> Message {
        let message = self
            .state
            .lock()
            .push_row(conversation_id, sender, content, None, None);
        self.fan_out_message(&message);
        message
    }

    /// Another device moved a read marker.
    pub fn deliver_read_marker(&self, marker: ReadMarker) {
        self.state
            .lock()
            .markers
            .insert((marker.conversation_id, marker.user_id), marker.clone());
        self.fan_out_marker(&marker);
    }

    /// Publish a raw event, bypassing mute and redelivery settings.
    pub fn push_raw(&self, conversation_id: ConversationId, event: RealtimeEvent) -> usize {
        match self.channels.lock().get(&conversation_id) {
            Some(bus) => bus.publish(event),
            None => 0,
        }
    }

    async fn enter(&self, op: Operation) -> BackendResult<()> {
        let (delay, failure) = {
            let mut state = self.state.lock();
            *state.calls.entry(op).or_default() += 1;
            let delay = state.delays.get(&op).copied();
            let failure = state.failures.get_mut(&op).and_then(|q| q.pop_front());
            (delay, failure)
        };

        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        match failure {
            Some(error) => {
                debug!(operation = ?op, error = %error, "Injected backend failure");
                Err(error)
            }
            None => Ok(()),
        }
    }

    fn fan_out_message(&self, message: &Message) {
        let Some(row) = message.to_row() else {
            return;
        };
        match serde_json::to_value(&row) {
            Ok(payload) => self.fan_out(
                message.conversation_id,
                RealtimeEvent::MessageInserted(payload),
            ),
            Err(e) => warn!(error = %e, "Failed to encode message row for fan-out"),
        }
    }

    fn fan_out_marker(&self, marker: &ReadMarker) {
        match serde_json::to_value(marker) {
            Ok(payload) => self.fan_out(
                marker.conversation_id,
                RealtimeEvent::ReadMarkerChanged(payload),
            ),
            Err(e) => warn!(error = %e, "Failed to encode read marker for fan-out"),
        }
    }

    fn fan_out(&self, conversation_id: ConversationId, event: RealtimeEvent) {
        let (muted, redeliver) = {
            let state = self.state.lock();
            (state.realtime_muted, state.redeliver)
        };
        if muted {
            debug!(conversation_id, "Realtime muted, dropping event");
            return;
        }

        let bus = self.channels.lock().get(&conversation_id).cloned();
        if let Some(bus) = bus {
            if redeliver {
                bus.publish(event.clone());
            }
            bus.publish(event);
        }
    }

    fn insert_row(&self, message: &NewMessage) -> Message {
        self.state.lock().push_row(
            message.conversation_id,
            message.sender,
            &message.content,
            Some(message.client_key.clone()),
            None,
        )
    }
}

#[async_trait]
impl MessageBackend for InMemoryBackend {
    async fn insert_message_idempotent(&self, message: &NewMessage) -> BackendResult<Message> {
        self.enter(Operation::InsertIdempotent).await?;

        let existing = self
            .state
            .lock()
            .rows
            .iter()
            .find(|row| {
                row.conversation_id == message.conversation_id
                    && row.client_key.as_ref() == Some(&message.client_key)
            })
            .cloned();
        if let Some(existing) = existing {
            return Ok(existing);
        }

        let stored = self.insert_row(message);
        self.fan_out_message(&stored);
        Ok(stored)
    }

    async fn insert_message(&self, message: &NewMessage) -> BackendResult<Message> {
        self.enter(Operation::Insert).await?;

        let stored = self.insert_row(message);
        self.fan_out_message(&stored);
        Ok(stored)
    }

    async fn list_messages(
        &self,
        conversation_id: ConversationId,
        query: &MessageQuery,
    ) -> BackendResult<Vec<Message>> {
        self.enter(Operation::ListMessages).await?;

        let mut rows: Vec<Message> = self
            .state
            .lock()
            .rows
            .iter()
            .filter(|m| m.conversation_id == conversation_id)
            .filter(|m| query.after.map_or(true, |after| m.created_at > after))
            .filter(|m| {
                query
                    .before_id
                    .map_or(true, |before| m.id().is_some_and(|id| id < before))
            })
            .cloned()
            .collect();

        rows.sort_by(|a, b| a.timeline_cmp(b));
        if query.order == SortOrder::Desc {
            rows.reverse();
        }
        rows.truncate(query.limit);
        Ok(rows)
    }
}

#[async_trait]
impl ReadMarkerBackend for InMemoryBackend {
    async fn upsert_read_marker(&self, marker: &ReadMarker) -> BackendResult<()> {
        self.enter(Operation::UpsertReadMarker).await?;

        self.state
            .lock()
            .markers
            .insert((marker.conversation_id, marker.user_id), marker.clone());
        self.fan_out_marker(marker);
        Ok(())
    }

    async fn get_read_marker(
        &self,
        conversation_id: ConversationId,
        user_id: UserId,
    ) -> BackendResult<Option<ReadMarker>> {
        self.enter(Operation::GetReadMarker).await?;
        Ok(self.read_marker(conversation_id, user_id))
    }
}

#[async_trait]
impl RealtimeTransport for InMemoryBackend {
    async fn subscribe(
        &self,
        conversation_id: ConversationId,
    ) -> BackendResult<RealtimeSubscription> {
        self.enter(Operation::Subscribe).await?;

        let bus = self
            .channels
            .lock()
            .entry(conversation_id)
            .or_default()
            .clone();
        let (subscriber_id, events) = bus.subscribe();

        debug!(conversation_id, subscriber = ?subscriber_id, "Realtime subscriber added");

        let unsubscribe = Unsubscribe::new(move || {
            bus.unsubscribe(subscriber_id);
        });

        Ok(RealtimeSubscription {
            events,
            unsubscribe,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use uuid::Uuid;

    fn draft(key: &str) -> NewMessage {
        NewMessage {
            conversation_id: 1,
            sender: Uuid::nil(),
            content: "hello".into(),
            client_key: ClientKey::new(key),
        }
    }

    #[tokio::test]
    async fn test_idempotent_insert_returns_same_row() {
        let backend = InMemoryBackend::new();
        let first = backend.insert_message_idempotent(&draft("k")).await.unwrap();
        let second = backend.insert_message_idempotent(&draft("k")).await.unwrap();

        assert_eq!(first, second);
        assert_eq!(backend.rows(1).len(), 1);
        assert_eq!(backend.calls(Operation::InsertIdempotent), 2);
    }

    #[tokio::test]
    async fn test_injected_failures_are_consumed_in_order() {
        let backend = InMemoryBackend::new();
        backend.fail_next(Operation::Insert, BackendError::Network("down".into()));

        assert!(backend.insert_message(&draft("a")).await.is_err());
        assert!(backend.insert_message(&draft("a")).await.is_ok());
    }

    #[tokio::test]
    async fn test_list_messages_filters_and_orders() {
        let backend = InMemoryBackend::new();
        let base = Utc.timestamp_opt(1_700_000_000, 0).unwrap();
        for i in 0..5 {
            backend.seed(1, Uuid::nil(), &format!("m{}", i), base + ChronoDuration::seconds(i));
        }
        backend.seed(2, Uuid::nil(), "elsewhere", base);

        let older = backend
            .list_messages(1, &MessageQuery::older_than(MessageId(4), 2))
            .await
            .unwrap();
        let ids: Vec<i64> = older.iter().filter_map(|m| m.id()).map(|id| id.0).collect();
        assert_eq!(ids, vec![3, 2]);

        let newer = backend
            .list_messages(1, &MessageQuery::newer_than(base + ChronoDuration::seconds(2), 10))
            .await
            .unwrap();
        assert_eq!(newer.len(), 2);
        assert!(newer[0].created_at < newer[1].created_at);
    }

    #[tokio::test]
    async fn test_subscription_receives_inserts_until_unsubscribed() {
        let backend = InMemoryBackend::new();
        let subscription = backend.subscribe(1).await.unwrap();
        let mut events = subscription.events;
        assert_eq!(backend.subscriber_count(1), 1);

        backend.deliver_message(1, Uuid::nil(), "ping");
        assert!(matches!(
            events.recv().await,
            Some(RealtimeEvent::MessageInserted(_))
        ));

        subscription.unsubscribe.call();
        assert_eq!(backend.subscriber_count(1), 0);
    }

    #[tokio::test]
    async fn test_muted_realtime_drops_events() {
        let backend = InMemoryBackend::new();
        let mut subscription = backend.subscribe(1).await.unwrap();
        backend.mute_realtime(true);

        backend.deliver_message(1, Uuid::nil(), "lost");

        assert!(subscription.events.try_recv().is_err());
        assert_eq!(backend.rows(1).len(), 1);
    }
}
