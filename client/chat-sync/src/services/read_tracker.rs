//! Read markers: the local user's (written, debounced and monotonic) and the
//! other participant's (observed, used to derive "seen").

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use resilience::{poll_policy, read_marker_policy, CallPolicy};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::call_with_policy;
use crate::backend::ReadMarkerBackend;
use crate::config::SyncConfig;
use crate::error::{SyncError, SyncResult};
use crate::models::{ConversationId, DeliveryState, Message, ReadMarker, UserId};
use crate::signals::{SignalBus, SyncEvent};

#[derive(Default)]
struct ReadState {
    at_bottom: bool,
    /// Highest `last_read_at` this device has attempted to write
    local_marker: Option<DateTime<Utc>>,
    /// Other participant's `last_read_at`
    seen_through: Option<DateTime<Utc>>,
    /// Latest time requested while a debounced write is pending
    requested: Option<DateTime<Utc>>,
    pending: Option<JoinHandle<()>>,
    // Bumped per debounce task so a stale task never clears a newer one
    generation: u64,
}

struct Inner {
    conversation_id: ConversationId,
    local_user: UserId,
    other_user: Option<UserId>,
    backend: Arc<dyn ReadMarkerBackend>,
    signals: SignalBus<SyncEvent>,
    debounce: Duration,
    single_shot: CallPolicy,
    immediate_policy: CallPolicy,
    state: Mutex<ReadState>,
}

#[derive(Clone)]
pub struct ReadTracker {
    inner: Arc<Inner>,
}

impl ReadTracker {
    pub fn new(
        conversation_id: ConversationId,
        local_user: UserId,
        other_user: Option<UserId>,
        backend: Arc<dyn ReadMarkerBackend>,
        signals: SignalBus<SyncEvent>,
        config: &SyncConfig,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                conversation_id,
                local_user,
                other_user,
                backend,
                signals,
                debounce: config.read_debounce,
                // A debounced write is superseded by the next one; no retry.
                single_shot: poll_policy(config.request_timeout),
                immediate_policy: read_marker_policy(config.request_timeout),
                state: Mutex::new(ReadState::default()),
            }),
        }
    }

    /// Record whether the presentation layer shows the newest message.
    pub fn set_at_bottom(&self, at_bottom: bool) {
        let became_bottom = {
            let mut state = self.inner.state.lock();
            let was = state.at_bottom;
            state.at_bottom = at_bottom;
            at_bottom && !was
        };
        if became_bottom {
            self.mark_read();
        }
    }

    pub fn is_at_bottom(&self) -> bool {
        self.inner.state.lock().at_bottom
    }

    pub fn has_pending(&self) -> bool {
        let state = self.inner.state.lock();
        state.requested.is_some()
            || state
                .pending
                .as_ref()
                .is_some_and(|handle| !handle.is_finished())
    }

    pub fn local_marker(&self) -> Option<DateTime<Utc>> {
        self.inner.state.lock().local_marker
    }

    pub fn seen_through(&self) -> Option<DateTime<Utc>> {
        self.inner.state.lock().seen_through
    }

    /// Schedule a debounced marker write if the view is at the bottom.
    ///
    /// Calls inside the debounce window fold into the pending write, which
    /// carries the latest requested time. A call that lands while that write
    /// is in flight is picked up by another window. Must be called inside a
    /// tokio runtime.
    pub fn mark_read(&self) {
        let mut state = self.inner.state.lock();
        if !state.at_bottom {
            return;
        }

        state.requested = Some(Utc::now());
        if state
            .pending
            .as_ref()
            .is_some_and(|handle| !handle.is_finished())
        {
            return;
        }

        state.generation += 1;
        let generation = state.generation;
        let tracker = self.clone();
        state.pending = Some(tokio::spawn(async move {
            tracker.run_debounced(generation).await;
        }));
    }

    /// Debounce loop: one window, one write, repeated while requests keep arriving.
    async fn run_debounced(&self, generation: u64) {
        loop {
            tokio::time::sleep(self.inner.debounce).await;

            let requested = {
                let mut state = self.inner.state.lock();
                match state.requested.take() {
                    Some(at) => at,
                    None => {
                        if state.generation == generation {
                            state.pending = None;
                        }
                        return;
                    }
                }
            };

            let policy = self.inner.single_shot.clone();
            if let Err(e) = self.write(requested, &policy).await {
                warn!(
                    conversation_id = self.inner.conversation_id,
                    error = %e,
                    "Debounced read marker write failed"
                );
            }
        }
    }

    /// Cancel any pending debounced write and write "now" with bounded retry.
    pub async fn mark_read_immediate(&self) -> SyncResult<()> {
        {
            let mut state = self.inner.state.lock();
            if let Some(handle) = state.pending.take() {
                handle.abort();
            }
            state.requested = None;
        }

        let policy = self.inner.immediate_policy.clone();
        self.write(Utc::now(), &policy).await.map(|_| ())
    }

    /// A message from the other participant became the newest one.
    pub fn on_incoming_delivered(&self) {
        self.mark_read();
    }

    /// Apply an observed marker; only the other participant's, only forward.
    ///
    /// Returns true when the seen position advanced.
    pub fn apply_remote(&self, marker: &ReadMarker) -> bool {
        if marker.conversation_id != self.inner.conversation_id
            || marker.user_id == self.inner.local_user
            || self.inner.other_user.is_some_and(|other| other != marker.user_id)
        {
            return false;
        }

        {
            let mut state = self.inner.state.lock();
            if state
                .seen_through
                .is_some_and(|current| marker.last_read_at <= current)
            {
                return false;
            }
            state.seen_through = Some(marker.last_read_at);
        }

        debug!(
            conversation_id = self.inner.conversation_id,
            seen_through = %marker.last_read_at,
            "Other participant's read marker advanced"
        );
        self.inner.signals.publish(SyncEvent::SeenUpdated {
            conversation_id: self.inner.conversation_id,
            seen_through: marker.last_read_at,
        });
        true
    }

    /// Fetch the other participant's marker and apply it.
    pub async fn refresh_remote(&self) -> SyncResult<bool> {
        let Some(other) = self.inner.other_user else {
            return Ok(false);
        };

        let backend = self.inner.backend.clone();
        let conversation_id = self.inner.conversation_id;
        let marker = call_with_policy(&self.inner.single_shot, || {
            backend.get_read_marker(conversation_id, other)
        })
        .await
        .map_err(SyncError::ReadMarker)?;

        Ok(marker.is_some_and(|m| self.apply_remote(&m)))
    }

    /// `None` for messages the local user did not send.
    pub fn delivery_state(&self, message: &Message) -> Option<DeliveryState> {
        if message.sender != self.inner.local_user {
            return None;
        }
        Some(DeliveryState::derive(
            message.is_placeholder(),
            message.created_at,
            self.seen_through(),
        ))
    }

    /// Write `at` unless it would move the local marker backwards.
    ///
    /// The local marker becomes `max(old, at)` whether or not the upsert succeeds.
    async fn write(&self, at: DateTime<Utc>, policy: &CallPolicy) -> SyncResult<bool> {
        {
            let mut state = self.inner.state.lock();
            if let Some(current) = state.local_marker {
                if at <= current {
                    warn!(
                        conversation_id = self.inner.conversation_id,
                        attempted = %at,
                        current = %current,
                        "Dropping read marker write that does not move forward"
                    );
                    return Ok(false);
                }
            }
            state.local_marker = Some(at);
        }

        let marker = ReadMarker {
            conversation_id: self.inner.conversation_id,
            user_id: self.inner.local_user,
            last_read_at: at,
        };
        let backend = self.inner.backend.clone();
        call_with_policy(policy, || backend.upsert_read_marker(&marker))
            .await
            .map_err(SyncError::ReadMarker)?;

        debug!(
            conversation_id = self.inner.conversation_id,
            last_read_at = %at,
            "Read marker written"
        );
        Ok(true)
    }
}
