//! Gap-filling poller running alongside the realtime feed.
//!
//! Fixed base interval with jitter, no backoff, no tick limit. A failed tick
//! is logged and the next interval is the retry.

use parking_lot::Mutex;
use resilience::{poll_policy, CallPolicy, JitteredInterval};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::{call_with_policy, ReadTracker};
use crate::backend::{MessageBackend, MessageQuery};
use crate::config::SyncConfig;
use crate::error::{SyncError, SyncResult};
use crate::models::{ConversationId, UserId};
use crate::signals::{SignalBus, SyncEvent};
use crate::store::SharedStore;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TickOutcome {
    pub fetched: usize,
    pub changed: bool,
    pub marker_refreshed: bool,
}

struct PollContext {
    conversation_id: ConversationId,
    local_user: UserId,
    store: SharedStore,
    backend: Arc<dyn MessageBackend>,
    read_tracker: ReadTracker,
    signals: SignalBus<SyncEvent>,
    interval: JitteredInterval,
    batch_limit: usize,
    page_size: usize,
    marker_every: u64,
    policy: CallPolicy,
    ticks: AtomicU64,
    active: AtomicBool,
}

impl PollContext {
    async fn tick(&self) -> SyncResult<TickOutcome> {
        let tick = self.ticks.fetch_add(1, Ordering::AcqRel) + 1;

        // Placeholders carry local clock time, so only authoritative rows bound the query.
        let after = self
            .store
            .lock()
            .newest_authoritative()
            .map(|m| m.created_at);
        let query = match after {
            Some(after) => MessageQuery::newer_than(after, self.batch_limit),
            None => MessageQuery::latest(self.page_size),
        };

        let messages = call_with_policy(&self.policy, || {
            self.backend.list_messages(self.conversation_id, &query)
        })
        .await
        .map_err(SyncError::Backend)?;

        let fetched = messages.len();
        let (outcome, tail_from_other) = {
            let mut store = self.store.lock();
            let outcome = store.merge(messages);
            let tail_from_other = store
                .tail()
                .is_some_and(|m| m.sender != self.local_user);
            (outcome, tail_from_other)
        };

        debug!(
            conversation_id = self.conversation_id,
            tick,
            fetched,
            inserted = outcome.inserted,
            "Poll tick merged"
        );

        if outcome.changed() {
            self.signals.publish(SyncEvent::MessagesChanged {
                conversation_id: self.conversation_id,
                tail_changed: outcome.tail_changed,
            });
            if outcome.tail_changed && tail_from_other {
                self.read_tracker.on_incoming_delivered();
            }
        }

        let mut marker_refreshed = false;
        if self.marker_every > 0 && tick % self.marker_every == 0 {
            match self.read_tracker.refresh_remote().await {
                Ok(_) => marker_refreshed = true,
                Err(e) => warn!(
                    conversation_id = self.conversation_id,
                    error = %e,
                    "Read marker poll failed"
                ),
            }
        }

        Ok(TickOutcome {
            fetched,
            changed: outcome.changed(),
            marker_refreshed,
        })
    }
}

pub struct PollingFallback {
    ctx: Arc<PollContext>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl PollingFallback {
    pub fn new(
        conversation_id: ConversationId,
        local_user: UserId,
        store: SharedStore,
        backend: Arc<dyn MessageBackend>,
        read_tracker: ReadTracker,
        signals: SignalBus<SyncEvent>,
        config: &SyncConfig,
    ) -> Self {
        Self {
            ctx: Arc::new(PollContext {
                conversation_id,
                local_user,
                store,
                backend,
                read_tracker,
                signals,
                interval: JitteredInterval::new(config.poll_interval, config.poll_jitter),
                batch_limit: config.poll_batch_limit,
                page_size: config.page_size,
                marker_every: u64::from(config.read_marker_poll_every),
                policy: poll_policy(config.request_timeout),
                ticks: AtomicU64::new(0),
                active: AtomicBool::new(false),
            }),
            task: Mutex::new(None),
        }
    }

    /// Spawn the poll loop; a no-op if it is already running.
    pub fn start(&self) {
        let mut task = self.task.lock();
        if task.as_ref().is_some_and(|t| !t.is_finished()) {
            return;
        }

        self.ctx.active.store(true, Ordering::Release);
        let ctx = self.ctx.clone();
        *task = Some(tokio::spawn(async move {
            loop {
                tokio::time::sleep(ctx.interval.next_delay()).await;
                if !ctx.active.load(Ordering::Acquire) {
                    continue;
                }
                if let Err(e) = ctx.tick().await {
                    warn!(
                        conversation_id = ctx.conversation_id,
                        error = %e,
                        "Poll tick failed, retrying next interval"
                    );
                }
            }
        }));

        info!(
            conversation_id = self.ctx.conversation_id,
            interval_ms = self.ctx.interval.base().as_millis() as u64,
            "Polling started"
        );
    }

    pub fn stop(&self) {
        self.ctx.active.store(false, Ordering::Release);
        if let Some(task) = self.task.lock().take() {
            task.abort();
            info!(conversation_id = self.ctx.conversation_id, "Polling stopped");
        }
    }

    /// Pause or resume ticking without tearing the loop down.
    pub fn set_active(&self, active: bool) {
        self.ctx.active.store(active, Ordering::Release);
    }

    pub fn is_running(&self) -> bool {
        self.task
            .lock()
            .as_ref()
            .is_some_and(|t| !t.is_finished())
    }

    pub fn ticks(&self) -> u64 {
        self.ctx.ticks.load(Ordering::Acquire)
    }

    /// Run one tick now, outside the loop.
    pub async fn tick(&self) -> SyncResult<TickOutcome> {
        self.ctx.tick().await
    }
}

impl Drop for PollingFallback {
    fn drop(&mut self) {
        if let Some(task) = self.task.get_mut().take() {
            task.abort();
        }
    }
}
