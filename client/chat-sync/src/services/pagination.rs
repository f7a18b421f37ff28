//! Backward history paging.

use resilience::{history_policy, CallPolicy};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, info};

use super::call_with_policy;
use crate::backend::{MessageBackend, MessageQuery};
use crate::config::SyncConfig;
use crate::error::{SyncError, SyncResult};
use crate::models::ConversationId;
use crate::signals::{SignalBus, SyncEvent};
use crate::store::SharedStore;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PageOutcome {
    /// Rows returned by the backend (0 when the call was a no-op)
    pub fetched: usize,
    /// Rows that actually landed in the store
    pub inserted: usize,
    pub has_more: bool,
}

struct LoadingGuard<'a>(&'a AtomicBool);

impl Drop for LoadingGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

pub struct PaginationLoader {
    conversation_id: ConversationId,
    store: SharedStore,
    backend: Arc<dyn MessageBackend>,
    signals: SignalBus<SyncEvent>,
    page_size: usize,
    policy: CallPolicy,
    loading: AtomicBool,
    has_more: AtomicBool,
}

impl PaginationLoader {
    pub fn new(
        conversation_id: ConversationId,
        store: SharedStore,
        backend: Arc<dyn MessageBackend>,
        signals: SignalBus<SyncEvent>,
        config: &SyncConfig,
    ) -> Self {
        Self {
            conversation_id,
            store,
            backend,
            signals,
            page_size: config.page_size,
            policy: history_policy(config.request_timeout),
            loading: AtomicBool::new(false),
            has_more: AtomicBool::new(true),
        }
    }

    pub fn has_more(&self) -> bool {
        self.has_more.load(Ordering::Acquire)
    }

    pub fn is_loading(&self) -> bool {
        self.loading.load(Ordering::Acquire)
    }

    /// Load the page before the oldest authoritative message.
    ///
    /// Falls back to [`PaginationLoader::load_latest`] when nothing
    /// authoritative is loaded yet. On error the store is left untouched.
    pub async fn load_older(&self) -> SyncResult<PageOutcome> {
        if !self.has_more() {
            return Ok(self.noop());
        }
        let Some(_guard) = self.claim() else {
            return Ok(self.noop());
        };

        let oldest = self
            .store
            .lock()
            .oldest_authoritative()
            .and_then(|m| m.id().map(|id| (id, m.created_at)));
        let Some((before_id, oldest_at)) = oldest else {
            return self.fetch_latest().await;
        };

        let query = MessageQuery::older_than(before_id, self.page_size);
        let mut page = call_with_policy(&self.policy, || {
            self.backend.list_messages(self.conversation_id, &query)
        })
        .await
        .map_err(SyncError::LoadOlderFailed)?;

        let fetched = page.len();
        page.reverse();
        page.retain(|m| m.created_at < oldest_at);

        let inserted = self.store.lock().prepend_older(page);
        if inserted > 0 {
            self.signals.publish(SyncEvent::MessagesChanged {
                conversation_id: self.conversation_id,
                tail_changed: false,
            });
        }

        debug!(
            conversation_id = self.conversation_id,
            before_id = %before_id,
            fetched,
            inserted,
            "Older page loaded"
        );

        Ok(PageOutcome {
            fetched,
            inserted,
            has_more: self.record_page_size(fetched),
        })
    }

    /// Load the newest page (initial history).
    pub async fn load_latest(&self) -> SyncResult<PageOutcome> {
        let Some(_guard) = self.claim() else {
            return Ok(self.noop());
        };
        self.fetch_latest().await
    }

    async fn fetch_latest(&self) -> SyncResult<PageOutcome> {
        let query = MessageQuery::latest(self.page_size);
        let page = call_with_policy(&self.policy, || {
            self.backend.list_messages(self.conversation_id, &query)
        })
        .await
        .map_err(SyncError::LoadOlderFailed)?;

        let fetched = page.len();
        let outcome = self.store.lock().merge(page);
        if outcome.changed() {
            self.signals.publish(SyncEvent::MessagesChanged {
                conversation_id: self.conversation_id,
                tail_changed: outcome.tail_changed,
            });
        }

        debug!(
            conversation_id = self.conversation_id,
            fetched,
            inserted = outcome.inserted,
            "Latest page loaded"
        );

        Ok(PageOutcome {
            fetched,
            inserted: outcome.inserted.saturating_sub(outcome.collapsed),
            has_more: self.record_page_size(fetched),
        })
    }

    fn claim(&self) -> Option<LoadingGuard<'_>> {
        self.loading
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| LoadingGuard(&self.loading))
    }

    fn noop(&self) -> PageOutcome {
        PageOutcome {
            fetched: 0,
            inserted: 0,
            has_more: self.has_more(),
        }
    }

    /// A short page means the start of the conversation was reached.
    fn record_page_size(&self, fetched: usize) -> bool {
        if fetched < self.page_size && self.has_more.swap(false, Ordering::AcqRel) {
            info!(conversation_id = self.conversation_id, "History exhausted");
            self.signals.publish(SyncEvent::HistoryExhausted {
                conversation_id: self.conversation_id,
            });
        }
        self.has_more()
    }
}
