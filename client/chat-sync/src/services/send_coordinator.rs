//! Outgoing messages: optimistic placeholder, idempotent insert, one fallback,
//! rollback on failure.

use chrono::Utc;
use resilience::{send_policy, CallPolicy};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::call_with_policy;
use crate::backend::MessageBackend;
use crate::config::SyncConfig;
use crate::error::{SyncError, SyncResult};
use crate::models::{ClientKey, ConversationId, Message, NewMessage, UserId};
use crate::signals::{SignalBus, SyncEvent};
use crate::store::SharedStore;

pub struct SendCoordinator {
    conversation_id: ConversationId,
    local_user: UserId,
    store: SharedStore,
    backend: Arc<dyn MessageBackend>,
    signals: SignalBus<SyncEvent>,
    max_message_chars: usize,
    policy: CallPolicy,
    in_flight: AtomicBool,
}

/// Releases the in-flight slot on every exit path.
struct InFlightGuard<'a>(&'a AtomicBool);

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

impl SendCoordinator {
    pub fn new(
        conversation_id: ConversationId,
        local_user: UserId,
        store: SharedStore,
        backend: Arc<dyn MessageBackend>,
        signals: SignalBus<SyncEvent>,
        config: &SyncConfig,
    ) -> Self {
        Self {
            conversation_id,
            local_user,
            store,
            backend,
            signals,
            max_message_chars: config.max_message_chars,
            policy: send_policy(config.request_timeout),
            in_flight: AtomicBool::new(false),
        }
    }

    pub fn is_in_flight(&self) -> bool {
        self.in_flight.load(Ordering::Acquire)
    }

    /// Send `content` and return the stored message.
    ///
    /// The placeholder is visible in the store before the first network call.
    /// Only one send may be pending; a concurrent call fails with
    /// [`SyncError::SendInFlight`] without touching the store.
    pub async fn send(&self, content: &str) -> SyncResult<Message> {
        let content = prepare_content(content, self.max_message_chars)?;

        if self
            .in_flight
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            debug!(conversation_id = self.conversation_id, "Send rejected, another is in flight");
            return Err(SyncError::SendInFlight);
        }
        let _guard = InFlightGuard(&self.in_flight);

        let client_key = ClientKey::generate();
        let placeholder = Message::placeholder(
            self.conversation_id,
            self.local_user,
            content.clone(),
            Utc::now(),
            client_key.clone(),
        );
        let placeholder_identity = placeholder.identity.clone();
        self.merge(placeholder);

        let draft = NewMessage {
            conversation_id: self.conversation_id,
            sender: self.local_user,
            content,
            client_key: client_key.clone(),
        };

        let primary = match call_with_policy(&self.policy, || {
            self.backend.insert_message_idempotent(&draft)
        })
        .await
        {
            Ok(stored) => {
                debug!(
                    conversation_id = self.conversation_id,
                    client_key = %client_key,
                    message_id = ?stored.id(),
                    "Message stored"
                );
                self.merge(stored.clone());
                return Ok(stored);
            }
            Err(e) => e,
        };

        warn!(
            conversation_id = self.conversation_id,
            client_key = %client_key,
            error = %primary,
            "Idempotent insert failed, falling back to plain insert"
        );

        match call_with_policy(&self.policy, || self.backend.insert_message(&draft)).await {
            Ok(stored) => {
                info!(
                    conversation_id = self.conversation_id,
                    client_key = %client_key,
                    "Message stored through fallback insert"
                );
                self.merge(stored.clone());
                Ok(stored)
            }
            Err(fallback) => {
                let outcome = {
                    let mut store = self.store.lock();
                    let before = store.tail().cloned();
                    let removed = store.remove(&placeholder_identity).is_some();
                    (removed, before.as_ref() != store.tail())
                };

                warn!(
                    conversation_id = self.conversation_id,
                    client_key = %client_key,
                    primary = %primary,
                    fallback = %fallback,
                    rolled_back = outcome.0,
                    "Send failed, placeholder rolled back"
                );

                if outcome.0 {
                    self.signals.publish(SyncEvent::MessagesChanged {
                        conversation_id: self.conversation_id,
                        tail_changed: outcome.1,
                    });
                }
                self.signals.publish(SyncEvent::SendFailed {
                    conversation_id: self.conversation_id,
                    client_key,
                    reason: fallback.to_string(),
                });

                Err(SyncError::SendFailed { primary, fallback })
            }
        }
    }

    fn merge(&self, message: Message) {
        let outcome = self.store.lock().merge([message]);
        if outcome.changed() {
            self.signals.publish(SyncEvent::MessagesChanged {
                conversation_id: self.conversation_id,
                tail_changed: outcome.tail_changed,
            });
        }
    }
}

/// Trim, reject empty, truncate to `max_chars` Unicode scalar values.
fn prepare_content(raw: &str, max_chars: usize) -> SyncResult<String> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(SyncError::EmptyMessage);
    }
    Ok(trimmed.chars().take(max_chars).collect())
}
