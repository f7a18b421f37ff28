//! Client-side message synchronization for one-to-one conversations.
//!
//! A [`MessageStore`] holds the canonical list for one conversation and is fed
//! by every producer through the same idempotent merge: optimistic sends,
//! the realtime change feed, the gap-filling poller and history paging.
//! [`ConversationSync`] wires them together for a single open view.

pub mod backend;
pub mod config;
pub mod error;
pub mod logging;
pub mod models;
pub mod services;
pub mod session;
pub mod signals;
pub mod store;

pub use backend::{
    InMemoryBackend, MessageBackend, MessageQuery, Operation, ReadMarkerBackend, RealtimeEvent,
    RealtimeSubscription, RealtimeTransport, SortOrder, Unsubscribe,
};
pub use config::{ConfigError, SyncConfig};
pub use error::{BackendError, BackendResult, ErrorKind, SyncError, SyncResult};
pub use models::{
    ClientKey, Conversation, ConversationId, DeliveryState, Message, MessageId, MessageIdentity,
    NewMessage, ReadMarker, TimelineEntry, UserId,
};
pub use session::{Backends, ConversationSync};
pub use signals::{SignalBus, SubscriberId, SyncEvent};
pub use store::{MergeOutcome, MessageStore, SharedStore};
