//! # Message Store
//!
//! Canonical, deduplicated, ordered message list for one conversation.
//!
//! Every producer (optimistic sends, realtime inserts, poll ticks, history
//! pages) goes through [`MessageStore::merge`] or
//! [`MessageStore::prepend_older`]. Both are pure reducers: no I/O, no failure,
//! and merging the same payload twice leaves the second call without effect.
//!
//! ## Merge rules
//!
//! 1. Same identity: the incoming copy replaces the stored one.
//! 2. Incoming `client_key` matches a stored placeholder: the placeholder is
//!    replaced by the incoming (authoritative) message.
//! 3. Otherwise the incoming message is appended.
//!
//! After folding, duplicates are collapsed (identity: most recently merged wins;
//! client key: authoritative beats placeholder, then most recently merged) and
//! the list is re-sorted by `(created_at, identity)`.

use parking_lot::Mutex;
use std::cmp::Ordering;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use crate::models::{ClientKey, ConversationId, Message, MessageIdentity, UserId};

pub type SharedStore = Arc<Mutex<MessageStore>>;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MergeOutcome {
    /// The newest visible message differs from before the merge
    pub tail_changed: bool,
    pub inserted: usize,
    /// Replacements whose content actually differed
    pub replaced: usize,
    /// Entries dropped while collapsing duplicates
    pub collapsed: usize,
    /// The visible list (identities, order or content) differs from before the merge
    pub list_changed: bool,
}

impl MergeOutcome {
    pub fn changed(&self) -> bool {
        self.list_changed
    }
}

#[derive(Debug, Clone)]
struct Entry {
    message: Message,
    // Merge sequence; higher means merged more recently
    seq: u64,
}

#[derive(Debug)]
pub struct MessageStore {
    conversation_id: ConversationId,
    entries: Vec<Entry>,
    next_seq: u64,
}

impl MessageStore {
    pub fn new(conversation_id: ConversationId) -> Self {
        Self {
            conversation_id,
            entries: Vec::new(),
            next_seq: 0,
        }
    }

    pub fn shared(conversation_id: ConversationId) -> SharedStore {
        Arc::new(Mutex::new(Self::new(conversation_id)))
    }

    pub fn conversation_id(&self) -> ConversationId {
        self.conversation_id
    }

    pub fn merge<I>(&mut self, incoming: I) -> MergeOutcome
    where
        I: IntoIterator<Item = Message>,
    {
        let before = self.snapshot();
        let mut outcome = MergeOutcome::default();

        for message in incoming {
            if message.conversation_id != self.conversation_id {
                tracing::debug!(
                    conversation_id = self.conversation_id,
                    foreign_conversation_id = message.conversation_id,
                    "Ignoring message for another conversation"
                );
                continue;
            }

            let seq = self.bump_seq();

            if let Some(pos) = self
                .entries
                .iter()
                .position(|e| e.message.identity == message.identity)
            {
                if self.entries[pos].message != message {
                    outcome.replaced += 1;
                }
                self.entries[pos] = Entry { message, seq };
                continue;
            }

            if let Some(pos) = message
                .client_key
                .as_ref()
                .and_then(|key| self.placeholder_position(key))
            {
                outcome.replaced += 1;
                self.entries[pos] = Entry { message, seq };
                continue;
            }

            self.entries.push(Entry { message, seq });
            outcome.inserted += 1;
        }

        outcome.collapsed = self.normalize();
        outcome.tail_changed = before.last() != self.tail();
        outcome.list_changed = !self.iter().eq(before.iter());
        outcome
    }

    /// Roll back a message (normally a failed optimistic send).
    pub fn remove(&mut self, identity: &MessageIdentity) -> Option<Message> {
        let pos = self
            .entries
            .iter()
            .position(|e| &e.message.identity == identity)?;
        Some(self.entries.remove(pos).message)
    }

    /// Insert history strictly older than the current head.
    ///
    /// Messages already present (by identity or client key) and messages that
    /// are not older than the current oldest entry are skipped, so the tail is
    /// never affected. Returns the number of messages inserted.
    pub fn prepend_older<I>(&mut self, messages: I) -> usize
    where
        I: IntoIterator<Item = Message>,
    {
        let head = self.entries.first().map(|e| e.message.clone());
        let mut identities: HashSet<MessageIdentity> = self
            .entries
            .iter()
            .map(|e| e.message.identity.clone())
            .collect();
        let mut keys: HashSet<ClientKey> = self
            .entries
            .iter()
            .filter_map(|e| e.message.client_key.clone())
            .collect();

        let mut older = Vec::new();
        for message in messages {
            if message.conversation_id != self.conversation_id
                || identities.contains(&message.identity)
                || message
                    .client_key
                    .as_ref()
                    .is_some_and(|key| keys.contains(key))
            {
                continue;
            }
            if let Some(head) = &head {
                if message.timeline_cmp(head) != Ordering::Less {
                    tracing::debug!(
                        conversation_id = self.conversation_id,
                        identity = %message.identity,
                        "Skipping history message that is not older than the head"
                    );
                    continue;
                }
            }

            identities.insert(message.identity.clone());
            if let Some(key) = &message.client_key {
                keys.insert(key.clone());
            }
            older.push(message);
        }

        let inserted = older.len();
        if inserted > 0 {
            for message in older {
                let seq = self.bump_seq();
                self.entries.push(Entry { message, seq });
            }
            self.sort();
        }
        inserted
    }

    pub fn snapshot(&self) -> Vec<Message> {
        self.entries.iter().map(|e| e.message.clone()).collect()
    }

    pub fn iter(&self) -> impl DoubleEndedIterator<Item = &Message> {
        self.entries.iter().map(|e| &e.message)
    }

    pub fn tail(&self) -> Option<&Message> {
        self.entries.last().map(|e| &e.message)
    }

    pub fn head(&self) -> Option<&Message> {
        self.entries.first().map(|e| &e.message)
    }

    pub fn newest_authoritative(&self) -> Option<&Message> {
        self.iter().rev().find(|m| !m.is_placeholder())
    }

    pub fn oldest_authoritative(&self) -> Option<&Message> {
        self.iter().find(|m| !m.is_placeholder())
    }

    pub fn own_messages(&self, user_id: UserId) -> impl Iterator<Item = &Message> {
        self.iter().filter(move |m| m.sender == user_id)
    }

    pub fn contains(&self, identity: &MessageIdentity) -> bool {
        self.entries.iter().any(|e| &e.message.identity == identity)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn bump_seq(&mut self) -> u64 {
        self.next_seq += 1;
        self.next_seq
    }

    fn placeholder_position(&self, key: &ClientKey) -> Option<usize> {
        self.entries
            .iter()
            .position(|e| e.message.is_placeholder() && e.message.client_key.as_ref() == Some(key))
    }

    /// Collapse duplicate identities and client keys, then sort. Returns the number of dropped entries.
    fn normalize(&mut self) -> usize {
        let mut identity_winner: HashMap<MessageIdentity, usize> = HashMap::new();
        for (idx, entry) in self.entries.iter().enumerate() {
            identity_winner
                .entry(entry.message.identity.clone())
                .and_modify(|winner| {
                    if self.entries[*winner].seq < entry.seq {
                        *winner = idx;
                    }
                })
                .or_insert(idx);
        }

        let mut key_winner: HashMap<ClientKey, usize> = HashMap::new();
        for (idx, entry) in self.entries.iter().enumerate() {
            if identity_winner.get(&entry.message.identity) != Some(&idx) {
                continue;
            }
            let Some(key) = &entry.message.client_key else {
                continue;
            };
            let replace = match key_winner.get(key) {
                Some(&current) => outranks(entry, &self.entries[current]),
                None => true,
            };
            if replace {
                key_winner.insert(key.clone(), idx);
            }
        }

        let keep: Vec<bool> = self
            .entries
            .iter()
            .enumerate()
            .map(|(idx, entry)| {
                identity_winner.get(&entry.message.identity) == Some(&idx)
                    && entry
                        .message
                        .client_key
                        .as_ref()
                        .map_or(true, |key| key_winner.get(key) == Some(&idx))
            })
            .collect();

        let before = self.entries.len();
        let mut flags = keep.into_iter();
        self.entries.retain(|_| flags.next().unwrap_or(true));
        let dropped = before - self.entries.len();

        self.sort();
        dropped
    }

    fn sort(&mut self) {
        self.entries
            .sort_by(|a, b| a.message.timeline_cmp(&b.message));
    }
}

/// Client-key tie-break: authoritative beats placeholder, then the later merge wins.
fn outranks(candidate: &Entry, current: &Entry) -> bool {
    match (candidate.message.is_placeholder(), current.message.is_placeholder()) {
        (false, true) => true,
        (true, false) => false,
        _ => candidate.seq > current.seq,
    }
}
