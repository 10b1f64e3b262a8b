use std::collections::BTreeMap;

use crate::model::{Message, MessageId, UserId};

/// Result of offering a message to the ledger.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ingest {
    pub is_new: bool,
}

/// In-memory record of every message seen during this session.
///
/// Keyed by message id, so redelivery (the stream and the poller can both
/// hand us the same message) is a no-op. The oldest/newest cursors are kept
/// up to date by comparison on every insert and always equal the minimum and
/// maximum ids present.
#[derive(Debug, Default, Clone)]
pub struct MessageLedger {
    messages: BTreeMap<MessageId, Message>,
    oldest: Option<MessageId>,
    newest: Option<MessageId>,
}

impl MessageLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn ingest(&mut self, message: Message) -> Ingest {
        let id = message.id;
        if self.messages.contains_key(&id) {
            return Ingest { is_new: false };
        }
        self.messages.insert(id, message);
        self.update_cursor(id);
        Ingest { is_new: true }
    }

    /// Ingests a batch in any order and returns clones of the messages that
    /// were not already present, sorted by id.
    pub fn ingest_batch<I>(&mut self, batch: I) -> Vec<Message>
    where
        I: IntoIterator<Item = Message>,
    {
        let mut added: Vec<Message> = batch
            .into_iter()
            .filter_map(|message| {
                let copy = message.clone();
                self.ingest(message).is_new.then_some(copy)
            })
            .collect();
        added.sort_by_key(|message| message.id);
        added
    }

    fn update_cursor(&mut self, id: MessageId) {
        self.oldest = Some(self.oldest.map_or(id, |oldest| oldest.min(id)));
        self.newest = Some(self.newest.map_or(id, |newest| newest.max(id)));
    }

    /// Flips `is_read`; returns false when the id is unknown or already read.
    pub fn mark_read(&mut self, id: MessageId) -> bool {
        match self.messages.get_mut(&id) {
            Some(message) if !message.is_read => {
                message.is_read = true;
                true
            }
            _ => false,
        }
    }

    pub fn oldest_id(&self) -> Option<MessageId> {
        self.oldest
    }

    pub fn newest_id(&self) -> Option<MessageId> {
        self.newest
    }

    pub fn get(&self, id: MessageId) -> Option<&Message> {
        self.messages.get(&id)
    }

    pub fn contains(&self, id: MessageId) -> bool {
        self.messages.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    /// Messages in ascending id order.
    pub fn iter(&self) -> impl Iterator<Item = &Message> {
        self.messages.values()
    }

    /// Ids of messages from other participants that have not been read yet.
    pub fn unread_from_others(&self, current_user: UserId) -> Vec<MessageId> {
        self.messages
            .values()
            .filter(|message| !message.is_read && !message.is_mine(current_user))
            .map(|message| message.id)
            .collect()
    }
}
