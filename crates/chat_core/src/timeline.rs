use std::collections::HashMap;

use chat_shared::{
    domain::{Attachment, ConversationId, DeliveryState, MessageId, MessageKey, TempId, UserId},
    protocol::MessageRecord,
};
use chrono::{DateTime, Utc};

use crate::error::SyncError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub key: MessageKey,
    pub conversation_id: ConversationId,
    pub sender_id: UserId,
    pub content: String,
    pub created_at: DateTime<Utc>,
    pub delivery: DeliveryState,
    pub attachments: Vec<Attachment>,
    pub edited: bool,
}

impl Message {
    pub fn from_record(record: &MessageRecord) -> Self {
        let mut message = Self {
            key: MessageKey::Server(record.message_id.clone()),
            conversation_id: record.conversation_id,
            sender_id: record.sender_id,
            content: record.content.clone(),
            created_at: record.sent_at,
            delivery: DeliveryState::Confirmed,
            attachments: record.attachments.clone(),
            edited: record.is_edited,
        };
        if record.is_deleted {
            message.redact();
        }
        message
    }

    pub fn is_visible(&self) -> bool {
        self.delivery != DeliveryState::Deleted
    }

    fn redact(&mut self) {
        self.delivery = DeliveryState::Deleted;
        self.content.clear();
        self.attachments.clear();
    }
}

#[derive(Debug, Clone)]
struct TimelineEntry {
    message: Message,
    sort_at: DateTime<Utc>,
    seq: u64,
}

/// Ordered, deduplicated message sequence of one conversation.
///
/// Entries sort by `(sort_at, seq)`, where `sort_at` is the timestamp the
/// entry was inserted with. Pending entries carry a monotonic local timestamp,
/// so among themselves they keep receipt order. Confirmation never moves an
/// entry. Entries are never removed except when a pending entry collapses into
/// an authoritative entry for the same send.
#[derive(Debug, Clone, Default)]
pub struct MessageTimeline {
    entries: Vec<TimelineEntry>,
    aliases: HashMap<TempId, MessageId>,
    server_aliases: HashMap<MessageId, MessageId>,
    next_seq: u64,
    last_local_at: Option<DateTime<Utc>>,
}

impl MessageTimeline {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn messages(&self) -> impl DoubleEndedIterator<Item = &Message> + '_ {
        self.entries.iter().map(|entry| &entry.message)
    }

    pub fn snapshot(&self) -> Vec<Message> {
        self.messages().cloned().collect()
    }

    /// Finds an entry by its current key, following temp -> server and
    /// secondary server id aliases.
    pub fn position(&self, key: &MessageKey) -> Option<usize> {
        if let Some(index) = self.entries.iter().position(|entry| &entry.message.key == key) {
            return Some(index);
        }
        let server_id = match key {
            MessageKey::Temp(temp_id) => self.aliases.get(temp_id)?,
            MessageKey::Server(message_id) => self.server_aliases.get(message_id)?,
        };
        self.entries
            .iter()
            .position(|entry| entry.message.key.server_id() == Some(server_id))
    }

    pub fn get(&self, key: &MessageKey) -> Option<&Message> {
        self.position(key).map(|index| &self.entries[index].message)
    }

    pub fn at(&self, index: usize) -> &Message {
        &self.entries[index].message
    }

    pub fn alias_of(&self, temp_id: &TempId) -> Option<&MessageId> {
        self.aliases.get(temp_id)
    }

    /// Next local timestamp for a pending entry, never earlier than the last.
    pub fn local_timestamp(&mut self, now: DateTime<Utc>) -> DateTime<Utc> {
        let stamp = match self.last_local_at {
            Some(last) if last > now => last,
            _ => now,
        };
        self.last_local_at = Some(stamp);
        stamp
    }

    pub fn insert(&mut self, message: Message) -> usize {
        let seq = self.take_seq();
        let key = message.key.clone();
        let sort_at = message.created_at;
        self.entries.push(TimelineEntry {
            message,
            sort_at,
            seq,
        });
        self.sort();
        self.index_of_current(&key)
    }

    /// Replaces a temp key with the authoritative id. The entry stays where it
    /// is; only the displayed timestamp takes the authoritative value.
    pub fn confirm(
        &mut self,
        index: usize,
        message_id: MessageId,
        authoritative_at: DateTime<Utc>,
    ) -> Result<usize, SyncError> {
        self.transition(index, DeliveryState::Confirmed)?;
        let entry = &mut self.entries[index];
        if let Some(temp_id) = entry.message.key.temp_id() {
            self.aliases.insert(temp_id, message_id.clone());
        }
        entry.message.key = MessageKey::Server(message_id);
        entry.message.created_at = authoritative_at;
        Ok(index)
    }

    /// Records a second server id for an already confirmed entry, as when the
    /// realtime echo and the persistence ack carry different ids for one send.
    /// Returns `false` when the id is already known.
    pub fn alias_server(&mut self, index: usize, extra: MessageId) -> bool {
        let Some(current) = self.entries[index].message.key.server_id() else {
            return false;
        };
        if current == &extra || self.server_aliases.contains_key(&extra) {
            return false;
        }
        let current = current.clone();
        self.server_aliases.insert(extra, current);
        true
    }

    pub fn mark_failed(&mut self, index: usize) -> Result<(), SyncError> {
        self.transition(index, DeliveryState::Failed)
    }

    /// Moves a failed entry back to pending under a fresh temp id, sequence and
    /// local timestamp.
    pub fn resubmit(
        &mut self,
        index: usize,
        temp_id: TempId,
        now: DateTime<Utc>,
    ) -> Result<usize, SyncError> {
        self.transition(index, DeliveryState::Pending)?;
        let seq = self.take_seq();
        let stamp = self.local_timestamp(now);
        let entry = &mut self.entries[index];
        entry.seq = seq;
        entry.sort_at = stamp;
        entry.message.key = MessageKey::Temp(temp_id);
        entry.message.created_at = stamp;
        self.sort();
        Ok(self.index_of_current(&MessageKey::Temp(temp_id)))
    }

    /// Redacts a confirmed entry. Already deleted entries are left alone and
    /// `false` is returned.
    pub fn tombstone(&mut self, index: usize) -> Result<bool, SyncError> {
        if self.entries[index].message.delivery == DeliveryState::Deleted {
            return Ok(false);
        }
        self.transition(index, DeliveryState::Deleted)?;
        self.entries[index].message.redact();
        Ok(true)
    }

    /// Applies an edit to a confirmed entry. Returns `false` when nothing changed.
    pub fn apply_edit(&mut self, index: usize, content: &str) -> bool {
        let message = &mut self.entries[index].message;
        if message.delivery != DeliveryState::Confirmed {
            return false;
        }
        if message.edited && message.content == content {
            return false;
        }
        message.content = content.to_string();
        message.edited = true;
        true
    }

    /// Drops a pending entry whose send turned out to be an existing entry.
    pub fn collapse_into(&mut self, index: usize, message_id: MessageId) {
        let removed = self.entries.remove(index);
        if let Some(temp_id) = removed.message.key.temp_id() {
            self.aliases.insert(temp_id, message_id);
        }
    }

    pub fn latest_visible(&self) -> Option<&Message> {
        self.messages().rev().find(|message| message.is_visible())
    }

    pub fn newest_confirmed_id(&self) -> Option<&MessageId> {
        self.messages()
            .rev()
            .filter(|message| message.delivery == DeliveryState::Confirmed)
            .find_map(|message| message.key.server_id())
    }

    /// Cursor for loading older history.
    pub fn oldest_server_id(&self) -> Option<&MessageId> {
        self.messages().find_map(|message| message.key.server_id())
    }

    fn transition(&mut self, index: usize, next: DeliveryState) -> Result<(), SyncError> {
        let message = &mut self.entries[index].message;
        if !message.delivery.can_transition_to(next) {
            return Err(SyncError::InvalidTransition {
                key: message.key.clone(),
                from: message.delivery,
                to: next,
            });
        }
        message.delivery = next;
        Ok(())
    }

    fn take_seq(&mut self) -> u64 {
        let seq = self.next_seq;
        self.next_seq += 1;
        seq
    }

    fn sort(&mut self) {
        self.entries
            .sort_by(|a, b| (a.sort_at, a.seq).cmp(&(b.sort_at, b.seq)));
    }

    fn index_of_current(&self, key: &MessageKey) -> usize {
        self.entries
            .iter()
            .position(|entry| &entry.message.key == key)
            .unwrap_or(self.entries.len().saturating_sub(1))
    }
}

#[cfg(test)]
#[path = "tests/timeline_tests.rs"]
mod tests;
