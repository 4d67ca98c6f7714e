use chat_shared::{
    domain::{ConversationId, ConversationKind, MessageKey, Participant, UserId},
    protocol::{ConversationRecord, LastMessageRecord},
};
use chrono::{DateTime, Utc};

use crate::timeline::Message;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LastMessage {
    pub key: MessageKey,
    pub sender_id: UserId,
    pub content: String,
    pub timestamp: DateTime<Utc>,
}

impl From<&Message> for LastMessage {
    fn from(message: &Message) -> Self {
        Self {
            key: message.key.clone(),
            sender_id: message.sender_id,
            content: message.content.clone(),
            timestamp: message.created_at,
        }
    }
}

impl From<&LastMessageRecord> for LastMessage {
    fn from(record: &LastMessageRecord) -> Self {
        Self {
            key: MessageKey::Server(record.message_id.clone()),
            sender_id: record.sender_id,
            content: record.content.clone(),
            timestamp: record.sent_at,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Conversation {
    pub id: ConversationId,
    pub kind: ConversationKind,
    pub name: Option<String>,
    pub participants: Vec<Participant>,
    pub last_message: Option<LastMessage>,
    pub unread_count: u32,
    pub updated_at: DateTime<Utc>,
}

impl Conversation {
    /// Stand-in for a conversation seen before the list has been refreshed.
    pub fn placeholder(id: ConversationId, updated_at: DateTime<Utc>) -> Self {
        Self {
            id,
            kind: ConversationKind::Direct,
            name: None,
            participants: Vec::new(),
            last_message: None,
            unread_count: 0,
            updated_at,
        }
    }

    pub fn from_record(record: &ConversationRecord) -> Self {
        Self {
            id: record.conversation_id,
            kind: record.kind,
            name: record.name.clone(),
            participants: record.participants.clone(),
            last_message: record.last_message.as_ref().map(LastMessage::from),
            unread_count: record.unread_count,
            updated_at: record.updated_at,
        }
    }

    pub fn display_name(&self, me: UserId) -> String {
        match self.kind {
            ConversationKind::Group => match &self.name {
                Some(name) if !name.trim().is_empty() => name.clone(),
                _ => self
                    .participants
                    .iter()
                    .map(|participant| participant.display_name.as_str())
                    .collect::<Vec<_>>()
                    .join(", "),
            },
            ConversationKind::Direct => self
                .participants
                .iter()
                .find(|participant| participant.user_id != me)
                .map(|participant| participant.display_name.clone())
                .unwrap_or_else(|| self.id.to_string()),
        }
    }
}

/// Conversation list, most recently updated first.
#[derive(Debug, Clone, Default)]
pub struct ConversationStore {
    conversations: Vec<Conversation>,
}

impl ConversationStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn list(&self) -> &[Conversation] {
        &self.conversations
    }

    pub fn len(&self) -> usize {
        self.conversations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.conversations.is_empty()
    }

    pub fn get(&self, id: ConversationId) -> Option<&Conversation> {
        self.conversations.iter().find(|conversation| conversation.id == id)
    }

    pub fn get_mut(&mut self, id: ConversationId) -> Option<&mut Conversation> {
        self.conversations
            .iter_mut()
            .find(|conversation| conversation.id == id)
    }

    pub fn ensure(&mut self, id: ConversationId, at: DateTime<Utc>) -> &mut Conversation {
        if let Some(index) = self.index_of(id) {
            return &mut self.conversations[index];
        }
        self.conversations.push(Conversation::placeholder(id, at));
        self.reorder();
        let index = self.index_of(id).unwrap_or(self.conversations.len() - 1);
        &mut self.conversations[index]
    }

    /// Merges a server summary. The local `last_message` survives unless the
    /// server's is newer; `updated_at` never moves backwards.
    pub fn upsert(&mut self, record: &ConversationRecord) {
        let incoming = Conversation::from_record(record);
        match self.get_mut(record.conversation_id) {
            Some(existing) => {
                existing.kind = incoming.kind;
                existing.name = incoming.name;
                existing.participants = incoming.participants;
                let server_is_newer = match (&existing.last_message, &incoming.last_message) {
                    (Some(local), Some(remote)) => remote.timestamp > local.timestamp,
                    (None, Some(_)) => true,
                    _ => false,
                };
                if server_is_newer {
                    existing.last_message = incoming.last_message;
                }
                existing.unread_count = incoming.unread_count;
                existing.updated_at = existing.updated_at.max(incoming.updated_at);
            }
            None => self.conversations.push(incoming),
        }
        self.reorder();
    }

    pub fn remove(&mut self, id: ConversationId) -> Option<Conversation> {
        let index = self.index_of(id)?;
        Some(self.conversations.remove(index))
    }

    pub fn set_last_message(&mut self, id: ConversationId, last_message: Option<LastMessage>) {
        if let Some(conversation) = self.get_mut(id) {
            conversation.last_message = last_message;
        }
    }

    pub fn touch(&mut self, id: ConversationId, at: DateTime<Utc>) {
        let conversation = self.ensure(id, at);
        if at > conversation.updated_at {
            conversation.updated_at = at;
        }
        self.reorder();
    }

    fn index_of(&self, id: ConversationId) -> Option<usize> {
        self.conversations
            .iter()
            .position(|conversation| conversation.id == id)
    }

    fn reorder(&mut self) {
        self.conversations
            .sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
    }
}

#[cfg(test)]
#[path = "tests/conversations_tests.rs"]
mod tests;
