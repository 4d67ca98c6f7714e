use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{
    domain::{
        Attachment, ConversationId, ConversationKind, MessageId, MessageKey, Participant, TempId,
        UserId,
    },
    error::ValidationError,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EnvelopeKind {
    Text,
    #[serde(alias = "connection_established", alias = "connection_ack")]
    System,
    Typing,
    Read,
    Edit,
    Delete,
}

impl EnvelopeKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Text => "text",
            Self::System => "system",
            Self::Typing => "typing",
            Self::Read => "read",
            Self::Edit => "edit",
            Self::Delete => "delete",
        }
    }

    /// Kinds that never produce or change a timeline entry.
    pub fn is_ephemeral(self) -> bool {
        matches!(self, Self::System | Self::Typing | Self::Read)
    }
}

/// One frame on the realtime channel, in either direction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(rename = "type")]
    pub kind: EnvelopeKind,
    #[serde(alias = "chat_id")]
    pub conversation_id: ConversationId,
    #[serde(alias = "user_id")]
    pub sender_id: UserId,
    #[serde(default)]
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message_id: Option<MessageKey>,
    /// Temporary id the sender used, echoed back by the server once persisted.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub original_id: Option<MessageKey>,
    #[serde(deserialize_with = "flexible_timestamp::deserialize")]
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub attachments: Vec<Attachment>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub is_edited: bool,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub is_deleted: bool,
}

impl Envelope {
    pub fn outbound_text(
        conversation_id: ConversationId,
        sender_id: UserId,
        temp_id: TempId,
        content: impl Into<String>,
        attachments: Vec<Attachment>,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            kind: EnvelopeKind::Text,
            conversation_id,
            sender_id,
            content: content.into(),
            message_id: Some(MessageKey::Temp(temp_id)),
            original_id: None,
            timestamp,
            attachments,
            is_edited: false,
            is_deleted: false,
        }
    }

    pub fn control(
        kind: EnvelopeKind,
        conversation_id: ConversationId,
        sender_id: UserId,
        message_id: Option<MessageKey>,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            kind,
            conversation_id,
            sender_id,
            content: String::new(),
            message_id,
            original_id: None,
            timestamp,
            attachments: Vec::new(),
            is_edited: false,
            is_deleted: kind == EnvelopeKind::Delete,
        }
    }

    /// Structural checks that serde cannot express.
    pub fn validate(&self) -> Result<(), ValidationError> {
        match self.kind {
            EnvelopeKind::Text => {
                if self.message_id.is_none() {
                    return Err(ValidationError::MissingMessageId { kind: "text" });
                }
                if self.content.trim().is_empty() && self.attachments.is_empty() {
                    return Err(ValidationError::EmptyContent);
                }
                Ok(())
            }
            EnvelopeKind::Edit | EnvelopeKind::Delete if self.message_id.is_none() => {
                Err(ValidationError::MissingMessageId {
                    kind: self.kind.as_str(),
                })
            }
            _ => Ok(()),
        }
    }
}

/// A persisted message as returned by history fetch and by the send call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageRecord {
    #[serde(alias = "id")]
    pub message_id: MessageId,
    #[serde(alias = "chat_id")]
    pub conversation_id: ConversationId,
    pub sender_id: UserId,
    #[serde(default)]
    pub content: String,
    #[serde(
        alias = "timestamp",
        deserialize_with = "flexible_timestamp::deserialize"
    )]
    pub sent_at: DateTime<Utc>,
    #[serde(default)]
    pub attachments: Vec<Attachment>,
    #[serde(default)]
    pub is_edited: bool,
    #[serde(default, alias = "unsent", alias = "deleted_for_all")]
    pub is_deleted: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LastMessageRecord {
    pub message_id: MessageId,
    pub sender_id: UserId,
    #[serde(default)]
    pub content: String,
    #[serde(deserialize_with = "flexible_timestamp::deserialize")]
    pub sent_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversationRecord {
    #[serde(alias = "chat_id", alias = "id")]
    pub conversation_id: ConversationId,
    #[serde(default)]
    pub kind: ConversationKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default)]
    pub participants: Vec<Participant>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_message: Option<LastMessageRecord>,
    #[serde(default)]
    pub unread_count: u32,
    #[serde(deserialize_with = "flexible_timestamp::deserialize")]
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateConversationRequest {
    pub kind: ConversationKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub participant_ids: Vec<UserId>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SendMessageRequest {
    pub sender_id: UserId,
    pub content: String,
    #[serde(default)]
    pub attachments: Vec<Attachment>,
    pub idempotency_key: TempId,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EditMessageRequest {
    pub sender_id: UserId,
    pub content: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MediaUploadResponse {
    pub url: String,
}

mod flexible_timestamp {
    use chrono::{DateTime, TimeZone, Utc};
    use serde::{de::Error as _, Deserialize, Deserializer};

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum RawTimestamp {
        UnixSeconds(i64),
        Text(DateTime<Utc>),
    }

    /// Accepts unix seconds (the gateway's websocket form) or RFC 3339.
    pub fn deserialize<'de, D>(deserializer: D) -> Result<DateTime<Utc>, D::Error>
    where
        D: Deserializer<'de>,
    {
        match RawTimestamp::deserialize(deserializer)? {
            RawTimestamp::UnixSeconds(secs) => Utc
                .timestamp_opt(secs, 0)
                .single()
                .ok_or_else(|| D::Error::custom(format!("timestamp out of range: {secs}"))),
            RawTimestamp::Text(timestamp) => Ok(timestamp),
        }
    }
}
