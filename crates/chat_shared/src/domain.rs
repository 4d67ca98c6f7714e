use std::{fmt, str::FromStr};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::ValidationError;

/// Prefix that marks a client-generated, not yet persisted message id.
pub const TEMP_ID_PREFIX: &str = "temp-";

macro_rules! id_newtype {
    ($name:ident, $label:literal) => {
        #[derive(
            Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
        )]
        #[serde(transparent)]
        pub struct $name(pub Uuid);

        impl $name {
            pub fn new_v4() -> Self {
                Self(Uuid::new_v4())
            }

            pub fn parse(raw: &str) -> Result<Self, ValidationError> {
                Uuid::parse_str(raw.trim())
                    .map(Self)
                    .map_err(|_| ValidationError::MalformedId {
                        kind: $label,
                        value: raw.to_string(),
                    })
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                self.0.fmt(f)
            }
        }

        impl FromStr for $name {
            type Err = ValidationError;

            fn from_str(raw: &str) -> Result<Self, Self::Err> {
                Self::parse(raw)
            }
        }
    };
}

id_newtype!(UserId, "user");
id_newtype!(ConversationId, "conversation");

/// Authoritative message id assigned by the server. Opaque to the client.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MessageId(pub String);

impl MessageId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Client-unique provisional id, rendered as `temp-<uuid>` on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TempId(pub Uuid);

impl TempId {
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn parse(raw: &str) -> Result<Self, ValidationError> {
        raw.strip_prefix(TEMP_ID_PREFIX)
            .and_then(|rest| Uuid::parse_str(rest).ok())
            .map(Self)
            .ok_or_else(|| ValidationError::MalformedId {
                kind: "temporary message",
                value: raw.to_string(),
            })
    }
}

impl fmt::Display for TempId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{TEMP_ID_PREFIX}{}", self.0)
    }
}

impl Serialize for TempId {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for TempId {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Self::parse(&raw).map_err(serde::de::Error::custom)
    }
}

/// Identity of a timeline entry: provisional until the server confirms it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub enum MessageKey {
    Temp(TempId),
    Server(MessageId),
}

impl MessageKey {
    /// Classifies a raw wire id. The `temp-` prefix only decides the form of
    /// the key; it plays no part in duplicate detection.
    pub fn classify(raw: &str) -> Result<Self, ValidationError> {
        let raw = raw.trim();
        if raw.is_empty() {
            return Err(ValidationError::MalformedId {
                kind: "message",
                value: String::new(),
            });
        }
        if raw.starts_with(TEMP_ID_PREFIX) {
            return TempId::parse(raw).map(Self::Temp);
        }
        Ok(Self::Server(MessageId(raw.to_string())))
    }

    pub fn is_provisional(&self) -> bool {
        matches!(self, Self::Temp(_))
    }

    pub fn temp_id(&self) -> Option<TempId> {
        match self {
            Self::Temp(temp_id) => Some(*temp_id),
            Self::Server(_) => None,
        }
    }

    pub fn server_id(&self) -> Option<&MessageId> {
        match self {
            Self::Temp(_) => None,
            Self::Server(message_id) => Some(message_id),
        }
    }
}

impl fmt::Display for MessageKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Temp(temp_id) => temp_id.fmt(f),
            Self::Server(message_id) => message_id.fmt(f),
        }
    }
}

impl From<MessageKey> for String {
    fn from(value: MessageKey) -> Self {
        value.to_string()
    }
}

impl TryFrom<String> for MessageKey {
    type Error = ValidationError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::classify(&value)
    }
}

impl From<TempId> for MessageKey {
    fn from(value: TempId) -> Self {
        Self::Temp(value)
    }
}

impl From<MessageId> for MessageKey {
    fn from(value: MessageId) -> Self {
        Self::Server(value)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConversationKind {
    #[default]
    Direct,
    Group,
}

/// Lifecycle of a timeline entry.
///
/// ```text
/// pending -> confirmed -> deleted
///    |  ^
///    v  | (retry, new temp id)
///  failed
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryState {
    Pending,
    Confirmed,
    Failed,
    Deleted,
}

impl DeliveryState {
    pub fn can_transition_to(self, next: DeliveryState) -> bool {
        matches!(
            (self, next),
            (Self::Pending, Self::Confirmed)
                | (Self::Pending, Self::Failed)
                | (Self::Failed, Self::Pending)
                | (Self::Confirmed, Self::Deleted)
        )
    }

    pub fn is_terminal(self) -> bool {
        self == Self::Deleted
    }
}

impl fmt::Display for DeliveryState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Pending => "pending",
            Self::Confirmed => "confirmed",
            Self::Failed => "failed",
            Self::Deleted => "deleted",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttachmentKind {
    Image,
    Video,
    Audio,
    #[serde(other)]
    File,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attachment {
    #[serde(rename = "type", alias = "media_type")]
    pub kind: AttachmentKind,
    #[serde(alias = "media_url")]
    pub url: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Participant {
    pub user_id: UserId,
    #[serde(alias = "username")]
    pub display_name: String,
}
