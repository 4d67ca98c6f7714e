use chat_shared::{
    domain::{ConversationId, DeliveryState, MessageKey},
    error::{ApiError, ErrorCode, ValidationError},
};
use thiserror::Error;

#[derive(Debug, Clone, Error)]
pub enum SyncError {
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error("authentication rejected: {0}")]
    Unauthorized(String),
    #[error("transport failure: {0}")]
    Transport(String),
    #[error("server rejected request: {0}")]
    Rejected(ApiError),
    #[error("invalid delivery transition {from} -> {to} for message {key}")]
    InvalidTransition {
        key: MessageKey,
        from: DeliveryState,
        to: DeliveryState,
    },
    #[error("unknown message {key} in conversation {conversation_id}")]
    UnknownMessage {
        conversation_id: ConversationId,
        key: MessageKey,
    },
    #[error("unknown conversation {0}")]
    UnknownConversation(ConversationId),
    #[error("realtime channel for conversation {0} is not open")]
    ChannelNotOpen(ConversationId),
    #[error("malformed envelope: {0}")]
    MalformedEnvelope(String),
}

impl SyncError {
    /// Recoverable without user action beyond retrying.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Transport(_) | Self::ChannelNotOpen(_) => true,
            Self::Rejected(err) => matches!(err.code, ErrorCode::Internal | ErrorCode::RateLimited),
            _ => false,
        }
    }

    /// Must be surfaced to the user; retrying will not help.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Unauthorized(_))
    }

    pub fn is_invariant_violation(&self) -> bool {
        matches!(self, Self::InvalidTransition { .. })
    }

    /// Maps a gateway error body onto the taxonomy.
    pub fn from_api(status: u16, error: ApiError) -> Self {
        match (status, error.code) {
            (401 | 403, _) | (_, ErrorCode::Unauthorized | ErrorCode::Forbidden) => {
                Self::Unauthorized(error.message)
            }
            _ => Self::Rejected(error),
        }
    }
}

impl From<reqwest::Error> for SyncError {
    fn from(err: reqwest::Error) -> Self {
        Self::Transport(err.to_string())
    }
}
