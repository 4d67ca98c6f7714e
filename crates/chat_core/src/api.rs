use async_trait::async_trait;
use chat_shared::{
    domain::{ConversationId, MessageId, UserId},
    error::{ApiError, ErrorCode, ErrorResponse},
    protocol::{
        ConversationRecord, CreateConversationRequest, EditMessageRequest, MessageRecord,
        SendMessageRequest,
    },
};
use reqwest::{Client, RequestBuilder, Response};
use serde::{de::DeserializeOwned, Deserialize, Serialize};

use crate::error::SyncError;

/// REST collaborator for conversations and message persistence.
#[async_trait]
pub trait ConversationApi: Send + Sync {
    async fn list_conversations(
        &self,
        limit: u32,
        offset: u32,
    ) -> Result<Vec<ConversationRecord>, SyncError>;
    async fn fetch_messages(
        &self,
        conversation_id: ConversationId,
        limit: u32,
        before: Option<MessageId>,
    ) -> Result<Vec<MessageRecord>, SyncError>;
    async fn create_conversation(
        &self,
        request: CreateConversationRequest,
    ) -> Result<ConversationRecord, SyncError>;
    async fn delete_conversation(&self, conversation_id: ConversationId) -> Result<(), SyncError>;
    /// `request.idempotency_key` lets the server drop replays of the same send.
    async fn send_message(
        &self,
        conversation_id: ConversationId,
        request: SendMessageRequest,
    ) -> Result<MessageRecord, SyncError>;
    async fn unsend_message(
        &self,
        conversation_id: ConversationId,
        message_id: &MessageId,
    ) -> Result<(), SyncError>;
    async fn edit_message(
        &self,
        conversation_id: ConversationId,
        message_id: &MessageId,
        request: EditMessageRequest,
    ) -> Result<MessageRecord, SyncError>;
}

pub struct MissingConversationApi;

fn unavailable() -> SyncError {
    SyncError::Transport("conversation api unavailable".into())
}

#[async_trait]
impl ConversationApi for MissingConversationApi {
    async fn list_conversations(&self, _: u32, _: u32) -> Result<Vec<ConversationRecord>, SyncError> {
        Err(unavailable())
    }

    async fn fetch_messages(
        &self,
        _: ConversationId,
        _: u32,
        _: Option<MessageId>,
    ) -> Result<Vec<MessageRecord>, SyncError> {
        Err(unavailable())
    }

    async fn create_conversation(
        &self,
        _: CreateConversationRequest,
    ) -> Result<ConversationRecord, SyncError> {
        Err(unavailable())
    }

    async fn delete_conversation(&self, _: ConversationId) -> Result<(), SyncError> {
        Err(unavailable())
    }

    async fn send_message(
        &self,
        _: ConversationId,
        _: SendMessageRequest,
    ) -> Result<MessageRecord, SyncError> {
        Err(unavailable())
    }

    async fn unsend_message(&self, _: ConversationId, _: &MessageId) -> Result<(), SyncError> {
        Err(unavailable())
    }

    async fn edit_message(
        &self,
        _: ConversationId,
        _: &MessageId,
        _: EditMessageRequest,
    ) -> Result<MessageRecord, SyncError> {
        Err(unavailable())
    }
}

#[derive(Serialize)]
struct ListConversationsQuery {
    user_id: UserId,
    limit: u32,
    offset: u32,
}

#[derive(Serialize)]
struct ListMessagesQuery {
    user_id: UserId,
    limit: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    before: Option<MessageId>,
}

#[derive(Serialize)]
struct UserQuery {
    user_id: UserId,
}

/// The gateway wraps payloads as `{"success":true,"data":...}`; bare bodies
/// are accepted too.
#[derive(Deserialize)]
#[serde(untagged)]
enum Payload<T> {
    Wrapped { data: T },
    Bare(T),
}

impl<T> Payload<T> {
    fn into_inner(self) -> T {
        match self {
            Self::Wrapped { data } => data,
            Self::Bare(value) => value,
        }
    }
}

pub struct HttpConversationApi {
    http: Client,
    base_url: String,
    user_id: UserId,
    token: Option<String>,
}

impl HttpConversationApi {
    pub fn new(base_url: impl Into<String>, user_id: UserId, token: Option<String>) -> Self {
        Self {
            http: Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            user_id,
            token,
        }
    }

    fn authorized(&self, request: RequestBuilder) -> RequestBuilder {
        match &self.token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }

    fn user(&self) -> UserQuery {
        UserQuery {
            user_id: self.user_id,
        }
    }
}

async fn check(response: Response) -> Result<Response, SyncError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    let error = serde_json::from_str::<ErrorResponse>(&body)
        .map(|body| body.error)
        .unwrap_or_else(|_| {
            let code = if status.is_server_error() {
                ErrorCode::Internal
            } else {
                ErrorCode::Unknown
            };
            ApiError::new(code, format!("{status}: {body}"))
        });
    Err(SyncError::from_api(status.as_u16(), error))
}

async fn decode<T: DeserializeOwned>(response: Response) -> Result<T, SyncError> {
    let payload: Payload<T> = check(response).await?.json().await?;
    Ok(payload.into_inner())
}

#[async_trait]
impl ConversationApi for HttpConversationApi {
    async fn list_conversations(
        &self,
        limit: u32,
        offset: u32,
    ) -> Result<Vec<ConversationRecord>, SyncError> {
        let request = self
            .http
            .get(format!("{}/chats", self.base_url))
            .query(&ListConversationsQuery {
                user_id: self.user_id,
                limit: limit.clamp(1, 100),
                offset,
            });
        decode(self.authorized(request).send().await?).await
    }

    async fn fetch_messages(
        &self,
        conversation_id: ConversationId,
        limit: u32,
        before: Option<MessageId>,
    ) -> Result<Vec<MessageRecord>, SyncError> {
        let request = self
            .http
            .get(format!("{}/chats/{conversation_id}/messages", self.base_url))
            .query(&ListMessagesQuery {
                user_id: self.user_id,
                limit: limit.clamp(1, 100),
                before,
            });
        decode(self.authorized(request).send().await?).await
    }

    async fn create_conversation(
        &self,
        request: CreateConversationRequest,
    ) -> Result<ConversationRecord, SyncError> {
        let request = self
            .http
            .post(format!("{}/chats", self.base_url))
            .query(&self.user())
            .json(&request);
        decode(self.authorized(request).send().await?).await
    }

    async fn delete_conversation(&self, conversation_id: ConversationId) -> Result<(), SyncError> {
        let request = self
            .http
            .delete(format!("{}/chats/{conversation_id}", self.base_url))
            .query(&self.user());
        check(self.authorized(request).send().await?).await?;
        Ok(())
    }

    async fn send_message(
        &self,
        conversation_id: ConversationId,
        request: SendMessageRequest,
    ) -> Result<MessageRecord, SyncError> {
        let request = self
            .http
            .post(format!("{}/chats/{conversation_id}/messages", self.base_url))
            .json(&request);
        decode(self.authorized(request).send().await?).await
    }

    async fn unsend_message(
        &self,
        conversation_id: ConversationId,
        message_id: &MessageId,
    ) -> Result<(), SyncError> {
        let request = self
            .http
            .delete(format!(
                "{}/chats/{conversation_id}/messages/{message_id}",
                self.base_url
            ))
            .query(&self.user());
        check(self.authorized(request).send().await?).await?;
        Ok(())
    }

    async fn edit_message(
        &self,
        conversation_id: ConversationId,
        message_id: &MessageId,
        request: EditMessageRequest,
    ) -> Result<MessageRecord, SyncError> {
        let request = self
            .http
            .put(format!(
                "{}/chats/{conversation_id}/messages/{message_id}",
                self.base_url
            ))
            .json(&request);
        decode(self.authorized(request).send().await?).await
    }
}

#[cfg(test)]
#[path = "tests/api_tests.rs"]
mod tests;
