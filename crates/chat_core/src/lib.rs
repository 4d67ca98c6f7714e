use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use chat_shared::{
    domain::{Attachment, ConversationId, ConversationKind, MessageKey, TempId, UserId},
    protocol::{CreateConversationRequest, Envelope, EnvelopeKind},
};
use chrono::Utc;
use tokio::{sync::broadcast, task::JoinHandle};
use tokio_stream::{wrappers::BroadcastStream, Stream, StreamExt};
use tracing::{debug, info, warn};

pub mod api;
pub mod channel;
pub mod config;
pub mod conversations;
pub mod error;
mod hub;
pub mod media;
pub mod reconciler;
pub mod recent_sends;
pub mod send_pipeline;
pub mod timeline;
pub mod transport;
pub mod unread;

pub use api::{ConversationApi, HttpConversationApi, MissingConversationApi};
pub use channel::{ChannelConnector, ChannelStatus, MissingChannelConnector, RealtimeChannelManager};
pub use config::{load_settings, Settings};
pub use conversations::Conversation;
pub use error::SyncError;
pub use media::{HttpMediaUploader, MediaUpload, MediaUploader, MissingMediaUploader};
pub use reconciler::SyncUpdate;
pub use send_pipeline::{PendingSend, SendOutcome};
pub use timeline::Message;
pub use transport::WsChannelConnector;

use hub::SyncHub;
use reconciler::{Reconciler, ReconcilerConfig};
use send_pipeline::OptimisticSendPipeline;

#[derive(Debug, Clone)]
pub enum ClientEvent {
    /// A mutation was accepted; carries the projections to redraw.
    Updated(SyncUpdate),
    ChannelStatus {
        conversation_id: ConversationId,
        status: ChannelStatus,
    },
    Typing {
        conversation_id: ConversationId,
        sender_id: UserId,
    },
    ReadReceipt {
        conversation_id: ConversationId,
        sender_id: UserId,
        message_id: Option<MessageKey>,
    },
    SendFailed {
        conversation_id: ConversationId,
        temp_id: TempId,
        reason: String,
    },
    Error(String),
}

#[async_trait]
pub trait ClientHandle: Send + Sync {
    async fn refresh_conversations(&self) -> Result<usize, SyncError>;
    async fn create_conversation(
        &self,
        kind: ConversationKind,
        name: Option<String>,
        participant_ids: Vec<UserId>,
    ) -> Result<ConversationId, SyncError>;
    async fn delete_conversation(&self, conversation_id: ConversationId) -> Result<(), SyncError>;
    async fn select_conversation(&self, conversation_id: ConversationId) -> Result<(), SyncError>;
    async fn load_older(&self, conversation_id: ConversationId) -> Result<usize, SyncError>;
    async fn send(
        &self,
        conversation_id: ConversationId,
        content: String,
    ) -> Result<PendingSend, SyncError>;
    async fn send_with_media(
        &self,
        conversation_id: ConversationId,
        content: String,
        uploads: Vec<MediaUpload>,
    ) -> Result<PendingSend, SyncError>;
    async fn retry(
        &self,
        conversation_id: ConversationId,
        temp_id: TempId,
    ) -> Result<PendingSend, SyncError>;
    async fn unsend(
        &self,
        conversation_id: ConversationId,
        key: MessageKey,
    ) -> Result<(), SyncError>;
    async fn edit(
        &self,
        conversation_id: ConversationId,
        key: MessageKey,
        content: String,
    ) -> Result<(), SyncError>;
    async fn reconnect(&self, conversation_id: ConversationId) -> Result<(), SyncError>;
    async fn disconnect_all(&self);
    async fn timeline(&self, conversation_id: ConversationId) -> Vec<Message>;
    async fn conversations(&self) -> Vec<Conversation>;
    async fn channel_status(&self, conversation_id: ConversationId) -> ChannelStatus;
    fn subscribe_events(&self) -> broadcast::Receiver<ClientEvent>;
}

pub struct ChatClient {
    me: UserId,
    settings: Settings,
    hub: Arc<SyncHub>,
    api: Arc<dyn ConversationApi>,
    channels: Arc<RealtimeChannelManager>,
    pipeline: Arc<OptimisticSendPipeline>,
    inbound_pump: JoinHandle<()>,
}

impl ChatClient {
    /// HTTP and websocket collaborators built from `settings`.
    pub fn connect_http(settings: Settings, me: UserId) -> Result<Arc<Self>> {
        let api_base = settings.api_base();
        let realtime_base = settings.realtime_base()?;
        let token = settings.auth_token.clone();
        Ok(Self::new_with_dependencies(
            settings,
            me,
            Arc::new(HttpConversationApi::new(api_base.clone(), me, token.clone())),
            Arc::new(WsChannelConnector::new(realtime_base, me, token.clone())),
            Arc::new(HttpMediaUploader::new(api_base, me, token)),
        ))
    }

    pub fn new_with_dependencies(
        settings: Settings,
        me: UserId,
        api: Arc<dyn ConversationApi>,
        connector: Arc<dyn ChannelConnector>,
        media: Arc<dyn MediaUploader>,
    ) -> Arc<Self> {
        let reconciler = Reconciler::new(me, ReconcilerConfig::from(&settings));
        let hub = Arc::new(SyncHub::new(reconciler, settings.event_buffer));
        let (channels, inbound) = RealtimeChannelManager::new(connector);
        let channels = Arc::new(channels);
        let pipeline = OptimisticSendPipeline::new(
            Arc::clone(&hub),
            Arc::clone(&api),
            Arc::clone(&channels),
            media,
            me,
            settings.max_content_bytes,
        );
        let inbound_pump = hub::spawn_inbound_pump(Arc::clone(&hub), inbound);
        Arc::new(Self {
            me,
            settings,
            hub,
            api,
            channels,
            pipeline,
            inbound_pump,
        })
    }

    pub fn me(&self) -> UserId {
        self.me
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    /// Snapshots only, for consumers that redraw from scratch.
    pub fn updates(&self) -> impl Stream<Item = SyncUpdate> + Send + 'static {
        BroadcastStream::new(self.hub.subscribe()).filter_map(|event| match event {
            Ok(ClientEvent::Updated(update)) => Some(update),
            _ => None,
        })
    }

    async fn open_channel(&self, conversation_id: ConversationId) -> Result<(), SyncError> {
        match self.channels.connect(conversation_id).await {
            Ok(()) => Ok(()),
            Err(err) if err.is_fatal() => Err(err),
            Err(err) => {
                warn!(conversation_id = %conversation_id, "client: realtime unavailable, continuing with history only: {err}");
                self.hub.emit(ClientEvent::Error(format!(
                    "realtime channel for {conversation_id} unavailable: {err}"
                )));
                Ok(())
            }
        }
    }

    async fn publish_read_marker(&self, conversation_id: ConversationId) {
        let Some(newest) = self
            .hub
            .read(|reconciler| reconciler.newest_confirmed_id(conversation_id))
            .await
        else {
            return;
        };
        let marker = Envelope::control(
            EnvelopeKind::Read,
            conversation_id,
            self.me,
            Some(MessageKey::Server(newest)),
            Utc::now(),
        );
        if let Err(err) = self.channels.publish(conversation_id, &marker).await {
            debug!(conversation_id = %conversation_id, "client: read marker not published: {err}");
        }
    }
}

impl Drop for ChatClient {
    fn drop(&mut self) {
        self.inbound_pump.abort();
    }
}

#[async_trait]
impl ClientHandle for Arc<ChatClient> {
    async fn refresh_conversations(&self) -> Result<usize, SyncError> {
        let records = self
            .api
            .list_conversations(self.settings.page_size, 0)
            .await?;
        let count = records.len();
        self.hub
            .mutate_list(|reconciler| reconciler.apply_conversation_list(&records))
            .await;
        info!(count, "client: conversation list refreshed");
        Ok(count)
    }

    async fn create_conversation(
        &self,
        kind: ConversationKind,
        name: Option<String>,
        participant_ids: Vec<UserId>,
    ) -> Result<ConversationId, SyncError> {
        let record = self
            .api
            .create_conversation(CreateConversationRequest {
                kind,
                name,
                participant_ids,
            })
            .await?;
        let conversation_id = record.conversation_id;
        self.hub
            .mutate_list(|reconciler| {
                reconciler.apply_conversation_list(std::slice::from_ref(&record))
            })
            .await;
        info!(conversation_id = %conversation_id, "client: conversation created");
        Ok(conversation_id)
    }

    async fn delete_conversation(&self, conversation_id: ConversationId) -> Result<(), SyncError> {
        self.api.delete_conversation(conversation_id).await?;
        self.channels.disconnect(conversation_id).await;
        self.hub
            .mutate_list(|reconciler| reconciler.remove_conversation(conversation_id))
            .await;
        info!(conversation_id = %conversation_id, "client: conversation deleted");
        Ok(())
    }

    /// Unread is reset before any I/O and stays reset if loading fails.
    async fn select_conversation(&self, conversation_id: ConversationId) -> Result<(), SyncError> {
        let cleared = self
            .hub
            .mutate(conversation_id, |reconciler| {
                reconciler.focus(conversation_id, Utc::now())
            })
            .await;
        info!(conversation_id = %conversation_id, cleared, "client: conversation selected");

        self.open_channel(conversation_id).await?;

        let page = self
            .api
            .fetch_messages(conversation_id, self.settings.page_size, None)
            .await?;
        let appended = self
            .hub
            .mutate(conversation_id, |reconciler| {
                reconciler.ingest_page(conversation_id, &page, Utc::now())
            })
            .await;
        debug!(conversation_id = %conversation_id, fetched = page.len(), appended, "client: history loaded");

        self.publish_read_marker(conversation_id).await;
        Ok(())
    }

    async fn load_older(&self, conversation_id: ConversationId) -> Result<usize, SyncError> {
        let cursor = self
            .hub
            .read(|reconciler| reconciler.oldest_server_id(conversation_id))
            .await;
        let page = self
            .api
            .fetch_messages(conversation_id, self.settings.page_size, cursor)
            .await?;
        Ok(self
            .hub
            .mutate(conversation_id, |reconciler| {
                reconciler.ingest_page(conversation_id, &page, Utc::now())
            })
            .await)
    }

    async fn send(
        &self,
        conversation_id: ConversationId,
        content: String,
    ) -> Result<PendingSend, SyncError> {
        self.pipeline
            .send(conversation_id, content, Vec::<Attachment>::new())
            .await
    }

    async fn send_with_media(
        &self,
        conversation_id: ConversationId,
        content: String,
        uploads: Vec<MediaUpload>,
    ) -> Result<PendingSend, SyncError> {
        self.pipeline
            .send_with_media(conversation_id, content, uploads)
            .await
    }

    async fn retry(
        &self,
        conversation_id: ConversationId,
        temp_id: TempId,
    ) -> Result<PendingSend, SyncError> {
        self.pipeline.retry(conversation_id, temp_id).await
    }

    async fn unsend(
        &self,
        conversation_id: ConversationId,
        key: MessageKey,
    ) -> Result<(), SyncError> {
        self.pipeline.unsend(conversation_id, &key).await
    }

    async fn edit(
        &self,
        conversation_id: ConversationId,
        key: MessageKey,
        content: String,
    ) -> Result<(), SyncError> {
        self.pipeline.edit(conversation_id, &key, content).await
    }

    async fn reconnect(&self, conversation_id: ConversationId) -> Result<(), SyncError> {
        self.channels.reconnect(conversation_id).await
    }

    async fn disconnect_all(&self) {
        self.channels.disconnect_all().await;
    }

    async fn timeline(&self, conversation_id: ConversationId) -> Vec<Message> {
        self.hub
            .read(|reconciler| reconciler.messages(conversation_id))
            .await
    }

    async fn conversations(&self) -> Vec<Conversation> {
        self.hub.read(|reconciler| reconciler.conversations()).await
    }

    async fn channel_status(&self, conversation_id: ConversationId) -> ChannelStatus {
        self.channels.status(conversation_id).await
    }

    fn subscribe_events(&self) -> broadcast::Receiver<ClientEvent> {
        self.hub.subscribe()
    }
}

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
