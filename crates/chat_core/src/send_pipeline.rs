use std::sync::Arc;

use chat_shared::{
    domain::{Attachment, ConversationId, DeliveryState, MessageId, MessageKey, TempId, UserId},
    error::ValidationError,
    protocol::{EditMessageRequest, Envelope, EnvelopeKind, SendMessageRequest},
};
use chrono::Utc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::{
    api::ConversationApi,
    channel::RealtimeChannelManager,
    error::SyncError,
    hub::SyncHub,
    media::{MediaUpload, MediaUploader},
    reconciler::OutgoingMessage,
    ClientEvent,
};

/// How a single delivery attempt ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SendOutcome {
    Confirmed(MessageId),
    Failed(String),
}

/// Handle to an in-flight delivery. The optimistic entry is already visible
/// by the time this is returned.
pub struct PendingSend {
    pub temp_id: TempId,
    pub task: JoinHandle<SendOutcome>,
}

pub fn validate_content(
    content: &str,
    has_attachments: bool,
    limit: usize,
) -> Result<(), ValidationError> {
    if content.trim().is_empty() && !has_attachments {
        return Err(ValidationError::EmptyContent);
    }
    if content.len() > limit {
        return Err(ValidationError::ContentTooLong {
            actual: content.len(),
            limit,
        });
    }
    Ok(())
}

pub struct OptimisticSendPipeline {
    hub: Arc<SyncHub>,
    api: Arc<dyn ConversationApi>,
    channels: Arc<RealtimeChannelManager>,
    media: Arc<dyn MediaUploader>,
    me: UserId,
    max_content_bytes: usize,
}

impl OptimisticSendPipeline {
    pub(crate) fn new(
        hub: Arc<SyncHub>,
        api: Arc<dyn ConversationApi>,
        channels: Arc<RealtimeChannelManager>,
        media: Arc<dyn MediaUploader>,
        me: UserId,
        max_content_bytes: usize,
    ) -> Arc<Self> {
        Arc::new(Self {
            hub,
            api,
            channels,
            media,
            me,
            max_content_bytes,
        })
    }

    pub async fn send(
        self: &Arc<Self>,
        conversation_id: ConversationId,
        content: String,
        attachments: Vec<Attachment>,
    ) -> Result<PendingSend, SyncError> {
        validate_content(&content, !attachments.is_empty(), self.max_content_bytes)?;
        let outgoing = self
            .hub
            .mutate(conversation_id, |reconciler| {
                reconciler.append_pending(conversation_id, content, attachments, Utc::now())
            })
            .await;
        info!(conversation_id = %conversation_id, temp_id = %outgoing.temp_id, "send: queued");
        Ok(self.spawn_delivery(outgoing))
    }

    /// Uploads every payload first; nothing is appended if an upload fails.
    pub async fn send_with_media(
        self: &Arc<Self>,
        conversation_id: ConversationId,
        content: String,
        uploads: Vec<MediaUpload>,
    ) -> Result<PendingSend, SyncError> {
        validate_content(&content, !uploads.is_empty(), self.max_content_bytes)?;
        let mut attachments = Vec::with_capacity(uploads.len());
        for upload in uploads {
            let filename = upload.filename.clone();
            let attachment = self.media.upload(upload).await.map_err(|err| {
                warn!(conversation_id = %conversation_id, filename = %filename, "send: media upload failed: {err}");
                err
            })?;
            attachments.push(attachment);
        }
        self.send(conversation_id, content, attachments).await
    }

    pub async fn retry(
        self: &Arc<Self>,
        conversation_id: ConversationId,
        temp_id: TempId,
    ) -> Result<PendingSend, SyncError> {
        let outgoing = self
            .hub
            .try_mutate(conversation_id, |reconciler| {
                reconciler.retry_failed(conversation_id, temp_id, Utc::now())
            })
            .await?;
        info!(conversation_id = %conversation_id, temp_id = %outgoing.temp_id, "send: retrying");
        Ok(self.spawn_delivery(outgoing))
    }

    pub async fn unsend(
        &self,
        conversation_id: ConversationId,
        key: &MessageKey,
    ) -> Result<(), SyncError> {
        let message_id = self
            .hub
            .read(|reconciler| {
                reconciler.check_own_confirmed(conversation_id, key, DeliveryState::Deleted)
            })
            .await?;
        self.api.unsend_message(conversation_id, &message_id).await?;
        self.hub
            .apply(conversation_id, |reconciler| {
                reconciler.apply_unsend(conversation_id, &message_id)
            })
            .await?;
        let notice = Envelope::control(
            EnvelopeKind::Delete,
            conversation_id,
            self.me,
            Some(MessageKey::Server(message_id.clone())),
            Utc::now(),
        );
        self.publish_best_effort(conversation_id, &notice).await;
        info!(conversation_id = %conversation_id, message_id = %message_id, "send: message unsent");
        Ok(())
    }

    pub async fn edit(
        &self,
        conversation_id: ConversationId,
        key: &MessageKey,
        content: String,
    ) -> Result<(), SyncError> {
        validate_content(&content, false, self.max_content_bytes)?;
        let message_id = self
            .hub
            .read(|reconciler| {
                reconciler.check_own_confirmed(conversation_id, key, DeliveryState::Confirmed)
            })
            .await?;
        self.api
            .edit_message(
                conversation_id,
                &message_id,
                EditMessageRequest {
                    sender_id: self.me,
                    content: content.clone(),
                },
            )
            .await?;
        self.hub
            .apply(conversation_id, |reconciler| {
                reconciler.apply_edit(conversation_id, &message_id, &content)
            })
            .await?;
        let mut notice = Envelope::control(
            EnvelopeKind::Edit,
            conversation_id,
            self.me,
            Some(MessageKey::Server(message_id.clone())),
            Utc::now(),
        );
        notice.content = content;
        notice.is_edited = true;
        self.publish_best_effort(conversation_id, &notice).await;
        info!(conversation_id = %conversation_id, message_id = %message_id, "send: message edited");
        Ok(())
    }

    fn spawn_delivery(self: &Arc<Self>, outgoing: OutgoingMessage) -> PendingSend {
        let temp_id = outgoing.temp_id;
        let pipeline = Arc::clone(self);
        let task = tokio::spawn(async move { pipeline.deliver(outgoing).await });
        PendingSend { temp_id, task }
    }

    /// Realtime publish and REST persistence run concurrently; only the
    /// persistence result decides between confirmed and failed.
    async fn deliver(&self, outgoing: OutgoingMessage) -> SendOutcome {
        let conversation_id = outgoing.conversation_id;
        let temp_id = outgoing.temp_id;
        let envelope = Envelope::outbound_text(
            conversation_id,
            self.me,
            temp_id,
            outgoing.content.clone(),
            outgoing.attachments.clone(),
            outgoing.created_at,
        );
        let request = SendMessageRequest {
            sender_id: self.me,
            content: outgoing.content,
            attachments: outgoing.attachments,
            idempotency_key: temp_id,
        };

        let (published, persisted) = futures::join!(
            self.channels.publish(conversation_id, &envelope),
            self.api.send_message(conversation_id, request)
        );
        if let Err(err) = published {
            debug!(conversation_id = %conversation_id, temp_id = %temp_id, "send: realtime publish skipped: {err}");
        }

        match persisted {
            Ok(record) => {
                let message_id = record.message_id.clone();
                if let Err(err) = self
                    .hub
                    .apply(conversation_id, |reconciler| {
                        reconciler.confirm_pending(conversation_id, temp_id, &record)
                    })
                    .await
                {
                    warn!(conversation_id = %conversation_id, temp_id = %temp_id, message_id = %message_id, "send: persisted but not reconciled: {err}");
                }
                info!(conversation_id = %conversation_id, temp_id = %temp_id, message_id = %message_id, "send: confirmed");
                SendOutcome::Confirmed(message_id)
            }
            Err(err) => self.settle_failure(conversation_id, temp_id, err).await,
        }
    }

    async fn settle_failure(
        &self,
        conversation_id: ConversationId,
        temp_id: TempId,
        err: SyncError,
    ) -> SendOutcome {
        let reason = err.to_string();
        let settled = self
            .hub
            .try_mutate(conversation_id, |reconciler| {
                match reconciler.confirmed_alias(conversation_id, temp_id) {
                    Some(message_id) => Ok(Some(message_id)),
                    None => reconciler
                        .fail_pending(conversation_id, temp_id)
                        .map(|_| None),
                }
            })
            .await;
        match settled {
            Ok(Some(message_id)) => {
                info!(conversation_id = %conversation_id, temp_id = %temp_id, message_id = %message_id, "send: echo already confirmed, ignoring persistence error: {reason}");
                SendOutcome::Confirmed(message_id)
            }
            Ok(None) => {
                warn!(conversation_id = %conversation_id, temp_id = %temp_id, transient = err.is_transient(), "send: failed: {reason}");
                self.hub.emit(ClientEvent::SendFailed {
                    conversation_id,
                    temp_id,
                    reason: reason.clone(),
                });
                SendOutcome::Failed(reason)
            }
            Err(_) => SendOutcome::Failed(reason),
        }
    }

    async fn publish_best_effort(&self, conversation_id: ConversationId, envelope: &Envelope) {
        if let Err(err) = self.channels.publish(conversation_id, envelope).await {
            debug!(conversation_id = %conversation_id, kind = envelope.kind.as_str(), "send: notice not published: {err}");
        }
    }
}
