use std::sync::Arc;

use chat_shared::{
    domain::{ConversationId, UserId},
    protocol::EnvelopeKind,
};
use chrono::Utc;
use tokio::{
    sync::{broadcast, mpsc, Mutex},
    task::JoinHandle,
};
use tracing::{debug, error, info, warn};

use crate::{
    channel::ChannelEvent,
    error::SyncError,
    reconciler::{Applied, Reconciler},
    ClientEvent,
};

/// Serializes every timeline mutation behind one lock and publishes a fresh
/// snapshot after each accepted change.
pub(crate) struct SyncHub {
    me: UserId,
    reconciler: Mutex<Reconciler>,
    events: broadcast::Sender<ClientEvent>,
}

impl SyncHub {
    pub fn new(reconciler: Reconciler, capacity: usize) -> Self {
        let (events, _) = broadcast::channel(capacity.max(1));
        Self {
            me: reconciler.me(),
            reconciler: Mutex::new(reconciler),
            events,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ClientEvent> {
        self.events.subscribe()
    }

    pub fn emit(&self, event: ClientEvent) {
        let _ = self.events.send(event);
    }

    pub async fn read<R>(&self, f: impl FnOnce(&Reconciler) -> R) -> R {
        let reconciler = self.reconciler.lock().await;
        f(&reconciler)
    }

    /// Infallible mutation scoped to one conversation.
    pub async fn mutate<R>(
        &self,
        id: ConversationId,
        f: impl FnOnce(&mut Reconciler) -> R,
    ) -> R {
        let mut reconciler = self.reconciler.lock().await;
        let out = f(&mut reconciler);
        self.emit(ClientEvent::Updated(reconciler.snapshot(id)));
        out
    }

    /// Mutation touching only the conversation list.
    pub async fn mutate_list<R>(&self, f: impl FnOnce(&mut Reconciler) -> R) -> R {
        let mut reconciler = self.reconciler.lock().await;
        let out = f(&mut reconciler);
        self.emit(ClientEvent::Updated(reconciler.list_snapshot()));
        out
    }

    pub async fn try_mutate<R>(
        &self,
        id: ConversationId,
        f: impl FnOnce(&mut Reconciler) -> Result<R, SyncError>,
    ) -> Result<R, SyncError> {
        let mut reconciler = self.reconciler.lock().await;
        let result = f(&mut reconciler);
        match &result {
            Ok(_) => self.emit(ClientEvent::Updated(reconciler.snapshot(id))),
            Err(err) => log_rejection(id, err),
        }
        result
    }

    /// Like `try_mutate`, but only publishes when the step changed something.
    pub async fn apply(
        &self,
        id: ConversationId,
        f: impl FnOnce(&mut Reconciler) -> Result<Applied, SyncError>,
    ) -> Result<Applied, SyncError> {
        let mut reconciler = self.reconciler.lock().await;
        let result = f(&mut reconciler);
        match &result {
            Ok(applied) if applied.is_change() => {
                self.emit(ClientEvent::Updated(reconciler.snapshot(id)));
            }
            Ok(_) => {}
            Err(err) => log_rejection(id, err),
        }
        result
    }

    pub async fn on_channel_event(&self, event: ChannelEvent) {
        let envelope = match event {
            ChannelEvent::Status {
                conversation_id,
                status,
            } => {
                info!(conversation_id = %conversation_id, status = %status, "realtime: channel status changed");
                self.emit(ClientEvent::ChannelStatus {
                    conversation_id,
                    status,
                });
                return;
            }
            ChannelEvent::Envelope(envelope) => envelope,
        };

        let conversation_id = envelope.conversation_id;
        match envelope.kind {
            EnvelopeKind::System => {
                debug!(conversation_id = %conversation_id, "realtime: {}", envelope.content);
            }
            EnvelopeKind::Typing if envelope.sender_id != self.me => {
                self.emit(ClientEvent::Typing {
                    conversation_id,
                    sender_id: envelope.sender_id,
                });
            }
            EnvelopeKind::Read if envelope.sender_id != self.me => {
                self.emit(ClientEvent::ReadReceipt {
                    conversation_id,
                    sender_id: envelope.sender_id,
                    message_id: envelope.message_id.clone(),
                });
            }
            EnvelopeKind::Typing | EnvelopeKind::Read => {}
            EnvelopeKind::Text | EnvelopeKind::Edit | EnvelopeKind::Delete => {
                let result = self
                    .apply(conversation_id, |reconciler| {
                        reconciler.ingest_envelope(&envelope, Utc::now())
                    })
                    .await;
                if let Err(err) = result {
                    self.emit(ClientEvent::Error(format!(
                        "dropped {} envelope in {conversation_id}: {err}",
                        envelope.kind.as_str()
                    )));
                }
            }
        }
    }
}

fn log_rejection(id: ConversationId, err: &SyncError) {
    if err.is_invariant_violation() {
        error!(conversation_id = %id, "sync: invariant violation: {err}");
    } else {
        warn!(conversation_id = %id, "sync: mutation rejected: {err}");
    }
}

/// Drains channel events into the hub until every sender is gone.
pub(crate) fn spawn_inbound_pump(
    hub: Arc<SyncHub>,
    mut inbound: mpsc::UnboundedReceiver<ChannelEvent>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(event) = inbound.recv().await {
            hub.on_channel_event(event).await;
        }
        debug!("realtime: inbound pump stopped");
    })
}
