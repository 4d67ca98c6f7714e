use std::{collections::HashMap, fmt, sync::Arc};

use async_trait::async_trait;
use chat_shared::{
    domain::ConversationId,
    protocol::{Envelope, EnvelopeKind},
};
use tokio::{
    sync::{mpsc, Mutex},
    task::JoinHandle,
};
use tracing::{debug, info, warn};

use crate::error::SyncError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelStatus {
    Connecting,
    Open,
    Closed,
    Error,
}

impl fmt::Display for ChannelStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Connecting => "connecting",
            Self::Open => "open",
            Self::Closed => "closed",
            Self::Error => "error",
        };
        f.write_str(label)
    }
}

/// One inbound item from a transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelFrame {
    Text(String),
    Closed { reason: Option<String> },
    Failed(String),
}

/// An established transport: outbound text frames in, inbound frames out.
pub struct ChannelLink {
    pub outbound: mpsc::Sender<String>,
    pub inbound: mpsc::Receiver<ChannelFrame>,
}

#[async_trait]
pub trait ChannelConnector: Send + Sync {
    async fn connect(&self, conversation_id: ConversationId) -> Result<ChannelLink, SyncError>;
}

pub struct MissingChannelConnector;

#[async_trait]
impl ChannelConnector for MissingChannelConnector {
    async fn connect(&self, conversation_id: ConversationId) -> Result<ChannelLink, SyncError> {
        Err(SyncError::Transport(format!(
            "realtime transport unavailable for conversation {conversation_id}"
        )))
    }
}

#[derive(Debug, Clone)]
pub enum ChannelEvent {
    Envelope(Envelope),
    Status {
        conversation_id: ConversationId,
        status: ChannelStatus,
    },
}

struct ChannelSlot {
    status: ChannelStatus,
    generation: u64,
    outbound: Option<mpsc::Sender<String>>,
    pump: Option<JoinHandle<()>>,
}

impl ChannelSlot {
    fn new() -> Self {
        Self {
            status: ChannelStatus::Closed,
            generation: 0,
            outbound: None,
            pump: None,
        }
    }

    fn shut(&mut self) {
        self.outbound = None;
        if let Some(pump) = self.pump.take() {
            pump.abort();
        }
    }
}

type Slots = Arc<Mutex<HashMap<ConversationId, ChannelSlot>>>;

/// Owns one push subscription per conversation. Never reconnects on its own.
pub struct RealtimeChannelManager {
    connector: Arc<dyn ChannelConnector>,
    slots: Slots,
    events: mpsc::UnboundedSender<ChannelEvent>,
}

impl RealtimeChannelManager {
    pub fn new(
        connector: Arc<dyn ChannelConnector>,
    ) -> (Self, mpsc::UnboundedReceiver<ChannelEvent>) {
        let (events, rx) = mpsc::unbounded_channel();
        (
            Self {
                connector,
                slots: Arc::new(Mutex::new(HashMap::new())),
                events,
            },
            rx,
        )
    }

    pub async fn status(&self, conversation_id: ConversationId) -> ChannelStatus {
        self.slots
            .lock()
            .await
            .get(&conversation_id)
            .map(|slot| slot.status)
            .unwrap_or(ChannelStatus::Closed)
    }

    /// Opens the channel unless it is already open or connecting.
    pub async fn connect(&self, conversation_id: ConversationId) -> Result<(), SyncError> {
        let generation = {
            let mut slots = self.slots.lock().await;
            let slot = slots.entry(conversation_id).or_insert_with(ChannelSlot::new);
            if matches!(slot.status, ChannelStatus::Open | ChannelStatus::Connecting) {
                debug!(conversation_id = %conversation_id, status = %slot.status, "channel: connect is a no-op");
                return Ok(());
            }
            slot.generation += 1;
            set_status(&self.events, conversation_id, slot, ChannelStatus::Connecting);
            slot.generation
        };

        let result = self.connector.connect(conversation_id).await;

        let mut slots = self.slots.lock().await;
        let Some(slot) = slots.get_mut(&conversation_id) else {
            return Ok(());
        };
        if slot.generation != generation || slot.status != ChannelStatus::Connecting {
            info!(conversation_id = %conversation_id, "channel: dropping link opened after disconnect");
            return Ok(());
        }

        match result {
            Ok(link) => {
                slot.outbound = Some(link.outbound);
                slot.pump = Some(tokio::spawn(pump_inbound(
                    conversation_id,
                    generation,
                    link.inbound,
                    Arc::clone(&self.slots),
                    self.events.clone(),
                )));
                set_status(&self.events, conversation_id, slot, ChannelStatus::Open);
                info!(conversation_id = %conversation_id, "channel: open");
                Ok(())
            }
            Err(err) => {
                set_status(&self.events, conversation_id, slot, ChannelStatus::Error);
                warn!(conversation_id = %conversation_id, fatal = err.is_fatal(), "channel: connect failed: {err}");
                Err(err)
            }
        }
    }

    /// Leaves `closed`/`error` through a fresh connect; no-op otherwise.
    pub async fn reconnect(&self, conversation_id: ConversationId) -> Result<(), SyncError> {
        info!(conversation_id = %conversation_id, "channel: reconnect requested");
        self.connect(conversation_id).await
    }

    pub async fn disconnect(&self, conversation_id: ConversationId) {
        let mut slots = self.slots.lock().await;
        if let Some(slot) = slots.get_mut(&conversation_id) {
            disconnect_slot(&self.events, conversation_id, slot);
        }
    }

    pub async fn disconnect_all(&self) {
        let mut slots = self.slots.lock().await;
        for (conversation_id, slot) in slots.iter_mut() {
            disconnect_slot(&self.events, *conversation_id, slot);
        }
    }

    pub async fn publish(
        &self,
        conversation_id: ConversationId,
        envelope: &Envelope,
    ) -> Result<(), SyncError> {
        let outbound = {
            let slots = self.slots.lock().await;
            slots
                .get(&conversation_id)
                .filter(|slot| slot.status == ChannelStatus::Open)
                .and_then(|slot| slot.outbound.clone())
                .ok_or(SyncError::ChannelNotOpen(conversation_id))?
        };
        let frame = serde_json::to_string(envelope)
            .map_err(|err| SyncError::MalformedEnvelope(err.to_string()))?;
        outbound
            .send(frame)
            .await
            .map_err(|_| SyncError::ChannelNotOpen(conversation_id))
    }
}

fn set_status(
    events: &mpsc::UnboundedSender<ChannelEvent>,
    conversation_id: ConversationId,
    slot: &mut ChannelSlot,
    status: ChannelStatus,
) {
    if slot.status == status {
        return;
    }
    slot.status = status;
    let _ = events.send(ChannelEvent::Status {
        conversation_id,
        status,
    });
}

fn disconnect_slot(
    events: &mpsc::UnboundedSender<ChannelEvent>,
    conversation_id: ConversationId,
    slot: &mut ChannelSlot,
) {
    slot.generation += 1;
    slot.shut();
    if slot.status != ChannelStatus::Closed {
        info!(conversation_id = %conversation_id, "channel: disconnected");
    }
    set_status(events, conversation_id, slot, ChannelStatus::Closed);
}

/// Parses and checks one inbound frame against the channel it arrived on.
/// Splits a text frame that may batch several newline-separated envelopes.
/// A malformed line does not affect its neighbours.
pub fn decode_frame(conversation_id: ConversationId, text: &str) -> Vec<Result<Envelope, SyncError>> {
    text.split('\n')
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(|line| decode_envelope(conversation_id, line))
        .collect()
}

pub fn decode_envelope(conversation_id: ConversationId, text: &str) -> Result<Envelope, SyncError> {
    let envelope: Envelope =
        serde_json::from_str(text).map_err(|err| SyncError::MalformedEnvelope(err.to_string()))?;
    envelope
        .validate()
        .map_err(|err| SyncError::MalformedEnvelope(err.to_string()))?;
    if envelope.conversation_id != conversation_id {
        return Err(SyncError::MalformedEnvelope(format!(
            "envelope for conversation {} arrived on channel {conversation_id}",
            envelope.conversation_id
        )));
    }
    Ok(envelope)
}

async fn pump_inbound(
    conversation_id: ConversationId,
    generation: u64,
    mut inbound: mpsc::Receiver<ChannelFrame>,
    slots: Slots,
    events: mpsc::UnboundedSender<ChannelEvent>,
) {
    let reason = loop {
        match inbound.recv().await {
            Some(ChannelFrame::Text(text)) => {
                for decoded in decode_frame(conversation_id, &text) {
                    match decoded {
                        Ok(envelope) => {
                            if envelope.kind == EnvelopeKind::System {
                                info!(conversation_id = %conversation_id, content = %envelope.content, "channel: system notice");
                            }
                            if events.send(ChannelEvent::Envelope(envelope)).is_err() {
                                return;
                            }
                        }
                        Err(err) => {
                            warn!(conversation_id = %conversation_id, "channel: dropping envelope: {err}");
                        }
                    }
                }
            }
            Some(ChannelFrame::Closed { reason }) => {
                break reason.unwrap_or_else(|| "closed by remote".to_string())
            }
            Some(ChannelFrame::Failed(err)) => break err,
            None => break "inbound stream ended".to_string(),
        }
    };

    let mut slots = slots.lock().await;
    if let Some(slot) = slots.get_mut(&conversation_id) {
        if slot.generation == generation && slot.status == ChannelStatus::Open {
            slot.outbound = None;
            slot.pump = None;
            set_status(&events, conversation_id, slot, ChannelStatus::Error);
            warn!(conversation_id = %conversation_id, "channel: unexpected closure: {reason}");
        }
    }
}

#[cfg(test)]
#[path = "tests/channel_tests.rs"]
mod tests;
