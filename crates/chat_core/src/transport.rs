use async_trait::async_trait;
use chat_shared::domain::{ConversationId, UserId};
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::{
    connect_async,
    tungstenite::{self, Message},
};
use tracing::{debug, warn};
use url::Url;

use crate::{
    channel::{ChannelConnector, ChannelFrame, ChannelLink},
    error::SyncError,
};

const OUTBOUND_BUFFER: usize = 64;
const INBOUND_BUFFER: usize = 256;

/// Websocket transport at `{realtime_base}/chats/{id}/ws`.
pub struct WsChannelConnector {
    realtime_base: String,
    user_id: UserId,
    token: Option<String>,
}

impl WsChannelConnector {
    pub fn new(realtime_base: impl Into<String>, user_id: UserId, token: Option<String>) -> Self {
        Self {
            realtime_base: realtime_base.into().trim_end_matches('/').to_string(),
            user_id,
            token,
        }
    }

    pub fn channel_url(&self, conversation_id: ConversationId) -> Result<Url, SyncError> {
        let mut url = Url::parse(&format!(
            "{}/chats/{conversation_id}/ws",
            self.realtime_base
        ))
        .map_err(|err| SyncError::Transport(format!("invalid realtime url: {err}")))?;
        {
            let mut query = url.query_pairs_mut();
            query.append_pair("user_id", &self.user_id.to_string());
            if let Some(token) = &self.token {
                query.append_pair("token", token);
            }
        }
        Ok(url)
    }
}

#[async_trait]
impl ChannelConnector for WsChannelConnector {
    async fn connect(&self, conversation_id: ConversationId) -> Result<ChannelLink, SyncError> {
        let url = self.channel_url(conversation_id)?;
        let (ws_stream, _) = connect_async(url.as_str())
            .await
            .map_err(map_connect_error)?;
        let (mut ws_writer, mut ws_reader) = ws_stream.split();

        let (outbound, mut outbound_rx) = mpsc::channel::<String>(OUTBOUND_BUFFER);
        let (inbound_tx, inbound) = mpsc::channel(INBOUND_BUFFER);

        tokio::spawn(async move {
            while let Some(text) = outbound_rx.recv().await {
                if let Err(err) = ws_writer.send(Message::Text(text)).await {
                    warn!(conversation_id = %conversation_id, "channel: websocket send failed: {err}");
                    break;
                }
            }
            let _ = ws_writer.close().await;
            debug!(conversation_id = %conversation_id, "channel: websocket writer finished");
        });

        tokio::spawn(async move {
            while let Some(msg) = ws_reader.next().await {
                let frame = match msg {
                    Ok(Message::Text(text)) => ChannelFrame::Text(text),
                    Ok(Message::Close(close)) => {
                        let _ = inbound_tx
                            .send(ChannelFrame::Closed {
                                reason: close.map(|frame| frame.reason.into_owned()),
                            })
                            .await;
                        break;
                    }
                    Ok(_) => continue,
                    Err(err) => {
                        let _ = inbound_tx.send(ChannelFrame::Failed(err.to_string())).await;
                        break;
                    }
                };
                if inbound_tx.send(frame).await.is_err() {
                    break;
                }
            }
        });

        Ok(ChannelLink { outbound, inbound })
    }
}

fn map_connect_error(err: tungstenite::Error) -> SyncError {
    match &err {
        tungstenite::Error::Http(response) if matches!(response.status().as_u16(), 401 | 403) => {
            SyncError::Unauthorized(format!("websocket handshake rejected: {}", response.status()))
        }
        _ => SyncError::Transport(format!("failed to connect websocket: {err}")),
    }
}

#[cfg(test)]
#[path = "tests/transport_tests.rs"]
mod tests;
