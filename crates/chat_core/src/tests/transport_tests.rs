use super::*;
use crate::channel::decode_envelope;
use axum::{
    extract::{
        ws::{Message as WsMessage, WebSocket, WebSocketUpgrade},
        Path, Query,
    },
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Router,
};
use chat_shared::protocol::EnvelopeKind;
use std::{collections::HashMap, time::Duration};
use tokio::net::TcpListener;

async fn handle_ws(
    Path(chat_id): Path<String>,
    Query(params): Query<HashMap<String, String>>,
    ws: WebSocketUpgrade,
) -> Response {
    if params.get("token").map(String::as_str) != Some("good") {
        return StatusCode::UNAUTHORIZED.into_response();
    }
    let user_id = params.get("user_id").cloned().unwrap_or_default();
    ws.on_upgrade(move |socket| echo_session(socket, chat_id, user_id))
}

async fn echo_session(mut socket: WebSocket, chat_id: String, user_id: String) {
    let hello = format!(
        r#"{{"type":"connection_established","chat_id":"{chat_id}","user_id":"{user_id}","content":"Connected to chat","timestamp":1700000000}}"#
    );
    if socket.send(WsMessage::Text(hello)).await.is_err() {
        return;
    }
    while let Some(Ok(msg)) = socket.recv().await {
        if let WsMessage::Text(text) = msg {
            if socket.send(WsMessage::Text(text)).await.is_err() {
                break;
            }
        }
    }
}

async fn spawn_ws_server() -> anyhow::Result<String> {
    std::env::set_var("NO_PROXY", "127.0.0.1,localhost");
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;
    let app = Router::new().route("/chats/:chat_id/ws", get(handle_ws));
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });
    Ok(format!("ws://{addr}"))
}

async fn next_frame(link: &mut ChannelLink) -> ChannelFrame {
    tokio::time::timeout(Duration::from_secs(2), link.inbound.recv())
        .await
        .expect("frame timeout")
        .expect("inbound open")
}

#[test]
fn channel_url_carries_identity_and_token() {
    let user_id = UserId::new_v4();
    let conversation_id = ConversationId::new_v4();
    let connector =
        WsChannelConnector::new("wss://chat.example.com/api/v1/", user_id, Some("t0k".into()));

    let url = connector.channel_url(conversation_id).expect("url");
    assert_eq!(
        url.as_str(),
        format!("wss://chat.example.com/api/v1/chats/{conversation_id}/ws?user_id={user_id}&token=t0k")
    );
}

#[tokio::test]
async fn websocket_connector_relays_frames_both_ways() {
    let base = spawn_ws_server().await.expect("spawn server");
    let conversation_id = ConversationId::new_v4();
    let connector = WsChannelConnector::new(base, UserId::new_v4(), Some("good".into()));

    let mut link = connector.connect(conversation_id).await.expect("connect");

    let ChannelFrame::Text(greeting) = next_frame(&mut link).await else {
        panic!("expected greeting text frame");
    };
    let envelope = decode_envelope(conversation_id, &greeting).expect("greeting decodes");
    assert_eq!(envelope.kind, EnvelopeKind::System);

    link.outbound.send("ping".into()).await.expect("send");
    assert_eq!(next_frame(&mut link).await, ChannelFrame::Text("ping".into()));
}

#[tokio::test]
async fn websocket_handshake_rejection_is_fatal() {
    let base = spawn_ws_server().await.expect("spawn server");
    let connector = WsChannelConnector::new(base, UserId::new_v4(), Some("bad".into()));

    let err = connector
        .connect(ConversationId::new_v4())
        .await
        .err()
        .expect("handshake must fail");
    assert!(err.is_fatal(), "unexpected error: {err}");
}
