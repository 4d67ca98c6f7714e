use super::*;
use chat_shared::domain::{MessageKey, MessageId, UserId};
use chrono::Utc;
use std::{collections::VecDeque, time::Duration};
use tokio::sync::Notify;

enum Script {
    Accept,
    Reject(SyncError),
}

struct Remote {
    to_client: mpsc::Sender<ChannelFrame>,
    from_client: mpsc::Receiver<String>,
}

struct FakeConnector {
    script: Mutex<VecDeque<Script>>,
    remotes: Arc<Mutex<Vec<Remote>>>,
    attempts: Arc<Mutex<u32>>,
    gate: Option<Arc<Notify>>,
}

impl FakeConnector {
    fn new() -> Self {
        Self {
            script: Mutex::new(VecDeque::new()),
            remotes: Arc::new(Mutex::new(Vec::new())),
            attempts: Arc::new(Mutex::new(0)),
            gate: None,
        }
    }

    fn scripted(script: Vec<Script>) -> Self {
        let connector = Self::new();
        *connector.script.try_lock().expect("fresh lock") = script.into();
        connector
    }

    fn gated(gate: Arc<Notify>) -> Self {
        Self {
            gate: Some(gate),
            ..Self::new()
        }
    }
}

#[async_trait]
impl ChannelConnector for FakeConnector {
    async fn connect(&self, _conversation_id: ConversationId) -> Result<ChannelLink, SyncError> {
        *self.attempts.lock().await += 1;
        if let Some(gate) = &self.gate {
            gate.notified().await;
        }
        if let Some(Script::Reject(err)) = self.script.lock().await.pop_front() {
            return Err(err);
        }
        let (outbound, from_client) = mpsc::channel(16);
        let (to_client, inbound) = mpsc::channel(16);
        self.remotes.lock().await.push(Remote {
            to_client,
            from_client,
        });
        Ok(ChannelLink { outbound, inbound })
    }
}

struct Harness {
    manager: Arc<RealtimeChannelManager>,
    events: mpsc::UnboundedReceiver<ChannelEvent>,
    remotes: Arc<Mutex<Vec<Remote>>>,
    attempts: Arc<Mutex<u32>>,
}

fn harness(connector: FakeConnector) -> Harness {
    let remotes = Arc::clone(&connector.remotes);
    let attempts = Arc::clone(&connector.attempts);
    let (manager, events) = RealtimeChannelManager::new(Arc::new(connector));
    Harness {
        manager: Arc::new(manager),
        events,
        remotes,
        attempts,
    }
}

async fn next_status(events: &mut mpsc::UnboundedReceiver<ChannelEvent>) -> ChannelStatus {
    tokio::time::timeout(Duration::from_secs(1), async {
        loop {
            match events.recv().await {
                Some(ChannelEvent::Status { status, .. }) => break status,
                Some(ChannelEvent::Envelope(_)) => continue,
                None => panic!("event stream closed"),
            }
        }
    })
    .await
    .expect("status timeout")
}

async fn next_envelope(events: &mut mpsc::UnboundedReceiver<ChannelEvent>) -> Envelope {
    tokio::time::timeout(Duration::from_secs(1), async {
        loop {
            match events.recv().await {
                Some(ChannelEvent::Envelope(envelope)) => break envelope,
                Some(ChannelEvent::Status { .. }) => continue,
                None => panic!("event stream closed"),
            }
        }
    })
    .await
    .expect("envelope timeout")
}

fn text_frame(conversation_id: ConversationId, id: &str, content: &str) -> String {
    let envelope = Envelope {
        kind: EnvelopeKind::Text,
        conversation_id,
        sender_id: UserId::new_v4(),
        content: content.into(),
        message_id: Some(MessageKey::Server(MessageId(id.into()))),
        original_id: None,
        timestamp: Utc::now(),
        attachments: Vec::new(),
        is_edited: false,
        is_deleted: false,
    };
    serde_json::to_string(&envelope).expect("encode")
}

#[tokio::test]
async fn double_connect_is_a_no_op() {
    let mut h = harness(FakeConnector::new());
    let conv = ConversationId::new_v4();

    h.manager.connect(conv).await.expect("connect");
    h.manager.connect(conv).await.expect("second connect");

    assert_eq!(*h.attempts.lock().await, 1);
    assert_eq!(h.manager.status(conv).await, ChannelStatus::Open);
    assert_eq!(next_status(&mut h.events).await, ChannelStatus::Connecting);
    assert_eq!(next_status(&mut h.events).await, ChannelStatus::Open);
    assert_eq!(
        h.manager.status(ConversationId::new_v4()).await,
        ChannelStatus::Closed
    );
}

#[tokio::test]
async fn unexpected_close_moves_to_error_until_reconnect() {
    let mut h = harness(FakeConnector::new());
    let conv = ConversationId::new_v4();
    h.manager.connect(conv).await.expect("connect");
    next_status(&mut h.events).await;
    next_status(&mut h.events).await;

    h.remotes.lock().await[0]
        .to_client
        .send(ChannelFrame::Closed {
            reason: Some("going away".into()),
        })
        .await
        .expect("close frame");

    assert_eq!(next_status(&mut h.events).await, ChannelStatus::Error);
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(*h.attempts.lock().await, 1);
    assert_eq!(h.manager.status(conv).await, ChannelStatus::Error);
    assert!(matches!(
        h.manager
            .publish(conv, &Envelope::control(EnvelopeKind::Typing, conv, UserId::new_v4(), None, Utc::now()))
            .await,
        Err(SyncError::ChannelNotOpen(_))
    ));

    h.manager.reconnect(conv).await.expect("reconnect");
    assert_eq!(*h.attempts.lock().await, 2);
    assert_eq!(h.manager.status(conv).await, ChannelStatus::Open);
}

#[tokio::test]
async fn ended_inbound_stream_counts_as_unexpected_closure() {
    let mut h = harness(FakeConnector::new());
    let conv = ConversationId::new_v4();
    h.manager.connect(conv).await.expect("connect");
    next_status(&mut h.events).await;
    next_status(&mut h.events).await;

    h.remotes.lock().await.clear();

    assert_eq!(next_status(&mut h.events).await, ChannelStatus::Error);
}

#[tokio::test]
async fn auth_rejection_is_fatal() {
    let h = harness(FakeConnector::scripted(vec![Script::Reject(
        SyncError::Unauthorized("token expired".into()),
    )]));
    let conv = ConversationId::new_v4();

    let err = h.manager.connect(conv).await.expect_err("must fail");
    assert!(err.is_fatal());
    assert_eq!(h.manager.status(conv).await, ChannelStatus::Error);
}

#[tokio::test]
async fn malformed_envelopes_are_dropped_without_faulting_the_channel() {
    let mut h = harness(FakeConnector::new());
    let conv = ConversationId::new_v4();
    h.manager.connect(conv).await.expect("connect");

    {
        let remotes = h.remotes.lock().await;
        let to_client = &remotes[0].to_client;
        for frame in [
            "not json".to_string(),
            r#"{"type":"text","conversation_id":"nope"}"#.to_string(),
            text_frame(ConversationId::new_v4(), "elsewhere", "wrong channel"),
            text_frame(conv, "m1", "hello"),
        ] {
            to_client.send(ChannelFrame::Text(frame)).await.expect("frame");
        }
    }

    let envelope = next_envelope(&mut h.events).await;
    assert_eq!(envelope.content, "hello");
    assert_eq!(h.manager.status(conv).await, ChannelStatus::Open);
}

#[tokio::test]
async fn newline_batched_frame_yields_every_envelope() {
    let mut h = harness(FakeConnector::new());
    let conv = ConversationId::new_v4();
    h.manager.connect(conv).await.expect("connect");

    let batched = format!(
        "{}\n{}\n",
        text_frame(conv, "m1", "first"),
        text_frame(conv, "m2", "second")
    );
    h.remotes.lock().await[0]
        .to_client
        .send(ChannelFrame::Text(batched))
        .await
        .expect("frame");

    assert_eq!(next_envelope(&mut h.events).await.content, "first");
    assert_eq!(next_envelope(&mut h.events).await.content, "second");
    assert_eq!(h.manager.status(conv).await, ChannelStatus::Open);
}

#[test]
fn malformed_line_in_batch_leaves_neighbours_intact() {
    let conv = ConversationId::new_v4();
    let batched = format!(
        "{}\nnot json\n\n{}",
        text_frame(conv, "m1", "first"),
        text_frame(conv, "m2", "second")
    );
    let decoded = decode_frame(conv, &batched);
    assert_eq!(decoded.len(), 3);
    assert_eq!(decoded[0].as_ref().map(|e| e.content.as_str()).ok(), Some("first"));
    assert!(matches!(decoded[1], Err(SyncError::MalformedEnvelope(_))));
    assert_eq!(decoded[2].as_ref().map(|e| e.content.as_str()).ok(), Some("second"));
}

#[tokio::test]
async fn system_envelopes_are_forwarded() {
    let mut h = harness(FakeConnector::new());
    let conv = ConversationId::new_v4();
    h.manager.connect(conv).await.expect("connect");

    let frame = format!(
        r#"{{"type":"connection_established","chat_id":"{conv}","user_id":"{}","content":"Connected to chat","timestamp":1700000000}}"#,
        UserId::new_v4()
    );
    h.remotes.lock().await[0]
        .to_client
        .send(ChannelFrame::Text(frame))
        .await
        .expect("frame");

    assert_eq!(next_envelope(&mut h.events).await.kind, EnvelopeKind::System);
}

#[tokio::test]
async fn disconnect_during_connect_wins() {
    let gate = Arc::new(Notify::new());
    let h = harness(FakeConnector::gated(Arc::clone(&gate)));
    let conv = ConversationId::new_v4();

    let manager = Arc::clone(&h.manager);
    let connecting = tokio::spawn(async move { manager.connect(conv).await });
    tokio::time::timeout(Duration::from_secs(1), async {
        while h.manager.status(conv).await != ChannelStatus::Connecting {
            tokio::task::yield_now().await;
        }
    })
    .await
    .expect("connecting");

    h.manager.disconnect(conv).await;
    gate.notify_one();
    connecting.await.expect("join").expect("connect");

    assert_eq!(h.manager.status(conv).await, ChannelStatus::Closed);
    let mut remotes = h.remotes.lock().await;
    let late = remotes.first_mut().expect("link was opened");
    assert_eq!(late.from_client.recv().await, None);
}

#[tokio::test]
async fn publish_writes_frame_on_open_channel() {
    let h = harness(FakeConnector::new());
    let conv = ConversationId::new_v4();
    let envelope = Envelope::control(EnvelopeKind::Typing, conv, UserId::new_v4(), None, Utc::now());

    assert!(matches!(
        h.manager.publish(conv, &envelope).await,
        Err(SyncError::ChannelNotOpen(_))
    ));

    h.manager.connect(conv).await.expect("connect");
    h.manager.publish(conv, &envelope).await.expect("publish");

    let frame = h.remotes.lock().await[0]
        .from_client
        .recv()
        .await
        .expect("frame");
    let decoded: Envelope = serde_json::from_str(&frame).expect("decode");
    assert_eq!(decoded.kind, EnvelopeKind::Typing);

    h.manager.disconnect_all().await;
    assert_eq!(h.manager.status(conv).await, ChannelStatus::Closed);
}
