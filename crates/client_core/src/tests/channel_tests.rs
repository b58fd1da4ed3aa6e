use std::{sync::Arc, time::Duration};

use axum::{
    extract::{
        ws::{Message as AxumWsMessage, WebSocket, WebSocketUpgrade},
        State,
    },
    response::IntoResponse,
    routing::get,
    Router,
};
use chrono::Utc;
use shared::domain::{BodyType, UserId};
use tokio::net::TcpListener;

use super::*;

#[derive(Clone, Default)]
struct WsServerState {
    frames: Arc<Mutex<Vec<ClientFrame>>>,
    sessions: Arc<Mutex<u32>>,
    /// Close the first session right after its first frame, to force a
    /// reconnect.
    drop_first_session: bool,
    /// Leave `direct_message` frames unacked.
    suppress_acks: bool,
}

async fn ws_route(
    State(state): State<WsServerState>,
    upgrade: WebSocketUpgrade,
) -> impl IntoResponse {
    upgrade.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(mut socket: WebSocket, state: WsServerState) {
    let session = {
        let mut sessions = state.sessions.lock().await;
        *sessions += 1;
        *sessions
    };

    while let Some(Ok(message)) = socket.recv().await {
        let AxumWsMessage::Text(text) = message else {
            continue;
        };
        let Ok(frame) = serde_json::from_str::<ClientFrame>(&text) else {
            continue;
        };
        state.frames.lock().await.push(frame.clone());

        if state.drop_first_session && session == 1 {
            return;
        }

        if let ClientFrame::DirectMessage {
            temp_id,
            receiver_id,
            body,
            body_type,
        } = frame
        {
            if state.suppress_acks {
                continue;
            }
            let ack = ServerEvent::Ack {
                temp_id,
                message: Some(MessagePayload {
                    message_id: MessageId::new("srv-1"),
                    sender_id: UserId::new("alice"),
                    receiver_id,
                    sender_username: None,
                    body,
                    body_type,
                    sent_at: Utc::now(),
                    is_read: false,
                }),
                error: None,
            };
            let text = serde_json::to_string(&ack).expect("serialize ack");
            let _ = socket.send(AxumWsMessage::Text(text)).await;
        }
    }
}

async fn spawn_ws_server(state: WsServerState) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("local addr");
    let app = Router::new().route("/ws", get(ws_route)).with_state(state);
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });
    format!("ws://{addr}/ws")
}

fn test_policy() -> ReconnectPolicy {
    ReconnectPolicy::new(5, Duration::from_millis(50), Duration::from_millis(200))
}

fn test_identity() -> Identity {
    Identity::new(UserId::new("alice"), "token-1")
}

fn direct_message(temp_id: &MessageId, body: &str) -> ClientFrame {
    ClientFrame::DirectMessage {
        temp_id: temp_id.clone(),
        receiver_id: UserId::new("bob"),
        body: body.into(),
        body_type: BodyType::Text,
    }
}

async fn wait_for_frames(
    frames: &Mutex<Vec<ClientFrame>>,
    predicate: impl Fn(&[ClientFrame]) -> bool,
) {
    for _ in 0..200 {
        if predicate(&frames.lock().await) {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("expected frames did not arrive within the polling window");
}

async fn wait_for_sessions(sessions: &Mutex<u32>, at_least: u32) {
    for _ in 0..200 {
        if *sessions.lock().await >= at_least {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("expected session count not reached within the polling window");
}

#[tokio::test]
async fn announces_identity_immediately_on_connect() {
    let state = WsServerState::default();
    let frames = state.frames.clone();
    let ws_url = spawn_ws_server(state).await;

    let channel = EventChannel::new(ws_url, test_identity(), test_policy());
    channel.connect().await;

    wait_for_frames(&frames, |seen| !seen.is_empty()).await;
    assert_eq!(
        frames.lock().await[0],
        ClientFrame::Join {
            user_id: UserId::new("alice")
        }
    );
    assert_eq!(channel.connection_state().await, ConnectionState::Connected);
    channel.disconnect().await;
}

#[tokio::test]
async fn resolves_ack_for_direct_message_exactly_once() {
    let ws_url = spawn_ws_server(WsServerState::default()).await;
    let channel = EventChannel::new(ws_url, test_identity(), test_policy());
    channel.connect().await;

    let temp_id = MessageId::provisional();
    let rx = channel
        .emit_with_ack(temp_id.clone(), direct_message(&temp_id, "hello"))
        .await
        .expect("emit");

    let outcome = tokio::time::timeout(Duration::from_secs(2), rx)
        .await
        .expect("ack within timeout")
        .expect("ack delivered");
    match outcome {
        AckOutcome::Confirmed(payload) => {
            assert_eq!(payload.message_id, MessageId::new("srv-1"));
            assert_eq!(payload.body, "hello");
        }
        other => panic!("unexpected outcome: {other:?}"),
    }
    channel.disconnect().await;
}

#[tokio::test]
async fn frames_emitted_while_disconnected_flush_after_connect() {
    let state = WsServerState::default();
    let frames = state.frames.clone();
    let ws_url = spawn_ws_server(state).await;

    let channel = EventChannel::new(ws_url, test_identity(), test_policy());

    // Queued before any session exists.
    let temp_id = MessageId::provisional();
    let rx = channel
        .emit_with_ack(temp_id.clone(), direct_message(&temp_id, "queued offline"))
        .await
        .expect("emit while disconnected");

    channel.connect().await;

    let outcome = tokio::time::timeout(Duration::from_secs(2), rx)
        .await
        .expect("ack within timeout")
        .expect("ack delivered");
    assert!(matches!(outcome, AckOutcome::Confirmed(_)));

    let seen = frames.lock().await;
    assert!(seen
        .iter()
        .any(|f| matches!(f, ClientFrame::DirectMessage { body, .. } if body == "queued offline")));
    channel.disconnect().await;
}

#[tokio::test]
async fn reconnect_reannounces_identity_and_active_conversation() {
    let state = WsServerState {
        drop_first_session: true,
        ..WsServerState::default()
    };
    let frames = state.frames.clone();
    let sessions = state.sessions.clone();
    let ws_url = spawn_ws_server(state).await;

    let channel = EventChannel::new(ws_url, test_identity(), test_policy());
    channel
        .set_active_conversation(Some(UserId::new("bob")))
        .await;
    channel.connect().await;

    wait_for_sessions(&sessions, 2).await;
    wait_for_frames(&frames, |seen| {
        seen.iter()
            .filter(|f| matches!(f, ClientFrame::Join { .. }))
            .count()
            >= 2
    })
    .await;

    wait_for_frames(&frames, |seen| seen.iter().any(|f| matches!(
        f,
        ClientFrame::ChatActive {
            conversation_id: Some(id)
        } if *id == UserId::new("bob")
    ))).await;
    channel.disconnect().await;
}

#[tokio::test]
async fn disconnect_fails_pending_acks() {
    let state = WsServerState {
        suppress_acks: true,
        ..WsServerState::default()
    };
    let ws_url = spawn_ws_server(state).await;
    let channel = EventChannel::new(ws_url, test_identity(), test_policy());
    channel.connect().await;

    let temp_id = MessageId::provisional();
    let rx = channel
        .emit_with_ack(temp_id.clone(), direct_message(&temp_id, "never acked"))
        .await
        .expect("emit");

    channel.disconnect().await;

    assert!(tokio::time::timeout(Duration::from_secs(1), rx)
        .await
        .expect("resolution within timeout")
        .is_err());
    assert_eq!(
        channel.connection_state().await,
        ConnectionState::Disconnected
    );
}
