use std::{collections::HashMap, sync::Arc};

use futures::{stream::SplitSink, SinkExt, StreamExt};
use shared::{
    domain::{ConversationId, MessageId},
    error::{ApiError, ErrorCode},
    protocol::{ClientFrame, MessagePayload, ServerEvent},
};
use tokio::{
    net::TcpStream,
    sync::{broadcast, mpsc, oneshot, Mutex},
    task::JoinHandle,
};
use tokio_tungstenite::{
    connect_async, tungstenite::Message as WsMessage, MaybeTlsStream, WebSocketStream,
};
use tracing::{debug, error, info, warn};

use crate::{error::ChannelError, identity::Identity, retry::ReconnectPolicy};

type WsSink = SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, WsMessage>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

#[derive(Debug, Clone)]
pub enum ChannelEvent {
    Server(ServerEvent),
    ConnectionChanged(ConnectionState),
}

/// Resolution of an acked `direct_message` emission. Delivered at most once;
/// a dropped receiver means the channel was torn down first.
#[derive(Debug)]
pub enum AckOutcome {
    Confirmed(MessagePayload),
    Rejected(ApiError),
}

/// Owns the websocket lifecycle: dialing, identity announcement, bounded
/// reconnection, frame fan-in/fan-out, and the pending-ack registry.
///
/// Connection failures never reach callers as errors; they surface through
/// `ConnectionChanged` events. Frames emitted while disconnected are queued
/// and flushed by the next session.
pub struct EventChannel {
    ws_url: String,
    identity: Identity,
    policy: ReconnectPolicy,
    events: broadcast::Sender<ChannelEvent>,
    outbound: mpsc::UnboundedSender<ClientFrame>,
    outbound_rx: Mutex<Option<mpsc::UnboundedReceiver<ClientFrame>>>,
    pending_acks: Arc<Mutex<HashMap<MessageId, oneshot::Sender<AckOutcome>>>>,
    connection: Mutex<ConnectionState>,
    active_conversation: Mutex<Option<ConversationId>>,
    supervisor: Mutex<Option<JoinHandle<()>>>,
}

impl EventChannel {
    pub fn new(ws_url: String, identity: Identity, policy: ReconnectPolicy) -> Arc<Self> {
        let (events, _) = broadcast::channel(1024);
        let (outbound, outbound_rx) = mpsc::unbounded_channel();
        Arc::new(Self {
            ws_url,
            identity,
            policy,
            events,
            outbound,
            outbound_rx: Mutex::new(Some(outbound_rx)),
            pending_acks: Arc::new(Mutex::new(HashMap::new())),
            connection: Mutex::new(ConnectionState::Disconnected),
            active_conversation: Mutex::new(None),
            supervisor: Mutex::new(None),
        })
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ChannelEvent> {
        self.events.subscribe()
    }

    pub async fn connection_state(&self) -> ConnectionState {
        *self.connection.lock().await
    }

    /// Start the connection supervisor. Returns immediately; progress is
    /// observable through `ConnectionChanged` events. Calling twice is a
    /// no-op while the first supervisor is alive.
    pub async fn connect(self: &Arc<Self>) {
        let mut supervisor = self.supervisor.lock().await;
        if supervisor.is_some() {
            return;
        }
        let Some(rx) = self.outbound_rx.lock().await.take() else {
            return;
        };
        let channel = Arc::clone(self);
        *supervisor = Some(tokio::spawn(async move {
            channel.run_supervisor(rx).await;
        }));
    }

    /// Tear the channel down: abort the supervisor, fail every pending ack,
    /// report `Disconnected`. Guaranteed teardown path for the controller.
    pub async fn disconnect(&self) {
        if let Some(handle) = self.supervisor.lock().await.take() {
            handle.abort();
        }
        self.fail_pending_acks().await;
        self.set_connection(ConnectionState::Disconnected).await;
    }

    /// Queue one frame for the current (or next) session.
    pub fn emit(&self, frame: ClientFrame) -> Result<(), ChannelError> {
        self.outbound.send(frame).map_err(|_| ChannelError::Closed)
    }

    /// Queue an acked frame; the returned receiver resolves at most once.
    /// The caller owns any timeout policy.
    pub async fn emit_with_ack(
        &self,
        temp_id: MessageId,
        frame: ClientFrame,
    ) -> Result<oneshot::Receiver<AckOutcome>, ChannelError> {
        let (tx, rx) = oneshot::channel();
        self.pending_acks.lock().await.insert(temp_id.clone(), tx);
        if let Err(err) = self.emit(frame) {
            self.pending_acks.lock().await.remove(&temp_id);
            return Err(err);
        }
        Ok(rx)
    }

    /// Remember the active conversation for reconnect re-announcement and
    /// tell the server about it now (best effort).
    pub async fn set_active_conversation(&self, conversation: Option<ConversationId>) {
        *self.active_conversation.lock().await = conversation.clone();
        let _ = self.emit(ClientFrame::ChatActive {
            conversation_id: conversation,
        });
    }

    async fn run_supervisor(self: Arc<Self>, mut rx: mpsc::UnboundedReceiver<ClientFrame>) {
        let mut failed_attempts = 0u32;
        loop {
            self.set_connection(ConnectionState::Connecting).await;
            match connect_async(self.dial_url()).await {
                Ok((stream, _)) => {
                    failed_attempts = 0;
                    info!(url = %self.ws_url, "event channel connected");
                    self.set_connection(ConnectionState::Connected).await;
                    self.run_session(stream, &mut rx).await;
                    warn!("event channel session ended");
                    self.set_connection(ConnectionState::Disconnected).await;
                }
                Err(err) => {
                    warn!(error = %err, failed_attempts, "event channel connect failed");
                    self.set_connection(ConnectionState::Disconnected).await;
                    if self.policy.attempts_exhausted(failed_attempts + 1) {
                        error!(
                            attempts = failed_attempts + 1,
                            "event channel reconnect attempts exhausted"
                        );
                        self.fail_pending_acks().await;
                        return;
                    }
                }
            }
            tokio::time::sleep(self.policy.delay_for_attempt(failed_attempts)).await;
            failed_attempts += 1;
        }
    }

    async fn run_session(
        &self,
        stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
        rx: &mut mpsc::UnboundedReceiver<ClientFrame>,
    ) {
        let (mut sink, mut reader) = stream.split();

        // Announce identity first so the server can attribute presence, then
        // restore the active-conversation routing hint.
        let user_id = self.identity.user_id.clone();
        if Self::send_frame(&mut sink, &ClientFrame::Join { user_id })
            .await
            .is_err()
        {
            return;
        }
        let active = self.active_conversation.lock().await.clone();
        if let Some(conversation) = active {
            let frame = ClientFrame::ChatActive {
                conversation_id: Some(conversation),
            };
            if Self::send_frame(&mut sink, &frame).await.is_err() {
                return;
            }
        }

        loop {
            tokio::select! {
                queued = rx.recv() => {
                    let Some(frame) = queued else { return };
                    if Self::send_frame(&mut sink, &frame).await.is_err() {
                        return;
                    }
                }
                incoming = reader.next() => {
                    match incoming {
                        Some(Ok(WsMessage::Text(text))) => self.handle_text_frame(&text).await,
                        Some(Ok(WsMessage::Close(_))) | None => return,
                        Some(Ok(_)) => {}
                        Some(Err(err)) => {
                            warn!(error = %err, "websocket receive failed");
                            return;
                        }
                    }
                }
            }
        }
    }

    async fn handle_text_frame(&self, text: &str) {
        let event = match serde_json::from_str::<ServerEvent>(text) {
            Ok(event) => event,
            Err(err) => {
                warn!(error = %err, "dropping unparseable server frame");
                return;
            }
        };

        if let ServerEvent::Ack {
            temp_id,
            message,
            error,
        } = event
        {
            let Some(waiter) = self.pending_acks.lock().await.remove(&temp_id) else {
                debug!(temp_id = %temp_id, "ack for unknown or timed-out send");
                return;
            };
            let outcome = match (message, error) {
                (Some(payload), _) => AckOutcome::Confirmed(payload),
                (None, Some(api)) => AckOutcome::Rejected(api),
                (None, None) => AckOutcome::Rejected(ApiError::new(
                    ErrorCode::Internal,
                    "ack carried neither message nor error",
                )),
            };
            let _ = waiter.send(outcome);
            return;
        }

        let _ = self.events.send(ChannelEvent::Server(event));
    }

    async fn send_frame(sink: &mut WsSink, frame: &ClientFrame) -> Result<(), ()> {
        let text = match serde_json::to_string(frame) {
            Ok(text) => text,
            Err(err) => {
                warn!(error = %err, "failed to serialize outbound frame");
                return Ok(());
            }
        };
        sink.send(WsMessage::Text(text)).await.map_err(|err| {
            warn!(error = %err, "websocket send failed");
        })
    }

    async fn set_connection(&self, next: ConnectionState) {
        let mut state = self.connection.lock().await;
        if *state == next {
            return;
        }
        *state = next;
        let _ = self.events.send(ChannelEvent::ConnectionChanged(next));
    }

    async fn fail_pending_acks(&self) {
        // Dropping the senders resolves every waiter with a receive error.
        self.pending_acks.lock().await.clear();
    }

    fn dial_url(&self) -> String {
        format!("{}?token={}", self.ws_url, self.identity.token)
    }
}

#[cfg(test)]
#[path = "tests/channel_tests.rs"]
mod tests;
