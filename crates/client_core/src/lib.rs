use std::{
    collections::{HashMap, HashSet},
    sync::Arc,
};

use anyhow::{Context, Result};
use async_trait::async_trait;
use shared::{
    domain::{BodyType, ConversationId, MessageId, UserId},
    protocol::{ClientFrame, ConversationSeed, MessagePayload, ServerEvent, SuggestionSeed},
};
use tokio::{
    sync::{broadcast, mpsc, Mutex},
    task::JoinHandle,
};
use tracing::{debug, info, warn};

pub mod channel;
pub mod config;
pub mod conversation_index;
pub mod error;
pub mod identity;
pub mod message_store;
pub mod retry;
pub mod typing;

pub use channel::{AckOutcome, ChannelEvent, ConnectionState, EventChannel};
pub use config::{load_config, SyncConfig};
pub use conversation_index::{ConversationIndex, ConversationSummary, SuggestionEntry};
pub use error::{ChannelError, SyncError};
pub use identity::Identity;
pub use message_store::{DeliveryStatus, IncomingApplied, Message, MessageStore};
pub use retry::ReconnectPolicy;
pub use typing::TypingTracker;

/// Controller lifecycle. `Ready` may return to `Loading` on explicit refresh.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncPhase {
    Uninitialized,
    Loading,
    Ready,
}

/// Events pushed to the embedding UI. Snapshot accessors return the state the
/// event refers to.
#[derive(Debug, Clone)]
pub enum SyncEvent {
    PhaseChanged(SyncPhase),
    ConnectionChanged(ConnectionState),
    ConversationsUpdated,
    MessagesUpdated { conversation_id: ConversationId },
    TypingChanged { user_id: UserId, typing: bool },
    PresenceChanged { user_id: UserId, online: bool },
    Error(String),
}

/// Snapshot of the per-session ephemeral state.
#[derive(Debug, Clone)]
pub struct SessionState {
    pub active_conversation_id: Option<ConversationId>,
    pub connection_state: ConnectionState,
    pub typing_by_user: HashMap<UserId, bool>,
}

struct SyncState {
    phase: SyncPhase,
    active_conversation: Option<ConversationId>,
    typing_by_user: HashMap<UserId, bool>,
    history_loaded: HashSet<ConversationId>,
    store: MessageStore,
    index: ConversationIndex,
}

/// The synchronization engine: orchestrates the initial load, routes channel
/// events into the message store and conversation index, and exposes the
/// UI-facing API.
///
/// All store/index mutations pass through the single `inner` mutex, so the
/// engine behaves as one owning actor regardless of runtime threading.
pub struct SyncClient {
    http: reqwest::Client,
    config: SyncConfig,
    identity: Identity,
    channel: Arc<EventChannel>,
    inner: Mutex<SyncState>,
    events: broadcast::Sender<SyncEvent>,
    typing: TypingTracker,
    typing_rx: Mutex<Option<mpsc::UnboundedReceiver<ClientFrame>>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl SyncClient {
    pub fn new(config: SyncConfig, identity: Identity) -> Result<Arc<Self>, SyncError> {
        let ws_url = config.ws_url()?;
        let channel = EventChannel::new(ws_url, identity.clone(), config.reconnect_policy());
        let (events, _) = broadcast::channel(1024);
        let (typing_tx, typing_rx) = mpsc::unbounded_channel();
        let typing = TypingTracker::new(typing_tx, config.typing_idle_window);

        Ok(Arc::new(Self {
            http: reqwest::Client::new(),
            config,
            identity,
            channel,
            inner: Mutex::new(SyncState {
                phase: SyncPhase::Uninitialized,
                active_conversation: None,
                typing_by_user: HashMap::new(),
                history_loaded: HashSet::new(),
                store: MessageStore::default(),
                index: ConversationIndex::default(),
            }),
            events,
            typing,
            typing_rx: Mutex::new(Some(typing_rx)),
            tasks: Mutex::new(Vec::new()),
        }))
    }

    /// Bring the engine up: subscribe the event pump, dial the channel
    /// (non-blocking), run the initial REST load, reach `Ready`.
    ///
    /// Fetch failures are logged and surfaced as `SyncEvent::Error`; the
    /// engine still reaches `Ready` with whatever state it has.
    pub async fn start(self: &Arc<Self>) {
        self.set_phase(SyncPhase::Loading).await;

        let channel_events = self.channel.subscribe();
        let pump = {
            let client = Arc::clone(self);
            tokio::spawn(async move {
                client.run_event_pump(channel_events).await;
            })
        };
        let typing_forwarder = {
            let client = Arc::clone(self);
            let rx = self.typing_rx.lock().await.take();
            tokio::spawn(async move {
                let Some(mut rx) = rx else { return };
                while let Some(frame) = rx.recv().await {
                    if client.channel.emit(frame).is_err() {
                        break;
                    }
                }
            })
        };
        self.tasks.lock().await.extend([pump, typing_forwarder]);

        self.channel.connect().await;
        self.initial_load().await;
        self.set_phase(SyncPhase::Ready).await;
    }

    /// Explicit reload of the conversation list and presence snapshot.
    pub async fn refresh(&self) {
        self.set_phase(SyncPhase::Loading).await;
        self.initial_load().await;
        self.set_phase(SyncPhase::Ready).await;
    }

    /// Release every resource `start` acquired: pump and forwarder tasks,
    /// typing timers, the channel supervisor.
    pub async fn shutdown(&self) {
        for task in self.tasks.lock().await.drain(..) {
            task.abort();
        }
        self.typing.shutdown().await;
        self.channel.disconnect().await;
        info!("sync engine shut down");
    }

    /// Optimistically insert an outgoing message and return its provisional
    /// id synchronously; emission and ack reconciliation run in the
    /// background. A failed or timed-out ack leaves the record with status
    /// `Failed` for a retry affordance.
    pub async fn send_message(
        self: &Arc<Self>,
        receiver_id: &UserId,
        body: &str,
        body_type: BodyType,
    ) -> MessageId {
        let me = self.identity.user_id.clone();
        let temp_id = {
            let mut inner = self.inner.lock().await;
            let is_active = inner.active_conversation.as_ref() == Some(receiver_id);
            let temp_id = inner
                .store
                .append_outgoing(&me, receiver_id, body, body_type);
            if let Some(message) = inner.store.last_message(receiver_id).cloned() {
                inner.index.on_message_event(&message, is_active, &me);
            }
            temp_id
        };
        let _ = self.events.send(SyncEvent::MessagesUpdated {
            conversation_id: receiver_id.clone(),
        });
        let _ = self.events.send(SyncEvent::ConversationsUpdated);

        // Sending ends the local typing burst.
        self.typing.stopped(receiver_id).await;

        let frame = ClientFrame::DirectMessage {
            temp_id: temp_id.clone(),
            receiver_id: receiver_id.clone(),
            body: body.to_string(),
            body_type,
        };
        let client = Arc::clone(self);
        let conversation_id = receiver_id.clone();
        let ack_id = temp_id.clone();
        tokio::spawn(async move {
            client.settle_outgoing(conversation_id, ack_id, frame).await;
        });

        temp_id
    }

    /// Tombstone a message server-side, then locally. The broadcasted
    /// `message_deleted` event applies idempotently on top.
    pub async fn delete_message(
        &self,
        message_id: &MessageId,
        conversation_id: &ConversationId,
    ) -> Result<(), SyncError> {
        self.http
            .delete(format!(
                "{}/messages/{}",
                self.config.server_url, message_id
            ))
            .bearer_auth(&self.identity.token)
            .send()
            .await?
            .error_for_status()?;

        self.apply_local_tombstone(message_id, conversation_id).await;
        Ok(())
    }

    /// Announce the active conversation, mark it read, and lazily load its
    /// history on first activation.
    pub async fn set_active_conversation(&self, conversation: Option<ConversationId>) {
        {
            let mut inner = self.inner.lock().await;
            inner.active_conversation = conversation.clone();
        }
        self.channel
            .set_active_conversation(conversation.clone())
            .await;

        let Some(conversation_id) = conversation else {
            return;
        };

        self.mark_read_and_emit(&conversation_id).await;

        let needs_history = {
            let inner = self.inner.lock().await;
            !inner.history_loaded.contains(&conversation_id)
        };
        if needs_history && self.load_conversation_history(&conversation_id).await {
            // Newly fetched pages may contain unread messages.
            self.mark_read_and_emit(&conversation_id).await;
        }
    }

    pub async fn set_typing(&self, receiver_id: &UserId, typing: bool) {
        if typing {
            self.typing.keystroke(receiver_id).await;
        } else {
            self.typing.stopped(receiver_id).await;
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.events.subscribe()
    }

    pub async fn phase(&self) -> SyncPhase {
        self.inner.lock().await.phase
    }

    pub async fn conversations(&self) -> Vec<ConversationSummary> {
        self.inner.lock().await.index.conversations()
    }

    pub async fn suggestions(&self) -> Vec<SuggestionEntry> {
        self.inner.lock().await.index.suggestions()
    }

    pub async fn messages(&self, conversation_id: &ConversationId) -> Vec<Message> {
        self.inner
            .lock()
            .await
            .store
            .conversation(conversation_id)
            .to_vec()
    }

    pub async fn connection_state(&self) -> ConnectionState {
        self.channel.connection_state().await
    }

    pub async fn session_state(&self) -> SessionState {
        let connection_state = self.channel.connection_state().await;
        let inner = self.inner.lock().await;
        SessionState {
            active_conversation_id: inner.active_conversation.clone(),
            connection_state,
            typing_by_user: inner.typing_by_user.clone(),
        }
    }

    async fn run_event_pump(self: Arc<Self>, mut rx: broadcast::Receiver<ChannelEvent>) {
        let mut lost_session = false;
        loop {
            match rx.recv().await {
                Ok(ChannelEvent::ConnectionChanged(state)) => {
                    let _ = self.events.send(SyncEvent::ConnectionChanged(state));
                    match state {
                        ConnectionState::Disconnected => lost_session = true,
                        ConnectionState::Connected if lost_session => {
                            lost_session = false;
                            info!("event channel recovered; resynchronizing");
                            let client = Arc::clone(&self);
                            tokio::spawn(async move {
                                client.resync_after_reconnect().await;
                            });
                        }
                        _ => {}
                    }
                }
                Ok(ChannelEvent::Server(event)) => self.handle_server_event(event).await,
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "event pump lagged behind the channel");
                }
                Err(broadcast::error::RecvError::Closed) => return,
            }
        }
    }

    async fn handle_server_event(&self, event: ServerEvent) {
        match event {
            ServerEvent::NewMessage { message } => self.on_new_message(message).await,
            ServerEvent::MessageDelivered {
                message_id,
                conversation_id,
            } => {
                self.on_status_event(message_id, conversation_id, DeliveryStatus::Delivered)
                    .await
            }
            ServerEvent::MessageRead {
                message_id,
                conversation_id,
            } => {
                self.on_status_event(message_id, conversation_id, DeliveryStatus::Read)
                    .await
            }
            ServerEvent::MessageDeleted {
                message_id,
                conversation_id,
            } => {
                self.apply_local_tombstone(&message_id, &conversation_id)
                    .await
            }
            ServerEvent::UserTyping { user_id } => self.on_typing_event(user_id, true).await,
            ServerEvent::UserStopTyping { user_id } => self.on_typing_event(user_id, false).await,
            ServerEvent::UserOnline { user_id } => self.on_presence_event(user_id, true).await,
            ServerEvent::UserOffline { user_id } => self.on_presence_event(user_id, false).await,
            ServerEvent::Error(api) => {
                warn!(error = %api, "server reported an error");
                let _ = self.events.send(SyncEvent::Error(api.to_string()));
            }
            // Acks are resolved inside the channel adapter.
            ServerEvent::Ack { .. } => {}
        }
    }

    async fn on_new_message(&self, payload: MessagePayload) {
        let me = self.identity.user_id.clone();
        let message = Message::from_payload(&payload, &me);
        let conversation_id = message.conversation_id.clone();
        let incoming = payload.sender_id != me;

        let (applied, name_changed, read_receipt) = {
            let mut inner = self.inner.lock().await;
            let is_active = inner.active_conversation.as_ref() == Some(&conversation_id);
            let name_changed = match payload.sender_username.as_deref() {
                Some(username) => inner.index.resolve_display_name(&payload.sender_id, username),
                None => false,
            };
            let applied = inner.store.apply_incoming(message.clone());
            if applied != IncomingApplied::AlreadyKnown {
                inner.index.on_message_event(&message, is_active, &me);
            }
            // A message landing in the open conversation is read right away;
            // the server still needs the receipt to converge.
            let read_receipt = if incoming && is_active && applied != IncomingApplied::AlreadyKnown
            {
                inner.store.apply_status_update(
                    &message.id,
                    &conversation_id,
                    DeliveryStatus::Read,
                );
                Some((message.id.clone(), message.sender_id.clone()))
            } else {
                None
            };
            (applied, name_changed, read_receipt)
        };

        if let Some((message_id, sender_id)) = read_receipt {
            let _ = self.channel.emit(ClientFrame::MarkAsRead {
                message_id,
                sender_id,
            });
        }

        if applied != IncomingApplied::AlreadyKnown {
            let _ = self.events.send(SyncEvent::MessagesUpdated { conversation_id });
            let _ = self.events.send(SyncEvent::ConversationsUpdated);
        } else if name_changed {
            let _ = self.events.send(SyncEvent::ConversationsUpdated);
        }
    }

    async fn on_status_event(
        &self,
        message_id: MessageId,
        conversation_id: ConversationId,
        status: DeliveryStatus,
    ) {
        let changed = {
            let mut inner = self.inner.lock().await;
            inner
                .store
                .apply_status_update(&message_id, &conversation_id, status)
        };
        if changed {
            let _ = self.events.send(SyncEvent::MessagesUpdated { conversation_id });
        } else {
            debug!(message_id = %message_id, ?status, "dropped regressive or unknown status update");
        }
    }

    async fn on_typing_event(&self, user_id: UserId, typing: bool) {
        {
            let mut inner = self.inner.lock().await;
            inner.typing_by_user.insert(user_id.clone(), typing);
            inner.index.on_typing_event(&user_id, typing);
        }
        let _ = self.events.send(SyncEvent::TypingChanged { user_id, typing });
    }

    async fn on_presence_event(&self, user_id: UserId, online: bool) {
        {
            let mut inner = self.inner.lock().await;
            inner.index.on_presence_event(&user_id, online);
        }
        let _ = self.events.send(SyncEvent::PresenceChanged { user_id, online });
        let _ = self.events.send(SyncEvent::ConversationsUpdated);
    }

    async fn settle_outgoing(
        &self,
        conversation_id: ConversationId,
        temp_id: MessageId,
        frame: ClientFrame,
    ) {
        let confirmed = match self.channel.emit_with_ack(temp_id.clone(), frame).await {
            Ok(rx) => match tokio::time::timeout(self.config.ack_timeout, rx).await {
                Ok(Ok(AckOutcome::Confirmed(payload))) => Some(payload),
                Ok(Ok(AckOutcome::Rejected(api))) => {
                    warn!(temp_id = %temp_id, error = %api, "send rejected by server");
                    let _ = self
                        .events
                        .send(SyncEvent::Error(format!("send rejected: {api}")));
                    None
                }
                Ok(Err(_)) => {
                    warn!(temp_id = %temp_id, "channel torn down before ack");
                    None
                }
                Err(_) => {
                    warn!(temp_id = %temp_id, "ack timed out");
                    None
                }
            },
            Err(err) => {
                warn!(temp_id = %temp_id, error = %err, "emit failed");
                None
            }
        };

        let changed = {
            let mut inner = self.inner.lock().await;
            inner.store.reconcile_outgoing_ack(
                &conversation_id,
                &temp_id,
                confirmed.as_ref(),
                &self.identity.user_id,
            )
        };
        if changed {
            let _ = self.events.send(SyncEvent::MessagesUpdated { conversation_id });
        }
    }

    async fn apply_local_tombstone(
        &self,
        message_id: &MessageId,
        conversation_id: &ConversationId,
    ) {
        let changed = {
            let mut inner = self.inner.lock().await;
            let changed = inner.store.apply_deleted(message_id, conversation_id);
            if changed {
                let last = inner.store.last_message(conversation_id).cloned();
                inner
                    .index
                    .on_message_deleted(conversation_id, last.as_ref());
            }
            changed
        };
        if changed {
            let _ = self.events.send(SyncEvent::MessagesUpdated {
                conversation_id: conversation_id.clone(),
            });
            let _ = self.events.send(SyncEvent::ConversationsUpdated);
        }
    }

    async fn mark_read_and_emit(&self, conversation_id: &ConversationId) {
        let receipts = {
            let mut inner = self.inner.lock().await;
            let receipts = inner
                .store
                .mark_conversation_read(conversation_id, &self.identity.user_id);
            inner.index.clear_unread(conversation_id);
            receipts
        };
        // One receipt per affected message so the server can attribute each
        // read individually.
        for (message_id, sender_id) in receipts {
            let _ = self.channel.emit(ClientFrame::MarkAsRead {
                message_id,
                sender_id,
            });
        }
        let _ = self.events.send(SyncEvent::ConversationsUpdated);
        let _ = self.events.send(SyncEvent::MessagesUpdated {
            conversation_id: conversation_id.clone(),
        });
    }

    async fn initial_load(&self) {
        match self.fetch_conversations().await {
            Ok(seeds) => {
                self.inner.lock().await.index.apply_seeds(seeds);
            }
            Err(err) => self.report_fetch_failure("conversation list", err),
        }
        match self.fetch_suggestions().await {
            Ok(seeds) => {
                self.inner.lock().await.index.apply_suggestions(seeds);
            }
            Err(err) => self.report_fetch_failure("suggestions", err),
        }
        match self.fetch_presence().await {
            Ok(online) => {
                self.inner.lock().await.index.apply_presence_snapshot(&online);
            }
            Err(err) => self.report_fetch_failure("presence snapshot", err),
        }
        let _ = self.events.send(SyncEvent::ConversationsUpdated);
    }

    async fn resync_after_reconnect(&self) {
        self.initial_load().await;
        let active = { self.inner.lock().await.active_conversation.clone() };
        if let Some(conversation_id) = active {
            if self.load_conversation_history(&conversation_id).await {
                self.mark_read_and_emit(&conversation_id).await;
            }
        }
    }

    /// Fetch one page and replace the stored sequence. Returns whether the
    /// fetch succeeded.
    async fn load_conversation_history(&self, conversation_id: &ConversationId) -> bool {
        match self.fetch_messages(conversation_id).await {
            Ok(payloads) => {
                let me = &self.identity.user_id;
                let page: Vec<Message> = payloads
                    .iter()
                    .map(|payload| Message::from_payload(payload, me))
                    .collect();
                {
                    let mut inner = self.inner.lock().await;
                    inner.store.load_history(conversation_id.clone(), page);
                    inner.history_loaded.insert(conversation_id.clone());
                }
                let _ = self.events.send(SyncEvent::MessagesUpdated {
                    conversation_id: conversation_id.clone(),
                });
                true
            }
            Err(err) => {
                self.report_fetch_failure("message history", err);
                false
            }
        }
    }

    fn report_fetch_failure(&self, what: &str, err: anyhow::Error) {
        warn!(error = %err, "{what} fetch failed; continuing with local state");
        let _ = self
            .events
            .send(SyncEvent::Error(format!("{what} fetch failed: {err}")));
    }

    async fn fetch_conversations(&self) -> Result<Vec<ConversationSeed>> {
        let seeds = self
            .http
            .get(format!("{}/conversations", self.config.server_url))
            .bearer_auth(&self.identity.token)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await
            .context("conversation list response was not valid JSON")?;
        Ok(seeds)
    }

    async fn fetch_presence(&self) -> Result<Vec<UserId>> {
        let online = self
            .http
            .get(format!("{}/presence", self.config.server_url))
            .bearer_auth(&self.identity.token)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await
            .context("presence response was not valid JSON")?;
        Ok(online)
    }

    async fn fetch_suggestions(&self) -> Result<Vec<SuggestionSeed>> {
        let seeds = self
            .http
            .get(format!("{}/suggestions", self.config.server_url))
            .bearer_auth(&self.identity.token)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await
            .context("suggestions response was not valid JSON")?;
        Ok(seeds)
    }

    async fn fetch_messages(
        &self,
        conversation_id: &ConversationId,
    ) -> Result<Vec<MessagePayload>> {
        let messages = self
            .http
            .get(format!(
                "{}/conversations/{}/messages",
                self.config.server_url, conversation_id
            ))
            .query(&[("limit", self.config.history_page_size)])
            .bearer_auth(&self.identity.token)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await
            .context("message history response was not valid JSON")?;
        Ok(messages)
    }

    async fn set_phase(&self, phase: SyncPhase) {
        {
            let mut inner = self.inner.lock().await;
            if inner.phase == phase {
                return;
            }
            inner.phase = phase;
        }
        let _ = self.events.send(SyncEvent::PhaseChanged(phase));
    }
}

/// UI-facing surface of the engine, mirroring the operations a chat frontend
/// binds to.
#[async_trait]
pub trait SyncHandle: Send + Sync {
    async fn send_message(
        &self,
        receiver_id: &UserId,
        body: &str,
        body_type: BodyType,
    ) -> MessageId;
    async fn delete_message(
        &self,
        message_id: &MessageId,
        conversation_id: &ConversationId,
    ) -> Result<(), SyncError>;
    async fn set_typing(&self, receiver_id: &UserId, typing: bool);
    async fn set_active_conversation(&self, conversation: Option<ConversationId>);
    async fn chat_list(&self) -> Vec<ConversationSummary>;
    async fn conversation_messages(&self, conversation_id: &ConversationId) -> Vec<Message>;
    async fn session_state(&self) -> SessionState;
    fn subscribe_events(&self) -> broadcast::Receiver<SyncEvent>;
}

#[async_trait]
impl SyncHandle for Arc<SyncClient> {
    async fn send_message(
        &self,
        receiver_id: &UserId,
        body: &str,
        body_type: BodyType,
    ) -> MessageId {
        SyncClient::send_message(self, receiver_id, body, body_type).await
    }

    async fn delete_message(
        &self,
        message_id: &MessageId,
        conversation_id: &ConversationId,
    ) -> Result<(), SyncError> {
        SyncClient::delete_message(self, message_id, conversation_id).await
    }

    async fn set_typing(&self, receiver_id: &UserId, typing: bool) {
        SyncClient::set_typing(self, receiver_id, typing).await
    }

    async fn set_active_conversation(&self, conversation: Option<ConversationId>) {
        SyncClient::set_active_conversation(self, conversation).await
    }

    async fn chat_list(&self) -> Vec<ConversationSummary> {
        self.conversations().await
    }

    async fn conversation_messages(&self, conversation_id: &ConversationId) -> Vec<Message> {
        self.messages(conversation_id).await
    }

    async fn session_state(&self) -> SessionState {
        SyncClient::session_state(self).await
    }

    fn subscribe_events(&self) -> broadcast::Receiver<SyncEvent> {
        self.subscribe()
    }
}

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
