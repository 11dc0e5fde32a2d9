//! Session controller: owns the single active chat session, its transport lifecycle, and
//! its message store.
//!
//! Opening a session tears the previous one down first, then starts two tasks: a driver
//! (connect, subscribe, pump live messages, reconnect with a fixed delay) and a one-shot
//! history fetch. Both tag their writes with the session generation, so results that
//! belong to a replaced session are discarded.

use crate::config::{self, ChatConfig, Config};
use crate::history::{HistoryClient, RestHistoryClient};
use crate::message::{
    join_destination, send_destination, topic_for, ChatMessage, TaskId, UserId, ValidationError,
};
use crate::session::{ChatSession, LocalIdentity};
use crate::store::{MessageStore, RenderableMessage};
use crate::transport::{StompTransport, Transport, TransportError, TransportEvent, TransportState};
use anyhow::Context;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, Mutex, RwLock};
use tokio::task::JoinHandle;

const EVENT_CAPACITY: usize = 256;

/// Where the history fetch for the current session stands.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(tag = "status", content = "error", rename_all = "camelCase")]
pub enum HistoryState {
    /// No session.
    #[default]
    Idle,
    Loading,
    Loaded,
    /// Loaded, and there is nothing to show yet.
    Empty,
    /// Fetch failed; live messages still flow. Call `retry_history` to try again.
    Failed(String),
}

/// Notifications for whatever renders the chat.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChatEvent {
    StateChanged { task_id: TaskId, state: TransportState },
    MessagesChanged { task_id: TaskId },
    HistoryLoaded { task_id: TaskId, count: usize },
    HistoryFailed { task_id: TaskId, error: String },
    ConnectFailed { task_id: TaskId, attempt: u32, error: String },
    SessionClosed { task_id: TaskId },
}

#[derive(Debug, thiserror::Error)]
pub enum ChatError {
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error("message not sent: {0}")]
    Publish(#[from] TransportError),
}

/// Point-in-time view of the controller for rendering.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatSnapshot {
    pub session: Option<ChatSession>,
    pub history: HistoryState,
    pub messages: Vec<RenderableMessage>,
}

/// State shared with the driver and history tasks.
struct Shared {
    generation: u64,
    session: Option<ChatSession>,
    store: MessageStore,
    history: HistoryState,
}

#[derive(Default)]
struct SessionTasks {
    driver: Option<JoinHandle<()>>,
    history: Option<JoinHandle<()>>,
}

async fn stop_task(handle: Option<JoinHandle<()>>) {
    if let Some(h) = handle {
        h.abort();
        let _ = h.await;
    }
}

/// Owns at most one [`ChatSession`] at a time.
pub struct SessionController {
    identity: LocalIdentity,
    transport: Arc<dyn Transport>,
    history: Arc<dyn HistoryClient>,
    config: ChatConfig,
    shared: Arc<RwLock<Shared>>,
    events: broadcast::Sender<ChatEvent>,
    /// Also serializes open/close.
    tasks: Mutex<SessionTasks>,
}

impl SessionController {
    pub fn new(
        identity: LocalIdentity,
        transport: Arc<dyn Transport>,
        history: Arc<dyn HistoryClient>,
        config: ChatConfig,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let store = MessageStore::new(identity.user_id, None);
        Self {
            identity,
            transport,
            history,
            config,
            shared: Arc::new(RwLock::new(Shared {
                generation: 0,
                session: None,
                store,
                history: HistoryState::Idle,
            })),
            events,
            tasks: Mutex::new(SessionTasks::default()),
        }
    }

    /// Controller wired to the STOMP transport and REST history client described by `config`.
    pub fn from_config(config: &Config) -> anyhow::Result<Self> {
        let user_id = config::resolve_user_id(config)
            .context("local user id not configured (identity.userId or TASKCHAT_USER_ID)")?;
        let token = config::resolve_token(config);
        let identity = LocalIdentity::new(
            user_id,
            config::resolve_user_name(config, user_id),
            token.clone(),
        );
        let transport = StompTransport::new(
            config.server.ws_endpoint.clone(),
            config.chat.connect_timeout(),
            config.chat.outbound_buffer,
        );
        let history = RestHistoryClient::new(
            &config.server.api_base,
            token,
            config.chat.connect_timeout(),
        );
        Ok(Self::new(
            identity,
            Arc::new(transport),
            Arc::new(history),
            config.chat.clone(),
        ))
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<ChatEvent> {
        self.events.subscribe()
    }

    /// Entry point for task and proposal views.
    pub async fn open_chat(&self, task_id: TaskId, counterpart_id: UserId, counterpart_name: Option<&str>) {
        self.open_session(task_id, Some(counterpart_id), counterpart_name.map(str::to_string))
            .await;
    }

    /// Replace any current session with one for `task_id` and start connecting.
    pub async fn open_session(
        &self,
        task_id: TaskId,
        counterpart_id: Option<UserId>,
        counterpart_name: Option<String>,
    ) {
        let mut tasks = self.tasks.lock().await;
        self.close_locked(&mut tasks).await;

        let mut session = ChatSession::new(task_id, &self.identity, counterpart_id, counterpart_name);
        session.transport_state = session.transport_state.apply(TransportEvent::ConnectRequested);
        let generation = {
            let mut g = self.shared.write().await;
            g.generation += 1;
            g.store = MessageStore::new(self.identity.user_id, session.counterpart_name.clone());
            g.history = HistoryState::Loading;
            g.session = Some(session.clone());
            g.generation
        };
        log::info!(
            "opening chat for task {} with {}",
            task_id,
            session.counterpart_name.as_deref().unwrap_or("unknown counterpart")
        );
        let _ = self.events.send(ChatEvent::StateChanged {
            task_id,
            state: session.transport_state,
        });

        let driver = Driver {
            transport: self.transport.clone(),
            shared: self.shared.clone(),
            events: self.events.clone(),
            generation,
            session,
            token: self.identity.token.clone(),
            reconnect_delay: self.config.reconnect_delay(),
            inbound_buffer: self.config.inbound_buffer.max(1),
        };
        tasks.driver = Some(tokio::spawn(driver.run()));
        tasks.history = Some(self.spawn_history(generation, task_id));
    }

    fn spawn_history(&self, generation: u64, task_id: TaskId) -> JoinHandle<()> {
        let history = self.history.clone();
        let shared = self.shared.clone();
        let events = self.events.clone();
        tokio::spawn(async move {
            let result = history.fetch_task_history(task_id).await;
            let mut g = shared.write().await;
            if g.generation != generation || g.session.is_none() {
                log::debug!("discarding stale history response for task {}", task_id);
                return;
            }
            match result {
                Ok(rows) => {
                    let count = rows.len();
                    g.store.seed(rows);
                    g.history = HistoryState::Loaded;
                    drop(g);
                    log::debug!("loaded {} history messages for task {}", count, task_id);
                    let _ = events.send(ChatEvent::HistoryLoaded { task_id, count });
                    let _ = events.send(ChatEvent::MessagesChanged { task_id });
                }
                Err(e) => {
                    let error = e.to_string();
                    g.history = HistoryState::Failed(error.clone());
                    drop(g);
                    log::warn!("history fetch for task {} failed: {}", task_id, error);
                    let _ = events.send(ChatEvent::HistoryFailed { task_id, error });
                }
            }
        })
    }

    /// Re-issue the history fetch after a failure. Returns false when there is nothing to retry.
    pub async fn retry_history(&self) -> bool {
        let mut tasks = self.tasks.lock().await;
        let (generation, task_id) = {
            let mut g = self.shared.write().await;
            let Some(task_id) = g.session.as_ref().map(|s| s.task_id) else {
                return false;
            };
            if !matches!(g.history, HistoryState::Failed(_)) {
                return false;
            }
            g.history = HistoryState::Loading;
            (g.generation, task_id)
        };
        stop_task(tasks.history.take()).await;
        tasks.history = Some(self.spawn_history(generation, task_id));
        true
    }

    /// Validate and publish `body` as the local user. The store is not touched; the copy
    /// that comes back on the subscription is the one that gets shown.
    pub async fn send_message(&self, body: &str) -> Result<(), ChatError> {
        if body.trim().is_empty() {
            return Err(ValidationError::EmptyBody.into());
        }
        let (task_id, counterpart_id, state) = {
            let g = self.shared.read().await;
            let session = g.session.as_ref().ok_or(ValidationError::NoSession)?;
            (session.task_id, session.counterpart_id, session.transport_state)
        };
        let receiver_id = counterpart_id.ok_or(ValidationError::CounterpartUnresolved)?;
        let message = ChatMessage::outgoing(task_id, self.identity.user_id, receiver_id, body)?;
        if state != TransportState::Connected {
            return Err(TransportError::NotConnected.into());
        }
        self.transport.publish(&send_destination(task_id), &message)?;
        log::debug!("published message for task {}", task_id);
        Ok(())
    }

    /// Tear down the session: stop tasks, unsubscribe and disconnect, clear the store.
    /// No-op without a session.
    pub async fn close_session(&self) {
        let mut tasks = self.tasks.lock().await;
        self.close_locked(&mut tasks).await;
    }

    async fn close_locked(&self, tasks: &mut SessionTasks) {
        let active = self.shared.read().await.session.is_some();
        if !active && tasks.driver.is_none() && tasks.history.is_none() {
            return;
        }
        stop_task(tasks.driver.take()).await;
        stop_task(tasks.history.take()).await;
        self.transport.teardown().await;

        let closed = {
            let mut g = self.shared.write().await;
            g.generation += 1;
            g.store.clear();
            g.history = HistoryState::Idle;
            g.session.take().map(|mut s| {
                s.transport_state = s.transport_state.apply(TransportEvent::Teardown);
                s.task_id
            })
        };
        if let Some(task_id) = closed {
            log::info!("closed chat for task {}", task_id);
            let _ = self.events.send(ChatEvent::StateChanged {
                task_id,
                state: TransportState::Disconnected,
            });
            let _ = self.events.send(ChatEvent::SessionClosed { task_id });
        }
    }

    pub async fn session(&self) -> Option<ChatSession> {
        self.shared.read().await.session.clone()
    }

    pub async fn state(&self) -> Option<TransportState> {
        self.shared
            .read()
            .await
            .session
            .as_ref()
            .map(|s| s.transport_state)
    }

    pub async fn history_state(&self) -> HistoryState {
        let g = self.shared.read().await;
        effective_history(&g)
    }

    /// The visible log, rendered against the current wall clock.
    pub async fn display_list(&self) -> Vec<RenderableMessage> {
        let g = self.shared.read().await;
        g.store.to_display_list(chrono::Utc::now()).collect()
    }

    pub async fn snapshot(&self) -> ChatSnapshot {
        let g = self.shared.read().await;
        ChatSnapshot {
            session: g.session.clone(),
            history: effective_history(&g),
            messages: g.store.to_display_list(chrono::Utc::now()).collect(),
        }
    }
}

fn effective_history(g: &Shared) -> HistoryState {
    match &g.history {
        HistoryState::Loaded if g.store.is_empty() => HistoryState::Empty,
        other => other.clone(),
    }
}

impl Drop for SessionController {
    fn drop(&mut self) {
        let tasks = self.tasks.get_mut();
        if let Some(h) = tasks.driver.take() {
            h.abort();
        }
        if let Some(h) = tasks.history.take() {
            h.abort();
        }
    }
}

/// Per-session connection loop.
struct Driver {
    transport: Arc<dyn Transport>,
    shared: Arc<RwLock<Shared>>,
    events: broadcast::Sender<ChatEvent>,
    generation: u64,
    session: ChatSession,
    token: Option<String>,
    reconnect_delay: Duration,
    inbound_buffer: usize,
}

impl Driver {
    async fn run(self) {
        let task_id = self.session.task_id;
        let topic = topic_for(task_id);
        let mut attempt: u32 = 0;
        let mut joined = false;
        loop {
            attempt += 1;
            let connected = match self.transport.connect(task_id, self.token.as_deref()).await {
                Ok(()) => {
                    let (tx, rx) = mpsc::channel(self.inbound_buffer);
                    self.transport.subscribe(&topic, tx).map(|_| rx)
                }
                Err(e) => Err(e),
            };
            let mut inbound = match connected {
                Ok(rx) => rx,
                Err(e) => {
                    log::warn!(
                        "chat connect for task {} failed (attempt {}): {}; retrying in {:?}",
                        task_id,
                        attempt,
                        e,
                        self.reconnect_delay
                    );
                    if !self.transition(TransportEvent::Failed).await {
                        return;
                    }
                    let _ = self.events.send(ChatEvent::ConnectFailed {
                        task_id,
                        attempt,
                        error: e.to_string(),
                    });
                    if !self.backoff().await {
                        return;
                    }
                    continue;
                }
            };

            attempt = 0;
            if !self.transition(TransportEvent::Connected).await {
                return;
            }
            log::info!("chat for task {} connected", task_id);
            if !joined {
                joined = true;
                self.send_join_notice();
            }

            while let Some(msg) = inbound.recv().await {
                if msg.task_id != task_id {
                    log::warn!(
                        "dropping message for task {} received on task {} subscription",
                        msg.task_id,
                        task_id
                    );
                    continue;
                }
                let added = {
                    let mut g = self.shared.write().await;
                    if g.generation != self.generation {
                        return;
                    }
                    g.store.append(msg)
                };
                if added {
                    let _ = self.events.send(ChatEvent::MessagesChanged { task_id });
                }
            }

            log::warn!(
                "chat connection for task {} lost; reconnecting in {:?}",
                task_id,
                self.reconnect_delay
            );
            if !self.transition(TransportEvent::Lost).await {
                return;
            }
            if !self.backoff().await {
                return;
            }
        }
    }

    async fn backoff(&self) -> bool {
        tokio::time::sleep(self.reconnect_delay).await;
        self.transition(TransportEvent::BackoffElapsed).await
    }

    /// Best-effort; a failure here does not affect the session.
    fn send_join_notice(&self) {
        let Some(receiver_id) = self.session.counterpart_id else {
            log::debug!("skipping join notice: counterpart unresolved");
            return;
        };
        let notice = match ChatMessage::outgoing(
            self.session.task_id,
            self.session.local_user_id,
            receiver_id,
            &self.session.join_notice(),
        ) {
            Ok(m) => m,
            Err(e) => {
                log::debug!("skipping join notice: {}", e);
                return;
            }
        };
        if let Err(e) = self
            .transport
            .publish(&join_destination(self.session.task_id), &notice)
        {
            log::debug!("join notice not sent: {}", e);
        }
    }

    /// Apply `event` to the session's transport state. False once this session is stale.
    async fn transition(&self, event: TransportEvent) -> bool {
        let changed = {
            let mut g = self.shared.write().await;
            if g.generation != self.generation {
                return false;
            }
            let Some(session) = g.session.as_mut() else {
                return false;
            };
            let next = session.transport_state.apply(event);
            let changed = next != session.transport_state;
            session.transport_state = next;
            changed.then_some(next)
        };
        if let Some(state) = changed {
            let _ = self.events.send(ChatEvent::StateChanged {
                task_id: self.session.task_id,
                state,
            });
        }
        true
    }
}
