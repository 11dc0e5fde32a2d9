//! In-memory message repository and topic fan-out for the relay.

use crate::message::{iso_now, ChatMessage, TaskId, UserId};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, RwLock};

/// A message published to a topic.
#[derive(Debug, Clone)]
pub struct Published {
    pub destination: String,
    pub message: ChatMessage,
}

/// Persisted chat messages, in insertion order.
#[derive(Default)]
pub struct ChatRepository {
    messages: RwLock<Vec<ChatMessage>>,
    next_id: AtomicI64,
}

impl ChatRepository {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store a copy with a fresh id and the server time; returns the stored row.
    pub async fn save(&self, mut message: ChatMessage) -> ChatMessage {
        message.id = Some(self.next_id.fetch_add(1, Ordering::SeqCst) + 1);
        message.timestamp = iso_now();
        self.messages.write().await.push(message.clone());
        log::info!(
            "stored message {} from {} to {} for task {}",
            message.id.unwrap_or_default(),
            message.sender_id,
            message.receiver_id,
            message.task_id
        );
        message
    }

    /// Messages for a task, oldest first.
    pub async fn by_task(&self, task_id: TaskId) -> Vec<ChatMessage> {
        self.messages
            .read()
            .await
            .iter()
            .filter(|m| m.task_id == task_id)
            .cloned()
            .collect()
    }

    /// Messages between two users in either direction, across tasks.
    pub async fn conversation(&self, a: UserId, b: UserId) -> Vec<ChatMessage> {
        self.messages
            .read()
            .await
            .iter()
            .filter(|m| {
                (m.sender_id == a && m.receiver_id == b) || (m.sender_id == b && m.receiver_id == a)
            })
            .cloned()
            .collect()
    }

    pub async fn len(&self) -> usize {
        self.messages.read().await.len()
    }
}

/// Shared state for the relay's REST and socket handlers.
#[derive(Clone)]
pub struct RelayState {
    pub port: u16,
    /// When Some, REST calls and STOMP CONNECT must carry this bearer token.
    pub required_token: Option<String>,
    pub repository: Arc<ChatRepository>,
    /// Every topic publish; each socket filters by its own subscriptions.
    pub topics: broadcast::Sender<Published>,
    /// Fired once on shutdown so open sockets close.
    pub shutdown: broadcast::Sender<()>,
}

impl RelayState {
    pub fn new(port: u16, required_token: Option<String>) -> Self {
        let (topics, _) = broadcast::channel(256);
        let (shutdown, _) = broadcast::channel(1);
        Self {
            port,
            required_token,
            repository: Arc::new(ChatRepository::new()),
            topics,
            shutdown,
        }
    }

    pub fn publish(&self, destination: String, message: ChatMessage) {
        // No receivers just means no one is subscribed yet.
        let _ = self.topics.send(Published {
            destination,
            message,
        });
    }

    /// True when no token is required or `header` is `Bearer <token>` for the required one.
    pub fn authorized(&self, header: Option<&str>) -> bool {
        let Some(required) = self.required_token.as_deref() else {
            return true;
        };
        header
            .and_then(|h| h.trim().strip_prefix("Bearer "))
            .map_or(false, |t| t.trim() == required)
    }
}
