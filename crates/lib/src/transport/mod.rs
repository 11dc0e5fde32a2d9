//! Publish/subscribe transport: trait seam, connection state machine, and errors.
//!
//! The session controller drives a [`Transport`]; [`StompTransport`] is the
//! STOMP-over-WebSocket implementation used against the real backend and the relay.

mod stomp_ws;

pub use stomp_ws::StompTransport;

use crate::message::{ChatMessage, TaskId};
use async_trait::async_trait;
use serde::Serialize;
use tokio::sync::mpsc;

/// Connection state as seen by the session.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TransportState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
}

/// Inputs to the connection state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportEvent {
    ConnectRequested,
    Connected,
    Failed,
    Lost,
    BackoffElapsed,
    Teardown,
}

impl TransportState {
    /// Next state for `event`, or None when the transition is not allowed.
    ///
    /// `DISCONNECTED -> CONNECTING -> CONNECTED`, failures and drops go to
    /// `RECONNECTING`, backoff returns to `CONNECTING`, teardown always ends in
    /// `DISCONNECTED`.
    pub fn transition(self, event: TransportEvent) -> Option<TransportState> {
        use TransportEvent as E;
        use TransportState as S;
        match (self, event) {
            (_, E::Teardown) => Some(S::Disconnected),
            (S::Disconnected, E::ConnectRequested) => Some(S::Connecting),
            (S::Connecting, E::Connected) => Some(S::Connected),
            (S::Connecting, E::Failed) => Some(S::Reconnecting),
            (S::Connected, E::Lost) | (S::Connected, E::Failed) => Some(S::Reconnecting),
            (S::Reconnecting, E::BackoffElapsed) => Some(S::Connecting),
            _ => None,
        }
    }

    /// Apply `event`; an invalid transition is logged and leaves the state unchanged.
    pub fn apply(self, event: TransportEvent) -> TransportState {
        match self.transition(event) {
            Some(next) => next,
            None => {
                log::warn!("ignoring transport event {:?} in state {:?}", event, self);
                self
            }
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("transport connect failed: {0}")]
    Connect(String),
    #[error("stomp handshake failed: {0}")]
    Handshake(String),
    #[error("connection rejected by server: {0}")]
    Rejected(String),
    #[error("transport connect timed out")]
    Timeout,
    #[error("not connected")]
    NotConnected,
    #[error("outbound queue full")]
    Backpressure,
    #[error("encoding payload failed: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Returned by [`Transport::subscribe`]; pass back to unsubscribe.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriptionHandle {
    pub id: String,
    pub topic: String,
}

/// One underlying pub/sub connection.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Open and authenticate a connection for `task_id`. Replaces any previous connection.
    async fn connect(&self, task_id: TaskId, auth_token: Option<&str>) -> Result<(), TransportError>;

    /// Deliver every message on `topic` to `on_message`, in transport order. The sender is
    /// dropped when the connection ends, so a closed receiver means the connection is gone.
    fn subscribe(
        &self,
        topic: &str,
        on_message: mpsc::Sender<ChatMessage>,
    ) -> Result<SubscriptionHandle, TransportError>;

    fn unsubscribe(&self, handle: &SubscriptionHandle) -> Result<(), TransportError>;

    /// Fire-and-forget send. Fails only when the frame cannot be queued.
    fn publish(&self, destination: &str, payload: &ChatMessage) -> Result<(), TransportError>;

    /// Unsubscribe everything and close. Safe to call repeatedly.
    async fn teardown(&self);

    fn is_connected(&self) -> bool;
}

#[cfg(test)]
mod tests {
    use super::*;
    use TransportEvent as E;
    use TransportState as S;

    #[test]
    fn happy_path_and_reconnect_cycle() {
        let s = S::Disconnected.apply(E::ConnectRequested);
        assert_eq!(s, S::Connecting);
        let s = s.apply(E::Failed);
        assert_eq!(s, S::Reconnecting);
        let s = s.apply(E::BackoffElapsed);
        assert_eq!(s, S::Connecting);
        let s = s.apply(E::Connected);
        assert_eq!(s, S::Connected);
        assert_eq!(s.apply(E::Lost), S::Reconnecting);
    }

    #[test]
    fn teardown_from_any_state() {
        for s in [S::Disconnected, S::Connecting, S::Connected, S::Reconnecting] {
            assert_eq!(s.apply(E::Teardown), S::Disconnected);
        }
    }

    #[test]
    fn invalid_transitions_keep_state() {
        assert_eq!(S::Disconnected.transition(E::Connected), None);
        assert_eq!(S::Reconnecting.apply(E::Connected), S::Reconnecting);
        assert_eq!(S::Connected.apply(E::ConnectRequested), S::Connected);
    }
}
