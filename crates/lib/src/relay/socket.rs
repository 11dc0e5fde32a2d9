//! STOMP over WebSocket endpoint of the relay.

use crate::message::{iso_now, topic_for, ChatMessage, TaskId};
use crate::relay::state::{Published, RelayState};
use crate::stomp::{Command, Frame};
use axum::extract::ws::{Message, WebSocket};
use std::collections::HashMap;
use tokio::sync::broadcast;

const SEND_PREFIX: &str = "/app/chat.sendMessage/";
const JOIN_PREFIX: &str = "/app/chat.addUser/";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AppRoute {
    SendMessage,
    AddUser,
}

fn app_route(destination: &str) -> Option<(AppRoute, TaskId)> {
    if let Some(rest) = destination.strip_prefix(SEND_PREFIX) {
        return rest.parse().ok().map(|t| (AppRoute::SendMessage, t));
    }
    if let Some(rest) = destination.strip_prefix(JOIN_PREFIX) {
        return rest.parse().ok().map(|t| (AppRoute::AddUser, t));
    }
    None
}

/// Frames to write back, and whether the socket closes afterwards.
#[derive(Debug, Default)]
struct Outcome {
    replies: Vec<Frame>,
    close: bool,
}

impl Outcome {
    fn ok(request: &Frame) -> Self {
        Self {
            replies: receipt_for(request).into_iter().collect(),
            close: false,
        }
    }

    fn error(message: impl Into<String>) -> Self {
        let message = message.into();
        log::debug!("stomp error: {}", message);
        Self {
            replies: vec![Frame::new(Command::Error).with_header("message", message)],
            close: true,
        }
    }
}

fn receipt_for(request: &Frame) -> Option<Frame> {
    request
        .get("receipt")
        .map(|id| Frame::new(Command::Receipt).with_header("receipt-id", id))
}

fn negotiate_version(accept: Option<&str>) -> Option<&'static str> {
    let Some(accept) = accept else {
        return Some("1.0");
    };
    let offered: Vec<&str> = accept.split(',').map(str::trim).collect();
    ["1.2", "1.1", "1.0"]
        .into_iter()
        .find(|v| offered.contains(v))
}

/// Per-socket protocol state.
#[derive(Debug, Default)]
struct StompSession {
    connected: bool,
    /// Subscription id to destination.
    subscriptions: HashMap<String, String>,
}

impl StompSession {
    async fn handle(&mut self, state: &RelayState, frame: Frame) -> Outcome {
        match frame.command {
            Command::Connect | Command::Stomp => self.connect(state, &frame),
            _ if !self.connected => Outcome::error("not connected: send CONNECT first"),
            Command::Subscribe => self.subscribe(&frame),
            Command::Unsubscribe => match frame.get("id") {
                Some(id) => {
                    self.subscriptions.remove(id);
                    Outcome::ok(&frame)
                }
                None => Outcome::error("UNSUBSCRIBE without id"),
            },
            Command::Send => send(state, &frame).await,
            Command::Disconnect => Outcome {
                replies: receipt_for(&frame).into_iter().collect(),
                close: true,
            },
            other => Outcome::error(format!("unexpected {} frame from client", other)),
        }
    }

    fn connect(&mut self, state: &RelayState, frame: &Frame) -> Outcome {
        let Some(version) = negotiate_version(frame.get("accept-version")) else {
            return Outcome::error("supported protocol versions are 1.0 1.1 1.2");
        };
        let auth = frame.get("Authorization").or_else(|| frame.get("authorization"));
        if !state.authorized(auth) {
            return Outcome::error("unauthorized");
        }
        self.connected = true;
        Outcome {
            replies: vec![Frame::new(Command::Connected)
                .with_header("version", version)
                .with_header("heart-beat", "0,0")
                .with_header("server", concat!("taskchat-relay/", env!("CARGO_PKG_VERSION")))],
            close: false,
        }
    }

    fn subscribe(&mut self, frame: &Frame) -> Outcome {
        let (Some(id), Some(destination)) = (frame.get("id"), frame.get("destination")) else {
            return Outcome::error("SUBSCRIBE requires id and destination");
        };
        log::debug!("subscription {} to {}", id, destination);
        self.subscriptions
            .insert(id.to_string(), destination.to_string());
        Outcome::ok(frame)
    }

    /// MESSAGE frames for every subscription matching the published destination.
    fn deliveries(&self, published: &Published) -> Vec<Frame> {
        let body = match serde_json::to_string(&published.message) {
            Ok(b) => b,
            Err(e) => {
                log::warn!("cannot encode published message: {}", e);
                return Vec::new();
            }
        };
        self.subscriptions
            .iter()
            .filter(|(_, dest)| **dest == published.destination)
            .map(|(id, dest)| {
                Frame::new(Command::Message)
                    .with_header("destination", dest.as_str())
                    .with_header("content-type", "application/json")
                    .with_header("subscription", id.as_str())
                    .with_header("message-id", uuid::Uuid::new_v4().to_string())
                    .with_body(body.clone())
            })
            .collect()
    }
}

async fn send(state: &RelayState, frame: &Frame) -> Outcome {
    let Some(destination) = frame.get("destination") else {
        return Outcome::error("SEND without destination");
    };
    let Some((route, task_id)) = app_route(destination) else {
        return Outcome::error(format!("no handler for {}", destination));
    };
    let mut message: ChatMessage = match serde_json::from_str(&frame.body) {
        Ok(m) => m,
        Err(e) => return Outcome::error(format!("invalid chat payload: {}", e)),
    };
    if message.task_id != task_id {
        return Outcome::error("task id mismatch between destination and message");
    }
    match route {
        AppRoute::SendMessage => {
            // The broadcast copy is not the saved row: no id, and its own server timestamp.
            state.repository.save(message.clone()).await;
            message.id = None;
            message.timestamp = iso_now();
            state.publish(topic_for(task_id), message);
        }
        AppRoute::AddUser => {
            log::info!("user {} joined task {}", message.sender_id, task_id);
            message.id = None;
            message.body = format!("{} joined the chat!", message.sender_id);
            message.timestamp = iso_now();
            state.publish(topic_for(task_id), message);
        }
    }
    Outcome::ok(frame)
}

async fn send_frame(socket: &mut WebSocket, frame: &Frame) -> bool {
    socket.send(Message::Text(frame.encode())).await.is_ok()
}

async fn send_all(socket: &mut WebSocket, frames: &[Frame]) -> bool {
    for frame in frames {
        if !send_frame(socket, frame).await {
            return false;
        }
    }
    true
}

pub(crate) async fn handle_socket(mut socket: WebSocket, state: RelayState) {
    let mut session = StompSession::default();
    let mut topics = state.topics.subscribe();
    let mut shutdown = state.shutdown.subscribe();

    loop {
        tokio::select! {
            biased;

            _ = shutdown.recv() => {
                let bye = Frame::new(Command::Error).with_header("message", "relay shutting down");
                let _ = send_frame(&mut socket, &bye).await;
                break;
            }
            published = topics.recv() => {
                match published {
                    Ok(p) => {
                        if !send_all(&mut socket, &session.deliveries(&p)).await {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        log::warn!("stomp client lagged {} messages", n);
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
            msg = socket.recv() => {
                let Some(Ok(msg)) = msg else { break };
                let text = match msg {
                    Message::Text(t) => t,
                    Message::Close(_) => break,
                    _ => continue,
                };
                let frames = match Frame::decode_all(&text) {
                    Ok(f) => f,
                    Err(e) => {
                        let _ = send_all(&mut socket, &Outcome::error(e.to_string()).replies).await;
                        break;
                    }
                };
                let mut close = false;
                for frame in frames {
                    let outcome = session.handle(&state, frame).await;
                    if !send_all(&mut socket, &outcome.replies).await || outcome.close {
                        close = true;
                        break;
                    }
                }
                if close {
                    break;
                }
            }
        }
    }

    if !session.connected {
        log::debug!("stomp client disconnected before CONNECT");
    }
    let _ = socket.close().await;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn connect_frame(token: Option<&str>) -> Frame {
        let f = Frame::new(Command::Connect).with_header("accept-version", "1.2,1.1");
        match token {
            Some(t) => f.with_header("Authorization", format!("Bearer {}", t)),
            None => f,
        }
    }

    fn send_frame_to(destination: &str, body: &str) -> Frame {
        Frame::new(Command::Send)
            .with_header("destination", destination)
            .with_body(body)
    }

    const PAYLOAD: &str =
        r#"{"taskId":42,"senderId":7,"receiverId":1,"message":"hi","timestamp":"2025-09-01T10:00:00Z"}"#;

    async fn connected(state: &RelayState) -> StompSession {
        let mut s = StompSession::default();
        let out = s.handle(state, connect_frame(None)).await;
        assert_eq!(out.replies[0].command, Command::Connected);
        s
    }

    #[test]
    fn routes_app_destinations() {
        assert_eq!(app_route("/app/chat.sendMessage/42"), Some((AppRoute::SendMessage, 42)));
        assert_eq!(app_route("/app/chat.addUser/7"), Some((AppRoute::AddUser, 7)));
        assert_eq!(app_route("/app/chat.sendMessage/x"), None);
        assert_eq!(app_route("/topic/messages.42"), None);
    }

    #[test]
    fn version_negotiation() {
        assert_eq!(negotiate_version(Some("1.2,1.1")), Some("1.2"));
        assert_eq!(negotiate_version(Some("1.1")), Some("1.1"));
        assert_eq!(negotiate_version(None), Some("1.0"));
        assert_eq!(negotiate_version(Some("2.0")), None);
    }

    #[tokio::test]
    async fn connect_checks_token() {
        let state = RelayState::new(0, Some("s3cret".to_string()));
        let mut s = StompSession::default();
        let out = s.handle(&state, connect_frame(Some("wrong"))).await;
        assert!(out.close);
        assert_eq!(out.replies[0].command, Command::Error);

        let out = s.handle(&state, connect_frame(Some("s3cret"))).await;
        assert!(!out.close);
        assert_eq!(out.replies[0].get("version"), Some("1.2"));
    }

    #[tokio::test]
    async fn frames_before_connect_are_rejected() {
        let state = RelayState::new(0, None);
        let mut s = StompSession::default();
        let out = s
            .handle(&state, send_frame_to("/app/chat.sendMessage/42", PAYLOAD))
            .await;
        assert!(out.close);
        assert_eq!(state.repository.len().await, 0);
    }

    #[tokio::test]
    async fn send_persists_and_delivers_to_subscribers() {
        let state = RelayState::new(0, None);
        let mut rx = state.topics.subscribe();
        let mut s = connected(&state).await;
        s.handle(
            &state,
            Frame::new(Command::Subscribe)
                .with_header("id", "sub-0")
                .with_header("destination", "/topic/messages.42"),
        )
        .await;

        let out = s
            .handle(
                &state,
                send_frame_to("/app/chat.sendMessage/42", PAYLOAD).with_header("receipt", "r1"),
            )
            .await;
        assert_eq!(out.replies[0].get("receipt-id"), Some("r1"));

        let published = rx.try_recv().unwrap();
        assert_eq!(published.destination, "/topic/messages.42");
        assert_eq!(published.message.id, None);
        assert!(published.message.sent_at().is_some());
        let stored = state.repository.by_task(42).await;
        assert_eq!(stored[0].id, Some(1));
        let frames = s.deliveries(&published);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].get("subscription"), Some("sub-0"));
        let echoed: ChatMessage = serde_json::from_str(&frames[0].body).unwrap();
        assert_eq!(echoed.body, "hi");
        assert_eq!(state.repository.by_task(42).await.len(), 1);
    }

    #[tokio::test]
    async fn join_is_rewritten_and_not_persisted() {
        let state = RelayState::new(0, None);
        let mut rx = state.topics.subscribe();
        let mut s = connected(&state).await;
        s.handle(&state, send_frame_to("/app/chat.addUser/42", PAYLOAD)).await;

        let published = rx.try_recv().unwrap();
        assert_eq!(published.message.body, "7 joined the chat!");
        assert_eq!(published.message.id, None);
        assert_eq!(state.repository.len().await, 0);
    }

    #[tokio::test]
    async fn task_mismatch_is_an_error() {
        let state = RelayState::new(0, None);
        let mut s = connected(&state).await;
        let out = s
            .handle(&state, send_frame_to("/app/chat.sendMessage/43", PAYLOAD))
            .await;
        assert!(out.close);
        assert_eq!(out.replies[0].command, Command::Error);
        assert_eq!(state.repository.len().await, 0);
    }

    #[tokio::test]
    async fn unsubscribed_sessions_get_nothing() {
        let state = RelayState::new(0, None);
        let mut s = connected(&state).await;
        s.handle(
            &state,
            Frame::new(Command::Subscribe)
                .with_header("id", "a")
                .with_header("destination", "/topic/messages.1"),
        )
        .await;
        s.handle(&state, Frame::new(Command::Unsubscribe).with_header("id", "a"))
            .await;
        let p = Published {
            destination: "/topic/messages.1".to_string(),
            message: serde_json::from_str(PAYLOAD).unwrap(),
        };
        assert!(s.deliveries(&p).is_empty());
    }

    #[tokio::test]
    async fn disconnect_answers_receipt_and_closes() {
        let state = RelayState::new(0, None);
        let mut s = connected(&state).await;
        let out = s
            .handle(&state, Frame::new(Command::Disconnect).with_header("receipt", "bye"))
            .await;
        assert!(out.close);
        assert_eq!(out.replies[0].command, Command::Receipt);
        assert_eq!(out.replies[0].get("receipt-id"), Some("bye"));
    }
}
