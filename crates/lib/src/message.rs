//! Chat message wire type, timestamp parsing, and task-scoped destinations.

use chrono::{DateTime, Local, NaiveDateTime, SecondsFormat, TimeZone, Utc};
use serde::{Deserialize, Serialize};

pub type TaskId = i64;
pub type UserId = i64;

/// One unit of conversation: `{ id?, taskId, senderId, receiverId, message, timestamp }` on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatMessage {
    /// Server-assigned row id; absent on client-built messages.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<i64>,
    pub task_id: TaskId,
    pub sender_id: UserId,
    pub receiver_id: UserId,
    #[serde(rename = "message")]
    pub body: String,
    /// ISO-8601; authoritative as given when it came from the server.
    #[serde(default)]
    pub timestamp: String,
}

/// Why a message was not built.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    #[error("message is empty")]
    EmptyBody,
    #[error("no active chat session")]
    NoSession,
    #[error("chat counterpart is not resolved")]
    CounterpartUnresolved,
}

impl ChatMessage {
    /// Build a client-side message stamped with the current time. The body is trimmed; empty is rejected.
    pub fn outgoing(
        task_id: TaskId,
        sender_id: UserId,
        receiver_id: UserId,
        body: &str,
    ) -> Result<Self, ValidationError> {
        let body = body.trim();
        if body.is_empty() {
            return Err(ValidationError::EmptyBody);
        }
        Ok(Self {
            id: None,
            task_id,
            sender_id,
            receiver_id,
            body: body.to_string(),
            timestamp: iso_now(),
        })
    }

    /// Parsed timestamp, if it is in a recognised shape.
    pub fn sent_at(&self) -> Option<DateTime<Utc>> {
        parse_timestamp(&self.timestamp)
    }
}

/// Current time as `2025-09-01T10:00:00.000Z`.
pub fn iso_now() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Parse RFC 3339, or a zone-less ISO date-time (read in the local zone, as the backend emits them).
pub fn parse_timestamp(s: &str) -> Option<DateTime<Utc>> {
    let s = s.trim();
    if s.is_empty() {
        return None;
    }
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.with_timezone(&Utc));
    }
    let naive = NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S%.f")
        .or_else(|_| NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M"))
        .ok()?;
    Local
        .from_local_datetime(&naive)
        .earliest()
        .map(|dt| dt.with_timezone(&Utc))
}

/// Subscription topic for a task: `/topic/messages.<taskId>`.
pub fn topic_for(task_id: TaskId) -> String {
    format!("/topic/messages.{}", task_id)
}

/// Publish destination for user messages.
pub fn send_destination(task_id: TaskId) -> String {
    format!("/app/chat.sendMessage/{}", task_id)
}

/// Publish destination for the join notice.
pub fn join_destination(task_id: TaskId) -> String {
    format!("/app/chat.addUser/{}", task_id)
}
