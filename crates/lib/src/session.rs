//! The chat session bound to one task, and the local operator identity.

use crate::message::{TaskId, UserId};
use crate::transport::TransportState;
use serde::Serialize;

/// Who is running this client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LocalIdentity {
    pub user_id: UserId,
    pub user_name: String,
    /// Bearer credential from the auth collaborator.
    #[serde(skip)]
    pub token: Option<String>,
}

impl LocalIdentity {
    pub fn new(user_id: UserId, user_name: impl Into<String>, token: Option<String>) -> Self {
        Self {
            user_id,
            user_name: user_name.into(),
            token,
        }
    }
}

/// One active conversation: local user, counterpart, task, and connection state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatSession {
    pub task_id: TaskId,
    pub local_user_id: UserId,
    pub local_user_name: String,
    pub counterpart_id: Option<UserId>,
    pub counterpart_name: Option<String>,
    pub transport_state: TransportState,
}

impl ChatSession {
    pub fn new(
        task_id: TaskId,
        identity: &LocalIdentity,
        counterpart_id: Option<UserId>,
        counterpart_name: Option<String>,
    ) -> Self {
        Self {
            task_id,
            local_user_id: identity.user_id,
            local_user_name: identity.user_name.clone(),
            counterpart_id,
            counterpart_name: counterpart_name
                .map(|n| n.trim().to_string())
                .filter(|n| !n.is_empty()),
            transport_state: TransportState::Disconnected,
        }
    }

    /// Text of the notice announced on the join destination after connecting.
    pub fn join_notice(&self) -> String {
        format!("{} joined the chat", self.local_user_name)
    }
}
