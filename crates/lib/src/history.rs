//! REST collaborator: message history for a task, plus the backend's other chat endpoints.
//!
//! Every endpoint answers with an envelope `{ code, message, data }`; anything but a 2xx
//! status with the expected `code` is a failure.

use crate::message::{ChatMessage, TaskId, UserId};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;

#[derive(Debug, thiserror::Error)]
pub enum HistoryError {
    #[error("history request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("history api error: {0}")]
    Api(String),
}

/// Backend response envelope.
#[derive(Debug, Serialize, Deserialize)]
pub struct ApiResponse<T> {
    pub code: i64,
    pub message: Option<String>,
    pub data: Option<T>,
}

/// Source of the initial, server-ordered message history for a session.
#[async_trait]
pub trait HistoryClient: Send + Sync {
    /// Messages for `task_id`, oldest first.
    async fn fetch_task_history(&self, task_id: TaskId) -> Result<Vec<ChatMessage>, HistoryError>;
}

/// Client for the backend chat REST API (`{apiBase}/chat/...`).
#[derive(Clone)]
pub struct RestHistoryClient {
    base_url: String,
    token: Option<String>,
    client: reqwest::Client,
}

impl RestHistoryClient {
    /// `timeout` bounds each whole request, so a stalled backend surfaces as a failure.
    pub fn new(api_base: &str, token: Option<String>, timeout: Duration) -> Self {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .unwrap_or_else(|e| {
                log::warn!("history client without timeout: {}", e);
                reqwest::Client::new()
            });
        Self {
            base_url: api_base.trim_end_matches('/').to_string(),
            token,
            client,
        }
    }

    fn authorized(&self, req: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.token {
            Some(t) => req.bearer_auth(t),
            None => req,
        }
    }

    async fn envelope<T: serde::de::DeserializeOwned>(
        res: reqwest::Response,
        expected_code: i64,
    ) -> Result<Option<T>, HistoryError> {
        if !res.status().is_success() {
            let status = res.status();
            let body = res.text().await.unwrap_or_default();
            return Err(HistoryError::Api(format!("{} {}", status, body)));
        }
        let data: ApiResponse<T> = res.json().await?;
        if data.code != expected_code {
            return Err(HistoryError::Api(format!(
                "code {}: {}",
                data.code,
                data.message.unwrap_or_default()
            )));
        }
        Ok(data.data)
    }

    /// GET /chat/task/{taskId}.
    pub async fn task_history(&self, task_id: TaskId) -> Result<Vec<ChatMessage>, HistoryError> {
        let url = format!("{}/chat/task/{}", self.base_url, task_id);
        let res = self.authorized(self.client.get(&url)).send().await?;
        let messages: Option<Vec<ChatMessage>> = Self::envelope(res, 200).await?;
        messages.ok_or_else(|| HistoryError::Api("response has no data".to_string()))
    }

    /// GET /chat/conversation?senderId=&receiverId=: every message between two users, across tasks.
    pub async fn fetch_conversation(
        &self,
        sender_id: UserId,
        receiver_id: UserId,
    ) -> Result<Vec<ChatMessage>, HistoryError> {
        let url = format!("{}/chat/conversation", self.base_url);
        let req = self
            .client
            .get(&url)
            .query(&[("senderId", sender_id), ("receiverId", receiver_id)]);
        let res = self.authorized(req).send().await?;
        let messages: Option<Vec<ChatMessage>> = Self::envelope(res, 200).await?;
        Ok(messages.unwrap_or_default())
    }

    /// POST /chat: persist a message without the socket. Subscribers do not see it.
    pub async fn post_message(&self, message: &ChatMessage) -> Result<(), HistoryError> {
        let url = format!("{}/chat", self.base_url);
        let res = self
            .authorized(self.client.post(&url).json(message))
            .send()
            .await?;
        let _: Option<serde_json::Value> = Self::envelope(res, 201).await?;
        Ok(())
    }
}

#[async_trait]
impl HistoryClient for RestHistoryClient {
    async fn fetch_task_history(&self, task_id: TaskId) -> Result<Vec<ChatMessage>, HistoryError> {
        self.task_history(task_id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn envelope_parses_backend_shape() {
        let r: ApiResponse<Vec<ChatMessage>> = serde_json::from_str(
            r#"{"code":200,"message":"Messages Retrieved Successfully","data":[
                {"id":1,"taskId":42,"senderId":7,"receiverId":1,"message":"hi","timestamp":"2025-09-01T10:00:00"}
            ]}"#,
        )
        .unwrap();
        assert_eq!(r.code, 200);
        let data = r.data.unwrap();
        assert_eq!(data.len(), 1);
        assert_eq!(data[0].body, "hi");
    }

    #[test]
    fn envelope_tolerates_null_data() {
        let r: ApiResponse<Vec<ChatMessage>> =
            serde_json::from_str(r#"{"code":201,"message":"Message Sent Successfully","data":null}"#)
                .unwrap();
        assert!(r.data.is_none());
    }

    #[test]
    fn envelope_without_data_key() {
        let r: ApiResponse<serde_json::Value> =
            serde_json::from_str(r#"{"code":201,"message":"Message Sent Successfully"}"#).unwrap();
        assert_eq!(r.code, 201);
        assert!(r.data.is_none());

        let bare: ApiResponse<Vec<ChatMessage>> = serde_json::from_str(r#"{"code":500}"#).unwrap();
        assert!(bare.message.is_none());
        assert!(bare.data.is_none());
    }

    #[test]
    fn base_url_is_normalised() {
        let c = RestHistoryClient::new("http://localhost:8085/api/v1/", None, Duration::from_secs(1));
        assert_eq!(c.base_url, "http://localhost:8085/api/v1");
    }

    #[tokio::test]
    async fn stalled_backend_times_out() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let hold = tokio::spawn(async move {
            let (socket, _) = listener.accept().await.unwrap();
            tokio::time::sleep(Duration::from_secs(30)).await;
            drop(socket);
        });

        let c = RestHistoryClient::new(
            &format!("http://{}/api/v1", addr),
            None,
            Duration::from_millis(200),
        );
        let res = tokio::time::timeout(Duration::from_secs(5), c.task_history(42))
            .await
            .expect("client should give up on its own");
        assert!(matches!(res, Err(HistoryError::Request(e)) if e.is_timeout()));
        hold.abort();
    }
}
