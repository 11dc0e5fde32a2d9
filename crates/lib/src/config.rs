//! Configuration types and loading.
//!
//! Config is loaded from a JSON file (e.g. `~/.taskchat/config.json`) and environment.
//! Identity and tokens normally come from the surrounding application; env vars let
//! the CLI stand in for it.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Top-level application config.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    /// Backend REST base and WebSocket endpoint.
    #[serde(default)]
    pub server: ServerConfig,

    /// Local operator identity and bearer token.
    #[serde(default)]
    pub identity: IdentityConfig,

    /// Session controller and transport tuning.
    #[serde(default)]
    pub chat: ChatConfig,

    /// Development relay settings.
    #[serde(default)]
    pub relay: RelayConfig,
}

/// Where the chat backend lives.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerConfig {
    /// REST base (default "http://localhost:8085/api/v1"). History is fetched from `{apiBase}/chat/task/{taskId}`.
    #[serde(default = "default_api_base")]
    pub api_base: String,

    /// STOMP-over-WebSocket endpoint (default "ws://localhost:8085/chat/websocket").
    #[serde(default = "default_ws_endpoint")]
    pub ws_endpoint: String,
}

fn default_api_base() -> String {
    "http://localhost:8085/api/v1".to_string()
}

fn default_ws_endpoint() -> String {
    "ws://localhost:8085/chat/websocket".to_string()
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            api_base: default_api_base(),
            ws_endpoint: default_ws_endpoint(),
        }
    }
}

/// Who is running the client. Overridden by TASKCHAT_USER_ID / TASKCHAT_USER_NAME / TASKCHAT_TOKEN.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IdentityConfig {
    pub user_id: Option<i64>,
    pub user_name: Option<String>,
    /// Bearer token for REST and the STOMP CONNECT frame.
    pub token: Option<String>,
}

/// Controller and transport tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatConfig {
    /// Fixed delay before each reconnect attempt (default 5000).
    #[serde(default = "default_reconnect_delay_ms")]
    pub reconnect_delay_ms: u64,

    /// Upper bound for the socket open + STOMP handshake (default 10000).
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,

    /// Capacity of the outbound frame queue; publishes beyond it are rejected (default 64).
    #[serde(default = "default_outbound_buffer")]
    pub outbound_buffer: usize,

    /// Capacity of the per-subscription inbound queue (default 256).
    #[serde(default = "default_inbound_buffer")]
    pub inbound_buffer: usize,
}

fn default_reconnect_delay_ms() -> u64 {
    5000
}

fn default_connect_timeout_ms() -> u64 {
    10_000
}

fn default_outbound_buffer() -> usize {
    64
}

fn default_inbound_buffer() -> usize {
    256
}

impl Default for ChatConfig {
    fn default() -> Self {
        Self {
            reconnect_delay_ms: default_reconnect_delay_ms(),
            connect_timeout_ms: default_connect_timeout_ms(),
            outbound_buffer: default_outbound_buffer(),
            inbound_buffer: default_inbound_buffer(),
        }
    }
}

impl ChatConfig {
    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_delay_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}

/// Development relay bind, port, and optional token.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RelayConfig {
    /// Bind address (default "127.0.0.1").
    #[serde(default = "default_relay_bind")]
    pub bind: String,

    /// Port for REST and WebSocket (default 8085).
    #[serde(default = "default_relay_port")]
    pub port: u16,

    /// When set, REST calls and STOMP CONNECT must carry `Bearer <token>`. Overridden by TASKCHAT_RELAY_TOKEN.
    pub token: Option<String>,
}

fn default_relay_bind() -> String {
    "127.0.0.1".to_string()
}

fn default_relay_port() -> u16 {
    8085
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            bind: default_relay_bind(),
            port: default_relay_port(),
            token: None,
        }
    }
}

/// Trimmed, non-empty value of an env var.
fn env_non_empty(key: &str) -> Option<String> {
    std::env::var(key).ok().and_then(|s| {
        let t = s.trim();
        if t.is_empty() {
            None
        } else {
            Some(t.to_string())
        }
    })
}

fn non_empty(value: Option<&String>) -> Option<String> {
    value
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

/// Resolve the bearer token: env TASKCHAT_TOKEN overrides config.
pub fn resolve_token(config: &Config) -> Option<String> {
    env_non_empty("TASKCHAT_TOKEN").or_else(|| non_empty(config.identity.token.as_ref()))
}

/// Resolve the local user id: env TASKCHAT_USER_ID overrides config.
pub fn resolve_user_id(config: &Config) -> Option<i64> {
    env_non_empty("TASKCHAT_USER_ID")
        .and_then(|s| s.parse().ok())
        .or(config.identity.user_id)
}

/// Resolve the local display name; falls back to "User <id>".
pub fn resolve_user_name(config: &Config, user_id: i64) -> String {
    env_non_empty("TASKCHAT_USER_NAME")
        .or_else(|| non_empty(config.identity.user_name.as_ref()))
        .unwrap_or_else(|| format!("User {}", user_id))
}

/// Resolve the relay token: env TASKCHAT_RELAY_TOKEN overrides config.
pub fn resolve_relay_token(config: &Config) -> Option<String> {
    env_non_empty("TASKCHAT_RELAY_TOKEN").or_else(|| non_empty(config.relay.token.as_ref()))
}

/// True for binds only reachable from this host.
pub fn is_loopback_bind(bind: &str) -> bool {
    let b = bind.trim();
    b == "127.0.0.1" || b == "::1" || b == "localhost"
}

/// Resolve config path from env or default.
pub fn default_config_path() -> PathBuf {
    std::env::var("TASKCHAT_CONFIG_PATH")
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            dirs::home_dir()
                .map(|h| h.join(".taskchat").join("config.json"))
                .unwrap_or_else(|| PathBuf::from("config.json"))
        })
}

/// Load config from the given path, the default path, or TASKCHAT_CONFIG_PATH. Missing file => default config.
pub fn load_config(path: Option<PathBuf>) -> Result<(Config, PathBuf)> {
    let path = path.unwrap_or_else(default_config_path);
    let config = if !path.exists() {
        log::debug!("config file not found, using defaults: {}", path.display());
        Config::default()
    } else {
        let s = std::fs::read_to_string(&path)
            .with_context(|| format!("reading config from {}", path.display()))?;
        serde_json::from_str(&s)
            .with_context(|| format!("parsing config from {}", path.display()))?
    };
    Ok((config, path))
}
