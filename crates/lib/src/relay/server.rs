//! Relay HTTP + WebSocket server (single port).

use crate::config::{self, Config};
use crate::history::ApiResponse;
use crate::message::{ChatMessage, TaskId, UserId};
use crate::relay::socket;
use crate::relay::state::RelayState;
use anyhow::{Context, Result};
use axum::{
    extract::{ws::WebSocketUpgrade, Path, Query, State},
    http::{header, HeaderMap, StatusCode},
    response::Response,
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;
use serde_json::json;

type ApiResult<T> = Result<Json<ApiResponse<T>>, StatusCode>;

fn ok<T>(code: i64, message: &str, data: Option<T>) -> ApiResult<T> {
    Ok(Json(ApiResponse {
        code,
        message: Some(message.to_string()),
        data,
    }))
}

fn require_auth(state: &RelayState, headers: &HeaderMap) -> Result<(), StatusCode> {
    let auth = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok());
    if state.authorized(auth) {
        Ok(())
    } else {
        Err(StatusCode::UNAUTHORIZED)
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ConversationQuery {
    sender_id: UserId,
    receiver_id: UserId,
}

/// Routes for the chat REST API, the STOMP endpoint, and the health probe.
pub fn router(state: RelayState) -> Router {
    Router::new()
        .route("/", get(health_http))
        .route("/api/v1/chat", post(post_message))
        .route("/api/v1/chat/task/:task_id", get(task_history))
        .route("/api/v1/chat/conversation", get(conversation))
        .route("/chat/websocket", get(ws_handler))
        .with_state(state)
}

/// Run the relay on config.relay.bind:config.relay.port until Ctrl+C or SIGTERM.
/// A non-loopback bind requires a relay token.
pub async fn run_relay(config: Config) -> Result<()> {
    let bind = config.relay.bind.trim();
    let token = config::resolve_relay_token(&config);
    if !config::is_loopback_bind(bind) && token.is_none() {
        anyhow::bail!(
            "refusing to bind relay to {} without auth (set relay.token or TASKCHAT_RELAY_TOKEN)",
            bind
        );
    }

    let state = RelayState::new(config.relay.port, token);
    let shutdown = state.shutdown.clone();
    let app = router(state);

    let bind_addr = format!("{}:{}", bind, config.relay.port);
    let listener = tokio::net::TcpListener::bind(&bind_addr)
        .await
        .with_context(|| format!("binding to {}", bind_addr))?;
    log::info!("relay listening on {}", bind_addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(shutdown))
        .await
        .context("relay server exited")?;
    log::info!("relay stopped");
    Ok(())
}

/// Completes on SIGINT or SIGTERM, after telling open sockets to close.
async fn shutdown_signal(shutdown: tokio::sync::broadcast::Sender<()>) {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            log::warn!("cannot listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut s) => {
                s.recv().await;
            }
            Err(e) => {
                log::warn!("cannot listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    log::info!("shutdown signal received, closing stomp sessions");
    let _ = shutdown.send(());
}

/// GET / returns a simple health JSON (for probes).
async fn health_http(State(state): State<RelayState>) -> Json<serde_json::Value> {
    Json(json!({
        "runtime": "running",
        "port": state.port,
    }))
}

/// GET /api/v1/chat/task/{taskId}
async fn task_history(
    State(state): State<RelayState>,
    headers: HeaderMap,
    Path(task_id): Path<TaskId>,
) -> ApiResult<Vec<ChatMessage>> {
    require_auth(&state, &headers)?;
    let messages = state.repository.by_task(task_id).await;
    log::info!("retrieved {} messages for task {}", messages.len(), task_id);
    ok(200, "Messages Retrieved Successfully", Some(messages))
}

/// GET /api/v1/chat/conversation?senderId=&receiverId=
async fn conversation(
    State(state): State<RelayState>,
    headers: HeaderMap,
    Query(q): Query<ConversationQuery>,
) -> ApiResult<Vec<ChatMessage>> {
    require_auth(&state, &headers)?;
    let messages = state
        .repository
        .conversation(q.sender_id, q.receiver_id)
        .await;
    ok(200, "Conversation Retrieved Successfully", Some(messages))
}

/// POST /api/v1/chat stores without broadcasting.
async fn post_message(
    State(state): State<RelayState>,
    headers: HeaderMap,
    Json(message): Json<ChatMessage>,
) -> ApiResult<()> {
    require_auth(&state, &headers)?;
    state.repository.save(message).await;
    ok(201, "Message Sent Successfully", None)
}

/// GET /chat/websocket upgrades to a STOMP session. The first frame must be CONNECT.
async fn ws_handler(State(state): State<RelayState>, ws: WebSocketUpgrade) -> Response {
    ws.on_upgrade(move |sock| socket::handle_socket(sock, state))
}
