//! STOMP over WebSocket client (tokio-tungstenite).
//!
//! One socket per connect. A writer task drains a bounded outbound queue; a reader task
//! routes MESSAGE frames to subscriptions by their `subscription` header.

use crate::message::{ChatMessage, TaskId};
use crate::stomp::{Command, Frame};
use crate::transport::{SubscriptionHandle, Transport, TransportError};
use async_trait::async_trait;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsSink = SplitSink<WsStream, Message>;
type WsSource = SplitStream<WsStream>;

/// How long teardown waits for queued UNSUBSCRIBE/DISCONNECT frames to flush.
const FLUSH_TIMEOUT: Duration = Duration::from_secs(2);

struct Subscription {
    topic: String,
    tx: mpsc::Sender<ChatMessage>,
}

type SubscriptionMap = Arc<Mutex<HashMap<String, Subscription>>>;

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

/// A live socket and its tasks.
struct Connection {
    outbound: mpsc::Sender<Message>,
    subscriptions: SubscriptionMap,
    next_sub: u64,
    alive: Arc<AtomicBool>,
    reader: JoinHandle<()>,
    writer: JoinHandle<()>,
}

impl Connection {
    fn queue(&self, frame: Frame) -> Result<(), TransportError> {
        if !self.alive.load(Ordering::SeqCst) {
            return Err(TransportError::NotConnected);
        }
        self.outbound
            .try_send(Message::Text(frame.encode()))
            .map_err(|e| match e {
                mpsc::error::TrySendError::Full(_) => TransportError::Backpressure,
                mpsc::error::TrySendError::Closed(_) => TransportError::NotConnected,
            })
    }

    async fn shutdown(self) {
        let ids: Vec<String> = lock(&self.subscriptions).keys().cloned().collect();
        for id in ids {
            let _ = self.queue(Frame::new(Command::Unsubscribe).with_header("id", id));
        }
        let _ = self.queue(Frame::new(Command::Disconnect));
        self.alive.store(false, Ordering::SeqCst);
        lock(&self.subscriptions).clear();

        let Connection {
            outbound,
            reader,
            mut writer,
            ..
        } = self;
        drop(outbound);
        if tokio::time::timeout(FLUSH_TIMEOUT, &mut writer).await.is_err() {
            log::debug!("stomp writer did not flush in time; aborting");
            writer.abort();
        }
        reader.abort();
    }
}

/// STOMP 1.2 client transport.
pub struct StompTransport {
    endpoint: String,
    connect_timeout: Duration,
    outbound_capacity: usize,
    conn: Mutex<Option<Connection>>,
}

impl StompTransport {
    pub fn new(endpoint: impl Into<String>, connect_timeout: Duration, outbound_capacity: usize) -> Self {
        Self {
            endpoint: endpoint.into(),
            connect_timeout,
            outbound_capacity: outbound_capacity.max(1),
            conn: Mutex::new(None),
        }
    }

    async fn close_current(&self) {
        let previous = lock(&self.conn).take();
        if let Some(conn) = previous {
            log::debug!("closing previous stomp connection");
            conn.shutdown().await;
        }
    }

    /// Open the socket and complete the CONNECT/CONNECTED exchange.
    async fn handshake(&self, auth_token: Option<&str>) -> Result<(WsSink, WsSource), TransportError> {
        let (ws, _) = tokio_tungstenite::connect_async(self.endpoint.as_str())
            .await
            .map_err(|e| TransportError::Connect(e.to_string()))?;
        let (mut sink, mut source) = ws.split();

        let mut connect = Frame::new(Command::Connect)
            .with_header("accept-version", "1.2,1.1")
            .with_header("host", host_of(&self.endpoint))
            .with_header("heart-beat", "0,0");
        if let Some(token) = auth_token {
            connect = connect.with_header("Authorization", format!("Bearer {}", token));
        }
        sink.send(Message::Text(connect.encode()))
            .await
            .map_err(|e| TransportError::Handshake(e.to_string()))?;

        while let Some(msg) = source.next().await {
            let msg = msg.map_err(|e| TransportError::Handshake(e.to_string()))?;
            let text = match msg {
                Message::Text(t) => t,
                Message::Close(_) => break,
                _ => continue,
            };
            let frames =
                Frame::decode_all(&text).map_err(|e| TransportError::Handshake(e.to_string()))?;
            for frame in frames {
                match frame.command {
                    Command::Connected => return Ok((sink, source)),
                    Command::Error => {
                        let reason = frame.get("message").unwrap_or(frame.body.as_str());
                        return Err(TransportError::Rejected(reason.to_string()));
                    }
                    other => log::debug!("ignoring {} before CONNECTED", other),
                }
            }
        }
        Err(TransportError::Handshake(
            "socket closed during handshake".to_string(),
        ))
    }
}

#[async_trait]
impl Transport for StompTransport {
    async fn connect(&self, task_id: TaskId, auth_token: Option<&str>) -> Result<(), TransportError> {
        self.close_current().await;

        let (sink, source) = tokio::time::timeout(self.connect_timeout, self.handshake(auth_token))
            .await
            .map_err(|_| TransportError::Timeout)??;

        let (outbound, outbound_rx) = mpsc::channel(self.outbound_capacity);
        let subscriptions: SubscriptionMap = Arc::new(Mutex::new(HashMap::new()));
        let alive = Arc::new(AtomicBool::new(true));
        let writer = tokio::spawn(run_writer(sink, outbound_rx));
        let reader = tokio::spawn(run_reader(source, subscriptions.clone(), alive.clone()));

        *lock(&self.conn) = Some(Connection {
            outbound,
            subscriptions,
            next_sub: 0,
            alive,
            reader,
            writer,
        });
        log::info!("stomp connected to {} for task {}", self.endpoint, task_id);
        Ok(())
    }

    fn subscribe(
        &self,
        topic: &str,
        on_message: mpsc::Sender<ChatMessage>,
    ) -> Result<SubscriptionHandle, TransportError> {
        let mut guard = lock(&self.conn);
        let conn = guard.as_mut().ok_or(TransportError::NotConnected)?;
        let id = format!("sub-{}", conn.next_sub);
        conn.next_sub += 1;

        // Register before SUBSCRIBE goes out so no early MESSAGE is missed.
        lock(&conn.subscriptions).insert(
            id.clone(),
            Subscription {
                topic: topic.to_string(),
                tx: on_message,
            },
        );
        let frame = Frame::new(Command::Subscribe)
            .with_header("id", id.as_str())
            .with_header("destination", topic)
            .with_header("ack", "auto");
        if let Err(e) = conn.queue(frame) {
            lock(&conn.subscriptions).remove(&id);
            return Err(e);
        }
        log::debug!("subscribed {} to {}", id, topic);
        Ok(SubscriptionHandle {
            id,
            topic: topic.to_string(),
        })
    }

    fn unsubscribe(&self, handle: &SubscriptionHandle) -> Result<(), TransportError> {
        let guard = lock(&self.conn);
        let conn = guard.as_ref().ok_or(TransportError::NotConnected)?;
        lock(&conn.subscriptions).remove(&handle.id);
        conn.queue(Frame::new(Command::Unsubscribe).with_header("id", handle.id.as_str()))
    }

    fn publish(&self, destination: &str, payload: &ChatMessage) -> Result<(), TransportError> {
        let body = serde_json::to_string(payload)?;
        let guard = lock(&self.conn);
        let conn = guard.as_ref().ok_or(TransportError::NotConnected)?;
        conn.queue(
            Frame::new(Command::Send)
                .with_header("destination", destination)
                .with_header("content-type", "application/json")
                .with_body(body),
        )
    }

    async fn teardown(&self) {
        self.close_current().await;
    }

    fn is_connected(&self) -> bool {
        lock(&self.conn)
            .as_ref()
            .map(|c| c.alive.load(Ordering::SeqCst))
            .unwrap_or(false)
    }
}

async fn run_writer(mut sink: WsSink, mut rx: mpsc::Receiver<Message>) {
    while let Some(msg) = rx.recv().await {
        if let Err(e) = sink.send(msg).await {
            log::debug!("stomp writer: send failed: {}", e);
            break;
        }
    }
    let _ = sink.close().await;
}

async fn run_reader(mut source: WsSource, subscriptions: SubscriptionMap, alive: Arc<AtomicBool>) {
    'outer: while let Some(msg) = source.next().await {
        let text = match msg {
            Ok(Message::Text(t)) => t,
            Ok(Message::Close(_)) => break,
            Ok(_) => continue,
            Err(e) => {
                log::warn!("stomp connection error: {}", e);
                break;
            }
        };
        let frames = match Frame::decode_all(&text) {
            Ok(f) => f,
            Err(e) => {
                log::warn!("dropping undecodable stomp payload: {}", e);
                continue;
            }
        };
        for frame in frames {
            match frame.command {
                Command::Message => dispatch(&subscriptions, &frame).await,
                Command::Error => {
                    log::warn!(
                        "stomp error frame: {} {}",
                        frame.get("message").unwrap_or(""),
                        frame.body
                    );
                    break 'outer;
                }
                other => log::debug!("ignoring inbound {}", other),
            }
        }
    }
    alive.store(false, Ordering::SeqCst);
    // Dropping the senders tells every subscriber the connection is gone.
    lock(&subscriptions).clear();
    log::info!("stomp connection closed");
}

async fn dispatch(subscriptions: &SubscriptionMap, frame: &Frame) {
    let Some(sub_id) = frame.get("subscription") else {
        log::debug!("MESSAGE without subscription header");
        return;
    };
    let tx = match lock(subscriptions).get(sub_id) {
        Some(sub) => {
            if let Some(dest) = frame.get("destination") {
                if dest != sub.topic {
                    log::debug!("MESSAGE for {} delivered on {} subscription", dest, sub.topic);
                }
            }
            sub.tx.clone()
        }
        None => {
            log::debug!("MESSAGE for unknown subscription {}", sub_id);
            return;
        }
    };
    let msg: ChatMessage = match serde_json::from_str(&frame.body) {
        Ok(m) => m,
        Err(e) => {
            log::warn!("dropping unparseable chat payload: {}", e);
            return;
        }
    };
    if tx.send(msg).await.is_err() {
        lock(subscriptions).remove(sub_id);
    }
}

/// Host part (with port) of a ws:// URL, for the CONNECT `host` header.
fn host_of(endpoint: &str) -> &str {
    let rest = endpoint
        .split_once("://")
        .map(|(_, r)| r)
        .unwrap_or(endpoint);
    rest.split(['/', '?']).next().unwrap_or(rest)
}
