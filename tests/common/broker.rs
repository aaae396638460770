//! Test broker lifecycle management
//!
//! Spawns an in-process mock of the banking backend: the notification REST
//! endpoints plus a minimal STOMP-over-WebSocket broker. Each test gets an
//! isolated broker on a random port with its own state and fault switches.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{get, put};
use axum::{Json, Router};
use futures::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::net::TcpListener;
use tokio::sync::mpsc;

use bankline_client::transport::stomp::{Command, Frame};

const BROKER_READY_TIMEOUT_MS: u64 = 5000;
const BROKER_READY_POLL_INTERVAL_MS: u64 = 20;

enum BrokerOut {
    Frame(String),
    Close,
}

struct Session {
    id: usize,
    outbound: mpsc::UnboundedSender<BrokerOut>,
    /// destination -> broker-side subscription id
    subscriptions: HashMap<String, String>,
}

#[derive(Default)]
struct BrokerState {
    notifications: Mutex<Vec<Value>>,
    session: Mutex<Option<Session>>,
    /// SUBSCRIBE frames seen, per destination, across all sessions.
    subscribe_frames: Mutex<HashMap<String, usize>>,
    ws_connections: AtomicUsize,
    mark_read_calls: AtomicUsize,
    mark_all_read_calls: AtomicUsize,
    fetch_calls: AtomicUsize,
    /// Reject STOMP handshakes with an ERROR frame.
    reject_ws: AtomicBool,
    /// Delay before answering CONNECT with CONNECTED, in milliseconds.
    connect_delay_ms: AtomicU64,
    /// Fail the mark-read endpoints with a 500.
    fail_mutations: AtomicBool,
    message_counter: AtomicUsize,
}

/// In-process backend mock with its own REST and WebSocket endpoints.
///
/// When dropped, the server gracefully shuts down.
pub struct TestBroker {
    /// Base URL for REST requests (e.g., "http://127.0.0.1:12345")
    pub base_url: String,

    state: Arc<BrokerState>,
    _shutdown_tx: Option<tokio::sync::oneshot::Sender<()>>,
}

impl TestBroker {
    /// Spawns a broker on a random port and waits for it to be ready.
    pub async fn spawn() -> Self {
        let state = Arc::new(BrokerState::default());

        let app = Router::new()
            .route("/api/notifications", get(list_notifications))
            .route("/api/notifications/read/{id}", put(mark_read))
            .route("/api/notifications/read-all", put(mark_all_read))
            .route("/ws", get(ws_handler))
            .with_state(state.clone());

        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("Failed to bind to random port");
        let port = listener
            .local_addr()
            .expect("Failed to get local address")
            .port();
        let base_url = format!("http://127.0.0.1:{}", port);

        let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel::<()>();
        tokio::spawn(async move {
            axum::serve(listener, app)
                .with_graceful_shutdown(async {
                    shutdown_rx.await.ok();
                })
                .await
                .expect("Broker failed");
        });

        let broker = Self {
            base_url,
            state,
            _shutdown_tx: Some(shutdown_tx),
        };
        broker.wait_for_ready().await;
        // The readiness probe above hits the notification endpoint; reset
        // the counter so tests only see the client's own fetches.
        broker.state.fetch_calls.store(0, Ordering::SeqCst);
        broker
    }

    pub fn ws_url(&self) -> String {
        format!("{}/ws", self.base_url.replace("http://", "ws://"))
    }

    /// Replace the stored notification list served by the REST endpoint.
    pub fn seed_notifications(&self, notifications: Vec<Value>) {
        *self.state.notifications.lock().unwrap() = notifications;
    }

    pub fn notifications(&self) -> Vec<Value> {
        self.state.notifications.lock().unwrap().clone()
    }

    /// Deliver a MESSAGE frame to the current session, if the destination
    /// has a live subscription. Returns false otherwise.
    pub fn push(&self, destination: &str, body: &str) -> bool {
        let session = self.state.session.lock().unwrap();
        let Some(session) = session.as_ref() else {
            return false;
        };
        let Some(subscription_id) = session.subscriptions.get(destination) else {
            return false;
        };
        let message_id = self.state.message_counter.fetch_add(1, Ordering::SeqCst);
        let frame = Frame::new(Command::Message)
            .header("subscription", subscription_id.clone())
            .header("destination", destination)
            .header("message-id", message_id.to_string())
            .body(body);
        session.outbound.send(BrokerOut::Frame(frame.encode())).is_ok()
    }

    /// Close the current WebSocket session from the broker side.
    pub fn drop_session(&self) {
        let session = self.state.session.lock().unwrap();
        if let Some(session) = session.as_ref() {
            let _ = session.outbound.send(BrokerOut::Close);
        }
    }

    pub fn has_subscription(&self, destination: &str) -> bool {
        self.state
            .session
            .lock()
            .unwrap()
            .as_ref()
            .map(|s| s.subscriptions.contains_key(destination))
            .unwrap_or(false)
    }

    /// SUBSCRIBE frames received for a destination, across all sessions.
    pub fn subscribe_frames(&self, destination: &str) -> usize {
        self.state
            .subscribe_frames
            .lock()
            .unwrap()
            .get(destination)
            .copied()
            .unwrap_or(0)
    }

    /// WebSocket sessions that completed the STOMP handshake.
    pub fn ws_connections(&self) -> usize {
        self.state.ws_connections.load(Ordering::SeqCst)
    }

    pub fn mark_read_calls(&self) -> usize {
        self.state.mark_read_calls.load(Ordering::SeqCst)
    }

    pub fn mark_all_read_calls(&self) -> usize {
        self.state.mark_all_read_calls.load(Ordering::SeqCst)
    }

    pub fn fetch_calls(&self) -> usize {
        self.state.fetch_calls.load(Ordering::SeqCst)
    }

    pub fn set_reject_ws(&self, reject: bool) {
        self.state.reject_ws.store(reject, Ordering::SeqCst);
    }

    /// Make every STOMP handshake hang for a while before CONNECTED.
    pub fn set_connect_delay(&self, delay: Duration) {
        self.state
            .connect_delay_ms
            .store(delay.as_millis() as u64, Ordering::SeqCst);
    }

    pub fn set_fail_mutations(&self, fail: bool) {
        self.state.fail_mutations.store(fail, Ordering::SeqCst);
    }

    async fn wait_for_ready(&self) {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_millis(200))
            .build()
            .expect("Failed to build reqwest client");

        let start = std::time::Instant::now();
        let timeout = Duration::from_millis(BROKER_READY_TIMEOUT_MS);
        loop {
            if start.elapsed() > timeout {
                panic!("Broker did not become ready within {}ms", BROKER_READY_TIMEOUT_MS);
            }
            match client
                .get(format!("{}/api/notifications", self.base_url))
                .send()
                .await
            {
                Ok(response) if response.status().is_success() => return,
                _ => {
                    tokio::time::sleep(Duration::from_millis(BROKER_READY_POLL_INTERVAL_MS)).await
                }
            }
        }
    }
}

impl Drop for TestBroker {
    fn drop(&mut self) {
        if let Some(tx) = self._shutdown_tx.take() {
            let _ = tx.send(());
        }
    }
}

async fn list_notifications(
    State(state): State<Arc<BrokerState>>,
    Query(_params): Query<HashMap<String, String>>,
) -> Json<Vec<Value>> {
    state.fetch_calls.fetch_add(1, Ordering::SeqCst);
    Json(state.notifications.lock().unwrap().clone())
}

async fn mark_read(
    State(state): State<Arc<BrokerState>>,
    Path(id): Path<String>,
) -> StatusCode {
    state.mark_read_calls.fetch_add(1, Ordering::SeqCst);
    if state.fail_mutations.load(Ordering::SeqCst) {
        return StatusCode::INTERNAL_SERVER_ERROR;
    }
    let mut notifications = state.notifications.lock().unwrap();
    for notification in notifications.iter_mut() {
        if notification["id"] == id.as_str() {
            notification["read"] = Value::Bool(true);
        }
    }
    StatusCode::OK
}

async fn mark_all_read(State(state): State<Arc<BrokerState>>) -> StatusCode {
    state.mark_all_read_calls.fetch_add(1, Ordering::SeqCst);
    if state.fail_mutations.load(Ordering::SeqCst) {
        return StatusCode::INTERNAL_SERVER_ERROR;
    }
    let mut notifications = state.notifications.lock().unwrap();
    for notification in notifications.iter_mut() {
        notification["read"] = Value::Bool(true);
    }
    StatusCode::OK
}

async fn ws_handler(
    State(state): State<Arc<BrokerState>>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(state, socket))
}

async fn handle_socket(state: Arc<BrokerState>, socket: WebSocket) {
    let (mut sink, mut stream) = socket.split();

    // STOMP handshake: wait for CONNECT, answer CONNECTED.
    let connect = loop {
        match stream.next().await {
            Some(Ok(Message::Text(text))) => match Frame::decode(text.as_str()) {
                Ok(Some(frame)) if frame.command == Command::Connect => break frame,
                Ok(_) => continue,
                Err(_) => return,
            },
            Some(Ok(_)) => continue,
            _ => return,
        }
    };

    let authorized = connect
        .header_value("Authorization")
        .map(|v| v.starts_with("Bearer "))
        .unwrap_or(false);
    if state.reject_ws.load(Ordering::SeqCst) || !authorized {
        let error = Frame::new(Command::Error)
            .header("message", "connection rejected")
            .encode();
        let _ = sink.send(Message::Text(error.into())).await;
        let _ = sink.close().await;
        return;
    }

    let connect_delay = state.connect_delay_ms.load(Ordering::SeqCst);
    if connect_delay > 0 {
        tokio::time::sleep(Duration::from_millis(connect_delay)).await;
    }

    let heartbeat = connect.header_value("heart-beat").unwrap_or("0,0").to_string();
    let connected = Frame::new(Command::Connected)
        .header("version", "1.2")
        .header("heart-beat", heartbeat)
        .encode();
    if sink.send(Message::Text(connected.into())).await.is_err() {
        return;
    }
    let session_id = state.ws_connections.fetch_add(1, Ordering::SeqCst);

    let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<BrokerOut>();
    *state.session.lock().unwrap() = Some(Session {
        id: session_id,
        outbound: outbound_tx,
        subscriptions: HashMap::new(),
    });

    loop {
        tokio::select! {
            out = outbound_rx.recv() => match out {
                Some(BrokerOut::Frame(frame)) => {
                    if sink.send(Message::Text(frame.into())).await.is_err() {
                        break;
                    }
                }
                Some(BrokerOut::Close) | None => {
                    let _ = sink.close().await;
                    break;
                }
            },
            message = stream.next() => match message {
                Some(Ok(Message::Text(text))) => {
                    if !handle_client_frame(&state, text.as_str()) {
                        break;
                    }
                }
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(_)) => break,
            },
        }
    }

    // A reconnect may already have registered a newer session.
    let mut session = state.session.lock().unwrap();
    if session.as_ref().map(|s| s.id) == Some(session_id) {
        *session = None;
    }
}

/// Returns false when the client asked to disconnect.
fn handle_client_frame(state: &Arc<BrokerState>, raw: &str) -> bool {
    let frame = match Frame::decode(raw) {
        Ok(Some(frame)) => frame,
        Ok(None) => return true,
        Err(_) => return true,
    };
    match frame.command {
        Command::Subscribe => {
            let (Some(id), Some(destination)) =
                (frame.header_value("id"), frame.header_value("destination"))
            else {
                return true;
            };
            *state
                .subscribe_frames
                .lock()
                .unwrap()
                .entry(destination.to_string())
                .or_insert(0) += 1;
            if let Some(session) = state.session.lock().unwrap().as_mut() {
                session
                    .subscriptions
                    .insert(destination.to_string(), id.to_string());
            }
            true
        }
        Command::Unsubscribe => {
            let Some(id) = frame.header_value("id") else {
                return true;
            };
            if let Some(session) = state.session.lock().unwrap().as_mut() {
                session.subscriptions.retain(|_, v| v != id);
            }
            true
        }
        Command::Disconnect => false,
        _ => true,
    }
}
