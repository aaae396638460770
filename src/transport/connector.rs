//! Connection lifecycle for the STOMP push channel.
//!
//! One [`Connector`] owns at most one WebSocket session at a time. A session
//! runs as a dedicated task fed by an mpsc command channel; the connector
//! itself only holds bookkeeping state behind a std mutex, taken briefly and
//! never across an await.
//!
//! Lifecycle: `Disconnected -> connect() -> Connecting -> Connected`.
//! Concurrent `connect()` calls share one pending attempt. A dropped session
//! reconnects with capped exponential backoff unless `disconnect()` was
//! requested; after a successful reconnect every durable subscription is
//! replayed.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::future::{BoxFuture, FutureExt, Shared};
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{interval, timeout, Instant, MissedTickBehavior};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

use crate::subscriptions::{
    LiveClaim, MessageCallback, SubscriptionHandle, SubscriptionRegistry,
};
use crate::token::{decode_claims, TokenSource};
use crate::transport::backoff::ReconnectPolicy;
use crate::transport::stomp::{Command, Frame, HEARTBEAT};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsSink = SplitSink<WsStream, Message>;
type WsSource = SplitStream<WsStream>;
type PendingConnect = Shared<BoxFuture<'static, Result<(), TransportError>>>;

#[derive(Debug, Clone, Error, PartialEq)]
pub enum TransportError {
    #[error("Connect attempt timed out")]
    Timeout,
    #[error("Connect attempt aborted by disconnect")]
    Aborted,
    #[error("Could not obtain access token: {0}")]
    Token(String),
    #[error("WebSocket error: {0}")]
    Socket(String),
    #[error("Broker rejected the session: {0}")]
    Broker(String),
    #[error("Not connected")]
    NotConnected,
}

#[derive(Debug, Clone, Error, PartialEq)]
pub enum SubscribeError {
    #[error("Subscribe timed out waiting for a connection")]
    Timeout,
    #[error(transparent)]
    Connect(#[from] TransportError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Disconnecting,
}

/// Transport settings. Defaults match the broker's expectations.
#[derive(Debug, Clone)]
pub struct ConnectorConfig {
    /// Full WebSocket URL, e.g. `wss://bank.example/ws`.
    pub ws_url: String,
    /// Heartbeat interval negotiated in both directions, in milliseconds.
    pub heartbeat_ms: u64,
    /// Upper bound on a single connect attempt, handshake included.
    pub connect_timeout: Duration,
    /// Upper bound on the connect wait inside `subscribe`.
    pub subscribe_timeout: Duration,
    pub reconnect: ReconnectPolicy,
    /// How long `disconnect()` suppresses automatic reconnects.
    pub disconnect_flag_reset: Duration,
}

impl Default for ConnectorConfig {
    fn default() -> Self {
        Self {
            ws_url: "ws://localhost:8080/ws".to_string(),
            heartbeat_ms: 10_000,
            connect_timeout: Duration::from_secs(15),
            subscribe_timeout: Duration::from_secs(10),
            reconnect: ReconnectPolicy::default(),
            disconnect_flag_reset: Duration::from_secs(1),
        }
    }
}

enum SessionCommand {
    Send(Frame),
    Close,
}

struct SessionHandle {
    id: u64,
    commands: mpsc::UnboundedSender<SessionCommand>,
    task: JoinHandle<()>,
}

#[derive(Default)]
struct ConnectorInner {
    /// The in-flight connect attempt, tagged with its attempt id so a
    /// superseded attempt can recognize itself as stale.
    pending_connect: Option<(u64, PendingConnect)>,
    session: Option<SessionHandle>,
    reconnect_task: Option<JoinHandle<()>>,
    flag_reset: Option<JoinHandle<()>>,
}

/// STOMP-over-WebSocket connector with automatic reconnection.
pub struct Connector {
    config: ConnectorConfig,
    tokens: Arc<dyn TokenSource>,
    registry: SubscriptionRegistry,
    state_tx: watch::Sender<ConnectionState>,
    inner: Mutex<ConnectorInner>,
    disconnecting: AtomicBool,
    retries: AtomicU32,
    next_session_id: AtomicU64,
    next_attempt_id: AtomicU64,
}

impl Connector {
    pub fn new(config: ConnectorConfig, tokens: Arc<dyn TokenSource>) -> Arc<Self> {
        let (state_tx, _) = watch::channel(ConnectionState::Disconnected);
        Arc::new(Self {
            config,
            tokens,
            registry: SubscriptionRegistry::new(),
            state_tx,
            inner: Mutex::new(ConnectorInner::default()),
            disconnecting: AtomicBool::new(false),
            retries: AtomicU32::new(0),
            next_session_id: AtomicU64::new(0),
            next_attempt_id: AtomicU64::new(0),
        })
    }

    pub fn state(&self) -> ConnectionState {
        *self.state_tx.borrow()
    }

    /// Watch channel publishing every state transition.
    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.state_tx.subscribe()
    }

    /// Establish the session, retrying per the reconnect policy.
    ///
    /// Idempotent: returns immediately when already connected, and any number
    /// of concurrent callers await the same underlying attempt.
    pub async fn connect(self: &Arc<Self>) -> Result<(), TransportError> {
        let pending = {
            let mut inner = self.inner.lock().unwrap();
            if inner.session.is_some() {
                return Ok(());
            }
            match &inner.pending_connect {
                Some((_, pending)) => pending.clone(),
                None => {
                    let attempt_id = self.next_attempt_id.fetch_add(1, Ordering::SeqCst);
                    let this = Arc::clone(self);
                    let pending = async move { this.connect_loop(attempt_id).await }
                        .boxed()
                        .shared();
                    inner.pending_connect = Some((attempt_id, pending.clone()));
                    pending
                }
            }
        };
        pending.await
    }

    /// Tear the session down and connect again with a fresh token.
    ///
    /// The token is read from the token source at every connect, so rotation
    /// is a plain teardown plus reconnect.
    pub async fn update_token(self: &Arc<Self>) -> Result<(), TransportError> {
        info!("Rotating session token");
        self.disconnect().await;
        self.connect().await
    }

    /// Close the session and suppress automatic reconnects for a short
    /// window. A manual `connect()` inside the window still works.
    pub async fn disconnect(self: &Arc<Self>) {
        self.disconnecting.store(true, Ordering::SeqCst);
        self.state_tx.send_replace(ConnectionState::Disconnecting);

        let (session, reconnect) = {
            let mut inner = self.inner.lock().unwrap();
            // Orphan any in-flight connect attempt; it notices and bails
            // instead of resurrecting the session after this teardown.
            inner.pending_connect = None;
            (inner.session.take(), inner.reconnect_task.take())
        };
        if let Some(task) = reconnect {
            task.abort();
        }

        let live = self.registry.clear_live();
        if let Some(session) = session {
            for subscription_id in live {
                let frame = Frame::new(Command::Unsubscribe).header("id", subscription_id);
                let _ = session.commands.send(SessionCommand::Send(frame));
            }
            let _ = session.commands.send(SessionCommand::Close);
            let _ = session.task.await;
        }

        self.retries.store(0, Ordering::SeqCst);
        self.state_tx.send_replace(ConnectionState::Disconnected);

        let this = Arc::clone(self);
        let reset = tokio::spawn(async move {
            tokio::time::sleep(this.config.disconnect_flag_reset).await;
            this.disconnecting.store(false, Ordering::SeqCst);
        });
        let previous = self.inner.lock().unwrap().flag_reset.replace(reset);
        if let Some(previous) = previous {
            previous.abort();
        }
        debug!("Disconnected");
    }

    /// Subscribe a callback to a destination, connecting first if needed.
    ///
    /// The callback is recorded durably before anything touches the network,
    /// so a reconnect can never lose it. A second subscribe for an already
    /// live destination reuses the existing broker subscription.
    pub async fn subscribe(
        self: &Arc<Self>,
        destination: &str,
        callback: MessageCallback,
    ) -> Result<SubscriptionHandle, SubscribeError> {
        self.registry.record_durable(destination, callback);

        if self.state() != ConnectionState::Connected {
            timeout(self.config.subscribe_timeout, self.connect())
                .await
                .map_err(|_| SubscribeError::Timeout)??;
        }

        self.subscribe_live(destination)
    }

    /// Subscribe to the caller's own notification queue.
    ///
    /// The destination is derived from the token claims. Returns `Ok(None)`
    /// without any network activity when the claims are undecodable, carry no
    /// user id, or the role has no notification queue.
    pub async fn subscribe_user_notifications(
        self: &Arc<Self>,
        callback: MessageCallback,
    ) -> Result<Option<SubscriptionHandle>, SubscribeError> {
        let token = self
            .tokens
            .access_token()
            .await
            .map_err(|err| SubscribeError::Connect(TransportError::Token(err.to_string())))?;
        let Some(claims) = decode_claims(&token) else {
            debug!("Token claims undecodable, skipping notification subscription");
            return Ok(None);
        };
        if !claims.can_receive_notifications() {
            debug!("Role has no notification queue, skipping subscription");
            return Ok(None);
        }
        let Some(user_id) = claims.user_id else {
            return Ok(None);
        };

        let destination = format!("/user/{user_id}/queue/notifications");
        self.subscribe(&destination, callback).await.map(Some)
    }

    pub(crate) fn drop_subscription(&self, destination: &str, subscription_id: &str) {
        self.registry.remove_durable(destination);
        if self.registry.release_live(destination, subscription_id) {
            let frame = Frame::new(Command::Unsubscribe).header("id", subscription_id);
            if self.send_frame(frame).is_err() {
                debug!("Unsubscribe for {destination} skipped, no live session");
            }
        }
    }

    async fn connect_loop(self: Arc<Self>, attempt_id: u64) -> Result<(), TransportError> {
        let result = loop {
            if self.attempt_is_stale(attempt_id) {
                break Err(TransportError::Aborted);
            }
            self.state_tx.send_replace(ConnectionState::Connecting);
            match self.connect_once(attempt_id).await {
                Ok(()) => {
                    // disconnect() may have completed while the handshake
                    // was in flight; its teardown must win.
                    if self.attempt_is_stale(attempt_id) {
                        self.close_session().await;
                        break Err(TransportError::Aborted);
                    }
                    break Ok(());
                }
                Err(err) => {
                    warn!("Connect attempt failed: {err}");
                    if self.disconnecting.load(Ordering::SeqCst)
                        || self.attempt_is_stale(attempt_id)
                    {
                        break Err(err);
                    }
                    let retry = self.retries.load(Ordering::SeqCst);
                    if !self.config.reconnect.should_retry(retry) {
                        warn!("Giving up after {retry} retries");
                        break Err(err);
                    }
                    self.retries.store(retry + 1, Ordering::SeqCst);
                    let delay = self.config.reconnect.delay_ms(retry);
                    debug!("Retry {} in {delay} ms", retry + 1);
                    tokio::time::sleep(Duration::from_millis(delay)).await;
                }
            }
        };

        let was_current = {
            let mut inner = self.inner.lock().unwrap();
            match &inner.pending_connect {
                Some((id, _)) if *id == attempt_id => {
                    inner.pending_connect = None;
                    true
                }
                _ => false,
            }
        };

        match result {
            Ok(()) => {
                self.retries.store(0, Ordering::SeqCst);
                self.clear_disconnecting();
                self.state_tx.send_replace(ConnectionState::Connected);
                info!("Connected to {}", self.config.ws_url);
                self.replay_subscriptions();
                Ok(())
            }
            Err(err) => {
                // A stale attempt must not stomp the state that disconnect()
                // (or a newer attempt) already published.
                if was_current {
                    self.state_tx.send_replace(ConnectionState::Disconnected);
                }
                Err(err)
            }
        }
    }

    async fn connect_once(self: &Arc<Self>, attempt_id: u64) -> Result<(), TransportError> {
        let token = self
            .tokens
            .access_token()
            .await
            .map_err(|err| TransportError::Token(err.to_string()))?;

        let (mut sink, source) = timeout(self.config.connect_timeout, self.open_session(token))
            .await
            .map_err(|_| TransportError::Timeout)??;

        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let session_id = self.next_session_id.fetch_add(1, Ordering::SeqCst);

        {
            let mut inner = self.inner.lock().unwrap();
            if matches!(&inner.pending_connect, Some((id, _)) if *id == attempt_id) {
                let this = Arc::clone(self);
                let task = tokio::spawn(async move {
                    this.run_session(session_id, sink, source, command_rx).await;
                });
                inner.session = Some(SessionHandle {
                    id: session_id,
                    commands: command_tx,
                    task,
                });
                return Ok(());
            }
        }

        // disconnect() orphaned this attempt between the handshake and the
        // session handoff. Close the fresh socket instead of keeping it.
        let goodbye = Frame::new(Command::Disconnect).encode();
        let _ = sink.send(Message::Text(goodbye.into())).await;
        let _ = sink.close().await;
        Err(TransportError::Aborted)
    }

    fn attempt_is_stale(&self, attempt_id: u64) -> bool {
        !matches!(
            &self.inner.lock().unwrap().pending_connect,
            Some((id, _)) if *id == attempt_id
        )
    }

    async fn close_session(&self) {
        let session = self.inner.lock().unwrap().session.take();
        if let Some(session) = session {
            let _ = session.commands.send(SessionCommand::Close);
            let _ = session.task.await;
        }
    }

    /// Open the socket and complete the STOMP handshake.
    async fn open_session(&self, token: String) -> Result<(WsSink, WsSource), TransportError> {
        let (socket, _) = connect_async(self.config.ws_url.as_str())
            .await
            .map_err(|err| TransportError::Socket(err.to_string()))?;
        let (mut sink, mut source) = socket.split();

        let heartbeat = self.config.heartbeat_ms;
        let connect = Frame::new(Command::Connect)
            .header("accept-version", "1.2")
            .header("host", host_of(&self.config.ws_url))
            .header("heart-beat", format!("{heartbeat},{heartbeat}"))
            .header("Authorization", format!("Bearer {token}"));
        sink.send(Message::Text(connect.encode().into()))
            .await
            .map_err(|err| TransportError::Socket(err.to_string()))?;

        loop {
            let message = source
                .next()
                .await
                .ok_or_else(|| {
                    TransportError::Socket("socket closed during handshake".to_string())
                })?
                .map_err(|err| TransportError::Socket(err.to_string()))?;
            let Message::Text(text) = message else {
                continue;
            };
            match Frame::decode(text.as_str()) {
                Ok(None) => continue,
                Ok(Some(frame)) if frame.command == Command::Connected => break,
                Ok(Some(frame)) if frame.command == Command::Error => {
                    let reason = frame
                        .header_value("message")
                        .unwrap_or(frame.body.as_str())
                        .to_string();
                    return Err(TransportError::Broker(reason));
                }
                Ok(Some(frame)) => {
                    debug!("Ignoring {} frame during handshake", frame.command.as_str());
                }
                Err(err) => warn!("Undecodable frame during handshake: {err}"),
            }
        }

        Ok((sink, source))
    }

    /// Session task. Owns the socket until the session ends, for any reason.
    async fn run_session(
        self: Arc<Self>,
        session_id: u64,
        mut sink: WsSink,
        mut source: WsSource,
        mut commands: mpsc::UnboundedReceiver<SessionCommand>,
    ) {
        let heartbeat = Duration::from_millis(self.config.heartbeat_ms);
        let mut outbound_beat = interval(heartbeat);
        outbound_beat.set_missed_tick_behavior(MissedTickBehavior::Skip);
        // The broker is considered gone after two missed heartbeats.
        let watchdog = heartbeat * 2;
        let mut inbound_check = interval(watchdog);
        inbound_check.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut last_inbound = Instant::now();

        loop {
            tokio::select! {
                _ = outbound_beat.tick() => {
                    if sink.send(Message::Text(HEARTBEAT.into())).await.is_err() {
                        break;
                    }
                }
                _ = inbound_check.tick() => {
                    if last_inbound.elapsed() > watchdog {
                        warn!("No traffic from broker for {watchdog:?}, dropping session");
                        break;
                    }
                }
                command = commands.recv() => match command {
                    Some(SessionCommand::Send(frame)) => {
                        if sink.send(Message::Text(frame.encode().into())).await.is_err() {
                            break;
                        }
                    }
                    Some(SessionCommand::Close) | None => {
                        let goodbye = Frame::new(Command::Disconnect).encode();
                        let _ = sink.send(Message::Text(goodbye.into())).await;
                        let _ = sink.close().await;
                        break;
                    }
                },
                message = source.next() => match message {
                    Some(Ok(Message::Text(text))) => {
                        last_inbound = Instant::now();
                        if !self.handle_inbound(text.as_str()) {
                            break;
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => {
                        debug!("Broker closed the socket");
                        break;
                    }
                    Some(Ok(_)) => last_inbound = Instant::now(),
                    Some(Err(err)) => {
                        warn!("Socket error: {err}");
                        break;
                    }
                },
            }
        }

        self.handle_session_end(session_id);
    }

    /// Returns false when the session must be dropped.
    fn handle_inbound(&self, raw: &str) -> bool {
        match Frame::decode(raw) {
            Ok(None) => true,
            Ok(Some(frame)) => match frame.command {
                Command::Message => {
                    let delivered = self.registry.dispatch(
                        frame.header_value("subscription"),
                        frame.header_value("destination"),
                        &frame.body,
                    );
                    if !delivered {
                        debug!("Dropping message with no matching subscription");
                    }
                    true
                }
                Command::Error => {
                    let reason = frame.header_value("message").unwrap_or(frame.body.as_str());
                    warn!("Broker ERROR frame: {reason}");
                    false
                }
                Command::Receipt => true,
                other => {
                    debug!("Ignoring {} frame", other.as_str());
                    true
                }
            },
            Err(err) => {
                warn!("Undecodable frame: {err}");
                true
            }
        }
    }

    /// Cleanup after a session task ends. Stale sessions (already replaced
    /// or taken by `disconnect`) are ignored via the id check.
    fn handle_session_end(self: &Arc<Self>, session_id: u64) {
        let was_current = {
            let mut inner = self.inner.lock().unwrap();
            match &inner.session {
                Some(session) if session.id == session_id => {
                    inner.session = None;
                    true
                }
                _ => false,
            }
        };
        if !was_current {
            return;
        }

        self.registry.clear_live();
        self.state_tx.send_replace(ConnectionState::Disconnected);

        if self.disconnecting.load(Ordering::SeqCst) {
            debug!("Session closed on request, not reconnecting");
            return;
        }
        if !self
            .config
            .reconnect
            .should_retry(self.retries.load(Ordering::SeqCst))
        {
            warn!("Reconnect retries exhausted, staying disconnected");
            return;
        }

        info!("Session dropped, reconnecting");
        let this = Arc::clone(self);
        let task = tokio::spawn(async move {
            if let Err(err) = this.connect().await {
                warn!("Automatic reconnect failed: {err}");
            }
        });
        self.inner.lock().unwrap().reconnect_task = Some(task);
    }

    fn subscribe_live(self: &Arc<Self>, destination: &str) -> Result<SubscriptionHandle, SubscribeError> {
        let subscription_id = match self.registry.claim_live(destination) {
            LiveClaim::Existing(id) => {
                return Ok(SubscriptionHandle::new(Arc::downgrade(self), destination, id));
            }
            LiveClaim::New(id) => id,
        };

        let frame = Frame::new(Command::Subscribe)
            .header("id", subscription_id.clone())
            .header("destination", destination);
        match self.send_frame(frame) {
            Ok(()) => Ok(SubscriptionHandle::new(
                Arc::downgrade(self),
                destination,
                subscription_id,
            )),
            Err(err) => {
                self.registry.release_live(destination, &subscription_id);
                Err(err.into())
            }
        }
    }

    /// Re-issue SUBSCRIBE frames for every durable destination not yet live.
    fn replay_subscriptions(self: &Arc<Self>) {
        for destination in self.registry.durable_destinations() {
            if self.registry.is_live(&destination) {
                continue;
            }
            match self.subscribe_live(&destination) {
                Ok(_) => debug!("Resubscribed {destination}"),
                Err(err) => warn!("Failed to resubscribe {destination}: {err}"),
            }
        }
    }

    fn send_frame(&self, frame: Frame) -> Result<(), TransportError> {
        let inner = self.inner.lock().unwrap();
        match &inner.session {
            Some(session) => session
                .commands
                .send(SessionCommand::Send(frame))
                .map_err(|_| TransportError::NotConnected),
            None => Err(TransportError::NotConnected),
        }
    }

    fn clear_disconnecting(&self) {
        self.disconnecting.store(false, Ordering::SeqCst);
        let reset = self.inner.lock().unwrap().flag_reset.take();
        if let Some(reset) = reset {
            reset.abort();
        }
    }
}

fn host_of(url: &str) -> &str {
    let rest = url.split_once("://").map(|(_, rest)| rest).unwrap_or(url);
    rest.split(['/', '?']).next().unwrap_or(rest)
}
