//! Notification pipeline wiring: history, push channel and read state.
//!
//! The center owns nothing global. It is constructed from a connector, a
//! REST client and a token source, and publishes feed snapshots through a
//! watch channel for whatever presentation layer sits on top.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Result;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::notifications::api::NotificationsApi;
use crate::notifications::models::Notification;
use crate::notifications::store::{reduce, FeedEvent, FeedState};
use crate::subscriptions::{MessageCallback, SubscriptionHandle};
use crate::token::{decode_claims, TokenSource};
use crate::transport::{ConnectionState, Connector};

const HISTORY_PAGE: u32 = 0;
const HISTORY_PAGE_SIZE: u32 = 50;

#[derive(Default)]
struct CenterInner {
    subscription: Option<SubscriptionHandle>,
    refresh_task: Option<JoinHandle<()>>,
    status_task: Option<JoinHandle<()>>,
}

/// Orchestrates the notification feed for one authenticated user.
///
/// The pipeline only activates for a customer token; for every other role
/// `start` and the mutation methods are no-ops, so callers never need to
/// branch on role themselves.
pub struct NotificationCenter {
    connector: Arc<Connector>,
    api: NotificationsApi,
    tokens: Arc<dyn TokenSource>,
    refresh_interval: Duration,
    feed_tx: watch::Sender<FeedState>,
    inner: Mutex<CenterInner>,
    active: AtomicBool,
    shutdown: CancellationToken,
}

impl NotificationCenter {
    pub fn new(
        connector: Arc<Connector>,
        api: NotificationsApi,
        tokens: Arc<dyn TokenSource>,
        refresh_interval: Duration,
    ) -> Arc<Self> {
        let (feed_tx, _) = watch::channel(FeedState::default());
        Arc::new(Self {
            connector,
            api,
            tokens,
            refresh_interval,
            feed_tx,
            inner: Mutex::new(CenterInner::default()),
            active: AtomicBool::new(false),
            shutdown: CancellationToken::new(),
        })
    }

    /// Current feed snapshot.
    pub fn feed(&self) -> FeedState {
        self.feed_tx.borrow().clone()
    }

    /// Watch channel publishing every feed change.
    pub fn watch_feed(&self) -> watch::Receiver<FeedState> {
        self.feed_tx.subscribe()
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    /// Activate the pipeline: load history, connect, subscribe, and start
    /// the periodic token refresh.
    ///
    /// Silently does nothing when the current token does not belong to a
    /// customer with a notification queue.
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        let token = self.tokens.access_token().await?;
        let entitled = decode_claims(&token)
            .map(|claims| claims.can_receive_notifications())
            .unwrap_or(false);
        if !entitled {
            info!("Notifications not available for this session, pipeline stays off");
            return Ok(());
        }

        self.active.store(true, Ordering::SeqCst);
        self.load_history().await;
        self.connect_and_subscribe().await?;
        self.spawn_status_task();
        self.spawn_refresh_task();
        Ok(())
    }

    /// Stop the pipeline and close the push channel.
    pub async fn stop(&self) {
        self.shutdown.cancel();
        self.active.store(false, Ordering::SeqCst);

        let (subscription, refresh, status) = {
            let mut inner = self.inner.lock().unwrap();
            (
                inner.subscription.take(),
                inner.refresh_task.take(),
                inner.status_task.take(),
            )
        };
        if let Some(subscription) = subscription {
            subscription.unsubscribe();
        }
        if let Some(task) = refresh {
            task.abort();
        }
        if let Some(task) = status {
            task.abort();
        }
        self.connector.disconnect().await;
    }

    /// Optimistically mark one notification read, then sync the server.
    ///
    /// On a sync failure the history is re-fetched so the local view falls
    /// back to whatever the server says.
    pub async fn mark_read(&self, id: &str) -> Result<()> {
        if !self.is_active() {
            return Ok(());
        }
        self.apply(FeedEvent::MarkRead(id.to_string()));
        if let Err(err) = self.api.mark_read(id).await {
            warn!("Mark-read failed, reloading from server: {err:#}");
            self.load_history().await;
            return Err(err);
        }
        Ok(())
    }

    /// Optimistically mark everything read, then sync the server.
    pub async fn mark_all_read(&self) -> Result<()> {
        if !self.is_active() {
            return Ok(());
        }
        self.apply(FeedEvent::MarkAllRead);
        if let Err(err) = self.api.mark_all_read().await {
            warn!("Mark-all-read failed, reloading from server: {err:#}");
            self.load_history().await;
            return Err(err);
        }
        Ok(())
    }

    /// Recover the pipeline after the host application regains focus.
    ///
    /// Silent drops (suspend, network change) can leave the connector
    /// disconnected without anyone noticing; this re-runs the connect and
    /// subscribe sequence when nothing is in flight.
    pub async fn on_focus(self: &Arc<Self>) {
        if !self.is_active() {
            return;
        }
        if matches!(
            self.connector.state(),
            ConnectionState::Connecting | ConnectionState::Connected
        ) {
            return;
        }
        info!("Recovering push channel after focus");
        if let Err(err) = self.connect_and_subscribe().await {
            warn!("Focus recovery failed: {err:#}");
        }
    }

    async fn connect_and_subscribe(self: &Arc<Self>) -> Result<()> {
        let center = Arc::downgrade(self);
        let callback: MessageCallback = Arc::new(move |value| {
            if let Some(center) = center.upgrade() {
                center.on_push(value);
            }
        });

        let subscription = self.connector.subscribe_user_notifications(callback).await?;
        match subscription {
            Some(handle) => {
                debug!("Subscribed to {}", handle.destination());
                self.inner.lock().unwrap().subscription = Some(handle);
            }
            // Entitlement was checked in start(); reaching this means the
            // token changed underneath us. Leave the pipeline idle.
            None => debug!("Subscription skipped, token no longer entitled"),
        }
        Ok(())
    }

    fn on_push(&self, value: serde_json::Value) {
        match Notification::from_value(value) {
            Some(notification) => {
                debug!("Push received: {}", notification.id);
                self.apply(FeedEvent::Push(notification));
            }
            None => warn!("Ignoring push payload with unexpected shape"),
        }
    }

    async fn load_history(&self) {
        self.apply(FeedEvent::LoadingStarted);
        match self.api.fetch(HISTORY_PAGE, HISTORY_PAGE_SIZE).await {
            Ok(notifications) => self.apply(FeedEvent::HistoryLoaded(notifications)),
            Err(err) => {
                warn!("Failed to load notification history: {err:#}");
                self.apply(FeedEvent::LoadFailed);
            }
        }
    }

    fn apply(&self, event: FeedEvent) {
        self.feed_tx.send_modify(|state| {
            *state = reduce(state, event);
        });
    }

    /// Mirror connector state transitions into the feed.
    fn spawn_status_task(self: &Arc<Self>) {
        let center = Arc::downgrade(self);
        let mut states = self.connector.watch_state();
        let shutdown = self.shutdown.clone();
        // Seed the flag from the current state; the task only sees changes.
        self.apply(FeedEvent::ConnectionChanged(
            *states.borrow_and_update() == ConnectionState::Connected,
        ));
        let task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    changed = states.changed() => {
                        if changed.is_err() {
                            break;
                        }
                    }
                }
                let connected = *states.borrow_and_update() == ConnectionState::Connected;
                let Some(center) = center.upgrade() else { break };
                center.apply(FeedEvent::ConnectionChanged(connected));
            }
        });
        self.inner.lock().unwrap().status_task = Some(task);
    }

    /// Rotate the session token on a fixed period while connected.
    ///
    /// A failed refresh is logged and retried at the next tick; the live
    /// session keeps running on its current token in the meantime.
    fn spawn_refresh_task(self: &Arc<Self>) {
        let center = Arc::downgrade(self);
        let shutdown = self.shutdown.clone();
        let period = self.refresh_interval;
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            // The first tick fires immediately; skip it.
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                let Some(center) = center.upgrade() else { break };
                center.refresh_token().await;
            }
        });
        self.inner.lock().unwrap().refresh_task = Some(task);
    }

    async fn refresh_token(self: &Arc<Self>) {
        if self.connector.state() != ConnectionState::Connected {
            debug!("Skipping token refresh while not connected");
            return;
        }
        match self.tokens.refresh().await {
            Ok(_) => {
                if let Err(err) = self.connector.update_token().await {
                    warn!("Reconnect with refreshed token failed: {err}");
                }
            }
            Err(err) => warn!("Token refresh failed: {err:#}"),
        }
    }
}
