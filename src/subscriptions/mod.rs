//! Subscription bookkeeping for the push channel.
//!
//! Two maps with different lifetimes: the durable map (destination to
//! callback) survives reconnects and is the source of truth for what the
//! application wants to receive; the live map (destination to broker
//! subscription id) is scoped to a single connection and is rebuilt from the
//! durable map after every reconnect.

pub mod normalize;

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};

use tracing::debug;
use uuid::Uuid;

use crate::transport::connector::Connector;
use self::normalize::normalize_payload;

/// Callback invoked with the normalized payload of every inbound message.
pub type MessageCallback = Arc<dyn Fn(serde_json::Value) + Send + Sync>;

/// Outcome of claiming a live subscription slot for a destination.
pub enum LiveClaim {
    /// The slot was free; a SUBSCRIBE frame must be sent with this id.
    New(String),
    /// The destination is already live under this id; no frame to send.
    Existing(String),
}

#[derive(Default)]
struct Inner {
    durable: HashMap<String, MessageCallback>,
    live: HashMap<String, String>,
    by_id: HashMap<String, String>,
}

/// Registry of durable callbacks and live broker subscriptions.
///
/// All operations take the single internal lock briefly and never while
/// awaiting; callbacks are invoked outside the lock.
#[derive(Default)]
pub struct SubscriptionRegistry {
    inner: Mutex<Inner>,
}

impl SubscriptionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the callback for a destination. Overwrites a previous one.
    pub fn record_durable(&self, destination: &str, callback: MessageCallback) {
        let mut inner = self.inner.lock().unwrap();
        inner.durable.insert(destination.to_string(), callback);
    }

    /// Drop the durable callback so reconnects stop resubscribing it.
    pub fn remove_durable(&self, destination: &str) {
        let mut inner = self.inner.lock().unwrap();
        inner.durable.remove(destination);
    }

    /// Destinations the application wants live, in no particular order.
    pub fn durable_destinations(&self) -> Vec<String> {
        let inner = self.inner.lock().unwrap();
        inner.durable.keys().cloned().collect()
    }

    /// Atomically claim the live slot for a destination.
    ///
    /// Two racing subscribes resolve here: the first caller gets
    /// [`LiveClaim::New`], every later one the existing id.
    pub fn claim_live(&self, destination: &str) -> LiveClaim {
        let mut inner = self.inner.lock().unwrap();
        if let Some(existing) = inner.live.get(destination) {
            return LiveClaim::Existing(existing.clone());
        }
        let id = format!("sub-{}", Uuid::new_v4());
        inner.live.insert(destination.to_string(), id.clone());
        inner.by_id.insert(id.clone(), destination.to_string());
        LiveClaim::New(id)
    }

    /// Release a live slot if it is still held under the given id.
    ///
    /// Returns true when something was released. The id check makes stale
    /// releases from a previous connection harmless.
    pub fn release_live(&self, destination: &str, subscription_id: &str) -> bool {
        let mut inner = self.inner.lock().unwrap();
        match inner.live.get(destination) {
            Some(current) if current == subscription_id => {
                inner.live.remove(destination);
                inner.by_id.remove(subscription_id);
                true
            }
            _ => false,
        }
    }

    /// Whether the destination currently has a live subscription.
    pub fn is_live(&self, destination: &str) -> bool {
        self.inner.lock().unwrap().live.contains_key(destination)
    }

    /// Drop every live slot, keeping the durable map intact.
    ///
    /// Returns the released subscription ids so the caller can send
    /// UNSUBSCRIBE frames when the session is still writable.
    pub fn clear_live(&self) -> Vec<String> {
        let mut inner = self.inner.lock().unwrap();
        inner.live.clear();
        inner.by_id.drain().map(|(id, _)| id).collect()
    }

    /// Route an inbound MESSAGE body to the matching durable callback.
    ///
    /// Resolution prefers the `subscription` header (authoritative for this
    /// connection) and falls back to the `destination` header. The body is
    /// normalized before the callback sees it. Returns false when no
    /// callback matched.
    pub fn dispatch(
        &self,
        subscription_id: Option<&str>,
        destination: Option<&str>,
        body: &str,
    ) -> bool {
        let callback = {
            let inner = self.inner.lock().unwrap();
            let resolved = subscription_id
                .and_then(|id| inner.by_id.get(id).map(String::as_str))
                .or(destination);
            resolved.and_then(|dest| inner.durable.get(dest).cloned())
        };
        match callback {
            Some(callback) => {
                callback(normalize_payload(body));
                true
            }
            None => false,
        }
    }
}

/// Handle to one live subscription, returned by the connector.
///
/// Holds the connector weakly so a forgotten handle cannot keep the whole
/// transport alive.
pub struct SubscriptionHandle {
    connector: Weak<Connector>,
    destination: String,
    id: String,
    active: AtomicBool,
}

impl SubscriptionHandle {
    pub(crate) fn new(connector: Weak<Connector>, destination: &str, id: String) -> Self {
        Self {
            connector,
            destination: destination.to_string(),
            id,
            active: AtomicBool::new(true),
        }
    }

    pub fn destination(&self) -> &str {
        &self.destination
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Cancel this subscription, durably. Idempotent, scoped to its own
    /// destination.
    pub fn unsubscribe(&self) {
        if !self.active.swap(false, Ordering::SeqCst) {
            return;
        }
        match self.connector.upgrade() {
            Some(connector) => connector.drop_subscription(&self.destination, &self.id),
            None => debug!("Unsubscribe after connector shutdown, nothing to do"),
        }
    }
}
