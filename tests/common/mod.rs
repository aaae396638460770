//! Common test infrastructure
//!
//! This module provides everything the end-to-end tests need: the mock
//! backend broker, token builders and small waiting/recording helpers.
//! Tests should only import from this module, not from internal submodules.
#![allow(dead_code)]

mod broker;

pub use broker::TestBroker;

use std::sync::Arc;
use std::time::Duration;

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use serde_json::Value;

use bankline_client::subscriptions::MessageCallback;
use bankline_client::transport::{ConnectorConfig, ReconnectPolicy};

/// Build an unsigned JWT-shaped token with the given identity and role.
pub fn token_for(user_id: &str, role: &str) -> String {
    let header = URL_SAFE_NO_PAD.encode(br#"{"alg":"HS256","typ":"JWT"}"#);
    let payload = serde_json::json!({"userId": user_id, "role": role});
    let body = URL_SAFE_NO_PAD.encode(payload.to_string().as_bytes());
    format!("{}.{}.testsignature", header, body)
}

pub fn customer_token() -> String {
    token_for("42", "customer")
}

/// Connector config pointed at the broker, with timings shrunk so failure
/// paths resolve in milliseconds instead of seconds.
pub fn fast_connector_config(broker: &TestBroker) -> ConnectorConfig {
    ConnectorConfig {
        ws_url: broker.ws_url(),
        connect_timeout: Duration::from_secs(2),
        subscribe_timeout: Duration::from_secs(2),
        reconnect: ReconnectPolicy {
            max_retries: 3,
            initial_delay_ms: 50,
            max_delay_ms: 200,
        },
        disconnect_flag_reset: Duration::from_millis(300),
        ..ConnectorConfig::default()
    }
}

/// Callback that forwards every payload to a channel for assertions.
pub fn recording_callback() -> (
    MessageCallback,
    tokio::sync::mpsc::UnboundedReceiver<Value>,
) {
    let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
    let callback: MessageCallback = Arc::new(move |value| {
        let _ = tx.send(value);
    });
    (callback, rx)
}

/// Poll a condition until it holds, panicking after the timeout.
pub async fn wait_until<F: Fn() -> bool>(description: &str, condition: F) {
    let timeout = Duration::from_secs(5);
    let start = std::time::Instant::now();
    while !condition() {
        if start.elapsed() > timeout {
            panic!("Timed out waiting for: {description}");
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

/// Await the next payload from a recording callback, with a timeout.
pub async fn next_payload(
    rx: &mut tokio::sync::mpsc::UnboundedReceiver<Value>,
) -> Value {
    tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("Timed out waiting for a payload")
        .expect("Payload channel closed")
}
