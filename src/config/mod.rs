mod file_config;

pub use file_config::{FileConfig, NotificationsConfig, TransportConfig};

use anyhow::{bail, Result};
use std::time::Duration;

use crate::transport::{ConnectorConfig, ReconnectPolicy};

/// CLI arguments that can be used for config resolution.
/// This struct mirrors the CLI arguments that can be overridden by TOML config.
#[derive(Debug, Clone, Default)]
pub struct CliConfig {
    pub base_url: Option<String>,
    pub token: Option<String>,
}

#[derive(Debug, Clone)]
pub struct ClientConfig {
    // Core settings
    pub base_url: String,
    pub token: Option<String>,

    // Feature configs (with defaults)
    pub transport: TransportSettings,
    pub notifications: NotificationSettings,
}

#[derive(Debug, Clone)]
pub struct TransportSettings {
    pub heartbeat_ms: u64,
    pub connect_timeout_sec: u64,
    pub subscribe_timeout_sec: u64,
    pub max_retries: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
}

impl Default for TransportSettings {
    fn default() -> Self {
        Self {
            heartbeat_ms: 10_000,
            connect_timeout_sec: 15,
            subscribe_timeout_sec: 10,
            max_retries: 5,
            initial_backoff_ms: 1_000,
            max_backoff_ms: 30_000,
        }
    }
}

#[derive(Debug, Clone)]
pub struct NotificationSettings {
    pub refresh_interval_min: u64,
}

impl Default for NotificationSettings {
    fn default() -> Self {
        Self {
            refresh_interval_min: 14,
        }
    }
}

impl ClientConfig {
    /// Resolve configuration from CLI arguments and optional TOML file config.
    /// TOML values override CLI values where present.
    pub fn resolve(cli: &CliConfig, file_config: Option<FileConfig>) -> Result<Self> {
        let file = file_config.unwrap_or_default();

        // TOML overrides CLI for each field
        let base_url = file
            .base_url
            .or_else(|| cli.base_url.clone())
            .ok_or_else(|| {
                anyhow::anyhow!("base_url must be specified via --base-url or in config file")
            })?;
        if !base_url.starts_with("http://") && !base_url.starts_with("https://") {
            bail!("base_url must start with http:// or https://, got {base_url}");
        }
        let base_url = base_url.trim_end_matches('/').to_string();

        let token = file.token.or_else(|| cli.token.clone());

        // Transport settings - merge file config with defaults
        let transport_file = file.transport.unwrap_or_default();
        let defaults = TransportSettings::default();
        let transport = TransportSettings {
            heartbeat_ms: transport_file.heartbeat_ms.unwrap_or(defaults.heartbeat_ms),
            connect_timeout_sec: transport_file
                .connect_timeout_sec
                .unwrap_or(defaults.connect_timeout_sec),
            subscribe_timeout_sec: transport_file
                .subscribe_timeout_sec
                .unwrap_or(defaults.subscribe_timeout_sec),
            max_retries: transport_file.max_retries.unwrap_or(defaults.max_retries),
            initial_backoff_ms: transport_file
                .initial_backoff_ms
                .unwrap_or(defaults.initial_backoff_ms),
            max_backoff_ms: transport_file
                .max_backoff_ms
                .unwrap_or(defaults.max_backoff_ms),
        };

        let notifications_file = file.notifications.unwrap_or_default();
        let notifications = NotificationSettings {
            refresh_interval_min: notifications_file
                .refresh_interval_min
                .unwrap_or(NotificationSettings::default().refresh_interval_min),
        };

        Ok(Self {
            base_url,
            token,
            transport,
            notifications,
        })
    }

    /// REST endpoint base.
    pub fn api_url(&self) -> &str {
        &self.base_url
    }

    /// WebSocket endpoint derived from the REST base.
    pub fn ws_url(&self) -> String {
        let ws_base = if let Some(rest) = self.base_url.strip_prefix("https://") {
            format!("wss://{rest}")
        } else if let Some(rest) = self.base_url.strip_prefix("http://") {
            format!("ws://{rest}")
        } else {
            self.base_url.clone()
        };
        format!("{ws_base}/ws")
    }

    pub fn connector_config(&self) -> ConnectorConfig {
        ConnectorConfig {
            ws_url: self.ws_url(),
            heartbeat_ms: self.transport.heartbeat_ms,
            connect_timeout: Duration::from_secs(self.transport.connect_timeout_sec),
            subscribe_timeout: Duration::from_secs(self.transport.subscribe_timeout_sec),
            reconnect: ReconnectPolicy {
                max_retries: self.transport.max_retries,
                initial_delay_ms: self.transport.initial_backoff_ms,
                max_delay_ms: self.transport.max_backoff_ms,
            },
            disconnect_flag_reset: Duration::from_secs(1),
        }
    }

    pub fn refresh_interval(&self) -> Duration {
        Duration::from_secs(self.notifications.refresh_interval_min * 60)
    }
}
