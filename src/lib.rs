//! Bankline Client Library
//!
//! Client for the Bankline backend's real-time notification channel: a
//! STOMP-over-WebSocket transport with automatic reconnection, a durable
//! subscription registry, the notification REST API and a state container
//! gluing them together.

pub mod config;
pub mod notifications;
pub mod subscriptions;
pub mod token;
pub mod transport;

// Re-export commonly used types for convenience
pub use config::{ClientConfig, CliConfig, FileConfig};
pub use notifications::{FeedEvent, FeedState, Notification, NotificationCenter, NotificationsApi};
pub use subscriptions::{MessageCallback, SubscriptionHandle};
pub use token::{decode_claims, StaticTokenSource, TokenClaims, TokenSource, UserRole};
pub use transport::{ConnectionState, Connector, ConnectorConfig, ReconnectPolicy};
