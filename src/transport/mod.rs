//! STOMP-over-WebSocket transport: frame codec, reconnect policy and the
//! connection lifecycle.

pub mod backoff;
pub mod connector;
pub mod stomp;

pub use backoff::ReconnectPolicy;
pub use connector::{
    ConnectionState, Connector, ConnectorConfig, SubscribeError, TransportError,
};
