//! Realtime audit subscription: adapter interface, client and transports.

/// Connection adapter capability interface and notification sink.
pub mod adapter;
/// Connect/retry loop, connection state and consumer events.
pub mod client;
/// Configuration resolution for the realtime client.
pub mod options;
/// Websocket transport adapter.
pub mod websocket;

pub use adapter::{AdapterError, AdapterEvent, AuditPayload, ConnectionAdapter, NotificationSink};
pub use client::{
    ConnectionSnapshot, ConnectionState, ConnectionStateChange, RealtimeClient,
    RealtimeClientError,
};
pub use options::RealtimeOptions;
pub use websocket::WebSocketAdapter;
