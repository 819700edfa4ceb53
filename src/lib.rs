//! Realtime audit-event subscription client.
//!
//! The crate is organized by concern:
//! - `realtime`: the client, its adapter interface and the websocket transport.
//! - `dispatch`: the gateway onto the context that owns observable state.
//! - `clock`: time source and cancellable delays.
//! - `retry`: the backoff schedule used between connect attempts.

/// Time source and cancellable delay.
pub mod clock;
/// Dispatch gateway implementations.
pub mod dispatch;
/// Realtime client, connection adapters and options.
pub mod realtime;
/// Retry schedule used by the connect loop.
pub mod retry;

pub use tokio_util::sync::CancellationToken;
