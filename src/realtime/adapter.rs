//! Capability interface over the concrete realtime transport.

use std::sync::{Arc, Weak};

use async_trait::async_trait;
use thiserror::Error;
use tokio_tungstenite::tungstenite::http::header::InvalidHeaderValue;
use tokio_tungstenite::tungstenite::Error as WsError;
use tokio_util::sync::CancellationToken;

/// Opaque event payload delivered by the remote source.
pub type AuditPayload = serde_json::Value;

/// Notification raised by a [`ConnectionAdapter`].
#[derive(Clone, Debug, PartialEq)]
pub enum AdapterEvent {
    /// An event was pushed by the remote source.
    MessageReceived(AuditPayload),
    /// The connection ended without being asked to.
    Closed(Option<String>),
    /// The transport lost the connection and is recovering on its own.
    Reconnecting(Option<String>),
    /// The transport recovered the connection, optionally under a new id.
    Reconnected(Option<String>),
}

/// Transport used by the realtime client.
///
/// Implementations receive a [`NotificationSink`] once, at client
/// construction, and report every notification through it.
#[async_trait]
pub trait ConnectionAdapter: Send + Sync + 'static {
    /// Stores the sink that notifications must be raised through.
    fn register(&self, sink: NotificationSink);

    /// Establishes a connection to `url`, honouring `cancel`.
    async fn connect(&self, url: &str, cancel: CancellationToken) -> Result<(), AdapterError>;
}

#[async_trait]
pub(crate) trait NotificationHandler: Send + Sync + 'static {
    async fn handle(self: Arc<Self>, event: AdapterEvent);
}

/// Handle an adapter uses to raise notifications into the client.
///
/// Every `notify` future resolves only after the client has processed the
/// event on its dispatch context. Once the client is dropped, notifications
/// are discarded.
#[derive(Clone)]
pub struct NotificationSink {
    handler: Weak<dyn NotificationHandler>,
}

impl NotificationSink {
    pub(crate) fn new(handler: Weak<dyn NotificationHandler>) -> Self {
        Self { handler }
    }

    /// Raises `event` and waits for it to be processed.
    pub async fn notify(&self, event: AdapterEvent) {
        let Some(handler) = self.handler.upgrade() else {
            return;
        };
        handler.handle(event).await;
    }

    /// Relays a payload pushed by the remote source.
    pub async fn message_received(&self, payload: AuditPayload) {
        self.notify(AdapterEvent::MessageReceived(payload)).await;
    }

    /// Reports that the connection ended and will not recover on its own.
    pub async fn closed(&self, error: Option<String>) {
        self.notify(AdapterEvent::Closed(error)).await;
    }

    /// Reports that the transport lost the connection and is recovering.
    pub async fn reconnecting(&self, error: Option<String>) {
        self.notify(AdapterEvent::Reconnecting(error)).await;
    }

    /// Reports that the transport recovered the connection.
    pub async fn reconnected(&self, connection_id: Option<String>) {
        self.notify(AdapterEvent::Reconnected(connection_id)).await;
    }

    /// Returns `false` once the owning client has been dropped.
    pub fn is_attached(&self) -> bool {
        self.handler.strong_count() > 0
    }
}

impl std::fmt::Debug for NotificationSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NotificationSink")
            .field("attached", &self.is_attached())
            .finish()
    }
}

/// Errors produced by connection adapters.
#[derive(Debug, Error)]
pub enum AdapterError {
    /// The connect attempt was abandoned because cancellation was requested.
    #[error("connect cancelled")]
    Cancelled,

    /// Websocket transport error.
    #[error("websocket error: {0}")]
    WebSocket(#[from] WsError),

    /// API key could not be converted to a valid HTTP header value.
    #[error("invalid api-key header: {0}")]
    InvalidApiKeyHeader(#[from] InvalidHeaderValue),

    /// Transport-specific connect failure.
    #[error("connect failed: {0}")]
    Connect(String),
}
