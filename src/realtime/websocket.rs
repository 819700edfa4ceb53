//! JSON-over-websocket connection adapter.
//!
//! Each text frame received from the hub is parsed as JSON and raised as a
//! message notification. The adapter does not reconnect on its own: when the
//! socket ends it raises `closed` once and leaves recovery to the client.

use std::sync::{Mutex, PoisonError};

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use secrecy::{ExposeSecret, SecretString};
use tokio::net::TcpStream;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::realtime::adapter::{AdapterError, ConnectionAdapter, NotificationSink};
use crate::realtime::options::RealtimeOptions;

/// Header carrying the API key on the websocket upgrade request.
pub const API_KEY_HEADER: &str = "x-api-key";

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Production adapter backed by `tokio-tungstenite`.
#[derive(Default)]
pub struct WebSocketAdapter {
    api_key: Option<SecretString>,
    sink: Mutex<Option<NotificationSink>>,
    reader: Mutex<Option<JoinHandle<()>>>,
}

impl WebSocketAdapter {
    /// Builds an adapter that connects without an API key.
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds an adapter that authenticates with the configured API key.
    pub fn from_options(options: &RealtimeOptions) -> Self {
        Self {
            api_key: options.api_key.clone(),
            sink: Mutex::new(None),
            reader: Mutex::new(None),
        }
    }

    /// Sets the API key sent in the `x-api-key` header.
    pub fn with_api_key(mut self, api_key: SecretString) -> Self {
        self.api_key = Some(api_key);
        self
    }

    fn sink(&self) -> Option<NotificationSink> {
        self.sink
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn replace_reader(&self, reader: Option<JoinHandle<()>>) {
        let previous = std::mem::replace(
            &mut *self.reader.lock().unwrap_or_else(PoisonError::into_inner),
            reader,
        );
        if let Some(previous) = previous {
            previous.abort();
        }
    }
}

impl std::fmt::Debug for WebSocketAdapter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WebSocketAdapter")
            .field("api_key", &self.api_key.as_ref().map(|_| "<redacted>"))
            .finish_non_exhaustive()
    }
}

impl Drop for WebSocketAdapter {
    fn drop(&mut self) {
        self.replace_reader(None);
    }
}

#[async_trait]
impl ConnectionAdapter for WebSocketAdapter {
    fn register(&self, sink: NotificationSink) {
        *self.sink.lock().unwrap_or_else(PoisonError::into_inner) = Some(sink);
    }

    async fn connect(&self, url: &str, cancel: CancellationToken) -> Result<(), AdapterError> {
        self.replace_reader(None);

        let mut request = websocket_url(url).into_client_request()?;
        if let Some(api_key) = self.api_key.as_ref() {
            let api_key_header = api_key.expose_secret().parse()?;
            request.headers_mut().insert(API_KEY_HEADER, api_key_header);
        }

        let (socket, _) = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(AdapterError::Cancelled),
            connected = connect_async(request) => connected?,
        };

        let Some(sink) = self.sink() else {
            return Err(AdapterError::Connect(
                "adapter has no registered notification sink".to_string(),
            ));
        };

        debug!(event = "websocket_connected", url);
        let reader = tokio::spawn(read_frames(socket, sink, cancel));
        self.replace_reader(Some(reader));
        Ok(())
    }
}

/// Maps `http`/`https` URLs onto `ws`/`wss`; other URLs are returned as-is.
pub fn websocket_url(url: &str) -> String {
    let url = url.trim();
    if let Some(rest) = url.strip_prefix("https://") {
        format!("wss://{rest}")
    } else if let Some(rest) = url.strip_prefix("http://") {
        format!("ws://{rest}")
    } else {
        url.to_string()
    }
}

async fn read_frames(mut socket: Socket, sink: NotificationSink, cancel: CancellationToken) {
    let reason = loop {
        let frame = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                let _ = socket.close(None).await;
                debug!(event = "websocket_reader_cancelled");
                return;
            }
            frame = socket.next() => frame,
        };

        match frame {
            Some(Ok(Message::Text(text))) => match serde_json::from_str(&text) {
                Ok(payload) => sink.message_received(payload).await,
                Err(err) => {
                    warn!(event = "websocket_frame_skipped", error = %err);
                }
            },
            Some(Ok(Message::Ping(payload))) => {
                if let Err(err) = socket.send(Message::Pong(payload)).await {
                    break Some(err.to_string());
                }
            }
            Some(Ok(Message::Pong(_))) => {}
            Some(Ok(Message::Close(frame))) => {
                break frame
                    .map(|frame| frame.reason.to_string())
                    .filter(|reason| !reason.is_empty());
            }
            Some(Ok(_)) => {
                debug!(event = "websocket_frame_skipped", reason = "non_text_frame");
            }
            Some(Err(err)) => break Some(err.to_string()),
            None => break Some("websocket stream ended".to_string()),
        }
    };

    debug!(
        event = "websocket_closed",
        reason = reason.as_deref().unwrap_or("none")
    );
    sink.closed(reason).await;
}
