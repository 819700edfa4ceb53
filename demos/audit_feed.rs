use std::error::Error;
use std::sync::Arc;

use audit_realtime::dispatch::ThreadDispatcher;
use audit_realtime::realtime::{RealtimeClient, RealtimeOptions, WebSocketAdapter};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

fn main() -> Result<(), Box<dyn Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;

    runtime.block_on(async {
        // SIGNALR__AUDITHUBURL, REALTIME__RETRYSCHEDULEMS and REALTIME__APIKEY
        // override the defaults.
        let options = RealtimeOptions::from_env()?;
        let adapter = Arc::new(WebSocketAdapter::from_options(&options));
        let dispatcher = Arc::new(ThreadDispatcher::spawn("audit-ui")?);
        let client = RealtimeClient::new(options, adapter, dispatcher)?;

        client.on_connection_state_changed(|change| {
            println!(
                "state {:?} -> {:?} last_error={:?} next_retry={:?}",
                change.previous, change.current, change.last_error, change.next_retry_at
            );
        });
        client.on_message_received(|payload| {
            println!("audit event {payload}");
        });

        let shutdown = CancellationToken::new();
        client.start(shutdown.clone());

        tokio::signal::ctrl_c().await?;
        shutdown.cancel();
        client.shutdown().await;

        Ok::<(), Box<dyn Error>>(())
    })
}
