//! Time source and cancellable delay used by the connect loop.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;
use tokio_util::sync::CancellationToken;

/// Returned by [`Clock::delay`] when the token fired before the delay elapsed.
#[derive(Clone, Copy, Debug, Error, PartialEq, Eq)]
#[error("delay cancelled")]
pub struct Cancelled;

/// Supplies the current time and an asynchronous, cancellable wait.
#[async_trait]
pub trait Clock: Send + Sync + 'static {
    /// Current wall-clock time in UTC.
    fn now(&self) -> DateTime<Utc>;

    /// Waits for `duration` or until `cancel` fires, whichever comes first.
    async fn delay(&self, duration: Duration, cancel: &CancellationToken) -> Result<(), Cancelled>;
}

/// Production clock backed by the system time and the tokio timer.
#[derive(Clone, Copy, Debug, Default)]
pub struct SystemClock;

#[async_trait]
impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }

    async fn delay(&self, duration: Duration, cancel: &CancellationToken) -> Result<(), Cancelled> {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(Cancelled),
            _ = tokio::time::sleep(duration) => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio_util::sync::CancellationToken;

    use super::{Cancelled, Clock, SystemClock};

    #[test]
    fn delay_completes_when_not_cancelled() {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_time()
            .build()
            .expect("runtime");

        runtime.block_on(async {
            let token = CancellationToken::new();
            let result = SystemClock.delay(Duration::from_millis(1), &token).await;
            assert_eq!(result, Ok(()));
        });
    }

    #[test]
    fn cancelled_token_aborts_long_delay() {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_time()
            .build()
            .expect("runtime");

        runtime.block_on(async {
            let token = CancellationToken::new();
            let canceller = token.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(5)).await;
                canceller.cancel();
            });

            let result = tokio::time::timeout(
                Duration::from_secs(2),
                SystemClock.delay(Duration::from_secs(3600), &token),
            )
            .await
            .expect("cancellation should end the delay promptly");
            assert_eq!(result, Err(Cancelled));
        });
    }
}
