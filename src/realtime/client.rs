//! Realtime audit client.
//!
//! The client owns one background connect loop. The loop waits according to
//! the retry schedule, asks the adapter to connect, and once connected parks
//! until the adapter reports an unsolicited close, at which point a fresh
//! cycle starts from the first schedule entry. Every change to observable
//! state and every consumer callback runs through the dispatch gateway.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{
    Arc, Mutex, MutexGuard, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard, Weak,
};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::clock::{Clock, SystemClock};
use crate::dispatch::Dispatcher;
use crate::realtime::adapter::{
    AdapterEvent, AuditPayload, ConnectionAdapter, NotificationHandler, NotificationSink,
};
use crate::realtime::options::{validate_hub_url, RealtimeOptions};
use crate::retry::{RetrySchedule, RetryScheduleError};

const SHUTDOWN_GRACE: Duration = Duration::from_secs(1);

/// Connection lifecycle as observed by consumers.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    /// The loop has not been started.
    #[default]
    Disconnected,
    /// An attempt is scheduled or in flight, or the transport is recovering.
    Connecting,
    /// The adapter confirmed a live connection.
    Connected,
}

/// Payload of the connection-state-changed event.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct ConnectionStateChange {
    /// State before the transition.
    pub previous: ConnectionState,
    /// State after the transition.
    pub current: ConnectionState,
    /// Most recent failure at the time of the transition.
    pub last_error: Option<String>,
    /// Scheduled time of the next attempt at the time of the transition.
    pub next_retry_at: Option<DateTime<Utc>>,
}

/// Consistent view of the observable connection state.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct ConnectionSnapshot {
    /// Current connection state.
    pub state: ConnectionState,
    /// Most recent failure, cleared on a successful connect.
    pub last_error: Option<String>,
    /// Time of the next scheduled attempt while the loop is waiting.
    pub next_retry_utc: Option<DateTime<Utc>>,
}

/// Errors returned while constructing or configuring a [`RealtimeClient`].
#[derive(Debug, Error)]
pub enum RealtimeClientError {
    /// The retry schedule was empty or malformed.
    #[error("invalid retry schedule: {0}")]
    Schedule(#[from] RetryScheduleError),

    /// A configuration value was unusable.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

type MessageHandler = Arc<dyn Fn(&AuditPayload) + Send + Sync>;
type StateChangedHandler = Arc<dyn Fn(&ConnectionStateChange) + Send + Sync>;

#[derive(Default)]
struct Handlers {
    message_received: Vec<MessageHandler>,
    state_changed: Vec<StateChangedHandler>,
}

#[derive(Debug, Default)]
struct Session {
    snapshot: ConnectionSnapshot,
    // Set while a connection obtained by the loop may still be open.
    live: bool,
    // Set once the live connection was reported as Connected.
    established: bool,
}

struct Worker {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

struct ClientCore {
    hub_url: String,
    schedule: RetrySchedule,
    adapter: Arc<dyn ConnectionAdapter>,
    clock: Arc<dyn Clock>,
    dispatcher: Arc<dyn Dispatcher>,
    running: AtomicBool,
    session: RwLock<Session>,
    handlers: RwLock<Handlers>,
    closed_tx: mpsc::UnboundedSender<()>,
    closed_rx: Mutex<Option<mpsc::UnboundedReceiver<()>>>,
    worker: Mutex<Option<Worker>>,
}

/// Long-lived subscription to the remote audit event source.
///
/// Construct one per application session and keep it owned by the host;
/// dropping the client cancels its loop.
pub struct RealtimeClient {
    core: Arc<ClientCore>,
}

impl RealtimeClient {
    /// Creates a client that uses the system clock.
    pub fn new(
        options: RealtimeOptions,
        adapter: Arc<dyn ConnectionAdapter>,
        dispatcher: Arc<dyn Dispatcher>,
    ) -> Result<Self, RealtimeClientError> {
        Self::with_clock(options, adapter, dispatcher, Arc::new(SystemClock))
    }

    /// Creates a client with an explicit clock.
    ///
    /// The adapter is registered immediately; no connection is attempted
    /// until [`RealtimeClient::start`].
    pub fn with_clock(
        options: RealtimeOptions,
        adapter: Arc<dyn ConnectionAdapter>,
        dispatcher: Arc<dyn Dispatcher>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, RealtimeClientError> {
        validate_hub_url(&options.hub_url)?;

        let (closed_tx, closed_rx) = mpsc::unbounded_channel();
        let core = Arc::new(ClientCore {
            hub_url: options.hub_url,
            schedule: options.retry_schedule,
            adapter,
            clock,
            dispatcher,
            running: AtomicBool::new(false),
            session: RwLock::new(Session::default()),
            handlers: RwLock::new(Handlers::default()),
            closed_tx,
            closed_rx: Mutex::new(Some(closed_rx)),
            worker: Mutex::new(None),
        });

        let weak = Arc::downgrade(&core);
        let handler: Weak<dyn NotificationHandler> = weak;
        core.adapter.register(NotificationSink::new(handler));

        Ok(Self { core })
    }

    /// Starts the connect loop on the current tokio runtime.
    ///
    /// Only the first call claims the loop and returns `true`; concurrent
    /// and later calls are no-ops. `cancel` stops the loop cooperatively.
    pub fn start(&self, cancel: CancellationToken) -> bool {
        if self
            .core
            .running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            debug!(event = "realtime_start_ignored", reason = "already_started");
            return false;
        }

        let runtime = match tokio::runtime::Handle::try_current() {
            Ok(runtime) => runtime,
            Err(err) => {
                warn!(event = "realtime_start_failed", error = %err);
                self.core.running.store(false, Ordering::Release);
                return false;
            }
        };

        let mut worker = lock(&self.core.worker);
        let token = cancel.child_token();
        let core = Arc::clone(&self.core);
        let loop_token = token.clone();
        let handle = runtime.spawn(async move { core.run(loop_token).await });
        *worker = Some(Worker {
            cancel: token,
            handle,
        });
        true
    }

    /// Cancels the loop and waits briefly for it to finish.
    ///
    /// The last observed state is left unchanged. The client cannot be
    /// started again afterwards.
    pub async fn shutdown(&self) {
        let worker = lock(&self.core.worker).take();
        let Some(Worker { cancel, handle }) = worker else {
            return;
        };

        cancel.cancel();
        match tokio::time::timeout(SHUTDOWN_GRACE, handle).await {
            Ok(Ok(())) => debug!(event = "realtime_shutdown_complete"),
            Ok(Err(err)) => warn!(event = "realtime_loop_join_failed", error = %err),
            Err(_) => warn!(
                event = "realtime_shutdown_timed_out",
                grace_ms = SHUTDOWN_GRACE.as_millis() as u64
            ),
        }
    }

    /// Returns `true` once a loop has been claimed by [`RealtimeClient::start`].
    pub fn is_started(&self) -> bool {
        self.core.running.load(Ordering::Acquire)
    }

    /// Current connection state.
    pub fn connection_state(&self) -> ConnectionState {
        read(&self.core.session).snapshot.state
    }

    /// Most recent failure description, cleared on a successful connect.
    pub fn last_error(&self) -> Option<String> {
        read(&self.core.session).snapshot.last_error.clone()
    }

    /// Time of the next scheduled attempt, or `None` when connected or idle.
    pub fn next_retry_utc(&self) -> Option<DateTime<Utc>> {
        read(&self.core.session).snapshot.next_retry_utc
    }

    /// Reads state, last error and next retry under a single lock.
    pub fn snapshot(&self) -> ConnectionSnapshot {
        read(&self.core.session).snapshot.clone()
    }

    /// Resolved hub URL passed to the adapter on every attempt.
    pub fn hub_url(&self) -> &str {
        &self.core.hub_url
    }

    /// Registers a callback for events pushed by the remote source.
    ///
    /// Callbacks run on the dispatch context, one at a time.
    pub fn on_message_received<F>(&self, handler: F)
    where
        F: Fn(&AuditPayload) + Send + Sync + 'static,
    {
        write(&self.core.handlers)
            .message_received
            .push(Arc::new(handler));
    }

    /// Registers a callback for connection state transitions.
    ///
    /// Callbacks run on the dispatch context, one at a time.
    pub fn on_connection_state_changed<F>(&self, handler: F)
    where
        F: Fn(&ConnectionStateChange) + Send + Sync + 'static,
    {
        write(&self.core.handlers)
            .state_changed
            .push(Arc::new(handler));
    }
}

impl Drop for RealtimeClient {
    fn drop(&mut self) {
        if let Some(worker) = lock(&self.core.worker).take() {
            worker.cancel.cancel();
        }
    }
}

impl std::fmt::Debug for RealtimeClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RealtimeClient")
            .field("hub_url", &self.core.hub_url)
            .field("started", &self.is_started())
            .field("snapshot", &self.snapshot())
            .finish()
    }
}

impl ClientCore {
    async fn run(self: Arc<Self>, cancel: CancellationToken) {
        let closed_rx = lock(&self.closed_rx).take();
        let Some(mut closed_rx) = closed_rx else {
            warn!(event = "realtime_loop_already_consumed");
            return;
        };

        info!(event = "realtime_loop_started", hub_url = %self.hub_url);
        while self.connect_cycle(&cancel, &mut closed_rx).await {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                _ = closed_rx.recv() => {
                    debug!(event = "realtime_cycle_restart");
                }
            }
        }
        info!(event = "realtime_loop_stopped");
    }

    /// Runs attempts until one succeeds. Returns `false` when cancelled.
    async fn connect_cycle(
        self: &Arc<Self>,
        cancel: &CancellationToken,
        closed_rx: &mut mpsc::UnboundedReceiver<()>,
    ) -> bool {
        let mut attempt = 0usize;
        let mut delay = self.schedule.delay_for_attempt(attempt);
        let next_retry_at = self.retry_deadline(delay);
        self.dispatch(move |core| {
            write(&core.session).snapshot.next_retry_utc = next_retry_at;
            core.transition(ConnectionState::Connecting);
        })
        .await;

        loop {
            if !delay.is_zero() {
                debug!(
                    event = "realtime_connect_scheduled",
                    attempt,
                    delay_ms = delay.as_millis() as u64
                );
                if self.clock.delay(delay, cancel).await.is_err() {
                    return false;
                }
            }
            if cancel.is_cancelled() {
                return false;
            }

            // Close signals from an earlier connection do not apply to this one.
            while closed_rx.try_recv().is_ok() {}
            self.dispatch(|core| {
                let mut session = write(&core.session);
                session.snapshot.next_retry_utc = None;
                session.live = true;
                session.established = false;
            })
            .await;

            let result = tokio::select! {
                biased;
                _ = cancel.cancelled() => return false,
                result = self.adapter.connect(&self.hub_url, cancel.clone()) => result,
            };

            match result {
                Ok(()) => {
                    info!(event = "realtime_connected", attempt, hub_url = %self.hub_url);
                    self.dispatch(|core| {
                        {
                            let mut session = write(&core.session);
                            // Already closed; the queued close signal restarts the cycle.
                            if !session.live {
                                debug!(event = "realtime_connection_lost_before_ready");
                                return;
                            }
                            session.established = true;
                            session.snapshot.last_error = None;
                            session.snapshot.next_retry_utc = None;
                        }
                        core.transition(ConnectionState::Connected);
                    })
                    .await;
                    return true;
                }
                Err(_) if cancel.is_cancelled() => return false,
                Err(err) => {
                    attempt = attempt.saturating_add(1);
                    delay = self.schedule.delay_for_attempt(attempt);
                    let next_retry_at = self.retry_deadline(delay);
                    let message = err.to_string();
                    warn!(
                        event = "realtime_connect_failed",
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %message
                    );
                    self.dispatch(move |core| {
                        {
                            let mut session = write(&core.session);
                            session.live = false;
                            session.established = false;
                            session.snapshot.last_error = Some(message);
                            session.snapshot.next_retry_utc = next_retry_at;
                        }
                        core.transition(ConnectionState::Connecting);
                    })
                    .await;
                }
            }
        }
    }

    fn retry_deadline(&self, delay: Duration) -> Option<DateTime<Utc>> {
        if delay.is_zero() {
            return None;
        }
        let delay = chrono::Duration::from_std(delay).ok()?;
        self.clock.now().checked_add_signed(delay)
    }

    /// Runs `job` on the dispatch context, inline when already there.
    async fn dispatch<F>(self: &Arc<Self>, job: F)
    where
        F: FnOnce(&ClientCore) + Send + 'static,
    {
        if !self.dispatcher.is_dispatch_required() {
            job(self.as_ref());
            return;
        }

        let core = Arc::clone(self);
        if let Err(err) = self
            .dispatcher
            .invoke(Box::new(move || job(core.as_ref())))
            .await
        {
            warn!(event = "realtime_dispatch_failed", error = %err);
        }
    }

    // Everything below runs on the dispatch context.

    fn transition(&self, next: ConnectionState) {
        let change = {
            let mut session = write(&self.session);
            let previous = session.snapshot.state;
            if previous == next {
                return;
            }
            session.snapshot.state = next;
            ConnectionStateChange {
                previous,
                current: next,
                last_error: session.snapshot.last_error.clone(),
                next_retry_at: session.snapshot.next_retry_utc,
            }
        };

        info!(
            event = "realtime_state_changed",
            previous = ?change.previous,
            current = ?change.current
        );
        let handlers = read(&self.handlers).state_changed.clone();
        for handler in handlers {
            handler(&change);
        }
    }

    fn relay_message(&self, payload: &AuditPayload) {
        let handlers = read(&self.handlers).message_received.clone();
        for handler in handlers {
            handler(payload);
        }
    }

    fn handle_closed(&self, error: Option<String>) {
        {
            let mut session = write(&self.session);
            if !session.live {
                debug!(event = "realtime_close_ignored", reason = "no_live_connection");
                return;
            }
            session.live = false;
            session.established = false;
            session.snapshot.last_error = error.clone();
        }

        warn!(
            event = "realtime_connection_closed",
            error = error.as_deref().unwrap_or("none")
        );
        self.transition(ConnectionState::Connecting);
        let _ = self.closed_tx.send(());
    }

    fn handle_reconnecting(&self, error: Option<String>) {
        {
            let mut session = write(&self.session);
            if !(session.live && session.established) {
                debug!(
                    event = "realtime_reconnecting_ignored",
                    reason = "no_established_connection"
                );
                return;
            }
            session.snapshot.last_error = error.clone();
        }

        debug!(
            event = "realtime_reconnecting",
            error = error.as_deref().unwrap_or("none")
        );
        self.transition(ConnectionState::Connecting);
    }

    fn handle_reconnected(&self, connection_id: Option<String>) {
        {
            let mut session = write(&self.session);
            if !(session.live && session.established) {
                debug!(
                    event = "realtime_reconnected_ignored",
                    reason = "no_established_connection"
                );
                return;
            }
            session.snapshot.last_error = None;
            session.snapshot.next_retry_utc = None;
        }

        info!(
            event = "realtime_reconnected",
            connection_id = connection_id.as_deref().unwrap_or("none")
        );
        self.transition(ConnectionState::Connected);
    }
}

#[async_trait]
impl NotificationHandler for ClientCore {
    async fn handle(self: Arc<Self>, event: AdapterEvent) {
        match event {
            AdapterEvent::MessageReceived(payload) => {
                self.dispatch(move |core| core.relay_message(&payload)).await
            }
            AdapterEvent::Closed(error) => {
                self.dispatch(move |core| core.handle_closed(error)).await
            }
            AdapterEvent::Reconnecting(error) => {
                self.dispatch(move |core| core.handle_reconnecting(error))
                    .await
            }
            AdapterEvent::Reconnected(connection_id) => {
                self.dispatch(move |core| core.handle_reconnected(connection_id))
                    .await
            }
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn read<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(PoisonError::into_inner)
}

fn write<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(PoisonError::into_inner)
}
