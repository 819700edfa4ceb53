//! Dispatch gateway onto the context that owns observable state.
//!
//! Desktop hosts route every state mutation and consumer callback through a
//! single context (usually the UI thread). [`ThreadDispatcher`] provides that
//! context as a dedicated OS thread; [`InlineDispatcher`] runs jobs on the
//! caller for hosts that already serialize access.

use std::panic::{self, AssertUnwindSafe};
use std::thread::{self, ThreadId};

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error};

/// Unit of work executed on the dispatch context.
pub type DispatchJob = Box<dyn FnOnce() + Send + 'static>;

/// Errors produced while handing work to a dispatch context.
#[derive(Clone, Copy, Debug, Error, PartialEq, Eq)]
pub enum DispatchError {
    /// The dispatch context has shut down and no longer accepts jobs.
    #[error("dispatch context is closed")]
    Closed,
}

/// Runs callbacks on the context designated safe for mutating shared state.
#[async_trait]
pub trait Dispatcher: Send + Sync + 'static {
    /// Returns `true` when the caller is not already on the dispatch context.
    fn is_dispatch_required(&self) -> bool;

    /// Runs `job` on the dispatch context and resolves once it has finished.
    async fn invoke(&self, job: DispatchJob) -> Result<(), DispatchError>;
}

/// Dispatcher that runs every job on the calling thread.
///
/// The host is responsible for never raising adapter notifications from two
/// contexts at once.
#[derive(Clone, Copy, Debug, Default)]
pub struct InlineDispatcher;

#[async_trait]
impl Dispatcher for InlineDispatcher {
    fn is_dispatch_required(&self) -> bool {
        false
    }

    async fn invoke(&self, job: DispatchJob) -> Result<(), DispatchError> {
        job();
        Ok(())
    }
}

type Envelope = (DispatchJob, oneshot::Sender<()>);

/// Dispatcher backed by one dedicated thread that runs jobs in FIFO order.
///
/// The thread exits once the dispatcher is dropped and its queue drains.
#[derive(Debug)]
pub struct ThreadDispatcher {
    tx: mpsc::UnboundedSender<Envelope>,
    thread_id: ThreadId,
}

impl ThreadDispatcher {
    /// Spawns the dispatch thread with the given name.
    pub fn spawn(name: impl Into<String>) -> std::io::Result<Self> {
        let (tx, mut rx) = mpsc::unbounded_channel::<Envelope>();
        let handle = thread::Builder::new().name(name.into()).spawn(move || {
            while let Some((job, done)) = rx.blocking_recv() {
                if panic::catch_unwind(AssertUnwindSafe(job)).is_err() {
                    error!(event = "dispatch_job_panicked");
                }
                let _ = done.send(());
            }
            debug!(event = "dispatch_thread_stopped");
        })?;

        Ok(Self {
            tx,
            thread_id: handle.thread().id(),
        })
    }

    /// Identifier of the dispatch thread.
    pub fn thread_id(&self) -> ThreadId {
        self.thread_id
    }
}

#[async_trait]
impl Dispatcher for ThreadDispatcher {
    fn is_dispatch_required(&self) -> bool {
        thread::current().id() != self.thread_id
    }

    async fn invoke(&self, job: DispatchJob) -> Result<(), DispatchError> {
        // Queuing from the dispatch thread itself would wait on its own queue.
        if !self.is_dispatch_required() {
            job();
            return Ok(());
        }

        let (done_tx, done_rx) = oneshot::channel();
        self.tx
            .send((job, done_tx))
            .map_err(|_| DispatchError::Closed)?;
        done_rx.await.map_err(|_| DispatchError::Closed)
    }
}
