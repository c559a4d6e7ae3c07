//! Serial command queue
//!
//! A single tokio task owns the engine and runs jobs one after another in
//! submission order. Nothing else ever touches the engine, so there is no
//! lock around it.

use crate::error::{SessionError, SessionResult};
use std::future::Future;
use std::pin::Pin;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, warn, Instrument};

/// How long `close` waits for the worker to drain
const DRAIN_TIMEOUT: Duration = Duration::from_secs(10);

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Unit of work run against the engine
pub type Job<E> = Box<dyn for<'a> FnOnce(&'a mut E) -> BoxFuture<'a, ()> + Send>;

/// Single-worker FIFO queue owning a value of type `E`
#[derive(Debug)]
pub struct CommandQueue<E> {
    tx: Option<mpsc::UnboundedSender<Job<E>>>,
    worker: Option<JoinHandle<()>>,
}

impl<E: Send + 'static> CommandQueue<E> {
    /// Move `engine` into a new worker task on the current tokio runtime
    pub fn spawn(engine: E, label: &str) -> SessionResult<Self> {
        let runtime = tokio::runtime::Handle::try_current().map_err(|_| SessionError::NoRuntime)?;
        let (tx, mut rx) = mpsc::unbounded_channel::<Job<E>>();
        let span = tracing::debug_span!("command_queue", session = %label);

        let worker = runtime.spawn(
            async move {
                let mut engine = engine;
                let mut executed = 0u64;
                while let Some(job) = rx.recv().await {
                    job(&mut engine).await;
                    executed += 1;
                }
                debug!(executed, "Command queue drained, releasing engine");
            }
            .instrument(span),
        );

        Ok(Self {
            tx: Some(tx),
            worker: Some(worker),
        })
    }

    /// Schedule `job` after everything enqueued so far. Never blocks.
    pub fn enqueue<F>(&self, job: F) -> SessionResult<()>
    where
        F: for<'a> FnOnce(&'a mut E) -> BoxFuture<'a, ()> + Send + 'static,
    {
        let tx = self.tx.as_ref().ok_or(SessionError::QueueClosed)?;
        tx.send(Box::new(job)).map_err(|_| SessionError::QueueClosed)
    }

    /// Resolve once every job enqueued before this call has finished
    pub async fn await_idle(&self) -> SessionResult<()> {
        let (done_tx, done_rx) = oneshot::channel();
        self.enqueue(move |_engine| {
            Box::pin(async move {
                let _ = done_tx.send(());
            })
        })?;
        done_rx.await.map_err(|_| SessionError::QueueClosed)
    }

    pub fn is_closed(&self) -> bool {
        self.tx.as_ref().map_or(true, |tx| tx.is_closed())
    }

    /// Stop accepting jobs and wait for the worker to finish the backlog
    pub async fn close(&mut self) {
        self.tx.take();
        if let Some(worker) = self.worker.take() {
            match tokio::time::timeout(DRAIN_TIMEOUT, worker).await {
                Ok(Ok(())) => debug!("Command queue worker finished"),
                Ok(Err(e)) if !e.is_cancelled() => warn!("Command queue worker failed: {}", e),
                Err(_) => warn!("Command queue worker did not drain in time"),
                _ => {}
            }
        }
    }
}
