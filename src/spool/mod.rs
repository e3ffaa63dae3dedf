//! Delivery pipeline: submission, crash recovery, the background worker,
//! and lifecycle control.
//!
//! The pipeline is an explicit message-passing channel with one dedicated
//! consumer task and any number of producers; no shared mutable state needs
//! locking beyond the channel's own synchronization. Durability comes from
//! record-before-work ordering: a delivery record is persisted before the
//! message is exposed to the worker, so a crash at any point leaves either
//! no trace or a recoverable `in_progress` row.

pub mod recovery;
mod worker;

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::config::Settings;
use crate::ledger::{Ledger, LedgerError, Message};
use crate::transport::Transport;

pub use recovery::RecoveryError;

/// Errors surfaced to [`Spool::submit`] callers.
#[derive(Debug, thiserror::Error)]
pub enum SubmitError {
    /// The delivery record could not be persisted; nothing was enqueued.
    #[error("failed to persist delivery record: {0}")]
    Persistence(#[from] LedgerError),

    /// The worker side of the queue is gone (after [`Spool::stop`]).
    #[error("delivery queue is closed")]
    QueueClosed,
}

/// Errors surfaced from [`Spool::start`].
#[derive(Debug, thiserror::Error)]
pub enum StartError {
    /// The recovery pass failed; the worker was not started.
    #[error(transparent)]
    Recovery(#[from] RecoveryError),

    /// The worker was already started.
    #[error("delivery worker already started")]
    AlreadyStarted,
}

/// Handle for the running worker task.
struct RunningWorker {
    shutdown_tx: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

/// Mutable lifecycle state behind the [`Spool`] facade.
struct Inner {
    /// Consumer end of the queue; taken by [`Spool::start`].
    rx: Option<mpsc::UnboundedReceiver<Message>>,
    worker: Option<RunningWorker>,
}

/// The outbound delivery service.
///
/// Construct with [`Spool::new`], call [`Spool::start`] once to recover
/// in-flight work and launch the worker, then [`Spool::submit`] from any
/// number of tasks. [`Spool::stop`] shuts the worker down cooperatively.
pub struct Spool {
    ledger: Arc<Ledger>,
    settings: Settings,
    tx: mpsc::UnboundedSender<Message>,
    inner: Mutex<Inner>,
}

impl Spool {
    /// Build a spool over an opened ledger.
    ///
    /// The queue is unbounded: submission never blocks on queue capacity,
    /// and backpressure is bounded in practice by the synchronous ledger
    /// insert on every submit.
    pub fn new(ledger: Arc<Ledger>, settings: Settings) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            ledger,
            settings,
            tx,
            inner: Mutex::new(Inner {
                rx: Some(rx),
                worker: None,
            }),
        }
    }

    /// Submit a message for delivery and return its id.
    ///
    /// The delivery record (`in_progress`, zero attempts) is persisted
    /// before the message is enqueued. On persistence failure nothing is
    /// enqueued and the whole submission fails; there is no partial state.
    ///
    /// # Errors
    ///
    /// Returns [`SubmitError::Persistence`] if the ledger insert did not
    /// affect exactly one row, or [`SubmitError::QueueClosed`] after the
    /// worker has shut down.
    pub async fn submit(
        &self,
        recipient: &str,
        subject: &str,
        body: &str,
    ) -> Result<Uuid, SubmitError> {
        let message = Message::new(recipient, subject, body);
        let id = message.id;

        self.ledger.insert_message(&message).await?;
        self.tx
            .send(message)
            .map_err(|_| SubmitError::QueueClosed)?;

        info!(id = %id, recipient, "message submitted");
        Ok(id)
    }

    /// Recover in-flight work from the ledger, then launch the worker.
    ///
    /// Recovery runs to completion before the worker task exists, so no
    /// newly submitted message is processed ahead of a message that was
    /// already in flight at the previous shutdown.
    ///
    /// # Errors
    ///
    /// Returns [`StartError::Recovery`] if the recovery scan fails — the
    /// worker is not started and the call may be retried after a restart —
    /// or [`StartError::AlreadyStarted`] on a second call.
    pub async fn start(&self, transport: Box<dyn Transport>) -> Result<(), StartError> {
        let mut inner = self.inner.lock().await;
        let rx = inner.rx.take().ok_or(StartError::AlreadyStarted)?;

        info!("starting delivery service");
        let recovered = match recovery::recover(&self.ledger, &self.tx).await {
            Ok(count) => count,
            Err(e) => {
                error!(error = %e, "recovery failed, delivery worker not started");
                // Put the receiver back so a later start can retry.
                inner.rx = Some(rx);
                return Err(e.into());
            }
        };
        info!(recovered, "recovery complete");

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let ctx = worker::WorkerContext {
            ledger: Arc::clone(&self.ledger),
            settings: self.settings.clone(),
            transport,
            queue_tx: self.tx.clone(),
        };
        let handle = tokio::spawn(worker::run(ctx, rx, shutdown_rx));

        inner.worker = Some(RunningWorker {
            shutdown_tx,
            handle,
        });
        Ok(())
    }

    /// Signal shutdown and wait for the worker, bounded by `deadline`.
    ///
    /// Returns `true` if the worker exited within the deadline. On timeout
    /// the wait is abandoned, not the worker: the task keeps running until
    /// it notices cancellation at its next suspension point, and an
    /// in-flight transmission still gets its ledger update.
    pub async fn stop(&self, deadline: Duration) -> bool {
        let Some(running) = self.inner.lock().await.worker.take() else {
            return true;
        };

        info!(deadline_ms = u64::try_from(deadline.as_millis()).unwrap_or(u64::MAX), "stopping delivery worker");
        let _ = running.shutdown_tx.send(true);

        match tokio::time::timeout(deadline, running.handle).await {
            Ok(Ok(())) => {
                info!("delivery worker drained");
                true
            }
            Ok(Err(e)) => {
                error!(error = %e, "delivery worker panicked");
                true
            }
            Err(_) => {
                warn!("shutdown deadline exceeded, abandoning wait for delivery worker");
                false
            }
        }
    }
}

impl std::fmt::Debug for Spool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Spool").finish()
    }
}
