//! The delivery worker: a single long-running task that drains the queue.
//!
//! Per message it runs one transport attempt and records the outcome in the
//! ledger. Failed attempts are re-enqueued until the configured maximum,
//! then the record is soft-deleted. Shutdown is cooperative: the queue
//! receive and the error backoff are raced against the shutdown signal,
//! and the flag is checked between transport steps.

use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

use crate::config::{Settings, SmtpConfig};
use crate::ledger::{Ledger, Message};
use crate::transport::{Transport, TransportError};

use std::sync::Arc;

/// Everything the worker task owns.
pub(super) struct WorkerContext {
    /// Delivery ledger for status transitions.
    pub ledger: Arc<Ledger>,
    /// Live configuration; snapshotted once per attempt.
    pub settings: Settings,
    /// Transport used for every attempt (one connection per attempt).
    pub transport: Box<dyn Transport>,
    /// Producer side of the queue, for retry re-enqueue.
    pub queue_tx: mpsc::UnboundedSender<Message>,
}

/// Result of a single transmission attempt.
enum AttemptOutcome {
    /// The server acknowledged the payload and the session closed cleanly.
    Delivered,
    /// Shutdown was observed before the payload went out. No ledger write;
    /// the record stays `in_progress` for next-start recovery.
    Cancelled,
    /// A transport step failed.
    Failed(TransportError),
}

/// Run the delivery loop until shutdown or queue closure.
pub(super) async fn run(
    mut ctx: WorkerContext,
    mut rx: mpsc::UnboundedReceiver<Message>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    info!("delivery worker started");

    loop {
        let message = tokio::select! {
            msg = rx.recv() => match msg {
                Some(msg) => msg,
                None => {
                    info!("delivery queue closed");
                    break;
                }
            },
            result = shutdown_rx.changed() => {
                if result.is_err() || *shutdown_rx.borrow() {
                    info!("delivery worker shutting down");
                    break;
                }
                continue;
            }
        };

        let config = ctx.settings.snapshot();

        match attempt(ctx.transport.as_mut(), &config.smtp, &message, &shutdown_rx).await {
            AttemptOutcome::Delivered => {
                match ctx.ledger.mark_sent(message.id).await {
                    Ok(()) => {
                        info!(id = %message.id, recipient = %message.recipient, "message delivered");
                    }
                    Err(e) => {
                        // The message went out but the record still says
                        // in_progress, so it may be re-sent after a restart.
                        error!(id = %message.id, error = %e, "delivered but failed to mark sent");
                    }
                }
            }
            AttemptOutcome::Cancelled => {
                info!(id = %message.id, "shutdown during attempt, leaving message for recovery");
                break;
            }
            AttemptOutcome::Failed(e) => {
                warn!(id = %message.id, error = %e, "delivery attempt failed");

                match ctx
                    .ledger
                    .record_failed_attempt(message.id, config.delivery.max_attempts)
                    .await
                {
                    Ok(true) => {
                        // Same id re-enters the queue so retries accumulate
                        // against the same record.
                        if ctx.queue_tx.send(message).is_err() {
                            error!("delivery queue closed, dropping retry");
                        }
                    }
                    Ok(false) => {
                        warn!(
                            id = %message.id,
                            max_attempts = config.delivery.max_attempts,
                            "attempts exhausted, giving up"
                        );
                    }
                    Err(e) => {
                        // Dropped from memory, not from storage: the row is
                        // still in_progress and recovery picks it up at the
                        // next start.
                        error!(id = %message.id, error = %e, "failed to record attempt, leaving message for recovery");
                    }
                }

                // Pause before the next iteration so an unavailable server
                // is not hammered in a tight loop.
                tokio::select! {
                    () = tokio::time::sleep(config.delivery.error_backoff()) => {}
                    result = shutdown_rx.changed() => {
                        if result.is_err() || *shutdown_rx.borrow() {
                            info!("delivery worker shutting down");
                            break;
                        }
                    }
                }
            }
        }
    }

    info!("delivery worker stopped");
}

fn shutdown_requested(shutdown_rx: &watch::Receiver<bool>) -> bool {
    *shutdown_rx.borrow()
}

/// Run one transmission attempt: connect, optionally authenticate, send,
/// disconnect.
///
/// The shutdown flag is checked between transport steps, never by dropping
/// an in-flight await: once `send` has started it runs to completion, so a
/// transmission the server acknowledged always gets its ledger update.
async fn attempt(
    transport: &mut dyn Transport,
    smtp: &SmtpConfig,
    message: &Message,
    shutdown_rx: &watch::Receiver<bool>,
) -> AttemptOutcome {
    if shutdown_requested(shutdown_rx) {
        return AttemptOutcome::Cancelled;
    }

    if let Err(e) = transport.connect(&smtp.host, smtp.port, smtp.security).await {
        return AttemptOutcome::Failed(e);
    }

    if let Some(username) = &smtp.username {
        if shutdown_requested(shutdown_rx) {
            close_quietly(transport).await;
            return AttemptOutcome::Cancelled;
        }
        let password = smtp.password.as_deref().unwrap_or("");
        if let Err(e) = transport.authenticate(username, password).await {
            close_quietly(transport).await;
            return AttemptOutcome::Failed(e);
        }
    }

    if shutdown_requested(shutdown_rx) {
        close_quietly(transport).await;
        return AttemptOutcome::Cancelled;
    }

    if let Err(e) = transport.send(&smtp.sender, message).await {
        close_quietly(transport).await;
        return AttemptOutcome::Failed(e);
    }

    // The payload is acknowledged at this point. A QUIT failure still
    // counts as a failed attempt, which can re-send the message; that is
    // the at-least-once contract.
    if let Err(e) = transport.disconnect().await {
        return AttemptOutcome::Failed(e);
    }

    AttemptOutcome::Delivered
}

/// Close a half-open session after a failure or cancellation mid-attempt.
async fn close_quietly(transport: &mut dyn Transport) {
    if let Err(e) = transport.disconnect().await {
        debug!(error = %e, "disconnect after aborted attempt failed");
    }
}
