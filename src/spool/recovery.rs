//! Startup re-hydration of in-flight messages.

use tokio::sync::mpsc::UnboundedSender;
use tracing::debug;

use crate::ledger::{Ledger, LedgerError, Message};

/// Errors from the recovery pass.
#[derive(Debug, thiserror::Error)]
pub enum RecoveryError {
    /// The pending-message query failed.
    #[error("failed to load pending messages: {0}")]
    Query(#[from] LedgerError),

    /// The delivery queue was closed before recovery finished.
    #[error("delivery queue closed during recovery")]
    QueueClosed,
}

/// Re-enqueue every non-terminal ledger row and return how many there were.
///
/// Runs once, before the delivery worker starts, so nothing that was in
/// flight at the previous shutdown is processed behind work the worker has
/// not seen yet. Cross-record order is whatever the ledger scan returns.
///
/// # Errors
///
/// Returns [`RecoveryError::Query`] if the ledger scan fails; the caller
/// must treat this as a startup failure and not start the worker.
pub async fn recover(
    ledger: &Ledger,
    queue: &UnboundedSender<Message>,
) -> Result<usize, RecoveryError> {
    let pending = ledger.pending_messages().await?;
    let count = pending.len();
    for message in pending {
        debug!(id = %message.id, recipient = %message.recipient, "requeueing in-flight message");
        queue.send(message).map_err(|_| RecoveryError::QueueClosed)?;
    }
    Ok(count)
}
