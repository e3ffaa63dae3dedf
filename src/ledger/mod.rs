//! Delivery ledger backed by SQLite.
//!
//! One row per submitted message, keyed by message id. The ledger is the
//! durable shadow of the in-memory queue: after a crash, every row still in
//! `in_progress` is re-hydrated by the recovery path. Migration is applied
//! inline via `include_str!` on open.

use std::path::Path;

use anyhow::Context;
use chrono::Utc;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::SqlitePool;
use tracing::warn;
use uuid::Uuid;

/// Errors from ledger operations.
#[derive(Debug, thiserror::Error)]
pub enum LedgerError {
    /// Database operation failed.
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    /// A write affected an unexpected number of rows.
    #[error("expected write to affect exactly 1 row, affected {0}")]
    RowCount(u64),

    /// No delivery record exists for the given message id.
    #[error("no delivery record for message {0}")]
    NotFound(Uuid),
}

/// Lifecycle state of a delivery record.
///
/// `Sent` and `Deleted` are terminal: a record transitions out of
/// `InProgress` exactly once and never out of a terminal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryStatus {
    /// Submitted and/or retrying.
    InProgress,
    /// Terminal success.
    Sent,
    /// Terminal give-up: attempts exhausted.
    Deleted,
}

impl DeliveryStatus {
    /// Stable string form used in the `status` column.
    pub fn as_str(self) -> &'static str {
        match self {
            DeliveryStatus::InProgress => "in_progress",
            DeliveryStatus::Sent => "sent",
            DeliveryStatus::Deleted => "deleted",
        }
    }

    /// Whether this state admits no further transitions.
    pub fn is_terminal(self) -> bool {
        matches!(self, DeliveryStatus::Sent | DeliveryStatus::Deleted)
    }

    fn parse(s: &str) -> Option<Self> {
        match s {
            "in_progress" => Some(DeliveryStatus::InProgress),
            "sent" => Some(DeliveryStatus::Sent),
            "deleted" => Some(DeliveryStatus::Deleted),
            _ => None,
        }
    }
}

/// A unit of outbound work.
///
/// Content fields are opaque to the core; they are handed to the transport
/// as-is. The id is stable for the lifetime of the message and is the
/// correlation key for every ledger update.
#[derive(Debug, Clone)]
pub struct Message {
    /// Globally unique message id, fixed at creation.
    pub id: Uuid,
    /// Destination address.
    pub recipient: String,
    /// Subject line.
    pub subject: String,
    /// Message body.
    pub body: String,
}

impl Message {
    /// Build a new message with a fresh id.
    pub fn new(recipient: &str, subject: &str, body: &str) -> Self {
        Self {
            id: Uuid::new_v4(),
            recipient: recipient.to_owned(),
            subject: subject.to_owned(),
            body: body.to_owned(),
        }
    }
}

/// SQLite-backed store of per-message delivery state.
pub struct Ledger {
    pool: SqlitePool,
}

impl Ledger {
    /// Open (or create) the ledger at the given path and apply the schema.
    ///
    /// # Errors
    ///
    /// Returns an error if the database cannot be opened or migration fails.
    pub async fn open(path: &Path) -> anyhow::Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).with_context(|| {
                format!("failed to create ledger directory {}", parent.display())
            })?;
        }

        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
            .pragma("trusted_schema", "OFF")
            .pragma("foreign_keys", "ON");

        let pool = SqlitePoolOptions::new()
            .max_connections(2)
            .connect_with(options)
            .await
            .with_context(|| format!("failed to open ledger at {}", path.display()))?;

        Self::migrate(pool).await
    }

    /// Open an in-memory ledger for testing.
    ///
    /// # Errors
    ///
    /// Returns an error if the connection or migration fails.
    pub async fn open_in_memory() -> anyhow::Result<Self> {
        let options = SqliteConnectOptions::new()
            .filename(":memory:")
            .create_if_missing(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await
            .context("failed to open in-memory ledger")?;

        Self::migrate(pool).await
    }

    async fn migrate(pool: SqlitePool) -> anyhow::Result<Self> {
        let migration_sql = include_str!("../../migrations/001_outbox.sql");
        sqlx::raw_sql(migration_sql)
            .execute(&pool)
            .await
            .context("failed to apply outbox schema migration")?;
        Ok(Self { pool })
    }

    /// Insert a fresh delivery record: `in_progress`, zero attempts.
    ///
    /// This must complete before the message is exposed to the worker
    /// (record before work); callers abort the submission on error.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError::RowCount`] if the insert did not affect
    /// exactly one row, or [`LedgerError::Database`] on SQLite failure.
    pub async fn insert_message(&self, message: &Message) -> Result<(), LedgerError> {
        let now = Utc::now().to_rfc3339();
        let result = sqlx::query(
            "INSERT INTO outbox (id, recipient, subject, body, status, attempt_count, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, 'in_progress', 0, ?5, ?5)",
        )
        .bind(message.id.to_string())
        .bind(&message.recipient)
        .bind(&message.subject)
        .bind(&message.body)
        .bind(&now)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() != 1 {
            return Err(LedgerError::RowCount(result.rows_affected()));
        }
        Ok(())
    }

    /// Mark a record as successfully sent.
    ///
    /// Guarded on `in_progress` so a terminal record is never overwritten.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError::RowCount`] if no active record matched.
    pub async fn mark_sent(&self, id: Uuid) -> Result<(), LedgerError> {
        let now = Utc::now().to_rfc3339();
        let result = sqlx::query(
            "UPDATE outbox SET status = 'sent', updated_at = ?2
             WHERE id = ?1 AND status = 'in_progress'",
        )
        .bind(id.to_string())
        .bind(&now)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() != 1 {
            return Err(LedgerError::RowCount(result.rows_affected()));
        }
        Ok(())
    }

    /// Record one failed attempt and report whether the record is still
    /// active.
    ///
    /// A single atomic statement: increments `attempt_count` and flips the
    /// status to `deleted` when the new count reaches `max_attempts`. Split
    /// read-then-write here could corrupt the attempt count if the process
    /// is interrupted between the steps.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError::NotFound`] if no active record matched, or
    /// [`LedgerError::Database`] on SQLite failure.
    pub async fn record_failed_attempt(
        &self,
        id: Uuid,
        max_attempts: u32,
    ) -> Result<bool, LedgerError> {
        let now = Utc::now().to_rfc3339();
        let row: Option<(String,)> = sqlx::query_as(
            "UPDATE outbox SET
                attempt_count = attempt_count + 1,
                status = CASE WHEN attempt_count + 1 >= ?2 THEN 'deleted' ELSE status END,
                updated_at = ?3
             WHERE id = ?1 AND status = 'in_progress'
             RETURNING status",
        )
        .bind(id.to_string())
        .bind(i64::from(max_attempts))
        .bind(&now)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some((status,)) => Ok(status == "in_progress"),
            None => Err(LedgerError::NotFound(id)),
        }
    }

    /// Load every message whose record is not terminal.
    ///
    /// Scan order is whatever SQLite returns; callers must not rely on it.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError::Database`] on SQLite failure.
    pub async fn pending_messages(&self) -> Result<Vec<Message>, LedgerError> {
        let rows: Vec<(String, String, String, String)> = sqlx::query_as(
            "SELECT id, recipient, subject, body FROM outbox
             WHERE status NOT IN ('sent', 'deleted')",
        )
        .fetch_all(&self.pool)
        .await?;

        let mut messages = Vec::with_capacity(rows.len());
        for (id, recipient, subject, body) in rows {
            match Uuid::parse_str(&id) {
                Ok(id) => messages.push(Message {
                    id,
                    recipient,
                    subject,
                    body,
                }),
                // Ids are always written from Uuid::to_string, so this
                // means an externally tampered row. Skip it rather than
                // delivering with a broken correlation key.
                Err(_) => warn!(id = %id, "skipping outbox row with malformed id"),
            }
        }
        Ok(messages)
    }

    /// Current status of a record.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError::NotFound`] if the record does not exist.
    pub async fn message_status(&self, id: Uuid) -> Result<DeliveryStatus, LedgerError> {
        let row: Option<(String,)> = sqlx::query_as("SELECT status FROM outbox WHERE id = ?1")
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await?;

        let (status,) = row.ok_or(LedgerError::NotFound(id))?;
        DeliveryStatus::parse(&status).ok_or_else(|| {
            warn!(id = %id, status = %status, "malformed status in outbox row");
            LedgerError::NotFound(id)
        })
    }

    /// Number of failed attempts recorded for a message.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError::NotFound`] if the record does not exist.
    pub async fn attempt_count(&self, id: Uuid) -> Result<i64, LedgerError> {
        let row: Option<(i64,)> = sqlx::query_as("SELECT attempt_count FROM outbox WHERE id = ?1")
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await?;

        row.map(|(count,)| count).ok_or(LedgerError::NotFound(id))
    }
}

impl std::fmt::Debug for Ledger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Ledger").finish()
    }
}
