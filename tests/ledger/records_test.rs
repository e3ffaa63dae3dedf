//! Tests for `src/ledger/` — record lifecycle and the atomic attempt
//! counter.

use mailspool::ledger::{DeliveryStatus, Ledger, LedgerError, Message};

async fn test_ledger() -> Ledger {
    Ledger::open_in_memory().await.expect("ledger should open")
}

fn message() -> Message {
    Message::new("rcpt@example.com", "subject", "body")
}

#[tokio::test]
async fn insert_creates_in_progress_record_with_zero_attempts() {
    let ledger = test_ledger().await;
    let msg = message();
    ledger.insert_message(&msg).await.expect("insert");

    assert_eq!(
        ledger.message_status(msg.id).await.expect("status"),
        DeliveryStatus::InProgress
    );
    assert_eq!(ledger.attempt_count(msg.id).await.expect("attempts"), 0);
}

#[tokio::test]
async fn duplicate_insert_is_rejected() {
    let ledger = test_ledger().await;
    let msg = message();
    ledger.insert_message(&msg).await.expect("first insert");

    let result = ledger.insert_message(&msg).await;
    assert!(matches!(result, Err(LedgerError::Database(_))));
}

#[tokio::test]
async fn mark_sent_is_terminal() {
    let ledger = test_ledger().await;
    let msg = message();
    ledger.insert_message(&msg).await.expect("insert");

    ledger.mark_sent(msg.id).await.expect("mark sent");
    assert_eq!(
        ledger.message_status(msg.id).await.expect("status"),
        DeliveryStatus::Sent
    );

    // A second transition out of a terminal state is refused.
    let result = ledger.mark_sent(msg.id).await;
    assert!(matches!(result, Err(LedgerError::RowCount(0))));
}

#[tokio::test]
async fn failed_attempts_accumulate_then_finalize() {
    let ledger = test_ledger().await;
    let msg = message();
    ledger.insert_message(&msg).await.expect("insert");

    let still_active = ledger
        .record_failed_attempt(msg.id, 3)
        .await
        .expect("attempt 1");
    assert!(still_active);
    assert_eq!(ledger.attempt_count(msg.id).await.expect("attempts"), 1);

    let still_active = ledger
        .record_failed_attempt(msg.id, 3)
        .await
        .expect("attempt 2");
    assert!(still_active);
    assert_eq!(ledger.attempt_count(msg.id).await.expect("attempts"), 2);

    // Third attempt reaches the maximum: soft-deleted, no longer active.
    let still_active = ledger
        .record_failed_attempt(msg.id, 3)
        .await
        .expect("attempt 3");
    assert!(!still_active);
    assert_eq!(ledger.attempt_count(msg.id).await.expect("attempts"), 3);
    assert_eq!(
        ledger.message_status(msg.id).await.expect("status"),
        DeliveryStatus::Deleted
    );
}

#[tokio::test]
async fn attempts_on_terminal_records_are_refused() {
    let ledger = test_ledger().await;
    let msg = message();
    ledger.insert_message(&msg).await.expect("insert");
    ledger.mark_sent(msg.id).await.expect("mark sent");

    let result = ledger.record_failed_attempt(msg.id, 3).await;
    assert!(matches!(result, Err(LedgerError::NotFound(_))));
    // The terminal state and counter are untouched.
    assert_eq!(
        ledger.message_status(msg.id).await.expect("status"),
        DeliveryStatus::Sent
    );
    assert_eq!(ledger.attempt_count(msg.id).await.expect("attempts"), 0);
}

#[tokio::test]
async fn unknown_message_reports_not_found() {
    let ledger = test_ledger().await;
    let id = uuid::Uuid::new_v4();

    assert!(matches!(
        ledger.message_status(id).await,
        Err(LedgerError::NotFound(_))
    ));
    assert!(matches!(
        ledger.record_failed_attempt(id, 3).await,
        Err(LedgerError::NotFound(_))
    ));
}

#[tokio::test]
async fn pending_excludes_terminal_records() {
    let ledger = test_ledger().await;

    let active = message();
    let sent = message();
    let deleted = message();
    for msg in [&active, &sent, &deleted] {
        ledger.insert_message(msg).await.expect("insert");
    }
    ledger.mark_sent(sent.id).await.expect("mark sent");
    ledger
        .record_failed_attempt(deleted.id, 1)
        .await
        .expect("exhaust");

    let pending = ledger.pending_messages().await.expect("pending");
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].id, active.id);
    assert_eq!(pending[0].subject, "subject");
}

#[tokio::test]
async fn records_survive_reopen() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("outbox.db");

    let msg = message();
    {
        let ledger = Ledger::open(&path).await.expect("open");
        ledger.insert_message(&msg).await.expect("insert");
    }

    let ledger = Ledger::open(&path).await.expect("reopen");
    let pending = ledger.pending_messages().await.expect("pending");
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].id, msg.id);
    assert_eq!(pending[0].body, "body");
}
