//! Optimistic and distributed locking against the in-memory database.

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

mod common;

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use common::{fast_config, harness, harness_with};
use futures_util::future::join_all;
use sqltx::{
    DatabaseOperation, DbError, Error, FailureKind, Row, SqlValue, TransactionEvent,
    TransactionOptions, TransactionStatus,
};
use sqltx_testing::{FOREIGN_SESSION, Fault, FaultPoint, JournalEvent};

fn document(id: i64, title: &str, version: i64) -> Row {
    Row::new()
        .with("id", id)
        .with("title", title)
        .with("version", version)
}

#[tokio::test]
async fn test_optimistic_update_bumps_version() {
    let h = harness().await;
    h.db.insert_row("documents", document(1, "draft", 3));

    let result = h
        .manager
        .execute_with_optimistic_lock("documents", 1i64, "version", 3, |row| {
            row.with("title", "final")
        })
        .await;

    assert!(result.is_success());
    assert_eq!(result.status, TransactionStatus::Committed);
    let updated = result.data().unwrap();
    assert_eq!(updated.get_i64("version").unwrap(), 4);
    assert_eq!(
        updated.get_by_name("title"),
        Some(&SqlValue::from("final"))
    );

    let stored = h.db.row("documents", &SqlValue::Int(1)).unwrap();
    assert_eq!(stored.get_i64("version").unwrap(), 4);
    assert_eq!(stored.get_by_name("title"), Some(&SqlValue::from("final")));
    assert_eq!(h.in_use(), 0);
    assert_eq!(h.manager.statistics().committed, 1);
}

#[tokio::test]
async fn test_optimistic_update_ignores_key_changes() {
    let h = harness().await;
    h.db.insert_row("documents", document(1, "draft", 0));

    let result = h
        .manager
        .execute_with_optimistic_lock("documents", 1i64, "version", 0, |row| {
            row.with("id", 99i64).with("version", 42i64)
        })
        .await;

    let updated = result.into_result().unwrap();
    assert_eq!(updated.get_i64("id").unwrap(), 1);
    assert_eq!(updated.get_i64("version").unwrap(), 1);
    assert!(h.db.row("documents", &SqlValue::Int(99)).is_none());
    assert_eq!(
        h.db.row("documents", &SqlValue::Int(1))
            .unwrap()
            .get_i64("version")
            .unwrap(),
        1
    );
}

#[tokio::test]
async fn test_version_mismatch_is_a_conflict() {
    let h = harness().await;
    h.db.insert_row("documents", document(1, "draft", 5));
    let called = AtomicBool::new(false);

    let result = h
        .manager
        .execute_with_optimistic_lock("documents", 1i64, "version", 4, |row| {
            called.store(true, Ordering::SeqCst);
            row
        })
        .await;

    let failure = result.error().unwrap();
    assert_eq!(failure.kind, FailureKind::Conflict);
    assert!(failure.message.contains("expected version 4, found 5"));
    assert_eq!(result.retry_count, 0);
    assert!(!called.load(Ordering::SeqCst));
    assert_eq!(
        h.db.row("documents", &SqlValue::Int(1))
            .unwrap()
            .get_i64("version")
            .unwrap(),
        5
    );

    let stats = h.manager.statistics();
    assert_eq!(stats.conflicts, 1);
    assert_eq!(stats.failed, 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_updates_from_same_version_have_one_winner() {
    let h = harness_with(fast_config(), 8).await;
    h.db.insert_row("documents", document(7, "draft", 3));

    let results = join_all((0..6).map(|i| {
        h.manager
            .execute_with_optimistic_lock("documents", 7i64, "version", 3, move |row| {
                row.with("title", format!("writer {i}"))
            })
    }))
    .await;

    let winners = results.iter().filter(|r| r.is_success()).count();
    assert_eq!(winners, 1);
    assert!(
        results
            .iter()
            .filter(|r| !r.is_success())
            .all(|r| r.error().unwrap().kind == FailureKind::Conflict)
    );

    let stored = h.db.row("documents", &SqlValue::Int(7)).unwrap();
    assert_eq!(stored.get_i64("version").unwrap(), 4);
    assert_eq!(h.manager.statistics().conflicts, 5);
    assert_eq!(h.in_use(), 0);
}

#[tokio::test]
async fn test_missing_row_is_reported() {
    let h = harness().await;

    let result = h
        .manager
        .execute_with_optimistic_lock("documents", 404i64, "version", 1, |row| row)
        .await;

    let failure = result.error().unwrap();
    assert_eq!(failure.kind, FailureKind::Terminal);
    assert!(failure.message.contains("no row in documents with id 404"));
    assert_eq!(h.in_use(), 0);
}

#[tokio::test]
async fn test_unsafe_identifiers_are_rejected_before_any_query() {
    let h = harness().await;

    let bad_table = h
        .manager
        .execute_with_optimistic_lock("documents; DROP TABLE users", 1i64, "version", 1, |r| r)
        .await;
    assert_eq!(bad_table.error().unwrap().kind, FailureKind::InvalidInput);

    let bad_column = h
        .manager
        .execute_with_optimistic_lock("documents", 1i64, "version = 0 --", 1, |r| r)
        .await;
    assert_eq!(bad_column.error().unwrap().kind, FailureKind::InvalidInput);

    assert!(
        h.db.journal()
            .iter()
            .all(|e| !matches!(e.event, JournalEvent::Query(_)))
    );
}

#[tokio::test]
async fn test_exhausted_version_is_rejected() {
    let h = harness().await;
    h.db.insert_row("documents", document(1, "draft", i64::MAX));
    let called = AtomicBool::new(false);

    let result = h
        .manager
        .execute_with_optimistic_lock("documents", 1i64, "version", i64::MAX, |row| {
            called.store(true, Ordering::SeqCst);
            row
        })
        .await;

    assert_eq!(result.error().unwrap().kind, FailureKind::InvalidInput);
    assert!(!called.load(Ordering::SeqCst));
    let stored = h.db.row("documents", &SqlValue::Int(1)).unwrap();
    assert_eq!(stored.get_i64("version").unwrap(), i64::MAX);
    assert_eq!(h.in_use(), 0);
}

#[tokio::test]
async fn test_distributed_lock_runs_operation_and_releases() {
    let h = harness().await;

    let result = h
        .manager
        .execute_with_distributed_lock("nightly-report", Duration::from_secs(1), || async {
            Ok(42)
        })
        .await;

    assert_eq!(h.manager.statistics().committed, 1);
    assert_eq!(result.into_result().unwrap(), 42);
    assert_eq!(h.db.lock_holder("nightly-report"), None);
    assert_eq!(h.db.count(&JournalEvent::Lock("nightly-report".into())), 1);
    assert_eq!(
        h.db.count(&JournalEvent::Unlock("nightly-report".into())),
        1
    );
    assert_eq!(h.in_use(), 0);

    let events = h.observer.events();
    assert!(matches!(
        events.as_slice(),
        [
            TransactionEvent::LockAcquired { .. },
            TransactionEvent::LockReleased { .. }
        ]
    ));
}

#[tokio::test]
async fn test_lock_held_elsewhere_times_out_without_running_operation() {
    let h = harness().await;
    h.db.hold_lock("inventory");
    let called = AtomicBool::new(false);

    let result = h
        .manager
        .execute_with_distributed_lock("inventory", Duration::from_millis(30), || async {
            called.store(true, Ordering::SeqCst);
            Ok(())
        })
        .await;

    assert_eq!(result.error().unwrap().kind, FailureKind::LockTimeout);
    assert!(!called.load(Ordering::SeqCst));
    assert_eq!(h.db.lock_holder("inventory"), Some(FOREIGN_SESSION));
    let stats = h.manager.statistics();
    assert_eq!(stats.lock_timeouts, 1);
    assert_eq!(stats.failed, 1);
    assert_eq!(stats.committed, 0);
    assert_eq!(h.in_use(), 0);
}

#[tokio::test]
async fn test_lock_released_when_operation_fails() {
    let h = harness().await;

    let result = h
        .manager
        .execute_with_distributed_lock("billing", Duration::from_secs(1), || async {
            Err::<(), _>(Error::application("invoice generation failed"))
        })
        .await;

    let failure = result.error().unwrap();
    assert_eq!(failure.kind, FailureKind::Terminal);
    assert_eq!(failure.message, "invoice generation failed");
    assert_eq!(h.db.lock_holder("billing"), None);
    assert_eq!(h.db.count(&JournalEvent::Unlock("billing".into())), 1);
}

#[tokio::test]
async fn test_failed_unlock_closes_the_session() {
    let h = harness().await;
    h.db.inject(Fault::new(FaultPoint::Unlock, DbError::new("unlock failed")).times(1));

    let result = h
        .manager
        .execute_with_distributed_lock("exports", Duration::from_secs(1), || async { Ok("done") })
        .await;

    assert_eq!(result.into_result().unwrap(), "done");
    // Closing the connection ends the session, which drops its locks.
    assert_eq!(h.db.lock_holder("exports"), None);
    assert_eq!(h.db.open_connections(), 0);
    assert_eq!(h.in_use(), 0);
}

#[tokio::test]
async fn test_lock_waits_for_release() {
    let h = harness().await;
    h.db.hold_lock("queue");

    let db = h.db.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(20)).await;
        db.release_lock("queue");
    });

    let result = h
        .manager
        .execute_with_distributed_lock("queue", Duration::from_secs(2), || async { Ok(()) })
        .await;

    assert!(result.is_success());
    assert_eq!(h.db.lock_holder("queue"), None);
}

#[tokio::test]
async fn test_operation_can_run_transactions_under_lock() {
    let h = harness().await;
    let runs = Arc::new(AtomicUsize::new(0));

    let manager = &h.manager;
    let counter = Arc::clone(&runs);
    let result = manager
        .execute_with_distributed_lock("migrations", Duration::from_secs(1), || async move {
            counter.fetch_add(1, Ordering::SeqCst);
            manager
                .execute_transaction(
                    &[DatabaseOperation::new("INSERT INTO schema_version VALUES (2)")],
                    TransactionOptions::default(),
                )
                .await
                .into_result()
                .map_err(|failure| Error::application(failure.message))
        })
        .await;

    assert!(result.is_success());
    assert_eq!(runs.load(Ordering::SeqCst), 1);
    assert_eq!(
        h.db.committed_sql(),
        vec!["INSERT INTO schema_version VALUES (2)"]
    );
    // The inner transaction and the locked region each count once.
    assert_eq!(h.manager.statistics().committed, 2);
    assert_eq!(h.in_use(), 0);
}

#[tokio::test]
async fn test_empty_lock_key_is_invalid() {
    let h = harness().await;

    let result = h
        .manager
        .execute_with_distributed_lock("", Duration::from_secs(1), || async { Ok(()) })
        .await;

    assert_eq!(result.error().unwrap().kind, FailureKind::InvalidInput);
}
