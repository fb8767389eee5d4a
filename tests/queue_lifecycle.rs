//! End-to-end queue lifecycle against a real database file.

use std::time::Duration;

use chrono::Utc;
use tempfile::tempdir;

use fornecedor::models::{EnqueueOutcome, QueueKind, QueueStatus, RetryOutcome};
use fornecedor::repository::{run_all_migrations, QueueConfig, QueueRepository, SqlitePool};

fn setup(kind: QueueKind) -> (QueueRepository, tempfile::TempDir) {
    let dir = tempdir().unwrap();
    let db_path = dir.path().join("pipeline.db");
    run_all_migrations(&db_path).unwrap();
    let pool = SqlitePool::new(&db_path, 8);
    (QueueRepository::new(pool, kind), dir)
}

#[tokio::test]
async fn unique_active_invariant_holds_across_lifecycle() {
    let (queue, _dir) = setup(QueueKind::Discovery);

    assert!(matches!(
        queue.enqueue("12345678").await.unwrap(),
        EnqueueOutcome::Enqueued(_)
    ));
    assert_eq!(
        queue.enqueue("12345678").await.unwrap(),
        EnqueueOutcome::AlreadyActive
    );

    // Claiming keeps the key active.
    let entry = queue.claim("w1", 1).await.unwrap().remove(0);
    assert_eq!(
        queue.enqueue("12345678").await.unwrap(),
        EnqueueOutcome::AlreadyActive
    );

    // A terminal transition releases it.
    assert!(queue.complete(entry.id, "w1").await.unwrap());
    assert!(matches!(
        queue.enqueue("12345678").await.unwrap(),
        EnqueueOutcome::Enqueued(_)
    ));

    let metrics = queue.metrics().await.unwrap();
    assert_eq!(metrics.done, 1);
    assert_eq!(metrics.queued, 1);
}

#[tokio::test]
async fn concurrent_claims_assign_each_entry_exactly_once() {
    let (queue, _dir) = setup(QueueKind::Discovery);

    let keys: Vec<String> = (0..20).map(|i| format!("{:08}", 10_000_000 + i)).collect();
    let (enqueued, skipped) = queue.enqueue_batch(&keys).await.unwrap();
    assert_eq!(enqueued.len(), 20);
    assert!(skipped.is_empty());

    let mut handles = Vec::new();
    for worker in 0..4 {
        let queue = queue.clone();
        handles.push(tokio::spawn(async move {
            let owner = format!("worker-{worker}");
            let mut mine = Vec::new();
            loop {
                let claimed = queue.claim(&owner, 3).await.unwrap();
                if claimed.is_empty() {
                    break;
                }
                mine.extend(claimed.into_iter().map(|e| e.id));
            }
            mine
        }));
    }

    let mut all_ids = Vec::new();
    for handle in handles {
        all_ids.extend(handle.await.unwrap());
    }
    all_ids.sort_unstable();
    let before_dedup = all_ids.len();
    all_ids.dedup();

    assert_eq!(before_dedup, 20, "every entry claimed");
    assert_eq!(all_ids.len(), 20, "no entry claimed twice");

    let metrics = queue.metrics().await.unwrap();
    assert_eq!(metrics.processing, 20);
    assert_eq!(metrics.queued, 0);
}

#[tokio::test]
async fn abandoned_lock_is_reclaimed_and_stale_writes_are_ignored() {
    let dir = tempdir().unwrap();
    let db_path = dir.path().join("pipeline.db");
    run_all_migrations(&db_path).unwrap();
    let pool = SqlitePool::new(&db_path, 8);
    let config = QueueConfig {
        visibility_timeout: Duration::from_secs(1),
        ..Default::default()
    };
    let queue = QueueRepository::with_config(pool, QueueKind::Profile, config);

    queue.enqueue("12345678").await.unwrap();
    let entry = queue.claim("crashed-worker", 1).await.unwrap().remove(0);

    // Not reclaimable while the lock is fresh.
    assert!(queue.claim("worker-b", 1).await.unwrap().is_empty());

    tokio::time::sleep(Duration::from_millis(1100)).await;

    let reclaimed = queue.claim("worker-b", 1).await.unwrap();
    assert_eq!(reclaimed.len(), 1);
    assert_eq!(reclaimed[0].id, entry.id);

    // The crashed worker comes back: its terminal updates are no-ops.
    assert!(!queue.complete(entry.id, "crashed-worker").await.unwrap());
    assert_eq!(
        queue
            .fail_or_retry(entry.id, "crashed-worker", "late failure")
            .await
            .unwrap(),
        None
    );

    assert!(queue.complete(entry.id, "worker-b").await.unwrap());
    let row = queue.get(entry.id).await.unwrap().unwrap();
    assert_eq!(row.status, QueueStatus::Done);
}

#[tokio::test]
async fn retries_back_off_then_exhaust_to_failed() {
    let dir = tempdir().unwrap();
    let db_path = dir.path().join("pipeline.db");
    run_all_migrations(&db_path).unwrap();
    let pool = SqlitePool::new(&db_path, 8);
    let config = QueueConfig {
        max_attempts: 3,
        ..Default::default()
    };
    let queue = QueueRepository::with_config(pool.clone(), QueueKind::Discovery, config);

    queue.enqueue("62345678").await.unwrap();

    for attempt in 1..=3u32 {
        // Make the entry claimable regardless of back-off.
        {
            let conn = rusqlite::Connection::open(&db_path).unwrap();
            conn.execute(
                "UPDATE queue_discovery SET available_at = ?1",
                [(Utc::now() - chrono::Duration::seconds(1)).to_rfc3339()],
            )
            .unwrap();
        }
        let entry = queue.claim("w", 1).await.unwrap().remove(0);
        let outcome = queue
            .fail_or_retry(entry.id, "w", "transport: connection reset")
            .await
            .unwrap()
            .unwrap();
        if attempt < 3 {
            assert_eq!(outcome, RetryOutcome::Retried);
            let row = queue.get(entry.id).await.unwrap().unwrap();
            assert_eq!(row.status, QueueStatus::Queued);
            assert_eq!(row.attempts, attempt);
            // Back-off pushed availability into the future.
            assert!(row.available_at > Utc::now());
        } else {
            assert_eq!(outcome, RetryOutcome::Dead);
        }
    }

    let row = queue.metrics().await.unwrap();
    assert_eq!(row.failed, 1);
    assert_eq!(
        queue
            .get(1)
            .await
            .unwrap()
            .unwrap()
            .last_error
            .as_deref(),
        Some("transport: connection reset")
    );

    // A failed entry no longer blocks the key.
    assert!(matches!(
        queue.enqueue("62345678").await.unwrap(),
        EnqueueOutcome::Enqueued(_)
    ));
}
