//! Durable stage queues with atomic claim, retry, and back-off.

use std::time::Duration;

use chrono::Utc;
use rand::Rng;
use rusqlite::params;
use tracing::{debug, warn};

use super::{parse_datetime, parse_datetime_opt, Result, SqlitePool};
use crate::models::{
    EnqueueOutcome, QueueEntry, QueueKind, QueueMetrics, QueueStatus, RetryOutcome,
};

/// Retry and reclaim parameters.
#[derive(Debug, Clone)]
pub struct QueueConfig {
    pub max_attempts: u32,
    pub backoff_base: Duration,
    pub backoff_cap: Duration,
    /// A processing lock older than this is reclaimable by any worker.
    pub visibility_timeout: Duration,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            backoff_base: Duration::from_secs(30),
            backoff_cap: Duration::from_secs(600),
            visibility_timeout: Duration::from_secs(600),
        }
    }
}

impl QueueConfig {
    /// Exponential back-off with ±10% jitter, capped.
    /// `attempts` is the attempt count after the failure being retried.
    pub fn backoff(&self, attempts: u32) -> Duration {
        let exp = attempts.saturating_sub(1).min(16);
        let base = self.backoff_base.as_secs_f64() * f64::from(2u32.saturating_pow(exp));
        let capped = base.min(self.backoff_cap.as_secs_f64());
        let jitter = rand::rng().random_range(-0.1..=0.1);
        Duration::from_secs_f64((capped * (1.0 + jitter)).max(0.0))
    }
}

/// One durable stage queue backed by its own table.
#[derive(Clone)]
pub struct QueueRepository {
    pool: SqlitePool,
    kind: QueueKind,
    config: QueueConfig,
}

impl QueueRepository {
    pub fn new(pool: SqlitePool, kind: QueueKind) -> Self {
        Self::with_config(pool, kind, QueueConfig::default())
    }

    pub fn with_config(pool: SqlitePool, kind: QueueKind, config: QueueConfig) -> Self {
        Self { pool, kind, config }
    }

    pub fn kind(&self) -> QueueKind {
        self.kind
    }

    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    /// Enqueue work for a company key.
    ///
    /// Idempotent: a key that already has a queued or processing entry is a
    /// no-op returning `AlreadyActive`. Enforced by a conditional insert,
    /// with the partial unique index as a backstop under races.
    pub async fn enqueue(&self, company_key: &str) -> Result<EnqueueOutcome> {
        let conn = self.pool.get().await?;
        let now = Utc::now().to_rfc3339();
        let table = self.kind.table();

        let inserted = match conn.execute(
            &format!(
                r#"
                INSERT INTO {table}
                    (company_key, status, attempts, max_attempts, available_at, created_at, updated_at)
                SELECT ?1, 'queued', 0, ?2, ?3, ?3, ?3
                WHERE NOT EXISTS (
                    SELECT 1 FROM {table}
                    WHERE company_key = ?1 AND status IN ('queued', 'processing')
                )
            "#
            ),
            params![company_key, self.config.max_attempts, now],
        ) {
            Ok(n) => n,
            // Lost a race against a concurrent enqueue for the same key.
            Err(rusqlite::Error::SqliteFailure(e, _))
                if e.code == rusqlite::ErrorCode::ConstraintViolation =>
            {
                0
            }
            Err(e) => return Err(e.into()),
        };

        if inserted == 0 {
            return Ok(EnqueueOutcome::AlreadyActive);
        }
        Ok(EnqueueOutcome::Enqueued(conn.last_insert_rowid()))
    }

    /// Enqueue a batch of keys, returning (enqueued, skipped).
    pub async fn enqueue_batch(
        &self,
        company_keys: &[String],
    ) -> Result<(Vec<String>, Vec<String>)> {
        let mut enqueued = Vec::new();
        let mut skipped = Vec::new();
        for key in company_keys {
            match self.enqueue(key).await? {
                EnqueueOutcome::Enqueued(_) => enqueued.push(key.clone()),
                EnqueueOutcome::AlreadyActive => skipped.push(key.clone()),
            }
        }
        Ok((enqueued, skipped))
    }

    /// Atomically claim up to `batch` entries for `owner`.
    ///
    /// Selects queued entries whose `available_at` has passed, plus
    /// processing entries whose lock expired (abandoned by a crashed
    /// worker), ordered by availability then id.
    pub async fn claim(&self, owner: &str, batch: u32) -> Result<Vec<QueueEntry>> {
        let conn = self.pool.get().await?;
        let table = self.kind.table();
        let now = Utc::now();
        let now_str = now.to_rfc3339();
        let reclaim_cutoff = (now
            - chrono::Duration::from_std(self.config.visibility_timeout)
                .unwrap_or(chrono::Duration::seconds(600)))
        .to_rfc3339();

        conn.execute("BEGIN IMMEDIATE", [])?;

        let result: Result<Vec<QueueEntry>> = (|| {
            let ids: Vec<i64> = {
                let mut stmt = conn.prepare(&format!(
                    r#"
                    SELECT id FROM {table}
                    WHERE (status = 'queued' AND available_at <= ?1)
                       OR (status = 'processing' AND locked_at IS NOT NULL AND locked_at <= ?2)
                    ORDER BY available_at ASC, id ASC
                    LIMIT ?3
                "#
                ))?;
                let rows = stmt.query_map(params![now_str, reclaim_cutoff, batch], |row| row.get(0))?
                    .collect::<std::result::Result<Vec<_>, _>>()?;
                rows
            };

            let mut entries = Vec::with_capacity(ids.len());
            for id in ids {
                conn.execute(
                    &format!(
                        r#"
                        UPDATE {table}
                        SET status = 'processing', owner = ?1, locked_at = ?2, updated_at = ?2
                        WHERE id = ?3
                    "#
                    ),
                    params![owner, now_str, id],
                )?;
                if let Some(entry) = self.get_by_id(&conn, id)? {
                    entries.push(entry);
                }
            }
            Ok(entries)
        })();

        if result.is_ok() {
            conn.execute("COMMIT", [])?;
        } else {
            let _ = conn.execute("ROLLBACK", []);
        }

        if let Ok(ref entries) = result {
            if !entries.is_empty() {
                debug!(
                    "claimed {} entries from {} for {}",
                    entries.len(),
                    table,
                    owner
                );
            }
        }

        result
    }

    /// Mark an entry done. Owner-guarded: if the lock was reclaimed by
    /// another worker in the meantime, this is a silent no-op.
    pub async fn complete(&self, entry_id: i64, owner: &str) -> Result<bool> {
        let conn = self.pool.get().await?;
        let now = Utc::now().to_rfc3339();
        let changed = conn.execute(
            &format!(
                r#"
                UPDATE {} SET status = 'done', locked_at = NULL, updated_at = ?1
                WHERE id = ?2 AND status = 'processing' AND owner = ?3
            "#,
                self.kind.table()
            ),
            params![now, entry_id, owner],
        )?;
        if changed == 0 {
            warn!(
                "stale complete for {} entry {} by {} ignored",
                self.kind.as_str(),
                entry_id,
                owner
            );
        }
        Ok(changed > 0)
    }

    /// Record a failure: requeue with back-off while attempts remain,
    /// otherwise mark failed. Returns None when the entry was reclaimed
    /// by another worker (no-op, like `complete`).
    pub async fn fail_or_retry(
        &self,
        entry_id: i64,
        owner: &str,
        error: &str,
    ) -> Result<Option<RetryOutcome>> {
        let conn = self.pool.get().await?;
        let table = self.kind.table();
        let now = Utc::now();
        let now_str = now.to_rfc3339();

        conn.execute("BEGIN IMMEDIATE", [])?;

        let result: Result<Option<RetryOutcome>> = (|| {
            let row: Option<(u32, u32)> = super::optional_row(conn.query_row(
                &format!(
                    "SELECT attempts, max_attempts FROM {table}
                     WHERE id = ?1 AND status = 'processing' AND owner = ?2"
                ),
                params![entry_id, owner],
                |row| Ok((row.get(0)?, row.get(1)?)),
            ))?;

            let Some((attempts, max_attempts)) = row else {
                return Ok(None);
            };

            let attempts = attempts + 1;
            let error = truncate_error(error);

            if attempts >= max_attempts {
                conn.execute(
                    &format!(
                        r#"
                        UPDATE {table}
                        SET status = 'failed', attempts = ?1, locked_at = NULL,
                            last_error = ?2, updated_at = ?3
                        WHERE id = ?4
                    "#
                    ),
                    params![attempts, error, now_str, entry_id],
                )?;
                return Ok(Some(RetryOutcome::Dead));
            }

            let available_at = (now
                + chrono::Duration::from_std(self.config.backoff(attempts))
                    .unwrap_or(chrono::Duration::seconds(30)))
            .to_rfc3339();
            conn.execute(
                &format!(
                    r#"
                    UPDATE {table}
                    SET status = 'queued', attempts = ?1, available_at = ?2,
                        locked_at = NULL, owner = NULL, last_error = ?3, updated_at = ?4
                    WHERE id = ?5
                "#
                ),
                params![attempts, available_at, error, now_str, entry_id],
            )?;
            Ok(Some(RetryOutcome::Retried))
        })();

        if result.is_ok() {
            conn.execute("COMMIT", [])?;
        } else {
            let _ = conn.execute("ROLLBACK", []);
        }

        result
    }

    /// Counts by status.
    pub async fn metrics(&self) -> Result<QueueMetrics> {
        let conn = self.pool.get().await?;
        let mut stmt = conn.prepare(&format!(
            "SELECT status, COUNT(*) FROM {} GROUP BY status",
            self.kind.table()
        ))?;
        let mut metrics = QueueMetrics::default();
        let rows = stmt.query_map([], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, u64>(1)?))
        })?;
        for row in rows {
            let (status, count) = row?;
            match QueueStatus::from_str(&status) {
                Some(QueueStatus::Queued) => metrics.queued = count,
                Some(QueueStatus::Processing) => metrics.processing = count,
                Some(QueueStatus::Done) => metrics.done = count,
                Some(QueueStatus::Failed) => metrics.failed = count,
                None => {}
            }
        }
        Ok(metrics)
    }

    /// Fetch one entry by id (outside any claim transaction).
    pub async fn get(&self, entry_id: i64) -> Result<Option<QueueEntry>> {
        let conn = self.pool.get().await?;
        self.get_by_id(&conn, entry_id)
    }

    fn get_by_id(&self, conn: &rusqlite::Connection, entry_id: i64) -> Result<Option<QueueEntry>> {
        super::optional_row(conn.query_row(
            &format!(
                r#"
                SELECT id, company_key, status, attempts, max_attempts, available_at,
                       locked_at, owner, last_error, created_at, updated_at
                FROM {} WHERE id = ?1
            "#,
                self.kind.table()
            ),
            params![entry_id],
            row_to_entry,
        ))
    }
}

fn row_to_entry(row: &rusqlite::Row<'_>) -> rusqlite::Result<QueueEntry> {
    let status: String = row.get(2)?;
    let available_at: String = row.get(5)?;
    let locked_at: Option<String> = row.get(6)?;
    let created_at: String = row.get(9)?;
    let updated_at: String = row.get(10)?;
    Ok(QueueEntry {
        id: row.get(0)?,
        company_key: row.get(1)?,
        status: QueueStatus::from_str(&status).unwrap_or(QueueStatus::Failed),
        attempts: row.get(3)?,
        max_attempts: row.get(4)?,
        available_at: parse_datetime(&available_at),
        locked_at: parse_datetime_opt(locked_at),
        owner: row.get(7)?,
        last_error: row.get(8)?,
        created_at: parse_datetime(&created_at),
        updated_at: parse_datetime(&updated_at),
    })
}

/// Keep stored error messages short.
fn truncate_error(error: &str) -> String {
    const MAX: usize = 500;
    if error.len() <= MAX {
        return error.to_string();
    }
    let mut end = MAX;
    while end > 0 && !error.is_char_boundary(end) {
        end -= 1;
    }
    error[..end].to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    async fn test_queue() -> (QueueRepository, tempfile::TempDir) {
        let dir = tempdir().unwrap();
        let db_path = dir.path().join("test.db");
        super::super::run_all_migrations(&db_path).unwrap();
        let pool = SqlitePool::new(&db_path, 4);
        (QueueRepository::new(pool, QueueKind::Discovery), dir)
    }

    #[tokio::test]
    async fn test_enqueue_is_idempotent_while_active() {
        let (queue, _dir) = test_queue().await;

        let first = queue.enqueue("12345678").await.unwrap();
        assert!(matches!(first, EnqueueOutcome::Enqueued(_)));
        let second = queue.enqueue("12345678").await.unwrap();
        assert_eq!(second, EnqueueOutcome::AlreadyActive);

        let metrics = queue.metrics().await.unwrap();
        assert_eq!(metrics.queued, 1);
    }

    #[tokio::test]
    async fn test_claim_transitions_to_processing() {
        let (queue, _dir) = test_queue().await;
        queue.enqueue("12345678").await.unwrap();

        let claimed = queue.claim("worker-a", 10).await.unwrap();
        assert_eq!(claimed.len(), 1);
        assert_eq!(claimed[0].status, QueueStatus::Processing);
        assert_eq!(claimed[0].owner.as_deref(), Some("worker-a"));

        // Still active: a fresh enqueue is rejected.
        assert_eq!(
            queue.enqueue("12345678").await.unwrap(),
            EnqueueOutcome::AlreadyActive
        );
        // And nothing more to claim.
        assert!(queue.claim("worker-b", 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_complete_is_owner_guarded() {
        let (queue, _dir) = test_queue().await;
        queue.enqueue("12345678").await.unwrap();
        let entry = queue.claim("worker-a", 1).await.unwrap().remove(0);

        assert!(!queue.complete(entry.id, "worker-b").await.unwrap());
        assert!(queue.complete(entry.id, "worker-a").await.unwrap());

        let metrics = queue.metrics().await.unwrap();
        assert_eq!(metrics.done, 1);
        // Terminal entry frees the key for re-enqueue.
        assert!(matches!(
            queue.enqueue("12345678").await.unwrap(),
            EnqueueOutcome::Enqueued(_)
        ));
    }

    #[tokio::test]
    async fn test_fail_or_retry_backoff_then_dead() {
        let dir = tempdir().unwrap();
        let db_path = dir.path().join("test.db");
        super::super::run_all_migrations(&db_path).unwrap();
        let pool = SqlitePool::new(&db_path, 4);
        let config = QueueConfig {
            max_attempts: 2,
            ..Default::default()
        };
        let queue = QueueRepository::with_config(pool, QueueKind::Profile, config);

        queue.enqueue("12345678").await.unwrap();
        let entry = queue.claim("w", 1).await.unwrap().remove(0);
        let outcome = queue
            .fail_or_retry(entry.id, "w", "transport: connection refused")
            .await
            .unwrap();
        assert_eq!(outcome, Some(RetryOutcome::Retried));

        let row = queue.get(entry.id).await.unwrap().unwrap();
        assert_eq!(row.status, QueueStatus::Queued);
        assert_eq!(row.attempts, 1);
        assert!(row.available_at > Utc::now() + chrono::Duration::seconds(20));
        // Backed off: not claimable right now.
        assert!(queue.claim("w", 1).await.unwrap().is_empty());

        // Force availability and exhaust the final attempt.
        {
            let conn = queue.pool.get().await.unwrap();
            conn.execute(
                "UPDATE queue_profile SET available_at = ?1 WHERE id = ?2",
                params![(Utc::now() - chrono::Duration::seconds(1)).to_rfc3339(), entry.id],
            )
            .unwrap();
        }
        let entry = queue.claim("w", 1).await.unwrap().remove(0);
        let outcome = queue
            .fail_or_retry(entry.id, "w", "transport: connection refused")
            .await
            .unwrap();
        assert_eq!(outcome, Some(RetryOutcome::Dead));

        let row = queue.get(entry.id).await.unwrap().unwrap();
        assert_eq!(row.status, QueueStatus::Failed);
        assert_eq!(
            row.last_error.as_deref(),
            Some("transport: connection refused")
        );

        // Failed is terminal, so the key may be enqueued again.
        assert!(matches!(
            queue.enqueue("12345678").await.unwrap(),
            EnqueueOutcome::Enqueued(_)
        ));
    }

    #[tokio::test]
    async fn test_expired_lock_is_reclaimed_and_stale_complete_ignored() {
        let (queue, _dir) = test_queue().await;
        queue.enqueue("12345678").await.unwrap();
        let entry = queue.claim("worker-a", 1).await.unwrap().remove(0);

        // Age the lock past the visibility timeout.
        {
            let conn = queue.pool.get().await.unwrap();
            let stale = (Utc::now() - chrono::Duration::seconds(601)).to_rfc3339();
            conn.execute(
                "UPDATE queue_discovery SET locked_at = ?1 WHERE id = ?2",
                params![stale, entry.id],
            )
            .unwrap();
        }

        let reclaimed = queue.claim("worker-b", 1).await.unwrap();
        assert_eq!(reclaimed.len(), 1);
        assert_eq!(reclaimed[0].id, entry.id);
        assert_eq!(reclaimed[0].owner.as_deref(), Some("worker-b"));

        // The abandoned worker's late completion is a no-op.
        assert!(!queue.complete(entry.id, "worker-a").await.unwrap());
        assert!(queue.complete(entry.id, "worker-b").await.unwrap());
    }

    #[tokio::test]
    async fn test_claim_contention_hands_each_entry_to_one_worker() {
        let (queue, _dir) = test_queue().await;
        for key in ["11111111", "22222222", "33333333"] {
            queue.enqueue(key).await.unwrap();
        }

        let a = queue.claim("worker-a", 2).await.unwrap();
        let b = queue.claim("worker-b", 2).await.unwrap();
        assert_eq!(a.len(), 2);
        assert_eq!(b.len(), 1);

        let mut ids: Vec<i64> = a.iter().chain(b.iter()).map(|e| e.id).collect();
        ids.sort_unstable();
        ids.dedup();
        assert_eq!(ids.len(), 3);
    }

    #[test]
    fn test_backoff_schedule() {
        let config = QueueConfig::default();
        for (attempts, expected_secs) in [(1u32, 30.0f64), (2, 60.0), (3, 120.0), (4, 240.0), (5, 480.0)] {
            let delay = config.backoff(attempts).as_secs_f64();
            assert!(
                (delay - expected_secs).abs() <= expected_secs * 0.1 + 0.01,
                "attempt {attempts}: got {delay}, want ~{expected_secs}"
            );
        }
        // Cap applies beyond the schedule.
        assert!(config.backoff(10).as_secs_f64() <= 600.0 * 1.1 + 0.01);
    }

    #[test]
    fn test_truncate_error_respects_char_boundaries() {
        let long = "é".repeat(400);
        let truncated = truncate_error(&long);
        assert!(truncated.len() <= 500);
        assert!(long.starts_with(&truncated));
    }
}
