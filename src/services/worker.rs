//! Long-running stage workers.
//!
//! A worker claims a small batch from its queue, runs the stage handler
//! per entry, and translates the outcome into `complete` or
//! `fail_or_retry`. Between empty claims it sleeps briefly. Shutdown is
//! cooperative: in-flight entries finish, no new claim starts.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::discovery::DiscoveryAgent;
use super::profile::ProfileExtractor;
use crate::models::{QueueEntry, QueueKind};
use crate::repository::{CompanyRepository, QueueRepository};

const CLAIM_BATCH: u32 = 5;
const IDLE_SLEEP: Duration = Duration::from_secs(1);

/// A stage invocation error, carried into the queue row's `last_error`.
#[derive(Debug, thiserror::Error)]
#[error("{0}")]
pub struct StageError(pub String);

impl StageError {
    fn new(kind: &str, detail: impl std::fmt::Display) -> Self {
        Self(format!("{kind}: {detail}"))
    }
}

/// One asynchronous stage: which queue it drains and how to run an entry.
#[async_trait]
pub trait StageHandler: Send + Sync {
    fn kind(&self) -> QueueKind;

    /// Deadline for one entry, enforced by the worker.
    fn deadline(&self) -> Duration;

    async fn handle(&self, entry: &QueueEntry) -> Result<(), StageError>;
}

/// Discovery stage: read the search row, run the agent, upsert the result.
pub struct DiscoveryHandler {
    companies: CompanyRepository,
    agent: DiscoveryAgent,
}

impl DiscoveryHandler {
    pub fn new(companies: CompanyRepository, agent: DiscoveryAgent) -> Self {
        Self { companies, agent }
    }
}

#[async_trait]
impl StageHandler for DiscoveryHandler {
    fn kind(&self) -> QueueKind {
        QueueKind::Discovery
    }

    fn deadline(&self) -> Duration {
        Duration::from_secs(60)
    }

    async fn handle(&self, entry: &QueueEntry) -> Result<(), StageError> {
        let search = self
            .companies
            .latest_search(&entry.company_key)
            .await
            .map_err(|e| StageError::new("repository", e))?
            .ok_or_else(|| {
                StageError::new("unavailable_input", "no search result for company")
            })?;

        let result = self
            .agent
            .discover(&search)
            .await
            .map_err(|e| StageError::new("llm", e))?;

        self.companies
            .upsert_discovery(&result)
            .await
            .map_err(|e| StageError::new("repository", e))?;
        Ok(())
    }
}

/// Profile stage: read the chunk set, extract and merge, upsert the profile.
pub struct ProfileHandler {
    companies: CompanyRepository,
    extractor: ProfileExtractor,
}

impl ProfileHandler {
    pub fn new(companies: CompanyRepository, extractor: ProfileExtractor) -> Self {
        Self {
            companies,
            extractor,
        }
    }
}

#[async_trait]
impl StageHandler for ProfileHandler {
    fn kind(&self) -> QueueKind {
        QueueKind::Profile
    }

    fn deadline(&self) -> Duration {
        // Per-chunk deadlines are enforced inside the extractor; the outer
        // bound covers the largest chunk set we ever produce.
        Duration::from_secs(30 * 120)
    }

    async fn handle(&self, entry: &QueueEntry) -> Result<(), StageError> {
        let chunks = self
            .companies
            .get_chunks(&entry.company_key)
            .await
            .map_err(|e| StageError::new("repository", e))?;
        if chunks.is_empty() {
            return Err(StageError::new(
                "unavailable_input",
                "no scraped chunks for company",
            ));
        }

        let record = self
            .extractor
            .build_profile(&entry.company_key, &chunks)
            .await;
        if record.chunks_used == 0 {
            return Err(StageError::new("exhausted", "no chunk contributed"));
        }

        self.companies
            .upsert_profile(&record)
            .await
            .map_err(|e| StageError::new("repository", e))?;
        Ok(())
    }
}

/// A claim-loop worker bound to one queue.
pub struct StageWorker {
    owner: String,
    queue: QueueRepository,
    handler: Arc<dyn StageHandler>,
    shutdown: watch::Receiver<bool>,
}

impl StageWorker {
    pub fn new(
        index: usize,
        queue: QueueRepository,
        handler: Arc<dyn StageHandler>,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        let owner = owner_id(handler.kind(), index);
        Self {
            owner,
            queue,
            handler,
            shutdown,
        }
    }

    pub async fn run(mut self) {
        info!("worker {} started", self.owner);

        loop {
            if *self.shutdown.borrow() {
                break;
            }

            let entries = match self.queue.claim(&self.owner, CLAIM_BATCH).await {
                Ok(entries) => entries,
                Err(e) => {
                    error!("worker {} claim failed: {}", self.owner, e);
                    Vec::new()
                }
            };

            if entries.is_empty() {
                // Idle; wake early on shutdown.
                tokio::select! {
                    _ = tokio::time::sleep(IDLE_SLEEP) => {}
                    _ = self.shutdown.changed() => {}
                }
                continue;
            }

            for entry in entries {
                self.process(&entry).await;
            }
        }

        info!("worker {} stopped", self.owner);
    }

    async fn process(&self, entry: &QueueEntry) {
        debug!(
            "worker {} processing {} (attempt {})",
            self.owner,
            entry.company_key,
            entry.attempts + 1
        );

        let outcome =
            tokio::time::timeout(self.handler.deadline(), self.handler.handle(entry)).await;

        let result = match outcome {
            Ok(Ok(())) => self.queue.complete(entry.id, &self.owner).await.map(|_| ()),
            Ok(Err(stage_error)) => {
                warn!(
                    "worker {} entry {} failed: {}",
                    self.owner, entry.company_key, stage_error
                );
                self.queue
                    .fail_or_retry(entry.id, &self.owner, &stage_error.0)
                    .await
                    .map(|_| ())
            }
            Err(_) => {
                warn!(
                    "worker {} entry {} hit the stage deadline",
                    self.owner, entry.company_key
                );
                self.queue
                    .fail_or_retry(entry.id, &self.owner, "timeout: stage deadline exceeded")
                    .await
                    .map(|_| ())
            }
        };

        if let Err(e) = result {
            error!(
                "worker {} could not record outcome for entry {}: {}",
                self.owner, entry.id, e
            );
        }
    }
}

/// Worker owner identifier: host, pid, stage, index, and a short random
/// suffix so restarts never collide with stale locks.
fn owner_id(kind: QueueKind, index: usize) -> String {
    let host = hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "unknown-host".to_string());
    let suffix = uuid::Uuid::new_v4().simple().to_string();
    format!(
        "{host}-{}-{}-{index}-{}",
        std::process::id(),
        kind.as_str(),
        &suffix[..8]
    )
}

/// Spawn `count` workers for each handler.
pub fn spawn_workers(
    handlers: Vec<(QueueRepository, Arc<dyn StageHandler>)>,
    count: usize,
    shutdown: watch::Receiver<bool>,
) -> Vec<JoinHandle<()>> {
    let mut handles = Vec::new();
    for (queue, handler) in handlers {
        for index in 0..count {
            let worker = StageWorker::new(index, queue.clone(), handler.clone(), shutdown.clone());
            handles.push(tokio::spawn(worker.run()));
        }
    }
    handles
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{EnqueueOutcome, QueueStatus};
    use crate::repository::{run_all_migrations, SqlitePool};
    use tempfile::tempdir;

    struct FlakyHandler {
        fail: bool,
    }

    #[async_trait]
    impl StageHandler for FlakyHandler {
        fn kind(&self) -> QueueKind {
            QueueKind::Discovery
        }

        fn deadline(&self) -> Duration {
            Duration::from_secs(5)
        }

        async fn handle(&self, _entry: &QueueEntry) -> Result<(), StageError> {
            if self.fail {
                Err(StageError::new("transport", "connection refused"))
            } else {
                Ok(())
            }
        }
    }

    async fn setup() -> (QueueRepository, tempfile::TempDir) {
        let dir = tempdir().unwrap();
        let db_path = dir.path().join("test.db");
        run_all_migrations(&db_path).unwrap();
        let pool = SqlitePool::new(&db_path, 4);
        (QueueRepository::new(pool, QueueKind::Discovery), dir)
    }

    #[tokio::test]
    async fn test_worker_completes_successful_entry() {
        let (queue, _dir) = setup().await;
        queue.enqueue("12345678").await.unwrap();

        let (_tx, rx) = watch::channel(false);
        let worker = StageWorker::new(
            0,
            queue.clone(),
            Arc::new(FlakyHandler { fail: false }),
            rx,
        );
        let entry = queue.claim(&worker.owner, 1).await.unwrap().remove(0);
        worker.process(&entry).await;

        let row = queue.get(entry.id).await.unwrap().unwrap();
        assert_eq!(row.status, QueueStatus::Done);
    }

    #[tokio::test]
    async fn test_worker_requeues_failed_entry_with_message() {
        let (queue, _dir) = setup().await;
        queue.enqueue("12345678").await.unwrap();

        let (_tx, rx) = watch::channel(false);
        let worker =
            StageWorker::new(0, queue.clone(), Arc::new(FlakyHandler { fail: true }), rx);
        let entry = queue.claim(&worker.owner, 1).await.unwrap().remove(0);
        worker.process(&entry).await;

        let row = queue.get(entry.id).await.unwrap().unwrap();
        assert_eq!(row.status, QueueStatus::Queued);
        assert_eq!(row.attempts, 1);
        assert_eq!(
            row.last_error.as_deref(),
            Some("transport: connection refused")
        );
    }

    #[tokio::test]
    async fn test_workers_shut_down_on_signal() {
        let (queue, _dir) = setup().await;
        let (tx, rx) = watch::channel(false);
        let handles = spawn_workers(
            vec![(
                queue.clone(),
                Arc::new(FlakyHandler { fail: false }) as Arc<dyn StageHandler>,
            )],
            2,
            rx,
        );

        tx.send(true).unwrap();
        for handle in handles {
            tokio::time::timeout(Duration::from_secs(5), handle)
                .await
                .expect("worker did not stop")
                .unwrap();
        }

        // Entries enqueued after shutdown stay queued.
        assert!(matches!(
            queue.enqueue("12345678").await.unwrap(),
            EnqueueOutcome::Enqueued(_)
        ));
    }

    #[test]
    fn test_owner_ids_are_unique_per_worker() {
        let a = owner_id(QueueKind::Discovery, 0);
        let b = owner_id(QueueKind::Discovery, 0);
        assert_ne!(a, b);
        assert!(a.contains("discovery"));
    }
}
