//! Advisory per-origin fetch knowledge.

use chrono::Utc;
use rusqlite::params;

use super::{parse_datetime, parse_datetime_opt, Result, SqlitePool};
use crate::models::{FetchStrategy, ProtectionKind, SiteKnowledge};

#[derive(Clone)]
pub struct SiteKnowledgeRepository {
    pool: SqlitePool,
}

impl SiteKnowledgeRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn get(&self, origin: &str) -> Result<Option<SiteKnowledge>> {
        let conn = self.pool.get().await?;
        super::optional_row(conn.query_row(
            r#"
            SELECT origin, best_strategy, protection, success_count, failure_count,
                   last_success_at, updated_at
            FROM site_knowledge WHERE origin = ?1
        "#,
            params![origin],
            |row| {
                let strategy: Option<String> = row.get(1)?;
                let protection: Option<String> = row.get(2)?;
                let last_success: Option<String> = row.get(5)?;
                let updated_at: String = row.get(6)?;
                Ok(SiteKnowledge {
                    origin: row.get(0)?,
                    best_strategy: strategy.as_deref().and_then(FetchStrategy::from_str),
                    protection: protection.as_deref().and_then(ProtectionKind::from_str),
                    success_count: row.get(3)?,
                    failure_count: row.get(4)?,
                    last_success_at: parse_datetime_opt(last_success),
                    updated_at: parse_datetime(&updated_at),
                })
            },
        ))
    }

    /// Record a successful fetch and remember the strategy that worked.
    pub async fn record_success(&self, origin: &str, strategy: FetchStrategy) -> Result<()> {
        let conn = self.pool.get().await?;
        let now = Utc::now().to_rfc3339();
        conn.execute(
            r#"
            INSERT INTO site_knowledge
                (origin, best_strategy, success_count, failure_count, last_success_at, updated_at)
            VALUES (?1, ?2, 1, 0, ?3, ?3)
            ON CONFLICT(origin) DO UPDATE SET
                best_strategy = excluded.best_strategy,
                success_count = success_count + 1,
                last_success_at = excluded.last_success_at,
                updated_at = excluded.updated_at
        "#,
            params![origin, strategy.as_str(), now],
        )?;
        Ok(())
    }

    /// Record a failed fetch attempt against the origin.
    pub async fn record_failure(&self, origin: &str) -> Result<()> {
        let conn = self.pool.get().await?;
        let now = Utc::now().to_rfc3339();
        conn.execute(
            r#"
            INSERT INTO site_knowledge (origin, success_count, failure_count, updated_at)
            VALUES (?1, 0, 1, ?2)
            ON CONFLICT(origin) DO UPDATE SET
                failure_count = failure_count + 1,
                updated_at = excluded.updated_at
        "#,
            params![origin, now],
        )?;
        Ok(())
    }

    /// Remember the protection category seen on the origin.
    pub async fn set_protection(&self, origin: &str, protection: ProtectionKind) -> Result<()> {
        let conn = self.pool.get().await?;
        let now = Utc::now().to_rfc3339();
        conn.execute(
            r#"
            INSERT INTO site_knowledge (origin, protection, success_count, failure_count, updated_at)
            VALUES (?1, ?2, 0, 0, ?3)
            ON CONFLICT(origin) DO UPDATE SET
                protection = excluded.protection,
                updated_at = excluded.updated_at
        "#,
            params![origin, protection.as_str(), now],
        )?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    async fn test_repo() -> (SiteKnowledgeRepository, tempfile::TempDir) {
        let dir = tempdir().unwrap();
        let db_path = dir.path().join("test.db");
        super::super::run_all_migrations(&db_path).unwrap();
        (SiteKnowledgeRepository::new(SqlitePool::new(&db_path, 2)), dir)
    }

    #[tokio::test]
    async fn test_success_promotes_strategy() {
        let (repo, _dir) = test_repo().await;
        let origin = "https://www.example.com.br";

        repo.record_failure(origin).await.unwrap();
        repo.record_success(origin, FetchStrategy::Aggressive)
            .await
            .unwrap();

        let knowledge = repo.get(origin).await.unwrap().unwrap();
        assert_eq!(knowledge.best_strategy, Some(FetchStrategy::Aggressive));
        assert_eq!(knowledge.success_count, 1);
        assert_eq!(knowledge.failure_count, 1);
        assert!(knowledge.last_success_at.is_some());
    }

    #[tokio::test]
    async fn test_protection_is_remembered() {
        let (repo, _dir) = test_repo().await;
        let origin = "https://protected.com.br";

        repo.set_protection(origin, ProtectionKind::BrowserChallenge)
            .await
            .unwrap();
        let knowledge = repo.get(origin).await.unwrap().unwrap();
        assert_eq!(knowledge.protection, Some(ProtectionKind::BrowserChallenge));
        assert_eq!(knowledge.best_strategy, None);
    }
}
