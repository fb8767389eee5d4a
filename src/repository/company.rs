//! Persistence for per-company stage rows.

use chrono::Utc;
use rusqlite::params;

use super::{parse_datetime, Result, SqlitePool};
use crate::models::{
    CompanyProfile, DiscoveryResult, DiscoveryStatus, ProfileRecord, ScrapedChunk, SearchHit,
    SearchResult, StageStatus,
};

/// A chunk ready to be written, before row ids are assigned.
#[derive(Debug, Clone)]
pub struct ChunkDraft {
    pub chunk_index: u32,
    pub chunk_total: u32,
    pub content: String,
    pub token_count: u32,
    pub source_urls: Vec<String>,
}

#[derive(Clone)]
pub struct CompanyRepository {
    pool: SqlitePool,
}

impl CompanyRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Record one search execution. Append-only.
    pub async fn save_search(
        &self,
        company_key: &str,
        query: &str,
        hits: &[SearchHit],
    ) -> Result<i64> {
        let conn = self.pool.get().await?;
        let hits_json = serde_json::to_string(hits)?;
        conn.execute(
            r#"
            INSERT INTO search_results (company_key, query, hits, result_count, created_at)
            VALUES (?1, ?2, ?3, ?4, ?5)
        "#,
            params![
                company_key,
                query,
                hits_json,
                hits.len() as i64,
                Utc::now().to_rfc3339()
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    /// Latest search row for a key, if any.
    pub async fn latest_search(&self, company_key: &str) -> Result<Option<SearchResult>> {
        let conn = self.pool.get().await?;
        let row = super::optional_row(conn.query_row(
            r#"
            SELECT id, company_key, query, hits, created_at
            FROM search_results WHERE company_key = ?1
            ORDER BY id DESC LIMIT 1
        "#,
            params![company_key],
            |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, String>(4)?,
                ))
            },
        ))?;

        let Some((id, company_key, query, hits_json, created_at)) = row else {
            return Ok(None);
        };
        Ok(Some(SearchResult {
            id,
            company_key,
            query,
            hits: serde_json::from_str(&hits_json)?,
            created_at: parse_datetime(&created_at),
        }))
    }

    /// Upsert the discovery outcome for a key.
    pub async fn upsert_discovery(&self, result: &DiscoveryResult) -> Result<()> {
        let conn = self.pool.get().await?;
        let now = Utc::now().to_rfc3339();
        conn.execute(
            r#"
            INSERT INTO discovery_results
                (company_key, chosen_url, status, confidence, reasoning, created_at, updated_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?6)
            ON CONFLICT(company_key) DO UPDATE SET
                chosen_url = excluded.chosen_url,
                status = excluded.status,
                confidence = excluded.confidence,
                reasoning = excluded.reasoning,
                updated_at = excluded.updated_at
        "#,
            params![
                result.company_key,
                result.chosen_url,
                result.status.as_str(),
                result.confidence,
                result.reasoning,
                now
            ],
        )?;
        Ok(())
    }

    pub async fn get_discovery(&self, company_key: &str) -> Result<Option<DiscoveryResult>> {
        let conn = self.pool.get().await?;
        super::optional_row(conn.query_row(
            r#"
            SELECT company_key, chosen_url, status, confidence, reasoning, created_at, updated_at
            FROM discovery_results WHERE company_key = ?1
        "#,
            params![company_key],
            |row| {
                let status: String = row.get(2)?;
                let created_at: String = row.get(5)?;
                let updated_at: String = row.get(6)?;
                Ok(DiscoveryResult {
                    company_key: row.get(0)?,
                    chosen_url: row.get(1)?,
                    status: DiscoveryStatus::from_str(&status).unwrap_or(DiscoveryStatus::Error),
                    confidence: row.get(3)?,
                    reasoning: row.get(4)?,
                    created_at: parse_datetime(&created_at),
                    updated_at: parse_datetime(&updated_at),
                })
            },
        ))
    }

    /// Replace all chunks for a key in one transaction. A re-scrape fully
    /// supersedes the previous chunk set.
    pub async fn replace_chunks(&self, company_key: &str, chunks: &[ChunkDraft]) -> Result<()> {
        let conn = self.pool.get().await?;
        let now = Utc::now().to_rfc3339();

        conn.execute("BEGIN IMMEDIATE", [])?;
        let result: Result<()> = (|| {
            conn.execute(
                "DELETE FROM scraped_chunks WHERE company_key = ?1",
                params![company_key],
            )?;
            for chunk in chunks {
                conn.execute(
                    r#"
                    INSERT INTO scraped_chunks
                        (company_key, chunk_index, chunk_total, content, token_count,
                         source_urls, created_at)
                    VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
                "#,
                    params![
                        company_key,
                        chunk.chunk_index,
                        chunk.chunk_total,
                        chunk.content,
                        chunk.token_count,
                        serde_json::to_string(&chunk.source_urls)?,
                        now
                    ],
                )?;
            }
            Ok(())
        })();

        if result.is_ok() {
            conn.execute("COMMIT", [])?;
        } else {
            let _ = conn.execute("ROLLBACK", []);
        }
        result
    }

    /// All chunks for a key in index order.
    pub async fn get_chunks(&self, company_key: &str) -> Result<Vec<ScrapedChunk>> {
        let conn = self.pool.get().await?;
        let mut stmt = conn.prepare(
            r#"
            SELECT id, company_key, chunk_index, chunk_total, content, token_count,
                   source_urls, created_at
            FROM scraped_chunks WHERE company_key = ?1
            ORDER BY chunk_index ASC
        "#,
        )?;
        let rows = stmt.query_map(params![company_key], |row| {
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, u32>(2)?,
                row.get::<_, u32>(3)?,
                row.get::<_, String>(4)?,
                row.get::<_, u32>(5)?,
                row.get::<_, String>(6)?,
                row.get::<_, String>(7)?,
            ))
        })?;

        let mut chunks = Vec::new();
        for row in rows {
            let (id, company_key, chunk_index, chunk_total, content, token_count, urls, created) =
                row?;
            chunks.push(ScrapedChunk {
                id,
                company_key,
                chunk_index,
                chunk_total,
                content,
                token_count,
                source_urls: serde_json::from_str(&urls)?,
                created_at: parse_datetime(&created),
            });
        }
        Ok(chunks)
    }

    /// Upsert the built profile for a key.
    pub async fn upsert_profile(&self, record: &ProfileRecord) -> Result<()> {
        let conn = self.pool.get().await?;
        let now = Utc::now().to_rfc3339();
        conn.execute(
            r#"
            INSERT INTO company_profiles
                (company_key, profile, company_name, industry, status,
                 chunks_used, chunks_total, created_at, updated_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?8)
            ON CONFLICT(company_key) DO UPDATE SET
                profile = excluded.profile,
                company_name = excluded.company_name,
                industry = excluded.industry,
                status = excluded.status,
                chunks_used = excluded.chunks_used,
                chunks_total = excluded.chunks_total,
                updated_at = excluded.updated_at
        "#,
            params![
                record.company_key,
                serde_json::to_string(&record.profile)?,
                record.profile.company_name,
                record.profile.industry,
                record.status.as_str(),
                record.chunks_used,
                record.chunks_total,
                now
            ],
        )?;
        Ok(())
    }

    pub async fn get_profile(&self, company_key: &str) -> Result<Option<ProfileRecord>> {
        let conn = self.pool.get().await?;
        let row = super::optional_row(conn.query_row(
            r#"
            SELECT company_key, profile, status, chunks_used, chunks_total,
                   created_at, updated_at
            FROM company_profiles WHERE company_key = ?1
        "#,
            params![company_key],
            |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, u32>(3)?,
                    row.get::<_, u32>(4)?,
                    row.get::<_, String>(5)?,
                    row.get::<_, String>(6)?,
                ))
            },
        ))?;

        let Some((company_key, profile_json, status, used, total, created_at, updated_at)) = row
        else {
            return Ok(None);
        };
        let profile: CompanyProfile = serde_json::from_str(&profile_json)?;
        Ok(Some(ProfileRecord {
            company_key,
            profile,
            status: StageStatus::from_str(&status).unwrap_or(StageStatus::Error),
            chunks_used: used,
            chunks_total: total,
            created_at: parse_datetime(&created_at),
            updated_at: parse_datetime(&updated_at),
        }))
    }
}
