//! Per-company stage rows: search results, discovery results, scraped chunks.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Check an 8-character company key (first segment of the national tax number).
pub fn validate_company_key(key: &str) -> bool {
    key.len() == 8 && key.bytes().all(|b| b.is_ascii_digit())
}

/// One hit returned by the search vendor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchHit {
    pub title: String,
    pub url: String,
    #[serde(default)]
    pub snippet: String,
}

/// One search execution for a company. Immutable once written.
#[derive(Debug, Clone)]
pub struct SearchResult {
    pub id: i64,
    pub company_key: String,
    pub query: String,
    pub hits: Vec<SearchHit>,
    pub created_at: DateTime<Utc>,
}

/// Outcome category of the site-discovery stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DiscoveryStatus {
    Found,
    NotFound,
    Error,
}

impl DiscoveryStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Found => "found",
            Self::NotFound => "not_found",
            Self::Error => "error",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "found" => Some(Self::Found),
            "not_found" => Some(Self::NotFound),
            "error" => Some(Self::Error),
            _ => None,
        }
    }
}

/// The chosen official site for a company. Upserted by the discovery stage.
#[derive(Debug, Clone)]
pub struct DiscoveryResult {
    pub company_key: String,
    pub chosen_url: Option<String>,
    pub status: DiscoveryStatus,
    /// Model confidence in [0, 1].
    pub confidence: f64,
    pub reasoning: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl DiscoveryResult {
    pub fn new(
        company_key: String,
        chosen_url: Option<String>,
        status: DiscoveryStatus,
        confidence: f64,
        reasoning: Option<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            company_key,
            chosen_url,
            status,
            confidence: confidence.clamp(0.0, 1.0),
            reasoning,
            created_at: now,
            updated_at: now,
        }
    }
}

/// One token-bounded slice of the deduplicated site text.
#[derive(Debug, Clone)]
pub struct ScrapedChunk {
    pub id: i64,
    pub company_key: String,
    pub chunk_index: u32,
    pub chunk_total: u32,
    pub content: String,
    pub token_count: u32,
    pub source_urls: Vec<String>,
    pub created_at: DateTime<Utc>,
}
