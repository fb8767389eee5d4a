//! Durable queue rows for the asynchronous stages.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Which stage queue a row belongs to. Each kind is its own table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QueueKind {
    Discovery,
    Profile,
}

impl QueueKind {
    pub fn table(&self) -> &'static str {
        match self {
            Self::Discovery => "queue_discovery",
            Self::Profile => "queue_profile",
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Discovery => "discovery",
            Self::Profile => "profile",
        }
    }
}

/// Lifecycle of a queue entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueStatus {
    Queued,
    Processing,
    Done,
    Failed,
}

impl QueueStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Processing => "processing",
            Self::Done => "done",
            Self::Failed => "failed",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "queued" => Some(Self::Queued),
            "processing" => Some(Self::Processing),
            "done" => Some(Self::Done),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }
}

/// One unit of work for an asynchronous stage.
///
/// Invariant: at most one entry per company key may be queued or processing
/// in a given queue at any time.
#[derive(Debug, Clone)]
pub struct QueueEntry {
    pub id: i64,
    pub company_key: String,
    pub status: QueueStatus,
    pub attempts: u32,
    pub max_attempts: u32,
    /// Earliest time the entry may be claimed.
    pub available_at: DateTime<Utc>,
    /// Set while processing; a lock older than the visibility timeout is
    /// reclaimable by another worker.
    pub locked_at: Option<DateTime<Utc>>,
    pub owner: Option<String>,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Result of an enqueue attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueOutcome {
    Enqueued(i64),
    /// The key already has a queued or processing entry.
    AlreadyActive,
}

/// Result of `fail_or_retry`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryOutcome {
    /// The entry went back to queued with back-off applied.
    Retried,
    /// Attempts were exhausted; the entry is failed.
    Dead,
}

/// Aggregate queue counts by status.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct QueueMetrics {
    pub queued: u64,
    pub processing: u64,
    pub done: u64,
    pub failed: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_queue_status_round_trip() {
        for status in [
            QueueStatus::Queued,
            QueueStatus::Processing,
            QueueStatus::Done,
            QueueStatus::Failed,
        ] {
            assert_eq!(QueueStatus::from_str(status.as_str()), Some(status));
        }
    }

    #[test]
    fn test_queue_kind_tables_differ() {
        assert_ne!(QueueKind::Discovery.table(), QueueKind::Profile.table());
    }
}
