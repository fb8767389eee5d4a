//! Data models for the profiling pipeline.

mod company;
mod profile;
mod queue;
mod site;

pub use company::{
    validate_company_key, DiscoveryResult, DiscoveryStatus, ScrapedChunk, SearchHit, SearchResult,
};
pub use profile::{
    caps, CaseStudy, CompanyProfile, Offerings, ProductCategory, ProfileRecord, StageStatus,
};
pub use queue::{
    EnqueueOutcome, QueueEntry, QueueKind, QueueMetrics, QueueStatus, RetryOutcome,
};
pub use site::{FetchStrategy, ProtectionKind, SiteKnowledge, SiteType};
