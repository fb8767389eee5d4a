//! Adaptive scraping: circuit breakers, strategy-driven fetching, site
//! probing, link selection, and content chunking.

pub mod breaker;
pub mod chunker;
pub mod fetch;
pub mod links;
pub mod pipeline;
pub mod prober;
mod user_agent;

pub use breaker::{Admission, BreakerConfig, CircuitBreakerRegistry, CircuitState};
pub use chunker::{chunk_pages, deduplicate, estimate_tokens, ChunkError, PageText, MAX_CHUNK_TOKENS};
pub use fetch::{classify_protection, AdaptiveFetcher, FetchError, FetchOutcome};
pub use links::LinkSelector;
pub use pipeline::{ScrapeError, ScrapeOutcome, ScrapePipeline};
pub use prober::{origin_of, url_variants, ProbeError, SiteAssessment, SiteProber};
pub use user_agent::{random_user_agent, USER_AGENT};
