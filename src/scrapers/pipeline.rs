//! The synchronous scrape stage: probe, fetch under escalating strategies,
//! follow selected links, chunk, and persist.

use std::sync::Arc;
use std::time::Instant;

use scraper::{Html, Selector};
use thiserror::Error;
use tracing::{debug, info, warn};
use url::Url;

use super::breaker::{Admission, CircuitBreakerRegistry};
use super::chunker::{chunk_pages, ChunkError, PageText, MAX_CHUNK_TOKENS};
use super::fetch::{AdaptiveFetcher, FetchError, FetchOutcome};
use super::links::LinkSelector;
use super::prober::{strip_blocks, ProbeError, SiteProber};
use crate::llm::StructuredCaller;
use crate::models::FetchStrategy;
use crate::repository::{CompanyRepository, RepositoryError, SiteKnowledgeRepository};

#[derive(Error, Debug)]
pub enum ScrapeError {
    #[error(transparent)]
    Probe(#[from] ProbeError),
    #[error("circuit open for {0}")]
    CircuitOpen(String),
    #[error("main page fetch failed: {0}")]
    MainPageFailed(FetchError),
    #[error("no page yielded content")]
    NoContent,
    #[error(transparent)]
    Chunking(#[from] ChunkError),
    #[error(transparent)]
    Repository(#[from] RepositoryError),
}

/// Summary returned by the scrape endpoint.
#[derive(Debug, Clone, serde::Serialize)]
pub struct ScrapeOutcome {
    pub chunks_saved: u32,
    pub tokens: u64,
    pub pages_fetched: u32,
    pub pages_failed: u32,
    pub strategy_used: &'static str,
    pub ms: u64,
}

/// Orchestrates one scrape for one company.
pub struct ScrapePipeline {
    fetcher: AdaptiveFetcher,
    prober: SiteProber,
    breakers: Arc<CircuitBreakerRegistry>,
    knowledge: SiteKnowledgeRepository,
    companies: CompanyRepository,
    selector: LinkSelector,
    caller: Arc<StructuredCaller>,
}

impl ScrapePipeline {
    pub fn new(
        fetcher: AdaptiveFetcher,
        prober: SiteProber,
        breakers: Arc<CircuitBreakerRegistry>,
        knowledge: SiteKnowledgeRepository,
        companies: CompanyRepository,
        selector: LinkSelector,
        caller: Arc<StructuredCaller>,
    ) -> Self {
        Self {
            fetcher,
            prober,
            breakers,
            knowledge,
            companies,
            selector,
            caller,
        }
    }

    /// Scrape the site for a company and replace its chunk set.
    ///
    /// Subpage failures do not fail the stage: whatever pages returned
    /// content are aggregated, and the outcome reports the failure count.
    pub async fn scrape(&self, company_key: &str, url: &str) -> Result<ScrapeOutcome, ScrapeError> {
        let started = Instant::now();

        let assessment = self.prober.assess(url).await?;
        let origin = assessment.origin.clone();

        if self.breakers.admit(&origin) == Admission::Rejected {
            return Err(ScrapeError::CircuitOpen(origin));
        }

        let (main, strategy) = self
            .fetch_main(&assessment.chosen_url, &assessment.strategies, &origin)
            .await?;

        let base = Url::parse(&assessment.chosen_url)
            .map_err(|e| ScrapeError::Probe(ProbeError::InvalidUrl(e.to_string())))?;
        let links = self
            .selector
            .select(&main.body, &base, Some(&self.caller))
            .await;
        debug!("{}: following {} links", company_key, links.len());

        let mut pages = vec![PageText {
            url: assessment.chosen_url.clone(),
            text: html_to_text(&main.body),
        }];
        let mut pages_failed = 0u32;

        for link in links {
            if self.breakers.admit(&origin) == Admission::Rejected {
                warn!("{}: circuit opened mid-scrape, stopping follow-up", origin);
                break;
            }
            match self.fetcher.fetch(&link, strategy).await {
                Ok(outcome) => {
                    self.breakers.on_success(&origin);
                    pages.push(PageText {
                        url: link,
                        text: html_to_text(&outcome.body),
                    });
                }
                Err(e) => {
                    pages_failed += 1;
                    debug!("{}: subpage {} failed: {}", company_key, link, e);
                    if e.counts_for_breaker() {
                        self.breakers.on_failure(&origin);
                        let _ = self.knowledge.record_failure(&origin).await;
                    }
                }
            }
        }

        if pages.iter().all(|p| p.text.trim().is_empty()) {
            return Err(ScrapeError::NoContent);
        }

        let pages_fetched = pages.len() as u32;
        let chunks = chunk_pages(&pages, MAX_CHUNK_TOKENS)?;
        let tokens: u64 = chunks.iter().map(|c| u64::from(c.token_count)).sum();
        let chunks_saved = chunks.len() as u32;

        self.companies.replace_chunks(company_key, &chunks).await?;

        info!(
            "{}: scraped {} pages into {} chunks ({} tokens)",
            company_key, pages_fetched, chunks_saved, tokens
        );

        Ok(ScrapeOutcome {
            chunks_saved,
            tokens,
            pages_fetched,
            pages_failed,
            strategy_used: strategy.as_str(),
            ms: started.elapsed().as_millis() as u64,
        })
    }

    /// Walk the candidate strategies until one yields real content.
    ///
    /// Protection pages escalate to the next strategy without touching the
    /// breaker; transport failures and genuine error statuses do both.
    async fn fetch_main(
        &self,
        url: &str,
        strategies: &[FetchStrategy],
        origin: &str,
    ) -> Result<(FetchOutcome, FetchStrategy), ScrapeError> {
        let mut last_error = FetchError::Transport("no strategy attempted".to_string());

        for &strategy in strategies {
            if self.breakers.admit(origin) == Admission::Rejected {
                return Err(ScrapeError::CircuitOpen(origin.to_string()));
            }
            match self.fetcher.fetch(url, strategy).await {
                Ok(outcome) => {
                    self.breakers.on_success(origin);
                    let _ = self.knowledge.record_success(origin, strategy).await;
                    return Ok((outcome, strategy));
                }
                Err(FetchError::ProtectionDetected(kind)) => {
                    debug!(
                        "{}: {} hit {}, escalating",
                        origin,
                        strategy.as_str(),
                        kind.as_str()
                    );
                    let _ = self.knowledge.set_protection(origin, kind).await;
                    last_error = FetchError::ProtectionDetected(kind);
                }
                Err(e) => {
                    if e.counts_for_breaker() {
                        self.breakers.on_failure(origin);
                        let _ = self.knowledge.record_failure(origin).await;
                    }
                    last_error = e;
                }
            }
        }

        Err(ScrapeError::MainPageFailed(last_error))
    }
}

/// Visible text of an HTML page, one normalized line per text block.
pub fn html_to_text(html: &str) -> String {
    let stripped = strip_blocks(html, "<script", "</script>");
    let stripped = strip_blocks(&stripped, "<style", "</style>");
    let document = Html::parse_document(&stripped);
    let body = Selector::parse("body").expect("static selector");

    let fragments: Vec<String> = match document.select(&body).next() {
        Some(body) => body.text().map(|t| t.to_string()).collect(),
        None => document
            .root_element()
            .text()
            .map(|t| t.to_string())
            .collect(),
    };

    let mut lines = Vec::new();
    for fragment in fragments {
        for raw in fragment.split('\n') {
            let line = raw.split_whitespace().collect::<Vec<_>>().join(" ");
            if !line.is_empty() {
                lines.push(line);
            }
        }
    }
    lines.join("\n")
}
