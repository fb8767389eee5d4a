//! Lifecycle-scoped application context.
//!
//! Built once at startup and passed explicitly (behind an `Arc`) to the
//! server and workers. In-memory state (breakers, rate buckets, vendor
//! health) is advisory and resets on restart; durable state lives in the
//! repositories.

use std::sync::Arc;

use anyhow::Context as _;

use crate::config::Settings;
use crate::llm::StructuredCaller;
use crate::rate_limit::{BucketConfig, RateGate};
use crate::repository::{
    run_all_migrations, CompanyRepository, QueueRepository, SiteKnowledgeRepository, SqlitePool,
};
use crate::scrapers::{
    AdaptiveFetcher, BreakerConfig, CircuitBreakerRegistry, LinkSelector, ScrapePipeline,
    SiteProber,
};
use crate::search::SearchClient;
use crate::models::QueueKind;

pub struct AppContext {
    pub settings: Settings,
    pub discovery_queue: QueueRepository,
    pub profile_queue: QueueRepository,
    pub companies: CompanyRepository,
    pub knowledge: SiteKnowledgeRepository,
    pub gate: Arc<RateGate>,
    pub breakers: Arc<CircuitBreakerRegistry>,
    pub caller: Arc<StructuredCaller>,
    pub search: SearchClient,
    pub scraper: ScrapePipeline,
}

impl AppContext {
    /// Wire every component. Fails fast on an unusable database.
    pub fn new(settings: Settings) -> anyhow::Result<Arc<Self>> {
        let db_path = settings.db_path();
        run_all_migrations(&db_path)
            .with_context(|| format!("database unusable at {}", db_path.display()))?;

        let pool = SqlitePool::new(&db_path, settings.database_pool_max_size);
        let companies = CompanyRepository::new(pool.clone());
        let knowledge = SiteKnowledgeRepository::new(pool.clone());
        let discovery_queue = QueueRepository::new(pool.clone(), QueueKind::Discovery);
        let profile_queue = QueueRepository::new(pool.clone(), QueueKind::Profile);

        let gate = Arc::new(RateGate::new(BucketConfig::default()));
        let breakers = Arc::new(CircuitBreakerRegistry::new(BreakerConfig::default()));
        let caller = Arc::new(StructuredCaller::new(
            settings.vendors.clone(),
            settings.llm_concurrency_hard_cap,
            gate.clone(),
        ));
        let search = SearchClient::new(settings.search_key.clone());

        let scraper = ScrapePipeline::new(
            AdaptiveFetcher::new(settings.proxy_url.clone()),
            SiteProber::new(knowledge.clone()),
            breakers.clone(),
            knowledge.clone(),
            companies.clone(),
            LinkSelector::new(settings.link_budget),
            caller.clone(),
        );

        Ok(Arc::new(Self {
            settings,
            discovery_queue,
            profile_queue,
            companies,
            knowledge,
            gate,
            breakers,
            caller,
            search,
            scraper,
        }))
    }

    /// The queue for one asynchronous stage.
    pub fn queue(&self, kind: QueueKind) -> &QueueRepository {
        match kind {
            QueueKind::Discovery => &self.discovery_queue,
            QueueKind::Profile => &self.profile_queue,
        }
    }
}
