//! Site probing: URL variant selection and target classification.

use std::time::{Duration, Instant};

use thiserror::Error;
use tracing::{debug, info};
use url::Url;

use super::fetch::classify_protection;
use crate::models::{FetchStrategy, ProtectionKind, SiteType};
use crate::repository::SiteKnowledgeRepository;

/// Per-variant probe budget.
const PROBE_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Error, Debug)]
pub enum ProbeError {
    #[error("invalid url: {0}")]
    InvalidUrl(String),
    #[error("no reachable variant for {0}")]
    AllVariantsFailed(String),
}

/// One variant probe result.
#[derive(Debug, Clone)]
pub struct ProbeOutcome {
    pub url: String,
    pub status: u16,
    pub latency: Duration,
    pub body: String,
}

/// The prober's verdict for a target site.
#[derive(Debug, Clone)]
pub struct SiteAssessment {
    pub chosen_url: String,
    pub origin: String,
    pub site_type: SiteType,
    pub protection: Option<ProtectionKind>,
    /// Candidate fetch strategies, best first.
    pub strategies: Vec<FetchStrategy>,
    /// Body of the winning probe, reusable as the main page.
    pub main_body: String,
}

/// scheme + host of a URL.
pub fn origin_of(url: &str) -> Option<String> {
    let parsed = Url::parse(url).ok()?;
    let host = parsed.host_str()?;
    Some(format!("{}://{}", parsed.scheme(), host))
}

/// The four {http, https} × {apex, www} variants of a base URL, preserving
/// its path. Https variants come first so ties favor them.
pub fn url_variants(base: &str) -> Result<Vec<String>, ProbeError> {
    let parsed = Url::parse(base).map_err(|e| ProbeError::InvalidUrl(e.to_string()))?;
    let host = parsed
        .host_str()
        .ok_or_else(|| ProbeError::InvalidUrl(format!("no host in {base}")))?;
    let apex = host.trim_start_matches("www.");
    let path = parsed.path();
    let path = if path == "/" { "" } else { path };

    Ok(vec![
        format!("https://www.{apex}{path}"),
        format!("https://{apex}{path}"),
        format!("http://www.{apex}{path}"),
        format!("http://{apex}{path}"),
    ])
}

/// Probes URL variants and classifies the chosen target.
pub struct SiteProber {
    knowledge: SiteKnowledgeRepository,
    client: reqwest::Client,
}

impl SiteProber {
    pub fn new(knowledge: SiteKnowledgeRepository) -> Self {
        let client = reqwest::Client::builder()
            .user_agent(super::user_agent::USER_AGENT)
            .timeout(PROBE_TIMEOUT)
            .gzip(true)
            .brotli(true)
            .redirect(reqwest::redirect::Policy::limited(5))
            .build()
            .expect("probe client build");
        Self { knowledge, client }
    }

    /// Probe all variants in parallel and assess the fastest success.
    pub async fn assess(&self, base_url: &str) -> Result<SiteAssessment, ProbeError> {
        let variants = url_variants(base_url)?;
        let probes = variants.iter().map(|url| self.probe(url.clone()));
        let outcomes: Vec<Option<ProbeOutcome>> = futures::future::join_all(probes).await;

        let best = outcomes
            .into_iter()
            .flatten()
            .filter(|o| o.status < 400)
            .min_by_key(|o| o.latency)
            .ok_or_else(|| ProbeError::AllVariantsFailed(base_url.to_string()))?;

        let origin = origin_of(&best.url)
            .ok_or_else(|| ProbeError::InvalidUrl(best.url.clone()))?;
        let protection = classify_protection(&best.body);
        let site_type = if protection.is_some() {
            SiteType::Unknown
        } else {
            classify_site_type(&best.body)
        };

        let mut strategies: Vec<FetchStrategy> = FetchStrategy::ALL.to_vec();
        if let Ok(Some(knowledge)) = self.knowledge.get(&origin).await {
            if let Some(best_known) = knowledge.best_strategy {
                strategies.retain(|s| *s != best_known);
                strategies.insert(0, best_known);
                debug!(
                    "promoting known strategy {} for {}",
                    best_known.as_str(),
                    origin
                );
            }
        }

        info!(
            "probe chose {} ({:?}, {} in {:?})",
            best.url,
            site_type,
            best.status,
            best.latency
        );

        Ok(SiteAssessment {
            chosen_url: best.url.clone(),
            origin,
            site_type,
            protection,
            strategies,
            main_body: best.body,
        })
    }

    async fn probe(&self, url: String) -> Option<ProbeOutcome> {
        let started = Instant::now();
        let response = self.client.get(&url).send().await.ok()?;
        let status = response.status().as_u16();
        let final_url = response.url().to_string();
        let body = response.text().await.ok()?;
        Some(ProbeOutcome {
            url: final_url,
            status,
            latency: started.elapsed(),
            body,
        })
    }
}

/// Classify rendering style from body features.
pub fn classify_site_type(body: &str) -> SiteType {
    if body.len() < 200 {
        return SiteType::Unknown;
    }
    let lowered = body.to_lowercase();

    let framework_markers = [
        "id=\"root\"",
        "id=\"app\"",
        "id=\"__next\"",
        "id=\"___gatsby\"",
        "data-reactroot",
        "ng-version",
        "window.__nuxt__",
    ]
    .iter()
    .filter(|m| lowered.contains(*m))
    .count();

    let script_tags = lowered.matches("<script").count();
    let visible_text = visible_text_len(&lowered);

    if framework_markers > 0 && visible_text < 800 {
        SiteType::Spa
    } else if framework_markers > 0 || script_tags > 15 {
        SiteType::Hybrid
    } else if visible_text > 500 {
        SiteType::Static
    } else {
        SiteType::Unknown
    }
}

/// Crude visible-text length: characters outside tags, scripts, and styles.
fn visible_text_len(body: &str) -> usize {
    let stripped = strip_blocks(body, "<script", "</script>");
    let stripped = strip_blocks(&stripped, "<style", "</style>");

    let mut len = 0;
    let mut in_tag = false;
    for c in stripped.chars() {
        match c {
            '<' => in_tag = true,
            '>' => in_tag = false,
            c if !in_tag && !c.is_whitespace() => len += 1,
            _ => {}
        }
    }
    len
}

pub(crate) fn strip_blocks(body: &str, open: &str, close: &str) -> String {
    let mut out = String::with_capacity(body.len());
    let mut rest = body;
    while let Some(start) = rest.find(open) {
        out.push_str(&rest[..start]);
        match rest[start..].find(close) {
            Some(end) => rest = &rest[start + end + close.len()..],
            None => {
                rest = "";
                break;
            }
        }
    }
    out.push_str(rest);
    out
}
