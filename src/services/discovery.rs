//! Site-discovery agent: picks the official site from stored search hits.
//!
//! The agent decides from titles, URLs, and snippets alone; it never
//! fetches candidate sites.

use std::sync::Arc;

use serde::Deserialize;
use tracing::info;
use url::Url;

use crate::llm::{schema, CallContext, ChatMessage, LlmError, StructuredCaller};
use crate::models::{DiscoveryResult, DiscoveryStatus, SearchResult};
use crate::scrapers::estimate_tokens;

const SYSTEM_PROMPT: &str = "\
Você identifica o site institucional oficial de empresas brasileiras B2B a \
partir de resultados de busca. Escolha apenas o domínio próprio da empresa. \
Marketplaces, redes sociais, diretórios (LinkedIn, Facebook, Instagram, \
Mercado Livre, Econodata, CNPJ.biz, Reclame Aqui) nunca são o site oficial. \
Se nenhum resultado for o site oficial, use status not_found. Responda \
somente com o objeto JSON.";

#[derive(Debug, Deserialize)]
struct DiscoveryDecision {
    #[serde(default)]
    chosen_url: Option<String>,
    status: String,
    confidence: f64,
    #[serde(default)]
    reasoning: Option<String>,
}

/// Chooses the official URL from search results via the model.
pub struct DiscoveryAgent {
    caller: Arc<StructuredCaller>,
}

impl DiscoveryAgent {
    pub fn new(caller: Arc<StructuredCaller>) -> Self {
        Self { caller }
    }

    /// Decide the official site for the company behind a search row.
    pub async fn discover(&self, search: &SearchResult) -> Result<DiscoveryResult, LlmError> {
        if search.hits.is_empty() {
            return Ok(DiscoveryResult::new(
                search.company_key.clone(),
                None,
                DiscoveryStatus::NotFound,
                1.0,
                Some("busca não retornou resultados".to_string()),
            ));
        }

        let listing = render_hits(search);
        let user = format!(
            "Consulta usada: {}\n\nResultados, em ordem:\n{}",
            search.query, listing
        );
        let messages = [ChatMessage::system(SYSTEM_PROMPT), ChatMessage::user(user)];

        let ctx = CallContext::for_input(estimate_tokens(&listing));
        let decision: DiscoveryDecision = self
            .caller
            .call(&messages, &schema::discovery_schema(), ctx)
            .await?;

        let result = decision_to_result(&search.company_key, decision);
        info!(
            "{}: discovery {} ({:.2}) -> {:?}",
            search.company_key,
            result.status.as_str(),
            result.confidence,
            result.chosen_url
        );
        Ok(result)
    }
}

fn render_hits(search: &SearchResult) -> String {
    search
        .hits
        .iter()
        .enumerate()
        .map(|(i, hit)| {
            format!(
                "{}. {}\n   URL: {}\n   {}\n",
                i + 1,
                hit.title,
                hit.url,
                hit.snippet
            )
        })
        .collect()
}

/// Normalize a raw model decision into a result row. Never trusts the
/// model: unknown statuses and unparseable URLs degrade safely.
fn decision_to_result(company_key: &str, decision: DiscoveryDecision) -> DiscoveryResult {
    let mut status =
        DiscoveryStatus::from_str(&decision.status).unwrap_or(DiscoveryStatus::Error);
    let mut chosen_url = decision
        .chosen_url
        .filter(|u| Url::parse(u).map(|p| p.has_host()).unwrap_or(false));

    match status {
        DiscoveryStatus::Found if chosen_url.is_none() => {
            // "found" without a usable URL is not a find.
            status = DiscoveryStatus::NotFound;
        }
        DiscoveryStatus::NotFound | DiscoveryStatus::Error => {
            chosen_url = None;
        }
        DiscoveryStatus::Found => {}
    }

    DiscoveryResult::new(
        company_key.to_string(),
        chosen_url,
        status,
        decision.confidence,
        decision.reasoning,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use crate::models::SearchHit;

    fn decision(url: Option<&str>, status: &str, confidence: f64) -> DiscoveryDecision {
        DiscoveryDecision {
            chosen_url: url.map(|s| s.to_string()),
            status: status.to_string(),
            confidence,
            reasoning: None,
        }
    }

    #[test]
    fn test_found_with_valid_url() {
        let result = decision_to_result(
            "12345678",
            decision(Some("https://www.example.com.br"), "found", 0.92),
        );
        assert_eq!(result.status, DiscoveryStatus::Found);
        assert_eq!(
            result.chosen_url.as_deref(),
            Some("https://www.example.com.br")
        );
        assert_eq!(result.confidence, 0.92);
    }

    #[test]
    fn test_found_without_url_degrades_to_not_found() {
        let result = decision_to_result("12345678", decision(None, "found", 0.8));
        assert_eq!(result.status, DiscoveryStatus::NotFound);
        assert!(result.chosen_url.is_none());
    }

    #[test]
    fn test_garbage_url_is_dropped() {
        let result = decision_to_result("12345678", decision(Some("não sei"), "found", 0.5));
        assert_eq!(result.status, DiscoveryStatus::NotFound);
    }

    #[test]
    fn test_unknown_status_becomes_error() {
        let result = decision_to_result("12345678", decision(None, "maybe", 0.5));
        assert_eq!(result.status, DiscoveryStatus::Error);
    }

    #[test]
    fn test_confidence_out_of_range_is_clamped() {
        let result = decision_to_result("12345678", decision(None, "not_found", -0.3));
        assert_eq!(result.confidence, 0.0);
    }

    #[test]
    fn test_render_hits_is_ordered() {
        let search = SearchResult {
            id: 1,
            company_key: "12345678".to_string(),
            query: "example site oficial".to_string(),
            hits: vec![
                SearchHit {
                    title: "Example Ltda".to_string(),
                    url: "https://example.com.br".to_string(),
                    snippet: "Site institucional".to_string(),
                },
                SearchHit {
                    title: "Example no LinkedIn".to_string(),
                    url: "https://linkedin.com/company/example".to_string(),
                    snippet: String::new(),
                },
            ],
            created_at: Utc::now(),
        };
        let rendered = render_hits(&search);
        assert!(rendered.starts_with("1. Example Ltda"));
        assert!(rendered.contains("2. Example no LinkedIn"));
    }
}
