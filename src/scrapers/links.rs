//! In-site link ranking for follow-up fetches.
//!
//! A heuristic pass filters and scores candidates; when the candidate set
//! exceeds the budget, the language model is consulted for a ranking, with
//! the heuristic ordering as the fallback.

use std::collections::HashSet;
use std::sync::Arc;

use scraper::{Html, Selector};
use serde::Deserialize;
use tracing::{debug, warn};
use url::Url;

use crate::llm::{schema, CallContext, ChatMessage, StructuredCaller};

/// File extensions that are never HTML content pages.
const SKIP_EXTENSIONS: &[&str] = &[
    ".pdf", ".jpg", ".jpeg", ".png", ".gif", ".svg", ".webp", ".ico", ".css", ".js", ".json",
    ".xml", ".zip", ".rar", ".doc", ".docx", ".xls", ".xlsx", ".ppt", ".pptx", ".mp4", ".mp3",
    ".avi", ".woff", ".woff2", ".ttf",
];

/// Path fragments that signal a high-value page for profiling.
const HIGH_SIGNAL: &[&str] = &[
    "sobre", "quem-somos", "quemsomos", "empresa", "about", "produtos", "products", "servicos",
    "services", "solucoes", "solutions", "catalogo", "catalog", "contato", "contact", "equipe",
    "team", "cases", "clientes", "clients", "parceiros", "partners", "certificacoes", "portfolio",
];

/// Path fragments that rarely contribute to a company profile.
const LOW_VALUE: &[&str] = &[
    "blog", "noticias", "news", "imprensa", "login", "signin", "cadastro", "carrinho", "cart",
    "checkout", "privacidade", "privacy", "termos", "terms", "cookies", "politica", "legal",
    "trabalhe-conosco", "vagas", "careers", "faq", "sitemap", "busca", "search", "tag",
];

/// A scored in-site link candidate.
#[derive(Debug, Clone)]
pub struct LinkCandidate {
    pub url: String,
    pub path: String,
    pub text: String,
    pub score: i32,
}

#[derive(Debug, Deserialize)]
struct RankedLinks {
    ranked_urls: Vec<String>,
}

/// Ranks in-site links under a budget.
pub struct LinkSelector {
    budget: usize,
}

impl LinkSelector {
    pub fn new(budget: usize) -> Self {
        Self { budget }
    }

    /// Extract, filter, and heuristically score same-site links.
    pub fn candidates(&self, html: &str, base: &Url) -> Vec<LinkCandidate> {
        let document = Html::parse_document(html);
        let anchor = Selector::parse("a[href]").expect("static selector");

        let base_host = base.host_str().unwrap_or_default().trim_start_matches("www.");
        let mut seen = HashSet::new();
        let mut candidates = Vec::new();

        for element in document.select(&anchor) {
            let Some(href) = element.value().attr("href") else {
                continue;
            };
            let href = href.trim();
            if href.is_empty()
                || href.starts_with('#')
                || href.starts_with("mailto:")
                || href.starts_with("tel:")
                || href.starts_with("javascript:")
            {
                continue;
            }

            let Ok(mut url) = base.join(href) else {
                continue;
            };
            url.set_fragment(None);
            if url.scheme() != "http" && url.scheme() != "https" {
                continue;
            }

            let host = url.host_str().unwrap_or_default().trim_start_matches("www.");
            if host != base_host {
                continue;
            }

            let path = url.path().to_lowercase();
            if SKIP_EXTENSIONS.iter().any(|ext| path.ends_with(ext)) {
                continue;
            }
            // The main page is fetched already.
            if path.is_empty() || path == "/" {
                continue;
            }

            let url_string = url.to_string();
            if !seen.insert(url_string.clone()) {
                continue;
            }

            let text = element.text().collect::<String>().trim().to_string();
            let score = score_path(&path, &text);
            candidates.push(LinkCandidate {
                url: url_string,
                path,
                text,
                score,
            });
        }

        // Highest score first; shorter paths break ties (closer to the root).
        candidates.sort_by(|a, b| b.score.cmp(&a.score).then(a.path.len().cmp(&b.path.len())));
        candidates
    }

    /// Select up to the budget, consulting the model when over budget.
    pub async fn select(
        &self,
        html: &str,
        base: &Url,
        caller: Option<&Arc<StructuredCaller>>,
    ) -> Vec<String> {
        let candidates = self.candidates(html, base);
        if candidates.len() <= self.budget {
            return candidates.into_iter().map(|c| c.url).collect();
        }

        if let Some(caller) = caller {
            match self.rank_with_model(&candidates, caller).await {
                Ok(ranked) => return ranked,
                Err(e) => {
                    warn!("model link ranking unavailable ({}), using heuristics", e);
                }
            }
        }

        candidates
            .into_iter()
            .take(self.budget)
            .map(|c| c.url)
            .collect()
    }

    async fn rank_with_model(
        &self,
        candidates: &[LinkCandidate],
        caller: &Arc<StructuredCaller>,
    ) -> Result<Vec<String>, crate::llm::LlmError> {
        let listing: String = candidates
            .iter()
            .map(|c| format!("- {} ({})\n", c.url, c.text))
            .collect();
        let messages = [
            ChatMessage::system(
                "Você ajuda a escolher quais páginas de um site corporativo visitar para \
                 montar o perfil da empresa. Priorize páginas sobre a empresa, produtos, \
                 serviços, clientes e contato. Responda apenas com o objeto JSON.",
            ),
            ChatMessage::user(format!(
                "Escolha as {} páginas mais úteis, em ordem de prioridade:\n{}",
                self.budget, listing
            )),
        ];

        let ctx = CallContext::for_input(estimate_listing_tokens(&listing));
        let ranked: RankedLinks = caller
            .call(&messages, &schema::link_ranking_schema(self.budget), ctx)
            .await?;

        // Only accept URLs we actually offered.
        let known: HashSet<&str> = candidates.iter().map(|c| c.url.as_str()).collect();
        let accepted: Vec<String> = ranked
            .ranked_urls
            .into_iter()
            .filter(|u| known.contains(u.as_str()))
            .take(self.budget)
            .collect();

        if accepted.is_empty() {
            return Err(crate::llm::LlmError::SchemaViolation(
                "ranking contained no known urls".to_string(),
            ));
        }
        debug!("model ranked {} of {} candidates", accepted.len(), known.len());
        Ok(accepted)
    }
}

fn estimate_listing_tokens(listing: &str) -> u32 {
    super::chunker::estimate_tokens(listing)
}

fn score_path(path: &str, text: &str) -> i32 {
    let text_lower = text.to_lowercase();
    let mut score = 0;
    for keyword in HIGH_SIGNAL {
        if path.contains(keyword) || text_lower.contains(keyword) {
            score += 3;
        }
    }
    for keyword in LOW_VALUE {
        if path.contains(keyword) {
            score -= 3;
        }
    }
    // Deep paths are usually detail pages, not section roots.
    let depth = path.matches('/').count();
    score - depth as i32
}
