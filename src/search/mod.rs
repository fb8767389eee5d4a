//! Search vendor client (Serper-compatible API).

use serde::Deserialize;
use serde_json::json;
use thiserror::Error;
use tracing::debug;

use crate::models::SearchHit;

const DEFAULT_ENDPOINT: &str = "https://google.serper.dev/search";
const RESULT_COUNT: u32 = 10;

#[derive(Error, Debug)]
pub enum SearchError {
    #[error("search vendor unreachable: {0}")]
    Unreachable(String),
    #[error("search vendor error: {0}")]
    Api(String),
    #[error("unexpected search response: {0}")]
    Parse(String),
}

/// Inputs for one company search.
#[derive(Debug, Clone, Deserialize)]
pub struct SearchQuery {
    pub company_name: String,
    #[serde(default)]
    pub trade_name: Option<String>,
    #[serde(default)]
    pub city: Option<String>,
}

impl SearchQuery {
    /// The query string sent to the vendor. The trade name usually matches
    /// what the company calls itself on the web, so it leads when present.
    pub fn build(&self) -> String {
        let name = self
            .trade_name
            .as_deref()
            .filter(|s| !s.trim().is_empty())
            .unwrap_or(&self.company_name);
        let mut parts = vec![name.trim()];
        if let Some(city) = self.city.as_deref() {
            if !city.trim().is_empty() {
                parts.push(city.trim());
            }
        }
        parts.push("site oficial");
        parts.join(" ")
    }
}

#[derive(Debug, Deserialize)]
struct SerperResponse {
    #[serde(default)]
    organic: Vec<SerperHit>,
}

#[derive(Debug, Deserialize)]
struct SerperHit {
    #[serde(default)]
    title: String,
    link: String,
    #[serde(default)]
    snippet: String,
}

/// Client for the search API.
#[derive(Clone)]
pub struct SearchClient {
    api_key: String,
    endpoint: String,
    client: reqwest::Client,
}

impl SearchClient {
    pub fn new(api_key: String) -> Self {
        Self::with_endpoint(api_key, DEFAULT_ENDPOINT.to_string())
    }

    pub fn with_endpoint(api_key: String, endpoint: String) -> Self {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(30))
            .build()
            .expect("search client build");
        Self {
            api_key,
            endpoint,
            client,
        }
    }

    /// Run one search, returning the ordered hits.
    pub async fn search(&self, query: &str) -> Result<Vec<SearchHit>, SearchError> {
        debug!("searching: {}", query);
        let response = self
            .client
            .post(&self.endpoint)
            .header("X-API-KEY", &self.api_key)
            .json(&json!({
                "q": query,
                "gl": "br",
                "hl": "pt-br",
                "num": RESULT_COUNT,
            }))
            .send()
            .await
            .map_err(|e| SearchError::Unreachable(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(SearchError::Api(format!("http {status}: {body}")));
        }

        let parsed: SerperResponse = response
            .json()
            .await
            .map_err(|e| SearchError::Parse(e.to_string()))?;

        Ok(parsed
            .organic
            .into_iter()
            .map(|hit| SearchHit {
                title: hit.title,
                url: hit.link,
                snippet: hit.snippet,
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_query_prefers_trade_name() {
        let query = SearchQuery {
            company_name: "Exemplo Comercio de Eletronicos Ltda".to_string(),
            trade_name: Some("Exemplo Eletrônicos".to_string()),
            city: Some("São Paulo".to_string()),
        };
        assert_eq!(query.build(), "Exemplo Eletrônicos São Paulo site oficial");
    }

    #[test]
    fn test_query_falls_back_to_company_name() {
        let query = SearchQuery {
            company_name: "Exemplo Ltda".to_string(),
            trade_name: Some("   ".to_string()),
            city: None,
        };
        assert_eq!(query.build(), "Exemplo Ltda site oficial");
    }

    #[test]
    fn test_serper_response_parses_organic_hits() {
        let body = r#"{
            "organic": [
                {"title": "Exemplo", "link": "https://exemplo.com.br", "snippet": "Loja"},
                {"link": "https://outro.com.br"}
            ],
            "searchParameters": {"q": "ignored"}
        }"#;
        let parsed: SerperResponse = serde_json::from_str(body).unwrap();
        assert_eq!(parsed.organic.len(), 2);
        assert_eq!(parsed.organic[0].title, "Exemplo");
        assert_eq!(parsed.organic[1].snippet, "");
    }
}
