//! Strategy-driven HTTP fetching with protection-signature detection.

use std::time::Duration;

use rand::Rng;
use reqwest::Client;
use thiserror::Error;
use tracing::{debug, warn};

use super::user_agent::{random_user_agent, USER_AGENT};
use crate::models::{FetchStrategy, ProtectionKind};

/// Bodies smaller than this are treated as insufficient content.
pub const MIN_CONTENT_BYTES: usize = 256;

/// Case-insensitive substrings identifying non-content responses.
const PROTECTION_SIGNATURES: &[(&str, ProtectionKind)] = &[
    ("checking your browser", ProtectionKind::BrowserChallenge),
    ("just a moment", ProtectionKind::BrowserChallenge),
    ("cf-browser-verification", ProtectionKind::BrowserChallenge),
    ("enable javascript and cookies to continue", ProtectionKind::BrowserChallenge),
    ("ddos protection by", ProtectionKind::BrowserChallenge),
    ("attention required! | cloudflare", ProtectionKind::Waf),
    ("request unsuccessful. incapsula", ProtectionKind::Waf),
    ("blocked by the security rules", ProtectionKind::Waf),
    ("web application firewall", ProtectionKind::Waf),
    ("g-recaptcha", ProtectionKind::Captcha),
    ("h-captcha", ProtectionKind::Captcha),
    ("prove you are human", ProtectionKind::Captcha),
    ("too many requests", ProtectionKind::RateLimit),
    ("rate limit exceeded", ProtectionKind::RateLimit),
    ("access denied", ProtectionKind::BotDetection),
    ("automated access to this site", ProtectionKind::BotDetection),
    ("unusual traffic from your", ProtectionKind::BotDetection),
    ("perimeterx", ProtectionKind::BotDetection),
    ("px-captcha", ProtectionKind::BotDetection),
];

/// Scan a body for a protection signature.
pub fn classify_protection(body: &str) -> Option<ProtectionKind> {
    let lowered = body.to_lowercase();
    PROTECTION_SIGNATURES
        .iter()
        .find(|(sig, _)| lowered.contains(sig))
        .map(|(_, kind)| *kind)
}

#[derive(Error, Debug)]
pub enum FetchError {
    #[error("transport: {0}")]
    Transport(String),
    #[error("timeout after {0:?}")]
    Timeout(Duration),
    #[error("http status {0}")]
    Status(u16),
    #[error("protection detected: {}", .0.as_str())]
    ProtectionDetected(ProtectionKind),
    #[error("insufficient content ({0} bytes)")]
    InsufficientContent(usize),
    #[error("client build failed: {0}")]
    ClientBuild(String),
}

impl FetchError {
    /// Whether this failure counts toward the origin's circuit breaker.
    /// Protection pages do not: they would poison the origin's score even
    /// though the origin is reachable.
    pub fn counts_for_breaker(&self) -> bool {
        !matches!(self, Self::ProtectionDetected(_) | Self::ClientBuild(_))
    }
}

/// A successful fetch.
#[derive(Debug, Clone)]
pub struct FetchOutcome {
    pub body: String,
    pub status: u16,
    pub strategy_used: FetchStrategy,
}

/// Executes one fetch under a chosen strategy. Strategy selection lives in
/// the site prober; this type only executes what it is handed.
#[derive(Clone)]
pub struct AdaptiveFetcher {
    /// Outbound proxies. STANDARD pins the first; AGGRESSIVE rotates.
    proxies: Vec<String>,
}

impl AdaptiveFetcher {
    /// `proxy_url` accepts a single proxy or a comma-separated pool.
    pub fn new(proxy_url: Option<String>) -> Self {
        let proxies = proxy_url
            .map(|raw| {
                raw.split(',')
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();
        Self { proxies }
    }

    fn pick_proxy(&self, strategy: FetchStrategy) -> Option<&str> {
        if !strategy.via_proxy() || self.proxies.is_empty() {
            return None;
        }
        let idx = if strategy == FetchStrategy::Aggressive {
            rand::rng().random_range(0..self.proxies.len())
        } else {
            0
        };
        Some(&self.proxies[idx])
    }

    fn build_client(
        &self,
        strategy: FetchStrategy,
        user_agent: &str,
        proxy: Option<&str>,
    ) -> Result<Client, FetchError> {
        let mut builder = Client::builder()
            .user_agent(user_agent)
            .timeout(strategy.timeout())
            .gzip(true)
            .brotli(true)
            .cookie_store(true)
            .redirect(reqwest::redirect::Policy::limited(5));

        if let Some(proxy) = proxy {
            let proxy =
                reqwest::Proxy::all(proxy).map_err(|e| FetchError::ClientBuild(e.to_string()))?;
            builder = builder.proxy(proxy);
        }

        builder
            .build()
            .map_err(|e| FetchError::ClientBuild(e.to_string()))
    }

    /// Fetch a URL under the given strategy.
    ///
    /// Rotating strategies retry with a fresh browser identity on transport
    /// errors, timeouts, and protection pages; the last error wins.
    pub async fn fetch(
        &self,
        url: &str,
        strategy: FetchStrategy,
    ) -> Result<FetchOutcome, FetchError> {
        let attempts = strategy.attempts();
        let mut last_error = FetchError::Transport("no attempt made".to_string());

        for attempt in 0..attempts {
            let user_agent = if strategy.rotate_user_agent() {
                random_user_agent()
            } else {
                USER_AGENT
            };

            match self.fetch_once(url, strategy, user_agent).await {
                Ok(outcome) => return Ok(outcome),
                Err(e) => {
                    debug!(
                        "fetch {} with {} attempt {}/{} failed: {}",
                        url,
                        strategy.as_str(),
                        attempt + 1,
                        attempts,
                        e
                    );
                    last_error = e;
                }
            }
        }

        Err(last_error)
    }

    async fn fetch_once(
        &self,
        url: &str,
        strategy: FetchStrategy,
        user_agent: &str,
    ) -> Result<FetchOutcome, FetchError> {
        let client = self.build_client(strategy, user_agent, self.pick_proxy(strategy))?;

        let response = client.get(url).send().await.map_err(|e| {
            if e.is_timeout() {
                FetchError::Timeout(strategy.timeout())
            } else {
                FetchError::Transport(e.to_string())
            }
        })?;

        let status = response.status();
        let body = response.text().await.map_err(|e| {
            if e.is_timeout() {
                FetchError::Timeout(strategy.timeout())
            } else {
                FetchError::Transport(e.to_string())
            }
        })?;

        // Protection pages often arrive as 403/503 with a challenge body;
        // classify the body before judging the status code.
        if let Some(kind) = classify_protection(&body) {
            warn!("protection page from {} ({})", url, kind.as_str());
            return Err(FetchError::ProtectionDetected(kind));
        }

        if !status.is_success() {
            return Err(FetchError::Status(status.as_u16()));
        }

        if body.len() < MIN_CONTENT_BYTES {
            return Err(FetchError::InsufficientContent(body.len()));
        }

        Ok(FetchOutcome {
            body,
            status: status.as_u16(),
            strategy_used: strategy,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_protection_signatures() {
        assert_eq!(
            classify_protection("<html>Checking your browser before accessing…</html>"),
            Some(ProtectionKind::BrowserChallenge)
        );
        assert_eq!(
            classify_protection("<div class=\"g-recaptcha\" data-sitekey=\"x\"></div>"),
            Some(ProtectionKind::Captcha)
        );
        assert_eq!(
            classify_protection("HTTP 429: Too Many Requests"),
            Some(ProtectionKind::RateLimit)
        );
        assert_eq!(
            classify_protection("<html><body>Catálogo de produtos</body></html>"),
            None
        );
    }

    #[test]
    fn test_classification_is_case_insensitive() {
        assert_eq!(
            classify_protection("JUST A MOMENT..."),
            Some(ProtectionKind::BrowserChallenge)
        );
    }

    #[test]
    fn test_proxy_pool_parsing() {
        let fetcher = AdaptiveFetcher::new(Some(
            "socks5://10.0.0.1:1080, socks5://10.0.0.2:1080".to_string(),
        ));
        assert_eq!(fetcher.proxies.len(), 2);
        assert_eq!(
            fetcher.pick_proxy(FetchStrategy::Standard),
            Some("socks5://10.0.0.1:1080")
        );
        assert!(fetcher.pick_proxy(FetchStrategy::Aggressive).is_some());
        assert_eq!(fetcher.pick_proxy(FetchStrategy::Fast), None);

        let bare = AdaptiveFetcher::new(None);
        assert_eq!(bare.pick_proxy(FetchStrategy::Aggressive), None);
    }

    #[test]
    fn test_protection_does_not_count_for_breaker() {
        assert!(!FetchError::ProtectionDetected(ProtectionKind::Waf).counts_for_breaker());
        assert!(FetchError::Status(500).counts_for_breaker());
        assert!(FetchError::Timeout(Duration::from_secs(8)).counts_for_breaker());
        assert!(FetchError::InsufficientContent(12).counts_for_breaker());
    }
}
