//! Vendor configuration for the structured-output caller.

use serde::{Deserialize, Serialize};

/// Configuration for one model vendor (an OpenAI-compatible endpoint).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VendorConfig {
    /// Stable vendor name used for rate buckets and logging.
    pub name: String,
    /// Base URL, e.g. `http://llm-host:8000`.
    pub endpoint: String,
    pub model: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
    /// Concurrent in-flight calls allowed against this vendor.
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: usize,
    /// Vendor-side output token ceiling.
    #[serde(default = "default_max_output_tokens")]
    pub max_output_tokens: u32,
    /// Whether the vendor accepts a structured-output schema directive.
    #[serde(default = "default_true")]
    pub supports_schema: bool,
    /// Whether the vendor accepts sampling controls (penalties etc).
    #[serde(default = "default_true")]
    pub supports_sampling: bool,
    /// Attempts against this vendor before falling back to the next.
    #[serde(default = "default_attempts")]
    pub attempts: u32,
    /// Pacing into the vendor, fed to the rate gate.
    #[serde(default = "default_requests_per_sec")]
    pub requests_per_sec: f64,
    #[serde(default = "default_burst")]
    pub burst: f64,
}

fn default_max_concurrent() -> usize {
    8
}

fn default_max_output_tokens() -> u32 {
    4096
}

fn default_true() -> bool {
    true
}

fn default_attempts() -> u32 {
    3
}

fn default_requests_per_sec() -> f64 {
    2.0
}

fn default_burst() -> f64 {
    4.0
}

impl VendorConfig {
    fn from_vars(name: &str, url_var: &str, model_var: &str, key_var: &str) -> Option<Self> {
        let endpoint = std::env::var(url_var).ok()?;
        let model = std::env::var(model_var).ok()?;
        Some(Self {
            name: name.to_string(),
            endpoint: endpoint.trim_end_matches('/').to_string(),
            model,
            api_key: std::env::var(key_var).ok(),
            max_concurrent: default_max_concurrent(),
            max_output_tokens: default_max_output_tokens(),
            supports_schema: true,
            supports_sampling: true,
            attempts: default_attempts(),
            requests_per_sec: default_requests_per_sec(),
            burst: default_burst(),
        })
    }

    /// Vendors in priority order from the environment.
    ///
    /// `LLM_URL`/`MODEL_NAME` configure the primary vendor; the optional
    /// `LLM_URL_2`/`MODEL_NAME_2` pair configures the fallback.
    pub fn from_env() -> Vec<Self> {
        let mut vendors = Vec::new();
        if let Some(primary) = Self::from_vars("primary", "LLM_URL", "MODEL_NAME", "LLM_API_KEY") {
            vendors.push(primary);
        }
        if let Some(secondary) =
            Self::from_vars("secondary", "LLM_URL_2", "MODEL_NAME_2", "LLM_API_KEY_2")
        {
            vendors.push(secondary);
        }
        vendors
    }

    pub fn chat_url(&self) -> String {
        format!("{}/v1/chat/completions", self.endpoint)
    }
}
