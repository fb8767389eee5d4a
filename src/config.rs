//! Configuration management. Everything comes from the environment, loaded
//! once at startup; missing required values abort the process.

use std::path::PathBuf;

use thiserror::Error;

use crate::llm::VendorConfig;

/// Default number of workers per stage type.
pub const DEFAULT_WORKERS_PER_TYPE: usize = 2;

/// Default hard cap on in-flight model calls across all vendors.
pub const DEFAULT_LLM_HARD_CAP: usize = 32;

/// Default in-site link budget for the scrape stage.
pub const DEFAULT_LINK_BUDGET: usize = 30;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("missing required environment variable: {0}")]
    MissingVar(&'static str),
    #[error("invalid value for {var}: {value}")]
    Invalid { var: &'static str, value: String },
    #[error("no language-model vendor configured (set LLM_URL and MODEL_NAME)")]
    NoVendor,
}

/// Runtime settings resolved from the environment.
#[derive(Debug, Clone)]
pub struct Settings {
    /// Database URL; a path or a `sqlite:`-prefixed URL.
    pub database_url: String,
    /// Serper search API key.
    pub search_key: String,
    /// Shared secret for the HTTP facade. When unset, auth is disabled.
    pub api_access_token: Option<String>,
    /// Workers per stage type (discovery and profile).
    pub n_workers: usize,
    /// Upper bound on concurrently open database connections.
    pub database_pool_max_size: usize,
    /// Hard cap on in-flight model calls across all vendors.
    pub llm_concurrency_hard_cap: usize,
    /// Outbound proxy used by the STANDARD and AGGRESSIVE fetch strategies.
    pub proxy_url: Option<String>,
    /// Listen address for the HTTP facade.
    pub bind_addr: String,
    /// Link budget for subpage selection during scraping.
    pub link_budget: usize,
    /// Configured model vendors in priority order.
    pub vendors: Vec<VendorConfig>,
}

impl Settings {
    /// Resolve settings from the environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        let database_url = std::env::var("DATABASE_URL")
            .map_err(|_| ConfigError::MissingVar("DATABASE_URL"))?;
        let search_key =
            std::env::var("SEARCH_KEY").map_err(|_| ConfigError::MissingVar("SEARCH_KEY"))?;

        let n_workers = parse_var("N_WORKERS", DEFAULT_WORKERS_PER_TYPE)?;
        // Two stage types plus the facade's synchronous stages.
        let default_pool = 2 * n_workers + 2;
        let database_pool_max_size = parse_var("DATABASE_POOL_MAX_SIZE", default_pool)?;
        let llm_concurrency_hard_cap =
            parse_var("LLM_CONCURRENCY_HARD_CAP", DEFAULT_LLM_HARD_CAP)?;

        let vendors = VendorConfig::from_env();
        if vendors.is_empty() {
            return Err(ConfigError::NoVendor);
        }

        Ok(Self {
            database_url,
            search_key,
            api_access_token: std::env::var("API_ACCESS_TOKEN").ok(),
            n_workers,
            database_pool_max_size,
            llm_concurrency_hard_cap,
            proxy_url: std::env::var("PROXY_URL").ok(),
            bind_addr: std::env::var("BIND_ADDR").unwrap_or_else(|_| "0.0.0.0:8080".to_string()),
            link_budget: parse_var("LINK_BUDGET", DEFAULT_LINK_BUDGET)?,
            vendors,
        })
    }

    /// Filesystem path of the sqlite database, with any `sqlite:` prefix stripped.
    pub fn db_path(&self) -> PathBuf {
        let url = self
            .database_url
            .strip_prefix("sqlite://")
            .or_else(|| self.database_url.strip_prefix("sqlite:"))
            .unwrap_or(&self.database_url);
        PathBuf::from(url)
    }
}

fn parse_var<T: std::str::FromStr>(var: &'static str, default: T) -> Result<T, ConfigError> {
    match std::env::var(var) {
        Ok(value) => value
            .parse()
            .map_err(|_| ConfigError::Invalid { var, value }),
        Err(_) => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_db_path_strips_sqlite_prefix() {
        let mut settings = Settings {
            database_url: "sqlite:/tmp/f.db".to_string(),
            search_key: String::new(),
            api_access_token: None,
            n_workers: 2,
            database_pool_max_size: 6,
            llm_concurrency_hard_cap: 32,
            proxy_url: None,
            bind_addr: "0.0.0.0:8080".to_string(),
            link_budget: 30,
            vendors: Vec::new(),
        };
        assert_eq!(settings.db_path(), PathBuf::from("/tmp/f.db"));

        settings.database_url = "sqlite:///tmp/f.db".to_string();
        assert_eq!(settings.db_path(), PathBuf::from("/tmp/f.db"));

        settings.database_url = "/tmp/plain.db".to_string();
        assert_eq!(settings.db_path(), PathBuf::from("/tmp/plain.db"));
    }
}
