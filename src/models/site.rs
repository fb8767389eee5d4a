//! Fetch strategies and per-origin site knowledge.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A named bundle of fetch parameters, ordered from cheapest to heaviest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FetchStrategy {
    /// Direct request with a short timeout.
    Fast,
    /// Via proxy with a medium timeout.
    Standard,
    /// Retries with user-agent rotation.
    Robust,
    /// Proxy plus user-agent rotation, longest timeout.
    Aggressive,
}

impl FetchStrategy {
    /// Candidate order from cheapest to heaviest.
    pub const ALL: [FetchStrategy; 4] = [
        FetchStrategy::Fast,
        FetchStrategy::Standard,
        FetchStrategy::Robust,
        FetchStrategy::Aggressive,
    ];

    pub fn timeout(&self) -> Duration {
        match self {
            Self::Fast => Duration::from_secs(8),
            Self::Standard => Duration::from_secs(15),
            Self::Robust => Duration::from_secs(20),
            Self::Aggressive => Duration::from_secs(30),
        }
    }

    pub fn via_proxy(&self) -> bool {
        matches!(self, Self::Standard | Self::Aggressive)
    }

    pub fn rotate_user_agent(&self) -> bool {
        matches!(self, Self::Robust | Self::Aggressive)
    }

    /// Attempts made with rotated identities before giving up.
    pub fn attempts(&self) -> u32 {
        if self.rotate_user_agent() {
            3
        } else {
            1
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Fast => "fast",
            Self::Standard => "standard",
            Self::Robust => "robust",
            Self::Aggressive => "aggressive",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "fast" => Some(Self::Fast),
            "standard" => Some(Self::Standard),
            "robust" => Some(Self::Robust),
            "aggressive" => Some(Self::Aggressive),
            _ => None,
        }
    }
}

/// Category of non-content response recognized in a fetched body.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProtectionKind {
    BrowserChallenge,
    Waf,
    Captcha,
    RateLimit,
    BotDetection,
}

impl ProtectionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::BrowserChallenge => "browser_challenge",
            Self::Waf => "waf",
            Self::Captcha => "captcha",
            Self::RateLimit => "rate_limit",
            Self::BotDetection => "bot_detection",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "browser_challenge" => Some(Self::BrowserChallenge),
            "waf" => Some(Self::Waf),
            "captcha" => Some(Self::Captcha),
            "rate_limit" => Some(Self::RateLimit),
            "bot_detection" => Some(Self::BotDetection),
            _ => None,
        }
    }
}

/// Rendering classification of the chosen site.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SiteType {
    Static,
    Spa,
    Hybrid,
    Unknown,
}

impl SiteType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Static => "static",
            Self::Spa => "spa",
            Self::Hybrid => "hybrid",
            Self::Unknown => "unknown",
        }
    }
}

/// Advisory per-origin fetch knowledge. Consulted by the site prober,
/// updated by the scrape pipeline.
#[derive(Debug, Clone)]
pub struct SiteKnowledge {
    /// scheme + host, e.g. `https://www.example.com.br`.
    pub origin: String,
    pub best_strategy: Option<FetchStrategy>,
    pub protection: Option<ProtectionKind>,
    pub success_count: u64,
    pub failure_count: u64,
    pub last_success_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

impl SiteKnowledge {
    pub fn success_rate(&self) -> f64 {
        let total = self.success_count + self.failure_count;
        if total == 0 {
            return 0.0;
        }
        self.success_count as f64 / total as f64
    }
}
