//! The structured company profile document and its persistence record.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Per-section size caps enforced after parsing and after merging.
pub mod caps {
    pub const ITEMS_PER_CATEGORY: usize = 60;
    pub const PRODUCT_CATEGORIES: usize = 40;
    pub const SERVICES: usize = 50;
    pub const CLIENTS: usize = 80;
    pub const PARTNERSHIPS: usize = 50;
    pub const CERTIFICATIONS: usize = 50;
    pub const CASE_STUDIES: usize = 30;
}

/// A named product category with its items.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProductCategory {
    pub name: String,
    #[serde(default)]
    pub items: Vec<String>,
}

/// Products and services offered by the company.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Offerings {
    #[serde(default)]
    pub product_categories: Vec<ProductCategory>,
    #[serde(default)]
    pub services: Vec<String>,
}

/// A customer case study of known identity (title + client).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CaseStudy {
    pub title: String,
    #[serde(default)]
    pub client: Option<String>,
    #[serde(default)]
    pub summary: Option<String>,
    #[serde(default)]
    pub outcome: Option<String>,
}

/// The structured profile extracted from scraped site content.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CompanyProfile {
    #[serde(default)]
    pub company_name: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub industry: Option<String>,
    #[serde(default)]
    pub location: Option<String>,
    #[serde(default)]
    pub offerings: Offerings,
    #[serde(default)]
    pub clients: Vec<String>,
    #[serde(default)]
    pub partnerships: Vec<String>,
    #[serde(default)]
    pub certifications: Vec<String>,
    #[serde(default)]
    pub case_studies: Vec<CaseStudy>,
}

impl CompanyProfile {
    /// True when no section carries any content.
    pub fn is_empty(&self) -> bool {
        self.company_name.is_none()
            && self.description.is_none()
            && self.industry.is_none()
            && self.location.is_none()
            && self.offerings.product_categories.is_empty()
            && self.offerings.services.is_empty()
            && self.clients.is_empty()
            && self.partnerships.is_empty()
            && self.certifications.is_empty()
            && self.case_studies.is_empty()
    }
}

/// Stage outcome of the profile build, by fraction of contributing chunks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageStatus {
    Success,
    Partial,
    Error,
}

impl StageStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Partial => "partial",
            Self::Error => "error",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "success" => Some(Self::Success),
            "partial" => Some(Self::Partial),
            "error" => Some(Self::Error),
            _ => None,
        }
    }

    /// Derive the stage status from how many chunks contributed.
    pub fn from_counts(used: u32, total: u32) -> Self {
        if total > 0 && used == total {
            Self::Success
        } else if used > 0 {
            Self::Partial
        } else {
            Self::Error
        }
    }
}

/// Persistence record for a built profile. Upserted per company key.
#[derive(Debug, Clone)]
pub struct ProfileRecord {
    pub company_key: String,
    pub profile: CompanyProfile,
    pub status: StageStatus,
    pub chunks_used: u32,
    pub chunks_total: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ProfileRecord {
    pub fn new(company_key: String, profile: CompanyProfile, used: u32, total: u32) -> Self {
        let now = Utc::now();
        Self {
            company_key,
            profile,
            status: StageStatus::from_counts(used, total),
            chunks_used: used,
            chunks_total: total,
            created_at: now,
            updated_at: now,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stage_status_from_counts() {
        assert_eq!(StageStatus::from_counts(3, 3), StageStatus::Success);
        assert_eq!(StageStatus::from_counts(2, 3), StageStatus::Partial);
        assert_eq!(StageStatus::from_counts(0, 3), StageStatus::Error);
        assert_eq!(StageStatus::from_counts(0, 0), StageStatus::Error);
    }

    #[test]
    fn test_profile_deserializes_with_missing_sections() {
        let profile: CompanyProfile =
            serde_json::from_str(r#"{"company_name": "Example Ltda"}"#).unwrap();
        assert_eq!(profile.company_name.as_deref(), Some("Example Ltda"));
        assert!(profile.offerings.product_categories.is_empty());
        assert!(!profile.is_empty());
        assert!(CompanyProfile::default().is_empty());
    }
}
