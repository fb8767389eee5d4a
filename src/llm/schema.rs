//! JSON schemas passed to vendors as structured-output directives.
//!
//! The sizing caps (`maxItems`, `uniqueItems`) are advisory hints to the
//! decoder; the post-parse normalization enforces the real limits.

use serde_json::{json, Value};

use crate::models::caps;

/// Schema for the site-discovery decision.
pub fn discovery_schema() -> Value {
    json!({
        "type": "object",
        "properties": {
            "chosen_url": { "type": ["string", "null"] },
            "status": { "type": "string", "enum": ["found", "not_found", "error"] },
            "confidence": { "type": "number", "minimum": 0.0, "maximum": 1.0 },
            "reasoning": { "type": ["string", "null"] }
        },
        "required": ["status", "confidence"],
        "additionalProperties": false
    })
}

/// Schema for link ranking during scraping.
pub fn link_ranking_schema(budget: usize) -> Value {
    json!({
        "type": "object",
        "properties": {
            "ranked_urls": {
                "type": "array",
                "items": { "type": "string" },
                "maxItems": budget,
                "uniqueItems": true
            }
        },
        "required": ["ranked_urls"],
        "additionalProperties": false
    })
}

/// Schema for the extracted company profile.
pub fn profile_schema() -> Value {
    let capped_string_list = |max: usize| {
        json!({
            "type": "array",
            "items": { "type": "string" },
            "maxItems": max,
            "uniqueItems": true
        })
    };

    json!({
        "type": "object",
        "properties": {
            "company_name": { "type": ["string", "null"] },
            "description": { "type": ["string", "null"] },
            "industry": { "type": ["string", "null"] },
            "location": { "type": ["string", "null"] },
            "offerings": {
                "type": "object",
                "properties": {
                    "product_categories": {
                        "type": "array",
                        "maxItems": caps::PRODUCT_CATEGORIES,
                        "items": {
                            "type": "object",
                            "properties": {
                                "name": { "type": "string" },
                                "items": capped_string_list(caps::ITEMS_PER_CATEGORY)
                            },
                            "required": ["name"],
                            "additionalProperties": false
                        }
                    },
                    "services": capped_string_list(caps::SERVICES)
                },
                "additionalProperties": false
            },
            "clients": capped_string_list(caps::CLIENTS),
            "partnerships": capped_string_list(caps::PARTNERSHIPS),
            "certifications": capped_string_list(caps::CERTIFICATIONS),
            "case_studies": {
                "type": "array",
                "maxItems": caps::CASE_STUDIES,
                "items": {
                    "type": "object",
                    "properties": {
                        "title": { "type": "string" },
                        "client": { "type": ["string", "null"] },
                        "summary": { "type": ["string", "null"] },
                        "outcome": { "type": ["string", "null"] }
                    },
                    "required": ["title"],
                    "additionalProperties": false
                }
            }
        },
        "additionalProperties": false
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_profile_schema_carries_cap_hints() {
        let schema = profile_schema();
        assert_eq!(
            schema["properties"]["clients"]["maxItems"],
            caps::CLIENTS
        );
        assert_eq!(
            schema["properties"]["offerings"]["properties"]["product_categories"]["maxItems"],
            caps::PRODUCT_CATEGORIES
        );
    }

    #[test]
    fn test_discovery_schema_statuses() {
        let schema = discovery_schema();
        let statuses = schema["properties"]["status"]["enum"].as_array().unwrap();
        assert_eq!(statuses.len(), 3);
    }
}
