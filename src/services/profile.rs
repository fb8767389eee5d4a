//! Profile extraction and merging.
//!
//! Each chunk goes through the model with a stable system prompt; the
//! parsed output is normalized unconditionally (the model is never
//! trusted), then merged into the accumulated profile. Chunks are
//! processed sequentially so the merge is deterministic.

use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};

use crate::llm::{schema, CallContext, ChatMessage, LlmError, StructuredCaller};
use crate::models::{caps, CaseStudy, CompanyProfile, ProfileRecord, ScrapedChunk};

/// Deadline for one chunk's model call.
const CHUNK_DEADLINE: Duration = Duration::from_secs(120);

const SYSTEM_PROMPT: &str = "\
Você extrai o perfil estruturado de uma empresa brasileira B2B a partir do \
texto do site dela. Regras:\n\
- Responda em português brasileiro.\n\
- Produtos são bens vendidos; serviços são atividades prestadas. Não misture.\n\
- Limites rígidos: 60 itens por categoria de produto, 40 categorias, 50 \
serviços, 80 clientes, 50 parcerias, 50 certificações, 30 cases.\n\
- Se 5 itens consecutivos compartilharem o mesmo prefixo (ex.: \"Cabo X\", \
\"Cabo X 1\", \"Cabo X 2\"), pare a lista nesse ponto.\n\
- Não invente dados que não estejam no texto.\n\
- Retorne somente o objeto JSON.";

/// Runs chunks through the model and merges the partial profiles.
pub struct ProfileExtractor {
    caller: Arc<StructuredCaller>,
}

impl ProfileExtractor {
    pub fn new(caller: Arc<StructuredCaller>) -> Self {
        Self { caller }
    }

    /// Extract a partial profile from one chunk.
    pub async fn extract_chunk(&self, chunk: &ScrapedChunk) -> Result<CompanyProfile, LlmError> {
        let user = format!(
            "Texto do site (parte {}/{}):\n\n{}",
            chunk.chunk_index + 1,
            chunk.chunk_total,
            chunk.content
        );
        let messages = [ChatMessage::system(SYSTEM_PROMPT), ChatMessage::user(user)];
        let ctx = CallContext::for_input(chunk.token_count);

        let mut profile: CompanyProfile = self
            .caller
            .call(&messages, &schema::profile_schema(), ctx)
            .await?;
        normalize(&mut profile);
        Ok(profile)
    }

    /// Build the merged profile for a company from its chunk set.
    ///
    /// A chunk whose call fails terminally is skipped; the merge proceeds
    /// and the record's status reflects the contributed fraction.
    pub async fn build_profile(
        &self,
        company_key: &str,
        chunks: &[ScrapedChunk],
    ) -> ProfileRecord {
        let mut merged = CompanyProfile::default();
        let mut used = 0u32;

        for chunk in chunks {
            let outcome =
                tokio::time::timeout(CHUNK_DEADLINE, self.extract_chunk(chunk)).await;
            match outcome {
                Ok(Ok(partial)) => {
                    merge(&mut merged, partial);
                    used += 1;
                }
                Ok(Err(e)) => {
                    warn!(
                        "{}: chunk {}/{} skipped: {}",
                        company_key,
                        chunk.chunk_index + 1,
                        chunk.chunk_total,
                        e
                    );
                }
                Err(_) => {
                    warn!(
                        "{}: chunk {}/{} skipped: deadline exceeded",
                        company_key,
                        chunk.chunk_index + 1,
                        chunk.chunk_total
                    );
                }
            }
        }

        normalize(&mut merged);
        let record =
            ProfileRecord::new(company_key.to_string(), merged, used, chunks.len() as u32);
        info!(
            "{}: profile {} ({}/{} chunks)",
            company_key,
            record.status.as_str(),
            used,
            chunks.len()
        );
        record
    }
}

/// Case-folded whitespace-normalized identity of a list item.
fn dedup_key(value: &str) -> String {
    value.split_whitespace().collect::<Vec<_>>().join(" ").to_lowercase()
}

/// Drop later duplicates, preserving first occurrence.
fn dedup_list(items: &mut Vec<String>) {
    let mut seen = std::collections::HashSet::new();
    items.retain(|item| seen.insert(dedup_key(item)));
}

/// The first three words of an item, case-folded.
fn prefix_key(item: &str) -> String {
    item.split_whitespace()
        .take(3)
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

/// Anti-template pass for product items: once any 3-word prefix has
/// admitted five items, further items sharing it are dropped.
fn apply_anti_template(items: &mut Vec<String>, cap: usize) {
    let mut prefix_counts: std::collections::HashMap<String, usize> =
        std::collections::HashMap::new();
    let mut kept = Vec::with_capacity(items.len().min(cap));

    for item in items.drain(..) {
        if kept.len() >= cap {
            break;
        }
        let prefix = prefix_key(&item);
        let count = prefix_counts.entry(prefix).or_insert(0);
        if *count >= 5 {
            continue;
        }
        *count += 1;
        kept.push(item);
    }
    *items = kept;
}

/// Unconditional post-parse normalization: dedup, anti-template, caps.
pub fn normalize(profile: &mut CompanyProfile) {
    for category in &mut profile.offerings.product_categories {
        dedup_list(&mut category.items);
        apply_anti_template(&mut category.items, caps::ITEMS_PER_CATEGORY);
    }
    // Empty categories carry no information.
    let mut seen = std::collections::HashSet::new();
    profile
        .offerings
        .product_categories
        .retain(|c| !c.name.trim().is_empty() && seen.insert(dedup_key(&c.name)));
    profile
        .offerings
        .product_categories
        .truncate(caps::PRODUCT_CATEGORIES);

    dedup_list(&mut profile.offerings.services);
    profile.offerings.services.truncate(caps::SERVICES);
    dedup_list(&mut profile.clients);
    profile.clients.truncate(caps::CLIENTS);
    dedup_list(&mut profile.partnerships);
    profile.partnerships.truncate(caps::PARTNERSHIPS);
    dedup_list(&mut profile.certifications);
    profile.certifications.truncate(caps::CERTIFICATIONS);

    let mut seen_cases = std::collections::HashSet::new();
    profile
        .case_studies
        .retain(|c| !c.title.trim().is_empty() && seen_cases.insert(case_key(c)));
    profile.case_studies.truncate(caps::CASE_STUDIES);
}

fn case_key(case: &CaseStudy) -> String {
    format!(
        "{}|{}",
        dedup_key(&case.title),
        dedup_key(case.client.as_deref().unwrap_or(""))
    )
}

/// Merge a later chunk's profile into the accumulator.
///
/// Scalars: first non-null wins, except the description, where a strictly
/// longer later value replaces the earlier one. Lists: union with the
/// dedup key. Case studies: keyed on title + client, conflicting fields
/// resolved by longer-non-null.
pub fn merge(acc: &mut CompanyProfile, next: CompanyProfile) {
    merge_scalar(&mut acc.company_name, next.company_name);
    merge_longest(&mut acc.description, next.description);
    merge_scalar(&mut acc.industry, next.industry);
    merge_scalar(&mut acc.location, next.location);

    for category in next.offerings.product_categories {
        match acc
            .offerings
            .product_categories
            .iter_mut()
            .find(|c| dedup_key(&c.name) == dedup_key(&category.name))
        {
            Some(existing) => existing.items.extend(category.items),
            None => acc.offerings.product_categories.push(category),
        }
    }
    acc.offerings.services.extend(next.offerings.services);
    acc.clients.extend(next.clients);
    acc.partnerships.extend(next.partnerships);
    acc.certifications.extend(next.certifications);

    for case in next.case_studies {
        match acc
            .case_studies
            .iter_mut()
            .find(|c| case_key(c) == case_key(&case))
        {
            Some(existing) => {
                merge_longest(&mut existing.summary, case.summary);
                merge_longest(&mut existing.outcome, case.outcome);
                merge_scalar(&mut existing.client, case.client);
            }
            None => acc.case_studies.push(case),
        }
    }

    // Caps and dedup re-apply after every merge.
    normalize(acc);
}

fn merge_scalar(acc: &mut Option<String>, next: Option<String>) {
    if acc.as_deref().map(str::trim).unwrap_or("").is_empty() {
        if let Some(next) = next.filter(|s| !s.trim().is_empty()) {
            *acc = Some(next);
        }
    }
}

fn merge_longest(acc: &mut Option<String>, next: Option<String>) {
    let Some(next) = next.filter(|s| !s.trim().is_empty()) else {
        return;
    };
    let replace = match acc.as_deref() {
        Some(current) => next.chars().count() > current.chars().count(),
        None => true,
    };
    if replace {
        *acc = Some(next);
    }
}
