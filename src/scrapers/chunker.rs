//! Deduplication and token-bounded chunking of aggregated site text.
//!
//! Corporate sites repeat navigation and footer blocks on every page, so
//! line-level deduplication across pages runs first; the survivors are
//! packed greedily into chunks that respect the model-input budget. Cuts
//! fall on page boundaries first, then paragraph boundaries, then line
//! boundaries, never inside a line.

use thiserror::Error;

use crate::repository::ChunkDraft;

/// Effective token budget per chunk; prompt and response overhead is
/// already subtracted from the model's context window.
pub const MAX_CHUNK_TOKENS: u32 = 14_700;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum ChunkError {
    #[error("single line of {0} tokens exceeds the chunk budget")]
    OversizedLine(u32),
    #[error("chunk {index} holds {tokens} tokens, over the {max} budget")]
    OverBudget { index: u32, tokens: u32, max: u32 },
}

/// Text fetched from one page.
#[derive(Debug, Clone)]
pub struct PageText {
    pub url: String,
    pub text: String,
}

/// Rough token estimate: four characters per token.
pub fn estimate_tokens(text: &str) -> u32 {
    (text.chars().count().div_ceil(4)).max(1) as u32
}

/// Collapse line-level duplicates across pages, preserving first occurrence.
/// Blank lines are kept; only non-blank lines are deduplicated.
pub fn deduplicate(pages: &[PageText]) -> Vec<PageText> {
    let mut seen = std::collections::HashSet::new();
    let mut result = Vec::with_capacity(pages.len());

    for page in pages {
        let mut kept = Vec::new();
        for line in page.text.trim_end().split('\n') {
            let key = line.trim();
            if key.is_empty() {
                kept.push(line);
                continue;
            }
            if seen.insert(key.to_string()) {
                kept.push(line);
            }
        }
        // Pages whose every line was already seen contribute nothing.
        if kept.iter().any(|l| !l.trim().is_empty()) {
            result.push(PageText {
                url: page.url.clone(),
                text: kept.join("\n"),
            });
        }
    }

    result
}

/// The canonical aggregate text of the deduplicated pages: every line with
/// a trailing newline. Chunk contents concatenate back to exactly this.
pub fn aggregate(pages: &[PageText]) -> String {
    let mut out = String::new();
    for page in pages {
        for line in page.text.split('\n') {
            out.push_str(line);
            out.push('\n');
        }
    }
    out
}

struct Line {
    text: String,
    url_index: usize,
    page_start: bool,
    blank: bool,
}

/// Deduplicate, then pack into token-bounded chunks.
pub fn chunk_pages(pages: &[PageText], max_tokens: u32) -> Result<Vec<ChunkDraft>, ChunkError> {
    let pages = deduplicate(pages);
    let mut urls: Vec<String> = Vec::new();
    let mut lines: Vec<Line> = Vec::new();

    for page in &pages {
        urls.push(page.url.clone());
        let url_index = urls.len() - 1;
        for (i, line) in page.text.split('\n').enumerate() {
            lines.push(Line {
                text: line.to_string(),
                url_index,
                page_start: i == 0,
                blank: line.trim().is_empty(),
            });
        }
    }

    if lines.is_empty() {
        return Ok(Vec::new());
    }

    // prefix[i] = characters (including trailing newlines) of lines[..i].
    let mut prefix = Vec::with_capacity(lines.len() + 1);
    let mut running = 0usize;
    prefix.push(running);
    for line in &lines {
        running += line.text.chars().count() + 1;
        prefix.push(running);
    }
    let tokens_of = |chars: usize| (chars.div_ceil(4)) as u32;

    let mut boundaries = Vec::new();
    let mut start = 0usize;

    for i in 0..lines.len() {
        loop {
            let span = prefix[i + 1] - prefix[start];
            if tokens_of(span) <= max_tokens {
                break;
            }
            if start == i {
                return Err(ChunkError::OversizedLine(tokens_of(span)));
            }
            let cut = best_cut(&lines, start, i);
            boundaries.push((start, cut));
            start = cut;
        }
    }
    boundaries.push((start, lines.len()));

    let total = boundaries.len() as u32;
    let mut chunks = Vec::with_capacity(boundaries.len());
    for (index, (from, to)) in boundaries.into_iter().enumerate() {
        let mut content = String::with_capacity(prefix[to] - prefix[from]);
        let mut source_urls: Vec<String> = Vec::new();
        for line in &lines[from..to] {
            content.push_str(&line.text);
            content.push('\n');
            let url = &urls[line.url_index];
            if source_urls.last() != Some(url) && !source_urls.contains(url) {
                source_urls.push(url.clone());
            }
        }

        let token_count = tokens_of(prefix[to] - prefix[from]);
        if token_count > max_tokens {
            return Err(ChunkError::OverBudget {
                index: index as u32,
                tokens: token_count,
                max: max_tokens,
            });
        }

        chunks.push(ChunkDraft {
            chunk_index: index as u32,
            chunk_total: total,
            content,
            token_count,
            source_urls,
        });
    }

    Ok(chunks)
}

/// Best cut index in (start, current]: the latest page boundary, failing
/// that the latest paragraph boundary, failing that before the current line.
fn best_cut(lines: &[Line], start: usize, current: usize) -> usize {
    let mut paragraph_cut = None;
    for j in (start + 1..=current).rev() {
        if lines[j].page_start {
            return j;
        }
        if paragraph_cut.is_none() && lines[j - 1].blank {
            paragraph_cut = Some(j);
        }
    }
    paragraph_cut.unwrap_or(current)
}
