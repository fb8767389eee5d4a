//! Detection of degenerate model output.
//!
//! Catches runaway decodes in flight: n-gram loops, repeated long
//! substrings, and outputs that ran out of budget before closing the JSON
//! object. The schema-side caps are only hints; this detector and the
//! post-parse normalization enforce the real invariants.

use std::collections::HashMap;

/// A 4-gram repeated more than this many times trips the detector.
const MAX_NGRAM_REPEATS: usize = 8;

/// A 30-character substring repeated more than this many times trips it.
const MAX_SUBSTRING_REPEATS: usize = 5;
const SUBSTRING_WINDOW: usize = 30;

/// Outputs longer than this must end with the outermost closing brace.
const UNTERMINATED_MIN_LEN: usize = 3000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Degeneration {
    RepeatedNgram,
    RepeatedSubstring,
    Unterminated,
}

impl Degeneration {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::RepeatedNgram => "repeated_ngram",
            Self::RepeatedSubstring => "repeated_substring",
            Self::Unterminated => "unterminated",
        }
    }
}

/// Scan an emitted string for degeneration patterns.
pub fn detect(output: &str) -> Option<Degeneration> {
    if has_repeated_ngram(output) {
        return Some(Degeneration::RepeatedNgram);
    }
    if has_repeated_substring(output) {
        return Some(Degeneration::RepeatedSubstring);
    }
    if is_unterminated(output) {
        return Some(Degeneration::Unterminated);
    }
    None
}

fn has_repeated_ngram(output: &str) -> bool {
    let tokens: Vec<&str> = output.split_whitespace().collect();
    if tokens.len() < 4 {
        return false;
    }
    let mut counts: HashMap<[&str; 4], usize> = HashMap::new();
    for window in tokens.windows(4) {
        let gram = [window[0], window[1], window[2], window[3]];
        let count = counts.entry(gram).or_insert(0);
        *count += 1;
        if *count > MAX_NGRAM_REPEATS {
            return true;
        }
    }
    false
}

fn has_repeated_substring(output: &str) -> bool {
    let indices: Vec<usize> = output.char_indices().map(|(i, _)| i).collect();
    if indices.len() < SUBSTRING_WINDOW {
        return false;
    }
    let mut counts: HashMap<&str, usize> = HashMap::new();
    for start in 0..=(indices.len() - SUBSTRING_WINDOW) {
        let begin = indices[start];
        let end = indices
            .get(start + SUBSTRING_WINDOW)
            .copied()
            .unwrap_or(output.len());
        let window = &output[begin..end];
        let count = counts.entry(window).or_insert(0);
        *count += 1;
        if *count > MAX_SUBSTRING_REPEATS {
            return true;
        }
    }
    false
}

fn is_unterminated(output: &str) -> bool {
    output.len() > UNTERMINATED_MIN_LEN && !output.trim_end().ends_with('}')
}
