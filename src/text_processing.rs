//! # Text Processing Module
//!
//! Canonicalization and string-similarity primitives shared by every component
//! of the layout learning engine.
//!
//! ## Features
//!
//! - Case/space/punctuation-insensitive normalization (`normalize`)
//! - Classic Levenshtein distance with unit costs (`edit_distance`)
//! - Length-normalized similarity in `[0, 1]` (`similarity`)
//! - Bidirectional containment-or-similarity test (`fuzzy_contains`)
//! - Word splitting that collapses dotted abbreviations (`split_words`)
//! - Line-item description normalization keeping accented letters (`normalize_description`)
//!
//! All functions are pure and deterministic.

use lazy_static::lazy_static;
use regex::Regex;

lazy_static! {
    /// Separators between words of a corrected value
    static ref WORD_SEPARATORS: Regex = Regex::new(r"[\s,;:/\\|_\-()]+").unwrap();
    /// Runs of anything that is not a letter or digit
    static ref NON_ALNUM_RUN: Regex = Regex::new(r"[^\p{L}\p{N}]+").unwrap();
}

/// Default threshold for [`fuzzy_contains`]
pub const DEFAULT_FUZZY_THRESHOLD: f64 = 0.6;

/// Lowercase string retaining only letters and digits, order preserved
pub fn normalize(s: &str) -> String {
    s.chars()
        .filter(|c| c.is_alphanumeric())
        .flat_map(|c| c.to_lowercase())
        .collect()
}

/// Levenshtein distance over characters (unit insert/delete/substitute cost)
pub fn edit_distance(a: &str, b: &str) -> usize {
    let a_chars: Vec<char> = a.chars().collect();
    let b_chars: Vec<char> = b.chars().collect();

    if a_chars.is_empty() {
        return b_chars.len();
    }
    if b_chars.is_empty() {
        return a_chars.len();
    }

    // Two rolling rows of the classic dynamic-programming matrix
    let mut previous: Vec<usize> = (0..=b_chars.len()).collect();
    let mut current = vec![0; b_chars.len() + 1];

    for (i, ca) in a_chars.iter().enumerate() {
        current[0] = i + 1;
        for (j, cb) in b_chars.iter().enumerate() {
            let cost = if ca == cb { 0 } else { 1 };
            current[j + 1] = (previous[j + 1] + 1)
                .min(current[j] + 1)
                .min(previous[j] + cost);
        }
        std::mem::swap(&mut previous, &mut current);
    }

    previous[b_chars.len()]
}

/// Similarity of two already-canonical strings: `1 - distance / max(len)`
pub fn ratio(a: &str, b: &str) -> f64 {
    let len_a = a.chars().count();
    let len_b = b.chars().count();
    match (len_a, len_b) {
        (0, 0) => 1.0,
        (0, _) | (_, 0) => 0.0,
        _ => 1.0 - edit_distance(a, b) as f64 / len_a.max(len_b) as f64,
    }
}

/// Similarity of the normalized forms of `a` and `b`
///
/// 1.0 when both normalize to empty, 0.0 when exactly one does.
pub fn similarity(a: &str, b: &str) -> f64 {
    ratio(&normalize(a), &normalize(b))
}

/// True if the normalized strings contain one another, or are similar enough
pub fn fuzzy_contains(haystack: &str, needle: &str, threshold: f64) -> bool {
    let h = normalize(haystack);
    let n = normalize(needle);
    if h.contains(&n) || n.contains(&h) {
        return true;
    }
    ratio(&h, &n) >= threshold
}

/// Split a value into normalized words
///
/// Periods are removed rather than treated as separators so abbreviations such
/// as `S.L.` collapse into a single word (`sl`).
pub fn split_words(text: &str) -> Vec<String> {
    let without_periods = text.replace('.', "");
    WORD_SEPARATORS
        .split(&without_periods)
        .map(normalize)
        .filter(|w| !w.is_empty())
        .collect()
}

/// Normalize a line-item description: lowercase, letters (accented included)
/// and digits, with separator runs collapsed to a single space
pub fn normalize_description(s: &str) -> String {
    let lowered = s.to_lowercase();
    NON_ALNUM_RUN.replace_all(&lowered, " ").trim().to_string()
}

/// Keep only ASCII digits
pub fn digits_only(s: &str) -> String {
    s.chars().filter(|c| c.is_ascii_digit()).collect()
}

/// Fraction of characters that are digits (0.0 for empty strings)
pub fn numeric_ratio(s: &str) -> f64 {
    let total = s.chars().count();
    if total == 0 {
        return 0.0;
    }
    s.chars().filter(|c| c.is_ascii_digit()).count() as f64 / total as f64
}
