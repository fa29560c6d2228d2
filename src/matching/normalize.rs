// src/matching/normalize.rs
//! Deterministic canonicalization of region and division names.

use once_cell::sync::Lazy;
use regex::Regex;
use unicode_normalization::char::is_combining_mark;
use unicode_normalization::UnicodeNormalization;

use crate::utils::constants::{ADMINISTRATIVE_PREFIXES, ADMINISTRATIVE_SUFFIXES};

static TRAILING_PARENS: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\s*\([^()]*\)\s*$").expect("valid trailing-parenthesis regex"));

/// Tokens that carry no meaning on their own once a suffix is removed.
const FILLER_TOKENS: [&str; 6] = ["of", "the", "de", "del", "la", "and"];

/// Letters that do not decompose into base + combining mark.
fn replace_special_letter(c: char) -> Option<&'static str> {
    match c {
        'ß' => Some("ss"),
        'æ' | 'Æ' => Some("ae"),
        'œ' | 'Œ' => Some("oe"),
        'ø' | 'Ø' => Some("o"),
        'ł' | 'Ł' => Some("l"),
        'đ' | 'Đ' => Some("d"),
        'ð' | 'Ð' => Some("d"),
        'þ' | 'Þ' => Some("th"),
        'ı' => Some("i"),
        '’' | 'ʼ' | '`' | '´' | 'ʻ' => Some("'"),
        _ => None,
    }
}

/// Unicode-decomposes, strips diacritics, lowercases, trims and collapses
/// internal whitespace.
pub fn normalize(name: &str) -> String {
    let mut folded = String::with_capacity(name.len());
    for c in name.nfd() {
        if is_combining_mark(c) {
            continue;
        }
        match replace_special_letter(c) {
            Some(rep) => folded.push_str(rep),
            None => folded.extend(c.to_lowercase()),
        }
    }
    folded.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Removes trailing parenthetical annotations: "Congo (DRC)" -> "Congo".
/// Returns the input unchanged if nothing would be left.
pub fn clean_label(name: &str) -> String {
    let mut current = name.trim().to_string();
    loop {
        let stripped = TRAILING_PARENS.replace(&current, "").trim().to_string();
        if stripped == current || stripped.is_empty() {
            return current;
        }
        current = stripped;
    }
}

fn has_meaningful_token(s: &str) -> bool {
    s.split(|c: char| c.is_whitespace() || c == '-')
        .any(|t| t.chars().count() >= 2 && !FILLER_TOKENS.contains(&t))
}

/// Strips one administrative suffix or prefix from an already normalized
/// name. `None` when nothing applies or stripping would leave no meaningful
/// token.
pub fn strip_administrative_affix(normalized: &str) -> Option<String> {
    for suffix in ADMINISTRATIVE_SUFFIXES.iter() {
        if let Some(rest) = normalized.strip_suffix(suffix) {
            let rest = rest.trim_end();
            // must end on a word boundary: "oblast" strips from "donetsk oblast", not "xoblast"
            if rest.len() == normalized.len() - suffix.len() {
                continue;
            }
            let rest = rest.trim_end_matches(|c: char| c == ',' || c == '-').trim_end();
            if has_meaningful_token(rest) {
                return Some(rest.to_string());
            }
        }
    }
    for prefix in ADMINISTRATIVE_PREFIXES.iter() {
        if let Some(rest) = normalized.strip_prefix(prefix) {
            let rest = rest.trim();
            if has_meaningful_token(rest) {
                return Some(rest.to_string());
            }
        }
    }
    None
}

/// `[normalize(name)]` plus the affix-stripped form when one applies.
/// Callers apply `clean_label` first.
pub fn variants(name: &str) -> Vec<String> {
    let normalized = normalize(name);
    let mut out = Vec::with_capacity(2);
    if normalized.is_empty() {
        return out;
    }
    if let Some(stripped) = strip_administrative_affix(&normalized) {
        out.push(normalized);
        if !out.contains(&stripped) {
            out.push(stripped);
        }
    } else {
        out.push(normalized);
    }
    out
}
