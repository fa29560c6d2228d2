// src/matching/trigram.rs
//! Character trigrams computed the way pg_trgm does: each word is padded
//! with two spaces in front and one behind, non-alphanumerics separate words.

use std::collections::HashSet;

pub type TrigramSet = HashSet<[char; 3]>;

pub fn trigrams(text: &str) -> TrigramSet {
    let mut set = TrigramSet::new();
    for word in text
        .split(|c: char| !c.is_alphanumeric())
        .filter(|w| !w.is_empty())
    {
        let padded: Vec<char> = "  "
            .chars()
            .chain(word.chars().flat_map(char::to_lowercase))
            .chain(std::iter::once(' '))
            .collect();
        for window in padded.windows(3) {
            set.insert([window[0], window[1], window[2]]);
        }
    }
    set
}

/// Shared trigrams over distinct trigrams, in `0.0..=1.0`.
pub fn set_similarity(a: &TrigramSet, b: &TrigramSet) -> f64 {
    if a.is_empty() || b.is_empty() {
        return 0.0;
    }
    let shared = a.intersection(b).count();
    let union = a.len() + b.len() - shared;
    shared as f64 / union as f64
}

pub fn similarity(a: &str, b: &str) -> f64 {
    set_similarity(&trigrams(a), &trigrams(b))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_trigrams_follow_pg_trgm_padding() {
        let t = trigrams("cat");
        assert_eq!(t.len(), 4);
        assert!(t.contains(&[' ', ' ', 'c']));
        assert!(t.contains(&[' ', 'c', 'a']));
        assert!(t.contains(&['c', 'a', 't']));
        assert!(t.contains(&['a', 't', ' ']));
    }

    #[test]
    fn test_similarity_bounds() {
        assert_eq!(similarity("kyiv oblast", "kyiv oblast"), 1.0);
        assert_eq!(similarity("", "kyiv"), 0.0);
        let close = similarity("kyiv", "kiev");
        let far = similarity("kyiv", "lisbon");
        assert!(close > far);
        assert!(similarity("dnipropetrovsk", "dnipropetrovs'k") > 0.6);
    }
}
