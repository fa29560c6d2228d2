// src/matching/candidates.rs
//! Scored candidate lookup against the reference index.
//!
//! Strategies run as a cascade: exact and reference-variant lookups first,
//! prefix containment only when those find nothing, trigram similarity only
//! when everything else came back empty. All functions are pure.

use std::cmp::Ordering;
use std::collections::{HashMap, HashSet};

use crate::matching::normalize::{clean_label, variants};
use crate::matching::trigram::{set_similarity, trigrams};
use crate::models::DivisionId;
use crate::reference::index::ReferenceIndex;
use crate::utils::constants::{
    DEFAULT_TRIGRAM_MIN_SIMILARITY, EXACT_MATCH_SCORE, MAX_TRIGRAM_CANDIDATES, PREFIX_MATCH_SCORE,
    PREFIX_MIN_CHARS, PREFIX_MIN_RATIO, REFERENCE_VARIANT_SCORE, SCOPE_BONUS,
    SINGLE_CANDIDATE_BONUS, TRIGRAM_SCORE_SCALE,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchStrategy {
    Exact,
    ReferenceVariant,
    Prefix,
    Trigram,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Candidate {
    pub division_id: DivisionId,
    pub score: i32,
    pub strategy: MatchStrategy,
}

/// Constraints of one lookup.
#[derive(Debug, Clone, Copy)]
pub struct CandidateQuery<'a> {
    /// Preferred division ids. Candidates inside receive the scope bonus.
    pub scope: Option<&'a HashSet<DivisionId>>,
    /// Drop candidates outside `scope` instead of only ranking them lower.
    pub restrict_to_scope: bool,
    /// Divisions that must never come back (rejections).
    pub excluded: Option<&'a HashSet<DivisionId>>,
    pub countries_only: bool,
    pub allow_prefix: bool,
    pub allow_trigram: bool,
    pub trigram_min_similarity: f64,
}

impl<'a> CandidateQuery<'a> {
    /// Whole-index lookup with every strategy enabled.
    pub fn global(trigram_min_similarity: f64) -> Self {
        Self {
            scope: None,
            restrict_to_scope: false,
            excluded: None,
            countries_only: false,
            allow_prefix: true,
            allow_trigram: true,
            trigram_min_similarity,
        }
    }

    /// Country-level names only, exact strategies only.
    pub fn countries(excluded: &'a HashSet<DivisionId>) -> Self {
        Self {
            countries_only: true,
            allow_prefix: false,
            allow_trigram: false,
            excluded: Some(excluded),
            ..Self::global(DEFAULT_TRIGRAM_MIN_SIMILARITY)
        }
    }

    pub fn preferring(mut self, scope: &'a HashSet<DivisionId>) -> Self {
        self.scope = Some(scope);
        self
    }

    pub fn within(mut self, scope: &'a HashSet<DivisionId>) -> Self {
        self.scope = Some(scope);
        self.restrict_to_scope = true;
        self
    }

    pub fn excluding(mut self, excluded: &'a HashSet<DivisionId>) -> Self {
        self.excluded = Some(excluded);
        self
    }

    pub fn without_prefix(mut self) -> Self {
        self.allow_prefix = false;
        self
    }

    fn in_scope(&self, id: DivisionId) -> bool {
        self.scope.map(|s| s.contains(&id)).unwrap_or(false)
    }

    fn admits(&self, index: &ReferenceIndex, id: DivisionId) -> bool {
        if self.excluded.map(|e| e.contains(&id)).unwrap_or(false) {
            return false;
        }
        if self.countries_only && !index.is_country(id) {
            return false;
        }
        if self.restrict_to_scope && !self.in_scope(id) {
            return false;
        }
        true
    }

    /// Ids a scan needs to visit: the scope when restricted, else everything.
    fn scan_ids(&self, index: &ReferenceIndex) -> Vec<DivisionId> {
        match (self.restrict_to_scope, self.scope) {
            (true, Some(scope)) => scope.iter().copied().collect(),
            _ if self.countries_only => index.countries().to_vec(),
            _ => index.entries().map(|e| e.id).collect(),
        }
    }
}

/// Looks up every variant in the normalized-name map.
pub fn exact_candidates(
    index: &ReferenceIndex,
    name_variants: &[String],
    query: &CandidateQuery<'_>,
) -> Vec<Candidate> {
    let mut out = Vec::new();
    for v in name_variants {
        for &id in index.by_normalized(v) {
            if query.admits(index, id) {
                out.push(Candidate {
                    division_id: id,
                    score: EXACT_MATCH_SCORE,
                    strategy: MatchStrategy::Exact,
                });
            }
        }
    }
    out
}

/// Compares variants against the reference names with their own suffix removed.
pub fn reference_variant_candidates(
    index: &ReferenceIndex,
    name_variants: &[String],
    query: &CandidateQuery<'_>,
) -> Vec<Candidate> {
    let mut out = Vec::new();
    for v in name_variants {
        for &id in index.by_stripped(v) {
            if query.admits(index, id) {
                out.push(Candidate {
                    division_id: id,
                    score: REFERENCE_VARIANT_SCORE,
                    strategy: MatchStrategy::ReferenceVariant,
                });
            }
        }
    }
    out
}

fn simple_prefix(a: &str, b: &str) -> bool {
    let (short, long) = if a.chars().count() <= b.chars().count() {
        (a, b)
    } else {
        (b, a)
    };
    if short == long {
        return true;
    }
    let short_len = short.chars().count();
    let long_len = long.chars().count();
    short_len >= PREFIX_MIN_CHARS
        && (short_len as f64) >= PREFIX_MIN_RATIO * long_len as f64
        && long.starts_with(short)
}

/// Stem-sharing test. Hyphenated names must agree segment by segment.
pub fn is_prefix_match(a: &str, b: &str) -> bool {
    if a.is_empty() || b.is_empty() {
        return false;
    }
    if a.contains('-') || b.contains('-') {
        let left: Vec<&str> = a.split('-').map(str::trim).collect();
        let right: Vec<&str> = b.split('-').map(str::trim).collect();
        return left.len() == right.len()
            && left.iter().zip(right.iter()).all(|(l, r)| simple_prefix(l, r));
    }
    simple_prefix(a, b)
}

pub fn prefix_candidates(
    index: &ReferenceIndex,
    name_variants: &[String],
    query: &CandidateQuery<'_>,
) -> Vec<Candidate> {
    let mut out = Vec::new();
    for id in query.scan_ids(index) {
        if !query.admits(index, id) {
            continue;
        }
        let Some(entry) = index.get(id) else { continue };
        let hit = name_variants.iter().any(|v| {
            is_prefix_match(v, &entry.normalized)
                || entry
                    .stripped
                    .as_deref()
                    .map(|s| is_prefix_match(v, s))
                    .unwrap_or(false)
        });
        if hit {
            out.push(Candidate {
                division_id: id,
                score: PREFIX_MATCH_SCORE,
                strategy: MatchStrategy::Prefix,
            });
        }
    }
    out
}

pub fn trigram_score(similarity: f64) -> i32 {
    (similarity * TRIGRAM_SCORE_SCALE).round() as i32
}

/// Best trigram similarity per division over all variants, above the floor.
pub fn trigram_candidates(
    index: &ReferenceIndex,
    name_variants: &[String],
    query: &CandidateQuery<'_>,
) -> Vec<Candidate> {
    let mut best: HashMap<DivisionId, f64> = HashMap::new();
    for v in name_variants {
        let query_trigrams = trigrams(v);
        if query_trigrams.is_empty() {
            continue;
        }
        for id in index.trigram_neighbours(&query_trigrams).into_keys() {
            if !query.admits(index, id) {
                continue;
            }
            let Some(entry) = index.get(id) else { continue };
            let sim = set_similarity(&query_trigrams, &entry.trigrams);
            if sim >= query.trigram_min_similarity {
                let slot = best.entry(id).or_insert(0.0);
                if sim > *slot {
                    *slot = sim;
                }
            }
        }
    }
    let mut scored: Vec<(DivisionId, f64)> = best.into_iter().collect();
    scored.sort_by(|a, b| {
        b.1.partial_cmp(&a.1)
            .unwrap_or(Ordering::Equal)
            .then_with(|| index.depth(a.0).cmp(&index.depth(b.0)))
            .then_with(|| a.0.cmp(&b.0))
    });
    scored.truncate(MAX_TRIGRAM_CANDIDATES);
    scored
        .into_iter()
        .map(|(id, sim)| Candidate {
            division_id: id,
            score: trigram_score(sim),
            strategy: MatchStrategy::Trigram,
        })
        .collect()
}

/// Highest score first, then the shallowest division, then the lowest id.
pub fn rank(index: &ReferenceIndex, candidates: &mut [Candidate]) {
    candidates.sort_by(|a, b| {
        b.score
            .cmp(&a.score)
            .then_with(|| index.depth(a.division_id).cmp(&index.depth(b.division_id)))
            .then_with(|| a.division_id.cmp(&b.division_id))
    });
}

/// Keeps the best score per division, then applies the scope bonuses.
fn finalize(
    index: &ReferenceIndex,
    raw: Vec<Candidate>,
    query: &CandidateQuery<'_>,
) -> Vec<Candidate> {
    let mut by_division: HashMap<DivisionId, Candidate> = HashMap::new();
    for c in raw {
        match by_division.get(&c.division_id) {
            Some(existing) if existing.score >= c.score => {}
            _ => {
                by_division.insert(c.division_id, c);
            }
        }
    }
    let mut out: Vec<Candidate> = by_division.into_values().collect();
    if query.scope.is_some() {
        let in_scope = out.iter().filter(|c| query.in_scope(c.division_id)).count();
        for c in out.iter_mut() {
            if query.in_scope(c.division_id) {
                c.score += SCOPE_BONUS;
                if in_scope == 1 {
                    c.score += SINGLE_CANDIDATE_BONUS;
                }
            }
        }
    }
    rank(index, &mut out);
    out
}

/// Runs the full cascade for one raw name. The label is cleaned here.
pub fn find_candidates(
    index: &ReferenceIndex,
    name: &str,
    query: &CandidateQuery<'_>,
) -> Vec<Candidate> {
    let name_variants = variants(&clean_label(name));
    if name_variants.is_empty() {
        return Vec::new();
    }

    let mut raw = exact_candidates(index, &name_variants, query);
    raw.extend(reference_variant_candidates(index, &name_variants, query));

    if raw.is_empty() && query.allow_prefix {
        raw = prefix_candidates(index, &name_variants, query);
    }
    if raw.is_empty() && query.allow_trigram {
        raw = trigram_candidates(index, &name_variants, query);
    }
    finalize(index, raw, query)
}

/// The candidate to accept without review: the top score must clear the
/// threshold and must not be shared with a runner-up.
pub fn confident_pick(candidates: &[Candidate], threshold: i32) -> Option<&Candidate> {
    let first = candidates.first()?;
    if first.score < threshold {
        return None;
    }
    match candidates.get(1) {
        Some(second) if second.score == first.score => None,
        _ => Some(first),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reference::index::tests::sample_index;
    use crate::utils::constants::DEFAULT_AUTO_ACCEPT_SCORE;

    #[test]
    fn test_exact_match_scores_highest_tier() {
        let index = sample_index();
        let found = find_candidates(&index, "Bavaria", &CandidateQuery::global(0.35));
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].division_id, 3);
        assert_eq!(found[0].score, EXACT_MATCH_SCORE);
    }

    #[test]
    fn test_query_suffix_is_stripped() {
        let index = sample_index();
        let found = find_candidates(&index, "Kyiv Oblast (Ukraine)", &CandidateQuery::global(0.35));
        assert_eq!(found[0].division_id, 13);
        assert_eq!(found[0].strategy, MatchStrategy::Exact);
    }

    #[test]
    fn test_reference_variant_catches_asymmetric_suffix() {
        let index = sample_index();
        let found = find_candidates(&index, "Shida Kartli", &CandidateQuery::global(0.35));
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].division_id, 22);
        assert_eq!(found[0].score, REFERENCE_VARIANT_SCORE);
    }

    #[test]
    fn test_prefix_requires_length_and_ratio() {
        assert!(is_prefix_match("ingushetia", "ingush"));
        assert!(!is_prefix_match("ing", "ingush"));
        assert!(!is_prefix_match("saxo", "saxony-anhalt"));
        assert!(is_prefix_match("baden-wurttemberg", "baden-wurttember"));
        assert!(!is_prefix_match("nord-pas-de-calais", "nord-est"));
        assert!(!is_prefix_match("kara-kalpak", "kara-cherkess"));
    }

    #[test]
    fn test_prefix_runs_only_when_exact_fails() {
        let index = sample_index();
        let found = find_candidates(&index, "Ingushetia", &CandidateQuery::global(0.35));
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].division_id, 24);
        assert_eq!(found[0].strategy, MatchStrategy::Prefix);
    }

    #[test]
    fn test_trigram_fallback_respects_floor() {
        let index = sample_index();
        let found = find_candidates(&index, "Lugansk Oblast", &CandidateQuery::global(0.35));
        assert_eq!(found[0].division_id, 12);
        assert_eq!(found[0].strategy, MatchStrategy::Trigram);
        assert!(found[0].score < REFERENCE_VARIANT_SCORE);

        let none = find_candidates(&index, "Zzyzx", &CandidateQuery::global(0.35));
        assert!(none.is_empty());
    }

    #[test]
    fn test_scope_bonus_and_single_candidate_bonus() {
        let index = sample_index();
        let us_scope: HashSet<DivisionId> = index.descendants(41);
        let found = find_candidates(
            &index,
            "Georgia",
            &CandidateQuery::global(0.35).preferring(&us_scope),
        );
        assert_eq!(found.len(), 2);
        assert_eq!(found[0].division_id, 42);
        assert_eq!(found[0].score, EXACT_MATCH_SCORE + SCOPE_BONUS + SINGLE_CANDIDATE_BONUS);
        assert_eq!(found[1].score, EXACT_MATCH_SCORE);
    }

    #[test]
    fn test_tied_names_are_ranked_but_not_confident() {
        let index = sample_index();
        let found = find_candidates(&index, "Georgia", &CandidateQuery::global(0.35));
        assert_eq!(found.len(), 2);
        assert_eq!(found[0].division_id, 21);
        assert!(confident_pick(&found, DEFAULT_AUTO_ACCEPT_SCORE).is_none());
    }

    #[test]
    fn test_excluded_divisions_never_return() {
        let index = sample_index();
        let rejected = HashSet::from([3]);
        let found = find_candidates(
            &index,
            "Bavaria",
            &CandidateQuery::global(0.35).excluding(&rejected),
        );
        assert!(found.iter().all(|c| c.division_id != 3));
    }

    #[test]
    fn test_countries_only() {
        let index = sample_index();
        let none = HashSet::new();
        let found = find_candidates(&index, "Georgia", &CandidateQuery::countries(&none));
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].division_id, 21);
    }
}
