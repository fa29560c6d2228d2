// src/reference/index.rs
//! In-memory reference index. Built once per run and never mutated, so it is
//! shared behind an `Arc` without locking.

use log::{debug, warn};
use std::collections::{HashMap, HashSet};

use crate::matching::normalize::{normalize, strip_administrative_affix};
use crate::matching::trigram::{trigrams, TrigramSet};
use crate::models::{DivisionId, ReferenceDivision};
use crate::reference::country::{CountryRule, ParentInfo};

#[derive(Debug, Clone)]
pub struct IndexEntry {
    pub id: DivisionId,
    pub name: String,
    pub normalized: String,
    /// Normalized name with an administrative affix removed, when one applies.
    pub stripped: Option<String>,
    pub parent_id: Option<DivisionId>,
    pub depth: usize,
    pub is_country: bool,
    /// Nearest country at or above this entry.
    pub country_id: Option<DivisionId>,
    pub trigrams: TrigramSet,
}

#[derive(Debug, Default)]
pub struct ReferenceIndex {
    entries: HashMap<DivisionId, IndexEntry>,
    by_normalized: HashMap<String, Vec<DivisionId>>,
    by_stripped: HashMap<String, Vec<DivisionId>>,
    children: HashMap<DivisionId, Vec<DivisionId>>,
    roots: Vec<DivisionId>,
    countries: Vec<DivisionId>,
    trigram_postings: HashMap<[char; 3], Vec<DivisionId>>,
}

impl ReferenceIndex {
    pub fn build(divisions: Vec<ReferenceDivision>, rule: &CountryRule) -> Self {
        let known: HashSet<DivisionId> = divisions.iter().map(|d| d.id).collect();
        let mut parents: HashMap<DivisionId, Option<DivisionId>> =
            HashMap::with_capacity(divisions.len());
        let mut orphaned = 0usize;
        for d in &divisions {
            let parent = match d.parent_id {
                Some(p) if p != d.id && known.contains(&p) => Some(p),
                Some(_) => {
                    orphaned += 1;
                    None
                }
                None => None,
            };
            parents.insert(d.id, parent);
        }
        if orphaned > 0 {
            warn!(
                "Reference index: {} divisions reference a missing parent and are treated as roots",
                orphaned
            );
        }

        let depths = compute_depths(&parents);

        let mut index = ReferenceIndex::default();
        let mut sorted = divisions;
        sorted.sort_by_key(|d| (depths.get(&d.id).copied().unwrap_or(0), d.id));

        // Parents are always processed before their children thanks to the depth ordering.
        for d in sorted {
            let depth = depths.get(&d.id).copied().unwrap_or(0);
            // a link that does not sit one level up was cut while breaking a cycle
            let parent_id = parents
                .get(&d.id)
                .copied()
                .flatten()
                .filter(|p| depths.get(p).map(|pd| pd + 1) == Some(depth));
            let normalized = normalize(&d.name);
            let stripped = strip_administrative_affix(&normalized);

            let parent = parent_id.and_then(|p| index.entries.get(&p));
            let (is_country, inherited_country) = match parent {
                Some(parent) => {
                    let info = ParentInfo {
                        normalized_name: &parent.normalized,
                        depth: parent.depth,
                    };
                    (rule.is_country(&normalized, depth, Some(info)), parent.country_id)
                }
                None => (rule.is_country(&normalized, depth, None), None),
            };
            let country_id = if is_country { Some(d.id) } else { inherited_country };

            let entry_trigrams = trigrams(&normalized);
            for tri in &entry_trigrams {
                index.trigram_postings.entry(*tri).or_default().push(d.id);
            }
            index
                .by_normalized
                .entry(normalized.clone())
                .or_default()
                .push(d.id);
            if let Some(s) = &stripped {
                index.by_stripped.entry(s.clone()).or_default().push(d.id);
            }
            match parent_id {
                Some(p) => index.children.entry(p).or_default().push(d.id),
                None => index.roots.push(d.id),
            }
            if is_country {
                index.countries.push(d.id);
            }
            index.entries.insert(
                d.id,
                IndexEntry {
                    id: d.id,
                    name: d.name,
                    normalized,
                    stripped,
                    parent_id,
                    depth,
                    is_country,
                    country_id,
                    trigrams: entry_trigrams,
                },
            );
        }
        debug!(
            "Reference index built: {} divisions, {} roots, {} countries, {} distinct trigrams",
            index.entries.len(),
            index.roots.len(),
            index.countries.len(),
            index.trigram_postings.len()
        );
        index
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, id: DivisionId) -> bool {
        self.entries.contains_key(&id)
    }

    pub fn get(&self, id: DivisionId) -> Option<&IndexEntry> {
        self.entries.get(&id)
    }

    pub fn entries(&self) -> impl Iterator<Item = &IndexEntry> {
        self.entries.values()
    }

    pub fn roots(&self) -> &[DivisionId] {
        &self.roots
    }

    pub fn countries(&self) -> &[DivisionId] {
        &self.countries
    }

    pub fn is_country(&self, id: DivisionId) -> bool {
        self.entries.get(&id).map(|e| e.is_country).unwrap_or(false)
    }

    /// Depth from the root, `usize::MAX` for unknown ids so they sort last.
    pub fn depth(&self, id: DivisionId) -> usize {
        self.entries.get(&id).map(|e| e.depth).unwrap_or(usize::MAX)
    }

    pub fn children(&self, id: DivisionId) -> &[DivisionId] {
        self.children.get(&id).map(|c| c.as_slice()).unwrap_or(&[])
    }

    pub fn by_normalized(&self, normalized: &str) -> &[DivisionId] {
        self.by_normalized
            .get(normalized)
            .map(|v| v.as_slice())
            .unwrap_or(&[])
    }

    pub fn by_stripped(&self, stripped: &str) -> &[DivisionId] {
        self.by_stripped
            .get(stripped)
            .map(|v| v.as_slice())
            .unwrap_or(&[])
    }

    /// Ids sharing at least one trigram with the query, with the shared count.
    pub fn trigram_neighbours(&self, query: &TrigramSet) -> HashMap<DivisionId, usize> {
        let mut hits: HashMap<DivisionId, usize> = HashMap::new();
        for tri in query {
            if let Some(ids) = self.trigram_postings.get(tri) {
                for id in ids {
                    *hits.entry(*id).or_insert(0) += 1;
                }
            }
        }
        hits
    }

    /// Names from the root down to `id`, joined with " > ".
    pub fn path(&self, id: DivisionId) -> String {
        let mut names = Vec::new();
        let mut current = self.entries.get(&id);
        while let Some(entry) = current {
            names.push(entry.name.as_str());
            current = entry.parent_id.and_then(|p| self.entries.get(&p));
        }
        names.reverse();
        names.join(" > ")
    }

    /// All strict descendants of `id`.
    pub fn descendants(&self, id: DivisionId) -> HashSet<DivisionId> {
        let mut out = HashSet::new();
        let mut stack: Vec<DivisionId> = self.children(id).to_vec();
        while let Some(next) = stack.pop() {
            if out.insert(next) {
                stack.extend_from_slice(self.children(next));
            }
        }
        out
    }
}

/// Depth of every id. Cycles are cut at the point they are detected.
fn compute_depths(parents: &HashMap<DivisionId, Option<DivisionId>>) -> HashMap<DivisionId, usize> {
    let mut depths: HashMap<DivisionId, usize> = HashMap::with_capacity(parents.len());
    for &start in parents.keys() {
        if depths.contains_key(&start) {
            continue;
        }
        let mut chain = vec![start];
        let mut seen: HashSet<DivisionId> = HashSet::from([start]);
        let mut base = 0usize;
        let mut current = start;
        loop {
            match parents.get(&current).copied().flatten() {
                Some(parent) => {
                    if let Some(d) = depths.get(&parent) {
                        base = d + 1;
                        break;
                    }
                    if !seen.insert(parent) {
                        warn!("Reference index: parent cycle detected at division {}", parent);
                        break;
                    }
                    chain.push(parent);
                    current = parent;
                }
                None => break,
            }
        }
        // chain runs child -> ancestor; the last element sits at `base`
        for (offset, id) in chain.iter().rev().enumerate() {
            depths.insert(*id, base + offset);
        }
    }
    depths
}
