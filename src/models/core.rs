// src/models/core.rs
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::str::FromStr;

pub type DivisionId = i32;
pub type RegionId = i32;
pub type HierarchyId = i32;

/// One row of the canonical administrative hierarchy as it comes out of the store.
/// Geometry stays in the database; only the spatial search touches it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReferenceDivision {
    pub id: DivisionId,
    pub name: String,
    pub parent_id: Option<DivisionId>,
}

/// One node of the user-supplied hierarchy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImportRegion {
    pub id: RegionId,
    pub name: String,
    pub parent_region_id: Option<RegionId>,
    /// Ordered child ids, filled by `ImportTree::from_regions`.
    #[serde(default)]
    pub children: Vec<RegionId>,
}

impl ImportRegion {
    pub fn new(id: RegionId, name: &str, parent_region_id: Option<RegionId>) -> Self {
        Self {
            id,
            name: name.to_string(),
            parent_region_id,
            children: Vec::new(),
        }
    }

    pub fn is_leaf(&self) -> bool {
        self.children.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchStatus {
    AutoMatched,
    ChildrenMatched,
    NeedsReview,
    NoCandidates,
    ManualMatched,
    Suggested,
}

impl MatchStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            MatchStatus::AutoMatched => "auto_matched",
            MatchStatus::ChildrenMatched => "children_matched",
            MatchStatus::NeedsReview => "needs_review",
            MatchStatus::NoCandidates => "no_candidates",
            MatchStatus::ManualMatched => "manual_matched",
            MatchStatus::Suggested => "suggested",
        }
    }

    /// Statuses owned by the human review UI. Matchers never touch these regions.
    pub fn is_human_owned(&self) -> bool {
        matches!(self, MatchStatus::ManualMatched | MatchStatus::Suggested)
    }

    /// Resolved by a matcher; later passes leave these regions alone.
    pub fn is_settled(&self) -> bool {
        matches!(self, MatchStatus::AutoMatched | MatchStatus::ChildrenMatched)
    }

    /// Statuses that make a region eligible for the AI and geocode passes.
    pub fn is_unresolved(&self) -> bool {
        matches!(self, MatchStatus::NeedsReview | MatchStatus::NoCandidates)
    }
}

impl fmt::Display for MatchStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MatchStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "auto_matched" => Ok(MatchStatus::AutoMatched),
            "children_matched" => Ok(MatchStatus::ChildrenMatched),
            "needs_review" => Ok(MatchStatus::NeedsReview),
            "no_candidates" => Ok(MatchStatus::NoCandidates),
            "manual_matched" => Ok(MatchStatus::ManualMatched),
            "suggested" => Ok(MatchStatus::Suggested),
            other => Err(anyhow::anyhow!("Unknown match status '{}'", other)),
        }
    }
}

/// Which matcher produced a suggestion row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SuggestionSource {
    Tree,
    Ai,
    Geocode,
}

impl SuggestionSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            SuggestionSource::Tree => "tree",
            SuggestionSource::Ai => "ai",
            SuggestionSource::Geocode => "geocode",
        }
    }
}

/// The import forest with ordered children, built once per run.
#[derive(Debug, Clone, Default)]
pub struct ImportTree {
    regions: HashMap<RegionId, ImportRegion>,
    roots: Vec<RegionId>,
}

impl ImportTree {
    /// Builds the forest from flat rows. Input order defines sibling order.
    /// A row whose parent is missing becomes a root.
    pub fn from_regions(rows: Vec<ImportRegion>) -> Self {
        let mut regions: HashMap<RegionId, ImportRegion> = HashMap::with_capacity(rows.len());
        let mut order: Vec<RegionId> = Vec::with_capacity(rows.len());
        for mut row in rows {
            row.children.clear();
            order.push(row.id);
            regions.insert(row.id, row);
        }

        let mut roots = Vec::new();
        for id in &order {
            let parent = regions.get(id).and_then(|r| r.parent_region_id);
            match parent {
                Some(pid) if pid != *id && regions.contains_key(&pid) => {
                    if let Some(p) = regions.get_mut(&pid) {
                        p.children.push(*id);
                    }
                }
                Some(pid) => {
                    log::warn!(
                        "Import region {} references missing parent {}; treating it as a root",
                        id, pid
                    );
                    roots.push(*id);
                }
                None => roots.push(*id),
            }
        }

        Self { regions, roots }
    }

    pub fn roots(&self) -> &[RegionId] {
        &self.roots
    }

    pub fn get(&self, id: RegionId) -> Option<&ImportRegion> {
        self.regions.get(&id)
    }

    pub fn len(&self) -> usize {
        self.regions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.regions.is_empty()
    }

    pub fn children(&self, id: RegionId) -> &[RegionId] {
        self.regions
            .get(&id)
            .map(|r| r.children.as_slice())
            .unwrap_or(&[])
    }

    /// Every region reachable from the roots, parents before children, in sibling order.
    pub fn preorder(&self) -> Vec<RegionId> {
        let mut out = Vec::with_capacity(self.regions.len());
        let mut seen: HashSet<RegionId> = HashSet::with_capacity(self.regions.len());
        let mut stack: Vec<RegionId> = self.roots.iter().rev().copied().collect();
        while let Some(id) = stack.pop() {
            if !seen.insert(id) {
                continue;
            }
            out.push(id);
            stack.extend(self.children(id).iter().rev().copied());
        }
        out
    }

    /// Ancestors from the root down to the direct parent (the region itself excluded).
    pub fn ancestors(&self, id: RegionId) -> Vec<&ImportRegion> {
        let mut chain = Vec::new();
        let mut current = self.regions.get(&id).and_then(|r| r.parent_region_id);
        while let Some(pid) = current {
            match self.regions.get(&pid) {
                Some(parent) => {
                    if parent.id == id || chain.iter().any(|r: &&ImportRegion| r.id == parent.id) {
                        break;
                    }
                    chain.push(parent);
                    current = parent.parent_region_id;
                }
                None => break,
            }
        }
        chain.reverse();
        chain
    }

    /// "Europe > Germany > Bavaria" style path, region included.
    pub fn path(&self, id: RegionId) -> String {
        let mut names: Vec<&str> = self.ancestors(id).iter().map(|r| r.name.as_str()).collect();
        if let Some(region) = self.regions.get(&id) {
            names.push(region.name.as_str());
        }
        names.join(" > ")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_tree() -> ImportTree {
        ImportTree::from_regions(vec![
            ImportRegion::new(1, "Europe", None),
            ImportRegion::new(2, "Germany", Some(1)),
            ImportRegion::new(3, "Bavaria", Some(2)),
            ImportRegion::new(4, "Berlin", Some(2)),
            ImportRegion::new(5, "Orphan", Some(99)),
        ])
    }

    #[test]
    fn test_tree_children_keep_input_order() {
        let tree = sample_tree();
        assert_eq!(tree.roots(), &[1, 5]);
        assert_eq!(tree.children(2), &[3, 4]);
        assert!(tree.get(3).unwrap().is_leaf());
    }

    #[test]
    fn test_ancestors_and_path() {
        let tree = sample_tree();
        let ancestors: Vec<RegionId> = tree.ancestors(3).iter().map(|r| r.id).collect();
        assert_eq!(ancestors, vec![1, 2]);
        assert_eq!(tree.path(3), "Europe > Germany > Bavaria");
        assert_eq!(tree.path(5), "Orphan");
    }

    #[test]
    fn test_preorder_visits_parents_first() {
        let tree = sample_tree();
        assert_eq!(tree.preorder(), vec![1, 2, 3, 4, 5]);
    }

    #[test]
    fn test_status_round_trips_through_str() {
        for status in [
            MatchStatus::AutoMatched,
            MatchStatus::ChildrenMatched,
            MatchStatus::NeedsReview,
            MatchStatus::NoCandidates,
            MatchStatus::ManualMatched,
            MatchStatus::Suggested,
        ] {
            assert_eq!(status.as_str().parse::<MatchStatus>().unwrap(), status);
        }
        assert!("matched".parse::<MatchStatus>().is_err());
    }
}
