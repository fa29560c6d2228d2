// src/matching/tree_matcher.rs
//! Country-level tree matcher.
//!
//! Walks the import forest depth-first from the roots. Country-shaped nodes
//! are matched against country-level reference names; a matched country with
//! children is resolved through its subdivisions when every child matches
//! confidently, otherwise at country granularity with the descendants left
//! unresolved for a later pass. Nodes that match no country are containers
//! (recursed into) or leaves (searched against the whole index). Settled
//! regions are not revisited. The walk is pure and returns a plan for the
//! writer.

use log::debug;
use std::collections::HashSet;

use crate::matching::candidates::{confident_pick, find_candidates, Candidate, CandidateQuery};
use crate::matching::plan::{MatchPlan, RegionDecision, SuggestionDraft};
use crate::matching::state::ExistingMatchState;
use crate::models::stats_models::TreeMatchStats;
use crate::models::{DivisionId, ImportRegion, ImportTree, MatchStatus, RegionId, SuggestionSource};
use crate::reference::index::ReferenceIndex;
use crate::utils::config::MatcherConfig;
use crate::utils::constants::MAX_SUGGESTIONS_PER_REGION;

pub struct TreeMatcher<'a> {
    index: &'a ReferenceIndex,
    tree: &'a ImportTree,
    state: &'a ExistingMatchState,
    config: &'a MatcherConfig,
}

enum DrillDown {
    /// Every non-human-owned child resolved to a distinct subdivision.
    Complete(Vec<(RegionId, DivisionId)>),
    Incomplete { failed_child: RegionId },
}

impl<'a> TreeMatcher<'a> {
    pub fn new(
        index: &'a ReferenceIndex,
        tree: &'a ImportTree,
        state: &'a ExistingMatchState,
        config: &'a MatcherConfig,
    ) -> Self {
        Self {
            index,
            tree,
            state,
            config,
        }
    }

    pub fn plan(&self) -> (MatchPlan, TreeMatchStats) {
        let mut plan = MatchPlan::default();
        let mut stats = TreeMatchStats {
            regions_total: self.tree.len(),
            ..TreeMatchStats::default()
        };
        let mut visited: HashSet<RegionId> = HashSet::new();
        for &root in self.tree.roots() {
            self.visit(root, &mut plan, &mut stats, &mut visited);
        }
        for decision in &plan.decisions {
            if let Some(status) = decision.status {
                stats.record_status(status);
            }
        }
        (plan, stats)
    }

    fn visit(
        &self,
        region_id: RegionId,
        plan: &mut MatchPlan,
        stats: &mut TreeMatchStats,
        visited: &mut HashSet<RegionId>,
    ) {
        if !visited.insert(region_id) {
            return;
        }
        let Some(region) = self.tree.get(region_id) else {
            return;
        };

        if self.state.is_human_owned(region_id) {
            debug!("Region {} '{}' is human-owned; skipping", region_id, region.name);
            stats.regions_skipped_manual += 1;
            self.visit_children(region_id, plan, stats, visited);
            return;
        }
        if self.is_settled(region_id) {
            debug!(
                "Region {} '{}' is already resolved; skipping its subtree",
                region_id, region.name
            );
            stats.regions_skipped_resolved += 1;
            return;
        }

        let rejected = self.state.rejected_for(region_id);
        let countries =
            find_candidates(self.index, &region.name, &CandidateQuery::countries(rejected));
        let top_countries = top_tier(&countries);

        match top_countries.len() {
            0 if !region.is_leaf() => {
                debug!(
                    "Region {} '{}' matches no country; treating it as a container",
                    region_id, region.name
                );
                stats.containers += 1;
                self.visit_children(region_id, plan, stats, visited);
            }
            0 => plan.push(self.match_leaf_globally(region)),
            1 => {
                let country = top_countries[0].division_id;
                if region.is_leaf() {
                    plan.push(self.auto_matched(region_id, country));
                } else {
                    self.resolve_with_children(region, country, plan, stats, visited);
                }
            }
            _ => {
                debug!(
                    "Region {} '{}' matches {} countries; needs review",
                    region_id,
                    region.name,
                    top_countries.len()
                );
                plan.push(self.needs_review(region_id, top_countries));
            }
        }
    }

    fn visit_children(
        &self,
        region_id: RegionId,
        plan: &mut MatchPlan,
        stats: &mut TreeMatchStats,
        visited: &mut HashSet<RegionId>,
    ) {
        for &child in self.tree.children(region_id) {
            self.visit(child, plan, stats, visited);
        }
    }

    /// Resolved by an earlier pass: auto-matched, children-matched, or holding
    /// assignments under any status.
    fn is_settled(&self, region_id: RegionId) -> bool {
        self.state.status(region_id).map(|s| s.is_settled()).unwrap_or(false)
            || !self.state.assigned_for(region_id).is_empty()
    }

    /// Resolves a matched non-leaf region through the subdivisions of
    /// `division`, recursing into matched children that have children of
    /// their own.
    fn resolve_with_children(
        &self,
        region: &ImportRegion,
        division: DivisionId,
        plan: &mut MatchPlan,
        stats: &mut TreeMatchStats,
        visited: &mut HashSet<RegionId>,
    ) {
        match self.drill_down(region, division) {
            DrillDown::Complete(picks) => {
                debug!(
                    "Region {} '{}' resolved through {} subdivisions of division {}",
                    region.id,
                    region.name,
                    picks.len(),
                    division
                );
                plan.push(RegionDecision::status_only(
                    region.id,
                    MatchStatus::ChildrenMatched,
                    SuggestionSource::Tree,
                ));
                for &child_id in &region.children {
                    if self.state.is_human_owned(child_id) {
                        self.visit(child_id, plan, stats, visited);
                    }
                }
                for (child_id, child_division) in picks {
                    visited.insert(child_id);
                    let Some(child) = self.tree.get(child_id) else {
                        continue;
                    };
                    if child.is_leaf() {
                        plan.push(self.auto_matched(child_id, child_division));
                    } else {
                        self.resolve_with_children(child, child_division, plan, stats, visited);
                    }
                }
            }
            DrillDown::Incomplete { failed_child } => {
                debug!(
                    "Region {} '{}': child {} did not resolve; assigning at division {}",
                    region.id, region.name, failed_child, division
                );
                plan.push(self.auto_matched(region.id, division));
                self.leave_for_later(region, division, plan, visited);
            }
        }
    }

    /// Descendants of a region assigned at its own level get an unresolved
    /// status so the AI pass picks them up. Candidates inside `division`
    /// become suggestions, never assignments.
    fn leave_for_later(
        &self,
        region: &ImportRegion,
        division: DivisionId,
        plan: &mut MatchPlan,
        visited: &mut HashSet<RegionId>,
    ) {
        let scope = self.index.descendants(division);
        let mut stack: Vec<RegionId> = region.children.iter().rev().copied().collect();
        while let Some(id) = stack.pop() {
            if !visited.insert(id) {
                continue;
            }
            let Some(descendant) = self.tree.get(id) else {
                continue;
            };
            stack.extend(descendant.children.iter().rev().copied());
            if self.state.is_human_owned(id) || self.is_settled(id) {
                continue;
            }
            let query = CandidateQuery::global(self.config.trigram_min_similarity)
                .within(&scope)
                .excluding(self.state.rejected_for(id));
            let candidates = find_candidates(self.index, &descendant.name, &query);
            if candidates.is_empty() {
                plan.push(RegionDecision::status_only(
                    id,
                    MatchStatus::NoCandidates,
                    SuggestionSource::Tree,
                ));
            } else {
                plan.push(self.needs_review(id, &candidates));
            }
        }
    }

    /// Matches every child against the direct subdivisions of `country`.
    fn drill_down(&self, region: &ImportRegion, country: DivisionId) -> DrillDown {
        let subdivisions: HashSet<DivisionId> =
            self.index.children(country).iter().copied().collect();
        let mut used: HashSet<DivisionId> = HashSet::new();
        let mut picks = Vec::with_capacity(region.children.len());

        for &child_id in &region.children {
            let Some(child) = self.tree.get(child_id) else {
                continue;
            };
            if self.state.is_human_owned(child_id) {
                continue;
            }
            let query = CandidateQuery::global(self.config.trigram_min_similarity)
                .within(&subdivisions)
                .excluding(self.state.rejected_for(child_id));
            let candidates = find_candidates(self.index, &child.name, &query);
            match confident_pick(&candidates, self.config.auto_accept_score) {
                Some(pick) if used.insert(pick.division_id) => {
                    picks.push((child_id, pick.division_id))
                }
                _ => return DrillDown::Incomplete { failed_child: child_id },
            }
        }
        if picks.is_empty() {
            // nothing was matched below the country, so the country itself is the answer
            return DrillDown::Incomplete {
                failed_child: region.id,
            };
        }
        DrillDown::Complete(picks)
    }

    fn match_leaf_globally(&self, region: &ImportRegion) -> RegionDecision {
        let query = CandidateQuery::global(self.config.trigram_min_similarity)
            .excluding(self.state.rejected_for(region.id));
        let candidates = find_candidates(self.index, &region.name, &query);
        if candidates.is_empty() {
            debug!("Leaf {} '{}' has no candidates", region.id, region.name);
            return RegionDecision::status_only(
                region.id,
                MatchStatus::NoCandidates,
                SuggestionSource::Tree,
            );
        }
        match confident_pick(&candidates, self.config.auto_accept_score) {
            Some(pick) => self.auto_matched(region.id, pick.division_id),
            None => self.needs_review(region.id, &candidates),
        }
    }

    fn auto_matched(&self, region_id: RegionId, division: DivisionId) -> RegionDecision {
        RegionDecision {
            region_id,
            status: Some(MatchStatus::AutoMatched),
            suggestions: Vec::new(),
            assignments: vec![division],
            source: SuggestionSource::Tree,
        }
    }

    fn needs_review(&self, region_id: RegionId, candidates: &[Candidate]) -> RegionDecision {
        RegionDecision {
            region_id,
            status: Some(MatchStatus::NeedsReview),
            suggestions: candidates
                .iter()
                .take(MAX_SUGGESTIONS_PER_REGION)
                .map(|c| SuggestionDraft {
                    division_id: c.division_id,
                    path: self.index.path(c.division_id),
                    score: c.score,
                })
                .collect(),
            assignments: Vec::new(),
            source: SuggestionSource::Tree,
        }
    }
}

/// Candidates sharing the best score. Input is ranked.
fn top_tier(candidates: &[Candidate]) -> &[Candidate] {
    match candidates.first() {
        Some(first) => {
            let n = candidates.iter().take_while(|c| c.score == first.score).count();
            &candidates[..n]
        }
        None => &[],
    }
}
