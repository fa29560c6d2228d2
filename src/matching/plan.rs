// src/matching/plan.rs
//! Decisions produced by a matcher pass, applied by the writer in one
//! transaction.

use std::collections::HashSet;

use crate::matching::state::ExistingMatchState;
use crate::models::{DivisionId, MatchStatus, RegionId, SuggestionSource};

#[derive(Debug, Clone, PartialEq)]
pub struct SuggestionDraft {
    pub division_id: DivisionId,
    pub path: String,
    pub score: i32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RegionDecision {
    pub region_id: RegionId,
    /// `None` leaves the stored status as it is.
    pub status: Option<MatchStatus>,
    pub suggestions: Vec<SuggestionDraft>,
    pub assignments: Vec<DivisionId>,
    pub source: SuggestionSource,
}

impl RegionDecision {
    pub fn status_only(region_id: RegionId, status: MatchStatus, source: SuggestionSource) -> Self {
        Self {
            region_id,
            status: Some(status),
            suggestions: Vec::new(),
            assignments: Vec::new(),
            source,
        }
    }

    pub fn adds_anything(&self) -> bool {
        !self.suggestions.is_empty() || !self.assignments.is_empty()
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct MatchPlan {
    pub decisions: Vec<RegionDecision>,
}

impl MatchPlan {
    pub fn push(&mut self, decision: RegionDecision) {
        self.decisions.push(decision);
    }

    pub fn len(&self) -> usize {
        self.decisions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.decisions.is_empty()
    }

    pub fn suggestion_count(&self) -> usize {
        self.decisions.iter().map(|d| d.suggestions.len()).sum()
    }

    pub fn assignment_count(&self) -> usize {
        self.decisions.iter().map(|d| d.assignments.len()).sum()
    }

    pub fn decision_for(&self, region: RegionId) -> Option<&RegionDecision> {
        self.decisions.iter().find(|d| d.region_id == region)
    }

    /// Drops everything that would duplicate or contradict stored state:
    /// suggestions already suggested, assigned or rejected, assignments already
    /// present or rejected, and status changes on human-owned regions. A region
    /// that already holds assignments keeps its status and takes no new ones.
    pub fn without_known(mut self, state: &ExistingMatchState) -> MatchPlan {
        for decision in self.decisions.iter_mut() {
            let region = decision.region_id;
            if state.is_human_owned(region) {
                decision.status = None;
            }
            if !state.assigned_for(region).is_empty() {
                decision.status = None;
                decision.assignments.clear();
            }
            let mut seen: HashSet<DivisionId> = HashSet::new();
            decision
                .suggestions
                .retain(|s| !state.is_known(region, s.division_id) && seen.insert(s.division_id));
            let mut seen_assign: HashSet<DivisionId> = HashSet::new();
            decision.assignments.retain(|d| {
                !state.is_rejected(region, *d)
                    && !state.assigned_for(region).contains(d)
                    && seen_assign.insert(*d)
            });
            // an assignment makes a suggestion row for the same division redundant
            let assigned: HashSet<DivisionId> = decision.assignments.iter().copied().collect();
            decision.suggestions.retain(|s| !assigned.contains(&s.division_id));
        }
        self.decisions
            .retain(|d| d.status.is_some() || d.adds_anything());
        self
    }
}
