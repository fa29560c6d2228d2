// src/matching/state.rs
//! Persisted match state as seen by the matchers at the start of a pass.

use once_cell::sync::Lazy;
use std::collections::{HashMap, HashSet};

use crate::error::MatchError;
use crate::matching::plan::MatchPlan;
use crate::models::{DivisionId, MatchStatus, RegionId};

static NO_DIVISIONS: Lazy<HashSet<DivisionId>> = Lazy::new(HashSet::new);

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ExistingMatchState {
    pub statuses: HashMap<RegionId, MatchStatus>,
    /// Sticky human rejections.
    pub rejected: HashMap<RegionId, HashSet<DivisionId>>,
    /// Suggestions that are not rejected.
    pub suggested: HashMap<RegionId, HashSet<DivisionId>>,
    pub assigned: HashMap<RegionId, HashSet<DivisionId>>,
    /// Stored score of each unrejected suggestion.
    pub suggestion_scores: HashMap<(RegionId, DivisionId), i32>,
}

impl ExistingMatchState {
    pub fn status(&self, region: RegionId) -> Option<MatchStatus> {
        self.statuses.get(&region).copied()
    }

    pub fn is_human_owned(&self, region: RegionId) -> bool {
        self.status(region).map(|s| s.is_human_owned()).unwrap_or(false)
    }

    pub fn rejected_for(&self, region: RegionId) -> &HashSet<DivisionId> {
        self.rejected.get(&region).unwrap_or(&NO_DIVISIONS)
    }

    pub fn suggested_for(&self, region: RegionId) -> &HashSet<DivisionId> {
        self.suggested.get(&region).unwrap_or(&NO_DIVISIONS)
    }

    pub fn assigned_for(&self, region: RegionId) -> &HashSet<DivisionId> {
        self.assigned.get(&region).unwrap_or(&NO_DIVISIONS)
    }

    pub fn suggestion_score(&self, region: RegionId, division: DivisionId) -> Option<i32> {
        self.suggestion_scores.get(&(region, division)).copied()
    }

    pub fn is_rejected(&self, region: RegionId, division: DivisionId) -> bool {
        self.rejected_for(region).contains(&division)
    }

    /// Already rejected, suggested or assigned for this region.
    pub fn is_known(&self, region: RegionId, division: DivisionId) -> bool {
        self.is_rejected(region, division)
            || self.suggested_for(region).contains(&division)
            || self.assigned_for(region).contains(&division)
    }

    pub fn reject(&mut self, region: RegionId, division: DivisionId) {
        if let Some(s) = self.suggested.get_mut(&region) {
            s.remove(&division);
        }
        self.suggestion_scores.remove(&(region, division));
        self.rejected.entry(region).or_default().insert(division);
    }

    /// Refuses regions a single-region matcher must not touch: anything with
    /// a status other than needs_review / no_candidates. Regions without a
    /// status (containers, never walked) are open.
    pub fn ensure_open(&self, region: RegionId) -> Result<(), MatchError> {
        match self.status(region) {
            Some(status) if !status.is_unresolved() => {
                Err(MatchError::AlreadyResolved(region, status))
            }
            _ => Ok(()),
        }
    }

    /// Regions a follow-up matcher may work on, in the given order.
    pub fn unresolved_regions(&self, order: &[RegionId]) -> Vec<RegionId> {
        order
            .iter()
            .copied()
            .filter(|r| self.status(*r).map(|s| s.is_unresolved()).unwrap_or(false))
            .collect()
    }

    /// Folds a written plan back in, the way the writer would have persisted it.
    pub fn absorb(&mut self, plan: &MatchPlan) {
        for decision in &plan.decisions {
            let region = decision.region_id;
            if let Some(status) = decision.status {
                let keep = self.is_human_owned(region);
                if !keep {
                    self.statuses.insert(region, status);
                }
            }
            for s in &decision.suggestions {
                if !self.is_rejected(region, s.division_id)
                    && self.suggested.entry(region).or_default().insert(s.division_id)
                {
                    self.suggestion_scores.insert((region, s.division_id), s.score);
                }
            }
            for d in &decision.assignments {
                self.assigned.entry(region).or_default().insert(*d);
            }
        }
    }
}
