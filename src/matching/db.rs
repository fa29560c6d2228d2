// src/matching/db.rs
//! Reads of the import tree and of persisted match state.

use anyhow::{Context, Result};
use log::{debug, warn};

use crate::error::MatchError;
use crate::matching::state::ExistingMatchState;
use crate::models::{DivisionId, HierarchyId, ImportRegion, ImportTree, MatchStatus, RegionId};
use crate::utils::db_connect::PgPool;

pub async fn load_import_tree(pool: &PgPool, hierarchy_id: HierarchyId) -> Result<ImportTree> {
    let conn = pool
        .get()
        .await
        .context("Failed to get DB connection for load_import_tree")?;
    let rows = conn
        .query(
            "SELECT id, name, parent_region_id
             FROM import_regions
             WHERE hierarchy_id = $1
             ORDER BY sort_order NULLS LAST, id",
            &[&hierarchy_id],
        )
        .await
        .context("Failed to query import_regions")?;

    if rows.is_empty() {
        return Err(MatchError::HierarchyNotFound(hierarchy_id).into());
    }
    let regions: Vec<ImportRegion> = rows
        .iter()
        .map(|row| {
            let name: String = row.get("name");
            ImportRegion::new(row.get("id"), &name, row.get("parent_region_id"))
        })
        .collect();
    debug!("Loaded {} import regions for hierarchy {}", regions.len(), hierarchy_id);
    Ok(ImportTree::from_regions(regions))
}

/// Which rows `load_state` reads: a whole hierarchy or a single region.
#[derive(Debug, Clone, Copy)]
enum StateScope {
    Hierarchy(HierarchyId),
    Region(RegionId),
}

impl StateScope {
    fn filter(&self) -> &'static str {
        match self {
            StateScope::Hierarchy(_) => "r.hierarchy_id = $1",
            StateScope::Region(_) => "r.id = $1",
        }
    }

    fn key(&self) -> i32 {
        match self {
            StateScope::Hierarchy(id) | StateScope::Region(id) => *id,
        }
    }
}

async fn load_state(pool: &PgPool, scope: StateScope) -> Result<ExistingMatchState> {
    let conn = pool
        .get()
        .await
        .context("Failed to get DB connection for match state load")?;
    let key = scope.key();
    let mut state = ExistingMatchState::default();

    let status_sql = format!(
        "SELECT s.region_id, s.status
         FROM region_match_state s
         JOIN import_regions r ON r.id = s.region_id
         WHERE {}",
        scope.filter()
    );
    for row in conn
        .query(status_sql.as_str(), &[&key])
        .await
        .context("Failed to query region_match_state")?
    {
        let region_id: RegionId = row.get("region_id");
        let raw: String = row.get("status");
        match raw.parse::<MatchStatus>() {
            Ok(status) => {
                state.statuses.insert(region_id, status);
            }
            Err(e) => warn!("Region {}: ignoring stored status: {}", region_id, e),
        }
    }

    let suggestion_sql = format!(
        "SELECT s.region_id, s.division_id, s.rejected, s.score
         FROM region_match_suggestions s
         JOIN import_regions r ON r.id = s.region_id
         WHERE {}",
        scope.filter()
    );
    for row in conn
        .query(suggestion_sql.as_str(), &[&key])
        .await
        .context("Failed to query region_match_suggestions")?
    {
        let region_id: RegionId = row.get("region_id");
        let division_id: DivisionId = row.get("division_id");
        let rejected: bool = row.get("rejected");
        if rejected {
            state.rejected.entry(region_id).or_default().insert(division_id);
        } else {
            state.suggested.entry(region_id).or_default().insert(division_id);
            state
                .suggestion_scores
                .insert((region_id, division_id), row.get("score"));
        }
    }

    let assignment_sql = format!(
        "SELECT a.region_id, a.division_id
         FROM region_assignments a
         JOIN import_regions r ON r.id = a.region_id
         WHERE {}",
        scope.filter()
    );
    for row in conn
        .query(assignment_sql.as_str(), &[&key])
        .await
        .context("Failed to query region_assignments")?
    {
        let region_id: RegionId = row.get("region_id");
        state
            .assigned
            .entry(region_id)
            .or_default()
            .insert(row.get("division_id"));
    }
    Ok(state)
}

pub async fn load_match_state(
    pool: &PgPool,
    hierarchy_id: HierarchyId,
) -> Result<ExistingMatchState> {
    load_state(pool, StateScope::Hierarchy(hierarchy_id)).await
}

pub async fn load_region_match_state(
    pool: &PgPool,
    region_id: RegionId,
) -> Result<ExistingMatchState> {
    load_state(pool, StateScope::Region(region_id)).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_scope_filters_bind_one_parameter() {
        assert_eq!(StateScope::Hierarchy(3).filter(), "r.hierarchy_id = $1");
        assert_eq!(StateScope::Region(9).filter(), "r.id = $1");
        assert_eq!(StateScope::Region(9).key(), 9);
    }
}
