// src/matching/writer.rs
//! Applies a `MatchPlan` inside a single transaction. Either the whole plan
//! lands or nothing does.

use anyhow::{Context, Result};
use async_trait::async_trait;
use log::{debug, error, info};
use std::collections::HashMap;
use postgres_types::ToSql;
use tokio_postgres::Transaction;

use crate::matching::plan::MatchPlan;
use crate::models::{DivisionId, HierarchyId, RegionId};
use crate::utils::db_connect::PgPool;

/// Rows per multi-VALUES statement, well under the Postgres parameter limit.
const WRITE_CHUNK_ROWS: usize = 500;

type SqlParams = Vec<Box<dyn ToSql + Sync + Send>>;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WriteSummary {
    pub statuses_written: u64,
    pub suggestions_inserted: u64,
    pub assignments_inserted: u64,
}

/// Persists plans. The Postgres writer is the production implementation;
/// tests substitute an in-memory one.
#[async_trait]
pub trait PlanWriter: Send + Sync {
    async fn write_plan(&self, hierarchy_id: HierarchyId, plan: &MatchPlan) -> Result<WriteSummary>;
}

pub struct PgPlanWriter {
    pool: PgPool,
}

impl PgPlanWriter {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl PlanWriter for PgPlanWriter {
    async fn write_plan(
        &self,
        hierarchy_id: HierarchyId,
        plan: &MatchPlan,
    ) -> Result<WriteSummary> {
        apply_plan(&self.pool, hierarchy_id, plan).await
    }
}

struct StatusRow {
    region_id: RegionId,
    status: &'static str,
}

struct SuggestionRow<'a> {
    region_id: RegionId,
    division_id: DivisionId,
    path: &'a str,
    score: i32,
    source: &'static str,
}

/// One row per region; the last decision for a region wins. Postgres refuses
/// an upsert that touches the same row twice.
fn status_rows(plan: &MatchPlan) -> Vec<StatusRow> {
    let mut rows: Vec<StatusRow> = Vec::new();
    let mut position: HashMap<RegionId, usize> = HashMap::new();
    for d in &plan.decisions {
        let Some(status) = d.status else { continue };
        match position.get(&d.region_id) {
            Some(&i) => rows[i].status = status.as_str(),
            None => {
                position.insert(d.region_id, rows.len());
                rows.push(StatusRow {
                    region_id: d.region_id,
                    status: status.as_str(),
                });
            }
        }
    }
    rows
}

fn suggestion_rows(plan: &MatchPlan) -> Vec<SuggestionRow<'_>> {
    plan.decisions
        .iter()
        .flat_map(|d| {
            d.suggestions.iter().map(move |s| SuggestionRow {
                region_id: d.region_id,
                division_id: s.division_id,
                path: s.path.as_str(),
                score: s.score,
                source: d.source.as_str(),
            })
        })
        .collect()
}

fn assignment_rows(plan: &MatchPlan) -> Vec<(RegionId, DivisionId)> {
    plan.decisions
        .iter()
        .flat_map(|d| d.assignments.iter().map(move |a| (d.region_id, *a)))
        .collect()
}

/// `($1, $2, ...), ($n, ...)` for `rows` groups of `width` placeholders with
/// optional trailing SQL per group.
fn values_clause(rows: usize, width: usize, trailing: &str) -> String {
    (0..rows)
        .map(|r| {
            let placeholders: Vec<String> =
                (1..=width).map(|c| format!("${}", r * width + c)).collect();
            format!("({}{})", placeholders.join(", "), trailing)
        })
        .collect::<Vec<_>>()
        .join(", ")
}

async fn execute_params(tx: &Transaction<'_>, sql: &str, params: &SqlParams) -> Result<u64> {
    let params_slice: Vec<&(dyn ToSql + Sync)> = params
        .iter()
        .map(|p| p.as_ref() as &(dyn ToSql + Sync))
        .collect();
    let affected = tx
        .execute(sql, params_slice.as_slice())
        .await
        .map_err(|e| {
            error!("Match writer SQL error: {}", e);
            e
        })?;
    Ok(affected)
}

async fn write_statuses(
    tx: &Transaction<'_>,
    hierarchy_id: HierarchyId,
    rows: &[StatusRow],
) -> Result<u64> {
    let mut written = 0;
    for chunk in rows.chunks(WRITE_CHUNK_ROWS) {
        let mut params: SqlParams = Vec::with_capacity(chunk.len() * 3);
        for row in chunk {
            params.push(Box::new(row.region_id));
            params.push(Box::new(hierarchy_id));
            params.push(Box::new(row.status.to_string()));
        }
        // human-owned statuses are never overwritten
        let sql = format!(
            "INSERT INTO region_match_state (region_id, hierarchy_id, status, updated_at)
             VALUES {}
             ON CONFLICT (region_id) DO UPDATE SET
                status = EXCLUDED.status,
                updated_at = CURRENT_TIMESTAMP
             WHERE region_match_state.status NOT IN ('manual_matched', 'suggested')",
            values_clause(chunk.len(), 3, ", CURRENT_TIMESTAMP")
        );
        written += execute_params(tx, &sql, &params)
            .await
            .context("Failed to upsert region_match_state")?;
    }
    Ok(written)
}

async fn write_suggestions(tx: &Transaction<'_>, rows: &[SuggestionRow<'_>]) -> Result<u64> {
    let mut inserted = 0;
    for chunk in rows.chunks(WRITE_CHUNK_ROWS) {
        let mut params: SqlParams = Vec::with_capacity(chunk.len() * 5);
        for row in chunk {
            params.push(Box::new(row.region_id));
            params.push(Box::new(row.division_id));
            params.push(Box::new(row.path.to_string()));
            params.push(Box::new(row.score));
            params.push(Box::new(row.source.to_string()));
        }
        // an existing row (rejected or not) for the same pair wins
        let sql = format!(
            "INSERT INTO region_match_suggestions
                (region_id, division_id, path, score, source, rejected, created_at)
             VALUES {}
             ON CONFLICT (region_id, division_id) DO NOTHING",
            values_clause(chunk.len(), 5, ", FALSE, CURRENT_TIMESTAMP")
        );
        inserted += execute_params(tx, &sql, &params)
            .await
            .context("Failed to insert region_match_suggestions")?;
    }
    Ok(inserted)
}

async fn write_assignments(tx: &Transaction<'_>, rows: &[(RegionId, DivisionId)]) -> Result<u64> {
    let mut inserted = 0;
    for chunk in rows.chunks(WRITE_CHUNK_ROWS) {
        let mut params: SqlParams = Vec::with_capacity(chunk.len() * 2);
        for (region_id, division_id) in chunk {
            params.push(Box::new(*region_id));
            params.push(Box::new(*division_id));
        }
        let sql = format!(
            "INSERT INTO region_assignments (region_id, division_id, created_at)
             VALUES {}
             ON CONFLICT (region_id, division_id) DO NOTHING",
            values_clause(chunk.len(), 2, ", CURRENT_TIMESTAMP")
        );
        inserted += execute_params(tx, &sql, &params)
            .await
            .context("Failed to insert region_assignments")?;
    }
    Ok(inserted)
}

/// Writes statuses, suggestions and assignments of `plan` in one transaction.
pub async fn apply_plan(
    pool: &PgPool,
    hierarchy_id: HierarchyId,
    plan: &MatchPlan,
) -> Result<WriteSummary> {
    if plan.is_empty() {
        return Ok(WriteSummary::default());
    }
    let statuses = status_rows(plan);
    let suggestions = suggestion_rows(plan);
    let assignments = assignment_rows(plan);

    let mut conn = pool
        .get()
        .await
        .context("Failed to get DB connection for match writer")?;
    let transaction = conn
        .transaction()
        .await
        .context("Failed to start transaction for match writer")?;

    // Dropping the transaction on an early return rolls everything back.
    let summary = WriteSummary {
        statuses_written: write_statuses(&transaction, hierarchy_id, &statuses).await?,
        suggestions_inserted: write_suggestions(&transaction, &suggestions).await?,
        assignments_inserted: write_assignments(&transaction, &assignments).await?,
    };

    transaction
        .commit()
        .await
        .context("Failed to commit match writer transaction")?;

    debug!(
        "Hierarchy {}: wrote {} statuses, {} suggestions, {} assignments",
        hierarchy_id,
        summary.statuses_written,
        summary.suggestions_inserted,
        summary.assignments_inserted
    );
    Ok(summary)
}

/// Removes every assignment of a region. Matchers never call this; it exists
/// for callers that explicitly want to reset a region.
pub async fn clear_assignments(pool: &PgPool, region_id: RegionId) -> Result<u64> {
    let conn = pool
        .get()
        .await
        .context("Failed to get DB connection for clear_assignments")?;
    let removed = conn
        .execute("DELETE FROM region_assignments WHERE region_id = $1", &[&region_id])
        .await
        .context("Failed to delete region_assignments")?;
    info!("🧹 Cleared {} assignments of region {}", removed, region_id);
    Ok(removed)
}
