// src/reference/loader.rs
use anyhow::{Context, Result};
use log::{info, warn};
use std::time::Instant;

use crate::models::{DivisionId, ReferenceDivision};
use crate::reference::country::CountryRule;
use crate::reference::index::ReferenceIndex;
use crate::utils::db_connect::PgPool;

/// Loads the whole `administrative_divisions` table and builds the index.
pub async fn load_reference_index(pool: &PgPool, rule: &CountryRule) -> Result<ReferenceIndex> {
    let start = Instant::now();
    let conn = pool
        .get()
        .await
        .context("Failed to get DB connection for reference index load")?;

    let rows = conn
        .query(
            "SELECT id, name, parent_id FROM administrative_divisions ORDER BY id",
            &[],
        )
        .await
        .context("Failed to query administrative_divisions")?;

    let mut divisions = Vec::with_capacity(rows.len());
    for row in rows {
        let name: Option<String> = row.get("name");
        let Some(name) = name.filter(|n| !n.trim().is_empty()) else {
            continue;
        };
        divisions.push(ReferenceDivision {
            id: row.get("id"),
            name,
            parent_id: row.get("parent_id"),
        });
    }
    let loaded = divisions.len();
    let index = ReferenceIndex::build(divisions, rule);
    info!(
        "🗺️  Loaded reference index: {} divisions ({} countries) in {:.2?}",
        loaded,
        index.countries().len(),
        start.elapsed()
    );
    Ok(index)
}

/// pg_trgm similarity search against division names. Returns `(id, similarity)`
/// best first. Errors when the extension is not installed, so callers can fall
/// back to the in-memory trigram matcher.
pub async fn trigram_search(
    pool: &PgPool,
    name: &str,
    limit: usize,
    min_similarity: f64,
) -> Result<Vec<(DivisionId, f64)>> {
    let conn = pool
        .get()
        .await
        .context("Failed to get DB connection for trigram search")?;
    let limit = limit as i64;
    let rows = conn
        .query(
            "SELECT id, similarity(name, $1)::float8 AS sim
             FROM administrative_divisions
             WHERE name % $1 AND similarity(name, $1) >= $2::float8
             ORDER BY sim DESC, id
             LIMIT $3",
            &[&name, &min_similarity, &limit],
        )
        .await
        .map_err(|e| {
            warn!("pg_trgm search for '{}' failed: {}", name, e);
            e
        })
        .context("Trigram search on administrative_divisions failed")?;

    Ok(rows
        .iter()
        .map(|row| (row.get::<_, DivisionId>("id"), row.get::<_, f64>("sim")))
        .collect())
}
