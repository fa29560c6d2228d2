// src/geocode/spatial.rs
//! Point queries against the reference geometries.

use anyhow::{Context, Result};
use async_trait::async_trait;
use log::debug;

use crate::models::DivisionId;
use crate::utils::db_connect::PgPool;

#[async_trait]
pub trait SpatialSearch: Send + Sync {
    /// Divisions whose geometry contains the point.
    async fn containing(&self, lat: f64, lon: f64) -> Result<Vec<DivisionId>>;
    /// Divisions whose geometry contains the point or lies within `radius_km` of it.
    async fn within(&self, lat: f64, lon: f64, radius_km: f64) -> Result<Vec<DivisionId>>;
}

/// PostGIS-backed search over `administrative_divisions.geom` (SRID 4326).
pub struct PgSpatialSearch {
    pool: PgPool,
}

impl PgSpatialSearch {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl SpatialSearch for PgSpatialSearch {
    async fn containing(&self, lat: f64, lon: f64) -> Result<Vec<DivisionId>> {
        let conn = self
            .pool
            .get()
            .await
            .context("Failed to get DB connection for containment search")?;
        let rows = conn
            .query(
                "SELECT id FROM administrative_divisions
                 WHERE geom IS NOT NULL
                   AND ST_Contains(geom, ST_SetSRID(ST_MakePoint($1, $2), 4326))",
                &[&lon, &lat],
            )
            .await
            .context("Containment query failed")?;
        debug!("{} divisions contain ({:.4}, {:.4})", rows.len(), lat, lon);
        Ok(rows.iter().map(|r| r.get("id")).collect())
    }

    async fn within(&self, lat: f64, lon: f64, radius_km: f64) -> Result<Vec<DivisionId>> {
        let conn = self
            .pool
            .get()
            .await
            .context("Failed to get DB connection for radius search")?;
        let radius_m = radius_km * 1000.0;
        let rows = conn
            .query(
                "SELECT id FROM administrative_divisions
                 WHERE geom IS NOT NULL
                   AND ST_DWithin(
                         geom::geography,
                         ST_SetSRID(ST_MakePoint($1, $2), 4326)::geography,
                         $3)",
                &[&lon, &lat, &radius_m],
            )
            .await
            .context("Radius query failed")?;
        debug!("{} divisions within {} km of ({:.4}, {:.4})", rows.len(), radius_km, lat, lon);
        Ok(rows.iter().map(|r| r.get("id")).collect())
    }
}
