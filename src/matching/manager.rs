// src/matching/manager.rs
//! The exposed operations of the engine. Every operation registers a run
//! for its hierarchy first, so no two matching runs overlap on the same
//! import tree.

use anyhow::{anyhow, Result};
use log::{debug, info, warn};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;

use crate::ai::client::{CompletionClient, OpenAiCompatibleClient, Pricing};
use crate::ai::rematcher::AiRematcher;
use crate::error::{is_cancelled, MatchError};
use crate::geocode::client::{Geocoder, NominatimGeocoder};
use crate::geocode::matcher::GeocodeMatcher;
use crate::geocode::spatial::{PgSpatialSearch, SpatialSearch};
use crate::matching::candidates::trigram_score;
use crate::matching::db::{load_import_tree, load_match_state, load_region_match_state};
use crate::matching::normalize::clean_label;
use crate::matching::run_registry::{RunHandle, RunRegistry, RunTicket};
use crate::matching::state::ExistingMatchState;
use crate::matching::tree_matcher::TreeMatcher;
use crate::matching::writer::{clear_assignments, PgPlanWriter, PlanWriter};
use crate::models::stats_models::{
    GeocodeMatchResult, MatchMethodType, RunProgress, RunStatus, SingleRegionAiResult,
    TreeMatchStats,
};
use crate::models::{DivisionId, HierarchyId, ImportTree, RegionId};
use crate::reference::index::ReferenceIndex;
use crate::reference::loader::{load_reference_index, trigram_search};
use crate::utils::config::EngineConfig;
use crate::utils::constants::AI_PRE_PASS_CANDIDATES;
use crate::utils::db_connect::PgPool;
use crate::utils::get_memory_usage;
use crate::utils::progress_bars::logging::MatchingLogger;

struct CachedIndex {
    index: Arc<ReferenceIndex>,
    loaded_at: Instant,
}

pub struct MatchingEngine {
    pool: PgPool,
    config: EngineConfig,
    runs: RunRegistry,
    index_cache: Mutex<Option<CachedIndex>>,
    completion: Arc<dyn CompletionClient>,
    geocoder: Arc<dyn Geocoder>,
    spatial: Arc<dyn SpatialSearch>,
    writer: Arc<dyn PlanWriter>,
}

/// Label sent to pg_trgm: the cleaned name, or `None` when nothing is left.
fn trigram_query(name: &str) -> Option<String> {
    let cleaned = clean_label(name);
    let cleaned = cleaned.trim();
    (!cleaned.is_empty()).then(|| cleaned.to_string())
}

/// Final run status for an operation result.
fn final_status<T>(result: &Result<T>) -> (RunStatus, Option<String>) {
    match result {
        Ok(_) => (RunStatus::Completed, None),
        Err(e) if is_cancelled(e) => (RunStatus::Cancelled, None),
        Err(e) => (RunStatus::Failed, Some(format!("{:#}", e))),
    }
}

impl MatchingEngine {
    /// Production wiring: OpenAI-compatible model, Nominatim, PostGIS and
    /// the Postgres writer.
    pub fn new(pool: PgPool, config: EngineConfig) -> Result<Self> {
        let completion = Arc::new(OpenAiCompatibleClient::new(&config.ai)?);
        let geocoder = Arc::new(NominatimGeocoder::new(&config.geocode)?);
        let spatial = Arc::new(PgSpatialSearch::new(pool.clone()));
        let writer = Arc::new(PgPlanWriter::new(pool.clone()));
        Ok(Self::with_collaborators(pool, config, completion, geocoder, spatial, writer))
    }

    pub fn with_collaborators(
        pool: PgPool,
        config: EngineConfig,
        completion: Arc<dyn CompletionClient>,
        geocoder: Arc<dyn Geocoder>,
        spatial: Arc<dyn SpatialSearch>,
        writer: Arc<dyn PlanWriter>,
    ) -> Self {
        let runs = RunRegistry::new(Duration::from_secs(config.runs.retention_secs));
        Self {
            pool,
            config,
            runs,
            index_cache: Mutex::new(None),
            completion,
            geocoder,
            spatial,
            writer,
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Loads the reference index. `fresh` always reloads; otherwise a cached
    /// index younger than the cache period is reused.
    async fn reference_index(&self, fresh: bool) -> Result<Arc<ReferenceIndex>> {
        let mut cache = self.index_cache.lock().await;
        let max_age = Duration::from_secs(self.config.runs.index_cache_secs);
        if !fresh {
            if let Some(cached) = cache.as_ref().filter(|c| c.loaded_at.elapsed() < max_age) {
                debug!("Reusing reference index loaded {:.0?} ago", cached.loaded_at.elapsed());
                return Ok(cached.index.clone());
            }
        }
        let index =
            Arc::new(load_reference_index(&self.pool, &self.config.matcher.country_rule).await?);
        *cache = Some(CachedIndex {
            index: index.clone(),
            loaded_at: Instant::now(),
        });
        Ok(index)
    }

    async fn finish_run<T>(&self, ticket: &RunTicket, logger: &MatchingLogger, result: &Result<T>) {
        let (status, error) = final_status(result);
        if let Some(msg) = &error {
            logger.log_error(msg);
        }
        self.runs.finish(ticket.handle.run_id, status, error).await;
        let snapshot = ticket.progress.lock().await.clone();
        logger.log_run_completion(&snapshot);
    }

    fn check_cancelled(ticket: &RunTicket) -> Result<()> {
        if ticket.is_cancelled() {
            return Err(MatchError::Cancelled.into());
        }
        Ok(())
    }

    /// Runs the country-level tree matcher over a hierarchy and writes the
    /// result in one transaction.
    pub async fn match_country_level(&self, hierarchy_id: HierarchyId) -> Result<TreeMatchStats> {
        let ticket = self.runs.create(hierarchy_id, MatchMethodType::CountryTree, 0).await?;
        let logger = MatchingLogger::new(MatchMethodType::CountryTree);
        logger.log_start(hierarchy_id, &ticket.handle.run_id.to_string());

        let result = self.run_country_level(hierarchy_id, &ticket, &logger).await;
        self.finish_run(&ticket, &logger, &result).await;
        if let Ok(stats) = &result {
            logger.log_tree_completion(stats);
        }
        result
    }

    async fn run_country_level(
        &self,
        hierarchy_id: HierarchyId,
        ticket: &RunTicket,
        logger: &MatchingLogger,
    ) -> Result<TreeMatchStats> {
        logger.log_phase("Loading reference index", None);
        let index = self.reference_index(true).await?;
        logger.log_data_loaded(index.len(), "reference divisions");
        logger.log_memory(get_memory_usage().await);

        logger.log_phase("Loading import tree and match state", None);
        let (tree, state) = futures::try_join!(
            load_import_tree(&self.pool, hierarchy_id),
            load_match_state(&self.pool, hierarchy_id)
        )?;
        logger.log_data_loaded(tree.len(), "import regions");
        ticket.progress.lock().await.total = tree.len();
        Self::check_cancelled(ticket)?;

        logger.log_phase("Walking import tree", None);
        let (plan, mut stats) =
            TreeMatcher::new(&index, &tree, &state, &self.config.matcher).plan();
        let plan = plan.without_known(&state);
        Self::check_cancelled(ticket)?;

        logger.log_phase(
            "Writing results",
            Some(&format!(
                "{} decisions, {} suggestions, {} assignments",
                plan.len(),
                plan.suggestion_count(),
                plan.assignment_count()
            )),
        );
        let summary = self.writer.write_plan(hierarchy_id, &plan).await?;
        stats.suggestions_written = summary.suggestions_inserted as usize;
        stats.assignments_written = summary.assignments_inserted as usize;

        let mut p = ticket.progress.lock().await;
        p.processed = tree.len();
        p.improved = plan.decisions.iter().filter(|d| d.adds_anything()).count();
        p.auto_matched = stats.auto_matched;
        Ok(stats)
    }

    /// Starts AI rematching of the unresolved regions in the background and
    /// returns the handle to poll or cancel.
    pub async fn start_ai_matching(
        self: &Arc<Self>,
        hierarchy_id: HierarchyId,
    ) -> Result<RunHandle> {
        let ticket = self.runs.create(hierarchy_id, MatchMethodType::AiBatch, 0).await?;
        let handle = ticket.handle;
        let engine = Arc::clone(self);

        tokio::spawn(async move {
            let logger = MatchingLogger::new(MatchMethodType::AiBatch);
            logger.log_start(hierarchy_id, &ticket.handle.run_id.to_string());
            let worker_engine = Arc::clone(&engine);
            let worker_ticket = ticket.clone();
            let worker_logger = logger.clone();
            let joined = tokio::spawn(async move {
                worker_engine
                    .run_ai_batches(hierarchy_id, &worker_ticket, &worker_logger)
                    .await
            })
            .await;
            let result = joined.unwrap_or_else(|e| Err(anyhow!("AI matching task aborted: {}", e)));
            engine.finish_run(&ticket, &logger, &result).await;
        });
        Ok(handle)
    }

    async fn run_ai_batches(
        &self,
        hierarchy_id: HierarchyId,
        ticket: &RunTicket,
        logger: &MatchingLogger,
    ) -> Result<()> {
        logger.log_phase("Loading reference index", None);
        let index = self.reference_index(true).await?;
        logger.log_data_loaded(index.len(), "reference divisions");
        logger.log_memory(get_memory_usage().await);

        let (tree, mut state) = futures::try_join!(
            load_import_tree(&self.pool, hierarchy_id),
            load_match_state(&self.pool, hierarchy_id)
        )?;
        let regions = state.unresolved_regions(&tree.preorder());
        logger.log_data_loaded(regions.len(), "unresolved regions");
        ticket.progress.lock().await.total = regions.len();

        let batch_size = self.config.ai.batch_size;
        logger.log_phase(
            "Querying language model",
            Some(&format!(
                "{} batches of up to {}",
                regions.len().div_ceil(batch_size.max(1)),
                batch_size
            )),
        );
        let rematcher = AiRematcher::new(
            &index,
            &tree,
            self.completion.as_ref(),
            Pricing::from_config(&self.config.ai),
            &self.config.matcher,
        );
        rematcher
            .run(hierarchy_id, &regions, &mut state, self.writer.as_ref(), ticket, batch_size)
            .await
    }

    pub async fn poll(&self, handle: &RunHandle) -> Result<RunProgress> {
        self.runs.poll(handle.run_id).await
    }

    pub async fn cancel(&self, handle: &RunHandle) -> bool {
        self.runs.cancel(handle.run_id).await
    }

    /// Handle of whatever run currently holds a hierarchy.
    pub async fn active_run(&self, hierarchy_id: HierarchyId) -> Option<RunHandle> {
        self.runs.active_run(hierarchy_id).await
    }

    /// Drops every assignment of a region. Matchers never do this on their own.
    pub async fn clear_region_assignments(
        &self,
        hierarchy_id: HierarchyId,
        region_id: RegionId,
    ) -> Result<u64> {
        if self.runs.is_running(hierarchy_id).await {
            return Err(MatchError::AlreadyRunning(hierarchy_id).into());
        }
        let cleared = clear_assignments(&self.pool, region_id).await?;
        info!("Cleared {} assignments of region {}", cleared, region_id);
        Ok(cleared)
    }

    async fn load_region_tree(
        &self,
        hierarchy_id: HierarchyId,
        region_id: RegionId,
    ) -> Result<ImportTree> {
        let tree = load_import_tree(&self.pool, hierarchy_id).await?;
        if tree.get(region_id).is_none() {
            return Err(MatchError::RegionNotFound(region_id).into());
        }
        Ok(tree)
    }

    /// pg_trgm candidates for the single-region prompt, or the in-memory
    /// matcher when the database search is unavailable.
    async fn pre_pass(
        &self,
        rematcher: &AiRematcher<'_>,
        index: &ReferenceIndex,
        name: &str,
        region_id: RegionId,
        state: &ExistingMatchState,
    ) -> Vec<(DivisionId, i32)> {
        let Some(query) = trigram_query(name) else {
            return Vec::new();
        };
        match trigram_search(
            &self.pool,
            &query,
            AI_PRE_PASS_CANDIDATES,
            self.config.matcher.trigram_min_similarity,
        )
        .await
        {
            Ok(hits) => hits
                .into_iter()
                .filter(|(id, _)| index.contains(*id) && !state.is_rejected(region_id, *id))
                .map(|(id, sim)| (id, trigram_score(sim)))
                .collect(),
            Err(e) => {
                warn!("Falling back to in-memory pre-pass for region {}: {:#}", region_id, e);
                rematcher.local_pre_pass(region_id, state)
            }
        }
    }

    /// Interactive AI fix for one region.
    pub async fn ai_match_single_region(
        &self,
        hierarchy_id: HierarchyId,
        region_id: RegionId,
    ) -> Result<SingleRegionAiResult> {
        let ticket = self.runs.create(hierarchy_id, MatchMethodType::AiSingle, 1).await?;
        let logger = MatchingLogger::new(MatchMethodType::AiSingle);
        let result = self.run_ai_single(hierarchy_id, region_id, &ticket).await;
        if let Ok(r) = &result {
            let mut p = ticket.progress.lock().await;
            p.processed = 1;
            p.improved = usize::from(r.improved);
            p.auto_matched = usize::from(r.auto_matched);
        }
        self.finish_run(&ticket, &logger, &result).await;
        result
    }

    async fn run_ai_single(
        &self,
        hierarchy_id: HierarchyId,
        region_id: RegionId,
        ticket: &RunTicket,
    ) -> Result<SingleRegionAiResult> {
        let index = self.reference_index(false).await?;
        let tree = self.load_region_tree(hierarchy_id, region_id).await?;
        let mut state = load_match_state(&self.pool, hierarchy_id).await?;
        state.ensure_open(region_id)?;
        let rematcher = AiRematcher::new(
            &index,
            &tree,
            self.completion.as_ref(),
            Pricing::from_config(&self.config.ai),
            &self.config.matcher,
        );
        let name = tree.get(region_id).map(|r| r.name.clone()).unwrap_or_default();
        let pre_pass = self.pre_pass(&rematcher, &index, &name, region_id, &state).await;
        debug!("Region {}: {} pre-pass candidates", region_id, pre_pass.len());

        let result = rematcher
            .match_single(
                hierarchy_id,
                region_id,
                &mut state,
                self.writer.as_ref(),
                pre_pass,
                ticket,
            )
            .await?;
        info!(
            "🤖 Region {} '{}': improved={}, auto={}, cost ${:.4}",
            region_id, name, result.improved, result.auto_matched, result.cost
        );
        Ok(result)
    }

    /// Geocode fallback for one region.
    pub async fn geocode_match_region(
        &self,
        hierarchy_id: HierarchyId,
        region_id: RegionId,
    ) -> Result<GeocodeMatchResult> {
        let ticket = self.runs.create(hierarchy_id, MatchMethodType::Geocode, 1).await?;
        let logger = MatchingLogger::new(MatchMethodType::Geocode);
        let result = self.run_geocode(hierarchy_id, region_id, &ticket).await;
        if let Ok(r) = &result {
            let mut p = ticket.progress.lock().await;
            p.processed = 1;
            p.improved = usize::from(r.found);
        }
        self.finish_run(&ticket, &logger, &result).await;
        result
    }

    async fn run_geocode(
        &self,
        hierarchy_id: HierarchyId,
        region_id: RegionId,
        ticket: &RunTicket,
    ) -> Result<GeocodeMatchResult> {
        let index = self.reference_index(false).await?;
        let tree = self.load_region_tree(hierarchy_id, region_id).await?;
        let state = load_region_match_state(&self.pool, region_id).await?;

        let matcher =
            GeocodeMatcher::new(&index, &tree, self.geocoder.as_ref(), self.spatial.as_ref());
        let (result, plan) = matcher.match_region(region_id, &state, &ticket.cancel).await?;
        if !plan.is_empty() {
            self.writer.write_plan(hierarchy_id, &plan).await?;
        }
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ai::rematcher::tests::{MemoryWriter, ScriptedClient};
    use crate::geocode::client::GeocodeHit;
    use async_trait::async_trait;
    use bb8::Pool;
    use bb8_postgres::PostgresConnectionManager;
    use tokio_postgres::{Config, NoTls};

    struct NoGeocoder;

    #[async_trait]
    impl Geocoder for NoGeocoder {
        async fn geocode(&self, _query: &str) -> Result<Option<GeocodeHit>> {
            Ok(None)
        }
    }

    struct NoSpatial;

    #[async_trait]
    impl SpatialSearch for NoSpatial {
        async fn containing(&self, _lat: f64, _lon: f64) -> Result<Vec<DivisionId>> {
            Ok(Vec::new())
        }

        async fn within(&self, _lat: f64, _lon: f64, _radius_km: f64) -> Result<Vec<DivisionId>> {
            Ok(Vec::new())
        }
    }

    /// Engine whose pool is never connected; only paths that stop before
    /// touching the database are exercised.
    fn offline_engine() -> MatchingEngine {
        let mut pg = Config::new();
        pg.host("127.0.0.1").port(1).user("nobody").dbname("none");
        let pool = Pool::builder()
            .connection_timeout(Duration::from_millis(200))
            .build_unchecked(PostgresConnectionManager::new(pg, NoTls));
        MatchingEngine::with_collaborators(
            pool,
            EngineConfig::default(),
            Arc::new(ScriptedClient::new(vec![Ok("[]".to_string())])),
            Arc::new(NoGeocoder),
            Arc::new(NoSpatial),
            Arc::new(MemoryWriter::default()),
        )
    }

    #[test]
    fn test_final_status_distinguishes_cancellation() {
        let ok: Result<()> = Ok(());
        assert_eq!(final_status(&ok), (RunStatus::Completed, None));
        let cancelled: Result<()> = Err(MatchError::Cancelled.into());
        assert_eq!(final_status(&cancelled), (RunStatus::Cancelled, None));
        let failed: Result<()> = Err(anyhow!("connection refused"));
        let (status, msg) = final_status(&failed);
        assert_eq!(status, RunStatus::Failed);
        assert_eq!(msg.as_deref(), Some("connection refused"));
    }

    #[test]
    fn test_trigram_query_uses_cleaned_label() {
        assert_eq!(trigram_query("Congo (DRC)").as_deref(), Some("Congo"));
        assert_eq!(trigram_query("  Bayern ").as_deref(), Some("Bayern"));
        assert_eq!(trigram_query("   "), None);
    }

    #[tokio::test]
    async fn test_operations_refuse_a_busy_hierarchy() {
        let engine = offline_engine();
        let busy = engine.runs.create(7, MatchMethodType::AiBatch, 0).await.unwrap();
        assert_eq!(engine.active_run(7).await, Some(busy.handle));

        let err = engine.geocode_match_region(7, 1).await.unwrap_err();
        assert_eq!(err.downcast_ref::<MatchError>(), Some(&MatchError::AlreadyRunning(7)));
        let err = engine.ai_match_single_region(7, 1).await.unwrap_err();
        assert_eq!(err.downcast_ref::<MatchError>(), Some(&MatchError::AlreadyRunning(7)));
        let err = engine.match_country_level(7).await.unwrap_err();
        assert_eq!(err.downcast_ref::<MatchError>(), Some(&MatchError::AlreadyRunning(7)));
        let err = engine.clear_region_assignments(7, 1).await.unwrap_err();
        assert_eq!(err.downcast_ref::<MatchError>(), Some(&MatchError::AlreadyRunning(7)));

        assert!(engine.cancel(&busy.handle).await);
        assert!(busy.is_cancelled());
    }

    #[tokio::test]
    async fn test_failed_run_releases_the_hierarchy() {
        let engine = offline_engine();
        // no database behind the pool, so the run fails while loading
        let err = engine.geocode_match_region(3, 1).await;
        assert!(err.is_err());
        assert!(engine.active_run(3).await.is_none());
    }
}
