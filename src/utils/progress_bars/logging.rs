// src/utils/progress_bars/logging.rs - Logging helpers shared by the matchers
use log::{debug, error, info, warn};
use std::time::Instant;

use crate::models::stats_models::{MatchMethodType, RunProgress, TreeMatchStats};

#[derive(Clone)]
pub struct MatchingLogger {
    method_name: &'static str,
    method_emoji: &'static str,
    start_time: Instant,
}

impl MatchingLogger {
    pub fn new(method_type: MatchMethodType) -> Self {
        let (method_name, method_emoji) = match method_type {
            MatchMethodType::CountryTree => ("COUNTRY", "🌍"),
            MatchMethodType::AiBatch => ("AI", "🤖"),
            MatchMethodType::AiSingle => ("AI-SINGLE", "🤖"),
            MatchMethodType::Geocode => ("GEOCODE", "📍"),
        };
        Self {
            method_name,
            method_emoji,
            start_time: Instant::now(),
        }
    }

    pub fn log_start(&self, hierarchy_id: i32, run_id: &str) {
        info!(
            "[{}] {} 🚀 Starting {} matching for hierarchy {} (run ID: {})",
            self.method_name,
            self.method_emoji,
            self.method_name.to_lowercase(),
            hierarchy_id,
            run_id
        );
    }

    pub fn log_phase(&self, phase: &str, details: Option<&str>) {
        let elapsed = self.start_time.elapsed();
        let msg = match details {
            Some(details) => format!(
                "[{}] {} 🔄 Phase: {} - {} [+{:.1}s]",
                self.method_name,
                self.method_emoji,
                phase,
                details,
                elapsed.as_secs_f32()
            ),
            None => format!(
                "[{}] {} 🔄 Phase: {} [+{:.1}s]",
                self.method_name,
                self.method_emoji,
                phase,
                elapsed.as_secs_f32()
            ),
        };
        info!("{}", msg);
    }

    pub fn log_data_loaded(&self, count: usize, data_type: &str) {
        info!(
            "[{}] {} 📊 Loaded {} {} from database",
            self.method_name, self.method_emoji, count, data_type
        );
    }

    pub fn log_memory(&self, used_mb: u64) {
        debug!(
            "[{}] {} 💾 Memory in use: {} MB",
            self.method_name, self.method_emoji, used_mb
        );
    }

    pub fn log_tree_completion(&self, stats: &TreeMatchStats) {
        let duration = self.start_time.elapsed();
        info!(
            "[{}] {} 🎉 COMPLETED: {} regions walked in {:.2?}",
            self.method_name, self.method_emoji, stats.regions_total, duration
        );
        info!(
            "[{}] {} 📊 Results: {} auto-matched, {} children-matched, {} need review, \
             {} without candidates, {} containers, {} human-owned skipped, \
             {} already resolved",
            self.method_name,
            self.method_emoji,
            stats.auto_matched,
            stats.children_matched,
            stats.needs_review,
            stats.no_candidates,
            stats.containers,
            stats.regions_skipped_manual,
            stats.regions_skipped_resolved
        );
        info!(
            "[{}] {} 💾 Written: {} suggestions, {} assignments",
            self.method_name,
            self.method_emoji,
            stats.suggestions_written,
            stats.assignments_written
        );
    }

    pub fn log_run_completion(&self, progress: &RunProgress) {
        let duration = self.start_time.elapsed();
        info!(
            "[{}] {} 🎉 {:?}: {}/{} regions processed in {:.2?}",
            self.method_name,
            self.method_emoji,
            progress.status,
            progress.processed,
            progress.total,
            duration
        );
        info!(
            "[{}] {} 📊 Results: {} improved, {} auto-matched, cost ${:.4}",
            self.method_name,
            self.method_emoji,
            progress.improved,
            progress.auto_matched,
            progress.cost_so_far
        );
        if progress.failed_batches > 0 {
            warn!(
                "[{}] {} ⚠️  {} batches failed and were skipped",
                self.method_name, self.method_emoji, progress.failed_batches
            );
        }
    }

    pub fn log_warning(&self, message: &str) {
        warn!("[{}] {} ⚠️  {}", self.method_name, self.method_emoji, message);
    }

    pub fn log_error(&self, message: &str) {
        error!("[{}] {} ❌ {}", self.method_name, self.method_emoji, message);
    }

    pub fn get_elapsed(&self) -> std::time::Duration {
        self.start_time.elapsed()
    }

    pub fn get_method_name(&self) -> &'static str {
        self.method_name
    }
}
