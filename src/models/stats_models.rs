// src/models/stats_models.rs
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::models::core::{DivisionId, MatchStatus};

/// The matcher a log line or run belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MatchMethodType {
    CountryTree,
    AiBatch,
    AiSingle,
    Geocode,
}

impl MatchMethodType {
    pub fn as_str(&self) -> &'static str {
        match self {
            MatchMethodType::CountryTree => "country_tree",
            MatchMethodType::AiBatch => "ai_batch",
            MatchMethodType::AiSingle => "ai_single",
            MatchMethodType::Geocode => "geocode",
        }
    }
}

/// Lifecycle of a background run as seen by pollers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Running,
    Completed,
    Cancelled,
    Failed,
}

impl RunStatus {
    pub fn is_finished(&self) -> bool {
        !matches!(self, RunStatus::Running)
    }
}

/// Progress object of a run. Written by the owning run only, read by pollers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunProgress {
    pub processed: usize,
    pub total: usize,
    pub improved: usize,
    pub auto_matched: usize,
    pub failed_batches: usize,
    pub cost_so_far: f64,
    pub status: RunStatus,
    pub error: Option<String>,
    pub started_at: DateTime<Utc>,
}

impl RunProgress {
    pub fn new(total: usize) -> Self {
        Self {
            processed: 0,
            total,
            improved: 0,
            auto_matched: 0,
            failed_batches: 0,
            cost_so_far: 0.0,
            status: RunStatus::Running,
            error: None,
            started_at: Utc::now(),
        }
    }
}

/// Counters of one country-level tree pass.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TreeMatchStats {
    pub regions_total: usize,
    pub regions_skipped_manual: usize,
    pub regions_skipped_resolved: usize,
    pub containers: usize,
    pub auto_matched: usize,
    pub children_matched: usize,
    pub needs_review: usize,
    pub no_candidates: usize,
    pub suggestions_written: usize,
    pub assignments_written: usize,
}

impl TreeMatchStats {
    pub fn record_status(&mut self, status: MatchStatus) {
        match status {
            MatchStatus::AutoMatched => self.auto_matched += 1,
            MatchStatus::ChildrenMatched => self.children_matched += 1,
            MatchStatus::NeedsReview => self.needs_review += 1,
            MatchStatus::NoCandidates => self.no_candidates += 1,
            MatchStatus::ManualMatched | MatchStatus::Suggested => {}
        }
    }
}

/// A suggestion as returned to interactive callers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SuggestionView {
    pub division_id: DivisionId,
    pub name: String,
    pub path: String,
    pub score: i32,
}

/// Result of `ai_match_single_region`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SingleRegionAiResult {
    pub improved: bool,
    pub suggestion: Option<SuggestionView>,
    pub additional: Vec<SuggestionView>,
    pub auto_matched: bool,
    pub reasoning: Option<String>,
    pub cost: f64,
}

/// Result of `geocode_match_region`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GeocodeMatchResult {
    pub found: bool,
    pub suggestions: Vec<SuggestionView>,
    pub geocoded_name: Option<String>,
    /// `Some(0.0)` for exact containment, the winning radius otherwise.
    pub search_radius_km: Option<f64>,
}

impl GeocodeMatchResult {
    pub fn not_found(geocoded_name: Option<String>) -> Self {
        Self {
            found: false,
            suggestions: Vec::new(),
            geocoded_name,
            search_radius_km: None,
        }
    }
}
