// src/geocode/matcher.rs
//! Geocode fallback for one region: geocode the name, then search the
//! reference geometries around the point, widening the radius round by round.

use anyhow::Result;
use log::{debug, info, warn};
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::error::MatchError;
use crate::geocode::client::{GeocodeHit, Geocoder};
use crate::geocode::spatial::SpatialSearch;
use crate::matching::normalize::clean_label;
use crate::matching::plan::{MatchPlan, RegionDecision, SuggestionDraft};
use crate::matching::state::ExistingMatchState;
use crate::models::stats_models::{GeocodeMatchResult, SuggestionView};
use crate::models::{DivisionId, ImportTree, MatchStatus, RegionId, SuggestionSource};
use crate::reference::index::ReferenceIndex;
use crate::utils::constants::{
    GEOCODE_EXACT_SCORE, GEOCODE_RADIUS_STEP_PENALTY, GEOCODE_SEARCH_RADII_KM,
};

/// The region name alone, then qualified by its nearest ancestor.
pub fn build_queries(tree: &ImportTree, region_id: RegionId) -> Vec<String> {
    let Some(region) = tree.get(region_id) else {
        return Vec::new();
    };
    let name = clean_label(&region.name);
    if name.trim().is_empty() {
        return Vec::new();
    }
    let mut queries = vec![name.clone()];
    if let Some(parent) = tree.ancestors(region_id).last() {
        let qualified = format!("{}, {}", name, clean_label(&parent.name));
        if !queries.contains(&qualified) {
            queries.push(qualified);
        }
    }
    queries
}

pub struct GeocodeMatcher<'a> {
    index: &'a ReferenceIndex,
    tree: &'a ImportTree,
    geocoder: &'a dyn Geocoder,
    spatial: &'a dyn SpatialSearch,
}

impl<'a> GeocodeMatcher<'a> {
    pub fn new(
        index: &'a ReferenceIndex,
        tree: &'a ImportTree,
        geocoder: &'a dyn Geocoder,
        spatial: &'a dyn SpatialSearch,
    ) -> Self {
        Self {
            index,
            tree,
            geocoder,
            spatial,
        }
    }

    /// First query the geocoder can place. Failed queries are logged and the
    /// next one is tried.
    async fn locate(&self, region_id: RegionId, cancel: &AtomicBool) -> Result<Option<GeocodeHit>> {
        for query in build_queries(self.tree, region_id) {
            if cancel.load(Ordering::SeqCst) {
                return Err(MatchError::Cancelled.into());
            }
            let outcome = self.geocoder.geocode(&query).await;
            if cancel.load(Ordering::SeqCst) {
                return Err(MatchError::Cancelled.into());
            }
            match outcome {
                Ok(Some(hit)) => {
                    debug!("Region {}: '{}' geocoded to '{}'", region_id, query, hit.display_name);
                    return Ok(Some(hit));
                }
                Ok(None) => debug!("Region {}: no geocoder result for '{}'", region_id, query),
                Err(e) => warn!("Region {}: {:#}", region_id, e),
            }
        }
        Ok(None)
    }

    /// Finds divisions around the geocoded point. Returns the caller-facing
    /// result and the plan to write; the plan is empty when nothing new was found.
    pub async fn match_region(
        &self,
        region_id: RegionId,
        state: &ExistingMatchState,
        cancel: &AtomicBool,
    ) -> Result<(GeocodeMatchResult, MatchPlan)> {
        if self.tree.get(region_id).is_none() {
            return Err(MatchError::RegionNotFound(region_id).into());
        }
        state.ensure_open(region_id)?;
        let Some(hit) = self.locate(region_id, cancel).await? else {
            return Ok((GeocodeMatchResult::not_found(None), MatchPlan::default()));
        };

        for (round, radius) in GEOCODE_SEARCH_RADII_KM.iter().enumerate() {
            let raw = match radius {
                None => self.spatial.containing(hit.lat, hit.lon).await?,
                Some(km) => self.spatial.within(hit.lat, hit.lon, *km).await?,
            };
            if raw.is_empty() {
                continue;
            }

            let radius_km = radius.unwrap_or(0.0);
            let score = GEOCODE_EXACT_SCORE - GEOCODE_RADIUS_STEP_PENALTY * round as i32;
            let divisions = self.fresh_divisions(region_id, raw, state);
            info!(
                "📍 Region {}: round {} ({} km) found {} new divisions",
                region_id,
                round + 1,
                radius_km,
                divisions.len()
            );
            if divisions.is_empty() {
                return Ok((
                    GeocodeMatchResult {
                        search_radius_km: Some(radius_km),
                        ..GeocodeMatchResult::not_found(Some(hit.display_name))
                    },
                    MatchPlan::default(),
                ));
            }

            let suggestions: Vec<SuggestionView> = divisions
                .iter()
                .filter_map(|d| {
                    self.index.get(*d).map(|entry| SuggestionView {
                        division_id: *d,
                        name: entry.name.clone(),
                        path: self.index.path(*d),
                        score,
                    })
                })
                .collect();
            let mut plan = MatchPlan::default();
            plan.push(RegionDecision {
                region_id,
                status: Some(MatchStatus::NeedsReview),
                suggestions: suggestions
                    .iter()
                    .map(|s| SuggestionDraft {
                        division_id: s.division_id,
                        path: s.path.clone(),
                        score: s.score,
                    })
                    .collect(),
                assignments: Vec::new(),
                source: SuggestionSource::Geocode,
            });
            return Ok((
                GeocodeMatchResult {
                    found: true,
                    suggestions,
                    geocoded_name: Some(hit.display_name),
                    search_radius_km: Some(radius_km),
                },
                plan.without_known(state),
            ));
        }

        debug!("Region {}: nothing within the widest radius", region_id);
        Ok((GeocodeMatchResult::not_found(Some(hit.display_name)), MatchPlan::default()))
    }

    /// Known ids not rejected, suggested or assigned for the region, deepest first.
    fn fresh_divisions(
        &self,
        region_id: RegionId,
        raw: Vec<DivisionId>,
        state: &ExistingMatchState,
    ) -> Vec<DivisionId> {
        let mut seen: HashSet<DivisionId> = HashSet::new();
        let mut out: Vec<DivisionId> = raw
            .into_iter()
            .filter(|d| {
                self.index.contains(*d) && !state.is_known(region_id, *d) && seen.insert(*d)
            })
            .collect();
        out.sort_by(|a, b| {
            self.index
                .depth(*b)
                .cmp(&self.index.depth(*a))
                .then_with(|| a.cmp(b))
        });
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ImportRegion;
    use crate::reference::index::tests::sample_index;
    use async_trait::async_trait;
    use std::collections::HashMap;
    use tokio::sync::Mutex;

    struct FixedGeocoder {
        answers: HashMap<String, GeocodeHit>,
        queries: Mutex<Vec<String>>,
    }

    impl FixedGeocoder {
        fn new(answers: &[(&str, f64, f64)]) -> Self {
            Self {
                answers: answers
                    .iter()
                    .map(|(q, lat, lon)| {
                        (
                            q.to_string(),
                            GeocodeHit {
                                lat: *lat,
                                lon: *lon,
                                display_name: format!("{} (geocoded)", q),
                            },
                        )
                    })
                    .collect(),
                queries: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl Geocoder for FixedGeocoder {
        async fn geocode(&self, query: &str) -> Result<Option<GeocodeHit>> {
            self.queries.lock().await.push(query.to_string());
            Ok(self.answers.get(query).cloned())
        }
    }

    /// Answers containment with `contains` and radius rounds from `by_radius`.
    #[derive(Default)]
    struct FakeSpatial {
        contains: Vec<DivisionId>,
        by_radius: Vec<(f64, Vec<DivisionId>)>,
        radius_calls: Mutex<Vec<f64>>,
    }

    #[async_trait]
    impl SpatialSearch for FakeSpatial {
        async fn containing(&self, _lat: f64, _lon: f64) -> Result<Vec<DivisionId>> {
            Ok(self.contains.clone())
        }

        async fn within(&self, _lat: f64, _lon: f64, radius_km: f64) -> Result<Vec<DivisionId>> {
            self.radius_calls.lock().await.push(radius_km);
            Ok(self
                .by_radius
                .iter()
                .find(|(r, _)| (*r - radius_km).abs() < f64::EPSILON)
                .map(|(_, ids)| ids.clone())
                .unwrap_or_default())
        }
    }

    fn tree() -> ImportTree {
        ImportTree::from_regions(vec![
            ImportRegion::new(1, "Germany", None),
            ImportRegion::new(2, "Oberbayern (district)", Some(1)),
        ])
    }

    #[test]
    fn test_queries_use_cleaned_name_and_parent() {
        assert_eq!(
            build_queries(&tree(), 2),
            vec!["Oberbayern".to_string(), "Oberbayern, Germany".to_string()]
        );
        assert_eq!(build_queries(&tree(), 1), vec!["Germany".to_string()]);
        assert!(build_queries(&tree(), 99).is_empty());
    }

    #[tokio::test]
    async fn test_exact_containment_does_not_escalate() {
        let index = sample_index();
        let tree = tree();
        let geocoder = FixedGeocoder::new(&[("Oberbayern", 48.1, 11.6)]);
        let spatial = FakeSpatial {
            contains: vec![3],
            by_radius: vec![(10.0, vec![3, 4, 5])],
            ..FakeSpatial::default()
        };
        let matcher = GeocodeMatcher::new(&index, &tree, &geocoder, &spatial);
        let (result, plan) = matcher
            .match_region(2, &ExistingMatchState::default(), &AtomicBool::new(false))
            .await
            .unwrap();

        assert!(result.found);
        assert_eq!(result.search_radius_km, Some(0.0));
        assert_eq!(result.suggestions.len(), 1);
        assert_eq!(result.suggestions[0].division_id, 3);
        assert_eq!(result.suggestions[0].score, GEOCODE_EXACT_SCORE);
        assert!(spatial.radius_calls.lock().await.is_empty());
        assert_eq!(plan.decision_for(2).unwrap().status, Some(MatchStatus::NeedsReview));
        assert_eq!(geocoder.queries.lock().await.len(), 1);
    }

    #[tokio::test]
    async fn test_overlapping_layers_come_back_deepest_first_without_known() {
        let index = sample_index();
        let tree = tree();
        let geocoder = FixedGeocoder::new(&[("Oberbayern", 48.1, 11.6)]);
        let spatial = FakeSpatial {
            contains: vec![1, 2, 3, 4242],
            ..FakeSpatial::default()
        };
        let mut state = ExistingMatchState::default();
        state.reject(2, 3);
        state.assigned.entry(2).or_default().insert(1);

        let matcher = GeocodeMatcher::new(&index, &tree, &geocoder, &spatial);
        let (result, plan) =
            matcher.match_region(2, &state, &AtomicBool::new(false)).await.unwrap();
        let ids: Vec<DivisionId> = result.suggestions.iter().map(|s| s.division_id).collect();
        assert_eq!(ids, vec![2]);
        assert_eq!(plan.suggestion_count(), 1);
    }

    #[tokio::test]
    async fn test_radius_rounds_widen_until_something_is_found() {
        let index = sample_index();
        let tree = tree();
        let geocoder = FixedGeocoder::new(&[("Oberbayern, Germany", 48.1, 11.6)]);
        let spatial = FakeSpatial {
            by_radius: vec![(50.0, vec![3])],
            ..FakeSpatial::default()
        };
        let matcher = GeocodeMatcher::new(&index, &tree, &geocoder, &spatial);
        let (result, _) = matcher
            .match_region(2, &ExistingMatchState::default(), &AtomicBool::new(false))
            .await
            .unwrap();

        assert!(result.found);
        assert_eq!(result.search_radius_km, Some(50.0));
        assert_eq!(
            result.suggestions[0].score,
            GEOCODE_EXACT_SCORE - 2 * GEOCODE_RADIUS_STEP_PENALTY
        );
        assert_eq!(*spatial.radius_calls.lock().await, vec![10.0, 50.0]);
        assert_eq!(
            result.geocoded_name.as_deref(),
            Some("Oberbayern, Germany (geocoded)")
        );
    }

    #[tokio::test]
    async fn test_nothing_found_reports_zero() {
        let index = sample_index();
        let tree = tree();
        let geocoder = FixedGeocoder::new(&[("Oberbayern", 48.1, 11.6)]);
        let spatial = FakeSpatial::default();
        let matcher = GeocodeMatcher::new(&index, &tree, &geocoder, &spatial);
        let (result, plan) = matcher
            .match_region(2, &ExistingMatchState::default(), &AtomicBool::new(false))
            .await
            .unwrap();
        assert!(!result.found);
        assert!(result.suggestions.is_empty());
        assert!(plan.is_empty());
        assert_eq!(spatial.radius_calls.lock().await.len(), 3);

        let nowhere = FixedGeocoder::new(&[]);
        let matcher = GeocodeMatcher::new(&index, &tree, &nowhere, &spatial);
        let (result, _) = matcher
            .match_region(2, &ExistingMatchState::default(), &AtomicBool::new(false))
            .await
            .unwrap();
        assert!(!result.found);
        assert_eq!(result.geocoded_name, None);
        assert_eq!(nowhere.queries.lock().await.len(), 2);
    }

    #[tokio::test]
    async fn test_resolved_region_is_refused_without_geocoding() {
        let index = sample_index();
        let tree = tree();
        let geocoder = FixedGeocoder::new(&[("Oberbayern", 48.1, 11.6)]);
        let spatial = FakeSpatial {
            contains: vec![3],
            ..FakeSpatial::default()
        };
        let mut state = ExistingMatchState::default();
        state.statuses.insert(2, MatchStatus::AutoMatched);
        state.assigned.entry(2).or_default().insert(3);

        let matcher = GeocodeMatcher::new(&index, &tree, &geocoder, &spatial);
        let err = matcher
            .match_region(2, &state, &AtomicBool::new(false))
            .await
            .unwrap_err();
        assert_eq!(
            err.downcast_ref::<MatchError>(),
            Some(&MatchError::AlreadyResolved(2, MatchStatus::AutoMatched))
        );
        assert!(geocoder.queries.lock().await.is_empty());
    }

    #[tokio::test]
    async fn test_cancelled_before_geocoding() {
        let index = sample_index();
        let tree = tree();
        let geocoder = FixedGeocoder::new(&[]);
        let spatial = FakeSpatial::default();
        let matcher = GeocodeMatcher::new(&index, &tree, &geocoder, &spatial);
        let err = matcher
            .match_region(2, &ExistingMatchState::default(), &AtomicBool::new(true))
            .await
            .unwrap_err();
        assert!(crate::error::is_cancelled(&err));
        assert!(geocoder.queries.lock().await.is_empty());
    }
}
