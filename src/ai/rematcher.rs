// src/ai/rematcher.rs
//! AI-assisted rematching of regions the tree pass left unresolved.
//!
//! Regions go to the model in fixed-size batches. Each verdict is resolved
//! to reference divisions (trusted id first, then names through the
//! candidate cascade), turned into a plan and written in one transaction per
//! batch. A failed model call or write costs only its own batch.

use anyhow::{Context, Result};
use log::{debug, error, info, warn};
use std::collections::{HashMap, HashSet};

use crate::ai::client::{CompletionClient, Pricing, TokenUsage};
use crate::ai::prompt::{build_region_context, build_request, RegionContext};
use crate::ai::response::{parse_verdicts, Confidence, RegionVerdict};
use crate::error::MatchError;
use crate::matching::candidates::{find_candidates, CandidateQuery};
use crate::matching::plan::{MatchPlan, RegionDecision, SuggestionDraft};
use crate::matching::run_registry::RunTicket;
use crate::matching::state::ExistingMatchState;
use crate::matching::writer::PlanWriter;
use crate::models::stats_models::{SingleRegionAiResult, SuggestionView};
use crate::models::{DivisionId, HierarchyId, ImportTree, MatchStatus, RegionId, SuggestionSource};
use crate::reference::index::ReferenceIndex;
use crate::utils::config::MatcherConfig;
use crate::utils::constants::{
    AI_HIGH_CONFIDENCE_SCORE, AI_LOW_CONFIDENCE_SCORE, AI_MEDIUM_CONFIDENCE_SCORE,
    AI_PRE_PASS_CANDIDATES,
};

/// Parsed reply of one model call.
#[derive(Debug, Clone)]
pub struct ModelReply {
    pub verdicts: Vec<RegionVerdict>,
    pub usage: TokenUsage,
    pub cost: f64,
}

/// A verdict after resolution to reference divisions.
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedVerdict {
    pub region_id: RegionId,
    /// Primary division first.
    pub divisions: Vec<DivisionId>,
    pub auto_matched: bool,
    pub reasoning: Option<String>,
}

pub struct AiRematcher<'a> {
    index: &'a ReferenceIndex,
    tree: &'a ImportTree,
    client: &'a dyn CompletionClient,
    pricing: Pricing,
    config: &'a MatcherConfig,
}

fn confidence_score(confidence: Confidence) -> i32 {
    match confidence {
        Confidence::High => AI_HIGH_CONFIDENCE_SCORE,
        Confidence::Medium => AI_MEDIUM_CONFIDENCE_SCORE,
        Confidence::Low => AI_LOW_CONFIDENCE_SCORE,
    }
}

impl<'a> AiRematcher<'a> {
    pub fn new(
        index: &'a ReferenceIndex,
        tree: &'a ImportTree,
        client: &'a dyn CompletionClient,
        pricing: Pricing,
        config: &'a MatcherConfig,
    ) -> Self {
        Self {
            index,
            tree,
            client,
            pricing,
            config,
        }
    }

    /// Cheap in-memory candidates for a single-region prompt.
    pub fn local_pre_pass(
        &self,
        region_id: RegionId,
        state: &ExistingMatchState,
    ) -> Vec<(DivisionId, i32)> {
        let Some(region) = self.tree.get(region_id) else {
            return Vec::new();
        };
        let query = CandidateQuery::global(self.config.trigram_min_similarity)
            .excluding(state.rejected_for(region_id));
        find_candidates(self.index, &region.name, &query)
            .into_iter()
            .take(AI_PRE_PASS_CANDIDATES)
            .map(|c| (c.division_id, c.score))
            .collect()
    }

    fn contexts(
        &self,
        regions: &[RegionId],
        state: &ExistingMatchState,
        extras: &HashMap<RegionId, Vec<(DivisionId, i32)>>,
    ) -> Vec<RegionContext> {
        regions
            .iter()
            .filter_map(|&id| {
                let extra = extras.get(&id).map(|v| v.as_slice()).unwrap_or(&[]);
                let ctx = build_region_context(self.index, self.tree, state, id, extra);
                if ctx.is_none() {
                    warn!("Region {} no longer exists in the import tree; skipping", id);
                }
                ctx
            })
            .collect()
    }

    /// One model call. Transport failures are errors; unusable text is an
    /// empty verdict list.
    pub async fn query_model(&self, contexts: &[RegionContext]) -> Result<ModelReply> {
        let request = build_request(contexts)?;
        let completion = self
            .client
            .complete(&request)
            .await
            .context("Language model call failed")?;
        let cost = self.pricing.cost(&completion.usage);
        let verdicts = parse_verdicts(&completion.text);
        debug!(
            "Model returned {} verdicts for {} regions ({} in / {} out tokens, ${:.4})",
            verdicts.len(),
            contexts.len(),
            completion.usage.input_tokens,
            completion.usage.output_tokens,
            cost
        );
        Ok(ModelReply {
            verdicts,
            usage: completion.usage,
            cost,
        })
    }

    /// Divisions assigned to the nearest assigned ancestor, and everything below them.
    fn ancestor_scope(
        &self,
        region_id: RegionId,
        state: &ExistingMatchState,
    ) -> HashSet<DivisionId> {
        for ancestor in self.tree.ancestors(region_id).iter().rev() {
            let assigned = state.assigned_for(ancestor.id);
            if !assigned.is_empty() {
                return assigned.iter().flat_map(|d| self.index.descendants(*d)).collect();
            }
        }
        HashSet::new()
    }

    /// First name that resolves to a division not in `blocked`.
    fn resolve_names(
        &self,
        names: &[&str],
        blocked: &HashSet<DivisionId>,
        scope: &HashSet<DivisionId>,
    ) -> Option<DivisionId> {
        let mut query = CandidateQuery::global(self.config.trigram_min_similarity)
            .without_prefix()
            .excluding(blocked);
        if !scope.is_empty() {
            query = query.preferring(scope);
        }
        names.iter().find_map(|name| {
            find_candidates(self.index, name, &query)
                .first()
                .map(|c| c.division_id)
        })
    }

    /// Resolves a verdict to divisions, primary first. Rejected divisions
    /// never come back.
    pub fn resolve_verdict(
        &self,
        verdict: &RegionVerdict,
        state: &ExistingMatchState,
    ) -> Vec<DivisionId> {
        let region_id = verdict.region_id;
        let mut blocked: HashSet<DivisionId> = state.rejected_for(region_id).clone();
        let scope = self.ancestor_scope(region_id, state);
        let mut resolved: Vec<DivisionId> = Vec::new();

        let trusted = verdict.division_id.filter(|id| {
            let usable = self.index.contains(*id) && !blocked.contains(id);
            if !usable {
                warn!(
                    "Region {}: model proposed division {} which is unknown or rejected; \
                     resolving by name",
                    region_id, id
                );
            }
            usable
        });
        let primary =
            trusted.or_else(|| self.resolve_names(&verdict.candidate_names(), &blocked, &scope));
        if let Some(d) = primary {
            blocked.insert(d);
            resolved.push(d);
        }

        for extra in &verdict.additional_divisions {
            match self.resolve_names(&extra.candidate_names(), &blocked, &scope) {
                Some(d) => {
                    blocked.insert(d);
                    resolved.push(d);
                }
                None => debug!(
                    "Region {}: additional division '{}' did not resolve",
                    region_id, extra.name
                ),
            }
        }
        resolved
    }

    /// Turns the verdicts for `batch` into a plan. Verdicts for regions
    /// outside the batch, duplicates and low-confidence verdicts (unless
    /// `accept_low`) are dropped.
    pub fn plan_from_verdicts(
        &self,
        batch: &[RegionId],
        verdicts: &[RegionVerdict],
        state: &ExistingMatchState,
        accept_low: bool,
    ) -> (MatchPlan, Vec<ResolvedVerdict>) {
        let wanted: HashSet<RegionId> = batch.iter().copied().collect();
        let mut seen: HashSet<RegionId> = HashSet::new();
        let mut plan = MatchPlan::default();
        let mut resolved_all = Vec::new();

        for verdict in verdicts {
            let region_id = verdict.region_id;
            if !wanted.contains(&region_id) {
                warn!(
                    "Model answered for region {} which was not in the batch; ignoring",
                    region_id
                );
                continue;
            }
            if !seen.insert(region_id) {
                continue;
            }
            if verdict.is_empty() {
                debug!("Region {}: verdict names no division", region_id);
                continue;
            }
            if verdict.confidence == Confidence::Low && !accept_low {
                debug!("Region {}: low-confidence verdict dropped", region_id);
                continue;
            }
            let Some(region) = self.tree.get(region_id) else {
                continue;
            };
            let divisions = self.resolve_verdict(verdict, state);
            if divisions.is_empty() {
                debug!(
                    "Region {} '{}': verdict did not resolve to any division",
                    region_id, region.name
                );
                continue;
            }

            let auto_matched = verdict.confidence == Confidence::High
                && verdict.additional_divisions.is_empty()
                && divisions.len() == 1
                && !state.is_human_owned(region_id);

            let decision = if auto_matched {
                RegionDecision {
                    region_id,
                    status: Some(MatchStatus::AutoMatched),
                    suggestions: Vec::new(),
                    assignments: divisions.clone(),
                    source: SuggestionSource::Ai,
                }
            } else {
                let score = confidence_score(verdict.confidence);
                RegionDecision {
                    region_id,
                    status: Some(if region.is_leaf() {
                        MatchStatus::NeedsReview
                    } else {
                        MatchStatus::Suggested
                    }),
                    suggestions: divisions
                        .iter()
                        .map(|d| SuggestionDraft {
                            division_id: *d,
                            path: self.index.path(*d),
                            score,
                        })
                        .collect(),
                    assignments: Vec::new(),
                    source: SuggestionSource::Ai,
                }
            };
            plan.push(decision);
            resolved_all.push(ResolvedVerdict {
                region_id,
                divisions,
                auto_matched,
                reasoning: verdict.reasoning.clone(),
            });
        }
        (plan.without_known(state), resolved_all)
    }

    /// Batch mode over `regions`. Progress lives in the ticket. Returns
    /// `MatchError::Cancelled` when the ticket is cancelled between calls.
    pub async fn run(
        &self,
        hierarchy_id: HierarchyId,
        regions: &[RegionId],
        state: &mut ExistingMatchState,
        writer: &dyn PlanWriter,
        ticket: &RunTicket,
        batch_size: usize,
    ) -> Result<()> {
        let batch_size = batch_size.max(1);
        let no_extras = HashMap::new();
        let total_batches = regions.len().div_ceil(batch_size);

        for (batch_no, batch) in regions.chunks(batch_size).enumerate() {
            if ticket.is_cancelled() {
                return Err(MatchError::Cancelled.into());
            }
            let contexts = self.contexts(batch, state, &no_extras);
            if contexts.is_empty() {
                ticket.progress.lock().await.processed += batch.len();
                continue;
            }

            let reply = match self.query_model(&contexts).await {
                Ok(reply) => reply,
                Err(e) => {
                    warn!("Batch {}/{} skipped: {:#}", batch_no + 1, total_batches, e);
                    let mut p = ticket.progress.lock().await;
                    p.failed_batches += 1;
                    p.processed += batch.len();
                    drop(p);
                    if ticket.is_cancelled() {
                        return Err(MatchError::Cancelled.into());
                    }
                    continue;
                }
            };
            ticket.progress.lock().await.cost_so_far += reply.cost;
            if ticket.is_cancelled() {
                return Err(MatchError::Cancelled.into());
            }

            let (plan, _) = self.plan_from_verdicts(batch, &reply.verdicts, state, false);
            let improved = plan.decisions.iter().filter(|d| d.adds_anything()).count();
            let auto = plan
                .decisions
                .iter()
                .filter(|d| d.status == Some(MatchStatus::AutoMatched) && !d.assignments.is_empty())
                .count();

            let written = writer.write_plan(hierarchy_id, &plan).await;
            let mut p = ticket.progress.lock().await;
            p.processed += batch.len();
            match written {
                Ok(_) => {
                    state.absorb(&plan);
                    p.improved += improved;
                    p.auto_matched += auto;
                    info!(
                        "🤖 Batch {}/{}: {} regions, {} improved, {} auto-matched, ${:.4} so far",
                        batch_no + 1,
                        total_batches,
                        batch.len(),
                        improved,
                        auto,
                        p.cost_so_far
                    );
                }
                Err(e) => {
                    error!("Batch {}/{} rolled back: {:#}", batch_no + 1, total_batches, e);
                    p.failed_batches += 1;
                }
            }
        }
        Ok(())
    }

    /// Single-region mode: a batch of one with pre-pass candidates in the
    /// prompt, low confidence accepted. Only open regions are accepted; the
    /// call's cost lands in the ticket even when the run is cancelled.
    pub async fn match_single(
        &self,
        hierarchy_id: HierarchyId,
        region_id: RegionId,
        state: &mut ExistingMatchState,
        writer: &dyn PlanWriter,
        pre_pass: Vec<(DivisionId, i32)>,
        ticket: &RunTicket,
    ) -> Result<SingleRegionAiResult> {
        if ticket.is_cancelled() {
            return Err(MatchError::Cancelled.into());
        }
        state.ensure_open(region_id)?;
        let batch = [region_id];
        let extras = HashMap::from([(region_id, pre_pass)]);
        let contexts = self.contexts(&batch, state, &extras);
        if contexts.is_empty() {
            return Err(MatchError::RegionNotFound(region_id).into());
        }

        let reply = self.query_model(&contexts).await?;
        ticket.progress.lock().await.cost_so_far += reply.cost;
        if ticket.is_cancelled() {
            return Err(MatchError::Cancelled.into());
        }

        let (plan, resolved) = self.plan_from_verdicts(&batch, &reply.verdicts, state, true);
        writer.write_plan(hierarchy_id, &plan).await?;
        state.absorb(&plan);

        let improved = plan.decisions.iter().any(|d| d.adds_anything());
        let verdict = resolved.into_iter().next();
        let reasoning = verdict
            .as_ref()
            .and_then(|v| v.reasoning.clone())
            .or_else(|| {
                reply
                    .verdicts
                    .iter()
                    .find(|v| v.region_id == region_id)
                    .and_then(|v| v.reasoning.clone())
            });

        let views: Vec<SuggestionView> = verdict
            .as_ref()
            .map(|v| v.divisions.iter().filter_map(|d| self.view(*d, state, region_id)).collect())
            .unwrap_or_default();
        let mut views = views.into_iter();

        Ok(SingleRegionAiResult {
            improved,
            suggestion: views.next(),
            additional: views.collect(),
            auto_matched: improved && verdict.as_ref().map(|v| v.auto_matched).unwrap_or(false),
            reasoning,
            cost: reply.cost,
        })
    }

    fn view(
        &self,
        division: DivisionId,
        state: &ExistingMatchState,
        region_id: RegionId,
    ) -> Option<SuggestionView> {
        let entry = self.index.get(division)?;
        Some(SuggestionView {
            division_id: division,
            name: entry.name.clone(),
            path: self.index.path(division),
            score: state.suggestion_score(region_id, division).unwrap_or(AI_HIGH_CONFIDENCE_SCORE),
        })
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::ai::client::{Completion, CompletionRequest};
    use crate::matching::run_registry::RunRegistry;
    use crate::matching::tree_matcher::TreeMatcher;
    use crate::matching::writer::WriteSummary;
    use crate::models::stats_models::{MatchMethodType, RunProgress};
    use crate::models::ImportRegion;
    use crate::reference::index::tests::sample_index;
    use anyhow::anyhow;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::sync::Mutex;

    /// Replies with canned texts in order; the last one repeats.
    pub(crate) struct ScriptedClient {
        pub replies: Vec<Result<String, String>>,
        pub calls: Mutex<Vec<CompletionRequest>>,
        pub cancel_on_call: Option<Arc<AtomicBool>>,
    }

    impl ScriptedClient {
        pub fn new(replies: Vec<Result<String, String>>) -> Self {
            Self {
                replies,
                calls: Mutex::new(Vec::new()),
                cancel_on_call: None,
            }
        }
    }

    #[async_trait]
    impl CompletionClient for ScriptedClient {
        async fn complete(&self, request: &CompletionRequest) -> Result<Completion> {
            let mut calls = self.calls.lock().await;
            let i = calls.len().min(self.replies.len() - 1);
            calls.push(request.clone());
            if let Some(flag) = &self.cancel_on_call {
                flag.store(true, Ordering::SeqCst);
            }
            match &self.replies[i] {
                Ok(text) => Ok(Completion {
                    text: text.clone(),
                    usage: TokenUsage {
                        input_tokens: 1_000_000,
                        output_tokens: 0,
                    },
                }),
                Err(msg) => Err(anyhow!(msg.clone())),
            }
        }
    }

    #[derive(Default)]
    pub(crate) struct MemoryWriter {
        pub plans: Mutex<Vec<MatchPlan>>,
        pub fail: bool,
    }

    #[async_trait]
    impl PlanWriter for MemoryWriter {
        async fn write_plan(
            &self,
            _hierarchy_id: HierarchyId,
            plan: &MatchPlan,
        ) -> Result<WriteSummary> {
            if self.fail {
                return Err(anyhow!("simulated write failure"));
            }
            self.plans.lock().await.push(plan.clone());
            Ok(WriteSummary::default())
        }
    }

    fn pricing() -> Pricing {
        Pricing {
            input_per_mtok: 0.15,
            output_per_mtok: 0.60,
        }
    }

    fn unresolved_tree() -> (ImportTree, ExistingMatchState) {
        let tree = ImportTree::from_regions(vec![
            ImportRegion::new(100, "Bayern", None),
            ImportRegion::new(101, "Donbas", None),
            ImportRegion::new(102, "Atlantis", None),
        ]);
        let mut state = ExistingMatchState::default();
        state.statuses.insert(100, MatchStatus::NoCandidates);
        state.statuses.insert(101, MatchStatus::NoCandidates);
        state.statuses.insert(102, MatchStatus::NoCandidates);
        (tree, state)
    }

    const BAYERN_AND_DONBAS: &str = r#"[
        {"regionId": 100, "divisionId": null, "divisionName": "Bavaria",
         "alternativeNames": ["Bayern"], "additionalDivisions": [],
         "confidence": "high", "reasoning": "German name of Bavaria"},
        {"regionId": 101, "divisionId": null, "divisionName": "Donetsk Oblast",
         "alternativeNames": [],
         "additionalDivisions": [{"name": "Luhansk Oblast", "alternativeNames": ["Lugansk"]}],
         "confidence": "high", "reasoning": "Historical region across two oblasts"},
        {"regionId": 102, "divisionId": null, "divisionName": null, "confidence": "low"}
    ]"#;

    async fn ticket(total: usize) -> RunTicket {
        RunRegistry::new(Duration::from_secs(60))
            .create(1, MatchMethodType::AiBatch, total)
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_bayern_auto_matches_and_donbas_needs_review() {
        let index = sample_index();
        let (tree, mut state) = unresolved_tree();
        let client = ScriptedClient::new(vec![Ok(BAYERN_AND_DONBAS.to_string())]);
        let writer = MemoryWriter::default();
        let config = MatcherConfig::default();
        let rematcher = AiRematcher::new(&index, &tree, &client, pricing(), &config);
        let ticket = ticket(3).await;

        let regions = state.unresolved_regions(&tree.preorder());
        rematcher.run(1, &regions, &mut state, &writer, &ticket, 25).await.unwrap();

        let plans = writer.plans.lock().await;
        assert_eq!(plans.len(), 1);
        let bayern = plans[0].decision_for(100).unwrap();
        assert_eq!(bayern.status, Some(MatchStatus::AutoMatched));
        assert_eq!(bayern.assignments, vec![3]);

        let donbas = plans[0].decision_for(101).unwrap();
        assert_eq!(donbas.status, Some(MatchStatus::NeedsReview));
        assert!(donbas.assignments.is_empty());
        let ids: Vec<DivisionId> = donbas.suggestions.iter().map(|s| s.division_id).collect();
        assert_eq!(ids, vec![11, 12]);
        assert!(plans[0].decision_for(102).is_none());

        let p: RunProgress = ticket.progress.lock().await.clone();
        assert_eq!(p.processed, 3);
        assert_eq!(p.improved, 2);
        assert_eq!(p.auto_matched, 1);
        assert!((p.cost_so_far - 0.15).abs() < 1e-9);
        assert!(state.assigned_for(100).contains(&3));
    }

    #[tokio::test]
    async fn test_rejected_division_is_never_proposed_again() {
        let index = sample_index();
        let (tree, mut state) = unresolved_tree();
        state.reject(100, 3);
        let client = ScriptedClient::new(vec![Ok(
            r#"[{"regionId": 100, "divisionId": 3, "divisionName": "Bavaria",
                 "confidence": "high"}]"#
                .to_string(),
        )]);
        let writer = MemoryWriter::default();
        let config = MatcherConfig::default();
        let rematcher = AiRematcher::new(&index, &tree, &client, pricing(), &config);

        rematcher.run(1, &[100], &mut state, &writer, &ticket(1).await, 25).await.unwrap();
        let plans = writer.plans.lock().await;
        assert!(plans[0].decision_for(100).is_none());
        assert!(state.assigned_for(100).is_empty());

        let sent = &client.calls.lock().await[0].user;
        assert!(sent.contains("\"rejected\""));
        assert!(sent.contains("Europe > Germany > Bavaria"));
    }

    #[tokio::test]
    async fn test_malformed_reply_and_failed_call_do_not_stop_the_run() {
        let index = sample_index();
        let (tree, mut state) = unresolved_tree();
        let client = ScriptedClient::new(vec![
            Err("HTTP 503".to_string()),
            Ok("Sorry, I cannot produce JSON today.".to_string()),
        ]);
        let writer = MemoryWriter::default();
        let config = MatcherConfig::default();
        let rematcher = AiRematcher::new(&index, &tree, &client, pricing(), &config);
        let ticket = ticket(3).await;

        rematcher.run(1, &[100, 101, 102], &mut state, &writer, &ticket, 2).await.unwrap();
        let p = ticket.progress.lock().await.clone();
        assert_eq!(p.processed, 3);
        assert_eq!(p.failed_batches, 1);
        assert_eq!(p.improved, 0);
        assert!((p.cost_so_far - 0.15).abs() < 1e-9);
        assert_eq!(client.calls.lock().await.len(), 2);
    }

    #[tokio::test]
    async fn test_write_failure_leaves_state_untouched() {
        let index = sample_index();
        let (tree, mut state) = unresolved_tree();
        let before = state.clone();
        let client = ScriptedClient::new(vec![Ok(BAYERN_AND_DONBAS.to_string())]);
        let writer = MemoryWriter {
            fail: true,
            ..MemoryWriter::default()
        };
        let config = MatcherConfig::default();
        let rematcher = AiRematcher::new(&index, &tree, &client, pricing(), &config);
        let ticket = ticket(3).await;

        rematcher.run(1, &[100, 101, 102], &mut state, &writer, &ticket, 25).await.unwrap();
        let p = ticket.progress.lock().await.clone();
        assert_eq!(p.failed_batches, 1);
        assert_eq!(p.improved, 0);
        assert_eq!(p.auto_matched, 0);
        assert_eq!(p.processed, 3);
        assert!(writer.plans.lock().await.is_empty());
        assert_eq!(state, before);
    }

    #[tokio::test]
    async fn test_cancellation_after_call_stops_before_writing() {
        let index = sample_index();
        let (tree, mut state) = unresolved_tree();
        let ticket = ticket(3).await;
        let mut client = ScriptedClient::new(vec![Ok(BAYERN_AND_DONBAS.to_string())]);
        client.cancel_on_call = Some(ticket.cancel.clone());
        let writer = MemoryWriter::default();
        let config = MatcherConfig::default();
        let rematcher = AiRematcher::new(&index, &tree, &client, pricing(), &config);

        let err = rematcher
            .run(1, &[100, 101, 102], &mut state, &writer, &ticket, 1)
            .await
            .unwrap_err();
        assert!(crate::error::is_cancelled(&err));
        assert!(writer.plans.lock().await.is_empty());
        assert_eq!(client.calls.lock().await.len(), 1);
        assert!((ticket.progress.lock().await.cost_so_far - 0.15).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_single_region_accepts_low_confidence_and_uses_pre_pass() {
        let index = sample_index();
        let (tree, mut state) = unresolved_tree();
        let client = ScriptedClient::new(vec![Ok(
            r#"[{"regionId": 101, "divisionName": "Donetsk Oblast", "confidence": "low",
                 "reasoning": "best guess"}]"#
                .to_string(),
        )]);
        let writer = MemoryWriter::default();
        let config = MatcherConfig::default();
        let rematcher = AiRematcher::new(&index, &tree, &client, pricing(), &config);
        let ticket = ticket(1).await;

        let result = rematcher
            .match_single(1, 101, &mut state, &writer, vec![(12, 310)], &ticket)
            .await
            .unwrap();
        assert!(result.improved);
        assert!(!result.auto_matched);
        let suggestion = result.suggestion.unwrap();
        assert_eq!(suggestion.division_id, 11);
        assert_eq!(suggestion.score, AI_LOW_CONFIDENCE_SCORE);
        assert_eq!(result.reasoning.as_deref(), Some("best guess"));
        assert!((result.cost - 0.15).abs() < 1e-9);

        let sent = &client.calls.lock().await[0].user;
        assert!(sent.contains("Luhansk Oblast"));
        assert!((ticket.progress.lock().await.cost_so_far - 0.15).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_single_region_write_failure_leaves_state_untouched() {
        let index = sample_index();
        let (tree, mut state) = unresolved_tree();
        let before = state.clone();
        let client = ScriptedClient::new(vec![Ok(BAYERN_AND_DONBAS.to_string())]);
        let writer = MemoryWriter {
            fail: true,
            ..MemoryWriter::default()
        };
        let config = MatcherConfig::default();
        let rematcher = AiRematcher::new(&index, &tree, &client, pricing(), &config);

        let result = rematcher
            .match_single(1, 100, &mut state, &writer, Vec::new(), &ticket(1).await)
            .await;
        assert!(result.is_err());
        assert_eq!(state, before);
    }

    #[tokio::test]
    async fn test_single_region_refuses_resolved_region() {
        let index = sample_index();
        let (tree, mut state) = unresolved_tree();
        state.statuses.insert(100, MatchStatus::AutoMatched);
        state.assigned.entry(100).or_default().insert(3);
        let client = ScriptedClient::new(vec![Ok(
            r#"[{"regionId": 100, "divisionName": "Saxony", "confidence": "high"}]"#.to_string(),
        )]);
        let writer = MemoryWriter::default();
        let config = MatcherConfig::default();
        let rematcher = AiRematcher::new(&index, &tree, &client, pricing(), &config);

        let err = rematcher
            .match_single(1, 100, &mut state, &writer, Vec::new(), &ticket(1).await)
            .await
            .unwrap_err();
        assert_eq!(
            err.downcast_ref::<MatchError>(),
            Some(&MatchError::AlreadyResolved(100, MatchStatus::AutoMatched))
        );
        assert!(client.calls.lock().await.is_empty());
        assert!(writer.plans.lock().await.is_empty());
        assert_eq!(state.assigned_for(100).len(), 1);
    }

    #[tokio::test]
    async fn test_single_region_cancelled_after_call_still_counts_cost() {
        let index = sample_index();
        let (tree, mut state) = unresolved_tree();
        let ticket = ticket(1).await;
        let mut client = ScriptedClient::new(vec![Ok(BAYERN_AND_DONBAS.to_string())]);
        client.cancel_on_call = Some(ticket.cancel.clone());
        let writer = MemoryWriter::default();
        let config = MatcherConfig::default();
        let rematcher = AiRematcher::new(&index, &tree, &client, pricing(), &config);

        let err = rematcher
            .match_single(1, 100, &mut state, &writer, Vec::new(), &ticket)
            .await
            .unwrap_err();
        assert!(crate::error::is_cancelled(&err));
        assert!(writer.plans.lock().await.is_empty());
        assert!((ticket.progress.lock().await.cost_so_far - 0.15).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_children_left_by_country_fallback_reach_the_ai_pass() {
        let index = sample_index();
        let tree = ImportTree::from_regions(vec![
            ImportRegion::new(1, "Germany", None),
            ImportRegion::new(2, "Bavaria", Some(1)),
            ImportRegion::new(3, "Atlantis", Some(1)),
        ]);
        let config = MatcherConfig::default();
        let mut state = ExistingMatchState::default();
        let (plan, _) = TreeMatcher::new(&index, &tree, &state, &config).plan();
        let plan = plan.without_known(&state);
        state.absorb(&plan);
        assert!(state.assigned_for(1).contains(&2));

        let regions = state.unresolved_regions(&tree.preorder());
        assert_eq!(regions, vec![2, 3]);

        let client = ScriptedClient::new(vec![Ok(
            r#"[{"regionId": 3, "divisionName": "Saxony", "confidence": "medium"}]"#.to_string(),
        )]);
        let writer = MemoryWriter::default();
        let rematcher = AiRematcher::new(&index, &tree, &client, pricing(), &config);
        let ticket = ticket(regions.len()).await;
        rematcher.run(1, &regions, &mut state, &writer, &ticket, 25).await.unwrap();

        let sent = &client.calls.lock().await[0].user;
        assert!(sent.contains("Atlantis"));
        assert!(state.suggested_for(3).contains(&5));
        assert_eq!(ticket.progress.lock().await.processed, 2);
    }

    #[tokio::test]
    async fn test_names_resolve_inside_assigned_ancestor_first() {
        let index = sample_index();
        let tree = ImportTree::from_regions(vec![
            ImportRegion::new(1, "USA", None),
            ImportRegion::new(2, "GA", Some(1)),
        ]);
        let mut state = ExistingMatchState::default();
        state.assigned.entry(1).or_default().insert(41);
        let client = ScriptedClient::new(vec![Ok(String::new())]);
        let config = MatcherConfig::default();
        let rematcher = AiRematcher::new(&index, &tree, &client, pricing(), &config);

        let verdict = RegionVerdict {
            region_id: 2,
            division_id: None,
            division_name: Some("Georgia".into()),
            alternative_names: vec![],
            additional_divisions: vec![],
            confidence: Confidence::High,
            reasoning: None,
        };
        assert_eq!(rematcher.resolve_verdict(&verdict, &state), vec![42]);
    }
}
