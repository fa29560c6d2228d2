// src/ai/prompt.rs
//! System instructions and the per-region context payload sent to the model.

use anyhow::{Context, Result};
use log::warn;
use serde::Serialize;

use crate::ai::client::CompletionRequest;
use crate::matching::normalize::clean_label;
use crate::matching::state::ExistingMatchState;
use crate::models::{DivisionId, ImportTree, RegionId};
use crate::reference::index::ReferenceIndex;

pub const SYSTEM_PROMPT: &str = r#"You match user-supplied geographic region names to an official administrative-division hierarchy (countries, states, provinces, districts).

For every region in the input, decide which official division(s) it corresponds to. Regions may use local spellings, historical names, exonyms or endonyms ("Bayern" is "Bavaria"), or may cover several official divisions at once (a historical region split across two modern provinces).

Rules:
- Never propose a division listed under "rejected" for that region.
- If one of the "currentSuggestions" is right, return its divisionId.
- Otherwise return the official name in divisionName, plus other spellings in alternativeNames.
- If the region spans several official divisions, put the main one in divisionId/divisionName and the rest in additionalDivisions.
- confidence is "high" only when you are certain.

Respond with a JSON array only, one object per input region, no prose:
[
  {
    "regionId": 123,
    "divisionId": 456 or null,
    "divisionName": "Official Name" or null,
    "alternativeNames": ["Other Spelling"],
    "additionalDivisions": [{"name": "Second Division", "alternativeNames": []}],
    "confidence": "high" | "medium" | "low",
    "reasoning": "one short sentence"
  }
]"#;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ContextSuggestion {
    pub division_id: DivisionId,
    pub name: String,
    pub path: String,
    pub score: i32,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ContextRejection {
    pub division_id: DivisionId,
    pub name: String,
    pub path: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RegionContext {
    pub region_id: RegionId,
    pub name: String,
    /// Ancestor names from the root, the region itself excluded.
    pub path: String,
    pub has_children: bool,
    pub current_suggestions: Vec<ContextSuggestion>,
    pub rejected: Vec<ContextRejection>,
}

/// Builds the context of one region. `extra` carries pre-pass candidates
/// `(division, score)` merged after the stored suggestions. Stale division
/// ids are skipped.
pub fn build_region_context(
    index: &ReferenceIndex,
    tree: &ImportTree,
    state: &ExistingMatchState,
    region_id: RegionId,
    extra: &[(DivisionId, i32)],
) -> Option<RegionContext> {
    let region = tree.get(region_id)?;
    let path = tree
        .ancestors(region_id)
        .iter()
        .map(|r| r.name.as_str())
        .collect::<Vec<_>>()
        .join(" > ");

    let mut stored: Vec<DivisionId> = state.suggested_for(region_id).iter().copied().collect();
    stored.sort_by_key(|d| (-state.suggestion_score(region_id, *d).unwrap_or(0), *d));

    let mut current_suggestions: Vec<ContextSuggestion> = Vec::new();
    let stored_with_scores = stored
        .into_iter()
        .map(|d| (d, state.suggestion_score(region_id, d).unwrap_or(0)));
    for (division_id, score) in stored_with_scores.chain(extra.iter().copied()) {
        if state.is_rejected(region_id, division_id)
            || current_suggestions.iter().any(|s| s.division_id == division_id)
        {
            continue;
        }
        match index.get(division_id) {
            Some(entry) => current_suggestions.push(ContextSuggestion {
                division_id,
                name: entry.name.clone(),
                path: index.path(division_id),
                score,
            }),
            None => warn!(
                "Region {}: suggested division {} no longer exists; leaving it out of the prompt",
                region_id, division_id
            ),
        }
    }

    let mut rejected_ids: Vec<DivisionId> = state.rejected_for(region_id).iter().copied().collect();
    rejected_ids.sort_unstable();
    let rejected = rejected_ids
        .into_iter()
        .filter_map(|d| {
            index.get(d).map(|entry| ContextRejection {
                division_id: d,
                name: entry.name.clone(),
                path: index.path(d),
            })
        })
        .collect();

    Some(RegionContext {
        region_id,
        name: clean_label(&region.name),
        path,
        has_children: !region.is_leaf(),
        current_suggestions,
        rejected,
    })
}

pub fn build_request(contexts: &[RegionContext]) -> Result<CompletionRequest> {
    let payload =
        serde_json::to_string_pretty(contexts).context("Failed to serialize region contexts")?;
    Ok(CompletionRequest {
        system: SYSTEM_PROMPT.to_string(),
        user: format!(
            "Match these {} regions. Return exactly one object per regionId.\n\n{}",
            contexts.len(),
            payload
        ),
    })
}
