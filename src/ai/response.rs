// src/ai/response.rs
//! Strict parsing of model output into typed verdicts.
//!
//! The model is asked for a bare JSON array but often wraps it in prose or
//! code fences, or returns `{"results": [...]}`. Parsing falls through a
//! ladder of strategies; whatever survives is validated item by item so one
//! bad object never costs the rest of the batch.

use log::{debug, warn};
use serde::{Deserialize, Deserializer};
use serde_json::Value;

use crate::models::{DivisionId, RegionId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Confidence {
    Low,
    Medium,
    High,
}

impl<'de> Deserialize<'de> for Confidence {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        match raw.trim().to_ascii_lowercase().as_str() {
            "high" => Ok(Confidence::High),
            "medium" => Ok(Confidence::Medium),
            "low" => Ok(Confidence::Low),
            other => Err(serde::de::Error::custom(format!("unknown confidence '{}'", other))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AdditionalDivision {
    pub name: String,
    #[serde(default)]
    pub alternative_names: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegionVerdict {
    pub region_id: RegionId,
    #[serde(default)]
    pub division_id: Option<DivisionId>,
    #[serde(default)]
    pub division_name: Option<String>,
    #[serde(default)]
    pub alternative_names: Vec<String>,
    #[serde(default)]
    pub additional_divisions: Vec<AdditionalDivision>,
    pub confidence: Confidence,
    #[serde(default)]
    pub reasoning: Option<String>,
}

impl RegionVerdict {
    /// Primary name first, then alternatives, blanks removed.
    pub fn candidate_names(&self) -> Vec<&str> {
        self.division_name
            .iter()
            .map(|s| s.as_str())
            .chain(self.alternative_names.iter().map(|s| s.as_str()))
            .filter(|s| !s.trim().is_empty())
            .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.division_id.is_none()
            && self.candidate_names().is_empty()
            && self.additional_divisions.is_empty()
    }
}

impl AdditionalDivision {
    pub fn candidate_names(&self) -> Vec<&str> {
        std::iter::once(self.name.as_str())
            .chain(self.alternative_names.iter().map(|s| s.as_str()))
            .filter(|s| !s.trim().is_empty())
            .collect()
    }
}

/// Parses model output. Never fails: unusable text yields no verdicts.
pub fn parse_verdicts(text: &str) -> Vec<RegionVerdict> {
    let Some(value) = parse_json_value(text) else {
        warn!("Model response is not valid JSON ({} chars); treating as no result", text.len());
        return Vec::new();
    };
    let items = match value {
        Value::Array(items) => items,
        Value::Object(mut map) => match map.remove("results").or_else(|| map.remove("regions")) {
            Some(Value::Array(items)) => items,
            Some(_) => Vec::new(),
            None => vec![Value::Object(map)],
        },
        _ => Vec::new(),
    };

    items
        .into_iter()
        .filter_map(|item| match serde_json::from_value::<RegionVerdict>(item) {
            Ok(v) => Some(v),
            Err(e) => {
                warn!("Dropping malformed verdict: {}", e);
                None
            }
        })
        .collect()
}

fn parse_json_value(text: &str) -> Option<Value> {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return None;
    }
    if let Ok(v) = serde_json::from_str::<Value>(trimmed) {
        return Some(v);
    }
    let cleaned = clean_json_response(trimmed);
    if let Ok(v) = serde_json::from_str::<Value>(&cleaned) {
        debug!("Parsed model response after cleanup");
        return Some(v);
    }
    for open in ['[', '{'] {
        if let Some(extracted) = extract_json_from_text(&cleaned, open) {
            if let Ok(v) = serde_json::from_str::<Value>(&extracted) {
                debug!("Parsed model response from embedded JSON");
                return Some(v);
            }
        }
    }
    None
}

/// First balanced `[..]` or `{..}` block starting with `open`, skipping
/// brackets inside string literals.
fn extract_json_from_text(text: &str, open: char) -> Option<String> {
    let close = if open == '[' { ']' } else { '}' };
    let start = text.find(open)?;
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escape_next = false;

    for (i, ch) in text[start..].char_indices() {
        if escape_next {
            escape_next = false;
            continue;
        }
        match ch {
            '\\' if in_string => escape_next = true,
            '"' => in_string = !in_string,
            c if c == open && !in_string => depth += 1,
            c if c == close && !in_string => {
                depth = depth.saturating_sub(1);
                if depth == 0 {
                    return Some(text[start..start + i + ch.len_utf8()].to_string());
                }
            }
            _ => {}
        }
    }
    None
}

/// Strips code fences and trailing commas.
fn clean_json_response(response: &str) -> String {
    response
        .trim()
        .replace("```json", "")
        .replace("```", "")
        .replace(",\n}", "\n}")
        .replace(",}", "}")
        .replace(",\n]", "\n]")
        .replace(",]", "]")
        .trim()
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plain_array() {
        let text = r#"[{"regionId": 7, "divisionId": null, "divisionName": "Bavaria",
            "alternativeNames": ["Bayern"], "additionalDivisions": [], "confidence": "high",
            "reasoning": "German endonym"}]"#;
        let verdicts = parse_verdicts(text);
        assert_eq!(verdicts.len(), 1);
        assert_eq!(verdicts[0].region_id, 7);
        assert_eq!(verdicts[0].confidence, Confidence::High);
        assert_eq!(verdicts[0].candidate_names(), vec!["Bavaria", "Bayern"]);
    }

    #[test]
    fn test_fenced_with_prose_and_trailing_comma() {
        let text = "Here you go:\n```json\n\
            [{\"regionId\": 1, \"divisionId\": 12, \"confidence\": \"Medium\"},]\n\
            ```\nHope this helps [really].";
        let verdicts = parse_verdicts(text);
        assert_eq!(verdicts.len(), 1);
        assert_eq!(verdicts[0].division_id, Some(12));
        assert_eq!(verdicts[0].confidence, Confidence::Medium);
    }

    #[test]
    fn test_results_wrapper_and_single_object() {
        let wrapped = r#"{"results": [{"regionId": 1, "confidence": "low"},
            {"regionId": 2, "confidence": "high"}]}"#;
        assert_eq!(parse_verdicts(wrapped).len(), 2);
        let single = r#"{"regionId": 3, "divisionName": "Kyiv", "confidence": "high"}"#;
        assert_eq!(parse_verdicts(single)[0].region_id, 3);
    }

    #[test]
    fn test_bad_items_are_dropped_individually() {
        let text = r#"[{"regionId": 1, "confidence": "certain"},
            {"divisionName": "X", "confidence": "high"},
            {"regionId": 2, "confidence": "high",
             "additionalDivisions": [{"name": "Luhansk Oblast"}]}]"#;
        let verdicts = parse_verdicts(text);
        assert_eq!(verdicts.len(), 1);
        assert_eq!(verdicts[0].region_id, 2);
        assert_eq!(verdicts[0].additional_divisions[0].candidate_names(), vec!["Luhansk Oblast"]);
    }

    #[test]
    fn test_verdict_without_any_division_is_empty() {
        let text = r#"[{"regionId": 1, "divisionName": "  ", "confidence": "low"},
            {"regionId": 2, "divisionId": 12, "confidence": "low"}]"#;
        let verdicts = parse_verdicts(text);
        assert!(verdicts[0].is_empty());
        assert!(!verdicts[1].is_empty());
    }

    #[test]
    fn test_garbage_yields_nothing() {
        assert!(parse_verdicts("").is_empty());
        assert!(parse_verdicts("I cannot help with that.").is_empty());
        assert!(parse_verdicts("[{\"regionId\": 1,").is_empty());
        assert!(parse_verdicts("42").is_empty());
    }

    #[test]
    fn test_extract_ignores_brackets_in_strings() {
        let text = r#"note [ {"a": "x]y"} ] tail"#;
        assert_eq!(extract_json_from_text(text, '[').as_deref(), Some(r#"[ {"a": "x]y"} ]"#));
    }
}
