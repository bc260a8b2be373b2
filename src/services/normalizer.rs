use serde_json::{Map, Value};
use thiserror::Error;

/// Accepted key names, probed in order. The grading service is loosely typed
/// and has drifted between these over time.
const SCORE_KEYS: &[&str] = &["score", "total_score", "percentage", "grade", "points", "ai_score"];
const FEEDBACK_KEYS: &[&str] = &["feedback", "overall_feedback", "comments", "comment", "summary"];
const STRENGTH_KEYS: &[&str] = &["strengths", "positives", "what_went_well"];
const IMPROVEMENT_KEYS: &[&str] =
    &["improvements", "recommendations", "areas_for_improvement", "suggestions"];
const CORRECTION_KEYS: &[&str] = &["corrections", "errors", "mistakes", "fixes"];

pub(crate) const DEFAULT_FEEDBACK: &str =
    "Grading completed, but the grader returned no written feedback.";

#[derive(Debug, Error)]
#[error("AI response is not a JSON object: {0}")]
pub(crate) struct MalformedResponse(pub(crate) String);

/// Strictly typed result of parsing a raw AI response. `score: None` means
/// no score field parsed to a number in [0, 100]; it is never collapsed to 0.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct NormalizedGrading {
    pub(crate) score: Option<f64>,
    pub(crate) feedback: String,
    pub(crate) strengths: Vec<String>,
    pub(crate) improvements: Vec<String>,
    pub(crate) corrections: Vec<String>,
}

impl NormalizedGrading {
    pub(crate) fn failure(feedback: String) -> Self {
        Self {
            score: None,
            feedback,
            strengths: Vec::new(),
            improvements: Vec::new(),
            corrections: Vec::new(),
        }
    }

    pub(crate) fn perfect(feedback: String) -> Self {
        Self { score: Some(100.0), ..Self::failure(feedback) }
    }
}

pub(crate) fn normalize(raw: &Value) -> Result<NormalizedGrading, MalformedResponse> {
    let map = raw.as_object().ok_or_else(|| {
        let shape = match raw {
            Value::Null => "null",
            Value::Bool(_) => "boolean",
            Value::Number(_) => "number",
            Value::String(_) => "string",
            Value::Array(_) => "array",
            Value::Object(_) => "object",
        };
        MalformedResponse(shape.to_string())
    })?;

    Ok(NormalizedGrading {
        score: extract_score(map),
        feedback: extract_feedback(map),
        strengths: extract_list(map, STRENGTH_KEYS),
        improvements: extract_list(map, IMPROVEMENT_KEYS),
        corrections: extract_list(map, CORRECTION_KEYS),
    })
}

/// Serializes a normalized list for the single text column it is stored in.
/// Empty lists persist as NULL rather than "[]".
pub(crate) fn serialize_list(items: &[String]) -> Option<String> {
    if items.is_empty() {
        return None;
    }
    serde_json::to_string(items).ok()
}

/// Inverse of [`serialize_list`], used when rendering persisted records.
pub(crate) fn parse_list_blob(blob: &str) -> Vec<String> {
    serde_json::from_str(blob).unwrap_or_default()
}

fn extract_score(map: &Map<String, Value>) -> Option<f64> {
    SCORE_KEYS.iter().find_map(|key| map.get(*key).and_then(coerce_score))
}

fn coerce_score(value: &Value) -> Option<f64> {
    let number = match value {
        Value::Number(number) => number.as_f64()?,
        Value::String(text) => {
            let trimmed = text.trim().trim_end_matches('%').trim();
            trimmed.parse::<f64>().ok()?
        }
        _ => return None,
    };

    (0.0..=100.0).contains(&number).then_some(number)
}

fn extract_feedback(map: &Map<String, Value>) -> String {
    FEEDBACK_KEYS
        .iter()
        .find_map(|key| {
            map.get(*key)
                .and_then(Value::as_str)
                .map(str::trim)
                .filter(|text| !text.is_empty())
                .map(str::to_string)
        })
        .unwrap_or_else(|| DEFAULT_FEEDBACK.to_string())
}

fn extract_list(map: &Map<String, Value>, keys: &[&str]) -> Vec<String> {
    for key in keys {
        if let Some(value) = map.get(*key) {
            let items = coerce_list(value);
            if !items.is_empty() {
                return items;
            }
        }
    }
    Vec::new()
}

fn coerce_list(value: &Value) -> Vec<String> {
    match value {
        Value::Array(items) => items
            .iter()
            .filter_map(|item| {
                item.as_str().map(str::trim).filter(|text| !text.is_empty()).map(str::to_string)
            })
            .collect(),
        Value::String(text) => coerce_string_list(text),
        _ => Vec::new(),
    }
}

/// The service sometimes returns an array stringified into a single value,
/// and sometimes a truncated marker like a bare "[". A secondary parse
/// recovers the former; the latter is treated as empty.
fn coerce_string_list(text: &str) -> Vec<String> {
    let trimmed = text.trim();
    if is_degenerate_marker(trimmed) {
        return Vec::new();
    }

    if trimmed.starts_with('[') {
        return match serde_json::from_str::<Value>(trimmed) {
            Ok(parsed) => coerce_list(&parsed),
            Err(_) => Vec::new(),
        };
    }

    vec![trimmed.to_string()]
}

fn is_degenerate_marker(text: &str) -> bool {
    matches!(text, "" | "[" | "]" | "[]" | "{" | "}" | "{}")
        || matches!(text.to_ascii_lowercase().as_str(), "null" | "none" | "n/a")
}
