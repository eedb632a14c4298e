//! Decoding judge output into a [`JudgeResult`].
//!
//! Two independent stages: [`decode_structured`] accepts only a JSON verdict,
//! [`decode_heuristic`] scans free text for approval or rejection wording.
//! Heuristic results always carry [`HEURISTIC_CONFIDENCE`], which sits below
//! the structured floor so a parsed verdict always outranks a guessed one.

use std::sync::LazyLock;

use chrono::Utc;
use regex::Regex;
use serde::Deserialize;

use super::JudgeResult;
use crate::util::truncate_chars;

/// Lowest confidence a structured verdict can report.
pub const STRUCTURED_CONFIDENCE_FLOOR: f64 = 0.6;
/// Confidence assumed when a structured verdict omits it.
pub const STRUCTURED_DEFAULT_CONFIDENCE: f64 = 0.8;
/// Confidence of every heuristic verdict.
pub const HEURISTIC_CONFIDENCE: f64 = 0.5;

const HEURISTIC_REASONING_CHARS: usize = 500;

/// Negated approval: "would not approve", "can't accept", "cannot be approved".
static NEGATED_APPROVAL_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)\b(?:not|never|cannot|can't|won't|wouldn't|don't|doesn't|shouldn't)\s+(?:\w+\s+){0,2}(?:approve[sd]?|approving|accept(?:ed|s|able)?|pass(?:es|ed)?)\b",
    )
    .unwrap()
});

static REJECTION_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)\b(?:reject(?:ed|s|ing)?|disapprove[sd]?|fail(?:s|ed)?|changes requested|request changes|unacceptable)\b",
    )
    .unwrap()
});

static APPROVAL_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(?:approve[sd]?|approving|lgtm|looks good|accept(?:ed)?|pass(?:es|ed)?)\b")
        .unwrap()
});

#[derive(Debug, Deserialize)]
struct RawVerdict {
    passed: bool,
    #[serde(default)]
    verdict: Option<String>,
    #[serde(default)]
    reasoning: Option<String>,
    #[serde(default)]
    confidence: Option<f64>,
    #[serde(default)]
    suggestions: Vec<String>,
}

/// Find the JSON object in judge output: fenced ```json blocks first, then
/// balanced `{...}` spans, in order. The first candidate that parses wins.
pub fn extract_json(output: &str) -> Option<&str> {
    fenced_blocks(output)
        .chain(balanced_objects(output))
        .find(|candidate| serde_json::from_str::<serde_json::Value>(candidate).is_ok())
}

fn fenced_blocks(output: &str) -> impl Iterator<Item = &str> + '_ {
    let mut rest = output;
    std::iter::from_fn(move || loop {
        let start = rest.find("```json")?;
        let after = &rest[start + 7..];
        let end = after.find("```")?;
        let block = after[..end].trim();
        rest = &after[end + 3..];
        if !block.is_empty() {
            return Some(block);
        }
    })
}

fn balanced_objects(output: &str) -> impl Iterator<Item = &str> + '_ {
    let mut from = 0;
    std::iter::from_fn(move || loop {
        let start = from + output.get(from..)?.find('{')?;
        match balanced_end(&output[start..]) {
            Some(len) => {
                from = start + len;
                return Some(&output[start..start + len]);
            }
            None => from = start + 1,
        }
    })
}

/// Length of the balanced object at the start of `text`, which begins
/// with `{`.
fn balanced_end(text: &str) -> Option<usize> {
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;
    for (i, c) in text.char_indices() {
        if in_string {
            match c {
                _ if escaped => escaped = false,
                '\\' => escaped = true,
                '"' => in_string = false,
                _ => {}
            }
            continue;
        }
        match c {
            '"' => in_string = true,
            '{' => depth += 1,
            '}' => {
                depth -= 1;
                if depth == 0 {
                    return Some(i + 1);
                }
            }
            _ => {}
        }
    }
    None
}

/// Strict decode. Returns `None` unless the output holds a JSON object with
/// a boolean `passed`.
pub fn decode_structured(persona: &str, output: &str) -> Option<JudgeResult> {
    let json = extract_json(output)?;
    let raw: RawVerdict = serde_json::from_str(json).ok()?;

    let confidence = raw
        .confidence
        .filter(|c| c.is_finite())
        .unwrap_or(STRUCTURED_DEFAULT_CONFIDENCE)
        .clamp(STRUCTURED_CONFIDENCE_FLOOR, 1.0);
    let verdict = raw
        .verdict
        .filter(|v| !v.trim().is_empty())
        .unwrap_or_else(|| if raw.passed { "Approved" } else { "Rejected" }.to_string());

    Some(JudgeResult {
        persona: persona.to_string(),
        required: true,
        passed: raw.passed,
        verdict,
        reasoning: raw.reasoning.unwrap_or_default(),
        confidence,
        suggestions: raw
            .suggestions
            .into_iter()
            .filter(|s| !s.trim().is_empty())
            .collect(),
        timestamp: Utc::now(),
    })
}

/// Fallback decode for free text. Negated approval and rejection wording
/// win over approval wording; no signal at all is a failure.
pub fn decode_heuristic(persona: &str, output: &str) -> JudgeResult {
    let (passed, verdict) = if NEGATED_APPROVAL_RE.is_match(output) || REJECTION_RE.is_match(output)
    {
        (false, "Rejected (unstructured response)")
    } else if APPROVAL_RE.is_match(output) {
        (true, "Approved (unstructured response)")
    } else {
        (false, "No verdict found in response")
    };

    JudgeResult {
        persona: persona.to_string(),
        required: true,
        passed,
        verdict: verdict.to_string(),
        reasoning: truncate_chars(output.trim(), HEURISTIC_REASONING_CHARS),
        confidence: HEURISTIC_CONFIDENCE,
        suggestions: Vec::new(),
        timestamp: Utc::now(),
    }
}

/// Structured decode with heuristic fallback.
pub fn decode(persona: &str, output: &str) -> JudgeResult {
    decode_structured(persona, output).unwrap_or_else(|| decode_heuristic(persona, output))
}
