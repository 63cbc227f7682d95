//! Parsing of assessment patches sent as tool-call arguments.
//!
//! The agent's JSON is loosely typed: dimension codes arrive as object keys, enum
//! values in any case, and the whole payload sometimes wrapped in a markdown code
//! fence. Parsing normalises all of that into an [`AssessmentPatch`].
//!
//! Dimension keys match case-insensitively. When two keys name the same dimension
//! the canonical uppercase code wins; otherwise the first key in byte order does.

use crate::assessment::model::{Confidence, Dimension, Phase, Polarity, Trend};
use crate::error::{AppError, AppResult};
use serde::Deserialize;
use std::collections::BTreeMap;
use tracing::warn;

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DimensionPatch {
    pub score: Option<f64>,
    pub confidence: Option<Confidence>,
    pub evidence_count: Option<u32>,
    pub trend: Option<Trend>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct EvidencePatch {
    pub dimension: Dimension,
    #[serde(rename = "type")]
    pub polarity: Polarity,
    pub summary: String,
    #[serde(default)]
    pub timestamp: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContradictionPatch {
    pub dimension: Dimension,
    #[serde(default)]
    pub early_statement: String,
    #[serde(default)]
    pub late_statement: String,
    #[serde(default)]
    pub resolution: String,
}

/// A validated partial update.
#[derive(Debug, Clone, PartialEq)]
pub struct AssessmentPatch {
    pub dimensions: BTreeMap<Dimension, DimensionPatch>,
    pub new_evidence: Option<EvidencePatch>,
    pub contradiction: Option<ContradictionPatch>,
    pub phase: Phase,
    pub is_complete: Option<bool>,
    pub summary: Option<String>,
    pub strengths: Option<Vec<String>>,
    pub development_priorities: Option<Vec<String>>,
}

impl AssessmentPatch {
    /// A patch that only moves the conversation phase.
    #[cfg(test)]
    pub fn phase_only(phase: Phase) -> Self {
        Self {
            dimensions: BTreeMap::new(),
            new_evidence: None,
            contradiction: None,
            phase,
            is_complete: None,
            summary: None,
            strengths: None,
            development_priorities: None,
        }
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawPatch {
    #[serde(default)]
    dimensions: BTreeMap<String, DimensionPatch>,
    #[serde(default)]
    new_evidence: Option<EvidencePatch>,
    #[serde(default)]
    contradiction: Option<ContradictionPatch>,
    phase: Phase,
    #[serde(default)]
    is_complete: Option<bool>,
    #[serde(default)]
    summary: Option<String>,
    #[serde(default)]
    strengths: Option<Vec<String>>,
    #[serde(default)]
    development_priorities: Option<Vec<String>>,
}

impl From<RawPatch> for AssessmentPatch {
    fn from(raw: RawPatch) -> Self {
        let mut dimensions = BTreeMap::new();
        for (code, patch) in raw.dimensions {
            let Some(dimension) = Dimension::from_code(&code) else {
                warn!(code = %code, "Skipping unknown dimension in assessment patch");
                continue;
            };
            if dimensions.contains_key(&dimension) && code != dimension.code() {
                warn!(code = %code, "Skipping duplicate dimension key in assessment patch");
                continue;
            }
            dimensions.insert(dimension, patch);
        }

        Self {
            dimensions,
            new_evidence: raw.new_evidence,
            contradiction: raw.contradiction,
            phase: raw.phase,
            is_complete: raw.is_complete,
            summary: raw.summary,
            strengths: raw.strengths,
            development_priorities: raw.development_priorities,
        }
    }
}

/// Remove a surrounding markdown code fence, with or without a language tag.
pub fn strip_formatting(raw: &str) -> &str {
    let trimmed = raw.trim();
    let Some(rest) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    let rest = rest.strip_prefix("json").unwrap_or(rest);
    let rest = rest.strip_suffix("```").unwrap_or(rest);
    rest.trim()
}

/// Parse tool-call arguments into a patch.
///
/// Malformed JSON, a missing `phase`, or unknown enum values are `Format` errors.
pub fn parse_patch(raw: &str) -> AppResult<AssessmentPatch> {
    let body = strip_formatting(raw);
    if body.is_empty() {
        return Err(AppError::Format("empty assessment patch".to_string()));
    }
    let raw: RawPatch = serde_json::from_str(body)?;
    Ok(raw.into())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_full_patch() {
        let patch = parse_patch(
            r#"{
                "dimensions": {"DT": {"score": 4.2, "confidence": "medium", "evidenceCount": 2, "trend": "up"}},
                "newEvidence": {"dimension": "DT", "type": "positive", "summary": "Gave direct feedback"},
                "contradiction": {"dimension": "CO", "earlyStatement": "I avoid conflict", "lateStatement": "I confront it", "resolution": "Context dependent"},
                "phase": "core",
                "isComplete": false,
                "strengths": ["Candour"]
            }"#,
        )
        .unwrap();

        let dt = &patch.dimensions[&Dimension::DT];
        assert_eq!(dt.score, Some(4.2));
        assert_eq!(dt.confidence, Some(Confidence::Medium));
        assert_eq!(dt.trend, Some(Trend::Up));
        assert_eq!(patch.phase, Phase::Core);
        assert_eq!(patch.new_evidence.unwrap().polarity, Polarity::Positive);
        assert_eq!(patch.contradiction.unwrap().dimension, Dimension::CO);
        assert_eq!(patch.strengths, Some(vec!["Candour".to_string()]));
        assert_eq!(patch.development_priorities, None);
    }

    #[test]
    fn test_code_fences_are_stripped() {
        let fenced = "```json\n{\"phase\": \"CLOSING\", \"isComplete\": true}\n```";
        let patch = parse_patch(fenced).unwrap();
        assert_eq!(patch.phase, Phase::Closing);
        assert_eq!(patch.is_complete, Some(true));

        assert_eq!(strip_formatting("```\n{}\n```"), "{}");
        assert_eq!(strip_formatting("  {} "), "{}");
    }

    #[test]
    fn test_unknown_dimension_is_skipped() {
        let patch = parse_patch(r#"{"phase": "CORE", "dimensions": {"XX": {"score": 1}, "EP": {"score": 2}}}"#).unwrap();
        assert_eq!(patch.dimensions.len(), 1);
        assert!(patch.dimensions.contains_key(&Dimension::EP));
    }

    #[test]
    fn test_dimension_codes_ignore_case_everywhere() {
        let patch = parse_patch(
            r#"{
                "phase": "CORE",
                "dimensions": {"ep": {"score": 2}},
                "newEvidence": {"dimension": "dt", "type": "contextual", "summary": "Asked a question"},
                "contradiction": {"dimension": " Co "}
            }"#,
        )
        .unwrap();
        assert!(patch.dimensions.contains_key(&Dimension::EP));
        assert_eq!(patch.new_evidence.unwrap().dimension, Dimension::DT);
        assert_eq!(patch.contradiction.unwrap().dimension, Dimension::CO);

        assert!(parse_patch(r#"{"phase": "CORE", "newEvidence": {"dimension": "XX", "type": "positive", "summary": "?"}}"#).is_err());
    }

    #[test]
    fn test_duplicate_dimension_keys_prefer_canonical_code() {
        for raw in [
            r#"{"phase": "CORE", "dimensions": {"dt": {"score": 1}, "DT": {"score": 4}}}"#,
            r#"{"phase": "CORE", "dimensions": {"DT": {"score": 4}, "dt": {"score": 1}, "Dt": {"score": 2}}}"#,
        ] {
            let patch = parse_patch(raw).unwrap();
            assert_eq!(patch.dimensions.len(), 1);
            assert_eq!(patch.dimensions[&Dimension::DT].score, Some(4.0));
        }

        // Without the canonical key the first in byte order wins
        let patch = parse_patch(r#"{"phase": "CORE", "dimensions": {"dt": {"score": 1}, "Dt": {"score": 2}}}"#).unwrap();
        assert_eq!(patch.dimensions[&Dimension::DT].score, Some(2.0));
    }

    #[test]
    fn test_malformed_patches_are_format_errors() {
        for raw in ["", "{not json", r#"{"dimensions": {}}"#, r#"{"phase": "LATE"}"#] {
            assert!(matches!(parse_patch(raw), Err(AppError::Format(_))), "{}", raw);
        }
    }
}
