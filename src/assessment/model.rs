//! # Assessment Data Model
//!
//! The session record built up from the agent's structured updates.
//!
//! ## Dimensions:
//! - **DT**: Directness & Transparency
//! - **TR**: Task vs Relational
//! - **CO**: Conflict Orientation
//! - **CA**: Cultural Adaptability
//! - **EP**: Empathy & Perspective-taking
//!
//! Scores are kept exactly as the agent sent them. The agent may answer on a 0-5 or a
//! 0-100 scale; [`display_score`] rebases for presentation only.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String")]
pub enum Dimension {
    DT,
    TR,
    CO,
    CA,
    EP,
}

impl Dimension {
    pub const ALL: [Dimension; 5] = [
        Dimension::DT,
        Dimension::TR,
        Dimension::CO,
        Dimension::CA,
        Dimension::EP,
    ];

    pub fn code(&self) -> &'static str {
        match self {
            Dimension::DT => "DT",
            Dimension::TR => "TR",
            Dimension::CO => "CO",
            Dimension::CA => "CA",
            Dimension::EP => "EP",
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            Dimension::DT => "Directness & Transparency",
            Dimension::TR => "Task vs Relational",
            Dimension::CO => "Conflict Orientation",
            Dimension::CA => "Cultural Adaptability",
            Dimension::EP => "Empathy & Perspective-taking",
        }
    }

    pub fn from_code(code: &str) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|d| d.code().eq_ignore_ascii_case(code.trim()))
    }
}

impl TryFrom<String> for Dimension {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::from_code(&value).ok_or_else(|| format!("unknown Dimension '{}'", value))
    }
}

impl fmt::Display for Dimension {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}

/// Implements case-insensitive parsing from strings for wire enums.
macro_rules! wire_enum {
    ($name:ident { $($variant:ident => $text:literal),+ $(,)? }) => {
        impl $name {
            pub fn as_str(&self) -> &'static str {
                match self {
                    $($name::$variant => $text,)+
                }
            }
        }

        impl std::str::FromStr for $name {
            type Err = String;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                $(
                    if s.trim().eq_ignore_ascii_case($text) {
                        return Ok($name::$variant);
                    }
                )+
                Err(format!("unknown {} '{}'", stringify!($name), s))
            }
        }

        impl TryFrom<String> for $name {
            type Error = String;

            fn try_from(value: String) -> Result<Self, Self::Error> {
                value.parse()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }
    };
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", rename_all = "UPPERCASE")]
pub enum Confidence {
    Low,
    Medium,
    High,
}

wire_enum!(Confidence { Low => "LOW", Medium => "MEDIUM", High => "HIGH" });

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", rename_all = "lowercase")]
pub enum Trend {
    Up,
    Down,
    Stable,
}

wire_enum!(Trend { Up => "up", Down => "down", Stable => "stable" });

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", rename_all = "lowercase")]
pub enum Polarity {
    Positive,
    Negative,
    Contextual,
}

wire_enum!(Polarity { Positive => "positive", Negative => "negative", Contextual => "contextual" });

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Phase {
    Opening,
    Core,
    GapFilling,
    Validation,
    Closing,
}

wire_enum!(Phase {
    Opening => "OPENING",
    Core => "CORE",
    GapFilling => "GAP_FILLING",
    Validation => "VALIDATION",
    Closing => "CLOSING",
});

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DimensionState {
    pub score: f64,
    pub confidence: Confidence,
    pub evidence_count: u32,
    pub trend: Trend,
}

impl Default for DimensionState {
    fn default() -> Self {
        Self {
            score: 3.0,
            confidence: Confidence::Low,
            evidence_count: 0,
            trend: Trend::Stable,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvidenceItem {
    /// MM:SS into the session
    pub timestamp: String,
    pub dimension: Dimension,
    #[serde(rename = "type")]
    pub polarity: Polarity,
    pub summary: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContradictionAlert {
    pub dimension: Dimension,
    pub early_statement: String,
    pub late_statement: String,
    pub resolution: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScorePoint {
    pub elapsed_seconds: f64,
    pub scores: BTreeMap<Dimension, f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionState {
    pub dimensions: BTreeMap<Dimension, DimensionState>,
    pub evidence_log: Vec<EvidenceItem>,
    pub contradictions: Vec<ContradictionAlert>,
    pub score_history: Vec<ScorePoint>,
    pub conversation_phase: Phase,
    pub strengths: Vec<String>,
    pub development_priorities: Vec<String>,
    pub summary: Option<String>,
    pub is_complete: bool,
}

impl Default for SessionState {
    fn default() -> Self {
        Self {
            dimensions: Dimension::ALL
                .into_iter()
                .map(|d| (d, DimensionState::default()))
                .collect(),
            evidence_log: Vec::new(),
            contradictions: Vec::new(),
            score_history: Vec::new(),
            conversation_phase: Phase::Opening,
            strengths: Vec::new(),
            development_priorities: Vec::new(),
            summary: None,
            is_complete: false,
        }
    }
}

impl SessionState {
    pub fn dimension(&self, dimension: Dimension) -> &DimensionState {
        // Every dimension is inserted at construction and never removed
        &self.dimensions[&dimension]
    }

    pub fn scores(&self) -> BTreeMap<Dimension, f64> {
        self.dimensions.iter().map(|(d, s)| (*d, s.score)).collect()
    }

    pub fn all_high_confidence(&self) -> bool {
        Dimension::ALL
            .iter()
            .all(|d| self.dimensions.get(d).is_some_and(|s| s.confidence == Confidence::High))
    }
}

/// Rebase a raw score to 0-100 for display.
///
/// Scores at or below 5 are treated as the 0-5 scale.
pub fn display_score(raw: f64) -> f64 {
    if raw <= 5.0 {
        raw * 20.0
    } else {
        raw
    }
}

/// Format elapsed seconds as MM:SS.
pub fn format_elapsed(elapsed_secs: f64) -> String {
    let total = elapsed_secs.max(0.0).floor() as u64;
    format!("{:02}:{:02}", total / 60, total % 60)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_neutral_defaults() {
        let state = SessionState::default();
        assert_eq!(state.dimensions.len(), 5);
        for d in Dimension::ALL {
            let dim = state.dimension(d);
            assert_eq!(dim.score, 3.0);
            assert_eq!(dim.confidence, Confidence::Low);
            assert_eq!(dim.evidence_count, 0);
        }
        assert_eq!(state.conversation_phase, Phase::Opening);
        assert!(!state.all_high_confidence());
    }

    #[test]
    fn test_case_insensitive_wire_enums() {
        assert_eq!("high".parse::<Confidence>().unwrap(), Confidence::High);
        assert_eq!("Gap_Filling".parse::<Phase>().unwrap(), Phase::GapFilling);
        let trend: Trend = serde_json::from_str("\"UP\"").unwrap();
        assert_eq!(trend, Trend::Up);
        assert!(serde_json::from_str::<Phase>("\"INTRO\"").is_err());
    }

    #[test]
    fn test_serialized_shape() {
        let value = serde_json::to_value(SessionState::default()).unwrap();
        assert_eq!(value["conversationPhase"], "OPENING");
        assert_eq!(value["dimensions"]["DT"]["confidence"], "LOW");
        assert_eq!(value["dimensions"]["EP"]["evidenceCount"], 0);
        assert_eq!(value["dimensions"]["CA"]["trend"], "stable");
    }

    #[test]
    fn test_display_score_rebases_small_scale() {
        assert!((display_score(4.2) - 84.0).abs() < 1e-9);
        assert_eq!(display_score(72.0), 72.0);
        assert_eq!(display_score(0.0), 0.0);
    }

    #[test]
    fn test_format_elapsed() {
        assert_eq!(format_elapsed(0.0), "00:00");
        assert_eq!(format_elapsed(125.9), "02:05");
        assert_eq!(format_elapsed(-3.0), "00:00");
    }

    #[test]
    fn test_dimension_codes() {
        assert_eq!(Dimension::from_code("dt"), Some(Dimension::DT));
        assert_eq!(Dimension::from_code("XX"), None);
        assert_eq!(Dimension::EP.label(), "Empathy & Perspective-taking");
    }
}
