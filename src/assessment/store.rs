//! # Session State Store
//!
//! Merges assessment patches into the session record, one at a time, in arrival order.
//!
//! ## Merge Rules:
//! - Dimension fields present in the patch overwrite only that field
//! - scores outside `0..=100` (or non-finite) are ignored and the prior value kept
//! - `evidenceCount` never decreases
//! - `newEvidence` and `contradiction` each append exactly one entry
//! - every merge appends exactly one score point with the post-merge scores
//! - `phase`, `strengths`, `developmentPriorities`, `summary` overwrite when present
//! - `isComplete: true` marks the record complete
//!
//! Once frozen, the store rejects every further patch.

use crate::assessment::model::{
    format_elapsed, ContradictionAlert, EvidenceItem, ScorePoint, SessionState,
};
use crate::assessment::patch::AssessmentPatch;
use crate::error::{AppError, AppResult};
use std::ops::RangeInclusive;
use std::time::Instant;
use tracing::{debug, info, warn};

/// Raw scores arrive on a 0-5 scale or already rebased to 0-100.
const SCORE_RANGE: RangeInclusive<f64> = 0.0..=100.0;

/// What one merge changed.
#[derive(Debug, Clone, PartialEq)]
pub struct PatchOutcome {
    pub score_point: ScorePoint,
    pub evidence_appended: bool,
    pub contradiction_appended: bool,
    pub completed: bool,
}

pub struct SessionStateStore {
    state: SessionState,
    started_at: Instant,
    frozen: bool,
}

impl SessionStateStore {
    pub fn new(started_at: Instant) -> Self {
        Self {
            state: SessionState::default(),
            started_at,
            frozen: false,
        }
    }

    pub fn state(&self) -> &SessionState {
        &self.state
    }

    pub fn snapshot(&self) -> SessionState {
        self.state.clone()
    }

    pub fn started_at(&self) -> Instant {
        self.started_at
    }

    pub fn is_frozen(&self) -> bool {
        self.frozen
    }

    /// Stop accepting patches. Idempotent.
    pub fn freeze(&mut self) {
        if !self.frozen {
            self.frozen = true;
            debug!(
                evidence = self.state.evidence_log.len(),
                points = self.state.score_history.len(),
                "Session record frozen"
            );
        }
    }

    pub fn apply_patch(&mut self, patch: AssessmentPatch, now: Instant) -> AppResult<PatchOutcome> {
        if self.frozen {
            return Err(AppError::InvalidState(
                "session record is frozen; patch rejected".to_string(),
            ));
        }

        let elapsed = self.elapsed_at(now);

        for (dimension, update) in &patch.dimensions {
            let Some(current) = self.state.dimensions.get_mut(dimension) else {
                continue;
            };
            if let Some(score) = update.score {
                if SCORE_RANGE.contains(&score) {
                    current.score = score;
                } else {
                    warn!(%dimension, score, "Ignoring out-of-range score");
                }
            }
            if let Some(confidence) = update.confidence {
                current.confidence = confidence;
            }
            if let Some(count) = update.evidence_count {
                current.evidence_count = current.evidence_count.max(count);
            }
            if let Some(trend) = update.trend {
                current.trend = trend;
            }
        }

        let evidence_appended = match patch.new_evidence {
            Some(evidence) => {
                let timestamp = evidence
                    .timestamp
                    .filter(|t| !t.trim().is_empty())
                    .unwrap_or_else(|| format_elapsed(elapsed));
                self.state.evidence_log.push(EvidenceItem {
                    timestamp,
                    dimension: evidence.dimension,
                    polarity: evidence.polarity,
                    summary: evidence.summary,
                });
                true
            }
            None => false,
        };

        let contradiction_appended = match patch.contradiction {
            Some(c) => {
                info!(dimension = %c.dimension, "Contradiction recorded");
                self.state.contradictions.push(ContradictionAlert {
                    dimension: c.dimension,
                    early_statement: c.early_statement,
                    late_statement: c.late_statement,
                    resolution: c.resolution,
                });
                true
            }
            None => false,
        };

        let score_point = ScorePoint {
            elapsed_seconds: elapsed,
            scores: self.state.scores(),
        };
        self.state.score_history.push(score_point.clone());

        if self.state.conversation_phase != patch.phase {
            info!(from = %self.state.conversation_phase, to = %patch.phase, "Conversation phase changed");
        }
        self.state.conversation_phase = patch.phase;

        if let Some(strengths) = patch.strengths {
            self.state.strengths = dedup(strengths);
        }
        if let Some(priorities) = patch.development_priorities {
            self.state.development_priorities = dedup(priorities);
        }
        if let Some(summary) = patch.summary {
            self.state.summary = Some(summary);
        }

        let completed = patch.is_complete == Some(true) && !self.state.is_complete;
        if completed {
            self.state.is_complete = true;
            info!(elapsed_seconds = elapsed, "Assessment marked complete");
        }

        Ok(PatchOutcome {
            score_point,
            evidence_appended,
            contradiction_appended,
            completed,
        })
    }

    /// Seconds since the session started, never earlier than the last score point.
    fn elapsed_at(&self, now: Instant) -> f64 {
        let elapsed = now.saturating_duration_since(self.started_at).as_secs_f64();
        match self.state.score_history.last() {
            Some(last) => elapsed.max(last.elapsed_seconds),
            None => elapsed,
        }
    }
}

fn dedup(items: Vec<String>) -> Vec<String> {
    let mut out: Vec<String> = Vec::with_capacity(items.len());
    for item in items {
        let item = item.trim().to_string();
        if !item.is_empty() && !out.contains(&item) {
            out.push(item);
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::assessment::model::{Confidence, Dimension, Phase, Polarity, Trend};
    use crate::assessment::patch::parse_patch;
    use std::time::Duration;

    fn store() -> (SessionStateStore, Instant) {
        let t0 = Instant::now();
        (SessionStateStore::new(t0), t0)
    }

    #[test]
    fn test_dimension_merge_with_evidence() {
        let (mut store, t0) = store();
        let patch = parse_patch(
            r#"{"dimensions": {"DT": {"score": 4.2, "confidence": "MEDIUM"}},
                "newEvidence": {"dimension": "DT", "type": "positive", "summary": "Pushed back openly"},
                "phase": "CORE"}"#,
        )
        .unwrap();

        let outcome = store.apply_patch(patch, t0 + Duration::from_secs(95)).unwrap();
        let state = store.state();

        let dt = state.dimension(Dimension::DT);
        assert_eq!(dt.score, 4.2);
        assert_eq!(dt.confidence, Confidence::Medium);
        assert_eq!(dt.evidence_count, 0);
        assert_eq!(dt.trend, Trend::Stable);
        assert_eq!(state.dimension(Dimension::TR).score, 3.0);

        assert_eq!(state.evidence_log.len(), 1);
        assert_eq!(state.evidence_log[0].timestamp, "01:35");
        assert_eq!(state.evidence_log[0].polarity, Polarity::Positive);

        assert_eq!(state.score_history.len(), 1);
        assert_eq!(outcome.score_point.scores[&Dimension::DT], 4.2);
        assert_eq!(outcome.score_point.elapsed_seconds, 95.0);
        assert!(outcome.evidence_appended);
        assert!(!outcome.completed);
        assert_eq!(state.conversation_phase, Phase::Core);
    }

    #[test]
    fn test_phase_only_patch_changes_only_phase_and_history() {
        let (mut store, t0) = store();
        let before = store.snapshot();
        store
            .apply_patch(AssessmentPatch::phase_only(Phase::Validation), t0 + Duration::from_secs(10))
            .unwrap();
        let after = store.snapshot();

        assert_eq!(after.dimensions, before.dimensions);
        assert_eq!(after.evidence_log, before.evidence_log);
        assert_eq!(after.contradictions, before.contradictions);
        assert_eq!(after.strengths, before.strengths);
        assert_eq!(after.summary, before.summary);
        assert_eq!(after.score_history.len(), 1);
        assert_eq!(after.conversation_phase, Phase::Validation);
    }

    #[test]
    fn test_evidence_count_never_decreases() {
        let (mut store, t0) = store();
        let up = parse_patch(r#"{"phase": "CORE", "dimensions": {"EP": {"evidenceCount": 4}}}"#).unwrap();
        let down = parse_patch(r#"{"phase": "CORE", "dimensions": {"EP": {"evidenceCount": 1}}}"#).unwrap();
        store.apply_patch(up, t0).unwrap();
        store.apply_patch(down, t0).unwrap();
        assert_eq!(store.state().dimension(Dimension::EP).evidence_count, 4);
    }

    #[test]
    fn test_logs_are_append_only_and_ordered() {
        let (mut store, t0) = store();
        for (i, summary) in ["first", "second", "third"].iter().enumerate() {
            let patch = parse_patch(&format!(
                r#"{{"phase": "CORE", "newEvidence": {{"dimension": "CA", "type": "contextual", "summary": "{}", "timestamp": "0{}:00"}}}}"#,
                summary, i
            ))
            .unwrap();
            let prefix = store.state().evidence_log.clone();
            store.apply_patch(patch, t0 + Duration::from_secs(60 * i as u64)).unwrap();
            assert_eq!(&store.state().evidence_log[..prefix.len()], &prefix[..]);
        }
        let summaries: Vec<&str> = store.state().evidence_log.iter().map(|e| e.summary.as_str()).collect();
        assert_eq!(summaries, ["first", "second", "third"]);
        assert_eq!(store.state().evidence_log[2].timestamp, "02:00");
    }

    #[test]
    fn test_score_history_is_monotonic() {
        let (mut store, t0) = store();
        store.apply_patch(AssessmentPatch::phase_only(Phase::Core), t0 + Duration::from_secs(30)).unwrap();
        store.apply_patch(AssessmentPatch::phase_only(Phase::Core), t0 + Duration::from_secs(5)).unwrap();
        let history = &store.state().score_history;
        assert_eq!(history[1].elapsed_seconds, 30.0);
    }

    #[test]
    fn test_completion_and_freeze() {
        let (mut store, t0) = store();
        let patch = parse_patch(r#"{"phase": "CLOSING", "isComplete": true, "summary": "Adaptive", "strengths": ["Listening", "Listening"]}"#).unwrap();
        let outcome = store.apply_patch(patch, t0).unwrap();
        assert!(outcome.completed);
        assert!(store.state().is_complete);
        assert_eq!(store.state().strengths, vec!["Listening".to_string()]);

        assert!(!store.is_frozen());
        store.freeze();
        assert!(store.is_frozen());
        let err = store.apply_patch(AssessmentPatch::phase_only(Phase::Closing), t0).unwrap_err();
        assert!(matches!(err, AppError::InvalidState(_)));
        assert_eq!(store.state().score_history.len(), 1);
    }

    #[test]
    fn test_non_finite_scores_are_ignored() {
        let (mut store, t0) = store();
        let mut patch = AssessmentPatch::phase_only(Phase::Core);
        patch.dimensions.insert(
            Dimension::TR,
            crate::assessment::patch::DimensionPatch {
                score: Some(f64::NAN),
                ..Default::default()
            },
        );
        store.apply_patch(patch, t0).unwrap();
        assert_eq!(store.state().dimension(Dimension::TR).score, 3.0);
    }

    #[test]
    fn test_out_of_range_scores_are_ignored() {
        let (mut store, t0) = store();
        let patch = parse_patch(r#"{"dimensions": {"DT": {"score": -7.5}, "TR": {"score": 4200}, "CO": {"score": 85}}, "phase": "CORE"}"#).unwrap();
        let outcome = store.apply_patch(patch, t0).unwrap();

        let state = store.state();
        assert_eq!(state.dimension(Dimension::DT).score, 3.0);
        assert_eq!(state.dimension(Dimension::TR).score, 3.0);
        assert_eq!(state.dimension(Dimension::CO).score, 85.0);
        assert!(outcome.score_point.scores.values().all(|s| (0.0..=100.0).contains(s)));
    }

    #[test]
    fn test_single_score_patch_touches_only_its_dimension() {
        let (mut store, t0) = store();
        let patch = parse_patch(r#"{"dimensions": {"DT": {"score": 4.2}}, "phase": "CORE"}"#).unwrap();
        let outcome = store.apply_patch(patch, t0 + Duration::from_secs(10)).unwrap();

        let state = store.state();
        assert_eq!(state.dimension(Dimension::DT).score, 4.2);
        assert_eq!(state.conversation_phase, Phase::Core);
        assert!(state.evidence_log.is_empty());
        assert!(state.contradictions.is_empty());
        assert_eq!(state.score_history.len(), 1);

        let point = &state.score_history[0];
        assert_eq!(point, &outcome.score_point);
        assert_eq!(point.scores.len(), 5);
        assert_eq!(point.scores[&Dimension::DT], 4.2);
        for dimension in [Dimension::TR, Dimension::CO, Dimension::CA, Dimension::EP] {
            assert_eq!(point.scores[&dimension], 3.0);
        }
        assert!(!outcome.evidence_appended);
        assert!(!outcome.contradiction_appended);
    }
}
