//! # Voice Gate
//!
//! The single owner of every flag that decides whether microphone audio may leave
//! the machine: user mute, user pause, "agent is speaking", and the short cooldown
//! after the agent stops.
//!
//! The playback scheduler writes the speaking flag and the cooldown timestamp; the
//! capture encoder only reads them through [`VoiceGate::evaluate`].

use serde::Serialize;
use std::time::{Duration, Instant};

/// Why a captured block was not transmitted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DropReason {
    Muted,
    Paused,
    AgentSpeaking,
    Cooldown,
    Echo,
}

#[derive(Debug, Clone)]
pub struct VoiceGate {
    muted: bool,
    paused: bool,
    agent_speaking: bool,
    agent_finished_at: Option<Instant>,
    cooldown: Duration,
}

impl VoiceGate {
    pub fn new(cooldown: Duration) -> Self {
        Self {
            muted: false,
            paused: false,
            agent_speaking: false,
            agent_finished_at: None,
            cooldown,
        }
    }

    pub fn is_muted(&self) -> bool {
        self.muted
    }

    pub fn is_paused(&self) -> bool {
        self.paused
    }

    pub fn is_agent_speaking(&self) -> bool {
        self.agent_speaking
    }

    pub fn agent_finished_at(&self) -> Option<Instant> {
        self.agent_finished_at
    }

    /// Returns the new state.
    pub fn toggle_mute(&mut self) -> bool {
        self.muted = !self.muted;
        self.muted
    }

    /// Returns the new state.
    pub fn toggle_pause(&mut self) -> bool {
        self.paused = !self.paused;
        self.paused
    }

    pub fn mark_agent_speaking(&mut self) {
        self.agent_speaking = true;
    }

    /// The last playback source drained; start the capture cooldown.
    pub fn mark_agent_finished(&mut self, now: Instant) {
        self.agent_speaking = false;
        self.agent_finished_at = Some(now);
    }

    /// User interrupted: the microphone opens immediately, no cooldown.
    pub fn clear_for_barge_in(&mut self) {
        self.agent_speaking = false;
        self.agent_finished_at = None;
    }

    pub fn in_cooldown(&self, now: Instant) -> bool {
        self.agent_finished_at
            .is_some_and(|at| now.saturating_duration_since(at) < self.cooldown)
    }

    /// First reason, if any, to hold back a block captured at `now`.
    pub fn evaluate(&self, now: Instant) -> Option<DropReason> {
        if self.muted {
            Some(DropReason::Muted)
        } else if self.paused {
            Some(DropReason::Paused)
        } else if self.agent_speaking {
            Some(DropReason::AgentSpeaking)
        } else if self.in_cooldown(now) {
            Some(DropReason::Cooldown)
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gate() -> VoiceGate {
        VoiceGate::new(Duration::from_millis(500))
    }

    #[test]
    fn test_open_by_default() {
        assert_eq!(gate().evaluate(Instant::now()), None);
    }

    #[test]
    fn test_priority_order() {
        let now = Instant::now();
        let mut gate = gate();
        gate.mark_agent_speaking();
        assert!(gate.toggle_pause());
        assert!(gate.toggle_mute());
        assert_eq!(gate.evaluate(now), Some(DropReason::Muted));
        gate.toggle_mute();
        assert_eq!(gate.evaluate(now), Some(DropReason::Paused));
        gate.toggle_pause();
        assert!(!gate.is_paused());
        assert_eq!(gate.evaluate(now), Some(DropReason::AgentSpeaking));
    }

    #[test]
    fn test_cooldown_window() {
        let t0 = Instant::now();
        let mut gate = gate();
        gate.mark_agent_speaking();
        gate.mark_agent_finished(t0);
        assert!(!gate.is_agent_speaking());
        assert_eq!(gate.evaluate(t0 + Duration::from_millis(499)), Some(DropReason::Cooldown));
        assert_eq!(gate.evaluate(t0 + Duration::from_millis(500)), None);
    }

    #[test]
    fn test_barge_in_skips_cooldown() {
        let t0 = Instant::now();
        let mut gate = gate();
        gate.mark_agent_finished(t0);
        gate.clear_for_barge_in();
        assert_eq!(gate.agent_finished_at(), None);
        assert_eq!(gate.evaluate(t0), None);
    }
}
