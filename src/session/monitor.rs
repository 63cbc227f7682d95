//! Wall-clock watchdog for a running session.
//!
//! Checked once per `interval`:
//! - past `max_duration` the session is force-ended
//! - past `early_exit_after`, with every dimension at HIGH confidence, the user may
//!   finish early. Eligibility is a latch: once raised it stays raised.

use crate::assessment::model::SessionState;
use crate::config::SessionLimits;
use std::time::Duration;
use tracing::info;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MonitorLimits {
    pub max_duration: Duration,
    pub early_exit_after: Duration,
    pub interval: Duration,
}

impl From<&SessionLimits> for MonitorLimits {
    fn from(limits: &SessionLimits) -> Self {
        Self {
            max_duration: Duration::from_secs(limits.max_duration_secs),
            early_exit_after: Duration::from_secs(limits.early_exit_after_secs),
            interval: Duration::from_millis(limits.monitor_interval_ms),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MonitorVerdict {
    Running,
    /// Raised on the check where eligibility first became true
    EarlyExitEligible,
    HardTimeout,
}

pub struct SessionMonitor {
    limits: MonitorLimits,
    early_exit_eligible: bool,
}

impl SessionMonitor {
    pub fn new(limits: MonitorLimits) -> Self {
        Self {
            limits,
            early_exit_eligible: false,
        }
    }

    pub fn limits(&self) -> &MonitorLimits {
        &self.limits
    }

    pub fn early_exit_eligible(&self) -> bool {
        self.early_exit_eligible
    }

    pub fn check(&mut self, elapsed: Duration, state: &SessionState) -> MonitorVerdict {
        if elapsed >= self.limits.max_duration {
            info!(elapsed_secs = elapsed.as_secs(), "Session hit its maximum duration");
            return MonitorVerdict::HardTimeout;
        }

        if !self.early_exit_eligible
            && elapsed >= self.limits.early_exit_after
            && state.all_high_confidence()
        {
            self.early_exit_eligible = true;
            info!(elapsed_secs = elapsed.as_secs(), "Early exit is now available");
            return MonitorVerdict::EarlyExitEligible;
        }

        MonitorVerdict::Running
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::assessment::model::{Confidence, Dimension};
    use crate::config::AppConfig;

    fn monitor() -> SessionMonitor {
        SessionMonitor::new(MonitorLimits::from(&AppConfig::default().session))
    }

    fn all_high() -> SessionState {
        let mut state = SessionState::default();
        for d in Dimension::ALL {
            state.dimensions.get_mut(&d).unwrap().confidence = Confidence::High;
        }
        state
    }

    #[test]
    fn test_hard_timeout_at_twenty_minutes() {
        let mut monitor = monitor();
        let state = SessionState::default();
        assert_eq!(monitor.check(Duration::from_secs(1199), &state), MonitorVerdict::Running);
        assert_eq!(monitor.check(Duration::from_secs(1200), &state), MonitorVerdict::HardTimeout);
    }

    #[test]
    fn test_early_exit_needs_time_and_confidence() {
        let mut monitor = monitor();
        let high = all_high();
        assert_eq!(monitor.check(Duration::from_secs(299), &high), MonitorVerdict::Running);

        let mut almost = all_high();
        almost.dimensions.get_mut(&Dimension::CA).unwrap().confidence = Confidence::Medium;
        assert_eq!(monitor.check(Duration::from_secs(400), &almost), MonitorVerdict::Running);

        assert_eq!(monitor.check(Duration::from_secs(300), &high), MonitorVerdict::EarlyExitEligible);
        assert!(monitor.early_exit_eligible());
    }

    #[test]
    fn test_early_exit_is_latched() {
        let mut monitor = monitor();
        monitor.check(Duration::from_secs(301), &all_high());
        // Confidence dropping afterwards does not revoke eligibility
        let verdict = monitor.check(Duration::from_secs(302), &SessionState::default());
        assert_eq!(verdict, MonitorVerdict::Running);
        assert!(monitor.early_exit_eligible());
    }
}
