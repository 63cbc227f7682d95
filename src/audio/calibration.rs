//! Adaptive echo threshold estimation.
//!
//! While the agent is speaking, everything the microphone hears is either echo or
//! the user talking over it. Collecting the echo ratios of those blocks gives a
//! room-specific picture of what echo looks like; the suggested threshold sits
//! `sigma` standard deviations below their mean, never below `floor`.
//!
//! Only running mean and variance are kept (Welford), so observing and estimating
//! are constant time however long the agent talks.

use tracing::debug;

#[derive(Debug, Clone)]
pub struct EchoCalibrator {
    count: usize,
    mean: f64,
    m2: f64,
    required: usize,
    sigma: f32,
    floor: f32,
}

impl EchoCalibrator {
    pub fn new(required: usize) -> Self {
        Self {
            count: 0,
            mean: 0.0,
            m2: 0.0,
            required: required.max(2),
            sigma: 1.0,
            floor: 1.0,
        }
    }

    pub fn with_sigma(mut self, sigma: f32) -> Self {
        self.sigma = sigma;
        self
    }

    pub fn with_floor(mut self, floor: f32) -> Self {
        self.floor = floor;
        self
    }

    /// Record one echo ratio measured while the agent was audible.
    pub fn observe(&mut self, echo_ratio: f32) {
        if !echo_ratio.is_finite() {
            return;
        }
        let x = echo_ratio as f64;
        self.count += 1;
        let delta = x - self.mean;
        self.mean += delta / self.count as f64;
        self.m2 += delta * (x - self.mean);

        if self.count == self.required {
            debug!(
                samples = self.required,
                estimate = ?self.estimate(),
                "Echo calibration ready"
            );
        }
    }

    pub fn is_ready(&self) -> bool {
        self.count >= self.required
    }

    /// Suggested threshold, once enough observations exist.
    pub fn estimate(&self) -> Option<f32> {
        if !self.is_ready() {
            return None;
        }
        let std_dev = (self.m2 / self.count as f64).sqrt();
        let estimate = (self.mean - self.sigma as f64 * std_dev) as f32;
        Some(estimate.max(self.floor))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_not_ready_until_enough_samples() {
        let mut calibrator = EchoCalibrator::new(4);
        for _ in 0..3 {
            calibrator.observe(3.0);
        }
        assert!(!calibrator.is_ready());
        assert_eq!(calibrator.estimate(), None);
        calibrator.observe(3.0);
        assert_eq!(calibrator.estimate(), Some(3.0));
    }

    #[test]
    fn test_estimate_is_mean_minus_sigma() {
        let mut calibrator = EchoCalibrator::new(4);
        for ratio in [2.0, 4.0, 2.0, 4.0] {
            calibrator.observe(ratio);
        }
        // mean 3, std 1
        assert!((calibrator.estimate().unwrap() - 2.0).abs() < 1e-6);

        let mut narrow = EchoCalibrator::new(4).with_sigma(0.5);
        for ratio in [2.0, 4.0, 2.0, 4.0] {
            narrow.observe(ratio);
        }
        assert!((narrow.estimate().unwrap() - 2.5).abs() < 1e-6);
    }

    #[test]
    fn test_estimate_respects_floor() {
        let mut calibrator = EchoCalibrator::new(2).with_floor(1.2);
        calibrator.observe(0.1);
        calibrator.observe(0.3);
        assert_eq!(calibrator.estimate(), Some(1.2));
    }

    #[test]
    fn test_long_run_matches_batch_statistics() {
        let mut calibrator = EchoCalibrator::new(2).with_floor(0.1);
        for i in 0..100_000 {
            calibrator.observe(if i % 2 == 0 { 2.0 } else { 4.0 });
        }
        assert_eq!(calibrator.count, 100_000);
        assert!((calibrator.estimate().unwrap() - 2.0).abs() < 1e-4);
    }

    #[test]
    fn test_non_finite_ratios_ignored() {
        let mut calibrator = EchoCalibrator::new(2);
        calibrator.observe(f32::NAN);
        calibrator.observe(f32::INFINITY);
        assert_eq!(calibrator.count, 0);
        assert!(!calibrator.is_ready());
    }
}
