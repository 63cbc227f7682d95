//! # Spectral Classifier
//!
//! Cheap frequency-domain heuristics used by the capture pipeline to spot
//! speaker-to-microphone echo.
//!
//! ## Bands:
//! - **Low** (100-300 Hz): where loudspeaker bleed through a laptop chassis piles up
//! - **Mid** (300-800 Hz): where direct speech carries most of its energy
//! - **Voice** (300-3400 Hz): telephone voice band, used for a loudness estimate
//!
//! Echo leaves a lopsided low band, so `low / mid` above a threshold is treated as
//! a likely echo. For the ratio the mid band starts one bin above the low band, so
//! the shared 300 Hz bin is counted once. The classifier is advisory; the caller decides what to do with it.

use rustfft::{num_complex::Complex, Fft, FftPlanner};
use std::f32::consts::PI;
use std::ops::RangeInclusive;
use std::sync::Arc;

pub const LOW_BAND_HZ: (f32, f32) = (100.0, 300.0);
pub const MID_BAND_HZ: (f32, f32) = (300.0, 800.0);
pub const VOICE_BAND_HZ: (f32, f32) = (300.0, 3400.0);

const EPSILON: f32 = 1e-10;
const MIN_MAGNITUDE: f32 = 1e-12;

/// Log-magnitude spectrum of one analysis window.
#[derive(Debug, Clone)]
pub struct Spectrum {
    bins_db: Vec<f32>,
    bin_hz: f32,
}

impl Spectrum {
    /// Build from dB values, one per bin starting at 0 Hz.
    pub fn from_decibels(bins_db: Vec<f32>, sample_rate: u32, fft_size: usize) -> Self {
        Self {
            bins_db,
            bin_hz: sample_rate as f32 / fft_size.max(1) as f32,
        }
    }

    fn bin_range(&self, (low_hz, high_hz): (f32, f32)) -> Option<RangeInclusive<usize>> {
        if self.bins_db.is_empty() {
            return None;
        }
        let last = self.bins_db.len() - 1;
        let start = ((low_hz / self.bin_hz).round() as usize).min(last);
        let end = ((high_hz / self.bin_hz).round() as usize).min(last);
        Some(start..=end)
    }

    fn linear(db: f32) -> f32 {
        10f32.powf(db / 10.0)
    }

    fn energy(&self, range: RangeInclusive<usize>) -> f32 {
        self.bins_db
            .get(range)
            .map(|bins| bins.iter().map(|&db| Self::linear(db)).sum())
            .unwrap_or(0.0)
    }

    /// Sum of linear energy over a band.
    pub fn band_energy(&self, band: (f32, f32)) -> f32 {
        self.bin_range(band).map(|range| self.energy(range)).unwrap_or(0.0)
    }

    /// Low-band to mid-band energy ratio over disjoint bin ranges.
    pub fn echo_ratio(&self) -> f32 {
        let (Some(low), Some(mid)) = (self.bin_range(LOW_BAND_HZ), self.bin_range(MID_BAND_HZ)) else {
            return 0.0;
        };
        let mid = (*mid.start()).max(low.end() + 1)..=*mid.end();
        self.energy(low) / (self.energy(mid) + EPSILON)
    }

    pub fn is_echo(&self, threshold: f32) -> bool {
        self.echo_ratio() > threshold
    }

    /// Root of the mean linear energy over the voice band.
    pub fn voice_energy(&self) -> f32 {
        let Some(range) = self.bin_range(VOICE_BAND_HZ) else {
            return 0.0;
        };
        let count = range.clone().count();
        if count == 0 {
            return 0.0;
        }
        let total: f32 = self.bins_db[range].iter().map(|&db| Self::linear(db)).sum();
        (total / count as f32).sqrt()
    }
}

/// Hann-windowed FFT producing [`Spectrum`] values.
pub struct SpectrumAnalyzer {
    fft: Arc<dyn Fft<f32>>,
    fft_size: usize,
    sample_rate: u32,
    window: Vec<f32>,
}

impl SpectrumAnalyzer {
    pub fn new(sample_rate: u32, fft_size: usize) -> Self {
        let mut planner = FftPlanner::new();
        let fft = planner.plan_fft_forward(fft_size);
        let window = (0..fft_size)
            .map(|i| 0.5 * (1.0 - (2.0 * PI * i as f32 / (fft_size - 1).max(1) as f32).cos()))
            .collect();

        Self {
            fft,
            fft_size,
            sample_rate,
            window,
        }
    }

    /// Analyse the most recent `fft_size` samples, zero-padding shorter input.
    pub fn analyze(&self, samples: &[f32]) -> Spectrum {
        let tail = &samples[samples.len().saturating_sub(self.fft_size)..];

        let mut buffer: Vec<Complex<f32>> = tail
            .iter()
            .zip(self.window.iter())
            .map(|(&sample, &w)| Complex::new(sample * w, 0.0))
            .collect();
        buffer.resize(self.fft_size, Complex::new(0.0, 0.0));

        self.fft.process(&mut buffer);

        let scale = self.fft_size as f32;
        let bins_db = buffer[..self.fft_size / 2]
            .iter()
            .map(|c| 20.0 * (c.norm() / scale).max(MIN_MAGNITUDE).log10())
            .collect();

        Spectrum::from_decibels(bins_db, self.sample_rate, self.fft_size)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn flat_spectrum(db: f32) -> Spectrum {
        Spectrum::from_decibels(vec![db; 1024], 24_000, 2048)
    }

    fn tone(freq: f32, len: usize) -> Vec<f32> {
        (0..len)
            .map(|i| 0.5 * (2.0 * PI * freq * i as f32 / 24_000.0).sin())
            .collect()
    }

    #[test]
    fn test_flat_spectrum_ratio_follows_band_widths() {
        let spectrum = flat_spectrum(0.0);
        // 100..300 Hz → bins 9..=26, 300..800 Hz → bins 26..=68
        assert_eq!(spectrum.band_energy(LOW_BAND_HZ), 18.0);
        assert_eq!(spectrum.band_energy(MID_BAND_HZ), 43.0);
        // The ratio counts bin 26 in the low band only
        assert!((spectrum.echo_ratio() - 18.0 / 42.0).abs() < 1e-4);
        assert!(!spectrum.is_echo(1.5));
        assert!((spectrum.voice_energy() - 1.0).abs() < 1e-4);
    }

    #[test]
    fn test_low_heavy_spectrum_is_echo() {
        let mut bins = vec![-100.0; 1024];
        for db in bins.iter_mut().take(26).skip(9) {
            *db = 0.0;
        }
        let spectrum = Spectrum::from_decibels(bins, 24_000, 2048);
        assert!(spectrum.echo_ratio() > 1.5);
        assert!(spectrum.is_echo(1.5));
    }

    #[test]
    fn test_boundary_bin_counts_once() {
        // Energy only in the 300 Hz bin shared by both bands
        let mut bins = vec![-200.0; 1024];
        bins[26] = 0.0;
        let spectrum = Spectrum::from_decibels(bins, 24_000, 2048);
        assert_eq!(spectrum.band_energy(MID_BAND_HZ) > 0.5, true);
        assert!(spectrum.echo_ratio() > 1e6);
    }

    #[test]
    fn test_silence_has_no_energy() {
        let analyzer = SpectrumAnalyzer::new(24_000, 2048);
        let spectrum = analyzer.analyze(&vec![0.0; 4096]);
        assert!(spectrum.voice_energy() < 1e-9);
    }

    #[test]
    fn test_analyzer_separates_bass_from_speech_band() {
        let analyzer = SpectrumAnalyzer::new(24_000, 2048);
        let bass = analyzer.analyze(&tone(180.0, 4096));
        let speech = analyzer.analyze(&tone(550.0, 4096));
        assert!(bass.is_echo(1.5));
        assert!(!speech.is_echo(1.5));
        assert!(speech.voice_energy() > bass.voice_energy());
    }

    #[test]
    fn test_short_input_is_zero_padded() {
        let analyzer = SpectrumAnalyzer::new(24_000, 2048);
        let spectrum = analyzer.analyze(&tone(550.0, 512));
        assert_eq!(spectrum.bin_hz, 24_000.0 / 2048.0);
        assert!(spectrum.voice_energy() > 0.0);
    }
}
