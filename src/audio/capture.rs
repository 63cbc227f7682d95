//! # Capture Encoder
//!
//! Per-block pipeline for microphone audio:
//! 1. **Loudness**: RMS of the block
//! 2. **Diagnostics**: echo ratio and voice energy from the spectral classifier,
//!    computed for every block whether or not they end up mattering
//! 3. **Gating**: mute, pause, agent speaking, post-speech cooldown
//! 4. **Echo policy**: optionally drop blocks that look like echo
//! 5. **Encoding**: float → PCM16 → base64 → `input_audio_buffer.append`

use crate::audio::calibration::EchoCalibrator;
use crate::audio::codec::{encode_float_block, WIRE_SAMPLE_RATE};
use crate::audio::gate::{DropReason, VoiceGate};
use crate::audio::spectral::SpectrumAnalyzer;
use crate::config::{AudioSettings, EchoPolicy};
use crate::protocol::OutboundMessage;
use serde::Serialize;
use std::time::Instant;
use tracing::{debug, trace};

/// What happened to one block.
#[derive(Debug, Clone, PartialEq)]
pub enum CaptureDecision {
    Transmit(OutboundMessage),
    Drop(DropReason),
}

#[derive(Debug, Clone, PartialEq)]
pub struct BlockReport {
    pub rms: f32,
    pub voice_energy: f32,
    pub echo_ratio: f32,
    pub echo_suspected: bool,
    pub decision: CaptureDecision,
}

/// Running counters, one per decision.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CaptureStats {
    pub blocks_seen: u64,
    pub transmitted: u64,
    pub dropped_muted: u64,
    pub dropped_paused: u64,
    pub dropped_agent_speaking: u64,
    pub dropped_cooldown: u64,
    pub dropped_echo: u64,
    pub echo_suspected: u64,
}

impl CaptureStats {
    fn record(&mut self, reason: DropReason) {
        match reason {
            DropReason::Muted => self.dropped_muted += 1,
            DropReason::Paused => self.dropped_paused += 1,
            DropReason::AgentSpeaking => self.dropped_agent_speaking += 1,
            DropReason::Cooldown => self.dropped_cooldown += 1,
            DropReason::Echo => self.dropped_echo += 1,
        }
    }
}

pub struct CaptureEncoder {
    analyzer: SpectrumAnalyzer,
    echo_threshold: f32,
    echo_policy: EchoPolicy,
    calibrator: Option<EchoCalibrator>,
    stats: CaptureStats,
}

impl CaptureEncoder {
    pub fn new(settings: &AudioSettings) -> Self {
        let calibrator = settings
            .calibration_enabled
            .then(|| {
                EchoCalibrator::new(settings.calibration_samples)
                    .with_sigma(settings.calibration_sigma)
                    .with_floor(settings.calibration_floor)
            });

        Self {
            analyzer: SpectrumAnalyzer::new(WIRE_SAMPLE_RATE, settings.fft_size),
            echo_threshold: settings.echo_threshold,
            echo_policy: settings.echo_policy,
            calibrator,
            stats: CaptureStats::default(),
        }
    }

    pub fn stats(&self) -> &CaptureStats {
        &self.stats
    }

    /// Threshold currently in force: the calibrated one when available.
    pub fn echo_threshold(&self) -> f32 {
        self.calibrator
            .as_ref()
            .and_then(EchoCalibrator::estimate)
            .unwrap_or(self.echo_threshold)
    }

    pub fn process_block(&mut self, samples: &[f32], gate: &VoiceGate, now: Instant) -> BlockReport {
        self.stats.blocks_seen += 1;

        let rms = rms(samples);
        let spectrum = self.analyzer.analyze(samples);
        let echo_ratio = spectrum.echo_ratio();
        let voice_energy = spectrum.voice_energy();

        if gate.is_agent_speaking() {
            if let Some(calibrator) = self.calibrator.as_mut() {
                calibrator.observe(echo_ratio);
            }
        }

        let echo_suspected = spectrum.is_echo(self.echo_threshold());
        if echo_suspected {
            self.stats.echo_suspected += 1;
        }

        trace!(rms, echo_ratio, voice_energy, echo_suspected, "Captured block");

        let reason = gate.evaluate(now).or_else(|| {
            (echo_suspected && self.echo_policy == EchoPolicy::Block).then_some(DropReason::Echo)
        });

        let decision = match reason {
            Some(reason) => {
                self.stats.record(reason);
                if reason == DropReason::Echo {
                    debug!(echo_ratio, "Dropping block classified as echo");
                }
                CaptureDecision::Drop(reason)
            }
            None => {
                self.stats.transmitted += 1;
                CaptureDecision::Transmit(OutboundMessage::AudioAppend {
                    audio: encode_float_block(samples),
                })
            }
        };

        BlockReport {
            rms,
            voice_energy,
            echo_ratio,
            echo_suspected,
            decision,
        }
    }
}

/// Root mean square of a block, 0 for empty input.
pub fn rms(samples: &[f32]) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }
    (samples.iter().map(|s| s * s).sum::<f32>() / samples.len() as f32).sqrt()
}
