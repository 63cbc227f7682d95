//! # Playback Scheduler
//!
//! Turns the stream of inbound speech fragments into one gapless timeline on the
//! output clock, and tracks whether the agent is audible.
//!
//! ## Timeline:
//! Each fragment starts at `max(next_start_time, clock_now)` and pushes
//! `next_start_time` forward by its own duration. Fragments that arrive early
//! queue up back to back; a fragment arriving after the timeline drained starts
//! immediately.
//!
//! ## Speaking state:
//! The agent counts as speaking while any scheduled source is active. When the last
//! one ends, the flag is held for a short release delay so that a fragment arriving
//! a few milliseconds late does not reopen the microphone in between.
//!
//! ## Barge-in:
//! The only cancellation path. Stops every source, rewinds the timeline, and opens
//! the microphone without a cooldown.

use crate::audio::codec::{AudioFrame, WIRE_SAMPLE_RATE};
use crate::audio::gate::VoiceGate;
use crate::error::AppResult;
use std::collections::BTreeSet;
use std::time::{Duration, Instant};
use tracing::{debug, info};

pub type SourceId = u64;

/// Float samples ready for an output sink.
#[derive(Debug, Clone, PartialEq)]
pub struct PlaybackBuffer {
    pub samples: Vec<f32>,
    pub sample_rate: u32,
}

impl PlaybackBuffer {
    pub fn from_frame(frame: &AudioFrame) -> Self {
        Self {
            samples: frame.to_float(),
            sample_rate: WIRE_SAMPLE_RATE,
        }
    }

    pub fn duration_secs(&self) -> f64 {
        self.samples.len() as f64 / self.sample_rate.max(1) as f64
    }
}

/// An output device that can start buffers at precise clock times.
///
/// `current_time` is the sink's own clock in seconds, not wall time.
pub trait PlaybackSink {
    fn current_time(&self) -> f64;
    fn start(&mut self, id: SourceId, buffer: PlaybackBuffer, at: f64) -> AppResult<()>;
    fn stop(&mut self, id: SourceId);
}

/// Where a fragment landed on the timeline.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScheduledSource {
    pub id: SourceId,
    pub start: f64,
    pub duration: f64,
}

pub struct PlaybackScheduler<S: PlaybackSink> {
    sink: S,
    next_start_time: f64,
    active: BTreeSet<SourceId>,
    next_id: SourceId,
    next_sequence: u64,
    release_at: Option<Instant>,
    release_delay: Duration,
}

impl<S: PlaybackSink> PlaybackScheduler<S> {
    pub fn new(sink: S, release_delay: Duration) -> Self {
        Self {
            sink,
            next_start_time: 0.0,
            active: BTreeSet::new(),
            next_id: 1,
            next_sequence: 0,
            release_at: None,
            release_delay,
        }
    }

    pub fn sink(&self) -> &S {
        &self.sink
    }

    pub fn next_start_time(&self) -> f64 {
        self.next_start_time
    }

    pub fn active_count(&self) -> usize {
        self.active.len()
    }

    pub fn is_release_pending(&self) -> bool {
        self.release_at.is_some()
    }

    /// Decode a base64 `response.audio.delta` payload and schedule it.
    ///
    /// A malformed payload is returned as a `Format` error and leaves the
    /// timeline untouched.
    pub fn enqueue_delta(&mut self, delta: &str, gate: &mut VoiceGate) -> AppResult<ScheduledSource> {
        let frame = AudioFrame::from_base64(self.next_sequence, delta)?;
        self.next_sequence += 1;
        self.enqueue(&frame, gate)
    }

    /// Schedule one decoded frame at the end of the timeline.
    pub fn enqueue(&mut self, frame: &AudioFrame, gate: &mut VoiceGate) -> AppResult<ScheduledSource> {
        let buffer = PlaybackBuffer::from_frame(frame);
        let duration = buffer.duration_secs();
        let start = self.next_start_time.max(self.sink.current_time());
        let id = self.next_id;

        self.sink.start(id, buffer, start)?;

        self.next_id += 1;
        self.next_start_time = start + duration;
        self.active.insert(id);
        self.release_at = None;
        gate.mark_agent_speaking();

        debug!(
            source = id,
            sequence = frame.sequence,
            start,
            duration,
            active = self.active.len(),
            "Scheduled agent audio"
        );

        Ok(ScheduledSource { id, start, duration })
    }

    /// A source finished playing on its own.
    ///
    /// Unknown or already-removed ids are ignored, so a completion racing a
    /// barge-in is harmless.
    pub fn on_source_ended(&mut self, id: SourceId, now: Instant) {
        if !self.active.remove(&id) {
            return;
        }
        if self.active.is_empty() {
            self.release_at = Some(now + self.release_delay);
        }
    }

    /// Finish a pending release once its delay has passed and nothing new started.
    ///
    /// Returns `true` when the agent stopped speaking during this call.
    pub fn poll_release(&mut self, now: Instant, gate: &mut VoiceGate) -> bool {
        match self.release_at {
            Some(at) if now >= at => {
                self.release_at = None;
                if self.active.is_empty() {
                    gate.mark_agent_finished(now);
                    debug!("Agent finished speaking");
                    return true;
                }
                false
            }
            _ => false,
        }
    }

    /// Stop all playback immediately. Returns how many sources were cut off.
    pub fn barge_in(&mut self, gate: &mut VoiceGate) -> usize {
        let stopped = self.active.len();
        for id in std::mem::take(&mut self.active) {
            self.sink.stop(id);
        }
        self.next_start_time = 0.0;
        self.release_at = None;
        gate.clear_for_barge_in();

        if stopped > 0 {
            info!(stopped, "Barge-in: agent playback interrupted");
        }
        stopped
    }
}
