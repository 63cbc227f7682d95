//! Software output mixer.
//!
//! The output device callback pulls samples from [`Mixer::render`]; the event loop
//! pushes scheduled buffers through the [`PlaybackSink`] impl. The number of frames
//! rendered so far is the output clock, so scheduling is sample-accurate relative
//! to what has actually been handed to the device.
//!
//! Fragments scheduled back to back share one resampler and are placed end to
//! end in output frames, so a stream converted to the device rate has no holes
//! at fragment seams.
//!
//! Natural completions are posted back on a channel instead of touching playback
//! state from the device thread.

use crate::audio::codec::LinearResampler;
use crate::audio::playback::{PlaybackBuffer, PlaybackSink, SourceId};
use crate::error::AppResult;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::mpsc::UnboundedSender;
use tracing::trace;

struct Voice {
    id: SourceId,
    start_frame: u64,
    samples: Vec<f32>,
    cursor: usize,
}

/// Where the last scheduled fragment ends, in both clocks.
struct StreamTail {
    source_rate: u32,
    end_secs: f64,
    end_frame: u64,
    resampler: LinearResampler,
}

#[derive(Default)]
struct MixerState {
    frames_rendered: u64,
    voices: Vec<Voice>,
    tail: Option<StreamTail>,
}

#[derive(Clone)]
pub struct Mixer {
    state: Arc<Mutex<MixerState>>,
    sample_rate: u32,
    ended_tx: UnboundedSender<SourceId>,
}

impl Mixer {
    pub fn new(sample_rate: u32, ended_tx: UnboundedSender<SourceId>) -> Self {
        Self {
            state: Arc::new(Mutex::new(MixerState::default())),
            sample_rate,
            ended_tx,
        }
    }

    fn lock(&self) -> MutexGuard<'_, MixerState> {
        // A panic while rendering must not silence the session for good
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Fill `out` with the next mono frames and advance the clock.
    pub fn render(&self, out: &mut [f32]) {
        out.fill(0.0);
        let mut state = self.lock();
        let block_start = state.frames_rendered;
        let block_end = block_start + out.len() as u64;

        let mut finished = Vec::new();
        for voice in state.voices.iter_mut() {
            if voice.start_frame >= block_end {
                continue;
            }
            let offset = voice.start_frame.saturating_sub(block_start) as usize;
            for slot in out[offset..].iter_mut() {
                match voice.samples.get(voice.cursor) {
                    Some(sample) => {
                        *slot += sample;
                        voice.cursor += 1;
                    }
                    None => break,
                }
            }
            if voice.cursor >= voice.samples.len() {
                finished.push(voice.id);
            }
        }

        if !finished.is_empty() {
            state.voices.retain(|v| !finished.contains(&v.id));
            for id in finished {
                trace!(source = id, "Source drained");
                let _ = self.ended_tx.send(id);
            }
        }

        state.frames_rendered = block_end;
        drop(state);

        for sample in out.iter_mut() {
            *sample = sample.clamp(-1.0, 1.0);
        }
    }
}

impl PlaybackSink for Mixer {
    fn current_time(&self) -> f64 {
        self.lock().frames_rendered as f64 / self.sample_rate as f64
    }

    fn start(&mut self, id: SourceId, buffer: PlaybackBuffer, at: f64) -> AppResult<()> {
        let half_frame = 0.5 / self.sample_rate.max(1) as f64;
        let end_secs = at + buffer.duration_secs();
        let mut state = self.lock();
        let frames_rendered = state.frames_rendered;

        let mut tail = match state.tail.take() {
            Some(tail)
                if tail.source_rate == buffer.sample_rate
                    && (tail.end_secs - at).abs() < half_frame
                    && tail.end_frame >= frames_rendered =>
            {
                tail
            }
            _ => StreamTail {
                source_rate: buffer.sample_rate,
                end_secs: at,
                end_frame: (at.max(0.0) * self.sample_rate as f64).round() as u64,
                resampler: LinearResampler::new(buffer.sample_rate, self.sample_rate),
            },
        };

        let start_frame = tail.end_frame;
        let mut samples = Vec::new();
        tail.resampler.process(&buffer.samples, &mut samples);
        tail.end_frame = start_frame + samples.len() as u64;
        tail.end_secs = end_secs;

        state.voices.push(Voice {
            id,
            start_frame,
            samples,
            cursor: 0,
        });
        state.tail = Some(tail);
        Ok(())
    }

    fn stop(&mut self, id: SourceId) {
        let mut state = self.lock();
        state.voices.retain(|v| v.id != id);
        state.tail = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc::unbounded_channel;

    fn buffer(value: f32, len: usize) -> PlaybackBuffer {
        PlaybackBuffer {
            samples: vec![value; len],
            sample_rate: 100,
        }
    }

    #[test]
    fn test_clock_advances_with_rendering() {
        let (tx, _rx) = unbounded_channel();
        let mixer = Mixer::new(100, tx);
        assert_eq!(mixer.current_time(), 0.0);
        mixer.render(&mut [0.0; 50]);
        assert_eq!(mixer.current_time(), 0.5);
    }

    #[test]
    fn test_source_starts_at_exact_frame() {
        let (tx, mut rx) = unbounded_channel();
        let mut mixer = Mixer::new(100, tx);
        mixer.start(7, buffer(0.25, 4), 0.03).unwrap();

        let mut out = [0.0; 10];
        mixer.render(&mut out);
        assert_eq!(out, [0.0, 0.0, 0.0, 0.25, 0.25, 0.25, 0.25, 0.0, 0.0, 0.0]);
        assert_eq!(rx.try_recv().unwrap(), 7);
        assert_eq!(mixer.lock().voices.len(), 0);
    }

    #[test]
    fn test_source_spanning_blocks() {
        let (tx, mut rx) = unbounded_channel();
        let mut mixer = Mixer::new(100, tx);
        mixer.start(1, buffer(0.5, 6), 0.0).unwrap();

        let mut out = [0.0; 4];
        mixer.render(&mut out);
        assert_eq!(out, [0.5; 4]);
        assert!(rx.try_recv().is_err());

        mixer.render(&mut out);
        assert_eq!(out, [0.5, 0.5, 0.0, 0.0]);
        assert_eq!(rx.try_recv().unwrap(), 1);
    }

    #[test]
    fn test_overlap_is_clamped() {
        let (tx, _rx) = unbounded_channel();
        let mut mixer = Mixer::new(100, tx);
        mixer.start(1, buffer(0.75, 2), 0.0).unwrap();
        mixer.start(2, buffer(0.75, 2), 0.0).unwrap();
        let mut out = [0.0; 2];
        mixer.render(&mut out);
        assert_eq!(out, [1.0, 1.0]);
    }

    #[test]
    fn test_back_to_back_fragments_have_no_seams_at_48k() {
        use crate::audio::codec::{encode_frame, int16_to_bytes};
        use crate::audio::gate::VoiceGate;
        use crate::audio::playback::PlaybackScheduler;
        use std::time::Duration;

        let (tx, mut rx) = unbounded_channel();
        let mixer = Mixer::new(48_000, tx);
        let mut scheduler = PlaybackScheduler::new(mixer.clone(), Duration::from_millis(200));
        let mut gate = VoiceGate::new(Duration::from_millis(500));
        let delta = encode_frame(&int16_to_bytes(&vec![16384i16; 4096]));
        for _ in 0..3 {
            scheduler.enqueue_delta(&delta, &mut gate).unwrap();
        }

        let mut out = vec![0.0; 3 * 8192];
        mixer.render(&mut out);
        let silent: Vec<usize> = out
            .iter()
            .enumerate()
            .filter(|&(_, &s)| s == 0.0)
            .map(|(i, _)| i)
            .collect();
        assert!(silent.is_empty(), "silent samples at {:?}", silent);
        assert!(out.iter().all(|&s| (s - 0.5).abs() < 1e-6));
        for id in 1..=3 {
            assert_eq!(rx.try_recv().unwrap(), id);
        }
    }

    #[test]
    fn test_late_fragment_starts_fresh_stream() {
        let (tx, _rx) = unbounded_channel();
        let mut mixer = Mixer::new(200, tx);
        mixer.start(1, buffer(0.5, 2), 0.0).unwrap();
        mixer.render(&mut [0.0; 10]);

        // Timeline drained; the next fragment lands on the clock, not the old tail
        mixer.start(2, buffer(0.5, 2), 0.05).unwrap();
        let mut out = [0.0; 6];
        mixer.render(&mut out);
        assert_eq!(out, [0.5, 0.5, 0.5, 0.5, 0.0, 0.0]);
    }

    #[test]
    fn test_stopped_source_reports_nothing() {
        let (tx, mut rx) = unbounded_channel();
        let mut mixer = Mixer::new(100, tx);
        mixer.start(3, buffer(0.5, 2), 0.0).unwrap();
        mixer.stop(3);
        let mut out = [0.0; 4];
        mixer.render(&mut out);
        assert_eq!(out, [0.0; 4]);
        assert!(rx.try_recv().is_err());
    }
}
