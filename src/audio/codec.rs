//! # Sample Codec
//!
//! Conversions between the three representations audio takes on its way to and from
//! the wire:
//! - **Float samples** in [-1.0, 1.0] (what devices and the mixer work with)
//! - **16-bit PCM** little-endian (what the agent speaks)
//! - **Base64 text** (how PCM travels inside JSON messages)
//!
//! ## Scaling:
//! float → int16 is deliberately asymmetric: negative values scale by 32768 and
//! positive values by 32767, so both -1.0 and 1.0 map onto the ends of the i16 range.
//! int16 → float always divides by 32768.

use crate::error::{AppError, AppResult};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::io::Cursor;

/// Sample rate of every frame on the wire.
pub const WIRE_SAMPLE_RATE: u32 = 24_000;

/// Decode little-endian 16-bit PCM bytes.
///
/// Returns a `Format` error when the byte count is odd. Empty input gives empty output.
pub fn bytes_to_int16_samples(bytes: &[u8]) -> AppResult<Vec<i16>> {
    if bytes.len() % 2 != 0 {
        return Err(AppError::Format(format!(
            "PCM byte length must be even, got {}",
            bytes.len()
        )));
    }

    let mut cursor = Cursor::new(bytes);
    let mut samples = Vec::with_capacity(bytes.len() / 2);
    while let Ok(sample) = cursor.read_i16::<LittleEndian>() {
        samples.push(sample);
    }
    Ok(samples)
}

/// Encode 16-bit samples as little-endian bytes.
pub fn int16_to_bytes(samples: &[i16]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(samples.len() * 2);
    for &sample in samples {
        // Writing into a Vec cannot fail
        let _ = bytes.write_i16::<LittleEndian>(sample);
    }
    bytes
}

/// Convert float samples to 16-bit PCM.
pub fn float_to_int16(samples: &[f32]) -> Vec<i16> {
    samples
        .iter()
        .map(|&s| {
            let s = if s.is_nan() { 0.0 } else { s.clamp(-1.0, 1.0) };
            if s < 0.0 {
                (s * 32768.0) as i16
            } else {
                (s * 32767.0) as i16
            }
        })
        .collect()
}

/// Convert 16-bit PCM to float samples.
pub fn int16_to_float(samples: &[i16]) -> Vec<f32> {
    samples.iter().map(|&s| s as f32 / 32768.0).collect()
}

/// Base64-encode a binary payload for transport inside a text message.
pub fn encode_frame(bytes: &[u8]) -> String {
    STANDARD.encode(bytes)
}

/// Decode a base64 payload. Invalid text is a `Format` error.
pub fn decode_frame(text: &str) -> AppResult<Vec<u8>> {
    Ok(STANDARD.decode(text)?)
}

/// Float samples straight to the text form sent in `input_audio_buffer.append`.
pub fn encode_float_block(samples: &[f32]) -> String {
    encode_frame(&int16_to_bytes(&float_to_int16(samples)))
}

/// One decoded inbound audio fragment.
#[derive(Debug, Clone, PartialEq)]
pub struct AudioFrame {
    /// Arrival order, assigned by the receiver
    pub sequence: u64,
    pub samples: Vec<i16>,
}

impl AudioFrame {
    /// Decode a base64 delta into a frame.
    pub fn from_base64(sequence: u64, text: &str) -> AppResult<Self> {
        let bytes = decode_frame(text)?;
        let samples = bytes_to_int16_samples(&bytes)?;
        Ok(Self { sequence, samples })
    }

    /// Playback length in seconds at the wire rate.
    pub fn duration_secs(&self) -> f64 {
        self.samples.len() as f64 / WIRE_SAMPLE_RATE as f64
    }

    pub fn to_float(&self) -> Vec<f32> {
        int16_to_float(&self.samples)
    }
}

/// Streaming linear-interpolation resampler.
///
/// Keeps the last input sample and the fractional read position between calls,
/// so a stream can be fed in arbitrary chunk sizes without clicks at the seams.
/// When upsampling by an integer factor every input chunk yields exactly
/// `len * factor` output samples.
#[derive(Debug, Clone)]
pub struct LinearResampler {
    step: f64,
    position: f64,
    last: f32,
    primed: bool,
}

impl LinearResampler {
    pub fn new(from_rate: u32, to_rate: u32) -> Self {
        Self {
            step: from_rate as f64 / to_rate.max(1) as f64,
            position: 1.0,
            last: 0.0,
            primed: false,
        }
    }

    pub fn is_passthrough(&self) -> bool {
        (self.step - 1.0).abs() < f64::EPSILON
    }

    /// Resample `input`, appending output samples to `out`.
    pub fn process(&mut self, input: &[f32], out: &mut Vec<f32>) {
        if self.is_passthrough() {
            out.extend_from_slice(input);
            return;
        }

        // position is measured in input samples, with index 0 being `self.last`
        // and index 1 being input[0].
        if !self.primed {
            let Some(&first) = input.first() else {
                return;
            };
            self.last = first;
            if self.step < 1.0 {
                self.position = 1.0 - self.step;
            }
            self.primed = true;
        }

        let available = input.len() as f64;
        while self.position <= available {
            let index = self.position.floor() as usize;
            let frac = (self.position - index as f64) as f32;
            let a = if index == 0 { self.last } else { input[index - 1] };
            let b = if index < input.len() { input[index] } else { a };
            out.push(a + (b - a) * frac);
            self.position += self.step;
        }

        if let Some(&last) = input.last() {
            self.last = last;
        }
        self.position -= available;
    }
}
