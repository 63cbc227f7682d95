//! # Audio Module
//!
//! Everything between the sound card and the wire.
//!
//! ## Key Components:
//! - **Codec**: PCM16 ↔ float, bytes ↔ samples, base64 framing, resampling
//! - **Spectral**: echo and voice-band heuristics over an FFT spectrum
//! - **Gate**: mute, pause, agent-speaking and cooldown flags
//! - **Capture**: microphone blocks → gated, encoded append messages
//! - **Playback**: gapless scheduling of agent speech with barge-in
//! - **Mixer**: software output sink driven by the device callback
//!
//! ## Audio Format:
//! - **Sample Rate**: 24kHz on the wire
//! - **Bit Depth**: 16-bit PCM, little-endian
//! - **Channels**: Mono

pub mod calibration; // Adaptive echo threshold
pub mod capture;     // Outbound block pipeline
pub mod codec;       // Sample and frame conversions
pub mod gate;        // Transmission gating flags
pub mod mixer;       // Output mixing and clock
pub mod playback;    // Inbound scheduling and barge-in
pub mod spectral;    // FFT heuristics
