//! # Audio Device Management
//!
//! Opens the default microphone and speaker through `cpal` and adapts them to the
//! session's fixed format.
//!
//! ## Input:
//! Device frames (any sample format, any channel count, any rate) are downmixed to
//! mono, resampled to the wire rate, and cut into fixed-size blocks that are posted
//! to the event loop. Blocks the loop has no room for are dropped and counted in
//! [`DroppedBlocks`]; the callback itself never logs.
//!
//! ## Output:
//! The device callback renders the [`Mixer`] at the device's native rate and copies
//! the mono signal to every channel.

use crate::audio::codec::LinearResampler;
use crate::audio::mixer::Mixer;
use crate::audio::playback::SourceId;
use crate::error::{AppError, AppResult};
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{Device, FromSample, Sample, SampleFormat, SizedSample, Stream, StreamConfig};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc::{Sender, UnboundedSender};
use tracing::{debug, info, warn};

/// Turns interleaved device frames into fixed-size mono blocks at the target rate.
pub struct BlockAssembler {
    channels: usize,
    block_size: usize,
    resampler: LinearResampler,
    mono: Vec<f32>,
    pending: Vec<f32>,
}

impl BlockAssembler {
    pub fn new(channels: u16, device_rate: u32, target_rate: u32, block_size: usize) -> Self {
        Self {
            channels: channels.max(1) as usize,
            block_size: block_size.max(1),
            resampler: LinearResampler::new(device_rate, target_rate),
            mono: Vec::new(),
            pending: Vec::with_capacity(block_size * 2),
        }
    }

    /// Feed interleaved samples; returns every block completed by them.
    pub fn push(&mut self, interleaved: &[f32]) -> Vec<Vec<f32>> {
        self.mono.clear();
        self.mono.extend(
            interleaved
                .chunks(self.channels)
                .map(|frame| frame.iter().sum::<f32>() / frame.len() as f32),
        );
        self.resampler.process(&self.mono, &mut self.pending);

        let mut blocks = Vec::new();
        while self.pending.len() >= self.block_size {
            let rest = self.pending.split_off(self.block_size);
            blocks.push(std::mem::replace(&mut self.pending, rest));
        }
        blocks
    }
}

/// Microphone blocks dropped because the event loop fell behind.
#[derive(Clone, Default)]
pub struct DroppedBlocks {
    total: Arc<AtomicU64>,
    reported: u64,
}

impl DroppedBlocks {
    fn record(&self) {
        self.total.fetch_add(1, Ordering::Relaxed);
    }

    /// Blocks dropped since the previous call.
    pub fn take_new(&mut self) -> u64 {
        let total = self.total.load(Ordering::Relaxed);
        let new = total.saturating_sub(self.reported);
        self.reported = total;
        new
    }
}

/// The default input and output devices of the default host.
pub struct AudioDevices {
    input: Device,
    output: Device,
}

impl AudioDevices {
    pub fn open_default() -> AppResult<Self> {
        let host = cpal::default_host();
        let input = host
            .default_input_device()
            .ok_or_else(|| AppError::Device("no default input device".to_string()))?;
        let output = host
            .default_output_device()
            .ok_or_else(|| AppError::Device("no default output device".to_string()))?;

        info!(
            host = ?host.id(),
            input = %input.name().unwrap_or_else(|_| "unknown".to_string()),
            output = %output.name().unwrap_or_else(|_| "unknown".to_string()),
            "Audio devices selected"
        );

        Ok(Self { input, output })
    }

    /// Start the microphone. Blocks are dropped, not queued, if the loop falls behind;
    /// the returned counter tracks how many.
    pub fn start_capture(
        &self,
        target_rate: u32,
        block_size: usize,
        tx: Sender<Vec<f32>>,
    ) -> AppResult<(Stream, DroppedBlocks)> {
        let supported = self.input.default_input_config()?;
        let format = supported.sample_format();
        let config: StreamConfig = supported.config();
        debug!(?format, rate = config.sample_rate.0, channels = config.channels, "Input stream config");

        let assembler = BlockAssembler::new(config.channels, config.sample_rate.0, target_rate, block_size);
        let drops = DroppedBlocks::default();

        let stream = match format {
            SampleFormat::F32 => build_input::<f32>(&self.input, &config, assembler, tx, drops.clone())?,
            SampleFormat::I16 => build_input::<i16>(&self.input, &config, assembler, tx, drops.clone())?,
            SampleFormat::U16 => build_input::<u16>(&self.input, &config, assembler, tx, drops.clone())?,
            other => {
                return Err(AppError::Device(format!(
                    "unsupported input sample format {:?}",
                    other
                )))
            }
        };
        stream.play()?;
        info!("Microphone capture started");
        Ok((stream, drops))
    }

    /// Start the speaker and return the mixer that feeds it.
    pub fn start_playback(&self, ended_tx: UnboundedSender<SourceId>) -> AppResult<(Stream, Mixer)> {
        let supported = self.output.default_output_config()?;
        let format = supported.sample_format();
        let config: StreamConfig = supported.config();
        debug!(?format, rate = config.sample_rate.0, channels = config.channels, "Output stream config");

        let mixer = Mixer::new(config.sample_rate.0, ended_tx);

        let stream = match format {
            SampleFormat::F32 => build_output::<f32>(&self.output, &config, mixer.clone())?,
            SampleFormat::I16 => build_output::<i16>(&self.output, &config, mixer.clone())?,
            SampleFormat::U16 => build_output::<u16>(&self.output, &config, mixer.clone())?,
            other => {
                return Err(AppError::Device(format!(
                    "unsupported output sample format {:?}",
                    other
                )))
            }
        };
        stream.play()?;
        info!(rate = config.sample_rate.0, "Speaker playback started");
        Ok((stream, mixer))
    }

    /// Names of every input device on the default host.
    pub fn list_input_devices() -> AppResult<Vec<String>> {
        let devices = cpal::default_host().input_devices()?;
        Ok(devices.filter_map(|d| d.name().ok()).collect())
    }
}

fn build_input<T>(
    device: &Device,
    config: &StreamConfig,
    mut assembler: BlockAssembler,
    tx: Sender<Vec<f32>>,
    drops: DroppedBlocks,
) -> AppResult<Stream>
where
    T: SizedSample,
    f32: FromSample<T>,
{
    let mut scratch: Vec<f32> = Vec::new();
    let stream = device.build_input_stream(
        config,
        move |data: &[T], _: &cpal::InputCallbackInfo| {
            scratch.clear();
            scratch.extend(data.iter().map(|&s| f32::from_sample(s)));
            for block in assembler.push(&scratch) {
                if tx.try_send(block).is_err() {
                    drops.record();
                }
            }
        },
        |err| warn!(error = %err, "Input stream error"),
        None,
    )?;
    Ok(stream)
}

fn build_output<T>(device: &Device, config: &StreamConfig, mixer: Mixer) -> AppResult<Stream>
where
    T: SizedSample + FromSample<f32>,
{
    let channels = config.channels.max(1) as usize;
    let mut mono: Vec<f32> = Vec::new();
    let stream = device.build_output_stream(
        config,
        move |data: &mut [T], _: &cpal::OutputCallbackInfo| {
            mono.resize(data.len() / channels, 0.0);
            mixer.render(&mut mono);
            for (frame, &sample) in data.chunks_mut(channels).zip(mono.iter()) {
                let value = T::from_sample(sample);
                frame.fill(value);
            }
        },
        |err| warn!(error = %err, "Output stream error"),
        None,
    )?;
    Ok(stream)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_assembler_downmixes_and_blocks() {
        let mut assembler = BlockAssembler::new(2, 24_000, 24_000, 4);
        let blocks = assembler.push(&[1.0, 0.0, 0.5, 0.5, 0.0, 0.0]);
        assert!(blocks.is_empty());
        let blocks = assembler.push(&[0.25, 0.75, -1.0, -1.0]);
        assert_eq!(blocks, vec![vec![0.5, 0.5, 0.0, 0.5]]);
        assert_eq!(assembler.push(&[0.0, 0.0, 0.0, 0.0, 0.0, 0.0]), vec![vec![-1.0, 0.0, 0.0, 0.0]]);
    }

    #[test]
    fn test_assembler_resamples_to_target_rate() {
        let mut assembler = BlockAssembler::new(1, 48_000, 24_000, 4096);
        let mut blocks = Vec::new();
        for _ in 0..10 {
            blocks.extend(assembler.push(&vec![0.25; 960]));
        }
        // 9600 device samples → 4800 target samples → one full block
        assert_eq!(blocks.len(), 1);
        assert_eq!(blocks[0].len(), 4096);
    }

    #[test]
    fn test_dropped_blocks_report_only_new() {
        let mut drops = DroppedBlocks::default();
        let callback_side = drops.clone();
        assert_eq!(drops.take_new(), 0);

        callback_side.record();
        callback_side.record();
        assert_eq!(drops.take_new(), 2);
        assert_eq!(drops.take_new(), 0);

        callback_side.record();
        assert_eq!(drops.take_new(), 1);
    }

    #[test]
    fn test_list_devices() {
        // Headless CI machines have no audio devices
        if let Ok(devices) = AudioDevices::list_input_devices() {
            println!("Available input devices: {:?}", devices);
        }
    }
}
