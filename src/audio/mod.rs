//! Audio capture, recording and playback
//!
//! This module provides:
//! - Microphone capture at 44.1kHz mono 16-bit via cpal
//! - Live peak level metering on every captured block
//! - Per-take WAV recording via hound, plus an in-memory copy for replay
//! - Playback of the last take straight from memory

mod capture;
mod controller;
mod engine;
mod error;
mod playback;
mod recorder;

pub use capture::{AudioDevice, CaptureSource};
pub use controller::AudioEngine;
pub use engine::{EngineEvent, EngineState};
pub use error::AudioError;
pub use recorder::{duration_seconds, take_duration};

/// Capture and playback sample rate.
pub const SAMPLE_RATE: u32 = 44_100;

/// Takes are always mono.
pub const CHANNELS: u16 = 1;

/// Bit depth of captured samples and of the WAV files written.
pub const BITS_PER_SAMPLE: u16 = 16;

/// WAV layout of every take file.
pub fn take_spec() -> hound::WavSpec {
    hound::WavSpec {
        channels: CHANNELS,
        sample_rate: SAMPLE_RATE,
        bits_per_sample: BITS_PER_SAMPLE,
        sample_format: hound::SampleFormat::Int,
    }
}

/// Normalize a signed 16-bit sample to [-1.0, 1.0).
#[inline]
pub fn normalize(sample: i16) -> f32 {
    sample as f32 / 32768.0
}

/// Peak absolute amplitude of a block, 0.0 for an empty block.
pub fn peak_level(samples: &[i16]) -> f32 {
    samples
        .iter()
        .map(|&s| normalize(s).abs())
        .fold(0.0f32, f32::max)
}
