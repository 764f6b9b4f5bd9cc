//! Audio capture using cpal
//!
//! Delivers microphone blocks as mono 16-bit samples at 44.1kHz. The cpal
//! stream lives on its own thread for the whole capture run and is dropped
//! there when a stop command arrives.

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{FromSample, Sample, SampleFormat, SizedSample, StreamConfig};
use crossbeam_channel::{bounded, unbounded, Sender};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use super::error::AudioError;
use super::SAMPLE_RATE;

/// Represents an audio input device
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AudioDevice {
    pub index: usize,
    pub name: String,
}

/// Stream layout negotiated with the device
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct InputFormat {
    channels: u16,
    sample_format: SampleFormat,
}

enum CaptureCommand {
    Stop,
}

/// Microphone capture on one input device
pub struct CaptureSource {
    device: AudioDevice,
    format: InputFormat,
    is_running: Arc<AtomicBool>,
    thread_handle: Option<JoinHandle<()>>,
    sender: Option<Sender<CaptureCommand>>,
}

impl CaptureSource {
    /// List input devices in host order. An empty list means no input
    /// hardware, not an error.
    pub fn enumerate_devices() -> Vec<AudioDevice> {
        let host = cpal::default_host();
        match host.input_devices() {
            Ok(devices) => devices
                .enumerate()
                .map(|(index, device)| AudioDevice {
                    index,
                    name: device.name().unwrap_or_else(|_| format!("Input {}", index)),
                })
                .collect(),
            Err(e) => {
                log::warn!("Failed to enumerate input devices: {}", e);
                Vec::new()
            }
        }
    }

    /// Index of the host's default input device, if it shows up in the list.
    pub fn default_device_index() -> Option<usize> {
        let name = cpal::default_host().default_input_device()?.name().ok()?;
        Self::enumerate_devices()
            .into_iter()
            .find(|d| d.name == name)
            .map(|d| d.index)
    }

    /// Open input device `index` and negotiate a 44.1kHz format.
    pub fn open(index: usize) -> Result<Self, AudioError> {
        let device = find_device(index)?;
        let name = device
            .name()
            .unwrap_or_else(|_| format!("Input {}", index));

        let ranges = device
            .supported_input_configs()
            .map_err(|e| AudioError::device(format!("{}: {}", name, e)))?;
        let format = pick_format(
            ranges
                .filter(|r| {
                    r.min_sample_rate().0 <= SAMPLE_RATE && r.max_sample_rate().0 >= SAMPLE_RATE
                })
                .map(|r| (r.channels(), r.sample_format())),
        )
        .ok_or_else(|| {
            AudioError::device(format!("{} has no usable {} Hz input format", name, SAMPLE_RATE))
        })?;

        log::info!(
            "Using input device {}: {} ({} ch, {:?})",
            index,
            name,
            format.channels,
            format.sample_format
        );

        Ok(Self {
            device: AudioDevice { index, name },
            format,
            is_running: Arc::new(AtomicBool::new(false)),
            thread_handle: None,
            sender: None,
        })
    }

    /// The device this source captures from
    pub fn device(&self) -> &AudioDevice {
        &self.device
    }

    /// Check if capture is running
    pub fn is_running(&self) -> bool {
        self.is_running.load(Ordering::SeqCst)
    }

    /// Start capturing. `on_block` runs on the driver's audio thread once
    /// per delivered block and must not block.
    pub fn start<F>(&mut self, on_block: F) -> Result<(), AudioError>
    where
        F: FnMut(&[i16]) + Send + 'static,
    {
        if self.is_running() {
            return Err(AudioError::InvalidState("capture already running".to_string()));
        }

        let (sender, receiver) = unbounded::<CaptureCommand>();
        let (ready_tx, ready_rx) = bounded::<Result<(), AudioError>>(1);
        let index = self.device.index;
        let format = self.format;

        let handle = thread::Builder::new()
            .name("capture".to_string())
            .spawn(move || {
                let stream = match build_stream(index, format, on_block) {
                    Ok(stream) => stream,
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                        return;
                    }
                };
                if let Err(e) = stream.play() {
                    let _ = ready_tx.send(Err(AudioError::device(e)));
                    return;
                }
                let _ = ready_tx.send(Ok(()));

                // Park until stopped or the owner goes away
                let _ = receiver.recv();
                drop(stream);
                log::debug!("Capture stream on device {} closed", index);
            })
            .map_err(|e| AudioError::device(format!("failed to spawn capture thread: {}", e)))?;

        match ready_rx.recv() {
            Ok(Ok(())) => {
                self.is_running.store(true, Ordering::SeqCst);
                self.sender = Some(sender);
                self.thread_handle = Some(handle);
                log::info!("Capture started on {}", self.device.name);
                Ok(())
            }
            Ok(Err(e)) => {
                let _ = handle.join();
                Err(e)
            }
            Err(_) => {
                let _ = handle.join();
                Err(AudioError::device("capture thread exited during start"))
            }
        }
    }

    /// Stop capturing. Returns once no further blocks will be delivered.
    pub fn stop(&mut self) {
        if let Some(sender) = self.sender.take() {
            let _ = sender.send(CaptureCommand::Stop);
        }
        if let Some(handle) = self.thread_handle.take() {
            let _ = handle.join();
            log::info!("Capture stopped on {}", self.device.name);
        }
        self.is_running.store(false, Ordering::SeqCst);
    }
}

impl Drop for CaptureSource {
    fn drop(&mut self) {
        self.stop();
    }
}

fn find_device(index: usize) -> Result<cpal::Device, AudioError> {
    let host = cpal::default_host();
    host.input_devices()
        .map_err(AudioError::device)?
        .nth(index)
        .ok_or_else(|| AudioError::device(format!("no input device at index {}", index)))
}

/// Pick the best candidate: 16-bit over float, then fewest channels.
fn pick_format(candidates: impl Iterator<Item = (u16, SampleFormat)>) -> Option<InputFormat> {
    candidates
        .filter_map(|(channels, sample_format)| {
            let rank = match sample_format {
                SampleFormat::I16 => 0,
                SampleFormat::F32 => 1,
                _ => return None,
            };
            (channels > 0).then_some((rank, channels, sample_format))
        })
        .min_by_key(|&(rank, channels, _)| (rank, channels))
        .map(|(_, channels, sample_format)| InputFormat {
            channels,
            sample_format,
        })
}

fn build_stream<F>(index: usize, format: InputFormat, on_block: F) -> Result<cpal::Stream, AudioError>
where
    F: FnMut(&[i16]) + Send + 'static,
{
    let device = find_device(index)?;
    match format.sample_format {
        SampleFormat::I16 => build_stream_typed::<i16, F>(&device, format.channels, on_block),
        SampleFormat::F32 => build_stream_typed::<f32, F>(&device, format.channels, on_block),
        other => Err(AudioError::device(format!("unsupported sample format {:?}", other))),
    }
}

fn build_stream_typed<T, F>(
    device: &cpal::Device,
    channels: u16,
    mut on_block: F,
) -> Result<cpal::Stream, AudioError>
where
    T: SizedSample + Send + 'static,
    i16: FromSample<T>,
    F: FnMut(&[i16]) + Send + 'static,
{
    let config = StreamConfig {
        channels,
        sample_rate: cpal::SampleRate(SAMPLE_RATE),
        buffer_size: cpal::BufferSize::Default,
    };
    let stride = channels as usize;
    let mut mono: Vec<i16> = Vec::with_capacity(4096);

    device
        .build_input_stream(
            &config,
            move |data: &[T], _: &cpal::InputCallbackInfo| {
                // Keep the first channel of each interleaved frame
                mono.clear();
                mono.extend(data.iter().step_by(stride).map(|&s| s.to_sample::<i16>()));
                log::trace!("Captured block of {} samples", mono.len());
                on_block(&mono);
            },
            |err| log::error!("Capture stream error: {}", err),
            None,
        )
        .map_err(AudioError::device)
}
