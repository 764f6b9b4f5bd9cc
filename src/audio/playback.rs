//! Audio playback using cpal
//!
//! The sink pulls mono samples from a caller-supplied source whenever the
//! output device asks for more, and reports completion exactly once per run.

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{FromSample, Sample, SampleFormat, SizedSample, StreamConfig};
use crossbeam_channel::{bounded, unbounded, Sender};
use parking_lot::Mutex;
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use super::error::AudioError;
use super::SAMPLE_RATE;

/// What the sink plays: mono samples at a fixed rate
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct OutputSpec {
    pub sample_rate: u32,
}

impl Default for OutputSpec {
    fn default() -> Self {
        Self {
            sample_rate: SAMPLE_RATE,
        }
    }
}

/// Stream layout negotiated with the output device
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct OutputFormat {
    channels: u16,
    sample_format: SampleFormat,
}

enum PlaybackCommand {
    Stop,
    Finished,
}

/// One-shot completion notification shared by the audio callback and `stop`
pub struct Completion {
    notify: Mutex<Option<Box<dyn FnOnce() + Send>>>,
}

impl Completion {
    pub fn new(notify: impl FnOnce() + Send + 'static) -> Self {
        Self {
            notify: Mutex::new(Some(Box::new(notify))),
        }
    }

    /// Run the notification if nobody has yet. Returns whether this call ran it.
    pub fn fire(&self) -> bool {
        let notify = self.notify.lock().take();
        match notify {
            Some(notify) => {
                notify();
                true
            }
            None => false,
        }
    }
}

/// Audio output on the host's default device
pub struct PlaybackSink {
    spec: OutputSpec,
    format: OutputFormat,
    thread_handle: Option<JoinHandle<()>>,
    sender: Option<Sender<PlaybackCommand>>,
    completion: Option<Arc<Completion>>,
}

impl PlaybackSink {
    /// Open the default output device for `spec`.
    pub fn open(spec: OutputSpec) -> Result<Self, AudioError> {
        let device = default_output_device()?;
        let name = device.name().unwrap_or_else(|_| "default output".to_string());

        let ranges = device
            .supported_output_configs()
            .map_err(|e| AudioError::device(format!("{}: {}", name, e)))?;
        let format = pick_output_format(
            ranges
                .filter(|r| {
                    r.min_sample_rate().0 <= spec.sample_rate
                        && r.max_sample_rate().0 >= spec.sample_rate
                })
                .map(|r| (r.channels(), r.sample_format())),
        )
        .ok_or_else(|| {
            AudioError::device(format!(
                "{} has no usable {} Hz output format",
                name, spec.sample_rate
            ))
        })?;

        log::info!(
            "Using output device {} ({} ch, {:?})",
            name,
            format.channels,
            format.sample_format
        );

        Ok(Self {
            spec,
            format,
            thread_handle: None,
            sender: None,
            completion: None,
        })
    }

    /// Start a playback run.
    ///
    /// `pull` fills the slice it is given and returns how many samples it
    /// wrote; a short count ends the run. `on_complete` runs exactly once,
    /// on exhaustion or on [`PlaybackSink::stop`], whichever comes first.
    pub fn start<P, C>(&mut self, pull: P, on_complete: C) -> Result<(), AudioError>
    where
        P: FnMut(&mut [f32]) -> usize + Send + 'static,
        C: FnOnce() + Send + 'static,
    {
        if self.thread_handle.is_some() {
            return Err(AudioError::InvalidState("playback already running".to_string()));
        }

        let completion = Arc::new(Completion::new(on_complete));
        let (sender, receiver) = unbounded::<PlaybackCommand>();
        let (ready_tx, ready_rx) = bounded::<Result<(), AudioError>>(1);

        let spec = self.spec;
        let format = self.format;
        let finished = Finish {
            completion: completion.clone(),
            sender: sender.clone(),
        };

        let handle = thread::Builder::new()
            .name("playback".to_string())
            .spawn(move || {
                let stream = match build_stream(spec, format, pull, finished) {
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

                // Run until stopped or the buffer runs dry
                match receiver.recv() {
                    Ok(PlaybackCommand::Finished) => log::debug!("Playback reached end of buffer"),
                    Ok(PlaybackCommand::Stop) | Err(_) => log::debug!("Playback stopped"),
                }
                drop(stream);
            })
            .map_err(|e| AudioError::device(format!("failed to spawn playback thread: {}", e)))?;

        match ready_rx.recv() {
            Ok(Ok(())) => {
                self.sender = Some(sender);
                self.thread_handle = Some(handle);
                self.completion = Some(completion);
                Ok(())
            }
            Ok(Err(e)) => {
                let _ = handle.join();
                Err(e)
            }
            Err(_) => {
                let _ = handle.join();
                Err(AudioError::device("playback thread exited during start"))
            }
        }
    }

    /// Stop the current run. A no-op when nothing is playing.
    pub fn stop(&mut self) {
        if let Some(sender) = self.sender.take() {
            let _ = sender.send(PlaybackCommand::Stop);
        }
        if let Some(handle) = self.thread_handle.take() {
            let _ = handle.join();
        }
        if let Some(completion) = self.completion.take() {
            completion.fire();
        }
    }
}

impl Drop for PlaybackSink {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Handed to the audio callback so it can end the run from inside.
struct Finish {
    completion: Arc<Completion>,
    sender: Sender<PlaybackCommand>,
}

impl Finish {
    fn fire(&self) {
        self.completion.fire();
        let _ = self.sender.send(PlaybackCommand::Finished);
    }
}

fn default_output_device() -> Result<cpal::Device, AudioError> {
    cpal::default_host()
        .default_output_device()
        .ok_or_else(|| AudioError::device("no output device"))
}

/// Float output preferred, then 16-bit; fewest channels first.
fn pick_output_format(candidates: impl Iterator<Item = (u16, SampleFormat)>) -> Option<OutputFormat> {
    candidates
        .filter_map(|(channels, sample_format)| {
            let rank = match sample_format {
                SampleFormat::F32 => 0,
                SampleFormat::I16 => 1,
                _ => return None,
            };
            (channels > 0).then_some((rank, channels, sample_format))
        })
        .min_by_key(|&(rank, channels, _)| (rank, channels))
        .map(|(_, channels, sample_format)| OutputFormat {
            channels,
            sample_format,
        })
}

fn build_stream<P>(
    spec: OutputSpec,
    format: OutputFormat,
    pull: P,
    finished: Finish,
) -> Result<cpal::Stream, AudioError>
where
    P: FnMut(&mut [f32]) -> usize + Send + 'static,
{
    let device = default_output_device()?;
    match format.sample_format {
        SampleFormat::F32 => build_stream_typed::<f32, P>(&device, spec, format.channels, pull, finished),
        SampleFormat::I16 => build_stream_typed::<i16, P>(&device, spec, format.channels, pull, finished),
        other => Err(AudioError::device(format!("unsupported sample format {:?}", other))),
    }
}

fn build_stream_typed<T, P>(
    device: &cpal::Device,
    spec: OutputSpec,
    channels: u16,
    mut pull: P,
    finished: Finish,
) -> Result<cpal::Stream, AudioError>
where
    T: SizedSample + FromSample<f32> + Send + 'static,
    P: FnMut(&mut [f32]) -> usize + Send + 'static,
{
    let config = StreamConfig {
        channels,
        sample_rate: cpal::SampleRate(spec.sample_rate),
        buffer_size: cpal::BufferSize::Default,
    };
    let stride = channels as usize;
    let mut mono: Vec<f32> = Vec::with_capacity(4096);
    let mut exhausted = false;

    device
        .build_output_stream(
            &config,
            move |data: &mut [T], _: &cpal::OutputCallbackInfo| {
                if fill_period(data, stride, &mut mono, &mut exhausted, &mut pull) {
                    finished.fire();
                }
            },
            |err| log::error!("Playback stream error: {}", err),
            None,
        )
        .map_err(AudioError::device)
}

/// Fill one device period from `pull`.
///
/// Each mono sample is copied to every channel of its frame and frames past
/// the end of the pulled data are silent. Once a pull comes up short the run
/// is exhausted and `pull` is not called again. Returns true only for the
/// period in which the run ran out.
fn fill_period<T, P>(
    data: &mut [T],
    stride: usize,
    mono: &mut Vec<f32>,
    exhausted: &mut bool,
    pull: &mut P,
) -> bool
where
    T: Sample + FromSample<f32>,
    P: FnMut(&mut [f32]) -> usize,
{
    let frames = data.len() / stride;
    let copied = if *exhausted {
        0
    } else {
        mono.resize(frames, 0.0);
        pull(&mut mono[..frames]).min(frames)
    };

    for (i, frame) in data.chunks_mut(stride).enumerate() {
        let value = if i < copied {
            T::from_sample(mono[i])
        } else {
            T::EQUILIBRIUM
        };
        frame.fill(value);
    }

    if !*exhausted && copied < frames {
        *exhausted = true;
        return true;
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    #[test]
    fn test_completion_fires_once() {
        let count = Arc::new(AtomicUsize::new(0));
        let counter = count.clone();
        let completion = Completion::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        assert!(completion.fire());
        assert!(!completion.fire());
        assert!(!completion.fire());
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_completion_races_fire_once() {
        let count = Arc::new(AtomicUsize::new(0));
        let counter = count.clone();
        let completion = Arc::new(Completion::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        }));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let completion = completion.clone();
                thread::spawn(move || completion.fire())
            })
            .collect();
        let fired = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|&ran| ran)
            .count();

        assert_eq!(fired, 1);
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_finish_signals_host_thread() {
        let (sender, receiver) = unbounded();
        let fired = Arc::new(AtomicBool::new(false));
        let flag = fired.clone();
        let finish = Finish {
            completion: Arc::new(Completion::new(move || flag.store(true, Ordering::SeqCst))),
            sender,
        };

        finish.fire();
        assert!(fired.load(Ordering::SeqCst));
        assert!(matches!(receiver.try_recv(), Ok(PlaybackCommand::Finished)));
    }

    #[test]
    fn test_output_format_preference() {
        let format = pick_output_format(
            vec![(2, SampleFormat::I16), (2, SampleFormat::F32), (6, SampleFormat::F32)].into_iter(),
        );
        assert_eq!(
            format,
            Some(OutputFormat {
                channels: 2,
                sample_format: SampleFormat::F32
            })
        );
        assert_eq!(pick_output_format(vec![(2, SampleFormat::U8)].into_iter()), None);
    }

    /// Pull source over a fixed buffer that counts how often it is asked.
    fn source(samples: Vec<f32>, calls: Arc<AtomicUsize>) -> impl FnMut(&mut [f32]) -> usize {
        let mut cursor = 0;
        move |out: &mut [f32]| {
            calls.fetch_add(1, Ordering::SeqCst);
            let count = out.len().min(samples.len() - cursor);
            out[..count].copy_from_slice(&samples[cursor..cursor + count]);
            cursor += count;
            count
        }
    }

    #[test]
    fn test_fill_period_duplicates_across_channels() {
        let calls = Arc::new(AtomicUsize::new(0));
        let mut pull = source(vec![0.5, -0.5, 0.25, 0.125, 1.0], calls.clone());
        let mut mono = Vec::new();
        let mut exhausted = false;
        let mut data = vec![9.0f32; 8];

        assert!(!fill_period(&mut data, 2, &mut mono, &mut exhausted, &mut pull));
        assert_eq!(data, vec![0.5, 0.5, -0.5, -0.5, 0.25, 0.25, 0.125, 0.125]);
        assert!(!exhausted);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_short_pull_ends_run_with_silence() {
        let calls = Arc::new(AtomicUsize::new(0));
        let mut pull = source(vec![0.5, -0.5, 0.25], calls.clone());
        let mut mono = Vec::new();
        let mut exhausted = false;
        let mut data = vec![9.0f32; 8];

        assert!(fill_period(&mut data, 2, &mut mono, &mut exhausted, &mut pull));
        assert_eq!(data, vec![0.5, 0.5, -0.5, -0.5, 0.25, 0.25, 0.0, 0.0]);
        assert!(exhausted);

        // Later periods are silent, do not pull and do not signal again
        let mut data = vec![9.0f32; 8];
        assert!(!fill_period(&mut data, 2, &mut mono, &mut exhausted, &mut pull));
        assert_eq!(data, vec![0.0; 8]);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_empty_buffer_ends_on_first_period() {
        let calls = Arc::new(AtomicUsize::new(0));
        let mut pull = source(Vec::new(), calls.clone());
        let mut mono = Vec::new();
        let mut exhausted = false;
        let mut data = vec![7i16; 6];

        assert!(fill_period(&mut data, 3, &mut mono, &mut exhausted, &mut pull));
        assert_eq!(data, vec![i16::EQUILIBRIUM; 6]);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_exact_fit_ends_on_following_period() {
        let calls = Arc::new(AtomicUsize::new(0));
        let mut pull = source(vec![0.25; 4], calls.clone());
        let mut mono = Vec::new();
        let mut exhausted = false;

        let mut data = vec![0.0f32; 4];
        assert!(!fill_period(&mut data, 1, &mut mono, &mut exhausted, &mut pull));
        assert_eq!(data, vec![0.25; 4]);

        assert!(fill_period(&mut data, 1, &mut mono, &mut exhausted, &mut pull));
        assert_eq!(data, vec![0.0; 4]);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_default_spec_matches_capture_rate() {
        assert_eq!(OutputSpec::default().sample_rate, SAMPLE_RATE);
    }
}
