//! Device-backed engine
//!
//! Wires an input device and the default output device to [`EngineCore`].
//! Either device may be missing; the engine then runs degraded instead of
//! failing.

use crossbeam_channel::{unbounded, Receiver, Sender};
use parking_lot::Mutex;
use std::path::PathBuf;
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use super::capture::{AudioDevice, CaptureSource};
use super::engine::{EngineCore, EngineEvent, EngineState};
use super::error::AudioError;
use super::playback::{OutputSpec, PlaybackSink};

struct PlaybackSlot {
    sink: Option<PlaybackSink>,
    run: Option<u64>,
}

/// Recording/playback engine bound to real audio devices
pub struct AudioEngine {
    core: Arc<EngineCore>,
    /// Held for the whole stop → swap → start of a device change
    capture: Arc<Mutex<Option<CaptureSource>>>,
    playback: Mutex<PlaybackSlot>,
    switch_sender: Option<Sender<usize>>,
    switch_thread: Option<JoinHandle<()>>,
}

impl AudioEngine {
    /// Create the engine and start capturing from input device `device`
    /// (or the host default). Missing hardware is logged, not fatal.
    pub fn new(device: Option<usize>) -> Result<Self, AudioError> {
        let core = Arc::new(EngineCore::new());

        let index = device.or_else(CaptureSource::default_device_index).or_else(|| {
            // Default device not in the list; take the first one there is
            (!CaptureSource::enumerate_devices().is_empty()).then_some(0)
        });
        let capture = match index {
            Some(index) => match open_capture(&core, index) {
                Ok(source) => Some(source),
                Err(e) => {
                    log::warn!("Continuing without capture: {}", e);
                    None
                }
            },
            None => {
                log::warn!("No input devices found; continuing without capture");
                None
            }
        };

        let sink = match PlaybackSink::open(OutputSpec::default()) {
            Ok(sink) => Some(sink),
            Err(e) => {
                log::warn!("Continuing without playback: {}", e);
                None
            }
        };

        let capture = Arc::new(Mutex::new(capture));
        let (switch_sender, requests) = unbounded::<usize>();
        let switch_core = core.clone();
        let switch_capture = capture.clone();
        let switch_thread = thread::Builder::new()
            .name("device-switch".to_string())
            .spawn(move || {
                run_switches(requests, |index| {
                    switch_capture_device(&switch_core, &switch_capture, index)
                })
            })
            .map_err(|e| AudioError::device(format!("failed to spawn device switch: {}", e)))?;

        Ok(Self {
            core,
            capture,
            playback: Mutex::new(PlaybackSlot { sink, run: None }),
            switch_sender: Some(switch_sender),
            switch_thread: Some(switch_thread),
        })
    }

    /// Input devices available for selection
    pub fn devices(&self) -> Vec<AudioDevice> {
        CaptureSource::enumerate_devices()
    }

    /// The device currently capturing, if any
    pub fn current_device(&self) -> Option<AudioDevice> {
        self.capture.lock().as_ref().map(|c| c.device().clone())
    }

    pub fn has_capture(&self) -> bool {
        self.capture.lock().is_some()
    }

    /// Switch capture to input device `index`.
    ///
    /// The swap is queued to the device-switch thread, so this may be called
    /// from anywhere, including a notification handler. Requests are applied
    /// in order and a burst collapses to its last one, so capture always
    /// ends on the most recently selected device. Capture is fully stopped
    /// before the new device is opened. If the new device fails to open the
    /// engine is left without capture.
    pub fn select_device(&self, index: usize) -> Result<(), AudioError> {
        let count = CaptureSource::enumerate_devices().len();
        if index >= count {
            return Err(AudioError::InvalidState(format!(
                "device index {} out of range (0..{})",
                index, count
            )));
        }

        self.switch_sender
            .as_ref()
            .ok_or_else(|| AudioError::device("device switching has shut down"))?
            .send(index)
            .map_err(|_| AudioError::device("device switch thread exited"))
    }

    pub fn subscribe(&self) -> Receiver<EngineEvent> {
        self.core.subscribe()
    }

    pub fn set_target_dir(&self, dir: impl Into<PathBuf>) {
        self.core.set_target_dir(dir);
    }

    pub fn state(&self) -> EngineState {
        self.core.state()
    }

    pub fn level(&self) -> f32 {
        self.core.level()
    }

    /// Samples of the last take held for playback
    pub fn buffered_samples(&self) -> usize {
        self.core.buffered_samples()
    }

    /// Start a new take. Needs a live input device.
    pub fn start_recording(&self) -> Result<PathBuf, AudioError> {
        if !self.has_capture() {
            return Err(AudioError::device("no input device to record from"));
        }
        self.stop_play();
        self.core.start_recording()
    }

    pub fn stop_recording(&self) -> Result<Option<PathBuf>, AudioError> {
        self.core.stop_recording()
    }

    /// Replay the last take from the start.
    pub fn play(&self) -> Result<(), AudioError> {
        let mut slot = self.playback.lock();
        self.stop_sink(&mut slot);

        let PlaybackSlot { sink, run } = &mut *slot;
        let Some(sink) = sink.as_mut() else {
            return Err(AudioError::device("no output device to play on"));
        };

        let new_run = self.core.begin_playback()?;
        let pull_core = self.core.clone();
        let done_core = self.core.clone();
        let started = sink.start(
            move |out| pull_core.pull(out),
            move || {
                done_core.finish_playback(new_run);
            },
        );

        match started {
            Ok(()) => {
                *run = Some(new_run);
                Ok(())
            }
            Err(e) => {
                self.core.finish_playback(new_run);
                Err(e)
            }
        }
    }

    /// Stop playback. A no-op when nothing is playing.
    pub fn stop_play(&self) {
        let mut slot = self.playback.lock();
        self.stop_sink(&mut slot);
    }

    fn stop_sink(&self, slot: &mut PlaybackSlot) {
        if let Some(sink) = slot.sink.as_mut() {
            sink.stop();
        }
        if let Some(run) = slot.run.take() {
            self.core.finish_playback(run);
        }
    }
}

impl Drop for AudioEngine {
    fn drop(&mut self) {
        // Let queued switches finish before capture is torn down
        self.switch_sender.take();
        if let Some(handle) = self.switch_thread.take() {
            let _ = handle.join();
        }
        self.stop_play();
        if let Err(e) = self.core.stop_recording() {
            log::error!("Closing take on shutdown failed: {}", e);
        }
        if let Some(mut source) = self.capture.lock().take() {
            source.stop();
        }
    }
}

/// Apply switch requests in arrival order until the sender goes away.
/// Requests that queued up behind a running switch are stale except the
/// newest, so only that one is applied.
fn run_switches(requests: Receiver<usize>, mut apply: impl FnMut(usize)) {
    while let Ok(first) = requests.recv() {
        let index = requests.try_iter().last().unwrap_or(first);
        if index != first {
            log::debug!("Skipping stale switch to input {}", first);
        }
        apply(index);
    }
}

fn switch_capture_device(
    core: &Arc<EngineCore>,
    capture: &Mutex<Option<CaptureSource>>,
    index: usize,
) {
    let mut slot = capture.lock();
    if let Some(mut current) = slot.take() {
        current.stop();
    }
    match open_capture(core, index) {
        Ok(source) => {
            log::info!("Capturing from input {}", index);
            *slot = Some(source);
        }
        Err(e) => log::warn!("Switching to input {} failed: {}", index, e),
    }
}

fn open_capture(core: &Arc<EngineCore>, index: usize) -> Result<CaptureSource, AudioError> {
    let mut source = CaptureSource::open(index)?;
    let sink = core.clone();
    source.start(move |block| sink.on_capture_block(block))?;
    Ok(source)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_switches_apply_in_order() {
        let (sender, requests) = unbounded();
        let (applied_tx, applied_rx) = unbounded();
        let worker = thread::spawn(move || {
            run_switches(requests, |index| applied_tx.send(index).unwrap())
        });

        for index in [2, 0, 1] {
            sender.send(index).unwrap();
            // Wait for each switch so none of them is stale
            assert_eq!(applied_rx.recv_timeout(Duration::from_secs(5)), Ok(index));
        }

        drop(sender);
        worker.join().unwrap();
    }

    #[test]
    fn test_queued_switches_collapse_to_latest() {
        let (sender, requests) = unbounded();
        for index in [1, 3, 2] {
            sender.send(index).unwrap();
        }
        drop(sender);

        let mut applied = Vec::new();
        run_switches(requests, |index| applied.push(index));
        assert_eq!(applied, vec![2]);
    }

    #[test]
    fn test_switch_queued_during_a_swap_wins() {
        let (sender, requests) = unbounded();
        let (started_tx, started_rx) = unbounded();
        let (release_tx, release_rx) = unbounded::<()>();

        let worker = thread::spawn(move || {
            let mut applied = Vec::new();
            run_switches(requests, |index| {
                applied.push(index);
                if applied.len() == 1 {
                    started_tx.send(()).unwrap();
                    release_rx.recv().unwrap();
                }
            });
            applied
        });

        sender.send(0).unwrap();
        started_rx.recv().unwrap();
        // Both arrive while the first swap is still running
        sender.send(1).unwrap();
        sender.send(4).unwrap();
        release_tx.send(()).unwrap();
        drop(sender);

        assert_eq!(worker.join().unwrap(), vec![0, 4]);
    }
}
