//! Recording/playback state machine
//!
//! `EngineCore` owns the sample buffer, the read cursor and the open take.
//! Capture blocks come in through [`EngineCore::on_capture_block`] on the
//! driver thread, playback pulls samples through [`EngineCore::pull`] on the
//! output thread, and the control operations run on the caller's thread.
//!
//! Two locks are involved. `control` serializes control operations with each
//! other and is never taken on an audio thread. `inner` guards the shared
//! state and is held only briefly, so audio threads never wait on file
//! creation or on a take being finalized.

use crossbeam_channel::{unbounded, Receiver, Sender};
use parking_lot::Mutex;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU32, Ordering};

use super::error::AudioError;
use super::recorder::{next_take_path, RecordingSession};
use super::{normalize, peak_level};

/// Observable engine state
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EngineState {
    Idle,
    Recording,
    Playing,
}

/// Notifications pushed to subscribers, in the order they happened
#[derive(Clone, Debug, PartialEq)]
pub enum EngineEvent {
    /// Peak level of the latest capture block (0.0 - 1.0)
    Level(f32),
    RecordingStarted { path: PathBuf },
    /// `error` is set when the take was aborted by a write failure
    RecordingStopped {
        path: PathBuf,
        error: Option<AudioError>,
    },
    PlaybackStarted,
    PlaybackStopped,
}

/// Tagged state; the open take only exists while recording.
enum Mode {
    Idle,
    Recording(RecordingSession),
    Playing { run: u64 },
}

struct Inner {
    mode: Mode,
    buffer: Vec<f32>,
    cursor: usize,
    target_dir: Option<PathBuf>,
    /// Failure of a take that was aborted on the capture thread
    pending_error: Option<AudioError>,
    next_run: u64,
}

pub struct EngineCore {
    control: Mutex<()>,
    inner: Mutex<Inner>,
    level_bits: AtomicU32,
    subscribers: Mutex<Vec<Sender<EngineEvent>>>,
}

impl EngineCore {
    pub fn new() -> Self {
        Self {
            control: Mutex::new(()),
            inner: Mutex::new(Inner {
                mode: Mode::Idle,
                buffer: Vec::new(),
                cursor: 0,
                target_dir: None,
                pending_error: None,
                next_run: 0,
            }),
            level_bits: AtomicU32::new(0.0f32.to_bits()),
            subscribers: Mutex::new(Vec::new()),
        }
    }

    /// Receive every notification emitted from now on
    pub fn subscribe(&self) -> Receiver<EngineEvent> {
        let (sender, receiver) = unbounded();
        self.subscribers.lock().push(sender);
        receiver
    }

    /// Directory that the next take is written to. It must exist.
    pub fn set_target_dir(&self, dir: impl Into<PathBuf>) {
        let dir = dir.into();
        log::debug!("Target directory set to {}", dir.display());
        self.inner.lock().target_dir = Some(dir);
    }

    pub fn state(&self) -> EngineState {
        match self.inner.lock().mode {
            Mode::Idle => EngineState::Idle,
            Mode::Recording(_) => EngineState::Recording,
            Mode::Playing { .. } => EngineState::Playing,
        }
    }

    /// Level of the most recent capture block
    pub fn level(&self) -> f32 {
        f32::from_bits(self.level_bits.load(Ordering::Relaxed))
    }

    /// Number of samples held for playback
    pub fn buffered_samples(&self) -> usize {
        self.inner.lock().buffer.len()
    }

    /// Position of the next playback read
    #[cfg(test)]
    pub fn cursor(&self) -> usize {
        self.inner.lock().cursor
    }

    /// Open a new take in the target directory and start recording into it.
    ///
    /// An active playback is ended first. The sample buffer is cleared only
    /// once the take file exists, so a failed start leaves the last take
    /// playable. If the previous take was aborted by a write failure and
    /// nobody collected it through [`EngineCore::stop_recording`], that
    /// failure is returned instead and no take is opened.
    pub fn start_recording(&self) -> Result<PathBuf, AudioError> {
        let _control = self.control.lock();

        let dir = {
            let mut inner = self.inner.lock();
            if matches!(inner.mode, Mode::Recording(_)) {
                return Err(AudioError::InvalidState("already recording".to_string()));
            }
            if let Some(error) = inner.pending_error.take() {
                return Err(error);
            }
            inner
                .target_dir
                .clone()
                .ok_or_else(|| AudioError::InvalidState("no target directory set".to_string()))?
        };
        if !dir.is_dir() {
            return Err(AudioError::InvalidState(format!(
                "target directory {} does not exist",
                dir.display()
            )));
        }

        let path = next_take_path(&dir)?;
        let session = RecordingSession::create(&path)?;
        self.install_session(session);
        Ok(path)
    }

    fn install_session(&self, session: RecordingSession) {
        let path = session.path().to_path_buf();
        let mut inner = self.inner.lock();

        if matches!(inner.mode, Mode::Playing { .. }) {
            inner.mode = Mode::Idle;
            self.emit(EngineEvent::PlaybackStopped);
        }

        inner.buffer.clear();
        inner.cursor = 0;
        inner.mode = Mode::Recording(session);

        log::info!("Recording started: {}", path.display());
        self.emit(EngineEvent::RecordingStarted { path });
    }

    /// Close the current take.
    ///
    /// Returns the take's path, or `None` when nothing was being recorded.
    /// A take that failed to write (now or earlier on the capture thread)
    /// reports its `StorageFailure` here.
    pub fn stop_recording(&self) -> Result<Option<PathBuf>, AudioError> {
        let _control = self.control.lock();
        self.stop_recording_locked()
    }

    fn stop_recording_locked(&self) -> Result<Option<PathBuf>, AudioError> {
        let session = {
            let mut inner = self.inner.lock();
            match std::mem::replace(&mut inner.mode, Mode::Idle) {
                Mode::Recording(session) => session,
                other => {
                    inner.mode = other;
                    return match inner.pending_error.take() {
                        Some(e) => Err(e),
                        None => Ok(None),
                    };
                }
            }
        };

        let path = session.path().to_path_buf();
        let result = session.finish();
        match &result {
            Ok(_) => log::info!("Recording stopped: {}", path.display()),
            Err(e) => log::error!("Recording {} failed: {}", path.display(), e),
        }
        self.emit(EngineEvent::RecordingStopped {
            path,
            error: result.as_ref().err().cloned(),
        });
        result.map(Some)
    }

    /// Switch to playing from the start of the buffer.
    ///
    /// A take still being recorded is closed first; if closing it fails the
    /// error is returned and playback does not start. Returns the run id the
    /// caller passes back to [`EngineCore::finish_playback`].
    pub fn begin_playback(&self) -> Result<u64, AudioError> {
        let _control = self.control.lock();

        if self.state() == EngineState::Recording {
            self.stop_recording_locked()?;
        }

        let mut inner = self.inner.lock();
        if matches!(inner.mode, Mode::Playing { .. }) {
            self.emit(EngineEvent::PlaybackStopped);
        }

        let run = inner.next_run;
        inner.next_run += 1;
        inner.cursor = 0;
        inner.mode = Mode::Playing { run };

        log::info!("Playback started ({} samples)", inner.buffer.len());
        self.emit(EngineEvent::PlaybackStarted);
        Ok(run)
    }

    /// End playback run `run`. Stale runs are ignored, so this is safe to
    /// call from both an explicit stop and the sink's completion.
    pub fn finish_playback(&self, run: u64) -> bool {
        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        match inner.mode {
            Mode::Playing { run: current } if current == run => {
                inner.mode = Mode::Idle;
                log::info!("Playback stopped at sample {}", inner.cursor);
                self.emit(EngineEvent::PlaybackStopped);
                true
            }
            _ => false,
        }
    }

    /// Handle one capture block: publish its level and, while recording,
    /// append it to the buffer and hand it to the take writer.
    pub fn on_capture_block(&self, block: &[i16]) {
        let level = peak_level(block);
        self.level_bits.store(level.to_bits(), Ordering::Relaxed);

        let mut guard = self.inner.lock();
        let inner = &mut *guard;

        let failed = match &inner.mode {
            Mode::Recording(session) => {
                inner.buffer.extend(block.iter().map(|&s| normalize(s)));
                session.write(block).err()
            }
            _ => None,
        };

        self.emit(EngineEvent::Level(level));

        if let Some(send_error) = failed {
            if let Mode::Recording(session) = std::mem::replace(&mut inner.mode, Mode::Idle) {
                let path = session.path().to_path_buf();
                // The writer has already exited, so this returns promptly
                let error = session.finish().err().unwrap_or(send_error);
                log::error!("Aborting take {}: {}", path.display(), error);
                inner.pending_error = Some(error.clone());
                self.emit(EngineEvent::RecordingStopped {
                    path,
                    error: Some(error),
                });
            }
        }
    }

    /// Copy up to `out.len()` samples from the read cursor into `out`.
    ///
    /// Returns how many were copied. Anything short of `out.len()` means the
    /// buffer is exhausted; nothing is produced outside of playback.
    pub fn pull(&self, out: &mut [f32]) -> usize {
        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        if !matches!(inner.mode, Mode::Playing { .. }) {
            return 0;
        }

        let start = inner.cursor.min(inner.buffer.len());
        let count = out.len().min(inner.buffer.len() - start);
        out[..count].copy_from_slice(&inner.buffer[start..start + count]);
        inner.cursor = start + count;
        count
    }

    fn emit(&self, event: EngineEvent) {
        let mut subscribers = self.subscribers.lock();
        subscribers.retain(|s| s.send(event.clone()).is_ok());
    }
}

impl Default for EngineCore {
    fn default() -> Self {
        Self::new()
    }
}
