//! WAV take recording using hound
//!
//! A recording session owns a writer thread so the capture callback never
//! touches the disk itself: blocks are handed over a channel and written in
//! arrival order.

use crossbeam_channel::{unbounded, Sender};
use hound::{WavReader, WavWriter};
use std::fs::{self, File};
use std::io::{BufWriter, Seek, Write};
use std::path::{Path, PathBuf};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use super::error::AudioError;
use super::take_spec;

/// Attempts made by [`take_duration`] before giving up on a file.
const READ_ATTEMPTS: u32 = 5;
const READ_BACKOFF: Duration = Duration::from_millis(20);

/// An open take file, live only while the engine is recording.
pub struct RecordingSession {
    path: PathBuf,
    sender: Option<Sender<Vec<i16>>>,
    writer_thread: Option<JoinHandle<Result<(), AudioError>>>,
}

impl RecordingSession {
    /// Create (or truncate) the take file at `path` and start its writer.
    pub fn create(path: &Path) -> Result<Self, AudioError> {
        let file = File::create(path).map_err(|e| {
            AudioError::storage(format!("failed to create {}: {}", path.display(), e))
        })?;
        let writer = WavWriter::new(BufWriter::new(file), take_spec())
            .map_err(|e| AudioError::storage(format!("failed to write WAV header: {}", e)))?;
        Self::with_writer(path.to_path_buf(), writer)
    }

    /// Start a session over an already constructed WAV writer.
    pub(crate) fn with_writer<W>(path: PathBuf, writer: WavWriter<W>) -> Result<Self, AudioError>
    where
        W: Write + Seek + Send + 'static,
    {
        let (sender, receiver) = unbounded::<Vec<i16>>();
        let name = path.display().to_string();

        let handle = thread::Builder::new()
            .name("take-writer".to_string())
            .spawn(move || -> Result<(), AudioError> {
                let mut writer = writer;
                for block in receiver.iter() {
                    for &sample in &block {
                        writer.write_sample(sample).map_err(|e| {
                            log::error!("Write to {} failed: {}", name, e);
                            AudioError::storage(e)
                        })?;
                    }
                }
                writer.finalize().map_err(AudioError::storage)?;
                log::debug!("Finalized {}", name);
                Ok(())
            })
            .map_err(|e| AudioError::storage(format!("failed to spawn writer: {}", e)))?;

        Ok(Self {
            path,
            sender: Some(sender),
            writer_thread: Some(handle),
        })
    }

    /// Path of the take file
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Queue a block for the writer. Fails once the writer has given up.
    pub fn write(&self, block: &[i16]) -> Result<(), AudioError> {
        let Some(sender) = &self.sender else {
            return Err(AudioError::storage("session already closed"));
        };
        sender
            .send(block.to_vec())
            .map_err(|_| AudioError::storage(format!("writer for {} stopped", self.path.display())))
    }

    /// Drain queued blocks, finalize the WAV header and close the file.
    ///
    /// Returns the first write error the writer hit, if any.
    pub fn finish(mut self) -> Result<PathBuf, AudioError> {
        self.close()?;
        Ok(std::mem::take(&mut self.path))
    }

    fn close(&mut self) -> Result<(), AudioError> {
        // Dropping the sender ends the writer loop once the queue is empty
        self.sender.take();
        match self.writer_thread.take() {
            Some(handle) => handle
                .join()
                .map_err(|_| AudioError::storage("writer thread panicked"))?,
            None => Ok(()),
        }
    }
}

impl Drop for RecordingSession {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            log::warn!("Take {} closed with error: {}", self.path.display(), e);
        }
    }
}

/// Path for the next take in `dir`: the count of files already there,
/// zero-padded to four digits.
///
/// The count is taken live, so a gap left by a deleted take makes the new
/// name collide with an existing file, which is then overwritten.
pub fn next_take_path(dir: &Path) -> Result<PathBuf, AudioError> {
    let entries = fs::read_dir(dir).map_err(|e| {
        AudioError::InvalidState(format!("cannot read target directory {}: {}", dir.display(), e))
    })?;

    let count = entries
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_type().map(|t| t.is_file()).unwrap_or(false))
        .count();

    let path = dir.join(format!("{:04}.wav", count));
    if path.exists() {
        log::warn!("Take {} already exists and will be overwritten", path.display());
    }
    Ok(path)
}

/// Duration in seconds of a finished take, read back from its header.
///
/// The file may still be settling right after the writer closed it, so the
/// read is retried a few times with a short backoff.
pub fn take_duration(path: impl AsRef<Path>) -> Result<f64, AudioError> {
    let path = path.as_ref();
    let mut last_error = None;

    for attempt in 1..=READ_ATTEMPTS {
        match WavReader::open(path) {
            Ok(reader) => {
                let spec = reader.spec();
                return Ok(duration_seconds(reader.duration() as usize, spec.sample_rate));
            }
            Err(e) => {
                log::debug!("Reading {} failed (attempt {}): {}", path.display(), attempt, e);
                last_error = Some(e);
                thread::sleep(READ_BACKOFF);
            }
        }
    }

    Err(AudioError::storage(format!(
        "failed to read {}: {}",
        path.display(),
        last_error.map(|e| e.to_string()).unwrap_or_default()
    )))
}

/// Get duration of samples in seconds
pub fn duration_seconds(sample_count: usize, sample_rate: u32) -> f64 {
    sample_count as f64 / sample_rate as f64
}
