//! Error taxonomy for the recording engine

use thiserror::Error;

/// Errors surfaced by the capture, playback and recording layers.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AudioError {
    /// No usable audio hardware, or the device refused to open.
    #[error("audio device unavailable: {0}")]
    DeviceUnavailable(String),

    /// The caller broke an engine precondition.
    #[error("invalid state: {0}")]
    InvalidState(String),

    /// Writing the take to disk failed; the take is aborted.
    #[error("storage failure: {0}")]
    StorageFailure(String),
}

impl AudioError {
    pub fn device(err: impl std::fmt::Display) -> Self {
        AudioError::DeviceUnavailable(err.to_string())
    }

    pub fn storage(err: impl std::fmt::Display) -> Self {
        AudioError::StorageFailure(err.to_string())
    }
}
