use std::path::PathBuf;

use thiserror::Error;

/// Errors surfaced by the media I/O subsystem.
///
/// Binary-missing and capture-start failures are raised before any state
/// mutation. Handshake timeouts and merge failures are absorbed by the
/// recording state machine and only show up here when a caller asks for a
/// hard answer (e.g. [`MediaError::MergeFailure`] when no output file was
/// produced).
#[derive(Debug, Error)]
pub enum MediaError {
    #[error("media tool binary was not found in the bundled directory or on PATH")]
    BinaryNotFound,

    #[error("failed to start {tool}: {source}")]
    ProcessStartFailure {
        tool: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{tool} did not exit within {timeout_ms} ms")]
    ProcessTimeout { tool: String, timeout_ms: u64 },

    #[error("no audio output device is available for loopback capture: {0}")]
    CaptureDeviceUnavailable(String),

    #[error("merge produced no output file at '{path}'")]
    MergeFailure { path: PathBuf },

    #[error("decoder produced no PCM data for '{path}'")]
    DecodeEmptyResult { path: PathBuf },

    #[error("a recording session is already in progress")]
    RecordingInProgress,

    #[error(transparent)]
    Io(#[from] std::io::Error),
}
