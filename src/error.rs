//! Error taxonomy shared by the capture, recording and control layers.

use std::path::PathBuf;

use thiserror::Error;

/// Failures raised by a frame source.
#[derive(Error, Debug)]
pub enum SourceError {
    /// The camera cannot be used: open failed on every candidate device, too
    /// many consecutive capture errors, or the device stopped answering.
    #[error("camera {camera} unavailable: {reason}")]
    DeviceUnavailable { camera: String, reason: String },

    /// Transient single-frame read failure.
    #[error("frame capture failed: {0}")]
    Capture(String),

    #[error("end of stream")]
    EndOfStream,
}

/// Failures raised by the clip recorder.
#[derive(Error, Debug)]
pub enum RecordError {
    #[error("a clip is already being recorded")]
    AlreadyRecording,

    #[error("writing clip {path:?} failed: {source}")]
    StorageWrite {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl RecordError {
    pub(crate) fn storage(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        RecordError::StorageWrite {
            path: path.into(),
            source,
        }
    }
}

/// Errors returned to callers of the supervisor and session control surface.
#[derive(Error, Debug)]
pub enum ControlError {
    #[error("unknown camera '{0}'")]
    UnknownCamera(String),

    #[error("camera '{0}' is not running")]
    NotRunning(String),

    #[error("monitoring is already running")]
    AlreadyRunning,

    #[error("camera '{0}' is already recording")]
    AlreadyRecording(String),

    #[error("camera id '{0}' is configured more than once")]
    DuplicateCamera(String),

    #[error("camera id '{0}' may only contain letters, digits, '-' and '_'")]
    InvalidCameraId(String),

    #[error("invalid recording name '{0}'")]
    InvalidRecordingName(String),

    #[error("failed to spawn session thread: {0}")]
    Spawn(#[source] std::io::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Errors raised while loading or validating settings.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to load configuration: {0}")]
    Load(#[from] config::ConfigError),

    #[error("invalid configuration: {0}")]
    Invalid(String),
}
