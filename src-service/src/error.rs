//! Error taxonomy for the capture and recording pipeline.

use camrec_common::Shape;
use std::path::PathBuf;
use thiserror::Error;

/// Errors raised at the camera device boundary.
#[derive(Debug, Error)]
pub enum DeviceError {
    #[error("failed to open camera {index}: {reason}")]
    Open { index: u32, reason: String },

    #[error("failed to read frame: {0}")]
    Read(String),

    #[error("failed to set {property} to {value}: {reason}")]
    Property {
        property: String,
        value: f64,
        reason: String,
    },

    #[error("invalid value {value} for {property}")]
    InvalidValue { property: String, value: f64 },

    #[error("camera capture is not supported on this platform")]
    Unsupported,

    #[error("camera device has been released")]
    Released,

    #[error("device reported an unusable frame rate: {0}")]
    InvalidFrameRate(f64),

    #[error("ffmpeg is not available: {0}")]
    FfmpegUnavailable(String),
}

/// Errors raised at the video file boundary.
#[derive(Debug, Error)]
pub enum FileError {
    #[error("failed to open {path} for writing: {reason}")]
    Open { path: PathBuf, reason: String },

    #[error("failed to write to {path}: {reason}")]
    Write { path: PathBuf, reason: String },

    #[error("frame shape {actual} does not match output shape {expected}")]
    ShapeMismatch { expected: Shape, actual: Shape },

    #[error("failed to finalize {path}: {reason}")]
    Finish { path: PathBuf, reason: String },

    #[error("ffmpeg is not available: {0}")]
    FfmpegUnavailable(String),
}

/// Operations invoked in a state that does not allow them.
///
/// Returned synchronously; the state of the component is unchanged.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum StateError {
    #[error("a recording is already in progress")]
    AlreadyRecording,

    #[error("the previous recording is still finishing")]
    StillFinishing,

    #[error("no recording is in progress")]
    NotRecording,

    #[error("no camera is connected")]
    NotConnected,

    #[error("cannot change this setting while recording")]
    BusyRecording,

    #[error("session timer was already started")]
    TimerAlreadyStarted,

    #[error("frame source has been stopped")]
    SourceStopped,

    #[error("queue already has a consumer")]
    ConsumerClaimed,

    #[error("queue is closed: end-of-stream was already enqueued")]
    QueueClosed,
}

/// Error type of the coordinator control surface.
#[derive(Debug, Error)]
pub enum RecordingError {
    #[error(transparent)]
    Device(#[from] DeviceError),

    #[error(transparent)]
    File(#[from] FileError),

    #[error(transparent)]
    State(#[from] StateError),

    #[error("invalid recording duration: {0} seconds")]
    InvalidDuration(f64),

    #[error("failed to spawn {name} thread: {source}")]
    Spawn {
        name: &'static str,
        #[source]
        source: std::io::Error,
    },
}
