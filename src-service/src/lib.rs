//! Camera capture and bounded-duration recording.
//!
//! The pipeline, leaves first:
//! - [`FrameSource`]: capture loop over one [`CaptureDevice`], publishing grayscale [`Frame`]s
//! - [`FrameQueue`]: ordered hand-off to the encoder with an end-of-stream marker
//! - [`Encoder`]: drains the queue into a [`VideoWriter`] until the marker
//! - [`SessionTimer`]: wall-clock deadline with progress ticks
//! - [`RecordingCoordinator`]: the control surface tying them together

pub mod capture;
pub mod display;
pub mod encoder;
pub mod error;
pub mod ffmpeg;
pub mod frame;
pub mod queue;
pub mod state;
pub mod timer;

pub use capture::{
    CaptureBackend, CaptureDevice, DeviceProperty, FfmpegBackend, FrameSource, PixelFormat,
    RawFrame, SubscriptionId, SyntheticBackend,
};
pub use display::{save_png, LatestFrame};
pub use encoder::{
    resolve_output_path, Encoder, EncoderEvent, EncoderReport, FfmpegWriterFactory,
    MemoryWriterFactory, OutputTarget, ResolvedOutput, VideoWriter, WriterFactory,
};
pub use error::{DeviceError, FileError, RecordingError, StateError};
pub use frame::Frame;
pub use queue::{FrameQueue, QueueConsumer, QueueItem};
pub use state::{RecordingCoordinator, RecordingOptions, RecordingSession, SessionEvent};
pub use timer::{SessionTimer, TimerConfig, TimerEvent, TimerState};
