//! Video encoding: drains a [`FrameQueue`](crate::queue::FrameQueue) into a file.
//!
//! The container and codec follow the output file extension:
//! - `.mp4`: MPEG-4 Part 2 (`mp4v`)
//! - `.avi`: MPEG-4 Part 2 tagged as Xvid
//! - anything else: rewritten to `.avi` with the Xvid codec
//!
//! The [`Encoder`] itself is agnostic of how bytes reach the disk; that is the
//! job of a [`WriterFactory`]. [`FfmpegWriterFactory`] is the real one,
//! [`MemoryWriterFactory`] keeps frames in memory for tests.

mod ffmpeg;
mod memory;

pub use ffmpeg::FfmpegWriterFactory;
pub use memory::{MemoryRecording, MemoryWriterFactory};

use crate::error::FileError;
use crate::frame::Frame;
use crate::queue::{QueueConsumer, QueueItem};
use camrec_common::{Shape, VideoCodec};
use chrono::Local;
use serde::Serialize;
use std::path::{Path, PathBuf};
use tracing::{debug, error, info, warn};

/// Everything a writer needs to open its output.
#[derive(Debug, Clone, PartialEq)]
pub struct OutputTarget {
    pub path: PathBuf,
    pub codec: VideoCodec,
    /// The source's device-reported frame rate
    pub frame_rate: f64,
    pub shape: Shape,
}

/// An output path after the extension policy has been applied.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedOutput {
    pub path: PathBuf,
    pub codec: VideoCodec,
    /// True when the requested extension had no codec and `.avi` was substituted
    pub fell_back: bool,
}

/// Choose the codec for `requested` and rewrite unknown extensions to `.avi`.
pub fn resolve_output_path(requested: &Path) -> ResolvedOutput {
    let ext = requested
        .extension()
        .and_then(|e| e.to_str())
        .unwrap_or_default();

    match VideoCodec::for_extension(ext) {
        Some(codec) => ResolvedOutput {
            path: requested.to_path_buf(),
            codec,
            fell_back: false,
        },
        None => {
            let fallback = VideoCodec::Xvid;
            let path = requested.with_extension(fallback.extension());
            warn!(
                "No codec for extension {:?}, writing {} with {} instead",
                ext,
                path.display(),
                fallback
            );
            ResolvedOutput {
                path,
                codec: fallback,
                fell_back: true,
            }
        }
    }
}

/// Generate a timestamped output filename inside `dir`.
pub fn generate_output_path(dir: &Path) -> PathBuf {
    let timestamp = Local::now().format("%Y-%m-%d_%H%M%S");
    dir.join(format!("recording_{}.mp4", timestamp))
}

/// Sink for the frames of one recording.
pub trait VideoWriter: Send {
    /// Append one frame. The frame has already been checked against the open shape.
    fn write_frame(&mut self, frame: &Frame) -> Result<(), FileError>;

    /// Flush and close the output.
    fn finish(self: Box<Self>) -> Result<(), FileError>;
}

/// Opens [`VideoWriter`]s. Opening must fail if the output cannot be created.
pub trait WriterFactory: Send + Sync {
    fn open(&self, target: &OutputTarget) -> Result<Box<dyn VideoWriter>, FileError>;
}

/// Final accounting of one encoder run.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EncoderReport {
    pub path: PathBuf,
    pub codec: VideoCodec,
    pub frames_written: u64,
    /// Frames whose shape did not match the open shape
    pub frames_rejected: u64,
    /// Frames drained without writing after a write error
    pub frames_dropped: u64,
    /// First write or finalize error, if any
    pub error: Option<String>,
}

impl EncoderReport {
    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }
}

/// Lifecycle notifications from [`Encoder::run`].
#[derive(Debug, Clone)]
pub enum EncoderEvent {
    Started { path: PathBuf },
    Stopped(EncoderReport),
}

type EncoderObserver = Box<dyn FnMut(EncoderEvent) + Send>;

/// Drains a queue into an open writer until the end-of-stream marker.
pub struct Encoder {
    target: OutputTarget,
    consumer: QueueConsumer,
    writer: Box<dyn VideoWriter>,
    observer: Option<EncoderObserver>,
}

impl Encoder {
    /// Open the output. Fails here, before any frame is consumed, if the
    /// output cannot be created.
    pub fn new(
        target: OutputTarget,
        consumer: QueueConsumer,
        factory: &dyn WriterFactory,
    ) -> Result<Self, FileError> {
        let writer = factory.open(&target)?;
        debug!(
            path = %target.path.display(),
            codec = %target.codec,
            shape = %target.shape,
            fps = target.frame_rate,
            "Encoder opened output"
        );
        Ok(Self {
            target,
            consumer,
            writer,
            observer: None,
        })
    }

    /// Receive [`EncoderEvent`]s on the encoder thread.
    pub fn with_observer<F>(mut self, observer: F) -> Self
    where
        F: FnMut(EncoderEvent) + Send + 'static,
    {
        self.observer = Some(Box::new(observer));
        self
    }

    pub fn target(&self) -> &OutputTarget {
        &self.target
    }

    fn emit(&mut self, event: EncoderEvent) {
        if let Some(observer) = self.observer.as_mut() {
            observer(event);
        }
    }

    /// Write frames until the end-of-stream marker, then close the file.
    ///
    /// Only the marker ends the loop. After a write error the remaining frames
    /// are drained and dropped so producers are never left blocked.
    pub fn run(mut self) -> EncoderReport {
        let path = self.target.path.clone();
        self.emit(EncoderEvent::Started { path: path.clone() });
        info!("Encoding to {}", path.display());

        let mut report = EncoderReport {
            path,
            codec: self.target.codec,
            frames_written: 0,
            frames_rejected: 0,
            frames_dropped: 0,
            error: None,
        };

        loop {
            let frame = match self.consumer.pop() {
                QueueItem::Frame(frame) => frame,
                QueueItem::EndOfStream => break,
            };

            if report.error.is_some() {
                report.frames_dropped += 1;
                continue;
            }

            if frame.shape() != self.target.shape {
                report.frames_rejected += 1;
                warn!(
                    "{}",
                    FileError::ShapeMismatch {
                        expected: self.target.shape,
                        actual: frame.shape(),
                    }
                );
                continue;
            }

            match self.writer.write_frame(&frame) {
                Ok(()) => report.frames_written += 1,
                Err(e) => {
                    error!("Write failed, draining remaining frames: {}", e);
                    report.error = Some(e.to_string());
                }
            }
        }

        let Encoder {
            writer,
            mut observer,
            ..
        } = self;
        if let Err(e) = writer.finish() {
            error!("Failed to finalize output: {}", e);
            report.error.get_or_insert_with(|| e.to_string());
        }

        info!(
            path = %report.path.display(),
            written = report.frames_written,
            rejected = report.frames_rejected,
            dropped = report.frames_dropped,
            "Encoder stopped"
        );

        if let Some(observer) = observer.as_mut() {
            observer(EncoderEvent::Stopped(report.clone()));
        }
        report
    }
}
