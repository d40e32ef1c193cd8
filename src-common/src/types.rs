//! Shared types for capture and recording.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Pixel dimensions of a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Shape {
    /// Width in pixels
    pub width: u32,
    /// Height in pixels
    pub height: u32,
}

impl Shape {
    pub fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    /// Number of pixels in one single-channel frame of this shape.
    pub fn pixel_count(&self) -> usize {
        self.width as usize * self.height as usize
    }

    pub fn is_empty(&self) -> bool {
        self.width == 0 || self.height == 0
    }
}

impl fmt::Display for Shape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

/// Live capture parameters of a connected camera.
///
/// `actual_frame_rate` is what the device reports after the last rate change.
/// It may differ from `target_frame_rate` and is the value fixed-rate
/// consumers must be opened with.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CaptureConfig {
    /// Device index as understood by the capture backend
    pub device_index: u32,
    /// Requested frame rate (frames per second)
    pub target_frame_rate: f64,
    /// Frame rate reported by the device
    pub actual_frame_rate: f64,
    /// Gamma correction value
    pub gamma: f64,
    /// Brightness offset
    pub brightness: f64,
    /// Frame dimensions
    pub shape: Shape,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            device_index: 0,
            target_frame_rate: 30.0,
            actual_frame_rate: 30.0,
            gamma: 1.0,
            brightness: 0.0,
            shape: Shape::new(640, 480),
        }
    }
}

/// Video codec written into the output container.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VideoCodec {
    /// MPEG-4 Part 2 in an MP4 container (`mp4v`)
    Mpeg4,
    /// MPEG-4 Part 2 tagged as Xvid in an AVI container
    Xvid,
}

impl VideoCodec {
    /// Four-character code stored in the container.
    pub fn fourcc(&self) -> &'static str {
        match self {
            VideoCodec::Mpeg4 => "mp4v",
            VideoCodec::Xvid => "XVID",
        }
    }

    /// Canonical file extension for the container this codec is written into.
    pub fn extension(&self) -> &'static str {
        match self {
            VideoCodec::Mpeg4 => "mp4",
            VideoCodec::Xvid => "avi",
        }
    }

    /// Select the codec for a file extension (case-insensitive).
    ///
    /// Returns `None` for extensions without a dedicated codec; callers fall
    /// back to [`VideoCodec::Xvid`].
    pub fn for_extension(ext: &str) -> Option<Self> {
        match ext.to_lowercase().as_str() {
            "mp4" => Some(VideoCodec::Mpeg4),
            "avi" => Some(VideoCodec::Xvid),
            _ => None,
        }
    }
}

impl fmt::Display for VideoCodec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.fourcc())
    }
}

/// Recording state of the coordinator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecordingState {
    /// Not recording, ready to start
    Idle,
    /// Frames are flowing into the encoder queue
    Recording,
    /// End-of-stream has been queued, the encoder is draining and closing the file
    Finishing,
}

impl RecordingState {
    pub fn as_str(&self) -> &'static str {
        match self {
            RecordingState::Idle => "idle",
            RecordingState::Recording => "recording",
            RecordingState::Finishing => "finishing",
        }
    }
}

impl fmt::Display for RecordingState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a session timer stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StopReason {
    /// Elapsed time reached the target duration
    Deadline,
    /// Stopped on request before the deadline
    Manual,
}
