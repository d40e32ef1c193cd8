//! Camera capture for camrec.
//!
//! This module defines the device boundary ([`CaptureDevice`], [`CaptureBackend`]) and
//! the [`FrameSource`] that runs the capture loop on top of it. Backends:
//! - [`FfmpegBackend`]: the platform camera read through an ffmpeg child process
//! - [`SyntheticBackend`]: an in-process generator of numbered frames

pub mod ffmpeg;
pub mod source;
pub mod synthetic;
pub mod types;

pub use ffmpeg::FfmpegBackend;
pub use source::{FrameSource, SubscriptionId};
pub use synthetic::SyntheticBackend;
pub use types::{DeviceProperty, PixelFormat, RawFrame};

use crate::error::DeviceError;
use camrec_common::CaptureConfig;
use std::sync::Arc;

/// An open camera device.
///
/// All calls on one device are serialized by the owner; implementations do not
/// need internal locking.
pub trait CaptureDevice: Send {
    /// Block until the next frame is available and return it.
    fn read_frame(&mut self) -> Result<RawFrame, DeviceError>;

    /// Read a numeric property as currently reported by the device.
    fn get(&self, property: DeviceProperty) -> Result<f64, DeviceError>;

    /// Program a numeric property. The device may round or clamp the value;
    /// read it back with [`get`](Self::get).
    fn set(&mut self, property: DeviceProperty, value: f64) -> Result<(), DeviceError>;

    /// Program several properties as one change.
    fn set_many(&mut self, values: &[(DeviceProperty, f64)]) -> Result<(), DeviceError> {
        for &(property, value) in values {
            self.set(property, value)?;
        }
        Ok(())
    }

    /// Release the underlying device. Further reads fail with [`DeviceError::Released`].
    fn release(&mut self);

    /// Human-readable description for logs.
    fn description(&self) -> String;
}

/// Opens camera devices by index.
pub trait CaptureBackend: Send + Sync {
    /// Open the device and apply the requested parameters.
    fn open(&self, config: &CaptureConfig) -> Result<Box<dyn CaptureDevice>, DeviceError>;

    /// Short backend name for logs and `probe` output.
    fn name(&self) -> &'static str;
}

/// Get the platform camera backend.
pub fn get_backend() -> Arc<dyn CaptureBackend> {
    Arc::new(FfmpegBackend::new())
}
