//! In-process frame generator.
//!
//! Each frame carries its device sequence number in the first eight pixels of
//! row 0 (little-endian), so a recording can be checked for gaps and duplicates
//! with [`sequence_of`].

use super::{CaptureBackend, CaptureDevice, DeviceProperty, PixelFormat, RawFrame};
use crate::error::DeviceError;
use crate::frame::Frame;
use camrec_common::CaptureConfig;
use std::thread;
use std::time::{Duration, Instant};

/// Backend producing paced synthetic frames.
#[derive(Debug, Clone, Default)]
pub struct SyntheticBackend {
    max_rate: Option<f64>,
    fail_every: Option<u64>,
}

impl SyntheticBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Cap the honoured frame rate, like a device that rounds requests down.
    pub fn with_max_rate(mut self, fps: f64) -> Self {
        self.max_rate = Some(fps);
        self
    }

    /// Fail every `n`th read.
    pub fn with_failure_every(mut self, n: u64) -> Self {
        self.fail_every = Some(n.max(1));
        self
    }

    fn honoured_rate(&self, requested: f64) -> f64 {
        match self.max_rate {
            Some(max) => requested.min(max),
            None => requested,
        }
    }
}

impl CaptureBackend for SyntheticBackend {
    fn open(&self, config: &CaptureConfig) -> Result<Box<dyn CaptureDevice>, DeviceError> {
        if config.shape.is_empty() {
            return Err(DeviceError::Open {
                index: config.device_index,
                reason: format!("unsupported frame size {}", config.shape),
            });
        }
        if !config.target_frame_rate.is_finite() || config.target_frame_rate <= 0.0 {
            return Err(DeviceError::InvalidFrameRate(config.target_frame_rate));
        }

        Ok(Box::new(SyntheticDevice {
            backend: self.clone(),
            index: config.device_index,
            width: config.shape.width,
            height: config.shape.height,
            fps: self.honoured_rate(config.target_frame_rate),
            gamma: config.gamma,
            brightness: config.brightness,
            sequence: 0,
            reads: 0,
            next_due: None,
            released: false,
        }))
    }

    fn name(&self) -> &'static str {
        "synthetic"
    }
}

/// Device half of [`SyntheticBackend`].
pub struct SyntheticDevice {
    backend: SyntheticBackend,
    index: u32,
    width: u32,
    height: u32,
    fps: f64,
    gamma: f64,
    brightness: f64,
    sequence: u64,
    reads: u64,
    next_due: Option<Instant>,
    released: bool,
}

impl SyntheticDevice {
    fn interval(&self) -> Duration {
        Duration::from_secs_f64(1.0 / self.fps)
    }

    /// Sleep until the next frame is due.
    fn pace(&mut self) {
        let now = Instant::now();
        let due = self.next_due.unwrap_or(now);
        if due > now {
            thread::sleep(due - now);
        }
        // Do not accumulate a backlog after a stall.
        let floor = Instant::now().checked_sub(self.interval()).unwrap_or(due);
        let base = due.max(floor);
        self.next_due = Some(base + self.interval());
    }

    fn render(&self) -> Vec<u8> {
        let width = self.width as usize;
        let height = self.height as usize;
        let tag = self.sequence.to_le_bytes();
        let mut data = Vec::with_capacity(width * height * 3);
        for y in 0..height {
            for x in 0..width {
                let value = if y == 0 && x < tag.len() {
                    tag[x]
                } else {
                    ((x + y) as u64 + self.sequence) as u8
                };
                data.extend_from_slice(&[value, value, value]);
            }
        }
        data
    }
}

impl CaptureDevice for SyntheticDevice {
    fn read_frame(&mut self) -> Result<RawFrame, DeviceError> {
        if self.released {
            return Err(DeviceError::Released);
        }

        self.pace();
        self.reads += 1;
        if let Some(n) = self.backend.fail_every {
            if self.reads % n == 0 {
                return Err(DeviceError::Read(format!("injected failure on read {}", self.reads)));
            }
        }

        let frame = RawFrame::packed(self.width, self.height, PixelFormat::Rgb24, self.render());
        self.sequence += 1;
        Ok(frame)
    }

    fn get(&self, property: DeviceProperty) -> Result<f64, DeviceError> {
        Ok(match property {
            DeviceProperty::Gamma => self.gamma,
            DeviceProperty::Brightness => self.brightness,
            DeviceProperty::FrameWidth => self.width as f64,
            DeviceProperty::FrameHeight => self.height as f64,
            DeviceProperty::FrameRate => self.fps,
        })
    }

    fn set(&mut self, property: DeviceProperty, value: f64) -> Result<(), DeviceError> {
        if self.released {
            return Err(DeviceError::Released);
        }
        match property {
            DeviceProperty::Gamma => self.gamma = value,
            DeviceProperty::Brightness => self.brightness = value,
            DeviceProperty::FrameWidth => self.width = value as u32,
            DeviceProperty::FrameHeight => self.height = value as u32,
            DeviceProperty::FrameRate => {
                self.fps = self.backend.honoured_rate(value);
                self.next_due = None;
            }
        }
        Ok(())
    }

    fn release(&mut self) {
        self.released = true;
    }

    fn description(&self) -> String {
        format!("synthetic camera {} ({}x{})", self.index, self.width, self.height)
    }
}

/// Recover the device sequence number stamped into a synthetic frame.
///
/// Frames narrower than eight pixels carry no tag.
pub fn sequence_of(frame: &Frame) -> Option<u64> {
    let pixels = frame.pixels();
    if pixels.ncols() < 8 || pixels.nrows() == 0 {
        return None;
    }
    let mut tag = [0u8; 8];
    for (x, byte) in tag.iter_mut().enumerate() {
        *byte = pixels[[0, x]];
    }
    Some(u64::from_le_bytes(tag))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::to_grayscale;
    use camrec_common::Shape;

    fn open(backend: &SyntheticBackend, fps: f64) -> Box<dyn CaptureDevice> {
        let config = CaptureConfig {
            target_frame_rate: fps,
            shape: Shape::new(16, 4),
            ..CaptureConfig::default()
        };
        backend.open(&config).unwrap()
    }

    #[test]
    fn frames_carry_their_sequence() {
        let mut device = open(&SyntheticBackend::new(), 1000.0);
        for expected in 0..3u64 {
            let raw = device.read_frame().unwrap();
            let frame = Frame::new(to_grayscale(&raw).unwrap(), 0, Instant::now());
            assert_eq!(sequence_of(&frame), Some(expected));
        }
    }

    #[test]
    fn reads_are_paced_to_frame_rate() {
        let mut device = open(&SyntheticBackend::new(), 50.0);
        let start = Instant::now();
        for _ in 0..6 {
            device.read_frame().unwrap();
        }
        // First read is immediate, the next five are 20 ms apart.
        assert!(start.elapsed() >= Duration::from_millis(90));
    }

    #[test]
    fn max_rate_caps_requested_rate() {
        let backend = SyntheticBackend::new().with_max_rate(24.0);
        let mut device = open(&backend, 30.0);
        assert_eq!(device.get(DeviceProperty::FrameRate).unwrap(), 24.0);

        device.set(DeviceProperty::FrameRate, 12.0).unwrap();
        assert_eq!(device.get(DeviceProperty::FrameRate).unwrap(), 12.0);
    }

    #[test]
    fn injected_failures_do_not_consume_sequence() {
        let backend = SyntheticBackend::new().with_failure_every(2);
        let mut device = open(&backend, 1000.0);

        let first = device.read_frame().unwrap();
        assert!(device.read_frame().is_err());
        let second = device.read_frame().unwrap();

        let seq = |raw: &RawFrame| {
            sequence_of(&Frame::new(to_grayscale(raw).unwrap(), 0, Instant::now()))
        };
        assert_eq!(seq(&first), Some(0));
        assert_eq!(seq(&second), Some(1));
    }

    #[test]
    fn released_device_refuses_reads() {
        let mut device = open(&SyntheticBackend::new(), 1000.0);
        device.release();
        assert!(matches!(device.read_frame(), Err(DeviceError::Released)));
    }
}
