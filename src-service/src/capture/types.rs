//! Raw device-side frame and property types.

use std::fmt;

/// Pixel layout of a buffer returned by a [`CaptureDevice`](super::CaptureDevice).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PixelFormat {
    /// One byte per pixel
    Gray8,
    /// Packed red, green, blue
    Rgb24,
    /// Packed blue, green, red
    Bgr24,
}

impl PixelFormat {
    pub fn bytes_per_pixel(&self) -> usize {
        match self {
            PixelFormat::Gray8 => 1,
            PixelFormat::Rgb24 | PixelFormat::Bgr24 => 3,
        }
    }
}

/// One frame as read from the device, before grayscale conversion.
#[derive(Debug, Clone)]
pub struct RawFrame {
    pub width: u32,
    pub height: u32,
    /// Bytes from the start of one row to the start of the next
    pub stride: usize,
    pub format: PixelFormat,
    pub data: Vec<u8>,
}

impl RawFrame {
    /// A tightly packed frame (`stride == width * bytes_per_pixel`).
    pub fn packed(width: u32, height: u32, format: PixelFormat, data: Vec<u8>) -> Self {
        Self {
            width,
            height,
            stride: width as usize * format.bytes_per_pixel(),
            format,
            data,
        }
    }
}

/// Numeric device properties exposed to the control surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeviceProperty {
    Gamma,
    Brightness,
    FrameWidth,
    FrameHeight,
    FrameRate,
}

impl DeviceProperty {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeviceProperty::Gamma => "gamma",
            DeviceProperty::Brightness => "brightness",
            DeviceProperty::FrameWidth => "frame width",
            DeviceProperty::FrameHeight => "frame height",
            DeviceProperty::FrameRate => "frame rate",
        }
    }
}

impl fmt::Display for DeviceProperty {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
