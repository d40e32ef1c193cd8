//! Grayscale frames produced by a [`FrameSource`](crate::capture::FrameSource).

use crate::capture::{PixelFormat, RawFrame};
use camrec_common::Shape;
use ndarray::{Array2, ArrayView2};
use std::sync::Arc;
use std::time::Instant;

/// One captured 8-bit grayscale image.
///
/// Frames are immutable once produced. Cloning shares the pixel buffer, so
/// every subscriber of a source sees the same allocation.
#[derive(Debug, Clone)]
pub struct Frame {
    pixels: Arc<Array2<u8>>,
    sequence: u64,
    captured_at: Instant,
}

impl Frame {
    /// Wrap a `(height, width)` pixel array.
    pub fn new(pixels: Array2<u8>, sequence: u64, captured_at: Instant) -> Self {
        Self {
            pixels: Arc::new(pixels),
            sequence,
            captured_at,
        }
    }

    pub fn shape(&self) -> Shape {
        let (rows, cols) = self.pixels.dim();
        Shape::new(cols as u32, rows as u32)
    }

    pub fn width(&self) -> u32 {
        self.pixels.ncols() as u32
    }

    pub fn height(&self) -> u32 {
        self.pixels.nrows() as u32
    }

    pub fn pixels(&self) -> ArrayView2<'_, u8> {
        self.pixels.view()
    }

    /// Row-major pixel bytes, `width * height` long.
    pub fn as_bytes(&self) -> Option<&[u8]> {
        self.pixels.as_slice()
    }

    /// Per-source sequence number, increasing by one for every published frame.
    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    pub fn captured_at(&self) -> Instant {
        self.captured_at
    }

    /// Whether two frames share the same pixel allocation.
    pub fn shares_pixels(&self, other: &Frame) -> bool {
        Arc::ptr_eq(&self.pixels, &other.pixels)
    }
}

/// BT.601 luma in 8.8 fixed point.
#[inline]
fn luma(r: u8, g: u8, b: u8) -> u8 {
    ((77 * r as u32 + 150 * g as u32 + 29 * b as u32 + 128) >> 8) as u8
}

/// Convert a raw device buffer into a `(height, width)` grayscale array.
///
/// Returns `None` when the buffer is shorter than its declared geometry.
pub fn to_grayscale(raw: &RawFrame) -> Option<Array2<u8>> {
    let width = raw.width as usize;
    let height = raw.height as usize;
    if width == 0 || height == 0 {
        return None;
    }

    let channels = raw.format.bytes_per_pixel();
    let row_bytes = width * channels;
    if raw.stride < row_bytes {
        return None;
    }
    let needed = raw.stride * (height - 1) + row_bytes;
    if raw.data.len() < needed {
        return None;
    }

    let mut gray = Vec::with_capacity(width * height);
    for y in 0..height {
        let row = &raw.data[y * raw.stride..y * raw.stride + row_bytes];
        match raw.format {
            PixelFormat::Gray8 => gray.extend_from_slice(row),
            PixelFormat::Rgb24 => {
                gray.extend(row.chunks_exact(3).map(|px| luma(px[0], px[1], px[2])))
            }
            PixelFormat::Bgr24 => {
                gray.extend(row.chunks_exact(3).map(|px| luma(px[2], px[1], px[0])))
            }
        }
    }

    Array2::from_shape_vec((height, width), gray).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn raw(format: PixelFormat, width: u32, height: u32, stride: usize, data: Vec<u8>) -> RawFrame {
        RawFrame {
            width,
            height,
            stride,
            format,
            data,
        }
    }

    #[test]
    fn luma_of_primaries() {
        assert_eq!(luma(0, 0, 0), 0);
        assert_eq!(luma(255, 255, 255), 255);
        assert_eq!(luma(255, 0, 0), 77);
        assert_eq!(luma(0, 255, 0), 149);
        assert_eq!(luma(0, 0, 255), 29);
    }

    #[test]
    fn rgb_and_bgr_agree() {
        let rgb = raw(PixelFormat::Rgb24, 2, 1, 6, vec![10, 20, 30, 200, 100, 50]);
        let bgr = raw(PixelFormat::Bgr24, 2, 1, 6, vec![30, 20, 10, 50, 100, 200]);
        assert_eq!(to_grayscale(&rgb), to_grayscale(&bgr));
    }

    #[test]
    fn stride_padding_is_skipped() {
        // 2x2 gray with two bytes of padding per row
        let data = vec![1, 2, 0xEE, 0xEE, 3, 4, 0xEE, 0xEE];
        let gray = to_grayscale(&raw(PixelFormat::Gray8, 2, 2, 4, data)).unwrap();
        assert_eq!(gray, ndarray::arr2(&[[1, 2], [3, 4]]));
    }

    #[test]
    fn last_row_may_omit_padding() {
        let data = vec![1, 2, 0, 3, 4];
        let gray = to_grayscale(&raw(PixelFormat::Gray8, 2, 2, 3, data)).unwrap();
        assert_eq!(gray.dim(), (2, 2));
    }

    #[test]
    fn short_buffer_is_rejected() {
        assert!(to_grayscale(&raw(PixelFormat::Rgb24, 2, 2, 6, vec![0; 11])).is_none());
        assert!(to_grayscale(&raw(PixelFormat::Gray8, 4, 1, 2, vec![0; 8])).is_none());
        assert!(to_grayscale(&raw(PixelFormat::Gray8, 0, 1, 0, vec![])).is_none());
    }

    #[test]
    fn frame_shape_is_width_by_height() {
        let frame = Frame::new(Array2::zeros((480, 640)), 7, Instant::now());
        assert_eq!(frame.shape(), Shape::new(640, 480));
        assert_eq!(frame.as_bytes().map(|b| b.len()), Some(640 * 480));
        assert_eq!(frame.sequence(), 7);

        let shared = frame.clone();
        assert!(shared.shares_pixels(&frame));
    }
}
