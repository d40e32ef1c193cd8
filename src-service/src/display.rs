//! Display-side sinks: keep the most recent frame and write it out as PNG.

use crate::error::FileError;
use crate::frame::Frame;
use image::GrayImage;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::warn;

/// Holds the most recent frame delivered by a frame subscription.
#[derive(Clone)]
pub struct LatestFrame {
    tx: Arc<watch::Sender<Option<Frame>>>,
}

impl Default for LatestFrame {
    fn default() -> Self {
        Self {
            tx: Arc::new(watch::Sender::new(None)),
        }
    }
}

impl LatestFrame {
    pub fn new() -> Self {
        Self::default()
    }

    /// Callback to register with `subscribe_frames`.
    pub fn callback(&self) -> impl Fn(&Frame) + Send + Sync + 'static {
        let tx = Arc::clone(&self.tx);
        move |frame| {
            tx.send_replace(Some(frame.clone()));
        }
    }

    pub fn latest(&self) -> Option<Frame> {
        self.tx.borrow().clone()
    }

    /// Wait for a frame newer than `after` (any frame if `None`).
    pub fn wait_for_frame(&self, after: Option<u64>, timeout: Duration) -> Option<Frame> {
        let mut rx = self.tx.subscribe();
        let runtime = match tokio::runtime::Builder::new_current_thread()
            .enable_time()
            .build()
        {
            Ok(runtime) => runtime,
            Err(e) => {
                warn!("Failed to create runtime for frame wait: {}", e);
                return None;
            }
        };

        runtime.block_on(async {
            let newer = rx.wait_for(|frame| {
                frame
                    .as_ref()
                    .is_some_and(|frame| after.map_or(true, |seq| frame.sequence() > seq))
            });
            match tokio::time::timeout(timeout, newer).await {
                Ok(Ok(frame)) => frame.clone(),
                _ => None,
            }
        })
    }
}

/// Copy a frame into an `image` buffer.
pub fn to_gray_image(frame: &Frame) -> GrayImage {
    let pixels: Vec<u8> = match frame.as_bytes() {
        Some(bytes) => bytes.to_vec(),
        None => frame.pixels().iter().copied().collect(),
    };
    // Dimensions come from the frame itself, so the buffer always fits.
    GrayImage::from_raw(frame.width(), frame.height(), pixels)
        .unwrap_or_else(|| GrayImage::new(frame.width(), frame.height()))
}

/// Save a frame as an 8-bit grayscale PNG.
pub fn save_png(frame: &Frame, path: &Path) -> Result<(), FileError> {
    to_gray_image(frame)
        .save_with_format(path, image::ImageFormat::Png)
        .map_err(|e| FileError::Write {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array2;
    use std::time::Instant;
    use tempfile::TempDir;

    fn frame(sequence: u64) -> Frame {
        let pixels = Array2::from_shape_fn((3, 4), |(y, x)| (y * 4 + x) as u8);
        Frame::new(pixels, sequence, Instant::now())
    }

    #[test]
    fn latest_frame_tracks_newest() {
        let latest = LatestFrame::new();
        assert!(latest.latest().is_none());

        let callback = latest.callback();
        callback(&frame(1));
        callback(&frame(2));
        assert_eq!(latest.latest().map(|f| f.sequence()), Some(2));
    }

    #[test]
    fn wait_for_frame_respects_after() {
        let latest = LatestFrame::new();
        latest.callback()(&frame(5));

        assert_eq!(
            latest
                .wait_for_frame(None, Duration::from_millis(10))
                .map(|f| f.sequence()),
            Some(5)
        );
        assert!(latest
            .wait_for_frame(Some(5), Duration::from_millis(20))
            .is_none());

        let producer = latest.clone();
        let handle = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            producer.callback()(&frame(6));
        });
        let next = latest.wait_for_frame(Some(5), Duration::from_secs(2));
        handle.join().unwrap();
        assert_eq!(next.map(|f| f.sequence()), Some(6));
    }

    #[test]
    fn png_round_trips_pixels() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("snap.png");
        save_png(&frame(0), &path).unwrap();

        let loaded = image::open(&path).unwrap().to_luma8();
        assert_eq!(loaded.dimensions(), (4, 3));
        assert_eq!(loaded.get_pixel(3, 2).0, [11]);
    }

    #[test]
    fn png_into_missing_directory_fails() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nope").join("snap.png");
        assert!(matches!(
            save_png(&frame(0), &path),
            Err(FileError::Write { .. })
        ));
    }
}
