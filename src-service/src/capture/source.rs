//! The capture loop: one device, one thread, synchronous fan-out to subscribers.

use super::{CaptureBackend, CaptureDevice, DeviceProperty};
use crate::error::{DeviceError, RecordingError, StateError};
use crate::frame::{to_grayscale, Frame};
use camrec_common::{CaptureConfig, Shape};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::thread::{self, JoinHandle, ThreadId};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Pause after a failed device read before trying again.
const READ_RETRY_BACKOFF: Duration = Duration::from_millis(50);

/// Handle returned by [`FrameSource::subscribe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

type FrameCallback = Arc<dyn Fn(&Frame) + Send + Sync>;

#[derive(Clone)]
struct Subscriber {
    id: SubscriptionId,
    callback: FrameCallback,
    /// Cleared by `unsubscribe` before it is removed from the list.
    active: Arc<AtomicBool>,
}

struct Shared {
    /// `None` once the device has been released.
    device: Mutex<Option<Box<dyn CaptureDevice>>>,
    config: RwLock<CaptureConfig>,
    subscribers: RwLock<Vec<Subscriber>>,
    /// Held by the capture thread for the whole of each delivery.
    delivery: Mutex<()>,
    capture_thread: Mutex<Option<ThreadId>>,
    next_subscription: AtomicU64,
    running: AtomicBool,
    stopped: AtomicBool,
    frames_captured: AtomicU64,
    read_failures: AtomicU64,
}

/// Owns an open camera device and publishes grayscale frames from it.
///
/// The capture loop runs on its own thread between [`start`](Self::start) and
/// [`stop`](Self::stop). Every device call, from the loop or from a parameter
/// setter, happens under the same lock.
pub struct FrameSource {
    shared: Arc<Shared>,
    thread: Mutex<Option<JoinHandle<()>>>,
    backend: &'static str,
}

impl FrameSource {
    /// Open the camera described by `requested` and read back what the device
    /// actually applied.
    pub fn open(backend: &dyn CaptureBackend, requested: &CaptureConfig) -> Result<Self, DeviceError> {
        let device = backend.open(requested)?;
        let config = read_back(device.as_ref(), requested)?;

        info!(
            backend = backend.name(),
            device = %device.description(),
            shape = %config.shape,
            target_fps = config.target_frame_rate,
            actual_fps = config.actual_frame_rate,
            "Camera opened"
        );

        Ok(Self {
            shared: Arc::new(Shared {
                device: Mutex::new(Some(device)),
                config: RwLock::new(config),
                subscribers: RwLock::new(Vec::new()),
                delivery: Mutex::new(()),
                capture_thread: Mutex::new(None),
                next_subscription: AtomicU64::new(1),
                running: AtomicBool::new(false),
                stopped: AtomicBool::new(false),
                frames_captured: AtomicU64::new(0),
                read_failures: AtomicU64::new(0),
            }),
            thread: Mutex::new(None),
            backend: backend.name(),
        })
    }

    /// Start the capture loop. No-op if it is already running.
    pub fn start(&self) -> Result<(), RecordingError> {
        let mut thread = self.thread.lock().unwrap_or_else(|e| e.into_inner());
        if self.shared.stopped.load(Ordering::Acquire) {
            return Err(StateError::SourceStopped.into());
        }
        if self.shared.running.load(Ordering::Acquire) {
            return Ok(());
        }

        self.shared.running.store(true, Ordering::Release);
        let shared = Arc::clone(&self.shared);
        let handle = thread::Builder::new()
            .name("camrec-capture".to_string())
            .spawn(move || capture_loop(shared))
            .map_err(|source| {
                self.shared.running.store(false, Ordering::Release);
                RecordingError::Spawn {
                    name: "capture",
                    source,
                }
            })?;
        *thread = Some(handle);

        debug!(backend = self.backend, "Capture loop started");
        Ok(())
    }

    /// Stop the capture loop and release the device.
    ///
    /// Returns once the loop has finished its current read, unless called from
    /// the capture thread itself (from a subscriber), in which case exit is only
    /// requested. Calling it again is a no-op.
    pub fn stop(&self) {
        if self.shared.stopped.swap(true, Ordering::AcqRel) {
            return;
        }
        self.shared.running.store(false, Ordering::Release);

        let handle = self
            .thread
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(handle) = handle {
            if handle.thread().id() == thread::current().id() {
                debug!("stop() called from the capture thread, not joining");
            } else if handle.join().is_err() {
                warn!("Capture thread panicked");
            }
        }

        let device = self
            .shared
            .device
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(mut device) = device {
            device.release();
        }

        info!(
            frames = self.frames_captured(),
            read_failures = self.shared.read_failures.load(Ordering::Relaxed),
            "Camera released"
        );
    }

    pub fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::Acquire)
    }

    pub fn is_stopped(&self) -> bool {
        self.shared.stopped.load(Ordering::Acquire)
    }

    /// Snapshot of the live capture parameters.
    pub fn config(&self) -> CaptureConfig {
        self.shared
            .config
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn actual_frame_rate(&self) -> f64 {
        self.config().actual_frame_rate
    }

    pub fn shape(&self) -> Shape {
        self.config().shape
    }

    /// Frames published since the source was opened.
    pub fn frames_captured(&self) -> u64 {
        self.shared.frames_captured.load(Ordering::Relaxed)
    }

    /// Device reads that failed or returned an unusable buffer.
    pub fn read_failures(&self) -> u64 {
        self.shared.read_failures.load(Ordering::Relaxed)
    }

    pub fn backend_name(&self) -> &'static str {
        self.backend
    }

    pub fn set_gamma(&self, gamma: f64) -> Result<f64, DeviceError> {
        if !gamma.is_finite() || gamma <= 0.0 {
            return Err(invalid(DeviceProperty::Gamma, gamma));
        }
        let config = self.reprogram(&[(DeviceProperty::Gamma, gamma)], |_| {})?;
        Ok(config.gamma)
    }

    pub fn set_brightness(&self, brightness: f64) -> Result<f64, DeviceError> {
        if !brightness.is_finite() {
            return Err(invalid(DeviceProperty::Brightness, brightness));
        }
        let config = self.reprogram(&[(DeviceProperty::Brightness, brightness)], |_| {})?;
        Ok(config.brightness)
    }

    /// Request a frame rate and return the rate the device actually reports.
    ///
    /// The reported rate is what fixed-rate consumers must be opened with.
    pub fn set_frame_rate(&self, fps: f64) -> Result<f64, DeviceError> {
        if !fps.is_finite() || fps <= 0.0 {
            return Err(invalid(DeviceProperty::FrameRate, fps));
        }
        let config = self.reprogram(&[(DeviceProperty::FrameRate, fps)], |config| {
            config.target_frame_rate = fps;
        })?;
        if config.actual_frame_rate != fps {
            info!(
                requested = fps,
                actual = config.actual_frame_rate,
                "Device adjusted frame rate"
            );
        }
        Ok(config.actual_frame_rate)
    }

    /// Request a frame size and return the size the device delivers.
    pub fn set_shape(&self, shape: Shape) -> Result<Shape, DeviceError> {
        if shape.is_empty() {
            return Err(invalid(DeviceProperty::FrameWidth, shape.width as f64));
        }
        let config = self.reprogram(
            &[
                (DeviceProperty::FrameWidth, shape.width as f64),
                (DeviceProperty::FrameHeight, shape.height as f64),
            ],
            |_| {},
        )?;
        Ok(config.shape)
    }

    /// Register a callback invoked on the capture thread for every frame.
    ///
    /// Callbacks must return quickly. They may subscribe, unsubscribe or stop
    /// the source; a callback added during a delivery sees the next frame.
    pub fn subscribe<F>(&self, callback: F) -> SubscriptionId
    where
        F: Fn(&Frame) + Send + Sync + 'static,
    {
        let id = SubscriptionId(self.shared.next_subscription.fetch_add(1, Ordering::Relaxed));
        self.shared
            .subscribers
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .push(Subscriber {
                id,
                callback: Arc::new(callback),
                active: Arc::new(AtomicBool::new(true)),
            });
        id
    }

    /// Remove a subscriber.
    ///
    /// Once this returns the callback is never invoked again. From another
    /// thread that means waiting for a delivery in progress; from the capture
    /// thread the current delivery skips it. Returns `false` for an unknown id.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let removed = {
            let mut subscribers = self
                .shared
                .subscribers
                .write()
                .unwrap_or_else(|e| e.into_inner());
            subscribers
                .iter()
                .position(|subscriber| subscriber.id == id)
                .map(|index| subscribers.remove(index))
        };
        let Some(removed) = removed else {
            return false;
        };
        removed.active.store(false, Ordering::Release);

        if !self.on_capture_thread() {
            drop(self.shared.delivery.lock().unwrap_or_else(|e| e.into_inner()));
        }
        true
    }

    fn on_capture_thread(&self) -> bool {
        *self
            .shared
            .capture_thread
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            == Some(thread::current().id())
    }

    pub fn subscriber_count(&self) -> usize {
        self.shared
            .subscribers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .len()
    }

    /// Apply property changes under the device lock, then refresh the config
    /// snapshot from what the device reports.
    fn reprogram(
        &self,
        values: &[(DeviceProperty, f64)],
        update: impl FnOnce(&mut CaptureConfig),
    ) -> Result<CaptureConfig, DeviceError> {
        let mut slot = self.shared.device.lock().unwrap_or_else(|e| e.into_inner());
        let device = slot.as_mut().ok_or(DeviceError::Released)?;
        device.set_many(values)?;

        let mut config = self.shared.config.write().unwrap_or_else(|e| e.into_inner());
        update(&mut config);
        let refreshed = read_back(device.as_ref(), &config)?;
        *config = refreshed.clone();

        debug!(
            shape = %refreshed.shape,
            actual_fps = refreshed.actual_frame_rate,
            gamma = refreshed.gamma,
            brightness = refreshed.brightness,
            "Capture parameters applied"
        );
        Ok(refreshed)
    }
}

impl Drop for FrameSource {
    fn drop(&mut self) {
        self.stop();
    }
}

fn invalid(property: DeviceProperty, value: f64) -> DeviceError {
    DeviceError::InvalidValue {
        property: property.to_string(),
        value,
    }
}

/// Build the live config from device-reported values.
fn read_back(device: &dyn CaptureDevice, base: &CaptureConfig) -> Result<CaptureConfig, DeviceError> {
    Ok(CaptureConfig {
        device_index: base.device_index,
        target_frame_rate: base.target_frame_rate,
        actual_frame_rate: device.get(DeviceProperty::FrameRate)?,
        gamma: device.get(DeviceProperty::Gamma)?,
        brightness: device.get(DeviceProperty::Brightness)?,
        shape: Shape::new(
            device.get(DeviceProperty::FrameWidth)? as u32,
            device.get(DeviceProperty::FrameHeight)? as u32,
        ),
    })
}

fn capture_loop(shared: Arc<Shared>) {
    *shared.capture_thread.lock().unwrap_or_else(|e| e.into_inner()) = Some(thread::current().id());
    let mut sequence = 0u64;

    while shared.running.load(Ordering::Acquire) {
        let result = {
            let mut slot = shared.device.lock().unwrap_or_else(|e| e.into_inner());
            match slot.as_mut() {
                Some(device) => device.read_frame(),
                None => break,
            }
        };

        let pixels = match result {
            Ok(raw) => match to_grayscale(&raw) {
                Some(pixels) => pixels,
                None => {
                    shared.read_failures.fetch_add(1, Ordering::Relaxed);
                    debug!(
                        width = raw.width,
                        height = raw.height,
                        stride = raw.stride,
                        len = raw.data.len(),
                        "Discarding malformed frame"
                    );
                    continue;
                }
            },
            Err(DeviceError::Released) => break,
            Err(e) => {
                let failures = shared.read_failures.fetch_add(1, Ordering::Relaxed) + 1;
                debug!(failures, "Frame read failed: {}", e);
                thread::sleep(READ_RETRY_BACKOFF);
                continue;
            }
        };

        if !shared.running.load(Ordering::Acquire) {
            break;
        }

        let frame = Frame::new(pixels, sequence, Instant::now());
        sequence += 1;
        shared.frames_captured.fetch_add(1, Ordering::Relaxed);

        // Callbacks may change the list, so deliver from a snapshot.
        let subscribers = shared
            .subscribers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone();
        let _delivering = shared.delivery.lock().unwrap_or_else(|e| e.into_inner());
        for subscriber in &subscribers {
            if subscriber.active.load(Ordering::Acquire) {
                (subscriber.callback)(&frame);
            }
        }
    }

    shared.running.store(false, Ordering::Release);
    debug!("Capture loop exited");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::SyntheticBackend;
    use std::sync::mpsc;

    fn config(fps: f64) -> CaptureConfig {
        CaptureConfig {
            target_frame_rate: fps,
            actual_frame_rate: fps,
            shape: Shape::new(32, 24),
            ..CaptureConfig::default()
        }
    }

    #[test]
    fn subscribers_receive_ordered_frames() {
        let source = FrameSource::open(&SyntheticBackend::new(), &config(200.0)).unwrap();
        let (tx, rx) = mpsc::channel();
        let tx = Mutex::new(tx);
        source.subscribe(move |frame| {
            let _ = tx.lock().unwrap().send(frame.sequence());
        });
        source.start().unwrap();

        let received: Vec<u64> = (0..5)
            .map(|_| rx.recv_timeout(Duration::from_secs(2)).unwrap())
            .collect();
        source.stop();

        assert_eq!(received, vec![0, 1, 2, 3, 4]);
        assert!(!source.is_running());
    }

    #[test]
    fn frames_have_configured_shape() {
        let source = FrameSource::open(&SyntheticBackend::new(), &config(200.0)).unwrap();
        let (tx, rx) = mpsc::channel();
        let tx = Mutex::new(tx);
        source.subscribe(move |frame| {
            let _ = tx.lock().unwrap().send(frame.shape());
        });
        source.start().unwrap();
        let shape = rx.recv_timeout(Duration::from_secs(2)).unwrap();
        source.stop();
        assert_eq!(shape, Shape::new(32, 24));
    }

    #[test]
    fn unsubscribe_stops_delivery() {
        let source = FrameSource::open(&SyntheticBackend::new(), &config(200.0)).unwrap();
        let count = Arc::new(AtomicU64::new(0));
        let counter = Arc::clone(&count);
        let id = source.subscribe(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        source.start().unwrap();
        thread::sleep(Duration::from_millis(100));

        assert!(source.unsubscribe(id));
        let after = count.load(Ordering::SeqCst);
        thread::sleep(Duration::from_millis(100));
        assert_eq!(count.load(Ordering::SeqCst), after);
        assert!(after > 0);
        assert!(!source.unsubscribe(id));
        source.stop();
    }

    #[test]
    fn stop_is_idempotent_and_start_after_stop_fails() {
        let source = FrameSource::open(&SyntheticBackend::new(), &config(100.0)).unwrap();
        source.start().unwrap();
        source.start().unwrap();
        source.stop();
        source.stop();

        assert!(source.is_stopped());
        assert!(matches!(
            source.start(),
            Err(RecordingError::State(StateError::SourceStopped))
        ));
        assert!(matches!(source.set_gamma(1.5), Err(DeviceError::Released)));
    }

    #[test]
    fn stop_from_subscriber_does_not_deadlock() {
        let source = Arc::new(FrameSource::open(&SyntheticBackend::new(), &config(200.0)).unwrap());
        let (tx, rx) = mpsc::channel();
        let tx = Mutex::new(tx);
        let weak = Arc::downgrade(&source);
        source.subscribe(move |_| {
            if let Some(source) = weak.upgrade() {
                source.stop();
            }
            let _ = tx.lock().unwrap().send(());
        });
        source.start().unwrap();

        rx.recv_timeout(Duration::from_secs(2)).unwrap();
        let deadline = Instant::now() + Duration::from_secs(2);
        while source.is_running() && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        assert!(!source.is_running());
        assert!(source.is_stopped());
    }

    #[test]
    fn subscriber_can_unsubscribe_another_mid_delivery() {
        let source = Arc::new(FrameSource::open(&SyntheticBackend::new(), &config(200.0)).unwrap());
        let later_count = Arc::new(AtomicU64::new(0));
        let (tx, rx) = mpsc::channel();
        let tx = Mutex::new(tx);

        let later_id = Arc::new(Mutex::new(None));
        let weak = Arc::downgrade(&source);
        let target = Arc::clone(&later_id);
        source.subscribe(move |_| {
            let id = target.lock().unwrap().take();
            if let (Some(id), Some(source)) = (id, weak.upgrade()) {
                let removed = source.unsubscribe(id);
                let _ = tx.lock().unwrap().send(removed);
            }
        });
        let counter = Arc::clone(&later_count);
        *later_id.lock().unwrap() = Some(source.subscribe(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        }));
        source.start().unwrap();

        assert!(rx.recv_timeout(Duration::from_secs(2)).unwrap());
        thread::sleep(Duration::from_millis(50));
        source.stop();

        // Removed during the very first delivery, before its turn came.
        assert_eq!(later_count.load(Ordering::SeqCst), 0);
        assert_eq!(source.subscriber_count(), 1);
    }

    #[test]
    fn set_frame_rate_reports_device_rate() {
        let backend = SyntheticBackend::new().with_max_rate(25.0);
        let source = FrameSource::open(&backend, &config(30.0)).unwrap();
        assert_eq!(source.actual_frame_rate(), 25.0);

        assert_eq!(source.set_frame_rate(60.0).unwrap(), 25.0);
        assert_eq!(source.set_frame_rate(10.0).unwrap(), 10.0);

        let config = source.config();
        assert_eq!(config.target_frame_rate, 10.0);
        assert_eq!(config.actual_frame_rate, 10.0);
    }

    #[test]
    fn setters_validate_and_apply() {
        let source = FrameSource::open(&SyntheticBackend::new(), &config(30.0)).unwrap();
        assert_eq!(source.set_gamma(2.2).unwrap(), 2.2);
        assert_eq!(source.set_brightness(-10.0).unwrap(), -10.0);
        assert_eq!(source.set_shape(Shape::new(16, 8)).unwrap(), Shape::new(16, 8));
        assert_eq!(source.shape(), Shape::new(16, 8));

        assert!(matches!(
            source.set_gamma(0.0),
            Err(DeviceError::InvalidValue { .. })
        ));
        assert!(matches!(
            source.set_frame_rate(f64::NAN),
            Err(DeviceError::InvalidValue { .. })
        ));
        assert!(source.set_shape(Shape::new(0, 8)).is_err());
    }

    #[test]
    fn read_failures_are_skipped() {
        let backend = SyntheticBackend::new().with_failure_every(3);
        let source = FrameSource::open(&backend, &config(500.0)).unwrap();
        let (tx, rx) = mpsc::channel();
        let tx = Mutex::new(tx);
        source.subscribe(move |frame| {
            let _ = tx.lock().unwrap().send(frame.sequence());
        });
        source.start().unwrap();

        let received: Vec<u64> = (0..4)
            .map(|_| rx.recv_timeout(Duration::from_secs(2)).unwrap())
            .collect();
        source.stop();

        assert_eq!(received, vec![0, 1, 2, 3]);
        assert!(source.read_failures() >= 1);
    }
}
