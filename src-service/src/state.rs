//! Recording state management for camrec.
//!
//! This module manages the recording lifecycle, including:
//! - The connected camera and its live parameters
//! - Recording state (idle, recording, finishing)
//! - Wiring frames into the encoder queue while a session is active
//! - The two-phase stop: detach the feeder, then queue end-of-stream
//! - Event broadcasting to subscribed clients

use crate::capture::{CaptureBackend, FrameSource, SubscriptionId};
use crate::encoder::{
    resolve_output_path, Encoder, EncoderEvent, EncoderReport, OutputTarget, WriterFactory,
};
use crate::error::{DeviceError, RecordingError, StateError};
use crate::frame::Frame;
use crate::queue::FrameQueue;
use crate::timer::{SessionTimer, TimerConfig, TimerEvent};
use camrec_common::config::RecordingDefaults;
use camrec_common::{CaptureConfig, RecordingState, Shape, StopReason, VideoCodec};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, RwLock, RwLockWriteGuard};
use std::thread;
use std::time::{Duration, Instant};
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

/// Capacity of the event broadcast channel.
const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Per-session pipeline settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RecordingOptions {
    /// Encoder queue capacity in frames; `None` is unbounded
    pub queue_capacity: Option<usize>,
    pub timer: TimerConfig,
}

impl RecordingOptions {
    pub fn from_defaults(defaults: &RecordingDefaults) -> Self {
        Self {
            queue_capacity: defaults.queue_capacity,
            timer: TimerConfig::new(
                Duration::from_millis(defaults.timer_tick_ms),
                defaults.progress_every_ticks,
            ),
        }
    }
}

/// Description of a started recording.
#[derive(Debug, Clone, PartialEq)]
pub struct RecordingSession {
    pub id: u64,
    /// Output path after the extension policy was applied
    pub path: PathBuf,
    pub codec: VideoCodec,
    /// True when the requested extension was replaced with `.avi`
    pub path_fell_back: bool,
    pub duration: Duration,
    pub started_at: Instant,
    /// Device-reported rate the encoder was opened with
    pub frame_rate: f64,
    pub shape: Shape,
}

/// Events broadcast to subscribed clients.
#[derive(Debug, Clone)]
pub enum SessionEvent {
    /// Recording state changed
    StateChanged(RecordingState),
    /// A session was started
    RecordingStarted(RecordingSession),
    /// Periodic elapsed-time update from the session timer
    Progress {
        session_id: u64,
        elapsed: Duration,
        duration: Duration,
    },
    /// The encoder thread began draining the queue
    EncoderStarted { session_id: u64 },
    /// The session timer stopped (deadline or manual)
    TimerStopped {
        session_id: u64,
        reason: StopReason,
        elapsed: Duration,
    },
    /// The output file is closed and the coordinator is idle again
    RecordingStopped {
        session_id: u64,
        report: EncoderReport,
        frames_enqueued: u64,
    },
}

struct ActiveSession {
    info: RecordingSession,
    queue: Arc<FrameQueue>,
    source: Arc<FrameSource>,
    /// Present until `finish` detaches the feeder.
    feeder: Option<SubscriptionId>,
    timer: Arc<SessionTimer>,
    frames_enqueued: Arc<AtomicU64>,
}

struct SessionSlot {
    state: RecordingState,
    active: Option<ActiveSession>,
}

struct Inner {
    backend: Arc<dyn CaptureBackend>,
    writers: Arc<dyn WriterFactory>,
    options: RecordingOptions,
    source: RwLock<Option<Arc<FrameSource>>>,
    slot: Mutex<SessionSlot>,
    idle: Condvar,
    event_tx: broadcast::Sender<SessionEvent>,
    next_session: AtomicU64,
}

/// Control surface for one camera and one recording at a time.
///
/// Every method may be called from any thread. None of them waits for a
/// recording to finish; use [`wait_until_idle`](Self::wait_until_idle) or the
/// [`SessionEvent::RecordingStopped`] event for that.
pub struct RecordingCoordinator {
    inner: Arc<Inner>,
}

impl RecordingCoordinator {
    pub fn new(
        backend: Arc<dyn CaptureBackend>,
        writers: Arc<dyn WriterFactory>,
        options: RecordingOptions,
    ) -> Self {
        let (event_tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            inner: Arc::new(Inner {
                backend,
                writers,
                options,
                source: RwLock::new(None),
                slot: Mutex::new(SessionSlot {
                    state: RecordingState::Idle,
                    active: None,
                }),
                idle: Condvar::new(),
                event_tx,
                next_session: AtomicU64::new(1),
            }),
        }
    }

    /// Subscribe to session events.
    pub fn subscribe_events(&self) -> broadcast::Receiver<SessionEvent> {
        self.inner.event_tx.subscribe()
    }

    /// Get the current recording state.
    pub fn state(&self) -> RecordingState {
        self.inner.lock_slot().state
    }

    /// Elapsed time of the active session, zero when idle.
    pub fn elapsed(&self) -> Duration {
        self.inner
            .lock_slot()
            .active
            .as_ref()
            .map(|active| active.timer.elapsed())
            .unwrap_or_default()
    }

    pub fn current_session(&self) -> Option<RecordingSession> {
        self.inner
            .lock_slot()
            .active
            .as_ref()
            .map(|active| active.info.clone())
    }

    /// Open (or reopen) the camera and start its capture loop.
    ///
    /// Only allowed while idle. The previous source, if any, is stopped and
    /// its device released before the new one is opened.
    pub fn connect(&self, config: &CaptureConfig) -> Result<CaptureConfig, RecordingError> {
        let previous = {
            let slot = self.inner.lock_slot();
            self.inner.require_idle(&slot)?;
            self.inner.source_mut().take()
        };
        if let Some(previous) = previous {
            debug!("Releasing previous camera before reconnect");
            previous.stop();
        }

        let source = Arc::new(FrameSource::open(self.inner.backend.as_ref(), config)?);
        source.start()?;
        let effective = source.config();

        let replaced = self.inner.source_mut().replace(source);
        if let Some(replaced) = replaced {
            replaced.stop();
        }
        info!(
            device = effective.device_index,
            shape = %effective.shape,
            fps = effective.actual_frame_rate,
            "Camera connected"
        );
        Ok(effective)
    }

    /// Stop the capture loop and release the camera. Only allowed while idle.
    pub fn disconnect(&self) -> Result<(), RecordingError> {
        let source = {
            let slot = self.inner.lock_slot();
            self.inner.require_idle(&slot)?;
            self.inner.source_mut().take()
        };
        if let Some(source) = source {
            source.stop();
            info!("Camera disconnected");
        }
        Ok(())
    }

    pub fn is_connected(&self) -> bool {
        self.inner.current_source().is_some()
    }

    /// The connected source, if any.
    pub fn source(&self) -> Option<Arc<FrameSource>> {
        self.inner.current_source()
    }

    /// Live capture parameters of the connected camera.
    pub fn config(&self) -> Option<CaptureConfig> {
        self.inner.current_source().map(|s| s.config())
    }

    /// Device-reported frame rate of the connected camera.
    pub fn actual_frame_rate(&self) -> Option<f64> {
        self.inner.current_source().map(|s| s.actual_frame_rate())
    }

    pub fn set_gamma(&self, gamma: f64) -> Result<f64, RecordingError> {
        Ok(self.inner.connected_source()?.set_gamma(gamma)?)
    }

    pub fn set_brightness(&self, brightness: f64) -> Result<f64, RecordingError> {
        Ok(self.inner.connected_source()?.set_brightness(brightness)?)
    }

    /// Request a frame rate and return the device-reported rate.
    ///
    /// A running session keeps the rate its encoder was opened with.
    pub fn set_frame_rate(&self, fps: f64) -> Result<f64, RecordingError> {
        let source = self.inner.connected_source()?;
        if self.state() != RecordingState::Idle {
            warn!("Frame rate changed during a recording; the file keeps its original rate");
        }
        Ok(source.set_frame_rate(fps)?)
    }

    /// Change the frame size. Rejected while a session is active, since the
    /// encoder's shape is fixed at start.
    pub fn set_shape(&self, shape: Shape) -> Result<Shape, RecordingError> {
        let slot = self.inner.lock_slot();
        if slot.state != RecordingState::Idle {
            return Err(StateError::BusyRecording.into());
        }
        let source = self.inner.connected_source()?;
        let applied = source.set_shape(shape)?;
        drop(slot);
        Ok(applied)
    }

    /// Receive every captured frame on the capture thread (display sink).
    pub fn subscribe_frames<F>(&self, callback: F) -> Result<SubscriptionId, RecordingError>
    where
        F: Fn(&Frame) + Send + Sync + 'static,
    {
        Ok(self.inner.connected_source()?.subscribe(callback))
    }

    pub fn unsubscribe_frames(&self, id: SubscriptionId) -> bool {
        self.inner
            .current_source()
            .map(|s| s.unsubscribe(id))
            .unwrap_or(false)
    }

    /// Start recording to `path` for `duration_secs` seconds.
    ///
    /// Returns the resolved output path (unknown extensions become `.avi`).
    /// On error nothing is left running and the state is unchanged.
    pub fn start_recording(
        &self,
        path: impl AsRef<Path>,
        duration_secs: f64,
    ) -> Result<PathBuf, RecordingError> {
        if !duration_secs.is_finite() || duration_secs <= 0.0 {
            return Err(RecordingError::InvalidDuration(duration_secs));
        }
        let duration = Duration::from_secs_f64(duration_secs);

        let mut slot = self.inner.lock_slot();
        match slot.state {
            RecordingState::Idle => {}
            RecordingState::Recording => return Err(StateError::AlreadyRecording.into()),
            RecordingState::Finishing => return Err(StateError::StillFinishing.into()),
        }

        let source = self.inner.connected_source()?;
        let config = source.config();
        let frame_rate = config.actual_frame_rate;
        if !frame_rate.is_finite() || frame_rate <= 0.0 {
            return Err(DeviceError::InvalidFrameRate(frame_rate).into());
        }

        let resolved = resolve_output_path(path.as_ref());
        let target = OutputTarget {
            path: resolved.path.clone(),
            codec: resolved.codec,
            frame_rate,
            shape: config.shape,
        };

        let queue = FrameQueue::new(self.inner.options.queue_capacity);
        let session_id = self.inner.next_session.fetch_add(1, Ordering::Relaxed);

        // Fails fast if the output cannot be opened.
        let weak = Arc::downgrade(&self.inner);
        let encoder = Encoder::new(target, queue.consumer()?, self.inner.writers.as_ref())?
            .with_observer(move |event| {
                if let Some(inner) = weak.upgrade() {
                    inner.on_encoder_event(session_id, event);
                }
            });

        thread::Builder::new()
            .name("camrec-encoder".to_string())
            .spawn(move || {
                encoder.run();
            })
            .map_err(|source| RecordingError::Spawn {
                name: "encoder",
                source,
            })?;

        let timer = Arc::new(SessionTimer::new(self.inner.options.timer));
        let weak = Arc::downgrade(&self.inner);
        if let Err(e) = timer.start(duration, move |event| {
            if let Some(inner) = weak.upgrade() {
                inner.on_timer_event(session_id, duration, event);
            }
        }) {
            // Let the encoder close the empty file and exit.
            queue.close();
            return Err(e);
        }

        let frames_enqueued = Arc::new(AtomicU64::new(0));
        let feeder = {
            let queue = Arc::clone(&queue);
            let counter = Arc::clone(&frames_enqueued);
            source.subscribe(move |frame| {
                if queue.push_frame(frame.clone()).is_ok() {
                    counter.fetch_add(1, Ordering::Relaxed);
                }
            })
        };

        let info = RecordingSession {
            id: session_id,
            path: resolved.path.clone(),
            codec: resolved.codec,
            path_fell_back: resolved.fell_back,
            duration,
            started_at: Instant::now(),
            frame_rate,
            shape: config.shape,
        };
        slot.active = Some(ActiveSession {
            info: info.clone(),
            queue,
            source,
            feeder: Some(feeder),
            timer,
            frames_enqueued,
        });
        slot.state = RecordingState::Recording;

        info!(
            session = session_id,
            path = %info.path.display(),
            codec = %info.codec,
            fps = frame_rate,
            shape = %info.shape,
            duration_secs,
            "Recording started"
        );
        self.inner.broadcast(SessionEvent::StateChanged(RecordingState::Recording));
        self.inner.broadcast(SessionEvent::RecordingStarted(info));
        drop(slot);

        Ok(resolved.path)
    }

    /// Stop the active session before its deadline.
    ///
    /// Returns once end-of-stream is queued; the file is closed later by the
    /// encoder thread. A session that is already finishing is left alone.
    pub fn stop_recording(&self) -> Result<(), RecordingError> {
        let (session_id, timer) = {
            let slot = self.inner.lock_slot();
            match (slot.state, slot.active.as_ref()) {
                (RecordingState::Recording, Some(active)) => {
                    (active.info.id, Arc::clone(&active.timer))
                }
                (RecordingState::Finishing, _) => return Ok(()),
                _ => return Err(StateError::NotRecording.into()),
            }
        };

        info!(session = session_id, "Stop requested");
        timer.stop();
        self.inner.finish(Some(session_id));
        Ok(())
    }

    /// Detach the feeder and queue end-of-stream without waiting for the
    /// encoder. Returns `false` if there was nothing left to finish.
    pub fn finish_recording(&self) -> bool {
        self.inner.finish(None)
    }

    /// Block until the coordinator is idle or `timeout` passes. Returns
    /// whether it is idle.
    pub fn wait_until_idle(&self, timeout: Duration) -> bool {
        let slot = self.inner.lock_slot();
        let (slot, _) = self
            .inner
            .idle
            .wait_timeout_while(slot, timeout, |slot| slot.state != RecordingState::Idle)
            .unwrap_or_else(|e| e.into_inner());
        slot.state == RecordingState::Idle
    }

    /// Stop any session, wait up to `timeout` for it to close, then release the camera.
    pub fn shutdown(&self, timeout: Duration) {
        if self.state() != RecordingState::Idle {
            let _ = self.stop_recording();
            if !self.wait_until_idle(timeout) {
                warn!("Recording did not finish within {:?} during shutdown", timeout);
            }
        }
        if let Err(e) = self.disconnect() {
            warn!("Failed to disconnect during shutdown: {}", e);
        }
    }
}

impl Drop for RecordingCoordinator {
    fn drop(&mut self) {
        self.shutdown(Duration::from_secs(5));
    }
}

impl Inner {
    fn lock_slot(&self) -> MutexGuard<'_, SessionSlot> {
        self.slot.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn source_mut(&self) -> RwLockWriteGuard<'_, Option<Arc<FrameSource>>> {
        self.source.write().unwrap_or_else(|e| e.into_inner())
    }

    fn current_source(&self) -> Option<Arc<FrameSource>> {
        self.source
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    fn connected_source(&self) -> Result<Arc<FrameSource>, RecordingError> {
        match self.current_source() {
            Some(source) if !source.is_stopped() => Ok(source),
            _ => Err(StateError::NotConnected.into()),
        }
    }

    fn require_idle(&self, slot: &SessionSlot) -> Result<(), RecordingError> {
        if slot.state == RecordingState::Idle {
            Ok(())
        } else {
            Err(StateError::BusyRecording.into())
        }
    }

    /// Broadcast an event to all subscribers.
    fn broadcast(&self, event: SessionEvent) {
        // Ignore send errors (no subscribers)
        let _ = self.event_tx.send(event);
    }

    /// First phase of stopping: detach the feeder, then queue end-of-stream.
    ///
    /// `session_id` restricts the call to one session; a stale timer from an
    /// earlier session must not finish a newer one.
    fn finish(&self, session_id: Option<u64>) -> bool {
        let (id, source, feeder, queue) = {
            let mut slot = self.lock_slot();
            if slot.state != RecordingState::Recording {
                return false;
            }
            let Some(active) = slot.active.as_mut() else {
                return false;
            };
            if session_id.is_some_and(|id| id != active.info.id) {
                return false;
            }
            let parts = (
                active.info.id,
                Arc::clone(&active.source),
                active.feeder.take(),
                Arc::clone(&active.queue),
            );
            slot.state = RecordingState::Finishing;
            self.broadcast(SessionEvent::StateChanged(RecordingState::Finishing));
            parts
        };

        // The feeder never runs after this, so nothing is pushed after the marker.
        if let Some(feeder) = feeder {
            source.unsubscribe(feeder);
        }
        queue.close();
        debug!(session = id, queued = queue.len(), "End-of-stream queued");
        true
    }

    fn on_timer_event(&self, session_id: u64, duration: Duration, event: TimerEvent) {
        match event {
            TimerEvent::Progress { elapsed } => self.broadcast(SessionEvent::Progress {
                session_id,
                elapsed,
                duration,
            }),
            TimerEvent::Stopped { elapsed, reason } => {
                info!(
                    session = session_id,
                    ?reason,
                    elapsed_secs = elapsed.as_secs_f64(),
                    "Session timer stopped"
                );
                self.broadcast(SessionEvent::TimerStopped {
                    session_id,
                    reason,
                    elapsed,
                });
                self.finish(Some(session_id));
            }
        }
    }

    fn on_encoder_event(&self, session_id: u64, event: EncoderEvent) {
        match event {
            EncoderEvent::Started { .. } => {
                self.broadcast(SessionEvent::EncoderStarted { session_id });
            }
            EncoderEvent::Stopped(report) => self.encoder_finished(session_id, report),
        }
    }

    /// Second phase of stopping, on the encoder thread once the file is closed.
    fn encoder_finished(&self, session_id: u64, report: EncoderReport) {
        let active = {
            let mut slot = self.lock_slot();
            let current = slot
                .active
                .as_ref()
                .is_some_and(|active| active.info.id == session_id);
            if current {
                slot.active.take()
            } else {
                None
            }
        };
        let Some(active) = active else {
            debug!(session = session_id, "Encoder of an unstarted session exited");
            return;
        };

        active.timer.stop();
        active.timer.join();
        if let Some(feeder) = active.feeder {
            active.source.unsubscribe(feeder);
        }
        let frames_enqueued = active.frames_enqueued.load(Ordering::Relaxed);

        {
            let mut slot = self.lock_slot();
            slot.state = RecordingState::Idle;
            self.broadcast(SessionEvent::StateChanged(RecordingState::Idle));
        }
        self.idle.notify_all();

        match &report.error {
            None => info!(
                session = session_id,
                path = %report.path.display(),
                frames = report.frames_written,
                "Recording saved"
            ),
            Some(e) => error!(
                session = session_id,
                path = %report.path.display(),
                "Recording failed: {}",
                e
            ),
        }
        self.broadcast(SessionEvent::RecordingStopped {
            session_id,
            report,
            frames_enqueued,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::SyntheticBackend;
    use crate::encoder::MemoryWriterFactory;

    fn coordinator(writers: MemoryWriterFactory) -> RecordingCoordinator {
        RecordingCoordinator::new(
            Arc::new(SyntheticBackend::new()),
            Arc::new(writers),
            RecordingOptions {
                queue_capacity: None,
                timer: TimerConfig::new(Duration::from_millis(5), 2),
            },
        )
    }

    fn small_config() -> CaptureConfig {
        CaptureConfig {
            target_frame_rate: 100.0,
            actual_frame_rate: 100.0,
            shape: Shape::new(16, 8),
            ..CaptureConfig::default()
        }
    }

    #[test]
    fn start_requires_connection() {
        let coordinator = coordinator(MemoryWriterFactory::new());
        assert!(matches!(
            coordinator.start_recording("out.mp4", 1.0),
            Err(RecordingError::State(StateError::NotConnected))
        ));
        assert_eq!(coordinator.state(), RecordingState::Idle);
    }

    #[test]
    fn invalid_duration_is_rejected() {
        let coordinator = coordinator(MemoryWriterFactory::new());
        coordinator.connect(&small_config()).unwrap();
        for bad in [0.0, -1.0, f64::NAN] {
            assert!(matches!(
                coordinator.start_recording("out.mp4", bad),
                Err(RecordingError::InvalidDuration(_))
            ));
        }
    }

    #[test]
    fn shape_is_locked_while_recording() {
        let coordinator = coordinator(MemoryWriterFactory::new());
        coordinator.connect(&small_config()).unwrap();
        coordinator.start_recording("out.mp4", 5.0).unwrap();

        assert!(matches!(
            coordinator.set_shape(Shape::new(8, 8)),
            Err(RecordingError::State(StateError::BusyRecording))
        ));
        assert!(matches!(
            coordinator.connect(&small_config()),
            Err(RecordingError::State(StateError::BusyRecording))
        ));
        assert!(coordinator.set_gamma(1.8).is_ok());

        coordinator.stop_recording().unwrap();
        assert!(coordinator.wait_until_idle(Duration::from_secs(5)));
        assert_eq!(coordinator.set_shape(Shape::new(8, 8)).unwrap(), Shape::new(8, 8));
    }

    #[test]
    fn finish_is_idempotent() {
        let coordinator = coordinator(MemoryWriterFactory::new());
        coordinator.connect(&small_config()).unwrap();
        coordinator.start_recording("out.mp4", 5.0).unwrap();

        assert!(coordinator.finish_recording());
        assert!(!coordinator.finish_recording());
        assert!(coordinator.wait_until_idle(Duration::from_secs(5)));
        assert!(!coordinator.finish_recording());
        assert!(matches!(
            coordinator.stop_recording(),
            Err(RecordingError::State(StateError::NotRecording))
        ));
    }

    #[test]
    fn reconnect_replaces_source() {
        let coordinator = coordinator(MemoryWriterFactory::new());
        coordinator.connect(&small_config()).unwrap();
        let first = coordinator.source().unwrap();

        let mut config = small_config();
        config.shape = Shape::new(32, 16);
        let effective = coordinator.connect(&config).unwrap();

        assert!(first.is_stopped());
        assert_eq!(effective.shape, Shape::new(32, 16));
        assert_eq!(coordinator.config().unwrap().shape, Shape::new(32, 16));

        coordinator.disconnect().unwrap();
        assert!(!coordinator.is_connected());
        assert!(coordinator.actual_frame_rate().is_none());
    }

    #[test]
    fn elapsed_is_zero_when_idle() {
        let coordinator = coordinator(MemoryWriterFactory::new());
        assert_eq!(coordinator.elapsed(), Duration::ZERO);
        assert!(coordinator.current_session().is_none());
    }
}
