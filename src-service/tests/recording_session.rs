//! End-to-end recording sessions against the synthetic camera and the
//! in-memory writer.

use camrec_common::{CaptureConfig, RecordingState, Shape, StopReason, VideoCodec};
use camrec_service::capture::synthetic::sequence_of;
use camrec_service::encoder::MemoryRecording;
use camrec_service::{
    DeviceError, EncoderReport, FileError, MemoryWriterFactory, RecordingCoordinator, RecordingError,
    RecordingOptions, SessionEvent, StateError, SyntheticBackend, TimerConfig,
};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};
use tempfile::TempDir;
use tokio::sync::broadcast;

const WAIT: Duration = Duration::from_secs(10);

fn camera(fps: f64) -> CaptureConfig {
    CaptureConfig {
        target_frame_rate: fps,
        actual_frame_rate: fps,
        shape: Shape::new(64, 48),
        ..CaptureConfig::default()
    }
}

fn coordinator(backend: SyntheticBackend, writers: &MemoryWriterFactory) -> RecordingCoordinator {
    coordinator_with(backend, writers, RecordingOptions::default())
}

fn coordinator_with(
    backend: SyntheticBackend,
    writers: &MemoryWriterFactory,
    options: RecordingOptions,
) -> RecordingCoordinator {
    RecordingCoordinator::new(Arc::new(backend), Arc::new(writers.clone()), options)
}

/// Collect events until `RecordingStopped` arrives or `timeout` passes.
fn events_until_stopped(
    rx: &mut broadcast::Receiver<SessionEvent>,
    timeout: Duration,
) -> Vec<SessionEvent> {
    let deadline = Instant::now() + timeout;
    let mut events = Vec::new();
    while Instant::now() < deadline {
        match rx.try_recv() {
            Ok(event) => {
                let done = matches!(event, SessionEvent::RecordingStopped { .. });
                events.push(event);
                if done {
                    break;
                }
            }
            Err(broadcast::error::TryRecvError::Empty) => thread::sleep(Duration::from_millis(5)),
            Err(e) => panic!("event channel failed: {:?}", e),
        }
    }
    events
}

fn stopped(events: &[SessionEvent]) -> Vec<(EncoderReport, u64)> {
    events
        .iter()
        .filter_map(|e| match e {
            SessionEvent::RecordingStopped {
                report,
                frames_enqueued,
                ..
            } => Some((report.clone(), *frames_enqueued)),
            _ => None,
        })
        .collect()
}

fn timer_stop(events: &[SessionEvent]) -> Option<(StopReason, Duration)> {
    events.iter().find_map(|e| match e {
        SessionEvent::TimerStopped {
            reason, elapsed, ..
        } => Some((*reason, *elapsed)),
        _ => None,
    })
}

fn device_sequences(recording: &MemoryRecording) -> Vec<u64> {
    recording
        .frames
        .iter()
        .map(|f| sequence_of(f).expect("synthetic frames are tagged"))
        .collect()
}

fn assert_contiguous(sequences: &[u64]) {
    for pair in sequences.windows(2) {
        assert_eq!(pair[1], pair[0] + 1, "gap or duplicate in {:?}", sequences);
    }
}

#[test]
fn deadline_closes_file_after_two_seconds_of_frames() {
    let dir = TempDir::new().unwrap();
    let writers = MemoryWriterFactory::new();
    let coordinator = coordinator(SyntheticBackend::new(), &writers);
    coordinator.connect(&camera(30.0)).unwrap();
    let mut rx = coordinator.subscribe_events();

    let wall = Instant::now();
    let path = coordinator
        .start_recording(dir.path().join("run.mp4"), 2.0)
        .unwrap();
    assert_eq!(path, dir.path().join("run.mp4"));
    assert_eq!(coordinator.state(), RecordingState::Recording);

    let events = events_until_stopped(&mut rx, WAIT);
    let stops = stopped(&events);
    assert_eq!(stops.len(), 1);
    let (report, enqueued) = &stops[0];
    assert!(report.is_success());
    assert_eq!(report.codec, VideoCodec::Mpeg4);
    assert_eq!(report.frames_written, *enqueued);

    let (reason, elapsed) = timer_stop(&events).unwrap();
    assert_eq!(reason, StopReason::Deadline);
    assert!(elapsed >= Duration::from_secs(2));
    assert!(events
        .iter()
        .any(|e| matches!(e, SessionEvent::Progress { .. })));

    // Keep the camera running past the session; nothing more reaches the file.
    thread::sleep(Duration::from_secs(5).saturating_sub(wall.elapsed()));
    assert_eq!(coordinator.state(), RecordingState::Idle);

    let recordings = writers.recordings();
    assert_eq!(recordings.len(), 1);
    let recording = recordings[0].lock().unwrap();
    assert_eq!(recording.finished, 1);
    assert_eq!(recording.frames.len() as u64, report.frames_written);
    assert_eq!(recording.target.frame_rate, 30.0);
    assert_contiguous(&device_sequences(&recording));

    // Two seconds at 30 fps, with slack for scheduling on a loaded machine.
    let written = recording.frames.len();
    assert!((50..=65).contains(&written), "wrote {} frames", written);
}

#[test]
fn manual_stop_writes_everything_enqueued() {
    let dir = TempDir::new().unwrap();
    let writers = MemoryWriterFactory::new();
    let coordinator = coordinator(SyntheticBackend::new(), &writers);
    coordinator.connect(&camera(60.0)).unwrap();
    let mut rx = coordinator.subscribe_events();

    coordinator
        .start_recording(dir.path().join("manual.avi"), 30.0)
        .unwrap();
    thread::sleep(Duration::from_millis(300));
    coordinator.stop_recording().unwrap();

    let events = events_until_stopped(&mut rx, WAIT);
    let (reason, elapsed) = timer_stop(&events).unwrap();
    assert_eq!(reason, StopReason::Manual);
    assert!(elapsed < Duration::from_secs(5));

    let (report, enqueued) = stopped(&events).pop().unwrap();
    assert_eq!(report.frames_written, enqueued);
    assert!(report.frames_written > 0);
    assert_eq!(report.codec, VideoCodec::Xvid);

    let recording = writers.recordings()[0].lock().unwrap().clone();
    assert_eq!(recording.finished, 1);
    assert_contiguous(&device_sequences(&recording));
}

#[test]
fn extensionless_path_is_rewritten_to_avi() {
    let dir = TempDir::new().unwrap();
    let writers = MemoryWriterFactory::new();
    let coordinator = coordinator(SyntheticBackend::new(), &writers);
    coordinator.connect(&camera(30.0)).unwrap();

    let resolved = coordinator
        .start_recording(dir.path().join("clip"), 5.0)
        .unwrap();
    assert_eq!(resolved, dir.path().join("clip.avi"));

    let session = coordinator.current_session().unwrap();
    assert!(session.path_fell_back);
    assert_eq!(session.codec, VideoCodec::Xvid);

    coordinator.stop_recording().unwrap();
    assert!(coordinator.wait_until_idle(WAIT));

    let recording = writers.recordings()[0].lock().unwrap().clone();
    assert_eq!(recording.target.path, dir.path().join("clip.avi"));
    assert_eq!(recording.target.codec, VideoCodec::Xvid);
}

#[test]
fn state_errors_leave_session_untouched() {
    let dir = TempDir::new().unwrap();
    let writers = MemoryWriterFactory::new();
    let coordinator = coordinator(SyntheticBackend::new(), &writers);
    coordinator.connect(&camera(30.0)).unwrap();

    assert!(matches!(
        coordinator.stop_recording(),
        Err(RecordingError::State(StateError::NotRecording))
    ));

    coordinator
        .start_recording(dir.path().join("a.mp4"), 5.0)
        .unwrap();
    assert!(matches!(
        coordinator.start_recording(dir.path().join("b.mp4"), 5.0),
        Err(RecordingError::State(StateError::AlreadyRecording))
    ));
    assert_eq!(coordinator.state(), RecordingState::Recording);
    assert_eq!(writers.recordings().len(), 1);

    coordinator.stop_recording().unwrap();
    assert!(coordinator.wait_until_idle(WAIT));
}

#[test]
fn encoder_uses_device_reported_rate() {
    let dir = TempDir::new().unwrap();
    let writers = MemoryWriterFactory::new();
    let coordinator = coordinator(SyntheticBackend::new().with_max_rate(25.0), &writers);

    let effective = coordinator.connect(&camera(30.0)).unwrap();
    assert_eq!(effective.actual_frame_rate, 25.0);
    assert_eq!(coordinator.set_frame_rate(60.0).unwrap(), 25.0);
    assert_eq!(coordinator.config().unwrap().target_frame_rate, 60.0);

    coordinator
        .start_recording(dir.path().join("rate.mp4"), 5.0)
        .unwrap();
    assert_eq!(coordinator.current_session().unwrap().frame_rate, 25.0);
    coordinator.stop_recording().unwrap();
    assert!(coordinator.wait_until_idle(WAIT));

    assert_eq!(writers.recordings()[0].lock().unwrap().target.frame_rate, 25.0);
}

#[test]
fn open_failure_starts_nothing() {
    let dir = TempDir::new().unwrap();
    let writers = MemoryWriterFactory::failing_open();
    let coordinator = coordinator(SyntheticBackend::new(), &writers);
    coordinator.connect(&camera(30.0)).unwrap();
    let source = coordinator.source().unwrap();

    let result = coordinator.start_recording(dir.path().join("x.mp4"), 2.0);
    assert!(matches!(
        result,
        Err(RecordingError::File(FileError::Open { .. }))
    ));
    assert_eq!(coordinator.state(), RecordingState::Idle);
    assert!(coordinator.current_session().is_none());
    assert_eq!(source.subscriber_count(), 0);
}

#[test]
fn sessions_can_follow_each_other() {
    let dir = TempDir::new().unwrap();
    let writers = MemoryWriterFactory::new();
    let coordinator = coordinator(SyntheticBackend::new(), &writers);
    coordinator.connect(&camera(100.0)).unwrap();
    let mut rx = coordinator.subscribe_events();

    coordinator
        .start_recording(dir.path().join("one.mp4"), 0.2)
        .unwrap();
    let first = stopped(&events_until_stopped(&mut rx, WAIT));
    assert!(coordinator.wait_until_idle(WAIT));

    coordinator
        .start_recording(dir.path().join("two.mp4"), 0.2)
        .unwrap();
    let second = stopped(&events_until_stopped(&mut rx, WAIT));
    assert!(coordinator.wait_until_idle(WAIT));

    assert_eq!(first.len(), 1);
    assert_eq!(second.len(), 1);
    assert_ne!(first[0].0.path, second[0].0.path);

    let recordings = writers.recordings();
    assert_eq!(recordings.len(), 2);
    for recording in recordings {
        let recording = recording.lock().unwrap();
        assert_eq!(recording.finished, 1);
        assert_contiguous(&device_sequences(&recording));
    }
}

#[test]
fn bounded_queue_loses_nothing() {
    let dir = TempDir::new().unwrap();
    let writers = MemoryWriterFactory::new();
    let options = RecordingOptions {
        queue_capacity: Some(2),
        timer: TimerConfig::default(),
    };
    let coordinator = coordinator_with(SyntheticBackend::new(), &writers, options);
    coordinator.connect(&camera(200.0)).unwrap();
    let mut rx = coordinator.subscribe_events();

    coordinator
        .start_recording(dir.path().join("bounded.mp4"), 0.5)
        .unwrap();
    let (report, enqueued) = stopped(&events_until_stopped(&mut rx, WAIT)).pop().unwrap();

    assert_eq!(report.frames_written, enqueued);
    let recording = writers.recordings()[0].lock().unwrap().clone();
    assert_contiguous(&device_sequences(&recording));
}

#[test]
fn stop_from_frame_subscriber_returns_to_idle() {
    let dir = TempDir::new().unwrap();
    let writers = MemoryWriterFactory::new();
    let coordinator = Arc::new(coordinator(SyntheticBackend::new(), &writers));
    coordinator.connect(&camera(60.0)).unwrap();
    let mut rx = coordinator.subscribe_events();
    coordinator
        .start_recording(dir.path().join("sink.mp4"), 10.0)
        .unwrap();

    let (tx, stop_result) = mpsc::channel();
    let tx = Mutex::new(tx);
    let requested = AtomicBool::new(false);
    let weak = Arc::downgrade(&coordinator);
    coordinator
        .subscribe_frames(move |_| {
            if requested.swap(true, Ordering::SeqCst) {
                return;
            }
            if let Some(coordinator) = weak.upgrade() {
                let _ = tx.lock().unwrap().send(coordinator.stop_recording().is_ok());
            }
        })
        .unwrap();

    assert_eq!(stop_result.recv_timeout(Duration::from_secs(3)), Ok(true));
    assert!(coordinator.wait_until_idle(WAIT));
    assert_eq!(coordinator.state(), RecordingState::Idle);

    let events = events_until_stopped(&mut rx, WAIT);
    assert_eq!(timer_stop(&events).map(|(reason, _)| reason), Some(StopReason::Manual));
    let (report, enqueued) = stopped(&events).pop().unwrap();
    assert!(report.is_success());
    assert_eq!(report.frames_written, enqueued);

    let recording = writers.recordings()[0].lock().unwrap().clone();
    assert_eq!(recording.finished, 1);
    assert_contiguous(&device_sequences(&recording));

    // The camera keeps running for the next session.
    assert!(coordinator.source().unwrap().is_running());
}

#[test]
fn failed_reconnect_leaves_nothing_running() {
    let dir = TempDir::new().unwrap();
    let writers = MemoryWriterFactory::new();
    let coordinator = coordinator(SyntheticBackend::new(), &writers);
    coordinator.connect(&camera(30.0)).unwrap();
    let first = coordinator.source().unwrap();

    let mut broken = camera(30.0);
    broken.shape = Shape::new(0, 0);
    assert!(matches!(
        coordinator.connect(&broken),
        Err(RecordingError::Device(DeviceError::Open { .. }))
    ));

    assert!(!coordinator.is_connected());
    assert!(first.is_stopped());
    assert!(!first.is_running());
    assert!(matches!(
        coordinator.start_recording(dir.path().join("never.mp4"), 1.0),
        Err(RecordingError::State(StateError::NotConnected))
    ));
    assert_eq!(coordinator.state(), RecordingState::Idle);
    assert!(writers.recordings().is_empty());
}
