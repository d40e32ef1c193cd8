//! Wall-clock deadline for a recording session.

use crate::error::{RecordingError, StateError};
use camrec_common::StopReason;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::debug;

/// Polling cadence of a [`SessionTimer`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimerConfig {
    pub tick: Duration,
    /// Emit [`TimerEvent::Progress`] every this many ticks
    pub progress_every: u32,
}

impl Default for TimerConfig {
    fn default() -> Self {
        Self {
            tick: Duration::from_millis(10),
            progress_every: 10,
        }
    }
}

impl TimerConfig {
    pub fn new(tick: Duration, progress_every: u32) -> Self {
        Self {
            tick: tick.max(Duration::from_millis(1)),
            progress_every: progress_every.max(1),
        }
    }
}

/// Notifications delivered on the timer thread.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum TimerEvent {
    Progress { elapsed: Duration },
    Stopped { elapsed: Duration, reason: StopReason },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerState {
    Idle,
    Running,
    Stopped,
}

const IDLE: u8 = 0;
const RUNNING: u8 = 1;
const STOPPED: u8 = 2;

/// Measures elapsed time against a target duration on its own thread.
///
/// `Idle -> Running -> Stopped`; a timer is started at most once. Exactly one
/// [`TimerEvent::Stopped`] is emitted, with [`StopReason::Deadline`] when the
/// duration elapsed first and [`StopReason::Manual`] after [`stop`](Self::stop).
pub struct SessionTimer {
    config: TimerConfig,
    state: Arc<AtomicU8>,
    stop_requested: Arc<AtomicBool>,
    started_at: Mutex<Option<Instant>>,
    /// Elapsed time frozen when the timer stopped.
    final_elapsed: Arc<Mutex<Option<Duration>>>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl SessionTimer {
    pub fn new(config: TimerConfig) -> Self {
        Self {
            config,
            state: Arc::new(AtomicU8::new(IDLE)),
            stop_requested: Arc::new(AtomicBool::new(false)),
            started_at: Mutex::new(None),
            final_elapsed: Arc::new(Mutex::new(None)),
            thread: Mutex::new(None),
        }
    }

    /// Start counting towards `duration`.
    pub fn start<F>(&self, duration: Duration, mut on_event: F) -> Result<(), RecordingError>
    where
        F: FnMut(TimerEvent) + Send + 'static,
    {
        if self
            .state
            .compare_exchange(IDLE, RUNNING, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(StateError::TimerAlreadyStarted.into());
        }

        let start = Instant::now();
        *self.started_at.lock().unwrap_or_else(|e| e.into_inner()) = Some(start);

        let config = self.config;
        let state = Arc::clone(&self.state);
        let stop_requested = Arc::clone(&self.stop_requested);
        let final_elapsed = Arc::clone(&self.final_elapsed);

        let spawned = thread::Builder::new()
            .name("camrec-timer".to_string())
            .spawn(move || {
                let mut ticks: u64 = 0;
                let reason = loop {
                    let elapsed = start.elapsed();
                    if elapsed >= duration {
                        break StopReason::Deadline;
                    }
                    if stop_requested.load(Ordering::Acquire) {
                        break StopReason::Manual;
                    }
                    if ticks > 0 && ticks % config.progress_every as u64 == 0 {
                        on_event(TimerEvent::Progress { elapsed });
                    }
                    ticks += 1;
                    thread::sleep(config.tick.min(duration - elapsed));
                };

                let elapsed = start.elapsed();
                *final_elapsed.lock().unwrap_or_else(|e| e.into_inner()) = Some(elapsed);
                state.store(STOPPED, Ordering::Release);
                debug!(?reason, elapsed_ms = elapsed.as_millis() as u64, "Session timer stopped");
                on_event(TimerEvent::Stopped { elapsed, reason });
            });

        match spawned {
            Ok(handle) => {
                *self.thread.lock().unwrap_or_else(|e| e.into_inner()) = Some(handle);
                Ok(())
            }
            Err(source) => {
                self.state.store(STOPPED, Ordering::Release);
                Err(RecordingError::Spawn {
                    name: "timer",
                    source,
                })
            }
        }
    }

    /// Request an early stop. Returns `false` if the timer is not running.
    ///
    /// The timer thread emits the `Stopped` event once it observes the request.
    pub fn stop(&self) -> bool {
        if self.state() != TimerState::Running {
            return false;
        }
        !self.stop_requested.swap(true, Ordering::AcqRel)
    }

    /// Wait for the timer thread to exit. Does nothing from the timer thread itself.
    pub fn join(&self) {
        let handle = self.thread.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(handle) = handle {
            if handle.thread().id() == thread::current().id() {
                return;
            }
            let _ = handle.join();
        }
    }

    pub fn state(&self) -> TimerState {
        match self.state.load(Ordering::Acquire) {
            IDLE => TimerState::Idle,
            RUNNING => TimerState::Running,
            _ => TimerState::Stopped,
        }
    }

    /// Time since start, frozen once stopped; zero before start.
    pub fn elapsed(&self) -> Duration {
        if let Some(elapsed) = *self.final_elapsed.lock().unwrap_or_else(|e| e.into_inner()) {
            return elapsed;
        }
        self.started_at
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .map(|start| start.elapsed())
            .unwrap_or_default()
    }
}

impl Drop for SessionTimer {
    fn drop(&mut self) {
        self.stop();
        self.join();
    }
}
