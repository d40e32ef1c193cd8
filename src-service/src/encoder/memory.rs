//! Writer that keeps frames in memory.

use super::{OutputTarget, VideoWriter, WriterFactory};
use crate::error::FileError;
use crate::frame::Frame;
use std::sync::{Arc, Mutex};

/// Everything one in-memory writer received.
#[derive(Debug, Clone)]
pub struct MemoryRecording {
    pub target: OutputTarget,
    pub frames: Vec<Frame>,
    /// Number of times `finish` was called
    pub finished: u32,
}

impl MemoryRecording {
    /// Source sequence numbers of the written frames, in order.
    pub fn sequences(&self) -> Vec<u64> {
        self.frames.iter().map(Frame::sequence).collect()
    }
}

#[derive(Debug, Clone, Copy, Default)]
enum Failure {
    #[default]
    None,
    Open,
    WriteAfter(usize),
}

/// [`WriterFactory`] recording every opened output in memory.
#[derive(Debug, Clone, Default)]
pub struct MemoryWriterFactory {
    recordings: Arc<Mutex<Vec<Arc<Mutex<MemoryRecording>>>>>,
    failure: Failure,
}

impl MemoryWriterFactory {
    pub fn new() -> Self {
        Self::default()
    }

    /// A factory whose `open` always fails.
    pub fn failing_open() -> Self {
        Self {
            failure: Failure::Open,
            ..Self::default()
        }
    }

    /// A factory whose writers fail every write after the first `n`.
    pub fn failing_after(n: usize) -> Self {
        Self {
            failure: Failure::WriteAfter(n),
            ..Self::default()
        }
    }

    /// Outputs opened so far, oldest first.
    pub fn recordings(&self) -> Vec<Arc<Mutex<MemoryRecording>>> {
        self.recordings
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }
}

impl WriterFactory for MemoryWriterFactory {
    fn open(&self, target: &OutputTarget) -> Result<Box<dyn VideoWriter>, FileError> {
        if let Failure::Open = self.failure {
            return Err(FileError::Open {
                path: target.path.clone(),
                reason: "simulated open failure".to_string(),
            });
        }

        let recording = Arc::new(Mutex::new(MemoryRecording {
            target: target.clone(),
            frames: Vec::new(),
            finished: 0,
        }));
        self.recordings
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(Arc::clone(&recording));

        let write_limit = match self.failure {
            Failure::WriteAfter(n) => Some(n),
            _ => None,
        };
        Ok(Box::new(MemoryWriter {
            recording,
            write_limit,
        }))
    }
}

struct MemoryWriter {
    recording: Arc<Mutex<MemoryRecording>>,
    write_limit: Option<usize>,
}

impl VideoWriter for MemoryWriter {
    fn write_frame(&mut self, frame: &Frame) -> Result<(), FileError> {
        let mut recording = self.recording.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(limit) = self.write_limit {
            if recording.frames.len() >= limit {
                return Err(FileError::Write {
                    path: recording.target.path.clone(),
                    reason: "simulated write failure".to_string(),
                });
            }
        }
        if frame.shape() != recording.target.shape {
            return Err(FileError::ShapeMismatch {
                expected: recording.target.shape,
                actual: frame.shape(),
            });
        }
        recording.frames.push(frame.clone());
        Ok(())
    }

    fn finish(self: Box<Self>) -> Result<(), FileError> {
        self.recording
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .finished += 1;
        Ok(())
    }
}
