//! Producer-to-encoder hand-off.
//!
//! Any number of producers push; exactly one [`QueueConsumer`] pops. Closing
//! the queue drops its only sender, so the consumer drains what is buffered
//! and then sees the end-of-stream marker as the last item.

use crate::error::StateError;
use crate::frame::Frame;
use crossbeam_channel::{bounded, select, unbounded, Receiver, RecvTimeoutError, Sender, TryRecvError};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

/// One entry of a [`FrameQueue`].
#[derive(Debug, Clone)]
pub enum QueueItem {
    Frame(Frame),
    EndOfStream,
}

/// Senders that exist until the queue is closed.
struct Inlet {
    frames: Sender<Frame>,
    /// Never sent on; dropping it wakes pushers blocked on a full queue.
    _closing: Sender<()>,
}

/// FIFO of frames with an explicit end-of-stream marker.
///
/// Unbounded queues never block on push. Bounded queues block the pusher
/// while full; closing never waits for space.
pub struct FrameQueue {
    inlet: RwLock<Option<Inlet>>,
    closed: Receiver<()>,
    receiver: Receiver<Frame>,
    consumer_claimed: AtomicBool,
    capacity: Option<usize>,
    pushed: AtomicU64,
    popped: AtomicU64,
}

impl FrameQueue {
    /// Create a queue; `None` means unbounded. A capacity of zero is treated as one.
    pub fn new(capacity: Option<usize>) -> Arc<Self> {
        let capacity = capacity.map(|c| c.max(1));
        let (frames, receiver) = match capacity {
            Some(capacity) => bounded(capacity),
            None => unbounded(),
        };
        let (closing, closed) = bounded(0);
        Arc::new(Self {
            inlet: RwLock::new(Some(Inlet {
                frames,
                _closing: closing,
            })),
            closed,
            receiver,
            consumer_claimed: AtomicBool::new(false),
            capacity,
            pushed: AtomicU64::new(0),
            popped: AtomicU64::new(0),
        })
    }

    pub fn unbounded() -> Arc<Self> {
        Self::new(None)
    }

    pub fn bounded(capacity: usize) -> Arc<Self> {
        Self::new(Some(capacity))
    }

    /// Enqueue an item. Pushing [`QueueItem::EndOfStream`] closes the queue.
    pub fn push(&self, item: QueueItem) -> Result<(), StateError> {
        match item {
            QueueItem::Frame(frame) => self.push_frame(frame),
            QueueItem::EndOfStream if self.close() => Ok(()),
            QueueItem::EndOfStream => Err(StateError::QueueClosed),
        }
    }

    /// Enqueue a frame.
    ///
    /// Fails with [`StateError::QueueClosed`] once the queue is closed,
    /// including for a pusher that was waiting for space when it closed.
    pub fn push_frame(&self, frame: Frame) -> Result<(), StateError> {
        let sender = self
            .inlet
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .as_ref()
            .map(|inlet| inlet.frames.clone())
            .ok_or(StateError::QueueClosed)?;

        let sent = match sender.try_send(frame) {
            Ok(()) => Ok(()),
            Err(crossbeam_channel::TrySendError::Full(frame)) => select! {
                send(sender, frame) -> res => res.map_err(|_| StateError::QueueClosed),
                recv(self.closed) -> _ => Err(StateError::QueueClosed),
            },
            Err(crossbeam_channel::TrySendError::Disconnected(_)) => Err(StateError::QueueClosed),
        };
        if sent.is_ok() {
            self.pushed.fetch_add(1, Ordering::Relaxed);
        }
        sent
    }

    /// Enqueue the end-of-stream marker. Returns `false` if it was already queued.
    pub fn close(&self) -> bool {
        self.inlet
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .take()
            .is_some()
    }

    /// Claim the single consumer handle.
    pub fn consumer(self: &Arc<Self>) -> Result<QueueConsumer, StateError> {
        if self
            .consumer_claimed
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(StateError::ConsumerClaimed);
        }
        Ok(QueueConsumer {
            receiver: self.receiver.clone(),
            queue: Arc::clone(self),
        })
    }

    /// Frames currently buffered.
    pub fn len(&self) -> usize {
        self.receiver.len()
    }

    pub fn is_empty(&self) -> bool {
        self.receiver.is_empty()
    }

    pub fn capacity(&self) -> Option<usize> {
        self.capacity
    }

    /// Whether the end-of-stream marker has been enqueued.
    pub fn is_closed(&self) -> bool {
        self.inlet
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .is_none()
    }

    /// Frames ever accepted.
    pub fn pushed(&self) -> u64 {
        self.pushed.load(Ordering::Relaxed)
    }
}

impl std::fmt::Debug for FrameQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FrameQueue")
            .field("len", &self.len())
            .field("capacity", &self.capacity)
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// The single consuming end of a [`FrameQueue`].
///
/// Dropping the handle releases the claim. After the marker every pop keeps
/// returning [`QueueItem::EndOfStream`].
#[derive(Debug)]
pub struct QueueConsumer {
    receiver: Receiver<Frame>,
    queue: Arc<FrameQueue>,
}

impl QueueConsumer {
    fn received(&self, frame: Frame) -> QueueItem {
        self.queue.popped.fetch_add(1, Ordering::Relaxed);
        QueueItem::Frame(frame)
    }

    /// Block until an item is available.
    pub fn pop(&self) -> QueueItem {
        match self.receiver.recv() {
            Ok(frame) => self.received(frame),
            Err(_) => QueueItem::EndOfStream,
        }
    }

    pub fn try_pop(&self) -> Option<QueueItem> {
        match self.receiver.try_recv() {
            Ok(frame) => Some(self.received(frame)),
            Err(TryRecvError::Empty) => None,
            Err(TryRecvError::Disconnected) => Some(QueueItem::EndOfStream),
        }
    }

    /// Block for at most `timeout`.
    pub fn pop_timeout(&self, timeout: Duration) -> Option<QueueItem> {
        match self.receiver.recv_timeout(timeout) {
            Ok(frame) => Some(self.received(frame)),
            Err(RecvTimeoutError::Timeout) => None,
            Err(RecvTimeoutError::Disconnected) => Some(QueueItem::EndOfStream),
        }
    }

    /// Frames popped so far through this queue.
    pub fn popped(&self) -> u64 {
        self.queue.popped.load(Ordering::Relaxed)
    }

    pub fn queue(&self) -> &Arc<FrameQueue> {
        &self.queue
    }
}

impl Drop for QueueConsumer {
    fn drop(&mut self) {
        self.queue.consumer_claimed.store(false, Ordering::Release);
    }
}
