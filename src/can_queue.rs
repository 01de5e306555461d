//! Bounded FIFO queues carrying frames between workers and user code.
//!
//! Each transport owns one inbound and one outbound queue. Every blocking
//! operation takes a timeout so workers can observe shutdown promptly.

use std::time::Duration;

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender, TrySendError};

use crate::frame::Frame;

/// Fixed-capacity FIFO of frames.
///
/// Holds both channel endpoints, so clones share the same queue and
/// concurrent producers/consumers are safe.
#[derive(Clone)]
pub struct FrameQueue {
    tx: Sender<Frame>,
    rx: Receiver<Frame>,
}

impl FrameQueue {
    pub fn bounded(capacity: usize) -> Self {
        let (tx, rx) = bounded(capacity);
        Self { tx, rx }
    }

    /// Push a frame, waiting up to `timeout` for free capacity.
    ///
    /// On timeout the frame is handed back so the caller decides whether the
    /// drop is an error, a logged warning, or routine backpressure.
    pub fn put(&self, frame: Frame, timeout: Duration) -> Result<(), Frame> {
        match self.tx.send_timeout(frame, timeout) {
            Ok(()) => Ok(()),
            Err(err) => Err(err.into_inner()),
        }
    }

    /// Push a frame only if capacity is immediately available.
    pub fn try_put(&self, frame: Frame) -> Result<(), Frame> {
        match self.tx.try_send(frame) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(frame)) | Err(TrySendError::Disconnected(frame)) => Err(frame),
        }
    }

    /// Pop the oldest frame, waiting up to `timeout` for one to arrive.
    pub fn get(&self, timeout: Duration) -> Option<Frame> {
        match self.rx.recv_timeout(timeout) {
            Ok(frame) => Some(frame),
            Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => None,
        }
    }

    /// Current number of queued frames.
    pub fn len(&self) -> usize {
        self.rx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }

    /// Fixed maximum capacity.
    pub fn capacity(&self) -> usize {
        self.tx.capacity().unwrap_or(0)
    }
}
