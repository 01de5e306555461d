//! The adapter contract between the bus facade and a concrete back-end.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use crate::can_queue::FrameQueue;
use crate::frame::Frame;

/// How long queue operations wait before rechecking the running flag.
pub(crate) const QUEUE_DELAY: Duration = Duration::from_millis(100);

/// Capability interface implemented by every back-end.
///
/// All methods are callable from any thread. Nothing here returns an error:
/// per the library's propagation policy, runtime failures surface as `false`
/// or `None` plus counters, and only construction can fail.
pub trait Transport: Send + Sync {
    /// Enqueue a frame for transmission.
    ///
    /// With `timeout: None` the call keeps retrying until the outbound queue
    /// accepts the frame or the transport shuts down. With `Some(t)` it is a
    /// bounded put and a full queue yields `false`. On `true` the frame is on
    /// the outbound queue and `lifetime_sent` has been incremented.
    fn send(&self, frame: Frame, timeout: Option<Duration>) -> bool;

    /// Take the next inbound frame.
    ///
    /// `None` timeout blocks while the transport is running. Increments
    /// `lifetime_received` for every frame returned.
    fn next_message(&self, timeout: Option<Duration>) -> Option<Frame>;

    /// Place a frame directly onto the inbound queue (bounded put).
    ///
    /// This is the loopback path: the facade uses it to mirror transmitted
    /// frames inbound, and tests use it to fake bus traffic.
    fn inject(&self, frame: Frame) -> bool;

    /// Total frames accepted by `send` over the transport's lifetime.
    fn lifetime_sent(&self) -> u64;

    /// Total frames handed out by `next_message` over the lifetime.
    fn lifetime_received(&self) -> u64;

    /// Stop the workers and release the hardware. Idempotent.
    fn shutdown(&self);
}

/// Queue, counter and liveness state shared by a back-end and its workers.
///
/// Concrete transports compose this behind an `Arc`: the user-facing
/// send/next_message bodies are identical across back-ends, only the worker
/// loops moving frames to and from hardware differ.
pub struct TransportState {
    pub inbound: FrameQueue,
    pub outbound: FrameQueue,
    sent: AtomicU64,
    received: AtomicU64,
    running: AtomicBool,
}

impl TransportState {
    pub fn new(max_in: usize, max_out: usize) -> Self {
        Self {
            inbound: FrameQueue::bounded(max_in),
            outbound: FrameQueue::bounded(max_out),
            sent: AtomicU64::new(0),
            received: AtomicU64::new(0),
            running: AtomicBool::new(true),
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Clear the running flag. Workers blocked on timed queue ops notice
    /// within one QUEUE_DELAY.
    pub fn stop(&self) {
        self.running.store(false, Ordering::Release);
    }

    pub fn send(&self, mut frame: Frame, timeout: Option<Duration>) -> bool {
        match timeout {
            Some(timeout) => match self.outbound.put(frame, timeout) {
                Ok(()) => {
                    self.sent.fetch_add(1, Ordering::Relaxed);
                    true
                }
                Err(_) => false,
            },
            None => {
                // Retry until accepted, original driver behavior. Bounded
                // slices keep the caller responsive to shutdown.
                while self.is_running() {
                    match self.outbound.put(frame, QUEUE_DELAY) {
                        Ok(()) => {
                            self.sent.fetch_add(1, Ordering::Relaxed);
                            return true;
                        }
                        Err(rejected) => frame = rejected,
                    }
                }
                false
            }
        }
    }

    pub fn next_message(&self, timeout: Option<Duration>) -> Option<Frame> {
        match timeout {
            Some(timeout) => {
                let deadline = Instant::now() + timeout;
                loop {
                    let remaining = deadline.saturating_duration_since(Instant::now());
                    if remaining.is_zero() {
                        return None;
                    }
                    if let Some(frame) = self.inbound.get(remaining.min(QUEUE_DELAY)) {
                        self.received.fetch_add(1, Ordering::Relaxed);
                        return Some(frame);
                    }
                }
            }
            None => {
                while self.is_running() {
                    if let Some(frame) = self.inbound.get(QUEUE_DELAY) {
                        self.received.fetch_add(1, Ordering::Relaxed);
                        return Some(frame);
                    }
                }
                None
            }
        }
    }

    pub fn inject(&self, frame: Frame) -> bool {
        self.inbound.put(frame, QUEUE_DELAY).is_ok()
    }

    pub fn lifetime_sent(&self) -> u64 {
        self.sent.load(Ordering::Relaxed)
    }

    pub fn lifetime_received(&self) -> u64 {
        self.received.load(Ordering::Relaxed)
    }
}
