//! Threadless transport double for tests and bring-up.
//!
//! Frames accepted by `send` stay in the outbound queue (nothing drains it)
//! and are also logged with a monotonic timestamp, which is what the cyclic
//! timing harness measures. Inbound traffic is faked with [`Transport::inject`].

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use crate::frame::Frame;
use crate::transport::{Transport, TransportState};

pub struct MockTransport {
    state: TransportState,
    sent_log: Mutex<Vec<(Instant, Frame)>>,
}

impl MockTransport {
    /// Default queue sizing, matching the facade-level defaults.
    pub fn new() -> Arc<Self> {
        Self::with_capacity(500, 500)
    }

    pub fn with_capacity(max_in: usize, max_out: usize) -> Arc<Self> {
        Arc::new(Self {
            state: TransportState::new(max_in, max_out),
            sent_log: Mutex::new(Vec::new()),
        })
    }

    /// Every frame accepted by `send`, oldest first.
    pub fn sent_frames(&self) -> Vec<Frame> {
        self.sent_log
            .lock()
            .unwrap()
            .iter()
            .map(|(_, f)| f.clone())
            .collect()
    }

    /// Monotonic capture instants of accepted frames, oldest first.
    pub fn sent_instants(&self) -> Vec<Instant> {
        self.sent_log.lock().unwrap().iter().map(|(t, _)| *t).collect()
    }

    /// Empty the outbound queue, freeing capacity for further sends.
    pub fn drain_outbound(&self) {
        while self.state.outbound.get(Duration::ZERO).is_some() {}
    }
}

impl Transport for MockTransport {
    fn send(&self, frame: Frame, timeout: Option<Duration>) -> bool {
        let accepted = self.state.send(frame.clone(), timeout);
        if accepted {
            self.sent_log.lock().unwrap().push((Instant::now(), frame));
        }
        accepted
    }

    fn next_message(&self, timeout: Option<Duration>) -> Option<Frame> {
        self.state.next_message(timeout)
    }

    fn inject(&self, frame: Frame) -> bool {
        self.state.inject(frame)
    }

    fn lifetime_sent(&self) -> u64 {
        self.state.lifetime_sent()
    }

    fn lifetime_received(&self) -> u64 {
        self.state.lifetime_received()
    }

    fn shutdown(&self) {
        self.state.stop();
    }
}
