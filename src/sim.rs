//! Simulated bus back-end: deterministic traffic, no hardware.

use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use tracing::trace;

use crate::frame::Frame;
use crate::transport::{Transport, TransportState, QUEUE_DELAY};
use crate::Error;

const MAX_BUFFER_SIZE: usize = 1000;
const UNIQUE_SIM_MESSAGES: u32 = 8;
const SIM_PAYLOAD_SIZE: usize = 8;
const DEFAULT_SIM_RX_RATE: Duration = Duration::from_millis(10);
const CAN_TX_SEND_DELAY: Duration = Duration::from_micros(500);

#[derive(Clone, Debug)]
pub struct SimCanConfig {
    /// Delay between generated inbound frames.
    pub inbound_time: Duration,
    /// Modeled transmit latency per outbound frame.
    pub tx_latency: Duration,
}

impl Default for SimCanConfig {
    fn default() -> Self {
        Self {
            inbound_time: DEFAULT_SIM_RX_RATE,
            tx_latency: CAN_TX_SEND_DELAY,
        }
    }
}

/// Fake CAN interface producing a rotating set of known frames.
///
/// Inbound traffic cycles through extended ids 0..8, each carrying payload
/// bytes 0..8, one frame per `inbound_time`. Outbound frames are consumed
/// after `tx_latency` and logged.
pub struct SimCan {
    state: Arc<TransportState>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl SimCan {
    pub fn open(config: SimCanConfig) -> Result<Self, Error> {
        let state = Arc::new(TransportState::new(MAX_BUFFER_SIZE, MAX_BUFFER_SIZE));

        let tx_worker = {
            let state = state.clone();
            let latency = config.tx_latency;
            std::thread::Builder::new()
                .name("sim-can-tx".into())
                .spawn(move || {
                    while state.is_running() {
                        if let Some(frame) = state.outbound.get(QUEUE_DELAY) {
                            std::thread::sleep(latency);
                            trace!("sim tx {frame}");
                        }
                    }
                })?
        };
        let rx_worker = {
            let state = state.clone();
            let delay = config.inbound_time;
            std::thread::Builder::new()
                .name("sim-can-rx".into())
                .spawn(move || {
                    let known = known_messages();
                    let mut index = 0usize;
                    while state.is_running() {
                        std::thread::sleep(delay);
                        if state.inbound.try_put(known[index].clone()).is_err() {
                            trace!("sim rx overflow, frame dropped");
                        }
                        index = (index + 1) % known.len();
                    }
                })?
        };

        Ok(Self {
            state,
            workers: Mutex::new(vec![tx_worker, rx_worker]),
        })
    }
}

fn known_messages() -> Vec<Frame> {
    let payload: Vec<u8> = (0..SIM_PAYLOAD_SIZE as u8).collect();
    (0..UNIQUE_SIM_MESSAGES)
        .map(|id| Frame::new_ext(id, &payload).expect("sim ids are in range"))
        .collect()
}

impl Transport for SimCan {
    fn send(&self, frame: Frame, timeout: Option<Duration>) -> bool {
        self.state.send(frame, timeout)
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
        for worker in self.workers.lock().unwrap().drain(..) {
            let _ = worker.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use embedded_can::Frame as _;

    #[test]
    fn known_traffic_rotates_through_eight_ids() {
        let known = known_messages();
        assert_eq!(known.len(), 8);
        for (id, frame) in known.iter().enumerate() {
            assert_eq!(frame.raw_id(), id as u32);
            assert!(frame.is_extended());
            assert_eq!(frame.data(), &[0, 1, 2, 3, 4, 5, 6, 7]);
        }
    }

    #[test]
    fn generates_inbound_traffic_in_order() {
        let sim = SimCan::open(SimCanConfig {
            inbound_time: Duration::from_millis(1),
            tx_latency: Duration::ZERO,
        })
        .unwrap();
        for expected_id in 0..8u32 {
            let frame = sim.next_message(Some(Duration::from_secs(1))).unwrap();
            assert_eq!(frame.raw_id(), expected_id);
        }
        sim.shutdown();
    }
}
