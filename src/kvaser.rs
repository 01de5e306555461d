//! Kvaser USB back-end over the vendor `canlib32` DLL.
//!
//! Windows only, like the vendor driver stack. Tested against a Leaf Light;
//! channel 0 is hard-wired for now.

#![allow(non_snake_case)]

use std::os::raw::{c_int, c_long, c_uint, c_ulong, c_void};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use embedded_can::Frame as _;
use tracing::warn;

use crate::frame::Frame;
use crate::transport::{Transport, TransportState, QUEUE_DELAY};
use crate::Error;

const MAX_BUFFER_SIZE: usize = 1000;
const CAN_TX_TIMEOUT_MS: c_ulong = 100;
const CAN_RX_TIMEOUT_MS: c_ulong = 100;

// Message flag bits reported by canReadWait
const CANMSG_STD: c_uint = 1 << 1;
const CANMSG_EXT: c_uint = 1 << 2;

const CAN_OK: c_int = 0;

#[link(name = "canlib32")]
extern "system" {
    fn canInitializeLibrary();
    fn canOpenChannel(channel: c_int, flags: c_int) -> c_int;
    fn canBusOn(handle: c_int) -> c_int;
    fn canBusOff(handle: c_int) -> c_int;
    fn canClose(handle: c_int) -> c_int;
    fn canFlushReceiveQueue(handle: c_int) -> c_int;
    fn canFlushTransmitQueue(handle: c_int) -> c_int;
    fn canSetBusParams(
        handle: c_int,
        freq: c_long,
        tseg1: c_uint,
        tseg2: c_uint,
        sjw: c_uint,
        noSamp: c_uint,
        syncmode: c_uint,
    ) -> c_int;
    fn canWriteWait(
        handle: c_int,
        id: c_long,
        msg: *const c_void,
        dlc: c_uint,
        flag: c_uint,
        timeout: c_ulong,
    ) -> c_int;
    fn canReadWait(
        handle: c_int,
        id: *mut c_long,
        msg: *mut c_void,
        dlc: *mut c_uint,
        flag: *mut c_uint,
        time: *mut c_ulong,
        timeout: c_ulong,
    ) -> c_int;
}

/// Bus timing parameters for [`Kvaser::open`]. Defaults give 250k with a
/// 75% sample point.
#[derive(Clone, Debug)]
pub struct KvaserConfig {
    pub baud: i64,
    pub tseg1: u32,
    pub tseg2: u32,
    pub sjw: u32,
    pub sample_count: u32,
}

impl Default for KvaserConfig {
    fn default() -> Self {
        Self {
            baud: 250_000,
            tseg1: 5,
            tseg2: 2,
            sjw: 2,
            sample_count: 1,
        }
    }
}

pub struct Kvaser {
    state: Arc<TransportState>,
    handle: c_int,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl Kvaser {
    pub fn open(config: KvaserConfig) -> Result<Self, Error> {
        let handle = unsafe {
            canInitializeLibrary();
            let handle = canOpenChannel(0, 0);
            if handle < 0 {
                return Err(Error::Canlib(handle));
            }
            let status = canSetBusParams(
                handle,
                config.baud as c_long,
                config.tseg1,
                config.tseg2,
                config.sjw,
                config.sample_count,
                0,
            );
            if status != CAN_OK {
                canClose(handle);
                return Err(Error::Canlib(status));
            }
            let status = canBusOn(handle);
            if status != CAN_OK {
                canClose(handle);
                return Err(Error::Canlib(status));
            }
            canFlushReceiveQueue(handle);
            canFlushTransmitQueue(handle);
            handle
        };

        let state = Arc::new(TransportState::new(MAX_BUFFER_SIZE, MAX_BUFFER_SIZE));

        let tx_worker = {
            let state = state.clone();
            std::thread::Builder::new()
                .name("kvaser-tx".into())
                .spawn(move || outbound_worker(&state, handle))?
        };
        let rx_worker = {
            let state = state.clone();
            std::thread::Builder::new()
                .name("kvaser-rx".into())
                .spawn(move || inbound_worker(&state, handle))?
        };

        Ok(Self {
            state,
            handle,
            workers: Mutex::new(vec![tx_worker, rx_worker]),
        })
    }
}

fn outbound_worker(state: &TransportState, handle: c_int) {
    while state.is_running() {
        let frame = match state.outbound.get(QUEUE_DELAY) {
            Some(frame) => frame,
            None => continue,
        };
        let flag = if frame.is_extended() {
            CANMSG_EXT
        } else {
            CANMSG_STD
        };
        let status = unsafe {
            canWriteWait(
                handle,
                frame.raw_id() as c_long,
                frame.data().as_ptr() as *const c_void,
                frame.dlc() as c_uint,
                flag,
                CAN_TX_TIMEOUT_MS,
            )
        };
        if status != CAN_OK {
            warn!("canWriteWait status {status}, frame dropped");
        }
    }
}

fn inbound_worker(state: &TransportState, handle: c_int) {
    while state.is_running() {
        let mut id: c_long = 0;
        let mut data = [0u8; 8];
        let mut dlc: c_uint = 0;
        let mut flags: c_uint = 0;
        let mut time: c_ulong = 0;
        let status = unsafe {
            canReadWait(
                handle,
                &mut id,
                data.as_mut_ptr() as *mut c_void,
                &mut dlc,
                &mut flags,
                &mut time,
                CAN_RX_TIMEOUT_MS,
            )
        };
        if status != CAN_OK {
            // Timeouts land here too; real errors are not fatal either way
            continue;
        }
        let dlc = (dlc as usize).min(8);
        let frame = if flags & CANMSG_EXT != 0 {
            Frame::new_ext(id as u32, &data[..dlc])
        } else if flags & CANMSG_STD != 0 {
            Frame::new_std(id as u16, &data[..dlc])
        } else {
            None // Error frames and other unsupported types
        };
        if let Some(frame) = frame {
            let frame = frame.with_timestamp(u64::from(time) * 1000);
            if state.inbound.put(frame, QUEUE_DELAY).is_err() {
                warn!("inbound queue full, frame dropped");
            }
        }
    }
}

impl Transport for Kvaser {
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
        unsafe {
            canBusOff(self.handle);
            canClose(self.handle);
        }
    }
}
