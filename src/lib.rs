//! Hardware-agnostic CAN bus access.
//!
//! One interface for transmitting and receiving CAN frames, driving cyclic
//! transmissions at fixed rates, and dispatching inbound frames to
//! subscriber callbacks, over interchangeable back-ends: a LAWICEL CANUSB
//! serial adapter, the Kvaser canlib stack (Windows), or a simulated bus.
//!
//! ```no_run
//! use canlink::{CanBus, Frame, SimCan, SimCanConfig};
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! # fn main() -> Result<(), canlink::Error> {
//! let transport = Arc::new(SimCan::open(SimCanConfig::default())?);
//! let bus = CanBus::new(transport, false);
//!
//! let heartbeat = Frame::new_std(0x123, &[0x01]).unwrap();
//! bus.add_cyclic_message(heartbeat, Duration::from_millis(100), None);
//!
//! let frame = bus.next_message(Some(Duration::from_secs(1)));
//! bus.shutdown();
//! # Ok(())
//! # }
//! ```

use thiserror::Error as ThisError;

pub mod bus;
pub mod can_queue;
pub mod canusb;
pub mod config;
pub mod cyclic;
pub mod dispatch;
pub mod frame;
#[cfg(windows)]
pub mod kvaser;
pub mod mock;
pub mod sim;
pub mod transport;

pub use bus::CanBus;
pub use can_queue::FrameQueue;
pub use canusb::{BitRate, CanUsb, CanUsbConfig};
pub use cyclic::CyclicKey;
pub use dispatch::{HandlerId, RxFilter};
pub use frame::{Frame, IdMaskFilter};
#[cfg(windows)]
pub use kvaser::{Kvaser, KvaserConfig};
pub use mock::MockTransport;
pub use sim::{SimCan, SimCanConfig};
pub use transport::Transport;

/// Construction-time failures.
///
/// Once a bus is up, nothing returns an error: runtime trouble surfaces as
/// `false`/`None` results and diagnostic counters, and worker threads log
/// and carry on.
#[derive(Debug, ThisError)]
pub enum Error {
    #[error("serial port: {0}")]
    Serial(#[from] serialport::Error),

    #[error("i/o: {0}")]
    Io(#[from] std::io::Error),

    #[error("config parse: {0}")]
    ConfigParse(#[from] toml::de::Error),

    #[error("config: {0}")]
    Config(String),

    #[error("unknown driver selection `{0}`")]
    UnknownDriver(String),

    /// Nonzero status from the vendor library.
    #[cfg(windows)]
    #[error("canlib status {0}")]
    Canlib(i32),
}
