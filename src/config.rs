//! Back-end selection from a configuration file.
//!
//! The file names one driver under `[defaults]` and carries one optional
//! table of parameters per driver:
//!
//! ```toml
//! [defaults]
//! selection = "CANUSB"
//! loopback = false
//!
//! [CANUSB]
//! com_port = "/dev/ttyUSB0"
//! com_baud = 115200
//! bit_rate = "250K"
//! ```

use std::path::Path;
use std::sync::Arc;

use serde::Deserialize;

use crate::bus::CanBus;
use crate::canusb::{BitRate, CanUsb, CanUsbConfig};
use crate::sim::{SimCan, SimCanConfig};
use crate::transport::Transport;
use crate::Error;

#[derive(Debug, Deserialize)]
struct ConfigFile {
    defaults: Defaults,
    #[serde(rename = "CANUSB")]
    canusb: Option<CanUsbSection>,
    #[serde(rename = "SIM_CAN")]
    sim_can: Option<SimCanSection>,
    #[serde(rename = "Kvaser")]
    kvaser: Option<KvaserSection>,
}

#[derive(Debug, Deserialize)]
struct Defaults {
    selection: String,
    #[serde(default)]
    loopback: bool,
}

#[derive(Debug, Default, Deserialize)]
struct CanUsbSection {
    com_port: Option<String>,
    com_baud: Option<u32>,
    bit_rate: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct SimCanSection {
    /// Seconds between generated inbound frames.
    inbound_time: Option<f64>,
}

#[derive(Debug, Default, Deserialize)]
#[allow(dead_code)] // read on Windows builds only
struct KvaserSection {
    baud: Option<i64>,
    tseg1: Option<u32>,
    tseg2: Option<u32>,
    sjw: Option<u32>,
    sample_count: Option<u32>,
}

/// Open the bus described by the given configuration file.
pub fn open(path: impl AsRef<Path>) -> Result<CanBus, Error> {
    let text = std::fs::read_to_string(path)?;
    open_str(&text)
}

/// Same as [`open`], from configuration text already in memory.
pub fn open_str(text: &str) -> Result<CanBus, Error> {
    let file: ConfigFile = toml::from_str(text)?;
    let loopback = file.defaults.loopback;
    let transport = build_driver(&file)?;
    Ok(CanBus::new(transport, loopback))
}

fn build_driver(file: &ConfigFile) -> Result<Arc<dyn Transport>, Error> {
    match file.defaults.selection.as_str() {
        "CANUSB" => {
            let section = file.canusb.as_ref();
            let com_port = section
                .and_then(|s| s.com_port.clone())
                .ok_or_else(|| Error::Config("CANUSB requires com_port".into()))?;
            let mut config = CanUsbConfig::new(com_port);
            if let Some(baud) = section.and_then(|s| s.com_baud) {
                config.com_baud = baud;
            }
            if let Some(label) = section.and_then(|s| s.bit_rate.as_deref()) {
                config.bit_rate = BitRate::from_label(label)
                    .ok_or_else(|| Error::Config(format!("unknown bit rate `{label}`")))?;
            }
            Ok(Arc::new(CanUsb::open(config)?))
        }
        "SIM_CAN" => {
            let mut config = SimCanConfig::default();
            if let Some(seconds) = file.sim_can.as_ref().and_then(|s| s.inbound_time) {
                if !(seconds > 0.0) {
                    return Err(Error::Config("inbound_time must be positive".into()));
                }
                config.inbound_time = std::time::Duration::from_secs_f64(seconds);
            }
            Ok(Arc::new(SimCan::open(config)?))
        }
        "Kvaser" => build_kvaser(file),
        other => Err(Error::UnknownDriver(other.to_owned())),
    }
}

#[cfg(windows)]
fn build_kvaser(file: &ConfigFile) -> Result<Arc<dyn Transport>, Error> {
    use crate::kvaser::{Kvaser, KvaserConfig};

    let mut config = KvaserConfig::default();
    if let Some(section) = file.kvaser.as_ref() {
        if let Some(baud) = section.baud {
            config.baud = baud;
        }
        if let Some(tseg1) = section.tseg1 {
            config.tseg1 = tseg1;
        }
        if let Some(tseg2) = section.tseg2 {
            config.tseg2 = tseg2;
        }
        if let Some(sjw) = section.sjw {
            config.sjw = sjw;
        }
        if let Some(sample_count) = section.sample_count {
            config.sample_count = sample_count;
        }
    }
    Ok(Arc::new(Kvaser::open(config)?))
}

#[cfg(not(windows))]
fn build_kvaser(_file: &ConfigFile) -> Result<Arc<dyn Transport>, Error> {
    Err(Error::Config(
        "Kvaser back-end requires the Windows canlib driver stack".into(),
    ))
}
