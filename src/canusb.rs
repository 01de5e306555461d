//! LAWICEL CANUSB back-end: the serial ASCII ("slcan") protocol.
//!
//! Protocol reference: http://www.can232.com/docs/can232_v3.pdf
//!
//! Frame records on the wire:
//!   Extended: `T<ID:8hex><DLC:1hex><DATA:2hex*DLC>[<TS:4hex>]\r`
//!   Standard: `t<ID:3hex><DLC:1hex><DATA:2hex*DLC>[<TS:4hex>]\r`
//! The device acks transmissions with `Z\r` / `z\r`. Records end in CR, or
//! BEL when the device signals an error.

use std::io::{Read, Write};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use embedded_can::Frame as _;
use enum_iterator::{all, Sequence};
use serialport::{ClearBuffer, SerialPort};
use tracing::{debug, warn};

use crate::frame::Frame;
use crate::transport::{Transport, TransportState, QUEUE_DELAY};
use crate::Error;

const CR: u8 = 0x0D;
const BEL: u8 = 0x07;

const OPEN_CMD: &[u8] = b"O\r";
const CLOSE_CMD: &[u8] = b"C\r";
const TIME_STAMP_CMD: &[u8] = b"Z1\r";

/// Prefixes reserved for command responses. Everything else that is not a
/// frame or remote record is malformed, so bus traffic can never be
/// mistaken for an ack.
const RESPONSE_HEADERS: &[u8] = b"zZVNF";

const MAX_BUFFER_SIZE: usize = 1000;
const READ_TIMEOUT: Duration = Duration::from_millis(20);
const WRITE_TIMEOUT: Duration = Duration::from_secs(5);

/// Supported bus bit rates and their `Sx` setup commands.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Sequence)]
pub enum BitRate {
    B10k,
    B20k,
    B50k,
    B100k,
    B125k,
    #[default]
    B250k,
    B500k,
    B800k,
    B1M,
}

impl BitRate {
    pub fn command(self) -> &'static [u8] {
        match self {
            BitRate::B10k => b"S0\r",
            BitRate::B20k => b"S1\r",
            BitRate::B50k => b"S2\r",
            BitRate::B100k => b"S3\r",
            BitRate::B125k => b"S4\r",
            BitRate::B250k => b"S5\r",
            BitRate::B500k => b"S6\r",
            BitRate::B800k => b"S7\r",
            BitRate::B1M => b"S8\r",
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            BitRate::B10k => "10K",
            BitRate::B20k => "20K",
            BitRate::B50k => "50K",
            BitRate::B100k => "100K",
            BitRate::B125k => "125K",
            BitRate::B250k => "250K",
            BitRate::B500k => "500K",
            BitRate::B800k => "800K",
            BitRate::B1M => "1M",
        }
    }

    /// Look up a rate by its configuration label, e.g. "250K" or "1M".
    pub fn from_label(label: &str) -> Option<Self> {
        all::<BitRate>().find(|rate| rate.label().eq_ignore_ascii_case(label))
    }
}

/// One parsed serial record.
#[derive(Debug, PartialEq, Eq)]
enum Record {
    Frame(Frame),
    /// Remote frames are recognized and dropped, not supported.
    Remote,
    /// A command response, stored for ack inspection.
    Response(Vec<u8>),
}

fn hex_val(digit: u8) -> Option<u32> {
    (digit as char).to_digit(16)
}

fn parse_hex(field: &[u8]) -> Option<u32> {
    field
        .iter()
        .try_fold(0u32, |acc, &d| Some(acc << 4 | hex_val(d)?))
}

/// Encode a frame as a transmit record, CR terminated.
fn encode_frame(frame: &Frame) -> Vec<u8> {
    let mut out = Vec::with_capacity(26);
    if frame.is_extended() {
        out.extend_from_slice(format!("T{:08X}", frame.raw_id() & 0x1FFF_FFFF).as_bytes());
    } else {
        out.extend_from_slice(format!("t{:03X}", frame.raw_id() & 0x7FF).as_bytes());
    }
    out.extend_from_slice(format!("{:X}", frame.dlc()).as_bytes());
    for byte in frame.data() {
        out.extend_from_slice(format!("{:02X}", byte).as_bytes());
    }
    out.push(CR);
    out
}

/// Parse one record (terminator already removed). `None` means malformed:
/// the caller discards it and keeps the worker alive.
fn parse_record(record: &[u8]) -> Option<Record> {
    let header = match record.first() {
        Some(&header) => header,
        None => return Some(Record::Response(Vec::new())),
    };
    let extended = match header {
        b'T' => true,
        b't' => false,
        b'r' | b'R' => return Some(Record::Remote),
        h if RESPONSE_HEADERS.contains(&h) => return Some(Record::Response(record.to_vec())),
        _ => return None,
    };

    let id_len = if extended { 8 } else { 3 };
    let body = &record[1..];
    if body.len() < id_len + 1 {
        return None;
    }
    let id_raw = parse_hex(&body[..id_len])?;
    let dlc = hex_val(body[id_len])? as usize;
    if dlc > 8 {
        return None;
    }

    let payload_field = &body[id_len + 1..];
    if payload_field.len() < dlc * 2 {
        return None;
    }
    let mut payload = [0u8; 8];
    for (i, pair) in payload_field[..dlc * 2].chunks_exact(2).enumerate() {
        payload[i] = parse_hex(pair)? as u8;
    }

    // Standard ids above 0x7FF fail StandardId construction and are
    // discarded here at the codec boundary.
    let frame = if extended {
        Frame::new_ext(id_raw, &payload[..dlc])?
    } else {
        Frame::new_std(u16::try_from(id_raw).ok()?, &payload[..dlc])?
    };

    // Optional trailing timestamp: exactly 4 hex digits of device
    // milliseconds. Anything else trailing is ignored, as the device may
    // have timestamps disabled.
    let trailer = &payload_field[dlc * 2..];
    if trailer.len() == 4 {
        let millis = parse_hex(trailer)?;
        return Some(Record::Frame(frame.with_timestamp(u64::from(millis) * 1000)));
    }
    Some(Record::Frame(frame))
}

/// Worker-side counters, readable from user threads.
#[derive(Default)]
struct LinkDiagnostics {
    io_errors: AtomicU64,
    device_errors: AtomicU64,
    malformed: AtomicU64,
    dropped: AtomicU64,
}

/// Configuration for [`CanUsb::open`].
#[derive(Clone, Debug)]
pub struct CanUsbConfig {
    pub com_port: String,
    pub com_baud: u32,
    pub bit_rate: BitRate,
}

impl CanUsbConfig {
    pub fn new(com_port: impl Into<String>) -> Self {
        Self {
            com_port: com_port.into(),
            com_baud: 115_200,
            bit_rate: BitRate::default(),
        }
    }
}

/// Transport over a LAWICEL CANUSB (or compatible slcan) serial adapter.
pub struct CanUsb {
    state: Arc<TransportState>,
    port: Arc<Mutex<Box<dyn SerialPort>>>,
    diag: Arc<LinkDiagnostics>,
    last_response: Arc<Mutex<Option<Vec<u8>>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl CanUsb {
    /// Open the adapter and bring the bus up.
    ///
    /// Sequence per the adapter manual: close the bus, five CRs to clear
    /// any half-entered command, flush input, enable timestamps, set the
    /// bit rate, open the bus.
    pub fn open(config: CanUsbConfig) -> Result<Self, Error> {
        let mut port = serialport::new(&config.com_port, config.com_baud)
            .timeout(WRITE_TIMEOUT)
            .open()?;

        port.write_all(CLOSE_CMD)?;
        for _ in 0..5 {
            port.write_all(b"\r")?;
        }
        port.clear(ClearBuffer::Input)?;
        port.write_all(TIME_STAMP_CMD)?;
        port.write_all(config.bit_rate.command())?;
        port.write_all(OPEN_CMD)?;

        let mut reader = port.try_clone()?;
        reader.set_timeout(READ_TIMEOUT)?;

        let state = Arc::new(TransportState::new(MAX_BUFFER_SIZE, MAX_BUFFER_SIZE));
        let port = Arc::new(Mutex::new(port));
        let diag = Arc::new(LinkDiagnostics::default());
        let last_response = Arc::new(Mutex::new(None));

        let tx_worker = {
            let state = state.clone();
            let port = port.clone();
            let diag = diag.clone();
            std::thread::Builder::new()
                .name("canusb-tx".into())
                .spawn(move || outbound_worker(&state, &port, &diag))?
        };
        let rx_worker = {
            let state = state.clone();
            let diag = diag.clone();
            let last_response = last_response.clone();
            std::thread::Builder::new()
                .name("canusb-rx".into())
                .spawn(move || inbound_worker(&state, reader, &diag, &last_response))?
        };

        Ok(Self {
            state,
            port,
            diag,
            last_response,
            workers: Mutex::new(vec![tx_worker, rx_worker]),
        })
    }

    /// Issue a raw command to the adapter.
    fn send_command(&self, cmd: &[u8]) -> bool {
        let mut port = self.port.lock().unwrap();
        match port.write_all(cmd) {
            Ok(()) => true,
            Err(err) => {
                self.diag.io_errors.fetch_add(1, Ordering::Relaxed);
                warn!("adapter command write failed: {err}");
                false
            }
        }
    }

    /// Open the bus (`O`).
    pub fn bus_on(&self) -> bool {
        self.send_command(OPEN_CMD)
    }

    /// Close the bus (`C`).
    pub fn bus_off(&self) -> bool {
        self.send_command(CLOSE_CMD)
    }

    /// Reprogram the bus bit rate. Takes effect on the next bus open.
    pub fn update_bus_parameters(&self, bit_rate: BitRate) -> bool {
        self.send_command(bit_rate.command())
    }

    /// The most recent non-frame record from the adapter (command ack or
    /// status), if any.
    pub fn last_response(&self) -> Option<Vec<u8>> {
        self.last_response.lock().unwrap().clone()
    }

    /// Serial/USB level failures observed by the workers.
    pub fn io_error_count(&self) -> u64 {
        self.diag.io_errors.load(Ordering::Relaxed)
    }

    /// BEL indications raised by the adapter.
    pub fn device_error_count(&self) -> u64 {
        self.diag.device_errors.load(Ordering::Relaxed)
    }

    /// Records discarded as unparseable.
    pub fn malformed_count(&self) -> u64 {
        self.diag.malformed.load(Ordering::Relaxed)
    }
}

impl Transport for CanUsb {
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
        self.bus_off();
    }
}

fn outbound_worker(
    state: &TransportState,
    port: &Mutex<Box<dyn SerialPort>>,
    diag: &LinkDiagnostics,
) {
    while state.is_running() {
        let frame = match state.outbound.get(QUEUE_DELAY) {
            Some(frame) => frame,
            None => continue,
        };
        let encoded = encode_frame(&frame);
        let result = port.lock().unwrap().write_all(&encoded);
        if let Err(err) = result {
            // A failed handoff is a dropped frame, never a dead worker
            diag.io_errors.fetch_add(1, Ordering::Relaxed);
            warn!("serial write failed, frame dropped: {err}");
        }
    }
}

fn inbound_worker(
    state: &TransportState,
    mut reader: Box<dyn SerialPort>,
    diag: &LinkDiagnostics,
    last_response: &Mutex<Option<Vec<u8>>>,
) {
    let mut rx_buffer: Vec<u8> = Vec::new();
    let mut chunk = [0u8; 256];
    while state.is_running() {
        match reader.read(&mut chunk) {
            Ok(0) => {}
            Ok(n) => {
                rx_buffer.extend_from_slice(&chunk[..n]);
                drain_records(&mut rx_buffer, state, diag, last_response);
            }
            Err(err) if err.kind() == std::io::ErrorKind::TimedOut => {}
            Err(err) => {
                diag.io_errors.fetch_add(1, Ordering::Relaxed);
                warn!("serial read failed: {err}");
                // Back off so a wedged port doesn't spin the worker
                std::thread::sleep(Duration::from_millis(50));
            }
        }
    }
}

fn drain_records(
    rx_buffer: &mut Vec<u8>,
    state: &TransportState,
    diag: &LinkDiagnostics,
    last_response: &Mutex<Option<Vec<u8>>>,
) {
    while let Some(pos) = rx_buffer.iter().position(|&b| b == CR || b == BEL) {
        let mut record: Vec<u8> = rx_buffer.drain(..=pos).collect();
        let terminator = record.pop();
        if record.is_empty() && terminator == Some(BEL) {
            diag.device_errors.fetch_add(1, Ordering::Relaxed);
            debug!("adapter raised BEL");
            continue;
        }
        match parse_record(&record) {
            Some(Record::Frame(frame)) => {
                if state.inbound.put(frame, QUEUE_DELAY).is_err() {
                    diag.dropped.fetch_add(1, Ordering::Relaxed);
                    warn!("inbound queue full, frame dropped");
                }
            }
            Some(Record::Remote) => {} // Not supported
            Some(Record::Response(response)) => {
                *last_response.lock().unwrap() = Some(response);
            }
            None => {
                diag.malformed.fetch_add(1, Ordering::Relaxed);
                debug!("discarding malformed record");
            }
        }
    }
}
