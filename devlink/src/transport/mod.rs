//! Byte-stream transports and the health-tracking channel built on them.
//!
//! ```text
//! +-------------------------------------------+
//! |   Engine (modes, correlator, parameters)  |
//! +---------------------+---------------------+
//!                       |
//!                       v
//! +---------------------+---------------------+
//! |  Channel: decoder + health + heartbeat    |
//! +---------------------+---------------------+
//!                       |
//!                       v
//! +-------------+-------------+---------------+
//! |  Serial VCP |   USB DFU   |   Simulated   |
//! | (serialport)|   (nusb)    |  (in-memory)  |
//! +-------------+-------------+---------------+
//! ```
//!
//! A [`Transport`] only moves bytes. The [`Channel`] owns one transport plus
//! the [`FrameDecoder`] for the active mode, and flags the link unhealthy on
//! read/write failure or on silence beyond the heartbeat window instead of
//! blocking forever.

#[cfg(feature = "dfu")]
pub mod dfu;
#[cfg(feature = "native")]
pub mod serial;

use std::fmt;
use std::time::{Duration, Instant};

use log::{debug, trace, warn};

use crate::error::{Error, Result};
use crate::protocol::decoder::{DecodeRules, Decoded, FrameDecoder};
use crate::protocol::text::{classify_reply, encode_line, Reply};
use crate::session::CancelToken;
use crate::stats::LinkStats;

/// Transport type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum TransportKind {
    /// Serial transport (UART bridge or USB CDC VCP).
    Serial,
    /// USB DFU class interface.
    UsbDfu,
    /// In-memory simulated device.
    Simulated,
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Serial => f.write_str("serial"),
            Self::UsbDfu => f.write_str("usb-dfu"),
            Self::Simulated => f.write_str("simulated"),
        }
    }
}

/// Ordered byte stream to a device with detectable loss.
///
/// `read` waits at most one poll interval and returns `Ok(0)` when nothing
/// arrived. An `Err` from `read` or `write` means the link is gone.
pub trait Transport: Send {
    /// Open (or reopen) the link.
    fn open(&mut self) -> Result<()>;

    /// Close the link. Closing a closed transport is a no-op.
    fn close(&mut self);

    /// Read available bytes into `buf`.
    fn read(&mut self, buf: &mut [u8]) -> Result<usize>;

    /// Write all of `data`.
    fn write(&mut self, data: &[u8]) -> Result<()>;

    /// Whether the link is open and has not reported a failure.
    fn is_healthy(&self) -> bool;

    /// Transport type.
    fn kind(&self) -> TransportKind;

    /// Human-readable endpoint name.
    fn name(&self) -> &str;
}

impl<T: Transport + ?Sized> Transport for Box<T> {
    fn open(&mut self) -> Result<()> {
        (**self).open()
    }

    fn close(&mut self) {
        (**self).close();
    }

    fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        (**self).read(buf)
    }

    fn write(&mut self, data: &[u8]) -> Result<()> {
        (**self).write(data)
    }

    fn is_healthy(&self) -> bool {
        (**self).is_healthy()
    }

    fn kind(&self) -> TransportKind {
        (**self).kind()
    }

    fn name(&self) -> &str {
        (**self).name()
    }
}

/// Serial port configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SerialConfig {
    /// Port name/path (e.g., "/dev/ttyUSB0", "COM3").
    pub port_name: String,
    /// Baud rate.
    pub baud_rate: u32,
    /// Read poll timeout.
    pub timeout: Duration,
    /// Data bits (typically 8).
    pub data_bits: DataBits,
    /// Parity (typically None).
    pub parity: Parity,
    /// Stop bits (typically One).
    pub stop_bits: StopBits,
    /// Flow control (typically None).
    pub flow_control: FlowControl,
}

impl Default for SerialConfig {
    fn default() -> Self {
        Self {
            port_name: String::new(),
            baud_rate: 115200,
            timeout: Duration::from_millis(20),
            data_bits: DataBits::Eight,
            parity: Parity::None,
            stop_bits: StopBits::One,
            flow_control: FlowControl::None,
        }
    }
}

impl SerialConfig {
    /// Create a new configuration with port name and baud rate.
    pub fn new(port_name: impl Into<String>, baud_rate: u32) -> Self {
        Self {
            port_name: port_name.into(),
            baud_rate,
            ..Default::default()
        }
    }

    /// Set the read poll timeout.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Set the parity.
    #[must_use]
    pub fn with_parity(mut self, parity: Parity) -> Self {
        self.parity = parity;
        self
    }
}

/// Number of data bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DataBits {
    /// 7 data bits.
    Seven,
    /// 8 data bits.
    #[default]
    Eight,
}

/// Parity checking mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Parity {
    /// No parity.
    #[default]
    None,
    /// Odd parity.
    Odd,
    /// Even parity.
    Even,
}

impl std::str::FromStr for Parity {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "none" | "n" => Ok(Self::None),
            "odd" | "o" => Ok(Self::Odd),
            "even" | "e" => Ok(Self::Even),
            other => Err(Error::Config(format!("unknown parity '{other}'"))),
        }
    }
}

/// Number of stop bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StopBits {
    /// 1 stop bit.
    #[default]
    One,
    /// 2 stop bits.
    Two,
}

/// Flow control mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FlowControl {
    /// No flow control.
    #[default]
    None,
    /// Hardware flow control (RTS/CTS).
    Hardware,
    /// Software flow control (XON/XOFF).
    Software,
}

/// USB DFU device selector.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DfuConfig {
    /// USB vendor ID.
    pub vid: u16,
    /// USB product ID.
    pub pid: u16,
    /// DFU interface number.
    pub interface: u8,
    /// Control transfer timeout.
    pub timeout: Duration,
}

impl DfuConfig {
    /// Select a device by VID/PID on interface 0.
    pub fn new(vid: u16, pid: u16) -> Self {
        Self {
            vid,
            pid,
            interface: 0,
            timeout: Duration::from_millis(500),
        }
    }
}

/// Which link to open.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportConfig {
    /// Serial VCP or UART bridge.
    Serial(SerialConfig),
    /// USB DFU interface.
    UsbDfu(DfuConfig),
}

impl TransportConfig {
    /// Transport type selected by this configuration.
    pub fn kind(&self) -> TransportKind {
        match self {
            Self::Serial(_) => TransportKind::Serial,
            Self::UsbDfu(_) => TransportKind::UsbDfu,
        }
    }
}

/// Build the transport selected by `config`. The transport is not opened.
pub fn create_transport(config: &TransportConfig) -> Result<Box<dyn Transport>> {
    match config {
        #[cfg(feature = "native")]
        TransportConfig::Serial(serial) => Ok(Box::new(serial::SerialTransport::new(serial.clone()))),
        #[cfg(not(feature = "native"))]
        TransportConfig::Serial(_) => Err(Error::Unsupported(
            "serial transport requires the `native` feature".to_string(),
        )),
        #[cfg(feature = "dfu")]
        TransportConfig::UsbDfu(dfu) => Ok(Box::new(dfu::DfuTransport::new(dfu.clone()))),
        #[cfg(not(feature = "dfu"))]
        TransportConfig::UsbDfu(_) => Err(Error::Unsupported(
            "USB DFU transport requires the `dfu` feature".to_string(),
        )),
    }
}

/// A transport plus the decoder for the active mode and link-health state.
pub struct Channel<T: Transport> {
    transport: T,
    decoder: FrameDecoder,
    heartbeat: Option<Duration>,
    last_activity: Instant,
    failed: bool,
    suspect: bool,
    read_buf: Vec<u8>,
    stats: LinkStats,
}

impl<T: Transport> Channel<T> {
    /// Wrap `transport`. `heartbeat` bounds tolerated silence in binary modes.
    pub fn new(transport: T, decoder: FrameDecoder, heartbeat: Option<Duration>) -> Self {
        Self {
            transport,
            decoder,
            heartbeat,
            last_activity: Instant::now(),
            failed: false,
            suspect: false,
            read_buf: vec![0u8; 512],
            stats: LinkStats::default(),
        }
    }

    /// Open the underlying transport and start with a clean decoder.
    pub fn open(&mut self) -> Result<()> {
        debug!(
            "Opening {} transport {}",
            self.transport.kind(),
            self.transport.name()
        );
        self.transport.open()?;
        self.decoder.reset();
        self.failed = false;
        self.suspect = false;
        self.last_activity = Instant::now();
        Ok(())
    }

    /// Close the underlying transport.
    pub fn close(&mut self) {
        self.transport.close();
        self.decoder.reset();
    }

    /// Write raw bytes. A failure marks the channel failed.
    pub fn write(&mut self, data: &[u8]) -> Result<()> {
        trace!("TX {} bytes: {data:02X?}", data.len());
        match self.transport.write(data) {
            Ok(()) => {
                self.stats.bytes_sent += data.len() as u64;
                if self.decoder.rules() == DecodeRules::Frames {
                    self.stats.frames_sent += 1;
                }
                Ok(())
            },
            Err(e) => {
                warn!("Write to {} failed: {e}", self.transport.name());
                self.failed = true;
                self.stats.errors += 1;
                Err(e)
            },
        }
    }

    /// Send one text command with the line terminator.
    pub fn send_line(&mut self, text: &str) -> Result<()> {
        self.write(&encode_line(text))?;
        self.stats.lines_sent += 1;
        Ok(())
    }

    /// Read once (waiting at most one poll interval) and decode.
    ///
    /// Also reports partial frames that outlived the inter-byte deadline.
    pub fn poll(&mut self) -> Result<Vec<Decoded>> {
        let n = match self.transport.read(&mut self.read_buf) {
            Ok(n) => n,
            Err(e) => {
                warn!("Read from {} failed: {e}", self.transport.name());
                self.failed = true;
                self.stats.errors += 1;
                return Err(e);
            },
        };

        let now = Instant::now();
        let decoded: Vec<Decoded> = if n > 0 {
            trace!("RX {n} bytes: {:02X?}", &self.read_buf[..n]);
            self.last_activity = now;
            self.stats.bytes_received += n as u64;
            self.decoder.feed(&self.read_buf[..n], now)
        } else {
            self.decoder.expire(now).into_iter().collect()
        };
        self.stats.record_decoded(&decoded);
        Ok(decoded)
    }

    /// Read text lines until `accept` returns a value or `timeout` passes.
    ///
    /// Lines `accept` declines are handed to `other`.
    pub fn await_line<R>(
        &mut self,
        timeout: Duration,
        cancel: &CancelToken,
        mut accept: impl FnMut(&str) -> Option<R>,
        mut other: impl FnMut(String),
    ) -> Result<R> {
        let deadline = Instant::now() + timeout;
        loop {
            if cancel.is_cancelled() {
                return Err(Error::Cancelled { sequence: None });
            }
            for item in self.poll()? {
                match item {
                    Decoded::Line(line) => {
                        if let Some(result) = accept(&line) {
                            return Ok(result);
                        }
                        other(line);
                    },
                    Decoded::Error(e) => warn!("Discarding malformed text: {e}"),
                    Decoded::Frame(f) => debug!("Ignoring binary frame in text mode: {f:?}"),
                }
            }
            if Instant::now() >= deadline {
                return Err(Error::Timeout {
                    sequence: None,
                    attempts: 1,
                });
            }
        }
    }

    /// Send a text command and wait for its `OK`/`ERR` acknowledgement.
    pub fn command(
        &mut self,
        text: &str,
        timeout: Duration,
        cancel: &CancelToken,
        other: impl FnMut(String),
    ) -> Result<Reply> {
        self.send_line(text)?;
        self.await_line(timeout, cancel, classify_reply, other)
    }

    /// Swap the framing ruleset.
    pub fn set_rules(&mut self, rules: DecodeRules) {
        self.decoder.set_rules(rules);
        self.last_activity = Instant::now();
    }

    /// Active framing ruleset.
    pub fn rules(&self) -> DecodeRules {
        self.decoder.rules()
    }

    /// Whether a read or write failed since the last open.
    pub fn is_failed(&self) -> bool {
        self.failed || !self.transport.is_healthy()
    }

    /// Mark the link as suspect after a timeout or framing failure.
    pub fn mark_suspect(&mut self) {
        self.suspect = true;
    }

    /// Take and clear the suspect flag.
    pub fn take_suspect(&mut self) -> bool {
        std::mem::take(&mut self.suspect)
    }

    /// Count a request timeout or retry.
    pub fn note_warning(&mut self) {
        self.stats.warnings += 1;
    }

    /// Count a successful reconnect.
    pub fn note_reconnect(&mut self) {
        self.stats.reconnects += 1;
    }

    /// Traffic and error counters.
    pub fn stats(&self) -> LinkStats {
        self.stats
    }

    /// Time since bytes last arrived.
    pub fn idle_for(&self) -> Duration {
        self.last_activity.elapsed()
    }

    /// Heartbeat window, if enabled.
    pub fn heartbeat(&self) -> Option<Duration> {
        self.heartbeat
    }

    /// Whether the link is usable.
    ///
    /// Silence only counts against binary modes, where the engine keeps
    /// traffic flowing with pings.
    pub fn is_healthy(&self) -> bool {
        if self.failed || !self.transport.is_healthy() {
            return false;
        }
        match (self.decoder.rules(), self.heartbeat) {
            (DecodeRules::Frames, Some(window)) => self.idle_for() <= window,
            _ => true,
        }
    }

    /// The underlying transport.
    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// The underlying transport, mutably.
    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }
}
