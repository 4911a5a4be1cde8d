//! In-memory simulated device.
//!
//! [`SimulatedDevice`] implements [`Transport`] and answers like real
//! firmware: the text console (`version`, `par_print`, `mode par|boot`,
//! `status`, `help`), the binary parameter protocol and the bootloader. A
//! cloned [`SimHandle`] shares its state so tests can inspect what the host
//! sent and inject faults while an engine owns the transport.
//!
//! Pulling the link (`set_link_down(true)`) behaves like a device reset:
//! the device comes back in CLI mode with any partial upgrade discarded.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread;
use std::time::{Duration, Instant};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use log::{debug, trace};
use sha2::{Digest, Sha256};

use crate::error::{Error, Result};
use crate::image::ImageHeader;
use crate::mode::Mode;
use crate::param::schema::render_listing;
use crate::param::{
    Access, Parameter, ParameterTable, ParameterType, ParameterValue, Persistence, Range,
};
use crate::protocol::decoder::{DecodeRules, Decoded, FrameDecoder};
use crate::protocol::text::{LINE_TERMINATOR, SCHEMA_COMMAND, VERSION_COMMAND};
use crate::protocol::{Command, Frame, Status};
use crate::transport::{Transport, TransportKind};
use crate::version::DeviceVersion;

const IDLE_POLL: Duration = Duration::from_millis(1);

/// Parameter table the simulated firmware starts with.
pub fn default_table() -> ParameterTable {
    let params = vec![
        Parameter::new(1, "gain", ParameterType::Integer)
            .with_group("Control")
            .with_range(Range::new(0.0, 1000.0))
            .with_value(ParameterValue::Integer(10)),
        Parameter::new(2, "threshold", ParameterType::Float)
            .with_group("Control")
            .with_range(Range::new(0.0, 10.0))
            .with_value(ParameterValue::Float(0.5)),
        Parameter::new(3, "trigger", ParameterType::Boolean)
            .with_group("Control")
            .with_persistence(Persistence::Volatile)
            .with_value(ParameterValue::Boolean(false)),
        Parameter::new(
            4,
            "filter",
            ParameterType::Enumerated(vec!["off".into(), "low".into(), "high".into()]),
        )
        .with_group("Control")
        .with_value(ParameterValue::Enumerated(1)),
        Parameter::new(10, "serial", ParameterType::String)
            .with_group("Device")
            .with_access(Access::ReadOnly)
            .with_value(ParameterValue::String("DL-0001".into())),
        Parameter::new(11, "passcode", ParameterType::Integer)
            .with_group("Device")
            .with_access(Access::WriteOnly),
        Parameter::new(12, "uptime", ParameterType::Integer)
            .with_group("Device")
            .with_access(Access::ReadOnly)
            .with_persistence(Persistence::Volatile)
            .with_value(ParameterValue::Integer(0)),
    ];
    let mut table = ParameterTable::new();
    for mut param in params {
        param.unit = match param.name.as_str() {
            "threshold" => "V".to_string(),
            "uptime" => "s".to_string(),
            _ => String::new(),
        };
        // Ids above are unique.
        let _ = table.insert(param);
    }
    table
}

#[derive(Debug, Default)]
struct Bootloader {
    handshake: Option<Command>,
    expected: u32,
    header: Option<ImageHeader>,
    erased: bool,
    staged: Vec<u8>,
    verified: bool,
}

#[derive(Debug)]
struct SimState {
    version: String,
    mode: Mode,
    open: bool,
    link_down: bool,
    silent: bool,
    refuse_mode_switch: bool,
    refuse_opens: u32,
    drop_responses: u32,
    corrupt_responses: u32,
    drop_link_on: Option<Command>,
    rejects: HashMap<u16, Status>,
    chunk_limit: Option<usize>,
    table: ParameterTable,
    decoder: FrameDecoder,
    outbox: VecDeque<u8>,
    received: Vec<Frame>,
    lines: Vec<String>,
    boot: Bootloader,
    installed: Option<Vec<u8>>,
    started: Instant,
}

impl SimState {
    fn new(version: &str) -> Self {
        Self {
            version: version.to_string(),
            mode: Mode::Cli,
            open: false,
            link_down: false,
            silent: false,
            refuse_mode_switch: false,
            refuse_opens: 0,
            drop_responses: 0,
            corrupt_responses: 0,
            drop_link_on: None,
            rejects: HashMap::new(),
            chunk_limit: None,
            table: default_table(),
            decoder: FrameDecoder::with_rules(DecodeRules::Lines),
            outbox: VecDeque::new(),
            received: Vec::new(),
            lines: Vec::new(),
            boot: Bootloader::default(),
            installed: None,
            started: Instant::now(),
        }
    }

    fn device_version(&self) -> Option<DeviceVersion> {
        DeviceVersion::parse(&self.version).ok()
    }

    fn enter(&mut self, mode: Mode) {
        debug!("Simulated device enters {mode} mode");
        self.mode = mode;
        self.decoder.set_rules(mode.rules());
        if mode != Mode::Bootloader {
            self.boot = Bootloader::default();
        }
    }

    fn reset(&mut self) {
        self.enter(Mode::Cli);
        self.outbox.clear();
    }

    fn say(&mut self, line: &str) {
        if self.silent {
            return;
        }
        self.outbox.extend(line.as_bytes());
        self.outbox.extend(LINE_TERMINATOR.as_bytes());
    }

    fn receive(&mut self, bytes: &[u8]) {
        for item in self.decoder.feed(bytes, Instant::now()) {
            match item {
                Decoded::Line(line) => self.handle_line(&line),
                Decoded::Frame(frame) => self.handle_frame(frame),
                Decoded::Error(e) => debug!("Simulated device discards input: {e}"),
            }
            if self.link_down {
                break;
            }
        }
    }

    fn handle_line(&mut self, line: &str) {
        let line = line.trim();
        trace!("Simulated device got line {line:?}");
        self.lines.push(line.to_string());
        match line {
            "" => {},
            VERSION_COMMAND => {
                let banner = format!("CLI v{}", self.version);
                self.say(&banner);
            },
            SCHEMA_COMMAND => {
                let Some(version) = self.device_version() else {
                    self.say("ERR no listing");
                    return;
                };
                for entry in render_listing(&self.table, version.schema_format()) {
                    self.say(&entry);
                }
            },
            "mode par" | "mode boot" => {
                let target = if line == "mode par" {
                    Mode::Parameter
                } else {
                    Mode::Bootloader
                };
                let supported = self
                    .device_version()
                    .is_some_and(|v| v.check_mode(target).is_ok());
                if self.refuse_mode_switch {
                    self.say("ERR mode switch refused");
                } else if !supported {
                    self.say("ERR unknown mode");
                } else {
                    self.say("OK");
                    self.enter(target);
                }
            },
            "status" => {
                let uptime = self.started.elapsed().as_secs();
                let text = format!("status: ok, uptime {uptime}s");
                self.say(&text);
            },
            "help" => {
                for text in ["commands:", "  version", "  par_print", "  mode par|boot", "  status"] {
                    self.say(text);
                }
            },
            other => {
                let text = format!("ERR unknown command '{other}'");
                self.say(&text);
            },
        }
    }

    fn handle_frame(&mut self, frame: Frame) {
        trace!(
            "Simulated device got frame cmd={:#04x} seq={}",
            frame.command, frame.sequence
        );
        self.received.push(frame.clone());
        let Some(command) = frame.command() else {
            self.respond(&frame, Status::UnsupportedCommand, &[], None);
            return;
        };
        if self.drop_link_on == Some(command) {
            debug!("Simulated device drops the link on {command}");
            self.link_down = true;
            self.reset();
            return;
        }
        if frame.mode() != Some(self.mode)
            || command
                .required_mode()
                .is_some_and(|m| m != self.mode)
        {
            self.respond(&frame, Status::UnsupportedCommand, &[], None);
            return;
        }

        let mut next_mode = None;
        let (status, body) = match command {
            Command::ReadParameter => self.read_parameter(&frame.payload),
            Command::WriteParameter => self.write_parameter(&frame.payload),
            Command::Install | Command::Prepare => self.begin_install(command, &frame.payload),
            Command::Erase => self.erase(&frame.payload),
            Command::Data => self.data(&frame.payload),
            Command::Verify => self.verify(&frame.payload),
            Command::Commit => self.commit(),
            Command::Abort => {
                self.boot = Bootloader::default();
                (Status::Ok, Vec::new())
            },
            Command::SwitchMode => match frame.payload.first().copied().and_then(Mode::from_tag) {
                Some(_) if self.refuse_mode_switch => (Status::Error, Vec::new()),
                Some(target) => {
                    next_mode = Some(target);
                    (Status::Ok, Vec::new())
                },
                None => (Status::Malformed, Vec::new()),
            },
            Command::Ping => (Status::Ok, Vec::new()),
        };
        self.respond(&frame, status, &body, next_mode);
    }

    fn respond(&mut self, request: &Frame, status: Status, body: &[u8], next_mode: Option<Mode>) {
        if self.drop_responses > 0 {
            self.drop_responses -= 1;
            debug!("Simulated device drops response seq {}", request.sequence);
        } else if !self.silent {
            let mut bytes = Frame::response(request, status, body).encode();
            if self.corrupt_responses > 0 {
                self.corrupt_responses -= 1;
                if let Some(crc) = bytes.last_mut() {
                    *crc ^= 0xFF;
                }
            }
            self.outbox.extend(bytes);
        }
        if let Some(mode) = next_mode {
            self.enter(mode);
        }
    }

    fn read_parameter(&mut self, payload: &[u8]) -> (Status, Vec<u8>) {
        let mut cur = payload;
        let Ok(id) = cur.read_u16::<LittleEndian>() else {
            return (Status::Malformed, Vec::new());
        };
        if let Some(status) = self.rejects.get(&id) {
            return (*status, Vec::new());
        }
        let Some(param) = self.table.get(id) else {
            return (Status::UnsupportedParameter, Vec::new());
        };
        if !param.access.is_readable() {
            return (Status::NotAuthorized, Vec::new());
        }
        let value = if param.name == "uptime" {
            let secs = i32::try_from(self.started.elapsed().as_secs()).unwrap_or(i32::MAX);
            ParameterValue::Integer(secs)
        } else {
            match param.value() {
                Some(value) => value.clone(),
                None => return (Status::InvalidValue, Vec::new()),
            }
        };
        (Status::Ok, value_body(id, &value))
    }

    fn write_parameter(&mut self, payload: &[u8]) -> (Status, Vec<u8>) {
        let mut cur = payload;
        let (Ok(id), Ok(_persist)) = (cur.read_u16::<LittleEndian>(), cur.read_u8()) else {
            return (Status::Malformed, Vec::new());
        };
        if let Some(status) = self.rejects.get(&id) {
            return (*status, Vec::new());
        }
        let Some(param) = self.table.get_mut(id) else {
            return (Status::UnsupportedParameter, Vec::new());
        };
        if !param.access.is_writable() {
            return (Status::NotAuthorized, Vec::new());
        }
        let Ok((value, _)) = ParameterValue::decode(&param.kind, cur) else {
            return (Status::InvalidDataType, Vec::new());
        };
        if param.check_value(&value).is_err() {
            return (Status::InvalidValue, Vec::new());
        }
        param.record_confirmed(value.clone());
        (Status::Ok, value_body(id, &value))
    }

    fn begin_install(&mut self, command: Command, payload: &[u8]) -> (Status, Vec<u8>) {
        let legacy = self
            .device_version()
            .is_none_or(|v| v.is_legacy());
        let (expected, header) = match command {
            Command::Install if legacy => {
                let mut cur = payload;
                let Ok(size) = cur.read_u32::<LittleEndian>() else {
                    return (Status::Malformed, Vec::new());
                };
                (size, None)
            },
            Command::Prepare if !legacy => {
                let Ok(header) = ImageHeader::read_from(&mut &payload[..]) else {
                    return (Status::Malformed, Vec::new());
                };
                (header.size, Some(header))
            },
            _ => return (Status::UnsupportedCommand, Vec::new()),
        };
        self.boot = Bootloader {
            handshake: Some(command),
            expected,
            header,
            ..Bootloader::default()
        };
        (Status::Ok, Vec::new())
    }

    fn erase(&mut self, payload: &[u8]) -> (Status, Vec<u8>) {
        let mut cur = payload;
        let Ok(size) = cur.read_u32::<LittleEndian>() else {
            return (Status::Malformed, Vec::new());
        };
        if self.boot.handshake.is_none() || size != self.boot.expected {
            return (Status::Error, Vec::new());
        }
        self.boot.erased = true;
        self.boot.staged.clear();
        (Status::Ok, Vec::new())
    }

    fn data(&mut self, payload: &[u8]) -> (Status, Vec<u8>) {
        let mut cur = payload;
        let Ok(offset) = cur.read_u32::<LittleEndian>() else {
            return (Status::Malformed, Vec::new());
        };
        if !self.boot.erased {
            return (Status::Error, Vec::new());
        }
        if self.chunk_limit.is_some_and(|limit| cur.len() > limit) {
            return (Status::Malformed, Vec::new());
        }
        let end = self.boot.staged.len() + cur.len();
        if offset as usize != self.boot.staged.len() || end > self.boot.expected as usize {
            return (Status::InvalidValue, Vec::new());
        }
        self.boot.staged.extend_from_slice(cur);
        (Status::Ok, Vec::new())
    }

    fn verify(&mut self, payload: &[u8]) -> (Status, Vec<u8>) {
        let mut cur = payload;
        let Ok(size) = cur.read_u32::<LittleEndian>() else {
            return (Status::Malformed, Vec::new());
        };
        if size as usize != self.boot.staged.len() || size != self.boot.expected {
            return (Status::ValidationFailed, Vec::new());
        }
        if let (Ok(crc), Ok(validate)) = (cur.read_u32::<LittleEndian>(), cur.read_u8()) {
            if crc32fast::hash(&self.boot.staged) != crc {
                return (Status::ValidationFailed, Vec::new());
            }
            if validate != 0 && !self.header_matches() {
                return (Status::ValidationFailed, Vec::new());
            }
        }
        self.boot.verified = true;
        (Status::Ok, Vec::new())
    }

    fn header_matches(&self) -> bool {
        let Some(header) = &self.boot.header else {
            return false;
        };
        if !header.has_crc() && !header.has_digest() {
            return false;
        }
        let crc_ok = !header.has_crc() || crc32fast::hash(&self.boot.staged) == header.crc32;
        let digest_ok =
            !header.has_digest() || Sha256::digest(&self.boot.staged).as_slice() == header.digest;
        crc_ok && digest_ok
    }

    fn commit(&mut self) -> (Status, Vec<u8>) {
        if !self.boot.verified {
            return (Status::Error, Vec::new());
        }
        let image = std::mem::take(&mut self.boot.staged);
        debug!("Simulated device installed {} byte image", image.len());
        self.installed = Some(image);
        self.boot = Bootloader::default();
        (Status::Ok, Vec::new())
    }
}

#[allow(clippy::unwrap_used)] // Writing to Vec<u8> cannot fail
fn value_body(id: u16, value: &ParameterValue) -> Vec<u8> {
    let mut body = Vec::new();
    body.write_u16::<LittleEndian>(id).unwrap();
    value.encode_into(&mut body);
    body
}

/// Simulated device transport.
pub struct SimulatedDevice {
    name: String,
    state: Arc<Mutex<SimState>>,
}

impl SimulatedDevice {
    /// Device reporting `CLI v{version}` with [`default_table`].
    pub fn new(version: &str) -> Self {
        Self {
            name: format!("sim:{version}"),
            state: Arc::new(Mutex::new(SimState::new(version))),
        }
    }

    /// Device used by the command-line `--demo` mode.
    pub fn demo() -> Self {
        let mut device = Self::new("2.0.1");
        device.name = "demo".to_string();
        device
    }

    /// Handle sharing this device's state.
    pub fn handle(&self) -> SimHandle {
        SimHandle(Arc::clone(&self.state))
    }
}

impl Transport for SimulatedDevice {
    fn open(&mut self) -> Result<()> {
        let mut state = lock(&self.state);
        if state.refuse_opens > 0 {
            state.refuse_opens -= 1;
            return Err(Error::Transport(format!("{} refused to open", self.name)));
        }
        if state.link_down {
            return Err(Error::Transport(format!("{} is not present", self.name)));
        }
        state.open = true;
        let rules = state.mode.rules();
        state.decoder.set_rules(rules);
        Ok(())
    }

    fn close(&mut self) {
        lock(&self.state).open = false;
    }

    fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        {
            let mut state = lock(&self.state);
            if !state.open || state.link_down {
                return Err(Error::Transport(format!("{} link is down", self.name)));
            }
            if !state.outbox.is_empty() {
                let n = buf.len().min(state.outbox.len());
                for (slot, byte) in buf.iter_mut().zip(state.outbox.drain(..n)) {
                    *slot = byte;
                }
                return Ok(n);
            }
        }
        thread::sleep(IDLE_POLL);
        Ok(0)
    }

    fn write(&mut self, data: &[u8]) -> Result<()> {
        let mut state = lock(&self.state);
        if !state.open || state.link_down {
            return Err(Error::Transport(format!("{} link is down", self.name)));
        }
        state.receive(data);
        Ok(())
    }

    fn is_healthy(&self) -> bool {
        let state = lock(&self.state);
        state.open && !state.link_down
    }

    fn kind(&self) -> TransportKind {
        TransportKind::Simulated
    }

    fn name(&self) -> &str {
        &self.name
    }
}

/// Shared control over a [`SimulatedDevice`].
#[derive(Clone)]
pub struct SimHandle(Arc<Mutex<SimState>>);

impl SimHandle {
    fn state(&self) -> MutexGuard<'_, SimState> {
        lock(&self.0)
    }

    /// Pull or restore the link. Pulling resets the device to CLI mode.
    pub fn set_link_down(&self, down: bool) {
        let mut state = self.state();
        state.link_down = down;
        if down {
            state.reset();
        }
    }

    /// Stop answering anything.
    pub fn set_silent(&self, silent: bool) {
        self.state().silent = silent;
    }

    /// Change the reported firmware version, e.g. between two connections.
    pub fn set_version(&self, version: &str) {
        self.state().version = version.to_string();
    }

    /// Refuse mode-switch handshakes.
    pub fn refuse_mode_switch(&self, refuse: bool) {
        self.state().refuse_mode_switch = refuse;
    }

    /// Put the device into `mode` without a handshake.
    pub fn force_mode(&self, mode: Mode) {
        self.state().enter(mode);
    }

    /// Drop the next `count` binary responses.
    pub fn drop_responses(&self, count: u32) {
        self.state().drop_responses = count;
    }

    /// Corrupt the checksum of the next `count` binary responses.
    pub fn corrupt_responses(&self, count: u32) {
        self.state().corrupt_responses = count;
    }

    /// Drop the link when a request for `command` arrives.
    pub fn drop_link_on(&self, command: Command) {
        self.state().drop_link_on = Some(command);
    }

    /// Stop dropping the link on a command.
    pub fn clear_drop_link(&self) {
        self.state().drop_link_on = None;
    }

    /// Fail the next `count` opens.
    pub fn refuse_opens(&self, count: u32) {
        self.state().refuse_opens = count;
    }

    /// Answer every read and write of parameter `id` with `status`.
    pub fn reject(&self, id: u16, status: Status) {
        self.state().rejects.insert(id, status);
    }

    /// Refuse data chunks longer than `limit` bytes.
    pub fn set_chunk_limit(&self, limit: Option<usize>) {
        self.state().chunk_limit = limit;
    }

    /// Queue a line of console output.
    pub fn inject(&self, line: &str) {
        self.state().say(line);
    }

    /// Active mode.
    pub fn mode(&self) -> Mode {
        self.state().mode
    }

    /// Whether the host holds the link open.
    pub fn is_open(&self) -> bool {
        self.state().open
    }

    /// Every binary request received, in order.
    pub fn received_frames(&self) -> Vec<Frame> {
        self.state().received.clone()
    }

    /// Commands of every binary request received, in order.
    pub fn received_commands(&self) -> Vec<Command> {
        self.state()
            .received
            .iter()
            .filter_map(Frame::command)
            .collect()
    }

    /// Every text line received, in order.
    pub fn received_lines(&self) -> Vec<String> {
        self.state().lines.clone()
    }

    /// Device-side value of parameter `id`.
    pub fn param_value(&self, id: u16) -> Option<ParameterValue> {
        self.state()
            .table
            .get(id)
            .and_then(|p| p.value().cloned())
    }

    /// Payload of the last committed image.
    pub fn installed_image(&self) -> Option<Vec<u8>> {
        self.state().installed.clone()
    }
}

fn lock(state: &Mutex<SimState>) -> MutexGuard<'_, SimState> {
    state
        .lock()
        .unwrap_or_else(std::sync::PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::Request;

    fn exchange(device: &mut SimulatedDevice, frame: &Frame) -> Frame {
        device.write(&frame.encode()).unwrap();
        let mut decoder = FrameDecoder::with_rules(DecodeRules::Frames);
        let mut buf = [0u8; 256];
        let n = device.read(&mut buf).unwrap();
        match decoder.feed(&buf[..n], Instant::now()).pop() {
            Some(Decoded::Frame(frame)) => frame,
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_text_console() {
        let mut device = SimulatedDevice::new("1.3.0");
        device.open().unwrap();
        device.write(b"version\r\n").unwrap();

        let mut buf = [0u8; 64];
        let n = device.read(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"CLI v1.3.0\r\n");
        assert_eq!(device.read(&mut buf).unwrap(), 0);
    }

    #[test]
    fn test_parameter_read_and_reject() {
        let mut device = SimulatedDevice::new("2.0.0");
        let handle = device.handle();
        handle.force_mode(Mode::Parameter);
        device.open().unwrap();

        let request = Request::read_parameter(1).into_frame(Mode::Parameter, 5);
        let response = exchange(&mut device, &request);
        assert!(response.answers(Command::ReadParameter, 5));
        assert_eq!(response.status(), Some(Status::Ok));
        assert_eq!(response.body(), &value_body(1, &ParameterValue::Integer(10))[..]);

        handle.reject(1, Status::NotAuthorized);
        let response = exchange(&mut device, &request);
        assert_eq!(response.status(), Some(Status::NotAuthorized));
    }

    #[test]
    fn test_link_down_fails_io_and_resets_mode() {
        let mut device = SimulatedDevice::new("2.0.0");
        let handle = device.handle();
        handle.force_mode(Mode::Bootloader);
        device.open().unwrap();

        handle.set_link_down(true);
        assert!(device.read(&mut [0u8; 8]).is_err());
        assert!(device.write(b"x").is_err());
        assert!(device.open().is_err());
        assert_eq!(handle.mode(), Mode::Cli);

        handle.set_link_down(false);
        device.open().unwrap();
        assert!(device.is_healthy());
    }

    #[test]
    fn test_legacy_device_refuses_prepare() {
        let mut device = SimulatedDevice::new("1.5.0");
        device.handle().force_mode(Mode::Bootloader);
        device.open().unwrap();

        let request = Request::prepare(&[0u8; 52]).into_frame(Mode::Bootloader, 0);
        let response = exchange(&mut device, &request);
        assert_eq!(response.status(), Some(Status::UnsupportedCommand));

        let request = Request::install(16).into_frame(Mode::Bootloader, 1);
        assert_eq!(exchange(&mut device, &request).status(), Some(Status::Ok));
    }
}
