//! Binary frame format shared by the parameter and bootloader protocols.
//!
//! ## Frame Format
//!
//! ```text
//! +------+------+------+-----+-----------+-----------+-----------+------+
//! | 0xA9 | 0x65 | mode | cmd | seq (LE)  | len (LE)  |  payload  | CRC8 |
//! +------+------+------+-----+-----------+-----------+-----------+------+
//! |  1   |  1   |  1   |  1  |     2     |     2     |    len    |  1   |
//! +------+------+------+-----+-----------+-----------+-----------+------+
//! ```
//!
//! The CRC covers everything between the preamble and the trailer. A response
//! echoes the request sequence, sets [`RESPONSE_FLAG`] in the command byte and
//! starts its payload with a [`Status`] byte.

use std::fmt;

use byteorder::{LittleEndian, WriteBytesExt};

use crate::mode::Mode;
use crate::param::ParameterValue;
use crate::protocol::crc::crc8;

/// Frame preamble.
pub const PREAMBLE: [u8; 2] = [0xA9, 0x65];

/// Header length including the preamble.
pub const HEADER_LEN: usize = 8;

/// Trailer length (CRC-8).
pub const TRAILER_LEN: usize = 1;

/// Largest payload a frame may declare.
pub const MAX_PAYLOAD: usize = 1024;

/// Bit set in the command byte of every response.
pub const RESPONSE_FLAG: u8 = 0x80;

/// Command codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Command {
    /// Read one parameter (0x01).
    ReadParameter = 0x01,
    /// Write one parameter (0x02).
    WriteParameter = 0x02,
    /// Legacy single-step image install (0x10).
    Install = 0x10,
    /// Prepare handshake carrying the application header (0x11).
    Prepare = 0x11,
    /// Erase the application area (0x12).
    Erase = 0x12,
    /// Image data chunk (0x13).
    Data = 0x13,
    /// Verify transferred image (0x14).
    Verify = 0x14,
    /// Commit and activate the new image (0x15).
    Commit = 0x15,
    /// Abort the upgrade (0x16).
    Abort = 0x16,
    /// Switch to another protocol mode (0x70).
    SwitchMode = 0x70,
    /// Keep-alive (0x71).
    Ping = 0x71,
}

impl Command {
    /// Raw command code.
    pub fn code(self) -> u8 {
        self as u8
    }

    /// Command code used by the matching response.
    pub fn response_code(self) -> u8 {
        self.code() | RESPONSE_FLAG
    }

    /// Parse a request command code.
    pub fn from_code(code: u8) -> Option<Self> {
        match code & !RESPONSE_FLAG {
            0x01 => Some(Self::ReadParameter),
            0x02 => Some(Self::WriteParameter),
            0x10 => Some(Self::Install),
            0x11 => Some(Self::Prepare),
            0x12 => Some(Self::Erase),
            0x13 => Some(Self::Data),
            0x14 => Some(Self::Verify),
            0x15 => Some(Self::Commit),
            0x16 => Some(Self::Abort),
            0x70 => Some(Self::SwitchMode),
            0x71 => Some(Self::Ping),
            _ => None,
        }
    }

    /// Short name for logs and error messages.
    pub fn name(self) -> &'static str {
        match self {
            Self::ReadParameter => "read parameter",
            Self::WriteParameter => "write parameter",
            Self::Install => "install",
            Self::Prepare => "prepare",
            Self::Erase => "erase",
            Self::Data => "data",
            Self::Verify => "verify",
            Self::Commit => "commit",
            Self::Abort => "abort",
            Self::SwitchMode => "switch mode",
            Self::Ping => "ping",
        }
    }

    /// Mode in which the device accepts this command.
    ///
    /// `None` means any binary mode.
    pub fn required_mode(self) -> Option<Mode> {
        match self {
            Self::ReadParameter | Self::WriteParameter => Some(Mode::Parameter),
            Self::Install
            | Self::Prepare
            | Self::Erase
            | Self::Data
            | Self::Verify
            | Self::Commit
            | Self::Abort => Some(Mode::Bootloader),
            Self::SwitchMode | Self::Ping => None,
        }
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Response status codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum Status {
    /// Success (0x00).
    Ok,
    /// Generic failure (0x01).
    Error,
    /// Operation not permitted for this parameter (0x7E).
    NotAuthorized,
    /// Request could not be parsed (0x80).
    Malformed,
    /// Unknown parameter id (0x86).
    UnsupportedParameter,
    /// Value rejected by the device (0x87).
    InvalidValue,
    /// Value tag does not match the parameter type (0x8D).
    InvalidDataType,
    /// Image verification failed (0x90).
    ValidationFailed,
    /// Command not supported by this firmware (0xC3).
    UnsupportedCommand,
    /// Unrecognised status byte.
    Unknown(u8),
}

impl From<u8> for Status {
    fn from(value: u8) -> Self {
        match value {
            0x00 => Self::Ok,
            0x01 => Self::Error,
            0x7E => Self::NotAuthorized,
            0x80 => Self::Malformed,
            0x86 => Self::UnsupportedParameter,
            0x87 => Self::InvalidValue,
            0x8D => Self::InvalidDataType,
            0x90 => Self::ValidationFailed,
            0xC3 => Self::UnsupportedCommand,
            v => Self::Unknown(v),
        }
    }
}

impl Status {
    /// Raw status byte.
    pub fn as_u8(self) -> u8 {
        match self {
            Self::Ok => 0x00,
            Self::Error => 0x01,
            Self::NotAuthorized => 0x7E,
            Self::Malformed => 0x80,
            Self::UnsupportedParameter => 0x86,
            Self::InvalidValue => 0x87,
            Self::InvalidDataType => 0x8D,
            Self::ValidationFailed => 0x90,
            Self::UnsupportedCommand => 0xC3,
            Self::Unknown(v) => v,
        }
    }

    /// Whether the status reports success.
    pub fn is_ok(self) -> bool {
        self == Self::Ok
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ok => f.write_str("ok"),
            Self::Error => f.write_str("error"),
            Self::NotAuthorized => f.write_str("not authorized"),
            Self::Malformed => f.write_str("malformed request"),
            Self::UnsupportedParameter => f.write_str("unsupported parameter"),
            Self::InvalidValue => f.write_str("invalid value"),
            Self::InvalidDataType => f.write_str("invalid data type"),
            Self::ValidationFailed => f.write_str("validation failed"),
            Self::UnsupportedCommand => f.write_str("unsupported command"),
            Self::Unknown(v) => write!(f, "unknown status {v:#04x}"),
        }
    }
}

/// One decoded binary frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Mode tag byte.
    pub mode_tag: u8,
    /// Command byte (with [`RESPONSE_FLAG`] on responses).
    pub command: u8,
    /// Sequence number.
    pub sequence: u16,
    /// Payload bytes.
    pub payload: Vec<u8>,
}

impl Frame {
    /// Create a request frame.
    pub fn request(mode: Mode, command: Command, sequence: u16, payload: Vec<u8>) -> Self {
        Self {
            mode_tag: mode.tag(),
            command: command.code(),
            sequence,
            payload,
        }
    }

    /// Create the response to `request` with `status` followed by `body`.
    pub fn response(request: &Frame, status: Status, body: &[u8]) -> Self {
        let mut payload = Vec::with_capacity(1 + body.len());
        payload.push(status.as_u8());
        payload.extend_from_slice(body);
        Self {
            mode_tag: request.mode_tag,
            command: request.command | RESPONSE_FLAG,
            sequence: request.sequence,
            payload,
        }
    }

    /// Serialize to wire bytes.
    #[allow(clippy::unwrap_used)] // Writing to Vec<u8> cannot fail
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(HEADER_LEN + self.payload.len() + TRAILER_LEN);
        out.extend_from_slice(&PREAMBLE);
        out.push(self.mode_tag);
        out.push(self.command);
        out.write_u16::<LittleEndian>(self.sequence).unwrap();
        out.write_u16::<LittleEndian>(self.payload.len() as u16)
            .unwrap();
        out.extend_from_slice(&self.payload);
        let crc = crc8(&out[PREAMBLE.len()..]);
        out.push(crc);
        out
    }

    /// Protocol mode this frame belongs to, if the tag is known.
    pub fn mode(&self) -> Option<Mode> {
        Mode::from_tag(self.mode_tag)
    }

    /// Whether this is a response frame.
    pub fn is_response(&self) -> bool {
        self.command & RESPONSE_FLAG != 0
    }

    /// Command this frame carries or answers.
    pub fn command(&self) -> Option<Command> {
        Command::from_code(self.command)
    }

    /// Whether this frame is the response to `command` with `sequence`.
    pub fn answers(&self, command: Command, sequence: u16) -> bool {
        self.command == command.response_code() && self.sequence == sequence
    }

    /// Status byte of a response.
    pub fn status(&self) -> Option<Status> {
        self.payload
            .first()
            .map(|&b| Status::from(b))
    }

    /// Response payload following the status byte.
    pub fn body(&self) -> &[u8] {
        self.payload
            .get(1..)
            .unwrap_or_default()
    }
}

/// A request before the correlator assigns its sequence number.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    /// Command to send.
    pub command: Command,
    /// Request payload.
    pub payload: Vec<u8>,
}

impl Request {
    /// Create a request with an empty payload.
    pub fn new(command: Command) -> Self {
        Self {
            command,
            payload: Vec::new(),
        }
    }

    /// Read one parameter.
    #[allow(clippy::unwrap_used)] // Writing to Vec<u8> cannot fail
    pub fn read_parameter(id: u16) -> Self {
        let mut req = Self::new(Command::ReadParameter);
        req.payload.write_u16::<LittleEndian>(id).unwrap();
        req
    }

    /// Write one parameter, optionally asking the device to store it.
    #[allow(clippy::unwrap_used)] // Writing to Vec<u8> cannot fail
    pub fn write_parameter(id: u16, persist: bool, value: &ParameterValue) -> Self {
        let mut req = Self::new(Command::WriteParameter);
        req.payload.write_u16::<LittleEndian>(id).unwrap();
        req.payload.push(u8::from(persist));
        value.encode_into(&mut req.payload);
        req
    }

    /// Legacy single-step install announcing the image size.
    #[allow(clippy::unwrap_used)] // Writing to Vec<u8> cannot fail
    pub fn install(size: u32) -> Self {
        let mut req = Self::new(Command::Install);
        req.payload.write_u32::<LittleEndian>(size).unwrap();
        req
    }

    /// Prepare handshake carrying the raw application header.
    pub fn prepare(header: &[u8]) -> Self {
        Self {
            command: Command::Prepare,
            payload: header.to_vec(),
        }
    }

    /// Erase enough space for `size` bytes.
    #[allow(clippy::unwrap_used)] // Writing to Vec<u8> cannot fail
    pub fn erase(size: u32) -> Self {
        let mut req = Self::new(Command::Erase);
        req.payload.write_u32::<LittleEndian>(size).unwrap();
        req
    }

    /// One image chunk at `offset`.
    #[allow(clippy::unwrap_used)] // Writing to Vec<u8> cannot fail
    pub fn data(offset: u32, chunk: &[u8]) -> Self {
        let mut req = Self::new(Command::Data);
        req.payload.write_u32::<LittleEndian>(offset).unwrap();
        req.payload.extend_from_slice(chunk);
        req
    }

    /// Legacy verify: only the transferred length.
    #[allow(clippy::unwrap_used)] // Writing to Vec<u8> cannot fail
    pub fn verify_legacy(size: u32) -> Self {
        let mut req = Self::new(Command::Verify);
        req.payload.write_u32::<LittleEndian>(size).unwrap();
        req
    }

    /// Current verify: length, CRC-32 and whether the device must validate.
    #[allow(clippy::unwrap_used)] // Writing to Vec<u8> cannot fail
    pub fn verify(size: u32, crc32: u32, validate: bool) -> Self {
        let mut req = Self::new(Command::Verify);
        req.payload.write_u32::<LittleEndian>(size).unwrap();
        req.payload.write_u32::<LittleEndian>(crc32).unwrap();
        req.payload.push(u8::from(validate));
        req
    }

    /// Switch the device to `target` mode.
    pub fn switch_mode(target: Mode) -> Self {
        Self {
            command: Command::SwitchMode,
            payload: vec![target.tag()],
        }
    }

    /// Wrap into a frame for `mode` with `sequence`.
    pub fn into_frame(self, mode: Mode, sequence: u16) -> Frame {
        Frame::request(mode, self.command, sequence, self.payload)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_layout() {
        let frame = Frame::request(Mode::Parameter, Command::ReadParameter, 0x0102, vec![0x05, 0x00]);
        let bytes = frame.encode();

        assert_eq!(&bytes[..2], &PREAMBLE);
        assert_eq!(bytes[2], 0x01);
        assert_eq!(bytes[3], 0x01);
        assert_eq!(&bytes[4..6], &[0x02, 0x01]);
        assert_eq!(&bytes[6..8], &[0x02, 0x00]);
        assert_eq!(&bytes[8..10], &[0x05, 0x00]);
        assert_eq!(bytes.len(), HEADER_LEN + 2 + TRAILER_LEN);
        assert_eq!(bytes[10], crc8(&bytes[2..10]));
    }

    #[test]
    fn test_response_echoes_sequence_and_sets_flag() {
        let req = Frame::request(Mode::Bootloader, Command::Erase, 42, vec![]);
        let rsp = Frame::response(&req, Status::Ok, &[]);

        assert!(rsp.is_response());
        assert!(rsp.answers(Command::Erase, 42));
        assert!(!rsp.answers(Command::Erase, 43));
        assert!(!rsp.answers(Command::Data, 42));
        assert_eq!(rsp.status(), Some(Status::Ok));
        assert!(rsp.body().is_empty());
    }

    #[test]
    fn test_status_roundtrip_and_unknown() {
        for code in [0x00, 0x01, 0x7E, 0x80, 0x86, 0x87, 0x8D, 0x90, 0xC3, 0x55] {
            assert_eq!(Status::from(code).as_u8(), code);
        }
        assert_eq!(Status::from(0x55), Status::Unknown(0x55));
        assert_eq!(Status::Unknown(0x55).to_string(), "unknown status 0x55");
    }

    #[test]
    fn test_command_from_response_code() {
        assert_eq!(Command::from_code(0x93), Some(Command::Data));
        assert_eq!(Command::from_code(0x3F), None);
        assert_eq!(Command::Ping.required_mode(), None);
        assert_eq!(Command::Commit.required_mode(), Some(Mode::Bootloader));
    }

    #[test]
    fn test_request_payloads() {
        assert_eq!(Request::read_parameter(0x0203).payload, vec![0x03, 0x02]);
        assert_eq!(Request::install(0x1000).payload, vec![0x00, 0x10, 0x00, 0x00]);

        let data = Request::data(4, &[0xAA, 0xBB]);
        assert_eq!(data.payload, vec![4, 0, 0, 0, 0xAA, 0xBB]);

        let verify = Request::verify(16, 0xDEADBEEF, true);
        assert_eq!(verify.payload.len(), 9);
        assert_eq!(verify.payload[8], 1);

        assert_eq!(Request::switch_mode(Mode::Cli).payload, vec![0x00]);
    }

    #[test]
    fn test_write_parameter_payload() {
        let req = Request::write_parameter(7, true, &ParameterValue::Boolean(true));
        assert_eq!(req.command, Command::WriteParameter);
        assert_eq!(req.payload, vec![0x07, 0x00, 0x01, 0x10, 0x01]);
    }
}
