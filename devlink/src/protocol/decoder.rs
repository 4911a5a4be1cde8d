//! Stream decoder turning raw link bytes into lines or binary frames.
//!
//! The active ruleset follows the protocol mode: CLI mode splits text at line
//! terminators, the parameter and bootloader modes parse length and checksum
//! delimited frames (see [`crate::protocol::frame`]). Both tolerate arbitrary
//! read-chunk boundaries; incomplete input stays buffered until more bytes
//! arrive.

use std::time::{Duration, Instant};

use log::{trace, warn};

use crate::error::FramingError;
use crate::protocol::crc::crc8;
use crate::protocol::frame::{Frame, HEADER_LEN, MAX_PAYLOAD, PREAMBLE, TRAILER_LEN};

/// Default maximum text line length in bytes.
pub const DEFAULT_MAX_LINE: usize = 1024;

/// Default inter-byte deadline for completing a partial binary frame.
pub const DEFAULT_FRAME_DEADLINE: Duration = Duration::from_millis(100);

/// Framing ruleset.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecodeRules {
    /// Line-terminated text.
    Lines,
    /// Length/checksum-delimited binary frames.
    Frames,
}

/// One unit produced by the decoder.
#[derive(Debug, Clone, PartialEq)]
pub enum Decoded {
    /// A complete text line without its terminator.
    Line(String),
    /// A complete binary frame with a valid checksum.
    Frame(Frame),
    /// Input that was rejected.
    Error(FramingError),
}

/// Incremental decoder for the active protocol mode.
#[derive(Debug)]
pub struct FrameDecoder {
    rules: DecodeRules,
    buffer: Vec<u8>,
    max_line: usize,
    frame_deadline: Duration,
    last_byte_at: Option<Instant>,
    at_line_start: bool,
    /// Dropping the tail of a truncated line up to its terminator.
    overflowed: bool,
}

impl FrameDecoder {
    /// Create a decoder with explicit limits.
    pub fn new(rules: DecodeRules, max_line: usize, frame_deadline: Duration) -> Self {
        Self {
            rules,
            buffer: Vec::new(),
            max_line: max_line.max(1),
            frame_deadline,
            last_byte_at: None,
            at_line_start: true,
            overflowed: false,
        }
    }

    /// Create a decoder with default limits.
    pub fn with_rules(rules: DecodeRules) -> Self {
        Self::new(rules, DEFAULT_MAX_LINE, DEFAULT_FRAME_DEADLINE)
    }

    /// Active ruleset.
    pub fn rules(&self) -> DecodeRules {
        self.rules
    }

    /// Swap the active ruleset, dropping anything buffered under the old one.
    pub fn set_rules(&mut self, rules: DecodeRules) {
        if !self.buffer.is_empty() {
            trace!(
                "Dropping {} buffered bytes on ruleset change",
                self.buffer.len()
            );
        }
        self.rules = rules;
        self.reset();
    }

    /// Drop buffered input.
    pub fn reset(&mut self) {
        self.buffer.clear();
        self.last_byte_at = None;
        self.at_line_start = true;
        self.overflowed = false;
    }

    /// Number of bytes waiting for a terminator or the rest of a frame.
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Feed bytes received at `now` and collect everything they complete.
    pub fn feed(&mut self, bytes: &[u8], now: Instant) -> Vec<Decoded> {
        match self.rules {
            DecodeRules::Lines => self.feed_lines(bytes),
            DecodeRules::Frames => self.feed_frames(bytes, now),
        }
    }

    /// Reject a partial frame whose remaining bytes are overdue.
    ///
    /// Text lines never expire.
    pub fn expire(&mut self, now: Instant) -> Option<Decoded> {
        if self.rules != DecodeRules::Frames || self.buffer.is_empty() {
            return None;
        }
        let since = self.last_byte_at?;
        if now.saturating_duration_since(since) <= self.frame_deadline {
            return None;
        }

        let declared = if self.buffer.len() >= HEADER_LEN {
            usize::from(u16::from_le_bytes([self.buffer[6], self.buffer[7]]))
        } else {
            0
        };
        let received = self
            .buffer
            .len()
            .saturating_sub(HEADER_LEN);
        warn!(
            "Partial frame timed out ({} bytes buffered, {declared} declared)",
            self.buffer.len()
        );
        self.buffer.clear();
        self.last_byte_at = None;
        Some(Decoded::Error(FramingError::Truncated { declared, received }))
    }

    fn feed_lines(&mut self, bytes: &[u8]) -> Vec<Decoded> {
        let mut out = Vec::new();

        for &byte in bytes {
            match byte {
                b'\n' | 0 if self.overflowed => {
                    // End of a line already emitted truncated.
                    self.overflowed = false;
                    self.at_line_start = true;
                },
                b'\n' | 0 => {
                    // A NUL right after a line end is padding, not an empty line.
                    if byte == 0 && self.at_line_start && self.buffer.is_empty() {
                        continue;
                    }
                    out.push(Decoded::Line(self.take_line()));
                    self.at_line_start = true;
                },
                _ if self.overflowed => {},
                _ => {
                    self.at_line_start = false;
                    // One `\r` may follow a full line while its `\n` is pending.
                    let pending_cr = byte == b'\r' && self.buffer.len() == self.max_line;
                    if self.buffer.len() >= self.max_line && !pending_cr {
                        out.push(Decoded::Line(self.take_line()));
                        out.push(Decoded::Error(FramingError::LineTooLong {
                            max: self.max_line,
                        }));
                        self.overflowed = true;
                    } else {
                        self.buffer.push(byte);
                    }
                },
            }
        }

        out
    }

    fn take_line(&mut self) -> String {
        let mut line = std::mem::take(&mut self.buffer);
        if line.last() == Some(&b'\r') {
            line.pop();
        }
        clean_line_text(&String::from_utf8_lossy(&line))
    }

    fn feed_frames(&mut self, bytes: &[u8], now: Instant) -> Vec<Decoded> {
        let mut out = Vec::new();

        if let Some(expired) = self.expire(now) {
            out.push(expired);
        }
        if !bytes.is_empty() {
            self.buffer.extend_from_slice(bytes);
            self.last_byte_at = Some(now);
        }

        loop {
            match find_preamble(&self.buffer) {
                Some(0) => {},
                Some(pos) => {
                    trace!("Discarding {pos} bytes before preamble");
                    self.buffer.drain(..pos);
                },
                None => {
                    // Keep a trailing first preamble byte, it may be completed by the next read.
                    let keep = usize::from(self.buffer.last() == Some(&PREAMBLE[0]));
                    let discard = self.buffer.len() - keep;
                    if discard > 0 {
                        trace!("Discarding {discard} bytes without preamble");
                        self.buffer.drain(..discard);
                    }
                    break;
                },
            }

            if self.buffer.len() < HEADER_LEN {
                break;
            }

            let declared = usize::from(u16::from_le_bytes([self.buffer[6], self.buffer[7]]));
            if declared > MAX_PAYLOAD {
                warn!("Frame declares {declared} payload bytes, resynchronising");
                out.push(Decoded::Error(FramingError::Oversized {
                    declared,
                    max: MAX_PAYLOAD,
                }));
                self.buffer.drain(..PREAMBLE.len());
                continue;
            }

            let total = HEADER_LEN + declared + TRAILER_LEN;
            if self.buffer.len() < total {
                break;
            }

            let expected = crc8(&self.buffer[PREAMBLE.len()..HEADER_LEN + declared]);
            let actual = self.buffer[total - 1];
            if expected != actual {
                warn!("Frame checksum mismatch: expected {expected:#04x}, got {actual:#04x}");
                out.push(Decoded::Error(FramingError::Checksum { expected, actual }));
                self.buffer.drain(..total);
                continue;
            }

            let frame = Frame {
                mode_tag: self.buffer[2],
                command: self.buffer[3],
                sequence: u16::from_le_bytes([self.buffer[4], self.buffer[5]]),
                payload: self.buffer[HEADER_LEN..HEADER_LEN + declared].to_vec(),
            };
            trace!(
                "RX frame mode={:#04x} cmd={:#04x} seq={} len={declared}",
                frame.mode_tag, frame.command, frame.sequence
            );
            out.push(Decoded::Frame(frame));
            self.buffer.drain(..total);
        }

        if self.buffer.is_empty() {
            self.last_byte_at = None;
        }

        out
    }
}

fn find_preamble(buffer: &[u8]) -> Option<usize> {
    buffer
        .windows(PREAMBLE.len())
        .position(|w| w == PREAMBLE)
}

/// Drop control characters from a decoded line, keeping tabs.
pub fn clean_line_text(text: &str) -> String {
    text.chars()
        .filter(|&ch| ch == '\t' || !ch.is_control())
        .collect()
}
