//! Request/response correlation for the binary modes.
//!
//! One request is in flight at a time. Each request gets the next sequence
//! number and a deadline; an expired attempt is retransmitted with the same
//! bytes and sequence up to `max_retries` times. Responses for other
//! sequences are logged and dropped.

use std::time::{Duration, Instant};

use log::{debug, trace, warn};

use crate::error::{Error, Result};
use crate::mode::Mode;
use crate::protocol::{Decoded, Frame, Request};
use crate::session::{CancelToken, PendingRequest, ProtocolSession};
use crate::transport::{Channel, Transport};

/// Matches outgoing requests with incoming responses.
#[derive(Debug)]
pub struct Correlator {
    session: ProtocolSession,
    timeout: Duration,
    max_retries: u32,
}

impl Correlator {
    /// Correlator for a fresh session starting in `mode`.
    pub fn new(mode: Mode, timeout: Duration, max_retries: u32) -> Self {
        Self {
            session: ProtocolSession::new(mode),
            timeout,
            max_retries,
        }
    }

    /// Session state.
    pub fn session(&self) -> &ProtocolSession {
        &self.session
    }

    /// Per-attempt response deadline.
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub(crate) fn set_mode(&mut self, mode: Mode) {
        self.session.set_mode(mode);
    }

    /// Start over with a new session, e.g. for a new connection.
    pub(crate) fn reset(&mut self, mode: Mode) {
        self.session = ProtocolSession::new(mode);
    }

    /// Drop all in-flight requests after the link was lost.
    pub(crate) fn fail_outstanding(&mut self) -> Vec<u16> {
        let failed = self.session.drain();
        for seq in &failed {
            warn!("Request seq {seq} failed: link lost");
        }
        failed
    }

    /// Send `request` and wait for its response, retrying on silence.
    pub fn exchange<T: Transport>(
        &mut self,
        channel: &mut Channel<T>,
        request: Request,
        cancel: &CancelToken,
    ) -> Result<Frame> {
        self.exchange_with(channel, request, cancel, self.max_retries)
    }

    /// Like [`Correlator::exchange`] with an explicit retry budget.
    pub fn exchange_with<T: Transport>(
        &mut self,
        channel: &mut Channel<T>,
        request: Request,
        cancel: &CancelToken,
        max_retries: u32,
    ) -> Result<Frame> {
        let mode = self.session.mode();
        if !mode.is_binary() {
            return Err(Error::WrongMode {
                expected: request
                    .command
                    .required_mode()
                    .unwrap_or(Mode::Parameter),
                active: mode,
            });
        }
        if let Some(required) = request.command.required_mode() {
            if required != mode {
                return Err(Error::WrongMode {
                    expected: required,
                    active: mode,
                });
            }
        }
        if self.session.has_outstanding() {
            return Err(Error::Busy("another request is in flight".to_string()));
        }

        let command = request.command;
        let sequence = self.session.allocate();
        let bytes = request.into_frame(mode, sequence).encode();

        debug!("Request {command} seq {sequence} ({} bytes)", bytes.len());
        self.session.track(
            sequence,
            PendingRequest {
                command,
                deadline: Instant::now() + self.timeout,
                attempts: 1,
            },
        );

        let result = self.await_response(channel, &bytes, sequence, cancel, max_retries);
        self.session.release(sequence);
        match &result {
            Err(Error::Timeout { .. } | Error::Framing { .. }) => channel.mark_suspect(),
            Err(e) => debug!("Request seq {sequence} failed: {e}"),
            Ok(_) => trace!("Request seq {sequence} answered"),
        }
        result
    }

    fn await_response<T: Transport>(
        &mut self,
        channel: &mut Channel<T>,
        bytes: &[u8],
        sequence: u16,
        cancel: &CancelToken,
        max_retries: u32,
    ) -> Result<Frame> {
        let Some(command) = self
            .session
            .pending(sequence)
            .map(|p| p.command)
        else {
            return Err(Error::Protocol(format!("seq {sequence} is not pending")));
        };

        if channel.write(bytes).is_err() {
            return Err(Error::LinkLost {
                sequence: Some(sequence),
            });
        }

        loop {
            if cancel.is_cancelled() {
                debug!("Request seq {sequence} cancelled");
                return Err(Error::Cancelled {
                    sequence: Some(sequence),
                });
            }

            let decoded = channel.poll().map_err(|_| Error::LinkLost {
                sequence: Some(sequence),
            })?;
            for item in decoded {
                match item {
                    Decoded::Frame(frame) if frame.answers(command, sequence) => {
                        return Ok(frame);
                    },
                    Decoded::Frame(frame) => {
                        warn!(
                            "Dropping unexpected frame cmd={:#04x} seq={} while waiting for seq {sequence}",
                            frame.command, frame.sequence
                        );
                    },
                    Decoded::Error(source) => {
                        return Err(Error::Framing {
                            sequence: Some(sequence),
                            source,
                        });
                    },
                    Decoded::Line(line) => {
                        debug!("Ignoring text in binary mode: {line:?}");
                    },
                }
            }

            let now = Instant::now();
            let Some(pending) = self.session.pending_mut(sequence) else {
                return Err(Error::Protocol(format!("seq {sequence} vanished")));
            };
            if now < pending.deadline {
                continue;
            }
            channel.note_warning();
            if pending.attempts > max_retries {
                warn!(
                    "Request {command} seq {sequence} timed out after {} attempt(s)",
                    pending.attempts
                );
                return Err(Error::Timeout {
                    sequence: Some(sequence),
                    attempts: pending.attempts,
                });
            }

            pending.attempts += 1;
            pending.deadline = now + self.timeout;
            debug!(
                "Retrying {command} seq {sequence} (attempt {})",
                pending.attempts
            );
            if channel.write(bytes).is_err() {
                return Err(Error::LinkLost {
                    sequence: Some(sequence),
                });
            }
        }
    }
}
