//! Firmware upgrade state machine.
//!
//! ```text
//! Idle --prepare--> Preparing --erase--> Erasing --data--> Transferring
//!                                                              |
//!          Complete <--commit-- Finalizing <--verify-- Verifying (all chunks acked)
//! ```
//!
//! Every state except the terminal ones can move to `Failed`. A session is
//! single-use: after `Complete` or `Failed`, start a new one.
//!
//! Devices older than 2.0.0 speak the legacy variant: the image is announced
//! with a bare install command instead of the prepare handshake carrying the
//! application header, and verify only checks the length.

use std::fmt;

use log::{debug, info, warn};

use crate::config::MAX_CHUNK_SIZE;
use crate::engine::Engine;
use crate::error::{Error, Result};
use crate::events::Event;
use crate::image::FirmwareImage;
use crate::mode::Mode;
use crate::protocol::{Command, Frame, Request, Status};
use crate::transport::Transport;

/// Bootloader handshake variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum BootloaderVariant {
    /// Single install command, no validation.
    Legacy,
    /// Prepare handshake with application header and optional validation.
    Current,
}

impl fmt::Display for BootloaderVariant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Legacy => f.write_str("legacy"),
            Self::Current => f.write_str("current"),
        }
    }
}

/// Why an upgrade session failed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpgradeFailure {
    /// The caller aborted.
    Aborted,
    /// The link dropped during the session.
    LinkLost,
    /// No response after retries.
    Timeout,
    /// The caller cancelled the in-flight request.
    Cancelled,
    /// The device refused a step.
    Rejected {
        /// Refused command.
        command: &'static str,
        /// Device status.
        status: Status,
    },
    /// Image CRC or digest check failed.
    Validation(String),
    /// The device version cannot run the requested variant.
    Version(String),
    /// Anything else.
    Protocol(String),
}

impl From<&Error> for UpgradeFailure {
    fn from(error: &Error) -> Self {
        match error {
            Error::Timeout { .. } => Self::Timeout,
            Error::Cancelled { .. } => Self::Cancelled,
            Error::DeviceStatus { command, status } => Self::Rejected {
                command: *command,
                status: *status,
            },
            Error::UpgradeValidation(reason) => Self::Validation(reason.clone()),
            Error::VersionMismatch { .. } => Self::Version(error.to_string()),
            e if e.is_link_failure() && !matches!(e, Error::Framing { .. }) => Self::LinkLost,
            other => Self::Protocol(other.to_string()),
        }
    }
}

impl fmt::Display for UpgradeFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Aborted => f.write_str("aborted"),
            Self::LinkLost => f.write_str("link lost"),
            Self::Timeout => f.write_str("device did not respond"),
            Self::Cancelled => f.write_str("cancelled"),
            Self::Rejected { command, status } => write!(f, "device refused {command}: {status}"),
            Self::Validation(reason) => write!(f, "validation failed: {reason}"),
            Self::Version(reason) | Self::Protocol(reason) => f.write_str(reason),
        }
    }
}

/// Upgrade session state.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum UpgradeState {
    /// Nothing sent yet.
    #[default]
    Idle,
    /// Device acknowledged prepare (or install).
    Preparing,
    /// Device erased the application area.
    Erasing,
    /// Chunks are being transferred.
    Transferring,
    /// All chunks acknowledged; verification pending.
    Verifying,
    /// Verification passed; commit pending.
    Finalizing,
    /// New firmware committed.
    Complete,
    /// Terminal failure.
    Failed(UpgradeFailure),
}

impl UpgradeState {
    /// Whether the session is over.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Complete | Self::Failed(_))
    }
}

impl fmt::Display for UpgradeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Idle => f.write_str("idle"),
            Self::Preparing => f.write_str("preparing"),
            Self::Erasing => f.write_str("erasing"),
            Self::Transferring => f.write_str("transferring"),
            Self::Verifying => f.write_str("verifying"),
            Self::Finalizing => f.write_str("finalizing"),
            Self::Complete => f.write_str("complete"),
            Self::Failed(reason) => write!(f, "failed ({reason})"),
        }
    }
}

/// What an abort means for the device firmware.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AbortOutcome {
    /// Nothing was erased; the old firmware is intact.
    Safe,
    /// The application area was touched; firmware state is unknown until a
    /// later upgrade succeeds.
    FirmwareStateUnknown,
}

/// One upgrade attempt.
#[derive(Debug)]
pub struct UpgradeSession {
    image: FirmwareImage,
    variant: BootloaderVariant,
    validate: bool,
    chunk_size: usize,
    state: UpgradeState,
    offset: u32,
    generation: Option<u64>,
    registered: bool,
}

impl UpgradeSession {
    /// Session for `image` speaking `variant`, without validation.
    pub fn new(image: FirmwareImage, variant: BootloaderVariant) -> Self {
        Self {
            image,
            variant,
            validate: false,
            chunk_size: 256,
            state: UpgradeState::Idle,
            offset: 0,
            generation: None,
            registered: false,
        }
    }

    /// Session matching the engine's negotiated version and configuration.
    pub fn for_engine<T: Transport>(engine: &Engine<T>, image: FirmwareImage) -> Result<Self> {
        let version = engine.version().ok_or(Error::NotConnected)?;
        Ok(Self::new(image, version.bootloader_variant())
            .with_validation(engine.config().validate_image)
            .with_chunk_size(engine.config().chunk_size))
    }

    /// Enable or disable the validation step.
    #[must_use]
    pub fn with_validation(mut self, validate: bool) -> Self {
        self.validate = validate;
        self
    }

    /// Set the bytes per data request, clamped to what one request carries.
    #[must_use]
    pub fn with_chunk_size(mut self, size: usize) -> Self {
        self.chunk_size = size.clamp(1, MAX_CHUNK_SIZE);
        self
    }

    /// Bytes per data request.
    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    /// Current state as last settled by this session.
    ///
    /// A link loss is only observed on the next call that takes the engine;
    /// use [`UpgradeSession::refresh`] to pick it up without sending anything.
    pub fn state(&self) -> &UpgradeState {
        &self.state
    }

    /// Current state, failed with `LinkLost` if the link dropped since the
    /// session started.
    pub fn refresh<T: Transport>(&mut self, engine: &Engine<T>) -> &UpgradeState {
        self.observe_link_loss(engine);
        &self.state
    }

    /// Settle a session whose link dropped. The engine already reported the
    /// failure, so no event is emitted here.
    fn observe_link_loss<T: Transport>(&mut self, engine: &Engine<T>) -> bool {
        let lost = !self.state.is_terminal()
            && self
                .generation
                .is_some_and(|g| g != engine.link_generation());
        if lost {
            debug!("Upgrade session observed link loss while {}", self.state);
            self.state = UpgradeState::Failed(UpgradeFailure::LinkLost);
            self.registered = false;
        }
        lost
    }

    /// Handshake variant.
    pub fn variant(&self) -> BootloaderVariant {
        self.variant
    }

    /// The image being installed.
    pub fn image(&self) -> &FirmwareImage {
        &self.image
    }

    /// Bytes acknowledged so far.
    pub fn transferred(&self) -> u32 {
        self.offset
    }

    /// Transfer progress in percent.
    pub fn percent(&self) -> u8 {
        match self.state {
            UpgradeState::Verifying | UpgradeState::Finalizing | UpgradeState::Complete => 100,
            _ if self.image.size() == 0 => 0,
            _ => (u64::from(self.offset) * 100 / u64::from(self.image.size())) as u8,
        }
    }

    /// Announce the image. Enters bootloader mode first if needed.
    pub fn prepare<T: Transport>(&mut self, engine: &mut Engine<T>) -> Result<()> {
        self.expect(&[UpgradeState::Idle], "prepare")?;
        let result = self.try_prepare(engine);
        self.settle(engine, result, UpgradeState::Preparing)
    }

    fn try_prepare<T: Transport>(&mut self, engine: &mut Engine<T>) -> Result<()> {
        if self.validate {
            if let Some(version) = engine.version() {
                version.check_image_validation()?;
            }
            self.image.validate()?;
        }

        engine.begin_upgrade()?;
        self.registered = true;
        if engine.mode() != Mode::Bootloader {
            engine.switch_mode(Mode::Bootloader)?;
        }
        self.generation = Some(engine.link_generation());

        let request = match self.variant {
            BootloaderVariant::Legacy => Request::install(self.image.size()),
            BootloaderVariant::Current => Request::prepare(self.image.header_bytes()),
        };
        info!(
            "Preparing {} byte image ({} handshake)",
            self.image.size(),
            self.variant
        );
        self.command(engine, request)?;
        Ok(())
    }

    /// Erase the application area.
    pub fn erase<T: Transport>(&mut self, engine: &mut Engine<T>) -> Result<()> {
        self.expect(&[UpgradeState::Preparing], "erase")?;
        let result = self
            .command(engine, Request::erase(self.image.size()))
            .map(|_| ());
        self.settle(engine, result, UpgradeState::Erasing)
    }

    /// Send the next chunk. Returns `true` once every chunk is acknowledged.
    pub fn transfer_chunk<T: Transport>(&mut self, engine: &mut Engine<T>) -> Result<bool> {
        self.expect(
            &[UpgradeState::Erasing, UpgradeState::Transferring],
            "transfer a chunk",
        )?;

        let start = self.offset as usize;
        let end = (start + self.chunk_size).min(self.image.payload().len());
        if start < end {
            let request = Request::data(self.offset, &self.image.payload()[start..end]);
            if let Err(e) = self.command(engine, request) {
                return self.settle(engine, Err(e), UpgradeState::Transferring).map(|()| false);
            }
            self.offset = end as u32;
            debug!("Transferred {}/{} bytes", self.offset, self.image.size());
        }

        let done = self.offset >= self.image.size();
        let next = if done {
            UpgradeState::Verifying
        } else {
            UpgradeState::Transferring
        };
        self.settle(engine, Ok(()), next)?;
        Ok(done)
    }

    /// Ask the device to verify the transferred image.
    pub fn verify<T: Transport>(&mut self, engine: &mut Engine<T>) -> Result<()> {
        self.expect(&[UpgradeState::Verifying], "verify")?;
        let request = match self.variant {
            BootloaderVariant::Legacy => Request::verify_legacy(self.image.size()),
            BootloaderVariant::Current => Request::verify(
                self.image.size(),
                crc32fast::hash(self.image.payload()),
                self.validate,
            ),
        };
        let result = match self.command(engine, request) {
            Err(Error::DeviceStatus {
                status: Status::ValidationFailed,
                ..
            }) => Err(Error::UpgradeValidation(
                "device rejected the transferred image".to_string(),
            )),
            other => other.map(|_| ()),
        };
        self.settle(engine, result, UpgradeState::Finalizing)
    }

    /// Commit the new firmware.
    pub fn finalize<T: Transport>(&mut self, engine: &mut Engine<T>) -> Result<()> {
        self.expect(&[UpgradeState::Finalizing], "finalize")?;
        let result = self
            .command(engine, Request::new(Command::Commit))
            .map(|_| ());
        self.settle(engine, result, UpgradeState::Complete)?;
        info!("Firmware v{} committed", self.image.header().version);
        Ok(())
    }

    /// Abandon the session.
    ///
    /// Never retried by the engine. Once erasing started the caller must
    /// treat the device firmware as unknown.
    pub fn abort<T: Transport>(&mut self, engine: &mut Engine<T>) -> Result<AbortOutcome> {
        let outcome = match self.state {
            UpgradeState::Idle | UpgradeState::Preparing => AbortOutcome::Safe,
            _ => AbortOutcome::FirmwareStateUnknown,
        };
        if self.observe_link_loss(engine) {
            if outcome == AbortOutcome::FirmwareStateUnknown {
                warn!("Link lost after erase; device firmware state is unknown");
            }
            return Ok(outcome);
        }
        if self.state.is_terminal() {
            return Err(Error::UpgradeSequence {
                state: self.state.clone(),
                operation: "abort",
            });
        }

        if self.state != UpgradeState::Idle {
            if let Err(e) = self.command(engine, Request::new(Command::Abort)) {
                warn!("Device did not acknowledge abort: {e}");
            }
        }
        if outcome == AbortOutcome::FirmwareStateUnknown {
            warn!("Upgrade aborted after erase; device firmware state is unknown");
        }

        self.enter(engine, UpgradeState::Failed(UpgradeFailure::Aborted));
        Ok(outcome)
    }

    /// Drive every remaining step to completion.
    pub fn run<T: Transport>(&mut self, engine: &mut Engine<T>) -> Result<()> {
        if self.state == UpgradeState::Idle {
            self.prepare(engine)?;
        }
        if self.state == UpgradeState::Preparing {
            self.erase(engine)?;
        }
        while matches!(
            self.state,
            UpgradeState::Erasing | UpgradeState::Transferring
        ) {
            self.transfer_chunk(engine)?;
        }
        if self.state == UpgradeState::Verifying {
            self.verify(engine)?;
        }
        if self.state == UpgradeState::Finalizing {
            self.finalize(engine)?;
        }
        match &self.state {
            UpgradeState::Complete => Ok(()),
            state => Err(Error::UpgradeSequence {
                state: state.clone(),
                operation: "run",
            }),
        }
    }

    fn expect(&self, allowed: &[UpgradeState], operation: &'static str) -> Result<()> {
        if allowed.contains(&self.state) {
            Ok(())
        } else {
            Err(Error::UpgradeSequence {
                state: self.state.clone(),
                operation,
            })
        }
    }

    /// Exchange one bootloader request on the link this session started on.
    fn command<T: Transport>(&self, engine: &mut Engine<T>, request: Request) -> Result<Frame> {
        if self.generation != Some(engine.link_generation()) {
            return Err(Error::LinkLost { sequence: None });
        }
        let command = request.command;
        let response = engine.exchange(request)?;
        match response.status() {
            Some(status) if status.is_ok() => Ok(response),
            Some(status) => Err(Error::DeviceStatus {
                command: command.name(),
                status,
            }),
            None => Err(Error::Protocol(format!("empty {command} response"))),
        }
    }

    /// Move to `next` on success, or to `Failed` on error.
    fn settle<T: Transport>(
        &mut self,
        engine: &mut Engine<T>,
        result: Result<()>,
        next: UpgradeState,
    ) -> Result<()> {
        match result {
            Ok(()) => {
                self.enter(engine, next);
                Ok(())
            },
            Err(e) => {
                let failure = UpgradeFailure::from(&e);
                warn!("Upgrade failed while {}: {e}", self.state);
                // The engine already reported a failure caused by link loss.
                let reported = failure == UpgradeFailure::LinkLost
                    && self
                        .generation
                        .is_some_and(|g| g != engine.link_generation());
                if reported {
                    self.state = UpgradeState::Failed(failure);
                    self.release(engine);
                } else {
                    self.enter(engine, UpgradeState::Failed(failure));
                }
                Err(e)
            },
        }
    }

    fn enter<T: Transport>(&mut self, engine: &mut Engine<T>, state: UpgradeState) {
        self.state = state;
        engine.emit(Event::UpgradeProgress {
            state: self.state.clone(),
            percent: self.percent(),
        });
        if self.state.is_terminal() {
            self.release(engine);
        }
    }

    fn release<T: Transport>(&mut self, engine: &mut Engine<T>) {
        if std::mem::take(&mut self.registered) {
            engine.end_upgrade();
        }
    }
}
