//! Protocol modes and the mode-switch handshake.
//!
//! Exactly one mode is active at a time. Leaving CLI mode uses a text command
//! (`mode par`, `mode boot`) acknowledged with `OK`; leaving a binary mode uses
//! a [`Command::SwitchMode`] frame acknowledged with status OK. The decoder
//! ruleset is swapped only after the device acknowledged the switch.

use std::fmt;
use std::time::Duration;

use log::{debug, info};

use crate::correlator::Correlator;
use crate::error::{Error, Result};
use crate::protocol::decoder::DecodeRules;
use crate::protocol::text::{Reply, mode_command};
use crate::protocol::{Command, Request};
use crate::session::CancelToken;
use crate::transport::{Channel, Transport};
use crate::version::DeviceVersion;

/// Protocol mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "lowercase"))]
pub enum Mode {
    /// Interactive line-oriented shell.
    #[default]
    Cli,
    /// Typed parameter read/write.
    Parameter,
    /// Firmware upgrade.
    Bootloader,
}

impl Mode {
    /// Tag carried in the frame header.
    pub fn tag(self) -> u8 {
        match self {
            Self::Cli => 0x00,
            Self::Parameter => 0x01,
            Self::Bootloader => 0x02,
        }
    }

    /// Mode for a frame tag.
    pub fn from_tag(tag: u8) -> Option<Self> {
        match tag {
            0x00 => Some(Self::Cli),
            0x01 => Some(Self::Parameter),
            0x02 => Some(Self::Bootloader),
            _ => None,
        }
    }

    /// Framing ruleset used while this mode is active.
    pub fn rules(self) -> DecodeRules {
        match self {
            Self::Cli => DecodeRules::Lines,
            Self::Parameter | Self::Bootloader => DecodeRules::Frames,
        }
    }

    /// Whether the mode uses binary frames.
    pub fn is_binary(self) -> bool {
        self.rules() == DecodeRules::Frames
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Cli => f.write_str("CLI"),
            Self::Parameter => f.write_str("parameter"),
            Self::Bootloader => f.write_str("bootloader"),
        }
    }
}

impl std::str::FromStr for Mode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "cli" => Ok(Self::Cli),
            "par" | "param" | "parameter" => Ok(Self::Parameter),
            "boot" | "bootloader" => Ok(Self::Bootloader),
            other => Err(Error::Config(format!("unknown mode '{other}'"))),
        }
    }
}

/// A completed mode switch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ModeChange {
    /// Mode before the switch.
    pub old: Mode,
    /// Mode after the switch.
    pub new: Mode,
}

/// Drives mode switches and remembers which mode to restore after a reconnect.
#[derive(Debug)]
pub struct ModeController {
    restore: Mode,
    timeout: Duration,
}

impl ModeController {
    /// Controller whose first restore target is `initial`.
    pub fn new(initial: Mode, timeout: Duration) -> Self {
        Self {
            restore: initial,
            timeout,
        }
    }

    /// Mode re-entered after a reconnect.
    pub fn restore_target(&self) -> Mode {
        self.restore
    }

    /// Switch the device from the session's active mode to `target`.
    ///
    /// Returns `None` when `target` is already active. Device lines seen
    /// during a text handshake go to `lines`.
    pub fn switch<T: Transport>(
        &mut self,
        target: Mode,
        channel: &mut Channel<T>,
        correlator: &mut Correlator,
        version: &DeviceVersion,
        cancel: &CancelToken,
        lines: impl FnMut(String),
    ) -> Result<Option<ModeChange>> {
        let active = correlator.session().mode();
        if active == target {
            self.restore = target;
            return Ok(None);
        }
        if correlator.session().has_outstanding() {
            return Err(Error::Busy(format!(
                "cannot leave {active} mode with requests outstanding"
            )));
        }
        version.check_mode(target)?;

        debug!("Switching mode {active} -> {target}");
        if active.is_binary() {
            let response = correlator.exchange(channel, Request::switch_mode(target), cancel)?;
            match response.status() {
                Some(status) if status.is_ok() => {},
                Some(status) => {
                    return Err(Error::ModeSwitch {
                        target,
                        reason: format!("{} answered {status}", Command::SwitchMode),
                    });
                },
                None => {
                    return Err(Error::Protocol("empty switch-mode response".to_string()));
                },
            }
        } else {
            let command = mode_command(target).ok_or_else(|| {
                Error::Protocol(format!("no text command enters {target} mode"))
            })?;
            match channel.command(command, self.timeout, cancel, lines)? {
                Reply::Ok(_) => {},
                Reply::Err(line) => {
                    return Err(Error::ModeSwitch {
                        target,
                        reason: line,
                    });
                },
            }
        }

        channel.set_rules(target.rules());
        correlator.set_mode(target);
        self.restore = target;
        info!("Entered {target} mode");
        Ok(Some(ModeChange {
            old: active,
            new: target,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::decoder::FrameDecoder;
    use crate::sim::SimulatedDevice;

    fn setup(version: &str) -> (Channel<SimulatedDevice>, Correlator, DeviceVersion, ModeController) {
        let device = SimulatedDevice::new(version);
        let mut channel = Channel::new(device, FrameDecoder::with_rules(DecodeRules::Lines), None);
        channel.open().unwrap();
        let correlator = Correlator::new(Mode::Cli, Duration::from_millis(50), 1);
        let controller = ModeController::new(Mode::Cli, Duration::from_millis(200));
        (channel, correlator, DeviceVersion::parse(version).unwrap(), controller)
    }

    #[test]
    fn test_mode_tags_roundtrip() {
        for mode in [Mode::Cli, Mode::Parameter, Mode::Bootloader] {
            assert_eq!(Mode::from_tag(mode.tag()), Some(mode));
        }
        assert_eq!(Mode::from_tag(0x42), None);
        assert_eq!("boot".parse::<Mode>().unwrap(), Mode::Bootloader);
    }

    #[test]
    fn test_switch_cli_to_parameter_and_back() {
        let (mut channel, mut correlator, version, mut modes) = setup("2.0.0");
        let cancel = CancelToken::new();

        let change = modes
            .switch(Mode::Parameter, &mut channel, &mut correlator, &version, &cancel, |_| {})
            .unwrap();
        assert_eq!(
            change,
            Some(ModeChange {
                old: Mode::Cli,
                new: Mode::Parameter
            })
        );
        assert_eq!(channel.rules(), DecodeRules::Frames);
        assert_eq!(modes.restore_target(), Mode::Parameter);

        let change = modes
            .switch(Mode::Cli, &mut channel, &mut correlator, &version, &cancel, |_| {})
            .unwrap();
        assert_eq!(change.map(|c| c.new), Some(Mode::Cli));
        assert_eq!(correlator.session().mode(), Mode::Cli);
        assert_eq!(channel.rules(), DecodeRules::Lines);
    }

    #[test]
    fn test_switch_to_active_mode_is_noop() {
        let (mut channel, mut correlator, version, mut modes) = setup("2.0.0");
        let change = modes
            .switch(Mode::Cli, &mut channel, &mut correlator, &version, &CancelToken::new(), |_| {})
            .unwrap();
        assert!(change.is_none());
    }

    #[test]
    fn test_old_device_cannot_enter_parameter_mode() {
        let (mut channel, mut correlator, version, mut modes) = setup("1.2.0");
        let err = modes
            .switch(Mode::Parameter, &mut channel, &mut correlator, &version, &CancelToken::new(), |_| {})
            .unwrap_err();
        assert!(matches!(err, Error::VersionMismatch { .. }));
        assert_eq!(correlator.session().mode(), Mode::Cli);
        assert_eq!(channel.rules(), DecodeRules::Lines);
    }

    #[test]
    fn test_refused_handshake_keeps_mode() {
        let (mut channel, mut correlator, version, mut modes) = setup("2.0.0");
        channel.transport().handle().refuse_mode_switch(true);
        let err = modes
            .switch(Mode::Bootloader, &mut channel, &mut correlator, &version, &CancelToken::new(), |_| {})
            .unwrap_err();
        assert!(matches!(err, Error::ModeSwitch { target: Mode::Bootloader, .. }));
        assert_eq!(correlator.session().mode(), Mode::Cli);
    }
}
