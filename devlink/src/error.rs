//! Error types for devlink.

use std::io;
use thiserror::Error;

use crate::mode::Mode;
use crate::param::AccessViolation;
use crate::protocol::Status;
use crate::upgrade::UpgradeState;

/// Result type for devlink operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Framing failures reported by the frame decoder.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FramingError {
    /// Frame checksum did not match its contents.
    #[error("checksum mismatch: expected {expected:#04x}, got {actual:#04x}")]
    Checksum {
        /// Checksum computed over the received bytes.
        expected: u8,
        /// Checksum carried by the frame.
        actual: u8,
    },

    /// Frame payload did not arrive completely before the inter-byte deadline.
    #[error("truncated frame: declared {declared} payload bytes, received {received}")]
    Truncated {
        /// Payload length declared in the header.
        declared: usize,
        /// Payload bytes actually received.
        received: usize,
    },

    /// Declared payload length exceeds the protocol maximum.
    #[error("declared payload length {declared} exceeds maximum {max}")]
    Oversized {
        /// Payload length declared in the header.
        declared: usize,
        /// Maximum accepted payload length.
        max: usize,
    },

    /// A text line exceeded the configured maximum length.
    #[error("line exceeds {max} bytes")]
    LineTooLong {
        /// Maximum accepted line length.
        max: usize,
    },
}

/// Error type for devlink operations.
#[derive(Debug, Error)]
pub enum Error {
    /// I/O error (serial port, file operations).
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Serial port error.
    #[cfg(feature = "native")]
    #[error("Serial port error: {0}")]
    Serial(#[from] serialport::Error),

    /// Transport could not be opened or used.
    #[error("Transport error: {0}")]
    Transport(String),

    /// The link to the device was lost.
    #[error("Link lost{}", fmt_sequence(.sequence))]
    LinkLost {
        /// Sequence number of the request that was outstanding, if any.
        sequence: Option<u16>,
    },

    /// A frame could not be decoded.
    #[error("Framing error{}: {source}", fmt_sequence(.sequence))]
    Framing {
        /// Sequence number of the request the failure was attributed to.
        sequence: Option<u16>,
        /// Underlying framing failure.
        #[source]
        source: FramingError,
    },

    /// No response arrived within the deadline after all retries.
    #[error("Timeout{} after {attempts} attempt(s)", fmt_sequence(.sequence))]
    Timeout {
        /// Sequence number of the request, if the exchange was sequenced.
        sequence: Option<u16>,
        /// Number of transmissions made.
        attempts: u32,
    },

    /// The caller canceled the operation.
    #[error("Cancelled{}", fmt_sequence(.sequence))]
    Cancelled {
        /// Sequence number of the request that was canceled, if any.
        sequence: Option<u16>,
    },

    /// Device protocol version is incompatible with the requested feature.
    #[error("Device version {device} does not support {feature} (requires {required})")]
    VersionMismatch {
        /// Version reported by the device.
        device: String,
        /// Version requirement of the feature.
        required: String,
        /// Feature that was requested.
        feature: String,
    },

    /// Parameter access, type or persistence violation.
    #[error("Parameter {id}: {violation}")]
    ParameterAccess {
        /// Parameter id.
        id: u16,
        /// What was violated.
        violation: AccessViolation,
    },

    /// Device rejected a parameter operation.
    #[error("Parameter {id} rejected by device: {status}")]
    Rejected {
        /// Parameter id.
        id: u16,
        /// Status returned by the device.
        status: Status,
    },

    /// Device answered a non-parameter command with a failure status.
    #[error("Device refused {command}: {status}")]
    DeviceStatus {
        /// Command that was refused.
        command: &'static str,
        /// Status returned by the device.
        status: Status,
    },

    /// Firmware image file is malformed.
    #[error("Invalid firmware image: {0}")]
    InvalidImage(String),

    /// Firmware image failed CRC or digest validation.
    #[error("Image validation failed: {0}")]
    UpgradeValidation(String),

    /// Upgrade operation attempted out of order.
    #[error("Cannot {operation} while upgrade is {state}")]
    UpgradeSequence {
        /// State the session was in.
        state: UpgradeState,
        /// Operation that was attempted.
        operation: &'static str,
    },

    /// Operation requires a different protocol mode.
    #[error("Operation requires {expected} mode, but {active} mode is active")]
    WrongMode {
        /// Mode the operation needs.
        expected: Mode,
        /// Mode currently active.
        active: Mode,
    },

    /// Device refused or failed the mode-switch handshake.
    #[error("Cannot enter {target} mode: {reason}")]
    ModeSwitch {
        /// Mode that was requested.
        target: Mode,
        /// Why the handshake failed.
        reason: String,
    },

    /// The engine cannot accept the operation right now.
    #[error("Busy: {0}")]
    Busy(String),

    /// No connection to a device.
    #[error("Not connected")]
    NotConnected,

    /// Protocol error.
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Unsupported transport or operation.
    #[error("Unsupported: {0}")]
    Unsupported(String),

    /// Configuration error.
    #[error("Configuration error: {0}")]
    Config(String),
}

impl Error {
    /// Returns `true` for failures that put the link itself in doubt.
    ///
    /// These escalate to the reconnection supervisor instead of being
    /// retried by the caller.
    pub fn is_link_failure(&self) -> bool {
        match self {
            Self::Io(_) | Self::Transport(_) | Self::LinkLost { .. } => true,
            #[cfg(feature = "native")]
            Self::Serial(_) => true,
            Self::Framing { .. } | Self::Timeout { .. } => true,
            _ => false,
        }
    }

    /// Sequence number associated with the failure, if any.
    pub fn sequence(&self) -> Option<u16> {
        match self {
            Self::LinkLost { sequence }
            | Self::Framing { sequence, .. }
            | Self::Timeout { sequence, .. }
            | Self::Cancelled { sequence } => *sequence,
            _ => None,
        }
    }
}

#[allow(clippy::ref_option)]
fn fmt_sequence(sequence: &Option<u16>) -> String {
    sequence.map_or_else(String::new, |seq| format!(" (seq {seq})"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_includes_sequence() {
        let err = Error::Timeout {
            sequence: Some(7),
            attempts: 3,
        };
        assert_eq!(err.to_string(), "Timeout (seq 7) after 3 attempt(s)");

        let err = Error::LinkLost { sequence: None };
        assert_eq!(err.to_string(), "Link lost");
    }

    #[test]
    fn test_link_failure_classification() {
        assert!(Error::LinkLost { sequence: Some(1) }.is_link_failure());
        assert!(
            Error::Framing {
                sequence: None,
                source: FramingError::Checksum {
                    expected: 1,
                    actual: 2
                }
            }
            .is_link_failure()
        );
        assert!(!Error::NotConnected.is_link_failure());
        assert!(
            !Error::Rejected {
                id: 3,
                status: Status::InvalidValue
            }
            .is_link_failure()
        );
    }

    #[test]
    fn test_sequence_accessor() {
        assert_eq!(Error::Cancelled { sequence: Some(9) }.sequence(), Some(9));
        assert_eq!(Error::NotConnected.sequence(), None);
    }
}
