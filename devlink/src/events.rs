//! Events the engine reports to its subscriber.
//!
//! Every engine has at most one outbound queue; see
//! [`crate::Engine::subscribe`].

use std::fmt;
use std::sync::mpsc::Sender;
use std::time::SystemTime;

use crate::mode::Mode;
use crate::param::{BatchReport, ParameterValue, SyncStatus};
use crate::supervisor::ConnectionState;
use crate::upgrade::UpgradeState;

/// Who produced a line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum LineSource {
    /// Received from the device.
    Device,
    /// Sent by the host.
    Host,
    /// Generated by the engine (link status notes).
    System,
}

impl fmt::Display for LineSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Device => f.write_str("device"),
            Self::Host => f.write_str("host"),
            Self::System => f.write_str("system"),
        }
    }
}

/// One line of the CLI-mode conversation.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Line {
    /// Text without terminator.
    pub text: String,
    /// When the line was produced.
    pub timestamp: SystemTime,
    /// Producer.
    pub source: LineSource,
}

impl Line {
    /// Line stamped now.
    pub fn new(text: impl Into<String>, source: LineSource) -> Self {
        Self {
            text: text.into(),
            timestamp: SystemTime::now(),
            source,
        }
    }
}

/// Engine notification.
#[derive(Debug, Clone)]
pub enum Event {
    /// A line was received, sent or generated.
    LineReceived(Line),
    /// A parameter's value or sync status changed.
    ParameterUpdated {
        /// Parameter id.
        id: u16,
        /// Current host-side value.
        value: Option<ParameterValue>,
        /// New status.
        status: SyncStatus,
    },
    /// A batch operation finished.
    BatchOperationCompleted(BatchReport),
    /// The active mode changed.
    ModeChanged {
        /// Previous mode.
        old: Mode,
        /// New mode.
        new: Mode,
    },
    /// The connection state changed.
    ConnectionStateChanged {
        /// Previous state.
        old: ConnectionState,
        /// New state.
        new: ConnectionState,
    },
    /// An upgrade advanced or failed. `Failed` carries the reason.
    UpgradeProgress {
        /// Session state.
        state: UpgradeState,
        /// Transferred share of the image, 0..=100.
        percent: u8,
    },
}

/// Send `event` if someone listens. A dropped receiver is not an error.
pub(crate) fn publish(events: Option<&Sender<Event>>, event: Event) {
    if let Some(tx) = events {
        let _ = tx.send(event);
    }
}
