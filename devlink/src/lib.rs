//! # devlink
//!
//! A protocol engine for embedded devices that speak three protocols over
//! one link:
//!
//! - **CLI mode**: a line-oriented text console
//! - **Parameter mode**: typed parameter reads and writes in binary frames
//! - **Bootloader mode**: firmware image transfer and activation
//!
//! One [`Engine`] owns the link. It negotiates the device's CLI version,
//! loads the parameter table, switches modes with the device's handshake,
//! correlates binary requests with their responses, and reconnects with
//! backoff when the link drops. Everything it observes is reported as
//! [`Event`]s on one queue.
//!
//! ## Features
//!
//! - `native` (default): serial transport via the `serialport` crate
//! - `dfu`: USB DFU transport via `nusb` (experimental)
//! - `serde`: serialization support for data types
//!
//! ## Example
//!
//! ```rust,no_run
//! use devlink::{Engine, EngineConfig, Mode, SerialConfig, TransportConfig, create_transport};
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let transport = create_transport(&TransportConfig::Serial(SerialConfig::new(
//!         "/dev/ttyACM0",
//!         115200,
//!     )))?;
//!     let mut engine = Engine::new(
//!         transport,
//!         EngineConfig::default().with_initial_mode(Mode::Parameter),
//!     );
//!     engine.connect()?;
//!
//!     let report = engine.read_all()?;
//!     for (id, reason) in report.failures() {
//!         eprintln!("parameter {id}: {reason}");
//!     }
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

use std::sync::{Arc, OnceLock};

pub mod config;
pub mod correlator;
pub mod device;
pub mod engine;
pub mod error;
pub mod events;
pub mod handle;
pub mod image;
pub mod mode;
pub mod param;
pub mod protocol;
pub mod session;
pub mod sim;
pub mod stats;
pub mod supervisor;
pub mod transport;
pub mod upgrade;
pub mod version;

static INTERRUPT_CHECKER: OnceLock<Arc<dyn Fn() -> bool + Send + Sync>> = OnceLock::new();

/// Register a global interruption checker.
///
/// Every [`CancelToken`] also reports cancellation while the checker returns
/// `true` (for example after Ctrl-C in a command-line shell).
pub fn set_interrupt_checker<F>(checker: F)
where
    F: Fn() -> bool + Send + Sync + 'static,
{
    let _ = INTERRUPT_CHECKER.set(Arc::new(checker));
}

/// Returns whether interruption was requested by the embedding application.
#[must_use]
pub fn is_interrupted_requested() -> bool {
    INTERRUPT_CHECKER
        .get()
        .is_some_and(|checker| checker())
}

pub use {
    config::{BackoffConfig, EngineConfig},
    device::{DetectedPort, DeviceKind, auto_detect_port, detect_ports},
    engine::Engine,
    error::{Error, FramingError, Result},
    events::{Event, Line, LineSource},
    handle::{EngineHandle, Ticket},
    image::{FirmwareImage, ImageBuilder, ImageHeader},
    mode::{Mode, ModeChange},
    param::{
        Access, AccessViolation, BatchItem, BatchKind, BatchReport, FailureReason, Parameter,
        ParameterTable, ParameterType, ParameterValue, Persistence, Range, SyncStatus,
    },
    protocol::{Command, Frame, Request, Status},
    session::CancelToken,
    sim::{SimHandle, SimulatedDevice},
    stats::LinkStats,
    supervisor::ConnectionState,
    transport::{
        DfuConfig, SerialConfig, Transport, TransportConfig, TransportKind, create_transport,
    },
    upgrade::{AbortOutcome, BootloaderVariant, UpgradeFailure, UpgradeSession, UpgradeState},
    version::DeviceVersion,
};
