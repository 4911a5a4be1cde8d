//! Command implementations.
//!
//! Each subcommand is implemented in its own module; [`Session`] is the
//! shared way of reaching a device.

pub(crate) mod completions;
pub(crate) mod image;
pub(crate) mod params;
pub(crate) mod ports;
pub(crate) mod status;
pub(crate) mod terminal;
pub(crate) mod upgrade;

use std::sync::mpsc::Receiver;

use anyhow::{Context, Result};
use console::style;
use devlink::{
    DfuConfig, Engine, EngineHandle, Event, Mode, SerialConfig, SimulatedDevice, Transport,
    TransportConfig, create_transport,
};
use log::debug;

use crate::config::Config;
use crate::{Cli, CliError, DEFAULT_BAUD, TransportArg, get_port, parse_vid_pid};

/// Any transport the command line can open.
pub(crate) type Link = Box<dyn Transport>;

/// A connected engine running on its actor thread.
pub(crate) struct Session {
    pub(crate) handle: EngineHandle<Link>,
    pub(crate) events: Receiver<Event>,
}

impl Session {
    /// Open the configured link and connect, entering `mode`.
    pub(crate) fn open(cli: &Cli, config: &mut Config, mode: Mode) -> Result<Self> {
        let transport = open_transport(cli, config)?;
        let name = transport.name().to_string();
        let engine = Engine::new(transport, config.engine_config().with_initial_mode(mode));
        let (handle, events) = EngineHandle::spawn(engine)?;

        if !cli.quiet {
            eprintln!("{} Connecting to {}", style("⏳").yellow(), style(&name).cyan());
        }
        handle
            .connect()
            .wait()
            .with_context(|| format!("failed to connect to {name}"))?;

        let version = handle
            .submit(|engine| Ok(engine.version().map(ToString::to_string)))
            .wait()?
            .unwrap_or_default();
        if !cli.quiet {
            eprintln!(
                "{} Connected ({}, {} mode)",
                style("✓").green(),
                version,
                mode
            );
        }

        Ok(Self { handle, events })
    }

    /// Disconnect and stop the engine thread.
    pub(crate) fn close(self) {
        let Self { handle, events } = self;
        handle.shutdown();
        drop(events);
    }
}

/// Resolve the link kind from flags, then config; serial by default.
fn transport_kind(cli: &Cli, config: &Config) -> Result<TransportArg> {
    if let Some(kind) = cli.transport {
        return Ok(kind);
    }
    match config.connection.transport.as_deref() {
        None | Some("serial") => Ok(TransportArg::Serial),
        Some("dfu") => Ok(TransportArg::Dfu),
        Some(other) => Err(CliError::Usage(format!(
            "unknown transport '{other}' in config (expected 'serial' or 'dfu')"
        ))
        .into()),
    }
}

fn open_transport(cli: &Cli, config: &mut Config) -> Result<Link> {
    if cli.demo {
        debug!("Using the simulated demo device");
        return Ok(Box::new(SimulatedDevice::demo()));
    }

    let transport_config = match transport_kind(cli, config)? {
        TransportArg::Serial => {
            let port = get_port(cli, config)?;
            let baud = cli
                .baud
                .or(config.connection.baud)
                .unwrap_or(DEFAULT_BAUD);
            TransportConfig::Serial(SerialConfig::new(port, baud))
        },
        TransportArg::Dfu => TransportConfig::UsbDfu(dfu_selector(cli, config)?),
    };
    debug!("Opening {} transport", transport_config.kind());
    Ok(create_transport(&transport_config)?)
}

/// DFU device from `--port VID:PID` or the `[connection]` section.
fn dfu_selector(cli: &Cli, config: &Config) -> Result<DfuConfig> {
    if let Some(selector) = &cli.port {
        let (vid, pid) = parse_vid_pid(selector).map_err(CliError::Usage)?;
        let mut dfu = DfuConfig::new(vid, pid);
        if let Some(interface) = config.connection.dfu_interface {
            dfu.interface = interface;
        }
        return Ok(dfu);
    }
    config.connection.dfu().ok_or_else(|| {
        CliError::Usage(
            "DFU transport needs --port VID:PID or dfu_vid/dfu_pid in [connection]".to_string(),
        )
        .into()
    })
}
