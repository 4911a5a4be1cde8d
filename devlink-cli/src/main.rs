//! devlink CLI - configure, diagnose and upgrade embedded devices.
//!
//! ## Features
//!
//! - Interactive CLI-mode terminal
//! - Parameter get/set and batch read/store
//! - Firmware upgrade with progress reporting
//! - Firmware image inspection
//! - Interactive serial port selection
//! - Shell completion generation
//! - Environment variable support
//! - Built-in simulated device (`--demo`)

use std::io::IsTerminal;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::Result;
use clap::{Parser, Subcommand, ValueEnum};
use clap_complete::Shell;
use console::style;
use env_logger::Env;
use log::debug;
use thiserror::Error;

mod commands;
mod config;
mod serial;

use config::Config;
use serial::{SerialOptions, ask_remember_port, select_serial_port};

/// Baud rate used when neither flag, environment nor config sets one.
pub(crate) const DEFAULT_BAUD: u32 = 115_200;

/// Whether stderr is a terminal (set once at startup).
static STDERR_IS_TTY: AtomicBool = AtomicBool::new(true);

/// Set by the Ctrl-C handler.
static INTERRUPTED: AtomicBool = AtomicBool::new(false);

/// Check if progress bars and colors should be used.
pub(crate) fn use_fancy_output() -> bool {
    STDERR_IS_TTY.load(Ordering::Relaxed) && console::colors_enabled_stderr()
}

/// Whether the user pressed Ctrl-C.
pub(crate) fn was_interrupted() -> bool {
    INTERRUPTED.load(Ordering::Relaxed)
}

/// Failures that map to a dedicated exit code.
#[derive(Debug, Error)]
pub(crate) enum CliError {
    /// Invalid invocation or missing setup (exit code 2).
    #[error("{0}")]
    Usage(String),
    /// The user cancelled (exit code 130).
    #[error("{0}")]
    Cancelled(String),
}

/// Exit code for `err`: 2 for usage errors, 130 for cancellation, 1 otherwise.
fn exit_code(err: &anyhow::Error) -> u8 {
    for cause in err.chain() {
        if let Some(cli_err) = cause.downcast_ref::<CliError>() {
            return match cli_err {
                CliError::Usage(_) => 2,
                CliError::Cancelled(_) => 130,
            };
        }
        if let Some(devlink::Error::Cancelled { .. }) = cause.downcast_ref::<devlink::Error>() {
            return 130;
        }
        if let Some(devlink::Error::Config(_)) = cause.downcast_ref::<devlink::Error>() {
            return 2;
        }
    }
    if was_interrupted() { 130 } else { 1 }
}

/// devlink - configure, diagnose and upgrade embedded devices over a serial link.
///
/// Environment variables:
///   DEVLINK_PORT              - Default serial port (or VID:PID for --transport dfu)
///   DEVLINK_BAUD              - Default baud rate (default: 115200)
///   DEVLINK_TRANSPORT         - Link kind (serial, dfu)
///   DEVLINK_DEMO              - Use the built-in simulated device
///   DEVLINK_NON_INTERACTIVE   - Non-interactive mode (disable prompts)
#[derive(Parser)]
#[command(name = "devlink")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
#[allow(clippy::struct_excessive_bools)]
pub(crate) struct Cli {
    /// Serial port to use (auto-detected if not specified).
    #[arg(short, long, global = true, env = "DEVLINK_PORT")]
    port: Option<String>,

    /// Baud rate.
    #[arg(short, long, global = true, env = "DEVLINK_BAUD")]
    baud: Option<u32>,

    /// Link kind.
    #[arg(short, long, global = true, env = "DEVLINK_TRANSPORT")]
    transport: Option<TransportArg>,

    /// Talk to the built-in simulated device instead of hardware.
    #[arg(long, global = true, env = "DEVLINK_DEMO")]
    demo: bool,

    /// Verbose output level (-v, -vv, -vvv for increasing detail).
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Quiet mode (suppress non-essential output).
    #[arg(short, long, global = true)]
    quiet: bool,

    /// Non-interactive mode (fail instead of prompting).
    #[arg(long, global = true, env = "DEVLINK_NON_INTERACTIVE")]
    non_interactive: bool,

    /// Path to a configuration file.
    #[arg(long = "config", global = true, value_name = "PATH")]
    config_path: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

/// Link kinds selectable on the command line.
#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub(crate) enum TransportArg {
    /// Serial VCP or UART bridge.
    Serial,
    /// USB DFU interface.
    Dfu,
}

/// Available commands.
#[derive(Subcommand)]
enum Commands {
    /// List available serial ports.
    ListPorts {
        /// Output port list as JSON to stdout.
        #[arg(long)]
        json: bool,
    },

    /// Open an interactive console on the device's command line.
    Terminal {
        /// Prefix received lines with the time they arrived.
        #[arg(long)]
        timestamp: bool,

        /// Append sent and received lines to this file, tagged with time and source.
        #[arg(long, value_name = "PATH")]
        log: Option<PathBuf>,
    },

    /// Connect and show the link state and traffic counters.
    Status {
        /// Output status as JSON to stdout.
        #[arg(long)]
        json: bool,
    },

    /// Read and write device parameters.
    Params {
        #[command(subcommand)]
        action: ParamsCommand,
    },

    /// Install a firmware image.
    Upgrade {
        /// Path to the firmware image.
        image: PathBuf,

        /// Check the image CRC/digest before installing.
        #[arg(long)]
        validate: bool,

        /// Bytes per data request.
        #[arg(long, value_parser = clap::value_parser!(u16).range(1..))]
        chunk_size: Option<u16>,

        /// Do not ask for confirmation.
        #[arg(short, long)]
        yes: bool,
    },

    /// Show information about a firmware image.
    ImageInfo {
        /// Path to the firmware image.
        image: PathBuf,

        /// Output information as JSON to stdout.
        #[arg(long)]
        json: bool,
    },

    /// Generate shell completion scripts.
    Completions {
        /// Shell type for completions (auto-detected if not specified with --install).
        #[arg(value_enum)]
        shell: Option<Shell>,

        /// Automatically install completions to your shell configuration.
        #[arg(long)]
        install: bool,
    },
}

/// Parameter subcommands.
#[derive(Subcommand)]
enum ParamsCommand {
    /// Show the parameter table as listed by the device.
    List {
        /// Output the table as JSON to stdout.
        #[arg(long)]
        json: bool,
    },

    /// Read parameters by name or id.
    Get {
        /// Parameter names or ids.
        #[arg(required = true)]
        names: Vec<String>,

        /// Output values as JSON to stdout.
        #[arg(long)]
        json: bool,
    },

    /// Write one parameter.
    Set {
        /// Parameter name or id.
        name: String,

        /// New value (enum values by name or index).
        value: String,

        /// Also store the value in non-volatile memory.
        #[arg(long)]
        persist: bool,
    },

    /// Read every readable parameter.
    ReadAll {
        /// Output the report as JSON to stdout.
        #[arg(long)]
        json: bool,
    },

    /// Store every stored parameter, optionally after staging new values.
    StoreAll {
        /// Values to stage first (format: name=value, can be repeated).
        #[arg(value_parser = parse_assignment)]
        assignments: Vec<(String, String)>,

        /// Output the report as JSON to stdout.
        #[arg(long)]
        json: bool,
    },
}

/// Parse an assignment in format "name=value".
fn parse_assignment(s: &str) -> Result<(String, String), String> {
    match s.split_once('=') {
        Some((name, value)) if !name.trim().is_empty() => {
            Ok((name.trim().to_string(), value.to_string()))
        },
        _ => Err(format!(
            "Invalid format: '{s}'. Expected 'name=value' (e.g., 'gain=12')"
        )),
    }
}

/// Parse a USB selector in format "VID:PID" (hexadecimal).
pub(crate) fn parse_vid_pid(s: &str) -> Result<(u16, u16), String> {
    let (vid, pid) = s
        .split_once(':')
        .ok_or_else(|| format!("Invalid USB selector: '{s}'. Expected 'VID:PID' (e.g., '0483:df11')"))?;
    let parse = |part: &str| {
        let part = part
            .trim()
            .trim_start_matches("0x")
            .trim_start_matches("0X");
        u16::from_str_radix(part, 16).map_err(|e| format!("Invalid USB id '{part}': {e}"))
    };
    Ok((parse(vid)?, parse(pid)?))
}

fn main() -> ExitCode {
    let stderr_is_tty = std::io::stderr().is_terminal();
    STDERR_IS_TTY.store(stderr_is_tty, Ordering::Relaxed);
    if std::env::var_os("NO_COLOR").is_some() || !stderr_is_tty {
        console::set_colors_enabled(false);
        console::set_colors_enabled_stderr(false);
    }

    let cli = Cli::parse();

    let log_level = if cli.quiet {
        "error"
    } else {
        match cli.verbose {
            0 => "warn",
            1 => "info",
            2 => "debug",
            _ => "trace",
        }
    };
    env_logger::Builder::from_env(Env::default().default_filter_or(log_level))
        .format_target(cli.verbose >= 2)
        .format_timestamp(None)
        .init();

    debug!(
        "devlink v{} (verbose level: {})",
        env!("CARGO_PKG_VERSION"),
        cli.verbose
    );

    if let Err(e) = ctrlc::set_handler(|| INTERRUPTED.store(true, Ordering::Relaxed)) {
        debug!("Could not install Ctrl-C handler: {e}");
    }
    devlink::set_interrupt_checker(was_interrupted);

    match run(&cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("{} {e:#}", style("Error:").red().bold());
            ExitCode::from(exit_code(&e))
        },
    }
}

fn run(cli: &Cli) -> Result<()> {
    let mut config = if let Some(ref path) = cli.config_path {
        Config::load_from_path(path)
    } else {
        Config::load()
    };

    match &cli.command {
        Commands::ListPorts { json } => {
            commands::ports::cmd_list_ports(*json);
            Ok(())
        },
        Commands::Terminal { timestamp, log } => {
            commands::terminal::cmd_terminal(cli, &mut config, *timestamp, log.as_deref())
        },
        Commands::Status { json } => commands::status::cmd_status(cli, &mut config, *json),
        Commands::Params { action } => match action {
            ParamsCommand::List { json } => commands::params::cmd_list(cli, &mut config, *json),
            ParamsCommand::Get { names, json } => {
                commands::params::cmd_get(cli, &mut config, names, *json)
            },
            ParamsCommand::Set {
                name,
                value,
                persist,
            } => commands::params::cmd_set(cli, &mut config, name, value, *persist),
            ParamsCommand::ReadAll { json } => {
                commands::params::cmd_read_all(cli, &mut config, *json)
            },
            ParamsCommand::StoreAll { assignments, json } => {
                commands::params::cmd_store_all(cli, &mut config, assignments, *json)
            },
        },
        Commands::Upgrade {
            image,
            validate,
            chunk_size,
            yes,
        } => {
            if *validate {
                config.engine.validate_image = Some(true);
            }
            if let Some(size) = chunk_size {
                config.engine.chunk_size = Some(usize::from(*size));
            }
            commands::upgrade::cmd_upgrade(cli, &mut config, image, *yes)
        },
        Commands::ImageInfo { image, json } => commands::image::cmd_image_info(image, *json),
        Commands::Completions { shell, install } => {
            if *install {
                commands::completions::cmd_completions_install(*shell)
            } else {
                let shell = shell.ok_or_else(|| {
                    CliError::Usage(
                        "specify a shell type, e.g.: devlink completions bash \
                         (or use --install to auto-install)"
                            .to_string(),
                    )
                })?;
                commands::completions::cmd_completions(shell);
                Ok(())
            }
        },
    }
}

/// Get serial port from CLI args, config or interactive selection.
pub(crate) fn get_port(cli: &Cli, config: &mut Config) -> Result<String> {
    let options = SerialOptions {
        port: cli.port.clone(),
        non_interactive: cli.non_interactive,
    };

    let selected = select_serial_port(&options, config)?;

    if !selected.is_known && !cli.non_interactive && std::io::stdin().is_terminal() {
        ask_remember_port(&selected.port, config)?;
    }

    Ok(selected.port.name)
}
