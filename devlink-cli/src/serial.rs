//! Interactive serial port selection.
//!
//! Explicit `--port` wins, then the configured port, then auto-detection
//! with a prompt when several candidates remain. Non-interactive mode never
//! prompts.

use {
    crate::{CliError, config::Config},
    anyhow::Result,
    console::style,
    devlink::{DetectedPort, detect_ports},
    dialoguer::{Confirm, Error as DialoguerError, Select, theme::ColorfulTheme},
    log::{debug, error, info},
    std::{cmp::Ordering, io::IsTerminal},
};

/// Options for serial port selection.
#[derive(Debug, Clone, Default)]
pub struct SerialOptions {
    /// Explicit port specified via CLI.
    pub port: Option<String>,
    /// Non-interactive mode (fail if the choice is ambiguous).
    pub non_interactive: bool,
}

/// Result of port selection including whether it was a known device.
pub struct SelectedPort {
    /// The selected port info.
    pub port: DetectedPort,
    /// Whether this port matched a known or remembered device.
    pub is_known: bool,
}

fn usage_err(message: &str) -> anyhow::Error {
    CliError::Usage(message.to_string()).into()
}

fn select_non_interactive_port(
    candidates: Vec<DetectedPort>,
    config: &Config,
) -> Result<SelectedPort> {
    let mut candidates = candidates.into_iter();
    match (candidates.next(), candidates.next()) {
        (Some(port), None) => Ok(SelectedPort {
            is_known: is_known_device(&port, config),
            port,
        }),
        (Some(_), Some(_)) => Err(usage_err(
            "multiple ports found; pass --port to choose one",
        )),
        (None, _) => Err(usage_err("no serial ports available")),
    }
}

/// Select a serial port interactively or automatically.
pub fn select_serial_port(options: &SerialOptions, config: &Config) -> Result<SelectedPort> {
    if let Some(port_name) = &options.port {
        return Ok(find_port_by_name(port_name, detect_ports()));
    }

    if let Some(port_name) = &config.connection.port {
        debug!("Using port from config: {port_name}");
        return Ok(find_port_by_name(port_name, detect_ports()));
    }

    let ports = detect_ports();
    if ports.is_empty() {
        return Err(usage_err(
            "no serial ports found; connect a device or pass --demo",
        ));
    }

    // Known devices first; fall back to every port when none is known
    let known: Vec<DetectedPort> = ports
        .iter()
        .filter(|p| is_known_device(p, config))
        .cloned()
        .collect();
    let candidates = if known.is_empty() { ports } else { known };

    if options.non_interactive {
        return select_non_interactive_port(candidates, config);
    }

    match candidates.len().cmp(&1) {
        Ordering::Greater => {
            ensure_interactive_terminal()?;
            select_port_interactive(candidates, config)
        },
        Ordering::Equal => {
            let port = candidates
                .into_iter()
                .next()
                .ok_or_else(|| usage_err("no serial ports available"))?;
            let is_known = is_known_device(&port, config);
            if is_known {
                info!("Auto-selected port: {}", port.describe());
                Ok(SelectedPort { port, is_known })
            } else {
                ensure_interactive_terminal()?;
                confirm_single_port(port)
            }
        },
        Ordering::Less => Err(usage_err("no serial ports available")),
    }
}

fn ensure_interactive_terminal() -> Result<()> {
    if std::io::stdin().is_terminal() && std::io::stderr().is_terminal() {
        Ok(())
    } else {
        Err(usage_err(
            "port selection needs a terminal; pass --port or --non-interactive",
        ))
    }
}

fn map_prompt_error(err: DialoguerError) -> anyhow::Error {
    match err {
        DialoguerError::IO(io_err) if io_err.kind() == std::io::ErrorKind::Interrupted => {
            CliError::Cancelled("port selection cancelled".to_string()).into()
        },
        DialoguerError::IO(io_err) => usage_err(&format!("prompt failed: {io_err}")),
    }
}

/// Find a port by name among `ports`, or a placeholder if enumeration missed it.
fn find_port_by_name(name: &str, ports: Vec<DetectedPort>) -> SelectedPort {
    let found = ports
        .into_iter()
        .find(|p| p.name == name || p.name.eq_ignore_ascii_case(name));
    match found {
        Some(port) => SelectedPort {
            is_known: port.device.is_known(),
            port,
        },
        None => SelectedPort {
            port: DetectedPort::named(name),
            is_known: false,
        },
    }
}

/// Check if a port matches a built-in or remembered device.
fn is_known_device(port: &DetectedPort, config: &Config) -> bool {
    if port.device.is_known() {
        return true;
    }
    matches!((port.vid, port.pid), (Some(vid), Some(pid)) if config.is_remembered(vid, pid))
}

fn select_port_interactive(mut ports: Vec<DetectedPort>, config: &Config) -> Result<SelectedPort> {
    eprintln!(
        "{} Found {} serial ports",
        style("ℹ").blue(),
        ports.len()
    );

    ports.sort_by_key(|p| !is_known_device(p, config));

    let term_width = console::Term::stderr().size().1 as usize;
    let max_item_width = term_width.saturating_sub(4);
    let labels: Vec<String> = ports
        .iter()
        .map(|port| {
            let label = if is_known_device(port, config) {
                style(port.describe()).bold().to_string()
            } else {
                port.describe()
            };
            console::truncate_str(&label, max_item_width, "\u{2026}").into_owned()
        })
        .collect();

    let selection = Select::with_theme(&ColorfulTheme::default())
        .with_prompt("Select a serial port")
        .items(&labels)
        .default(0)
        .interact_opt()
        .map_err(map_prompt_error)?;

    match selection {
        Some(index) => {
            let port = ports
                .into_iter()
                .nth(index)
                .ok_or_else(|| anyhow::anyhow!("Invalid port index: {index}"))?;
            let is_known = is_known_device(&port, config);
            Ok(SelectedPort { port, is_known })
        },
        None => Err(CliError::Cancelled("port selection cancelled".to_string()).into()),
    }
}

fn confirm_single_port(port: DetectedPort) -> Result<SelectedPort> {
    let confirmed = Confirm::with_theme(&ColorfulTheme::default())
        .with_prompt(format!("Use {}?", port.describe()))
        .default(true)
        .interact_opt()
        .map_err(map_prompt_error)?
        .unwrap_or(false);

    if confirmed {
        Ok(SelectedPort {
            port,
            is_known: false,
        })
    } else {
        Err(CliError::Cancelled("port selection cancelled".to_string()).into())
    }
}

/// Offer to remember an unrecognized USB device for later auto-selection.
pub fn ask_remember_port(port: &DetectedPort, config: &mut Config) -> Result<()> {
    let (Some(vid), Some(pid)) = (port.vid, port.pid) else {
        return Ok(());
    };
    if config.is_remembered(vid, pid) {
        return Ok(());
    }

    let confirmed = Confirm::with_theme(&ColorfulTheme::default())
        .with_prompt(format!("Remember {vid:04X}:{pid:04X} for next time?"))
        .default(false)
        .interact_opt()
        .map_err(map_prompt_error)?
        .unwrap_or(false);

    if confirmed {
        if let Err(e) = config.remember_usb_device(vid, pid) {
            error!("Failed to save port configuration: {e}");
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use devlink::DeviceKind;

    fn port(name: &str, vid: Option<u16>, pid: Option<u16>) -> DetectedPort {
        let mut port = DetectedPort::named(name);
        port.vid = vid;
        port.pid = pid;
        if let (Some(vid), Some(pid)) = (vid, pid) {
            port.device = DeviceKind::from_vid_pid(vid, pid);
        }
        port
    }

    #[test]
    fn test_serial_options_default() {
        let options = SerialOptions::default();
        assert!(options.port.is_none());
        assert!(!options.non_interactive);
    }

    #[test]
    fn test_is_known_device_builtin() {
        let vcp = port("/dev/ttyACM0", Some(0x0483), Some(0x5740));
        assert!(is_known_device(&vcp, &Config::default()));
    }

    #[test]
    fn test_is_known_device_unknown() {
        let other = port("/dev/ttyUSB0", Some(0x9999), Some(0x9999));
        assert!(!is_known_device(&other, &Config::default()));
        let bare = port("/dev/ttyS0", None, None);
        assert!(!is_known_device(&bare, &Config::default()));
    }

    #[test]
    fn test_is_known_device_remembered() {
        let other = port("/dev/ttyUSB0", Some(0xABCD), Some(0x1234));
        let mut config = Config::default();
        config
            .connection
            .usb_device
            .push(crate::config::UsbDevice {
                vid: 0xABCD,
                pid: 0x1234,
            });
        assert!(is_known_device(&other, &config));
    }

    #[test]
    fn test_find_port_by_name_placeholder() {
        let selected = find_port_by_name("/dev/ttyACM7", vec![port("/dev/ttyACM0", None, None)]);
        assert_eq!(selected.port.name, "/dev/ttyACM7");
        assert!(!selected.is_known);
    }

    #[test]
    fn test_find_port_by_name_case_insensitive() {
        let selected = find_port_by_name("com3", vec![port("COM3", Some(0x0483), Some(0x5740))]);
        assert_eq!(selected.port.name, "COM3");
        assert!(selected.is_known);
    }

    #[test]
    fn test_select_non_interactive_multiple_ports_returns_usage_error() {
        let ports = vec![port("/dev/ttyUSB0", None, None), port("/dev/ttyUSB1", None, None)];
        let err = select_non_interactive_port(ports, &Config::default())
            .err()
            .unwrap();
        assert!(matches!(err.downcast_ref::<CliError>(), Some(CliError::Usage(_))));
    }

    #[test]
    fn test_select_non_interactive_no_ports_returns_usage_error() {
        let err = select_non_interactive_port(vec![], &Config::default())
            .err()
            .unwrap();
        assert!(matches!(err.downcast_ref::<CliError>(), Some(CliError::Usage(_))));
    }

    #[test]
    fn test_select_non_interactive_single_port_returns_selected_port() {
        let selected =
            select_non_interactive_port(vec![port("/dev/ttyUSB0", None, None)], &Config::default())
                .unwrap();
        assert_eq!(selected.port.name, "/dev/ttyUSB0");
        assert!(!selected.is_known);
    }
}
