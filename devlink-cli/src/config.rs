//! Configuration file support for devlink.
//!
//! Configuration is loaded from multiple sources with the following priority (highest first):
//! 1. Command-line arguments
//! 2. Environment variables (DEVLINK_*)
//! 3. Local config file (./devlink.toml or ./.devlink.toml)
//! 4. Global config file (~/.config/devlink/config.toml)

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use devlink::{BackoffConfig, DfuConfig, EngineConfig};
use directories::ProjectDirs;
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};

/// Local config file names, checked in order.
const LOCAL_CONFIG_FILES: &[&str] = &["devlink.toml", ".devlink.toml"];

/// USB device identification for port matching.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct UsbDevice {
    /// USB Vendor ID.
    pub vid: u16,
    /// USB Product ID.
    pub pid: u16,
}

impl UsbDevice {
    /// Check if this device matches the given USB info.
    pub fn matches(&self, vid: u16, pid: u16) -> bool {
        self.vid == vid && self.pid == pid
    }
}

/// `[connection]` section.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConnectionConfig {
    /// Link kind: "serial" or "dfu".
    pub transport: Option<String>,
    /// Preferred serial port (e.g., "/dev/ttyACM0" or "COM3").
    pub port: Option<String>,
    /// Baud rate.
    pub baud: Option<u32>,
    /// DFU vendor ID.
    pub dfu_vid: Option<u16>,
    /// DFU product ID.
    pub dfu_pid: Option<u16>,
    /// DFU interface number.
    pub dfu_interface: Option<u8>,
    /// Remembered USB devices, preferred during port selection.
    #[serde(default)]
    pub usb_device: Vec<UsbDevice>,
}

impl ConnectionConfig {
    /// DFU selector, if both IDs are configured.
    pub fn dfu(&self) -> Option<DfuConfig> {
        let (vid, pid) = (self.dfu_vid?, self.dfu_pid?);
        let mut dfu = DfuConfig::new(vid, pid);
        if let Some(interface) = self.dfu_interface {
            dfu.interface = interface;
        }
        Some(dfu)
    }
}

/// `[engine]` section. Unset keys keep the engine defaults.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EngineSection {
    /// Per-attempt request timeout in milliseconds.
    pub request_timeout_ms: Option<u64>,
    /// Retries after a timed-out request.
    pub max_retries: Option<u32>,
    /// Heartbeat window in milliseconds; 0 disables heartbeats.
    pub heartbeat_ms: Option<u64>,
    /// Check image CRC/digest before installing.
    pub validate_image: Option<bool>,
    /// Upgrade chunk size in bytes.
    pub chunk_size: Option<usize>,
    /// First reconnect delay in milliseconds.
    pub backoff_initial_ms: Option<u64>,
    /// Longest reconnect delay in milliseconds.
    pub backoff_max_ms: Option<u64>,
    /// Delay growth factor.
    pub backoff_multiplier: Option<f64>,
}

/// Main configuration structure.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Connection settings.
    #[serde(default)]
    pub connection: ConnectionConfig,
    /// Engine tuning.
    #[serde(default)]
    pub engine: EngineSection,
    /// File that remembered devices are written to.
    #[serde(skip)]
    source: Option<PathBuf>,
}

impl Config {
    /// Load configuration from all available sources.
    pub fn load() -> Self {
        let mut config = Self::default();

        if let Some(global_path) = Self::global_config_path() {
            if let Some(global_config) = Self::load_from_file(&global_path) {
                debug!("Loaded global config from {}", global_path.display());
                config.merge(global_config);
                config.source = Some(global_path);
            }
        }

        for name in LOCAL_CONFIG_FILES {
            let path = Path::new(name);
            if let Some(local_config) = Self::load_from_file(path) {
                debug!("Loaded local config from {name}");
                config.merge(local_config);
                config.source = Some(path.to_path_buf());
                break;
            }
        }

        config
    }

    /// Load configuration from a specific file path (--config flag).
    pub fn load_from_path(path: &Path) -> Self {
        if let Some(mut config) = Self::load_from_file(path) {
            debug!("Loaded config from {}", path.display());
            config.source = Some(path.to_path_buf());
            config
        } else {
            warn!(
                "Could not load config from {}, using defaults",
                path.display()
            );
            Self::default()
        }
    }

    fn load_from_file(path: &Path) -> Option<Self> {
        if !path.exists() {
            return None;
        }

        match fs::read_to_string(path) {
            Ok(content) => match toml::from_str(&content) {
                Ok(config) => Some(config),
                Err(e) => {
                    warn!("Failed to parse config file {}: {e}", path.display());
                    None
                },
            },
            Err(e) => {
                warn!("Failed to read config file {}: {e}", path.display());
                None
            },
        }
    }

    /// Get the global configuration directory.
    pub fn global_config_dir() -> Option<PathBuf> {
        ProjectDirs::from("", "", "devlink").map(|dirs| dirs.config_dir().to_path_buf())
    }

    /// Get the global configuration file path.
    pub fn global_config_path() -> Option<PathBuf> {
        Self::global_config_dir().map(|dir| dir.join("config.toml"))
    }

    /// Merge another config into this one; set values in `other` win.
    fn merge(&mut self, other: Self) {
        let conn = other.connection;
        if conn.transport.is_some() {
            self.connection.transport = conn.transport;
        }
        if conn.port.is_some() {
            self.connection.port = conn.port;
        }
        if conn.baud.is_some() {
            self.connection.baud = conn.baud;
        }
        if conn.dfu_vid.is_some() {
            self.connection.dfu_vid = conn.dfu_vid;
        }
        if conn.dfu_pid.is_some() {
            self.connection.dfu_pid = conn.dfu_pid;
        }
        if conn.dfu_interface.is_some() {
            self.connection.dfu_interface = conn.dfu_interface;
        }
        for device in conn.usb_device {
            if !self.connection.usb_device.contains(&device) {
                self.connection.usb_device.push(device);
            }
        }

        let engine = other.engine;
        let ours = &mut self.engine;
        ours.request_timeout_ms = engine.request_timeout_ms.or(ours.request_timeout_ms);
        ours.max_retries = engine.max_retries.or(ours.max_retries);
        ours.heartbeat_ms = engine.heartbeat_ms.or(ours.heartbeat_ms);
        ours.validate_image = engine.validate_image.or(ours.validate_image);
        ours.chunk_size = engine.chunk_size.or(ours.chunk_size);
        ours.backoff_initial_ms = engine.backoff_initial_ms.or(ours.backoff_initial_ms);
        ours.backoff_max_ms = engine.backoff_max_ms.or(ours.backoff_max_ms);
        ours.backoff_multiplier = engine.backoff_multiplier.or(ours.backoff_multiplier);
    }

    /// Engine configuration with this file's overrides applied.
    pub fn engine_config(&self) -> EngineConfig {
        let section = &self.engine;
        let mut config = EngineConfig::default();
        if let Some(ms) = section.request_timeout_ms {
            config = config.with_request_timeout(Duration::from_millis(ms));
        }
        if let Some(retries) = section.max_retries {
            config = config.with_max_retries(retries);
        }
        if let Some(ms) = section.heartbeat_ms {
            config = config.with_heartbeat((ms > 0).then_some(Duration::from_millis(ms)));
        }
        if let Some(validate) = section.validate_image {
            config = config.with_validation(validate);
        }
        if let Some(size) = section.chunk_size {
            config = config.with_chunk_size(size);
        }

        let defaults = BackoffConfig::default();
        config.with_backoff(BackoffConfig {
            initial: section
                .backoff_initial_ms
                .map_or(defaults.initial, Duration::from_millis),
            max: section
                .backoff_max_ms
                .map_or(defaults.max, Duration::from_millis),
            multiplier: section
                .backoff_multiplier
                .unwrap_or(defaults.multiplier),
        })
    }

    /// Whether `vid:pid` was remembered earlier.
    pub fn is_remembered(&self, vid: u16, pid: u16) -> bool {
        self.connection
            .usb_device
            .iter()
            .any(|d| d.matches(vid, pid))
    }

    /// Save USB device for future auto-detection.
    pub fn remember_usb_device(&mut self, vid: u16, pid: u16) -> anyhow::Result<()> {
        if self.is_remembered(vid, pid) {
            return Ok(());
        }
        self.connection
            .usb_device
            .push(UsbDevice { vid, pid });

        let path = if let Some(path) = &self.source {
            path.clone()
        } else if let Some(global_dir) = Self::global_config_dir() {
            fs::create_dir_all(&global_dir)?;
            global_dir.join("config.toml")
        } else {
            PathBuf::from(LOCAL_CONFIG_FILES[0])
        };

        let content = toml::to_string_pretty(self)?;
        fs::write(&path, content)?;
        info!("Saved USB device to {}", path.display());
        self.source = Some(path);

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert!(config.connection.port.is_none());
        assert!(config.connection.baud.is_none());
        assert!(config.connection.usb_device.is_empty());
        assert!(config.connection.dfu().is_none());
        assert!(config.engine.request_timeout_ms.is_none());
    }

    #[test]
    fn test_usb_device_matches() {
        let device = UsbDevice {
            vid: 0x0483,
            pid: 0x5740,
        };
        assert!(device.matches(0x0483, 0x5740));
        assert!(!device.matches(0x0483, 0x5741));
        assert!(!device.matches(0x10C4, 0x5740));
    }

    #[test]
    fn test_parse_sections() {
        let config: Config = toml::from_str(
            r#"
            [connection]
            transport = "serial"
            port = "/dev/ttyACM0"
            baud = 230400

            [[connection.usb_device]]
            vid = 1155
            pid = 22336

            [engine]
            request_timeout_ms = 250
            heartbeat_ms = 0
            validate_image = true
            "#,
        )
        .unwrap();
        assert_eq!(config.connection.port.as_deref(), Some("/dev/ttyACM0"));
        assert_eq!(config.connection.baud, Some(230400));
        assert!(config.is_remembered(0x0483, 0x5740));

        let engine = config.engine_config();
        assert_eq!(engine.request_timeout, Duration::from_millis(250));
        assert_eq!(engine.heartbeat, None);
        assert!(engine.validate_image);
    }

    #[test]
    fn test_merge_local_wins() {
        let mut base: Config = toml::from_str(
            r#"
            [connection]
            port = "/dev/ttyUSB0"
            baud = 115200
            [engine]
            max_retries = 5
            "#,
        )
        .unwrap();
        let local: Config = toml::from_str(
            r#"
            [connection]
            port = "/dev/ttyACM1"
            "#,
        )
        .unwrap();
        base.merge(local);
        assert_eq!(base.connection.port.as_deref(), Some("/dev/ttyACM1"));
        assert_eq!(base.connection.baud, Some(115200));
        assert_eq!(base.engine.max_retries, Some(5));
    }

    #[test]
    fn test_merge_deduplicates_devices() {
        let mut base = Config::default();
        base.connection
            .usb_device
            .push(UsbDevice { vid: 1, pid: 2 });
        let mut other = Config::default();
        other
            .connection
            .usb_device
            .push(UsbDevice { vid: 1, pid: 2 });
        base.merge(other);
        assert_eq!(base.connection.usb_device.len(), 1);
    }

    #[test]
    fn test_dfu_selector() {
        let config: Config = toml::from_str(
            r#"
            [connection]
            transport = "dfu"
            dfu_vid = 1155
            dfu_pid = 57105
            dfu_interface = 2
            "#,
        )
        .unwrap();
        let dfu = config.connection.dfu().unwrap();
        assert_eq!((dfu.vid, dfu.pid, dfu.interface), (0x0483, 0xDF11, 2));
    }

    #[test]
    fn test_engine_defaults_kept() {
        let engine = Config::default().engine_config();
        let defaults = EngineConfig::default();
        assert_eq!(engine.request_timeout, defaults.request_timeout);
        assert_eq!(engine.backoff.initial, defaults.backoff.initial);
    }

    #[test]
    fn test_load_from_path_and_remember() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("devlink.toml");
        fs::write(&path, "[connection]\nbaud = 9600\n").unwrap();

        let mut config = Config::load_from_path(&path);
        assert_eq!(config.connection.baud, Some(9600));

        config
            .remember_usb_device(0x2E8A, 0x000A)
            .unwrap();
        let reloaded = Config::load_from_path(&path);
        assert!(reloaded.is_remembered(0x2E8A, 0x000A));
        assert_eq!(reloaded.connection.baud, Some(9600));
    }

    #[test]
    fn test_load_from_invalid_path_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("broken.toml");
        fs::write(&path, "invalid toml [[[").unwrap();
        let config = Config::load_from_path(&path);
        assert!(config.connection.port.is_none());
    }
}
