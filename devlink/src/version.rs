//! Device CLI version negotiation.
//!
//! The device answers the `version` command with a banner such as
//! `CLI v2.0.1`. The version is read once per connection and decides which
//! protocol variants the session uses:
//!
//! | Feature                     | < 1.3.0 | 1.3.x – 1.x | ≥ 2.0.0 |
//! |-----------------------------|---------|-------------|---------|
//! | Parameter mode              | no      | yes         | yes     |
//! | Parameter listing format    | legacy  | legacy      | current |
//! | Bootloader handshake        | install | install     | prepare |
//! | Image validation            | no      | no          | yes     |

use std::fmt;

use semver::Version;

use crate::error::{Error, Result};
use crate::mode::Mode;
use crate::param::schema::SchemaFormat;
use crate::upgrade::BootloaderVariant;

/// Banner prefix preceding the version number.
pub const VERSION_PREFIX: &str = "CLI v";

/// First version that speaks the binary parameter protocol.
pub const PARAMETER_MODE_MIN: Version = Version::new(1, 3, 0);

/// First version with the prepare handshake and the current listing format.
pub const CURRENT_PROTOCOL_MIN: Version = Version::new(2, 0, 0);

/// Version reported by a connected device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceVersion {
    version: Version,
}

impl DeviceVersion {
    /// Parse a bare version (`1.3`, `1.3.0`, `v2.0.1`).
    pub fn parse(text: &str) -> Result<Self> {
        let text = text.trim();
        let text = text.strip_prefix('v').unwrap_or(text);
        let normalized = match text.matches('.').count() {
            0 => format!("{text}.0.0"),
            1 => format!("{text}.0"),
            _ => text.to_string(),
        };
        let version = Version::parse(&normalized).map_err(|e| Error::VersionMismatch {
            device: text.to_string(),
            required: format!(">={PARAMETER_MODE_MIN}"),
            feature: format!("version negotiation ({e})"),
        })?;
        Ok(Self { version })
    }

    /// Extract the version from a `CLI vX.Y.Z` banner line.
    pub fn from_banner(line: &str) -> Option<Self> {
        let start = line.find(VERSION_PREFIX)? + VERSION_PREFIX.len();
        let token = line[start..]
            .split_whitespace()
            .next()?;
        Self::parse(token).ok()
    }

    /// The semantic version.
    pub fn version(&self) -> &Version {
        &self.version
    }

    /// Whether the device predates the current protocol.
    pub fn is_legacy(&self) -> bool {
        self.version < CURRENT_PROTOCOL_MIN
    }

    /// Bootloader handshake this device speaks.
    pub fn bootloader_variant(&self) -> BootloaderVariant {
        if self.is_legacy() {
            BootloaderVariant::Legacy
        } else {
            BootloaderVariant::Current
        }
    }

    /// Parameter listing format this device prints.
    pub fn schema_format(&self) -> SchemaFormat {
        if self.is_legacy() {
            SchemaFormat::Legacy
        } else {
            SchemaFormat::Current
        }
    }

    /// Fail unless the device can enter `mode`.
    pub fn check_mode(&self, mode: Mode) -> Result<()> {
        match mode {
            Mode::Parameter if self.version < PARAMETER_MODE_MIN => {
                Err(self.mismatch(&PARAMETER_MODE_MIN, "parameter mode"))
            },
            _ => Ok(()),
        }
    }

    /// Fail unless the device can validate images.
    pub fn check_image_validation(&self) -> Result<()> {
        if self.is_legacy() {
            Err(self.mismatch(&CURRENT_PROTOCOL_MIN, "image validation"))
        } else {
            Ok(())
        }
    }

    fn mismatch(&self, required: &Version, feature: &str) -> Error {
        Error::VersionMismatch {
            device: self.version.to_string(),
            required: format!(">={required}"),
            feature: feature.to_string(),
        }
    }
}

impl fmt::Display for DeviceVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{VERSION_PREFIX}{}", self.version)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_banner() {
        let v = DeviceVersion::from_banner("CLI v2.0.1").unwrap();
        assert_eq!(v.version(), &Version::new(2, 0, 1));
        assert_eq!(v.to_string(), "CLI v2.0.1");

        let v = DeviceVersion::from_banner("> CLI v1.3 ready").unwrap();
        assert_eq!(v.version(), &Version::new(1, 3, 0));

        assert!(DeviceVersion::from_banner("booting...").is_none());
        assert!(DeviceVersion::from_banner("CLI vX").is_none());
    }

    #[test]
    fn test_variant_selection() {
        let legacy = DeviceVersion::parse("1.3.0").unwrap();
        assert!(legacy.is_legacy());
        assert_eq!(legacy.bootloader_variant(), BootloaderVariant::Legacy);
        assert_eq!(legacy.schema_format(), SchemaFormat::Legacy);

        let current = DeviceVersion::parse("v2.0.0").unwrap();
        assert!(!current.is_legacy());
        assert_eq!(current.bootloader_variant(), BootloaderVariant::Current);
        assert_eq!(current.schema_format(), SchemaFormat::Current);
    }

    #[test]
    fn test_parameter_mode_gate() {
        let old = DeviceVersion::parse("1.2.9").unwrap();
        assert!(matches!(
            old.check_mode(Mode::Parameter),
            Err(Error::VersionMismatch { .. })
        ));
        assert!(old.check_mode(Mode::Bootloader).is_ok());
        assert!(DeviceVersion::parse("1.3.0")
            .unwrap()
            .check_mode(Mode::Parameter)
            .is_ok());
    }

    #[test]
    fn test_image_validation_gate() {
        assert!(DeviceVersion::parse("1.9.0")
            .unwrap()
            .check_image_validation()
            .is_err());
        assert!(DeviceVersion::parse("2.1.0")
            .unwrap()
            .check_image_validation()
            .is_ok());
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(DeviceVersion::parse("abc").is_err());
    }
}
