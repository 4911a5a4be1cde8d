//! Firmware image file format.
//!
//! ## Layout
//!
//! ```text
//! +-------------------------------+
//! |  Application header (52B)     |
//! |  magic "DLFW"          4      |
//! |  header version        1      |
//! |  version maj/min/patch 3      |
//! |  flags                 1      |
//! |  reserved              3      |
//! |  payload size (LE)     4      |
//! |  CRC-32 IEEE (LE)      4      |
//! |  SHA-256 digest        32     |
//! +-------------------------------+
//! |  Payload                      |
//! |  ...                          |
//! +-------------------------------+
//! ```
//!
//! Flag bit 0 marks the CRC as present, bit 1 the digest. The header is sent
//! verbatim in the prepare handshake.

use std::fs::File;
use std::io::{BufReader, Cursor, Read};
use std::path::Path;
use std::sync::OnceLock;

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use log::debug;
use semver::Version;
use sha2::{Digest, Sha256};

use crate::error::{Error, Result};

/// Header magic.
pub const IMAGE_MAGIC: [u8; 4] = *b"DLFW";

/// Header size in bytes.
pub const IMAGE_HEADER_SIZE: usize = 52;

/// Header layout version written by [`ImageBuilder`].
pub const IMAGE_HEADER_VERSION: u8 = 1;

/// Flag: CRC-32 field is valid.
pub const FLAG_CRC: u8 = 0x01;

/// Flag: SHA-256 digest field is valid.
pub const FLAG_DIGEST: u8 = 0x02;

/// Parsed application header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageHeader {
    /// Header layout version.
    pub header_version: u8,
    /// Firmware version.
    pub version: Version,
    /// Flag bits.
    pub flags: u8,
    /// Payload size in bytes.
    pub size: u32,
    /// CRC-32 of the payload.
    pub crc32: u32,
    /// SHA-256 digest of the payload.
    pub digest: [u8; 32],
}

impl ImageHeader {
    /// Read a header from `reader`.
    pub fn read_from<R: Read>(reader: &mut R) -> Result<Self> {
        let mut magic = [0u8; 4];
        reader.read_exact(&mut magic)?;
        if magic != IMAGE_MAGIC {
            return Err(Error::InvalidImage(format!(
                "bad magic {magic:02X?}, expected {IMAGE_MAGIC:02X?}"
            )));
        }

        let header_version = reader.read_u8()?;
        let major = reader.read_u8()?;
        let minor = reader.read_u8()?;
        let patch = reader.read_u8()?;
        let flags = reader.read_u8()?;
        let mut reserved = [0u8; 3];
        reader.read_exact(&mut reserved)?;
        let size = reader.read_u32::<LittleEndian>()?;
        let crc32 = reader.read_u32::<LittleEndian>()?;
        let mut digest = [0u8; 32];
        reader.read_exact(&mut digest)?;

        Ok(Self {
            header_version,
            version: Version::new(u64::from(major), u64::from(minor), u64::from(patch)),
            flags,
            size,
            crc32,
            digest,
        })
    }

    /// Whether the image carries a CRC.
    pub fn has_crc(&self) -> bool {
        self.flags & FLAG_CRC != 0
    }

    /// Whether the image carries a digest.
    pub fn has_digest(&self) -> bool {
        self.flags & FLAG_DIGEST != 0
    }
}

/// A firmware image loaded into memory.
pub struct FirmwareImage {
    header: ImageHeader,
    data: Vec<u8>,
    validation: OnceLock<std::result::Result<(), String>>,
}

impl FirmwareImage {
    /// Load an image from a file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        debug!("Loading firmware image from: {}", path.display());

        let mut reader = BufReader::new(File::open(path)?);
        let mut data = Vec::new();
        reader.read_to_end(&mut data)?;
        Self::from_bytes(data)
    }

    /// Parse an image from raw bytes.
    pub fn from_bytes(data: Vec<u8>) -> Result<Self> {
        if data.len() < IMAGE_HEADER_SIZE {
            return Err(Error::InvalidImage(format!(
                "file too small for header ({} < {IMAGE_HEADER_SIZE} bytes)",
                data.len()
            )));
        }

        let header = ImageHeader::read_from(&mut Cursor::new(&data))?;
        let payload_len = data.len() - IMAGE_HEADER_SIZE;
        if header.size as usize != payload_len {
            return Err(Error::InvalidImage(format!(
                "header declares {} payload bytes, file has {payload_len}",
                header.size
            )));
        }

        debug!(
            "Image v{}: {} bytes, flags {:#04x}",
            header.version, header.size, header.flags
        );
        Ok(Self {
            header,
            data,
            validation: OnceLock::new(),
        })
    }

    /// Parsed header.
    pub fn header(&self) -> &ImageHeader {
        &self.header
    }

    /// Raw header bytes, as sent in the prepare handshake.
    pub fn header_bytes(&self) -> &[u8] {
        &self.data[..IMAGE_HEADER_SIZE]
    }

    /// Payload bytes.
    pub fn payload(&self) -> &[u8] {
        &self.data[IMAGE_HEADER_SIZE..]
    }

    /// Payload size.
    pub fn size(&self) -> u32 {
        self.header.size
    }

    /// Check the CRC and digest the header carries.
    ///
    /// Computed on first call and cached. An image with neither check fails.
    pub fn validate(&self) -> Result<()> {
        self.validation
            .get_or_init(|| self.compute_validation())
            .clone()
            .map_err(Error::UpgradeValidation)
    }

    /// Cached validation outcome, if [`FirmwareImage::validate`] ran.
    pub fn validation_outcome(&self) -> Option<bool> {
        self.validation
            .get()
            .map(std::result::Result::is_ok)
    }

    fn compute_validation(&self) -> std::result::Result<(), String> {
        if !self.header.has_crc() && !self.header.has_digest() {
            return Err("image carries neither CRC nor digest".to_string());
        }

        if self.header.has_crc() {
            let actual = crc32fast::hash(self.payload());
            if actual != self.header.crc32 {
                return Err(format!(
                    "CRC mismatch: header {:#010x}, payload {actual:#010x}",
                    self.header.crc32
                ));
            }
        }

        if self.header.has_digest() {
            let actual = Sha256::digest(self.payload());
            if actual.as_slice() != self.header.digest {
                return Err("SHA-256 digest mismatch".to_string());
            }
        }

        debug!("Image v{} validated", self.header.version);
        Ok(())
    }
}

impl std::fmt::Debug for FirmwareImage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FirmwareImage")
            .field("header", &self.header)
            .field("data_len", &self.data.len())
            .field("validated", &self.validation_outcome())
            .finish()
    }
}

/// Assembles image files.
#[derive(Debug, Clone)]
pub struct ImageBuilder {
    version: (u8, u8, u8),
    payload: Vec<u8>,
    crc: bool,
    digest: bool,
}

impl ImageBuilder {
    /// Image around `payload`, version 0.0.0, with CRC and digest.
    pub fn new(payload: impl Into<Vec<u8>>) -> Self {
        Self {
            version: (0, 0, 0),
            payload: payload.into(),
            crc: true,
            digest: true,
        }
    }

    /// Set the firmware version.
    #[must_use]
    pub fn version(mut self, major: u8, minor: u8, patch: u8) -> Self {
        self.version = (major, minor, patch);
        self
    }

    /// Include or omit the CRC.
    #[must_use]
    pub fn with_crc(mut self, crc: bool) -> Self {
        self.crc = crc;
        self
    }

    /// Include or omit the digest.
    #[must_use]
    pub fn with_digest(mut self, digest: bool) -> Self {
        self.digest = digest;
        self
    }

    /// Serialize header and payload.
    #[allow(clippy::unwrap_used)] // Writing to Vec<u8> cannot fail
    pub fn build(&self) -> Vec<u8> {
        let mut flags = 0;
        let mut crc = 0;
        let mut digest = [0u8; 32];
        if self.crc {
            flags |= FLAG_CRC;
            crc = crc32fast::hash(&self.payload);
        }
        if self.digest {
            flags |= FLAG_DIGEST;
            digest.copy_from_slice(&Sha256::digest(&self.payload));
        }

        let mut out = Vec::with_capacity(IMAGE_HEADER_SIZE + self.payload.len());
        out.extend_from_slice(&IMAGE_MAGIC);
        out.push(IMAGE_HEADER_VERSION);
        out.extend_from_slice(&[self.version.0, self.version.1, self.version.2]);
        out.push(flags);
        out.extend_from_slice(&[0u8; 3]);
        out.write_u32::<LittleEndian>(self.payload.len() as u32)
            .unwrap();
        out.write_u32::<LittleEndian>(crc).unwrap();
        out.extend_from_slice(&digest);
        out.extend_from_slice(&self.payload);
        out
    }

    /// Build and parse.
    pub fn into_image(self) -> Result<FirmwareImage> {
        FirmwareImage::from_bytes(self.build())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_size_matches_layout() {
        let bytes = ImageBuilder::new(Vec::new()).build();
        assert_eq!(bytes.len(), IMAGE_HEADER_SIZE);
    }

    #[test]
    fn test_parse_built_image() {
        let image = ImageBuilder::new(vec![1, 2, 3, 4])
            .version(2, 1, 0)
            .into_image()
            .unwrap();
        assert_eq!(image.header().version, Version::new(2, 1, 0));
        assert_eq!(image.size(), 4);
        assert_eq!(image.payload(), &[1, 2, 3, 4]);
        assert_eq!(&image.header_bytes()[..4], b"DLFW");
        assert!(image.header().has_crc());
        assert!(image.header().has_digest());
    }

    #[test]
    fn test_rejects_bad_magic_and_size() {
        let mut bytes = ImageBuilder::new(vec![0u8; 8]).build();
        bytes[0] = b'X';
        assert!(matches!(
            FirmwareImage::from_bytes(bytes),
            Err(Error::InvalidImage(_))
        ));

        let mut bytes = ImageBuilder::new(vec![0u8; 8]).build();
        bytes.push(0);
        assert!(matches!(
            FirmwareImage::from_bytes(bytes),
            Err(Error::InvalidImage(_))
        ));

        assert!(FirmwareImage::from_bytes(vec![0u8; 10]).is_err());
    }

    #[test]
    fn test_validation_detects_corruption_and_is_cached() {
        let mut bytes = ImageBuilder::new(vec![7u8; 64]).build();
        let last = bytes.len() - 1;
        bytes[last] ^= 0xFF;
        let image = FirmwareImage::from_bytes(bytes).unwrap();

        assert_eq!(image.validation_outcome(), None);
        assert!(matches!(image.validate(), Err(Error::UpgradeValidation(_))));
        assert_eq!(image.validation_outcome(), Some(false));
        assert!(image.validate().is_err());
    }

    #[test]
    fn test_digest_only_and_unprotected_images() {
        let image = ImageBuilder::new(vec![1u8; 16])
            .with_crc(false)
            .into_image()
            .unwrap();
        assert!(image.validate().is_ok());

        let image = ImageBuilder::new(vec![1u8; 16])
            .with_crc(false)
            .with_digest(false)
            .into_image()
            .unwrap();
        assert!(image.validate().is_err());
    }
}
