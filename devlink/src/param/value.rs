//! Tagged parameter values.
//!
//! On the wire a value is one tag byte followed by its encoding:
//!
//! | Tag  | Type       | Encoding                      |
//! |------|------------|-------------------------------|
//! | 0x2B | integer    | i32 little endian             |
//! | 0x39 | float      | f32 little endian             |
//! | 0x42 | string     | u8 length + UTF-8 bytes       |
//! | 0x10 | boolean    | u8, 0 or 1                    |
//! | 0x30 | enumerated | u8 variant index              |

use std::fmt;
use std::io::{Cursor, Read};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};

use crate::error::{Error, Result};
use crate::param::{AccessViolation, MAX_STRING_LEN, ParameterType};

/// Tag of integer values.
pub const TAG_INTEGER: u8 = 0x2B;
/// Tag of float values.
pub const TAG_FLOAT: u8 = 0x39;
/// Tag of string values.
pub const TAG_STRING: u8 = 0x42;
/// Tag of boolean values.
pub const TAG_BOOLEAN: u8 = 0x10;
/// Tag of enumerated values.
pub const TAG_ENUMERATED: u8 = 0x30;

/// A typed parameter value.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(untagged))]
pub enum ParameterValue {
    /// Signed integer.
    Integer(i32),
    /// Float.
    Float(f32),
    /// String.
    String(String),
    /// Boolean.
    Boolean(bool),
    /// Enum variant index.
    Enumerated(u8),
}

impl ParameterValue {
    /// Wire tag.
    pub fn tag(&self) -> u8 {
        match self {
            Self::Integer(_) => TAG_INTEGER,
            Self::Float(_) => TAG_FLOAT,
            Self::String(_) => TAG_STRING,
            Self::Boolean(_) => TAG_BOOLEAN,
            Self::Enumerated(_) => TAG_ENUMERATED,
        }
    }

    /// Name of the value's type.
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Integer(_) => "integer",
            Self::Float(_) => "float",
            Self::String(_) => "string",
            Self::Boolean(_) => "boolean",
            Self::Enumerated(_) => "enumerated",
        }
    }

    /// Numeric view used for range checks.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Integer(v) => Some(f64::from(*v)),
            Self::Float(v) => Some(f64::from(*v)),
            _ => None,
        }
    }

    /// Append `[tag][value]` to `out`.
    ///
    /// Strings longer than the wire limit are truncated; validate first.
    #[allow(clippy::unwrap_used)] // Writing to Vec<u8> cannot fail
    pub fn encode_into(&self, out: &mut Vec<u8>) {
        out.push(self.tag());
        match self {
            Self::Integer(v) => out.write_i32::<LittleEndian>(*v).unwrap(),
            Self::Float(v) => out.write_f32::<LittleEndian>(*v).unwrap(),
            Self::String(s) => {
                let bytes = &s.as_bytes()[..s.len().min(MAX_STRING_LEN)];
                out.push(bytes.len() as u8);
                out.extend_from_slice(bytes);
            },
            Self::Boolean(b) => out.push(u8::from(*b)),
            Self::Enumerated(i) => out.push(*i),
        }
    }

    /// Decode `[tag][value]` from the start of `bytes` as a value of `kind`.
    ///
    /// Returns the value and the number of bytes consumed.
    pub fn decode(kind: &ParameterType, bytes: &[u8]) -> Result<(Self, usize)> {
        let mut cur = Cursor::new(bytes);
        let tag = cur.read_u8().map_err(|_| truncated("tag"))?;
        if tag != kind.tag() {
            return Err(Error::Protocol(format!(
                "value tag {tag:#04x} does not match {} parameter (expected {:#04x})",
                kind.name(),
                kind.tag()
            )));
        }

        let value = match tag {
            TAG_INTEGER => Self::Integer(
                cur.read_i32::<LittleEndian>()
                    .map_err(|_| truncated("integer"))?,
            ),
            TAG_FLOAT => Self::Float(
                cur.read_f32::<LittleEndian>()
                    .map_err(|_| truncated("float"))?,
            ),
            TAG_STRING => {
                let len = cur.read_u8().map_err(|_| truncated("string length"))?;
                let mut buf = vec![0u8; usize::from(len)];
                cur.read_exact(&mut buf)
                    .map_err(|_| truncated("string"))?;
                Self::String(
                    String::from_utf8(buf)
                        .map_err(|e| Error::Protocol(format!("string value is not UTF-8: {e}")))?,
                )
            },
            TAG_BOOLEAN => match cur.read_u8().map_err(|_| truncated("boolean"))? {
                0 => Self::Boolean(false),
                1 => Self::Boolean(true),
                other => {
                    return Err(Error::Protocol(format!("invalid boolean byte {other:#04x}")));
                },
            },
            TAG_ENUMERATED => Self::Enumerated(cur.read_u8().map_err(|_| truncated("enum"))?),
            other => return Err(Error::Protocol(format!("unknown value tag {other:#04x}"))),
        };

        Ok((value, cur.position() as usize))
    }

    /// Parse user or listing text as a value of `kind`.
    ///
    /// Enum values may be given by variant name or index.
    pub fn parse_text(
        kind: &ParameterType,
        text: &str,
    ) -> std::result::Result<Self, AccessViolation> {
        let text = text.trim();
        let invalid = || AccessViolation::InvalidValue(format!("'{text}' is not a valid {}", kind.name()));
        match kind {
            ParameterType::Integer => text
                .parse::<i32>()
                .map(Self::Integer)
                .map_err(|_| invalid()),
            ParameterType::Float => text
                .parse::<f32>()
                .map(Self::Float)
                .map_err(|_| invalid()),
            ParameterType::String => Ok(Self::String(text.to_string())),
            ParameterType::Boolean => match text.to_ascii_lowercase().as_str() {
                "1" | "true" | "on" | "yes" => Ok(Self::Boolean(true)),
                "0" | "false" | "off" | "no" => Ok(Self::Boolean(false)),
                _ => Err(invalid()),
            },
            ParameterType::Enumerated(variants) => {
                if let Some(index) = variants
                    .iter()
                    .position(|v| v.eq_ignore_ascii_case(text))
                {
                    return u8::try_from(index)
                        .map(Self::Enumerated)
                        .map_err(|_| invalid());
                }
                let index = text.parse::<u8>().map_err(|_| invalid())?;
                if usize::from(index) < variants.len() {
                    Ok(Self::Enumerated(index))
                } else {
                    Err(invalid())
                }
            },
        }
    }

    /// Text form for `kind`; enum values print their variant name.
    pub fn to_text(&self, kind: &ParameterType) -> String {
        match (self, kind) {
            (Self::Enumerated(i), ParameterType::Enumerated(variants)) => variants
                .get(usize::from(*i))
                .cloned()
                .unwrap_or_else(|| i.to_string()),
            _ => self.to_string(),
        }
    }
}

impl fmt::Display for ParameterValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Integer(v) => write!(f, "{v}"),
            Self::Float(v) => write!(f, "{v}"),
            Self::String(s) => f.write_str(s),
            Self::Boolean(b) => write!(f, "{}", u8::from(*b)),
            Self::Enumerated(i) => write!(f, "{i}"),
        }
    }
}

fn truncated(what: &str) -> Error {
    Error::Protocol(format!("truncated {what} value"))
}
