//! Typed parameter model.
//!
//! The device reports its parameter table as text at connect (see
//! [`schema`]); values then travel as tagged binary values (see
//! [`ParameterValue`]). The table is owned by the engine and only changed
//! through the operations in [`sync`].

pub mod schema;
pub mod sync;
mod value;

use std::collections::BTreeMap;
use std::fmt;

use thiserror::Error;

use crate::error::{Error, Result};

pub use sync::{BatchItem, BatchKind, BatchReport, FailureReason};
pub use value::{
    ParameterValue, TAG_BOOLEAN, TAG_ENUMERATED, TAG_FLOAT, TAG_INTEGER, TAG_STRING,
};

/// Longest string value the wire format can carry.
pub const MAX_STRING_LEN: usize = 255;

/// Parameter value type.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum ParameterType {
    /// Signed 32-bit integer.
    Integer,
    /// 32-bit float.
    Float,
    /// UTF-8 string of at most [`MAX_STRING_LEN`] bytes.
    String,
    /// Boolean.
    Boolean,
    /// One of a fixed list of named variants, sent as its index.
    Enumerated(Vec<String>),
}

impl ParameterType {
    /// Wire tag of values of this type.
    pub fn tag(&self) -> u8 {
        match self {
            Self::Integer => TAG_INTEGER,
            Self::Float => TAG_FLOAT,
            Self::String => TAG_STRING,
            Self::Boolean => TAG_BOOLEAN,
            Self::Enumerated(_) => TAG_ENUMERATED,
        }
    }

    /// Short type name.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Integer => "integer",
            Self::Float => "float",
            Self::String => "string",
            Self::Boolean => "boolean",
            Self::Enumerated(_) => "enumerated",
        }
    }

    /// Check that `value` is a well-formed value of this type.
    pub fn validate(&self, value: &ParameterValue) -> std::result::Result<(), AccessViolation> {
        match (self, value) {
            (Self::Integer, ParameterValue::Integer(_))
            | (Self::Boolean, ParameterValue::Boolean(_)) => Ok(()),
            (Self::Float, ParameterValue::Float(f)) if f.is_finite() => Ok(()),
            (Self::Float, ParameterValue::Float(f)) => {
                Err(AccessViolation::InvalidValue(format!("{f} is not finite")))
            },
            (Self::String, ParameterValue::String(s)) if s.len() <= MAX_STRING_LEN => Ok(()),
            (Self::String, ParameterValue::String(s)) => Err(AccessViolation::InvalidValue(format!(
                "string of {} bytes exceeds {MAX_STRING_LEN}",
                s.len()
            ))),
            (Self::Enumerated(variants), ParameterValue::Enumerated(index))
                if usize::from(*index) < variants.len() =>
            {
                Ok(())
            },
            (Self::Enumerated(variants), ParameterValue::Enumerated(index)) => {
                Err(AccessViolation::InvalidValue(format!(
                    "variant index {index} out of {} variants",
                    variants.len()
                )))
            },
            (expected, found) => Err(AccessViolation::TypeMismatch {
                expected: expected.name(),
                found: found.type_name(),
            }),
        }
    }
}

impl fmt::Display for ParameterType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Enumerated(variants) => write!(f, "enum({})", variants.join("|")),
            other => f.write_str(other.name()),
        }
    }
}

/// Who may read or write a parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum Access {
    /// Read only.
    ReadOnly,
    /// Read and write.
    #[default]
    ReadWrite,
    /// Write only.
    WriteOnly,
}

impl Access {
    /// Whether the value can be read back.
    pub fn is_readable(self) -> bool {
        !matches!(self, Self::WriteOnly)
    }

    /// Whether the value can be written.
    pub fn is_writable(self) -> bool {
        !matches!(self, Self::ReadOnly)
    }
}

/// Whether a parameter survives a device reset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum Persistence {
    /// Lost on reset.
    Volatile,
    /// Kept in non-volatile memory.
    #[default]
    Stored,
}

/// Agreement between the host copy and the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum SyncStatus {
    /// Never read or written this session.
    #[default]
    Unknown,
    /// Last operation confirmed the value.
    Synced,
    /// Value may differ from the device (staged, or reconnect happened).
    Stale,
    /// Last operation on this parameter failed.
    Error,
}

impl fmt::Display for SyncStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unknown => f.write_str("unknown"),
            Self::Synced => f.write_str("synced"),
            Self::Stale => f.write_str("stale"),
            Self::Error => f.write_str("error"),
        }
    }
}

/// Why a parameter operation was refused before or by the device.
#[derive(Debug, Clone, PartialEq, Error)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum AccessViolation {
    /// No parameter with this id in the table.
    #[error("unknown parameter")]
    UnknownParameter,
    /// Parameter cannot be written.
    #[error("parameter is read-only")]
    ReadOnly,
    /// Parameter cannot be read.
    #[error("parameter is write-only")]
    WriteOnly,
    /// Value has the wrong type.
    #[error("expected {expected} value, got {found}")]
    TypeMismatch {
        /// Parameter type.
        expected: &'static str,
        /// Type of the offered value.
        found: &'static str,
    },
    /// Value outside the parameter's range.
    #[error("value {value} outside range {range}")]
    OutOfRange {
        /// Offered value.
        value: String,
        /// Allowed range.
        range: Range,
    },
    /// Persistent write requested on a volatile parameter.
    #[error("parameter is volatile and cannot be stored")]
    PersistenceNotSupported,
    /// Value malformed for its type.
    #[error("invalid value: {0}")]
    InvalidValue(String),
    /// Nothing known about the value to store.
    #[error("no value to store")]
    NothingToStore,
}

/// Inclusive numeric bounds.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Range {
    /// Lower bound.
    pub min: Option<f64>,
    /// Upper bound.
    pub max: Option<f64>,
}

impl Range {
    /// Range with both bounds.
    pub fn new(min: f64, max: f64) -> Self {
        Self {
            min: Some(min),
            max: Some(max),
        }
    }

    /// Whether no bound is set.
    pub fn is_unbounded(&self) -> bool {
        self.min.is_none() && self.max.is_none()
    }

    /// Whether `value` satisfies the bounds. Non-numeric values always do.
    pub fn contains(&self, value: &ParameterValue) -> bool {
        let Some(v) = value.as_f64() else {
            return true;
        };
        self.min.is_none_or(|min| v >= min) && self.max.is_none_or(|max| v <= max)
    }
}

impl fmt::Display for Range {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let bound = |b: Option<f64>| b.map_or_else(|| "..".to_string(), |v| v.to_string());
        write!(f, "[{}, {}]", bound(self.min), bound(self.max))
    }
}

/// One device parameter and its host-side state.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Parameter {
    /// Unique id.
    pub id: u16,
    /// Name.
    pub name: String,
    /// Group heading from the listing, if any.
    pub group: Option<String>,
    /// Value type.
    pub kind: ParameterType,
    /// Access rights.
    pub access: Access,
    /// Persistence class.
    pub persistence: Persistence,
    /// Numeric bounds.
    pub range: Range,
    /// Default value, if the listing reports one.
    pub default: Option<ParameterValue>,
    /// Unit label.
    pub unit: String,
    /// Free-form description.
    pub comment: String,
    value: Option<ParameterValue>,
    confirmed: Option<ParameterValue>,
    status: SyncStatus,
}

impl Parameter {
    /// Read-write stored parameter with no value yet.
    pub fn new(id: u16, name: impl Into<String>, kind: ParameterType) -> Self {
        Self {
            id,
            name: name.into(),
            group: None,
            kind,
            access: Access::default(),
            persistence: Persistence::default(),
            range: Range::default(),
            default: None,
            unit: String::new(),
            comment: String::new(),
            value: None,
            confirmed: None,
            status: SyncStatus::Unknown,
        }
    }

    /// Set access rights.
    #[must_use]
    pub fn with_access(mut self, access: Access) -> Self {
        self.access = access;
        self
    }

    /// Set persistence class.
    #[must_use]
    pub fn with_persistence(mut self, persistence: Persistence) -> Self {
        self.persistence = persistence;
        self
    }

    /// Set numeric bounds.
    #[must_use]
    pub fn with_range(mut self, range: Range) -> Self {
        self.range = range;
        self
    }

    /// Set the group heading.
    #[must_use]
    pub fn with_group(mut self, group: impl Into<String>) -> Self {
        self.group = Some(group.into());
        self
    }

    /// Set the value reported by the device listing; it counts as confirmed.
    #[must_use]
    pub fn with_value(mut self, value: ParameterValue) -> Self {
        self.record_confirmed(value);
        self
    }

    /// Current host-side value.
    pub fn value(&self) -> Option<&ParameterValue> {
        self.value.as_ref()
    }

    /// Value last confirmed by the device.
    pub fn confirmed(&self) -> Option<&ParameterValue> {
        self.confirmed.as_ref()
    }

    /// Sync status.
    pub fn status(&self) -> SyncStatus {
        self.status
    }

    /// Check type and range of a candidate value.
    pub fn check_value(&self, value: &ParameterValue) -> std::result::Result<(), AccessViolation> {
        self.kind.validate(value)?;
        if !self.range.contains(value) {
            return Err(AccessViolation::OutOfRange {
                value: value.to_string(),
                range: self.range,
            });
        }
        Ok(())
    }

    /// Render a value of this parameter as text (enum variants by name).
    pub fn format_value(&self, value: &ParameterValue) -> String {
        value.to_text(&self.kind)
    }

    pub(crate) fn record_confirmed(&mut self, value: ParameterValue) {
        self.value = Some(value.clone());
        self.confirmed = Some(value);
        self.status = SyncStatus::Synced;
    }

    pub(crate) fn record_failure(&mut self) {
        self.status = SyncStatus::Error;
    }

    pub(crate) fn stage(&mut self, value: ParameterValue) {
        self.value = Some(value);
        self.status = SyncStatus::Stale;
    }

    pub(crate) fn mark_stale(&mut self) {
        if self.status == SyncStatus::Synced {
            self.status = SyncStatus::Stale;
        }
    }
}

/// Parameters of one connection, ordered by id.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ParameterTable {
    params: BTreeMap<u16, Parameter>,
}

impl ParameterTable {
    /// Empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a table, rejecting duplicate ids.
    pub fn from_parameters(params: impl IntoIterator<Item = Parameter>) -> Result<Self> {
        let mut table = Self::new();
        for param in params {
            table.insert(param)?;
        }
        Ok(table)
    }

    /// Parameter with `id`.
    pub fn get(&self, id: u16) -> Option<&Parameter> {
        self.params.get(&id)
    }

    /// Parameter named `name`.
    pub fn find(&self, name: &str) -> Option<&Parameter> {
        self.params
            .values()
            .find(|p| p.name == name)
    }

    /// All parameters in id order.
    pub fn iter(&self) -> impl Iterator<Item = &Parameter> {
        self.params.values()
    }

    /// Number of parameters.
    pub fn len(&self) -> usize {
        self.params.len()
    }

    /// Whether the table is empty.
    pub fn is_empty(&self) -> bool {
        self.params.is_empty()
    }

    pub(crate) fn insert(&mut self, param: Parameter) -> Result<()> {
        if self.params.contains_key(&param.id) {
            return Err(Error::Protocol(format!(
                "duplicate parameter id {} ({})",
                param.id, param.name
            )));
        }
        self.params.insert(param.id, param);
        Ok(())
    }

    pub(crate) fn get_mut(&mut self, id: u16) -> Option<&mut Parameter> {
        self.params.get_mut(&id)
    }

    pub(crate) fn mark_stale(&mut self) {
        for param in self.params.values_mut() {
            param.mark_stale();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_dispatches_by_type() {
        assert!(ParameterType::Integer.validate(&ParameterValue::Integer(5)).is_ok());
        assert!(ParameterType::Boolean.validate(&ParameterValue::Boolean(true)).is_ok());
        assert_eq!(
            ParameterType::Integer.validate(&ParameterValue::Float(1.0)),
            Err(AccessViolation::TypeMismatch {
                expected: "integer",
                found: "float"
            })
        );
        assert!(ParameterType::Float.validate(&ParameterValue::Float(f32::NAN)).is_err());

        let modes = ParameterType::Enumerated(vec!["off".into(), "on".into()]);
        assert!(modes.validate(&ParameterValue::Enumerated(1)).is_ok());
        assert!(modes.validate(&ParameterValue::Enumerated(2)).is_err());

        let long = "x".repeat(MAX_STRING_LEN + 1);
        assert!(ParameterType::String.validate(&ParameterValue::String(long)).is_err());
    }

    #[test]
    fn test_range_check() {
        let param = Parameter::new(1, "gain", ParameterType::Float).with_range(Range::new(0.0, 2.5));
        assert!(param.check_value(&ParameterValue::Float(2.5)).is_ok());
        assert!(matches!(
            param.check_value(&ParameterValue::Float(3.0)),
            Err(AccessViolation::OutOfRange { .. })
        ));

        let open = Range {
            min: Some(0.0),
            max: None,
        };
        assert!(open.contains(&ParameterValue::Integer(i32::MAX)));
        assert!(!open.contains(&ParameterValue::Integer(-1)));
        assert!(open.contains(&ParameterValue::String("x".into())));
        assert_eq!(open.to_string(), "[0, ..]");
    }

    #[test]
    fn test_status_transitions() {
        let mut param = Parameter::new(1, "x", ParameterType::Integer);
        assert_eq!(param.status(), SyncStatus::Unknown);

        param.record_confirmed(ParameterValue::Integer(3));
        assert_eq!(param.status(), SyncStatus::Synced);
        assert_eq!(param.confirmed(), Some(&ParameterValue::Integer(3)));

        param.stage(ParameterValue::Integer(4));
        assert_eq!(param.status(), SyncStatus::Stale);
        assert_eq!(param.value(), Some(&ParameterValue::Integer(4)));
        assert_eq!(param.confirmed(), Some(&ParameterValue::Integer(3)));

        param.record_failure();
        assert_eq!(param.status(), SyncStatus::Error);
        param.mark_stale();
        assert_eq!(param.status(), SyncStatus::Error);
    }

    #[test]
    fn test_table_rejects_duplicate_ids() {
        let err = ParameterTable::from_parameters([
            Parameter::new(1, "a", ParameterType::Integer),
            Parameter::new(1, "b", ParameterType::Integer),
        ])
        .unwrap_err();
        assert!(matches!(err, Error::Protocol(_)));
    }

    #[test]
    fn test_table_orders_by_id() {
        let table = ParameterTable::from_parameters([
            Parameter::new(9, "c", ParameterType::Integer),
            Parameter::new(2, "a", ParameterType::Integer),
            Parameter::new(5, "b", ParameterType::Integer),
        ])
        .unwrap();
        let ids: Vec<u16> = table.iter().map(|p| p.id).collect();
        assert_eq!(ids, vec![2, 5, 9]);
        assert_eq!(table.find("b").map(|p| p.id), Some(5));
    }

    #[test]
    fn test_access_flags() {
        assert!(Access::ReadOnly.is_readable());
        assert!(!Access::ReadOnly.is_writable());
        assert!(!Access::WriteOnly.is_readable());
        assert!(Access::ReadWrite.is_writable());
    }
}
