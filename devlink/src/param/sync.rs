//! Parameter read/write operations and batch reports.
//!
//! These are the only paths that change a connected engine's parameter
//! table. Every operation checks access, type and range locally before any
//! byte is sent; such refusals leave the parameter untouched. Failures after
//! a request went out (device rejection, timeout, link loss) mark the
//! parameter's status as error and keep its previous value.

use std::fmt;

use byteorder::{LittleEndian, ReadBytesExt};
use log::{debug, info, warn};
use thiserror::Error;

use super::{AccessViolation, Parameter, ParameterType, ParameterValue, Persistence};
use crate::engine::Engine;
use crate::error::{Error, FramingError, Result};
use crate::events::Event;
use crate::mode::Mode;
use crate::protocol::{Frame, Request, Status};
use crate::transport::Transport;

/// Batch operation kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum BatchKind {
    /// Read every readable parameter.
    ReadAll,
    /// Persistently write every writable, stored parameter.
    StoreAll,
}

impl fmt::Display for BatchKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ReadAll => f.write_str("read-all"),
            Self::StoreAll => f.write_str("store-all"),
        }
    }
}

/// Why one batch item failed.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum FailureReason {
    /// Refused locally.
    #[error("{0}")]
    Access(AccessViolation),
    /// Refused by the device.
    #[error("rejected by device: {0}")]
    Rejected(Status),
    /// No answer after all retries.
    #[error("no response after {attempts} attempt(s)")]
    Timeout {
        /// Transmissions made.
        attempts: u32,
    },
    /// The link went down before or during the item.
    #[error("link lost")]
    LinkLost,
    /// The response was malformed.
    #[error("framing error: {0}")]
    Framing(FramingError),
    /// The batch was cancelled before the item completed.
    #[error("cancelled")]
    Cancelled,
    /// Anything else.
    #[error("{0}")]
    Other(String),
}

impl From<&Error> for FailureReason {
    fn from(error: &Error) -> Self {
        match error {
            Error::ParameterAccess { violation, .. } => Self::Access(violation.clone()),
            Error::Rejected { status, .. } | Error::DeviceStatus { status, .. } => {
                Self::Rejected(*status)
            },
            Error::Timeout { attempts, .. } => Self::Timeout {
                attempts: *attempts,
            },
            Error::LinkLost { .. } | Error::NotConnected => Self::LinkLost,
            Error::Framing { source, .. } => Self::Framing(source.clone()),
            Error::Cancelled { .. } => Self::Cancelled,
            other => Self::Other(other.to_string()),
        }
    }
}

/// Outcome of one parameter in a batch.
#[derive(Debug, Clone, PartialEq)]
pub struct BatchItem {
    /// Parameter id.
    pub id: u16,
    /// Value confirmed by the device, or why the item failed.
    pub outcome: std::result::Result<ParameterValue, FailureReason>,
}

/// Aggregate result of a batch, items in submission order.
#[derive(Debug, Clone, PartialEq)]
pub struct BatchReport {
    /// Operation that produced the report.
    pub kind: BatchKind,
    /// Per-parameter outcomes.
    pub items: Vec<BatchItem>,
}

impl BatchReport {
    /// Whether every item succeeded.
    pub fn is_success(&self) -> bool {
        self.items
            .iter()
            .all(|item| item.outcome.is_ok())
    }

    /// Failed items with their reasons.
    pub fn failures(&self) -> impl Iterator<Item = (u16, &FailureReason)> {
        self.items
            .iter()
            .filter_map(|item| item.outcome.as_ref().err().map(|r| (item.id, r)))
    }

    /// Ids of failed items.
    pub fn failed_ids(&self) -> Vec<u16> {
        self.failures()
            .map(|(id, _)| id)
            .collect()
    }

    /// Number of successful items.
    pub fn succeeded(&self) -> usize {
        self.items
            .iter()
            .filter(|item| item.outcome.is_ok())
            .count()
    }

    /// Number of items.
    pub fn len(&self) -> usize {
        self.items.len()
    }

    /// Whether the batch covered no parameters.
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

impl<T: Transport> Engine<T> {
    /// Read one parameter from the device.
    pub fn read_one(&mut self, id: u16) -> Result<ParameterValue> {
        let kind = self.checked(id, |param| {
            if param.access.is_readable() {
                Ok(param.kind.clone())
            } else {
                Err(AccessViolation::WriteOnly)
            }
        })?;
        self.ensure_parameter_mode()?;

        let result = self
            .exchange(Request::read_parameter(id))
            .and_then(|frame| decode_response(id, &kind, &frame));
        self.record(id, result)
    }

    /// Write one parameter without storing it.
    pub fn write_one(&mut self, id: u16, value: ParameterValue) -> Result<()> {
        self.write(id, value, false)
    }

    /// Write one parameter and ask the device to store it.
    pub fn write_one_persistent(&mut self, id: u16, value: ParameterValue) -> Result<()> {
        self.write(id, value, true)
    }

    /// Set a local value for a later [`Engine::store_all`] without device
    /// traffic.
    pub fn stage(&mut self, id: u16, value: ParameterValue) -> Result<()> {
        self.checked(id, |param| {
            if !param.access.is_writable() {
                return Err(AccessViolation::ReadOnly);
            }
            param.check_value(&value)
        })?;
        let table = self.table_mut().ok_or(Error::NotConnected)?;
        let param = table
            .get_mut(id)
            .ok_or(Error::ParameterAccess {
                id,
                violation: AccessViolation::UnknownParameter,
            })?;
        param.stage(value);
        let event = Event::ParameterUpdated {
            id,
            value: param.value().cloned(),
            status: param.status(),
        };
        debug!("Staged parameter {id}");
        self.emit(event);
        Ok(())
    }

    /// Read every readable parameter, one request at a time.
    pub fn read_all(&mut self) -> Result<BatchReport> {
        self.ensure_ready()?;
        self.ensure_parameter_mode()?;
        let ids = self.batch_ids(|p| p.access.is_readable());
        info!("Reading {} parameter(s)", ids.len());
        Ok(self.run_batch(BatchKind::ReadAll, ids, |engine, id| engine.read_one(id)))
    }

    /// Persistently write the current value of every writable, stored
    /// parameter. Parameters without a known value are skipped.
    pub fn store_all(&mut self) -> Result<BatchReport> {
        self.ensure_ready()?;
        self.ensure_parameter_mode()?;
        let ids = self.batch_ids(|p| {
            p.access.is_writable() && p.persistence == Persistence::Stored && p.value().is_some()
        });
        info!("Storing {} parameter(s)", ids.len());
        Ok(self.run_batch(BatchKind::StoreAll, ids, |engine, id| {
            let value = engine
                .parameter(id)
                .and_then(|p| p.value().cloned())
                .ok_or(Error::ParameterAccess {
                    id,
                    violation: AccessViolation::NothingToStore,
                })?;
            engine.write_one_persistent(id, value.clone())?;
            Ok(value)
        }))
    }

    fn write(&mut self, id: u16, value: ParameterValue, persist: bool) -> Result<()> {
        let kind = self.checked(id, |param| {
            if !param.access.is_writable() {
                return Err(AccessViolation::ReadOnly);
            }
            if persist && param.persistence == Persistence::Volatile {
                return Err(AccessViolation::PersistenceNotSupported);
            }
            param.check_value(&value)?;
            Ok(param.kind.clone())
        })?;
        self.ensure_parameter_mode()?;

        let result = self
            .exchange(Request::write_parameter(id, persist, &value))
            .and_then(|frame| {
                if frame.body().is_empty() {
                    check_status(id, &frame)?;
                    Ok(value.clone())
                } else {
                    decode_response(id, &kind, &frame)
                }
            });
        self.record(id, result).map(|_| ())
    }

    fn checked<R>(
        &self,
        id: u16,
        check: impl FnOnce(&Parameter) -> std::result::Result<R, AccessViolation>,
    ) -> Result<R> {
        let table = self.table().ok_or(Error::NotConnected)?;
        let param = table
            .get(id)
            .ok_or(Error::ParameterAccess {
                id,
                violation: AccessViolation::UnknownParameter,
            })?;
        check(param).map_err(|violation| Error::ParameterAccess { id, violation })
    }

    fn ensure_parameter_mode(&self) -> Result<()> {
        let active = self.mode();
        if active == Mode::Parameter {
            Ok(())
        } else {
            Err(Error::WrongMode {
                expected: Mode::Parameter,
                active,
            })
        }
    }

    /// Apply the outcome of a device round trip to the table.
    fn record(&mut self, id: u16, result: Result<ParameterValue>) -> Result<ParameterValue> {
        let Some(param) = self
            .table_mut()
            .and_then(|t| t.get_mut(id))
        else {
            return result;
        };
        match &result {
            Ok(value) => param.record_confirmed(value.clone()),
            Err(e) => {
                warn!("Parameter {id} ({}) failed: {e}", param.name);
                param.record_failure();
            },
        }
        let event = Event::ParameterUpdated {
            id,
            value: param.value().cloned(),
            status: param.status(),
        };
        self.emit(event);
        result
    }

    fn batch_ids(&self, include: impl Fn(&Parameter) -> bool) -> Vec<u16> {
        self.table()
            .map(|t| {
                t.iter()
                    .filter(|p| include(p))
                    .map(|p| p.id)
                    .collect()
            })
            .unwrap_or_default()
    }

    fn run_batch(
        &mut self,
        kind: BatchKind,
        ids: Vec<u16>,
        mut op: impl FnMut(&mut Self, u16) -> Result<ParameterValue>,
    ) -> BatchReport {
        let mut items = Vec::with_capacity(ids.len());
        let mut halted: Option<FailureReason> = None;

        for id in ids {
            if halted.is_none() && self.cancel_token().is_cancelled() {
                halted = Some(FailureReason::Cancelled);
            }
            if let Some(reason) = &halted {
                if let Some(param) = self
                    .table_mut()
                    .and_then(|t| t.get_mut(id))
                {
                    param.record_failure();
                }
                items.push(BatchItem {
                    id,
                    outcome: Err(reason.clone()),
                });
                continue;
            }

            let outcome = op(self, id).map_err(|e| FailureReason::from(&e));
            if let Err(reason @ (FailureReason::LinkLost | FailureReason::Cancelled)) = &outcome {
                halted = Some(reason.clone());
            }
            items.push(BatchItem { id, outcome });
        }

        let report = BatchReport { kind, items };
        if report.is_success() {
            info!("{kind}: {} parameter(s) ok", report.len());
        } else {
            warn!(
                "{kind}: {} of {} parameter(s) failed: {:?}",
                report.len() - report.succeeded(),
                report.len(),
                report.failed_ids()
            );
        }
        self.emit(Event::BatchOperationCompleted(report.clone()));
        report
    }
}

fn check_status(id: u16, frame: &Frame) -> Result<()> {
    match frame.status() {
        Some(status) if status.is_ok() => Ok(()),
        Some(status) => Err(Error::Rejected { id, status }),
        None => Err(Error::Protocol(format!(
            "empty response for parameter {id}"
        ))),
    }
}

/// Decode `[id][tag][value]` after the status byte.
fn decode_response(id: u16, kind: &ParameterType, frame: &Frame) -> Result<ParameterValue> {
    check_status(id, frame)?;
    let mut body = frame.body();
    let echoed = body
        .read_u16::<LittleEndian>()
        .map_err(|_| Error::Protocol(format!("response for parameter {id} lacks an id")))?;
    if echoed != id {
        return Err(Error::Protocol(format!(
            "response for parameter {id} names parameter {echoed}"
        )));
    }
    let (value, _) = ParameterValue::decode(kind, body)?;
    Ok(value)
}
