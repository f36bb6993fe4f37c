use chrono::NaiveDate;
use ulid::Ulid;

use crate::model::{BookingStatus, Ms};

#[derive(Debug)]
pub enum EngineError {
    /// Malformed or out-of-range input, rejected before touching domain state.
    Validation {
        field: &'static str,
        reason: &'static str,
    },
    NotFound(Ulid),
    AlreadyExists(Ulid),
    /// No room in a capacity cell — safe to retry with a different slot.
    CapacityExhausted {
        service_id: Ulid,
        day: NaiveDate,
    },
    /// Bulk-update range too wide or inverted.
    InvalidRange {
        days: i64,
    },
    /// `set_capacity` outside the allowed band.
    InvalidCapacity(u32),
    /// The booking's status does not permit the requested operation.
    InvalidTransition {
        from: BookingStatus,
        op: &'static str,
    },
    /// Timestamp outside the configured booking lead-time window, or too
    /// close to the current appointment to touch.
    AdvanceWindow {
        scheduled_at: Ms,
        reason: &'static str,
    },
    /// An optional-service selection that is not part of the package,
    /// attributed to its position in the selection list.
    InvalidSelection {
        index: usize,
        service_id: Ulid,
    },
    WalError(String),
}

impl std::fmt::Display for EngineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineError::Validation { field, reason } => {
                write!(f, "invalid {field}: {reason}")
            }
            EngineError::NotFound(id) => write!(f, "not found: {id}"),
            EngineError::AlreadyExists(id) => write!(f, "already exists: {id}"),
            EngineError::CapacityExhausted { service_id, day } => {
                write!(f, "no capacity left for service {service_id} on {day}")
            }
            EngineError::InvalidRange { days } => {
                write!(f, "invalid date range: {days} days")
            }
            EngineError::InvalidCapacity(n) => write!(f, "invalid capacity: {n}"),
            EngineError::InvalidTransition { from, op } => {
                write!(f, "cannot {op} a {from} booking")
            }
            EngineError::AdvanceWindow { scheduled_at, reason } => {
                write!(f, "timestamp {scheduled_at} rejected: {reason}")
            }
            EngineError::InvalidSelection { index, service_id } => {
                write!(
                    f,
                    "selected_optional[{index}]: {service_id} is not an optional member of the package"
                )
            }
            EngineError::WalError(e) => write!(f, "WAL error: {e}"),
        }
    }
}

impl std::error::Error for EngineError {}
