//! Custom error types for the bench framework.
//!
//! `BenchError` is the single error type returned by the library. The variants
//! follow the way failures are handled at the bench:
//!
//! - **Connection errors** (`Connection`, `IdentityMismatch`): the instrument is
//!   unreachable or is not the device the configuration says it is. These are
//!   fatal for that instrument and are never retried.
//! - **Validation errors** (`OutOfRange`, `LimitsOutsideAbsolute`,
//!   `MalformedLimits`, `InvalidChannel`, `ChannelLayout`, `AlreadyReserved`,
//!   `NotReserved`, ...): precondition violations reported before any command is
//!   sent to the hardware.
//! - **`ReadbackMismatch`**: a verified write read back a different value.
//! - **`Fault`**: a watchdog detected a device or channel fault and the run was
//!   aborted.
//! - **`ShutdownFailed`**: teardown continued past one or more errors, which are
//!   collected here.
//!
//! Configuration and I/O errors are wrapped with `#[from]` so that `?` works on
//! them directly.

use crate::channel::{Limits, Quantity};
use crate::instrument::Lifecycle;
use crate::watchdog::FaultReport;
use thiserror::Error;

/// Convenience alias for results using the bench error type.
pub type AppResult<T> = std::result::Result<T, BenchError>;

#[derive(Error, Debug)]
pub enum BenchError {
    #[error("Configuration error: {0}")]
    Config(#[from] figment::Error),

    #[error("Configuration validation error: {0}")]
    Configuration(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Could not connect to {name} at {address}: {reason}. Available resources: {available:?}")]
    Connection {
        name: String,
        address: String,
        reason: String,
        available: Vec<String>,
    },

    #[error("Unexpected identity from {name}: expected \"{expected}\", received \"{received}\"")]
    IdentityMismatch {
        name: String,
        expected: String,
        received: String,
    },

    #[error("Transport error on {resource}: {message}")]
    Transport { resource: String, message: String },

    #[error("{name} is not connected")]
    NotConnected { name: String },

    #[error("{name}: cannot {operation} while {state}")]
    InvalidState {
        name: String,
        operation: &'static str,
        state: Lifecycle,
    },

    #[error("{target}: requested {quantity} {value} {unit} is outside the permitted range {limits} {unit}", unit = .quantity.unit())]
    OutOfRange {
        target: String,
        quantity: Quantity,
        value: f64,
        limits: Limits,
    },

    #[error("{target}: requested {quantity} limits {requested} are not within the channel limits {absolute}")]
    LimitsOutsideAbsolute {
        target: String,
        quantity: Quantity,
        requested: Limits,
        absolute: Limits,
    },

    #[error("Malformed {quantity} limits: minimum {min} is greater than maximum {max}")]
    MalformedLimits { quantity: Quantity, min: f64, max: f64 },

    #[error("{target} has no {quantity} control")]
    UnsupportedQuantity { target: String, quantity: Quantity },

    #[error("{target} does not support {operation}")]
    Unsupported {
        target: String,
        operation: &'static str,
    },

    #[error("Channel {index} does not exist on {instrument} (valid channels are 1..={count})")]
    InvalidChannel {
        instrument: String,
        index: usize,
        count: usize,
    },

    #[error("Channels of {instrument} must be numbered 1..={count} without gaps or duplicates, got {found:?}")]
    ChannelLayout {
        instrument: String,
        count: usize,
        found: Vec<usize>,
    },

    #[error("{target} is already reserved for {holder}")]
    AlreadyReserved { target: String, holder: String },

    #[error("Attempted to free {target}, which is not reserved")]
    NotReserved { target: String },

    #[error("{target} must be reserved before its output is enabled")]
    OutputRequiresReservation { target: String },

    #[error("{target} output is already enabled")]
    OutputAlreadyEnabled { target: String },

    #[error("{target} is not attached to an open instrument")]
    Detached { target: String },

    #[error("Readback mismatch on {target}: commanded {quantity} {commanded}, instrument reports {readback}")]
    ReadbackMismatch {
        target: String,
        quantity: Quantity,
        commanded: String,
        readback: String,
    },

    #[error("Output state mismatch on {target}: expected output enabled = {expected}")]
    OutputStateMismatch { target: String, expected: bool },

    #[error("Unexpected response from {name} to \"{command}\": \"{response}\"")]
    MalformedResponse {
        name: String,
        command: String,
        response: String,
    },

    #[error("Command template error: {0}")]
    Template(String),

    #[error("Unknown instrument: {0}")]
    UnknownInstrument(String),

    #[error("Instrument fault: {0}")]
    Fault(FaultReport),

    #[error("Feature '{0}' is not enabled. Please build with --features {0}")]
    FeatureNotEnabled(String),

    #[error("Shutdown failed with errors")]
    ShutdownFailed(Vec<BenchError>),
}

impl BenchError {
    /// Whether this error was produced by a fault watchdog.
    pub fn is_fault(&self) -> bool {
        matches!(self, BenchError::Fault(_))
    }

    /// Collapse teardown errors: none is success, one is returned as-is.
    pub(crate) fn from_teardown(mut errors: Vec<BenchError>) -> AppResult<()> {
        match errors.len() {
            0 => Ok(()),
            1 => Err(errors.remove(0)),
            _ => Err(BenchError::ShutdownFailed(errors)),
        }
    }
}
