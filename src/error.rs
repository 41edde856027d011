//! Custom error types for the application.
//!
//! This module defines the primary error type, `CalError`, for the whole crate.
//! Using the `thiserror` crate, it provides a centralized and consistent way to
//! classify what can go wrong during a calibration run.
//!
//! ## Error Hierarchy
//!
//! - **`InstrumentUnreachable`**: the session could not be opened or the
//!   identification probe failed. Eligible for the simulated fallback.
//! - **`InstrumentProtocol`**: a command timed out or produced a reply that
//!   could not be parsed mid-pass. Eligible for the simulated fallback.
//! - **`SettleTimeout`**: the reference source never reported settled status
//!   within the configured window. Distinct from a communication failure and
//!   never triggers the fallback.
//! - **`Profile`**: a mode profile whose parallel tables disagree in length.
//! - **`Persistence`**, **`Io`**, **`Csv`**: storage failures. These always
//!   propagate to the caller.
//! - **`Config`** / **`Configuration`**: parse and semantic configuration errors.
//!
//! By using `#[from]`, `CalError` can be created from the underlying error types
//! with the `?` operator.

use std::time::Duration;
use thiserror::Error;

/// Convenience alias for results using the crate error type.
pub type CalResult<T> = std::result::Result<T, CalError>;

#[allow(missing_docs)]
#[derive(Error, Debug)]
pub enum CalError {
    #[error("Instrument at {address} is unreachable: {reason}")]
    InstrumentUnreachable { address: String, reason: String },

    #[error("Instrument at {address} failed on '{command}': {reason}")]
    InstrumentProtocol {
        address: String,
        command: String,
        reason: String,
    },

    #[error("Source at {address} did not settle within {waited:?}")]
    SettleTimeout { address: String, waited: Duration },

    #[error("Invalid mode profile: {0}")]
    Profile(String),

    #[error("Invalid GPIB address: {0}")]
    InvalidAddress(String),

    #[error("Unknown measurement mode: {0}")]
    UnknownMode(String),

    #[error("Persistence error: {0}")]
    Persistence(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("Configuration error: {0}")]
    Config(#[from] Box<figment::Error>),

    #[error("Configuration validation error: {0}")]
    Configuration(String),

    #[error("Background task failed: {0}")]
    Task(String),
}

impl CalError {
    /// Build a protocol error for a command sent to `address`.
    pub fn protocol(
        address: impl ToString,
        command: impl Into<String>,
        reason: impl Into<String>,
    ) -> Self {
        CalError::InstrumentProtocol {
            address: address.to_string(),
            command: command.into(),
            reason: reason.into(),
        }
    }

    /// Build an unreachable error for `address`.
    pub fn unreachable(address: impl ToString, reason: impl Into<String>) -> Self {
        CalError::InstrumentUnreachable {
            address: address.to_string(),
            reason: reason.into(),
        }
    }

    /// Whether this failure permits switching to the simulated sequencer.
    ///
    /// Only instrument communication faults qualify. Everything else,
    /// including a settle timeout, propagates to the caller.
    pub fn triggers_fallback(&self) -> bool {
        matches!(
            self,
            CalError::InstrumentUnreachable { .. } | CalError::InstrumentProtocol { .. }
        )
    }
}

impl From<figment::Error> for CalError {
    fn from(value: figment::Error) -> Self {
        CalError::Config(Box::new(value))
    }
}
