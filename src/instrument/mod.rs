//! Instrument sessions on the GPIB bus.
//!
//! The calibration pass talks to two instruments through [`InstrumentSession`]:
//! the measuring multimeter and the reference calibrator. Sessions are opened
//! by an [`InstrumentConnector`]:
//!
//! - [`VisaConnector`] (feature `instrument_visa`) opens real VISA resources
//! - [`UnavailableConnector`] reports every instrument as unreachable, so a
//!   build without VISA always runs the simulated path
//! - [`MockConnector`] hands out scripted [`MockInstrument`]s for tests
//!
//! [`LoggedSession`] wraps any session to bound each call by the transport
//! timeout and to echo traffic to the operator terminal.

mod address;
pub mod commands;
mod logged;
mod mock;
#[cfg(feature = "instrument_visa")]
mod visa;

pub use address::{prompt_address, GpibAddress};
pub use logged::LoggedSession;
pub use mock::{MockCall, MockConnector, MockInstrument};
#[cfg(feature = "instrument_visa")]
pub use visa::{VisaConnector, VisaSession};

use crate::error::{CalError, CalResult};
use async_trait::async_trait;
use std::time::Duration;

/// Connection to one instrument.
///
/// Calls are sequential; a call already blocked on I/O completes or times
/// out before the caller can observe a stop request.
#[async_trait]
pub trait InstrumentSession: Send {
    /// Bus address of the instrument.
    fn address(&self) -> GpibAddress;

    /// Send a command that produces no reply.
    async fn write(&mut self, command: &str) -> CalResult<()>;

    /// Send a command and read one reply line.
    async fn query(&mut self, command: &str) -> CalResult<String>;

    /// Per-call transport timeout.
    fn timeout(&self) -> Duration;

    /// Change the per-call transport timeout.
    fn set_timeout(&mut self, timeout: Duration);

    /// Identification probe. Any failure means the instrument is unreachable.
    async fn identify(&mut self) -> CalResult<String> {
        let address = self.address();
        match self.query(commands::IDENTIFY).await {
            Ok(reply) if reply.trim().is_empty() => Err(CalError::unreachable(
                address,
                "empty identification reply",
            )),
            Ok(reply) => Ok(reply.trim().to_string()),
            Err(CalError::InstrumentProtocol { reason, .. }) => {
                Err(CalError::unreachable(address, reason))
            }
            Err(e) => Err(e),
        }
    }
}

/// Opens sessions by address.
#[async_trait]
pub trait InstrumentConnector: Send + Sync {
    /// Open a session to `address` with the given transport timeout.
    async fn connect(
        &self,
        address: GpibAddress,
        timeout: Duration,
    ) -> CalResult<Box<dyn InstrumentSession>>;
}

/// Connector for builds without an instrument transport.
#[derive(Debug, Clone)]
pub struct UnavailableConnector {
    reason: String,
}

impl UnavailableConnector {
    /// Connector that fails every connection with `reason`.
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }
}

impl Default for UnavailableConnector {
    fn default() -> Self {
        Self::new("built without the instrument_visa feature")
    }
}

#[async_trait]
impl InstrumentConnector for UnavailableConnector {
    async fn connect(
        &self,
        address: GpibAddress,
        _timeout: Duration,
    ) -> CalResult<Box<dyn InstrumentSession>> {
        Err(CalError::unreachable(address, self.reason.clone()))
    }
}
