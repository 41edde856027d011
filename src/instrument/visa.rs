//! VISA sessions for GPIB instruments
//!
//! Wraps the visa-rs crate. VISA I/O is synchronous, so every call runs on
//! Tokio's blocking task executor to keep the runtime responsive.
//!
//! Only compiled with the `instrument_visa` feature, which also requires a
//! system VISA library (NI-VISA, Keysight IO Libraries, R&S VISA) at link time.

use super::{GpibAddress, InstrumentConnector, InstrumentSession};
use crate::error::{CalError, CalResult};
use async_trait::async_trait;
use std::ffi::CString;
use std::io::{BufRead, BufReader, Write};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use visa_rs::prelude::*;

/// Opens VISA resources through the default resource manager.
pub struct VisaConnector {
    rm: Arc<Mutex<DefaultRM>>,
}

impl VisaConnector {
    /// Open the default resource manager.
    pub fn new() -> CalResult<Self> {
        let rm = DefaultRM::new()
            .map_err(|e| CalError::unreachable("VISA", format!("resource manager: {e:?}")))?;
        Ok(Self {
            rm: Arc::new(Mutex::new(rm)),
        })
    }
}

#[async_trait]
impl InstrumentConnector for VisaConnector {
    async fn connect(
        &self,
        address: GpibAddress,
        timeout: Duration,
    ) -> CalResult<Box<dyn InstrumentSession>> {
        let rm = Arc::clone(&self.rm);
        let resource = address.resource_string();
        let instrument = tokio::task::spawn_blocking(move || -> CalResult<Instrument> {
            let rm = rm
                .lock()
                .map_err(|_| CalError::unreachable(address, "resource manager lock poisoned"))?;
            let name = CString::new(resource.as_str())
                .map_err(|_| CalError::InvalidAddress(resource.clone()))?;
            rm.open(&name.into(), AccessMode::NO_LOCK, timeout)
                .map_err(|e| CalError::unreachable(address, format!("{e:?}")))
        })
        .await
        .map_err(|e| CalError::Task(e.to_string()))??;

        tracing::info!(%address, "VISA session opened");
        Ok(Box::new(VisaSession {
            address,
            instrument: Arc::new(Mutex::new(instrument)),
            timeout,
            line_terminator: "\n".to_string(),
        }))
    }
}

/// One open VISA instrument.
pub struct VisaSession {
    address: GpibAddress,
    instrument: Arc<Mutex<Instrument>>,
    timeout: Duration,
    line_terminator: String,
}

impl VisaSession {
    async fn blocking<T, F>(&self, command: &str, io: F) -> CalResult<T>
    where
        T: Send + 'static,
        F: FnOnce(&Instrument) -> std::io::Result<T> + Send + 'static,
    {
        let instrument = Arc::clone(&self.instrument);
        let address = self.address;
        let owned = command.to_string();
        tokio::task::spawn_blocking(move || {
            let guard = instrument
                .lock()
                .map_err(|_| CalError::protocol(address, &owned, "session lock poisoned"))?;
            io(&guard).map_err(|e| CalError::protocol(address, &owned, e.to_string()))
        })
        .await
        .map_err(|e| CalError::Task(e.to_string()))?
    }
}

#[async_trait]
impl InstrumentSession for VisaSession {
    fn address(&self) -> GpibAddress {
        self.address
    }

    async fn write(&mut self, command: &str) -> CalResult<()> {
        let line = format!("{command}{}", self.line_terminator);
        self.blocking(command, move |instrument| {
            let mut writer = instrument;
            writer.write_all(line.as_bytes())
        })
        .await
    }

    async fn query(&mut self, command: &str) -> CalResult<String> {
        let line = format!("{command}{}", self.line_terminator);
        self.blocking(command, move |instrument| {
            let mut writer = instrument;
            writer.write_all(line.as_bytes())?;
            let mut reply = String::new();
            BufReader::new(instrument).read_line(&mut reply)?;
            Ok(reply.trim_end().to_string())
        })
        .await
    }

    fn timeout(&self) -> Duration {
        self.timeout
    }

    fn set_timeout(&mut self, timeout: Duration) {
        self.timeout = timeout;
    }
}
