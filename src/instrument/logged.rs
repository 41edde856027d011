//! Session decorator that bounds and logs every call.

use super::{GpibAddress, InstrumentSession};
use crate::error::{CalError, CalResult};
use crate::sink::DisplaySink;
use async_trait::async_trait;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

/// Wraps a session with a transport timeout and terminal logging.
///
/// Every command is logged as `→ <addr> <cmd>` and every reply as
/// `← <addr> <reply>`, both to the operator terminal and to tracing. A call
/// that exceeds the timeout fails with [`CalError::InstrumentProtocol`].
pub struct LoggedSession {
    inner: Box<dyn InstrumentSession>,
    display: Arc<dyn DisplaySink>,
    timeout: Duration,
}

impl LoggedSession {
    /// Wrap `inner`, taking over its timeout.
    pub fn new(inner: Box<dyn InstrumentSession>, display: Arc<dyn DisplaySink>) -> Self {
        let timeout = inner.timeout();
        Self {
            inner,
            display,
            timeout,
        }
    }

    fn sent(&self, command: &str) {
        let address = self.inner.address();
        tracing::debug!(%address, command, "instrument command");
        self.display.log(&format!("→ {address} {command}"));
    }

    fn received(&self, reply: &str) {
        let address = self.inner.address();
        tracing::debug!(%address, reply, "instrument reply");
        self.display.log(&format!("← {address} {reply}"));
    }

    fn failed(&self, error: &CalError) {
        tracing::warn!(address = %self.inner.address(), %error, "instrument call failed");
        self.display.log(&format!("✗ {error}"));
    }

    async fn bounded<T>(
        timeout: Duration,
        address: GpibAddress,
        command: &str,
        call: impl Future<Output = CalResult<T>> + Send,
    ) -> CalResult<T> {
        match tokio::time::timeout(timeout, call).await {
            Ok(result) => result,
            Err(_) => Err(CalError::protocol(
                address,
                command,
                format!("no response within {timeout:?}"),
            )),
        }
    }
}

#[async_trait]
impl InstrumentSession for LoggedSession {
    fn address(&self) -> GpibAddress {
        self.inner.address()
    }

    async fn write(&mut self, command: &str) -> CalResult<()> {
        self.sent(command);
        let address = self.inner.address();
        let result = Self::bounded(self.timeout, address, command, self.inner.write(command)).await;
        if let Err(e) = &result {
            self.failed(e);
        }
        result
    }

    async fn query(&mut self, command: &str) -> CalResult<String> {
        self.sent(command);
        let address = self.inner.address();
        let result = Self::bounded(self.timeout, address, command, self.inner.query(command)).await;
        match &result {
            Ok(reply) => self.received(reply.trim()),
            Err(e) => self.failed(e),
        }
        result
    }

    fn timeout(&self) -> Duration {
        self.timeout
    }

    fn set_timeout(&mut self, timeout: Duration) {
        self.timeout = timeout;
        self.inner.set_timeout(timeout);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::instrument::MockInstrument;
    use crate::sink::DisplayModel;

    fn address() -> GpibAddress {
        GpibAddress::new(0, 22).unwrap()
    }

    #[tokio::test]
    async fn logs_commands_and_replies() {
        let display = Arc::new(DisplayModel::new());
        let mock = MockInstrument::multimeter(address(), "0.0999");
        let mut session = LoggedSession::new(Box::new(mock), display.clone());

        session.write("CONFigure:VOLTage:DC 0.1").await.unwrap();
        session.query("MEASure:VOLTage:DC? 0.1").await.unwrap();

        let lines = display.terminal_messages();
        assert_eq!(
            lines,
            vec![
                "→ GPIB0::22::INSTR CONFigure:VOLTage:DC 0.1".to_string(),
                "→ GPIB0::22::INSTR MEASure:VOLTage:DC? 0.1".to_string(),
                "← GPIB0::22::INSTR 0.0999".to_string(),
            ]
        );
    }

    #[tokio::test]
    async fn slow_reply_times_out_as_protocol_error() {
        let display = Arc::new(DisplayModel::new());
        let mock =
            MockInstrument::multimeter(address(), "1").with_latency(Duration::from_millis(200));
        let mut session = LoggedSession::new(Box::new(mock), display.clone());
        session.set_timeout(Duration::from_millis(10));

        let err = session.query("MEASure:VOLTage:DC? 10").await.unwrap_err();
        assert!(matches!(err, CalError::InstrumentProtocol { .. }));
        assert!(display
            .terminal_messages()
            .iter()
            .any(|line| line.starts_with('✗')));
    }
}
