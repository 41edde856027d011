//! Scripted instrument for testing
//!
//! `MockInstrument` implements [`InstrumentSession`] without a bus. It provides:
//! - Replies scripted by command prefix
//! - A call log shared between clones for test verification
//! - One-shot and permanent failure injection
//! - A query hook, so a test can act at an exact point of a pass
//! - Simulated latency

use super::{GpibAddress, InstrumentConnector, InstrumentSession};
use crate::error::{CalError, CalResult};
use async_trait::async_trait;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

/// One command seen by a mock.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MockCall {
    /// Command sent with `write`
    Write(String),
    /// Command sent with `query`
    Query(String),
}

impl MockCall {
    /// The command text.
    pub fn command(&self) -> &str {
        match self {
            MockCall::Write(command) | MockCall::Query(command) => command,
        }
    }
}

type QueryHook = Arc<dyn Fn(&str) + Send + Sync>;

#[derive(Default)]
struct MockLog {
    calls: Vec<MockCall>,
    queries: usize,
}

/// Scripted instrument.
///
/// Clones share the call log and failure state, so a test keeps one clone
/// for inspection and hands another to the code under test.
///
/// # Example
///
/// ```
/// use kalibrator::instrument::{GpibAddress, InstrumentSession, MockInstrument};
///
/// # tokio_test::block_on(async {
/// let address = GpibAddress::new(0, 22).unwrap();
/// let meter = MockInstrument::multimeter(address, "0.0999");
/// let mut session = meter.clone();
/// assert_eq!(session.query("MEASure:VOLTage:DC? 0.1").await.unwrap(), "0.0999");
/// assert_eq!(meter.queries(), vec!["MEASure:VOLTage:DC? 0.1".to_string()]);
/// # })
/// ```
#[derive(Clone)]
pub struct MockInstrument {
    address: GpibAddress,
    replies: Vec<(String, String)>,
    sequences: Vec<(String, Arc<Mutex<Vec<String>>>)>,
    default_reply: Option<String>,
    fail_queries_from: Option<usize>,
    reachable: bool,
    latency: Duration,
    timeout: Duration,
    hook: Option<QueryHook>,
    should_fail_next: Arc<AtomicBool>,
    log: Arc<Mutex<MockLog>>,
}

impl MockInstrument {
    /// Mock without any scripted replies.
    pub fn new(address: GpibAddress) -> Self {
        Self {
            address,
            replies: Vec::new(),
            sequences: Vec::new(),
            default_reply: None,
            fail_queries_from: None,
            reachable: true,
            latency: Duration::ZERO,
            timeout: Duration::from_secs(5),
            hook: None,
            should_fail_next: Arc::new(AtomicBool::new(false)),
            log: Arc::new(Mutex::new(MockLog::default())),
        }
    }

    /// Calibrator that identifies, reports settled and has an empty error queue.
    pub fn calibrator(address: GpibAddress) -> Self {
        Self::new(address)
            .with_reply("*IDN?", "FLUKE,5522A,0,1.0")
            .with_reply("ISR?", "4096")
            .with_reply("ERR?", "0,\"No Error\"")
    }

    /// Multimeter that identifies and answers every measurement with `reading`.
    pub fn multimeter(address: GpibAddress, reading: &str) -> Self {
        Self::new(address)
            .with_reply("*IDN?", "HEWLETT-PACKARD,34401A,0,11-5-2")
            .with_reply("MEAS", reading)
    }

    /// Reply with `reply` to queries starting with `prefix`. Later entries win.
    pub fn with_reply(mut self, prefix: &str, reply: &str) -> Self {
        self.replies.push((prefix.to_string(), reply.to_string()));
        self
    }

    /// Answer queries starting with `prefix` with `replies` in turn, repeating
    /// the last one. Takes precedence over [`with_reply`](Self::with_reply).
    pub fn with_reply_sequence(mut self, prefix: &str, replies: &[&str]) -> Self {
        let replies = replies.iter().map(|reply| reply.to_string()).collect();
        self.sequences
            .push((prefix.to_string(), Arc::new(Mutex::new(replies))));
        self
    }

    /// Reply used when no prefix matches.
    pub fn with_default_reply(mut self, reply: &str) -> Self {
        self.default_reply = Some(reply.to_string());
        self
    }

    /// Fail every query from the `index`-th one (0-based) onwards.
    pub fn fail_queries_from(mut self, index: usize) -> Self {
        self.fail_queries_from = Some(index);
        self
    }

    /// Refuse connections through a [`MockConnector`].
    pub fn unreachable(mut self) -> Self {
        self.reachable = false;
        self
    }

    /// Simulated latency per call.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// Run `hook` with each query command before it is answered.
    pub fn on_query<F>(mut self, hook: F) -> Self
    where
        F: Fn(&str) + Send + Sync + 'static,
    {
        self.hook = Some(Arc::new(hook));
        self
    }

    /// Fail the next call, write or query.
    pub fn trigger_failure(&self) {
        self.should_fail_next.store(true, Ordering::SeqCst);
    }

    /// Every call seen so far.
    pub fn calls(&self) -> Vec<MockCall> {
        self.lock_log().calls.clone()
    }

    /// Command text of every call seen so far.
    pub fn commands(&self) -> Vec<String> {
        self.lock_log()
            .calls
            .iter()
            .map(|call| call.command().to_string())
            .collect()
    }

    /// Commands sent with `write`.
    pub fn writes(&self) -> Vec<String> {
        self.filtered(|call| matches!(call, MockCall::Write(_)))
    }

    /// Commands sent with `query`.
    pub fn queries(&self) -> Vec<String> {
        self.filtered(|call| matches!(call, MockCall::Query(_)))
    }

    /// Clear the call log.
    pub fn clear_calls(&self) {
        let mut log = self.lock_log();
        log.calls.clear();
        log.queries = 0;
    }

    fn filtered(&self, keep: impl Fn(&MockCall) -> bool) -> Vec<String> {
        self.lock_log()
            .calls
            .iter()
            .filter(|call| keep(call))
            .map(|call| call.command().to_string())
            .collect()
    }

    fn lock_log(&self) -> MutexGuard<'_, MockLog> {
        self.log.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn injected(&self, command: &str) -> CalError {
        CalError::protocol(self.address, command, "injected failure")
    }

    fn reply_for(&self, command: &str) -> CalResult<String> {
        let scripted = self
            .sequences
            .iter()
            .rev()
            .find(|(prefix, _)| command.starts_with(prefix.as_str()))
            .and_then(|(_, replies)| {
                let mut replies = replies.lock().unwrap_or_else(|p| p.into_inner());
                if replies.len() > 1 {
                    Some(replies.remove(0))
                } else {
                    replies.first().cloned()
                }
            });
        if let Some(reply) = scripted {
            return Ok(reply);
        }

        self.replies
            .iter()
            .rev()
            .find(|(prefix, _)| command.starts_with(prefix.as_str()))
            .map(|(_, reply)| reply.clone())
            .or_else(|| self.default_reply.clone())
            .ok_or_else(|| CalError::protocol(self.address, command, "no scripted reply"))
    }

    async fn simulate_latency(&self) {
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
    }
}

impl fmt::Debug for MockInstrument {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MockInstrument")
            .field("address", &self.address)
            .field("replies", &self.replies.len())
            .field("reachable", &self.reachable)
            .finish()
    }
}

#[async_trait]
impl InstrumentSession for MockInstrument {
    fn address(&self) -> GpibAddress {
        self.address
    }

    async fn write(&mut self, command: &str) -> CalResult<()> {
        self.lock_log().calls.push(MockCall::Write(command.to_string()));
        if self.should_fail_next.swap(false, Ordering::SeqCst) {
            return Err(self.injected(command));
        }
        self.simulate_latency().await;
        Ok(())
    }

    async fn query(&mut self, command: &str) -> CalResult<String> {
        let index = {
            let mut log = self.lock_log();
            log.calls.push(MockCall::Query(command.to_string()));
            log.queries += 1;
            log.queries - 1
        };
        if let Some(hook) = &self.hook {
            hook(command);
        }

        let permanent = self.fail_queries_from.is_some_and(|from| index >= from);
        if self.should_fail_next.swap(false, Ordering::SeqCst) || permanent {
            return Err(self.injected(command));
        }
        self.simulate_latency().await;
        self.reply_for(command)
    }

    fn timeout(&self) -> Duration {
        self.timeout
    }

    fn set_timeout(&mut self, timeout: Duration) {
        self.timeout = timeout;
    }
}

/// Connector that hands out registered mocks by address.
#[derive(Debug, Clone, Default)]
pub struct MockConnector {
    instruments: HashMap<GpibAddress, MockInstrument>,
}

impl MockConnector {
    /// Connector with no instruments on the bus.
    pub fn new() -> Self {
        Self::default()
    }

    /// Put `instrument` on the bus at its address.
    pub fn with_instrument(mut self, instrument: MockInstrument) -> Self {
        self.instruments.insert(instrument.address, instrument);
        self
    }
}

#[async_trait]
impl InstrumentConnector for MockConnector {
    async fn connect(
        &self,
        address: GpibAddress,
        timeout: Duration,
    ) -> CalResult<Box<dyn InstrumentSession>> {
        match self.instruments.get(&address) {
            Some(instrument) if instrument.reachable => {
                let mut session = instrument.clone();
                session.set_timeout(timeout);
                Ok(Box::new(session))
            }
            Some(_) => Err(CalError::unreachable(address, "mock instrument unplugged")),
            None => Err(CalError::unreachable(address, "no listener at address")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn address() -> GpibAddress {
        GpibAddress::new(0, 4).unwrap()
    }

    #[tokio::test]
    async fn prefix_replies_and_call_log() {
        let mock = MockInstrument::calibrator(address());
        let mut session = mock.clone();

        session.write("OUT 100 MV").await.unwrap();
        assert_eq!(session.query("ISR?").await.unwrap(), "4096");
        assert_eq!(
            mock.calls(),
            vec![
                MockCall::Write("OUT 100 MV".into()),
                MockCall::Query("ISR?".into())
            ]
        );
    }

    #[tokio::test]
    async fn later_reply_overrides_preset() {
        let mut mock = MockInstrument::calibrator(address()).with_reply("ISR?", "0");
        assert_eq!(mock.query("ISR?").await.unwrap(), "0");
    }

    #[tokio::test]
    async fn unscripted_query_is_protocol_error() {
        let mut mock = MockInstrument::new(address());
        assert!(matches!(
            mock.query("FOO?").await,
            Err(CalError::InstrumentProtocol { .. })
        ));
    }

    #[tokio::test]
    async fn reply_sequence_repeats_last() {
        let mut mock = MockInstrument::new(address()).with_reply_sequence("ISR?", &["0", "4096"]);
        assert_eq!(mock.query("ISR?").await.unwrap(), "0");
        assert_eq!(mock.query("ISR?").await.unwrap(), "4096");
        assert_eq!(mock.query("ISR?").await.unwrap(), "4096");
    }

    #[tokio::test]
    async fn one_shot_failure_clears_itself() {
        let mut mock = MockInstrument::new(address()).with_default_reply("1");
        mock.trigger_failure();
        assert!(mock.query("X?").await.is_err());
        assert!(mock.query("X?").await.is_ok());
    }

    #[tokio::test]
    async fn permanent_failure_from_index() {
        let mut mock = MockInstrument::new(address())
            .with_default_reply("1")
            .fail_queries_from(1);
        assert!(mock.query("A?").await.is_ok());
        assert!(mock.query("B?").await.is_err());
        assert!(mock.query("C?").await.is_err());
    }

    #[tokio::test]
    async fn hook_sees_every_query() {
        let seen = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&seen);
        let mut mock = MockInstrument::new(address())
            .with_default_reply("1")
            .on_query(move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
            });
        mock.query("A?").await.unwrap();
        mock.write("B").await.unwrap();
        mock.query("C?").await.unwrap();
        assert_eq!(seen.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn connector_respects_reachability() {
        let connector = MockConnector::new()
            .with_instrument(MockInstrument::calibrator(address()))
            .with_instrument(MockInstrument::new(GpibAddress::new(0, 22).unwrap()).unreachable());

        let session = connector
            .connect(address(), Duration::from_millis(250))
            .await
            .unwrap();
        assert_eq!(session.timeout(), Duration::from_millis(250));

        let unplugged = connector
            .connect(GpibAddress::new(0, 22).unwrap(), Duration::from_secs(1))
            .await;
        assert!(unplugged.is_err());
        let absent = connector
            .connect(GpibAddress::new(0, 7).unwrap(), Duration::from_secs(1))
            .await;
        assert!(absent.is_err());
    }
}
