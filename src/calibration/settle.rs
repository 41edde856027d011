//! Waiting for the calibrator output to settle.

use super::RunFlag;
use crate::error::{CalError, CalResult};
use crate::instrument::commands::{self, SETTLED_BIT, STATUS_REGISTER};
use crate::instrument::InstrumentSession;
use std::time::Duration;
use tokio::time::Instant;

/// Result of a settle wait.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Settle {
    /// The settled bit was observed
    Settled {
        /// Status register polls issued
        polls: usize,
    },
    /// The running flag was cleared while waiting
    Interrupted,
}

/// Polls the source status register until the settled bit is set.
#[derive(Debug, Clone, Copy)]
pub struct SettlingWaiter {
    bit: u32,
    poll_interval: Duration,
    timeout: Duration,
}

impl SettlingWaiter {
    /// Waiter for the calibrator settled bit.
    pub fn new(poll_interval: Duration, timeout: Duration) -> Self {
        Self {
            bit: SETTLED_BIT,
            poll_interval,
            timeout,
        }
    }

    /// Watch a different status bit.
    pub fn with_bit(mut self, bit: u32) -> Self {
        self.bit = bit;
        self
    }

    /// Poll `source` until settled, stopped, or the timeout expires.
    ///
    /// Expiry is [`CalError::SettleTimeout`], distinct from a communication
    /// failure.
    pub async fn wait(
        &self,
        source: &mut dyn InstrumentSession,
        flag: &RunFlag,
    ) -> CalResult<Settle> {
        let started = Instant::now();
        let address = source.address().to_string();
        let mut polls = 0;

        loop {
            if !flag.is_running() {
                return Ok(Settle::Interrupted);
            }

            let reply = source.query(STATUS_REGISTER).await?;
            polls += 1;
            let register = commands::parse_status_register(&address, &reply)?;
            if commands::status_bit_set(register, self.bit) {
                tracing::trace!(%address, polls, "source settled");
                return Ok(Settle::Settled { polls });
            }

            if started.elapsed() >= self.timeout {
                return Err(CalError::SettleTimeout {
                    address,
                    waited: started.elapsed(),
                });
            }
            tokio::time::sleep(self.poll_interval).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::instrument::{GpibAddress, MockInstrument};

    fn source() -> MockInstrument {
        MockInstrument::calibrator(GpibAddress::new(0, 4).unwrap())
    }

    fn running() -> RunFlag {
        let flag = RunFlag::new();
        flag.try_start();
        flag
    }

    fn waiter() -> SettlingWaiter {
        SettlingWaiter::new(Duration::from_millis(1), Duration::from_millis(200))
    }

    #[tokio::test]
    async fn settles_on_first_poll() {
        let mut session = source();
        let outcome = waiter().wait(&mut session, &running()).await.unwrap();
        assert_eq!(outcome, Settle::Settled { polls: 1 });
    }

    #[tokio::test]
    async fn keeps_polling_until_bit_appears() {
        let mut session = source().with_reply_sequence("ISR?", &["0", "8", "4096"]);
        let outcome = waiter().wait(&mut session, &running()).await.unwrap();
        assert_eq!(outcome, Settle::Settled { polls: 3 });
    }

    #[tokio::test]
    async fn never_settling_source_times_out_distinctly() {
        let mut session = source().with_reply("ISR?", "0");
        let err = SettlingWaiter::new(Duration::from_millis(1), Duration::from_millis(20))
            .wait(&mut session, &running())
            .await
            .unwrap_err();
        assert!(matches!(err, CalError::SettleTimeout { .. }));
        assert!(!err.triggers_fallback());
    }

    #[tokio::test]
    async fn stop_interrupts_the_wait() {
        let flag = running();
        let ui = flag.clone();
        let mut session = source().with_reply("ISR?", "0").on_query(move |_| ui.stop());

        let outcome = waiter().wait(&mut session, &flag).await.unwrap();
        assert_eq!(outcome, Settle::Interrupted);
    }

    #[tokio::test]
    async fn stopped_flag_issues_no_poll() {
        let flag = RunFlag::new();
        let mock = source();
        let mut session = mock.clone();
        assert_eq!(waiter().wait(&mut session, &flag).await.unwrap(), Settle::Interrupted);
        assert!(mock.queries().is_empty());
    }
}
