//! Calibration passes.
//!
//! A pass walks the active [`ModeProfile`](crate::profile::ModeProfile) in
//! table order and pushes every completed point to a [`ResultSink`]. Two
//! [`Sequencer`] implementations produce identically shaped output:
//!
//! - [`HardwareSequencer`] drives the calibrator and the multimeter
//! - [`SimulatedSequencer`] generates randomized points without instruments
//!
//! Both check the shared [`RunFlag`] at fixed points and treat a cleared flag
//! as a normal early end, not a failure.

mod hardware;
mod point;
mod run_flag;
pub mod sampler;
pub mod settle;
mod simulated;

pub use hardware::HardwareSequencer;
pub use point::MeasurementPoint;
pub use run_flag::{RunFlag, RunGuard};
pub use sampler::{MeasurementSampler, Sample, SampleStats, SAMPLES_PER_POINT};
pub use settle::{Settle, SettlingWaiter};
pub use simulated::{LeadChangePrompt, SimulatedSequencer};

use crate::error::CalResult;
use crate::profile::SharedProfile;
use crate::sink::ResultSink;
use async_trait::async_trait;
use serde::Serialize;
use std::fmt;
use std::sync::Arc;

/// Everything a pass needs besides its own instruments.
#[derive(Clone)]
pub struct PassContext {
    /// Active profile and result slots
    pub profile: SharedProfile,
    /// Cancellation flag
    pub flag: RunFlag,
    /// Output of the pass
    pub sink: Arc<dyn ResultSink>,
}

/// How a pass ended without error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum PassOutcome {
    /// Every point, including the linearity ladder, was measured
    Completed {
        /// Main-table points pushed
        points: usize,
        /// Linearity points pushed
        linearity_points: usize,
    },
    /// The running flag was cleared
    Interrupted {
        /// Main-table points pushed before the stop
        points: usize,
    },
    /// The simulated pass stopped for the operator to change test leads
    Paused {
        /// Main-table points pushed before the pause
        points: usize,
    },
}

impl PassOutcome {
    /// Main-table points pushed.
    pub fn points(&self) -> usize {
        match *self {
            PassOutcome::Completed { points, .. }
            | PassOutcome::Interrupted { points }
            | PassOutcome::Paused { points } => points,
        }
    }
}

/// Which implementation produced a pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SequencerKind {
    /// Real instruments
    Hardware,
    /// Randomized data
    Simulated,
}

impl fmt::Display for SequencerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SequencerKind::Hardware => f.write_str("hardware"),
            SequencerKind::Simulated => f.write_str("simulated"),
        }
    }
}

/// One full pass over the active profile.
#[async_trait]
pub trait Sequencer: Send {
    /// Implementation tag.
    fn kind(&self) -> SequencerKind;

    /// Run the pass. Instrument failures abort the whole pass unretried.
    async fn run(&mut self, ctx: &PassContext) -> CalResult<PassOutcome>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn outcome_reports_points() {
        assert_eq!(
            PassOutcome::Completed {
                points: 11,
                linearity_points: 5
            }
            .points(),
            11
        );
        assert_eq!(PassOutcome::Interrupted { points: 3 }.points(), 3);
        assert_eq!(PassOutcome::Paused { points: 5 }.points(), 5);
    }
}
