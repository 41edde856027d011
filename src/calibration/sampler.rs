//! Repeated measurement of one set-point.

use super::RunFlag;
use crate::error::CalResult;
use crate::instrument::commands::{self, MeterFunction};
use crate::instrument::InstrumentSession;
use crate::profile::MeterRange;

/// Measurement queries issued per set-point.
pub const SAMPLES_PER_POINT: usize = 5;

/// Mean and spread of one sampled set-point, in raw instrument units.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SampleStats {
    /// Arithmetic mean
    pub average: f64,
    /// Sample standard deviation (N-1), zero for a single sample
    pub std_dev: f64,
    /// Number of readings
    pub count: usize,
}

impl SampleStats {
    /// Statistics over `readings`.
    pub fn from_readings(readings: &[f64]) -> Self {
        Self {
            average: mean(readings),
            std_dev: sample_std_dev(readings),
            count: readings.len(),
        }
    }
}

/// Outcome of a sampling run.
#[derive(Debug, Clone, PartialEq)]
pub enum Sample {
    /// All readings taken
    Complete(SampleStats),
    /// Stopped before the last reading; the partial readings are not usable
    Interrupted {
        /// Readings taken before the stop
        taken: usize,
    },
}

/// Issues a fixed number of measurement queries.
#[derive(Debug, Clone, Copy)]
pub struct MeasurementSampler {
    repeats: usize,
}

impl Default for MeasurementSampler {
    fn default() -> Self {
        Self::new(SAMPLES_PER_POINT)
    }
}

impl MeasurementSampler {
    /// Sampler taking `repeats` readings (at least one).
    pub fn new(repeats: usize) -> Self {
        Self {
            repeats: repeats.max(1),
        }
    }

    /// Readings per set-point.
    pub fn repeats(&self) -> usize {
        self.repeats
    }

    /// Query `meter` in `function` at `range`, checking `flag` before each reading.
    pub async fn sample(
        &self,
        meter: &mut dyn InstrumentSession,
        function: &MeterFunction,
        range: MeterRange,
        flag: &RunFlag,
    ) -> CalResult<Sample> {
        let command = function.measure(range);
        let address = meter.address().to_string();
        let mut readings = Vec::with_capacity(self.repeats);

        for _ in 0..self.repeats {
            if !flag.is_running() {
                return Ok(Sample::Interrupted {
                    taken: readings.len(),
                });
            }
            let reply = meter.query(&command).await?;
            readings.push(commands::parse_reading(&address, &command, &reply)?);
        }

        Ok(Sample::Complete(SampleStats::from_readings(&readings)))
    }
}

/// Arithmetic mean, zero for no values.
pub fn mean(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    values.iter().sum::<f64>() / values.len() as f64
}

/// Sample standard deviation (divide by N-1), zero when N < 2.
pub fn sample_std_dev(values: &[f64]) -> f64 {
    let n = values.len();
    if n < 2 {
        return 0.0;
    }
    let avg = mean(values);
    let variance = values.iter().map(|v| (v - avg).powi(2)).sum::<f64>() / (n - 1) as f64;
    variance.sqrt()
}
