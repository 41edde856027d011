//! Randomized pass for demos and for the fallback when hardware fails.

use super::{MeasurementPoint, PassContext, PassOutcome, Sequencer, SequencerKind};
use crate::error::CalResult;
use async_trait::async_trait;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::ops::RangeInclusive;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

const VALUE_RANGE: RangeInclusive<f64> = 0.0..=1000.0;
const DIFFERENCE_RANGE: RangeInclusive<f64> = -1.0..=1.0;
const STD_DEV_RANGE: RangeInclusive<f64> = 0.01..=0.3;
const LINEARITY_OFFSET: RangeInclusive<f64> = -0.01..=0.01;
const LINEARITY_STD_DEV: RangeInclusive<f64> = 0.0005..=0.005;

/// Whether the operator was already asked to change test leads.
///
/// Shared with the controller, which resets it on every mode selection.
#[derive(Debug, Clone, Default)]
pub struct LeadChangePrompt {
    shown: Arc<AtomicBool>,
}

impl LeadChangePrompt {
    /// Prompt not yet shown.
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether the prompt has been shown.
    pub fn is_shown(&self) -> bool {
        self.shown.load(Ordering::SeqCst)
    }

    /// Mark the prompt shown. Returns `true` only for the first caller.
    pub fn mark_shown(&self) -> bool {
        !self.shown.swap(true, Ordering::SeqCst)
    }

    /// Allow the prompt again.
    pub fn reset(&self) {
        self.shown.store(false, Ordering::SeqCst);
    }
}

/// Produces points shaped exactly like the hardware pass.
///
/// The resistance profile pauses once after its lead-change index: the pass
/// clears the running flag and returns [`PassOutcome::Paused`]. Resuming runs
/// the whole table again from index 0.
pub struct SimulatedSequencer {
    rng: StdRng,
    point_delay: Duration,
    prompt: LeadChangePrompt,
}

impl SimulatedSequencer {
    /// Sequencer seeded from the OS.
    pub fn new(point_delay: Duration, prompt: LeadChangePrompt) -> Self {
        Self {
            rng: StdRng::from_entropy(),
            point_delay,
            prompt,
        }
    }

    /// Deterministic sequencer for tests.
    pub fn with_seed(point_delay: Duration, prompt: LeadChangePrompt, seed: u64) -> Self {
        Self {
            rng: StdRng::seed_from_u64(seed),
            point_delay,
            prompt,
        }
    }

    async fn pause_between_points(&self) {
        if !self.point_delay.is_zero() {
            tokio::time::sleep(self.point_delay).await;
        }
    }
}

#[async_trait]
impl Sequencer for SimulatedSequencer {
    fn kind(&self) -> SequencerKind {
        SequencerKind::Simulated
    }

    async fn run(&mut self, ctx: &PassContext) -> CalResult<PassOutcome> {
        let snapshot = ctx.profile.snapshot().await;
        snapshot.profile.validate()?;
        let profile = &snapshot.profile;
        let mode = profile.mode;
        let total = profile.len();
        tracing::info!(%mode, points = total, "simulated pass started");

        for index in 0..total {
            if !ctx.flag.is_running() {
                ctx.sink.log("Generation interrupted.");
                return Ok(PassOutcome::Interrupted { points: index });
            }

            let reference = profile.references[index];
            let unit = profile.units[index];
            let label = mode.display_label(unit);
            let point = MeasurementPoint {
                point_index: index,
                set_value: reference,
                measured_average: self.rng.gen_range(VALUE_RANGE),
                std_dev: self.rng.gen_range(STD_DEV_RANGE),
                difference: self.rng.gen_range(DIFFERENCE_RANGE),
                unit: label,
                frequency: profile.frequency_for(index),
            };

            ctx.profile.record(snapshot.generation, &point).await;
            ctx.sink.push(&point)?;
            ctx.sink.log(&format!(
                "Index {index} - Simulated {mode}: {:.3} {}, diff {:.3} {} \
                 (ref: {reference} {unit})",
                point.measured_average, point.unit, point.difference, point.unit
            ));

            if profile.lead_change_pause == Some(index) && self.prompt.mark_shown() {
                ctx.flag.stop();
                ctx.sink
                    .log("Reconnect the test leads for 2-wire resistance, then resume.");
                tracing::info!(index, "simulated pass paused for lead change");
                return Ok(PassOutcome::Paused {
                    points: index + 1,
                });
            }
            self.pause_between_points().await;
        }

        let mut linearity_points = 0;
        if profile.has_linearity() {
            for (index, (&reference, &unit)) in profile
                .linear_references
                .iter()
                .zip(&profile.linear_units)
                .enumerate()
            {
                if !ctx.flag.is_running() {
                    ctx.sink.log("Generation interrupted.");
                    return Ok(PassOutcome::Interrupted { points: total });
                }

                let measured = reference + self.rng.gen_range(LINEARITY_OFFSET);
                let point = MeasurementPoint::from_average(
                    index,
                    reference,
                    measured,
                    self.rng.gen_range(LINEARITY_STD_DEV),
                    mode.display_label(unit),
                    profile.linearity_frequency(),
                );
                ctx.profile
                    .record_linearity(snapshot.generation, &point)
                    .await;
                ctx.sink.push_linearity(&point)?;
                linearity_points += 1;
                self.pause_between_points().await;
            }
        }

        Ok(PassOutcome::Completed {
            points: total,
            linearity_points,
        })
    }
}
