//! Calibration pass against real instruments.

use super::{
    MeasurementPoint, MeasurementSampler, PassContext, PassOutcome, RunFlag, Sample, SampleStats,
    Sequencer, SequencerKind, Settle, SettlingWaiter,
};
use crate::error::CalResult;
use crate::instrument::commands::{self, MeterFunction, ERROR_QUERY, OPERATE, STANDBY};
use crate::instrument::InstrumentSession;
use crate::profile::{MeterRange, ModeProfile, ProfileSnapshot, Unit};
use async_trait::async_trait;

/// One set-point as the instruments see it.
struct SetPoint {
    reference: f64,
    unit: Unit,
    range: MeterRange,
    function: MeterFunction,
    frequency: Option<f64>,
}

enum Step {
    Measured(SampleStats),
    Interrupted,
}

/// Drives the calibrator through the profile and samples the multimeter.
///
/// Per point: configure the meter, program the source (plus the test
/// frequency on AC), check the source error queue, operate, wait for the
/// settled bit, sample, normalize, push, standby. Voltage profiles finish
/// with the linearity ladder at a fixed range and without normalization.
pub struct HardwareSequencer {
    meter: Box<dyn InstrumentSession>,
    source: Box<dyn InstrumentSession>,
    waiter: SettlingWaiter,
    sampler: MeasurementSampler,
}

impl HardwareSequencer {
    /// Sequencer over an open meter and source.
    pub fn new(
        meter: Box<dyn InstrumentSession>,
        source: Box<dyn InstrumentSession>,
        waiter: SettlingWaiter,
    ) -> Self {
        Self {
            meter,
            source,
            waiter,
            sampler: MeasurementSampler::default(),
        }
    }

    /// Use a different sampler.
    pub fn with_sampler(mut self, sampler: MeasurementSampler) -> Self {
        self.sampler = sampler;
        self
    }

    fn main_point(profile: &ModeProfile, index: usize) -> SetPoint {
        SetPoint {
            reference: profile.references[index],
            unit: profile.units[index],
            range: profile.ranges[index],
            function: profile.function_for(index),
            frequency: profile.frequency_for(index),
        }
    }

    fn linearity_point(profile: &ModeProfile, index: usize) -> SetPoint {
        SetPoint {
            reference: profile.linear_references[index],
            unit: profile.linear_units[index],
            range: MeterRange::LINEARITY,
            function: profile.linearity_function(),
            frequency: profile.linearity_frequency(),
        }
    }

    async fn measure(&mut self, point: &SetPoint, flag: &RunFlag) -> CalResult<Step> {
        self.meter.write(&point.function.configure(point.range)).await?;
        self.source
            .write(&commands::output(point.reference, point.unit))
            .await?;
        if let Some(frequency) = point.frequency {
            self.source
                .write(&commands::output_frequency(frequency))
                .await?;
        }
        let source_address = self.source.address().to_string();
        let errors = self.source.query(ERROR_QUERY).await?;
        commands::check_error_queue(&source_address, &errors)?;
        self.source.write(OPERATE).await?;

        if !flag.is_running() {
            return Ok(Step::Interrupted);
        }
        if let Settle::Interrupted = self.waiter.wait(self.source.as_mut(), flag).await? {
            return Ok(Step::Interrupted);
        }
        if !flag.is_running() {
            return Ok(Step::Interrupted);
        }

        match self
            .sampler
            .sample(self.meter.as_mut(), &point.function, point.range, flag)
            .await?
        {
            Sample::Complete(stats) => Ok(Step::Measured(stats)),
            Sample::Interrupted { .. } => Ok(Step::Interrupted),
        }
    }

    async fn run_tables(
        &mut self,
        ctx: &PassContext,
        snapshot: &ProfileSnapshot,
    ) -> CalResult<PassOutcome> {
        let profile = &snapshot.profile;
        let mode = profile.mode;
        let total = profile.len();

        for index in 0..total {
            if !ctx.flag.is_running() {
                return Ok(interrupted(ctx, index));
            }

            let set_point = Self::main_point(profile, index);
            let stats = match self.measure(&set_point, &ctx.flag).await? {
                Step::Measured(stats) => stats,
                Step::Interrupted => return Ok(interrupted(ctx, index)),
            };

            let label = mode.display_label(set_point.unit);
            let point = MeasurementPoint::from_average(
                index,
                set_point.reference,
                set_point.unit.from_base(stats.average),
                set_point.unit.from_base(stats.std_dev),
                label,
                set_point.frequency,
            );
            if !ctx.profile.record(snapshot.generation, &point).await {
                tracing::debug!(index, "profile changed during pass, slot not updated");
            }
            ctx.sink.push(&point)?;
            ctx.sink.log(&format!(
                "Point {index}: {} {} -> {:.6} {} (diff {:.6}, std {:.6})",
                point.set_value,
                set_point.unit,
                point.measured_average,
                point.unit,
                point.difference,
                point.std_dev
            ));
            self.source.write(STANDBY).await?;
        }

        let mut linearity_points = 0;
        if profile.has_linearity() {
            ctx.sink.log("Starting linearity check");
            for index in 0..profile.linear_references.len() {
                if !ctx.flag.is_running() {
                    return Ok(interrupted(ctx, total));
                }

                let set_point = Self::linearity_point(profile, index);
                let stats = match self.measure(&set_point, &ctx.flag).await? {
                    Step::Measured(stats) => stats,
                    Step::Interrupted => return Ok(interrupted(ctx, total)),
                };

                let point = MeasurementPoint::from_average(
                    index,
                    set_point.reference,
                    stats.average,
                    stats.std_dev,
                    mode.display_label(set_point.unit),
                    set_point.frequency,
                );
                ctx.profile
                    .record_linearity(snapshot.generation, &point)
                    .await;
                ctx.sink.push_linearity(&point)?;
                self.source.write(STANDBY).await?;
                linearity_points += 1;
            }
        }

        Ok(PassOutcome::Completed {
            points: total,
            linearity_points,
        })
    }

    /// Best-effort return of the source to standby after a failed pass.
    async fn finalize(&mut self) {
        if let Err(e) = self.source.write(STANDBY).await {
            tracing::warn!(error = %e, "standby after failure was not acknowledged");
        }
    }
}

fn interrupted(ctx: &PassContext, points: usize) -> PassOutcome {
    tracing::info!(points, "calibration interrupted");
    ctx.sink
        .log(&format!("Calibration interrupted after {points} points."));
    PassOutcome::Interrupted { points }
}

#[async_trait]
impl Sequencer for HardwareSequencer {
    fn kind(&self) -> SequencerKind {
        SequencerKind::Hardware
    }

    async fn run(&mut self, ctx: &PassContext) -> CalResult<PassOutcome> {
        let snapshot = ctx.profile.snapshot().await;
        snapshot.profile.validate()?;
        tracing::info!(
            mode = %snapshot.profile.mode,
            points = snapshot.profile.len(),
            "hardware pass started"
        );

        match self.run_tables(ctx, &snapshot).await {
            Ok(outcome) => Ok(outcome),
            Err(error) => {
                tracing::warn!(%error, "hardware pass failed, putting source in standby");
                self.finalize().await;
                Err(error)
            }
        }
    }
}
