//! Calibration controller.
//!
//! Owns the shared profile, the running flag and the output sink, and turns
//! operator intents (select, clear, start, stop, resume) into passes on a
//! spawned tokio task.
//!
//! ```text
//!   Idle ──start──> Probing ──probe ok──> Running ────┐
//!    ^                 │                    │ failure  │
//!    │                 └──probe failed──> Simulating <─┘
//!    │                                      │
//!    └───────────── pass ended ─────────────┤
//!                                           └─ RES lead change ─> Paused
//!                                                                   │ resume
//!                                                                   v
//!                                                               Simulating
//! ```
//!
//! The probe decides the branch once per start. After the first instrument
//! failure the controller stays on the simulated path for its lifetime. A
//! failure after real points were stored moves the simulated pass to a fresh
//! session, so no session mixes measured and generated rows.
//! Status changes are broadcast over a [`tokio::sync::watch`] channel.

use crate::calibration::{
    HardwareSequencer, LeadChangePrompt, PassContext, PassOutcome, RunFlag, RunGuard, Sequencer,
    SequencerKind, SettlingWaiter, SimulatedSequencer,
};
use crate::config::CalibratorConfig;
use crate::data::{MeasurementStore, SessionId};
use crate::error::{CalError, CalResult};
use crate::instrument::{GpibAddress, InstrumentConnector, InstrumentSession, LoggedSession};
use crate::profile::{Mode, SharedProfile};
use crate::sink::{CalibrationSink, DisplaySink, ResultSink};
use serde::Serialize;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::watch;
use tokio::task::JoinHandle;

/// Controller state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Phase {
    /// No pass running
    Idle,
    /// Opening and identifying instruments
    Probing,
    /// Hardware pass in progress
    Running,
    /// Simulated pass in progress
    Simulating,
    /// Simulated resistance pass waiting for a lead change
    Paused,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Phase::Idle => "idle",
            Phase::Probing => "probing",
            Phase::Running => "running",
            Phase::Simulating => "simulating",
            Phase::Paused => "paused",
        };
        f.write_str(name)
    }
}

/// Snapshot broadcast to subscribers.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ControllerStatus {
    /// Current phase
    pub phase: Phase,
    /// Selected mode
    pub mode: Mode,
    /// Session of the current or last pass
    pub session_id: Option<SessionId>,
    /// Last failure, fallback included
    pub last_error: Option<String>,
    /// Whether the simulated path is latched
    pub simulated: bool,
}

/// Summary of a finished pass.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunReport {
    /// Session the points were stored under
    pub session_id: SessionId,
    /// Implementation that produced the final outcome
    pub sequencer: SequencerKind,
    /// How the pass ended
    pub outcome: PassOutcome,
    /// Whether an instrument failure switched the pass to simulation
    pub fell_back: bool,
}

/// Result of a start or resume request.
#[derive(Debug)]
pub enum StartOutcome {
    /// A pass was spawned
    Started(JoinHandle<CalResult<RunReport>>),
    /// A pass is already running; nothing changed
    AlreadyRunning,
    /// Resume requested without a paused pass
    NotPaused,
}

impl StartOutcome {
    /// The spawned task, if any.
    pub fn into_handle(self) -> Option<JoinHandle<CalResult<RunReport>>> {
        match self {
            StartOutcome::Started(handle) => Some(handle),
            StartOutcome::AlreadyRunning | StartOutcome::NotPaused => None,
        }
    }
}

/// Everything a spawned pass shares with the controller.
#[derive(Clone)]
struct PassRunner {
    config: Arc<CalibratorConfig>,
    connector: Arc<dyn InstrumentConnector>,
    display: Arc<dyn DisplaySink>,
    sink: Arc<CalibrationSink>,
    profile: SharedProfile,
    flag: RunFlag,
    prompt: LeadChangePrompt,
    meter: GpibAddress,
    source: GpibAddress,
    simulation_latched: Arc<AtomicBool>,
    seed: Option<u64>,
    status: Arc<watch::Sender<ControllerStatus>>,
    paused: Arc<Mutex<Option<SessionId>>>,
}

impl PassRunner {
    fn context(&self) -> PassContext {
        PassContext {
            profile: self.profile.clone(),
            flag: self.flag.clone(),
            sink: self.sink.clone(),
        }
    }

    fn publish(&self, update: impl FnOnce(&mut ControllerStatus)) {
        self.status.send_modify(update);
    }

    fn simulated(&self) -> SimulatedSequencer {
        let delay = self.config.sequencing.simulated_point_delay();
        match self.seed {
            Some(seed) => SimulatedSequencer::with_seed(delay, self.prompt.clone(), seed),
            None => SimulatedSequencer::new(delay, self.prompt.clone()),
        }
    }

    async fn open(
        &self,
        address: GpibAddress,
        role: &str,
    ) -> CalResult<Box<dyn InstrumentSession>> {
        let inner = self
            .connector
            .connect(address, self.config.instruments.timeout())
            .await?;
        let mut session = LoggedSession::new(inner, self.display.clone());
        let identity = session.identify().await?;
        tracing::info!(%address, role, identity = %identity, "instrument identified");
        self.sink.log(&format!("{role} at {address}: {identity}"));
        Ok(Box::new(session))
    }

    async fn probe(&self) -> CalResult<HardwareSequencer> {
        let meter = self.open(self.meter, "Multimeter").await?;
        let source = self.open(self.source, "Calibrator").await?;
        let sequencing = &self.config.sequencing;
        let waiter = SettlingWaiter::new(
            sequencing.settle_poll_interval(),
            sequencing.settle_timeout(),
        );
        Ok(HardwareSequencer::new(meter, source, waiter))
    }

    async fn run_simulated(&self, ctx: &PassContext) -> CalResult<PassOutcome> {
        self.publish(|s| s.phase = Phase::Simulating);
        self.simulated().run(ctx).await
    }

    async fn run_pass(&self, session_id: SessionId, resume: bool) -> CalResult<RunReport> {
        let ctx = self.context();

        if resume || self.simulation_latched.load(Ordering::SeqCst) {
            let outcome = self.run_simulated(&ctx).await?;
            return Ok(RunReport {
                session_id,
                sequencer: SequencerKind::Simulated,
                outcome,
                fell_back: false,
            });
        }

        self.publish(|s| s.phase = Phase::Probing);
        let hardware = match self.probe().await {
            Ok(mut sequencer) => {
                self.publish(|s| s.phase = Phase::Running);
                sequencer.run(&ctx).await
            }
            Err(error) => Err(error),
        };

        let fallback_allowed = !self.config.sequencing.hardware_required;
        match hardware {
            Ok(outcome) => Ok(RunReport {
                session_id,
                sequencer: SequencerKind::Hardware,
                outcome,
                fell_back: false,
            }),
            Err(error) if error.triggers_fallback() && fallback_allowed => {
                self.simulation_latched.store(true, Ordering::SeqCst);
                tracing::warn!(%error, "instrument failure, switching to simulated data");
                self.sink
                    .log(&format!("Instrument failure: {error}. Returning to simulated data."));
                let message = error.to_string();
                self.publish(|s| {
                    s.simulated = true;
                    s.last_error = Some(message);
                });

                let session_id = self.fallback_session(session_id).await?;
                let outcome = self.run_simulated(&ctx).await?;
                Ok(RunReport {
                    session_id,
                    sequencer: SequencerKind::Simulated,
                    outcome,
                    fell_back: true,
                })
            }
            Err(error) => Err(error),
        }
    }

    /// Session for the simulated pass after a hardware failure.
    ///
    /// Reuses `current` while it holds no rows, otherwise opens a new one.
    async fn fallback_session(&self, current: SessionId) -> CalResult<SessionId> {
        let kept = self.sink.stored_in_session();
        if kept == 0 {
            return Ok(current);
        }
        let profile = self.profile.snapshot().await.profile;
        let session_id = self.sink.start_session_for(&profile)?;
        tracing::info!(
            kept_session = current,
            kept,
            session = session_id,
            "simulated data moved to a new session"
        );
        self.sink.log(&format!(
            "{kept} measured points kept in session {current}; \
             simulated data goes to session {session_id}"
        ));
        self.publish(|s| s.session_id = Some(session_id));
        Ok(session_id)
    }

    async fn drive(
        self,
        guard: RunGuard,
        session_id: SessionId,
        resume: bool,
    ) -> CalResult<RunReport> {
        let result = self.run_pass(session_id, resume).await;
        // A paused pass already cleared the flag itself.
        drop(guard);

        let paused_session = match &result {
            Ok(report) if matches!(report.outcome, PassOutcome::Paused { .. }) => {
                Some(report.session_id)
            }
            _ => None,
        };
        let paused = paused_session.is_some();
        *self.paused.lock().unwrap_or_else(|p| p.into_inner()) = paused_session;

        match &result {
            Ok(report) => {
                tracing::info!(
                    session = report.session_id,
                    sequencer = %report.sequencer,
                    points = report.outcome.points(),
                    "pass finished"
                );
            }
            Err(error) => {
                tracing::error!(session = session_id, %error, "pass failed");
                self.sink.log(&format!("Calibration failed: {error}"));
            }
        }
        let error = result.as_ref().err().map(ToString::to_string);
        self.publish(|s| {
            s.phase = if paused { Phase::Paused } else { Phase::Idle };
            if error.is_some() {
                s.last_error = error;
            }
        });
        result
    }
}

/// Operator-facing state machine over one calibrator and one multimeter.
pub struct CalibrationController {
    runner: PassRunner,
}

impl CalibrationController {
    /// Controller reading addresses and timing from `config`.
    pub fn new(
        config: CalibratorConfig,
        connector: Arc<dyn InstrumentConnector>,
        store: Arc<dyn MeasurementStore>,
        display: Arc<dyn DisplaySink>,
    ) -> CalResult<Self> {
        let board = config.instruments.board;
        let meter = GpibAddress::new(board, config.instruments.meter_address)?;
        let source = GpibAddress::new(board, config.instruments.source_address)?;
        let mode = Mode::Dcv;
        let (status, _) = watch::channel(ControllerStatus {
            phase: Phase::Idle,
            mode,
            session_id: None,
            last_error: None,
            simulated: false,
        });

        Ok(Self {
            runner: PassRunner {
                config: Arc::new(config),
                connector,
                sink: Arc::new(CalibrationSink::new(store, display.clone())),
                display,
                profile: SharedProfile::for_mode(mode),
                flag: RunFlag::new(),
                prompt: LeadChangePrompt::new(),
                meter,
                source,
                simulation_latched: Arc::new(AtomicBool::new(false)),
                seed: None,
                status: Arc::new(status),
                paused: Arc::new(Mutex::new(None)),
            },
        })
    }

    /// Override the instrument addresses from the configuration.
    pub fn with_addresses(mut self, meter: GpibAddress, source: GpibAddress) -> CalResult<Self> {
        if meter == source {
            return Err(CalError::InvalidAddress(format!(
                "meter and source share {meter}"
            )));
        }
        self.runner.meter = meter;
        self.runner.source = source;
        Ok(self)
    }

    /// Skip the probe and run every pass simulated.
    pub fn with_simulation_latched(self) -> Self {
        self.runner.simulation_latched.store(true, Ordering::SeqCst);
        self.runner.publish(|s| s.simulated = true);
        self
    }

    /// Seed the simulated data generator.
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.runner.seed = Some(seed);
        self
    }

    /// Multimeter and calibrator addresses.
    pub fn addresses(&self) -> (GpibAddress, GpibAddress) {
        (self.runner.meter, self.runner.source)
    }

    /// Active profile and result slots.
    pub fn profile(&self) -> &SharedProfile {
        &self.runner.profile
    }

    /// Sink the passes write to.
    pub fn sink(&self) -> &Arc<CalibrationSink> {
        &self.runner.sink
    }

    /// Switch to `mode`, resetting every slot, the displayed board and the
    /// lead-change prompt.
    ///
    /// A paused resistance pass is abandoned.
    pub async fn select_mode(&self, mode: Mode) {
        self.runner.profile.select(mode).await;
        self.reset_display().await;
        self.runner.prompt.reset();
        *self.runner.paused.lock().unwrap_or_else(|p| p.into_inner()) = None;
        self.runner.publish(|s| {
            s.mode = mode;
            if s.phase == Phase::Paused {
                s.phase = Phase::Idle;
            }
        });
        tracing::info!(%mode, "mode selected");
    }

    /// Reset the slots and the displayed board of the current profile.
    ///
    /// Stored rows are kept.
    pub async fn clear(&self) {
        self.runner.profile.clear().await;
        self.reset_display().await;
        tracing::debug!("result slots cleared");
    }

    async fn reset_display(&self) {
        let profile = self.runner.profile.snapshot().await.profile;
        self.runner.sink.reset_display(&profile);
    }

    /// Start a pass over the selected profile in a new session.
    ///
    /// Refused while a pass is running. A session creation failure clears the
    /// flag and is returned.
    pub async fn start(&self) -> CalResult<StartOutcome> {
        let runner = &self.runner;
        if !runner.flag.try_start() {
            tracing::debug!("start ignored, pass already running");
            return Ok(StartOutcome::AlreadyRunning);
        }
        let guard = runner.flag.guard();

        let profile = runner.profile.snapshot().await.profile;
        let mode = profile.mode;
        let session_id = match runner.sink.start_session_for(&profile) {
            Ok(id) => id,
            Err(error) => {
                let message = error.to_string();
                runner.publish(|s| s.last_error = Some(message));
                return Err(error);
            }
        };
        *runner.paused.lock().unwrap_or_else(|p| p.into_inner()) = None;
        runner.publish(|s| {
            s.session_id = Some(session_id);
            s.last_error = None;
        });
        runner.sink.log(&format!("Calibration session {session_id} started ({mode})"));

        let handle = tokio::spawn(runner.clone().drive(guard, session_id, false));
        Ok(StartOutcome::Started(handle))
    }

    /// Continue a paused resistance pass from index 0 in the same session.
    pub async fn resume(&self) -> CalResult<StartOutcome> {
        let runner = &self.runner;
        let session_id = {
            let mut paused = runner.paused.lock().unwrap_or_else(|p| p.into_inner());
            match *paused {
                Some(id) if runner.flag.try_start() => {
                    *paused = None;
                    id
                }
                Some(_) => return Ok(StartOutcome::AlreadyRunning),
                None => return Ok(StartOutcome::NotPaused),
            }
        };
        let guard = runner.flag.guard();
        runner.sink.log("Resuming calibration");

        let handle = tokio::spawn(runner.clone().drive(guard, session_id, true));
        Ok(StartOutcome::Started(handle))
    }

    /// Ask the running pass to end at its next check point.
    pub fn stop(&self) {
        if self.runner.flag.is_running() {
            tracing::info!("stop requested");
        }
        self.runner.flag.stop();
    }

    /// Whether a pass is running.
    pub fn is_running(&self) -> bool {
        self.runner.flag.is_running()
    }

    /// Whether a paused pass is waiting for [`resume`](Self::resume).
    pub fn is_paused(&self) -> bool {
        self.runner
            .paused
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .is_some()
    }

    /// Receive every status change.
    pub fn subscribe(&self) -> watch::Receiver<ControllerStatus> {
        self.runner.status.subscribe()
    }

    /// Latest status.
    pub fn status(&self) -> ControllerStatus {
        self.runner.status.borrow().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::CsvStore;
    use crate::instrument::{MockConnector, MockInstrument, UnavailableConnector};
    use crate::sink::DisplayModel;
    use tracing_test::traced_test;

    fn config() -> CalibratorConfig {
        let mut config = CalibratorConfig::default();
        config.sequencing.simulated_point_delay_ms = 0;
        config.sequencing.settle_poll_interval_ms = 1;
        config
    }

    fn controller(
        config: CalibratorConfig,
        connector: Arc<dyn InstrumentConnector>,
    ) -> (tempfile::TempDir, Arc<CsvStore>, CalibrationController) {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(CsvStore::open(dir.path()).unwrap());
        let display = Arc::new(DisplayModel::new());
        let controller = CalibrationController::new(config, connector, store.clone(), display)
            .unwrap()
            .with_seed(3);
        (dir, store, controller)
    }

    fn unreachable(
        config: CalibratorConfig,
    ) -> (tempfile::TempDir, Arc<CsvStore>, CalibrationController) {
        controller(config, Arc::new(UnavailableConnector::default()))
    }

    async fn finish(outcome: StartOutcome) -> CalResult<RunReport> {
        outcome.into_handle().expect("pass spawned").await.unwrap()
    }

    #[tokio::test]
    #[traced_test]
    async fn unreachable_instruments_fall_back_and_latch() {
        let (_dir, store, controller) = unreachable(config());
        let report = finish(controller.start().await.unwrap()).await.unwrap();

        assert!(report.fell_back);
        assert_eq!(report.sequencer, SequencerKind::Simulated);
        assert_eq!(store.measurements(report.session_id).unwrap().len(), 11);

        let status = controller.status();
        assert_eq!(status.phase, Phase::Idle);
        assert!(status.simulated);
        assert!(status.last_error.is_some());
        assert!(!controller.is_running());
        assert!(logs_contain("switching to simulated data"));

        let second = finish(controller.start().await.unwrap()).await.unwrap();
        assert!(!second.fell_back, "latched path skips the probe");
        assert_eq!(second.sequencer, SequencerKind::Simulated);
    }

    #[tokio::test]
    async fn hardware_required_propagates_probe_failure() {
        let mut config = config();
        config.sequencing.hardware_required = true;
        let (_dir, store, controller) = unreachable(config);

        let err = finish(controller.start().await.unwrap()).await.unwrap_err();
        assert!(matches!(err, CalError::InstrumentUnreachable { .. }));
        let session = controller.status().session_id.unwrap();
        assert!(store.measurements(session).unwrap().is_empty());
        assert!(!controller.is_running());
    }

    #[tokio::test]
    async fn hardware_pass_runs_against_identified_instruments() {
        let config = config();
        let meter = MockInstrument::multimeter(GpibAddress::new(0, 22).unwrap(), "1.0");
        let source = MockInstrument::calibrator(GpibAddress::new(0, 4).unwrap());
        let connector = MockConnector::new()
            .with_instrument(meter.clone())
            .with_instrument(source.clone());
        let (_dir, _store, controller) = controller(config, Arc::new(connector));
        controller.select_mode(Mode::Freq).await;

        let report = finish(controller.start().await.unwrap()).await.unwrap();
        assert_eq!(report.sequencer, SequencerKind::Hardware);
        assert_eq!(
            report.outcome,
            PassOutcome::Completed {
                points: 5,
                linearity_points: 0
            }
        );
        assert_eq!(meter.queries()[0], "*IDN?");
        assert_eq!(source.queries()[0], "*IDN?");
    }

    #[tokio::test]
    async fn resume_requires_a_pause() {
        let (_dir, _store, controller) = unreachable(config());
        assert!(matches!(controller.resume().await.unwrap(), StartOutcome::NotPaused));
    }

    #[tokio::test]
    async fn selecting_a_mode_abandons_pause() {
        let (_dir, _store, controller) = unreachable(config());
        let controller = controller.with_simulation_latched();
        controller.select_mode(Mode::Res).await;

        let report = finish(controller.start().await.unwrap()).await.unwrap();
        assert_eq!(report.outcome, PassOutcome::Paused { points: 5 });
        assert_eq!(controller.status().phase, Phase::Paused);
        assert!(controller.is_paused());

        controller.select_mode(Mode::Res).await;
        assert_eq!(controller.status().phase, Phase::Idle);
        assert!(matches!(controller.resume().await.unwrap(), StartOutcome::NotPaused));
    }

    #[tokio::test]
    async fn subscribers_see_phase_changes() {
        let (_dir, _store, controller) = unreachable(config());
        let controller = controller.with_simulation_latched();
        let mut rx = controller.subscribe();
        assert_eq!(rx.borrow().phase, Phase::Idle);

        controller.select_mode(Mode::Aci).await;
        assert!(rx.has_changed().unwrap());
        assert_eq!(rx.borrow_and_update().mode, Mode::Aci);

        finish(controller.start().await.unwrap()).await.unwrap();
        assert_eq!(rx.borrow_and_update().phase, Phase::Idle);
    }

    #[tokio::test]
    async fn duplicate_addresses_are_rejected() {
        let (_dir, _store, controller) = unreachable(config());
        let address = GpibAddress::new(0, 9).unwrap();
        assert!(controller.with_addresses(address, address).is_err());
    }
}
