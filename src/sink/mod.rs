//! Where completed points go: persistence plus the display.

mod display;

pub use display::{
    DisplayModel, DisplaySink, DisplayValue, GraphPoint, TerminalLine, ValueBoard,
    MAX_TERMINAL_LINES,
};

use crate::calibration::MeasurementPoint;
use crate::data::{MeasurementStore, SessionId};
use crate::error::{CalError, CalResult};
use crate::profile::{Mode, ModeProfile};
use std::sync::{Arc, Mutex, MutexGuard};

/// Consumer of sequencer output, shared by the hardware and simulated paths.
///
/// Calls are synchronous and return once the point is stored. Persistence
/// failures are returned to the caller, never retried.
pub trait ResultSink: Send + Sync {
    /// Open a new calibration session for `mode`.
    fn start_session(&self, mode: Mode) -> CalResult<SessionId>;

    /// Record one main-table point.
    fn push(&self, point: &MeasurementPoint) -> CalResult<()>;

    /// Record one linearity point.
    fn push_linearity(&self, point: &MeasurementPoint) -> CalResult<()>;

    /// Operator terminal line.
    fn log(&self, message: &str);
}

#[derive(Debug, Default)]
struct Board {
    session: Option<SessionId>,
    stored: usize,
    values: Vec<DisplayValue>,
    differences: Vec<DisplayValue>,
    std_devs: Vec<DisplayValue>,
    linearity: Vec<GraphPoint>,
}

impl Board {
    fn open(&mut self, session: SessionId, profile: &ModeProfile) {
        self.session = Some(session);
        self.stored = 0;
        self.reset_cells(profile);
    }

    fn reset_cells(&mut self, profile: &ModeProfile) {
        let labels: Vec<String> = profile
            .units
            .iter()
            .map(|unit| profile.mode.display_label(*unit))
            .collect();
        self.values = labels.iter().map(DisplayValue::unset).collect();
        self.differences = labels.iter().map(DisplayValue::unset).collect();
        self.std_devs = labels.iter().map(DisplayValue::unset).collect();
        self.linearity.clear();
    }

    fn place(&mut self, point: &MeasurementPoint) {
        let index = point.point_index;
        for column in [&mut self.values, &mut self.differences, &mut self.std_devs] {
            if column.len() <= index {
                column.resize(index + 1, DisplayValue::unset(point.unit.clone()));
            }
        }
        self.values[index] = DisplayValue::new(point.measured_average, point.unit.clone());
        self.differences[index] = DisplayValue::new(point.difference, point.unit.clone());
        self.std_devs[index] = DisplayValue::new(point.std_dev, point.unit.clone());
    }
}

/// [`ResultSink`] over a store and a display.
///
/// Each point is appended to the store first; the display only shows what
/// was persisted.
pub struct CalibrationSink {
    store: Arc<dyn MeasurementStore>,
    display: Arc<dyn DisplaySink>,
    board: Mutex<Board>,
}

impl CalibrationSink {
    /// Sink writing to `store` and `display`.
    pub fn new(store: Arc<dyn MeasurementStore>, display: Arc<dyn DisplaySink>) -> Self {
        Self {
            store,
            display,
            board: Mutex::new(Board::default()),
        }
    }

    /// Session points are currently recorded against.
    pub fn current_session(&self) -> Option<SessionId> {
        self.lock().session
    }

    /// Points and linearity points stored in the current session.
    pub fn stored_in_session(&self) -> usize {
        self.lock().stored
    }

    /// Open a new session whose board follows `profile`.
    ///
    /// The display is left untouched until the first point arrives.
    pub fn start_session_for(&self, profile: &ModeProfile) -> CalResult<SessionId> {
        let session = self.store.create_session(profile.mode)?;
        self.lock().open(session.id, profile);
        tracing::info!(session = session.id, mode = %profile.mode, "calibration session created");
        Ok(session.id)
    }

    /// Blank every cell for `profile` and push the empty board to the display.
    ///
    /// Stored rows and the current session are kept.
    pub fn reset_display(&self, profile: &ModeProfile) {
        let mut board = self.lock();
        board.reset_cells(profile);
        self.display
            .update_values(&board.values, &board.differences, &board.std_devs);
        self.display.update_linearity(&board.linearity);
    }

    /// Underlying store.
    pub fn store(&self) -> &Arc<dyn MeasurementStore> {
        &self.store
    }

    fn lock(&self) -> MutexGuard<'_, Board> {
        self.board.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn session(&self) -> CalResult<SessionId> {
        self.current_session()
            .ok_or_else(|| CalError::Persistence("no calibration session started".to_string()))
    }

    fn surface(&self, what: &str, point: &MeasurementPoint, err: CalError) -> CalError {
        tracing::error!(index = point.point_index, error = %err, "failed to store {what}");
        self.display.log(&format!(
            "Failed to store {what} {}: {err}",
            point.point_index
        ));
        err
    }
}

impl ResultSink for CalibrationSink {
    fn start_session(&self, mode: Mode) -> CalResult<SessionId> {
        self.start_session_for(&ModeProfile::for_mode(mode))
    }

    fn push(&self, point: &MeasurementPoint) -> CalResult<()> {
        let session = self.session()?;
        self.store
            .append_measurement(session, point)
            .map_err(|e| self.surface("measurement", point, e))?;

        let mut board = self.lock();
        board.stored += 1;
        board.place(point);
        self.display
            .update_values(&board.values, &board.differences, &board.std_devs);
        Ok(())
    }

    fn push_linearity(&self, point: &MeasurementPoint) -> CalResult<()> {
        let session = self.session()?;
        self.store
            .append_linearity(session, point)
            .map_err(|e| self.surface("linearity point", point, e))?;

        let mut board = self.lock();
        board.stored += 1;
        board.linearity.push(GraphPoint {
            reference: point.set_value,
            measured: point.measured_average,
            label: point.unit.clone(),
        });
        self.display.update_linearity(&board.linearity);
        Ok(())
    }

    fn log(&self, message: &str) {
        self.display.log(message);
    }
}
