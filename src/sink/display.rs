//! Presentation boundary and the shared display model.
//!
//! The UI is not part of this crate. It consumes [`DisplaySink`] calls; the
//! [`DisplayModel`] implementation keeps the latest state in memory for a UI
//! (or the CLI) to poll.

use chrono::{DateTime, Local};
use serde::Serialize;
use std::collections::VecDeque;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};

/// Maximum number of terminal lines kept in memory
pub const MAX_TERMINAL_LINES: usize = 1000;

/// One cell of the value board.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DisplayValue {
    /// Value, `None` while the point has not been measured
    #[serde(rename = "Value")]
    pub value: Option<f64>,
    /// Unit label
    #[serde(rename = "Label")]
    pub label: String,
}

impl DisplayValue {
    /// Unset cell with a unit label.
    pub fn unset(label: impl Into<String>) -> Self {
        Self {
            value: None,
            label: label.into(),
        }
    }

    /// Measured cell.
    pub fn new(value: f64, label: impl Into<String>) -> Self {
        Self {
            value: Some(value),
            label: label.into(),
        }
    }
}

impl fmt::Display for DisplayValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.value {
            Some(value) => write!(f, "{value:.4} {}", self.label),
            None => write!(f, "-- {}", self.label),
        }
    }
}

/// One point of the linearity graph.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GraphPoint {
    /// Ladder reference
    pub reference: f64,
    /// Measured value
    pub measured: f64,
    /// Unit label
    pub label: String,
}

/// A timestamped terminal line.
#[derive(Debug, Clone, Serialize)]
pub struct TerminalLine {
    /// When the line was logged
    pub timestamp: DateTime<Local>,
    /// Message text
    pub message: String,
}

impl fmt::Display for TerminalLine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.timestamp.format("%H:%M:%S"), self.message)
    }
}

/// Calls the presentation layer receives.
pub trait DisplaySink: Send + Sync {
    /// Replace the value board.
    fn update_values(
        &self,
        values: &[DisplayValue],
        differences: &[DisplayValue],
        std_devs: &[DisplayValue],
    );

    /// Replace the linearity graph.
    fn update_linearity(&self, points: &[GraphPoint]);

    /// Append a line to the scrollback terminal.
    fn log(&self, message: &str);
}

#[derive(Debug, Default)]
struct ModelState {
    terminal: VecDeque<TerminalLine>,
    values: Vec<DisplayValue>,
    differences: Vec<DisplayValue>,
    std_devs: Vec<DisplayValue>,
    linearity: Vec<GraphPoint>,
}

/// Snapshot of the value board.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ValueBoard {
    /// Measured averages
    pub values: Vec<DisplayValue>,
    /// Reference minus measured
    pub differences: Vec<DisplayValue>,
    /// Standard deviations
    pub std_devs: Vec<DisplayValue>,
}

/// In-memory display state shared with a UI.
#[derive(Debug, Clone, Default)]
pub struct DisplayModel {
    state: Arc<Mutex<ModelState>>,
    echo: bool,
}

impl DisplayModel {
    /// Empty model.
    pub fn new() -> Self {
        Self::default()
    }

    /// Also print every terminal line to stdout.
    pub fn with_echo(mut self, echo: bool) -> Self {
        self.echo = echo;
        self
    }

    fn lock(&self) -> MutexGuard<'_, ModelState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Terminal lines, oldest first.
    pub fn terminal(&self) -> Vec<TerminalLine> {
        self.lock().terminal.iter().cloned().collect()
    }

    /// Terminal messages without timestamps, oldest first.
    pub fn terminal_messages(&self) -> Vec<String> {
        self.lock()
            .terminal
            .iter()
            .map(|line| line.message.clone())
            .collect()
    }

    /// Current value board.
    pub fn board(&self) -> ValueBoard {
        let state = self.lock();
        ValueBoard {
            values: state.values.clone(),
            differences: state.differences.clone(),
            std_devs: state.std_devs.clone(),
        }
    }

    /// Current linearity graph.
    pub fn linearity(&self) -> Vec<GraphPoint> {
        self.lock().linearity.clone()
    }

    /// Drop all terminal lines.
    pub fn clear_terminal(&self) {
        self.lock().terminal.clear();
    }
}

impl DisplaySink for DisplayModel {
    fn update_values(
        &self,
        values: &[DisplayValue],
        differences: &[DisplayValue],
        std_devs: &[DisplayValue],
    ) {
        let mut state = self.lock();
        state.values = values.to_vec();
        state.differences = differences.to_vec();
        state.std_devs = std_devs.to_vec();
    }

    fn update_linearity(&self, points: &[GraphPoint]) {
        self.lock().linearity = points.to_vec();
    }

    fn log(&self, message: &str) {
        let line = TerminalLine {
            timestamp: Local::now(),
            message: message.to_string(),
        };
        if self.echo {
            println!("{line}");
        }

        let mut state = self.lock();
        if state.terminal.len() >= MAX_TERMINAL_LINES {
            state.terminal.pop_front();
        }
        state.terminal.push_back(line);
    }
}
