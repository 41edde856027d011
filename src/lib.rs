//! # Kalibrator Core Library
//!
//! This crate drives a multimeter calibration bench: a reference calibrator
//! (Fluke 5522A class) sources known values and a digital multimeter
//! (HP 34401A class) measures them over GPIB. By organizing the project as a
//! library, the CLI (`main.rs`) and any future frontend share the same
//! sequencing, persistence and display logic.
//!
//! ## Crate Structure
//!
//! - **`calibration`**: The hardware and simulated sequencers, the running
//!   flag, settle waiting and repeated-reading statistics.
//! - **`config`**: Layered configuration (defaults, TOML file, environment)
//!   with validation. See `config::CalibratorConfig`.
//! - **`controller`**: The `CalibrationController` state machine that turns
//!   operator intents into passes and owns the fallback policy.
//! - **`data`**: Session, measurement and linearity tables stored as CSV.
//! - **`error`**: The `CalError` enum for centralized error handling.
//! - **`instrument`**: GPIB addressing, instrument sessions (VISA, mock) and
//!   the command vocabulary of both instruments.
//! - **`logging`**: `tracing` subscriber setup.
//! - **`profile`**: Per-mode reference tables and the shared result slots.
//! - **`sink`**: Where completed points go: the store and the display model.

pub mod calibration;
pub mod config;
pub mod controller;
pub mod data;
pub mod error;
pub mod instrument;
pub mod logging;
pub mod profile;
pub mod sink;

pub use controller::{CalibrationController, ControllerStatus, Phase, RunReport, StartOutcome};
pub use error::{CalError, CalResult};
