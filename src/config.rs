//! Configuration System using Figment
//!
//! Configuration is layered from:
//! 1. Built-in defaults
//! 2. A TOML file (by default `config/kalibrator.toml`, optional)
//! 3. Environment variables prefixed with `KALIBRATOR_` (`__` separates sections)
//!
//! # Example
//! ```no_run
//! use kalibrator::config::CalibratorConfig;
//!
//! let config = CalibratorConfig::load()?;
//! println!("Meter at GPIB address {}", config.instruments.meter_address);
//! # Ok::<(), kalibrator::error::CalError>(())
//! ```

use crate::error::{CalError, CalResult};
use crate::logging::OutputFormat;
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default configuration file location.
pub const DEFAULT_CONFIG_PATH: &str = "config/kalibrator.toml";

/// Highest primary address on a GPIB bus.
pub const MAX_GPIB_ADDRESS: u8 = 30;

/// Top-level configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CalibratorConfig {
    /// Application settings
    #[serde(default)]
    pub application: ApplicationConfig,
    /// Instrument bus settings
    #[serde(default)]
    pub instruments: InstrumentConfig,
    /// Sequencer timing and policy
    #[serde(default)]
    pub sequencing: SequencingConfig,
    /// Result storage
    #[serde(default)]
    pub storage: StorageConfig,
}

/// Application-level configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApplicationConfig {
    /// Application name
    #[serde(default = "default_name")]
    pub name: String,
    /// Logging level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Log line shape (pretty, compact, json)
    #[serde(default)]
    pub log_format: OutputFormat,
    /// Emit span open/close events
    #[serde(default)]
    pub log_span_events: bool,
}

/// GPIB bus configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstrumentConfig {
    /// GPIB board index used to build resource strings
    #[serde(default)]
    pub board: u8,
    /// Primary address of the measuring instrument (HP side)
    #[serde(default = "default_meter_address")]
    pub meter_address: u8,
    /// Primary address of the reference source (Fluke side)
    #[serde(default = "default_source_address")]
    pub source_address: u8,
    /// Per-command transport timeout in milliseconds
    #[serde(default = "default_timeout")]
    pub timeout_ms: u64,
}

/// Sequencer configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SequencingConfig {
    /// Longest wait for the source to report settled, in milliseconds
    #[serde(default = "default_settle_timeout")]
    pub settle_timeout_ms: u64,
    /// Interval between status register polls, in milliseconds
    #[serde(default = "default_poll_interval")]
    pub settle_poll_interval_ms: u64,
    /// Pause between simulated points, in milliseconds
    #[serde(default = "default_simulated_delay")]
    pub simulated_point_delay_ms: u64,
    /// Propagate instrument failures instead of falling back to simulation
    #[serde(default)]
    pub hardware_required: bool,
}

/// Storage configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Directory holding the session, measurement and linearity tables
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
}

fn default_name() -> String {
    "kalibrator".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_meter_address() -> u8 {
    22
}

fn default_source_address() -> u8 {
    4
}

fn default_timeout() -> u64 {
    5000
}

fn default_settle_timeout() -> u64 {
    10_000
}

fn default_poll_interval() -> u64 {
    100
}

fn default_simulated_delay() -> u64 {
    100
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("data")
}

impl Default for ApplicationConfig {
    fn default() -> Self {
        Self {
            name: default_name(),
            log_level: default_log_level(),
            log_format: OutputFormat::default(),
            log_span_events: false,
        }
    }
}

impl Default for InstrumentConfig {
    fn default() -> Self {
        Self {
            board: 0,
            meter_address: default_meter_address(),
            source_address: default_source_address(),
            timeout_ms: default_timeout(),
        }
    }
}

impl Default for SequencingConfig {
    fn default() -> Self {
        Self {
            settle_timeout_ms: default_settle_timeout(),
            settle_poll_interval_ms: default_poll_interval(),
            simulated_point_delay_ms: default_simulated_delay(),
            hardware_required: false,
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
        }
    }
}

impl InstrumentConfig {
    /// Transport timeout as a `Duration`.
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

impl SequencingConfig {
    /// Settle timeout as a `Duration`.
    pub fn settle_timeout(&self) -> Duration {
        Duration::from_millis(self.settle_timeout_ms)
    }

    /// Poll interval as a `Duration`.
    pub fn settle_poll_interval(&self) -> Duration {
        Duration::from_millis(self.settle_poll_interval_ms)
    }

    /// Simulated inter-point delay as a `Duration`.
    pub fn simulated_point_delay(&self) -> Duration {
        Duration::from_millis(self.simulated_point_delay_ms)
    }
}

impl CalibratorConfig {
    /// Load configuration from the default file and environment variables.
    ///
    /// Environment variables override the file with prefix `KALIBRATOR_`.
    /// Example: `KALIBRATOR_INSTRUMENTS__METER_ADDRESS=9`
    pub fn load() -> CalResult<Self> {
        Self::load_from(DEFAULT_CONFIG_PATH)
    }

    /// Load configuration from a specific file path. A missing file is not an
    /// error; the defaults apply.
    pub fn load_from<P: AsRef<Path>>(path: P) -> CalResult<Self> {
        let config: Self = Self::figment(path.as_ref()).extract()?;
        config.validate()?;
        Ok(config)
    }

    fn figment(path: &Path) -> Figment {
        Figment::from(Serialized::defaults(CalibratorConfig::default()))
            .merge(Toml::file(path))
            .merge(Env::prefixed("KALIBRATOR_").split("__"))
    }

    /// Validate configuration after loading
    pub fn validate(&self) -> CalResult<()> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.application.log_level.to_lowercase().as_str()) {
            return Err(CalError::Configuration(format!(
                "Invalid log_level '{}'. Must be one of: {}",
                self.application.log_level,
                valid_levels.join(", ")
            )));
        }

        for (role, address) in [
            ("meter_address", self.instruments.meter_address),
            ("source_address", self.instruments.source_address),
        ] {
            if address > MAX_GPIB_ADDRESS {
                return Err(CalError::Configuration(format!(
                    "{role} {address} is outside the GPIB range 0-{MAX_GPIB_ADDRESS}"
                )));
            }
        }

        if self.instruments.meter_address == self.instruments.source_address {
            return Err(CalError::Configuration(format!(
                "meter and source share GPIB address {}",
                self.instruments.meter_address
            )));
        }

        if self.instruments.timeout_ms == 0 {
            return Err(CalError::Configuration(
                "instruments.timeout_ms must be positive".to_string(),
            ));
        }

        if self.sequencing.settle_poll_interval_ms == 0 {
            return Err(CalError::Configuration(
                "sequencing.settle_poll_interval_ms must be positive".to_string(),
            ));
        }

        Ok(())
    }

    /// Render the effective configuration as TOML.
    pub fn to_toml(&self) -> CalResult<String> {
        toml::to_string_pretty(self).map_err(|e| CalError::Configuration(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn defaults_match_bench_wiring() {
        let config = CalibratorConfig::default();
        assert_eq!(config.instruments.meter_address, 22);
        assert_eq!(config.instruments.source_address, 4);
        assert_eq!(config.instruments.timeout(), Duration::from_secs(5));
        assert!(!config.sequencing.hardware_required);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn missing_file_falls_back_to_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = CalibratorConfig::load_from(dir.path().join("absent.toml")).unwrap();
        assert_eq!(config, CalibratorConfig::default());
    }

    #[test]
    fn file_overrides_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("kalibrator.toml");
        let mut file = std::fs::File::create(&path).unwrap();
        writeln!(
            file,
            "[instruments]\nmeter_address = 9\n\n[sequencing]\nhardware_required = true"
        )
        .unwrap();

        let config = CalibratorConfig::load_from(&path).unwrap();
        assert_eq!(config.instruments.meter_address, 9);
        assert_eq!(config.instruments.source_address, 4);
        assert!(config.sequencing.hardware_required);
    }

    #[test]
    fn file_selects_log_format() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("kalibrator.toml");
        std::fs::write(&path, "[application]\nlog_format = \"json\"\n").unwrap();

        let config = CalibratorConfig::load_from(&path).unwrap();
        assert_eq!(config.application.log_format, OutputFormat::Json);
        assert!(!config.application.log_span_events);
        assert_eq!(config.application.log_level, "info");
    }

    #[test]
    fn invalid_log_level_rejected() {
        let mut config = CalibratorConfig::default();
        config.application.log_level = "chatty".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn out_of_range_address_rejected() {
        let mut config = CalibratorConfig::default();
        config.instruments.source_address = 31;
        assert!(config.validate().is_err());
    }

    #[test]
    fn shared_address_rejected() {
        let mut config = CalibratorConfig::default();
        config.instruments.source_address = 22;
        assert!(config.validate().is_err());
    }

    #[test]
    fn toml_rendering_round_trips_through_loader() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rendered.toml");
        let mut config = CalibratorConfig::default();
        config.sequencing.settle_timeout_ms = 2500;
        std::fs::write(&path, config.to_toml().unwrap()).unwrap();

        let loaded = CalibratorConfig::load_from(&path).unwrap();
        assert_eq!(loaded.sequencing.settle_timeout(), Duration::from_millis(2500));
    }
}
