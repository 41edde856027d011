//! Tracing setup for the library and the CLI.
//!
//! `application.log_level` sets the default level and `RUST_LOG` overrides
//! it. `application.log_format` picks pretty, compact or JSON lines, and the
//! CLI flag `--log-format` overrides that.
//!
//! The operator terminal log is a separate concern, see [`crate::sink::DisplaySink`].
//!
//! # Example
//! ```no_run
//! use kalibrator::{config::CalibratorConfig, logging};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let config = CalibratorConfig::load()?;
//! logging::init_from_config(&config)?;
//! tracing::info!("calibrator ready");
//! # Ok(())
//! # }
//! ```

use crate::config::CalibratorConfig;
use crate::error::{CalError, CalResult};
use serde::{Deserialize, Serialize};
use tracing::level_filters::LevelFilter;
use tracing::Level;
use tracing_subscriber::{
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter, Layer,
};

/// Shape of each log line.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum,
)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    /// Multi-line, for development
    Pretty,
    /// One line per event, for bench terminals
    #[default]
    Compact,
    /// One JSON object per event
    Json,
}

/// Subscriber settings.
#[derive(Debug, Clone)]
pub struct LoggingConfig {
    /// Default level when `RUST_LOG` is unset
    pub level: Level,
    /// Line shape
    pub format: OutputFormat,
    /// Emit span open/close events
    pub span_events: bool,
    /// Include source file and line
    pub file_and_line: bool,
    /// Colorize output
    pub ansi: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self::new(Level::INFO)
    }
}

impl LoggingConfig {
    /// Settings for `level` with compact, colored lines.
    pub fn new(level: Level) -> Self {
        Self {
            level,
            format: OutputFormat::Compact,
            span_events: false,
            file_and_line: false,
            ansi: true,
        }
    }

    /// Settings from the `[application]` section.
    pub fn from_config(config: &CalibratorConfig) -> CalResult<Self> {
        let application = &config.application;
        Ok(Self::new(parse_log_level(&application.log_level)?)
            .with_format(application.log_format)
            .with_span_events(application.log_span_events))
    }

    /// Set the line shape.
    pub fn with_format(mut self, format: OutputFormat) -> Self {
        self.format = format;
        self
    }

    /// Enable or disable span events.
    pub fn with_span_events(mut self, enabled: bool) -> Self {
        self.span_events = enabled;
        self
    }

    /// Enable or disable colors.
    pub fn with_ansi(mut self, enabled: bool) -> Self {
        self.ansi = enabled;
        self
    }

    fn span_filter(&self) -> FmtSpan {
        if self.span_events {
            FmtSpan::NEW | FmtSpan::CLOSE
        } else {
            FmtSpan::NONE
        }
    }

    fn env_filter(&self) -> EnvFilter {
        EnvFilter::builder()
            .with_default_directive(LevelFilter::from_level(self.level).into())
            .from_env_lossy()
    }
}

/// Install the global subscriber described by `config`.
///
/// Returns `Ok(())` without changes when a subscriber is already installed,
/// by a host application or an earlier call.
pub fn init(config: LoggingConfig) -> CalResult<()> {
    if tracing::dispatcher::has_been_set() {
        return Ok(());
    }

    let base = fmt::layer()
        .with_span_events(config.span_filter())
        .with_file(config.file_and_line)
        .with_line_number(config.file_and_line)
        .with_ansi(config.ansi);
    let layer = match config.format {
        OutputFormat::Pretty => base.pretty().boxed(),
        OutputFormat::Compact => base.compact().boxed(),
        OutputFormat::Json => base.json().boxed(),
    };

    tracing_subscriber::registry()
        .with(layer.with_filter(config.env_filter()))
        .try_init()
        .map_err(|e| CalError::Configuration(format!("tracing subscriber: {e}")))
}

/// Install the subscriber described by the `[application]` section.
pub fn init_from_config(config: &CalibratorConfig) -> CalResult<()> {
    init(LoggingConfig::from_config(config)?)
}

/// Parse a level name, case-insensitively.
pub fn parse_log_level(level: &str) -> CalResult<Level> {
    level.trim().parse::<Level>().map_err(|_| {
        CalError::Configuration(format!(
            "Invalid log level '{level}'. Must be one of: trace, debug, info, warn, error"
        ))
    })
}
