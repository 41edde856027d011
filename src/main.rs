//! CLI Entry Point for kalibrator
//!
//! Provides a command-line interface for:
//! - Running one calibration pass in a given mode
//! - Browsing stored sessions
//! - Printing the effective configuration
//!
//! # Usage
//!
//! ```bash
//! kalibrator run --mode DCV
//! kalibrator run --mode RES --simulate
//! kalibrator sessions
//! kalibrator show 3 --json
//! ```

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use kalibrator::calibration::PassOutcome;
use kalibrator::config::{CalibratorConfig, DEFAULT_CONFIG_PATH};
use kalibrator::data::{CsvStore, MeasurementStore, SessionId};
use kalibrator::error::CalResult;
use kalibrator::instrument::{
    prompt_address, GpibAddress, InstrumentConnector, UnavailableConnector,
};
use kalibrator::logging::{self, LoggingConfig, OutputFormat};
use kalibrator::profile::Mode;
use kalibrator::sink::DisplayModel;
use kalibrator::{CalibrationController, RunReport};
use std::io::{self, BufRead, IsTerminal, Write};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::task::JoinHandle;

#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

#[derive(Parser)]
#[command(name = "kalibrator")]
#[command(about = "Multimeter calibration against a reference calibrator", long_about = None)]
struct Cli {
    /// Configuration file
    #[arg(long, global = true, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// Log line shape, overriding `application.log_format`
    #[arg(long, global = true, value_enum)]
    log_format: Option<OutputFormat>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run one calibration pass
    Run(RunArgs),

    /// List stored sessions, newest first
    Sessions,

    /// Print the rows of one session
    Show {
        /// Session id
        id: SessionId,

        /// Print JSON instead of a table
        #[arg(long)]
        json: bool,
    },

    /// Print the effective configuration as TOML
    Config,
}

#[derive(Args)]
struct RunArgs {
    /// Measurement mode (DCV, ACV, DCI, ACI, RES, FREQ)
    #[arg(long)]
    mode: Mode,

    /// Multimeter address, bare (`22`) or as a resource string
    #[arg(long)]
    meter_address: Option<String>,

    /// Calibrator address, bare (`4`) or as a resource string
    #[arg(long)]
    source_address: Option<String>,

    /// Generate simulated data without probing instruments
    #[arg(long)]
    simulate: bool,

    /// Fail instead of falling back to simulated data
    #[arg(long)]
    hardware_required: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = CalibratorConfig::load_from(&cli.config)
        .with_context(|| format!("loading configuration from {}", cli.config.display()))?;
    let mut logging_config = LoggingConfig::from_config(&config)?;
    if let Some(format) = cli.log_format {
        logging_config = logging_config.with_format(format);
    }
    logging::init(logging_config.with_ansi(io::stdout().is_terminal()))?;

    match cli.command {
        Commands::Run(args) => run(config, args).await,
        Commands::Sessions => list_sessions(&config),
        Commands::Show { id, json } => show_session(&config, id, json),
        Commands::Config => {
            print!("{}", config.to_toml()?);
            Ok(())
        }
    }
}

fn open_store(config: &CalibratorConfig) -> Result<Arc<CsvStore>> {
    let dir = &config.storage.data_dir;
    let store = CsvStore::open(dir)
        .with_context(|| format!("opening data directory {}", dir.display()))?;
    Ok(Arc::new(store))
}

#[cfg(feature = "instrument_visa")]
fn connector() -> Arc<dyn InstrumentConnector> {
    match kalibrator::instrument::VisaConnector::new() {
        Ok(connector) => Arc::new(connector),
        Err(e) => {
            tracing::warn!(error = %e, "VISA unavailable, instruments will be unreachable");
            Arc::new(UnavailableConnector::new(e.to_string()))
        }
    }
}

#[cfg(not(feature = "instrument_visa"))]
fn connector() -> Arc<dyn InstrumentConnector> {
    Arc::new(UnavailableConnector::default())
}

fn resolve_address(
    given: Option<&str>,
    label: &str,
    board: u8,
    default: u8,
    ask: bool,
) -> CalResult<GpibAddress> {
    let default = GpibAddress::new(board, default)?;
    match given {
        Some(text) => GpibAddress::parse_on_board(text, board),
        None if ask => {
            let stdin = io::stdin();
            prompt_address(&mut stdin.lock(), &mut io::stdout(), label, default)
        }
        None => Ok(default),
    }
}

async fn run(mut config: CalibratorConfig, args: RunArgs) -> Result<()> {
    if args.hardware_required {
        config.sequencing.hardware_required = true;
    }
    let instruments = config.instruments.clone();
    let ask = !args.simulate;
    let meter = resolve_address(
        args.meter_address.as_deref(),
        "Multimeter",
        instruments.board,
        instruments.meter_address,
        ask,
    )?;
    let source = resolve_address(
        args.source_address.as_deref(),
        "Calibrator",
        instruments.board,
        instruments.source_address,
        ask,
    )?;

    let store = open_store(&config)?;
    let display = Arc::new(DisplayModel::new().with_echo(true));
    let mut controller = CalibrationController::new(config, connector(), store.clone(), display)?
        .with_addresses(meter, source)?;
    if args.simulate {
        controller = controller.with_simulation_latched();
    }
    controller.select_mode(args.mode).await;

    let mut request = controller.start().await?;
    loop {
        let Some(handle) = request.into_handle() else {
            bail!("a calibration pass is already running");
        };
        let report = wait_for_pass(&controller, handle).await?;

        if let PassOutcome::Paused { .. } = report.outcome {
            wait_for_enter("Change the test leads for 2-wire resistance, then press Enter")?;
            request = controller.resume().await?;
            continue;
        }

        print_summary(store.as_ref(), &report)?;
        return Ok(());
    }
}

async fn wait_for_pass(
    controller: &CalibrationController,
    mut handle: JoinHandle<CalResult<RunReport>>,
) -> Result<RunReport> {
    let joined = tokio::select! {
        joined = &mut handle => joined,
        _ = tokio::signal::ctrl_c() => {
            eprintln!("Stop requested, finishing the current step...");
            controller.stop();
            handle.await
        }
    };
    Ok(joined.context("calibration task failed")??)
}

fn wait_for_enter(message: &str) -> Result<()> {
    print!("{message}: ");
    io::stdout().flush()?;
    let mut line = String::new();
    if io::stdin().lock().read_line(&mut line)? == 0 {
        bail!("input closed while waiting for the lead change");
    }
    Ok(())
}

fn print_summary(store: &dyn MeasurementStore, report: &RunReport) -> Result<()> {
    println!();
    println!(
        "Session {} finished ({} data{})",
        report.session_id,
        report.sequencer,
        if report.fell_back { ", after instrument failure" } else { "" }
    );
    match report.outcome {
        PassOutcome::Completed {
            points,
            linearity_points,
        } => println!("  {points} points, {linearity_points} linearity points"),
        PassOutcome::Interrupted { points } => println!("  interrupted after {points} points"),
        PassOutcome::Paused { points } => println!("  paused after {points} points"),
    }
    print_rows(store, report.session_id)
}

fn print_rows(store: &dyn MeasurementStore, session: SessionId) -> Result<()> {
    let rows = store.measurements(session)?;
    if !rows.is_empty() {
        println!(
            "{:>5} {:>12} {:>14} {:>12} {:>10} {:>6}",
            "index", "reference", "measured", "difference", "std dev", "unit"
        );
    }
    for row in &rows {
        println!(
            "{:>5} {:>12} {:>14.6} {:>12.6} {:>10.6} {:>6}",
            row.point_index,
            row.set_value,
            row.measured_value,
            row.difference,
            row.std_dev,
            row.unit
        );
    }

    let linearity = store.linearity(session)?;
    if !linearity.is_empty() {
        println!("Linearity:");
        for row in &linearity {
            println!(
                "  {:>6} {} -> {:.6} (diff {:.6}, std {:.6})",
                row.linear_ref, row.unit, row.measured_value, row.difference, row.std_dev
            );
        }
    }
    Ok(())
}

fn list_sessions(config: &CalibratorConfig) -> Result<()> {
    let store = open_store(config)?;
    let sessions = store.list_sessions()?;
    if sessions.is_empty() {
        println!("No sessions in {}", store.dir().display());
    }
    for session in sessions {
        println!(
            "{:>5}  {:<4}  {}",
            session.id,
            session.mode_tag,
            session.created_at.format("%Y-%m-%d %H:%M:%S")
        );
    }
    Ok(())
}

fn show_session(config: &CalibratorConfig, id: SessionId, json: bool) -> Result<()> {
    let store = open_store(config)?;
    let Some(session) = store.list_sessions()?.into_iter().find(|s| s.id == id) else {
        bail!("no session {id} in {}", store.dir().display());
    };

    if json {
        let body = serde_json::json!({
            "session": session,
            "measurements": store.measurements(id)?,
            "linearity": store.linearity(id)?,
        });
        println!("{}", serde_json::to_string_pretty(&body)?);
        return Ok(());
    }

    println!(
        "Session {} ({}) created {}",
        session.id,
        session.mode_tag,
        session.created_at.format("%Y-%m-%d %H:%M:%S")
    );
    print_rows(store.as_ref(), id)
}
