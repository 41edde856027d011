//! Integration tests for a single hardware pass against mock instruments
//!
//! These tests drive `HardwareSequencer` directly, without the controller,
//! and check what reaches the store and the instruments.

use kalibrator::calibration::{
    HardwareSequencer, PassContext, PassOutcome, RunFlag, Sequencer, SettlingWaiter,
};
use kalibrator::data::{CsvStore, MeasurementStore};
use kalibrator::instrument::{GpibAddress, MockCall, MockInstrument};
use kalibrator::profile::{Mode, SharedProfile};
use kalibrator::sink::{CalibrationSink, DisplayModel, ResultSink};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

struct Bench {
    _dir: tempfile::TempDir,
    store: Arc<CsvStore>,
    display: Arc<DisplayModel>,
    ctx: PassContext,
    session: u64,
}

fn bench(mode: Mode) -> Bench {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(CsvStore::open(dir.path()).unwrap());
    let display = Arc::new(DisplayModel::new());
    let sink = Arc::new(CalibrationSink::new(store.clone(), display.clone()));
    let session = sink.start_session(mode).unwrap();
    let flag = RunFlag::new();
    assert!(flag.try_start());
    Bench {
        _dir: dir,
        store,
        display,
        ctx: PassContext {
            profile: SharedProfile::for_mode(mode),
            flag,
            sink,
        },
        session,
    }
}

fn meter_address() -> GpibAddress {
    GpibAddress::new(0, 22).unwrap()
}

fn source_address() -> GpibAddress {
    GpibAddress::new(0, 4).unwrap()
}

fn sequencer(meter: &MockInstrument, source: &MockInstrument) -> HardwareSequencer {
    HardwareSequencer::new(
        Box::new(meter.clone()),
        Box::new(source.clone()),
        SettlingWaiter::new(Duration::from_millis(1), Duration::from_secs(1)),
    )
}

// =============================================================================
// Normalization and persistence
// =============================================================================

#[tokio::test]
async fn test_dcv_pass_normalizes_millivolt_points() {
    let bench = bench(Mode::Dcv);
    let meter = MockInstrument::multimeter(meter_address(), "0.0999");
    let source = MockInstrument::calibrator(source_address());

    let outcome = sequencer(&meter, &source).run(&bench.ctx).await.unwrap();
    assert_eq!(
        outcome,
        PassOutcome::Completed {
            points: 11,
            linearity_points: 5
        }
    );

    let rows = bench.store.measurements(bench.session).unwrap();
    assert_eq!(rows.len(), 11);
    let second = &rows[1];
    assert_eq!(second.point_index, 1);
    assert_eq!(second.set_value, 100.0);
    assert!((second.measured_value - 99.9).abs() < 1e-9);
    assert!((second.difference - 0.1).abs() < 1e-9);
    assert_eq!(second.std_dev, 0.0);
    assert_eq!(second.unit, "mV");
    assert_eq!(second.frequency, None);

    // 1 V range points are not scaled
    assert!((rows[3].measured_value - 0.0999).abs() < 1e-12);
    assert_eq!(rows[3].unit, "V");

    assert_eq!(bench.store.linearity(bench.session).unwrap().len(), 5);
    assert_eq!(bench.display.linearity().len(), 5);
}

#[tokio::test]
async fn test_each_point_takes_five_readings() {
    let bench = bench(Mode::Aci);
    let meter = MockInstrument::multimeter(meter_address(), "0.01");
    let source = MockInstrument::calibrator(source_address());

    sequencer(&meter, &source).run(&bench.ctx).await.unwrap();
    let readings = meter
        .queries()
        .into_iter()
        .filter(|q| q.starts_with("MEASure:CURRent:AC?"))
        .count();
    assert_eq!(readings, 3 * 5);
}

#[tokio::test]
async fn test_ac_rows_record_cycled_frequency() {
    let bench = bench(Mode::Acv);
    let meter = MockInstrument::multimeter(meter_address(), "0.1");
    let source = MockInstrument::calibrator(source_address());

    sequencer(&meter, &source).run(&bench.ctx).await.unwrap();
    let rows = bench.store.measurements(bench.session).unwrap();
    assert_eq!(rows[0].frequency, Some(1000.0));
    assert_eq!(rows[1].frequency, Some(50_000.0));
    assert_eq!(rows[2].frequency, Some(1000.0));
    assert!(source.writes().contains(&"OUT 50000 HZ".to_string()));
}

// =============================================================================
// Command sequencing
// =============================================================================

#[tokio::test]
async fn test_resistance_switches_to_two_wire_after_three_points() {
    let bench = bench(Mode::Res);
    let meter = MockInstrument::multimeter(meter_address(), "10");
    let source = MockInstrument::calibrator(source_address());

    sequencer(&meter, &source).run(&bench.ctx).await.unwrap();
    let configures: Vec<String> = meter
        .writes()
        .into_iter()
        .filter(|w| w.starts_with("CONFigure:"))
        .collect();
    assert_eq!(configures.len(), 8);
    assert!(configures[..3]
        .iter()
        .all(|c| c.starts_with("CONFigure:FRESistance ")));
    assert!(configures[3..]
        .iter()
        .all(|c| c.starts_with("CONFigure:RESistance ")));
}

#[tokio::test]
async fn test_frequency_points_use_one_volt_amplitude() {
    let bench = bench(Mode::Freq);
    let meter = MockInstrument::multimeter(meter_address(), "10");
    let source = MockInstrument::calibrator(source_address());

    sequencer(&meter, &source).run(&bench.ctx).await.unwrap();
    assert_eq!(source.writes()[0], "OUT 1 V, 10 HZ");
    assert_eq!(meter.writes()[0], "CONFigure:FREQuency DEF");
}

// =============================================================================
// Interruption
// =============================================================================

#[tokio::test]
async fn test_stop_mid_pass_sends_nothing_further() {
    const STOP_AT_POINT: usize = 4;
    let bench = bench(Mode::Dcv);

    let flag = bench.ctx.flag.clone();
    let readings = Arc::new(AtomicUsize::new(0));
    let seen = readings.clone();
    let meter = MockInstrument::multimeter(meter_address(), "1.0").on_query(move |command| {
        if command.starts_with("MEAS") {
            let n = seen.fetch_add(1, Ordering::SeqCst);
            if n == STOP_AT_POINT * 5 {
                flag.stop();
            }
        }
    });
    let source = MockInstrument::calibrator(source_address());

    let outcome = sequencer(&meter, &source).run(&bench.ctx).await.unwrap();
    assert_eq!(
        outcome,
        PassOutcome::Interrupted {
            points: STOP_AT_POINT
        }
    );

    assert_eq!(
        bench.store.measurements(bench.session).unwrap().len(),
        STOP_AT_POINT
    );
    assert_eq!(bench.ctx.profile.results().await.filled(), STOP_AT_POINT);

    // The reading in flight when the stop arrived is the last meter call.
    assert_eq!(readings.load(Ordering::SeqCst), STOP_AT_POINT * 5 + 1);
    assert!(matches!(meter.calls().last(), Some(MockCall::Query(q)) if q.starts_with("MEAS")));
    assert_eq!(source.commands().last().map(String::as_str), Some("ISR?"));
    assert!(bench
        .display
        .terminal_messages()
        .contains(&format!("Calibration interrupted after {STOP_AT_POINT} points.")));
}

#[tokio::test]
async fn test_stop_during_linearity_ladder_keeps_main_table() {
    // Third reading of the first ladder point.
    const STOP_AT_READING: usize = 11 * 5 + 2;
    let bench = bench(Mode::Dcv);

    let flag = bench.ctx.flag.clone();
    let readings = Arc::new(AtomicUsize::new(0));
    let seen = readings.clone();
    let meter = MockInstrument::multimeter(meter_address(), "1.0").on_query(move |command| {
        if command.starts_with("MEAS") && seen.fetch_add(1, Ordering::SeqCst) == STOP_AT_READING {
            flag.stop();
        }
    });
    let source = MockInstrument::calibrator(source_address());

    let outcome = sequencer(&meter, &source).run(&bench.ctx).await.unwrap();
    assert_eq!(outcome, PassOutcome::Interrupted { points: 11 });

    assert_eq!(bench.store.measurements(bench.session).unwrap().len(), 11);
    assert!(bench.store.linearity(bench.session).unwrap().is_empty());
    assert!(bench.display.linearity().is_empty());
    assert!(bench.ctx.profile.linearity_results().await.is_unset());

    assert_eq!(readings.load(Ordering::SeqCst), STOP_AT_READING + 1);
    assert!(matches!(meter.calls().last(), Some(MockCall::Query(q)) if q.starts_with("MEAS")));
    assert_eq!(source.commands().last().map(String::as_str), Some("ISR?"));
    let messages = bench.display.terminal_messages();
    assert!(messages.contains(&"Starting linearity check".to_string()));
    assert!(messages.contains(&"Calibration interrupted after 11 points.".to_string()));
}

#[tokio::test]
async fn test_stop_before_start_produces_nothing() {
    let bench = bench(Mode::Dci);
    bench.ctx.flag.stop();
    let meter = MockInstrument::multimeter(meter_address(), "0.01");
    let source = MockInstrument::calibrator(source_address());

    let outcome = sequencer(&meter, &source).run(&bench.ctx).await.unwrap();
    assert_eq!(outcome, PassOutcome::Interrupted { points: 0 });
    assert!(meter.calls().is_empty());
    assert!(source.calls().is_empty());
}

// =============================================================================
// Failures
// =============================================================================

#[tokio::test]
async fn test_unparseable_reading_aborts_pass() {
    let bench = bench(Mode::Dcv);
    let meter = MockInstrument::multimeter(meter_address(), "OVLD");
    let source = MockInstrument::calibrator(source_address());

    let err = sequencer(&meter, &source).run(&bench.ctx).await.unwrap_err();
    assert!(err.triggers_fallback());
    assert!(bench.store.measurements(bench.session).unwrap().is_empty());
    assert_eq!(source.commands().last().map(String::as_str), Some("STBY"));
}

#[tokio::test]
async fn test_store_is_readable_while_pass_writes() {
    let bench = bench(Mode::Dcv);
    let meter =
        MockInstrument::multimeter(meter_address(), "1.0").with_latency(Duration::from_millis(1));
    let source = MockInstrument::calibrator(source_address());
    let mut seq = sequencer(&meter, &source);

    let ctx = bench.ctx.clone();
    let pass = tokio::spawn(async move { seq.run(&ctx).await });

    let mut last = 0;
    while !pass.is_finished() {
        let rows = bench.store.measurements(bench.session).unwrap();
        assert!(rows.len() >= last, "rows never disappear");
        last = rows.len();
        tokio::time::sleep(Duration::from_millis(2)).await;
    }
    pass.await.unwrap().unwrap();
    assert_eq!(bench.store.measurements(bench.session).unwrap().len(), 11);
}
