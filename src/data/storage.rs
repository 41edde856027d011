//! Append-only CSV tables for sessions, measurements and linearity points.
use crate::calibration::MeasurementPoint;
use crate::error::{CalError, CalResult};
use crate::profile::Mode;
use chrono::{DateTime, Local, SubsecRound};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

/// Identifier of a calibration session.
pub type SessionId = u64;

const SESSIONS_FILE: &str = "sessions.csv";
const MEASUREMENTS_FILE: &str = "measurements.csv";
const LINEARITY_FILE: &str = "linearity.csv";

mod timestamp {
    use chrono::{DateTime, Local, NaiveDateTime, TimeZone};
    use serde::{Deserialize, Deserializer, Serializer};

    const WRITE_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.3f";
    const READ_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.f";

    pub fn serialize<S: Serializer>(ts: &DateTime<Local>, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&ts.format(WRITE_FORMAT).to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<DateTime<Local>, D::Error> {
        let raw = String::deserialize(d)?;
        let naive =
            NaiveDateTime::parse_from_str(&raw, READ_FORMAT).map_err(serde::de::Error::custom)?;
        Local
            .from_local_datetime(&naive)
            .earliest()
            .ok_or_else(|| serde::de::Error::custom(format!("nonexistent local time '{raw}'")))
    }
}

/// One row of `sessions.csv`. Immutable once written.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionRecord {
    /// Session id
    pub id: SessionId,
    /// Mode tag, e.g. `DCV`
    pub mode_tag: String,
    /// Creation time
    #[serde(with = "timestamp")]
    pub created_at: DateTime<Local>,
}

/// One row of `measurements.csv`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MeasurementRecord {
    /// Row id
    pub id: u64,
    /// Owning session
    pub session_id: SessionId,
    /// Point index within the pass
    pub point_index: usize,
    /// Reference set-point
    pub set_value: f64,
    /// Normalized measured average
    pub measured_value: f64,
    /// Reference minus measured
    pub difference: f64,
    /// Sample standard deviation
    pub std_dev: f64,
    /// Displayed unit label
    pub unit: String,
    /// Test frequency in Hz, empty for DC modes
    pub frequency: Option<f64>,
    /// When the row was written
    #[serde(with = "timestamp")]
    pub timestamp: DateTime<Local>,
}

/// One row of `linearity.csv`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LinearityRecord {
    /// Row id
    pub id: u64,
    /// Owning session
    pub session_id: SessionId,
    /// Ladder reference
    pub linear_ref: f64,
    /// Raw measured average
    pub measured_value: f64,
    /// Reference minus measured
    pub difference: f64,
    /// Sample standard deviation
    pub std_dev: f64,
    /// Unit label
    pub unit: String,
    /// When the row was written
    #[serde(with = "timestamp")]
    pub timestamp: DateTime<Local>,
}

/// Persistence consumed by the sink and by history browsing.
///
/// Implementations must tolerate appends from the pass while another
/// caller reads.
pub trait MeasurementStore: Send + Sync {
    /// Create a session row for `mode`.
    fn create_session(&self, mode: Mode) -> CalResult<SessionRecord>;

    /// Append a main-table point to `session`.
    fn append_measurement(
        &self,
        session: SessionId,
        point: &MeasurementPoint,
    ) -> CalResult<MeasurementRecord>;

    /// Append a linearity point to `session`.
    fn append_linearity(
        &self,
        session: SessionId,
        point: &MeasurementPoint,
    ) -> CalResult<LinearityRecord>;

    /// All sessions, newest first.
    fn list_sessions(&self) -> CalResult<Vec<SessionRecord>>;

    /// Main-table rows of `session` ordered by timestamp.
    fn measurements(&self, session: SessionId) -> CalResult<Vec<MeasurementRecord>>;

    /// Linearity rows of `session` ordered by timestamp.
    fn linearity(&self, session: SessionId) -> CalResult<Vec<LinearityRecord>>;
}

#[derive(Debug)]
struct NextIds {
    session: u64,
    measurement: u64,
    linearity: u64,
}

/// Appends to three CSV files in one directory.
///
/// Every call opens its own file handle; a mutex serializes all access.
#[derive(Debug)]
pub struct CsvStore {
    dir: PathBuf,
    next: Mutex<NextIds>,
}

impl CsvStore {
    /// Open (creating if needed) the tables in `dir`, recovering ids.
    pub fn open(dir: impl AsRef<Path>) -> CalResult<Self> {
        let dir = dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&dir)?;

        let sessions: Vec<SessionRecord> = read_table(&dir.join(SESSIONS_FILE))?;
        let measurements: Vec<MeasurementRecord> = read_table(&dir.join(MEASUREMENTS_FILE))?;
        let linearity: Vec<LinearityRecord> = read_table(&dir.join(LINEARITY_FILE))?;

        let next = NextIds {
            session: sessions.iter().map(|r| r.id).max().map_or(1, |id| id + 1),
            measurement: measurements.iter().map(|r| r.id).max().map_or(1, |id| id + 1),
            linearity: linearity.iter().map(|r| r.id).max().map_or(1, |id| id + 1),
        };
        tracing::info!(dir = %dir.display(), sessions = sessions.len(), "opened CSV store");

        Ok(Self {
            dir,
            next: Mutex::new(next),
        })
    }

    /// Directory holding the tables.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn lock(&self) -> CalResult<MutexGuard<'_, NextIds>> {
        self.next
            .lock()
            .map_err(|_| CalError::Persistence("store lock poisoned".to_string()))
    }

    fn path(&self, file: &str) -> PathBuf {
        self.dir.join(file)
    }
}

/// Current time at the precision the tables keep.
fn now() -> DateTime<Local> {
    Local::now().trunc_subsecs(3)
}

fn read_table<T: DeserializeOwned>(path: &Path) -> CalResult<Vec<T>> {
    if !path.exists() {
        return Ok(Vec::new());
    }
    let mut reader = csv::Reader::from_path(path)?;
    let mut rows = Vec::new();
    for row in reader.deserialize() {
        rows.push(row?);
    }
    Ok(rows)
}

fn append_row<T: Serialize>(path: &Path, row: &T) -> CalResult<()> {
    let has_header = path.metadata().map(|m| m.len() > 0).unwrap_or(false);
    let file = OpenOptions::new().create(true).append(true).open(path)?;
    let mut writer = csv::WriterBuilder::new()
        .has_headers(!has_header)
        .from_writer(file);
    writer.serialize(row)?;
    writer.flush()?;
    Ok(())
}

impl MeasurementStore for CsvStore {
    fn create_session(&self, mode: Mode) -> CalResult<SessionRecord> {
        let mut next = self.lock()?;
        let record = SessionRecord {
            id: next.session,
            mode_tag: mode.tag().to_string(),
            created_at: now(),
        };
        append_row(&self.path(SESSIONS_FILE), &record)?;
        next.session += 1;
        Ok(record)
    }

    fn append_measurement(
        &self,
        session: SessionId,
        point: &MeasurementPoint,
    ) -> CalResult<MeasurementRecord> {
        let mut next = self.lock()?;
        let record = MeasurementRecord {
            id: next.measurement,
            session_id: session,
            point_index: point.point_index,
            set_value: point.set_value,
            measured_value: point.measured_average,
            difference: point.difference,
            std_dev: point.std_dev,
            unit: point.unit.clone(),
            frequency: point.frequency,
            timestamp: now(),
        };
        append_row(&self.path(MEASUREMENTS_FILE), &record)?;
        next.measurement += 1;
        Ok(record)
    }

    fn append_linearity(
        &self,
        session: SessionId,
        point: &MeasurementPoint,
    ) -> CalResult<LinearityRecord> {
        let mut next = self.lock()?;
        let record = LinearityRecord {
            id: next.linearity,
            session_id: session,
            linear_ref: point.set_value,
            measured_value: point.measured_average,
            difference: point.difference,
            std_dev: point.std_dev,
            unit: point.unit.clone(),
            timestamp: now(),
        };
        append_row(&self.path(LINEARITY_FILE), &record)?;
        next.linearity += 1;
        Ok(record)
    }

    fn list_sessions(&self) -> CalResult<Vec<SessionRecord>> {
        let _guard = self.lock()?;
        let mut sessions: Vec<SessionRecord> = read_table(&self.path(SESSIONS_FILE))?;
        sessions.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));
        Ok(sessions)
    }

    fn measurements(&self, session: SessionId) -> CalResult<Vec<MeasurementRecord>> {
        let _guard = self.lock()?;
        let mut rows: Vec<MeasurementRecord> = read_table(&self.path(MEASUREMENTS_FILE))?;
        rows.retain(|row| row.session_id == session);
        rows.sort_by(|a, b| a.timestamp.cmp(&b.timestamp).then(a.id.cmp(&b.id)));
        Ok(rows)
    }

    fn linearity(&self, session: SessionId) -> CalResult<Vec<LinearityRecord>> {
        let _guard = self.lock()?;
        let mut rows: Vec<LinearityRecord> = read_table(&self.path(LINEARITY_FILE))?;
        rows.retain(|row| row.session_id == session);
        rows.sort_by(|a, b| a.timestamp.cmp(&b.timestamp).then(a.id.cmp(&b.id)));
        Ok(rows)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn point(index: usize, set_value: f64, frequency: Option<f64>) -> MeasurementPoint {
        MeasurementPoint::from_average(index, set_value, set_value - 0.1, 0.01, "V", frequency)
    }

    #[test]
    fn sessions_get_increasing_ids_newest_first() {
        let dir = tempfile::tempdir().unwrap();
        let store = CsvStore::open(dir.path()).unwrap();
        let first = store.create_session(Mode::Dcv).unwrap();
        let second = store.create_session(Mode::Res).unwrap();
        assert_eq!(first.id, 1);
        assert_eq!(second.id, 2);

        let listed = store.list_sessions().unwrap();
        assert_eq!(listed[0].id, 2);
        assert_eq!(listed[0].mode_tag, "RES");
        assert_eq!(listed[1].id, 1);
    }

    #[test]
    fn measurements_filtered_by_session_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let store = CsvStore::open(dir.path()).unwrap();
        let a = store.create_session(Mode::Acv).unwrap().id;
        let b = store.create_session(Mode::Dcv).unwrap().id;

        store.append_measurement(a, &point(0, 100.0, Some(1000.0))).unwrap();
        store.append_measurement(b, &point(0, 0.0, None)).unwrap();
        store.append_measurement(a, &point(1, 100.0, Some(50_000.0))).unwrap();

        let rows = store.measurements(a).unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].point_index, 0);
        assert_eq!(rows[1].frequency, Some(50_000.0));
        assert_eq!(store.measurements(b).unwrap()[0].frequency, None);
    }

    #[test]
    fn reopening_recovers_ids() {
        let dir = tempfile::tempdir().unwrap();
        {
            let store = CsvStore::open(dir.path()).unwrap();
            let session = store.create_session(Mode::Dcv).unwrap().id;
            store.append_linearity(session, &point(0, 1.0, None)).unwrap();
        }

        let store = CsvStore::open(dir.path()).unwrap();
        let session = store.create_session(Mode::Dcv).unwrap();
        assert_eq!(session.id, 2);
        let row = store.append_linearity(session.id, &point(0, 2.0, None)).unwrap();
        assert_eq!(row.id, 2);
        assert_eq!(store.linearity(1).unwrap().len(), 1);
    }

    #[test]
    fn timestamps_use_bench_format() {
        let dir = tempfile::tempdir().unwrap();
        let store = CsvStore::open(dir.path()).unwrap();
        store.create_session(Mode::Freq).unwrap();

        let raw = std::fs::read_to_string(dir.path().join(SESSIONS_FILE)).unwrap();
        let row = raw.lines().nth(1).unwrap();
        let created_at = row.rsplit(',').next().unwrap();
        assert!(
            chrono::NaiveDateTime::parse_from_str(created_at, "%Y-%m-%d %H:%M:%S%.3f").is_ok(),
            "unexpected timestamp {created_at}"
        );
        assert_eq!(created_at.len(), "2024-01-01 00:00:00.000".len());
    }
}
