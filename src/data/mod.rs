//! Persistence of calibration sessions and their measurements.
pub mod storage;

pub use storage::{
    CsvStore, LinearityRecord, MeasurementRecord, MeasurementStore, SessionId, SessionRecord,
};
