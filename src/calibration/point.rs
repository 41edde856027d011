//! Completed measurement points and their derived difference.

use serde::Serialize;

/// One completed measurement, main table or linearity ladder.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MeasurementPoint {
    /// Index within its table
    pub point_index: usize,
    /// Reference set-point
    pub set_value: f64,
    /// Average reading, expressed in the point's unit
    pub measured_average: f64,
    /// Sample standard deviation, same unit
    pub std_dev: f64,
    /// `set_value - measured_average`
    pub difference: f64,
    /// Displayed unit label
    pub unit: String,
    /// Test frequency in Hz for AC points
    pub frequency: Option<f64>,
}

impl MeasurementPoint {
    /// Point whose difference is derived from the average.
    pub fn from_average(
        point_index: usize,
        set_value: f64,
        measured_average: f64,
        std_dev: f64,
        unit: impl Into<String>,
        frequency: Option<f64>,
    ) -> Self {
        Self {
            point_index,
            set_value,
            measured_average,
            std_dev,
            difference: set_value - measured_average,
            unit: unit.into(),
            frequency,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn difference_is_reference_minus_average() {
        let point = MeasurementPoint::from_average(1, 100.0, 99.9, 0.0, "mV", None);
        assert!((point.difference - 0.1).abs() < 1e-9);
    }
}
