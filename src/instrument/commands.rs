//! Command vocabulary for the multimeter and the calibrator.
//!
//! Only the handful of strings the calibration pass needs live here;
//! everything is assembled from profile tokens.

use crate::error::{CalError, CalResult};
use crate::profile::{MeterRange, Unit};

/// Identification query understood by both instruments.
pub const IDENTIFY: &str = "*IDN?";
/// Enable the calibrator output.
pub const OPERATE: &str = "OPER";
/// Disable the calibrator output.
pub const STANDBY: &str = "STBY";
/// Calibrator instrument status register.
pub const STATUS_REGISTER: &str = "ISR?";
/// Calibrator error queue.
pub const ERROR_QUERY: &str = "ERR?";
/// Status register bit set once the output has settled.
pub const SETTLED_BIT: u32 = 12;

/// Meter measurement function, e.g. `VOLTage` + `:DC`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MeterFunction {
    /// Function token
    pub command_type: String,
    /// AC/DC sub-mode token, possibly empty
    pub direction_type: String,
}

impl MeterFunction {
    /// Function from its two tokens.
    pub fn new(command_type: impl Into<String>, direction_type: impl Into<String>) -> Self {
        Self {
            command_type: command_type.into(),
            direction_type: direction_type.into(),
        }
    }

    /// `CONFigure:<type><dir> <range>`
    pub fn configure(&self, range: MeterRange) -> String {
        format!(
            "CONFigure:{}{} {}",
            self.command_type, self.direction_type, range
        )
    }

    /// `MEASure:<type><dir>? <range>`
    pub fn measure(&self, range: MeterRange) -> String {
        format!(
            "MEASure:{}{}? {}",
            self.command_type, self.direction_type, range
        )
    }
}

/// `OUT <value> <unit>`; frequency set-points ride on a 1 V amplitude.
pub fn output(value: f64, unit: Unit) -> String {
    if unit.is_frequency() {
        format!("OUT 1 V, {value} {}", unit.source_token())
    } else {
        format!("OUT {value} {}", unit.source_token())
    }
}

/// `OUT <hz> HZ`, the test frequency of an AC set-point.
pub fn output_frequency(hz: f64) -> String {
    format!("OUT {hz} HZ")
}

/// Parse a numeric meter reading.
pub fn parse_reading(address: &str, command: &str, reply: &str) -> CalResult<f64> {
    let trimmed = reply.trim();
    trimmed
        .parse::<f64>()
        .ok()
        .filter(|value| value.is_finite())
        .ok_or_else(|| {
            CalError::protocol(address, command, format!("unparsable reading '{trimmed}'"))
        })
}

/// Parse the decimal contents of the status register.
pub fn parse_status_register(address: &str, reply: &str) -> CalResult<u32> {
    let trimmed = reply.trim().trim_start_matches('+');
    trimmed
        .parse::<u32>()
        .or_else(|_| {
            trimmed
                .parse::<f64>()
                .ok()
                .filter(|value| value.is_finite() && *value >= 0.0 && value.fract() == 0.0)
                .map(|value| value as u32)
                .ok_or(())
        })
        .map_err(|()| {
            CalError::protocol(
                address,
                STATUS_REGISTER,
                format!("unparsable status register '{trimmed}'"),
            )
        })
}

/// Whether `bit` is set in a status register value.
///
/// Bits past the register width read as clear.
pub fn status_bit_set(register: u32, bit: u32) -> bool {
    1u32.checked_shl(bit).is_some_and(|mask| register & mask != 0)
}

/// Check an error-queue reply such as `0,"No Error"`.
///
/// A non-zero leading code is reported as a protocol error carrying the
/// instrument's message.
pub fn check_error_queue(address: &str, reply: &str) -> CalResult<()> {
    let trimmed = reply.trim();
    let code_part = trimmed.split(',').next().unwrap_or_default().trim();
    let code = code_part.trim_start_matches('+').parse::<i32>().map_err(|_| {
        CalError::protocol(
            address,
            ERROR_QUERY,
            format!("unparsable error queue '{trimmed}'"),
        )
    })?;
    if code == 0 {
        Ok(())
    } else {
        Err(CalError::protocol(
            address,
            ERROR_QUERY,
            format!("instrument error {trimmed}"),
        ))
    }
}
