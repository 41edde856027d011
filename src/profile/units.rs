//! Units and meter ranges carried by a set-point table.

use crate::error::CalError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Unit tag of one set-point.
///
/// Each unit carries an implicit multiplier relative to its base quantity
/// (milli = 1e-3, kilo = 1e3, mega = 1e6, base = 1).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[allow(missing_docs)]
pub enum Unit {
    Millivolt,
    Volt,
    Milliamp,
    Amp,
    Ohm,
    Kiloohm,
    Megaohm,
    Hertz,
    Kilohertz,
}

impl Unit {
    /// Multiplier from this unit to its base unit.
    pub const fn multiplier(self) -> f64 {
        match self {
            Unit::Millivolt | Unit::Milliamp => 1e-3,
            Unit::Kiloohm | Unit::Kilohertz => 1e3,
            Unit::Megaohm => 1e6,
            Unit::Volt | Unit::Amp | Unit::Ohm | Unit::Hertz => 1.0,
        }
    }

    /// Convert a value expressed in this unit to the base unit
    /// (`250 mV` becomes `0.25`, `2 kΩ` becomes `2000`).
    pub fn to_base(self, value: f64) -> f64 {
        value * self.multiplier()
    }

    /// Convert a base-unit instrument reading into this unit
    /// (a reading of `0.0999` for a `mV` point becomes `99.9`).
    pub fn from_base(self, value: f64) -> f64 {
        value / self.multiplier()
    }

    /// Display label, e.g. `mV` or `kΩ`.
    pub const fn label(self) -> &'static str {
        match self {
            Unit::Millivolt => "mV",
            Unit::Volt => "V",
            Unit::Milliamp => "mA",
            Unit::Amp => "A",
            Unit::Ohm => "Ω",
            Unit::Kiloohm => "kΩ",
            Unit::Megaohm => "MΩ",
            Unit::Hertz => "Hz",
            Unit::Kilohertz => "kHz",
        }
    }

    /// SI prefix of the label (empty for base units).
    pub const fn prefix(self) -> &'static str {
        match self {
            Unit::Millivolt | Unit::Milliamp => "m",
            Unit::Kiloohm | Unit::Kilohertz => "k",
            Unit::Megaohm => "M",
            Unit::Volt | Unit::Amp | Unit::Ohm | Unit::Hertz => "",
        }
    }

    /// Token the calibrator expects after an `OUT` value.
    pub const fn source_token(self) -> &'static str {
        match self {
            Unit::Millivolt => "MV",
            Unit::Volt => "V",
            Unit::Milliamp => "MA",
            Unit::Amp => "A",
            Unit::Ohm => "OHM",
            Unit::Kiloohm => "KOHM",
            Unit::Megaohm => "MOHM",
            Unit::Hertz => "HZ",
            Unit::Kilohertz => "KHZ",
        }
    }

    /// Whether the unit is a frequency.
    pub const fn is_frequency(self) -> bool {
        matches!(self, Unit::Hertz | Unit::Kilohertz)
    }
}

impl fmt::Display for Unit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

impl FromStr for Unit {
    type Err = CalError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let unit = match s.trim() {
            "mV" => Unit::Millivolt,
            "V" => Unit::Volt,
            "mA" => Unit::Milliamp,
            "A" => Unit::Amp,
            "Ω" | "Ohm" | "ohm" => Unit::Ohm,
            "kΩ" | "kOhm" | "kohm" => Unit::Kiloohm,
            "MΩ" | "MOhm" | "Mohm" => Unit::Megaohm,
            "Hz" => Unit::Hertz,
            "kHz" => Unit::Kilohertz,
            other => return Err(CalError::Profile(format!("unknown unit '{other}'"))),
        };
        Ok(unit)
    }
}

/// Range hint for the measuring instrument.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum MeterRange {
    /// Let the instrument pick its range
    Auto,
    /// Fixed full-scale range in base units
    Fixed(f64),
}

impl MeterRange {
    /// Full-scale range used for the linearity ladder.
    pub const LINEARITY: MeterRange = MeterRange::Fixed(10.0);
}

impl fmt::Display for MeterRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MeterRange::Auto => f.write_str("DEF"),
            MeterRange::Fixed(range) => write!(f, "{range}"),
        }
    }
}
