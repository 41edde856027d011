//! Measurement modes and their set-point tables.
//!
//! Every mode is described by one static [`ProfileRecord`] in [`PROFILES`];
//! [`ModeProfile::for_mode`] turns a record into the owned table the
//! sequencers walk. The sequencers never branch on the mode itself, only on
//! the data the record carries (command tokens, the resistance command switch,
//! the simulated lead-change pause).

mod shared;
mod units;

pub use shared::{ProfileSnapshot, ResultSlots, SharedProfile};
pub use units::{MeterRange, Unit};

use crate::error::{CalError, CalResult};
use crate::instrument::commands::MeterFunction;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Measurement mode tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Mode {
    /// DC voltage
    Dcv,
    /// AC voltage
    Acv,
    /// DC current
    Dci,
    /// AC current
    Aci,
    /// Resistance
    Res,
    /// Frequency
    Freq,
}

impl Mode {
    /// All modes in sidebar order.
    pub const ALL: [Mode; 6] = [
        Mode::Dcv,
        Mode::Acv,
        Mode::Dci,
        Mode::Aci,
        Mode::Res,
        Mode::Freq,
    ];

    /// Persisted tag, e.g. `DCV`.
    pub const fn tag(self) -> &'static str {
        match self {
            Mode::Dcv => "DCV",
            Mode::Acv => "ACV",
            Mode::Dci => "DCI",
            Mode::Aci => "ACI",
            Mode::Res => "RES",
            Mode::Freq => "FREQ",
        }
    }

    /// Voltage modes carry the linearity ladder.
    pub const fn is_voltage(self) -> bool {
        matches!(self, Mode::Dcv | Mode::Acv)
    }

    /// Current modes.
    pub const fn is_current(self) -> bool {
        matches!(self, Mode::Dci | Mode::Aci)
    }

    /// AC modes program a test frequency for every set-point.
    pub const fn is_ac(self) -> bool {
        matches!(self, Mode::Acv | Mode::Aci)
    }

    /// Unit label shown for a point of this mode.
    ///
    /// Voltage and current modes keep the unit prefix and force the base
    /// symbol (`mV` stays `mV`, a stray `mA` in a voltage table shows `mV`);
    /// other modes show the unit unchanged.
    pub fn display_label(self, unit: Unit) -> String {
        if self.is_voltage() {
            format!("{}V", unit.prefix())
        } else if self.is_current() {
            format!("{}A", unit.prefix())
        } else {
            unit.label().to_string()
        }
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.tag())
    }
}

impl FromStr for Mode {
    type Err = CalError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "DCV" => Ok(Mode::Dcv),
            "ACV" => Ok(Mode::Acv),
            "DCI" => Ok(Mode::Dci),
            "ACI" => Ok(Mode::Aci),
            "RES" | "2Ω" | "OHM" => Ok(Mode::Res),
            "FREQ" | "FREQ." => Ok(Mode::Freq),
            _ => Err(CalError::UnknownMode(s.to_string())),
        }
    }
}

/// Mid-sequence change of the meter function.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CommandSwitch {
    /// Number of completed points measured before the switch
    pub after_points: usize,
    /// Function token used from then on
    pub command_type: &'static str,
}

/// Static description of one mode.
#[derive(Debug)]
pub struct ProfileRecord {
    /// Mode this record describes
    pub mode: Mode,
    /// Set-point values
    pub references: &'static [f64],
    /// Meter range per set-point
    pub ranges: &'static [MeterRange],
    /// Unit per set-point
    pub units: &'static [Unit],
    /// Cyclic test frequencies in Hz (AC modes)
    pub frequencies: &'static [f64],
    /// Meter function token, e.g. `VOLTage`
    pub command_type: &'static str,
    /// AC/DC sub-mode token, e.g. `:DC` (empty when the function has none)
    pub direction_type: &'static str,
    /// Resistance 4-wire to 2-wire switch
    pub command_switch: Option<CommandSwitch>,
    /// Index after which the simulated pass stops for the lead change
    pub lead_change_pause: Option<usize>,
    /// Linearity ladder values
    pub linear_references: &'static [f64],
    /// Linearity ladder units
    pub linear_units: &'static [Unit],
}

const fn fixed(range: f64) -> MeterRange {
    MeterRange::Fixed(range)
}

const LINEAR_REFERENCES: [f64; 5] = [1.0, 2.0, 3.0, 4.0, 5.0];
const LINEAR_UNITS: [Unit; 5] = [Unit::Volt; 5];

/// Lookup table of every supported mode.
pub static PROFILES: [ProfileRecord; 6] = [
    ProfileRecord {
        mode: Mode::Dcv,
        references: &[
            0.0, 100.0, -100.0, 1.0, -1.0, 10.0, -10.0, 100.0, -100.0, 1000.0, -1000.0,
        ],
        ranges: &[
            fixed(0.1),
            fixed(0.1),
            fixed(0.1),
            fixed(1.0),
            fixed(1.0),
            fixed(10.0),
            fixed(10.0),
            fixed(100.0),
            fixed(100.0),
            fixed(1000.0),
            fixed(1000.0),
        ],
        units: &[
            Unit::Millivolt,
            Unit::Millivolt,
            Unit::Millivolt,
            Unit::Volt,
            Unit::Volt,
            Unit::Volt,
            Unit::Volt,
            Unit::Volt,
            Unit::Volt,
            Unit::Volt,
            Unit::Volt,
        ],
        frequencies: &[],
        command_type: "VOLTage",
        direction_type: ":DC",
        command_switch: None,
        lead_change_pause: None,
        linear_references: &LINEAR_REFERENCES,
        linear_units: &LINEAR_UNITS,
    },
    ProfileRecord {
        mode: Mode::Acv,
        references: &[100.0, 100.0, 1.0, 1.0, 10.0, 10.0, 100.0, 100.0, 700.0, 700.0],
        ranges: &[
            fixed(0.1),
            fixed(0.1),
            fixed(1.0),
            fixed(1.0),
            fixed(10.0),
            fixed(10.0),
            fixed(100.0),
            fixed(100.0),
            fixed(750.0),
            fixed(750.0),
        ],
        units: &[
            Unit::Millivolt,
            Unit::Millivolt,
            Unit::Volt,
            Unit::Volt,
            Unit::Volt,
            Unit::Volt,
            Unit::Volt,
            Unit::Volt,
            Unit::Volt,
            Unit::Volt,
        ],
        frequencies: &[1000.0, 50_000.0],
        command_type: "VOLTage",
        direction_type: ":AC",
        command_switch: None,
        lead_change_pause: None,
        linear_references: &LINEAR_REFERENCES,
        linear_units: &LINEAR_UNITS,
    },
    ProfileRecord {
        mode: Mode::Dci,
        references: &[0.0, 10.0, -10.0, 100.0, -100.0, 1.0, -1.0],
        ranges: &[
            fixed(0.01),
            fixed(0.01),
            fixed(0.01),
            fixed(0.1),
            fixed(0.1),
            fixed(1.0),
            fixed(1.0),
        ],
        units: &[
            Unit::Milliamp,
            Unit::Milliamp,
            Unit::Milliamp,
            Unit::Milliamp,
            Unit::Milliamp,
            Unit::Amp,
            Unit::Amp,
        ],
        frequencies: &[],
        command_type: "CURRent",
        direction_type: ":DC",
        command_switch: None,
        lead_change_pause: None,
        linear_references: &[],
        linear_units: &[],
    },
    ProfileRecord {
        mode: Mode::Aci,
        references: &[10.0, 100.0, 1.0],
        ranges: &[fixed(1.0), fixed(1.0), fixed(1.0)],
        units: &[Unit::Milliamp, Unit::Milliamp, Unit::Amp],
        frequencies: &[1000.0],
        command_type: "CURRent",
        direction_type: ":AC",
        command_switch: None,
        lead_change_pause: None,
        linear_references: &[],
        linear_units: &[],
    },
    ProfileRecord {
        mode: Mode::Res,
        references: &[0.0, 10.0, 100.0, 1.0, 10.0, 100.0, 1.0, 10.0],
        ranges: &[
            fixed(100.0),
            fixed(100.0),
            fixed(100.0),
            fixed(1e3),
            fixed(1e4),
            fixed(1e5),
            fixed(1e6),
            fixed(1e7),
        ],
        units: &[
            Unit::Ohm,
            Unit::Ohm,
            Unit::Ohm,
            Unit::Kiloohm,
            Unit::Kiloohm,
            Unit::Kiloohm,
            Unit::Megaohm,
            Unit::Megaohm,
        ],
        frequencies: &[],
        command_type: "FRESistance",
        direction_type: "",
        command_switch: Some(CommandSwitch {
            after_points: 3,
            command_type: "RESistance",
        }),
        lead_change_pause: Some(4),
        linear_references: &[],
        linear_units: &[],
    },
    ProfileRecord {
        mode: Mode::Freq,
        references: &[10.0, 100.0, 1.0, 10.0, 100.0],
        ranges: &[MeterRange::Auto; 5],
        units: &[
            Unit::Hertz,
            Unit::Hertz,
            Unit::Kilohertz,
            Unit::Kilohertz,
            Unit::Kilohertz,
        ],
        frequencies: &[],
        command_type: "FREQuency",
        direction_type: "",
        command_switch: None,
        lead_change_pause: None,
        linear_references: &[],
        linear_units: &[],
    },
];

/// Owned set-point table for the selected mode.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ModeProfile {
    /// Selected mode
    pub mode: Mode,
    /// Set-point values, signed
    pub references: Vec<f64>,
    /// Meter range per set-point
    pub ranges: Vec<MeterRange>,
    /// Unit per set-point
    pub units: Vec<Unit>,
    /// Cyclic test frequencies in Hz, empty for non-AC modes
    pub frequencies: Vec<f64>,
    /// Meter function token
    pub command_type: String,
    /// AC/DC sub-mode token
    pub direction_type: String,
    /// Optional mid-sequence meter function change
    pub command_switch: Option<CommandSwitch>,
    /// Simulated lead-change pause index
    pub lead_change_pause: Option<usize>,
    /// Linearity ladder values
    pub linear_references: Vec<f64>,
    /// Linearity ladder units
    pub linear_units: Vec<Unit>,
}

impl ModeProfile {
    /// Build the profile for `mode` from the lookup table.
    pub fn for_mode(mode: Mode) -> Self {
        let record = PROFILES
            .iter()
            .find(|record| record.mode == mode)
            .unwrap_or(&PROFILES[0]);
        Self::from_record(record)
    }

    fn from_record(record: &ProfileRecord) -> Self {
        Self {
            mode: record.mode,
            references: record.references.to_vec(),
            ranges: record.ranges.to_vec(),
            units: record.units.to_vec(),
            frequencies: record.frequencies.to_vec(),
            command_type: record.command_type.to_string(),
            direction_type: record.direction_type.to_string(),
            command_switch: record.command_switch,
            lead_change_pause: record.lead_change_pause,
            linear_references: record.linear_references.to_vec(),
            linear_units: record.linear_units.to_vec(),
        }
    }

    /// Number of main set-points.
    pub fn len(&self) -> usize {
        self.references.len()
    }

    /// Whether the main table is empty.
    pub fn is_empty(&self) -> bool {
        self.references.is_empty()
    }

    /// Check that the parallel tables line up.
    pub fn validate(&self) -> CalResult<()> {
        let n = self.references.len();
        if self.ranges.len() != n || self.units.len() != n {
            return Err(CalError::Profile(format!(
                "{}: {} references, {} ranges, {} units",
                self.mode,
                n,
                self.ranges.len(),
                self.units.len()
            )));
        }
        if self.mode.is_ac() && self.frequencies.is_empty() {
            return Err(CalError::Profile(format!(
                "{}: AC mode without test frequencies",
                self.mode
            )));
        }
        if self.linear_references.len() != self.linear_units.len() {
            return Err(CalError::Profile(format!(
                "{}: {} linearity references, {} linearity units",
                self.mode,
                self.linear_references.len(),
                self.linear_units.len()
            )));
        }
        Ok(())
    }

    /// Meter function for main point `index`, honouring the command switch.
    pub fn function_for(&self, index: usize) -> MeterFunction {
        let command_type = match self.command_switch {
            Some(switch) if index >= switch.after_points => switch.command_type.to_string(),
            _ => self.command_type.clone(),
        };
        MeterFunction::new(command_type, self.direction_type.clone())
    }

    /// Meter function for the linearity ladder.
    pub fn linearity_function(&self) -> MeterFunction {
        MeterFunction::new(self.command_type.clone(), self.direction_type.clone())
    }

    /// Test frequency for main point `index` (cyclic), `None` for DC modes.
    pub fn frequency_for(&self, index: usize) -> Option<f64> {
        if self.frequencies.is_empty() {
            None
        } else {
            Some(self.frequencies[index % self.frequencies.len()])
        }
    }

    /// Test frequency used for every linearity point.
    pub fn linearity_frequency(&self) -> Option<f64> {
        self.frequencies.first().copied()
    }

    /// Whether the linearity ladder runs after the main table.
    pub fn has_linearity(&self) -> bool {
        self.command_type.starts_with("VOLT") && !self.linear_references.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_profile_is_consistent() {
        for mode in Mode::ALL {
            let profile = ModeProfile::for_mode(mode);
            assert_eq!(profile.mode, mode);
            assert!(!profile.is_empty());
            profile.validate().unwrap();
        }
    }

    #[test]
    fn dcv_table_matches_bench_sequence() {
        let profile = ModeProfile::for_mode(Mode::Dcv);
        assert_eq!(
            profile.references,
            vec![0.0, 100.0, -100.0, 1.0, -1.0, 10.0, -10.0, 100.0, -100.0, 1000.0, -1000.0]
        );
        assert_eq!(profile.units[1], Unit::Millivolt);
        assert_eq!(profile.units[3], Unit::Volt);
        assert!(profile.has_linearity());
    }

    #[test]
    fn mismatched_tables_rejected() {
        let mut profile = ModeProfile::for_mode(Mode::Dci);
        profile.ranges.pop();
        assert!(matches!(profile.validate(), Err(CalError::Profile(_))));
    }

    #[test]
    fn resistance_switches_to_two_wire_after_three_points() {
        let profile = ModeProfile::for_mode(Mode::Res);
        assert_eq!(profile.function_for(2).command_type, "FRESistance");
        assert_eq!(profile.function_for(3).command_type, "RESistance");
        assert_eq!(profile.function_for(7).command_type, "RESistance");
    }

    #[test]
    fn ac_frequencies_cycle() {
        let profile = ModeProfile::for_mode(Mode::Acv);
        assert_eq!(profile.frequency_for(0), Some(1000.0));
        assert_eq!(profile.frequency_for(1), Some(50_000.0));
        assert_eq!(profile.frequency_for(2), Some(1000.0));
        assert_eq!(ModeProfile::for_mode(Mode::Dcv).frequency_for(0), None);
    }

    #[test]
    fn only_voltage_modes_run_linearity() {
        assert!(ModeProfile::for_mode(Mode::Acv).has_linearity());
        assert!(!ModeProfile::for_mode(Mode::Dci).has_linearity());
        assert!(!ModeProfile::for_mode(Mode::Res).has_linearity());
    }

    #[test]
    fn unit_relabeling_follows_mode() {
        assert_eq!(Mode::Dcv.display_label(Unit::Millivolt), "mV");
        assert_eq!(Mode::Dci.display_label(Unit::Milliamp), "mA");
        assert_eq!(Mode::Res.display_label(Unit::Kiloohm), "kΩ");
        assert_eq!(Mode::Freq.display_label(Unit::Kilohertz), "kHz");
    }

    #[test]
    fn mode_tags_parse() {
        for mode in Mode::ALL {
            assert_eq!(mode.tag().parse::<Mode>().unwrap(), mode);
        }
        assert_eq!("dcv".parse::<Mode>().unwrap(), Mode::Dcv);
        assert!(matches!("XYZ".parse::<Mode>(), Err(CalError::UnknownMode(_))));
    }
}
