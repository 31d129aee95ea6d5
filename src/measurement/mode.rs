//! Multimeter measurement functions.

use crate::error::BenchError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Closed set of multimeter functions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MeasurementMode {
    #[default]
    VoltDc,
    VoltAc,
    CurrDc,
    CurrAc,
    Res,
    Fres,
    Freq,
    Per,
    Cap,
    TempRtd,
    Diod,
    Cont,
}

impl MeasurementMode {
    pub const ALL: [MeasurementMode; 12] = [
        MeasurementMode::VoltDc,
        MeasurementMode::VoltAc,
        MeasurementMode::CurrDc,
        MeasurementMode::CurrAc,
        MeasurementMode::Res,
        MeasurementMode::Fres,
        MeasurementMode::Freq,
        MeasurementMode::Per,
        MeasurementMode::Cap,
        MeasurementMode::TempRtd,
        MeasurementMode::Diod,
        MeasurementMode::Cont,
    ];

    /// Stable identifier, as written to data logs.
    pub fn id(self) -> &'static str {
        match self {
            MeasurementMode::VoltDc => "volt_dc",
            MeasurementMode::VoltAc => "volt_ac",
            MeasurementMode::CurrDc => "curr_dc",
            MeasurementMode::CurrAc => "curr_ac",
            MeasurementMode::Res => "res",
            MeasurementMode::Fres => "fres",
            MeasurementMode::Freq => "freq",
            MeasurementMode::Per => "per",
            MeasurementMode::Cap => "cap",
            MeasurementMode::TempRtd => "temp_rtd",
            MeasurementMode::Diod => "diod",
            MeasurementMode::Cont => "cont",
        }
    }

    /// Canonical unit of the readings.
    pub fn unit(self) -> &'static str {
        match self {
            MeasurementMode::VoltDc | MeasurementMode::VoltAc | MeasurementMode::Diod => "V",
            MeasurementMode::CurrDc | MeasurementMode::CurrAc => "A",
            MeasurementMode::Res | MeasurementMode::Fres | MeasurementMode::Cont => "Ω",
            MeasurementMode::Freq => "Hz",
            MeasurementMode::Per => "s",
            MeasurementMode::Cap => "F",
            MeasurementMode::TempRtd => "°C",
        }
    }

    /// SCPI function name used with `CONF:`.
    pub fn scpi_function(self) -> &'static str {
        match self {
            MeasurementMode::VoltDc => "VOLT:DC",
            MeasurementMode::VoltAc => "VOLT:AC",
            MeasurementMode::CurrDc => "CURR:DC",
            MeasurementMode::CurrAc => "CURR:AC",
            MeasurementMode::Res => "RES",
            MeasurementMode::Fres => "FRES",
            MeasurementMode::Freq => "FREQ",
            MeasurementMode::Per => "PER",
            MeasurementMode::Cap => "CAP",
            MeasurementMode::TempRtd => "TEMP:RTD",
            MeasurementMode::Diod => "DIOD",
            MeasurementMode::Cont => "CONT",
        }
    }

    /// Manual ranges, smallest first. Empty for auto-range-only functions.
    pub fn ranges(self) -> &'static [&'static str] {
        match self {
            MeasurementMode::VoltDc => &["50mV", "500mV", "5V", "50V", "500V", "1000V"],
            MeasurementMode::VoltAc => &["500mV", "5V", "50V", "500V", "750V"],
            MeasurementMode::CurrDc | MeasurementMode::CurrAc => {
                &["500uA", "5mA", "50mA", "500mA", "5A", "10A"]
            }
            MeasurementMode::Res => &["500", "5K", "50K", "500K", "5M", "50M"],
            MeasurementMode::Fres => &["500", "5K", "50K"],
            MeasurementMode::Cap => &["50nF", "500nF", "5uF", "50uF", "500uF", "5mF", "50mF"],
            MeasurementMode::Freq
            | MeasurementMode::Per
            | MeasurementMode::TempRtd
            | MeasurementMode::Diod
            | MeasurementMode::Cont => &[],
        }
    }
}

impl fmt::Display for MeasurementMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.id())
    }
}

impl FromStr for MeasurementMode {
    type Err = BenchError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let id = s.trim().to_ascii_lowercase();
        Self::ALL
            .into_iter()
            .find(|m| m.id() == id)
            .ok_or_else(|| BenchError::InvalidConfig(format!("unknown measurement mode '{s}'")))
    }
}
