//! Measurement facade over the multimeter.
//!
//! [`Multimeter`] wraps the SCPI protocol with a mode-aware API: select a
//! [`MeasurementMode`], then [`Multimeter::measure`] returns a [`Reading`] carrying the
//! parsed value, the mode's unit and the device's verbatim token.

pub mod mode;
pub mod multimeter;

pub use mode::MeasurementMode;
pub use multimeter::Multimeter;

use serde::Serialize;

/// One value returned by the meter.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Reading {
    /// Parsed value, NaN when the token is not numeric.
    pub value: f64,
    pub unit: &'static str,
    pub mode: MeasurementMode,
    /// Token exactly as the device sent it.
    pub raw: String,
}

impl Reading {
    /// Parse `raw` for `mode`.
    pub fn parse(mode: MeasurementMode, raw: &str) -> Self {
        Self {
            value: parse_value(raw),
            unit: mode.unit(),
            mode,
            raw: raw.trim().to_string(),
        }
    }

    /// Reading built from a known value, e.g. by a simulated instrument.
    pub fn from_value(mode: MeasurementMode, value: f64) -> Self {
        Self {
            value,
            unit: mode.unit(),
            mode,
            raw: format!("{value:E}"),
        }
    }

    pub fn is_valid(&self) -> bool {
        self.value.is_finite()
    }
}

/// Numeric value of a meter token such as `+1.23456E-03`, `0.7071 V` or `1.5,OK`.
///
/// The first whitespace or comma separated field is parsed; anything else is NaN.
pub fn parse_value(raw: &str) -> f64 {
    raw.split(|c: char| c.is_whitespace() || c == ',')
        .find(|s| !s.is_empty())
        .and_then(|token| token.parse::<f64>().ok())
        .unwrap_or(f64::NAN)
}

/// Timestamped reading as produced by the data logger.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MeasurementSample {
    /// RFC 3339 wall-clock time, local offset.
    pub timestamp_iso: String,
    /// Seconds since the logger started.
    pub elapsed_s: f64,
    pub value: f64,
    pub unit: String,
    pub mode: MeasurementMode,
    pub raw: String,
}
