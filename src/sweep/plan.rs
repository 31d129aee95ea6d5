//! Sweep configuration and frequency planning.

use crate::error::{BenchError, BenchResult};
use crate::protocol::Channel;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Upper bound on the number of points of one sweep.
pub const MAX_POINTS: usize = 10_000;

/// Frequency spacing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Scale {
    #[default]
    #[serde(rename = "log10")]
    Log10,
    #[serde(rename = "linear")]
    Linear,
}

impl fmt::Display for Scale {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Scale::Log10 => f.write_str("log10"),
            Scale::Linear => f.write_str("linear"),
        }
    }
}

impl FromStr for Scale {
    type Err = BenchError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "log10" | "log" => Ok(Scale::Log10),
            "linear" | "lin" => Ok(Scale::Linear),
            other => Err(BenchError::InvalidConfig(format!(
                "unknown scale '{other}', expected log10 or linear"
            ))),
        }
    }
}

/// Parameters of one frequency sweep.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SweepConfig {
    pub generator_channel: Channel,
    pub f_min_hz: f64,
    pub f_max_hz: f64,
    pub points_per_decade: u32,
    pub scale: Scale,
    /// Wait after each frequency change before reading the output.
    pub settling_ms: u64,
    /// RMS amplitude applied to the network input, volts.
    pub input_rms_v: f64,
}

impl Default for SweepConfig {
    fn default() -> Self {
        Self {
            generator_channel: Channel::One,
            f_min_hz: 10.0,
            f_max_hz: 100_000.0,
            points_per_decade: 10,
            scale: Scale::Log10,
            settling_ms: 500,
            input_rms_v: 1.0,
        }
    }
}

impl SweepConfig {
    pub fn validate(&self) -> BenchResult<()> {
        if !(self.f_min_hz.is_finite() && self.f_min_hz > 0.0) {
            return Err(BenchError::InvalidConfig(format!(
                "f_min_hz must be > 0, got {}",
                self.f_min_hz
            )));
        }
        if !(self.f_max_hz.is_finite() && self.f_max_hz >= self.f_min_hz) {
            return Err(BenchError::InvalidConfig(format!(
                "f_max_hz ({}) must be >= f_min_hz ({})",
                self.f_max_hz, self.f_min_hz
            )));
        }
        if self.points_per_decade == 0 {
            return Err(BenchError::InvalidConfig(
                "points_per_decade must be >= 1".into(),
            ));
        }
        if !(self.input_rms_v.is_finite() && self.input_rms_v > 0.0) {
            return Err(BenchError::InvalidConfig(format!(
                "input amplitude must be > 0 V, got {}",
                self.input_rms_v
            )));
        }
        let n = self.point_count();
        if n > MAX_POINTS {
            return Err(BenchError::InvalidConfig(format!(
                "sweep would have {n} points, limit is {MAX_POINTS}"
            )));
        }
        Ok(())
    }

    /// `ceil(points_per_decade · log10(f_max/f_min)) + 1`.
    pub fn point_count(&self) -> usize {
        let decades = (self.f_max_hz / self.f_min_hz).log10();
        // Absorb rounding noise so exact decades are not bumped to the next integer.
        let steps = (f64::from(self.points_per_decade) * decades - 1e-9).ceil().max(0.0);
        if steps.is_finite() {
            (steps as usize).saturating_add(1)
        } else {
            usize::MAX
        }
    }

    /// Ordered target frequencies. Validates first.
    pub fn frequencies(&self) -> BenchResult<Vec<f64>> {
        self.validate()?;
        let n = self.point_count();
        if n == 1 {
            return Ok(vec![self.f_min_hz]);
        }

        let last = (n - 1) as f64;
        let mut plan: Vec<f64> = match self.scale {
            Scale::Log10 => {
                let decades = (self.f_max_hz / self.f_min_hz).log10();
                (0..n)
                    .map(|i| self.f_min_hz * 10f64.powf(decades * i as f64 / last))
                    .collect()
            }
            Scale::Linear => {
                let step = (self.f_max_hz - self.f_min_hz) / last;
                (0..n).map(|i| self.f_min_hz + step * i as f64).collect()
            }
        };
        plan[0] = self.f_min_hz;
        plan[n - 1] = self.f_max_hz;
        Ok(plan)
    }

    /// `key = value` pairs describing the sweep, for export headers.
    pub fn metadata(&self) -> Vec<(String, String)> {
        vec![
            ("channel".into(), self.generator_channel.number().to_string()),
            ("u_e".into(), self.input_rms_v.to_string()),
            ("scale".into(), self.scale.to_string()),
            ("points_per_decade".into(), self.points_per_decade.to_string()),
            ("settling_ms".into(), self.settling_ms.to_string()),
            ("f_min_hz".into(), self.f_min_hz.to_string()),
            ("f_max_hz".into(), self.f_max_hz.to_string()),
        ]
    }
}
