//! Gain computations for frequency-response (Bode) measurements.

use serde::{Deserialize, Serialize};

/// Gain reported when either amplitude is not strictly positive.
///
/// A display floor, not a physical minimum: callers that need the true value compute
/// `20·log10(u_s/u_e)` themselves.
pub const GAIN_DB_FLOOR: f64 = -100.0;

/// One measured point of a sweep.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BodePoint {
    /// 0-based position in the sweep.
    pub index: usize,
    #[serde(rename = "f_hz")]
    pub frequency_hz: f64,
    /// Measured RMS output amplitude in volts.
    #[serde(rename = "us_v")]
    pub output_v: f64,
    pub gain_linear: f64,
    pub gain_db: f64,
}

impl BodePoint {
    /// Build a point from the input and measured output amplitudes.
    pub fn new(index: usize, frequency_hz: f64, input_v: f64, output_v: f64) -> Self {
        Self {
            index,
            frequency_hz,
            output_v,
            gain_linear: gain_linear(input_v, output_v),
            gain_db: gain_db(input_v, output_v),
        }
    }
}

/// `u_s / u_e`, or 0 when `u_e == 0`.
pub fn gain_linear(u_e: f64, u_s: f64) -> f64 {
    if u_e == 0.0 {
        0.0
    } else {
        u_s / u_e
    }
}

/// `20·log10(u_s / u_e)`, or [`GAIN_DB_FLOOR`] unless both amplitudes are positive.
pub fn gain_db(u_e: f64, u_s: f64) -> f64 {
    if u_e > 0.0 && u_s > 0.0 {
        20.0 * (u_s / u_e).log10()
    } else {
        GAIN_DB_FLOOR
    }
}

/// First frequency at which the gain falls 3 dB below `reference_db`.
///
/// Interpolates linearly in (log10 f, dB) between the two points bracketing the crossing.
/// `reference_db` defaults to the gain of the first point. Returns `None` when the curve
/// never crosses.
pub fn estimate_cutoff(points: &[BodePoint], reference_db: Option<f64>) -> Option<f64> {
    let first = points.first()?;
    let target = reference_db.unwrap_or(first.gain_db) - 3.0;

    if first.gain_db <= target {
        return Some(first.frequency_hz);
    }

    points.windows(2).find_map(|pair| {
        let (a, b) = (&pair[0], &pair[1]);
        if a.gain_db > target && b.gain_db <= target {
            if a.frequency_hz <= 0.0 || b.frequency_hz <= 0.0 {
                return Some(b.frequency_hz);
            }
            let t = (a.gain_db - target) / (a.gain_db - b.gain_db);
            let (la, lb) = (a.frequency_hz.log10(), b.frequency_hz.log10());
            Some(10f64.powf(la + t * (lb - la)))
        } else {
            None
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn linear_gain_is_zero_only_without_input() {
        assert_eq!(gain_linear(0.0, 1.0), 0.0);
        assert_eq!(gain_linear(2.0, 1.0), 0.5);
        assert_eq!(gain_linear(1.0, 0.0), 0.0);
    }

    #[test]
    fn half_power_point() {
        assert!((gain_db(1.0, 0.707_106_781) - (-3.0103)).abs() < 1e-4);
        assert!((gain_db(2.0, 20.0) - 20.0).abs() < 1e-9);
    }

    #[test]
    fn floor_for_non_positive_amplitudes() {
        assert_eq!(gain_db(1.0, 0.0), GAIN_DB_FLOOR);
        assert_eq!(gain_db(0.0, 1.0), GAIN_DB_FLOOR);
        assert_eq!(gain_db(-1.0, 1.0), GAIN_DB_FLOOR);
        assert_eq!(gain_db(1.0, -0.5), GAIN_DB_FLOOR);
    }

    #[test]
    fn point_carries_both_gains() {
        let p = BodePoint::new(3, 1000.0, 1.0, 0.5);
        assert_eq!(p.index, 3);
        assert_eq!(p.gain_linear, 0.5);
        assert!((p.gain_db + 6.0206).abs() < 1e-3);
    }

    #[test]
    fn cutoff_of_first_order_low_pass() {
        let fc = 1000.0;
        let points: Vec<_> = (0..=40)
            .map(|i| {
                let f = 10f64.powf(1.0 + f64::from(i) * 0.1);
                let us = 1.0 / (1.0 + (f / fc).powi(2)).sqrt();
                BodePoint::new(i as usize, f, 1.0, us)
            })
            .collect();

        let estimate = estimate_cutoff(&points, Some(0.0)).unwrap();
        assert!((estimate - fc).abs() / fc < 0.02, "estimate {estimate}");
    }

    #[test]
    fn no_cutoff_on_flat_response() {
        let points: Vec<_> = (0..5)
            .map(|i| BodePoint::new(i, 100.0 * (i + 1) as f64, 1.0, 1.0))
            .collect();
        assert_eq!(estimate_cutoff(&points, None), None);
        assert_eq!(estimate_cutoff(&[], None), None);
    }
}
