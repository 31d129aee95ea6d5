//! Cut-off and resonance frequencies of common passive networks.
//!
//! Every function returns `None` when any argument is not strictly positive (NaN included).
//! Resistances in ohms, capacitances in farads, inductances in henries, results in hertz.

use std::f64::consts::PI;

fn all_positive(values: &[f64]) -> bool {
    values.iter().all(|v| *v > 0.0)
}

/// First-order RC low-pass: `1 / (2π R C)`.
pub fn rc_low_pass(r: f64, c: f64) -> Option<f64> {
    all_positive(&[r, c]).then(|| 1.0 / (2.0 * PI * r * c))
}

/// First-order RC high-pass, same corner as the low-pass.
pub fn rc_high_pass(r: f64, c: f64) -> Option<f64> {
    rc_low_pass(r, c)
}

/// Wien bridge with equal resistors and capacitors.
pub fn wien_symmetric(r: f64, c: f64) -> Option<f64> {
    rc_low_pass(r, c)
}

/// Wien bridge with arbitrary components: `1 / (2π √(R1 R2 C1 C2))`.
pub fn wien_general(r1: f64, r2: f64, c1: f64, c2: f64) -> Option<f64> {
    all_positive(&[r1, r2, c1, c2]).then(|| 1.0 / (2.0 * PI * (r1 * r2 * c1 * c2).sqrt()))
}

/// Series/parallel LC resonance: `1 / (2π √(L C))`.
pub fn rlc_resonance(l: f64, c: f64) -> Option<f64> {
    all_positive(&[l, c]).then(|| 1.0 / (2.0 * PI * (l * c).sqrt()))
}

/// Quality factor of a series RLC circuit: `√(L/C) / R`.
pub fn rlc_q(r: f64, l: f64, c: f64) -> Option<f64> {
    all_positive(&[r, l, c]).then(|| (l / c).sqrt() / r)
}

/// Twin-T notch frequency, `1 / (2π R C)`.
pub fn twin_t(r: f64, c: f64) -> Option<f64> {
    rc_low_pass(r, c)
}
