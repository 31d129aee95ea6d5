//! Integration tests for the analytic helpers: filter formulas and Bode gains.

use owon_bench::bode::{estimate_cutoff, gain_db, gain_linear, BodePoint, GAIN_DB_FLOOR};
use owon_bench::filter_calc::{
    rc_high_pass, rc_low_pass, rlc_q, rlc_resonance, twin_t, wien_general, wien_symmetric,
};
use std::f64::consts::PI;

fn rel_eq(a: f64, b: f64, tol: f64) -> bool {
    ((a - b) / b).abs() <= tol
}

// =============================================================================
// Filter calculator
// =============================================================================

#[test]
fn test_rc_low_pass_reference_values() {
    let fc = rc_low_pass(1000.0, 100e-9).unwrap();
    assert!((fc - 1591.549_430_918_953).abs() < 1e-6);
    assert_eq!(rc_low_pass(0.0, 1e-6), None);
    assert_eq!(rc_high_pass(1000.0, 100e-9), Some(fc));
}

#[test]
fn test_rc_product_identity() {
    for r in [1.0, 47.0, 1_000.0, 22_000.0, 1e6] {
        for c in [1e-12, 4.7e-9, 100e-9, 1e-6, 220e-6] {
            let fc = rc_low_pass(r, c).unwrap();
            assert!(rel_eq(fc * 2.0 * PI * r * c, 1.0, 1e-12), "r={r} c={c}");
        }
    }
}

#[test]
fn test_wien_general_formula() {
    let cases = [
        (1e3f64, 1e3f64, 10e-9f64, 10e-9f64),
        (4.7e3, 10e3, 22e-9, 47e-9),
        (100.0, 1e6, 1e-6, 1e-12),
    ];
    for (r1, r2, c1, c2) in cases {
        let expected = 1.0 / (2.0 * PI * (r1 * r2 * c1 * c2).sqrt());
        assert!(rel_eq(wien_general(r1, r2, c1, c2).unwrap(), expected, 1e-12));
    }
    assert!(rel_eq(
        wien_symmetric(1e3, 10e-9).unwrap(),
        wien_general(1e3, 1e3, 10e-9, 10e-9).unwrap(),
        1e-12
    ));
}

#[test]
fn test_rlc_and_twin_t() {
    assert!((rlc_q(10.0, 10e-3, 10e-9).unwrap() - 100.0).abs() < 1e-9);
    let f0 = rlc_resonance(10e-3, 10e-9).unwrap();
    assert!(rel_eq(f0, 1.0 / (2.0 * PI * (10e-3f64 * 10e-9).sqrt()), 1e-12));
    assert!(rel_eq(twin_t(10e3, 10e-9).unwrap(), rc_low_pass(10e3, 10e-9).unwrap(), 1e-12));
}

#[test]
fn test_non_positive_arguments_have_no_value() {
    assert_eq!(rc_low_pass(-1.0, 1e-6), None);
    assert_eq!(rc_high_pass(1e3, 0.0), None);
    assert_eq!(wien_symmetric(0.0, 1e-9), None);
    assert_eq!(wien_general(1e3, 1e3, -1e-9, 1e-9), None);
    assert_eq!(rlc_resonance(0.0, 1e-9), None);
    assert_eq!(rlc_q(0.0, 1e-3, 1e-9), None);
    assert_eq!(twin_t(1e3, f64::NAN), None);
}

// =============================================================================
// Bode helpers
// =============================================================================

#[test]
fn test_gain_reference_values() {
    assert!((gain_db(1.0, 0.707_106_781) - -3.0103).abs() < 1e-4);
    assert_eq!(gain_db(1.0, 0.0), -100.0);
    assert_eq!(gain_db(0.0, 1.0), GAIN_DB_FLOOR);
    assert_eq!(gain_db(1.0, -0.5), GAIN_DB_FLOOR);
}

#[test]
fn test_gain_linear_zero_only_for_zero_input() {
    assert_eq!(gain_linear(0.0, 3.0), 0.0);
    assert_eq!(gain_linear(2.0, 1.0), 0.5);
    assert_eq!(gain_linear(0.3, 0.1), 0.1 / 0.3);
    for (u_e, u_s) in [(1.0, 10.0), (2.0, 0.002), (0.5, 0.5)] {
        assert!((gain_db(u_e, u_s) - 20.0 * (u_s / u_e).log10()).abs() < 1e-9);
    }
}

#[test]
fn test_cutoff_estimate_on_first_order_curve() {
    let fc = 1234.5;
    let points: Vec<BodePoint> = (0..=40u32)
        .map(|i| {
            let f = 10.0 * 10f64.powf(f64::from(i) / 10.0);
            BodePoint::new(i as usize, f, 1.0, 1.0 / (1.0 + (f / fc).powi(2)).sqrt())
        })
        .collect();

    let estimate = estimate_cutoff(&points, Some(0.0)).unwrap();
    assert!(rel_eq(estimate, fc, 0.01), "estimate {estimate}");
    assert_eq!(estimate_cutoff(&points[..5], Some(0.0)), None);
    assert_eq!(estimate_cutoff(&[], None), None);
}
