//! Instrument capabilities and simulated instruments.
//!
//! [`capabilities`] holds the traits the sweep engine and data logger are written
//! against; [`mock`] implements them in-process for tests and `--simulate` runs.

pub mod capabilities;
pub mod mock;

pub use capabilities::{MeasurementSource, SignalSource};
