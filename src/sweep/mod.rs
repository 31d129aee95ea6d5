//! Frequency-response sweeps.
//!
//! [`plan`] turns a [`SweepConfig`] into target frequencies; [`engine`] steps the
//! generator through them and records one [`BodePoint`](crate::bode::BodePoint) each.

pub mod engine;
pub mod plan;

pub use engine::{
    AbortHandle, NoopListener, SweepEngine, SweepEvent, SweepListener, SweepReport, SweepState,
    SweepStatus,
};
pub use plan::{Scale, SweepConfig, MAX_POINTS};
