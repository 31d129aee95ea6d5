//! Instrument capabilities
//!
//! The sweep engine and the data logger never talk to a concrete driver. They are generic
//! over two small capability traits:
//!
//! - [`SignalSource`]: something that produces a sine on a channel (FY6900, simulated
//!   generator)
//! - [`MeasurementSource`]: something that returns a [`Reading`] in a selected
//!   [`MeasurementMode`] (SCPI multimeter, simulated meter)
//!
//! # Design
//!
//! Each capability trait:
//! - Is async (uses #[async_trait])
//! - Is thread-safe (requires Send + Sync)
//! - Takes `&self`; drivers keep their state behind interior mutability
//! - Returns [`BenchResult`]
//!
//! # Example
//!
//! ```rust,ignore
//! async fn one_point<G, M>(gen: &G, meter: &M, hz: f64) -> BenchResult<f64>
//! where
//!     G: SignalSource,
//!     M: MeasurementSource,
//! {
//!     gen.set_frequency(Channel::One, hz).await?;
//!     meter.set_mode(MeasurementMode::VoltAc).await?;
//!     Ok(meter.measure().await?.value)
//! }
//! ```

use crate::error::BenchResult;
use crate::measurement::{MeasurementMode, Reading};
use crate::protocol::fy6900::Waveform;
use crate::protocol::Channel;
use async_trait::async_trait;

/// Capability: Signal Generation
///
/// # Contract
/// - Amplitudes are peak volts, frequencies hertz
/// - Each call issues one command; no call waits for the output to settle
/// - `output_enabled` reports the device's state, not a cached value
#[async_trait]
pub trait SignalSource: Send + Sync {
    async fn set_waveform(&self, channel: Channel, waveform: Waveform) -> BenchResult<()>;

    async fn set_frequency(&self, channel: Channel, hz: f64) -> BenchResult<()>;

    async fn set_amplitude(&self, channel: Channel, peak_v: f64) -> BenchResult<()>;

    async fn set_output(&self, channel: Channel, on: bool) -> BenchResult<()>;

    async fn output_enabled(&self, channel: Channel) -> BenchResult<bool>;

    /// Highest frequency `set_frequency` accepts.
    fn max_frequency_hz(&self) -> f64 {
        f64::INFINITY
    }
}

/// Capability: Scalar Measurement
///
/// # Contract
/// - After `set_mode(m)` succeeds, `current_mode()` returns `m`
/// - `measure` triggers one reading in the current mode; a reply that cannot be parsed
///   yields a reading whose value is NaN, not an error
#[async_trait]
pub trait MeasurementSource: Send + Sync {
    async fn set_mode(&self, mode: MeasurementMode) -> BenchResult<()>;

    async fn current_mode(&self) -> MeasurementMode;

    async fn measure(&self) -> BenchResult<Reading>;
}
