//! # OWON Bench Core Library
//!
//! Instrument control for a serial electronics test bench: a SCPI multimeter, a FeelTech
//! FY6900 generator, an OWON DOS1102 oscilloscope and an OWON SPE power supply, plus the
//! two long-running workers built on them.
//!
//! ## Crate Structure
//!
//! - **`transport`**: `SerialEndpoint`, one exclusively owned serial port, with a
//!   passive TX/RX exchange log and an in-process loopback for simulated devices.
//! - **`protocol`**: wire protocols of the instruments (SCPI, FY6900, DOS1102, SPE).
//! - **`measurement`**: measurement modes, readings and the mode-aware `Multimeter`.
//! - **`hardware`**: capability traits (`SignalSource`, `MeasurementSource`) and
//!   simulated instruments.
//! - **`sweep`**: frequency plan and the abortable Bode sweep engine.
//! - **`data_logger`**: periodic multimeter sampling into CSV.
//! - **`bode`** / **`filter_calc`**: gain computations and analytic filter formulas.
//! - **`data`**: Bode and data-log CSV formats.
//! - **`detection`**: serial port enumeration and instrument identification.
//! - **`session`** / **`events`**: sweep-vs-logger exclusion and the typed event queue
//!   front-ends subscribe to.
//! - **`config`**, **`logging`**, **`error`**: configuration document, tracing setup and
//!   the crate-wide `BenchError`.

pub mod bode;
pub mod config;
pub mod data;
pub mod data_logger;
pub mod detection;
pub mod error;
pub mod events;
pub mod filter_calc;
pub mod hardware;
pub mod logging;
pub mod measurement;
pub mod protocol;
pub mod session;
pub mod sweep;
pub mod transport;

pub use error::{BenchError, BenchResult};
