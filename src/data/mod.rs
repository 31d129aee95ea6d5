//! CSV persistence of sweeps and data logs.
pub mod bode_csv;
pub mod log_csv;

pub use bode_csv::{load_bode_csv, read_bode_csv, save_bode_csv, write_bode_csv, BodeTable};
pub use log_csv::{
    load_log_csv, LogComparison, LogCsvWriter, LogRecord, LogSeries, LogSummary, LOG_HEADER,
};
