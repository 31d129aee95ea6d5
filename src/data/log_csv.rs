//! Data-log CSV: writer used by the logger, reader and statistics for replay.
//!
//! Header `timestamp_iso,elapsed_s,value,unit,mode`. A reading whose value could not be
//! parsed is stored as the device's verbatim token in the `value` column.

use crate::error::{BenchError, BenchResult};
use crate::measurement::MeasurementSample;
use serde::Deserialize;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

/// Column names, in order.
pub const LOG_HEADER: [&str; 5] = ["timestamp_iso", "elapsed_s", "value", "unit", "mode"];

/// Row-by-row writer holding the log file open.
pub struct LogCsvWriter {
    path: PathBuf,
    writer: csv::Writer<Box<dyn Write + Send>>,
    rows: usize,
}

impl std::fmt::Debug for LogCsvWriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LogCsvWriter")
            .field("path", &self.path)
            .field("rows", &self.rows)
            .finish_non_exhaustive()
    }
}

impl LogCsvWriter {
    /// Create `path` (which must not exist yet) and write the header.
    pub fn create(path: &Path) -> BenchResult<Self> {
        let file = OpenOptions::new().write(true).create_new(true).open(path)?;
        Self::from_writer(path.to_path_buf(), Box::new(file))
    }

    /// Writer over any sink, reported as `path`. Writes the header.
    pub fn from_writer(path: PathBuf, out: Box<dyn Write + Send>) -> BenchResult<Self> {
        let mut writer = csv::Writer::from_writer(out);
        writer.write_record(LOG_HEADER)?;
        writer.flush()?;
        Ok(Self {
            path,
            writer,
            rows: 0,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Rows written so far, header excluded.
    pub fn rows(&self) -> usize {
        self.rows
    }

    /// Append one sample and flush it to disk.
    pub fn append(&mut self, sample: &MeasurementSample) -> BenchResult<()> {
        let value = if sample.value.is_finite() {
            sample.value.to_string()
        } else if sample.raw.is_empty() {
            "NaN".to_string()
        } else {
            sample.raw.clone()
        };
        let elapsed = sample.elapsed_s.to_string();
        self.writer.write_record([
            sample.timestamp_iso.as_str(),
            elapsed.as_str(),
            value.as_str(),
            sample.unit.as_str(),
            sample.mode.id(),
        ])?;
        self.writer.flush()?;
        self.rows += 1;
        Ok(())
    }

    pub fn finish(mut self) -> BenchResult<usize> {
        self.writer.flush()?;
        Ok(self.rows)
    }
}

#[derive(Debug, Deserialize)]
struct RawRow {
    timestamp_iso: String,
    elapsed_s: f64,
    value: String,
    unit: String,
    mode: String,
}

/// One row of a data log.
#[derive(Debug, Clone, PartialEq)]
pub struct LogRecord {
    pub timestamp_iso: String,
    pub elapsed_s: f64,
    /// `None` when the file holds a non-numeric token.
    pub value: Option<f64>,
    /// The `value` column as written.
    pub raw: String,
    pub unit: String,
    pub mode: String,
}

/// Aggregate statistics of the numeric values of a log.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LogSummary {
    pub count: usize,
    pub invalid: usize,
    pub min: f64,
    pub max: f64,
    pub mean: f64,
    pub duration_s: f64,
}

/// Differences `b - a` between two logs.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LogComparison {
    pub mean_delta: f64,
    pub duration_delta_s: f64,
    pub count_delta: i64,
}

/// A data log loaded for replay.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LogSeries {
    pub records: Vec<LogRecord>,
}

impl LogSeries {
    pub fn read<R: std::io::Read>(input: R) -> BenchResult<Self> {
        let mut reader = csv::ReaderBuilder::new()
            .trim(csv::Trim::All)
            .comment(Some(b'#'))
            .from_reader(input);

        let records = reader
            .deserialize::<RawRow>()
            .map(|row| {
                let row = row?;
                let value = row.value.parse::<f64>().ok().filter(|v| v.is_finite());
                Ok(LogRecord {
                    timestamp_iso: row.timestamp_iso,
                    elapsed_s: row.elapsed_s,
                    value,
                    raw: row.value,
                    unit: row.unit,
                    mode: row.mode,
                })
            })
            .collect::<BenchResult<Vec<_>>>()?;

        Ok(Self { records })
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// `None` when the log has no numeric value at all.
    pub fn summary(&self) -> Option<LogSummary> {
        let values: Vec<f64> = self.records.iter().filter_map(|r| r.value).collect();
        if values.is_empty() {
            return None;
        }

        let min = values.iter().copied().fold(f64::INFINITY, f64::min);
        let max = values.iter().copied().fold(f64::NEG_INFINITY, f64::max);
        let mean = values.iter().sum::<f64>() / values.len() as f64;
        let first = self.records.first().map_or(0.0, |r| r.elapsed_s);
        let last = self.records.last().map_or(0.0, |r| r.elapsed_s);

        Some(LogSummary {
            count: values.len(),
            invalid: self.records.len() - values.len(),
            min,
            max,
            mean,
            duration_s: last - first,
        })
    }

    /// Compare two logs of the same quantity.
    pub fn compare(a: &LogSeries, b: &LogSeries) -> BenchResult<LogComparison> {
        let (sa, sb) = match (a.summary(), b.summary()) {
            (Some(sa), Some(sb)) => (sa, sb),
            _ => {
                return Err(BenchError::InvalidConfig(
                    "both logs need at least one numeric value".into(),
                ))
            }
        };
        if let (Some(ua), Some(ub)) = (a.records.first(), b.records.first()) {
            if ua.unit != ub.unit {
                return Err(BenchError::InvalidConfig(format!(
                    "cannot compare logs in '{}' and '{}'",
                    ua.unit, ub.unit
                )));
            }
        }

        Ok(LogComparison {
            mean_delta: sb.mean - sa.mean,
            duration_delta_s: sb.duration_s - sa.duration_s,
            count_delta: sb.count as i64 - sa.count as i64,
        })
    }
}

pub fn load_log_csv(path: &Path) -> BenchResult<LogSeries> {
    LogSeries::read(File::open(path)?)
}
