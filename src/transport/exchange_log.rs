//! Passive record of every byte sent to or received from the instruments.
//!
//! The log is shared (`Arc<ExchangeLog>`) between all endpoints of a session and is
//! disabled by default. When enabled, each TX/RX chunk is appended with the port name and
//! a monotonic timestamp, and mirrored as a `trace!` event on the `owon_bench::exchange`
//! target. The log is append-only and bounded: once `capacity` records are held the
//! oldest ones are dropped.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use tokio::time::Instant;
use tracing::trace;

/// Default number of records kept before the oldest are dropped.
pub const DEFAULT_CAPACITY: usize = 10_000;

/// Direction of a recorded exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Host to instrument
    Tx,
    /// Instrument to host
    Rx,
}

impl std::fmt::Display for Direction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Direction::Tx => write!(f, "TX"),
            Direction::Rx => write!(f, "RX"),
        }
    }
}

/// One recorded chunk of traffic.
#[derive(Debug, Clone)]
pub struct ExchangeRecord {
    pub direction: Direction,
    pub port: String,
    pub payload: Vec<u8>,
    pub at: Instant,
}

impl ExchangeRecord {
    /// Payload rendered as printable ASCII with escapes for control bytes.
    pub fn payload_text(&self) -> String {
        self.payload.escape_ascii().to_string()
    }
}

/// Shared TX/RX observer.
#[derive(Debug)]
pub struct ExchangeLog {
    enabled: AtomicBool,
    capacity: usize,
    records: Mutex<VecDeque<ExchangeRecord>>,
}

impl Default for ExchangeLog {
    fn default() -> Self {
        Self::new()
    }
}

impl ExchangeLog {
    /// Disabled log with the default capacity.
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            enabled: AtomicBool::new(false),
            capacity: capacity.max(1),
            records: Mutex::new(VecDeque::new()),
        }
    }

    pub fn enable(&self) {
        self.enabled.store(true, Ordering::Release);
    }

    pub fn disable(&self) {
        self.enabled.store(false, Ordering::Release);
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Acquire)
    }

    /// Append a record. No-op while the log is disabled or the payload is empty.
    pub fn record(&self, direction: Direction, port: &str, payload: &[u8]) {
        if !self.is_enabled() || payload.is_empty() {
            return;
        }

        trace!(
            target: "owon_bench::exchange",
            %direction,
            port,
            payload = %payload.escape_ascii(),
        );

        let mut records = self.records.lock().unwrap_or_else(|e| e.into_inner());
        if records.len() == self.capacity {
            records.pop_front();
        }
        records.push_back(ExchangeRecord {
            direction,
            port: port.to_string(),
            payload: payload.to_vec(),
            at: Instant::now(),
        });
    }

    /// Copy of the records currently held, oldest first.
    pub fn snapshot(&self) -> Vec<ExchangeRecord> {
        let records = self.records.lock().unwrap_or_else(|e| e.into_inner());
        records.iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.records.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        self.records
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn disabled_by_default() {
        let log = ExchangeLog::new();
        log.record(Direction::Tx, "COM1", b"*IDN?\n");
        assert!(log.is_empty());
    }

    #[test]
    fn records_in_order_when_enabled() {
        let log = ExchangeLog::new();
        log.enable();
        log.record(Direction::Tx, "COM1", b"*IDN?\n");
        log.record(Direction::Rx, "COM1", b"OWON,XDM1041\n");

        let records = log.snapshot();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].direction, Direction::Tx);
        assert_eq!(records[1].direction, Direction::Rx);
        assert_eq!(records[0].payload_text(), "*IDN?\\n");
        assert!(records[0].at <= records[1].at);
    }

    #[test]
    fn bounded_capacity_drops_oldest() {
        let log = ExchangeLog::with_capacity(2);
        log.enable();
        log.record(Direction::Tx, "COM1", b"a");
        log.record(Direction::Tx, "COM1", b"b");
        log.record(Direction::Tx, "COM1", b"c");

        let payloads: Vec<_> = log.snapshot().into_iter().map(|r| r.payload).collect();
        assert_eq!(payloads, vec![b"b".to_vec(), b"c".to_vec()]);
    }

    #[test]
    fn disable_stops_recording() {
        let log = ExchangeLog::new();
        log.enable();
        log.record(Direction::Tx, "COM1", b"x");
        log.disable();
        log.record(Direction::Tx, "COM1", b"y");
        assert_eq!(log.len(), 1);
        log.clear();
        assert!(log.is_empty());
    }
}
