//! Custom error types for the bench core.
//!
//! `BenchError` is the single error type returned by every fallible operation in the
//! library. Its variants follow the failure taxonomy of the bench:
//!
//! - **`NotOpen`**: a transport operation was attempted on a closed endpoint. Callers may
//!   reopen and retry once.
//! - **`Busy`**: the endpoint is already owned, or a mutually exclusive session (sweep vs
//!   data log) is active.
//! - **`TransportIo`** / **`Timeout`**: OS-level failure, framing error or a read that did
//!   not complete before the endpoint's deadline.
//! - **`Protocol`**: the device answered, but with data that cannot be parsed or is out of
//!   range.
//! - **`InvalidConfig`**: a sweep, logger or application configuration violates an
//!   invariant. Raised synchronously, before any I/O.
//! - **`SweepFailed`**: a sweep stopped on an error; carries the failing frequency, the
//!   points gathered so far and the underlying cause.
//! - **`Aborted`**: an operation was stopped cooperatively.
//! - **`Worker`**: a background sweep or logging task panicked or was cancelled.
//!
//! Worker tasks never leak raw OS errors: they convert them into one of the variants above
//! before handing them to the UI through an event.

use crate::bode::BodePoint;
use thiserror::Error;

/// Convenience alias for results using the bench error type.
pub type BenchResult<T> = std::result::Result<T, BenchError>;

#[derive(Error, Debug)]
pub enum BenchError {
    #[error("Serial port '{0}' is not open")]
    NotOpen(String),

    #[error("Resource busy: {0}")]
    Busy(String),

    #[error("Transport I/O error on '{port}': {source}")]
    TransportIo {
        port: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Timed out after {timeout_ms} ms waiting for '{port}'")]
    Timeout { port: String, timeout_ms: u64 },

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Sweep failed at {frequency_hz} Hz after {} points: {source}", .partial.len())]
    SweepFailed {
        frequency_hz: f64,
        partial: Vec<BodePoint>,
        #[source]
        source: Box<BenchError>,
    },

    #[error("Operation aborted")]
    Aborted,

    #[error("Data logger is already running")]
    AlreadyRunning,

    #[error("Worker task failed: {0}")]
    Worker(String),

    #[error("Feature '{0}' is not enabled. Please build with --features {0}")]
    FeatureNotEnabled(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Configuration error: {0}")]
    Config(#[from] Box<figment::Error>),
}

impl BenchError {
    /// Wrap an I/O error raised while talking to `port`.
    pub fn transport(port: impl Into<String>, source: std::io::Error) -> Self {
        BenchError::TransportIo {
            port: port.into(),
            source,
        }
    }

    /// Whether the caller can reasonably retry or reconfigure and carry on.
    ///
    /// Link and device failures are recoverable (reopen, retry), configuration and
    /// filesystem failures are not.
    pub fn is_recoverable(&self) -> bool {
        match self {
            BenchError::NotOpen(_)
            | BenchError::Busy(_)
            | BenchError::TransportIo { .. }
            | BenchError::Timeout { .. }
            | BenchError::Protocol(_)
            | BenchError::Aborted
            | BenchError::AlreadyRunning => true,
            BenchError::SweepFailed { source, .. } => source.is_recoverable(),
            BenchError::InvalidConfig(_)
            | BenchError::Worker(_)
            | BenchError::FeatureNotEnabled(_)
            | BenchError::Io(_)
            | BenchError::Csv(_)
            | BenchError::Json(_)
            | BenchError::Config(_) => false,
        }
    }

    /// True for errors caused by the serial link itself rather than the device's answer.
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            BenchError::TransportIo { .. } | BenchError::Timeout { .. } | BenchError::NotOpen(_)
        )
    }
}

impl From<tokio::task::JoinError> for BenchError {
    fn from(value: tokio::task::JoinError) -> Self {
        if value.is_cancelled() {
            BenchError::Worker("task was cancelled".into())
        } else {
            BenchError::Worker(format!("task panicked: {value}"))
        }
    }
}

impl From<figment::Error> for BenchError {
    fn from(value: figment::Error) -> Self {
        BenchError::Config(Box::new(value))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sweep_failure_chains_cause() {
        let err = BenchError::SweepFailed {
            frequency_hz: 1000.0,
            partial: Vec::new(),
            source: Box::new(BenchError::Timeout {
                port: "/dev/ttyUSB0".into(),
                timeout_ms: 500,
            }),
        };
        let msg = err.to_string();
        assert!(msg.contains("1000 Hz"));
        assert!(msg.contains("0 points"));
        assert!(err.is_recoverable());

        let source = std::error::Error::source(&err).map(|s| s.to_string());
        assert_eq!(
            source.as_deref(),
            Some("Timed out after 500 ms waiting for '/dev/ttyUSB0'")
        );
    }

    #[test]
    fn config_errors_are_not_recoverable() {
        assert!(!BenchError::InvalidConfig("f_min must be > 0".into()).is_recoverable());
        assert!(BenchError::Busy("sweep running".into()).is_recoverable());
    }

    #[test]
    fn transport_classification() {
        let io = std::io::Error::new(std::io::ErrorKind::BrokenPipe, "unplugged");
        assert!(BenchError::transport("COM3", io).is_transport());
        assert!(BenchError::NotOpen("COM3".into()).is_transport());
        assert!(!BenchError::Protocol("garbage".into()).is_transport());
    }

    #[tokio::test]
    async fn panicked_task_is_a_worker_error() {
        let join = tokio::spawn(async {
            if true {
                panic!("sampling task blew up");
            }
        })
        .await
        .unwrap_err();

        let err = BenchError::from(join);
        assert!(matches!(err, BenchError::Worker(_)), "{err}");
        assert!(err.to_string().contains("panicked"));
        assert!(!err.is_recoverable());
        assert!(!err.is_transport());
    }

    #[tokio::test]
    async fn cancelled_task_is_a_worker_error() {
        let handle = tokio::spawn(std::future::pending::<()>());
        handle.abort();
        let err = BenchError::from(handle.await.unwrap_err());
        assert!(matches!(err, BenchError::Worker(ref m) if m.contains("cancelled")));
    }
}
