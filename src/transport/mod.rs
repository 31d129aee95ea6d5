//! Serial transport shared by every instrument protocol.
//!
//! A [`SerialEndpoint`] owns one serial port. It is closed after construction and only
//! performs I/O after an explicit [`SerialEndpoint::open`]. The actual port is produced by
//! a [`PortOpener`], which lets the same endpoint run against real hardware
//! ([`SystemPortOpener`], `tokio-serial`) or against in-process simulated devices
//! ([`loopback::LoopbackOpener`], `tokio::io::duplex`).
//!
//! # Ownership
//!
//! At most one endpoint in the process may hold a given port name open. A second `open()`
//! fails with [`BenchError::Busy`] until the first endpoint is closed or dropped. The
//! operating system's own exclusivity errors are mapped to `Busy` as well.
//!
//! # Example
//!
//! ```rust,ignore
//! use owon_bench::transport::{SerialEndpoint, SerialSettings};
//!
//! let mut ep = SerialEndpoint::system(SerialSettings::new("/dev/ttyUSB0", 115200));
//! ep.open().await?;
//! ep.write(b"*IDN?\n").await?;
//! let line = ep.read_line().await?;
//! ep.close().await;
//! ```

pub mod exchange_log;
pub mod loopback;

use crate::error::{BenchError, BenchResult};
use async_trait::async_trait;
use exchange_log::{Direction, ExchangeLog};
use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tracing::debug;

/// Any async byte stream usable as a serial port.
///
/// Implemented for `tokio_serial::SerialStream` and for `tokio::io::DuplexStream`.
pub trait SerialPortIO: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> SerialPortIO for T {}

/// Type-erased serial port.
pub type DynSerial = Box<dyn SerialPortIO>;

/// Character size.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DataBits {
    Five,
    Six,
    Seven,
    Eight,
}

/// Parity checking mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Parity {
    #[default]
    None,
    Odd,
    Even,
}

impl std::str::FromStr for Parity {
    type Err = BenchError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "n" | "none" => Ok(Parity::None),
            "o" | "odd" => Ok(Parity::Odd),
            "e" | "even" => Ok(Parity::Even),
            other => Err(BenchError::InvalidConfig(format!(
                "unknown parity '{other}', expected none, odd or even"
            ))),
        }
    }
}

/// Number of stop bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StopBits {
    One,
    Two,
}

/// Port name, speed, framing and per-read timeout of one endpoint.
#[derive(Debug, Clone, PartialEq)]
pub struct SerialSettings {
    pub port_name: String,
    pub baud_rate: u32,
    pub data_bits: DataBits,
    pub parity: Parity,
    pub stop_bits: StopBits,
    /// Deadline applied to each read operation.
    pub timeout: Duration,
}

impl SerialSettings {
    /// 8N1 settings with a one second read timeout.
    pub fn new(port_name: impl Into<String>, baud_rate: u32) -> Self {
        Self {
            port_name: port_name.into(),
            baud_rate,
            data_bits: DataBits::Eight,
            parity: Parity::None,
            stop_bits: StopBits::One,
            timeout: Duration::from_secs(1),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_parity(mut self, parity: Parity) -> Self {
        self.parity = parity;
        self
    }

    pub fn with_data_bits(mut self, data_bits: DataBits) -> Self {
        self.data_bits = data_bits;
        self
    }

    pub fn with_stop_bits(mut self, stop_bits: StopBits) -> Self {
        self.stop_bits = stop_bits;
        self
    }

    fn timeout_ms(&self) -> u64 {
        u64::try_from(self.timeout.as_millis()).unwrap_or(u64::MAX)
    }
}

/// Produces an open byte stream for a set of serial settings.
#[async_trait]
pub trait PortOpener: Send + Sync {
    async fn open(&self, settings: &SerialSettings) -> BenchResult<DynSerial>;
}

/// Opens real serial ports through `tokio-serial`.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemPortOpener;

#[cfg(feature = "instrument_serial")]
#[async_trait]
impl PortOpener for SystemPortOpener {
    async fn open(&self, settings: &SerialSettings) -> BenchResult<DynSerial> {
        use tokio_serial::SerialPortBuilderExt;

        let settings = settings.clone();
        let port_name = settings.port_name.clone();

        let stream = tokio::task::spawn_blocking(move || {
            let data_bits = match settings.data_bits {
                DataBits::Five => tokio_serial::DataBits::Five,
                DataBits::Six => tokio_serial::DataBits::Six,
                DataBits::Seven => tokio_serial::DataBits::Seven,
                DataBits::Eight => tokio_serial::DataBits::Eight,
            };
            let parity = match settings.parity {
                Parity::None => tokio_serial::Parity::None,
                Parity::Odd => tokio_serial::Parity::Odd,
                Parity::Even => tokio_serial::Parity::Even,
            };
            let stop_bits = match settings.stop_bits {
                StopBits::One => tokio_serial::StopBits::One,
                StopBits::Two => tokio_serial::StopBits::Two,
            };

            tokio_serial::new(&settings.port_name, settings.baud_rate)
                .data_bits(data_bits)
                .parity(parity)
                .stop_bits(stop_bits)
                .flow_control(tokio_serial::FlowControl::None)
                .timeout(settings.timeout)
                .open_native_async()
        })
        .await
        .map_err(|e| {
            BenchError::transport(&port_name, std::io::Error::new(std::io::ErrorKind::Other, e))
        })?
        .map_err(|e| map_open_error(&port_name, e))?;

        Ok(Box::new(stream))
    }
}

#[cfg(not(feature = "instrument_serial"))]
#[async_trait]
impl PortOpener for SystemPortOpener {
    async fn open(&self, _settings: &SerialSettings) -> BenchResult<DynSerial> {
        Err(BenchError::FeatureNotEnabled("instrument_serial".to_string()))
    }
}

#[cfg(feature = "instrument_serial")]
fn map_open_error(port: &str, err: tokio_serial::Error) -> BenchError {
    let description = err.description.to_ascii_lowercase();
    if description.contains("busy")
        || description.contains("in use")
        || description.contains("access is denied")
    {
        return BenchError::Busy(format!("serial port '{port}' is in use: {}", err.description));
    }

    let kind = match err.kind {
        tokio_serial::ErrorKind::NoDevice => std::io::ErrorKind::NotFound,
        tokio_serial::ErrorKind::InvalidInput => std::io::ErrorKind::InvalidInput,
        tokio_serial::ErrorKind::Io(kind) => kind,
        tokio_serial::ErrorKind::Unknown => std::io::ErrorKind::Other,
    };
    BenchError::transport(port, std::io::Error::new(kind, err.description))
}

// Port names currently held open by an endpoint of this process.
static OPEN_PORTS: Lazy<Mutex<HashSet<String>>> = Lazy::new(|| Mutex::new(HashSet::new()));

/// Exclusive claim on a port name, released on drop.
#[derive(Debug)]
struct PortClaim {
    port_name: String,
}

impl PortClaim {
    fn acquire(port_name: &str) -> BenchResult<Self> {
        let mut open = OPEN_PORTS.lock().unwrap_or_else(|e| e.into_inner());
        if !open.insert(port_name.to_string()) {
            return Err(BenchError::Busy(format!(
                "serial port '{port_name}' is already owned by another endpoint"
            )));
        }
        Ok(Self {
            port_name: port_name.to_string(),
        })
    }
}

impl Drop for PortClaim {
    fn drop(&mut self) {
        let mut open = OPEN_PORTS.lock().unwrap_or_else(|e| e.into_inner());
        open.remove(&self.port_name);
    }
}

struct OpenLink {
    port: BufReader<DynSerial>,
    _claim: PortClaim,
}

/// One serial port, opened on demand.
pub struct SerialEndpoint {
    settings: SerialSettings,
    opener: Arc<dyn PortOpener>,
    exchange_log: Arc<ExchangeLog>,
    link: Option<OpenLink>,
}

impl std::fmt::Debug for SerialEndpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SerialEndpoint")
            .field("settings", &self.settings)
            .field("open", &self.link.is_some())
            .finish()
    }
}

impl SerialEndpoint {
    /// Closed endpoint using `opener` to produce the port.
    pub fn new(settings: SerialSettings, opener: Arc<dyn PortOpener>) -> Self {
        Self {
            settings,
            opener,
            exchange_log: Arc::new(ExchangeLog::new()),
            link: None,
        }
    }

    /// Closed endpoint on a real serial port.
    pub fn system(settings: SerialSettings) -> Self {
        Self::new(settings, Arc::new(SystemPortOpener))
    }

    /// Record this endpoint's traffic into a shared exchange log.
    pub fn with_exchange_log(mut self, log: Arc<ExchangeLog>) -> Self {
        self.exchange_log = log;
        self
    }

    pub fn settings(&self) -> &SerialSettings {
        &self.settings
    }

    pub fn port_name(&self) -> &str {
        &self.settings.port_name
    }

    pub fn exchange_log(&self) -> &Arc<ExchangeLog> {
        &self.exchange_log
    }

    pub fn is_open(&self) -> bool {
        self.link.is_some()
    }

    /// Open the port. Fails with `Busy` if the port is owned elsewhere.
    ///
    /// Opening an endpoint that is already open is a no-op.
    pub async fn open(&mut self) -> BenchResult<()> {
        if self.link.is_some() {
            return Ok(());
        }

        let claim = PortClaim::acquire(&self.settings.port_name)?;
        let port = self.opener.open(&self.settings).await?;
        self.link = Some(OpenLink {
            port: BufReader::new(port),
            _claim: claim,
        });

        debug!(
            port = %self.settings.port_name,
            baud = self.settings.baud_rate,
            "Serial port opened"
        );
        Ok(())
    }

    /// Close the port. Idempotent.
    pub async fn close(&mut self) {
        if let Some(mut link) = self.link.take() {
            let _ = link.port.get_mut().shutdown().await;
            debug!(port = %self.settings.port_name, "Serial port closed");
        }
    }

    fn link_mut(&mut self) -> BenchResult<&mut OpenLink> {
        let port_name = &self.settings.port_name;
        self.link
            .as_mut()
            .ok_or_else(|| BenchError::NotOpen(port_name.clone()))
    }

    /// Queue `bytes` for transmission and return the number of bytes written.
    pub async fn write(&mut self, bytes: &[u8]) -> BenchResult<usize> {
        let port_name = self.settings.port_name.clone();
        let link = self.link_mut()?;

        link.port
            .get_mut()
            .write_all(bytes)
            .await
            .map_err(|e| BenchError::transport(&port_name, e))?;
        link.port
            .get_mut()
            .flush()
            .await
            .map_err(|e| BenchError::transport(&port_name, e))?;

        self.exchange_log.record(Direction::Tx, &port_name, bytes);
        Ok(bytes.len())
    }

    /// Read at most `n` bytes. Returns early with whatever arrived when the read timeout
    /// expires or the stream ends.
    pub async fn read(&mut self, n: usize) -> BenchResult<Vec<u8>> {
        let port_name = self.settings.port_name.clone();
        let deadline = tokio::time::Instant::now() + self.settings.timeout;
        let link = self.link_mut()?;

        let mut out = vec![0u8; n];
        let mut filled = 0;
        while filled < n {
            match tokio::time::timeout_at(deadline, link.port.read(&mut out[filled..])).await {
                Ok(Ok(0)) => break,
                Ok(Ok(count)) => filled += count,
                Ok(Err(e)) => return Err(BenchError::transport(&port_name, e)),
                Err(_) => break,
            }
        }
        out.truncate(filled);

        self.exchange_log.record(Direction::Rx, &port_name, &out);
        Ok(out)
    }

    /// Read exactly `n` bytes; a short read is a `Timeout` error.
    pub async fn read_exact(&mut self, n: usize) -> BenchResult<Vec<u8>> {
        let bytes = self.read(n).await?;
        if bytes.len() < n {
            return Err(BenchError::Timeout {
                port: self.settings.port_name.clone(),
                timeout_ms: self.settings.timeout_ms(),
            });
        }
        Ok(bytes)
    }

    /// Read up to and including the next `\n`, or whatever arrived before the timeout.
    pub async fn read_line(&mut self) -> BenchResult<Vec<u8>> {
        self.read_until(b'\n').await
    }

    /// Read up to and including `delimiter`, or whatever arrived before the timeout.
    pub async fn read_until(&mut self, delimiter: u8) -> BenchResult<Vec<u8>> {
        let port_name = self.settings.port_name.clone();
        let timeout = self.settings.timeout;
        let link = self.link_mut()?;

        let mut line = Vec::new();
        match tokio::time::timeout(timeout, link.port.read_until(delimiter, &mut line)).await {
            Ok(Ok(_)) | Err(_) => {}
            Ok(Err(e)) => return Err(BenchError::transport(&port_name, e)),
        }

        self.exchange_log.record(Direction::Rx, &port_name, &line);
        Ok(line)
    }

    /// Like [`read_line`](Self::read_line), but an empty result is a `Timeout` error.
    pub async fn read_line_required(&mut self) -> BenchResult<Vec<u8>> {
        let line = self.read_line().await?;
        if line.is_empty() {
            return Err(BenchError::Timeout {
                port: self.settings.port_name.clone(),
                timeout_ms: self.settings.timeout_ms(),
            });
        }
        Ok(line)
    }

    /// Discard buffered input and anything already pending on the line.
    ///
    /// Returns the number of bytes dropped.
    pub async fn reset_in_buffer(&mut self) -> BenchResult<usize> {
        let link = self.link_mut()?;

        let buffered = link.port.buffer().len();
        link.port.consume(buffered);

        let drained = drain_pending(link.port.get_mut(), Duration::from_millis(20)).await;
        Ok(buffered + drained)
    }

    /// Push out anything still queued for transmission.
    pub async fn reset_out_buffer(&mut self) -> BenchResult<()> {
        let port_name = self.settings.port_name.clone();
        let link = self.link_mut()?;
        link.port
            .get_mut()
            .flush()
            .await
            .map_err(|e| BenchError::transport(&port_name, e))
    }
}

/// Read and discard whatever arrives within `window`.
async fn drain_pending<R: AsyncRead + Unpin>(port: &mut R, window: Duration) -> usize {
    let mut discard = [0u8; 256];
    let deadline = tokio::time::Instant::now() + window;
    let mut total = 0usize;

    loop {
        match tokio::time::timeout_at(deadline, port.read(&mut discard)).await {
            Ok(Ok(0)) => break,
            Ok(Ok(n)) => total += n,
            Ok(Err(_)) | Err(_) => break,
        }
    }

    total
}
