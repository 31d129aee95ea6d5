//! SCPI command/response layer.
//!
//! Thin wrapper over a [`SerialEndpoint`]: [`ScpiProtocol::write`] appends the device
//! terminator, [`ScpiProtocol::ask`] writes and then reads one trimmed line. There is no
//! retry at this level. The helpers below emit the canonical bench-multimeter commands
//! (OWON XDM dialect):
//!
//! | Purpose | Command |
//! |---|---|
//! | identification | `*IDN?` |
//! | mode selection | `CONF:VOLT:DC`, `CONF:VOLT:AC`, `CONF:RES`, ... |
//! | range | `CONF:<function> <range>` / `AUTO` |
//! | rate | `RATE F`, `RATE M`, `RATE L` |
//! | math | `CALC:FUNC NULL|DB|DBM`, `CALC:NULL:OFFS`, `CALC:DB:REF`, `CALC:DBM:REF`, `CALC:STAT` |
//! | continuity threshold | `CONT:THRE <ohms>` |
//! | trigger + read | `MEAS?` |

use crate::error::{BenchError, BenchResult};
use crate::transport::SerialEndpoint;
use tokio::sync::{Mutex, MutexGuard};
use tracing::{debug, instrument};

/// Reading speed of the multimeter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SamplingRate {
    Fast,
    Medium,
    Slow,
}

impl SamplingRate {
    /// Single-letter code used by `RATE`.
    pub fn code(self) -> &'static str {
        match self {
            SamplingRate::Fast => "F",
            SamplingRate::Medium => "M",
            SamplingRate::Slow => "L",
        }
    }
}

impl std::str::FromStr for SamplingRate {
    type Err = BenchError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "F" | "FAST" => Ok(SamplingRate::Fast),
            "M" | "MEDIUM" => Ok(SamplingRate::Medium),
            "L" | "S" | "SLOW" => Ok(SamplingRate::Slow),
            other => Err(BenchError::InvalidConfig(format!(
                "unknown rate '{other}', expected F, M or L"
            ))),
        }
    }
}

/// Math post-processing applied by the multimeter.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum MathFunction {
    Off,
    /// Subtract a fixed offset from every reading.
    Null { offset: f64 },
    /// dB relative to a reference voltage.
    Db { reference_v: f64 },
    /// dBm relative to a reference impedance.
    Dbm { reference_ohm: f64 },
}

impl MathFunction {
    /// Commands that switch the meter to this function, in order.
    pub fn commands(&self) -> Vec<String> {
        match *self {
            MathFunction::Off => vec!["CALC:STAT OFF".to_string()],
            MathFunction::Null { offset } => vec![
                "CALC:FUNC NULL".to_string(),
                format!("CALC:NULL:OFFS {offset}"),
                "CALC:STAT ON".to_string(),
            ],
            MathFunction::Db { reference_v } => vec![
                "CALC:FUNC DB".to_string(),
                format!("CALC:DB:REF {reference_v}"),
                "CALC:STAT ON".to_string(),
            ],
            MathFunction::Dbm { reference_ohm } => vec![
                "CALC:FUNC DBM".to_string(),
                format!("CALC:DBM:REF {reference_ohm}"),
                "CALC:STAT ON".to_string(),
            ],
        }
    }
}

/// `CONF:<function>` with an optional range argument.
pub fn configure_command(function: &str, range: Option<&str>) -> String {
    match range {
        Some(range) => format!("CONF:{function} {range}"),
        None => format!("CONF:{function}"),
    }
}

/// ASCII command/response protocol over one endpoint.
pub struct ScpiProtocol {
    endpoint: Mutex<SerialEndpoint>,
    terminator: String,
}

impl ScpiProtocol {
    /// Protocol with the `\n` terminator.
    pub fn new(endpoint: SerialEndpoint) -> Self {
        Self {
            endpoint: Mutex::new(endpoint),
            terminator: "\n".to_string(),
        }
    }

    pub fn with_terminator(mut self, terminator: impl Into<String>) -> Self {
        self.terminator = terminator.into();
        self
    }

    pub fn terminator(&self) -> &str {
        &self.terminator
    }

    /// Exclusive access to the endpoint for a multi-step exchange.
    pub async fn lock_endpoint(&self) -> MutexGuard<'_, SerialEndpoint> {
        self.endpoint.lock().await
    }

    pub async fn open(&self) -> BenchResult<()> {
        self.endpoint.lock().await.open().await
    }

    pub async fn close(&self) {
        self.endpoint.lock().await.close().await;
    }

    pub async fn is_open(&self) -> bool {
        self.endpoint.lock().await.is_open()
    }

    /// Send `cmd` followed by the terminator.
    pub async fn write(&self, cmd: &str) -> BenchResult<()> {
        let mut ep = self.endpoint.lock().await;
        self.write_locked(&mut ep, cmd).await
    }

    async fn write_locked(&self, ep: &mut SerialEndpoint, cmd: &str) -> BenchResult<()> {
        debug!(port = %ep.port_name(), cmd, "SCPI write");
        let frame = format!("{cmd}{}", self.terminator);
        ep.write(frame.as_bytes()).await?;
        Ok(())
    }

    /// Send `cmd` and return the next response line with surrounding whitespace removed.
    pub async fn ask(&self, cmd: &str) -> BenchResult<String> {
        let mut ep = self.endpoint.lock().await;
        self.write_locked(&mut ep, cmd).await?;
        let line = ep.read_line_required().await?;
        let response = String::from_utf8_lossy(&line).trim().to_string();
        debug!(port = %ep.port_name(), cmd, response = %response, "SCPI response");
        Ok(response)
    }

    /// `*IDN?`
    #[instrument(skip(self), err)]
    pub async fn identify(&self) -> BenchResult<String> {
        self.ask("*IDN?").await
    }

    /// `*RST`
    pub async fn reset(&self) -> BenchResult<()> {
        self.write("*RST").await
    }

    /// `SYST:REM` / `SYST:LOC`
    pub async fn set_remote(&self, remote: bool) -> BenchResult<()> {
        self.write(if remote { "SYST:REM" } else { "SYST:LOC" }).await
    }

    /// `CONF:<function> [range]`
    pub async fn configure(&self, function: &str, range: Option<&str>) -> BenchResult<()> {
        self.write(&configure_command(function, range)).await
    }

    /// `AUTO`
    pub async fn auto_range(&self) -> BenchResult<()> {
        self.write("AUTO").await
    }

    /// `RATE F|M|L`
    pub async fn set_rate(&self, rate: SamplingRate) -> BenchResult<()> {
        self.write(&format!("RATE {}", rate.code())).await
    }

    pub async fn set_math(&self, function: MathFunction) -> BenchResult<()> {
        for cmd in function.commands() {
            self.write(&cmd).await?;
        }
        Ok(())
    }

    /// `CONT:THRE <ohms>`
    pub async fn set_continuity_threshold(&self, ohms: f64) -> BenchResult<()> {
        if !(ohms > 0.0) {
            return Err(BenchError::InvalidConfig(format!(
                "continuity threshold must be positive, got {ohms}"
            )));
        }
        self.write(&format!("CONT:THRE {ohms}")).await
    }

    /// Trigger a reading in the current function and return the raw token.
    pub async fn read_value(&self) -> BenchResult<String> {
        self.ask("MEAS?").await
    }
}
