//! OWON SPE-series programmable DC supply.
//!
//! Plain SCPI at 115200 baud: `VOLT`/`CURR` set the limits, `OUTP` switches the output,
//! `MEAS:VOLT?`, `MEAS:CURR?` and `MEAS:POW?` read back what the output is doing.

use super::scpi::ScpiProtocol;
use crate::error::{BenchError, BenchResult};
use crate::transport::SerialEndpoint;
use tracing::instrument;

pub const DEFAULT_BAUD: u32 = 115_200;

/// Voltage and current measured at the output terminals.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct OutputReading {
    pub voltage_v: f64,
    pub current_a: f64,
}

impl OutputReading {
    pub fn power_w(&self) -> f64 {
        self.voltage_v * self.current_a
    }
}

/// Driver for one supply.
pub struct PowerSupply {
    scpi: ScpiProtocol,
}

impl PowerSupply {
    pub fn new(endpoint: SerialEndpoint) -> Self {
        Self {
            scpi: ScpiProtocol::new(endpoint),
        }
    }

    pub async fn open(&self) -> BenchResult<()> {
        self.scpi.open().await
    }

    pub async fn close(&self) {
        self.scpi.close().await;
    }

    pub async fn identify(&self) -> BenchResult<String> {
        self.scpi.identify().await
    }

    /// Voltage setpoint in volts.
    #[instrument(skip(self), err)]
    pub async fn set_voltage(&self, volts: f64) -> BenchResult<()> {
        check_setpoint("voltage", volts)?;
        self.scpi.write(&format!("VOLT {volts:.3}")).await
    }

    /// Current limit in amperes.
    #[instrument(skip(self), err)]
    pub async fn set_current_limit(&self, amps: f64) -> BenchResult<()> {
        check_setpoint("current", amps)?;
        self.scpi.write(&format!("CURR {amps:.3}")).await
    }

    pub async fn set_output(&self, on: bool) -> BenchResult<()> {
        self.scpi
            .write(if on { "OUTP ON" } else { "OUTP OFF" })
            .await
    }

    pub async fn output_enabled(&self) -> BenchResult<bool> {
        let reply = self.scpi.ask("OUTP?").await?;
        match reply.to_ascii_uppercase().as_str() {
            "1" | "ON" => Ok(true),
            "0" | "OFF" => Ok(false),
            _ => Err(BenchError::Protocol(format!("OUTP?: unexpected reply '{reply}'"))),
        }
    }

    pub async fn measure_voltage(&self) -> BenchResult<f64> {
        self.ask_number("MEAS:VOLT?").await
    }

    pub async fn measure_current(&self) -> BenchResult<f64> {
        self.ask_number("MEAS:CURR?").await
    }

    pub async fn measure_power(&self) -> BenchResult<f64> {
        self.ask_number("MEAS:POW?").await
    }

    pub async fn measure(&self) -> BenchResult<OutputReading> {
        Ok(OutputReading {
            voltage_v: self.measure_voltage().await?,
            current_a: self.measure_current().await?,
        })
    }

    async fn ask_number(&self, cmd: &str) -> BenchResult<f64> {
        let reply = self.scpi.ask(cmd).await?;
        reply
            .parse::<f64>()
            .map_err(|_| BenchError::Protocol(format!("{cmd}: unexpected reply '{reply}'")))
    }
}

fn check_setpoint(what: &str, value: f64) -> BenchResult<()> {
    if value.is_finite() && value >= 0.0 {
        Ok(())
    } else {
        Err(BenchError::InvalidConfig(format!(
            "{what} setpoint must be >= 0, got {value}"
        )))
    }
}
