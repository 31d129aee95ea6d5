//! SCPI bench multimeter (OWON XDM series).

use super::{MeasurementMode, Reading};
use crate::error::{BenchError, BenchResult};
use crate::hardware::capabilities::MeasurementSource;
use crate::protocol::scpi::{MathFunction, SamplingRate, ScpiProtocol};
use crate::transport::SerialEndpoint;
use async_trait::async_trait;
use tokio::sync::RwLock;
use tracing::{debug, instrument, warn};

/// Mode-aware multimeter.
pub struct Multimeter {
    scpi: ScpiProtocol,
    mode: RwLock<MeasurementMode>,
}

impl Multimeter {
    pub const DEFAULT_BAUD: u32 = 115_200;

    pub fn new(endpoint: SerialEndpoint) -> Self {
        Self::from_protocol(ScpiProtocol::new(endpoint))
    }

    pub fn from_protocol(scpi: ScpiProtocol) -> Self {
        Self {
            scpi,
            mode: RwLock::new(MeasurementMode::default()),
        }
    }

    pub fn protocol(&self) -> &ScpiProtocol {
        &self.scpi
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

    /// Ranges offered in `mode`, smallest first.
    pub fn ranges_for(mode: MeasurementMode) -> &'static [&'static str] {
        mode.ranges()
    }

    /// Select a manual range of the current mode, or auto-range with `None`.
    #[instrument(skip(self), err)]
    pub async fn set_range(&self, range: Option<&str>) -> BenchResult<()> {
        let mode = *self.mode.read().await;
        match range {
            None => self.scpi.auto_range().await,
            Some(label) => {
                if !mode.ranges().contains(&label) {
                    return Err(BenchError::InvalidConfig(format!(
                        "range '{label}' is not available in mode {mode}"
                    )));
                }
                self.scpi
                    .configure(mode.scpi_function(), Some(label))
                    .await
            }
        }
    }

    pub async fn set_rate(&self, rate: SamplingRate) -> BenchResult<()> {
        self.scpi.set_rate(rate).await
    }

    pub async fn set_math(&self, function: MathFunction) -> BenchResult<()> {
        self.scpi.set_math(function).await
    }

    pub async fn set_continuity_threshold(&self, ohms: f64) -> BenchResult<()> {
        self.scpi.set_continuity_threshold(ohms).await
    }

    pub async fn reset(&self) -> BenchResult<()> {
        self.scpi.reset().await?;
        *self.mode.write().await = MeasurementMode::default();
        Ok(())
    }

    /// Hand the front panel back to the user.
    pub async fn go_local(&self) -> BenchResult<()> {
        self.scpi.set_remote(false).await
    }
}

#[async_trait]
impl MeasurementSource for Multimeter {
    #[instrument(skip(self), err)]
    async fn set_mode(&self, mode: MeasurementMode) -> BenchResult<()> {
        let mut current = self.mode.write().await;
        self.scpi.configure(mode.scpi_function(), None).await?;
        *current = mode;
        debug!(%mode, "Multimeter mode set");
        Ok(())
    }

    async fn current_mode(&self) -> MeasurementMode {
        *self.mode.read().await
    }

    async fn measure(&self) -> BenchResult<Reading> {
        let mode = *self.mode.read().await;
        let raw = self.scpi.read_value().await?;
        let reading = Reading::parse(mode, &raw);
        if !reading.is_valid() {
            warn!(%mode, raw = %reading.raw, "Non-numeric multimeter reply");
        }
        Ok(reading)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::loopback::LoopbackOpener;
    use crate::transport::SerialSettings;
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    fn meter(port: &str, reply: &'static str) -> (Multimeter, Arc<Mutex<Vec<String>>>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let log = seen.clone();
        let opener = LoopbackOpener::new();
        opener.register_line_device(port, None, move |cmd| {
            log.lock().unwrap().push(cmd.to_string());
            (cmd == "MEAS?").then(|| format!("{reply}\n"))
        });
        let settings = SerialSettings::new(port, Multimeter::DEFAULT_BAUD)
            .with_timeout(Duration::from_millis(100));
        (Multimeter::new(SerialEndpoint::new(settings, Arc::new(opener))), seen)
    }

    #[tokio::test]
    async fn set_mode_sends_configuration() {
        let (dmm, seen) = meter("dmm-mode", "0");
        dmm.open().await.unwrap();

        dmm.set_mode(MeasurementMode::VoltAc).await.unwrap();
        assert_eq!(dmm.current_mode().await, MeasurementMode::VoltAc);
        dmm.set_mode(MeasurementMode::TempRtd).await.unwrap();
        assert_eq!(dmm.current_mode().await, MeasurementMode::TempRtd);

        assert_eq!(*seen.lock().unwrap(), vec!["CONF:VOLT:AC", "CONF:TEMP:RTD"]);
    }

    #[tokio::test]
    async fn measure_parses_value_and_unit() {
        let (dmm, _) = meter("dmm-measure", "+7.07106E-01");
        dmm.open().await.unwrap();
        dmm.set_mode(MeasurementMode::VoltAc).await.unwrap();

        let reading = dmm.measure().await.unwrap();
        assert!((reading.value - 0.707106).abs() < 1e-9);
        assert_eq!(reading.unit, "V");
        assert_eq!(reading.raw, "+7.07106E-01");
    }

    #[tokio::test]
    async fn unparsable_reply_is_nan_in_current_unit() {
        let (dmm, _) = meter("dmm-nan", "OVLD");
        dmm.open().await.unwrap();
        dmm.set_mode(MeasurementMode::Res).await.unwrap();

        let reading = dmm.measure().await.unwrap();
        assert!(reading.value.is_nan());
        assert_eq!(reading.unit, "Ω");
        assert_eq!(reading.raw, "OVLD");
    }

    #[tokio::test]
    async fn ranges_are_checked_against_mode() {
        let (dmm, seen) = meter("dmm-range", "0");
        dmm.open().await.unwrap();
        dmm.set_mode(MeasurementMode::Res).await.unwrap();

        dmm.set_range(Some("5K")).await.unwrap();
        dmm.set_range(None).await.unwrap();
        assert!(matches!(
            dmm.set_range(Some("5V")).await,
            Err(BenchError::InvalidConfig(_))
        ));
        dmm.set_rate(SamplingRate::Slow).await.unwrap();

        assert_eq!(
            *seen.lock().unwrap(),
            vec!["CONF:RES", "CONF:RES 5K", "AUTO", "RATE L"]
        );
        assert!(Multimeter::ranges_for(MeasurementMode::Freq).is_empty());
    }

    #[tokio::test]
    async fn closed_port_reports_not_open() {
        let (dmm, _) = meter("dmm-closed", "0");
        assert!(matches!(dmm.measure().await, Err(BenchError::NotOpen(_))));
        assert_eq!(dmm.current_mode().await, MeasurementMode::VoltDc);
    }
}
