//! FeelTech FY6900 / FY6800 arbitrary waveform generator driver
//!
//! Protocol Overview:
//! - Format: ASCII frames, three-letter opcode + argument, NOT SCPI
//! - Baud: 115200, 8N1, no flow control
//! - Terminator: LF (\n)
//! - Every write frame is acknowledged by the generator with an empty line
//! - Channel 1 frames use the `WM*`/`RM*` opcodes, channel 2 the `WF*`/`RF*` ones
//!
//! | Operation | Channel 1 | Channel 2 | Argument |
//! |---|---|---|---|
//! | waveform | `WMW` | `WFW` | waveform code, two digits |
//! | frequency | `WMF` | `WFF` | micro-hertz, 14 digits zero padded |
//! | amplitude | `WMA` | `WFA` | volts peak-to-peak |
//! | offset | `WMO` | `WFO` | volts |
//! | output | `WMN` | `WFN` | `1` on, `0` off |
//! | read output / frequency / amplitude / waveform | `RMN` `RMF` `RMA` `RMW` | `RFN` `RFF` `RFA` `RFW` | none |
//! | model | `UMO` | | none |
//!
//! Amplitudes cross the API as peak volts; the frame carries twice that value.

use super::Channel;
use crate::error::{BenchError, BenchResult};
use crate::hardware::capabilities::SignalSource;
use crate::transport::SerialEndpoint;
use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::{debug, instrument};

/// Baud rate used by the FY6900 family.
pub const DEFAULT_BAUD: u32 = 115_200;

/// Highest frequency the FY6900-60M can produce.
pub const MAX_FREQUENCY_HZ: f64 = 60e6;

/// Model query, used by detection.
pub const MODEL_QUERY: &str = "UMO";

fn set_prefix(channel: Channel) -> &'static str {
    match channel {
        Channel::One => "WM",
        Channel::Two => "WF",
    }
}

fn read_prefix(channel: Channel) -> &'static str {
    match channel {
        Channel::One => "RM",
        Channel::Two => "RF",
    }
}

/// Built-in waveforms, in the generator's numbering.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Waveform {
    Sine,
    Square,
    Rectangle,
    Trapezoid,
    Cmos,
    AdjustablePulse,
    Dc,
    Triangle,
    Ramp,
    NegativeRamp,
}

impl Waveform {
    pub const ALL: [Waveform; 10] = [
        Waveform::Sine,
        Waveform::Square,
        Waveform::Rectangle,
        Waveform::Trapezoid,
        Waveform::Cmos,
        Waveform::AdjustablePulse,
        Waveform::Dc,
        Waveform::Triangle,
        Waveform::Ramp,
        Waveform::NegativeRamp,
    ];

    pub fn code(self) -> u8 {
        match self {
            Waveform::Sine => 0,
            Waveform::Square => 1,
            Waveform::Rectangle => 2,
            Waveform::Trapezoid => 3,
            Waveform::Cmos => 4,
            Waveform::AdjustablePulse => 5,
            Waveform::Dc => 6,
            Waveform::Triangle => 7,
            Waveform::Ramp => 8,
            Waveform::NegativeRamp => 9,
        }
    }

    pub fn from_code(code: u8) -> Option<Self> {
        Self::ALL.into_iter().find(|w| w.code() == code)
    }
}

impl std::str::FromStr for Waveform {
    type Err = BenchError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "sine" | "sin" => Ok(Waveform::Sine),
            "square" => Ok(Waveform::Square),
            "rectangle" => Ok(Waveform::Rectangle),
            "trapezoid" => Ok(Waveform::Trapezoid),
            "cmos" => Ok(Waveform::Cmos),
            "pulse" => Ok(Waveform::AdjustablePulse),
            "dc" => Ok(Waveform::Dc),
            "triangle" => Ok(Waveform::Triangle),
            "ramp" => Ok(Waveform::Ramp),
            "negramp" => Ok(Waveform::NegativeRamp),
            other => Err(BenchError::InvalidConfig(format!("unknown waveform '{other}'"))),
        }
    }
}

/// Frequency frame argument: micro-hertz, 14 digits.
pub fn format_frequency(hz: f64) -> String {
    let micro_hz = (hz * 1e6).round() as u64;
    format!("{micro_hz:014}")
}

fn check_non_negative(what: &str, value: f64) -> BenchResult<()> {
    if value.is_finite() && value >= 0.0 {
        Ok(())
    } else {
        Err(BenchError::InvalidConfig(format!(
            "{what} must be a finite value >= 0, got {value}"
        )))
    }
}

/// Driver for one FY6900 generator.
pub struct Fy6900 {
    endpoint: Mutex<SerialEndpoint>,
}

impl Fy6900 {
    pub fn new(endpoint: SerialEndpoint) -> Self {
        Self {
            endpoint: Mutex::new(endpoint),
        }
    }

    pub async fn open(&self) -> BenchResult<()> {
        self.endpoint.lock().await.open().await
    }

    pub async fn close(&self) {
        self.endpoint.lock().await.close().await;
    }

    /// Send a write frame and swallow the generator's empty acknowledgement line.
    async fn send(&self, frame: &str) -> BenchResult<()> {
        let mut ep = self.endpoint.lock().await;
        debug!(port = %ep.port_name(), frame, "FY6900 write");
        ep.write(format!("{frame}\n").as_bytes()).await?;
        let _ack = ep.read_line().await?;
        Ok(())
    }

    async fn query(&self, frame: &str) -> BenchResult<String> {
        let mut ep = self.endpoint.lock().await;
        ep.write(format!("{frame}\n").as_bytes()).await?;
        let line = ep.read_line_required().await?;
        Ok(String::from_utf8_lossy(&line).trim().to_string())
    }

    async fn query_number(&self, frame: &str) -> BenchResult<f64> {
        let response = self.query(frame).await?;
        response
            .parse::<f64>()
            .map_err(|_| BenchError::Protocol(format!("{frame}: unexpected reply '{response}'")))
    }

    /// Model string, e.g. `FY6900-60M`.
    #[instrument(skip(self), err)]
    pub async fn model(&self) -> BenchResult<String> {
        self.query(MODEL_QUERY).await
    }

    pub async fn set_waveform(&self, channel: Channel, waveform: Waveform) -> BenchResult<()> {
        self.send(&format!("{}W{:02}", set_prefix(channel), waveform.code()))
            .await
    }

    /// Set the output frequency in hertz.
    #[instrument(skip(self), err)]
    pub async fn set_frequency(&self, channel: Channel, hz: f64) -> BenchResult<()> {
        check_non_negative("frequency", hz)?;
        if hz > MAX_FREQUENCY_HZ {
            return Err(BenchError::InvalidConfig(format!(
                "frequency {hz} Hz exceeds the generator's {MAX_FREQUENCY_HZ} Hz"
            )));
        }
        self.send(&format!("{}F{}", set_prefix(channel), format_frequency(hz)))
            .await
    }

    /// Set the peak amplitude in volts.
    #[instrument(skip(self), err)]
    pub async fn set_amplitude(&self, channel: Channel, peak_v: f64) -> BenchResult<()> {
        check_non_negative("amplitude", peak_v)?;
        self.send(&format!("{}A{:.4}", set_prefix(channel), 2.0 * peak_v))
            .await
    }

    /// Set the DC offset in volts.
    pub async fn set_offset(&self, channel: Channel, volts: f64) -> BenchResult<()> {
        if !volts.is_finite() {
            return Err(BenchError::InvalidConfig(format!(
                "offset must be finite, got {volts}"
            )));
        }
        self.send(&format!("{}O{:.3}", set_prefix(channel), volts))
            .await
    }

    pub async fn set_output(&self, channel: Channel, on: bool) -> BenchResult<()> {
        self.send(&format!(
            "{}N{}",
            set_prefix(channel),
            if on { 1 } else { 0 }
        ))
        .await
    }

    /// Whether the channel output is enabled. Firmware answers `0` for off and a non-zero
    /// value (`1` or `255`) for on.
    pub async fn output_enabled(&self, channel: Channel) -> BenchResult<bool> {
        let state = self
            .query_number(&format!("{}N", read_prefix(channel)))
            .await?;
        Ok(state != 0.0)
    }

    /// Frequency read-back in hertz.
    pub async fn frequency(&self, channel: Channel) -> BenchResult<f64> {
        self.query_number(&format!("{}F", read_prefix(channel)))
            .await
    }

    /// Amplitude read-back, peak volts.
    pub async fn amplitude(&self, channel: Channel) -> BenchResult<f64> {
        let vpp = self
            .query_number(&format!("{}A", read_prefix(channel)))
            .await?;
        Ok(vpp / 2.0)
    }

    pub async fn waveform(&self, channel: Channel) -> BenchResult<Waveform> {
        let code = self
            .query_number(&format!("{}W", read_prefix(channel)))
            .await?;
        if !(0.0..=255.0).contains(&code) || code.fract() != 0.0 {
            return Err(BenchError::Protocol(format!("invalid waveform code {code}")));
        }
        Waveform::from_code(code as u8)
            .ok_or_else(|| BenchError::Protocol(format!("unknown waveform code {code}")))
    }
}

#[async_trait]
impl SignalSource for Fy6900 {
    async fn set_waveform(&self, channel: Channel, waveform: Waveform) -> BenchResult<()> {
        Fy6900::set_waveform(self, channel, waveform).await
    }

    async fn set_frequency(&self, channel: Channel, hz: f64) -> BenchResult<()> {
        Fy6900::set_frequency(self, channel, hz).await
    }

    async fn set_amplitude(&self, channel: Channel, peak_v: f64) -> BenchResult<()> {
        Fy6900::set_amplitude(self, channel, peak_v).await
    }

    async fn set_output(&self, channel: Channel, on: bool) -> BenchResult<()> {
        Fy6900::set_output(self, channel, on).await
    }

    async fn output_enabled(&self, channel: Channel) -> BenchResult<bool> {
        Fy6900::output_enabled(self, channel).await
    }

    fn max_frequency_hz(&self) -> f64 {
        MAX_FREQUENCY_HZ
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::loopback::LoopbackOpener;
    use crate::transport::SerialSettings;
    use std::sync::{Arc, Mutex as StdMutex};
    use std::time::Duration;

    fn generator(port: &str) -> (Fy6900, Arc<StdMutex<Vec<String>>>) {
        let frames = Arc::new(StdMutex::new(Vec::new()));
        let seen = frames.clone();
        let opener = LoopbackOpener::new();
        opener.register_line_device(port, Some(DEFAULT_BAUD), move |frame| {
            seen.lock().unwrap().push(frame.to_string());
            Some(match frame {
                "UMO" => "FY6900-60M\n".to_string(),
                "RMN" => "255\n".to_string(),
                "RFN" => "0\n".to_string(),
                "RMF" => "1000.000000\n".to_string(),
                "RMA" => "2.8284\n".to_string(),
                "RMW" => "7\n".to_string(),
                "RFW" => "42\n".to_string(),
                _ => "\n".to_string(),
            })
        });
        let settings =
            SerialSettings::new(port, DEFAULT_BAUD).with_timeout(Duration::from_millis(100));
        (Fy6900::new(SerialEndpoint::new(settings, Arc::new(opener))), frames)
    }

    #[test]
    fn frequency_frame_is_micro_hertz() {
        assert_eq!(format_frequency(1000.0), "00001000000000");
        assert_eq!(format_frequency(0.5), "00000000500000");
        assert_eq!(format_frequency(0.0), "00000000000000");
    }

    #[test]
    fn waveform_codes_round_trip() {
        for w in Waveform::ALL {
            assert_eq!(Waveform::from_code(w.code()), Some(w));
        }
        assert_eq!(Waveform::from_code(10), None);
        assert_eq!("sine".parse::<Waveform>().unwrap(), Waveform::Sine);
    }

    #[tokio::test]
    async fn write_frames_per_channel() {
        let (gen, frames) = generator("fy-frames");
        gen.open().await.unwrap();

        gen.set_waveform(Channel::One, Waveform::Sine).await.unwrap();
        gen.set_frequency(Channel::One, 1000.0).await.unwrap();
        gen.set_amplitude(Channel::Two, 1.5).await.unwrap();
        gen.set_offset(Channel::Two, -0.25).await.unwrap();
        gen.set_output(Channel::One, true).await.unwrap();

        assert_eq!(
            *frames.lock().unwrap(),
            vec!["WMW00", "WMF00001000000000", "WFA3.0000", "WFO-0.250", "WMN1"]
        );
    }

    #[tokio::test]
    async fn read_backs() {
        let (gen, _) = generator("fy-reads");
        gen.open().await.unwrap();

        assert_eq!(gen.model().await.unwrap(), "FY6900-60M");
        assert!(gen.output_enabled(Channel::One).await.unwrap());
        assert!(!gen.output_enabled(Channel::Two).await.unwrap());
        assert_eq!(gen.frequency(Channel::One).await.unwrap(), 1000.0);
        assert!((gen.amplitude(Channel::One).await.unwrap() - 1.4142).abs() < 1e-9);
        assert_eq!(gen.waveform(Channel::One).await.unwrap(), Waveform::Triangle);
        assert!(matches!(
            gen.waveform(Channel::Two).await,
            Err(BenchError::Protocol(_))
        ));
    }

    #[tokio::test]
    async fn rejects_out_of_range_values_before_io() {
        let (gen, frames) = generator("fy-range");
        gen.open().await.unwrap();

        assert!(gen.set_frequency(Channel::One, -1.0).await.is_err());
        assert!(gen.set_frequency(Channel::One, 1e9).await.is_err());
        assert!(gen.set_amplitude(Channel::One, f64::NAN).await.is_err());
        assert!(frames.lock().unwrap().is_empty());
    }
}
