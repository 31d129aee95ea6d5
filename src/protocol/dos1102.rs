//! OWON DOS1102 two-channel oscilloscope
//!
//! SCPI dialect over the scope's USB-serial link (115200 8N1, LF terminated). Settings
//! are write-only commands; measurements are single-line queries; waveform dumps and the
//! screen header come back as length-prefixed binary blocks.
//!
//! Block framing seen on the wire:
//! - IEEE 488.2 definite length: `#` + one digit `n` + `n` ASCII digits of length + payload
//! - raw: 4-byte little-endian length + payload (screen header, newer firmware dumps)
//!
//! Vertical scales below 1 V are written in millivolts with an integer mantissa when
//! possible (`500mV`, `2mV`), larger ones in volts (`1V`, `2.5V`).

use super::scpi::ScpiProtocol;
use super::Channel;
use crate::error::{BenchError, BenchResult};
use crate::transport::SerialEndpoint;
use std::fmt;
use tracing::{debug, instrument};

/// Vertical input coupling.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Coupling {
    Dc,
    Ac,
    Gnd,
}

impl Coupling {
    fn mnemonic(self) -> &'static str {
        match self {
            Coupling::Dc => "DC",
            Coupling::Ac => "AC",
            Coupling::Gnd => "GND",
        }
    }
}

/// Probe attenuation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeFactor {
    X1,
    X10,
    X100,
    X1000,
}

impl ProbeFactor {
    pub fn factor(self) -> u32 {
        match self {
            ProbeFactor::X1 => 1,
            ProbeFactor::X10 => 10,
            ProbeFactor::X100 => 100,
            ProbeFactor::X1000 => 1000,
        }
    }
}

/// Acquisition mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Acquisition {
    Sample,
    Peak,
    Average,
}

impl Acquisition {
    fn mnemonic(self) -> &'static str {
        match self {
            Acquisition::Sample => "SAMP",
            Acquisition::Peak => "PEAK",
            Acquisition::Average => "AVE",
        }
    }
}

/// Single trigger or alternate between channels.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerType {
    Single,
    Alternate,
}

/// What the trigger fires on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerMode {
    Edge,
    Video,
}

/// Automatic measurements offered per channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MeasureType {
    Frequency,
    Period,
    Average,
    PeakToPeak,
    Max,
    Min,
    Top,
    Base,
    Amplitude,
    CycleRms,
    RiseTime,
    FallTime,
    PositiveDuty,
}

impl MeasureType {
    pub fn mnemonic(self) -> &'static str {
        match self {
            MeasureType::Frequency => "FREQ",
            MeasureType::Period => "PER",
            MeasureType::Average => "AVER",
            MeasureType::PeakToPeak => "PKPK",
            MeasureType::Max => "MAX",
            MeasureType::Min => "MIN",
            MeasureType::Top => "VTOP",
            MeasureType::Base => "VBAS",
            MeasureType::Amplitude => "VAMP",
            MeasureType::CycleRms => "CRMS",
            MeasureType::RiseTime => "RTIM",
            MeasureType::FallTime => "FTIM",
            MeasureType::PositiveDuty => "PDUT",
        }
    }
}

impl fmt::Display for MeasureType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.mnemonic())
    }
}

/// One automatic measurement: the scope's reply and its value in base SI units.
#[derive(Debug, Clone, PartialEq)]
pub struct ScopeMeasurement {
    pub raw: String,
    pub value: Option<f64>,
}

fn trim_number(value: f64) -> String {
    if (value - value.round()).abs() < 1e-9 {
        format!("{}", value.round() as i64)
    } else {
        let s = format!("{value:.3}");
        s.trim_end_matches('0').trim_end_matches('.').to_string()
    }
}

/// Vertical scale argument: millivolts below 1 V, volts otherwise.
pub fn format_volts_per_div(volts: f64) -> String {
    if volts < 1.0 {
        format!("{}mV", trim_number(volts * 1e3))
    } else {
        format!("{}V", trim_number(volts))
    }
}

/// Time-base argument with the largest unit keeping the mantissa >= 1.
pub fn format_time_per_div(seconds: f64) -> String {
    let (scaled, unit) = if seconds >= 1.0 {
        (seconds, "s")
    } else if seconds >= 1e-3 {
        (seconds * 1e3, "ms")
    } else if seconds >= 1e-6 {
        (seconds * 1e6, "us")
    } else {
        (seconds * 1e9, "ns")
    };
    format!("{}{unit}", trim_number(scaled))
}

/// Parse a measurement reply such as `2.04V`, `Vpp=2.04V`, `1.000kHz` or `500.0us`.
///
/// Returns `None` for placeholders like `?` or `****`.
pub fn parse_measurement(reply: &str) -> Option<f64> {
    let text = reply.rsplit('=').next().unwrap_or(reply).trim();
    let end = text
        .char_indices()
        .find(|(_, c)| !(c.is_ascii_digit() || matches!(c, '.' | '-' | '+' | 'e' | 'E')))
        .map_or(text.len(), |(i, _)| i);

    // A trailing 'e'/'E' belongs to the unit, not an exponent.
    let mut number = &text[..end];
    while number.ends_with(['e', 'E']) {
        number = &number[..number.len() - 1];
    }
    let value: f64 = number.parse().ok()?;

    let suffix = text[number.len()..].trim_start();
    let scale = match suffix.chars().next() {
        Some('n') => 1e-9,
        Some('u') | Some('µ') => 1e-6,
        Some('m') => 1e-3,
        Some('k') | Some('K') => 1e3,
        Some('M') => 1e6,
        Some('G') => 1e9,
        _ => 1.0,
    };
    Some(value * scale)
}

/// Largest block accepted from the scope. Full-memory waveform dumps stay well below it.
pub const MAX_BLOCK_LEN: usize = 4 * 1024 * 1024;

/// Split a complete block into `(payload, remainder)`.
pub fn split_block(bytes: &[u8]) -> BenchResult<(&[u8], &[u8])> {
    let (header, len) = block_header(bytes)?;
    let end = header + len;
    if bytes.len() < end {
        return Err(BenchError::Protocol(format!(
            "block declares {len} bytes, only {} present",
            bytes.len() - header
        )));
    }
    Ok((&bytes[header..end], &bytes[end..]))
}

// Returns (header length, payload length).
fn block_header(bytes: &[u8]) -> BenchResult<(usize, usize)> {
    let (header, len) = match bytes {
        [b'#', digit, rest @ ..] => {
            let n = char::from(*digit)
                .to_digit(10)
                .filter(|n| *n > 0)
                .ok_or_else(|| BenchError::Protocol("invalid block length digit".into()))?
                as usize;
            let digits = rest
                .get(..n)
                .ok_or_else(|| BenchError::Protocol("truncated block header".into()))?;
            let len = std::str::from_utf8(digits)
                .ok()
                .and_then(|s| s.parse::<usize>().ok())
                .ok_or_else(|| BenchError::Protocol("invalid block length".into()))?;
            Ok((2 + n, len))
        }
        [a, b, c, d, ..] => Ok((4, u32::from_le_bytes([*a, *b, *c, *d]) as usize)),
        _ => Err(BenchError::Protocol("truncated block header".into())),
    }?;
    if len > MAX_BLOCK_LEN {
        return Err(BenchError::Protocol(format!(
            "block declares {len} bytes, limit is {MAX_BLOCK_LEN}"
        )));
    }
    Ok((header, len))
}

/// DOS1102 driver.
pub struct Dos1102 {
    scpi: ScpiProtocol,
}

impl Dos1102 {
    pub const DEFAULT_BAUD: u32 = 115_200;

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

    pub async fn set_coupling(&self, channel: Channel, coupling: Coupling) -> BenchResult<()> {
        self.scpi
            .write(&format!(":{channel}:COUP {}", coupling.mnemonic()))
            .await
    }

    /// Vertical scale in volts per division.
    pub async fn set_volts_per_div(&self, channel: Channel, volts: f64) -> BenchResult<()> {
        if !(volts > 0.0 && volts.is_finite()) {
            return Err(BenchError::InvalidConfig(format!(
                "vertical scale must be > 0, got {volts}"
            )));
        }
        self.scpi
            .write(&format!(":{channel}:SCAL {}", format_volts_per_div(volts)))
            .await
    }

    /// Trace position in divisions from center.
    pub async fn set_position(&self, channel: Channel, divisions: f64) -> BenchResult<()> {
        self.scpi
            .write(&format!(":{channel}:POS {divisions}"))
            .await
    }

    pub async fn set_offset(&self, channel: Channel, volts: f64) -> BenchResult<()> {
        self.scpi.write(&format!(":{channel}:OFFS {volts}")).await
    }

    pub async fn set_probe(&self, channel: Channel, probe: ProbeFactor) -> BenchResult<()> {
        self.scpi
            .write(&format!(":{channel}:PROB {}X", probe.factor()))
            .await
    }

    pub async fn set_invert(&self, channel: Channel, invert: bool) -> BenchResult<()> {
        self.scpi
            .write(&format!(":{channel}:INV {}", on_off(invert)))
            .await
    }

    pub async fn set_display(&self, channel: Channel, visible: bool) -> BenchResult<()> {
        self.scpi
            .write(&format!(":{channel}:DISP {}", on_off(visible)))
            .await
    }

    /// Time base in seconds per division.
    pub async fn set_time_per_div(&self, seconds: f64) -> BenchResult<()> {
        if !(seconds > 0.0 && seconds.is_finite()) {
            return Err(BenchError::InvalidConfig(format!(
                "time base must be > 0, got {seconds}"
            )));
        }
        self.scpi
            .write(&format!(":HOR:SCAL {}", format_time_per_div(seconds)))
            .await
    }

    /// Horizontal offset in divisions.
    pub async fn set_horizontal_offset(&self, divisions: f64) -> BenchResult<()> {
        self.scpi.write(&format!(":HOR:OFFS {divisions}")).await
    }

    pub async fn set_acquisition(&self, mode: Acquisition) -> BenchResult<()> {
        self.scpi
            .write(&format!(":ACQ:MODE {}", mode.mnemonic()))
            .await
    }

    pub async fn set_trigger_type(&self, kind: TriggerType) -> BenchResult<()> {
        let mnemonic = match kind {
            TriggerType::Single => "SING",
            TriggerType::Alternate => "ALT",
        };
        self.scpi.write(&format!(":TRIG:TYPE {mnemonic}")).await
    }

    pub async fn set_trigger_mode(&self, mode: TriggerMode) -> BenchResult<()> {
        let mnemonic = match mode {
            TriggerMode::Edge => "EDGE",
            TriggerMode::Video => "VID",
        };
        self.scpi.write(&format!(":TRIG:SING:MODE {mnemonic}")).await
    }

    pub async fn set_trigger_source(&self, channel: Channel) -> BenchResult<()> {
        self.scpi
            .write(&format!(":TRIG:SING:EDGE:SOUR {channel}"))
            .await
    }

    /// Edge trigger level in volts.
    pub async fn set_trigger_level(&self, volts: f64) -> BenchResult<()> {
        self.scpi
            .write(&format!(":TRIG:SING:EDGE:LEV {volts}"))
            .await
    }

    /// One automatic measurement on `channel`.
    #[instrument(skip(self), err)]
    pub async fn measure(
        &self,
        channel: Channel,
        kind: MeasureType,
    ) -> BenchResult<ScopeMeasurement> {
        let raw = self
            .scpi
            .ask(&format!(":MEAS:{channel}:{}?", kind.mnemonic()))
            .await?;
        let value = parse_measurement(&raw);
        Ok(ScopeMeasurement { raw, value })
    }

    /// Every measurement currently shown, as the scope formats it.
    pub async fn measure_all(&self) -> BenchResult<String> {
        self.scpi.ask(":MEAS?").await
    }

    /// Raw waveform dump of all channels.
    pub async fn waveform_data(&self) -> BenchResult<Vec<u8>> {
        self.query_block(":WAV:DATA:ALL?").await
    }

    /// Screen header: time base, channel settings and sample count as JSON.
    pub async fn screen_header(&self) -> BenchResult<serde_json::Value> {
        let payload = self.query_block(":DATA:WAVE:SCREen:HEAD?").await?;
        Ok(serde_json::from_slice(&payload)?)
    }

    async fn query_block(&self, cmd: &str) -> BenchResult<Vec<u8>> {
        let mut ep = self.scpi.lock_endpoint().await;
        ep.write(format!("{cmd}{}", self.scpi.terminator()).as_bytes())
            .await?;

        let mut prefix = ep.read_exact(2).await?;
        if prefix[0] == b'#' {
            let n = char::from(prefix[1]).to_digit(10).unwrap_or(0) as usize;
            prefix.extend(ep.read_exact(n).await?);
        } else {
            prefix.extend(ep.read_exact(2).await?);
        }
        let (_, len) = block_header(&prefix)?;
        let payload = ep.read_exact(len).await?;
        debug!(port = %ep.port_name(), cmd, bytes = payload.len(), "Block received");
        Ok(payload)
    }
}

fn on_off(on: bool) -> &'static str {
    if on {
        "ON"
    } else {
        "OFF"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::loopback::LoopbackOpener;
    use crate::transport::SerialSettings;
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    #[test]
    fn vertical_scale_formatting() {
        assert_eq!(format_volts_per_div(0.5), "500mV");
        assert_eq!(format_volts_per_div(0.002), "2mV");
        assert_eq!(format_volts_per_div(0.0025), "2.5mV");
        assert_eq!(format_volts_per_div(1.0), "1V");
        assert_eq!(format_volts_per_div(2.5), "2.5V");
    }

    #[test]
    fn time_base_formatting() {
        assert_eq!(format_time_per_div(500e-6), "500us");
        assert_eq!(format_time_per_div(2.5e-3), "2.5ms");
        assert_eq!(format_time_per_div(5e-9), "5ns");
        assert_eq!(format_time_per_div(1.0), "1s");
    }

    #[test]
    fn measurement_replies() {
        assert_eq!(parse_measurement("2.04V"), Some(2.04));
        assert_eq!(parse_measurement("Vpp=2.04V"), Some(2.04));
        assert!((parse_measurement("1.000kHz").unwrap() - 1000.0).abs() < 1e-9);
        assert!((parse_measurement("500.0us").unwrap() - 500e-6).abs() < 1e-15);
        assert!((parse_measurement("12.5mV").unwrap() - 0.0125).abs() < 1e-12);
        assert_eq!(parse_measurement("1.5e3Hz"), Some(1500.0));
        assert_eq!(parse_measurement("****"), None);
        assert_eq!(parse_measurement("?"), None);
    }

    #[test]
    fn ieee_and_length_prefixed_blocks() {
        let (payload, rest) = split_block(b"#15hello\n").unwrap();
        assert_eq!(payload, b"hello");
        assert_eq!(rest, b"\n");

        let mut raw = 3u32.to_le_bytes().to_vec();
        raw.extend_from_slice(b"abc");
        assert_eq!(split_block(&raw).unwrap().0, b"abc");

        assert!(split_block(b"#0").is_err());
        assert!(split_block(b"#210abc").is_err());
        assert!(matches!(
            split_block(b"#9999999999"),
            Err(BenchError::Protocol(_))
        ));
        assert!(matches!(
            split_block(&[0xff, 0xff, 0xff, 0xff]),
            Err(BenchError::Protocol(_))
        ));
    }

    #[tokio::test]
    async fn oversized_block_rejected_before_reading_payload() {
        let opener = LoopbackOpener::new();
        opener.register_device("dos-huge", None, |cmd| match cmd {
            ":WAV:DATA:ALL?" => Some(b"#9999999999".to_vec()),
            ":DATA:WAVE:SCREen:HEAD?" => Some(u32::MAX.to_le_bytes().to_vec()),
            _ => None,
        });
        let settings = SerialSettings::new("dos-huge", Dos1102::DEFAULT_BAUD)
            .with_timeout(Duration::from_millis(100));
        let dso = Dos1102::new(SerialEndpoint::new(settings, Arc::new(opener)));
        dso.open().await.unwrap();

        let err = dso.waveform_data().await.unwrap_err();
        assert!(matches!(err, BenchError::Protocol(_)), "{err}");
        let err = dso.screen_header().await.unwrap_err();
        assert!(matches!(err, BenchError::Protocol(_)), "{err}");
    }

    fn scope(port: &str) -> (Dos1102, Arc<Mutex<Vec<String>>>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let log = seen.clone();
        let opener = LoopbackOpener::new();
        opener.register_device(port, None, move |cmd| {
            log.lock().unwrap().push(cmd.to_string());
            match cmd {
                ":MEAS:CH1:PKPK?" => Some(b"Vpp=2.040V\n".to_vec()),
                ":WAV:DATA:ALL?" => Some(b"#14\x01\x02\x03\x04".to_vec()),
                ":DATA:WAVE:SCREen:HEAD?" => {
                    let json = br#"{"TIMEBASE":{"SCALE":"500us"}}"#;
                    let mut out = (json.len() as u32).to_le_bytes().to_vec();
                    out.extend_from_slice(json);
                    Some(out)
                }
                _ => None,
            }
        });
        let settings = SerialSettings::new(port, Dos1102::DEFAULT_BAUD)
            .with_timeout(Duration::from_millis(100));
        (Dos1102::new(SerialEndpoint::new(settings, Arc::new(opener))), seen)
    }

    #[tokio::test]
    async fn settings_commands() {
        let (dso, seen) = scope("dos-settings");
        dso.open().await.unwrap();

        dso.set_coupling(Channel::One, Coupling::Ac).await.unwrap();
        dso.set_volts_per_div(Channel::One, 0.5).await.unwrap();
        dso.set_probe(Channel::Two, ProbeFactor::X10).await.unwrap();
        dso.set_invert(Channel::Two, false).await.unwrap();
        dso.set_time_per_div(500e-6).await.unwrap();
        dso.set_acquisition(Acquisition::Average).await.unwrap();
        dso.set_trigger_type(TriggerType::Alternate).await.unwrap();
        dso.set_trigger_source(Channel::Two).await.unwrap();

        assert_eq!(
            *seen.lock().unwrap(),
            vec![
                ":CH1:COUP AC",
                ":CH1:SCAL 500mV",
                ":CH2:PROB 10X",
                ":CH2:INV OFF",
                ":HOR:SCAL 500us",
                ":ACQ:MODE AVE",
                ":TRIG:TYPE ALT",
                ":TRIG:SING:EDGE:SOUR CH2",
            ]
        );
    }

    #[tokio::test]
    async fn queries_and_blocks() {
        let (dso, _) = scope("dos-queries");
        dso.open().await.unwrap();

        let m = dso.measure(Channel::One, MeasureType::PeakToPeak).await.unwrap();
        assert_eq!(m.raw, "Vpp=2.040V");
        assert_eq!(m.value, Some(2.04));

        assert_eq!(dso.waveform_data().await.unwrap(), vec![1, 2, 3, 4]);

        let head = dso.screen_header().await.unwrap();
        assert_eq!(head["TIMEBASE"]["SCALE"], "500us");
    }
}
