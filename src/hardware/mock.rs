//! Simulated instruments
//!
//! Provides a generator and a multimeter coupled through a complex transfer function,
//! so a sweep over the simulated bench traces the Bode plot of the simulated network.
//! All timing uses `tokio::time`, so paused-clock tests stay deterministic.
//!
//! # Available Mocks
//!
//! - `MockGenerator`: two-channel sine source implementing [`SignalSource`]
//! - `MockMultimeter`: AC voltmeter on the network output, or a ramp/fixed source,
//!   implementing [`MeasurementSource`]
//! - `install_serial_devices`: the same pair exposed as FY6900 and XDM serial devices on
//!   a [`LoopbackOpener`], for exercising the real protocol stack
//!
//! # Example
//!
//! ```rust,ignore
//! let gen = Arc::new(MockGenerator::new());
//! let dmm = MockMultimeter::network(gen.clone(), Channel::One, first_order_low_pass(1000.0));
//! gen.set_amplitude(Channel::One, 2f64.sqrt()).await?;
//! gen.set_output(Channel::One, true).await?;
//! dmm.set_mode(MeasurementMode::VoltAc).await?;
//! let reading = dmm.measure().await?; // 1 V RMS times |H(f)|
//! ```

use crate::error::{BenchError, BenchResult};
use crate::hardware::capabilities::{MeasurementSource, SignalSource};
use crate::measurement::{MeasurementMode, Reading};
use crate::protocol::fy6900::{self, Waveform};
use crate::protocol::Channel;
use crate::transport::loopback::LoopbackOpener;
use async_trait::async_trait;
use num_complex::Complex64;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::time::{sleep, Duration};
use tracing::debug;

/// Complex gain of the simulated network as a function of frequency in hertz.
pub type TransferFn = Arc<dyn Fn(f64) -> Complex64 + Send + Sync>;

/// `H(f) = 1 / (1 + j f/fc)`.
pub fn first_order_low_pass(cutoff_hz: f64) -> TransferFn {
    Arc::new(move |f| Complex64::new(1.0, 0.0) / Complex64::new(1.0, f / cutoff_hz))
}

/// `H(f) = (j f/fc) / (1 + j f/fc)`.
pub fn first_order_high_pass(cutoff_hz: f64) -> TransferFn {
    Arc::new(move |f| {
        let jw = Complex64::new(0.0, f / cutoff_hz);
        jw / (Complex64::new(1.0, 0.0) + jw)
    })
}

fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

fn index(channel: Channel) -> usize {
    usize::from(channel.number() - 1)
}

/// State of one generator channel.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ChannelState {
    pub waveform: Waveform,
    pub frequency_hz: f64,
    pub amplitude_peak_v: f64,
    pub offset_v: f64,
    pub output_on: bool,
}

impl Default for ChannelState {
    fn default() -> Self {
        Self {
            waveform: Waveform::Sine,
            frequency_hz: 1000.0,
            amplitude_peak_v: 1.0,
            offset_v: 0.0,
            output_on: false,
        }
    }
}

// =============================================================================
// MockGenerator
// =============================================================================

/// Simulated two-channel generator.
#[derive(Debug, Default)]
pub struct MockGenerator {
    channels: Mutex<[ChannelState; 2]>,
    fail_above_hz: Mutex<Option<f64>>,
    output_changes: AtomicUsize,
}

impl MockGenerator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Generator whose channel outputs start in the given state.
    pub fn with_output(channel: Channel, on: bool) -> Self {
        let gen = Self::new();
        lock(&gen.channels)[index(channel)].output_on = on;
        gen
    }

    /// Make every `set_frequency` above `hz` fail with a transport error.
    pub fn fail_above(&self, hz: f64) {
        *lock(&self.fail_above_hz) = Some(hz);
    }

    pub fn state(&self, channel: Channel) -> ChannelState {
        lock(&self.channels)[index(channel)]
    }

    /// Number of output on/off commands received.
    pub fn output_changes(&self) -> usize {
        self.output_changes.load(Ordering::Relaxed)
    }

    fn update(&self, channel: Channel, f: impl FnOnce(&mut ChannelState)) {
        f(&mut lock(&self.channels)[index(channel)]);
    }

    fn apply_frequency(&self, channel: Channel, hz: f64) -> BenchResult<()> {
        if let Some(limit) = *lock(&self.fail_above_hz) {
            if hz > limit {
                return Err(BenchError::transport(
                    "sim-generator",
                    std::io::Error::new(std::io::ErrorKind::BrokenPipe, "simulated link loss"),
                ));
            }
        }
        self.update(channel, |s| s.frequency_hz = hz);
        Ok(())
    }

    fn apply_output(&self, channel: Channel, on: bool) {
        self.output_changes.fetch_add(1, Ordering::Relaxed);
        self.update(channel, |s| s.output_on = on);
    }
}

#[async_trait]
impl SignalSource for MockGenerator {
    async fn set_waveform(&self, channel: Channel, waveform: Waveform) -> BenchResult<()> {
        self.update(channel, |s| s.waveform = waveform);
        Ok(())
    }

    async fn set_frequency(&self, channel: Channel, hz: f64) -> BenchResult<()> {
        self.apply_frequency(channel, hz)
    }

    async fn set_amplitude(&self, channel: Channel, peak_v: f64) -> BenchResult<()> {
        self.update(channel, |s| s.amplitude_peak_v = peak_v);
        Ok(())
    }

    async fn set_output(&self, channel: Channel, on: bool) -> BenchResult<()> {
        self.apply_output(channel, on);
        Ok(())
    }

    async fn output_enabled(&self, channel: Channel) -> BenchResult<bool> {
        Ok(self.state(channel).output_on)
    }

    fn max_frequency_hz(&self) -> f64 {
        fy6900::MAX_FREQUENCY_HZ
    }
}

// =============================================================================
// MockMultimeter
// =============================================================================

enum MeterSource {
    Network {
        generator: Arc<MockGenerator>,
        channel: Channel,
        transfer: TransferFn,
    },
    Ramp {
        start: f64,
        step: f64,
    },
    Fixed(f64),
}

/// Simulated multimeter.
pub struct MockMultimeter {
    source: MeterSource,
    mode: Mutex<MeasurementMode>,
    reads: AtomicU64,
    failures: AtomicUsize,
    delay: Duration,
}

impl MockMultimeter {
    fn build(source: MeterSource) -> Self {
        Self {
            source,
            mode: Mutex::new(MeasurementMode::default()),
            reads: AtomicU64::new(0),
            failures: AtomicUsize::new(0),
            delay: Duration::ZERO,
        }
    }

    /// Meter on the output of `transfer`, driven by `channel` of `generator`.
    ///
    /// In `volt_ac` it reads the RMS output, `|H(f)|·A/√2` while the output is on and 0
    /// otherwise; in `freq` it reads the generator frequency.
    pub fn network(generator: Arc<MockGenerator>, channel: Channel, transfer: TransferFn) -> Self {
        Self::build(MeterSource::Network {
            generator,
            channel,
            transfer,
        })
    }

    /// Meter returning `start`, `start + step`, `start + 2·step`, ...
    pub fn ramp(start: f64, step: f64) -> Self {
        Self::build(MeterSource::Ramp { start, step })
    }

    pub fn fixed(value: f64) -> Self {
        Self::build(MeterSource::Fixed(value))
    }

    /// Time each reading takes.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Make the next `count` readings fail with a timeout.
    pub fn fail_next(&self, count: usize) {
        self.failures.store(count, Ordering::Relaxed);
    }

    /// Successful readings so far.
    pub fn reads(&self) -> u64 {
        self.reads.load(Ordering::Relaxed)
    }

    fn value_now(&self, mode: MeasurementMode, n: u64) -> f64 {
        match &self.source {
            MeterSource::Network {
                generator,
                channel,
                transfer,
            } => {
                let state = generator.state(*channel);
                match mode {
                    MeasurementMode::VoltAc if state.output_on => {
                        transfer(state.frequency_hz).norm() * state.amplitude_peak_v
                            / std::f64::consts::SQRT_2
                    }
                    MeasurementMode::Freq if state.output_on => state.frequency_hz,
                    _ => 0.0,
                }
            }
            MeterSource::Ramp { start, step } => start + step * n as f64,
            MeterSource::Fixed(value) => *value,
        }
    }

    fn take_failure(&self) -> bool {
        self.failures
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| n.checked_sub(1))
            .is_ok()
    }
}

#[async_trait]
impl MeasurementSource for MockMultimeter {
    async fn set_mode(&self, mode: MeasurementMode) -> BenchResult<()> {
        *lock(&self.mode) = mode;
        Ok(())
    }

    async fn current_mode(&self) -> MeasurementMode {
        *lock(&self.mode)
    }

    async fn measure(&self) -> BenchResult<Reading> {
        if !self.delay.is_zero() {
            sleep(self.delay).await;
        }
        if self.take_failure() {
            return Err(BenchError::Timeout {
                port: "sim-multimeter".into(),
                timeout_ms: 0,
            });
        }
        let mode = *lock(&self.mode);
        let n = self.reads.fetch_add(1, Ordering::Relaxed);
        Ok(Reading::from_value(mode, self.value_now(mode, n)))
    }
}

// =============================================================================
// Serial-level simulation
// =============================================================================

/// Identification string of the simulated multimeter.
pub const SIM_MULTIMETER_IDN: &str = "OWON,XDM1041,SIM00001,V3.7.2";

/// Model string of the simulated generator.
pub const SIM_GENERATOR_MODEL: &str = "FY6900-60M";

/// Register an FY6900 on `generator_port` and an XDM multimeter on `multimeter_port`,
/// both at 115200 baud, sharing `generator` and measuring through `transfer` on
/// channel 1.
pub fn install_serial_devices(
    opener: &LoopbackOpener,
    multimeter_port: &str,
    generator_port: &str,
    generator: Arc<MockGenerator>,
    transfer: TransferFn,
) {
    let gen = generator.clone();
    opener.register_line_device(generator_port, Some(115_200), move |frame| {
        fy6900_reply(&gen, frame)
    });

    let meter = Arc::new(MockMultimeter::network(generator, Channel::One, transfer));
    opener.register_line_device(multimeter_port, Some(115_200), move |cmd| {
        xdm_reply(&meter, cmd)
    });
}

fn fy6900_reply(gen: &MockGenerator, frame: &str) -> Option<String> {
    if frame == "UMO" {
        return Some(format!("{SIM_GENERATOR_MODEL}\n"));
    }
    if frame.len() < 3 || !frame.is_ascii() {
        return Some("\n".into());
    }

    let (op, arg) = frame.split_at(3);
    let channel = match &op[..2] {
        "WM" | "RM" => Channel::One,
        "WF" | "RF" => Channel::Two,
        _ => return Some("\n".into()),
    };
    let code = &op[2..];
    let state = gen.state(channel);

    if op.starts_with('R') {
        let reply = match code {
            "N" => String::from(if state.output_on { "1" } else { "0" }),
            "F" => format!("{:.6}", state.frequency_hz),
            "A" => format!("{:.4}", state.amplitude_peak_v * 2.0),
            "W" => state.waveform.code().to_string(),
            _ => String::new(),
        };
        return Some(format!("{reply}\n"));
    }

    let value: Option<f64> = arg.parse().ok();
    match (code, value) {
        ("F", Some(micro_hz)) => {
            let _ = gen.apply_frequency(channel, micro_hz / 1e6);
        }
        ("A", Some(vpp)) => gen.update(channel, |s| s.amplitude_peak_v = vpp / 2.0),
        ("O", Some(v)) => gen.update(channel, |s| s.offset_v = v),
        ("N", Some(on)) => gen.apply_output(channel, on != 0.0),
        ("W", Some(c)) => {
            if let Some(w) = Waveform::from_code(c as u8) {
                gen.update(channel, |s| s.waveform = w);
            }
        }
        _ => debug!(frame, "Simulated FY6900 ignored frame"),
    }
    Some("\n".into())
}

fn xdm_reply(meter: &MockMultimeter, cmd: &str) -> Option<String> {
    match cmd {
        "*IDN?" => Some(format!("{SIM_MULTIMETER_IDN}\n")),
        "MEAS?" => {
            let mode = *lock(&meter.mode);
            let n = meter.reads.fetch_add(1, Ordering::Relaxed);
            Some(format!("{:E}\n", meter.value_now(mode, n)))
        }
        _ => {
            if let Some(function) = cmd.strip_prefix("CONF:") {
                let function = function.split_whitespace().next().unwrap_or_default();
                if let Some(mode) = MeasurementMode::ALL
                    .into_iter()
                    .find(|m| m.scpi_function() == function)
                {
                    *lock(&meter.mode) = mode;
                }
            }
            None
        }
    }
}
