//! Sweep engine: drives the generator through a frequency plan and reads the network
//! output at each step.
//!
//! # State Machine
//!
//! ```text
//! ┌──────┐  run()  ┌─────────────┐  output on  ┌──────────┐  last point  ┌──────┐
//! │ Idle │────────▶│ Configuring │────────────▶│ Sweeping │─────────────▶│ Done │
//! └──────┘         └──────┬──────┘             └────┬─────┘              └──────┘
//!    ▲                    │ error                   │ abort()  ┌─────────┐
//!    │                    │                         ├─────────▶│ Aborted │
//!    │                    │                         │ error    ├─────────┤
//!    │                    └─────────────────────────┴─────────▶│ Failed  │
//!    │                                                         └────┬────┘
//!    └──────────────────────────── next run() ──────────────────────┘
//! ```
//!
//! The generator output state read before the sweep is written back on every exit
//! path, including abort and failure.
//!
//! # Usage
//!
//! ```rust,ignore
//! let engine = Arc::new(SweepEngine::new(generator, multimeter));
//! let abort = engine.abort_handle();
//! let events = EventDistributor::default();
//! let mut rx = events.subscribe().await;
//!
//! let task = tokio::spawn({
//!     let engine = engine.clone();
//!     async move { engine.run(&config, &events).await }
//! });
//! // ... later, from the UI
//! abort.abort();
//! let report = task.await??;
//! ```

use super::plan::SweepConfig;
use crate::bode::BodePoint;
use crate::error::{BenchError, BenchResult};
use crate::events::EventDistributor;
use crate::hardware::capabilities::{MeasurementSource, SignalSource};
use crate::measurement::MeasurementMode;
use crate::protocol::fy6900::Waveform;
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::RwLock;
use tokio::time::{sleep_until, Duration, Instant};
use tracing::{debug, error, info, warn};

/// Longest uninterrupted wait while settling; bounds abort latency.
pub const SETTLE_SLICE: Duration = Duration::from_millis(50);

/// Engine state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SweepState {
    /// Ready to accept a run
    Idle,
    /// Reading previous state and programming the instruments
    Configuring,
    /// Stepping through the plan
    Sweeping,
    /// Last run completed every point
    Done,
    /// Last run was stopped by `abort()`
    Aborted,
    /// Last run stopped on an error
    Failed,
}

impl SweepState {
    /// True while a run is in progress.
    pub fn is_active(&self) -> bool {
        matches!(self, SweepState::Configuring | SweepState::Sweeping)
    }
}

impl std::fmt::Display for SweepState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SweepState::Idle => write!(f, "idle"),
            SweepState::Configuring => write!(f, "configuring"),
            SweepState::Sweeping => write!(f, "sweeping"),
            SweepState::Done => write!(f, "done"),
            SweepState::Aborted => write!(f, "aborted"),
            SweepState::Failed => write!(f, "failed"),
        }
    }
}

/// How a run that returned a report ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SweepStatus {
    Completed,
    Aborted,
}

/// Result of a run that did not fail.
#[derive(Debug, Clone, PartialEq)]
pub struct SweepReport {
    pub status: SweepStatus,
    pub points: Vec<BodePoint>,
    pub config: SweepConfig,
}

/// Progress notifications published while a sweep runs.
#[derive(Debug, Clone)]
pub enum SweepEvent {
    Started {
        total: usize,
    },
    StabilizationStarted {
        index: usize,
        frequency_hz: f64,
    },
    StabilizationEnded {
        index: usize,
        frequency_hz: f64,
    },
    Point {
        point: BodePoint,
        index: usize,
        total: usize,
    },
    Progress {
        done: usize,
        total: usize,
    },
    Finished {
        status: SweepStatus,
        points: usize,
    },
    Error {
        frequency_hz: f64,
        message: String,
    },
}

/// Receives sweep progress. Every method defaults to a no-op.
///
/// Callbacks run on the sweep task between instrument commands; an implementation that
/// waits delays the next abort check. [`EventDistributor`] never waits.
#[async_trait]
pub trait SweepListener: Send + Sync {
    async fn on_started(&self, _total: usize) {}

    async fn on_stabilization_started(&self, _index: usize, _frequency_hz: f64) {}

    async fn on_stabilization_ended(&self, _index: usize, _frequency_hz: f64) {}

    async fn on_point(&self, _point: &BodePoint, _index: usize, _total: usize) {}

    async fn on_progress(&self, _done: usize, _total: usize) {}

    async fn on_finished(&self, _status: SweepStatus, _points: usize) {}

    async fn on_error(&self, _frequency_hz: f64, _error: &BenchError) {}
}

/// Listener that ignores everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopListener;

impl SweepListener for NoopListener {}

#[async_trait]
impl SweepListener for EventDistributor<SweepEvent> {
    async fn on_started(&self, total: usize) {
        self.broadcast(SweepEvent::Started { total }).await;
    }

    async fn on_stabilization_started(&self, index: usize, frequency_hz: f64) {
        self.broadcast(SweepEvent::StabilizationStarted {
            index,
            frequency_hz,
        })
        .await;
    }

    async fn on_stabilization_ended(&self, index: usize, frequency_hz: f64) {
        self.broadcast(SweepEvent::StabilizationEnded {
            index,
            frequency_hz,
        })
        .await;
    }

    async fn on_point(&self, point: &BodePoint, index: usize, total: usize) {
        self.broadcast(SweepEvent::Point {
            point: *point,
            index,
            total,
        })
        .await;
    }

    async fn on_progress(&self, done: usize, total: usize) {
        self.broadcast(SweepEvent::Progress { done, total }).await;
    }

    async fn on_finished(&self, status: SweepStatus, points: usize) {
        self.broadcast(SweepEvent::Finished { status, points }).await;
    }

    async fn on_error(&self, frequency_hz: f64, error: &BenchError) {
        self.broadcast(SweepEvent::Error {
            frequency_hz,
            message: error.to_string(),
        })
        .await;
    }
}

/// Cloneable handle that requests a cooperative stop of the current run.
#[derive(Debug, Clone, Default)]
pub struct AbortHandle(Arc<AtomicBool>);

impl AbortHandle {
    pub fn abort(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_aborted(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    fn reset(&self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

enum StepOutcome {
    Finished,
    Aborted,
}

/// Frequency-response sweep over a generator and a voltmeter.
pub struct SweepEngine {
    generator: Arc<dyn SignalSource>,
    meter: Arc<dyn MeasurementSource>,
    state: RwLock<SweepState>,
    abort: AbortHandle,
}

impl SweepEngine {
    pub fn new(generator: Arc<dyn SignalSource>, meter: Arc<dyn MeasurementSource>) -> Self {
        Self {
            generator,
            meter,
            state: RwLock::new(SweepState::Idle),
            abort: AbortHandle::default(),
        }
    }

    pub async fn state(&self) -> SweepState {
        *self.state.read().await
    }

    pub fn abort_handle(&self) -> AbortHandle {
        self.abort.clone()
    }

    /// Request a stop at the next check point. At most one more point is emitted.
    ///
    /// A request made while idle applies to the next run unless
    /// [`clear_abort`](Self::clear_abort) is called first.
    pub fn abort(&self) {
        self.abort.abort();
    }

    /// Drop a pending abort request.
    pub fn clear_abort(&self) {
        self.abort.reset();
    }

    /// Frequencies of `config`, checked against the plan rules and the generator's range.
    pub fn plan(&self, config: &SweepConfig) -> BenchResult<Vec<f64>> {
        let plan = config.frequencies()?;
        let limit = self.generator.max_frequency_hz();
        if config.f_max_hz > limit {
            return Err(BenchError::InvalidConfig(format!(
                "f_max_hz ({}) exceeds the generator's {limit} Hz",
                config.f_max_hz
            )));
        }
        Ok(plan)
    }

    /// Execute one sweep.
    ///
    /// Returns `Ok` with status [`SweepStatus::Aborted`] and the points gathered so far
    /// when stopped through [`abort`](Self::abort). Device errors end the run with
    /// [`BenchError::SweepFailed`]. An invalid configuration fails before any I/O.
    pub async fn run(
        &self,
        config: &SweepConfig,
        listener: &dyn SweepListener,
    ) -> BenchResult<SweepReport> {
        let plan = self.plan(config)?;
        {
            let mut state = self.state.write().await;
            if state.is_active() {
                return Err(BenchError::Busy("a sweep is already running".into()));
            }
            *state = SweepState::Configuring;
        }

        let channel = config.generator_channel;
        let first_hz = plan[0];
        info!(
            channel = %channel,
            points = plan.len(),
            f_min_hz = config.f_min_hz,
            f_max_hz = config.f_max_hz,
            "Sweep starting"
        );

        let previous_output = match self.generator.output_enabled(channel).await {
            Ok(on) => on,
            Err(e) => return self.fail(first_hz, Vec::new(), e, listener).await,
        };
        let previous_mode = self.meter.current_mode().await;

        let mut points = Vec::with_capacity(plan.len());
        let outcome = match self.configure(config).await {
            Ok(()) => {
                *self.state.write().await = SweepState::Sweeping;
                listener.on_started(plan.len()).await;
                self.step_through(config, &plan, &mut points, listener).await
            }
            Err(e) => Err((first_hz, e)),
        };

        self.restore(config, previous_output, previous_mode).await;

        match outcome {
            Ok(StepOutcome::Finished) => {
                info!(points = points.len(), "Sweep complete");
                self.finish(SweepState::Done, SweepStatus::Completed, points, config, listener)
                    .await
            }
            Ok(StepOutcome::Aborted) => {
                info!(points = points.len(), "Sweep aborted");
                self.finish(SweepState::Aborted, SweepStatus::Aborted, points, config, listener)
                    .await
            }
            Err((frequency_hz, e)) => self.fail(frequency_hz, points, e, listener).await,
        }
    }

    async fn configure(&self, config: &SweepConfig) -> BenchResult<()> {
        let channel = config.generator_channel;
        let peak_v = std::f64::consts::SQRT_2 * config.input_rms_v;

        self.meter.set_mode(MeasurementMode::VoltAc).await?;
        self.generator.set_waveform(channel, Waveform::Sine).await?;
        self.generator.set_amplitude(channel, peak_v).await?;
        self.generator.set_output(channel, true).await?;
        debug!(peak_v, "Generator configured for sweep");
        Ok(())
    }

    async fn step_through(
        &self,
        config: &SweepConfig,
        plan: &[f64],
        points: &mut Vec<BodePoint>,
        listener: &dyn SweepListener,
    ) -> Result<StepOutcome, (f64, BenchError)> {
        let channel = config.generator_channel;
        let settling = Duration::from_millis(config.settling_ms);
        let total = plan.len();

        for (index, &hz) in plan.iter().enumerate() {
            if self.abort.is_aborted() {
                return Ok(StepOutcome::Aborted);
            }

            self.generator
                .set_frequency(channel, hz)
                .await
                .map_err(|e| (hz, e))?;

            listener.on_stabilization_started(index, hz).await;
            let settled = self.settle(settling).await;
            listener.on_stabilization_ended(index, hz).await;
            if !settled || self.abort.is_aborted() {
                return Ok(StepOutcome::Aborted);
            }

            let reading = self.meter.measure().await.map_err(|e| (hz, e))?;
            if !reading.value.is_finite() {
                return Err((
                    hz,
                    BenchError::Protocol(format!(
                        "unparseable output amplitude '{}'",
                        reading.raw
                    )),
                ));
            }

            let point = BodePoint::new(index, hz, config.input_rms_v, reading.value);
            debug!(index, hz, gain_db = point.gain_db, "Sweep point");
            points.push(point);
            listener.on_point(&point, index, total).await;
            listener.on_progress(index + 1, total).await;
        }

        Ok(StepOutcome::Finished)
    }

    /// Sleep `duration` in slices, returning `false` as soon as an abort is seen.
    async fn settle(&self, duration: Duration) -> bool {
        let deadline = Instant::now() + duration;
        loop {
            let now = Instant::now();
            if now >= deadline {
                return true;
            }
            sleep_until(deadline.min(now + SETTLE_SLICE)).await;
            if self.abort.is_aborted() {
                return false;
            }
        }
    }

    async fn restore(&self, config: &SweepConfig, output_on: bool, mode: MeasurementMode) {
        let channel = config.generator_channel;
        if let Err(e) = self.generator.set_output(channel, output_on).await {
            warn!(channel = %channel, error = %e, "Failed to restore generator output");
        }
        if let Err(e) = self.meter.set_mode(mode).await {
            warn!(mode = %mode, error = %e, "Failed to restore multimeter mode");
        }
    }

    async fn finish(
        &self,
        state: SweepState,
        status: SweepStatus,
        points: Vec<BodePoint>,
        config: &SweepConfig,
        listener: &dyn SweepListener,
    ) -> BenchResult<SweepReport> {
        *self.state.write().await = state;
        self.abort.reset();
        listener.on_finished(status, points.len()).await;
        Ok(SweepReport {
            status,
            points,
            config: config.clone(),
        })
    }

    async fn fail(
        &self,
        frequency_hz: f64,
        partial: Vec<BodePoint>,
        source: BenchError,
        listener: &dyn SweepListener,
    ) -> BenchResult<SweepReport> {
        error!(frequency_hz, points = partial.len(), error = %source, "Sweep failed");
        *self.state.write().await = SweepState::Failed;
        self.abort.reset();
        listener.on_error(frequency_hz, &source).await;
        Err(BenchError::SweepFailed {
            frequency_hz,
            partial,
            source: Box::new(source),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hardware::mock::{first_order_low_pass, MockGenerator, MockMultimeter};
    use crate::protocol::Channel;
    use crate::sweep::plan::Scale;

    fn bench(cutoff_hz: f64) -> (Arc<MockGenerator>, Arc<MockMultimeter>, SweepEngine) {
        let gen = Arc::new(MockGenerator::new());
        let dmm = Arc::new(MockMultimeter::network(
            gen.clone(),
            Channel::One,
            first_order_low_pass(cutoff_hz),
        ));
        let engine = SweepEngine::new(gen.clone(), dmm.clone());
        (gen, dmm, engine)
    }

    fn decades(f_min: f64, f_max: f64, ppd: u32, settling_ms: u64) -> SweepConfig {
        SweepConfig {
            generator_channel: Channel::One,
            f_min_hz: f_min,
            f_max_hz: f_max,
            points_per_decade: ppd,
            scale: Scale::Log10,
            settling_ms,
            input_rms_v: 1.0,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn low_pass_sweep_matches_transfer_function() {
        let (gen, _dmm, engine) = bench(1000.0);
        let report = engine
            .run(&decades(100.0, 10_000.0, 1, 10), &NoopListener)
            .await
            .unwrap();

        assert_eq!(report.status, SweepStatus::Completed);
        let gains: Vec<f64> = report.points.iter().map(|p| p.gain_db).collect();
        assert_eq!(gains.len(), 3);
        assert!((gains[0] - -0.0432).abs() < 1e-3);
        assert!((gains[1] - -3.0103).abs() < 1e-3);
        assert!((gains[2] - -20.0432).abs() < 1e-3);

        // Generator got √2 peak for 1 V RMS and its output is back off.
        let state = gen.state(Channel::One);
        assert!((state.amplitude_peak_v - std::f64::consts::SQRT_2).abs() < 1e-12);
        assert!(!state.output_on);
        assert_eq!(engine.state().await, SweepState::Done);
    }

    #[tokio::test(start_paused = true)]
    async fn output_restored_to_previous_on_state() {
        let gen = Arc::new(MockGenerator::with_output(Channel::One, true));
        let dmm = Arc::new(MockMultimeter::fixed(0.5));
        let engine = SweepEngine::new(gen.clone(), dmm);
        engine
            .run(&decades(100.0, 1000.0, 2, 0), &NoopListener)
            .await
            .unwrap();
        assert!(gen.state(Channel::One).output_on);
    }

    #[tokio::test(start_paused = true)]
    async fn abort_returns_partial_points() {
        let (gen, _dmm, engine) = bench(1000.0);
        let engine = Arc::new(engine);
        let abort = engine.abort_handle();

        let task = tokio::spawn({
            let engine = engine.clone();
            async move {
                engine
                    .run(&decades(10.0, 1e5, 25, 500), &NoopListener)
                    .await
            }
        });
        tokio::time::sleep(Duration::from_millis(1000)).await;
        abort.abort();

        let report = task.await.unwrap().unwrap();
        assert_eq!(report.status, SweepStatus::Aborted);
        assert!((1..=3).contains(&report.points.len()));
        assert!(!gen.state(Channel::One).output_on);
        assert_eq!(engine.state().await, SweepState::Aborted);
    }

    #[tokio::test(start_paused = true)]
    async fn device_error_carries_partial_points() {
        let (gen, _dmm, engine) = bench(1000.0);
        gen.fail_above(2000.0);

        let err = engine
            .run(&decades(100.0, 100_000.0, 1, 0), &NoopListener)
            .await
            .unwrap_err();
        match err {
            BenchError::SweepFailed {
                frequency_hz,
                partial,
                source,
            } => {
                assert!((frequency_hz - 10_000.0).abs() < 1e-6);
                assert_eq!(partial.len(), 2);
                assert!(source.is_transport());
            }
            other => panic!("unexpected error {other:?}"),
        }
        assert!(!gen.state(Channel::One).output_on);
        assert_eq!(engine.state().await, SweepState::Failed);
    }

    #[tokio::test(start_paused = true)]
    async fn invalid_config_does_no_io() {
        let (gen, _dmm, engine) = bench(1000.0);
        let err = engine
            .run(&decades(0.0, 1000.0, 10, 0), &NoopListener)
            .await
            .unwrap_err();
        assert!(matches!(err, BenchError::InvalidConfig(_)));
        assert_eq!(gen.output_changes(), 0);
        assert_eq!(engine.state().await, SweepState::Idle);
    }

    #[tokio::test]
    async fn range_beyond_generator_rejected_before_io() {
        let (gen, dmm, engine) = bench(1000.0);
        let err = engine
            .run(&decades(1e6, 70e6, 10, 0), &NoopListener)
            .await
            .unwrap_err();
        assert!(matches!(err, BenchError::InvalidConfig(_)), "{err}");
        assert_eq!(gen.output_changes(), 0);
        assert_eq!(dmm.reads(), 0);
        assert_eq!(engine.state().await, SweepState::Idle);

        assert!(engine.plan(&decades(1e6, 60e6, 10, 0)).is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn events_arrive_in_order() {
        let (_gen, _dmm, engine) = bench(1000.0);
        let events = EventDistributor::new(64);
        let mut rx = events.subscribe().await;

        engine
            .run(&decades(100.0, 1000.0, 1, 20), &events)
            .await
            .unwrap();
        drop(events);

        let mut kinds = Vec::new();
        while let Some(event) = rx.recv().await {
            kinds.push(match event {
                SweepEvent::Started { total } => format!("start{total}"),
                SweepEvent::StabilizationStarted { index, .. } => format!("s{index}"),
                SweepEvent::StabilizationEnded { index, .. } => format!("e{index}"),
                SweepEvent::Point { index, .. } => format!("p{index}"),
                SweepEvent::Progress { done, .. } => format!("d{done}"),
                SweepEvent::Finished { points, .. } => format!("fin{points}"),
                SweepEvent::Error { .. } => "err".into(),
            });
        }
        assert_eq!(
            kinds,
            ["start2", "s0", "e0", "p0", "d1", "s1", "e1", "p1", "d2", "fin2"]
        );
    }
}
