//! Bench session: one multimeter, one generator, and the two workers sharing them.
//!
//! The sweep engine and the data logger both drive the multimeter, so the session only
//! lets one of them run at a time. Starting either while the other is active fails with
//! [`BenchError::Busy`].
//!
//! Front-ends call [`BenchSession::subscribe`] once and receive every worker event as a
//! [`BenchEvent`] through a bounded queue.

use crate::config::AppConfig;
use crate::data_logger::{DataLogger, LogEvent};
use crate::error::{BenchError, BenchResult};
use crate::events::{BenchEvent, EventDistributor, DEFAULT_CAPACITY};
use crate::hardware::capabilities::{MeasurementSource, SignalSource};
use crate::hardware::mock::{MockGenerator, MockMultimeter, TransferFn};
use crate::measurement::Multimeter;
use crate::protocol::fy6900::Fy6900;
use crate::protocol::Channel;
use crate::sweep::{AbortHandle, SweepConfig, SweepEngine, SweepEvent, SweepReport};
use crate::transport::{PortOpener, SerialEndpoint};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info};

/// Owner of the bench instruments and workers.
pub struct BenchSession {
    generator: Arc<dyn SignalSource>,
    meter: Arc<dyn MeasurementSource>,
    engine: Arc<SweepEngine>,
    logger: DataLogger,
    sweep_events: Arc<EventDistributor<SweepEvent>>,
    log_events: Arc<EventDistributor<LogEvent>>,
    sweep_task: Mutex<Option<JoinHandle<BenchResult<SweepReport>>>>,
}

impl BenchSession {
    pub fn new(generator: Arc<dyn SignalSource>, meter: Arc<dyn MeasurementSource>) -> Self {
        let log_events = Arc::new(EventDistributor::default());
        Self {
            engine: Arc::new(SweepEngine::new(generator.clone(), meter.clone())),
            logger: DataLogger::with_events(meter.clone(), log_events.clone()),
            generator,
            meter,
            sweep_events: Arc::new(EventDistributor::default()),
            log_events,
            sweep_task: Mutex::new(None),
        }
    }

    /// Session over simulated instruments, the meter reading the output of `transfer`
    /// driven by generator channel 1.
    pub fn simulated(transfer: TransferFn) -> Self {
        let generator = Arc::new(MockGenerator::new());
        let meter = Arc::new(MockMultimeter::network(
            generator.clone(),
            Channel::One,
            transfer,
        ));
        Self::new(generator, meter)
    }

    /// Open the multimeter and generator ports named in `config`.
    pub async fn connect(config: &AppConfig, opener: Arc<dyn PortOpener>) -> BenchResult<Self> {
        let meter = Multimeter::new(SerialEndpoint::new(
            config.multimeter_settings()?,
            opener.clone(),
        ));
        let generator = Fy6900::new(SerialEndpoint::new(config.generator_settings(), opener));

        meter.open().await?;
        if let Err(e) = generator.open().await {
            meter.close().await;
            return Err(e);
        }

        let idn = meter.identify().await?;
        let model = generator.model().await?;
        info!(multimeter = %idn, generator = %model, "Bench connected");

        Ok(Self::new(Arc::new(generator), Arc::new(meter)))
    }

    pub fn generator(&self) -> &Arc<dyn SignalSource> {
        &self.generator
    }

    pub fn meter(&self) -> &Arc<dyn MeasurementSource> {
        &self.meter
    }

    pub fn logger(&self) -> &DataLogger {
        &self.logger
    }

    /// Merged queue of sweep and logger events.
    pub async fn subscribe(&self) -> mpsc::Receiver<BenchEvent> {
        let mut sweep_rx = self.sweep_events.subscribe().await;
        let mut log_rx = self.log_events.subscribe().await;
        let (tx, rx) = mpsc::channel(DEFAULT_CAPACITY);

        tokio::spawn(async move {
            let (mut sweep_open, mut log_open) = (true, true);
            while sweep_open || log_open {
                let event = tokio::select! {
                    e = sweep_rx.recv(), if sweep_open => match e {
                        Some(e) => BenchEvent::Sweep(e),
                        None => { sweep_open = false; continue; }
                    },
                    e = log_rx.recv(), if log_open => match e {
                        Some(e) => BenchEvent::Log(e),
                        None => { log_open = false; continue; }
                    },
                };
                if tx.send(event).await.is_err() {
                    break;
                }
            }
            debug!("Session event forwarder finished");
        });

        rx
    }

    fn sweep_running(task: &Option<JoinHandle<BenchResult<SweepReport>>>) -> bool {
        task.as_ref().is_some_and(|t| !t.is_finished())
    }

    /// Start a sweep in the background. Fails with `Busy` while logging or sweeping.
    pub async fn start_sweep(&self, config: SweepConfig) -> BenchResult<AbortHandle> {
        self.engine.plan(&config)?;

        let mut task = self.sweep_task.lock().await;
        if Self::sweep_running(&task) {
            return Err(BenchError::Busy("a sweep is already running".into()));
        }
        if self.logger.is_logging().await {
            return Err(BenchError::Busy(
                "cannot sweep while the data logger is running".into(),
            ));
        }

        self.engine.clear_abort();
        let engine = self.engine.clone();
        let events = self.sweep_events.clone();
        *task = Some(tokio::spawn(async move {
            engine.run(&config, events.as_ref()).await
        }));
        Ok(self.engine.abort_handle())
    }

    /// Request a cooperative stop of the running sweep.
    pub fn abort_sweep(&self) {
        self.engine.abort();
    }

    pub async fn is_sweeping(&self) -> bool {
        let task = self.sweep_task.lock().await;
        Self::sweep_running(&task)
    }

    /// Wait for the last started sweep and return its outcome.
    pub async fn wait_sweep(&self) -> BenchResult<SweepReport> {
        let handle = self
            .sweep_task
            .lock()
            .await
            .take()
            .ok_or_else(|| BenchError::InvalidConfig("no sweep has been started".into()))?;
        handle.await?
    }

    /// Run a sweep to completion.
    pub async fn sweep(&self, config: SweepConfig) -> BenchResult<SweepReport> {
        self.start_sweep(config).await?;
        self.wait_sweep().await
    }

    /// Start the data logger. Fails with `Busy` while a sweep runs.
    pub async fn start_logging(&self, output_dir: &Path, interval_s: f64) -> BenchResult<PathBuf> {
        let task = self.sweep_task.lock().await;
        if Self::sweep_running(&task) {
            return Err(BenchError::Busy(
                "cannot log while a sweep is running".into(),
            ));
        }
        self.logger.start(output_dir, interval_s).await
    }

    /// Stop the data logger; returns the rows written.
    pub async fn stop_logging(&self) -> BenchResult<usize> {
        self.logger.stop().await
    }

    /// Stop whatever is running.
    pub async fn shutdown(&self) -> BenchResult<()> {
        self.abort_sweep();
        let pending = self.sweep_task.lock().await.take();
        if let Some(handle) = pending {
            let _ = handle.await;
        }
        self.stop_logging().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hardware::mock::first_order_low_pass;
    use crate::sweep::{Scale, SweepStatus};
    use tokio::time::Duration;

    fn slow_sweep() -> SweepConfig {
        SweepConfig {
            generator_channel: Channel::One,
            f_min_hz: 10.0,
            f_max_hz: 100_000.0,
            points_per_decade: 10,
            scale: Scale::Log10,
            settling_ms: 200,
            input_rms_v: 1.0,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn sweep_and_logger_are_exclusive() {
        let dir = tempfile::tempdir().unwrap();
        let session = BenchSession::simulated(first_order_low_pass(1000.0));

        session.start_sweep(slow_sweep()).await.unwrap();
        assert!(session.is_sweeping().await);
        assert!(matches!(
            session.start_logging(dir.path(), 0.5).await,
            Err(BenchError::Busy(_))
        ));
        assert!(matches!(
            session.start_sweep(slow_sweep()).await,
            Err(BenchError::Busy(_))
        ));

        session.abort_sweep();
        let report = session.wait_sweep().await.unwrap();
        assert_eq!(report.status, SweepStatus::Aborted);

        session.start_logging(dir.path(), 0.5).await.unwrap();
        assert!(matches!(
            session.start_sweep(slow_sweep()).await,
            Err(BenchError::Busy(_))
        ));
        tokio::time::sleep(Duration::from_millis(1200)).await;
        assert_eq!(session.stop_logging().await.unwrap(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn merged_event_queue() {
        let session = BenchSession::simulated(first_order_low_pass(1000.0));
        let mut events = session.subscribe().await;

        let mut config = slow_sweep();
        config.f_min_hz = 100.0;
        config.f_max_hz = 1000.0;
        config.points_per_decade = 1;
        let report = session.sweep(config).await.unwrap();
        assert_eq!(report.points.len(), 2);

        let mut points = 0;
        loop {
            match events.recv().await {
                Some(BenchEvent::Sweep(SweepEvent::Point { .. })) => points += 1,
                Some(BenchEvent::Sweep(SweepEvent::Finished { .. })) => break,
                Some(_) => {}
                None => panic!("event queue closed early"),
            }
        }
        assert_eq!(points, 2);
    }

    #[tokio::test]
    async fn invalid_sweep_rejected_synchronously() {
        let session = BenchSession::simulated(first_order_low_pass(1000.0));
        let mut config = slow_sweep();
        config.points_per_decade = 0;
        assert!(matches!(
            session.start_sweep(config).await,
            Err(BenchError::InvalidConfig(_))
        ));
        assert!(!session.is_sweeping().await);
    }

    #[tokio::test(start_paused = true)]
    async fn abort_completes_with_stalled_subscriber() {
        let session = BenchSession::simulated(first_order_low_pass(1000.0));
        let _stalled = session.subscribe().await;

        let mut config = slow_sweep();
        config.points_per_decade = 1000;
        config.settling_ms = 10;
        assert_eq!(config.point_count(), 4001);

        session.start_sweep(config).await.unwrap();
        tokio::time::sleep(Duration::from_secs(5)).await;
        session.abort_sweep();

        let report = tokio::time::timeout(Duration::from_secs(30), session.wait_sweep())
            .await
            .expect("sweep must end after abort")
            .unwrap();
        assert_eq!(report.status, SweepStatus::Aborted);
        assert!(report.points.len() > DEFAULT_CAPACITY);
        assert!(report.points.len() < 4001);
        assert!(!session.generator().output_enabled(Channel::One).await.unwrap());
    }
}
