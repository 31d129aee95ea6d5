//! Background time-series logger.
//!
//! State machine: **Idle → Running → Idle**. [`DataLogger::start`] freezes the
//! multimeter's current mode, creates `<dir>/owon_log_YYYYMMDD_HHMMSS.csv` and spawns a
//! sampling task. Each tick of the task:
//!
//! 1. calls `measure()` on the meter,
//! 2. computes `elapsed_s` against the start instant,
//! 3. appends a CSV row,
//! 4. calls the registered listener and publishes a [`LogEvent::Sample`].
//!
//! A failed measurement skips the tick (no row, no callback) and the loop carries on.
//! Ticks are scheduled at `t0 + k·interval`, so a slow reading does not shift the ones
//! after it. The listener runs on the sampling task; UI code should subscribe to the
//! bounded event queue instead of touching its state from the callback.

use crate::data::LogCsvWriter;
use crate::error::{BenchError, BenchResult};
use crate::events::EventDistributor;
use crate::hardware::capabilities::MeasurementSource;
use crate::measurement::{MeasurementMode, MeasurementSample};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

/// Callback invoked on the sampling task for every recorded sample.
pub type SampleListener = Arc<dyn Fn(&MeasurementSample) + Send + Sync>;

/// Logger lifecycle and sample notifications.
#[derive(Debug, Clone)]
pub enum LogEvent {
    Started {
        path: PathBuf,
        mode: MeasurementMode,
        interval_s: f64,
    },
    Sample(MeasurementSample),
    /// A tick was skipped because the reading failed.
    Skipped { message: String },
    /// The file could not be written; the logger stopped sampling.
    Failed { message: String },
    Stopped { path: PathBuf, rows: usize },
}

struct RunningLog {
    path: PathBuf,
    stop_tx: watch::Sender<bool>,
    task: JoinHandle<BenchResult<usize>>,
}

/// Periodic multimeter sampler writing a CSV log.
pub struct DataLogger {
    meter: Arc<dyn MeasurementSource>,
    listener: Arc<StdMutex<Option<SampleListener>>>,
    events: Arc<EventDistributor<LogEvent>>,
    running: Mutex<Option<RunningLog>>,
}

impl DataLogger {
    pub fn new(meter: Arc<dyn MeasurementSource>) -> Self {
        Self::with_events(meter, Arc::new(EventDistributor::default()))
    }

    /// Logger publishing into an existing distributor.
    pub fn with_events(
        meter: Arc<dyn MeasurementSource>,
        events: Arc<EventDistributor<LogEvent>>,
    ) -> Self {
        Self {
            meter,
            listener: Arc::new(StdMutex::new(None)),
            events,
            running: Mutex::new(None),
        }
    }

    /// Register the per-sample callback, replacing any previous one.
    pub fn set_listener<F>(&self, listener: F)
    where
        F: Fn(&MeasurementSample) + Send + Sync + 'static,
    {
        *self.listener.lock().unwrap_or_else(|e| e.into_inner()) = Some(Arc::new(listener));
    }

    pub fn clear_listener(&self) {
        *self.listener.lock().unwrap_or_else(|e| e.into_inner()) = None;
    }

    /// Bounded queue of logger events.
    pub async fn subscribe(&self) -> mpsc::Receiver<LogEvent> {
        self.events.subscribe().await
    }

    /// True while the sampling task is alive.
    pub async fn is_logging(&self) -> bool {
        self.running
            .lock()
            .await
            .as_ref()
            .is_some_and(|run| !run.task.is_finished())
    }

    /// Path of the current log file, if running.
    pub async fn current_path(&self) -> Option<PathBuf> {
        self.running
            .lock()
            .await
            .as_ref()
            .filter(|run| !run.task.is_finished())
            .map(|run| run.path.clone())
    }

    /// Start logging into a new file under `output_dir`, sampling every `interval_s`.
    ///
    /// A previous run whose task already ended on a write error counts as idle.
    pub async fn start(&self, output_dir: &Path, interval_s: f64) -> BenchResult<PathBuf> {
        self.start_with(interval_s, || {
            std::fs::create_dir_all(output_dir)?;
            create_log_file(output_dir)
        })
        .await
    }

    async fn start_with<F>(&self, interval_s: f64, open: F) -> BenchResult<PathBuf>
    where
        F: FnOnce() -> BenchResult<LogCsvWriter>,
    {
        if !(interval_s.is_finite() && interval_s > 0.0) {
            return Err(BenchError::InvalidConfig(format!(
                "logging interval must be > 0 s, got {interval_s}"
            )));
        }

        let mut running = self.running.lock().await;
        if running.as_ref().is_some_and(|run| run.task.is_finished()) {
            if let Some(ended) = running.take() {
                reap(ended).await;
            }
        }
        if running.is_some() {
            return Err(BenchError::AlreadyRunning);
        }

        let mode = self.meter.current_mode().await;
        let writer = open()?;
        let path = writer.path().to_path_buf();

        info!(path = %path.display(), %mode, interval_s, "Data logging started");
        self.events
            .broadcast(LogEvent::Started {
                path: path.clone(),
                mode,
                interval_s,
            })
            .await;

        let (stop_tx, stop_rx) = watch::channel(false);
        let task = tokio::spawn(sampling_loop(
            self.meter.clone(),
            writer,
            mode,
            Duration::from_secs_f64(interval_s),
            self.listener.clone(),
            self.events.clone(),
            stop_rx,
        ));

        *running = Some(RunningLog {
            path: path.clone(),
            stop_tx,
            task,
        });
        Ok(path)
    }

    /// Stop logging and close the file. Returns the number of rows written, 0 when the
    /// logger was idle.
    ///
    /// A sample already being taken is completed and recorded before the task exits.
    pub async fn stop(&self) -> BenchResult<usize> {
        let Some(run) = self.running.lock().await.take() else {
            return Ok(0);
        };

        let _ = run.stop_tx.send(true);
        let rows = run.task.await??;

        info!(path = %run.path.display(), rows, "Data logging stopped");
        self.events
            .broadcast(LogEvent::Stopped {
                path: run.path,
                rows,
            })
            .await;
        Ok(rows)
    }
}

/// Join a run whose task already exited on its own.
async fn reap(run: RunningLog) {
    let path = run.path.display();
    match run.task.await {
        Ok(Ok(rows)) => debug!(path = %path, rows, "Previous data log closed"),
        Ok(Err(e)) => warn!(path = %path, error = %e, "Previous data log had failed"),
        Err(e) => warn!(path = %path, error = %e, "Previous data log task died"),
    }
}

/// `owon_log_YYYYMMDD_HHMMSS.csv`, with a numeric suffix if that name is taken.
fn create_log_file(dir: &Path) -> BenchResult<LogCsvWriter> {
    let stamp = chrono::Local::now().format("%Y%m%d_%H%M%S").to_string();
    let mut last_err = None;
    for attempt in 0..100 {
        let name = if attempt == 0 {
            format!("owon_log_{stamp}.csv")
        } else {
            format!("owon_log_{stamp}_{attempt}.csv")
        };
        match LogCsvWriter::create(&dir.join(name)) {
            Ok(writer) => return Ok(writer),
            Err(BenchError::Io(e)) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                last_err = Some(e);
            }
            Err(e) => return Err(e),
        }
    }
    Err(BenchError::Io(last_err.unwrap_or_else(|| {
        std::io::Error::new(std::io::ErrorKind::AlreadyExists, "no free log file name")
    })))
}

async fn sampling_loop(
    meter: Arc<dyn MeasurementSource>,
    mut writer: LogCsvWriter,
    mode: MeasurementMode,
    interval: Duration,
    listener: Arc<StdMutex<Option<SampleListener>>>,
    events: Arc<EventDistributor<LogEvent>>,
    mut stop_rx: watch::Receiver<bool>,
) -> BenchResult<usize> {
    let t0 = Instant::now();
    let mut ticker = tokio::time::interval_at(t0, interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            biased;
            _ = stop_rx.changed() => break,
            _ = ticker.tick() => {}
        }
        if *stop_rx.borrow() {
            break;
        }

        let reading = match meter.measure().await {
            Ok(reading) => reading,
            Err(e) => {
                warn!(error = %e, "Sample skipped");
                events
                    .broadcast(LogEvent::Skipped {
                        message: e.to_string(),
                    })
                    .await;
                continue;
            }
        };

        let sample = MeasurementSample {
            timestamp_iso: chrono::Local::now().to_rfc3339(),
            elapsed_s: t0.elapsed().as_secs_f64(),
            value: reading.value,
            unit: reading.unit.to_string(),
            mode,
            raw: reading.raw,
        };

        if let Err(e) = writer.append(&sample) {
            error!(error = %e, path = %writer.path().display(), "Data log write failed");
            events
                .broadcast(LogEvent::Failed {
                    message: e.to_string(),
                })
                .await;
            return Err(e);
        }
        debug!(elapsed_s = sample.elapsed_s, value = sample.value, "Sample logged");

        let callback = listener
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone();
        if let Some(callback) = callback {
            callback(&sample);
        }
        events.broadcast(LogEvent::Sample(sample)).await;
    }

    writer.finish()
}
