//! Data logger behavior on a paused clock.

use owon_bench::data::load_log_csv;
use owon_bench::data_logger::{DataLogger, LogEvent};
use owon_bench::hardware::capabilities::MeasurementSource;
use owon_bench::hardware::mock::MockMultimeter;
use owon_bench::measurement::MeasurementMode;
use owon_bench::BenchError;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

// =============================================================================
// Sampling
// =============================================================================

#[tokio::test(start_paused = true)]
async fn test_ten_hertz_for_one_second() {
    let dir = tempfile::tempdir().unwrap();
    let logger = DataLogger::new(Arc::new(MockMultimeter::ramp(0.0, 0.001)));

    let path = logger.start(dir.path(), 0.1).await.unwrap();
    tokio::time::sleep(Duration::from_secs(1)).await;
    let rows = logger.stop().await.unwrap();
    assert!((9..=11).contains(&rows), "{rows} rows");

    let text = std::fs::read_to_string(&path).unwrap();
    assert_eq!(
        text.lines().next(),
        Some("timestamp_iso,elapsed_s,value,unit,mode")
    );

    let series = load_log_csv(&path).unwrap();
    assert_eq!(series.len(), rows);
    for pair in series.records.windows(2) {
        let gap = pair[1].elapsed_s - pair[0].elapsed_s;
        assert!(gap > 0.0, "elapsed_s must increase");
        assert!((gap - 0.1).abs() <= 0.005, "gap {gap}");
    }
    assert!(series.records.iter().all(|r| r.mode == "volt_dc" && r.unit == "V"));
}

#[tokio::test(start_paused = true)]
async fn test_mode_frozen_at_start() {
    let dir = tempfile::tempdir().unwrap();
    let meter = Arc::new(MockMultimeter::fixed(50.0));
    meter.set_mode(MeasurementMode::Freq).await.unwrap();
    let logger = DataLogger::new(meter);

    let path = logger.start(dir.path(), 0.5).await.unwrap();
    tokio::time::sleep(Duration::from_millis(1200)).await;
    logger.stop().await.unwrap();

    let series = load_log_csv(&path).unwrap();
    assert_eq!(series.len(), 3);
    assert!(series
        .records
        .iter()
        .all(|r| r.mode == "freq" && r.unit == "Hz" && r.value == Some(50.0)));
}

#[tokio::test(start_paused = true)]
async fn test_failed_reading_skips_tick() {
    let dir = tempfile::tempdir().unwrap();
    let meter = Arc::new(MockMultimeter::ramp(1.0, 1.0));
    meter.fail_next(2);
    let logger = DataLogger::new(meter);
    let mut events = logger.subscribe().await;

    logger.start(dir.path(), 0.25).await.unwrap();
    tokio::time::sleep(Duration::from_millis(1100)).await;
    assert_eq!(logger.stop().await.unwrap(), 3);

    let mut skipped = 0;
    while let Ok(event) = events.try_recv() {
        if matches!(event, LogEvent::Skipped { .. }) {
            skipped += 1;
        }
    }
    assert_eq!(skipped, 2);
}

// =============================================================================
// Lifecycle
// =============================================================================

#[tokio::test(start_paused = true)]
async fn test_no_callbacks_after_stop() {
    let dir = tempfile::tempdir().unwrap();
    let logger = DataLogger::new(Arc::new(MockMultimeter::ramp(0.0, 1.0)));
    let calls = Arc::new(AtomicUsize::new(0));
    {
        let calls = calls.clone();
        logger.set_listener(move |_| {
            calls.fetch_add(1, Ordering::SeqCst);
        });
    }

    logger.start(dir.path(), 0.1).await.unwrap();
    tokio::time::sleep(Duration::from_millis(550)).await;
    let rows = logger.stop().await.unwrap();
    let after_stop = calls.load(Ordering::SeqCst);
    assert_eq!(after_stop, rows);

    tokio::time::sleep(Duration::from_secs(2)).await;
    assert_eq!(calls.load(Ordering::SeqCst), after_stop);
    assert!(!logger.is_logging().await);
}

#[tokio::test(start_paused = true)]
async fn test_start_twice_and_bad_interval() {
    let dir = tempfile::tempdir().unwrap();
    let logger = DataLogger::new(Arc::new(MockMultimeter::fixed(1.0)));

    assert!(matches!(
        logger.start(dir.path(), 0.0).await,
        Err(BenchError::InvalidConfig(_))
    ));
    assert_eq!(logger.stop().await.unwrap(), 0);

    logger.start(dir.path(), 1.0).await.unwrap();
    assert!(matches!(
        logger.start(dir.path(), 1.0).await,
        Err(BenchError::AlreadyRunning)
    ));
    logger.stop().await.unwrap();
}
