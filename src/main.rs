//! Headless front-end for the bench.
//!
//! # Usage
//!
//! List serial ports and find the instruments:
//! ```bash
//! owon-bench ports
//! owon-bench detect
//! ```
//!
//! Characterize a filter and export the Bode plot:
//! ```bash
//! owon-bench sweep --f-min 10 --f-max 100000 --ppd 10 --output rc.csv
//! ```
//!
//! Log DC volts every 0.5 s for a minute:
//! ```bash
//! owon-bench log --mode volt_dc --interval 0.5 --duration 60
//! ```
//!
//! Every instrument command accepts `--simulate`, which runs against an in-process
//! FY6900 and XDM multimeter wired to a first-order RC low-pass.

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use owon_bench::bode::estimate_cutoff;
use owon_bench::config::AppConfig;
use owon_bench::data::save_bode_csv;
use owon_bench::detection::{self, Detector};
use owon_bench::filter_calc;
use owon_bench::hardware::mock::{first_order_low_pass, install_serial_devices, MockGenerator};
use owon_bench::logging::{self, TracingConfig};
use owon_bench::measurement::MeasurementMode;
use owon_bench::protocol::Channel;
use owon_bench::session::BenchSession;
use owon_bench::sweep::{Scale, SweepConfig, SweepStatus};
use owon_bench::transport::loopback::LoopbackOpener;
use owon_bench::transport::{PortOpener, SystemPortOpener};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

const SIM_MULTIMETER_PORT: &str = "SIM-XDM";
const SIM_GENERATOR_PORT: &str = "SIM-FY6900";

#[derive(Parser)]
#[command(name = "owon-bench")]
#[command(about = "Serial test bench: detection, Bode sweeps and data logging", long_about = None)]
struct Cli {
    /// Configuration file (defaults to the user's config directory)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Also write logs to this file
    #[arg(long, global = true)]
    log_file: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List serial ports
    Ports,

    /// Probe serial ports for the multimeter and the generator
    Detect {
        #[arg(long)]
        simulate: bool,
    },

    /// Cut-off / resonance frequency of common filter topologies
    Filter {
        #[command(subcommand)]
        kind: FilterKind,
    },

    /// Frequency sweep of the network between generator and multimeter
    Sweep {
        #[arg(long, default_value_t = 10.0)]
        f_min: f64,
        #[arg(long, default_value_t = 100_000.0)]
        f_max: f64,
        /// Points per decade
        #[arg(long, default_value_t = 10)]
        ppd: u32,
        /// log10 or linear
        #[arg(long, default_value = "log10")]
        scale: Scale,
        #[arg(long, default_value_t = 500)]
        settling_ms: u64,
        /// Input amplitude, volts RMS
        #[arg(long, default_value_t = 1.0)]
        ue: f64,
        /// Generator channel (1 or 2)
        #[arg(long, default_value_t = 1)]
        channel: u8,
        /// Bode CSV export
        #[arg(long)]
        output: Option<PathBuf>,
        #[arg(long)]
        simulate: bool,
        /// Cut-off of the simulated RC network
        #[arg(long, default_value_t = 1000.0)]
        sim_cutoff: f64,
    },

    /// Log multimeter readings to CSV until the duration elapses or Ctrl-C
    Log {
        /// Output directory (defaults to logging.output_dir)
        #[arg(long)]
        dir: Option<PathBuf>,
        /// Seconds between samples (defaults to logging.default_interval_s)
        #[arg(long)]
        interval: Option<f64>,
        /// Stop after this many seconds
        #[arg(long)]
        duration: Option<f64>,
        #[arg(long, default_value = "volt_dc")]
        mode: MeasurementMode,
        #[arg(long)]
        simulate: bool,
    },
}

#[derive(Subcommand)]
enum FilterKind {
    /// First-order RC low-pass
    RcLowPass { r: f64, c: f64 },
    /// First-order RC high-pass
    RcHighPass { r: f64, c: f64 },
    /// Wien bridge with equal R and C
    WienSymmetric { r: f64, c: f64 },
    /// Wien bridge, general form
    Wien { r1: f64, r2: f64, c1: f64, c2: f64 },
    /// Series RLC resonance and quality factor
    Rlc { r: f64, l: f64, c: f64 },
    /// Twin-T notch
    TwinT { r: f64, c: f64 },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => AppConfig::load(path),
        None => AppConfig::load_default(),
    }
    .context("loading configuration")?;
    config.validate().context("validating configuration")?;

    let mut tracing = TracingConfig::from_app_config(&config)?;
    if let Some(path) = &cli.log_file {
        tracing = tracing.with_log_file(path);
    }
    logging::init(tracing)?;

    match cli.command {
        Commands::Ports => list_ports(),
        Commands::Detect { simulate } => detect(simulate).await,
        Commands::Filter { kind } => {
            filter(kind);
            Ok(())
        }
        Commands::Sweep {
            f_min,
            f_max,
            ppd,
            scale,
            settling_ms,
            ue,
            channel,
            output,
            simulate,
            sim_cutoff,
        } => {
            let sweep = SweepConfig {
                generator_channel: Channel::try_from(channel)?,
                f_min_hz: f_min,
                f_max_hz: f_max,
                points_per_decade: ppd,
                scale,
                settling_ms,
                input_rms_v: ue,
            };
            let session = connect(&config, simulate, sim_cutoff).await?;
            run_sweep(&session, sweep, output).await
        }
        Commands::Log {
            dir,
            interval,
            duration,
            mode,
            simulate,
        } => {
            let dir = dir.unwrap_or_else(|| config.logging.output_dir.clone());
            let interval = interval.unwrap_or(config.logging.default_interval_s);
            let session = connect(&config, simulate, 1000.0).await?;
            run_log(&session, dir, interval, duration, mode).await
        }
    }
}

fn list_ports() -> Result<()> {
    let ports = detection::list_ports()?;
    if ports.is_empty() {
        println!("No serial ports found.");
    }
    for port in ports {
        println!("{:<24} {}", port.name, port.description);
    }
    Ok(())
}

fn simulated_opener(cutoff_hz: f64) -> LoopbackOpener {
    let opener = LoopbackOpener::new();
    install_serial_devices(
        &opener,
        SIM_MULTIMETER_PORT,
        SIM_GENERATOR_PORT,
        Arc::new(MockGenerator::new()),
        first_order_low_pass(cutoff_hz),
    );
    opener
}

async fn detect(simulate: bool) -> Result<()> {
    let result = if simulate {
        let opener = simulated_opener(1000.0);
        let ports = opener.port_names();
        Detector::new(Arc::new(opener)).detect(&ports).await
    } else {
        detection::detect().await?
    };
    println!("{}", serde_json::to_string_pretty(&result)?);
    Ok(())
}

fn filter(kind: FilterKind) {
    let show = |label: &str, value: Option<f64>, unit: &str| match value {
        Some(v) => println!("{label}: {v:.6} {unit}"),
        None => println!("{label}: n/a (arguments must be > 0)"),
    };

    match kind {
        FilterKind::RcLowPass { r, c } => show("f_c", filter_calc::rc_low_pass(r, c), "Hz"),
        FilterKind::RcHighPass { r, c } => show("f_c", filter_calc::rc_high_pass(r, c), "Hz"),
        FilterKind::WienSymmetric { r, c } => {
            show("f_0", filter_calc::wien_symmetric(r, c), "Hz")
        }
        FilterKind::Wien { r1, r2, c1, c2 } => {
            show("f_0", filter_calc::wien_general(r1, r2, c1, c2), "Hz")
        }
        FilterKind::Rlc { r, l, c } => {
            show("f_0", filter_calc::rlc_resonance(l, c), "Hz");
            show("Q", filter_calc::rlc_q(r, l, c), "");
        }
        FilterKind::TwinT { r, c } => show("f_0", filter_calc::twin_t(r, c), "Hz"),
    }
}

async fn connect(config: &AppConfig, simulate: bool, sim_cutoff: f64) -> Result<BenchSession> {
    let (config, opener): (AppConfig, Arc<dyn PortOpener>) = if simulate {
        let mut sim = config.clone();
        sim.serial_multimeter.port = SIM_MULTIMETER_PORT.to_string();
        sim.serial_multimeter.baudrate = 115_200;
        sim.serial_generator.port = SIM_GENERATOR_PORT.to_string();
        sim.serial_generator.baudrate = 115_200;
        (sim, Arc::new(simulated_opener(sim_cutoff)))
    } else {
        (config.clone(), Arc::new(SystemPortOpener))
    };

    BenchSession::connect(&config, opener)
        .await
        .context("connecting to the bench")
}

async fn run_sweep(
    session: &BenchSession,
    config: SweepConfig,
    output: Option<PathBuf>,
) -> Result<()> {
    let total = config.point_count();
    info!(points = total, "Sweep started, Ctrl-C to abort");
    let abort = session.start_sweep(config).await?;
    let ctrl_c = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            abort.abort();
        }
    });

    let report = session.wait_sweep().await;
    ctrl_c.abort();
    let report = report.context("sweep")?;

    println!("{:>5} {:>14} {:>12} {:>12}", "index", "f [Hz]", "u_s [V]", "gain [dB]");
    for p in &report.points {
        println!(
            "{:>5} {:>14.3} {:>12.6} {:>12.3}",
            p.index, p.frequency_hz, p.output_v, p.gain_db
        );
    }
    if report.status == SweepStatus::Aborted {
        println!("Sweep aborted after {} of {total} points.", report.points.len());
    }
    if let Some(fc) = estimate_cutoff(&report.points, None) {
        println!("Estimated -3 dB frequency: {fc:.3} Hz");
    }

    if let Some(path) = output {
        save_bode_csv(&path, &report.config.metadata(), &report.points)
            .with_context(|| format!("writing {}", path.display()))?;
        println!("Saved {}", path.display());
    }
    Ok(())
}

async fn run_log(
    session: &BenchSession,
    dir: PathBuf,
    interval_s: f64,
    duration_s: Option<f64>,
    mode: MeasurementMode,
) -> Result<()> {
    if let Some(d) = duration_s {
        if !(d.is_finite() && d > 0.0) {
            bail!("--duration must be > 0 s, got {d}");
        }
    }

    session.meter().set_mode(mode).await?;
    session.logger().set_listener(|sample| {
        println!("{:>10.3} s  {:.6} {}", sample.elapsed_s, sample.value, sample.unit);
    });
    let path = session.start_logging(&dir, interval_s).await?;
    println!("Logging {mode} to {} (Ctrl-C to stop)", path.display());

    match duration_s {
        Some(d) => {
            tokio::select! {
                _ = tokio::time::sleep(Duration::from_secs_f64(d)) => {}
                _ = tokio::signal::ctrl_c() => {}
            }
        }
        None => {
            tokio::signal::ctrl_c().await?;
        }
    }

    let rows = session.stop_logging().await?;
    println!("{rows} rows written to {}", path.display());
    Ok(())
}
