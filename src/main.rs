//! # Riello UPS
//!
//! Monitors a Riello UPS over USB and publishes its state.
//!
//! The binary identifies the unit, then polls it at a fixed interval until
//! Ctrl+C. With `--shutdown` it instead runs the shutdown sequence once and
//! exits.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{ArgAction, Parser};
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{fmt, EnvFilter};

use riello_ups::config::Config;
use riello_ups::state::DeviceState;
use riello_ups::telemetry::TelemetryRecorder;
use riello_ups::ups::UpsDriver;
use riello_ups::usb::{NusbConnector, UsbLink};

/// Command line arguments
#[derive(Parser, Debug)]
#[command(name = "riello-ups", version, about = "Riello GPSER/SENTRY UPS driver")]
struct Cli {
    /// TOML configuration file; built-in defaults when omitted
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Increase log verbosity (-v debug, -vv trace)
    #[arg(short, long, action = ArgAction::Count)]
    verbose: u8,

    /// Send the shutdown sequence and exit
    #[arg(long)]
    shutdown: bool,
}

fn log_level(verbose: u8) -> tracing::Level {
    match verbose {
        0 => tracing::Level::INFO,
        1 => tracing::Level::DEBUG,
        _ => tracing::Level::TRACE,
    }
}

/// Install the stderr subscriber, plus a daily log file when `dir` is set
///
/// The returned guard must live until exit so buffered lines get flushed.
fn init_logging(verbose: u8, dir: Option<&Path>) -> Option<WorkerGuard> {
    let filter = EnvFilter::from_default_env().add_directive(log_level(verbose).into());

    let mut guard = None;
    let file_layer = dir.map(|dir| {
        let appender = tracing_appender::rolling::daily(dir, "riello-ups.log");
        let (writer, worker) = tracing_appender::non_blocking(appender);
        guard = Some(worker);
        fmt::layer().with_writer(writer).with_ansi(false)
    });

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer())
        .with(file_layer)
        .init();

    guard
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => Config::load(path)
            .with_context(|| format!("Failed to load configuration from {}", path.display()))?,
        None => Config::default(),
    };

    let _log_guard = init_logging(cli.verbose, config.logging.dir.as_deref());
    info!("Riello UPS v{} starting...", env!("CARGO_PKG_VERSION"));

    let link = UsbLink::new(
        Box::new(NusbConnector),
        config.matcher(),
        config.chunker_settings(),
    );
    let mut driver = UpsDriver::new(link, DeviceState::new(), config.driver_settings());

    driver
        .initialize()
        .await
        .context("Failed to initialize the UPS")?;

    if cli.shutdown {
        driver.shutdown().await.context("Shutdown sequence failed")?;
        info!("Shutdown sequence accepted by the UPS");
        return Ok(());
    }

    let mut recorder = if config.telemetry.enabled {
        Some(TelemetryRecorder::new(
            &config.telemetry.log_dir,
            config.telemetry.max_records_per_file,
            config.telemetry.max_files_to_keep,
        )?)
    } else {
        None
    };

    let mut poll = interval(config.poll_interval());
    poll.set_missed_tick_behavior(MissedTickBehavior::Delay);

    info!("Polling every {}s", config.poll.interval_s);
    info!("Press Ctrl+C to exit");

    let mut last_status = String::new();

    loop {
        tokio::select! {
            _ = poll.tick() => {
                match driver.update_info().await {
                    Ok(true) => {
                        let status = driver.sink().status();
                        if status != last_status {
                            info!("UPS status: {}", status);
                            last_status = status.to_string();
                        }

                        if let Some(recorder) = recorder.as_mut() {
                            if let Err(e) = recorder.record(driver.family(), driver.snapshot()) {
                                warn!("Failed to record telemetry: {}", e);
                            }
                        }
                    }
                    Ok(false) => debug!("Poll failed ({} in a row)", driver.failures().count()),
                    Err(e) => {
                        error!("{}", e);
                        return Err(e.into());
                    }
                }
            }

            _ = tokio::signal::ctrl_c() => {
                info!("Received Ctrl+C, shutting down...");
                break;
            }
        }
    }

    Ok(())
}
