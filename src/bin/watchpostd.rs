//! watchpostd - multi-camera intrusion detection daemon
//!
//! This daemon:
//! 1. Loads the daemon configuration and the camera list
//! 2. Resolves DVR-backed cameras to a stream link
//! 3. Runs one acquisition loop per camera and the detection worker pool
//! 4. Sends throttled alerts to every configured channel, and optionally
//!    restarts Failed cameras on a fixed interval
//! 5. Optionally writes a labelled mosaic of all cameras to an image file
//!
//! Ctrl-C stops the streams, joins the workers and drains pending alerts.

use anyhow::{anyhow, Context, Result};
use clap::Parser;
use std::io::IsTerminal;
use std::path::PathBuf;
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::Arc;
use std::time::{Duration, Instant};

use watchpost::{
    build_channels, config::load_cameras, save_mosaic, DefaultHandlerFactory,
    DefaultSourceFactory, DiffDetector, Mosaic, Pipeline, WatchpostConfig,
};

#[path = "../ui.rs"]
mod ui;

const TICK: Duration = Duration::from_millis(250);

#[derive(Parser, Debug)]
#[command(author, version, about = "Multi-camera intrusion detection daemon")]
struct Args {
    /// Daemon configuration file (TOML, or JSON with a .json extension).
    #[arg(long, env = "WATCHPOST_CONFIG")]
    config: Option<PathBuf>,

    /// Camera list, overriding `cameras_path` from the configuration.
    #[arg(long)]
    cameras: Option<PathBuf>,

    /// Write a mosaic of every camera to this file (.png, .ppm or .jpg).
    #[arg(long, value_name = "FILE")]
    mosaic_out: Option<PathBuf>,

    /// Seconds between mosaic writes.
    #[arg(long, default_value_t = 5)]
    mosaic_interval_secs: u64,

    /// Seconds between health log lines.
    #[arg(long, env = "WATCHPOST_HEALTH_SECS", default_value_t = 30)]
    health_interval_secs: u64,

    /// Seconds between restarts of Failed cameras (0 disables).
    #[arg(long, env = "WATCHPOST_RESTART_FAILED_SECS", default_value_t = 0)]
    restart_failed_secs: u64,

    /// UI mode for stderr progress (auto|plain|pretty).
    #[arg(long, default_value = "auto", value_name = "MODE")]
    ui: String,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();
    let ui = ui::Ui::from_args(&args.ui, std::io::stderr().is_terminal());

    let mut config = {
        let _stage = ui.stage("Load configuration");
        WatchpostConfig::load_from(args.config.as_deref())?
    };
    if let Some(path) = &args.cameras {
        config.cameras_path = path.clone();
    }
    let cameras = {
        let _stage = ui.stage("Load camera list");
        load_cameras(&config.cameras_path)
            .with_context(|| format!("camera list {}", config.cameras_path.display()))?
    };
    log::info!(
        "{} cameras from {}",
        cameras.len(),
        config.cameras_path.display()
    );

    let pipeline = {
        let _stage = ui.stage("Start pipeline");
        Pipeline::start(
            &config,
            cameras,
            Arc::new(DefaultSourceFactory),
            Arc::new(DiffDetector::default()),
            build_channels(&config.channels),
            Arc::new(DefaultHandlerFactory::new()),
        )?
    };
    log::info!(
        "watchpostd {} running; channels: {}",
        env!("CARGO_PKG_VERSION"),
        pipeline.channel_names().join(", ")
    );

    let (tx, rx) = mpsc::channel();
    ctrlc::set_handler(move || {
        let _ = tx.send(());
    })
    .map_err(|e| anyhow!("error setting Ctrl-C handler: {e}"))?;

    let health_every = Duration::from_secs(args.health_interval_secs.max(1));
    let mosaic_every = Duration::from_secs(args.mosaic_interval_secs.max(1));
    let restart_every =
        (args.restart_failed_secs > 0).then(|| Duration::from_secs(args.restart_failed_secs));
    let mut mosaic = Mosaic::default();
    let mut last_health = Instant::now();
    let mut last_mosaic = Instant::now();
    let mut last_restart = Instant::now();

    loop {
        match rx.recv_timeout(TICK) {
            Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
            Err(RecvTimeoutError::Timeout) => {}
        }

        if last_health.elapsed() >= health_every {
            let stats = pipeline.stats();
            log::info!("{}", stats.health_line());
            ui.camera_summary(&stats.streams);
            last_health = Instant::now();
        }

        if let Some(every) = restart_every {
            if last_restart.elapsed() >= every {
                let restarted = pipeline.restart_failed();
                if restarted > 0 {
                    log::info!("restarted {restarted} failed camera(s)");
                }
                last_restart = Instant::now();
            }
        }

        if let Some(path) = &args.mosaic_out {
            if last_mosaic.elapsed() >= mosaic_every {
                let image = mosaic.compose(&pipeline.handles());
                if let Err(e) = save_mosaic(&image, path) {
                    log::warn!("mosaic write failed: {:#}", e);
                }
                last_mosaic = Instant::now();
            }
        }
    }

    log::info!("shutdown signal received, stopping pipeline...");
    let stats = {
        let _stage = ui.stage("Stop pipeline");
        pipeline.stop()
    };
    log::info!("{}", stats.health_line());
    Ok(())
}
