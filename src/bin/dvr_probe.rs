//! dvr_probe - find out which protocol a DVR speaks
//!
//! Reads one DVR record (JSON), walks the handler priority chain and prints
//! the selected kind with the stream link it yields. Exits non-zero when no
//! handler succeeds.

use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use watchpost::dvr::{DefaultHandlerFactory, DvrConfig, ProbeOutcome, ProtocolDetector};
use watchpost::CameraConfig;

#[derive(Parser, Debug)]
#[command(author, version, about = "Detect the protocol of a DVR record")]
struct Args {
    /// DVR record as a JSON object (ip, port, username, password, rtsp_url, ...).
    #[arg(long, value_name = "FILE")]
    dvr: PathBuf,

    /// Per-probe timeout, overriding the record's own `timeout`.
    #[arg(long)]
    probe_timeout_ms: Option<u64>,

    /// Probe every handler kind and report each outcome instead of stopping at the first success.
    #[arg(long)]
    survey: bool,

    /// Directory holding analog capture device nodes.
    #[arg(long, default_value = "/dev")]
    device_root: PathBuf,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();
    let args = Args::parse();

    let raw = std::fs::read_to_string(&args.dvr)
        .with_context(|| format!("failed to read {}", args.dvr.display()))?;
    let record: DvrConfig = serde_json::from_str(&raw)
        .with_context(|| format!("invalid DVR record {}", args.dvr.display()))?;

    let mut detector =
        ProtocolDetector::new(Arc::new(DefaultHandlerFactory::with_device_root(&args.device_root)));
    if let Some(ms) = args.probe_timeout_ms {
        detector = detector.with_probe_timeout(Duration::from_millis(ms));
    }

    let name = args
        .dvr
        .file_stem()
        .map(|stem| stem.to_string_lossy().into_owned())
        .unwrap_or_else(|| "dvr".to_string());

    let handler = if args.survey {
        let survey = detector.survey(&record);
        for report in &survey.reports {
            let kind = report.kind.name();
            match &report.outcome {
                ProbeOutcome::Skipped { missing } => {
                    println!("{kind:<12} skipped (missing {})", missing.join(", "))
                }
                ProbeOutcome::Failed { reason } => println!("{kind:<12} failed: {reason}"),
                ProbeOutcome::Succeeded => println!("{kind:<12} ok"),
            }
        }
        survey.into_handler(&name)?
    } else {
        detector.resolve(&name, &record)?
    };
    let camera = CameraConfig::with_link(name, handler.stream_link());
    println!("detected: {}", handler.kind());
    println!("stream:   {}", camera.link_display());
    Ok(())
}
