//! relayd - paced camera capture into a streaming or recording pipeline
//!
//! This daemon:
//! 1. Builds the configured pipeline (UDP/RTP, TCP/MPEG-TS, file or raw UDP)
//! 2. Binds the first camera and prints its identification
//! 3. Pumps frames at the configured rate until Ctrl-C, a frame limit or a failure
//! 4. Finalizes the stream and releases the camera

use anyhow::{anyhow, Context, Result};
use clap::Parser;
use std::io::IsTerminal;
use std::path::PathBuf;

use sensor_relay::lifecycle;
use sensor_relay::ui::{StartupProgress, Ui};
use sensor_relay::{CameraSource, Overrides, RelayConfig, StopSignal};

#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Args {
    /// Destination host for UDP outputs.
    host: Option<String>,
    /// Destination port for UDP outputs.
    port: Option<u16>,
    /// Path to a JSON or TOML config file.
    #[arg(long, env = "RELAY_CONFIG")]
    config: Option<PathBuf>,
    /// Camera device: auto, a /dev/video path or a stub:// URL.
    #[arg(long)]
    device: Option<String>,
    /// Output topology (udp-rtp|tcp-mpegts|file|raw-udp).
    #[arg(long)]
    topology: Option<String>,
    /// Output path for the file topology.
    #[arg(long, value_name = "PATH")]
    output: Option<PathBuf>,
    /// Stop after this many frames (debug mode).
    #[arg(long, value_name = "N")]
    frames: Option<u64>,
    /// UI mode for stderr progress (auto|plain|pretty)
    #[arg(long, default_value = "auto", value_name = "MODE")]
    ui: String,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();
    let ui = Ui::from_args(Some(&args.ui), std::io::stderr().is_terminal());

    println!(
        "{} {} (built for {}-{})",
        env!("CARGO_PKG_NAME"),
        env!("CARGO_PKG_VERSION"),
        std::env::consts::ARCH,
        std::env::consts::OS
    );

    let overrides = Overrides {
        device: args.device,
        topology: args.topology,
        host: args.host,
        port: args.port,
        file_path: args.output,
        frame_limit: args.frames,
    };
    let cfg = RelayConfig::load_with(args.config.as_deref(), &overrides)
        .context("failed to load relay configuration")?;
    log::info!(
        "relayd: {}x{} {:?} @ {} fps, topology {}",
        cfg.stream.width,
        cfg.stream.height,
        cfg.stream.pixel_format,
        cfg.stream.fps,
        cfg.topology()
    );

    let stop = StopSignal::new();
    let handler_stop = stop.clone();
    ctrlc::set_handler(move || handler_stop.request())
        .map_err(|e| anyhow!("error setting Ctrl-C handler: {}", e))?;

    let source = CameraSource::new(cfg.camera_config())?;
    let mut progress = StartupProgress::new(&ui);
    let report = lifecycle::run(&cfg.run_options(), Box::new(source), stop, &mut progress)?;

    if let Some(period) = report.average_period {
        log::info!(
            "relayd: {} frames, average period {:.1} ms",
            report.frames_pushed,
            period.as_secs_f64() * 1000.0
        );
    }
    report.into_result()?;
    Ok(())
}
