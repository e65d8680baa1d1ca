//! capture_server - camera capture API for Emergency Watch
//!
//! This daemon:
//! 1. Opens the camera and loads the detectors
//! 2. Serves screenshots and detection crops as MessagePack envelopes
//! 3. Keeps the newest artifacts on disk and sweeps the rest

use anyhow::{anyhow, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::mpsc;
use std::time::Duration;

use emergency_watch::{ApiServer, CaptureServices, ImageEncoding, ServerConfig};

#[derive(Parser, Debug)]
#[command(about = "Throttled camera capture API")]
struct Args {
    /// Config file (JSON, or TOML when the extension is .toml).
    #[arg(long, env = "EMERGENCY_SERVER_CONFIG")]
    config: Option<PathBuf>,

    /// Listen address; overrides the config file.
    #[arg(long)]
    addr: Option<String>,

    /// Camera device (e.g. /dev/video0 or stub://camera); overrides the config file.
    #[arg(long)]
    device: Option<String>,

    /// Image encoding inside envelopes: base64 or binary.
    #[arg(long)]
    image_encoding: Option<ImageEncoding>,

    /// Stop after this many consecutive capture failures.
    #[arg(long)]
    max_failures: Option<u32>,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    let mut config = ServerConfig::load_from(args.config.as_deref())?;
    if let Some(addr) = args.addr {
        config.api_addr = addr;
    }
    if let Some(device) = args.device {
        config.camera.device = device;
    }
    if let Some(encoding) = args.image_encoding {
        config.image_encoding = encoding;
    }
    if args.max_failures.is_some() {
        config.max_consecutive_failures = args.max_failures;
    }
    config.validate()?;

    let services = CaptureServices::build(&config)?;
    let api_handle = ApiServer::new(config.api_config(), services).spawn()?;
    log::info!("capture api listening on {}", api_handle.addr);
    log::info!(
        "capture_server running. camera {}, screenshots in {}",
        config.camera.device,
        config.storage.screenshots_dir.display()
    );

    let (tx, rx) = mpsc::channel();
    ctrlc::set_handler(move || {
        let _ = tx.send(());
    })
    .map_err(|err| anyhow!("error setting Ctrl-C handler: {err}"))?;

    log::info!("capture_server waiting for shutdown signal (Ctrl-C)...");
    loop {
        match rx.recv_timeout(Duration::from_millis(250)) {
            Ok(()) | Err(mpsc::RecvTimeoutError::Disconnected) => {
                log::info!("shutdown signal received, stopping capture api...");
                break;
            }
            Err(mpsc::RecvTimeoutError::Timeout) => {
                if api_handle.is_finished() {
                    break;
                }
            }
        }
    }
    api_handle.stop()
}
