//! alert_poller - polls the capture API and forwards emergencies
//!
//! Each poll fetches an envelope, captions the image, and posts it to the
//! alert sink when the caption mentions a fire or a crash.

use anyhow::{anyhow, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use emergency_watch::config::parse_statuses;
use emergency_watch::poller::{
    AlertSink, CaptionClassifier, Captioner, CommandCaptioner, FixedCaptioner, Poller,
};
use emergency_watch::PollerConfig;

#[derive(Parser, Debug)]
#[command(about = "Poll the capture API and forward fire/crash alerts")]
struct Args {
    /// Config file (JSON, or TOML when the extension is .toml).
    #[arg(long, env = "EMERGENCY_POLLER_CONFIG")]
    config: Option<PathBuf>,

    /// Capture API URL to poll; overrides the config file.
    #[arg(long)]
    endpoint: Option<String>,

    /// Alert sink URL; overrides the config file.
    #[arg(long)]
    alert_url: Option<String>,

    /// Delay between polls in milliseconds.
    #[arg(long)]
    interval_ms: Option<u64>,

    /// Comma-separated HTTP statuses the alert sink may answer with.
    #[arg(long)]
    accept_status: Option<String>,

    /// Use a fixed caption instead of running the captioner command.
    #[arg(long, conflicts_with = "captioner")]
    caption: Option<String>,

    /// Captioner command: reads an image on stdin, prints a caption.
    #[arg(long)]
    captioner: Option<String>,

    /// Poll once, print the label and exit.
    #[arg(long)]
    once: bool,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    let mut config = PollerConfig::load_from(args.config.as_deref())?;
    if let Some(endpoint) = args.endpoint {
        config.endpoint = endpoint;
    }
    if let Some(alert_url) = args.alert_url {
        config.alert_url = alert_url;
    }
    if let Some(interval_ms) = args.interval_ms {
        config.interval = Duration::from_millis(interval_ms);
    }
    if let Some(statuses) = args.accept_status.as_deref() {
        config.accepted_statuses = parse_statuses(statuses)?;
    }
    if args.captioner.is_some() {
        config.captioner_command = args.captioner;
    }
    config.validate()?;

    let captioner: Box<dyn Captioner> = match (args.caption, config.captioner_command.as_deref()) {
        (Some(caption), _) => Box::new(FixedCaptioner(caption)),
        (None, Some(command)) => Box::new(CommandCaptioner::from_command_line(command)?),
        (None, None) => {
            return Err(anyhow!(
                "no captioner configured; set captioner_command or pass --caption"
            ))
        }
    };

    let sink = AlertSink::new(
        config.alert_url.clone(),
        config.timeout,
        config.accepted_statuses.clone(),
    );
    let mut poller = Poller::new(
        config.endpoint.clone(),
        config.timeout,
        CaptionClassifier::new(captioner),
        sink,
    );

    if args.once {
        let report = poller.poll();
        println!("{}", report.label);
        return Ok(());
    }

    let shutdown = Arc::new(AtomicBool::new(false));
    let shutdown_handler = shutdown.clone();
    ctrlc::set_handler(move || {
        shutdown_handler.store(true, Ordering::SeqCst);
    })
    .map_err(|err| anyhow!("error setting Ctrl-C handler: {err}"))?;

    log::info!(
        "alert_poller polling {} every {:?}, alerts to {}",
        config.endpoint,
        config.interval,
        config.alert_url
    );
    poller.run(config.interval, &shutdown);
    log::info!("alert_poller stopped");
    Ok(())
}
