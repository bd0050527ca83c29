mod core;
mod utils;
mod workers;

use crate::utils::log_file::FileLogLayer;
use crate::utils::sos::SignalOfStop;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;
use workers::args::{Args, Command};
use workers::console;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let (args, settings) = Args::load()?;

    // webrtc_ice reports late STUN responses as "unknown TransactionID"
    // warnings; they are harmless, so keep that target quiet.
    let filter = match settings.verbose {
        0 => "warn,voidshare=info,webrtc_ice::agent=error",
        1 => "info,webrtc_ice::agent=error",
        2 => "debug,webrtc_ice::agent=error",
        _ => "trace",
    };

    let file_layer = match &settings.log_file {
        Some(path) => Some(FileLogLayer::new(path)?),
        None => None,
    };

    tracing_subscriber::registry()
        .with(EnvFilter::new(filter))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(file_layer)
        .init();

    let sos = SignalOfStop::new();

    // Ctrl+C handler
    let sos_clone = sos.clone();
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        sos_clone.cancel();
    });

    let result = match &args.command {
        Command::Relay { .. } => console::run_relay(&settings, sos.clone()).await,
        Command::Send {
            target, file, mime, ..
        } => console::run_send(&settings, target, file, mime.clone(), sos.clone()).await,
        Command::Receive { yes, keep_open, .. } => {
            console::run_receive(&settings, *yes, *keep_open, sos.clone()).await
        }
    };

    // An abandoned stdin prompt would keep the runtime from shutting down.
    if sos.cancelled() {
        if let Err(e) = &result {
            eprintln!("Error: {e:#}");
        }
        std::process::exit(130);
    }
    result
}
