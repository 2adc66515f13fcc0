//! Argus multi-camera motion recorder

use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use argus::capture::DeviceOpener;
use argus::{MonitorSupervisor, SessionState, Settings};
use clap::Parser;
use color_eyre::{eyre::eyre, Result};
use tracing::{info, warn};

const STATUS_INTERVAL: Duration = Duration::from_secs(30);

fn init_tracing() {
    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::util::SubscriberInitExt;
    use tracing_subscriber::EnvFilter;

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("argus=info"));
    let fmt = tracing_subscriber::fmt::layer()
        .with_timer(tracing_subscriber::fmt::time::uptime())
        .with_thread_names(true);

    let registry = tracing_subscriber::registry().with(filter).with(fmt);
    #[cfg(feature = "profiling")]
    let registry = registry.with(tracing_tracy::TracyLayer::default());
    registry.init();
}

/// Argus - multi-camera motion recorder
#[derive(Parser, Debug)]
#[command(name = "argus")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// TOML settings file; `ARGUS__*` environment variables override it
    #[arg(value_name = "CONFIG")]
    config: Option<PathBuf>,

    /// Print the saved recordings, newest first, and exit
    #[arg(short, long)]
    list: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize error handling and logging
    color_eyre::install()?;
    let args = Args::parse();
    init_tracing();

    let settings = Settings::load(args.config.as_deref())?;
    let supervisor = MonitorSupervisor::new(settings, Arc::new(DeviceOpener));

    if args.list {
        for entry in supervisor.list_recordings()? {
            println!(
                "{}\t{}\t{} bytes",
                entry.created_at.format("%Y-%m-%d %H:%M:%S"),
                entry.filename,
                entry.size_bytes
            );
        }
        return Ok(());
    }

    info!("Argus launching...");
    info!(
        "Recording {}s clips to {}",
        supervisor.settings().recording.clip_seconds,
        supervisor.settings().recording.root.display()
    );

    let supervisor = Arc::new(Mutex::new(supervisor));
    supervisor
        .lock()
        .map_err(|_| eyre!("supervisor lock poisoned"))?
        .start_configured()?;

    // Periodic status report
    let reporter = {
        let supervisor = supervisor.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(STATUS_INTERVAL);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Ok(current) = supervisor.lock() else {
                    break;
                };
                for (id, status) in current.status_all() {
                    match status.state {
                        SessionState::Streaming => info!(
                            camera = %id,
                            frames = status.frames_processed,
                            clips = status.clips_written,
                            recording = status.recording,
                            "Streaming from {}",
                            status.device.as_deref().unwrap_or("?")
                        ),
                        SessionState::Disconnected => warn!(
                            camera = %id,
                            "Disconnected: {}",
                            status.last_error.as_deref().unwrap_or("unknown error")
                        ),
                        state => info!(camera = %id, "{:?}", state),
                    }
                }
            }
        })
    };

    tokio::signal::ctrl_c().await?;
    info!("Shutting down, finalizing open clips");
    reporter.abort();

    tokio::task::spawn_blocking(move || {
        if let Ok(mut supervisor) = supervisor.lock() {
            supervisor.stop();
        }
    })
    .await?;

    info!("Argus shut down");
    Ok(())
}
