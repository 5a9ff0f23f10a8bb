//! Delaycam headless runner: capture, delay and optionally record every configured source

use std::path::PathBuf;
use std::time::{Duration, Instant};

use color_eyre::{eyre::eyre, Result};
use tokio::time::{interval, MissedTickBehavior};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use delaycam::{Config, Rig};

const STATS_INTERVAL: Duration = Duration::from_secs(5);

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize error handling and logging
    color_eyre::install()?;
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("delaycam=info")),
        )
        .with_timer(tracing_subscriber::fmt::time::uptime())
        .init();

    info!("Delaycam launching...");

    let config_path = std::env::args_os()
        .nth(1)
        .map(PathBuf::from)
        .or_else(|| std::env::var_os("DELAYCAM_CONFIG").map(PathBuf::from));
    let config = Config::load(config_path.as_deref())?;
    if config.sources.is_empty() {
        return Err(eyre!("No sources configured"));
    }

    // Opening devices blocks; keep it off the async workers
    let open_config = config.clone();
    let mut rig = tokio::task::spawn_blocking(move || Rig::open(&open_config)).await??;
    for (index, name) in rig.names().enumerate() {
        match rig.mode(index) {
            Some(mode) => info!(
                "Source {}: {} {}x{}@{} {:?}",
                index, name, mode.width, mode.height, mode.fps, mode.format
            ),
            None => info!("Source {}: {}", index, name),
        }
    }

    if config.recording.autostart {
        match rig.start_recording(&config.recording.output_dir) {
            Ok(paths) => {
                for path in paths {
                    info!("Recording to {}", path.display());
                }
            }
            Err(e) => error!("Recording not started: {}", e),
        }
    }

    let mut ticker = interval(STATS_INTERVAL);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = ticker.tick() => log_stats(&rig),
            signal = tokio::signal::ctrl_c() => {
                signal?;
                info!("Interrupt received");
                break;
            }
        }
    }

    // Joins capture threads and flushes recordings
    tokio::task::spawn_blocking(move || rig.release()).await?;

    info!("Delaycam shutting down");
    Ok(())
}

fn log_stats(rig: &Rig) {
    let now = Instant::now();
    for (name, handle) in rig.names().zip(rig.handles()) {
        let stats = handle.stats();
        let behind = handle
            .delayed_frame()
            .map_or(Duration::ZERO, |frame| frame.age(now));
        info!(
            "{}: captured={} misses={} recorded={} buffered={} delay={:.1}s behind={:.1}s recording={}",
            name,
            stats.frames_captured,
            stats.capture_misses,
            stats.frames_recorded,
            stats.buffered_frames,
            handle.delay().as_secs_f64(),
            behind.as_secs_f64(),
            handle.is_recording()
        );
    }
}
