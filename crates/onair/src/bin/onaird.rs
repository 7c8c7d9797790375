//! onaird - play rundowns against configured broadcast devices
//!
//! Each configured device gets its own session (scheduler, state history,
//! command sink). `play` feeds the rundown's timeline updates to every
//! session slightly ahead of their effective time and lets the schedulers fire
//! the resulting commands.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use onair::{
    profiles, telemetry, Clock, DeviceSession, LoggingSink, Rundown, SchedulerOptions,
    SystemClock, Timestamp,
};
use onairconf::{ConfigSources, OnAirConfig};

/// onaird - broadcast playout core
#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Cli {
    /// Config file to use instead of ./onair.toml
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Play a rundown file against every configured device
    Play {
        /// Rundown JSON file
        rundown: PathBuf,

        /// How far ahead of its effective time each update is handed over
        #[arg(long, default_value = "200")]
        lookahead_ms: u64,

        /// How long to keep running after the last update
        #[arg(long, default_value = "1000")]
        linger_ms: u64,
    },

    /// Print the effective configuration and where it came from
    Config,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let (config, sources) = OnAirConfig::load_with_sources_from(cli.config.as_deref())
        .context("Failed to load configuration")?;

    match cli.command {
        Commands::Config => {
            print_config(&config, &sources);
            Ok(())
        }
        Commands::Play {
            rundown,
            lookahead_ms,
            linger_ms,
        } => {
            telemetry::init(&config.telemetry)?;
            info!("onaird {} starting", env!("CARGO_PKG_VERSION"));
            for file in &sources.files {
                info!(file = %file.display(), "config file loaded");
            }
            play(&config, &rundown, lookahead_ms, linger_ms).await
        }
    }
}

fn print_config(config: &OnAirConfig, sources: &ConfigSources) {
    if sources.files.is_empty() {
        println!("# no config files found, using defaults");
    }
    for file in &sources.files {
        println!("# file: {}", file.display());
    }
    for var in &sources.env_overrides {
        println!("# env:  {}", var);
    }
    println!("# built-in profiles: {}", profiles::names().join(", "));
    println!();
    print!("{}", config.to_toml());
}

struct Device {
    session: DeviceSession,
    options: serde_json::Value,
}

fn build_devices(
    config: &OnAirConfig,
    rundown: &Rundown,
    clock: &Arc<dyn Clock>,
) -> Result<Vec<Device>> {
    for device in rundown.devices() {
        if !config.devices.contains_key(&device) {
            warn!(device.id = %device, "rundown maps layers to an unconfigured device, ignoring");
        }
    }

    let mut devices = Vec::new();
    for (id, device) in &config.devices {
        let Some(profile) = profiles::builtin(&device.profile)
            .with_context(|| format!("Invalid generator tree for profile {}", device.profile))?
        else {
            bail!(
                "device {} uses unknown profile '{}' (known: {})",
                id,
                device.profile,
                profiles::names().join(", ")
            );
        };

        let options = SchedulerOptions::from(&device.scheduler(&config.scheduler));
        info!(
            device.id = %id,
            profile = %device.profile,
            mode = %options.mode,
            "device configured"
        );

        let session = DeviceSession::new(
            id.clone(),
            profile,
            Arc::new(LoggingSink::new(id.clone())),
            Arc::clone(clock),
            options,
        );
        let options = serde_json::to_value(&device.options)
            .with_context(|| format!("Invalid options for device {}", id))?;
        devices.push(Device { session, options });
    }

    if devices.is_empty() {
        bail!("no devices configured; add a [devices.<id>] section");
    }
    Ok(devices)
}

async fn play(config: &OnAirConfig, path: &Path, lookahead_ms: u64, linger_ms: u64) -> Result<()> {
    let json = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read rundown {}", path.display()))?;
    let rundown = Rundown::from_json(&json)
        .with_context(|| format!("Failed to parse rundown {}", path.display()))?;
    info!(
        updates = rundown.updates.len(),
        duration_ms = rundown.duration().millis(),
        "rundown loaded"
    );

    let clock: Arc<dyn Clock> = Arc::new(SystemClock::new());
    let devices = build_devices(config, &rundown, &clock)?;
    for device in &devices {
        device
            .session
            .init(device.options.clone())
            .await
            .with_context(|| format!("Failed to initialize device {}", device.session.device()))?;
    }

    let shutdown = CancellationToken::new();
    spawn_signal_handler(shutdown.clone());

    let start = clock.now();
    for update in &rundown.updates {
        let effective = start + update.time.millis();
        let hand_over = effective + -(lookahead_ms as i64);
        if !wait_until(clock.as_ref(), hand_over, &shutdown).await {
            break;
        }

        for device in &devices {
            match device
                .session
                .handle_state(&update.timeline, &rundown.mappings, effective)
            {
                Ok(planned) => {
                    for error in &planned.resolution_errors {
                        warn!(device.id = %device.session.device(), error = %error, "resolution error");
                    }
                }
                Err(e) => {
                    warn!(device.id = %device.session.device(), error = %e, "timeline update rejected")
                }
            }
        }
    }

    let end = start + rundown.duration().millis() + linger_ms as i64;
    wait_until(clock.as_ref(), end, &shutdown).await;

    for device in &devices {
        let status = device.session.get_status();
        info!(
            device.id = %device.session.device(),
            code = ?status.code,
            messages = ?status.messages,
            "final status"
        );
        device.session.terminate().await;
    }

    info!("playback complete");
    Ok(())
}

/// Sleep until the clock reaches `time`. Returns false if shut down first.
async fn wait_until(clock: &dyn Clock, time: Timestamp, shutdown: &CancellationToken) -> bool {
    let delay = Duration::from_millis(clock.now().until(time));
    tokio::select! {
        _ = shutdown.cancelled() => false,
        _ = tokio::time::sleep(delay) => true,
    }
}

fn spawn_signal_handler(shutdown: CancellationToken) {
    tokio::spawn(async move {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Received SIGINT, shutting down...");
            }
            _ = sigterm() => {
                info!("Received SIGTERM, shutting down...");
            }
        }
        shutdown.cancel();
    });
}

#[cfg(unix)]
async fn sigterm() {
    use tokio::signal::unix::{signal, SignalKind};
    match signal(SignalKind::terminate()) {
        Ok(mut sigterm) => {
            sigterm.recv().await;
        }
        Err(e) => {
            warn!(error = %e, "SIGTERM handler unavailable");
            std::future::pending::<()>().await;
        }
    }
}

#[cfg(not(unix))]
async fn sigterm() {
    std::future::pending::<()>().await;
}
