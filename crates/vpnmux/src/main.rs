//! vpnmux: per-device VPN tunnel supervisor daemon
//!
//! Loads the daemon configuration, wires the tunnel registry to the system
//! process runner, hook scripts and file-backed profile store, then serves
//! status reports until interrupted.

mod hooks;
mod relay;

use anyhow::{Context, Result};
use clap::Parser;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tracing::{error, info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};
use vpnmux_tunnel::{
    Collaborators, DaemonConfig, DeviceId, EvictionTimer, FileProfileStore, LocalBus, ProfileId,
    SystemProcessRunner, TunnelRegistry,
};

use crate::hooks::ScriptHooks;
use crate::relay::StatusRelay;

// Use mimalloc as the global allocator for reduced memory fragmentation
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

/// How long tunnels get to stop on shutdown.
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Parser, Debug)]
#[command(name = "vpnmux", version, about = "Per-device VPN tunnel supervisor")]
struct Args {
    /// Configuration file (defaults apply when it does not exist).
    #[arg(default_value = "/etc/vpnmux/vpnmux.toml")]
    config: PathBuf,

    /// Log level, overriding the configuration (RUST_LOG wins over both).
    #[arg(long)]
    log_level: Option<String>,
}

fn load_config(path: &Path) -> Result<(DaemonConfig, bool)> {
    if !path.exists() {
        return Ok((DaemonConfig::default(), false));
    }
    let config = DaemonConfig::from_toml_file(path)
        .with_context(|| format!("Failed to load {}", path.display()))?;
    Ok((config, true))
}

fn init_logging(level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(false)
        .compact()
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let (config, loaded) = load_config(&args.config)?;
    init_logging(args.log_level.as_deref().unwrap_or(&config.log_level));

    info!("vpnmux starting...");
    if loaded {
        info!("Loaded configuration from {}", args.config.display());
    } else {
        warn!("{} not found, using defaults", args.config.display());
    }

    let store = Arc::new(FileProfileStore::from_config(&config.client));
    store.ensure_dirs().context("Failed to create runtime directory")?;

    let runner = Arc::new(SystemProcessRunner::new());
    let bus = Arc::new(LocalBus::new().context("Failed to start pub/sub bus")?);
    let hooks = Arc::new(ScriptHooks::new(runner.clone(), config.hooks.clone()));

    let ctx = Collaborators {
        runner,
        transport: bus.clone(),
        routing: hooks.clone(),
        proxy: hooks.clone(),
        dns: hooks,
        store,
        settings: config.supervisor_settings(),
    };
    let registry = Arc::new(TunnelRegistry::new(ctx, config.registry.clone()));

    for (device, profile) in &config.assignments {
        let device = DeviceId::new(device.as_str());
        let profile = ProfileId::new(profile.as_str());
        let registry = registry.clone();
        let result =
            tokio::task::spawn_blocking(move || registry.route(&device, &profile).map(|()| (device, profile)))
                .await?;
        match result {
            Ok((device, profile)) => info!("Routed {} through {}", device, profile),
            Err(e) => error!("Static assignment failed: {}", e),
        }
    }

    let evictor = EvictionTimer::start(registry.clone(), registry.config().evict_interval())
        .context("Failed to start evictor")?;

    let relay = StatusRelay::bind(config.relay.listen, bus.clone())
        .await
        .with_context(|| format!("Failed to bind status relay on {}", config.relay.listen))?;

    for status in registry.statuses() {
        info!("{}", status.format());
    }
    info!("vpnmux ready");

    let result = tokio::select! {
        result = relay.run() => {
            result.map_err(|e| anyhow::anyhow!("Status relay error: {}", e))
        }
        _ = signal::ctrl_c() => {
            info!("Received SIGINT, initiating shutdown...");
            Ok(())
        }
        _ = wait_for_sigterm() => {
            info!("Received SIGTERM, initiating shutdown...");
            Ok(())
        }
    };

    evictor.stop();
    for status in registry.statuses() {
        info!("Stopping {}", status.format());
    }
    let registry_ref = registry.clone();
    tokio::task::spawn_blocking(move || registry_ref.shutdown(SHUTDOWN_TIMEOUT)).await?;
    bus.shutdown();

    info!("vpnmux shutting down");
    result
}

/// Wait for SIGTERM.
#[cfg(unix)]
async fn wait_for_sigterm() {
    use tokio::signal::unix::{signal, SignalKind};
    match signal(SignalKind::terminate()) {
        Ok(mut sigterm) => {
            sigterm.recv().await;
        }
        Err(e) => {
            warn!("Failed to register SIGTERM handler: {}", e);
            std::future::pending::<()>().await;
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_sigterm() {
    std::future::pending::<()>().await
}
