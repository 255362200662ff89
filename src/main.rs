use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;
use std::time::Duration;
use tracing::{info, warn};

use cleanlog_sync::app::Core;
use cleanlog_sync::config;
use cleanlog_sync::network::NetworkMonitor;

#[derive(Debug, Parser)]
#[command(author, version, about = "Keep queued cleaning logs flowing to the remote store")]
struct Args {
    /// Path to YAML config file
    #[arg(long, default_value = "config.yaml")]
    config: PathBuf,

    /// Do not probe the remote store; assume the link is always up
    #[arg(long)]
    no_probe: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_target(false)
        .compact()
        .init();

    let args = Args::parse();
    let cfg = config::load(Some(&args.config))?;
    cfg.ensure_dirs()?;

    // Start offline; the first successful probe counts as a regain.
    let network = NetworkMonitor::new(args.no_probe);
    let core = Core::from_config(&cfg, network.clone()).await?;

    let pending = core.store.count_pending().await?;
    let dead = core.store.list_dead_letters().await?.len();
    info!(pending, dead_letters = dead, "cleaning-log sync agent starting");
    if dead > 0 {
        warn!(dead_letters = dead, "some cleaning logs exhausted their retries; see drain-pending --list");
    }
    let dead_repairs = core.cascade.list_dead_repairs().await?.len();
    if dead_repairs > 0 {
        warn!(dead_repairs, "some resolution repairs exhausted their retries; see drain-pending --list");
    }

    let probe = (!args.no_probe).then(|| {
        network.spawn_probe(
            core.remote.clone(),
            Duration::from_millis(cfg.sync.probe_interval_ms),
        )
    });
    let sync_loop = core.spawn_sync_loop();

    tokio::signal::ctrl_c().await?;
    info!("shutting down");
    sync_loop.abort();
    if let Some(probe) = probe {
        probe.abort();
    }
    Ok(())
}
