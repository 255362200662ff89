use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;
use std::time::Duration;
use tracing::{info, warn};

use cleanlog_sync::app::Core;
use cleanlog_sync::cascade::CascadeRepair;
use cleanlog_sync::config;
use cleanlog_sync::model::PendingRecord;
use cleanlog_sync::network::NetworkMonitor;

#[derive(Debug, Parser)]
#[command(
    author,
    version,
    about = "Sync all due pending cleaning logs to the remote store and exit"
)]
struct Args {
    /// Path to YAML config file
    #[arg(long, default_value = "config.yaml")]
    config: PathBuf,

    /// Only print the pending and dead-lettered records
    #[arg(long)]
    list: bool,
}

fn print_record(pending: &PendingRecord) {
    println!(
        "  {} location={} staff={} status={} created={} attempts={}{}",
        pending.offline_id,
        pending.record.location_id,
        pending.record.staff_name,
        pending.record.status.as_str(),
        pending.created_at.to_rfc3339(),
        pending.attempt,
        pending
            .last_error
            .as_deref()
            .map(|e| format!(" last_error={}", e))
            .unwrap_or_default()
    );
}

fn print_repair(repair: &CascadeRepair) {
    println!(
        "  #{} location={} step={} cutoff={} attempts={}{}",
        repair.id,
        repair.location_id,
        repair.step.as_str(),
        repair.cutoff.to_rfc3339(),
        repair.attempt,
        repair
            .last_error
            .as_deref()
            .map(|e| format!(" last_error={}", e))
            .unwrap_or_default()
    );
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

    let network = NetworkMonitor::new(true);
    let core = Core::from_config(&cfg, network).await?;

    if args.list {
        let pending = core.store.list_by_creation_order().await?;
        println!("pending ({}):", pending.len());
        pending.iter().for_each(print_record);
        let dead = core.store.list_dead_letters().await?;
        println!("dead-lettered ({}):", dead.len());
        dead.iter().for_each(print_record);
        let repairs = core.cascade.list_repairs().await?;
        println!("resolution repairs ({}):", repairs.len());
        repairs.iter().for_each(print_repair);
        let dead_repairs = core.cascade.list_dead_repairs().await?;
        println!("dead-lettered resolution repairs ({}):", dead_repairs.len());
        dead_repairs.iter().for_each(print_repair);
        return Ok(());
    }

    let remaining = core.store.count_pending().await?;
    info!(remaining, "starting drain");
    if remaining == 0 && core.cascade.list_repairs().await?.is_empty() {
        info!("no pending cleaning logs or resolution repairs, exiting");
        return Ok(());
    }

    let probe_timeout = Duration::from_millis(cfg.sync.probe_interval_ms);
    if !matches!(
        tokio::time::timeout(probe_timeout, core.remote.ping()).await,
        Ok(Ok(()))
    ) {
        warn!("remote store unreachable; nothing drained");
        return Ok(());
    }

    let report = core.engine.drain().await?;
    let repairs = core.cascade.reconcile().await?;
    let remaining = core.store.count_pending().await?;
    info!(
        synced = report.synced,
        failed = report.failed,
        deferred = report.deferred,
        dead_lettered = report.dead_lettered,
        repaired = repairs.repaired,
        repairs_dead_lettered = repairs.dead_lettered,
        remaining,
        "drain complete"
    );
    Ok(())
}
