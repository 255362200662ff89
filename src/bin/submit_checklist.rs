use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use clap::Parser;
use std::path::PathBuf;
use std::time::Duration;
use tracing::info;

use cleanlog_sync::app::Core;
use cleanlog_sync::config;
use cleanlog_sync::model::PinSession;
use cleanlog_sync::network::NetworkMonitor;
use cleanlog_sync::submission::{ChecklistForm, SubmissionOutcome, SubmitContext};

#[derive(Debug, Parser)]
#[command(author, version, about = "Submit one completed checklist from a YAML file")]
struct Args {
    /// Path to YAML config file
    #[arg(long, default_value = "config.yaml")]
    config: PathBuf,

    /// Checklist YAML (location_id, location_name, staff_name, items, notes)
    #[arg(long)]
    checklist: PathBuf,

    /// When the location's access code was accepted (RFC 3339)
    #[arg(long)]
    pin_verified_at: Option<DateTime<Utc>>,

    /// Inspector/admin submission: skip the access-code freshness check
    #[arg(long)]
    bypass_pin: bool,
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

    let raw = std::fs::read_to_string(&args.checklist)
        .with_context(|| format!("failed to read {}", args.checklist.display()))?;
    let mut form: ChecklistForm = serde_yaml::from_str(&raw).context("invalid checklist YAML")?;

    let network = NetworkMonitor::new(false);
    let core = Core::from_config(&cfg, network.clone()).await?;

    // One probe decides between the online attempt and the direct queue.
    let probe_timeout = Duration::from_millis(cfg.sync.probe_interval_ms);
    let reachable = matches!(
        tokio::time::timeout(probe_timeout, core.remote.ping()).await,
        Ok(Ok(()))
    );
    network.set_connected(reachable);
    info!(reachable, "connectivity probed");

    let ctx = SubmitContext {
        pin: args.pin_verified_at.map(|verified_at| PinSession {
            location_id: form.location_id.clone(),
            verified_at,
        }),
        bypass_pin: args.bypass_pin,
    };
    let report = core.controller.submit(&mut form, ctx).await?;

    println!("{}", report.outcome.notice());
    match &report.outcome {
        SubmissionOutcome::Submitted { stored, cascade } => {
            println!("remote id: {}", stored.id);
            if let Some(cascade) = cascade {
                if !cascade.is_complete() {
                    println!("some prior problems could not be resolved yet; they will be retried");
                }
            }
        }
        SubmissionOutcome::SavedOffline { offline_id, .. } => {
            println!("offline id: {}", offline_id);
            println!(
                "pending for this location: {}",
                core.store.count_for_location(&form.location_id).await?
            );
        }
        SubmissionOutcome::PinRotated => {}
        SubmissionOutcome::Rejected { message } => {
            println!("{}", message);
            std::process::exit(1);
        }
    }
    Ok(())
}
