use anyhow::Result;
use chrono::Utc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{error, info, instrument, warn};

use crate::cascade::ResolutionCascade;
use crate::config::SyncSettings;
use crate::model::DrainReport;
use crate::network::NetworkMonitor;
use crate::pending::{FailureDisposition, PendingWriteStore};
use crate::remote::{with_timeout, RemoteStore};

/// Exponential backoff between attempts of the same record, with an optional ceiling.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub base_backoff: Duration,
    pub max_backoff: Duration,
    /// `None` retries forever.
    pub max_attempts: Option<u32>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_backoff: Duration::from_secs(5),
            max_backoff: Duration::from_secs(3600),
            max_attempts: Some(20),
        }
    }
}

impl RetryPolicy {
    pub fn from_settings(settings: &SyncSettings) -> Self {
        Self {
            base_backoff: Duration::from_secs(settings.base_backoff_seconds),
            max_backoff: Duration::from_secs(settings.max_backoff_seconds),
            max_attempts: (settings.max_attempts > 0).then_some(settings.max_attempts),
        }
    }

    /// Delay before the next attempt given the number of attempts made so far,
    /// or `None` once the ceiling is reached.
    pub fn delay_after(&self, attempts: u32) -> Option<Duration> {
        if let Some(max) = self.max_attempts {
            if attempts >= max {
                return None;
            }
        }
        // base * 2^(attempts - 1), shift capped to keep the multiplication in range.
        let factor = 1_u32 << attempts.saturating_sub(1).min(16);
        Some(self.base_backoff.saturating_mul(factor).min(self.max_backoff))
    }
}

/// Releases the single-flight flag however the drain ends, including when its
/// future is dropped by a timeout.
struct InFlight<'a>(&'a AtomicBool);

impl<'a> InFlight<'a> {
    fn acquire(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| InFlight(flag))
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Flushes the pending queue to the remote store. At most one drain runs at a time.
pub struct SyncEngine {
    store: PendingWriteStore,
    remote: Arc<dyn RemoteStore>,
    network: NetworkMonitor,
    policy: RetryPolicy,
    call_timeout: Duration,
    drain_timeout: Duration,
    in_flight: AtomicBool,
}

impl SyncEngine {
    pub fn new(
        store: PendingWriteStore,
        remote: Arc<dyn RemoteStore>,
        network: NetworkMonitor,
        policy: RetryPolicy,
        call_timeout: Duration,
        drain_timeout: Duration,
    ) -> Self {
        Self {
            store,
            remote,
            network,
            policy,
            call_timeout,
            drain_timeout,
            in_flight: AtomicBool::new(false),
        }
    }

    pub fn is_draining(&self) -> bool {
        self.in_flight.load(Ordering::Acquire)
    }

    /// One pass over every pending record in creation order.
    ///
    /// Returns an all-zero report without touching the store when another drain
    /// is running, the queue is empty, or there is no connectivity.
    #[instrument(skip_all)]
    pub async fn drain(&self) -> Result<DrainReport> {
        let Some(_guard) = InFlight::acquire(&self.in_flight) else {
            return Ok(DrainReport::default());
        };
        if self.store.is_empty().await? {
            return Ok(DrainReport::default());
        }
        if !self.network.is_connected() {
            info!("skipping drain while offline");
            return Ok(DrainReport::default());
        }

        let mut report = DrainReport::default();
        let outcome =
            tokio::time::timeout(self.drain_timeout, self.drain_records(&mut report)).await;
        match outcome {
            Ok(res) => res?,
            Err(_) => warn!(
                timeout = ?self.drain_timeout,
                synced = report.synced,
                failed = report.failed,
                "drain timed out; remaining records stay queued"
            ),
        }
        info!(
            synced = report.synced,
            failed = report.failed,
            deferred = report.deferred,
            dead_lettered = report.dead_lettered,
            "drain finished"
        );
        Ok(report)
    }

    async fn drain_records(&self, report: &mut DrainReport) -> Result<()> {
        let records = self.store.list_by_creation_order().await?;
        let now = Utc::now();
        for pending in records {
            if !pending.is_due(now) {
                report.deferred += 1;
                continue;
            }
            let call = self
                .remote
                .insert_log(&pending.record, Some(&pending.offline_id));
            match with_timeout(self.call_timeout, call).await {
                Ok(stored) => {
                    self.store.remove(&pending.offline_id).await?;
                    report.synced += 1;
                    info!(
                        offline_id = %pending.offline_id,
                        remote_id = %stored.id,
                        "pending cleaning log synced"
                    );
                }
                Err(err) => {
                    report.failed += 1;
                    let policy = self.policy;
                    let disposition = self
                        .store
                        .record_failure(&pending.offline_id, &err.to_string(), |attempts| {
                            policy.delay_after(attempts)
                        })
                        .await?;
                    match disposition {
                        FailureDisposition::Retry {
                            attempt,
                            next_attempt_at,
                        } => warn!(
                            offline_id = %pending.offline_id,
                            attempt,
                            %next_attempt_at,
                            %err,
                            "pending cleaning log failed; backoff"
                        ),
                        FailureDisposition::DeadLettered { attempt } => {
                            report.dead_lettered += 1;
                            error!(
                                offline_id = %pending.offline_id,
                                attempt,
                                %err,
                                "pending cleaning log dead-lettered"
                            );
                        }
                    }
                }
            }
        }
        Ok(())
    }
}

/// Timings for the background sync loop.
#[derive(Debug, Clone, Copy)]
pub struct SyncSchedule {
    pub startup_delay: Duration,
    pub settle_delay: Duration,
}

impl SyncSchedule {
    pub fn from_settings(settings: &SyncSettings) -> Self {
        Self {
            startup_delay: Duration::from_millis(settings.startup_delay_ms),
            settle_delay: Duration::from_millis(settings.settle_delay_ms),
        }
    }
}

/// Drain once shortly after startup, then after every connectivity regain
/// (once the link has stayed up for the settle delay). Each drain is followed by
/// a replay of outstanding resolution repairs.
pub fn spawn_sync_loop(
    engine: Arc<SyncEngine>,
    cascade: ResolutionCascade,
    network: NetworkMonitor,
    schedule: SyncSchedule,
) -> JoinHandle<()> {
    let mut events = network.subscribe();
    tokio::spawn(async move {
        tokio::time::sleep(schedule.startup_delay).await;
        run_sweep(&engine, &cascade, &network, "startup").await;

        while events.regained().await.is_some() {
            tokio::time::sleep(schedule.settle_delay).await;
            if !network.is_connected() {
                info!("connectivity dropped again during settle delay");
                continue;
            }
            run_sweep(&engine, &cascade, &network, "reconnect").await;
        }
        info!("connectivity monitor closed; sync loop exiting");
    })
}

async fn run_sweep(
    engine: &SyncEngine,
    cascade: &ResolutionCascade,
    network: &NetworkMonitor,
    trigger: &'static str,
) {
    match engine.drain().await {
        Ok(report) if report.processed() > 0 => info!(trigger, ?report, "sync sweep done"),
        Ok(_) => {}
        Err(err) => error!(?err, trigger, "drain failed"),
    }
    if !network.is_connected() {
        return;
    }
    match cascade.reconcile().await {
        Ok(report) if report.repaired + report.still_failing > 0 => {
            info!(trigger, ?report, "resolution repairs replayed")
        }
        Ok(_) => {}
        Err(err) => error!(?err, trigger, "resolution reconcile failed"),
    }
}
