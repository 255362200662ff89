//! Resolution side effects of a compliant cleaning log.
//!
//! A `Complete` log for a location resolves the `AttentionRequired` logs and
//! open public issues recorded up to that log's timestamp. The two remote calls
//! are independent and not transactional, so a failed step is written to
//! `cascade_repairs` together with that cutoff and replayed by
//! [`ResolutionCascade::reconcile`] from the background sync loop. Problems
//! recorded after the cutoff are never touched by a replay.
use anyhow::{anyhow, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{error, info, instrument, warn};

use crate::db::{self, CascadeRepairRow, Pool};
use crate::remote::{with_timeout, RemoteError, RemoteStore};
use crate::sync::RetryPolicy;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CascadeStep {
    AttentionLogs,
    OpenIssues,
}

impl CascadeStep {
    pub fn as_str(&self) -> &'static str {
        match self {
            CascadeStep::AttentionLogs => "attention_logs",
            CascadeStep::OpenIssues => "open_issues",
        }
    }

    pub fn parse_step(s: &str) -> Option<Self> {
        match s {
            "attention_logs" => Some(CascadeStep::AttentionLogs),
            "open_issues" => Some(CascadeStep::OpenIssues),
            _ => None,
        }
    }
}

/// Publicly reported problem at a location, as shown on the status view.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct OpenIssue {
    pub id: String,
    pub location_id: String,
    pub description: String,
    pub reported_at: DateTime<Utc>,
}

/// In-memory view of open issues per location.
///
/// The embedding UI fills it with [`replace`](Self::replace) whenever it
/// fetches a location's status page; the cascade then drops the issues it
/// resolved so the page reflects the resolution without a refetch.
#[derive(Debug, Clone, Default)]
pub struct OpenIssuesView {
    inner: Arc<RwLock<HashMap<String, Vec<OpenIssue>>>>,
}

impl OpenIssuesView {
    pub async fn replace(&self, location_id: &str, issues: Vec<OpenIssue>) {
        self.inner
            .write()
            .await
            .insert(location_id.to_string(), issues);
    }

    pub async fn for_location(&self, location_id: &str) -> Vec<OpenIssue> {
        self.inner
            .read()
            .await
            .get(location_id)
            .cloned()
            .unwrap_or_default()
    }

    /// Drop the issues reported at or before `cutoff`; later reports stay visible.
    pub async fn clear_resolved(&self, location_id: &str, cutoff: DateTime<Utc>) {
        let mut inner = self.inner.write().await;
        if let Some(issues) = inner.get_mut(location_id) {
            issues.retain(|issue| issue.reported_at > cutoff);
            if issues.is_empty() {
                inner.remove(location_id);
            }
        }
    }
}

/// Per-step result; `None` means the call failed and a repair was recorded.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CascadeOutcome {
    pub attention_logs_resolved: Option<i64>,
    pub issues_resolved: Option<i64>,
}

impl CascadeOutcome {
    pub fn is_complete(&self) -> bool {
        self.attention_logs_resolved.is_some() && self.issues_resolved.is_some()
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    pub repaired: u32,
    pub still_failing: u32,
    /// Repairs still waiting out their backoff.
    pub deferred: u32,
    pub dead_lettered: u32,
}

/// A replayable resolution step as stored in `cascade_repairs`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CascadeRepair {
    pub id: i64,
    pub location_id: String,
    pub step: CascadeStep,
    pub cutoff: DateTime<Utc>,
    pub attempt: u32,
    pub next_attempt_at: DateTime<Utc>,
    pub last_error: Option<String>,
    pub dead_lettered_at: Option<DateTime<Utc>>,
}

#[derive(Clone)]
pub struct ResolutionCascade {
    remote: Arc<dyn RemoteStore>,
    pool: Pool,
    issues: OpenIssuesView,
    policy: RetryPolicy,
    timeout: Duration,
}

impl ResolutionCascade {
    pub fn new(
        remote: Arc<dyn RemoteStore>,
        pool: Pool,
        issues: OpenIssuesView,
        policy: RetryPolicy,
        timeout: Duration,
    ) -> Self {
        Self {
            remote,
            pool,
            issues,
            policy,
            timeout,
        }
    }

    pub fn issues(&self) -> &OpenIssuesView {
        &self.issues
    }

    /// Run both resolution steps for problems recorded up to `cutoff`, the
    /// timestamp of the compliant log that was just stored.
    #[instrument(skip_all, fields(location_id = %location_id))]
    pub async fn run(&self, location_id: &str, cutoff: DateTime<Utc>) -> CascadeOutcome {
        let mut outcome = CascadeOutcome::default();
        for step in [CascadeStep::AttentionLogs, CascadeStep::OpenIssues] {
            match self.apply(location_id, step, cutoff).await {
                Ok(count) => {
                    info!(step = step.as_str(), count, "resolved location problems");
                    match step {
                        CascadeStep::AttentionLogs => outcome.attention_logs_resolved = Some(count),
                        CascadeStep::OpenIssues => outcome.issues_resolved = Some(count),
                    }
                }
                Err(err) => {
                    warn!(step = step.as_str(), %err, "resolution step failed");
                    self.record_repair(location_id, step, cutoff, &err).await;
                }
            }
        }
        outcome
    }

    /// Replay every due repair once, backing off or dead-lettering failures.
    #[instrument(skip_all)]
    pub async fn reconcile(&self) -> Result<ReconcileReport> {
        let mut report = ReconcileReport::default();
        let now = Utc::now();
        for row in db::list_cascade_repairs(&self.pool).await? {
            let repair = match decode_repair(row.clone()) {
                Ok(repair) => repair,
                Err(err) => {
                    warn!(id = row.id, step = %row.step, %err, "dropping unreadable repair");
                    db::delete_cascade_repair(&self.pool, row.id).await?;
                    continue;
                }
            };
            if repair.next_attempt_at > now {
                report.deferred += 1;
                continue;
            }
            match self
                .apply(&repair.location_id, repair.step, repair.cutoff)
                .await
            {
                Ok(count) => {
                    info!(
                        location_id = %repair.location_id,
                        step = repair.step.as_str(),
                        count,
                        "repaired resolution step"
                    );
                    db::delete_cascade_repair(&self.pool, repair.id).await?;
                    report.repaired += 1;
                }
                Err(err) => {
                    report.still_failing += 1;
                    let policy = self.policy;
                    let (attempt, dead) = db::record_cascade_repair_failure(
                        &self.pool,
                        repair.id,
                        now.timestamp_millis(),
                        &err.to_string(),
                        |attempt| {
                            policy
                                .delay_after(attempt as u32)
                                .map(|delay| delay.as_millis() as i64)
                        },
                    )
                    .await?;
                    if dead {
                        report.dead_lettered += 1;
                        error!(
                            location_id = %repair.location_id,
                            step = repair.step.as_str(),
                            attempt,
                            %err,
                            "resolution repair dead-lettered"
                        );
                    } else {
                        warn!(
                            location_id = %repair.location_id,
                            step = repair.step.as_str(),
                            attempt,
                            %err,
                            "resolution repair failed"
                        );
                    }
                }
            }
        }
        Ok(report)
    }

    pub async fn list_repairs(&self) -> Result<Vec<CascadeRepair>> {
        db::list_cascade_repairs(&self.pool)
            .await?
            .into_iter()
            .map(decode_repair)
            .collect()
    }

    pub async fn list_dead_repairs(&self) -> Result<Vec<CascadeRepair>> {
        db::list_dead_cascade_repairs(&self.pool)
            .await?
            .into_iter()
            .map(decode_repair)
            .collect()
    }

    async fn apply(
        &self,
        location_id: &str,
        step: CascadeStep,
        cutoff: DateTime<Utc>,
    ) -> Result<i64, RemoteError> {
        match step {
            CascadeStep::AttentionLogs => {
                let call = self.remote.resolve_attention_logs(location_id, cutoff);
                with_timeout(self.timeout, call).await
            }
            CascadeStep::OpenIssues => {
                let call = self.remote.resolve_open_issues(location_id, cutoff);
                let count = with_timeout(self.timeout, call).await?;
                self.issues.clear_resolved(location_id, cutoff).await;
                Ok(count)
            }
        }
    }

    async fn record_repair(
        &self,
        location_id: &str,
        step: CascadeStep,
        cutoff: DateTime<Utc>,
        err: &RemoteError,
    ) {
        let now = Utc::now().timestamp_millis();
        if let Err(db_err) = db::upsert_cascade_repair(
            &self.pool,
            location_id,
            step.as_str(),
            cutoff.timestamp_millis(),
            now,
            &err.to_string(),
        )
        .await
        {
            warn!(?db_err, step = step.as_str(), "failed to record resolution repair");
        }
    }
}

fn millis(ms: i64) -> Result<DateTime<Utc>> {
    DateTime::<Utc>::from_timestamp_millis(ms).ok_or_else(|| anyhow!("timestamp {} out of range", ms))
}

fn decode_repair(row: CascadeRepairRow) -> Result<CascadeRepair> {
    let step = CascadeStep::parse_step(&row.step)
        .ok_or_else(|| anyhow!("unknown resolution step {}", row.step))?;
    Ok(CascadeRepair {
        id: row.id,
        location_id: row.location_id,
        step,
        cutoff: millis(row.cutoff)?,
        attempt: row.attempt as u32,
        next_attempt_at: millis(row.next_attempt_at)?,
        last_error: row.last_error,
        dead_lettered_at: row.dead_lettered_at.map(millis).transpose()?,
    })
}
