//! Durable FIFO of cleaning logs that the remote store has not acknowledged yet.
use crate::db::{self, PendingRow, Pool};
use crate::model::{CleaningLogRecord, PendingRecord};
use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{info, instrument, warn};
use uuid::Uuid;

/// What happened to a record after a failed sync attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureDisposition {
    Retry { attempt: u32, next_attempt_at: DateTime<Utc> },
    DeadLettered { attempt: u32 },
}

/// Repository over the `pending_writes` table.
///
/// Writes go through one async mutex so that enqueue, remove and attempt
/// bookkeeping never interleave within the process.
#[derive(Clone)]
pub struct PendingWriteStore {
    pool: Pool,
    write_lock: Arc<Mutex<()>>,
}

impl std::fmt::Debug for PendingWriteStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PendingWriteStore").finish_non_exhaustive()
    }
}

impl PendingWriteStore {
    pub fn new(pool: Pool) -> Self {
        Self {
            pool,
            write_lock: Arc::new(Mutex::new(())),
        }
    }

    /// Persist a record under a fresh offline id.
    pub async fn enqueue(&self, record: &CleaningLogRecord) -> Result<String> {
        let offline_id = Uuid::new_v4().to_string();
        self.enqueue_with_id(&offline_id, record).await?;
        Ok(offline_id)
    }

    /// Persist a record under an id the caller already generated (the
    /// idempotency key of a failed online attempt).
    #[instrument(skip_all, fields(offline_id = %offline_id))]
    pub async fn enqueue_with_id(&self, offline_id: &str, record: &CleaningLogRecord) -> Result<()> {
        let payload = serde_json::to_string(record).context("failed to encode cleaning log")?;
        let _guard = self.write_lock.lock().await;
        db::insert_pending(
            &self.pool,
            offline_id,
            &record.location_id,
            &payload,
            Utc::now().timestamp_millis(),
        )
        .await
        .with_context(|| format!("failed to enqueue pending write {}", offline_id))?;
        info!(location_id = %record.location_id, "cleaning log queued for sync");
        Ok(())
    }

    /// Drop a record after its remote insert was acknowledged.
    #[instrument(skip_all, fields(offline_id = %offline_id))]
    pub async fn remove(&self, offline_id: &str) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        if !db::delete_pending(&self.pool, offline_id).await? {
            warn!("pending write already gone");
        }
        Ok(())
    }

    pub async fn increment_attempt(&self, offline_id: &str) -> Result<u32> {
        let _guard = self.write_lock.lock().await;
        let attempt =
            db::increment_pending_attempt(&self.pool, offline_id, Utc::now().timestamp_millis())
                .await?;
        Ok(attempt as u32)
    }

    /// Count one failed attempt, then schedule the next one after `delay_for(attempt)`
    /// or dead-letter the record when that returns `None`.
    pub async fn record_failure<F>(
        &self,
        offline_id: &str,
        error: &str,
        delay_for: F,
    ) -> Result<FailureDisposition>
    where
        F: FnOnce(u32) -> Option<std::time::Duration>,
    {
        let now = Utc::now();
        let _guard = self.write_lock.lock().await;
        let mut next_attempt_at = now;
        let (attempt, dead) = db::record_pending_failure(
            &self.pool,
            offline_id,
            now.timestamp_millis(),
            error,
            |attempt| {
                delay_for(attempt as u32).map(|delay| {
                    let delay_ms = delay.as_millis() as i64;
                    next_attempt_at = now + chrono::Duration::milliseconds(delay_ms);
                    delay_ms
                })
            },
        )
        .await?;
        let attempt = attempt as u32;
        Ok(if dead {
            FailureDisposition::DeadLettered { attempt }
        } else {
            FailureDisposition::Retry {
                attempt,
                next_attempt_at,
            }
        })
    }

    /// Live records, oldest first.
    pub async fn list_by_creation_order(&self) -> Result<Vec<PendingRecord>> {
        db::list_pending(&self.pool)
            .await?
            .into_iter()
            .map(decode_row)
            .collect()
    }

    pub async fn list_dead_letters(&self) -> Result<Vec<PendingRecord>> {
        db::list_dead_letters(&self.pool)
            .await?
            .into_iter()
            .map(decode_row)
            .collect()
    }

    pub async fn count_for_location(&self, location_id: &str) -> Result<i64> {
        db::count_pending_for_location(&self.pool, location_id).await
    }

    pub async fn count_pending(&self) -> Result<i64> {
        db::count_pending(&self.pool).await
    }

    pub async fn is_empty(&self) -> Result<bool> {
        Ok(self.count_pending().await? == 0)
    }
}

fn millis(ms: i64) -> Result<DateTime<Utc>> {
    DateTime::<Utc>::from_timestamp_millis(ms).ok_or_else(|| anyhow!("timestamp {} out of range", ms))
}

fn decode_row(row: PendingRow) -> Result<PendingRecord> {
    let record: CleaningLogRecord = serde_json::from_str(&row.payload)
        .with_context(|| format!("corrupt payload for pending write {}", row.offline_id))?;
    Ok(PendingRecord {
        offline_id: row.offline_id,
        record,
        created_at: millis(row.created_at)?,
        attempt: row.attempt as u32,
        last_attempt_at: row.last_attempt_at.map(millis).transpose()?,
        next_attempt_at: millis(row.next_attempt_at)?,
        last_error: row.last_error,
        dead_lettered_at: row.dead_lettered_at.map(millis).transpose()?,
    })
}
