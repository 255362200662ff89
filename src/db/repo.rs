use super::model::{CascadeRepairRow, PendingRow};
use anyhow::{anyhow, Result};
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteRow, SqliteSynchronous,
};
use sqlx::{Row, Sqlite, SqlitePool, Transaction};
use std::str::FromStr;
use tracing::instrument;

pub type Pool = SqlitePool;

pub async fn init_pool(database_url: &str) -> Result<Pool> {
    let normalized = prepare_sqlite_url(database_url);
    // WAL with FULL sync: a committed enqueue survives a crash or power loss.
    let options = SqliteConnectOptions::from_str(&normalized)?
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal)
        .synchronous(SqliteSynchronous::Full);
    let pool = SqlitePoolOptions::new().connect_with(options).await?;
    Ok(pool)
}

/// Single-connection in-memory database, used by tests and dry runs.
pub async fn init_memory_pool() -> Result<Pool> {
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await?;
    run_migrations(&pool).await?;
    Ok(pool)
}

/// If using a file-backed SQLite URL, expand a leading `~/` and ensure the parent
/// directory exists. Leaves in-memory URLs untouched. Returns possibly-updated URL.
fn prepare_sqlite_url(url: &str) -> String {
    if !url.starts_with("sqlite:") || url.starts_with("sqlite::memory") {
        return url.to_string();
    }

    let rest = &url["sqlite:".len()..];
    let path_with_query = rest.strip_prefix("//").unwrap_or(rest);

    let (path_part, query_part) = match path_with_query.split_once('?') {
        Some((p, q)) => (p, Some(q)),
        None => (path_with_query, None),
    };

    if path_part.is_empty() {
        return url.to_string();
    }

    let expanded_path = match path_part.strip_prefix("~/") {
        Some(rest) => match std::env::var("HOME") {
            Ok(home) => format!("{}/{}", home.trim_end_matches('/'), rest),
            Err(_) => path_part.to_string(),
        },
        None => path_part.to_string(),
    };

    if let Some(parent) = std::path::Path::new(&expanded_path).parent() {
        if !parent.as_os_str().is_empty() {
            let _ = std::fs::create_dir_all(parent);
        }
    }

    let mut rebuilt = String::from("sqlite://");
    rebuilt.push_str(&expanded_path);
    if let Some(q) = query_part {
        rebuilt.push('?');
        rebuilt.push_str(q);
    }
    rebuilt
}

pub async fn run_migrations(pool: &Pool) -> Result<()> {
    sqlx::migrate!("./migrations").run(pool).await?;
    Ok(())
}

fn pending_from_row(row: SqliteRow) -> PendingRow {
    PendingRow {
        seq: row.get("seq"),
        offline_id: row.get("offline_id"),
        location_id: row.get("location_id"),
        payload: row.get("payload"),
        created_at: row.get("created_at"),
        attempt: row.get("attempt"),
        last_attempt_at: row.get("last_attempt_at"),
        next_attempt_at: row.get("next_attempt_at"),
        last_error: row.get("last_error"),
        dead_lettered_at: row.get("dead_lettered_at"),
    }
}

const PENDING_COLUMNS: &str = "seq, offline_id, location_id, payload, created_at, attempt, \
     last_attempt_at, next_attempt_at, last_error, dead_lettered_at";

#[instrument(skip_all)]
pub async fn insert_pending(
    pool: &Pool,
    offline_id: &str,
    location_id: &str,
    payload: &str,
    created_at: i64,
) -> Result<i64> {
    let mut tx = pool.begin().await?;
    let rec = sqlx::query(
        "INSERT INTO pending_writes (offline_id, location_id, payload, created_at, attempt, next_attempt_at) \
         VALUES (?, ?, ?, ?, 0, ?) RETURNING seq",
    )
    .bind(offline_id)
    .bind(location_id)
    .bind(payload)
    .bind(created_at)
    .bind(created_at)
    .fetch_one(&mut *tx)
    .await?;
    tx.commit().await?;
    Ok(rec.get("seq"))
}

/// Returns whether a row was actually deleted.
#[instrument(skip_all)]
pub async fn delete_pending(pool: &Pool, offline_id: &str) -> Result<bool> {
    let res = sqlx::query("DELETE FROM pending_writes WHERE offline_id = ?")
        .bind(offline_id)
        .execute(pool)
        .await?;
    Ok(res.rows_affected() == 1)
}

#[instrument(skip_all)]
pub async fn increment_pending_attempt(pool: &Pool, offline_id: &str, now: i64) -> Result<i64> {
    let mut tx = pool.begin().await?;
    let attempt = increment_pending_attempt_tx(&mut tx, offline_id, now).await?;
    tx.commit().await?;
    Ok(attempt)
}

async fn increment_pending_attempt_tx(
    tx: &mut Transaction<'_, Sqlite>,
    offline_id: &str,
    now: i64,
) -> Result<i64> {
    let attempt: Option<i64> = sqlx::query_scalar(
        "UPDATE pending_writes SET attempt = attempt + 1, last_attempt_at = ? \
         WHERE offline_id = ? RETURNING attempt",
    )
    .bind(now)
    .bind(offline_id)
    .fetch_optional(&mut **tx)
    .await?;
    attempt.ok_or_else(|| anyhow!("pending write {} not found", offline_id))
}

/// Counts a failed attempt and either schedules the next one or dead-letters the
/// row, all in one transaction. `next_delay_ms` receives the new attempt count
/// and returns `None` when the row has reached its ceiling.
#[instrument(skip_all)]
pub async fn record_pending_failure<F>(
    pool: &Pool,
    offline_id: &str,
    now: i64,
    error: &str,
    next_delay_ms: F,
) -> Result<(i64, bool)>
where
    F: FnOnce(i64) -> Option<i64>,
{
    let mut tx = pool.begin().await?;
    let attempt = increment_pending_attempt_tx(&mut tx, offline_id, now).await?;
    let dead = match next_delay_ms(attempt) {
        Some(delay) => {
            sqlx::query(
                "UPDATE pending_writes SET next_attempt_at = ?, last_error = ? WHERE offline_id = ?",
            )
            .bind(now + delay)
            .bind(error)
            .bind(offline_id)
            .execute(&mut *tx)
            .await?;
            false
        }
        None => {
            sqlx::query(
                "UPDATE pending_writes SET dead_lettered_at = ?, last_error = ? WHERE offline_id = ?",
            )
            .bind(now)
            .bind(error)
            .bind(offline_id)
            .execute(&mut *tx)
            .await?;
            true
        }
    };
    tx.commit().await?;
    Ok((attempt, dead))
}

/// Live (not dead-lettered) rows in creation order.
#[instrument(skip_all)]
pub async fn list_pending(pool: &Pool) -> Result<Vec<PendingRow>> {
    let rows = sqlx::query(&format!(
        "SELECT {} FROM pending_writes WHERE dead_lettered_at IS NULL ORDER BY seq ASC",
        PENDING_COLUMNS
    ))
    .fetch_all(pool)
    .await?;
    Ok(rows.into_iter().map(pending_from_row).collect())
}

#[instrument(skip_all)]
pub async fn list_dead_letters(pool: &Pool) -> Result<Vec<PendingRow>> {
    let rows = sqlx::query(&format!(
        "SELECT {} FROM pending_writes WHERE dead_lettered_at IS NOT NULL ORDER BY seq ASC",
        PENDING_COLUMNS
    ))
    .fetch_all(pool)
    .await?;
    Ok(rows.into_iter().map(pending_from_row).collect())
}

#[instrument(skip_all)]
pub async fn count_pending(pool: &Pool) -> Result<i64> {
    let count: i64 =
        sqlx::query_scalar("SELECT COUNT(*) FROM pending_writes WHERE dead_lettered_at IS NULL")
            .fetch_one(pool)
            .await?;
    Ok(count)
}

/// Every unconfirmed row for the location, dead letters included.
#[instrument(skip_all)]
pub async fn count_pending_for_location(pool: &Pool, location_id: &str) -> Result<i64> {
    let count: i64 =
        sqlx::query_scalar("SELECT COUNT(*) FROM pending_writes WHERE location_id = ?")
            .bind(location_id)
            .fetch_one(pool)
            .await?;
    Ok(count)
}

fn repair_from_row(row: SqliteRow) -> CascadeRepairRow {
    CascadeRepairRow {
        id: row.get("id"),
        location_id: row.get("location_id"),
        step: row.get("step"),
        cutoff: row.get("cutoff"),
        created_at: row.get("created_at"),
        attempt: row.get("attempt"),
        next_attempt_at: row.get("next_attempt_at"),
        last_error: row.get("last_error"),
        dead_lettered_at: row.get("dead_lettered_at"),
    }
}

const REPAIR_COLUMNS: &str = "id, location_id, step, cutoff, created_at, attempt, \
     next_attempt_at, last_error, dead_lettered_at";

/// At most one repair row exists per (location, step). A repeat failure keeps
/// the later cutoff and restarts the retry schedule, reviving a dead letter.
#[instrument(skip_all)]
pub async fn upsert_cascade_repair(
    pool: &Pool,
    location_id: &str,
    step: &str,
    cutoff: i64,
    now: i64,
    error: &str,
) -> Result<()> {
    sqlx::query(
        "INSERT INTO cascade_repairs \
         (location_id, step, cutoff, created_at, attempt, next_attempt_at, last_error) \
         VALUES (?, ?, ?, ?, 0, ?, ?) \
         ON CONFLICT (location_id, step) DO UPDATE SET \
         cutoff = MAX(cutoff, excluded.cutoff), \
         attempt = 0, \
         next_attempt_at = excluded.next_attempt_at, \
         last_error = excluded.last_error, \
         dead_lettered_at = NULL",
    )
    .bind(location_id)
    .bind(step)
    .bind(cutoff)
    .bind(now)
    .bind(now)
    .bind(error)
    .execute(pool)
    .await?;
    Ok(())
}

/// Live (not dead-lettered) repairs, oldest first.
#[instrument(skip_all)]
pub async fn list_cascade_repairs(pool: &Pool) -> Result<Vec<CascadeRepairRow>> {
    let rows = sqlx::query(&format!(
        "SELECT {} FROM cascade_repairs WHERE dead_lettered_at IS NULL ORDER BY id ASC",
        REPAIR_COLUMNS
    ))
    .fetch_all(pool)
    .await?;
    Ok(rows.into_iter().map(repair_from_row).collect())
}

#[instrument(skip_all)]
pub async fn list_dead_cascade_repairs(pool: &Pool) -> Result<Vec<CascadeRepairRow>> {
    let rows = sqlx::query(&format!(
        "SELECT {} FROM cascade_repairs WHERE dead_lettered_at IS NOT NULL ORDER BY id ASC",
        REPAIR_COLUMNS
    ))
    .fetch_all(pool)
    .await?;
    Ok(rows.into_iter().map(repair_from_row).collect())
}

#[instrument(skip_all)]
pub async fn delete_cascade_repair(pool: &Pool, id: i64) -> Result<()> {
    sqlx::query("DELETE FROM cascade_repairs WHERE id = ?")
        .bind(id)
        .execute(pool)
        .await?;
    Ok(())
}

/// Same bookkeeping as [`record_pending_failure`], for a repair row.
#[instrument(skip_all)]
pub async fn record_cascade_repair_failure<F>(
    pool: &Pool,
    id: i64,
    now: i64,
    error: &str,
    next_delay_ms: F,
) -> Result<(i64, bool)>
where
    F: FnOnce(i64) -> Option<i64>,
{
    let mut tx = pool.begin().await?;
    let attempt: Option<i64> = sqlx::query_scalar(
        "UPDATE cascade_repairs SET attempt = attempt + 1, last_error = ? \
         WHERE id = ? RETURNING attempt",
    )
    .bind(error)
    .bind(id)
    .fetch_optional(&mut *tx)
    .await?;
    let attempt = attempt.ok_or_else(|| anyhow!("cascade repair {} not found", id))?;
    let dead = match next_delay_ms(attempt) {
        Some(delay) => {
            sqlx::query("UPDATE cascade_repairs SET next_attempt_at = ? WHERE id = ?")
                .bind(now + delay)
                .bind(id)
                .execute(&mut *tx)
                .await?;
            false
        }
        None => {
            sqlx::query("UPDATE cascade_repairs SET dead_lettered_at = ? WHERE id = ?")
                .bind(now)
                .bind(id)
                .execute(&mut *tx)
                .await?;
            true
        }
    };
    tx.commit().await?;
    Ok((attempt, dead))
}
