//! Row models returned by repositories.
//!
//! Timestamps are stored as Unix milliseconds so that ordering and due-time
//! comparisons happen as integer comparisons inside SQLite.

/// One row of `pending_writes`; `payload` is the JSON-encoded log record.
#[derive(Debug, Clone)]
pub struct PendingRow {
    pub seq: i64,
    pub offline_id: String,
    pub location_id: String,
    pub payload: String,
    pub created_at: i64,
    pub attempt: i64,
    pub last_attempt_at: Option<i64>,
    pub next_attempt_at: i64,
    pub last_error: Option<String>,
    pub dead_lettered_at: Option<i64>,
}

/// One outstanding resolution step for a location.
#[derive(Debug, Clone)]
pub struct CascadeRepairRow {
    pub id: i64,
    pub location_id: String,
    pub step: String,
    /// Only problems recorded at or before this instant are resolved.
    pub cutoff: i64,
    pub created_at: i64,
    pub attempt: i64,
    pub next_attempt_at: i64,
    pub last_error: Option<String>,
    pub dead_lettered_at: Option<i64>,
}
