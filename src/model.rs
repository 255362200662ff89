use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum LogStatus {
    Complete,
    AttentionRequired,
}

impl LogStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogStatus::Complete => "complete",
            LogStatus::AttentionRequired => "attention_required",
        }
    }

    pub fn is_complete(&self) -> bool {
        matches!(self, LogStatus::Complete)
    }
}

/// The five areas every cleaning checklist covers.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ChecklistArea {
    Toilets,
    Sinks,
    Floors,
    Supplies,
    WasteBins,
}

impl ChecklistArea {
    pub const ALL: [ChecklistArea; 5] = [
        ChecklistArea::Toilets,
        ChecklistArea::Sinks,
        ChecklistArea::Floors,
        ChecklistArea::Supplies,
        ChecklistArea::WasteBins,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ChecklistArea::Toilets => "toilets",
            ChecklistArea::Sinks => "sinks",
            ChecklistArea::Floors => "floors",
            ChecklistArea::Supplies => "supplies",
            ChecklistArea::WasteBins => "waste_bins",
        }
    }
}

/// Canonical cleaning-log submission, exactly as transmitted to the remote store.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CleaningLogRecord {
    pub location_id: String,
    pub location_name: String,
    pub staff_name: String,
    pub timestamp: DateTime<Utc>,
    pub status: LogStatus,
    pub toilets: bool,
    pub sinks: bool,
    pub floors: bool,
    pub supplies: bool,
    pub waste_bins: bool,
    pub notes: String,
    #[serde(default)]
    pub resolved: bool,
    #[serde(default)]
    pub resolved_at: Option<DateTime<Utc>>,
}

/// Record as acknowledged by the remote store.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StoredRecord {
    pub id: String,
    pub created_at: DateTime<Utc>,
    #[serde(flatten)]
    pub record: CleaningLogRecord,
}

/// A submission held locally until the remote store acknowledges it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PendingRecord {
    pub offline_id: String,
    pub record: CleaningLogRecord,
    pub created_at: DateTime<Utc>,
    pub attempt: u32,
    pub last_attempt_at: Option<DateTime<Utc>>,
    pub next_attempt_at: DateTime<Utc>,
    pub last_error: Option<String>,
    pub dead_lettered_at: Option<DateTime<Utc>>,
}

impl PendingRecord {
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.dead_lettered_at.is_none() && self.next_attempt_at <= now
    }
}

/// Ephemeral proof that a staff-entered access code was accepted for a location.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PinSession {
    pub location_id: String,
    pub verified_at: DateTime<Utc>,
}

impl PinSession {
    pub fn begin(location_id: impl Into<String>) -> Self {
        Self {
            location_id: location_id.into(),
            verified_at: Utc::now(),
        }
    }
}

/// Result of one pass over the pending queue.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DrainReport {
    pub synced: u32,
    pub failed: u32,
    /// Records skipped because their next attempt is scheduled later.
    pub deferred: u32,
    /// Subset of `failed` that reached the attempt ceiling during this drain.
    pub dead_lettered: u32,
}

impl DrainReport {
    pub fn processed(&self) -> u32 {
        self.synced + self.failed + self.deferred
    }
}
