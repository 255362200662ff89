#![allow(dead_code)]

use chrono::{DateTime, Utc};
use cleanlog_sync::app::{Core, CoreSettings};
use cleanlog_sync::db;
use cleanlog_sync::model::{CleaningLogRecord, LogStatus, StoredRecord};
use cleanlog_sync::network::NetworkMonitor;
use cleanlog_sync::remote::{RemoteError, RemoteStore};
use cleanlog_sync::sync::{RetryPolicy, SyncSchedule};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, Notify};

#[derive(Debug, Clone)]
pub struct InsertCall {
    pub record: CleaningLogRecord,
    pub idempotency_key: Option<String>,
}

/// Unresolved problem counts for a location.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LocationProblems {
    pub unresolved_attention: i64,
    pub open_issues: i64,
}

/// When each unresolved problem was recorded on the fake server.
#[derive(Debug, Clone, Default)]
struct ProblemLog {
    attention: Vec<DateTime<Utc>>,
    issues: Vec<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolveCall {
    pub step: &'static str,
    pub location_id: String,
    pub before: DateTime<Utc>,
}

/// Resolve everything recorded at or before `before`; returns how many.
fn resolve_up_to(entries: &mut Vec<DateTime<Utc>>, before: DateTime<Utc>) -> i64 {
    let total = entries.len();
    entries.retain(|at| *at > before);
    (total - entries.len()) as i64
}

/// Scripted remote store: queued responses are consumed in call order, and an
/// empty queue means success.
#[derive(Clone, Default)]
pub struct RecordingRemote {
    insert_responses: Arc<Mutex<VecDeque<Result<(), RemoteError>>>>,
    pin_responses: Arc<Mutex<VecDeque<Result<bool, RemoteError>>>>,
    attention_responses: Arc<Mutex<VecDeque<Result<(), RemoteError>>>>,
    issue_responses: Arc<Mutex<VecDeque<Result<(), RemoteError>>>>,
    insert_calls: Arc<Mutex<Vec<InsertCall>>>,
    pin_calls: Arc<AtomicUsize>,
    attention_calls: Arc<AtomicUsize>,
    issue_calls: Arc<AtomicUsize>,
    problems: Arc<Mutex<HashMap<String, ProblemLog>>>,
    resolve_calls: Arc<Mutex<Vec<ResolveCall>>>,
    /// When set, each insert signals `insert_started` and waits for `release`.
    gate: Option<(Arc<Notify>, Arc<Notify>)>,
}

impl RecordingRemote {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn gated() -> (Self, Arc<Notify>, Arc<Notify>) {
        let started = Arc::new(Notify::new());
        let release = Arc::new(Notify::new());
        let remote = Self {
            gate: Some((started.clone(), release.clone())),
            ..Default::default()
        };
        (remote, started, release)
    }

    pub async fn push_insert(&self, res: Result<(), RemoteError>) {
        self.insert_responses.lock().await.push_back(res);
    }

    pub async fn push_pin(&self, res: Result<bool, RemoteError>) {
        self.pin_responses.lock().await.push_back(res);
    }

    pub async fn push_attention(&self, res: Result<(), RemoteError>) {
        self.attention_responses.lock().await.push_back(res);
    }

    pub async fn push_issues(&self, res: Result<(), RemoteError>) {
        self.issue_responses.lock().await.push_back(res);
    }

    /// Seed problems recorded an hour ago.
    pub async fn set_problems(&self, location_id: &str, problems: LocationProblems) {
        let earlier = Utc::now() - chrono::Duration::hours(1);
        let log = ProblemLog {
            attention: vec![earlier; problems.unresolved_attention as usize],
            issues: vec![earlier; problems.open_issues as usize],
        };
        self.problems
            .lock()
            .await
            .insert(location_id.to_string(), log);
    }

    pub async fn report_issue(&self, location_id: &str, at: DateTime<Utc>) {
        self.problems
            .lock()
            .await
            .entry(location_id.to_string())
            .or_default()
            .issues
            .push(at);
    }

    pub async fn problems(&self, location_id: &str) -> LocationProblems {
        self.problems
            .lock()
            .await
            .get(location_id)
            .map(|log| LocationProblems {
                unresolved_attention: log.attention.len() as i64,
                open_issues: log.issues.len() as i64,
            })
            .unwrap_or_default()
    }

    pub async fn resolve_calls(&self) -> Vec<ResolveCall> {
        self.resolve_calls.lock().await.clone()
    }

    pub async fn insert_calls(&self) -> Vec<InsertCall> {
        self.insert_calls.lock().await.clone()
    }

    pub fn pin_calls(&self) -> usize {
        self.pin_calls.load(Ordering::SeqCst)
    }

    pub fn attention_calls(&self) -> usize {
        self.attention_calls.load(Ordering::SeqCst)
    }

    pub fn issue_calls(&self) -> usize {
        self.issue_calls.load(Ordering::SeqCst)
    }
}

#[async_trait::async_trait]
impl RemoteStore for RecordingRemote {
    async fn insert_log(
        &self,
        record: &CleaningLogRecord,
        idempotency_key: Option<&str>,
    ) -> Result<StoredRecord, RemoteError> {
        let seq = {
            let mut calls = self.insert_calls.lock().await;
            calls.push(InsertCall {
                record: record.clone(),
                idempotency_key: idempotency_key.map(str::to_string),
            });
            calls.len()
        };
        if let Some((started, release)) = &self.gate {
            started.notify_one();
            release.notified().await;
        }
        let scripted = self.insert_responses.lock().await.pop_front();
        if let Some(Err(err)) = scripted {
            return Err(err);
        }
        if record.status == LogStatus::AttentionRequired {
            let mut problems = self.problems.lock().await;
            problems
                .entry(record.location_id.clone())
                .or_default()
                .attention
                .push(record.timestamp);
        }
        Ok(StoredRecord {
            id: format!("remote-{}", seq),
            created_at: Utc::now(),
            record: record.clone(),
        })
    }

    async fn check_pin_invalidated(
        &self,
        _location_id: &str,
        _session_start: DateTime<Utc>,
    ) -> Result<bool, RemoteError> {
        self.pin_calls.fetch_add(1, Ordering::SeqCst);
        self.pin_responses
            .lock()
            .await
            .pop_front()
            .unwrap_or(Ok(false))
    }

    async fn resolve_attention_logs(
        &self,
        location_id: &str,
        before: DateTime<Utc>,
    ) -> Result<i64, RemoteError> {
        self.attention_calls.fetch_add(1, Ordering::SeqCst);
        self.resolve_calls.lock().await.push(ResolveCall {
            step: "attention_logs",
            location_id: location_id.to_string(),
            before,
        });
        if let Some(Err(err)) = self.attention_responses.lock().await.pop_front() {
            return Err(err);
        }
        let mut problems = self.problems.lock().await;
        let entry = problems.entry(location_id.to_string()).or_default();
        Ok(resolve_up_to(&mut entry.attention, before))
    }

    async fn resolve_open_issues(
        &self,
        location_id: &str,
        before: DateTime<Utc>,
    ) -> Result<i64, RemoteError> {
        self.issue_calls.fetch_add(1, Ordering::SeqCst);
        self.resolve_calls.lock().await.push(ResolveCall {
            step: "open_issues",
            location_id: location_id.to_string(),
            before,
        });
        if let Some(Err(err)) = self.issue_responses.lock().await.pop_front() {
            return Err(err);
        }
        let mut problems = self.problems.lock().await;
        let entry = problems.entry(location_id.to_string()).or_default();
        Ok(resolve_up_to(&mut entry.issues, before))
    }
}

pub fn test_settings() -> CoreSettings {
    CoreSettings {
        call_timeout: Duration::from_secs(2),
        drain_timeout: Duration::from_secs(10),
        retry: RetryPolicy {
            base_backoff: Duration::from_secs(5),
            max_backoff: Duration::from_secs(60),
            max_attempts: Some(5),
        },
        schedule: SyncSchedule {
            startup_delay: Duration::from_millis(10),
            settle_delay: Duration::from_millis(10),
        },
    }
}

pub async fn setup_core(remote: &RecordingRemote, connected: bool) -> Core {
    setup_core_with(remote, connected, test_settings()).await
}

pub async fn setup_core_with(
    remote: &RecordingRemote,
    connected: bool,
    settings: CoreSettings,
) -> Core {
    let pool = db::init_memory_pool().await.unwrap();
    let remote: Arc<dyn RemoteStore> = Arc::new(remote.clone());
    Core::new(pool, remote, NetworkMonitor::new(connected), settings)
}

pub fn record(location_id: &str, staff: &str, status: LogStatus) -> CleaningLogRecord {
    let complete = status == LogStatus::Complete;
    CleaningLogRecord {
        location_id: location_id.into(),
        location_name: format!("Location {}", location_id),
        staff_name: staff.into(),
        timestamp: Utc::now(),
        status,
        toilets: true,
        sinks: true,
        floors: complete,
        supplies: true,
        waste_bins: true,
        notes: if complete {
            String::new()
        } else {
            "mop broken".into()
        },
        resolved: false,
        resolved_at: None,
    }
}

pub fn offline_err() -> RemoteError {
    RemoteError::Transport("error sending request: connection refused".into())
}

pub fn rejection(status: u16, body: &str) -> RemoteError {
    RemoteError::Rejected {
        status,
        body: body.into(),
    }
}
