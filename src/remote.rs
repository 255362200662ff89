use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use reqwest::{Client, Method, StatusCode, Url};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::fmt;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};

use crate::config::Config;
use crate::model::{CleaningLogRecord, StoredRecord};

/// Message fragments that identify a transport problem rather than a rejected write.
static NETWORK_MARKERS: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?i)network|fetch|timed? ?out|timeout|connection|connect|offline|socket|dns|unreachable|econn|broken pipe",
    )
    .expect("network marker regex")
});

#[derive(Debug, Error)]
pub enum RemoteError {
    #[error("transport error: {0}")]
    Transport(String),
    #[error("request timed out after {0:?}")]
    Timeout(Duration),
    #[error("remote rejected request ({status}): {body}")]
    Rejected { status: u16, body: String },
    #[error("invalid response: {0}")]
    Decode(String),
    #[error("invalid location id {0:?}")]
    InvalidLocation(String),
}

impl RemoteError {
    /// Whether the failure means "try again later" as opposed to "this write is wrong".
    pub fn is_network_like(&self) -> bool {
        match self {
            RemoteError::Transport(_) | RemoteError::Timeout(_) => true,
            RemoteError::Rejected { status, body } => {
                matches!(*status, 408 | 429 | 502 | 503 | 504) || NETWORK_MARKERS.is_match(body)
            }
            RemoteError::Decode(_) | RemoteError::InvalidLocation(_) => false,
        }
    }
}

impl RemoteError {
    /// Map a reqwest failure; `timeout` is the client deadline that a timeout error hit.
    pub fn from_reqwest(err: reqwest::Error, timeout: Duration) -> Self {
        if err.is_timeout() {
            RemoteError::Timeout(timeout)
        } else if err.is_decode() {
            RemoteError::Decode(err.to_string())
        } else {
            RemoteError::Transport(err.to_string())
        }
    }
}

/// Operations the hosted store exposes to this core.
#[async_trait]
pub trait RemoteStore: Send + Sync {
    /// Insert one cleaning log. `idempotency_key` lets the server drop a replay
    /// of a write whose acknowledgement was lost.
    async fn insert_log(
        &self,
        record: &CleaningLogRecord,
        idempotency_key: Option<&str>,
    ) -> Result<StoredRecord, RemoteError>;

    /// Whether the location's access code changed after `session_start`.
    async fn check_pin_invalidated(
        &self,
        location_id: &str,
        session_start: DateTime<Utc>,
    ) -> Result<bool, RemoteError>;

    /// Resolve the location's `AttentionRequired` logs recorded at or before `before`.
    async fn resolve_attention_logs(
        &self,
        location_id: &str,
        before: DateTime<Utc>,
    ) -> Result<i64, RemoteError>;

    /// Resolve the location's open issues reported at or before `before`.
    async fn resolve_open_issues(
        &self,
        location_id: &str,
        before: DateTime<Utc>,
    ) -> Result<i64, RemoteError>;

    /// Cheap reachability check used by the connectivity probe.
    async fn ping(&self) -> Result<(), RemoteError> {
        Ok(())
    }
}

/// Wrap a remote call in a deadline, mapping expiry to [`RemoteError::Timeout`].
pub async fn with_timeout<T, F>(limit: Duration, call: F) -> Result<T, RemoteError>
where
    F: std::future::Future<Output = Result<T, RemoteError>>,
{
    match tokio::time::timeout(limit, call).await {
        Ok(res) => res,
        Err(_) => Err(RemoteError::Timeout(limit)),
    }
}

#[derive(Clone)]
pub struct HttpRemoteStore {
    http: Client,
    base_url: Url,
    api_key: String,
    timeout: Duration,
}

impl fmt::Debug for HttpRemoteStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HttpRemoteStore")
            .field("base_url", &self.base_url)
            .finish_non_exhaustive()
    }
}

#[derive(Deserialize)]
struct PinStatusResponse {
    invalid: bool,
}

#[derive(Deserialize)]
struct CountResponse {
    count: i64,
}

impl HttpRemoteStore {
    pub fn new(base_url: Url, api_key: String, timeout: Duration) -> anyhow::Result<Self> {
        let http = Client::builder()
            .user_agent("cleanlog-sync/0.1")
            .timeout(timeout)
            .build()?;
        Ok(Self {
            http,
            base_url,
            api_key,
            timeout,
        })
    }

    pub fn from_config(cfg: &Config) -> anyhow::Result<Self> {
        let mut raw = cfg.remote.base_url.trim().to_string();
        if !raw.ends_with('/') {
            raw.push('/');
        }
        let base_url = Url::parse(&raw)?;
        Self::new(
            base_url,
            cfg.remote.api_key.clone(),
            cfg.remote.request_timeout(),
        )
    }

    pub fn build_request(
        &self,
        method: Method,
        path: &str,
        body: Option<&CleaningLogRecord>,
        idempotency_key: Option<&str>,
    ) -> Result<reqwest::Request, RemoteError> {
        let endpoint = self
            .base_url
            .join(path)
            .map_err(|err| RemoteError::Transport(format!("invalid endpoint {}: {}", path, err)))?;
        self.request_to(method, endpoint, body, idempotency_key)
    }

    /// `v1/locations/{location_id}/{tail..}` with the id as one escaped path segment.
    pub fn location_request(
        &self,
        method: Method,
        location_id: &str,
        tail: &[&str],
        query: &[(&str, String)],
    ) -> Result<reqwest::Request, RemoteError> {
        if matches!(location_id, "" | "." | "..") {
            return Err(RemoteError::InvalidLocation(location_id.to_string()));
        }
        let mut endpoint = self.base_url.clone();
        endpoint
            .path_segments_mut()
            .map_err(|_| RemoteError::Transport(format!("base url {} cannot hold a path", self.base_url)))?
            .pop_if_empty()
            .extend(["v1", "locations"])
            .push(location_id)
            .extend(tail);
        if !query.is_empty() {
            let mut pairs = endpoint.query_pairs_mut();
            for (key, value) in query {
                pairs.append_pair(key, value);
            }
        }
        self.request_to(method, endpoint, None, None)
    }

    fn request_to(
        &self,
        method: Method,
        endpoint: Url,
        body: Option<&CleaningLogRecord>,
        idempotency_key: Option<&str>,
    ) -> Result<reqwest::Request, RemoteError> {
        let mut builder = self
            .http
            .request(method, endpoint)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .header("Accept", "application/json");
        if let Some(key) = idempotency_key {
            builder = builder.header("Idempotency-Key", key);
        }
        if let Some(record) = body {
            builder = builder.json(record);
        }
        builder
            .build()
            .map_err(|err| RemoteError::from_reqwest(err, self.timeout))
    }

    fn transport(&self, err: reqwest::Error) -> RemoteError {
        RemoteError::from_reqwest(err, self.timeout)
    }

    async fn execute<T: DeserializeOwned>(&self, request: reqwest::Request) -> Result<T, RemoteError> {
        debug!(method = %request.method(), url = %request.url(), "sending remote request");
        let res = self
            .http
            .execute(request)
            .await
            .map_err(|err| self.transport(err))?;

        let status = res.status();
        if !status.is_success() {
            let body = res.text().await.unwrap_or_default();
            if status == StatusCode::TOO_MANY_REQUESTS {
                warn!("rate limited by remote store: {}", body);
            } else {
                warn!(%status, "remote store error: {}", body);
            }
            return Err(RemoteError::Rejected {
                status: status.as_u16(),
                body,
            });
        }

        let text = res.text().await.map_err(|err| self.transport(err))?;
        serde_json::from_str(&text).map_err(|err| RemoteError::Decode(err.to_string()))
    }
}

#[async_trait]
impl RemoteStore for HttpRemoteStore {
    async fn insert_log(
        &self,
        record: &CleaningLogRecord,
        idempotency_key: Option<&str>,
    ) -> Result<StoredRecord, RemoteError> {
        let request =
            self.build_request(Method::POST, "v1/cleaning_logs", Some(record), idempotency_key)?;
        self.execute(request).await
    }

    async fn check_pin_invalidated(
        &self,
        location_id: &str,
        session_start: DateTime<Utc>,
    ) -> Result<bool, RemoteError> {
        let request = self.location_request(
            Method::GET,
            location_id,
            &["pin_status"],
            &[("since", rfc3339(session_start))],
        )?;
        let resp: PinStatusResponse = self.execute(request).await?;
        Ok(resp.invalid)
    }

    async fn resolve_attention_logs(
        &self,
        location_id: &str,
        before: DateTime<Utc>,
    ) -> Result<i64, RemoteError> {
        let request = self.location_request(
            Method::POST,
            location_id,
            &["attention_logs", "resolve"],
            &[("before", rfc3339(before))],
        )?;
        let resp: CountResponse = self.execute(request).await?;
        Ok(resp.count)
    }

    async fn resolve_open_issues(
        &self,
        location_id: &str,
        before: DateTime<Utc>,
    ) -> Result<i64, RemoteError> {
        let request = self.location_request(
            Method::POST,
            location_id,
            &["issues", "resolve"],
            &[("before", rfc3339(before))],
        )?;
        let resp: CountResponse = self.execute(request).await?;
        Ok(resp.count)
    }

    async fn ping(&self) -> Result<(), RemoteError> {
        let request = self.build_request(Method::GET, "v1/health", None, None)?;
        let res = self
            .http
            .execute(request)
            .await
            .map_err(|err| self.transport(err))?;
        if res.status().is_server_error() {
            return Err(RemoteError::Rejected {
                status: res.status().as_u16(),
                body: String::new(),
            });
        }
        Ok(())
    }
}

fn rfc3339(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Millis, true)
}
