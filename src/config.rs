//! Configuration loader and validator for the cleaning-log sync agent.
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("YAML parse error: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("Invalid configuration: {0}")]
    Invalid(&'static str),
}

/// Root configuration struct mirroring the YAML schema exactly.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Config {
    pub app: App,
    pub remote: Remote,
    pub sync: SyncSettings,
}

/// App-level settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct App {
    pub data_dir: String,
}

/// Hosted store endpoint and credentials.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Remote {
    pub base_url: String,
    pub api_key: String,
    pub request_timeout_ms: u64,
}

/// Queue draining, connectivity and retry settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SyncSettings {
    pub settle_delay_ms: u64,
    pub startup_delay_ms: u64,
    pub probe_interval_ms: u64,
    pub drain_timeout_secs: u64,
    pub base_backoff_seconds: u64,
    pub max_backoff_seconds: u64,
    /// 0 disables the ceiling.
    pub max_attempts: u32,
}

impl App {
    /// Data directory with a leading `~/` expanded to `$HOME`.
    pub fn resolved_data_dir(&self) -> String {
        match self.data_dir.strip_prefix("~/") {
            Some(rest) => match std::env::var("HOME") {
                Ok(home) => format!("{}/{}", home.trim_end_matches('/'), rest),
                Err(_) => self.data_dir.clone(),
            },
            None => self.data_dir.clone(),
        }
    }
}

impl Remote {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

impl Config {
    /// Ensure required directories exist (creates `app.data_dir` if missing).
    pub fn ensure_dirs(&self) -> Result<(), std::io::Error> {
        if self.app.data_dir.trim().is_empty() {
            return Ok(());
        }
        fs::create_dir_all(self.app.resolved_data_dir())
    }

    /// `DATABASE_URL` if set, otherwise a SQLite file inside the data directory.
    pub fn database_url(&self) -> String {
        std::env::var("DATABASE_URL").unwrap_or_else(|_| {
            format!("sqlite://{}/cleanlog.db", self.app.resolved_data_dir())
        })
    }
}

/// Load configuration from a YAML file and validate it.
/// - If `path` is None, uses `config.yaml` in the current working directory.
pub fn load(path: Option<&Path>) -> Result<Config, ConfigError> {
    let path = path.unwrap_or_else(|| Path::new("config.yaml"));
    let content = fs::read_to_string(path)?;
    let cfg: Config = serde_yaml::from_str(&content)?;
    validate(&cfg)?;
    Ok(cfg)
}

/// Validate a configuration instance.
pub fn validate(cfg: &Config) -> Result<(), ConfigError> {
    if cfg.app.data_dir.trim().is_empty() {
        return Err(ConfigError::Invalid("app.data_dir must be non-empty"));
    }

    let base_url = cfg.remote.base_url.trim();
    if base_url.is_empty() {
        return Err(ConfigError::Invalid("remote.base_url must be non-empty"));
    }
    if !(base_url.starts_with("http://") || base_url.starts_with("https://")) {
        return Err(ConfigError::Invalid(
            "remote.base_url must start with http:// or https://",
        ));
    }
    if cfg.remote.api_key.trim().is_empty() {
        return Err(ConfigError::Invalid("remote.api_key must be non-empty"));
    }
    if cfg.remote.request_timeout_ms == 0 {
        return Err(ConfigError::Invalid("remote.request_timeout_ms must be > 0"));
    }

    if cfg.sync.probe_interval_ms == 0 {
        return Err(ConfigError::Invalid("sync.probe_interval_ms must be > 0"));
    }
    if cfg.sync.drain_timeout_secs == 0 {
        return Err(ConfigError::Invalid("sync.drain_timeout_secs must be > 0"));
    }
    if cfg.sync.base_backoff_seconds == 0 {
        return Err(ConfigError::Invalid("sync.base_backoff_seconds must be > 0"));
    }
    if cfg.sync.max_backoff_seconds < cfg.sync.base_backoff_seconds {
        return Err(ConfigError::Invalid(
            "sync.max_backoff_seconds must be >= sync.base_backoff_seconds",
        ));
    }

    Ok(())
}

/// Returns the example YAML shipped with the agent.
pub fn example() -> &'static str {
    r#"app:
  data_dir: "./data"

remote:
  base_url: "https://cleanlog.example.com/"
  api_key: "YOUR_REMOTE_API_KEY"
  request_timeout_ms: 10000

sync:
  settle_delay_ms: 2000
  startup_delay_ms: 3000
  probe_interval_ms: 5000
  drain_timeout_secs: 300
  base_backoff_seconds: 5
  max_backoff_seconds: 3600
  max_attempts: 20
"#
}
