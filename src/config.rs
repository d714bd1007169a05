//! Configuration loader and validator for the stream cache queue.
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

/// Root configuration struct mirroring the YAML schema.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Config {
    pub app: App,
    pub fetch: Fetch,
    pub resolver: Resolver,
}

/// Queue and worker settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct App {
    pub data_dir: String,
    pub poll_interval_ms: u64,
    /// Cap for a single backoff delay; 0 keeps the curve unbounded.
    pub max_backoff_seconds: u64,
    /// Running entries older than this are handed back to standby.
    pub running_lease_seconds: u64,
    /// Successful entries are purged after this long; 0 purges on the next sweep.
    pub success_retention_seconds: u64,
    /// How many cache items of one post are fetched at once.
    pub item_concurrency: usize,
}

/// Remote fetch settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Fetch {
    pub timeout_ms: u64,
    pub max_response_bytes: u64,
    pub user_agent: String,
}

/// Object resolution settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Resolver {
    /// Host this instance serves its own notes from. May be left empty at
    /// load time; cache items then fail with a configuration error and stay
    /// pending until it is set.
    #[serde(default)]
    pub instance_host: String,
    pub redundancy_limit: usize,
}

impl Config {
    /// Ensure required directories exist (creates `app.data_dir` if missing).
    pub fn ensure_dirs(&self) -> Result<(), std::io::Error> {
        if self.app.data_dir.trim().is_empty() {
            return Ok(());
        }
        fs::create_dir_all(&self.app.data_dir)
    }

    pub fn database_url(&self) -> String {
        format!(
            "sqlite://{}/stream-queue.db",
            self.app.data_dir.trim_end_matches('/')
        )
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.app.poll_interval_ms)
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
    if cfg.app.poll_interval_ms == 0 {
        return Err(ConfigError::Invalid("app.poll_interval_ms must be > 0"));
    }
    if cfg.app.running_lease_seconds == 0 {
        return Err(ConfigError::Invalid("app.running_lease_seconds must be > 0"));
    }
    if cfg.app.item_concurrency == 0 {
        return Err(ConfigError::Invalid("app.item_concurrency must be > 0"));
    }

    if cfg.fetch.timeout_ms == 0 {
        return Err(ConfigError::Invalid("fetch.timeout_ms must be > 0"));
    }
    if cfg.fetch.max_response_bytes == 0 {
        return Err(ConfigError::Invalid("fetch.max_response_bytes must be > 0"));
    }
    if cfg.fetch.user_agent.trim().is_empty() {
        return Err(ConfigError::Invalid("fetch.user_agent must be non-empty"));
    }

    if cfg.resolver.redundancy_limit == 0 {
        return Err(ConfigError::Invalid("resolver.redundancy_limit must be > 0"));
    }

    Ok(())
}

/// Example YAML accepted by [`load`].
pub fn example() -> &'static str {
    r#"app:
  data_dir: "./data"
  poll_interval_ms: 5000
  max_backoff_seconds: 21600
  running_lease_seconds: 900
  success_retention_seconds: 86400
  item_concurrency: 1

fetch:
  timeout_ms: 10000
  max_response_bytes: 1048576
  user_agent: "stream-queue/0.1"

resolver:
  instance_host: "social.example.org"
  redundancy_limit: 8
"#
}
