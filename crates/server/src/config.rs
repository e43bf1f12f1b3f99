//! Server tuning loaded from TOML.

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::warn;

/// Engine configuration.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Period of the sync flush and maintenance ticks.
    pub flush_interval_ms: u64,
    /// A location with more dirty slots than this is sent as a full snapshot.
    pub full_resync_threshold: usize,
    /// Bounded mailbox size for every actor.
    pub mailbox_capacity: usize,
    /// Unviewed containers kept in memory before the least recently used are evicted.
    pub max_idle_containers: usize,
    /// JSONL file receiving one record per rejected action.
    pub audit_log: Option<PathBuf>,
    /// JSON item table; every id up to 1024 stacks to 64 when absent.
    pub item_table: Option<PathBuf>,
    /// Action ceiling per session.
    pub rate_limit: RateLimitConfig,
    /// Snapshot storage.
    pub persistence: PersistenceConfig,
}

/// Per-session action ceiling.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct RateLimitConfig {
    /// Window length in milliseconds.
    pub window_ms: u64,
    /// Actions admitted per window.
    pub max_actions: u32,
}

/// Snapshot storage and retry policy.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct PersistenceConfig {
    /// Directory for snapshot files.
    pub data_dir: PathBuf,
    /// Attempts per load or save before giving up.
    pub max_attempts: u32,
    /// First retry delay; doubled after every failed attempt.
    pub backoff_ms: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            flush_interval_ms: 50,
            full_resync_threshold: 8,
            mailbox_capacity: 256,
            max_idle_containers: 64,
            rate_limit: RateLimitConfig::default(),
            persistence: PersistenceConfig::default(),
            audit_log: None,
            item_table: None,
        }
    }
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            window_ms: 1000,
            max_actions: 40,
        }
    }
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("stash"),
            max_attempts: 3,
            backoff_ms: 25,
        }
    }
}

impl ServerConfig {
    /// Load configuration from `path`, falling back to defaults on errors.
    pub fn load_from_path(path: &Path) -> Self {
        match fs::read_to_string(path) {
            Ok(contents) => match Self::from_toml_str(&contents) {
                Ok(cfg) => cfg,
                Err(err) => {
                    warn!("Failed to parse {}: {err}. Using defaults", path.display());
                    ServerConfig::default()
                }
            },
            Err(err) => {
                if err.kind() == std::io::ErrorKind::NotFound {
                    warn!("Server config not found at {}. Using defaults", path.display());
                } else {
                    warn!("Failed to read {}: {err}. Using defaults", path.display());
                }
                ServerConfig::default()
            }
        }
    }

    /// Parse configuration text.
    pub fn from_toml_str(contents: &str) -> Result<Self> {
        Ok(toml::from_str(contents)?)
    }

    /// Save configuration to an explicit path.
    pub fn save_to_path(&self, path: &Path) -> Result<()> {
        let toml = toml::to_string_pretty(self)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, toml)?;
        Ok(())
    }

    /// Flush and maintenance period.
    pub fn flush_interval(&self) -> Duration {
        Duration::from_millis(self.flush_interval_ms.max(1))
    }

    /// Mailbox size, never zero.
    pub fn mailbox(&self) -> usize {
        self.mailbox_capacity.max(1)
    }
}

impl RateLimitConfig {
    /// Window length.
    pub fn window(&self) -> Duration {
        Duration::from_millis(self.window_ms)
    }
}

impl PersistenceConfig {
    /// Delay before the first retry.
    pub fn backoff(&self) -> Duration {
        Duration::from_millis(self.backoff_ms)
    }
}
