use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use crate::constants::{
    AUTH_ERROR_BACKOFF_SECS, COMMAND_BATCH_SIZE, DRAIN_INTERVAL_MS, IDLE_TIMEOUT_SECS,
    LIVENESS_INTERVAL_SECS, REFRESH_INTERVAL_SECS,
};
use crate::mail::types::{ActionKind, FolderRole};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// SQLite database path (default: data dir)
    #[serde(default)]
    pub database: Option<PathBuf>,
    #[serde(default)]
    pub sync: SyncConfig,
    #[serde(default)]
    pub folders: FolderRules,
    /// Filter rules applied to every newly stored message
    #[serde(default)]
    pub filters: Vec<FilterRule>,
    /// Users triggered at daemon start
    #[serde(default)]
    pub users: Vec<UserConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncConfig {
    #[serde(default = "default_idle_timeout_secs")]
    pub idle_timeout_secs: u64,
    #[serde(default = "default_drain_interval_ms")]
    pub drain_interval_ms: u64,
    #[serde(default = "default_refresh_interval_secs")]
    pub refresh_interval_secs: u64,
    #[serde(default = "default_liveness_interval_secs")]
    pub liveness_interval_secs: u64,
    #[serde(default = "default_auth_error_backoff_secs")]
    pub auth_error_backoff_secs: u64,
    #[serde(default = "default_command_batch_size")]
    pub command_batch_size: usize,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            idle_timeout_secs: default_idle_timeout_secs(),
            drain_interval_ms: default_drain_interval_ms(),
            refresh_interval_secs: default_refresh_interval_secs(),
            liveness_interval_secs: default_liveness_interval_secs(),
            auth_error_backoff_secs: default_auth_error_backoff_secs(),
            command_batch_size: default_command_batch_size(),
        }
    }
}

impl SyncConfig {
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }

    pub fn drain_interval(&self) -> Duration {
        Duration::from_millis(self.drain_interval_ms)
    }

    pub fn refresh_interval(&self) -> Duration {
        Duration::from_secs(self.refresh_interval_secs)
    }

    pub fn liveness_interval(&self) -> Duration {
        Duration::from_secs(self.liveness_interval_secs)
    }
}

/// Static folder mapping configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FolderRules {
    /// Folder names never synchronized (case-insensitive)
    #[serde(default)]
    pub skip: Vec<String>,
    /// Extra name-to-role entries, consulted before the built-in table
    #[serde(default)]
    pub names: HashMap<String, FolderRole>,
    /// Per-provider name tables, keyed by address domain
    #[serde(default)]
    pub domains: Vec<DomainOverride>,
    /// Tags applied to messages landing in a folder
    #[serde(default)]
    pub tags: HashMap<String, Vec<String>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DomainOverride {
    pub domain: String,
    #[serde(default)]
    pub names: HashMap<String, FolderRole>,
}

/// Per-mailbox folder override as stored with the account.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FolderOverride {
    pub folder: String,
    pub role: Option<FolderRole>,
    pub skip: bool,
    pub tags: Vec<String>,
}

impl FolderRules {
    pub fn tags_for(&self, folder: &str) -> Vec<String> {
        self.tags
            .iter()
            .filter(|(name, _)| name.eq_ignore_ascii_case(folder))
            .flat_map(|(_, tags)| tags.iter().cloned())
            .collect()
    }

    /// Rules for one mailbox: its stored overrides layered over these rules.
    pub fn with_overrides(&self, overrides: &[FolderOverride]) -> FolderRules {
        let mut rules = self.clone();
        // Keys are normalized so lookups match `detect_folder`'s lowercase keys.
        rules.names = rules
            .names
            .into_iter()
            .map(|(name, role)| (name.to_lowercase(), role))
            .collect();
        for o in overrides {
            if o.skip {
                rules.skip.push(o.folder.clone());
            }
            if let Some(role) = o.role {
                rules.names.insert(o.folder.to_lowercase(), role);
            }
            if !o.tags.is_empty() {
                rules
                    .tags
                    .entry(o.folder.clone())
                    .or_default()
                    .extend(o.tags.iter().cloned());
            }
        }
        rules
    }
}

/// Keyword rule evaluated by the filter step of the side-effect pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FilterRule {
    #[serde(default)]
    pub name: Option<String>,
    /// Any of these substrings in the sender address (case-insensitive)
    #[serde(default)]
    pub from_contains: Vec<String>,
    /// Any of these substrings in the subject (case-insensitive)
    #[serde(default)]
    pub subject_contains: Vec<String>,
    pub action: ActionKind,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserConfig {
    #[serde(default)]
    pub tenant: i64,
    pub user: String,
}

fn default_idle_timeout_secs() -> u64 {
    IDLE_TIMEOUT_SECS
}

fn default_drain_interval_ms() -> u64 {
    DRAIN_INTERVAL_MS
}

fn default_refresh_interval_secs() -> u64 {
    REFRESH_INTERVAL_SECS
}

fn default_liveness_interval_secs() -> u64 {
    LIVENESS_INTERVAL_SECS
}

fn default_auth_error_backoff_secs() -> u64 {
    AUTH_ERROR_BACKOFF_SECS
}

fn default_command_batch_size() -> usize {
    COMMAND_BATCH_SIZE
}

impl Config {
    pub fn config_dir() -> Result<PathBuf> {
        let dir = dirs::config_dir()
            .context("Could not find config directory")?
            .join("mailsync");
        Ok(dir)
    }

    pub fn config_path() -> Result<PathBuf> {
        Ok(Self::config_dir()?.join("config.toml"))
    }

    pub fn data_dir() -> Result<PathBuf> {
        let dir = dirs::data_local_dir()
            .context("Could not find data directory")?
            .join("mailsync");
        Ok(dir)
    }

    pub fn database_path(&self) -> Result<PathBuf> {
        match &self.database {
            Some(path) => Ok(path.clone()),
            None => Ok(Self::data_dir()?.join("mailsync.db")),
        }
    }

    /// Load from the default path; a missing file yields defaults.
    pub fn load() -> Result<Self> {
        let path = Self::config_path()?;
        if !path.exists() {
            tracing::info!("No config at {}, using defaults", path.display());
            return Ok(Self::default());
        }

        let content = fs::read_to_string(&path)
            .with_context(|| format!("Failed to read config from {}", path.display()))?;
        Self::parse(&content)
            .with_context(|| format!("Failed to parse config at {}", path.display()))
    }

    pub fn parse(content: &str) -> Result<Self> {
        let config: Config = toml::from_str(content)?;
        Ok(config)
    }

    pub fn ensure_dirs(&self) -> Result<()> {
        fs::create_dir_all(Self::config_dir()?)?;
        if let Some(parent) = self.database_path()?.parent() {
            fs::create_dir_all(parent)?;
        }
        Ok(())
    }
}
