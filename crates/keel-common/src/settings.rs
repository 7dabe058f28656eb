//! keel settings stored at `~/.keel/config.json`.
//!
//! Every field has a default, so a missing file is the same as `{}`. The
//! resolution chain for the file itself (highest priority first):
//! 1. Explicit `--config` flag
//! 2. `KEEL_CONFIG` environment variable (wired through clap)
//! 3. `~/.keel/config.json`

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::retry::RetryConfig;
use crate::{Error, Result};

const STATE_DIR_NAME: &str = ".keel";
const CONFIG_FILE_NAME: &str = "config.json";

/// Base directory on every host (and locally) for images and rootfs.
pub const DEFAULT_DATA_DIR: &str = "/var/lib/keel";

/// Tunables for the whole tool.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct Settings {
    /// Image store and rootfs base directory.
    pub data_dir: PathBuf,
    /// Local state directory holding one subdirectory per cluster.
    pub state_dir: PathBuf,
    /// Remote execution tunables.
    pub ssh: SshSettings,
    /// Rolling upgrade tunables.
    pub upgrade: UpgradeSettings,
    /// External command used to fetch an image that is not present locally.
    /// `{image}` and `{dest}` are substituted.
    pub image_pull_command: Option<String>,
}

/// Remote execution tunables.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct SshSettings {
    /// Readiness checks per host before giving up.
    pub ready_attempts: u32,
    /// Linear backoff step between checks.
    pub ready_backoff_secs: u64,
    /// Connect timeout handed to ssh.
    pub connect_timeout_secs: u64,
    /// Upper bound for one remote command.
    pub command_timeout_secs: u64,
    /// Concurrent rootfs transfers.
    pub transfer_concurrency: usize,
}

impl Default for SshSettings {
    fn default() -> Self {
        Self {
            ready_attempts: 6,
            ready_backoff_secs: 1,
            connect_timeout_secs: 15,
            command_timeout_secs: 600,
            transfer_concurrency: 2,
        }
    }
}

impl SshSettings {
    /// Retry policy for readiness probing.
    pub fn ready_retry(&self) -> RetryConfig {
        RetryConfig::linear(
            self.ready_attempts.max(1),
            Duration::from_secs(self.ready_backoff_secs),
        )
    }

    /// Upper bound for one remote command.
    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.command_timeout_secs)
    }
}

/// Rolling upgrade tunables.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct UpgradeSettings {
    /// Sleep between Ready checks.
    pub poll_interval_secs: u64,
    /// Ready checks before a host is declared failed.
    pub max_polls: u32,
}

impl Default for UpgradeSettings {
    fn default() -> Self {
        Self {
            poll_interval_secs: 10,
            max_polls: 30,
        }
    }
}

impl UpgradeSettings {
    /// Retry policy for the post-upgrade Ready poll.
    pub fn ready_poll(&self) -> RetryConfig {
        RetryConfig::fixed(
            self.max_polls.max(1),
            Duration::from_secs(self.poll_interval_secs),
        )
    }
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from(DEFAULT_DATA_DIR),
            state_dir: default_state_dir(),
            ssh: SshSettings::default(),
            upgrade: UpgradeSettings::default(),
            image_pull_command: None,
        }
    }
}

fn default_state_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("/root"))
        .join(STATE_DIR_NAME)
}

/// Path to `~/.keel/config.json`.
pub fn default_config_path() -> PathBuf {
    default_state_dir().join(CONFIG_FILE_NAME)
}

impl Settings {
    /// Load settings, returning defaults if the file is missing.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let data = std::fs::read_to_string(path)
            .map_err(|e| Error::io(format!("read {}", path.display()), e))?;
        serde_json::from_str(&data).map_err(|e| {
            Error::serialization_for_kind("settings", format!("{}: {}", path.display(), e))
        })
    }

    /// Save settings as pretty JSON.
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| Error::io(format!("create {}", parent.display()), e))?;
        }
        let data = serde_json::to_string_pretty(self)?;
        std::fs::write(path, data).map_err(|e| Error::io(format!("write {}", path.display()), e))
    }

    /// Local directory holding one cluster's persisted state.
    pub fn cluster_state_dir(&self, cluster: &str) -> PathBuf {
        self.state_dir.join(cluster)
    }

    /// Remote rootfs directory of one cluster.
    pub fn rootfs_dir(&self, cluster: &str) -> PathBuf {
        self.data_dir.join(cluster).join("rootfs")
    }
}
