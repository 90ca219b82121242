//! Configuration management for the clone run.
//!
//! Loads tool locations and tunables from an optional TOML file. Per-run
//! switches come from the command line as [`RunOptions`]. Both are built once
//! in `main` and passed by reference to every component.

use serde::{Deserialize, Serialize};
use std::path::Path;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub tools: ToolsConfig,
    #[serde(default)]
    pub transfer: TransferConfig,
    #[serde(default)]
    pub stats: StatsConfig,
    #[serde(default)]
    pub cleanup: CleanupConfig,
    #[serde(default)]
    pub misc: MiscConfig,
    #[serde(default)]
    pub log: LogConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolsConfig {
    #[serde(default = "default_btrfs")]
    pub btrfs: String,

    #[serde(default = "default_ssh")]
    pub ssh: String,

    #[serde(default = "default_sshfs")]
    pub sshfs: String,

    #[serde(default = "default_fusermount")]
    pub fusermount: String,

    #[serde(default = "default_rsync")]
    pub rsync: String,

    /// Directories appended to PATH for every spawned tool (e.g. when run from cron)
    #[serde(default = "default_extra_paths")]
    pub extra_paths: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransferConfig {
    /// Progress filter placed between send and receive; empty disables it
    #[serde(default = "default_progress_filter")]
    pub progress_filter: Vec<String>,

    /// How often the progress display is refreshed
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatsConfig {
    /// Re-list the destination and show stats after this many transfers (0 = never)
    #[serde(default = "default_refresh_interval")]
    pub refresh_interval: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CleanupConfig {
    /// Countdown before stray deletion in interactive mode
    #[serde(default = "default_countdown_secs")]
    pub countdown_secs: u64,

    /// Countdown before any work starts in interactive mode
    #[serde(default = "default_start_countdown_secs")]
    pub start_countdown_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MiscConfig {
    /// Non-snapshot paths copied with rsync; `{src}` expands to the source path.
    ///
    /// Empty unless configured, so a plain run never invokes rsync. An
    /// UrBackup server usually wants
    /// `["/var/urbackup", "{src}/clients", "{src}/urbackup"]`.
    #[serde(default)]
    pub sources: Vec<String>,

    /// Where the copies land; `{dst}` expands to the destination path
    #[serde(default = "default_misc_destination")]
    pub destination: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,
}

/// Switches for a single run, taken from the command line.
#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    pub verbose: u8,
    pub delete_strays: bool,
    pub dry_run: bool,
    pub interactive: bool,
    pub ignore_errors: bool,
}

// Default values
fn default_btrfs() -> String {
    "btrfs".to_string()
}

fn default_ssh() -> String {
    "ssh".to_string()
}

fn default_sshfs() -> String {
    "sshfs".to_string()
}

fn default_fusermount() -> String {
    "fusermount".to_string()
}

fn default_rsync() -> String {
    "rsync".to_string()
}

fn default_extra_paths() -> Vec<String> {
    vec!["/usr/bin".to_string()]
}

fn default_progress_filter() -> Vec<String> {
    ["pv", "-f", "-F", "time [%t] -- rate %a -- size [%b]"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

fn default_poll_interval_ms() -> u64 {
    500
}

fn default_refresh_interval() -> usize {
    10
}

fn default_countdown_secs() -> u64 {
    10
}

fn default_start_countdown_secs() -> u64 {
    20
}

fn default_misc_destination() -> String {
    "{dst}/_urbcb_misc_backups".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for ToolsConfig {
    fn default() -> Self {
        Self {
            btrfs: default_btrfs(),
            ssh: default_ssh(),
            sshfs: default_sshfs(),
            fusermount: default_fusermount(),
            rsync: default_rsync(),
            extra_paths: default_extra_paths(),
        }
    }
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            progress_filter: default_progress_filter(),
            poll_interval_ms: default_poll_interval_ms(),
        }
    }
}

impl Default for StatsConfig {
    fn default() -> Self {
        Self {
            refresh_interval: default_refresh_interval(),
        }
    }
}

impl Default for CleanupConfig {
    fn default() -> Self {
        Self {
            countdown_secs: default_countdown_secs(),
            start_countdown_secs: default_start_countdown_secs(),
        }
    }
}

impl Default for MiscConfig {
    fn default() -> Self {
        Self {
            sources: Vec::new(),
            destination: default_misc_destination(),
        }
    }
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl Config {
    /// Load configuration from a TOML file
    pub fn from_file(path: &Path) -> crate::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        Ok(config)
    }
}

impl ToolsConfig {
    /// PATH value handed to spawned tools: the current PATH plus `extra_paths`,
    /// order kept, duplicates dropped.
    pub fn search_path(&self) -> String {
        let current = std::env::var("PATH").unwrap_or_default();
        let mut seen = Vec::new();
        for dir in current.split(':').chain(self.extra_paths.iter().map(String::as_str)) {
            if !dir.is_empty() && !seen.contains(&dir) {
                seen.push(dir);
            }
        }
        seen.join(":")
    }
}

impl MiscConfig {
    /// Basename of the rsync destination; never treated as a stray directory.
    pub fn destination_dir_name(&self) -> Option<String> {
        Path::new(self.destination.trim_end_matches('/'))
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
    }
}
