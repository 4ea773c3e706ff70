//! Configuration management for ecs-hatch.
//!
//! Configuration is loaded from a TOML file at `~/.ecs-hatch/config.toml`.
//! Every field is optional and falls back to a default, so a partial file
//! (or none at all) is always valid.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use crate::error::Backoff;
use crate::model::{Region, ResourceKind};

/// Main configuration structure.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub aws: AwsConfig,

    #[serde(default)]
    pub cache: CacheConfig,

    #[serde(default)]
    pub prefetch: PrefetchConfig,

    #[serde(default)]
    pub logs: LogsConfig,

    #[serde(default)]
    pub session: SessionConfig,

    #[serde(default)]
    pub deploy: DeployConfig,

    #[serde(default)]
    pub ui: UiConfig,
}

/// AWS SDK configuration options.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AwsConfig {
    /// AWS profile name to use from ~/.aws/credentials
    /// If not specified, the SDK's default resolution applies
    pub profile: Option<String>,

    /// Region codes offered at the root navigation level
    #[serde(default = "default_regions")]
    pub regions: Vec<String>,
}

/// Cache time-to-live settings, in seconds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    #[serde(default = "default_clusters_ttl")]
    pub clusters_ttl_secs: u64,

    #[serde(default = "default_services_ttl")]
    pub services_ttl_secs: u64,

    #[serde(default = "default_tasks_ttl")]
    pub tasks_ttl_secs: u64,

    #[serde(default = "default_task_detail_ttl")]
    pub task_detail_ttl_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PrefetchConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Maximum number of prefetches running at once
    #[serde(default = "default_prefetch_concurrency")]
    pub concurrency: usize,
}

/// Log streaming and download options.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogsConfig {
    /// Number of events kept in the live view before the oldest are evicted
    #[serde(default = "default_buffer_capacity")]
    pub buffer_capacity: usize,

    /// Delay between polls that returned no new events
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    /// Show timestamps in log view
    #[serde(default = "default_true")]
    pub show_timestamps: bool,

    /// Directory downloaded log files are written to
    #[serde(default = "default_export_dir")]
    pub export_dir: String,

    /// Download windows offered in the action menu, in minutes
    #[serde(default = "default_download_windows")]
    pub download_windows: Vec<u32>,

    /// Upper bound on pages fetched by one download
    #[serde(default = "default_max_download_pages")]
    pub max_download_pages: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Shell started inside containers
    #[serde(default = "default_shell")]
    pub shell: String,

    /// How long the session client must stay alive before it counts as connected
    #[serde(default = "default_startup_grace_ms")]
    pub startup_grace_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeployConfig {
    #[serde(default = "default_deploy_poll_secs")]
    pub poll_interval_secs: u64,

    /// Per-service limit on waiting for a deployment to settle
    #[serde(default = "default_deploy_timeout_secs")]
    pub timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UiConfig {
    /// Options: "dark", "light"
    #[serde(default = "default_theme")]
    pub theme: String,
}

// Default value functions for serde
fn default_regions() -> Vec<String> {
    vec!["us-east-1".to_string(), "eu-west-1".to_string(), "eu-west-2".to_string()]
}

fn default_clusters_ttl() -> u64 {
    300
}

fn default_services_ttl() -> u64 {
    120
}

fn default_tasks_ttl() -> u64 {
    15
}

fn default_task_detail_ttl() -> u64 {
    10
}

fn default_true() -> bool {
    true
}

fn default_prefetch_concurrency() -> usize {
    4
}

fn default_buffer_capacity() -> usize {
    5000
}

fn default_poll_interval_ms() -> u64 {
    1000
}

fn default_export_dir() -> String {
    "~/Downloads".to_string()
}

fn default_download_windows() -> Vec<u32> {
    vec![5, 15, 30, 60, 120, 360, 720, 1440]
}

fn default_max_download_pages() -> usize {
    200
}

fn default_shell() -> String {
    "/bin/sh".to_string()
}

fn default_startup_grace_ms() -> u64 {
    750
}

fn default_deploy_poll_secs() -> u64 {
    5
}

fn default_deploy_timeout_secs() -> u64 {
    600
}

fn default_theme() -> String {
    "dark".to_string()
}

impl Default for AwsConfig {
    fn default() -> Self {
        Self {
            profile: None,
            regions: default_regions(),
        }
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            clusters_ttl_secs: default_clusters_ttl(),
            services_ttl_secs: default_services_ttl(),
            tasks_ttl_secs: default_tasks_ttl(),
            task_detail_ttl_secs: default_task_detail_ttl(),
        }
    }
}

impl Default for PrefetchConfig {
    fn default() -> Self {
        Self {
            enabled: default_true(),
            concurrency: default_prefetch_concurrency(),
        }
    }
}

impl Default for LogsConfig {
    fn default() -> Self {
        Self {
            buffer_capacity: default_buffer_capacity(),
            poll_interval_ms: default_poll_interval_ms(),
            show_timestamps: default_true(),
            export_dir: default_export_dir(),
            download_windows: default_download_windows(),
            max_download_pages: default_max_download_pages(),
        }
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            shell: default_shell(),
            startup_grace_ms: default_startup_grace_ms(),
        }
    }
}

impl Default for DeployConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: default_deploy_poll_secs(),
            timeout_secs: default_deploy_timeout_secs(),
        }
    }
}

impl Default for UiConfig {
    fn default() -> Self {
        Self {
            theme: default_theme(),
        }
    }
}

impl AwsConfig {
    /// Configured regions with their display names.
    pub fn regions(&self) -> Vec<Region> {
        self.regions.iter().map(|code| Region::new(code)).collect()
    }
}

impl CacheConfig {
    pub fn ttl(&self, kind: ResourceKind) -> Duration {
        let secs = match kind {
            ResourceKind::Clusters => self.clusters_ttl_secs,
            ResourceKind::Services => self.services_ttl_secs,
            ResourceKind::Tasks => self.tasks_ttl_secs,
            ResourceKind::TaskDetail => self.task_detail_ttl_secs,
        };
        Duration::from_secs(secs)
    }
}

impl LogsConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    /// Export directory with a leading `~` expanded to the home directory.
    pub fn export_path(&self) -> PathBuf {
        match self.export_dir.strip_prefix("~/") {
            Some(rest) => dirs::home_dir().map_or_else(|| PathBuf::from(&self.export_dir), |home| home.join(rest)),
            None if self.export_dir == "~" => dirs::home_dir().unwrap_or_else(|| PathBuf::from(".")),
            None => PathBuf::from(&self.export_dir),
        }
    }

    pub fn backoff(&self) -> Backoff {
        Backoff::default()
    }
}

impl SessionConfig {
    pub fn startup_grace(&self) -> Duration {
        Duration::from_millis(self.startup_grace_ms)
    }
}

impl DeployConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

impl Config {
    /// Returns the path to the configuration directory (~/.ecs-hatch/)
    pub fn config_dir() -> Result<PathBuf> {
        let home_dir = dirs::home_dir().context("Failed to determine home directory")?;
        Ok(home_dir.join(".ecs-hatch"))
    }

    /// Returns the path to the configuration file (~/.ecs-hatch/config.toml)
    pub fn config_file_path() -> Result<PathBuf> {
        Ok(Self::config_dir()?.join("config.toml"))
    }

    /// Loads configuration from the config file, creating a default if it doesn't exist.
    ///
    /// # Errors
    /// This function will return an error if:
    /// - Home directory cannot be determined
    /// - File I/O operations fail
    /// - TOML parsing fails
    pub fn load() -> Result<Self> {
        let config_path = Self::config_file_path()?;

        if config_path.exists() {
            let contents = fs::read_to_string(&config_path)
                .with_context(|| format!("Failed to read config file: {config_path:?}"))?;

            let config: Config = toml::from_str(&contents)
                .with_context(|| format!("Failed to parse config file: {config_path:?}"))?;

            Ok(config)
        } else {
            let default_config = Config::default();
            default_config.create_default_config()?;
            Ok(default_config)
        }
    }

    /// Writes a commented default configuration file to ~/.ecs-hatch/config.toml.
    pub fn create_default_config(&self) -> Result<()> {
        let config_dir = Self::config_dir()?;
        let config_path = Self::config_file_path()?;

        if !config_dir.exists() {
            fs::create_dir_all(&config_dir)
                .with_context(|| format!("Failed to create config directory: {config_dir:?}"))?;
        }

        let default_toml = r#"# ecs-hatch configuration file
# Generated with default values. Every setting is optional.

[aws]
# AWS profile to use from ~/.aws/credentials (optional)
# profile = "default"

# Regions offered at startup
regions = ["us-east-1", "eu-west-1", "eu-west-2"]

[cache]
# Seconds before cached lists are fetched again
clusters_ttl_secs = 300
services_ttl_secs = 120
tasks_ttl_secs = 15
task_detail_ttl_secs = 10

[prefetch]
# Warm the cache for the highlighted item's children
enabled = true
concurrency = 4

[logs]
# Events kept in the live log view
buffer_capacity = 5000

# Milliseconds to wait when a poll returns nothing new
poll_interval_ms = 1000

show_timestamps = true

# Directory for downloaded log files
export_dir = "~/Downloads"

# Download windows in minutes
download_windows = [5, 15, 30, 60, 120, 360, 720, 1440]

# Safety cap on pages per download
max_download_pages = 200

[session]
# Shell started inside containers
shell = "/bin/sh"

# Milliseconds the session client must survive to count as connected
startup_grace_ms = 750

[deploy]
poll_interval_secs = 5
timeout_secs = 600

[ui]
# Options: "dark", "light"
theme = "dark"
"#;

        fs::write(&config_path, default_toml)
            .with_context(|| format!("Failed to write config file: {config_path:?}"))?;

        Ok(())
    }
}
