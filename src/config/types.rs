//! Core configuration types.
//!
//! This module contains the root [`Config`] struct for `fleet.yaml`.

use super::{parse_duration_string, ServiceRecipe};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Environment variable overriding `data_dir`.
pub const DATA_DIR_ENV: &str = "FLEET_DATA_DIR";

pub const DEFAULT_DATA_DIR: &str = ".fleet";

/// Root configuration structure for fleet.yaml
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Where the database, lock file and service files live. Relative paths
    /// are resolved against the config file directory.
    #[serde(default = "default_data_dir")]
    pub data_dir: String,

    #[serde(default)]
    pub supervisor: SupervisorSettings,

    #[serde(default)]
    pub runtime: RuntimeSettings,

    #[serde(default)]
    pub host: HostSettings,

    /// Launch recipes keyed by service name.
    #[serde(default)]
    pub services: BTreeMap<String, ServiceRecipe>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            supervisor: SupervisorSettings::default(),
            runtime: RuntimeSettings::default(),
            host: HostSettings::default(),
            services: BTreeMap::new(),
        }
    }
}

fn default_data_dir() -> String {
    DEFAULT_DATA_DIR.to_string()
}

impl Config {
    /// Resolve the data directory: `FLEET_DATA_DIR` wins, then `data_dir`
    /// relative to `base_dir`.
    pub fn data_dir_path(&self, base_dir: &Path) -> PathBuf {
        if let Ok(dir) = std::env::var(DATA_DIR_ENV) {
            if !dir.trim().is_empty() {
                return PathBuf::from(dir);
            }
        }
        let dir = Path::new(&self.data_dir);
        if dir.is_absolute() {
            dir.to_path_buf()
        } else {
            base_dir.join(dir)
        }
    }
}

/// Timing knobs for the process supervisor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SupervisorSettings {
    #[serde(default = "default_heartbeat_interval")]
    pub heartbeat_interval: String,

    /// Delay between spawn and the liveness probe.
    #[serde(default = "default_settle_delay")]
    pub settle_delay: String,

    /// How long to wait after SIGTERM before SIGKILL.
    #[serde(default = "default_stop_grace")]
    pub stop_grace: String,

    /// Terminal rows older than this are purged by the heartbeat sweep.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stale_record_age: Option<String>,
}

impl Default for SupervisorSettings {
    fn default() -> Self {
        Self {
            heartbeat_interval: default_heartbeat_interval(),
            settle_delay: default_settle_delay(),
            stop_grace: default_stop_grace(),
            stale_record_age: None,
        }
    }
}

fn default_heartbeat_interval() -> String {
    "30s".to_string()
}

fn default_settle_delay() -> String {
    "2s".to_string()
}

fn default_stop_grace() -> String {
    "5s".to_string()
}

impl SupervisorSettings {
    pub fn heartbeat_interval(&self) -> Duration {
        parse_duration_string(&self.heartbeat_interval).unwrap_or(Duration::from_secs(30))
    }

    pub fn settle_delay(&self) -> Duration {
        parse_duration_string(&self.settle_delay).unwrap_or(Duration::from_secs(2))
    }

    pub fn stop_grace(&self) -> Duration {
        parse_duration_string(&self.stop_grace).unwrap_or(Duration::from_secs(5))
    }

    pub fn stale_record_age(&self) -> Option<Duration> {
        self.stale_record_age
            .as_deref()
            .and_then(parse_duration_string)
    }
}

/// Container runtime settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeSettings {
    /// Upper bound for a single runtime CLI invocation.
    #[serde(default = "default_command_timeout")]
    pub command_timeout: String,

    /// How often the daemon reconciles the container catalog.
    #[serde(default = "default_sync_interval")]
    pub sync_interval: String,
}

impl Default for RuntimeSettings {
    fn default() -> Self {
        Self {
            command_timeout: default_command_timeout(),
            sync_interval: default_sync_interval(),
        }
    }
}

fn default_command_timeout() -> String {
    "10s".to_string()
}

fn default_sync_interval() -> String {
    "30s".to_string()
}

impl RuntimeSettings {
    pub fn command_timeout(&self) -> Duration {
        parse_duration_string(&self.command_timeout).unwrap_or(Duration::from_secs(10))
    }

    pub fn sync_interval(&self) -> Duration {
        parse_duration_string(&self.sync_interval).unwrap_or(Duration::from_secs(30))
    }
}

/// Identity of the local host in the catalog.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HostSettings {
    /// Defaults to the OS hostname.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
}
