//! Configuration model (`trellis.yaml`).
//!
//! Every field has a default, so an empty file (or no file) is a valid
//! configuration. Resolution order for the file itself:
//! 1. explicit path (must exist)
//! 2. `TRELLIS_CONFIG`
//! 3. `./trellis.yaml`
//! 4. built-in defaults
//!
//! `TRELLIS_DATA_DIR`, `TRELLIS_HOST` and `TRELLIS_PORT` are applied last.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, warn};

use crate::app::{LeasePolicy, TailOptions};
use crate::domain::TransitionTable;

pub const CONFIG_ENV: &str = "TRELLIS_CONFIG";
pub const DEFAULT_CONFIG_FILE: &str = "trellis.yaml";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("config file {path} not found")]
    NotFound { path: PathBuf },

    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },

    #[error("invalid configuration: {}", .0.join("; "))]
    Invalid(Vec<String>),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TrellisConfig {
    /// Holds `<kind>.json` files and `events.jsonl`.
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub leases: LeaseConfig,
    #[serde(default)]
    pub tail: TailConfig,
    #[serde(default)]
    pub tasks: TaskConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LeaseConfig {
    /// TTL of the lease a claim acquires on the caller's behalf.
    #[serde(default = "default_ttl")]
    pub default_ttl_seconds: u64,
    #[serde(default = "default_max_ttl")]
    pub max_ttl_seconds: u64,
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_seconds: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TailConfig {
    #[serde(default = "default_keepalive")]
    pub keepalive_seconds: u64,
    /// Close a subscription after this long without events. Unset = never.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub idle_timeout_seconds: Option<u64>,
    #[serde(default = "default_subscriber_buffer")]
    pub subscriber_buffer: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TaskConfig {
    /// Enables the `review -> claimed` edge.
    #[serde(default = "default_true")]
    pub allow_rework: bool,
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("./trellis-data")
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    7878
}

fn default_ttl() -> u64 {
    60
}

fn default_max_ttl() -> u64 {
    3600
}

fn default_sweep_interval() -> u64 {
    15
}

fn default_keepalive() -> u64 {
    15
}

fn default_subscriber_buffer() -> usize {
    256
}

fn default_true() -> bool {
    true
}

impl Default for TrellisConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            server: ServerConfig::default(),
            leases: LeaseConfig::default(),
            tail: TailConfig::default(),
            tasks: TaskConfig::default(),
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

impl Default for LeaseConfig {
    fn default() -> Self {
        Self {
            default_ttl_seconds: default_ttl(),
            max_ttl_seconds: default_max_ttl(),
            sweep_interval_seconds: default_sweep_interval(),
        }
    }
}

impl Default for TailConfig {
    fn default() -> Self {
        Self {
            keepalive_seconds: default_keepalive(),
            idle_timeout_seconds: None,
            subscriber_buffer: default_subscriber_buffer(),
        }
    }
}

impl Default for TaskConfig {
    fn default() -> Self {
        Self {
            allow_rework: default_true(),
        }
    }
}

impl TrellisConfig {
    pub fn from_yaml_str(yaml: &str) -> Result<Self, serde_yaml::Error> {
        // An empty document deserializes as unit, not as an empty mapping.
        if yaml.trim().is_empty() {
            return Ok(Self::default());
        }
        serde_yaml::from_str(yaml)
    }

    pub fn from_yaml_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| {
            if source.kind() == std::io::ErrorKind::NotFound {
                ConfigError::NotFound {
                    path: path.to_path_buf(),
                }
            } else {
                ConfigError::Io {
                    path: path.to_path_buf(),
                    source,
                }
            }
        })?;
        Self::from_yaml_str(&text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn to_yaml(&self) -> Result<String, serde_yaml::Error> {
        serde_yaml::to_string(self)
    }

    /// Find a config file: `TRELLIS_CONFIG`, then `./trellis.yaml`.
    pub fn discover_with(env: impl Fn(&str) -> Option<String>) -> Option<PathBuf> {
        if let Some(path) = env(CONFIG_ENV) {
            let path = PathBuf::from(path);
            if path.exists() {
                return Some(path);
            }
            warn!(path = %path.display(), "{CONFIG_ENV} points at a missing file, ignoring");
        }

        let cwd = PathBuf::from(DEFAULT_CONFIG_FILE);
        cwd.exists().then_some(cwd)
    }

    /// Load with discovery and env overrides from the process environment.
    /// Returns the config and the file it came from, if any.
    pub fn load_or_default(explicit: Option<&Path>) -> Result<(Self, Option<PathBuf>), ConfigError> {
        Self::load_with(explicit, |key| std::env::var(key).ok())
    }

    pub fn load_with(
        explicit: Option<&Path>,
        env: impl Fn(&str) -> Option<String>,
    ) -> Result<(Self, Option<PathBuf>), ConfigError> {
        let source = match explicit {
            Some(path) => {
                info!(path = %path.display(), "loading configuration from explicit path");
                Some(path.to_path_buf())
            }
            None => Self::discover_with(&env),
        };

        let mut config = match &source {
            Some(path) => Self::from_yaml_file(path)?,
            None => {
                info!("no configuration file found, using defaults");
                Self::default()
            }
        };
        config.apply_env_overrides_with(&env);
        Ok((config, source))
    }

    pub fn apply_env_overrides_with(&mut self, env: impl Fn(&str) -> Option<String>) {
        if let Some(dir) = env("TRELLIS_DATA_DIR") {
            info!(data_dir = %dir, "environment override: TRELLIS_DATA_DIR");
            self.data_dir = PathBuf::from(dir);
        }
        if let Some(host) = env("TRELLIS_HOST") {
            info!(%host, "environment override: TRELLIS_HOST");
            self.server.host = host;
        }
        if let Some(port) = env("TRELLIS_PORT") {
            match port.parse() {
                Ok(port) => {
                    info!(port, "environment override: TRELLIS_PORT");
                    self.server.port = port;
                }
                Err(_) => warn!(value = %port, "invalid TRELLIS_PORT, ignoring"),
            }
        }
    }

    /// Collects every problem rather than stopping at the first.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut problems = Vec::new();

        if self.data_dir.as_os_str().is_empty() {
            problems.push("data_dir cannot be empty".to_string());
        }
        if self.server.host.is_empty() {
            problems.push("server.host cannot be empty".to_string());
        }
        if self.leases.default_ttl_seconds == 0 {
            problems.push("leases.default_ttl_seconds must be positive".to_string());
        }
        if self.leases.max_ttl_seconds == 0 {
            problems.push("leases.max_ttl_seconds must be positive".to_string());
        }
        if self.leases.default_ttl_seconds > self.leases.max_ttl_seconds {
            problems.push(format!(
                "leases.default_ttl_seconds ({}) exceeds leases.max_ttl_seconds ({})",
                self.leases.default_ttl_seconds, self.leases.max_ttl_seconds
            ));
        }
        if self.leases.sweep_interval_seconds == 0 {
            problems.push("leases.sweep_interval_seconds must be positive".to_string());
        }
        if self.tail.keepalive_seconds == 0 {
            problems.push("tail.keepalive_seconds must be positive".to_string());
        }
        if self.tail.idle_timeout_seconds == Some(0) {
            problems.push("tail.idle_timeout_seconds must be positive when set".to_string());
        }
        if self.tail.subscriber_buffer == 0 {
            problems.push("tail.subscriber_buffer must be positive".to_string());
        }

        if problems.is_empty() {
            Ok(())
        } else {
            Err(ConfigError::Invalid(problems))
        }
    }

    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.server.host, self.server.port)
    }

    pub fn lease_policy(&self) -> LeasePolicy {
        LeasePolicy {
            default_ttl_seconds: self.leases.default_ttl_seconds,
            max_ttl_seconds: self.leases.max_ttl_seconds,
        }
    }

    pub fn tail_options(&self) -> TailOptions {
        TailOptions {
            keepalive: Duration::from_secs(self.tail.keepalive_seconds),
            idle_timeout: self.tail.idle_timeout_seconds.map(Duration::from_secs),
        }
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.leases.sweep_interval_seconds)
    }

    pub fn transition_table(&self) -> TransitionTable {
        TransitionTable::from_config(self.tasks.allow_rework)
    }
}
