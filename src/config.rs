//! Configuration loading and defaults.
//!
//! Configuration is resolved in order of precedence (highest wins):
//!
//! 1. **Environment variables**: `FWDCTL_LISTEN`, `FWDCTL_BASE_DIR`,
//!    `FWDCTL_SSH`, `FWDCTL_TUNNEL_FILE`
//! 2. **Config file**: path via `--config <path>`, or `fwdctl.toml` in CWD
//! 3. **Compiled defaults**: see each field's default value below
//!
//! The TOML file mirrors the struct hierarchy:
//!
//! ```toml
//! [server]
//! listen = "127.0.0.1:8080"
//!
//! [supervisor]
//! base_dir = "~/.fwdctl"          # proc/ and log/ live under it
//! ssh_exec = "ssh"
//! tunnel_file = "tunnels.json"
//! reconcile_interval_secs = 10
//! probe_timeout_ms = 1
//! stop_grace_ms = 3000
//! stop_on_exit = true
//! unmanaged_alive = "leave"       # or "terminate"
//!
//! [notifications]
//! capacity = 100
//! enqueue_timeout_ms = 1
//!
//! [logging]
//! level = "info"
//! ```

use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::tunnel::UnmanagedAlivePolicy;
use crate::util::expand_home;

const DEFAULT_CONFIG_FILE: &str = "fwdctl.toml";

/// Top-level configuration, deserialized from TOML.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub supervisor: SupervisorConfig,
    #[serde(default)]
    pub notifications: NotificationConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// HTTP server settings.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Socket address to bind (default `127.0.0.1:8080`).
    #[serde(default = "default_listen")]
    pub listen: String,
}

/// Tunnel supervision settings.
#[derive(Debug, Clone, Deserialize)]
pub struct SupervisorConfig {
    /// Bookkeeping root (default `~/.fwdctl`). Override with `FWDCTL_BASE_DIR`.
    #[serde(default = "default_base_dir")]
    pub base_dir: String,
    /// Forwarding executable (default `ssh`). Override with `FWDCTL_SSH`.
    #[serde(default = "default_ssh_exec")]
    pub ssh_exec: String,
    /// User-authored tunnel list (default `tunnels.json`).
    #[serde(default = "default_tunnel_file")]
    pub tunnel_file: String,
    /// Seconds between reconciliation cycles (default 10).
    #[serde(default = "default_reconcile_interval_secs")]
    pub reconcile_interval_secs: u64,
    /// Port probe connect timeout in milliseconds (default 1).
    #[serde(default = "default_probe_timeout_ms")]
    pub probe_timeout_ms: u64,
    /// Wait between SIGTERM and SIGKILL in milliseconds (default 3000).
    #[serde(default = "default_stop_grace_ms")]
    pub stop_grace_ms: u64,
    /// Stop every managed tunnel on graceful shutdown (default true).
    #[serde(default = "default_stop_on_exit")]
    pub stop_on_exit: bool,
    /// What the reconciler does with live processes nobody manages.
    #[serde(default)]
    pub unmanaged_alive: UnmanagedAlivePolicy,
}

/// Notification queue settings.
#[derive(Debug, Clone, Deserialize)]
pub struct NotificationConfig {
    /// Maximum queued messages (default 100).
    #[serde(default = "default_capacity")]
    pub capacity: usize,
    /// How long a push may wait for room before it is dropped (default 1 ms).
    #[serde(default = "default_enqueue_timeout_ms")]
    pub enqueue_timeout_ms: u64,
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// tracing filter level (default `info`). Overridden by `RUST_LOG` env var.
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_listen() -> String {
    "127.0.0.1:8080".to_string()
}
fn default_base_dir() -> String {
    "~/.fwdctl".to_string()
}
fn default_ssh_exec() -> String {
    "ssh".to_string()
}
fn default_tunnel_file() -> String {
    "tunnels.json".to_string()
}
fn default_reconcile_interval_secs() -> u64 {
    10
}
fn default_probe_timeout_ms() -> u64 {
    1
}
fn default_stop_grace_ms() -> u64 {
    3000
}
fn default_stop_on_exit() -> bool {
    true
}
fn default_capacity() -> usize {
    100
}
fn default_enqueue_timeout_ms() -> u64 {
    1
}
fn default_log_level() -> String {
    "info".to_string()
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
        }
    }
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            base_dir: default_base_dir(),
            ssh_exec: default_ssh_exec(),
            tunnel_file: default_tunnel_file(),
            reconcile_interval_secs: default_reconcile_interval_secs(),
            probe_timeout_ms: default_probe_timeout_ms(),
            stop_grace_ms: default_stop_grace_ms(),
            stop_on_exit: default_stop_on_exit(),
            unmanaged_alive: UnmanagedAlivePolicy::default(),
        }
    }
}

impl Default for NotificationConfig {
    fn default() -> Self {
        Self {
            capacity: default_capacity(),
            enqueue_timeout_ms: default_enqueue_timeout_ms(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl SupervisorConfig {
    /// Bookkeeping root with `~` expanded.
    pub fn base_dir(&self) -> PathBuf {
        expand_home(&self.base_dir)
    }

    /// Tunnel list path with `~` expanded.
    pub fn tunnel_file(&self) -> PathBuf {
        expand_home(&self.tunnel_file)
    }

    /// A zero interval would spin; clamp to one second.
    pub fn reconcile_interval(&self) -> Duration {
        Duration::from_secs(self.reconcile_interval_secs.max(1))
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms.max(1))
    }

    pub fn stop_grace(&self) -> Duration {
        Duration::from_millis(self.stop_grace_ms)
    }
}

impl NotificationConfig {
    pub fn enqueue_timeout(&self) -> Duration {
        Duration::from_millis(self.enqueue_timeout_ms)
    }
}

/// Failure to load the configuration file.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file {}: {source}", .path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config file {}: {source}", .path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
}

impl Config {
    /// Load configuration with the precedence chain: env vars > file > defaults.
    ///
    /// If `path` is `Some`, that file must exist and parse. Otherwise looks
    /// for `fwdctl.toml` in the current directory, falling back to compiled
    /// defaults.
    pub fn load(path: Option<&str>) -> Result<Self, ConfigError> {
        let mut config = if let Some(p) = path {
            Self::from_file(Path::new(p))?
        } else if Path::new(DEFAULT_CONFIG_FILE).exists() {
            Self::from_file(Path::new(DEFAULT_CONFIG_FILE))?
        } else {
            Config::default()
        };

        config.apply_env(|name| std::env::var(name).ok());
        Ok(config)
    }

    fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        toml::from_str(&content).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    fn apply_env(&mut self, var: impl Fn(&str) -> Option<String>) {
        if let Some(listen) = var("FWDCTL_LISTEN") {
            self.server.listen = listen;
        }
        if let Some(dir) = var("FWDCTL_BASE_DIR") {
            self.supervisor.base_dir = dir;
        }
        if let Some(exec) = var("FWDCTL_SSH") {
            self.supervisor.ssh_exec = exec;
        }
        if let Some(file) = var("FWDCTL_TUNNEL_FILE") {
            self.supervisor.tunnel_file = file;
        }
    }
}
