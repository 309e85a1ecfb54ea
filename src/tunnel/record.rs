//! The tunnel record: one forwarding intent plus its observed runtime state.
//!
//! [`TunnelConfig`] is the user-supplied, immutable part (also the on-disk
//! shape in the tunnel file and bookkeeping entries). [`Tunnel`] wraps it with
//! the supervisor-owned runtime state: the child process handle, its pid and
//! the derived bookkeeping paths.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tokio::process::Child;
use uuid::Uuid;

use super::probe::{self, Prober};
use crate::error::TunnelError;

/// Program name used in the display form of the forwarding command.
const DISPLAY_PROGRAM: &str = "ssh";

/// Max length of a tunnel id (it becomes a file name).
const MAX_ID_LEN: usize = 64;

/// User-supplied tunnel definition.
///
/// Field names follow the tunnel file's JSON keys (`defaultUrl`, `userName`,
/// `localPort`, ...). Missing fields deserialize to empty/zero and are caught
/// by [`TunnelConfig::validate`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TunnelConfig {
    /// Opaque unique id. Generated on add when empty.
    #[serde(default)]
    pub id: String,
    /// Display name.
    #[serde(default)]
    pub name: String,
    /// Path to open in a browser once the forward is up (e.g. `/admin`).
    #[serde(default)]
    pub default_url: String,
    /// Remote SSH host.
    #[serde(default)]
    pub host: String,
    /// Remote login name. Empty is treated as absent.
    #[serde(default, rename = "userName", skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    /// Local port the forward listens on.
    #[serde(default)]
    pub local_port: u16,
    /// Port on the remote side (relative to the remote host's `localhost`).
    #[serde(default)]
    pub remote_port: u16,
}

impl TunnelConfig {
    /// Check required fields and reject values that would be unsafe as file
    /// names or command-line arguments.
    pub fn validate(&self) -> Result<(), TunnelError> {
        if self.name.trim().is_empty() {
            return Err(TunnelError::Validation("name is required".into()));
        }
        if self.host.is_empty() {
            return Err(TunnelError::Validation("host is required".into()));
        }
        if !is_plain_token(&self.host) || self.host.contains('@') {
            return Err(TunnelError::Validation(format!(
                "host '{}' is malformed",
                self.host
            )));
        }
        if let Some(user) = self.user() {
            if !is_plain_token(user) || user.contains('@') {
                return Err(TunnelError::Validation(format!(
                    "user name '{user}' is malformed"
                )));
            }
        }
        if self.local_port == 0 {
            return Err(TunnelError::Validation("local port is required".into()));
        }
        if self.remote_port == 0 {
            return Err(TunnelError::Validation("remote port is required".into()));
        }
        if !self.id.is_empty() && !is_valid_id(&self.id) {
            return Err(TunnelError::Validation(format!(
                "id '{}' may only contain letters, digits, '-' and '_'",
                self.id
            )));
        }
        Ok(())
    }

    /// The remote login name, if one is set.
    pub fn user(&self) -> Option<&str> {
        self.username.as_deref().filter(|u| !u.is_empty())
    }

    /// `host` or `user@host`.
    pub fn destination(&self) -> String {
        match self.user() {
            Some(user) => format!("{user}@{}", self.host),
            None => self.host.clone(),
        }
    }

    /// Argument vector passed to the forwarding executable.
    pub fn args(&self) -> Vec<String> {
        vec![
            "-N".to_string(),
            "-L".to_string(),
            format!("{}:localhost:{}", self.local_port, self.remote_port),
            self.destination(),
        ]
    }

    /// Human-readable forwarding command, e.g.
    /// `ssh -N -L 8080:localhost:80 deploy@example.com`.
    pub fn command(&self) -> String {
        let mut out = String::from(DISPLAY_PROGRAM);
        for arg in self.args() {
            out.push(' ');
            out.push_str(&arg);
        }
        out
    }
}

/// Generate a fresh tunnel id (32 lowercase hex chars).
pub fn new_id() -> String {
    Uuid::new_v4().simple().to_string()
}

/// Ids become bookkeeping file names, so keep them to a safe alphabet.
pub fn is_valid_id(id: &str) -> bool {
    !id.is_empty()
        && id.len() <= MAX_ID_LEN
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
}

/// Non-empty, no whitespace, and cannot be mistaken for an option.
fn is_plain_token(s: &str) -> bool {
    !s.is_empty() && !s.starts_with('-') && !s.chars().any(char::is_whitespace)
}

/// A managed tunnel: configuration plus the process it owns.
///
/// The child handle is owned exclusively by the record that launched it;
/// killing it through [`crate::tunnel::Launcher`] is the only way the OS
/// process is released.
#[derive(Debug)]
pub struct Tunnel {
    config: TunnelConfig,
    process: Option<Child>,
    pid: Option<u32>,
    log_path: Option<PathBuf>,
    /// Set when the registry has dropped this record; a retired record is
    /// never relaunched.
    retired: bool,
}

impl Tunnel {
    pub fn new(config: TunnelConfig) -> Self {
        Self {
            config,
            process: None,
            pid: None,
            log_path: None,
            retired: false,
        }
    }

    pub fn id(&self) -> &str {
        &self.config.id
    }

    pub fn config(&self) -> &TunnelConfig {
        &self.config
    }

    pub fn command(&self) -> String {
        self.config.command()
    }

    /// Pid of the owned process, if one was launched and not yet stopped.
    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub fn log_path(&self) -> Option<&Path> {
        self.log_path.as_deref()
    }

    pub fn has_process(&self) -> bool {
        self.process.is_some()
    }

    pub(crate) fn attach(&mut self, child: Child, log_path: PathBuf) {
        self.pid = child.id();
        self.process = Some(child);
        self.log_path = Some(log_path);
    }

    pub(crate) fn take_process(&mut self) -> Option<Child> {
        self.pid = None;
        self.process.take()
    }

    pub(crate) fn retire(&mut self) {
        self.retired = true;
    }

    pub(crate) fn is_retired(&self) -> bool {
        self.retired
    }

    /// Composite liveness: the local port must be bound *and* the owned
    /// process must still exist. Any disagreement counts as dead.
    pub async fn is_alive(&mut self, prober: &Prober) -> bool {
        if !prober.port_in_use(self.config.local_port).await {
            return false;
        }
        match self.process.as_mut() {
            Some(child) => probe::process_alive(child),
            None => false,
        }
    }
}
