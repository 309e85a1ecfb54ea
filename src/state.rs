//! Shared application state passed to every handler via Axum's `State` extractor.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use crate::config::Config;
use crate::notify::Notifier;
use crate::tunnel::TunnelRegistry;

/// Shared application state for the fwdctl server.
#[derive(Clone)]
pub struct AppState {
    /// Immutable configuration loaded at startup.
    pub config: Arc<Config>,
    /// Monotonic instant when the server started (for uptime calculation).
    pub start_time: Instant,
    /// The managed tunnels.
    pub registry: TunnelRegistry,
    /// Status messages for whoever renders them; drained by `GET /api/messages`.
    pub notifier: Notifier,
    /// Resolved path of the user-authored tunnel list.
    pub tunnel_file: PathBuf,
}

impl AppState {
    pub fn new(config: Arc<Config>, registry: TunnelRegistry) -> Self {
        let notifier = registry.notifier().clone();
        let tunnel_file = config.supervisor.tunnel_file();
        Self {
            config,
            start_time: Instant::now(),
            registry,
            notifier,
            tunnel_file,
        }
    }
}
