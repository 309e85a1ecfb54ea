//! Error taxonomy for tunnel supervision.
//!
//! Every fallible supervisor operation returns [`TunnelError`]. The variants
//! are deliberately coarse: callers (the HTTP layer, the reconciler) only need
//! to decide how to surface a failure, not to recover from it in detail.

use std::path::PathBuf;

/// Failure of a tunnel operation.
#[derive(Debug, thiserror::Error)]
pub enum TunnelError {
    /// Bad or missing configuration. Nothing was launched or persisted.
    #[error("invalid tunnel: {0}")]
    Validation(String),

    /// The pre-flight probe found the local port already bound.
    #[error("local port {port} is already in use")]
    PortConflict { port: u16 },

    /// The OS refused to start the forwarding process.
    #[error("failed to launch {exec}: {source}")]
    Launch {
        exec: String,
        #[source]
        source: std::io::Error,
    },

    /// Bookkeeping, log or tunnel-file I/O failed.
    #[error("{context} ({}): {source}", .path.display())]
    Io {
        context: &'static str,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Signalling or reaping the forwarding process failed. The supervisor
    /// still treats the tunnel as stopped.
    #[error("failed to stop tunnel {id}: {source}")]
    Stop {
        id: String,
        #[source]
        source: std::io::Error,
    },

    /// No managed tunnel has this id.
    #[error("tunnel {0} not found")]
    NotFound(String),
}

impl TunnelError {
    pub(crate) fn io(context: &'static str, path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            context,
            path: path.into(),
            source,
        }
    }

    /// Stable machine-readable code used in API error bodies.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Validation(_) => "VALIDATION",
            Self::PortConflict { .. } => "PORT_CONFLICT",
            Self::Launch { .. } => "LAUNCH_FAILED",
            Self::Io { .. } => "IO_ERROR",
            Self::Stop { .. } => "STOP_FAILED",
            Self::NotFound(_) => "TUNNEL_NOT_FOUND",
        }
    }
}
