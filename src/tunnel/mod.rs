//! Supervision of SSH local-forward tunnels.
//!
//! - [`record`]: tunnel definition, forwarding command, composite liveness.
//! - [`probe`]: port and pid probes.
//! - [`bookkeeping`]: on-disk `<base>/proc/<id>.pid` entries and logs.
//! - [`launcher`]: spawning and stopping forwarding processes.
//! - [`registry`]: the in-memory set of managed tunnels.
//! - [`reconcile`]: periodic restart and garbage collection.
//! - [`tunnel_file`]: the user-authored tunnel list.

pub mod bookkeeping;
pub mod launcher;
pub mod probe;
pub mod reconcile;
pub mod record;
pub mod registry;
pub mod tunnel_file;

pub use bookkeeping::{Bookkeeping, BookkeepingEntry};
pub use launcher::Launcher;
pub use probe::Prober;
pub use reconcile::{ReconcileReport, Reconciler, UnmanagedAlivePolicy};
pub use record::{Tunnel, TunnelConfig};
pub use registry::{ReloadSummary, TunnelRegistry, TunnelStatus};
