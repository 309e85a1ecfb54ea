#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::doc_markdown)]
#![allow(clippy::too_many_lines)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::unused_async)]
#![allow(clippy::implicit_hasher)]
#![allow(clippy::redundant_closure_for_method_calls)]

//! fwdctl library: the tunnel supervisor's building blocks.
//!
//! - `tunnel`: records, probes, bookkeeping, launcher, registry, reconciler
//! - `config`: configuration loading
//! - `notify`: bounded notification queue
//! - `routes`: REST API route handlers
//! - `error`: `TunnelError`

pub mod config;
pub mod error;
pub mod notify;
pub mod routes;
pub mod state;
pub mod tunnel;
pub mod util;

#[cfg(test)]
mod test_support;

// Re-export key types at crate root for convenience.
pub use config::{Config, ConfigError};
pub use error::TunnelError;
pub use notify::{Notification, Notifier};
pub use state::AppState;
pub use tunnel::{TunnelConfig, TunnelRegistry};
