#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

//! # fwdctl
//!
//! Supervisor for SSH local-forward tunnels.
//!
//! fwdctl launches one `ssh -N -L` process per configured tunnel, records it
//! on disk under `<base_dir>/proc`, and every few seconds reconciles what is
//! recorded against what is actually listening: dead managed tunnels are
//! restarted, dead unmanaged leftovers are cleaned up. A small JSON API on
//! localhost drives it.
//!
//! ## Subcommands
//!
//! - `fwdctl serve` (default): run the supervisor and HTTP API
//!
//! ## API surface
//!
//! | Method | Path                         | Description                         |
//! |--------|------------------------------|-------------------------------------|
//! | GET    | `/api/health`                | Liveness probe                      |
//! | GET    | `/api/tunnels`               | Managed tunnels with liveness       |
//! | POST   | `/api/tunnels`               | Add and launch a tunnel             |
//! | DELETE | `/api/tunnels/{id}`          | Stop and forget a tunnel            |
//! | GET    | `/api/tunnels/{id}/command`  | Forwarding command line             |
//! | GET    | `/api/tunnels/{id}/logs`     | Forwarder output                    |
//! | GET    | `/api/tunnels/{id}/status`   | Liveness of one tunnel              |
//! | POST   | `/api/tunnels/{id}/reload`   | Restart one tunnel from the file    |
//! | POST   | `/api/reload`                | Replace all tunnels from the file   |
//! | POST   | `/api/save`                  | Write managed tunnels to the file   |
//! | GET    | `/api/messages`              | Drain status messages               |
//!
//! ## Architecture
//!
//! ```text
//! main.rs          entry point, clap subcommands, startup, graceful shutdown
//! config.rs        TOML + env-var configuration
//! error.rs         TunnelError
//! notify.rs        bounded notification queue
//! routes/          JSON handlers
//! tunnel/
//!   record.rs      TunnelConfig, Tunnel, command building, liveness
//!   probe.rs       port and pid probes
//!   bookkeeping.rs proc/<id>.pid entries, log/<id>.log files
//!   launcher.rs    spawn, SIGTERM/SIGKILL stop
//!   registry.rs    managed tunnel map
//!   reconcile.rs   periodic restart / garbage collection
//!   tunnel_file.rs user-authored tunnel list
//! ```

use std::sync::Arc;

use clap::{Parser, Subcommand};
use tokio::net::TcpListener;
use tracing::{error, info, warn};

use fwdctl::config::Config;
use fwdctl::notify::Notifier;
use fwdctl::tunnel::{
    tunnel_file, Bookkeeping, Launcher, Prober, Reconciler, TunnelRegistry,
};
use fwdctl::{routes, AppState};

#[derive(Parser)]
#[command(name = "fwdctl", version)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
    /// Config file (same as `serve --config`).
    #[arg(long, global = true)]
    config: Option<String>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the supervisor and HTTP API (default).
    Serve,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    match cli.command {
        Some(Commands::Serve) | None => run_server(cli.config.as_deref()).await,
    }
}

async fn run_server(config_path: Option<&str>) {
    let config = match Config::load(config_path) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("{e}");
            std::process::exit(1);
        }
    };

    let log_filter = std::env::var("RUST_LOG").unwrap_or_else(|_| config.logging.level.clone());
    tracing_subscriber::fmt().with_env_filter(log_filter).init();

    info!("fwdctl v{} starting", env!("CARGO_PKG_VERSION"));

    let base_dir = config.supervisor.base_dir();
    let store = match Bookkeeping::open(&base_dir).await {
        Ok(s) => s,
        Err(e) => {
            error!("Unable to create bookkeeping directories: {e}");
            std::process::exit(1);
        }
    };
    info!("Bookkeeping under {}", base_dir.display());

    let notifier = Notifier::new(
        config.notifications.capacity,
        config.notifications.enqueue_timeout(),
    );
    let launcher = Launcher::new(
        config.supervisor.ssh_exec.clone(),
        store,
        Prober::new(config.supervisor.probe_timeout()),
        config.supervisor.stop_grace(),
        notifier.clone(),
    );
    let registry = TunnelRegistry::new(Arc::new(launcher), notifier);
    let state = AppState::new(Arc::new(config), registry);

    if state.tunnel_file.exists() {
        match tunnel_file::load(&state.tunnel_file).await {
            Ok(configs) => {
                let source = state.tunnel_file.display().to_string();
                state.registry.reload(configs, &source).await;
            }
            Err(e) => {
                warn!("Skipping startup load: {e}");
                state
                    .notifier
                    .push(format!("Failed to parse tunnels from file: {e}"))
                    .await;
            }
        }
    } else {
        info!(
            "No tunnel file at {}, starting empty",
            state.tunnel_file.display()
        );
    }

    let supervisor = &state.config.supervisor;
    let reconcile_task = Reconciler::new(
        state.registry.clone(),
        supervisor.reconcile_interval(),
        supervisor.unmanaged_alive,
    )
    .spawn();
    info!(
        "Reconciling every {}s (unmanaged alive: {:?})",
        supervisor.reconcile_interval().as_secs(),
        supervisor.unmanaged_alive
    );

    let app = routes::router(state.clone());

    let listener = match TcpListener::bind(&state.config.server.listen).await {
        Ok(l) => l,
        Err(e) => {
            error!("Failed to bind {}: {e}", state.config.server.listen);
            state.registry.kill_all().await;
            std::process::exit(1);
        }
    };
    info!("Listening on {}", state.config.server.listen);

    // Graceful shutdown
    let shutdown = async {
        let ctrl_c = tokio::signal::ctrl_c();
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = ctrl_c => info!("Received SIGINT"),
                    _ = sigterm.recv() => info!("Received SIGTERM"),
                }
            }
            Err(e) => {
                warn!("Failed to register SIGTERM handler: {e}");
                let _ = ctrl_c.await;
                info!("Received SIGINT");
            }
        }
    };

    if let Err(e) = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await
    {
        error!("Server error: {e}");
    }

    // Cleanup
    info!("Shutting down...");
    reconcile_task.abort();
    if state.config.supervisor.stop_on_exit {
        state.registry.kill_all().await;
    } else {
        info!(
            "Leaving {} tunnel(s) running (stop_on_exit = false)",
            state.registry.len().await
        );
    }
    info!("Goodbye");
}
