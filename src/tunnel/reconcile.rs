//! Periodic reconciliation of bookkeeping against live OS state.
//!
//! Every cycle walks the bookkeeping entries on disk and sorts each one by
//! two questions: is it alive (port bound and process present), and is its
//! id managed by the registry?
//!
//! | state               | action                                   |
//! |---------------------|------------------------------------------|
//! | alive, managed      | nothing                                  |
//! | alive, unmanaged    | [`UnmanagedAlivePolicy`]                 |
//! | dead, managed       | restart in place                         |
//! | dead, unmanaged     | delete the entry                         |
//!
//! Afterwards every log file whose tunnel is not running is deleted.
//! Failures are logged and notified, and the next cycle retries.

use std::collections::HashSet;
use std::time::Duration;

use futures::StreamExt;
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use super::bookkeeping::BookkeepingEntry;
use super::probe;
use super::registry::TunnelRegistry;
use crate::error::TunnelError;

/// What to do with a live process whose bookkeeping entry no managed tunnel
/// claims (typically left behind by a previous supervisor instance).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UnmanagedAlivePolicy {
    /// Leave it running and keep its entry and log.
    #[default]
    Leave,
    /// Kill it and delete its entry, but only if the pid still runs the
    /// forwarding executable.
    Terminate,
}

/// Counts from one reconciliation cycle.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReconcileReport {
    pub alive: usize,
    pub restarted: usize,
    pub restart_failed: usize,
    pub collected: usize,
    pub left_running: usize,
    pub terminated: usize,
    pub logs_removed: usize,
}

pub struct Reconciler {
    registry: TunnelRegistry,
    interval: Duration,
    policy: UnmanagedAlivePolicy,
}

impl Reconciler {
    pub fn new(registry: TunnelRegistry, interval: Duration, policy: UnmanagedAlivePolicy) -> Self {
        Self {
            registry,
            interval,
            policy,
        }
    }

    /// Run [`reconcile_once`](Self::reconcile_once) every interval until the
    /// returned handle is aborted. The first cycle runs one interval after
    /// start.
    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(async move {
            let start = tokio::time::Instant::now() + self.interval;
            let mut ticker = tokio::time::interval_at(start, self.interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                match self.reconcile_once().await {
                    Ok(report) => debug!("Reconcile cycle: {report:?}"),
                    Err(e) => error!("Reconcile cycle aborted: {e}"),
                }
            }
        })
    }

    /// One pass over the bookkeeping store.
    ///
    /// Only failing to list the entry directory is an error; everything
    /// per-entry is handled and counted.
    pub async fn reconcile_once(&self) -> Result<ReconcileReport, TunnelError> {
        let store = self.registry.launcher().store().clone();
        let mut report = ReconcileReport::default();
        let mut seen = HashSet::new();
        let mut running = HashSet::new();

        let mut entries = Box::pin(store.entries().await?);
        while let Some(entry) = entries.next().await {
            let id = entry.id().to_string();
            seen.insert(id.clone());
            if self.reconcile_entry(&entry, &mut report).await {
                running.insert(id);
            }
        }

        // Tunnels added after the scan started have logs but were not seen.
        for id in self.registry.managed_ids().await {
            if !seen.contains(&id) {
                running.insert(id);
            }
        }
        self.sweep_logs(&running, &mut report).await;
        Ok(report)
    }

    /// Returns whether the entry's tunnel counts as running for the log sweep.
    async fn reconcile_entry(&self, entry: &BookkeepingEntry, report: &mut ReconcileReport) -> bool {
        let id = entry.id();
        let name = &entry.config.name;

        match self.registry.probe(id).await {
            Some(true) => {
                report.alive += 1;
                return true;
            }
            Some(false) => return self.restart(entry, report).await,
            // Unmanaged, or removed since the scan began.
            None => {}
        }

        let launcher = self.registry.launcher();
        let alive = launcher.prober().port_in_use(entry.config.local_port).await
            && probe::pid_alive(entry.pid);

        if alive {
            return self.unmanaged_alive(entry, report).await;
        }

        // An add may have claimed this id since the probe above.
        if self.registry.is_managed(id).await {
            return true;
        }
        info!("Tunnel {id} ('{name}'): dead and unmanaged, cleaning up");
        if let Err(e) = launcher.store().remove(id).await {
            warn!("Tunnel {id}: {e}");
        }
        report.collected += 1;
        false
    }

    async fn restart(&self, entry: &BookkeepingEntry, report: &mut ReconcileReport) -> bool {
        let id = entry.id();
        let name = &entry.config.name;
        info!("Tunnel {id} ('{name}'): found dead, restarting");
        match self.registry.restart(id).await {
            Ok(Some(pid)) => {
                report.restarted += 1;
                self.registry
                    .notifier()
                    .push(format!("Restarted tunnel '{name}' (pid {pid})"))
                    .await;
                true
            }
            // Removed while we were looking at it; the remove owns cleanup.
            Ok(None) => false,
            Err(e) => {
                report.restart_failed += 1;
                warn!("Tunnel {id} ('{name}'): restart failed: {e}");
                self.registry
                    .notifier()
                    .push(format!("Failed to restart tunnel '{name}': {e}"))
                    .await;
                false
            }
        }
    }

    async fn unmanaged_alive(&self, entry: &BookkeepingEntry, report: &mut ReconcileReport) -> bool {
        let id = entry.id();
        let name = &entry.config.name;
        let launcher = self.registry.launcher();

        if self.policy == UnmanagedAlivePolicy::Leave {
            debug!("Tunnel {id} ('{name}'): alive but unmanaged, leaving pid {} alone", entry.pid);
            report.left_running += 1;
            return true;
        }
        if !probe::cmdline_matches(entry.pid, launcher.exec()) {
            warn!(
                "Tunnel {id} ('{name}'): pid {} no longer runs {}, leaving it alone",
                entry.pid,
                launcher.exec()
            );
            report.left_running += 1;
            return true;
        }

        info!("Tunnel {id} ('{name}'): alive but unmanaged, terminating pid {}", entry.pid);
        if let Err(e) = launcher.terminate_pid(id, entry.pid).await {
            warn!("Tunnel {id}: {e}");
            report.left_running += 1;
            return true;
        }
        if self.registry.is_managed(id).await {
            return true;
        }
        if let Err(e) = launcher.store().remove(id).await {
            warn!("Tunnel {id}: {e}");
        }
        report.terminated += 1;
        self.registry
            .notifier()
            .push(format!("Stopped unmanaged tunnel '{name}' (pid {})", entry.pid))
            .await;
        false
    }

    async fn sweep_logs(&self, running: &HashSet<String>, report: &mut ReconcileReport) {
        let store = self.registry.launcher().store();
        let logs = match store.log_files().await {
            Ok(logs) => logs,
            Err(e) => {
                error!("Log sweep skipped: {e}");
                return;
            }
        };
        for (id, path) in logs {
            if running.contains(&id) {
                continue;
            }
            info!("Removing log file for dead tunnel: {}", path.display());
            match store.remove_log(&id).await {
                Ok(()) => report.logs_removed += 1,
                Err(e) => warn!("{e}"),
            }
        }
    }
}
