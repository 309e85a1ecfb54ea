//! The supervisor's in-memory set of managed tunnels.
//!
//! [`TunnelRegistry`] is the single authority for which tunnels the supervisor
//! intends to keep running. It is cloneable; all clones share the same map.
//!
//! ## Concurrency
//!
//! The map is behind an `RwLock` that is only held for map access itself,
//! never across a process spawn, kill or file write. Each record sits behind
//! its own `Mutex`, which serializes lifecycle operations on *one* tunnel
//! (a request-driven remove vs. a reconciler restart) without blocking the
//! others:
//!
//! - `add` claims the id first: it inserts a locked, not yet launched
//!   record, launches while holding only that record's lock, and takes the
//!   record out again if the launch fails. A reconcile cycle that finds the
//!   new bookkeeping entry therefore sees a managed id and waits for the
//!   launch instead of collecting the entry. A second add of the same id
//!   fails before it spawns anything.
//! - `remove` takes the record out of the map first, then locks it, marks it
//!   retired and stops it. A reconciler restart that already holds the record
//!   runs first and its process is killed by the stop; one that comes later
//!   sees the retired flag and does nothing.

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::{Mutex, OwnedMutexGuard, RwLock};
use tracing::{info, warn};

use super::launcher::Launcher;
use super::record::{new_id, Tunnel, TunnelConfig};
use crate::error::TunnelError;
use crate::notify::Notifier;

/// Snapshot of one managed tunnel for rendering.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TunnelStatus {
    #[serde(flatten)]
    pub config: TunnelConfig,
    pub command: String,
    pub pid: Option<u32>,
    pub alive: bool,
    pub log_path: Option<PathBuf>,
}

/// Outcome of loading a batch of tunnel definitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ReloadSummary {
    pub loaded: usize,
    pub total: usize,
}

type Record = Arc<Mutex<Tunnel>>;

#[derive(Clone)]
pub struct TunnelRegistry {
    tunnels: Arc<RwLock<HashMap<String, Record>>>,
    launcher: Arc<Launcher>,
    notifier: Notifier,
}

impl TunnelRegistry {
    pub fn new(launcher: Arc<Launcher>, notifier: Notifier) -> Self {
        Self {
            tunnels: Arc::new(RwLock::new(HashMap::new())),
            launcher,
            notifier,
        }
    }

    pub fn launcher(&self) -> &Arc<Launcher> {
        &self.launcher
    }

    pub fn notifier(&self) -> &Notifier {
        &self.notifier
    }

    /// Validate, assign an id if missing, launch, then start managing.
    ///
    /// Returns the tunnel id. On any failure the tunnel is not managed.
    pub async fn add(&self, mut config: TunnelConfig) -> Result<String, TunnelError> {
        config.validate()?;
        if config.id.is_empty() {
            config.id = new_id();
        }
        let id = config.id.clone();

        let (record, mut tunnel) = self.reserve(config).await?;
        if let Err(e) = self.launcher.launch(&mut tunnel).await {
            tunnel.retire();
            drop(tunnel);
            self.release(&id, &record).await;
            return Err(e);
        }
        drop(tunnel);
        info!("Tunnel {id} added, managed: {}", self.len().await);
        Ok(id)
    }

    /// Insert a locked, unlaunched record for `config`. The id counts as
    /// managed from here on; everyone else waits on the returned guard.
    async fn reserve(
        &self,
        config: TunnelConfig,
    ) -> Result<(Record, OwnedMutexGuard<Tunnel>), TunnelError> {
        let id = config.id.clone();
        let record = Arc::new(Mutex::new(Tunnel::new(config)));
        let guard = Arc::clone(&record).lock_owned().await;

        let mut tunnels = self.tunnels.write().await;
        if tunnels.contains_key(&id) {
            return Err(already_managed(&id));
        }
        tunnels.insert(id, Arc::clone(&record));
        Ok((record, guard))
    }

    /// Undo a reservation, unless a concurrent remove already took it.
    async fn release(&self, id: &str, record: &Record) {
        let mut tunnels = self.tunnels.write().await;
        if tunnels.get(id).is_some_and(|r| Arc::ptr_eq(r, record)) {
            tunnels.remove(id);
        }
    }

    /// Stop a managed tunnel and forget it.
    ///
    /// Fails only if the id is unknown. A failure to kill the process is
    /// logged and notified; the tunnel is unmanaged regardless and the
    /// reconciler deals with whatever is left.
    pub async fn remove(&self, id: &str) -> Result<(), TunnelError> {
        let record = self
            .tunnels
            .write()
            .await
            .remove(id)
            .ok_or_else(|| TunnelError::NotFound(id.to_string()))?;

        let mut tunnel = record.lock().await;
        tunnel.retire();
        if let Err(e) = self.launcher.stop(&mut tunnel).await {
            warn!("Tunnel {id}: {e}");
            self.notifier
                .push(format!(
                    "Failed to kill tunnel {id} ('{}'): {e}",
                    tunnel.config().name
                ))
                .await;
        }
        info!("Tunnel {id} removed");
        Ok(())
    }

    /// Ids the supervisor currently intends to keep running.
    pub async fn managed_ids(&self) -> HashSet<String> {
        self.tunnels.read().await.keys().cloned().collect()
    }

    pub async fn is_managed(&self, id: &str) -> bool {
        self.tunnels.read().await.contains_key(id)
    }

    pub async fn len(&self) -> usize {
        self.tunnels.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.tunnels.read().await.is_empty()
    }

    /// Remove every managed tunnel, one at a time.
    pub async fn kill_all(&self) {
        let ids: Vec<String> = self.managed_ids().await.into_iter().collect();
        if ids.is_empty() {
            return;
        }
        let count = ids.len();
        for id in ids {
            // NotFound here means a concurrent remove beat us to it.
            let _ = self.remove(&id).await;
        }
        info!("Stopped {count} tunnel(s)");
    }

    /// Status of every managed tunnel, sorted by name then id.
    pub async fn list_live(&self) -> Vec<TunnelStatus> {
        let records: Vec<Record> = self.tunnels.read().await.values().cloned().collect();
        let mut out = Vec::with_capacity(records.len());
        for record in records {
            let mut tunnel = record.lock().await;
            out.push(self.snapshot(&mut tunnel).await);
        }
        out.sort_by(|a, b| {
            a.config
                .name
                .cmp(&b.config.name)
                .then_with(|| a.config.id.cmp(&b.config.id))
        });
        out
    }

    pub async fn status(&self, id: &str) -> Result<TunnelStatus, TunnelError> {
        let record = self.record(id).await?;
        let mut tunnel = record.lock().await;
        Ok(self.snapshot(&mut tunnel).await)
    }

    /// Display form of the forwarding command for `id`.
    pub async fn command(&self, id: &str) -> Result<String, TunnelError> {
        let record = self.record(id).await?;
        let tunnel = record.lock().await;
        Ok(tunnel.command())
    }

    /// Log file path for `id`.
    pub async fn log_path(&self, id: &str) -> Result<PathBuf, TunnelError> {
        let record = self.record(id).await?;
        let tunnel = record.lock().await;
        Ok(tunnel
            .log_path()
            .map_or_else(|| self.launcher.store().log_path(id), PathBuf::from))
    }

    /// Configurations of all managed tunnels, sorted by name then id.
    pub async fn configs(&self) -> Vec<TunnelConfig> {
        let records: Vec<Record> = self.tunnels.read().await.values().cloned().collect();
        let mut out = Vec::with_capacity(records.len());
        for record in records {
            out.push(record.lock().await.config().clone());
        }
        out.sort_by(|a, b| a.name.cmp(&b.name).then_with(|| a.id.cmp(&b.id)));
        out
    }

    /// Replace everything with `configs`: kill all, then add each in order.
    ///
    /// Partial success is expected; every failure is logged and notified
    /// and the summary counts what made it.
    pub async fn reload(&self, configs: Vec<TunnelConfig>, source: &str) -> ReloadSummary {
        warn!("Killing all active tunnels before loading from {source}");
        self.kill_all().await;

        let total = configs.len();
        let mut loaded = 0;
        for config in configs {
            let label = if config.id.is_empty() {
                config.name.clone()
            } else {
                config.id.clone()
            };
            match self.add(config).await {
                Ok(_) => loaded += 1,
                Err(e) => {
                    warn!("Failed to add tunnel '{label}' from {source}: {e}");
                    self.notifier
                        .push(format!("Failed to add tunnel '{label}' from file: {e}"))
                        .await;
                }
            }
        }

        info!("Loaded {loaded} of {total} tunnels from {source}");
        self.notifier
            .push(format!(
                "Finished loading {loaded} of {total} tunnels from file: {source}"
            ))
            .await;
        ReloadSummary { loaded, total }
    }

    /// Restart a single tunnel from `config`: stop it if managed, then add.
    pub async fn reload_one(&self, config: TunnelConfig) -> Result<String, TunnelError> {
        match self.remove(&config.id).await {
            Ok(()) | Err(TunnelError::NotFound(_)) => {}
            Err(e) => return Err(e),
        }
        self.add(config).await
    }

    /// Liveness of a managed tunnel. `None` if it is not (or no longer)
    /// managed.
    pub(crate) async fn probe(&self, id: &str) -> Option<bool> {
        let record = self.record(id).await.ok()?;
        let mut tunnel = record.lock().await;
        if tunnel.is_retired() {
            return None;
        }
        Some(tunnel.is_alive(self.launcher.prober()).await)
    }

    /// Relaunch a managed tunnel in place (same id, new process).
    ///
    /// `Ok(None)` if the tunnel stopped being managed before the restart
    /// could run.
    pub(crate) async fn restart(&self, id: &str) -> Result<Option<u32>, TunnelError> {
        let Ok(record) = self.record(id).await else {
            return Ok(None);
        };
        let mut tunnel = record.lock().await;
        if tunnel.is_retired() {
            return Ok(None);
        }
        self.launcher.launch(&mut tunnel).await.map(Some)
    }

    async fn record(&self, id: &str) -> Result<Record, TunnelError> {
        self.tunnels
            .read()
            .await
            .get(id)
            .cloned()
            .ok_or_else(|| TunnelError::NotFound(id.to_string()))
    }

    async fn snapshot(&self, tunnel: &mut Tunnel) -> TunnelStatus {
        let alive = tunnel.is_alive(self.launcher.prober()).await;
        TunnelStatus {
            config: tunnel.config().clone(),
            command: tunnel.command(),
            pid: tunnel.pid(),
            alive,
            log_path: tunnel.log_path().map(PathBuf::from),
        }
    }
}

fn already_managed(id: &str) -> TunnelError {
    TunnelError::Validation(format!("tunnel {id} is already managed"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{free_port, launcher, notifier, sample_config};
    use crate::tunnel::probe::pid_alive;
    use crate::tunnel::{Reconciler, UnmanagedAlivePolicy};
    use futures::StreamExt;
    use std::time::Duration;

    async fn registry(base: &std::path::Path) -> TunnelRegistry {
        TunnelRegistry::new(Arc::new(launcher(base).await), notifier())
    }

    async fn entry_count(registry: &TunnelRegistry) -> usize {
        registry
            .launcher()
            .store()
            .entries()
            .await
            .unwrap()
            .count()
            .await
    }

    #[tokio::test]
    async fn test_add_assigns_id_and_manages() {
        let dir = tempfile::tempdir().unwrap();
        let registry = registry(dir.path()).await;
        let id = registry.add(sample_config("web", free_port())).await.unwrap();

        assert_eq!(id.len(), 32);
        assert!(registry.is_managed(&id).await);
        assert_eq!(registry.managed_ids().await, HashSet::from([id.clone()]));
        assert_eq!(entry_count(&registry).await, 1);
        assert!(registry.command(&id).await.unwrap().starts_with("ssh -N -L "));
        assert_eq!(
            registry.log_path(&id).await.unwrap(),
            registry.launcher().store().log_path(&id)
        );

        registry.kill_all().await;
    }

    #[tokio::test]
    async fn test_add_keeps_given_id() {
        let dir = tempfile::tempdir().unwrap();
        let registry = registry(dir.path()).await;
        let mut config = sample_config("web", free_port());
        config.id = "web-1".into();
        assert_eq!(registry.add(config.clone()).await.unwrap(), "web-1");

        config.local_port = free_port();
        let err = registry.add(config).await.unwrap_err();
        assert!(matches!(err, TunnelError::Validation(_)));
        assert_eq!(registry.len().await, 1);

        registry.kill_all().await;
    }

    #[tokio::test]
    async fn test_invalid_config_launches_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let registry = registry(dir.path()).await;
        let mut config = sample_config("web", free_port());
        config.host = String::new();

        let err = registry.add(config).await.unwrap_err();
        assert!(matches!(err, TunnelError::Validation(_)));
        assert!(registry.is_empty().await);
        assert_eq!(entry_count(&registry).await, 0);
    }

    #[tokio::test]
    async fn test_alive_once_port_is_bound() {
        let dir = tempfile::tempdir().unwrap();
        let registry = registry(dir.path()).await;
        let port = free_port();
        let id = registry.add(sample_config("web", port)).await.unwrap();
        assert!(!registry.status(&id).await.unwrap().alive);

        // Stand in for the forward coming up.
        let _forward = std::net::TcpListener::bind(("127.0.0.1", port)).unwrap();
        let mut alive = false;
        for _ in 0..20 {
            if registry.status(&id).await.unwrap().alive {
                alive = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        assert!(alive);

        registry.kill_all().await;
    }

    #[tokio::test]
    async fn test_second_tunnel_on_same_port_conflicts() {
        let dir = tempfile::tempdir().unwrap();
        let registry = registry(dir.path()).await;
        let port = free_port();
        let first = registry.add(sample_config("first", port)).await.unwrap();
        let _forward = std::net::TcpListener::bind(("127.0.0.1", port)).unwrap();

        let err = registry.add(sample_config("second", port)).await.unwrap_err();
        assert!(matches!(err, TunnelError::PortConflict { port: p } if p == port));
        assert_eq!(registry.managed_ids().await, HashSet::from([first.clone()]));
        assert_eq!(entry_count(&registry).await, 1);
        assert!(registry.status(&first).await.unwrap().pid.is_some());

        registry.kill_all().await;
    }

    #[tokio::test]
    async fn test_remove_unknown_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let registry = registry(dir.path()).await;
        let id = registry.add(sample_config("web", free_port())).await.unwrap();

        let err = registry.remove("missing").await.unwrap_err();
        assert!(matches!(err, TunnelError::NotFound(_)));
        assert_eq!(entry_count(&registry).await, 1);
        assert!(registry.is_managed(&id).await);

        registry.kill_all().await;
    }

    #[tokio::test]
    async fn test_remove_stops_and_forgets() {
        let dir = tempfile::tempdir().unwrap();
        let registry = registry(dir.path()).await;
        let id = registry.add(sample_config("web", free_port())).await.unwrap();
        let pid = registry.status(&id).await.unwrap().pid.unwrap();

        registry.remove(&id).await.unwrap();
        assert!(!registry.is_managed(&id).await);
        assert_eq!(entry_count(&registry).await, 0);
        assert!(!pid_alive(pid));
        assert!(matches!(
            registry.remove(&id).await,
            Err(TunnelError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_restart_after_remove_is_suppressed() {
        let dir = tempfile::tempdir().unwrap();
        let registry = registry(dir.path()).await;
        let id = registry.add(sample_config("web", free_port())).await.unwrap();
        registry.remove(&id).await.unwrap();

        assert_eq!(registry.restart(&id).await.unwrap(), None);
        assert_eq!(registry.probe(&id).await, None);
        assert_eq!(entry_count(&registry).await, 0);
    }

    #[tokio::test]
    async fn test_concurrent_adds_of_one_id_launch_once() {
        let dir = tempfile::tempdir().unwrap();
        let registry = registry(dir.path()).await;
        let mut first = sample_config("web", free_port());
        first.id = "web".into();
        let mut second = first.clone();
        second.local_port = free_port();

        let (a, b) = tokio::join!(registry.add(first), registry.add(second));
        let results = [a, b];
        let failures: Vec<&TunnelError> = results.iter().filter_map(|r| r.as_ref().err()).collect();
        assert_eq!(failures.len(), 1);
        assert!(matches!(failures[0], TunnelError::Validation(_)));

        let status = registry.status("web").await.unwrap();
        let entry = registry.launcher().store().read("web").await.unwrap().unwrap();
        assert_eq!(status.pid, Some(entry.pid));
        assert_eq!(entry.config.local_port, status.config.local_port);
        assert_eq!(registry.len().await, 1);

        registry.kill_all().await;
    }

    #[tokio::test]
    async fn test_reconcile_waits_for_add_in_progress() {
        let dir = tempfile::tempdir().unwrap();
        let registry = registry(dir.path()).await;
        let reconciler = Reconciler::new(
            registry.clone(),
            Duration::from_secs(10),
            UnmanagedAlivePolicy::Leave,
        );
        let mut config = sample_config("web", free_port());
        config.id = "web".into();

        // The first half of an add: entry and log are on disk, the record
        // is still locked.
        let (_record, mut tunnel) = registry.reserve(config).await.unwrap();
        registry.launcher().launch(&mut tunnel).await.unwrap();
        let (report, ()) = tokio::join!(reconciler.reconcile_once(), async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            drop(tunnel);
        });
        let report = report.unwrap();

        let store = registry.launcher().store();
        assert_eq!(report.collected, 0);
        assert_eq!(report.logs_removed, 0);
        assert!(registry.is_managed("web").await);
        assert!(store.log_path("web").exists());
        let entry = store.read("web").await.unwrap().unwrap();
        assert_eq!(registry.status("web").await.unwrap().pid, Some(entry.pid));
        assert!(pid_alive(entry.pid));

        registry.kill_all().await;
    }

    #[tokio::test]
    async fn test_failed_add_gives_the_id_back() {
        let dir = tempfile::tempdir().unwrap();
        let registry = registry(dir.path()).await;
        let port = free_port();
        let _taken = std::net::TcpListener::bind(("127.0.0.1", port)).unwrap();
        let mut config = sample_config("web", port);
        config.id = "web".into();

        let err = registry.add(config.clone()).await.unwrap_err();
        assert!(matches!(err, TunnelError::PortConflict { .. }));
        assert!(!registry.is_managed("web").await);

        config.local_port = free_port();
        assert_eq!(registry.add(config).await.unwrap(), "web");

        registry.kill_all().await;
    }

    #[tokio::test]
    async fn test_remove_racing_reconcile_leaves_nothing_running() {
        let dir = tempfile::tempdir().unwrap();
        let registry = registry(dir.path()).await;
        let reconciler = Reconciler::new(
            registry.clone(),
            Duration::from_secs(10),
            UnmanagedAlivePolicy::Leave,
        );
        let id = registry.add(sample_config("web", free_port())).await.unwrap();
        let old_pid = registry.status(&id).await.unwrap().pid.unwrap();

        // Queue a reconcile cycle and then a remove behind the record lock,
        // so the cycle sees the tunnel dead before the remove retires it.
        let record = registry.record(&id).await.unwrap();
        let held = record.lock().await;
        let cycle = tokio::spawn(async move { reconciler.reconcile_once().await });
        tokio::time::sleep(Duration::from_millis(50)).await;
        let removing = tokio::spawn({
            let registry = registry.clone();
            let id = id.clone();
            async move { registry.remove(&id).await }
        });
        tokio::time::sleep(Duration::from_millis(50)).await;
        drop(held);

        let report = cycle.await.unwrap().unwrap();
        removing.await.unwrap().unwrap();
        assert_eq!(report.restarted, 0);
        assert!(!registry.is_managed(&id).await);
        assert!(registry.list_live().await.is_empty());
        assert!(registry.launcher().store().read(&id).await.unwrap().is_none());
        assert!(!pid_alive(old_pid));
    }

    #[tokio::test]
    async fn test_remove_after_queued_restart_kills_new_process() {
        let dir = tempfile::tempdir().unwrap();
        let registry = registry(dir.path()).await;
        let id = registry.add(sample_config("web", free_port())).await.unwrap();
        let old_pid = registry.status(&id).await.unwrap().pid.unwrap();

        let record = registry.record(&id).await.unwrap();
        let held = record.lock().await;
        let restarting = tokio::spawn({
            let registry = registry.clone();
            let id = id.clone();
            async move { registry.restart(&id).await }
        });
        tokio::time::sleep(Duration::from_millis(50)).await;
        let removing = tokio::spawn({
            let registry = registry.clone();
            let id = id.clone();
            async move { registry.remove(&id).await }
        });
        tokio::time::sleep(Duration::from_millis(50)).await;
        drop(held);

        let restarted = restarting.await.unwrap().unwrap();
        removing.await.unwrap().unwrap();
        assert!(!pid_alive(old_pid));
        if let Some(pid) = restarted {
            assert_ne!(pid, old_pid);
            assert!(!pid_alive(pid));
        }
        assert!(!registry.is_managed(&id).await);
        assert!(registry.launcher().store().read(&id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_reload_counts_partial_success() {
        let dir = tempfile::tempdir().unwrap();
        let registry = registry(dir.path()).await;
        let old = registry.add(sample_config("old", free_port())).await.unwrap();

        let mut broken = sample_config("broken", free_port());
        broken.remote_port = 0;
        let configs = vec![
            sample_config("a", free_port()),
            broken,
            sample_config("b", free_port()),
        ];
        let summary = registry.reload(configs, "tunnels.json").await;

        assert_eq!(summary, ReloadSummary { loaded: 2, total: 3 });
        assert!(!registry.is_managed(&old).await);
        assert_eq!(registry.len().await, 2);
        assert_eq!(entry_count(&registry).await, 2);

        let messages: Vec<String> = registry
            .notifier()
            .drain()
            .await
            .into_iter()
            .map(|n| n.message)
            .collect();
        assert!(messages.iter().any(|m| m.contains("broken")));
        assert!(messages
            .iter()
            .any(|m| m == "Finished loading 2 of 3 tunnels from file: tunnels.json"));

        registry.kill_all().await;
    }

    #[tokio::test]
    async fn test_reload_one_replaces_process() {
        let dir = tempfile::tempdir().unwrap();
        let registry = registry(dir.path()).await;
        let mut config = sample_config("web", free_port());
        config.id = "web".into();
        registry.add(config.clone()).await.unwrap();
        let before = registry.status("web").await.unwrap().pid;

        registry.reload_one(config).await.unwrap();
        let after = registry.status("web").await.unwrap().pid;
        assert_ne!(before, after);
        assert_eq!(registry.len().await, 1);

        registry.kill_all().await;
        assert!(registry.is_empty().await);
        assert_eq!(entry_count(&registry).await, 0);
    }

    #[tokio::test]
    async fn test_list_and_configs_sorted() {
        let dir = tempfile::tempdir().unwrap();
        let registry = registry(dir.path()).await;
        registry.add(sample_config("zeta", free_port())).await.unwrap();
        registry.add(sample_config("alpha", free_port())).await.unwrap();

        let names: Vec<String> = registry
            .list_live()
            .await
            .into_iter()
            .map(|s| s.config.name)
            .collect();
        assert_eq!(names, vec!["alpha", "zeta"]);
        let names: Vec<String> = registry.configs().await.into_iter().map(|c| c.name).collect();
        assert_eq!(names, vec!["alpha", "zeta"]);

        registry.kill_all().await;
    }
}
