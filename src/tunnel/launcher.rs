//! Starting and stopping forwarding processes.
//!
//! [`Launcher`] is the explicit context every lifecycle operation runs in:
//! the forwarding executable, the bookkeeping store, the liveness prober and
//! the stop grace period. It is built once at startup and shared.

use std::process::Stdio;
use std::time::Duration;

use nix::errno::Errno;
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use tokio::fs;
use tokio::process::{Child, Command};
use tracing::{debug, error, info, warn};

use super::bookkeeping::{Bookkeeping, BookkeepingEntry};
use super::probe::{self, Prober};
use super::record::Tunnel;
use crate::error::TunnelError;
use crate::notify::Notifier;

/// Poll interval while waiting for an unowned pid to exit.
const PID_POLL: Duration = Duration::from_millis(100);

pub struct Launcher {
    exec: String,
    store: Bookkeeping,
    prober: Prober,
    stop_grace: Duration,
    notifier: Notifier,
}

impl Launcher {
    pub fn new(
        exec: impl Into<String>,
        store: Bookkeeping,
        prober: Prober,
        stop_grace: Duration,
        notifier: Notifier,
    ) -> Self {
        Self {
            exec: exec.into(),
            store,
            prober,
            stop_grace,
            notifier,
        }
    }

    /// Path or name of the forwarding executable.
    pub fn exec(&self) -> &str {
        &self.exec
    }

    pub fn store(&self) -> &Bookkeeping {
        &self.store
    }

    pub fn prober(&self) -> &Prober {
        &self.prober
    }

    /// Start (or restart in place) the forwarding process for `tunnel`.
    ///
    /// A process the record already owns is terminated first. Its bookkeeping
    /// entry is left in place, so if the relaunch fails the entry still asks
    /// the reconciler to try again next cycle.
    ///
    /// A bookkeeping write failure after a successful spawn does not roll the
    /// launch back: the tunnel keeps running without an on-disk entry, which
    /// is logged and notified because a supervisor restart cannot recover it.
    pub async fn launch(&self, tunnel: &mut Tunnel) -> Result<u32, TunnelError> {
        if tunnel.has_process() {
            if let Err(e) = self.terminate(tunnel).await {
                warn!("Tunnel {}: failed to stop previous process: {e}", tunnel.id());
            }
        }

        let port = tunnel.config().local_port;
        if self.prober.port_in_use(port).await {
            return Err(TunnelError::PortConflict { port });
        }

        let id = tunnel.id().to_string();
        let log_path = self.store.log_path(&id);
        let stdout_log = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&log_path)
            .await
            .map_err(|e| TunnelError::io("open tunnel log", &log_path, e))?
            .into_std()
            .await;
        let stderr_log = stdout_log
            .try_clone()
            .map_err(|e| TunnelError::io("open tunnel log", &log_path, e))?;

        let child = Command::new(&self.exec)
            .args(tunnel.config().args())
            .stdin(Stdio::null())
            .stdout(Stdio::from(stdout_log))
            .stderr(Stdio::from(stderr_log))
            .process_group(0)
            .spawn()
            .map_err(|source| TunnelError::Launch {
                exec: self.exec.clone(),
                source,
            })?;

        let pid = child.id().unwrap_or(0);
        info!(
            "Tunnel {id} ('{}') launched, pid {pid}: {}",
            tunnel.config().name,
            tunnel.command()
        );
        tunnel.attach(child, log_path);

        let entry = BookkeepingEntry::new(tunnel.config().clone(), pid);
        if let Err(e) = self.store.write(&entry).await {
            error!("Tunnel {id} is running (pid {pid}) without a bookkeeping entry: {e}");
            self.notifier
                .push(format!(
                    "Tunnel '{}' is running but could not be recorded on disk; \
                     it will not be recovered after a supervisor restart",
                    tunnel.config().name
                ))
                .await;
        }
        Ok(pid)
    }

    /// Stop the owned process (if any) and delete the bookkeeping entry.
    ///
    /// The record is considered stopped even if signalling fails; the error
    /// is returned for reporting only. Calling this twice is a no-op the
    /// second time.
    pub async fn stop(&self, tunnel: &mut Tunnel) -> Result<(), TunnelError> {
        let killed = self.terminate(tunnel).await;
        let removed = self.store.remove(tunnel.id()).await;
        killed.and(removed)
    }

    /// Kill the owned process without touching bookkeeping: SIGTERM, wait up
    /// to the grace period, then SIGKILL.
    pub async fn terminate(&self, tunnel: &mut Tunnel) -> Result<(), TunnelError> {
        let Some(child) = tunnel.take_process() else {
            return Ok(());
        };
        let id = tunnel.id().to_string();
        self.terminate_child(&id, child).await
    }

    async fn terminate_child(&self, id: &str, mut child: Child) -> Result<(), TunnelError> {
        if let Ok(Some(status)) = child.try_wait() {
            debug!("Tunnel {id}: process already exited ({status})");
            return Ok(());
        }
        let Some(pid) = child.id() else {
            return Ok(());
        };

        #[allow(clippy::cast_possible_wrap)]
        match kill(Pid::from_raw(pid as i32), Signal::SIGTERM) {
            Ok(()) | Err(Errno::ESRCH) => {}
            Err(e) => warn!("Tunnel {id}: SIGTERM to pid {pid} failed: {e}"),
        }

        match tokio::time::timeout(self.stop_grace, child.wait()).await {
            Ok(Ok(status)) => {
                info!("Tunnel {id}: pid {pid} stopped ({status})");
                Ok(())
            }
            Ok(Err(source)) => Err(TunnelError::Stop {
                id: id.to_string(),
                source,
            }),
            Err(_) => {
                warn!("Tunnel {id}: pid {pid} ignored SIGTERM, sending SIGKILL");
                child.kill().await.map_err(|source| TunnelError::Stop {
                    id: id.to_string(),
                    source,
                })
            }
        }
    }

    /// Kill a process we hold no handle to (e.g. left over from a previous
    /// supervisor instance). Same SIGTERM → grace → SIGKILL sequence, polling
    /// the pid instead of waiting on a handle.
    pub async fn terminate_pid(&self, id: &str, pid: u32) -> Result<(), TunnelError> {
        let Ok(raw) = i32::try_from(pid) else {
            return Ok(());
        };
        if raw <= 0 {
            return Ok(());
        }
        let target = Pid::from_raw(raw);
        match kill(target, Signal::SIGTERM) {
            Ok(()) => {}
            Err(Errno::ESRCH) => return Ok(()),
            Err(e) => {
                return Err(TunnelError::Stop {
                    id: id.to_string(),
                    source: e.into(),
                })
            }
        }

        let deadline = tokio::time::Instant::now() + self.stop_grace;
        while tokio::time::Instant::now() < deadline {
            if !probe::pid_alive(pid) {
                info!("Tunnel {id}: unmanaged pid {pid} stopped");
                return Ok(());
            }
            tokio::time::sleep(PID_POLL).await;
        }

        warn!("Tunnel {id}: unmanaged pid {pid} ignored SIGTERM, sending SIGKILL");
        match kill(target, Signal::SIGKILL) {
            Ok(()) | Err(Errno::ESRCH) => Ok(()),
            Err(e) => Err(TunnelError::Stop {
                id: id.to_string(),
                source: e.into(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{free_port, launcher, launcher_with_exec, sample_config};
    use crate::tunnel::record::new_id;

    fn tunnel(port: u16) -> Tunnel {
        let mut config = sample_config("web", port);
        config.id = new_id();
        Tunnel::new(config)
    }

    #[tokio::test]
    async fn test_launch_records_pid_and_log() {
        let dir = tempfile::tempdir().unwrap();
        let launcher = launcher(dir.path()).await;
        let mut t = tunnel(free_port());

        let pid = launcher.launch(&mut t).await.unwrap();
        assert!(pid > 0);
        assert_eq!(t.pid(), Some(pid));
        assert!(t.has_process());
        assert_eq!(t.log_path(), Some(launcher.store().log_path(t.id()).as_path()));
        assert!(launcher.store().log_path(t.id()).exists());

        let entry = launcher.store().read(t.id()).await.unwrap().unwrap();
        assert_eq!(entry.pid, pid);
        assert_eq!(&entry.config, t.config());
        assert!(launcher.store().entry_path(t.id()).is_file());

        launcher.stop(&mut t).await.unwrap();
        assert!(!launcher.store().entry_path(t.id()).exists());
    }

    #[tokio::test]
    async fn test_port_conflict_launches_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let launcher = launcher(dir.path()).await;
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let mut t = tunnel(listener.local_addr().unwrap().port());

        let err = launcher.launch(&mut t).await.unwrap_err();
        assert!(matches!(err, TunnelError::PortConflict { .. }));
        assert!(!t.has_process());
        assert!(launcher.store().read(t.id()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_missing_executable_is_launch_error() {
        let dir = tempfile::tempdir().unwrap();
        let launcher = launcher_with_exec(dir.path(), "/nonexistent/fwd-ssh").await;
        let mut t = tunnel(free_port());

        let err = launcher.launch(&mut t).await.unwrap_err();
        assert!(matches!(err, TunnelError::Launch { .. }));
        assert!(!t.has_process());
        assert!(launcher.store().read(t.id()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_stop_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let launcher = launcher(dir.path()).await;
        let mut t = tunnel(free_port());
        let pid = launcher.launch(&mut t).await.unwrap();

        launcher.stop(&mut t).await.unwrap();
        assert!(!t.has_process());
        assert_eq!(t.pid(), None);
        assert!(!probe::pid_alive(pid));
        assert!(launcher.store().read(t.id()).await.unwrap().is_none());

        launcher.stop(&mut t).await.unwrap();
    }

    #[tokio::test]
    async fn test_relaunch_replaces_process_and_entry() {
        let dir = tempfile::tempdir().unwrap();
        let launcher = launcher(dir.path()).await;
        let mut t = tunnel(free_port());
        let first = launcher.launch(&mut t).await.unwrap();
        let second = launcher.launch(&mut t).await.unwrap();

        assert_ne!(first, second);
        assert!(!probe::pid_alive(first));
        assert_eq!(launcher.store().read(t.id()).await.unwrap().unwrap().pid, second);

        launcher.stop(&mut t).await.unwrap();
    }

    #[tokio::test]
    async fn test_failed_relaunch_keeps_entry() {
        let dir = tempfile::tempdir().unwrap();
        let launcher = launcher(dir.path()).await;
        let port = free_port();
        let mut t = tunnel(port);
        let pid = launcher.launch(&mut t).await.unwrap();

        // Someone else grabs the port before the restart.
        let _squatter = std::net::TcpListener::bind(("127.0.0.1", port)).unwrap();
        let err = launcher.launch(&mut t).await.unwrap_err();
        assert!(matches!(err, TunnelError::PortConflict { .. }));
        assert!(!t.has_process());
        assert_eq!(launcher.store().read(t.id()).await.unwrap().unwrap().pid, pid);

        launcher.stop(&mut t).await.unwrap();
    }

    #[tokio::test]
    async fn test_terminate_pid_of_unowned_process() {
        let dir = tempfile::tempdir().unwrap();
        let launcher = launcher(dir.path()).await;
        let mut child = Command::new("sleep").arg("30").spawn().unwrap();
        let pid = child.id().unwrap();

        launcher.terminate_pid("orphan", pid).await.unwrap();
        assert!(!probe::pid_alive(pid));
        let _ = child.wait().await;

        // Already gone: still fine.
        launcher.terminate_pid("orphan", pid).await.unwrap();
    }
}
