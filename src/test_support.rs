//! Fixtures shared by the supervisor tests.

use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use std::time::Duration;

use tempfile::TempDir;

use crate::notify::Notifier;
use crate::tunnel::{Bookkeeping, Launcher, Prober, TunnelConfig};

/// Path to a stand-in forwarder: a shell script that ignores its arguments
/// and sleeps. It never binds the port; tests bind it themselves when they
/// need a tunnel to look established.
///
/// Written once per test process, before anything is spawned from it, so
/// no concurrent fork can hold the file open for writing (ETXTBSY).
pub fn fake_forwarder() -> &'static Path {
    static SCRIPT: OnceLock<(TempDir, PathBuf)> = OnceLock::new();
    let (_, path) = SCRIPT.get_or_init(|| {
        let dir = tempfile::tempdir().expect("tempdir for fake forwarder");
        let path = dir.path().join("fake-ssh");
        std::fs::write(&path, "#!/bin/sh\nexec sleep 120\n").expect("write fake forwarder");
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755))
            .expect("chmod fake forwarder");
        (dir, path)
    });
    path
}

/// A port nothing is listening on (at the time of the call).
pub fn free_port() -> u16 {
    std::net::TcpListener::bind("127.0.0.1:0")
        .and_then(|l| l.local_addr())
        .map(|a| a.port())
        .expect("bind ephemeral port")
}

pub fn sample_config(name: &str, local_port: u16) -> TunnelConfig {
    TunnelConfig {
        id: String::new(),
        name: name.to_string(),
        default_url: "/".to_string(),
        host: "bastion.test".to_string(),
        username: Some("ops".to_string()),
        local_port,
        remote_port: 80,
    }
}

pub fn notifier() -> Notifier {
    Notifier::new(100, Duration::from_millis(1))
}

/// Launcher rooted in `base`, spawning the fake forwarder.
pub async fn launcher(base: &Path) -> Launcher {
    launcher_with_exec(base, &fake_forwarder().to_string_lossy()).await
}

pub async fn launcher_with_exec(base: &Path, exec: &str) -> Launcher {
    let store = Bookkeeping::open(base).await.expect("open bookkeeping");
    Launcher::new(
        exec,
        store,
        Prober::new(Duration::from_millis(200)),
        Duration::from_millis(500),
        notifier(),
    )
}
