//! Liveness probes: "is this local port bound?" and "is this process alive?".
//!
//! Both are best-effort and never retry; the reconciler re-checks every cycle
//! so a transient wrong answer is corrected on the next pass.

use std::net::{Ipv4Addr, SocketAddr};
use std::time::Duration;

use nix::errno::Errno;
use nix::sys::signal::kill;
use nix::unistd::Pid;
use tokio::net::TcpStream;
use tokio::process::Child;

/// TCP connect probe with a short bounded timeout.
#[derive(Debug, Clone, Copy)]
pub struct Prober {
    timeout: Duration,
}

impl Prober {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }

    /// Whether something accepts connections on `localhost:port`.
    ///
    /// Never blocks longer than the configured timeout.
    pub async fn port_in_use(&self, port: u16) -> bool {
        let addr = SocketAddr::from((Ipv4Addr::LOCALHOST, port));
        matches!(
            tokio::time::timeout(self.timeout, TcpStream::connect(addr)).await,
            Ok(Ok(_))
        )
    }
}

/// Whether an owned child is still running.
///
/// `try_wait` reaps an exited child, so a dead forwarder is reported as dead
/// rather than lingering as a zombie that `kill(pid, 0)` would still accept.
pub fn process_alive(child: &mut Child) -> bool {
    match child.try_wait() {
        Ok(None) => child.id().is_some_and(pid_alive),
        Ok(Some(_)) | Err(_) => false,
    }
}

/// Zero-signal existence probe for a pid we do not own a handle to.
///
/// `EPERM` means the process exists but belongs to someone else, which still
/// counts as alive. Zombies count as dead.
pub fn pid_alive(pid: u32) -> bool {
    let Ok(raw) = i32::try_from(pid) else {
        return false;
    };
    if raw <= 0 {
        return false;
    }
    match kill(Pid::from_raw(raw), None) {
        Ok(()) => !is_zombie(pid),
        Err(Errno::EPERM) => true,
        Err(_) => false,
    }
}

/// Linux: state field of `/proc/<pid>/stat` is `Z` for zombies. The comm
/// field may contain spaces and parens, so parse after the last `)`.
fn is_zombie(pid: u32) -> bool {
    std::fs::read_to_string(format!("/proc/{pid}/stat"))
        .ok()
        .and_then(|stat| {
            let close = stat.rfind(')')?;
            Some(stat[close + 1..].trim_start().starts_with('Z'))
        })
        .unwrap_or(false)
}

/// Whether the executable of `pid` looks like `exec`, judged by the file name
/// of its `argv[0]` in `/proc/<pid>/cmdline`. Unknown means no.
pub fn cmdline_matches(pid: u32, exec: &str) -> bool {
    let wanted = file_name(exec);
    std::fs::read(format!("/proc/{pid}/cmdline"))
        .ok()
        .and_then(|bytes| {
            let argv0 = bytes.split(|&b| b == 0).next()?;
            let argv0 = std::str::from_utf8(argv0).ok()?;
            Some(file_name(argv0) == wanted)
        })
        .unwrap_or(false)
}

fn file_name(path: &str) -> &str {
    path.rsplit('/').next().unwrap_or(path)
}
