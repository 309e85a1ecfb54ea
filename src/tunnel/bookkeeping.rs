//! Durable, file-based record of launched tunnels.
//!
//! Layout under the base directory:
//!
//! ```text
//! <base>/proc/<id>.pid   JSON bookkeeping entry (config + pid), one per launched tunnel
//! <base>/log/<id>.log    append-only stdout/stderr of the forwarding process
//! ```
//!
//! The entries outlive the supervisor: after a crash they are the only record
//! of which tunnels were expected to be running. Nothing in memory holds them
//! exclusively; the reconciler re-reads the directory every cycle.

use std::io;
use std::path::{Path, PathBuf};

use futures::Stream;
use serde::{Deserialize, Serialize};
use tokio::fs;
use tracing::warn;

use super::record::TunnelConfig;
use crate::error::TunnelError;

const PROC_DIR: &str = "proc";
const LOG_DIR: &str = "log";
const ENTRY_EXT: &str = "pid";
const LOG_EXT: &str = "log";

/// On-disk mirror of a launched tunnel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BookkeepingEntry {
    #[serde(flatten)]
    pub config: TunnelConfig,
    /// Pid observed right after launch.
    pub pid: u32,
}

impl BookkeepingEntry {
    pub fn new(config: TunnelConfig, pid: u32) -> Self {
        Self { config, pid }
    }

    pub fn id(&self) -> &str {
        &self.config.id
    }
}

/// Handle to the bookkeeping directories. Cheap to clone.
#[derive(Debug, Clone)]
pub struct Bookkeeping {
    proc_dir: PathBuf,
    log_dir: PathBuf,
}

impl Bookkeeping {
    /// Resolve the layout under `base` and create the directories if needed.
    pub async fn open(base: impl Into<PathBuf>) -> Result<Self, TunnelError> {
        let base = base.into();
        let store = Self {
            proc_dir: base.join(PROC_DIR),
            log_dir: base.join(LOG_DIR),
        };
        for dir in [&store.proc_dir, &store.log_dir] {
            fs::create_dir_all(dir)
                .await
                .map_err(|e| TunnelError::io("create bookkeeping directory", dir, e))?;
        }
        Ok(store)
    }

    pub fn proc_dir(&self) -> &Path {
        &self.proc_dir
    }

    pub fn log_dir(&self) -> &Path {
        &self.log_dir
    }

    pub fn entry_path(&self, id: &str) -> PathBuf {
        self.proc_dir.join(format!("{id}.{ENTRY_EXT}"))
    }

    pub fn log_path(&self, id: &str) -> PathBuf {
        self.log_dir.join(format!("{id}.{LOG_EXT}"))
    }

    /// Write (or overwrite) the entry for `entry.id()`.
    ///
    /// Written to a temp file and renamed over the target so a concurrent
    /// scan never sees a half-written entry.
    pub async fn write(&self, entry: &BookkeepingEntry) -> Result<(), TunnelError> {
        let path = self.entry_path(entry.id());
        let temp_path = self.proc_dir.join(format!(".{}.{ENTRY_EXT}.tmp", entry.id()));
        let body = serde_json::to_vec_pretty(entry)
            .map_err(|e| TunnelError::io("serialize bookkeeping entry", &path, e.into()))?;

        fs::write(&temp_path, body)
            .await
            .map_err(|e| TunnelError::io("write bookkeeping entry", &temp_path, e))?;
        if let Err(e) = fs::rename(&temp_path, &path).await {
            let _ = fs::remove_file(&temp_path).await;
            return Err(TunnelError::io("write bookkeeping entry", &path, e));
        }
        Ok(())
    }

    /// Read a single entry. `Ok(None)` if there is none.
    pub async fn read(&self, id: &str) -> Result<Option<BookkeepingEntry>, TunnelError> {
        let path = self.entry_path(id);
        match fs::read(&path).await {
            Ok(bytes) => serde_json::from_slice(&bytes)
                .map(Some)
                .map_err(|e| TunnelError::io("parse bookkeeping entry", &path, e.into())),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(TunnelError::io("read bookkeeping entry", &path, e)),
        }
    }

    /// Delete the entry for `id`. A missing entry is not an error.
    pub async fn remove(&self, id: &str) -> Result<(), TunnelError> {
        remove_if_present(&self.entry_path(id)).await
    }

    /// Lazily scan the proc directory for entries.
    ///
    /// Malformed entries (unreadable, unparsable, or whose id does not match
    /// the file name) are deleted and skipped so one corrupt file cannot block
    /// reconciliation of the rest. Only failing to open the directory is an
    /// error; a read error mid-scan ends the stream early.
    pub async fn entries(
        &self,
    ) -> Result<impl Stream<Item = BookkeepingEntry> + Send + 'static, TunnelError> {
        let read_dir = fs::read_dir(&self.proc_dir)
            .await
            .map_err(|e| TunnelError::io("list bookkeeping directory", &self.proc_dir, e))?;

        Ok(futures::stream::unfold(read_dir, |mut read_dir| async move {
            loop {
                let dir_entry = match read_dir.next_entry().await {
                    Ok(Some(e)) => e,
                    Ok(None) => return None,
                    Err(e) => {
                        warn!("Bookkeeping scan aborted: {e}");
                        return None;
                    }
                };
                let path = dir_entry.path();
                let Some(id) = file_id(&path, ENTRY_EXT) else {
                    continue;
                };
                if let Some(entry) = load_entry(&path, &id).await {
                    return Some((entry, read_dir));
                }
            }
        }))
    }

    /// All `<id>.log` files in the log directory.
    pub async fn log_files(&self) -> Result<Vec<(String, PathBuf)>, TunnelError> {
        let mut read_dir = fs::read_dir(&self.log_dir)
            .await
            .map_err(|e| TunnelError::io("list log directory", &self.log_dir, e))?;
        let mut out = Vec::new();
        loop {
            match read_dir.next_entry().await {
                Ok(Some(entry)) => {
                    let path = entry.path();
                    if let Some(id) = file_id(&path, LOG_EXT) {
                        out.push((id, path));
                    }
                }
                Ok(None) => break,
                Err(e) => return Err(TunnelError::io("list log directory", &self.log_dir, e)),
            }
        }
        Ok(out)
    }

    /// Delete the log file for `id`. A missing file is not an error.
    pub async fn remove_log(&self, id: &str) -> Result<(), TunnelError> {
        remove_if_present(&self.log_path(id)).await
    }
}

/// `<id>.<ext>` → `id`. Hidden files (temp writes) are ignored.
fn file_id(path: &Path, ext: &str) -> Option<String> {
    if path.extension().and_then(|e| e.to_str()) != Some(ext) {
        return None;
    }
    let stem = path.file_stem()?.to_str()?;
    if stem.is_empty() || stem.starts_with('.') {
        return None;
    }
    Some(stem.to_string())
}

async fn load_entry(path: &Path, id: &str) -> Option<BookkeepingEntry> {
    let bytes = match fs::read(path).await {
        Ok(b) => b,
        // Removed between listing and reading (e.g. a concurrent stop).
        Err(e) if e.kind() == io::ErrorKind::NotFound => return None,
        Err(e) => {
            warn!("Removing unreadable bookkeeping entry {}: {e}", path.display());
            let _ = fs::remove_file(path).await;
            return None;
        }
    };
    match serde_json::from_slice::<BookkeepingEntry>(&bytes) {
        Ok(entry) if entry.id() == id => Some(entry),
        Ok(entry) => {
            warn!(
                "Removing bookkeeping entry {} (records id '{}')",
                path.display(),
                entry.id()
            );
            let _ = fs::remove_file(path).await;
            None
        }
        Err(e) => {
            warn!("Removing malformed bookkeeping entry {}: {e}", path.display());
            let _ = fs::remove_file(path).await;
            None
        }
    }
}

async fn remove_if_present(path: &Path) -> Result<(), TunnelError> {
    match fs::remove_file(path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(TunnelError::io("remove bookkeeping file", path, e)),
    }
}
