//! The user-authored tunnel list: a JSON array of [`TunnelConfig`].
//!
//! ```json
//! [
//!   {
//!     "id": "grafana",
//!     "name": "Grafana",
//!     "defaultUrl": "/dashboards",
//!     "host": "bastion.example.com",
//!     "userName": "ops",
//!     "localPort": 3000,
//!     "remotePort": 3000
//!   }
//! ]
//! ```

use std::path::Path;

use tokio::fs;

use super::record::TunnelConfig;
use crate::error::TunnelError;

/// Parse every definition in the file, in file order. Entries are not
/// validated here; the registry validates each one as it is added.
pub async fn load(path: &Path) -> Result<Vec<TunnelConfig>, TunnelError> {
    let raw = fs::read(path)
        .await
        .map_err(|e| TunnelError::io("read tunnel file", path, e))?;
    serde_json::from_slice(&raw).map_err(|e| TunnelError::io("parse tunnel file", path, e.into()))
}

/// Write `configs` as a pretty-printed array, replacing the file atomically.
pub async fn save(path: &Path, configs: &[TunnelConfig]) -> Result<(), TunnelError> {
    let mut body = serde_json::to_vec_pretty(configs)
        .map_err(|e| TunnelError::io("serialize tunnel file", path, e.into()))?;
    body.push(b'\n');

    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)
            .await
            .map_err(|e| TunnelError::io("create tunnel file directory", parent, e))?;
    }
    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let temp_path = path.with_file_name(format!(".{file_name}.tmp"));

    fs::write(&temp_path, &body)
        .await
        .map_err(|e| TunnelError::io("write tunnel file", &temp_path, e))?;
    if let Err(e) = fs::rename(&temp_path, path).await {
        let _ = fs::remove_file(&temp_path).await;
        return Err(TunnelError::io("write tunnel file", path, e));
    }
    Ok(())
}

/// The definition with `id`, or `NotFound`.
pub async fn find(path: &Path, id: &str) -> Result<TunnelConfig, TunnelError> {
    load(path)
        .await?
        .into_iter()
        .find(|c| c.id == id)
        .ok_or_else(|| TunnelError::NotFound(id.to_string()))
}
