//! Small helpers shared across modules.

use std::path::PathBuf;
use std::time::{SystemTime, UNIX_EPOCH};

/// Resolve a configured directory, expanding a leading `~` to `$HOME`.
///
/// - `"~"` → `/home/user`
/// - `"~/.fwdctl"` → `/home/user/.fwdctl`
/// - Anything else (including `~other`) is taken literally.
pub fn expand_home(path: &str) -> PathBuf {
    let rest = match path.strip_prefix('~') {
        Some(rest) if rest.is_empty() || rest.starts_with('/') => rest,
        _ => return PathBuf::from(path),
    };
    match std::env::var_os("HOME") {
        Some(home) => {
            let mut out = PathBuf::from(home);
            let rest = rest.trim_start_matches('/');
            if !rest.is_empty() {
                out.push(rest);
            }
            out
        }
        None => PathBuf::from(path),
    }
}

/// Current timestamp in milliseconds since the Unix epoch.
pub fn now_ms() -> u64 {
    #[allow(clippy::cast_possible_truncation)]
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| d.as_millis() as u64)
}
