//! Central path resolution for the client's durable files.
//!
//! Resolved once at startup from: CLI `--data-dir` > `SWEAT24_DATA_DIR` env > `~/.sweat24`.
//! Callsites use these helpers instead of constructing paths from `HOME`.

use std::io;
use std::path::{Path, PathBuf};
use std::sync::RwLock;

static DATA_DIR: RwLock<Option<PathBuf>> = RwLock::new(None);

/// Initialize the global data directory. Returns the resolved path.
///
/// Priority: `explicit` arg > `SWEAT24_DATA_DIR` env > `~/.sweat24` default,
/// falling back to the system temp dir when there is no home directory.
pub fn init_data_dir(explicit: Option<&Path>) -> PathBuf {
    let dir = resolve_data_dir(explicit);
    let mut guard = DATA_DIR.write().unwrap_or_else(|e| e.into_inner());
    *guard = Some(dir.clone());
    dir
}

/// Return the current data directory, resolving the default if
/// `init_data_dir` hasn't been called.
pub fn data_dir() -> PathBuf {
    let guard = DATA_DIR.read().unwrap_or_else(|e| e.into_inner());
    guard.clone().unwrap_or_else(|| resolve_data_dir(None))
}

fn resolve_data_dir(explicit: Option<&Path>) -> PathBuf {
    if let Some(p) = explicit {
        return p.to_path_buf();
    }
    if let Ok(env_val) = std::env::var("SWEAT24_DATA_DIR") {
        if !env_val.trim().is_empty() {
            return PathBuf::from(env_val);
        }
    }
    dirs::home_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join(".sweat24")
}

/// Persisted session snapshot
pub fn session_path() -> PathBuf {
    data_dir().join("session.json")
}

/// Cross-context broadcast record
pub fn broadcast_path() -> PathBuf {
    data_dir().join("session-broadcast.json")
}

pub fn log_dir() -> PathBuf {
    data_dir().join("logs")
}

/// Create all required subdirectories under the data dir.
pub fn ensure_dirs() -> io::Result<()> {
    let base = data_dir();
    std::fs::create_dir_all(&base)?;
    std::fs::create_dir_all(base.join("logs"))?;
    Ok(())
}
