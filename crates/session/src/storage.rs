//! Durable session storage.
//!
//! Two records live here: the session snapshot itself, and a broadcast record
//! that other client contexts watch to mirror login/logout (see [`crate::sync`]).
//! The auth store is the only writer.

use std::fs;
use std::io::Write as IoWrite;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use sweat24_protocol::User;
use tokio::sync::broadcast;
use tracing::debug;

use crate::error::StorageError;
use crate::paths;

/// Persisted snapshot: token + user + issue time (ISO-8601 on disk)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredSession {
    pub token: String,
    pub user: User,
    pub issued_at: DateTime<Utc>,
}

impl StoredSession {
    pub fn age(&self, now: DateTime<Utc>) -> Duration {
        (now - self.issued_at).to_std().unwrap_or(Duration::ZERO)
    }

    /// Older than `threshold` at `now`.
    pub fn is_stale(&self, now: DateTime<Utc>, threshold: Duration) -> bool {
        self.age(now) > threshold
    }
}

/// Record other contexts observe. `token`/`user` are `None` after a logout.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BroadcastRecord {
    pub token: Option<String>,
    pub user: Option<User>,
    pub timestamp: DateTime<Utc>,
    /// Id of the writing context, so it can skip its own records.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub origin: Option<String>,
}

impl BroadcastRecord {
    pub fn signed_in(session: &StoredSession, origin: &str) -> Self {
        Self {
            token: Some(session.token.clone()),
            user: Some(session.user.clone()),
            timestamp: Utc::now(),
            origin: Some(origin.to_string()),
        }
    }

    pub fn signed_out(origin: &str) -> Self {
        Self {
            token: None,
            user: None,
            timestamp: Utc::now(),
            origin: Some(origin.to_string()),
        }
    }
}

/// Synchronous so the auth store can write it inside its commit section.
pub trait SessionStorage: Send + Sync {
    fn load(&self) -> Result<Option<StoredSession>, StorageError>;
    fn save(&self, session: &StoredSession) -> Result<(), StorageError>;
    fn clear(&self) -> Result<(), StorageError>;
    fn publish(&self, record: &BroadcastRecord) -> Result<(), StorageError>;
    fn read_broadcast(&self) -> Result<Option<BroadcastRecord>, StorageError>;
}

/// JSON files under the data dir
#[derive(Debug, Clone)]
pub struct FileStorage {
    session_path: PathBuf,
    broadcast_path: PathBuf,
}

impl FileStorage {
    pub fn new(dir: &Path) -> Self {
        Self {
            session_path: dir.join("session.json"),
            broadcast_path: dir.join("session-broadcast.json"),
        }
    }

    /// Files in the globally configured data dir.
    pub fn in_data_dir() -> Self {
        Self {
            session_path: paths::session_path(),
            broadcast_path: paths::broadcast_path(),
        }
    }

    pub fn broadcast_path(&self) -> &Path {
        &self.broadcast_path
    }
}

impl SessionStorage for FileStorage {
    fn load(&self) -> Result<Option<StoredSession>, StorageError> {
        read_json(&self.session_path)
    }

    fn save(&self, session: &StoredSession) -> Result<(), StorageError> {
        write_json_atomic(&self.session_path, session)
    }

    fn clear(&self) -> Result<(), StorageError> {
        match fs::remove_file(&self.session_path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn publish(&self, record: &BroadcastRecord) -> Result<(), StorageError> {
        write_json_atomic(&self.broadcast_path, record)
    }

    fn read_broadcast(&self) -> Result<Option<BroadcastRecord>, StorageError> {
        read_json(&self.broadcast_path)
    }
}

fn read_json<T: DeserializeOwned>(path: &Path) -> Result<Option<T>, StorageError> {
    match fs::read(path) {
        Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

/// Write to a sibling temp file, then rename over the target.
fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> Result<(), StorageError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let json = serde_json::to_vec_pretty(value)?;
    let tmp = path.with_extension("json.tmp");
    {
        let mut file = fs::File::create(&tmp)?;
        file.write_all(&json)?;
        file.sync_all()?;
    }
    fs::rename(&tmp, path)?;
    debug!(
        component = "storage",
        event = "storage.written",
        path = %path.display(),
        bytes = json.len(),
    );
    Ok(())
}

/// In-process storage. Broadcasts fan out to [`MemoryStorage::subscribe`]rs,
/// which is how several contexts in one process stay in sync.
#[derive(Debug)]
pub struct MemoryStorage {
    session: Mutex<Option<StoredSession>>,
    broadcast: Mutex<Option<BroadcastRecord>>,
    broadcast_tx: broadcast::Sender<BroadcastRecord>,
}

impl Default for MemoryStorage {
    fn default() -> Self {
        let (broadcast_tx, _) = broadcast::channel(16);
        Self {
            session: Mutex::new(None),
            broadcast: Mutex::new(None),
            broadcast_tx,
        }
    }
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_session(session: StoredSession) -> Self {
        let storage = Self::default();
        *storage.session.lock().unwrap_or_else(|e| e.into_inner()) = Some(session);
        storage
    }

    pub fn subscribe(&self) -> broadcast::Receiver<BroadcastRecord> {
        self.broadcast_tx.subscribe()
    }
}

impl SessionStorage for MemoryStorage {
    fn load(&self) -> Result<Option<StoredSession>, StorageError> {
        Ok(self.session.lock().unwrap_or_else(|e| e.into_inner()).clone())
    }

    fn save(&self, session: &StoredSession) -> Result<(), StorageError> {
        *self.session.lock().unwrap_or_else(|e| e.into_inner()) = Some(session.clone());
        Ok(())
    }

    fn clear(&self) -> Result<(), StorageError> {
        *self.session.lock().unwrap_or_else(|e| e.into_inner()) = None;
        Ok(())
    }

    fn publish(&self, record: &BroadcastRecord) -> Result<(), StorageError> {
        *self.broadcast.lock().unwrap_or_else(|e| e.into_inner()) = Some(record.clone());
        let _ = self.broadcast_tx.send(record.clone());
        Ok(())
    }

    fn read_broadcast(&self) -> Result<Option<BroadcastRecord>, StorageError> {
        Ok(self.broadcast.lock().unwrap_or_else(|e| e.into_inner()).clone())
    }
}
