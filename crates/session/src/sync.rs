//! Cross-context session mirroring.
//!
//! Each auth store commit also writes a broadcast record. Other contexts
//! sharing the data dir watch that record and mirror it into memory, so a
//! login or logout in one place shows up everywhere. Last writer wins.

use std::ffi::OsString;
use std::path::Path;
use std::sync::Arc;

use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::auth_store::AuthStore;
use crate::error::StorageError;
use crate::storage::{BroadcastRecord, FileStorage, MemoryStorage, SessionStorage};

/// Follows the broadcast file of a [`FileStorage`].
pub struct BroadcastWatcher {
    _watcher: RecommendedWatcher,
    task: JoinHandle<()>,
}

impl BroadcastWatcher {
    /// Start watching. Must be called inside a tokio runtime.
    pub fn spawn(store: Arc<AuthStore>, storage: Arc<FileStorage>) -> Result<Self, StorageError> {
        let path = storage.broadcast_path().to_path_buf();
        // Writes land via rename, so watch the directory rather than the file.
        let dir = path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| Path::new(".").to_path_buf());
        std::fs::create_dir_all(&dir)?;
        let file_name: Option<OsString> = path.file_name().map(OsString::from);

        let (tx, mut rx) = mpsc::unbounded_channel::<()>();
        let mut watcher = RecommendedWatcher::new(
            move |res: Result<Event, notify::Error>| match res {
                Ok(event) => {
                    if !matches!(
                        event.kind,
                        EventKind::Create(_) | EventKind::Modify(_) | EventKind::Any
                    ) {
                        return;
                    }
                    let touches_record = event
                        .paths
                        .iter()
                        .any(|p| p.file_name().map(OsString::from) == file_name);
                    if touches_record {
                        let _ = tx.send(());
                    }
                }
                Err(err) => {
                    warn!(
                        component = "sync",
                        event = "sync.fs_event_error",
                        error = %err,
                        "Broadcast watcher event error"
                    );
                }
            },
            notify::Config::default(),
        )?;
        watcher.watch(&dir, RecursiveMode::NonRecursive)?;

        info!(
            component = "sync",
            event = "sync.started",
            path = %path.display(),
            "Broadcast watcher started"
        );

        let task = tokio::spawn(async move {
            let mut last: Option<BroadcastRecord> = None;
            while rx.recv().await.is_some() {
                // Collapse bursts from a single write
                while rx.try_recv().is_ok() {}

                let record = match storage.read_broadcast() {
                    Ok(Some(record)) => record,
                    Ok(None) => continue,
                    Err(e) => {
                        debug!(
                            component = "sync",
                            event = "sync.read_failed",
                            error = %e,
                            "Broadcast record unreadable, waiting for next write"
                        );
                        continue;
                    }
                };
                if last.as_ref() == Some(&record) {
                    continue;
                }
                store.apply_broadcast(&record);
                last = Some(record);
            }
        });

        Ok(Self {
            _watcher: watcher,
            task,
        })
    }
}

impl Drop for BroadcastWatcher {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// Mirror broadcasts of an in-process [`MemoryStorage`] into `store`.
pub fn follow_memory(store: Arc<AuthStore>, storage: &MemoryStorage) -> JoinHandle<()> {
    let mut rx = storage.subscribe();
    tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(record) => store.apply_broadcast(&record),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(
                        component = "sync",
                        event = "sync.lagged",
                        skipped,
                        "Missed session broadcasts"
                    );
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    })
}
