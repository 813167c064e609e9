//! Workspace snapshot catalog.
//!
//! Archives live in one directory as `snapshot-<id>.tar`. A capture streams
//! to a temporary file first; the record is inserted with a placeholder name
//! and only points at the final file once the rename has succeeded.

use chrono::Utc;
use futures_util::StreamExt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio_util::io::ReaderStream;
use tracing::{debug, info, warn};

use super::{SandboxError, SandboxManager};
use crate::engine::{ByteStream, EngineError};
use crate::store::{SnapshotRecord, Store};

const PENDING_FILENAME: &str = "pending";

static TEMP_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Temporary archive name, unique across processes and concurrent captures.
fn temp_filename() -> String {
    format!(
        "snapshot-tmp-{}-{}-{}.tar",
        std::process::id(),
        Utc::now().timestamp_millis(),
        TEMP_COUNTER.fetch_add(1, Ordering::Relaxed)
    )
}

/// Label used when the operator gives none.
pub fn default_label() -> String {
    format!("Snapshot — {}", Utc::now().format("%Y-%m-%d %H:%M"))
}

/// Creates, lists, opens and deletes workspace snapshots.
pub struct SnapshotService {
    store: Arc<dyn Store>,
    dir: PathBuf,
}

impl SnapshotService {
    pub fn new(store: Arc<dyn Store>, dir: impl Into<PathBuf>) -> Self {
        Self {
            store,
            dir: dir.into(),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_of(&self, record: &SnapshotRecord) -> PathBuf {
        self.dir.join(&record.filename)
    }

    /// Captures the running container's workspace.
    pub async fn capture(
        &self,
        manager: &SandboxManager,
        label: Option<&str>,
    ) -> Result<SnapshotRecord, SandboxError> {
        let (archive, agent) = manager.snapshot_capture().await?;

        tokio::fs::create_dir_all(&self.dir).await?;
        let tmp = self.dir.join(temp_filename());

        let size = match write_archive(archive, &tmp).await {
            Ok(size) => size,
            Err(e) => {
                discard_file(&tmp).await;
                return Err(e);
            }
        };

        let label = label
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map_or_else(default_label, str::to_string);

        let record = match self
            .store
            .insert_snapshot(&label, agent, PENDING_FILENAME, size)
        {
            Ok(record) => record,
            Err(e) => {
                discard_file(&tmp).await;
                return Err(e.into());
            }
        };

        let filename = format!("snapshot-{}.tar", record.id);
        let target = self.dir.join(&filename);
        if let Err(e) = tokio::fs::rename(&tmp, &target).await {
            discard_file(&tmp).await;
            self.forget(record.id);
            return Err(e.into());
        }
        if let Err(e) = self.store.update_snapshot_filename(record.id, &filename) {
            discard_file(&target).await;
            self.forget(record.id);
            return Err(e.into());
        }

        info!("Captured snapshot {} ({} bytes)", record.id, size);
        Ok(SnapshotRecord { filename, ..record })
    }

    fn forget(&self, id: i64) {
        if let Err(e) = self.store.delete_snapshot(id) {
            warn!("Could not delete snapshot record {}: {:#}", id, e);
        }
    }

    /// Newest first.
    pub fn list(&self, limit: usize) -> Result<Vec<SnapshotRecord>, SandboxError> {
        Ok(self.store.list_snapshots(limit)?)
    }

    /// Looks up a snapshot and opens its archive as a stream.
    pub async fn open(&self, id: i64) -> Result<(SnapshotRecord, ByteStream), SandboxError> {
        let record = self
            .store
            .get_snapshot(id)?
            .ok_or_else(|| SandboxError::snapshot_not_found(id))?;
        let path = self.path_of(&record);

        let file = match tokio::fs::File::open(&path).await {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(SandboxError::snapshot_missing(id, path));
            }
            Err(e) => return Err(e.into()),
        };

        let stream = ReaderStream::new(file)
            .map(|chunk| chunk.map_err(|e| EngineError::transfer(e.to_string())));
        Ok((record, Box::pin(stream)))
    }

    /// Deletes the archive (if present) and then the record.
    pub async fn delete(&self, id: i64) -> Result<(), SandboxError> {
        let record = self
            .store
            .get_snapshot(id)?
            .ok_or_else(|| SandboxError::snapshot_not_found(id))?;

        match tokio::fs::remove_file(self.path_of(&record)).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!("Snapshot {} had no archive on disk", id);
            }
            Err(e) => return Err(e.into()),
        }
        self.store.delete_snapshot(id)?;
        info!("Deleted snapshot {}", id);
        Ok(())
    }
}

async fn write_archive(mut archive: ByteStream, path: &Path) -> Result<u64, SandboxError> {
    let mut file = tokio::fs::File::create(path).await?;
    let mut size = 0u64;
    while let Some(chunk) = archive.next().await {
        let chunk = chunk?;
        size += chunk.len() as u64;
        file.write_all(&chunk).await?;
    }
    file.flush().await?;
    file.sync_all().await?;
    Ok(size)
}

async fn discard_file(path: &Path) {
    if let Err(e) = tokio::fs::remove_file(path).await {
        if e.kind() != std::io::ErrorKind::NotFound {
            warn!("Could not remove {}: {}", path.display(), e);
        }
    }
}
