//! Read-only browsing of the container workspace.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::path::Path;
use std::sync::Arc;

use crate::engine::EngineError;
use crate::sandbox::SandboxManager;

/// Errors from workspace browsing.
#[derive(Debug, thiserror::Error)]
pub enum FilesError {
    #[error("Sandbox not running")]
    NotRunning,

    #[error("Path must be under {root}")]
    OutsideWorkspace { root: String },

    #[error("Path must not contain '..'")]
    Traversal,

    #[error(transparent)]
    Engine(#[from] EngineError),
}

impl FilesError {
    /// Returns true for rejected paths.
    pub fn is_invalid_path(&self) -> bool {
        matches!(self, Self::OutsideWorkspace { .. } | Self::Traversal)
    }
}

/// Rejects paths outside `root` or containing parent references.
pub fn validate_path(path: &str, root: &str) -> Result<(), FilesError> {
    if path.contains("..") {
        return Err(FilesError::Traversal);
    }
    let root = root.trim_end_matches('/');
    let inside = path == root
        || path
            .strip_prefix(root)
            .is_some_and(|rest| rest.starts_with('/'));
    if !inside {
        return Err(FilesError::OutsideWorkspace {
            root: root.to_string(),
        });
    }
    Ok(())
}

/// Content type for a file name, by extension.
pub fn mime_type(path: &str) -> &'static str {
    let ext = Path::new(path)
        .extension()
        .and_then(|e| e.to_str())
        .map(str::to_ascii_lowercase)
        .unwrap_or_default();
    match ext.as_str() {
        "svg" => "image/svg+xml",
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "gif" => "image/gif",
        "webp" => "image/webp",
        "html" => "text/html",
        _ => "application/octet-stream",
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EntryKind {
    Directory,
    File,
}

/// One entry of a directory listing.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FileEntry {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: EntryKind,
    pub size: u64,
    pub modified: Option<DateTime<Utc>>,
}

/// `find -printf` format producing `type\tsize\tmtime\tname` lines.
const LISTING_FORMAT: &str = "%y\\t%s\\t%T@\\t%f\\n";

/// Parses `find` output. The first line is the directory itself and is
/// skipped; directories sort before files, then by name.
fn parse_listing(output: &str) -> Vec<FileEntry> {
    let mut entries: Vec<FileEntry> = output
        .lines()
        .filter(|l| !l.trim().is_empty())
        .skip(1)
        .filter_map(|line| {
            let mut fields = line.splitn(4, '\t');
            let kind = match fields.next()? {
                "d" => EntryKind::Directory,
                _ => EntryKind::File,
            };
            let size = fields.next()?.parse().unwrap_or(0);
            let modified = fields
                .next()?
                .parse::<f64>()
                .ok()
                .and_then(|secs| DateTime::from_timestamp_millis((secs * 1000.0) as i64));
            let name = fields.next()?.to_string();
            Some(FileEntry {
                name,
                kind,
                size,
                modified,
            })
        })
        .collect();
    entries.sort_by(|a, b| a.kind.cmp(&b.kind).then_with(|| a.name.cmp(&b.name)));
    entries
}

/// Lists and reads files inside the running container.
pub struct WorkspaceFiles {
    sandbox: Arc<SandboxManager>,
}

impl WorkspaceFiles {
    pub fn new(sandbox: Arc<SandboxManager>) -> Self {
        Self { sandbox }
    }

    fn root(&self) -> &str {
        &self.sandbox.config().workspace
    }

    async fn container(&self) -> Result<String, FilesError> {
        self.sandbox
            .require_running()
            .await
            .map_err(|_| FilesError::NotRunning)
    }

    /// Lists one directory level; `None` means the workspace root.
    pub async fn list(&self, path: Option<&str>) -> Result<Vec<FileEntry>, FilesError> {
        let path = path.unwrap_or(self.root());
        validate_path(path, self.root())?;
        let id = self.container().await?;

        let cmd: Vec<String> = ["find", path, "-maxdepth", "1", "-printf", LISTING_FORMAT]
            .iter()
            .map(|s| (*s).to_string())
            .collect();
        let output = self.sandbox.engine().exec(&id, &cmd).await?;
        Ok(parse_listing(&output))
    }

    /// Reads a text file.
    pub async fn read(&self, path: &str) -> Result<String, FilesError> {
        validate_path(path, self.root())?;
        let id = self.container().await?;
        let cmd = vec!["cat".to_string(), path.to_string()];
        Ok(self.sandbox.engine().exec(&id, &cmd).await?)
    }
}
