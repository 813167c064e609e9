//! In-memory engine for tests.
//!
//! Keeps a table of containers with a flat file map per container so archive
//! transfer, exec and lifecycle calls can be asserted without a daemon.

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::StreamExt;
use std::collections::{BTreeMap, HashMap};
use std::io::Read;
use std::sync::Mutex;
use tokio_util::sync::CancellationToken;

use super::{ByteStream, ContainerSpec, ContainerState, ContainerSummary, Engine, EngineError};

/// A container known to the fake engine.
#[derive(Debug, Clone, Default)]
pub(crate) struct FakeContainer {
    pub name: String,
    pub running: bool,
    pub env: Vec<String>,
    pub labels: HashMap<String, String>,
    /// Absolute path -> contents.
    pub files: BTreeMap<String, Vec<u8>>,
}

#[derive(Debug, Default)]
struct FakeState {
    containers: BTreeMap<String, FakeContainer>,
    calls: Vec<String>,
    next_id: usize,
    exec_results: HashMap<String, Result<String, String>>,
    failures: HashMap<&'static str, String>,
    log_lines: Vec<String>,
    hold_logs_open: bool,
}

/// A fake engine that records every call.
#[derive(Debug, Default)]
pub(crate) struct FakeEngine {
    state: Mutex<FakeState>,
}

impl FakeEngine {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, FakeState> {
        self.state.lock().unwrap()
    }

    /// Operations performed so far, formatted as `op:arg`.
    pub fn calls(&self) -> Vec<String> {
        self.lock().calls.clone()
    }

    /// Number of recorded calls for `op`.
    pub fn count(&self, op: &str) -> usize {
        let prefix = format!("{op}:");
        self.lock()
            .calls
            .iter()
            .filter(|c| c.starts_with(&prefix))
            .count()
    }

    /// Makes every later `op` call fail with a protocol error.
    pub fn fail_on(&self, op: &'static str, message: &str) {
        self.lock().failures.insert(op, message.to_string());
    }

    /// Clears a failure set with [`fail_on`](Self::fail_on).
    pub fn heal(&self, op: &'static str) {
        self.lock().failures.remove(op);
    }

    /// Sets the result for an exec whose argv joined by spaces equals `cmd`.
    pub fn set_exec(&self, cmd: &str, result: Result<&str, &str>) {
        self.lock().exec_results.insert(
            cmd.to_string(),
            result.map(str::to_string).map_err(str::to_string),
        );
    }

    /// Lines replayed by `stream_logs`.
    pub fn set_logs(&self, lines: &[&str], hold_open: bool) {
        let mut state = self.lock();
        state.log_lines = lines.iter().map(|l| (*l).to_string()).collect();
        state.hold_logs_open = hold_open;
    }

    /// Registers a container as if another process had created it.
    pub fn insert_container(&self, id: &str, container: FakeContainer) {
        self.lock().containers.insert(id.to_string(), container);
    }

    /// Deletes a container behind the manager's back.
    pub fn vanish(&self, id: &str) {
        self.lock().containers.remove(id);
    }

    pub fn container(&self, id: &str) -> Option<FakeContainer> {
        self.lock().containers.get(id).cloned()
    }

    pub fn container_ids(&self) -> Vec<String> {
        self.lock().containers.keys().cloned().collect()
    }

    pub fn running_count(&self) -> usize {
        self.lock()
            .containers
            .values()
            .filter(|c| c.running)
            .count()
    }

    pub fn write_file(&self, id: &str, path: &str, contents: &[u8]) {
        if let Some(container) = self.lock().containers.get_mut(id) {
            container.files.insert(path.to_string(), contents.to_vec());
        }
    }

    pub fn file_names(&self, id: &str) -> Vec<String> {
        self.lock()
            .containers
            .get(id)
            .map(|c| c.files.keys().cloned().collect())
            .unwrap_or_default()
    }

    fn record(&self, op: &'static str, arg: &str) -> Result<(), EngineError> {
        let mut state = self.lock();
        state.calls.push(format!("{op}:{arg}"));
        match state.failures.get(op) {
            Some(message) => Err(EngineError::protocol(op, 500, message.clone())),
            None => Ok(()),
        }
    }
}

fn parent_of(path: &str) -> &str {
    let trimmed = path.trim_end_matches('/');
    match trimmed.rfind('/') {
        Some(0) | None => "/",
        Some(idx) => &trimmed[..idx],
    }
}

fn build_tar(files: &BTreeMap<String, Vec<u8>>, root: &str) -> Vec<u8> {
    let base = parent_of(root);
    let mut builder = tar::Builder::new(Vec::new());
    for (path, data) in files {
        if !path.starts_with(root) {
            continue;
        }
        let name = path
            .strip_prefix(base)
            .unwrap_or(path)
            .trim_start_matches('/');
        let mut header = tar::Header::new_gnu();
        header.set_size(data.len() as u64);
        header.set_mode(0o644);
        builder.append_data(&mut header, name, &data[..]).unwrap();
    }
    builder.into_inner().unwrap()
}

fn extract_tar(bytes: &[u8], dest: &str) -> Result<Vec<(String, Vec<u8>)>, EngineError> {
    let mut archive = tar::Archive::new(bytes);
    let mut files = Vec::new();
    let entries = archive
        .entries()
        .map_err(|e| EngineError::transfer(e.to_string()))?;
    for entry in entries {
        let mut entry = entry.map_err(|e| EngineError::transfer(e.to_string()))?;
        if !entry.header().entry_type().is_file() {
            continue;
        }
        let name = entry
            .path()
            .map_err(|e| EngineError::transfer(e.to_string()))?
            .to_string_lossy()
            .into_owned();
        let mut data = Vec::new();
        entry
            .read_to_end(&mut data)
            .map_err(|e| EngineError::transfer(e.to_string()))?;
        let full = format!("{}/{}", dest.trim_end_matches('/'), name);
        files.push((full, data));
    }
    Ok(files)
}

#[async_trait]
impl Engine for FakeEngine {
    async fn create_container(&self, spec: &ContainerSpec) -> Result<String, EngineError> {
        self.record("create", &spec.name)?;
        let mut state = self.lock();
        if state.containers.values().any(|c| c.name == spec.name) {
            return Err(EngineError::protocol(
                "create",
                409,
                format!("Conflict. The container name \"/{}\" is already in use", spec.name),
            ));
        }
        state.next_id += 1;
        let id = format!("container-{}", state.next_id);
        state.containers.insert(
            id.clone(),
            FakeContainer {
                name: spec.name.clone(),
                running: false,
                env: spec.env.clone(),
                labels: spec.labels.clone(),
                files: BTreeMap::new(),
            },
        );
        Ok(id)
    }

    async fn start_container(&self, id: &str) -> Result<(), EngineError> {
        self.record("start", id)?;
        match self.lock().containers.get_mut(id) {
            Some(container) => {
                container.running = true;
                Ok(())
            }
            None => Err(EngineError::not_found(id)),
        }
    }

    async fn stop_container(&self, id: &str, _timeout_secs: i64) -> Result<(), EngineError> {
        self.record("stop", id)?;
        if let Some(container) = self.lock().containers.get_mut(id) {
            container.running = false;
        }
        Ok(())
    }

    async fn remove_container(&self, id: &str, _force: bool) -> Result<(), EngineError> {
        self.record("remove", id)?;
        self.lock().containers.remove(id);
        Ok(())
    }

    async fn inspect_container(&self, id: &str) -> Result<ContainerState, EngineError> {
        self.record("inspect", id)?;
        match self.lock().containers.get(id) {
            Some(container) => Ok(ContainerState {
                running: container.running,
                status: if container.running { "running" } else { "exited" }.to_string(),
            }),
            None => Err(EngineError::not_found(id)),
        }
    }

    async fn list_containers(
        &self,
        filters: HashMap<String, Vec<String>>,
    ) -> Result<Vec<ContainerSummary>, EngineError> {
        self.record("list", "")?;
        let names = filters.get("name").cloned().unwrap_or_default();
        Ok(self
            .lock()
            .containers
            .iter()
            .filter(|(_, c)| names.iter().all(|n| c.name.contains(n.as_str())))
            .map(|(id, c)| ContainerSummary {
                id: id.clone(),
                names: vec![format!("/{}", c.name)],
                state: if c.running { "running" } else { "exited" }.to_string(),
                labels: c.labels.clone(),
            })
            .collect())
    }

    async fn exec(&self, id: &str, cmd: &[String]) -> Result<String, EngineError> {
        let joined = cmd.join(" ");
        self.record("exec", &joined)?;
        let state = self.lock();
        let container = state
            .containers
            .get(id)
            .ok_or_else(|| EngineError::not_found(id))?;
        if let Some(result) = state.exec_results.get(&joined) {
            return result.clone().map_err(EngineError::exec);
        }
        if cmd.first().map(String::as_str) == Some("cat") {
            let path = cmd.get(1).cloned().unwrap_or_default();
            return container
                .files
                .get(&path)
                .map(|data| String::from_utf8_lossy(data).into_owned())
                .ok_or_else(|| EngineError::exec(format!("cat: {path}: No such file or directory")));
        }
        Ok(String::new())
    }

    async fn exec_detached(&self, id: &str, cmd: &[String]) -> Result<String, EngineError> {
        self.record("exec_detached", &cmd.join(" "))?;
        if !self.lock().containers.contains_key(id) {
            return Err(EngineError::not_found(id));
        }
        Ok(format!("exec-{}", self.count("exec_detached")))
    }

    async fn get_archive(&self, id: &str, path: &str) -> Result<ByteStream, EngineError> {
        self.record("get_archive", path)?;
        let tar = {
            let state = self.lock();
            let container = state
                .containers
                .get(id)
                .ok_or_else(|| EngineError::not_found(id))?;
            build_tar(&container.files, path)
        };
        // Deliver in small chunks to exercise streaming consumers.
        let chunks: Vec<Result<Bytes, EngineError>> = tar
            .chunks(700)
            .map(|c| Ok(Bytes::copy_from_slice(c)))
            .collect();
        Ok(Box::pin(futures_util::stream::iter(chunks)))
    }

    async fn put_archive(
        &self,
        id: &str,
        path: &str,
        mut archive: ByteStream,
    ) -> Result<(), EngineError> {
        self.record("put_archive", path)?;
        let mut bytes = Vec::new();
        while let Some(chunk) = archive.next().await {
            bytes.extend_from_slice(&chunk?);
        }
        let files = extract_tar(&bytes, path)?;
        let mut state = self.lock();
        let container = state
            .containers
            .get_mut(id)
            .ok_or_else(|| EngineError::not_found(id))?;
        for (name, data) in files {
            container.files.insert(name, data);
        }
        Ok(())
    }

    async fn stream_logs(
        &self,
        id: &str,
        on_line: &mut (dyn for<'a> FnMut(&'a str) + Send),
        cancel: CancellationToken,
    ) -> Result<(), EngineError> {
        self.record("logs", id)?;
        let (lines, hold_open) = {
            let state = self.lock();
            (state.log_lines.clone(), state.hold_logs_open)
        };
        for line in &lines {
            if cancel.is_cancelled() {
                return Ok(());
            }
            on_line(line);
        }
        if hold_open {
            cancel.cancelled().await;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parent_of() {
        assert_eq!(parent_of("/workspace"), "/");
        assert_eq!(parent_of("/workspace/"), "/");
        assert_eq!(parent_of("/home/agent/workspace"), "/home/agent");
    }

    #[test]
    fn test_tar_roundtrip_relocates_under_parent() {
        let mut files = BTreeMap::new();
        files.insert("/workspace/a.txt".to_string(), b"alpha".to_vec());
        files.insert("/workspace/src/b.rs".to_string(), b"fn b() {}".to_vec());
        files.insert("/etc/hosts".to_string(), b"ignored".to_vec());

        let tar = build_tar(&files, "/workspace");
        let extracted = extract_tar(&tar, "/").unwrap();
        let names: Vec<_> = extracted.iter().map(|(n, _)| n.as_str()).collect();
        assert_eq!(names, vec!["/workspace/a.txt", "/workspace/src/b.rs"]);
    }
}
