//! Container engine client.
//!
//! [`Engine`] is the narrow set of engine operations the control plane needs.
//! [`DockerEngine`] speaks the versioned Docker API over the local domain
//! socket; tests drive the higher layers through a fake implementing the
//! same trait.

mod docker;
mod error;
#[cfg(test)]
pub(crate) mod fake;

pub use docker::{collect_output, DockerEngine};
pub use error::EngineError;

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::Stream;
use std::collections::HashMap;
use std::pin::Pin;
use tokio_util::sync::CancellationToken;

/// A streamed tar archive moving in or out of a container.
pub type ByteStream = Pin<Box<dyn Stream<Item = Result<Bytes, EngineError>> + Send>>;

/// Everything needed to create the managed container.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ContainerSpec {
    pub image: String,
    pub name: String,
    /// `KEY=VALUE` pairs.
    pub env: Vec<String>,
    /// `host:container[:mode]` bind mounts.
    pub binds: Vec<String>,
    pub network_mode: Option<String>,
    /// `hostname:ip` entries added to the container's hosts file.
    pub extra_hosts: Vec<String>,
    pub port_bindings: Vec<PortBinding>,
    pub labels: HashMap<String, String>,
}

/// A published container port.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortBinding {
    pub container_port: u16,
    pub host_port: u16,
}

/// Result of inspecting a container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerState {
    pub running: bool,
    /// Engine status word (`running`, `exited`, `created`, ...).
    pub status: String,
}

/// One entry from a container listing.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ContainerSummary {
    pub id: String,
    /// Names as reported by the engine, with their leading `/`.
    pub names: Vec<String>,
    /// Engine state word (`running`, `exited`, ...).
    pub state: String,
    pub labels: HashMap<String, String>,
}

impl ContainerSummary {
    /// Returns true if the container is running.
    pub fn is_running(&self) -> bool {
        self.state == "running"
    }

    /// Returns true if one of the names equals `name`, ignoring the leading `/`.
    pub fn has_name(&self, name: &str) -> bool {
        self.names
            .iter()
            .any(|n| n.trim_start_matches('/') == name)
    }
}

/// Operations the control plane performs against the container engine.
#[async_trait]
pub trait Engine: Send + Sync {
    /// Creates (but does not start) a container and returns its id.
    async fn create_container(&self, spec: &ContainerSpec) -> Result<String, EngineError>;

    /// Starts a container. Already-started is success.
    async fn start_container(&self, id: &str) -> Result<(), EngineError>;

    /// Stops a container, letting the engine force-kill after `timeout_secs`.
    /// Already-stopped and already-gone are success.
    async fn stop_container(&self, id: &str, timeout_secs: i64) -> Result<(), EngineError>;

    /// Removes a container. Already-gone is success.
    async fn remove_container(&self, id: &str, force: bool) -> Result<(), EngineError>;

    /// Inspects a container. Any error means the caller's handle is stale.
    async fn inspect_container(&self, id: &str) -> Result<ContainerState, EngineError>;

    /// Lists containers (running or not) matching the engine-side filters.
    async fn list_containers(
        &self,
        filters: HashMap<String, Vec<String>>,
    ) -> Result<Vec<ContainerSummary>, EngineError>;

    /// Runs `cmd` inside the container and returns stdout and stderr
    /// concatenated in arrival order. A non-zero exit status is an
    /// [`EngineError::Exec`] carrying that output.
    async fn exec(&self, id: &str, cmd: &[String]) -> Result<String, EngineError>;

    /// Starts `cmd` inside the container without waiting; returns the exec id.
    async fn exec_detached(&self, id: &str, cmd: &[String]) -> Result<String, EngineError>;

    /// Streams a tar archive of `path` out of the container.
    async fn get_archive(&self, id: &str, path: &str) -> Result<ByteStream, EngineError>;

    /// Extracts the streamed tar archive into `path` inside the container.
    async fn put_archive(&self, id: &str, path: &str, archive: ByteStream)
        -> Result<(), EngineError>;

    /// Follows the container logs, calling `on_line` per non-empty line until
    /// the stream ends or `cancel` fires.
    async fn stream_logs(
        &self,
        id: &str,
        on_line: &mut (dyn for<'a> FnMut(&'a str) + Send),
        cancel: CancellationToken,
    ) -> Result<(), EngineError>;
}

/// Splits incoming text chunks into complete lines.
///
/// Chunk boundaries from the engine do not line up with newlines, so partial
/// lines are held until their terminator arrives.
#[derive(Debug, Default)]
pub struct LineBuffer {
    pending: String,
}

impl LineBuffer {
    /// Appends `chunk` and returns every line it completed, without the
    /// trailing newline. Blank lines are dropped.
    pub fn push(&mut self, chunk: &str) -> Vec<String> {
        self.pending.push_str(chunk);
        let mut lines = Vec::new();
        while let Some(pos) = self.pending.find('\n') {
            let line: String = self.pending.drain(..=pos).collect();
            let line = line.trim_end_matches(['\n', '\r']);
            if !line.trim().is_empty() {
                lines.push(line.to_string());
            }
        }
        lines
    }

    /// Returns the unterminated remainder, if it holds anything visible.
    pub fn finish(self) -> Option<String> {
        let rest = self.pending.trim_end_matches(['\n', '\r']);
        if rest.trim().is_empty() {
            None
        } else {
            Some(rest.to_string())
        }
    }
}
