//! Lifecycle of the one managed container.

use futures_util::StreamExt;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tokio::sync::{Mutex, MutexGuard};
use tracing::{debug, info, warn};

use super::SandboxError;
use crate::agent::AgentVariant;
use crate::config::SandboxConfig;
use crate::engine::{ByteStream, ContainerSpec, Engine, EngineError, PortBinding};

/// Label carrying the agent variant so a restarted control plane can recover it.
pub const AGENT_LABEL: &str = "goku.agent";
const MANAGED_LABEL: &str = "goku.managed";

/// The container this process currently owns.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ContainerHandle {
    pub container_id: String,
    pub agent: AgentVariant,
}

/// Observed container state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SandboxState {
    NotRunning,
    Running,
    /// The container exists but is not running.
    Stopped,
}

impl std::fmt::Display for SandboxState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NotRunning => write!(f, "not running"),
            Self::Running => write!(f, "running"),
            Self::Stopped => write!(f, "stopped"),
        }
    }
}

/// Answer to a status query.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SandboxStatus {
    pub state: SandboxState,
    pub container_id: Option<String>,
    pub agent: Option<AgentVariant>,
}

impl SandboxStatus {
    fn not_running() -> Self {
        Self {
            state: SandboxState::NotRunning,
            container_id: None,
            agent: None,
        }
    }
}

/// Where the workspace archive is extracted on restore.
///
/// The engine names archive entries relative to the parent of the requested
/// path, so a capture of `/workspace` holds `workspace/...`.
pub fn archive_parent(workspace: &str) -> &str {
    let trimmed = workspace.trim_end_matches('/');
    match trimmed.rfind('/') {
        Some(0) | None => "/",
        Some(idx) => &trimmed[..idx],
    }
}

/// Single-writer owner of the managed container.
///
/// Every operation holds the handle lock for its whole duration, so a start
/// completes or fails before a following stop is looked at. A capture holds
/// it until its archive stream is consumed or dropped.
pub struct SandboxManager {
    engine: Arc<dyn Engine>,
    config: SandboxConfig,
    binds: Vec<String>,
    handle: Arc<Mutex<Option<ContainerHandle>>>,
}

impl SandboxManager {
    /// Creates a manager; bind mounts are resolved once here.
    pub fn new(engine: Arc<dyn Engine>, config: SandboxConfig) -> anyhow::Result<Self> {
        let binds = config.binds()?;
        Ok(Self {
            engine,
            config,
            binds,
            handle: Arc::new(Mutex::new(None)),
        })
    }

    pub fn config(&self) -> &SandboxConfig {
        &self.config
    }

    pub fn engine(&self) -> &Arc<dyn Engine> {
        &self.engine
    }

    /// The current handle without re-verifying it.
    pub async fn handle(&self) -> Option<ContainerHandle> {
        self.handle.lock().await.clone()
    }

    /// Id of the running container, or `NotRunning`.
    pub async fn require_running(&self) -> Result<String, SandboxError> {
        self.handle
            .lock()
            .await
            .as_ref()
            .map(|h| h.container_id.clone())
            .ok_or(SandboxError::NotRunning)
    }

    fn container_spec(&self, agent: AgentVariant, env: &BTreeMap<String, String>) -> ContainerSpec {
        let mut vars = vec![
            format!("CONTROL_PLANE_URL={}", self.config.callback_url),
            format!("AGENT_TYPE={agent}"),
        ];
        vars.extend(
            env.iter()
                .filter(|(key, _)| key.as_str() != "CONTROL_PLANE_URL" && key.as_str() != "AGENT_TYPE")
                .map(|(key, value)| format!("{key}={value}")),
        );

        let network_mode = Some(self.config.network_mode.clone()).filter(|m| !m.is_empty());

        ContainerSpec {
            image: self.config.image.clone(),
            name: self.config.container_name.clone(),
            env: vars,
            binds: self.binds.clone(),
            network_mode,
            extra_hosts: self.config.extra_hosts.clone(),
            port_bindings: self
                .config
                .ports
                .iter()
                .map(|p| PortBinding {
                    container_port: p.container,
                    host_port: p.host,
                })
                .collect(),
            labels: HashMap::from([
                (AGENT_LABEL.to_string(), agent.to_string()),
                (MANAGED_LABEL.to_string(), "true".to_string()),
            ]),
        }
    }

    /// Starts a fresh container, stopping the current one first.
    pub async fn start(
        &self,
        agent: AgentVariant,
        env: &BTreeMap<String, String>,
    ) -> Result<String, SandboxError> {
        let mut handle = self.handle.lock().await;
        self.stop_locked(&mut handle).await?;

        let spec = self.container_spec(agent, env);
        let id = self.engine.create_container(&spec).await?;
        debug!("Created container {} ({})", short_id(&id), spec.name);

        if let Err(e) = self.engine.start_container(&id).await {
            self.discard(&id).await;
            return Err(e.into());
        }

        info!("Started {} sandbox {}", agent, short_id(&id));
        *handle = Some(ContainerHandle {
            container_id: id.clone(),
            agent,
        });
        Ok(id)
    }

    /// Stops and removes the current container. No-op when none is held.
    pub async fn stop(&self) -> Result<(), SandboxError> {
        let mut handle = self.handle.lock().await;
        self.stop_locked(&mut handle).await
    }

    async fn stop_locked(
        &self,
        handle: &mut MutexGuard<'_, Option<ContainerHandle>>,
    ) -> Result<(), SandboxError> {
        // The handle is released before any engine call so a half-finished
        // teardown never leaves a phantom container behind.
        let Some(current) = handle.take() else {
            return Ok(());
        };
        let id = current.container_id;

        let stopped = self
            .engine
            .stop_container(&id, self.config.stop_timeout_secs)
            .await;
        if let Err(e) = &stopped {
            warn!("Stopping {} failed: {}", short_id(&id), e);
        }
        let removed = self.engine.remove_container(&id, true).await;

        stopped?;
        removed?;
        info!("Stopped sandbox {}", short_id(&id));
        Ok(())
    }

    async fn discard(&self, id: &str) {
        if let Err(e) = self.engine.remove_container(id, true).await {
            debug!("Could not remove half-created container {}: {}", short_id(id), e);
        }
    }

    /// Re-verifies the held container.
    ///
    /// Never fails: an inspection error clears the handle and reports
    /// not-running.
    pub async fn status(&self) -> SandboxStatus {
        let mut handle = self.handle.lock().await;
        let Some(current) = handle.clone() else {
            return SandboxStatus::not_running();
        };

        match self.engine.inspect_container(&current.container_id).await {
            Ok(state) => SandboxStatus {
                state: if state.running {
                    SandboxState::Running
                } else {
                    SandboxState::Stopped
                },
                container_id: Some(current.container_id),
                agent: Some(current.agent),
            },
            Err(e) => {
                info!(
                    "Dropping stale handle {}: {}",
                    short_id(&current.container_id),
                    e
                );
                *handle = None;
                SandboxStatus::not_running()
            }
        }
    }

    /// Streams a tar archive of the workspace out of the running container.
    ///
    /// Other lifecycle operations wait until the returned stream is dropped.
    pub async fn snapshot_capture(&self) -> Result<(ByteStream, AgentVariant), SandboxError> {
        let handle = Arc::clone(&self.handle).lock_owned().await;
        let current = handle.clone().ok_or(SandboxError::NotRunning)?;
        let stream = self
            .engine
            .get_archive(&current.container_id, &self.config.workspace)
            .await?;
        let guarded = stream.map(move |chunk| {
            let _held = &handle;
            chunk
        });
        Ok((Box::pin(guarded), current.agent))
    }

    /// Replaces the current container with one seeded from `archive`.
    ///
    /// The archive is extracted before the container starts so the agent
    /// sees the restored files on boot.
    pub async fn snapshot_restore(
        &self,
        agent: AgentVariant,
        env: &BTreeMap<String, String>,
        archive: ByteStream,
    ) -> Result<String, SandboxError> {
        let mut handle = self.handle.lock().await;
        self.stop_locked(&mut handle).await?;

        let spec = self.container_spec(agent, env);
        let id = self.engine.create_container(&spec).await?;

        let target = archive_parent(&self.config.workspace);
        if let Err(e) = self.engine.put_archive(&id, target, archive).await {
            self.discard(&id).await;
            return Err(e.into());
        }
        if let Err(e) = self.engine.start_container(&id).await {
            self.discard(&id).await;
            return Err(e.into());
        }

        info!("Restored {} sandbox {}", agent, short_id(&id));
        *handle = Some(ContainerHandle {
            container_id: id.clone(),
            agent,
        });
        Ok(id)
    }

    /// Adopts a running container left behind by a previous process.
    ///
    /// Exited containers holding the managed name are removed so the name is
    /// free for the next start. Only adopts when exactly one running
    /// container carries the name. Returns the adopted handle.
    pub async fn reconnect(&self) -> Result<Option<ContainerHandle>, EngineError> {
        let mut handle = self.handle.lock().await;
        if handle.is_some() {
            return Ok(handle.clone());
        }

        let name = &self.config.container_name;
        let filters = HashMap::from([("name".to_string(), vec![name.clone()])]);
        let (running, exited): (Vec<_>, Vec<_>) = self
            .engine
            .list_containers(filters)
            .await?
            .into_iter()
            .filter(|c| c.has_name(name))
            .partition(|c| c.is_running());

        for leftover in &exited {
            info!(
                "Removing exited sandbox {} ({})",
                short_id(&leftover.id),
                leftover.state
            );
            self.engine.remove_container(&leftover.id, true).await?;
        }

        let [container] = running.as_slice() else {
            if running.len() > 1 {
                warn!(
                    "Found {} running containers named {}, not adopting any",
                    running.len(),
                    name
                );
            }
            return Ok(None);
        };

        let agent = match container.labels.get(AGENT_LABEL).map(|v| v.parse::<AgentVariant>()) {
            Some(Ok(agent)) => agent,
            _ => {
                warn!(
                    "Container {} has no usable {} label, assuming {}",
                    short_id(&container.id),
                    AGENT_LABEL,
                    AgentVariant::default()
                );
                AgentVariant::default()
            }
        };

        info!("Reconnected to {} sandbox {}", agent, short_id(&container.id));
        let adopted = ContainerHandle {
            container_id: container.id.clone(),
            agent,
        };
        *handle = Some(adopted.clone());
        Ok(Some(adopted))
    }
}

fn short_id(id: &str) -> &str {
    id.get(..12).unwrap_or(id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PortMapping;
    use crate::engine::fake::{FakeContainer, FakeEngine};
    use std::time::Duration;

    fn manager() -> (Arc<FakeEngine>, SandboxManager) {
        let engine = Arc::new(FakeEngine::new());
        let manager = SandboxManager::new(engine.clone(), SandboxConfig::default()).unwrap();
        (engine, manager)
    }

    fn no_env() -> BTreeMap<String, String> {
        BTreeMap::new()
    }

    #[test]
    fn test_archive_parent() {
        assert_eq!(archive_parent("/workspace"), "/");
        assert_eq!(archive_parent("/home/agent/work/"), "/home/agent");
    }

    #[test]
    fn test_container_spec_env_and_labels() {
        let engine = Arc::new(FakeEngine::new());
        let mut config = SandboxConfig::default();
        config.ports = vec![PortMapping {
            container: 8080,
            host: 18080,
        }];
        let manager = SandboxManager::new(engine, config).unwrap();

        let env = BTreeMap::from([
            ("GOOSE_MODE".to_string(), "auto".to_string()),
            ("AGENT_TYPE".to_string(), "spoofed".to_string()),
        ]);
        let spec = manager.container_spec(AgentVariant::Goose, &env);

        assert_eq!(spec.name, "goku-sandbox");
        assert_eq!(spec.image, "goku-sandbox:latest");
        assert_eq!(
            spec.env,
            vec![
                "CONTROL_PLANE_URL=http://host.docker.internal:3000",
                "AGENT_TYPE=goose",
                "GOOSE_MODE=auto",
            ]
        );
        assert_eq!(spec.extra_hosts, vec!["host.docker.internal:host-gateway"]);
        assert_eq!(spec.network_mode.as_deref(), Some("host"));
        assert_eq!(spec.labels.get(AGENT_LABEL).map(String::as_str), Some("goose"));
        assert_eq!(spec.port_bindings[0].host_port, 18080);
    }

    #[tokio::test]
    async fn test_start_sets_handle_after_start() {
        let (engine, manager) = manager();
        let id = manager.start(AgentVariant::OpenCode, &no_env()).await.unwrap();

        assert_eq!(engine.calls(), vec!["create:goku-sandbox", format!("start:{id}").as_str()]);
        let handle = manager.handle().await.unwrap();
        assert_eq!(handle.container_id, id);
        assert_eq!(handle.agent, AgentVariant::OpenCode);
    }

    #[tokio::test]
    async fn test_start_while_running_leaves_exactly_one_container() {
        let (engine, manager) = manager();
        let first = manager.start(AgentVariant::OpenCode, &no_env()).await.unwrap();
        let second = manager.start(AgentVariant::Goose, &no_env()).await.unwrap();
        let third = manager.start(AgentVariant::OpenCode, &no_env()).await.unwrap();

        assert_ne!(first, second);
        assert_ne!(second, third);
        assert_eq!(engine.running_count(), 1);
        assert_eq!(engine.container_ids(), vec![third.clone()]);
        assert_eq!(engine.count("stop"), 2);
        assert_eq!(manager.require_running().await.unwrap(), third);
    }

    #[tokio::test]
    async fn test_stop_when_not_running_is_noop() {
        let (engine, manager) = manager();
        manager.stop().await.unwrap();
        assert!(engine.calls().is_empty());
    }

    #[tokio::test]
    async fn test_stop_clears_handle_even_on_failure() {
        let (engine, manager) = manager();
        let id = manager.start(AgentVariant::OpenCode, &no_env()).await.unwrap();
        engine.fail_on("stop", "daemon hiccup");

        let err = manager.stop().await.unwrap_err();
        assert!(matches!(err, SandboxError::Engine(_)));
        assert!(manager.handle().await.is_none());
        // Removal is still attempted.
        assert_eq!(engine.count("remove"), 1);
        assert!(engine.container(&id).is_none());
    }

    #[tokio::test]
    async fn test_status_reports_running_and_stopped() {
        let (engine, manager) = manager();
        let id = manager.start(AgentVariant::Goose, &no_env()).await.unwrap();

        let status = manager.status().await;
        assert_eq!(status.state, SandboxState::Running);
        assert_eq!(status.container_id.as_deref(), Some(id.as_str()));
        assert_eq!(status.agent, Some(AgentVariant::Goose));

        engine.stop_container(&id, 0).await.unwrap();
        let status = manager.status().await;
        assert_eq!(status.state, SandboxState::Stopped);
        assert!(manager.handle().await.is_some());
    }

    #[tokio::test]
    async fn test_status_heals_stale_handle() {
        let (engine, manager) = manager();
        let id = manager.start(AgentVariant::OpenCode, &no_env()).await.unwrap();
        engine.vanish(&id);

        let status = manager.status().await;
        assert_eq!(status, SandboxStatus::not_running());
        assert!(manager.handle().await.is_none());

        // The next start must not try to stop the phantom.
        let before = engine.count("stop");
        manager.start(AgentVariant::OpenCode, &no_env()).await.unwrap();
        assert_eq!(engine.count("stop"), before);
    }

    #[tokio::test]
    async fn test_failed_start_cleans_up_and_keeps_no_handle() {
        let (engine, manager) = manager();
        engine.fail_on("start", "port already allocated");

        let err = manager.start(AgentVariant::OpenCode, &no_env()).await.unwrap_err();
        assert!(err.to_string().contains("port already allocated"));
        assert!(manager.handle().await.is_none());
        assert!(engine.container_ids().is_empty());
    }

    #[tokio::test]
    async fn test_capture_requires_running_container() {
        let (_engine, manager) = manager();
        let err = manager.snapshot_capture().await.err().unwrap();
        assert!(err.is_not_running());
    }

    #[tokio::test]
    async fn test_restore_injects_archive_before_start() {
        let (engine, manager) = manager();
        let original = manager.start(AgentVariant::Goose, &no_env()).await.unwrap();
        engine.write_file(&original, "/workspace/notes.md", b"# notes");
        engine.write_file(&original, "/workspace/src/lib.rs", b"pub fn f() {}");

        let (mut archive, agent) = manager.snapshot_capture().await.unwrap();
        let mut bytes = Vec::new();
        while let Some(chunk) = archive.next().await {
            bytes.extend_from_slice(&chunk.unwrap());
        }
        drop(archive);

        let replay: ByteStream = Box::pin(futures_util::stream::iter(vec![Ok(
            bytes::Bytes::from(bytes),
        )]));
        let restored = manager
            .snapshot_restore(agent, &no_env(), replay)
            .await
            .unwrap();

        let calls = engine.calls();
        let put = calls.iter().position(|c| c == "put_archive:/").unwrap();
        let start = calls
            .iter()
            .position(|c| *c == format!("start:{restored}"))
            .unwrap();
        assert!(put < start);
        assert_eq!(
            engine.file_names(&restored),
            vec!["/workspace/notes.md", "/workspace/src/lib.rs"]
        );
        assert!(engine.container(&original).is_none());
        assert_eq!(manager.handle().await.unwrap().agent, AgentVariant::Goose);
    }

    #[tokio::test]
    async fn test_reconnect_adopts_single_running_container() {
        let (engine, manager) = manager();
        engine.insert_container(
            "abc123",
            FakeContainer {
                name: "goku-sandbox".to_string(),
                running: true,
                labels: HashMap::from([(AGENT_LABEL.to_string(), "goose".to_string())]),
                ..FakeContainer::default()
            },
        );
        engine.insert_container(
            "other",
            FakeContainer {
                name: "goku-sandbox-old".to_string(),
                running: true,
                ..FakeContainer::default()
            },
        );

        let adopted = manager.reconnect().await.unwrap().unwrap();
        assert_eq!(adopted.container_id, "abc123");
        assert_eq!(adopted.agent, AgentVariant::Goose);
        assert_eq!(manager.status().await.state, SandboxState::Running);
    }

    #[tokio::test]
    async fn test_reconnect_removes_exited_container() {
        let (engine, manager) = manager();
        engine.insert_container(
            "abc123",
            FakeContainer {
                name: "goku-sandbox".to_string(),
                running: false,
                ..FakeContainer::default()
            },
        );
        assert!(manager.reconnect().await.unwrap().is_none());
        assert!(manager.handle().await.is_none());
        assert!(engine.container("abc123").is_none());
        assert_eq!(engine.count("remove"), 1);

        // The managed name is free again
        let id = manager.start(AgentVariant::OpenCode, &no_env()).await.unwrap();
        assert_eq!(engine.running_count(), 1);
        assert_eq!(manager.handle().await.unwrap().container_id, id);
    }

    #[tokio::test]
    async fn test_reconnect_adopts_running_and_clears_exited() {
        let (engine, manager) = manager();
        engine.insert_container(
            "old",
            FakeContainer {
                name: "goku-sandbox".to_string(),
                running: false,
                ..FakeContainer::default()
            },
        );
        engine.insert_container(
            "live",
            FakeContainer {
                name: "goku-sandbox".to_string(),
                running: true,
                ..FakeContainer::default()
            },
        );

        let adopted = manager.reconnect().await.unwrap().unwrap();
        assert_eq!(adopted.container_id, "live");
        assert_eq!(engine.container_ids(), vec!["live".to_string()]);
    }

    #[tokio::test]
    async fn test_capture_blocks_lifecycle_until_archive_dropped() {
        let (engine, manager) = manager();
        let id = manager.start(AgentVariant::OpenCode, &no_env()).await.unwrap();
        engine.write_file(&id, "/workspace/a.txt", b"alpha");

        let (archive, _agent) = manager.snapshot_capture().await.unwrap();
        let blocked = tokio::time::timeout(Duration::from_millis(50), manager.stop()).await;
        assert!(blocked.is_err());
        assert_eq!(engine.count("stop"), 0);

        drop(archive);
        manager.stop().await.unwrap();
        assert_eq!(engine.count("stop"), 1);
        assert!(manager.handle().await.is_none());
    }
}
