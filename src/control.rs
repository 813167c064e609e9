//! Session-level orchestration.
//!
//! [`ControlPlane`] is built once per process and ties the sandbox, the
//! record store, telemetry, previews and the live feed together. Every
//! container replacement closes the previous session and its open
//! iterations before the new one is recorded.

use serde::Serialize;
use serde_json::json;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::agent::AgentVariant;
use crate::config::Config;
use crate::engine::Engine;
use crate::feed::{kinds, Broadcaster};
use crate::files::WorkspaceFiles;
use crate::mailbox::Mailbox;
use crate::preview::{PreviewController, PreviewStatus};
use crate::sandbox::{
    ContainerHandle, SandboxError, SandboxManager, SandboxStatus, SnapshotService,
};
use crate::store::{Session, SnapshotRecord, Store};
use crate::telemetry::{
    IngestOutcome, IterationReport, Reconciler, Summarizer, TelemetryBatch, TelemetryError,
};

/// Combined status of the sandbox, its session and the preview.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ControlStatus {
    pub sandbox: SandboxStatus,
    pub session: Option<Session>,
    pub preview: PreviewStatus,
}

/// Container environment for a session: host settings for the variant,
/// then operator overrides.
pub fn session_env(
    agent: AgentVariant,
    overrides: &BTreeMap<String, String>,
) -> BTreeMap<String, String> {
    let mut env = agent.env_from_process();
    env.extend(overrides.iter().map(|(k, v)| (k.clone(), v.clone())));
    env
}

pub struct ControlPlane {
    config: Config,
    store: Arc<dyn Store>,
    feed: Broadcaster,
    sandbox: Arc<SandboxManager>,
    reconciler: Reconciler,
    preview: PreviewController,
    snapshots: SnapshotService,
    files: WorkspaceFiles,
    mailbox: Mailbox,
}

impl ControlPlane {
    pub fn new(config: Config, engine: Arc<dyn Engine>, store: Arc<dyn Store>) -> anyhow::Result<Self> {
        let feed = Broadcaster::new(Duration::from_secs(config.feed.heartbeat_secs.max(1)));
        let sandbox = Arc::new(SandboxManager::new(engine, config.sandbox.clone())?);
        let summarizer = Summarizer::from_config(&config.summarizer)?;

        Ok(Self {
            reconciler: Reconciler::new(Arc::clone(&store), feed.clone())
                .with_summarizer(summarizer),
            preview: PreviewController::new(
                Arc::clone(&sandbox),
                feed.clone(),
                config.preview.clone(),
            ),
            snapshots: SnapshotService::new(Arc::clone(&store), config.snapshots.dir.clone()),
            files: WorkspaceFiles::new(Arc::clone(&sandbox)),
            mailbox: Mailbox::new(Arc::clone(&store), feed.clone()),
            config,
            store,
            feed,
            sandbox,
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    pub fn feed(&self) -> &Broadcaster {
        &self.feed
    }

    pub fn sandbox(&self) -> &SandboxManager {
        &self.sandbox
    }

    pub fn preview(&self) -> &PreviewController {
        &self.preview
    }

    pub fn snapshots(&self) -> &SnapshotService {
        &self.snapshots
    }

    pub fn files(&self) -> &WorkspaceFiles {
        &self.files
    }

    pub fn mailbox(&self) -> &Mailbox {
        &self.mailbox
    }

    /// One-shot recovery run before accepting commands.
    ///
    /// Adopts a container left running by a previous process and makes sure
    /// the store's active session matches it.
    pub async fn boot(&self) -> Result<Option<ContainerHandle>, SandboxError> {
        let adopted = self.sandbox.reconnect().await?;
        let active = self.store.active_session()?;

        match (&adopted, active) {
            (Some(handle), Some(session)) if session.id == handle.container_id => {}
            (Some(handle), _) => {
                self.store.end_all_open_sessions()?;
                self.store
                    .create_session(&handle.container_id, handle.agent)?;
                info!("Recorded session for adopted container");
            }
            (None, Some(session)) => {
                let closed = self.store.end_all_open_sessions()?;
                self.store.close_open_iterations()?;
                info!(
                    "Closed {} session(s); container {} is gone",
                    closed, session.id
                );
            }
            (None, None) => {}
        }
        self.store.flush()?;
        Ok(adopted)
    }

    fn close_session_records(&self) -> Result<(), SandboxError> {
        self.store.close_open_iterations()?;
        self.store.end_all_open_sessions()?;
        self.reconciler.reset();
        Ok(())
    }

    fn open_session(&self, id: &str, agent: AgentVariant) -> Result<(), SandboxError> {
        self.store.create_session(id, agent)?;
        self.store.flush()?;
        Ok(())
    }

    /// Starts a fresh container and session.
    pub async fn start_session(
        &self,
        agent: AgentVariant,
        overrides: &BTreeMap<String, String>,
    ) -> Result<String, SandboxError> {
        self.close_session_records()?;
        self.preview.clear().await;

        let id = self.sandbox.start(agent, &session_env(agent, overrides)).await?;
        self.open_session(&id, agent)?;
        self.feed.send(
            kinds::SESSION_START,
            json!({ "containerId": id, "agentType": agent }),
        );
        Ok(id)
    }

    /// Stops the container and closes the session.
    ///
    /// Records are closed even when the engine call fails.
    pub async fn stop_session(&self) -> Result<(), SandboxError> {
        let stopped = self.sandbox.stop().await;
        self.preview.clear().await;
        self.close_session_records()?;
        self.store.flush()?;
        self.feed.send(kinds::SESSION_END, json!({}));
        stopped
    }

    /// Replaces the container with one restored from a snapshot.
    pub async fn restore_snapshot(&self, snapshot_id: i64) -> Result<String, SandboxError> {
        let (record, archive) = self.snapshots.open(snapshot_id).await?;
        let agent = record.agent;

        self.close_session_records()?;
        self.preview.clear().await;

        let id = self
            .sandbox
            .snapshot_restore(agent, &session_env(agent, &BTreeMap::new()), archive)
            .await?;
        self.open_session(&id, agent)?;
        self.feed.send(
            kinds::SESSION_START,
            json!({ "containerId": id, "agentType": agent, "snapshotId": snapshot_id }),
        );
        Ok(id)
    }

    pub async fn capture_snapshot(&self, label: Option<&str>) -> Result<SnapshotRecord, SandboxError> {
        let record = self.snapshots.capture(&self.sandbox, label).await?;
        self.store.flush()?;
        Ok(record)
    }

    pub async fn delete_snapshot(&self, id: i64) -> Result<(), SandboxError> {
        self.snapshots.delete(id).await?;
        self.store.flush()?;
        Ok(())
    }

    /// Best-effort view of the current state. Never fails.
    pub async fn status(&self) -> ControlStatus {
        let sandbox = self.sandbox.status().await;
        let session = match self.store.active_or_latest_session() {
            Ok(session) => session,
            Err(e) => {
                warn!("Could not read session: {:#}", e);
                None
            }
        };
        ControlStatus {
            sandbox,
            session,
            preview: self.preview.status().await,
        }
    }

    /// Records a telemetry batch.
    pub fn ingest(&self, batch: &TelemetryBatch) -> Result<IngestOutcome, TelemetryError> {
        let outcome = self.reconciler.ingest(batch)?;
        self.store.flush()?;
        Ok(outcome)
    }

    /// Records an iteration end; the returned task writes the generated
    /// summary when a summarizer is configured.
    pub fn end_iteration(
        &self,
        report: &IterationReport,
    ) -> Result<Option<JoinHandle<()>>, TelemetryError> {
        let task = self.reconciler.end_iteration(report)?;
        self.store.flush()?;
        Ok(task)
    }

    /// Runs a command in the container and returns its combined output.
    pub async fn exec(&self, cmd: &[String]) -> Result<String, SandboxError> {
        let id = self.sandbox.require_running().await?;
        Ok(self.sandbox.engine().exec(&id, cmd).await?)
    }

    /// Follows the container logs until the stream ends or `cancel` fires.
    pub async fn follow_logs(
        &self,
        on_line: &mut (dyn for<'a> FnMut(&'a str) + Send),
        cancel: CancellationToken,
    ) -> Result<(), SandboxError> {
        let id = self.sandbox.require_running().await?;
        self.sandbox
            .engine()
            .stream_logs(&id, on_line, cancel)
            .await?;
        Ok(())
    }
}
