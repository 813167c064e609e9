//! Showcase previews of what the agent built.
//!
//! The agent describes its artifact in a manifest inside the workspace. A
//! `web` manifest starts a server in the container and is reached through
//! [`PreviewController::proxy`]; `cli` runs once and returns its output;
//! `document` and `media` only record a path for [`PreviewController::read_file`].

use bytes::Bytes;
use futures_util::StreamExt;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::io::Read;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::config::PreviewConfig;
use crate::engine::EngineError;
use crate::feed::{kinds, Broadcaster};
use crate::files::{mime_type, validate_path};
use crate::sandbox::SandboxManager;

/// Errors from preview operations.
///
/// Everything except `Engine` and `Proxy` is a problem with the request or
/// the manifest rather than with the engine.
#[derive(Debug, thiserror::Error)]
pub enum PreviewError {
    #[error("No sandbox container running")]
    NoContainer,

    #[error("No showcase manifest found")]
    NoManifest,

    #[error("{kind} showcase requires {field} in manifest")]
    MissingField {
        kind: &'static str,
        field: &'static str,
    },

    #[error("Unknown showcase type: {kind}")]
    UnknownKind { kind: String },

    #[error("Invalid path: {message}")]
    InvalidPath { message: String },

    #[error("No web preview active")]
    NotWeb,

    #[error(transparent)]
    Engine(#[from] EngineError),

    #[error("Proxy error: {message}")]
    Proxy { message: String },
}

impl PreviewError {
    /// Returns true if the caller or the manifest is at fault.
    pub fn is_client_error(&self) -> bool {
        !matches!(self, Self::Engine(_) | Self::Proxy { .. })
    }
}

/// The manifest file as written by the agent.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ManifestFile {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
}

/// A validated manifest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ShowcaseManifest {
    Web {
        command: String,
        port: u16,
        label: Option<String>,
    },
    Cli {
        command: String,
        label: Option<String>,
    },
    Document {
        path: String,
        label: Option<String>,
    },
    Media {
        path: String,
        label: Option<String>,
    },
}

impl ShowcaseManifest {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Web { .. } => "web",
            Self::Cli { .. } => "cli",
            Self::Document { .. } => "document",
            Self::Media { .. } => "media",
        }
    }

    pub fn label(&self) -> Option<&str> {
        match self {
            Self::Web { label, .. }
            | Self::Cli { label, .. }
            | Self::Document { label, .. }
            | Self::Media { label, .. } => label.as_deref(),
        }
    }
}

impl TryFrom<ManifestFile> for ShowcaseManifest {
    type Error = PreviewError;

    fn try_from(file: ManifestFile) -> Result<Self, Self::Error> {
        let required = |value: Option<String>, kind, field| {
            value
                .filter(|v| !v.trim().is_empty())
                .ok_or(PreviewError::MissingField { kind, field })
        };
        let label = file.label;

        match file.kind.as_str() {
            "web" => {
                let command = required(file.command, "web", "command")?;
                let port = file
                    .port
                    .filter(|p| *p != 0)
                    .ok_or(PreviewError::MissingField {
                        kind: "web",
                        field: "port",
                    })?;
                Ok(Self::Web {
                    command,
                    port,
                    label,
                })
            }
            "cli" => Ok(Self::Cli {
                command: required(file.command, "cli", "command")?,
                label,
            }),
            "document" => Ok(Self::Document {
                path: required(file.path, "document", "path")?,
                label,
            }),
            "media" => Ok(Self::Media {
                path: required(file.path, "media", "path")?,
                label,
            }),
            other => Err(PreviewError::UnknownKind {
                kind: other.to_string(),
            }),
        }
    }
}

/// What a launch produced.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum LaunchOutcome {
    #[serde(rename_all = "camelCase")]
    Web { port: u16, proxy_url: String },
    Cli { output: String },
    Document { path: String },
    Media { path: String },
}

/// Answer to a status query.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PreviewStatus {
    pub running: bool,
    #[serde(rename = "type")]
    pub kind: Option<&'static str>,
    pub port: Option<u16>,
    pub label: Option<String>,
}

/// A proxied response from the web preview.
#[derive(Debug, Clone)]
pub struct ProxyResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: Bytes,
}

/// A file served for a document or media preview.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PreviewFile {
    pub content_type: &'static str,
    pub bytes: Vec<u8>,
}

#[derive(Debug)]
struct ActivePreview {
    manifest: ShowcaseManifest,
    exec_id: Option<String>,
}

impl ActivePreview {
    fn port(&self) -> Option<u16> {
        match self.manifest {
            ShowcaseManifest::Web { port, .. } => Some(port),
            _ => None,
        }
    }
}

/// Runs at most one preview at a time.
pub struct PreviewController {
    sandbox: Arc<SandboxManager>,
    feed: Broadcaster,
    config: PreviewConfig,
    client: reqwest::Client,
    active: Mutex<Option<ActivePreview>>,
}

impl PreviewController {
    pub fn new(sandbox: Arc<SandboxManager>, feed: Broadcaster, config: PreviewConfig) -> Self {
        Self {
            sandbox,
            feed,
            config,
            client: reqwest::Client::new(),
            active: Mutex::new(None),
        }
    }

    async fn container(&self) -> Result<String, PreviewError> {
        self.sandbox
            .require_running()
            .await
            .map_err(|_| PreviewError::NoContainer)
    }

    /// Reads the manifest from the container. Any failure yields `None`.
    pub async fn read_manifest(&self) -> Option<ManifestFile> {
        let id = self.sandbox.handle().await?.container_id;
        let cmd = vec!["cat".to_string(), self.config.manifest_path.clone()];
        let raw = match self.sandbox.engine().exec(&id, &cmd).await {
            Ok(raw) => raw,
            Err(e) => {
                debug!("No showcase manifest: {}", e);
                return None;
            }
        };
        match serde_json::from_str(raw.trim()) {
            Ok(manifest) => Some(manifest),
            Err(e) => {
                debug!("Unparseable showcase manifest: {}", e);
                None
            }
        }
    }

    /// Launches the manifest's preview, replacing any active one.
    pub async fn launch(&self) -> Result<LaunchOutcome, PreviewError> {
        let id = self.container().await?;
        let file = self.read_manifest().await.ok_or(PreviewError::NoManifest)?;
        let manifest = ShowcaseManifest::try_from(file)?;

        let mut active = self.active.lock().await;
        if let Some(previous) = active.take() {
            self.kill(&id, &previous).await;
        }

        let engine = self.sandbox.engine();
        let shell = |command: &str| vec!["sh".to_string(), "-c".to_string(), command.to_string()];

        let (outcome, exec_id) = match &manifest {
            ShowcaseManifest::Web {
                command,
                port,
                label,
            } => {
                let exec_id = engine.exec_detached(&id, &shell(command)).await?;
                self.feed.send(
                    kinds::SHOWCASE_LAUNCHED,
                    json!({ "type": "web", "port": port, "label": label }),
                );
                info!("Launched web preview on port {}", port);
                let proxy_url = format!("{}/", self.config.proxy_prefix.trim_end_matches('/'));
                (
                    LaunchOutcome::Web {
                        port: *port,
                        proxy_url,
                    },
                    Some(exec_id),
                )
            }
            ShowcaseManifest::Cli { command, .. } => {
                let output = engine.exec(&id, &shell(command)).await?;
                (LaunchOutcome::Cli { output }, None)
            }
            ShowcaseManifest::Document { path, .. } => {
                (LaunchOutcome::Document { path: path.clone() }, None)
            }
            ShowcaseManifest::Media { path, .. } => {
                (LaunchOutcome::Media { path: path.clone() }, None)
            }
        };

        *active = Some(ActivePreview { manifest, exec_id });
        Ok(outcome)
    }

    async fn kill(&self, container_id: &str, preview: &ActivePreview) {
        let Some(port) = preview.port() else {
            return;
        };
        let cmd = vec![
            "sh".to_string(),
            "-c".to_string(),
            format!("fuser -k {port}/tcp"),
        ];
        // The server may already have exited.
        if let Err(e) = self.sandbox.engine().exec(container_id, &cmd).await {
            debug!("Killing preview on port {} failed: {}", port, e);
        }
    }

    /// Stops the active preview. Returns false when none was active.
    pub async fn stop(&self) -> bool {
        let Some(previous) = self.active.lock().await.take() else {
            return false;
        };
        if let Some(handle) = self.sandbox.handle().await {
            self.kill(&handle.container_id, &previous).await;
        }
        debug!(
            "Stopped {} preview (exec {:?})",
            previous.manifest.kind(),
            previous.exec_id
        );
        self.feed.send(kinds::SHOWCASE_STOPPED, json!({}));
        true
    }

    /// Drops preview state without touching the container.
    pub async fn clear(&self) {
        self.active.lock().await.take();
    }

    /// Current preview, cleared first if the container has gone.
    pub async fn status(&self) -> PreviewStatus {
        let mut active = self.active.lock().await;
        if active.is_some() && self.sandbox.handle().await.is_none() {
            *active = None;
        }
        match active.as_ref() {
            Some(preview) => PreviewStatus {
                running: true,
                kind: Some(preview.manifest.kind()),
                port: preview.port(),
                label: preview.manifest.label().map(str::to_string),
            },
            None => PreviewStatus::default(),
        }
    }

    async fn web_port(&self) -> Result<u16, PreviewError> {
        self.active
            .lock()
            .await
            .as_ref()
            .and_then(ActivePreview::port)
            .ok_or(PreviewError::NotWeb)
    }

    /// Target URL for a request path under the proxy prefix.
    fn target_url(&self, port: u16, path: &str, query: Option<&str>) -> String {
        let prefix = self.config.proxy_prefix.trim_end_matches('/');
        let sub = path
            .strip_prefix(prefix)
            .unwrap_or(path)
            .trim_start_matches('/');
        let query = query
            .filter(|q| !q.is_empty())
            .map(|q| format!("?{}", q.trim_start_matches('?')))
            .unwrap_or_default();
        format!("http://{}:{}/{}{}", self.config.proxy_host, port, sub, query)
    }

    /// Forwards one request to the web preview.
    pub async fn proxy(
        &self,
        method: &str,
        path: &str,
        query: Option<&str>,
        accept: Option<&str>,
        body: Bytes,
    ) -> Result<ProxyResponse, PreviewError> {
        let port = self.web_port().await?;
        let url = self.target_url(port, path, query);
        let method = reqwest::Method::from_bytes(method.as_bytes()).map_err(|e| {
            PreviewError::Proxy {
                message: e.to_string(),
            }
        })?;

        let mut request = self
            .client
            .request(method.clone(), &url)
            .header(reqwest::header::ACCEPT, accept.unwrap_or("*/*"));
        if method != reqwest::Method::GET && method != reqwest::Method::HEAD {
            request = request.body(body);
        }

        let proxy_error = |e: reqwest::Error| PreviewError::Proxy {
            message: e.to_string(),
        };
        let response = request.send().await.map_err(proxy_error)?;
        let status = response.status().as_u16();
        // The body is re-framed by whoever serves it.
        let headers = response
            .headers()
            .iter()
            .filter(|(name, _)| *name != reqwest::header::TRANSFER_ENCODING)
            .filter_map(|(name, value)| {
                value
                    .to_str()
                    .ok()
                    .map(|v| (name.as_str().to_string(), v.to_string()))
            })
            .collect();
        let body = response.bytes().await.map_err(proxy_error)?;

        Ok(ProxyResponse {
            status,
            headers,
            body,
        })
    }

    /// Fetches a workspace file with its content type.
    pub async fn read_file(&self, path: &str) -> Result<PreviewFile, PreviewError> {
        let id = self.container().await?;
        validate_path(path, &self.sandbox.config().workspace).map_err(|e| {
            PreviewError::InvalidPath {
                message: e.to_string(),
            }
        })?;

        let mut stream = self.sandbox.engine().get_archive(&id, path).await?;
        let mut archive = Vec::new();
        while let Some(chunk) = stream.next().await {
            archive.extend_from_slice(&chunk?);
        }

        Ok(PreviewFile {
            content_type: mime_type(path),
            bytes: first_file(&archive)?,
        })
    }
}

fn first_file(archive: &[u8]) -> Result<Vec<u8>, PreviewError> {
    let transfer = |e: std::io::Error| EngineError::transfer(e.to_string());
    let mut archive = tar::Archive::new(archive);
    for entry in archive.entries().map_err(transfer)? {
        let mut entry = entry.map_err(transfer)?;
        if entry.header().entry_type().is_file() {
            let mut bytes = Vec::new();
            entry.read_to_end(&mut bytes).map_err(transfer)?;
            return Ok(bytes);
        }
    }
    Err(PreviewError::InvalidPath {
        message: "not a regular file".to_string(),
    })
}
