use async_trait::async_trait;
use bollard::container::{
    Config as ContainerConfig, CreateContainerOptions, DownloadFromContainerOptions,
    InspectContainerOptions, ListContainersOptions, LogOutput, LogsOptions,
    RemoveContainerOptions, StopContainerOptions, UploadToContainerOptions,
};
use bollard::errors::Error as BollardError;
use bollard::exec::{CreateExecOptions, StartExecOptions, StartExecResults};
use bollard::service::{HostConfig, PortBinding as DockerPortBinding};
use bollard::{ClientVersion, Docker};
use futures_util::{Stream, StreamExt};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::{
    ByteStream, ContainerSpec, ContainerState, ContainerSummary, Engine, EngineError, LineBuffer,
};

/// Docker engine client bound to a Unix domain socket.
#[derive(Debug, Clone)]
pub struct DockerEngine {
    docker: Docker,
    socket_path: String,
}

impl DockerEngine {
    /// Connects to the engine at `socket_path`, pinning the API version
    /// (`"1.47"` or `"v1.47"`).
    pub fn connect(
        socket_path: &str,
        api_version: &str,
        timeout_secs: u64,
    ) -> Result<Self, EngineError> {
        let version = parse_api_version(api_version)?;
        let docker = Docker::connect_with_socket(socket_path, timeout_secs, &version)
            .map_err(|e| EngineError::unavailable(format!("{socket_path}: {e}")))?;

        Ok(Self {
            docker,
            socket_path: socket_path.to_string(),
        })
    }

    /// Path of the socket this client talks to.
    pub fn socket_path(&self) -> &str {
        &self.socket_path
    }

    /// Checks that the daemon answers.
    pub async fn ping(&self) -> Result<(), EngineError> {
        self.docker
            .ping()
            .await
            .map(|_| ())
            .map_err(|e| EngineError::unavailable(format!("{}: {e}", self.socket_path)))
    }
}

fn parse_api_version(raw: &str) -> Result<ClientVersion, EngineError> {
    let trimmed = raw.trim().trim_start_matches('v');
    let parsed = trimmed
        .split_once('.')
        .and_then(|(major, minor)| Some((major.parse().ok()?, minor.parse().ok()?)));

    match parsed {
        Some((major_version, minor_version)) => Ok(ClientVersion {
            major_version,
            minor_version,
        }),
        None => Err(EngineError::unavailable(format!(
            "Invalid engine API version: '{raw}'"
        ))),
    }
}

fn build_container_config(spec: &ContainerSpec) -> ContainerConfig<String> {
    let mut exposed_ports = HashMap::new();
    let mut port_bindings = HashMap::new();
    for binding in &spec.port_bindings {
        let key = format!("{}/tcp", binding.container_port);
        exposed_ports.insert(key.clone(), HashMap::new());
        port_bindings.insert(
            key,
            Some(vec![DockerPortBinding {
                host_ip: None,
                host_port: Some(binding.host_port.to_string()),
            }]),
        );
    }

    ContainerConfig {
        image: Some(spec.image.clone()),
        env: Some(spec.env.clone()),
        labels: Some(spec.labels.clone()),
        tty: Some(false),
        exposed_ports: (!exposed_ports.is_empty()).then_some(exposed_ports),
        host_config: Some(HostConfig {
            binds: Some(spec.binds.clone()),
            network_mode: spec.network_mode.clone(),
            extra_hosts: Some(spec.extra_hosts.clone()),
            port_bindings: (!port_bindings.is_empty()).then_some(port_bindings),
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// Concatenates every decoded exec frame in arrival order.
///
/// The engine multiplexes stdout and stderr into 8-byte-header frames; the
/// bollard codec strips the headers and tags each payload with its stream.
/// The tag is discarded here. Bytes are joined before UTF-8 decoding so a
/// character split across frames survives.
pub async fn collect_output<S>(mut stream: S) -> Result<String, EngineError>
where
    S: Stream<Item = Result<LogOutput, BollardError>> + Unpin,
{
    let mut output = Vec::new();
    while let Some(chunk) = stream.next().await {
        let chunk = chunk.map_err(|e| EngineError::exec(e.to_string()))?;
        output.extend_from_slice(&chunk.into_bytes());
    }
    Ok(String::from_utf8_lossy(&output).into_owned())
}

#[async_trait]
impl Engine for DockerEngine {
    async fn create_container(&self, spec: &ContainerSpec) -> Result<String, EngineError> {
        debug!("Creating container {} from {}", spec.name, spec.image);
        let response = self
            .docker
            .create_container(
                Some(CreateContainerOptions {
                    name: spec.name.clone(),
                    platform: None,
                }),
                build_container_config(spec),
            )
            .await
            .map_err(|e| EngineError::from_bollard("Create container", &spec.name, e))?;

        info!("Created container {}", response.id);
        Ok(response.id)
    }

    async fn start_container(&self, id: &str) -> Result<(), EngineError> {
        match self.docker.start_container::<String>(id, None).await {
            Ok(()) => Ok(()),
            Err(BollardError::DockerResponseServerError {
                status_code: 304, ..
            }) => {
                debug!("Container {} already started", id);
                Ok(())
            }
            Err(e) => Err(EngineError::from_bollard("Start container", id, e)),
        }
    }

    async fn stop_container(&self, id: &str, timeout_secs: i64) -> Result<(), EngineError> {
        match self
            .docker
            .stop_container(id, Some(StopContainerOptions { t: timeout_secs }))
            .await
        {
            Ok(()) => Ok(()),
            Err(BollardError::DockerResponseServerError {
                status_code: 304 | 404,
                ..
            }) => {
                debug!("Container {} already stopped", id);
                Ok(())
            }
            Err(e) => Err(EngineError::from_bollard("Stop container", id, e)),
        }
    }

    async fn remove_container(&self, id: &str, force: bool) -> Result<(), EngineError> {
        match self
            .docker
            .remove_container(
                id,
                Some(RemoveContainerOptions {
                    force,
                    ..Default::default()
                }),
            )
            .await
        {
            Ok(()) => Ok(()),
            Err(BollardError::DockerResponseServerError {
                status_code: 404, ..
            }) => {
                debug!("Container {} already removed", id);
                Ok(())
            }
            Err(e) => Err(EngineError::from_bollard("Remove container", id, e)),
        }
    }

    async fn inspect_container(&self, id: &str) -> Result<ContainerState, EngineError> {
        let info = self
            .docker
            .inspect_container(id, None::<InspectContainerOptions>)
            .await
            .map_err(|e| EngineError::from_bollard("Inspect container", id, e))?;

        let state = info.state.unwrap_or_default();
        Ok(ContainerState {
            running: state.running.unwrap_or(false),
            status: state
                .status
                .map(|s| s.to_string())
                .unwrap_or_else(|| "unknown".to_string()),
        })
    }

    async fn list_containers(
        &self,
        filters: HashMap<String, Vec<String>>,
    ) -> Result<Vec<ContainerSummary>, EngineError> {
        let containers = self
            .docker
            .list_containers(Some(ListContainersOptions::<String> {
                all: true,
                filters,
                ..Default::default()
            }))
            .await
            .map_err(|e| EngineError::from_bollard("List containers", "", e))?;

        Ok(containers
            .into_iter()
            .map(|c| ContainerSummary {
                id: c.id.unwrap_or_default(),
                names: c.names.unwrap_or_default(),
                state: c.state.unwrap_or_default(),
                labels: c.labels.unwrap_or_default(),
            })
            .collect())
    }

    async fn exec(&self, id: &str, cmd: &[String]) -> Result<String, EngineError> {
        let exec = self
            .docker
            .create_exec(
                id,
                CreateExecOptions {
                    cmd: Some(cmd.to_vec()),
                    attach_stdout: Some(true),
                    attach_stderr: Some(true),
                    ..Default::default()
                },
            )
            .await
            .map_err(|e| EngineError::from_bollard("Create exec", id, e))?;

        let output = match self
            .docker
            .start_exec(&exec.id, None)
            .await
            .map_err(|e| EngineError::from_bollard("Start exec", id, e))?
        {
            StartExecResults::Attached { output, .. } => collect_output(output).await?,
            StartExecResults::Detached => String::new(),
        };

        let inspected = self
            .docker
            .inspect_exec(&exec.id)
            .await
            .map_err(|e| EngineError::from_bollard("Inspect exec", id, e))?;
        match inspected.exit_code {
            Some(code) if code != 0 => Err(EngineError::exec(format!(
                "`{}` exited with status {}: {}",
                cmd.join(" "),
                code,
                output.trim()
            ))),
            _ => Ok(output),
        }
    }

    async fn exec_detached(&self, id: &str, cmd: &[String]) -> Result<String, EngineError> {
        let exec = self
            .docker
            .create_exec(
                id,
                CreateExecOptions {
                    cmd: Some(cmd.to_vec()),
                    attach_stdout: Some(false),
                    attach_stderr: Some(false),
                    ..Default::default()
                },
            )
            .await
            .map_err(|e| EngineError::from_bollard("Create exec", id, e))?;

        self.docker
            .start_exec(
                &exec.id,
                Some(StartExecOptions {
                    detach: true,
                    ..Default::default()
                }),
            )
            .await
            .map_err(|e| EngineError::from_bollard("Start exec", id, e))?;

        debug!("Started detached exec {} in {}", exec.id, id);
        Ok(exec.id)
    }

    async fn get_archive(&self, id: &str, path: &str) -> Result<ByteStream, EngineError> {
        let owner = id.to_string();
        let stream = self
            .docker
            .download_from_container(
                id,
                Some(DownloadFromContainerOptions {
                    path: path.to_string(),
                }),
            )
            .map(move |chunk| chunk.map_err(|e| EngineError::from_bollard("Get archive", &owner, e)));

        Ok(Box::pin(stream))
    }

    async fn put_archive(
        &self,
        id: &str,
        path: &str,
        archive: ByteStream,
    ) -> Result<(), EngineError> {
        // The upload body cannot carry errors, so a broken source ends the
        // body early and the cause is reported after the request settles.
        let failure: Arc<Mutex<Option<EngineError>>> = Arc::default();
        let slot = Arc::clone(&failure);
        let body = archive.scan((), move |(), chunk| {
            let next = match chunk {
                Ok(bytes) => Some(bytes),
                Err(e) => {
                    if let Ok(mut slot) = slot.lock() {
                        *slot = Some(e);
                    }
                    None
                }
            };
            futures_util::future::ready(next)
        });

        let result = self
            .docker
            .upload_to_container_streaming(
                id,
                Some(UploadToContainerOptions {
                    path: path.to_string(),
                    ..Default::default()
                }),
                body,
            )
            .await;

        if let Some(source_error) = failure.lock().ok().and_then(|mut slot| slot.take()) {
            return Err(EngineError::transfer(source_error.to_string()));
        }
        result.map_err(|e| EngineError::from_bollard("Put archive", id, e))
    }

    async fn stream_logs(
        &self,
        id: &str,
        on_line: &mut (dyn for<'a> FnMut(&'a str) + Send),
        cancel: CancellationToken,
    ) -> Result<(), EngineError> {
        let mut stream = Box::pin(self.docker.logs::<String>(
            id,
            Some(LogsOptions {
                follow: true,
                stdout: true,
                stderr: true,
                timestamps: true,
                ..Default::default()
            }),
        ));
        let mut lines = LineBuffer::default();

        loop {
            tokio::select! {
                () = cancel.cancelled() => {
                    debug!("Log stream for {} cancelled", id);
                    break;
                }
                next = stream.next() => match next {
                    Some(Ok(chunk)) => {
                        for line in lines.push(&String::from_utf8_lossy(&chunk.into_bytes())) {
                            on_line(&line);
                        }
                    }
                    Some(Err(e)) => return Err(EngineError::from_bollard("Stream logs", id, e)),
                    None => break,
                },
            }
        }

        if let Some(rest) = lines.finish() {
            on_line(&rest);
        }
        Ok(())
    }
}
