use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// Default config file name, looked up in the working directory.
pub const CONFIG_FILE: &str = "goku.toml";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub sandbox: SandboxConfig,
    #[serde(default)]
    pub snapshots: SnapshotConfig,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub feed: FeedConfig,
    #[serde(default)]
    pub preview: PreviewConfig,
    #[serde(default)]
    pub summarizer: SummarizerConfig,
}

/// Container engine connection settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Path to the engine's Unix domain socket
    #[serde(default = "default_socket")]
    pub socket: String,

    /// Engine API version used in every request path
    #[serde(default = "default_api_version")]
    pub api_version: String,

    /// Request timeout in seconds
    #[serde(default = "default_engine_timeout")]
    pub timeout_secs: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            socket: default_socket(),
            api_version: default_api_version(),
            timeout_secs: default_engine_timeout(),
        }
    }
}

fn default_socket() -> String {
    "/var/run/docker.sock".to_string()
}

fn default_api_version() -> String {
    "1.47".to_string()
}

fn default_engine_timeout() -> u64 {
    120
}

/// Managed container settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SandboxConfig {
    /// Image the managed container runs
    #[serde(default = "default_image")]
    pub image: String,

    /// Fixed container name; also the key used to find it after a restart
    #[serde(default = "default_container_name")]
    pub container_name: String,

    /// URL the workload uses to reach the control plane
    #[serde(default = "default_callback_url")]
    pub callback_url: String,

    /// Workspace directory inside the container (captured by snapshots)
    #[serde(default = "default_workspace")]
    pub workspace: String,

    /// Engine network mode
    #[serde(default = "default_network_mode")]
    pub network_mode: String,

    /// Extra `/etc/hosts` entries
    #[serde(default = "default_extra_hosts")]
    pub extra_hosts: Vec<String>,

    /// Additional volume mounts
    #[serde(default)]
    pub mounts: Vec<Mount>,

    /// Published ports
    #[serde(default)]
    pub ports: Vec<PortMapping>,

    /// Seconds the engine waits before force-killing on stop
    #[serde(default = "default_stop_timeout")]
    pub stop_timeout_secs: i64,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            image: default_image(),
            container_name: default_container_name(),
            callback_url: default_callback_url(),
            workspace: default_workspace(),
            network_mode: default_network_mode(),
            extra_hosts: default_extra_hosts(),
            mounts: Vec::new(),
            ports: Vec::new(),
            stop_timeout_secs: default_stop_timeout(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Mount {
    pub host: String,
    pub container: String,
    #[serde(default = "default_true")]
    pub readonly: bool,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct PortMapping {
    pub container: u16,
    pub host: u16,
}

fn default_image() -> String {
    "goku-sandbox:latest".to_string()
}

fn default_container_name() -> String {
    "goku-sandbox".to_string()
}

fn default_callback_url() -> String {
    "http://host.docker.internal:3000".to_string()
}

fn default_workspace() -> String {
    "/workspace".to_string()
}

fn default_network_mode() -> String {
    "host".to_string()
}

fn default_extra_hosts() -> Vec<String> {
    vec!["host.docker.internal:host-gateway".to_string()]
}

fn default_stop_timeout() -> i64 {
    10
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotConfig {
    /// Directory holding snapshot tar archives
    #[serde(default = "default_snapshot_dir")]
    pub dir: PathBuf,
}

impl Default for SnapshotConfig {
    fn default() -> Self {
        Self {
            dir: default_snapshot_dir(),
        }
    }
}

fn default_snapshot_dir() -> PathBuf {
    PathBuf::from("data/snapshots")
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Record file; `None` keeps records in memory only
    #[serde(default = "default_store_path")]
    pub path: Option<PathBuf>,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: default_store_path(),
        }
    }
}

fn default_store_path() -> Option<PathBuf> {
    Some(PathBuf::from("data/goku-store.toml"))
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeedConfig {
    /// Heartbeat interval while observers are connected
    #[serde(default = "default_heartbeat")]
    pub heartbeat_secs: u64,
}

impl Default for FeedConfig {
    fn default() -> Self {
        Self {
            heartbeat_secs: default_heartbeat(),
        }
    }
}

fn default_heartbeat() -> u64 {
    15
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PreviewConfig {
    /// Host the proxy forwards to (the container shares its network)
    #[serde(default = "default_proxy_host")]
    pub proxy_host: String,

    /// Path prefix stripped from proxied requests
    #[serde(default = "default_proxy_prefix")]
    pub proxy_prefix: String,

    /// Manifest the workload writes to describe its showcase
    #[serde(default = "default_manifest_path")]
    pub manifest_path: String,
}

impl Default for PreviewConfig {
    fn default() -> Self {
        Self {
            proxy_host: default_proxy_host(),
            proxy_prefix: default_proxy_prefix(),
            manifest_path: default_manifest_path(),
        }
    }
}

fn default_proxy_host() -> String {
    "127.0.0.1".to_string()
}

fn default_proxy_prefix() -> String {
    "/api/showcase/proxy".to_string()
}

fn default_manifest_path() -> String {
    "/workspace/.showcase.json".to_string()
}

/// Iteration summarizer (OpenAI-compatible chat completions)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SummarizerConfig {
    #[serde(default)]
    pub enabled: bool,

    #[serde(default = "default_llm_base_url")]
    pub base_url: String,

    /// API key; empty sends no Authorization header
    #[serde(default)]
    pub api_key: String,

    #[serde(default = "default_llm_model")]
    pub model: String,

    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
}

impl Default for SummarizerConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            base_url: default_llm_base_url(),
            api_key: String::new(),
            model: default_llm_model(),
            max_tokens: default_max_tokens(),
        }
    }
}

fn default_llm_base_url() -> String {
    "http://localhost:8000/v1".to_string()
}

fn default_llm_model() -> String {
    "default".to_string()
}

fn default_max_tokens() -> u32 {
    1024
}

fn default_true() -> bool {
    true
}

impl Config {
    /// Load configuration from `path`, using defaults if it does not exist
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }

        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: Self = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

        Ok(config)
    }
}

impl SandboxConfig {
    /// Bind mount strings in engine format, with `~` expanded
    pub fn binds(&self) -> Result<Vec<String>> {
        self.mounts
            .iter()
            .map(|mount| {
                let host = expand_path(&mount.host)?;
                let mode = if mount.readonly { "ro" } else { "rw" };
                Ok(format!("{}:{}:{}", host, mount.container, mode))
            })
            .collect()
    }
}

/// Expand ~ to home directory
fn expand_path(path: &str) -> Result<String> {
    if let Some(rest) = path.strip_prefix("~/") {
        let home = dirs::home_dir().context("Could not determine home directory")?;
        Ok(home.join(rest).display().to_string())
    } else {
        Ok(path.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.engine.socket, "/var/run/docker.sock");
        assert_eq!(config.engine.api_version, "1.47");
        assert_eq!(config.sandbox.container_name, "goku-sandbox");
        assert_eq!(config.sandbox.workspace, "/workspace");
        assert_eq!(config.feed.heartbeat_secs, 15);
        assert!(!config.summarizer.enabled);
    }

    #[test]
    fn test_parse_config() {
        let toml = r#"
[engine]
socket = "/run/user/1000/docker.sock"

[sandbox]
image = "goku-sandbox:dev"
ports = [{ container = 8080, host = 18080 }]

[[sandbox.mounts]]
host = "/srv/cache"
container = "/cache"
readonly = false

[store]
path = "/tmp/goku.toml"

[summarizer]
enabled = true
model = "qwen"
"#;
        let config: Config = toml::from_str(toml).unwrap();
        assert_eq!(config.engine.socket, "/run/user/1000/docker.sock");
        assert_eq!(config.engine.api_version, "1.47");
        assert_eq!(config.sandbox.image, "goku-sandbox:dev");
        assert_eq!(config.sandbox.ports[0].host, 18080);
        assert_eq!(
            config.sandbox.binds().unwrap(),
            vec!["/srv/cache:/cache:rw".to_string()]
        );
        assert_eq!(config.store.path, Some(PathBuf::from("/tmp/goku.toml")));
        assert!(config.summarizer.enabled);
        assert_eq!(config.summarizer.model, "qwen");
    }

    #[test]
    fn test_load_missing_file_uses_defaults() {
        let dir = tempdir().unwrap();
        let config = Config::load(&dir.path().join(CONFIG_FILE)).unwrap();
        assert_eq!(config.sandbox.image, "goku-sandbox:latest");
    }

    #[test]
    fn test_load_invalid_file_fails() {
        let dir = tempdir().unwrap();
        let path = dir.path().join(CONFIG_FILE);
        fs::write(&path, "[engine\nsocket = ").unwrap();
        let err = Config::load(&path).unwrap_err();
        assert!(err.to_string().contains("Failed to parse config file"));
    }

    #[test]
    fn test_expand_path() {
        assert_eq!(expand_path("/usr/bin").unwrap(), "/usr/bin");

        if dirs::home_dir().is_some() {
            let expanded = expand_path("~/.ssh").unwrap();
            assert!(!expanded.starts_with('~'));
            assert!(expanded.ends_with("/.ssh"));
        }
    }
}
