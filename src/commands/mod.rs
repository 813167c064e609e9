//! CLI command implementations.
//!
//! Each submodule implements a goku subcommand. Formatting is kept in pure
//! functions returning strings; IO happens only in the `run` entry points.

pub mod exec;
pub mod files;
pub mod logs;
pub mod mailbox;
pub mod prompt;
pub mod session;
pub mod showcase;
pub mod snapshot;
pub mod telemetry;

use anyhow::{Context, Result};
use clap::Args;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::debug;

use goku::config::{Config, CONFIG_FILE};
use goku::engine::DockerEngine;
use goku::store::{MemoryStore, Store};
use goku::ControlPlane;

/// Options shared by every subcommand.
#[derive(Args, Debug, Clone)]
pub struct GlobalArgs {
    /// Configuration file
    #[arg(long, global = true, env = "GOKU_CONFIG", default_value = CONFIG_FILE)]
    pub config: PathBuf,

    /// Docker engine socket (overrides the config file)
    #[arg(long, global = true, env = "DOCKER_SOCKET")]
    pub socket: Option<String>,
}

impl GlobalArgs {
    /// Loads the configuration and applies command-line overrides.
    pub fn load_config(&self) -> Result<Config> {
        let mut config = Config::load(&self.config)?;
        if let Some(socket) = &self.socket {
            config.engine.socket = socket.clone();
        }
        Ok(config)
    }
}

/// Builds the control plane and runs the boot-time recovery.
pub async fn open(global: &GlobalArgs) -> Result<ControlPlane> {
    let config = global.load_config()?;

    let engine = DockerEngine::connect(
        &config.engine.socket,
        &config.engine.api_version,
        config.engine.timeout_secs,
    )?;
    engine.ping().await?;
    debug!("Connected to engine at {}", engine.socket_path());

    let store = open_store(&config)?;
    let control = ControlPlane::new(config, Arc::new(engine), store)?;
    control
        .boot()
        .await
        .context("Failed to recover sandbox state")?;
    Ok(control)
}

/// Opens the record store named by the configuration.
pub fn open_store(config: &Config) -> Result<Arc<dyn Store>> {
    Ok(match &config.store.path {
        Some(path) => Arc::new(MemoryStore::open(path)?),
        None => Arc::new(MemoryStore::new()),
    })
}

/// Reads a file, or stdin when `path` is `-`.
pub fn read_input(path: &Path) -> Result<Vec<u8>> {
    if path == Path::new("-") {
        let mut body = Vec::new();
        std::io::stdin()
            .read_to_end(&mut body)
            .context("Failed to read stdin")?;
        return Ok(body);
    }
    std::fs::read(path).with_context(|| format!("Failed to read {}", path.display()))
}

/// Parses repeated `KEY=VALUE` arguments.
pub fn parse_env_pairs(pairs: &[String]) -> Result<std::collections::BTreeMap<String, String>> {
    pairs
        .iter()
        .map(|pair| {
            let (key, value) = pair
                .split_once('=')
                .with_context(|| format!("Expected KEY=VALUE, got '{pair}'"))?;
            anyhow::ensure!(!key.trim().is_empty(), "Empty variable name in '{pair}'");
            Ok((key.trim().to_string(), value.to_string()))
        })
        .collect()
}
