//! Control plane for a single sandboxed coding-agent container.
//!
//! Launches, supervises and tears down the container through the Docker
//! engine API, reconciles the telemetry the agent pushes into durable
//! iteration records, fans live events out to dashboard observers, and
//! freezes or restores the workspace as tar snapshots.

pub mod agent;
pub mod config;
pub mod control;
pub mod engine;
pub mod feed;
pub mod files;
pub mod mailbox;
pub mod preview;
pub mod prompt;
pub mod sandbox;
pub mod store;
pub mod telemetry;

pub use agent::AgentVariant;
pub use config::Config;
pub use control::ControlPlane;
