//! Docker sandbox for the managed agent container.
//!
//! [`SandboxManager`] owns the container lifecycle; [`SnapshotService`] keeps
//! the on-disk catalog of workspace archives.

mod error;
mod manager;
mod snapshot;

pub use error::SandboxError;
pub use manager::{
    archive_parent, ContainerHandle, SandboxManager, SandboxState, SandboxStatus, AGENT_LABEL,
};
pub use snapshot::{default_label, SnapshotService};
