//! Durable records and the store contract the control plane consumes.
//!
//! The relational schema lives outside this crate; everything here talks to
//! it through [`Store`]. [`MemoryStore`] implements the contract in process
//! and can persist itself to a TOML file between CLI invocations.

mod memory;

pub use memory::MemoryStore;

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::agent::AgentVariant;

/// One lifetime of a managed container.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    /// The container id.
    pub id: String,
    pub agent: AgentVariant,
    pub started_at: DateTime<Utc>,
    pub stopped_at: Option<DateTime<Utc>>,
}

impl Session {
    /// Returns true while the session has not been closed.
    pub fn is_active(&self) -> bool {
        self.stopped_at.is_none()
    }
}

/// A unit of agent work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Iteration {
    pub id: i64,
    /// Owning session; `None` for iterations recorded without one.
    pub session_id: Option<String>,
    /// Agent-assigned sequence number.
    pub seq: Option<i64>,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub summary: Option<String>,
    pub action_count: u32,
    pub error_count: u32,
}

/// A single telemetry event within an iteration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventRecord {
    pub id: i64,
    pub iteration_id: i64,
    pub timestamp: DateTime<Utc>,
    pub kind: String,
    pub summary: String,
    pub content: Option<String>,
}

/// Resource usage sample reported at iteration end.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VitalsRecord {
    pub id: i64,
    pub timestamp: DateTime<Utc>,
    pub cpu_pct: f64,
    pub memory_mb: f64,
    pub disk_mb: f64,
}

/// Catalog entry for a workspace archive.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnapshotRecord {
    pub id: i64,
    pub label: String,
    pub agent: AgentVariant,
    /// Archive file name inside the snapshot directory.
    pub filename: String,
    pub size_bytes: u64,
    pub created_at: DateTime<Utc>,
}

/// Two-sided message board for one session.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MailboxRecord {
    pub session_id: String,
    pub agent_msg: Option<String>,
    pub agent_updated_at: Option<DateTime<Utc>>,
    pub human_msg: Option<String>,
    pub human_updated_at: Option<DateTime<Utc>>,
}

/// One saved version of the operator's task prompt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PromptRecord {
    pub id: i64,
    pub content: String,
    pub updated_at: DateTime<Utc>,
}

/// Record CRUD the control plane needs from the persistent store.
///
/// All timestamps are UTC and serialize as RFC 3339, which sorts
/// lexicographically.
pub trait Store: Send + Sync {
    // Sessions
    fn create_session(&self, id: &str, agent: AgentVariant) -> Result<Session>;
    fn end_session(&self, id: &str) -> Result<()>;
    fn end_all_open_sessions(&self) -> Result<usize>;
    fn active_session(&self) -> Result<Option<Session>>;
    fn latest_session(&self) -> Result<Option<Session>>;

    /// The open session if there is one, else the most recently started.
    fn active_or_latest_session(&self) -> Result<Option<Session>> {
        match self.active_session()? {
            Some(session) => Ok(Some(session)),
            None => self.latest_session(),
        }
    }

    // Iterations
    fn start_iteration(&self, seq: Option<i64>, session_id: Option<&str>) -> Result<Iteration>;
    fn find_iteration(&self, session_id: Option<&str>, seq: i64) -> Result<Option<Iteration>>;
    fn get_iteration(&self, id: i64) -> Result<Option<Iteration>>;
    fn end_iteration(&self, id: i64, summary: &str, actions: u32, errors: u32) -> Result<()>;
    fn update_iteration_counts(&self, id: i64, actions: u32, errors: u32) -> Result<()>;
    fn update_iteration_summary(&self, id: i64, summary: &str) -> Result<()>;
    /// Stamps an end time on every iteration that has none.
    fn close_open_iterations(&self) -> Result<usize>;
    /// Newest first; `session_id` restricts to one session.
    fn list_iterations(
        &self,
        limit: usize,
        offset: usize,
        session_id: Option<&str>,
    ) -> Result<Vec<Iteration>>;

    // Events
    fn insert_event(
        &self,
        iteration_id: i64,
        kind: &str,
        summary: &str,
        content: Option<&str>,
    ) -> Result<EventRecord>;
    /// In insertion order.
    fn events_for_iteration(&self, iteration_id: i64) -> Result<Vec<EventRecord>>;

    // Vitals
    fn insert_vitals(&self, cpu_pct: f64, memory_mb: f64, disk_mb: f64) -> Result<VitalsRecord>;
    /// Newest first.
    fn list_vitals(&self, limit: usize) -> Result<Vec<VitalsRecord>>;

    // Snapshots
    fn insert_snapshot(
        &self,
        label: &str,
        agent: AgentVariant,
        filename: &str,
        size_bytes: u64,
    ) -> Result<SnapshotRecord>;
    fn update_snapshot_filename(&self, id: i64, filename: &str) -> Result<()>;
    fn get_snapshot(&self, id: i64) -> Result<Option<SnapshotRecord>>;
    /// Newest first.
    fn list_snapshots(&self, limit: usize) -> Result<Vec<SnapshotRecord>>;
    fn delete_snapshot(&self, id: i64) -> Result<bool>;

    // Mailbox
    fn get_mailbox(&self, session_id: &str) -> Result<Option<MailboxRecord>>;
    fn set_mailbox_agent(&self, session_id: &str, message: &str) -> Result<MailboxRecord>;
    fn set_mailbox_human(&self, session_id: &str, message: &str) -> Result<MailboxRecord>;

    // Prompt history
    /// Appends a new version; earlier versions are kept.
    fn insert_prompt(&self, content: &str) -> Result<PromptRecord>;
    fn latest_prompt(&self) -> Result<Option<PromptRecord>>;
    /// Newest first.
    fn prompt_history(&self, limit: usize) -> Result<Vec<PromptRecord>>;

    /// Flushes pending writes to durable storage.
    fn flush(&self) -> Result<()> {
        Ok(())
    }
}
