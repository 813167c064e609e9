use anyhow::{anyhow, Context, Result};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use super::{
    EventRecord, Iteration, MailboxRecord, PromptRecord, Session, SnapshotRecord, Store,
    VitalsRecord,
};
use crate::agent::AgentVariant;

#[derive(Debug, Default, Serialize, Deserialize)]
struct Tables {
    #[serde(default)]
    next_iteration_id: i64,
    #[serde(default)]
    next_event_id: i64,
    #[serde(default)]
    next_vitals_id: i64,
    #[serde(default)]
    next_snapshot_id: i64,
    #[serde(default)]
    next_prompt_id: i64,
    #[serde(default)]
    sessions: Vec<Session>,
    #[serde(default)]
    iterations: Vec<Iteration>,
    #[serde(default)]
    events: Vec<EventRecord>,
    #[serde(default)]
    vitals: Vec<VitalsRecord>,
    #[serde(default)]
    snapshots: Vec<SnapshotRecord>,
    #[serde(default)]
    mailboxes: Vec<MailboxRecord>,
    #[serde(default)]
    prompts: Vec<PromptRecord>,
}

fn next(counter: &mut i64) -> i64 {
    *counter += 1;
    *counter
}

/// In-process [`Store`] with optional TOML file persistence.
#[derive(Debug, Default)]
pub struct MemoryStore {
    tables: Mutex<Tables>,
    path: Option<PathBuf>,
}

impl MemoryStore {
    /// Creates an empty store that is never written to disk.
    pub fn new() -> Self {
        Self::default()
    }

    /// Loads the store from `path` if it exists; [`Store::flush`] writes back
    /// to the same file.
    pub fn open(path: &Path) -> Result<Self> {
        let tables = if path.exists() {
            let content = fs::read_to_string(path)
                .with_context(|| format!("Failed to read store file: {}", path.display()))?;
            toml::from_str(&content)
                .with_context(|| format!("Failed to parse store file: {}", path.display()))?
        } else {
            Tables::default()
        };

        Ok(Self {
            tables: Mutex::new(tables),
            path: Some(path.to_path_buf()),
        })
    }

    fn tables(&self) -> Result<MutexGuard<'_, Tables>> {
        self.tables.lock().map_err(|_| anyhow!("Store lock poisoned"))
    }
}

impl Store for MemoryStore {
    fn create_session(&self, id: &str, agent: AgentVariant) -> Result<Session> {
        let session = Session {
            id: id.to_string(),
            agent,
            started_at: Utc::now(),
            stopped_at: None,
        };
        let mut t = self.tables()?;
        t.sessions.retain(|s| s.id != id);
        t.sessions.push(session.clone());
        Ok(session)
    }

    fn end_session(&self, id: &str) -> Result<()> {
        let mut t = self.tables()?;
        if let Some(session) = t
            .sessions
            .iter_mut()
            .find(|s| s.id == id && s.is_active())
        {
            session.stopped_at = Some(Utc::now());
        }
        Ok(())
    }

    fn end_all_open_sessions(&self) -> Result<usize> {
        let now = Utc::now();
        let mut t = self.tables()?;
        let mut closed = 0;
        for session in t.sessions.iter_mut().filter(|s| s.is_active()) {
            session.stopped_at = Some(now);
            closed += 1;
        }
        Ok(closed)
    }

    fn active_session(&self) -> Result<Option<Session>> {
        let t = self.tables()?;
        Ok(t.sessions.iter().rev().find(|s| s.is_active()).cloned())
    }

    fn latest_session(&self) -> Result<Option<Session>> {
        let t = self.tables()?;
        Ok(t.sessions.last().cloned())
    }

    fn start_iteration(&self, seq: Option<i64>, session_id: Option<&str>) -> Result<Iteration> {
        let mut t = self.tables()?;
        if let Some(seq) = seq {
            if let Some(existing) = t
                .iterations
                .iter()
                .find(|i| i.seq == Some(seq) && i.session_id.as_deref() == session_id)
            {
                return Ok(existing.clone());
            }
        }

        let iteration = Iteration {
            id: next(&mut t.next_iteration_id),
            session_id: session_id.map(str::to_string),
            seq,
            started_at: Utc::now(),
            ended_at: None,
            summary: None,
            action_count: 0,
            error_count: 0,
        };
        t.iterations.push(iteration.clone());
        Ok(iteration)
    }

    fn find_iteration(&self, session_id: Option<&str>, seq: i64) -> Result<Option<Iteration>> {
        let t = self.tables()?;
        Ok(t.iterations
            .iter()
            .find(|i| i.seq == Some(seq) && i.session_id.as_deref() == session_id)
            .cloned())
    }

    fn get_iteration(&self, id: i64) -> Result<Option<Iteration>> {
        let t = self.tables()?;
        Ok(t.iterations.iter().find(|i| i.id == id).cloned())
    }

    fn end_iteration(&self, id: i64, summary: &str, actions: u32, errors: u32) -> Result<()> {
        let mut t = self.tables()?;
        let iteration = t
            .iterations
            .iter_mut()
            .find(|i| i.id == id)
            .ok_or_else(|| anyhow!("No iteration with id {id}"))?;
        iteration.ended_at = Some(Utc::now());
        iteration.summary = Some(summary.to_string());
        iteration.action_count = actions;
        iteration.error_count = errors;
        Ok(())
    }

    fn update_iteration_counts(&self, id: i64, actions: u32, errors: u32) -> Result<()> {
        let mut t = self.tables()?;
        if let Some(iteration) = t.iterations.iter_mut().find(|i| i.id == id) {
            iteration.action_count = actions;
            iteration.error_count = errors;
        }
        Ok(())
    }

    fn update_iteration_summary(&self, id: i64, summary: &str) -> Result<()> {
        let mut t = self.tables()?;
        if let Some(iteration) = t.iterations.iter_mut().find(|i| i.id == id) {
            iteration.summary = Some(summary.to_string());
        }
        Ok(())
    }

    fn close_open_iterations(&self) -> Result<usize> {
        let now = Utc::now();
        let mut t = self.tables()?;
        let mut closed = 0;
        for iteration in t.iterations.iter_mut().filter(|i| i.ended_at.is_none()) {
            iteration.ended_at = Some(now);
            closed += 1;
        }
        Ok(closed)
    }

    fn list_iterations(
        &self,
        limit: usize,
        offset: usize,
        session_id: Option<&str>,
    ) -> Result<Vec<Iteration>> {
        let t = self.tables()?;
        Ok(t.iterations
            .iter()
            .rev()
            .filter(|i| session_id.is_none() || i.session_id.as_deref() == session_id)
            .skip(offset)
            .take(limit)
            .cloned()
            .collect())
    }

    fn insert_event(
        &self,
        iteration_id: i64,
        kind: &str,
        summary: &str,
        content: Option<&str>,
    ) -> Result<EventRecord> {
        let mut t = self.tables()?;
        let event = EventRecord {
            id: next(&mut t.next_event_id),
            iteration_id,
            timestamp: Utc::now(),
            kind: kind.to_string(),
            summary: summary.to_string(),
            content: content.map(str::to_string),
        };
        t.events.push(event.clone());
        Ok(event)
    }

    fn events_for_iteration(&self, iteration_id: i64) -> Result<Vec<EventRecord>> {
        let t = self.tables()?;
        Ok(t.events
            .iter()
            .filter(|e| e.iteration_id == iteration_id)
            .cloned()
            .collect())
    }

    fn insert_vitals(&self, cpu_pct: f64, memory_mb: f64, disk_mb: f64) -> Result<VitalsRecord> {
        let mut t = self.tables()?;
        let vitals = VitalsRecord {
            id: next(&mut t.next_vitals_id),
            timestamp: Utc::now(),
            cpu_pct,
            memory_mb,
            disk_mb,
        };
        t.vitals.push(vitals.clone());
        Ok(vitals)
    }

    fn list_vitals(&self, limit: usize) -> Result<Vec<VitalsRecord>> {
        let t = self.tables()?;
        Ok(t.vitals.iter().rev().take(limit).cloned().collect())
    }

    fn insert_snapshot(
        &self,
        label: &str,
        agent: AgentVariant,
        filename: &str,
        size_bytes: u64,
    ) -> Result<SnapshotRecord> {
        let mut t = self.tables()?;
        let snapshot = SnapshotRecord {
            id: next(&mut t.next_snapshot_id),
            label: label.to_string(),
            agent,
            filename: filename.to_string(),
            size_bytes,
            created_at: Utc::now(),
        };
        t.snapshots.push(snapshot.clone());
        Ok(snapshot)
    }

    fn update_snapshot_filename(&self, id: i64, filename: &str) -> Result<()> {
        let mut t = self.tables()?;
        let snapshot = t
            .snapshots
            .iter_mut()
            .find(|s| s.id == id)
            .ok_or_else(|| anyhow!("No snapshot with id {id}"))?;
        snapshot.filename = filename.to_string();
        Ok(())
    }

    fn get_snapshot(&self, id: i64) -> Result<Option<SnapshotRecord>> {
        let t = self.tables()?;
        Ok(t.snapshots.iter().find(|s| s.id == id).cloned())
    }

    fn list_snapshots(&self, limit: usize) -> Result<Vec<SnapshotRecord>> {
        let t = self.tables()?;
        Ok(t.snapshots.iter().rev().take(limit).cloned().collect())
    }

    fn delete_snapshot(&self, id: i64) -> Result<bool> {
        let mut t = self.tables()?;
        let before = t.snapshots.len();
        t.snapshots.retain(|s| s.id != id);
        Ok(t.snapshots.len() != before)
    }

    fn get_mailbox(&self, session_id: &str) -> Result<Option<MailboxRecord>> {
        let t = self.tables()?;
        Ok(t.mailboxes
            .iter()
            .find(|m| m.session_id == session_id)
            .cloned())
    }

    fn set_mailbox_agent(&self, session_id: &str, message: &str) -> Result<MailboxRecord> {
        let mut t = self.tables()?;
        let mailbox = mailbox_entry(&mut t, session_id);
        mailbox.agent_msg = Some(message.to_string());
        mailbox.agent_updated_at = Some(Utc::now());
        Ok(mailbox.clone())
    }

    fn set_mailbox_human(&self, session_id: &str, message: &str) -> Result<MailboxRecord> {
        let mut t = self.tables()?;
        let mailbox = mailbox_entry(&mut t, session_id);
        mailbox.human_msg = Some(message.to_string());
        mailbox.human_updated_at = Some(Utc::now());
        Ok(mailbox.clone())
    }

    fn insert_prompt(&self, content: &str) -> Result<PromptRecord> {
        let mut t = self.tables()?;
        let prompt = PromptRecord {
            id: next(&mut t.next_prompt_id),
            content: content.to_string(),
            updated_at: Utc::now(),
        };
        t.prompts.push(prompt.clone());
        Ok(prompt)
    }

    fn latest_prompt(&self) -> Result<Option<PromptRecord>> {
        let t = self.tables()?;
        Ok(t.prompts.last().cloned())
    }

    fn prompt_history(&self, limit: usize) -> Result<Vec<PromptRecord>> {
        let t = self.tables()?;
        Ok(t.prompts.iter().rev().take(limit).cloned().collect())
    }

    fn flush(&self) -> Result<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };

        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create directory: {}", parent.display()))?;
        }

        let content = {
            let t = self.tables()?;
            toml::to_string_pretty(&*t).context("Failed to serialize store")?
        };

        fs::write(path, content)
            .with_context(|| format!("Failed to write store file: {}", path.display()))
    }
}

fn mailbox_entry<'a>(t: &'a mut Tables, session_id: &str) -> &'a mut MailboxRecord {
    let idx = match t.mailboxes.iter().position(|m| m.session_id == session_id) {
        Some(idx) => idx,
        None => {
            t.mailboxes.push(MailboxRecord {
                session_id: session_id.to_string(),
                ..Default::default()
            });
            t.mailboxes.len() - 1
        }
    };
    &mut t.mailboxes[idx]
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_session_lifecycle() {
        let store = MemoryStore::new();
        store.create_session("c1", AgentVariant::OpenCode).unwrap();
        let active = store.active_session().unwrap().unwrap();
        assert_eq!(active.id, "c1");
        assert!(active.is_active());

        store.end_session("c1").unwrap();
        assert!(store.active_session().unwrap().is_none());
        let latest = store.active_or_latest_session().unwrap().unwrap();
        assert_eq!(latest.id, "c1");
        assert!(latest.stopped_at.is_some());
    }

    #[test]
    fn test_end_all_open_sessions() {
        let store = MemoryStore::new();
        store.create_session("c1", AgentVariant::OpenCode).unwrap();
        store.create_session("c2", AgentVariant::Goose).unwrap();
        assert_eq!(store.end_all_open_sessions().unwrap(), 2);
        assert!(store.active_session().unwrap().is_none());
        assert_eq!(store.latest_session().unwrap().unwrap().id, "c2");
    }

    #[test]
    fn test_iteration_session_seq_is_unique() {
        let store = MemoryStore::new();
        let a = store.start_iteration(Some(1), Some("c1")).unwrap();
        let b = store.start_iteration(Some(1), Some("c1")).unwrap();
        let c = store.start_iteration(Some(1), Some("c2")).unwrap();
        assert_eq!(a.id, b.id);
        assert_ne!(a.id, c.id);
        assert_eq!(
            store.find_iteration(Some("c2"), 1).unwrap().unwrap().id,
            c.id
        );
        assert!(store.find_iteration(None, 1).unwrap().is_none());
    }

    #[test]
    fn test_end_and_close_iterations() {
        let store = MemoryStore::new();
        let first = store.start_iteration(None, None).unwrap();
        let second = store.start_iteration(None, None).unwrap();
        store.end_iteration(first.id, "Did some work", 3, 1).unwrap();

        let ended = store.get_iteration(first.id).unwrap().unwrap();
        assert_eq!(ended.summary.as_deref(), Some("Did some work"));
        assert_eq!((ended.action_count, ended.error_count), (3, 1));

        assert_eq!(store.close_open_iterations().unwrap(), 1);
        assert!(store
            .get_iteration(second.id)
            .unwrap()
            .unwrap()
            .ended_at
            .is_some());
    }

    #[test]
    fn test_list_iterations_paginates_newest_first() {
        let store = MemoryStore::new();
        for seq in 1..=5 {
            store.start_iteration(Some(seq), Some("c1")).unwrap();
        }
        store.start_iteration(Some(1), Some("c2")).unwrap();

        let page = store.list_iterations(2, 0, None).unwrap();
        assert_eq!(page.len(), 2);
        assert_eq!(page[0].session_id.as_deref(), Some("c2"));

        let c1 = store.list_iterations(10, 1, Some("c1")).unwrap();
        let seqs: Vec<_> = c1.iter().map(|i| i.seq.unwrap()).collect();
        assert_eq!(seqs, vec![4, 3, 2, 1]);
    }

    #[test]
    fn test_events_keep_insertion_order() {
        let store = MemoryStore::new();
        let iteration = store.start_iteration(None, None).unwrap();
        store
            .insert_event(iteration.id, "thought", "Thinking", None)
            .unwrap();
        store
            .insert_event(iteration.id, "tool_call", "Running ls", Some("ls -la"))
            .unwrap();
        let events = store.events_for_iteration(iteration.id).unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].kind, "thought");
        assert_eq!(events[1].content.as_deref(), Some("ls -la"));
    }

    #[test]
    fn test_snapshot_catalog() {
        let store = MemoryStore::new();
        let s = store
            .insert_snapshot("first", AgentVariant::Goose, "pending", 2048)
            .unwrap();
        store
            .update_snapshot_filename(s.id, "snapshot-1.tar")
            .unwrap();
        assert_eq!(
            store.get_snapshot(s.id).unwrap().unwrap().filename,
            "snapshot-1.tar"
        );
        assert!(store.delete_snapshot(s.id).unwrap());
        assert!(!store.delete_snapshot(s.id).unwrap());
        assert!(store.list_snapshots(10).unwrap().is_empty());
    }

    #[test]
    fn test_mailbox_sides_are_independent() {
        let store = MemoryStore::new();
        store.set_mailbox_agent("c1", "need a hint").unwrap();
        let mailbox = store.set_mailbox_human("c1", "try the tests").unwrap();
        assert_eq!(mailbox.agent_msg.as_deref(), Some("need a hint"));
        assert_eq!(mailbox.human_msg.as_deref(), Some("try the tests"));
        assert!(store.get_mailbox("c2").unwrap().is_none());
    }

    #[test]
    fn test_prompt_history_keeps_every_version() {
        let store = MemoryStore::new();
        assert!(store.latest_prompt().unwrap().is_none());

        store.insert_prompt("Build a web scraper").unwrap();
        let second = store.insert_prompt("Build a web scraper in Rust").unwrap();
        assert_eq!(store.latest_prompt().unwrap().unwrap(), second);

        let history = store.prompt_history(10).unwrap();
        let contents: Vec<_> = history.iter().map(|p| p.content.as_str()).collect();
        assert_eq!(contents, vec!["Build a web scraper in Rust", "Build a web scraper"]);
        assert_eq!(store.prompt_history(1).unwrap().len(), 1);
    }

    #[test]
    fn test_flush_and_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("data").join("store.toml");

        let store = MemoryStore::open(&path).unwrap();
        store.create_session("c1", AgentVariant::OpenCode).unwrap();
        let iteration = store.start_iteration(Some(7), Some("c1")).unwrap();
        store
            .insert_event(iteration.id, "text", "hello", None)
            .unwrap();
        store.insert_vitals(12.5, 256.0, 1024.0).unwrap();
        store
            .insert_snapshot("snap", AgentVariant::OpenCode, "snapshot-1.tar", 10)
            .unwrap();
        store.insert_prompt("Fix the login page").unwrap();
        store.flush().unwrap();

        let reopened = MemoryStore::open(&path).unwrap();
        assert_eq!(reopened.active_session().unwrap().unwrap().id, "c1");
        assert_eq!(
            reopened.find_iteration(Some("c1"), 7).unwrap().unwrap().id,
            iteration.id
        );
        assert_eq!(reopened.events_for_iteration(iteration.id).unwrap().len(), 1);
        assert!((reopened.list_vitals(1).unwrap()[0].cpu_pct - 12.5).abs() < f64::EPSILON);

        let next = reopened.start_iteration(Some(8), Some("c1")).unwrap();
        assert!(next.id > iteration.id);
        assert_eq!(
            reopened.latest_prompt().unwrap().unwrap().content,
            "Fix the login page"
        );
        assert_eq!(reopened.insert_prompt("v2").unwrap().id, 2);
    }
}
