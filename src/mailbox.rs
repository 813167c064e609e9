//! Two-sided message board between the operator and the agent.

use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;

use crate::feed::{kinds, Broadcaster};
use crate::store::{MailboxRecord, Store};

#[derive(Debug, thiserror::Error)]
pub enum MailboxError {
    #[error("No active session")]
    NoActiveSession,

    #[error("Message is required")]
    EmptyMessage,

    #[error("Store error: {0:#}")]
    Store(#[from] anyhow::Error),
}

/// Who is writing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum MailboxSide {
    Agent,
    Human,
}

impl std::fmt::Display for MailboxSide {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Agent => write!(f, "agent"),
            Self::Human => write!(f, "human"),
        }
    }
}

/// Mailbox of the active session.
pub struct Mailbox {
    store: Arc<dyn Store>,
    feed: Broadcaster,
}

impl Mailbox {
    pub fn new(store: Arc<dyn Store>, feed: Broadcaster) -> Self {
        Self { store, feed }
    }

    /// The active session's mailbox, empty when there is none.
    pub fn get(&self) -> Result<MailboxRecord, MailboxError> {
        let Some(session) = self.store.active_session()? else {
            return Ok(MailboxRecord::default());
        };
        Ok(self
            .store
            .get_mailbox(&session.id)?
            .unwrap_or_else(|| MailboxRecord {
                session_id: session.id,
                ..MailboxRecord::default()
            }))
    }

    /// Replaces one side's message and announces it on the feed.
    pub fn post(&self, side: MailboxSide, message: &str) -> Result<MailboxRecord, MailboxError> {
        let session = self
            .store
            .active_session()?
            .ok_or(MailboxError::NoActiveSession)?;
        let message = message.trim();
        if message.is_empty() {
            return Err(MailboxError::EmptyMessage);
        }

        let record = match side {
            MailboxSide::Agent => self.store.set_mailbox_agent(&session.id, message)?,
            MailboxSide::Human => self.store.set_mailbox_human(&session.id, message)?,
        };
        self.feed.send(
            kinds::MAILBOX_UPDATE,
            json!({ "side": side, "message": message }),
        );
        Ok(record)
    }
}
