//! Versioned task prompt the operator hands to the agent.

use serde::Serialize;
use std::sync::Arc;

use crate::store::{PromptRecord, Store};

#[derive(Debug, thiserror::Error)]
pub enum PromptError {
    #[error("Prompt content is required")]
    Empty,

    #[error("Store error: {0:#}")]
    Store(#[from] anyhow::Error),
}

/// Result of replacing the prompt.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PromptUpdate {
    pub previous: Option<String>,
    pub current: String,
}

/// Prompt history backed by the record store. Every save appends a version.
pub struct Prompts {
    store: Arc<dyn Store>,
}

impl Prompts {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }

    /// The newest version, if one was ever saved.
    pub fn latest(&self) -> Result<Option<PromptRecord>, PromptError> {
        Ok(self.store.latest_prompt()?)
    }

    /// Saves `content` as the new version and returns it alongside the one
    /// it replaced. Content is kept verbatim; only blank content is refused.
    pub fn set(&self, content: &str) -> Result<PromptUpdate, PromptError> {
        if content.trim().is_empty() {
            return Err(PromptError::Empty);
        }

        let previous = self.store.latest_prompt()?.map(|p| p.content);
        let record = self.store.insert_prompt(content)?;
        Ok(PromptUpdate {
            previous,
            current: record.content,
        })
    }

    /// Newest first.
    pub fn history(&self, limit: usize) -> Result<Vec<PromptRecord>, PromptError> {
        Ok(self.store.prompt_history(limit)?)
    }
}
