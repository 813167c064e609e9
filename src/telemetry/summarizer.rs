//! One-sentence iteration summaries from an OpenAI-compatible endpoint.

use anyhow::{bail, Context, Result};
use serde_json::{json, Value};
use std::time::Duration;

use crate::config::SummarizerConfig;
use crate::store::EventRecord;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

/// Chat-completions client used after an iteration ends.
#[derive(Debug, Clone)]
pub struct Summarizer {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
    model: String,
    max_tokens: u32,
}

impl Summarizer {
    /// Builds a client, or `None` when summarization is disabled.
    pub fn from_config(config: &SummarizerConfig) -> Result<Option<Self>> {
        if !config.enabled {
            return Ok(None);
        }
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .context("Failed to build summarizer HTTP client")?;
        Ok(Some(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            api_key: config.api_key.clone(),
            model: config.model.clone(),
            max_tokens: config.max_tokens,
        }))
    }

    /// Sends a single-message completion and returns the reply text.
    pub async fn complete(&self, prompt: &str) -> Result<String> {
        let body = json!({
            "model": self.model,
            "messages": [{ "role": "user", "content": prompt }],
            "max_tokens": self.max_tokens,
            "temperature": 0.3,
        });

        let mut request = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .json(&body);
        if !self.api_key.is_empty() {
            request = request.bearer_auth(&self.api_key);
        }

        let response = request
            .send()
            .await
            .context("Summarizer request failed")?;
        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            bail!("Summarizer returned {}: {}", status, text);
        }
        let value: Value = response
            .json()
            .await
            .context("Summarizer returned invalid JSON")?;
        Ok(extract_reply(&value))
    }

    /// Summarizes the purpose of one iteration from its recorded events.
    pub async fn summarize_iteration(&self, events: &[EventRecord]) -> Result<String> {
        match build_prompt(events) {
            Some(prompt) => self.complete(&prompt).await,
            None => Ok("No activity".to_string()),
        }
    }
}

fn build_prompt(events: &[EventRecord]) -> Option<String> {
    let log: Vec<String> = events
        .iter()
        .filter(|e| e.kind != "iteration_start" && e.kind != "iteration_end")
        .map(|e| format!("[{}] {}", e.kind, e.summary.trim()))
        .collect();
    if log.is_empty() {
        return None;
    }

    Some(format!(
        "An AI agent just completed one work iteration. Based on the events below, write a \
         single short sentence describing the PURPOSE or OUTCOME of what happened, not the \
         individual steps. Focus on what was achieved or what goal was being worked toward, \
         not which tools were called or files were read. Return only the summary sentence, \
         nothing else.\n\nEvents:\n{}",
        log.join("\n")
    ))
}

/// Pulls the answer out of a chat-completions response.
///
/// Some models leave `content` empty and put everything in
/// `reasoning_content`; in that case the last quoted line wins, else the last
/// non-empty line.
fn extract_reply(response: &Value) -> String {
    let message = &response["choices"][0]["message"];

    let content = message["content"].as_str().map(str::trim).unwrap_or("");
    if !content.is_empty() {
        return content.to_string();
    }

    let reasoning = message["reasoning_content"]
        .as_str()
        .map(str::trim)
        .unwrap_or("");
    let lines: Vec<&str> = reasoning
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .collect();

    lines
        .iter()
        .rev()
        .find_map(|line| unquote(line))
        .or_else(|| lines.last().copied())
        .unwrap_or("")
        .to_string()
}

fn unquote(line: &str) -> Option<&str> {
    let inner = line
        .strip_prefix(['"', '\u{201c}', '\u{201d}'])?
        .strip_suffix(['"', '\u{201c}', '\u{201d}'])?;
    (!inner.is_empty()).then_some(inner)
}
