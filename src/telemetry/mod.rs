//! Agent telemetry ingestion.
//!
//! The workload reports activity as batches tagged with its own iteration
//! sequence number. [`Reconciler`] maps those onto durable iteration records,
//! drops replayed events and forwards new ones to the live feed.

mod reconciler;
mod summarizer;

pub use reconciler::{IngestOutcome, Reconciler, DEDUP_PREFIX_CHARS};
pub use summarizer::Summarizer;

use serde::{Deserialize, Serialize};

/// Errors surfaced while ingesting telemetry.
#[derive(Debug, thiserror::Error)]
pub enum TelemetryError {
    /// The payload could not be parsed or failed validation.
    #[error("Malformed telemetry payload: {message}")]
    Malformed { message: String },

    /// The record store rejected a write.
    #[error("Telemetry store error: {0}")]
    Store(#[from] anyhow::Error),
}

impl TelemetryError {
    /// Creates a `Malformed` error.
    pub fn malformed(message: impl Into<String>) -> Self {
        Self::Malformed {
            message: message.into(),
        }
    }

    /// Returns true if the caller sent a bad payload.
    pub fn is_malformed(&self) -> bool {
        matches!(self, Self::Malformed { .. })
    }
}

/// Event types that only mark iteration boundaries.
pub const LIFECYCLE_KINDS: [&str; 2] = ["iteration_start", "iteration_end"];

/// Event types counted as agent actions.
pub const TOOL_KINDS: [&str; 2] = ["tool_call", "tool_use"];

/// A batch of events for one agent iteration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TelemetryBatch {
    /// Agent-local iteration sequence number.
    #[serde(rename = "iterationId")]
    pub seq: i64,
    pub events: Vec<TelemetryEvent>,
}

/// A single agent-reported event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TelemetryEvent {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub summary: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<String>,
}

impl TelemetryEvent {
    pub fn new(kind: &str, summary: &str) -> Self {
        Self {
            kind: kind.to_string(),
            summary: summary.to_string(),
            content: None,
            timestamp: None,
        }
    }

    /// Returns true for iteration boundary markers.
    pub fn is_lifecycle(&self) -> bool {
        LIFECYCLE_KINDS.contains(&self.kind.as_str())
    }

    /// Returns true for tool invocations.
    pub fn is_tool_use(&self) -> bool {
        TOOL_KINDS.contains(&self.kind.as_str())
    }
}

/// End-of-iteration report.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IterationReport {
    #[serde(rename = "iterationId")]
    pub seq: i64,
    #[serde(default)]
    pub summary: String,
    #[serde(default)]
    pub action_count: u32,
    #[serde(default)]
    pub error_count: u32,
    pub vitals: Vitals,
}

/// Resource usage at iteration end.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Vitals {
    /// CPU percent.
    pub cpu: f64,
    /// Memory in MB.
    pub memory: f64,
    /// Disk in MB.
    pub disk: f64,
}

impl TelemetryBatch {
    /// Parses and validates a JSON request body.
    pub fn from_json(body: &[u8]) -> Result<Self, TelemetryError> {
        let batch: Self =
            serde_json::from_slice(body).map_err(|e| TelemetryError::malformed(e.to_string()))?;
        if let Some(pos) = batch.events.iter().position(|e| e.kind.trim().is_empty()) {
            return Err(TelemetryError::malformed(format!(
                "event {pos} has an empty type"
            )));
        }
        Ok(batch)
    }
}

impl IterationReport {
    /// Parses and validates a JSON request body.
    pub fn from_json(body: &[u8]) -> Result<Self, TelemetryError> {
        let report: Self =
            serde_json::from_slice(body).map_err(|e| TelemetryError::malformed(e.to_string()))?;
        let Vitals { cpu, memory, disk } = report.vitals;
        if !(cpu.is_finite() && memory.is_finite() && disk.is_finite()) {
            return Err(TelemetryError::malformed("vitals must be finite numbers"));
        }
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_batch_from_json() {
        let body = br#"{
            "iterationId": 3,
            "events": [
                { "type": "thought", "summary": "Thinking" },
                { "type": "tool_call", "summary": "Running bash: ls", "timestamp": "2025-01-01T00:00:00Z" }
            ]
        }"#;
        let batch = TelemetryBatch::from_json(body).unwrap();
        assert_eq!(batch.seq, 3);
        assert_eq!(batch.events.len(), 2);
        assert!(batch.events[1].is_tool_use());
        assert_eq!(
            batch.events[1].timestamp.as_deref(),
            Some("2025-01-01T00:00:00Z")
        );
    }

    #[test]
    fn test_batch_rejects_malformed() {
        let err = TelemetryBatch::from_json(br#"{ "events": [] }"#).unwrap_err();
        assert!(err.is_malformed());

        let err = TelemetryBatch::from_json(br#"{ "iterationId": 1, "events": [{ "type": " " }] }"#)
            .unwrap_err();
        assert!(err.to_string().contains("empty type"));
    }

    #[test]
    fn test_report_from_json() {
        let body = br#"{
            "iterationId": 1,
            "summary": "Explored the environment",
            "actionCount": 5,
            "errorCount": 0,
            "vitals": { "cpu": 12.5, "memory": 256, "disk": 1024 }
        }"#;
        let report = IterationReport::from_json(body).unwrap();
        assert_eq!(report.action_count, 5);
        assert!((report.vitals.cpu - 12.5).abs() < f64::EPSILON);

        assert!(IterationReport::from_json(br#"{ "iterationId": 1 }"#)
            .unwrap_err()
            .is_malformed());
    }

    #[test]
    fn test_lifecycle_markers() {
        assert!(TelemetryEvent::new("iteration_start", "").is_lifecycle());
        assert!(TelemetryEvent::new("iteration_end", "").is_lifecycle());
        assert!(!TelemetryEvent::new("thought", "").is_lifecycle());
    }
}
