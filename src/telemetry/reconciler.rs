//! Maps agent-local iteration sequence numbers onto durable records.

use serde_json::json;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::{IterationReport, Summarizer, TelemetryBatch, TelemetryError, TelemetryEvent};
use crate::feed::{kinds, Broadcaster, FeedMessage};
use crate::store::Store;

/// Characters of an event summary that take part in duplicate detection.
///
/// Distinct events whose summaries share this prefix are merged. Agents
/// re-emit their full state on every update, so the approximation is kept.
pub const DEDUP_PREFIX_CHARS: usize = 80;

/// Result of ingesting one batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IngestOutcome {
    /// Durable iteration id the batch was recorded under.
    pub iteration_id: i64,
    pub received: usize,
    pub persisted: usize,
    pub duplicates: usize,
}

type IterationKey = (Option<String>, i64);

#[derive(Debug, Default)]
struct TrackedIteration {
    durable_id: i64,
    seen: HashSet<String>,
    actions: u32,
    errors: u32,
    reported: (u32, u32),
}

#[derive(Debug, Default)]
struct ReconcilerState {
    iterations: HashMap<IterationKey, TrackedIteration>,
}

/// Turns an at-least-once event stream into deduplicated iteration records.
pub struct Reconciler {
    store: Arc<dyn Store>,
    feed: Broadcaster,
    summarizer: Option<Arc<Summarizer>>,
    state: Mutex<ReconcilerState>,
}

fn dedup_key(event: &TelemetryEvent) -> String {
    let prefix: String = event.summary.chars().take(DEDUP_PREFIX_CHARS).collect();
    format!("{}\u{1f}{}", event.kind, prefix)
}

impl Reconciler {
    pub fn new(store: Arc<dyn Store>, feed: Broadcaster) -> Self {
        Self {
            store,
            feed,
            summarizer: None,
            state: Mutex::new(ReconcilerState::default()),
        }
    }

    /// Enables background summaries after each iteration end.
    #[must_use]
    pub fn with_summarizer(mut self, summarizer: Option<Summarizer>) -> Self {
        self.summarizer = summarizer.map(Arc::new);
        self
    }

    fn lock(&self) -> MutexGuard<'_, ReconcilerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Number of iterations currently cached.
    pub fn tracked(&self) -> usize {
        self.lock().iterations.len()
    }

    /// Forgets every cached mapping. Called when a session starts or ends.
    pub fn reset(&self) {
        self.lock().iterations.clear();
    }

    fn current_session(&self) -> Result<Option<String>, TelemetryError> {
        let session = self.store.active_session()?.map(|s| s.id);
        if session.is_none() {
            warn!("Telemetry received with no active session, recording without one");
        }
        Ok(session)
    }

    fn resolve<'a>(
        &self,
        state: &'a mut ReconcilerState,
        key: IterationKey,
    ) -> Result<&'a mut TrackedIteration, TelemetryError> {
        if !state.iterations.contains_key(&key) {
            let (session_id, seq) = (key.0.as_deref(), key.1);
            let tracked = if let Some(existing) = self.store.find_iteration(session_id, seq)? {
                // Replays after a control-plane restart must not duplicate
                // events already on record.
                let seen = self
                    .store
                    .events_for_iteration(existing.id)?
                    .iter()
                    .map(|e| {
                        dedup_key(&TelemetryEvent::new(&e.kind, &e.summary))
                    })
                    .collect();
                debug!("Resumed iteration {} for seq {}", existing.id, seq);
                TrackedIteration {
                    durable_id: existing.id,
                    seen,
                    actions: existing.action_count,
                    errors: existing.error_count,
                    reported: (existing.action_count, existing.error_count),
                }
            } else {
                if state.iterations.is_empty() {
                    let closed = self.store.close_open_iterations()?;
                    if closed > 0 {
                        info!("Closed {} iteration(s) left open", closed);
                    }
                }
                let iteration = self.store.start_iteration(Some(seq), session_id)?;
                debug!("Started iteration {} for seq {}", iteration.id, seq);
                TrackedIteration {
                    durable_id: iteration.id,
                    ..TrackedIteration::default()
                }
            };
            state.iterations.insert(key.clone(), tracked);
        }

        state
            .iterations
            .get_mut(&key)
            .ok_or_else(|| TelemetryError::Store(anyhow::anyhow!("iteration cache miss")))
    }

    /// Records the new events of a batch and forwards them to the feed.
    pub fn ingest(&self, batch: &TelemetryBatch) -> Result<IngestOutcome, TelemetryError> {
        let session = self.current_session()?;
        let mut state = self.lock();
        let tracked = self.resolve(&mut state, (session, batch.seq))?;

        let mut outcome = IngestOutcome {
            iteration_id: tracked.durable_id,
            received: batch.events.len(),
            persisted: 0,
            duplicates: 0,
        };

        for event in batch.events.iter().filter(|e| !e.is_lifecycle()) {
            if !tracked.seen.insert(dedup_key(event)) {
                outcome.duplicates += 1;
                continue;
            }

            self.store.insert_event(
                tracked.durable_id,
                &event.kind,
                &event.summary,
                event.content.as_deref(),
            )?;
            outcome.persisted += 1;

            if event.is_tool_use() {
                tracked.actions += 1;
            } else if event.kind == "error" {
                tracked.errors += 1;
            }

            let message = FeedMessage::new(
                event.kind.clone(),
                json!({
                    "iterationId": batch.seq,
                    "summary": event.summary,
                    "content": event.content,
                }),
            )
            .with_timestamp(event.timestamp.clone());
            self.feed.broadcast(&message);
        }

        let counts = (tracked.actions, tracked.errors);
        if counts != tracked.reported {
            self.store
                .update_iteration_counts(tracked.durable_id, counts.0, counts.1)?;
            tracked.reported = counts;
        }

        if outcome.duplicates > 0 {
            debug!(
                "Skipped {} replayed event(s) for seq {}",
                outcome.duplicates, batch.seq
            );
        }
        Ok(outcome)
    }

    /// Finalizes an iteration.
    ///
    /// Returns the handle of the background summary task when a summarizer is
    /// configured and a runtime is available.
    pub fn end_iteration(
        &self,
        report: &IterationReport,
    ) -> Result<Option<JoinHandle<()>>, TelemetryError> {
        let session = self.current_session()?;
        let key = (session, report.seq);
        let durable_id = {
            let mut state = self.lock();
            let id = self.resolve(&mut state, key.clone())?.durable_id;
            self.store
                .end_iteration(id, &report.summary, report.action_count, report.error_count)?;
            state.iterations.remove(&key);
            id
        };

        self.store.insert_vitals(
            report.vitals.cpu,
            report.vitals.memory,
            report.vitals.disk,
        )?;

        self.feed.send(
            kinds::ITERATION_END,
            json!({
                "iterationId": report.seq,
                "summary": report.summary,
                "vitals": report.vitals,
            }),
        );
        info!("Iteration {} (seq {}) ended", durable_id, report.seq);

        Ok(self.spawn_summary(durable_id, report.seq))
    }

    fn spawn_summary(&self, durable_id: i64, seq: i64) -> Option<JoinHandle<()>> {
        let summarizer = self.summarizer.clone()?;
        let runtime = tokio::runtime::Handle::try_current().ok()?;
        let store = Arc::clone(&self.store);
        let feed = self.feed.clone();

        Some(runtime.spawn(async move {
            let events = match store.events_for_iteration(durable_id) {
                Ok(events) => events,
                Err(e) => {
                    warn!("Could not load events for summary: {:#}", e);
                    return;
                }
            };
            let summary = match summarizer.summarize_iteration(&events).await {
                Ok(summary) if !summary.is_empty() => summary,
                Ok(_) => return,
                Err(e) => {
                    warn!("Iteration summary failed: {:#}", e);
                    return;
                }
            };
            if let Err(e) = store
                .update_iteration_summary(durable_id, &summary)
                .and_then(|()| store.flush())
            {
                warn!("Could not store iteration summary: {:#}", e);
                return;
            }
            feed.send(
                kinds::ITERATION_SUMMARY,
                json!({ "iterationId": seq, "summary": summary }),
            );
        }))
    }
}
