//! Live event feed for dashboard observers.
//!
//! [`Broadcaster`] fans JSON messages `{type, data, timestamp}` out to every
//! registered observer. An observer whose send fails is dropped without
//! disturbing delivery to the others. While at least one observer is
//! registered a `ping` heartbeat is broadcast on a fixed interval.

use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::debug;

/// Message type tags understood by the dashboard.
pub mod kinds {
    pub const CONNECTED: &str = "connected";
    pub const SESSION_START: &str = "session_start";
    pub const SESSION_END: &str = "session_end";
    pub const ITERATION_START: &str = "iteration_start";
    pub const ITERATION_END: &str = "iteration_end";
    pub const ITERATION_SUMMARY: &str = "iteration_summary";
    pub const SHOWCASE_LAUNCHED: &str = "showcase_launched";
    pub const SHOWCASE_STOPPED: &str = "showcase_stopped";
    pub const SHOWCASE_READY: &str = "showcase_ready";
    pub const MAILBOX_UPDATE: &str = "mailbox_update";
    /// Liveness only; never displayed.
    pub const PING: &str = "ping";
}

/// One message on the feed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeedMessage {
    #[serde(rename = "type")]
    pub kind: String,
    pub data: Value,
    pub timestamp: Option<String>,
}

impl FeedMessage {
    pub fn new(kind: impl Into<String>, data: Value) -> Self {
        Self {
            kind: kind.into(),
            data,
            timestamp: None,
        }
    }

    /// Keeps a producer-supplied timestamp.
    #[must_use]
    pub fn with_timestamp(mut self, timestamp: Option<String>) -> Self {
        self.timestamp = timestamp;
        self
    }

    fn stamped(&self) -> Self {
        let mut message = self.clone();
        if message.timestamp.is_none() {
            message.timestamp = Some(Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true));
        }
        message
    }
}

/// Error returned by an observer that can no longer accept messages.
#[derive(Debug, thiserror::Error)]
#[error("Observer disconnected: {0}")]
pub struct ObserverGone(pub String);

/// A connected feed consumer.
pub trait Observer: Send + Sync {
    /// Delivers one serialized message. Must not block.
    fn send(&self, message: &str) -> Result<(), ObserverGone>;
}

/// Observer backed by an unbounded channel; the transport layer drains the
/// receiving end into its socket.
#[derive(Debug, Clone)]
pub struct ChannelObserver {
    tx: mpsc::UnboundedSender<String>,
}

impl ChannelObserver {
    pub fn new(tx: mpsc::UnboundedSender<String>) -> Self {
        Self { tx }
    }
}

impl Observer for ChannelObserver {
    fn send(&self, message: &str) -> Result<(), ObserverGone> {
        self.tx
            .send(message.to_string())
            .map_err(|e| ObserverGone(e.to_string()))
    }
}

/// Handle identifying a registered observer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ObserverId(u64);

#[derive(Default)]
struct Registry {
    next_id: u64,
    observers: Vec<(ObserverId, Arc<dyn Observer>)>,
    heartbeat: Option<JoinHandle<()>>,
}

impl Registry {
    fn stop_heartbeat_if_idle(&mut self) {
        if self.observers.is_empty() {
            if let Some(task) = self.heartbeat.take() {
                debug!("Last observer gone, stopping heartbeat");
                task.abort();
            }
        }
    }
}

/// Shared pub/sub hub. Cloning yields another handle to the same registry.
#[derive(Clone)]
pub struct Broadcaster {
    registry: Arc<Mutex<Registry>>,
    heartbeat: Duration,
}

impl std::fmt::Debug for Broadcaster {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Broadcaster")
            .field("observers", &self.observer_count())
            .field("heartbeat", &self.heartbeat)
            .finish()
    }
}

impl Broadcaster {
    /// Creates a hub that pings observers every `heartbeat`.
    pub fn new(heartbeat: Duration) -> Self {
        Self {
            registry: Arc::new(Mutex::new(Registry::default())),
            heartbeat,
        }
    }

    fn lock(registry: &Mutex<Registry>) -> MutexGuard<'_, Registry> {
        registry.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Number of registered observers.
    pub fn observer_count(&self) -> usize {
        Self::lock(&self.registry).observers.len()
    }

    /// Returns true while the heartbeat task is scheduled.
    pub fn heartbeat_running(&self) -> bool {
        Self::lock(&self.registry).heartbeat.is_some()
    }

    /// Adds an observer. The first registration starts the heartbeat when a
    /// Tokio runtime is available.
    pub fn register(&self, observer: Arc<dyn Observer>) -> ObserverId {
        let mut registry = Self::lock(&self.registry);
        registry.next_id += 1;
        let id = ObserverId(registry.next_id);
        registry.observers.push((id, observer));

        if registry.heartbeat.is_none() {
            if let Ok(runtime) = tokio::runtime::Handle::try_current() {
                let weak = Arc::downgrade(&self.registry);
                registry.heartbeat = Some(runtime.spawn(heartbeat_loop(weak, self.heartbeat)));
                debug!("Heartbeat started");
            }
        }
        id
    }

    /// Registers a channel-backed observer and acknowledges the connection
    /// on it.
    pub fn subscribe(&self) -> (ObserverId, mpsc::UnboundedReceiver<String>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let observer = ChannelObserver::new(tx);
        let ack = FeedMessage::new(kinds::CONNECTED, Value::Null).stamped();
        if let Ok(text) = serde_json::to_string(&ack) {
            let _ = observer.send(&text);
        }
        (self.register(Arc::new(observer)), rx)
    }

    /// Removes an observer. Removing the last one stops the heartbeat.
    pub fn remove(&self, id: ObserverId) {
        let mut registry = Self::lock(&self.registry);
        registry.observers.retain(|(oid, _)| *oid != id);
        registry.stop_heartbeat_if_idle();
    }

    /// Stamps `message` if needed and delivers it to every observer.
    pub fn broadcast(&self, message: &FeedMessage) {
        deliver(&self.registry, message);
    }

    /// Convenience for `broadcast(&FeedMessage::new(kind, data))`.
    pub fn send(&self, kind: &str, data: Value) {
        self.broadcast(&FeedMessage::new(kind, data));
    }
}

fn deliver(registry: &Mutex<Registry>, message: &FeedMessage) {
    let text = match serde_json::to_string(&message.stamped()) {
        Ok(text) => text,
        Err(e) => {
            debug!("Dropping unserializable feed message: {}", e);
            return;
        }
    };

    // Delivery happens under the lock so each observer sees messages in
    // broadcast-call order.
    let mut registry = Broadcaster::lock(registry);
    registry.observers.retain(|(id, observer)| match observer.send(&text) {
        Ok(()) => true,
        Err(e) => {
            debug!("Dropping observer {:?}: {}", id, e);
            false
        }
    });
    registry.stop_heartbeat_if_idle();
}

async fn heartbeat_loop(registry: Weak<Mutex<Registry>>, every: Duration) {
    let mut ticker = tokio::time::interval(every);
    // The first tick completes immediately.
    ticker.tick().await;
    loop {
        ticker.tick().await;
        let Some(registry) = registry.upgrade() else {
            break;
        };
        deliver(&registry, &FeedMessage::new(kinds::PING, Value::Null));
    }
}
