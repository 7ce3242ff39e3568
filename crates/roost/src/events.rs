//! Per-workload event bus.
//!
//! Each environment owns an [`EventBus`]. The stats poller, the lifecycle
//! driver and the installer publish into it; console and telemetry consumers
//! subscribe. Publishers never block on slow consumers: a lagging receiver
//! loses the oldest events.

use log::trace;
use serde::Serialize;
use serde_json::json;
use tokio::sync::broadcast;

use crate::environment::state::ProcessState;
use crate::environment::stats::StatsSample;

/// Size of the broadcast channel for events.
const EVENT_BUFFER_SIZE: usize = 256;

pub const TOPIC_RESOURCE: &str = "resource";
pub const TOPIC_STATUS: &str = "status";
pub const TOPIC_INSTALL_OUTPUT: &str = "install output";
pub const TOPIC_INSTALL_STARTED: &str = "install started";
pub const TOPIC_INSTALL_COMPLETED: &str = "install completed";

/// Something that happened to a workload.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Event {
    /// Normalized usage sample.
    Resource(StatsSample),
    /// The process state changed.
    State(ProcessState),
    /// One line of installer output.
    InstallOutput(String),
    InstallStarted,
    InstallCompleted { successful: bool },
}

impl Event {
    /// Topic name consumers filter on.
    pub fn topic(&self) -> &'static str {
        match self {
            Event::Resource(_) => TOPIC_RESOURCE,
            Event::State(_) => TOPIC_STATUS,
            Event::InstallOutput(_) => TOPIC_INSTALL_OUTPUT,
            Event::InstallStarted => TOPIC_INSTALL_STARTED,
            Event::InstallCompleted { .. } => TOPIC_INSTALL_COMPLETED,
        }
    }

    /// `{"event": <topic>, "args": [...]}` form used on the wire.
    pub fn envelope(&self) -> serde_json::Value {
        let args = match self {
            Event::InstallStarted => json!([]),
            other => json!([other]),
        };
        json!({ "event": self.topic(), "args": args })
    }
}

/// Broadcast hub for one workload's events.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<Event>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(EVENT_BUFFER_SIZE);
        Self { tx }
    }

    /// Publish an event. Having no subscribers is not an error.
    pub fn publish(&self, event: Event) {
        let topic = event.topic();
        match self.tx.send(event) {
            Ok(receivers) => trace!("published {} to {} receiver(s)", topic, receivers),
            Err(_) => trace!("dropped {} event, no subscribers", topic),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.tx.subscribe()
    }

    pub fn receiver_count(&self) -> usize {
        self.tx.receiver_count()
    }
}
