//! Event fan-out for device and task lifecycle changes.

use serde::Serialize;
use serde_json::Value;
use tokio::sync::broadcast;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ConstellationEvent {
    DeviceConnected {
        device_id: String,
    },
    /// `failed` is set once reconnection gave up and the device is FAILED.
    DeviceDisconnected {
        device_id: String,
        failed: bool,
        reason: String,
    },
    TaskCompleted {
        task_id: String,
        device_id: String,
        result: Option<Value>,
    },
    TaskFailed {
        task_id: String,
        device_id: String,
        error: String,
    },
}

impl ConstellationEvent {
    pub fn device_id(&self) -> &str {
        match self {
            ConstellationEvent::DeviceConnected { device_id }
            | ConstellationEvent::DeviceDisconnected { device_id, .. }
            | ConstellationEvent::TaskCompleted { device_id, .. }
            | ConstellationEvent::TaskFailed { device_id, .. } => device_id,
        }
    }

    pub fn task_id(&self) -> Option<&str> {
        match self {
            ConstellationEvent::TaskCompleted { task_id, .. }
            | ConstellationEvent::TaskFailed { task_id, .. } => Some(task_id),
            _ => None,
        }
    }
}

/// In-process broadcast of [`ConstellationEvent`]s.
///
/// Slow subscribers lag and skip events rather than blocking publishers.
#[derive(Debug)]
pub struct EventManager {
    tx: broadcast::Sender<ConstellationEvent>,
    capacity: usize,
}

impl EventManager {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let (tx, _) = broadcast::channel(capacity);
        Self { tx, capacity }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Publish to every current subscriber. Returns how many received it.
    pub fn publish(&self, event: ConstellationEvent) -> usize {
        // No subscribers is not an error.
        self.tx.send(event).unwrap_or(0)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ConstellationEvent> {
        self.tx.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for EventManager {
    fn default() -> Self {
        Self::new(1024)
    }
}
