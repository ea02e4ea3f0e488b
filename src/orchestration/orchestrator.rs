//! Single-task dispatch and completion tracking.
//!
//! Every dispatched task gets a pending entry holding the sending half of a
//! one-shot channel. The first `complete_task` or `fail_task` for an id
//! takes the entry out of the map and resolves it; later calls, and calls
//! for ids that already timed out, find nothing and do nothing. A result
//! reported by any device other than the one the task was sent to is
//! ignored and the entry stays pending.
//!
//! Resolution wakes the waiter first, then runs the task's callback, then
//! publishes the completion event.
//!
//! A timeout only abandons the local wait. The device is never told to
//! stop.

use crate::device::{
    ConnectionManager, ConstellationEvent, DeviceRegistry, DeviceSignal, EventManager, TaskRequest,
};
use crate::error::{Error, Result};
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, Mutex};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// How a dispatched task ended.
#[derive(Debug, Clone, PartialEq)]
pub enum TaskOutcome {
    Completed(Option<Value>),
    Failed(String),
}

impl TaskOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, TaskOutcome::Completed(_))
    }
}

/// Successful result of [`TaskOrchestrator::execute_task`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TaskResult {
    pub task_id: String,
    pub device_id: String,
    pub result: Option<Value>,
}

/// Runs once when a task resolves, with `(task_id, device_id, outcome)`.
pub type TaskCallback = Box<dyn FnOnce(&str, &str, &TaskOutcome) -> Result<()> + Send>;

struct PendingTask {
    device_id: String,
    tx: oneshot::Sender<TaskOutcome>,
    callback: Option<TaskCallback>,
}

pub struct TaskOrchestrator {
    registry: Arc<DeviceRegistry>,
    connections: Arc<ConnectionManager>,
    events: Arc<EventManager>,
    signal_tx: mpsc::UnboundedSender<DeviceSignal>,
    pending: Mutex<HashMap<String, PendingTask>>,
    counter: AtomicU64,
}

impl TaskOrchestrator {
    pub fn new(
        registry: Arc<DeviceRegistry>,
        connections: Arc<ConnectionManager>,
        events: Arc<EventManager>,
        signal_tx: mpsc::UnboundedSender<DeviceSignal>,
    ) -> Self {
        Self {
            registry,
            connections,
            events,
            signal_tx,
            pending: Mutex::new(HashMap::new()),
            counter: AtomicU64::new(0),
        }
    }

    /// Process-unique task id: a counter plus a random suffix.
    pub fn generate_task_id(&self) -> String {
        let n = self.counter.fetch_add(1, Ordering::Relaxed) + 1;
        let suffix = Uuid::new_v4().simple().to_string();
        format!("task_{}_{}", n, &suffix[..8])
    }

    /// Send a task and wait for its outcome, up to `request.timeout`.
    pub async fn execute_task(
        &self,
        request: TaskRequest,
        callback: Option<TaskCallback>,
    ) -> Result<TaskResult> {
        let task_id = request.task_id.clone();
        let device_id = request.device_id.clone();

        if !self.registry.is_device_connected(&device_id).await
            || !self.connections.is_connected(&device_id).await
        {
            return Err(Error::DeviceNotConnected(device_id));
        }

        let (tx, rx) = oneshot::channel();
        {
            let mut pending = self.pending.lock().await;
            if pending.contains_key(&task_id) {
                return Err(Error::Execution(format!("Task {} is already pending", task_id)));
            }
            pending.insert(
                task_id.clone(),
                PendingTask {
                    device_id: device_id.clone(),
                    tx,
                    callback,
                },
            );
        }

        if let Err(e) = self.connections.send_task_to_device(&request).await {
            self.pending.lock().await.remove(&task_id);
            if let Error::Connection { reason, .. } = &e {
                let _ = self.signal_tx.send(DeviceSignal::ConnectionLost {
                    device_id: device_id.clone(),
                    reason: reason.clone(),
                });
            }
            return Err(e);
        }
        info!(task_id = %task_id, device_id = %device_id, "task dispatched");

        match tokio::time::timeout(request.timeout, rx).await {
            Err(_) => {
                self.pending.lock().await.remove(&task_id);
                warn!(task_id = %task_id, device_id = %device_id, timeout = ?request.timeout, "task timed out");
                Err(Error::timeout(format!("Task {}", task_id), request.timeout))
            }
            Ok(Err(_)) => Err(Error::TaskFailed {
                task_id,
                error: "task abandoned before completion".to_string(),
            }),
            Ok(Ok(TaskOutcome::Completed(result))) => Ok(TaskResult {
                task_id,
                device_id,
                result,
            }),
            Ok(Ok(TaskOutcome::Failed(error))) => Err(Error::TaskFailed { task_id, error }),
        }
    }

    /// Generate an id and dispatch `request` to `device_id`.
    pub async fn dispatch(
        &self,
        device_id: &str,
        request: &str,
        timeout: Duration,
    ) -> Result<TaskResult> {
        let task_id = self.generate_task_id();
        self.execute_task(TaskRequest::new(&task_id, device_id, request, timeout), None)
            .await
    }

    /// Resolve a pending task as completed on behalf of `device_id`.
    /// Returns false if nothing was pending for that device.
    pub async fn complete_task(&self, task_id: &str, device_id: &str, result: Option<Value>) -> bool {
        self.resolve(task_id, device_id, TaskOutcome::Completed(result))
            .await
    }

    /// Resolve a pending task as failed on behalf of `device_id`.
    /// Returns false if nothing was pending for that device.
    pub async fn fail_task(&self, task_id: &str, device_id: &str, error: &str) -> bool {
        self.resolve(task_id, device_id, TaskOutcome::Failed(error.to_string()))
            .await
    }

    /// Fail every task pending on a device. Returns how many were failed.
    pub async fn fail_device_tasks(&self, device_id: &str, reason: &str) -> usize {
        let ids: Vec<String> = self
            .pending
            .lock()
            .await
            .iter()
            .filter(|(_, p)| p.device_id == device_id)
            .map(|(id, _)| id.clone())
            .collect();

        let mut failed = 0;
        for id in ids {
            if self.fail_task(&id, device_id, reason).await {
                failed += 1;
            }
        }
        failed
    }

    pub async fn pending_count(&self) -> usize {
        self.pending.lock().await.len()
    }

    pub async fn is_pending(&self, task_id: &str) -> bool {
        self.pending.lock().await.contains_key(task_id)
    }

    async fn resolve(&self, task_id: &str, reporter: &str, outcome: TaskOutcome) -> bool {
        let entry = {
            let mut pending = self.pending.lock().await;
            match pending.get(task_id).map(|p| p.device_id.clone()) {
                None => {
                    debug!(task_id, "no pending task to resolve");
                    return false;
                }
                Some(owner) if owner != reporter => {
                    warn!(
                        task_id,
                        expected = %owner,
                        reporter,
                        "ignoring result from a device the task was not sent to"
                    );
                    return false;
                }
                Some(_) => pending.remove(task_id),
            }
        };
        let Some(entry) = entry else {
            return false;
        };
        let PendingTask {
            device_id,
            tx,
            callback,
        } = entry;

        let event = match &outcome {
            TaskOutcome::Completed(result) => ConstellationEvent::TaskCompleted {
                task_id: task_id.to_string(),
                device_id: device_id.clone(),
                result: result.clone(),
            },
            TaskOutcome::Failed(error) => ConstellationEvent::TaskFailed {
                task_id: task_id.to_string(),
                device_id: device_id.clone(),
                error: error.clone(),
            },
        };

        // The waiter may already be gone.
        let _ = tx.send(outcome.clone());
        if let Some(callback) = callback {
            run_callback(callback, task_id, &device_id, &outcome);
        }
        self.events.publish(event);
        true
    }
}

fn run_callback(callback: TaskCallback, task_id: &str, device_id: &str, outcome: &TaskOutcome) {
    match catch_unwind(AssertUnwindSafe(|| callback(task_id, device_id, outcome))) {
        Ok(Ok(())) => {}
        Ok(Err(e)) => error!(task_id, device_id, error = %e, "task callback failed"),
        Err(_) => error!(task_id, device_id, "task callback panicked"),
    }
}
