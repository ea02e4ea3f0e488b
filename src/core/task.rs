//! Task data model for the constellation graph.
//!
//! Tasks are the nodes of a constellation. Each task tracks its status,
//! target device, execution hints, and the result reported by the device
//! that ran it.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Task status in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskStatus {
    /// Task created and not yet dispatched.
    #[default]
    Pending,
    /// Task is waiting for one or more dependencies to be satisfied.
    WaitingDependency,
    /// Task is currently executing on a device.
    Running,
    /// Task completed successfully.
    Completed,
    /// Task failed.
    Failed,
}

impl TaskStatus {
    /// Completed or Failed.
    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::Failed)
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TaskStatus::Pending => write!(f, "pending"),
            TaskStatus::WaitingDependency => write!(f, "waiting_dependency"),
            TaskStatus::Running => write!(f, "running"),
            TaskStatus::Completed => write!(f, "completed"),
            TaskStatus::Failed => write!(f, "failed"),
        }
    }
}

/// Scheduling priority of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskPriority {
    Low,
    #[default]
    Medium,
    High,
    Critical,
}

/// A single node in the constellation graph.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    /// Unique identifier. Never changes after creation.
    pub id: String,
    /// Short human-readable name.
    pub name: String,
    /// What the task should accomplish, sent verbatim to the device.
    pub description: String,
    #[serde(default)]
    pub status: TaskStatus,
    /// Device the task is pinned to, if any.
    #[serde(default)]
    pub target_device_id: Option<String>,
    /// Ordered execution hints for the device.
    #[serde(default)]
    pub tips: Vec<String>,
    /// Opaque result reported by the device.
    #[serde(default)]
    pub result: Option<Value>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub priority: TaskPriority,
    #[serde(default)]
    pub metadata: Map<String, Value>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
}

impl Task {
    /// Create a new pending task.
    pub fn new(id: &str, name: &str, description: &str) -> Self {
        let now = Utc::now();
        Self {
            id: id.to_string(),
            name: name.to_string(),
            description: description.to_string(),
            status: TaskStatus::Pending,
            target_device_id: None,
            tips: Vec::new(),
            result: None,
            error: None,
            priority: TaskPriority::Medium,
            metadata: Map::new(),
            created_at: now,
            updated_at: now,
            started_at: None,
            completed_at: None,
        }
    }

    pub fn with_target_device(mut self, device_id: &str) -> Self {
        self.target_device_id = Some(device_id.to_string());
        self
    }

    pub fn with_tips(mut self, tips: Vec<String>) -> Self {
        self.tips = tips;
        self
    }

    pub fn with_priority(mut self, priority: TaskPriority) -> Self {
        self.priority = priority;
        self
    }

    /// Transition to Running and record the start time.
    pub fn start(&mut self) {
        self.status = TaskStatus::Running;
        self.started_at = Some(Utc::now());
        self.touch();
    }

    /// Transition to Completed, storing the device result.
    pub fn complete(&mut self, result: Option<Value>) {
        self.status = TaskStatus::Completed;
        self.result = result;
        self.error = None;
        self.completed_at = Some(Utc::now());
        self.touch();
    }

    /// Transition to Failed with an error message.
    pub fn fail(&mut self, error: &str) {
        self.status = TaskStatus::Failed;
        self.error = Some(error.to_string());
        self.completed_at = Some(Utc::now());
        self.touch();
    }

    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }

    pub fn is_finished(&self) -> bool {
        self.status.is_terminal()
    }

    /// Pending or WaitingDependency.
    pub fn can_start(&self) -> bool {
        matches!(
            self.status,
            TaskStatus::Pending | TaskStatus::WaitingDependency
        )
    }
}
