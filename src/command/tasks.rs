//! Task commands: add, remove, update.

use super::{apply_validated, available, Command, Snapshot};
use crate::core::{Constellation, Task, TaskPriority, TaskStatus};
use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

/// Minimal description of a new task, as accepted at the tool boundary.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TaskSpec {
    /// Generated as `task_<hex>` when absent.
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub target_device_id: Option<String>,
    #[serde(default)]
    pub tips: Vec<String>,
    #[serde(default)]
    pub priority: TaskPriority,
    #[serde(default)]
    pub metadata: Map<String, Value>,
}

impl TaskSpec {
    pub fn new(id: &str, name: &str, description: &str) -> Self {
        Self {
            id: Some(id.to_string()),
            name: name.to_string(),
            description: description.to_string(),
            ..Default::default()
        }
    }

    pub fn into_task(self) -> Task {
        let id = self
            .id
            .unwrap_or_else(|| format!("task_{}", &Uuid::new_v4().simple().to_string()[..8]));
        let name = if self.name.is_empty() { id.clone() } else { self.name };
        let mut task = Task::new(&id, &name, &self.description)
            .with_tips(self.tips)
            .with_priority(self.priority);
        task.target_device_id = self.target_device_id;
        task.metadata = self.metadata;
        task
    }
}

/// Field changes for an existing task. The id cannot be changed; an `id`
/// key is rejected when parsing.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TaskUpdate {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<TaskStatus>,
    /// An empty string unpins the task.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_device_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tips: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority: Option<TaskPriority>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Map<String, Value>>,
}

impl TaskUpdate {
    pub fn is_empty(&self) -> bool {
        *self == TaskUpdate::default()
    }

    fn apply(&self, task: &mut Task) {
        if let Some(name) = &self.name {
            task.name = name.clone();
        }
        if let Some(description) = &self.description {
            task.description = description.clone();
        }
        if let Some(status) = self.status {
            task.status = status;
        }
        if let Some(device) = &self.target_device_id {
            task.target_device_id = (!device.is_empty()).then(|| device.clone());
        }
        if let Some(tips) = &self.tips {
            task.tips = tips.clone();
        }
        if let Some(priority) = self.priority {
            task.priority = priority;
        }
        if let Some(metadata) = &self.metadata {
            task.metadata.extend(metadata.clone());
        }
        task.touch();
    }
}

// ========== AddTask ==========

#[derive(Debug)]
pub struct AddTaskCommand {
    task: Task,
    snapshot: Snapshot,
}

impl AddTaskCommand {
    pub fn new(task: Task) -> Self {
        Self {
            task,
            snapshot: Snapshot::default(),
        }
    }

    pub fn from_spec(spec: TaskSpec) -> Self {
        Self::new(spec.into_task())
    }

    pub fn task_id(&self) -> &str {
        &self.task.id
    }
}

impl Command for AddTaskCommand {
    fn name(&self) -> &'static str {
        "add_task"
    }

    fn description(&self) -> String {
        format!("Add task '{}'", self.task.id)
    }

    fn cannot_execute_reason(&self, constellation: &Constellation) -> Option<String> {
        if self.task.id.is_empty() {
            return Some("Task id must not be empty".to_string());
        }
        constellation.has_task(&self.task.id).then(|| {
            format!(
                "Task '{}' already exists. Existing tasks: [{}]",
                self.task.id,
                constellation.task_ids().join(", ")
            )
        })
    }

    fn execute(&mut self, constellation: &mut Constellation) -> Result<()> {
        let task = self.task.clone();
        apply_validated(self.name(), &mut self.snapshot, constellation, |c| {
            c.add_task(task)
        })
    }

    fn undo(&mut self, constellation: &mut Constellation) -> Result<()> {
        self.snapshot.restore(constellation)
    }
}

// ========== RemoveTask ==========

#[derive(Debug)]
pub struct RemoveTaskCommand {
    task_id: String,
    snapshot: Snapshot,
}

impl RemoveTaskCommand {
    pub fn new(task_id: &str) -> Self {
        Self {
            task_id: task_id.to_string(),
            snapshot: Snapshot::default(),
        }
    }
}

impl Command for RemoveTaskCommand {
    fn name(&self) -> &'static str {
        "remove_task"
    }

    fn description(&self) -> String {
        format!("Remove task '{}'", self.task_id)
    }

    fn cannot_execute_reason(&self, constellation: &Constellation) -> Option<String> {
        match constellation.get_task(&self.task_id) {
            None => Some(format!(
                "Task '{}' not found. {}",
                self.task_id,
                available("tasks", &constellation.task_ids())
            )),
            Some(task) if task.status == TaskStatus::Running => Some(format!(
                "Task '{}' is running and cannot be removed",
                self.task_id
            )),
            Some(_) => None,
        }
    }

    fn execute(&mut self, constellation: &mut Constellation) -> Result<()> {
        let task_id = self.task_id.clone();
        apply_validated(self.name(), &mut self.snapshot, constellation, |c| {
            c.remove_task(&task_id).map(|_| ())
        })
    }

    fn undo(&mut self, constellation: &mut Constellation) -> Result<()> {
        self.snapshot.restore(constellation)
    }
}

// ========== UpdateTask ==========

#[derive(Debug)]
pub struct UpdateTaskCommand {
    task_id: String,
    updates: TaskUpdate,
    snapshot: Snapshot,
}

impl UpdateTaskCommand {
    pub fn new(task_id: &str, updates: TaskUpdate) -> Self {
        Self {
            task_id: task_id.to_string(),
            updates,
            snapshot: Snapshot::default(),
        }
    }
}

impl Command for UpdateTaskCommand {
    fn name(&self) -> &'static str {
        "update_task"
    }

    fn description(&self) -> String {
        format!("Update task '{}'", self.task_id)
    }

    fn cannot_execute_reason(&self, constellation: &Constellation) -> Option<String> {
        if !constellation.has_task(&self.task_id) {
            return Some(format!(
                "Task '{}' not found. {}",
                self.task_id,
                available("tasks", &constellation.task_ids())
            ));
        }
        self.updates
            .is_empty()
            .then(|| format!("No fields to update for task '{}'", self.task_id))
    }

    fn execute(&mut self, constellation: &mut Constellation) -> Result<()> {
        let task_id = self.task_id.clone();
        let updates = self.updates.clone();
        apply_validated(self.name(), &mut self.snapshot, constellation, |c| {
            let task = c
                .get_task_mut(&task_id)
                .ok_or_else(|| Error::TaskNotFound(task_id.clone()))?;
            updates.apply(task);
            c.touch();
            Ok(())
        })
    }

    fn undo(&mut self, constellation: &mut Constellation) -> Result<()> {
        self.snapshot.restore(constellation)
    }
}
