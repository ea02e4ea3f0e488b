//! Dependency commands: add, remove, update.

use super::{apply_validated, available, Command, Snapshot};
use crate::core::{Constellation, Dependency, DependencyType};
use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};

/// Minimal description of a new edge. The id defaults to `from->to`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DependencySpec {
    #[serde(default)]
    pub id: Option<String>,
    pub from_task_id: String,
    pub to_task_id: String,
    #[serde(default)]
    pub dependency_type: DependencyType,
    #[serde(default)]
    pub condition_description: String,
}

impl DependencySpec {
    pub fn new(from: &str, to: &str) -> Self {
        Self {
            from_task_id: from.to_string(),
            to_task_id: to.to_string(),
            ..Default::default()
        }
    }

    pub fn into_dependency(self) -> Dependency {
        let id = self
            .id
            .unwrap_or_else(|| Dependency::edge_id(&self.from_task_id, &self.to_task_id));
        Dependency::new(&id, &self.from_task_id, &self.to_task_id)
            .with_type(self.dependency_type)
            .with_condition(&self.condition_description)
    }
}

/// Field changes for an existing edge. Endpoints are fixed; re-pointing an
/// edge is a remove followed by an add.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DependencyUpdate {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dependency_type: Option<DependencyType>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition_description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub satisfied: Option<bool>,
}

impl DependencyUpdate {
    pub fn is_empty(&self) -> bool {
        *self == DependencyUpdate::default()
    }

    fn apply(&self, dependency: &mut Dependency) {
        if let Some(kind) = self.dependency_type {
            dependency.dependency_type = kind;
        }
        if let Some(condition) = &self.condition_description {
            dependency.condition_description = condition.clone();
        }
        if let Some(satisfied) = self.satisfied {
            dependency.satisfied = satisfied;
        }
    }
}

fn missing_dependency(constellation: &Constellation, dependency_id: &str) -> String {
    format!(
        "Dependency '{}' not found. {}",
        dependency_id,
        available("dependencies", &constellation.dependency_ids())
    )
}

// ========== AddDependency ==========

#[derive(Debug)]
pub struct AddDependencyCommand {
    dependency: Dependency,
    snapshot: Snapshot,
}

impl AddDependencyCommand {
    pub fn new(dependency: Dependency) -> Self {
        Self {
            dependency,
            snapshot: Snapshot::default(),
        }
    }

    pub fn from_spec(spec: DependencySpec) -> Self {
        Self::new(spec.into_dependency())
    }
}

impl Command for AddDependencyCommand {
    fn name(&self) -> &'static str {
        "add_dependency"
    }

    fn description(&self) -> String {
        format!(
            "Add dependency {} -> {}",
            self.dependency.from_task_id, self.dependency.to_task_id
        )
    }

    fn cannot_execute_reason(&self, constellation: &Constellation) -> Option<String> {
        if constellation.has_dependency(&self.dependency.id) {
            return Some(format!(
                "Dependency '{}' already exists. Existing dependencies: [{}]",
                self.dependency.id,
                constellation.dependency_ids().join(", ")
            ));
        }
        let missing: Vec<&str> = [&self.dependency.from_task_id, &self.dependency.to_task_id]
            .into_iter()
            .filter(|id| !constellation.has_task(id))
            .map(String::as_str)
            .collect();
        (!missing.is_empty()).then(|| {
            format!(
                "Task(s) not found: [{}]. {}",
                missing.join(", "),
                available("tasks", &constellation.task_ids())
            )
        })
    }

    fn execute(&mut self, constellation: &mut Constellation) -> Result<()> {
        let dependency = self.dependency.clone();
        apply_validated(self.name(), &mut self.snapshot, constellation, |c| {
            c.add_dependency(dependency)
        })
    }

    fn undo(&mut self, constellation: &mut Constellation) -> Result<()> {
        self.snapshot.restore(constellation)
    }
}

// ========== RemoveDependency ==========

#[derive(Debug)]
pub struct RemoveDependencyCommand {
    dependency_id: String,
    snapshot: Snapshot,
}

impl RemoveDependencyCommand {
    pub fn new(dependency_id: &str) -> Self {
        Self {
            dependency_id: dependency_id.to_string(),
            snapshot: Snapshot::default(),
        }
    }
}

impl Command for RemoveDependencyCommand {
    fn name(&self) -> &'static str {
        "remove_dependency"
    }

    fn description(&self) -> String {
        format!("Remove dependency '{}'", self.dependency_id)
    }

    fn cannot_execute_reason(&self, constellation: &Constellation) -> Option<String> {
        (!constellation.has_dependency(&self.dependency_id))
            .then(|| missing_dependency(constellation, &self.dependency_id))
    }

    fn execute(&mut self, constellation: &mut Constellation) -> Result<()> {
        let dependency_id = self.dependency_id.clone();
        apply_validated(self.name(), &mut self.snapshot, constellation, |c| {
            c.remove_dependency(&dependency_id).map(|_| ())
        })
    }

    fn undo(&mut self, constellation: &mut Constellation) -> Result<()> {
        self.snapshot.restore(constellation)
    }
}

// ========== UpdateDependency ==========

#[derive(Debug)]
pub struct UpdateDependencyCommand {
    dependency_id: String,
    updates: DependencyUpdate,
    snapshot: Snapshot,
}

impl UpdateDependencyCommand {
    pub fn new(dependency_id: &str, updates: DependencyUpdate) -> Self {
        Self {
            dependency_id: dependency_id.to_string(),
            updates,
            snapshot: Snapshot::default(),
        }
    }
}

impl Command for UpdateDependencyCommand {
    fn name(&self) -> &'static str {
        "update_dependency"
    }

    fn description(&self) -> String {
        format!("Update dependency '{}'", self.dependency_id)
    }

    fn cannot_execute_reason(&self, constellation: &Constellation) -> Option<String> {
        if !constellation.has_dependency(&self.dependency_id) {
            return Some(missing_dependency(constellation, &self.dependency_id));
        }
        self.updates
            .is_empty()
            .then(|| format!("No fields to update for dependency '{}'", self.dependency_id))
    }

    fn execute(&mut self, constellation: &mut Constellation) -> Result<()> {
        let dependency_id = self.dependency_id.clone();
        let updates = self.updates.clone();
        apply_validated(self.name(), &mut self.snapshot, constellation, |c| {
            let dependency = c
                .get_dependency_mut(&dependency_id)
                .ok_or_else(|| Error::DependencyNotFound(dependency_id.clone()))?;
            updates.apply(dependency);
            c.touch();
            Ok(())
        })
    }

    fn undo(&mut self, constellation: &mut Constellation) -> Result<()> {
        self.snapshot.restore(constellation)
    }
}
