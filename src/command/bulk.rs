//! Whole-constellation commands: build, clear, load, save.

use super::dependencies::DependencySpec;
use super::tasks::TaskSpec;
use super::{apply_validated, available, Command, Snapshot};
use crate::core::{Constellation, Dependency, Task, TaskStatus};
use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashSet;
use std::path::PathBuf;

/// A batch of tasks and edges to add in one step.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConstellationSpec {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub tasks: Vec<TaskSpec>,
    #[serde(default)]
    pub dependencies: Vec<DependencySpec>,
    #[serde(default)]
    pub metadata: Map<String, Value>,
}

fn running_tasks(constellation: &Constellation) -> Vec<String> {
    constellation
        .tasks()
        .filter(|t| t.status == TaskStatus::Running)
        .map(|t| t.id.clone())
        .collect()
}

// ========== Build ==========

#[derive(Debug)]
pub struct BuildConstellationCommand {
    name: Option<String>,
    tasks: Vec<Task>,
    dependencies: Vec<Dependency>,
    metadata: Map<String, Value>,
    clear_existing: bool,
    snapshot: Snapshot,
}

impl BuildConstellationCommand {
    /// Ids are resolved here so a redo rebuilds the same graph.
    pub fn new(spec: ConstellationSpec, clear_existing: bool) -> Self {
        Self {
            name: spec.name,
            tasks: spec.tasks.into_iter().map(TaskSpec::into_task).collect(),
            dependencies: spec
                .dependencies
                .into_iter()
                .map(DependencySpec::into_dependency)
                .collect(),
            metadata: spec.metadata,
            clear_existing,
            snapshot: Snapshot::default(),
        }
    }
}

impl Command for BuildConstellationCommand {
    fn name(&self) -> &'static str {
        "build_constellation"
    }

    fn description(&self) -> String {
        format!(
            "Build constellation with {} tasks and {} dependencies",
            self.tasks.len(),
            self.dependencies.len()
        )
    }

    fn cannot_execute_reason(&self, constellation: &Constellation) -> Option<String> {
        let mut seen = HashSet::new();
        let duplicates: Vec<&str> = self
            .tasks
            .iter()
            .filter(|t| !seen.insert(t.id.as_str()))
            .map(|t| t.id.as_str())
            .collect();
        if !duplicates.is_empty() {
            return Some(format!(
                "Duplicate task ids in batch: [{}]",
                duplicates.join(", ")
            ));
        }

        let mut known: Vec<String> = if self.clear_existing {
            let running = running_tasks(constellation);
            if !running.is_empty() {
                return Some(format!(
                    "Cannot rebuild while tasks are running: [{}]",
                    running.join(", ")
                ));
            }
            Vec::new()
        } else {
            let conflicts: Vec<&str> = self
                .tasks
                .iter()
                .filter(|t| constellation.has_task(&t.id))
                .map(|t| t.id.as_str())
                .collect();
            if !conflicts.is_empty() {
                return Some(format!(
                    "Tasks already exist: [{}]. Existing tasks: [{}]",
                    conflicts.join(", "),
                    constellation.task_ids().join(", ")
                ));
            }
            constellation.task_ids()
        };
        known.extend(self.tasks.iter().map(|t| t.id.clone()));

        // Edges may only join tasks that exist once the batch is applied.
        let mut missing: Vec<&str> = Vec::new();
        for dependency in &self.dependencies {
            for endpoint in [&dependency.from_task_id, &dependency.to_task_id] {
                if !known.contains(endpoint) && !missing.contains(&endpoint.as_str()) {
                    missing.push(endpoint);
                }
            }
        }
        (!missing.is_empty()).then(|| {
            format!(
                "Dependency endpoints not found: [{}]. {}",
                missing.join(", "),
                available("tasks", &known)
            )
        })
    }

    fn execute(&mut self, constellation: &mut Constellation) -> Result<()> {
        let clear = self.clear_existing;
        let name = self.name.clone();
        let tasks = self.tasks.clone();
        let dependencies = self.dependencies.clone();
        let metadata = self.metadata.clone();
        apply_validated(self.name(), &mut self.snapshot, constellation, move |c| {
            if clear {
                c.clear();
            }
            if let Some(name) = name {
                c.name = name;
            }
            c.metadata.extend(metadata);
            for task in tasks {
                c.add_task(task)?;
            }
            for dependency in dependencies {
                c.add_dependency(dependency)?;
            }
            Ok(())
        })
    }

    fn undo(&mut self, constellation: &mut Constellation) -> Result<()> {
        self.snapshot.restore(constellation)
    }
}

// ========== Clear ==========

#[derive(Debug, Default)]
pub struct ClearConstellationCommand {
    snapshot: Snapshot,
}

impl ClearConstellationCommand {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Command for ClearConstellationCommand {
    fn name(&self) -> &'static str {
        "clear_constellation"
    }

    fn description(&self) -> String {
        "Clear all tasks and dependencies".to_string()
    }

    fn cannot_execute_reason(&self, constellation: &Constellation) -> Option<String> {
        let running = running_tasks(constellation);
        (!running.is_empty()).then(|| {
            format!(
                "Cannot clear while tasks are running: [{}]",
                running.join(", ")
            )
        })
    }

    fn execute(&mut self, constellation: &mut Constellation) -> Result<()> {
        apply_validated(self.name(), &mut self.snapshot, constellation, |c| {
            c.clear();
            Ok(())
        })
    }

    fn undo(&mut self, constellation: &mut Constellation) -> Result<()> {
        self.snapshot.restore(constellation)
    }
}

// ========== Load ==========

/// Replace the constellation with one read from a JSON file.
#[derive(Debug)]
pub struct LoadConstellationCommand {
    path: PathBuf,
    snapshot: Snapshot,
}

impl LoadConstellationCommand {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            snapshot: Snapshot::default(),
        }
    }
}

impl Command for LoadConstellationCommand {
    fn name(&self) -> &'static str {
        "load_constellation"
    }

    fn description(&self) -> String {
        format!("Load constellation from {}", self.path.display())
    }

    fn cannot_execute_reason(&self, _constellation: &Constellation) -> Option<String> {
        (!self.path.is_file())
            .then(|| format!("File '{}' does not exist", self.path.display()))
    }

    fn execute(&mut self, constellation: &mut Constellation) -> Result<()> {
        let path = self.path.clone();
        apply_validated(self.name(), &mut self.snapshot, constellation, |c| {
            let loaded = Constellation::load_from_file(&path)?;
            c.restore(loaded);
            Ok(())
        })
    }

    fn undo(&mut self, constellation: &mut Constellation) -> Result<()> {
        self.snapshot.restore(constellation)
    }
}

// ========== Save ==========

/// Write the constellation to a JSON file. Not undoable.
#[derive(Debug)]
pub struct SaveConstellationCommand {
    path: PathBuf,
}

impl SaveConstellationCommand {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl Command for SaveConstellationCommand {
    fn name(&self) -> &'static str {
        "save_constellation"
    }

    fn description(&self) -> String {
        format!("Save constellation to {}", self.path.display())
    }

    fn cannot_execute_reason(&self, _constellation: &Constellation) -> Option<String> {
        let parent = self.path.parent().filter(|p| !p.as_os_str().is_empty());
        match parent {
            Some(dir) if !dir.is_dir() => {
                Some(format!("Directory '{}' does not exist", dir.display()))
            }
            _ => None,
        }
    }

    fn execute(&mut self, constellation: &mut Constellation) -> Result<()> {
        constellation.save_to_file(&self.path)
    }

    fn undo(&mut self, _constellation: &mut Constellation) -> Result<()> {
        Err(Error::Undo(format!(
            "saving to {} cannot be undone",
            self.path.display()
        )))
    }

    fn is_undoable(&self) -> bool {
        false
    }
}
