//! Editing session over a single constellation.
//!
//! Each operation runs one command through the invoker and returns the full
//! constellation snapshot, so callers never need to track diffs.

use super::bulk::{
    BuildConstellationCommand, ClearConstellationCommand, ConstellationSpec,
    LoadConstellationCommand, SaveConstellationCommand,
};
use super::dependencies::{
    AddDependencyCommand, DependencySpec, DependencyUpdate, RemoveDependencyCommand,
    UpdateDependencyCommand,
};
use super::invoker::CommandInvoker;
use super::registry::CommandRegistry;
use super::tasks::{AddTaskCommand, RemoveTaskCommand, TaskSpec, TaskUpdate, UpdateTaskCommand};
use super::Command;
use crate::core::Constellation;
use crate::error::Result;
use serde_json::Value;
use std::path::Path;

#[derive(Debug)]
pub struct ConstellationEditor {
    constellation: Constellation,
    invoker: CommandInvoker,
    registry: CommandRegistry,
}

impl ConstellationEditor {
    pub fn new(constellation: Constellation) -> Self {
        Self::with_max_history(constellation, super::history::DEFAULT_MAX_HISTORY_SIZE)
    }

    pub fn with_max_history(constellation: Constellation, max_history_size: usize) -> Self {
        Self {
            constellation,
            invoker: CommandInvoker::new(max_history_size),
            registry: CommandRegistry::with_builtins(),
        }
    }

    pub fn constellation(&self) -> &Constellation {
        &self.constellation
    }

    pub fn into_constellation(self) -> Constellation {
        self.constellation
    }

    pub fn registry(&self) -> &CommandRegistry {
        &self.registry
    }

    pub fn invoker(&self) -> &CommandInvoker {
        &self.invoker
    }

    /// Run any command and return the resulting snapshot.
    pub fn execute(&mut self, command: Box<dyn Command>) -> Result<Value> {
        self.invoker.execute(command, &mut self.constellation)?;
        self.snapshot()
    }

    /// Build a command by registry name and run it.
    pub fn execute_by_name(&mut self, name: &str, params: Value) -> Result<Value> {
        let command = self.registry.create(name, params)?;
        self.execute(command)
    }

    pub fn snapshot(&self) -> Result<Value> {
        self.constellation.to_dict()
    }

    pub fn add_task(&mut self, spec: TaskSpec) -> Result<Value> {
        self.execute(Box::new(AddTaskCommand::from_spec(spec)))
    }

    pub fn remove_task(&mut self, task_id: &str) -> Result<Value> {
        self.execute(Box::new(RemoveTaskCommand::new(task_id)))
    }

    pub fn update_task(&mut self, task_id: &str, updates: TaskUpdate) -> Result<Value> {
        self.execute(Box::new(UpdateTaskCommand::new(task_id, updates)))
    }

    pub fn add_dependency(&mut self, spec: DependencySpec) -> Result<Value> {
        self.execute(Box::new(AddDependencyCommand::from_spec(spec)))
    }

    pub fn remove_dependency(&mut self, dependency_id: &str) -> Result<Value> {
        self.execute(Box::new(RemoveDependencyCommand::new(dependency_id)))
    }

    pub fn update_dependency(
        &mut self,
        dependency_id: &str,
        updates: DependencyUpdate,
    ) -> Result<Value> {
        self.execute(Box::new(UpdateDependencyCommand::new(dependency_id, updates)))
    }

    pub fn build_constellation(
        &mut self,
        spec: ConstellationSpec,
        clear_existing: bool,
    ) -> Result<Value> {
        self.execute(Box::new(BuildConstellationCommand::new(spec, clear_existing)))
    }

    pub fn clear_constellation(&mut self) -> Result<Value> {
        self.execute(Box::new(ClearConstellationCommand::new()))
    }

    pub fn load_constellation(&mut self, path: &Path) -> Result<Value> {
        self.execute(Box::new(LoadConstellationCommand::new(path)))
    }

    pub fn save_constellation(&mut self, path: &Path) -> Result<Value> {
        self.execute(Box::new(SaveConstellationCommand::new(path)))
    }

    pub fn undo(&mut self) -> Result<bool> {
        self.invoker.undo(&mut self.constellation)
    }

    pub fn redo(&mut self) -> Result<bool> {
        self.invoker.redo(&mut self.constellation)
    }

    pub fn can_undo(&self) -> bool {
        self.invoker.can_undo()
    }

    pub fn can_redo(&self) -> bool {
        self.invoker.can_redo()
    }

    /// Descriptions of retained commands, oldest first.
    pub fn history(&self) -> Vec<String> {
        self.invoker.history().descriptions()
    }

    pub fn validate(&self) -> (bool, Vec<String>) {
        self.constellation.validate_dag()
    }
}
