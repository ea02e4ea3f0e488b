//! Name-to-factory table for building commands from JSON parameters.

use super::bulk::{
    BuildConstellationCommand, ClearConstellationCommand, ConstellationSpec,
    LoadConstellationCommand, SaveConstellationCommand,
};
use super::dependencies::{
    AddDependencyCommand, DependencySpec, DependencyUpdate, RemoveDependencyCommand,
    UpdateDependencyCommand,
};
use super::tasks::{AddTaskCommand, RemoveTaskCommand, TaskSpec, TaskUpdate, UpdateTaskCommand};
use super::Command;
use crate::error::{Error, Result};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::PathBuf;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandCategory {
    TaskManagement,
    DependencyManagement,
    BulkOperations,
}

pub type CommandFactory = fn(Value) -> Result<Box<dyn Command>>;

/// A registered command: metadata plus the factory that builds it.
#[derive(Clone, Copy)]
pub struct CommandSpec {
    pub name: &'static str,
    pub category: CommandCategory,
    pub undoable: bool,
    pub description: &'static str,
    pub factory: CommandFactory,
}

impl std::fmt::Debug for CommandSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommandSpec")
            .field("name", &self.name)
            .field("category", &self.category)
            .field("undoable", &self.undoable)
            .finish()
    }
}

#[derive(Debug, Default)]
pub struct CommandRegistry {
    commands: BTreeMap<&'static str, CommandSpec>,
}

impl CommandRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry holding every built-in command.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        for spec in builtins() {
            registry.register(spec);
        }
        registry
    }

    /// Register or replace a command.
    pub fn register(&mut self, spec: CommandSpec) {
        self.commands.insert(spec.name, spec);
    }

    pub fn create(&self, name: &str, params: Value) -> Result<Box<dyn Command>> {
        let spec = self.commands.get(name).ok_or_else(|| {
            Error::UnknownCommand(format!(
                "{}. Registered commands: [{}]",
                name,
                self.names().join(", ")
            ))
        })?;
        (spec.factory)(params)
    }

    pub fn get(&self, name: &str) -> Option<&CommandSpec> {
        self.commands.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.commands.contains_key(name)
    }

    /// Registered names in sorted order.
    pub fn names(&self) -> Vec<&'static str> {
        self.commands.keys().copied().collect()
    }

    pub fn by_category(&self, category: CommandCategory) -> Vec<&CommandSpec> {
        self.commands
            .values()
            .filter(|spec| spec.category == category)
            .collect()
    }

    pub fn specs(&self) -> impl Iterator<Item = &CommandSpec> {
        self.commands.values()
    }
}

fn parse<T: DeserializeOwned>(command: &str, params: Value) -> Result<T> {
    serde_json::from_value(params)
        .map_err(|e| Error::Execution(format!("Invalid parameters for {}: {}", command, e)))
}

#[derive(Deserialize)]
struct TaskIdParams {
    task_id: String,
}

#[derive(Deserialize)]
struct UpdateTaskParams {
    task_id: String,
    updates: TaskUpdate,
}

#[derive(Deserialize)]
struct DependencyIdParams {
    dependency_id: String,
}

#[derive(Deserialize)]
struct UpdateDependencyParams {
    dependency_id: String,
    updates: DependencyUpdate,
}

#[derive(Deserialize)]
struct BuildParams {
    #[serde(flatten)]
    spec: ConstellationSpec,
    #[serde(default)]
    clear_existing: bool,
}

#[derive(Deserialize)]
struct PathParams {
    path: PathBuf,
}

fn add_task(params: Value) -> Result<Box<dyn Command>> {
    let spec: TaskSpec = parse("add_task", params)?;
    Ok(Box::new(AddTaskCommand::from_spec(spec)))
}

fn remove_task(params: Value) -> Result<Box<dyn Command>> {
    let p: TaskIdParams = parse("remove_task", params)?;
    Ok(Box::new(RemoveTaskCommand::new(&p.task_id)))
}

fn update_task(params: Value) -> Result<Box<dyn Command>> {
    let p: UpdateTaskParams = parse("update_task", params)?;
    Ok(Box::new(UpdateTaskCommand::new(&p.task_id, p.updates)))
}

fn add_dependency(params: Value) -> Result<Box<dyn Command>> {
    let spec: DependencySpec = parse("add_dependency", params)?;
    Ok(Box::new(AddDependencyCommand::from_spec(spec)))
}

fn remove_dependency(params: Value) -> Result<Box<dyn Command>> {
    let p: DependencyIdParams = parse("remove_dependency", params)?;
    Ok(Box::new(RemoveDependencyCommand::new(&p.dependency_id)))
}

fn update_dependency(params: Value) -> Result<Box<dyn Command>> {
    let p: UpdateDependencyParams = parse("update_dependency", params)?;
    Ok(Box::new(UpdateDependencyCommand::new(
        &p.dependency_id,
        p.updates,
    )))
}

fn build_constellation(params: Value) -> Result<Box<dyn Command>> {
    let p: BuildParams = parse("build_constellation", params)?;
    Ok(Box::new(BuildConstellationCommand::new(
        p.spec,
        p.clear_existing,
    )))
}

fn clear_constellation(_params: Value) -> Result<Box<dyn Command>> {
    Ok(Box::new(ClearConstellationCommand::new()))
}

fn load_constellation(params: Value) -> Result<Box<dyn Command>> {
    let p: PathParams = parse("load_constellation", params)?;
    Ok(Box::new(LoadConstellationCommand::new(p.path)))
}

fn save_constellation(params: Value) -> Result<Box<dyn Command>> {
    let p: PathParams = parse("save_constellation", params)?;
    Ok(Box::new(SaveConstellationCommand::new(p.path)))
}

fn builtin(
    name: &'static str,
    category: CommandCategory,
    undoable: bool,
    description: &'static str,
    factory: CommandFactory,
) -> CommandSpec {
    CommandSpec {
        name,
        category,
        undoable,
        description,
        factory,
    }
}

fn builtins() -> Vec<CommandSpec> {
    use CommandCategory::*;
    vec![
        builtin("add_task", TaskManagement, true, "Add a task to the constellation", add_task),
        builtin(
            "remove_task",
            TaskManagement,
            true,
            "Remove a task and every dependency touching it",
            remove_task,
        ),
        builtin(
            "update_task",
            TaskManagement,
            true,
            "Update fields of an existing task",
            update_task,
        ),
        builtin(
            "add_dependency",
            DependencyManagement,
            true,
            "Add a dependency edge between two tasks",
            add_dependency,
        ),
        builtin(
            "remove_dependency",
            DependencyManagement,
            true,
            "Remove a dependency edge",
            remove_dependency,
        ),
        builtin(
            "update_dependency",
            DependencyManagement,
            true,
            "Update the type, condition, or satisfied flag of an edge",
            update_dependency,
        ),
        builtin(
            "build_constellation",
            BulkOperations,
            true,
            "Add a batch of tasks and dependencies in one step",
            build_constellation,
        ),
        builtin(
            "clear_constellation",
            BulkOperations,
            true,
            "Remove every task and dependency",
            clear_constellation,
        ),
        builtin(
            "load_constellation",
            BulkOperations,
            true,
            "Replace the constellation with one read from a file",
            load_constellation,
        ),
        builtin(
            "save_constellation",
            BulkOperations,
            false,
            "Write the constellation to a file",
            save_constellation,
        ),
    ]
}
