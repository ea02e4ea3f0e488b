//! The constellation: a task DAG plus metadata.
//!
//! Tasks and dependencies are stored in ordered maps keyed by id, which is
//! also the persistence layout. A petgraph `DiGraph` is built on demand for
//! cycle detection and topological ordering, so the stored form stays a
//! plain value that can be cloned for snapshots and restored in place.

use crate::core::dependency::Dependency;
use crate::core::task::{Task, TaskStatus};
use crate::error::{Error, Result};
use chrono::{DateTime, Utc};
use petgraph::algo::{tarjan_scc, toposort};
use petgraph::graph::{DiGraph, NodeIndex};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use tracing::debug;
use uuid::Uuid;

/// Aggregate state of a constellation, derived from its tasks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConstellationState {
    /// No tasks yet.
    #[default]
    Created,
    /// Tasks exist and none has started.
    Ready,
    /// At least one task is running or the run is partway through.
    Executing,
    Completed,
    Failed,
    /// Every task finished and some of them failed.
    PartiallyFailed,
}

impl std::fmt::Display for ConstellationState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ConstellationState::Created => "created",
            ConstellationState::Ready => "ready",
            ConstellationState::Executing => "executing",
            ConstellationState::Completed => "completed",
            ConstellationState::Failed => "failed",
            ConstellationState::PartiallyFailed => "partially_failed",
        };
        write!(f, "{}", s)
    }
}

/// Point-in-time counts for a constellation.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ConstellationStatistics {
    pub total_tasks: usize,
    pub total_dependencies: usize,
    pub pending: usize,
    pub waiting_dependency: usize,
    pub running: usize,
    pub completed: usize,
    pub failed: usize,
    pub state: ConstellationState,
}

/// A named task DAG under management.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Constellation {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub state: ConstellationState,
    #[serde(default)]
    tasks: BTreeMap<String, Task>,
    #[serde(default)]
    dependencies: BTreeMap<String, Dependency>,
    #[serde(default)]
    pub metadata: Map<String, Value>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Constellation {
    /// Create an empty constellation with a generated id.
    pub fn new(name: &str) -> Self {
        let id = format!("constellation_{}", &Uuid::new_v4().simple().to_string()[..8]);
        Self::with_id(&id, name)
    }

    pub fn with_id(id: &str, name: &str) -> Self {
        let now = Utc::now();
        Self {
            id: id.to_string(),
            name: name.to_string(),
            state: ConstellationState::Created,
            tasks: BTreeMap::new(),
            dependencies: BTreeMap::new(),
            metadata: Map::new(),
            created_at: now,
            updated_at: now,
        }
    }

    // ========== Task Operations ==========

    /// Add a task. Fails if a task with the same id exists.
    pub fn add_task(&mut self, task: Task) -> Result<()> {
        if self.tasks.contains_key(&task.id) {
            return Err(Error::TaskExists(task.id));
        }
        debug!(constellation = %self.id, task_id = %task.id, "add_task");
        self.tasks.insert(task.id.clone(), task);
        self.touch();
        Ok(())
    }

    /// Remove a task and every dependency that touches it.
    ///
    /// Returns the removed task and the removed dependencies.
    pub fn remove_task(&mut self, task_id: &str) -> Result<(Task, Vec<Dependency>)> {
        let task = self
            .tasks
            .remove(task_id)
            .ok_or_else(|| Error::TaskNotFound(task_id.to_string()))?;

        let touching: Vec<String> = self
            .dependencies
            .values()
            .filter(|d| d.from_task_id == task_id || d.to_task_id == task_id)
            .map(|d| d.id.clone())
            .collect();
        let removed: Vec<Dependency> = touching
            .iter()
            .filter_map(|id| self.dependencies.remove(id))
            .collect();

        debug!(
            constellation = %self.id,
            task_id,
            cascaded = removed.len(),
            "remove_task"
        );
        self.touch();
        Ok((task, removed))
    }

    pub fn get_task(&self, task_id: &str) -> Option<&Task> {
        self.tasks.get(task_id)
    }

    /// Mutable access for in-place updates. Callers must not change `id`.
    pub fn get_task_mut(&mut self, task_id: &str) -> Option<&mut Task> {
        self.tasks.get_mut(task_id)
    }

    pub fn has_task(&self, task_id: &str) -> bool {
        self.tasks.contains_key(task_id)
    }

    pub fn tasks(&self) -> impl Iterator<Item = &Task> {
        self.tasks.values()
    }

    /// Task ids in sorted order.
    pub fn task_ids(&self) -> Vec<String> {
        self.tasks.keys().cloned().collect()
    }

    pub fn task_count(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    // ========== Dependency Operations ==========

    /// Add a dependency edge.
    ///
    /// Fails if the id is taken or either endpoint is missing. Cycles are
    /// not checked here; callers validate the whole graph afterwards.
    pub fn add_dependency(&mut self, dependency: Dependency) -> Result<()> {
        if self.dependencies.contains_key(&dependency.id) {
            return Err(Error::DependencyExists(dependency.id));
        }
        for endpoint in [&dependency.from_task_id, &dependency.to_task_id] {
            if !self.tasks.contains_key(endpoint) {
                return Err(Error::TaskNotFound(endpoint.clone()));
            }
        }
        debug!(
            constellation = %self.id,
            dependency_id = %dependency.id,
            from = %dependency.from_task_id,
            to = %dependency.to_task_id,
            "add_dependency"
        );
        self.dependencies.insert(dependency.id.clone(), dependency);
        self.touch();
        Ok(())
    }

    pub fn remove_dependency(&mut self, dependency_id: &str) -> Result<Dependency> {
        let removed = self
            .dependencies
            .remove(dependency_id)
            .ok_or_else(|| Error::DependencyNotFound(dependency_id.to_string()))?;
        self.touch();
        Ok(removed)
    }

    pub fn get_dependency(&self, dependency_id: &str) -> Option<&Dependency> {
        self.dependencies.get(dependency_id)
    }

    pub fn get_dependency_mut(&mut self, dependency_id: &str) -> Option<&mut Dependency> {
        self.dependencies.get_mut(dependency_id)
    }

    pub fn has_dependency(&self, dependency_id: &str) -> bool {
        self.dependencies.contains_key(dependency_id)
    }

    /// Find the first edge between two tasks, if any.
    pub fn find_dependency(&self, from: &str, to: &str) -> Option<&Dependency> {
        self.dependencies
            .values()
            .find(|d| d.from_task_id == from && d.to_task_id == to)
    }

    pub fn dependencies(&self) -> impl Iterator<Item = &Dependency> {
        self.dependencies.values()
    }

    pub fn dependency_ids(&self) -> Vec<String> {
        self.dependencies.keys().cloned().collect()
    }

    pub fn dependency_count(&self) -> usize {
        self.dependencies.len()
    }

    /// Edges pointing into `task_id`.
    pub fn incoming(&self, task_id: &str) -> Vec<&Dependency> {
        self.dependencies
            .values()
            .filter(|d| d.to_task_id == task_id)
            .collect()
    }

    /// Edges leaving `task_id`.
    pub fn outgoing(&self, task_id: &str) -> Vec<&Dependency> {
        self.dependencies
            .values()
            .filter(|d| d.from_task_id == task_id)
            .collect()
    }

    /// Remove every task and dependency. Metadata is kept.
    pub fn clear(&mut self) {
        self.tasks.clear();
        self.dependencies.clear();
        self.touch();
    }

    // ========== Validation ==========

    /// Check the structural invariants of the graph.
    ///
    /// Reports mismatched ids, dependencies with missing endpoints, and
    /// every cycle (including self-loops). Returns `(is_valid, errors)`.
    pub fn validate_dag(&self) -> (bool, Vec<String>) {
        let mut errors = Vec::new();

        for (key, task) in &self.tasks {
            if key != &task.id {
                errors.push(format!(
                    "Task key '{}' does not match task id '{}'",
                    key, task.id
                ));
            }
        }

        for (key, dep) in &self.dependencies {
            if key != &dep.id {
                errors.push(format!(
                    "Dependency key '{}' does not match dependency id '{}'",
                    key, dep.id
                ));
            }
            if !self.tasks.contains_key(&dep.from_task_id) {
                errors.push(format!(
                    "Dependency '{}' references missing source task '{}'",
                    dep.id, dep.from_task_id
                ));
            }
            if !self.tasks.contains_key(&dep.to_task_id) {
                errors.push(format!(
                    "Dependency '{}' references missing target task '{}'",
                    dep.id, dep.to_task_id
                ));
            }
        }

        let (graph, _) = self.build_graph();
        for component in tarjan_scc(&graph) {
            let is_cycle = component.len() > 1
                || component
                    .first()
                    .map(|&n| graph.contains_edge(n, n))
                    .unwrap_or(false);
            if is_cycle {
                let mut ids: Vec<&str> = component.iter().map(|&n| graph[n].as_str()).collect();
                ids.sort_unstable();
                errors.push(format!(
                    "Cycle detected involving tasks: {}",
                    ids.join(", ")
                ));
            }
        }

        (errors.is_empty(), errors)
    }

    /// Task ids ordered so every task follows all of its dependencies.
    ///
    /// # Errors
    /// Returns a validation error if the graph contains a cycle.
    pub fn get_topological_order(&self) -> Result<Vec<String>> {
        let (graph, _) = self.build_graph();
        let sorted = toposort(&graph, None).map_err(|cycle| Error::Validation {
            message: format!("Cycle detected at task: {}", graph[cycle.node_id()]),
            errors: self.validate_dag().1,
        })?;
        Ok(sorted.into_iter().map(|n| graph[n].clone()).collect())
    }

    /// Build a petgraph view over the current tasks and dependencies.
    ///
    /// Edges whose endpoints are missing are skipped; `validate_dag`
    /// reports them separately.
    fn build_graph(&self) -> (DiGraph<String, ()>, HashMap<String, NodeIndex>) {
        let mut graph = DiGraph::with_capacity(self.tasks.len(), self.dependencies.len());
        let mut index = HashMap::with_capacity(self.tasks.len());
        for id in self.tasks.keys() {
            index.insert(id.clone(), graph.add_node(id.clone()));
        }
        for dep in self.dependencies.values() {
            if let (Some(&from), Some(&to)) =
                (index.get(&dep.from_task_id), index.get(&dep.to_task_id))
            {
                graph.add_edge(from, to, ());
            }
        }
        (graph, index)
    }

    // ========== Scheduling Operations ==========

    /// Whether a single edge currently allows its target to run.
    pub fn is_dependency_satisfied(&self, dependency: &Dependency) -> bool {
        if dependency.satisfied {
            return true;
        }
        self.tasks
            .get(&dependency.from_task_id)
            .map(|source| dependency.dependency_type.satisfied_by(source.status))
            .unwrap_or(false)
    }

    /// Pending tasks whose incoming dependencies are all satisfied.
    pub fn get_ready_tasks(&self) -> Vec<&Task> {
        self.tasks
            .values()
            .filter(|task| task.status == TaskStatus::Pending)
            .filter(|task| {
                self.incoming(&task.id)
                    .into_iter()
                    .all(|dep| self.is_dependency_satisfied(dep))
            })
            .collect()
    }

    pub fn mark_task_running(&mut self, task_id: &str) -> Result<()> {
        let task = self
            .tasks
            .get_mut(task_id)
            .ok_or_else(|| Error::TaskNotFound(task_id.to_string()))?;
        task.start();
        self.touch();
        Ok(())
    }

    /// Mark a task completed and propagate to its outgoing edges.
    ///
    /// Returns the ids of tasks that became ready as a result.
    pub fn mark_task_completed(&mut self, task_id: &str, result: Option<Value>) -> Result<Vec<String>> {
        let task = self
            .tasks
            .get_mut(task_id)
            .ok_or_else(|| Error::TaskNotFound(task_id.to_string()))?;
        task.complete(result);
        Ok(self.propagate_finished(task_id))
    }

    /// Mark a task failed and propagate to its outgoing edges.
    pub fn mark_task_failed(&mut self, task_id: &str, error: &str) -> Result<Vec<String>> {
        let task = self
            .tasks
            .get_mut(task_id)
            .ok_or_else(|| Error::TaskNotFound(task_id.to_string()))?;
        task.fail(error);
        Ok(self.propagate_finished(task_id))
    }

    fn propagate_finished(&mut self, task_id: &str) -> Vec<String> {
        let status = match self.tasks.get(task_id) {
            Some(task) => task.status,
            None => return Vec::new(),
        };

        let mut targets = Vec::new();
        for dep in self.dependencies.values_mut() {
            if dep.from_task_id == task_id && dep.dependency_type.satisfied_by(status) {
                dep.satisfied = true;
                targets.push(dep.to_task_id.clone());
            }
        }

        // Waiting tasks return to Pending once every edge is satisfied.
        let mut newly_ready = Vec::new();
        for target in targets {
            let all_satisfied = self
                .incoming(&target)
                .into_iter()
                .all(|dep| self.is_dependency_satisfied(dep));
            if !all_satisfied {
                continue;
            }
            if let Some(task) = self.tasks.get_mut(&target) {
                if task.status == TaskStatus::WaitingDependency {
                    task.status = TaskStatus::Pending;
                    task.touch();
                }
                if task.status == TaskStatus::Pending && !newly_ready.contains(&target) {
                    newly_ready.push(target);
                }
            }
        }

        self.touch();
        newly_ready
    }

    pub fn get_statistics(&self) -> ConstellationStatistics {
        let mut stats = ConstellationStatistics {
            total_tasks: self.tasks.len(),
            total_dependencies: self.dependencies.len(),
            state: self.state,
            ..Default::default()
        };
        for task in self.tasks.values() {
            match task.status {
                TaskStatus::Pending => stats.pending += 1,
                TaskStatus::WaitingDependency => stats.waiting_dependency += 1,
                TaskStatus::Running => stats.running += 1,
                TaskStatus::Completed => stats.completed += 1,
                TaskStatus::Failed => stats.failed += 1,
            }
        }
        stats
    }

    /// Whether every task reached a terminal state.
    pub fn is_complete(&self) -> bool {
        self.tasks.values().all(|t| t.is_finished())
    }

    fn derive_state(&self) -> ConstellationState {
        if self.tasks.is_empty() {
            return ConstellationState::Created;
        }
        let stats = self.get_statistics();
        if stats.running > 0 {
            return ConstellationState::Executing;
        }
        let finished = stats.completed + stats.failed;
        if finished == stats.total_tasks {
            return match (stats.completed, stats.failed) {
                (_, 0) => ConstellationState::Completed,
                (0, _) => ConstellationState::Failed,
                _ => ConstellationState::PartiallyFailed,
            };
        }
        if finished > 0 {
            ConstellationState::Executing
        } else {
            ConstellationState::Ready
        }
    }

    /// Bump `updated_at` and recompute the aggregate state.
    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
        self.state = self.derive_state();
    }

    // ========== Snapshot & Persistence ==========

    /// Replace this constellation wholesale with `snapshot`.
    pub fn restore(&mut self, snapshot: Constellation) {
        *self = snapshot;
    }

    pub fn to_dict(&self) -> Result<Value> {
        Ok(serde_json::to_value(self)?)
    }

    pub fn from_dict(value: Value) -> Result<Self> {
        Ok(serde_json::from_value(value)?)
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn save_to_file(&self, path: &Path) -> Result<()> {
        std::fs::write(path, self.to_json()?)?;
        debug!(constellation = %self.id, path = %path.display(), "saved constellation");
        Ok(())
    }

    pub fn load_from_file(path: &Path) -> Result<Self> {
        let constellation = Self::from_json(&std::fs::read_to_string(path)?)?;
        debug!(constellation = %constellation.id, path = %path.display(), "loaded constellation");
        Ok(constellation)
    }
}

impl Default for Constellation {
    fn default() -> Self {
        Self::new("constellation")
    }
}
