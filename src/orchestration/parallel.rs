//! Bounded-concurrency batch execution.
//!
//! The ParallelTaskManager dispatches a batch of tasks through the
//! orchestrator with at most `max_concurrent` in flight. Each task's outcome
//! lands in the result map as its own entry, so one failure never stops its
//! siblings.
//!
//! With dependencies, every node waits on a `watch` channel carrying the
//! set of finished ids and only takes a concurrency permit once its own
//! dependencies are done. A node starts as soon as its dependencies finish,
//! whatever its siblings are doing.

use super::orchestrator::TaskOrchestrator;
use super::selector::{DeviceSelector, SelectionCriteria};
use crate::core::{Constellation, TaskStatus};
use crate::device::TaskRequest;
use crate::error::{Error, Result};
use futures::stream::FuturesUnordered;
use futures::StreamExt;
use petgraph::algo::tarjan_scc;
use petgraph::graphmap::DiGraphMap;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Semaphore};
use tracing::{debug, info, warn};

pub const DEFAULT_MAX_CONCURRENT: usize = 5;
pub const DEFAULT_TASK_TIMEOUT_SECS: u64 = 1000;

/// Metadata key listing the capabilities a constellation task needs.
pub const REQUIRED_CAPABILITIES_KEY: &str = "required_capabilities";
/// Metadata key naming the preferred device type for a constellation task.
pub const DEVICE_TYPE_KEY: &str = "device_type";

/// One unit of work in a batch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchTask {
    pub task_id: String,
    pub request: String,
    #[serde(default)]
    pub task_name: Option<String>,
    /// Fixed target. When absent a device is selected by capability.
    #[serde(default)]
    pub device_id: Option<String>,
    #[serde(default)]
    pub capabilities: Vec<String>,
    #[serde(default)]
    pub preferred_device_type: Option<String>,
    /// Tasks that must complete successfully first.
    #[serde(default)]
    pub dependencies: Vec<String>,
    /// Tasks that must finish first, successfully or not.
    #[serde(default)]
    pub after: Vec<String>,
    #[serde(default)]
    pub metadata: Map<String, Value>,
    #[serde(default)]
    pub timeout_secs: Option<u64>,
}

impl BatchTask {
    pub fn new(task_id: &str, request: &str) -> Self {
        Self {
            task_id: task_id.to_string(),
            request: request.to_string(),
            task_name: None,
            device_id: None,
            capabilities: Vec::new(),
            preferred_device_type: None,
            dependencies: Vec::new(),
            after: Vec::new(),
            metadata: Map::new(),
            timeout_secs: None,
        }
    }

    pub fn on_device(mut self, device_id: &str) -> Self {
        self.device_id = Some(device_id.to_string());
        self
    }

    pub fn with_capabilities(mut self, capabilities: &[&str]) -> Self {
        self.capabilities = capabilities.iter().map(|c| c.to_string()).collect();
        self
    }

    pub fn depends_on(mut self, task_ids: &[&str]) -> Self {
        self.dependencies = task_ids.iter().map(|t| t.to_string()).collect();
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout_secs = Some(timeout.as_secs());
        self
    }

    fn all_dependencies(&self) -> impl Iterator<Item = &String> {
        self.dependencies.iter().chain(self.after.iter())
    }

    fn criteria(&self) -> SelectionCriteria {
        SelectionCriteria {
            required_capabilities: self.capabilities.clone(),
            preferred_device_type: self.preferred_device_type.clone(),
        }
    }
}

/// Outcome of one batch task.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum BatchEntry {
    Completed {
        device_id: String,
        result: Option<Value>,
    },
    Failed {
        device_id: Option<String>,
        error: String,
    },
}

impl BatchEntry {
    pub fn is_success(&self) -> bool {
        matches!(self, BatchEntry::Completed { .. })
    }

    fn failed(error: impl Into<String>) -> Self {
        BatchEntry::Failed {
            device_id: None,
            error: error.into(),
        }
    }
}

pub type BatchResults = BTreeMap<String, BatchEntry>;

pub struct ParallelTaskManager {
    orchestrator: Arc<TaskOrchestrator>,
    selector: DeviceSelector,
    max_concurrent: usize,
    default_timeout: Duration,
    dependency_timeout: Option<Duration>,
}

impl ParallelTaskManager {
    pub fn new(orchestrator: Arc<TaskOrchestrator>, selector: DeviceSelector, max_concurrent: usize) -> Self {
        Self {
            orchestrator,
            selector,
            max_concurrent: max_concurrent.max(1),
            default_timeout: Duration::from_secs(DEFAULT_TASK_TIMEOUT_SECS),
            dependency_timeout: None,
        }
    }

    pub fn with_default_timeout(mut self, timeout: Duration) -> Self {
        self.default_timeout = timeout;
        self
    }

    /// Bound how long a node waits for its dependencies. Without it a node
    /// whose dependencies never finish waits forever.
    pub fn with_dependency_timeout(mut self, timeout: Duration) -> Self {
        self.dependency_timeout = Some(timeout);
        self
    }

    pub fn max_concurrent(&self) -> usize {
        self.max_concurrent
    }

    /// Run every task with at most `max_concurrent` in flight.
    pub async fn execute_tasks_parallel(&self, tasks: Vec<BatchTask>) -> Result<BatchResults> {
        check_unique(&tasks)?;
        info!(count = tasks.len(), max_concurrent = self.max_concurrent, "executing batch");

        let semaphore = Semaphore::new(self.max_concurrent);
        let mut futs = FuturesUnordered::new();
        for task in &tasks {
            let semaphore = &semaphore;
            futs.push(async move {
                let entry = match semaphore.acquire().await {
                    Ok(_permit) => self.run_one(task).await,
                    Err(_) => BatchEntry::failed("semaphore closed unexpectedly"),
                };
                (task.task_id.clone(), entry)
            });
        }

        let mut results = BatchResults::new();
        while let Some((task_id, entry)) = futs.next().await {
            results.insert(task_id, entry);
        }
        Ok(results)
    }

    /// Run a batch where tasks wait on other tasks in the same batch.
    ///
    /// Dependencies that are not part of the batch, and dependency cycles,
    /// fail the affected tasks immediately. A task whose required
    /// dependency failed is never dispatched.
    pub async fn execute_tasks_with_dependencies(&self, tasks: Vec<BatchTask>) -> Result<BatchResults> {
        self.run_graph(tasks, BatchResults::new()).await
    }

    /// Dependency-ordered run. `settled` holds outcomes decided before the
    /// run; batch tasks may depend on them.
    async fn run_graph(&self, tasks: Vec<BatchTask>, settled: BatchResults) -> Result<BatchResults> {
        check_unique(&tasks)?;

        let mut finished: HashMap<String, bool> = settled
            .iter()
            .map(|(id, entry)| (id.clone(), entry.is_success()))
            .collect();
        let mut results = settled;
        for (task_id, error) in unrunnable(&tasks, &finished) {
            warn!(task_id = %task_id, %error, "task cannot run");
            finished.insert(task_id.clone(), false);
            results.insert(task_id, BatchEntry::failed(error));
        }

        let (done_tx, done_rx) = watch::channel(finished);
        let semaphore = Semaphore::new(self.max_concurrent);
        let mut futs = FuturesUnordered::new();

        for task in tasks.iter().filter(|t| !results.contains_key(&t.task_id)) {
            let semaphore = &semaphore;
            let done_tx = &done_tx;
            let mut done_rx = done_rx.clone();
            futs.push(async move {
                let ready = match self.dependency_timeout {
                    Some(limit) => tokio::time::timeout(limit, wait_for_dependencies(task, &mut done_rx))
                        .await
                        .unwrap_or_else(|_| {
                            Err(format!("Timed out after {:?} waiting for dependencies", limit))
                        }),
                    None => wait_for_dependencies(task, &mut done_rx).await,
                };

                let entry = match ready {
                    Err(error) => BatchEntry::failed(error),
                    Ok(()) => match semaphore.acquire().await {
                        Ok(_permit) => self.run_one(task).await,
                        Err(_) => BatchEntry::failed("semaphore closed unexpectedly"),
                    },
                };

                let success = entry.is_success();
                done_tx.send_modify(|done| {
                    done.insert(task.task_id.clone(), success);
                });
                (task.task_id.clone(), entry)
            });
        }

        while let Some((task_id, entry)) = futs.next().await {
            results.insert(task_id, entry);
        }
        Ok(results)
    }

    /// Execute every unfinished task of a constellation in dependency order
    /// and record the outcomes on its tasks.
    pub async fn execute_constellation(&self, constellation: &mut Constellation) -> Result<BatchResults> {
        let (valid, errors) = constellation.validate_dag();
        if !valid {
            return Err(Error::Validation {
                message: "Cannot execute an invalid constellation".to_string(),
                errors,
            });
        }

        let (batch, blocked) = constellation_batch(constellation);
        let results = self.run_graph(batch, blocked).await?;

        for task_id in constellation.get_topological_order()? {
            let Some(entry) = results.get(&task_id) else {
                continue;
            };
            match entry {
                BatchEntry::Completed { result, .. } => {
                    constellation.mark_task_running(&task_id)?;
                    constellation.mark_task_completed(&task_id, result.clone())?;
                }
                BatchEntry::Failed { error, .. } => {
                    constellation.mark_task_failed(&task_id, error)?;
                }
            }
        }
        info!(
            constellation = %constellation.id,
            state = ?constellation.state,
            "constellation execution finished"
        );
        Ok(results)
    }

    async fn run_one(&self, task: &BatchTask) -> BatchEntry {
        let device_id = match &task.device_id {
            Some(id) => id.clone(),
            None => match self.selector.select_best_device(&task.criteria()).await {
                Ok(device) => device.device_id,
                Err(e) => return BatchEntry::failed(e.to_string()),
            },
        };

        let timeout = task
            .timeout_secs
            .map(Duration::from_secs)
            .unwrap_or(self.default_timeout);
        let mut request = TaskRequest::new(&task.task_id, &device_id, &task.request, timeout)
            .with_metadata(task.metadata.clone());
        if let Some(name) = &task.task_name {
            request = request.with_task_name(name);
        }

        debug!(task_id = %task.task_id, device_id = %device_id, "running batch task");
        match self.orchestrator.execute_task(request, None).await {
            Ok(done) => BatchEntry::Completed {
                device_id: done.device_id,
                result: done.result,
            },
            Err(e) => BatchEntry::Failed {
                device_id: Some(device_id),
                error: e.to_string(),
            },
        }
    }
}

async fn wait_for_dependencies(
    task: &BatchTask,
    done_rx: &mut watch::Receiver<HashMap<String, bool>>,
) -> std::result::Result<(), String> {
    loop {
        {
            let done = done_rx.borrow_and_update();
            if let Some(failed) = task
                .dependencies
                .iter()
                .find(|d| done.get(d.as_str()) == Some(&false))
            {
                return Err(format!("Dependency {} failed", failed));
            }
            if task.all_dependencies().all(|d| done.contains_key(d)) {
                return Ok(());
            }
        }
        if done_rx.changed().await.is_err() {
            return Err("Dependency tracking stopped".to_string());
        }
    }
}

fn check_unique(tasks: &[BatchTask]) -> Result<()> {
    let mut seen = HashSet::new();
    let duplicates: Vec<String> = tasks
        .iter()
        .filter(|t| !seen.insert(t.task_id.as_str()))
        .map(|t| format!("Duplicate task id in batch: {}", t.task_id))
        .collect();
    if duplicates.is_empty() {
        Ok(())
    } else {
        Err(Error::Validation {
            message: "Batch contains duplicate task ids".to_string(),
            errors: duplicates,
        })
    }
}

/// Tasks that can never run: unknown dependencies or membership in a cycle.
fn unrunnable(tasks: &[BatchTask], settled: &HashMap<String, bool>) -> Vec<(String, String)> {
    let ids: HashSet<&str> = tasks.iter().map(|t| t.task_id.as_str()).collect();
    let mut failed = Vec::new();
    let mut graph = DiGraphMap::<&str, ()>::new();

    for task in tasks {
        graph.add_node(task.task_id.as_str());
        let missing: Vec<&str> = task
            .all_dependencies()
            .map(String::as_str)
            .filter(|d| !ids.contains(d) && !settled.contains_key(*d))
            .collect();
        if !missing.is_empty() {
            failed.push((
                task.task_id.clone(),
                format!("Dependencies not in batch: [{}]", missing.join(", ")),
            ));
        }
        for dep in task.all_dependencies().filter(|d| ids.contains(d.as_str())) {
            graph.add_edge(dep.as_str(), task.task_id.as_str(), ());
        }
    }

    for component in tarjan_scc(&graph) {
        let cyclic = component.len() > 1
            || component
                .first()
                .map(|n| graph.contains_edge(n, n))
                .unwrap_or(false);
        if !cyclic {
            continue;
        }
        let mut members: Vec<&str> = component.clone();
        members.sort_unstable();
        let error = format!("Dependency cycle involving tasks: {}", members.join(", "));
        for member in members {
            if !failed.iter().any(|(id, _)| id == member) {
                failed.push((member.to_string(), error.clone()));
            }
        }
    }
    failed
}

/// Turn a constellation's unfinished tasks into a batch.
///
/// Edges whose source already finished without satisfying them block their
/// target outright; those targets come back as settled failures that the
/// rest of the batch can depend on.
fn constellation_batch(constellation: &Constellation) -> (Vec<BatchTask>, BatchResults) {
    let mut batch = Vec::new();
    let mut blocked = BatchResults::new();

    for task in constellation.tasks().filter(|t| !t.is_finished() && t.status != TaskStatus::Running) {
        let mut item = BatchTask::new(&task.id, request_text(task));
        item.task_name = Some(task.name.clone());
        item.device_id = task.target_device_id.clone();
        item.metadata = task.metadata.clone();
        if !task.tips.is_empty() {
            item.metadata.insert("tips".to_string(), Value::from(task.tips.clone()));
        }
        if let Some(Value::Array(caps)) = task.metadata.get(REQUIRED_CAPABILITIES_KEY) {
            item.capabilities = caps.iter().filter_map(Value::as_str).map(str::to_string).collect();
        }
        item.preferred_device_type = task
            .metadata
            .get(DEVICE_TYPE_KEY)
            .and_then(Value::as_str)
            .map(str::to_string);

        let mut unsatisfiable = None;
        for dep in constellation.incoming(&task.id) {
            if constellation.is_dependency_satisfied(dep) {
                continue;
            }
            let source_finished = constellation
                .get_task(&dep.from_task_id)
                .map(|s| s.is_finished())
                .unwrap_or(false);
            if source_finished {
                unsatisfiable = Some(dep.from_task_id.clone());
                break;
            }
            if dep.dependency_type.satisfied_by(TaskStatus::Failed) {
                item.after.push(dep.from_task_id.clone());
            } else {
                item.dependencies.push(dep.from_task_id.clone());
            }
        }

        match unsatisfiable {
            Some(source) => {
                blocked.insert(
                    task.id.clone(),
                    BatchEntry::failed(format!("Dependency {} can no longer be satisfied", source)),
                );
            }
            None => batch.push(item),
        }
    }

    (batch, blocked)
}

fn request_text(task: &crate::core::Task) -> &str {
    if task.description.is_empty() {
        &task.name
    } else {
        &task.description
    }
}
