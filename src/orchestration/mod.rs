//! Task dispatch on top of the device layer.
//!
//! This module provides single-task dispatch with pending completions,
//! capability-based device selection, bounded-concurrency and
//! dependency-ordered batch execution, and the `DeviceManager` that owns the
//! device components and supervises reconnection.

mod manager;
mod orchestrator;
mod parallel;
mod selector;

pub use manager::{DeviceManager, ManagerOptions, ReconnectPolicy, DEFAULT_RECONNECT_DELAY_SECS};
pub use orchestrator::{TaskCallback, TaskOrchestrator, TaskOutcome, TaskResult};
pub use parallel::{
    BatchEntry, BatchResults, BatchTask, ParallelTaskManager, DEFAULT_MAX_CONCURRENT,
    DEFAULT_TASK_TIMEOUT_SECS, DEVICE_TYPE_KEY, REQUIRED_CAPABILITIES_KEY,
};
pub use selector::{DeviceSelector, SelectionCriteria};
