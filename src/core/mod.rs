//! Core domain models for constellation orchestration.
//!
//! This module contains the task graph: tasks, the dependency edges between
//! them, and the constellation that owns both.

pub mod constellation;
pub mod dependency;
pub mod task;

pub use constellation::{Constellation, ConstellationState, ConstellationStatistics};
pub use dependency::{Dependency, DependencyType};
pub use task::{Task, TaskPriority, TaskStatus};
