//! Dependency edges between tasks.

use crate::core::task::TaskStatus;
use serde::{Deserialize, Serialize};

/// Type of dependency between tasks.
///
/// The type decides which terminal state of the source task satisfies
/// the edge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DependencyType {
    /// Target may start once the source finished, whatever the outcome.
    #[default]
    Unconditional,
    /// Target may start only if the source completed successfully.
    SuccessOnly,
    /// Target may start once the source finished. Kept distinct from
    /// Unconditional so callers can express intent.
    CompletionOnly,
    /// Satisfied by an external condition check, or by source success.
    Conditional,
}

impl DependencyType {
    /// Whether an edge of this type is satisfied by a source in `status`.
    pub fn satisfied_by(&self, status: TaskStatus) -> bool {
        match self {
            DependencyType::Unconditional | DependencyType::CompletionOnly => status.is_terminal(),
            DependencyType::SuccessOnly | DependencyType::Conditional => {
                status == TaskStatus::Completed
            }
        }
    }
}

impl std::fmt::Display for DependencyType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DependencyType::Unconditional => write!(f, "unconditional"),
            DependencyType::SuccessOnly => write!(f, "success_only"),
            DependencyType::CompletionOnly => write!(f, "completion_only"),
            DependencyType::Conditional => write!(f, "conditional"),
        }
    }
}

/// A directed edge: `from_task_id` must finish before `to_task_id` starts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Dependency {
    pub id: String,
    pub from_task_id: String,
    pub to_task_id: String,
    #[serde(default)]
    pub dependency_type: DependencyType,
    #[serde(default)]
    pub condition_description: String,
    #[serde(default)]
    pub satisfied: bool,
}

impl Dependency {
    pub fn new(id: &str, from: &str, to: &str) -> Self {
        Self {
            id: id.to_string(),
            from_task_id: from.to_string(),
            to_task_id: to.to_string(),
            dependency_type: DependencyType::Unconditional,
            condition_description: String::new(),
            satisfied: false,
        }
    }

    pub fn with_type(mut self, dependency_type: DependencyType) -> Self {
        self.dependency_type = dependency_type;
        self
    }

    pub fn with_condition(mut self, description: &str) -> Self {
        self.condition_description = description.to_string();
        self
    }

    /// Default id for an edge: `from->to`.
    pub fn edge_id(from: &str, to: &str) -> String {
        format!("{}->{}", from, to)
    }

    pub fn is_self_loop(&self) -> bool {
        self.from_task_id == self.to_task_id
    }
}
