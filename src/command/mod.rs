//! Transactional mutation of a constellation.
//!
//! Every structural change goes through a [`Command`]. A command snapshots
//! the constellation before mutating it, validates the graph afterwards, and
//! restores the snapshot when validation fails, so an invalid graph is never
//! observable outside the command. Undo restores the same snapshot.
//!
//! Commands run through a [`CommandInvoker`], which checks preconditions and
//! records undoable commands in a bounded [`CommandHistory`]. The
//! [`CommandRegistry`] builds commands from a name and JSON parameters, and
//! [`ConstellationEditor`] ties all of it to a single owned constellation.

pub mod bulk;
pub mod dependencies;
pub mod editor;
pub mod history;
pub mod invoker;
pub mod registry;
pub mod tasks;

pub use bulk::{
    BuildConstellationCommand, ClearConstellationCommand, ConstellationSpec,
    LoadConstellationCommand, SaveConstellationCommand,
};
pub use dependencies::{
    AddDependencyCommand, DependencySpec, DependencyUpdate, RemoveDependencyCommand,
    UpdateDependencyCommand,
};
pub use editor::ConstellationEditor;
pub use history::{CommandHistory, DEFAULT_MAX_HISTORY_SIZE};
pub use invoker::CommandInvoker;
pub use registry::{CommandCategory, CommandFactory, CommandRegistry, CommandSpec};
pub use tasks::{AddTaskCommand, RemoveTaskCommand, TaskSpec, TaskUpdate, UpdateTaskCommand};

use crate::core::Constellation;
use crate::error::{Error, Result};
use tracing::warn;

/// A single mutation of a constellation.
pub trait Command: Send + std::fmt::Debug {
    /// Registry name, e.g. `add_task`.
    fn name(&self) -> &'static str;

    /// Human-readable summary used in history listings.
    fn description(&self) -> String;

    /// Why the command cannot run against `constellation` right now, or
    /// `None` if it can. Reasons list the currently valid ids.
    fn cannot_execute_reason(&self, constellation: &Constellation) -> Option<String>;

    fn can_execute(&self, constellation: &Constellation) -> bool {
        self.cannot_execute_reason(constellation).is_none()
    }

    fn execute(&mut self, constellation: &mut Constellation) -> Result<()>;

    fn undo(&mut self, constellation: &mut Constellation) -> Result<()>;

    fn is_undoable(&self) -> bool {
        true
    }
}

/// Pre-execute copy of a constellation held by a command.
#[derive(Debug, Default, Clone)]
pub struct Snapshot(Option<Constellation>);

impl Snapshot {
    pub fn take(&mut self, constellation: &Constellation) {
        self.0 = Some(constellation.clone());
    }

    pub fn is_taken(&self) -> bool {
        self.0.is_some()
    }

    /// Replace `constellation` with the stored copy.
    pub fn restore(&self, constellation: &mut Constellation) -> Result<()> {
        match &self.0 {
            Some(snapshot) => {
                constellation.restore(snapshot.clone());
                Ok(())
            }
            None => Err(Error::Undo(
                "no snapshot recorded; command was never executed".to_string(),
            )),
        }
    }
}

/// Snapshot, mutate, validate. Rolls back on any failure.
pub(crate) fn apply_validated<F>(
    command: &str,
    snapshot: &mut Snapshot,
    constellation: &mut Constellation,
    mutate: F,
) -> Result<()>
where
    F: FnOnce(&mut Constellation) -> Result<()>,
{
    snapshot.take(constellation);

    if let Err(e) = mutate(constellation) {
        snapshot.restore(constellation)?;
        return Err(e);
    }

    let (valid, errors) = constellation.validate_dag();
    if !valid {
        snapshot.restore(constellation)?;
        warn!(command, errors = ?errors, "mutation rolled back");
        return Err(Error::Validation {
            message: format!("{} would leave an invalid constellation", command),
            errors,
        });
    }
    Ok(())
}

/// Format the ids a failed lookup could have used.
pub(crate) fn available(label: &str, ids: &[String]) -> String {
    if ids.is_empty() {
        format!("No {} exist", label)
    } else {
        format!("Available {}: [{}]", label, ids.join(", "))
    }
}
