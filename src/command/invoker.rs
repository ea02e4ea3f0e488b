//! The single gateway through which commands run.

use super::history::{CommandHistory, DEFAULT_MAX_HISTORY_SIZE};
use super::Command;
use crate::core::Constellation;
use crate::error::{Error, Result};
use tracing::{debug, info};

#[derive(Debug)]
pub struct CommandInvoker {
    history: CommandHistory,
    execution_count: u64,
}

impl Default for CommandInvoker {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_HISTORY_SIZE)
    }
}

impl CommandInvoker {
    pub fn new(max_history_size: usize) -> Self {
        Self {
            history: CommandHistory::new(max_history_size),
            execution_count: 0,
        }
    }

    /// Check preconditions, run the command, record it if undoable.
    ///
    /// # Errors
    /// `Error::Execution` carrying the command's reason when its
    /// precondition does not hold; otherwise whatever `execute` returns.
    pub fn execute(
        &mut self,
        mut command: Box<dyn Command>,
        constellation: &mut Constellation,
    ) -> Result<()> {
        if let Some(reason) = command.cannot_execute_reason(constellation) {
            debug!(command = command.name(), %reason, "command refused");
            return Err(Error::Execution(reason));
        }

        command.execute(constellation)?;
        self.execution_count += 1;
        info!(
            command = command.name(),
            description = %command.description(),
            "command executed"
        );

        if command.is_undoable() {
            self.history.push(command);
        }
        Ok(())
    }

    pub fn undo(&mut self, constellation: &mut Constellation) -> Result<bool> {
        self.history.undo(constellation)
    }

    pub fn redo(&mut self, constellation: &mut Constellation) -> Result<bool> {
        self.history.redo(constellation)
    }

    pub fn can_undo(&self) -> bool {
        self.history.can_undo()
    }

    pub fn can_redo(&self) -> bool {
        self.history.can_redo()
    }

    /// Commands successfully executed through this invoker.
    pub fn execution_count(&self) -> u64 {
        self.execution_count
    }

    pub fn history(&self) -> &CommandHistory {
        &self.history
    }

    pub fn clear_history(&mut self) {
        self.history.clear();
    }
}
