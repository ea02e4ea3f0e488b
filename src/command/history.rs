//! Bounded undo/redo stack.

use super::Command;
use crate::core::Constellation;
use crate::error::{Error, Result};
use tracing::{debug, error};

pub const DEFAULT_MAX_HISTORY_SIZE: usize = 100;

/// Executed undoable commands plus a cursor.
///
/// `current_index` counts the commands currently applied: entries before it
/// can be undone, entries at or after it can be redone. Pushing a new
/// command discards the redo tail. When the stack grows past
/// `max_history_size` the oldest entry is dropped.
#[derive(Debug)]
pub struct CommandHistory {
    commands: Vec<Box<dyn Command>>,
    current_index: usize,
    max_history_size: usize,
}

impl Default for CommandHistory {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_HISTORY_SIZE)
    }
}

impl CommandHistory {
    pub fn new(max_history_size: usize) -> Self {
        Self {
            commands: Vec::new(),
            current_index: 0,
            max_history_size: max_history_size.max(1),
        }
    }

    /// Record an already executed command.
    pub fn push(&mut self, command: Box<dyn Command>) {
        self.commands.truncate(self.current_index);
        self.commands.push(command);
        self.current_index += 1;

        while self.commands.len() > self.max_history_size {
            self.commands.remove(0);
            self.current_index -= 1;
        }
    }

    /// Undo the most recent applied command.
    ///
    /// Returns `Ok(false)` when there is nothing to undo. A failed undo is
    /// logged and leaves the cursor where it was.
    pub fn undo(&mut self, constellation: &mut Constellation) -> Result<bool> {
        if !self.can_undo() {
            return Ok(false);
        }
        let index = self.current_index - 1;
        let command = &mut self.commands[index];
        if let Err(e) = command.undo(constellation) {
            let description = command.description();
            error!(command = %description, error = %e, "undo failed");
            return Err(match e {
                Error::Undo(msg) => Error::Undo(msg),
                other => Error::Undo(format!("{}: {}", description, other)),
            });
        }
        self.current_index = index;
        Ok(true)
    }

    /// Re-execute the next undone command.
    ///
    /// The command's precondition is checked again first, since the graph
    /// may have changed since it was undone. A refusal is reported as
    /// `Error::Execution` and leaves the cursor where it was.
    pub fn redo(&mut self, constellation: &mut Constellation) -> Result<bool> {
        if !self.can_redo() {
            return Ok(false);
        }
        let command = &mut self.commands[self.current_index];
        if let Some(reason) = command.cannot_execute_reason(constellation) {
            debug!(command = command.name(), %reason, "redo refused");
            return Err(Error::Execution(reason));
        }
        command.execute(constellation)?;
        self.current_index += 1;
        Ok(true)
    }

    pub fn can_undo(&self) -> bool {
        self.current_index > 0
    }

    pub fn can_redo(&self) -> bool {
        self.current_index < self.commands.len()
    }

    pub fn size(&self) -> usize {
        self.commands.len()
    }

    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }

    pub fn current_index(&self) -> usize {
        self.current_index
    }

    pub fn max_history_size(&self) -> usize {
        self.max_history_size
    }

    /// Description of the command `undo` would roll back.
    pub fn peek_undo(&self) -> Option<String> {
        self.current_index
            .checked_sub(1)
            .and_then(|i| self.commands.get(i))
            .map(|c| c.description())
    }

    pub fn peek_redo(&self) -> Option<String> {
        self.commands.get(self.current_index).map(|c| c.description())
    }

    /// Descriptions of every retained command, oldest first.
    pub fn descriptions(&self) -> Vec<String> {
        self.commands.iter().map(|c| c.description()).collect()
    }

    pub fn clear(&mut self) {
        self.commands.clear();
        self.current_index = 0;
    }
}
