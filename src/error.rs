use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML parse error: {0}")]
    TomlParse(#[from] toml::de::Error),

    #[error("TOML serialize error: {0}")]
    TomlSerialize(#[from] toml::ser::Error),

    #[error("No home directory")]
    NoHomeDir,

    /// The task graph failed validation. `errors` carries every structural
    /// problem found, not only the first.
    #[error("Validation error: {message}")]
    Validation { message: String, errors: Vec<String> },

    /// A command precondition did not hold.
    #[error("Execution error: {0}")]
    Execution(String),

    /// Rolling a command back failed. State may be inconsistent.
    #[error("Undo error: {0}")]
    Undo(String),

    #[error("Unknown command: {0}")]
    UnknownCommand(String),

    #[error("Task already exists: {0}")]
    TaskExists(String),

    #[error("Task not found: {0}")]
    TaskNotFound(String),

    #[error("Dependency already exists: {0}")]
    DependencyExists(String),

    #[error("Dependency not found: {0}")]
    DependencyNotFound(String),

    #[error("Device not found: {0}")]
    DeviceNotFound(String),

    #[error("Device not connected: {0}")]
    DeviceNotConnected(String),

    #[error("Connection error for device {device_id}: {reason}")]
    Connection { device_id: String, reason: String },

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("{operation} timed out after {after:?}")]
    Timeout { operation: String, after: Duration },

    #[error("Task {task_id} failed: {error}")]
    TaskFailed { task_id: String, error: String },
}

impl Error {
    /// Validation failure without a structural error list.
    pub fn validation(message: impl Into<String>) -> Self {
        Error::Validation {
            message: message.into(),
            errors: Vec::new(),
        }
    }

    pub fn connection(device_id: &str, reason: impl Into<String>) -> Self {
        Error::Connection {
            device_id: device_id.to_string(),
            reason: reason.into(),
        }
    }

    pub fn timeout(operation: impl Into<String>, after: Duration) -> Self {
        Error::Timeout {
            operation: operation.into(),
            after,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
