//! JSON envelope exchanged with devices.
//!
//! Every frame is a single JSON object. Dispatch uses `session_id` equal to
//! the task id, and the device answers with `TASK_END` carrying the same
//! session id.

use crate::error::{Error, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::time::Duration;

/// Marks our registration frames so devices can tell orchestrators apart
/// from other clients.
pub const CLIENT_TYPE: &str = "constellation_client";

/// Capabilities the orchestrator advertises during registration.
pub const CLIENT_CAPABILITIES: &[&str] = &[
    "task_distribution",
    "session_management",
    "device_coordination",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MessageType {
    Register,
    Task,
    TaskEnd,
    Heartbeat,
    DeviceInfoRequest,
    DeviceInfoResponse,
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MessageStatus {
    #[default]
    Ok,
    Error,
    /// Progress update; the session is still running.
    Continue,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(rename = "type")]
    pub message_type: MessageType,
    pub client_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
    #[serde(default)]
    pub status: MessageStatus,
    #[serde(default = "Utc::now")]
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Map<String, Value>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl Envelope {
    pub fn new(message_type: MessageType, client_id: &str) -> Self {
        Self {
            message_type,
            client_id: client_id.to_string(),
            target_id: None,
            session_id: None,
            task_name: None,
            request: None,
            request_id: None,
            status: MessageStatus::Ok,
            timestamp: Utc::now(),
            metadata: None,
            result: None,
            error: None,
        }
    }

    /// Registration handshake addressed at `target_id`.
    pub fn register(client_id: &str, target_id: &str) -> Self {
        let mut metadata = Map::new();
        metadata.insert("type".to_string(), json!(CLIENT_TYPE));
        metadata.insert("capabilities".to_string(), json!(CLIENT_CAPABILITIES));
        Self {
            target_id: Some(target_id.to_string()),
            metadata: Some(metadata),
            ..Self::new(MessageType::Register, client_id)
        }
    }

    pub fn task(client_id: &str, request: &TaskRequest) -> Self {
        let mut metadata = request.metadata.clone();
        metadata.insert(
            "timeout_secs".to_string(),
            json!(request.timeout.as_secs_f64()),
        );
        Self {
            target_id: Some(
                request
                    .target_client_id
                    .clone()
                    .unwrap_or_else(|| request.device_id.clone()),
            ),
            session_id: Some(request.task_id.clone()),
            task_name: Some(request.task_name.clone()),
            request: Some(request.request.clone()),
            metadata: Some(metadata),
            ..Self::new(MessageType::Task, client_id)
        }
    }

    pub fn heartbeat(client_id: &str) -> Self {
        Self::new(MessageType::Heartbeat, client_id)
    }

    pub fn device_info_request(client_id: &str, device_id: &str, request_id: &str) -> Self {
        Self {
            target_id: Some(device_id.to_string()),
            request_id: Some(request_id.to_string()),
            ..Self::new(MessageType::DeviceInfoRequest, client_id)
        }
    }

    /// Successful `TASK_END` for a session.
    pub fn task_completed(client_id: &str, session_id: &str, result: Option<Value>) -> Self {
        Self {
            session_id: Some(session_id.to_string()),
            result,
            ..Self::new(MessageType::TaskEnd, client_id)
        }
    }

    /// Failed `TASK_END` for a session.
    pub fn task_failed(client_id: &str, session_id: &str, error: &str) -> Self {
        Self {
            session_id: Some(session_id.to_string()),
            status: MessageStatus::Error,
            error: Some(error.to_string()),
            ..Self::new(MessageType::TaskEnd, client_id)
        }
    }

    /// Registration verdict sent by a device.
    pub fn registration_reply(client_id: &str, accepted: bool, error: Option<&str>) -> Self {
        Self {
            status: if accepted {
                MessageStatus::Ok
            } else {
                MessageStatus::Error
            },
            error: error.map(str::to_string),
            ..Self::new(MessageType::Register, client_id)
        }
    }

    pub fn is_ok(&self) -> bool {
        self.status == MessageStatus::Ok
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_json(text: &str) -> Result<Self> {
        serde_json::from_str(text).map_err(|e| Error::Protocol(format!("malformed frame: {}", e)))
    }
}

/// One dispatch: which task, to which device, with what instruction.
#[derive(Debug, Clone, PartialEq)]
pub struct TaskRequest {
    pub task_id: String,
    pub device_id: String,
    /// Client on the device side that should run the task, when it differs
    /// from the device id.
    pub target_client_id: Option<String>,
    pub task_name: String,
    pub request: String,
    pub metadata: Map<String, Value>,
    pub timeout: Duration,
}

impl TaskRequest {
    pub fn new(task_id: &str, device_id: &str, request: &str, timeout: Duration) -> Self {
        Self {
            task_id: task_id.to_string(),
            device_id: device_id.to_string(),
            target_client_id: None,
            task_name: task_id.to_string(),
            request: request.to_string(),
            metadata: Map::new(),
            timeout,
        }
    }

    pub fn with_target_client(mut self, client_id: &str) -> Self {
        self.target_client_id = Some(client_id.to_string());
        self
    }

    pub fn with_task_name(mut self, name: &str) -> Self {
        self.task_name = name.to_string();
        self
    }

    pub fn with_metadata(mut self, metadata: Map<String, Value>) -> Self {
        self.metadata = metadata;
        self
    }
}
