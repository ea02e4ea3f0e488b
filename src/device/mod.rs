//! Device side of the orchestrator.
//!
//! This module provides the device registry, the transport and
//! registration handshake, heartbeat probing, inbound frame routing and the
//! event bus that reports device and task lifecycle changes.

mod connection;
mod events;
mod heartbeat;
mod processor;
pub mod protocol;
mod registry;
pub mod transport;

pub use connection::{ConnectionManager, DEFAULT_REGISTRATION_TIMEOUT_SECS};
pub use events::{ConstellationEvent, EventManager};
pub use heartbeat::{
    HeartbeatConfig, HeartbeatManager, DEFAULT_HEARTBEAT_INTERVAL_SECS,
    DEFAULT_MAX_MISSED_HEARTBEATS,
};
pub use processor::MessageProcessor;
pub use protocol::{Envelope, MessageStatus, MessageType, TaskRequest};
pub use registry::{DeviceInfo, DeviceRegistry, DeviceSpec, DeviceStatus, DEFAULT_DEVICE_MAX_RETRIES};
pub use transport::{Connector, Link, MemoryConnector, Peer, WsConnector};

/// Liveness problems reported to the device supervisor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceSignal {
    /// The device stopped answering heartbeat probes.
    HeartbeatLost { device_id: String, missed: u32 },
    /// The device's link closed underneath us.
    ConnectionLost { device_id: String, reason: String },
}

impl DeviceSignal {
    pub fn device_id(&self) -> &str {
        match self {
            DeviceSignal::HeartbeatLost { device_id, .. }
            | DeviceSignal::ConnectionLost { device_id, .. } => device_id,
        }
    }

    pub fn reason(&self) -> String {
        match self {
            DeviceSignal::HeartbeatLost { missed, .. } => {
                format!("{} heartbeats missed", missed)
            }
            DeviceSignal::ConnectionLost { reason, .. } => reason.clone(),
        }
    }
}
