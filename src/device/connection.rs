//! Live connections and the registration handshake.
//!
//! A connection only counts as established after the device accepts our
//! `REGISTER` frame. Any send failure drops the local entry. Updating the
//! registry is left to the caller.

use super::protocol::{Envelope, MessageType, TaskRequest};
use super::registry::DeviceInfo;
use super::transport::{Connector, Link};
use crate::error::{Error, Result};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, RwLock};
use tracing::{debug, info, warn};
use uuid::Uuid;

pub const DEFAULT_REGISTRATION_TIMEOUT_SECS: u64 = 10;

pub struct ConnectionManager {
    client_id: String,
    connector: Arc<dyn Connector>,
    registration_timeout: Duration,
    connections: RwLock<HashMap<String, mpsc::UnboundedSender<String>>>,
}

impl std::fmt::Debug for ConnectionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionManager")
            .field("client_id", &self.client_id)
            .field("registration_timeout", &self.registration_timeout)
            .finish_non_exhaustive()
    }
}

impl ConnectionManager {
    pub fn new(client_id: &str, connector: Arc<dyn Connector>, registration_timeout: Duration) -> Self {
        Self {
            client_id: client_id.to_string(),
            connector,
            registration_timeout,
            connections: RwLock::new(HashMap::new()),
        }
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    /// Open a link, register, and wait for the device's verdict.
    ///
    /// Returns the inbound frame stream for the message processor. On
    /// rejection or timeout the link is dropped, which closes the socket.
    pub async fn connect_to_device(
        &self,
        device: &DeviceInfo,
    ) -> Result<mpsc::UnboundedReceiver<String>> {
        let device_id = device.device_id.as_str();
        if self.is_connected(device_id).await {
            // A stale handle would shadow the new link.
            self.disconnect_device(device_id).await;
        }

        let Link {
            outbound,
            mut inbound,
        } = self.connector.open(device_id, &device.server_url).await?;

        let register = Envelope::register(&self.client_id, device_id).to_json()?;
        outbound
            .send(register)
            .map_err(|_| Error::connection(device_id, "link closed before registration"))?;

        let verdict = match tokio::time::timeout(self.registration_timeout, inbound.recv()).await {
            Err(_) => {
                warn!(device_id, timeout = ?self.registration_timeout, "registration timed out");
                return Err(Error::connection(
                    device_id,
                    format!("registration timed out after {:?}", self.registration_timeout),
                ));
            }
            Ok(None) => {
                return Err(Error::connection(device_id, "link closed during registration"));
            }
            Ok(Some(frame)) => Envelope::from_json(&frame)
                .map_err(|e| Error::connection(device_id, format!("bad registration reply: {}", e)))?,
        };

        if verdict.message_type != MessageType::Register && verdict.message_type != MessageType::Error {
            return Err(Error::connection(
                device_id,
                format!("expected registration reply, got {:?}", verdict.message_type),
            ));
        }
        if !verdict.is_ok() || verdict.message_type == MessageType::Error {
            let reason = verdict
                .error
                .unwrap_or_else(|| "no reason given".to_string());
            warn!(device_id, %reason, "registration rejected");
            return Err(Error::connection(
                device_id,
                format!("registration rejected: {}", reason),
            ));
        }

        self.connections
            .write()
            .await
            .insert(device_id.to_string(), outbound);
        info!(device_id, url = %device.server_url, "device registered with orchestrator");
        Ok(inbound)
    }

    /// Queue one envelope for a device.
    pub async fn send(&self, device_id: &str, envelope: &Envelope) -> Result<()> {
        let frame = envelope.to_json()?;
        let sender = self
            .connections
            .read()
            .await
            .get(device_id)
            .cloned()
            .ok_or_else(|| Error::DeviceNotConnected(device_id.to_string()))?;

        if sender.send(frame).is_err() {
            self.connections.write().await.remove(device_id);
            return Err(Error::connection(device_id, "link closed"));
        }
        Ok(())
    }

    pub async fn send_task_to_device(&self, request: &TaskRequest) -> Result<()> {
        debug!(device_id = %request.device_id, task_id = %request.task_id, "sending task");
        self.send(&request.device_id, &Envelope::task(&self.client_id, request))
            .await
    }

    /// Ask a device to describe itself. Returns the request id.
    pub async fn request_device_info(&self, device_id: &str) -> Result<String> {
        let request_id = format!("info_{}", Uuid::new_v4().simple());
        let envelope = Envelope::device_info_request(&self.client_id, device_id, &request_id);
        self.send(device_id, &envelope).await?;
        Ok(request_id)
    }

    pub async fn send_heartbeat(&self, device_id: &str) -> Result<()> {
        self.send(device_id, &Envelope::heartbeat(&self.client_id))
            .await
    }

    /// Drop the local handle. Never fails; returns whether one existed.
    pub async fn disconnect_device(&self, device_id: &str) -> bool {
        let removed = self.connections.write().await.remove(device_id).is_some();
        if removed {
            info!(device_id, "device disconnected");
        }
        removed
    }

    pub async fn disconnect_all(&self) {
        let drained: Vec<String> = self
            .connections
            .write()
            .await
            .drain()
            .map(|(id, _)| id)
            .collect();
        for device_id in drained {
            info!(device_id = %device_id, "device disconnected");
        }
    }

    pub async fn is_connected(&self, device_id: &str) -> bool {
        self.connections.read().await.contains_key(device_id)
    }

    pub async fn connected_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.connections.read().await.keys().cloned().collect();
        ids.sort();
        ids
    }
}
