//! Device metadata and status store.
//!
//! The registry is the single owner of device records. Readers get cloned
//! `DeviceInfo` values, never references into the map, so a concurrent
//! writer can't tear a read.

use crate::error::{Error, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::{BTreeSet, HashMap};
use tokio::sync::RwLock;
use tracing::{debug, info};

/// Default reconnection budget for a device.
pub const DEFAULT_DEVICE_MAX_RETRIES: u32 = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DeviceStatus {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    /// Reconnection budget exhausted.
    Failed,
}

impl std::fmt::Display for DeviceStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DeviceStatus::Disconnected => write!(f, "disconnected"),
            DeviceStatus::Connecting => write!(f, "connecting"),
            DeviceStatus::Connected => write!(f, "connected"),
            DeviceStatus::Failed => write!(f, "failed"),
        }
    }
}

/// What a caller supplies to register a device. Also the shape of a
/// `[[devices]]` entry in the config file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceSpec {
    pub id: String,
    pub server_url: String,
    #[serde(default)]
    pub capabilities: Vec<String>,
    #[serde(default)]
    pub metadata: Map<String, Value>,
    #[serde(default)]
    pub max_retries: Option<u32>,
}

impl DeviceSpec {
    pub fn new(id: &str, server_url: &str) -> Self {
        Self {
            id: id.to_string(),
            server_url: server_url.to_string(),
            capabilities: Vec::new(),
            metadata: Map::new(),
            max_retries: None,
        }
    }

    pub fn with_capabilities(mut self, capabilities: &[&str]) -> Self {
        self.capabilities = capabilities.iter().map(|c| c.to_string()).collect();
        self
    }

    pub fn with_metadata(mut self, key: &str, value: Value) -> Self {
        self.metadata.insert(key.to_string(), value);
        self
    }
}

/// A registered device as seen at one point in time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceInfo {
    pub device_id: String,
    pub server_url: String,
    pub status: DeviceStatus,
    pub capabilities: BTreeSet<String>,
    pub metadata: Map<String, Value>,
    pub connection_attempts: u32,
    pub max_retries: u32,
    pub last_heartbeat: Option<DateTime<Utc>>,
    pub registered_at: DateTime<Utc>,
}

impl DeviceInfo {
    fn from_spec(spec: DeviceSpec) -> Self {
        Self {
            device_id: spec.id,
            server_url: spec.server_url,
            status: DeviceStatus::Disconnected,
            capabilities: spec.capabilities.into_iter().collect(),
            metadata: spec.metadata,
            connection_attempts: 0,
            max_retries: spec.max_retries.unwrap_or(DEFAULT_DEVICE_MAX_RETRIES),
            last_heartbeat: None,
            registered_at: Utc::now(),
        }
    }

    pub fn is_connected(&self) -> bool {
        self.status == DeviceStatus::Connected
    }

    /// Whether the device advertises every capability in `required`.
    pub fn has_capabilities(&self, required: &[String]) -> bool {
        required.iter().all(|c| self.capabilities.contains(c))
    }

    /// `metadata.device_type`, if it is a string.
    pub fn device_type(&self) -> Option<&str> {
        self.metadata.get("device_type").and_then(Value::as_str)
    }

    pub fn retries_exhausted(&self) -> bool {
        self.connection_attempts >= self.max_retries
    }
}

#[derive(Debug, Default)]
struct RegistryInner {
    devices: HashMap<String, DeviceInfo>,
    /// Registration order, used to break ranking ties.
    order: Vec<String>,
}

#[derive(Debug, Default)]
pub struct DeviceRegistry {
    inner: RwLock<RegistryInner>,
}

impl DeviceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a device, or refresh its description if already known.
    ///
    /// Re-registration replaces url, capabilities, metadata and retry budget
    /// but keeps status, attempts and heartbeat.
    pub async fn register_device(&self, spec: DeviceSpec) -> DeviceInfo {
        let mut inner = self.inner.write().await;
        if let Some(existing) = inner.devices.get_mut(&spec.id) {
            existing.server_url = spec.server_url;
            existing.capabilities = spec.capabilities.into_iter().collect();
            existing.metadata = spec.metadata;
            if let Some(max_retries) = spec.max_retries {
                existing.max_retries = max_retries;
            }
            debug!(device_id = %existing.device_id, "device re-registered");
            return existing.clone();
        }

        let device = DeviceInfo::from_spec(spec);
        info!(device_id = %device.device_id, url = %device.server_url, "device registered");
        inner.order.push(device.device_id.clone());
        inner.devices.insert(device.device_id.clone(), device.clone());
        device
    }

    pub async fn unregister_device(&self, device_id: &str) -> Option<DeviceInfo> {
        let mut inner = self.inner.write().await;
        let removed = inner.devices.remove(device_id);
        if removed.is_some() {
            inner.order.retain(|id| id != device_id);
            info!(device_id, "device unregistered");
        }
        removed
    }

    pub async fn get_device(&self, device_id: &str) -> Option<DeviceInfo> {
        self.inner.read().await.devices.get(device_id).cloned()
    }

    /// Every device, in registration order.
    pub async fn get_all_devices(&self) -> Vec<DeviceInfo> {
        let inner = self.inner.read().await;
        inner
            .order
            .iter()
            .filter_map(|id| inner.devices.get(id).cloned())
            .collect()
    }

    /// Connected devices, in registration order.
    pub async fn get_connected_devices(&self) -> Vec<DeviceInfo> {
        self.get_all_devices()
            .await
            .into_iter()
            .filter(DeviceInfo::is_connected)
            .collect()
    }

    pub async fn is_device_connected(&self, device_id: &str) -> bool {
        self.inner
            .read()
            .await
            .devices
            .get(device_id)
            .map(DeviceInfo::is_connected)
            .unwrap_or(false)
    }

    pub async fn len(&self) -> usize {
        self.inner.read().await.devices.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.inner.read().await.devices.is_empty()
    }

    async fn with_device<T>(
        &self,
        device_id: &str,
        f: impl FnOnce(&mut DeviceInfo) -> T,
    ) -> Result<T> {
        let mut inner = self.inner.write().await;
        let device = inner
            .devices
            .get_mut(device_id)
            .ok_or_else(|| Error::DeviceNotFound(device_id.to_string()))?;
        Ok(f(device))
    }

    pub async fn update_device_status(&self, device_id: &str, status: DeviceStatus) -> Result<()> {
        self.with_device(device_id, |device| {
            if device.status != status {
                debug!(device_id, from = %device.status, to = %status, "device status");
            }
            device.status = status;
        })
        .await
    }

    pub async fn update_heartbeat(&self, device_id: &str) -> Result<()> {
        self.with_device(device_id, |device| {
            device.last_heartbeat = Some(Utc::now());
        })
        .await
    }

    /// Returns the new attempt count.
    pub async fn increment_connection_attempts(&self, device_id: &str) -> Result<u32> {
        self.with_device(device_id, |device| {
            device.connection_attempts += 1;
            device.connection_attempts
        })
        .await
    }

    pub async fn reset_connection_attempts(&self, device_id: &str) -> Result<()> {
        self.with_device(device_id, |device| device.connection_attempts = 0)
            .await
    }

    /// Merge a device's self-reported info.
    pub async fn update_device_info(
        &self,
        device_id: &str,
        capabilities: Vec<String>,
        metadata: Map<String, Value>,
    ) -> Result<()> {
        self.with_device(device_id, |device| {
            device.capabilities.extend(capabilities);
            device.metadata.extend(metadata);
        })
        .await
    }
}
