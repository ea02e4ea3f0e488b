//! Device lifecycle supervision.
//!
//! The DeviceManager owns every device-side component and wires them
//! together. Heartbeat probes, receive loops and the orchestrator report
//! liveness problems as [`DeviceSignal`]s; one supervisor task turns each
//! signal for a connected device into a teardown followed by a fixed-delay
//! reconnect loop. When a device uses up its retry budget it is marked
//! FAILED and a `DeviceDisconnected { failed: true }` event goes out. No
//! error is returned to anyone for that.

use super::orchestrator::{TaskOrchestrator, TaskResult};
use super::parallel::{ParallelTaskManager, DEFAULT_MAX_CONCURRENT, DEFAULT_TASK_TIMEOUT_SECS};
use super::selector::{DeviceSelector, SelectionCriteria};
use crate::config::Config;
use crate::device::{
    ConnectionManager, Connector, ConstellationEvent, DeviceInfo, DeviceRegistry, DeviceSignal,
    DeviceSpec, DeviceStatus, EventManager, HeartbeatConfig, HeartbeatManager, MessageProcessor,
    TaskRequest, DEFAULT_DEVICE_MAX_RETRIES, DEFAULT_REGISTRATION_TIMEOUT_SECS,
};
use crate::error::{Error, Result};
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

pub const DEFAULT_RECONNECT_DELAY_SECS: u64 = 5;

/// Fixed-delay reconnection budget.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub delay: Duration,
    /// Used for devices registered without their own limit.
    pub max_retries: u32,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            delay: Duration::from_secs(DEFAULT_RECONNECT_DELAY_SECS),
            max_retries: DEFAULT_DEVICE_MAX_RETRIES,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ManagerOptions {
    pub client_id: String,
    pub heartbeat: HeartbeatConfig,
    pub reconnect: ReconnectPolicy,
    pub registration_timeout: Duration,
    pub task_timeout: Duration,
    pub max_concurrent: usize,
    pub event_capacity: usize,
}

impl Default for ManagerOptions {
    fn default() -> Self {
        Self {
            client_id: "constellation_orchestrator".to_string(),
            heartbeat: HeartbeatConfig::default(),
            reconnect: ReconnectPolicy::default(),
            registration_timeout: Duration::from_secs(DEFAULT_REGISTRATION_TIMEOUT_SECS),
            task_timeout: Duration::from_secs(DEFAULT_TASK_TIMEOUT_SECS),
            max_concurrent: DEFAULT_MAX_CONCURRENT,
            event_capacity: 1024,
        }
    }
}

impl From<&Config> for ManagerOptions {
    fn from(config: &Config) -> Self {
        Self {
            client_id: config.client_id.clone(),
            heartbeat: config.heartbeat_config(),
            reconnect: config.reconnect_policy(),
            registration_timeout: config.registration_timeout(),
            task_timeout: config.task_timeout(),
            max_concurrent: config.max_concurrent,
            ..Default::default()
        }
    }
}

pub struct DeviceManager {
    options: ManagerOptions,
    registry: Arc<DeviceRegistry>,
    connections: Arc<ConnectionManager>,
    heartbeat: Arc<HeartbeatManager>,
    processor: Arc<MessageProcessor>,
    events: Arc<EventManager>,
    orchestrator: Arc<TaskOrchestrator>,
    selector: DeviceSelector,
    reconnects: Mutex<HashMap<String, CancellationToken>>,
    cancel: CancellationToken,
    supervisor: Mutex<Option<JoinHandle<()>>>,
}

impl DeviceManager {
    /// Build every component and start the supervisor. Must be called from
    /// inside a tokio runtime.
    pub fn new(options: ManagerOptions, connector: Arc<dyn Connector>) -> Arc<Self> {
        let (signal_tx, signal_rx) = mpsc::unbounded_channel();
        let registry = Arc::new(DeviceRegistry::new());
        let connections = Arc::new(ConnectionManager::new(
            &options.client_id,
            connector,
            options.registration_timeout,
        ));
        let events = Arc::new(EventManager::new(options.event_capacity));
        let heartbeat = Arc::new(HeartbeatManager::new(
            options.heartbeat.clone(),
            Arc::clone(&connections),
            Arc::clone(&registry),
            signal_tx.clone(),
        ));
        let orchestrator = Arc::new(TaskOrchestrator::new(
            Arc::clone(&registry),
            Arc::clone(&connections),
            Arc::clone(&events),
            signal_tx.clone(),
        ));
        let processor = Arc::new(MessageProcessor::new(
            Arc::clone(&orchestrator),
            Arc::clone(&heartbeat),
            Arc::clone(&registry),
            signal_tx,
        ));
        let selector = DeviceSelector::new(Arc::clone(&registry));
        let cancel = CancellationToken::new();

        Arc::new_cyclic(|weak: &Weak<DeviceManager>| {
            let supervisor = tokio::spawn(supervise(weak.clone(), signal_rx, cancel.clone()));
            Self {
                options,
                registry,
                connections,
                heartbeat,
                processor,
                events,
                orchestrator,
                selector,
                reconnects: Mutex::new(HashMap::new()),
                cancel,
                supervisor: Mutex::new(Some(supervisor)),
            }
        })
    }

    pub fn from_config(config: &Config, connector: Arc<dyn Connector>) -> Arc<Self> {
        Self::new(ManagerOptions::from(config), connector)
    }

    pub fn options(&self) -> &ManagerOptions {
        &self.options
    }

    pub fn registry(&self) -> &Arc<DeviceRegistry> {
        &self.registry
    }

    pub fn connections(&self) -> &Arc<ConnectionManager> {
        &self.connections
    }

    pub fn heartbeat(&self) -> &Arc<HeartbeatManager> {
        &self.heartbeat
    }

    pub fn processor(&self) -> &Arc<MessageProcessor> {
        &self.processor
    }

    pub fn events(&self) -> &Arc<EventManager> {
        &self.events
    }

    pub fn orchestrator(&self) -> &Arc<TaskOrchestrator> {
        &self.orchestrator
    }

    pub fn selector(&self) -> &DeviceSelector {
        &self.selector
    }

    /// A batch runner sharing this manager's orchestrator and devices.
    pub fn parallel(&self) -> ParallelTaskManager {
        ParallelTaskManager::new(
            Arc::clone(&self.orchestrator),
            self.selector.clone(),
            self.options.max_concurrent,
        )
        .with_default_timeout(self.options.task_timeout)
    }

    /// Register a device, applying the default retry budget if it has none.
    pub async fn register_device(&self, mut spec: DeviceSpec) -> DeviceInfo {
        if spec.max_retries.is_none() {
            spec.max_retries = Some(self.options.reconnect.max_retries);
        }
        self.registry.register_device(spec).await
    }

    /// Open, register and start supervising one device.
    pub async fn connect_device(&self, device_id: &str) -> Result<()> {
        let device = self
            .registry
            .get_device(device_id)
            .await
            .ok_or_else(|| Error::DeviceNotFound(device_id.to_string()))?;
        if device.is_connected() && self.connections.is_connected(device_id).await {
            return Ok(());
        }

        self.registry
            .update_device_status(device_id, DeviceStatus::Connecting)
            .await?;
        let attempt = self.registry.increment_connection_attempts(device_id).await?;
        debug!(device_id, attempt, "connecting");

        let inbound = match self.connections.connect_to_device(&device).await {
            Ok(inbound) => inbound,
            Err(e) => {
                warn!(device_id, attempt, error = %e, "connection attempt failed");
                self.registry
                    .update_device_status(device_id, DeviceStatus::Disconnected)
                    .await?;
                return Err(e);
            }
        };

        self.processor.start_processing(device_id, inbound).await;
        self.registry
            .update_device_status(device_id, DeviceStatus::Connected)
            .await?;
        self.registry.reset_connection_attempts(device_id).await?;
        self.heartbeat.start_heartbeat(device_id).await;
        self.events.publish(ConstellationEvent::DeviceConnected {
            device_id: device_id.to_string(),
        });
        info!(device_id, "device connected");

        if let Err(e) = self.connections.request_device_info(device_id).await {
            debug!(device_id, error = %e, "device info request failed");
        }
        Ok(())
    }

    /// Connect every registered device that is not connected yet.
    pub async fn connect_all(&self) -> Vec<(String, Result<()>)> {
        let mut outcomes = Vec::new();
        for device in self.registry.get_all_devices().await {
            if device.is_connected() {
                continue;
            }
            let outcome = self.connect_device(&device.device_id).await;
            outcomes.push((device.device_id, outcome));
        }
        outcomes
    }

    /// Close a device on request. No reconnection follows.
    pub async fn disconnect_device(&self, device_id: &str) -> Result<()> {
        if self.registry.get_device(device_id).await.is_none() {
            return Err(Error::DeviceNotFound(device_id.to_string()));
        }
        if let Some(token) = self.reconnects.lock().await.remove(device_id) {
            token.cancel();
        }
        self.teardown(device_id, "disconnected by orchestrator").await?;
        Ok(())
    }

    pub async fn unregister_device(&self, device_id: &str) -> Result<DeviceInfo> {
        self.disconnect_device(device_id).await?;
        self.registry
            .unregister_device(device_id)
            .await
            .ok_or_else(|| Error::DeviceNotFound(device_id.to_string()))
    }

    /// Pick a device (or use `device_id`) and run one request on it.
    pub async fn dispatch(
        &self,
        request: &str,
        device_id: Option<&str>,
        criteria: &SelectionCriteria,
        timeout: Option<Duration>,
    ) -> Result<TaskResult> {
        let device_id = match device_id {
            Some(id) => id.to_string(),
            None => self.selector.select_best_device(criteria).await?.device_id,
        };
        let task_id = self.orchestrator.generate_task_id();
        let timeout = timeout.unwrap_or(self.options.task_timeout);
        self.orchestrator
            .execute_task(TaskRequest::new(&task_id, &device_id, request, timeout), None)
            .await
    }

    /// Stop supervision, every probe and every receive loop, and close all links.
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        if let Some(supervisor) = self.supervisor.lock().await.take() {
            let _ = supervisor.await;
        }
        for (_, token) in self.reconnects.lock().await.drain() {
            token.cancel();
        }

        self.heartbeat.stop_all().await;
        self.processor.stop_all().await;
        for device_id in self.connections.connected_ids().await {
            self.orchestrator
                .fail_device_tasks(&device_id, "orchestrator shutting down")
                .await;
        }
        self.connections.disconnect_all().await;
        for device in self.registry.get_connected_devices().await {
            let _ = self
                .registry
                .update_device_status(&device.device_id, DeviceStatus::Disconnected)
                .await;
        }
        info!("device manager stopped");
    }

    /// Tear down one device's runtime state and report the disconnection.
    async fn teardown(&self, device_id: &str, reason: &str) -> Result<()> {
        self.heartbeat.stop_heartbeat(device_id).await;
        self.processor.stop_processing(device_id).await;
        self.connections.disconnect_device(device_id).await;
        self.registry
            .update_device_status(device_id, DeviceStatus::Disconnected)
            .await?;

        let failed = self.orchestrator.fail_device_tasks(device_id, reason).await;
        if failed > 0 {
            warn!(device_id, failed, "pending tasks failed by disconnection");
        }
        self.events.publish(ConstellationEvent::DeviceDisconnected {
            device_id: device_id.to_string(),
            failed: false,
            reason: reason.to_string(),
        });
        Ok(())
    }

    async fn handle_signal(self: &Arc<Self>, signal: DeviceSignal) {
        let device_id = signal.device_id().to_string();
        let connected = self
            .registry
            .get_device(&device_id)
            .await
            .map(|d| d.is_connected())
            .unwrap_or(false);
        if !connected {
            debug!(device_id = %device_id, ?signal, "ignoring signal for device that is not connected");
            return;
        }

        let reason = signal.reason();
        warn!(device_id = %device_id, %reason, "device lost");
        if let Err(e) = self.teardown(&device_id, &reason).await {
            error!(device_id = %device_id, error = %e, "teardown failed");
            return;
        }
        self.schedule_reconnect(&device_id).await;
    }

    async fn schedule_reconnect(self: &Arc<Self>, device_id: &str) {
        let token = self.cancel.child_token();
        if let Some(previous) = self
            .reconnects
            .lock()
            .await
            .insert(device_id.to_string(), token.clone())
        {
            previous.cancel();
        }

        let manager = Arc::clone(self);
        let id = device_id.to_string();
        tokio::spawn(async move { manager.reconnect_loop(&id, token).await });
    }

    async fn reconnect_loop(&self, device_id: &str, token: CancellationToken) {
        let delay = self.options.reconnect.delay;
        loop {
            tokio::select! {
                _ = token.cancelled() => return,
                _ = tokio::time::sleep(delay) => {}
            }

            let Some(device) = self.registry.get_device(device_id).await else {
                return;
            };
            if device.is_connected() {
                return;
            }

            let error = match self.connect_device(device_id).await {
                Ok(()) => {
                    info!(device_id, "device reconnected");
                    return;
                }
                Err(e) => e,
            };

            let Some(device) = self.registry.get_device(device_id).await else {
                return;
            };
            if device.retries_exhausted() {
                error!(
                    device_id,
                    attempts = device.connection_attempts,
                    "reconnection abandoned"
                );
                let _ = self
                    .registry
                    .update_device_status(device_id, DeviceStatus::Failed)
                    .await;
                self.events.publish(ConstellationEvent::DeviceDisconnected {
                    device_id: device_id.to_string(),
                    failed: true,
                    reason: format!(
                        "gave up after {} attempts: {}",
                        device.connection_attempts, error
                    ),
                });
                return;
            }
        }
    }
}

async fn supervise(
    manager: Weak<DeviceManager>,
    mut signals: mpsc::UnboundedReceiver<DeviceSignal>,
    cancel: CancellationToken,
) {
    loop {
        let signal = tokio::select! {
            _ = cancel.cancelled() => break,
            signal = signals.recv() => match signal {
                Some(signal) => signal,
                None => break,
            },
        };
        let Some(manager) = manager.upgrade() else {
            break;
        };
        manager.handle_signal(signal).await;
    }
    debug!("device supervisor stopped");
}
