//! Heartbeat monitoring for connected devices.
//!
//! The `HeartbeatManager` runs one periodic probe per device. Each tick
//! sends a `HEARTBEAT` frame and counts it as outstanding until the device
//! answers. When the outstanding count reaches the configured limit the
//! manager stops probing that device and emits a [`DeviceSignal::HeartbeatLost`]
//! so the supervisor can disconnect and schedule reconnection.
//!
//! ## Lifecycle
//!
//! - `start_heartbeat` replaces any probe already running for the device.
//! - `stop_heartbeat` / `stop_all` cancel probes through a
//!   `CancellationToken` and wait for the task to exit, so no timers leak.

use super::connection::ConnectionManager;
use super::registry::DeviceRegistry;
use super::DeviceSignal;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Default time between heartbeat probes.
pub const DEFAULT_HEARTBEAT_INTERVAL_SECS: u64 = 30;

/// Default number of unanswered probes before a device is considered lost.
pub const DEFAULT_MAX_MISSED_HEARTBEATS: u32 = 3;

/// Configuration for heartbeat probing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeartbeatConfig {
    /// Time between probes.
    pub interval: Duration,
    /// Unanswered probes tolerated before the device is reported lost.
    pub max_missed: u32,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(DEFAULT_HEARTBEAT_INTERVAL_SECS),
            max_missed: DEFAULT_MAX_MISSED_HEARTBEATS,
        }
    }
}

impl HeartbeatConfig {
    /// Create a config with the given interval and the default miss limit.
    pub fn with_interval(interval: Duration) -> Self {
        Self {
            interval,
            ..Default::default()
        }
    }
}

/// A running probe for one device.
struct HeartbeatWorker {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
    /// Probes sent without a reply since the last response.
    outstanding: Arc<AtomicU32>,
}

/// Periodic liveness probing for every connected device.
pub struct HeartbeatManager {
    /// Probe interval and miss limit.
    config: HeartbeatConfig,
    /// Used to send probe frames.
    connections: Arc<ConnectionManager>,
    /// Receives `last_heartbeat` updates.
    registry: Arc<DeviceRegistry>,
    /// Channel for reporting lost devices.
    signal_tx: mpsc::UnboundedSender<DeviceSignal>,
    /// Running probes keyed by device id.
    workers: Mutex<HashMap<String, HeartbeatWorker>>,
}

impl HeartbeatManager {
    /// Create a new heartbeat manager.
    ///
    /// # Arguments
    ///
    /// * `config` - Probe interval and miss limit
    /// * `connections` - Connection manager used to send probes
    /// * `registry` - Registry that records heartbeat timestamps
    /// * `signal_tx` - Channel for emitting `HeartbeatLost` signals
    pub fn new(
        config: HeartbeatConfig,
        connections: Arc<ConnectionManager>,
        registry: Arc<DeviceRegistry>,
        signal_tx: mpsc::UnboundedSender<DeviceSignal>,
    ) -> Self {
        Self {
            config,
            connections,
            registry,
            signal_tx,
            workers: Mutex::new(HashMap::new()),
        }
    }

    /// Get the heartbeat configuration.
    pub fn config(&self) -> &HeartbeatConfig {
        &self.config
    }

    /// Start probing a device, replacing any existing probe for it.
    pub async fn start_heartbeat(&self, device_id: &str) {
        self.stop_heartbeat(device_id).await;

        let cancel = CancellationToken::new();
        let outstanding = Arc::new(AtomicU32::new(0));
        let handle = tokio::spawn(probe_loop(
            device_id.to_string(),
            self.config.clone(),
            Arc::clone(&self.connections),
            self.signal_tx.clone(),
            cancel.clone(),
            Arc::clone(&outstanding),
        ));

        debug!(device_id, interval = ?self.config.interval, "heartbeat started");
        self.workers.lock().await.insert(
            device_id.to_string(),
            HeartbeatWorker {
                cancel,
                handle,
                outstanding,
            },
        );
    }

    /// Stop probing a device. Returns whether a probe was running.
    pub async fn stop_heartbeat(&self, device_id: &str) -> bool {
        let worker = self.workers.lock().await.remove(device_id);
        match worker {
            Some(worker) => {
                worker.cancel.cancel();
                let _ = worker.handle.await;
                debug!(device_id, "heartbeat stopped");
                true
            }
            None => false,
        }
    }

    /// Stop every probe.
    pub async fn stop_all(&self) {
        let workers: Vec<(String, HeartbeatWorker)> =
            self.workers.lock().await.drain().collect();
        for (_, worker) in &workers {
            worker.cancel.cancel();
        }
        for (device_id, worker) in workers {
            let _ = worker.handle.await;
            debug!(device_id = %device_id, "heartbeat stopped");
        }
    }

    /// Record a heartbeat reply from a device.
    ///
    /// Clears the outstanding count and updates `last_heartbeat`. Replies
    /// from devices without a running probe still update the timestamp.
    pub async fn record_response(&self, device_id: &str) {
        if let Some(worker) = self.workers.lock().await.get(device_id) {
            worker.outstanding.store(0, Ordering::SeqCst);
        }
        if let Err(e) = self.registry.update_heartbeat(device_id).await {
            debug!(device_id, error = %e, "heartbeat from unknown device");
        }
    }

    /// Whether a probe is running for the device.
    pub async fn is_running(&self, device_id: &str) -> bool {
        self.workers
            .lock()
            .await
            .get(device_id)
            .map(|w| !w.handle.is_finished())
            .unwrap_or(false)
    }

    /// Number of probe tasks still alive.
    pub async fn active_count(&self) -> usize {
        self.workers
            .lock()
            .await
            .values()
            .filter(|w| !w.handle.is_finished())
            .count()
    }

    /// Unanswered probes for a device, if it is being probed.
    pub async fn outstanding(&self, device_id: &str) -> Option<u32> {
        self.workers
            .lock()
            .await
            .get(device_id)
            .map(|w| w.outstanding.load(Ordering::SeqCst))
    }
}

async fn probe_loop(
    device_id: String,
    config: HeartbeatConfig,
    connections: Arc<ConnectionManager>,
    signal_tx: mpsc::UnboundedSender<DeviceSignal>,
    cancel: CancellationToken,
    outstanding: Arc<AtomicU32>,
) {
    let start = tokio::time::Instant::now() + config.interval;
    let mut ticker = tokio::time::interval_at(start, config.interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = ticker.tick() => {}
        }

        let missed = outstanding.load(Ordering::SeqCst);
        if missed >= config.max_missed {
            warn!(device_id = %device_id, missed, "heartbeat lost");
            let _ = signal_tx.send(DeviceSignal::HeartbeatLost {
                device_id: device_id.clone(),
                missed,
            });
            return;
        }

        outstanding.fetch_add(1, Ordering::SeqCst);
        if let Err(e) = connections.send_heartbeat(&device_id).await {
            debug!(device_id = %device_id, error = %e, "heartbeat send failed");
        }
    }
}
