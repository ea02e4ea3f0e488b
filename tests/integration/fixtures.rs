//! Test fixtures for integration tests.
//!
//! Provides helpers for:
//! - A scripted fleet of mock devices behind the in-memory connector
//! - Fast manager options for reconnect and heartbeat scenarios
//! - Predefined constellations

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::json;
use tokio::sync::{broadcast, mpsc, Notify};

use constellation::core::{Constellation, Dependency, DependencyType, Task};
use constellation::device::{
    ConstellationEvent, DeviceSpec, Envelope, HeartbeatConfig, MemoryConnector, MessageType, Peer,
};
use constellation::orchestration::{DeviceManager, ManagerOptions, ReconnectPolicy};

/// How a mock device answers the REGISTER handshake.
#[derive(Debug, Clone, PartialEq)]
pub enum Registration {
    Accept,
    Reject(String),
    /// Keep the socket open and never answer.
    Silent,
}

/// Scripted behavior for one mock device.
#[derive(Debug, Clone)]
pub struct DeviceScript {
    pub registration: Registration,
    /// How long each task takes.
    pub task_delay: Duration,
    /// Answer tasks with a failed TASK_END.
    pub fail_tasks: bool,
    /// Never answer tasks at all.
    pub ignore_tasks: bool,
    pub answer_heartbeats: bool,
    pub capabilities: Vec<String>,
}

impl Default for DeviceScript {
    fn default() -> Self {
        Self {
            registration: Registration::Accept,
            task_delay: Duration::from_millis(50),
            fail_tasks: false,
            ignore_tasks: false,
            answer_heartbeats: true,
            capabilities: Vec::new(),
        }
    }
}

impl DeviceScript {
    pub fn with_capabilities(mut self, capabilities: &[&str]) -> Self {
        self.capabilities = capabilities.iter().map(|c| c.to_string()).collect();
        self
    }
}

#[derive(Default)]
struct FleetState {
    scripts: Mutex<HashMap<String, DeviceScript>>,
    kills: Mutex<HashMap<String, Arc<Notify>>>,
    outboxes: Mutex<HashMap<String, mpsc::UnboundedSender<Envelope>>>,
    connections: Mutex<HashMap<String, usize>>,
    received: Mutex<Vec<String>>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

/// A set of mock devices answering whatever the orchestrator connects to.
#[derive(Clone)]
pub struct MockFleet {
    state: Arc<FleetState>,
}

impl MockFleet {
    /// Start the fleet. Returns it with the connector to hand to a manager.
    pub fn start() -> (Self, MemoryConnector) {
        let (connector, mut peers) = MemoryConnector::new();
        let state = Arc::new(FleetState::default());
        let fleet_state = Arc::clone(&state);
        tokio::spawn(async move {
            while let Some(peer) = peers.recv().await {
                let state = Arc::clone(&fleet_state);
                tokio::spawn(run_device(peer, state));
            }
        });
        (Self { state }, connector)
    }

    pub fn script(&self, device_id: &str, script: DeviceScript) {
        self.state
            .scripts
            .lock()
            .unwrap()
            .insert(device_id.to_string(), script);
    }

    pub fn update(&self, device_id: &str, f: impl FnOnce(&mut DeviceScript)) {
        let mut scripts = self.state.scripts.lock().unwrap();
        f(scripts.entry(device_id.to_string()).or_default());
    }

    /// Close the device's current socket from the device side.
    pub fn drop_link(&self, device_id: &str) {
        if let Some(kill) = self.state.kills.lock().unwrap().get(device_id) {
            kill.notify_one();
        }
    }

    /// Send an arbitrary frame over the device's current link.
    pub fn send_as(&self, device_id: &str, envelope: Envelope) {
        if let Some(outbox) = self.state.outboxes.lock().unwrap().get(device_id) {
            let _ = outbox.send(envelope);
        }
    }

    pub fn connections(&self, device_id: &str) -> usize {
        self.state
            .connections
            .lock()
            .unwrap()
            .get(device_id)
            .copied()
            .unwrap_or(0)
    }

    /// Task ids in the order devices received them.
    pub fn received(&self) -> Vec<String> {
        self.state.received.lock().unwrap().clone()
    }

    pub fn max_in_flight(&self) -> usize {
        self.state.max_in_flight.load(Ordering::SeqCst)
    }
}

async fn run_device(mut peer: Peer, state: Arc<FleetState>) {
    let device_id = peer.device_id.clone();
    let script = state
        .scripts
        .lock()
        .unwrap()
        .get(&device_id)
        .cloned()
        .unwrap_or_default();
    let kill = Arc::new(Notify::new());
    state
        .kills
        .lock()
        .unwrap()
        .insert(device_id.clone(), Arc::clone(&kill));
    *state
        .connections
        .lock()
        .unwrap()
        .entry(device_id.clone())
        .or_default() += 1;

    let Some(first) = peer.from_orchestrator.recv().await else {
        return;
    };
    let register = Envelope::from_json(&first).unwrap();
    assert_eq!(register.message_type, MessageType::Register);

    match &script.registration {
        Registration::Accept => {
            let reply = Envelope::registration_reply(&device_id, true, None);
            peer.to_orchestrator.send(reply.to_json().unwrap()).unwrap();
        }
        Registration::Reject(reason) => {
            let reply = Envelope::registration_reply(&device_id, false, Some(reason));
            let _ = peer.to_orchestrator.send(reply.to_json().unwrap());
            return;
        }
        Registration::Silent => {
            kill.notified().await;
            return;
        }
    }

    let (reply_tx, mut reply_rx) = mpsc::unbounded_channel::<Envelope>();
    state
        .outboxes
        .lock()
        .unwrap()
        .insert(device_id.clone(), reply_tx.clone());
    loop {
        tokio::select! {
            _ = kill.notified() => break,
            Some(reply) = reply_rx.recv() => {
                if peer.to_orchestrator.send(reply.to_json().unwrap()).is_err() {
                    break;
                }
            }
            frame = peer.from_orchestrator.recv() => {
                let Some(frame) = frame else { break };
                let envelope = Envelope::from_json(&frame).unwrap();
                match envelope.message_type {
                    MessageType::Task => {
                        let session = envelope.session_id.clone().unwrap();
                        state.received.lock().unwrap().push(session.clone());
                        if script.ignore_tasks {
                            continue;
                        }
                        let state = Arc::clone(&state);
                        let reply_tx = reply_tx.clone();
                        let script = script.clone();
                        let device_id = device_id.clone();
                        tokio::spawn(async move {
                            let now = state.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                            state.max_in_flight.fetch_max(now, Ordering::SeqCst);
                            tokio::time::sleep(script.task_delay).await;
                            state.in_flight.fetch_sub(1, Ordering::SeqCst);
                            let reply = if script.fail_tasks {
                                Envelope::task_failed(&device_id, &session, "scripted failure")
                            } else {
                                Envelope::task_completed(
                                    &device_id,
                                    &session,
                                    Some(json!({ "device": device_id, "task": session })),
                                )
                            };
                            let _ = reply_tx.send(reply);
                        });
                    }
                    MessageType::Heartbeat => {
                        if script.answer_heartbeats {
                            let _ = reply_tx.send(Envelope::heartbeat(&device_id));
                        }
                    }
                    MessageType::DeviceInfoRequest => {
                        let mut reply = Envelope::new(MessageType::DeviceInfoResponse, &device_id);
                        reply.request_id = envelope.request_id.clone();
                        reply.result = Some(json!({
                            "capabilities": script.capabilities,
                            "platform": "mock",
                        }));
                        let _ = reply_tx.send(reply);
                    }
                    _ => {}
                }
            }
        }
    }
}

/// Options with short intervals so reconnect scenarios finish quickly
/// under paused time.
pub fn fast_options() -> ManagerOptions {
    ManagerOptions {
        client_id: "test_orchestrator".to_string(),
        heartbeat: HeartbeatConfig {
            interval: Duration::from_secs(1),
            max_missed: 2,
        },
        reconnect: ReconnectPolicy {
            delay: Duration::from_secs(1),
            max_retries: 2,
        },
        registration_timeout: Duration::from_secs(2),
        task_timeout: Duration::from_secs(30),
        max_concurrent: 2,
        event_capacity: 256,
    }
}

/// Manager with every listed device scripted, registered and connected.
pub async fn connected_manager(
    fleet: &MockFleet,
    connector: MemoryConnector,
    options: ManagerOptions,
    devices: &[(&str, &[&str])],
) -> Arc<DeviceManager> {
    let manager = DeviceManager::new(options, Arc::new(connector));
    for (id, capabilities) in devices {
        fleet.update(id, |s| {
            s.capabilities = capabilities.iter().map(|c| c.to_string()).collect()
        });
        manager
            .register_device(
                DeviceSpec::new(id, &format!("mem://{}", id)).with_capabilities(capabilities),
            )
            .await;
        manager.connect_device(id).await.unwrap();
    }
    manager
}

/// Wait for the first event matching `pred`.
pub async fn wait_for_event(
    events: &mut broadcast::Receiver<ConstellationEvent>,
    pred: impl Fn(&ConstellationEvent) -> bool,
) -> ConstellationEvent {
    tokio::time::timeout(Duration::from_secs(120), async {
        loop {
            match events.recv().await {
                Ok(event) if pred(&event) => return event,
                Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => panic!("event bus closed"),
            }
        }
    })
    .await
    .expect("timed out waiting for event")
}

/// a -> b -> d, a -> c -> d
pub fn diamond() -> Constellation {
    let mut c = Constellation::new("diamond");
    for id in ["a", "b", "c", "d"] {
        c.add_task(Task::new(id, id, &format!("step {}", id))).unwrap();
    }
    for (from, to) in [("a", "b"), ("a", "c"), ("b", "d"), ("c", "d")] {
        c.add_dependency(
            Dependency::new(&Dependency::edge_id(from, to), from, to)
                .with_type(DependencyType::SuccessOnly),
        )
        .unwrap();
    }
    c
}
