//! Inbound frame routing.
//!
//! One receive loop runs per connection. A bad frame is logged and skipped;
//! it never ends the loop, and loops never share state beyond the managers
//! they report to. A closed link ends the loop with a `ConnectionLost`
//! signal, while an explicit stop ends it silently.

use super::heartbeat::HeartbeatManager;
use super::protocol::{Envelope, MessageStatus, MessageType};
use super::registry::DeviceRegistry;
use super::DeviceSignal;
use crate::error::{Error, Result};
use crate::orchestration::TaskOrchestrator;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

struct ReceiveLoop {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

pub struct MessageProcessor {
    orchestrator: Arc<TaskOrchestrator>,
    heartbeat: Arc<HeartbeatManager>,
    registry: Arc<DeviceRegistry>,
    signal_tx: mpsc::UnboundedSender<DeviceSignal>,
    loops: Mutex<HashMap<String, ReceiveLoop>>,
}

impl MessageProcessor {
    pub fn new(
        orchestrator: Arc<TaskOrchestrator>,
        heartbeat: Arc<HeartbeatManager>,
        registry: Arc<DeviceRegistry>,
        signal_tx: mpsc::UnboundedSender<DeviceSignal>,
    ) -> Self {
        Self {
            orchestrator,
            heartbeat,
            registry,
            signal_tx,
            loops: Mutex::new(HashMap::new()),
        }
    }

    /// Spawn the receive loop for a freshly registered connection.
    pub async fn start_processing(
        self: &Arc<Self>,
        device_id: &str,
        mut inbound: mpsc::UnboundedReceiver<String>,
    ) {
        self.stop_processing(device_id).await;

        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let processor = Arc::clone(self);
        let id = device_id.to_string();

        let handle = tokio::spawn(async move {
            loop {
                let frame = tokio::select! {
                    _ = token.cancelled() => return,
                    frame = inbound.recv() => frame,
                };
                match frame {
                    Some(text) => {
                        if let Err(e) = processor.handle_frame(&id, &text).await {
                            warn!(device_id = %id, error = %e, "dropping inbound frame");
                        }
                    }
                    None => {
                        debug!(device_id = %id, "inbound link closed");
                        let _ = processor.signal_tx.send(DeviceSignal::ConnectionLost {
                            device_id: id.clone(),
                            reason: "link closed by device".to_string(),
                        });
                        return;
                    }
                }
            }
        });

        self.loops
            .lock()
            .await
            .insert(device_id.to_string(), ReceiveLoop { cancel, handle });
    }

    /// Stop a receive loop without emitting a signal.
    pub async fn stop_processing(&self, device_id: &str) -> bool {
        let receive_loop = self.loops.lock().await.remove(device_id);
        match receive_loop {
            Some(receive_loop) => {
                receive_loop.cancel.cancel();
                let _ = receive_loop.handle.await;
                true
            }
            None => false,
        }
    }

    pub async fn stop_all(&self) {
        let loops: Vec<ReceiveLoop> = self.loops.lock().await.drain().map(|(_, l)| l).collect();
        for receive_loop in &loops {
            receive_loop.cancel.cancel();
        }
        for receive_loop in loops {
            let _ = receive_loop.handle.await;
        }
    }

    pub async fn is_processing(&self, device_id: &str) -> bool {
        self.loops
            .lock()
            .await
            .get(device_id)
            .map(|l| !l.handle.is_finished())
            .unwrap_or(false)
    }

    /// Route one inbound frame from `device_id`.
    pub async fn handle_frame(&self, device_id: &str, frame: &str) -> Result<()> {
        let envelope = Envelope::from_json(frame)?;
        match envelope.message_type {
            MessageType::TaskEnd => self.handle_task_end(device_id, envelope).await,
            MessageType::Error => match envelope.session_id {
                Some(session_id) => {
                    let error = envelope
                        .error
                        .unwrap_or_else(|| "device reported an error".to_string());
                    self.orchestrator
                        .fail_task(&session_id, device_id, &error)
                        .await;
                    Ok(())
                }
                None => {
                    warn!(device_id, error = ?envelope.error, "device error without session");
                    Ok(())
                }
            },
            MessageType::Heartbeat => {
                self.heartbeat.record_response(device_id).await;
                Ok(())
            }
            MessageType::DeviceInfoResponse => self.handle_device_info(device_id, envelope).await,
            other => Err(Error::Protocol(format!(
                "unexpected {:?} frame from device {}",
                other, device_id
            ))),
        }
    }

    async fn handle_task_end(&self, device_id: &str, envelope: Envelope) -> Result<()> {
        let session_id = envelope.session_id.ok_or_else(|| {
            Error::Protocol(format!("TASK_END from {} without session_id", device_id))
        })?;
        match envelope.status {
            MessageStatus::Ok => {
                self.orchestrator
                    .complete_task(&session_id, device_id, envelope.result)
                    .await;
            }
            MessageStatus::Error => {
                let error = envelope
                    .error
                    .unwrap_or_else(|| "task failed without an error message".to_string());
                self.orchestrator
                    .fail_task(&session_id, device_id, &error)
                    .await;
            }
            MessageStatus::Continue => {
                debug!(device_id, session_id = %session_id, "task still running");
            }
        }
        Ok(())
    }

    async fn handle_device_info(&self, device_id: &str, envelope: Envelope) -> Result<()> {
        let mut metadata = envelope.metadata.unwrap_or_default();
        let mut capabilities = Vec::new();

        if let Some(Value::Object(info)) = envelope.result {
            for (key, value) in info {
                if key == "capabilities" {
                    capabilities = parse_capabilities(&value);
                } else {
                    metadata.insert(key, value);
                }
            }
        }
        if let Some(value) = metadata.remove("capabilities") {
            capabilities.extend(parse_capabilities(&value));
        }

        self.registry
            .update_device_info(device_id, capabilities, metadata)
            .await
    }
}

fn parse_capabilities(value: &Value) -> Vec<String> {
    value
        .as_array()
        .map(|items| {
            items
                .iter()
                .filter_map(Value::as_str)
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}
