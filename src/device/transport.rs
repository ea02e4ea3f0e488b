//! Frame transport to devices.
//!
//! A [`Link`] is a pair of unbounded channels carrying JSON text frames. The
//! outbound sender is the only way to write to a socket, and one writer task
//! drains it, so frames for one device leave in the order they were queued.
//! Dropping every clone of the sender closes the socket.

use crate::error::{Error, Result};
use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, warn};

/// An open connection to one device.
#[derive(Debug)]
pub struct Link {
    pub outbound: mpsc::UnboundedSender<String>,
    pub inbound: mpsc::UnboundedReceiver<String>,
}

/// Opens links to devices.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn open(&self, device_id: &str, url: &str) -> Result<Link>;
}

/// WebSocket connector carrying JSON as text frames.
#[derive(Debug, Default, Clone, Copy)]
pub struct WsConnector;

#[async_trait]
impl Connector for WsConnector {
    async fn open(&self, device_id: &str, url: &str) -> Result<Link> {
        let (socket, _response) = tokio_tungstenite::connect_async(url)
            .await
            .map_err(|e| Error::connection(device_id, e.to_string()))?;
        debug!(device_id, url, "websocket open");

        let (mut sink, mut stream) = socket.split();
        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<String>();
        let (in_tx, in_rx) = mpsc::unbounded_channel::<String>();

        let writer_id = device_id.to_string();
        tokio::spawn(async move {
            while let Some(text) = out_rx.recv().await {
                if let Err(e) = sink.send(Message::Text(text)).await {
                    warn!(device_id = %writer_id, error = %e, "websocket write failed");
                    break;
                }
            }
            // Every sender dropped or the socket failed.
            let _ = sink.close().await;
        });

        let reader_id = device_id.to_string();
        tokio::spawn(async move {
            while let Some(message) = stream.next().await {
                let text = match message {
                    Ok(Message::Text(text)) => text,
                    Ok(Message::Binary(bytes)) => match String::from_utf8(bytes) {
                        Ok(text) => text,
                        Err(_) => {
                            warn!(device_id = %reader_id, "dropping non-UTF-8 binary frame");
                            continue;
                        }
                    },
                    Ok(Message::Close(_)) => break,
                    Ok(_) => continue,
                    Err(e) => {
                        warn!(device_id = %reader_id, error = %e, "websocket read failed");
                        break;
                    }
                };
                if in_tx.send(text).is_err() {
                    break;
                }
            }
            debug!(device_id = %reader_id, "websocket reader finished");
        });

        Ok(Link {
            outbound: out_tx,
            inbound: in_rx,
        })
    }
}

/// The device side of an in-memory link.
#[derive(Debug)]
pub struct Peer {
    pub device_id: String,
    pub url: String,
    /// Frames written by the orchestrator.
    pub from_orchestrator: mpsc::UnboundedReceiver<String>,
    /// Frames to deliver to the orchestrator. Dropping it looks like the
    /// device closing the socket.
    pub to_orchestrator: mpsc::UnboundedSender<String>,
}

/// In-process connector. Every `open` hands the device side of the new
/// link to whoever holds the `Peer` receiver.
#[derive(Debug, Clone)]
pub struct MemoryConnector {
    peers: mpsc::UnboundedSender<Peer>,
}

impl MemoryConnector {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<Peer>) {
        let (peers, rx) = mpsc::unbounded_channel();
        (Self { peers }, rx)
    }
}

#[async_trait]
impl Connector for MemoryConnector {
    async fn open(&self, device_id: &str, url: &str) -> Result<Link> {
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let (in_tx, in_rx) = mpsc::unbounded_channel();
        let peer = Peer {
            device_id: device_id.to_string(),
            url: url.to_string(),
            from_orchestrator: out_rx,
            to_orchestrator: in_tx,
        };
        self.peers
            .send(peer)
            .map_err(|_| Error::connection(device_id, "connection refused"))?;
        Ok(Link {
            outbound: out_tx,
            inbound: in_rx,
        })
    }
}
