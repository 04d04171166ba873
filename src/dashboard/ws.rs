//! WebSocket fan-out for the dashboard.
//!
//! Every frame is an envelope `{"type", "data", "timestamp"}`. Producers
//! call [`ConnectionManager::broadcast`] synchronously; each connected
//! socket runs its own forwarding task and is dropped on the first failed
//! send.

use axum::extract::ws::{Message, WebSocket};
use chrono::Utc;
use serde_json::Value;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::sync::broadcast;

const CHANNEL_CAPACITY: usize = 512;

pub struct ConnectionManager {
    tx: broadcast::Sender<String>,
    connections: AtomicUsize,
}

impl Default for ConnectionManager {
    fn default() -> Self {
        Self::new()
    }
}

impl ConnectionManager {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self {
            tx,
            connections: AtomicUsize::new(0),
        }
    }

    pub fn connection_count(&self) -> usize {
        self.connections.load(Ordering::SeqCst)
    }

    /// Broadcast an event to every connected client. No clients is fine.
    pub fn broadcast(&self, event_type: &str, data: Value) {
        let envelope = serde_json::json!({
            "type": event_type,
            "data": data,
            "timestamp": Utc::now().to_rfc3339(),
        });
        let _ = self.tx.send(envelope.to_string());
    }

    /// Drive one accepted WebSocket until it closes or a send fails.
    pub async fn serve_socket(&self, mut socket: WebSocket) {
        let mut rx = self.tx.subscribe();
        self.connections.fetch_add(1, Ordering::SeqCst);
        tracing::debug!(count = self.connection_count(), "Dashboard client connected");

        loop {
            tokio::select! {
                frame = rx.recv() => {
                    match frame {
                        Ok(text) => {
                            if socket.send(Message::Text(text)).await.is_err() {
                                break;
                            }
                        }
                        // Slow consumer fell behind the ring buffer; skip
                        // the lagged frames and keep streaming.
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            tracing::debug!(skipped, "Dashboard client lagged");
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    }
                }
                incoming = socket.recv() => {
                    match incoming {
                        Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                        // Client chatter (pings, subscription hints) is ignored.
                        Some(Ok(_)) => {}
                    }
                }
            }
        }

        self.connections.fetch_sub(1, Ordering::SeqCst);
        tracing::debug!(count = self.connection_count(), "Dashboard client disconnected");
    }

    /// Subscribe directly to the raw frame stream (used in tests).
    pub fn subscribe(&self) -> broadcast::Receiver<String> {
        self.tx.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_envelope_shape() {
        let manager = ConnectionManager::new();
        let mut rx = manager.subscribe();

        manager.broadcast("task_event", serde_json::json!({"task_id": "t1"}));

        let frame = rx.try_recv().unwrap();
        let value: Value = serde_json::from_str(&frame).unwrap();
        assert_eq!(value["type"], "task_event");
        assert_eq!(value["data"]["task_id"], "t1");
        // Timestamp parses as RFC 3339 UTC.
        let ts = value["timestamp"].as_str().unwrap();
        assert!(chrono::DateTime::parse_from_rfc3339(ts).is_ok());
    }

    #[test]
    fn test_broadcast_without_clients_is_fine() {
        let manager = ConnectionManager::new();
        manager.broadcast("inbox_item", serde_json::json!({}));
        assert_eq!(manager.connection_count(), 0);
    }
}
