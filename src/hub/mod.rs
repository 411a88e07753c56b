// Notification hub — one bounded push channel per connected client. Sends
// never block: a subscriber that stops draining its buffer is evicted.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::SUBSCRIPTION_BUFFER;

/// Terminal outcome of a download job, pushed as a text frame.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct WsEvent {
    #[serde(rename = "type")]
    pub kind: EventKind,
    pub job_id: String,
    pub model_version_id: i64,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub message: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub path: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EventKind {
    #[serde(rename = "download.completed")]
    Completed,
    #[serde(rename = "download.failed")]
    Failed,
}

impl WsEvent {
    pub fn completed(
        job_id: &str,
        model_version_id: i64,
        message: impl Into<String>,
        path: impl Into<String>,
    ) -> Self {
        Self {
            kind: EventKind::Completed,
            job_id: job_id.to_string(),
            model_version_id,
            message: message.into(),
            path: path.into(),
        }
    }

    pub fn failed(job_id: &str, model_version_id: i64, message: impl Into<String>) -> Self {
        Self {
            kind: EventKind::Failed,
            job_id: job_id.to_string(),
            model_version_id,
            message: message.into(),
            path: String::new(),
        }
    }
}

/// Registered side of one client connection. The hub holds the producer end
/// of the outbound buffer; dropping it closes the buffer, which is naturally
/// idempotent.
struct Subscription {
    conn_id: u64,
    sender: mpsc::Sender<String>,
    transport: CancellationToken,
}

impl Subscription {
    fn close(self) {
        self.transport.cancel();
    }
}

/// Consumer side handed to the websocket tasks (or to tests).
pub struct SubscriptionFeed {
    /// Serialized frames to deliver, in hub send order.
    pub frames: mpsc::Receiver<String>,
    /// Cancelled when the hub detaches this connection.
    pub transport: CancellationToken,
    /// Identifies this connection for `remove_conn`.
    pub conn_id: u64,
}

#[derive(Default)]
pub struct Hub {
    clients: RwLock<HashMap<String, Subscription>>,
    next_conn: AtomicU64,
}

impl Hub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a client, displacing any existing subscription with the same
    /// id. Returns the consumer side of the new subscription.
    pub fn subscribe(&self, client_id: &str) -> SubscriptionFeed {
        let (sender, frames) = mpsc::channel(SUBSCRIPTION_BUFFER);
        let transport = CancellationToken::new();
        let conn_id = self.next_conn.fetch_add(1, Ordering::Relaxed);

        let subscription = Subscription {
            conn_id,
            sender,
            transport: transport.clone(),
        };

        let displaced = {
            let mut clients = self.clients.write();
            let displaced = clients.insert(client_id.to_string(), subscription);
            if displaced.is_some() {
                info!("ws replacing client clientId={}", client_id);
            } else {
                info!(
                    "ws client added clientId={} clients={}",
                    client_id,
                    clients.len()
                );
            }
            displaced
        };
        if let Some(old) = displaced {
            old.close();
        }

        SubscriptionFeed {
            frames,
            transport,
            conn_id,
        }
    }

    /// Detach and close a client's subscription if present.
    pub fn remove(&self, client_id: &str) {
        let removed = {
            let mut clients = self.clients.write();
            let removed = clients.remove(client_id);
            if removed.is_some() {
                info!(
                    "ws client removed clientId={} clients={}",
                    client_id,
                    clients.len()
                );
            }
            removed
        };
        if let Some(sub) = removed {
            sub.close();
        }
    }

    /// Detach a specific connection. A connection that has already been
    /// displaced by a reconnect must not tear down its successor.
    pub fn remove_conn(&self, client_id: &str, conn_id: u64) {
        let current = {
            let clients = self.clients.read();
            clients.get(client_id).map(|sub| sub.conn_id)
        };
        if current == Some(conn_id) {
            self.remove(client_id);
        }
    }

    /// Push an event to one client. Unknown clients are skipped; a client
    /// whose buffer is full is treated as stuck and evicted, dropping the
    /// message.
    pub fn send_to(&self, client_id: &str, event: &WsEvent) {
        let frame = match serde_json::to_string(event) {
            Ok(frame) => frame,
            Err(err) => {
                warn!("ws event serialize failed: {}", err);
                return;
            }
        };

        let delivered = {
            let clients = self.clients.read();
            match clients.get(client_id) {
                None => {
                    debug!("ws send skipped; client missing clientId={}", client_id);
                    return;
                }
                Some(sub) => match sub.sender.try_send(frame) {
                    Ok(()) => true,
                    Err(TrySendError::Full(_)) | Err(TrySendError::Closed(_)) => false,
                },
            }
        };

        if !delivered {
            warn!(
                "ws send queue full; dropping client clientId={}",
                client_id
            );
            self.remove(client_id);
        }
    }

    /// Close every subscription and empty the registry.
    pub fn shutdown(&self) {
        let drained = {
            let mut clients = self.clients.write();
            std::mem::take(&mut *clients)
        };
        let count = drained.len();
        for (_, sub) in drained {
            sub.close();
        }
        info!("ws hub shutdown clients={}", count);
    }

    pub fn client_count(&self) -> usize {
        self.clients.read().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(n: i64) -> WsEvent {
        WsEvent::completed("job", n, "download complete", "/w/models/X")
    }

    #[test]
    fn test_event_wire_format() {
        let frame = serde_json::to_string(&WsEvent::completed("ab12", 123, "download complete", "/w/models/SDXL-1.0")).unwrap();
        assert_eq!(
            frame,
            r#"{"type":"download.completed","jobId":"ab12","modelVersionId":123,"message":"download complete","path":"/w/models/SDXL-1.0"}"#
        );

        let frame = serde_json::to_string(&WsEvent::failed("ab12", 5, "couldn't determine download link")).unwrap();
        assert!(frame.contains(r#""type":"download.failed""#));
        assert!(!frame.contains("path"));
    }

    #[tokio::test]
    async fn test_send_and_receive_in_order() {
        let hub = Hub::new();
        let mut feed = hub.subscribe("c1");

        hub.send_to("c1", &event(1));
        hub.send_to("c1", &event(2));

        let first = feed.frames.recv().await.unwrap();
        let second = feed.frames.recv().await.unwrap();
        assert!(first.contains(r#""modelVersionId":1"#));
        assert!(second.contains(r#""modelVersionId":2"#));
    }

    #[tokio::test]
    async fn test_send_to_missing_client_is_noop() {
        let hub = Hub::new();
        hub.send_to("ghost", &event(1));
        assert_eq!(hub.client_count(), 0);
    }

    #[tokio::test]
    async fn test_slow_client_evicted_when_buffer_fills() {
        let hub = Hub::new();
        let mut feed = hub.subscribe("c1");

        for n in 0..SUBSCRIPTION_BUFFER {
            hub.send_to("c1", &event(n as i64));
        }
        assert_eq!(hub.client_count(), 1);

        // One past capacity: the client is stuck, evict and drop.
        hub.send_to("c1", &event(99));
        assert_eq!(hub.client_count(), 0);
        assert!(feed.transport.is_cancelled());

        // Buffered frames are still readable, then the channel is closed.
        for _ in 0..SUBSCRIPTION_BUFFER {
            assert!(feed.frames.recv().await.is_some());
        }
        assert!(feed.frames.recv().await.is_none());

        // Further sends to the evicted id are no-ops.
        hub.send_to("c1", &event(100));
        assert_eq!(hub.client_count(), 0);
    }

    #[tokio::test]
    async fn test_reconnect_displaces_previous_subscription() {
        let hub = Hub::new();
        let mut old = hub.subscribe("c1");
        let mut new = hub.subscribe("c1");

        assert_eq!(hub.client_count(), 1);
        assert!(old.transport.is_cancelled());
        assert!(old.frames.recv().await.is_none());

        hub.send_to("c1", &event(7));
        assert!(new.frames.recv().await.unwrap().contains(r#""modelVersionId":7"#));

        // The displaced connection's teardown must not remove its successor.
        hub.remove_conn("c1", old.conn_id);
        assert_eq!(hub.client_count(), 1);
        hub.remove_conn("c1", new.conn_id);
        assert_eq!(hub.client_count(), 0);
    }

    #[tokio::test]
    async fn test_shutdown_closes_everything() {
        let hub = Hub::new();
        let mut a = hub.subscribe("a");
        let mut b = hub.subscribe("b");

        hub.shutdown();
        assert_eq!(hub.client_count(), 0);
        assert!(a.frames.recv().await.is_none());
        assert!(b.frames.recv().await.is_none());
        assert!(a.transport.is_cancelled());
        assert!(b.transport.is_cancelled());
    }
}
