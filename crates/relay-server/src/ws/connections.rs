use futures_util::future::join_all;
use relay_protocol::{ConnectionId, ServerMessage};
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::{mpsc, RwLock};

/// Result of one broadcast
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct BroadcastReport {
    pub delivered: usize,
    pub dropped: usize,
}

pub struct ConnectionManager {
    /// Map from connection ID to its outbound frame queue
    senders: RwLock<HashMap<ConnectionId, mpsc::Sender<String>>>,
    /// Longest a broadcast waits on one slow connection
    send_timeout: Duration,
}

impl ConnectionManager {
    pub fn new(send_timeout: Duration) -> Self {
        Self {
            senders: RwLock::new(HashMap::new()),
            send_timeout,
        }
    }

    pub async fn add_connection(&self, connection_id: ConnectionId, sender: mpsc::Sender<String>) {
        self.senders.write().await.insert(connection_id, sender);
        tracing::debug!("Connection {} joined the broadcast set", connection_id);
    }

    pub async fn remove_connection(&self, connection_id: ConnectionId) {
        if self.senders.write().await.remove(&connection_id).is_some() {
            tracing::debug!("Connection {} left the broadcast set", connection_id);
        }
    }

    pub async fn connection_count(&self) -> usize {
        self.senders.read().await.len()
    }

    /// Sends a reply to one connection, waiting for queue space
    pub async fn send_to_connection(&self, connection_id: ConnectionId, message: &ServerMessage) {
        let Some(json) = encode(message) else {
            return;
        };

        let sender = self.senders.read().await.get(&connection_id).cloned();
        if let Some(sender) = sender {
            if let Err(e) = sender.send(json).await {
                tracing::error!("Failed to send message to {}: {}", connection_id, e);
            }
        }
    }

    /// Delivers `message` to every open connection except `exclude`.
    ///
    /// The payload is serialized once. Each target gets `send_timeout` to
    /// accept the frame; closed or slow targets are skipped without
    /// affecting the others.
    pub async fn broadcast(
        &self,
        message: &ServerMessage,
        exclude: Option<ConnectionId>,
    ) -> BroadcastReport {
        let Some(json) = encode(message) else {
            return BroadcastReport::default();
        };

        // Snapshot so the lock is not held while waiting on slow targets
        let targets: Vec<(ConnectionId, mpsc::Sender<String>)> = self
            .senders
            .read()
            .await
            .iter()
            .filter(|(id, sender)| Some(**id) != exclude && !sender.is_closed())
            .map(|(id, sender)| (*id, sender.clone()))
            .collect();

        let deliveries = targets.into_iter().map(|(id, sender)| {
            let json = json.clone();
            async move {
                match sender.send_timeout(json, self.send_timeout).await {
                    Ok(()) => true,
                    Err(e) => {
                        tracing::warn!(
                            "Dropped {} for connection {}: {}",
                            message.event_name(),
                            id,
                            e
                        );
                        false
                    }
                }
            }
        });

        let results = join_all(deliveries).await;
        let delivered = results.iter().filter(|ok| **ok).count();
        let report = BroadcastReport {
            delivered,
            dropped: results.len() - delivered,
        };

        tracing::debug!(
            "Broadcast {} to {} connections ({} dropped)",
            message.event_name(),
            report.delivered,
            report.dropped
        );
        report
    }
}

fn encode(message: &ServerMessage) -> Option<String> {
    match serde_json::to_string(message) {
        Ok(json) => Some(json),
        Err(e) => {
            tracing::error!("Failed to serialize message: {}", e);
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use relay_protocol::{MediaKind, ProducerAnnouncement, ProducerId};

    fn announcement() -> ServerMessage {
        ServerMessage::NewProducer(ProducerAnnouncement {
            id: ProducerId::new(),
            kind: MediaKind::Video,
        })
    }

    #[tokio::test]
    async fn test_broadcast_excludes_originator() {
        let manager = ConnectionManager::new(Duration::from_millis(100));
        let origin = ConnectionId::new();
        let other = ConnectionId::new();
        let (origin_tx, mut origin_rx) = mpsc::channel(4);
        let (other_tx, mut other_rx) = mpsc::channel(4);
        manager.add_connection(origin, origin_tx).await;
        manager.add_connection(other, other_tx).await;

        let message = announcement();
        let report = manager.broadcast(&message, Some(origin)).await;

        assert_eq!(report, BroadcastReport { delivered: 1, dropped: 0 });
        let frame = other_rx.recv().await.unwrap();
        assert_eq!(serde_json::from_str::<ServerMessage>(&frame).unwrap(), message);
        assert!(origin_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_broadcast_skips_closed_connections() {
        let manager = ConnectionManager::new(Duration::from_millis(100));
        let (open_tx, mut open_rx) = mpsc::channel(4);
        let (closed_tx, closed_rx) = mpsc::channel(4);
        manager.add_connection(ConnectionId::new(), open_tx).await;
        manager.add_connection(ConnectionId::new(), closed_tx).await;
        drop(closed_rx);

        let report = manager.broadcast(&announcement(), None).await;

        assert_eq!(report.delivered, 1);
        assert_eq!(report.dropped, 0);
        assert!(open_rx.recv().await.is_some());
    }

    #[tokio::test]
    async fn test_slow_target_is_dropped() {
        let manager = ConnectionManager::new(Duration::from_millis(20));
        let (full_tx, _full_rx) = mpsc::channel(1);
        let (fast_tx, mut fast_rx) = mpsc::channel(4);
        full_tx.send("backlog".to_string()).await.unwrap();
        manager.add_connection(ConnectionId::new(), full_tx).await;
        manager.add_connection(ConnectionId::new(), fast_tx).await;

        let report = manager.broadcast(&announcement(), None).await;

        assert_eq!(report, BroadcastReport { delivered: 1, dropped: 1 });
        assert!(fast_rx.recv().await.is_some());
    }

    #[tokio::test]
    async fn test_removed_connection_gets_nothing() {
        let manager = ConnectionManager::new(Duration::from_millis(100));
        let id = ConnectionId::new();
        let (tx, mut rx) = mpsc::channel(4);
        manager.add_connection(id, tx).await;
        manager.remove_connection(id).await;

        assert_eq!(manager.connection_count().await, 0);
        assert_eq!(manager.broadcast(&announcement(), None).await.delivered, 0);
        manager.send_to_connection(id, &ServerMessage::error("gone")).await;
        assert!(rx.try_recv().is_err());
    }
}
