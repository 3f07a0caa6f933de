use crate::metrics::Metrics;
use chrono::Utc;
use sotto_proto::ServerEnvelope;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use tokio::sync::RwLock;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Bound on a connection's outbound queue. A recipient that falls this
/// far behind is evicted instead of growing server memory.
pub const OUTBOUND_CAPACITY: usize = 256;

pub struct ConnectionEntry {
    pub sender: mpsc::Sender<ServerEnvelope>,
    pub connection_id: u64,
    pub user_id: Uuid,
    pub device_label: String,
    last_seen: AtomicI64,
}

impl ConnectionEntry {
    pub fn new(
        sender: mpsc::Sender<ServerEnvelope>,
        connection_id: u64,
        user_id: Uuid,
        device_label: String,
    ) -> Self {
        ConnectionEntry {
            sender,
            connection_id,
            user_id,
            device_label,
            last_seen: AtomicI64::new(Utc::now().timestamp()),
        }
    }

    #[cfg(test)]
    pub fn last_seen_at(&self) -> i64 {
        self.last_seen.load(Ordering::SeqCst)
    }
}

/// Registry of live client connections, at most one per user.
///
/// The hub holds the only long-lived sender of each connection's outbound
/// queue; removing an entry closes the queue, which terminates the
/// connection's writer once the queue drains.
pub struct Hub {
    connections: RwLock<HashMap<Uuid, ConnectionEntry>>,
    next_connection: AtomicU64,
    metrics: Arc<Metrics>,
}

impl Hub {
    pub fn new(metrics: Arc<Metrics>) -> Self {
        Hub {
            connections: RwLock::new(HashMap::new()),
            next_connection: AtomicU64::new(1),
            metrics,
        }
    }

    pub fn next_connection_id(&self) -> u64 {
        self.next_connection.fetch_add(1, Ordering::SeqCst)
    }

    /// Inserts a connection, evicting any prior connection of the same
    /// user.
    pub async fn register(&self, entry: ConnectionEntry) {
        let mut connections = self.connections.write().await;
        if let Some(previous) = connections.insert(entry.user_id, entry) {
            info!(
                user = %previous.user_id,
                connection = previous.connection_id,
                device = %previous.device_label,
                "previous connection evicted by re-registration"
            );
        }
    }

    /// Removes a connection, but only the one identified by
    /// `connection_id`. A stale loop that lost its slot to a newer
    /// connection must not tear down its successor.
    pub async fn unregister(&self, user_id: Uuid, connection_id: u64) {
        let mut connections = self.connections.write().await;
        let matches = connections
            .get(&user_id)
            .map(|entry| entry.connection_id == connection_id)
            .unwrap_or(false);
        if matches {
            connections.remove(&user_id);
            debug!(user = %user_id, connection = connection_id, "connection unregistered");
        }
    }

    /// Enqueues an envelope for a recipient without blocking.
    ///
    /// Returns false when the recipient is offline. A full outbound queue
    /// marks the recipient as a slow consumer: the connection is evicted
    /// and false is returned.
    pub async fn send_to(&self, user_id: Uuid, envelope: ServerEnvelope) -> bool {
        let (result, connection_id) = {
            let connections = self.connections.read().await;
            match connections.get(&user_id) {
                Some(entry) => (entry.sender.try_send(envelope), entry.connection_id),
                None => return false,
            }
        };
        match result {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!(user = %user_id, "slow consumer, evicting connection");
                self.metrics.mark_slow_consumer();
                self.unregister(user_id, connection_id).await;
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                self.unregister(user_id, connection_id).await;
                false
            }
        }
    }

    pub async fn is_online(&self, user_id: Uuid) -> bool {
        self.connections.read().await.contains_key(&user_id)
    }

    /// Refreshes a connection's liveness stamp. Called per inbound frame.
    pub async fn touch(&self, user_id: Uuid) {
        let connections = self.connections.read().await;
        if let Some(entry) = connections.get(&user_id) {
            entry
                .last_seen
                .store(Utc::now().timestamp(), Ordering::SeqCst);
        }
    }

    #[cfg(test)]
    pub async fn last_seen_at(&self, user_id: Uuid) -> Option<i64> {
        let connections = self.connections.read().await;
        connections.get(&user_id).map(|entry| entry.last_seen_at())
    }

    pub async fn active_connections(&self) -> usize {
        self.connections.read().await.len()
    }

    /// Drops every connection, closing all outbound queues. Part of
    /// shutdown: writers drain a final notice and terminate, transports
    /// close, readers follow.
    pub async fn close_all(&self) {
        let mut connections = self.connections.write().await;
        for entry in connections.values() {
            let _ = entry.sender.try_send(ServerEnvelope::Notice {
                text: "server shutting down".to_string(),
            });
        }
        let count = connections.len();
        connections.clear();
        if count > 0 {
            info!(connections = count, "hub closed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(
        hub: &Hub,
        user_id: Uuid,
        capacity: usize,
    ) -> (ConnectionEntry, mpsc::Receiver<ServerEnvelope>) {
        let (tx, rx) = mpsc::channel(capacity);
        let entry = ConnectionEntry::new(
            tx,
            hub.next_connection_id(),
            user_id,
            "default".to_string(),
        );
        (entry, rx)
    }

    fn pong() -> ServerEnvelope {
        ServerEnvelope::Pong
    }

    #[tokio::test]
    async fn send_to_absent_user_returns_false() {
        let hub = Hub::new(Arc::new(Metrics::new()));
        assert!(!hub.send_to(Uuid::new_v4(), pong()).await);
    }

    #[tokio::test]
    async fn delivers_in_order() {
        let hub = Hub::new(Arc::new(Metrics::new()));
        let user = Uuid::new_v4();
        let (entry, mut rx) = entry(&hub, user, OUTBOUND_CAPACITY);
        hub.register(entry).await;
        for index in 0..4 {
            assert!(
                hub.send_to(
                    user,
                    ServerEnvelope::Message {
                        from: user,
                        payload: index.to_string(),
                        timestamp: index,
                    },
                )
                .await
            );
        }
        for index in 0..4 {
            match rx.recv().await.unwrap() {
                ServerEnvelope::Message { timestamp, .. } => assert_eq!(timestamp, index),
                other => panic!("unexpected envelope: {:?}", other),
            }
        }
    }

    #[tokio::test]
    async fn re_registration_evicts_prior_connection() {
        let hub = Hub::new(Arc::new(Metrics::new()));
        let user = Uuid::new_v4();
        let (first, mut rx_first) = entry(&hub, user, OUTBOUND_CAPACITY);
        hub.register(first).await;
        let (second, mut rx_second) = entry(&hub, user, OUTBOUND_CAPACITY);
        hub.register(second).await;
        assert_eq!(hub.active_connections().await, 1);
        // The first connection's sender was dropped with its entry, so its
        // queue reports closed once drained.
        assert!(rx_first.recv().await.is_none());
        assert!(hub.send_to(user, pong()).await);
        assert!(rx_second.recv().await.is_some());
    }

    #[tokio::test]
    async fn slow_consumer_is_evicted_at_capacity() {
        let hub = Hub::new(Arc::new(Metrics::new()));
        let user = Uuid::new_v4();
        let (entry, _rx) = entry(&hub, user, OUTBOUND_CAPACITY);
        hub.register(entry).await;
        for _ in 0..OUTBOUND_CAPACITY {
            assert!(hub.send_to(user, pong()).await);
        }
        assert!(!hub.send_to(user, pong()).await);
        assert!(!hub.is_online(user).await);
        assert!(!hub.send_to(user, pong()).await);
    }

    #[tokio::test]
    async fn stale_unregister_does_not_remove_successor() {
        let hub = Hub::new(Arc::new(Metrics::new()));
        let user = Uuid::new_v4();
        let (first, _rx_first) = entry(&hub, user, OUTBOUND_CAPACITY);
        let first_id = first.connection_id;
        hub.register(first).await;
        let (second, _rx_second) = entry(&hub, user, OUTBOUND_CAPACITY);
        hub.register(second).await;
        hub.unregister(user, first_id).await;
        assert!(hub.is_online(user).await);
    }

    #[tokio::test]
    async fn touch_refreshes_last_seen() {
        let hub = Hub::new(Arc::new(Metrics::new()));
        let user = Uuid::new_v4();
        let (entry, _rx) = entry(&hub, user, OUTBOUND_CAPACITY);
        let initial = entry.last_seen_at();
        hub.register(entry).await;
        hub.touch(user).await;
        let refreshed = hub.last_seen_at(user).await.unwrap();
        assert!(refreshed >= initial);
        assert!(hub.last_seen_at(Uuid::new_v4()).await.is_none());
    }

    #[tokio::test]
    async fn close_all_empties_registry() {
        let hub = Hub::new(Arc::new(Metrics::new()));
        let (first, mut rx) = entry(&hub, Uuid::new_v4(), OUTBOUND_CAPACITY);
        let user = first.user_id;
        hub.register(first).await;
        hub.close_all().await;
        assert_eq!(hub.active_connections().await, 0);
        assert!(!hub.is_online(user).await);
        match rx.recv().await.unwrap() {
            ServerEnvelope::Notice { .. } => {}
            other => panic!("unexpected envelope: {:?}", other),
        }
        assert!(rx.recv().await.is_none());
    }
}
