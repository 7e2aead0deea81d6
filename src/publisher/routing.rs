use std::sync::Arc;

use bytes::Bytes;
use rustc_hash::FxHashMap;
use tokio::sync::RwLock;
use tracing::trace;
use uuid::Uuid;

use crate::publisher::connection::SubscriberConnection;
use crate::transport::constants::{ServerCommand, ServerResponse};
use crate::transport::measurement::Measurement;

/// The publisher's fan-out table: every live connection, keyed by its client
///  ID. Mutation happens only on connect and disconnect; publishing takes a
///  snapshot under the read lock so that a slow subscriber can never hold up
///  the others.
pub(super) struct RoutingTable {
    connections: RwLock<FxHashMap<Uuid, Arc<SubscriberConnection>>>,
}

impl RoutingTable {
    pub fn new() -> RoutingTable {
        RoutingTable {
            connections: Default::default(),
        }
    }

    pub async fn register(&self, connection: Arc<SubscriberConnection>) {
        self.connections.write().await.insert(connection.client().id, connection);
    }

    pub async fn remove(&self, id: Uuid) {
        self.connections.write().await.remove(&id);
    }

    pub async fn connection_count(&self) -> usize {
        self.connections.read().await.len()
    }

    async fn snapshot(&self) -> Vec<Arc<SubscriberConnection>> {
        self.connections.read().await.values().cloned().collect()
    }

    /// Offers a published batch to every connection; each one intersects the
    ///  batch with its own signal set.
    pub async fn publish(&self, batch: &[Measurement]) {
        let connections = self.snapshot().await;
        trace!(measurements = batch.len(), connections = connections.len(), "routing batch");
        for connection in connections {
            connection.offer(batch).await;
        }
    }

    pub async fn publish_buffer_block(&self, signal_id: Uuid, payload: &[u8]) {
        for connection in self.snapshot().await {
            connection.offer_buffer_block(signal_id, payload).await;
        }
    }

    pub async fn send_user_response(
        &self,
        client_id: Uuid,
        response: ServerResponse,
        command: ServerCommand,
        payload: Bytes,
    ) -> bool {
        match self.connections.read().await.get(&client_id).cloned() {
            Some(connection) => {
                connection.send_user_response(response, command, payload).await;
                true
            }
            None => false,
        }
    }

    pub async fn notify_all(&self, message: &str) {
        for connection in self.snapshot().await {
            connection.notify(message).await;
        }
    }

    pub async fn broadcast_configuration_changed(&self) {
        for connection in self.snapshot().await {
            connection.notify_configuration_changed().await;
        }
    }

    pub async fn close_all(&self, reason: &str) {
        for connection in self.snapshot().await {
            connection.close(reason).await;
        }
    }
}
