mod config;
mod connection;
mod events;
mod routing;

pub use config::PublisherConfig;
pub use events::{ClientInfo, PublisherListener};

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::anyhow;
use bytes::Bytes;
use tokio::net::TcpListener;
use tokio::sync::{broadcast, mpsc, RwLock};
use tracing::{error, info};
use uuid::Uuid;

use crate::metadata::{DataSet, DefaultFilterParser, FilterParser};
use crate::publisher::connection::{run_connection, ConnectionContext};
use crate::publisher::events::{PublisherEvent, PublisherEventNotifier};
use crate::publisher::routing::RoutingTable;
use crate::transport::constants::{ServerCommand, ServerResponse};
use crate::transport::measurement::Measurement;

pub(crate) struct MetadataSnapshot {
    pub dataset: DataSet,
    pub digest: [u8; 32],
}

/// The publisher side of an STTP session: accepts subscriber connections,
///  resolves their subscriptions against the offered metadata, and fans
///  published measurement batches out to every connection whose signal set
///  matches.
pub struct Publisher {
    config: Arc<PublisherConfig>,
    metadata: Arc<RwLock<Arc<MetadataSnapshot>>>,
    routing: Arc<RoutingTable>,
    notifier: Arc<PublisherEventNotifier>,
    events: mpsc::Sender<PublisherEvent>,
    filter_parser: Arc<dyn FilterParser>,
    cancel: broadcast::Sender<()>,
    local_addr: RwLock<Option<SocketAddr>>,
}

impl Publisher {
    pub fn new(config: PublisherConfig) -> Publisher {
        Publisher::with_filter_parser(config, Arc::new(DefaultFilterParser))
    }

    /// Embedders with a full filter-expression engine supply it here; the
    ///  transport itself only resolves match-all filters and signal ID lists.
    pub fn with_filter_parser(config: PublisherConfig, filter_parser: Arc<dyn FilterParser>) -> Publisher {
        let (cancel, _) = broadcast::channel(1);
        let (events, events_rx) = mpsc::channel(256);

        let notifier = Arc::new(PublisherEventNotifier::new());
        {
            // callbacks are dispatched strictly sequentially from this task
            let notifier = notifier.clone();
            tokio::spawn(async move { notifier.run_loop(events_rx).await });
        }

        Publisher {
            config: Arc::new(config),
            metadata: Arc::new(RwLock::new(Arc::new(MetadataSnapshot {
                dataset: DataSet::new(),
                digest: DataSet::new().digest(),
            }))),
            routing: Arc::new(RoutingTable::new()),
            notifier,
            events,
            filter_parser,
            cancel,
            local_addr: RwLock::new(None),
        }
    }

    /// Binds the command channel listener and starts accepting subscribers.
    ///  Returns the bound address (useful with port 0).
    pub async fn start(&self, addr: SocketAddr) -> anyhow::Result<SocketAddr> {
        let listener = TcpListener::bind(addr).await?;
        let local_addr = listener.local_addr()?;
        *self.local_addr.write().await = Some(local_addr);

        let ctx = ConnectionContext {
            config: self.config.clone(),
            metadata: self.metadata.clone(),
            filter_parser: self.filter_parser.clone(),
            events: self.events.clone(),
        };
        let routing = self.routing.clone();
        let mut cancel = self.cancel.subscribe();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    accepted = listener.accept() => {
                        match accepted {
                            Ok((stream, remote)) => {
                                let ctx = ctx.clone();
                                let routing = routing.clone();
                                tokio::spawn(async move {
                                    run_connection(stream, remote, ctx, routing).await;
                                });
                            }
                            Err(e) => {
                                error!("accepting a subscriber connection failed: {}", e);
                                break;
                            }
                        }
                    }
                    _ = cancel.recv() => break,
                }
            }
        });

        info!(addr = ?local_addr, "publisher listening");
        Ok(local_addr)
    }

    pub async fn local_addr(&self) -> Option<SocketAddr> {
        *self.local_addr.read().await
    }

    /// Atomically replaces the metadata offered to new and refreshing
    ///  subscribers. In-flight subscriptions keep their prior snapshot;
    ///  subscribed connections are told the configuration changed.
    pub async fn define_metadata(&self, dataset: DataSet) {
        let digest = dataset.digest();
        let changed = {
            let mut metadata = self.metadata.write().await;
            let changed = metadata.digest != digest;
            *metadata = Arc::new(MetadataSnapshot { dataset, digest });
            changed
        };

        if changed {
            self.routing.broadcast_configuration_changed().await;
        }
    }

    /// Submits a batch to all subscribers. Non-blocking: each connection
    ///  buffers behind a bounded queue and persistent stalls close only the
    ///  offending connection.
    pub async fn publish(&self, batch: &[Measurement]) {
        self.routing.publish(batch).await;
    }

    /// Ships an opaque buffer block to every subscriber watching the signal.
    pub async fn publish_buffer_block(&self, signal_id: Uuid, payload: &[u8]) {
        self.routing.publish_buffer_block(signal_id, payload).await;
    }

    /// Sends a notification message that subscribers confirm by token.
    pub async fn notify_subscribers(&self, message: &str) {
        self.routing.notify_all(message).await;
    }

    /// Sends a user-defined response to one client; the code must be in the
    ///  user response range. Returns false when the client is gone.
    pub async fn send_user_response(
        &self,
        client_id: Uuid,
        response: ServerResponse,
        echoed_command: ServerCommand,
        payload: Bytes,
    ) -> anyhow::Result<bool> {
        let code: u8 = response.into();
        if !(0xE0..=0xEF).contains(&code) {
            return Err(anyhow!("{:?} is not a user response", response));
        }
        Ok(self.routing.send_user_response(client_id, response, echoed_command, payload).await)
    }

    pub async fn connection_count(&self) -> usize {
        self.routing.connection_count().await
    }

    pub async fn add_listener(&self, listener: Arc<dyn PublisherListener>) -> Uuid {
        self.notifier.add_listener(listener).await
    }

    pub async fn remove_listener(&self, listener_id: &Uuid) -> anyhow::Result<()> {
        self.notifier.try_remove_listener(listener_id).await
    }

    /// Graceful shutdown: tells every subscriber the publisher is going away,
    ///  then stops the accept loop and all connection workers.
    pub async fn stop(&self) {
        self.routing.close_all("publisher shutting down").await;
        let _ = self.cancel.send(());
    }
}

impl Drop for Publisher {
    fn drop(&mut self) {
        let _ = self.cancel.send(());
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[tokio::test]
    async fn test_start_binds_ephemeral_port() {
        let publisher = Publisher::new(PublisherConfig::default());
        let addr = publisher.start("127.0.0.1:0".parse().unwrap()).await.unwrap();
        assert_ne!(addr.port(), 0);
        assert_eq!(publisher.local_addr().await, Some(addr));
        publisher.stop().await;
    }

    #[tokio::test]
    async fn test_define_metadata_swaps_snapshot() {
        let publisher = Publisher::new(PublisherConfig::default());
        let dataset = DataSet::with_measurements(&[(Uuid::new_v4(), "PPA", 1, "TAG")]);
        publisher.define_metadata(dataset.clone()).await;
        assert_eq!(publisher.metadata.read().await.dataset, dataset);
    }
}
