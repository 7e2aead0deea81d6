use std::sync::Arc;

use anyhow::anyhow;
use bytes::Bytes;
use rustc_hash::FxHashMap;
use tokio::sync::{mpsc, RwLock};
use uuid::Uuid;

use crate::metadata::DataSet;
use crate::ticks::Ticks;
use crate::transport::constants::{ErrorKind, ServerResponse};
use crate::transport::signal_index_cache::SignalIndexCache;

/// Everything a subscriber reports back to the embedding application, apart
///  from the measurement stream itself (which flows through the
///  [`MeasurementReader`](crate::subscriber::MeasurementReader)).
///  Implementations only override what they care about.
#[async_trait::async_trait]
pub trait SubscriberListener: Sync + Send {
    async fn connection_established(&self) {}
    async fn connection_terminated(&self) {}
    async fn metadata_received(&self, _metadata: DataSet) {}
    async fn subscription_updated(&self, _cache: Arc<SignalIndexCache>) {}
    async fn data_start_time(&self, _start: Ticks) {}
    async fn configuration_changed(&self) {}
    async fn processing_complete(&self, _message: String) {}
    async fn notification_received(&self, _message: String) {}
    async fn buffer_block_received(&self, _signal_id: Uuid, _payload: Bytes) {}
    async fn user_response_received(&self, _response: ServerResponse, _payload: Bytes) {}
    async fn status_message(&self, _message: String) {}
    async fn error_message(&self, _kind: ErrorKind, _message: String) {}
}

#[derive(Clone)]
pub(super) enum SubscriberEvent {
    ConnectionEstablished,
    ConnectionTerminated,
    MetadataReceived(DataSet),
    SubscriptionUpdated(Arc<SignalIndexCache>),
    DataStartTime(Ticks),
    ConfigurationChanged,
    ProcessingComplete(String),
    NotificationReceived(String),
    BufferBlockReceived(Uuid, Bytes),
    UserResponse(ServerResponse, Bytes),
    Status(String),
    Error(ErrorKind, String),
}

/// Fans events out to registered listeners, strictly sequentially so a
///  handler never observes overlapping calls.
pub(super) struct SubscriberEventNotifier {
    listeners: RwLock<FxHashMap<Uuid, Arc<dyn SubscriberListener>>>,
}

impl SubscriberEventNotifier {
    pub fn new() -> SubscriberEventNotifier {
        SubscriberEventNotifier {
            listeners: Default::default(),
        }
    }

    pub async fn add_listener(&self, listener: Arc<dyn SubscriberListener>) -> Uuid {
        let id = Uuid::new_v4();
        self.listeners.write().await.insert(id, listener);
        id
    }

    pub async fn try_remove_listener(&self, listener_id: &Uuid) -> anyhow::Result<()> {
        match self.listeners.write().await.remove(listener_id) {
            None => Err(anyhow!("tried to remove a listener that was not (no longer?) registered: {}", listener_id)),
            Some(_) => Ok(()),
        }
    }

    pub async fn run_loop(&self, mut events: mpsc::Receiver<SubscriberEvent>) {
        while let Some(event) = events.recv().await {
            let listeners = self.listeners.read().await.values().cloned().collect::<Vec<_>>();
            for listener in listeners {
                dispatch(&*listener, event.clone()).await;
            }
        }
    }
}

async fn dispatch(listener: &dyn SubscriberListener, event: SubscriberEvent) {
    match event {
        SubscriberEvent::ConnectionEstablished => listener.connection_established().await,
        SubscriberEvent::ConnectionTerminated => listener.connection_terminated().await,
        SubscriberEvent::MetadataReceived(metadata) => listener.metadata_received(metadata).await,
        SubscriberEvent::SubscriptionUpdated(cache) => listener.subscription_updated(cache).await,
        SubscriberEvent::DataStartTime(start) => listener.data_start_time(start).await,
        SubscriberEvent::ConfigurationChanged => listener.configuration_changed().await,
        SubscriberEvent::ProcessingComplete(message) => listener.processing_complete(message).await,
        SubscriberEvent::NotificationReceived(message) => listener.notification_received(message).await,
        SubscriberEvent::BufferBlockReceived(signal_id, payload) => listener.buffer_block_received(signal_id, payload).await,
        SubscriberEvent::UserResponse(response, payload) => listener.user_response_received(response, payload).await,
        SubscriberEvent::Status(message) => listener.status_message(message).await,
        SubscriberEvent::Error(kind, message) => listener.error_message(kind, message).await,
    }
}
