use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::anyhow;
use bytes::Bytes;
use rustc_hash::FxHashMap;
use tokio::sync::{mpsc, RwLock};
use uuid::Uuid;

use crate::transport::constants::{ErrorKind, ServerCommand};

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct ClientInfo {
    pub id: Uuid,
    pub remote: SocketAddr,
}

/// Everything a publisher reports back to the embedding application.
///  Implementations only override what they care about.
#[async_trait::async_trait]
pub trait PublisherListener: Sync + Send {
    async fn client_connected(&self, _client: ClientInfo) {}
    async fn client_disconnected(&self, _client: ClientInfo) {}
    async fn client_subscribed(&self, _client: ClientInfo, _signal_count: usize) {}
    async fn client_unsubscribed(&self, _client: ClientInfo) {}
    async fn processing_interval_updated(&self, _client: ClientInfo, _interval_ms: i32) {}
    async fn user_command_received(&self, _client: ClientInfo, _command: ServerCommand, _payload: Bytes) {}
    async fn status_message(&self, _client: Option<ClientInfo>, _message: String) {}
    async fn error_message(&self, _kind: ErrorKind, _client: Option<ClientInfo>, _message: String) {}
}

#[derive(Clone)]
pub(super) enum PublisherEvent {
    ClientConnected(ClientInfo),
    ClientDisconnected(ClientInfo),
    ClientSubscribed(ClientInfo, usize),
    ClientUnsubscribed(ClientInfo),
    ProcessingIntervalUpdated(ClientInfo, i32),
    UserCommand(ClientInfo, ServerCommand, Bytes),
    Status(Option<ClientInfo>, String),
    Error(ErrorKind, Option<ClientInfo>, String),
}

/// Fans events out to registered listeners. Dispatch is strictly sequential:
///  a handler never observes overlapping calls.
pub(super) struct PublisherEventNotifier {
    listeners: RwLock<FxHashMap<Uuid, Arc<dyn PublisherListener>>>,
}

impl PublisherEventNotifier {
    pub fn new() -> PublisherEventNotifier {
        PublisherEventNotifier {
            listeners: Default::default(),
        }
    }

    pub async fn add_listener(&self, listener: Arc<dyn PublisherListener>) -> Uuid {
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

    pub async fn run_loop(&self, mut events: mpsc::Receiver<PublisherEvent>) {
        while let Some(event) = events.recv().await {
            let listeners = self.listeners.read().await.values().cloned().collect::<Vec<_>>();
            for listener in listeners {
                dispatch(&*listener, event.clone()).await;
            }
        }
    }
}

async fn dispatch(listener: &dyn PublisherListener, event: PublisherEvent) {
    match event {
        PublisherEvent::ClientConnected(client) => listener.client_connected(client).await,
        PublisherEvent::ClientDisconnected(client) => listener.client_disconnected(client).await,
        PublisherEvent::ClientSubscribed(client, count) => listener.client_subscribed(client, count).await,
        PublisherEvent::ClientUnsubscribed(client) => listener.client_unsubscribed(client).await,
        PublisherEvent::ProcessingIntervalUpdated(client, interval) => listener.processing_interval_updated(client, interval).await,
        PublisherEvent::UserCommand(client, command, payload) => listener.user_command_received(client, command, payload).await,
        PublisherEvent::Status(client, message) => listener.status_message(client, message).await,
        PublisherEvent::Error(kind, client, message) => listener.error_message(kind, client, message).await,
    }
}
