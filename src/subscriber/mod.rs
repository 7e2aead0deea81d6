mod config;
mod connection;
mod connector;
mod events;
mod reader;

pub use config::SubscriberConfig;
pub use connection::SubscriberStats;
pub use events::SubscriberListener;
pub use reader::MeasurementReader;

use std::net::SocketAddr;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use anyhow::anyhow;
use bytes::Bytes;
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc, Mutex};
use uuid::Uuid;

use crate::subscriber::connection::{ConnectionShared, SubscriberAction};
use crate::subscriber::events::SubscriberEventNotifier;
use crate::transport::constants::ServerCommand;
use crate::transport::subscription::SubscriptionInfo;

/// The subscriber side of an STTP session: connects to a publisher,
///  negotiates operational modes, maintains the signal index cache and
///  exposes received measurements as a lazy single-consumer stream.
///
/// With auto reconnect enabled the subscriber rides over connection loss:
///  the standing subscription is replayed after each reconnect and a fresh
///  signal index cache arrives before any further measurement is yielded.
pub struct Subscriber {
    actions: mpsc::Sender<SubscriberAction>,
    notifier: Arc<SubscriberEventNotifier>,
    reader: std::sync::Mutex<Option<MeasurementReader>>,
    stats: Arc<SubscriberStats>,
    cancel: broadcast::Sender<()>,
}

impl Subscriber {
    /// Connects to a publisher. The returned subscriber is connected and
    ///  mode-negotiated; `subscribe` starts the data flow.
    pub async fn connect(server: SocketAddr, config: SubscriberConfig) -> anyhow::Result<Subscriber> {
        let stream = TcpStream::connect(server).await?;

        let config = Arc::new(config);
        let (actions_tx, actions_rx) = mpsc::channel(16);
        let (events_tx, events_rx) = mpsc::channel(256);
        let (measurements_tx, measurements_rx) = mpsc::channel(config.measurement_queue_capacity);
        let (cancel, _) = broadcast::channel(1);

        let notifier = Arc::new(SubscriberEventNotifier::new());
        {
            // callbacks are dispatched strictly sequentially from this task
            let notifier = notifier.clone();
            tokio::spawn(async move { notifier.run_loop(events_rx).await });
        }

        let stats = Arc::new(SubscriberStats::default());
        let shared = ConnectionShared {
            config,
            events: events_tx,
            measurements: measurements_tx,
            stats: stats.clone(),
            subscription: Mutex::new(None),
        };

        tokio::spawn(connector::run_connector(server, stream, shared, actions_rx, cancel.clone()));

        Ok(Subscriber {
            actions: actions_tx,
            notifier,
            reader: std::sync::Mutex::new(Some(MeasurementReader::new(measurements_rx))),
            stats,
            cancel,
        })
    }

    /// Requests a subscription; the publisher answers with a signal index
    ///  cache update followed by `Succeeded`. The subscription is replayed
    ///  automatically after a reconnect.
    pub async fn subscribe(&self, info: SubscriptionInfo) -> anyhow::Result<()> {
        self.send_action(SubscriberAction::Subscribe(info)).await
    }

    pub async fn unsubscribe(&self) -> anyhow::Result<()> {
        self.send_action(SubscriberAction::Unsubscribe).await
    }

    pub async fn request_metadata(&self) -> anyhow::Result<()> {
        self.send_action(SubscriberAction::MetadataRefresh).await
    }

    pub async fn rotate_cipher_keys(&self) -> anyhow::Result<()> {
        self.send_action(SubscriberAction::RotateCipherKeys).await
    }

    pub async fn set_processing_interval(&self, interval_ms: i32) -> anyhow::Result<()> {
        self.send_action(SubscriberAction::UpdateProcessingInterval(interval_ms)).await
    }

    /// Sends a user-defined command; the code must be in the user command
    ///  range.
    pub async fn send_user_command(&self, command: ServerCommand, payload: Bytes) -> anyhow::Result<()> {
        if !command.is_user_command() {
            return Err(anyhow!("{:?} is not a user command", command));
        }
        self.send_action(SubscriberAction::UserCommand(command, payload)).await
    }

    /// Takes the lazy measurement stream. Single consumer: the first call
    ///  returns the reader, later calls return `None`.
    pub fn read_measurements(&self) -> Option<MeasurementReader> {
        self.reader.lock().expect("reader lock is never poisoned").take()
    }

    pub async fn add_listener(&self, listener: Arc<dyn SubscriberListener>) -> Uuid {
        self.notifier.add_listener(listener).await
    }

    pub async fn remove_listener(&self, listener_id: &Uuid) -> anyhow::Result<()> {
        self.notifier.try_remove_listener(listener_id).await
    }

    pub fn total_command_channel_bytes(&self) -> u64 {
        self.stats.total_command_bytes.load(Ordering::Relaxed)
    }

    pub fn total_data_channel_bytes(&self) -> u64 {
        self.stats.total_data_bytes.load(Ordering::Relaxed)
    }

    pub fn total_measurements_received(&self) -> u64 {
        self.stats.total_measurements.load(Ordering::Relaxed)
    }

    /// Initiates a disconnect; the measurement stream ends once the session
    ///  has shut down.
    pub async fn disconnect(&self) {
        let _ = self.actions.send(SubscriberAction::Disconnect).await;
        let _ = self.cancel.send(());
    }

    async fn send_action(&self, action: SubscriberAction) -> anyhow::Result<()> {
        self.actions
            .send(action)
            .await
            .map_err(|_| anyhow!("subscriber is disconnected"))
    }
}

impl Drop for Subscriber {
    fn drop(&mut self) {
        let _ = self.cancel.send(());
    }
}
