use std::net::SocketAddr;

use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc};
use tokio::time::sleep;
use tracing::{debug, info, warn};

use crate::subscriber::connection::{run_session, ConnectionShared, SessionEnd, SubscriberAction};
use crate::subscriber::events::SubscriberEvent;
use crate::transport::constants::ErrorKind;

/// Owns the connect/reconnect cycle: runs one session after another against
///  the publisher, pacing retries with the configured backoff. Ends for good
///  on user disconnect, on a refused connection, or when auto reconnect is
///  off.
pub(super) async fn run_connector(
    server: SocketAddr,
    initial_stream: TcpStream,
    shared: ConnectionShared,
    mut actions: mpsc::Receiver<SubscriberAction>,
    cancel: broadcast::Sender<()>,
) {
    let mut stream = Some(initial_stream);
    let mut attempt: u32 = 0;

    loop {
        let connected = match stream.take() {
            Some(stream) => Some(stream),
            None => match TcpStream::connect(server).await {
                Ok(stream) => Some(stream),
                Err(e) => {
                    debug!(?server, attempt, "connection attempt failed: {}", e);
                    None
                }
            },
        };

        if let Some(stream) = connected {
            attempt = 0;
            let _ = shared.events.send(SubscriberEvent::ConnectionEstablished).await;
            info!(?server, "connected to publisher");

            let mut cancel_rx = cancel.subscribe();
            let end = run_session(stream, &shared, &mut actions, &mut cancel_rx).await;

            let _ = shared.events.send(SubscriberEvent::ConnectionTerminated).await;

            match end {
                Ok(SessionEnd::UserDisconnect) => break,
                Ok(SessionEnd::Refused) => {
                    warn!(?server, "publisher refused the connection, giving up");
                    break;
                }
                Ok(SessionEnd::Lost) => {
                    let _ = shared.events
                        .send(SubscriberEvent::Error(ErrorKind::Transport, "connection to publisher lost".to_string()))
                        .await;
                }
                Err(e) => {
                    let _ = shared.events
                        .send(SubscriberEvent::Error(ErrorKind::Transport, format!("connection to publisher failed: {}", e)))
                        .await;
                }
            }
        }

        if !shared.config.auto_reconnect {
            break;
        }

        let delay = shared.config.reconnect_backoff.delay(attempt);
        attempt = attempt.saturating_add(1);
        debug!(?server, attempt, ?delay, "scheduling reconnect");

        let mut cancel_rx = cancel.subscribe();
        tokio::select! {
            _ = sleep(delay) => {}
            _ = cancel_rx.recv() => break,
            // a disconnect request can arrive while waiting to reconnect
            action = actions.recv() => {
                if matches!(action, Some(SubscriberAction::Disconnect) | None) {
                    break;
                }
            }
        }
    }

    // dropping `shared` closes the measurement stream: the reader observes
    //  the end of the subscription
}
