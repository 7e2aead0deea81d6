use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use anyhow::{anyhow, bail};
use bytes::{BufMut, Bytes, BytesMut};
use bytes_varint::try_get_fixed::TryGetFixedSupport;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpStream, UdpSocket};
use tokio::sync::{broadcast, mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{interval, Instant};
use tracing::{debug, warn};

use crate::metadata::DataSet;
use crate::subscriber::config::SubscriberConfig;
use crate::subscriber::events::SubscriberEvent;
use crate::ticks::Ticks;
use crate::transport::cipher::{CipherKeySet, DataCipher};
use crate::transport::compact::{BaseTimes, CompactCodec};
use crate::transport::constants::{
    data_packet_flags, ErrorKind, OperationalEncoding, ServerCommand, ServerResponse,
    UDP_BUFFER_SIZE,
};
use crate::transport::frames::{read_frame_body, write_frame, CommandFrame, ResponseFrame};
use crate::transport::measurement::Measurement;
use crate::transport::signal_index_cache::SignalIndexCache;
use crate::transport::subscription::SubscriptionInfo;
use crate::transport::tssc;
use crate::util::buf::decode_str;
use crate::util::compression::gzip_decompress;

#[derive(Debug, Default)]
pub struct SubscriberStats {
    pub total_command_bytes: AtomicU64,
    pub total_data_bytes: AtomicU64,
    pub total_measurements: AtomicU64,
}

/// State and channels that outlive a single TCP session, shared between the
///  public API and the reconnecting session driver.
pub(super) struct ConnectionShared {
    pub config: Arc<SubscriberConfig>,
    pub events: mpsc::Sender<SubscriberEvent>,
    pub measurements: mpsc::Sender<Measurement>,
    pub stats: Arc<SubscriberStats>,
    /// the active subscription, replayed after a reconnect
    pub subscription: Mutex<Option<SubscriptionInfo>>,
}

/// User-initiated operations, serialized into the session driver.
pub(super) enum SubscriberAction {
    Subscribe(SubscriptionInfo),
    Unsubscribe,
    MetadataRefresh,
    RotateCipherKeys,
    UpdateProcessingInterval(i32),
    UserCommand(ServerCommand, Bytes),
    Disconnect,
}

pub(super) enum SessionEnd {
    /// the user asked to disconnect; no reconnect
    UserDisconnect,
    /// the publisher refused the connection; no reconnect
    Refused,
    /// the session died; reconnect if configured
    Lost,
}

/// Everything one TCP session mutates. Dropped wholesale on disconnect; a
///  reconnect starts from scratch, including a fresh signal index cache.
struct SessionState {
    encoding: OperationalEncoding,

    caches: [Option<Arc<SignalIndexCache>>; 2],
    base_times: BaseTimes,
    codec: CompactCodec,
    tssc: Option<tssc::Decoder>,
    cipher: Option<DataCipher>,

    subscribed: bool,
    udp_task: Option<JoinHandle<()>>,

    /// next buffer block sequence number to surface; later arrivals wait here
    buffer_block_expected: u32,
    buffer_block_cache: Vec<Option<(uuid::Uuid, Bytes)>>,
}

impl SessionState {
    fn new(config: &SubscriberConfig) -> SessionState {
        SessionState {
            encoding: config.encoding,
            caches: [None, None],
            base_times: BaseTimes::default(),
            codec: CompactCodec {
                include_time: true,
                use_millisecond_resolution: false,
                use_double_precision: false,
            },
            tssc: None,
            cipher: None,
            subscribed: false,
            udp_task: None,
            buffer_block_expected: 0,
            buffer_block_cache: Vec::new(),
        }
    }
}

impl Drop for SessionState {
    fn drop(&mut self) {
        if let Some(task) = self.udp_task.take() {
            task.abort();
        }
    }
}

/// Drives one connected session: performs the operational modes handshake,
///  replays any standing subscription, then processes server responses and
///  user actions until the session ends.
pub(super) async fn run_session(
    stream: TcpStream,
    shared: &ConnectionShared,
    actions: &mut mpsc::Receiver<SubscriberAction>,
    cancel: &mut broadcast::Receiver<()>,
) -> anyhow::Result<SessionEnd> {
    let (read_half, mut write_half) = stream.into_split();

    let (frames_tx, mut frames_rx) = mpsc::channel::<anyhow::Result<Bytes>>(64);
    let (datagrams_tx, mut datagrams_rx) = mpsc::channel::<Bytes>(64);

    let reader = tokio::spawn(run_tcp_reader(
        read_half,
        frames_tx,
        shared.config.max_packet_size,
        shared.stats.clone(),
    ));

    let mut state = SessionState::new(&shared.config);

    let session = async {
        // the handshake: operational modes first, then any standing subscription
        let mut modes_payload = BytesMut::new();
        modes_payload.put_u32(shared.config.operational_modes());
        send_command(&mut write_half, ServerCommand::DefineOperationalModes, modes_payload.freeze()).await?;

        if let Some(info) = shared.subscription.lock().await.clone() {
            send_subscribe(&mut write_half, &mut state, shared, &datagrams_tx, info).await?;
        }

        let mut last_sent = Instant::now();
        let mut last_received = Instant::now();
        let keepalive_timeout = shared.config.keepalive_timeout;
        let mut keepalive = interval(keepalive_timeout / 4);

        loop {
            tokio::select! {
                frame = frames_rx.recv() => {
                    match frame {
                        Some(Ok(body)) => {
                            last_received = Instant::now();
                            match ResponseFrame::try_read(body) {
                                Ok(frame) => {
                                    match handle_response(frame, &mut state, shared, &mut write_half).await {
                                        Ok(ResponseOutcome::Continue) => {}
                                        Ok(ResponseOutcome::Refused) => break Ok(SessionEnd::Refused),
                                        Err(e) => break Err(e),
                                    }
                                }
                                Err(e) => break Err(e),
                            }
                        }
                        Some(Err(e)) => break Err(e),
                        None => break Ok(SessionEnd::Lost),
                    }
                }
                datagram = datagrams_rx.recv() => {
                    if let Some(datagram) = datagram {
                        match ResponseFrame::try_read(datagram) {
                            Ok(frame) if frame.response == ServerResponse::DataPacket => {
                                // UDP loss and reordering are tolerated, decode
                                //  failures from stale ciphers are not fatal here
                                if let Err(e) = handle_data_packet(frame.payload, &mut state, shared).await {
                                    debug!("dropping undecodable UDP data packet: {}", e);
                                }
                            }
                            Ok(_) => {}
                            Err(e) => debug!("dropping malformed UDP datagram: {}", e),
                        }
                    }
                }
                action = actions.recv() => {
                    match action {
                        Some(SubscriberAction::Subscribe(info)) => {
                            *shared.subscription.lock().await = Some(info.clone());
                            send_subscribe(&mut write_half, &mut state, shared, &datagrams_tx, info).await?;
                            last_sent = Instant::now();
                        }
                        Some(SubscriberAction::Unsubscribe) => {
                            *shared.subscription.lock().await = None;
                            send_command(&mut write_half, ServerCommand::Unsubscribe, Bytes::new()).await?;
                            last_sent = Instant::now();
                        }
                        Some(SubscriberAction::MetadataRefresh) => {
                            send_command(&mut write_half, ServerCommand::MetadataRefresh, Bytes::new()).await?;
                            last_sent = Instant::now();
                        }
                        Some(SubscriberAction::RotateCipherKeys) => {
                            send_command(&mut write_half, ServerCommand::RotateCipherKeys, Bytes::new()).await?;
                            last_sent = Instant::now();
                        }
                        Some(SubscriberAction::UpdateProcessingInterval(interval_ms)) => {
                            let mut payload = BytesMut::new();
                            payload.put_i32(interval_ms);
                            send_command(&mut write_half, ServerCommand::UpdateProcessingInterval, payload.freeze()).await?;
                            last_sent = Instant::now();
                        }
                        Some(SubscriberAction::UserCommand(command, payload)) => {
                            send_command(&mut write_half, command, payload).await?;
                            last_sent = Instant::now();
                        }
                        Some(SubscriberAction::Disconnect) | None => break Ok(SessionEnd::UserDisconnect),
                    }
                }
                _ = keepalive.tick() => {
                    let now = Instant::now();
                    if now.duration_since(last_received) > keepalive_timeout {
                        break Err(anyhow!("nothing received from publisher for {:?}", keepalive_timeout));
                    }
                    if now.duration_since(last_sent) > keepalive_timeout / 2 {
                        send_command(&mut write_half, ServerCommand::NoOp, Bytes::new()).await?;
                        last_sent = now;
                    }
                }
                _ = cancel.recv() => break Ok(SessionEnd::UserDisconnect),
            }
        }
    };

    let result = session.await;
    reader.abort();
    result
}

async fn run_tcp_reader(
    mut read_half: OwnedReadHalf,
    frames_tx: mpsc::Sender<anyhow::Result<Bytes>>,
    max_packet_size: u32,
    stats: Arc<SubscriberStats>,
) {
    loop {
        match read_frame_body(&mut read_half, max_packet_size).await {
            Ok(body) => {
                stats.total_command_bytes.fetch_add(4 + body.len() as u64, Ordering::Relaxed);
                if frames_tx.send(Ok(body)).await.is_err() {
                    break;
                }
            }
            Err(e) => {
                let _ = frames_tx.send(Err(e)).await;
                break;
            }
        }
    }
}

async fn run_udp_reader(socket: UdpSocket, datagrams_tx: mpsc::Sender<Bytes>, stats: Arc<SubscriberStats>) {
    let mut buf = vec![0u8; UDP_BUFFER_SIZE];
    loop {
        match socket.recv_from(&mut buf).await {
            Ok((len, _from)) => {
                stats.total_data_bytes.fetch_add(len as u64, Ordering::Relaxed);
                if datagrams_tx.send(Bytes::copy_from_slice(&buf[..len])).await.is_err() {
                    break;
                }
            }
            Err(e) => {
                warn!("UDP data channel read failed: {}", e);
                break;
            }
        }
    }
}

async fn send_command(write_half: &mut OwnedWriteHalf, command: ServerCommand, payload: Bytes) -> anyhow::Result<()> {
    let frame = CommandFrame::new(command, payload);
    let mut buf = BytesMut::new();
    frame.ser(&mut buf);
    write_frame(write_half, &buf).await
}

/// Binds the requested UDP data channel (when any), then sends `Subscribe`.
async fn send_subscribe(
    write_half: &mut OwnedWriteHalf,
    state: &mut SessionState,
    shared: &ConnectionShared,
    datagrams_tx: &mpsc::Sender<Bytes>,
    mut info: SubscriptionInfo,
) -> anyhow::Result<()> {
    if let Some(task) = state.udp_task.take() {
        task.abort();
    }

    if let Some(channel) = &mut info.udp_data_channel {
        let interface = channel.interface.as_deref().unwrap_or("0.0.0.0");
        let socket = UdpSocket::bind((interface, channel.local_port)).await?;
        // with port 0 the publisher must be told the actual port
        channel.local_port = socket.local_addr()?.port();
        state.udp_task = Some(tokio::spawn(run_udp_reader(socket, datagrams_tx.clone(), shared.stats.clone())));
    }

    state.codec = CompactCodec {
        include_time: info.include_time,
        use_millisecond_resolution: info.use_millisecond_resolution,
        use_double_precision: info.use_double_precision,
    };

    // note: the connection string carries the rewritten port, but the stored
    //  subscription keeps the requested one so a reconnect binds afresh
    let mut payload = BytesMut::new();
    info.ser_subscribe_payload(&mut payload, state.encoding);

    send_command(write_half, ServerCommand::Subscribe, payload.freeze()).await
}

enum ResponseOutcome {
    Continue,
    Refused,
}

async fn handle_response(
    frame: ResponseFrame,
    state: &mut SessionState,
    shared: &ConnectionShared,
    write_half: &mut OwnedWriteHalf,
) -> anyhow::Result<ResponseOutcome> {
    match frame.response {
        ServerResponse::Succeeded => handle_succeeded(frame.command, frame.payload, state, shared).await?,
        ServerResponse::Failed => {
            if frame.command == ServerCommand::Connect {
                let _ = shared.events
                    .send(SubscriberEvent::Error(ErrorKind::Transport, "connection refused by publisher".to_string()))
                    .await;
                return Ok(ResponseOutcome::Refused);
            }
            let reason = decode_str(&frame.payload, state.encoding).unwrap_or_else(|_| "<undecodable>".to_string());
            let _ = shared.events
                .send(SubscriberEvent::Error(
                    ErrorKind::Subscription,
                    format!("publisher rejected {:?}: {}", frame.command, reason),
                ))
                .await;
        }
        ServerResponse::DataPacket => {
            shared.stats.total_data_bytes.fetch_add(frame.payload.len() as u64, Ordering::Relaxed);
            handle_data_packet(frame.payload, state, shared).await?;
        }
        ServerResponse::UpdateSignalIndexCache => {
            handle_update_signal_index_cache(frame.payload, state, shared).await?;
            send_command(write_half, ServerCommand::ConfirmSignalIndexCache, Bytes::new()).await?;
        }
        ServerResponse::UpdateBaseTimes => {
            state.base_times = BaseTimes::try_deser(frame.payload)?;
            let _ = shared.events
                .send(SubscriberEvent::Status(format!(
                    "received new base time offsets: [{}, {}]",
                    state.base_times.offsets[0], state.base_times.offsets[1]
                )))
                .await;
        }
        ServerResponse::UpdateCipherKeys => {
            let keys = CipherKeySet::try_deser(frame.payload)?;
            state.cipher = Some(DataCipher::new(&keys));
            send_command(write_half, ServerCommand::ConfirmUpdateCipherKeys, Bytes::new()).await?;
            let _ = shared.events
                .send(SubscriberEvent::Status("established new cipher keys for data packet transmissions".to_string()))
                .await;
        }
        ServerResponse::DataStartTime => {
            let mut payload = frame.payload;
            let start = Ticks(payload.try_get_u64()?);
            let _ = shared.events.send(SubscriberEvent::DataStartTime(start)).await;
        }
        ServerResponse::ProcessingComplete => {
            let message = decode_str(&frame.payload, state.encoding).unwrap_or_default();
            let _ = shared.events.send(SubscriberEvent::ProcessingComplete(message)).await;
        }
        ServerResponse::BufferBlock => {
            handle_buffer_block(frame.payload, state, shared, write_half).await?;
        }
        ServerResponse::Notify => {
            let mut payload = frame.payload;
            let token = payload.try_get_u32()?;
            let message = decode_str(&payload, state.encoding).unwrap_or_default();

            let mut confirm = BytesMut::new();
            confirm.put_u32(token);
            send_command(write_half, ServerCommand::ConfirmNotification, confirm.freeze()).await?;

            let _ = shared.events.send(SubscriberEvent::NotificationReceived(message)).await;
        }
        ServerResponse::ConfigurationChanged => {
            let _ = shared.events.send(SubscriberEvent::ConfigurationChanged).await;
            let _ = shared.events
                .send(SubscriberEvent::Status("publisher configuration changed, a metadata refresh may be in order".to_string()))
                .await;
        }
        ServerResponse::NoOp => {}
        user_response => {
            let _ = shared.events
                .send(SubscriberEvent::UserResponse(user_response, frame.payload))
                .await;
        }
    }

    Ok(ResponseOutcome::Continue)
}

async fn handle_succeeded(
    command: ServerCommand,
    payload: Bytes,
    state: &mut SessionState,
    shared: &ConnectionShared,
) -> anyhow::Result<()> {
    match command {
        ServerCommand::MetadataRefresh => {
            let raw = if shared.config.compress_metadata {
                gzip_decompress(&payload)?
            }
            else {
                payload.to_vec()
            };
            let metadata = DataSet::try_deser(&raw[..], state.encoding)?;
            let _ = shared.events.send(SubscriberEvent::MetadataReceived(metadata)).await;
        }
        ServerCommand::Subscribe => {
            state.subscribed = true;
            let message = decode_str(&payload, state.encoding).unwrap_or_default();
            let _ = shared.events.send(SubscriberEvent::Status(format!("subscribe succeeded: {}", message))).await;
        }
        ServerCommand::Unsubscribe => {
            state.subscribed = false;
            let _ = shared.events.send(SubscriberEvent::Status("unsubscribed".to_string())).await;
        }
        ServerCommand::RotateCipherKeys | ServerCommand::UpdateProcessingInterval => {
            let message = decode_str(&payload, state.encoding).unwrap_or_default();
            let _ = shared.events
                .send(SubscriberEvent::Status(format!("{:?} succeeded: {}", command, message)))
                .await;
        }
        other => {
            let _ = shared.events
                .send(SubscriberEvent::Error(
                    ErrorKind::Protocol,
                    format!("success response for an unexpected command: {:?}", other),
                ))
                .await;
        }
    }
    Ok(())
}

async fn handle_update_signal_index_cache(
    payload: Bytes,
    state: &mut SessionState,
    shared: &ConnectionShared,
) -> anyhow::Result<()> {
    let mut payload = payload;
    let slot = payload.try_get_u8()? as usize;
    if slot > 1 {
        bail!("invalid signal index cache slot {}", slot);
    }

    let raw = if shared.config.compress_signal_index_cache {
        gzip_decompress(&payload)?
    }
    else {
        payload.to_vec()
    };

    let cache = Arc::new(SignalIndexCache::try_deser(&raw[..], state.encoding)?);

    // a new cache implicitly resets payload compression state
    state.tssc = shared.config.compress_payload_data.then(|| tssc::Decoder::new(cache.max_signal_index()));
    state.caches[slot] = Some(cache.clone());

    let _ = shared.events.send(SubscriberEvent::SubscriptionUpdated(cache)).await;
    Ok(())
}

async fn handle_data_packet(payload: Bytes, state: &mut SessionState, shared: &ConnectionShared) -> anyhow::Result<()> {
    if !state.subscribed {
        // data racing an unsubscribe; the data channel is lossy by contract
        return Ok(());
    }

    let mut payload = payload;
    let flags = payload.try_get_u8()?;

    if flags & data_packet_flags::COMPACT == 0 && flags & data_packet_flags::COMPRESSED == 0 {
        bail!("data packet is neither compact nor compressed");
    }

    let mut body = match &state.cipher {
        Some(cipher) => {
            let cipher_index = usize::from(flags & data_packet_flags::CIPHER_INDEX != 0);
            Bytes::from(cipher.open(cipher_index, &payload)?)
        }
        None => payload,
    };

    let count = body.try_get_u32()? as usize;
    let slot = usize::from(flags & data_packet_flags::CACHE_INDEX != 0);

    let Some(cache) = state.caches[slot].clone() else {
        // the cache for this slot has not arrived (yet); compact records
        //  cannot be interpreted without it
        warn!(slot, "dropping data packet for an unknown signal index cache");
        return Ok(());
    };

    let mut measurements = Vec::with_capacity(count);

    if flags & data_packet_flags::COMPRESSED != 0 {
        let Some(tssc) = &mut state.tssc else {
            bail!("received a compressed data packet without negotiated payload compression");
        };
        tssc.set_block(&body)?;
        while let Some((index, timestamp, state_flags, value)) = tssc.next_measurement()? {
            let Some(signal_id) = cache.signal_id(index) else {
                continue;
            };
            measurements.push(Measurement {
                signal_id,
                value: value as f64,
                timestamp,
                flags: state_flags,
            });
        }
    }
    else {
        for _ in 0..count {
            if let Some(measurement) = state.codec.decode(&mut body, &cache, &state.base_times)? {
                measurements.push(measurement);
            }
        }
    }

    shared.stats.total_measurements.fetch_add(measurements.len() as u64, Ordering::Relaxed);
    for measurement in measurements {
        // bounded queue: a slow consumer blocks this session, which is the
        //  intended backpressure
        if shared.measurements.send(measurement).await.is_err() {
            break;
        }
    }
    Ok(())
}

async fn handle_buffer_block(
    payload: Bytes,
    state: &mut SessionState,
    shared: &ConnectionShared,
    write_half: &mut OwnedWriteHalf,
) -> anyhow::Result<()> {
    let mut payload = payload;
    let sequence = payload.try_get_u32()?;
    let slot = payload.try_get_u8()? as usize;
    if slot > 1 {
        bail!("invalid signal index cache slot {} in buffer block", slot);
    }
    let runtime_index = payload.try_get_u32()?;

    // an already-surfaced sequence is a retransmission; confirm it again but
    //  do not deliver twice
    let stale = sequence < state.buffer_block_expected;

    let mut confirm = BytesMut::new();
    confirm.put_u32(sequence);
    send_command(write_half, ServerCommand::ConfirmBufferBlock, confirm.freeze()).await?;
    if stale {
        return Ok(());
    }

    let Some(cache) = &state.caches[slot] else {
        return Ok(());
    };
    let Some(signal_id) = cache.signal_id(runtime_index) else {
        return Ok(());
    };

    // surface in sequence order; UDP may deliver blocks out of order
    let offset = (sequence - state.buffer_block_expected) as usize;
    if state.buffer_block_cache.len() <= offset {
        state.buffer_block_cache.resize(offset + 1, None);
    }
    state.buffer_block_cache[offset] = Some((signal_id, payload));

    while let Some(Some(_)) = state.buffer_block_cache.first() {
        let (signal_id, payload) = state.buffer_block_cache.remove(0).expect("checked above");
        state.buffer_block_expected += 1;
        let _ = shared.events
            .send(SubscriberEvent::BufferBlockReceived(signal_id, payload))
            .await;
    }
    Ok(())
}
