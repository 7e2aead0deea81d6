use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use anyhow::{anyhow, bail};
use bytes::{BufMut, Bytes, BytesMut};
use bytes_varint::try_get_fixed::TryGetFixedSupport;
use crc::Crc;
use rustc_hash::{FxHashMap, FxHashSet};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpStream, UdpSocket};
use tokio::sync::{broadcast, mpsc, Mutex, RwLock};
use tokio::time::{interval, Instant};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::metadata::FilterParser;
use crate::publisher::config::PublisherConfig;
use crate::publisher::events::{ClientInfo, PublisherEvent};
use crate::publisher::MetadataSnapshot;
use crate::transport::cipher::{CipherKeySet, DataCipher};
use crate::transport::compact::{BaseTimes, CompactCodec, MAX_TIME_OFFSET};
use crate::transport::constants::{
    data_packet_flags, operational_modes, ErrorKind, OperationalEncoding, ServerCommand,
    ServerResponse,
};
use crate::transport::frames::{read_frame_body, write_frame, CommandFrame, ResponseFrame};
use crate::transport::measurement::Measurement;
use crate::transport::signal_index_cache::SignalIndexCache;
use crate::transport::subscription::SubscriptionInfo;
use crate::transport::tssc;
use crate::util::buf::encode_str;
use crate::util::compression::gzip_compress;

const NOTIFICATION_CRC: Crc<u32> = Crc::<u32>::new(&crc::CRC_32_ISO_HDLC);

/// Shared publisher-side collaborators handed to every connection.
#[derive(Clone)]
pub(super) struct ConnectionContext {
    pub config: Arc<PublisherConfig>,
    pub metadata: Arc<RwLock<Arc<MetadataSnapshot>>>,
    pub filter_parser: Arc<dyn FilterParser>,
    pub events: mpsc::Sender<PublisherEvent>,
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
enum ConnectionPhase {
    New,
    Moded,
    Subscribed,
    Unsubscribed,
}

/// Everything a subscription mutates over its lifetime. Owned by this
///  connection alone; the reader applies commands, the data pump encodes
///  against it.
struct SubscriptionState {
    phase: ConnectionPhase,
    operational_modes: u32,
    encoding: OperationalEncoding,

    request: SubscriptionInfo,
    codec: CompactCodec,

    caches: [Option<Arc<SignalIndexCache>>; 2],
    active_slot: usize,
    pending_slot: Option<usize>,
    signal_set: Option<Arc<FxHashSet<Uuid>>>,

    base_times: BaseTimes,
    data_start_sent: bool,

    tssc: Option<tssc::Encoder>,

    udp: Option<(Arc<UdpSocket>, SocketAddr)>,
    cipher: Option<(CipherKeySet, Arc<DataCipher>)>,
    pending_cipher: Option<(CipherKeySet, Instant)>,

    processing_interval: i32,
    pending_notifications: FxHashMap<u32, String>,
    buffer_block_sequence: u32,
    pending_buffer_blocks: FxHashSet<u32>,
}

impl SubscriptionState {
    fn new() -> SubscriptionState {
        SubscriptionState {
            phase: ConnectionPhase::New,
            operational_modes: operational_modes::NO_FLAGS,
            encoding: OperationalEncoding::Utf8,
            request: SubscriptionInfo::default(),
            codec: CompactCodec {
                include_time: true,
                use_millisecond_resolution: false,
                use_double_precision: false,
            },
            caches: [None, None],
            active_slot: 0,
            pending_slot: None,
            signal_set: None,
            base_times: BaseTimes::default(),
            data_start_sent: false,
            tssc: None,
            udp: None,
            cipher: None,
            pending_cipher: None,
            processing_interval: -1,
            pending_notifications: FxHashMap::default(),
            buffer_block_sequence: 0,
            pending_buffer_blocks: FxHashSet::default(),
        }
    }

    fn compress_payload(&self) -> bool {
        self.operational_modes & operational_modes::COMPRESS_PAYLOAD_DATA != 0
    }

    fn compress_signal_index_cache(&self) -> bool {
        self.operational_modes & operational_modes::COMPRESS_SIGNAL_INDEX_CACHE != 0
    }

    fn compress_metadata(&self) -> bool {
        self.operational_modes & operational_modes::COMPRESS_METADATA != 0
    }
}

/// One connected subscriber as seen by the routing engine.
pub(super) struct SubscriberConnection {
    client: ClientInfo,
    config: Arc<PublisherConfig>,

    cancel: broadcast::Sender<()>,
    writer_tx: mpsc::Sender<BytesMut>,
    data_tx: mpsc::Sender<Vec<Measurement>>,
    events: mpsc::Sender<PublisherEvent>,

    state: Mutex<SubscriptionState>,
    last_received: Mutex<Instant>,
    last_sent: Mutex<Instant>,
    stall_since: Mutex<Option<Instant>>,

    measurements_sent: AtomicU64,
}

impl SubscriberConnection {
    pub fn client(&self) -> ClientInfo {
        self.client
    }

    /// Routes a published batch into this connection: intersect with the
    ///  subscribed signal set and enqueue for the data pump. Never blocks the
    ///  publisher; a queue that stays full beyond the stall timeout gets the
    ///  connection closed instead.
    pub async fn offer(&self, batch: &[Measurement]) {
        let matching: Vec<Measurement> = {
            let state = self.state.lock().await;
            if state.phase != ConnectionPhase::Subscribed {
                return;
            }
            let Some(signal_set) = &state.signal_set else {
                return;
            };
            batch.iter().filter(|m| signal_set.contains(&m.signal_id)).copied().collect()
        };

        if matching.is_empty() {
            return;
        }

        match self.data_tx.try_send(matching) {
            Ok(()) => {
                *self.stall_since.lock().await = None;
            }
            Err(mpsc::error::TrySendError::Full(_)) => {
                let mut stall = self.stall_since.lock().await;
                let since = stall.get_or_insert_with(Instant::now);
                if since.elapsed() > self.config.stall_timeout {
                    let _ = self.events.try_send(PublisherEvent::Error(
                        ErrorKind::Resource,
                        Some(self.client),
                        format!("subscriber stalled for more than {:?}, closing connection", self.config.stall_timeout),
                    ));
                    self.close("outbound queue stalled").await;
                }
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {}
        }
    }

    /// Queues a notification message; the subscriber confirms it by token.
    pub async fn notify(&self, message: &str) {
        let encoding = {
            let mut state = self.state.lock().await;
            let token = NOTIFICATION_CRC.checksum(message.as_bytes());
            state.pending_notifications.insert(token, message.to_string());
            state.encoding
        };

        let mut payload = BytesMut::new();
        payload.put_u32(NOTIFICATION_CRC.checksum(message.as_bytes()));
        payload.put_slice(&encode_str(message, encoding));
        self.send_response(ResponseFrame::unsolicited(ServerResponse::Notify, payload.freeze())).await;
    }

    /// Ships one raw buffer block if this subscriber watches the signal.
    pub async fn offer_buffer_block(&self, signal_id: Uuid, payload: &[u8]) {
        let frame = {
            let mut state = self.state.lock().await;
            if state.phase != ConnectionPhase::Subscribed {
                return;
            }
            let Some(cache) = &state.caches[state.active_slot] else {
                return;
            };
            let Some(runtime_index) = cache.signal_index(signal_id) else {
                return;
            };

            let sequence = state.buffer_block_sequence;
            state.buffer_block_sequence += 1;
            state.pending_buffer_blocks.insert(sequence);

            let mut body = BytesMut::new();
            body.put_u32(sequence);
            body.put_u8(state.active_slot as u8);
            body.put_u32(runtime_index);
            body.put_slice(payload);
            ResponseFrame::unsolicited(ServerResponse::BufferBlock, body.freeze())
        };
        self.send_response(frame).await;
    }

    /// Sends a user-defined response frame; the application defines its
    ///  meaning.
    pub async fn send_user_response(&self, response: ServerResponse, command: ServerCommand, payload: Bytes) {
        self.send_response(ResponseFrame::new(response, command, payload)).await;
    }

    pub async fn notify_configuration_changed(&self) {
        let subscribed = self.state.lock().await.phase == ConnectionPhase::Subscribed;
        if subscribed {
            self.send_response(ResponseFrame::unsolicited(ServerResponse::ConfigurationChanged, Bytes::new())).await;
        }
    }

    /// Graceful shutdown: best-effort `Failed` with the reason, then cancel
    ///  all of the connection's workers. The echoed command is `NoOp` so
    ///  that peers do not mistake the close for a refused connect.
    pub async fn close(&self, reason: &str) {
        let encoding = self.state.lock().await.encoding;
        let frame = ResponseFrame::new(
            ServerResponse::Failed,
            ServerCommand::NoOp,
            Bytes::from(encode_str(reason, encoding)),
        );
        let mut buf = BytesMut::new();
        frame.ser(&mut buf);
        let _ = self.writer_tx.try_send(buf);
        let _ = self.cancel.send(());
    }

    async fn send_response(&self, frame: ResponseFrame) {
        let mut buf = BytesMut::new();
        frame.ser(&mut buf);
        if self.writer_tx.send(buf).await.is_err() {
            debug!(client = ?self.client.id, "dropping response for closing connection");
        }
    }
}

/// Drives the connection's lifecycle: registers it for routing, spawns the
///  writer, data pump and keepalive workers, then runs the command reader
///  until the connection dies. Returns once everything is shut down.
pub(super) async fn run_connection(
    stream: TcpStream,
    remote: SocketAddr,
    ctx: ConnectionContext,
    routing: Arc<crate::publisher::routing::RoutingTable>,
) {
    let client = ClientInfo { id: Uuid::new_v4(), remote };
    let (read_half, write_half) = stream.into_split();

    let (cancel, _) = broadcast::channel(1);
    let (writer_tx, writer_rx) = mpsc::channel(ctx.config.outbound_queue_capacity);
    let (data_tx, data_rx) = mpsc::channel(ctx.config.batch_queue_capacity);

    let conn = Arc::new(SubscriberConnection {
        client,
        config: ctx.config.clone(),
        cancel: cancel.clone(),
        writer_tx,
        data_tx,
        events: ctx.events.clone(),
        state: Mutex::new(SubscriptionState::new()),
        last_received: Mutex::new(Instant::now()),
        last_sent: Mutex::new(Instant::now()),
        stall_since: Mutex::new(None),
        measurements_sent: AtomicU64::new(0),
    });

    routing.register(conn.clone()).await;
    let _ = ctx.events.send(PublisherEvent::ClientConnected(client)).await;
    info!(client = ?client.id, remote = ?remote, "subscriber connected");

    let writer = tokio::spawn(run_writer(write_half, writer_rx, conn.clone(), cancel.subscribe()));
    let data_pump = tokio::spawn(run_data_pump(conn.clone(), data_rx, cancel.subscribe()));
    let keepalive = tokio::spawn(run_keepalive(conn.clone(), cancel.subscribe()));

    conn
        .run_reader(read_half, &ctx, cancel.subscribe())
        .await;

    let _ = cancel.send(());
    let _ = tokio::join!(writer, data_pump, keepalive);

    routing.remove(client.id).await;
    let _ = ctx.events.send(PublisherEvent::ClientDisconnected(client)).await;
    info!(client = ?client.id, "subscriber disconnected");
}

async fn run_writer(
    mut write_half: OwnedWriteHalf,
    mut writer_rx: mpsc::Receiver<BytesMut>,
    conn: Arc<SubscriberConnection>,
    mut cancel: broadcast::Receiver<()>,
) {
    loop {
        tokio::select! {
            frame = writer_rx.recv() => {
                match frame {
                    Some(frame) => {
                        if let Err(e) = write_frame(&mut write_half, &frame).await {
                            debug!(client = ?conn.client.id, "write failed: {}", e);
                            let _ = conn.cancel.send(());
                            break;
                        }
                        *conn.last_sent.lock().await = Instant::now();
                    }
                    None => break,
                }
            }
            _ = cancel.recv() => break,
        }
    }
}

async fn run_keepalive(conn: Arc<SubscriberConnection>, mut cancel: broadcast::Receiver<()>) {
    let keepalive_timeout = conn.config.keepalive_timeout;
    let mut ticker = interval(keepalive_timeout / 4);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let now = Instant::now();

                if now.duration_since(*conn.last_received.lock().await) > keepalive_timeout {
                    let _ = conn.events.try_send(PublisherEvent::Error(
                        ErrorKind::Transport,
                        Some(conn.client),
                        format!("nothing received for {:?}, closing connection", keepalive_timeout),
                    ));
                    let _ = conn.cancel.send(());
                    break;
                }

                let cipher_expired = {
                    let state = conn.state.lock().await;
                    matches!(&state.pending_cipher, Some((_, deadline)) if now > *deadline)
                };
                if cipher_expired {
                    let _ = conn.events.try_send(PublisherEvent::Error(
                        ErrorKind::Transport,
                        Some(conn.client),
                        "cipher key rotation was not acknowledged in time, closing connection".to_string(),
                    ));
                    conn.close("cipher key rotation not acknowledged").await;
                    break;
                }

                if now.duration_since(*conn.last_sent.lock().await) > keepalive_timeout / 2 {
                    let mut buf = BytesMut::new();
                    ResponseFrame::unsolicited(ServerResponse::NoOp, Bytes::new()).ser(&mut buf);
                    let _ = conn.writer_tx.try_send(buf);
                }
            }
            _ = cancel.recv() => break,
        }
    }
}

/// Drains queued measurement batches, flushing encoded data packets per the
///  publish interval or when a batch has grown large enough.
async fn run_data_pump(
    conn: Arc<SubscriberConnection>,
    mut data_rx: mpsc::Receiver<Vec<Measurement>>,
    mut cancel: broadcast::Receiver<()>,
) {
    let mut pending: Vec<Measurement> = Vec::new();
    let mut ticker = interval(conn.config.publish_interval);

    loop {
        tokio::select! {
            batch = data_rx.recv() => {
                match batch {
                    Some(mut batch) => {
                        pending.append(&mut batch);
                        // a full compact record is at most 19 bytes
                        if pending.len() * 19 >= conn.config.max_batch_bytes {
                            flush_pending(&conn, &mut pending).await;
                        }
                    }
                    None => break,
                }
            }
            _ = ticker.tick() => {
                if !pending.is_empty() {
                    flush_pending(&conn, &mut pending).await;
                }
            }
            _ = cancel.recv() => break,
        }
    }
}

async fn flush_pending(conn: &SubscriberConnection, pending: &mut Vec<Measurement>) {
    if let Err(e) = try_flush_pending(conn, pending).await {
        let _ = conn.events.try_send(PublisherEvent::Error(
            ErrorKind::Codec,
            Some(conn.client),
            format!("failed to encode data packet, closing connection: {}", e),
        ));
        conn.close("data packet encoding failed").await;
    }
    pending.clear();
}

async fn try_flush_pending(conn: &SubscriberConnection, pending: &[Measurement]) -> anyhow::Result<()> {
    let mut state = conn.state.lock().await;

    if state.phase != ConnectionPhase::Subscribed {
        return Ok(());
    }
    if state.pending_slot.is_some() {
        // a cache rotation is waiting for its confirmation; sending packets
        //  encoded against either cache now could desynchronize the stream
        return Ok(());
    }
    let Some(cache) = state.caches[state.active_slot].clone() else {
        return Ok(());
    };
    if state.request.encrypted && state.cipher.is_none() {
        // keys not yet acknowledged: measurements on the data channel are
        //  lossy by contract, so these are simply not sent
        return Ok(());
    }

    if !state.data_start_sent {
        state.data_start_sent = true;
        let start = pending.iter().map(|m| m.timestamp.timestamp_value()).min().unwrap_or(0);
        let mut payload = BytesMut::new();
        payload.put_u64(start);
        send_stream_frame(conn, &state, ResponseFrame::unsolicited(ServerResponse::DataStartTime, payload.freeze()), true).await?;
    }

    if let Some(update) = refresh_base_times(&mut state, pending) {
        send_stream_frame(conn, &state, update, true).await?;
    }

    let chunk_size = conn.config.measurements_per_packet;
    for chunk in pending.chunks(chunk_size) {
        let frame = encode_data_packet(&mut state, chunk, &cache)?;
        send_stream_frame(conn, &state, frame, false).await?;
    }

    conn.measurements_sent.fetch_add(pending.len() as u64, Ordering::Relaxed);
    Ok(())
}

/// Command-channel frames always go through the writer; data packets take
///  the UDP data channel when one was negotiated.
async fn send_stream_frame(
    conn: &SubscriberConnection,
    state: &SubscriptionState,
    frame: ResponseFrame,
    command_channel: bool,
) -> anyhow::Result<()> {
    if !command_channel {
        if let Some((socket, target)) = &state.udp {
            let mut datagram = BytesMut::new();
            frame.ser_body(&mut datagram);
            socket.send_to(&datagram, *target).await?;
            return Ok(());
        }
    }

    let mut buf = BytesMut::new();
    frame.ser(&mut buf);
    conn.writer_tx.send(buf).await.map_err(|_| anyhow!("connection is closing"))?;
    Ok(())
}

/// Keeps the active base timestamp close under the measurements so that the
///  16-bit compact offsets keep fitting. The sibling slot keeps its previous
///  value for records still in flight.
fn refresh_base_times(state: &mut SubscriptionState, pending: &[Measurement]) -> Option<ResponseFrame> {
    if !state.codec.include_time {
        return None;
    }
    let Some(ts) = pending.iter().map(|m| m.timestamp.timestamp_value()).min() else {
        return None;
    };

    let unit = if state.codec.use_millisecond_resolution {
        crate::ticks::Ticks::PER_MILLISECOND
    }
    else {
        1
    };
    let window = MAX_TIME_OFFSET * unit;

    let active = state.base_times.offsets[state.base_times.active_index];
    let rotate = if active == 0 {
        state.base_times.offsets[state.base_times.active_index] = ts;
        true
    }
    else if ts.saturating_sub(active) > window - window / 4 {
        let next = state.base_times.active_index ^ 1;
        state.base_times.offsets[next] = ts;
        state.base_times.active_index = next;
        true
    }
    else {
        false
    };

    rotate.then(|| {
        let mut payload = BytesMut::new();
        state.base_times.ser(&mut payload);
        ResponseFrame::unsolicited(ServerResponse::UpdateBaseTimes, payload.freeze())
    })
}

fn encode_data_packet(
    state: &mut SubscriptionState,
    chunk: &[Measurement],
    cache: &SignalIndexCache,
) -> anyhow::Result<ResponseFrame> {
    let mut flags = data_packet_flags::COMPACT;
    if state.active_slot == 1 {
        flags |= data_packet_flags::CACHE_INDEX;
    }

    let mut body = BytesMut::new();
    body.put_u32(chunk.len() as u32);

    if let Some(tssc) = &mut state.tssc {
        flags |= data_packet_flags::COMPRESSED;
        for m in chunk {
            let index = cache
                .signal_index(m.signal_id)
                .ok_or_else(|| anyhow!("signal {} is not in the active signal index cache", m.signal_id))?;
            tssc.add_measurement(index, m.timestamp, m.flags, m.value as f32);
        }
        body.put_slice(&tssc.finish_block());
    }
    else {
        for m in chunk {
            state.codec.encode(&mut body, m, cache, &state.base_times)?;
        }
    }

    let body = match &state.cipher {
        Some((keys, cipher)) => {
            if keys.active_index == 1 {
                flags |= data_packet_flags::CIPHER_INDEX;
            }
            Bytes::from(cipher.seal(keys.active_index, &body)?)
        }
        None => body.freeze(),
    };

    let mut payload = BytesMut::with_capacity(1 + body.len());
    payload.put_u8(flags);
    payload.put_slice(&body);
    Ok(ResponseFrame::unsolicited(ServerResponse::DataPacket, payload.freeze()))
}

impl SubscriberConnection {
    async fn run_reader(self: &Arc<Self>, mut read_half: OwnedReadHalf, ctx: &ConnectionContext, mut cancel: broadcast::Receiver<()>) {
        loop {
            tokio::select! {
                body = read_frame_body(&mut read_half, self.config.max_packet_size) => {
                    let result = match body {
                        Ok(body) => {
                            *self.last_received.lock().await = Instant::now();
                            match CommandFrame::try_read(body) {
                                Ok(frame) => self.handle_command(frame, ctx).await,
                                Err(e) => Err(e),
                            }
                        }
                        Err(e) => Err(e),
                    };

                    if let Err(e) = result {
                        let _ = ctx.events.try_send(PublisherEvent::Error(
                            ErrorKind::Protocol,
                            Some(self.client),
                            format!("closing connection: {}", e),
                        ));
                        self.close(&format!("{}", e)).await;
                        break;
                    }
                }
                _ = cancel.recv() => break,
            }
        }
    }

    /// Applies one subscriber command. An `Err` is a fatal protocol
    ///  violation; recoverable problems are answered with `Failed` instead.
    async fn handle_command(self: &Arc<Self>, frame: CommandFrame, ctx: &ConnectionContext) -> anyhow::Result<()> {
        debug!(client = ?self.client.id, command = ?frame.command, "received command");

        if frame.command != ServerCommand::DefineOperationalModes
            && frame.command != ServerCommand::NoOp
            && self.state.lock().await.phase == ConnectionPhase::New
        {
            self.send_failed(frame.command, "operational modes must be defined before any other command").await;
            return Ok(());
        }

        match frame.command {
            ServerCommand::DefineOperationalModes => self.handle_define_operational_modes(frame.payload).await,
            ServerCommand::MetadataRefresh => self.handle_metadata_refresh(ctx).await,
            ServerCommand::Subscribe => self.handle_subscribe(frame.payload, ctx).await,
            ServerCommand::Unsubscribe => self.handle_unsubscribe(ctx).await,
            ServerCommand::ConfirmSignalIndexCache => self.handle_confirm_signal_index_cache(ctx).await,
            ServerCommand::RotateCipherKeys => self.handle_rotate_cipher_keys().await,
            ServerCommand::ConfirmUpdateCipherKeys => self.handle_confirm_cipher_keys(ctx).await,
            ServerCommand::UpdateProcessingInterval => self.handle_update_processing_interval(frame.payload, ctx).await,
            ServerCommand::ConfirmNotification => self.handle_confirm_notification(frame.payload).await,
            ServerCommand::ConfirmBufferBlock => self.handle_confirm_buffer_block(frame.payload).await,
            ServerCommand::NoOp => Ok(()),
            ServerCommand::Connect => {
                self.send_failed(ServerCommand::Connect, "unexpected connect command").await;
                Ok(())
            }
            user_command if user_command.is_user_command() => {
                let _ = ctx.events
                    .send(PublisherEvent::UserCommand(self.client, user_command, frame.payload))
                    .await;
                Ok(())
            }
            other => bail!("command {:?} is not valid on a publisher", other),
        }
    }

    async fn handle_define_operational_modes(&self, mut payload: Bytes) -> anyhow::Result<()> {
        let modes = payload.try_get_u32()?;

        let version = modes & operational_modes::VERSION_MASK;
        if version != operational_modes::CURRENT_VERSION {
            self.send_failed(ServerCommand::DefineOperationalModes, &format!("unsupported protocol version {}", version)).await;
            return Ok(());
        }

        let encoding = match OperationalEncoding::try_from(modes & operational_modes::ENCODING_MASK) {
            Ok(encoding) => encoding,
            Err(_) => {
                self.send_failed(ServerCommand::DefineOperationalModes, "unsupported string encoding").await;
                return Ok(());
            }
        };

        let mut state = self.state.lock().await;
        if state.phase != ConnectionPhase::New {
            drop(state);
            self.send_failed(ServerCommand::DefineOperationalModes, "operational modes are immutable once defined").await;
            return Ok(());
        }

        state.operational_modes = modes;
        state.encoding = encoding;
        state.phase = ConnectionPhase::Moded;
        debug!(client = ?self.client.id, modes = format!("{:#010x}", modes), "operational modes defined");
        Ok(())
    }

    async fn handle_metadata_refresh(&self, ctx: &ConnectionContext) -> anyhow::Result<()> {
        let snapshot = ctx.metadata.read().await.clone();
        let (encoding, compress) = {
            let state = self.state.lock().await;
            (state.encoding, state.compress_metadata())
        };

        let mut raw = snapshot.dataset.ser(encoding).to_vec();
        if compress {
            raw = gzip_compress(&raw)?;
        }

        self.send_response(ResponseFrame::new(ServerResponse::Succeeded, ServerCommand::MetadataRefresh, raw)).await;
        let _ = ctx.events
            .send(PublisherEvent::Status(Some(self.client), format!("metadata refreshed, {} tables", snapshot.dataset.tables.len())))
            .await;
        Ok(())
    }

    async fn handle_subscribe(&self, payload: Bytes, ctx: &ConnectionContext) -> anyhow::Result<()> {
        let encoding = self.state.lock().await.encoding;

        let info = match SubscriptionInfo::try_deser_subscribe_payload(payload, encoding) {
            Ok(info) => info,
            Err(e) => {
                self.send_failed(ServerCommand::Subscribe, &format!("malformed subscribe request: {}", e)).await;
                return Ok(());
            }
        };

        let snapshot = ctx.metadata.read().await.clone();
        let signal_ids = match ctx.filter_parser.resolve(&info.filter_expression, &snapshot.dataset) {
            Ok(signal_ids) => signal_ids,
            Err(e) => {
                let _ = ctx.events
                    .send(PublisherEvent::Error(ErrorKind::Subscription, Some(self.client), format!("filter resolution failed: {}", e)))
                    .await;
                self.send_failed(ServerCommand::Subscribe, &format!("invalid filter expression: {}", e)).await;
                return Ok(());
            }
        };

        let keys = snapshot.dataset.measurement_keys();
        let mut cache = SignalIndexCache::new();
        for (index, signal_id) in signal_ids.iter().enumerate() {
            let (source, id) = keys.get(signal_id).cloned().unwrap_or_default();
            cache.add_record(index as u32, *signal_id, &source, id);
        }

        let udp = match &info.udp_data_channel {
            Some(channel) => {
                let bind_addr = if self.client.remote.is_ipv4() { "0.0.0.0:0" } else { "[::]:0" };
                let socket = UdpSocket::bind(bind_addr).await?;
                let target = SocketAddr::new(self.client.remote.ip(), channel.local_port);
                Some((Arc::new(socket), target))
            }
            None => None,
        };

        let (cache_payload, cipher_payload) = {
            let mut state = self.state.lock().await;

            let slot = match state.caches[state.active_slot] {
                Some(_) if state.phase == ConnectionPhase::Subscribed => state.active_slot ^ 1,
                _ => 0,
            };
            state.caches[slot] = Some(Arc::new(cache));
            state.pending_slot = Some(slot);

            state.codec = CompactCodec {
                include_time: info.include_time,
                use_millisecond_resolution: info.use_millisecond_resolution,
                use_double_precision: info.use_double_precision,
            };
            state.base_times = BaseTimes::default();
            state.data_start_sent = false;
            state.udp = udp;

            let cipher_payload = if info.encrypted && state.udp.is_some() {
                let keys = CipherKeySet::generate(0);
                let mut payload = BytesMut::new();
                keys.ser(&mut payload);
                state.pending_cipher = Some((keys, Instant::now() + self.config.cipher_ack_timeout));
                Some(payload.freeze())
            }
            else {
                None
            };

            state.request = info;

            let mut serialized = BytesMut::new();
            state.caches[slot].as_ref().expect("cache was just stored").ser(&mut serialized, state.encoding);
            let serialized = if state.compress_signal_index_cache() {
                gzip_compress(&serialized)?
            }
            else {
                serialized.to_vec()
            };

            let mut payload = BytesMut::with_capacity(1 + serialized.len());
            payload.put_u8(slot as u8);
            payload.put_slice(&serialized);
            (payload.freeze(), cipher_payload)
        };

        self.send_response(ResponseFrame::unsolicited(ServerResponse::UpdateSignalIndexCache, cache_payload)).await;
        if let Some(cipher_payload) = cipher_payload {
            self.send_response(ResponseFrame::unsolicited(ServerResponse::UpdateCipherKeys, cipher_payload)).await;
        }

        let message = format!("{} signals subscribed", signal_ids.len());
        self.send_response(ResponseFrame::new(
            ServerResponse::Succeeded,
            ServerCommand::Subscribe,
            Bytes::from(encode_str(&message, encoding)),
        )).await;

        let _ = ctx.events.send(PublisherEvent::Status(Some(self.client), message)).await;
        Ok(())
    }

    async fn handle_confirm_signal_index_cache(&self, ctx: &ConnectionContext) -> anyhow::Result<()> {
        let signal_count = {
            let mut state = self.state.lock().await;
            let Some(slot) = state.pending_slot.take() else {
                warn!(client = ?self.client.id, "signal index cache confirmation without a pending cache");
                return Ok(());
            };

            state.active_slot = slot;
            let cache = state.caches[slot].as_ref().expect("pending slot always holds a cache").clone();
            state.signal_set = Some(Arc::new(cache.signal_ids()));
            state.phase = ConnectionPhase::Subscribed;

            // a fresh cache always restarts payload compression state
            state.tssc = state.compress_payload().then(tssc::Encoder::new);

            cache.count()
        };

        let _ = ctx.events.send(PublisherEvent::ClientSubscribed(self.client, signal_count)).await;
        Ok(())
    }

    async fn handle_unsubscribe(&self, ctx: &ConnectionContext) -> anyhow::Result<()> {
        let encoding = {
            let mut state = self.state.lock().await;
            state.phase = ConnectionPhase::Unsubscribed;
            state.signal_set = None;
            state.caches = [None, None];
            state.pending_slot = None;
            state.tssc = None;
            state.data_start_sent = false;
            state.encoding
        };

        self.send_response(ResponseFrame::new(
            ServerResponse::Succeeded,
            ServerCommand::Unsubscribe,
            Bytes::from(encode_str("unsubscribed", encoding)),
        )).await;
        let _ = ctx.events.send(PublisherEvent::ClientUnsubscribed(self.client)).await;
        Ok(())
    }

    async fn handle_rotate_cipher_keys(&self) -> anyhow::Result<()> {
        let (payload, encoding) = {
            let mut state = self.state.lock().await;
            if state.udp.is_none() || !state.request.encrypted {
                drop(state);
                self.send_failed(ServerCommand::RotateCipherKeys, "no encrypted data channel to rotate keys for").await;
                return Ok(());
            }

            let keys = match &state.cipher {
                Some((current, _)) => current.rotate(),
                None => CipherKeySet::generate(0),
            };
            let mut payload = BytesMut::new();
            keys.ser(&mut payload);
            state.pending_cipher = Some((keys, Instant::now() + self.config.cipher_ack_timeout));
            (payload.freeze(), state.encoding)
        };

        self.send_response(ResponseFrame::unsolicited(ServerResponse::UpdateCipherKeys, payload)).await;
        self.send_response(ResponseFrame::new(
            ServerResponse::Succeeded,
            ServerCommand::RotateCipherKeys,
            Bytes::from(encode_str("cipher keys rotating", encoding)),
        )).await;
        Ok(())
    }

    async fn handle_confirm_cipher_keys(&self, ctx: &ConnectionContext) -> anyhow::Result<()> {
        let mut state = self.state.lock().await;
        let Some((keys, _)) = state.pending_cipher.take() else {
            warn!(client = ?self.client.id, "cipher key confirmation without a pending rotation");
            return Ok(());
        };

        let cipher = Arc::new(DataCipher::new(&keys));
        state.cipher = Some((keys, cipher));
        drop(state);

        let _ = ctx.events
            .send(PublisherEvent::Status(Some(self.client), "cipher keys established".to_string()))
            .await;
        Ok(())
    }

    async fn handle_update_processing_interval(&self, mut payload: Bytes, ctx: &ConnectionContext) -> anyhow::Result<()> {
        let interval_ms = payload.try_get_u32()? as i32;

        let encoding = {
            let mut state = self.state.lock().await;
            state.processing_interval = interval_ms;
            state.encoding
        };

        self.send_response(ResponseFrame::new(
            ServerResponse::Succeeded,
            ServerCommand::UpdateProcessingInterval,
            Bytes::from(encode_str("processing interval updated", encoding)),
        )).await;
        let _ = ctx.events.send(PublisherEvent::ProcessingIntervalUpdated(self.client, interval_ms)).await;
        Ok(())
    }

    async fn handle_confirm_notification(&self, mut payload: Bytes) -> anyhow::Result<()> {
        let token = payload.try_get_u32()?;
        let mut state = self.state.lock().await;
        if state.pending_notifications.remove(&token).is_none() {
            warn!(client = ?self.client.id, token, "confirmation for an unknown notification");
        }
        Ok(())
    }

    async fn handle_confirm_buffer_block(&self, mut payload: Bytes) -> anyhow::Result<()> {
        let sequence = payload.try_get_u32()?;
        let mut state = self.state.lock().await;
        if !state.pending_buffer_blocks.remove(&sequence) {
            warn!(client = ?self.client.id, sequence, "confirmation for an unknown buffer block");
        }
        Ok(())
    }

    async fn send_failed(&self, command: ServerCommand, reason: &str) {
        let encoding = self.state.lock().await.encoding;
        self.send_response(ResponseFrame::new(
            ServerResponse::Failed,
            command,
            Bytes::from(encode_str(reason, encoding)),
        )).await;
    }
}
