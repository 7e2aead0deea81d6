//! End to end publisher/subscriber scenarios over real sockets.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::{sleep, timeout};
use tracing::Level;
use uuid::Uuid;

use sttp_transport::metadata::DataSet;
use sttp_transport::publisher::{ClientInfo, Publisher, PublisherConfig, PublisherListener};
use sttp_transport::subscriber::{Subscriber, SubscriberConfig};
use sttp_transport::ticks::Ticks;
use sttp_transport::transport::measurement::Measurement;
use sttp_transport::transport::subscription::{SubscriptionInfo, UdpDataChannel};
use sttp_transport::util::backoff::RetryBackoff;

#[ctor::ctor]
fn init_test_logging() {
    tracing_subscriber::fmt()
        .with_max_level(Level::DEBUG)
        .try_init()
        .ok();
}

const LONG: Duration = Duration::from_secs(15);

async fn within<T>(what: &str, fut: impl std::future::Future<Output = T>) -> T {
    match timeout(LONG, fut).await {
        Ok(value) => value,
        Err(_) => panic!("timed out waiting for {}", what),
    }
}

/// Publisher-side probe reporting subscription and cipher establishment.
struct PublisherProbe {
    subscribed_tx: mpsc::Sender<usize>,
    status_tx: mpsc::Sender<String>,
}

impl PublisherProbe {
    fn new() -> (Arc<PublisherProbe>, mpsc::Receiver<usize>, mpsc::Receiver<String>) {
        let (subscribed_tx, subscribed_rx) = mpsc::channel(16);
        let (status_tx, status_rx) = mpsc::channel(64);
        (Arc::new(PublisherProbe { subscribed_tx, status_tx }), subscribed_rx, status_rx)
    }
}

#[async_trait::async_trait]
impl PublisherListener for PublisherProbe {
    async fn client_subscribed(&self, _client: ClientInfo, signal_count: usize) {
        let _ = self.subscribed_tx.send(signal_count).await;
    }

    async fn status_message(&self, _client: Option<ClientInfo>, message: String) {
        let _ = self.status_tx.send(message).await;
    }
}

struct TestSignals {
    a: Uuid,
    b: Uuid,
    c: Uuid,
}

fn test_signals() -> TestSignals {
    TestSignals {
        a: Uuid::new_v4(),
        b: Uuid::new_v4(),
        c: Uuid::new_v4(),
    }
}

fn test_metadata(signals: &TestSignals) -> DataSet {
    DataSet::with_measurements(&[
        (signals.a, "PPA", 1, "TESTDEVICE:FREQ"),
        (signals.b, "PPA", 2, "TESTDEVICE:VPHM"),
        (signals.c, "PPA", 3, "TESTDEVICE:IPHM"),
    ])
}

async fn start_publisher(signals: &TestSignals) -> (Publisher, SocketAddr, mpsc::Receiver<usize>, mpsc::Receiver<String>) {
    let publisher = Publisher::new(PublisherConfig::default());
    publisher.define_metadata(test_metadata(signals)).await;
    let (probe, subscribed_rx, status_rx) = PublisherProbe::new();
    publisher.add_listener(probe).await;
    let addr = publisher.start("127.0.0.1:0".parse().unwrap()).await.unwrap();
    (publisher, addr, subscribed_rx, status_rx)
}

fn no_reconnect_config() -> SubscriberConfig {
    SubscriberConfig {
        auto_reconnect: false,
        ..Default::default()
    }
}

fn full_precision_subscription(filter: &str) -> SubscriptionInfo {
    SubscriptionInfo {
        use_double_precision: true,
        ..SubscriptionInfo::with_filter(filter)
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn delivers_all_matching_measurements() {
    let signals = test_signals();
    let (publisher, addr, mut subscribed_rx, _status) = start_publisher(&signals).await;

    let subscriber = Subscriber::connect(addr, no_reconnect_config()).await.unwrap();
    let mut reader = subscriber.read_measurements().unwrap();
    subscriber
        .subscribe(full_precision_subscription("FILTER ActiveMeasurements WHERE True"))
        .await
        .unwrap();
    assert_eq!(within("subscription", subscribed_rx.recv()).await, Some(3));

    let t0 = Ticks::now();
    publisher
        .publish(&[
            Measurement::new(signals.a, 60.01, t0),
            Measurement::new(signals.b, 218.07, t0),
            Measurement::new(signals.c, -0.23, t0),
        ])
        .await;

    let mut received = Vec::new();
    for _ in 0..3 {
        received.push(within("measurement", reader.next()).await.unwrap());
    }

    // delivery order across signals is unspecified
    received.sort_by(|x, y| x.value.partial_cmp(&y.value).unwrap());
    assert_eq!(received[0].signal_id, signals.c);
    assert_eq!(received[0].value, -0.23);
    assert_eq!(received[1].signal_id, signals.a);
    assert_eq!(received[1].value, 60.01);
    assert_eq!(received[2].signal_id, signals.b);
    assert_eq!(received[2].value, 218.07);
    for m in &received {
        assert_eq!(m.timestamp, t0);
    }

    assert_eq!(subscriber.total_measurements_received(), 3);

    subscriber.disconnect().await;
    publisher.stop().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn filters_to_the_subscribed_signal_set() {
    let signals = test_signals();
    let (publisher, addr, mut subscribed_rx, _status) = start_publisher(&signals).await;

    let subscriber = Subscriber::connect(addr, no_reconnect_config()).await.unwrap();
    let mut reader = subscriber.read_measurements().unwrap();
    // a bare signal ID list is also a valid filter expression
    subscriber
        .subscribe(full_precision_subscription(&signals.a.to_string()))
        .await
        .unwrap();
    assert_eq!(within("subscription", subscribed_rx.recv()).await, Some(1));

    let t0 = Ticks::now();
    publisher
        .publish(&[
            Measurement::new(signals.a, 1.0, t0),
            Measurement::new(signals.b, 2.0, t0),
        ])
        .await;

    let only = within("measurement", reader.next()).await.unwrap();
    assert_eq!(only.signal_id, signals.a);
    assert_eq!(only.value, 1.0);

    // nothing else may arrive: signal b is outside the subscription
    assert!(timeout(Duration::from_millis(300), reader.next()).await.is_err());

    subscriber.disconnect().await;
    publisher.stop().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn tssc_compressed_stream_is_identical() {
    let signals = test_signals();
    let (publisher, addr, mut subscribed_rx, _status) = start_publisher(&signals).await;

    let config = SubscriberConfig {
        compress_payload_data: true,
        ..no_reconnect_config()
    };
    let subscriber = Subscriber::connect(addr, config).await.unwrap();
    let mut reader = subscriber.read_measurements().unwrap();
    subscriber
        .subscribe(SubscriptionInfo::with_filter(&signals.a.to_string()))
        .await
        .unwrap();
    within("subscription", subscribed_rx.recv()).await;

    let count = 10_000usize;
    let base = Ticks::now();
    let sent: Vec<Measurement> = (0..count)
        .map(|i| {
            Measurement::new(
                signals.a,
                60.0 + (i % 7) as f64 * 0.001,
                Ticks(base.0 + i as u64 * 10 * Ticks::PER_MILLISECOND),
            )
        })
        .collect();

    for chunk in sent.chunks(500) {
        publisher.publish(chunk).await;
    }

    let mut received = Vec::with_capacity(count);
    while received.len() < count {
        received.push(within("compressed measurement", reader.next()).await.unwrap());
    }

    for (r, s) in received.iter().zip(&sent) {
        assert_eq!(r.signal_id, s.signal_id);
        assert_eq!(r.timestamp, s.timestamp);
        assert_eq!(r.flags, s.flags);
        // TSSC carries 32-bit floats
        assert_eq!(r.value, (s.value as f32) as f64);
    }

    subscriber.disconnect().await;
    publisher.stop().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn encrypted_udp_data_channel_with_key_rotation() {
    let signals = test_signals();
    let (publisher, addr, mut subscribed_rx, mut status_rx) = start_publisher(&signals).await;

    let subscriber = Subscriber::connect(addr, no_reconnect_config()).await.unwrap();
    let mut reader = subscriber.read_measurements().unwrap();

    let subscription = SubscriptionInfo {
        udp_data_channel: Some(UdpDataChannel { local_port: 0, interface: None }),
        encrypted: true,
        ..full_precision_subscription(&signals.a.to_string())
    };
    subscriber.subscribe(subscription).await.unwrap();
    within("subscription", subscribed_rx.recv()).await;

    async fn wait_for_cipher(status_rx: &mut mpsc::Receiver<String>) {
        loop {
            match timeout(LONG, status_rx.recv()).await {
                Ok(Some(message)) if message.contains("cipher keys established") => break,
                Ok(Some(_)) => {}
                _ => panic!("cipher keys were never established"),
            }
        }
    }
    wait_for_cipher(&mut status_rx).await;

    let t0 = Ticks::now();
    let first: Vec<Measurement> = (0..100)
        .map(|i| Measurement::new(signals.a, i as f64, Ticks(t0.0 + i as u64)))
        .collect();
    publisher.publish(&first).await;

    // UDP delivery is lossy by contract; on loopback loss is the exception
    let received = within("first encrypted measurement", reader.next()).await.unwrap();
    assert_eq!(received.signal_id, signals.a);
    assert!(first.iter().any(|m| m.value == received.value));

    subscriber.rotate_cipher_keys().await.unwrap();
    wait_for_cipher(&mut status_rx).await;

    let second: Vec<Measurement> = (100..200)
        .map(|i| Measurement::new(signals.a, i as f64, Ticks(t0.0 + i as u64)))
        .collect();
    publisher.publish(&second).await;

    // measurements decrypt under the rotated keys as well
    loop {
        let m = within("post-rotation measurement", reader.next()).await.unwrap();
        if m.value >= 100.0 {
            break;
        }
    }

    subscriber.disconnect().await;
    publisher.stop().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn reader_ends_when_the_connection_dies() {
    let signals = test_signals();
    let (publisher, addr, mut subscribed_rx, _status) = start_publisher(&signals).await;

    let subscriber = Subscriber::connect(addr, no_reconnect_config()).await.unwrap();
    let mut reader = subscriber.read_measurements().unwrap();
    subscriber
        .subscribe(full_precision_subscription("FILTER ActiveMeasurements WHERE True"))
        .await
        .unwrap();
    within("subscription", subscribed_rx.recv()).await;

    publisher.publish(&[Measurement::new(signals.a, 1.0, Ticks::now())]).await;
    within("measurement", reader.next()).await.unwrap();

    publisher.stop().await;

    // without auto reconnect the stream must end
    assert_eq!(within("end of stream", reader.next()).await, None);
}

#[tokio::test(flavor = "multi_thread")]
async fn auto_reconnect_resubscribes_and_resumes() {
    let signals = test_signals();
    let (publisher, addr, mut subscribed_rx, _status) = start_publisher(&signals).await;

    let config = SubscriberConfig {
        auto_reconnect: true,
        reconnect_backoff: RetryBackoff {
            base: Duration::from_millis(100),
            cap: Duration::from_millis(500),
            factor: 2,
            jitter: 0.0,
        },
        ..Default::default()
    };
    let subscriber = Subscriber::connect(addr, config).await.unwrap();
    let mut reader = subscriber.read_measurements().unwrap();
    subscriber
        .subscribe(full_precision_subscription("FILTER ActiveMeasurements WHERE True"))
        .await
        .unwrap();
    within("subscription", subscribed_rx.recv()).await;

    publisher.publish(&[Measurement::new(signals.a, 1.0, Ticks::now())]).await;
    assert_eq!(within("measurement", reader.next()).await.unwrap().value, 1.0);

    publisher.stop().await;
    drop(publisher);

    // a new publisher takes over the same endpoint; rebinding can take a
    //  moment while the old listener goes away
    let replacement = Publisher::new(PublisherConfig::default());
    replacement.define_metadata(test_metadata(&signals)).await;
    let (probe, mut resubscribed_rx, _status2) = PublisherProbe::new();
    replacement.add_listener(probe).await;
    within("rebind", async {
        loop {
            if replacement.start(addr).await.is_ok() {
                break;
            }
            sleep(Duration::from_millis(100)).await;
        }
    })
    .await;

    // the standing subscription is replayed: a fresh signal index cache is
    //  negotiated before any further measurement is yielded
    within("resubscription", resubscribed_rx.recv()).await;

    replacement.publish(&[Measurement::new(signals.a, 2.0, Ticks::now())]).await;
    assert_eq!(within("post-reconnect measurement", reader.next()).await.unwrap().value, 2.0);

    subscriber.disconnect().await;
    replacement.stop().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn oversize_frame_closes_the_connection() {
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    let signals = test_signals();
    let (publisher, addr, _subscribed, _status) = start_publisher(&signals).await;

    let mut rogue = tokio::net::TcpStream::connect(addr).await.unwrap();
    let oversize = PublisherConfig::default().max_packet_size + 1;
    rogue.write_all(&oversize.to_be_bytes()).await.unwrap();
    rogue.write_all(&[0x02u8; 32]).await.unwrap();

    // the publisher must drop the connection; it may send a Failed response
    //  first, so drain until EOF
    within("connection close", async {
        let mut buf = [0u8; 1024];
        loop {
            match rogue.read(&mut buf).await {
                Ok(0) | Err(_) => break,
                Ok(_) => {}
            }
        }
    })
    .await;

    publisher.stop().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn metadata_refresh_round_trips_the_data_set() {
    use sttp_transport::subscriber::SubscriberListener;

    struct MetadataProbe {
        tx: mpsc::Sender<DataSet>,
    }

    #[async_trait::async_trait]
    impl SubscriberListener for MetadataProbe {
        async fn metadata_received(&self, metadata: DataSet) {
            let _ = self.tx.send(metadata).await;
        }
    }

    let signals = test_signals();
    let (publisher, addr, _subscribed, _status) = start_publisher(&signals).await;

    let subscriber = Subscriber::connect(addr, no_reconnect_config()).await.unwrap();
    let (tx, mut metadata_rx) = mpsc::channel(4);
    subscriber.add_listener(Arc::new(MetadataProbe { tx })).await;

    subscriber.request_metadata().await.unwrap();

    let metadata = within("metadata", metadata_rx.recv()).await.unwrap();
    assert_eq!(metadata, test_metadata(&signals));

    subscriber.disconnect().await;
    publisher.stop().await;
}
