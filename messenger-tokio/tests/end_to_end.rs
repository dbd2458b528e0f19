use std::collections::BTreeSet;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use bytes::{BufMut, BytesMut};
use messenger_core::protocol::{encode_identity, encode_message, ClientIdentity};
use messenger_tokio::{
    BackoffPolicy, ClientConfig, ConnectionState, EventKind, EventSink, HandlerError, Message,
    MessengerClient, MessengerServer, OutgoingPolicy, ServerConfig, SubscriptionPattern,
};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::{sleep, timeout, Duration};

const WAIT: Duration = Duration::from_secs(5);

#[derive(Debug, Default)]
struct RecordingSink {
    events: Mutex<Vec<(EventKind, String, String)>>,
}

impl RecordingSink {
    fn has(&self, kind: EventKind, name: &str, detail: &str) -> bool {
        self.events
            .lock()
            .unwrap()
            .iter()
            .any(|(k, n, d)| *k == kind && n == name && d == detail)
    }

    fn has_kind(&self, kind: EventKind, name: &str) -> bool {
        self.events
            .lock()
            .unwrap()
            .iter()
            .any(|(k, n, _)| *k == kind && n == name)
    }
}

impl EventSink for RecordingSink {
    fn log_event(&self, kind: EventKind, name: &str, detail: &str) {
        self.events
            .lock()
            .unwrap()
            .push((kind, name.to_owned(), detail.to_owned()));
    }

    fn log_message(&self, _message: &Message) {}
}

fn local_config() -> ServerConfig {
    ServerConfig {
        bind_addr: SocketAddr::from(([127, 0, 0, 1], 0)),
        ..ServerConfig::default()
    }
}

async fn start_server(
    config: ServerConfig,
    sink: Arc<RecordingSink>,
) -> (Arc<MessengerServer>, SocketAddr) {
    let server = Arc::new(MessengerServer::bind_with_sink(config, sink).await.unwrap());
    let addr = server.local_addr().unwrap();
    let running = server.clone();
    tokio::spawn(async move {
        let _ = running.run().await;
    });
    (server, addr)
}

fn client_config(addr: SocketAddr, name: &str) -> ClientConfig {
    ClientConfig::new(addr.ip().to_string(), addr.port(), name).with_backoff(BackoffPolicy {
        base: Duration::from_millis(20),
        max: Duration::from_millis(100),
    })
}

async fn connected_client(addr: SocketAddr, name: &str) -> MessengerClient {
    let client = MessengerClient::start(client_config(addr, name)).unwrap();
    timeout(WAIT, client.wait_for_state(ConnectionState::Connected))
        .await
        .expect("client did not connect")
        .unwrap();
    client
}

fn recorder(
    received: &Arc<Mutex<Vec<Message>>>,
) -> impl FnMut(&Message) -> Result<(), HandlerError> + Send + 'static {
    let received = received.clone();
    move |message: &Message| {
        received.lock().unwrap().push(message.clone());
        Ok(())
    }
}

async fn eventually<F, Fut>(what: &str, mut check: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + WAIT;
    while tokio::time::Instant::now() < deadline {
        if check().await {
            return;
        }
        sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for {}", what);
}

async fn patterns_of(server: &MessengerServer, name: &str) -> Option<BTreeSet<SubscriptionPattern>> {
    let broker = server.broker().lock().await;
    let id = *broker.find_by_name(name).first()?;
    broker.patterns(id).cloned()
}

fn patterns(texts: &[&str]) -> BTreeSet<SubscriptionPattern> {
    texts
        .iter()
        .map(|text| SubscriptionPattern::parse(text).unwrap())
        .collect()
}

#[tokio::test]
async fn test_publish_reaches_only_matching_subscriber() {
    let sink = Arc::new(RecordingSink::default());
    let (server, addr) = start_server(local_config(), sink).await;
    let server = &*server;

    let sensors_received = Arc::new(Mutex::new(Vec::new()));
    let other_received = Arc::new(Mutex::new(Vec::new()));

    let mut sensors = connected_client(addr, "sensors").await;
    sensors.listen("Sensor/*", recorder(&sensors_received)).unwrap();
    let mut other = connected_client(addr, "other").await;
    other.listen("Other", recorder(&other_received)).unwrap();
    let publisher = connected_client(addr, "publisher").await;

    eventually("subscriptions", || async move {
        server.broker().lock().await.topics().subscription_count() == 2
    })
    .await;

    publisher.publish("Sensor/X", vec![0x01u8, 0x02]).unwrap();

    let count = timeout(WAIT, sensors.wait_for_messages())
        .await
        .expect("no message for Sensor/*")
        .unwrap();
    assert_eq!(count, 1);
    {
        let received = sensors_received.lock().unwrap();
        assert_eq!(received[0].msg_type(), "Sensor/X");
        assert_eq!(received[0].payload().as_ref(), &[0x01u8, 0x02]);
    }

    sleep(Duration::from_millis(200)).await;
    assert_eq!(other.read_messages(), 0);
    assert!(other_received.lock().unwrap().is_empty());

    publisher.shutdown().await.unwrap();
    sensors.shutdown().await.unwrap();
    other.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_overlapping_patterns_deliver_once_including_to_publisher() {
    let sink = Arc::new(RecordingSink::default());
    let (server, addr) = start_server(local_config(), sink).await;
    let server = &*server;

    let exact = Arc::new(Mutex::new(Vec::new()));
    let prefix = Arc::new(Mutex::new(Vec::new()));
    let mut client = connected_client(addr, "echo").await;
    client.listen("Test", recorder(&exact)).unwrap();
    client.listen("Te*", recorder(&prefix)).unwrap();

    eventually("subscriptions", || async move {
        patterns_of(server, "echo").await == Some(patterns(&["Test", "Te*"]))
    })
    .await;

    client.publish("Test", &b"once"[..]).unwrap();
    timeout(WAIT, client.wait_for_messages())
        .await
        .expect("publisher did not receive its own message")
        .unwrap();
    sleep(Duration::from_millis(200)).await;
    assert_eq!(client.read_messages(), 0, "delivered more than once");

    // one message, both handlers ran on it
    assert_eq!(exact.lock().unwrap().len(), 1);
    assert_eq!(prefix.lock().unwrap().len(), 1);

    client.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_subscriptions_are_replayed_after_reconnect() {
    let sink = Arc::new(RecordingSink::default());
    let (server, addr) = start_server(local_config(), sink).await;
    let server = &*server;

    let mut client = connected_client(addr, "replay").await;
    client.listen("A", |_message: &Message| Ok(())).unwrap();
    client.listen("B*", |_message: &Message| Ok(())).unwrap();

    eventually("initial subscriptions", || async move {
        patterns_of(server, "replay").await == Some(patterns(&["A", "B*"]))
    })
    .await;

    let first_id = server.broker().lock().await.find_by_name("replay")[0];
    assert!(server.close_connection(first_id));

    eventually("replayed subscriptions on a new connection", || async move {
        let broker = server.broker().lock().await;
        let ids = broker.find_by_name("replay");
        ids.len() == 1
            && ids[0] != first_id
            && broker.patterns(ids[0]) == Some(&patterns(&["A", "B*"]))
    })
    .await;
    client.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_unlisten_removes_subscription() {
    let sink = Arc::new(RecordingSink::default());
    let (server, addr) = start_server(local_config(), sink.clone()).await;
    let server = &*server;

    let mut client = connected_client(addr, "fickle").await;
    client.listen("News/*", |_message: &Message| Ok(())).unwrap();
    eventually("listen", || async move {
        patterns_of(server, "fickle").await == Some(patterns(&["News/*"]))
    })
    .await;

    client.unlisten("News/*").unwrap();
    eventually("unlisten", || async move {
        patterns_of(server, "fickle").await == Some(BTreeSet::new())
    })
    .await;
    assert!(server.broker().lock().await.topics().is_empty());
    assert!(sink.has(EventKind::Unlisten, "fickle", "News/*"));

    client.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_heartbeats_are_not_delivered() {
    let sink = Arc::new(RecordingSink::default());
    let (server, addr) = start_server(local_config(), sink).await;
    let server = &*server;

    let received = Arc::new(Mutex::new(Vec::new()));
    let config = client_config(addr, "everything").with_heartbeat_interval(Duration::from_millis(20));
    let mut client = MessengerClient::start(config).unwrap();
    client.listen("*", recorder(&received)).unwrap();
    timeout(WAIT, client.wait_for_state(ConnectionState::Connected))
        .await
        .unwrap()
        .unwrap();
    eventually("catch-all subscription", || async move {
        patterns_of(server, "everything").await == Some(patterns(&["*"]))
    })
    .await;

    sleep(Duration::from_millis(200)).await;
    assert_eq!(client.read_messages(), 0);
    assert!(received.lock().unwrap().is_empty());

    client.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_graceful_shutdown_is_reported() {
    let sink = Arc::new(RecordingSink::default());
    let (server, addr) = start_server(local_config(), sink.clone()).await;
    let server = &*server;

    let client = connected_client(addr, "polite").await;
    eventually("registration", || async move { server.connection_count() == 1 }).await;
    assert!(sink.has_kind(EventKind::Connect, "polite"));

    client.shutdown().await.unwrap();
    eventually("graceful removal", || async move { server.connection_count() == 0 }).await;
    assert!(sink.has(EventKind::Disconnect, "polite", "graceful"));
}

#[tokio::test]
async fn test_message_frame_before_identity_is_rejected() {
    let sink = Arc::new(RecordingSink::default());
    let (server, addr) = start_server(local_config(), sink).await;
    let server = &*server;

    // A heartbeat where the identity should be: the name is reserved.
    let mut socket = TcpStream::connect(addr).await.unwrap();
    let mut frame = BytesMut::new();
    encode_message(&Message::heartbeat(), &mut frame);
    socket.write_all(&frame).await.unwrap();
    let mut buf = [0u8; 16];
    let n = timeout(WAIT, socket.read(&mut buf)).await.unwrap().unwrap_or(0);
    assert_eq!(n, 0, "server should close the socket");
    assert_eq!(server.broker().lock().await.connection_count(), 0);

    // A user message where the identity should be: the type parses as a name,
    // then the payload length reads as an empty type.
    let mut socket = TcpStream::connect(addr).await.unwrap();
    let mut frame = BytesMut::new();
    encode_message(&Message::user("Sensor/X", vec![0x01u8, 0x02]).unwrap(), &mut frame);
    socket.write_all(&frame).await.unwrap();
    let n = timeout(WAIT, socket.read(&mut buf)).await.unwrap().unwrap_or(0);
    assert_eq!(n, 0, "server should close the socket");

    eventually("cleanup", || async move {
        let broker = server.broker().lock().await;
        broker.connection_count() == 0 && broker.topics().is_empty()
    })
    .await;
}

#[tokio::test]
async fn test_silent_connection_is_dropped_by_liveness_sweep() {
    let sink = Arc::new(RecordingSink::default());
    let config =
        local_config().with_liveness_timeout(Duration::from_millis(200), Duration::from_millis(50));
    let (server, addr) = start_server(config, sink.clone()).await;
    let server = &*server;

    let mut socket = TcpStream::connect(addr).await.unwrap();
    let mut frame = BytesMut::new();
    encode_identity(&ClientIdentity::new("mute").unwrap(), &mut frame);
    socket.write_all(&frame).await.unwrap();
    eventually("registration", || async move { server.connection_count() == 1 }).await;

    let mut buf = [0u8; 16];
    let n = timeout(WAIT, socket.read(&mut buf)).await.unwrap().unwrap_or(0);
    assert_eq!(n, 0);
    eventually("removal", || async move { server.connection_count() == 0 }).await;
    assert!(sink.has(EventKind::Disconnect, "mute", "liveness timeout"));

    // A client that heartbeats stays connected
    let config = client_config(addr, "lively").with_heartbeat_interval(Duration::from_millis(30));
    let client = MessengerClient::start(config).unwrap();
    timeout(WAIT, client.wait_for_state(ConnectionState::Connected))
        .await
        .unwrap()
        .unwrap();
    sleep(Duration::from_millis(500)).await;
    assert!(client.is_connected());
    assert_eq!(server.connection_count(), 1);
    client.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_buffered_publishes_are_sent_after_connect() {
    let port = {
        let probe = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        probe.local_addr().unwrap().port()
    };
    let addr = SocketAddr::from(([127, 0, 0, 1], port));

    let received = Arc::new(Mutex::new(Vec::new()));
    let config = client_config(addr, "patient").with_outgoing(OutgoingPolicy::Buffer { capacity: 2 });
    let mut client = MessengerClient::start(config).unwrap();
    client.listen("Queue", recorder(&received)).unwrap();
    for n in 1u8..=3 {
        client.publish("Queue", vec![n]).unwrap();
    }
    sleep(Duration::from_millis(50)).await;
    assert!(!client.is_connected());

    let sink = Arc::new(RecordingSink::default());
    let (_server, _) = start_server(
        ServerConfig {
            bind_addr: addr,
            ..ServerConfig::default()
        },
        sink,
    )
    .await;

    eventually("both buffered messages", || {
        client.read_messages();
        let done = received.lock().unwrap().len() == 2;
        async move { done }
    })
    .await;
    let payloads: Vec<u8> = received
        .lock()
        .unwrap()
        .iter()
        .map(|message| message.payload()[0])
        .collect();
    assert_eq!(payloads, vec![2, 3], "oldest message is evicted");

    client.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_dropped_publishes_while_disconnected() {
    let port = {
        let probe = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        probe.local_addr().unwrap().port()
    };
    let addr = SocketAddr::from(([127, 0, 0, 1], port));

    let received = Arc::new(Mutex::new(Vec::new()));
    let mut client = MessengerClient::start(client_config(addr, "lossy")).unwrap();
    client.listen("Queue", recorder(&received)).unwrap();
    client.publish("Queue", vec![1u8]).unwrap();
    sleep(Duration::from_millis(50)).await;

    let sink = Arc::new(RecordingSink::default());
    let (server_arc, _) = start_server(
        ServerConfig {
            bind_addr: addr,
            ..ServerConfig::default()
        },
        sink,
    )
    .await;
    let server = &*server_arc;
    timeout(WAIT, client.wait_for_state(ConnectionState::Connected))
        .await
        .unwrap()
        .unwrap();
    eventually("replayed subscription", || async move {
        patterns_of(server, "lossy").await == Some(patterns(&["Queue"]))
    })
    .await;

    client.publish("Queue", vec![2u8]).unwrap();
    timeout(WAIT, client.wait_for_messages()).await.unwrap().unwrap();
    sleep(Duration::from_millis(100)).await;
    client.read_messages();

    let payloads: Vec<u8> = received
        .lock()
        .unwrap()
        .iter()
        .map(|message| message.payload()[0])
        .collect();
    assert_eq!(payloads, vec![2]);

    client.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_fifo_order_per_subscriber() {
    let sink = Arc::new(RecordingSink::default());
    let (server, addr) = start_server(local_config(), sink).await;
    let server = &*server;

    let received = Arc::new(Mutex::new(Vec::new()));
    let mut subscriber = connected_client(addr, "ordered").await;
    subscriber.listen("Seq", recorder(&received)).unwrap();
    let publisher = connected_client(addr, "counter").await;
    eventually("subscription", || async move {
        patterns_of(server, "ordered").await == Some(patterns(&["Seq"]))
    })
    .await;

    let mut payload = BytesMut::new();
    for n in 0u32..100 {
        payload.put_u32(n);
        publisher.publish("Seq", payload.split().freeze()).unwrap();
    }

    eventually("all messages", || {
        subscriber.read_messages();
        let done = received.lock().unwrap().len() == 100;
        async move { done }
    })
    .await;
    let order: Vec<u32> = received
        .lock()
        .unwrap()
        .iter()
        .map(|message| {
            let payload = message.payload();
            u32::from_be_bytes([payload[0], payload[1], payload[2], payload[3]])
        })
        .collect();
    assert_eq!(order, (0u32..100).collect::<Vec<_>>());

    publisher.shutdown().await.unwrap();
    subscriber.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_large_self_publish_does_not_stall() {
    const COUNT: usize = 200;
    let sink = Arc::new(RecordingSink::default());
    let (server, addr) = start_server(local_config(), sink).await;
    let server = &*server;

    let received = Arc::new(std::sync::atomic::AtomicUsize::new(0));
    let mut client = connected_client(addr, "loopback").await;
    {
        let received = received.clone();
        client
            .listen("Echo", move |message: &Message| {
                assert_eq!(message.payload().len(), 1 << 20);
                received.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
                Ok(())
            })
            .unwrap();
    }
    eventually("subscription", || async move {
        patterns_of(server, "loopback").await == Some(patterns(&["Echo"]))
    })
    .await;

    let payload = bytes::Bytes::from(vec![0xA5u8; 1 << 20]);
    for _ in 0..COUNT {
        client.publish("Echo", payload.clone()).unwrap();
    }

    let deadline = tokio::time::Instant::now() + Duration::from_secs(30);
    while received.load(std::sync::atomic::Ordering::Relaxed) < COUNT {
        assert!(
            tokio::time::Instant::now() < deadline,
            "received {}/{}",
            received.load(std::sync::atomic::Ordering::Relaxed),
            COUNT
        );
        let _ = timeout(Duration::from_millis(100), client.wait_for_messages()).await;
    }

    assert_eq!(received.load(std::sync::atomic::Ordering::Relaxed), COUNT);
    assert!(client.is_connected());
    assert_eq!(server.broker().lock().await.find_by_name("loopback").len(), 1);

    client.shutdown().await.unwrap();
}
