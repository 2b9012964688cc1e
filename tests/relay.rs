//! Relay Integration Tests
//!
//! Runs the relay against two in-process fake brokers speaking MQTT over
//! real TCP sockets, built on the crate's own codec.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::{Buf, Bytes, BytesMut};
use pretty_assertions::assert_eq;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio::time::timeout;

use relaymq::bridge::{Bridge, BridgeError, DropReason, Leg, RelayEvent};
use relaymq::codec::{Decoder, Encoder};
use relaymq::config::Config;
use relaymq::protocol::{
    ConnAck, ConnectReturnCode, Packet, PubAck, PubComp, PubRec, Publish, QoS, SubAck,
};
use relaymq::transport::{ConnectOptions, MqttTransport, SessionEvent, Transport};

// =============================================================================
// Fake broker
// =============================================================================

#[derive(Debug, Clone)]
enum BrokerCommand {
    /// Deliver to every connected client
    Publish(Publish),
    /// Drop every client connection
    Kick,
}

/// Accepts any client, acknowledges everything and reports every packet
struct FakeBroker {
    addr: SocketAddr,
    packets: mpsc::UnboundedReceiver<Packet>,
    commands: broadcast::Sender<BrokerCommand>,
    accept_task: JoinHandle<()>,
}

impl FakeBroker {
    async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (packet_tx, packets) = mpsc::unbounded_channel();
        let (commands, _) = broadcast::channel(64);

        let command_tx = commands.clone();
        let accept_task = tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                tokio::spawn(serve(stream, packet_tx.clone(), command_tx.subscribe()));
            }
        });

        Self {
            addr,
            packets,
            commands,
            accept_task,
        }
    }

    fn address(&self) -> String {
        self.addr.to_string()
    }

    fn publish(&self, publish: Publish) {
        self.commands.send(BrokerCommand::Publish(publish)).unwrap();
    }

    fn kick(&self) {
        self.commands.send(BrokerCommand::Kick).unwrap();
    }

    async fn next_packet(&mut self) -> Packet {
        timeout(Duration::from_secs(5), self.packets.recv())
            .await
            .expect("timed out waiting for packet")
            .expect("broker gone")
    }

    /// Wait for the first packet matching `pred`, skipping pings and acks
    async fn expect<F>(&mut self, pred: F) -> Packet
    where
        F: Fn(&Packet) -> bool,
    {
        loop {
            let packet = self.next_packet().await;
            if pred(&packet) {
                return packet;
            }
        }
    }

    /// Check that no CONNECT arrives within `window`
    async fn assert_no_connect(&mut self, window: Duration) {
        let deadline = tokio::time::Instant::now() + window;
        while let Ok(Some(packet)) = tokio::time::timeout_at(deadline, self.packets.recv()).await {
            assert!(
                !matches!(packet, Packet::Connect(_)),
                "unexpected reconnect: {:?}",
                packet
            );
        }
    }
}

impl Drop for FakeBroker {
    fn drop(&mut self) {
        self.accept_task.abort();
    }
}

async fn serve(
    mut stream: TcpStream,
    packets: mpsc::UnboundedSender<Packet>,
    mut commands: broadcast::Receiver<BrokerCommand>,
) {
    let mut decoder = Decoder::new();
    let mut encoder = Encoder::default();
    let mut read_buf = BytesMut::with_capacity(4096);
    let mut next_packet_id: u16 = 0;

    loop {
        tokio::select! {
            result = stream.read_buf(&mut read_buf) => {
                match result {
                    Ok(n) if n > 0 => {}
                    _ => return,
                }
                while let Ok(Some((packet, consumed))) = decoder.decode(&read_buf) {
                    read_buf.advance(consumed);
                    let reply = match &packet {
                        Packet::Connect(connect) => {
                            encoder.set_protocol_version(connect.protocol_version);
                            Some(Packet::ConnAck(ConnAck {
                                session_present: false,
                                return_code: ConnectReturnCode::ACCEPTED,
                            }))
                        }
                        Packet::Subscribe(subscribe) => Some(Packet::SubAck(SubAck {
                            packet_id: subscribe.packet_id,
                            return_codes: subscribe
                                .subscriptions
                                .iter()
                                .map(|s| s.qos as u8)
                                .collect(),
                        })),
                        Packet::Publish(publish) => match (publish.qos, publish.packet_id) {
                            (QoS::AtLeastOnce, Some(packet_id)) => {
                                Some(Packet::PubAck(PubAck { packet_id }))
                            }
                            (QoS::ExactlyOnce, Some(packet_id)) => {
                                Some(Packet::PubRec(PubRec { packet_id }))
                            }
                            _ => None,
                        },
                        Packet::PubRel(rel) => Some(Packet::PubComp(PubComp {
                            packet_id: rel.packet_id,
                        })),
                        Packet::PingReq => Some(Packet::PingResp),
                        _ => None,
                    };
                    let disconnect = matches!(packet, Packet::Disconnect(_));
                    let _ = packets.send(packet);
                    if let Some(reply) = reply {
                        if write(&mut stream, &encoder, &reply).await.is_err() {
                            return;
                        }
                    }
                    if disconnect {
                        return;
                    }
                }
            }

            command = commands.recv() => match command {
                Ok(BrokerCommand::Publish(mut publish)) => {
                    if publish.qos != QoS::AtMostOnce {
                        next_packet_id = next_packet_id.wrapping_add(1).max(1);
                        publish.packet_id = Some(next_packet_id);
                    }
                    if write(&mut stream, &encoder, &Packet::Publish(publish)).await.is_err() {
                        return;
                    }
                }
                Ok(BrokerCommand::Kick) | Err(_) => return,
            },
        }
    }
}

async fn write(stream: &mut TcpStream, encoder: &Encoder, packet: &Packet) -> std::io::Result<()> {
    let mut buf = BytesMut::new();
    encoder.encode(packet, &mut buf).expect("Failed to encode");
    stream.write_all(&buf).await
}

// =============================================================================
// Helpers
// =============================================================================

fn relay_config(upstream: &FakeBroker, downstream: &FakeBroker, poll_interval: &str) -> Config {
    let toml = format!(
        r#"
[upstream]
address = "{}"
keepalive = "5s"

[downstream]
address = "{}"
keepalive = "5s"

[relay]
topic_filter = "sensors/#"
poll_interval = "{}"
startup_timeout = "2s"
"#,
        upstream.address(),
        downstream.address(),
        poll_interval
    );
    Config::parse(&toml).unwrap()
}

fn reading(payload: &'static str) -> Publish {
    Publish {
        dup: false,
        qos: QoS::AtLeastOnce,
        retain: false,
        topic: "sensors/pi1/10/reading".to_string(),
        packet_id: None,
        payload: Bytes::from_static(payload.as_bytes()),
    }
}

async fn wait_for<F>(events: &mut broadcast::Receiver<RelayEvent>, pred: F) -> RelayEvent
where
    F: Fn(&RelayEvent) -> bool,
{
    timeout(Duration::from_secs(5), async {
        loop {
            match events.recv().await {
                Ok(event) if pred(&event) => return event,
                Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => panic!("event channel closed"),
            }
        }
    })
    .await
    .expect("timed out waiting for relay event")
}

/// Running relay plus the handles a test needs to drive it
struct Running {
    events: broadcast::Receiver<RelayEvent>,
    shutdown: broadcast::Sender<()>,
    task: JoinHandle<(Bridge, Result<(), BridgeError>)>,
}

async fn start_relay(
    upstream: &FakeBroker,
    downstream: &FakeBroker,
    poll_interval: &str,
) -> Running {
    let config = relay_config(upstream, downstream, poll_interval);
    let mut bridge = Bridge::from_config(&config, Arc::new(MqttTransport::new())).unwrap();
    let events = bridge.subscribe_events();

    let report = bridge.start().await.unwrap();
    assert!(report.is_complete(), "startup incomplete: {:?}", report);

    let (shutdown, shutdown_rx) = broadcast::channel(1);
    let task = tokio::spawn(async move {
        let result = bridge.run(shutdown_rx).await;
        (bridge, result)
    });

    Running {
        events,
        shutdown,
        task,
    }
}

// =============================================================================
// Scenarios
// =============================================================================

#[tokio::test]
async fn test_startup_connects_both_and_subscribes_upstream() {
    let mut upstream = FakeBroker::start().await;
    let mut downstream = FakeBroker::start().await;
    let _relay = start_relay(&upstream, &downstream, "200ms").await;

    match upstream.next_packet().await {
        Packet::Connect(connect) => {
            assert_eq!(connect.client_id, "mqtt_bridge_external");
            assert!(!connect.clean_start);
            assert_eq!(connect.keep_alive, 5);
        }
        other => panic!("expected CONNECT, got {:?}", other),
    }
    match upstream.next_packet().await {
        Packet::Subscribe(subscribe) => {
            assert_eq!(subscribe.subscriptions.len(), 1);
            assert_eq!(subscribe.subscriptions[0].filter, "sensors/#");
            assert_eq!(subscribe.subscriptions[0].qos, QoS::AtLeastOnce);
        }
        other => panic!("expected SUBSCRIBE, got {:?}", other),
    }

    match downstream.next_packet().await {
        Packet::Connect(connect) => assert_eq!(connect.client_id, "mqtt_bridge_local"),
        other => panic!("expected CONNECT, got {:?}", other),
    }
    downstream.assert_no_connect(Duration::from_millis(500)).await;
}

#[tokio::test]
async fn test_message_forwarded_unchanged() {
    let mut upstream = FakeBroker::start().await;
    let mut downstream = FakeBroker::start().await;
    let mut relay = start_relay(&upstream, &downstream, "200ms").await;
    upstream.expect(|p| matches!(p, Packet::Subscribe(_))).await;

    upstream.publish(reading(r#"{"t":21.5}"#));

    // Upstream QoS 1 delivery is acknowledged
    upstream.expect(|p| matches!(p, Packet::PubAck(_))).await;

    match downstream.expect(|p| matches!(p, Packet::Publish(_))).await {
        Packet::Publish(publish) => {
            assert_eq!(publish.topic, "sensors/pi1/10/reading");
            assert_eq!(publish.payload, Bytes::from_static(br#"{"t":21.5}"#));
            assert_eq!(publish.qos, QoS::AtLeastOnce);
            assert!(!publish.retain);
            assert!(publish.packet_id.is_some());
        }
        _ => unreachable!(),
    }
    wait_for(&mut relay.events, |e| matches!(e, RelayEvent::Forwarded { .. })).await;
}

#[tokio::test]
async fn test_retained_and_qos_preserved_in_order() {
    let mut upstream = FakeBroker::start().await;
    let mut downstream = FakeBroker::start().await;
    let _relay = start_relay(&upstream, &downstream, "200ms").await;
    upstream.expect(|p| matches!(p, Packet::Subscribe(_))).await;

    let sent: Vec<Publish> = (0..10u8)
        .map(|n| Publish {
            qos: QoS::from_u8(n % 3).unwrap(),
            retain: n % 2 == 1,
            topic: format!("sensors/pi{}/state", n),
            payload: Bytes::from(vec![n; 16]),
            ..Default::default()
        })
        .collect();
    for publish in &sent {
        upstream.publish(publish.clone());
    }

    for expected in sent {
        match downstream.expect(|p| matches!(p, Packet::Publish(_))).await {
            Packet::Publish(publish) => {
                assert_eq!(publish.topic, expected.topic);
                assert_eq!(publish.payload, expected.payload);
                assert_eq!(publish.qos, expected.qos);
                assert_eq!(publish.retain, expected.retain);
            }
            _ => unreachable!(),
        }
    }
}

#[tokio::test]
async fn test_downstream_outage_drops_then_recovers() {
    let mut upstream = FakeBroker::start().await;
    let mut downstream = FakeBroker::start().await;
    let mut relay = start_relay(&upstream, &downstream, "1s").await;
    upstream.expect(|p| matches!(p, Packet::Subscribe(_))).await;
    downstream.expect(|p| matches!(p, Packet::Connect(_))).await;

    downstream.kick();
    wait_for(&mut relay.events, |e| {
        matches!(e, RelayEvent::LegDown { leg: Leg::Downstream, .. })
    })
    .await;

    upstream.publish(reading(r#"{"t":1}"#));
    match wait_for(&mut relay.events, |e| matches!(e, RelayEvent::Dropped { .. })).await {
        RelayEvent::Dropped { topic, reason } => {
            assert_eq!(topic, "sensors/pi1/10/reading");
            assert_eq!(reason, DropReason::DownstreamUnavailable);
        }
        _ => unreachable!(),
    }

    // Supervisor reconnects within a poll interval
    downstream.expect(|p| matches!(p, Packet::Connect(_))).await;
    wait_for(&mut relay.events, |e| {
        matches!(e, RelayEvent::LegUp { leg: Leg::Downstream, .. })
    })
    .await;

    upstream.publish(reading(r#"{"t":2}"#));
    match downstream.expect(|p| matches!(p, Packet::Publish(_))).await {
        Packet::Publish(publish) => {
            assert_eq!(publish.payload, Bytes::from_static(br#"{"t":2}"#));
        }
        _ => unreachable!(),
    }
}

#[tokio::test]
async fn test_upstream_outage_resubscribes() {
    let mut upstream = FakeBroker::start().await;
    let mut downstream = FakeBroker::start().await;
    let mut relay = start_relay(&upstream, &downstream, "1s").await;
    upstream.expect(|p| matches!(p, Packet::Subscribe(_))).await;

    upstream.kick();
    upstream.expect(|p| matches!(p, Packet::Connect(_))).await;
    match upstream.expect(|p| matches!(p, Packet::Subscribe(_))).await {
        Packet::Subscribe(subscribe) => {
            assert_eq!(subscribe.subscriptions[0].filter, "sensors/#");
        }
        _ => unreachable!(),
    }
    wait_for(&mut relay.events, |e| {
        matches!(e, RelayEvent::LegUp { leg: Leg::Upstream, .. })
    })
    .await;

    // Downstream never noticed
    downstream.expect(|p| matches!(p, Packet::Connect(_))).await;
    downstream.assert_no_connect(Duration::from_millis(500)).await;
}

#[tokio::test]
async fn test_shutdown_disconnects_and_stops_reconnecting() {
    let mut upstream = FakeBroker::start().await;
    let mut downstream = FakeBroker::start().await;
    let relay = start_relay(&upstream, &downstream, "200ms").await;
    upstream.expect(|p| matches!(p, Packet::Subscribe(_))).await;
    downstream.expect(|p| matches!(p, Packet::Connect(_))).await;

    relay.shutdown.send(()).unwrap();
    let (bridge, result) = timeout(Duration::from_secs(5), relay.task)
        .await
        .expect("relay did not stop")
        .unwrap();
    assert!(result.is_ok());
    assert!(!bridge.is_running());

    upstream.expect(|p| matches!(p, Packet::Disconnect(_))).await;
    downstream.expect(|p| matches!(p, Packet::Disconnect(_))).await;

    upstream.assert_no_connect(Duration::from_millis(800)).await;
    downstream.assert_no_connect(Duration::from_millis(800)).await;
}

#[tokio::test]
async fn test_unreachable_downstream_at_startup_is_retried() {
    let mut upstream = FakeBroker::start().await;
    // Reserve a port, then free it so nothing listens there yet
    let port = {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap().port()
    };

    let toml = format!(
        r#"
[upstream]
address = "{}"

[downstream]
address = "127.0.0.1:{}"
connect_timeout = "500ms"

[relay]
poll_interval = "200ms"
startup_timeout = "500ms"
"#,
        upstream.address(),
        port
    );
    let config = Config::parse(&toml).unwrap();
    let mut bridge = Bridge::from_config(&config, Arc::new(MqttTransport::new())).unwrap();
    let mut events = bridge.subscribe_events();

    let report = bridge.start().await.unwrap();
    assert!(report.upstream_up);
    assert!(!report.downstream_up);

    let (shutdown, shutdown_rx) = broadcast::channel(1);
    let task = tokio::spawn(async move { bridge.run(shutdown_rx).await });

    wait_for(&mut events, |e| {
        matches!(e, RelayEvent::Reconnecting { leg: Leg::Downstream, .. })
    })
    .await;

    // Upstream traffic is dropped, not queued, while downstream is missing
    upstream.expect(|p| matches!(p, Packet::Subscribe(_))).await;
    upstream.publish(reading(r#"{"t":3}"#));
    wait_for(&mut events, |e| matches!(e, RelayEvent::Dropped { .. })).await;

    shutdown.send(()).unwrap();
    timeout(Duration::from_secs(5), task).await.unwrap().unwrap().unwrap();
}

#[tokio::test]
async fn test_publish_coalesced_with_connack_is_delivered() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();

    // Resumed session: the queued message is written in the same segment as CONNACK
    let broker = tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();
        let mut decoder = Decoder::new();
        let encoder = Encoder::default();
        let mut read_buf = BytesMut::new();

        loop {
            if let Some((packet, consumed)) = decoder.decode(&read_buf).unwrap() {
                read_buf.advance(consumed);
                assert!(matches!(packet, Packet::Connect(_)));
                break;
            }
            assert!(stream.read_buf(&mut read_buf).await.unwrap() > 0);
        }

        let mut out = BytesMut::new();
        encoder
            .encode(
                &Packet::ConnAck(ConnAck {
                    session_present: true,
                    return_code: ConnectReturnCode::ACCEPTED,
                }),
                &mut out,
            )
            .unwrap();
        encoder
            .encode(
                &Packet::Publish(Publish {
                    qos: QoS::AtLeastOnce,
                    topic: "sensors/a".to_string(),
                    packet_id: Some(7),
                    payload: Bytes::from_static(b"queued"),
                    ..Default::default()
                }),
                &mut out,
            )
            .unwrap();
        stream.write_all(&out).await.unwrap();

        loop {
            if let Some((packet, consumed)) = decoder.decode(&read_buf).unwrap() {
                read_buf.advance(consumed);
                return packet;
            }
            assert!(stream.read_buf(&mut read_buf).await.unwrap() > 0);
        }
    });

    let mut options = ConnectOptions::new("127.0.0.1", port, "mqtt_bridge_external");
    options.keepalive = Duration::ZERO;
    let mut session = MqttTransport::new().connect(&options).await.unwrap();
    assert!(session.session_present);

    match timeout(Duration::from_secs(2), session.events.recv()).await {
        Ok(Some(SessionEvent::Message(message))) => {
            assert_eq!(message.topic, "sensors/a");
            assert_eq!(message.payload, Bytes::from_static(b"queued"));
            assert_eq!(message.qos, QoS::AtLeastOnce);
        }
        other => panic!("queued message not delivered: {:?}", other),
    }

    let ack = timeout(Duration::from_secs(2), broker)
        .await
        .expect("no acknowledgement")
        .unwrap();
    assert_eq!(ack, Packet::PubAck(PubAck { packet_id: 7 }));
}
