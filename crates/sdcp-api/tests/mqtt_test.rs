#![allow(clippy::unwrap_used)]
// Integration tests for the embedded broker and both MQTT printer clients.
//
// Fake printers are plain rumqttc clients attached to the embedded broker,
// so every test runs over real loopback TCP.

use std::net::{IpAddr, Ipv4Addr};
use std::time::Duration;

use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use rumqttc::{AsyncClient, Event, MqttOptions, Packet as MqttPacket, QoS};
use serde_json::{Value, json};
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpStream, UdpSocket};
use tokio::sync::{mpsc, oneshot};
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;

use sdcp_api::mqtt::packet::{Connect, MqttCodec, Packet, Publish};
use sdcp_api::mqtt::{BrokerConfig, BrokerHandle, Cc2Client, Cc2Config, Cc2State};
use sdcp_api::mqtt::{SdcpMqttClient, SdcpMqttConfig};
use sdcp_api::sdcp::command;
use sdcp_api::{Error, TransportEvent};

// ── Helpers ─────────────────────────────────────────────────────────

async fn start_broker() -> BrokerHandle {
    BrokerHandle::start(&BrokerConfig {
        bind: IpAddr::V4(Ipv4Addr::LOCALHOST),
        port: 0,
        ..BrokerConfig::default()
    })
    .await
    .unwrap()
}

async fn raw_session(port: u16, client_id: &str) -> Framed<TcpStream, MqttCodec> {
    let stream = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
    let mut framed = Framed::new(stream, MqttCodec::default());
    framed
        .send(Packet::Connect(Connect {
            protocol_name: "MQTT".into(),
            protocol_level: 4,
            clean_session: true,
            keep_alive: 30,
            client_id: client_id.into(),
            username: None,
            password: None,
        }))
        .await
        .unwrap();
    let ack = framed.next().await.unwrap().unwrap();
    assert!(matches!(ack.packet, Packet::ConnAck { code: 0, .. }));
    framed
}

async fn raw_subscribe(framed: &mut Framed<TcpStream, MqttCodec>, topic: &str) {
    framed
        .send(Packet::Subscribe {
            packet_id: 1,
            topics: vec![(topic.into(), 0)],
        })
        .await
        .unwrap();
    let ack = framed.next().await.unwrap().unwrap();
    assert!(matches!(ack.packet, Packet::SubAck { packet_id: 1, .. }));
}

fn publish(topic: &str, payload: &'static [u8], qos: u8, packet_id: Option<u16>) -> Bytes {
    Packet::Publish(Publish {
        dup: false,
        qos,
        retain: false,
        topic: topic.into(),
        packet_id,
        payload: Bytes::from_static(payload),
    })
    .to_bytes()
    .unwrap()
}

fn printer_options(port: u16, id: &str) -> MqttOptions {
    let mut options = MqttOptions::new(id, "127.0.0.1", port);
    options.set_keep_alive(Duration::from_secs(30));
    options
}

// ── Embedded broker ─────────────────────────────────────────────────

#[tokio::test]
async fn broker_reassembles_split_and_merged_publishes() {
    let broker = start_broker().await;
    let mut subscriber = raw_session(broker.port(), "sub").await;
    raw_subscribe(&mut subscriber, "sdcp/t").await;

    let mut publisher = raw_session(broker.port(), "pub").await;
    raw_subscribe(&mut publisher, "sdcp/t").await;

    // One packet split across two writes.
    let first = publish("sdcp/t", b"one", 0, None);
    let (head, tail) = first.split_at(4);
    publisher.get_mut().write_all(head).await.unwrap();
    publisher.get_mut().flush().await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    publisher.get_mut().write_all(tail).await.unwrap();

    // Two packets in one write, the second at QoS 1.
    let mut merged = publish("sdcp/t", b"two", 0, None).to_vec();
    merged.extend_from_slice(&publish("sdcp/t", b"three", 1, Some(7)));
    publisher.get_mut().write_all(&merged).await.unwrap();

    for expected in [&b"one"[..], b"two", b"three"] {
        let frame = tokio::time::timeout(Duration::from_secs(2), subscriber.next())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        match frame.packet {
            Packet::Publish(p) => assert_eq!(p.payload.as_ref(), expected),
            other => panic!("expected PUBLISH, got {other:?}"),
        }
    }

    // The publisher only sees the PUBACK, never its own messages.
    let ack = tokio::time::timeout(Duration::from_secs(2), publisher.next())
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert!(matches!(ack.packet, Packet::PubAck { packet_id: 7 }));
    let echo = tokio::time::timeout(Duration::from_millis(200), publisher.next()).await;
    assert!(echo.is_err(), "publisher received an echo");
}

#[tokio::test]
async fn broker_answers_pings_and_drops_disconnected_sessions() {
    let broker = start_broker().await;
    let mut session = raw_session(broker.port(), "pinger").await;

    session.send(Packet::PingReq).await.unwrap();
    let pong = session.next().await.unwrap().unwrap();
    assert!(matches!(pong.packet, Packet::PingResp));
    assert_eq!(broker.session_count(), 1);

    session.send(Packet::Disconnect).await.unwrap();
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(broker.session_count(), 0);
}

#[tokio::test]
async fn broker_drops_sessions_announcing_oversized_packets() {
    let broker = BrokerHandle::start(&BrokerConfig {
        bind: IpAddr::V4(Ipv4Addr::LOCALHOST),
        port: 0,
        max_packet_size: 1024,
    })
    .await
    .unwrap();
    let mut healthy = raw_session(broker.port(), "healthy").await;
    let mut hostile = raw_session(broker.port(), "hostile").await;
    assert_eq!(broker.session_count(), 2);

    // PUBLISH header claiming ~256 MiB of payload.
    hostile
        .get_mut()
        .write_all(&[0x30, 0xff, 0xff, 0xff, 0x7f])
        .await
        .unwrap();
    let closed = tokio::time::timeout(Duration::from_secs(2), hostile.next())
        .await
        .unwrap();
    assert!(matches!(closed, None | Some(Err(_))), "got {closed:?}");

    healthy.send(Packet::PingReq).await.unwrap();
    let pong = healthy.next().await.unwrap().unwrap();
    assert!(matches!(pong.packet, Packet::PingResp));
    assert_eq!(broker.session_count(), 1);
}

// ── Broker-mediated SDCP ────────────────────────────────────────────

/// Wait for the `M66666 <port>` handshake, join the broker, and answer
/// every request with an ack-0 response. Reports every command id seen.
async fn spawn_standard_printer() -> (u16, mpsc::UnboundedReceiver<u32>) {
    let udp = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let handshake_port = udp.local_addr().unwrap().port();
    let (seen_tx, seen_rx) = mpsc::unbounded_channel();

    tokio::spawn(async move {
        let mut buf = [0u8; 64];
        let (len, _) = udp.recv_from(&mut buf).await.unwrap();
        let text = std::str::from_utf8(&buf[..len]).unwrap();
        let broker_port: u16 = text.strip_prefix("M66666 ").unwrap().trim().parse().unwrap();

        let (client, mut eventloop) = AsyncClient::new(printer_options(broker_port, "printer"), 16);
        client
            .subscribe("/sdcp/request/MB1", QoS::AtMostOnce)
            .await
            .unwrap();

        loop {
            let Ok(event) = eventloop.poll().await else {
                break;
            };
            let Event::Incoming(MqttPacket::Publish(publish)) = event else {
                continue;
            };
            let request: Value = serde_json::from_slice(&publish.payload).unwrap();
            let cmd = u32::try_from(request["Data"]["Cmd"].as_u64().unwrap()).unwrap();
            let _ = seen_tx.send(cmd);

            let reply = json!({
                "Id": request["Id"],
                "Data": {
                    "Cmd": cmd,
                    "Data": { "Ack": 0 },
                    "RequestID": request["Data"]["RequestID"],
                    "MainboardID": "MB1",
                },
                "Topic": "/sdcp/response/MB1",
            });
            client
                .try_publish("/sdcp/response/MB1", QoS::AtMostOnce, false, reply.to_string())
                .unwrap();
        }
    });

    (handshake_port, seen_rx)
}

#[tokio::test]
async fn standard_client_hands_off_broker_and_waits_for_join() {
    let broker = start_broker().await;
    let (handshake_port, mut seen) = spawn_standard_printer().await;

    let mut config = SdcpMqttConfig::new("127.0.0.1", "MB1", broker.port());
    config.handshake_port = handshake_port;
    config.command_timeout = Duration::from_millis(500);
    config.join_timeout = Duration::from_secs(10);

    let client = SdcpMqttClient::connect(config, Some(broker.clone()), CancellationToken::new())
        .await
        .unwrap();
    assert!(client.is_alive());

    let mut commands = Vec::new();
    while !commands.contains(&command::STATUS_PERIOD) {
        let cmd = tokio::time::timeout(Duration::from_secs(2), seen.recv())
            .await
            .unwrap()
            .unwrap();
        commands.push(cmd);
    }
    assert!(commands.contains(&command::STATUS));

    let response = client
        .send_command(command::ATTRIBUTES, json!({}), true)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(response.cmd, command::ATTRIBUTES);

    client.disconnect().await;
    assert!(!client.is_alive());
    assert!(matches!(
        client.send_command(command::STATUS, json!({}), true).await,
        Err(Error::NotConnected)
    ));
}

#[tokio::test]
async fn standard_client_gives_up_when_printer_never_joins() {
    let broker = start_broker().await;
    let silent = UdpSocket::bind("127.0.0.1:0").await.unwrap();

    let mut config = SdcpMqttConfig::new("127.0.0.1", "MB1", broker.port());
    config.handshake_port = silent.local_addr().unwrap().port();
    config.command_timeout = Duration::from_millis(200);
    config.join_timeout = Duration::from_millis(700);

    let err = SdcpMqttClient::connect(config, Some(broker), CancellationToken::new())
        .await
        .err()
        .unwrap();
    assert!(matches!(err, Error::Connection(_)), "got {err:?}");
}

// ── Inverted MQTT ───────────────────────────────────────────────────

#[derive(Clone, Copy)]
struct FakeCc2 {
    registration_error: &'static str,
    answer_pings: bool,
}

/// A CC2 printer living on the embedded broker. Returns once the printer
/// is subscribed to its registration topic.
async fn spawn_cc2_printer(port: u16, fake: FakeCc2) {
    let (client, mut eventloop) = AsyncClient::new(printer_options(port, "cc2-printer"), 16);
    client
        .subscribe("elegoo/SN1/api_register", QoS::AtMostOnce)
        .await
        .unwrap();
    let (ready_tx, ready_rx) = oneshot::channel();

    tokio::spawn(async move {
        let mut ready = Some(ready_tx);
        loop {
            let Ok(event) = eventloop.poll().await else {
                break;
            };
            match event {
                Event::Incoming(MqttPacket::SubAck(_)) => {
                    if let Some(tx) = ready.take() {
                        let _ = tx.send(());
                    }
                }
                Event::Incoming(MqttPacket::Publish(publish)) => {
                    let body: Value = serde_json::from_slice(&publish.payload).unwrap();
                    handle_cc2(&client, fake, &publish.topic, &body).await;
                }
                _ => {}
            }
        }
    });

    tokio::time::timeout(Duration::from_secs(2), ready_rx)
        .await
        .unwrap()
        .unwrap();
}

async fn handle_cc2(client: &AsyncClient, fake: FakeCc2, topic: &str, body: &Value) {
    if topic == "elegoo/SN1/api_register" {
        let client_id = body["client_id"].as_str().unwrap().to_owned();
        if fake.registration_error == "ok" {
            client
                .subscribe(format!("elegoo/SN1/{client_id}/api_request"), QoS::AtMostOnce)
                .await
                .unwrap();
        }
        let reply = json!({ "client_id": client_id, "error": fake.registration_error });
        client
            .try_publish(
                format!("elegoo/SN1/{client_id}/register_response"),
                QoS::AtMostOnce,
                false,
                reply.to_string(),
            )
            .unwrap();
        return;
    }

    let client_id = topic.split('/').nth(2).unwrap();
    let response_topic = format!("elegoo/SN1/{client_id}/api_response");

    if body["type"] == "PING" {
        if fake.answer_pings {
            client
                .try_publish(response_topic, QoS::AtMostOnce, false, r#"{"type":"PONG"}"#)
                .unwrap();
        }
        return;
    }

    let reply = json!({
        "id": body["id"],
        "method": body["method"],
        "result": { "error_code": 0, "echo": body["params"] },
    });
    client
        .try_publish(response_topic, QoS::AtMostOnce, false, reply.to_string())
        .unwrap();

    if body["method"] == 1002 {
        let push = json!({ "id": 5, "method": 6000, "result": { "extruder": { "temperature": 215 } } });
        client
            .try_publish("elegoo/SN1/api_status", QoS::AtMostOnce, false, push.to_string())
            .unwrap();
    }
}

fn cc2_config(port: u16) -> Cc2Config {
    let mut config = Cc2Config::new("127.0.0.1", "SN1");
    config.port = port;
    config.command_timeout = Duration::from_secs(2);
    config.registration_timeout = Duration::from_millis(500);
    config
}

#[tokio::test]
async fn cc2_registers_then_round_trips_and_streams_deltas() {
    let broker = start_broker().await;
    spawn_cc2_printer(
        broker.port(),
        FakeCc2 {
            registration_error: "ok",
            answer_pings: true,
        },
    )
    .await;

    let client = Cc2Client::connect(cc2_config(broker.port()), CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(*client.state().borrow(), Cc2State::Registered);
    let mut events = client.subscribe();

    let result = client
        .send_command(1001, json!({}), true)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(result["error_code"], 0);

    client.send_command(1002, json!({}), false).await.unwrap();
    let mut delta_seq = None;
    for _ in 0..4 {
        let event = tokio::time::timeout(Duration::from_secs(2), events.recv())
            .await
            .unwrap()
            .unwrap();
        if let TransportEvent::StatusDelta { seq, delta } = event.as_ref() {
            assert_eq!(delta["extruder"]["temperature"], 215);
            delta_seq = Some(*seq);
            break;
        }
    }
    assert_eq!(delta_seq, Some(5));

    client.disconnect().await;
    assert_eq!(*client.state().borrow(), Cc2State::Disconnected);
}

#[tokio::test]
async fn cc2_too_many_clients_is_distinct() {
    let broker = start_broker().await;
    spawn_cc2_printer(
        broker.port(),
        FakeCc2 {
            registration_error: "too many clients",
            answer_pings: true,
        },
    )
    .await;

    let err = Cc2Client::connect(cc2_config(broker.port()), CancellationToken::new())
        .await
        .err()
        .unwrap();
    assert!(matches!(err, Error::TooManyClients), "got {err:?}");
}

#[tokio::test]
async fn cc2_generic_rejection_carries_reason() {
    let broker = start_broker().await;
    spawn_cc2_printer(
        broker.port(),
        FakeCc2 {
            registration_error: "invalid token",
            answer_pings: true,
        },
    )
    .await;

    match Cc2Client::connect(cc2_config(broker.port()), CancellationToken::new()).await {
        Err(Error::RegistrationRejected { reason }) => assert_eq!(reason, "invalid token"),
        Err(other) => panic!("unexpected error {other:?}"),
        Ok(_) => panic!("registration should have failed"),
    }
}

#[tokio::test]
async fn cc2_registration_times_out_without_printer() {
    let broker = start_broker().await;
    let err = Cc2Client::connect(cc2_config(broker.port()), CancellationToken::new())
        .await
        .err()
        .unwrap();
    assert!(matches!(err, Error::RegistrationTimeout { timeout_ms: 500 }), "got {err:?}");
}

#[tokio::test]
async fn cc2_missing_pongs_kill_the_connection() {
    let broker = start_broker().await;
    spawn_cc2_printer(
        broker.port(),
        FakeCc2 {
            registration_error: "ok",
            answer_pings: false,
        },
    )
    .await;

    let mut config = cc2_config(broker.port());
    config.heartbeat_interval = Duration::from_millis(100);
    config.pong_timeout = Duration::from_millis(300);
    let client = Cc2Client::connect(config, CancellationToken::new())
        .await
        .unwrap();
    let mut events = client.subscribe();

    let closed = loop {
        let event = tokio::time::timeout(Duration::from_secs(3), events.recv())
            .await
            .unwrap()
            .unwrap();
        if let TransportEvent::Closed { reason } = event.as_ref() {
            break reason.clone();
        }
    };
    assert!(closed.contains("PONG"), "reason was {closed}");
    assert!(!client.is_alive());
    assert!(matches!(
        client.send_command(1001, json!({}), true).await,
        Err(Error::NotConnected)
    ));
}
