#![allow(clippy::unwrap_used)]
// Integration tests for `Printer` against in-process fake printers: an
// SDCP WebSocket board and an inverted-MQTT board on the embedded broker.

use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use rumqttc::{AsyncClient, Event, MqttOptions, Packet as MqttPacket, QoS};
use serde_json::{Value, json};
use tokio::net::TcpListener;
use tokio::sync::{mpsc, oneshot};
use tokio_tungstenite::tungstenite::Message;

use sdcp_api::mqtt::{BrokerConfig, BrokerHandle};
use sdcp_core::{
    Command, CommandResult, ConnectionState, CoreError, Device, Fan, Printer, PrinterConfig,
    PrintStatus, TransportKind,
};

const MAINBOARD: &str = "MB1";

// ── Fake WebSocket printer ──────────────────────────────────────────

fn frame(topic: &str, body: Value) -> Value {
    let mut frame = body;
    frame["Topic"] = json!(format!("sdcp/{topic}/{MAINBOARD}"));
    frame["MainboardID"] = json!(MAINBOARD);
    frame
}

fn response(request: &Value, data: Value) -> Value {
    frame(
        "response",
        json!({
            "Id": request["Id"],
            "Data": {
                "Cmd": request["Data"]["Cmd"],
                "Data": data,
                "RequestID": request["Data"]["RequestID"],
                "MainboardID": MAINBOARD,
            },
        }),
    )
}

fn status_push() -> Value {
    frame(
        "status",
        json!({ "Status": {
            "CurrentStatus": [1],
            "TempOfNozzle": 219.5, "TempTargetNozzle": 220,
            "PrintInfo": { "Status": 13, "CurrentLayer": 50, "TotalLayer": 200,
                           "CurrentTicks": 300, "TotalTicks": 1200, "Filename": "benchy.gcode" }
        }}),
    )
}

fn attributes_push() -> Value {
    frame(
        "attributes",
        json!({ "Attributes": {
            "Name": "Carbon", "MachineName": "Centauri Carbon", "MainboardID": MAINBOARD,
            "FirmwareVersion": "V1.1.29", "Capabilities": ["VIDEO_STREAM"]
        }}),
    )
}

fn history_detail(request: &Value) -> Value {
    let entries: Vec<Value> = request["Data"]["Data"]["Id"]
        .as_array()
        .unwrap()
        .iter()
        .map(|id| {
            json!({ "TaskId": id, "TaskName": format!("{}.gcode", id.as_str().unwrap()),
                    "BeginTime": 1_700_000_000, "EndTime": 1_700_000_600, "TaskStatus": 9 })
        })
        .collect();
    json!({ "Ack": 0, "HistoryDetailList": entries })
}

fn replies(request: &Value) -> Vec<Value> {
    match request["Data"]["Cmd"].as_u64().unwrap() {
        0 => vec![response(request, json!({ "Ack": 0 })), status_push()],
        1 => vec![response(request, json!({ "Ack": 0 })), attributes_push()],
        320 => vec![response(request, json!({ "Ack": 0, "HistoryData": ["t1", "t2"] }))],
        321 => vec![response(request, history_detail(request))],
        386 => vec![response(
            request,
            json!({ "Ack": 0, "VideoUrl": "http://127.0.0.1:3031/video" }),
        )],
        129 => vec![response(request, json!({ "Ack": 3 }))],
        _ => vec![response(request, json!({ "Ack": 0 }))],
    }
}

/// Returns the port and every request the printer received.
async fn spawn_ws_printer() -> (u16, mpsc::UnboundedReceiver<Value>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let (seen_tx, seen_rx) = mpsc::unbounded_channel();

    tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            let seen_tx = seen_tx.clone();
            tokio::spawn(async move {
                let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();
                while let Some(Ok(message)) = ws.next().await {
                    let Message::Text(text) = message else {
                        continue;
                    };
                    if text.as_str() == "ping" {
                        continue;
                    }
                    let request: Value = serde_json::from_str(text.as_str()).unwrap();
                    let _ = seen_tx.send(request.clone());
                    for reply in replies(&request) {
                        if ws.send(Message::text(reply.to_string())).await.is_err() {
                            return;
                        }
                    }
                }
            });
        }
    });
    (port, seen_rx)
}

fn ws_printer(port: u16) -> Printer {
    let device = Device::new(MAINBOARD, "127.0.0.1", "Centauri Carbon", TransportKind::WebSocket);
    Printer::new(
        PrinterConfig::new(device)
            .with_port(port)
            .with_command_timeout(Duration::from_secs(2)),
    )
}

fn commands_seen(rx: &mut mpsc::UnboundedReceiver<Value>) -> Vec<u64> {
    let mut seen = Vec::new();
    while let Ok(request) = rx.try_recv() {
        seen.push(request["Data"]["Cmd"].as_u64().unwrap());
    }
    seen
}

// ── WebSocket printer tests ─────────────────────────────────────────

#[tokio::test]
async fn connect_populates_status_and_attributes() {
    let (port, _seen) = spawn_ws_printer().await;
    let printer = ws_printer(port);
    let mut status = printer.status_stream();

    printer.connect().await.unwrap();
    assert_eq!(*printer.connection_state().borrow(), ConnectionState::Connected);

    let snap = tokio::time::timeout(Duration::from_secs(2), status.changed())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(snap.print.status, PrintStatus::Printing);
    assert_eq!(snap.print.percent_complete, 25.0);
    assert_eq!(snap.print.remaining_layers, 150);
    assert_eq!(snap.print.current_time_ms, 300_000);

    let CommandResult::Attributes(Some(attrs)) =
        printer.execute(Command::RefreshAttributes).await.unwrap()
    else {
        panic!("expected attributes");
    };
    assert_eq!(attrs.machine_name, "Centauri Carbon");
    assert!(attrs.supports("VIDEO_STREAM"));

    printer.disconnect().await;
    assert_eq!(*printer.connection_state().borrow(), ConnectionState::Disconnected);
    assert!(matches!(
        printer.execute(Command::Pause).await,
        Err(CoreError::NotConnected)
    ));
}

#[tokio::test]
async fn history_listing_backfills_each_id_once() {
    let (port, mut seen) = spawn_ws_printer().await;
    let printer = ws_printer(port);
    printer.connect().await.unwrap();

    let CommandResult::History(entries) = printer.execute(Command::ListHistory).await.unwrap()
    else {
        panic!("expected history");
    };
    assert_eq!(entries.len(), 2);
    assert!(entries.iter().all(|e| e.has_detail), "{entries:#?}");
    assert_eq!(entries[0].filename.as_deref().map(|f| f.ends_with(".gcode")), Some(true));

    // A second listing finds every id detailed and fetches nothing.
    printer.execute(Command::ListHistory).await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;

    let cmds = commands_seen(&mut seen);
    assert_eq!(cmds.iter().filter(|c| **c == 320).count(), 2);
    assert_eq!(cmds.iter().filter(|c| **c == 321).count(), 1, "{cmds:?}");

    printer.disconnect().await;
}

#[tokio::test]
async fn video_url_is_returned_and_cached() {
    let (port, _seen) = spawn_ws_printer().await;
    let printer = ws_printer(port);
    printer.connect().await.unwrap();

    let result = printer.execute(Command::SetVideo { enable: true }).await.unwrap();
    let CommandResult::VideoUrl(Some(url)) = result else {
        panic!("expected a video url");
    };
    assert_eq!(url, "http://127.0.0.1:3031/video");
    assert_eq!(printer.video_url().as_deref().map(String::as_str), Some(url.as_str()));

    printer.disconnect().await;
}

#[tokio::test]
async fn parameters_are_clamped_on_the_wire_and_rejections_surface() {
    let (port, mut seen) = spawn_ws_printer().await;
    let printer = ws_printer(port);
    printer.connect().await.unwrap();

    printer
        .execute(Command::SetFanSpeed { fan: Fan::Model, percent: 300 })
        .await
        .unwrap();
    let request = loop {
        let request = seen.recv().await.unwrap();
        if request["Data"]["Cmd"] == 403 {
            break request;
        }
    };
    assert_eq!(request["Data"]["Cmd"], 403);
    assert_eq!(request["Data"]["Data"]["TargetFanSpeed"]["ModelFan"], 100);

    let err = printer.execute(Command::Pause).await.unwrap_err();
    assert!(matches!(err, CoreError::Rejected { ack: 3, .. }), "got {err:?}");
    assert!(printer.is_connected(), "a rejection keeps the session");

    printer.disconnect().await;
}

#[tokio::test]
async fn unreachable_printer_fails_the_connect() {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();
    drop(listener);

    let printer = ws_printer(port);
    let err = printer.connect().await.unwrap_err();
    assert!(matches!(err, CoreError::ConnectionFailed { ref host, .. } if host == "127.0.0.1"));
    assert_eq!(*printer.connection_state().borrow(), ConnectionState::Failed);
}

/// A printer that serves normally until `hangup` fires, then closes the
/// socket.
async fn spawn_hangup_ws_printer() -> (u16, oneshot::Sender<()>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let (hangup_tx, mut hangup_rx) = oneshot::channel::<()>();

    tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();
        loop {
            tokio::select! {
                _ = &mut hangup_rx => {
                    let _ = ws.close(None).await;
                    return;
                }
                message = ws.next() => {
                    let Some(Ok(Message::Text(text))) = message else { return };
                    if text.as_str() == "ping" {
                        continue;
                    }
                    let request: Value = serde_json::from_str(text.as_str()).unwrap();
                    for reply in replies(&request) {
                        if ws.send(Message::text(reply.to_string())).await.is_err() {
                            return;
                        }
                    }
                }
            }
        }
    });
    (port, hangup_tx)
}

async fn wait_for_state(printer: &Printer, wanted: ConnectionState) {
    let mut state = printer.connection_state();
    tokio::time::timeout(Duration::from_secs(3), state.wait_for(|s| *s == wanted))
        .await
        .unwrap_or_else(|_| panic!("printer never reached {wanted:?}"))
        .unwrap();
}

#[tokio::test]
async fn peer_close_moves_the_printer_to_failed() {
    let (port, hangup) = spawn_hangup_ws_printer().await;
    let printer = ws_printer(port);
    printer.connect().await.unwrap();
    assert!(printer.is_connected());

    hangup.send(()).unwrap();
    wait_for_state(&printer, ConnectionState::Failed).await;

    assert!(!printer.is_connected());
    assert!(matches!(
        printer.execute(Command::RefreshStatus).await,
        Err(CoreError::NotConnected)
    ));
}

// ── Fake inverted-MQTT printer ──────────────────────────────────────

struct FakeCc2 {
    /// Deltas to publish on the status topic, as `(seq, delta)`.
    pushes: mpsc::UnboundedSender<(u64, Value)>,
    /// Every RPC method the printer received.
    methods: mpsc::UnboundedReceiver<u64>,
    /// Cleared to stop answering heartbeat PINGs.
    answer_pings: Arc<AtomicBool>,
}

async fn spawn_cc2_printer(port: u16) -> FakeCc2 {
    let mut options = MqttOptions::new("cc2-printer", "127.0.0.1", port);
    options.set_keep_alive(Duration::from_secs(30));
    let (client, mut eventloop) = AsyncClient::new(options, 16);
    client
        .subscribe("elegoo/SN1/api_register", QoS::AtMostOnce)
        .await
        .unwrap();

    let (push_tx, mut push_rx) = mpsc::unbounded_channel::<(u64, Value)>();
    let (method_tx, method_rx) = mpsc::unbounded_channel();
    let (ready_tx, ready_rx) = oneshot::channel();
    let answer_pings = Arc::new(AtomicBool::new(true));
    let pings = Arc::clone(&answer_pings);

    tokio::spawn(async move {
        let mut ready = Some(ready_tx);
        loop {
            tokio::select! {
                event = eventloop.poll() => {
                    let Ok(event) = event else { break };
                    match event {
                        Event::Incoming(MqttPacket::SubAck(_)) => {
                            if let Some(tx) = ready.take() {
                                let _ = tx.send(());
                            }
                        }
                        Event::Incoming(MqttPacket::Publish(publish)) => {
                            let body: Value = serde_json::from_slice(&publish.payload).unwrap();
                            if let Some(method) = body["method"].as_u64() {
                                let _ = method_tx.send(method);
                            }
                            answer_cc2(&client, &publish.topic, &body, pings.load(Ordering::Relaxed));
                        }
                        _ => {}
                    }
                }
                Some((seq, delta)) = push_rx.recv() => {
                    let push = json!({ "id": seq, "method": 6000, "result": delta });
                    client
                        .try_publish("elegoo/SN1/api_status", QoS::AtMostOnce, false, push.to_string())
                        .unwrap();
                }
            }
        }
    });

    tokio::time::timeout(Duration::from_secs(2), ready_rx)
        .await
        .unwrap()
        .unwrap();
    FakeCc2 {
        pushes: push_tx,
        methods: method_rx,
        answer_pings,
    }
}

fn answer_cc2(client: &AsyncClient, topic: &str, body: &Value, answer_pings: bool) {
    if topic == "elegoo/SN1/api_register" {
        let client_id = body["client_id"].as_str().unwrap().to_owned();
        client
            .try_subscribe(format!("elegoo/SN1/{client_id}/api_request"), QoS::AtMostOnce)
            .unwrap();
        let reply = json!({ "client_id": client_id, "error": "ok" });
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
        if !answer_pings {
            return;
        }
        client
            .try_publish(response_topic, QoS::AtMostOnce, false, r#"{"type":"PONG"}"#)
            .unwrap();
        return;
    }

    let result = match body["method"].as_u64().unwrap() {
        1002 => json!({
            "error_code": 0,
            "print_status": { "state": "printing", "filename": "part.gcode",
                              "current_layer": 10, "total_layer": 100,
                              "print_duration": 60, "total_duration": 600 },
            "extruder": { "temperature": 200.0, "target": 210.0 },
            "heater_bed": { "temperature": 60.0, "target": 60.0 }
        }),
        1001 => json!({ "error_code": 0, "hostname": "Carbon 2", "machine_model": "Centauri Carbon 2", "sn": "SN1" }),
        _ => json!({ "error_code": 0 }),
    };
    let reply = json!({ "id": body["id"], "method": body["method"], "result": result });
    client
        .try_publish(response_topic, QoS::AtMostOnce, false, reply.to_string())
        .unwrap();
}

async fn start_broker() -> BrokerHandle {
    BrokerHandle::start(&BrokerConfig {
        bind: IpAddr::V4(Ipv4Addr::LOCALHOST),
        port: 0,
        ..BrokerConfig::default()
    })
    .await
    .unwrap()
}

fn cc2_printer(port: u16) -> Printer {
    let device = Device::new("SN1", "127.0.0.1", "Centauri Carbon 2", TransportKind::MqttInverted);
    Printer::new(
        PrinterConfig::new(device)
            .with_port(port)
            .with_command_timeout(Duration::from_secs(2)),
    )
}

async fn next_method(methods: &mut mpsc::UnboundedReceiver<u64>, wanted: u64) {
    tokio::time::timeout(Duration::from_secs(2), async {
        while let Some(method) = methods.recv().await {
            if method == wanted {
                return;
            }
        }
    })
    .await
    .unwrap();
}

// ── Inverted-MQTT printer tests ─────────────────────────────────────

#[tokio::test]
async fn cc2_deltas_merge_onto_the_full_status() {
    let broker = start_broker().await;
    let mut fake = spawn_cc2_printer(broker.port()).await;
    let printer = cc2_printer(broker.port());

    printer.connect().await.unwrap();
    next_method(&mut fake.methods, 1002).await;

    let mut status = printer.status_stream();
    fake.pushes
        .send((1, json!({ "extruder": { "temperature": 210.0 }, "print_status": { "current_layer": 20 } })))
        .unwrap();

    let snap = tokio::time::timeout(Duration::from_secs(2), async {
        loop {
            let snap = status.changed().await.unwrap();
            if snap.print.current_layer == 20 {
                return snap;
            }
        }
    })
    .await
    .unwrap();

    assert_eq!(snap.temperatures.nozzle.unwrap().current, 210.0);
    assert_eq!(snap.temperatures.bed.unwrap().current, 60.0, "untouched groups survive");
    assert_eq!(snap.print.filename.as_deref(), Some("part.gcode"));
    assert_eq!(snap.print.percent_complete, 20.0);
    assert_eq!(snap.print.total_time_ms, 600_000);
    assert_eq!(printer.attributes().unwrap().machine_name, "Centauri Carbon 2");

    printer.disconnect().await;
}

#[tokio::test]
async fn cc2_sequence_gaps_trigger_a_full_status_resync() {
    let broker = start_broker().await;
    let mut fake = spawn_cc2_printer(broker.port()).await;
    let printer = cc2_printer(broker.port());

    printer.connect().await.unwrap();
    next_method(&mut fake.methods, 1002).await;

    // The first delta continues the baseline; the next three are gaps.
    for seq in [5, 9, 13, 17] {
        fake.pushes.send((seq, json!({ "led": { "status": 1 } }))).unwrap();
    }
    next_method(&mut fake.methods, 1002).await;

    printer.disconnect().await;
}

#[tokio::test]
async fn cc2_commands_use_rpc_methods() {
    let broker = start_broker().await;
    let mut fake = spawn_cc2_printer(broker.port()).await;
    let printer = cc2_printer(broker.port());
    printer.connect().await.unwrap();

    printer
        .execute(Command::SetBedTemp { celsius: 500.0 })
        .await
        .unwrap();
    next_method(&mut fake.methods, 1027).await;

    let result = printer.execute(Command::RefreshStatus).await.unwrap();
    let CommandResult::Status(Some(snap)) = result else {
        panic!("expected status");
    };
    assert_eq!(snap.print.current_layer, 10);

    printer.disconnect().await;
}

#[tokio::test]
async fn cc2_missing_pongs_move_the_printer_to_failed() {
    let broker = start_broker().await;
    let fake = spawn_cc2_printer(broker.port()).await;
    let device = Device::new("SN1", "127.0.0.1", "Centauri Carbon 2", TransportKind::MqttInverted);
    let mut config = PrinterConfig::new(device)
        .with_port(broker.port())
        .with_command_timeout(Duration::from_secs(2));
    config.heartbeat_interval = Duration::from_millis(100);
    config.pong_timeout = Duration::from_millis(300);
    let printer = Printer::new(config);

    printer.connect().await.unwrap();
    assert!(printer.is_connected());

    fake.answer_pings.store(false, Ordering::Relaxed);
    wait_for_state(&printer, ConnectionState::Failed).await;

    assert!(!printer.is_connected());
    assert!(matches!(
        printer.execute(Command::Pause).await,
        Err(CoreError::NotConnected)
    ));

    // A fresh session replaces the dead one.
    fake.answer_pings.store(true, Ordering::Relaxed);
    printer.connect().await.unwrap();
    assert_eq!(*printer.connection_state().borrow(), ConnectionState::Connected);
    printer.disconnect().await;
}
