#![allow(clippy::unwrap_used)]
// HTTP surface: routing, passthrough, rewriting, upstream failure, REST API.

use std::net::SocketAddr;
use std::sync::Arc;

use pretty_assertions::assert_eq;
use serde_json::{Value, json};
use tokio::net::TcpListener;
use wiremock::matchers::{body_string_contains, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use sdcp_api::{BrokerConfig, BrokerManager};
use sdcp_core::{Device, Printer, PrinterConfig, TransportKind};
use sdcp_gateway::{Gateway, GatewayConfig};

fn gateway_with(config: GatewayConfig) -> Gateway {
    Gateway::new(
        GatewayConfig {
            external_host: Some("gateway.lan".into()),
            ..config
        },
        Arc::new(BrokerManager::new(BrokerConfig::default())),
    )
    .unwrap()
}

fn gateway() -> Gateway {
    gateway_with(GatewayConfig::default())
}

fn printer_at(id: &str, addr: SocketAddr) -> Printer {
    Printer::new(
        PrinterConfig::new(Device::new(
            id,
            addr.ip().to_string(),
            "Centauri Carbon",
            TransportKind::WebSocket,
        ))
        .with_port(addr.port()),
    )
}

fn register(gateway: &Gateway, id: &str, addr: SocketAddr) {
    gateway
        .registry()
        .insert(printer_at(id, addr))
        .map_err(|_| "duplicate")
        .unwrap();
}

async fn serve(gateway: &Gateway) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let gateway = gateway.clone();
    tokio::spawn(async move { gateway.serve_http(listener).await.unwrap() });
    addr
}

async fn dead_port() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap()
}

#[tokio::test]
async fn path_prefix_routes_and_assets_are_rewritten() {
    let mb1 = MockServer::start().await;
    let mb2 = MockServer::start().await;
    let device = mb2.address();
    let page = format!("<script>new WebSocket('ws://{device}/websocket')</script>");
    Mock::given(method("GET"))
        .and(path("/index.html"))
        .respond_with(ResponseTemplate::new(200).set_body_raw(page, "text/html"))
        .expect(1)
        .mount(&mb2)
        .await;
    Mock::given(method("GET")).respond_with(ResponseTemplate::new(500)).expect(0).mount(&mb1).await;

    let gateway = gateway();
    register(&gateway, "MB1", *mb1.address());
    register(&gateway, "MB2", *device);
    let addr = serve(&gateway).await;

    let response = reqwest::get(format!("http://{addr}/printer/MB2/index.html")).await.unwrap();
    assert_eq!(response.status(), 200);
    assert_eq!(
        response.text().await.unwrap(),
        "<script>new WebSocket('ws://gateway.lan:3030/websocket?id=MB2')</script>"
    );
}

#[tokio::test]
async fn query_id_beats_path_id() {
    let mb1 = MockServer::start().await;
    let mb2 = MockServer::start().await;
    Mock::given(path("/printer/MB1/status"))
        .respond_with(ResponseTemplate::new(200).set_body_string("from MB2"))
        .mount(&mb2)
        .await;

    let gateway = gateway();
    register(&gateway, "MB1", *mb1.address());
    register(&gateway, "MB2", *mb2.address());
    let addr = serve(&gateway).await;

    let body = reqwest::get(format!("http://{addr}/printer/MB1/status?id=MB2"))
        .await
        .unwrap()
        .text()
        .await
        .unwrap();
    assert_eq!(body, "from MB2");
}

#[tokio::test]
async fn upload_body_streams_through() {
    let mb1 = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/uploadFile/upload"))
        .and(body_string_contains("G1 X10 Y10"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "code": "000000" })))
        .expect(1)
        .mount(&mb1)
        .await;

    let gateway = gateway();
    register(&gateway, "MB1", *mb1.address());
    let addr = serve(&gateway).await;

    let body = "--x\r\nContent-Disposition: form-data; name=\"File\"; filename=\"a.gcode\"\r\n\r\nG1 X10 Y10\r\n--x--\r\n";
    let response = reqwest::Client::new()
        .post(format!("http://{addr}/uploadFile/upload?mainboard_id=MB1"))
        .header("content-type", "multipart/form-data; boundary=x")
        .body(body)
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    let reply: Value = response.json().await.unwrap();
    assert_eq!(reply["code"], "000000");
}

#[tokio::test]
async fn unreachable_printer_is_bad_gateway() {
    let gateway = gateway();
    register(&gateway, "MB9", dead_port().await);
    let addr = serve(&gateway).await;

    let response = reqwest::get(format!("http://{addr}/index.html")).await.unwrap();
    assert_eq!(response.status(), 502);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body, json!({ "error": "upstream unavailable", "device": "MB9" }));
}

#[tokio::test]
async fn empty_registry_is_unavailable() {
    let gateway = gateway();
    let addr = serve(&gateway).await;
    let response = reqwest::get(format!("http://{addr}/index.html")).await.unwrap();
    assert_eq!(response.status(), 503);
}

#[tokio::test]
async fn video_surface_passes_mjpeg_untouched() {
    let camera = MockServer::start().await;
    let frame = b"--frame\r\nContent-Type: image/jpeg\r\n\r\n\xff\xd8\xff\xd9\r\n".to_vec();
    Mock::given(method("GET"))
        .and(path("/video"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_raw(frame.clone(), "multipart/x-mixed-replace; boundary=frame"),
        )
        .mount(&camera)
        .await;

    let gateway = gateway_with(GatewayConfig {
        upstream_video_port: camera.address().port(),
        ..GatewayConfig::default()
    });
    register(&gateway, "MB1", dead_port().await);
    register(&gateway, "MB2", *camera.address());

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let serving = gateway.clone();
    tokio::spawn(async move { serving.serve_video(listener).await.unwrap() });

    let response = reqwest::get(format!("http://{addr}/printer/MB2/video")).await.unwrap();
    assert_eq!(response.status(), 200);
    assert_eq!(response.bytes().await.unwrap().to_vec(), frame);
}

// ── REST API ─────────────────────────────────────────────────────────

#[tokio::test]
async fn api_lists_printers_in_registration_order() {
    let gateway = gateway();
    register(&gateway, "MB2", dead_port().await);
    register(&gateway, "MB1", dead_port().await);
    let addr = serve(&gateway).await;

    let list: Value = reqwest::get(format!("http://{addr}/api/printers"))
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let ids: Vec<&str> = list
        .as_array()
        .unwrap()
        .iter()
        .map(|p| p["id"].as_str().unwrap())
        .collect();
    assert_eq!(ids, vec!["MB2", "MB1"]);
    assert_eq!(list[0]["transport"], "websocket");
    assert_eq!(list[0]["state"], "disconnected");
}

#[tokio::test]
async fn api_status_before_first_push_is_null() {
    let gateway = gateway();
    register(&gateway, "MB1", dead_port().await);
    let addr = serve(&gateway).await;

    let response = reqwest::get(format!("http://{addr}/api/printers/MB1/status")).await.unwrap();
    assert_eq!(response.status(), 200);
    assert_eq!(response.json::<Value>().await.unwrap(), Value::Null);

    let response = reqwest::get(format!("http://{addr}/api/printers/ghost/status")).await.unwrap();
    assert_eq!(response.status(), 404);
}

#[tokio::test]
async fn api_command_on_disconnected_printer_is_unavailable() {
    let gateway = gateway();
    register(&gateway, "MB1", dead_port().await);
    let addr = serve(&gateway).await;

    let response = reqwest::Client::new()
        .post(format!("http://{addr}/api/printers/MB1/command"))
        .json(&json!({ "command": "pause" }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 503);
}

#[tokio::test]
async fn api_unregister_removes_printer() {
    let gateway = gateway();
    register(&gateway, "MB1", dead_port().await);
    let addr = serve(&gateway).await;
    let client = reqwest::Client::new();

    let response = client
        .delete(format!("http://{addr}/api/printers/MB1"))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 204);
    assert!(gateway.registry().is_empty());

    let response = client
        .delete(format!("http://{addr}/api/printers/MB1"))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 404);
}
