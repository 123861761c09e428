#![allow(clippy::unwrap_used)]
// Discovery runs against canned UDP responders on loopback.

use std::net::{IpAddr, Ipv4Addr, UdpSocket};
use std::time::Duration;

use sdcp_api::discovery::{DiscoveredTransport, DiscoveryConfig, discover};

/// Answer the first datagram with every reply in `replies`.
fn spawn_responder(replies: Vec<Vec<u8>>) -> (u16, std::thread::JoinHandle<Vec<u8>>) {
    let socket = UdpSocket::bind("127.0.0.1:0").unwrap();
    let port = socket.local_addr().unwrap().port();
    socket
        .set_read_timeout(Some(Duration::from_secs(5)))
        .unwrap();

    let handle = std::thread::spawn(move || {
        let mut buf = [0u8; 512];
        let (len, from) = socket.recv_from(&mut buf).unwrap();
        for reply in replies {
            socket.send_to(&reply, from).unwrap();
        }
        buf[..len].to_vec()
    });
    (port, handle)
}

fn loopback_config(sdcp_port: u16, cc2_port: u16) -> DiscoveryConfig {
    DiscoveryConfig {
        target: IpAddr::V4(Ipv4Addr::LOCALHOST),
        sdcp_port,
        cc2_port,
        timeout: Duration::from_millis(600),
        sdcp: true,
        cc2: true,
        skip_self_proxy: false,
    }
}

#[tokio::test]
async fn collects_both_families_and_skips_garbage_and_duplicates() {
    let (sdcp_port, sdcp_probe) = spawn_responder(vec![
        br#"{"Id":"a","Data":{"Name":"Saturn","MachineName":"Saturn 4 Ultra","MainboardIP":"127.0.0.1","MainboardID":"MB1","ProtocolVersion":"V3.0.0"}}"#.to_vec(),
        br#"{"Name":"Mars","MachineName":"Mars 5","MainboardID":"MB2","ProtocolVersion":"V1.0.0"}"#.to_vec(),
        b"garbage".to_vec(),
        br#"{"Id":"b","Data":{"Name":"Saturn again","MainboardID":"MB1"}}"#.to_vec(),
    ]);
    let (cc2_port, cc2_probe) = spawn_responder(vec![
        br#"{"id":0,"result":{"host_name":"Carbon","machine_model":"Centauri Carbon 2","sn":"SN9","token_status":0,"lan_status":1}}"#.to_vec(),
    ]);

    let devices = discover(loopback_config(sdcp_port, cc2_port)).await.unwrap();

    assert_eq!(sdcp_probe.join().unwrap(), b"M99999");
    let cc2_probe: serde_json::Value = serde_json::from_slice(&cc2_probe.join().unwrap()).unwrap();
    assert_eq!(cc2_probe["method"], 7000);

    assert_eq!(devices.len(), 3, "{devices:#?}");
    let mb1 = devices.iter().find(|d| d.id == "MB1").unwrap();
    assert_eq!(mb1.name, "Saturn", "first advert wins");
    assert_eq!(mb1.transport, DiscoveredTransport::WebSocket);

    let mb2 = devices.iter().find(|d| d.id == "MB2").unwrap();
    assert_eq!(mb2.transport, DiscoveredTransport::MqttStandard);
    assert_eq!(mb2.address, IpAddr::V4(Ipv4Addr::LOCALHOST));

    let sn9 = devices.iter().find(|d| d.id == "SN9").unwrap();
    assert_eq!(sn9.transport, DiscoveredTransport::MqttInverted);
    assert_eq!(sn9.model, "Centauri Carbon 2");
}

#[tokio::test]
async fn silent_network_yields_nothing() {
    let quiet = UdpSocket::bind("127.0.0.1:0").unwrap();
    let port = quiet.local_addr().unwrap().port();

    let mut config = loopback_config(port, port);
    config.cc2 = false;
    config.timeout = Duration::from_millis(200);
    let devices = discover(config).await.unwrap();
    assert!(devices.is_empty());
}
