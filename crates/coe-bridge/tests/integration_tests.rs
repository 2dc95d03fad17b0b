//! End-to-end tests of the CoE bridge over loopback UDP
//!
//! A plain `UdpSocket` plays the CMI: it sends raw pages to the bridge and
//! receives the pages the bridge writes.

use coe_bridge::test_utils::{analog_frame_v1, analog_frame_v2, digital_frame};
use coe_bridge::{
    AnalogValue, BridgeConfigBuilder, CoeBridge, CoeVersion, DigitalValue, MeasureType,
    PeerConfig, PublishedUpdate, RecordingPublisher,
};
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UdpSocket;

const WAIT: Duration = Duration::from_secs(2);

fn loopback() -> IpAddr {
    "127.0.0.1".parse().unwrap()
}

/// A fake CMI socket on loopback
async fn cmi() -> (UdpSocket, SocketAddr) {
    let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let addr = socket.local_addr().unwrap();
    (socket, addr)
}

async fn recv_page(socket: &UdpSocket) -> Vec<u8> {
    let mut buf = [0u8; 64];
    let (len, _) = tokio::time::timeout(WAIT, socket.recv_from(&mut buf))
        .await
        .expect("no datagram from bridge")
        .unwrap();
    buf[..len].to_vec()
}

fn peer_at(addr: SocketAddr, version: CoeVersion) -> PeerConfig {
    PeerConfig {
        name: "cmi-test".to_string(),
        port: addr.port(),
        version,
        ..PeerConfig::new(addr.ip())
    }
}

async fn started_bridge(
    builder: BridgeConfigBuilder,
) -> (Arc<CoeBridge>, Arc<RecordingPublisher>, SocketAddr) {
    let publisher = RecordingPublisher::shared();
    let config = builder.listen_addr("127.0.0.1:0".parse().unwrap()).build();
    let bridge = CoeBridge::new(config, publisher.clone()).await.unwrap();
    bridge.start().await.unwrap();
    let addr = bridge.local_addr().unwrap();
    (bridge, publisher, addr)
}

#[tokio::test]
async fn test_inbound_analog_temperature() {
    let (bridge, publisher, addr) = started_bridge(BridgeConfigBuilder::new()).await;
    let (socket, _) = cmi().await;

    socket
        .send_to(&analog_frame_v1(3, 2, [250, 0, 0, 0], [1, 0, 0, 0]), addr)
        .await
        .unwrap();

    assert!(publisher.wait_for(1, WAIT).await);
    let expected = AnalogValue::new(3, 5, 25.0, MeasureType::Temperature);
    assert_eq!(
        publisher.updates(),
        vec![PublishedUpdate::Sensor {
            source: loopback(),
            value: expected
        }]
    );
    assert_eq!(bridge.inbound_analog(3, 5), expected);
    assert!(bridge.inbound_analog(3, 6).is_unknown());

    bridge.shutdown().await;
}

#[tokio::test]
async fn test_inbound_digital_change_detection() {
    let (bridge, publisher, addr) = started_bridge(BridgeConfigBuilder::new()).await;
    let (socket, _) = cmi().await;

    // First page: every bit is new
    socket.send_to(&digital_frame(1, 0, 0x8000), addr).await.unwrap();
    assert!(publisher.wait_for(16, WAIT).await);
    let states = publisher.binary_updates();
    assert_eq!(states.len(), 16);
    assert_eq!(states[0], DigitalValue::new(1, 0, true));
    assert!(states[1..].iter().all(|value| !value.state));

    // Same page again, then one flipped bit
    socket.send_to(&digital_frame(1, 0, 0x8000), addr).await.unwrap();
    socket.send_to(&digital_frame(1, 0, 0xC000), addr).await.unwrap();
    assert!(publisher.wait_for(17, WAIT).await);
    tokio::time::sleep(Duration::from_millis(100)).await;

    let states = publisher.binary_updates();
    assert_eq!(states.len(), 17);
    assert_eq!(states[16], DigitalValue::new(1, 1, true));
    assert!(bridge.inbound_digital(1, 1).state);

    bridge.shutdown().await;
}

#[tokio::test]
async fn test_inbound_digital_page_nine_stride() {
    let (bridge, publisher, addr) = started_bridge(BridgeConfigBuilder::new()).await;
    let (socket, _) = cmi().await;

    socket.send_to(&digital_frame(2, 9, 0x4000), addr).await.unwrap();
    assert!(publisher.wait_for(16, WAIT).await);
    assert_eq!(bridge.inbound_digital(2, 37), DigitalValue::new(2, 37, true));

    bridge.shutdown().await;
}

#[tokio::test]
async fn test_malformed_datagrams_dropped() {
    let (bridge, publisher, addr) = started_bridge(BridgeConfigBuilder::new()).await;
    let (socket, _) = cmi().await;

    socket.send_to(&[3, 2, 250], addr).await.unwrap();
    let mut bad_page = digital_frame(1, 0, 0xFFFF);
    bad_page[1] = 10;
    socket.send_to(&bad_page, addr).await.unwrap();
    socket
        .send_to(&analog_frame_v1(3, 1, [10, 0, 0, 0], [8, 0, 0, 0]), addr)
        .await
        .unwrap();

    assert!(publisher.wait_for(1, WAIT).await);
    assert_eq!(
        publisher.sensor_updates(),
        vec![AnalogValue::new(3, 1, 1.0, MeasureType::Percent)]
    );

    let stats = bridge.stats();
    assert_eq!(stats.datagrams_received, 3);
    assert_eq!(stats.decode_errors, 2);
    assert!(bridge.is_running());

    bridge.shutdown().await;
}

#[tokio::test]
async fn test_v2_peer_decoding() {
    let (socket, cmi_addr) = cmi().await;
    let (bridge, publisher, addr) = started_bridge(
        BridgeConfigBuilder::new().peer(peer_at(cmi_addr, CoeVersion::V2)),
    )
    .await;

    socket
        .send_to(
            &analog_frame_v2(6, 3, [0, 0, 123_456, 0], [0, 0, 11, 0]),
            addr,
        )
        .await
        .unwrap();

    assert!(publisher.wait_for(1, WAIT).await);
    assert_eq!(
        bridge.inbound_analog(6, 11),
        AnalogValue::new(6, 11, 12345.6, MeasureType::KilowattHours)
    );

    bridge.shutdown().await;
}

#[tokio::test]
async fn test_outbound_switch_write() {
    let (socket, cmi_addr) = cmi().await;
    let (bridge, _publisher, _) =
        started_bridge(BridgeConfigBuilder::new().peer(peer_at(cmi_addr, CoeVersion::V1))).await;

    let bytes = bridge
        .write_switch(cmi_addr.ip(), 30, 3, true)
        .await
        .unwrap();
    assert_eq!(&bytes[..4], &[30, 0, 0b0010_0000, 0]);

    let page = recv_page(&socket).await;
    assert_eq!(page, bytes);
    assert_eq!(page.len(), 15);
    assert_eq!(
        bridge.outbound_digital(cmi_addr.ip(), 30, 3).unwrap(),
        DigitalValue::new(30, 3, true)
    );

    bridge.shutdown().await;
}

#[tokio::test]
async fn test_outbound_number_write() {
    let (socket, cmi_addr) = cmi().await;
    let (bridge, _publisher, _) =
        started_bridge(BridgeConfigBuilder::new().peer(peer_at(cmi_addr, CoeVersion::V1))).await;

    bridge
        .write_number(cmi_addr.ip(), 30, 2, 21.5, MeasureType::Temperature)
        .await
        .unwrap();

    let page = recv_page(&socket).await;
    assert_eq!(page.len(), 14);
    assert_eq!(&page[..2], &[30, 1]);
    assert_eq!(&page[4..6], &215i16.to_le_bytes());
    assert_eq!(&page[10..], &[0, 1, 0, 0]);

    // Out-of-range values are refused and nothing is sent
    assert!(bridge
        .write_number(cmi_addr.ip(), 30, 2, 99_999.0, MeasureType::Temperature)
        .await
        .is_err());
    assert_eq!(bridge.stats().datagrams_sent, 1);

    bridge.shutdown().await;
}

#[tokio::test]
async fn test_periodic_resend() {
    let (socket, cmi_addr) = cmi().await;
    let (bridge, _publisher, _) = started_bridge(
        BridgeConfigBuilder::new()
            .resend_interval(Duration::from_millis(150))
            .peer(peer_at(cmi_addr, CoeVersion::V1)),
    )
    .await;

    let sent = bridge
        .write_switch(cmi_addr.ip(), 5, 20, true)
        .await
        .unwrap();
    assert_eq!(recv_page(&socket).await, sent);

    // Written pages are resent unchanged on every tick
    assert_eq!(recv_page(&socket).await, sent);
    assert_eq!(recv_page(&socket).await, sent);
    assert!(bridge.stats().resends >= 1);

    bridge.shutdown().await;
}

#[tokio::test]
async fn test_manual_resend_is_idempotent() {
    let (socket, cmi_addr) = cmi().await;
    let (bridge, _publisher, _) =
        started_bridge(BridgeConfigBuilder::new().peer(peer_at(cmi_addr, CoeVersion::V1))).await;

    bridge.write_switch(cmi_addr.ip(), 1, 1, true).await.unwrap();
    bridge
        .write_number(cmi_addr.ip(), 1, 1, 5.0, MeasureType::Liters)
        .await
        .unwrap();
    recv_page(&socket).await;
    recv_page(&socket).await;

    let mut rounds = Vec::new();
    for _ in 0..2 {
        assert_eq!(bridge.resend_all(cmi_addr.ip()).await.unwrap(), 2);
        rounds.push(vec![recv_page(&socket).await, recv_page(&socket).await]);
    }
    assert_eq!(rounds[0], rounds[1]);
    assert_eq!(rounds[0][0][1], 0);
    assert_eq!(rounds[0][1][1], 1);

    bridge.shutdown().await;
}

#[tokio::test]
async fn test_unreachable_peer_does_not_fail_writes() {
    let closed = {
        let (socket, addr) = cmi().await;
        drop(socket);
        addr
    };
    let (bridge, publisher, addr) =
        started_bridge(BridgeConfigBuilder::new().peer(peer_at(closed, CoeVersion::V1))).await;

    for channel in 0..4 {
        assert!(bridge
            .write_switch(closed.ip(), 1, channel, true)
            .await
            .is_ok());
    }
    bridge.resend_all_peers().await;

    // The bridge still receives
    let (socket, _) = cmi().await;
    socket.send_to(&digital_frame(9, 0, 0), addr).await.unwrap();
    assert!(publisher.wait_for(16, WAIT).await);

    bridge.shutdown().await;
}

#[tokio::test]
async fn test_availability_follows_traffic() {
    let (socket, cmi_addr) = cmi().await;
    let (bridge, publisher, addr) =
        started_bridge(BridgeConfigBuilder::new().peer(peer_at(cmi_addr, CoeVersion::V1))).await;

    assert_eq!(bridge.publish_availability().await, 1);
    assert_eq!(
        publisher.updates(),
        vec![PublishedUpdate::Availability {
            peer: loopback(),
            online: false
        }]
    );

    socket
        .send_to(&analog_frame_v1(1, 1, [1, 0, 0, 0], [1, 0, 0, 0]), addr)
        .await
        .unwrap();
    assert!(publisher.wait_for(2, WAIT).await);
    publisher.clear();

    bridge.publish_availability().await;
    assert_eq!(
        publisher.updates(),
        vec![PublishedUpdate::Availability {
            peer: loopback(),
            online: true
        }]
    );
    let statuses = bridge.peer_statuses();
    assert!(statuses[0].online);
    assert!(statuses[0].last_seen.is_some());

    bridge.shutdown().await;
}

#[tokio::test]
async fn test_scheduled_availability() {
    let (_socket, cmi_addr) = cmi().await;
    let (bridge, publisher, _) = started_bridge(
        BridgeConfigBuilder::new()
            .availability_interval(Duration::from_millis(100))
            .peer(peer_at(cmi_addr, CoeVersion::V1)),
    )
    .await;

    assert!(publisher.wait_for(2, WAIT).await);
    assert!(publisher
        .updates()
        .iter()
        .all(|update| matches!(update, PublishedUpdate::Availability { online: false, .. })));

    bridge.shutdown().await;
}

#[tokio::test]
async fn test_publisher_failures_counted() {
    let (bridge, publisher, addr) = started_bridge(BridgeConfigBuilder::new()).await;
    publisher.set_failing(true);

    let (socket, _) = cmi().await;
    socket
        .send_to(&analog_frame_v1(4, 1, [7, 8, 0, 0], [1, 1, 0, 0]), addr)
        .await
        .unwrap();
    assert!(publisher.wait_for(2, WAIT).await);
    bridge.shutdown().await;

    let stats = bridge.stats();
    assert_eq!(stats.analog_updates, 2);
    assert_eq!(stats.publish_errors, 2);
    assert_eq!(stats.events_published, 0);
}

#[tokio::test]
async fn test_shutdown_stops_receiving() {
    let (bridge, publisher, addr) = started_bridge(BridgeConfigBuilder::new()).await;
    bridge.shutdown().await;
    assert!(!bridge.is_running());

    let (socket, _) = cmi().await;
    socket.send_to(&digital_frame(1, 0, 0), addr).await.unwrap();
    assert!(!publisher.wait_for(1, Duration::from_millis(200)).await);

    // Shutdown twice is harmless
    tokio::time::timeout(WAIT, bridge.shutdown()).await.unwrap();
}
