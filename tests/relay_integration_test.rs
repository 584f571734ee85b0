//! Hub, registry and HTTP surface exercised together against the synthetic
//! driver. No sockets are opened here; see `websocket_test.rs` for that.

use axum::body::Body;
use axum::http::{Request, StatusCode};
use nodeflow::bridge::{AudioOutput, AudioOutputFactory, BridgeTap, VirtualBridge, VirtualCameraSink};
use nodeflow::buffer::BoundedBuffer;
use nodeflow::config::{BridgeConfig, RelayConfig};
use nodeflow::device::{DeviceManager, DeviceManagerConfig, DeviceStatus, DeviceType, SyntheticDriver};
use nodeflow::errors::RelayResult;
use nodeflow::media::{encode_jpeg, MediaFrame, RawFrame};
use nodeflow::permissions::PermissionGate;
use nodeflow::relay::protocol::{
    encode_media, DeviceReply, ReplyStatus, CONNECTED_ACK, READY_REPLY, TEST_REPLY, UNAUTHORIZED_MESSAGE,
};
use nodeflow::relay::{Connection, Forwarders, Registry, RelayHub};
use nodeflow::RelayServer;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tower::ServiceExt;

fn addr(port: u16) -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], port))
}

fn hub_with(driver: SyntheticDriver) -> (RelayHub, Arc<PermissionGate>) {
    hub_sharing(Arc::new(driver))
}

fn hub_sharing(driver: Arc<SyntheticDriver>) -> (RelayHub, Arc<PermissionGate>) {
    let gate = Arc::new(PermissionGate::in_memory());
    let devices = Arc::new(DeviceManager::new(driver, DeviceManagerConfig::default()));
    let registry = Arc::new(Registry::new(8));
    (RelayHub::new(registry, gate.clone(), devices), gate)
}

fn join(hub: &RelayHub, port: u16) -> (Arc<Connection>, mpsc::Receiver<Arc<str>>) {
    let (conn, mut rx) = Connection::new(addr(port), 16);
    hub.registry.register(conn.clone()).unwrap();
    assert_eq!(rx.try_recv().unwrap().as_ref(), CONNECTED_ACK);
    (conn, rx)
}

fn reply(rx: &mut mpsc::Receiver<Arc<str>>) -> DeviceReply {
    serde_json::from_str(&rx.try_recv().unwrap()).unwrap()
}

#[tokio::test]
async fn test_hello_and_test_replies() {
    let (hub, _) = hub_with(SyntheticDriver::new());
    let (a, mut rx) = join(&hub, 5001);

    hub.dispatch_inbound(&a, r#"{"type":"hello","client":"pixel"}"#).await.unwrap();
    assert_eq!(rx.try_recv().unwrap().as_ref(), READY_REPLY);
    assert_eq!(a.client().as_deref(), Some("pixel"));

    hub.dispatch_inbound(&a, r#"{"type":"test"}"#).await.unwrap();
    assert_eq!(rx.try_recv().unwrap().as_ref(), TEST_REPLY);
}

#[tokio::test]
async fn test_media_reaches_everyone_but_sender() {
    let (hub, _) = hub_with(SyntheticDriver::new());
    let (a, mut rx_a) = join(&hub, 5001);
    let (_b, mut rx_b) = join(&hub, 5002);
    let (_c, mut rx_c) = join(&hub, 5003);

    let video = r#"{"type":"video","data":"AAAA"}"#;
    hub.dispatch_inbound(&a, video).await.unwrap();

    assert_eq!(rx_b.try_recv().unwrap().as_ref(), video);
    assert_eq!(rx_c.try_recv().unwrap().as_ref(), video);
    assert!(rx_a.try_recv().is_err());
}

#[tokio::test]
async fn test_media_is_relayed_verbatim_in_order() {
    let (hub, _) = hub_with(SyntheticDriver::new());
    let (a, _rx_a) = join(&hub, 5001);
    let (_b, mut rx_b) = join(&hub, 5002);

    let messages = [
        r#"{"type":"audio","data":[0.1,0.2],"sampleRate":48000,"extra":true}"#,
        r#"{"type":"video","data":"data:image/jpeg;base64,AAAA"}"#,
        r#"{"type":"audio","data":"AAAAAA=="}"#,
    ];
    for m in messages {
        hub.dispatch_inbound(&a, m).await.unwrap();
    }
    for m in messages {
        assert_eq!(rx_b.try_recv().unwrap().as_ref(), m);
    }
}

#[tokio::test]
async fn test_dead_peer_is_pruned_and_others_still_receive() {
    let (hub, _) = hub_with(SyntheticDriver::new());
    let (a, _rx_a) = join(&hub, 5001);
    let (_b, rx_b) = join(&hub, 5002);
    let (_c, mut rx_c) = join(&hub, 5003);
    drop(rx_b);

    hub.dispatch_inbound(&a, r#"{"type":"video","data":"AAAA"}"#).await.unwrap();

    assert!(rx_c.try_recv().is_ok());
    assert_eq!(hub.registry.connection_count(), 2);
    assert_eq!(hub.registry.stats().pruned, 1);
}

#[tokio::test]
async fn test_malformed_message_is_an_error_and_sends_nothing() {
    let (hub, _) = hub_with(SyntheticDriver::new());
    let (a, mut rx_a) = join(&hub, 5001);
    let (_b, mut rx_b) = join(&hub, 5002);

    assert!(hub.dispatch_inbound(&a, "not json").await.is_err());
    assert!(hub.dispatch_inbound(&a, r#"{"type":"teleport"}"#).await.is_err());
    assert!(rx_a.try_recv().is_err());
    assert!(rx_b.try_recv().is_err());
}

#[tokio::test]
async fn test_device_command_without_grant_is_unauthorized() {
    let (hub, _) = hub_with(SyntheticDriver::new());
    let (a, mut rx) = join(&hub, 5001);

    hub.dispatch_inbound(&a, r#"{"type":"device","command":"start","device":"webcam"}"#)
        .await
        .unwrap();
    let r = reply(&mut rx);
    assert_eq!(r.status, ReplyStatus::Error);
    assert_eq!(r.message, UNAUTHORIZED_MESSAGE);
    assert_eq!(hub.devices.status(DeviceType::Webcam), DeviceStatus::Stopped);
}

#[tokio::test]
async fn test_device_command_with_unknown_names_is_unauthorized() {
    let (hub, gate) = hub_with(SyntheticDriver::new());
    gate.grant(DeviceType::Webcam, 1.0);
    let (a, mut rx) = join(&hub, 5001);

    for text in [
        r#"{"type":"device","command":"restart","device":"webcam"}"#,
        r#"{"type":"device","command":"start","device":"printer"}"#,
        r#"{"type":"device"}"#,
    ] {
        hub.dispatch_inbound(&a, text).await.unwrap();
        assert_eq!(reply(&mut rx).message, UNAUTHORIZED_MESSAGE);
    }
}

#[tokio::test]
async fn test_granted_device_starts_and_stops() {
    let (hub, gate) = hub_with(SyntheticDriver::new());
    gate.grant(DeviceType::Speaker, 1.0);
    let (a, mut rx) = join(&hub, 5001);

    hub.dispatch_inbound(&a, r#"{"type":"device","command":"start","device":"speaker"}"#)
        .await
        .unwrap();
    let r = reply(&mut rx);
    assert_eq!(r.status, ReplyStatus::Success);
    assert_eq!(r.message, "speaker started");
    assert_eq!(hub.devices.status(DeviceType::Speaker), DeviceStatus::Running);

    hub.dispatch_inbound(&a, r#"{"type":"device","command":"stop","device":"speaker"}"#)
        .await
        .unwrap();
    assert_eq!(reply(&mut rx).message, "speaker stopped");
    assert_eq!(hub.devices.status(DeviceType::Speaker), DeviceStatus::Stopped);
}

#[tokio::test]
async fn test_hardware_failure_is_reported_to_requester() {
    let (hub, gate) = hub_with(SyntheticDriver::new().failing_open(DeviceType::Microphone));
    gate.grant(DeviceType::Microphone, 1.0);
    let (a, mut rx) = join(&hub, 5001);

    hub.dispatch_inbound(&a, r#"{"type":"device","command":"start","device":"microphone"}"#)
        .await
        .unwrap();
    let r = reply(&mut rx);
    assert_eq!(r.status, ReplyStatus::Error);
    assert!(r.message.contains("microphone"), "{}", r.message);
    assert_ne!(r.message, UNAUTHORIZED_MESSAGE);
}

#[tokio::test]
async fn test_revoked_grant_blocks_start() {
    let (hub, gate) = hub_with(SyntheticDriver::new());
    gate.grant(DeviceType::Webcam, 1.0);
    gate.revoke(DeviceType::Webcam);

    let err = hub.device_command("start", "webcam").await.unwrap_err();
    assert!(matches!(err, nodeflow::RelayError::PermissionDenied(_)));
}

fn test_server(gate: Arc<PermissionGate>) -> RelayServer {
    let mut config = RelayConfig::default();
    config.bridge.enabled = false;
    RelayServer::with_gate(config, Arc::new(SyntheticDriver::new()), gate).unwrap()
}

async fn post_device(server: &RelayServer, device: &str, body: &str) -> (StatusCode, DeviceReply) {
    let response = server
        .router()
        .oneshot(
            Request::post(format!("/api/device/{}", device))
                .header("content-type", "application/json")
                .body(Body::from(body.to_string()))
                .unwrap(),
        )
        .await
        .unwrap();
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
    (status, serde_json::from_slice(&bytes).unwrap())
}

#[tokio::test]
async fn test_http_device_endpoint_status_codes() {
    let gate = Arc::new(PermissionGate::in_memory());
    let server = test_server(gate.clone());

    let (status, r) = post_device(&server, "speaker", r#"{"command":"start"}"#).await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(r.status, ReplyStatus::Error);

    let (status, _) = post_device(&server, "printer", r#"{"command":"start"}"#).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, _) = post_device(&server, "speaker", r#"{"command":"launch"}"#).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, _) = post_device(&server, "speaker", "{").await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    gate.grant(DeviceType::Speaker, 1.0);
    let (status, r) = post_device(&server, "speaker", r#"{"command":"start"}"#).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(r.message, "speaker started");

    let (status, r) = post_device(&server, "speaker", r#"{"command":"stop"}"#).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(r.message, "speaker stopped");
}

#[tokio::test]
async fn test_http_status_and_health() {
    let gate = Arc::new(PermissionGate::in_memory());
    gate.grant(DeviceType::Webcam, 2.0);
    let server = test_server(gate);

    for (uri, key) in [("/health", "status"), ("/api/status", "devices"), ("/api/permissions", "")] {
        let response = server
            .router()
            .oneshot(Request::get(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK, "{}", uri);
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let value: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        if key.is_empty() {
            let grants = value.as_array().unwrap();
            assert_eq!(grants.len(), 1);
            assert_eq!(grants[0]["device"], "webcam");
        } else {
            assert!(value.get(key).is_some(), "{} missing {}", uri, key);
        }
    }
}

#[tokio::test]
async fn test_status_report_lists_every_device() {
    let server = test_server(Arc::new(PermissionGate::in_memory()));
    let report = server.state().status_report();
    assert_eq!(report.devices.len(), DeviceType::ALL.len());
    assert_eq!(report.driver, "synthetic");
    assert!(report.bridge.is_none());
    assert!(report.connections.is_empty());
}

#[test]
fn test_stuck_device_stop_is_bounded() {
    let driver = Arc::new(SyntheticDriver::new().stuck(DeviceType::Webcam));
    let config = DeviceManagerConfig {
        join_timeout: Duration::from_millis(200),
        ..DeviceManagerConfig::default()
    };
    let devices = DeviceManager::new(driver.clone(), config);
    devices.start(DeviceType::Webcam).unwrap();
    std::thread::sleep(Duration::from_millis(50));

    let started = std::time::Instant::now();
    let _ = devices.stop(DeviceType::Webcam);
    assert!(started.elapsed() < Duration::from_secs(2));
    assert_eq!(devices.status(DeviceType::Webcam), DeviceStatus::Stopped);
    assert_eq!(driver.release_count(DeviceType::Webcam), 1);
}

fn wait_until(timeout: Duration, mut done: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if done() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
    done()
}

#[tokio::test]
async fn test_started_webcam_frames_reach_peers() {
    let (hub, gate) = hub_with(SyntheticDriver::new());
    gate.grant(DeviceType::Webcam, 1.0);
    let (a, mut rx) = join(&hub, 5001);
    let mut forwarders = Forwarders::start(hub.registry.clone(), hub.devices.clone(), 8).unwrap();

    hub.dispatch_inbound(&a, r#"{"type":"device","command":"start","device":"webcam"}"#)
        .await
        .unwrap();
    assert_eq!(hub.devices.status(DeviceType::Webcam), DeviceStatus::Running);

    // The command reply and the first frame may arrive in either order.
    let video = tokio::time::timeout(Duration::from_secs(3), async {
        while let Some(message) = rx.recv().await {
            if message.starts_with(r#"{"type":"video""#) {
                return Some(message);
            }
        }
        None
    })
    .await
    .expect("no frame within 3s")
    .unwrap();
    let json: serde_json::Value = serde_json::from_str(&video).unwrap();
    assert!(json["width"].as_u64().unwrap() > 0);
    assert!(!json["data"].as_str().unwrap().is_empty());

    forwarders.shutdown();
    hub.devices.stop_all();
}

#[tokio::test]
async fn test_relayed_audio_plays_on_running_speaker() {
    let driver = Arc::new(SyntheticDriver::new());
    let (hub, gate) = hub_sharing(driver.clone());
    gate.grant(DeviceType::Speaker, 1.0);
    let (a, mut rx) = join(&hub, 5001);
    let mut forwarders = Forwarders::start(hub.registry.clone(), hub.devices.clone(), 8).unwrap();

    hub.dispatch_inbound(&a, r#"{"type":"device","command":"start","device":"speaker"}"#)
        .await
        .unwrap();
    assert_eq!(reply(&mut rx).status, ReplyStatus::Success);
    assert_eq!(driver.played_samples(), 0);

    hub.dispatch_inbound(&a, r#"{"type":"audio","data":[0.1,0.2,0.3,0.4],"sampleRate":16000}"#)
        .await
        .unwrap();
    assert!(wait_until(Duration::from_secs(3), || driver.played_samples() >= 4));

    forwarders.shutdown();
    hub.devices.stop_all();
}

#[tokio::test]
async fn test_relayed_audio_is_dropped_while_speaker_stopped() {
    let driver = Arc::new(SyntheticDriver::new());
    let (hub, _) = hub_sharing(driver.clone());
    let (a, _rx) = join(&hub, 5001);
    let mut forwarders = Forwarders::start(hub.registry.clone(), hub.devices.clone(), 8).unwrap();

    hub.dispatch_inbound(&a, r#"{"type":"audio","data":[0.1,0.2],"sampleRate":16000}"#)
        .await
        .unwrap();
    std::thread::sleep(Duration::from_millis(300));
    assert_eq!(driver.played_samples(), 0);
    assert_eq!(driver.open_count(DeviceType::Speaker), 0);

    forwarders.shutdown();
}

struct RecordingSink {
    frames: Arc<Mutex<Vec<RawFrame>>>,
}

impl VirtualCameraSink for RecordingSink {
    fn name(&self) -> &str {
        "recording"
    }

    fn send(&mut self, frame: &RawFrame) -> RelayResult<()> {
        self.frames.lock().unwrap().push(frame.clone());
        Ok(())
    }

    fn close(&mut self) -> RelayResult<()> {
        Ok(())
    }
}

struct RecordingFactory {
    opened: Arc<Mutex<Vec<u32>>>,
}

struct NullOutput {
    rate: u32,
}

impl AudioOutput for NullOutput {
    fn sample_rate(&self) -> u32 {
        self.rate
    }

    fn close(&mut self) -> RelayResult<()> {
        Ok(())
    }
}

impl AudioOutputFactory for RecordingFactory {
    fn device_name(&self) -> &str {
        "CABLE Input (test)"
    }

    fn open(
        &self,
        sample_rate: u32,
        _channels: u16,
        _source: Arc<BoundedBuffer<f32>>,
    ) -> RelayResult<Box<dyn AudioOutput>> {
        self.opened.lock().unwrap().push(sample_rate);
        Ok(Box::new(NullOutput { rate: sample_rate }))
    }
}

#[test]
fn test_bridge_tap_keeps_blue_frames_blue() {
    let registry = Registry::new(4);
    let frames = Arc::new(Mutex::new(Vec::new()));
    let config = BridgeConfig {
        camera_width: 16,
        camera_height: 8,
        ..BridgeConfig::default()
    };
    let sink = RecordingSink { frames: frames.clone() };
    let bridge = Arc::new(Mutex::new(VirtualBridge::new(&config, Some(Box::new(sink)), None)));
    let status = bridge.lock().unwrap().status_handle();
    let mut tap = BridgeTap::spawn(&registry, bridge.clone(), 8).unwrap();

    // Solid blue-dominant RGB, so the mean-based guess would leave it alone.
    let rgb = RawFrame::new(8, 8, 3, [20u8, 60, 220].repeat(64)).unwrap();
    let message = encode_media(&MediaFrame::Video {
        data: encode_jpeg(&rgb).unwrap(),
        width: 8,
        height: 8,
    })
    .unwrap();
    registry.publish_media(message, None);

    assert!(wait_until(Duration::from_secs(3), || !frames.lock().unwrap().is_empty()));
    tap.stop();

    let sent = frames.lock().unwrap();
    assert_eq!((sent[0].width, sent[0].height, sent[0].channels), (16, 8, 3));
    for px in sent[0].data.chunks_exact(3) {
        assert!(px[0] > px[2], "pixel {:?} is not BGR", px);
    }
    assert_eq!(status.snapshot().frames_sent, 1);
}

#[test]
fn test_bridge_tap_reopens_output_on_rate_change() {
    let registry = Registry::new(4);
    let opened = Arc::new(Mutex::new(Vec::new()));
    let factory: Arc<dyn AudioOutputFactory> = Arc::new(RecordingFactory { opened: opened.clone() });
    let bridge = Arc::new(Mutex::new(VirtualBridge::new(&BridgeConfig::default(), None, Some(factory))));
    let status = bridge.lock().unwrap().status_handle();
    let mut tap = BridgeTap::spawn(&registry, bridge.clone(), 8).unwrap();

    registry.publish_media(r#"{"type":"audio","data":[0.1,0.2,0.3],"sampleRate":16000}"#.into(), None);
    registry.publish_media(r#"{"type":"audio","data":[0.1,0.2,0.3],"sampleRate":48000}"#.into(), None);

    assert!(wait_until(Duration::from_secs(3), || opened.lock().unwrap().len() == 2));
    tap.stop();

    assert_eq!(*opened.lock().unwrap(), vec![16_000, 48_000]);
    let snapshot = status.snapshot();
    assert_eq!(snapshot.sample_rate, Some(48_000));
    assert_eq!(snapshot.audio_reopens, 2);
}
