//! Scheduled telemetry and twin reporting through a recording hub.
//!
//! Run with: cargo test -p neomind-devsim --test engine_telemetry

mod common;

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use common::{hub_device, services, FailingProvisioning, RecordingHub};
use neomind_devsim::{ConnectionState, DeviceHandle, HubEvent, MemorySink, SimulationConfig};
use serde_json::{json, Map};
use tokio::time::sleep;

#[tokio::test(start_paused = true)]
async fn test_sends_every_second_until_stopped() {
    let hub = RecordingHub::new();
    let sink = Arc::new(MemorySink::new());
    let device = DeviceHandle::spawn(
        hub_device("d1"),
        services(
            SimulationConfig::default(),
            sink.clone(),
            hub.clone(),
            Arc::new(FailingProvisioning::default()),
        ),
    );

    device.start(None, None).unwrap();
    let mut counts = Vec::new();
    sleep(Duration::from_millis(500)).await;
    for _ in 0..4 {
        counts.push(hub.bodies().len());
        sleep(Duration::from_secs(1)).await;
    }
    assert_eq!(counts, vec![0, 1, 2, 3]);

    let bodies = hub.bodies();
    assert_eq!(bodies.len(), 4);
    assert!(bodies.iter().all(|b| *b == json!({ "p1": 42 })));

    let snapshot = device.snapshot().await.unwrap();
    assert_eq!(snapshot.state, ConnectionState::Connected);
    assert_eq!(snapshot.hub_name.as_deref(), Some("test.azure-devices.net"));
    assert_eq!(snapshot.stats.connects, 1);
    assert_eq!(snapshot.stats.msg.count, bodies.len() as u64);

    device.stop().await.unwrap();
    let sent = hub.sent.lock().len();
    sleep(Duration::from_secs(5)).await;
    assert_eq!(hub.sent.lock().len(), sent);
    assert_eq!(hub.closes.load(Ordering::SeqCst), 1);

    assert!(!sink.lines_containing("[HUB][MSG][d1][SEND]").is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_startup_property_fires_on_first_tick() {
    let hub = RecordingHub::new();
    let mut definition = hub_device("d5");
    definition.comms[0] = serde_json::from_value(json!({
        "_type": "property",
        "_id": "p1",
        "name": "p1",
        "sdk": "msg",
        "value": "42",
        "runloop": { "include": true, "onStartUp": true, "unit": "secs", "value": 5 }
    }))
    .unwrap();
    let device = DeviceHandle::spawn(
        definition,
        services(
            SimulationConfig::default(),
            Arc::new(MemorySink::new()),
            hub.clone(),
            Arc::new(FailingProvisioning::default()),
        ),
    );

    device.start(None, None).unwrap();
    let mut counts = Vec::new();
    sleep(Duration::from_millis(500)).await;
    for _ in 0..=10 {
        counts.push(hub.bodies().len());
        sleep(Duration::from_secs(1)).await;
    }
    assert_eq!(counts, vec![0, 1, 1, 1, 1, 2, 2, 2, 2, 2, 3]);
    device.shutdown().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_out_of_band_twin_update() {
    let hub = RecordingHub::new();
    let sink = Arc::new(MemorySink::new());
    let mut definition = hub_device("d2");
    definition.comms.push(
        serde_json::from_value(json!({
            "_type": "property",
            "_id": "r1",
            "name": "firmware",
            "sdk": "twin",
            "string": true,
            "value": "1.0.0"
        }))
        .unwrap(),
    );
    let device = DeviceHandle::spawn(
        definition,
        services(
            SimulationConfig::default(),
            sink,
            hub.clone(),
            Arc::new(FailingProvisioning::default()),
        ),
    );

    device.start(None, None).unwrap();
    sleep(Duration::from_millis(500)).await;

    let mut update = Map::new();
    update.insert("r1".into(), json!("2.0.0"));
    device.update_twin(update).unwrap();
    sleep(Duration::from_millis(1500)).await;

    assert_eq!(hub.reported.lock().as_slice(), &[json!({ "firmware": "2.0.0" })]);
    assert_eq!(device.snapshot().await.unwrap().stats.twin.count, 1);

    device.shutdown().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_desired_acknowledgement_on_twin() {
    let hub = RecordingHub::new();
    let sink = Arc::new(MemorySink::new());
    let mut definition = hub_device("d3");
    definition.comms.extend([
        serde_json::from_value(json!({
            "_type": "property",
            "_id": "dp",
            "name": "fanSpeed",
            "sdk": "twin",
            "type": { "direction": "c2d" },
            "asProperty": true,
            "asPropertyId": "ack"
        }))
        .unwrap(),
        serde_json::from_value(json!({
            "_type": "property",
            "_id": "ack",
            "name": "fanSpeedAck",
            "sdk": "twin",
            "string": true,
            "value": "accepted"
        }))
        .unwrap(),
    ]);
    let device = DeviceHandle::spawn(
        definition,
        services(
            SimulationConfig::default(),
            sink,
            hub.clone(),
            Arc::new(FailingProvisioning::default()),
        ),
    );

    device.start(None, None).unwrap();
    sleep(Duration::from_millis(200)).await;
    hub.push(HubEvent::DesiredPatch(json!({ "fanSpeed": 5, "$version": 2 })));
    sleep(Duration::from_millis(1500)).await;

    assert!(hub.reported.lock().contains(&json!({ "fanSpeedAck": "accepted" })));
    let twin = device.read_twin().await.unwrap();
    assert_eq!(twin["fanSpeed"], json!(5));
    assert_eq!(device.snapshot().await.unwrap().stats.desired, 1);

    device.shutdown().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_transport_error_stops_after_delay() {
    let hub = RecordingHub::new();
    *hub.fail_sends.lock() = true;
    let sink = Arc::new(MemorySink::new());
    let mut config = SimulationConfig::default();
    config.simulation.transport_stop_ms = 2_000;
    let device = DeviceHandle::spawn(
        hub_device("d4"),
        services(config, sink.clone(), hub, Arc::new(FailingProvisioning::default())),
    );

    device.start(None, None).unwrap();
    sleep(Duration::from_millis(1500)).await;
    let snapshot = device.snapshot().await.unwrap();
    assert!(snapshot.running);
    assert!(snapshot.stats.errors >= 1);

    sleep(Duration::from_secs(3)).await;
    let snapshot = device.snapshot().await.unwrap();
    assert!(!snapshot.running);
    assert_eq!(snapshot.stats.off, 1);
    assert!(!sink.lines_containing("SDK CLOSE ERROR").is_empty());
}
