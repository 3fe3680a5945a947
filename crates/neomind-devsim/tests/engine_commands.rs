//! Direct methods, cloud-to-device messages and control commands.

mod common;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use common::{hub_device, services, FailingProvisioning, RecordingHub};
use neomind_devsim::{CloudMessage, Device, DeviceHandle, HubEvent, MemorySink, MethodRequest, SimulationConfig};
use serde_json::json;
use tokio::time::sleep;

fn device_with_methods(id: &str) -> Device {
    let mut device = hub_device(id);
    device.comms.extend([
        serde_json::from_value(json!({
            "_type": "method",
            "_id": "m1",
            "name": "setLevel",
            "execution": "direct",
            "status": 201,
            "payload": "{\"result\": \"ok\"}",
            "asProperty": true
        }))
        .unwrap(),
        serde_json::from_value(json!({
            "_type": "method",
            "_id": "m2",
            "name": "Reboot",
            "execution": "direct"
        }))
        .unwrap(),
        serde_json::from_value(json!({
            "_type": "method",
            "_id": "m3",
            "name": "ring",
            "execution": "cloud"
        }))
        .unwrap(),
    ]);
    device
}

async fn started(id: &str) -> (DeviceHandle, Arc<RecordingHub>, Arc<MemorySink>) {
    let hub = RecordingHub::new();
    let sink = Arc::new(MemorySink::new());
    let device = DeviceHandle::spawn(
        device_with_methods(id),
        services(
            SimulationConfig::default(),
            sink.clone(),
            hub.clone(),
            Arc::new(FailingProvisioning::default()),
        ),
    );
    device.start(None, None).unwrap();
    sleep(Duration::from_millis(200)).await;
    (device, hub, sink)
}

#[tokio::test(start_paused = true)]
async fn test_direct_method_response_and_return_payload() {
    let (device, hub, _sink) = started("c1").await;

    let mut registered = hub.methods.lock().clone();
    registered.sort();
    assert_eq!(registered, vec!["Reboot".to_string(), "setLevel".to_string()]);

    hub.push(HubEvent::DirectMethod(MethodRequest {
        request_id: "7".into(),
        method_name: "setLevel".into(),
        payload: json!({ "level": 3 }),
    }));
    sleep(Duration::from_millis(100)).await;

    assert_eq!(
        hub.responses.lock().as_slice(),
        &[("7".to_string(), 201, json!({ "result": "ok" }))]
    );
    assert!(hub.reported.lock().contains(&json!({ "setLevel": { "result": "ok" } })));

    let params = device.read_method_params().await.unwrap();
    assert_eq!(params["m1"].payload, json!({ "level": 3 }));
    assert_eq!(device.snapshot().await.unwrap().stats.commands, 1);

    device.shutdown().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_reboot_command_restarts_after_drain() {
    let (device, hub, sink) = started("c2").await;

    hub.push(HubEvent::DirectMethod(MethodRequest {
        request_id: "1".into(),
        method_name: "Reboot".into(),
        payload: json!(null),
    }));
    sleep(Duration::from_millis(1000)).await;
    assert_eq!(device.snapshot().await.unwrap().stats.connects, 1);

    sleep(Duration::from_millis(2000)).await;
    let snapshot = device.snapshot().await.unwrap();
    assert!(snapshot.running);
    assert_eq!(snapshot.stats.on, 2);
    assert_eq!(snapshot.stats.off, 1);
    assert_eq!(snapshot.stats.connects, 2);
    assert_eq!(sink.lines_containing("METHOD REBOOT").len(), 1);
    assert_eq!(sink.lines_containing("<NO PAYLOAD>").len(), 1);

    device.shutdown().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_firmware_command_restarts_after_delay() {
    let hub = RecordingHub::new();
    let mut definition = device_with_methods("c3");
    definition.comms.push(
        serde_json::from_value(json!({ "_type": "method", "_id": "m4", "name": "firmware" })).unwrap(),
    );
    let mut config = SimulationConfig::default();
    config.simulation.firmware_ms = 10_000;
    let device = DeviceHandle::spawn(
        definition,
        services(config, Arc::new(MemorySink::new()), hub.clone(), Arc::new(FailingProvisioning::default())),
    );
    device.start(None, None).unwrap();
    sleep(Duration::from_millis(200)).await;

    hub.push(HubEvent::DirectMethod(MethodRequest {
        request_id: "1".into(),
        method_name: "firmware".into(),
        payload: json!({ "version": "2.0" }),
    }));
    sleep(Duration::from_secs(5)).await;
    assert!(!device.snapshot().await.unwrap().running);

    sleep(Duration::from_secs(10)).await;
    let snapshot = device.snapshot().await.unwrap();
    assert!(snapshot.running);
    assert_eq!(snapshot.stats.connects, 2);

    device.shutdown().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_cloud_message_dispatch() {
    let (device, hub, sink) = started("c4").await;

    let mut properties = HashMap::new();
    properties.insert("method-name".to_string(), "dtmi:ring".to_string());
    hub.push(HubEvent::CloudMessage(CloudMessage {
        lock_token: "lt".into(),
        properties,
        body: br#"{"volume": 11}"#.to_vec(),
    }));
    sleep(Duration::from_millis(100)).await;

    assert_eq!(hub.completed.lock().len(), 1);
    let params = device.read_method_params().await.unwrap();
    assert_eq!(params["m3"].payload, json!({ "volume": 11 }));
    assert_eq!(device.snapshot().await.unwrap().stats.c2d, 1);
    assert_eq!(sink.lines_containing("C2D COMPLETE").len(), 1);

    hub.push(HubEvent::CloudMessage(CloudMessage::default()));
    sleep(Duration::from_millis(100)).await;
    assert_eq!(hub.completed.lock().len(), 2);
    assert_eq!(sink.lines_containing("C2D ERROR PARSING MESSAGE BODY").len(), 1);
    assert_eq!(device.snapshot().await.unwrap().stats.c2d, 1);

    device.shutdown().await.unwrap();
}
