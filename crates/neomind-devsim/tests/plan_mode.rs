//! Scripted plans: startup values, timeline values and receive replies.

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{hub_device, services, FailingProvisioning, RecordingHub};
use neomind_devsim::{Device, DeviceHandle, HubEvent, MemorySink, Plan, SimulationConfig};
use serde_json::json;
use tokio::time::sleep;

fn plan_device(looping: bool) -> Device {
    let mut device = hub_device("plan-1");
    device.configuration.plan_mode = true;
    device.comms.push(
        serde_json::from_value(json!({
            "_type": "property",
            "_id": "mode",
            "name": "mode",
            "sdk": "twin",
            "type": { "direction": "c2d" }
        }))
        .unwrap(),
    );
    let plan: Plan = serde_json::from_value(json!({
        "loop": looping,
        "startup": [{ "property": "p1", "value": 1 }],
        "timeline": [{ "time": "3", "property": "p1", "value": 2 }],
        "receive": [{ "property": "mode", "propertyOut": "p1", "value": 99 }]
    }))
    .unwrap();
    device.plan = Some(plan);
    device
}

fn spawn(device: Device, hub: Arc<RecordingHub>) -> DeviceHandle {
    let mut config = SimulationConfig::default();
    config.plan.start_delay_ms = 2_000;
    config.plan.timeline_delay_ms = 5_000;
    DeviceHandle::spawn(
        device,
        services(
            config,
            Arc::new(MemorySink::new()),
            hub,
            Arc::new(FailingProvisioning::default()),
        ),
    )
}

#[tokio::test(start_paused = true)]
async fn test_plan_runs_once() {
    let hub = RecordingHub::new();
    let device = spawn(plan_device(false), hub.clone());

    device.start(None, None).unwrap();
    sleep(Duration::from_millis(2500)).await;
    assert_eq!(hub.bodies(), vec![json!({ "p1": 1 })]);

    sleep(Duration::from_secs(6)).await;
    assert_eq!(hub.bodies(), vec![json!({ "p1": 1 }), json!({ "p1": 2 })]);

    sleep(Duration::from_secs(20)).await;
    assert_eq!(hub.bodies().len(), 2);
    device.shutdown().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_looping_plan_repeats() {
    let hub = RecordingHub::new();
    let device = spawn(plan_device(true), hub.clone());

    device.start(None, None).unwrap();
    sleep(Duration::from_secs(30)).await;

    let bodies = hub.bodies();
    assert!(bodies.len() >= 4, "plan did not loop: {:?}", bodies);
    device.shutdown().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_desired_triggers_receive_reply() {
    let hub = RecordingHub::new();
    let device = spawn(plan_device(false), hub.clone());

    device.start(None, None).unwrap();
    sleep(Duration::from_millis(200)).await;
    hub.push(HubEvent::DesiredPatch(json!({ "mode": "eco", "$version": 4 })));
    sleep(Duration::from_millis(1000)).await;

    assert_eq!(hub.bodies(), vec![json!({ "p1": 99 })]);
    device.shutdown().await.unwrap();
}
