//! DPS registration: retry exhaustion and assignment.

mod common;

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use common::{dps_device, services, AssigningProvisioning, FailingProvisioning, RecordingHub};
use neomind_devsim::{ConnectionState, ControlEvent, DeviceHandle, HubCredentials, MemorySink, SimulationConfig};
use tokio::time::sleep;

fn config(retries: u32) -> SimulationConfig {
    let mut config = SimulationConfig::default();
    config.simulation.dps_retries = retries;
    config.simulation.connect_ms = 1_000;
    config
}

#[tokio::test(start_paused = true)]
async fn test_registration_exhausts_retries() {
    let hub = RecordingHub::new();
    let sink = Arc::new(MemorySink::new());
    let provisioning = Arc::new(FailingProvisioning::default());
    let device = DeviceHandle::spawn(
        dps_device("dps-1"),
        services(config(3), sink.clone(), hub.clone(), provisioning.clone()),
    );

    device.start(None, None).unwrap();
    sleep(Duration::from_secs(10)).await;

    assert_eq!(provisioning.attempts.load(Ordering::SeqCst), 3);
    let snapshot = device.snapshot().await.unwrap();
    assert!(!snapshot.running);
    assert_eq!(snapshot.state, ConnectionState::Stopped);
    assert_eq!(snapshot.stats.errors, 1);
    assert_eq!(snapshot.stats.dps, 0);
    assert_eq!(snapshot.control_status, ControlEvent::Off);
    assert!(hub.credentials.lock().is_empty());

    assert_eq!(sink.lines_containing("REGISTRATION ERROR").len(), 3);
    assert!(sink
        .lines_containing("REGISTRATION ERROR 3")
        .iter()
        .all(|l| l.contains("Device not found")));
    assert_eq!(sink.lines_containing("DPS RETRIES EXHAUSTED").len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_assigned_hub_is_used_for_connect() {
    let hub = RecordingHub::new();
    let sink = Arc::new(MemorySink::new());
    let provisioning = Arc::new(AssigningProvisioning::new("assigned.azure-devices.net"));
    let device = DeviceHandle::spawn(
        dps_device("dps-2"),
        services(config(3), sink, hub.clone(), provisioning.clone()),
    );

    device.start(None, None).unwrap();
    sleep(Duration::from_millis(2500)).await;

    let requests = provisioning.requests.lock().clone();
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0].id_scope, "0ne000000");
    assert_eq!(requests[0].registration_id, "dps-2");
    assert_eq!(requests[0].global_endpoint, "global.azure-devices-provisioning.net");

    let credentials = hub.credentials.lock().clone();
    assert_eq!(credentials.len(), 1);
    assert!(matches!(credentials[0], HubCredentials::SharedAccessSignature { .. }));
    assert_eq!(credentials[0].host_name(), "assigned.azure-devices.net");
    assert_eq!(credentials[0].device_id(), "dps-2");

    let snapshot = device.snapshot().await.unwrap();
    assert_eq!(snapshot.state, ConnectionState::Connected);
    assert_eq!(snapshot.stats.dps, 1);
    assert_eq!(snapshot.stats.connects, 1);

    device.shutdown().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_zero_retries_uses_default_budget() {
    let provisioning = Arc::new(FailingProvisioning::default());
    let device = DeviceHandle::spawn(
        dps_device("dps-3"),
        services(
            config(0),
            Arc::new(MemorySink::new()),
            RecordingHub::new(),
            provisioning.clone(),
        ),
    );

    device.start(None, None).unwrap();
    sleep(Duration::from_secs(15)).await;

    assert_eq!(provisioning.attempts.load(Ordering::SeqCst), 10);
    assert!(!device.snapshot().await.unwrap().running);
}
