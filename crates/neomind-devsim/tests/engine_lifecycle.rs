//! Start/stop semantics, reconfiguration and templates.

mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use common::{hub_device, services, FailingProvisioning, RecordingHub};
use neomind_devsim::{
    ControlEvent, DevSimError, Device, DeviceHandle, DeviceKind, DevicePlugin, MemorySink, SimulationConfig,
};
use tokio::time::sleep;

fn spawn(device: Device, sink: Arc<MemorySink>, hub: Arc<RecordingHub>) -> DeviceHandle {
    DeviceHandle::spawn(
        device,
        services(
            SimulationConfig::default(),
            sink,
            hub,
            Arc::new(FailingProvisioning::default()),
        ),
    )
}

#[derive(Default)]
struct CountingPlugin {
    stops: AtomicUsize,
}

impl DevicePlugin for CountingPlugin {
    fn stop_device(&self, _device_id: &str) {
        self.stops.fetch_add(1, Ordering::SeqCst);
    }
}

#[tokio::test(start_paused = true)]
async fn test_stop_is_idempotent() {
    let hub = RecordingHub::new();
    let sink = Arc::new(MemorySink::new());
    let plugin = Arc::new(CountingPlugin::default());
    let device = DeviceHandle::spawn(
        hub_device("s1"),
        services(
            SimulationConfig::default(),
            sink.clone(),
            hub.clone(),
            Arc::new(FailingProvisioning::default()),
        )
        .with_plugin(plugin.clone()),
    );

    device.start(None, None).unwrap();
    sleep(Duration::from_millis(1500)).await;
    device.stop().await.unwrap();
    let errors = device.snapshot().await.unwrap().stats.errors;
    device.stop().await.unwrap();
    sleep(Duration::from_millis(100)).await;

    let stats = device.snapshot().await.unwrap().stats;
    assert_eq!(stats.on, 1);
    assert_eq!(stats.off, 1);
    assert_eq!(stats.errors, errors);
    assert_eq!(plugin.stops.load(Ordering::SeqCst), 1);
    assert_eq!(hub.closes.load(Ordering::SeqCst), 1);
    assert_eq!(sink.lines_containing("DEVICE WILL SHUTDOWN").len(), 1);
}

#[tokio::test]
async fn test_stop_before_start_is_silent() {
    let sink = Arc::new(MemorySink::new());
    let device = spawn(hub_device("s2"), sink.clone(), RecordingHub::new());
    sleep(Duration::from_millis(10)).await;
    sink.clear();

    device.stop().await.unwrap();

    assert!(sink.events().is_empty());
    let snapshot = device.snapshot().await.unwrap();
    assert!(!snapshot.running);
    assert_eq!(snapshot.stats.off, 0);
}

#[tokio::test(start_paused = true)]
async fn test_delayed_start_can_be_cancelled() {
    let hub = RecordingHub::new();
    let sink = Arc::new(MemorySink::new());
    let device = spawn(hub_device("s3"), sink.clone(), hub.clone());

    device.start(Some(Duration::from_secs(10)), None).unwrap();
    sleep(Duration::from_secs(1)).await;
    assert_eq!(device.snapshot().await.unwrap().control_status, ControlEvent::Delay);

    device.stop().await.unwrap();
    sleep(Duration::from_secs(20)).await;

    assert!(hub.credentials.lock().is_empty());
    assert_eq!(sink.lines_containing("DELAYED START CANCELED").len(), 1);
    let snapshot = device.snapshot().await.unwrap();
    assert!(!snapshot.running);
    assert_eq!(snapshot.stats.on, 0);
}

#[tokio::test(start_paused = true)]
async fn test_second_start_is_ignored() {
    let hub = RecordingHub::new();
    let device = spawn(hub_device("s4"), Arc::new(MemorySink::new()), hub.clone());

    device.start(None, None).unwrap();
    device.start(None, None).unwrap();
    sleep(Duration::from_millis(500)).await;

    assert_eq!(hub.credentials.lock().len(), 1);
    assert_eq!(device.snapshot().await.unwrap().stats.on, 1);
    device.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_update_rejects_changed_connection_string() {
    let sink = Arc::new(MemorySink::new());
    let device = spawn(hub_device("u1"), sink.clone(), RecordingHub::new());

    let mut changed = hub_device("u1");
    changed.configuration.connection_string = Some("HostName=other.net;DeviceId=u1;SharedAccessKey=a2V5".into());
    let err = device.update_device(changed, false).await.unwrap_err();
    assert!(matches!(err, DevSimError::ConnectionStringChanged(ref id) if id == "u1"));
    assert_eq!(sink.lines_containing("CONNECTION STRING HAS CHANGED").len(), 1);

    device.update_device(hub_device("u1"), false).await.unwrap();
    assert_eq!(device.snapshot().await.unwrap().stats.reconfigures, 1);

    device.update_device(hub_device("u1"), true).await.unwrap();
    assert_eq!(device.snapshot().await.unwrap().stats.reconfigures, 1);
}

#[tokio::test]
async fn test_initial_configuration_counts_zero() {
    let sink = Arc::new(MemorySink::new());
    let device = spawn(hub_device("u2"), sink.clone(), RecordingHub::new());
    let snapshot = device.snapshot().await.unwrap();
    assert_eq!(snapshot.stats.reconfigures, 0);
    assert_eq!(sink.lines_containing("DEVICE/MODULE HAS BEEN CONFIGURED").len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_template_is_inert() {
    let hub = RecordingHub::new();
    let sink = Arc::new(MemorySink::new());
    let mut template = hub_device("t1");
    template.configuration.kind = DeviceKind::Template;
    let device = spawn(template, sink.clone(), hub.clone());

    device.start(None, None).unwrap();
    sleep(Duration::from_secs(2)).await;

    assert!(sink.events().is_empty());
    assert!(hub.credentials.lock().is_empty());
    let snapshot = device.snapshot().await.unwrap();
    assert!(!snapshot.running);
    assert_eq!(snapshot.stats.reconfigures, -1);
}

#[tokio::test(start_paused = true)]
async fn test_forced_reconnect_keeps_sending() {
    let hub = RecordingHub::new();
    let sink = Arc::new(MemorySink::new());
    let mut config = SimulationConfig::default();
    config.simulation.restart.min = 1;
    config.simulation.restart.max = 1;
    let device = DeviceHandle::spawn(
        hub_device("r1"),
        services(config, sink.clone(), hub.clone(), Arc::new(FailingProvisioning::default())),
    );

    device.start(None, None).unwrap();
    sleep(Duration::from_secs(3_600 + 5)).await;

    let snapshot = device.snapshot().await.unwrap();
    assert_eq!(snapshot.stats.restart, 1);
    assert_eq!(snapshot.stats.connects, 2);
    assert!(snapshot.running);
    assert_eq!(hub.opens.load(Ordering::SeqCst), 2);
    assert_eq!(sink.lines_containing("IOT HUB RECONNECT LOOP START").len(), 1);

    let before = hub.sent.lock().len();
    sleep(Duration::from_secs(3)).await;
    assert!(hub.sent.lock().len() > before);
    device.shutdown().await.unwrap();
}
