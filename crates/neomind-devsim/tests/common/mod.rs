//! In-memory collaborators shared by the integration tests.

#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use neomind_devsim::{
    CloudMessage, DevSimError, Device, DeviceServices, EdgeEnvironment, HubClient, HubConnector, HubCredentials,
    HubEvent, MemorySink, ProvisioningClient, Registration, RegistrationRequest, Result, SimulationConfig,
    TelemetryMessage, Twin,
};
use parking_lot::Mutex;
use serde_json::{json, Value};
use tokio::sync::mpsc;

/// Base64 of "secret".
pub const KEY: &str = "c2VjcmV0";

/// Hub connector and client that record every call.
#[derive(Default)]
pub struct RecordingHub {
    pub credentials: Mutex<Vec<HubCredentials>>,
    pub events: Mutex<Option<mpsc::UnboundedSender<HubEvent>>>,
    pub sent: Mutex<Vec<TelemetryMessage>>,
    pub reported: Mutex<Vec<Value>>,
    pub methods: Mutex<Vec<String>>,
    pub responses: Mutex<Vec<(String, u16, Value)>>,
    pub completed: Mutex<Vec<CloudMessage>>,
    pub desired: Mutex<Value>,
    pub opens: AtomicUsize,
    pub closes: AtomicUsize,
    pub fail_sends: Mutex<bool>,
}

impl RecordingHub {
    pub fn new() -> Arc<Self> {
        let hub = Self::default();
        *hub.desired.lock() = json!({});
        Arc::new(hub)
    }

    /// Deliver a hub event to the device, as the transport would.
    pub fn push(&self, event: HubEvent) {
        if let Some(tx) = self.events.lock().as_ref() {
            let _ = tx.send(event);
        }
    }

    pub fn bodies(&self) -> Vec<Value> {
        self.sent
            .lock()
            .iter()
            .filter_map(|m| serde_json::from_str(&m.body).ok())
            .collect()
    }
}

struct RecordingClient(Arc<RecordingHub>);

#[async_trait]
impl HubClient for RecordingClient {
    async fn open(&self, events: mpsc::UnboundedSender<HubEvent>) -> Result<()> {
        self.0.opens.fetch_add(1, Ordering::SeqCst);
        *self.0.events.lock() = Some(events);
        Ok(())
    }

    async fn send_event(&self, message: TelemetryMessage) -> Result<()> {
        if *self.0.fail_sends.lock() {
            return Err(DevSimError::Transport("link down".into()));
        }
        self.0.sent.lock().push(message);
        Ok(())
    }

    async fn get_twin(&self) -> Result<Twin> {
        Ok(Twin {
            desired: self.0.desired.lock().clone(),
            reported: json!({}),
        })
    }

    async fn update_reported(&self, patch: Value) -> Result<()> {
        self.0.reported.lock().push(patch);
        Ok(())
    }

    async fn register_method(&self, name: &str) -> Result<()> {
        self.0.methods.lock().push(name.to_string());
        Ok(())
    }

    async fn respond_method(&self, request_id: &str, status: u16, payload: Value) -> Result<()> {
        self.0.responses.lock().push((request_id.to_string(), status, payload));
        Ok(())
    }

    async fn complete(&self, message: &CloudMessage) -> Result<()> {
        self.0.completed.lock().push(message.clone());
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.0.closes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

pub struct RecordingConnector(pub Arc<RecordingHub>);

#[async_trait]
impl HubConnector for RecordingConnector {
    async fn create(&self, credentials: HubCredentials) -> Result<Arc<dyn HubClient>> {
        self.0.credentials.lock().push(credentials);
        Ok(Arc::new(RecordingClient(self.0.clone())))
    }

    async fn create_from_environment(&self, env: &EdgeEnvironment) -> Result<Arc<dyn HubClient>> {
        env.check(env.device_id.as_deref().unwrap_or_default(), env.module_id.as_deref().unwrap_or_default())?;
        Ok(Arc::new(RecordingClient(self.0.clone())))
    }
}

/// Provisioning client that fails every attempt.
#[derive(Default)]
pub struct FailingProvisioning {
    pub attempts: AtomicUsize,
}

#[async_trait]
impl ProvisioningClient for FailingProvisioning {
    async fn register(&self, _request: RegistrationRequest) -> Result<Registration> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        Err(DevSimError::Provisioning {
            message: "registration failed".into(),
            registration_state: Some("Device not found".into()),
        })
    }
}

/// Provisioning client that assigns every device to one hub.
pub struct AssigningProvisioning {
    pub hub: String,
    pub requests: Mutex<Vec<RegistrationRequest>>,
}

impl AssigningProvisioning {
    pub fn new(hub: &str) -> Self {
        Self {
            hub: hub.to_string(),
            requests: Mutex::new(Vec::new()),
        }
    }
}

#[async_trait]
impl ProvisioningClient for AssigningProvisioning {
    async fn register(&self, request: RegistrationRequest) -> Result<Registration> {
        let device_id = request.registration_id.clone();
        self.requests.lock().push(request);
        Ok(Registration {
            assigned_hub: self.hub.clone(),
            device_id,
        })
    }
}

pub fn services(
    config: SimulationConfig,
    sink: Arc<MemorySink>,
    hub: Arc<RecordingHub>,
    provisioning: Arc<dyn ProvisioningClient>,
) -> DeviceServices {
    DeviceServices::new(Arc::new(config), sink, Arc::new(RecordingConnector(hub)), provisioning)
}

/// Hub device with one telemetry property `p1` reporting 42 every second.
pub fn hub_device(id: &str) -> Device {
    serde_json::from_value(json!({
        "_id": id,
        "configuration": {
            "_kind": "hub",
            "deviceId": id,
            "connectionString": format!("HostName=test.azure-devices.net;DeviceId={};SharedAccessKey={}", id, KEY)
        },
        "comms": [
            {
                "_type": "property",
                "_id": "p1",
                "name": "p1",
                "sdk": "msg",
                "string": false,
                "value": "42",
                "runloop": { "include": true, "unit": "secs", "value": 1 }
            }
        ]
    }))
    .unwrap()
}

pub fn dps_device(id: &str) -> Device {
    serde_json::from_value(json!({
        "_id": id,
        "configuration": {
            "_kind": "dps",
            "deviceId": id,
            "scopeId": "0ne000000",
            "sasKey": KEY
        },
        "comms": []
    }))
    .unwrap()
}
