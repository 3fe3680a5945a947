//! Hub client over MQTT.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use rumqttc::{AsyncClient, ConnectReturnCode, Event, EventLoop, MqttOptions, Packet, QoS, Transport};
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::topics::{self, HubTopic};
use crate::credentials::{expiry_from_hours, HubCredentials};
use crate::edge::EdgeEnvironment;
use crate::error::{DevSimError, Result};
use crate::hub::{CloudMessage, HubClient, HubConnector, HubEvent, MethodRequest, TelemetryMessage, Twin};

const MQTT_TLS_PORT: u16 = 8883;

/// Connection settings of one hub client.
#[derive(Debug, Clone)]
pub struct MqttHubSettings {
    pub host: String,
    pub port: u16,
    pub device_id: String,
    pub module_id: Option<String>,
    pub password: String,
    pub tls: bool,
    pub keep_alive: Duration,
    pub request_timeout: Duration,
}

impl MqttHubSettings {
    pub fn new(host: impl Into<String>, device_id: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            port: MQTT_TLS_PORT,
            device_id: device_id.into(),
            module_id: None,
            password: password.into(),
            tls: true,
            keep_alive: Duration::from_secs(60),
            request_timeout: Duration::from_secs(30),
        }
    }

    pub fn with_module(mut self, module_id: Option<String>) -> Self {
        self.module_id = module_id;
        self
    }

    fn options(&self) -> MqttOptions {
        let module = self.module_id.as_deref();
        let mut options = MqttOptions::new(topics::client_id(&self.device_id, module), &self.host, self.port);
        options.set_keep_alive(self.keep_alive);
        options.set_max_packet_size(256 * 1024, 256 * 1024);
        options.set_credentials(
            topics::hub_username(&self.host, &self.device_id, module),
            &self.password,
        );
        if self.tls {
            options.set_transport(Transport::tls_with_default_config());
        }
        options
    }
}

type Pending = Arc<Mutex<HashMap<String, oneshot::Sender<(u16, Vec<u8>)>>>>;

struct Connection {
    client: AsyncClient,
    task: JoinHandle<()>,
}

/// [`HubClient`] speaking the IoT Hub MQTT conventions.
pub struct MqttHubClient {
    settings: MqttHubSettings,
    connection: Mutex<Option<Connection>>,
    pending: Pending,
    methods: Arc<Mutex<HashSet<String>>>,
    next_rid: AtomicU64,
}

impl MqttHubClient {
    pub fn new(settings: MqttHubSettings) -> Self {
        Self {
            settings,
            connection: Mutex::new(None),
            pending: Arc::new(Mutex::new(HashMap::new())),
            methods: Arc::new(Mutex::new(HashSet::new())),
            next_rid: AtomicU64::new(1),
        }
    }

    fn client(&self) -> Result<AsyncClient> {
        self.connection
            .lock()
            .as_ref()
            .map(|c| c.client.clone())
            .ok_or_else(|| DevSimError::Transport("client is not open".into()))
    }

    fn rid(&self) -> String {
        format!("{:x}", self.next_rid.fetch_add(1, Ordering::Relaxed))
    }

    async fn request(&self, topic: String, rid: String, body: Vec<u8>) -> Result<(u16, Vec<u8>)> {
        let client = self.client()?;
        let (tx, rx) = oneshot::channel();
        self.pending.lock().insert(rid.clone(), tx);

        if let Err(e) = client.publish(topic, QoS::AtMostOnce, false, body).await {
            self.pending.lock().remove(&rid);
            return Err(DevSimError::Transport(format!("publish failed: {}", e)));
        }

        match tokio::time::timeout(self.settings.request_timeout, rx).await {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(_)) => Err(DevSimError::Transport("connection closed".into())),
            Err(_) => {
                self.pending.lock().remove(&rid);
                Err(DevSimError::Transport(format!("request {} timed out", rid)))
            }
        }
    }

    async fn run_event_loop(
        mut eventloop: EventLoop,
        client: AsyncClient,
        events: mpsc::UnboundedSender<HubEvent>,
        pending: Pending,
        methods: Arc<Mutex<HashSet<String>>>,
        connected: oneshot::Sender<Result<()>>,
    ) {
        let mut connected = Some(connected);
        loop {
            match eventloop.poll().await {
                Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                    let result = if ack.code == ConnectReturnCode::Success {
                        Ok(())
                    } else {
                        Err(DevSimError::Transport(format!("connection refused: {:?}", ack.code)))
                    };
                    if let Some(tx) = connected.take() {
                        let _ = tx.send(result);
                    }
                }
                Ok(Event::Incoming(Packet::Publish(publish))) => {
                    let body = publish.payload.to_vec();
                    match topics::parse_hub_topic(&publish.topic) {
                        HubTopic::TwinResponse { status, rid } => {
                            if let Some(tx) = pending.lock().remove(&rid) {
                                let _ = tx.send((status, body));
                            }
                        }
                        HubTopic::DesiredPatch => match serde_json::from_slice(&body) {
                            Ok(delta) => {
                                let _ = events.send(HubEvent::DesiredPatch(delta));
                            }
                            Err(e) => warn!(topic = %publish.topic, "Invalid desired patch: {}", e),
                        },
                        HubTopic::MethodRequest { name, rid } => {
                            if methods.lock().contains(&name) {
                                let payload = serde_json::from_slice(&body).unwrap_or(Value::Null);
                                let _ = events.send(HubEvent::DirectMethod(MethodRequest {
                                    request_id: rid,
                                    method_name: name,
                                    payload,
                                }));
                            } else {
                                debug!(method = %name, "Rejecting unregistered method");
                                let _ = client.try_publish(
                                    topics::method_response_topic(404, &rid),
                                    QoS::AtMostOnce,
                                    false,
                                    b"null".to_vec(),
                                );
                            }
                        }
                        HubTopic::CloudMessage { properties } => {
                            let _ = events.send(HubEvent::CloudMessage(CloudMessage {
                                lock_token: publish.pkid.to_string(),
                                properties,
                                body,
                            }));
                        }
                        HubTopic::Other => debug!(topic = %publish.topic, "Ignoring publish"),
                    }
                }
                Ok(_) => {}
                Err(e) => {
                    match connected.take() {
                        Some(tx) => {
                            let _ = tx.send(Err(DevSimError::Transport(e.to_string())));
                        }
                        None => {
                            let _ = events.send(HubEvent::Disconnected(e.to_string()));
                        }
                    }
                    pending.lock().clear();
                    break;
                }
            }
        }
    }
}

#[async_trait]
impl HubClient for MqttHubClient {
    async fn open(&self, events: mpsc::UnboundedSender<HubEvent>) -> Result<()> {
        let (client, eventloop) = AsyncClient::new(self.settings.options(), 64);
        let (connected_tx, connected_rx) = oneshot::channel();

        let task = tokio::spawn(Self::run_event_loop(
            eventloop,
            client.clone(),
            events,
            self.pending.clone(),
            self.methods.clone(),
            connected_tx,
        ));
        if let Some(old) = self.connection.lock().replace(Connection {
            client: client.clone(),
            task,
        }) {
            old.task.abort();
        }

        match tokio::time::timeout(self.settings.request_timeout, connected_rx).await {
            Ok(Ok(Ok(()))) => {}
            Ok(Ok(Err(e))) => return Err(e),
            Ok(Err(_)) => return Err(DevSimError::Transport("event loop ended".into())),
            Err(_) => return Err(DevSimError::Transport("connect timed out".into())),
        }

        let mut filters = vec![
            topics::TWIN_RESPONSE_FILTER.to_string(),
            topics::DESIRED_FILTER.to_string(),
            topics::METHODS_FILTER.to_string(),
        ];
        if self.settings.module_id.is_none() {
            filters.push(topics::cloud_message_filter(&self.settings.device_id));
        }
        for filter in filters {
            client
                .subscribe(filter.as_str(), QoS::AtLeastOnce)
                .await
                .map_err(|e| DevSimError::Transport(format!("subscribe {} failed: {}", filter, e)))?;
        }

        info!(host = %self.settings.host, device_id = %self.settings.device_id, "MQTT hub client connected");
        Ok(())
    }

    async fn send_event(&self, message: TelemetryMessage) -> Result<()> {
        let topic = topics::telemetry_topic(
            &self.settings.device_id,
            self.settings.module_id.as_deref(),
            &message.content_type,
            &message.content_encoding,
            &message.properties,
        );
        self.client()?
            .publish(topic, QoS::AtLeastOnce, false, message.body.into_bytes())
            .await
            .map_err(|e| DevSimError::Transport(format!("send failed: {}", e)))
    }

    async fn get_twin(&self) -> Result<Twin> {
        let rid = self.rid();
        let (status, body) = self.request(topics::twin_get_topic(&rid), rid, Vec::new()).await?;
        if status != 200 {
            return Err(DevSimError::Transport(format!("twin request failed: {}", status)));
        }
        Ok(serde_json::from_slice(&body)?)
    }

    async fn update_reported(&self, patch: Value) -> Result<()> {
        let rid = self.rid();
        let body = serde_json::to_vec(&patch)?;
        let (status, _) = self.request(topics::twin_patch_topic(&rid), rid, body).await?;
        if !(200..300).contains(&status) {
            return Err(DevSimError::Transport(format!("reported update failed: {}", status)));
        }
        Ok(())
    }

    async fn register_method(&self, name: &str) -> Result<()> {
        self.methods.lock().insert(name.to_string());
        Ok(())
    }

    async fn respond_method(&self, request_id: &str, status: u16, payload: Value) -> Result<()> {
        let body = serde_json::to_vec(&payload)?;
        self.client()?
            .publish(topics::method_response_topic(status, request_id), QoS::AtMostOnce, false, body)
            .await
            .map_err(|e| DevSimError::Transport(format!("method response failed: {}", e)))
    }

    async fn complete(&self, _message: &CloudMessage) -> Result<()> {
        // QoS 1 deliveries are acknowledged by the event loop.
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        let Some(connection) = self.connection.lock().take() else {
            return Ok(());
        };
        let result = connection.client.disconnect().await;
        connection.task.abort();
        self.pending.lock().clear();
        result.map_err(|e| DevSimError::Transport(format!("disconnect failed: {}", e)))
    }
}

/// Builds [`MqttHubClient`]s.
#[derive(Debug, Clone)]
pub struct MqttHubConnector {
    sas_expire_hours: u64,
    tls: bool,
}

impl MqttHubConnector {
    pub fn new(sas_expire_hours: u64) -> Self {
        Self {
            sas_expire_hours,
            tls: true,
        }
    }

    /// Plain TCP on 1883, for local brokers.
    pub fn without_tls(mut self) -> Self {
        self.tls = false;
        self
    }

    fn settings(&self, credentials: &HubCredentials, host: &str) -> Result<MqttHubSettings> {
        let password = credentials.password(expiry_from_hours(self.sas_expire_hours))?;
        let mut settings = MqttHubSettings::new(host, credentials.device_id(), password)
            .with_module(credentials.module_id().map(str::to_string));
        if !self.tls {
            settings.tls = false;
            settings.port = 1883;
        }
        Ok(settings)
    }
}

#[async_trait]
impl HubConnector for MqttHubConnector {
    async fn create(&self, credentials: HubCredentials) -> Result<Arc<dyn HubClient>> {
        let settings = self.settings(&credentials, credentials.host_name())?;
        Ok(Arc::new(MqttHubClient::new(settings)))
    }

    async fn create_from_environment(&self, env: &EdgeEnvironment) -> Result<Arc<dyn HubClient>> {
        let connection_string = env
            .edge_hub_connection_string
            .as_deref()
            .or(env.iothub_connection_string.as_deref())
            .ok_or_else(|| DevSimError::Environment("no module connection string in environment".into()))?;
        let credentials = HubCredentials::from_connection_string(connection_string, false, 0)?;
        let host = env
            .gateway_hostname
            .clone()
            .unwrap_or_else(|| credentials.host_name().to_string());
        let settings = self.settings(&credentials, &host)?;
        Ok(Arc::new(MqttHubClient::new(settings)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_create_from_environment_requires_connection_string() {
        let connector = MqttHubConnector::new(1);
        let result = connector.create_from_environment(&EdgeEnvironment::default()).await;
        assert!(matches!(result, Err(DevSimError::Environment(_))));
    }

    #[tokio::test]
    async fn test_closed_client_rejects_requests() {
        let client = MqttHubClient::new(MqttHubSettings::new("h.net", "d1", "pw"));
        assert!(client.get_twin().await.is_err());
        assert!(client.close().await.is_ok());
    }
}
