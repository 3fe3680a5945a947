//! Hub transport abstraction.
//!
//! The engine only talks to a hub through [`HubClient`]; a [`HubConnector`]
//! builds clients either from credentials or from an edge runtime
//! environment.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;

use crate::credentials::HubCredentials;
use crate::edge::EdgeEnvironment;
use crate::error::Result;

/// Message property carrying the component of a telemetry message.
pub const COMPONENT_PROPERTY: &str = "$.sub";

/// Message property carrying the method name of a cloud-to-device message.
pub const METHOD_NAME_PROPERTY: &str = "method-name";

/// Outbound telemetry message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TelemetryMessage {
    pub body: String,
    pub content_type: String,
    pub content_encoding: String,
    pub properties: Vec<(String, String)>,
}

impl TelemetryMessage {
    /// UTF-8 JSON message.
    pub fn json(body: impl Into<String>) -> Self {
        Self {
            body: body.into(),
            content_type: "application/json".to_string(),
            content_encoding: "utf-8".to_string(),
            properties: Vec::new(),
        }
    }

    pub fn with_property(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.properties.push((key.into(), value.into()));
        self
    }

    pub fn property(&self, key: &str) -> Option<&str> {
        self.properties
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }
}

/// Device twin document.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Twin {
    #[serde(default)]
    pub desired: Value,
    #[serde(default)]
    pub reported: Value,
}

/// Inbound direct method call.
#[derive(Debug, Clone, PartialEq)]
pub struct MethodRequest {
    /// Transport request id used to correlate the response.
    pub request_id: String,
    pub method_name: String,
    pub payload: Value,
}

/// Inbound cloud-to-device message.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CloudMessage {
    /// Transport token used to complete the message.
    pub lock_token: String,
    pub properties: HashMap<String, String>,
    pub body: Vec<u8>,
}

/// Event pushed by an open hub client.
#[derive(Debug, Clone, PartialEq)]
pub enum HubEvent {
    /// Desired property delta, including `$version`.
    DesiredPatch(Value),
    CloudMessage(CloudMessage),
    DirectMethod(MethodRequest),
    /// The transport dropped on its own.
    Disconnected(String),
}

/// Connection to a hub for one device or module.
#[async_trait]
pub trait HubClient: Send + Sync {
    /// Connect and start forwarding inbound events.
    async fn open(&self, events: mpsc::UnboundedSender<HubEvent>) -> Result<()>;

    /// Send one telemetry message.
    async fn send_event(&self, message: TelemetryMessage) -> Result<()>;

    /// Fetch the full twin.
    async fn get_twin(&self) -> Result<Twin>;

    /// Patch the reported properties.
    async fn update_reported(&self, patch: Value) -> Result<()>;

    /// Accept direct method calls for `name`.
    async fn register_method(&self, name: &str) -> Result<()>;

    /// Answer a direct method call.
    async fn respond_method(&self, request_id: &str, status: u16, payload: Value) -> Result<()>;

    /// Acknowledge a cloud-to-device message.
    async fn complete(&self, message: &CloudMessage) -> Result<()>;

    /// Disconnect.
    async fn close(&self) -> Result<()>;
}

/// Factory for hub clients.
#[async_trait]
pub trait HubConnector: Send + Sync {
    /// Client for explicit credentials.
    async fn create(&self, credentials: HubCredentials) -> Result<Arc<dyn HubClient>>;

    /// Client for a module hosted by an edge runtime.
    async fn create_from_environment(&self, env: &EdgeEnvironment) -> Result<Arc<dyn HubClient>>;
}
