//! Device provisioning (DPS) abstraction.

use async_trait::async_trait;
use serde_json::Value;

use crate::error::Result;

/// One registration attempt.
#[derive(Debug, Clone, PartialEq)]
pub struct RegistrationRequest {
    /// Global device endpoint host.
    pub global_endpoint: String,
    pub id_scope: String,
    pub registration_id: String,
    /// Device key, already derived when a master key was configured.
    pub symmetric_key: String,
    /// Custom allocation payload.
    pub payload: Option<Value>,
}

/// Successful registration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Registration {
    pub assigned_hub: String,
    pub device_id: String,
}

/// Registers devices with a provisioning service.
///
/// Failures carrying a service-side registration state are reported as
/// `DevSimError::Provisioning` with `registration_state` set.
#[async_trait]
pub trait ProvisioningClient: Send + Sync {
    async fn register(&self, request: RegistrationRequest) -> Result<Registration>;
}

/// Custom payload text as JSON, falling back to the raw string.
pub fn parse_payload(text: Option<&str>) -> Option<Value> {
    let text = text.filter(|t| !t.trim().is_empty())?;
    Some(serde_json::from_str(text).unwrap_or_else(|_| Value::String(text.to_string())))
}
