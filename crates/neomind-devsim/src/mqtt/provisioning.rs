//! DPS registration over MQTT.

use std::time::Duration;

use async_trait::async_trait;
use rumqttc::{AsyncClient, Event, MqttOptions, Packet, QoS, Transport};
use serde::Deserialize;
use serde_json::json;
use tokio::sync::mpsc;
use tracing::{debug, info};

use super::topics;
use crate::credentials::{expiry_from_hours, SasToken};
use crate::error::{DevSimError, Result};
use crate::provisioning::{ProvisioningClient, Registration, RegistrationRequest};

const DEFAULT_RETRY_AFTER_SECS: u64 = 3;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct OperationStatus {
    #[serde(default)]
    operation_id: Option<String>,
    #[serde(default)]
    status: Option<String>,
    #[serde(default)]
    registration_state: Option<RegistrationState>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RegistrationState {
    #[serde(default)]
    assigned_hub: Option<String>,
    #[serde(default)]
    device_id: Option<String>,
    #[serde(default)]
    error_message: Option<String>,
}

impl OperationStatus {
    fn into_outcome(self) -> Option<Result<Registration>> {
        match self.status.as_deref() {
            Some("assigned") => {
                let state = self.registration_state?;
                Some(match (state.assigned_hub, state.device_id) {
                    (Some(assigned_hub), Some(device_id)) => Ok(Registration {
                        assigned_hub,
                        device_id,
                    }),
                    _ => Err(DevSimError::provisioning("assignment is missing hub or device")),
                })
            }
            Some("assigning") | Some("unassigned") | None => None,
            Some(other) => Some(Err(DevSimError::Provisioning {
                message: format!("registration {}", other),
                registration_state: self.registration_state.and_then(|s| s.error_message),
            })),
        }
    }
}

/// [`ProvisioningClient`] using the DPS MQTT protocol.
#[derive(Debug, Clone)]
pub struct MqttProvisioningClient {
    timeout: Duration,
    sas_expire_hours: u64,
}

impl MqttProvisioningClient {
    pub fn new() -> Self {
        Self {
            timeout: Duration::from_secs(60),
            sas_expire_hours: 1,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    async fn run(&self, request: &RegistrationRequest) -> Result<Registration> {
        let resource = topics::dps_resource(&request.id_scope, &request.registration_id);
        let token = SasToken::create(
            &resource,
            &request.symmetric_key,
            expiry_from_hours(self.sas_expire_hours),
            Some("registration"),
        )?;

        let mut options = MqttOptions::new(&request.registration_id, &request.global_endpoint, 8883);
        options.set_keep_alive(Duration::from_secs(30));
        options.set_credentials(
            topics::dps_username(&request.id_scope, &request.registration_id),
            token.to_string(),
        );
        options.set_transport(Transport::tls_with_default_config());

        let (client, mut eventloop) = AsyncClient::new(options, 16);
        let (tx, mut rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(async move {
            loop {
                match eventloop.poll().await {
                    Ok(Event::Incoming(Packet::Publish(p))) => {
                        if tx.send(Ok((p.topic, p.payload.to_vec()))).is_err() {
                            break;
                        }
                    }
                    Ok(_) => {}
                    Err(e) => {
                        let _ = tx.send(Err(DevSimError::Transport(e.to_string())));
                        break;
                    }
                }
            }
        });

        let result = async {
            client
                .subscribe(topics::DPS_RESPONSE_FILTER, QoS::AtLeastOnce)
                .await
                .map_err(|e| DevSimError::Transport(e.to_string()))?;

            let mut body = json!({ "registrationId": request.registration_id });
            if let Some(payload) = &request.payload {
                body["payload"] = payload.clone();
            }
            let mut rid: u64 = 1;
            client
                .publish(
                    topics::dps_register_topic(&rid.to_string()),
                    QoS::AtLeastOnce,
                    false,
                    serde_json::to_vec(&body)?,
                )
                .await
                .map_err(|e| DevSimError::Transport(e.to_string()))?;

            while let Some(message) = rx.recv().await {
                let (topic, payload) = message?;
                let Some(response) = topics::parse_dps_topic(&topic) else {
                    continue;
                };
                debug!(status = response.status, rid = %response.rid, "DPS response");

                let status: OperationStatus = serde_json::from_slice(&payload).map_err(|e| {
                    DevSimError::provisioning(format!("invalid DPS response ({}): {}", response.status, e))
                })?;
                if response.status >= 300 {
                    return Err(DevSimError::Provisioning {
                        message: format!("DPS returned {}", response.status),
                        registration_state: status.registration_state.and_then(|s| s.error_message),
                    });
                }

                let operation_id = status.operation_id.clone();
                if let Some(outcome) = status.into_outcome() {
                    return outcome;
                }

                let operation_id =
                    operation_id.ok_or_else(|| DevSimError::provisioning("response carries no operationId"))?;
                let wait = response.retry_after.unwrap_or(DEFAULT_RETRY_AFTER_SECS);
                tokio::time::sleep(Duration::from_secs(wait)).await;

                rid += 1;
                client
                    .publish(
                        topics::dps_status_topic(&rid.to_string(), &operation_id),
                        QoS::AtLeastOnce,
                        false,
                        Vec::new(),
                    )
                    .await
                    .map_err(|e| DevSimError::Transport(e.to_string()))?;
            }
            Err(DevSimError::Transport("DPS connection closed".into()))
        };

        let outcome = tokio::time::timeout(self.timeout, result)
            .await
            .unwrap_or_else(|_| Err(DevSimError::provisioning("registration timed out")));
        let _ = client.disconnect().await;
        task.abort();
        outcome
    }
}

impl Default for MqttProvisioningClient {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ProvisioningClient for MqttProvisioningClient {
    async fn register(&self, request: RegistrationRequest) -> Result<Registration> {
        let registration = self.run(&request).await?;
        info!(
            registration_id = %request.registration_id,
            assigned_hub = %registration.assigned_hub,
            "DPS registration assigned"
        );
        Ok(registration)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_operation_status_outcomes() {
        let assigned: OperationStatus = serde_json::from_str(
            r#"{"operationId":"1","status":"assigned","registrationState":{"assignedHub":"h.net","deviceId":"d1"}}"#,
        )
        .unwrap();
        let registration = assigned.into_outcome().unwrap().unwrap();
        assert_eq!(registration.assigned_hub, "h.net");

        let pending: OperationStatus =
            serde_json::from_str(r#"{"operationId":"1","status":"assigning"}"#).unwrap();
        assert!(pending.into_outcome().is_none());

        let failed: OperationStatus = serde_json::from_str(
            r#"{"status":"failed","registrationState":{"errorMessage":"Device not found"}}"#,
        )
        .unwrap();
        let err = failed.into_outcome().unwrap().unwrap_err();
        assert_eq!(err.to_string(), "Provisioning error: Device not found");
    }
}
