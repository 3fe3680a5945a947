//! MQTT collaborators: IoT Hub client and DPS client.

pub mod client;
pub mod provisioning;
pub mod topics;

pub use client::{MqttHubClient, MqttHubConnector, MqttHubSettings};
pub use provisioning::MqttProvisioningClient;
