//! IoT Device Fleet Simulator
//!
//! Simulates fleets of IoT devices, each keeping its own connection to a hub:
//! direct or DPS-provisioned connects, scheduled telemetry and reported twin
//! properties, desired-property acknowledgements, direct methods and
//! cloud-to-device commands, and forced reconnects.
//!
//! ## Features
//!
//! | Feature | Default | Description |
//! |---------|---------|-------------|
//! | `mqtt` | ✅ | MQTT hub and DPS clients |
//! | `http` | ✅ | HTTP function endpoint and registry client |
//! | `all` | ❌ | All features |
//!
//! ## Architecture
//!
//! - **DeviceHandle**: one tokio task per device, driven by commands
//! - **RunloopScheduler**: countdowns for the telemetry and twin channels
//! - **ValueResolver**: macro and template expansion of property values
//! - **PayloadTransformer**: component grouping and desired overrides
//! - **HubConnector / ProvisioningClient**: network collaborators
//! - **Fleet**: starts and stops many devices together

pub mod config;
pub mod connection;
pub mod credentials;
pub mod edge;
pub mod engine;
pub mod error;
pub mod fleet;
pub mod function;
pub mod hub;
pub mod index;
pub mod model;
pub mod plugin;
pub mod provisioning;
pub mod registry;
pub mod resolver;
pub mod router;
pub mod scheduler;
pub mod sensor;
pub mod sink;
pub mod stats;
pub mod tags;
pub mod transform;

#[cfg(feature = "mqtt")]
pub mod mqtt;

pub use config::SimulationConfig;
pub use connection::{ConnectionManager, ConnectionState};
pub use credentials::{ConnectionString, HubCredentials, SasToken};
pub use edge::EdgeEnvironment;
pub use engine::{DeviceHandle, DeviceServices, DeviceSnapshot};
pub use error::{DevSimError, Result};
pub use fleet::Fleet;
pub use function::FunctionEndpoint;
pub use hub::{CloudMessage, HubClient, HubConnector, HubEvent, MethodRequest, TelemetryMessage, Twin};
pub use model::{Comm, Device, DeviceConfiguration, DeviceKind, Method, Plan, Property};
pub use plugin::DevicePlugin;
pub use provisioning::{ProvisioningClient, Registration, RegistrationRequest};
pub use registry::RegistryClient;
pub use resolver::ValueResolver;
pub use router::MethodInvocation;
pub use sink::{BroadcastSink, MemorySink, MessageSink, TracingSink};
pub use stats::{Channel, Stats};
pub use tags::{ControlEvent, ControlPlane, Direction, Operation, Scope};

#[cfg(feature = "http")]
pub use function::HttpFunctionEndpoint;
#[cfg(feature = "http")]
pub use registry::HttpRegistryClient;

/// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
