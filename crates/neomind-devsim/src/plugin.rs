//! Device plugin hook.

use serde_json::Value;

use crate::model::Property;

/// Optional extension point that customizes a device.
///
/// Hooks are called from inside the device task and must not block.
pub trait DevicePlugin: Send + Sync {
    /// Called after every (re)configuration.
    fn configure_device(&self, _device_id: &str, _running: bool) {}

    /// Called once the connect sequence has started.
    fn post_connect(&self, _device_id: &str) {}

    /// Called when a running device stops.
    fn stop_device(&self, _device_id: &str) {}

    /// Claim the outbound value of a property. `Some` wins over every
    /// built-in resolution step.
    fn property_response(
        &self,
        _device_id: &str,
        _property: &Property,
        _value: &Value,
    ) -> Option<Value> {
        None
    }
}
