//! Inbound command routing.
//!
//! Desired deltas, direct methods and cloud-to-device messages all end in a
//! [`RouteOutcome`]: out-of-band updates for the runloop, desired overrides
//! for the transformer and an optional method return reported property. The
//! engine applies the outcome; nothing here touches the network.

use serde_json::{Map, Value};

use crate::config::CommandsSection;
use crate::error::{DevSimError, Result};
use crate::hub::{CloudMessage, METHOD_NAME_PROPERTY};
use crate::index::ResolverIndex;
use crate::model::{Comm, Device, Method};
use crate::stats::Channel;
use crate::transform::DesiredOverride;

const VERSION_KEY: &str = "$version";
const COMPONENT_MARKER: &str = "__t";

/// One leaf of a desired delta.
#[derive(Debug, Clone, PartialEq)]
pub struct DesiredEntry {
    pub name: String,
    pub value: Value,
    /// The entry sits inside a component object.
    pub component: bool,
}

/// Flatten a desired delta into its leaf entries.
///
/// Objects carrying the `__t` marker are components and are walked one level
/// down; every other child is a leaf, objects included.
pub fn walk_desired(delta: &Value) -> Vec<DesiredEntry> {
    let mut out = Vec::new();
    collect_desired(delta, false, &mut out);
    out
}

fn collect_desired(node: &Value, component: bool, out: &mut Vec<DesiredEntry>) {
    let Some(map) = node.as_object() else {
        return;
    };
    for (name, value) in map {
        if name == VERSION_KEY || name == COMPONENT_MARKER {
            continue;
        }
        let is_component = value.get(COMPONENT_MARKER).is_some_and(truthy);
        if is_component {
            collect_desired(value, true, out);
        } else {
            out.push(DesiredEntry {
                name: name.clone(),
                value: value.clone(),
                component,
            });
        }
    }
}

fn truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
        Value::String(s) => !s.is_empty(),
        _ => true,
    }
}

/// Side effects requested by a routed command.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RouteOutcome {
    pub updates: Vec<(Channel, Map<String, Value>)>,
    pub overrides: Vec<(String, DesiredOverride)>,
    /// Reported patch carrying a method's return payload.
    pub reported: Option<Value>,
}

impl RouteOutcome {
    pub fn is_empty(&self) -> bool {
        self.updates.is_empty() && self.overrides.is_empty() && self.reported.is_none()
    }

    fn push_update(&mut self, channel: Channel, id: &str, value: Value) {
        let mut map = Map::new();
        map.insert(id.to_string(), value);
        self.updates.push((channel, map));
    }

    /// Queue the current value of `target_id` on its own channel.
    fn ack_target(&mut self, device: &Device, index: &ResolverIndex, target_id: &str) {
        if let Some(target) = index
            .index_of(target_id)
            .and_then(|i| device.comms.get(i))
            .and_then(Comm::as_property)
        {
            self.push_update(target.sdk, &target.id, target.formatted_value());
        }
    }
}

/// Apply a desired value to its property and queue the configured acknowledgement.
pub fn property_response(
    device: &mut Device,
    index: &ResolverIndex,
    entry: &DesiredEntry,
    version: Option<&Value>,
    out: &mut RouteOutcome,
) {
    let Some(property) = index
        .desired_name_to_index
        .get(&entry.name)
        .and_then(|i| device.comms.get_mut(*i))
        .and_then(Comm::as_property_mut)
    else {
        return;
    };

    property.value = entry.value.clone();
    property.version = version.cloned();

    if !property.as_property {
        return;
    }
    let Some(target_id) = property.as_property_id.clone() else {
        return;
    };

    if property.as_property_version {
        out.overrides.push((
            target_id.clone(),
            DesiredOverride {
                payload: property.as_property_version_payload.clone(),
                convention: property.as_property_convention,
                value: entry.value.clone(),
                version: version.cloned(),
                component: entry.component,
            },
        ));
    }

    out.ack_target(device, index, &target_id);
}

/// Push the scripted plan reply for `property_id`, if any.
pub fn plan_response(device: &Device, index: &ResolverIndex, property_id: Option<&str>, out: &mut RouteOutcome) {
    let Some(property_id) = property_id else {
        return;
    };
    let Some(receive) = device
        .plan
        .as_ref()
        .and_then(|p| p.receive.iter().find(|r| r.property == property_id))
    else {
        return;
    };
    if let Some(outbound) = index
        .index_of(&receive.property_out)
        .and_then(|i| device.comms.get(i))
        .and_then(Comm::as_property)
    {
        out.push_update(outbound.sdk, &outbound.id, receive.value.clone());
    }
}

/// Route a desired delta: property responses, or plan replies in plan mode.
pub fn route_desired(device: &mut Device, index: &ResolverIndex, delta: &Value) -> RouteOutcome {
    let version = delta.get(VERSION_KEY);
    let mut out = RouteOutcome::default();
    for entry in walk_desired(delta) {
        if device.plan_mode() {
            let id = index.desired_name_to_id.get(&entry.name).map(String::as_str);
            plan_response(device, index, id, &mut out);
        } else {
            property_response(device, index, &entry, version, &mut out);
        }
    }
    out
}

/// Follow-up of an executed method.
pub fn method_response(device: &Device, index: &ResolverIndex, method: &Method) -> RouteOutcome {
    let mut out = RouteOutcome::default();

    if device.plan_mode() {
        let id = index.method_name_to_id.get(&method.name).map(String::as_str);
        plan_response(device, index, id, &mut out);
        return out;
    }

    if !method.as_property {
        return out;
    }

    match &method.as_property_id {
        Some(target_id) => {
            if method.as_property_version {
                out.overrides.push((
                    target_id.clone(),
                    DesiredOverride {
                        payload: method.as_property_version_payload.clone(),
                        convention: false,
                        value: Value::Null,
                        version: None,
                        component: false,
                    },
                ));
            }
            out.ack_target(device, index, target_id);
        }
        None => {
            let mut reported = Map::new();
            reported.insert(method.name.clone(), method.response_payload());
            out.reported = Some(Value::Object(reported));
        }
    }
    out
}

/// Built-in device control commands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlCommand {
    Shutdown,
    Reboot,
    Firmware,
}

impl ControlCommand {
    /// Match a method name against the configured command names, ignoring case.
    pub fn from_method(commands: &CommandsSection, name: &str) -> Option<Self> {
        let name = name.to_lowercase();
        if name == commands.shutdown.to_lowercase() {
            Some(Self::Shutdown)
        } else if name == commands.reboot.to_lowercase() {
            Some(Self::Reboot)
        } else if name == commands.firmware.to_lowercase() {
            Some(Self::Firmware)
        } else {
            None
        }
    }
}

/// Parsed cloud-to-device command.
#[derive(Debug, Clone, PartialEq)]
pub struct CloudCommand {
    /// Method name with any `namespace:` prefix removed.
    pub method: String,
    /// Body as JSON, or as a string when it is not JSON.
    pub payload: Value,
}

/// Parse a cloud-to-device message into a method name and payload.
pub fn parse_cloud_message(message: &CloudMessage) -> Result<CloudCommand> {
    let name = message
        .properties
        .get(METHOD_NAME_PROPERTY)
        .ok_or_else(|| DevSimError::Configuration(format!("message has no {} property", METHOD_NAME_PROPERTY)))?;

    let parts: Vec<&str> = name.split(':').collect();
    let method = if parts.len() == 2 { parts[1] } else { parts[0] };

    let text = String::from_utf8_lossy(&message.body);
    let payload = serde_json::from_str(&text).unwrap_or_else(|_| Value::String(text.into_owned()));

    Ok(CloudCommand {
        method: method.to_string(),
        payload,
    })
}

/// Last invocation of a method.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct MethodInvocation {
    /// RFC 2822 UTC timestamp.
    pub date: String,
    pub payload: Value,
}

impl MethodInvocation {
    pub fn now(payload: Value) -> Self {
        Self {
            date: chrono::Utc::now().to_rfc2822(),
            payload,
        }
    }
}
