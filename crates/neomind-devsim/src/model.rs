//! Device definition types.
//!
//! These mirror the JSON device documents produced by the management layer,
//! field names included, so a device list can be loaded unchanged.

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

use crate::stats::Channel;

/// How a device reaches its hub.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum DeviceKind {
    /// Direct connection string.
    #[default]
    Hub,
    /// Provisioned through DPS.
    Dps,
    /// Edge gateway, provisioned through DPS.
    Edge,
    /// Device behind an edge gateway, provisioned through DPS.
    LeafDevice,
    /// Module running on a simulated edge device.
    Module,
    /// Module running inside a real edge runtime.
    ModuleHosted,
    /// Inert definition used to clone other devices.
    Template,
}

impl DeviceKind {
    /// Whether the device must register through DPS before connecting.
    pub fn requires_provisioning(&self) -> bool {
        matches!(self, Self::Dps | Self::Edge | Self::LeafDevice)
    }

    pub fn is_module(&self) -> bool {
        matches!(self, Self::Module | Self::ModuleHosted)
    }
}

/// Connection and behavior settings of a device.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceConfiguration {
    #[serde(rename = "_kind", default)]
    pub kind: DeviceKind,

    #[serde(default)]
    pub device_id: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub module_id: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mock_device_name: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connection_string: Option<String>,

    /// DPS id scope.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scope_id: Option<String>,

    /// Custom DPS payload, JSON or plain text.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dps_payload: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sas_key: Option<String>,

    /// `sas_key` is a group master key; derive the device key from it.
    #[serde(default)]
    pub is_master_key: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gateway_sas_key: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gateway_device_id: Option<String>,

    #[serde(default)]
    pub plan_mode: bool,

    /// Index into the simulation geo areas. Numbers and numeric strings are accepted.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub geo: Option<Value>,
}

impl DeviceConfiguration {
    pub fn geo_index(&self) -> usize {
        match &self.geo {
            Some(Value::Number(n)) => n.as_u64().unwrap_or(0) as usize,
            Some(Value::String(s)) => s.trim().parse().unwrap_or(0),
            _ => 0,
        }
    }
}

/// A simulated device.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Device {
    #[serde(rename = "_id")]
    pub id: String,

    pub configuration: DeviceConfiguration,

    #[serde(default)]
    pub comms: Vec<Comm>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub plan: Option<Plan>,
}

impl Device {
    pub fn kind(&self) -> DeviceKind {
        self.configuration.kind
    }

    pub fn is_template(&self) -> bool {
        self.configuration.kind == DeviceKind::Template
    }

    pub fn plan_mode(&self) -> bool {
        self.configuration.plan_mode
    }

    pub fn connection_string(&self) -> Option<&str> {
        self.configuration.connection_string.as_deref()
    }
}

/// A property or method.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "_type", rename_all = "lowercase")]
pub enum Comm {
    Property(Property),
    Method(Method),
}

impl Comm {
    pub fn id(&self) -> &str {
        match self {
            Self::Property(p) => &p.id,
            Self::Method(m) => &m.id,
        }
    }

    pub fn name(&self) -> &str {
        match self {
            Self::Property(p) => &p.name,
            Self::Method(m) => &m.name,
        }
    }

    pub fn as_property(&self) -> Option<&Property> {
        match self {
            Self::Property(p) => Some(p),
            Self::Method(_) => None,
        }
    }

    pub fn as_property_mut(&mut self) -> Option<&mut Property> {
        match self {
            Self::Property(p) => Some(p),
            Self::Method(_) => None,
        }
    }

    pub fn as_method(&self) -> Option<&Method> {
        match self {
            Self::Method(m) => Some(m),
            Self::Property(_) => None,
        }
    }
}

/// Desired (`c2d`) or reported (`d2c`) twin property.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FlowDirection {
    #[default]
    D2c,
    C2d,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PropertyType {
    #[serde(default)]
    pub direction: FlowDirection,
}

/// Component namespace of a comm.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Component {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub name: String,
}

/// Returns the component name when the component is enabled.
pub fn component_name(component: &Option<Component>) -> Option<&str> {
    component
        .as_ref()
        .filter(|c| c.enabled && !c.name.is_empty())
        .map(|c| c.name.as_str())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PropertyObjectKind {
    #[default]
    Default,
    Templated,
}

/// Payload descriptor of a property.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PropertyObject {
    #[serde(rename = "type", default)]
    pub kind: PropertyObjectKind,
    /// JSON template; the literal `"AUTO_VALUE"` is replaced by the property value.
    #[serde(default)]
    pub template: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunloopUnit {
    #[default]
    Secs,
    Mins,
}

impl RunloopUnit {
    pub fn millis(&self) -> u64 {
        match self {
            Self::Secs => 1_000,
            Self::Mins => 60_000,
        }
    }
}

/// Scheduled reporting settings of a property.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Runloop {
    #[serde(default)]
    pub include: bool,
    #[serde(default)]
    pub unit: RunloopUnit,
    #[serde(default, deserialize_with = "lenient_u64")]
    pub value: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value_max: Option<u64>,
    /// Use the simulation-wide period range for `unit` instead of `value`.
    #[serde(default, rename = "override")]
    pub override_period: bool,
    #[serde(default)]
    pub on_start_up: bool,
    /// Derived period, kept once computed.
    #[serde(rename = "_ms", default, skip_serializing_if = "Option::is_none")]
    pub period_ms: Option<u64>,
}

/// Mock sensor behavior.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MockKind {
    Fan,
    Hotplate,
    Battery,
    Random,
    Inc,
    Dec,
    Function,
}

/// Mock sensor definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Mock {
    #[serde(rename = "_type")]
    pub kind: MockKind,
    #[serde(default, deserialize_with = "lenient_f64")]
    pub init: f64,
    #[serde(default, deserialize_with = "lenient_f64")]
    pub running: f64,
    #[serde(default, deserialize_with = "lenient_f64")]
    pub variance: f64,
    #[serde(default, deserialize_with = "lenient_f64")]
    pub time_to_running: f64,
    /// Value that snaps the sensor back to `init`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reset: Option<Value>,
    /// Endpoint URL for `function` sensors.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub function: Option<String>,
}

impl Mock {
    pub fn reset_value(&self) -> Option<f64> {
        self.reset.as_ref().and_then(number_of)
    }
}

/// A simulated property.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Property {
    #[serde(rename = "_id")]
    pub id: String,

    pub name: String,

    /// Channel the property reports on.
    pub sdk: Channel,

    /// Report the value as a string.
    #[serde(default)]
    pub string: bool,

    #[serde(default)]
    pub value: Value,

    /// Desired version last applied to this property.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<Value>,

    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(rename = "type", default)]
    pub property_type: PropertyType,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mock: Option<Mock>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub runloop: Option<Runloop>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub component: Option<Component>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub property_object: Option<PropertyObject>,

    /// Acknowledge desired updates through another property.
    #[serde(default, deserialize_with = "truthy")]
    pub as_property: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub as_property_id: Option<String>,

    /// Acknowledge with a versioned payload override.
    #[serde(default, deserialize_with = "truthy")]
    pub as_property_version: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub as_property_version_payload: Option<String>,

    /// Merge object-valued desired values into the override payload.
    #[serde(default, deserialize_with = "truthy")]
    pub as_property_convention: bool,
}

impl Property {
    pub fn component_name(&self) -> Option<&str> {
        component_name(&self.component)
    }

    pub fn is_desired(&self) -> bool {
        self.sdk == Channel::Twin && self.property_type.direction == FlowDirection::C2d
    }

    /// Value formatted per the `string` flag.
    pub fn formatted_value(&self) -> Value {
        format_value(self.string, &self.value)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Execution {
    /// Cloud-to-device message.
    Cloud,
    /// Direct method.
    #[default]
    Direct,
}

/// A simulated command.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Method {
    #[serde(rename = "_id")]
    pub id: String,

    pub name: String,

    #[serde(default)]
    pub execution: Execution,

    /// Response status code.
    #[serde(default = "default_status", deserialize_with = "lenient_status")]
    pub status: u16,

    /// Response payload, JSON text.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub component: Option<Component>,

    #[serde(default, deserialize_with = "truthy")]
    pub as_property: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub as_property_id: Option<String>,

    #[serde(default, deserialize_with = "truthy")]
    pub as_property_version: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub as_property_version_payload: Option<String>,
}

impl Method {
    pub fn component_name(&self) -> Option<&str> {
        component_name(&self.component)
    }

    /// Response payload as JSON. Missing payloads are `{}`; non-JSON text is kept as a string.
    pub fn response_payload(&self) -> Value {
        match self.payload.as_deref().map(str::trim) {
            None | Some("") => Value::Object(Default::default()),
            Some(text) => {
                serde_json::from_str(text).unwrap_or_else(|_| Value::String(text.to_string()))
            }
        }
    }
}

/// Scripted plan.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Plan {
    #[serde(rename = "loop", default)]
    pub looping: bool,
    #[serde(default)]
    pub startup: Vec<PlanStep>,
    #[serde(default)]
    pub timeline: Vec<PlanTimelineStep>,
    #[serde(default)]
    pub receive: Vec<PlanReceive>,
}

/// Value sent right after connect.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PlanStep {
    pub property: String,
    #[serde(default)]
    pub value: Value,
}

/// Value sent at `time` seconds into the plan.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PlanTimelineStep {
    #[serde(deserialize_with = "lenient_f64")]
    pub time: f64,
    pub property: String,
    #[serde(default)]
    pub value: Value,
}

/// Response to an inbound desired property or method.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlanReceive {
    pub property: String,
    pub property_out: String,
    #[serde(default)]
    pub value: Value,
}

/// Format a raw value for sending.
///
/// With `as_string` the value is rendered as text. Otherwise string values
/// that read as numbers, booleans or JSON documents become those values.
pub fn format_value(as_string: bool, value: &Value) -> Value {
    if as_string {
        return match value {
            Value::String(_) => value.clone(),
            Value::Null => Value::String(String::new()),
            other => Value::String(other.to_string()),
        };
    }

    let Value::String(text) = value else {
        return value.clone();
    };
    let trimmed = text.trim();
    if let Ok(i) = trimmed.parse::<i64>() {
        return Value::from(i);
    }
    if let Ok(f) = trimmed.parse::<f64>() {
        if f.is_finite() {
            return Value::from(f);
        }
    }
    match trimmed {
        "true" => return Value::Bool(true),
        "false" => return Value::Bool(false),
        _ => {}
    }
    if trimmed.starts_with('{') || trimmed.starts_with('[') {
        if let Ok(parsed) = serde_json::from_str(trimmed) {
            return parsed;
        }
    }
    value.clone()
}

/// Numeric reading of a JSON value, accepting numeric strings.
pub fn number_of(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn default_true() -> bool {
    true
}

fn default_status() -> u16 {
    200
}

fn truthy<'de, D: Deserializer<'de>>(deserializer: D) -> Result<bool, D::Error> {
    let value = Value::deserialize(deserializer)?;
    Ok(match value {
        Value::Null => false,
        Value::Bool(b) => b,
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
        Value::String(s) => !s.is_empty(),
        Value::Array(_) | Value::Object(_) => true,
    })
}

fn lenient_f64<'de, D: Deserializer<'de>>(deserializer: D) -> Result<f64, D::Error> {
    let value = Value::deserialize(deserializer)?;
    Ok(number_of(&value).unwrap_or(0.0))
}

fn lenient_u64<'de, D: Deserializer<'de>>(deserializer: D) -> Result<u64, D::Error> {
    let value = Value::deserialize(deserializer)?;
    Ok(number_of(&value).map(|f| f.max(0.0) as u64).unwrap_or(0))
}

fn lenient_status<'de, D: Deserializer<'de>>(deserializer: D) -> Result<u16, D::Error> {
    let value = Value::deserialize(deserializer)?;
    Ok(number_of(&value)
        .map(|f| f as u16)
        .unwrap_or_else(default_status))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_format_value() {
        assert_eq!(format_value(false, &json!("42")), json!(42));
        assert_eq!(format_value(false, &json!("4.5")), json!(4.5));
        assert_eq!(format_value(false, &json!("true")), json!(true));
        assert_eq!(format_value(false, &json!("{\"a\":1}")), json!({"a": 1}));
        assert_eq!(format_value(false, &json!("AUTO_INTEGER")), json!("AUTO_INTEGER"));
        assert_eq!(format_value(true, &json!("42")), json!("42"));
        assert_eq!(format_value(true, &json!(42)), json!("42"));
        assert_eq!(format_value(false, &json!(7)), json!(7));
    }

    #[test]
    fn test_deserialize_device() {
        let device: Device = serde_json::from_value(json!({
            "_id": "dev-1",
            "configuration": {
                "_kind": "leafDevice",
                "deviceId": "dev-1",
                "scopeId": "0ne000",
                "isMasterKey": true,
                "gatewayDeviceId": "gw",
                "geo": "1"
            },
            "comms": [
                {
                    "_type": "property",
                    "_id": "p1",
                    "name": "temperature",
                    "sdk": "msg",
                    "value": "AUTO_DOUBLE",
                    "runloop": { "include": true, "unit": "secs", "value": "10", "override": false },
                    "mock": { "_type": "hotplate", "init": "20", "running": 80, "variance": 0.1, "timeToRunning": 60000 }
                },
                {
                    "_type": "property",
                    "_id": "p2",
                    "name": "setpoint",
                    "sdk": "twin",
                    "type": { "direction": "c2d" },
                    "asProperty": "ack",
                    "asPropertyId": "p3",
                    "component": { "enabled": true, "name": "thermostat" }
                },
                {
                    "_type": "method",
                    "_id": "m1",
                    "name": "reboot",
                    "execution": "direct",
                    "status": "200",
                    "payload": "{\"ok\":true}"
                }
            ]
        }))
        .unwrap();

        assert_eq!(device.kind(), DeviceKind::LeafDevice);
        assert!(device.kind().requires_provisioning());
        assert_eq!(device.configuration.geo_index(), 1);
        assert_eq!(device.comms.len(), 3);

        let p1 = device.comms[0].as_property().unwrap();
        assert!(p1.enabled);
        assert_eq!(p1.runloop.as_ref().unwrap().value, 10);
        assert_eq!(p1.mock.as_ref().unwrap().init, 20.0);

        let p2 = device.comms[1].as_property().unwrap();
        assert!(p2.is_desired());
        assert!(p2.as_property);
        assert_eq!(p2.component_name(), Some("thermostat"));

        let m1 = device.comms[2].as_method().unwrap();
        assert_eq!(m1.status, 200);
        assert_eq!(m1.response_payload(), json!({"ok": true}));
    }

    #[test]
    fn test_method_payload_fallbacks() {
        let mut method = Method {
            id: "m".into(),
            name: "m".into(),
            ..Default::default()
        };
        assert_eq!(method.response_payload(), json!({}));
        method.payload = Some("not json".into());
        assert_eq!(method.response_payload(), json!("not json"));
    }
}
