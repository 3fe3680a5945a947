//! IoT Hub and DPS MQTT topic conventions.

use std::collections::HashMap;

/// Hub MQTT api-version.
pub const HUB_API_VERSION: &str = "2021-04-12";
/// DPS MQTT api-version.
pub const DPS_API_VERSION: &str = "2019-03-31";

pub const TWIN_RESPONSE_FILTER: &str = "$iothub/twin/res/#";
pub const DESIRED_FILTER: &str = "$iothub/twin/PATCH/properties/desired/#";
pub const METHODS_FILTER: &str = "$iothub/methods/POST/#";
pub const DPS_RESPONSE_FILTER: &str = "$dps/registrations/res/#";

const TWIN_RESPONSE_PREFIX: &str = "$iothub/twin/res/";
const DESIRED_PREFIX: &str = "$iothub/twin/PATCH/properties/desired/";
const METHODS_PREFIX: &str = "$iothub/methods/POST/";
const DPS_RESPONSE_PREFIX: &str = "$dps/registrations/res/";

pub fn client_id(device_id: &str, module_id: Option<&str>) -> String {
    match module_id {
        Some(module) => format!("{}/{}", device_id, module),
        None => device_id.to_string(),
    }
}

pub fn hub_username(host: &str, device_id: &str, module_id: Option<&str>) -> String {
    format!(
        "{}/{}/?api-version={}",
        host,
        client_id(device_id, module_id),
        HUB_API_VERSION
    )
}

fn identity_prefix(device_id: &str, module_id: Option<&str>) -> String {
    match module_id {
        Some(module) => format!("devices/{}/modules/{}", device_id, module),
        None => format!("devices/{}", device_id),
    }
}

/// Telemetry topic with the message properties encoded as a property bag.
pub fn telemetry_topic(
    device_id: &str,
    module_id: Option<&str>,
    content_type: &str,
    content_encoding: &str,
    properties: &[(String, String)],
) -> String {
    let mut bag = vec![
        format!("$.ct={}", urlencoding::encode(content_type)),
        format!("$.ce={}", urlencoding::encode(content_encoding)),
    ];
    bag.extend(
        properties
            .iter()
            .map(|(k, v)| format!("{}={}", urlencoding::encode(k), urlencoding::encode(v))),
    );
    format!(
        "{}/messages/events/{}",
        identity_prefix(device_id, module_id),
        bag.join("&")
    )
}

pub fn cloud_message_filter(device_id: &str) -> String {
    format!("devices/{}/messages/devicebound/#", device_id)
}

pub fn twin_get_topic(rid: &str) -> String {
    format!("$iothub/twin/GET/?$rid={}", rid)
}

pub fn twin_patch_topic(rid: &str) -> String {
    format!("$iothub/twin/PATCH/properties/reported/?$rid={}", rid)
}

pub fn method_response_topic(status: u16, rid: &str) -> String {
    format!("$iothub/methods/res/{}/?$rid={}", status, rid)
}

/// Classified inbound hub topic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HubTopic {
    TwinResponse { status: u16, rid: String },
    DesiredPatch,
    MethodRequest { name: String, rid: String },
    CloudMessage { properties: HashMap<String, String> },
    Other,
}

/// Decode a `k=v&k2=v2` property bag.
pub fn parse_property_bag(bag: &str) -> HashMap<String, String> {
    bag.trim_start_matches('?')
        .split('&')
        .filter(|p| !p.is_empty())
        .map(|pair| {
            let (k, v) = pair.split_once('=').unwrap_or((pair, ""));
            (decode(k), decode(v))
        })
        .collect()
}

fn decode(text: &str) -> String {
    urlencoding::decode(text)
        .map(|c| c.into_owned())
        .unwrap_or_else(|_| text.to_string())
}

/// Classify an inbound topic.
pub fn parse_hub_topic(topic: &str) -> HubTopic {
    if let Some(rest) = topic.strip_prefix(TWIN_RESPONSE_PREFIX) {
        let (status, query) = rest.split_once('/').unwrap_or((rest, ""));
        let query = parse_property_bag(query);
        return match (status.parse(), query.get("$rid")) {
            (Ok(status), Some(rid)) => HubTopic::TwinResponse {
                status,
                rid: rid.clone(),
            },
            _ => HubTopic::Other,
        };
    }

    if topic.starts_with(DESIRED_PREFIX) {
        return HubTopic::DesiredPatch;
    }

    if let Some(rest) = topic.strip_prefix(METHODS_PREFIX) {
        let (name, query) = rest.split_once('/').unwrap_or((rest, ""));
        return match parse_property_bag(query).get("$rid") {
            Some(rid) => HubTopic::MethodRequest {
                name: decode(name),
                rid: rid.clone(),
            },
            None => HubTopic::Other,
        };
    }

    if let Some(idx) = topic.find("/messages/devicebound/") {
        let bag = &topic[idx + "/messages/devicebound/".len()..];
        return HubTopic::CloudMessage {
            properties: parse_property_bag(bag),
        };
    }

    HubTopic::Other
}

pub fn dps_username(id_scope: &str, registration_id: &str) -> String {
    format!(
        "{}/registrations/{}/api-version={}",
        id_scope, registration_id, DPS_API_VERSION
    )
}

/// Resource signed for DPS authentication.
pub fn dps_resource(id_scope: &str, registration_id: &str) -> String {
    format!("{}/registrations/{}", id_scope, registration_id)
}

pub fn dps_register_topic(rid: &str) -> String {
    format!("$dps/registrations/PUT/iotdps-register/?$rid={}", rid)
}

pub fn dps_status_topic(rid: &str, operation_id: &str) -> String {
    format!(
        "$dps/registrations/GET/iotdps-get-operationstatus/?$rid={}&operationId={}",
        rid,
        urlencoding::encode(operation_id)
    )
}

/// Response topic of a DPS request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DpsResponse {
    pub status: u16,
    pub rid: String,
    /// Seconds to wait before polling again.
    pub retry_after: Option<u64>,
}

pub fn parse_dps_topic(topic: &str) -> Option<DpsResponse> {
    let rest = topic.strip_prefix(DPS_RESPONSE_PREFIX)?;
    let (status, query) = rest.split_once('/').unwrap_or((rest, ""));
    let query = parse_property_bag(query);
    Some(DpsResponse {
        status: status.parse().ok()?,
        rid: query.get("$rid")?.clone(),
        retry_after: query.get("retry-after").and_then(|v| v.parse().ok()),
    })
}
