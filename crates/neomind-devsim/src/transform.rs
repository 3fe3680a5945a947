//! Payload transformation.
//!
//! Turns a `{propertyId: rawValue}` map into the wire package grouped by
//! component, plus the `{propertyId: value}` live view.

use std::collections::{BTreeMap, HashMap};

use serde_json::{Map, Value};
use tracing::debug;

use crate::index::ResolverIndex;
use crate::model::{Comm, Property, PropertyObjectKind};
use crate::plugin::DevicePlugin;
use crate::resolver::{DesiredContext, ValueResolver};

/// Package group for properties without a component.
pub const ROOT_GROUP: &str = "_root";

/// A pending single-use substitution for one property.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DesiredOverride {
    /// JSON text (or a single token) to send instead of the property value.
    pub payload: Option<String>,
    /// Merge an object-valued `value` into the parsed payload.
    pub convention: bool,
    /// Desired value that set the override.
    pub value: Value,
    /// Desired version that set the override.
    pub version: Option<Value>,
    /// The desired value arrived inside a component.
    pub component: bool,
}

/// Output of one transform.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Transformed {
    /// Component name (or [`ROOT_GROUP`]) to `{name: value}`.
    pub package: BTreeMap<String, Map<String, Value>>,
    /// Property id to value.
    pub live: Map<String, Value>,
}

impl Transformed {
    pub fn is_empty(&self) -> bool {
        self.package.is_empty()
    }

    fn insert(&mut self, property: &Property, value: Value) {
        let group = property.component_name().unwrap_or(ROOT_GROUP).to_string();
        self.live.insert(property.id.clone(), value.clone());
        // duplicate names in one group: last one wins
        self.package
            .entry(group)
            .or_default()
            .insert(property.name.clone(), value);
    }
}

/// Builds outbound payloads and owns the pending desired overrides.
#[derive(Debug, Default)]
pub struct PayloadTransformer {
    overrides: HashMap<String, DesiredOverride>,
}

impl PayloadTransformer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue an override, replacing any pending one for the same property.
    pub fn set_override(&mut self, property_id: impl Into<String>, value: DesiredOverride) {
        self.overrides.insert(property_id.into(), value);
    }

    pub fn has_override(&self, property_id: &str) -> bool {
        self.overrides.contains_key(property_id)
    }

    pub fn clear_overrides(&mut self) {
        self.overrides.clear();
    }

    /// Transform a raw payload. Ids that do not name a property are skipped.
    pub fn transform(
        &mut self,
        device_id: &str,
        comms: &[Comm],
        index: &ResolverIndex,
        payload: &Map<String, Value>,
        resolver: &mut ValueResolver,
        plugin: Option<&dyn DevicePlugin>,
    ) -> Transformed {
        let mut out = Transformed::default();

        for (id, raw) in payload {
            let Some(property) = index
                .index_of(id)
                .and_then(|i| comms.get(i))
                .and_then(Comm::as_property)
            else {
                debug!(device_id = %device_id, property_id = %id, "Skipping unknown property");
                continue;
            };

            let value = self.resolve(device_id, property, raw, resolver, plugin);
            out.insert(property, value);
        }

        out
    }

    fn resolve(
        &mut self,
        device_id: &str,
        property: &Property,
        raw: &Value,
        resolver: &mut ValueResolver,
        plugin: Option<&dyn DevicePlugin>,
    ) -> Value {
        let templated = property
            .property_object
            .as_ref()
            .filter(|o| o.kind == PropertyObjectKind::Templated);

        if let Some(plugin) = plugin.filter(|_| property.property_object.is_some()) {
            let offered = templated
                .and_then(|o| o.template.as_deref())
                .and_then(|t| serde_json::from_str(t).ok())
                .unwrap_or_else(|| raw.clone());
            if let Some(value) = plugin.property_response(device_id, property, &offered) {
                return value;
            }
        }

        if let Some(pending) = self.overrides.remove(&property.id) {
            return apply_override(&pending, resolver);
        }

        if let Some(object) = templated {
            return match render_template(object.template.as_deref(), property.string, raw) {
                Ok(mut value) => {
                    resolver.resolve_tree(&mut value, None);
                    value
                }
                Err(e) => Value::String(format!("ERR - transformPayload: {}", e)),
            };
        }

        resolver.resolve_auto(raw, None)
    }
}

fn apply_override(pending: &DesiredOverride, resolver: &mut ValueResolver) -> Value {
    let ctx = DesiredContext {
        value: pending.value.clone(),
        version: pending.version.clone(),
    };
    let text = pending.payload.as_deref().unwrap_or_default();

    match serde_json::from_str::<Value>(text) {
        Ok(mut parsed) => {
            if pending.convention {
                if let (Value::Object(target), Value::Object(extra)) = (&mut parsed, &pending.value) {
                    for (k, v) in extra {
                        target.insert(k.clone(), v.clone());
                    }
                }
            }
            resolver.resolve_tree(&mut parsed, Some(&ctx));
            parsed
        }
        Err(_) if pending.payload.is_none() => Value::Null,
        Err(_) => resolver.resolve_auto(&Value::String(text.to_string()), Some(&ctx)),
    }
}

fn render_template(template: Option<&str>, as_string: bool, raw: &Value) -> Result<Value, String> {
    let template = template.ok_or_else(|| "template is missing".to_string())?;
    let text = match raw {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    };
    let substitute = if as_string { format!("\"{}\"", text) } else { text };
    let replaced = template.replace("\"AUTO_VALUE\"", &substitute);
    serde_json::from_str(&replaced).map_err(|e| e.to_string())
}
