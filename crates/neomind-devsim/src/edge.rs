//! Edge runtime environment and module status reporting.

use serde_json::{json, Map, Value};

use crate::error::{DevSimError, Result};

/// Environment variable names set by an edge runtime.
pub mod env_vars {
    pub const WORKLOAD_URI: &str = "IOTEDGE_WORKLOADURI";
    pub const DEVICE_ID: &str = "IOTEDGE_DEVICEID";
    pub const MODULE_ID: &str = "IOTEDGE_MODULEID";
    pub const MODULE_GENERATION_ID: &str = "IOTEDGE_MODULEGENERATIONID";
    pub const IOTHUB_HOSTNAME: &str = "IOTEDGE_IOTHUBHOSTNAME";
    pub const AUTH_SCHEME: &str = "IOTEDGE_AUTHSCHEME";
    pub const GATEWAY_HOSTNAME: &str = "IOTEDGE_GATEWAYHOSTNAME";
    pub const API_VERSION: &str = "IOTEDGE_APIVERSION";
    pub const EDGE_HUB_CONNECTION_STRING: &str = "EdgeHubConnectionString";
    pub const IOTHUB_CONNECTION_STRING: &str = "IotHubConnectionString";
}

/// Identity of the edge module hosting this process, if any.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EdgeEnvironment {
    pub workload_uri: Option<String>,
    pub device_id: Option<String>,
    pub module_id: Option<String>,
    pub module_generation_id: Option<String>,
    pub iothub_hostname: Option<String>,
    pub auth_scheme: Option<String>,
    pub gateway_hostname: Option<String>,
    pub api_version: Option<String>,
    pub edge_hub_connection_string: Option<String>,
    pub iothub_connection_string: Option<String>,
}

impl EdgeEnvironment {
    /// Read the process environment.
    pub fn from_env() -> Self {
        let var = |name: &str| std::env::var(name).ok().filter(|v| !v.is_empty());
        Self {
            workload_uri: var(env_vars::WORKLOAD_URI),
            device_id: var(env_vars::DEVICE_ID),
            module_id: var(env_vars::MODULE_ID),
            module_generation_id: var(env_vars::MODULE_GENERATION_ID),
            iothub_hostname: var(env_vars::IOTHUB_HOSTNAME),
            auth_scheme: var(env_vars::AUTH_SCHEME),
            gateway_hostname: var(env_vars::GATEWAY_HOSTNAME),
            api_version: var(env_vars::API_VERSION),
            edge_hub_connection_string: var(env_vars::EDGE_HUB_CONNECTION_STRING),
            iothub_connection_string: var(env_vars::IOTHUB_CONNECTION_STRING),
        }
    }

    /// Whether any `IOTEDGE_*` identity variable is set.
    pub fn is_present(&self) -> bool {
        [
            &self.workload_uri,
            &self.device_id,
            &self.module_id,
            &self.module_generation_id,
            &self.iothub_hostname,
            &self.auth_scheme,
        ]
        .iter()
        .any(|v| v.is_some())
    }

    /// Whether this host runs exactly `device_id`/`module_id`.
    pub fn matches(&self, device_id: &str, module_id: &str) -> bool {
        self.device_id.as_deref() == Some(device_id) && self.module_id.as_deref() == Some(module_id)
    }

    /// Check that this host runs the addressed module.
    pub fn check(&self, device_id: &str, module_id: &str) -> Result<()> {
        if !self.is_present() {
            return Err(DevSimError::Environment("missing IOTEDGE_* variables".into()));
        }
        if !self.matches(device_id, module_id) {
            return Err(DevSimError::Environment(format!(
                "host runs {}/{}, not {}/{}",
                self.device_id.as_deref().unwrap_or("-"),
                self.module_id.as_deref().unwrap_or("-"),
                device_id,
                module_id
            )));
        }
        Ok(())
    }
}

/// Module id of the edge agent.
pub const EDGE_AGENT_MODULE: &str = "$edgeAgent";

const RUNNING: &str = "running";
const STOPPED: &str = "stopped";

/// Forced status for a module status report.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusOverride {
    Start,
    Stop,
}

/// Reported patch for the edge agent.
///
/// `modules` maps module names to a truthy running flag. An override forces
/// every entry, otherwise system modules follow `running`.
pub fn module_status_patch(modules: &Map<String, Value>, over: Option<StatusOverride>, running: bool) -> Value {
    let status = |flag: bool| match over {
        Some(StatusOverride::Start) => RUNNING,
        Some(StatusOverride::Stop) => STOPPED,
        None if flag => RUNNING,
        None => STOPPED,
    };

    let module_states: Map<String, Value> = modules
        .iter()
        .map(|(name, flag)| {
            let on = flag.as_bool().unwrap_or(!flag.is_null());
            (name.clone(), json!({ "runtimeStatus": status(on) }))
        })
        .collect();

    let system = status(running);
    json!({
        "systemModules": {
            "edgeAgent": { "runtimeStatus": system },
            "edgeHub": { "runtimeStatus": system },
        },
        "modules": module_states,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn env() -> EdgeEnvironment {
        EdgeEnvironment {
            device_id: Some("edge-1".into()),
            module_id: Some("sensor".into()),
            ..Default::default()
        }
    }

    #[test]
    fn test_environment_check() {
        assert!(matches!(
            EdgeEnvironment::default().check("edge-1", "sensor"),
            Err(DevSimError::Environment(_))
        ));
        assert!(env().check("edge-1", "sensor").is_ok());
        assert!(env().check("edge-1", "other").is_err());
    }

    #[test]
    fn test_module_status_patch() {
        let mut modules = Map::new();
        modules.insert("a".into(), json!(true));
        modules.insert("b".into(), json!(false));

        let patch = module_status_patch(&modules, None, true);
        assert_eq!(patch["systemModules"]["edgeHub"]["runtimeStatus"], "running");
        assert_eq!(patch["modules"]["a"]["runtimeStatus"], "running");
        assert_eq!(patch["modules"]["b"]["runtimeStatus"], "stopped");

        let patch = module_status_patch(&modules, Some(StatusOverride::Stop), true);
        assert_eq!(patch["systemModules"]["edgeAgent"]["runtimeStatus"], "stopped");
        assert_eq!(patch["modules"]["a"]["runtimeStatus"], "stopped");
    }
}
