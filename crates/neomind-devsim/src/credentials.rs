//! Hub credentials: connection strings, derived keys and SAS tokens.

use std::fmt;
use std::str::FromStr;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use hmac::{Hmac, Mac};
use sha2::Sha256;

use crate::error::{DevSimError, Result};

type HmacSha256 = Hmac<Sha256>;

fn create_hmac(key_b64: &str) -> Result<HmacSha256> {
    let key = BASE64
        .decode(key_b64.trim())
        .map_err(|e| DevSimError::Configuration(format!("Key is not valid base64: {}", e)))?;
    HmacSha256::new_from_slice(&key)
        .map_err(|e| DevSimError::Configuration(format!("Invalid HMAC key: {}", e)))
}

/// Derive a device key from a group master key (base64 in, base64 out).
pub fn derive_symmetric_key(master_key: &str, registration_id: &str) -> Result<String> {
    let mut mac = create_hmac(master_key)?;
    mac.update(registration_id.as_bytes());
    Ok(BASE64.encode(mac.finalize().into_bytes()))
}

/// Unix seconds `hours` from now.
pub fn expiry_from_hours(hours: u64) -> u64 {
    chrono::Utc::now().timestamp().max(0) as u64 + 3600 * hours
}

/// Parsed `Key=Value;...` hub connection string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionString {
    pub host_name: String,
    pub device_id: String,
    pub shared_access_key: Option<String>,
    pub shared_access_key_name: Option<String>,
    pub module_id: Option<String>,
    pub gateway_id: Option<String>,
    extra: Vec<(String, String)>,
}

impl ConnectionString {
    pub fn new(host_name: impl Into<String>, device_id: impl Into<String>) -> Self {
        Self {
            host_name: host_name.into(),
            device_id: device_id.into(),
            shared_access_key: None,
            shared_access_key_name: None,
            module_id: None,
            gateway_id: None,
            extra: Vec::new(),
        }
    }

    pub fn with_key(mut self, key: impl Into<String>) -> Self {
        self.shared_access_key = Some(key.into());
        self
    }

    pub fn with_module(mut self, module_id: impl Into<String>) -> Self {
        self.module_id = Some(module_id.into());
        self
    }

    pub fn with_gateway(mut self, gateway_id: impl Into<String>) -> Self {
        self.gateway_id = Some(gateway_id.into());
        self
    }

    /// Resource URI used when signing: `host/devices/id[/modules/mid]`.
    pub fn resource_uri(&self) -> String {
        match &self.module_id {
            Some(module) => format!("{}/devices/{}/modules/{}", self.host_name, self.device_id, module),
            None => format!("{}/devices/{}", self.host_name, self.device_id),
        }
    }
}

impl FromStr for ConnectionString {
    type Err = DevSimError;

    fn from_str(s: &str) -> Result<Self> {
        let mut host_name = None;
        let mut device_id = None;
        let mut cs = ConnectionString::new("", "");

        for part in s.split(';').map(str::trim).filter(|p| !p.is_empty()) {
            let (key, value) = part
                .split_once('=')
                .ok_or_else(|| DevSimError::ConnectionString(format!("segment '{}' has no value", part)))?;
            let value = value.to_string();
            match key {
                "HostName" => host_name = Some(value),
                "DeviceId" => device_id = Some(value),
                "SharedAccessKey" => cs.shared_access_key = Some(value),
                "SharedAccessKeyName" => cs.shared_access_key_name = Some(value),
                "ModuleId" => cs.module_id = Some(value),
                "GatewayId" => cs.gateway_id = Some(value),
                other => cs.extra.push((other.to_string(), value)),
            }
        }

        cs.host_name = host_name
            .filter(|h| !h.is_empty())
            .ok_or_else(|| DevSimError::ConnectionString("missing HostName".into()))?;
        cs.device_id = device_id
            .filter(|d| !d.is_empty())
            .ok_or_else(|| DevSimError::ConnectionString("missing DeviceId".into()))?;
        Ok(cs)
    }
}

impl fmt::Display for ConnectionString {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "HostName={};DeviceId={}", self.host_name, self.device_id)?;
        if let Some(name) = &self.shared_access_key_name {
            write!(f, ";SharedAccessKeyName={}", name)?;
        }
        if let Some(key) = &self.shared_access_key {
            write!(f, ";SharedAccessKey={}", key)?;
        }
        if let Some(module) = &self.module_id {
            write!(f, ";ModuleId={}", module)?;
        }
        if let Some(gateway) = &self.gateway_id {
            write!(f, ";GatewayId={}", gateway)?;
        }
        for (k, v) in &self.extra {
            write!(f, ";{}={}", k, v)?;
        }
        Ok(())
    }
}

/// Shared access signature token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SasToken {
    resource: String,
    signature: String,
    expiry: u64,
    key_name: Option<String>,
}

impl SasToken {
    /// Sign `resource_uri` with a base64 key until `expiry` (unix seconds).
    pub fn create(resource_uri: &str, key: &str, expiry: u64, key_name: Option<&str>) -> Result<Self> {
        let resource = urlencoding::encode(resource_uri).into_owned();
        let mut mac = create_hmac(key)?;
        mac.update(format!("{}\n{}", resource, expiry).as_bytes());
        let signature = BASE64.encode(mac.finalize().into_bytes());
        Ok(Self {
            resource,
            signature,
            expiry,
            key_name: key_name.map(str::to_string),
        })
    }

    pub fn expiry(&self) -> u64 {
        self.expiry
    }

    /// Whole hours left before expiry.
    pub fn hours_left(&self) -> u64 {
        let now = chrono::Utc::now().timestamp().max(0) as u64;
        self.expiry.saturating_sub(now).div_ceil(3600)
    }
}

impl fmt::Display for SasToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "SharedAccessSignature sr={}&sig={}&se={}",
            self.resource,
            urlencoding::encode(&self.signature),
            self.expiry
        )?;
        if let Some(name) = &self.key_name {
            write!(f, "&skn={}", name)?;
        }
        Ok(())
    }
}

/// How a hub client authenticates.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HubCredentials {
    /// Pre-computed SAS token.
    SharedAccessSignature {
        host_name: String,
        device_id: String,
        module_id: Option<String>,
        token: SasToken,
    },
    /// Raw connection string; the client signs on its own.
    ConnectionString(ConnectionString),
}

impl HubCredentials {
    /// Build credentials from a connection string, signing it when `sas_mode` is set.
    pub fn from_connection_string(connection_string: &str, sas_mode: bool, expiry: u64) -> Result<Self> {
        let cs: ConnectionString = connection_string.parse()?;
        if !sas_mode {
            return Ok(Self::ConnectionString(cs));
        }
        let key = cs
            .shared_access_key
            .as_deref()
            .ok_or_else(|| DevSimError::ConnectionString("missing SharedAccessKey".into()))?;
        let token = SasToken::create(&cs.resource_uri(), key, expiry, None)?;
        Ok(Self::SharedAccessSignature {
            host_name: cs.host_name.clone(),
            device_id: cs.device_id.clone(),
            module_id: cs.module_id.clone(),
            token,
        })
    }

    pub fn host_name(&self) -> &str {
        match self {
            Self::SharedAccessSignature { host_name, .. } => host_name,
            Self::ConnectionString(cs) => &cs.host_name,
        }
    }

    pub fn device_id(&self) -> &str {
        match self {
            Self::SharedAccessSignature { device_id, .. } => device_id,
            Self::ConnectionString(cs) => &cs.device_id,
        }
    }

    pub fn module_id(&self) -> Option<&str> {
        match self {
            Self::SharedAccessSignature { module_id, .. } => module_id.as_deref(),
            Self::ConnectionString(cs) => cs.module_id.as_deref(),
        }
    }

    /// Password presented to the hub, signing now if needed.
    pub fn password(&self, expiry: u64) -> Result<String> {
        match self {
            Self::SharedAccessSignature { token, .. } => Ok(token.to_string()),
            Self::ConnectionString(cs) => {
                let key = cs
                    .shared_access_key
                    .as_deref()
                    .ok_or_else(|| DevSimError::ConnectionString("missing SharedAccessKey".into()))?;
                let token = SasToken::create(
                    &cs.resource_uri(),
                    key,
                    expiry,
                    cs.shared_access_key_name.as_deref(),
                )?;
                Ok(token.to_string())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const KEY: &str = "dGhpcyBpcyBhIHRlc3Qga2V5IGZvciBobWFjIQ==";

    #[test]
    fn test_parse_and_format_roundtrip_keeps_gateway() {
        let text = "HostName=hub.azure-devices.net;DeviceId=leaf-1;SharedAccessKey=abc=;GatewayId=gw-1";
        let cs: ConnectionString = text.parse().unwrap();
        assert_eq!(cs.host_name, "hub.azure-devices.net");
        assert_eq!(cs.device_id, "leaf-1");
        assert_eq!(cs.shared_access_key.as_deref(), Some("abc="));
        assert_eq!(cs.gateway_id.as_deref(), Some("gw-1"));
        assert_eq!(cs.to_string(), text);
    }

    #[test]
    fn test_parse_rejects_missing_fields() {
        assert!(matches!(
            "DeviceId=x".parse::<ConnectionString>(),
            Err(DevSimError::ConnectionString(_))
        ));
        assert!("HostName=h;garbage".parse::<ConnectionString>().is_err());
    }

    #[test]
    fn test_derive_symmetric_key() {
        let a = derive_symmetric_key(KEY, "device-1").unwrap();
        let b = derive_symmetric_key(KEY, "device-1").unwrap();
        let c = derive_symmetric_key(KEY, "device-2").unwrap();
        assert_eq!(a, b);
        assert_ne!(a, c);
        // 32-byte digest in base64
        assert_eq!(BASE64.decode(&a).unwrap().len(), 32);
        assert!(derive_symmetric_key("not base64!", "d").is_err());
    }

    #[test]
    fn test_sas_token_format() {
        let token = SasToken::create("hub.azure-devices.net/devices/d1", KEY, 1_700_000_000, None).unwrap();
        let text = token.to_string();
        assert!(text.starts_with("SharedAccessSignature sr=hub.azure-devices.net%2Fdevices%2Fd1&sig="));
        assert!(text.ends_with("&se=1700000000"));
    }

    #[test]
    fn test_credentials_modes() {
        let cs = format!("HostName=h.net;DeviceId=d;SharedAccessKey={};ModuleId=m", KEY);
        let sas = HubCredentials::from_connection_string(&cs, true, 1_700_000_000).unwrap();
        assert!(matches!(sas, HubCredentials::SharedAccessSignature { .. }));
        assert_eq!(sas.host_name(), "h.net");
        assert_eq!(sas.module_id(), Some("m"));

        let raw = HubCredentials::from_connection_string(&cs, false, 0).unwrap();
        assert!(matches!(raw, HubCredentials::ConnectionString(_)));
        assert!(raw.password(1_700_000_000).unwrap().contains("sr=h.net%2Fdevices%2Fd%2Fmodules%2Fm"));
    }
}
