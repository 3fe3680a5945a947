//! Module identity registry.

use async_trait::async_trait;
use tracing::debug;

use crate::error::Result;

/// Hub and key used to reach the registry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegistryAccess {
    pub host_name: String,
    /// Base64 key used to sign requests.
    pub key: String,
}

/// Registry operations needed by edge-hosted modules.
#[async_trait]
pub trait RegistryClient: Send + Sync {
    /// Succeeds when the module identity exists.
    async fn get_module(&self, access: &RegistryAccess, device_id: &str, module_id: &str) -> Result<()>;

    async fn add_module(&self, access: &RegistryAccess, device_id: &str, module_id: &str) -> Result<()>;
}

/// Make sure a module identity exists, creating it when the lookup fails.
pub async fn ensure_module(
    registry: &dyn RegistryClient,
    access: &RegistryAccess,
    device_id: &str,
    module_id: &str,
) -> Result<()> {
    match registry.get_module(access, device_id, module_id).await {
        Ok(()) => Ok(()),
        Err(e) => {
            debug!(device_id = %device_id, module_id = %module_id, error = %e, "Module lookup failed, adding");
            registry.add_module(access, device_id, module_id).await
        }
    }
}

#[cfg(feature = "http")]
pub use http::HttpRegistryClient;

#[cfg(feature = "http")]
mod http {
    use std::time::Duration;

    use async_trait::async_trait;
    use serde_json::json;

    use super::{RegistryAccess, RegistryClient};
    use crate::credentials::{expiry_from_hours, SasToken};
    use crate::error::{DevSimError, Result};

    const API_VERSION: &str = "2021-04-12";

    /// Registry REST client.
    #[derive(Debug, Clone)]
    pub struct HttpRegistryClient {
        client: reqwest::Client,
    }

    impl HttpRegistryClient {
        pub fn new() -> Self {
            let client = reqwest::Client::builder()
                .timeout(Duration::from_secs(30))
                .build()
                .unwrap_or_default();
            Self { client }
        }

        fn url(access: &RegistryAccess, device_id: &str, module_id: &str) -> String {
            format!(
                "https://{}/devices/{}/modules/{}?api-version={}",
                access.host_name,
                urlencoding::encode(device_id),
                urlencoding::encode(module_id),
                API_VERSION
            )
        }

        fn authorization(access: &RegistryAccess) -> Result<String> {
            let token = SasToken::create(&access.host_name, &access.key, expiry_from_hours(1), None)?;
            Ok(token.to_string())
        }
    }

    impl Default for HttpRegistryClient {
        fn default() -> Self {
            Self::new()
        }
    }

    #[async_trait]
    impl RegistryClient for HttpRegistryClient {
        async fn get_module(&self, access: &RegistryAccess, device_id: &str, module_id: &str) -> Result<()> {
            let response = self
                .client
                .get(Self::url(access, device_id, module_id))
                .header("Authorization", Self::authorization(access)?)
                .send()
                .await
                .map_err(|e| DevSimError::Registry(format!("HTTP request failed: {}", e)))?;

            if !response.status().is_success() {
                return Err(DevSimError::Registry(format!(
                    "Module {}/{} lookup failed: {}",
                    device_id,
                    module_id,
                    response.status()
                )));
            }
            Ok(())
        }

        async fn add_module(&self, access: &RegistryAccess, device_id: &str, module_id: &str) -> Result<()> {
            let response = self
                .client
                .put(Self::url(access, device_id, module_id))
                .header("Authorization", Self::authorization(access)?)
                .json(&json!({ "deviceId": device_id, "moduleId": module_id }))
                .send()
                .await
                .map_err(|e| DevSimError::Registry(format!("HTTP request failed: {}", e)))?;

            if !response.status().is_success() {
                return Err(DevSimError::Registry(format!(
                    "Module {}/{} create failed: {}",
                    device_id,
                    module_id,
                    response.status()
                )));
            }
            Ok(())
        }
    }
}
