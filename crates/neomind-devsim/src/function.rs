//! Function endpoints backing `function` mock sensors.

use async_trait::async_trait;
use serde_json::Value;

use crate::error::Result;
#[cfg(feature = "http")]
use crate::error::DevSimError;

/// Remote function that computes a sensor's next value.
#[async_trait]
pub trait FunctionEndpoint: Send + Sync {
    /// POST `{value}` to `url` and return the numeric `value` of the reply.
    async fn call(&self, url: &str, value: f64) -> Result<f64>;
}

/// Numeric `value` field of a function reply.
pub fn reply_value(reply: &Value) -> Option<f64> {
    crate::model::number_of(reply.get("value")?)
}

/// reqwest-backed function endpoint.
#[cfg(feature = "http")]
#[derive(Debug, Clone)]
pub struct HttpFunctionEndpoint {
    client: reqwest::Client,
    timeout: std::time::Duration,
}

#[cfg(feature = "http")]
impl HttpFunctionEndpoint {
    pub fn new() -> Self {
        let client = reqwest::Client::builder()
            .pool_max_idle_per_host(0)
            .build()
            .unwrap_or_default();
        Self {
            client,
            timeout: std::time::Duration::from_secs(10),
        }
    }

    pub fn with_timeout(mut self, timeout: std::time::Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

#[cfg(feature = "http")]
impl Default for HttpFunctionEndpoint {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(feature = "http")]
#[async_trait]
impl FunctionEndpoint for HttpFunctionEndpoint {
    async fn call(&self, url: &str, value: f64) -> Result<f64> {
        let response = self
            .client
            .post(url)
            .timeout(self.timeout)
            .json(&serde_json::json!({ "value": value }))
            .send()
            .await
            .map_err(|e| DevSimError::Function(format!("HTTP request failed: {}", e)))?;

        if !response.status().is_success() {
            return Err(DevSimError::Function(format!(
                "HTTP error: {}",
                response.status()
            )));
        }

        let reply: Value = response
            .json()
            .await
            .map_err(|e| DevSimError::Function(format!("JSON parse error: {}", e)))?;

        reply_value(&reply)
            .ok_or_else(|| DevSimError::Function(format!("Reply has no numeric value: {}", reply)))
    }
}
