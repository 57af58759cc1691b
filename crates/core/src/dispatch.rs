//! Request/response dispatch of node payloads to service endpoints.

use crate::error::DispatchError;
use crate::types::{Payload, ServiceDescriptor};
use async_trait::async_trait;
use reqwest::Client;
use std::time::Duration;
use tracing::{debug, warn};

/// Sends a node's input to its service and returns the service's output.
#[async_trait]
pub trait Dispatcher: Send + Sync {
    async fn dispatch(
        &self,
        service: &ServiceDescriptor,
        input: &Payload,
    ) -> Result<Payload, DispatchError>;
}

/// Dispatches payloads as JSON `POST` requests.
#[derive(Debug, Clone)]
pub struct HttpDispatcher {
    client: Client,
}

impl HttpDispatcher {
    pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

    pub fn new() -> Result<Self, DispatchError> {
        Self::with_timeout(Self::DEFAULT_TIMEOUT)
    }

    /// Create a dispatcher whose requests fail after `timeout`.
    pub fn with_timeout(timeout: Duration) -> Result<Self, DispatchError> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self { client })
    }

    /// Wrap an existing client.
    pub fn from_client(client: Client) -> Self {
        Self { client }
    }
}

impl Default for HttpDispatcher {
    fn default() -> Self {
        match Self::new() {
            Ok(dispatcher) => dispatcher,
            Err(e) => {
                warn!("Failed to build HTTP client, requests will not time out: {}", e);
                Self::from_client(Client::new())
            }
        }
    }
}

#[async_trait]
impl Dispatcher for HttpDispatcher {
    async fn dispatch(
        &self,
        service: &ServiceDescriptor,
        input: &Payload,
    ) -> Result<Payload, DispatchError> {
        let url = service.endpoint.url()?;
        debug!(node = %service.id, url = %url, "POST request");

        let response = self.client.post(url).json(input).send().await?;
        let status = response.status();

        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(DispatchError::Status {
                status: status.as_u16(),
                body,
            });
        }

        let bytes = response.bytes().await?;
        match serde_json::from_slice::<serde_json::Value>(&bytes) {
            Ok(serde_json::Value::Object(output)) => Ok(output),
            Ok(other) => Err(DispatchError::MalformedBody(format!(
                "expected a JSON object, got {}",
                json_kind(&other)
            ))),
            Err(e) => Err(DispatchError::MalformedBody(e.to_string())),
        }
    }
}

fn json_kind(value: &serde_json::Value) -> &'static str {
    match value {
        serde_json::Value::Null => "null",
        serde_json::Value::Bool(_) => "a boolean",
        serde_json::Value::Number(_) => "a number",
        serde_json::Value::String(_) => "a string",
        serde_json::Value::Array(_) => "an array",
        serde_json::Value::Object(_) => "an object",
    }
}
