//! Default HTTP transport backed by reqwest.

use crate::config::SettingsConfig;
use crate::error::TransportError;
use crate::request::{HttpRequest, RawResponse, Transport};
use async_trait::async_trait;
use reqwest::Client;
use std::time::Duration;
use tracing::debug;

/// [`Transport`] over a shared [`reqwest::Client`].
#[derive(Debug, Clone, Default)]
pub struct ReqwestTransport {
    client: Client,
    timeout: Option<Duration>,
}

impl ReqwestTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Use an existing client, e.g. one with custom TLS or proxy settings.
    pub fn with_client(client: Client) -> Self {
        Self {
            client,
            timeout: None,
        }
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Transport with the configured timeout. `timeout_secs: 0` disables it.
    pub fn from_settings(settings: &SettingsConfig) -> Self {
        let transport = Self::new();
        if settings.timeout_secs == 0 {
            transport
        } else {
            transport.timeout(Duration::from_secs(settings.timeout_secs))
        }
    }
}

#[async_trait]
impl Transport for ReqwestTransport {
    async fn send(&self, request: &HttpRequest) -> Result<RawResponse, TransportError> {
        let mut builder = self
            .client
            .request(request.method.clone(), &request.url)
            .headers(request.headers.clone())
            .body(request.body.clone());
        if let Some(timeout) = self.timeout {
            builder = builder.timeout(timeout);
        }

        let response = builder.send().await?;
        let status = response.status().as_u16();
        let headers = response.headers().clone();
        let body = response.bytes().await?.to_vec();

        debug!(status, bytes = body.len(), url = %request.url, "HTTP response received");

        Ok(RawResponse {
            status,
            headers,
            body,
        })
    }
}
