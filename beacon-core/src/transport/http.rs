//! HTTP transport for the collector API
//!
//! Thin wrapper over a shared `reqwest::Client`. Retrying is not done here:
//! a failed request leaves the records queued and the upload pipeline tries
//! again on its next trigger.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, CONTENT_TYPE, USER_AGENT};

use super::{Payload, ServerAck, Transport};
use crate::config::UploadConfig;
use crate::error::{Error, Result};

/// Production [`Transport`] over HTTPS
pub struct HttpTransport {
    http_client: reqwest::Client,
}

impl HttpTransport {
    /// Create a transport with the given request timeout
    pub fn new(timeout: Duration) -> Result<Self> {
        let mut headers = HeaderMap::new();
        headers.insert(
            USER_AGENT,
            HeaderValue::from_static(concat!("beacon/", env!("CARGO_PKG_VERSION"))),
        );

        let http_client = reqwest::Client::builder()
            .timeout(timeout)
            .default_headers(headers)
            .build()
            .map_err(|e| Error::Config(format!("failed to create HTTP client: {}", e)))?;

        Ok(Self { http_client })
    }

    /// Create a transport from the `[upload]` configuration
    pub fn from_config(config: &UploadConfig) -> Result<Self> {
        Self::new(Duration::from_secs(config.timeout_secs))
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn send(&self, endpoint: &str, payload: &Payload) -> Result<ServerAck> {
        tracing::debug!(endpoint, bytes = payload.body().len(), "POST");

        let response = self
            .http_client
            .post(endpoint)
            .header(CONTENT_TYPE, payload.content_type())
            .body(payload.body().to_string())
            .send()
            .await
            .map_err(|e| Error::Transport(format!("HTTP request failed: {}", e)))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| Error::Transport(format!("failed to read response: {}", e)))?;

        let ack = ServerAck::from_response(status.as_u16(), &body);
        if !ack.is_success() {
            tracing::debug!(status = status.as_u16(), body = %body, "Collector did not acknowledge");
        }
        Ok(ack)
    }
}
