//! Collector transport boundary
//!
//! The upload pipeline talks to the collector only through [`Transport`]:
//! one POST of an already-encoded [`Payload`] to an endpoint URL, answered by
//! a [`ServerAck`]. Encoding lives in [`wire`]; the production implementation
//! is [`http::HttpTransport`].

pub mod http;
pub mod wire;

pub use http::HttpTransport;

use async_trait::async_trait;
use serde::Deserialize;

use crate::error::Result;

/// Encoded request body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Payload {
    /// `application/x-www-form-urlencoded` body (legacy `/i`)
    Form(String),
    /// JSON body (bulk `/i/bulk`)
    Json(String),
}

impl Payload {
    pub fn content_type(&self) -> &'static str {
        match self {
            Payload::Form(_) => "application/x-www-form-urlencoded",
            Payload::Json(_) => "application/json",
        }
    }

    pub fn body(&self) -> &str {
        match self {
            Payload::Form(body) | Payload::Json(body) => body,
        }
    }
}

/// Collector response body: `{"result": "Success"}` on acceptance
#[derive(Debug, Deserialize)]
struct ResultResponse {
    result: Option<String>,
}

/// What the collector answered.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerAck {
    /// HTTP status code
    pub status: u16,
    /// `result` field of the response body, if it parsed
    pub result: Option<String>,
}

impl ServerAck {
    /// Interpret a raw HTTP response.
    pub fn from_response(status: u16, body: &str) -> Self {
        let result = serde_json::from_str::<ResultResponse>(body)
            .ok()
            .and_then(|r| r.result);
        Self { status, result }
    }

    /// A positive acknowledgement: 2xx and `"result": "Success"`.
    ///
    /// Anything else means "try again later".
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status) && self.result.as_deref() == Some("Success")
    }
}

/// Sends encoded requests to the collector.
///
/// Errors are always temporary from the caller's point of view; the pipeline
/// keeps the records and retries on the next trigger.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(&self, endpoint: &str, payload: &Payload) -> Result<ServerAck>;
}
