//! Shared helpers for beacon-core integration tests
//!
//! `MockTransport` stands in for the collector: it records every request and
//! answers with whatever verdict the test has set.

#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use beacon_core::config::Protocol;
use beacon_core::{Client, Config, Error, Payload, PersistentQueue, Result, ServerAck, Transport};

pub const SERVER_URL: &str = "https://collector.test";
pub const APP_KEY: &str = "test-app-key";

/// One request as the collector saw it
#[derive(Debug, Clone)]
pub struct SentRequest {
    pub endpoint: String,
    pub payload: Payload,
}

impl SentRequest {
    /// The request objects of a bulk body
    pub fn bulk_requests(&self) -> Vec<serde_json::Value> {
        let body: serde_json::Value =
            serde_json::from_str(self.payload.body()).expect("bulk body is JSON");
        body["requests"].as_array().cloned().unwrap_or_default()
    }

    /// Every event carried by this request, decoded
    pub fn events(&self) -> Vec<serde_json::Value> {
        self.bulk_requests()
            .iter()
            .filter_map(|r| r["events"].as_str())
            .flat_map(|events| {
                serde_json::from_str::<Vec<serde_json::Value>>(events).expect("events are JSON")
            })
            .collect()
    }
}

/// Recording transport with a switchable verdict
#[derive(Default)]
pub struct MockTransport {
    failing: AtomicBool,
    sent: Mutex<Vec<SentRequest>>,
}

impl MockTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Make subsequent requests fail (`true`) or succeed (`false`)
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn sent(&self) -> Vec<SentRequest> {
        self.sent.lock().unwrap().clone()
    }

    pub fn clear(&self) {
        self.sent.lock().unwrap().clear();
    }

    /// Events across all recorded requests, in send order
    pub fn sent_events(&self) -> Vec<serde_json::Value> {
        self.sent().iter().flat_map(SentRequest::events).collect()
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn send(&self, endpoint: &str, payload: &Payload) -> Result<ServerAck> {
        self.sent.lock().unwrap().push(SentRequest {
            endpoint: endpoint.to_string(),
            payload: payload.clone(),
        });
        if self.failing.load(Ordering::SeqCst) {
            Err(Error::Transport("simulated network failure".to_string()))
        } else {
            Ok(ServerAck::from_response(200, r#"{"result":"Success"}"#))
        }
    }
}

/// Config using the bulk protocol and a fixed device id
pub fn test_config() -> Config {
    let mut config = Config::default();
    config.upload.protocol = Protocol::Bulk;
    config.device.device_id = Some("device-under-test".to_string());
    config.device.os = Some("TestOS".to_string());
    config
}

/// Client over an in-memory queue and a fresh mock transport
pub fn mock_client() -> (Client, Arc<MockTransport>) {
    let transport = MockTransport::new();
    let client = Client::with_parts(test_config(), PersistentQueue::in_memory(), transport.clone());
    (client, transport)
}
