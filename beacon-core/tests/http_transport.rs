//! HTTP transport tests against a local mock collector

mod common;

use std::sync::Arc;
use std::time::Duration;

use beacon_core::config::Protocol;
use beacon_core::transport::HttpTransport;
use beacon_core::{Client, Payload, PersistentQueue, Transport, UploadOutcome};
use common::{test_config, APP_KEY};
use wiremock::matchers::{body_string_contains, header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn success() -> ResponseTemplate {
    ResponseTemplate::new(200).set_body_string(r#"{"result":"Success"}"#)
}

fn transport() -> HttpTransport {
    HttpTransport::new(Duration::from_secs(5)).unwrap()
}

// ============================================
// Acknowledgement handling
// ============================================

#[tokio::test]
async fn test_success_body_is_acknowledged() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/i"))
        .and(header("content-type", "application/x-www-form-urlencoded"))
        .respond_with(success())
        .expect(1)
        .mount(&server)
        .await;

    let ack = transport()
        .send(
            &format!("{}/i", server.uri()),
            &Payload::Form("app_key=k&device_id=d".to_string()),
        )
        .await
        .unwrap();

    assert!(ack.is_success());
    assert_eq!(ack.status, 200);
}

#[tokio::test]
async fn test_server_error_is_not_success() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(500).set_body_string(r#"{"result":"Success"}"#))
        .mount(&server)
        .await;

    let ack = transport()
        .send(&format!("{}/i", server.uri()), &Payload::Form(String::new()))
        .await
        .unwrap();

    assert!(!ack.is_success());
    assert_eq!(ack.status, 500);
}

#[tokio::test]
async fn test_unexpected_body_is_not_success() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200).set_body_string("<html>maintenance</html>"))
        .mount(&server)
        .await;

    let ack = transport()
        .send(&format!("{}/i", server.uri()), &Payload::Form(String::new()))
        .await
        .unwrap();
    assert!(!ack.is_success());
    assert!(ack.result.is_none());
}

#[tokio::test]
async fn test_other_result_is_not_success() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200).set_body_string(r#"{"result":"Missing parameter"}"#))
        .mount(&server)
        .await;

    let ack = transport()
        .send(&format!("{}/i", server.uri()), &Payload::Form(String::new()))
        .await
        .unwrap();
    assert!(!ack.is_success());
    assert_eq!(ack.result.as_deref(), Some("Missing parameter"));
}

// ============================================
// Full client over HTTP
// ============================================

#[tokio::test]
async fn test_client_delivers_bulk_over_http() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/i/bulk"))
        .and(header("content-type", "application/json"))
        .and(body_string_contains("begin_session"))
        .respond_with(success())
        .expect(1)
        .mount(&server)
        .await;

    let client = Client::with_parts(
        test_config(),
        PersistentQueue::in_memory(),
        Arc::new(transport()),
    );
    let outcome = client.start_session(&server.uri(), APP_KEY).await.unwrap();

    assert_eq!(outcome, UploadOutcome::Delivered(1));
    assert_eq!(client.pending().total(), 0);
}

#[tokio::test]
async fn test_client_signs_legacy_requests() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/i"))
        .and(body_string_contains("checksum256="))
        .respond_with(success())
        .expect(1)
        .mount(&server)
        .await;

    let mut config = test_config();
    config.upload.protocol = Protocol::Legacy;
    config.server.salt = Some("pepper".to_string());
    let client = Client::with_parts(config, PersistentQueue::in_memory(), Arc::new(transport()));

    let outcome = client.start_session(&server.uri(), APP_KEY).await.unwrap();
    assert_eq!(outcome, UploadOutcome::Delivered(1));
}

#[tokio::test]
async fn test_client_signs_bulk_endpoint() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/i/bulk"))
        .respond_with(success())
        .mount(&server)
        .await;

    let mut config = test_config();
    config.server.salt = Some("pepper".to_string());
    let client = Client::with_parts(config, PersistentQueue::in_memory(), Arc::new(transport()));

    let outcome = client.start_session(&server.uri(), APP_KEY).await.unwrap();
    assert_eq!(outcome, UploadOutcome::Delivered(1));

    let received = server.received_requests().await.unwrap();
    let url = received[0].url.clone();
    let checksum = url
        .query_pairs()
        .find(|(k, _)| k == "checksum256")
        .map(|(_, v)| v.into_owned())
        .unwrap();
    let body = String::from_utf8(received[0].body.clone()).unwrap();
    assert_eq!(checksum, beacon_core::transport::wire::checksum256(&body, "pepper"));
}

#[tokio::test]
async fn test_rejected_upload_keeps_records() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(503))
        .mount(&server)
        .await;

    let client = Client::with_parts(
        test_config(),
        PersistentQueue::in_memory(),
        Arc::new(transport()),
    );
    let outcome = client.start_session(&server.uri(), APP_KEY).await.unwrap();

    assert!(outcome.is_failure());
    assert_eq!(client.pending().sessions, 1);
}
