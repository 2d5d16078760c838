//! Request encoding for the collector API
//!
//! Every request is a flat list of string parameters. Structured values
//! (`events`, `crash`, `metrics`, `user_details`) are JSON-encoded into a
//! single parameter.
//!
//! ```text
//! legacy:  POST {url}/i        app_key=...&device_id=...&events=[...]&timestamp=...
//! bulk:    POST {url}/i/bulk   {"app_key": "...", "requests": [{...}, {...}]}
//! ```
//!
//! With a salt configured, the body is signed as
//! `checksum256 = hex(sha256(body + salt))`: appended to the form body for
//! legacy requests, passed as a query parameter for bulk ones.

use chrono::{Datelike, Local, TimeZone, Timelike};
use serde_json::{json, Map, Value};
use sha2::{Digest, Sha256};

use super::Payload;
use crate::error::Result;
use crate::types::{DeviceMetrics, Event, ExceptionReport, SessionMarker, UserDetails};

/// SDK name reported with `begin_session`
pub const SDK_NAME: &str = "beacon-rust";

/// SDK version reported with `begin_session`
pub const SDK_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Identity carried by every request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestContext {
    pub app_key: String,
    pub device_id: String,
}

/// One collector request, parameters in insertion order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WireRequest {
    params: Vec<(&'static str, String)>,
}

impl WireRequest {
    /// Request with identity and time parameters only.
    pub fn new(ctx: &RequestContext, timestamp: i64) -> Self {
        let (hour, dow) = hour_and_dow(timestamp);
        Self {
            params: vec![
                ("app_key", ctx.app_key.clone()),
                ("device_id", ctx.device_id.clone()),
                ("timestamp", timestamp.to_string()),
                ("hour", hour.to_string()),
                ("dow", dow.to_string()),
            ],
        }
    }

    /// `begin_session`, `session_duration` or `end_session` request.
    pub fn session(ctx: &RequestContext, timestamp: i64, marker: &SessionMarker) -> Result<Self> {
        let mut request = Self::new(ctx, timestamp);
        match marker {
            SessionMarker::Begin {
                app_version,
                sdk_version,
                metrics,
                ..
            } => {
                request.push("begin_session", "1");
                request.push("sdk_name", SDK_NAME);
                request.push("sdk_version", sdk_version.as_str());
                let mut metrics = metrics.clone();
                if app_version.is_some() {
                    metrics.app_version = app_version.clone();
                }
                request.push("metrics", serde_json::to_string(&metrics_json(&metrics))?);
            }
            SessionMarker::Heartbeat { duration_secs } => {
                request.push("session_duration", duration_secs.to_string());
            }
            SessionMarker::End { duration_secs } => {
                request.push("end_session", "1");
                request.push("session_duration", duration_secs.to_string());
            }
        }
        Ok(request)
    }

    /// `events` request; each event carries the timestamp it was recorded at.
    pub fn events<'a>(
        ctx: &RequestContext,
        timestamp: i64,
        events: impl IntoIterator<Item = (i64, &'a Event)>,
    ) -> Result<Self> {
        let events = events
            .into_iter()
            .map(|(ts, event)| event_json(ts, event))
            .collect::<Result<Vec<_>>>()?;

        let mut request = Self::new(ctx, timestamp);
        request.push("events", serde_json::to_string(&events)?);
        Ok(request)
    }

    /// `crash` request.
    pub fn crash(ctx: &RequestContext, timestamp: i64, report: &ExceptionReport) -> Result<Self> {
        let mut request = Self::new(ctx, timestamp);
        request.push("crash", serde_json::to_string(&crash_json(report)?)?);
        Ok(request)
    }

    /// Request carrying nothing but a `user_details` update.
    pub fn user_details(ctx: &RequestContext, timestamp: i64, details: &UserDetails) -> Result<Self> {
        let mut request = Self::new(ctx, timestamp);
        request.attach_user_details(details)?;
        Ok(request)
    }

    /// Piggyback a `user_details` update on this request.
    pub fn attach_user_details(&mut self, details: &UserDetails) -> Result<()> {
        let json = serde_json::to_string(&user_details_json(details)?)?;
        self.push("user_details", json);
        Ok(())
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.params
            .iter()
            .find(|(k, _)| *k == key)
            .map(|(_, v)| v.as_str())
    }

    pub fn params(&self) -> impl Iterator<Item = (&str, &str)> {
        self.params.iter().map(|(k, v)| (*k, v.as_str()))
    }

    /// `application/x-www-form-urlencoded` encoding
    pub fn to_form(&self) -> String {
        self.params
            .iter()
            .map(|(k, v)| format!("{}={}", k, urlencoding::encode(v)))
            .collect::<Vec<_>>()
            .join("&")
    }

    fn to_json(&self) -> Value {
        let map: Map<String, Value> = self
            .params
            .iter()
            .map(|(k, v)| (k.to_string(), Value::String(v.clone())))
            .collect();
        Value::Object(map)
    }

    fn push(&mut self, key: &'static str, value: impl Into<String>) {
        self.params.push((key, value.into()));
    }
}

/// Encode one request for `{server_url}/i`. Returns the endpoint and body.
pub fn encode_legacy(
    server_url: &str,
    request: &WireRequest,
    salt: Option<&str>,
) -> (String, Payload) {
    let mut body = request.to_form();
    if let Some(salt) = salt {
        let checksum = checksum256(&body, salt);
        body.push_str("&checksum256=");
        body.push_str(&checksum);
    }
    (format!("{}/i", server_url), Payload::Form(body))
}

/// Encode a batch for `{server_url}/i/bulk`. Returns the endpoint and body.
pub fn encode_bulk(
    server_url: &str,
    app_key: &str,
    requests: &[WireRequest],
    salt: Option<&str>,
) -> Result<(String, Payload)> {
    let body = serde_json::to_string(&json!({
        "app_key": app_key,
        "requests": requests.iter().map(WireRequest::to_json).collect::<Vec<_>>(),
    }))?;

    let endpoint = match salt {
        Some(salt) => format!(
            "{}/i/bulk?checksum256={}",
            server_url,
            checksum256(&body, salt)
        ),
        None => format!("{}/i/bulk", server_url),
    };
    Ok((endpoint, Payload::Json(body)))
}

/// Hex SHA-256 of `body` followed by `salt`
pub fn checksum256(body: &str, salt: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(body.as_bytes());
    hasher.update(salt.as_bytes());
    hex::encode(hasher.finalize())
}

/// Local hour (0-23) and day of week (0 = Sunday) of a Unix-millisecond time
fn hour_and_dow(timestamp: i64) -> (u32, u32) {
    Local
        .timestamp_millis_opt(timestamp)
        .earliest()
        .map(|t| (t.hour(), t.weekday().num_days_from_sunday()))
        .unwrap_or((0, 0))
}

fn event_json(timestamp: i64, event: &Event) -> Result<Value> {
    let (hour, dow) = hour_and_dow(timestamp);
    let mut obj = Map::new();
    obj.insert("key".into(), json!(event.key()));
    obj.insert("count".into(), json!(event.count()));
    if let Some(sum) = event.sum() {
        obj.insert("sum".into(), json!(sum));
    }
    if let Some(duration) = event.duration() {
        obj.insert("dur".into(), json!(duration));
    }
    if let Some(segmentation) = event.segmentation() {
        obj.insert("segmentation".into(), serde_json::to_value(segmentation)?);
    }
    obj.insert("timestamp".into(), json!(timestamp));
    obj.insert("hour".into(), json!(hour));
    obj.insert("dow".into(), json!(dow));
    Ok(Value::Object(obj))
}

fn insert_opt(obj: &mut Map<String, Value>, key: &str, value: &Option<String>) {
    if let Some(value) = value {
        obj.insert(key.to_string(), Value::String(value.clone()));
    }
}

fn metrics_json(metrics: &DeviceMetrics) -> Value {
    let mut obj = Map::new();
    insert_opt(&mut obj, "_os", &metrics.os);
    insert_opt(&mut obj, "_os_version", &metrics.os_version);
    insert_opt(&mut obj, "_device", &metrics.device);
    insert_opt(&mut obj, "_resolution", &metrics.resolution);
    insert_opt(&mut obj, "_carrier", &metrics.carrier);
    insert_opt(&mut obj, "_app_version", &metrics.app_version);
    insert_opt(&mut obj, "_locale", &metrics.locale);
    Value::Object(obj)
}

fn crash_json(report: &ExceptionReport) -> Result<Value> {
    let metrics = &report.metrics;
    let mut obj = Map::new();
    insert_opt(&mut obj, "_os", &metrics.os);
    insert_opt(&mut obj, "_os_version", &metrics.os_version);
    insert_opt(&mut obj, "_manufacture", &metrics.manufacturer);
    insert_opt(&mut obj, "_device", &metrics.device);
    insert_opt(&mut obj, "_resolution", &metrics.resolution);
    insert_opt(&mut obj, "_app_version", &metrics.app_version);
    insert_opt(&mut obj, "_locale", &metrics.locale);
    insert_opt(&mut obj, "_orientation", &metrics.orientation);

    obj.insert("_name".into(), json!(report.title));
    obj.insert(
        "_error".into(),
        json!(report.stack_trace.as_deref().unwrap_or(&report.title)),
    );
    obj.insert("_nonfatal".into(), json!(!report.fatal));
    obj.insert("_logs".into(), json!(report.logs));
    obj.insert("_run".into(), json!(report.run_secs));
    if let Some(custom) = &report.custom {
        obj.insert("_custom".into(), serde_json::to_value(custom)?);
    }
    Ok(Value::Object(obj))
}

fn user_details_json(details: &UserDetails) -> Result<Value> {
    let mut obj = Map::new();
    let fields = [
        ("name", details.name()),
        ("username", details.username()),
        ("email", details.email()),
        ("organization", details.organization()),
        ("phone", details.phone()),
        ("picture", details.picture()),
        ("gender", details.gender()),
    ];
    for (key, value) in fields {
        if let Some(value) = value {
            obj.insert(key.to_string(), json!(value));
        }
    }
    if let Some(year) = details.birth_year() {
        obj.insert("byear".into(), json!(year));
    }
    if !details.custom().is_empty() {
        obj.insert("custom".into(), serde_json::to_value(details.custom())?);
    }
    Ok(Value::Object(obj))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::segmentation::Segmentation;

    fn ctx() -> RequestContext {
        RequestContext {
            app_key: "key-1".to_string(),
            device_id: "dev-1".to_string(),
        }
    }

    fn json_param(request: &WireRequest, key: &str) -> Value {
        serde_json::from_str(request.get(key).unwrap()).unwrap()
    }

    #[test]
    fn test_base_params() {
        let request = WireRequest::new(&ctx(), 1_700_000_000_123);
        assert_eq!(request.get("app_key"), Some("key-1"));
        assert_eq!(request.get("device_id"), Some("dev-1"));
        assert_eq!(request.get("timestamp"), Some("1700000000123"));
        let hour: u32 = request.get("hour").unwrap().parse().unwrap();
        let dow: u32 = request.get("dow").unwrap().parse().unwrap();
        assert!(hour < 24);
        assert!(dow < 7);
    }

    #[test]
    fn test_begin_session_metrics() {
        let marker = SessionMarker::Begin {
            app_version: Some("2.1".to_string()),
            device_id: "dev-1".to_string(),
            sdk_version: SDK_VERSION.to_string(),
            metrics: DeviceMetrics {
                os: Some("Linux".to_string()),
                carrier: Some("Example".to_string()),
                ..Default::default()
            },
        };
        let request = WireRequest::session(&ctx(), 1, &marker).unwrap();
        assert_eq!(request.get("begin_session"), Some("1"));
        assert_eq!(request.get("sdk_version"), Some(SDK_VERSION));
        assert!(request.get("session_duration").is_none());

        let metrics = json_param(&request, "metrics");
        assert_eq!(metrics["_os"], "Linux");
        assert_eq!(metrics["_carrier"], "Example");
        assert_eq!(metrics["_app_version"], "2.1");
        assert!(metrics.get("_resolution").is_none());
    }

    #[test]
    fn test_heartbeat_and_end() {
        let heartbeat =
            WireRequest::session(&ctx(), 1, &SessionMarker::Heartbeat { duration_secs: 60 }).unwrap();
        assert_eq!(heartbeat.get("session_duration"), Some("60"));
        assert!(heartbeat.get("end_session").is_none());

        let end = WireRequest::session(&ctx(), 2, &SessionMarker::End { duration_secs: 7 }).unwrap();
        assert_eq!(end.get("end_session"), Some("1"));
        assert_eq!(end.get("session_duration"), Some("7"));
    }

    #[test]
    fn test_events_omit_absent_fields() {
        let plain = Event::named("tap").unwrap();
        let mut seg = Segmentation::new();
        seg.set("screen", "home");
        let full = Event::new("buy", 2, Some(9.5), Some(1.25), Some(seg)).unwrap();

        let request = WireRequest::events(&ctx(), 3, [(1, &plain), (2, &full)]).unwrap();
        let events = json_param(&request, "events");

        assert_eq!(events[0]["key"], "tap");
        assert_eq!(events[0]["count"], 1);
        assert!(events[0].get("sum").is_none());
        assert!(events[0].get("dur").is_none());
        assert!(events[0].get("segmentation").is_none());
        assert_eq!(events[0]["timestamp"], 1);

        assert_eq!(events[1]["sum"], 9.5);
        assert_eq!(events[1]["dur"], 1.25);
        assert_eq!(events[1]["segmentation"]["screen"], "home");
    }

    #[test]
    fn test_crash_fields() {
        let report = ExceptionReport {
            title: "NullReference".to_string(),
            stack_trace: Some("at main()".to_string()),
            fatal: false,
            logs: "opened\nclicked".to_string(),
            run_secs: 12,
            metrics: DeviceMetrics {
                manufacturer: Some("Acme".to_string()),
                ..Default::default()
            },
            custom: Some([("build", "42")].into_iter().collect()),
        };
        let request = WireRequest::crash(&ctx(), 1, &report).unwrap();
        let crash = json_param(&request, "crash");

        assert_eq!(crash["_name"], "NullReference");
        assert_eq!(crash["_error"], "at main()");
        assert_eq!(crash["_nonfatal"], true);
        assert_eq!(crash["_logs"], "opened\nclicked");
        assert_eq!(crash["_run"], 12);
        assert_eq!(crash["_manufacture"], "Acme");
        assert_eq!(crash["_custom"]["build"], "42");
    }

    #[test]
    fn test_user_details_fields() {
        let mut details = UserDetails::new();
        details.set_name(Some("Ada"));
        details.set_birth_year(Some(1815));
        details.set_custom("plan", Some("pro".to_string()));

        let request = WireRequest::user_details(&ctx(), 1, &details).unwrap();
        let json = json_param(&request, "user_details");
        assert_eq!(json["name"], "Ada");
        assert_eq!(json["byear"], 1815);
        assert_eq!(json["custom"]["plan"], "pro");
        assert!(json.get("email").is_none());
    }

    #[test]
    fn test_form_encoding_escapes_values() {
        let mut details = UserDetails::new();
        details.set_name(Some("A & B"));
        let request = WireRequest::user_details(&ctx(), 1, &details).unwrap();
        let form = request.to_form();
        assert!(form.starts_with("app_key=key-1&device_id=dev-1&timestamp=1"));
        assert!(!form.contains("A & B"));
        assert!(form.contains("user_details=%7B"));
    }

    #[test]
    fn test_legacy_signing() {
        let request = WireRequest::new(&ctx(), 1);
        let (endpoint, payload) = encode_legacy("https://c.example.com", &request, None);
        assert_eq!(endpoint, "https://c.example.com/i");
        assert!(!payload.body().contains("checksum256"));

        let (_, signed) = encode_legacy("https://c.example.com", &request, Some("pepper"));
        let expected = checksum256(&request.to_form(), "pepper");
        assert!(signed.body().ends_with(&format!("&checksum256={}", expected)));
    }

    #[test]
    fn test_bulk_body() {
        let a = WireRequest::new(&ctx(), 1);
        let b = WireRequest::session(&ctx(), 2, &SessionMarker::End { duration_secs: 3 }).unwrap();
        let (endpoint, payload) = encode_bulk("https://c.example.com", "key-1", &[a, b], None).unwrap();
        assert_eq!(endpoint, "https://c.example.com/i/bulk");

        let body: Value = serde_json::from_str(payload.body()).unwrap();
        assert_eq!(body["app_key"], "key-1");
        assert_eq!(body["requests"].as_array().unwrap().len(), 2);
        assert_eq!(body["requests"][1]["end_session"], "1");

        let (signed, _) =
            encode_bulk("https://c.example.com", "key-1", &[], Some("pepper")).unwrap();
        assert!(signed.starts_with("https://c.example.com/i/bulk?checksum256="));
    }

    #[test]
    fn test_checksum_known_value() {
        assert_eq!(
            checksum256("", ""),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
        assert_eq!(checksum256("ab", "c"), checksum256("a", "bc"));
    }
}
