//! The telemetry client
//!
//! A [`Client`] is an explicit handle owning everything one application
//! instance reports through: the durable queue, the uploader, the session
//! controller, user details and the breadcrumb log. Handles are cheap to
//! clone and share one state.
//!
//! Recording calls validate their arguments and the session state
//! synchronously (`InvalidArgument`, `SessionNotActive`). Once a record is
//! queued the call succeeds: delivery problems show up in the returned
//! [`UploadOutcome`] and the logs, never as an error.
//!
//! ```rust,no_run
//! use beacon_core::{Client, Config, Segmentation};
//!
//! # async fn demo() -> beacon_core::Result<()> {
//! let client = Client::open(Config::load()?)?;
//! client.start_session("https://analytics.example.com", "0123456789abcdef").await?;
//!
//! let mut seg = Segmentation::new();
//! seg.set("plan", "pro");
//! client.record_event("purchase", 1, Some(9.99), None, Some(seg)).await?;
//! client.record_view("checkout", None).await?;
//!
//! client.end_session().await?;
//! # Ok(())
//! # }
//! ```

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, Weak};

use async_trait::async_trait;

use crate::clock::TimestampClock;
use crate::config::{validate_app_key, validate_server_url, Config};
use crate::error::{Error, Result};
use crate::lock;
use crate::segmentation::Segmentation;
use crate::session::{HeartbeatSink, SessionController, SessionStart};
use crate::store::PersistentQueue;
use crate::transport::wire::SDK_VERSION;
use crate::transport::{HttpTransport, Transport};
use crate::types::{
    DeviceMetrics, Event, ExceptionReport, PendingCounts, Record, SessionMarker, UserDetails,
    VIEW_EVENT_KEY,
};
use crate::upload::{UploadOutcome, UploadStats, UploadTarget, Uploader};

/// Settings key holding the generated device id
const DEVICE_ID_SETTING: &str = "device_id";

struct Inner {
    config: Config,
    session: Arc<SessionController>,
    queue: Arc<PersistentQueue>,
    uploader: Uploader,
    details: Arc<Mutex<UserDetails>>,
    breadcrumbs: Mutex<VecDeque<String>>,
    metrics: DeviceMetrics,
    device_id: String,
    clock: TimestampClock,
}

/// Handle to a telemetry client
#[derive(Clone)]
pub struct Client {
    inner: Arc<Inner>,
}

impl Client {
    /// Open a client with the configured storage backend and HTTP transport.
    ///
    /// Records left from an earlier run are recovered and uploaded on the
    /// first trigger.
    pub fn open(config: Config) -> Result<Self> {
        config.validate()?;
        let queue = PersistentQueue::open_config(&config.storage)?;
        let transport = HttpTransport::from_config(&config.upload)?;
        Ok(Self::with_parts(config, queue, Arc::new(transport)))
    }

    /// Assemble a client from an already opened queue and any transport.
    pub fn with_parts(config: Config, queue: PersistentQueue, transport: Arc<dyn Transport>) -> Self {
        let queue = Arc::new(queue);
        let device_id = resolve_device_id(&config, &queue);

        // A queued, unacknowledged profile update is still pending
        let details = queue
            .latest_user_details()
            .map(|delta| UserDetails::restore(&delta))
            .unwrap_or_default();
        let details = Arc::new(Mutex::new(details));

        let uploader = Uploader::new(
            transport,
            queue.clone(),
            details.clone(),
            config.upload.clone(),
            config.server.salt.clone(),
        );

        let pending = queue.pending();
        tracing::info!(
            device_id = %device_id,
            pending = pending.total(),
            "Telemetry client ready"
        );

        Self {
            inner: Arc::new(Inner {
                metrics: config.device.metrics(),
                session: Arc::new(SessionController::new(config.session.clone())),
                queue,
                uploader,
                details,
                breadcrumbs: Mutex::new(VecDeque::new()),
                device_id,
                clock: TimestampClock::new(),
                config,
            }),
        }
    }

    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    pub fn device_id(&self) -> &str {
        &self.inner.device_id
    }

    pub fn is_session_active(&self) -> bool {
        self.inner.session.is_active()
    }

    // ------------------------------------------------------------------
    // Session lifecycle
    // ------------------------------------------------------------------

    /// Start a session reporting to `server_url` under `app_key`.
    ///
    /// Records still queued from earlier sessions are kept and uploaded with
    /// this session's app key. A session that is still active is ended first.
    pub async fn start_session(&self, server_url: &str, app_key: &str) -> Result<UploadOutcome> {
        let inner = &self.inner;
        let sink: Weak<dyn HeartbeatSink> = Arc::downgrade(&self.inner) as Weak<dyn HeartbeatSink>;

        inner
            .session
            .start(server_url, app_key, sink, |start: &SessionStart| {
                if let Some(duration_secs) = start.replaced_secs {
                    inner.append(Record::Session(SessionMarker::End { duration_secs }));
                }
                inner.append(Record::Session(SessionMarker::Begin {
                    app_version: inner.metrics.app_version.clone(),
                    device_id: inner.device_id.clone(),
                    sdk_version: SDK_VERSION.to_string(),
                    metrics: inner.metrics.clone(),
                }));
                // The open view is re-sent as recorded, without a duration
                if let Some(view) = &start.resumed_view {
                    let segmentation = Some(view.segmentation.clone());
                    match Event::new(VIEW_EVENT_KEY, 1, None, None, segmentation) {
                        Ok(event) => {
                            inner.append(Record::Events(vec![event]));
                        }
                        Err(e) => {
                            tracing::warn!(view = %view.name, error = %e, "Could not resume view")
                        }
                    }
                }
            })?;

        Ok(inner.upload().await)
    }

    /// End the active session and try to upload immediately.
    pub async fn end_session(&self) -> Result<UploadOutcome> {
        let inner = &self.inner;
        inner.session.end(|duration_secs| {
            inner.append(Record::Session(SessionMarker::End { duration_secs }));
        })?;
        Ok(inner.upload().await)
    }

    /// Hard reset: stop the session and drop every queued record, the user
    /// details and the breadcrumb log.
    pub fn halt(&self) {
        let inner = &self.inner;
        inner.session.halt();
        inner.queue.clear();
        lock(&inner.details).reset();
        lock(&inner.breadcrumbs).clear();
    }

    // ------------------------------------------------------------------
    // Recording
    // ------------------------------------------------------------------

    /// Record a custom event and upload.
    pub async fn record_event(
        &self,
        key: &str,
        count: i64,
        sum: Option<f64>,
        duration: Option<f64>,
        segmentation: Option<Segmentation>,
    ) -> Result<UploadOutcome> {
        let event = Event::new(key, count, sum, duration, segmentation)?;
        self.record(event).await
    }

    /// Record an already built event and upload.
    pub async fn record(&self, event: Event) -> Result<UploadOutcome> {
        let inner = &self.inner;
        inner
            .session
            .with_active(|_| inner.append(Record::Events(vec![event])))?;
        Ok(inner.upload().await)
    }

    /// Record a screen view and upload.
    ///
    /// The first view of a session carries `start=1`; later ones carry how
    /// long the previous view was open.
    pub async fn record_view(
        &self,
        name: &str,
        segmentation: Option<Segmentation>,
    ) -> Result<UploadOutcome> {
        if name.trim().is_empty() {
            return Err(Error::InvalidArgument(
                "view name must be a non-empty string".to_string(),
            ));
        }

        let inner = &self.inner;
        inner.session.open_view(name, |transition| {
            let event = inner.view_event(name, segmentation, transition.first, transition.duration)?;
            let recorded = event.segmentation().cloned().unwrap_or_default();
            inner.append(Record::Events(vec![event]));
            Ok(recorded)
        })?;
        Ok(inner.upload().await)
    }

    /// Queue an exception report. It is uploaded on the next trigger, not now.
    pub fn record_exception(
        &self,
        title: &str,
        stack_trace: Option<&str>,
        custom: Option<Segmentation>,
        fatal: bool,
    ) -> Result<()> {
        if title.trim().is_empty() {
            return Err(Error::InvalidArgument(
                "exception title must be a non-empty string".to_string(),
            ));
        }

        let inner = &self.inner;
        inner.session.with_active(|elapsed| {
            let report = ExceptionReport {
                title: title.to_string(),
                stack_trace: stack_trace.map(str::to_string),
                fatal,
                logs: inner.breadcrumb_log(),
                run_secs: elapsed.as_secs(),
                metrics: inner.metrics.clone(),
                custom: custom.filter(|c| !c.is_empty()),
            };
            inner.append(Record::Exception(report));
        })?;
        tracing::debug!(title, fatal, "Exception queued");
        Ok(())
    }

    /// Append a line to the breadcrumb log attached to exception reports.
    pub fn add_breadcrumb(&self, text: impl Into<String>) {
        let max = self.inner.config.session.max_breadcrumbs;
        let mut crumbs = lock(&self.inner.breadcrumbs);
        crumbs.push_back(text.into());
        while crumbs.len() > max {
            crumbs.pop_front();
        }
    }

    // ------------------------------------------------------------------
    // User details
    // ------------------------------------------------------------------

    /// Edit the user profile. A change is queued and uploaded with the next
    /// session or events request.
    ///
    /// ```rust,no_run
    /// # fn demo(client: &beacon_core::Client) {
    /// client.update_user_details(|user| {
    ///     user.set_name(Some("Ada Lovelace"));
    ///     user.set_custom("plan", Some("pro".to_string()));
    /// });
    /// # }
    /// ```
    pub fn update_user_details<R>(&self, edit: impl FnOnce(&mut UserDetails) -> R) -> R {
        let inner = &self.inner;
        let mut details = lock(&inner.details);
        let before = details.revision();
        let result = edit(&mut *details);
        if details.revision() != before {
            inner
                .queue
                .replace_user_details(inner.clock.next(), details.delta());
        }
        result
    }

    /// Copy of the current user profile
    pub fn user_details(&self) -> UserDetails {
        lock(&self.inner.details).clone()
    }

    // ------------------------------------------------------------------
    // Upload and inspection
    // ------------------------------------------------------------------

    /// Upload everything queued now.
    ///
    /// Uses the current (or last) session's collector, falling back to the
    /// `[server]` configuration when no session has been started.
    pub async fn upload(&self) -> UploadOutcome {
        self.inner.upload().await
    }

    /// Queued records per kind
    pub fn pending(&self) -> PendingCounts {
        self.inner.queue.pending()
    }

    pub fn stats(&self) -> UploadStats {
        self.inner.uploader.stats()
    }

    /// Record unhandled panics as fatal exception reports.
    ///
    /// The report is appended to the durable queue from the panic hook and
    /// uploaded on the next trigger, typically on the next run. The previous
    /// hook still runs afterwards.
    pub fn install_panic_hook(&self) {
        let weak = Arc::downgrade(&self.inner);
        let previous = std::panic::take_hook();

        std::panic::set_hook(Box::new(move |info| {
            if let Some(inner) = weak.upgrade() {
                let payload = info.payload();
                let message = payload
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| payload.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "panic".to_string());
                let location = info
                    .location()
                    .map(|l| format!("{}:{}:{}", l.file(), l.line(), l.column()))
                    .unwrap_or_default();
                inner.record_panic(message, location);
            }
            previous(info);
        }));
    }
}

impl Inner {
    fn append(&self, record: Record) -> u64 {
        self.queue.append(self.clock.next(), record)
    }

    fn upload_target(&self) -> Option<UploadTarget> {
        let device_id = self.device_id.clone();
        if let Some(target) = self.session.target() {
            return Some(UploadTarget {
                server_url: target.server_url,
                app_key: target.app_key,
                device_id,
            });
        }

        let server = &self.config.server;
        let url = validate_server_url(server.url.as_deref()?).ok()?;
        let app_key = validate_app_key(server.app_key.as_deref()?).ok()?;
        Some(UploadTarget {
            server_url: url.to_string(),
            app_key: app_key.to_string(),
            device_id,
        })
    }

    async fn upload(&self) -> UploadOutcome {
        match self.upload_target() {
            Some(target) => self.uploader.run(&target).await,
            None => {
                tracing::debug!("No collector configured yet; records stay queued");
                UploadOutcome::Unconfigured
            }
        }
    }

    /// Build the reserved view event for `name`.
    fn view_event(
        &self,
        name: &str,
        segmentation: Option<Segmentation>,
        first: bool,
        duration: Option<f64>,
    ) -> Result<Event> {
        let mut seg = segmentation.unwrap_or_default();
        seg.set("name", name);
        seg.set("visit", "1");
        seg.set("segment", self.metrics.os_name());
        if first {
            seg.set("start", "1");
        }
        Event::new(VIEW_EVENT_KEY, 1, None, duration, Some(seg))
    }

    fn breadcrumb_log(&self) -> String {
        lock(&self.breadcrumbs)
            .iter()
            .map(String::as_str)
            .collect::<Vec<_>>()
            .join("\n")
    }

    /// Panic path: never waits on our own locks. The report is dropped when
    /// the queue is locked, and the durable write happens inline.
    fn record_panic(&self, message: String, location: String) {
        let backtrace = std::backtrace::Backtrace::force_capture();
        let stack_trace = if location.is_empty() {
            backtrace.to_string()
        } else {
            format!("at {}\n{}", location, backtrace)
        };
        let logs = self
            .breadcrumbs
            .try_lock()
            .map(|crumbs| crumbs.iter().cloned().collect::<Vec<_>>().join("\n"))
            .unwrap_or_default();
        let run_secs = self
            .session
            .try_elapsed()
            .map(|d| d.as_secs())
            .unwrap_or_default();

        let report = Record::Exception(ExceptionReport {
            title: message,
            stack_trace: Some(stack_trace),
            fatal: true,
            logs,
            run_secs,
            metrics: self.metrics.clone(),
            custom: None,
        });
        // The panic may have been raised inside a queue operation
        if self.queue.try_append(self.clock.next(), report).is_none() {
            tracing::warn!("Upload queue busy; dropping panic report");
        }
    }
}

#[async_trait]
impl HeartbeatSink for Inner {
    fn record_heartbeat(&self, duration_secs: u64) {
        self.append(Record::Session(SessionMarker::Heartbeat { duration_secs }));
    }

    async fn heartbeat_recorded(&self) {
        self.upload().await;
    }
}

/// Configured id, else the persisted one, else a fresh one that is persisted.
fn resolve_device_id(config: &Config, queue: &PersistentQueue) -> String {
    if let Some(id) = config.device.device_id.as_deref().map(str::trim) {
        if !id.is_empty() {
            return id.to_string();
        }
    }
    if let Some(id) = queue.setting(DEVICE_ID_SETTING) {
        return id;
    }

    let id = uuid::Uuid::new_v4().to_string();
    queue.set_setting(DEVICE_ID_SETTING, &id);
    tracing::info!(device_id = %id, "Generated device id");
    id
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{Payload, ServerAck};

    struct AlwaysOk;

    #[async_trait]
    impl Transport for AlwaysOk {
        async fn send(&self, _endpoint: &str, _payload: &Payload) -> Result<ServerAck> {
            Ok(ServerAck::from_response(200, r#"{"result":"Success"}"#))
        }
    }

    fn client_with(config: Config, queue: PersistentQueue) -> Client {
        Client::with_parts(config, queue, Arc::new(AlwaysOk))
    }

    fn client() -> Client {
        client_with(Config::default(), PersistentQueue::in_memory())
    }

    #[test]
    fn test_device_id_generated_once() {
        let dir = tempfile::tempdir().unwrap();
        let open = || {
            let backend = crate::store::FileBackend::open(dir.path()).unwrap();
            PersistentQueue::open(Box::new(backend))
        };

        let first = client_with(Config::default(), open());
        let second = client_with(Config::default(), open());
        assert!(!first.device_id().is_empty());
        assert_eq!(first.device_id(), second.device_id());
    }

    #[test]
    fn test_configured_device_id_wins() {
        let mut config = Config::default();
        config.device.device_id = Some("fixed-id".to_string());
        assert_eq!(client_with(config, PersistentQueue::in_memory()).device_id(), "fixed-id");
    }

    #[tokio::test]
    async fn test_upload_without_target_is_unconfigured() {
        let client = client();
        assert_eq!(client.upload().await, UploadOutcome::Unconfigured);
    }

    #[tokio::test]
    async fn test_recording_rejects_bad_arguments() {
        let client = client();
        client.start_session("https://c.example.com", "app").await.unwrap();

        assert!(matches!(
            client.record_event("", 1, None, None, None).await,
            Err(Error::InvalidArgument(_))
        ));
        assert!(matches!(
            client.record_view(" ", None).await,
            Err(Error::InvalidArgument(_))
        ));
        assert!(matches!(
            client.record_exception("", None, None, false),
            Err(Error::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_breadcrumbs_are_capped() {
        let mut config = Config::default();
        config.session.max_breadcrumbs = 2;
        let client = client_with(config, PersistentQueue::in_memory());

        client.add_breadcrumb("one");
        client.add_breadcrumb("two");
        client.add_breadcrumb("three");
        assert_eq!(client.inner.breadcrumb_log(), "two\nthree");
    }

    #[test]
    fn test_user_details_change_is_queued_once() {
        let client = client();
        client.update_user_details(|u| u.set_email(Some("ada@example.com")));
        client.update_user_details(|u| u.set_email(Some("ada@example.com")));
        assert_eq!(client.pending().user_details, 1);
        assert!(client.user_details().is_dirty());
    }

    #[test]
    fn test_queued_user_details_are_restored() {
        let dir = tempfile::tempdir().unwrap();
        let open = || {
            let backend = crate::store::FileBackend::open(dir.path()).unwrap();
            PersistentQueue::open(Box::new(backend))
        };

        client_with(Config::default(), open()).update_user_details(|u| u.set_name(Some("Ada")));

        let reopened = client_with(Config::default(), open());
        let details = reopened.user_details();
        assert_eq!(details.name(), Some("Ada"));
        assert!(details.is_dirty());
    }

    #[tokio::test]
    async fn test_view_segmentation() {
        let client = client();
        let event = client.inner.view_event("home", None, true, None).unwrap();
        let seg = event.segmentation().unwrap();
        assert_eq!(event.key(), VIEW_EVENT_KEY);
        assert_eq!(seg.get("name"), Some("home"));
        assert_eq!(seg.get("visit"), Some("1"));
        assert_eq!(seg.get("start"), Some("1"));
        assert_eq!(seg.get("segment"), Some(client.inner.metrics.os_name()));
        assert_eq!(event.duration(), None);
        assert_eq!(event.sum(), None);
    }

    #[test]
    fn test_panic_report_is_queued_as_fatal() {
        let client = client();
        client.add_breadcrumb("before crash");
        client
            .inner
            .record_panic("index out of bounds".to_string(), "src/main.rs:3:5".to_string());

        let entries = client.inner.queue.snapshot();
        assert_eq!(entries.len(), 1);
        match &entries[0].record {
            Record::Exception(report) => {
                assert_eq!(report.title, "index out of bounds");
                assert!(report.fatal);
                assert_eq!(report.logs, "before crash");
                assert!(report
                    .stack_trace
                    .as_deref()
                    .unwrap()
                    .starts_with("at src/main.rs:3:5"));
            }
            other => panic!("expected exception, got {:?}", other),
        }
    }
}
