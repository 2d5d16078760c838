//! Record model for beacon
//!
//! These are the values the client queues and later uploads. Everything here
//! is plain data: construction validates, nothing performs I/O.
//!
//! ## Terminology
//!
//! | Term | Definition |
//! |------|------------|
//! | **Event** | A named, counted occurrence with optional sum, duration and segmentation |
//! | **Session marker** | Begin / heartbeat / end notifications driving server-side session accounting |
//! | **Exception report** | A crash or handled error with breadcrumbs and a device snapshot |
//! | **User details** | Profile fields for the device's user, uploaded only when changed |
//! | **Queue entry** | One persisted, sequence-numbered unit of outbound work |
//!
//! Wire names (`_os`, `begin_session`, ...) live in [`crate::transport::wire`];
//! the serde derives here describe the persisted form only.

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::segmentation::Segmentation;

/// Reserved event key used for screen views.
pub const VIEW_EVENT_KEY: &str = "[CLY]_view";

// ============================================
// Events
// ============================================

/// A custom event.
///
/// `key` is non-empty and `count` positive; both are checked in [`Event::new`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    key: String,
    count: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    sum: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    duration: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    segmentation: Option<Segmentation>,
}

impl Event {
    /// Build an event, rejecting a blank key, a non-positive count, a
    /// negative duration, or non-finite numbers.
    pub fn new(
        key: impl Into<String>,
        count: i64,
        sum: Option<f64>,
        duration: Option<f64>,
        segmentation: Option<Segmentation>,
    ) -> Result<Self> {
        let key = key.into();
        if key.trim().is_empty() {
            return Err(Error::InvalidArgument(
                "event key must be a non-empty string".to_string(),
            ));
        }
        let count = match u64::try_from(count) {
            Ok(count) if count > 0 => count,
            _ => {
                return Err(Error::InvalidArgument(format!(
                    "event count must be positive, got {}",
                    count
                )))
            }
        };
        if let Some(sum) = sum {
            if !sum.is_finite() {
                return Err(Error::InvalidArgument("event sum must be finite".to_string()));
            }
        }
        if let Some(duration) = duration {
            if !duration.is_finite() || duration < 0.0 {
                return Err(Error::InvalidArgument(format!(
                    "event duration must be a finite, non-negative number, got {}",
                    duration
                )));
            }
        }

        Ok(Self {
            key,
            count,
            sum,
            duration,
            segmentation: segmentation.filter(|s| !s.is_empty()),
        })
    }

    /// An event with a count of one and nothing else attached.
    pub fn named(key: impl Into<String>) -> Result<Self> {
        Self::new(key, 1, None, None, None)
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn count(&self) -> u64 {
        self.count
    }

    pub fn sum(&self) -> Option<f64> {
        self.sum
    }

    pub fn duration(&self) -> Option<f64> {
        self.duration
    }

    pub fn segmentation(&self) -> Option<&Segmentation> {
        self.segmentation.as_ref()
    }

    /// Whether this is a screen-view event.
    pub fn is_view(&self) -> bool {
        self.key == VIEW_EVENT_KEY
    }
}

// ============================================
// Device facts
// ============================================

/// Static facts about the device and application.
///
/// Collected by the host (or [`DeviceMetrics::detect`]) and copied into
/// session begin markers and exception reports.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceMetrics {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub os: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub os_version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub manufacturer: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolution: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub carrier: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub app_version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub locale: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub orientation: Option<String>,
}

impl DeviceMetrics {
    /// Best-effort facts for the current process: OS name, architecture as
    /// the device model, and locale from the environment.
    pub fn detect() -> Self {
        let os = match std::env::consts::OS {
            "linux" => "Linux",
            "macos" => "macOS",
            "windows" => "Windows",
            "ios" => "iOS",
            "android" => "Android",
            "freebsd" => "FreeBSD",
            other => other,
        };

        let locale = ["LC_ALL", "LC_MESSAGES", "LANG"]
            .iter()
            .filter_map(|var| std::env::var(var).ok())
            .find(|v| !v.is_empty() && v != "C" && v != "POSIX")
            .map(|v| v.split('.').next().unwrap_or(&v).to_string());

        Self {
            os: Some(os.to_string()),
            device: Some(std::env::consts::ARCH.to_string()),
            locale,
            ..Default::default()
        }
    }

    /// OS name used for the `segment` dimension of view events.
    pub fn os_name(&self) -> &str {
        self.os.as_deref().unwrap_or("Unknown")
    }
}

// ============================================
// Sessions
// ============================================

/// Session lifecycle notification.
///
/// Exactly one `Begin` precedes the heartbeats and the `End` of a session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SessionMarker {
    Begin {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        app_version: Option<String>,
        device_id: String,
        sdk_version: String,
        metrics: DeviceMetrics,
    },
    Heartbeat {
        duration_secs: u64,
    },
    End {
        duration_secs: u64,
    },
}

impl SessionMarker {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionMarker::Begin { .. } => "begin",
            SessionMarker::Heartbeat { .. } => "heartbeat",
            SessionMarker::End { .. } => "end",
        }
    }
}

// ============================================
// Exceptions
// ============================================

/// A crash or handled error.
///
/// Immutable once built; `run_secs` is the time since the session started.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExceptionReport {
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stack_trace: Option<String>,
    pub fatal: bool,
    /// Breadcrumb log, newline-joined
    #[serde(default)]
    pub logs: String,
    pub run_secs: u64,
    pub metrics: DeviceMetrics,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub custom: Option<Segmentation>,
}

// ============================================
// User details
// ============================================

/// Profile of the device's user.
///
/// Every setter reports whether it changed a value. A change bumps the
/// revision; the details are dirty while the latest revision has not been
/// acknowledged by the server (see [`UserDetails::mark_synced`]).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UserDetails {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    email: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    organization: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    phone: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    picture: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    gender: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    birth_year: Option<i32>,
    #[serde(default, skip_serializing_if = "Segmentation::is_empty")]
    custom: Segmentation,

    #[serde(skip)]
    revision: u64,
    #[serde(skip)]
    synced_revision: u64,
}

macro_rules! string_field {
    ($get:ident, $set:ident) => {
        pub fn $get(&self) -> Option<&str> {
            self.$get.as_deref()
        }

        pub fn $set(&mut self, value: Option<impl Into<String>>) -> bool {
            let value = value.map(Into::into);
            if self.$get == value {
                return false;
            }
            self.$get = value;
            self.touch()
        }
    };
}

impl UserDetails {
    pub fn new() -> Self {
        Self::default()
    }

    string_field!(name, set_name);
    string_field!(username, set_username);
    string_field!(email, set_email);
    string_field!(organization, set_organization);
    string_field!(phone, set_phone);
    string_field!(picture, set_picture);
    string_field!(gender, set_gender);

    pub fn birth_year(&self) -> Option<i32> {
        self.birth_year
    }

    pub fn set_birth_year(&mut self, value: Option<i32>) -> bool {
        if self.birth_year == value {
            return false;
        }
        self.birth_year = value;
        self.touch()
    }

    pub fn custom(&self) -> &Segmentation {
        &self.custom
    }

    /// Set a custom profile value; `None` removes it.
    pub fn set_custom(&mut self, key: impl Into<String>, value: Option<String>) -> bool {
        if self.custom.set_opt(key, value) {
            self.touch()
        } else {
            false
        }
    }

    pub fn clear_custom(&mut self) -> bool {
        if self.custom.clear() {
            self.touch()
        } else {
            false
        }
    }

    /// Monotonic change counter.
    pub fn revision(&self) -> u64 {
        self.revision
    }

    /// Whether a change has not yet been acknowledged.
    pub fn is_dirty(&self) -> bool {
        self.revision > self.synced_revision
    }

    /// Record that the server acknowledged the snapshot taken at `revision`.
    ///
    /// A change made after that snapshot keeps the details dirty. Revisions
    /// newer than the live one (details reset mid-upload) are ignored.
    pub fn mark_synced(&mut self, revision: u64) {
        if revision <= self.revision {
            self.synced_revision = self.synced_revision.max(revision);
        }
    }

    /// Forget every value. The revision counter keeps counting, so an
    /// acknowledgement for a snapshot taken before the reset cannot mark
    /// later edits as synced. The empty profile is not dirty.
    pub fn reset(&mut self) {
        let revision = self.revision + 1;
        *self = Self {
            revision,
            synced_revision: revision,
            ..Self::default()
        };
    }

    /// Snapshot for the upload queue.
    pub fn delta(&self) -> UserDetailsDelta {
        UserDetailsDelta {
            revision: self.revision,
            details: self.clone(),
        }
    }

    /// Rebuild live details from a persisted, still unacknowledged snapshot.
    pub fn restore(delta: &UserDetailsDelta) -> Self {
        let mut details = delta.details.clone();
        details.revision = delta.revision;
        details.synced_revision = 0;
        details
    }

    fn touch(&mut self) -> bool {
        self.revision += 1;
        true
    }
}

/// Snapshot of [`UserDetails`] queued for upload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserDetailsDelta {
    pub revision: u64,
    pub details: UserDetails,
}

// ============================================
// Queue entries
// ============================================

/// One unit of outbound work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "data", rename_all = "snake_case")]
pub enum Record {
    Session(SessionMarker),
    Events(Vec<Event>),
    Exception(ExceptionReport),
    UserDetails(UserDetailsDelta),
}

impl Record {
    pub fn kind(&self) -> RecordKind {
        match self {
            Record::Session(_) => RecordKind::Session,
            Record::Events(_) => RecordKind::Events,
            Record::Exception(_) => RecordKind::Exception,
            Record::UserDetails(_) => RecordKind::UserDetails,
        }
    }
}

/// Kind of a queued record; also the name of its persisted collection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordKind {
    Session,
    Events,
    Exception,
    UserDetails,
}

impl RecordKind {
    /// All kinds, in upload priority order.
    pub const ALL: [RecordKind; 4] = [
        RecordKind::Session,
        RecordKind::Events,
        RecordKind::Exception,
        RecordKind::UserDetails,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            RecordKind::Session => "sessions",
            RecordKind::Events => "events",
            RecordKind::Exception => "exceptions",
            RecordKind::UserDetails => "user_details",
        }
    }
}

impl std::str::FromStr for RecordKind {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "sessions" => Ok(RecordKind::Session),
            "events" => Ok(RecordKind::Events),
            "exceptions" => Ok(RecordKind::Exception),
            "user_details" => Ok(RecordKind::UserDetails),
            _ => Err(format!("unknown record kind: {}", s)),
        }
    }
}

impl std::fmt::Display for RecordKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A persisted envelope around one [`Record`].
///
/// `seq` is assigned by the queue and strictly increases; `timestamp` is the
/// Unix-millisecond time the record was produced.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueEntry {
    pub seq: u64,
    pub timestamp: i64,
    pub record: Record,
}

impl QueueEntry {
    pub fn kind(&self) -> RecordKind {
        self.record.kind()
    }
}

/// Number of queued entries per kind.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PendingCounts {
    pub sessions: usize,
    pub events: usize,
    pub exceptions: usize,
    pub user_details: usize,
}

impl PendingCounts {
    pub fn from_entries<'a>(entries: impl IntoIterator<Item = &'a QueueEntry>) -> Self {
        let mut counts = Self::default();
        for entry in entries {
            match &entry.record {
                Record::Session(_) => counts.sessions += 1,
                Record::Events(events) => counts.events += events.len(),
                Record::Exception(_) => counts.exceptions += 1,
                Record::UserDetails(_) => counts.user_details += 1,
            }
        }
        counts
    }

    pub fn total(&self) -> usize {
        self.sessions + self.events + self.exceptions + self.user_details
    }
}
