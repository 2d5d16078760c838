//! Upload pipeline
//!
//! The [`Uploader`] drains the [`PersistentQueue`] into collector requests:
//!
//! 1. Take a snapshot of the queue (no lock is held while sending).
//! 2. Build a batch in priority order: session markers, then events, then
//!    exception reports. A queued user-details update rides along with the
//!    first session or events request, or goes on its own.
//! 3. Send it through the [`Transport`].
//! 4. On acknowledgement, remove exactly the delivered entries, mark the user
//!    details synced, and go round again for anything queued meanwhile.
//! 5. On any failure, leave the queue untouched and stop. The next trigger
//!    (a recording call, a heartbeat, or an explicit upload) starts over.
//!
//! The drain is a bounded loop of at most `max_rounds` network calls. Only one
//! drain runs at a time; a trigger that arrives while one is in flight returns
//! [`UploadOutcome::Coalesced`] immediately.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use crate::config::{Protocol, UploadConfig};
use crate::error::{Error, Result};
use crate::lock;
use crate::store::PersistentQueue;
use crate::transport::wire::{self, RequestContext, WireRequest};
use crate::transport::Transport;
use crate::types::{QueueEntry, Record, RecordKind, UserDetails, UserDetailsDelta};

/// Where and as whom to upload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadTarget {
    /// Collector base URL, without a trailing slash
    pub server_url: String,
    pub app_key: String,
    pub device_id: String,
}

impl UploadTarget {
    fn context(&self) -> RequestContext {
        RequestContext {
            app_key: self.app_key.clone(),
            device_id: self.device_id.clone(),
        }
    }
}

/// Result of one upload trigger
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UploadOutcome {
    /// The queue was empty
    Idle,
    /// This many entries were acknowledged and removed
    Delivered(usize),
    /// Another upload was already in flight
    Coalesced,
    /// A request failed; `delivered` entries made it before the failure
    Failed { delivered: usize },
    /// No collector URL and app key are known yet
    Unconfigured,
}

impl UploadOutcome {
    pub fn is_failure(&self) -> bool {
        matches!(self, UploadOutcome::Failed { .. })
    }
}

/// Counters across the uploader's lifetime
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct UploadStats {
    /// Network calls made
    pub requests_sent: usize,
    /// Queue entries acknowledged and removed
    pub entries_delivered: usize,
    /// Network calls that failed or were not acknowledged
    pub failures: usize,
    /// Triggers dropped because an upload was in flight
    pub coalesced: usize,
}

/// One network call's worth of queued entries
struct Batch {
    requests: Vec<WireRequest>,
    seqs: Vec<u64>,
    user_details_revision: Option<u64>,
}

impl Batch {
    fn new() -> Self {
        Self {
            requests: Vec::new(),
            seqs: Vec::new(),
            user_details_revision: None,
        }
    }

    fn push(&mut self, request: WireRequest, entries: &[&QueueEntry]) {
        self.requests.push(request);
        self.seqs.extend(entries.iter().map(|e| e.seq));
    }
}

/// Queued entries grouped by kind, each group in sequence order
struct Grouped<'a> {
    sessions: Vec<&'a QueueEntry>,
    events: Vec<&'a QueueEntry>,
    exceptions: Vec<&'a QueueEntry>,
    user_details: Vec<&'a QueueEntry>,
}

impl<'a> Grouped<'a> {
    fn new(entries: &'a [QueueEntry]) -> Self {
        let of = |kind: RecordKind| -> Vec<&'a QueueEntry> {
            entries.iter().filter(|e| e.kind() == kind).collect()
        };
        Self {
            sessions: of(RecordKind::Session),
            events: of(RecordKind::Events),
            exceptions: of(RecordKind::Exception),
            user_details: of(RecordKind::UserDetails),
        }
    }
}

/// Clears the in-flight flag when a drain ends, however it ends
struct InFlight<'a>(&'a AtomicBool);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Drains the queue to the collector
pub struct Uploader {
    transport: Arc<dyn Transport>,
    queue: Arc<PersistentQueue>,
    details: Arc<Mutex<UserDetails>>,
    config: UploadConfig,
    salt: Option<String>,
    in_progress: AtomicBool,
    stats: Mutex<UploadStats>,
}

impl Uploader {
    pub fn new(
        transport: Arc<dyn Transport>,
        queue: Arc<PersistentQueue>,
        details: Arc<Mutex<UserDetails>>,
        config: UploadConfig,
        salt: Option<String>,
    ) -> Self {
        Self {
            transport,
            queue,
            details,
            config,
            salt: salt.filter(|s| !s.is_empty()),
            in_progress: AtomicBool::new(false),
            stats: Mutex::new(UploadStats::default()),
        }
    }

    /// Snapshot of the counters
    pub fn stats(&self) -> UploadStats {
        *lock(&self.stats)
    }

    /// Whether a drain is currently running
    pub fn is_uploading(&self) -> bool {
        self.in_progress.load(Ordering::Acquire)
    }

    /// Drain the queue to `target`.
    ///
    /// Never returns an error: failures are logged, counted and reported in
    /// the outcome, and the undelivered entries stay queued.
    pub async fn run(&self, target: &UploadTarget) -> UploadOutcome {
        if self
            .in_progress
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            lock(&self.stats).coalesced += 1;
            tracing::debug!("Upload already in flight, coalescing trigger");
            return UploadOutcome::Coalesced;
        }
        let _in_flight = InFlight(&self.in_progress);

        let mut delivered = 0;
        for round in 0..self.config.max_rounds {
            let snapshot = self.queue.snapshot();
            let batch = match self.build_batch(&snapshot, target) {
                Ok(Some(batch)) => batch,
                Ok(None) => break,
                Err(e) => {
                    tracing::warn!(error = %e, "Failed to encode upload batch");
                    lock(&self.stats).failures += 1;
                    return UploadOutcome::Failed { delivered };
                }
            };

            tracing::debug!(
                round,
                requests = batch.requests.len(),
                entries = batch.seqs.len(),
                "Sending upload batch"
            );

            if let Err(e) = self.deliver(&batch, target).await {
                tracing::warn!(
                    error = %e,
                    pending = self.queue.len(),
                    "Upload failed; records stay queued for the next attempt"
                );
                lock(&self.stats).failures += 1;
                return UploadOutcome::Failed { delivered };
            }

            let removed = self.queue.remove_confirmed(&batch.seqs);
            if let Some(revision) = batch.user_details_revision {
                lock(&self.details).mark_synced(revision);
            }
            lock(&self.stats).entries_delivered += removed;
            delivered += removed;

            if round + 1 == self.config.max_rounds && !self.queue.is_empty() {
                tracing::debug!(
                    pending = self.queue.len(),
                    "Upload round limit reached; the rest waits for the next trigger"
                );
            }
        }

        if delivered == 0 {
            UploadOutcome::Idle
        } else {
            tracing::info!(entries = delivered, "Uploaded queued records");
            UploadOutcome::Delivered(delivered)
        }
    }

    async fn deliver(&self, batch: &Batch, target: &UploadTarget) -> Result<()> {
        let salt = self.salt.as_deref();
        let (endpoint, payload) = match self.config.protocol {
            Protocol::Legacy => {
                let request = batch
                    .requests
                    .first()
                    .ok_or_else(|| Error::Serialization("empty legacy batch".to_string()))?;
                wire::encode_legacy(&target.server_url, request, salt)
            }
            Protocol::Bulk => {
                wire::encode_bulk(&target.server_url, &target.app_key, &batch.requests, salt)?
            }
        };

        lock(&self.stats).requests_sent += 1;
        let ack = self.transport.send(&endpoint, &payload).await?;
        if ack.is_success() {
            Ok(())
        } else {
            Err(Error::Transport(format!(
                "collector did not acknowledge (status {}, result {:?})",
                ack.status, ack.result
            )))
        }
    }

    /// Build the next batch from a queue snapshot, or `None` when empty.
    fn build_batch(&self, entries: &[QueueEntry], target: &UploadTarget) -> Result<Option<Batch>> {
        if entries.is_empty() {
            return Ok(None);
        }
        let ctx = target.context();
        let grouped = Grouped::new(entries);
        let batch = match self.config.protocol {
            Protocol::Bulk => self.bulk_batch(&ctx, &grouped)?,
            Protocol::Legacy => self.legacy_batch(&ctx, &grouped)?,
        };
        Ok(Some(batch))
    }

    /// Everything queued, in priority order, as one bulk call.
    fn bulk_batch(&self, ctx: &RequestContext, grouped: &Grouped<'_>) -> Result<Batch> {
        let mut batch = Batch::new();

        for &entry in &grouped.sessions {
            batch.push(session_request(ctx, entry)?, &[entry]);
        }
        for chunk in event_chunks(&grouped.events, self.config.max_events_per_request) {
            batch.push(events_request(ctx, &chunk)?, &chunk);
        }
        for &entry in &grouped.exceptions {
            batch.push(crash_request(ctx, entry)?, &[entry]);
        }

        if let Some((entry, delta)) = latest_details(&grouped.user_details) {
            match batch.requests.first_mut() {
                Some(first) => first.attach_user_details(&delta.details)?,
                None => batch.requests.push(WireRequest::user_details(
                    ctx,
                    entry.timestamp,
                    &delta.details,
                )?),
            }
            batch.seqs.extend(grouped.user_details.iter().map(|e| e.seq));
            batch.user_details_revision = Some(delta.revision);
        }

        Ok(batch)
    }

    /// The single highest-priority request, for the one-request-per-call protocol.
    fn legacy_batch(&self, ctx: &RequestContext, grouped: &Grouped<'_>) -> Result<Batch> {
        let mut batch = Batch::new();
        let details = latest_details(&grouped.user_details);

        let next_events = event_chunks(&grouped.events, self.config.max_events_per_request)
            .into_iter()
            .next();

        if let Some(entry) = grouped.sessions.first().copied() {
            batch.push(session_request(ctx, entry)?, &[entry]);
        } else if let Some(chunk) = next_events {
            batch.push(events_request(ctx, &chunk)?, &chunk);
        } else if let Some(entry) = grouped.exceptions.first().copied() {
            // Crash reports travel without user details
            batch.push(crash_request(ctx, entry)?, &[entry]);
            return Ok(batch);
        } else if let Some((entry, delta)) = details {
            batch.requests.push(WireRequest::user_details(
                ctx,
                entry.timestamp,
                &delta.details,
            )?);
            batch.seqs.extend(grouped.user_details.iter().map(|e| e.seq));
            batch.user_details_revision = Some(delta.revision);
            return Ok(batch);
        }

        if let (Some(first), Some((_, delta))) = (batch.requests.first_mut(), details) {
            first.attach_user_details(&delta.details)?;
            batch.seqs.extend(grouped.user_details.iter().map(|e| e.seq));
            batch.user_details_revision = Some(delta.revision);
        }

        Ok(batch)
    }
}

fn session_request(ctx: &RequestContext, entry: &QueueEntry) -> Result<WireRequest> {
    match &entry.record {
        Record::Session(marker) => WireRequest::session(ctx, entry.timestamp, marker),
        other => Err(Error::Serialization(format!(
            "expected a session record, found {}",
            other.kind()
        ))),
    }
}

fn crash_request(ctx: &RequestContext, entry: &QueueEntry) -> Result<WireRequest> {
    match &entry.record {
        Record::Exception(report) => WireRequest::crash(ctx, entry.timestamp, report),
        other => Err(Error::Serialization(format!(
            "expected an exception record, found {}",
            other.kind()
        ))),
    }
}

fn events_request(ctx: &RequestContext, chunk: &[&QueueEntry]) -> Result<WireRequest> {
    let timestamp = chunk.first().map(|e| e.timestamp).unwrap_or_default();
    let events = chunk.iter().copied().flat_map(|entry: &QueueEntry| {
        let events: &[_] = match &entry.record {
            Record::Events(events) => events,
            _ => &[],
        };
        events.iter().map(move |event| (entry.timestamp, event))
    });
    WireRequest::events(ctx, timestamp, events)
}

fn latest_details<'a>(entries: &[&'a QueueEntry]) -> Option<(&'a QueueEntry, &'a UserDetailsDelta)> {
    entries.iter().copied().rev().find_map(|entry| match &entry.record {
        Record::UserDetails(delta) => Some((entry, delta)),
        _ => None,
    })
}

/// Group event entries into requests of at most `cap` events.
///
/// Entries are never split, so one entry larger than `cap` forms its own
/// request.
fn event_chunks<'a>(entries: &[&'a QueueEntry], cap: usize) -> Vec<Vec<&'a QueueEntry>> {
    let mut chunks = Vec::new();
    let mut current: Vec<&QueueEntry> = Vec::new();
    let mut count = 0;

    for &entry in entries {
        let len = match &entry.record {
            Record::Events(events) => events.len(),
            _ => 0,
        };
        if !current.is_empty() && count + len > cap {
            chunks.push(std::mem::take(&mut current));
            count = 0;
        }
        current.push(entry);
        count += len;
    }
    if !current.is_empty() {
        chunks.push(current);
    }
    chunks
}
