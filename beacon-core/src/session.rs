//! Session lifecycle
//!
//! ```text
//!            start_session             end_session / halt
//!   Idle ───────────────────▶ Active ──────────────────────▶ Idle
//!                               │ ▲
//!                               └─┘ heartbeat every interval
//! ```
//!
//! [`SessionController`] owns the state machine, the heartbeat timer and view
//! timing. It does not touch the queue itself: every transition takes a
//! closure that the caller uses to append the matching record, and that
//! closure runs while the session lock is held. A heartbeat therefore can
//! never be appended after the `End` marker, and no recording call can slip in
//! after `halt` returns.
//!
//! The heartbeat task re-checks its [`CancellationToken`] under the same lock
//! before acting, so cancellation is final once `end`/`halt` returns.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use async_trait::async_trait;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::config::{validate_app_key, validate_server_url, SessionConfig};
use crate::error::{Error, Result};
use crate::segmentation::Segmentation;

/// Collector a session reports to
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionTarget {
    pub server_url: String,
    pub app_key: String,
}

/// Receives heartbeat ticks from the session timer
#[async_trait]
pub trait HeartbeatSink: Send + Sync + 'static {
    /// Record a heartbeat. Called with the session lock held; must not block.
    fn record_heartbeat(&self, duration_secs: u64);

    /// Called after the heartbeat was recorded, outside the lock.
    async fn heartbeat_recorded(&self);
}

/// What `start` found when it ran
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionStart {
    /// Elapsed seconds of a session that was still active and got replaced
    pub replaced_secs: Option<u64>,
    /// View left open by an earlier session
    pub resumed_view: Option<ResumedView>,
}

/// A view that stays open across a session restart
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResumedView {
    pub name: String,
    /// Segmentation the view was last recorded with
    pub segmentation: Segmentation,
}

/// How a view transition should be reported
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ViewTransition {
    /// No view was open before this one
    pub first: bool,
    /// Seconds the previous view was open, rounded to two decimals
    pub duration: Option<f64>,
}

struct ActiveSession {
    started: Instant,
    token: CancellationToken,
}

struct OpenView {
    name: String,
    segmentation: Segmentation,
    opened: Instant,
}

#[derive(Default)]
struct SessionState {
    active: Option<ActiveSession>,
    target: Option<SessionTarget>,
    last_view: Option<OpenView>,
}

/// Session state machine and heartbeat timer
pub struct SessionController {
    config: SessionConfig,
    state: Mutex<SessionState>,
}

impl SessionController {
    pub fn new(config: SessionConfig) -> Self {
        Self {
            config,
            state: Mutex::new(SessionState::default()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, SessionState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn is_active(&self) -> bool {
        self.lock().active.is_some()
    }

    /// Collector of the current or most recent session. Cleared by `halt`.
    pub fn target(&self) -> Option<SessionTarget> {
        self.lock().target.clone()
    }

    /// Time since the active session started.
    pub fn elapsed(&self) -> Result<Duration> {
        self.lock()
            .active
            .as_ref()
            .map(|s| s.started.elapsed())
            .ok_or(Error::SessionNotActive)
    }

    /// Like [`SessionController::elapsed`], but gives up instead of waiting
    /// for the lock. Used on the panic path.
    pub fn try_elapsed(&self) -> Option<Duration> {
        let state = self.state.try_lock().ok()?;
        state.active.as_ref().map(|s| s.started.elapsed())
    }

    /// Begin a session and start its heartbeat timer.
    ///
    /// `on_begin` runs under the session lock and appends the begin marker
    /// (plus anything `SessionStart` asks for). An active session is replaced.
    pub fn start<F>(
        self: &Arc<Self>,
        server_url: &str,
        app_key: &str,
        sink: Weak<dyn HeartbeatSink>,
        on_begin: F,
    ) -> Result<()>
    where
        F: FnOnce(&SessionStart),
    {
        let server_url = validate_server_url(server_url)?.to_string();
        let app_key = validate_app_key(app_key)?.to_string();

        let token = CancellationToken::new();
        {
            let mut state = self.lock();
            let now = Instant::now();

            let replaced_secs = state.active.take().map(|old| {
                old.token.cancel();
                old.started.elapsed().as_secs()
            });
            if replaced_secs.is_some() {
                tracing::info!("Replacing active session");
            }

            let resumed_view = state.last_view.as_mut().map(|view| {
                view.opened = now;
                ResumedView {
                    name: view.name.clone(),
                    segmentation: view.segmentation.clone(),
                }
            });

            state.target = Some(SessionTarget {
                server_url: server_url.clone(),
                app_key,
            });
            state.active = Some(ActiveSession {
                started: now,
                token: token.clone(),
            });

            on_begin(&SessionStart {
                replaced_secs,
                resumed_view,
            });
        }

        tracing::info!(server = %server_url, "Session started");
        self.spawn_heartbeat(token, sink);
        Ok(())
    }

    /// End the active session. `on_end` receives its duration in seconds and
    /// runs under the session lock, after the timer has been cancelled.
    pub fn end<F>(&self, on_end: F) -> Result<()>
    where
        F: FnOnce(u64),
    {
        let mut state = self.lock();
        let session = state.active.take().ok_or(Error::SessionNotActive)?;
        session.token.cancel();

        let duration_secs = session.started.elapsed().as_secs();
        on_end(duration_secs);
        tracing::info!(duration_secs, "Session ended");
        Ok(())
    }

    /// Hard reset: cancel the timer and forget the target and open view.
    pub fn halt(&self) {
        let mut state = self.lock();
        if let Some(session) = state.active.take() {
            session.token.cancel();
        }
        state.target = None;
        state.last_view = None;
        tracing::info!("Session halted");
    }

    /// Run `f` with the active session's elapsed time, under the lock.
    pub fn with_active<R>(&self, f: impl FnOnce(Duration) -> R) -> Result<R> {
        let state = self.lock();
        let session = state.active.as_ref().ok_or(Error::SessionNotActive)?;
        Ok(f(session.started.elapsed()))
    }

    /// Move the current view to `name`.
    ///
    /// `record` gets the transition to report, runs under the lock and
    /// returns the segmentation it recorded the view with. The current view
    /// only moves if `record` succeeds.
    pub fn open_view(
        &self,
        name: &str,
        record: impl FnOnce(ViewTransition) -> Result<Segmentation>,
    ) -> Result<ViewTransition> {
        let mut state = self.lock();
        if state.active.is_none() {
            return Err(Error::SessionNotActive);
        }

        let now = Instant::now();
        let transition = match &state.last_view {
            Some(previous) => ViewTransition {
                first: false,
                duration: Some(round_view_duration(now - previous.opened)),
            },
            None => ViewTransition {
                first: true,
                duration: None,
            },
        };
        let segmentation = record(transition)?;
        state.last_view = Some(OpenView {
            name: name.to_string(),
            segmentation,
            opened: now,
        });
        Ok(transition)
    }

    /// Heartbeat step: `record` gets the capped duration and runs under the
    /// lock, unless `token` was cancelled first. Returns whether it ran.
    fn beat(&self, token: &CancellationToken, record: impl FnOnce(u64)) -> bool {
        let state = self.lock();
        if token.is_cancelled() {
            return false;
        }
        let Some(session) = state.active.as_ref() else {
            return false;
        };
        record(heartbeat_duration(
            session.started.elapsed(),
            self.config.max_heartbeat_secs,
        ));
        true
    }

    fn spawn_heartbeat(
        self: &Arc<Self>,
        token: CancellationToken,
        sink: Weak<dyn HeartbeatSink>,
    ) {
        let controller = Arc::downgrade(self);
        let period = self.config.heartbeat_interval();

        let _timer: JoinHandle<()> = tokio::spawn(async move {
            let mut ticks = tokio::time::interval_at(Instant::now() + period, period);
            ticks.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticks.tick() => {}
                }

                let (Some(controller), Some(sink)) = (controller.upgrade(), sink.upgrade()) else {
                    break;
                };
                if !controller.beat(&token, |secs| sink.record_heartbeat(secs)) {
                    break;
                }
                tracing::debug!("Heartbeat");
                sink.heartbeat_recorded().await;
            }
            tracing::debug!("Heartbeat timer stopped");
        });
    }
}

/// Heartbeat duration: time since session start, capped by the collector limit.
pub fn heartbeat_duration(elapsed: Duration, cap_secs: u64) -> u64 {
    elapsed.as_secs().min(cap_secs)
}

/// Seconds rounded to two decimals
pub fn round_view_duration(elapsed: Duration) -> f64 {
    (elapsed.as_secs_f64() * 100.0).round() / 100.0
}
