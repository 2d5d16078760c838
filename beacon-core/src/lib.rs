//! # beacon-core
//!
//! Client-side telemetry for applications: sessions, custom events, screen
//! views, crash reports and user profiles, queued durably and uploaded to an
//! analytics collector over HTTP.
//!
//! This library provides:
//! - A record model with construction-time validation
//! - A crash-safe upload queue (JSON files, SQLite, or memory)
//! - An upload pipeline with coalescing and retry-on-next-trigger
//! - Session lifecycle with a heartbeat timer and view timing
//! - Configuration management and logging infrastructure
//!
//! ## Architecture
//!
//! Records flow one way:
//! - **Record:** the [`Client`] validates a call and builds a record
//! - **Queue:** the record is appended durably before the call returns
//! - **Upload:** the pipeline drains the queue and removes only what the
//!   collector acknowledged
//!
//! ## Example
//!
//! ```rust,no_run
//! use beacon_core::{Client, Config};
//!
//! # async fn demo() -> beacon_core::Result<()> {
//! // Load configuration and recover anything queued by an earlier run
//! let client = Client::open(Config::load()?)?;
//!
//! client.start_session("https://analytics.example.com", "0123456789abcdef").await?;
//! client.record_event("level_complete", 1, None, Some(42.0), None).await?;
//! client.end_session().await?;
//! # Ok(())
//! # }
//! ```

use std::sync::{Mutex, MutexGuard, PoisonError};

// Re-export commonly used items at the crate root
pub use client::Client;
pub use config::Config;
pub use error::{Error, Result};
pub use segmentation::Segmentation;
pub use store::PersistentQueue;
pub use transport::{Payload, ServerAck, Transport};
pub use types::*;
pub use upload::{UploadOutcome, UploadStats};

// Public modules
pub mod client;
pub mod clock;
pub mod config;
pub mod error;
pub mod logging;
pub mod segmentation;
pub mod session;
pub mod store;
pub mod transport;
pub mod types;
pub mod upload;

/// Lock a mutex, recovering the data if a holder panicked.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
