//! beacon - CLI for inspecting and flushing the telemetry upload queue
//!
//! This tool provides commands for:
//! - Checking configuration and queued records
//! - Uploading queued records to the collector
//! - Recording one-off events and crash reports from scripts
//! - Purging the queue
//!
//! Uses XDG Base Directory specification for file locations:
//! - Queue: $XDG_DATA_HOME/beacon/ (~/.local/share/beacon/)
//! - Config: $XDG_CONFIG_HOME/beacon/config.toml (~/.config/beacon/config.toml)
//! - Logs: $XDG_STATE_HOME/beacon/beacon.log (~/.local/state/beacon/beacon.log)

use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use beacon_core::{Client, Config, Segmentation, UploadOutcome};
use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "beacon")]
#[command(about = "Inspect and flush the beacon telemetry queue")]
#[command(version)]
struct Args {
    /// Verbose output (writes a log file)
    #[arg(short, long)]
    verbose: bool,

    /// Config file (default: $XDG_CONFIG_HOME/beacon/config.toml)
    #[arg(short, long)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Show configuration and queued records
    Status,

    /// Upload everything queued
    Flush,

    /// Record one event in a short session
    Event {
        /// Event key
        key: String,

        #[arg(long, default_value_t = 1)]
        count: i64,

        #[arg(long)]
        sum: Option<f64>,

        /// Duration in seconds
        #[arg(long)]
        duration: Option<f64>,

        /// Segmentation as key=value (repeatable)
        #[arg(short, long = "segment", value_parser = parse_key_value)]
        segment: Vec<(String, String)>,
    },

    /// Record an exception report and flush
    Crash {
        /// Exception title
        title: String,

        /// File containing the stack trace
        #[arg(long)]
        stack_trace: Option<PathBuf>,

        /// Report as an unhandled (fatal) crash
        #[arg(long)]
        fatal: bool,
    },

    /// Drop every queued record
    Purge,
}

fn parse_key_value(s: &str) -> std::result::Result<(String, String), String> {
    let (key, value) = s
        .split_once('=')
        .ok_or_else(|| format!("expected key=value, got '{}'", s))?;
    if key.trim().is_empty() {
        return Err(format!("empty key in '{}'", s));
    }
    Ok((key.trim().to_string(), value.to_string()))
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let config = match &args.config {
        Some(path) => Config::load_from(path),
        None => Config::load(),
    }
    .context("failed to load configuration")?;

    // Held until exit so buffered log lines are flushed
    let _log_guard = if args.verbose {
        Some(beacon_core::logging::init(&config.logging).context("failed to initialize logging")?)
    } else {
        None
    };

    match args.command {
        Command::Status => cmd_status(config),
        Command::Flush => cmd_flush(config).await,
        Command::Event {
            key,
            count,
            sum,
            duration,
            segment,
        } => cmd_event(config, &key, count, sum, duration, segment).await,
        Command::Crash {
            title,
            stack_trace,
            fatal,
        } => cmd_crash(config, &title, stack_trace, fatal).await,
        Command::Purge => cmd_purge(config),
    }
}

fn open_client(config: Config) -> Result<Client> {
    Client::open(config).context("failed to open telemetry client")
}

/// Collector URL and app key, or an error explaining how to set them
fn server_target(config: &Config) -> Result<(String, String)> {
    match (&config.server.url, &config.server.app_key) {
        (Some(url), Some(app_key)) => Ok((url.clone(), app_key.clone())),
        _ => bail!(
            "collector is not configured; set [server] url and app_key in {}",
            Config::config_path().display()
        ),
    }
}

fn cmd_status(config: Config) -> Result<()> {
    println!("Beacon Configuration");
    println!("====================");
    println!();

    let server = &config.server;
    println!(
        "Server URL:      {}",
        server.url.as_deref().unwrap_or("<not set>")
    );
    println!(
        "App Key:         {}",
        if server.app_key.is_some() {
            "<set>"
        } else {
            "<not set>"
        }
    );
    println!(
        "Signing:         {}",
        if server.salt.is_some() { "checksum256" } else { "off" }
    );
    println!("Protocol:        {:?}", config.upload.protocol);
    println!("Timeout:         {}s", config.upload.timeout_secs);
    println!("Heartbeat:       {}s", config.session.heartbeat_interval_secs);
    println!(
        "Storage:         {:?} ({})",
        config.storage.backend,
        config.storage.dir().display()
    );

    let client = open_client(config)?;
    let pending = client.pending();

    println!();
    println!("Device ID:       {}", client.device_id());
    println!();
    println!("Queued:");
    println!("  Sessions:      {}", pending.sessions);
    println!("  Events:        {}", pending.events);
    println!("  Exceptions:    {}", pending.exceptions);
    println!("  User details:  {}", pending.user_details);
    println!("  Total:         {}", pending.total());

    println!();
    if client.config().server.is_ready() {
        println!("Status: Ready to upload");
    } else {
        println!("Status: Not ready (missing [server] url or app_key)");
    }

    Ok(())
}

async fn cmd_flush(config: Config) -> Result<()> {
    let client = open_client(config)?;
    let before = client.pending().total();
    if before == 0 {
        println!("Nothing queued.");
        return Ok(());
    }

    println!("Uploading {} queued entries...", before);
    let outcome = client.upload().await;
    report(&client, outcome)
}

async fn cmd_event(
    config: Config,
    key: &str,
    count: i64,
    sum: Option<f64>,
    duration: Option<f64>,
    segment: Vec<(String, String)>,
) -> Result<()> {
    let (url, app_key) = server_target(&config)?;
    let client = open_client(config)?;

    let segmentation = if segment.is_empty() {
        None
    } else {
        let mut seg = Segmentation::new();
        for (k, v) in segment {
            seg.set(k, v);
        }
        Some(seg)
    };

    client
        .start_session(&url, &app_key)
        .await
        .context("failed to start session")?;
    client
        .record_event(key, count, sum, duration, segmentation)
        .await
        .context("failed to record event")?;
    let outcome = client.end_session().await.context("failed to end session")?;

    println!("Recorded event '{}'.", key);
    report(&client, outcome)
}

async fn cmd_crash(
    config: Config,
    title: &str,
    stack_trace: Option<PathBuf>,
    fatal: bool,
) -> Result<()> {
    let (url, app_key) = server_target(&config)?;
    let stack_trace = stack_trace
        .map(|path| {
            std::fs::read_to_string(&path)
                .with_context(|| format!("failed to read stack trace {}", path.display()))
        })
        .transpose()?;

    let client = open_client(config)?;
    client
        .start_session(&url, &app_key)
        .await
        .context("failed to start session")?;
    client
        .record_exception(title, stack_trace.as_deref(), None, fatal)
        .context("failed to record exception")?;
    let outcome = client.end_session().await.context("failed to end session")?;

    println!(
        "Recorded {} exception '{}'.",
        if fatal { "fatal" } else { "non-fatal" },
        title
    );
    report(&client, outcome)
}

fn cmd_purge(config: Config) -> Result<()> {
    let client = open_client(config)?;
    let dropped = client.pending().total();
    client.halt();
    println!("Purged {} queued entries.", dropped);
    Ok(())
}

/// Print an upload outcome; a failed upload is an error exit
fn report(client: &Client, outcome: UploadOutcome) -> Result<()> {
    let remaining = client.pending().total();
    match outcome {
        UploadOutcome::Idle => println!("Queue is empty."),
        UploadOutcome::Delivered(n) => println!("Delivered {} entries.", n),
        UploadOutcome::Coalesced => println!("An upload is already running."),
        UploadOutcome::Unconfigured => {
            println!("Collector is not configured; {} entries stay queued.", remaining);
            return Ok(());
        }
        UploadOutcome::Failed { delivered } => {
            bail!(
                "upload failed after {} delivered entries; {} entries stay queued for the next run",
                delivered,
                remaining
            );
        }
    }

    if remaining > 0 {
        println!("{} entries still queued.", remaining);
    }
    Ok(())
}
