//! Logging setup.
//!
//! Builds a `tracing-subscriber` registry with an env-driven filter, a
//! console layer (plain or JSON) and an optional JSONL file layer so a
//! headless scheduler keeps a local record of what it did.

use anyhow::{Context, Result};
use std::fs::File;
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

#[derive(Debug, Clone)]
pub struct TelemetryConfig {
    /// Whether to output JSON-structured logs to console.
    pub json_logs: bool,
    /// Filter used when `RUST_LOG` is unset (e.g. "tether=info").
    pub log_filter: String,
    /// Directory for daily JSONL log files. `None` disables file output.
    pub log_dir: Option<PathBuf>,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            json_logs: false,
            log_filter: "tether=info".into(),
            log_dir: None,
        }
    }
}

/// Install the global subscriber.
///
/// Returns a guard that must be kept alive for the duration of the program.
/// Dropping it syncs the log file to disk.
pub fn init_telemetry(config: &TelemetryConfig) -> Result<TelemetryGuard> {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_filter));

    let console_layer = if config.json_logs {
        tracing_subscriber::fmt::layer()
            .json()
            .with_span_events(FmtSpan::NONE)
            .boxed()
    } else {
        tracing_subscriber::fmt::layer()
            .with_span_events(FmtSpan::NONE)
            .boxed()
    };

    let file = match &config.log_dir {
        Some(dir) => Some(Arc::new(open_log_file(dir)?)),
        None => None,
    };
    let file_layer = file.as_ref().map(|file| {
        tracing_subscriber::fmt::layer()
            .json()
            .with_span_events(FmtSpan::CLOSE)
            .with_writer(Arc::clone(file))
            .with_ansi(false)
    });

    tracing_subscriber::registry()
        .with(filter)
        .with(console_layer)
        .with(file_layer)
        .try_init()
        .context("failed to install tracing subscriber")?;

    Ok(TelemetryGuard { file })
}

fn open_log_file(dir: &std::path::Path) -> Result<File> {
    std::fs::create_dir_all(dir)
        .with_context(|| format!("failed to create log dir: {}", dir.display()))?;
    let today = chrono::Utc::now().format("%Y-%m-%d");
    let path = dir.join(format!("tether-{today}.jsonl"));
    std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&path)
        .with_context(|| format!("failed to open log file: {}", path.display()))
}

pub struct TelemetryGuard {
    file: Option<Arc<File>>,
}

impl Drop for TelemetryGuard {
    fn drop(&mut self) {
        if let Some(file) = &self.file
            && let Err(e) = file.sync_all()
        {
            eprintln!("failed to sync log file: {e}");
        }
    }
}
