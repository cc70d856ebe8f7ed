//! Structured logging utilities for precis
//!
//! All logs use structured fields so a batch run can be followed step by step.
//!
//! # Log Format Conventions
//!
//! - `service`: The component emitting the event (e.g., "function.run", "remote")
//! - `operation`: The operation being performed (e.g., "restore", "upload")
//! - `status`: The result status ("hit", "miss", "success", "error")
//! - `key`: Cache key (hex-encoded SHA256)
//! - `step` / `filter` / `backend`: identity of the unit involved
//!
//! # Examples
//!
//! ```rust
//! use precis::logging::{operations, services, status};
//! use tracing::info;
//!
//! info!(
//!     service = services::FUNCTION_RUN,
//!     operation = operations::RESTORE,
//!     status = status::HIT,
//!     step = "add_numbers",
//!     "restored from remote storage"
//! );
//! ```

use std::fs::{self, OpenOptions};
use std::path::Path;
use std::sync::Mutex;
use std::{fmt as std_fmt, io};
use tracing::{Event, Subscriber};
use tracing_subscriber::fmt::writer::BoxMakeWriter;
use tracing_subscriber::fmt::{FmtContext, FormatEvent, FormatFields};
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::{
    fmt::{self, format::Writer},
    prelude::*,
    EnvFilter,
};

/// Custom formatter that shows "precis" instead of full module path
struct PrecisFormatter {
    with_ansi: bool,
}

impl<S, N> FormatEvent<S, N> for PrecisFormatter
where
    S: Subscriber + for<'a> LookupSpan<'a>,
    N: for<'a> FormatFields<'a> + 'static,
{
    fn format_event(
        &self,
        ctx: &FmtContext<'_, S, N>,
        mut writer: Writer<'_>,
        event: &Event<'_>,
    ) -> std_fmt::Result {
        let meta = event.metadata();

        write!(
            writer,
            "{} ",
            chrono::Local::now().format("%Y-%m-%dT%H:%M:%S%.6f")
        )?;

        if self.with_ansi {
            let level_style = match *meta.level() {
                tracing::Level::ERROR => "\x1b[31m", // Red
                tracing::Level::WARN => "\x1b[33m",  // Yellow
                tracing::Level::INFO => "\x1b[32m",  // Green
                tracing::Level::DEBUG => "\x1b[34m", // Blue
                tracing::Level::TRACE => "\x1b[35m", // Magenta
            };
            write!(writer, "{}{:5}(precis)\x1b[0m: ", level_style, meta.level())?;
        } else {
            write!(writer, "{:5}(precis): ", meta.level())?;
        }

        ctx.field_format().format_fields(writer.by_ref(), event)?;

        writeln!(writer)
    }
}

/// Log format options
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    /// Human-readable format (default for development)
    Pretty,
    /// Compact format (for CI)
    Compact,
    /// JSON format (for log aggregation systems)
    Json,
}

impl LogFormat {
    /// Parse from environment variable (PRECIS_LOG_FORMAT)
    pub fn from_env() -> Self {
        Self::parse(
            std::env::var("PRECIS_LOG_FORMAT").ok().as_deref(),
            std::env::var("CI").is_ok(),
        )
    }

    fn parse(value: Option<&str>, in_ci: bool) -> Self {
        match value.unwrap_or_default().to_lowercase().as_str() {
            "json" => Self::Json,
            "compact" => Self::Compact,
            "pretty" => Self::Pretty,
            _ if in_ci => Self::Compact,
            _ => Self::Pretty,
        }
    }
}

/// Initialize the global tracing subscriber
///
/// `default_level` applies when `RUST_LOG` is unset (a batch config's
/// `log_level`); otherwise `info`. Events go to stderr, or are appended to
/// `log_file` (without colours) when one is given. Calling this twice is
/// harmless, which keeps tests that build several batches quiet.
///
/// # Environment Variables
///
/// - `RUST_LOG`: Set log level (e.g., "debug", "precis=trace")
/// - `PRECIS_LOG_FORMAT`: Set format ("pretty", "compact", "json")
/// - `CI`: If set, defaults to compact format
pub fn init(default_level: Option<&str>, log_file: Option<&Path>) -> io::Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(default_level.unwrap_or("info")))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    let (writer, with_ansi) = match log_file {
        Some(path) => {
            if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
                fs::create_dir_all(parent)?;
            }
            let file = OpenOptions::new().create(true).append(true).open(path)?;
            (BoxMakeWriter::new(Mutex::new(file)), false)
        }
        None => (BoxMakeWriter::new(io::stderr), true),
    };

    let result = match LogFormat::from_env() {
        LogFormat::Pretty => tracing_subscriber::registry()
            .with(filter)
            .with(
                fmt::layer()
                    .event_format(PrecisFormatter { with_ansi })
                    .with_writer(writer),
            )
            .try_init(),
        LogFormat::Compact => tracing_subscriber::registry()
            .with(filter)
            .with(
                fmt::layer()
                    .event_format(PrecisFormatter { with_ansi: false })
                    .with_writer(writer),
            )
            .try_init(),
        LogFormat::Json => tracing_subscriber::registry()
            .with(filter)
            .with(
                fmt::layer()
                    .with_target(false)
                    .with_file(false)
                    .with_line_number(false)
                    .with_ansi(false)
                    .with_writer(writer)
                    .json(),
            )
            .try_init(),
    };

    if result.is_err() {
        tracing::debug!("tracing subscriber already installed");
    }
    Ok(())
}

/// Service names for consistent logging
pub mod services {
    pub const CACHE_STORE: &str = "cache.store";
    pub const REMOTE: &str = "remote";
    pub const FUNCTION_RUN: &str = "function.run";
    pub const BATCH: &str = "batch";
    pub const PIPELINE: &str = "document.pipeline";
    pub const PROCESS: &str = "process";
}

/// Operation names for consistent logging
pub mod operations {
    pub const PUT: &str = "put";
    pub const LOAD: &str = "load";
    pub const RESOLVE: &str = "resolve";
    pub const RESTORE: &str = "restore";
    pub const EXECUTE: &str = "execute";
    pub const REGISTER: &str = "register";
    pub const UPLOAD: &str = "upload";
    pub const DOWNLOAD: &str = "download";
    pub const CONNECT: &str = "connect";
    pub const RENDER: &str = "render";
    pub const FILTER: &str = "filter";
    pub const PUBLISH: &str = "publish";
    pub const SPAWN: &str = "spawn";
}

/// Status values for consistent logging
pub mod status {
    pub const SUCCESS: &str = "success";
    pub const HIT: &str = "hit";
    pub const MISS: &str = "miss";
    pub const ERROR: &str = "error";
}
