//! # Logging Utilities
//!
//! Logging infrastructure for Strand using `tracing`.
//!
//! This module provides structured logging with support for:
//! - Pretty or JSON output
//! - Environment variable configuration
//! - An optional dated log file next to the console output
//!
//! Console output goes to stderr so it never mixes with the debugger's own
//! prompt on stdout.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use strand_utils::init_logging;
//!
//! // Reads RUST_LOG, STRAND_LOG_FORMAT and STRAND_LOG_FILE.
//! let _guard = init_logging().expect("Failed to initialize logging");
//!
//! tracing::info!("Application started");
//! ```
//!
//! ## Environment Variables
//!
//! - `RUST_LOG`: Set log level filter (e.g., `RUST_LOG=debug`, `RUST_LOG=strand_core=trace`)
//! - `STRAND_LOG_FORMAT`: Set output format (`json` or `pretty`, default: `pretty`)
//! - `STRAND_LOG_FILE`: Optional path to log file. The file name gets a
//!   `YYYY-MM-DD-` prefix.
//!
//! ## Examples
//!
//! ```rust,no_run
//! use strand_utils::{LogFormat, LogLevel, init_logging_with_level};
//!
//! let _guard = init_logging_with_level(LogLevel::Debug, LogFormat::Json)
//!     .expect("Failed to initialize logging");
//! ```

use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::{env, io};

use chrono::{NaiveDate, Utc};
use tracing::{Level, Subscriber};
use tracing_appender::non_blocking::{NonBlocking, WorkerGuard};
use tracing_subscriber::fmt::time::ChronoUtc;
use tracing_subscriber::fmt::{self};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer, Registry};

/// Environment variable selecting the output format.
pub const FORMAT_ENV: &str = "STRAND_LOG_FORMAT";
/// Environment variable naming the log file.
pub const FILE_ENV: &str = "STRAND_LOG_FILE";

/// Log output format
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat
{
    /// Pretty-printed, human-readable format (default for development)
    #[default]
    Pretty,
    /// JSON format (default for production)
    Json,
}

impl FromStr for LogFormat
{
    type Err = LoggingError;

    fn from_str(s: &str) -> Result<Self, Self::Err>
    {
        match s.to_lowercase().as_str() {
            "pretty" | "dev" | "development" => Ok(LogFormat::Pretty),
            "json" | "prod" | "production" => Ok(LogFormat::Json),
            _ => Err(LoggingError::InvalidFormat(format!("{s}. Use 'pretty' or 'json'"))),
        }
    }
}

/// Log level
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel
{
    /// Error level
    Error,
    /// Warning level
    Warn,
    /// Info level (default)
    Info,
    /// Debug level
    Debug,
    /// Trace level (most verbose)
    Trace,
}

impl From<LogLevel> for Level
{
    fn from(level: LogLevel) -> Self
    {
        match level {
            LogLevel::Error => Level::ERROR,
            LogLevel::Warn => Level::WARN,
            LogLevel::Info => Level::INFO,
            LogLevel::Debug => Level::DEBUG,
            LogLevel::Trace => Level::TRACE,
        }
    }
}

impl FromStr for LogLevel
{
    type Err = LoggingError;

    fn from_str(s: &str) -> Result<Self, Self::Err>
    {
        match s.to_lowercase().as_str() {
            "error" | "err" => Ok(LogLevel::Error),
            "warn" | "warning" => Ok(LogLevel::Warn),
            "info" => Ok(LogLevel::Info),
            "debug" | "dbg" => Ok(LogLevel::Debug),
            "trace" => Ok(LogLevel::Trace),
            _ => Err(LoggingError::InvalidLevel(format!(
                "{s}. Use 'error', 'warn', 'info', 'debug', or 'trace'"
            ))),
        }
    }
}

/// Everything needed to install the global subscriber.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct LoggingConfig
{
    /// Explicit level. Takes precedence over `RUST_LOG`.
    pub level: Option<LogLevel>,
    pub format: LogFormat,
    /// Log file requested by the user, before the date prefix is applied.
    pub file: Option<PathBuf>,
}

impl LoggingConfig
{
    /// Read `STRAND_LOG_FORMAT` and `STRAND_LOG_FILE`. `RUST_LOG` is read when
    /// the filter is built.
    ///
    /// ## Errors
    ///
    /// [`LoggingError::InvalidFormat`] for an unknown format name.
    pub fn from_env() -> Result<Self, LoggingError>
    {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Same as [`LoggingConfig::from_env`] with a custom variable source.
    ///
    /// ## Errors
    ///
    /// [`LoggingError::InvalidFormat`] for an unknown format name.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, LoggingError>
    {
        let format = match lookup(FORMAT_ENV) {
            Some(raw) if !raw.is_empty() => raw.parse()?,
            _ => LogFormat::default(),
        };
        let file = lookup(FILE_ENV).filter(|raw| !raw.is_empty()).map(PathBuf::from);
        Ok(Self {
            level: None,
            format,
            file,
        })
    }

    #[must_use]
    pub fn with_level(mut self, level: LogLevel) -> Self
    {
        self.level = Some(level);
        self
    }

    #[must_use]
    pub fn with_format(mut self, format: LogFormat) -> Self
    {
        self.format = format;
        self
    }

    #[must_use]
    pub fn with_file(mut self, file: impl Into<PathBuf>) -> Self
    {
        self.file = Some(file.into());
        self
    }
}

/// Initialize logging with default settings
///
/// Reads configuration from environment variables:
/// - `RUST_LOG`: Log level filter (e.g., `debug`, `strand_core=debug`)
/// - `STRAND_LOG_FORMAT`: Output format (`json` or `pretty`, default: `pretty`)
/// - `STRAND_LOG_FILE`: Optional path to log file
///
/// Keep the returned guard alive for as long as the file sink should flush.
///
/// ## Errors
///
/// Returns an error if:
/// - Logging is already initialized
/// - Invalid environment variable values
/// - File logging fails (if `STRAND_LOG_FILE` is set)
pub fn init_logging() -> Result<Option<WorkerGuard>, LoggingError>
{
    init_logging_with(&LoggingConfig::from_env()?)
}

/// Initialize logging with explicit level and format
///
/// ## Errors
///
/// Returns an error if logging is already initialized or file logging fails.
pub fn init_logging_with_level(level: LogLevel, format: LogFormat) -> Result<Option<WorkerGuard>, LoggingError>
{
    let config = LoggingConfig::from_env()?.with_level(level).with_format(format);
    init_logging_with(&config)
}

/// Install the global subscriber described by `config`.
///
/// ## Errors
///
/// Returns an error if logging is already initialized or the log directory
/// cannot be created.
pub fn init_logging_with(config: &LoggingConfig) -> Result<Option<WorkerGuard>, LoggingError>
{
    let filter = build_filter(config.level, env::var("RUST_LOG").ok().as_deref());

    let (file, guard) = match &config.file {
        Some(path) => {
            let (writer, guard) = open_log_file(path, Utc::now().date_naive())?;
            (Some(file_layer(config.format, writer)), Some(guard))
        }
        None => (None, None),
    };

    Registry::default()
        .with(filter)
        .with(console_layer(config.format))
        .with(file)
        .try_init()
        .map_err(|error| LoggingError::InitializationFailed(error.to_string()))?;

    Ok(guard)
}

/// Build the level filter.
///
/// Priority:
/// 1. An explicit level (from the `--log-level` CLI flag)
/// 2. `RUST_LOG`, which allows module-specific filters like `strand_core=trace`
/// 3. INFO
fn build_filter(level: Option<LogLevel>, rust_log: Option<&str>) -> EnvFilter
{
    if let Some(level) = level {
        return EnvFilter::new(Level::from(level).to_string());
    }
    rust_log
        .and_then(|directives| EnvFilter::try_new(directives).ok())
        .unwrap_or_else(|| EnvFilter::new(Level::INFO.to_string()))
}

/// `dir/name` becomes `dir/YYYY-MM-DD-name`.
fn dated_file_name(path: &Path, date: NaiveDate) -> PathBuf
{
    let name = path
        .file_name()
        .map_or_else(|| "strand.log".to_string(), |name| name.to_string_lossy().into_owned());
    path.with_file_name(format!("{}-{name}", date.format("%Y-%m-%d")))
}

fn open_log_file(path: &Path, date: NaiveDate) -> Result<(NonBlocking, WorkerGuard), LoggingError>
{
    let dated = dated_file_name(path, date);
    let directory = dated
        .parent()
        .filter(|parent| !parent.as_os_str().is_empty())
        .map_or_else(|| PathBuf::from("."), Path::to_path_buf);
    std::fs::create_dir_all(&directory)?;

    // The date is already part of the name.
    let appender = tracing_appender::rolling::never(&directory, dated.file_name().unwrap_or_default());
    Ok(tracing_appender::non_blocking(appender))
}

fn console_layer<S>(format: LogFormat) -> Box<dyn Layer<S> + Send + Sync>
where
    S: Subscriber + for<'a> LookupSpan<'a>,
{
    match format {
        LogFormat::Pretty => fmt::layer()
            .with_target(true)
            .with_thread_names(true)
            .with_file(true)
            .with_line_number(true)
            .with_timer(ChronoUtc::rfc_3339())
            .with_ansi(true)
            .with_writer(io::stderr)
            .boxed(),
        LogFormat::Json => fmt::layer()
            .json()
            .with_target(true)
            .with_thread_ids(true)
            .with_thread_names(true)
            .with_file(true)
            .with_line_number(true)
            .with_timer(ChronoUtc::rfc_3339())
            .with_current_span(true)
            .with_span_list(true)
            .with_writer(io::stderr)
            .boxed(),
    }
}

fn file_layer<S>(format: LogFormat, writer: NonBlocking) -> Box<dyn Layer<S> + Send + Sync>
where
    S: Subscriber + for<'a> LookupSpan<'a>,
{
    match format {
        LogFormat::Pretty => fmt::layer()
            .with_writer(writer)
            .with_target(true)
            .with_thread_ids(true)
            .with_thread_names(true)
            .with_file(true)
            .with_line_number(true)
            .with_timer(ChronoUtc::rfc_3339())
            .with_ansi(false) // No ANSI in files
            .boxed(),
        LogFormat::Json => fmt::layer()
            .json()
            .with_writer(writer)
            .with_target(true)
            .with_thread_ids(true)
            .with_thread_names(true)
            .with_file(true)
            .with_line_number(true)
            .with_timer(ChronoUtc::rfc_3339())
            .with_current_span(true)
            .with_span_list(true)
            .boxed(),
    }
}

/// Logging initialization error
#[derive(Debug, thiserror::Error)]
pub enum LoggingError
{
    /// Invalid log format
    #[error("Invalid log format: {0}")]
    InvalidFormat(String),

    /// Invalid log level
    #[error("Invalid log level: {0}")]
    InvalidLevel(String),

    /// Failed to initialize logging
    #[error("Failed to initialize logging: {0}")]
    InitializationFailed(String),

    /// File logging error
    #[error("File logging error: {0}")]
    FileError(#[from] io::Error),
}

#[cfg(test)]
mod tests
{
    use std::collections::HashMap;

    use super::*;

    #[test]
    fn test_log_format_from_str()
    {
        assert_eq!(LogFormat::from_str("pretty").unwrap(), LogFormat::Pretty);
        assert_eq!(LogFormat::from_str("JSON").unwrap(), LogFormat::Json);
        assert_eq!(LogFormat::from_str("dev").unwrap(), LogFormat::Pretty);
        assert_eq!(LogFormat::from_str("prod").unwrap(), LogFormat::Json);
        assert!(matches!(
            LogFormat::from_str("xml"),
            Err(LoggingError::InvalidFormat(_))
        ));
    }

    #[test]
    fn test_log_level_from_str()
    {
        assert_eq!(LogLevel::from_str("error").unwrap(), LogLevel::Error);
        assert_eq!(LogLevel::from_str("warning").unwrap(), LogLevel::Warn);
        assert_eq!(LogLevel::from_str("info").unwrap(), LogLevel::Info);
        assert_eq!(LogLevel::from_str("dbg").unwrap(), LogLevel::Debug);
        assert_eq!(LogLevel::from_str("trace").unwrap(), LogLevel::Trace);
        assert!(matches!(LogLevel::from_str("loud"), Err(LoggingError::InvalidLevel(_))));
    }

    #[test]
    fn test_log_level_to_tracing_level()
    {
        assert_eq!(Level::from(LogLevel::Error), Level::ERROR);
        assert_eq!(Level::from(LogLevel::Warn), Level::WARN);
        assert_eq!(Level::from(LogLevel::Info), Level::INFO);
        assert_eq!(Level::from(LogLevel::Debug), Level::DEBUG);
        assert_eq!(Level::from(LogLevel::Trace), Level::TRACE);
    }

    #[test]
    fn test_config_from_lookup()
    {
        let vars: HashMap<&str, &str> = [(FORMAT_ENV, "json"), (FILE_ENV, "/var/log/strand.log")].into();
        let config = LoggingConfig::from_lookup(|key| vars.get(key).map(ToString::to_string)).unwrap();
        assert_eq!(config.format, LogFormat::Json);
        assert_eq!(config.file, Some(PathBuf::from("/var/log/strand.log")));
        assert_eq!(config.level, None);

        let empty = LoggingConfig::from_lookup(|_| None).unwrap();
        assert_eq!(empty, LoggingConfig::default());

        assert!(LoggingConfig::from_lookup(|key| (key == FORMAT_ENV).then(|| "yaml".to_string())).is_err());
    }

    #[test]
    fn test_dated_file_name()
    {
        let date = NaiveDate::from_ymd_opt(2026, 3, 9).unwrap();
        assert_eq!(
            dated_file_name(Path::new("/tmp/logs/strand.log"), date),
            PathBuf::from("/tmp/logs/2026-03-09-strand.log")
        );
        assert_eq!(
            dated_file_name(Path::new("debug.log"), date),
            PathBuf::from("2026-03-09-debug.log")
        );
    }

    #[test]
    fn test_explicit_level_wins_over_rust_log()
    {
        let filter = build_filter(Some(LogLevel::Trace), Some("warn"));
        assert_eq!(filter.max_level_hint(), Some(tracing::level_filters::LevelFilter::TRACE));

        let filter = build_filter(None, Some("warn"));
        assert_eq!(filter.max_level_hint(), Some(tracing::level_filters::LevelFilter::WARN));

        let filter = build_filter(None, Some("strand_core=loudest"));
        assert_eq!(filter.max_level_hint(), Some(tracing::level_filters::LevelFilter::INFO));
    }
}
