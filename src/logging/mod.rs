//! Logging subsystem
//!
//! Structured logging via tracing with JSON (production) and plaintext
//! (development) output formats.
//!
//! # Log Targets
//!
//! Use these consistent target names across the codebase:
//! - `gateway` - request routing and correlation
//! - `ws` - WebSocket event channel
//! - `http` - HTTP server
//! - `plugins` - plugin registry, discovery, transports
//! - `auth` - local authorization server
//! - `config` - configuration loading
//!
//! # Environment Variables
//!
//! - `SWITCHYARD_LOG` - Primary log level/filter (takes precedence)
//! - `RUST_LOG` - Fallback log level/filter

use std::fs::File;
use std::io;
use std::path::PathBuf;
use std::sync::OnceLock;

use tracing::Level;
use tracing_subscriber::fmt::time::UtcTime;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

/// Guard to track if logging has been initialized
static INIT_GUARD: OnceLock<()> = OnceLock::new();

/// Log output format
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    /// JSON format for production (structured logs)
    Json,
    /// Human-readable plaintext for development
    #[default]
    Plaintext,
}

/// Log output destination
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum LogOutput {
    /// Write to stdout
    #[default]
    Stdout,
    /// Write to stderr
    Stderr,
    /// Write to a file at the given path
    File(PathBuf),
}

/// Configuration for the logging subsystem
#[derive(Debug, Clone)]
pub struct LogConfig {
    /// Output format (JSON or plaintext)
    pub format: LogFormat,
    /// Output destination (stdout, stderr, or file)
    pub output: LogOutput,
    /// Default log level when no env filter is set
    pub default_level: Level,
    /// Explicit filter directives. When set, SWITCHYARD_LOG and RUST_LOG
    /// are ignored.
    pub filter: Option<String>,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            format: LogFormat::Plaintext,
            output: LogOutput::Stdout,
            default_level: Level::INFO,
            filter: None,
        }
    }
}

impl LogConfig {
    /// Create a development configuration (plaintext to stdout, debug level)
    pub fn development() -> Self {
        Self {
            format: LogFormat::Plaintext,
            output: LogOutput::Stdout,
            default_level: Level::DEBUG,
            filter: None,
        }
    }

    /// Create a production configuration (JSON to stdout, info level)
    pub fn production() -> Self {
        Self {
            format: LogFormat::Json,
            output: LogOutput::Stdout,
            default_level: Level::INFO,
            filter: None,
        }
    }
}

/// Error type for logging initialization
#[derive(Debug, thiserror::Error)]
pub enum LoggingError {
    #[error("failed to create log file: {0}")]
    FileCreation(#[from] io::Error),
    #[error("failed to parse log filter: {0}")]
    FilterParse(#[from] tracing_subscriber::filter::ParseError),
    #[error("logging already initialized")]
    AlreadyInitialized,
    #[error("failed to initialize subscriber: {0}")]
    TryInit(#[from] tracing_subscriber::util::TryInitError),
}

/// Build an EnvFilter from environment variables or default level.
///
/// Checks SWITCHYARD_LOG first, then RUST_LOG, falling back to the default
/// level.
fn build_env_filter(default_level: Level) -> Result<EnvFilter, LoggingError> {
    if let Ok(filter) = std::env::var("SWITCHYARD_LOG") {
        return Ok(EnvFilter::try_new(filter)?);
    }
    if let Ok(filter) = std::env::var("RUST_LOG") {
        return Ok(EnvFilter::try_new(filter)?);
    }

    let default_filter = format!(
        "{level},gateway={level},ws={level},http={level},plugins={level},auth={level},config={level}",
        level = default_level.as_str().to_lowercase()
    );
    Ok(EnvFilter::try_new(default_filter)?)
}

/// Initialize the logging subsystem with the given configuration.
///
/// This function should be called once at application startup. Subsequent
/// calls return an error.
pub fn init_logging(config: LogConfig) -> Result<(), LoggingError> {
    if INIT_GUARD.set(()).is_err() {
        return Err(LoggingError::AlreadyInitialized);
    }

    let filter = match &config.filter {
        Some(directives) => EnvFilter::try_new(directives)?,
        None => build_env_filter(config.default_level)?,
    };
    let timer = UtcTime::rfc_3339();

    match (&config.format, &config.output) {
        (LogFormat::Json, output) => {
            let layer = tracing_subscriber::fmt::layer()
                .json()
                .with_timer(timer)
                .with_target(true)
                .with_current_span(true)
                .with_span_list(true);
            match output {
                LogOutput::Stdout => tracing_subscriber::registry()
                    .with(layer.with_writer(io::stdout).with_filter(filter))
                    .try_init()?,
                LogOutput::Stderr => tracing_subscriber::registry()
                    .with(layer.with_writer(io::stderr).with_filter(filter))
                    .try_init()?,
                LogOutput::File(path) => {
                    let file = File::create(path)?;
                    tracing_subscriber::registry()
                        .with(layer.with_writer(file).with_filter(filter))
                        .try_init()?
                }
            }
        }
        (LogFormat::Plaintext, output) => {
            let layer = tracing_subscriber::fmt::layer()
                .with_timer(timer)
                .with_target(true)
                .with_thread_ids(false)
                .with_thread_names(false)
                .with_file(false)
                .with_line_number(false);
            match output {
                LogOutput::Stdout => tracing_subscriber::registry()
                    .with(layer.with_writer(io::stdout).with_filter(filter))
                    .try_init()?,
                LogOutput::Stderr => tracing_subscriber::registry()
                    .with(layer.with_writer(io::stderr).with_filter(filter))
                    .try_init()?,
                LogOutput::File(path) => {
                    let file = File::create(path)?;
                    tracing_subscriber::registry()
                        .with(layer.with_writer(file).with_filter(filter))
                        .try_init()?
                }
            }
        }
    }

    Ok(())
}

/// Initialize logging for tests.
///
/// Test-friendly defaults (plaintext, debug level); silently ignores the
/// already-initialized case so any test may call it.
pub fn init_test_logging() {
    if INIT_GUARD.set(()).is_err() {
        return;
    }
    let filter = match build_env_filter(Level::DEBUG) {
        Ok(filter) => filter,
        Err(_) => return,
    };
    let layer = tracing_subscriber::fmt::layer()
        .with_timer(UtcTime::rfc_3339())
        .with_target(true)
        .with_test_writer()
        .with_filter(filter);
    let _ = tracing_subscriber::registry().with(layer).try_init();
}
