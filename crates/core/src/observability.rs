//! Structured logging initialization
//!
//! Installs a `tracing-subscriber` registry with an `EnvFilter` and either a
//! human-readable or a JSON formatter. `RUST_LOG` takes precedence over the
//! configured level when it is set.

use crate::config::ZeroConfig;
use crate::error::CoreError;
use std::fmt;
use std::str::FromStr;
use tracing::{span, Level, Span};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Output format of the log subscriber
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Pretty,
    Json,
}

impl FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "pretty" | "text" => Ok(LogFormat::Pretty),
            "json" => Ok(LogFormat::Json),
            other => Err(format!("unknown log format '{}'", other)),
        }
    }
}

impl fmt::Display for LogFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LogFormat::Pretty => write!(f, "pretty"),
            LogFormat::Json => write!(f, "json"),
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone)]
pub struct LogConfig {
    /// Default filter directive when `RUST_LOG` is not set
    pub level: String,
    pub format: LogFormat,
    /// Include the event target (module path) in each line
    pub with_target: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Pretty,
            with_target: true,
        }
    }
}

impl From<&ZeroConfig> for LogConfig {
    fn from(config: &ZeroConfig) -> Self {
        Self {
            level: config.log_level.clone(),
            format: config.log_format,
            with_target: true,
        }
    }
}

/// Install the global log subscriber
///
/// Must be called once at program startup.
///
/// # Errors
///
/// Returns `LoggingInit` if the filter directive is invalid or a global
/// subscriber is already installed.
pub fn init_logging(config: &LogConfig) -> Result<(), CoreError> {
    let env_filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::try_new(&config.level)
            .map_err(|e| CoreError::LoggingInit(format!("invalid filter: {}", e)))?,
    };

    let subscriber = tracing_subscriber::registry().with(env_filter);

    match config.format {
        LogFormat::Json => {
            let fmt_layer = tracing_subscriber::fmt::layer()
                .json()
                .with_target(config.with_target);
            subscriber
                .with(fmt_layer)
                .try_init()
                .map_err(|e| CoreError::LoggingInit(e.to_string()))?;
        }
        LogFormat::Pretty => {
            let fmt_layer = tracing_subscriber::fmt::layer().with_target(config.with_target);
            subscriber
                .with(fmt_layer)
                .try_init()
                .map_err(|e| CoreError::LoggingInit(e.to_string()))?;
        }
    }

    tracing::debug!(level = %config.level, format = %config.format, "Logging initialized");

    Ok(())
}

/// Span covering one fit of one algorithm
///
/// # Example
///
/// ```rust
/// use zero_core::observability::fit_span;
///
/// let span = fit_span("als-20", 943, 1682);
/// let _guard = span.enter();
/// ```
pub fn fit_span(shortname: &str, nb_users: usize, nb_works: usize) -> Span {
    span!(
        Level::INFO,
        "algorithm.fit",
        algorithm = %shortname,
        nb_users = nb_users,
        nb_works = nb_works
    )
}

/// Span covering a snapshot read or write
pub fn snapshot_span(operation: &str, path: &str) -> Span {
    span!(
        Level::DEBUG,
        "snapshot.io",
        snapshot.operation = %operation,
        snapshot.path = %path
    )
}
