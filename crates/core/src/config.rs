//! Shared configuration loader for Zero tools
//!
//! Configuration is read from environment variables with the `ZERO_` prefix.
//! A `.env` file in the working directory is honoured through dotenvy.
//!
//! # Example
//!
//! ```no_run
//! use zero_core::config::{load_dotenv, ConfigLoader, ZeroConfig};
//!
//! # fn example() -> Result<(), Box<dyn std::error::Error>> {
//! load_dotenv();
//!
//! let config = ZeroConfig::from_env()?;
//! config.validate()?;
//! # Ok(())
//! # }
//! ```

use crate::error::CoreError;
use crate::observability::LogFormat;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

/// Configuration loader trait
///
/// Provides standardized methods for loading and validating configuration from
/// environment variables.
pub trait ConfigLoader: Sized {
    /// Load configuration from environment variables, falling back to defaults
    /// for anything that is not set.
    ///
    /// # Errors
    ///
    /// Returns a `ConfigurationError` if a variable is set but cannot be parsed.
    fn from_env() -> Result<Self, CoreError>;

    /// Validate configuration values
    ///
    /// # Errors
    ///
    /// Returns a `ConfigurationError` if any validation check fails.
    fn validate(&self) -> Result<(), CoreError>;
}

/// Runtime configuration for the library tooling
///
/// # Environment Variables
///
/// - `ZERO_SNAPSHOT_DIR` (optional): Root folder for model snapshots (default: "snapshots")
/// - `ZERO_LOG_LEVEL` (optional): Log level or filter directives, falls back to `RUST_LOG` (default: "info")
/// - `ZERO_LOG_FORMAT` (optional): "pretty" or "json" (default: "pretty")
/// - `ZERO_RANDOM_SEED` (optional): Seed used by fits and dataset splits (default: 42)
/// - `ZERO_RANKING_CUTOFF` (optional): Default k for DCG/NDCG (default: 100)
///
/// # Example
///
/// ```bash
/// export ZERO_SNAPSHOT_DIR="/var/lib/zero/snapshots"
/// export ZERO_LOG_FORMAT="json"
/// export ZERO_RANDOM_SEED="7"
/// ```
#[derive(Debug, Clone)]
pub struct ZeroConfig {
    /// Root folder for model snapshots
    pub snapshot_dir: PathBuf,
    /// Log level or `EnvFilter` directives, e.g. `info` or `zero=debug,warn`
    pub log_level: String,
    /// Log output format
    pub log_format: LogFormat,
    /// Seed for every randomized step
    pub random_seed: u64,
    /// Default cutoff for ranking metrics
    pub ranking_cutoff: usize,
}

impl Default for ZeroConfig {
    fn default() -> Self {
        Self {
            snapshot_dir: PathBuf::from("snapshots"),
            log_level: "info".to_string(),
            log_format: LogFormat::Pretty,
            random_seed: 42,
            ranking_cutoff: 100,
        }
    }
}

impl ConfigLoader for ZeroConfig {
    fn from_env() -> Result<Self, CoreError> {
        let defaults = ZeroConfig::default();

        let snapshot_dir = std::env::var("ZERO_SNAPSHOT_DIR")
            .map(PathBuf::from)
            .unwrap_or(defaults.snapshot_dir);

        let log_level = std::env::var("ZERO_LOG_LEVEL")
            .or_else(|_| std::env::var("RUST_LOG"))
            .unwrap_or(defaults.log_level);

        let log_format = parse_env_var("ZERO_LOG_FORMAT", defaults.log_format)?;
        let random_seed = parse_env_var("ZERO_RANDOM_SEED", defaults.random_seed)?;
        let ranking_cutoff = parse_env_var("ZERO_RANKING_CUTOFF", defaults.ranking_cutoff)?;

        Ok(Self {
            snapshot_dir,
            log_level,
            log_format,
            random_seed,
            ranking_cutoff,
        })
    }

    fn validate(&self) -> Result<(), CoreError> {
        if self.snapshot_dir.as_os_str().is_empty() {
            return Err(CoreError::config(
                "snapshot_dir must not be empty",
                "ZERO_SNAPSHOT_DIR",
            ));
        }

        if let Err(e) = EnvFilter::try_new(&self.log_level) {
            return Err(CoreError::config(
                format!(
                    "Invalid log_level '{}': {}. Expected a level (trace, debug, info, warn, error) or filter directives such as 'zero=debug'",
                    self.log_level, e
                ),
                "ZERO_LOG_LEVEL",
            ));
        }

        if self.ranking_cutoff == 0 {
            return Err(CoreError::config(
                "ranking_cutoff must be greater than 0",
                "ZERO_RANKING_CUTOFF",
            ));
        }

        Ok(())
    }
}

/// Parse an environment variable, using `default` when it is not set
///
/// # Errors
///
/// Returns a `ConfigurationError` if the value cannot be parsed
fn parse_env_var<T>(key: &str, default: T) -> Result<T, CoreError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    std::env::var(key)
        .ok()
        .map(|v| {
            v.parse::<T>()
                .map_err(|e| CoreError::config(format!("Failed to parse {}: {}", key, e), key))
        })
        .unwrap_or(Ok(default))
}

/// Load .env file if present
///
/// Does not return an error if the .env file is not found.
pub fn load_dotenv() {
    if let Err(e) = dotenvy::dotenv() {
        if !e.not_found() {
            eprintln!("Warning: Failed to load .env file: {}", e);
        }
    }
}
