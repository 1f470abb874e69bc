//! # Zero Core
//!
//! Ambient building blocks shared by the Zero recommendation crates.
//!
//! ## Modules
//!
//! - `config`: Configuration loading and validation
//! - `error`: Error type for the core utilities
//! - `math`: Mean and variance
//! - `observability`: Structured logging initialization and spans

pub mod config;
pub mod error;
pub mod math;
pub mod observability;

pub use config::{load_dotenv, ConfigLoader, ZeroConfig};
pub use error::CoreError;
pub use math::{mean, variance};
pub use observability::{fit_span, init_logging, snapshot_span, LogConfig, LogFormat};

/// Result type alias for core operations
pub type Result<T> = std::result::Result<T, CoreError>;
