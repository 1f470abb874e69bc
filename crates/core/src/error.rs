//! Error type shared by the core utilities

use thiserror::Error;

/// Errors raised while loading configuration or installing the log subscriber
#[derive(Debug, Error)]
pub enum CoreError {
    #[error("Configuration error: {message}")]
    ConfigurationError {
        message: String,
        /// Environment variable that caused the failure, when known
        key: Option<String>,
    },

    #[error("Failed to initialize logging: {0}")]
    LoggingInit(String),
}

impl CoreError {
    pub fn config(message: impl Into<String>, key: &str) -> Self {
        CoreError::ConfigurationError {
            message: message.into(),
            key: Some(key.to_string()),
        }
    }
}
