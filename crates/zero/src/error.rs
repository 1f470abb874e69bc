//! Error taxonomy for the recommendation library
//!
//! Every failure is scoped to a single call (fit, predict, load, save,
//! instantiate); nothing here is fatal to the process.

use std::path::PathBuf;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("No algorithm named \"{0}\" in the registry")]
    UnknownAlgorithm(String),

    #[error("An algorithm named \"{0}\" is already registered")]
    DuplicateAlgorithm(String),

    #[error("Algorithm {0} has not been fitted")]
    NotFitted(String),

    #[error("Algorithm {0} does not support snapshots")]
    NotSerializable(String),

    #[error("Snapshot not found: {}", .0.display())]
    SnapshotNotFound(PathBuf),

    #[error("Corrupt snapshot {}: {reason}", .path.display())]
    CorruptSnapshot { path: PathBuf, reason: String },

    #[error("Incompatible snapshot: {0}")]
    IncompatibleSnapshot(String),

    #[error("Malformed dataset at line {line}: {reason}")]
    MalformedDataset { line: usize, reason: String },

    #[error("Unsupported metric: {0}")]
    UnsupportedMetric(String),

    #[error("Invalid hyperparameter {name}: {reason}")]
    InvalidHyperparameter { name: String, reason: String },

    #[error("Index out of range: pair ({user}, {item}) outside {nb_users} users x {nb_works} works")]
    IndexOutOfRange {
        user: usize,
        item: usize,
        nb_users: usize,
        nb_works: usize,
    },

    #[error("Dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: String, actual: String },

    #[error("Empty input: {0}")]
    EmptyInput(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Numerical failure: {0}")]
    NumericalFailure(String),

    #[error("Fit cancelled")]
    Cancelled,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    pub(crate) fn invalid_hyperparameter(name: &str, reason: impl Into<String>) -> Self {
        Error::InvalidHyperparameter {
            name: name.to_string(),
            reason: reason.into(),
        }
    }

    pub(crate) fn malformed(line: usize, reason: impl Into<String>) -> Self {
        Error::MalformedDataset {
            line,
            reason: reason.into(),
        }
    }

    pub(crate) fn corrupt(path: &std::path::Path, reason: impl Into<String>) -> Self {
        Error::CorruptSnapshot {
            path: path.to_path_buf(),
            reason: reason.into(),
        }
    }
}
