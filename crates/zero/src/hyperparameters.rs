//! Hyperparameter bags passed to algorithm constructors
//!
//! Values are kept in a `BTreeMap` so that serialization, and therefore the
//! snapshot signature derived from it, is canonical.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fmt;

const SIGNATURE_LEN: usize = 16;

/// A single hyperparameter value
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum HyperValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
}

impl fmt::Display for HyperValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HyperValue::Bool(b) => write!(f, "{}", b),
            HyperValue::Int(i) => write!(f, "{}", i),
            HyperValue::Float(x) => write!(f, "{}", x),
            HyperValue::Text(s) => write!(f, "{}", s),
        }
    }
}

impl From<bool> for HyperValue {
    fn from(v: bool) -> Self {
        HyperValue::Bool(v)
    }
}

impl From<i64> for HyperValue {
    fn from(v: i64) -> Self {
        HyperValue::Int(v)
    }
}

impl From<usize> for HyperValue {
    fn from(v: usize) -> Self {
        HyperValue::Int(v as i64)
    }
}

impl From<u64> for HyperValue {
    fn from(v: u64) -> Self {
        HyperValue::Int(v as i64)
    }
}

impl From<f64> for HyperValue {
    fn from(v: f64) -> Self {
        HyperValue::Float(v)
    }
}

impl From<&str> for HyperValue {
    fn from(v: &str) -> Self {
        HyperValue::Text(v.to_string())
    }
}

impl From<String> for HyperValue {
    fn from(v: String) -> Self {
        HyperValue::Text(v)
    }
}

/// Named hyperparameters of one algorithm instance
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Hyperparameters(BTreeMap<String, HyperValue>);

impl Hyperparameters {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style insert
    pub fn with(mut self, name: &str, value: impl Into<HyperValue>) -> Self {
        self.set(name, value);
        self
    }

    pub fn set(&mut self, name: &str, value: impl Into<HyperValue>) {
        self.0.insert(name.to_string(), value.into());
    }

    pub fn get(&self, name: &str) -> Option<&HyperValue> {
        self.0.get(name)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &HyperValue)> {
        self.0.iter()
    }

    /// Returns `self` overlaid with `overrides`; overrides win on conflict.
    pub fn merged(&self, overrides: &Hyperparameters) -> Hyperparameters {
        let mut merged = self.clone();
        for (name, value) in overrides.iter() {
            merged.0.insert(name.clone(), value.clone());
        }
        merged
    }

    pub fn get_usize(&self, name: &str, default: usize) -> Result<usize> {
        match self.0.get(name) {
            None => Ok(default),
            Some(HyperValue::Int(i)) if *i >= 0 => Ok(*i as usize),
            Some(other) => Err(Error::invalid_hyperparameter(
                name,
                format!("expected a non-negative integer, got {}", other),
            )),
        }
    }

    pub fn get_u64(&self, name: &str, default: u64) -> Result<u64> {
        self.get_usize(name, default as usize).map(|v| v as u64)
    }

    pub fn get_f64(&self, name: &str, default: f64) -> Result<f64> {
        match self.0.get(name) {
            None => Ok(default),
            Some(HyperValue::Float(x)) => Ok(*x),
            Some(HyperValue::Int(i)) => Ok(*i as f64),
            Some(other) => Err(Error::invalid_hyperparameter(
                name,
                format!("expected a number, got {}", other),
            )),
        }
    }

    pub fn get_bool(&self, name: &str, default: bool) -> Result<bool> {
        match self.0.get(name) {
            None => Ok(default),
            Some(HyperValue::Bool(b)) => Ok(*b),
            Some(other) => Err(Error::invalid_hyperparameter(
                name,
                format!("expected a boolean, got {}", other),
            )),
        }
    }

    /// Short stable digest of the canonical JSON encoding
    pub fn signature(&self) -> String {
        let canonical = serde_json::to_string(&self.0).unwrap_or_default();
        let mut hasher = Sha256::new();
        hasher.update(canonical.as_bytes());
        let mut digest = hex::encode(hasher.finalize());
        digest.truncate(SIGNATURE_LEN);
        digest
    }
}

/// Fail with `InvalidHyperparameter` unless `value > 0`
pub(crate) fn require_positive(name: &str, value: f64) -> Result<()> {
    if value > 0.0 && value.is_finite() {
        Ok(())
    } else {
        Err(Error::invalid_hyperparameter(name, "must be positive"))
    }
}

/// Fail with `InvalidHyperparameter` unless `value >= 0`
pub(crate) fn require_non_negative(name: &str, value: f64) -> Result<()> {
    if value >= 0.0 && value.is_finite() {
        Ok(())
    } else {
        Err(Error::invalid_hyperparameter(name, "must be non-negative"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_typed_getters() {
        let params = Hyperparameters::new()
            .with("nb_components", 10usize)
            .with("lambda", 0.5)
            .with("weighted", true);

        assert_eq!(params.get_usize("nb_components", 20).unwrap(), 10);
        assert_eq!(params.get_usize("missing", 20).unwrap(), 20);
        assert_eq!(params.get_f64("lambda", 0.1).unwrap(), 0.5);
        assert_eq!(params.get_f64("nb_components", 0.0).unwrap(), 10.0);
        assert!(params.get_bool("weighted", false).unwrap());

        assert!(matches!(
            params.get_usize("lambda", 1),
            Err(Error::InvalidHyperparameter { .. })
        ));
        assert!(params.get_bool("lambda", false).is_err());
    }

    #[test]
    fn test_negative_integer_rejected() {
        let params = Hyperparameters::new().with("nb_neighbors", -3i64);
        assert!(params.get_usize("nb_neighbors", 20).is_err());
    }

    #[test]
    fn test_merged_overrides_win() {
        let defaults = Hyperparameters::new()
            .with("nb_components", 20usize)
            .with("lambda", 0.1);
        let overrides = Hyperparameters::new().with("nb_components", 5usize);

        let merged = defaults.merged(&overrides);
        assert_eq!(merged.get_usize("nb_components", 0).unwrap(), 5);
        assert_eq!(merged.get_f64("lambda", 0.0).unwrap(), 0.1);
    }

    #[test]
    fn test_signature_is_order_independent() {
        let a = Hyperparameters::new().with("a", 1usize).with("b", 2.0);
        let b = Hyperparameters::new().with("b", 2.0).with("a", 1usize);
        assert_eq!(a.signature(), b.signature());
        assert_eq!(a.signature().len(), 16);

        let c = Hyperparameters::new().with("a", 2usize).with("b", 2.0);
        assert_ne!(a.signature(), c.signature());
    }

    #[test]
    fn test_deserialize_from_json() {
        let params: Hyperparameters =
            serde_json::from_str(r#"{"nb_components": 10, "lambda_": 0.2, "weighted": false}"#)
                .unwrap();
        assert_eq!(params.get_usize("nb_components", 0).unwrap(), 10);
        assert_eq!(params.get_f64("lambda_", 0.0).unwrap(), 0.2);
        assert!(!params.get_bool("weighted", true).unwrap());
    }
}
