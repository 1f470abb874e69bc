//! Name -> constructor registry for recommendation algorithms
//!
//! The registry is an ordinary value: build it once with
//! [`AlgorithmRegistry::with_builtins`] (or register custom algorithms on an
//! empty one) and pass it by reference to whoever needs to instantiate
//! algorithms. It is `Send + Sync` and only read after construction.

use crate::algorithm::RecommendationAlgorithm;
use crate::error::{Error, Result};
use crate::hyperparameters::Hyperparameters;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use tracing::debug;

/// Builds an algorithm from fully merged hyperparameters
pub type Constructor =
    Arc<dyn Fn(&Hyperparameters) -> Result<Box<dyn RecommendationAlgorithm>> + Send + Sync>;

#[derive(Clone)]
struct Entry {
    defaults: Hyperparameters,
    constructor: Constructor,
}

#[derive(Clone, Default)]
pub struct AlgorithmRegistry {
    entries: BTreeMap<String, Entry>,
}

impl fmt::Debug for AlgorithmRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AlgorithmRegistry")
            .field("algorithms", &self.entries.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl AlgorithmRegistry {
    /// An empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry holding every built-in algorithm
    pub fn with_builtins() -> Result<Self> {
        let mut registry = Self::new();
        crate::algorithms::register_builtins(&mut registry)?;
        Ok(registry)
    }

    /// Add `name` with its default hyperparameters
    ///
    /// # Errors
    ///
    /// `DuplicateAlgorithm` if `name` is already taken; the registry is left
    /// unchanged.
    pub fn register<F>(&mut self, name: &str, defaults: Hyperparameters, constructor: F) -> Result<()>
    where
        F: Fn(&Hyperparameters) -> Result<Box<dyn RecommendationAlgorithm>> + Send + Sync + 'static,
    {
        if self.entries.contains_key(name) {
            return Err(Error::DuplicateAlgorithm(name.to_string()));
        }
        self.entries.insert(
            name.to_string(),
            Entry {
                defaults,
                constructor: Arc::new(constructor),
            },
        );
        debug!(algorithm = %name, "Registered algorithm");
        Ok(())
    }

    /// Construct `name` with its defaults overlaid by `overrides`
    pub fn instantiate(
        &self,
        name: &str,
        overrides: &Hyperparameters,
    ) -> Result<Box<dyn RecommendationAlgorithm>> {
        let entry = self
            .entries
            .get(name)
            .ok_or_else(|| Error::UnknownAlgorithm(name.to_string()))?;
        let params = entry.defaults.merged(overrides);
        (entry.constructor)(&params)
    }

    /// Construct `name` with its default hyperparameters
    pub fn instantiate_default(&self, name: &str) -> Result<Box<dyn RecommendationAlgorithm>> {
        self.instantiate(name, &Hyperparameters::new())
    }

    /// Registered names, sorted
    pub fn list_available(&self) -> Vec<String> {
        self.entries.keys().cloned().collect()
    }

    pub fn defaults(&self, name: &str) -> Option<&Hyperparameters> {
        self.entries.get(name).map(|e| &e.defaults)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::algorithms::Zero;

    fn zero_constructor(_: &Hyperparameters) -> Result<Box<dyn RecommendationAlgorithm>> {
        Ok(Box::new(Zero::new()))
    }

    #[test]
    fn test_register_and_instantiate() {
        let mut registry = AlgorithmRegistry::new();
        assert!(registry.is_empty());
        registry
            .register("baseline", Hyperparameters::new(), zero_constructor)
            .unwrap();

        assert!(registry.contains("baseline"));
        let algorithm = registry.instantiate_default("baseline").unwrap();
        assert_eq!(algorithm.shortname(), "zero");
    }

    #[test]
    fn test_duplicate_registration_rejected_without_side_effects() {
        let mut registry = AlgorithmRegistry::new();
        let defaults = Hyperparameters::new().with("nb_components", 3usize);
        registry
            .register("baseline", defaults.clone(), zero_constructor)
            .unwrap();

        let result = registry.register(
            "baseline",
            Hyperparameters::new().with("nb_components", 99usize),
            zero_constructor,
        );
        assert!(matches!(result, Err(Error::DuplicateAlgorithm(name)) if name == "baseline"));
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.defaults("baseline"), Some(&defaults));
    }

    #[test]
    fn test_unknown_algorithm() {
        let registry = AlgorithmRegistry::new();
        assert!(matches!(
            registry.instantiate_default("__not_a_real_algorithm__"),
            Err(Error::UnknownAlgorithm(_))
        ));
    }

    #[test]
    fn test_overrides_merged_into_defaults() {
        let registry = AlgorithmRegistry::with_builtins().unwrap();
        let als = registry
            .instantiate("als", &Hyperparameters::new().with("nb_components", 7usize))
            .unwrap();
        assert_eq!(als.shortname(), "als-7");
        let params = als.hyperparameters();
        assert_eq!(params.get_usize("nb_components", 0).unwrap(), 7);
        assert_eq!(params.get_f64("lambda", 0.0).unwrap(), 0.1);

        let bad = Hyperparameters::new().with("nb_components", "many");
        assert!(matches!(
            registry.instantiate("als", &bad),
            Err(Error::InvalidHyperparameter { .. })
        ));
    }

    #[test]
    fn test_registry_is_send_and_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<AlgorithmRegistry>();
    }
}
