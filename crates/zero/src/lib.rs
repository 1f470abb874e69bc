//! # Zero
//!
//! Interchangeable collaborative-filtering algorithms behind one contract.
//!
//! Every algorithm implements [`RecommendationAlgorithm`]: fit on
//! [`AnonymizedData`], predict ratings for `(user, item)` pairs, evaluate with
//! [`compute_metrics`], and (for most of them) save and reload fitted state as
//! versioned snapshots.
//!
//! ```no_run
//! use zero::{AlgorithmRegistry, Dataset, Hyperparameters, Metric, RecommendationAlgorithm};
//!
//! # fn example() -> zero::Result<()> {
//! let registry = AlgorithmRegistry::with_builtins()?;
//! let mut dataset = Dataset::new();
//! let data = dataset.load_csv("ratings.csv")?;
//!
//! let mut als = registry.instantiate("als", &Hyperparameters::new().with("nb_components", 10usize))?;
//! als.fit(data)?;
//! let predictions = als.predict(&data.pairs())?;
//! let y_true = data.y().to_vec();
//! let report = als.compute_metrics(&[Metric::Rmse], &y_true, &predictions, None)?;
//! println!("{:?}", report);
//! # Ok(())
//! # }
//! ```

pub mod algorithm;
pub mod algorithms;
pub mod dataset;
pub mod error;
pub mod experiment;
pub mod hyperparameters;
pub mod linalg;
pub mod metrics;
pub mod registry;
pub mod snapshot;

pub use algorithm::{CancelToken, Recommendation, RecommendationAlgorithm, SingleUserModel};
pub use dataset::{AnonymizedData, Dataset, Split};
pub use error::{Error, Result};
pub use experiment::{Experiment, ExperimentConfig, ExperimentReport};
pub use hyperparameters::{HyperValue, Hyperparameters};
pub use metrics::{compute_metrics, Metric, MetricsReport};
pub use registry::AlgorithmRegistry;
pub use snapshot::{ModelState, SnapshotHeader, SnapshotStore};
