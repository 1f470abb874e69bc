//! Built-in recommendation algorithms
//!
//! - `zero`: global mean baseline
//! - `als`: alternating least squares
//! - `svd` / `pca`: truncated SVD of the user- or work-centered matrix
//! - `sgd`: biased matrix factorization trained by SGD
//! - `sgd2`: factorization machine over one-hot user and work features
//! - `knn`: user-based nearest neighbors
//! - `svdknn`: SVD embeddings averaged over nearest neighbors
//! - `nmf`: non-negative matrix factorization
//! - `lasso`: per-user Lasso over item side information
//! - `gbr`: gradient boosted regression trees

pub mod als;
pub mod gbr;
pub mod knn;
pub mod lasso;
pub mod nmf;
pub mod sgd;
pub mod sgd2;
pub mod svd;
pub mod svdknn;
pub mod zero;

use crate::algorithm::RecommendationAlgorithm;
use crate::dataset::AnonymizedData;
use crate::error::{Error, Result};
use crate::hyperparameters::Hyperparameters;
use crate::registry::AlgorithmRegistry;
use ndarray::{Array1, Array2};
use rand::rngs::StdRng;
use rand::Rng;

pub use als::{Als, AlsConfig};
pub use gbr::{Gbr, GbrConfig};
pub use knn::{Knn, KnnConfig};
pub use lasso::{Lasso, LassoConfig};
pub use nmf::{Nmf, NmfConfig};
pub use sgd::{Sgd, SgdConfig};
pub use sgd2::{Sgd2, Sgd2Config};
pub use svd::{Centering, Svd, SvdConfig};
pub use svdknn::{SvdKnn, SvdKnnConfig};
pub use zero::Zero;

fn boxed<A: RecommendationAlgorithm + 'static>(
    algorithm: Result<A>,
) -> Result<Box<dyn RecommendationAlgorithm>> {
    algorithm.map(|a| Box::new(a) as Box<dyn RecommendationAlgorithm>)
}

/// Register every built-in algorithm under its registry name
pub fn register_builtins(registry: &mut AlgorithmRegistry) -> Result<()> {
    registry.register(zero::NAME, Hyperparameters::new(), |params| {
        boxed(Zero::from_hyperparameters(params))
    })?;
    registry.register(als::NAME, AlsConfig::default().to_hyperparameters(), |params| {
        boxed(Als::from_hyperparameters(params))
    })?;
    registry.register(svd::SVD_NAME, SvdConfig::default().to_hyperparameters(), |params| {
        boxed(Svd::from_hyperparameters(params))
    })?;
    registry.register(svd::PCA_NAME, SvdConfig::default().to_hyperparameters(), |params| {
        boxed(Svd::pca_from_hyperparameters(params))
    })?;
    registry.register(sgd::NAME, SgdConfig::default().to_hyperparameters(), |params| {
        boxed(Sgd::from_hyperparameters(params))
    })?;
    registry.register(sgd2::NAME, Sgd2Config::default().to_hyperparameters(), |params| {
        boxed(Sgd2::from_hyperparameters(params))
    })?;
    registry.register(knn::NAME, KnnConfig::default().to_hyperparameters(), |params| {
        boxed(Knn::from_hyperparameters(params))
    })?;
    registry.register(svdknn::NAME, SvdKnnConfig::default().to_hyperparameters(), |params| {
        boxed(SvdKnn::from_hyperparameters(params))
    })?;
    registry.register(nmf::NAME, NmfConfig::default().to_hyperparameters(), |params| {
        boxed(Nmf::from_hyperparameters(params))
    })?;
    registry.register(lasso::NAME, LassoConfig::default().to_hyperparameters(), |params| {
        boxed(Lasso::from_hyperparameters(params))
    })?;
    registry.register(gbr::NAME, GbrConfig::default().to_hyperparameters(), |params| {
        boxed(Gbr::from_hyperparameters(params))
    })?;
    Ok(())
}

/// `<name>-<count>`, e.g. `als-20`
pub(crate) fn shortname_with(name: &str, count: usize) -> String {
    format!("{}-{}", name, count)
}

/// Uniform entries in `[-scale, scale)`
pub(crate) fn random_matrix(rows: usize, cols: usize, scale: f64, rng: &mut StdRng) -> Array2<f64> {
    Array2::from_shape_fn((rows, cols), |_| rng.gen_range(-scale..scale))
}

/// User means and user-centered ratings grouped by user
///
/// Users without ratings get the global mean.
pub(crate) fn center_by_user(data: &AnonymizedData) -> Result<(Array1<f64>, Vec<Vec<(usize, f64)>>)> {
    let global = data
        .global_mean()
        .ok_or_else(|| Error::EmptyInput("no ratings to factorize".to_string()))?;
    let mut by_user = data.by_user();
    let means = Array1::from_iter(by_user.iter_mut().map(|entries| {
        if entries.is_empty() {
            return global;
        }
        let mean = entries.iter().map(|&(_, r)| r).sum::<f64>() / entries.len() as f64;
        for entry in entries.iter_mut() {
            entry.1 -= mean;
        }
        mean
    }));
    Ok((means, by_user))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;

    #[test]
    fn test_center_by_user() {
        let data = AnonymizedData::from_triplets(&[(0, 0, 4.0), (0, 1, 2.0), (1, 1, 5.0)], 3, 2)
            .unwrap();
        let (means, centered) = center_by_user(&data).unwrap();

        assert_eq!(means.to_vec(), vec![3.0, 5.0, 11.0 / 3.0]);
        assert_eq!(centered[0], vec![(0, 1.0), (1, -1.0)]);
        assert_eq!(centered[1], vec![(1, 0.0)]);
        assert!(centered[2].is_empty());
    }

    #[test]
    fn test_random_matrix_is_seeded_and_bounded() {
        let a = random_matrix(3, 4, 0.1, &mut StdRng::seed_from_u64(9));
        let b = random_matrix(3, 4, 0.1, &mut StdRng::seed_from_u64(9));
        assert_eq!(a, b);
        assert!(a.iter().all(|v| v.abs() <= 0.1));
    }

    #[test]
    fn test_register_builtins() {
        let mut registry = AlgorithmRegistry::new();
        register_builtins(&mut registry).unwrap();
        assert_eq!(
            registry.list_available(),
            vec![
                "als", "gbr", "knn", "lasso", "nmf", "pca", "sgd", "sgd2", "svd", "svdknn",
                "zero"
            ]
        );
        assert!(matches!(
            register_builtins(&mut registry),
            Err(Error::DuplicateAlgorithm(name)) if name == "zero"
        ));
    }
}
