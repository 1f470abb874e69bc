//! Truncated SVD and PCA of the centered rating matrix
//!
//! Both factorize the dense `nb_users x nb_works` matrix of centered ratings
//! (missing cells are zero after centering) with a randomized truncated SVD.
//! `svd` centers every row on the user mean; `pca` centers every column on the
//! work mean.

use super::{center_by_user, shortname_with};
use crate::algorithm::{
    check_pairs, check_single_user, check_works, CancelToken, RecommendationAlgorithm,
    SingleUserModel,
};
use crate::dataset::AnonymizedData;
use crate::error::{Error, Result};
use crate::hyperparameters::{require_positive, Hyperparameters};
use crate::linalg::{ridge_solve, truncated_svd};
use crate::snapshot::{stored_vector, wrong_state, ModelState, StoredMatrix};
use ndarray::{Array1, Array2, Axis};
use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use zero_core::observability::fit_span;

pub const SVD_NAME: &str = "svd";
pub const PCA_NAME: &str = "pca";

/// Ridge term used when folding in a single user
const FOLD_IN_REGULARIZATION: f64 = 1e-6;

/// Which mean is removed before factorizing
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Centering {
    /// Per-user mean (`svd`)
    User,
    /// Per-work mean (`pca`)
    Work,
}

impl Centering {
    fn name(self) -> &'static str {
        match self {
            Centering::User => SVD_NAME,
            Centering::Work => PCA_NAME,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SvdConfig {
    pub nb_components: usize,
    /// Subspace iterations of the randomized solver
    pub nb_iterations: usize,
    pub seed: u64,
}

impl Default for SvdConfig {
    fn default() -> Self {
        Self {
            nb_components: 20,
            nb_iterations: 10,
            seed: 42,
        }
    }
}

impl SvdConfig {
    pub fn from_hyperparameters(params: &Hyperparameters) -> Result<Self> {
        let defaults = Self::default();
        let config = Self {
            nb_components: params.get_usize("nb_components", defaults.nb_components)?,
            nb_iterations: params.get_usize("nb_iterations", defaults.nb_iterations)?,
            seed: params.get_u64("seed", defaults.seed)?,
        };
        require_positive("nb_components", config.nb_components as f64)?;
        Ok(config)
    }

    pub fn to_hyperparameters(&self) -> Hyperparameters {
        Hyperparameters::new()
            .with("nb_components", self.nb_components)
            .with("nb_iterations", self.nb_iterations)
            .with("seed", self.seed)
    }
}

/// Persisted SVD/PCA decomposition
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SvdState {
    pub centering: Centering,
    pub nb_users: usize,
    pub nb_works: usize,
    pub u: StoredMatrix,
    pub sigma: Vec<f64>,
    pub vt: StoredMatrix,
    pub means: Vec<f64>,
}

#[derive(Debug, Clone)]
struct Decomposition {
    /// [nb_users x r], already scaled by sigma
    user_components: Array2<f64>,
    u: Array2<f64>,
    sigma: Array1<f64>,
    /// [r x nb_works]
    vt: Array2<f64>,
    /// User means for `svd`, work means for `pca`
    means: Array1<f64>,
}

impl Decomposition {
    fn new(u: Array2<f64>, sigma: Array1<f64>, vt: Array2<f64>, means: Array1<f64>) -> Self {
        let user_components = &u * &sigma.view().insert_axis(Axis(0));
        Self {
            user_components,
            u,
            sigma,
            vt,
            means,
        }
    }
}

/// Coordinates of a folded-in user in the right singular basis
#[derive(Debug, Clone, PartialEq)]
pub struct SvdUserParams {
    /// User mean for `svd`, zero for `pca`
    pub offset: f64,
    pub coefficients: Array1<f64>,
}

#[derive(Debug, Clone)]
pub struct Svd {
    config: SvdConfig,
    centering: Centering,
    fitted: Option<Decomposition>,
}

impl Svd {
    pub fn new(config: SvdConfig) -> Self {
        Self {
            config,
            centering: Centering::User,
            fitted: None,
        }
    }

    /// Same factorization, centered on work means
    pub fn pca(config: SvdConfig) -> Self {
        Self {
            config,
            centering: Centering::Work,
            fitted: None,
        }
    }

    pub fn from_hyperparameters(params: &Hyperparameters) -> Result<Self> {
        Ok(Self::new(SvdConfig::from_hyperparameters(params)?))
    }

    pub fn pca_from_hyperparameters(params: &Hyperparameters) -> Result<Self> {
        Ok(Self::pca(SvdConfig::from_hyperparameters(params)?))
    }

    pub fn centering(&self) -> Centering {
        self.centering
    }

    /// Singular values of the fitted decomposition, largest first
    pub fn singular_values(&self) -> Option<&Array1<f64>> {
        self.fitted.as_ref().map(|d| &d.sigma)
    }

    fn decomposition(&self) -> Result<&Decomposition> {
        self.fitted
            .as_ref()
            .ok_or_else(|| Error::NotFitted(self.shortname()))
    }

    fn centered_matrix(&self, data: &AnonymizedData) -> Result<(Array2<f64>, Array1<f64>)> {
        let mut matrix = Array2::<f64>::zeros((data.nb_users(), data.nb_works()));
        let means = match self.centering {
            Centering::User => {
                let (means, by_user) = center_by_user(data)?;
                for (user, entries) in by_user.iter().enumerate() {
                    for &(item, residual) in entries {
                        matrix[[user, item]] = residual;
                    }
                }
                means
            }
            Centering::Work => {
                let global = data
                    .global_mean()
                    .ok_or_else(|| Error::EmptyInput("no ratings to factorize".to_string()))?;
                let by_work = data.by_work();
                let means = Array1::from_iter(by_work.iter().map(|entries| {
                    zero_core::math::mean(&entries.iter().map(|&(_, r)| r).collect::<Vec<_>>())
                        .unwrap_or(global)
                }));
                for (item, entries) in by_work.iter().enumerate() {
                    for &(user, rating) in entries {
                        matrix[[user, item]] = rating - means[item];
                    }
                }
                means
            }
        };
        Ok((matrix, means))
    }
}

impl RecommendationAlgorithm for Svd {
    fn name(&self) -> &'static str {
        self.centering.name()
    }

    fn shortname(&self) -> String {
        shortname_with(self.name(), self.config.nb_components)
    }

    fn hyperparameters(&self) -> Hyperparameters {
        self.config.to_hyperparameters()
    }

    fn nb_components(&self) -> Option<usize> {
        Some(self.config.nb_components)
    }

    fn dimensions(&self) -> Option<(usize, usize)> {
        self.fitted.as_ref().map(|d| (d.u.nrows(), d.vt.ncols()))
    }

    fn fit_with_cancel(&mut self, data: &AnonymizedData, cancel: &CancelToken) -> Result<()> {
        self.fitted = None;
        let span = fit_span(&self.shortname(), data.nb_users(), data.nb_works());
        let _guard = span.enter();
        info!(nb_ratings = data.len(), "Fitting truncated SVD");

        cancel.check()?;
        let (matrix, means) = self.centered_matrix(data)?;
        let mut rng = StdRng::seed_from_u64(self.config.seed);
        let svd = truncated_svd(
            &matrix,
            self.config.nb_components,
            self.config.nb_iterations,
            &mut rng,
        )?;
        cancel.check()?;

        debug!(
            rank = svd.sigma.len(),
            leading_singular_value = svd.sigma.first().copied().unwrap_or(0.0),
            "Decomposition computed"
        );
        self.fitted = Some(Decomposition::new(svd.u, svd.sigma, svd.vt, means));
        info!("SVD fit complete");
        Ok(())
    }

    fn predict(&self, pairs: &[(usize, usize)]) -> Result<Vec<f64>> {
        let d = self.decomposition()?;
        check_pairs(pairs, d.u.nrows(), d.vt.ncols())?;
        Ok(pairs
            .iter()
            .map(|&(user, item)| {
                let mean = match self.centering {
                    Centering::User => d.means[user],
                    Centering::Work => d.means[item],
                };
                mean + d.user_components.row(user).dot(&d.vt.column(item))
            })
            .collect())
    }

    fn is_serializable(&self) -> bool {
        true
    }

    fn export_state(&self) -> Result<ModelState> {
        let d = self.decomposition()?;
        Ok(ModelState::Svd(SvdState {
            centering: self.centering,
            nb_users: d.u.nrows(),
            nb_works: d.vt.ncols(),
            u: StoredMatrix::from_array(&d.u),
            sigma: d.sigma.to_vec(),
            vt: StoredMatrix::from_array(&d.vt),
            means: d.means.to_vec(),
        }))
    }

    fn restore_state(&mut self, state: ModelState) -> Result<()> {
        let state = match state {
            ModelState::Svd(state) if state.centering == self.centering => state,
            other => return Err(wrong_state(self.name(), &other)),
        };
        let rank = state.sigma.len();
        if rank > self.config.nb_components {
            return Err(Error::IncompatibleSnapshot(format!(
                "{} singular values for {} components",
                rank, self.config.nb_components
            )));
        }
        let nb_means = match state.centering {
            Centering::User => state.nb_users,
            Centering::Work => state.nb_works,
        };
        let u = state.u.into_array_shaped(state.nb_users, rank)?;
        let vt = state.vt.into_array_shaped(rank, state.nb_works)?;
        let sigma = Array1::from(state.sigma);
        let means = stored_vector(state.means, nb_means)?;
        self.fitted = Some(Decomposition::new(u, sigma, vt, means));
        Ok(())
    }
}

impl SingleUserModel for Svd {
    type UserParams = SvdUserParams;

    /// Least-squares coordinates of the user's centered ratings in the span of
    /// the right singular vectors
    fn fit_single_user(&self, rated_works: &[usize], ratings: &[f64]) -> Result<SvdUserParams> {
        let d = self.decomposition()?;
        check_single_user(rated_works, ratings, d.vt.ncols())?;

        let (offset, targets) = match self.centering {
            Centering::User => {
                let mean = ratings.iter().sum::<f64>() / ratings.len() as f64;
                (mean, Array1::from_iter(ratings.iter().map(|r| r - mean)))
            }
            Centering::Work => (
                0.0,
                Array1::from_iter(
                    rated_works
                        .iter()
                        .zip(ratings)
                        .map(|(&item, r)| r - d.means[item]),
                ),
            ),
        };
        let basis = d.vt.select(Axis(1), rated_works).reversed_axes();
        let coefficients = ridge_solve(&basis, &targets, FOLD_IN_REGULARIZATION)?;
        Ok(SvdUserParams {
            offset,
            coefficients,
        })
    }

    fn predict_single_user(&self, work_ids: &[usize], params: &SvdUserParams) -> Result<Vec<f64>> {
        let d = self.decomposition()?;
        check_works(work_ids, d.vt.ncols())?;
        if params.coefficients.len() != d.vt.nrows() {
            return Err(Error::DimensionMismatch {
                expected: format!("{} coefficients", d.vt.nrows()),
                actual: format!("{} coefficients", params.coefficients.len()),
            });
        }
        Ok(work_ids
            .iter()
            .map(|&item| {
                let base = match self.centering {
                    Centering::User => params.offset,
                    Centering::Work => d.means[item],
                };
                base + params.coefficients.dot(&d.vt.column(item))
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn low_rank_ratings() -> AnonymizedData {
        let mut triplets = Vec::new();
        for user in 0..5 {
            for item in 0..4 {
                let rating = 1.0 + ((user + 2 * item) % 5) as f64;
                triplets.push((user, item, rating));
            }
        }
        AnonymizedData::from_triplets(&triplets, 5, 4).unwrap()
    }

    #[test]
    fn test_full_rank_svd_reproduces_ratings() {
        let data = low_rank_ratings();
        let mut svd = Svd::new(SvdConfig {
            nb_components: 4,
            nb_iterations: 10,
            seed: 3,
        });
        svd.fit(&data).unwrap();

        let predictions = svd.predict(&data.pairs()).unwrap();
        for (p, y) in predictions.iter().zip(data.y().iter()) {
            assert!((p - y).abs() < 1e-6, "{} vs {}", p, y);
        }
    }

    #[test]
    fn test_components_clamped_to_matrix_rank() {
        let data = low_rank_ratings();
        let mut svd = Svd::new(SvdConfig {
            nb_components: 50,
            ..SvdConfig::default()
        });
        svd.fit(&data).unwrap();

        assert_eq!(svd.shortname(), "svd-50");
        assert_eq!(svd.singular_values().unwrap().len(), 4);
        assert_eq!(svd.dimensions(), Some((5, 4)));
    }

    #[test]
    fn test_pca_names_and_centering() {
        let pca = Svd::pca_from_hyperparameters(&Hyperparameters::new().with("nb_components", 3usize))
            .unwrap();
        assert_eq!(pca.name(), "pca");
        assert_eq!(pca.shortname(), "pca-3");
        assert_eq!(pca.centering(), Centering::Work);
    }

    #[test]
    fn test_pca_predicts_work_mean_for_unrated_user() {
        let data = AnonymizedData::from_triplets(
            &[(0, 0, 4.0), (0, 1, 2.0), (1, 0, 2.0), (1, 1, 4.0)],
            3,
            2,
        )
        .unwrap();
        let mut pca = Svd::pca(SvdConfig {
            nb_components: 1,
            ..SvdConfig::default()
        });
        pca.fit(&data).unwrap();

        let predicted = pca.predict(&[(2, 0), (2, 1)]).unwrap();
        assert!((predicted[0] - 3.0).abs() < 1e-9);
        assert!((predicted[1] - 3.0).abs() < 1e-9);
    }

    #[test]
    fn test_fold_in_existing_user_profile() {
        let data = low_rank_ratings();
        let mut svd = Svd::new(SvdConfig {
            nb_components: 4,
            ..SvdConfig::default()
        });
        svd.fit(&data).unwrap();

        let by_user = data.by_user();
        let works: Vec<usize> = by_user[2].iter().map(|&(item, _)| item).collect();
        let ratings: Vec<f64> = by_user[2].iter().map(|&(_, r)| r).collect();
        let params = svd.fit_single_user(&works, &ratings).unwrap();
        let predicted = svd.predict_single_user(&works, &params).unwrap();
        for (p, r) in predicted.iter().zip(&ratings) {
            assert!((p - r).abs() < 1e-3);
        }
    }

    #[test]
    fn test_restore_rejects_other_centering() {
        let data = low_rank_ratings();
        let mut svd = Svd::new(SvdConfig::default());
        svd.fit(&data).unwrap();
        let state = svd.export_state().unwrap();

        let mut pca = Svd::pca(SvdConfig::default());
        assert!(matches!(
            pca.restore_state(state),
            Err(Error::IncompatibleSnapshot(_))
        ));
    }
}
