//! Alternating Least Squares matrix factorization
//!
//! Ratings are centered on each user's mean, then user and item factors are
//! solved alternately as regularized least-squares problems:
//! `(V_u^T V_u + lambda * n_u * I) x_u = V_u^T r_u`, and symmetrically for
//! items. Users and works without ratings keep zero factors, so their
//! predictions fall back to the user mean.

use super::{center_by_user, random_matrix, shortname_with};
use crate::algorithm::{
    check_pairs, check_single_user, check_works, CancelToken, RecommendationAlgorithm,
    SingleUserModel,
};
use crate::dataset::AnonymizedData;
use crate::error::{Error, Result};
use crate::hyperparameters::{require_positive, Hyperparameters};
use crate::linalg::ridge_solve;
use crate::snapshot::{stored_vector, wrong_state, ModelState, StoredMatrix};
use ndarray::{Array1, Array2, Axis};
use rand::rngs::StdRng;
use rand::SeedableRng;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use zero_core::observability::fit_span;

pub const NAME: &str = "als";

/// ALS configuration parameters
#[derive(Debug, Clone, PartialEq)]
pub struct AlsConfig {
    /// Number of latent factors
    pub nb_components: usize,
    pub nb_iterations: usize,
    /// Regularization, scaled by the number of ratings of each row
    pub lambda: f64,
    pub seed: u64,
}

impl Default for AlsConfig {
    fn default() -> Self {
        Self {
            nb_components: 20,
            nb_iterations: 40,
            lambda: 0.1,
            seed: 42,
        }
    }
}

impl AlsConfig {
    pub fn from_hyperparameters(params: &Hyperparameters) -> Result<Self> {
        let defaults = Self::default();
        let config = Self {
            nb_components: params.get_usize("nb_components", defaults.nb_components)?,
            nb_iterations: params.get_usize("nb_iterations", defaults.nb_iterations)?,
            lambda: params.get_f64("lambda", defaults.lambda)?,
            seed: params.get_u64("seed", defaults.seed)?,
        };
        require_positive("nb_components", config.nb_components as f64)?;
        require_positive("lambda", config.lambda)?;
        Ok(config)
    }

    pub fn to_hyperparameters(&self) -> Hyperparameters {
        Hyperparameters::new()
            .with("nb_components", self.nb_components)
            .with("nb_iterations", self.nb_iterations)
            .with("lambda", self.lambda)
            .with("seed", self.seed)
    }
}

/// Persisted ALS factors
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlsState {
    pub user_factors: StoredMatrix,
    pub item_factors: StoredMatrix,
    pub user_means: Vec<f64>,
}

#[derive(Debug, Clone)]
struct Factors {
    /// [nb_users x nb_components]
    users: Array2<f64>,
    /// [nb_works x nb_components]
    items: Array2<f64>,
    user_means: Array1<f64>,
}

/// Parameters of a user folded into a trained ALS model
#[derive(Debug, Clone, PartialEq)]
pub struct AlsUserParams {
    pub mean: f64,
    pub factors: Array1<f64>,
}

#[derive(Debug, Clone)]
pub struct Als {
    config: AlsConfig,
    fitted: Option<Factors>,
}

impl Als {
    pub fn new(config: AlsConfig) -> Self {
        Self {
            config,
            fitted: None,
        }
    }

    pub fn from_hyperparameters(params: &Hyperparameters) -> Result<Self> {
        Ok(Self::new(AlsConfig::from_hyperparameters(params)?))
    }

    pub fn config(&self) -> &AlsConfig {
        &self.config
    }

    /// Fitted `[nb_users x nb_components]` user factors
    pub fn user_factors(&self) -> Option<&Array2<f64>> {
        self.fitted.as_ref().map(|f| &f.users)
    }

    /// Fitted `[nb_works x nb_components]` item factors
    pub fn item_factors(&self) -> Option<&Array2<f64>> {
        self.fitted.as_ref().map(|f| &f.items)
    }

    fn factors(&self) -> Result<&Factors> {
        self.fitted
            .as_ref()
            .ok_or_else(|| Error::NotFitted(self.shortname()))
    }

    fn train(&self, data: &AnonymizedData, cancel: &CancelToken) -> Result<Factors> {
        let k = self.config.nb_components;
        let lambda = self.config.lambda;
        let (user_means, by_user) = center_by_user(data)?;

        let mut by_work: Vec<Vec<(usize, f64)>> = vec![Vec::new(); data.nb_works()];
        for (user, ratings) in by_user.iter().enumerate() {
            for &(item, residual) in ratings {
                by_work[item].push((user, residual));
            }
        }

        let mut rng = StdRng::seed_from_u64(self.config.seed);
        let mut items = random_matrix(data.nb_works(), k, 0.1, &mut rng);
        let mut users = Array2::<f64>::zeros((data.nb_users(), k));

        for iteration in 0..self.config.nb_iterations {
            cancel.check()?;
            users = solve_side(&by_user, &items, lambda)?;
            items = solve_side(&by_work, &users, lambda)?;

            debug!(
                algorithm = NAME,
                iteration = iteration,
                rmse = residual_rmse(&by_user, &users, &items),
                "ALS iteration"
            );
        }

        Ok(Factors {
            users,
            items,
            user_means,
        })
    }
}

/// Solve every row of one side against the fixed factors of the other side
fn solve_side(
    rows: &[Vec<(usize, f64)>],
    fixed: &Array2<f64>,
    lambda: f64,
) -> Result<Array2<f64>> {
    let k = fixed.ncols();
    let solved: Vec<Array1<f64>> = rows
        .par_iter()
        .map(|entries| {
            if entries.is_empty() {
                return Ok(Array1::zeros(k));
            }
            let indices: Vec<usize> = entries.iter().map(|&(j, _)| j).collect();
            let targets = Array1::from_iter(entries.iter().map(|&(_, r)| r));
            let sub = fixed.select(Axis(0), &indices);
            ridge_solve(&sub, &targets, lambda * entries.len() as f64)
        })
        .collect::<Result<_>>()?;

    let mut out = Array2::<f64>::zeros((rows.len(), k));
    for (mut row, x) in out.axis_iter_mut(Axis(0)).zip(solved) {
        row.assign(&x);
    }
    Ok(out)
}

fn residual_rmse(by_user: &[Vec<(usize, f64)>], users: &Array2<f64>, items: &Array2<f64>) -> f64 {
    let mut sum = 0.0;
    let mut count = 0usize;
    for (user, entries) in by_user.iter().enumerate() {
        for &(item, residual) in entries {
            let err = residual - users.row(user).dot(&items.row(item));
            sum += err * err;
            count += 1;
        }
    }
    if count == 0 {
        0.0
    } else {
        (sum / count as f64).sqrt()
    }
}

impl RecommendationAlgorithm for Als {
    fn name(&self) -> &'static str {
        NAME
    }

    fn shortname(&self) -> String {
        shortname_with(NAME, self.config.nb_components)
    }

    fn hyperparameters(&self) -> Hyperparameters {
        self.config.to_hyperparameters()
    }

    fn nb_components(&self) -> Option<usize> {
        Some(self.config.nb_components)
    }

    fn dimensions(&self) -> Option<(usize, usize)> {
        self.fitted
            .as_ref()
            .map(|f| (f.users.nrows(), f.items.nrows()))
    }

    fn fit_with_cancel(&mut self, data: &AnonymizedData, cancel: &CancelToken) -> Result<()> {
        self.fitted = None;
        let span = fit_span(&self.shortname(), data.nb_users(), data.nb_works());
        let _guard = span.enter();
        info!(nb_ratings = data.len(), "Fitting ALS");

        let factors = self.train(data, cancel)?;
        self.fitted = Some(factors);
        info!("ALS fit complete");
        Ok(())
    }

    fn predict(&self, pairs: &[(usize, usize)]) -> Result<Vec<f64>> {
        let f = self.factors()?;
        check_pairs(pairs, f.users.nrows(), f.items.nrows())?;
        Ok(pairs
            .iter()
            .map(|&(u, i)| f.user_means[u] + f.users.row(u).dot(&f.items.row(i)))
            .collect())
    }

    fn is_serializable(&self) -> bool {
        true
    }

    fn export_state(&self) -> Result<ModelState> {
        let f = self.factors()?;
        Ok(ModelState::Als(AlsState {
            user_factors: StoredMatrix::from_array(&f.users),
            item_factors: StoredMatrix::from_array(&f.items),
            user_means: f.user_means.to_vec(),
        }))
    }

    fn restore_state(&mut self, state: ModelState) -> Result<()> {
        let state = match state {
            ModelState::Als(state) => state,
            other => return Err(wrong_state(NAME, &other)),
        };
        let k = self.config.nb_components;
        let nb_users = state.user_means.len();
        let nb_works = state.item_factors.rows;
        self.fitted = Some(Factors {
            users: state.user_factors.into_array_shaped(nb_users, k)?,
            items: state.item_factors.into_array_shaped(nb_works, k)?,
            user_means: stored_vector(state.user_means, nb_users)?,
        });
        Ok(())
    }
}

impl SingleUserModel for Als {
    type UserParams = AlsUserParams;

    fn fit_single_user(&self, rated_works: &[usize], ratings: &[f64]) -> Result<AlsUserParams> {
        let f = self.factors()?;
        check_single_user(rated_works, ratings, f.items.nrows())?;

        let mean = ratings.iter().sum::<f64>() / ratings.len() as f64;
        let targets = Array1::from_iter(ratings.iter().map(|r| r - mean));
        let sub = f.items.select(Axis(0), rated_works);
        let factors = ridge_solve(&sub, &targets, self.config.lambda * ratings.len() as f64)?;
        Ok(AlsUserParams { mean, factors })
    }

    fn predict_single_user(&self, work_ids: &[usize], params: &AlsUserParams) -> Result<Vec<f64>> {
        let f = self.factors()?;
        check_works(work_ids, f.items.nrows())?;
        if params.factors.len() != f.items.ncols() {
            return Err(Error::DimensionMismatch {
                expected: format!("{} user factors", f.items.ncols()),
                actual: format!("{} user factors", params.factors.len()),
            });
        }
        Ok(work_ids
            .iter()
            .map(|&i| params.mean + params.factors.dot(&f.items.row(i)))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::rmse;

    fn block_ratings() -> AnonymizedData {
        // Two taste groups with opposite preferences on two item groups.
        let mut triplets = Vec::new();
        for user in 0..6 {
            for item in 0..6 {
                if (user + item) % 5 == 0 {
                    continue;
                }
                let likes = (user < 3) == (item < 3);
                triplets.push((user, item, if likes { 5.0 } else { 1.0 }));
            }
        }
        AnonymizedData::from_triplets(&triplets, 6, 6).unwrap()
    }

    fn small_als() -> Als {
        Als::new(AlsConfig {
            nb_components: 2,
            nb_iterations: 15,
            lambda: 0.01,
            seed: 7,
        })
    }

    #[test]
    fn test_fit_reduces_error_below_mean_baseline() {
        let data = block_ratings();
        let mut als = small_als();
        als.fit(&data).unwrap();

        let predictions = als.predict(&data.pairs()).unwrap();
        let y = data.y().to_vec();
        let mean = data.global_mean().unwrap();
        let baseline = rmse(&y, &vec![mean; y.len()]);
        assert!(rmse(&y, &predictions) < baseline / 2.0);
        assert_eq!(als.dimensions(), Some((6, 6)));
    }

    #[test]
    fn test_seeded_fit_is_deterministic() {
        let data = block_ratings();
        let mut a = small_als();
        let mut b = small_als();
        a.fit(&data).unwrap();
        b.fit(&data).unwrap();
        assert_eq!(a.predict(&data.pairs()).unwrap(), b.predict(&data.pairs()).unwrap());
    }

    #[test]
    fn test_shortname_and_hyperparameters() {
        let params = Hyperparameters::new().with("nb_components", 8usize);
        let als = Als::from_hyperparameters(&params).unwrap();
        assert_eq!(als.shortname(), "als-8");
        assert_eq!(als.hyperparameters().get_usize("nb_components", 0).unwrap(), 8);
        assert_eq!(als.config().nb_iterations, 40);

        let bad = Hyperparameters::new().with("lambda", -1.0);
        assert!(matches!(
            Als::from_hyperparameters(&bad),
            Err(Error::InvalidHyperparameter { .. })
        ));
    }

    #[test]
    fn test_cancelled_fit_leaves_instance_unfitted() {
        let data = block_ratings();
        let mut als = small_als();
        als.fit(&data).unwrap();

        let token = CancelToken::new();
        token.cancel();
        assert!(matches!(
            als.fit_with_cancel(&data, &token),
            Err(Error::Cancelled)
        ));
        assert!(matches!(als.predict(&[(0, 0)]), Err(Error::NotFitted(_))));
    }

    #[test]
    fn test_fold_in_user_matches_group() {
        let data = block_ratings();
        let mut als = small_als();
        als.fit(&data).unwrap();

        // Likes the first item group, dislikes the second.
        let params = als
            .fit_single_user(&[0, 1, 3, 4], &[5.0, 5.0, 1.0, 1.0])
            .unwrap();
        let predicted = als.predict_single_user(&[2, 5], &params).unwrap();
        assert!(predicted[0] > predicted[1]);

        assert!(als.fit_single_user(&[0], &[]).is_err());
        assert!(als.predict_single_user(&[6], &params).is_err());
    }

    #[test]
    fn test_unrated_user_predicts_zero_offset() {
        let data = AnonymizedData::from_triplets(&[(0, 0, 4.0), (0, 1, 2.0)], 2, 2).unwrap();
        let mut als = small_als();
        als.fit(&data).unwrap();

        let global = data.global_mean().unwrap();
        let predicted = als.predict(&[(1, 0)]).unwrap();
        assert!((predicted[0] - global).abs() < 1e-12);
    }
}
