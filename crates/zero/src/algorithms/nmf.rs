//! Non-negative matrix factorization with multiplicative updates
//!
//! Only observed cells contribute to the objective (masked Lee-Seung updates):
//!
//! `H <- H * (W^T (M*R)) / (W^T (M*(WH)))` and
//! `W <- W * ((M*R) H^T) / ((M*(WH)) H^T)`.

use super::shortname_with;
use crate::algorithm::{check_pairs, CancelToken, RecommendationAlgorithm};
use crate::dataset::AnonymizedData;
use crate::error::{Error, Result};
use crate::hyperparameters::{require_positive, Hyperparameters};
use crate::snapshot::{wrong_state, ModelState, StoredMatrix};
use ndarray::Array2;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use zero_core::observability::fit_span;

pub const NAME: &str = "nmf";

const DENOMINATOR_FLOOR: f64 = 1e-12;

#[derive(Debug, Clone, PartialEq)]
pub struct NmfConfig {
    pub nb_components: usize,
    pub nb_iterations: usize,
    pub seed: u64,
}

impl Default for NmfConfig {
    fn default() -> Self {
        Self {
            nb_components: 10,
            nb_iterations: 200,
            seed: 42,
        }
    }
}

impl NmfConfig {
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

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NmfState {
    /// [nb_users x nb_components]
    pub user_factors: StoredMatrix,
    /// [nb_works x nb_components]
    pub item_factors: StoredMatrix,
}

#[derive(Debug, Clone)]
struct Factors {
    w: Array2<f64>,
    /// Stored transposed: [nb_works x nb_components]
    h_t: Array2<f64>,
}

#[derive(Debug, Clone)]
pub struct Nmf {
    config: NmfConfig,
    fitted: Option<Factors>,
}

impl Nmf {
    pub fn new(config: NmfConfig) -> Self {
        Self {
            config,
            fitted: None,
        }
    }

    pub fn from_hyperparameters(params: &Hyperparameters) -> Result<Self> {
        Ok(Self::new(NmfConfig::from_hyperparameters(params)?))
    }

    fn factors(&self) -> Result<&Factors> {
        self.fitted
            .as_ref()
            .ok_or_else(|| Error::NotFitted(self.shortname()))
    }

    fn train(&self, data: &AnonymizedData, cancel: &CancelToken) -> Result<Factors> {
        if let Some(bad) = data.y().iter().find(|&&r| r < 0.0) {
            return Err(Error::InvalidInput(format!(
                "NMF needs non-negative ratings, found {}",
                bad
            )));
        }
        let mean = data
            .global_mean()
            .ok_or_else(|| Error::EmptyInput("no ratings to factorize".to_string()))?;

        let (nb_users, nb_works) = (data.nb_users(), data.nb_works());
        let k = self.config.nb_components;
        let mut ratings = Array2::<f64>::zeros((nb_users, nb_works));
        let mut mask = Array2::<f64>::zeros((nb_users, nb_works));
        for (user, item, rating) in data.iter() {
            ratings[[user, item]] = rating;
            mask[[user, item]] = 1.0;
        }

        let scale = (mean / k as f64).sqrt();
        let mut rng = StdRng::seed_from_u64(self.config.seed);
        let mut w = Array2::from_shape_fn((nb_users, k), |_| scale * rng.gen_range(0.1..1.0));
        let mut h = Array2::from_shape_fn((k, nb_works), |_| scale * rng.gen_range(0.1..1.0));

        for iteration in 0..self.config.nb_iterations {
            cancel.check()?;

            let approx = &mask * &w.dot(&h);
            let numerator = w.t().dot(&ratings);
            let denominator = w.t().dot(&approx);
            h.zip_mut_with(&(numerator / denominator.mapv(|d| d.max(DENOMINATOR_FLOOR))), |h, f| {
                *h *= f
            });

            let approx = &mask * &w.dot(&h);
            let numerator = ratings.dot(&h.t());
            let denominator = approx.dot(&h.t());
            w.zip_mut_with(&(numerator / denominator.mapv(|d| d.max(DENOMINATOR_FLOOR))), |w, f| {
                *w *= f
            });

            if iteration % 20 == 0 {
                let residual = &mask * &(&ratings - &w.dot(&h));
                let rmse = (residual.mapv(|r| r * r).sum() / data.len() as f64).sqrt();
                debug!(algorithm = NAME, iteration = iteration, rmse = rmse, "NMF iteration");
            }
        }

        Ok(Factors {
            w,
            h_t: h.reversed_axes(),
        })
    }
}

impl RecommendationAlgorithm for Nmf {
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
        self.fitted.as_ref().map(|f| (f.w.nrows(), f.h_t.nrows()))
    }

    fn fit_with_cancel(&mut self, data: &AnonymizedData, cancel: &CancelToken) -> Result<()> {
        self.fitted = None;
        let span = fit_span(&self.shortname(), data.nb_users(), data.nb_works());
        let _guard = span.enter();
        info!(nb_ratings = data.len(), "Fitting NMF");

        let factors = self.train(data, cancel)?;
        self.fitted = Some(factors);
        info!("NMF fit complete");
        Ok(())
    }

    fn predict(&self, pairs: &[(usize, usize)]) -> Result<Vec<f64>> {
        let f = self.factors()?;
        check_pairs(pairs, f.w.nrows(), f.h_t.nrows())?;
        Ok(pairs
            .iter()
            .map(|&(u, i)| f.w.row(u).dot(&f.h_t.row(i)))
            .collect())
    }

    fn is_serializable(&self) -> bool {
        true
    }

    fn export_state(&self) -> Result<ModelState> {
        let f = self.factors()?;
        Ok(ModelState::Nmf(NmfState {
            user_factors: StoredMatrix::from_array(&f.w),
            item_factors: StoredMatrix::from_array(&f.h_t),
        }))
    }

    fn restore_state(&mut self, state: ModelState) -> Result<()> {
        let state = match state {
            ModelState::Nmf(state) => state,
            other => return Err(wrong_state(NAME, &other)),
        };
        let k = self.config.nb_components;
        let (nb_users, nb_works) = (state.user_factors.rows, state.item_factors.rows);
        self.fitted = Some(Factors {
            w: state.user_factors.into_array_shaped(nb_users, k)?,
            h_t: state.item_factors.into_array_shaped(nb_works, k)?,
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::rmse;

    fn ratings() -> AnonymizedData {
        let mut triplets = Vec::new();
        for user in 0..6 {
            for item in 0..5 {
                if (user + 2 * item) % 7 == 3 {
                    continue;
                }
                let rating = ((user % 3) + 1) as f64 * ((item % 2) + 1) as f64;
                triplets.push((user, item, rating));
            }
        }
        AnonymizedData::from_triplets(&triplets, 6, 5).unwrap()
    }

    #[test]
    fn test_factors_stay_non_negative_and_fit() {
        let data = ratings();
        let mut nmf = Nmf::new(NmfConfig {
            nb_components: 2,
            nb_iterations: 500,
            seed: 5,
        });
        nmf.fit(&data).unwrap();

        let f = nmf.factors().unwrap();
        assert!(f.w.iter().chain(f.h_t.iter()).all(|&v| v >= 0.0));

        let y = data.y().to_vec();
        let mean = data.global_mean().unwrap();
        let baseline = rmse(&y, &vec![mean; y.len()]);
        assert!(rmse(&y, &nmf.predict(&data.pairs()).unwrap()) < baseline / 2.0);
        assert_eq!(nmf.shortname(), "nmf-2");
    }

    #[test]
    fn test_negative_ratings_rejected() {
        let data = AnonymizedData::from_triplets(&[(0, 0, -1.0), (0, 1, 2.0)], 1, 2).unwrap();
        let mut nmf = Nmf::new(NmfConfig::default());
        assert!(matches!(nmf.fit(&data), Err(Error::InvalidInput(_))));
    }
}
