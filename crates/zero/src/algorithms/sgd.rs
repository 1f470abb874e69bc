//! Biased matrix factorization trained by stochastic gradient descent
//!
//! `r_hat(u, i) = mu + b_u + b_i + p_u . q_i`, minimizing squared error with
//! L2 regularization on biases and factors.

use super::{random_matrix, shortname_with};
use crate::algorithm::{check_pairs, CancelToken, RecommendationAlgorithm};
use crate::dataset::AnonymizedData;
use crate::error::{Error, Result};
use crate::hyperparameters::{require_non_negative, require_positive, Hyperparameters};
use crate::snapshot::{stored_vector, wrong_state, ModelState, StoredMatrix};
use ndarray::{Array1, Array2};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use zero_core::observability::fit_span;

pub const NAME: &str = "sgd";

#[derive(Debug, Clone, PartialEq)]
pub struct SgdConfig {
    pub nb_components: usize,
    /// Passes over the training ratings
    pub nb_iterations: usize,
    /// Learning rate
    pub gamma: f64,
    /// L2 regularization
    pub lambda: f64,
    pub seed: u64,
}

impl Default for SgdConfig {
    fn default() -> Self {
        Self {
            nb_components: 20,
            nb_iterations: 20,
            gamma: 0.01,
            lambda: 0.1,
            seed: 42,
        }
    }
}

impl SgdConfig {
    pub fn from_hyperparameters(params: &Hyperparameters) -> Result<Self> {
        let defaults = Self::default();
        let config = Self {
            nb_components: params.get_usize("nb_components", defaults.nb_components)?,
            nb_iterations: params.get_usize("nb_iterations", defaults.nb_iterations)?,
            gamma: params.get_f64("gamma", defaults.gamma)?,
            lambda: params.get_f64("lambda", defaults.lambda)?,
            seed: params.get_u64("seed", defaults.seed)?,
        };
        require_positive("nb_components", config.nb_components as f64)?;
        require_positive("gamma", config.gamma)?;
        require_non_negative("lambda", config.lambda)?;
        Ok(config)
    }

    pub fn to_hyperparameters(&self) -> Hyperparameters {
        Hyperparameters::new()
            .with("nb_components", self.nb_components)
            .with("nb_iterations", self.nb_iterations)
            .with("gamma", self.gamma)
            .with("lambda", self.lambda)
            .with("seed", self.seed)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SgdState {
    pub global_mean: f64,
    pub user_bias: Vec<f64>,
    pub item_bias: Vec<f64>,
    pub user_factors: StoredMatrix,
    pub item_factors: StoredMatrix,
}

#[derive(Debug, Clone)]
struct Model {
    global_mean: f64,
    user_bias: Array1<f64>,
    item_bias: Array1<f64>,
    users: Array2<f64>,
    items: Array2<f64>,
}

impl Model {
    fn predict_one(&self, user: usize, item: usize) -> f64 {
        self.global_mean
            + self.user_bias[user]
            + self.item_bias[item]
            + self.users.row(user).dot(&self.items.row(item))
    }
}

#[derive(Debug, Clone)]
pub struct Sgd {
    config: SgdConfig,
    fitted: Option<Model>,
}

impl Sgd {
    pub fn new(config: SgdConfig) -> Self {
        Self {
            config,
            fitted: None,
        }
    }

    pub fn from_hyperparameters(params: &Hyperparameters) -> Result<Self> {
        Ok(Self::new(SgdConfig::from_hyperparameters(params)?))
    }

    fn model(&self) -> Result<&Model> {
        self.fitted
            .as_ref()
            .ok_or_else(|| Error::NotFitted(self.shortname()))
    }

    fn train(&self, data: &AnonymizedData, cancel: &CancelToken) -> Result<Model> {
        let k = self.config.nb_components;
        let (gamma, lambda) = (self.config.gamma, self.config.lambda);
        let global_mean = data
            .global_mean()
            .ok_or_else(|| Error::EmptyInput("no ratings to factorize".to_string()))?;

        let mut rng = StdRng::seed_from_u64(self.config.seed);
        let mut model = Model {
            global_mean,
            user_bias: Array1::zeros(data.nb_users()),
            item_bias: Array1::zeros(data.nb_works()),
            users: random_matrix(data.nb_users(), k, 0.1, &mut rng),
            items: random_matrix(data.nb_works(), k, 0.1, &mut rng),
        };

        let events: Vec<(usize, usize, f64)> = data.iter().collect();
        let mut order: Vec<usize> = (0..events.len()).collect();

        for epoch in 0..self.config.nb_iterations {
            cancel.check()?;
            order.shuffle(&mut rng);

            let mut squared_error = 0.0;
            for &idx in &order {
                let (u, i, rating) = events[idx];
                let err = rating - model.predict_one(u, i);
                squared_error += err * err;

                model.user_bias[u] += gamma * (err - lambda * model.user_bias[u]);
                model.item_bias[i] += gamma * (err - lambda * model.item_bias[i]);

                let p = model.users.row(u).to_owned();
                let q = model.items.row(i).to_owned();
                model
                    .users
                    .row_mut(u)
                    .scaled_add(gamma, &(&q * err - &p * lambda));
                model
                    .items
                    .row_mut(i)
                    .scaled_add(gamma, &(&p * err - &q * lambda));
            }

            let rmse = (squared_error / events.len() as f64).sqrt();
            if !rmse.is_finite() {
                return Err(Error::NumericalFailure(format!(
                    "SGD diverged at epoch {} (gamma = {})",
                    epoch, gamma
                )));
            }
            debug!(algorithm = NAME, epoch = epoch, rmse = rmse, "SGD epoch");
        }

        Ok(model)
    }
}

impl RecommendationAlgorithm for Sgd {
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
            .map(|m| (m.user_bias.len(), m.item_bias.len()))
    }

    fn fit_with_cancel(&mut self, data: &AnonymizedData, cancel: &CancelToken) -> Result<()> {
        self.fitted = None;
        let span = fit_span(&self.shortname(), data.nb_users(), data.nb_works());
        let _guard = span.enter();
        info!(nb_ratings = data.len(), "Fitting SGD factorization");

        let model = self.train(data, cancel)?;
        self.fitted = Some(model);
        info!("SGD fit complete");
        Ok(())
    }

    fn predict(&self, pairs: &[(usize, usize)]) -> Result<Vec<f64>> {
        let model = self.model()?;
        check_pairs(pairs, model.user_bias.len(), model.item_bias.len())?;
        Ok(pairs.iter().map(|&(u, i)| model.predict_one(u, i)).collect())
    }

    fn is_serializable(&self) -> bool {
        true
    }

    fn export_state(&self) -> Result<ModelState> {
        let model = self.model()?;
        Ok(ModelState::Sgd(SgdState {
            global_mean: model.global_mean,
            user_bias: model.user_bias.to_vec(),
            item_bias: model.item_bias.to_vec(),
            user_factors: StoredMatrix::from_array(&model.users),
            item_factors: StoredMatrix::from_array(&model.items),
        }))
    }

    fn restore_state(&mut self, state: ModelState) -> Result<()> {
        let state = match state {
            ModelState::Sgd(state) => state,
            other => return Err(wrong_state(NAME, &other)),
        };
        let k = self.config.nb_components;
        let (nb_users, nb_works) = (state.user_bias.len(), state.item_bias.len());
        self.fitted = Some(Model {
            global_mean: state.global_mean,
            user_bias: stored_vector(state.user_bias, nb_users)?,
            item_bias: stored_vector(state.item_bias, nb_works)?,
            users: state.user_factors.into_array_shaped(nb_users, k)?,
            items: state.item_factors.into_array_shaped(nb_works, k)?,
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
        for user in 0..8 {
            for item in 0..6 {
                if (user * 7 + item) % 4 == 0 {
                    continue;
                }
                let rating = 1.0 + ((user % 2) * 2 + item % 3) as f64;
                triplets.push((user, item, rating));
            }
        }
        AnonymizedData::from_triplets(&triplets, 8, 6).unwrap()
    }

    #[test]
    fn test_training_error_below_mean_baseline() {
        let data = ratings();
        let mut sgd = Sgd::new(SgdConfig {
            nb_components: 3,
            nb_iterations: 200,
            gamma: 0.02,
            lambda: 0.01,
            seed: 1,
        });
        sgd.fit(&data).unwrap();

        let y = data.y().to_vec();
        let mean = data.global_mean().unwrap();
        let baseline = rmse(&y, &vec![mean; y.len()]);
        let fitted = rmse(&y, &sgd.predict(&data.pairs()).unwrap());
        assert!(fitted < baseline / 2.0, "{} vs baseline {}", fitted, baseline);
    }

    #[test]
    fn test_divergence_reported() {
        let data = ratings();
        let mut sgd = Sgd::new(SgdConfig {
            nb_components: 3,
            nb_iterations: 50,
            gamma: 50.0,
            lambda: 0.0,
            seed: 1,
        });
        assert!(matches!(sgd.fit(&data), Err(Error::NumericalFailure(_))));
        assert!(sgd.dimensions().is_none());
    }

    #[test]
    fn test_config_validation() {
        assert_eq!(Sgd::new(SgdConfig::default()).shortname(), "sgd-20");
        let bad = Hyperparameters::new().with("gamma", 0.0);
        assert!(Sgd::from_hyperparameters(&bad).is_err());
    }
}
