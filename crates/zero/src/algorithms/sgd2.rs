//! Factorization machine over one-hot user and work features
//!
//! Each rating is a sparse feature row with two active entries: the user at
//! index `u` and the work at index `nb_users + i`. The model is a second-order
//! factorization machine,
//! `y_hat(x) = w0 + sum_f w_f + 1/2 (||sum_f v_f||^2 - sum_f ||v_f||^2)`
//! over the active features `f` of `x`, trained by mini-batch gradient
//! descent on squared error with L2 regularization on the features a batch
//! touches.

use super::{random_matrix, shortname_with};
use crate::algorithm::{check_pairs, CancelToken, RecommendationAlgorithm};
use crate::dataset::AnonymizedData;
use crate::error::{Error, Result};
use crate::hyperparameters::{require_non_negative, require_positive, Hyperparameters};
use ndarray::{Array1, Array2};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use std::collections::HashMap;
use tracing::{debug, info};
use zero_core::observability::fit_span;

pub const NAME: &str = "sgd2";

#[derive(Debug, Clone, PartialEq)]
pub struct Sgd2Config {
    pub nb_components: usize,
    /// Passes over the training ratings
    pub nb_iterations: usize,
    /// Learning rate
    pub gamma: f64,
    /// L2 regularization
    pub lambda: f64,
    /// Mini-batches per pass
    pub batches: usize,
    pub seed: u64,
}

impl Default for Sgd2Config {
    fn default() -> Self {
        Self {
            nb_components: 20,
            nb_iterations: 10,
            gamma: 0.01,
            lambda: 0.1,
            batches: 400,
            seed: 42,
        }
    }
}

impl Sgd2Config {
    pub fn from_hyperparameters(params: &Hyperparameters) -> Result<Self> {
        let defaults = Self::default();
        let config = Self {
            nb_components: params.get_usize("nb_components", defaults.nb_components)?,
            nb_iterations: params.get_usize("nb_iterations", defaults.nb_iterations)?,
            gamma: params.get_f64("gamma", defaults.gamma)?,
            lambda: params.get_f64("lambda", defaults.lambda)?,
            batches: params.get_usize("batches", defaults.batches)?,
            seed: params.get_u64("seed", defaults.seed)?,
        };
        require_positive("nb_components", config.nb_components as f64)?;
        require_positive("gamma", config.gamma)?;
        require_non_negative("lambda", config.lambda)?;
        require_positive("batches", config.batches as f64)?;
        Ok(config)
    }

    pub fn to_hyperparameters(&self) -> Hyperparameters {
        Hyperparameters::new()
            .with("nb_components", self.nb_components)
            .with("nb_iterations", self.nb_iterations)
            .with("gamma", self.gamma)
            .with("lambda", self.lambda)
            .with("batches", self.batches)
            .with("seed", self.seed)
    }
}

#[derive(Debug, Clone)]
struct Machine {
    nb_users: usize,
    bias: f64,
    /// One weight per feature, users first
    weights: Array1<f64>,
    /// `(nb_users + nb_works) x nb_components`
    factors: Array2<f64>,
}

impl Machine {
    fn nb_features(&self) -> usize {
        self.weights.len()
    }

    fn nb_works(&self) -> usize {
        self.nb_features() - self.nb_users
    }

    fn predict_row(&self, active: &[usize]) -> f64 {
        let mut linear = self.bias;
        let mut sum = Array1::<f64>::zeros(self.factors.ncols());
        let mut squares = 0.0;
        for &f in active {
            linear += self.weights[f];
            let v = self.factors.row(f);
            sum += &v;
            squares += v.dot(&v);
        }
        linear + 0.5 * (sum.dot(&sum) - squares)
    }
}

#[derive(Debug, Clone)]
pub struct Sgd2 {
    config: Sgd2Config,
    fitted: Option<Machine>,
}

impl Sgd2 {
    pub fn new(config: Sgd2Config) -> Self {
        Self {
            config,
            fitted: None,
        }
    }

    pub fn from_hyperparameters(params: &Hyperparameters) -> Result<Self> {
        Ok(Self::new(Sgd2Config::from_hyperparameters(params)?))
    }

    fn machine(&self) -> Result<&Machine> {
        self.fitted
            .as_ref()
            .ok_or_else(|| Error::NotFitted(self.shortname()))
    }

    /// Predict arbitrary one-hot rows given as lists of active feature indices
    ///
    /// User `u` is feature `u` and work `i` is feature `nb_users + i`.
    pub fn predict_fm(&self, rows: &[Vec<usize>]) -> Result<Vec<f64>> {
        let machine = self.machine()?;
        let nb_features = machine.nb_features();
        if let Some(&f) = rows.iter().flatten().find(|&&f| f >= nb_features) {
            return Err(Error::InvalidInput(format!(
                "feature {} out of range for {} features",
                f, nb_features
            )));
        }
        Ok(rows.iter().map(|row| machine.predict_row(row)).collect())
    }

    fn train(&self, data: &AnonymizedData, cancel: &CancelToken) -> Result<Machine> {
        let (gamma, lambda) = (self.config.gamma, self.config.lambda);
        let bias = data
            .global_mean()
            .ok_or_else(|| Error::EmptyInput("no ratings to factorize".to_string()))?;
        let nb_features = data.nb_users() + data.nb_works();

        let mut rng = StdRng::seed_from_u64(self.config.seed);
        let mut machine = Machine {
            nb_users: data.nb_users(),
            bias,
            weights: Array1::zeros(nb_features),
            factors: random_matrix(nb_features, self.config.nb_components, 0.1, &mut rng),
        };

        let rows: Vec<([usize; 2], f64)> = data
            .iter()
            .map(|(u, i, rating)| ([u, data.nb_users() + i], rating))
            .collect();
        let batch_size = (rows.len() / self.config.batches).max(1);
        let mut order: Vec<usize> = (0..rows.len()).collect();

        for epoch in 0..self.config.nb_iterations {
            cancel.check()?;
            order.shuffle(&mut rng);

            let mut squared_error = 0.0;
            for batch in order.chunks(batch_size) {
                let scale = 1.0 / batch.len() as f64;
                let mut bias_grad = 0.0;
                let mut weight_grads: HashMap<usize, f64> = HashMap::new();
                let mut factor_grads: HashMap<usize, Array1<f64>> = HashMap::new();

                for &idx in batch {
                    let (active, rating) = &rows[idx];
                    let err = machine.predict_row(active) - rating;
                    squared_error += err * err;
                    bias_grad += err * scale;

                    let sum = active
                        .iter()
                        .fold(Array1::<f64>::zeros(machine.factors.ncols()), |acc, &f| {
                            acc + &machine.factors.row(f)
                        });
                    for &f in active {
                        *weight_grads.entry(f).or_insert(0.0) += err * scale;
                        // d y_hat / d v_f = sum - v_f for one-hot rows
                        let grad = (&sum - &machine.factors.row(f)) * (err * scale);
                        *factor_grads
                            .entry(f)
                            .or_insert_with(|| Array1::zeros(grad.len())) += &grad;
                    }
                }

                machine.bias -= gamma * bias_grad;
                for (f, grad) in weight_grads {
                    machine.weights[f] -= gamma * (grad + lambda * machine.weights[f]);
                }
                for (f, grad) in factor_grads {
                    let v = machine.factors.row(f).to_owned();
                    machine
                        .factors
                        .row_mut(f)
                        .scaled_add(-gamma, &(grad + &v * lambda));
                }
            }

            let rmse = (squared_error / rows.len() as f64).sqrt();
            if !rmse.is_finite() {
                return Err(Error::NumericalFailure(format!(
                    "factorization machine diverged at epoch {} (gamma = {})",
                    epoch, gamma
                )));
            }
            debug!(algorithm = NAME, epoch = epoch, rmse = rmse, "FM epoch");
        }

        Ok(machine)
    }
}

impl RecommendationAlgorithm for Sgd2 {
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
        self.fitted.as_ref().map(|m| (m.nb_users, m.nb_works()))
    }

    fn fit_with_cancel(&mut self, data: &AnonymizedData, cancel: &CancelToken) -> Result<()> {
        self.fitted = None;
        let span = fit_span(&self.shortname(), data.nb_users(), data.nb_works());
        let _guard = span.enter();
        info!(nb_ratings = data.len(), "Fitting factorization machine");

        let machine = self.train(data, cancel)?;
        self.fitted = Some(machine);
        info!("Factorization machine fit complete");
        Ok(())
    }

    fn predict(&self, pairs: &[(usize, usize)]) -> Result<Vec<f64>> {
        let machine = self.machine()?;
        check_pairs(pairs, machine.nb_users, machine.nb_works())?;
        Ok(pairs
            .iter()
            .map(|&(u, i)| machine.predict_row(&[u, machine.nb_users + i]))
            .collect())
    }
}
