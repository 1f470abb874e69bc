//! Per-user Lasso regression on item side information
//!
//! Each user gets an independent linear model `r(u, i) = b_u + t_i . w_u`
//! over the work feature rows `t_i`, fitted by cyclic coordinate descent on
//! `1/(2n) ||y - b - Xw||^2 + alpha ||w||_1`. Without side information every
//! work is its own feature (identity matrix).

use crate::algorithm::{check_pairs, CancelToken, RecommendationAlgorithm};
use crate::dataset::AnonymizedData;
use crate::error::{Error, Result};
use crate::hyperparameters::{require_non_negative, require_positive, Hyperparameters};
use crate::snapshot::{stored_vector, wrong_state, ModelState, StoredMatrix};
use ndarray::{Array1, Array2, ArrayView1, Axis};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use zero_core::observability::fit_span;

pub const NAME: &str = "lasso";

#[derive(Debug, Clone, PartialEq)]
pub struct LassoConfig {
    /// L1 penalty
    pub alpha: f64,
    /// Maximum coordinate descent sweeps per user
    pub nb_iterations: usize,
    /// Stop once no coefficient moves by more than this
    pub tolerance: f64,
}

impl Default for LassoConfig {
    fn default() -> Self {
        Self {
            alpha: 0.01,
            nb_iterations: 100,
            tolerance: 1e-6,
        }
    }
}

impl LassoConfig {
    pub fn from_hyperparameters(params: &Hyperparameters) -> Result<Self> {
        let defaults = Self::default();
        let config = Self {
            alpha: params.get_f64("alpha", defaults.alpha)?,
            nb_iterations: params.get_usize("nb_iterations", defaults.nb_iterations)?,
            tolerance: params.get_f64("tolerance", defaults.tolerance)?,
        };
        require_non_negative("alpha", config.alpha)?;
        require_positive("tolerance", config.tolerance)?;
        Ok(config)
    }

    pub fn to_hyperparameters(&self) -> Hyperparameters {
        Hyperparameters::new()
            .with("alpha", self.alpha)
            .with("nb_iterations", self.nb_iterations)
            .with("tolerance", self.tolerance)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LassoState {
    /// [nb_users x nb_features]
    pub coefficients: StoredMatrix,
    pub intercepts: Vec<f64>,
    /// [nb_works x nb_features]
    pub item_features: StoredMatrix,
}

#[derive(Debug, Clone)]
struct Model {
    coefficients: Array2<f64>,
    intercepts: Array1<f64>,
    item_features: Array2<f64>,
}

#[derive(Debug, Clone)]
pub struct Lasso {
    config: LassoConfig,
    fitted: Option<Model>,
}

impl Lasso {
    pub fn new(config: LassoConfig) -> Self {
        Self {
            config,
            fitted: None,
        }
    }

    pub fn from_hyperparameters(params: &Hyperparameters) -> Result<Self> {
        Ok(Self::new(LassoConfig::from_hyperparameters(params)?))
    }

    /// Fitted `[nb_users x nb_features]` weights
    pub fn coefficients(&self) -> Option<&Array2<f64>> {
        self.fitted.as_ref().map(|m| &m.coefficients)
    }

    fn model(&self) -> Result<&Model> {
        self.fitted
            .as_ref()
            .ok_or_else(|| Error::NotFitted(self.shortname()))
    }
}

/// Coordinate descent for one user; returns `(weights, intercept)`
fn fit_user(
    features: &Array2<f64>,
    targets: &Array1<f64>,
    config: &LassoConfig,
) -> (Array1<f64>, f64) {
    let (n, p) = features.dim();
    let nf = n as f64;
    let x_mean = features.mean_axis(Axis(0)).unwrap_or_else(|| Array1::zeros(p));
    let y_mean = targets.sum() / nf;
    let x = features - &x_mean.view().insert_axis(Axis(0));
    let mut residual = targets - y_mean;

    let column_norms: Vec<f64> = x
        .axis_iter(Axis(1))
        .map(|col| col.dot(&col) / nf)
        .collect();
    let mut w = Array1::<f64>::zeros(p);

    for _ in 0..config.nb_iterations {
        let mut max_delta: f64 = 0.0;
        for j in 0..p {
            if column_norms[j] == 0.0 {
                continue;
            }
            let col = x.column(j);
            let rho = col.dot(&residual) / nf + column_norms[j] * w[j];
            let updated = soft_threshold(rho, config.alpha) / column_norms[j];
            let delta = updated - w[j];
            if delta != 0.0 {
                residual.scaled_add(-delta, &col);
                w[j] = updated;
                max_delta = max_delta.max(delta.abs());
            }
        }
        if max_delta < config.tolerance {
            break;
        }
    }

    let intercept = y_mean - x_mean.dot(&w);
    (w, intercept)
}

fn soft_threshold(value: f64, threshold: f64) -> f64 {
    if value > threshold {
        value - threshold
    } else if value < -threshold {
        value + threshold
    } else {
        0.0
    }
}

fn predict_one(model: &Model, user: usize, item: usize) -> f64 {
    let t: ArrayView1<f64> = model.item_features.row(item);
    model.intercepts[user] + t.dot(&model.coefficients.row(user))
}

impl RecommendationAlgorithm for Lasso {
    fn name(&self) -> &'static str {
        NAME
    }

    fn shortname(&self) -> String {
        format!("{}-{}", NAME, self.config.alpha)
    }

    fn hyperparameters(&self) -> Hyperparameters {
        self.config.to_hyperparameters()
    }

    fn dimensions(&self) -> Option<(usize, usize)> {
        self.fitted
            .as_ref()
            .map(|m| (m.intercepts.len(), m.item_features.nrows()))
    }

    fn fit_with_cancel(&mut self, data: &AnonymizedData, cancel: &CancelToken) -> Result<()> {
        self.fitted = None;
        let span = fit_span(&self.shortname(), data.nb_users(), data.nb_works());
        let _guard = span.enter();

        let global_mean = data
            .global_mean()
            .ok_or_else(|| Error::EmptyInput("no ratings to regress on".to_string()))?;
        let item_features = match data.item_features() {
            Some(features) => features.clone(),
            None => Array2::eye(data.nb_works()),
        };
        let nb_features = item_features.ncols();
        info!(
            nb_ratings = data.len(),
            nb_features = nb_features,
            "Fitting per-user Lasso"
        );

        let by_user = data.by_user();
        let fits: Vec<(Array1<f64>, f64)> = by_user
            .par_iter()
            .map(|entries| {
                cancel.check()?;
                if entries.is_empty() {
                    return Ok((Array1::zeros(nb_features), global_mean));
                }
                let works: Vec<usize> = entries.iter().map(|&(w, _)| w).collect();
                let targets = Array1::from_iter(entries.iter().map(|&(_, r)| r));
                let features = item_features.select(Axis(0), &works);
                Ok(fit_user(&features, &targets, &self.config))
            })
            .collect::<Result<_>>()?;

        let mut coefficients = Array2::<f64>::zeros((data.nb_users(), nb_features));
        let mut intercepts = Array1::<f64>::zeros(data.nb_users());
        for (user, (w, b)) in fits.into_iter().enumerate() {
            coefficients.row_mut(user).assign(&w);
            intercepts[user] = b;
        }
        let nonzero = coefficients.iter().filter(|&&c| c != 0.0).count();
        debug!(nonzero_coefficients = nonzero, "Lasso coefficients fitted");

        self.fitted = Some(Model {
            coefficients,
            intercepts,
            item_features,
        });
        info!("Lasso fit complete");
        Ok(())
    }

    fn predict(&self, pairs: &[(usize, usize)]) -> Result<Vec<f64>> {
        let model = self.model()?;
        check_pairs(pairs, model.intercepts.len(), model.item_features.nrows())?;
        Ok(pairs
            .iter()
            .map(|&(user, item)| predict_one(model, user, item))
            .collect())
    }

    fn is_serializable(&self) -> bool {
        true
    }

    fn export_state(&self) -> Result<ModelState> {
        let model = self.model()?;
        Ok(ModelState::Lasso(LassoState {
            coefficients: StoredMatrix::from_array(&model.coefficients),
            intercepts: model.intercepts.to_vec(),
            item_features: StoredMatrix::from_array(&model.item_features),
        }))
    }

    fn restore_state(&mut self, state: ModelState) -> Result<()> {
        let state = match state {
            ModelState::Lasso(state) => state,
            other => return Err(wrong_state(NAME, &other)),
        };
        let nb_users = state.intercepts.len();
        let nb_features = state.item_features.cols;
        self.fitted = Some(Model {
            coefficients: state.coefficients.into_array_shaped(nb_users, nb_features)?,
            intercepts: stored_vector(state.intercepts, nb_users)?,
            item_features: state.item_features.into_array()?,
        });
        Ok(())
    }
}
