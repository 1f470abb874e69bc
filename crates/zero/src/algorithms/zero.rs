//! Baseline that predicts the global mean rating for every pair

use crate::algorithm::{check_pairs, CancelToken, RecommendationAlgorithm};
use crate::dataset::AnonymizedData;
use crate::error::{Error, Result};
use crate::hyperparameters::Hyperparameters;
use tracing::info;

pub const NAME: &str = "zero";

#[derive(Debug, Clone, Copy)]
struct Fitted {
    mean: f64,
    nb_users: usize,
    nb_works: usize,
}

#[derive(Debug, Clone, Default)]
pub struct Zero {
    fitted: Option<Fitted>,
}

impl Zero {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_hyperparameters(_params: &Hyperparameters) -> Result<Self> {
        Ok(Self::new())
    }

    /// The mean learned by the last fit
    pub fn mean(&self) -> Option<f64> {
        self.fitted.map(|f| f.mean)
    }
}

impl RecommendationAlgorithm for Zero {
    fn name(&self) -> &'static str {
        NAME
    }

    fn shortname(&self) -> String {
        NAME.to_string()
    }

    fn hyperparameters(&self) -> Hyperparameters {
        Hyperparameters::new()
    }

    fn dimensions(&self) -> Option<(usize, usize)> {
        self.fitted.map(|f| (f.nb_users, f.nb_works))
    }

    fn fit_with_cancel(&mut self, data: &AnonymizedData, cancel: &CancelToken) -> Result<()> {
        self.fitted = None;
        cancel.check()?;
        let mean = data
            .global_mean()
            .ok_or_else(|| Error::EmptyInput("no ratings to average".to_string()))?;

        self.fitted = Some(Fitted {
            mean,
            nb_users: data.nb_users(),
            nb_works: data.nb_works(),
        });
        info!(algorithm = NAME, mean = mean, "Fitted global mean");
        Ok(())
    }

    fn predict(&self, pairs: &[(usize, usize)]) -> Result<Vec<f64>> {
        let fitted = self
            .fitted
            .ok_or_else(|| Error::NotFitted(self.shortname()))?;
        check_pairs(pairs, fitted.nb_users, fitted.nb_works)?;
        Ok(vec![fitted.mean; pairs.len()])
    }
}
