//! The contract shared by every recommendation algorithm
//!
//! An algorithm is constructed from hyperparameters (usually through the
//! registry), fitted on `AnonymizedData`, then asked for predictions on
//! `(user_index, item_index)` pairs. Fitted state can be written to and read
//! back from snapshot files.

use crate::dataset::AnonymizedData;
use crate::error::{Error, Result};
use crate::hyperparameters::Hyperparameters;
use crate::metrics::{self, Metric, MetricsReport};
use crate::snapshot::{self, ModelState};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Cooperative cancellation flag for long-running fits
///
/// Clones share the same flag.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    /// `Err(Cancelled)` once `cancel` has been called
    pub fn check(&self) -> Result<()> {
        if self.is_cancelled() {
            Err(Error::Cancelled)
        } else {
            Ok(())
        }
    }
}

/// One entry of a top-k recommendation list
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Recommendation {
    pub item: usize,
    pub score: f64,
}

pub trait RecommendationAlgorithm: Send {
    /// Registry name of the algorithm kind, e.g. `als`
    fn name(&self) -> &'static str;

    /// Stable identifier of this configuration, e.g. `als-20`
    fn shortname(&self) -> String;

    /// Effective hyperparameters after defaults were applied
    fn hyperparameters(&self) -> Hyperparameters;

    /// Number of latent components or neighbors, for kinds that have one
    fn nb_components(&self) -> Option<usize> {
        None
    }

    /// `(nb_users, nb_works)` of the fitted state, `None` before fit
    fn dimensions(&self) -> Option<(usize, usize)>;

    /// Fit from scratch, checking `cancel` between iterations
    ///
    /// Any previous state is discarded. On error, including `Cancelled`, the
    /// instance is left unfitted.
    fn fit_with_cancel(&mut self, data: &AnonymizedData, cancel: &CancelToken) -> Result<()>;

    fn fit(&mut self, data: &AnonymizedData) -> Result<()> {
        self.fit_with_cancel(data, &CancelToken::new())
    }

    /// One score per pair, in input order
    ///
    /// # Errors
    ///
    /// `NotFitted` before a fit or load, `IndexOutOfRange` for pairs outside
    /// the fitted dimensions.
    fn predict(&self, pairs: &[(usize, usize)]) -> Result<Vec<f64>>;

    fn is_serializable(&self) -> bool {
        false
    }

    /// Fitted state for a snapshot
    fn export_state(&self) -> Result<ModelState> {
        Err(Error::NotSerializable(self.shortname()))
    }

    /// Replace the fitted state with one read from a snapshot
    fn restore_state(&mut self, _state: ModelState) -> Result<()> {
        Err(Error::NotSerializable(self.shortname()))
    }

    fn compute_metrics(
        &self,
        metrics: &[Metric],
        y_true: &[f64],
        y_pred: &[f64],
        groups: Option<&[usize]>,
    ) -> Result<MetricsReport> {
        metrics::compute_metrics(metrics, y_true, y_pred, groups)
    }

    fn save(&self, path: &Path) -> Result<()> {
        if !self.is_serializable() {
            return Err(Error::NotSerializable(self.shortname()));
        }
        snapshot::write_snapshot(path, self, None)
    }

    fn load(&mut self, path: &Path) -> Result<()> {
        if !self.is_serializable() {
            return Err(Error::NotSerializable(self.shortname()));
        }
        let (header, state) = snapshot::read_snapshot(path)?;
        header.check_compatible(&*self)?;
        header.check_state(&state)?;
        self.restore_state(state)
    }

    /// Top-`k` items by predicted score averaged over `user_ids`
    ///
    /// Candidates default to every work; all of them are returned when `k`
    /// is `None`.
    fn recommend(
        &self,
        user_ids: &[usize],
        item_ids: Option<&[usize]>,
        k: Option<usize>,
    ) -> Result<Vec<Recommendation>> {
        let (_, nb_works) = self
            .dimensions()
            .ok_or_else(|| Error::NotFitted(self.shortname()))?;
        if user_ids.is_empty() {
            return Err(Error::EmptyInput("no users to recommend for".to_string()));
        }

        let candidates: Vec<usize> = match item_ids {
            Some(items) => items.to_vec(),
            None => (0..nb_works).collect(),
        };
        let mut totals = vec![0.0; candidates.len()];
        for &user in user_ids {
            let pairs: Vec<(usize, usize)> = candidates.iter().map(|&item| (user, item)).collect();
            for (total, score) in totals.iter_mut().zip(self.predict(&pairs)?) {
                *total += score;
            }
        }

        let nb_users = user_ids.len() as f64;
        let mut ranked: Vec<Recommendation> = candidates
            .into_iter()
            .zip(totals)
            .map(|(item, total)| Recommendation {
                item,
                score: total / nb_users,
            })
            .collect();
        ranked.sort_by(|a, b| b.score.total_cmp(&a.score));
        if let Some(k) = k {
            ranked.truncate(k);
        }
        Ok(ranked)
    }
}

/// Fold-in of a user that was not part of the training set
///
/// The trained model stays untouched; the user's parameters are returned to
/// the caller.
pub trait SingleUserModel {
    type UserParams;

    fn fit_single_user(&self, rated_works: &[usize], ratings: &[f64]) -> Result<Self::UserParams>;

    fn predict_single_user(&self, work_ids: &[usize], params: &Self::UserParams) -> Result<Vec<f64>>;
}

/// Fail with `IndexOutOfRange` on the first pair outside the fitted shape
pub(crate) fn check_pairs(pairs: &[(usize, usize)], nb_users: usize, nb_works: usize) -> Result<()> {
    match pairs
        .iter()
        .find(|&&(user, item)| user >= nb_users || item >= nb_works)
    {
        Some(&(user, item)) => Err(Error::IndexOutOfRange {
            user,
            item,
            nb_users,
            nb_works,
        }),
        None => Ok(()),
    }
}

/// Shared argument checks of `SingleUserModel::fit_single_user`
pub(crate) fn check_single_user(rated_works: &[usize], ratings: &[f64], nb_works: usize) -> Result<()> {
    if rated_works.len() != ratings.len() {
        return Err(Error::DimensionMismatch {
            expected: format!("{} ratings", rated_works.len()),
            actual: format!("{} ratings", ratings.len()),
        });
    }
    if rated_works.is_empty() {
        return Err(Error::EmptyInput("user has no ratings".to_string()));
    }
    check_works(rated_works, nb_works)
}

pub(crate) fn check_works(work_ids: &[usize], nb_works: usize) -> Result<()> {
    match work_ids.iter().find(|&&item| item >= nb_works) {
        Some(&item) => Err(Error::IndexOutOfRange {
            user: 0,
            item,
            nb_users: 1,
            nb_works,
        }),
        None => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cancel_token_shared_between_clones() {
        let token = CancelToken::new();
        let clone = token.clone();
        assert!(token.check().is_ok());

        clone.cancel();
        assert!(token.is_cancelled());
        assert!(matches!(token.check(), Err(Error::Cancelled)));
    }

    #[test]
    fn test_check_pairs() {
        assert!(check_pairs(&[(0, 0), (1, 2)], 2, 3).is_ok());
        assert!(matches!(
            check_pairs(&[(0, 0), (2, 0)], 2, 3),
            Err(Error::IndexOutOfRange { user: 2, item: 0, .. })
        ));
        assert!(check_pairs(&[(0, 3)], 2, 3).is_err());
    }

    #[test]
    fn test_check_single_user() {
        assert!(check_single_user(&[0, 1], &[4.0, 5.0], 2).is_ok());
        assert!(matches!(
            check_single_user(&[0], &[4.0, 5.0], 2),
            Err(Error::DimensionMismatch { .. })
        ));
        assert!(matches!(
            check_single_user(&[], &[], 2),
            Err(Error::EmptyInput(_))
        ));
        assert!(check_single_user(&[5], &[1.0], 2).is_err());
    }
}
