//! User-based k-nearest-neighbors
//!
//! Neighbors are the users with the highest cosine similarity between raw
//! rating rows. A prediction averages the neighbors' ratings of the work
//! (optionally weighted by similarity); neighbors who did not rate it count
//! with the work mean when `missing_is_mean` is set and are skipped otherwise.
//! When fewer than `rated_by_neighbors_at_least` neighbors rated the work the
//! prediction falls back to the global mean.
//!
//! Neighborhoods are computed at prediction time and never cached, so
//! `predict` has no side effects.

use super::shortname_with;
use crate::algorithm::{
    check_pairs, check_single_user, check_works, CancelToken, RecommendationAlgorithm,
    SingleUserModel,
};
use crate::dataset::AnonymizedData;
use crate::error::{Error, Result};
use crate::hyperparameters::{require_positive, Hyperparameters};
use crate::snapshot::{wrong_state, ModelState};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::info;
use zero_core::observability::fit_span;

pub const NAME: &str = "knn";

#[derive(Debug, Clone, PartialEq)]
pub struct KnnConfig {
    pub nb_neighbors: usize,
    pub rated_by_neighbors_at_least: usize,
    pub missing_is_mean: bool,
    /// Weight neighbor ratings by similarity
    pub weighted: bool,
}

impl Default for KnnConfig {
    fn default() -> Self {
        Self {
            nb_neighbors: 20,
            rated_by_neighbors_at_least: 3,
            missing_is_mean: true,
            weighted: false,
        }
    }
}

impl KnnConfig {
    pub fn from_hyperparameters(params: &Hyperparameters) -> Result<Self> {
        let defaults = Self::default();
        let config = Self {
            nb_neighbors: params.get_usize("nb_neighbors", defaults.nb_neighbors)?,
            rated_by_neighbors_at_least: params.get_usize(
                "rated_by_neighbors_at_least",
                defaults.rated_by_neighbors_at_least,
            )?,
            missing_is_mean: params.get_bool("missing_is_mean", defaults.missing_is_mean)?,
            weighted: params.get_bool("weighted", defaults.weighted)?,
        };
        require_positive("nb_neighbors", config.nb_neighbors as f64)?;
        Ok(config)
    }

    pub fn to_hyperparameters(&self) -> Hyperparameters {
        Hyperparameters::new()
            .with("nb_neighbors", self.nb_neighbors)
            .with("rated_by_neighbors_at_least", self.rated_by_neighbors_at_least)
            .with("missing_is_mean", self.missing_is_mean)
            .with("weighted", self.weighted)
    }
}

/// Persisted KNN training ratings; everything else is derived on restore
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KnnState {
    pub nb_works: usize,
    /// `ratings[user] = [(work, rating), ...]`, sorted by work
    pub ratings: Vec<Vec<(usize, f64)>>,
}

#[derive(Debug, Clone)]
struct Neighborhoods {
    by_user: Vec<Vec<(usize, f64)>>,
    by_work: Vec<Vec<(usize, f64)>>,
    norms: Vec<f64>,
    work_means: Vec<Option<f64>>,
    global_mean: f64,
}

impl Neighborhoods {
    fn build(by_user: Vec<Vec<(usize, f64)>>, nb_works: usize) -> Result<Self> {
        let mut by_work: Vec<Vec<(usize, f64)>> = vec![Vec::new(); nb_works];
        let mut total = 0.0;
        let mut count = 0usize;
        for (user, entries) in by_user.iter().enumerate() {
            for &(work, rating) in entries {
                let list = by_work.get_mut(work).ok_or(Error::IndexOutOfRange {
                    user,
                    item: work,
                    nb_users: by_user.len(),
                    nb_works,
                })?;
                list.push((user, rating));
                total += rating;
                count += 1;
            }
        }
        if count == 0 {
            return Err(Error::EmptyInput("no ratings to compare users on".to_string()));
        }

        let norms = by_user
            .iter()
            .map(|entries| entries.iter().map(|&(_, r)| r * r).sum::<f64>().sqrt())
            .collect();
        let work_means = by_work
            .iter()
            .map(|entries| {
                (!entries.is_empty())
                    .then(|| entries.iter().map(|&(_, r)| r).sum::<f64>() / entries.len() as f64)
            })
            .collect();

        Ok(Self {
            by_user,
            by_work,
            norms,
            work_means,
            global_mean: total / count as f64,
        })
    }

    fn nb_users(&self) -> usize {
        self.by_user.len()
    }

    fn nb_works(&self) -> usize {
        self.by_work.len()
    }

    fn rating(&self, user: usize, work: usize) -> Option<f64> {
        let entries = &self.by_user[user];
        entries
            .binary_search_by_key(&work, |&(w, _)| w)
            .ok()
            .map(|idx| entries[idx].1)
    }

    /// Cosine similarity of `ratings` against every training user
    fn similarities(&self, ratings: &[(usize, f64)]) -> Vec<f64> {
        let mut dots = vec![0.0; self.nb_users()];
        for &(work, rating) in ratings {
            for &(other, their_rating) in &self.by_work[work] {
                dots[other] += rating * their_rating;
            }
        }
        let norm = ratings.iter().map(|&(_, r)| r * r).sum::<f64>().sqrt();
        dots.iter()
            .zip(&self.norms)
            .map(|(&dot, &other_norm)| {
                if norm == 0.0 || other_norm == 0.0 {
                    0.0
                } else {
                    dot / (norm * other_norm)
                }
            })
            .collect()
    }

    /// The `k` most similar users, best first, never including `exclude`
    fn closest(&self, ratings: &[(usize, f64)], k: usize, exclude: Option<usize>) -> Vec<(usize, f64)> {
        let mut scored: Vec<(usize, f64)> = self
            .similarities(ratings)
            .into_iter()
            .enumerate()
            .filter(|&(user, _)| Some(user) != exclude)
            .collect();
        scored.sort_by(|a, b| b.1.total_cmp(&a.1));
        scored.truncate(k);
        scored
    }
}

#[derive(Debug, Clone)]
pub struct Knn {
    config: KnnConfig,
    fitted: Option<Neighborhoods>,
}

impl Knn {
    pub fn new(config: KnnConfig) -> Self {
        Self {
            config,
            fitted: None,
        }
    }

    pub fn from_hyperparameters(params: &Hyperparameters) -> Result<Self> {
        Ok(Self::new(KnnConfig::from_hyperparameters(params)?))
    }

    fn neighborhoods(&self) -> Result<&Neighborhoods> {
        self.fitted
            .as_ref()
            .ok_or_else(|| Error::NotFitted(self.shortname()))
    }

    /// Neighbors of a training user, best first
    pub fn neighbors(&self, user: usize) -> Result<Vec<(usize, f64)>> {
        let n = self.neighborhoods()?;
        check_pairs(&[(user, 0)], n.nb_users(), n.nb_works().max(1))?;
        Ok(n.closest(&n.by_user[user], self.config.nb_neighbors, Some(user)))
    }

    fn predict_from(&self, n: &Neighborhoods, neighbors: &[(usize, f64)], work: usize) -> f64 {
        let mut weighted_sum = 0.0;
        let mut weight = 0.0;
        let mut nb_rated = 0usize;

        for &(neighbor, similarity) in neighbors {
            let their_rating = match n.rating(neighbor, work) {
                Some(rating) => {
                    nb_rated += 1;
                    rating
                }
                None if self.config.missing_is_mean => {
                    n.work_means[work].unwrap_or(n.global_mean)
                }
                None => continue,
            };
            let w = if self.config.weighted { similarity } else { 1.0 };
            weighted_sum += w * their_rating;
            weight += w;
        }

        if nb_rated < self.config.rated_by_neighbors_at_least || weight <= 0.0 {
            n.global_mean
        } else {
            weighted_sum / weight
        }
    }
}

impl RecommendationAlgorithm for Knn {
    fn name(&self) -> &'static str {
        NAME
    }

    fn shortname(&self) -> String {
        shortname_with(NAME, self.config.nb_neighbors)
    }

    fn hyperparameters(&self) -> Hyperparameters {
        self.config.to_hyperparameters()
    }

    fn nb_components(&self) -> Option<usize> {
        Some(self.config.nb_neighbors)
    }

    fn dimensions(&self) -> Option<(usize, usize)> {
        self.fitted.as_ref().map(|n| (n.nb_users(), n.nb_works()))
    }

    fn fit_with_cancel(&mut self, data: &AnonymizedData, cancel: &CancelToken) -> Result<()> {
        self.fitted = None;
        let span = fit_span(&self.shortname(), data.nb_users(), data.nb_works());
        let _guard = span.enter();

        cancel.check()?;
        self.fitted = Some(Neighborhoods::build(data.by_user(), data.nb_works())?);
        info!(nb_ratings = data.len(), "KNN fit complete");
        Ok(())
    }

    fn predict(&self, pairs: &[(usize, usize)]) -> Result<Vec<f64>> {
        let n = self.neighborhoods()?;
        check_pairs(pairs, n.nb_users(), n.nb_works())?;

        let mut neighbors: HashMap<usize, Vec<(usize, f64)>> = HashMap::new();
        let mut predictions = Vec::with_capacity(pairs.len());
        for &(user, work) in pairs {
            let closest = neighbors
                .entry(user)
                .or_insert_with(|| n.closest(&n.by_user[user], self.config.nb_neighbors, Some(user)));
            predictions.push(self.predict_from(n, closest, work));
        }
        Ok(predictions)
    }

    fn is_serializable(&self) -> bool {
        true
    }

    fn export_state(&self) -> Result<ModelState> {
        let n = self.neighborhoods()?;
        Ok(ModelState::Knn(KnnState {
            nb_works: n.nb_works(),
            ratings: n.by_user.clone(),
        }))
    }

    fn restore_state(&mut self, state: ModelState) -> Result<()> {
        let state = match state {
            ModelState::Knn(state) => state,
            other => return Err(wrong_state(NAME, &other)),
        };
        let mut ratings = state.ratings;
        for entries in ratings.iter_mut() {
            entries.sort_by_key(|&(work, _)| work);
        }
        self.fitted = Some(
            Neighborhoods::build(ratings, state.nb_works)
                .map_err(|e| Error::IncompatibleSnapshot(e.to_string()))?,
        );
        Ok(())
    }
}

impl SingleUserModel for Knn {
    /// Neighbor user indices
    type UserParams = Vec<usize>;

    fn fit_single_user(&self, rated_works: &[usize], ratings: &[f64]) -> Result<Vec<usize>> {
        let n = self.neighborhoods()?;
        check_single_user(rated_works, ratings, n.nb_works())?;
        let profile: Vec<(usize, f64)> = rated_works.iter().copied().zip(ratings.iter().copied()).collect();
        Ok(n.closest(&profile, self.config.nb_neighbors, None)
            .into_iter()
            .map(|(user, _)| user)
            .collect())
    }

    /// Mean rating of each work among the neighbors who rated it, the global
    /// mean if none did
    fn predict_single_user(&self, work_ids: &[usize], neighbors: &Vec<usize>) -> Result<Vec<f64>> {
        let n = self.neighborhoods()?;
        check_works(work_ids, n.nb_works())?;
        if let Some(&bad) = neighbors.iter().find(|&&u| u >= n.nb_users()) {
            return Err(Error::IndexOutOfRange {
                user: bad,
                item: 0,
                nb_users: n.nb_users(),
                nb_works: n.nb_works(),
            });
        }
        Ok(work_ids
            .iter()
            .map(|&work| {
                let rated: Vec<f64> = neighbors.iter().filter_map(|&u| n.rating(u, work)).collect();
                zero_core::math::mean(&rated).unwrap_or(n.global_mean)
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ratings() -> AnonymizedData {
        // Users 0-2 share tastes, user 3 is the opposite, user 4 rated little.
        AnonymizedData::from_triplets(
            &[
                (0, 0, 5.0),
                (0, 1, 4.0),
                (0, 2, 1.0),
                (1, 0, 5.0),
                (1, 1, 5.0),
                (1, 2, 1.0),
                (1, 3, 4.0),
                (2, 0, 4.0),
                (2, 1, 4.0),
                (2, 3, 5.0),
                (3, 0, 1.0),
                (3, 2, 5.0),
                (3, 3, 1.0),
                (4, 1, 3.0),
            ],
            5,
            4,
        )
        .unwrap()
    }

    fn knn(nb_neighbors: usize, at_least: usize) -> Knn {
        Knn::new(KnnConfig {
            nb_neighbors,
            rated_by_neighbors_at_least: at_least,
            missing_is_mean: false,
            weighted: false,
        })
    }

    #[test]
    fn test_neighbors_exclude_self_and_rank_by_similarity() {
        let data = ratings();
        let mut model = knn(2, 1);
        model.fit(&data).unwrap();

        let neighbors = model.neighbors(0).unwrap();
        assert_eq!(neighbors.len(), 2);
        assert!(neighbors.iter().all(|&(u, _)| u != 0));
        assert!(neighbors.iter().all(|&(u, _)| u == 1 || u == 2));
        assert!(neighbors[0].1 >= neighbors[1].1);
    }

    #[test]
    fn test_prediction_averages_neighbors() {
        let data = ratings();
        let mut model = knn(2, 1);
        model.fit(&data).unwrap();

        // Neighbors 1 and 2 rated work 3 with 4 and 5.
        let predicted = model.predict(&[(0, 3)]).unwrap();
        assert!((predicted[0] - 4.5).abs() < 1e-12);
    }

    #[test]
    fn test_falls_back_to_global_mean() {
        let data = ratings();
        let mut model = knn(2, 3);
        model.fit(&data).unwrap();

        let predicted = model.predict(&[(0, 3)]).unwrap();
        assert!((predicted[0] - data.global_mean().unwrap()).abs() < 1e-12);
    }

    #[test]
    fn test_weighted_and_missing_is_mean() {
        let data = ratings();
        let mut model = Knn::new(KnnConfig {
            nb_neighbors: 4,
            rated_by_neighbors_at_least: 1,
            missing_is_mean: true,
            weighted: true,
        });
        model.fit(&data).unwrap();

        let predicted = model.predict(&[(4, 3), (4, 3)]).unwrap();
        assert_eq!(predicted[0], predicted[1]);
        assert!(predicted[0] >= 1.0 && predicted[0] <= 5.0);
        assert_eq!(model.shortname(), "knn-4");
    }

    #[test]
    fn test_single_user_neighbors() {
        let data = ratings();
        let mut model = knn(2, 1);
        model.fit(&data).unwrap();

        let neighbors = model.fit_single_user(&[0, 2], &[1.0, 5.0]).unwrap();
        assert_eq!(neighbors[0], 3);

        let predicted = model.predict_single_user(&[3], &neighbors).unwrap();
        assert_eq!(predicted.len(), 1);
        assert!(model.predict_single_user(&[0], &vec![42]).is_err());
    }

    #[test]
    fn test_single_user_without_rating_neighbors_gets_global_mean() {
        let data = ratings();
        let mut model = knn(2, 1);
        model.fit(&data).unwrap();

        // User 4 never rated work 0.
        let predicted = model.predict_single_user(&[0, 1], &vec![4]).unwrap();
        assert!((predicted[0] - data.global_mean().unwrap()).abs() < 1e-12);
        assert_eq!(predicted[1], 3.0);
        assert_eq!(
            model.predict_single_user(&[2], &Vec::new()).unwrap(),
            vec![data.global_mean().unwrap()]
        );
    }

    #[test]
    fn test_state_round_trip() {
        let data = ratings();
        let mut model = knn(2, 1);
        model.fit(&data).unwrap();

        let mut restored = knn(2, 1);
        restored.restore_state(model.export_state().unwrap()).unwrap();
        assert_eq!(
            model.predict(&data.pairs()).unwrap(),
            restored.predict(&data.pairs()).unwrap()
        );
    }
}
