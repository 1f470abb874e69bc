//! Truncated SVD with nearest-neighbor smoothing of user embeddings
//!
//! Ratings are centered twice: first on the user mean, then on the work mean
//! of the user-centered residuals (taken over all users, so unrated cells
//! count as zero). A truncated SVD of that matrix gives user embeddings
//! `U diag(sigma)`. A prediction replaces the user's embedding with the
//! average embedding of its `nb_neighbors` closest users (Euclidean distance,
//! inverse-distance weighted when `is_weighted` is set) and projects it on
//! the work's right singular vector.
//!
//! Users at distance zero from the query (the user itself, and exact
//! duplicates) never count as neighbors. If every candidate is at distance
//! zero the user's own embedding is kept.

use super::center_by_user;
use crate::algorithm::{
    check_pairs, check_single_user, check_works, CancelToken, RecommendationAlgorithm,
    SingleUserModel,
};
use crate::dataset::AnonymizedData;
use crate::error::{Error, Result};
use crate::hyperparameters::{require_positive, Hyperparameters};
use crate::linalg::truncated_svd;
use crate::snapshot::{stored_vector, wrong_state, ModelState, StoredMatrix};
use ndarray::{Array1, Array2, ArrayView1, Axis};
use rand::rngs::StdRng;
use rand::SeedableRng;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::{debug, info};
use zero_core::observability::fit_span;

pub const NAME: &str = "svdknn";

#[derive(Debug, Clone, PartialEq)]
pub struct SvdKnnConfig {
    pub nb_components: usize,
    pub nb_neighbors: usize,
    /// Weight neighbors by inverse distance instead of uniformly
    pub is_weighted: bool,
    /// Subspace iterations of the randomized solver
    pub nb_iterations: usize,
    pub seed: u64,
}

impl Default for SvdKnnConfig {
    fn default() -> Self {
        Self {
            nb_components: 20,
            nb_neighbors: 5,
            is_weighted: true,
            nb_iterations: 10,
            seed: 42,
        }
    }
}

impl SvdKnnConfig {
    pub fn from_hyperparameters(params: &Hyperparameters) -> Result<Self> {
        let defaults = Self::default();
        let config = Self {
            nb_components: params.get_usize("nb_components", defaults.nb_components)?,
            nb_neighbors: params.get_usize("nb_neighbors", defaults.nb_neighbors)?,
            is_weighted: params.get_bool("is_weighted", defaults.is_weighted)?,
            nb_iterations: params.get_usize("nb_iterations", defaults.nb_iterations)?,
            seed: params.get_u64("seed", defaults.seed)?,
        };
        require_positive("nb_components", config.nb_components as f64)?;
        require_positive("nb_neighbors", config.nb_neighbors as f64)?;
        Ok(config)
    }

    pub fn to_hyperparameters(&self) -> Hyperparameters {
        Hyperparameters::new()
            .with("nb_components", self.nb_components)
            .with("nb_neighbors", self.nb_neighbors)
            .with("is_weighted", self.is_weighted)
            .with("nb_iterations", self.nb_iterations)
            .with("seed", self.seed)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SvdKnnState {
    /// `nb_users x rank`, already scaled by the singular values
    pub user_embeddings: StoredMatrix,
    /// `rank x nb_works`
    pub vt: StoredMatrix,
    pub user_means: Vec<f64>,
    pub work_means: Vec<f64>,
}

#[derive(Debug, Clone)]
struct Embeddings {
    users: Array2<f64>,
    vt: Array2<f64>,
    user_means: Array1<f64>,
    work_means: Array1<f64>,
}

impl Embeddings {
    fn nb_users(&self) -> usize {
        self.users.nrows()
    }

    fn nb_works(&self) -> usize {
        self.vt.ncols()
    }
}

/// Folded-in user: rating mean and coordinates in the embedding space
#[derive(Debug, Clone, PartialEq)]
pub struct SvdKnnUserParams {
    pub mean: f64,
    pub embedding: Array1<f64>,
}

#[derive(Debug, Clone)]
pub struct SvdKnn {
    config: SvdKnnConfig,
    fitted: Option<Embeddings>,
}

impl SvdKnn {
    pub fn new(config: SvdKnnConfig) -> Self {
        Self {
            config,
            fitted: None,
        }
    }

    pub fn from_hyperparameters(params: &Hyperparameters) -> Result<Self> {
        Ok(Self::new(SvdKnnConfig::from_hyperparameters(params)?))
    }

    fn embeddings(&self) -> Result<&Embeddings> {
        self.fitted
            .as_ref()
            .ok_or_else(|| Error::NotFitted(self.shortname()))
    }

    /// Doubly centered rating matrix with its user and work means
    fn centered_matrix(data: &AnonymizedData) -> Result<(Array2<f64>, Array1<f64>, Array1<f64>)> {
        let (user_means, by_user) = center_by_user(data)?;
        let mut matrix = Array2::<f64>::zeros((data.nb_users(), data.nb_works()));
        for (user, entries) in by_user.iter().enumerate() {
            for &(work, residual) in entries {
                matrix[[user, work]] = residual;
            }
        }

        let work_means = matrix.sum_axis(Axis(0)) / data.nb_users() as f64;
        for (user, entries) in by_user.iter().enumerate() {
            for &(work, _) in entries {
                matrix[[user, work]] -= work_means[work];
            }
        }
        Ok((matrix, user_means, work_means))
    }

    /// Weighted average of the embeddings of the users closest to `query`
    fn average_embedding(&self, e: &Embeddings, query: ArrayView1<f64>) -> Array1<f64> {
        let mut candidates: Vec<(f64, usize)> = e
            .users
            .outer_iter()
            .enumerate()
            .map(|(user, row)| {
                let distance = (&row - &query).mapv(|x| x * x).sum().sqrt();
                (distance, user)
            })
            .filter(|&(distance, _)| distance > 0.0)
            .collect();
        candidates.sort_by(|a, b| a.0.total_cmp(&b.0));
        candidates.truncate(self.config.nb_neighbors);

        let mut total = Array1::<f64>::zeros(e.users.ncols());
        let mut weights = 0.0;
        for &(distance, user) in &candidates {
            let weight = if self.config.is_weighted {
                1.0 / distance
            } else {
                1.0
            };
            total.scaled_add(weight, &e.users.row(user));
            weights += weight;
        }
        if weights > 0.0 {
            total / weights
        } else {
            query.to_owned()
        }
    }
}

impl RecommendationAlgorithm for SvdKnn {
    fn name(&self) -> &'static str {
        NAME
    }

    fn shortname(&self) -> String {
        let suffix = if self.config.is_weighted { "-weight" } else { "" };
        format!(
            "{}-{}-{}{}",
            NAME, self.config.nb_components, self.config.nb_neighbors, suffix
        )
    }

    fn hyperparameters(&self) -> Hyperparameters {
        self.config.to_hyperparameters()
    }

    fn nb_components(&self) -> Option<usize> {
        Some(self.config.nb_components)
    }

    fn dimensions(&self) -> Option<(usize, usize)> {
        self.fitted.as_ref().map(|e| (e.nb_users(), e.nb_works()))
    }

    fn fit_with_cancel(&mut self, data: &AnonymizedData, cancel: &CancelToken) -> Result<()> {
        self.fitted = None;
        let span = fit_span(&self.shortname(), data.nb_users(), data.nb_works());
        let _guard = span.enter();
        info!(nb_ratings = data.len(), "Fitting SVD embeddings");

        cancel.check()?;
        let (matrix, user_means, work_means) = Self::centered_matrix(data)?;
        let mut rng = StdRng::seed_from_u64(self.config.seed);
        let svd = truncated_svd(
            &matrix,
            self.config.nb_components,
            self.config.nb_iterations,
            &mut rng,
        )?;
        cancel.check()?;

        debug!(rank = svd.sigma.len(), "Decomposition computed");
        let users = &svd.u * &svd.sigma.view().insert_axis(Axis(0));
        self.fitted = Some(Embeddings {
            users,
            vt: svd.vt,
            user_means,
            work_means,
        });
        info!("SVD-KNN fit complete");
        Ok(())
    }

    fn predict(&self, pairs: &[(usize, usize)]) -> Result<Vec<f64>> {
        let e = self.embeddings()?;
        check_pairs(pairs, e.nb_users(), e.nb_works())?;

        let mut users: Vec<usize> = pairs.iter().map(|&(u, _)| u).collect();
        users.sort_unstable();
        users.dedup();
        let averaged: HashMap<usize, Array1<f64>> = users
            .par_iter()
            .map(|&user| (user, self.average_embedding(e, e.users.row(user))))
            .collect();

        Ok(pairs
            .iter()
            .map(|&(user, work)| {
                averaged[&user].dot(&e.vt.column(work)) + e.user_means[user] + e.work_means[work]
            })
            .collect())
    }

    fn is_serializable(&self) -> bool {
        true
    }

    fn export_state(&self) -> Result<ModelState> {
        let e = self.embeddings()?;
        Ok(ModelState::SvdKnn(SvdKnnState {
            user_embeddings: StoredMatrix::from_array(&e.users),
            vt: StoredMatrix::from_array(&e.vt),
            user_means: e.user_means.to_vec(),
            work_means: e.work_means.to_vec(),
        }))
    }

    fn restore_state(&mut self, state: ModelState) -> Result<()> {
        let state = match state {
            ModelState::SvdKnn(state) => state,
            other => return Err(wrong_state(NAME, &other)),
        };
        let (nb_users, rank) = (state.user_embeddings.rows, state.user_embeddings.cols);
        if rank > self.config.nb_components {
            return Err(Error::IncompatibleSnapshot(format!(
                "{} embedding dimensions for {} components",
                rank, self.config.nb_components
            )));
        }
        let nb_works = state.vt.cols;
        self.fitted = Some(Embeddings {
            users: state.user_embeddings.into_array_shaped(nb_users, rank)?,
            vt: state.vt.into_array_shaped(rank, nb_works)?,
            user_means: stored_vector(state.user_means, nb_users)?,
            work_means: stored_vector(state.work_means, nb_works)?,
        });
        Ok(())
    }
}

impl SingleUserModel for SvdKnn {
    type UserParams = SvdKnnUserParams;

    /// Projects the user's doubly centered ratings on the right singular vectors
    fn fit_single_user(&self, rated_works: &[usize], ratings: &[f64]) -> Result<SvdKnnUserParams> {
        let e = self.embeddings()?;
        check_single_user(rated_works, ratings, e.nb_works())?;

        let mean = ratings.iter().sum::<f64>() / ratings.len() as f64;
        let residuals = Array1::from_iter(
            rated_works
                .iter()
                .zip(ratings)
                .map(|(&work, r)| r - mean - e.work_means[work]),
        );
        let basis = e.vt.select(Axis(1), rated_works);
        Ok(SvdKnnUserParams {
            mean,
            embedding: basis.dot(&residuals),
        })
    }

    fn predict_single_user(
        &self,
        work_ids: &[usize],
        params: &SvdKnnUserParams,
    ) -> Result<Vec<f64>> {
        let e = self.embeddings()?;
        check_works(work_ids, e.nb_works())?;
        if params.embedding.len() != e.users.ncols() {
            return Err(Error::DimensionMismatch {
                expected: format!("{} embedding dimensions", e.users.ncols()),
                actual: format!("{} embedding dimensions", params.embedding.len()),
            });
        }
        let averaged = self.average_embedding(e, params.embedding.view());
        Ok(work_ids
            .iter()
            .map(|&work| params.mean + averaged.dot(&e.vt.column(work)) + e.work_means[work])
            .collect())
    }
}
