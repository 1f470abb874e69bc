//! Gradient boosted regression trees over rating statistics
//!
//! Each `(user, work)` pair is described by the user mean, the work mean, the
//! log rating counts of both and, when the dataset has side information, the
//! work's feature row. Trees are fitted to squared-loss residuals and summed
//! with shrinkage `learning_rate`.

use super::shortname_with;
use crate::algorithm::{check_pairs, CancelToken, RecommendationAlgorithm};
use crate::dataset::AnonymizedData;
use crate::error::{Error, Result};
use crate::hyperparameters::{require_positive, Hyperparameters};
use crate::snapshot::{wrong_state, ModelState, StoredMatrix};
use ndarray::{Array1, Array2};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use zero_core::observability::fit_span;

pub const NAME: &str = "gbr";

const MIN_GAIN: f64 = 1e-12;

#[derive(Debug, Clone, PartialEq)]
pub struct GbrConfig {
    pub nb_estimators: usize,
    pub learning_rate: f64,
    pub max_depth: usize,
    pub min_samples_leaf: usize,
}

impl Default for GbrConfig {
    fn default() -> Self {
        Self {
            nb_estimators: 50,
            learning_rate: 0.1,
            max_depth: 3,
            min_samples_leaf: 1,
        }
    }
}

impl GbrConfig {
    pub fn from_hyperparameters(params: &Hyperparameters) -> Result<Self> {
        let defaults = Self::default();
        let config = Self {
            nb_estimators: params.get_usize("nb_estimators", defaults.nb_estimators)?,
            learning_rate: params.get_f64("learning_rate", defaults.learning_rate)?,
            max_depth: params.get_usize("max_depth", defaults.max_depth)?,
            min_samples_leaf: params.get_usize("min_samples_leaf", defaults.min_samples_leaf)?,
        };
        require_positive("nb_estimators", config.nb_estimators as f64)?;
        require_positive("learning_rate", config.learning_rate)?;
        require_positive("min_samples_leaf", config.min_samples_leaf as f64)?;
        Ok(config)
    }

    pub fn to_hyperparameters(&self) -> Hyperparameters {
        Hyperparameters::new()
            .with("nb_estimators", self.nb_estimators)
            .with("learning_rate", self.learning_rate)
            .with("max_depth", self.max_depth)
            .with("min_samples_leaf", self.min_samples_leaf)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum TreeNode {
    Leaf {
        value: f64,
    },
    Split {
        feature: usize,
        threshold: f64,
        left: usize,
        right: usize,
    },
}

/// Binary regression tree; node 0 is the root
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegressionTree {
    nodes: Vec<TreeNode>,
}

impl RegressionTree {
    pub fn predict(&self, row: &[f64]) -> f64 {
        let mut idx = 0;
        loop {
            match self.nodes.get(idx) {
                Some(TreeNode::Leaf { value }) => return *value,
                Some(TreeNode::Split {
                    feature,
                    threshold,
                    left,
                    right,
                }) => {
                    idx = if row.get(*feature).copied().unwrap_or(0.0) <= *threshold {
                        *left
                    } else {
                        *right
                    };
                }
                None => return 0.0,
            }
        }
    }

    /// Require a root and children stored after their parent
    ///
    /// Trees grown by `fit` always satisfy this; it guarantees that `predict`
    /// and `depth` terminate on trees read back from a snapshot.
    pub fn validate(&self) -> Result<()> {
        if self.nodes.is_empty() {
            return Err(Error::IncompatibleSnapshot("regression tree without a root".to_string()));
        }
        for (idx, node) in self.nodes.iter().enumerate() {
            if let TreeNode::Split { left, right, .. } = *node {
                for child in [left, right] {
                    if child <= idx || child >= self.nodes.len() {
                        return Err(Error::IncompatibleSnapshot(format!(
                            "node {} points to node {} in a tree of {} nodes",
                            idx,
                            child,
                            self.nodes.len()
                        )));
                    }
                }
            }
        }
        Ok(())
    }

    pub fn depth(&self) -> usize {
        fn walk(nodes: &[TreeNode], idx: usize) -> usize {
            match nodes.get(idx) {
                Some(TreeNode::Split { left, right, .. }) => {
                    1 + walk(nodes, *left).max(walk(nodes, *right))
                }
                _ => 0,
            }
        }
        walk(&self.nodes, 0)
    }

    fn fit(x: &Array2<f64>, targets: &[f64], max_depth: usize, min_samples_leaf: usize) -> Self {
        let mut tree = Self { nodes: Vec::new() };
        let indices: Vec<usize> = (0..targets.len()).collect();
        tree.grow(x, targets, indices, 0, max_depth, min_samples_leaf);
        tree
    }

    fn grow(
        &mut self,
        x: &Array2<f64>,
        targets: &[f64],
        indices: Vec<usize>,
        depth: usize,
        max_depth: usize,
        min_samples_leaf: usize,
    ) -> usize {
        let node = self.nodes.len();
        let value = indices.iter().map(|&i| targets[i]).sum::<f64>() / indices.len().max(1) as f64;
        self.nodes.push(TreeNode::Leaf { value });

        if depth >= max_depth || indices.len() < 2 * min_samples_leaf {
            return node;
        }
        let Some((feature, threshold)) = best_split(x, targets, &indices, min_samples_leaf) else {
            return node;
        };

        let (left_rows, right_rows): (Vec<usize>, Vec<usize>) = indices
            .into_iter()
            .partition(|&i| x[[i, feature]] <= threshold);
        let left = self.grow(x, targets, left_rows, depth + 1, max_depth, min_samples_leaf);
        let right = self.grow(x, targets, right_rows, depth + 1, max_depth, min_samples_leaf);
        self.nodes[node] = TreeNode::Split {
            feature,
            threshold,
            left,
            right,
        };
        node
    }
}

/// Variance-reduction split over every feature, `None` if nothing helps
fn best_split(
    x: &Array2<f64>,
    targets: &[f64],
    indices: &[usize],
    min_samples_leaf: usize,
) -> Option<(usize, f64)> {
    let n = indices.len();
    let total: f64 = indices.iter().map(|&i| targets[i]).sum();
    let base = total * total / n as f64;
    let mut best: Option<(f64, usize, f64)> = None;

    for feature in 0..x.ncols() {
        let mut sorted = indices.to_vec();
        sorted.sort_by(|&a, &b| x[[a, feature]].total_cmp(&x[[b, feature]]));

        let mut left_sum = 0.0;
        for pos in 0..n - 1 {
            left_sum += targets[sorted[pos]];
            let nb_left = pos + 1;
            let nb_right = n - nb_left;
            let here = x[[sorted[pos], feature]];
            let next = x[[sorted[pos + 1], feature]];
            if here == next || nb_left < min_samples_leaf || nb_right < min_samples_leaf {
                continue;
            }
            let right_sum = total - left_sum;
            let gain = left_sum * left_sum / nb_left as f64 + right_sum * right_sum / nb_right as f64
                - base;
            if gain > MIN_GAIN && best.map_or(true, |(g, _, _)| gain > g) {
                best = Some((gain, feature, (here + next) / 2.0));
            }
        }
    }
    best.map(|(_, feature, threshold)| (feature, threshold))
}

/// Per-user and per-work statistics used as tree inputs
#[derive(Debug, Clone)]
struct Statistics {
    user_means: Vec<f64>,
    user_counts: Vec<usize>,
    work_means: Vec<f64>,
    work_counts: Vec<usize>,
}

impl Statistics {
    fn from_data(data: &AnonymizedData, global_mean: f64) -> Self {
        let summarize = |groups: Vec<Vec<(usize, f64)>>| -> (Vec<f64>, Vec<usize>) {
            groups
                .iter()
                .map(|entries| {
                    let ratings: Vec<f64> = entries.iter().map(|&(_, r)| r).collect();
                    (
                        zero_core::math::mean(&ratings).unwrap_or(global_mean),
                        ratings.len(),
                    )
                })
                .unzip()
        };
        let (user_means, user_counts) = summarize(data.by_user());
        let (work_means, work_counts) = summarize(data.by_work());
        Self {
            user_means,
            user_counts,
            work_means,
            work_counts,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GbrState {
    pub base: f64,
    pub trees: Vec<RegressionTree>,
    pub user_means: Vec<f64>,
    pub user_counts: Vec<usize>,
    pub work_means: Vec<f64>,
    pub work_counts: Vec<usize>,
    pub item_features: Option<StoredMatrix>,
}

#[derive(Debug, Clone)]
struct Ensemble {
    base: f64,
    trees: Vec<RegressionTree>,
    stats: Statistics,
    item_features: Option<Array2<f64>>,
}

impl Ensemble {
    fn row(&self, user: usize, work: usize) -> Vec<f64> {
        let mut row = vec![
            self.stats.user_means[user],
            self.stats.work_means[work],
            (self.stats.user_counts[user] as f64).ln_1p(),
            (self.stats.work_counts[work] as f64).ln_1p(),
        ];
        if let Some(features) = &self.item_features {
            row.extend(features.row(work).iter().copied());
        }
        row
    }

    fn predict_row(&self, row: &[f64], learning_rate: f64) -> f64 {
        self.base + learning_rate * self.trees.iter().map(|t| t.predict(row)).sum::<f64>()
    }
}

#[derive(Debug, Clone)]
pub struct Gbr {
    config: GbrConfig,
    fitted: Option<Ensemble>,
}

impl Gbr {
    pub fn new(config: GbrConfig) -> Self {
        Self {
            config,
            fitted: None,
        }
    }

    pub fn from_hyperparameters(params: &Hyperparameters) -> Result<Self> {
        Ok(Self::new(GbrConfig::from_hyperparameters(params)?))
    }

    pub fn trees(&self) -> Option<&[RegressionTree]> {
        self.fitted.as_ref().map(|e| e.trees.as_slice())
    }

    fn ensemble(&self) -> Result<&Ensemble> {
        self.fitted
            .as_ref()
            .ok_or_else(|| Error::NotFitted(self.shortname()))
    }

    fn train(&self, data: &AnonymizedData, cancel: &CancelToken) -> Result<Ensemble> {
        let base = data
            .global_mean()
            .ok_or_else(|| Error::EmptyInput("no ratings to boost on".to_string()))?;
        let mut ensemble = Ensemble {
            base,
            trees: Vec::with_capacity(self.config.nb_estimators),
            stats: Statistics::from_data(data, base),
            item_features: data.item_features().cloned(),
        };

        let rows: Vec<Vec<f64>> = data.iter().map(|(u, i, _)| ensemble.row(u, i)).collect();
        let nb_columns = rows.first().map_or(0, Vec::len);
        let x = Array2::from_shape_vec((rows.len(), nb_columns), rows.concat())
            .map_err(|e| Error::NumericalFailure(format!("feature matrix: {}", e)))?;
        let y: Vec<f64> = data.y().to_vec();
        let mut current = Array1::from_elem(y.len(), base);

        for round in 0..self.config.nb_estimators {
            cancel.check()?;
            let residuals: Vec<f64> = y.iter().zip(current.iter()).map(|(t, p)| t - p).collect();
            let tree = RegressionTree::fit(
                &x,
                &residuals,
                self.config.max_depth,
                self.config.min_samples_leaf,
            );
            for (k, row) in x.rows().into_iter().enumerate() {
                if let Some(slice) = row.as_slice() {
                    current[k] += self.config.learning_rate * tree.predict(slice);
                }
            }
            ensemble.trees.push(tree);

            if round % 10 == 0 {
                let mse = residuals.iter().map(|r| r * r).sum::<f64>() / residuals.len() as f64;
                debug!(algorithm = NAME, round = round, rmse = mse.sqrt(), "Boosting round");
            }
        }

        Ok(ensemble)
    }
}

impl RecommendationAlgorithm for Gbr {
    fn name(&self) -> &'static str {
        NAME
    }

    fn shortname(&self) -> String {
        shortname_with(NAME, self.config.nb_estimators)
    }

    fn hyperparameters(&self) -> Hyperparameters {
        self.config.to_hyperparameters()
    }

    fn nb_components(&self) -> Option<usize> {
        Some(self.config.nb_estimators)
    }

    fn dimensions(&self) -> Option<(usize, usize)> {
        self.fitted
            .as_ref()
            .map(|e| (e.stats.user_means.len(), e.stats.work_means.len()))
    }

    fn fit_with_cancel(&mut self, data: &AnonymizedData, cancel: &CancelToken) -> Result<()> {
        self.fitted = None;
        let span = fit_span(&self.shortname(), data.nb_users(), data.nb_works());
        let _guard = span.enter();
        info!(nb_ratings = data.len(), "Fitting gradient boosted trees");

        let ensemble = self.train(data, cancel)?;
        self.fitted = Some(ensemble);
        info!("GBR fit complete");
        Ok(())
    }

    fn predict(&self, pairs: &[(usize, usize)]) -> Result<Vec<f64>> {
        let e = self.ensemble()?;
        let (nb_users, nb_works) = (e.stats.user_means.len(), e.stats.work_means.len());
        check_pairs(pairs, nb_users, nb_works)?;
        Ok(pairs
            .iter()
            .map(|&(u, i)| e.predict_row(&e.row(u, i), self.config.learning_rate))
            .collect())
    }

    fn is_serializable(&self) -> bool {
        true
    }

    fn export_state(&self) -> Result<ModelState> {
        let e = self.ensemble()?;
        Ok(ModelState::Gbr(GbrState {
            base: e.base,
            trees: e.trees.clone(),
            user_means: e.stats.user_means.clone(),
            user_counts: e.stats.user_counts.clone(),
            work_means: e.stats.work_means.clone(),
            work_counts: e.stats.work_counts.clone(),
            item_features: e.item_features.as_ref().map(StoredMatrix::from_array),
        }))
    }

    fn restore_state(&mut self, state: ModelState) -> Result<()> {
        let state = match state {
            ModelState::Gbr(state) => state,
            other => return Err(wrong_state(NAME, &other)),
        };
        if state.user_counts.len() != state.user_means.len()
            || state.work_counts.len() != state.work_means.len()
        {
            return Err(Error::IncompatibleSnapshot(
                "rating statistics have inconsistent lengths".to_string(),
            ));
        }
        for tree in &state.trees {
            tree.validate()?;
        }
        let nb_works = state.work_means.len();
        let item_features = state
            .item_features
            .map(|m| {
                let cols = m.cols;
                m.into_array_shaped(nb_works, cols)
            })
            .transpose()?;
        self.fitted = Some(Ensemble {
            base: state.base,
            trees: state.trees,
            stats: Statistics {
                user_means: state.user_means,
                user_counts: state.user_counts,
                work_means: state.work_means,
                work_counts: state.work_counts,
            },
            item_features,
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::rmse;
    use ndarray::array;

    #[test]
    fn test_tree_learns_step_function() {
        let x = array![[0.0], [1.0], [2.0], [3.0], [4.0], [5.0]];
        let y = [1.0, 1.0, 1.0, 4.0, 4.0, 4.0];
        let tree = RegressionTree::fit(&x, &y, 1, 1);

        assert_eq!(tree.depth(), 1);
        assert_eq!(tree.predict(&[0.5]), 1.0);
        assert_eq!(tree.predict(&[4.5]), 4.0);
        assert_eq!(tree.predict(&[2.4]), 1.0);
        assert_eq!(tree.predict(&[2.6]), 4.0);
    }

    #[test]
    fn test_validate_rejects_cycles_and_dangling_children() {
        let x = array![[0.0], [1.0], [2.0], [3.0]];
        assert!(RegressionTree::fit(&x, &[1.0, 1.0, 3.0, 3.0], 2, 1).validate().is_ok());

        let split = |left, right| TreeNode::Split {
            feature: 0,
            threshold: 100.0,
            left,
            right,
        };
        let leaf = TreeNode::Leaf { value: 1.0 };
        for nodes in [
            vec![],
            vec![split(0, 0)],
            vec![split(1, 2), leaf.clone(), split(0, 1)],
            vec![split(1, 7), leaf.clone()],
        ] {
            assert!(matches!(
                RegressionTree { nodes }.validate(),
                Err(Error::IncompatibleSnapshot(_))
            ));
        }
    }

    #[test]
    fn test_tree_respects_depth_and_constant_targets() {
        let x = array![[0.0, 1.0], [1.0, 0.0], [2.0, 1.0], [3.0, 0.0]];
        let tree = RegressionTree::fit(&x, &[2.0, 2.0, 2.0, 2.0], 3, 1);
        assert_eq!(tree.depth(), 0);
        assert_eq!(tree.predict(&[10.0, 10.0]), 2.0);

        let tree = RegressionTree::fit(&x, &[1.0, 2.0, 3.0, 4.0], 0, 1);
        assert_eq!(tree.depth(), 0);
        assert_eq!(tree.predict(&[0.0, 0.0]), 2.5);
    }

    #[test]
    fn test_boosting_beats_global_mean() {
        let mut triplets = Vec::new();
        for user in 0..10 {
            for item in 0..8 {
                if (user + item) % 3 == 0 {
                    continue;
                }
                let rating = if user < 5 { 4.0 } else { 2.0 } + if item % 2 == 0 { 1.0 } else { 0.0 };
                triplets.push((user, item, rating));
            }
        }
        let data = AnonymizedData::from_triplets(&triplets, 10, 8).unwrap();
        let mut gbr = Gbr::new(GbrConfig::default());
        gbr.fit(&data).unwrap();

        let y = data.y().to_vec();
        let mean = data.global_mean().unwrap();
        let baseline = rmse(&y, &vec![mean; y.len()]);
        assert!(rmse(&y, &gbr.predict(&data.pairs()).unwrap()) < baseline / 2.0);
        assert_eq!(gbr.trees().unwrap().len(), 50);
        assert_eq!(gbr.shortname(), "gbr-50");
    }

    #[test]
    fn test_uses_item_features_when_present() {
        let data = AnonymizedData::from_triplets(
            &[(0, 0, 5.0), (0, 1, 1.0), (1, 0, 5.0), (1, 1, 1.0)],
            2,
            2,
        )
        .unwrap()
        .with_item_features(array![[1.0], [0.0]])
        .unwrap();
        let mut gbr = Gbr::new(GbrConfig::default());
        gbr.fit(&data).unwrap();

        let ensemble = gbr.ensemble().unwrap();
        assert_eq!(ensemble.row(0, 0).len(), 5);
        let predicted = gbr.predict(&[(0, 0), (0, 1)]).unwrap();
        assert!(predicted[0] > predicted[1]);
    }
}
