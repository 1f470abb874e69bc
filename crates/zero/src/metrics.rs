//! Evaluation metrics: RMSE, MAE, DCG@k and NDCG@k
//!
//! Ranking metrics are computed per group (usually one group per user) and
//! averaged over groups. Within a group candidates are sorted by predicted
//! score, best first; the sort is stable so ties keep their input order.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// Cutoff used when a ranking metric is named without `@k`
pub const DEFAULT_RANKING_CUTOFF: usize = 100;

/// Metric label -> value, in label order
pub type MetricsReport = BTreeMap<String, f64>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Metric {
    Rmse,
    Mae,
    Dcg { k: usize },
    Ndcg { k: usize },
}

impl Metric {
    /// Parse a list of metric names, failing on the first unknown one
    pub fn parse_all<S: AsRef<str>>(names: &[S]) -> Result<Vec<Metric>> {
        names.iter().map(|n| n.as_ref().parse()).collect()
    }

    /// Like `FromStr`, but `dcg`/`ndcg` without a cutoff use `default_k`
    pub fn parse_with_cutoff(name: &str, default_k: usize) -> Result<Metric> {
        let name = name.trim().to_ascii_lowercase();
        let (base, k) = match name.split_once('@') {
            Some((base, k)) => {
                let k: usize = k
                    .parse()
                    .map_err(|_| Error::UnsupportedMetric(name.clone()))?;
                if k == 0 {
                    return Err(Error::UnsupportedMetric(name.clone()));
                }
                (base.to_string(), Some(k))
            }
            None => (name.clone(), None),
        };

        match (base.as_str(), k) {
            ("rmse", None) => Ok(Metric::Rmse),
            ("mae", None) => Ok(Metric::Mae),
            ("dcg", k) => Ok(Metric::Dcg {
                k: k.unwrap_or(default_k),
            }),
            ("ndcg", k) => Ok(Metric::Ndcg {
                k: k.unwrap_or(default_k),
            }),
            _ => Err(Error::UnsupportedMetric(name)),
        }
    }

    pub fn is_ranking(&self) -> bool {
        matches!(self, Metric::Dcg { .. } | Metric::Ndcg { .. })
    }
}

impl FromStr for Metric {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Metric::parse_with_cutoff(s, DEFAULT_RANKING_CUTOFF)
    }
}

impl fmt::Display for Metric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Metric::Rmse => write!(f, "rmse"),
            Metric::Mae => write!(f, "mae"),
            Metric::Dcg { k } => write!(f, "dcg@{}", k),
            Metric::Ndcg { k } => write!(f, "ndcg@{}", k),
        }
    }
}

/// Names accepted by `Metric::from_str` (ranking metrics also take `@k`)
pub fn available_evaluation_metrics() -> &'static [&'static str] {
    &["rmse", "mae", "dcg", "ndcg"]
}

/// Compute the requested metrics only
///
/// `groups`, when given, assigns every prediction to a ranking group; without
/// it the whole vector is a single group. Pointwise metrics ignore grouping.
///
/// # Errors
///
/// `DimensionMismatch` when the lengths differ, `EmptyInput` when there is
/// nothing to evaluate.
pub fn compute_metrics(
    metrics: &[Metric],
    y_true: &[f64],
    y_pred: &[f64],
    groups: Option<&[usize]>,
) -> Result<MetricsReport> {
    if y_true.len() != y_pred.len() {
        return Err(Error::DimensionMismatch {
            expected: format!("{} predictions", y_true.len()),
            actual: format!("{} predictions", y_pred.len()),
        });
    }
    if let Some(groups) = groups {
        if groups.len() != y_true.len() {
            return Err(Error::DimensionMismatch {
                expected: format!("{} group labels", y_true.len()),
                actual: format!("{} group labels", groups.len()),
            });
        }
    }
    if y_true.is_empty() {
        return Err(Error::EmptyInput("no predictions to evaluate".to_string()));
    }

    let grouped = metrics
        .iter()
        .any(Metric::is_ranking)
        .then(|| group_indices(y_true.len(), groups));

    let mut report = MetricsReport::new();
    for metric in metrics {
        let value = match *metric {
            Metric::Rmse => rmse(y_true, y_pred),
            Metric::Mae => mae(y_true, y_pred),
            Metric::Dcg { k } | Metric::Ndcg { k } => {
                let normalized = matches!(metric, Metric::Ndcg { .. });
                let grouped = grouped.as_deref().unwrap_or_default();
                let total: f64 = grouped
                    .iter()
                    .map(|indices| {
                        let truth: Vec<f64> = indices.iter().map(|&i| y_true[i]).collect();
                        let pred: Vec<f64> = indices.iter().map(|&i| y_pred[i]).collect();
                        if normalized {
                            ndcg_at_k(&truth, &pred, k)
                        } else {
                            dcg_at_k(&truth, &pred, k)
                        }
                    })
                    .sum();
                total / grouped.len() as f64
            }
        };
        report.insert(metric.to_string(), value);
    }
    Ok(report)
}

pub fn rmse(y_true: &[f64], y_pred: &[f64]) -> f64 {
    let n = y_true.len() as f64;
    let sum: f64 = y_true
        .iter()
        .zip(y_pred)
        .map(|(t, p)| (t - p) * (t - p))
        .sum();
    (sum / n).sqrt()
}

pub fn mae(y_true: &[f64], y_pred: &[f64]) -> f64 {
    let n = y_true.len() as f64;
    y_true.iter().zip(y_pred).map(|(t, p)| (t - p).abs()).sum::<f64>() / n
}

/// DCG of `relevances` ranked by `scores`, truncated at `k`
pub fn dcg_at_k(relevances: &[f64], scores: &[f64], k: usize) -> f64 {
    let mut order: Vec<usize> = (0..relevances.len()).collect();
    order.sort_by(|&a, &b| scores[b].total_cmp(&scores[a]));
    discounted_gain(order.iter().map(|&i| relevances[i]), k)
}

/// DCG normalized by the DCG of the ideal ordering
///
/// A single-item group scores 1.0; a group whose ideal DCG is zero scores 0.0.
pub fn ndcg_at_k(relevances: &[f64], scores: &[f64], k: usize) -> f64 {
    if relevances.len() == 1 {
        return 1.0;
    }
    let ideal = dcg_at_k(relevances, relevances, k);
    if ideal <= 0.0 {
        return 0.0;
    }
    dcg_at_k(relevances, scores, k) / ideal
}

fn discounted_gain(ranked: impl Iterator<Item = f64>, k: usize) -> f64 {
    ranked
        .take(k)
        .enumerate()
        .map(|(i, rel)| (2f64.powf(rel) - 1.0) / ((i + 2) as f64).log2())
        .sum()
}

fn group_indices(len: usize, groups: Option<&[usize]>) -> Vec<Vec<usize>> {
    match groups {
        None => vec![(0..len).collect()],
        Some(groups) => {
            let mut by_group: BTreeMap<usize, Vec<usize>> = BTreeMap::new();
            for (i, &g) in groups.iter().enumerate() {
                by_group.entry(g).or_default().push(i);
            }
            by_group.into_values().collect()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn approx(a: f64, b: f64) -> bool {
        (a - b).abs() < 1e-12
    }

    #[test]
    fn test_parse_metric_names() {
        assert_eq!("rmse".parse::<Metric>().unwrap(), Metric::Rmse);
        assert_eq!("MAE".parse::<Metric>().unwrap(), Metric::Mae);
        assert_eq!("ndcg".parse::<Metric>().unwrap(), Metric::Ndcg { k: 100 });
        assert_eq!("dcg@10".parse::<Metric>().unwrap(), Metric::Dcg { k: 10 });
        assert_eq!(Metric::Ndcg { k: 5 }.to_string(), "ndcg@5");

        for bad in ["auc", "ndcg@", "ndcg@0", "rmse@3", ""] {
            assert!(
                matches!(bad.parse::<Metric>(), Err(Error::UnsupportedMetric(_))),
                "{} should be rejected",
                bad
            );
        }
    }

    #[test]
    fn test_parse_with_configured_cutoff() {
        assert_eq!(
            Metric::parse_with_cutoff("ndcg", 10).unwrap(),
            Metric::Ndcg { k: 10 }
        );
        assert_eq!(
            Metric::parse_with_cutoff("ndcg@3", 10).unwrap(),
            Metric::Ndcg { k: 3 }
        );
    }

    #[test]
    fn test_pointwise_metrics() {
        let y_true = [1.0, 2.0, 3.0, 4.0];
        let y_pred = [1.0, 3.0, 3.0, 2.0];
        let report =
            compute_metrics(&[Metric::Rmse, Metric::Mae], &y_true, &y_pred, None).unwrap();

        assert!(approx(report["rmse"], (5.0f64 / 4.0).sqrt()));
        assert!(approx(report["mae"], 0.75));
        assert_eq!(report.len(), 2);
    }

    #[test]
    fn test_only_requested_metrics() {
        let report = compute_metrics(&[Metric::Mae], &[1.0], &[2.0], None).unwrap();
        assert_eq!(report.keys().collect::<Vec<_>>(), vec!["mae"]);
    }

    #[test]
    fn test_ndcg_ideal_ordering_is_one() {
        let relevances = [3.0, 2.0, 3.0, 0.0, 1.0, 2.0];
        let scores = [6.0, 3.0, 5.0, 1.0, 2.0, 4.0];
        for k in 1..=relevances.len() {
            assert!(approx(ndcg_at_k(&relevances, &scores, k), 1.0), "k = {}", k);
        }
    }

    #[test]
    fn test_ndcg_reversed_ordering_below_one() {
        let relevances = [3.0, 2.0, 1.0];
        let scores = [1.0, 2.0, 3.0];
        assert!(ndcg_at_k(&relevances, &scores, 3) < 1.0);
    }

    #[test]
    fn test_dcg_known_value() {
        // ranking: rel 3, rel 1 -> 7/1 + 1/log2(3)
        let dcg = dcg_at_k(&[1.0, 3.0], &[0.2, 0.9], 2);
        assert!(approx(dcg, 7.0 + 1.0 / 3f64.log2()));
        assert!(approx(dcg_at_k(&[1.0, 3.0], &[0.2, 0.9], 1), 7.0));
    }

    #[test]
    fn test_ndcg_degenerate_groups() {
        assert_eq!(ndcg_at_k(&[0.0], &[0.5], 10), 1.0);
        assert_eq!(ndcg_at_k(&[4.0], &[0.5], 10), 1.0);
        assert_eq!(ndcg_at_k(&[0.0, 0.0, 0.0], &[0.1, 0.2, 0.3], 10), 0.0);
    }

    #[test]
    fn test_ties_keep_input_order() {
        // equal scores: first input item is ranked first
        let dcg = dcg_at_k(&[0.0, 1.0], &[1.0, 1.0], 1);
        assert_eq!(dcg, 0.0);
    }

    #[test]
    fn test_grouped_ndcg_is_averaged() {
        let y_true = [3.0, 1.0, 1.0, 3.0];
        let y_pred = [0.9, 0.1, 0.9, 0.1];
        let groups = [0, 0, 1, 1];

        let report =
            compute_metrics(&[Metric::Ndcg { k: 2 }], &y_true, &y_pred, Some(&groups)).unwrap();
        let second = ndcg_at_k(&[1.0, 3.0], &[0.9, 0.1], 2);
        assert!(approx(report["ndcg@2"], (1.0 + second) / 2.0));
    }

    #[test]
    fn test_errors() {
        assert!(matches!(
            compute_metrics(&[Metric::Rmse], &[1.0, 2.0], &[1.0], None),
            Err(Error::DimensionMismatch { .. })
        ));
        assert!(matches!(
            compute_metrics(&[Metric::Rmse], &[], &[], None),
            Err(Error::EmptyInput(_))
        ));
        assert!(matches!(
            compute_metrics(&[Metric::Ndcg { k: 3 }], &[1.0], &[1.0], Some(&[0, 1])),
            Err(Error::DimensionMismatch { .. })
        ));
    }

    #[test]
    fn test_available_metrics_parse() {
        for name in available_evaluation_metrics() {
            assert!(name.parse::<Metric>().is_ok());
        }
    }
}
