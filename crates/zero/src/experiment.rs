//! Shuffle-split comparison of several algorithm configurations
//!
//! An experiment file lists configurations as `[name]` or
//! `[name, {hyperparameters}]` entries:
//!
//! ```json
//! {
//!   "configurations": [["als", {"nb_components": 10}], ["zero"]],
//!   "metrics": ["rmse", "ndcg@10"],
//!   "nb_splits": 5,
//!   "test_fraction": 0.1,
//!   "seed": 42
//! }
//! ```
//!
//! Configurations are evaluated in parallel on rayon worker threads, each on
//! its own fresh instances. A failing configuration is recorded in the report
//! and does not stop the others.

use crate::dataset::AnonymizedData;
use crate::error::{Error, Result};
use crate::hyperparameters::Hyperparameters;
use crate::metrics::{self, Metric, MetricsReport, DEFAULT_RANKING_CUTOFF};
use crate::registry::AlgorithmRegistry;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;
use std::time::Instant;
use tracing::{debug, info, warn};

/// Confidence multiplier of the reported half-width (95%)
const CONFIDENCE_Z: f64 = 1.96;

/// Split seed when neither the file nor the caller sets one
pub const DEFAULT_SEED: u64 = 42;

fn default_metrics() -> Vec<String> {
    vec!["rmse".to_string()]
}

fn default_nb_splits() -> usize {
    5
}

fn default_test_fraction() -> f64 {
    0.1
}

fn default_full_cv() -> bool {
    true
}

/// One algorithm configuration: registry name plus overrides
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(from = "ConfigurationEntry")]
pub struct AlgorithmSpec {
    pub name: String,
    pub overrides: Hyperparameters,
}

impl AlgorithmSpec {
    pub fn new(name: &str, overrides: Hyperparameters) -> Self {
        Self {
            name: name.to_string(),
            overrides,
        }
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum ConfigurationEntry {
    WithParams((String, Hyperparameters)),
    Named((String,)),
    Bare(String),
}

impl From<ConfigurationEntry> for AlgorithmSpec {
    fn from(entry: ConfigurationEntry) -> Self {
        match entry {
            ConfigurationEntry::WithParams((name, overrides)) => Self { name, overrides },
            ConfigurationEntry::Named((name,)) | ConfigurationEntry::Bare(name) => Self {
                name,
                overrides: Hyperparameters::new(),
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ExperimentConfig {
    pub configurations: Vec<AlgorithmSpec>,
    #[serde(default = "default_metrics")]
    pub metrics: Vec<String>,
    #[serde(default = "default_nb_splits")]
    pub nb_splits: usize,
    #[serde(default = "default_test_fraction")]
    pub test_fraction: f64,
    #[serde(default)]
    pub seed: Option<u64>,
    /// Run every split; only the first one otherwise
    #[serde(default = "default_full_cv")]
    pub full_cv: bool,
    /// Cutoff for `dcg`/`ndcg` given without `@k`
    #[serde(default)]
    pub ranking_cutoff: Option<usize>,
}

impl ExperimentConfig {
    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json)
            .map_err(|e| Error::InvalidInput(format!("malformed experiment file: {}", e)))
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        Self::from_json(&std::fs::read_to_string(path)?)
    }
}

/// Mean, variance and 95% half-width of one metric over the passes
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct MetricSummary {
    pub mean: f64,
    pub variance: f64,
    pub half_width: f64,
    pub nb_passes: usize,
}

impl MetricSummary {
    pub fn from_values(values: &[f64]) -> Option<Self> {
        let mean = zero_core::math::mean(values)?;
        let variance = zero_core::math::variance(values)?;
        Some(Self {
            mean,
            variance,
            half_width: CONFIDENCE_Z * (variance / values.len() as f64).sqrt(),
            nb_passes: values.len(),
        })
    }
}

/// Result of one configuration across all passes
#[derive(Debug, Clone, Serialize)]
pub struct AlgorithmOutcome {
    pub name: String,
    pub shortname: Option<String>,
    pub passes: Vec<MetricsReport>,
    pub summary: BTreeMap<String, MetricSummary>,
    pub error: Option<String>,
}

impl AlgorithmOutcome {
    pub fn succeeded(&self) -> bool {
        self.error.is_none()
    }

    fn label(&self) -> &str {
        self.shortname.as_deref().unwrap_or(&self.name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ReportStyle {
    /// `mean=… var=… std=…`
    #[default]
    Plain,
    /// `mean ± half-width`, rounded to 6 digits
    Fancy,
}

#[derive(Debug, Clone, Serialize)]
pub struct ExperimentReport {
    pub outcomes: Vec<AlgorithmOutcome>,
    pub nb_passes: usize,
}

impl ExperimentReport {
    pub fn outcome(&self, label: &str) -> Option<&AlgorithmOutcome> {
        self.outcomes
            .iter()
            .find(|o| o.label() == label || o.name == label)
    }

    pub fn render(&self, style: ReportStyle) -> String {
        let mut by_metric: BTreeMap<&str, Vec<(&str, &MetricSummary)>> = BTreeMap::new();
        for outcome in &self.outcomes {
            for (metric, summary) in &outcome.summary {
                by_metric
                    .entry(metric.as_str())
                    .or_default()
                    .push((outcome.label(), summary));
            }
        }

        let mut out = String::new();
        for (metric, rows) in by_metric {
            out.push_str(&format!("Evaluation of {}:\n", metric.to_uppercase()));
            for (label, s) in rows {
                let line = match style {
                    _ if s.nb_passes < 2 => format!("[{}]: {:.6}", label, s.mean),
                    ReportStyle::Plain => format!(
                        "[{}] mean={:.6} var={:.6} std={:.6}",
                        label, s.mean, s.variance, s.half_width
                    ),
                    ReportStyle::Fancy => {
                        format!("[{}] {:.5} ± {:.5}", label, s.mean, s.half_width)
                    }
                };
                out.push_str(&line);
                out.push('\n');
            }
        }
        for outcome in self.outcomes.iter().filter(|o| !o.succeeded()) {
            out.push_str(&format!(
                "[{}] failed: {}\n",
                outcome.label(),
                outcome.error.as_deref().unwrap_or_default()
            ));
        }
        out
    }
}

impl fmt::Display for ExperimentReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.render(ReportStyle::Plain))
    }
}

struct Pass {
    train: AnonymizedData,
    test: AnonymizedData,
}

#[derive(Debug, Clone)]
pub struct Experiment {
    config: ExperimentConfig,
    metrics: Vec<Metric>,
}

impl Experiment {
    /// Validate the configuration and parse its metric names
    pub fn new(config: ExperimentConfig) -> Result<Self> {
        let cutoff = config.ranking_cutoff.unwrap_or(DEFAULT_RANKING_CUTOFF);
        let metrics = config
            .metrics
            .iter()
            .map(|name| Metric::parse_with_cutoff(name, cutoff))
            .collect::<Result<Vec<_>>>()?;
        if metrics.is_empty() {
            return Err(Error::InvalidInput("no evaluation metric requested".to_string()));
        }
        if config.nb_splits == 0 {
            return Err(Error::InvalidInput("nb_splits must be at least 1".to_string()));
        }
        Ok(Self { config, metrics })
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        Self::new(ExperimentConfig::from_file(path)?)
    }

    pub fn config(&self) -> &ExperimentConfig {
        &self.config
    }

    pub fn metrics(&self) -> &[Metric] {
        &self.metrics
    }

    /// Evaluate every configuration on every pass
    ///
    /// # Errors
    ///
    /// Only for problems with the data itself (e.g. too few events to
    /// split); algorithm failures are reported per outcome.
    pub fn run(&self, registry: &AlgorithmRegistry, data: &AnonymizedData) -> Result<ExperimentReport> {
        if self.config.configurations.is_empty() {
            warn!("No algorithms specified in this experiment, stopping early");
            return Ok(ExperimentReport {
                outcomes: Vec::new(),
                nb_passes: 0,
            });
        }

        let mut splits = data.shuffle_split(
            self.config.nb_splits,
            self.config.test_fraction,
            self.config.seed.unwrap_or(DEFAULT_SEED),
        )?;
        if !self.config.full_cv {
            splits.truncate(1);
        }
        let passes = splits
            .iter()
            .map(|split| {
                Ok(Pass {
                    train: data.subset(&split.train)?,
                    test: data.subset(&split.test)?,
                })
            })
            .collect::<Result<Vec<_>>>()?;

        info!(
            nb_algorithms = self.config.configurations.len(),
            nb_passes = passes.len(),
            nb_ratings = data.len(),
            "Starting comparison"
        );

        let outcomes = self
            .config
            .configurations
            .par_iter()
            .map(|spec| self.evaluate(registry, spec, &passes))
            .collect();

        Ok(ExperimentReport {
            outcomes,
            nb_passes: passes.len(),
        })
    }

    fn evaluate(&self, registry: &AlgorithmRegistry, spec: &AlgorithmSpec, passes: &[Pass]) -> AlgorithmOutcome {
        let mut outcome = AlgorithmOutcome {
            name: spec.name.clone(),
            shortname: None,
            passes: Vec::with_capacity(passes.len()),
            summary: BTreeMap::new(),
            error: None,
        };

        for (index, pass) in passes.iter().enumerate() {
            match self.evaluate_pass(registry, spec, pass, index + 1, passes.len()) {
                Ok((shortname, report)) => {
                    outcome.shortname = Some(shortname);
                    outcome.passes.push(report);
                }
                Err(e) => {
                    warn!(algorithm = %spec.name, pass = index + 1, error = %e, "Algorithm failed");
                    outcome.error = Some(e.to_string());
                    break;
                }
            }
        }

        let mut values: BTreeMap<String, Vec<f64>> = BTreeMap::new();
        for report in &outcome.passes {
            for (metric, value) in report {
                values.entry(metric.clone()).or_default().push(*value);
            }
        }
        outcome.summary = values
            .into_iter()
            .filter_map(|(metric, v)| MetricSummary::from_values(&v).map(|s| (metric, s)))
            .collect();
        outcome
    }

    fn evaluate_pass(
        &self,
        registry: &AlgorithmRegistry,
        spec: &AlgorithmSpec,
        pass: &Pass,
        index: usize,
        nb_passes: usize,
    ) -> Result<(String, MetricsReport)> {
        let mut model = registry.instantiate(&spec.name, &spec.overrides)?;
        let shortname = model.shortname();
        let start = Instant::now();
        info!(algorithm = %shortname, pass = index, nb_passes = nb_passes, "Fitting");

        model.fit(&pass.train)?;
        let pairs = pass.test.pairs();
        let predictions = model.predict(&pairs)?;
        let groups: Vec<usize> = pairs.iter().map(|&(user, _)| user).collect();
        let y_true = pass.test.y().to_vec();
        let report = metrics::compute_metrics(
            &self.metrics,
            &y_true,
            &predictions,
            Some(&groups),
        )?;

        debug!(
            algorithm = %shortname,
            pass = index,
            elapsed_ms = start.elapsed().as_millis() as u64,
            "Pass evaluated"
        );
        Ok((shortname, report))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_configuration_entries() {
        let config = ExperimentConfig::from_json(
            r#"{"configurations": [["als", {"nb_components": 10}], ["zero"], "knn"],
                "metrics": ["rmse", "ndcg@5"], "nb_splits": 3}"#,
        )
        .unwrap();

        assert_eq!(config.configurations.len(), 3);
        assert_eq!(config.configurations[0].name, "als");
        assert_eq!(
            config.configurations[0]
                .overrides
                .get_usize("nb_components", 0)
                .unwrap(),
            10
        );
        assert_eq!(config.configurations[1], AlgorithmSpec::new("zero", Hyperparameters::new()));
        assert_eq!(config.configurations[2].name, "knn");
        assert_eq!(config.nb_splits, 3);
        assert_eq!(config.test_fraction, 0.1);
        assert_eq!(config.seed, None);
        assert!(config.full_cv);
    }

    #[test]
    fn test_malformed_experiment_file() {
        assert!(matches!(
            ExperimentConfig::from_json(r#"{"metrics": ["rmse"]}"#),
            Err(Error::InvalidInput(_))
        ));
    }

    #[test]
    fn test_unknown_metric_rejected() {
        let config = ExperimentConfig::from_json(
            r#"{"configurations": [["zero"]], "metrics": ["accuracy"]}"#,
        )
        .unwrap();
        assert!(matches!(
            Experiment::new(config),
            Err(Error::UnsupportedMetric(_))
        ));
    }

    #[test]
    fn test_ranking_cutoff_applies_to_bare_names() {
        let config = ExperimentConfig::from_json(
            r#"{"configurations": [], "metrics": ["ndcg", "dcg@3"], "ranking_cutoff": 10}"#,
        )
        .unwrap();
        let experiment = Experiment::new(config).unwrap();
        assert_eq!(
            experiment.metrics(),
            &[Metric::Ndcg { k: 10 }, Metric::Dcg { k: 3 }]
        );
    }

    #[test]
    fn test_metric_summary() {
        let summary = MetricSummary::from_values(&[1.0, 2.0, 3.0, 4.0]).unwrap();
        assert_eq!(summary.mean, 2.5);
        assert_eq!(summary.variance, 1.25);
        assert!((summary.half_width - 1.96 * (1.25f64 / 4.0).sqrt()).abs() < 1e-12);
        assert!(MetricSummary::from_values(&[]).is_none());
    }

    #[test]
    fn test_render_styles() {
        let mut summary = BTreeMap::new();
        summary.insert(
            "rmse".to_string(),
            MetricSummary::from_values(&[1.0, 1.5]).unwrap(),
        );
        let report = ExperimentReport {
            outcomes: vec![
                AlgorithmOutcome {
                    name: "als".to_string(),
                    shortname: Some("als-20".to_string()),
                    passes: Vec::new(),
                    summary,
                    error: None,
                },
                AlgorithmOutcome {
                    name: "nmf".to_string(),
                    shortname: None,
                    passes: Vec::new(),
                    summary: BTreeMap::new(),
                    error: Some("boom".to_string()),
                },
            ],
            nb_passes: 2,
        };

        let plain = report.to_string();
        assert!(plain.contains("Evaluation of RMSE:"));
        assert!(plain.contains("[als-20] mean=1.250000"));
        assert!(plain.contains("[nmf] failed: boom"));

        let fancy = report.render(ReportStyle::Fancy);
        assert!(fancy.contains("[als-20] 1.25000 ±"));
        assert!(report.outcome("als").is_some());
    }
}
