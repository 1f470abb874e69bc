//! zero-compare: cross-validated comparison of recommendation algorithms
//!
//! ```bash
//! zero-compare run ratings.csv --experiment experiment.json --fancy
//! zero-compare list
//! ```

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing::info;
use zero::experiment::{Experiment, ExperimentConfig, ReportStyle};
use zero::metrics::available_evaluation_metrics;
use zero::{AlgorithmRegistry, Dataset};
use zero_core::{init_logging, load_dotenv, ConfigLoader, LogConfig, ZeroConfig};

#[derive(Parser)]
#[command(name = "zero-compare")]
#[command(about = "Compare collaborative filtering algorithms on a rating dataset", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run an experiment file against a dataset
    Run {
        /// Anonymized CSV with user, item and rating columns
        dataset: PathBuf,

        /// JSON experiment file
        #[arg(short, long)]
        experiment: PathBuf,

        /// Item side information CSV (item column followed by features)
        #[arg(long)]
        features: Option<PathBuf>,

        /// Override the number of shuffle splits
        #[arg(long)]
        nb_splits: Option<usize>,

        /// Override the split seed (default: experiment file, then ZERO_RANDOM_SEED)
        #[arg(long)]
        seed: Option<u64>,

        /// Override the metrics, e.g. --metric rmse --metric ndcg@10
        #[arg(long = "metric")]
        metrics: Vec<String>,

        /// Evaluate on the first split only
        #[arg(long)]
        single_pass: bool,

        /// Print `mean ± half-width` instead of raw statistics
        #[arg(long)]
        fancy: bool,

        /// Print the report as JSON
        #[arg(long, conflicts_with = "fancy")]
        json: bool,
    },

    /// List available algorithms with their default hyperparameters
    List,
}

fn main() -> Result<()> {
    load_dotenv();
    let config = ZeroConfig::from_env().context("Failed to load configuration")?;
    config.validate().context("Invalid configuration")?;
    init_logging(&LogConfig::from(&config)).context("Failed to initialize logging")?;

    let cli = Cli::parse();
    let registry = AlgorithmRegistry::with_builtins().context("Failed to register algorithms")?;

    match cli.command {
        Commands::List => {
            println!("Algorithms:");
            for name in registry.list_available() {
                let defaults = match registry.defaults(&name) {
                    Some(d) if !d.is_empty() => serde_json::to_string(d)?,
                    _ => String::new(),
                };
                println!("  {:<8} {}", name, defaults);
            }
            println!("Metrics: {}", available_evaluation_metrics().join(", "));
        }
        Commands::Run {
            dataset,
            experiment,
            features,
            nb_splits,
            seed,
            metrics,
            single_pass,
            fancy,
            json,
        } => {
            let mut experiment_config = ExperimentConfig::from_file(&experiment)
                .with_context(|| format!("Failed to read experiment {}", experiment.display()))?;
            if let Some(nb_splits) = nb_splits {
                experiment_config.nb_splits = nb_splits;
            }
            experiment_config.seed = seed
                .or(experiment_config.seed)
                .or(Some(config.random_seed));
            if !metrics.is_empty() {
                experiment_config.metrics = metrics;
            }
            if single_pass {
                experiment_config.full_cv = false;
            }
            experiment_config.ranking_cutoff =
                experiment_config.ranking_cutoff.or(Some(config.ranking_cutoff));

            let unknown: Vec<&str> = experiment_config
                .configurations
                .iter()
                .map(|spec| spec.name.as_str())
                .filter(|name| !registry.contains(name))
                .collect();
            if !unknown.is_empty() {
                bail!(
                    "Unknown algorithm(s) {}; available: {}",
                    unknown.join(", "),
                    registry.list_available().join(", ")
                );
            }
            let experiment = Experiment::new(experiment_config)?;

            let mut data = Dataset::new();
            data.load_csv(&dataset)
                .with_context(|| format!("Failed to load dataset {}", dataset.display()))?;
            if let Some(features) = &features {
                data.load_item_features(features)
                    .with_context(|| format!("Failed to load item features {}", features.display()))?;
            }
            let Some(data) = data.anonymized() else {
                bail!("Dataset {} holds no ratings", dataset.display());
            };

            info!(
                dataset = %dataset.display(),
                algorithms = experiment.config().configurations.len(),
                "Running experiment"
            );
            let report = experiment.run(&registry, data)?;

            if json {
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                let style = if fancy {
                    ReportStyle::Fancy
                } else {
                    ReportStyle::Plain
                };
                print!("{}", report.render(style));
            }
        }
    }

    Ok(())
}
