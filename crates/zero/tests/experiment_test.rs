//! End-to-end runs: CSV dataset -> experiment -> report

use std::io::Write;
use zero::experiment::{AlgorithmSpec, Experiment, ExperimentConfig, ReportStyle};
use zero::{AlgorithmRegistry, AnonymizedData, Dataset, Error, Hyperparameters};

fn write_ratings_csv(dir: &std::path::Path, negative: bool) -> std::path::PathBuf {
    let path = dir.join("ratings.csv");
    let mut file = std::fs::File::create(&path).unwrap();
    writeln!(file, "user,item,rating").unwrap();
    for user in 0..10usize {
        for offset in 0..5usize {
            let item = (user * 2 + offset) % 7;
            let mut rating = ((user + item) % 5) as f64;
            if negative {
                rating -= 2.0;
            } else {
                rating += 1.0;
            }
            writeln!(file, "{},{},{}", user, item, rating).unwrap();
        }
    }
    path
}

fn config(configurations: Vec<AlgorithmSpec>) -> ExperimentConfig {
    ExperimentConfig {
        configurations,
        metrics: vec!["rmse".to_string(), "mae".to_string(), "ndcg@3".to_string()],
        nb_splits: 3,
        test_fraction: 0.2,
        seed: Some(7),
        full_cv: true,
        ranking_cutoff: None,
    }
}

#[test]
fn test_experiment_on_csv_dataset() {
    let dir = tempfile::tempdir().unwrap();
    let path = write_ratings_csv(dir.path(), false);

    let mut dataset = Dataset::new();
    let data = dataset.load_csv(&path).unwrap();
    assert_eq!(data.len(), 50);
    assert_eq!((data.nb_users(), data.nb_works()), (10, 7));

    let experiment = Experiment::new(config(vec![
        AlgorithmSpec::new("zero", Hyperparameters::new()),
        AlgorithmSpec::new("als", Hyperparameters::new().with("nb_components", 3usize)),
        AlgorithmSpec::new("knn", Hyperparameters::new().with("nb_neighbors", 4usize)),
    ]))
    .unwrap();
    let registry = AlgorithmRegistry::with_builtins().unwrap();
    let report = experiment.run(&registry, data).unwrap();

    assert_eq!(report.nb_passes, 3);
    assert_eq!(report.outcomes.len(), 3);
    for outcome in &report.outcomes {
        assert!(outcome.succeeded(), "{:?}", outcome.error);
        assert_eq!(outcome.passes.len(), 3);
        let rmse = outcome.summary["rmse"];
        assert_eq!(rmse.nb_passes, 3);
        assert!(rmse.mean.is_finite() && rmse.variance >= 0.0);
        assert!(outcome.summary.contains_key("ndcg@3"));
    }
    assert_eq!(
        report.outcome("als").unwrap().shortname.as_deref(),
        Some("als-3")
    );

    let rendered = report.render(ReportStyle::Fancy);
    assert!(rendered.contains("Evaluation of RMSE:"));
    assert!(rendered.contains("[zero]"));
}

#[test]
fn test_failing_algorithm_does_not_stop_the_others() {
    let dir = tempfile::tempdir().unwrap();
    let path = write_ratings_csv(dir.path(), true);
    let mut dataset = Dataset::new();
    let data = dataset.load_csv(&path).unwrap();

    let experiment = Experiment::new(config(vec![
        AlgorithmSpec::new("nmf", Hyperparameters::new()),
        AlgorithmSpec::new("zero", Hyperparameters::new()),
    ]))
    .unwrap();
    let registry = AlgorithmRegistry::with_builtins().unwrap();
    let report = experiment.run(&registry, data).unwrap();

    let nmf = report.outcome("nmf").unwrap();
    assert!(!nmf.succeeded());
    assert!(nmf.summary.is_empty());

    let zero = report.outcome("zero").unwrap();
    assert!(zero.succeeded());
    assert_eq!(zero.passes.len(), 3);
    assert!(report.to_string().contains("failed"));
}

#[test]
fn test_unknown_algorithm_is_reported_per_outcome() {
    let data = AnonymizedData::from_triplets(
        &[(0, 0, 1.0), (0, 1, 2.0), (1, 0, 3.0), (1, 1, 4.0), (2, 0, 5.0)],
        3,
        2,
    )
    .unwrap();
    let mut cfg = config(vec![AlgorithmSpec::new("__not_a_real_algorithm__", Hyperparameters::new())]);
    cfg.full_cv = false;
    let report = Experiment::new(cfg)
        .unwrap()
        .run(&AlgorithmRegistry::with_builtins().unwrap(), &data)
        .unwrap();

    assert_eq!(report.nb_passes, 1);
    let outcome = &report.outcomes[0];
    assert!(outcome.error.as_deref().unwrap().contains("__not_a_real_algorithm__"));
}

#[test]
fn test_malformed_dataset_reports_line() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("bad.csv");
    std::fs::write(&path, "user,item,rating\n0,1,4\n1,two,3\n").unwrap();

    let mut dataset = Dataset::new();
    assert!(matches!(
        dataset.load_csv(&path),
        Err(Error::MalformedDataset { line: 3, .. })
    ));

    std::fs::write(&path, "user,rating\n0,4\n").unwrap();
    assert!(matches!(
        dataset.load_csv(&path),
        Err(Error::MalformedDataset { .. })
    ));
}

#[test]
fn test_experiment_file_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("experiment.json");
    std::fs::write(
        &path,
        r#"{"configurations": [["svd", {"nb_components": 2}], ["pca"]], "metrics": ["rmse"]}"#,
    )
    .unwrap();

    let experiment = Experiment::from_file(&path).unwrap();
    assert_eq!(experiment.config().configurations.len(), 2);
    assert_eq!(experiment.config().nb_splits, 5);
}
