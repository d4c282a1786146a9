use molsearch::core::models::database::MolecularDatabase;
use molsearch::core::models::molecule::{ENERGY, Molecule};
use molsearch::engine::kreg::{Kreg, KregOptions, LAMBDA, SIGMA};
use molsearch::engine::model::TrainableModel;
use molsearch::engine::progress::ProgressReporter;
use molsearch::workflows::config::{HyperparameterOptimizationConfigBuilder, SearchAlgorithm};
use molsearch::workflows::optimize::optimize_hyperparameters;
use molsearch::workflows::validation::{LearningTask, ValidationSplit, calculate_validation_loss};
use tempfile::tempdir;

fn water(stretch: f64, bend: f64) -> Molecule {
    Molecule::from_numbers_and_coordinates(&[
        (8, [0.0, 0.0, 0.0]),
        (1, [0.96 + stretch, 0.0, 0.0]),
        (1, [-0.24 + bend, 0.93, 0.0]),
    ])
}

/// Harmonic O-H stretches.
fn energy(m: &Molecule) -> f64 {
    let x = m.flat_coordinates();
    (1..3)
        .map(|a| {
            let r = (0..3).map(|c| (x[3 * a + c] - x[c]).powi(2)).sum::<f64>().sqrt();
            (r - 0.96).powi(2)
        })
        .sum()
}

fn dataset(n: usize) -> MolecularDatabase {
    (0..n)
        .map(|i| {
            let t = i as f64 / (n - 1) as f64 - 0.5;
            let mut m = water(0.12 * t, 0.05 * t * t);
            m.set_scalar(ENERGY, energy(&m));
            m
        })
        .collect()
}

fn regularized_kreg(model_file: Option<std::path::PathBuf>) -> Kreg {
    let mut model = Kreg::new(KregOptions {
        model_file,
        ..KregOptions::default()
    })
    .unwrap();
    model.hyperparameters_mut().insert_value(LAMBDA, 1e-6).unwrap();
    model
}

#[test]
fn grid_search_over_kernel_width_picks_the_lowest_loss() {
    let database = dataset(12);
    let mut split = ValidationSplit::holdout(
        database.select(&[0, 2, 3, 5, 6, 8, 9, 11]),
        database.select(&[1, 4, 7, 10]),
    );
    let mut model = regularized_kreg(None);
    let config = HyperparameterOptimizationConfigBuilder::new()
        .hyperparameter(SIGMA)
        .algorithm(SearchAlgorithm::Grid)
        .build()
        .unwrap();

    let result = optimize_hyperparameters(
        &mut model,
        &mut split,
        &LearningTask::new(ENERGY),
        &config,
        None,
        &ProgressReporter::new(),
    )
    .unwrap();

    assert_eq!(result.trials.len(), 9);
    let best = result.best_trial();
    assert!(result.trials.iter().all(|t| t.loss >= best.loss));
    let sigma = model.hyperparameters().f64(SIGMA).unwrap();
    assert!((sigma - best.values[0]).abs() <= 1e-12 * sigma);
    assert_eq!(model.model_file(), None);

    // The winning width generalizes better than the narrowest one.
    let narrowest = &result.trials[0];
    assert!(best.loss <= narrowest.loss);
}

#[test]
fn cross_validation_resets_the_model_after_every_fold() {
    let dir = tempdir().unwrap();
    let model_file = dir.path().join("kreg.json");
    let mut model = regularized_kreg(Some(model_file.clone()));
    model.hyperparameters_mut().insert_value(SIGMA, 0.5).unwrap();
    let mut split = ValidationSplit::k_fold(&dataset(8), 4).unwrap();

    let outcome = calculate_validation_loss(
        &mut model,
        &mut split,
        &LearningTask::new(ENERGY),
        None,
        true,
    )
    .unwrap();

    assert!(outcome.loss.is_finite());
    assert_eq!(outcome.split_losses.map(|l| l.len()), Some(4));
    assert!(!model_file.exists());
    for fold in split.validation_sets() {
        assert_eq!(fold.len(), 2);
        assert!(fold.iter().all(|m| m.scalar("estimated_y").is_some()));
    }
}
