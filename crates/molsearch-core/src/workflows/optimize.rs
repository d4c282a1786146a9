use serde::Serialize;
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{debug, info, instrument};

use super::config::{HyperparameterOptimizationConfig, SearchAlgorithm};
use super::search::{self, SearchDimension, SearchOutcome};
use super::validation::{LearningTask, LossFunction, ValidationSplit, calculate_validation_loss};
use crate::engine::error::ModelError;
use crate::engine::model::TrainableModel;
use crate::engine::progress::{Progress, ProgressReporter};

/// One evaluated hyperparameter point.
#[derive(Debug, Clone, PartialEq)]
pub struct Trial {
    pub index: usize,
    /// Values as stored on the model, ordered like [`OptimizationResult::names`].
    pub values: Vec<f64>,
    pub loss: f64,
    pub split_losses: Option<Vec<f64>>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct OptimizationResult {
    pub names: Vec<String>,
    pub trials: Vec<Trial>,
    /// Index into `trials` of the lowest loss.
    pub best: usize,
}

#[derive(Serialize)]
struct TrialRow<'a> {
    trial: usize,
    hyperparameter: &'a str,
    value: f64,
    loss: f64,
}

impl OptimizationResult {
    pub fn best_trial(&self) -> &Trial {
        &self.trials[self.best]
    }

    /// `(name, value)` pairs of the best point.
    pub fn best_values(&self) -> impl Iterator<Item = (&str, f64)> {
        self.names
            .iter()
            .map(String::as_str)
            .zip(self.best_trial().values.iter().copied())
    }

    /// Writes the trial history as CSV, one row per trial and hyperparameter.
    pub fn write_csv<W: Write>(&self, writer: W) -> Result<(), csv::Error> {
        let mut writer = csv::Writer::from_writer(writer);
        for trial in &self.trials {
            for (name, &value) in self.names.iter().zip(&trial.values) {
                writer.serialize(TrialRow {
                    trial: trial.index,
                    hyperparameter: name,
                    value,
                    loss: trial.loss,
                })?;
            }
        }
        writer.flush()?;
        Ok(())
    }

    pub fn write_csv_path(&self, path: &Path) -> Result<(), ModelError> {
        let file = std::fs::File::create(path).map_err(|e| ModelError::io(path, e))?;
        self.write_csv(file).map_err(|e| match e.into_kind() {
            csv::ErrorKind::Io(source) => ModelError::io(path, source),
            other => ModelError::InvalidArgument(format!("cannot write trial history: {other:?}")),
        })
    }
}

/// Searches the configured hyperparameters of `model` for the lowest validation loss.
///
/// Every trial sets the candidate values on the model and runs one holdout or
/// cross-validation cycle. Model files written during the search go to a private temporary
/// directory; the caller's model file path is restored afterwards, also when the search
/// fails. On success the best values are left set on the model.
///
/// # Errors
///
/// Fails if a searched hyperparameter is unknown or unbounded, and aborts on the first
/// failing trial.
#[instrument(skip_all, name = "hyperparameter_optimization")]
pub fn optimize_hyperparameters(
    model: &mut dyn TrainableModel,
    split: &mut ValidationSplit,
    task: &LearningTask,
    config: &HyperparameterOptimizationConfig,
    loss_function: Option<&LossFunction<'_>>,
    reporter: &ProgressReporter,
) -> Result<OptimizationResult, ModelError> {
    config
        .validate()
        .map_err(|e| ModelError::Configuration(e.to_string()))?;
    let dimensions = config
        .hyperparameters
        .iter()
        .map(|name| {
            let hyperparameter = model.hyperparameters().require(name)?;
            SearchDimension::from_hyperparameter(hyperparameter)
        })
        .collect::<Result<Vec<_>, ModelError>>()?;

    reporter.report(Progress::PhaseStart {
        name: "Hyperparameter Optimization",
    });
    info!(
        hyperparameters = ?config.hyperparameters,
        algorithm = ?config.algorithm,
        maximum_evaluations = config.maximum_evaluations,
        "Starting hyperparameter optimization."
    );

    let scratch = tempfile::tempdir().map_err(|e| ModelError::io(std::env::temp_dir(), e))?;
    let saved_model_file = model.model_file().map(Path::to_path_buf);
    let scratch_file = scratch_model_file(scratch.path(), saved_model_file.as_deref(), model.kind());
    model.set_model_file(Some(scratch_file));

    let result = run_search(
        model,
        &dimensions,
        split,
        task,
        config,
        loss_function,
        reporter,
    );
    model.set_model_file(saved_model_file);
    let (outcome, trials) = result?;

    let names = config.hyperparameters.clone();
    for (name, &value) in names.iter().zip(&outcome.values) {
        model.hyperparameters_mut().require_mut(name)?.set_value(value)?;
    }
    let best = trials
        .iter()
        .enumerate()
        .min_by(|a, b| a.1.loss.total_cmp(&b.1.loss))
        .map_or(0, |(i, _)| i);

    info!(
        loss = outcome.loss,
        evaluations = outcome.evaluations,
        "Hyperparameter optimization complete."
    );
    reporter.report(Progress::PhaseFinish);
    Ok(OptimizationResult {
        names,
        trials,
        best,
    })
}

fn scratch_model_file(directory: &Path, saved: Option<&Path>, kind: &str) -> PathBuf {
    match saved.and_then(Path::file_name) {
        Some(name) => directory.join(name),
        None => directory.join(format!("{kind}.json")),
    }
}

fn run_search(
    model: &mut dyn TrainableModel,
    dimensions: &[SearchDimension],
    split: &mut ValidationSplit,
    task: &LearningTask,
    config: &HyperparameterOptimizationConfig,
    loss_function: Option<&LossFunction<'_>>,
    reporter: &ProgressReporter,
) -> Result<(SearchOutcome, Vec<Trial>), ModelError> {
    let mut trials = Vec::new();
    reporter.report(Progress::TaskStart {
        total_steps: config.maximum_evaluations as u64,
    });
    let mut objective = |values: &[f64]| -> Result<f64, ModelError> {
        let mut stored = Vec::with_capacity(values.len());
        for (name, &value) in config.hyperparameters.iter().zip(values) {
            let hyperparameter = model.hyperparameters_mut().require_mut(name)?;
            hyperparameter.set_value(value)?;
            stored.push(hyperparameter.as_f64()?);
        }
        let outcome = calculate_validation_loss(
            &mut *model,
            split,
            task,
            loss_function,
            config.calculate_split_errors,
        )?;
        let index = trials.len();
        debug!(trial = index, values = ?stored, loss = outcome.loss, "Trial finished");
        reporter.report(Progress::TrialFinished {
            index,
            loss: outcome.loss,
        });
        reporter.report(Progress::TaskIncrement);
        trials.push(Trial {
            index,
            values: stored,
            loss: outcome.loss,
            split_losses: outcome.split_losses,
        });
        Ok(outcome.loss)
    };

    let outcome = match config.algorithm {
        SearchAlgorithm::NelderMead => search::nelder_mead(
            dimensions,
            &config.local,
            config.maximum_evaluations,
            &mut objective,
        ),
        SearchAlgorithm::ProjectedGradient => search::projected_gradient(
            dimensions,
            &config.local,
            config.maximum_evaluations,
            &mut objective,
        ),
        SearchAlgorithm::Grid => search::grid(
            dimensions,
            config.grid.grid_size,
            config.maximum_evaluations,
            &mut objective,
        ),
        SearchAlgorithm::Tpe => search::tpe(
            dimensions,
            &config.tpe,
            config.maximum_evaluations,
            &mut objective,
        ),
    }?;
    reporter.report(Progress::TaskFinish);
    Ok((outcome, trials))
}
