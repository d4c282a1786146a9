use rand::SeedableRng;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};
use std::io::{BufRead, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, instrument, trace, warn};

use super::child::ensemble_tree;
use super::networks::{AniNetworks, map_species};
use super::training::{
    FrozenLayers, LossSettings, OptimizerState, Sample, SchedulerSettings, TrainingOptions,
    ValidationData, batch_gradients, validation_error,
};
use crate::core::descriptors::aev::AevParameters;
use crate::core::hyperparameters::{Hyperparameter, HyperparameterSet, OptimizationSpace};
use crate::core::io::traits::{ModelFile, PersistenceError, read_json, write_json};
use crate::core::models::database::MolecularDatabase;
use crate::core::models::molecule::{ENERGY, Molecule};
use crate::core::nn::shifter::EnergyShifter;
use crate::engine::error::ModelError;
use crate::engine::model::{
    Model, PredictionRequest, TrainableModel, default_model_file, remove_model_file,
};
use crate::engine::record::{MlModelKwargs, ModelRecord};
use crate::engine::tree::ModelTree;

pub const BATCH_SIZE: &str = "batch_size";
pub const MAX_EPOCHS: &str = "max_epochs";
pub const LEARNING_RATE: &str = "learning_rate";
pub const EARLY_STOPPING_LEARNING_RATE: &str = "early_stopping_learning_rate";
pub const LR_REDUCE_PATIENCE: &str = "lr_reduce_patience";
pub const LR_REDUCE_FACTOR: &str = "lr_reduce_factor";
pub const LR_REDUCE_THRESHOLD: &str = "lr_reduce_threshold";
pub const FORCE_COEFFICIENT: &str = "force_coefficient";
pub const MEDIAN_LOSS: &str = "median_loss";
pub const NEURONS: &str = "neurons";

/// Default hyperparameters of the network model, including the AEV parameters `Rcr`,
/// `Rca`, `EtaR`, `ShfR`, `Zeta`, `ShfZ`, `EtaA` and `ShfA`.
pub fn default_hyperparameters() -> HyperparameterSet {
    let aev = AevParameters::default();
    let bounded = |name: &str, value: f64, lo: f64, hi: f64, space: OptimizationSpace| {
        Hyperparameter::new(name, value)
            .with_bounds(lo, hi)
            .with_space(space)
    };
    let integer = |name: &str, value: i64, lo: f64, hi: f64, space: OptimizationSpace| {
        Hyperparameter::new(name, value)
            .with_bounds(lo, hi)
            .with_space(space)
    };
    HyperparameterSet::from(vec![
        integer(BATCH_SIZE, 8, 1.0, 1024.0, OptimizationSpace::Linear),
        integer(MAX_EPOCHS, 1_000_000, 100.0, 1e6, OptimizationSpace::Log),
        bounded(LEARNING_RATE, 1e-3, 1e-4, 1e-2, OptimizationSpace::Log),
        bounded(EARLY_STOPPING_LEARNING_RATE, 1e-5, 1e-6, 1e-4, OptimizationSpace::Log),
        integer(LR_REDUCE_PATIENCE, 64, 16.0, 256.0, OptimizationSpace::Linear),
        bounded(LR_REDUCE_FACTOR, 0.5, 0.1, 0.9, OptimizationSpace::Linear),
        bounded(LR_REDUCE_THRESHOLD, 0.0, -0.01, 0.01, OptimizationSpace::Linear),
        bounded(FORCE_COEFFICIENT, 0.1, 0.05, 5.0, OptimizationSpace::Linear),
        Hyperparameter::new(MEDIAN_LOSS, false),
        Hyperparameter::new(NEURONS, vec![vec![160i64, 128, 96]]),
        bounded("Rcr", aev.rcr, 1.0, 10.0, OptimizationSpace::Linear),
        bounded("Rca", aev.rca, 1.0, 10.0, OptimizationSpace::Linear),
        Hyperparameter::new("EtaR", aev.eta_r),
        Hyperparameter::new("ShfR", aev.shf_r),
        Hyperparameter::new("Zeta", aev.zeta),
        Hyperparameter::new("ShfZ", aev.shf_z),
        Hyperparameter::new("EtaA", aev.eta_a),
        Hyperparameter::new("ShfA", aev.shf_a),
    ])
}

fn aev_parameters(set: &HyperparameterSet) -> Result<AevParameters, ModelError> {
    Ok(AevParameters {
        rcr: set.f64("Rcr")?,
        rca: set.f64("Rca")?,
        eta_r: set.f64_list("EtaR")?,
        shf_r: set.f64_list("ShfR")?,
        zeta: set.f64_list("Zeta")?,
        shf_z: set.f64_list("ShfZ")?,
        eta_a: set.f64_list("EtaA")?,
        shf_a: set.f64_list("ShfA")?,
    })
}

fn neurons(set: &HyperparameterSet) -> Result<Vec<Vec<usize>>, ModelError> {
    set.value(NEURONS)
        .and_then(|v| v.as_usize_lists())
        .filter(|lists| !lists.is_empty())
        .ok_or_else(|| {
            ModelError::InvalidArgument(
                "'neurons' must be a non-empty list of hidden-layer width lists".into(),
            )
        })
}

fn positive_count(set: &HyperparameterSet, name: &str) -> Result<usize, ModelError> {
    usize::try_from(set.i64(name)?)
        .ok()
        .filter(|&n| n > 0)
        .ok_or_else(|| ModelError::InvalidArgument(format!("'{name}' must be a positive integer")))
}

fn scheduler_settings(set: &HyperparameterSet) -> Result<SchedulerSettings, ModelError> {
    Ok(SchedulerSettings {
        learning_rate: set.f64(LEARNING_RATE)?,
        factor: set.f64(LR_REDUCE_FACTOR)?,
        patience: set.i64(LR_REDUCE_PATIENCE)?.max(0) as u64,
        threshold: set.f64(LR_REDUCE_THRESHOLD)?,
    })
}

#[derive(Debug, Clone)]
pub struct AniOptions {
    pub model_file: Option<PathBuf>,
    /// Elements the networks are built for. Defaults to the sorted elements of the first
    /// training database.
    pub species_order: Option<Vec<u8>>,
    /// Seed for weight initialization and validation sampling; entropy when absent.
    pub seed: Option<u64>,
    pub nthreads: Option<usize>,
    /// Options used by [`Model::train`].
    pub training: TrainingOptions,
}

impl Default for AniOptions {
    fn default() -> Self {
        Self {
            model_file: None,
            species_order: None,
            seed: None,
            nthreads: None,
            training: TrainingOptions::default(),
        }
    }
}

/// The persisted state of a network model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AniBundle {
    /// The learned scalar property.
    pub property: String,
    pub hyperparameters: HyperparameterSet,
    pub networks: AniNetworks,
    pub optimizer: OptimizerState,
}

impl ModelFile for AniBundle {
    type Error = PersistenceError;

    fn read_from(reader: &mut impl BufRead) -> Result<Self, Self::Error> {
        read_json(reader)
    }

    fn write_to(&self, writer: &mut impl Write) -> Result<(), Self::Error> {
        write_json(self, writer)
    }
}

fn write_bundle(bundle: &AniBundle, path: &Path) -> Result<(), ModelError> {
    bundle
        .write_to_path(path)
        .map_err(|e| ModelError::persistence(path, e))
}

/// A trainable ensemble of per-element networks over atomic environment vectors.
#[derive(Debug)]
pub struct Ani {
    options: AniOptions,
    hyperparameters: HyperparameterSet,
    state: Option<AniBundle>,
    frozen_layers: Vec<Vec<usize>>,
    rng: StdRng,
}

/// Data of one training call after splitting and caching.
struct Prepared {
    training: Vec<Sample>,
    validation: Vec<Sample>,
}

impl Ani {
    /// Creates a model, restoring it from `options.model_file` if that file exists.
    pub fn new(options: AniOptions) -> Result<Self, ModelError> {
        let rng = match options.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        let mut model = Self {
            options,
            hyperparameters: default_hyperparameters(),
            state: None,
            frozen_layers: Vec::new(),
            rng,
        };
        if let Some(path) = model.options.model_file.clone() {
            if path.exists() {
                model.load(&path)?;
            } else {
                info!(path = %path.display(), "Trained network model will be saved here");
            }
        }
        Ok(model)
    }

    /// Restores a trained model from its file.
    pub fn from_file(path: &Path) -> Result<Self, ModelError> {
        let mut model = Self::new(AniOptions::default())?;
        model.load(path)?;
        Ok(model)
    }

    /// Wraps already trained networks, e.g. a pretrained ensemble.
    pub fn from_networks(networks: AniNetworks, options: AniOptions) -> Result<Self, ModelError> {
        let mut model = Self::new(AniOptions {
            model_file: None,
            ..options.clone()
        })?;
        model.options.model_file = options.model_file;
        let optimizer = OptimizerState::new(&networks, scheduler_settings(&model.hyperparameters)?);
        model.state = Some(AniBundle {
            property: ENERGY.to_string(),
            hyperparameters: model.hyperparameters.clone(),
            networks,
            optimizer,
        });
        Ok(model)
    }

    pub fn options(&self) -> &AniOptions {
        &self.options
    }

    pub fn options_mut(&mut self) -> &mut AniOptions {
        &mut self.options
    }

    pub fn is_trained(&self) -> bool {
        self.state.is_some()
    }

    pub fn bundle(&self) -> Option<&AniBundle> {
        self.state.as_ref()
    }

    pub fn networks(&self) -> Option<&AniNetworks> {
        self.state.as_ref().map(|s| &s.networks)
    }

    /// Excludes linear layers from training.
    ///
    /// `layers[s]` lists the layer indices to freeze for species `s` of the species order;
    /// a single list applies to every species. An empty vector unfreezes everything.
    pub fn fix_layers(&mut self, layers: Vec<Vec<usize>>) {
        self.frozen_layers = layers;
    }

    fn state(&self) -> Result<&AniBundle, ModelError> {
        self.state.as_ref().ok_or_else(|| {
            ModelError::Configuration("network model has not been trained or loaded".into())
        })
    }

    /// Decomposes the ensemble into one leaf per member under an `average` node.
    ///
    /// Members are named `{name}_nn{i}`. With a dispersion model, the root is a `sum` of
    /// the average node (`{name}_nn`) and the dispersion leaf.
    pub fn ensemble_tree(
        &self,
        name: &str,
        dispersion: Option<(&str, Box<dyn Model>)>,
    ) -> Result<ModelTree, ModelError> {
        let networks = Arc::new(self.state()?.networks.clone());
        ensemble_tree(networks, name, dispersion, self.options.nthreads)
    }

    fn species_order_for(&self, database: &MolecularDatabase) -> Result<Vec<u8>, ModelError> {
        let elements = database.elements();
        let order = match (&self.state, &self.options.species_order) {
            (Some(state), _) => state.networks.species_order.clone(),
            (None, Some(order)) => order.clone(),
            (None, None) => return Ok(elements),
        };
        if let Some(z) = elements.iter().find(|z| !order.contains(z)) {
            return Err(ModelError::InvalidArgument(format!(
                "training data contain element {z} outside the supported species {order:?}"
            )));
        }
        Ok(order)
    }

    fn fresh_state(
        &mut self,
        training: &MolecularDatabase,
        species_order: Vec<u8>,
        property: &str,
    ) -> Result<AniBundle, ModelError> {
        let mut species = Vec::new();
        let mut energies = Vec::new();
        for molecule in training.iter() {
            if let Some(e) = molecule.scalar(property).filter(|e| e.is_finite()) {
                species.push(map_species(&species_order, molecule)?);
                energies.push(e);
            }
        }
        let shifter = EnergyShifter::fit(&species, &energies, species_order.len())
            .unwrap_or_else(|| {
                warn!("Could not fit self energies, using zero baselines.");
                EnergyShifter::new(vec![0.0; species_order.len()])
            });
        debug!(self_energies = ?shifter.self_energies, "Fitted self energies");
        let networks = AniNetworks::new(
            species_order,
            aev_parameters(&self.hyperparameters)?,
            shifter,
            &neurons(&self.hyperparameters)?,
            &mut self.rng,
        )?;
        let optimizer = OptimizerState::new(&networks, scheduler_settings(&self.hyperparameters)?);
        Ok(AniBundle {
            property: property.to_string(),
            hyperparameters: self.hyperparameters.clone(),
            networks,
            optimizer,
        })
    }

    fn prepare(
        &mut self,
        database: &MolecularDatabase,
        validation: &ValidationData,
        property: &str,
        xyz_derivative_property: Option<&str>,
    ) -> Result<Prepared, ModelError> {
        let (training, validation) = match validation {
            ValidationData::Sample { splitting_ratio } => {
                let (sub, held_out) = database.sample_split(*splitting_ratio, &mut self.rng);
                (database.select(&sub), database.select(&held_out))
            }
            ValidationData::Database(v) => (database.clone(), v.clone()),
        };
        if training.is_empty() || validation.is_empty() {
            return Err(ModelError::InvalidArgument(format!(
                "need molecules for both training and validation, got {} and {}",
                training.len(),
                validation.len()
            )));
        }
        if self.state.is_none() {
            let species_order = self.species_order_for(database)?;
            self.state = Some(self.fresh_state(&training, species_order, property)?);
        } else {
            self.species_order_for(database)?;
            self.species_order_for(&validation)?;
        }
        let networks = &self.state()?.networks;
        let samples = |db: &MolecularDatabase, xyz: Option<&str>| {
            db.iter()
                .map(|m| Sample::new(networks, m, property, xyz))
                .collect::<Result<Vec<_>, _>>()
        };
        let mut prepared = Prepared {
            training: samples(&training, xyz_derivative_property)?,
            validation: samples(&validation, None)?,
        };
        prepared.training.shuffle(&mut self.rng);
        Ok(prepared)
    }

    /// Trains with explicit options.
    ///
    /// # Arguments
    ///
    /// * `database` - Molecules labeled with `property` (and optionally with
    ///   `xyz_derivative_property` energy gradients).
    /// * `property` - The scalar label, `energy` when `None`.
    /// * `xyz_derivative_property` - Per-atom gradient labels to include in the loss.
    /// * `options` - Validation source, checkpointing and reset switches.
    ///
    /// # Errors
    ///
    /// Returns [`ModelError::InvalidArgument`] for empty splits, unsupported elements or
    /// malformed hyperparameters, and persistence errors from saving or check points.
    #[instrument(skip_all, name = "ani_train")]
    pub fn train_with(
        &mut self,
        database: &MolecularDatabase,
        property: Option<&str>,
        xyz_derivative_property: Option<&str>,
        options: &TrainingOptions,
    ) -> Result<(), ModelError> {
        let property = property.unwrap_or(ENERGY);
        if database.is_empty() {
            return Err(ModelError::InvalidArgument("training database is empty".into()));
        }
        let batch_size = positive_count(&self.hyperparameters, BATCH_SIZE)?;
        let max_epochs = self.hyperparameters.i64(MAX_EPOCHS)?.max(0) as u64;
        let early_stopping = self.hyperparameters.f64(EARLY_STOPPING_LEARNING_RATE)?;
        let loss_settings = LossSettings {
            force_coefficient: self.hyperparameters.f64(FORCE_COEFFICIENT)?,
            median_loss: self.hyperparameters.bool(MEDIAN_LOSS)?,
        };

        let prepared = {
            // Resets act on an existing model before the data are cached with its networks.
            if let Some(state) = self.state.as_mut() {
                if options.reset_network {
                    state.networks.rebuild(&neurons(&self.hyperparameters)?, &mut self.rng)?;
                    state.optimizer = OptimizerState::new(
                        &state.networks,
                        scheduler_settings(&self.hyperparameters)?,
                    );
                }
                if options.reset_parameters {
                    state.networks.reinitialize(&mut self.rng);
                }
                if options.reset_optimizer {
                    state.optimizer = OptimizerState::new(
                        &state.networks,
                        scheduler_settings(&self.hyperparameters)?,
                    );
                }
            }
            self.prepare(database, &options.validation, property, xyz_derivative_property)?
        };

        let model_file = self
            .options
            .model_file
            .clone()
            .unwrap_or_else(|| default_model_file(self.kind(), "json"));
        if options.save_model {
            self.options.model_file = Some(model_file.clone());
        }
        let hyperparameters = self.hyperparameters.clone();
        let state = self
            .state
            .as_mut()
            .ok_or_else(|| ModelError::Configuration("network model was not set up".into()))?;
        let frozen = FrozenLayers::new(
            self.frozen_layers.clone(),
            state.networks.species_order.len(),
        )?;
        state.property = property.to_string();
        state.hyperparameters = hyperparameters;

        if let Some(check_point) = options.check_point.as_deref().filter(|p| p.exists()) {
            let saved = AniBundle::read_from_path(check_point)
                .map_err(|e| ModelError::persistence(check_point, e))?;
            state.networks = saved.networks;
            if !options.reset_optim_state {
                state.optimizer = saved.optimizer;
            }
            info!(path = %check_point.display(), "Resumed from check point");
        }

        info!(
            training = prepared.training.len(),
            validation = prepared.validation.len(),
            species = ?state.networks.species_order,
            with_gradients = xyz_derivative_property.is_some(),
            "Training network model"
        );
        while state.optimizer.adamw_scheduler.last_epoch + 1 < max_epochs {
            let epoch = state.optimizer.adamw_scheduler.last_epoch + 1;
            let rmse = validation_error(&state.networks, &prepared.validation, batch_size);
            let learning_rate = state.optimizer.learning_rate();
            debug!(epoch, rmse, learning_rate, "Validated");
            if learning_rate < early_stopping {
                info!(epoch, learning_rate, "Learning rate fell below the stopping threshold");
                break;
            }
            if options.save_model && (state.optimizer.is_improvement(rmse) || options.save_every_epoch) {
                write_bundle(state, &model_file)?;
                trace!(epoch, path = %model_file.display(), "Saved model");
            }
            state.optimizer.step_schedulers(rmse);

            for batch in prepared.training.chunks(batch_size) {
                let batch: Vec<&Sample> = batch.iter().collect();
                let (loss, grads) = batch_gradients(&state.networks, &batch, loss_settings);
                trace!(epoch, loss, "Batch");
                state.optimizer.apply(&mut state.networks, &grads, &frozen);
            }

            if let Some(check_point) = &options.check_point {
                write_bundle(state, check_point)?;
            }
        }

        if options.save_model && !options.use_last_model && model_file.exists() {
            self.load(&model_file)?;
            debug!(path = %model_file.display(), "Reloaded best model");
        }
        Ok(())
    }
}

impl Model for Ani {
    fn kind(&self) -> &'static str {
        "ani"
    }

    fn predict_batch(
        &mut self,
        molecules: &mut [Molecule],
        request: &PredictionRequest,
    ) -> Result<(), ModelError> {
        let state = self.state()?;
        let targets = request.targets_or_estimated();
        state
            .networks
            .predict_all(None, molecules, &targets, self.options.nthreads)
    }

    fn train(
        &mut self,
        molecular_database: &MolecularDatabase,
        property_to_learn: Option<&str>,
        xyz_derivative_property_to_learn: Option<&str>,
    ) -> Result<(), ModelError> {
        let options = self.options.training.clone();
        self.train_with(
            molecular_database,
            property_to_learn,
            xyz_derivative_property_to_learn,
            &options,
        )
    }

    fn set_num_threads(&mut self, nthreads: usize) {
        self.options.nthreads = Some(nthreads);
    }

    fn config_multiprocessing(&mut self) {
        self.options.nthreads = Some(1);
    }

    /// Forgets the trained networks and removes the model file.
    fn reset(&mut self) -> Result<(), ModelError> {
        self.state = None;
        remove_model_file(self.options.model_file.as_deref())
    }

    fn to_record(&self) -> Result<ModelRecord, ModelError> {
        let model_file = self.options.model_file.as_ref().ok_or_else(|| {
            ModelError::Configuration("network model has no model file to reference".into())
        })?;
        Ok(ModelRecord::MlModel {
            ml_model_type: self.kind().to_string(),
            kwargs: MlModelKwargs {
                model_file: std::path::absolute(model_file)
                    .map_err(|e| ModelError::io(model_file, e))?,
                ml_program: None,
            },
        })
    }
}

impl TrainableModel for Ani {
    fn hyperparameters(&self) -> &HyperparameterSet {
        &self.hyperparameters
    }

    fn hyperparameters_mut(&mut self) -> &mut HyperparameterSet {
        &mut self.hyperparameters
    }

    fn model_file(&self) -> Option<&Path> {
        self.options.model_file.as_deref()
    }

    fn set_model_file(&mut self, path: Option<PathBuf>) {
        self.options.model_file = path;
    }

    fn save(&mut self) -> Result<PathBuf, ModelError> {
        let path = self
            .options
            .model_file
            .clone()
            .unwrap_or_else(|| default_model_file(self.kind(), "json"));
        write_bundle(self.state()?, &path)?;
        debug!(path = %path.display(), "Saved network model");
        self.options.model_file = Some(path.clone());
        Ok(path)
    }

    fn load(&mut self, path: &Path) -> Result<(), ModelError> {
        let bundle = AniBundle::read_from_path(path).map_err(|e| ModelError::persistence(path, e))?;
        self.hyperparameters.update(&bundle.hyperparameters);
        self.state = Some(bundle);
        self.options.model_file = Some(path.to_path_buf());
        Ok(())
    }
}
