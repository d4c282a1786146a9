use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use super::networks::{AniNetworks, Environments};
use crate::core::models::database::MolecularDatabase;
use crate::core::models::molecule::Molecule;
use crate::core::nn::mlp::MlpGradients;
use crate::core::nn::optim::{AdamW, ReduceLrOnPlateau, Sgd};
use crate::engine::error::ModelError;

/// Weight decay of the first and last weight layers (the AdamW default).
const OUTER_WEIGHT_DECAY: f64 = 0.01;
/// Weight decay of hidden weight layer `j` is `HIDDEN_WEIGHT_DECAY / 10^j`.
const HIDDEN_WEIGHT_DECAY: f64 = 1e-4;

/// Where validation molecules come from.
#[derive(Debug, Clone, PartialEq)]
pub enum ValidationData {
    /// Randomly hold out `1 - splitting_ratio` of the training database.
    Sample { splitting_ratio: f64 },
    Database(MolecularDatabase),
}

impl Default for ValidationData {
    fn default() -> Self {
        ValidationData::Sample {
            splitting_ratio: 0.8,
        }
    }
}

/// Per-call switches of network training.
#[derive(Debug, Clone, PartialEq)]
pub struct TrainingOptions {
    pub validation: ValidationData,
    /// Save the best model during training and reload it afterwards.
    pub save_model: bool,
    /// File holding networks and optimizer state after every epoch; resumed from if it exists.
    pub check_point: Option<PathBuf>,
    /// Ignore the optimizer state stored in the check point.
    pub reset_optim_state: bool,
    /// Keep the last epoch's weights instead of reloading the best ones.
    pub use_last_model: bool,
    pub reset_parameters: bool,
    pub reset_network: bool,
    pub reset_optimizer: bool,
    /// Save after every epoch instead of only on improvement.
    pub save_every_epoch: bool,
}

impl Default for TrainingOptions {
    fn default() -> Self {
        Self {
            validation: ValidationData::default(),
            save_model: true,
            check_point: None,
            reset_optim_state: false,
            use_last_model: false,
            reset_parameters: false,
            reset_network: false,
            reset_optimizer: false,
            save_every_epoch: false,
        }
    }
}

impl TrainingOptions {
    pub fn with_validation(mut self, validation: ValidationData) -> Self {
        self.validation = validation;
        self
    }

    pub fn with_save_model(mut self, save_model: bool) -> Self {
        self.save_model = save_model;
        self
    }

    pub fn with_check_point(mut self, path: impl Into<PathBuf>) -> Self {
        self.check_point = Some(path.into());
        self
    }
}

/// AdamW over weights and SGD over biases, each with its own plateau scheduler.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OptimizerState {
    pub adamw: AdamW,
    pub sgd: Sgd,
    pub adamw_scheduler: ReduceLrOnPlateau,
    pub sgd_scheduler: ReduceLrOnPlateau,
}

/// Scheduler settings shared by both parameter groups.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SchedulerSettings {
    pub learning_rate: f64,
    pub factor: f64,
    pub patience: u64,
    pub threshold: f64,
}

impl OptimizerState {
    pub fn new(networks: &AniNetworks, settings: SchedulerSettings) -> Self {
        let decays = networks
            .members
            .iter()
            .flatten()
            .flat_map(|mlp| {
                let last = mlp.layers.len() - 1;
                (0..mlp.layers.len()).map(move |j| {
                    if j == 0 || j == last {
                        OUTER_WEIGHT_DECAY
                    } else {
                        HIDDEN_WEIGHT_DECAY / 10f64.powi(j as i32)
                    }
                })
            })
            .collect();
        let scheduler = || {
            ReduceLrOnPlateau::new(settings.factor, settings.patience, settings.threshold)
        };
        Self {
            adamw: AdamW::new(settings.learning_rate, decays),
            sgd: Sgd::new(settings.learning_rate),
            adamw_scheduler: scheduler(),
            sgd_scheduler: scheduler(),
        }
    }

    pub fn learning_rate(&self) -> f64 {
        self.adamw.lr
    }

    pub fn is_improvement(&self, metric: f64) -> bool {
        self.adamw_scheduler
            .is_better(metric, self.adamw_scheduler.best)
    }

    pub fn step_schedulers(&mut self, metric: f64) {
        self.adamw_scheduler.step(metric, &mut self.adamw.lr);
        self.sgd_scheduler.step(metric, &mut self.sgd.lr);
    }

    /// Applies one update to every parameter not in a frozen layer.
    pub(crate) fn apply(
        &mut self,
        networks: &mut AniNetworks,
        grads: &[Vec<MlpGradients>],
        frozen: &FrozenLayers,
    ) {
        let mut slot = 0;
        for (k, member) in networks.members.iter_mut().enumerate() {
            for (s, mlp) in member.iter_mut().enumerate() {
                for (l, layer) in mlp.layers.iter_mut().enumerate() {
                    if !frozen.contains(s, l) {
                        self.adamw
                            .update(slot, &mut layer.weight, &grads[k][s].weights[l]);
                        self.sgd.update(&mut layer.bias, &grads[k][s].biases[l]);
                    }
                    slot += 1;
                }
            }
        }
    }
}

/// Linear-layer indices excluded from training, per species or shared by all species.
#[derive(Debug, Clone, Default, PartialEq)]
pub(crate) struct FrozenLayers(Vec<Vec<usize>>);

impl FrozenLayers {
    pub fn new(layers: Vec<Vec<usize>>, num_species: usize) -> Result<Self, ModelError> {
        if layers.len() > 1 && layers.len() != num_species {
            return Err(ModelError::InvalidArgument(format!(
                "layers to fix are given for {} species, the model has {}",
                layers.len(),
                num_species
            )));
        }
        Ok(Self(layers))
    }

    pub fn contains(&self, species: usize, layer: usize) -> bool {
        let list = if self.0.len() == 1 {
            self.0.first()
        } else {
            self.0.get(species)
        };
        list.is_some_and(|l| l.contains(&layer))
    }
}

/// A training or validation molecule with its environments cached and labels shifted by
/// the self energies.
#[derive(Debug, Clone)]
pub(crate) struct Sample {
    pub env: Environments,
    /// Label minus self energies; NaN when the molecule carries no label.
    pub energy: f64,
    pub gradients: Option<Vec<f64>>,
}

impl Sample {
    pub fn new(
        networks: &AniNetworks,
        molecule: &Molecule,
        property: &str,
        xyz_derivative_property: Option<&str>,
    ) -> Result<Self, ModelError> {
        let env = networks.environments(molecule, xyz_derivative_property.is_some())?;
        let energy = molecule
            .scalar(property)
            .map_or(f64::NAN, |e| e - networks.shifter.shift(&env.species));
        let gradients = xyz_derivative_property.map(|p| {
            molecule
                .atom_vectors(p)
                .map(|v| v.iter().flat_map(|g| [g.x, g.y, g.z]).collect())
                .unwrap_or_else(|| vec![f64::NAN; 3 * molecule.atom_count()])
        });
        Ok(Self {
            env,
            energy,
            gradients,
        })
    }

    fn natoms(&self) -> f64 {
        self.env.species.len() as f64
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) struct LossSettings {
    pub force_coefficient: f64,
    pub median_loss: bool,
}

/// Index of the lower median of `values`.
fn lower_median(values: &[(usize, f64)]) -> Option<usize> {
    let mut sorted: Vec<&(usize, f64)> = values.iter().collect();
    sorted.sort_by(|a, b| a.1.total_cmp(&b.1));
    sorted.get(sorted.len().checked_sub(1)? / 2).map(|(i, _)| *i)
}

/// Loss of one mini-batch and its parameter gradients.
///
/// The energy term is the mean of `(E - y)^2 / sqrt(natoms)` (or the median absolute
/// error); the force term is the mean of `|∇E - g|^2 / natoms` weighted by the force
/// coefficient. Unlabeled entries contribute nothing.
pub(crate) fn batch_gradients(
    networks: &AniNetworks,
    batch: &[&Sample],
    settings: LossSettings,
) -> (f64, Vec<Vec<MlpGradients>>) {
    let count = batch.len() as f64;
    let members = 0..networks.member_count();
    let outputs: Vec<(f64, Option<Vec<f64>>)> = batch
        .iter()
        .map(|s| networks.network_output(members.clone(), &s.env))
        .collect();

    let mut d_energy = vec![0.0; batch.len()];
    let mut loss = 0.0;
    let residuals: Vec<(usize, f64)> = outputs
        .iter()
        .zip(batch)
        .enumerate()
        .filter(|(_, (_, s))| s.energy.is_finite())
        .map(|(i, ((e, _), s))| (i, e - s.energy))
        .collect();
    if settings.median_loss {
        let absolute: Vec<(usize, f64)> = residuals.iter().map(|&(i, r)| (i, r.abs())).collect();
        if let Some(i) = lower_median(&absolute) {
            let r = residuals.iter().find(|(j, _)| *j == i).map_or(0.0, |(_, r)| *r);
            loss += r.abs();
            d_energy[i] = r.signum();
        }
    } else {
        for &(i, r) in &residuals {
            let scale = batch[i].natoms().sqrt();
            loss += r * r / scale / count;
            d_energy[i] = 2.0 * r / scale / count;
        }
    }

    let d_gradients: Vec<Option<Vec<f64>>> = outputs
        .iter()
        .zip(batch)
        .map(|((_, predicted), sample)| {
            let (predicted, reference) = (predicted.as_ref()?, sample.gradients.as_ref()?);
            let natoms = sample.natoms();
            let weights = predicted
                .iter()
                .zip(reference)
                .map(|(p, r)| {
                    if r.is_finite() {
                        let diff = p - r;
                        loss += settings.force_coefficient * diff * diff / natoms / count;
                        settings.force_coefficient * 2.0 * diff / natoms / count
                    } else {
                        0.0
                    }
                })
                .collect();
            Some(weights)
        })
        .collect();

    let mut grads: Vec<Vec<MlpGradients>> = networks
        .members
        .iter()
        .map(|m| m.iter().map(MlpGradients::zeros_like).collect())
        .collect();
    for ((sample, de), dg) in batch.iter().zip(&d_energy).zip(&d_gradients) {
        networks.backpropagate(&sample.env, *de, dg.as_deref(), &mut grads);
    }
    (loss, grads)
}

/// Validation metric: `sqrt(sum_b sqrt(SSE_b) / n)` over batches `b` of energy errors.
pub(crate) fn validation_error(networks: &AniNetworks, samples: &[Sample], batch_size: usize) -> f64 {
    let members = 0..networks.member_count();
    let mut total = 0.0;
    let mut count = 0usize;
    for batch in samples.chunks(batch_size.max(1)) {
        let sse: f64 = batch
            .iter()
            .filter(|s| s.energy.is_finite())
            .map(|s| {
                let (e, _) = networks.network_output(members.clone(), &s.env);
                (e - s.energy).powi(2)
            })
            .sum();
        total += sse.sqrt();
        count += batch.len();
    }
    if count == 0 {
        return f64::NAN;
    }
    (total / count as f64).sqrt()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::ani::networks::tests::{methanol_like, small_networks};
    use crate::core::models::molecule::{ENERGY, ENERGY_GRADIENTS};

    fn settings() -> SchedulerSettings {
        SchedulerSettings {
            learning_rate: 1e-3,
            factor: 0.5,
            patience: 64,
            threshold: 0.0,
        }
    }

    #[test]
    fn weight_decay_follows_layer_position() {
        let networks = small_networks(1, 3);
        let state = OptimizerState::new(&networks, settings());
        // Three species, each `aev -> 6 -> 4 -> 1`.
        assert_eq!(state.adamw.weight_decay.len(), 9);
        assert_eq!(state.adamw.weight_decay[0], 0.01);
        assert!((state.adamw.weight_decay[1] - 1e-5).abs() < 1e-18);
        assert_eq!(state.adamw.weight_decay[2], 0.01);
    }

    #[test]
    fn frozen_layers_broadcast_a_single_list() {
        let frozen = FrozenLayers::new(vec![vec![0, 2]], 3).unwrap();
        assert!(frozen.contains(1, 0));
        assert!(!frozen.contains(2, 1));
        assert!(FrozenLayers::new(vec![vec![0], vec![1]], 3).is_err());
        let per_species = FrozenLayers::new(vec![vec![], vec![1], vec![]], 3).unwrap();
        assert!(per_species.contains(1, 1));
        assert!(!per_species.contains(0, 1));
    }

    #[test]
    fn frozen_layers_do_not_move() {
        let mut networks = small_networks(1, 3);
        let mut molecule = methanol_like();
        molecule.set_scalar(ENERGY, -115.0);
        let sample = Sample::new(&networks, &molecule, ENERGY, None).unwrap();
        let (_, grads) = batch_gradients(
            &networks,
            &[&sample],
            LossSettings {
                force_coefficient: 0.1,
                median_loss: false,
            },
        );
        let before = networks.clone();
        let mut state = OptimizerState::new(&networks, settings());
        state.apply(&mut networks, &grads, &FrozenLayers::new(vec![vec![0]], 3).unwrap());
        for s in 0..3 {
            assert_eq!(
                networks.members[0][s].layers[0],
                before.members[0][s].layers[0]
            );
        }
        assert_ne!(networks.members[0][1].layers[2], before.members[0][1].layers[2]);
    }

    #[test]
    fn energy_loss_gradient_matches_finite_difference() {
        let networks = small_networks(1, 9);
        let mut a = methanol_like();
        a.set_scalar(ENERGY, -115.2);
        let mut b = methanol_like();
        b.atoms[1].position.x += 0.05;
        b.set_scalar(ENERGY, -115.1);
        b.set_flat_atom_vectors(ENERGY_GRADIENTS, &[0.01; 15]);
        let samples = [
            Sample::new(&networks, &a, ENERGY, Some(ENERGY_GRADIENTS)).unwrap(),
            Sample::new(&networks, &b, ENERGY, Some(ENERGY_GRADIENTS)).unwrap(),
        ];
        let batch: Vec<&Sample> = samples.iter().collect();
        let loss_settings = LossSettings {
            force_coefficient: 0.5,
            median_loss: false,
        };
        let (_, grads) = batch_gradients(&networks, &batch, loss_settings);
        let h = 1e-6;
        for (s, l) in [(0, 0), (1, 1), (2, 2)] {
            let mut plus = networks.clone();
            let mut minus = networks.clone();
            plus.members[0][s].layers[l].weight[(0, 1)] += h;
            minus.members[0][s].layers[l].weight[(0, 1)] -= h;
            let numeric = (batch_gradients(&plus, &batch, loss_settings).0
                - batch_gradients(&minus, &batch, loss_settings).0)
                / (2.0 * h);
            assert!((numeric - grads[0][s].weights[l][(0, 1)]).abs() < 1e-5);
        }
    }

    #[test]
    fn median_loss_uses_lower_median_residual() {
        assert_eq!(lower_median(&[(0, 3.0), (1, 1.0), (2, 2.0), (3, 5.0)]), Some(2));
        assert_eq!(lower_median(&[]), None);
    }

    #[test]
    fn validation_error_of_perfect_fit_is_zero() {
        let networks = small_networks(1, 2);
        let mut molecule = methanol_like();
        let energy = networks.evaluate(None, &molecule, false).unwrap().0;
        molecule.set_scalar(ENERGY, energy);
        let sample = Sample::new(&networks, &molecule, ENERGY, None).unwrap();
        assert!(validation_error(&networks, &[sample.clone(), sample], 1).abs() < 1e-6);
    }
}
