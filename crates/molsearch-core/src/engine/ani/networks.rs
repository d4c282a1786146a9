use nalgebra::DVector;
use rand::Rng;
#[cfg(feature = "parallel")]
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::io::{BufRead, Write};
use std::ops::Range;

use crate::core::descriptors::aev::{AevComputer, AevParameters};
use crate::core::io::traits::{ModelFile, PersistenceError, read_json, write_json};
use crate::core::models::element::element_symbol;
use crate::core::models::molecule::Molecule;
use crate::core::nn::mlp::{Mlp, MlpGradients};
use crate::core::nn::shifter::EnergyShifter;
use crate::engine::error::ModelError;
use crate::engine::model::{HESSIAN_STEP, PredictionTargets, hessian_from_gradients};
use crate::engine::threads::with_thread_cap;

/// A per-element network ensemble over atomic environment vectors.
///
/// `members[k][s]` is the network of ensemble member `k` for species `species_order[s]`.
/// The predicted energy of a molecule is the member average of the summed atomic network
/// outputs plus the self energies of its atoms.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AniNetworks {
    pub species_order: Vec<u8>,
    pub aev: AevComputer,
    pub shifter: EnergyShifter,
    pub members: Vec<Vec<Mlp>>,
}

impl ModelFile for AniNetworks {
    type Error = PersistenceError;

    fn read_from(reader: &mut impl BufRead) -> Result<Self, Self::Error> {
        read_json(reader)
    }

    fn write_to(&self, writer: &mut impl Write) -> Result<(), Self::Error> {
        write_json(self, writer)
    }
}

/// AEVs of one molecule, optionally with their coordinate derivatives (`tangents[c][a]`).
#[derive(Debug, Clone)]
pub(crate) struct Environments {
    pub species: Vec<usize>,
    pub aevs: Vec<DVector<f64>>,
    pub tangents: Option<Vec<Vec<DVector<f64>>>>,
}

/// Maps every atom of `molecule` to its position in `species_order`.
pub(crate) fn map_species(species_order: &[u8], molecule: &Molecule) -> Result<Vec<usize>, ModelError> {
    molecule
        .atoms
        .iter()
        .map(|atom| {
            species_order
                .iter()
                .position(|&z| z == atom.atomic_number)
                .ok_or_else(|| {
                    ModelError::InvalidArgument(format!(
                        "element {} is not among the supported species {:?}",
                        element_symbol(atom.atomic_number)
                            .map(str::to_string)
                            .unwrap_or_else(|| atom.atomic_number.to_string()),
                        species_order
                    ))
                })
        })
        .collect()
}

impl AniNetworks {
    /// Builds a single freshly initialized member with `neurons[s]` hidden widths per species.
    ///
    /// A single width list is shared by every species.
    pub fn new<R: Rng>(
        species_order: Vec<u8>,
        parameters: AevParameters,
        shifter: EnergyShifter,
        neurons: &[Vec<usize>],
        rng: &mut R,
    ) -> Result<Self, ModelError> {
        let aev = AevComputer::new(parameters, species_order.len());
        let member = Self::build_member(&aev, species_order.len(), neurons, rng)?;
        Ok(Self {
            species_order,
            aev,
            shifter,
            members: vec![member],
        })
    }

    fn build_member<R: Rng>(
        aev: &AevComputer,
        num_species: usize,
        neurons: &[Vec<usize>],
        rng: &mut R,
    ) -> Result<Vec<Mlp>, ModelError> {
        if neurons.len() != 1 && neurons.len() != num_species {
            return Err(ModelError::InvalidArgument(format!(
                "neurons lists {} layouts for {} species",
                neurons.len(),
                num_species
            )));
        }
        let inputs = aev.aev_length();
        Ok((0..num_species)
            .map(|s| Mlp::new(inputs, &neurons[s.min(neurons.len() - 1)], rng))
            .collect())
    }

    /// Replaces every member with a freshly built one of the given layout.
    pub fn rebuild<R: Rng>(&mut self, neurons: &[Vec<usize>], rng: &mut R) -> Result<(), ModelError> {
        let member = Self::build_member(&self.aev, self.species_order.len(), neurons, rng)?;
        self.members = vec![member];
        Ok(())
    }

    pub fn reinitialize<R: Rng>(&mut self, rng: &mut R) {
        self.members
            .iter_mut()
            .flatten()
            .for_each(|mlp| mlp.reinitialize(rng));
    }

    pub fn member_count(&self) -> usize {
        self.members.len()
    }

    /// Maps every atom to its species index.
    ///
    /// # Errors
    ///
    /// Returns [`ModelError::InvalidArgument`] for an element the networks were not built for.
    pub fn species_indices(&self, molecule: &Molecule) -> Result<Vec<usize>, ModelError> {
        map_species(&self.species_order, molecule)
    }

    pub(crate) fn environments(
        &self,
        molecule: &Molecule,
        with_tangents: bool,
    ) -> Result<Environments, ModelError> {
        let species = self.species_indices(molecule)?;
        let coordinates = molecule.flat_coordinates();
        let (aevs, tangents) = if with_tangents {
            let (aevs, tangents) = self.aev.compute_with_tangents(&species, &coordinates);
            (aevs, Some(tangents))
        } else {
            (self.aev.compute_values(&species, &coordinates), None)
        };
        Ok(Environments {
            species,
            aevs,
            tangents,
        })
    }

    fn members_in(&self, member: Option<usize>) -> Result<Range<usize>, ModelError> {
        match member {
            None if self.members.is_empty() => {
                Err(ModelError::Configuration("ensemble has no members".into()))
            }
            None => Ok(0..self.members.len()),
            Some(k) if k < self.members.len() => Ok(k..k + 1),
            Some(k) => Err(ModelError::InvalidArgument(format!(
                "ensemble member {k} does not exist ({} members)",
                self.members.len()
            ))),
        }
    }

    /// Network energy (without self energies) and its coordinate gradient, averaged over
    /// the selected members.
    pub(crate) fn network_output(
        &self,
        members: Range<usize>,
        env: &Environments,
    ) -> (f64, Option<Vec<f64>>) {
        let scale = 1.0 / members.len() as f64;
        let mut energy = 0.0;
        let mut atom_gradients = env
            .tangents
            .as_ref()
            .map(|_| vec![DVector::<f64>::zeros(self.aev.aev_length()); env.aevs.len()]);
        for member in &self.members[members] {
            for (a, (aev, &s)) in env.aevs.iter().zip(&env.species).enumerate() {
                let network = &member[s];
                energy += scale * network.forward(aev);
                if let Some(g) = atom_gradients.as_mut() {
                    g[a].axpy(scale, &network.input_gradient(aev), 1.0);
                }
            }
        }
        let gradient = match (atom_gradients, &env.tangents) {
            (Some(g), Some(tangents)) => Some(
                tangents
                    .iter()
                    .map(|per_atom| per_atom.iter().zip(&g).map(|(t, ga)| ga.dot(t)).sum())
                    .collect(),
            ),
            _ => None,
        };
        (energy, gradient)
    }

    /// Accumulates parameter gradients of `d_energy * E + d_gradient · ∇E` into `grads`,
    /// indexed like `members`.
    pub(crate) fn backpropagate(
        &self,
        env: &Environments,
        d_energy: f64,
        d_gradient: Option<&[f64]>,
        grads: &mut [Vec<MlpGradients>],
    ) {
        let scale = 1.0 / self.members.len() as f64;
        let weighted = |a: usize| -> Option<DVector<f64>> {
            let (w, tangents) = (d_gradient?, env.tangents.as_ref()?);
            let mut t = DVector::zeros(env.aevs[a].len());
            for (c, per_atom) in tangents.iter().enumerate() {
                if w[c] != 0.0 {
                    t.axpy(w[c], &per_atom[a], 1.0);
                }
            }
            Some(t)
        };
        for (a, (aev, &s)) in env.aevs.iter().zip(&env.species).enumerate() {
            let tangent = weighted(a);
            if d_energy == 0.0 && tangent.is_none() {
                continue;
            }
            let g_tangent = if tangent.is_some() { scale } else { 0.0 };
            for (k, member) in self.members.iter().enumerate() {
                member[s].accumulate_gradients(
                    aev,
                    tangent.as_ref(),
                    scale * d_energy,
                    g_tangent,
                    &mut grads[k][s],
                );
            }
        }
    }

    /// Total energy and, if requested, its flat coordinate gradient.
    ///
    /// `member` selects one ensemble member; `None` averages all of them.
    pub fn evaluate(
        &self,
        member: Option<usize>,
        molecule: &Molecule,
        with_gradient: bool,
    ) -> Result<(f64, Option<Vec<f64>>), ModelError> {
        let members = self.members_in(member)?;
        let env = self.environments(molecule, with_gradient)?;
        let (energy, gradient) = self.network_output(members, &env);
        Ok((energy + self.shifter.shift(&env.species), gradient))
    }

    /// Writes the requested targets of one molecule.
    pub(crate) fn predict_into(
        &self,
        member: Option<usize>,
        molecule: &mut Molecule,
        targets: &PredictionTargets,
    ) -> Result<(), ModelError> {
        let with_gradient = targets.xyz_derivative_property.is_some();
        let (energy, gradient) = self.evaluate(member, molecule, with_gradient)?;
        if let Some(name) = &targets.property {
            molecule.set_scalar(name, energy);
        }
        if let (Some(name), Some(g)) = (&targets.xyz_derivative_property, gradient) {
            molecule.set_flat_atom_vectors(name, &g);
        }
        if let Some(name) = &targets.hessian {
            let hessian = hessian_from_gradients(molecule, HESSIAN_STEP, |m| {
                self.evaluate(member, m, true)
                    .map(|(_, g)| g.unwrap_or_default())
            })?;
            molecule.set_tensor(name, hessian);
        }
        Ok(())
    }

    /// Predicts every molecule, in parallel when the `parallel` feature is enabled.
    pub(crate) fn predict_all(
        &self,
        member: Option<usize>,
        molecules: &mut [Molecule],
        targets: &PredictionTargets,
        nthreads: Option<usize>,
    ) -> Result<(), ModelError> {
        with_thread_cap(nthreads, || {
            #[cfg(not(feature = "parallel"))]
            let mut iterator = molecules.iter_mut();
            #[cfg(feature = "parallel")]
            let iterator = molecules.par_iter_mut();

            iterator.try_for_each(|molecule| self.predict_into(member, molecule, targets))
        })
    }
}
