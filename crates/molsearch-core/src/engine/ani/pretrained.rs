use nalgebra::DMatrix;
use serde_json::json;
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info};

use super::child::ensemble_tree;
use super::networks::AniNetworks;
use crate::core::io::traits::ModelFile;
use crate::core::models::molecule::Molecule;
use crate::engine::error::ModelError;
use crate::engine::methods::{Method, Program, ProgramLocator};
use crate::engine::model::{Model, PredictionRequest};
use crate::engine::record::ModelRecord;
use crate::engine::tree::ModelTree;

/// Name of the dispersion leaf of `-D4` ensembles.
pub const DISPERSION_NODE: &str = "d4_wb97x";

/// Energies (Hartree) of isolated atoms, used for single-atom molecules.
const ATOMIC_ENERGIES: &[(&str, &[(u8, f64)])] = &[(
    "ANI-1ccx",
    &[
        (1, -0.50088088),
        (6, -37.79199048),
        (7, -54.53379230),
        (8, -75.00968205),
    ],
)];

/// A named pretrained ensemble (`ANI-1x`, `ANI-1ccx`, `ANI-2x` and their `-D4` variants).
///
/// Ensembles are read from `<anidir>/<name>.json`, where `<name>` is the lowercase method
/// without dashes and without the `-D4` suffix (e.g. `ani1ccx.json`). Prediction runs a
/// model tree that averages the members and, for `-D4` methods, adds the D4 dispersion
/// correction for the wB97X functional.
#[derive(Debug)]
pub struct AniMethod {
    method: String,
    species: Vec<u8>,
    tree: ModelTree,
}

impl AniMethod {
    /// Loads the ensemble for `method` from `directory`.
    ///
    /// # Errors
    ///
    /// Returns [`ModelError::Configuration`] for methods outside the ANI registry or when the
    /// dispersion program cannot be resolved, and persistence errors when the ensemble file
    /// cannot be read.
    pub fn load(
        method: &str,
        directory: &Path,
        locator: &dyn ProgramLocator,
    ) -> Result<Self, ModelError> {
        if !Program::Ani.supports(method) {
            return Err(ModelError::Configuration(format!(
                "'{method}' is not an available ANI method"
            )));
        }
        let model_name = method.to_lowercase().replace('-', "");
        let with_dispersion = model_name.ends_with("d4");
        let file = directory.join(format!(
            "{}.json",
            model_name.strip_suffix("d4").unwrap_or(&model_name)
        ));
        let networks =
            AniNetworks::read_from_path(&file).map_err(|e| ModelError::persistence(&file, e))?;
        info!(
            method,
            path = %file.display(),
            members = networks.member_count(),
            "Loaded pretrained ensemble"
        );
        let species = networks.species_order.clone();

        let dispersion = if with_dispersion {
            let kwargs = BTreeMap::from([("functional".to_string(), json!("wb97x"))]);
            let d4: Box<dyn Model> = Box::new(Method::resolve("D4", None, kwargs, locator)?);
            Some((DISPERSION_NODE, d4))
        } else {
            None
        };
        let tree = ensemble_tree(Arc::new(networks), &model_name, dispersion, None)?;
        Ok(Self {
            method: method.to_string(),
            species,
            tree,
        })
    }

    pub fn method(&self) -> &str {
        &self.method
    }

    /// Elements the ensemble supports.
    pub fn species(&self) -> &[u8] {
        &self.species
    }

    pub fn tree(&self) -> &ModelTree {
        &self.tree
    }

    fn atomic_energy(&self, atomic_number: u8) -> Result<f64, ModelError> {
        ATOMIC_ENERGIES
            .iter()
            .find(|(m, _)| m.eq_ignore_ascii_case(&self.method))
            .and_then(|(_, table)| table.iter().find(|(z, _)| *z == atomic_number))
            .map(|(_, e)| *e)
            .ok_or_else(|| {
                ModelError::InvalidArgument(format!(
                    "{} has no tabulated energy for isolated atoms of element {atomic_number}",
                    self.method
                ))
            })
    }

    fn predict_atom(&self, molecule: &mut Molecule, request: &PredictionRequest) -> Result<(), ModelError> {
        let mut targets = request.targets();
        if targets.is_empty() {
            targets = PredictionRequest::energy().targets();
        }
        let energy = self.atomic_energy(molecule.atoms[0].atomic_number)?;
        if let Some(name) = &targets.property {
            molecule.set_scalar(name, energy);
        }
        if let Some(name) = &targets.xyz_derivative_property {
            molecule.set_flat_atom_vectors(name, &[0.0; 3]);
        }
        if let Some(name) = &targets.hessian {
            molecule.set_tensor(name, DMatrix::zeros(3, 3));
        }
        Ok(())
    }
}

impl Model for AniMethod {
    fn kind(&self) -> &'static str {
        "ani_method"
    }

    fn predict_batch(
        &mut self,
        molecules: &mut [Molecule],
        request: &PredictionRequest,
    ) -> Result<(), ModelError> {
        for molecule in molecules.iter_mut() {
            if let Some(atom) = molecule
                .atoms
                .iter()
                .find(|a| !self.species.contains(&a.atomic_number))
            {
                return Err(ModelError::InvalidArgument(format!(
                    "{} supports elements {:?} only, found {}",
                    self.method, self.species, atom.atomic_number
                )));
            }
        }
        for molecule in molecules.iter_mut() {
            if molecule.atom_count() == 1 {
                debug!(method = %self.method, "Using tabulated atomic energy");
                self.predict_atom(molecule, request)?;
            } else {
                self.tree
                    .predict_batch(std::slice::from_mut(molecule), request)?;
            }
        }
        Ok(())
    }

    fn set_num_threads(&mut self, nthreads: usize) {
        self.tree.set_num_threads(nthreads);
    }

    fn config_multiprocessing(&mut self) {
        self.tree.config_multiprocessing();
    }

    fn to_record(&self) -> Result<ModelRecord, ModelError> {
        Ok(ModelRecord::Method {
            method: self.method.clone(),
            program: Some(Program::Ani.name().to_string()),
            kwargs: BTreeMap::new(),
        })
    }
}
