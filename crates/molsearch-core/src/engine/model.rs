use nalgebra::DMatrix;
use std::path::{Path, PathBuf};
use tracing::debug;
use uuid::Uuid;

use super::error::ModelError;
use super::record::ModelRecord;
use crate::core::hyperparameters::HyperparameterSet;
use crate::core::models::database::MolecularDatabase;
use crate::core::models::molecule::{ENERGY, ENERGY_GRADIENTS, HESSIAN, Molecule};

/// Default property name for predicted scalar labels.
pub const ESTIMATED_Y: &str = "estimated_y";
/// Default property name for predicted per-atom derivatives.
pub const ESTIMATED_XYZ_DERIVATIVES_Y: &str = "estimated_xyz_derivatives_y";
/// Default property name for predicted Hessians.
pub const ESTIMATED_HESSIAN_Y: &str = "estimated_hessian_y";

/// What a `predict` call should compute and where to store it.
///
/// The `calculate_*` flags take precedence over the explicit names: requesting energies
/// always writes to `"energy"`, gradients to `"energy_gradients"` and Hessians to
/// `"hessian"`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PredictionRequest {
    pub calculate_energy: bool,
    pub calculate_energy_gradients: bool,
    pub calculate_hessian: bool,
    pub property_to_predict: Option<String>,
    pub xyz_derivative_property_to_predict: Option<String>,
    pub hessian_to_predict: Option<String>,
    pub batch_size: Option<usize>,
}

/// The resolved property names a prediction writes to.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PredictionTargets {
    pub property: Option<String>,
    pub xyz_derivative_property: Option<String>,
    pub hessian: Option<String>,
}

impl PredictionTargets {
    pub fn is_empty(&self) -> bool {
        self.property.is_none() && self.xyz_derivative_property.is_none() && self.hessian.is_none()
    }

    /// Scalar-shaped names (property and Hessian) followed by the per-atom name.
    pub fn names(&self) -> Vec<&str> {
        [&self.property, &self.hessian, &self.xyz_derivative_property]
            .into_iter()
            .filter_map(|n| n.as_deref())
            .collect()
    }
}

impl PredictionRequest {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn energy() -> Self {
        Self::new().with_energy(true)
    }

    pub fn energy_and_gradients() -> Self {
        Self::new().with_energy(true).with_energy_gradients(true)
    }

    pub fn with_energy(mut self, on: bool) -> Self {
        self.calculate_energy = on;
        self
    }

    pub fn with_energy_gradients(mut self, on: bool) -> Self {
        self.calculate_energy_gradients = on;
        self
    }

    pub fn with_hessian(mut self, on: bool) -> Self {
        self.calculate_hessian = on;
        self
    }

    pub fn with_property(mut self, name: &str) -> Self {
        self.property_to_predict = Some(name.to_string());
        self
    }

    pub fn with_xyz_derivative_property(mut self, name: &str) -> Self {
        self.xyz_derivative_property_to_predict = Some(name.to_string());
        self
    }

    pub fn with_hessian_property(mut self, name: &str) -> Self {
        self.hessian_to_predict = Some(name.to_string());
        self
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = Some(batch_size);
        self
    }

    /// Resolves the property names to write.
    pub fn targets(&self) -> PredictionTargets {
        fn pick(flag: bool, fixed: &str, name: &Option<String>) -> Option<String> {
            if flag {
                Some(fixed.to_string())
            } else {
                name.clone()
            }
        }
        PredictionTargets {
            property: pick(self.calculate_energy, ENERGY, &self.property_to_predict),
            xyz_derivative_property: pick(
                self.calculate_energy_gradients,
                ENERGY_GRADIENTS,
                &self.xyz_derivative_property_to_predict,
            ),
            hessian: pick(self.calculate_hessian, HESSIAN, &self.hessian_to_predict),
        }
    }

    /// Like [`PredictionRequest::targets`], but falls back to `"estimated_y"` when nothing
    /// at all was requested.
    pub fn targets_or_estimated(&self) -> PredictionTargets {
        let mut targets = self.targets();
        if targets.is_empty() {
            targets.property = Some(ESTIMATED_Y.to_string());
        }
        targets
    }
}

/// The polymorphic unit of computation.
///
/// Results are never returned directly: every implementation writes its outputs into the
/// property bags of the molecules it is given.
pub trait Model: Send {
    /// A short label of the model kind used in diagnostics (e.g. `"kreg"`).
    fn kind(&self) -> &'static str;

    /// Predicts the requested properties for a slice of molecules, in place.
    fn predict_batch(
        &mut self,
        molecules: &mut [Molecule],
        request: &PredictionRequest,
    ) -> Result<(), ModelError>;

    /// Predicts for exactly one of a single molecule or a whole database.
    ///
    /// A database is handed to [`Model::predict_batch`] in chunks of at most
    /// `request.batch_size` molecules, or in one piece when no batch size is set.
    ///
    /// # Errors
    ///
    /// Returns [`ModelError::InvalidArgument`] unless exactly one input is supplied.
    fn predict(
        &mut self,
        molecule: Option<&mut Molecule>,
        molecular_database: Option<&mut MolecularDatabase>,
        request: &PredictionRequest,
    ) -> Result<(), ModelError> {
        match (molecule, molecular_database) {
            (Some(molecule), None) => self.predict_batch(std::slice::from_mut(molecule), request),
            (None, Some(database)) => {
                let batch_size = request.batch_size.unwrap_or(database.len());
                for batch in database.batches_mut(batch_size) {
                    self.predict_batch(batch, request)?;
                }
                Ok(())
            }
            (Some(_), Some(_)) => Err(ModelError::InvalidArgument(
                "provide either a molecule or a molecular database, not both".into(),
            )),
            (None, None) => Err(ModelError::InvalidArgument(
                "either a molecule or a molecular database must be provided".into(),
            )),
        }
    }

    fn predict_molecule(
        &mut self,
        molecule: &mut Molecule,
        request: &PredictionRequest,
    ) -> Result<(), ModelError> {
        self.predict(Some(molecule), None, request)
    }

    fn predict_database(
        &mut self,
        molecular_database: &mut MolecularDatabase,
        request: &PredictionRequest,
    ) -> Result<(), ModelError> {
        self.predict(None, Some(molecular_database), request)
    }

    /// Fits the model to labelled molecules.
    fn train(
        &mut self,
        _molecular_database: &MolecularDatabase,
        _property_to_learn: Option<&str>,
        _xyz_derivative_property_to_learn: Option<&str>,
    ) -> Result<(), ModelError> {
        Err(ModelError::NotImplemented {
            model: self.kind(),
            operation: "train",
        })
    }

    /// Caps the number of threads the model may use internally.
    fn set_num_threads(&mut self, _nthreads: usize) {}

    /// Prepares the model to run alongside other model instances in separate processes.
    fn config_multiprocessing(&mut self) {}

    /// Removes ephemeral artifacts created by training.
    fn reset(&mut self) -> Result<(), ModelError> {
        Ok(())
    }

    /// Describes how to reconstruct this model.
    fn to_record(&self) -> Result<ModelRecord, ModelError>;
}

/// A model whose fitted state is governed by hyperparameters and persisted to a file.
pub trait TrainableModel: Model {
    fn hyperparameters(&self) -> &HyperparameterSet;

    fn hyperparameters_mut(&mut self) -> &mut HyperparameterSet;

    fn model_file(&self) -> Option<&Path>;

    fn set_model_file(&mut self, path: Option<PathBuf>);

    /// Writes the fitted state to the model file, choosing a fresh name if none is set.
    fn save(&mut self) -> Result<PathBuf, ModelError>;

    /// Restores fitted state from `path` and adopts it as the model file.
    fn load(&mut self, path: &Path) -> Result<(), ModelError>;
}

/// Returns `<kind>_<uuid>.<extension>` in the working directory.
pub fn default_model_file(kind: &str, extension: &str) -> PathBuf {
    PathBuf::from(format!("{kind}_{}.{extension}", Uuid::new_v4()))
}

/// Deletes a model file if it exists.
pub fn remove_model_file(path: Option<&Path>) -> Result<(), ModelError> {
    if let Some(path) = path {
        if path.exists() {
            debug!(path = %path.display(), "Removing model file");
            std::fs::remove_file(path).map_err(|e| ModelError::io(path, e))?;
        }
    }
    Ok(())
}

/// Cartesian displacement used for Hessians differentiated from analytic gradients.
pub const HESSIAN_STEP: f64 = 1e-4;

/// Builds a symmetrized Hessian by central differences of an analytic gradient.
pub(crate) fn hessian_from_gradients(
    molecule: &Molecule,
    step: f64,
    mut gradient: impl FnMut(&Molecule) -> Result<Vec<f64>, ModelError>,
) -> Result<DMatrix<f64>, ModelError> {
    let origin = molecule.flat_coordinates();
    let dim = origin.len();
    let mut displaced = Molecule::new(molecule.atoms.clone())
        .with_charge_and_multiplicity(molecule.charge, molecule.multiplicity);
    let mut hessian = DMatrix::<f64>::zeros(dim, dim);
    let mut x = origin.clone();
    for k in 0..dim {
        x[k] = origin[k] + step;
        displaced.set_flat_coordinates(&x);
        let forward = gradient(&displaced)?;
        x[k] = origin[k] - step;
        displaced.set_flat_coordinates(&x);
        let backward = gradient(&displaced)?;
        x[k] = origin[k];
        for r in 0..dim {
            hessian[(r, k)] = (forward[r] - backward[r]) / (2.0 * step);
        }
    }
    Ok((&hessian + hessian.transpose()) * 0.5)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    struct Constant;

    impl Model for Constant {
        fn kind(&self) -> &'static str {
            "constant"
        }

        fn predict_batch(
            &mut self,
            molecules: &mut [Molecule],
            request: &PredictionRequest,
        ) -> Result<(), ModelError> {
            let targets = request.targets_or_estimated();
            for m in molecules {
                if let Some(p) = &targets.property {
                    m.set_scalar(p, 1.0);
                }
            }
            Ok(())
        }

        fn to_record(&self) -> Result<ModelRecord, ModelError> {
            Err(ModelError::NotImplemented {
                model: "constant",
                operation: "to_record",
            })
        }
    }

    fn h2() -> Molecule {
        Molecule::from_numbers_and_coordinates(&[(1, [0.0; 3]), (1, [0.0, 0.0, 0.74])])
    }

    #[test]
    fn predict_rejects_both_inputs() {
        let mut mol = h2();
        let mut db = MolecularDatabase::from_molecules(vec![h2()]);
        let err = Constant
            .predict(Some(&mut mol), Some(&mut db), &PredictionRequest::energy())
            .unwrap_err();
        assert!(matches!(err, ModelError::InvalidArgument(_)));
    }

    #[test]
    fn predict_rejects_missing_input() {
        let err = Constant
            .predict(None, None, &PredictionRequest::energy())
            .unwrap_err();
        assert!(matches!(err, ModelError::InvalidArgument(_)));
    }

    struct BatchRecorder(Vec<usize>);

    impl Model for BatchRecorder {
        fn kind(&self) -> &'static str {
            "batch_recorder"
        }

        fn predict_batch(
            &mut self,
            molecules: &mut [Molecule],
            _request: &PredictionRequest,
        ) -> Result<(), ModelError> {
            self.0.push(molecules.len());
            Ok(())
        }

        fn to_record(&self) -> Result<ModelRecord, ModelError> {
            Err(ModelError::NotImplemented {
                model: "batch_recorder",
                operation: "to_record",
            })
        }
    }

    #[test]
    fn databases_are_predicted_in_batches() {
        let mut db = MolecularDatabase::from_molecules(vec![h2(); 5]);
        let mut model = BatchRecorder(Vec::new());
        model
            .predict_database(&mut db, &PredictionRequest::energy().with_batch_size(2))
            .unwrap();
        assert_eq!(model.0, vec![2, 2, 1]);

        model.0.clear();
        model.predict_database(&mut db, &PredictionRequest::energy()).unwrap();
        assert_eq!(model.0, vec![5]);
    }

    #[test]
    fn train_defaults_to_not_implemented() {
        let db = MolecularDatabase::from_molecules(vec![h2()]);
        let err = Constant.train(&db, Some("energy"), None).unwrap_err();
        assert!(matches!(
            err,
            ModelError::NotImplemented {
                operation: "train",
                ..
            }
        ));
    }

    #[test]
    fn flags_override_explicit_names() {
        let request = PredictionRequest::new()
            .with_property("y")
            .with_energy_gradients(true)
            .with_xyz_derivative_property("g");
        let targets = request.targets();
        assert_eq!(targets.property.as_deref(), Some("y"));
        assert_eq!(targets.xyz_derivative_property.as_deref(), Some(ENERGY_GRADIENTS));
        assert!(targets.hessian.is_none());
        assert_eq!(
            PredictionRequest::new().targets_or_estimated().property.as_deref(),
            Some(ESTIMATED_Y)
        );
    }

    #[test]
    fn predict_single_molecule_writes_in_place() {
        let mut mol = h2();
        Constant
            .predict_molecule(&mut mol, &PredictionRequest::energy())
            .unwrap();
        assert_eq!(mol.scalar(ENERGY), Some(1.0));
    }

    #[test]
    fn hessian_of_harmonic_well_is_diagonal() {
        let mol = h2();
        let hessian = hessian_from_gradients(&mol, HESSIAN_STEP, |m| {
            Ok(m.flat_coordinates().iter().map(|x| 2.0 * x).collect())
        })
        .unwrap();
        for r in 0..6 {
            for c in 0..6 {
                let expected = if r == c { 2.0 } else { 0.0 };
                assert!((hessian[(r, c)] - expected).abs() < 1e-8);
            }
        }
    }

    #[test]
    fn default_model_file_is_unique() {
        let a = default_model_file("kreg", "json");
        let b = default_model_file("kreg", "json");
        assert_ne!(a, b);
        assert!(a.to_string_lossy().starts_with("kreg_"));
    }

    #[test]
    fn remove_model_file_is_idempotent() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("model.json");
        std::fs::write(&path, "{}").unwrap();
        remove_model_file(Some(&path)).unwrap();
        assert!(!path.exists());
        remove_model_file(Some(&path)).unwrap();
        remove_model_file(None).unwrap();
    }
}
