//! Kernel ridge regression on the relative-to-equilibrium descriptor (KREG).
//!
//! Training solves `(K + Λ) α = y - prior`, where `K` is the Gaussian kernel matrix over the
//! training geometries (extended by derivative rows when gradient labels are learned) and
//! `Λ` carries `lambda` on value rows and `lambdaGradXYZ` on derivative rows. Prediction
//! evaluates the kernel between the query and every training geometry.

use nalgebra::{DMatrix, DVector};
use serde::{Deserialize, Serialize};
use std::io::{BufRead, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, info, instrument, warn};

use super::error::ModelError;
use super::model::{
    HESSIAN_STEP, Model, PredictionRequest, TrainableModel, default_model_file,
    hessian_from_gradients, remove_model_file,
};
use super::record::{MlModelKwargs, ModelRecord};
use super::threads::with_thread_cap;
use crate::core::descriptors::relative::{DescriptorPoint, RelativeDescriptor};
use crate::core::hyperparameters::{Hyperparameter, HyperparameterSet, OptimizationSpace};
use crate::core::io::traits::{ModelFile, PersistenceError, read_json, write_json};
use crate::core::kernel::GaussianKernel;
use crate::core::models::database::MolecularDatabase;
use crate::core::models::molecule::{ENERGY, Molecule};

pub const LAMBDA: &str = "lambda";
pub const LAMBDA_GRAD_XYZ: &str = "lambdaGradXYZ";
pub const SIGMA: &str = "sigma";

/// Name written as `ml_program` in model records.
pub const ML_PROGRAM: &str = "native";

/// Linear solver for the regularized kernel system.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Solver {
    /// Cholesky, falling back to LU when the matrix is not numerically positive definite.
    #[default]
    Auto,
    Cholesky,
    Lu,
    /// Explicit inverse. Slow; useful for inspecting the interpolation limit.
    Inverse,
}

/// Constant offset removed from the labels before fitting.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Prior {
    #[default]
    None,
    Value(f64),
    Mean,
}

impl Prior {
    fn resolve(self, labels: &[f64]) -> f64 {
        match self {
            Prior::None => 0.0,
            Prior::Value(v) => v,
            Prior::Mean => labels.iter().sum::<f64>() / labels.len() as f64,
        }
    }
}

#[derive(Debug, Clone)]
pub struct KregOptions {
    pub model_file: Option<PathBuf>,
    /// Reference geometry for the descriptor. When absent, the training molecule with the
    /// lowest `energy` (else lowest `y`) is used.
    pub equilibrium_molecule: Option<Molecule>,
    pub prior: Prior,
    pub solver: Solver,
    pub save_model: bool,
    pub nthreads: Option<usize>,
}

impl Default for KregOptions {
    fn default() -> Self {
        Self {
            model_file: None,
            equilibrium_molecule: None,
            prior: Prior::None,
            solver: Solver::Auto,
            save_model: true,
            nthreads: None,
        }
    }
}

/// Everything needed to predict, as persisted in the model file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KregBundle {
    pub hyperparameters: HyperparameterSet,
    pub descriptor: RelativeDescriptor,
    pub atomic_numbers: Vec<u8>,
    pub training_coordinates: Vec<Vec<f64>>,
    pub coefficients: Vec<f64>,
    pub prior: f64,
    pub trained_xyz_derivatives: bool,
}

impl ModelFile for KregBundle {
    type Error = PersistenceError;

    fn read_from(reader: &mut impl BufRead) -> Result<Self, Self::Error> {
        read_json(reader)
    }

    fn write_to(&self, writer: &mut impl Write) -> Result<(), Self::Error> {
        write_json(self, writer)
    }
}

#[derive(Debug, Clone)]
struct Fitted {
    bundle: KregBundle,
    points: Vec<DescriptorPoint>,
    sigma: f64,
}

impl Fitted {
    fn from_bundle(bundle: KregBundle) -> Result<Self, ModelError> {
        let natoms = bundle.descriptor.natoms();
        let points = bundle
            .training_coordinates
            .iter()
            .map(|xyz| {
                let atoms: Vec<(u8, [f64; 3])> = bundle
                    .atomic_numbers
                    .iter()
                    .zip(xyz.chunks_exact(3))
                    .map(|(&z, c)| (z, [c[0], c[1], c[2]]))
                    .collect();
                bundle
                    .descriptor
                    .evaluate_with_jacobian(&Molecule::from_numbers_and_coordinates(&atoms))
            })
            .collect::<Option<Vec<_>>>()
            .ok_or_else(|| {
                ModelError::InvalidArgument("stored training geometries do not match descriptor".into())
            })?;
        let expected = points.len() * if bundle.trained_xyz_derivatives { 1 + 3 * natoms } else { 1 };
        if bundle.coefficients.len() != expected {
            return Err(ModelError::InvalidArgument(format!(
                "model holds {} coefficients, expected {}",
                bundle.coefficients.len(),
                expected
            )));
        }
        let sigma = bundle.hyperparameters.f64(SIGMA)?;
        Ok(Self {
            bundle,
            points,
            sigma,
        })
    }
}

/// Default hyperparameters: `lambda` in `[2^-35, 1]` and `sigma` in `[2^-5, 2^9]`, both
/// searched in log space.
pub fn default_hyperparameters() -> HyperparameterSet {
    let mut set = HyperparameterSet::new();
    set.insert(
        LAMBDA,
        Hyperparameter::new(LAMBDA, 2f64.powi(-35))
            .with_bounds(2f64.powi(-35), 1.0)
            .with_space(OptimizationSpace::Log),
    );
    set.insert(
        SIGMA,
        Hyperparameter::new(SIGMA, 1.0)
            .with_bounds(2f64.powi(-5), 2f64.powi(9))
            .with_space(OptimizationSpace::Log),
    );
    set
}

/// The derivative-row ridge hyperparameter, which defaults to `lambda` when absent.
pub fn lambda_grad_xyz(value: f64) -> Hyperparameter {
    Hyperparameter::new(LAMBDA_GRAD_XYZ, value)
        .with_bounds(2f64.powi(-35), 1.0)
        .with_space(OptimizationSpace::Log)
}

#[derive(Debug)]
pub struct Kreg {
    options: KregOptions,
    hyperparameters: HyperparameterSet,
    fitted: Option<Fitted>,
}

impl Kreg {
    /// Creates a model, restoring it from `options.model_file` if that file exists.
    pub fn new(options: KregOptions) -> Result<Self, ModelError> {
        let mut model = Self {
            options,
            hyperparameters: default_hyperparameters(),
            fitted: None,
        };
        if let Some(path) = model.options.model_file.clone() {
            if path.exists() {
                model.load(&path)?;
            }
        }
        Ok(model)
    }

    /// Restores a trained model from its file.
    pub fn from_file(path: &Path) -> Result<Self, ModelError> {
        let mut model = Self::new(KregOptions::default())?;
        model.load(path)?;
        Ok(model)
    }

    pub fn options(&self) -> &KregOptions {
        &self.options
    }

    pub fn options_mut(&mut self) -> &mut KregOptions {
        &mut self.options
    }

    pub fn is_trained(&self) -> bool {
        self.fitted.is_some()
    }

    pub fn bundle(&self) -> Option<&KregBundle> {
        self.fitted.as_ref().map(|f| &f.bundle)
    }

    fn equilibrium_molecule<'a>(
        &'a self,
        database: &'a MolecularDatabase,
    ) -> Result<&'a Molecule, ModelError> {
        if let Some(m) = &self.options.equilibrium_molecule {
            return Ok(m);
        }
        let first = database
            .molecules
            .first()
            .ok_or_else(|| ModelError::InvalidArgument("training database is empty".into()))?;
        let key = [ENERGY, "y"]
            .into_iter()
            .find(|k| first.scalar(k).is_some())
            .ok_or_else(|| {
                ModelError::InvalidArgument(
                    "equilibrium molecule is not provided and no energies are found in the database"
                        .into(),
                )
            })?;
        let values = database.scalar_column(key)?;
        let index = values
            .iter()
            .enumerate()
            .min_by(|a, b| a.1.total_cmp(b.1))
            .map(|(i, _)| i)
            .unwrap_or(0);
        debug!(key, index, "Selected equilibrium molecule");
        Ok(&database.molecules[index])
    }

    fn solve(
        &self,
        matrix: DMatrix<f64>,
        rhs: &DVector<f64>,
    ) -> Result<DVector<f64>, ModelError> {
        let lu = |m: DMatrix<f64>| {
            m.lu().solve(rhs).ok_or_else(|| {
                ModelError::NumericalFailure("kernel matrix is singular (LU)".into())
            })
        };
        let solution = match self.options.solver {
            Solver::Auto => match matrix.clone().cholesky() {
                Some(cholesky) => cholesky.solve(rhs),
                None => {
                    warn!("Cholesky factorization failed, falling back to LU decomposition.");
                    lu(matrix)?
                }
            },
            Solver::Cholesky => matrix
                .cholesky()
                .ok_or_else(|| {
                    ModelError::NumericalFailure("kernel matrix is not positive definite".into())
                })?
                .solve(rhs),
            Solver::Lu => lu(matrix)?,
            Solver::Inverse => {
                matrix
                    .try_inverse()
                    .ok_or_else(|| ModelError::NumericalFailure("kernel matrix is singular".into()))?
                    * rhs
            }
        };
        if solution.iter().all(|a| a.is_finite()) {
            Ok(solution)
        } else {
            Err(ModelError::NumericalFailure(
                "kernel system produced non-finite coefficients".into(),
            ))
        }
    }

    fn fitted(&self) -> Result<&Fitted, ModelError> {
        self.fitted.as_ref().ok_or_else(|| {
            ModelError::Configuration("KREG model has not been trained or loaded".into())
        })
    }

    /// Value and coordinate gradient of the fitted function at one geometry.
    fn evaluate(
        fitted: &Fitted,
        molecule: &Molecule,
        with_gradient: bool,
    ) -> Result<(f64, Option<Vec<f64>>), ModelError> {
        let query = fitted
            .bundle
            .descriptor
            .evaluate_with_jacobian(molecule)
            .ok_or_else(|| {
                ModelError::InvalidArgument(format!(
                    "molecule has {} atoms, model expects {}",
                    molecule.atom_count(),
                    fitted.bundle.descriptor.natoms()
                ))
            })?;
        let kernel = GaussianKernel::new(fitted.sigma);
        let alphas = &fitted.bundle.coefficients;
        let n = fitted.points.len();
        let dim = query.jacobian.ncols();
        let trained_gradients = fitted.bundle.trained_xyz_derivatives;

        let mut value = fitted.bundle.prior;
        let mut gradient = with_gradient.then(|| DVector::<f64>::zeros(dim));
        for (i, train) in fitted.points.iter().enumerate() {
            let terms = kernel.terms(
                train,
                &query,
                trained_gradients,
                with_gradient,
                trained_gradients && with_gradient,
            );
            value += alphas[i] * terms.value;
            if let Some(g) = gradient.as_mut() {
                if let Some(gb) = &terms.gradient_b {
                    g.axpy(alphas[i], gb, 1.0);
                }
            }
            if !trained_gradients {
                continue;
            }
            let block = DVector::from_column_slice(&alphas[n + i * dim..n + (i + 1) * dim]);
            if let Some(ga) = &terms.gradient_a {
                value += block.dot(ga);
            }
            if let (Some(g), Some(h)) = (gradient.as_mut(), &terms.mixed_hessian) {
                *g += h.tr_mul(&block);
            }
        }
        Ok((value, gradient.map(|g| g.as_slice().to_vec())))
    }
}

impl Model for Kreg {
    fn kind(&self) -> &'static str {
        "kreg"
    }

    fn predict_batch(
        &mut self,
        molecules: &mut [Molecule],
        request: &PredictionRequest,
    ) -> Result<(), ModelError> {
        let fitted = self.fitted()?;
        let targets = request.targets_or_estimated();
        let with_gradient = targets.xyz_derivative_property.is_some();
        for molecule in molecules.iter_mut() {
            let (value, gradient) = Self::evaluate(fitted, molecule, with_gradient)?;
            if let Some(name) = &targets.property {
                molecule.set_scalar(name, value);
            }
            if let (Some(name), Some(g)) = (&targets.xyz_derivative_property, gradient) {
                molecule.set_flat_atom_vectors(name, &g);
            }
            if let Some(name) = &targets.hessian {
                let hessian = hessian_from_gradients(molecule, HESSIAN_STEP, |m| {
                    Self::evaluate(fitted, m, true)
                        .map(|(_, g)| g.unwrap_or_default())
                })?;
                molecule.set_tensor(name, hessian);
            }
        }
        Ok(())
    }

    #[instrument(skip_all, name = "kreg_train")]
    fn train(
        &mut self,
        molecular_database: &MolecularDatabase,
        property_to_learn: Option<&str>,
        xyz_derivative_property_to_learn: Option<&str>,
    ) -> Result<(), ModelError> {
        let property = property_to_learn.ok_or_else(|| {
            ModelError::InvalidArgument("KREG requires a scalar property to learn".into())
        })?;
        if molecular_database.is_empty() {
            return Err(ModelError::InvalidArgument("training database is empty".into()));
        }
        let labels = molecular_database.scalar_column(property)?;
        let gradients = xyz_derivative_property_to_learn
            .map(|p| molecular_database.flat_atom_vectors_column(p))
            .transpose()?;

        let equilibrium = self.equilibrium_molecule(molecular_database)?;
        let descriptor = RelativeDescriptor::from_equilibrium(equilibrium);
        let points = molecular_database
            .iter()
            .map(|m| descriptor.evaluate_with_jacobian(m))
            .collect::<Option<Vec<_>>>()
            .ok_or_else(|| {
                ModelError::InvalidArgument(
                    "all training molecules must have the equilibrium atom count".into(),
                )
            })?;

        let sigma = self.hyperparameters.f64(SIGMA)?;
        let lambda = self.hyperparameters.f64(LAMBDA)?;
        let lambda_grad = match self.hyperparameters.get(LAMBDA_GRAD_XYZ) {
            Some(h) => h.as_f64()?,
            None => lambda,
        };
        let prior = self.options.prior.resolve(&labels);
        let with_gradients = gradients.is_some();
        let n = labels.len();
        info!(
            n,
            sigma,
            lambda,
            with_gradients,
            "Training KREG model"
        );

        let kernel = GaussianKernel::new(sigma);
        let mut matrix = with_thread_cap(self.options.nthreads, || {
            kernel.assemble(&points, with_gradients)
        });
        for d in 0..matrix.nrows() {
            matrix[(d, d)] += if d < n { lambda } else { lambda_grad };
        }
        let mut rhs: Vec<f64> = labels.iter().map(|y| y - prior).collect();
        if let Some(g) = &gradients {
            rhs.extend_from_slice(g);
        }
        let rhs = DVector::from_vec(rhs);
        debug!(size = matrix.nrows(), solver = ?self.options.solver, "Solving kernel system");
        let coefficients = self.solve(matrix, &rhs)?;

        let bundle = KregBundle {
            hyperparameters: self.hyperparameters.clone(),
            descriptor,
            atomic_numbers: equilibrium.atomic_numbers(),
            training_coordinates: molecular_database.iter().map(Molecule::flat_coordinates).collect(),
            coefficients: coefficients.as_slice().to_vec(),
            prior,
            trained_xyz_derivatives: with_gradients,
        };
        self.fitted = Some(Fitted {
            bundle,
            points,
            sigma,
        });
        if self.options.save_model {
            self.save()?;
        }
        Ok(())
    }

    fn set_num_threads(&mut self, nthreads: usize) {
        self.options.nthreads = Some(nthreads);
    }

    fn reset(&mut self) -> Result<(), ModelError> {
        remove_model_file(self.options.model_file.as_deref())
    }

    fn to_record(&self) -> Result<ModelRecord, ModelError> {
        let model_file = self.options.model_file.as_ref().ok_or_else(|| {
            ModelError::Configuration("KREG model has no model file to reference".into())
        })?;
        Ok(ModelRecord::MlModel {
            ml_model_type: self.kind().to_string(),
            kwargs: MlModelKwargs {
                model_file: std::path::absolute(model_file)
                    .map_err(|e| ModelError::io(model_file, e))?,
                ml_program: Some(ML_PROGRAM.to_string()),
            },
        })
    }
}

impl TrainableModel for Kreg {
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
        let bundle = &self.fitted()?.bundle;
        let path = self
            .options
            .model_file
            .clone()
            .unwrap_or_else(|| default_model_file(self.kind(), "json"));
        bundle
            .write_to_path(&path)
            .map_err(|e| ModelError::persistence(&path, e))?;
        debug!(path = %path.display(), "Saved KREG model");
        self.options.model_file = Some(path.clone());
        Ok(path)
    }

    fn load(&mut self, path: &Path) -> Result<(), ModelError> {
        let bundle =
            KregBundle::read_from_path(path).map_err(|e| ModelError::persistence(path, e))?;
        self.hyperparameters.update(&bundle.hyperparameters);
        self.fitted = Some(Fitted::from_bundle(bundle)?);
        self.options.model_file = Some(path.to_path_buf());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::models::molecule::ENERGY_GRADIENTS;
    use tempfile::tempdir;

    fn water(stretch: f64, bend: f64) -> Molecule {
        Molecule::from_numbers_and_coordinates(&[
            (8, [0.0, 0.0, 0.0]),
            (1, [0.96 + stretch, 0.0, 0.0]),
            (1, [-0.24 + bend, 0.93, 0.0]),
        ])
    }

    fn potential(m: &Molecule) -> (f64, Vec<f64>) {
        // Harmonic bonds to the first atom.
        let x = m.flat_coordinates();
        let mut e = 0.0;
        let mut g = vec![0.0; x.len()];
        for a in 1..m.atom_count() {
            let d: Vec<f64> = (0..3).map(|c| x[3 * a + c] - x[c]).collect();
            let r = d.iter().map(|v| v * v).sum::<f64>().sqrt();
            e += (r - 0.96).powi(2);
            for c in 0..3 {
                let dr = 2.0 * (r - 0.96) * d[c] / r;
                g[3 * a + c] += dr;
                g[c] -= dr;
            }
        }
        (e, g)
    }

    fn dataset(n: usize, with_gradients: bool) -> MolecularDatabase {
        (0..n)
            .map(|i| {
                let t = i as f64 / n as f64;
                let mut m = water(0.1 * (t - 0.5), 0.08 * (0.5 - t).powi(2));
                let (e, g) = potential(&m);
                m.set_scalar(ENERGY, e);
                if with_gradients {
                    m.set_flat_atom_vectors(ENERGY_GRADIENTS, &g);
                }
                m
            })
            .collect()
    }

    fn unsaved() -> Kreg {
        unsaved_with(KregOptions::default())
    }

    fn unsaved_with(options: KregOptions) -> Kreg {
        let mut model = Kreg::new(KregOptions {
            save_model: false,
            ..options
        })
        .unwrap();
        let hp = model.hyperparameters_mut();
        hp.insert_value(SIGMA, 0.01).unwrap();
        hp.insert_value(LAMBDA, 1e-10).unwrap();
        model
    }

    #[test]
    fn identical_geometries_interpolate_exactly() {
        let db: MolecularDatabase = (0..4)
            .map(|_| {
                let mut m = water(0.0, 0.0);
                m.set_scalar("y", -1.25);
                m
            })
            .collect();
        let mut model = unsaved();
        model.train(&db, Some("y"), None).unwrap();
        let mut query = water(0.0, 0.0);
        model
            .predict_molecule(&mut query, &PredictionRequest::new().with_property("yest"))
            .unwrap();
        assert!((query.scalar("yest").unwrap() + 1.25).abs() < 1e-6);
    }

    #[test]
    fn reproduces_training_labels_with_small_lambda() {
        let db = dataset(6, false);
        let mut model = unsaved();
        model.train(&db, Some(ENERGY), None).unwrap();
        let mut copy = db.clone();
        model
            .predict_database(&mut copy, &PredictionRequest::new().with_property("e"))
            .unwrap();
        for (m, reference) in copy.iter().zip(db.iter()) {
            assert!((m.scalar("e").unwrap() - reference.scalar(ENERGY).unwrap()).abs() < 1e-5);
        }
    }

    #[test]
    fn batched_prediction_matches_single_pass() {
        let db = dataset(5, true);
        let mut model = unsaved();
        model.train(&db, Some(ENERGY), Some(ENERGY_GRADIENTS)).unwrap();
        let request = PredictionRequest::new()
            .with_property("e")
            .with_xyz_derivative_property("g");
        let mut whole = dataset(7, false);
        model.predict_database(&mut whole, &request).unwrap();
        let mut batched = dataset(7, false);
        model
            .predict_database(&mut batched, &request.clone().with_batch_size(1))
            .unwrap();
        for (a, b) in whole.iter().zip(batched.iter()) {
            assert!((a.scalar("e").unwrap() - b.scalar("e").unwrap()).abs() < 1e-12);
            for (ga, gb) in a.atom_vectors("g").unwrap().iter().zip(b.atom_vectors("g").unwrap()) {
                assert!((ga - gb).norm() < 1e-12);
            }
        }
    }

    #[test]
    fn predicted_gradient_matches_finite_difference_of_prediction() {
        let db = dataset(5, true);
        let mut model = unsaved();
        model.train(&db, Some(ENERGY), Some(ENERGY_GRADIENTS)).unwrap();
        let query = water(0.013, 0.021);
        let fitted = model.fitted().unwrap();
        let (_, g) = Kreg::evaluate(fitted, &query, true).unwrap();
        let g = g.unwrap();
        let x0 = query.flat_coordinates();
        let h = 1e-5;
        for k in 0..x0.len() {
            let mut m = query.clone();
            let mut x = x0.clone();
            x[k] += h;
            m.set_flat_coordinates(&x);
            let (ep, _) = Kreg::evaluate(fitted, &m, false).unwrap();
            x[k] -= 2.0 * h;
            m.set_flat_coordinates(&x);
            let (em, _) = Kreg::evaluate(fitted, &m, false).unwrap();
            assert!(((ep - em) / (2.0 * h) - g[k]).abs() < 1e-5, "component {k}");
        }
    }

    #[test]
    fn gradient_training_reproduces_training_gradients() {
        let db = dataset(4, true);
        let mut model = unsaved();
        model.train(&db, Some(ENERGY), Some(ENERGY_GRADIENTS)).unwrap();
        let mut copy = db.clone();
        model
            .predict_database(&mut copy, &PredictionRequest::new().with_xyz_derivative_property("g"))
            .unwrap();
        for (m, reference) in copy.iter().zip(db.iter()) {
            let predicted = m.atom_vectors("g").unwrap();
            let expected = reference.atom_vectors(ENERGY_GRADIENTS).unwrap();
            for (p, e) in predicted.iter().zip(expected) {
                assert!((p - e).norm() < 1e-4);
            }
        }
    }

    #[test]
    fn every_solver_agrees() {
        let db = dataset(5, false);
        let mut reference: Option<Vec<f64>> = None;
        for solver in [Solver::Auto, Solver::Cholesky, Solver::Lu, Solver::Inverse] {
            let mut model = unsaved_with(KregOptions {
                solver,
                ..Default::default()
            });
            model.hyperparameters_mut().insert_value(LAMBDA, 1e-6).unwrap();
            model.train(&db, Some(ENERGY), None).unwrap();
            let c = model.bundle().unwrap().coefficients.clone();
            if let Some(r) = &reference {
                for (a, b) in c.iter().zip(r) {
                    assert!((a - b).abs() < 1e-6 * b.abs().max(1.0));
                }
            } else {
                reference = Some(c);
            }
        }
    }

    #[test]
    fn mean_prior_is_restored_on_prediction() {
        let db = dataset(3, false);
        let mut model = unsaved_with(KregOptions {
            prior: Prior::Mean,
            ..Default::default()
        });
        model.train(&db, Some(ENERGY), None).unwrap();
        let mean = db.scalar_column(ENERGY).unwrap().iter().sum::<f64>() / 3.0;
        assert!((model.bundle().unwrap().prior - mean).abs() < 1e-12);

        // Far from every training point the kernel vanishes and only the prior remains.
        let mut far = water(3.0, -2.0);
        model.predict_molecule(&mut far, &PredictionRequest::energy()).unwrap();
        assert!((far.scalar(ENERGY).unwrap() - mean).abs() < 1e-3);
    }

    #[test]
    fn missing_labels_and_untrained_prediction_fail() {
        let db = dataset(3, false);
        let mut model = unsaved();
        assert!(matches!(
            model.train(&db, Some("missing"), None),
            Err(ModelError::MissingProperty { .. })
        ));
        assert!(matches!(
            model.train(&db, None, None),
            Err(ModelError::InvalidArgument(_))
        ));
        let mut m = water(0.0, 0.0);
        assert!(matches!(
            model.predict_molecule(&mut m, &PredictionRequest::energy()),
            Err(ModelError::Configuration(_))
        ));
    }

    #[test]
    fn wrong_atom_count_is_rejected() {
        let db = dataset(3, false);
        let mut model = unsaved();
        model.train(&db, Some(ENERGY), None).unwrap();
        let mut h2 = Molecule::from_numbers_and_coordinates(&[(1, [0.0; 3]), (1, [0.0, 0.0, 0.7])]);
        assert!(matches!(
            model.predict_molecule(&mut h2, &PredictionRequest::energy()),
            Err(ModelError::InvalidArgument(_))
        ));
    }

    #[test]
    fn save_load_and_reset_round_trip() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("kreg.json");
        let db = dataset(4, false);
        let mut model = Kreg::new(KregOptions {
            model_file: Some(path.clone()),
            ..Default::default()
        })
        .unwrap();
        model.hyperparameters_mut().insert_value(SIGMA, 0.8).unwrap();
        model.train(&db, Some(ENERGY), None).unwrap();
        assert!(path.exists());

        let mut restored = Kreg::from_file(&path).unwrap();
        assert_eq!(restored.hyperparameters().f64(SIGMA).unwrap(), 0.8);
        let mut a = water(0.02, 0.01);
        let mut b = a.clone();
        model.predict_molecule(&mut a, &PredictionRequest::energy()).unwrap();
        restored.predict_molecule(&mut b, &PredictionRequest::energy()).unwrap();
        assert_eq!(a.scalar(ENERGY), b.scalar(ENERGY));

        match model.to_record().unwrap() {
            ModelRecord::MlModel { ml_model_type, kwargs } => {
                assert_eq!(ml_model_type, "kreg");
                assert!(kwargs.model_file.is_absolute());
                assert_eq!(kwargs.ml_program.as_deref(), Some(ML_PROGRAM));
            }
            other => panic!("unexpected record {other:?}"),
        }

        model.reset().unwrap();
        assert!(!path.exists());
    }

    #[test]
    fn hessian_is_symmetric() {
        let db = dataset(4, true);
        let mut model = unsaved();
        model.train(&db, Some(ENERGY), Some(ENERGY_GRADIENTS)).unwrap();
        let mut m = water(0.01, 0.0);
        model
            .predict_molecule(&mut m, &PredictionRequest::new().with_hessian(true))
            .unwrap();
        let h = m.tensor("hessian").unwrap();
        assert_eq!(h.shape(), (9, 9));
        assert!((h - h.transpose()).amax() < 1e-12);
    }
}
