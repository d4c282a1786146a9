use rand::Rng;
use rand::seq::SliceRandom;
use tracing::{debug, instrument, trace};

use crate::core::models::database::MolecularDatabase;
use crate::engine::error::ModelError;
use crate::engine::model::{ESTIMATED_XYZ_DERIVATIVES_Y, ESTIMATED_Y, Model, PredictionRequest};

/// The labels a validation trial learns and the request used to predict them back.
#[derive(Debug, Clone, PartialEq)]
pub struct LearningTask {
    pub property_to_learn: Option<String>,
    pub xyz_derivative_property_to_learn: Option<String>,
    pub request: PredictionRequest,
}

impl LearningTask {
    /// Learns the scalar `property`, predicting it into `estimated_y`.
    pub fn new(property: &str) -> Self {
        Self {
            property_to_learn: Some(property.to_string()),
            xyz_derivative_property_to_learn: None,
            request: PredictionRequest::new().with_property(ESTIMATED_Y),
        }
    }

    /// Learns only the per-atom derivative `property`.
    pub fn derivatives_only(property: &str) -> Self {
        Self {
            property_to_learn: None,
            xyz_derivative_property_to_learn: Some(property.to_string()),
            request: PredictionRequest::new()
                .with_xyz_derivative_property(ESTIMATED_XYZ_DERIVATIVES_Y),
        }
    }

    /// Additionally learns the per-atom derivative `property`, predicted into
    /// `estimated_xyz_derivatives_y`.
    pub fn with_xyz_derivatives(mut self, property: &str) -> Self {
        self.xyz_derivative_property_to_learn = Some(property.to_string());
        self.request = self
            .request
            .with_xyz_derivative_property(ESTIMATED_XYZ_DERIVATIVES_Y);
        self
    }

    pub fn with_request(mut self, request: PredictionRequest) -> Self {
        self.request = request;
        self
    }

    /// Pairs every learned label with the property its prediction is written to.
    fn label_pairs(&self) -> Result<LabelPairs, ModelError> {
        let targets = self.request.targets();
        let pair = |label: &Option<String>,
                    predicted: Option<String>,
                    what: &str|
         -> Result<Option<(String, String)>, ModelError> {
            let Some(label) = label else {
                return Ok(None);
            };
            let predicted = predicted.ok_or_else(|| {
                ModelError::InvalidArgument(format!(
                    "the prediction request does not produce a {what} to compare with '{label}'"
                ))
            })?;
            if &predicted == label {
                return Err(ModelError::InvalidArgument(format!(
                    "predictions would overwrite the reference labels '{label}'"
                )));
            }
            Ok(Some((label.clone(), predicted)))
        };
        let scalar = pair(&self.property_to_learn, targets.property, "property")?;
        let derivatives = pair(
            &self.xyz_derivative_property_to_learn,
            targets.xyz_derivative_property,
            "derivative property",
        )?;
        if scalar.is_none() && derivatives.is_none() {
            return Err(ModelError::InvalidArgument(
                "nothing to learn: set a property or a derivative property".into(),
            ));
        }
        Ok(LabelPairs {
            scalar,
            derivatives,
        })
    }

    fn train<M: Model + ?Sized>(&self, model: &mut M, database: &MolecularDatabase) -> Result<(), ModelError> {
        model.train(
            database,
            self.property_to_learn.as_deref(),
            self.xyz_derivative_property_to_learn.as_deref(),
        )
    }
}

/// `(label, prediction)` property names.
struct LabelPairs {
    scalar: Option<(String, String)>,
    derivatives: Option<(String, String)>,
}

/// How the labelled molecules are divided between training and validation.
#[derive(Debug, Clone, PartialEq)]
pub enum ValidationSplit {
    Holdout {
        subtraining: MolecularDatabase,
        validation: MolecularDatabase,
    },
    CrossValidation {
        splits: Vec<MolecularDatabase>,
    },
}

impl ValidationSplit {
    pub fn holdout(subtraining: MolecularDatabase, validation: MolecularDatabase) -> Self {
        ValidationSplit::Holdout {
            subtraining,
            validation,
        }
    }

    /// Randomly assigns `fraction` of the molecules to the subtraining set.
    pub fn sample_holdout<R: Rng>(database: &MolecularDatabase, fraction: f64, rng: &mut R) -> Self {
        let (subtraining, validation) = database.sample_split(fraction, rng);
        Self::holdout(database.select(&subtraining), database.select(&validation))
    }

    /// Splits into `k` contiguous folds whose sizes differ by at most one.
    ///
    /// # Errors
    ///
    /// Returns [`ModelError::InvalidArgument`] if `k` is zero or exceeds the number of molecules.
    pub fn k_fold(database: &MolecularDatabase, k: usize) -> Result<Self, ModelError> {
        let folds = database
            .fold_indices(k)
            .map_err(|e| ModelError::InvalidArgument(e.to_string()))?;
        Ok(ValidationSplit::CrossValidation {
            splits: folds.iter().map(|f| database.select(f)).collect(),
        })
    }

    /// Like [`ValidationSplit::k_fold`], after shuffling the molecules.
    pub fn k_fold_shuffled<R: Rng>(
        database: &MolecularDatabase,
        k: usize,
        rng: &mut R,
    ) -> Result<Self, ModelError> {
        let mut order: Vec<usize> = (0..database.len()).collect();
        order.shuffle(rng);
        Self::k_fold(&database.select(&order), k)
    }

    /// The databases predictions are written to, in order.
    pub fn validation_sets(&self) -> Vec<&MolecularDatabase> {
        match self {
            ValidationSplit::Holdout { validation, .. } => vec![validation],
            ValidationSplit::CrossValidation { splits } => splits.iter().collect(),
        }
    }
}

/// Reference labels and predictions a validation loss is computed from. Derivatives are
/// flattened over all atoms of all molecules.
#[derive(Debug, Clone, Copy, Default)]
pub struct LossInputs<'a> {
    pub y: Option<&'a [f64]>,
    pub estimated_y: Option<&'a [f64]>,
    pub xyz_derivatives: Option<&'a [f64]>,
    pub estimated_xyz_derivatives: Option<&'a [f64]>,
}

/// A caller-supplied replacement for [`geometric_rmse`].
pub type LossFunction<'a> = dyn Fn(&LossInputs<'_>) -> f64 + 'a;

pub fn rmse(estimated: &[f64], reference: &[f64]) -> f64 {
    if reference.is_empty() {
        return 0.0;
    }
    let sse: f64 = estimated
        .iter()
        .zip(reference)
        .map(|(e, r)| (e - r).powi(2))
        .sum();
    (sse / reference.len() as f64).sqrt()
}

/// RMSE of the learned scalar, RMSE of the learned derivatives, or the square root of their
/// product when both are learned.
pub fn geometric_rmse(inputs: &LossInputs<'_>) -> f64 {
    let mut total = 1.0;
    let mut terms = 0;
    if let (Some(estimated), Some(reference)) = (inputs.estimated_y, inputs.y) {
        total *= rmse(estimated, reference);
        terms += 1;
    }
    if let (Some(estimated), Some(reference)) =
        (inputs.estimated_xyz_derivatives, inputs.xyz_derivatives)
    {
        total *= rmse(estimated, reference);
        terms += 1;
    }
    if terms == 2 { total.sqrt() } else { total }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ValidationOutcome {
    pub loss: f64,
    /// Loss of each cross-validation split, when requested.
    pub split_losses: Option<Vec<f64>>,
}

/// Trains on `subtraining`, predicts `validation` in place and resets the model.
pub fn holdout_validation<M: Model + ?Sized>(
    model: &mut M,
    subtraining: &MolecularDatabase,
    validation: &mut MolecularDatabase,
    task: &LearningTask,
) -> Result<(), ModelError> {
    task.train(model, subtraining)?;
    model.predict_database(validation, &task.request)?;
    model.reset()
}

/// For every split, trains on the union of the others, predicts the split in place and
/// resets the model.
pub fn cross_validation<M: Model + ?Sized>(
    model: &mut M,
    splits: &mut [MolecularDatabase],
    task: &LearningTask,
) -> Result<(), ModelError> {
    for held_out in 0..splits.len() {
        let subtraining: MolecularDatabase = splits
            .iter()
            .enumerate()
            .filter(|(j, _)| *j != held_out)
            .flat_map(|(_, s)| s.iter().cloned())
            .collect();
        trace!(fold = held_out, n = subtraining.len(), "Cross-validation fold");
        task.train(model, &subtraining)?;
        model.predict_database(&mut splits[held_out], &task.request)?;
        model.reset()?;
    }
    Ok(())
}

#[derive(Debug, Default)]
struct Columns {
    y: Option<Vec<f64>>,
    estimated_y: Option<Vec<f64>>,
    xyz_derivatives: Option<Vec<f64>>,
    estimated_xyz_derivatives: Option<Vec<f64>>,
}

impl Columns {
    fn read(database: &MolecularDatabase, pairs: &LabelPairs) -> Result<Self, ModelError> {
        let mut columns = Columns::default();
        if let Some((label, predicted)) = &pairs.scalar {
            columns.y = Some(database.scalar_column(label)?);
            columns.estimated_y = Some(database.scalar_column(predicted)?);
        }
        if let Some((label, predicted)) = &pairs.derivatives {
            columns.xyz_derivatives = Some(database.flat_atom_vectors_column(label)?);
            columns.estimated_xyz_derivatives = Some(database.flat_atom_vectors_column(predicted)?);
        }
        Ok(columns)
    }

    fn append(&mut self, other: Columns) {
        fn extend(into: &mut Option<Vec<f64>>, from: Option<Vec<f64>>) {
            if let Some(from) = from {
                into.get_or_insert_with(Vec::new).extend(from);
            }
        }
        extend(&mut self.y, other.y);
        extend(&mut self.estimated_y, other.estimated_y);
        extend(&mut self.xyz_derivatives, other.xyz_derivatives);
        extend(&mut self.estimated_xyz_derivatives, other.estimated_xyz_derivatives);
    }

    fn inputs(&self) -> LossInputs<'_> {
        LossInputs {
            y: self.y.as_deref(),
            estimated_y: self.estimated_y.as_deref(),
            xyz_derivatives: self.xyz_derivatives.as_deref(),
            estimated_xyz_derivatives: self.estimated_xyz_derivatives.as_deref(),
        }
    }
}

/// Runs one holdout or cross-validation trial and computes its loss.
///
/// Cross-validation losses are computed over the predictions of all splits together. With
/// `calculate_split_errors`, the loss of each split is reported as well.
#[instrument(skip_all, name = "validation_loss")]
pub fn calculate_validation_loss<M: Model + ?Sized>(
    model: &mut M,
    split: &mut ValidationSplit,
    task: &LearningTask,
    loss_function: Option<&LossFunction<'_>>,
    calculate_split_errors: bool,
) -> Result<ValidationOutcome, ModelError> {
    let pairs = task.label_pairs()?;
    let evaluate = |columns: &Columns| match loss_function {
        Some(f) => f(&columns.inputs()),
        None => geometric_rmse(&columns.inputs()),
    };

    let outcome = match split {
        ValidationSplit::Holdout {
            subtraining,
            validation,
        } => {
            holdout_validation(model, subtraining, validation, task)?;
            ValidationOutcome {
                loss: evaluate(&Columns::read(validation, &pairs)?),
                split_losses: None,
            }
        }
        ValidationSplit::CrossValidation { splits } => {
            cross_validation(model, splits, task)?;
            let per_split = splits
                .iter()
                .map(|s| Columns::read(s, &pairs))
                .collect::<Result<Vec<_>, _>>()?;
            let split_losses = calculate_split_errors
                .then(|| per_split.iter().map(&evaluate).collect::<Vec<_>>());
            let mut all = Columns::default();
            for columns in per_split {
                all.append(columns);
            }
            ValidationOutcome {
                loss: evaluate(&all),
                split_losses,
            }
        }
    };
    debug!(loss = outcome.loss, "Validation loss");
    Ok(outcome)
}
