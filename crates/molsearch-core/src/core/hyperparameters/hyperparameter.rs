use super::HyperparameterError;
use super::value::{DType, HyperValue};
use serde::{Deserialize, Serialize};

/// How a search strategy should sample and bound a hyperparameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OptimizationSpace {
    /// Search directly on the value.
    #[default]
    Linear,
    /// Search on the natural logarithm of the value (scale parameters).
    Log,
}

/// A single named, typed, optionally bounded value.
///
/// The value is always coerced to the hyperparameter's [`DType`] on assignment. The
/// dtype is inferred from the first value unless given explicitly, and only changes
/// through [`Hyperparameter::set_dtype`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Hyperparameter {
    pub name: String,
    value: Option<HyperValue>,
    dtype: Option<DType>,
    #[serde(default)]
    pub optimization_space: OptimizationSpace,
    #[serde(default)]
    pub minval: Option<f64>,
    #[serde(default)]
    pub maxval: Option<f64>,
    #[serde(default)]
    pub step: Option<f64>,
    #[serde(default)]
    pub choices: Vec<HyperValue>,
}

impl Hyperparameter {
    /// Creates a hyperparameter whose dtype is inferred from `value`.
    pub fn new(name: &str, value: impl Into<HyperValue>) -> Self {
        let value = value.into();
        Self {
            name: name.to_string(),
            dtype: Some(value.dtype()),
            value: Some(value),
            optimization_space: OptimizationSpace::Linear,
            minval: None,
            maxval: None,
            step: None,
            choices: Vec::new(),
        }
    }

    /// Creates an untyped hyperparameter without a value.
    pub fn empty(name: &str) -> Self {
        Self {
            name: name.to_string(),
            value: None,
            dtype: None,
            optimization_space: OptimizationSpace::Linear,
            minval: None,
            maxval: None,
            step: None,
            choices: Vec::new(),
        }
    }

    pub fn with_space(mut self, space: OptimizationSpace) -> Self {
        self.optimization_space = space;
        self
    }

    pub fn with_bounds(mut self, minval: f64, maxval: f64) -> Self {
        self.minval = Some(minval);
        self.maxval = Some(maxval);
        self
    }

    pub fn with_step(mut self, step: f64) -> Self {
        self.step = Some(step);
        self
    }

    pub fn with_choices(mut self, choices: Vec<HyperValue>) -> Self {
        self.choices = choices;
        self
    }

    /// Fixes the dtype at construction, coercing the current value.
    pub fn with_dtype(mut self, dtype: DType) -> Result<Self, HyperparameterError> {
        self.set_dtype(dtype)?;
        Ok(self)
    }

    pub fn value(&self) -> Option<&HyperValue> {
        self.value.as_ref()
    }

    pub fn dtype(&self) -> Option<DType> {
        self.dtype
    }

    /// Assigns a new value, coercing it to the current dtype.
    ///
    /// An untyped hyperparameter adopts the dtype of the first value it receives.
    ///
    /// # Errors
    ///
    /// Returns [`HyperparameterError::Coercion`] if the value cannot be converted; the
    /// stored value is left unchanged in that case.
    pub fn set_value(&mut self, value: impl Into<HyperValue>) -> Result<(), HyperparameterError> {
        let value = value.into();
        let coerced = match self.dtype {
            Some(dtype) => value
                .coerce(dtype)
                .ok_or_else(|| self.coercion_error(dtype, &value))?,
            None => {
                self.dtype = Some(value.dtype());
                value
            }
        };
        self.value = Some(coerced);
        Ok(())
    }

    /// Explicitly resets the dtype and re-coerces the current value.
    pub fn set_dtype(&mut self, dtype: DType) -> Result<(), HyperparameterError> {
        if let Some(value) = &self.value {
            let coerced = value
                .coerce(dtype)
                .ok_or_else(|| self.coercion_error(dtype, value))?;
            self.value = Some(coerced);
        }
        self.dtype = Some(dtype);
        Ok(())
    }

    fn coercion_error(&self, dtype: DType, value: &HyperValue) -> HyperparameterError {
        HyperparameterError::Coercion {
            name: self.name.clone(),
            dtype,
            value: value.to_string(),
        }
    }

    /// Overwrites every field with the fields of `other`, keeping this name if `other`'s
    /// name is empty.
    pub fn update(&mut self, other: &Hyperparameter) {
        let name = if other.name.is_empty() {
            std::mem::take(&mut self.name)
        } else {
            other.name.clone()
        };
        *self = Hyperparameter {
            name,
            ..other.clone()
        };
    }

    /// Returns an independent copy.
    pub fn copy(&self) -> Hyperparameter {
        self.clone()
    }

    pub fn as_f64(&self) -> Result<f64, HyperparameterError> {
        self.value
            .as_ref()
            .and_then(HyperValue::as_f64)
            .ok_or_else(|| HyperparameterError::WrongType {
                name: self.name.clone(),
                expected: DType::Float,
            })
    }

    pub fn as_i64(&self) -> Result<i64, HyperparameterError> {
        self.value
            .as_ref()
            .and_then(HyperValue::as_i64)
            .ok_or_else(|| HyperparameterError::WrongType {
                name: self.name.clone(),
                expected: DType::Int,
            })
    }

    pub fn as_bool(&self) -> Result<bool, HyperparameterError> {
        self.value
            .as_ref()
            .and_then(HyperValue::as_bool)
            .ok_or_else(|| HyperparameterError::WrongType {
                name: self.name.clone(),
                expected: DType::Bool,
            })
    }

    /// Returns the `(minval, maxval)` search interval.
    pub fn bounds(&self) -> Result<(f64, f64), HyperparameterError> {
        match (self.minval, self.maxval) {
            (Some(lo), Some(hi)) => Ok((lo, hi)),
            _ => Err(HyperparameterError::MissingBounds(self.name.clone())),
        }
    }

    /// Maps a value into the coordinate a search strategy works in.
    pub fn to_search(&self, value: f64) -> f64 {
        match self.optimization_space {
            OptimizationSpace::Linear => value,
            OptimizationSpace::Log => value.ln(),
        }
    }

    /// Inverse of [`Hyperparameter::to_search`].
    pub fn from_search(&self, coordinate: f64) -> f64 {
        match self.optimization_space {
            OptimizationSpace::Linear => coordinate,
            OptimizationSpace::Log => coordinate.exp(),
        }
    }

    /// Returns the search interval in search coordinates.
    pub fn search_bounds(&self) -> Result<(f64, f64), HyperparameterError> {
        let (lo, hi) = self.bounds()?;
        Ok((self.to_search(lo), self.to_search(hi)))
    }
}
