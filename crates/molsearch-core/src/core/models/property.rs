use nalgebra::{DMatrix, Vector3};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// A typed value stored under a caller-chosen property name on a molecule.
///
/// Backends and ensembles attach differently named outputs, so the set of names is open,
/// but every value is one of three shapes: a molecular scalar (e.g. an energy), one
/// Cartesian vector per atom (e.g. energy gradients), or a dense tensor (e.g. a Hessian).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "data", rename_all = "snake_case")]
pub enum PropertyValue {
    /// A single number describing the whole molecule.
    Scalar(f64),
    /// One three-component vector per atom, in atom order.
    AtomVectors(Vec<Vector3<f64>>),
    /// A dense matrix, typically `3N x 3N`.
    Tensor(DMatrix<f64>),
}

impl PropertyValue {
    pub fn as_scalar(&self) -> Option<f64> {
        match self {
            Self::Scalar(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_atom_vectors(&self) -> Option<&[Vector3<f64>]> {
        match self {
            Self::AtomVectors(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_tensor(&self) -> Option<&DMatrix<f64>> {
        match self {
            Self::Tensor(m) => Some(m),
            _ => None,
        }
    }

    /// Flattens the value into a plain list of numbers (row-major for tensors).
    pub fn flatten(&self) -> Vec<f64> {
        match self {
            Self::Scalar(v) => vec![*v],
            Self::AtomVectors(v) => v.iter().flat_map(|g| [g.x, g.y, g.z]).collect(),
            Self::Tensor(m) => m.transpose().iter().copied().collect(),
        }
    }

    /// Elementwise sum of two values of the same shape.
    ///
    /// Returns `None` if the variants or dimensions differ.
    pub fn checked_add(&self, other: &PropertyValue) -> Option<PropertyValue> {
        match (self, other) {
            (Self::Scalar(a), Self::Scalar(b)) => Some(Self::Scalar(a + b)),
            (Self::AtomVectors(a), Self::AtomVectors(b)) if a.len() == b.len() => Some(
                Self::AtomVectors(a.iter().zip(b).map(|(x, y)| x + y).collect()),
            ),
            (Self::Tensor(a), Self::Tensor(b)) if a.shape() == b.shape() => {
                Some(Self::Tensor(a + b))
            }
            _ => None,
        }
    }

    /// Returns a copy multiplied by `factor`.
    pub fn scaled(&self, factor: f64) -> PropertyValue {
        match self {
            Self::Scalar(v) => Self::Scalar(v * factor),
            Self::AtomVectors(v) => Self::AtomVectors(v.iter().map(|g| g * factor).collect()),
            Self::Tensor(m) => Self::Tensor(m * factor),
        }
    }

    fn map(&self, f: impl Fn(f64) -> f64) -> PropertyValue {
        match self {
            Self::Scalar(v) => Self::Scalar(f(*v)),
            Self::AtomVectors(v) => Self::AtomVectors(v.iter().map(|g| g.map(&f)).collect()),
            Self::Tensor(m) => Self::Tensor(m.map(&f)),
        }
    }

    fn zip_map(&self, other: &PropertyValue, f: impl Fn(f64, f64) -> f64) -> Option<PropertyValue> {
        match (self, other) {
            (Self::Scalar(a), Self::Scalar(b)) => Some(Self::Scalar(f(*a, *b))),
            (Self::AtomVectors(a), Self::AtomVectors(b)) if a.len() == b.len() => {
                Some(Self::AtomVectors(
                    a.iter().zip(b).map(|(x, y)| x.zip_map(y, &f)).collect(),
                ))
            }
            (Self::Tensor(a), Self::Tensor(b)) if a.shape() == b.shape() => {
                Some(Self::Tensor(a.zip_map(b, &f)))
            }
            _ => None,
        }
    }

    /// Sums a non-empty list of same-shaped values.
    pub fn sum_of(values: &[&PropertyValue]) -> Option<PropertyValue> {
        let (first, rest) = values.split_first()?;
        rest.iter()
            .try_fold((*first).clone(), |acc, value| acc.checked_add(value))
    }

    /// Elementwise arithmetic mean of a non-empty list of same-shaped values.
    pub fn mean_of(values: &[&PropertyValue]) -> Option<PropertyValue> {
        let sum = Self::sum_of(values)?;
        Some(sum.scaled(1.0 / values.len() as f64))
    }

    /// Elementwise population standard deviation of a non-empty list of same-shaped values.
    pub fn standard_deviation_of(values: &[&PropertyValue]) -> Option<PropertyValue> {
        let mean = Self::mean_of(values)?;
        let squared: Vec<PropertyValue> = values
            .iter()
            .map(|v| v.zip_map(&mean, |x, m| (x - m).powi(2)))
            .collect::<Option<_>>()?;
        let refs: Vec<&PropertyValue> = squared.iter().collect();
        Some(Self::mean_of(&refs)?.map(f64::sqrt))
    }
}

/// Partial results computed by one model-tree node for one molecule.
///
/// Each node of a model tree keeps its own container on the molecule so that the
/// contribution of every term stays inspectable after the combined result has been
/// propagated to the molecule's top-level properties.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NodeProperties {
    pub name: String,
    pub parent: Option<String>,
    pub children: Vec<String>,
    pub values: HashMap<String, PropertyValue>,
}

impl NodeProperties {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            ..Self::default()
        }
    }

    pub fn get(&self, property: &str) -> Option<&PropertyValue> {
        self.values.get(property)
    }

    pub fn set(&mut self, property: &str, value: PropertyValue) {
        self.values.insert(property.to_string(), value);
    }
}
