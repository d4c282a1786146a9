//! Named, typed and bounded model hyperparameters.
//!
//! A [`HyperparameterSet`](set::HyperparameterSet) is what search strategies mutate between
//! validation trials. Each entry carries the interval and the
//! [`OptimizationSpace`](hyperparameter::OptimizationSpace) a strategy needs to sample it.

pub mod hyperparameter;
pub mod set;
pub mod value;

use thiserror::Error;
use value::DType;

#[derive(Debug, Error, PartialEq)]
pub enum HyperparameterError {
    #[error("Cannot coerce value '{value}' of hyperparameter '{name}' to {dtype}")]
    Coercion {
        name: String,
        dtype: DType,
        value: String,
    },
    #[error("Hyperparameter '{name}' does not hold a {expected} value")]
    WrongType { name: String, expected: DType },
    #[error("Unknown hyperparameter '{0}'")]
    UnknownKey(String),
    #[error("Hyperparameter '{0}' has no search bounds")]
    MissingBounds(String),
}

pub use hyperparameter::{Hyperparameter, OptimizationSpace};
pub use set::HyperparameterSet;
pub use value::HyperValue;
