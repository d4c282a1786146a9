use std::path::PathBuf;
use thiserror::Error;

use crate::core::hyperparameters::HyperparameterError;
use crate::core::io::traits::PersistenceError;
use crate::core::models::database::DataError;

#[derive(Debug, Error)]
pub enum ModelError {
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Operation '{operation}' is not implemented for {model}")]
    NotImplemented {
        model: &'static str,
        operation: &'static str,
    },

    #[error("Method '{method}' returned no usable '{property}'")]
    BackendFailure { method: String, property: String },

    #[error("Numerical failure: {0}")]
    NumericalFailure(String),

    #[error("Missing property: {source}")]
    MissingProperty {
        #[from]
        source: DataError,
    },

    #[error("I/O error on {path:?}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to read or write model file {path:?}: {source}")]
    Serialization {
        path: PathBuf,
        source: PersistenceError,
    },

    #[error("Hyperparameter error: {source}")]
    Hyperparameter {
        #[from]
        source: HyperparameterError,
    },
}

impl ModelError {
    pub(crate) fn persistence(path: impl Into<PathBuf>, source: PersistenceError) -> Self {
        ModelError::Serialization {
            path: path.into(),
            source,
        }
    }

    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        ModelError::Io {
            path: path.into(),
            source,
        }
    }
}
