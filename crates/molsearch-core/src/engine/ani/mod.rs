//! Per-element neural network ensembles over atomic environment vectors.
//!
//! A molecular energy is the sum of atomic contributions, each produced by the network of
//! the atom's element from its environment vector, plus per-element self energies. Forces
//! follow from differentiating the environment vectors with respect to the coordinates.
//!
//! - [`Ani`] trains a network set with AdamW (weights) and SGD (biases) under plateau
//!   schedulers, checkpoints the best epoch and reloads it at the end.
//! - [`AniChild`] exposes a single ensemble member as a model so ensembles can be
//!   decomposed into [`ModelTree`](crate::engine::tree::ModelTree) leaves.
//! - [`AniMethod`] serves named pretrained ensembles read from the `anidir` directory.

mod child;
mod model;
mod networks;
mod pretrained;
mod training;

pub use child::AniChild;
pub use model::{
    Ani, AniBundle, AniOptions, BATCH_SIZE, EARLY_STOPPING_LEARNING_RATE, FORCE_COEFFICIENT,
    LEARNING_RATE, LR_REDUCE_FACTOR, LR_REDUCE_PATIENCE, LR_REDUCE_THRESHOLD, MAX_EPOCHS,
    MEDIAN_LOSS, NEURONS, default_hyperparameters,
};
pub use networks::AniNetworks;
pub use pretrained::{AniMethod, DISPERSION_NODE};
pub use training::{OptimizerState, SchedulerSettings, TrainingOptions, ValidationData};
