//! Provides persistence for trained model state.
//!
//! Every trainable model serializes to a single self-describing bundle through the
//! [`ModelFile`](traits::ModelFile) trait, so a trial can write to a private location and a
//! later process can restore the model without re-specifying its hyperparameters.

pub mod traits;
