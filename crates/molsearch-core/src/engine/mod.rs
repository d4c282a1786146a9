//! # Engine Module
//!
//! This module implements the stateful model layer of molsearch: everything that predicts,
//! trains, or combines predictions for molecules.
//!
//! ## Overview
//!
//! Every model implements the [`model::Model`] contract: it writes its predictions into the
//! property bags of the molecules it is handed and never returns them directly. Trainable
//! models additionally implement [`model::TrainableModel`], which exposes the
//! hyperparameters and model file that validation and hyperparameter search operate on.
//!
//! ## Architecture
//!
//! - **Model Contract** ([`model`]) - Prediction requests, the `Model` and `TrainableModel` traits
//! - **External Methods** ([`methods`]) - Program registry, location resolution, subprocess backends
//! - **Kernel Regression** ([`kreg`]) - Gradient-enhanced kernel ridge regression
//! - **Network Ensembles** ([`ani`]) - Element-wise neural networks, ensemble children, pretrained methods
//! - **Composition** ([`tree`]) - Arena-backed trees that sum or average child models
//! - **Records** ([`record`]) - JSON descriptions from which any model can be rebuilt
//! - **Progress Monitoring** ([`progress`]) - Progress reporting callbacks
//! - **Error Handling** ([`error`]) - The model error taxonomy
//!
//! ## Key Capabilities
//!
//! - **Uniform prediction** of energies, energy gradients and Hessians through one request type
//! - **Composite potentials** whose partial results stay inspectable per tree node
//! - **Parallel evaluation** of kernel matrices and batched predictions behind the `parallel` feature
//! - **Persistence** of trained models as self-contained JSON bundles

pub mod ani;
pub mod error;
pub mod kreg;
pub mod methods;
pub mod model;
pub mod progress;
pub mod record;
pub(crate) mod threads;
pub mod tree;
