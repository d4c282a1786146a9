//! # Core Module
//!
//! This module provides the stateless building blocks of molsearch: molecular data,
//! hyperparameters, and the numerical kernels that the trainable models are built from.
//!
//! ## Overview
//!
//! Nothing in this layer knows about training loops, external programs or model
//! composition. It only describes molecules and evaluates mathematics on them, which keeps
//! every piece independently testable.
//!
//! ## Architecture
//!
//! - **Molecular Representation** ([`models`]) - Atoms, molecules with named properties, datasets
//! - **Hyperparameters** ([`hyperparameters`]) - Typed, bounded values with search-space hints
//! - **Differentiation** ([`autodiff`]) - Forward-mode dual numbers for descriptor Jacobians
//! - **Descriptors** ([`descriptors`]) - Relative-to-equilibrium and atomic environment vectors
//! - **Kernels** ([`kernel`]) - Gaussian kernel values, gradients and mixed Hessians
//! - **Networks** ([`nn`]) - Dense networks, optimizers, schedulers and self-energy fitting
//! - **Persistence** ([`io`]) - The model-file bundle interface
//!
//! ## Scientific Foundation
//!
//! - **Kernel ridge regression** on inverse-distance descriptors, with gradient-enhanced
//!   training through analytic kernel derivatives
//! - **High-dimensional neural network potentials**, where a molecular energy is a sum of
//!   element-specific atomic contributions over rotation- and translation-invariant
//!   atomic environment vectors

pub mod autodiff;
pub mod descriptors;
pub mod hyperparameters;
pub mod io;
pub mod kernel;
pub mod models;
pub mod nn;
