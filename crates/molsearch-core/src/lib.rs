//! # molsearch Core Library
//!
//! Model abstraction, composition and hyperparameter optimization for automated molecular
//! structure search.
//!
//! ## Architectural Philosophy
//!
//! The library is designed with a strict three-layer architecture to ensure a clear separation of concerns,
//! making it modular, testable, and extensible.
//!
//! - **[`core`]: The Foundation.** Contains stateless data models (`Molecule`,
//!   `MolecularDatabase`), typed hyperparameters, and the pure mathematics the models build on:
//!   descriptors, Gaussian kernels, forward-mode derivatives and small feed-forward networks.
//!
//! - **[`engine`]: The Logic Core.** This stateful layer defines the `Model` contract and its
//!   implementations: external quantum-chemistry programs behind a closed method registry, the
//!   KREG kernel model, element-wise neural network ensembles, and `ModelTree` composites that
//!   sum or average them.
//!
//! - **[`workflows`]: The Public API.** This is the highest-level layer. It drives trainable
//!   models through holdout and cross-validation trials and searches their hyperparameters with
//!   local, grid or TPE strategies.

pub mod core;
pub mod engine;
pub mod workflows;
