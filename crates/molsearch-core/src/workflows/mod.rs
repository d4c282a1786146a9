//! # Workflows Module
//!
//! This module provides the model-selection workflows of molsearch: validating a trainable
//! model against labelled molecules and searching its hyperparameters for the lowest
//! validation loss.
//!
//! ## Overview
//!
//! A workflow drives a [`TrainableModel`](crate::engine::model::TrainableModel) through
//! repeated train, predict and reset cycles. Each cycle sees the model in a clean state, so
//! trials never leak fitted state or model files into one another. Control flow is strictly
//! sequential: one trial, one training run and one prediction pass at a time.
//!
//! ## Architecture
//!
//! - **Validation** ([`validation`]) - Holdout and k-fold cross-validation, the default
//!   geometric RMSE loss and caller-supplied loss functions
//! - **Search Strategies** ([`search`]) - Bounded Nelder-Mead, projected gradient descent,
//!   coordinate-descent grid sweeps and the tree-structured Parzen estimator
//! - **Optimization Driver** ([`optimize`]) - Trial bookkeeping, scratch model files,
//!   progress reporting and CSV export of the trial history
//! - **Configuration** ([`config`]) - Builder and TOML loading for search settings
//!
//! ## Key Capabilities
//!
//! - **One evaluation contract** shared by every strategy: a vector of hyperparameter
//!   values in, a scalar validation loss out
//! - **Log-space searches** for scale hyperparameters such as kernel widths and ridge terms
//! - **Fail-fast trials** where any training or prediction failure aborts the search

pub mod config;
pub mod optimize;
pub mod search;
pub mod validation;
