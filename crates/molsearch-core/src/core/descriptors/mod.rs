//! Geometry descriptors consumed by the trainable models.
//!
//! - [`relative`] - Inverse pair distances relative to an equilibrium geometry (kernel models)
//! - [`aev`] - Per-atom radial/angular environment vectors (network ensembles)
//!
//! Both are written over [`Real`](crate::core::autodiff::Real) so that their coordinate
//! derivatives come from the same code path as their values.

pub mod aev;
pub mod relative;
