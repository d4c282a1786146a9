//! Small dense networks for element-resolved energy models.
//!
//! - [`mlp`] - Scalar-output networks with value, tangent and second-order backpropagation
//! - [`optim`] - AdamW, SGD and a plateau learning-rate scheduler
//! - [`shifter`] - Least-squares per-species self energies

pub mod mlp;
pub mod optim;
pub mod shifter;
