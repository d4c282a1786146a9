//! # Core Models Module
//!
//! This module contains the data structures used to represent molecules and labelled
//! molecular datasets throughout molsearch.
//!
//! ## Overview
//!
//! The models are deliberately small: a molecule is a geometry plus an open bag of
//! named properties, and a database is an ordered list of molecules. Everything a model
//! computes is written back into these structures rather than returned, so composite
//! models can attach differently named outputs without their caller's involvement.
//!
//! ## Key Components
//!
//! - [`atom`] - Element identity and Cartesian position of a single atom
//! - [`element`] - Static element symbol / atomic number table
//! - [`property`] - Typed property values and per-node result containers
//! - [`molecule`] - Geometry plus named properties
//! - [`database`] - Ordered molecule collections with slicing, filtering and batching
//!
//! ## Usage
//!
//! ```ignore
//! use molsearch::core::models::{database::MolecularDatabase, molecule::Molecule};
//!
//! let mut h2 = Molecule::from_numbers_and_coordinates(&[(1, [0.0; 3]), (1, [0.0, 0.0, 0.74])]);
//! h2.set_scalar("energy", -1.17);
//! let db = MolecularDatabase::from_molecules(vec![h2]);
//! let energies = db.scalar_column("energy")?;
//! ```

pub mod atom;
pub mod database;
pub mod element;
pub mod molecule;
pub mod property;
