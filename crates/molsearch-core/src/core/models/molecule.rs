use super::atom::Atom;
use super::property::{NodeProperties, PropertyValue};
use nalgebra::{DMatrix, Point3, Vector3};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::collections::hash_map::Entry;

/// Property name under which reference energies are conventionally stored.
pub const ENERGY: &str = "energy";
/// Property name under which energy gradients (per-atom vectors) are conventionally stored.
pub const ENERGY_GRADIENTS: &str = "energy_gradients";
/// Property name under which the Cartesian Hessian is conventionally stored.
pub const HESSIAN: &str = "hessian";

/// A molecular geometry together with an open-ended bag of named properties.
///
/// The geometry (elements and coordinates) is fixed by the caller. Models write their
/// outputs into the property bag under caller-chosen names, and model-tree nodes keep
/// their partial results in separate per-node containers so that every term of a
/// composite potential stays inspectable.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Molecule {
    /// A human-readable label; not required to be unique.
    pub name: String,
    /// The total charge in elementary charge units.
    pub charge: i32,
    /// The spin multiplicity (2S + 1).
    pub multiplicity: u32,
    /// The atoms in input order.
    pub atoms: Vec<Atom>,
    properties: HashMap<String, PropertyValue>,
    #[serde(default)]
    node_results: HashMap<String, NodeProperties>,
}

impl Molecule {
    /// Creates a neutral singlet molecule from a list of atoms.
    ///
    /// # Arguments
    ///
    /// * `atoms` - The atoms of the molecule, in the order their per-atom properties will use.
    pub fn new(atoms: Vec<Atom>) -> Self {
        Self {
            multiplicity: 1,
            atoms,
            ..Self::default()
        }
    }

    pub fn with_name(mut self, name: &str) -> Self {
        self.name = name.to_string();
        self
    }

    pub fn with_charge_and_multiplicity(mut self, charge: i32, multiplicity: u32) -> Self {
        self.charge = charge;
        self.multiplicity = multiplicity;
        self
    }

    /// Builds a molecule from `(atomic_number, [x, y, z])` pairs.
    pub fn from_numbers_and_coordinates(atoms: &[(u8, [f64; 3])]) -> Self {
        Self::new(
            atoms
                .iter()
                .map(|(z, p)| Atom::new(*z, Point3::new(p[0], p[1], p[2])))
                .collect(),
        )
    }

    pub fn atom_count(&self) -> usize {
        self.atoms.len()
    }

    pub fn atomic_numbers(&self) -> Vec<u8> {
        self.atoms.iter().map(|a| a.atomic_number).collect()
    }

    pub fn positions(&self) -> Vec<Point3<f64>> {
        self.atoms.iter().map(|a| a.position).collect()
    }

    /// Returns the coordinates flattened as `[x0, y0, z0, x1, ...]`.
    pub fn flat_coordinates(&self) -> Vec<f64> {
        self.atoms
            .iter()
            .flat_map(|a| [a.position.x, a.position.y, a.position.z])
            .collect()
    }

    /// Overwrites the coordinates from a flattened `[x0, y0, z0, ...]` slice.
    ///
    /// # Return
    ///
    /// Returns `false` (and leaves the geometry untouched) if the slice length does not
    /// match `3 * atom_count()`.
    pub fn set_flat_coordinates(&mut self, coordinates: &[f64]) -> bool {
        if coordinates.len() != 3 * self.atoms.len() {
            return false;
        }
        for (atom, xyz) in self.atoms.iter_mut().zip(coordinates.chunks_exact(3)) {
            atom.position = Point3::new(xyz[0], xyz[1], xyz[2]);
        }
        true
    }

    /// Computes the symmetric matrix of interatomic distances.
    pub fn distance_matrix(&self) -> DMatrix<f64> {
        let n = self.atoms.len();
        DMatrix::from_fn(n, n, |i, j| {
            nalgebra::distance(&self.atoms[i].position, &self.atoms[j].position)
        })
    }

    pub fn property(&self, name: &str) -> Option<&PropertyValue> {
        self.properties.get(name)
    }

    pub fn has_property(&self, name: &str) -> bool {
        self.properties.contains_key(name)
    }

    pub fn scalar(&self, name: &str) -> Option<f64> {
        self.property(name).and_then(PropertyValue::as_scalar)
    }

    pub fn atom_vectors(&self, name: &str) -> Option<&[Vector3<f64>]> {
        self.property(name).and_then(PropertyValue::as_atom_vectors)
    }

    pub fn tensor(&self, name: &str) -> Option<&DMatrix<f64>> {
        self.property(name).and_then(PropertyValue::as_tensor)
    }

    pub fn set_property(&mut self, name: &str, value: PropertyValue) {
        self.properties.insert(name.to_string(), value);
    }

    pub fn set_scalar(&mut self, name: &str, value: f64) {
        self.set_property(name, PropertyValue::Scalar(value));
    }

    pub fn set_atom_vectors(&mut self, name: &str, vectors: Vec<Vector3<f64>>) {
        self.set_property(name, PropertyValue::AtomVectors(vectors));
    }

    /// Stores a flattened `[gx0, gy0, gz0, ...]` array as per-atom vectors.
    pub fn set_flat_atom_vectors(&mut self, name: &str, flat: &[f64]) {
        let vectors = flat
            .chunks_exact(3)
            .map(|g| Vector3::new(g[0], g[1], g[2]))
            .collect();
        self.set_atom_vectors(name, vectors);
    }

    pub fn set_tensor(&mut self, name: &str, tensor: DMatrix<f64>) {
        self.set_property(name, PropertyValue::Tensor(tensor));
    }

    pub fn remove_property(&mut self, name: &str) -> Option<PropertyValue> {
        self.properties.remove(name)
    }

    pub fn property_names(&self) -> impl Iterator<Item = &str> {
        self.properties.keys().map(String::as_str)
    }

    /// Returns the per-node results of the model-tree node called `node_name`, if any.
    pub fn node_results(&self, node_name: &str) -> Option<&NodeProperties> {
        self.node_results.get(node_name)
    }

    /// Returns the per-node container for `node_name`, creating an empty one if needed.
    pub fn node_results_mut(&mut self, node_name: &str) -> &mut NodeProperties {
        match self.node_results.entry(node_name.to_string()) {
            Entry::Occupied(e) => e.into_mut(),
            Entry::Vacant(e) => e.insert(NodeProperties::new(node_name)),
        }
    }

    /// Drops the per-node containers of the listed nodes.
    pub fn clear_node_results<'a>(&mut self, node_names: impl IntoIterator<Item = &'a str>) {
        for name in node_names {
            self.node_results.remove(name);
        }
    }

    pub fn node_names(&self) -> impl Iterator<Item = &str> {
        self.node_results.keys().map(String::as_str)
    }
}
