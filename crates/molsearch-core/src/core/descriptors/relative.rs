use crate::core::autodiff::{self, Real};
use crate::core::models::molecule::Molecule;
use nalgebra::{DMatrix, DVector};
use serde::{Deserialize, Serialize};

/// A descriptor value together with its Jacobian with respect to the flattened
/// Cartesian coordinates (`rows = descriptor length`, `cols = 3 * natoms`).
#[derive(Debug, Clone, PartialEq)]
pub struct DescriptorPoint {
    pub values: DVector<f64>,
    pub jacobian: DMatrix<f64>,
}

/// Relative-to-equilibrium (RE) descriptor: `Req_ij / r_ij` for every atom pair `i < j`.
///
/// The descriptor is permutation sensitive, so every molecule it is applied to must list
/// its atoms in the same order as the equilibrium geometry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RelativeDescriptor {
    natoms: usize,
    equilibrium_distances: Vec<f64>,
}

impl RelativeDescriptor {
    /// Builds the descriptor from the interatomic distances of an equilibrium geometry.
    pub fn from_equilibrium(molecule: &Molecule) -> Self {
        let distances = molecule.distance_matrix();
        let natoms = molecule.atom_count();
        let mut equilibrium_distances = Vec::with_capacity(natoms * natoms.saturating_sub(1) / 2);
        for i in 0..natoms {
            for j in (i + 1)..natoms {
                equilibrium_distances.push(distances[(i, j)]);
            }
        }
        Self {
            natoms,
            equilibrium_distances,
        }
    }

    pub fn natoms(&self) -> usize {
        self.natoms
    }

    pub fn len(&self) -> usize {
        self.equilibrium_distances.len()
    }

    pub fn is_empty(&self) -> bool {
        self.equilibrium_distances.is_empty()
    }

    pub fn equilibrium_distances(&self) -> &[f64] {
        &self.equilibrium_distances
    }

    /// Evaluates the descriptor on flattened coordinates of any [`Real`] type.
    pub fn evaluate_generic<T: Real>(&self, coordinates: &[T]) -> Vec<T> {
        let mut out = Vec::with_capacity(self.len());
        let mut k = 0;
        for i in 0..self.natoms {
            for j in (i + 1)..self.natoms {
                let mut r2 = T::constant(0.0);
                for c in 0..3 {
                    let d = coordinates[3 * i + c] - coordinates[3 * j + c];
                    r2 += d * d;
                }
                out.push(T::constant(self.equilibrium_distances[k]) / r2.sqrt());
                k += 1;
            }
        }
        out
    }

    /// Evaluates the descriptor of a molecule.
    ///
    /// # Return
    ///
    /// Returns `None` if the molecule does not have the equilibrium atom count.
    pub fn evaluate(&self, molecule: &Molecule) -> Option<DVector<f64>> {
        (molecule.atom_count() == self.natoms)
            .then(|| DVector::from_vec(self.evaluate_generic(&molecule.flat_coordinates())))
    }

    /// Evaluates the descriptor and its coordinate Jacobian by forward-mode differentiation.
    pub fn evaluate_with_jacobian(&self, molecule: &Molecule) -> Option<DescriptorPoint> {
        if molecule.atom_count() != self.natoms {
            return None;
        }
        let coordinates = molecule.flat_coordinates();
        let (values, jac) = autodiff::jacobian(&coordinates, |x| self.evaluate_generic(x));
        let rows = values.len();
        let cols = coordinates.len();
        Some(DescriptorPoint {
            values: DVector::from_vec(values),
            jacobian: DMatrix::from_fn(rows, cols, |r, c| jac[r][c]),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn triatomic(stretch: f64) -> Molecule {
        Molecule::from_numbers_and_coordinates(&[
            (8, [0.0, 0.0, 0.0]),
            (1, [0.96 * stretch, 0.0, 0.0]),
            (1, [-0.24, 0.93, 0.0]),
        ])
    }

    #[test]
    fn descriptor_of_equilibrium_is_all_ones() {
        let eq = triatomic(1.0);
        let desc = RelativeDescriptor::from_equilibrium(&eq);
        assert_eq!(desc.len(), 3);
        let x = desc.evaluate(&eq).unwrap();
        for v in x.iter() {
            assert!((v - 1.0).abs() < 1e-12);
        }
    }

    #[test]
    fn stretching_a_bond_lowers_its_component() {
        let desc = RelativeDescriptor::from_equilibrium(&triatomic(1.0));
        let x = desc.evaluate(&triatomic(1.1)).unwrap();
        assert!((x[0] - 1.0 / 1.1).abs() < 1e-12);
    }

    #[test]
    fn jacobian_matches_analytic_pair_derivative() {
        let eq = triatomic(1.0);
        let desc = RelativeDescriptor::from_equilibrium(&eq);
        let point = desc.evaluate_with_jacobian(&triatomic(1.2)).unwrap();
        // x0 = Req / |R1 - R0| with R1 - R0 along +x, so dx0/dx1 = -Req / r^2.
        let r = 0.96 * 1.2;
        let expected = -0.96 / (r * r);
        assert!((point.jacobian[(0, 3)] - expected).abs() < 1e-10);
        assert!((point.jacobian[(0, 0)] + expected).abs() < 1e-10);
        assert_eq!(point.jacobian.shape(), (3, 9));
    }

    #[test]
    fn wrong_atom_count_is_rejected() {
        let desc = RelativeDescriptor::from_equilibrium(&triatomic(1.0));
        let h2 = Molecule::from_numbers_and_coordinates(&[(1, [0.0; 3]), (1, [0.7, 0.0, 0.0])]);
        assert!(desc.evaluate(&h2).is_none());
        assert!(desc.evaluate_with_jacobian(&h2).is_none());
    }
}
