use super::molecule::Molecule;
use nalgebra::Vector3;
use rand::Rng;
use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use thiserror::Error;

#[derive(Debug, Error, PartialEq)]
pub enum DataError {
    #[error("Molecule {index} has no property '{property}'")]
    MissingProperty { property: String, index: usize },
    #[error("Property '{property}' of molecule {index} has the wrong shape")]
    WrongShape { property: String, index: usize },
    #[error("Cannot split {len} molecules into {folds} folds")]
    InvalidSplit { len: usize, folds: usize },
}

/// An ordered collection of molecules, the unit of training and batched prediction.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MolecularDatabase {
    pub molecules: Vec<Molecule>,
}

impl MolecularDatabase {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_molecules(molecules: Vec<Molecule>) -> Self {
        Self { molecules }
    }

    pub fn len(&self) -> usize {
        self.molecules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.molecules.is_empty()
    }

    pub fn push(&mut self, molecule: Molecule) {
        self.molecules.push(molecule);
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Molecule> {
        self.molecules.iter()
    }

    pub fn iter_mut(&mut self) -> std::slice::IterMut<'_, Molecule> {
        self.molecules.iter_mut()
    }

    /// Returns a new database holding copies of the molecules in `range`.
    pub fn slice(&self, range: std::ops::Range<usize>) -> Self {
        let end = range.end.min(self.len());
        let start = range.start.min(end);
        Self::from_molecules(self.molecules[start..end].to_vec())
    }

    /// Returns a new database holding copies of the molecules at `indices`, in that order.
    ///
    /// Out-of-range indices are skipped.
    pub fn select(&self, indices: &[usize]) -> Self {
        Self::from_molecules(
            indices
                .iter()
                .filter_map(|&i| self.molecules.get(i).cloned())
                .collect(),
        )
    }

    /// Returns copies of the molecules that carry `property`.
    pub fn filter_by_property(&self, property: &str) -> Self {
        Self::from_molecules(
            self.molecules
                .iter()
                .filter(|m| m.has_property(property))
                .cloned()
                .collect(),
        )
    }

    /// Extracts a scalar property of every molecule as a numeric column.
    ///
    /// # Errors
    ///
    /// Returns [`DataError::MissingProperty`] for the first molecule lacking the property and
    /// [`DataError::WrongShape`] if it is not a scalar.
    pub fn scalar_column(&self, property: &str) -> Result<Vec<f64>, DataError> {
        self.molecules
            .iter()
            .enumerate()
            .map(|(index, m)| match m.property(property) {
                None => Err(DataError::MissingProperty {
                    property: property.to_string(),
                    index,
                }),
                Some(value) => value.as_scalar().ok_or_else(|| DataError::WrongShape {
                    property: property.to_string(),
                    index,
                }),
            })
            .collect()
    }

    /// Extracts a per-atom vector property of every molecule.
    pub fn atom_vectors_column(&self, property: &str) -> Result<Vec<Vec<Vector3<f64>>>, DataError> {
        self.molecules
            .iter()
            .enumerate()
            .map(|(index, m)| match m.property(property) {
                None => Err(DataError::MissingProperty {
                    property: property.to_string(),
                    index,
                }),
                Some(value) => value
                    .as_atom_vectors()
                    .map(<[_]>::to_vec)
                    .ok_or_else(|| DataError::WrongShape {
                        property: property.to_string(),
                        index,
                    }),
            })
            .collect()
    }

    /// Concatenates the flattened per-atom vectors of every molecule into one array.
    pub fn flat_atom_vectors_column(&self, property: &str) -> Result<Vec<f64>, DataError> {
        Ok(self
            .atom_vectors_column(property)?
            .into_iter()
            .flatten()
            .flat_map(|g| [g.x, g.y, g.z])
            .collect())
    }

    /// Iterates over mutable batches of at most `batch_size` molecules.
    pub fn batches_mut(&mut self, batch_size: usize) -> std::slice::ChunksMut<'_, Molecule> {
        self.molecules.chunks_mut(batch_size.max(1))
    }

    pub fn batches(&self, batch_size: usize) -> std::slice::Chunks<'_, Molecule> {
        self.molecules.chunks(batch_size.max(1))
    }

    /// Returns the sorted set of distinct atomic numbers found in the database.
    pub fn elements(&self) -> Vec<u8> {
        self.molecules
            .iter()
            .flat_map(|m| m.atoms.iter().map(|a| a.atomic_number))
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect()
    }

    pub fn extend(&mut self, other: MolecularDatabase) {
        self.molecules.extend(other.molecules);
    }

    /// Partitions `0..len()` into `k` contiguous folds whose sizes differ by at most one.
    ///
    /// # Errors
    ///
    /// Returns [`DataError::InvalidSplit`] if `k` is zero or exceeds the number of molecules.
    pub fn fold_indices(&self, k: usize) -> Result<Vec<Vec<usize>>, DataError> {
        let len = self.len();
        if k == 0 || k > len {
            return Err(DataError::InvalidSplit { len, folds: k });
        }
        let base = len / k;
        let extra = len % k;
        let mut start = 0;
        Ok((0..k)
            .map(|fold| {
                let size = base + usize::from(fold < extra);
                let indices = (start..start + size).collect();
                start += size;
                indices
            })
            .collect())
    }

    /// Randomly splits the indices into a `fraction` part and its complement.
    pub fn sample_split<R: Rng>(&self, fraction: f64, rng: &mut R) -> (Vec<usize>, Vec<usize>) {
        let mut indices: Vec<usize> = (0..self.len()).collect();
        indices.shuffle(rng);
        let cut = ((self.len() as f64) * fraction.clamp(0.0, 1.0)).round() as usize;
        let rest = indices.split_off(cut.min(indices.len()));
        (indices, rest)
    }
}

impl FromIterator<Molecule> for MolecularDatabase {
    fn from_iter<T: IntoIterator<Item = Molecule>>(iter: T) -> Self {
        Self::from_molecules(iter.into_iter().collect())
    }
}

impl IntoIterator for MolecularDatabase {
    type Item = Molecule;
    type IntoIter = std::vec::IntoIter<Molecule>;

    fn into_iter(self) -> Self::IntoIter {
        self.molecules.into_iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    fn database(n: usize) -> MolecularDatabase {
        (0..n)
            .map(|i| {
                let mut m = Molecule::from_numbers_and_coordinates(&[
                    (1, [0.0, 0.0, 0.0]),
                    (1, [0.0, 0.0, 0.7 + 0.01 * i as f64]),
                ]);
                if i % 2 == 0 {
                    m.set_scalar("energy", -1.0 - i as f64);
                }
                m
            })
            .collect()
    }

    #[test]
    fn slice_and_select_copy_molecules() {
        let db = database(5);
        assert_eq!(db.slice(1..3).len(), 2);
        assert_eq!(db.slice(4..10).len(), 1);
        let picked = db.select(&[4, 0, 99]);
        assert_eq!(picked.len(), 2);
        assert_eq!(picked.molecules[1], db.molecules[0]);
    }

    #[test]
    fn scalar_column_reports_missing_molecule() {
        let db = database(3);
        let err = db.scalar_column("energy").unwrap_err();
        assert_eq!(
            err,
            DataError::MissingProperty {
                property: "energy".into(),
                index: 1
            }
        );
        let labelled = db.filter_by_property("energy");
        assert_eq!(labelled.scalar_column("energy").unwrap(), vec![-1.0, -3.0]);
    }

    #[test]
    fn fold_indices_cover_every_molecule_once() {
        let db = database(7);
        let folds = db.fold_indices(3).unwrap();
        assert_eq!(folds.iter().map(Vec::len).collect::<Vec<_>>(), vec![3, 2, 2]);
        let all: Vec<usize> = folds.into_iter().flatten().collect();
        assert_eq!(all, (0..7).collect::<Vec<_>>());
        assert!(db.fold_indices(0).is_err());
        assert!(db.fold_indices(8).is_err());
    }

    #[test]
    fn sample_split_is_a_partition() {
        let db = database(10);
        let mut rng = StdRng::seed_from_u64(7);
        let (train, rest) = db.sample_split(0.8, &mut rng);
        assert_eq!(train.len(), 8);
        assert_eq!(rest.len(), 2);
        let mut all: Vec<usize> = train.into_iter().chain(rest).collect();
        all.sort_unstable();
        assert_eq!(all, (0..10).collect::<Vec<_>>());
    }

    #[test]
    fn elements_are_sorted_and_unique() {
        let mut db = database(2);
        db.push(Molecule::from_numbers_and_coordinates(&[(8, [0.0; 3]), (6, [1.2, 0.0, 0.0])]));
        assert_eq!(db.elements(), vec![1, 6, 8]);
    }
}
