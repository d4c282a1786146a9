use super::element::{atomic_number, element_symbol};
use nalgebra::Point3;
use serde::{Deserialize, Serialize};
use std::str::FromStr;

/// Represents a single atom of a molecule: its chemical element and Cartesian position.
///
/// Per-atom outputs such as energy gradients are not stored on the atom itself; they live
/// in the owning [`Molecule`](super::molecule::Molecule)'s property bag as
/// [`PropertyValue::AtomVectors`](super::property::PropertyValue::AtomVectors) ordered like
/// the atoms.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Atom {
    /// The atomic number (nuclear charge) of the element.
    pub atomic_number: u8,
    /// The 3D coordinates of the atom in Angstroms.
    pub position: Point3<f64>,
}

impl Atom {
    /// Creates a new `Atom` from an atomic number and a position.
    ///
    /// # Arguments
    ///
    /// * `atomic_number` - The nuclear charge of the element.
    /// * `position` - The 3D coordinates of the atom.
    pub fn new(atomic_number: u8, position: Point3<f64>) -> Self {
        Self {
            atomic_number,
            position,
        }
    }

    /// Creates a new `Atom` from an element symbol.
    ///
    /// # Return
    ///
    /// Returns `None` if the symbol is not a known element.
    pub fn from_symbol(symbol: &str, position: Point3<f64>) -> Option<Self> {
        atomic_number(symbol).map(|z| Self::new(z, position))
    }

    /// Returns the canonical element symbol, or `"X"` for unknown elements.
    pub fn symbol(&self) -> &'static str {
        element_symbol(self.atomic_number).unwrap_or("X")
    }
}

/// Parses a line of the form `"<symbol> <x> <y> <z>"`.
impl FromStr for Atom {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut fields = s.split_whitespace();
        let symbol = fields.next().ok_or(())?;
        let mut coords = [0.0; 3];
        for c in coords.iter_mut() {
            *c = fields.next().ok_or(())?.parse().map_err(|_| ())?;
        }
        let z = symbol
            .parse::<u8>()
            .ok()
            .or_else(|| atomic_number(symbol))
            .ok_or(())?;
        Ok(Self::new(z, Point3::new(coords[0], coords[1], coords[2])))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn from_symbol_resolves_atomic_number() {
        let atom = Atom::from_symbol("O", Point3::new(0.0, 0.0, 0.1)).unwrap();
        assert_eq!(atom.atomic_number, 8);
        assert_eq!(atom.symbol(), "O");
        assert!(Atom::from_symbol("Zz", Point3::origin()).is_none());
    }

    #[test]
    fn from_str_accepts_symbols_and_numbers() {
        let a: Atom = "H 0.0 1.0 2.0".parse().unwrap();
        assert_eq!(a.atomic_number, 1);
        assert_eq!(a.position, Point3::new(0.0, 1.0, 2.0));
        let b: Atom = "6   1.5 -0.5 0".parse().unwrap();
        assert_eq!(b.atomic_number, 6);
    }

    #[test]
    fn from_str_rejects_incomplete_lines() {
        assert_eq!("H 0.0 1.0".parse::<Atom>(), Err(()));
        assert_eq!("Qq 0 0 0".parse::<Atom>(), Err(()));
        assert_eq!("".parse::<Atom>(), Err(()));
    }

    #[test]
    fn unknown_atomic_number_has_placeholder_symbol() {
        assert_eq!(Atom::new(0, Point3::origin()).symbol(), "X");
    }
}
