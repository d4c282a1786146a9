use phf::phf_map;

/// Element symbols indexed by atomic number (index 0 is a placeholder).
const ELEMENT_SYMBOLS: [&str; 55] = [
    "X", "H", "He", "Li", "Be", "B", "C", "N", "O", "F", "Ne", "Na", "Mg", "Al", "Si", "P", "S",
    "Cl", "Ar", "K", "Ca", "Sc", "Ti", "V", "Cr", "Mn", "Fe", "Co", "Ni", "Cu", "Zn", "Ga", "Ge",
    "As", "Se", "Br", "Kr", "Rb", "Sr", "Y", "Zr", "Nb", "Mo", "Tc", "Ru", "Rh", "Pd", "Ag", "Cd",
    "In", "Sn", "Sb", "Te", "I", "Xe",
];

static ATOMIC_NUMBERS: phf::Map<&'static str, u8> = phf_map! {
    "h" => 1, "he" => 2, "li" => 3, "be" => 4, "b" => 5, "c" => 6, "n" => 7, "o" => 8,
    "f" => 9, "ne" => 10, "na" => 11, "mg" => 12, "al" => 13, "si" => 14, "p" => 15,
    "s" => 16, "cl" => 17, "ar" => 18, "k" => 19, "ca" => 20, "sc" => 21, "ti" => 22,
    "v" => 23, "cr" => 24, "mn" => 25, "fe" => 26, "co" => 27, "ni" => 28, "cu" => 29,
    "zn" => 30, "ga" => 31, "ge" => 32, "as" => 33, "se" => 34, "br" => 35, "kr" => 36,
    "rb" => 37, "sr" => 38, "y" => 39, "zr" => 40, "nb" => 41, "mo" => 42, "tc" => 43,
    "ru" => 44, "rh" => 45, "pd" => 46, "ag" => 47, "cd" => 48, "in" => 49, "sn" => 50,
    "sb" => 51, "te" => 52, "i" => 53, "xe" => 54,
};

/// Returns the atomic number for a (case-insensitive) element symbol.
pub fn atomic_number(symbol: &str) -> Option<u8> {
    ATOMIC_NUMBERS
        .get(symbol.trim().to_ascii_lowercase().as_str())
        .copied()
}

/// Returns the canonical element symbol for an atomic number.
pub fn element_symbol(atomic_number: u8) -> Option<&'static str> {
    match atomic_number {
        0 => None,
        z => ELEMENT_SYMBOLS.get(z as usize).copied(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn symbol_lookup_is_case_insensitive() {
        assert_eq!(atomic_number("C"), Some(6));
        assert_eq!(atomic_number("cl"), Some(17));
        assert_eq!(atomic_number(" Br "), Some(35));
        assert_eq!(atomic_number("Qq"), None);
    }

    #[test]
    fn atomic_number_maps_back_to_symbol() {
        for z in 1..=54u8 {
            let symbol = element_symbol(z).unwrap();
            assert_eq!(atomic_number(symbol), Some(z));
        }
        assert_eq!(element_symbol(0), None);
        assert_eq!(element_symbol(118), None);
    }
}
