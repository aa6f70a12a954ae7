use crate::constants::address_constants::{BROADCAST, FIRST_ELEMENT, MASTER, NUM_ELEMENTS};

/// Element symbols indexed by bus address minus one, hydrogen through
/// oganesson, spelled the way the element firmware project spells them.
pub const ELEMENT_SYMBOLS: [&str; NUM_ELEMENTS as usize] = [
    "H", "He", "Li", "Be", "B", "C", "N", "O", "F", "Ne", //
    "Na", "Mg", "Al", "Si", "P", "S", "Cl", "Ar", "K", "Ca", //
    "Sc", "Ti", "V", "Cr", "Mn", "Fe", "Co", "Ni", "Cu", "Zn", //
    "Ga", "Ge", "As", "Se", "Br", "Kr", "Rb", "Sr", "Y", "Zr", //
    "Nb", "Mo", "Tc", "Ru", "Rh", "Pd", "Ag", "Cd", "In", "Sn", //
    "Sb", "Te", "I", "Xe", "Cs", "Ba", "La", "Ce", "Pr", "Nd", //
    "Pm", "Sm", "Eu", "Gd", "Tb", "Dy", "Ho", "Er", "Tm", "Yb", //
    "Lu", "Hf", "Ta", "W", "Re", "Os", "Ir", "Pt", "Au", "Hg", //
    "Tl", "Pb", "Bi", "Po", "At", "Rn", "Fr", "Ra", "Ac", "Th", //
    "Pa", "U", "Np", "Pu", "Am", "Cm", "Bk", "Cf", "Es", "Fm", //
    "Md", "No", "Lr", "Rf", "Db", "Sg", "Bh", "Hs", "Mt", "Ds", //
    "Rg", "Cp", "Nh", "Fl", "Mc", "Lv", "Ts", "Og",
];

/// True for addresses that name an element (1..=118).
pub const fn is_element(address: u8) -> bool {
    address >= FIRST_ELEMENT && address <= NUM_ELEMENTS
}

/// The element symbol for a bus address, if it names one.
pub fn symbol(address: u8) -> Option<&'static str> {
    if is_element(address) {
        Some(ELEMENT_SYMBOLS[address as usize - 1])
    } else {
        None
    }
}

/// Human-readable name of any bus address, for diagnostics.
pub fn describe(address: u8) -> &'static str {
    match address {
        MASTER => "master",
        BROADCAST => "broadcast",
        other => symbol(other).unwrap_or("invalid"),
    }
}
