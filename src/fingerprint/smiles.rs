//! SMILES text to a molecular graph
//!
//! Covers what screening libraries emit: organic-subset and bracket atoms,
//! aromatic lowercase atoms, explicit bonds, branches, ring closures
//! (`1`..`9`, `%NN`) and dot-separated components. Stereo bond marks `/` `\`
//! read as single bonds. Coordinates are never computed.

use crate::{Error, Result};
use rustc_hash::FxHashMap;

/// Tetrahedral mark on a bracket atom
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Chirality {
    /// No mark
    #[default]
    None,
    /// `@`
    CounterClockwise,
    /// `@@`
    Clockwise,
}

/// Bond order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BondOrder {
    /// `-`, `/`, `\` or implicit
    Single,
    /// `=`
    Double,
    /// `#`
    Triple,
    /// `:` or implicit between aromatic atoms
    Aromatic,
}

impl BondOrder {
    /// Valence the bond consumes on each end (aromatic counted as 1)
    #[must_use]
    pub const fn valence(self) -> u8 {
        match self {
            Self::Single | Self::Aromatic => 1,
            Self::Double => 2,
            Self::Triple => 3,
        }
    }

    /// Small code used when hashing atom environments
    #[must_use]
    pub const fn code(self) -> u8 {
        match self {
            Self::Single => 1,
            Self::Double => 2,
            Self::Triple => 3,
            Self::Aromatic => 4,
        }
    }
}

/// One atom of a parsed molecule
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Atom {
    /// Element symbol, capitalized (`*` for a wildcard)
    pub symbol: String,
    /// Atomic number (`0` for a wildcard)
    pub atomic_number: u8,
    /// Written lowercase
    pub aromatic: bool,
    /// Formal charge
    pub charge: i8,
    /// Bracket hydrogen count; `None` for organic-subset atoms
    pub explicit_hydrogens: Option<u8>,
    /// Tetrahedral mark
    pub chirality: Chirality,
}

/// Bond between two atom indices
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Bond {
    /// Lower atom index
    pub a: usize,
    /// Higher atom index
    pub b: usize,
    /// Bond order
    pub order: BondOrder,
}

/// Atoms, bonds and adjacency
#[derive(Debug, Clone, Default)]
pub struct Molecule {
    atoms: Vec<Atom>,
    bonds: Vec<Bond>,
    /// `(neighbor atom, bond index)` per atom
    adjacency: Vec<Vec<(usize, usize)>>,
}

const ELEMENTS: &[(&str, u8)] = &[
    ("H", 1), ("He", 2), ("Li", 3), ("Be", 4), ("B", 5), ("C", 6), ("N", 7), ("O", 8),
    ("F", 9), ("Ne", 10), ("Na", 11), ("Mg", 12), ("Al", 13), ("Si", 14), ("P", 15),
    ("S", 16), ("Cl", 17), ("Ar", 18), ("K", 19), ("Ca", 20), ("Sc", 21), ("Ti", 22),
    ("V", 23), ("Cr", 24), ("Mn", 25), ("Fe", 26), ("Co", 27), ("Ni", 28), ("Cu", 29),
    ("Zn", 30), ("Ga", 31), ("Ge", 32), ("As", 33), ("Se", 34), ("Br", 35), ("Kr", 36),
    ("Rb", 37), ("Sr", 38), ("Y", 39), ("Zr", 40), ("Nb", 41), ("Mo", 42), ("Tc", 43),
    ("Ru", 44), ("Rh", 45), ("Pd", 46), ("Ag", 47), ("Cd", 48), ("In", 49), ("Sn", 50),
    ("Sb", 51), ("Te", 52), ("I", 53), ("Xe", 54), ("Cs", 55), ("Ba", 56), ("Pt", 78),
    ("Au", 79), ("Hg", 80), ("Tl", 81), ("Pb", 82), ("Bi", 83),
];

fn atomic_number(symbol: &str) -> Option<u8> {
    if symbol == "*" {
        return Some(0);
    }
    ELEMENTS.iter().find(|(s, _)| *s == symbol).map(|&(_, z)| z)
}

/// Default valences of the organic subset
fn default_valences(atomic_number: u8) -> &'static [u8] {
    match atomic_number {
        5 => &[3],
        6 => &[4],
        7 | 15 => &[3, 5],
        8 => &[2],
        16 => &[2, 4, 6],
        9 | 17 | 35 | 53 => &[1],
        _ => &[],
    }
}

impl Molecule {
    /// Parse a SMILES string
    ///
    /// # Errors
    /// Returns [`Error::SmilesParse`] with the character offset on unknown
    /// tokens, unbalanced branches, unclosed rings, dangling bonds or an
    /// empty structure
    pub fn parse(smiles: &str) -> Result<Self> {
        Parser::new(smiles).parse()
    }

    /// All atoms, in input order
    #[must_use]
    pub fn atoms(&self) -> &[Atom] {
        &self.atoms
    }

    /// All bonds
    #[must_use]
    pub fn bonds(&self) -> &[Bond] {
        &self.bonds
    }

    /// `(neighbor, bond index)` pairs of an atom
    #[must_use]
    pub fn neighbors(&self, atom: usize) -> &[(usize, usize)] {
        self.adjacency.get(atom).map_or(&[], Vec::as_slice)
    }

    /// Hydrogens on an atom: bracket count, or implied by default valence
    #[must_use]
    pub fn hydrogen_count(&self, atom: usize) -> u8 {
        let Some(a) = self.atoms.get(atom) else { return 0 };
        if let Some(h) = a.explicit_hydrogens {
            return h;
        }
        let used: u8 = self
            .neighbors(atom)
            .iter()
            .map(|&(_, bond)| self.bonds[bond].order.valence())
            .sum::<u8>()
            + u8::from(a.aromatic);
        default_valences(a.atomic_number)
            .iter()
            .find(|&&v| v >= used)
            .map_or(0, |&v| v - used)
    }

    /// Per-bond flag: bond lies on a cycle (is not a bridge)
    #[must_use]
    pub fn ring_bonds(&self) -> Vec<bool> {
        let n = self.atoms.len();
        let mut order = vec![usize::MAX; n];
        let mut low = vec![0usize; n];
        let mut in_ring = vec![true; self.bonds.len()];
        let mut counter = 0;

        for root in 0..n {
            if order[root] != usize::MAX {
                continue;
            }
            // iterative DFS: (atom, bond used to enter, next neighbor slot)
            let mut stack: Vec<(usize, Option<usize>, usize)> = vec![(root, None, 0)];
            order[root] = counter;
            low[root] = counter;
            counter += 1;

            while let Some(frame) = stack.last_mut() {
                let (atom, via, slot) = *frame;
                frame.2 += 1;
                if let Some(&(next, bond)) = self.adjacency[atom].get(slot) {
                    if Some(bond) == via {
                        continue;
                    }
                    if order[next] == usize::MAX {
                        order[next] = counter;
                        low[next] = counter;
                        counter += 1;
                        stack.push((next, Some(bond), 0));
                    } else {
                        low[atom] = low[atom].min(order[next]);
                    }
                } else {
                    stack.pop();
                    if let (Some(&(parent, _, _)), Some(bond)) = (stack.last(), via) {
                        low[parent] = low[parent].min(low[atom]);
                        if low[atom] > order[parent] {
                            in_ring[bond] = false;
                        }
                    }
                }
            }
        }
        in_ring
    }

    /// Per-atom flag: atom has at least one ring bond
    #[must_use]
    pub fn ring_atoms(&self) -> Vec<bool> {
        let ring_bonds = self.ring_bonds();
        let mut in_ring = vec![false; self.atoms.len()];
        for (bond, &ring) in self.bonds.iter().zip(&ring_bonds) {
            if ring {
                in_ring[bond.a] = true;
                in_ring[bond.b] = true;
            }
        }
        in_ring
    }

    fn add_atom(&mut self, atom: Atom) -> usize {
        self.atoms.push(atom);
        self.adjacency.push(Vec::new());
        self.atoms.len() - 1
    }

    fn add_bond(&mut self, a: usize, b: usize, order: BondOrder) -> std::result::Result<(), String> {
        if a == b {
            return Err("ring closure bonds an atom to itself".into());
        }
        if self.adjacency[a].iter().any(|&(n, _)| n == b) {
            return Err(format!("duplicate bond between atoms {a} and {b}"));
        }
        let index = self.bonds.len();
        self.bonds.push(Bond {
            a: a.min(b),
            b: a.max(b),
            order,
        });
        self.adjacency[a].push((b, index));
        self.adjacency[b].push((a, index));
        Ok(())
    }
}

/// Ring-closure bookkeeping: opening atom, explicit bond at the opening
struct RingOpen {
    atom: usize,
    bond: Option<BondOrder>,
}

struct Parser {
    chars: Vec<char>,
    pos: usize,
    mol: Molecule,
    current: Option<usize>,
    pending_bond: Option<(BondOrder, usize)>,
    branches: Vec<(Option<usize>, usize)>,
    rings: FxHashMap<u32, RingOpen>,
}

impl Parser {
    fn new(text: &str) -> Self {
        Self {
            chars: text.trim().chars().collect(),
            pos: 0,
            mol: Molecule::default(),
            current: None,
            pending_bond: None,
            branches: Vec::new(),
            rings: FxHashMap::default(),
        }
    }

    fn fail<T>(&self, position: usize, reason: impl Into<String>) -> Result<T> {
        Err(Error::SmilesParse {
            position,
            reason: reason.into(),
        })
    }

    fn peek(&self) -> Option<char> {
        self.chars.get(self.pos).copied()
    }

    fn parse(mut self) -> Result<Molecule> {
        while let Some(c) = self.peek() {
            let start = self.pos;
            match c {
                '-' | '/' | '\\' => self.bond(BondOrder::Single)?,
                '=' => self.bond(BondOrder::Double)?,
                '#' => self.bond(BondOrder::Triple)?,
                ':' => self.bond(BondOrder::Aromatic)?,
                '(' => {
                    if self.current.is_none() {
                        return self.fail(start, "branch opened before any atom");
                    }
                    self.branches.push((self.current, start));
                    self.pos += 1;
                }
                ')' => {
                    let Some((atom, _)) = self.branches.pop() else {
                        return self.fail(start, "unmatched ')'");
                    };
                    if let Some((_, at)) = self.pending_bond {
                        return self.fail(at, "bond not followed by an atom");
                    }
                    self.current = atom;
                    self.pos += 1;
                }
                '.' => {
                    if let Some((_, at)) = self.pending_bond {
                        return self.fail(at, "bond not followed by an atom");
                    }
                    self.current = None;
                    self.pos += 1;
                }
                '0'..='9' => {
                    self.pos += 1;
                    self.ring_closure(c.to_digit(10).unwrap_or_default(), start)?;
                }
                '%' => {
                    let digits: String = self.chars.iter().skip(start + 1).take(2).collect();
                    let number = match digits.parse::<u32>() {
                        Ok(n) if digits.len() == 2 => n,
                        _ => return self.fail(start, "'%' must be followed by two digits"),
                    };
                    self.pos += 3;
                    self.ring_closure(number, start)?;
                }
                '[' => {
                    let atom = self.bracket_atom()?;
                    self.attach(atom, start)?;
                }
                _ => {
                    let atom = self.organic_atom()?;
                    self.attach(atom, start)?;
                }
            }
        }

        if let Some(&(_, at)) = self.branches.last() {
            return self.fail(at, "unclosed branch");
        }
        if let Some((_, at)) = self.pending_bond {
            return self.fail(at, "bond not followed by an atom");
        }
        if let Some(ring) = self.rings.keys().min() {
            return self.fail(self.chars.len(), format!("ring closure {ring} never closed"));
        }
        if self.mol.atoms.is_empty() {
            return self.fail(0, "no atoms");
        }
        Ok(self.mol)
    }

    fn bond(&mut self, order: BondOrder) -> Result<()> {
        if self.current.is_none() || self.pending_bond.is_some() {
            return self.fail(self.pos, "bond without a preceding atom");
        }
        self.pending_bond = Some((order, self.pos));
        self.pos += 1;
        Ok(())
    }

    fn implicit_order(&self, a: usize, b: usize) -> BondOrder {
        if self.mol.atoms[a].aromatic && self.mol.atoms[b].aromatic {
            BondOrder::Aromatic
        } else {
            BondOrder::Single
        }
    }

    fn attach(&mut self, atom: Atom, start: usize) -> Result<()> {
        let index = self.mol.add_atom(atom);
        if let Some(prev) = self.current {
            let order = self
                .pending_bond
                .take()
                .map_or_else(|| self.implicit_order(prev, index), |(o, _)| o);
            if let Err(reason) = self.mol.add_bond(prev, index, order) {
                return self.fail(start, reason);
            }
        }
        self.current = Some(index);
        Ok(())
    }

    fn ring_closure(&mut self, number: u32, start: usize) -> Result<()> {
        let Some(atom) = self.current else {
            return self.fail(start, "ring closure without a preceding atom");
        };
        let bond = self.pending_bond.take().map(|(o, _)| o);
        match self.rings.remove(&number) {
            Some(open) => {
                let order = bond
                    .or(open.bond)
                    .unwrap_or_else(|| self.implicit_order(open.atom, atom));
                if let Err(reason) = self.mol.add_bond(open.atom, atom, order) {
                    return self.fail(start, reason);
                }
            }
            None => {
                self.rings.insert(number, RingOpen { atom, bond });
            }
        }
        Ok(())
    }

    fn organic_atom(&mut self) -> Result<Atom> {
        let start = self.pos;
        let c = self.peek().unwrap_or_default();
        let next = self.chars.get(start + 1).copied();

        let (symbol, aromatic, len) = match (c, next) {
            ('C', Some('l')) => ("Cl", false, 2),
            ('B', Some('r')) => ("Br", false, 2),
            ('B' | 'C' | 'N' | 'O' | 'P' | 'S' | 'F' | 'I', _) => (symbol_str(c), false, 1),
            ('b' | 'c' | 'n' | 'o' | 'p' | 's', _) => (symbol_str(c.to_ascii_uppercase()), true, 1),
            ('*', _) => ("*", false, 1),
            _ => return self.fail(start, format!("unexpected character '{c}'")),
        };
        self.pos += len;
        Ok(Atom {
            symbol: symbol.to_string(),
            atomic_number: atomic_number(symbol).unwrap_or_default(),
            aromatic,
            charge: 0,
            explicit_hydrogens: None,
            chirality: Chirality::None,
        })
    }

    fn bracket_atom(&mut self) -> Result<Atom> {
        let open = self.pos;
        let Some(len) = self.chars[open..].iter().position(|&c| c == ']') else {
            return self.fail(open, "unclosed bracket atom");
        };
        let body: Vec<char> = self.chars[open + 1..open + len].to_vec();
        self.pos = open + len + 1;

        let mut i = 0;
        while body.get(i).is_some_and(char::is_ascii_digit) {
            i += 1;
        }

        let Some(&first) = body.get(i) else {
            return self.fail(open, "empty bracket atom");
        };
        let aromatic = first.is_ascii_lowercase();
        let mut symbol = first.to_ascii_uppercase().to_string();
        i += 1;
        if let Some(&second) = body.get(i) {
            let two = format!("{symbol}{second}");
            let aromatic_pair = aromatic && matches!(two.as_str(), "Se" | "As");
            if second.is_ascii_lowercase() && (aromatic_pair || (!aromatic && atomic_number(&two).is_some())) {
                symbol = two;
                i += 1;
            }
        }
        let Some(z) = atomic_number(&symbol) else {
            return self.fail(open + 1, format!("unknown element '{symbol}'"));
        };

        let mut chirality = Chirality::None;
        if body.get(i) == Some(&'@') {
            i += 1;
            chirality = Chirality::CounterClockwise;
            if body.get(i) == Some(&'@') {
                i += 1;
                chirality = Chirality::Clockwise;
            }
        }

        let mut hydrogens = 0u8;
        if body.get(i) == Some(&'H') {
            i += 1;
            hydrogens = 1;
            if let Some(d) = body.get(i).and_then(|c| c.to_digit(10)) {
                hydrogens = u8::try_from(d).unwrap_or(1);
                i += 1;
            }
        }

        let mut charge = 0i8;
        while let Some(&sign) = body.get(i).filter(|c| **c == '+' || **c == '-') {
            let unit: i8 = if sign == '+' { 1 } else { -1 };
            i += 1;
            if let Some(d) = body.get(i).and_then(|c| c.to_digit(10)) {
                charge = charge.saturating_add(unit * i8::try_from(d).unwrap_or(0));
                i += 1;
            } else {
                charge = charge.saturating_add(unit);
            }
        }

        if body.get(i) == Some(&':') {
            i += 1;
            while body.get(i).is_some_and(char::is_ascii_digit) {
                i += 1;
            }
        }
        if i != body.len() {
            return self.fail(open + 1 + i, "unexpected character in bracket atom");
        }

        Ok(Atom {
            symbol,
            atomic_number: z,
            aromatic,
            charge,
            explicit_hydrogens: Some(hydrogens),
            chirality,
        })
    }
}

const fn symbol_str(c: char) -> &'static str {
    match c {
        'B' => "B",
        'C' => "C",
        'N' => "N",
        'O' => "O",
        'P' => "P",
        'S' => "S",
        'F' => "F",
        _ => "I",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ethanol() {
        let mol = Molecule::parse("CCO").unwrap();
        assert_eq!(mol.atoms().len(), 3);
        assert_eq!(mol.bonds().len(), 2);
        assert_eq!(mol.hydrogen_count(0), 3);
        assert_eq!(mol.hydrogen_count(1), 2);
        assert_eq!(mol.hydrogen_count(2), 1);
    }

    #[test]
    fn test_benzene_is_aromatic_ring() {
        let mol = Molecule::parse("c1ccccc1").unwrap();
        assert_eq!(mol.bonds().len(), 6);
        assert!(mol.bonds().iter().all(|b| b.order == BondOrder::Aromatic));
        assert!(mol.ring_atoms().iter().all(|&r| r));
        assert_eq!(mol.hydrogen_count(0), 1);
    }

    #[test]
    fn test_branch_and_substituent_ring_flags() {
        // toluene: methyl carbon is not in the ring
        let mol = Molecule::parse("Cc1ccccc1").unwrap();
        let rings = mol.ring_atoms();
        assert!(!rings[0]);
        assert!(rings[1]);
        assert_eq!(mol.hydrogen_count(1), 0);

        let mol = Molecule::parse("CC(=O)O").unwrap();
        assert_eq!(mol.neighbors(1).len(), 3);
        assert_eq!(mol.bonds()[1].order, BondOrder::Double);
    }

    #[test]
    fn test_bracket_atoms() {
        let mol = Molecule::parse("[NH4+].[Cl-]").unwrap();
        assert_eq!(mol.atoms()[0].charge, 1);
        assert_eq!(mol.hydrogen_count(0), 4);
        assert_eq!(mol.atoms()[1].symbol, "Cl");
        assert_eq!(mol.atoms()[1].charge, -1);
        assert!(mol.bonds().is_empty());

        let mol = Molecule::parse("N[C@@H](C)C(=O)O").unwrap();
        assert_eq!(mol.atoms()[1].chirality, Chirality::Clockwise);

        let mol = Molecule::parse("c1cc[nH]c1").unwrap();
        assert_eq!(mol.hydrogen_count(3), 1);
    }

    #[test]
    fn test_two_digit_ring_closure() {
        let mol = Molecule::parse("C%10CCCCC%10").unwrap();
        assert_eq!(mol.bonds().len(), 6);
        assert!(mol.ring_bonds().iter().all(|&r| r));
    }

    #[test]
    fn test_rejects_malformed() {
        for bad in ["C(C", "CC)", "C1CC", "CC=", "C[Xx]", "C$", "", "[C", "=C", "C%1"] {
            let err = Molecule::parse(bad).unwrap_err();
            assert!(matches!(err, Error::SmilesParse { .. }), "{bad} parsed");
        }
    }

    #[test]
    fn test_error_reports_position() {
        match Molecule::parse("CCQ") {
            Err(Error::SmilesParse { position, .. }) => assert_eq!(position, 2),
            other => panic!("unexpected {other:?}"),
        }
    }
}
