//! Circular (Morgan/ECFP-style) fingerprints
//!
//! Round 0 hashes per-atom invariants. Each following round rehashes an atom
//! with its previous identifier and the sorted `(bond order, neighbor id)`
//! pairs. Every identifier from every round sets bit `id mod n_bits`.

use super::smiles::Molecule;
use super::{Fingerprint, FingerprintParams};
use rustc_hash::FxHasher;
use std::hash::{Hash, Hasher};

fn hash_of<T: Hash>(value: &T) -> u64 {
    let mut hasher = FxHasher::default();
    value.hash(&mut hasher);
    hasher.finish()
}

/// Round-0 identifiers
fn atom_invariants(mol: &Molecule, use_chirality: bool) -> Vec<u64> {
    let in_ring = mol.ring_atoms();
    mol.atoms()
        .iter()
        .enumerate()
        .map(|(i, atom)| {
            let chirality = if use_chirality { Some(atom.chirality) } else { None };
            hash_of(&(
                atom.atomic_number,
                mol.neighbors(i).len(),
                mol.hydrogen_count(i),
                atom.charge,
                atom.aromatic,
                in_ring[i],
                chirality,
            ))
        })
        .collect()
}

/// Fingerprint of a parsed molecule
#[must_use]
pub fn morgan(mol: &Molecule, params: &FingerprintParams) -> Fingerprint {
    let mut fingerprint = Fingerprint::new(params.n_bits);
    let mut ids = atom_invariants(mol, params.use_chirality);
    for &id in &ids {
        fingerprint.set_hashed(id);
    }

    for round in 1..=params.radius {
        let next: Vec<u64> = (0..ids.len())
            .map(|atom| {
                let mut environment: Vec<(u8, u64)> = mol
                    .neighbors(atom)
                    .iter()
                    .map(|&(neighbor, bond)| (mol.bonds()[bond].order.code(), ids[neighbor]))
                    .collect();
                environment.sort_unstable();
                hash_of(&(round, ids[atom], environment))
            })
            .collect();
        for &id in &next {
            fingerprint.set_hashed(id);
        }
        ids = next;
    }
    fingerprint
}
