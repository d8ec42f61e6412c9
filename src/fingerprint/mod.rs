//! Molecular fingerprints for hit structures
//!
//! ```text
//! SMILES ──parse──> Molecule ──morgan──> Fingerprint (n_bits, packed)
//!                     │
//!                     └── parse failure -> invalid structure record
//! ```
//!
//! Batches run on a dedicated worker pool ([`pool`]) and land in a Parquet
//! feature store ([`store`]).

pub mod morgan;
pub mod pool;
pub mod smiles;
pub mod store;

pub use morgan::morgan;
pub use pool::{fingerprint_all, FingerprintBatch, InvalidStructure};
pub use smiles::Molecule;

use crate::config::FingerprintConfig;
use crate::{Error, Result};

/// Fingerprint shape
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FingerprintParams {
    /// Number of neighborhood expansion rounds
    pub radius: u32,
    /// Bit length; a multiple of 8
    pub n_bits: usize,
    /// Fold tetrahedral marks into atom invariants
    pub use_chirality: bool,
}

impl From<&FingerprintConfig> for FingerprintParams {
    fn from(config: &FingerprintConfig) -> Self {
        Self {
            radius: config.radius,
            n_bits: config.n_bits,
            use_chirality: config.use_chirality,
        }
    }
}

/// Fixed-length bit vector, bit `i` at byte `i / 8`, mask `0x80 >> (i % 8)`
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Fingerprint {
    n_bits: usize,
    bytes: Vec<u8>,
}

impl Fingerprint {
    /// All-zero fingerprint of `n_bits` bits
    #[must_use]
    pub fn new(n_bits: usize) -> Self {
        Self {
            n_bits,
            bytes: vec![0; n_bits.div_ceil(8)],
        }
    }

    /// Rebuild from packed bytes
    ///
    /// # Errors
    /// Returns [`Error::InvalidInput`] if the byte length does not match `n_bits`
    pub fn from_bytes(bytes: &[u8], n_bits: usize) -> Result<Self> {
        if bytes.len() != n_bits.div_ceil(8) {
            return Err(Error::InvalidInput(format!(
                "{} bytes cannot hold a {n_bits}-bit fingerprint",
                bytes.len()
            )));
        }
        Ok(Self {
            n_bits,
            bytes: bytes.to_vec(),
        })
    }

    /// Bit length
    #[must_use]
    pub const fn len(&self) -> usize {
        self.n_bits
    }

    /// True for a zero-length fingerprint
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.n_bits == 0
    }

    /// Set bit `index`; out-of-range indices are ignored
    pub fn set(&mut self, index: usize) {
        if index < self.n_bits {
            self.bytes[index / 8] |= 0x80 >> (index % 8);
        }
    }

    /// Set the bit an identifier folds to
    #[allow(clippy::cast_possible_truncation)]
    pub fn set_hashed(&mut self, id: u64) {
        if self.n_bits > 0 {
            self.set((id % self.n_bits as u64) as usize);
        }
    }

    /// Read bit `index`
    #[must_use]
    pub fn get(&self, index: usize) -> bool {
        index < self.n_bits && self.bytes[index / 8] & (0x80 >> (index % 8)) != 0
    }

    /// Number of set bits
    #[must_use]
    pub fn count_ones(&self) -> usize {
        self.bytes.iter().map(|b| b.count_ones() as usize).sum()
    }

    /// Packed bytes
    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }
}

/// Parse and fingerprint one structure
///
/// # Errors
/// Returns [`Error::SmilesParse`] if the structure cannot be parsed
pub fn fingerprint_smiles(smiles: &str, params: &FingerprintParams) -> Result<Fingerprint> {
    Ok(morgan(&Molecule::parse(smiles)?, params))
}
