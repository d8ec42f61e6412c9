//! Bounded worker pool for fingerprinting
//!
//! Inputs are cut into `chunk_size` chunks; each chunk fans out over a
//! dedicated rayon pool of `workers` threads. Results carry their input index
//! and are slotted back into input order, so output order never depends on
//! scheduling. A structure that fails to parse becomes an
//! [`InvalidStructure`] record and never aborts the batch.

use super::{fingerprint_smiles, Fingerprint, FingerprintParams};
use crate::{Error, Result};
use rayon::prelude::*;

/// A structure that could not be fingerprinted
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvalidStructure {
    /// Position in the input
    pub index: usize,
    /// Input text; `None` for a missing value
    pub smiles: Option<String>,
    /// Parse failure
    pub reason: String,
}

/// Fingerprints of the valid inputs plus the rejected ones, input order kept
#[derive(Debug, Clone, Default)]
pub struct FingerprintBatch {
    /// Valid structures
    pub smiles: Vec<String>,
    /// Fingerprint per valid structure
    pub fingerprints: Vec<Fingerprint>,
    /// Rejected structures
    pub invalid: Vec<InvalidStructure>,
}

/// Fingerprint every input on a pool of `workers` threads
///
/// # Errors
/// Returns [`Error::InvalidInput`] if `workers` or `chunk_size` is zero or the
/// pool cannot be started
pub fn fingerprint_all(
    inputs: &[Option<String>],
    params: &FingerprintParams,
    workers: usize,
    chunk_size: usize,
) -> Result<FingerprintBatch> {
    if workers == 0 || chunk_size == 0 {
        return Err(Error::InvalidInput(format!(
            "fingerprint pool needs workers > 0 and chunk_size > 0 (got {workers}, {chunk_size})"
        )));
    }
    let pool = rayon::ThreadPoolBuilder::new()
        .num_threads(workers)
        .thread_name(|i| format!("fingerprint-{i}"))
        .build()
        .map_err(|e| Error::InvalidInput(format!("Failed to start fingerprint pool: {e}")))?;

    let mut slots: Vec<Option<Result<Fingerprint>>> = Vec::with_capacity(inputs.len());
    slots.resize_with(inputs.len(), || None);

    for (chunk_no, chunk) in inputs.chunks(chunk_size).enumerate() {
        let offset = chunk_no * chunk_size;
        let results: Vec<(usize, Result<Fingerprint>)> = pool.install(|| {
            chunk
                .par_iter()
                .enumerate()
                .map(|(i, smiles)| {
                    let result = smiles.as_deref().map_or_else(
                        || Err(Error::InvalidInput("missing SMILES".into())),
                        |s| fingerprint_smiles(s, params),
                    );
                    (offset + i, result)
                })
                .collect()
        });
        for (index, result) in results {
            slots[index] = Some(result);
        }
        tracing::debug!(
            start = offset,
            end = offset + chunk.len(),
            total = inputs.len(),
            "fingerprinted chunk"
        );
    }

    let mut batch = FingerprintBatch::default();
    for (index, (slot, smiles)) in slots.into_iter().zip(inputs).enumerate() {
        match slot {
            Some(Ok(fingerprint)) => {
                batch.smiles.push(smiles.clone().unwrap_or_default());
                batch.fingerprints.push(fingerprint);
            }
            Some(Err(e)) => batch.invalid.push(InvalidStructure {
                index,
                smiles: smiles.clone(),
                reason: e.to_string(),
            }),
            None => batch.invalid.push(InvalidStructure {
                index,
                smiles: smiles.clone(),
                reason: "not processed".into(),
            }),
        }
    }

    if !batch.invalid.is_empty() {
        tracing::warn!(invalid = batch.invalid.len(), total = inputs.len(), "invalid structures");
    }
    tracing::info!(valid = batch.fingerprints.len(), workers, "fingerprinted structures");
    Ok(batch)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn params() -> FingerprintParams {
        FingerprintParams {
            radius: 2,
            n_bits: 512,
            use_chirality: false,
        }
    }

    fn inputs(items: &[Option<&str>]) -> Vec<Option<String>> {
        items.iter().map(|s| s.map(str::to_string)).collect()
    }

    #[test]
    fn test_invalid_structures_are_recorded_not_fatal() {
        let batch = fingerprint_all(
            &inputs(&[Some("CCO"), Some("C1CC"), None, Some("c1ccccc1")]),
            &params(),
            2,
            3,
        )
        .unwrap();
        assert_eq!(batch.smiles, vec!["CCO", "c1ccccc1"]);
        assert_eq!(batch.invalid.len(), 2);
        assert_eq!(batch.invalid[0].index, 1);
        assert_eq!(batch.invalid[1].index, 2);
        assert!(batch.invalid[1].smiles.is_none());
    }

    #[test]
    fn test_zero_workers_rejected() {
        assert!(fingerprint_all(&inputs(&[Some("C")]), &params(), 0, 10).is_err());
        assert!(fingerprint_all(&inputs(&[Some("C")]), &params(), 1, 0).is_err());
    }

    const POOL: &[&str] = &["C", "CC", "CCO", "c1ccccc1", "CC(=O)O", "N#C", "C1CC1", "bad(", "O=C=O"];

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(32))]

        /// Output order and content do not depend on worker count or chunking
        #[test]
        fn prop_reassembly_matches_sequential(
            picks in proptest::collection::vec(0..POOL.len(), 0..40),
            workers in 1usize..5,
            chunk in 1usize..8,
        ) {
            let items: Vec<Option<String>> = picks.iter().map(|&i| Some(POOL[i].to_string())).collect();
            let parallel = fingerprint_all(&items, &params(), workers, chunk).unwrap();
            let sequential = fingerprint_all(&items, &params(), 1, items.len().max(1)).unwrap();

            prop_assert_eq!(&parallel.smiles, &sequential.smiles);
            prop_assert_eq!(&parallel.fingerprints, &sequential.fingerprints);
            prop_assert_eq!(&parallel.invalid, &sequential.invalid);
            for (smiles, fp) in parallel.smiles.iter().zip(&parallel.fingerprints) {
                prop_assert_eq!(fp, &fingerprint_smiles(smiles, &params()).unwrap());
            }
        }
    }
}
