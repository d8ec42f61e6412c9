//! Fingerprint feature store
//!
//! `<dir>/<experiment>.parquet`: `SMILES` (Utf8) and `feature`
//! (FixedSizeBinary of `n_bits / 8` packed bytes), one row per valid
//! structure. Rejected structures go to `<dir>/<experiment>_invalid.csv`.

use super::{Fingerprint, FingerprintBatch};
use crate::condition::SMILES;
use crate::storage::{self, TableExt};
use crate::{Error, Result};
use arrow::array::{Array, ArrayRef, FixedSizeBinaryArray, StringArray, UInt64Array};
use arrow::datatypes::{DataType, Field, Schema};
use arrow::record_batch::RecordBatch;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Fingerprint column
pub const FEATURE: &str = "feature";

/// Paths written for one experiment
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FeaturePaths {
    /// Parquet feature table
    pub features: PathBuf,
    /// CSV of rejected structures
    pub invalid: PathBuf,
}

impl FeaturePaths {
    /// Paths under `dir` for `experiment`
    #[must_use]
    pub fn new(dir: &Path, experiment: &str) -> Self {
        Self {
            features: dir.join(format!("{experiment}.parquet")),
            invalid: dir.join(format!("{experiment}_invalid.csv")),
        }
    }
}

/// Arrow table of valid structures and their packed fingerprints
///
/// # Errors
/// Returns error if fingerprints disagree on length
pub fn feature_table(batch: &FingerprintBatch, n_bits: usize) -> Result<RecordBatch> {
    let width = i32::try_from(n_bits.div_ceil(8))
        .map_err(|_| Error::InvalidInput(format!("{n_bits} bits is too wide for a feature column")))?;
    if let Some(fp) = batch.fingerprints.iter().find(|fp| fp.len() != n_bits) {
        return Err(Error::InvalidInput(format!(
            "fingerprint has {} bits, store expects {n_bits}",
            fp.len()
        )));
    }

    let features = FixedSizeBinaryArray::try_from_sparse_iter_with_size(
        batch.fingerprints.iter().map(|fp| Some(fp.as_bytes())),
        width,
    )?;
    let schema = Schema::new(vec![
        Field::new(SMILES, DataType::Utf8, false),
        Field::new(FEATURE, DataType::FixedSizeBinary(width), false),
    ]);
    Ok(RecordBatch::try_new(
        Arc::new(schema),
        vec![
            Arc::new(StringArray::from_iter_values(&batch.smiles)) as ArrayRef,
            Arc::new(features),
        ],
    )?)
}

/// Rejected structures as `index, SMILES, reason`
///
/// # Errors
/// Returns error if the table cannot be assembled
pub fn invalid_table(batch: &FingerprintBatch) -> Result<RecordBatch> {
    let index: UInt64Array = batch
        .invalid
        .iter()
        .map(|i| Some(i.index as u64))
        .collect();
    let smiles: StringArray = batch.invalid.iter().map(|i| i.smiles.as_deref()).collect();
    let reason = StringArray::from_iter_values(batch.invalid.iter().map(|i| i.reason.as_str()));
    Ok(RecordBatch::try_from_iter(vec![
        ("index", Arc::new(index) as ArrayRef),
        (SMILES, Arc::new(smiles)),
        ("reason", Arc::new(reason)),
    ])?)
}

/// Write the feature table and the invalid-structure list
///
/// # Errors
/// Returns error if either file cannot be written
pub fn write_features(paths: &FeaturePaths, batch: &FingerprintBatch, n_bits: usize) -> Result<()> {
    storage::write_parquet(&paths.features, &feature_table(batch, n_bits)?)?;
    storage::write_csv(&paths.invalid, &invalid_table(batch)?)?;
    tracing::info!(
        path = %paths.features.display(),
        rows = batch.fingerprints.len(),
        invalid = batch.invalid.len(),
        "wrote feature store"
    );
    Ok(())
}

/// Read a feature table back as `(SMILES, fingerprint)` pairs
///
/// # Errors
/// Returns error if the file is unreadable or the columns are malformed
pub fn read_features<P: AsRef<Path>>(path: P, n_bits: usize) -> Result<Vec<(String, Fingerprint)>> {
    let table = storage::read_parquet(path)?;
    let smiles = table.string_column(SMILES, "reading feature store")?;
    let features = table
        .column_checked(FEATURE, "reading feature store")?
        .as_any()
        .downcast_ref::<FixedSizeBinaryArray>()
        .ok_or_else(|| Error::TypeMismatch {
            column: FEATURE.to_string(),
            detail: "expected FixedSizeBinary".into(),
        })?;

    (0..table.num_rows())
        .map(|i| {
            Ok((
                smiles.value(i).to_string(),
                Fingerprint::from_bytes(features.value(i), n_bits)?,
            ))
        })
        .collect()
}
