//! Library and sample loading
//!
//! Library tables: `<data_path>/libraries/lib<id>.csv`, structure column
//! `structure` (renamed to `SMILES`), tagged with `sublibrary`.
//!
//! Sample tables: one file per (sample, sublibrary), count column `value`,
//! tagged with `sublibrary`, `experimental_cond`, `sample` and
//! `run = sample % 2`.

use crate::condition::SMILES;
use crate::config::PipelineConfig;
use crate::storage::{self, TableExt};
use crate::{Error, Result};
use arrow::array::{Array, ArrayRef, BooleanArray, Int64Array, StringArray};
use arrow::compute;
use arrow::record_batch::RecordBatch;
use std::path::PathBuf;
use std::sync::Arc;

/// Raw structure column in library files
pub const STRUCTURE: &str = "structure";
/// Sublibrary tag column
pub const SUBLIBRARY: &str = "sublibrary";
/// Condition tag column on sample rows
pub const EXPERIMENTAL_COND: &str = "experimental_cond";
/// Sample number column
pub const SAMPLE: &str = "sample";
/// Replicate run column (`sample % 2`)
pub const RUN: &str = "run";
/// Count column in sample files
pub const VALUE: &str = "value";

/// Path of one sublibrary's structure table
#[must_use]
pub fn library_path(config: &PipelineConfig, lib: &str) -> PathBuf {
    config.data_path.join("libraries").join(format!("lib{lib}.csv"))
}

/// Path of one sample's count table for one sublibrary
#[must_use]
pub fn sample_path(config: &PipelineConfig, sample: u32, lib: &str) -> PathBuf {
    config
        .data_path
        .join("samples")
        .join(config.sample_file_name(sample, lib))
}

/// Path of one condition's enrichment table for one sublibrary
#[must_use]
pub fn enrichment_path(config: &PipelineConfig, condition: &str, lib: &str) -> PathBuf {
    config.data_path.join(format!("{condition}_lib{lib}.csv"))
}

/// Load every configured sublibrary into one structure table
///
/// # Errors
/// Returns error if any library file is missing or unreadable
pub fn load_library(config: &PipelineConfig) -> Result<RecordBatch> {
    let mut tables = Vec::with_capacity(config.sublibrary.len());
    for lib in &config.sublibrary {
        let table = storage::read_csv(library_path(config, lib))?;
        tables.push(tag_constant(&table, SUBLIBRARY, lib)?);
    }
    let library = storage::concat_tables(&tables)?.rename_column(STRUCTURE, SMILES)?;
    tracing::info!(
        rows = library.num_rows(),
        sublibraries = config.sublibrary.len(),
        "loaded library"
    );
    Ok(library)
}

/// Load every configured sample across all sublibraries into one table
///
/// # Errors
/// Returns error if any sample file is missing or unreadable
pub fn load_samples(config: &PipelineConfig) -> Result<RecordBatch> {
    let mut tables = Vec::new();
    for (&sample, condition) in &config.sample_to_exp_condition {
        let mut per_lib = Vec::with_capacity(config.sublibrary.len());
        for lib in &config.sublibrary {
            let table = storage::read_csv(sample_path(config, sample, lib))?;
            per_lib.push(tag_constant(&table, SUBLIBRARY, lib)?);
        }
        let table = storage::concat_tables(&per_lib)?;
        let rows = table.num_rows();
        let table = tag_constant(&table, EXPERIMENTAL_COND, condition)?
            .with_column(SAMPLE, Arc::new(Int64Array::from(vec![i64::from(sample); rows])))?
            .with_column(RUN, Arc::new(Int64Array::from(vec![i64::from(sample % 2); rows])))?;
        tracing::debug!(sample, condition = %condition, rows, "loaded sample");
        tables.push(table);
    }
    let samples = storage::concat_tables(&tables)?;
    tracing::info!(rows = samples.num_rows(), "loaded samples");
    Ok(samples)
}

/// Load one condition's enrichment tables across all sublibraries
///
/// # Errors
/// Returns error if any enrichment file is missing or unreadable
pub fn load_enrichment(config: &PipelineConfig, condition: &str) -> Result<RecordBatch> {
    let mut tables = Vec::with_capacity(config.sublibrary.len());
    for lib in &config.sublibrary {
        let table = storage::read_csv(enrichment_path(config, condition, lib))?;
        tables.push(tag_constant(&table, SUBLIBRARY, lib)?);
    }
    storage::concat_tables(&tables)
}

/// Sample rows for one condition and replicate run, original order kept
///
/// # Errors
/// Returns error if the tag columns are missing
pub fn select_sample_rows(samples: &RecordBatch, condition: &str, run: i64) -> Result<RecordBatch> {
    let context = format!("selecting {condition} run {run} samples");
    let conditions = samples.string_column(EXPERIMENTAL_COND, &context)?;
    let runs = samples.f64_column(RUN, &context)?;

    #[allow(clippy::cast_precision_loss)]
    let run = run as f64;
    let mask: BooleanArray = (0..samples.num_rows())
        .map(|i| {
            Some(
                !conditions.is_null(i)
                    && conditions.value(i) == condition
                    && !runs.is_null(i)
                    && (runs.value(i) - run).abs() < f64::EPSILON,
            )
        })
        .collect();

    compute::filter_record_batch(samples, &mask).map_err(Error::from)
}

fn tag_constant(table: &RecordBatch, name: &str, value: &str) -> Result<RecordBatch> {
    let column: ArrayRef = Arc::new(StringArray::from(vec![value; table.num_rows()]));
    table.with_column(name, column)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn config_for(dir: &std::path::Path) -> PipelineConfig {
        let yaml = format!(
            "data_path: {}\noutput_path: {}\nsublibrary: [1, 2]\n\
             sample_to_exp_condition: {{1: blank, 2: blank, 3: CK1a}}\n\
             experimental_condition: [CK1a]\n",
            dir.join("data").display(),
            dir.join("out").display()
        );
        PipelineConfig::from_yaml(&yaml).unwrap()
    }

    fn write(path: PathBuf, text: &str) {
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, text).unwrap();
    }

    #[test]
    fn test_load_library_tags_and_renames() {
        let dir = tempfile::tempdir().unwrap();
        let config = config_for(dir.path());
        write(library_path(&config, "1"), "structure,cycle1\nCCO,1\nCCN,2\n");
        write(library_path(&config, "2"), "structure,cycle1\nc1ccccc1,1\n");

        let library = load_library(&config).unwrap();
        assert_eq!(library.num_rows(), 3);
        assert!(library.has_column(SMILES));
        assert!(!library.has_column(STRUCTURE));
        let tags = library.string_column(SUBLIBRARY, "test").unwrap();
        assert_eq!(tags.value(0), "1");
        assert_eq!(tags.value(2), "2");
    }

    #[test]
    fn test_load_samples_tags_runs() {
        let dir = tempfile::tempdir().unwrap();
        let config = config_for(dir.path());
        for sample in 1..=3 {
            for lib in ["1", "2"] {
                write(sample_path(&config, sample, lib), &format!("value\n{sample}\n"));
            }
        }

        let samples = load_samples(&config).unwrap();
        assert_eq!(samples.num_rows(), 6);

        let blank_run1 = select_sample_rows(&samples, "blank", 1).unwrap();
        assert_eq!(blank_run1.num_rows(), 2);
        let values = blank_run1.f64_column(VALUE, "test").unwrap();
        assert!((values.value(0) - 1.0).abs() < f64::EPSILON);

        let ck1a_run0 = select_sample_rows(&samples, "CK1a", 0).unwrap();
        assert_eq!(ck1a_run0.num_rows(), 0);
    }

    #[test]
    fn test_missing_library_file_fails() {
        let dir = tempfile::tempdir().unwrap();
        let config = config_for(dir.path());
        assert!(load_library(&config).is_err());
    }
}
