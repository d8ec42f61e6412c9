//! Storage backend (Arrow in memory, CSV/Parquet on disk)
//!
//! **Append-Only Artifact Chain**:
//! - Raw library/sample tables are read once and never rewritten
//! - Every stage writes new artifacts; nothing is updated in place
//! - Column names are preserved byte-for-byte, downstream readers select by name
//!
//! Tables are single `RecordBatch`es. Multi-batch CSV reads are concatenated
//! on load so callers never see chunking.

mod columns;

pub use columns::TableExt;

use crate::{Error, Result};
use arrow::array::{new_null_array, ArrayRef};
use arrow::compute;
use arrow::csv::reader::Format;
use arrow::csv::{ReaderBuilder, WriterBuilder};
use arrow::datatypes::{DataType, Field, Schema};
use arrow::record_batch::RecordBatch;
use std::fs::File;
use std::io::Seek;
use std::path::Path;
use std::sync::Arc;

/// Rows per batch when streaming a CSV file into memory
const CSV_BATCH_ROWS: usize = 64 * 1024;

/// Read a headed CSV file into a single batch, inferring the schema from all rows
///
/// # Errors
/// Returns error if the file cannot be opened or a row does not match the
/// inferred schema
pub fn read_csv<P: AsRef<Path>>(path: P) -> Result<RecordBatch> {
    let path = path.as_ref();
    let mut file = File::open(path).map_err(|e| {
        Error::StorageError(format!("Failed to open CSV file {}: {e}", path.display()))
    })?;

    let format = Format::default().with_header(true);
    let (schema, _) = format.infer_schema(&mut file, None)?;
    file.rewind()?;

    let schema = Arc::new(schema);
    let reader = ReaderBuilder::new(schema.clone())
        .with_format(format)
        .with_batch_size(CSV_BATCH_ROWS)
        .build(file)?;

    let mut batches = Vec::new();
    for batch in reader {
        batches.push(batch.map_err(|e| {
            Error::StorageError(format!("Failed to read {}: {e}", path.display()))
        })?);
    }

    tracing::debug!(path = %path.display(), batches = batches.len(), "loaded csv");
    combine(&schema, &batches)
}

/// Write a batch as a headed CSV file, creating parent directories
///
/// # Errors
/// Returns error if the file cannot be created or written
pub fn write_csv<P: AsRef<Path>>(path: P, batch: &RecordBatch) -> Result<()> {
    let path = path.as_ref();
    ensure_parent(path)?;
    let file = File::create(path)?;
    let mut writer = WriterBuilder::new().with_header(true).build(file);
    writer.write(batch)?;
    tracing::debug!(path = %path.display(), rows = batch.num_rows(), "wrote csv");
    Ok(())
}

/// Load a table from a Parquet file
///
/// # Errors
/// Returns error if file cannot be read or parsed
pub fn read_parquet<P: AsRef<Path>>(path: P) -> Result<RecordBatch> {
    use parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;

    let file = File::open(path.as_ref())
        .map_err(|e| Error::StorageError(format!("Failed to open Parquet file: {e}")))?;

    let builder = ParquetRecordBatchReaderBuilder::try_new(file)
        .map_err(|e| Error::StorageError(format!("Failed to parse Parquet file: {e}")))?;
    let schema = builder.schema().clone();

    let reader = builder
        .build()
        .map_err(|e| Error::StorageError(format!("Failed to create Parquet reader: {e}")))?;

    let mut batches = Vec::new();
    for batch in reader {
        let batch = batch
            .map_err(|e| Error::StorageError(format!("Failed to read record batch: {e}")))?;
        batches.push(batch);
    }

    combine(&schema, &batches)
}

/// Write a batch to a Parquet file, creating parent directories
///
/// # Errors
/// Returns error if the file cannot be created or encoded
pub fn write_parquet<P: AsRef<Path>>(path: P, batch: &RecordBatch) -> Result<()> {
    use parquet::arrow::ArrowWriter;

    let path = path.as_ref();
    ensure_parent(path)?;
    let file = File::create(path)?;
    let mut writer = ArrowWriter::try_new(file, batch.schema(), None)?;
    writer.write(batch)?;
    writer.close()?;
    Ok(())
}

/// Concatenate tables whose schemas may differ, unifying columns by name
///
/// Columns keep first-appearance order. A column missing from a table is
/// filled with nulls for that table's rows. Conflicting types widen: mixed
/// integer widths to `Int64`, mixed numerics to `Float64`, anything else to
/// `Utf8`.
///
/// # Errors
/// Returns error if a column cannot be cast to the unified type
pub fn concat_tables(tables: &[RecordBatch]) -> Result<RecordBatch> {
    let Some(first) = tables.first() else {
        return Ok(RecordBatch::new_empty(Arc::new(Schema::empty())));
    };
    if tables.iter().all(|t| t.schema() == first.schema()) {
        return combine(&first.schema(), tables);
    }

    let mut fields: Vec<(String, DataType)> = Vec::new();
    for table in tables {
        for field in table.schema().fields() {
            match fields.iter_mut().find(|(name, _)| name == field.name()) {
                Some((_, dt)) => *dt = unify_types(dt, field.data_type()),
                None => fields.push((field.name().clone(), field.data_type().clone())),
            }
        }
    }

    let schema = Arc::new(Schema::new(
        fields
            .iter()
            .map(|(name, dt)| Field::new(name, dt.clone(), true))
            .collect::<Vec<_>>(),
    ));

    let mut aligned = Vec::with_capacity(tables.len());
    for table in tables {
        let columns = fields
            .iter()
            .map(|(name, dt)| match table.column_by_name(name) {
                Some(col) if col.data_type() == dt => Ok(col.clone()),
                Some(col) => compute::cast(col, dt).map_err(Error::from),
                None => Ok(new_null_array(dt, table.num_rows())),
            })
            .collect::<Result<Vec<ArrayRef>>>()?;
        aligned.push(RecordBatch::try_new(schema.clone(), columns)?);
    }

    combine(&schema, &aligned)
}

fn combine(schema: &Arc<Schema>, batches: &[RecordBatch]) -> Result<RecordBatch> {
    match batches {
        [] => Ok(RecordBatch::new_empty(schema.clone())),
        [single] => Ok(single.clone()),
        many => compute::concat_batches(schema, many)
            .map_err(|e| Error::StorageError(format!("Failed to combine batches: {e}"))),
    }
}

fn unify_types(a: &DataType, b: &DataType) -> DataType {
    if a == b {
        return a.clone();
    }
    match (a, b) {
        (DataType::Null, other) | (other, DataType::Null) => other.clone(),
        (x, y) if x.is_integer() && y.is_integer() => DataType::Int64,
        (x, y) if x.is_numeric() && y.is_numeric() => DataType::Float64,
        _ => DataType::Utf8,
    }
}

fn ensure_parent(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    Ok(())
}
