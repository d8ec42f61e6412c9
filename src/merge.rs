//! Merge engine: per-condition tables and the wide preprocessed table
//!
//! Rows from independently loaded tables are matched on the compound key
//! `(sublibrary, cycle1, cycle2, cycle3)`; a file's own `lib_id` only labels
//! the `CompoundIndex`. A table without cycle columns is
//! matched by position, and only when its row count equals the target's.
//!
//! ```text
//! library ─┐
//! enrichment(cond) ─┼─> <cond>.csv ──┐
//! samples(cond, run 0/1) ┘             ├─> preprocessed.csv
//! samples(blank, run 0/1) ─────────────┘
//! ```

use crate::condition::{
    BLANK_HIT_COUNTS, COMPOUND_INDEX, COMPOUND_INDEX_RAW, CONDITION_SUFFIXES, LIBRARY_NAME, SMILES,
};
use crate::loader::{EXPERIMENTAL_COND, SUBLIBRARY, VALUE};
use crate::storage::TableExt;
use crate::{Error, Result};
use arrow::array::{Array, ArrayRef, StringArray, UInt32Array};
use arrow::compute;
use arrow::datatypes::{Field, Schema};
use arrow::record_batch::RecordBatch;
use rustc_hash::FxHashMap;
use std::fmt;
use std::sync::Arc;

/// Library id column in enrichment tables
pub const LIB_ID: &str = "lib_id";
/// Synthesis cycle columns
pub const CYCLE_COLUMNS: [&str; 3] = ["cycle1", "cycle2", "cycle3"];

/// Width every `CompoundIndex` component is zero-padded to
pub const INDEX_WIDTH: usize = 3;

/// Synthesis route of one compound
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CompoundKey {
    /// Library id
    pub lib_id: String,
    /// Synthon codes for cycles 1..3
    pub cycles: [String; 3],
}

impl CompoundKey {
    /// Build a key from its four components
    #[must_use]
    pub fn new(lib_id: &str, cycles: [&str; 3]) -> Self {
        Self {
            lib_id: normalize_code(lib_id),
            cycles: cycles.map(normalize_code),
        }
    }

    /// `lib_id.cycle1.cycle2.cycle3` as written
    #[must_use]
    pub fn raw_index(&self) -> String {
        format!(
            "{}.{}.{}.{}",
            self.lib_id, self.cycles[0], self.cycles[1], self.cycles[2]
        )
    }

    /// Every component zero-padded to [`INDEX_WIDTH`], so lexicographic order
    /// follows numeric order
    #[must_use]
    pub fn padded_index(&self) -> String {
        std::iter::once(&self.lib_id)
            .chain(self.cycles.iter())
            .map(|c| pad(c))
            .collect::<Vec<_>>()
            .join(".")
    }
}

impl fmt::Display for CompoundKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw_index())
    }
}

/// Left-pad a code with zeros to [`INDEX_WIDTH`]; longer codes are unchanged
#[must_use]
pub fn pad(code: &str) -> String {
    format!("{code:0>INDEX_WIDTH$}")
}

/// Integral floats read back from CSV render as integers (`3.0` -> `3`)
fn normalize_code(code: &str) -> String {
    let trimmed = code.trim();
    match trimmed.parse::<f64>() {
        Ok(v) if v.fract() == 0.0 && v.is_finite() && trimmed.contains('.') => {
            format!("{v:.0}")
        }
        _ => trimmed.to_string(),
    }
}

/// Library columns a join key reads, in order of preference
///
/// The loader tags every table with `sublibrary`, so keys built from it agree
/// across tables even when a file writes its own `lib_id` differently.
const JOIN_LIB_COLUMNS: [&str; 2] = [SUBLIBRARY, LIB_ID];
/// Library columns a printed `CompoundIndex` reads, in order of preference
const LABEL_LIB_COLUMNS: [&str; 2] = [LIB_ID, SUBLIBRARY];

/// Join keys of every row, or `None` when the table has no cycle columns
///
/// The library component is the `sublibrary` tag, falling back to `lib_id`.
/// Rows with a null component get no key.
///
/// # Errors
/// Returns error if a key column cannot be rendered as text
pub fn compound_keys(table: &RecordBatch) -> Result<Option<Vec<Option<CompoundKey>>>> {
    keys_from(table, &JOIN_LIB_COLUMNS)
}

fn keys_from(table: &RecordBatch, lib_columns: &[&str]) -> Result<Option<Vec<Option<CompoundKey>>>> {
    if !CYCLE_COLUMNS.iter().all(|c| table.has_column(c)) {
        return Ok(None);
    }
    let Some(lib_column) = lib_columns.iter().copied().find(|c| table.has_column(c)) else {
        return Ok(None);
    };

    let context = "building compound keys";
    let lib = table.string_column(lib_column, context)?;
    let cycles = [
        table.string_column(CYCLE_COLUMNS[0], context)?,
        table.string_column(CYCLE_COLUMNS[1], context)?,
        table.string_column(CYCLE_COLUMNS[2], context)?,
    ];

    let keys = (0..table.num_rows())
        .map(|i| {
            if lib.is_null(i) || cycles.iter().any(|c| c.is_null(i)) {
                None
            } else {
                Some(CompoundKey::new(
                    lib.value(i),
                    [cycles[0].value(i), cycles[1].value(i), cycles[2].value(i)],
                ))
            }
        })
        .collect();
    Ok(Some(keys))
}

fn label_keys(table: &RecordBatch, context: &str) -> Result<Vec<Option<CompoundKey>>> {
    keys_from(table, &LABEL_LIB_COLUMNS)?.ok_or_else(|| Error::column_not_found(CYCLE_COLUMNS[0], context))
}

/// Padded `CompoundIndex` column for a keyed table
///
/// The library component is `lib_id` as written, falling back to the
/// `sublibrary` tag.
///
/// # Errors
/// Returns [`Error::ColumnNotFound`] if the table carries no compound key
pub fn compound_index_column(table: &RecordBatch, context: &str) -> Result<StringArray> {
    Ok(label_keys(table, context)?
        .iter()
        .map(|k| k.as_ref().map(CompoundKey::padded_index))
        .collect())
}

/// Unpadded `lib_id.cycle1.cycle2.cycle3` column for a keyed table
///
/// # Errors
/// Returns [`Error::ColumnNotFound`] if the table carries no compound key
pub fn raw_index_column(table: &RecordBatch, context: &str) -> Result<StringArray> {
    Ok(label_keys(table, context)?
        .iter()
        .map(|k| k.as_ref().map(CompoundKey::raw_index))
        .collect())
}

/// Row of `source` matching each row of `target` (null where unmatched)
///
/// # Errors
/// - [`Error::DuplicateKey`] if a key repeats in `source`
/// - [`Error::AlignmentMismatch`] on positional length mismatch, or on any
///   unmatched row when `strict`
pub fn align(target: &RecordBatch, source: &RecordBatch, what: &str, strict: bool) -> Result<UInt32Array> {
    match (compound_keys(target)?, compound_keys(source)?) {
        (Some(target_keys), Some(source_keys)) => {
            align_by_key(&target_keys, &source_keys, what, strict)
        }
        (target_keys, source_keys) => {
            if target_keys.is_some() != source_keys.is_some() {
                tracing::warn!(table = what, "compound key on one side only, aligning by position");
            }
            align_by_position(target.num_rows(), source.num_rows(), what)
        }
    }
}

fn align_by_key(
    target_keys: &[Option<CompoundKey>],
    source_keys: &[Option<CompoundKey>],
    what: &str,
    strict: bool,
) -> Result<UInt32Array> {
    let mut lookup: FxHashMap<&CompoundKey, u32> = FxHashMap::default();
    for (row, key) in source_keys.iter().enumerate() {
        let Some(key) = key else { continue };
        if lookup.insert(key, row_index(row)?).is_some() {
            return Err(Error::DuplicateKey {
                key: key.raw_index(),
                table: what.to_string(),
            });
        }
    }

    let indices: UInt32Array = target_keys
        .iter()
        .map(|key| key.as_ref().and_then(|k| lookup.get(k).copied()))
        .collect();

    let unmatched = indices.null_count();
    if unmatched > 0 && unmatched == target_keys.len() && !lookup.is_empty() {
        return Err(Error::AlignmentMismatch(format!(
            "none of {unmatched} compounds share a key with {what}"
        )));
    }
    if unmatched > 0 {
        if strict {
            return Err(Error::AlignmentMismatch(format!(
                "{unmatched} of {} compounds have no row in {what}",
                target_keys.len()
            )));
        }
        tracing::warn!(table = what, unmatched, total = target_keys.len(), "unmatched compounds");
    }
    Ok(indices)
}

fn align_by_position(target_rows: usize, source_rows: usize, what: &str) -> Result<UInt32Array> {
    if target_rows != source_rows {
        return Err(Error::AlignmentMismatch(format!(
            "{what} has {source_rows} rows but {target_rows} compounds were expected"
        )));
    }
    (0..target_rows)
        .map(row_index)
        .collect::<Result<Vec<u32>>>()
        .map(UInt32Array::from)
}

fn row_index(row: usize) -> Result<u32> {
    u32::try_from(row)
        .map_err(|_| Error::InvalidInput(format!("row {row} exceeds the u32 index range")))
}

/// Gather rows of `source` by index; null indices produce null rows
///
/// # Errors
/// Returns error if an index is out of bounds
pub fn take_rows(source: &RecordBatch, indices: &UInt32Array) -> Result<RecordBatch> {
    let columns = source
        .columns()
        .iter()
        .map(|c| compute::take(c.as_ref(), indices, None))
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(RecordBatch::try_new(nullable_schema(&source.schema()), columns)?)
}

fn nullable_schema(schema: &Schema) -> Arc<Schema> {
    Arc::new(Schema::new(
        schema
            .fields()
            .iter()
            .map(|f| f.as_ref().clone().with_nullable(true))
            .collect::<Vec<Field>>(),
    ))
}

/// Column builder that keeps first-seen names unique
#[derive(Default)]
struct Columns {
    fields: Vec<Field>,
    arrays: Vec<ArrayRef>,
}

impl Columns {
    fn push(&mut self, name: &str, array: ArrayRef) {
        let field = Field::new(name, array.data_type().clone(), true);
        match self.fields.iter().position(|f| f.name() == name) {
            Some(idx) => {
                self.fields[idx] = field;
                self.arrays[idx] = array;
            }
            None => {
                self.fields.push(field);
                self.arrays.push(array);
            }
        }
    }

    fn push_new(&mut self, name: &str, array: ArrayRef) {
        if !self.fields.iter().any(|f| f.name() == name) {
            self.push(name, array);
        }
    }

    fn extend_from(&mut self, table: &RecordBatch) {
        for (field, array) in table.schema().fields().iter().zip(table.columns()) {
            self.push_new(field.name(), array.clone());
        }
    }

    fn finish(self) -> Result<RecordBatch> {
        Ok(RecordBatch::try_new(Arc::new(Schema::new(self.fields)), self.arrays)?)
    }
}

/// Inputs for one condition's merge
#[derive(Debug, Clone, Copy)]
pub struct ConditionInputs<'a> {
    /// Condition name
    pub name: &'a str,
    /// Structure table
    pub library: &'a RecordBatch,
    /// Enrichment statistics for this condition (keyed)
    pub enrichment: &'a RecordBatch,
    /// Sample rows for replicate run 0 and run 1
    pub counts: [&'a RecordBatch; 2],
}

/// One row per compound for a condition: structure, statistics, replicate counts
///
/// Column order: library columns, enrichment columns not already present,
/// `CompoundIndex`, `CompoundIndex_raw`, `experimental_cond`, `hit_counts_0`,
/// `hit_counts_1`. `sublibrary` is taken from the enrichment rows.
///
/// # Errors
/// Returns error if the enrichment table is unkeyed, a table fails to align,
/// or a sample table has no `value` column
pub fn merge_condition(inputs: ConditionInputs<'_>, strict: bool) -> Result<RecordBatch> {
    let ConditionInputs { name, library, enrichment, counts } = inputs;
    let rows = enrichment.num_rows();

    let context = format!("building CompoundIndex for {name}");
    let index = compound_index_column(enrichment, &context)?;
    let raw_index = raw_index_column(enrichment, &context)?;
    let library_rows = align(enrichment, library, &format!("library for {name}"), strict)?;

    let mut columns = Columns::default();
    columns.extend_from(&take_rows(library, &library_rows)?);
    columns.extend_from(enrichment);
    if let Some(tag) = enrichment.column_by_name(SUBLIBRARY) {
        columns.push(SUBLIBRARY, tag.clone());
    }
    columns.push(COMPOUND_INDEX, Arc::new(index));
    columns.push(COMPOUND_INDEX_RAW, Arc::new(raw_index));
    columns.push(EXPERIMENTAL_COND, Arc::new(StringArray::from(vec![name; rows])));

    for (run, samples) in counts.iter().enumerate() {
        let what = format!("{name} run {run} samples");
        let indices = align(enrichment, samples, &what, strict)?;
        let value = samples.column_checked(VALUE, &what)?;
        columns.push(&format!("hit_counts_{run}"), compute::take(value.as_ref(), &indices, None)?);
    }

    let merged = columns.finish()?;
    tracing::info!(condition = name, rows = merged.num_rows(), "merged condition");
    Ok(merged)
}

/// Wide table: library plus `<cond>_<stat>` for every condition and the blank counts
///
/// `library.name` copies `sublibrary`. `CompoundIndex` comes from the
/// library's own key when it has one, otherwise from the condition tables by
/// `SMILES`.
///
/// # Errors
/// Returns error if a required column is missing or a table fails to align
pub fn pivot_conditions(
    library: &RecordBatch,
    conditions: &[(String, RecordBatch)],
    blank_counts: [&RecordBatch; 2],
    strict: bool,
) -> Result<RecordBatch> {
    let mut columns = Columns::default();
    columns.extend_from(library);
    columns.push(LIBRARY_NAME, library.column_checked(SUBLIBRARY, "pivoting conditions")?.clone());

    for (name, merged) in conditions {
        let indices = align(library, merged, name, strict)?;
        for suffix in CONDITION_SUFFIXES {
            let column = merged.column_checked(suffix, &format!("pivoting {name}"))?;
            columns.push(&format!("{name}_{suffix}"), compute::take(column.as_ref(), &indices, None)?);
        }
    }

    for (run, samples) in blank_counts.iter().enumerate() {
        let indices = align(library, samples, &format!("blank run {run} samples"), strict)?;
        let value = samples.column_checked(VALUE, "attaching blank counts")?;
        columns.push(BLANK_HIT_COUNTS[run], compute::take(value.as_ref(), &indices, None)?);
    }

    let index = match compound_keys(library)? {
        Some(_) => compound_index_column(library, "indexing library")?,
        None => index_by_smiles(library, conditions)?,
    };
    columns.push(COMPOUND_INDEX, Arc::new(index));

    let wide = columns.finish()?;
    tracing::info!(rows = wide.num_rows(), columns = wide.num_columns(), "pivoted conditions");
    Ok(wide)
}

fn index_by_smiles(library: &RecordBatch, conditions: &[(String, RecordBatch)]) -> Result<StringArray> {
    let mut by_smiles: FxHashMap<String, String> = FxHashMap::default();
    for (name, merged) in conditions {
        let context = format!("mapping SMILES to CompoundIndex in {name}");
        let smiles = merged.string_column(SMILES, &context)?;
        let index = merged.string_column(COMPOUND_INDEX, &context)?;
        for i in 0..merged.num_rows() {
            if smiles.is_valid(i) && index.is_valid(i) {
                by_smiles
                    .entry(smiles.value(i).to_string())
                    .or_insert_with(|| index.value(i).to_string());
            }
        }
    }

    let smiles = library.string_column(SMILES, "indexing library")?;
    Ok(smiles
        .iter()
        .map(|s| s.and_then(|s| by_smiles.get(s).cloned()))
        .collect())
}
