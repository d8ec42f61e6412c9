//! Name-based column access on record batches
//!
//! Every lookup goes through [`TableExt`] so a missing or misnamed column
//! surfaces as [`Error::ColumnNotFound`] naming the column and the step that
//! needed it.

use crate::{Error, Result};
use arrow::array::{Array, ArrayRef, Float64Array, StringArray};
use arrow::compute;
use arrow::datatypes::{DataType, Field, Schema};
use arrow::record_batch::RecordBatch;
use std::sync::Arc;

/// Column helpers for `RecordBatch`
pub trait TableExt {
    /// Look up a column by name
    ///
    /// # Errors
    /// Returns [`Error::ColumnNotFound`] if the column is absent
    fn column_checked(&self, name: &str, context: &str) -> Result<&ArrayRef>;

    /// Read a numeric column as `Float64`
    ///
    /// Integer and float columns are widened; an all-null column reads as
    /// nulls. Text columns are rejected rather than parsed.
    ///
    /// # Errors
    /// Returns error if the column is absent or not numeric
    fn f64_column(&self, name: &str, context: &str) -> Result<Float64Array>;

    /// Read any column rendered as text (`Utf8`)
    ///
    /// # Errors
    /// Returns error if the column is absent or cannot be cast to text
    fn string_column(&self, name: &str, context: &str) -> Result<StringArray>;

    /// Keep only the named columns, in the given order
    ///
    /// # Errors
    /// Returns error if any column is absent
    fn select_columns<S: AsRef<str>>(&self, names: &[S], context: &str) -> Result<RecordBatch>;

    /// Append a column, replacing an existing column of the same name in place
    ///
    /// # Errors
    /// Returns error if the array length differs from the row count
    fn with_column(&self, name: &str, array: ArrayRef) -> Result<RecordBatch>;

    /// Rename a column if present; absent columns are left alone
    ///
    /// # Errors
    /// Returns error if the renamed batch cannot be rebuilt
    fn rename_column(&self, from: &str, to: &str) -> Result<RecordBatch>;

    /// True if the table has a column with this name
    fn has_column(&self, name: &str) -> bool;
}

impl TableExt for RecordBatch {
    fn column_checked(&self, name: &str, context: &str) -> Result<&ArrayRef> {
        self.column_by_name(name)
            .ok_or_else(|| Error::column_not_found(name, context))
    }

    fn f64_column(&self, name: &str, context: &str) -> Result<Float64Array> {
        let column = self.column_checked(name, context)?;
        let data_type = column.data_type();
        if !(data_type.is_numeric() || data_type == &DataType::Null) {
            return Err(Error::TypeMismatch {
                column: name.to_string(),
                detail: format!("expected a numeric column, found {data_type:?}"),
            });
        }
        let casted = compute::cast(column, &DataType::Float64)?;
        casted
            .as_any()
            .downcast_ref::<Float64Array>()
            .cloned()
            .ok_or_else(|| Error::StorageError(format!("Failed to downcast {name} to Float64Array")))
    }

    fn string_column(&self, name: &str, context: &str) -> Result<StringArray> {
        let column = self.column_checked(name, context)?;
        let casted = compute::cast(column, &DataType::Utf8)?;
        casted
            .as_any()
            .downcast_ref::<StringArray>()
            .cloned()
            .ok_or_else(|| Error::StorageError(format!("Failed to downcast {name} to StringArray")))
    }

    fn select_columns<S: AsRef<str>>(&self, names: &[S], context: &str) -> Result<RecordBatch> {
        let schema = self.schema();
        let indices = names
            .iter()
            .map(|name| {
                schema
                    .index_of(name.as_ref())
                    .map_err(|_| Error::column_not_found(name.as_ref(), context))
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(self.project(&indices)?)
    }

    fn with_column(&self, name: &str, array: ArrayRef) -> Result<RecordBatch> {
        if array.len() != self.num_rows() {
            return Err(Error::InvalidInput(format!(
                "Column '{name}' has {} rows, table has {}",
                array.len(),
                self.num_rows()
            )));
        }
        let schema = self.schema();
        let mut fields: Vec<Field> = schema.fields().iter().map(|f| f.as_ref().clone()).collect();
        let mut columns: Vec<ArrayRef> = self.columns().to_vec();
        let field = Field::new(name, array.data_type().clone(), true);

        match schema.index_of(name) {
            Ok(idx) => {
                fields[idx] = field;
                columns[idx] = array;
            }
            Err(_) => {
                fields.push(field);
                columns.push(array);
            }
        }

        Ok(RecordBatch::try_new(Arc::new(Schema::new(fields)), columns)?)
    }

    fn rename_column(&self, from: &str, to: &str) -> Result<RecordBatch> {
        let schema = self.schema();
        let Ok(idx) = schema.index_of(from) else {
            return Ok(self.clone());
        };
        let mut fields: Vec<Field> = schema.fields().iter().map(|f| f.as_ref().clone()).collect();
        fields[idx] = fields[idx].clone().with_name(to);
        Ok(RecordBatch::try_new(
            Arc::new(Schema::new(fields)),
            self.columns().to_vec(),
        )?)
    }

    fn has_column(&self, name: &str) -> bool {
        self.schema().index_of(name).is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use arrow::array::Int64Array;

    fn sample() -> RecordBatch {
        RecordBatch::try_from_iter(vec![
            ("SMILES", Arc::new(StringArray::from(vec!["CCO", "CCN"])) as ArrayRef),
            ("hit_counts_0", Arc::new(Int64Array::from(vec![Some(4), None]))),
        ])
        .unwrap()
    }

    #[test]
    fn test_missing_column_names_context() {
        let err = sample().f64_column("er", "filtering CK1a").unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("'er'"));
        assert!(msg.contains("filtering CK1a"));
    }

    #[test]
    fn test_f64_column_widens_integers_and_keeps_nulls() {
        let counts = sample().f64_column("hit_counts_0", "test").unwrap();
        assert!((counts.value(0) - 4.0).abs() < f64::EPSILON);
        assert!(counts.is_null(1));
    }

    #[test]
    fn test_f64_column_rejects_text() {
        let err = sample().f64_column("SMILES", "test").unwrap_err();
        assert!(matches!(err, Error::TypeMismatch { .. }));
    }

    #[test]
    fn test_select_columns_orders_by_request() {
        let selected = sample().select_columns(&["hit_counts_0", "SMILES"], "test").unwrap();
        assert_eq!(selected.schema().field(0).name(), "hit_counts_0");
        assert_eq!(selected.schema().field(1).name(), "SMILES");
        assert!(sample().select_columns(&["nope"], "test").is_err());
    }

    #[test]
    fn test_with_column_replaces_in_place() {
        let table = sample();
        let replaced = table
            .with_column("SMILES", Arc::new(StringArray::from(vec!["O", "N"])))
            .unwrap();
        assert_eq!(replaced.num_columns(), 2);
        assert_eq!(replaced.string_column("SMILES", "test").unwrap().value(1), "N");

        let appended = table
            .with_column("customlabel", Arc::new(StringArray::from(vec!["Cryptic", "Cryptic"])))
            .unwrap();
        assert_eq!(appended.num_columns(), 3);

        assert!(table.with_column("short", Arc::new(StringArray::from(vec!["x"]))).is_err());
    }

    #[test]
    fn test_rename_column() {
        let renamed = sample().rename_column("SMILES", "structure").unwrap();
        assert!(renamed.has_column("structure"));
        assert!(!renamed.has_column("SMILES"));
        let untouched = sample().rename_column("absent", "x").unwrap();
        assert_eq!(untouched.schema(), sample().schema());
    }
}
