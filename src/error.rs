//! Error types for del-strata
//!
//! Every stage is a one-shot batch step: errors abort the run and the operator
//! re-runs after fixing inputs or config. Messages name the column, file or key
//! that needs fixing.

use thiserror::Error;

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;

/// del-strata error types
#[derive(Error, Debug)]
pub enum Error {
    /// A required column is absent from a table
    #[error("Column not found: '{column}' (while {context})")]
    ColumnNotFound {
        /// Missing column name
        column: String,
        /// What the pipeline was doing when it looked for the column
        context: String,
    },

    /// Column exists but its type cannot be used for the requested operation
    #[error("Type mismatch for column '{column}': {detail}")]
    TypeMismatch {
        /// Offending column
        column: String,
        /// Explanation (expected vs. actual type)
        detail: String,
    },

    /// Two tables that must describe the same compounds do not line up
    #[error("Alignment mismatch: {0}\nCheck that sample, library and enrichment tables cover the same compounds")]
    AlignmentMismatch(String),

    /// A join key occurs more than once on the lookup side
    #[error("Duplicate compound key '{key}' in {table}")]
    DuplicateKey {
        /// Rendered key
        key: String,
        /// Table description (usually a file name)
        table: String,
    },

    /// Configuration is missing or inconsistent
    #[error("Config error: {0}")]
    Config(String),

    /// Configuration document could not be parsed
    #[error("Config parse error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// SMILES string could not be parsed into a molecular graph
    #[error("SMILES parse error at position {position}: {reason}")]
    SmilesParse {
        /// Character offset of the failure
        position: usize,
        /// What went wrong
        reason: String,
    },

    /// Invalid argument passed to a library function
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Storage error (CSV/Parquet layout problems)
    #[error("Storage error: {0}")]
    StorageError(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Arrow error
    #[error("Arrow error: {0}")]
    Arrow(#[from] arrow::error::ArrowError),

    /// Parquet error
    #[error("Parquet error: {0}")]
    Parquet(#[from] parquet::errors::ParquetError),

    /// Manifest serialization error
    #[error("Serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

impl Error {
    /// Shorthand for [`Error::ColumnNotFound`]
    pub fn column_not_found(column: impl Into<String>, context: impl Into<String>) -> Self {
        Self::ColumnNotFound {
            column: column.into(),
            context: context.into(),
        }
    }
}
