//! Threshold filter: replicate counts against the blank
//!
//! A compound passes when every replicate count of the condition is above the
//! count threshold and the blank signal stays at or below the blank
//! threshold. Nulls never satisfy a comparison, so a compound missing a count
//! is neither a hit nor a negative.
//!
//! Long-format screens carry no counts: a condition's hits are its rows in
//! the table, picked by sample label ([`sample_side`]).

use crate::condition::{
    ConditionColumns, Layout, BLANK_COUNTS, BLANK_EFFECT_SIZE, BLANK_HIT_COUNTS, COMPOUND_INDEX, SAMPLE_LABEL,
    SMILES, ZSCORE,
};
use crate::storage::TableExt;
use crate::{Error, Result};
use arrow::array::{Array, BooleanArray, Float64Array};
use arrow::compute;
use arrow::record_batch::RecordBatch;

/// What the blank threshold is compared against
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BlankCriterion {
    /// Blank replicate count columns
    Counts(Vec<String>),
    /// Blank effect-size column
    EffectSize(String),
}

impl BlankCriterion {
    fn columns(&self) -> Vec<&str> {
        match self {
            Self::Counts(columns) => columns.iter().map(String::as_str).collect(),
            Self::EffectSize(column) => vec![column.as_str()],
        }
    }
}

/// Count-above / blank-below filter for one condition
#[derive(Debug, Clone, PartialEq)]
pub struct HitCountFilter {
    /// Condition count columns, all must exceed `count_threshold`
    pub count_columns: Vec<String>,
    /// Exclusive lower bound for condition counts
    pub count_threshold: f64,
    /// Blank columns, all must stay at or below `blank_threshold`
    pub blank: BlankCriterion,
    /// Inclusive upper bound for the blank signal
    pub blank_threshold: f64,
}

/// Filtered rows and the share of input rows that passed
#[derive(Debug, Clone)]
pub struct FilterOutcome {
    /// Passing rows, input order kept
    pub table: RecordBatch,
    /// `passed / input`, `0.0` for empty input
    pub pass_fraction: f64,
}

impl HitCountFilter {
    /// Replicate-count filter
    ///
    /// Two count columns compare against both blank replicates, a single
    /// count column against `blank_hit_counts_0` only.
    #[must_use]
    pub fn new(count_columns: Vec<String>, count_threshold: f64, blank_threshold: f64) -> Self {
        let blanks = BLANK_HIT_COUNTS
            .iter()
            .take(count_columns.len().clamp(1, 2))
            .map(|c| (*c).to_string())
            .collect();
        Self {
            count_columns,
            count_threshold,
            blank: BlankCriterion::Counts(blanks),
            blank_threshold,
        }
    }

    /// Effect-size filter on `"<label> counts"` and `"blank Effect Size"`
    #[must_use]
    pub fn effect_size(count_column: &str, count_threshold: f64, blank_threshold: f64) -> Self {
        Self {
            count_columns: vec![count_column.to_string()],
            count_threshold,
            blank: BlankCriterion::EffectSize(BLANK_EFFECT_SIZE.to_string()),
            blank_threshold,
        }
    }

    /// Filter for a condition's columns under the given layout
    ///
    /// Long-format conditions have no count columns, so every row passes.
    #[must_use]
    pub fn for_condition(
        layout: Layout,
        columns: &ConditionColumns,
        count_threshold: f64,
        blank_threshold: f64,
    ) -> Self {
        match layout {
            Layout::Enrichment => Self::new(columns.counts.clone(), count_threshold, blank_threshold),
            Layout::EffectSize => {
                let count = columns.counts.first().map_or(BLANK_COUNTS, String::as_str);
                Self::effect_size(count, count_threshold, blank_threshold)
            }
            Layout::LongFormat => Self {
                count_columns: columns.counts.clone(),
                count_threshold,
                blank: BlankCriterion::Counts(Vec::new()),
                blank_threshold,
            },
        }
    }

    /// Row mask: true where the row passes
    ///
    /// # Errors
    /// Returns error if a column is missing or not numeric
    pub fn mask(&self, table: &RecordBatch) -> Result<BooleanArray> {
        let context = format!("filtering on {}", self.count_columns.join(", "));
        let mut passed = self.count_pass(table, &context)?;
        for column in self.blank.columns() {
            let values = table.f64_column(column, &context)?;
            and_where(&mut passed, &values, |v| v <= self.blank_threshold);
        }
        Ok(BooleanArray::from(passed))
    }

    /// Row mask on the condition counts alone, blank ignored
    ///
    /// # Errors
    /// Returns error if a count column is missing or not numeric
    pub fn count_mask(&self, table: &RecordBatch) -> Result<BooleanArray> {
        let context = format!("filtering on {}", self.count_columns.join(", "));
        Ok(BooleanArray::from(self.count_pass(table, &context)?))
    }

    fn count_pass(&self, table: &RecordBatch, context: &str) -> Result<Vec<bool>> {
        let mut passed = vec![true; table.num_rows()];
        for column in &self.count_columns {
            let values = table.f64_column(column, context)?;
            and_where(&mut passed, &values, |v| v > self.count_threshold);
        }
        Ok(passed)
    }

    /// Keep passing rows
    ///
    /// # Errors
    /// Returns error if a column is missing or not numeric
    pub fn apply(&self, table: &RecordBatch) -> Result<FilterOutcome> {
        if table.num_rows() == 0 {
            return Ok(FilterOutcome {
                table: table.clone(),
                pass_fraction: 0.0,
            });
        }
        let mask = self.mask(table)?;
        let filtered = compute::filter_record_batch(table, &mask)?;
        #[allow(clippy::cast_precision_loss)]
        let pass_fraction = filtered.num_rows() as f64 / table.num_rows() as f64;

        tracing::info!(
            columns = %self.count_columns.join(","),
            passed = filtered.num_rows(),
            total = table.num_rows(),
            pass_fraction,
            "filtered"
        );
        Ok(FilterOutcome {
            table: filtered,
            pass_fraction,
        })
    }
}

/// Filter on one or two replicate count columns against the blank replicates
///
/// # Errors
/// Returns error if a column is missing or not numeric
pub fn filter(
    table: &RecordBatch,
    count_column_0: &str,
    count_column_1: Option<&str>,
    count_threshold: f64,
    blank_threshold: f64,
) -> Result<FilterOutcome> {
    let columns = std::iter::once(count_column_0)
        .chain(count_column_1)
        .map(str::to_string)
        .collect();
    HitCountFilter::new(columns, count_threshold, blank_threshold).apply(table)
}

/// Rows of a long-format screen for one condition
///
/// Keeps rows whose `Sample` equals the condition label, renames `ZScore` to
/// the condition's metric column and projects to
/// `CompoundIndex, SMILES, Sample, <metric>`.
///
/// # Errors
/// Returns error if a long-format column is missing
pub fn sample_side(table: &RecordBatch, columns: &ConditionColumns) -> Result<RecordBatch> {
    let context = format!("selecting {} rows", columns.name);
    let samples = table.string_column(SAMPLE_LABEL, &context)?;
    let mask: BooleanArray = samples
        .iter()
        .map(|s| Some(s == Some(columns.name.as_str())))
        .collect();
    let side = compute::filter_record_batch(table, &mask)?
        .rename_column(ZSCORE, &columns.metric)?
        .select_columns(&[COMPOUND_INDEX, SMILES, SAMPLE_LABEL, columns.metric.as_str()], &context)?;
    tracing::info!(sample = %columns.name, rows = side.num_rows(), total = table.num_rows(), "selected sample rows");
    Ok(side)
}

/// Compounds the blank binds but no condition does
///
/// Blank signal above `blank_threshold` and every count column of every
/// listed condition at or below `count_threshold`.
///
/// # Errors
/// - [`Error::InvalidInput`] for long-format screens, which have no blank
/// - a column is missing or not numeric
pub fn negative_set(
    table: &RecordBatch,
    layout: Layout,
    conditions: &[ConditionColumns],
    count_threshold: f64,
    blank_threshold: f64,
) -> Result<RecordBatch> {
    let context = "selecting the negative set";
    let mut selected = vec![true; table.num_rows()];

    let blanks: &[&str] = match layout {
        Layout::Enrichment => &BLANK_HIT_COUNTS,
        Layout::EffectSize => &[BLANK_EFFECT_SIZE],
        Layout::LongFormat => {
            return Err(Error::InvalidInput(
                "long-format screens have no blank signal to select negatives from".into(),
            ))
        }
    };
    for column in blanks {
        let values = table.f64_column(column, context)?;
        and_where(&mut selected, &values, |v| v > blank_threshold);
    }
    for column in conditions.iter().flat_map(|c| c.counts.iter()) {
        let values = table.f64_column(column, context)?;
        and_where(&mut selected, &values, |v| v <= count_threshold);
    }

    let negative = compute::filter_record_batch(table, &BooleanArray::from(selected))?;
    tracing::info!(rows = negative.num_rows(), total = table.num_rows(), "negative set");
    Ok(negative)
}

fn and_where(mask: &mut [bool], values: &Float64Array, predicate: impl Fn(f64) -> bool) {
    for (i, keep) in mask.iter_mut().enumerate() {
        *keep = *keep && values.is_valid(i) && predicate(values.value(i));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use arrow::array::{ArrayRef, StringArray};
    use proptest::prelude::*;
    use std::sync::Arc;

    fn counts_table(rows: &[(Option<f64>, Option<f64>, f64, f64)]) -> RecordBatch {
        let smiles: Vec<String> = (0..rows.len()).map(|i| format!("C{i}")).collect();
        RecordBatch::try_from_iter(vec![
            ("SMILES", Arc::new(StringArray::from(smiles)) as ArrayRef),
            ("CK1a_hit_counts_0", Arc::new(rows.iter().map(|r| r.0).collect::<Float64Array>())),
            ("CK1a_hit_counts_1", Arc::new(rows.iter().map(|r| r.1).collect::<Float64Array>())),
            ("blank_hit_counts_0", Arc::new(Float64Array::from(rows.iter().map(|r| r.2).collect::<Vec<_>>()))),
            ("blank_hit_counts_1", Arc::new(Float64Array::from(rows.iter().map(|r| r.3).collect::<Vec<_>>()))),
        ])
        .unwrap()
    }

    #[test]
    fn test_counts_above_threshold_blank_clean_pass() {
        let table = counts_table(&[(Some(5.0), Some(5.0), 0.0, 0.0)]);
        let out = filter(&table, "CK1a_hit_counts_0", Some("CK1a_hit_counts_1"), 3.0, 1.0).unwrap();
        assert_eq!(out.table.num_rows(), 1);
        assert!((out.pass_fraction - 1.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_blank_above_threshold_fails() {
        let table = counts_table(&[(Some(5.0), Some(5.0), 2.0, 0.0)]);
        let out = filter(&table, "CK1a_hit_counts_0", Some("CK1a_hit_counts_1"), 3.0, 1.0).unwrap();
        assert_eq!(out.table.num_rows(), 0);
        assert!(out.pass_fraction.abs() < f64::EPSILON);
    }

    #[test]
    fn test_threshold_is_exclusive_blank_inclusive() {
        let table = counts_table(&[(Some(3.0), Some(4.0), 0.0, 0.0), (Some(4.0), Some(4.0), 1.0, 1.0)]);
        let out = filter(&table, "CK1a_hit_counts_0", Some("CK1a_hit_counts_1"), 3.0, 1.0).unwrap();
        assert_eq!(out.table.num_rows(), 1);
        assert!((out.pass_fraction - 0.5).abs() < f64::EPSILON);
    }

    #[test]
    fn test_single_replicate_ignores_second_blank() {
        let table = counts_table(&[(Some(5.0), None, 0.0, 9.0)]);
        let out = filter(&table, "CK1a_hit_counts_0", None, 3.0, 1.0).unwrap();
        assert_eq!(out.table.num_rows(), 1);
    }

    #[test]
    fn test_null_counts_never_pass() {
        let table = counts_table(&[(Some(5.0), None, 0.0, 0.0)]);
        let out = filter(&table, "CK1a_hit_counts_0", Some("CK1a_hit_counts_1"), 3.0, 1.0).unwrap();
        assert_eq!(out.table.num_rows(), 0);
    }

    #[test]
    fn test_empty_input_has_zero_pass_fraction() {
        let table = counts_table(&[]);
        let out = filter(&table, "CK1a_hit_counts_0", Some("CK1a_hit_counts_1"), 3.0, 1.0).unwrap();
        assert_eq!(out.table.num_rows(), 0);
        assert!(out.pass_fraction.abs() < f64::EPSILON);
    }

    #[test]
    fn test_missing_column_is_an_error() {
        let table = counts_table(&[(Some(5.0), Some(5.0), 0.0, 0.0)]);
        let err = filter(&table, "CK1b_hit_counts_0", None, 3.0, 1.0).unwrap_err();
        assert!(err.to_string().contains("CK1b_hit_counts_0"));
    }

    #[test]
    fn test_effect_size_layout() {
        let table = RecordBatch::try_from_iter(vec![
            ("A counts", Arc::new(Float64Array::from(vec![10.0, 10.0, 1.0])) as ArrayRef),
            ("blank Effect Size", Arc::new(Float64Array::from(vec![0.1, 5.0, 0.1]))),
        ])
        .unwrap();
        let columns = ConditionColumns::effect_size("A");
        let out = HitCountFilter::for_condition(Layout::EffectSize, &columns, 3.0, 1.0)
            .apply(&table)
            .unwrap();
        assert_eq!(out.table.num_rows(), 1);
    }

    #[test]
    fn test_negative_set() {
        let table = counts_table(&[
            (Some(0.0), Some(1.0), 5.0, 6.0),
            (Some(9.0), Some(1.0), 5.0, 6.0),
            (Some(0.0), Some(0.0), 5.0, 0.0),
            (None, Some(0.0), 5.0, 6.0),
        ]);
        let negative = negative_set(
            &table,
            Layout::Enrichment,
            &[ConditionColumns::enrichment("CK1a")],
            3.0,
            1.0,
        )
        .unwrap();
        assert_eq!(negative.num_rows(), 1);
        let smiles = negative.string_column("SMILES", "test").unwrap();
        assert_eq!(smiles.value(0), "C0");
    }

    #[test]
    fn test_negative_set_spans_every_pair() {
        let conditions: Vec<ConditionColumns> = ["CK1a", "CK1a_inh", "CK1d", "CK1d_inh"]
            .into_iter()
            .map(ConditionColumns::enrichment)
            .collect();
        // per row: counts for the four conditions (two replicates each), then blanks
        let rows: [([f64; 8], [f64; 2]); 3] = [
            ([0.0, 1.0, 0.0, 0.0, 2.0, 0.0, 1.0, 0.0], [5.0, 6.0]),
            ([0.0, 0.0, 1.0, 0.0, 0.0, 9.0, 0.0, 0.0], [5.0, 6.0]),
            ([0.0; 8], [0.0, 6.0]),
        ];
        let mut columns: Vec<(String, ArrayRef)> = vec![(
            "SMILES".to_string(),
            Arc::new(StringArray::from(vec!["C0", "C1", "C2"])) as ArrayRef,
        )];
        let names = conditions.iter().flat_map(|c| c.counts.iter().cloned());
        for (i, name) in names.enumerate() {
            let values: Vec<f64> = rows.iter().map(|r| r.0[i]).collect();
            columns.push((name, Arc::new(Float64Array::from(values)) as ArrayRef));
        }
        for (i, name) in BLANK_HIT_COUNTS.iter().enumerate() {
            let values: Vec<f64> = rows.iter().map(|r| r.1[i]).collect();
            columns.push(((*name).to_string(), Arc::new(Float64Array::from(values)) as ArrayRef));
        }
        let table = RecordBatch::try_from_iter(columns).unwrap();

        let negative = negative_set(&table, Layout::Enrichment, &conditions, 3.0, 1.0).unwrap();
        let smiles = negative.string_column("SMILES", "test").unwrap();
        // C1 binds CK1d in one replicate of the second pair only, C2 has a clean blank
        assert_eq!(negative.num_rows(), 1);
        assert_eq!(smiles.value(0), "C0");
    }

    #[test]
    fn test_negative_set_needs_a_blank() {
        let table = counts_table(&[]);
        let err = negative_set(&table, Layout::LongFormat, &[], 3.0, 1.0).unwrap_err();
        assert!(matches!(err, Error::InvalidInput(_)));
    }

    #[test]
    fn test_sample_side_selects_and_renames() {
        let table = RecordBatch::try_from_iter(vec![
            ("CompoundIndex", Arc::new(StringArray::from(vec!["1", "2", "2"])) as ArrayRef),
            ("SMILES", Arc::new(StringArray::from(vec!["CCO", "CCN", "CCN"]))),
            ("Sample", Arc::new(StringArray::from(vec![Some("Sigma-A"), Some("Sigma-A-inh"), None]))),
            ("ZScore", Arc::new(Float64Array::from(vec![5.0, 4.0, 3.0]))),
            ("Plate", Arc::new(StringArray::from(vec!["p1", "p1", "p2"]))),
        ])
        .unwrap();

        let side = sample_side(&table, &ConditionColumns::long_format("Sigma-A-inh")).unwrap();
        assert_eq!(side.num_rows(), 1);
        assert_eq!(side.num_columns(), 4);
        let score = side.f64_column("ZScore_Sigma-A-inh", "test").unwrap();
        assert!((score.value(0) - 4.0).abs() < f64::EPSILON);
        assert_eq!(side.string_column("SMILES", "test").unwrap().value(0), "CCN");

        let columns = ConditionColumns::long_format("Sigma-A");
        let everything = HitCountFilter::for_condition(Layout::LongFormat, &columns, 3.0, 1.0)
            .apply(&table)
            .unwrap();
        assert_eq!(everything.table.num_rows(), 3);
    }

    fn arb_rows() -> impl Strategy<Value = Vec<(Option<f64>, Option<f64>, f64, f64)>> {
        proptest::collection::vec(
            (
                proptest::option::weighted(0.9, 0u8..20),
                proptest::option::weighted(0.9, 0u8..20),
                0u8..5,
                0u8..5,
            )
                .prop_map(|(a, b, c, d)| {
                    (a.map(f64::from), b.map(f64::from), f64::from(c), f64::from(d))
                }),
            0..40,
        )
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(100))]

        /// Raising the count threshold never grows the passing set
        #[test]
        fn prop_count_threshold_monotone(rows in arb_rows(), low in 0u8..20, step in 0u8..10, blank in 0u8..5) {
            let table = counts_table(&rows);
            let lo = filter(&table, "CK1a_hit_counts_0", Some("CK1a_hit_counts_1"), f64::from(low), f64::from(blank)).unwrap();
            let hi = filter(&table, "CK1a_hit_counts_0", Some("CK1a_hit_counts_1"), f64::from(low) + f64::from(step), f64::from(blank)).unwrap();
            prop_assert!(hi.table.num_rows() <= lo.table.num_rows());
        }

        /// Raising the blank threshold never shrinks the passing set
        #[test]
        fn prop_blank_threshold_monotone(rows in arb_rows(), count in 0u8..20, low in 0u8..5, step in 0u8..5) {
            let table = counts_table(&rows);
            let lo = filter(&table, "CK1a_hit_counts_0", Some("CK1a_hit_counts_1"), f64::from(count), f64::from(low)).unwrap();
            let hi = filter(&table, "CK1a_hit_counts_0", Some("CK1a_hit_counts_1"), f64::from(count), f64::from(low) + f64::from(step)).unwrap();
            prop_assert!(hi.table.num_rows() >= lo.table.num_rows());
        }
    }
}
