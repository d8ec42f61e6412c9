//! Stratifier: partition a condition's hits against its inhibited counterpart
//!
//! ```text
//! base only (by SMILES)        -> Orthosteric
//! inhibited only (by SMILES)   -> Cryptic
//! full-tuple inner join        -> Allosteric [-> competitive / non-competitive]
//! ```
//!
//! The join compares every join-key column, so a compound present on both
//! sides whose metadata differs lands in no stratum. Those rows are counted
//! and logged rather than silently dropped.

use crate::condition::{ConditionPair, COMPETITIVE, CUSTOM_LABEL, SMILES};
use crate::storage::{self, TableExt};
use crate::{Error, Result};
use arrow::array::{Array, ArrayRef, BooleanArray, Float64Array, StringArray, UInt32Array};
use arrow::compute;
use arrow::record_batch::RecordBatch;
use arrow::row::{Row, RowConverter, SortField};
use rustc_hash::{FxHashMap, FxHashSet};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

/// Binding-mode category
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum Stratum {
    /// Binds without inhibitor only
    Orthosteric,
    /// Binds with inhibitor only
    Cryptic,
    /// Binds in both conditions
    Allosteric,
}

impl Stratum {
    /// Every stratum, in `all_labels` order
    pub const ALL: [Self; 3] = [Self::Orthosteric, Self::Cryptic, Self::Allosteric];

    /// Label written to `customlabel`
    #[must_use]
    pub const fn label(self) -> &'static str {
        match self {
            Self::Orthosteric => "Orthosteric",
            Self::Cryptic => "Cryptic",
            Self::Allosteric => "Allosteric",
        }
    }
}

impl fmt::Display for Stratum {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Allosteric rows split by the competitive measure
#[derive(Debug, Clone)]
pub struct CompetitiveSplit {
    /// `base_metric > inhibited_metric * coefficient`
    pub competitive: RecordBatch,
    /// Everything else, including rows with a null metric
    pub non_competitive: RecordBatch,
}

/// Result of stratifying one condition pair
#[derive(Debug, Clone)]
pub struct Stratification {
    /// Base rows whose SMILES is absent from the inhibited side
    pub orthosteric: RecordBatch,
    /// Inhibited rows whose SMILES is absent from the base side
    pub cryptic: RecordBatch,
    /// Inner join on the full join-key tuple
    pub allosteric: RecordBatch,
    /// Present when the pair carries a competitive measure
    pub competitive: Option<CompetitiveSplit>,
    /// Rows sharing a SMILES across sides that failed the tuple join
    pub unmatched_shared: usize,
}

/// Row counts per stratum, for logs and the run manifest
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StratumCounts {
    /// Orthosteric rows
    pub orthosteric: usize,
    /// Cryptic rows
    pub cryptic: usize,
    /// Allosteric rows
    pub allosteric: usize,
    /// Allosteric rows passing the competitive measure
    pub competitive: Option<usize>,
    /// Shared-SMILES rows in no stratum
    pub unmatched_shared: usize,
}

impl Stratification {
    /// Orthosteric, Cryptic and Allosteric rows in one table, schemas unified
    /// by column name
    ///
    /// # Errors
    /// Returns error if the tables cannot be concatenated
    pub fn all_labels(&self) -> Result<RecordBatch> {
        storage::concat_tables(&[
            self.orthosteric.clone(),
            self.cryptic.clone(),
            self.allosteric.clone(),
        ])
    }

    /// Orthosteric plus competitive Allosteric rows, if the split ran
    ///
    /// # Errors
    /// Returns error if the tables cannot be concatenated
    pub fn positive(&self) -> Result<Option<RecordBatch>> {
        self.competitive
            .as_ref()
            .map(|split| {
                storage::concat_tables(&[self.orthosteric.clone(), split.competitive.clone()])
            })
            .transpose()
    }

    /// Row counts per stratum
    #[must_use]
    pub fn counts(&self) -> StratumCounts {
        StratumCounts {
            orthosteric: self.orthosteric.num_rows(),
            cryptic: self.cryptic.num_rows(),
            allosteric: self.allosteric.num_rows(),
            competitive: self.competitive.as_ref().map(|s| s.competitive.num_rows()),
            unmatched_shared: self.unmatched_shared,
        }
    }
}

/// Rows of a labelled table carrying `stratum`'s `customlabel`
///
/// # Errors
/// Returns error if the table has no `customlabel` column
pub fn select_stratum(labelled: &RecordBatch, stratum: Stratum) -> Result<RecordBatch> {
    let labels = labelled.string_column(CUSTOM_LABEL, "selecting a stratum")?;
    rows_where(labelled, labels.iter().map(|l| l == Some(stratum.label())))
}

/// Partition filtered base and inhibited rows of one condition pair
///
/// Allosteric rows keep the base side's columns; duplicate tuple matches
/// multiply as in a relational inner join.
///
/// # Errors
/// Returns error if a join key, `SMILES`, or a metric column is missing
pub fn stratify(
    base: &RecordBatch,
    inhibited: &RecordBatch,
    join_keys: &[String],
    pair: &ConditionPair,
) -> Result<Stratification> {
    let context = format!("stratifying {}", pair.code);

    let base_smiles = base.string_column(SMILES, &context)?;
    let inhibited_smiles = inhibited.string_column(SMILES, &context)?;
    let base_set: FxHashSet<Option<&str>> = base_smiles.iter().collect();
    let inhibited_set: FxHashSet<Option<&str>> = inhibited_smiles.iter().collect();

    let orthosteric = rows_where(base, base_smiles.iter().map(|s| !inhibited_set.contains(&s)))?;
    let cryptic = rows_where(inhibited, inhibited_smiles.iter().map(|s| !base_set.contains(&s)))?;

    let join = tuple_join(base, inhibited, join_keys, &context)?;
    let unmatched_shared = count_unmatched(&base_smiles, &inhibited_set, &join.base_matched)
        + count_unmatched(&inhibited_smiles, &base_set, &join.inhibited_matched);
    if unmatched_shared > 0 {
        tracing::warn!(
            condition = %pair.code,
            rows = unmatched_shared,
            "compounds share a SMILES but differ in other join columns"
        );
    }

    let mut allosteric = take(base, &join.base_rows)?;
    allosteric = with_label(&allosteric, Stratum::Allosteric)?;
    if let Some((er_merge, lb_merge)) = pair.merge_columns() {
        let inhibited_rows = take(inhibited, &join.inhibited_rows)?;
        allosteric = allosteric.with_column(
            &er_merge,
            Arc::new(row_mean(&allosteric, &pair.base.metric, &inhibited_rows, &pair.inhibited.metric, &context)?),
        )?;
        if let (Some(lb_merge), Some(base_lb), Some(inh_lb)) =
            (lb_merge, &pair.base.metric_lb, &pair.inhibited.metric_lb)
        {
            allosteric = allosteric.with_column(
                &lb_merge,
                Arc::new(row_mean(&allosteric, base_lb, &inhibited_rows, inh_lb, &context)?),
            )?;
        }
    }

    let competitive = match pair.competitive_measure {
        Some(coefficient) => {
            let inhibited_rows = take(inhibited, &join.inhibited_rows)?;
            let (labelled, split) = split_competitive(&allosteric, &inhibited_rows, pair, coefficient, &context)?;
            allosteric = labelled;
            Some(split)
        }
        None => None,
    };

    let result = Stratification {
        orthosteric: with_label(&orthosteric, Stratum::Orthosteric)?,
        cryptic: with_label(&cryptic, Stratum::Cryptic)?,
        allosteric,
        competitive,
        unmatched_shared,
    };
    let counts = result.counts();
    tracing::info!(
        condition = %pair.code,
        orthosteric = counts.orthosteric,
        cryptic = counts.cryptic,
        allosteric = counts.allosteric,
        competitive = ?counts.competitive,
        "stratified"
    );
    Ok(result)
}

struct TupleJoin {
    base_rows: UInt32Array,
    inhibited_rows: UInt32Array,
    base_matched: Vec<bool>,
    inhibited_matched: Vec<bool>,
}

fn tuple_join(
    base: &RecordBatch,
    inhibited: &RecordBatch,
    join_keys: &[String],
    context: &str,
) -> Result<TupleJoin> {
    let base_keys: Vec<ArrayRef> = join_keys
        .iter()
        .map(|k| base.column_checked(k, context).cloned())
        .collect::<Result<_>>()?;
    // inhibited columns take the base side's types so equal values encode equally
    let inhibited_keys: Vec<ArrayRef> = join_keys
        .iter()
        .zip(&base_keys)
        .map(|(k, b)| {
            let column = inhibited.column_checked(k, context)?;
            Ok(compute::cast(column, b.data_type())?)
        })
        .collect::<Result<_>>()?;

    let converter = RowConverter::new(
        base_keys
            .iter()
            .map(|c| SortField::new(c.data_type().clone()))
            .collect(),
    )?;
    let base_encoded = converter.convert_columns(&base_keys)?;
    let inhibited_encoded = converter.convert_columns(&inhibited_keys)?;

    let mut lookup: FxHashMap<Row<'_>, Vec<u32>> = FxHashMap::default();
    for (i, row) in inhibited_encoded.iter().enumerate() {
        lookup.entry(row).or_default().push(row_index(i)?);
    }

    let mut base_rows = Vec::new();
    let mut inhibited_rows = Vec::new();
    let mut base_matched = vec![false; base.num_rows()];
    let mut inhibited_matched = vec![false; inhibited.num_rows()];
    for (i, row) in base_encoded.iter().enumerate() {
        let Some(matches) = lookup.get(&row) else { continue };
        base_matched[i] = true;
        for &j in matches {
            base_rows.push(row_index(i)?);
            inhibited_rows.push(j);
            if let Some(flag) = inhibited_matched.get_mut(j as usize) {
                *flag = true;
            }
        }
    }

    Ok(TupleJoin {
        base_rows: UInt32Array::from(base_rows),
        inhibited_rows: UInt32Array::from(inhibited_rows),
        base_matched,
        inhibited_matched,
    })
}

fn count_unmatched(smiles: &StringArray, other: &FxHashSet<Option<&str>>, matched: &[bool]) -> usize {
    smiles
        .iter()
        .zip(matched)
        .filter(|(s, matched)| !**matched && other.contains(s))
        .count()
}

/// Competitive label per Allosteric row, then the two halves
fn split_competitive(
    allosteric: &RecordBatch,
    inhibited_rows: &RecordBatch,
    pair: &ConditionPair,
    coefficient: f64,
    context: &str,
) -> Result<(RecordBatch, CompetitiveSplit)> {
    let base_metric = allosteric.f64_column(&pair.base.metric, context)?;
    let inhibited_metric = inhibited_rows.f64_column(&pair.inhibited.metric, context)?;

    let is_competitive: Vec<bool> = (0..allosteric.num_rows())
        .map(|i| {
            base_metric.is_valid(i)
                && inhibited_metric.is_valid(i)
                && base_metric.value(i) > inhibited_metric.value(i) * coefficient
        })
        .collect();
    let labels: StringArray = is_competitive
        .iter()
        .map(|&c| Some(pair.competition_label(c)))
        .collect();

    let labelled = allosteric.with_column(COMPETITIVE, Arc::new(labels))?;
    let mask = BooleanArray::from(is_competitive);
    let split = CompetitiveSplit {
        competitive: compute::filter_record_batch(&labelled, &mask)?,
        non_competitive: compute::filter_record_batch(&labelled, &compute::not(&mask)?)?,
    };
    Ok((labelled, split))
}

/// Mean of the non-null values of two aligned columns
fn row_mean(
    left: &RecordBatch,
    left_column: &str,
    right: &RecordBatch,
    right_column: &str,
    context: &str,
) -> Result<Float64Array> {
    let a = left.f64_column(left_column, context)?;
    let b = right.f64_column(right_column, context)?;
    Ok((0..a.len())
        .map(|i| match (a.is_valid(i), b.is_valid(i)) {
            (true, true) => Some((a.value(i) + b.value(i)) / 2.0),
            (true, false) => Some(a.value(i)),
            (false, true) => Some(b.value(i)),
            (false, false) => None,
        })
        .collect())
}

fn rows_where(table: &RecordBatch, keep: impl Iterator<Item = bool>) -> Result<RecordBatch> {
    let mask: BooleanArray = keep.map(Some).collect();
    Ok(compute::filter_record_batch(table, &mask)?)
}

fn take(table: &RecordBatch, indices: &UInt32Array) -> Result<RecordBatch> {
    crate::merge::take_rows(table, indices)
}

fn with_label(table: &RecordBatch, stratum: Stratum) -> Result<RecordBatch> {
    let labels = StringArray::from(vec![stratum.label(); table.num_rows()]);
    table.with_column(CUSTOM_LABEL, Arc::new(labels))
}

fn row_index(row: usize) -> Result<u32> {
    u32::try_from(row)
        .map_err(|_| Error::InvalidInput(format!("row {row} exceeds the u32 index range")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::condition::Layout;

    fn side(rows: &[(&str, &str, f64)], metric: &str) -> RecordBatch {
        RecordBatch::try_from_iter(vec![
            ("SMILES", Arc::new(StringArray::from(rows.iter().map(|r| r.0).collect::<Vec<_>>())) as ArrayRef),
            ("library.name", Arc::new(StringArray::from(rows.iter().map(|r| r.1).collect::<Vec<_>>()))),
            (metric, Arc::new(Float64Array::from(rows.iter().map(|r| r.2).collect::<Vec<_>>()))),
        ])
        .unwrap()
    }

    fn effect_pair() -> ConditionPair {
        ConditionPair::new("CK1a", Layout::EffectSize, "A", "A-inh")
    }

    fn keys() -> Vec<String> {
        vec!["SMILES".to_string(), "library.name".to_string()]
    }

    fn smiles_of(table: &RecordBatch) -> Vec<String> {
        let col = table.string_column("SMILES", "test").unwrap();
        col.iter().map(|s| s.unwrap_or_default().to_string()).collect()
    }

    #[test]
    fn test_three_way_partition() {
        let base = side(&[("A", "1", 1.0), ("B", "1", 1.0), ("C", "1", 1.0)], "A Effect Size");
        let inhibited = side(&[("B", "1", 1.0), ("C", "1", 1.0), ("D", "1", 1.0)], "A-inh Effect Size");
        // join on the shared columns only
        let result = stratify(&base, &inhibited, &keys(), &effect_pair()).unwrap();

        assert_eq!(smiles_of(&result.orthosteric), vec!["A"]);
        assert_eq!(smiles_of(&result.cryptic), vec!["D"]);
        assert_eq!(smiles_of(&result.allosteric), vec!["B", "C"]);
        assert_eq!(result.unmatched_shared, 0);

        let labels = result.all_labels().unwrap();
        assert_eq!(labels.num_rows(), 4);
        let custom = labels.string_column(CUSTOM_LABEL, "test").unwrap();
        assert_eq!(custom.value(0), "Orthosteric");
        assert_eq!(custom.value(1), "Cryptic");
        assert_eq!(custom.value(3), "Allosteric");

        let allosteric = select_stratum(&labels, Stratum::Allosteric).unwrap();
        assert_eq!(smiles_of(&allosteric), vec!["B", "C"]);
        assert_eq!(select_stratum(&labels, Stratum::Cryptic).unwrap().num_rows(), 1);
    }

    #[test]
    fn test_metadata_mismatch_lands_nowhere() {
        let base = side(&[("A", "1", 1.0), ("B", "1", 1.0)], "A Effect Size");
        let inhibited = side(&[("B", "2", 1.0)], "A-inh Effect Size");
        let result = stratify(&base, &inhibited, &keys(), &effect_pair()).unwrap();

        assert_eq!(smiles_of(&result.orthosteric), vec!["A"]);
        assert_eq!(result.cryptic.num_rows(), 0);
        assert_eq!(result.allosteric.num_rows(), 0);
        assert_eq!(result.unmatched_shared, 2);
    }

    #[test]
    fn test_duplicate_tuples_multiply() {
        let base = side(&[("B", "1", 1.0), ("B", "1", 2.0)], "A Effect Size");
        let inhibited = side(&[("B", "1", 1.0), ("B", "1", 3.0)], "A-inh Effect Size");
        let result = stratify(&base, &inhibited, &keys(), &effect_pair()).unwrap();
        assert_eq!(result.allosteric.num_rows(), 4);
    }

    #[test]
    fn test_competitive_split() {
        let base = side(&[("B", "1", 10.0), ("C", "1", 10.0)], "A Effect Size");
        let inhibited = side(&[("B", "1", 4.0), ("C", "1", 6.0)], "A-inh Effect Size");
        let pair = effect_pair().with_competitive_measure(2.0);
        let result = stratify(&base, &inhibited, &keys(), &pair).unwrap();

        let split = result.competitive.as_ref().unwrap();
        // 10 > 4 * 2.0 holds for B, 10 > 6 * 2.0 fails for C
        assert_eq!(smiles_of(&split.competitive), vec!["B"]);
        assert_eq!(smiles_of(&split.non_competitive), vec!["C"]);
        let labels = result.allosteric.string_column(COMPETITIVE, "test").unwrap();
        assert_eq!(labels.value(1), "CK1a_common_non_competitive_to_inh");

        let positive = result.positive().unwrap().unwrap();
        assert_eq!(smiles_of(&positive), vec!["B"]);
    }

    #[test]
    fn test_competitive_boundary_is_strict() {
        let base = side(&[("B", "1", 10.0)], "A Effect Size");
        let inhibited = side(&[("B", "1", 5.0)], "A-inh Effect Size");
        let pair = effect_pair().with_competitive_measure(2.0);
        let result = stratify(&base, &inhibited, &keys(), &pair).unwrap();
        assert_eq!(result.competitive.unwrap().competitive.num_rows(), 0);
    }

    #[test]
    fn test_no_measure_no_split() {
        let base = side(&[("B", "1", 10.0)], "A Effect Size");
        let inhibited = side(&[("B", "1", 4.0)], "A-inh Effect Size");
        let result = stratify(&base, &inhibited, &keys(), &effect_pair()).unwrap();
        assert!(result.competitive.is_none());
        assert!(result.positive().unwrap().is_none());
        assert!(!result.allosteric.has_column(COMPETITIVE));
    }

    #[test]
    fn test_enrichment_merge_means() {
        let pair = ConditionPair::new("CK1d", Layout::Enrichment, "CK1d", "CK1d_inh");
        let table = |er: f64, lb: f64| {
            RecordBatch::try_from_iter(vec![
                ("SMILES", Arc::new(StringArray::from(vec!["B"])) as ArrayRef),
                ("CK1d_er", Arc::new(Float64Array::from(vec![er]))),
                ("CK1d_er_lb", Arc::new(Float64Array::from(vec![lb]))),
                ("CK1d_inh_er", Arc::new(Float64Array::from(vec![er + 2.0]))),
                ("CK1d_inh_er_lb", Arc::new(Float64Array::from(vec![lb + 2.0]))),
            ])
            .unwrap()
        };
        let base = table(2.0, 1.0);
        let keys = vec!["SMILES".to_string(), "CK1d_er".to_string()];
        let result = stratify(&base, &base, &keys, &pair).unwrap();

        let er = result.allosteric.f64_column("CK1d_er_merge", "test").unwrap();
        let lb = result.allosteric.f64_column("CK1d_er_lb_merge", "test").unwrap();
        assert!((er.value(0) - 3.0).abs() < f64::EPSILON);
        assert!((lb.value(0) - 2.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_long_format_joins_on_smiles_with_unit_coefficient() {
        let long_side = |rows: &[(&str, &str, f64)], sample: &str| {
            let metric = format!("ZScore_{sample}");
            RecordBatch::try_from_iter(vec![
                ("CompoundIndex", Arc::new(StringArray::from(rows.iter().map(|r| r.1).collect::<Vec<_>>())) as ArrayRef),
                ("SMILES", Arc::new(StringArray::from(rows.iter().map(|r| r.0).collect::<Vec<_>>()))),
                ("Sample", Arc::new(StringArray::from(vec![sample; rows.len()]))),
                (
                    metric.as_str(),
                    Arc::new(Float64Array::from(rows.iter().map(|r| r.2).collect::<Vec<_>>())),
                ),
            ])
            .unwrap()
        };
        // the same structure may carry different indices and sample labels per side
        let base = long_side(&[("A", "1", 5.0), ("B", "2", 5.0), ("C", "3", 3.0)], "Sigma-A");
        let inhibited = long_side(&[("B", "20", 4.0), ("C", "30", 3.0), ("D", "4", 1.0)], "Sigma-A-inh");
        let pair = ConditionPair::new("CK1a", Layout::LongFormat, "Sigma-A", "Sigma-A-inh");

        let result = stratify(&base, &inhibited, &["SMILES".to_string()], &pair).unwrap();
        assert_eq!(smiles_of(&result.allosteric), vec!["B", "C"]);
        assert_eq!(result.unmatched_shared, 0);

        let split = result.competitive.as_ref().unwrap();
        assert_eq!(smiles_of(&split.competitive), vec!["B"]);
        assert_eq!(smiles_of(&split.non_competitive), vec!["C"]);
        let merged = result.allosteric.f64_column("CK1a_ZScore_merge", "test").unwrap();
        assert!((merged.value(0) - 4.5).abs() < f64::EPSILON);
        assert_eq!(smiles_of(&result.positive().unwrap().unwrap()), vec!["A", "B"]);
    }

    #[test]
    fn test_missing_join_key_is_an_error() {
        let base = side(&[("B", "1", 1.0)], "A Effect Size");
        let keys = vec!["SMILES".to_string(), "CompoundIndex".to_string()];
        let err = stratify(&base, &base, &keys, &effect_pair()).unwrap_err();
        assert!(matches!(err, Error::ColumnNotFound { .. }));
    }
}
