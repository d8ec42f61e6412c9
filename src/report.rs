//! Summary tables: value quantiles and per-sublibrary pass rates

use crate::condition::{
    ConditionColumns, Layout, BLANK_COUNTS, BLANK_EFFECT_SIZE, BLANK_HIT_COUNTS, LIBRARY_NAME, SMILES, ZSCORE,
};
use crate::filter::HitCountFilter;
use crate::storage::TableExt;
use crate::Result;
use arrow::array::{Array, ArrayRef, Float64Array, StringArray};
use arrow::compute;
use arrow::record_batch::RecordBatch;
use std::collections::BTreeMap;
use std::sync::Arc;

/// Quantile probabilities used for the `lib_stat` tables
pub const DEFAULT_QUANTILES: [f64; 8] = [0.0, 0.1, 0.25, 0.5, 0.75, 0.9, 0.99, 1.0];

/// Quantiles with linear interpolation between closest ranks
///
/// Nulls and NaNs are ignored; with no values left every quantile is `None`.
#[must_use]
#[allow(clippy::cast_precision_loss, clippy::cast_possible_truncation, clippy::cast_sign_loss)]
pub fn quantiles(values: &Float64Array, probs: &[f64]) -> Vec<Option<f64>> {
    let mut sorted: Vec<f64> = values.iter().flatten().filter(|v| !v.is_nan()).collect();
    if sorted.is_empty() {
        return vec![None; probs.len()];
    }
    sorted.sort_by(f64::total_cmp);

    probs
        .iter()
        .map(|&p| {
            let rank = (sorted.len() - 1) as f64 * p.clamp(0.0, 1.0);
            let lower = rank.floor() as usize;
            let upper = (lower + 1).min(sorted.len() - 1);
            let weight = rank - rank.floor();
            Some(sorted[lower] + (sorted[upper] - sorted[lower]) * weight)
        })
        .collect()
}

/// One row per probability, one column per named series
///
/// # Errors
/// Returns error if the table cannot be assembled
pub fn quantile_table(series: &[(String, Float64Array)], probs: &[f64]) -> Result<RecordBatch> {
    let mut columns: Vec<(String, ArrayRef)> = vec![(
        "quantile".to_string(),
        Arc::new(Float64Array::from(probs.to_vec())),
    )];
    for (name, values) in series {
        let q: Float64Array = quantiles(values, probs).into_iter().collect();
        columns.push((name.clone(), Arc::new(q)));
    }
    Ok(RecordBatch::try_from_iter(columns)?)
}

/// Quantiles of a long-format screen's `ZScore` over every row
///
/// # Errors
/// Returns error if the score column is missing or not numeric
pub fn score_quantiles(table: &RecordBatch, probs: &[f64]) -> Result<RecordBatch> {
    let scores = table.f64_column(ZSCORE, "computing score quantiles")?;
    quantile_table(&[(ZSCORE.to_string(), scores)], probs)
}

/// Quantile tables for every condition of one layout
#[derive(Debug, Clone)]
pub struct QuantileReport {
    /// Counts of rows whose counts pass the count threshold (blank included)
    pub hit_counts: RecordBatch,
    /// Metric of the same rows, before the blank criterion
    pub metric_prefilter: RecordBatch,
    /// Metric of rows passing the full filter
    pub metric_postfilter: RecordBatch,
    /// Metric lower bound of rows passing the full filter, when the layout has one
    pub metric_lb_postfilter: Option<RecordBatch>,
}

/// Quantiles of counts and metrics per condition, before and after the blank
/// criterion
///
/// # Errors
/// Returns error if a condition or blank column is missing or not numeric
pub fn quantile_report(
    table: &RecordBatch,
    layout: Layout,
    conditions: &[ConditionColumns],
    count_threshold: f64,
    blank_threshold: f64,
    probs: &[f64],
) -> Result<QuantileReport> {
    let context = "computing quantiles";
    let mut hit_counts = Vec::new();
    let mut prefilter = Vec::new();
    let mut postfilter = Vec::new();
    let mut lb_postfilter = Vec::new();

    for condition in conditions {
        let filter = HitCountFilter::for_condition(layout, condition, count_threshold, blank_threshold);
        let counted = compute::filter_record_batch(table, &filter.count_mask(table)?)?;
        let passed = filter.apply(table)?.table;

        for column in &condition.counts {
            hit_counts.push((column.clone(), counted.f64_column(column, context)?));
        }
        prefilter.push((condition.metric.clone(), counted.f64_column(&condition.metric, context)?));
        postfilter.push((condition.metric.clone(), passed.f64_column(&condition.metric, context)?));
        if let Some(lb) = &condition.metric_lb {
            lb_postfilter.push((lb.clone(), passed.f64_column(lb, context)?));
        }
    }

    // blank signal over rows where the blank itself counts as a hit
    let (blank_counts, blank_metric): (Vec<&str>, Option<&str>) = match layout {
        Layout::Enrichment => (BLANK_HIT_COUNTS.to_vec(), None),
        Layout::EffectSize => (vec![BLANK_COUNTS], Some(BLANK_EFFECT_SIZE)),
        Layout::LongFormat => (Vec::new(), None),
    };
    let blank_filter = HitCountFilter::new(
        blank_counts.iter().map(|c| (*c).to_string()).collect(),
        count_threshold,
        blank_threshold,
    );
    let blank_rows = compute::filter_record_batch(table, &blank_filter.count_mask(table)?)?;
    for column in &blank_counts {
        hit_counts.push(((*column).to_string(), blank_rows.f64_column(column, context)?));
    }
    if let Some(metric) = blank_metric {
        prefilter.push((metric.to_string(), blank_rows.f64_column(metric, context)?));
    }

    Ok(QuantileReport {
        hit_counts: quantile_table(&hit_counts, probs)?,
        metric_prefilter: quantile_table(&prefilter, probs)?,
        metric_postfilter: quantile_table(&postfilter, probs)?,
        metric_lb_postfilter: if lb_postfilter.is_empty() {
            None
        } else {
            Some(quantile_table(&lb_postfilter, probs)?)
        },
    })
}

/// Non-null `SMILES` per `library.name`
///
/// # Errors
/// Returns error if either column is missing
pub fn library_counts(table: &RecordBatch) -> Result<BTreeMap<String, usize>> {
    let context = "counting compounds per sublibrary";
    let libraries = table.string_column(LIBRARY_NAME, context)?;
    let smiles = table.string_column(SMILES, context)?;

    let mut counts = BTreeMap::new();
    for i in 0..table.num_rows() {
        if libraries.is_valid(i) && smiles.is_valid(i) {
            *counts.entry(libraries.value(i).to_string()).or_insert(0) += 1;
        }
    }
    Ok(counts)
}

/// Share of a subset per sublibrary, against the full library counts
///
/// Columns: `library.name`, `fraction` (share of the subset),
/// `pass_filter_rate` (subset count / full count), `experiment_condition`.
/// Sublibraries missing from the subset report `0` for both.
///
/// # Errors
/// Returns error if the subset lacks `library.name` or `SMILES`
#[allow(clippy::cast_precision_loss)]
pub fn sublibrary_stats(
    subset: &RecordBatch,
    totals: &BTreeMap<String, usize>,
    label: &str,
) -> Result<RecordBatch> {
    let present = library_counts(subset)?;
    let rows = subset.num_rows();

    let mut fraction = Vec::with_capacity(totals.len());
    let mut pass_rate = Vec::with_capacity(totals.len());
    for (library, &total) in totals {
        match present.get(library) {
            Some(&count) if rows > 0 && total > 0 => {
                fraction.push(count as f64 / rows as f64);
                pass_rate.push(count as f64 / total as f64);
            }
            _ => {
                fraction.push(0.0);
                pass_rate.push(0.0);
            }
        }
    }

    Ok(RecordBatch::try_from_iter(vec![
        (
            LIBRARY_NAME,
            Arc::new(StringArray::from_iter_values(totals.keys())) as ArrayRef,
        ),
        ("fraction", Arc::new(Float64Array::from(fraction))),
        ("pass_filter_rate", Arc::new(Float64Array::from(pass_rate))),
        (
            "experiment_condition",
            Arc::new(StringArray::from(vec![label; totals.len()])),
        ),
    ])?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn close(a: Option<f64>, b: f64) -> bool {
        a.is_some_and(|a| (a - b).abs() < 1e-9)
    }

    #[test]
    fn test_quantiles_interpolate_linearly() {
        let values = Float64Array::from(vec![4.0, 1.0, 3.0, 2.0]);
        let q = quantiles(&values, &[0.0, 0.25, 0.5, 1.0]);
        assert!(close(q[0], 1.0));
        assert!(close(q[1], 1.75));
        assert!(close(q[2], 2.5));
        assert!(close(q[3], 4.0));
    }

    #[test]
    fn test_quantiles_skip_nulls_and_handle_empty() {
        let values = Float64Array::from(vec![None, Some(5.0), None]);
        assert!(close(quantiles(&values, &[0.9])[0], 5.0));

        let empty = Float64Array::from(Vec::<f64>::new());
        assert_eq!(quantiles(&empty, &DEFAULT_QUANTILES), vec![None; 8]);
    }

    #[test]
    fn test_quantile_table_layout() {
        let table = quantile_table(
            &[("CK1a_er".to_string(), Float64Array::from(vec![1.0, 3.0]))],
            &[0.0, 0.5],
        )
        .unwrap();
        assert_eq!(table.num_rows(), 2);
        assert_eq!(table.schema().field(0).name(), "quantile");
        let er = table.f64_column("CK1a_er", "test").unwrap();
        assert!((er.value(1) - 2.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_sublibrary_stats_fill_absent_with_zero() {
        let full = RecordBatch::try_from_iter(vec![
            ("SMILES", Arc::new(StringArray::from(vec!["A", "B", "C", "D"])) as ArrayRef),
            (LIBRARY_NAME, Arc::new(StringArray::from(vec!["1", "1", "1", "2"]))),
        ])
        .unwrap();
        let subset = full.slice(0, 2);
        let totals = library_counts(&full).unwrap();
        let stats = sublibrary_stats(&subset, &totals, "CK1a").unwrap();

        assert_eq!(stats.num_rows(), 2);
        let fraction = stats.f64_column("fraction", "test").unwrap();
        let rate = stats.f64_column("pass_filter_rate", "test").unwrap();
        assert!((fraction.value(0) - 1.0).abs() < f64::EPSILON);
        assert!((rate.value(0) - 2.0 / 3.0).abs() < 1e-12);
        assert!(fraction.value(1).abs() < f64::EPSILON);
        assert!(rate.value(1).abs() < f64::EPSILON);
    }

    #[test]
    fn test_quantile_report_effect_size() {
        let table = RecordBatch::try_from_iter(vec![
            ("A counts", Arc::new(Float64Array::from(vec![10.0, 10.0, 1.0])) as ArrayRef),
            ("A Effect Size", Arc::new(Float64Array::from(vec![2.0, 4.0, 9.0]))),
            ("blank counts", Arc::new(Float64Array::from(vec![0.0, 8.0, 8.0]))),
            ("blank Effect Size", Arc::new(Float64Array::from(vec![0.1, 5.0, 5.0]))),
        ])
        .unwrap();
        let report = quantile_report(
            &table,
            Layout::EffectSize,
            &[ConditionColumns::effect_size("A")],
            3.0,
            1.0,
            &[0.0, 1.0],
        )
        .unwrap();

        let pre = report.metric_prefilter.f64_column("A Effect Size", "t").unwrap();
        assert!((pre.value(1) - 4.0).abs() < f64::EPSILON);
        let post = report.metric_postfilter.f64_column("A Effect Size", "t").unwrap();
        assert!((post.value(1) - 2.0).abs() < f64::EPSILON);
        assert!(report.metric_prefilter.has_column("blank Effect Size"));
        assert!(report.metric_lb_postfilter.is_none());
    }

    #[test]
    fn test_score_quantiles() {
        let table = RecordBatch::try_from_iter(vec![(
            "ZScore",
            Arc::new(Float64Array::from(vec![1.0, 5.0, 3.0])) as ArrayRef,
        )])
        .unwrap();
        let q = score_quantiles(&table, &[0.0, 0.5, 1.0]).unwrap();
        let scores = q.f64_column("ZScore", "t").unwrap();
        assert!((scores.value(1) - 3.0).abs() < f64::EPSILON);
        assert!((scores.value(2) - 5.0).abs() < f64::EPSILON);
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(100))]

        /// Quantiles stay within the data range and never decrease
        #[test]
        fn prop_quantiles_bounded_and_monotone(values in proptest::collection::vec(-1e6f64..1e6, 1..60)) {
            let min = values.iter().copied().fold(f64::INFINITY, f64::min);
            let max = values.iter().copied().fold(f64::NEG_INFINITY, f64::max);
            let q: Vec<f64> = quantiles(&Float64Array::from(values), &DEFAULT_QUANTILES)
                .into_iter()
                .flatten()
                .collect();
            prop_assert_eq!(q.len(), DEFAULT_QUANTILES.len());
            for pair in q.windows(2) {
                prop_assert!(pair[0] <= pair[1] + 1e-9);
            }
            prop_assert!(q[0] >= min - 1e-9 && q[q.len() - 1] <= max + 1e-9);
        }
    }
}
