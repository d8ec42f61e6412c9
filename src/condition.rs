//! Experimental conditions and their column naming
//!
//! A [`ConditionPair`] ties a target condition to its inhibitor-treated
//! counterpart and carries every column name the filter and stratifier read,
//! so adding a condition is a config change only.
//!
//! Three table layouts are supported:
//!
//! ```text
//! Enrichment  <cond>_hit_counts_0, <cond>_hit_counts_1, <cond>_er, <cond>_er_lb
//!             blank_hit_counts_0, blank_hit_counts_1
//! EffectSize  "<label> counts", "<label> Effect Size"
//!             "blank counts", "blank Effect Size"
//! LongFormat  CompoundIndex, SMILES, Sample, ZScore   (one row per compound and sample)
//! ```

use serde::{Deserialize, Serialize};

/// Structure column
pub const SMILES: &str = "SMILES";
/// Synthesized compound identifier column
pub const COMPOUND_INDEX: &str = "CompoundIndex";
/// Unpadded `lib_id.cycle1.cycle2.cycle3` column of per-condition tables
pub const COMPOUND_INDEX_RAW: &str = "CompoundIndex_raw";
/// Sublibrary name column used by reporting
pub const LIBRARY_NAME: &str = "library.name";
/// Stratification label column
pub const CUSTOM_LABEL: &str = "customlabel";
/// Competitive split column
pub const COMPETITIVE: &str = "competitive";
/// Blank replicate count columns
pub const BLANK_HIT_COUNTS: [&str; 2] = ["blank_hit_counts_0", "blank_hit_counts_1"];
/// Sample label column (long-format layout)
pub const SAMPLE_LABEL: &str = "Sample";
/// Score column (long-format layout)
pub const ZSCORE: &str = "ZScore";
/// Blank effect size column (effect-size layout)
pub const BLANK_EFFECT_SIZE: &str = "blank Effect Size";
/// Blank count column (effect-size layout)
pub const BLANK_COUNTS: &str = "blank counts";

/// Per-condition columns produced by the merge engine, before prefixing
pub const CONDITION_SUFFIXES: [&str; 5] = ["er", "er_ub", "er_lb", "hit_counts_0", "hit_counts_1"];

/// Column layout of a wide screening table
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Layout {
    /// Replicate hit counts plus enrichment ratio with confidence bounds
    Enrichment,
    /// Single count column plus effect size, blank judged by effect size
    EffectSize,
    /// One score per compound and sample; rows picked by `Sample`, no threshold
    LongFormat,
}

impl Layout {
    /// Whether hits are picked by count and blank thresholds
    #[must_use]
    pub const fn is_thresholded(self) -> bool {
        !matches!(self, Self::LongFormat)
    }

    /// Competitive coefficient used when the config names none
    #[must_use]
    pub const fn default_competitive_measure(self) -> Option<f64> {
        match self {
            Self::LongFormat => Some(1.0),
            Self::Enrichment | Self::EffectSize => None,
        }
    }
}

/// Column names for one condition
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConditionColumns {
    /// Condition name as it appears in column names
    pub name: String,
    /// Hit count columns (one or two replicates)
    pub counts: Vec<String>,
    /// Enrichment / effect-size point estimate
    pub metric: String,
    /// Lower confidence bound of the metric, when the layout has one
    pub metric_lb: Option<String>,
}

impl ConditionColumns {
    /// Columns for `<name>_hit_counts_{0,1}`, `<name>_er`, `<name>_er_lb`
    #[must_use]
    pub fn enrichment(name: &str) -> Self {
        Self {
            name: name.to_string(),
            counts: vec![format!("{name}_hit_counts_0"), format!("{name}_hit_counts_1")],
            metric: format!("{name}_er"),
            metric_lb: Some(format!("{name}_er_lb")),
        }
    }

    /// Columns for `"<label> counts"` and `"<label> Effect Size"`
    #[must_use]
    pub fn effect_size(label: &str) -> Self {
        Self {
            name: label.to_string(),
            counts: vec![format!("{label} counts")],
            metric: format!("{label} Effect Size"),
            metric_lb: None,
        }
    }

    /// Rows with `Sample == label`; the score becomes `ZScore_<label>`
    #[must_use]
    pub fn long_format(label: &str) -> Self {
        Self {
            name: label.to_string(),
            counts: Vec::new(),
            metric: format!("{ZSCORE}_{label}"),
            metric_lb: None,
        }
    }

    /// Build columns for the given layout
    #[must_use]
    pub fn for_layout(layout: Layout, name: &str) -> Self {
        match layout {
            Layout::Enrichment => Self::enrichment(name),
            Layout::EffectSize => Self::effect_size(name),
            Layout::LongFormat => Self::long_format(name),
        }
    }
}

/// A target condition and its inhibitor-treated counterpart
#[derive(Debug, Clone, PartialEq)]
pub struct ConditionPair {
    /// Short code used in artifact names and merge columns (e.g. `CK1a`)
    pub code: String,
    /// Table layout the columns belong to
    pub layout: Layout,
    /// Target condition columns
    pub base: ConditionColumns,
    /// Target + inhibitor columns
    pub inhibited: ConditionColumns,
    /// Coefficient for the competitive split; `None` disables the split
    pub competitive_measure: Option<f64>,
}

impl ConditionPair {
    /// Pair two conditions of the same layout
    #[must_use]
    pub fn new(code: &str, layout: Layout, base: &str, inhibited: &str) -> Self {
        Self {
            code: code.to_string(),
            layout,
            base: ConditionColumns::for_layout(layout, base),
            inhibited: ConditionColumns::for_layout(layout, inhibited),
            competitive_measure: layout.default_competitive_measure(),
        }
    }

    /// Set the competitive-measure coefficient
    #[must_use]
    pub fn with_competitive_measure(mut self, coefficient: f64) -> Self {
        self.competitive_measure = Some(coefficient);
        self
    }

    /// Allosteric merge columns: `(<code>_er_merge, <code>_er_lb_merge)`, or
    /// `(<code>_ZScore_merge, None)` for long-format screens
    ///
    /// The effect-size layout records no merged estimate.
    #[must_use]
    pub fn merge_columns(&self) -> Option<(String, Option<String>)> {
        match self.layout {
            Layout::Enrichment => Some((
                format!("{}_er_merge", self.code),
                self.base.metric_lb.as_ref().map(|_| format!("{}_er_lb_merge", self.code)),
            )),
            Layout::LongFormat => Some((format!("{}_{ZSCORE}_merge", self.code), None)),
            Layout::EffectSize => None,
        }
    }

    /// Competitive split label for this pair
    #[must_use]
    pub fn competition_label(&self, competitive: bool) -> String {
        if competitive {
            format!("{}_common_competitive_to_inh", self.code)
        } else {
            format!("{}_common_non_competitive_to_inh", self.code)
        }
    }
}

/// Columns kept by the filter and used as the Allosteric join tuple
///
/// Enrichment: per-condition counts and estimates, then
/// `CompoundIndex, SMILES, library.name`, then the blank replicates.
/// Effect size: `CompoundIndex, SMILES, library.name`, then effect sizes and
/// counts for every condition and the blank.
/// Long format: `CompoundIndex, SMILES, Sample`, then each condition's score.
#[must_use]
pub fn relevant_columns(layout: Layout, conditions: &[String]) -> Vec<String> {
    let meta = [COMPOUND_INDEX, SMILES, LIBRARY_NAME].map(str::to_string);
    match layout {
        Layout::Enrichment => {
            let mut columns: Vec<String> = conditions
                .iter()
                .flat_map(|c| {
                    ["hit_counts_0", "hit_counts_1", "er", "er_lb"]
                        .into_iter()
                        .map(move |sfx| format!("{c}_{sfx}"))
                })
                .collect();
            columns.extend(meta);
            columns.extend(BLANK_HIT_COUNTS.map(str::to_string));
            columns
        }
        Layout::EffectSize => {
            let labels: Vec<&str> = conditions
                .iter()
                .map(String::as_str)
                .chain(std::iter::once("blank"))
                .collect();
            let mut columns = meta.to_vec();
            columns.extend(labels.iter().map(|l| format!("{l} Effect Size")));
            columns.extend(labels.iter().map(|l| format!("{l} counts")));
            columns
        }
        Layout::LongFormat => {
            let mut columns = [COMPOUND_INDEX, SMILES, SAMPLE_LABEL].map(str::to_string).to_vec();
            columns.extend(conditions.iter().map(|c| format!("{ZSCORE}_{c}")));
            columns
        }
    }
}

/// Columns the Allosteric join compares
///
/// Long-format sides carry different score and sample columns, so they join
/// on `SMILES` alone; the other layouts join on every relevant column.
#[must_use]
pub fn join_columns(layout: Layout, conditions: &[String]) -> Vec<String> {
    match layout {
        Layout::LongFormat => vec![SMILES.to_string()],
        Layout::Enrichment | Layout::EffectSize => relevant_columns(layout, conditions),
    }
}

/// Labels of the conditions named by a set of pairs, base before inhibited
#[must_use]
pub fn pair_condition_names(pairs: &[ConditionPair]) -> Vec<String> {
    pairs
        .iter()
        .flat_map(|p| [p.base.name.clone(), p.inhibited.name.clone()])
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_enrichment_columns() {
        let cols = ConditionColumns::enrichment("CK1a_inh");
        assert_eq!(cols.counts, vec!["CK1a_inh_hit_counts_0", "CK1a_inh_hit_counts_1"]);
        assert_eq!(cols.metric, "CK1a_inh_er");
        assert_eq!(cols.metric_lb.as_deref(), Some("CK1a_inh_er_lb"));
    }

    #[test]
    fn test_effect_size_columns() {
        let cols = ConditionColumns::effect_size("A-inh");
        assert_eq!(cols.counts, vec!["A-inh counts"]);
        assert_eq!(cols.metric, "A-inh Effect Size");
        assert!(cols.metric_lb.is_none());
    }

    #[test]
    fn test_merge_columns_per_layout() {
        let pair = ConditionPair::new("CK1d", Layout::Enrichment, "CK1d", "CK1d_inh");
        let (er, lb) = pair.merge_columns().unwrap();
        assert_eq!(er, "CK1d_er_merge");
        assert_eq!(lb.as_deref(), Some("CK1d_er_lb_merge"));

        let pair = ConditionPair::new("CK1d", Layout::EffectSize, "D", "D-inh");
        assert!(pair.merge_columns().is_none());

        let pair = ConditionPair::new("CK1d", Layout::LongFormat, "Sigma-D", "Sigma-D-inh");
        assert_eq!(pair.merge_columns(), Some(("CK1d_ZScore_merge".to_string(), None)));
    }

    #[test]
    fn test_long_format_pair() {
        let pair = ConditionPair::new("CK1a", Layout::LongFormat, "Sigma-A", "Sigma-A-inh");
        assert_eq!(pair.base.metric, "ZScore_Sigma-A");
        assert_eq!(pair.inhibited.metric, "ZScore_Sigma-A-inh");
        assert!(pair.base.counts.is_empty());
        assert_eq!(pair.competitive_measure, Some(1.0));
        assert!(!Layout::LongFormat.is_thresholded());

        let pair = ConditionPair::new("CK1a", Layout::Enrichment, "CK1a", "CK1a_inh");
        assert_eq!(pair.competitive_measure, None);
    }

    #[test]
    fn test_join_columns() {
        let names = ["Sigma-A".to_string(), "Sigma-A-inh".to_string()];
        assert_eq!(join_columns(Layout::LongFormat, &names), vec!["SMILES"]);
        assert_eq!(
            relevant_columns(Layout::LongFormat, &names),
            vec!["CompoundIndex", "SMILES", "Sample", "ZScore_Sigma-A", "ZScore_Sigma-A-inh"]
        );
        let names = ["CK1a".to_string()];
        assert_eq!(join_columns(Layout::Enrichment, &names), relevant_columns(Layout::Enrichment, &names));
    }

    #[test]
    fn test_competition_label() {
        let pair = ConditionPair::new("CK1a", Layout::EffectSize, "A", "A-inh");
        assert_eq!(pair.competition_label(true), "CK1a_common_competitive_to_inh");
        assert_eq!(pair.competition_label(false), "CK1a_common_non_competitive_to_inh");
    }

    #[test]
    fn test_relevant_columns_enrichment_order() {
        let cols = relevant_columns(Layout::Enrichment, &["CK1a".to_string()]);
        assert_eq!(
            cols,
            vec![
                "CK1a_hit_counts_0",
                "CK1a_hit_counts_1",
                "CK1a_er",
                "CK1a_er_lb",
                "CompoundIndex",
                "SMILES",
                "library.name",
                "blank_hit_counts_0",
                "blank_hit_counts_1",
            ]
        );
    }

    #[test]
    fn test_relevant_columns_effect_size_includes_blank() {
        let cols = relevant_columns(Layout::EffectSize, &["A".to_string(), "A-inh".to_string()]);
        assert!(cols.contains(&"blank Effect Size".to_string()));
        assert!(cols.contains(&"A-inh counts".to_string()));
        assert_eq!(cols.len(), 3 + 3 + 3);
    }
}
