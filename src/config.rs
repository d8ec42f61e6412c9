//! Pipeline configuration (YAML)
//!
//! ```yaml
//! data_path: ./data
//! output_path: ./output
//! sublibrary: [1, 2, 3]
//! sample_to_exp_condition: {1: blank, 2: blank, 3: CK1a, 4: CK1a}
//! experimental_condition: [CK1a, CK1a_inh]
//! positive_threshold: 3
//! blank_threshold: 1
//! competitive_measure_CK1a: 2.0
//! ```
//!
//! Condition pairs are derived from `experimental_condition` (`X` pairs with
//! `X_inh`) unless `condition_pairs` lists them explicitly.

use crate::condition::{ConditionPair, Layout};
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

const COMPETITIVE_MEASURE_PREFIX: &str = "competitive_measure_";

/// Suffix appended to a condition name for its inhibitor-treated counterpart
pub const INHIBITED_SUFFIX: &str = "_inh";

/// Explicit condition pair entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConditionPairConfig {
    /// Short code (e.g. `CK1a`)
    pub code: String,
    /// Column layout
    #[serde(default = "default_layout")]
    pub layout: Layout,
    /// Target condition name / column label
    pub base: String,
    /// Target + inhibitor condition name / column label
    pub inhibited: String,
}

/// Fingerprint stage parameters
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FingerprintConfig {
    /// Neighborhood radius in bonds
    #[serde(default = "default_radius")]
    pub radius: u32,
    /// Fingerprint length in bits (multiple of 8)
    #[serde(default = "default_n_bits", alias = "nBits")]
    pub n_bits: usize,
    /// Include tetrahedral chirality in atom invariants
    #[serde(default, alias = "useChirality")]
    pub use_chirality: bool,
    /// Structures handed to the pool per batch
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
    /// Worker threads; defaults to available parallelism
    #[serde(default)]
    pub num_processes: Option<usize>,
}

impl Default for FingerprintConfig {
    fn default() -> Self {
        Self {
            radius: default_radius(),
            n_bits: default_n_bits(),
            use_chirality: false,
            chunk_size: default_chunk_size(),
            num_processes: None,
        }
    }
}

impl FingerprintConfig {
    /// Worker threads: `num_processes`, else available parallelism
    #[must_use]
    pub fn workers(&self) -> usize {
        self.num_processes.unwrap_or_else(|| {
            std::thread::available_parallelism().map_or(1, std::num::NonZeroUsize::get)
        })
    }
}

/// Raw document shape; competitive measures are collected separately
#[derive(Debug, Deserialize)]
struct RawConfig {
    data_path: PathBuf,
    output_path: PathBuf,
    #[serde(default)]
    sublibrary: Vec<serde_yaml::Value>,
    #[serde(default)]
    sample_to_exp_condition: BTreeMap<u32, String>,
    #[serde(default)]
    experimental_condition: Vec<String>,
    #[serde(default = "default_blank_condition")]
    blank_condition: String,
    #[serde(default)]
    positive_threshold: Option<f64>,
    #[serde(default)]
    blank_threshold: Option<f64>,
    #[serde(default)]
    count_threshold: Option<f64>,
    #[serde(default)]
    blank_effect_size_threshold: Option<f64>,
    #[serde(default)]
    condition_pairs: Vec<ConditionPairConfig>,
    #[serde(default)]
    enrichment_table: Option<PathBuf>,
    #[serde(default = "default_sample_file_template")]
    sample_file_template: String,
    #[serde(default)]
    strict_alignment: bool,
    #[serde(default)]
    fingerprint: FingerprintConfig,
}

/// Validated pipeline configuration
#[derive(Debug, Clone, PartialEq)]
pub struct PipelineConfig {
    /// Root of raw inputs
    pub data_path: PathBuf,
    /// Root of all artifacts
    pub output_path: PathBuf,
    /// Sublibrary ids, rendered as they appear in file names
    pub sublibrary: Vec<String>,
    /// Sample number to condition name
    pub sample_to_exp_condition: BTreeMap<u32, String>,
    /// Conditions merged into the wide table (blank excluded)
    pub experimental_condition: Vec<String>,
    /// Name of the no-target control condition
    pub blank_condition: String,
    /// Replicate-count threshold (enrichment layout)
    pub positive_threshold: Option<f64>,
    /// Blank replicate threshold (enrichment layout)
    pub blank_threshold: Option<f64>,
    /// Count threshold (effect-size layout)
    pub count_threshold: Option<f64>,
    /// Blank effect-size threshold (effect-size layout)
    pub blank_effect_size_threshold: Option<f64>,
    /// `competitive_measure_<code>` entries keyed by code
    pub competitive_measures: BTreeMap<String, f64>,
    /// Explicit pairs; empty means derive from `experimental_condition`
    pub condition_pairs: Vec<ConditionPairConfig>,
    /// Pre-merged screen table (effect-size or long format); skips the
    /// preprocess stage when set
    pub enrichment_table: Option<PathBuf>,
    /// Sample file name under `<data_path>/samples`, with `{sample}` and
    /// `{lib}` placeholders
    pub sample_file_template: String,
    /// Fail instead of warn when key joins leave rows unmatched
    pub strict_alignment: bool,
    /// Fingerprint parameters
    pub fingerprint: FingerprintConfig,
}

impl PipelineConfig {
    /// Load and validate a YAML config file
    ///
    /// # Errors
    /// Returns error if the file is missing, malformed, or fails validation
    pub fn from_path<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|e| {
            Error::Config(format!("Failed to read config {}: {e}", path.display()))
        })?;
        Self::from_yaml(&text)
    }

    /// Parse and validate a YAML document
    ///
    /// # Errors
    /// Returns error if the document is malformed or fails validation
    pub fn from_yaml(text: &str) -> Result<Self> {
        let document: serde_yaml::Value = serde_yaml::from_str(text)?;
        let competitive_measures = collect_competitive_measures(&document)?;
        let raw: RawConfig = serde_yaml::from_value(document)?;

        let sublibrary = raw
            .sublibrary
            .iter()
            .map(render_id)
            .collect::<Result<Vec<_>>>()?;

        let config = Self {
            data_path: raw.data_path,
            output_path: raw.output_path,
            sublibrary,
            sample_to_exp_condition: raw.sample_to_exp_condition,
            experimental_condition: raw.experimental_condition,
            blank_condition: raw.blank_condition,
            positive_threshold: raw.positive_threshold,
            blank_threshold: raw.blank_threshold,
            count_threshold: raw.count_threshold,
            blank_effect_size_threshold: raw.blank_effect_size_threshold,
            competitive_measures,
            condition_pairs: raw.condition_pairs,
            enrichment_table: raw.enrichment_table,
            sample_file_template: raw.sample_file_template,
            strict_alignment: raw.strict_alignment,
            fingerprint: raw.fingerprint,
        };
        config.validate()?;
        Ok(config)
    }

    /// Check cross-field constraints
    ///
    /// # Errors
    /// Returns [`Error::Config`] describing the first violation
    pub fn validate(&self) -> Result<()> {
        let thresholds = [
            ("positive_threshold", self.positive_threshold),
            ("blank_threshold", self.blank_threshold),
            ("count_threshold", self.count_threshold),
            ("blank_effect_size_threshold", self.blank_effect_size_threshold),
        ];
        for (name, value) in thresholds {
            if let Some(v) = value {
                if !v.is_finite() {
                    return Err(Error::Config(format!("{name} must be finite, got {v}")));
                }
            }
        }
        for (code, v) in &self.competitive_measures {
            if !v.is_finite() {
                return Err(Error::Config(format!(
                    "{COMPETITIVE_MEASURE_PREFIX}{code} must be finite, got {v}"
                )));
            }
        }

        if self.layout() == Layout::LongFormat && self.enrichment_table.is_none() {
            return Err(Error::Config(
                "long_format condition pairs read enrichment_table; set it to the screen results file".into(),
            ));
        }

        if self.enrichment_table.is_none() {
            if self.sublibrary.is_empty() {
                return Err(Error::Config("sublibrary must list at least one library".into()));
            }
            if self.sample_to_exp_condition.is_empty() {
                return Err(Error::Config("sample_to_exp_condition is empty".into()));
            }
        }

        if !self.sample_file_template.contains("{sample}") {
            return Err(Error::Config(
                "sample_file_template must contain a {sample} placeholder".into(),
            ));
        }

        if let Some(first) = self.condition_pairs.first() {
            if let Some(other) = self.condition_pairs.iter().find(|p| p.layout != first.layout) {
                return Err(Error::Config(format!(
                    "condition pairs {} and {} use different layouts; one screen table has one layout",
                    first.code, other.code
                )));
            }
        }

        let fp = &self.fingerprint;
        if fp.n_bits == 0 || fp.n_bits % 8 != 0 {
            return Err(Error::Config(format!(
                "fingerprint.n_bits must be a positive multiple of 8, got {}",
                fp.n_bits
            )));
        }
        if fp.chunk_size == 0 {
            return Err(Error::Config("fingerprint.chunk_size must be positive".into()));
        }
        if fp.num_processes == Some(0) {
            return Err(Error::Config("fingerprint.num_processes must be positive".into()));
        }
        Ok(())
    }

    /// Condition pairs with their competitive measures attached
    ///
    /// Explicit `condition_pairs` win; otherwise every condition `X` with an
    /// `X_inh` counterpart in `experimental_condition` becomes an
    /// enrichment-layout pair coded `X`.
    #[must_use]
    pub fn condition_pairs(&self) -> Vec<ConditionPair> {
        let pairs: Vec<ConditionPair> = if self.condition_pairs.is_empty() {
            self.experimental_condition
                .iter()
                .filter(|c| !c.ends_with(INHIBITED_SUFFIX))
                .filter_map(|base| {
                    let inhibited = format!("{base}{INHIBITED_SUFFIX}");
                    self.experimental_condition
                        .contains(&inhibited)
                        .then(|| ConditionPair::new(base, Layout::Enrichment, base, &inhibited))
                })
                .collect()
        } else {
            self.condition_pairs
                .iter()
                .map(|p| ConditionPair::new(&p.code, p.layout, &p.base, &p.inhibited))
                .collect()
        };

        pairs
            .into_iter()
            .map(|pair| match self.competitive_measures.get(&pair.code) {
                Some(&coefficient) => pair.with_competitive_measure(coefficient),
                None => pair,
            })
            .collect()
    }

    /// Layout of the screen table the pairs read
    #[must_use]
    pub fn layout(&self) -> Layout {
        self.condition_pairs
            .first()
            .map_or(Layout::Enrichment, |p| p.layout)
    }

    /// Thresholds for a layout as `(count_threshold, blank_threshold)`
    ///
    /// # Errors
    /// Returns [`Error::Config`] if the layout's thresholds are not configured,
    /// or the layout takes none
    pub fn thresholds(&self, layout: Layout) -> Result<(f64, f64)> {
        let (count, blank, names) = match layout {
            Layout::Enrichment => (
                self.positive_threshold,
                self.blank_threshold,
                ("positive_threshold", "blank_threshold"),
            ),
            Layout::EffectSize => (
                self.count_threshold,
                self.blank_effect_size_threshold,
                ("count_threshold", "blank_effect_size_threshold"),
            ),
            Layout::LongFormat => {
                return Err(Error::Config(
                    "long_format screens are not threshold-filtered".into(),
                ))
            }
        };
        let count = count.ok_or_else(|| Error::Config(format!("{} is required", names.0)))?;
        let blank = blank.ok_or_else(|| Error::Config(format!("{} is required", names.1)))?;
        Ok((count, blank))
    }

    /// Sample file name for one sample and sublibrary
    #[must_use]
    pub fn sample_file_name(&self, sample: u32, lib: &str) -> String {
        self.sample_file_template
            .replace("{sample}", &sample.to_string())
            .replace("{lib}", lib)
    }

    /// `<output_path>/preprocessed`
    #[must_use]
    pub fn preprocessed_dir(&self) -> PathBuf {
        self.output_path.join("preprocessed")
    }

    /// `<output_path>/stratified`
    #[must_use]
    pub fn stratified_dir(&self) -> PathBuf {
        self.output_path.join("stratified")
    }

    /// `<output_path>/lib_stat`
    #[must_use]
    pub fn lib_stat_dir(&self) -> PathBuf {
        self.output_path.join("lib_stat")
    }

    /// `<output_path>/features`
    #[must_use]
    pub fn features_dir(&self) -> PathBuf {
        self.output_path.join("features")
    }
}

fn collect_competitive_measures(document: &serde_yaml::Value) -> Result<BTreeMap<String, f64>> {
    let mut measures = BTreeMap::new();
    let Some(mapping) = document.as_mapping() else {
        return Err(Error::Config("config document must be a mapping".into()));
    };
    for (key, value) in mapping {
        let Some(code) = key.as_str().and_then(|k| k.strip_prefix(COMPETITIVE_MEASURE_PREFIX))
        else {
            continue;
        };
        let coefficient = value.as_f64().ok_or_else(|| {
            Error::Config(format!("{COMPETITIVE_MEASURE_PREFIX}{code} must be a number"))
        })?;
        measures.insert(code.to_string(), coefficient);
    }
    Ok(measures)
}

fn render_id(value: &serde_yaml::Value) -> Result<String> {
    match value {
        serde_yaml::Value::Number(n) => Ok(n.to_string()),
        serde_yaml::Value::String(s) => Ok(s.clone()),
        other => Err(Error::Config(format!(
            "sublibrary ids must be numbers or strings, got {other:?}"
        ))),
    }
}

fn default_layout() -> Layout {
    Layout::Enrichment
}

fn default_blank_condition() -> String {
    "blank".to_string()
}

fn default_sample_file_template() -> String {
    "run038_samp000{sample}_lib{lib}.csv".to_string()
}

const fn default_radius() -> u32 {
    2
}

const fn default_n_bits() -> usize {
    2048
}

const fn default_chunk_size() -> usize {
    10_000
}
