//! Stage orchestration
//!
//! ```text
//! preprocess   libraries + samples + enrichment  -> preprocessed/
//! stratify     preprocessed.csv | enrichment_table -> stratified/
//! stats        screen table + stratified labels  -> lib_stat/
//! fingerprint  any table with a SMILES column    -> features/
//! ```
//!
//! Stages read only artifacts written by earlier stages, so each can be
//! re-run on its own. Every stage lands in the [`RunManifest`] with its
//! status, artifacts and metrics; [`Pipeline::finish`] writes the manifest
//! even when a stage failed.

use crate::condition::{
    join_columns, pair_condition_names, relevant_columns, ConditionColumns, ConditionPair, Layout, COMPOUND_INDEX,
    SMILES,
};
use crate::config::PipelineConfig;
use crate::filter::{self, HitCountFilter};
use crate::fingerprint::store::{self, FeaturePaths};
use crate::fingerprint::{self, FingerprintParams};
use crate::loader;
use crate::manifest::{ArtifactRecord, RunManifest, RunStatus, StageRecord, MANIFEST_FILE};
use crate::merge::{self, ConditionInputs};
use crate::report::{self, DEFAULT_QUANTILES};
use crate::storage::{self, TableExt};
use crate::stratify::{self, Stratum, StratumCounts};
use crate::{Error, Result};
use arrow::record_batch::RecordBatch;
use rustc_hash::FxHashSet;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// Stage names as recorded in the manifest
pub const PREPROCESS: &str = "preprocess";
/// Stratify stage
pub const STRATIFY: &str = "stratify";
/// Stats stage
pub const STATS: &str = "stats";
/// Fingerprint stage
pub const FINGERPRINT: &str = "fingerprint";

/// Wide table written by the preprocess stage
pub const PREPROCESSED_FILE: &str = "preprocessed.csv";

/// Column renames applied to a pre-merged effect-size table
const ENRICHMENT_RENAMES: [(&str, &str); 2] = [("product_smiles", SMILES), ("mol.id", COMPOUND_INDEX)];

/// What to fingerprint and where to put it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FingerprintRequest {
    /// CSV table holding the structures
    pub input: PathBuf,
    /// Structure column
    pub smiles_column: String,
    /// Name of the feature files
    pub experiment: String,
    /// Target directory; `<output_path>/features` when unset
    pub output_dir: Option<PathBuf>,
}

impl FingerprintRequest {
    /// Fingerprint the `SMILES` column of `input` into the default directory
    #[must_use]
    pub fn new(input: impl Into<PathBuf>, experiment: impl Into<String>) -> Self {
        Self {
            input: input.into(),
            smiles_column: SMILES.to_string(),
            experiment: experiment.into(),
            output_dir: None,
        }
    }
}

/// One pipeline invocation over one config
#[derive(Debug)]
pub struct Pipeline {
    config: PipelineConfig,
    manifest: RunManifest,
}

impl Pipeline {
    /// Start a run
    #[must_use]
    pub fn new(config: PipelineConfig) -> Self {
        let mut manifest = RunManifest::new(RunManifest::timestamp_id());
        manifest.start();
        tracing::info!(run_id = manifest.run_id(), output = %config.output_path.display(), "run started");
        Self { config, manifest }
    }

    /// Configuration in use
    #[must_use]
    pub const fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Manifest so far
    #[must_use]
    pub const fn manifest(&self) -> &RunManifest {
        &self.manifest
    }

    /// `<output_path>/manifest.json`
    #[must_use]
    pub fn manifest_path(&self) -> PathBuf {
        self.config.output_path.join(MANIFEST_FILE)
    }

    /// Load, merge and pivot the raw inputs; returns the wide table
    ///
    /// # Errors
    /// Returns error if an input is missing, tables fail to align, or
    /// `enrichment_table` is set (nothing to merge)
    pub fn preprocess(&mut self) -> Result<RecordBatch> {
        self.stage(PREPROCESS, preprocess)
    }

    /// Filter and stratify every condition pair; returns counts per pair code
    ///
    /// # Errors
    /// Returns error if no pairs are configured, thresholds are missing, or
    /// the screen table lacks a required column
    pub fn stratify(&mut self) -> Result<BTreeMap<String, StratumCounts>> {
        self.stage(STRATIFY, stratify_pairs)
    }

    /// Quantile and sublibrary tables; score quantiles only for long-format
    /// screens
    ///
    /// # Errors
    /// Returns error if the screen table or a stratified artifact is missing
    pub fn stats(&mut self) -> Result<()> {
        self.stage(STATS, write_stats)
    }

    /// Fingerprint one table's structures into the feature store
    ///
    /// # Errors
    /// Returns error if the input is unreadable or the store cannot be written;
    /// unparsable structures are recorded, not fatal
    pub fn fingerprint(&mut self, request: &FingerprintRequest) -> Result<FeaturePaths> {
        self.stage(FINGERPRINT, |config, stage| fingerprint_table(config, stage, request))
    }

    /// Every stage in order, then fingerprints of each `<code>_positive.csv`
    ///
    /// Preprocess is skipped when `enrichment_table` is set.
    ///
    /// # Errors
    /// Returns the first stage error
    pub fn run(&mut self) -> Result<()> {
        if self.config.enrichment_table.is_some() {
            tracing::info!("enrichment_table set, skipping preprocess");
        } else {
            self.preprocess()?;
        }
        let counts = self.stratify()?;
        self.stats()?;

        let stratified = self.config.stratified_dir();
        for code in counts
            .iter()
            .filter(|(_, c)| c.competitive.is_some())
            .map(|(code, _)| code)
        {
            let request = FingerprintRequest::new(
                stratified.join(format!("{code}_positive.csv")),
                format!("{code}_positive"),
            );
            self.fingerprint(&request)?;
        }
        Ok(())
    }

    /// Close the run and write the manifest
    ///
    /// # Errors
    /// Returns error if the manifest cannot be written
    pub fn finish(mut self, status: RunStatus) -> Result<RunManifest> {
        self.manifest.complete(status);
        let path = self.manifest_path();
        self.manifest.write(&path)?;
        tracing::info!(run_id = self.manifest.run_id(), status = ?status, path = %path.display(), "run finished");
        Ok(self.manifest)
    }

    fn stage<T>(
        &mut self,
        name: &str,
        body: impl FnOnce(&PipelineConfig, &mut StageRecord) -> Result<T>,
    ) -> Result<T> {
        let mut record = StageRecord::new(name);
        record.start();
        tracing::info!(stage = name, "stage started");

        let result = body(&self.config, &mut record);
        match &result {
            Ok(_) => {
                record.complete(RunStatus::Success);
                tracing::info!(stage = name, artifacts = record.artifacts().len(), "stage finished");
            }
            Err(e) => {
                tracing::error!(stage = name, error = %e, "stage failed");
                record.fail(e.to_string());
            }
        }
        self.manifest.push_stage(record);
        result
    }
}

/// Screen table the stratify stage reads: `enrichment_table` if set, else
/// the preprocessed wide table
///
/// # Errors
/// Returns error if the table cannot be read
pub fn load_screen(config: &PipelineConfig) -> Result<RecordBatch> {
    match &config.enrichment_table {
        Some(path) => {
            let mut table = storage::read_csv(path)?;
            for (from, to) in ENRICHMENT_RENAMES {
                table = table.rename_column(from, to)?;
            }
            tracing::info!(path = %path.display(), rows = table.num_rows(), "loaded enrichment table");
            Ok(table)
        }
        None => storage::read_csv(config.preprocessed_dir().join(PREPROCESSED_FILE)),
    }
}

fn preprocess(config: &PipelineConfig, stage: &mut StageRecord) -> Result<RecordBatch> {
    if config.enrichment_table.is_some() {
        return Err(Error::Config(
            "enrichment_table is set; the preprocess stage has nothing to merge".into(),
        ));
    }
    let dir = config.preprocessed_dir();
    let strict = config.strict_alignment;

    let library = loader::load_library(config)?;
    write_table(config, stage, &dir.join("lib_dfs.csv"), &library)?;
    let samples = loader::load_samples(config)?;
    write_table(config, stage, &dir.join("all_sample.csv"), &samples)?;

    let mut merged = Vec::with_capacity(config.experimental_condition.len());
    for condition in &config.experimental_condition {
        let enrichment = loader::load_enrichment(config, condition)?;
        let runs = [
            loader::select_sample_rows(&samples, condition, 0)?,
            loader::select_sample_rows(&samples, condition, 1)?,
        ];
        let inputs = ConditionInputs {
            name: condition,
            library: &library,
            enrichment: &enrichment,
            counts: [&runs[0], &runs[1]],
        };
        let table = merge::merge_condition(inputs, strict)?;
        write_table(config, stage, &dir.join(format!("{condition}.csv")), &table)?;
        merged.push((condition.clone(), table));
    }

    let per_condition: Vec<RecordBatch> = merged.iter().map(|(_, t)| t.clone()).collect();
    write_table(
        config,
        stage,
        &dir.join("all_exp_cond.csv"),
        &storage::concat_tables(&per_condition)?,
    )?;

    let blank = [
        loader::select_sample_rows(&samples, &config.blank_condition, 0)?,
        loader::select_sample_rows(&samples, &config.blank_condition, 1)?,
    ];
    let wide = merge::pivot_conditions(&library, &merged, [&blank[0], &blank[1]], strict)?;
    write_table(config, stage, &dir.join(PREPROCESSED_FILE), &wide)?;

    #[allow(clippy::cast_precision_loss)]
    let compounds = wide.num_rows() as f64;
    stage.record_metric("compounds", compounds);
    Ok(wide)
}

fn stratify_pairs(config: &PipelineConfig, stage: &mut StageRecord) -> Result<BTreeMap<String, StratumCounts>> {
    let pairs = configured_pairs(config)?;
    let layout = config.layout();
    let thresholds = if layout.is_thresholded() {
        Some(config.thresholds(layout)?)
    } else {
        None
    };
    let table = load_screen(config)?;
    let names = condition_names(&pairs);
    let relevant = relevant_columns(layout, &names);
    let join = join_columns(layout, &names);
    let dir = config.stratified_dir();

    let mut counts = BTreeMap::new();
    for pair in &pairs {
        let base = screen_side(&table, layout, &pair.base, thresholds, &relevant, stage)?;
        let inhibited = screen_side(&table, layout, &pair.inhibited, thresholds, &relevant, stage)?;
        write_table(config, stage, &dir.join(format!("{}_filtered.csv", pair.code)), &base)?;
        write_table(config, stage, &dir.join(format!("{}_inh_filtered.csv", pair.code)), &inhibited)?;

        let strata = stratify::stratify(&base, &inhibited, &join, pair)?;
        write_table(
            config,
            stage,
            &dir.join(format!("{}_all_labels.csv", pair.code)),
            &strata.all_labels()?,
        )?;
        write_table(
            config,
            stage,
            &dir.join(format!("{}_orthosteric.csv", pair.code)),
            &strata.orthosteric,
        )?;
        if let Some(positive) = strata.positive()? {
            write_table(config, stage, &dir.join(format!("{}_positive.csv", pair.code)), &positive)?;
        }

        stage.record_strata(&pair.code, strata.counts());
        counts.insert(pair.code.clone(), strata.counts());
    }

    match thresholds {
        Some((count_threshold, blank_threshold)) => {
            let conditions = condition_columns(layout, &names);
            let negative = filter::negative_set(&table, layout, &conditions, count_threshold, blank_threshold)?
                .select_columns(&relevant, "projecting the negative set")?;
            write_table(config, stage, &dir.join("negative.csv"), &negative)?;
        }
        None => tracing::info!("long-format screen has no blank, negative set skipped"),
    }

    Ok(counts)
}

/// One side of a pair: threshold-filtered hits, or the condition's sample
/// rows when the layout takes no thresholds
fn screen_side(
    table: &RecordBatch,
    layout: Layout,
    columns: &ConditionColumns,
    thresholds: Option<(f64, f64)>,
    relevant: &[String],
    stage: &mut StageRecord,
) -> Result<RecordBatch> {
    let Some((count_threshold, blank_threshold)) = thresholds else {
        let side = filter::sample_side(table, columns)?;
        #[allow(clippy::cast_precision_loss)]
        let rows = side.num_rows() as f64;
        stage.record_metric(format!("{}.rows", columns.name), rows);
        return Ok(side);
    };
    let outcome = HitCountFilter::for_condition(layout, columns, count_threshold, blank_threshold).apply(table)?;
    stage.record_metric(format!("{}.pass_fraction", columns.name), outcome.pass_fraction);
    outcome
        .table
        .select_columns(relevant, &format!("projecting {} hits", columns.name))
}

fn write_stats(config: &PipelineConfig, stage: &mut StageRecord) -> Result<()> {
    let pairs = configured_pairs(config)?;
    let layout = config.layout();
    let table = load_screen(config)?;
    let all_dir = config.lib_stat_dir().join("all");
    if !layout.is_thresholded() {
        let scores = report::score_quantiles(&table, &DEFAULT_QUANTILES)?;
        return write_table(config, stage, &all_dir.join("zscore_quantiles.csv"), &scores);
    }
    let (count_threshold, blank_threshold) = config.thresholds(layout)?;
    let conditions = condition_columns(layout, &condition_names(&pairs));

    let quantiles = report::quantile_report(
        &table,
        layout,
        &conditions,
        count_threshold,
        blank_threshold,
        &DEFAULT_QUANTILES,
    )?;
    write_table(config, stage, &all_dir.join("hc_quantiles.csv"), &quantiles.hit_counts)?;
    write_table(config, stage, &all_dir.join("prefilter_quantiles.csv"), &quantiles.metric_prefilter)?;
    write_table(config, stage, &all_dir.join("postfilter_quantiles.csv"), &quantiles.metric_postfilter)?;
    if let Some(lb) = &quantiles.metric_lb_postfilter {
        write_table(config, stage, &all_dir.join("postfilter_lb_quantiles.csv"), lb)?;
    }

    let totals = report::library_counts(&table)?;
    let mut filtered = Vec::with_capacity(conditions.len());
    for condition in &conditions {
        let passed = HitCountFilter::for_condition(layout, condition, count_threshold, blank_threshold)
            .apply(&table)?
            .table;
        filtered.push(report::sublibrary_stats(&passed, &totals, &condition.name)?);
    }
    write_table(
        config,
        stage,
        &all_dir.join("sublibrary_stats.csv"),
        &storage::concat_tables(&filtered)?,
    )?;

    let mut by_stratum: Vec<Vec<RecordBatch>> = vec![Vec::new(); Stratum::ALL.len()];
    for pair in &pairs {
        let labelled = storage::read_csv(
            config
                .stratified_dir()
                .join(format!("{}_all_labels.csv", pair.code)),
        )?;
        for (stratum, tables) in Stratum::ALL.iter().zip(by_stratum.iter_mut()) {
            let subset = stratify::select_stratum(&labelled, *stratum)?;
            let label = format!("{}_{stratum}", pair.code);
            tables.push(report::sublibrary_stats(&subset, &totals, &label)?);
        }
    }
    for (stratum, tables) in Stratum::ALL.iter().zip(&by_stratum) {
        let path = config
            .lib_stat_dir()
            .join(stratum.label())
            .join("sublibrary_stats.csv");
        write_table(config, stage, &path, &storage::concat_tables(tables)?)?;
    }
    Ok(())
}

fn fingerprint_table(
    config: &PipelineConfig,
    stage: &mut StageRecord,
    request: &FingerprintRequest,
) -> Result<FeaturePaths> {
    let table = storage::read_csv(&request.input)?;
    let structures: Vec<Option<String>> = table
        .string_column(&request.smiles_column, "reading structures to fingerprint")?
        .iter()
        .map(|s| s.map(str::to_string))
        .collect();

    let params = FingerprintParams::from(&config.fingerprint);
    let batch = fingerprint::fingerprint_all(
        &structures,
        &params,
        config.fingerprint.workers(),
        config.fingerprint.chunk_size,
    )?;

    let dir = request
        .output_dir
        .clone()
        .unwrap_or_else(|| config.features_dir());
    let paths = FeaturePaths::new(&dir, &request.experiment);
    store::write_features(&paths, &batch, params.n_bits)?;

    stage.record_artifact(ArtifactRecord::from_file(
        &config.output_path,
        &paths.features,
        batch.fingerprints.len(),
    )?);
    stage.record_artifact(ArtifactRecord::from_file(
        &config.output_path,
        &paths.invalid,
        batch.invalid.len(),
    )?);
    #[allow(clippy::cast_precision_loss)]
    let invalid = batch.invalid.len() as f64;
    stage.record_metric(format!("{}.invalid", request.experiment), invalid);
    Ok(paths)
}

fn write_table(config: &PipelineConfig, stage: &mut StageRecord, path: &Path, table: &RecordBatch) -> Result<()> {
    storage::write_csv(path, table)?;
    stage.record_artifact(ArtifactRecord::from_file(&config.output_path, path, table.num_rows())?);
    Ok(())
}

fn configured_pairs(config: &PipelineConfig) -> Result<Vec<ConditionPair>> {
    let pairs = config.condition_pairs();
    if pairs.is_empty() {
        return Err(Error::Config(
            "no condition pairs: list condition_pairs or add X and X_inh to experimental_condition".into(),
        ));
    }
    Ok(pairs)
}

/// Condition labels of all pairs, first occurrence kept
fn condition_names(pairs: &[ConditionPair]) -> Vec<String> {
    let mut seen = FxHashSet::default();
    let mut names = pair_condition_names(pairs);
    names.retain(|n| seen.insert(n.clone()));
    names
}

fn condition_columns(layout: Layout, names: &[String]) -> Vec<ConditionColumns> {
    names
        .iter()
        .map(|n| ConditionColumns::for_layout(layout, n))
        .collect()
}
