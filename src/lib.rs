//! # del-strata: DEL screen preparation
//!
//! Turns raw DNA-encoded library screening outputs into stratified hit sets.
//!
//! ```text
//! libraries/lib<id>.csv ─┐
//! samples/*.csv ─────────┼─ loader ─ merge ─> preprocessed.csv (one row per compound)
//! <cond>_lib<id>.csv ────┘                         │
//!                                         filter (counts vs. blank)
//!                                                  │
//!                                  stratify (target vs. target + inhibitor)
//!                                                  │
//!                     Orthosteric / Cryptic / Allosteric [competitive split]
//!                                                  │
//!                            report (lib_stat/)   fingerprint (features/)
//! ```
//!
//! ## Design Principles
//!
//! - **Append-only artifacts**: every stage writes new CSV files, inputs are
//!   never rewritten
//! - **Explicit joins**: compounds align by their `(lib_id, cycle1..3)` key,
//!   positional alignment only after a row-count check
//! - **Config-driven conditions**: a [`condition::ConditionPair`] carries every
//!   column name a condition needs
//!
//! ## Example Usage
//!
//! ```rust,no_run
//! use del_strata::config::PipelineConfig;
//! use del_strata::manifest::RunStatus;
//! use del_strata::pipeline::Pipeline;
//!
//! let config = PipelineConfig::from_path("config.yaml")?;
//! let mut pipeline = Pipeline::new(config);
//! let result = pipeline.run();
//! let status = if result.is_ok() { RunStatus::Success } else { RunStatus::Failed };
//! pipeline.finish(status)?;
//! result?;
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

pub mod condition;
pub mod config;
pub mod error;
pub mod filter;
pub mod fingerprint;
pub mod loader;
pub mod manifest;
pub mod merge;
pub mod pipeline;
pub mod report;
pub mod storage;
pub mod stratify;

pub use error::{Error, Result};
