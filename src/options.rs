//! Run options: what to process and with which resources.
//!
//! Run options are separate from the experiment [`crate::Config`]; they describe
//! a single invocation and can be kept in a YAML or JSON file, then overridden
//! from the command line.

use crate::config::SchemaVersion;
use crate::index::IndexSpec;
use crate::logging::LoggingInit;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Options for one pipeline run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunOptions {
    /// 1-based regions to process (default: regions from the experiment config)
    #[serde(default)]
    pub region_indexes: IndexSpec,

    /// 1-based tiles to process within each region (default: all)
    #[serde(default)]
    pub tile_indexes: IndexSpec,

    /// 0-based GPU devices to bind workers to
    #[serde(default)]
    pub gpus: IndexSpec,

    /// Number of tiles processed in parallel (default: number of GPUs, or 1)
    #[serde(default)]
    pub n_workers: Option<usize>,

    /// Memory ceiling per worker in bytes
    #[serde(default = "default_memory_limit")]
    pub memory_limit: u64,

    /// Number of loaded tiles buffered ahead of processing, per worker
    #[serde(default = "default_prefetch_capacity")]
    pub tile_prefetch_capacity: usize,

    /// Stage toggles
    #[serde(default)]
    pub stages: StageToggles,

    /// Deconvolution iterations; 0 disables deconvolution
    #[serde(default = "default_n_iter_decon")]
    pub n_iter_decon: u32,

    /// Scale factor applied to deconvolution output
    #[serde(default = "default_scale_factor_decon")]
    pub scale_factor_decon: f32,

    /// Configuration schema version
    #[serde(default)]
    pub schema_version: SchemaVersion,

    /// Logging setup replicated into every worker
    #[serde(default)]
    pub logging: LoggingInit,

    /// Save arguments and environment in the output directory before running
    #[serde(default = "default_true")]
    pub record_execution: bool,

    /// Save the run summary in the output directory after running
    #[serde(default = "default_true")]
    pub record_data: bool,

    /// Return the completed tiles instead of failing when the run is stopped
    #[serde(default)]
    pub partial_on_cancel: bool,

    /// Periodic progress reporting
    #[serde(default = "default_true")]
    pub enable_metrics: bool,

    /// Progress reporting interval in seconds
    #[serde(default = "default_metrics_interval")]
    pub metrics_interval_secs: u64,

    /// Save the final metrics snapshot as JSON to this path
    #[serde(default)]
    pub metrics_output: Option<PathBuf>,
}

/// Per-stage enable flags. Deconvolution is controlled by `n_iter_decon`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageToggles {
    #[serde(default = "default_true")]
    pub tile_generator: bool,
    #[serde(default = "default_true")]
    pub crop: bool,
    #[serde(default = "default_true")]
    pub drift_compensation: bool,
    #[serde(default = "default_true")]
    pub best_focus: bool,
    #[serde(default = "default_true")]
    pub summary: bool,
    #[serde(default = "default_true")]
    pub cytometry: bool,
}

impl Default for StageToggles {
    fn default() -> Self {
        Self::all(true)
    }
}

impl StageToggles {
    pub fn all(enabled: bool) -> Self {
        Self {
            tile_generator: enabled,
            crop: enabled,
            drift_compensation: enabled,
            best_focus: enabled,
            summary: enabled,
            cytometry: enabled,
        }
    }
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            region_indexes: IndexSpec::Absent,
            tile_indexes: IndexSpec::Absent,
            gpus: IndexSpec::Absent,
            n_workers: None,
            memory_limit: default_memory_limit(),
            tile_prefetch_capacity: default_prefetch_capacity(),
            stages: StageToggles::default(),
            n_iter_decon: default_n_iter_decon(),
            scale_factor_decon: default_scale_factor_decon(),
            schema_version: SchemaVersion::default(),
            logging: LoggingInit::default(),
            record_execution: true,
            record_data: true,
            partial_on_cancel: false,
            enable_metrics: true,
            metrics_interval_secs: default_metrics_interval(),
            metrics_output: None,
        }
    }
}

impl RunOptions {
    /// Load run options from a YAML or JSON file.
    /// Format is picked from the extension; anything else is read as YAML.
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let ext = path.extension().and_then(|e| e.to_str()).unwrap_or("");

        let options: RunOptions = match ext {
            "json" => serde_json::from_str(&contents)?,
            _ => serde_yaml::from_str(&contents)?,
        };
        Ok(options)
    }

    pub fn from_yaml(yaml: &str) -> anyhow::Result<Self> {
        Ok(serde_yaml::from_str(yaml)?)
    }

    pub fn to_yaml(&self) -> anyhow::Result<String> {
        Ok(serde_yaml::to_string(self)?)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.n_workers == Some(0) {
            anyhow::bail!("n_workers must be > 0");
        }
        if self.tile_prefetch_capacity == 0 {
            anyhow::bail!("tile_prefetch_capacity must be > 0");
        }
        if self.memory_limit == 0 {
            anyhow::bail!("memory_limit must be > 0");
        }
        if !(self.scale_factor_decon.is_finite() && self.scale_factor_decon > 0.0) {
            anyhow::bail!("scale_factor_decon must be a positive number");
        }
        if self.metrics_interval_secs == 0 {
            anyhow::bail!("metrics_interval_secs must be > 0");
        }
        Ok(())
    }
}

fn default_memory_limit() -> u64 { 48_000_000_000 }
fn default_prefetch_capacity() -> usize { 1 }
fn default_n_iter_decon() -> u32 { 25 }
fn default_scale_factor_decon() -> f32 { 0.5 }
fn default_true() -> bool { true }
fn default_metrics_interval() -> u64 { 10 }
