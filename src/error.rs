//! Error types for configuration loading and pipeline execution.

use crate::index::WorkUnit;
use crate::pipeline::StageKind;
use std::path::PathBuf;
use thiserror::Error;

/// Errors raised while resolving indexes or building a [`crate::Config`].
///
/// All of these are raised before any worker starts.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Malformed index specification text.
    #[error("cannot parse index specification {input:?}: {reason}")]
    Parse { input: String, reason: String },

    /// A required configuration file is absent.
    #[error("required configuration file {} does not exist", path.display())]
    MissingConfig { path: PathBuf },

    /// A structural or semantic invariant does not hold.
    #[error("invalid configuration field \"{field}\": {message}")]
    Validation { field: String, message: String },

    /// Unknown channel name.
    #[error("channel {name:?} is not in the configured channel list {available:?}")]
    Lookup { name: String, available: Vec<String> },

    /// Schema version with no loader.
    #[error("config schema version {0:?} is not supported (supported: {1:?})")]
    UnsupportedVersion(String, Vec<String>),

    /// Tile index past the end of a region.
    #[error(
        "tile index {index} is out of range; only {n_tiles} tiles are expected \
         (region width = {width}, height = {height})"
    )]
    Range {
        index: usize,
        n_tiles: usize,
        width: usize,
        height: usize,
    },

    /// Tiling mode with no strategy.
    #[error("tiling mode {0:?} is not supported")]
    UnsupportedMode(String),

    #[error("failed to read {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse {}: {source}", path.display())]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

impl ConfigError {
    pub(crate) fn validation(field: impl Into<String>, message: impl Into<String>) -> Self {
        ConfigError::Validation {
            field: field.into(),
            message: message.into(),
        }
    }
}

/// Errors that end a pipeline run in the failed state.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// Resource settings cannot satisfy the workload.
    #[error("resource error: {0}")]
    Resource(String),

    /// Raw tile data could not be loaded.
    #[error("failed to load tile {unit}: {source:#}")]
    Load {
        unit: WorkUnit,
        #[source]
        source: anyhow::Error,
    },

    /// A stage raised while processing one work unit.
    #[error("stage {stage} failed on tile {unit}: {source:#}")]
    StageFailure {
        unit: WorkUnit,
        stage: StageKind,
        #[source]
        source: anyhow::Error,
    },

    /// The run was stopped before all work units completed.
    #[error("run cancelled after {completed} of {total} work units")]
    Cancelled { completed: usize, total: usize },

    /// A worker task panicked or was aborted.
    #[error("worker {worker} terminated abnormally: {message}")]
    Worker { worker: usize, message: String },
}

impl PipelineError {
    /// Work unit this error is attributed to, if any.
    pub fn work_unit(&self) -> Option<&WorkUnit> {
        match self {
            PipelineError::Load { unit, .. } | PipelineError::StageFailure { unit, .. } => {
                Some(unit)
            }
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validation_message_names_field() {
        let err = ConfigError::validation("regIdx", "expected 1-based index > 0 but found 0");
        let msg = err.to_string();
        assert!(msg.contains("regIdx"));
        assert!(msg.contains("found 0"));
    }

    #[test]
    fn test_stage_failure_names_unit_and_stage() {
        let unit = WorkUnit {
            region_index: 0,
            tile_index: 3,
            tile_x: 1,
            tile_y: 1,
        };
        let err = PipelineError::StageFailure {
            unit,
            stage: StageKind::BestFocus,
            source: anyhow::anyhow!("no z planes"),
        };
        let msg = err.to_string();
        assert!(msg.contains("best_focus"));
        assert!(msg.contains("R001_X002_Y002"));
        assert_eq!(err.work_unit(), Some(&unit));
    }
}
