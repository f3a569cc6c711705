//! Records run provenance and results next to the output data.

use crate::options::RunOptions;
use crate::pipeline::RunSummary;
use anyhow::{Context, Result};
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

pub const EXECUTION_FILE: &str = "execution.json";
pub const PROCESSOR_DATA_FILE: &str = "processor.json";

/// Environment variables worth keeping with a run.
const RECORDED_ENV_PREFIXES: &[&str] = &["CODEX_", "CUDA_", "RUST_LOG", "RAYON_"];

#[derive(Debug, Serialize)]
struct ExecutionRecord<'a> {
    timestamp: String,
    version: &'static str,
    args: Vec<String>,
    env: BTreeMap<String, String>,
    options: &'a RunOptions,
}

fn write_json<T: Serialize>(output_dir: &Path, file_name: &str, value: &T) -> Result<PathBuf> {
    std::fs::create_dir_all(output_dir)
        .with_context(|| format!("failed to create output directory {}", output_dir.display()))?;
    let path = output_dir.join(file_name);
    let json = serde_json::to_string_pretty(value)?;
    std::fs::write(&path, json).with_context(|| format!("failed to write {}", path.display()))?;
    Ok(path)
}

/// Save the command line, selected environment variables and run options.
pub fn record_execution(output_dir: &Path, options: &RunOptions) -> Result<PathBuf> {
    let env = std::env::vars()
        .filter(|(key, _)| RECORDED_ENV_PREFIXES.iter().any(|p| key.starts_with(p)))
        .collect();

    let record = ExecutionRecord {
        timestamp: chrono::Utc::now().to_rfc3339(),
        version: env!("CARGO_PKG_VERSION"),
        args: std::env::args().collect(),
        env,
        options,
    };
    let path = write_json(output_dir, EXECUTION_FILE, &record)?;
    tracing::info!("Execution information saved to {}", path.display());
    Ok(path)
}

/// Save the aggregated per-tile results of a run.
pub fn record_processor_data(output_dir: &Path, summary: &RunSummary) -> Result<PathBuf> {
    let path = write_json(output_dir, PROCESSOR_DATA_FILE, summary)?;
    tracing::info!("Processor data saved to {}", path.display());
    Ok(path)
}
