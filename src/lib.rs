//! CODEX Processing Pipeline
//!
//! Decomposes a multi-cycle fluorescence microscopy experiment into work units
//! (one tile of one region), and schedules a fixed sequence of per-tile
//! processing stages over a pool of workers bound to GPU and memory slots.
//!
//! # Architecture
//!
//! - **Config**: versioned experiment metadata, tile geometry and channel lookup
//! - **Index**: index specifications, tiling strategies and work units
//! - **I/O**: raw tile loading and run recording
//! - **Pipeline**: stage graph, stage kernels, scheduler and metrics
//!
//! # Usage
//!
//! ```no_run
//! use codex_pipeline::{load_config, run_pipeline, BlankTileLoader, KernelSet, RunOptions, StopSignal};
//! use std::path::Path;
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let options = RunOptions::default();
//!     let config = load_config(Path::new("/data/experiment"), &options)?;
//!     let loader = Arc::new(BlankTileLoader::new(config.tile_dims()));
//!     let summary = run_pipeline(
//!         config,
//!         &options,
//!         Path::new("/data/output"),
//!         loader,
//!         KernelSet::default(),
//!         StopSignal::new(),
//!     )
//!     .await?;
//!     println!("{}", summary);
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod error;
pub mod index;
pub mod io;
pub mod logging;
pub mod options;
pub mod pipeline;

pub use config::{ChannelCoordinate, Config, CytometryReference, MicroscopeParams, SchemaVersion};
pub use error::{ConfigError, PipelineError};
pub use index::{IndexSpec, TileDims, WorkUnit};
pub use io::{BlankTileLoader, TileLoader};
pub use logging::LoggingInit;
pub use options::{RunOptions, StageToggles};
pub use pipeline::{
    KernelSet, Metrics, RunState, RunSummary, Scheduler, SchedulerConfig, StageKernel, StageKind,
    StopSignal,
};

use anyhow::Result;
use std::path::Path;
use std::sync::Arc;

/// Load the experiment configuration in `config_dir` with the schema version
/// selected in `options`.
pub fn load_config(config_dir: &Path, options: &RunOptions) -> Result<Config> {
    Ok(config::load_with(config_dir, options.schema_version, None)?)
}

/// Run the full processing pipeline.
///
/// Records the execution in `output_dir` before starting and the per-tile
/// results after finishing, as selected in `options`.
pub async fn run_pipeline(
    config: Config,
    options: &RunOptions,
    output_dir: &Path,
    loader: Arc<dyn TileLoader>,
    kernels: KernelSet,
    stop: StopSignal,
) -> Result<RunSummary> {
    options.validate()?;

    tracing::info!("Starting CODEX processing pipeline");
    tracing::info!("Configuration: {}", config);

    if options.record_execution {
        io::record_execution(output_dir, options)?;
    }

    let settings = SchedulerConfig::from_options(options)?;
    tracing::info!(
        "Stages: {}",
        settings
            .stages
            .enabled()
            .map(|k| k.as_str())
            .collect::<Vec<_>>()
            .join(", ")
    );

    let scheduler = Scheduler::new(Arc::new(config), loader, Metrics::new(), settings)
        .with_kernels(kernels);

    let estimate = scheduler.estimate_total_work()?;
    tracing::info!("Work estimate: {}", estimate);

    let summary = scheduler.run(stop).await?;

    if options.record_data {
        io::record_processor_data(output_dir, &summary)?;
    }

    Ok(summary)
}

/// Build a Tokio runtime with the specified configuration.
pub fn build_runtime(worker_threads: Option<usize>) -> Result<tokio::runtime::Runtime> {
    let mut builder = tokio::runtime::Builder::new_multi_thread();

    if let Some(threads) = worker_threads {
        builder.worker_threads(threads);
    }

    builder.enable_all();

    Ok(builder.build()?)
}

/// Initialize the Rayon thread pool used by CPU-bound stage kernels.
pub fn init_rayon(threads: Option<usize>) -> Result<()> {
    if let Some(threads) = threads {
        rayon::ThreadPoolBuilder::new()
            .num_threads(threads)
            .build_global()?;
    }
    Ok(())
}
