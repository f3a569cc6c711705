//! CODEX Processing Pipeline CLI

use anyhow::Result;
use clap::{Args, Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use codex_pipeline::{
    build_runtime, init_rayon, load_config, run_pipeline, BlankTileLoader, IndexSpec, KernelSet,
    Metrics, RunOptions, Scheduler, SchedulerConfig, StopSignal,
};

#[derive(Parser)]
#[command(name = "codex-pipeline")]
#[command(about = "Schedule per-tile processing of CODEX microscopy experiments", long_about = None)]
struct Cli {
    /// Run options file (YAML or JSON); flags override its values
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Process an experiment
    Run {
        /// Directory containing raw acquisition data
        #[arg(long)]
        data_dir: PathBuf,

        /// Directory for results and execution records
        #[arg(long)]
        output_dir: PathBuf,

        /// Directory containing experiment configuration (default: data dir)
        #[arg(long)]
        config_dir: Option<PathBuf>,

        #[command(flatten)]
        selection: SelectionArgs,

        #[command(flatten)]
        stages: StageArgs,

        /// Number of Tokio worker threads (default: number of CPUs)
        #[arg(long)]
        worker_threads: Option<usize>,

        /// Number of Rayon threads for CPU kernels (default: number of CPUs)
        #[arg(long)]
        rayon_threads: Option<usize>,

        /// Log filter directive, e.g. `info` or `codex_pipeline=debug`
        #[arg(long)]
        log_level: Option<String>,

        /// Do not save arguments and environment before running
        #[arg(long)]
        no_record_execution: bool,

        /// Do not save per-tile results after running
        #[arg(long)]
        no_record_data: bool,

        /// On Ctrl-C, keep the tiles completed so far instead of failing
        #[arg(long)]
        partial_on_cancel: bool,

        /// Save the final metrics as JSON to this path
        #[arg(long)]
        metrics_output: Option<PathBuf>,
    },

    /// Print the work a run would do without processing
    Analyze {
        /// Directory containing experiment configuration
        #[arg(long)]
        config_dir: PathBuf,

        #[command(flatten)]
        selection: SelectionArgs,
    },

    /// Load and validate an experiment configuration
    Validate {
        /// Directory containing experiment configuration
        #[arg(long)]
        config_dir: PathBuf,
    },

    /// Generate a sample run options file
    GenerateConfig {
        /// Output path for run options file
        #[arg(short, long, default_value = "run-options.yaml")]
        output: PathBuf,
    },
}

/// What to process and with which resources.
#[derive(Args, Debug, Default)]
struct SelectionArgs {
    /// 1-based regions: `2`, `(1,4)` (half-open) or `1,3`
    #[arg(long)]
    regions: Option<IndexSpec>,

    /// 1-based tiles within each region, same forms as --regions
    #[arg(long)]
    tiles: Option<IndexSpec>,

    /// 0-based GPU devices, same forms as --regions
    #[arg(long)]
    gpus: Option<IndexSpec>,

    /// Number of workers (default: number of GPUs, or 1)
    #[arg(long)]
    n_workers: Option<usize>,

    /// Memory ceiling per worker in bytes
    #[arg(long)]
    memory_limit: Option<u64>,

    /// Loaded tiles buffered ahead of processing, per worker
    #[arg(long)]
    tile_prefetch_capacity: Option<usize>,
}

impl SelectionArgs {
    fn apply(self, options: &mut RunOptions) {
        if let Some(regions) = self.regions {
            options.region_indexes = regions;
        }
        if let Some(tiles) = self.tiles {
            options.tile_indexes = tiles;
        }
        if let Some(gpus) = self.gpus {
            options.gpus = gpus;
        }
        if self.n_workers.is_some() {
            options.n_workers = self.n_workers;
        }
        if let Some(limit) = self.memory_limit {
            options.memory_limit = limit;
        }
        if let Some(capacity) = self.tile_prefetch_capacity {
            options.tile_prefetch_capacity = capacity;
        }
    }
}

/// Stage switches. Flags only ever disable.
#[derive(Args, Debug, Default)]
struct StageArgs {
    #[arg(long)]
    no_tile_generator: bool,
    #[arg(long)]
    no_crop: bool,
    #[arg(long)]
    no_drift_compensation: bool,
    #[arg(long)]
    no_best_focus: bool,
    #[arg(long)]
    no_summary: bool,
    #[arg(long)]
    no_cytometry: bool,

    /// Deconvolution iterations; 0 disables deconvolution
    #[arg(long)]
    n_iter_decon: Option<u32>,

    /// Scale factor applied to deconvolution output
    #[arg(long)]
    scale_factor_decon: Option<f32>,
}

impl StageArgs {
    fn apply(self, options: &mut RunOptions) {
        let stages = &mut options.stages;
        stages.tile_generator &= !self.no_tile_generator;
        stages.crop &= !self.no_crop;
        stages.drift_compensation &= !self.no_drift_compensation;
        stages.best_focus &= !self.no_best_focus;
        stages.summary &= !self.no_summary;
        stages.cytometry &= !self.no_cytometry;
        if let Some(n) = self.n_iter_decon {
            options.n_iter_decon = n;
        }
        if let Some(scale) = self.scale_factor_decon {
            options.scale_factor_decon = scale;
        }
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut options = match &cli.config {
        Some(path) => RunOptions::from_file(path)?,
        None => RunOptions::default(),
    };

    match cli.command {
        Commands::Run {
            data_dir,
            output_dir,
            config_dir,
            selection,
            stages,
            worker_threads,
            rayon_threads,
            log_level,
            no_record_execution,
            no_record_data,
            partial_on_cancel,
            metrics_output,
        } => {
            selection.apply(&mut options);
            stages.apply(&mut options);
            if let Some(level) = log_level {
                options.logging.level = level;
            }
            options.record_execution &= !no_record_execution;
            options.record_data &= !no_record_data;
            options.partial_on_cancel |= partial_on_cancel;
            if metrics_output.is_some() {
                options.metrics_output = metrics_output;
            }
            options.logging.apply();

            let config_dir = config_dir.unwrap_or_else(|| data_dir.clone());
            run_command(&options, &data_dir, &config_dir, &output_dir, worker_threads, rayon_threads)?;
        }

        Commands::Analyze {
            config_dir,
            selection,
        } => {
            options.logging.apply();
            selection.apply(&mut options);
            analyze_command(&options, &config_dir)?;
        }

        Commands::Validate { config_dir } => {
            options.logging.apply();
            validate_command(&options, &config_dir)?;
        }

        Commands::GenerateConfig { output } => {
            generate_config_command(output)?;
        }
    }

    Ok(())
}

fn run_command(
    options: &RunOptions,
    data_dir: &Path,
    config_dir: &Path,
    output_dir: &Path,
    worker_threads: Option<usize>,
    rayon_threads: Option<usize>,
) -> Result<()> {
    options.validate()?;
    let config = load_config(config_dir, options)?;

    tracing::warn!(
        "No raw tile reader is linked into this binary; processing blank tiles in place of {}",
        data_dir.display()
    );
    let loader = Arc::new(BlankTileLoader::new(config.tile_dims()));

    init_rayon(rayon_threads)?;

    let runtime = build_runtime(worker_threads)?;
    let summary = runtime.block_on(async {
        let stop = StopSignal::new();
        let ctrl_c = {
            let stop = stop.clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    tracing::warn!("Interrupted; finishing tiles in progress");
                    stop.stop();
                }
            })
        };

        let result = run_pipeline(config, options, output_dir, loader, KernelSet::default(), stop).await;
        ctrl_c.abort();
        result
    })?;

    println!("{}", summary);
    Ok(())
}

fn analyze_command(options: &RunOptions, config_dir: &Path) -> Result<()> {
    options.validate()?;
    let config = Arc::new(load_config(config_dir, options)?);
    let loader = Arc::new(BlankTileLoader::new(config.tile_dims()));
    let scheduler = Scheduler::new(
        config.clone(),
        loader,
        Metrics::new(),
        SchedulerConfig::from_options(options)?,
    );
    let estimate = scheduler.estimate_total_work()?;

    println!("\n=== Work Analysis ===");
    println!("Configuration: {}", config);
    println!(
        "Region grid: {}x{} ({} tiles per region)",
        config.region_width(),
        config.region_height(),
        config.n_tiles_per_region()
    );
    println!("{}", estimate);
    println!(
        "Memory limit per worker: {:.1} GB",
        options.memory_limit as f64 / 1e9
    );
    println!("=====================\n");

    Ok(())
}

fn validate_command(options: &RunOptions, config_dir: &Path) -> Result<()> {
    let config = load_config(config_dir, options)?;
    println!("Configuration is valid: {}", config);
    println!("Channels: {}", config.channel_names().join(", "));
    Ok(())
}

const SAMPLE_RUN_OPTIONS: &str = r#"# CODEX Processing Pipeline run options
#
# Every key is optional. Command line flags override these values.

# === SELECTION: what to process ===
# Index specifications accept an integer (2), a half-open range "(1,4)",
# or a list [1, 3]. Regions and tiles are 1-based; GPUs are 0-based.

# Regions to process (default: regIdx from Experiment.json)
# region_indexes: "(1,3)"

# Tiles to process within each region (default: all)
# tile_indexes: [1, 2, 3]

# === RESOURCES ===
# GPU devices; worker i uses gpus[i % len(gpus)]
# gpus: [0, 1]

# Number of workers (default: number of GPUs, or 1)
# n_workers: 2

# Memory ceiling per worker in bytes
memory_limit: 48000000000

# Loaded tiles buffered ahead of processing, per worker
tile_prefetch_capacity: 1

# === STAGES ===
stages:
  tile_generator: true
  crop: true
  drift_compensation: true
  best_focus: true
  summary: true
  cytometry: true

# Deconvolution iterations; 0 disables deconvolution
n_iter_decon: 25
scale_factor_decon: 0.5

# === OUTPUT ===
# Save arguments and environment in the output directory
record_execution: true
# Save per-tile results in the output directory
record_data: true
# On interruption, keep completed tiles instead of failing
partial_on_cancel: false

# === LOGGING AND METRICS ===
logging:
  level: info
  ansi: true
  with_target: false
enable_metrics: true
metrics_interval_secs: 10
# Save the final metrics snapshot as JSON
# metrics_output: /data/output/metrics.json
"#;

fn generate_config_command(output: PathBuf) -> Result<()> {
    std::fs::write(&output, SAMPLE_RUN_OPTIONS)?;
    println!("Generated sample run options at: {}", output.display());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_parse_run() {
        let cli = Cli::try_parse_from([
            "codex-pipeline",
            "run",
            "--data-dir",
            "/data",
            "--output-dir",
            "/out",
            "--regions",
            "(1,3)",
            "--gpus",
            "0,2",
            "--no-crop",
            "--n-iter-decon",
            "0",
            "--metrics-output",
            "/out/metrics.json",
        ])
        .unwrap();

        let Commands::Run {
            selection,
            stages,
            config_dir,
            metrics_output,
            ..
        } = cli.command
        else {
            panic!("expected run command");
        };
        assert!(config_dir.is_none());
        assert_eq!(metrics_output, Some(PathBuf::from("/out/metrics.json")));

        let mut options = RunOptions::default();
        selection.apply(&mut options);
        stages.apply(&mut options);
        assert_eq!(options.region_indexes, IndexSpec::Range(1, 3));
        assert_eq!(options.gpus, IndexSpec::List(vec![0, 2]));
        assert!(!options.stages.crop);
        assert!(options.stages.cytometry);
        assert_eq!(options.n_iter_decon, 0);
    }

    #[test]
    fn test_cli_run_requires_dirs() {
        assert!(Cli::try_parse_from(["codex-pipeline", "run"]).is_err());
    }

    #[test]
    fn test_cli_parse_validate_with_options_file() {
        let cli = Cli::try_parse_from([
            "codex-pipeline",
            "validate",
            "--config-dir",
            "/cfg",
            "-c",
            "run.yaml",
        ])
        .unwrap();
        assert_eq!(cli.config, Some(PathBuf::from("run.yaml")));
        assert!(matches!(cli.command, Commands::Validate { .. }));
    }

    #[test]
    fn test_flags_do_not_reenable_stages() {
        let mut options = RunOptions::default();
        options.stages.best_focus = false;
        StageArgs::default().apply(&mut options);
        assert!(!options.stages.best_focus);
        assert!(options.stages.crop);
    }

    #[test]
    fn test_sample_run_options_parse() {
        let options = RunOptions::from_yaml(SAMPLE_RUN_OPTIONS).unwrap();
        assert!(options.validate().is_ok());
        assert_eq!(options.tile_prefetch_capacity, 1);
        assert!(options.region_indexes.is_absent());
    }
}
