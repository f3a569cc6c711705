//! Work distribution and scheduling for tile processing.
//!
//! A run moves through [`RunState`]s:
//!
//! ```text
//! Configuring → BuildingWorkqueue → Running → Aggregating → Done
//!      └──────────────┴──────────────┴────────────┴──────→ Failed
//! ```
//!
//! Work units sit in a shared queue that is filled and closed before any
//! worker starts. Each worker pulls units through its own loader task, which
//! keeps at most `prefetch_capacity` loaded tiles ahead of processing.

use crate::config::Config;
use crate::error::{ConfigError, PipelineError};
use crate::index::WorkUnit;
use crate::io::TileLoader;
use crate::logging::LoggingInit;
use crate::options::{RunOptions, StageToggles};
use crate::pipeline::{
    DeconParams, KernelSet, Metrics, MetricsReporter, ResourcePlan, RunSummary, StageGraph,
    TileArray, TileProcessor, TileReport, WorkerSlot,
};
use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{mpsc, watch};

/// Scheduler lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    Configuring,
    BuildingWorkqueue,
    Running,
    Aggregating,
    Done,
    Failed,
}

impl RunState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, RunState::Done | RunState::Failed)
    }
}

/// External request to stop a run.
///
/// Workers finish the unit they are processing and take no new ones.
#[derive(Debug, Clone, Default)]
pub struct StopSignal(Arc<AtomicBool>);

impl StopSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stop(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_stopped(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Configuration for the scheduler.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Worker count (default: number of GPUs, or 1)
    pub n_workers: Option<usize>,

    /// 0-based GPU devices
    pub gpus: Option<Vec<i64>>,

    /// Memory ceiling per worker in bytes
    pub memory_limit: u64,

    /// Loaded tiles buffered ahead of processing, per worker
    pub prefetch_capacity: usize,

    /// 1-based regions overriding the configured ones
    pub region_indexes: Option<Vec<i64>>,

    /// 1-based tiles overriding the full region
    pub tile_indexes: Option<Vec<i64>>,

    pub stages: StageGraph,

    pub decon: DeconParams,

    /// Applied once in every worker before its first stage
    pub logging: LoggingInit,

    /// Return completed tiles instead of failing when stopped
    pub partial_on_cancel: bool,

    /// Enable progress reporting
    pub enable_metrics: bool,

    /// Metrics reporting interval in seconds
    pub metrics_interval_secs: u64,

    /// Optional path to save metrics JSON after run completes
    pub metrics_output_path: Option<PathBuf>,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        let decon = DeconParams::default();
        Self {
            n_workers: None,
            gpus: None,
            memory_limit: 48_000_000_000,
            prefetch_capacity: 1,
            region_indexes: None,
            tile_indexes: None,
            stages: StageGraph::new(&StageToggles::default(), &decon),
            decon,
            logging: LoggingInit::default(),
            partial_on_cancel: false,
            enable_metrics: true,
            metrics_interval_secs: 10,
            metrics_output_path: None,
        }
    }
}

impl SchedulerConfig {
    /// Resolve index specifications and stage toggles from run options.
    pub fn from_options(options: &RunOptions) -> Result<Self, ConfigError> {
        let decon = DeconParams {
            n_iter: options.n_iter_decon,
            scale_factor: options.scale_factor_decon,
        };
        Ok(Self {
            n_workers: options.n_workers,
            gpus: options.gpus.resolve()?,
            memory_limit: options.memory_limit,
            prefetch_capacity: options.tile_prefetch_capacity,
            region_indexes: options.region_indexes.resolve()?,
            tile_indexes: options.tile_indexes.resolve()?,
            stages: StageGraph::new(&options.stages, &decon),
            decon,
            logging: options.logging.clone(),
            partial_on_cancel: options.partial_on_cancel,
            enable_metrics: options.enable_metrics,
            metrics_interval_secs: options.metrics_interval_secs,
            metrics_output_path: options.metrics_output.clone(),
        })
    }
}

/// Everything a worker task owns.
struct Worker {
    slot: WorkerSlot,
    queue: async_channel::Receiver<WorkUnit>,
    loader: Arc<dyn TileLoader>,
    processor: Arc<TileProcessor>,
    metrics: Arc<Metrics>,
    logging: LoggingInit,
    prefetch_capacity: usize,
    stop: StopSignal,
    /// Raised by the first failing worker
    halt: StopSignal,
}

impl Worker {
    fn should_stop(&self) -> bool {
        self.stop.is_stopped() || self.halt.is_stopped()
    }

    async fn run(self) -> Result<Vec<TileReport>, PipelineError> {
        self.logging.apply();
        self.metrics.add_worker_initialized();
        tracing::debug!(
            "Worker {} started (gpu: {:?})",
            self.slot.worker_id,
            self.slot.gpu
        );

        // Reserving before loading bounds the loaded-but-unprocessed tiles.
        let (tile_tx, mut tile_rx) =
            mpsc::channel::<(WorkUnit, anyhow::Result<TileArray>)>(self.prefetch_capacity);
        let prefetch = {
            let queue = self.queue.clone();
            let loader = self.loader.clone();
            let metrics = self.metrics.clone();
            let (stop, halt) = (self.stop.clone(), self.halt.clone());
            tokio::spawn(async move {
                loop {
                    let Ok(permit) = tile_tx.reserve().await else { break };
                    if stop.is_stopped() || halt.is_stopped() {
                        break;
                    }
                    let Ok(unit) = queue.recv().await else { break };
                    let start = Instant::now();
                    let loaded = loader.load(&unit).await;
                    metrics.add_load_time(start.elapsed());
                    permit.send((unit, loaded));
                }
            })
        };

        let mut reports = Vec::new();
        let mut outcome = Ok(());
        while let Some((unit, loaded)) = tile_rx.recv().await {
            if self.should_stop() {
                break;
            }

            let tile = match loaded {
                Ok(tile) => tile,
                Err(source) => {
                    outcome = Err(PipelineError::Load { unit, source });
                    break;
                }
            };
            self.metrics
                .add_tile_loaded((tile.len() * std::mem::size_of::<f32>()) as u64);

            let processor = self.processor.clone();
            let slot = self.slot;
            let result = tokio::task::spawn_blocking(move || processor.process(unit, tile, &slot))
                .await
                .map_err(|e| PipelineError::Worker {
                    worker: self.slot.worker_id,
                    message: e.to_string(),
                })
                .and_then(|r| r);

            match result {
                Ok(report) => {
                    self.metrics.add_unit_processed();
                    tracing::debug!(
                        "Worker {} finished {} in {:.2}s",
                        self.slot.worker_id,
                        unit,
                        report.elapsed_secs
                    );
                    reports.push(report);
                }
                Err(e) => {
                    outcome = Err(e);
                    break;
                }
            }
        }

        if outcome.is_err() {
            self.halt.stop();
            self.metrics.add_unit_failed();
        }
        drop(tile_rx);
        let _ = prefetch.await;

        outcome.map(|()| reports)
    }
}

/// Scheduler for distributing work units across workers.
pub struct Scheduler {
    config: Arc<Config>,
    loader: Arc<dyn TileLoader>,
    kernels: KernelSet,
    metrics: Arc<Metrics>,
    settings: SchedulerConfig,
    state: watch::Sender<RunState>,
}

impl Scheduler {
    pub fn new(
        config: Arc<Config>,
        loader: Arc<dyn TileLoader>,
        metrics: Arc<Metrics>,
        settings: SchedulerConfig,
    ) -> Self {
        let (state, _) = watch::channel(RunState::Configuring);
        Self {
            config,
            loader,
            kernels: KernelSet::default(),
            metrics,
            settings,
            state,
        }
    }

    /// Replace the stage kernels.
    pub fn with_kernels(mut self, kernels: KernelSet) -> Self {
        self.kernels = kernels;
        self
    }

    pub fn state(&self) -> RunState {
        *self.state.borrow()
    }

    /// Watch state transitions.
    pub fn subscribe(&self) -> watch::Receiver<RunState> {
        self.state.subscribe()
    }

    fn set_state(&self, state: RunState) {
        tracing::debug!("Scheduler state: {:?}", state);
        self.state.send_replace(state);
    }

    /// Check resources and the stage graph, then build the work units.
    fn prepare(&self) -> Result<(ResourcePlan, Vec<WorkUnit>), PipelineError> {
        self.set_state(RunState::Configuring);
        if self.settings.prefetch_capacity == 0 {
            return Err(ConfigError::validation("tile_prefetch_capacity", "must be > 0").into());
        }
        let plan = ResourcePlan::resolve(
            self.settings.n_workers,
            self.settings.gpus.as_deref(),
            self.settings.memory_limit,
        )?;
        self.settings.stages.validate()?;
        plan.check_memory(&self.config.tile_dims(), self.settings.prefetch_capacity)?;

        self.set_state(RunState::BuildingWorkqueue);
        let units = self.config.work_units(
            self.settings.region_indexes.as_deref(),
            self.settings.tile_indexes.as_deref(),
        )?;
        Ok((plan, units))
    }

    /// Run the scheduler to process all work units.
    pub async fn run(&self, stop: StopSignal) -> Result<RunSummary, PipelineError> {
        let result = self.run_inner(stop).await;
        match &result {
            Ok(summary) => {
                self.set_state(RunState::Done);
                tracing::info!("Run complete: {}", summary);
            }
            Err(e) => {
                self.set_state(RunState::Failed);
                tracing::error!("Run failed: {}", e);
            }
        }
        result
    }

    async fn run_inner(&self, stop: StopSignal) -> Result<RunSummary, PipelineError> {
        let start = Instant::now();
        let (plan, units) = self.prepare()?;
        let total_units = units.len();

        // Shared work queue, filled in order then closed
        let (work_tx, work_rx) = async_channel::bounded::<WorkUnit>(total_units.max(1));
        for unit in units {
            let _ = work_tx.send(unit).await;
        }
        work_tx.close();

        tracing::info!(
            "Scheduling {} work units on {} workers (prefetch {})",
            total_units,
            plan.n_workers(),
            self.settings.prefetch_capacity
        );

        self.set_state(RunState::Running);

        let (shutdown_tx, shutdown_rx) = mpsc::channel::<()>(1);
        let reporter_handle = if self.settings.enable_metrics {
            let reporter = MetricsReporter::new(
                self.metrics.clone(),
                self.settings.metrics_interval_secs,
                total_units as u64,
            );
            Some(tokio::spawn(reporter.run(shutdown_rx)))
        } else {
            drop(shutdown_rx);
            None
        };

        let processor = Arc::new(TileProcessor::new(
            self.config.clone(),
            self.settings.stages.clone(),
            self.kernels.clone(),
            self.settings.decon,
            self.metrics.clone(),
        ));
        let halt = StopSignal::new();

        let handles: Vec<_> = plan
            .slots
            .iter()
            .map(|&slot| {
                let worker = Worker {
                    slot,
                    queue: work_rx.clone(),
                    loader: self.loader.clone(),
                    processor: processor.clone(),
                    metrics: self.metrics.clone(),
                    logging: self.settings.logging.clone(),
                    prefetch_capacity: self.settings.prefetch_capacity,
                    stop: stop.clone(),
                    halt: halt.clone(),
                };
                tokio::spawn(worker.run())
            })
            .collect();
        drop(work_rx);

        let mut reports = Vec::with_capacity(total_units);
        let mut failure = None;
        for (worker, handle) in handles.into_iter().enumerate() {
            match handle.await {
                Ok(Ok(mut worker_reports)) => reports.append(&mut worker_reports),
                Ok(Err(e)) => {
                    failure.get_or_insert(e);
                }
                Err(e) => {
                    halt.stop();
                    failure.get_or_insert(PipelineError::Worker {
                        worker,
                        message: e.to_string(),
                    });
                }
            }
        }

        let _ = shutdown_tx.send(()).await;
        if let Some(handle) = reporter_handle {
            let _ = handle.await;
        }

        if self.settings.enable_metrics {
            MetricsReporter::new(
                self.metrics.clone(),
                self.settings.metrics_interval_secs,
                total_units as u64,
            )
            .print_summary();

            if let Some(ref path) = self.settings.metrics_output_path {
                if let Err(e) = self.metrics.snapshot().save_to_file(path) {
                    tracing::warn!("Failed to save metrics to {}: {}", path.display(), e);
                }
            }
        }

        if let Some(e) = failure {
            return Err(e);
        }

        let completed = reports.len();
        if completed < total_units {
            tracing::warn!("Run stopped after {} of {} work units", completed, total_units);
            if !self.settings.partial_on_cancel {
                return Err(PipelineError::Cancelled {
                    completed,
                    total: total_units,
                });
            }
        }

        self.set_state(RunState::Aggregating);
        let mut summary = RunSummary::aggregate(
            reports,
            total_units,
            plan.n_workers(),
            self.settings.stages.specs().to_vec(),
        );
        summary.cancelled = completed < total_units;
        summary.elapsed_secs = start.elapsed().as_secs_f64();
        Ok(summary)
    }

    /// Estimate the work of a run without loading any tiles.
    pub fn estimate_total_work(&self) -> Result<WorkEstimate, PipelineError> {
        let (plan, units) = self.prepare()?;
        let dims = self.config.tile_dims();
        let regions: BTreeSet<usize> = units.iter().map(|u| u.region_index).collect();

        Ok(WorkEstimate {
            total_units: units.len(),
            regions: regions.len(),
            n_workers: plan.n_workers(),
            enabled_stages: self.settings.stages.enabled().count(),
            tile_bytes: dims.size_bytes(),
            peak_bytes_per_worker: dims
                .size_bytes()
                .saturating_mul((self.settings.prefetch_capacity as u64).saturating_add(1)),
        })
    }
}

/// Work estimate for a run.
#[derive(Debug)]
pub struct WorkEstimate {
    /// Work units to process
    pub total_units: usize,

    /// Distinct regions
    pub regions: usize,

    pub n_workers: usize,

    pub enabled_stages: usize,

    /// Size of one raw tile
    pub tile_bytes: u64,

    /// Tiles a worker holds at once, in bytes
    pub peak_bytes_per_worker: u64,
}

impl std::fmt::Display for WorkEstimate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Work units: {} in {} regions, Workers: {}, Stages: {}, \
             Tile size: {:.1} MB, Peak per worker: {:.1} MB",
            self.total_units,
            self.regions,
            self.n_workers,
            self.enabled_stages,
            self.tile_bytes as f64 / (1024.0 * 1024.0),
            self.peak_bytes_per_worker as f64 / (1024.0 * 1024.0),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::fixtures::test_config;
    use crate::io::BlankTileLoader;
    use crate::pipeline::{StageContext, StageKernel, StageKind};
    use serde_json::Value;
    use std::collections::HashSet;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    fn settings() -> SchedulerConfig {
        SchedulerConfig {
            enable_metrics: false,
            logging: LoggingInit::with_level("warn"),
            ..Default::default()
        }
    }

    fn scheduler(settings: SchedulerConfig) -> Scheduler {
        let config = Arc::new(test_config());
        let loader = Arc::new(BlankTileLoader::new(config.tile_dims()));
        Scheduler::new(config, loader, Metrics::new(), settings)
    }

    #[test]
    fn test_scheduler_config_default() {
        let config = SchedulerConfig::default();
        assert_eq!(config.n_workers, None);
        assert_eq!(config.prefetch_capacity, 1);
        assert_eq!(config.memory_limit, 48_000_000_000);
        assert!(config.enable_metrics);
        assert!(config.metrics_output_path.is_none());
        assert_eq!(config.stages.enabled().count(), 7);
    }

    #[test]
    fn test_from_options() {
        let yaml = r#"
gpus: "0,2"
region_indexes: "(2,4)"
n_iter_decon: 0
"#;
        let mut options = RunOptions::from_yaml(yaml).unwrap();
        options.metrics_output = Some(PathBuf::from("/tmp/metrics.json"));
        let config = SchedulerConfig::from_options(&options).unwrap();
        assert_eq!(config.metrics_output_path, Some(PathBuf::from("/tmp/metrics.json")));
        assert_eq!(config.gpus, Some(vec![0, 2]));
        assert_eq!(config.region_indexes, Some(vec![2, 3]));
        assert_eq!(config.tile_indexes, None);
        assert!(!config.stages.is_enabled(StageKind::Deconvolution));
    }

    #[tokio::test]
    async fn test_full_run_covers_every_unit() {
        let s = scheduler(settings());
        let summary = s.run(StopSignal::new()).await.unwrap();

        // 3 regions x 4 tiles
        assert_eq!(summary.total_units, 12);
        assert_eq!(summary.completed(), 12);
        assert!(summary.is_complete());
        let keys: HashSet<_> = summary.tiles.keys().collect();
        assert_eq!(keys.len(), 12);
        assert!(summary
            .tiles
            .values()
            .all(|r| r.stages_run == StageKind::ORDER.to_vec()));
        assert_eq!(s.state(), RunState::Done);
        assert_eq!(s.metrics.snapshot().units_processed, 12);
    }

    #[tokio::test]
    async fn test_disabled_stages_still_summarize_every_unit() {
        let s = scheduler(SchedulerConfig {
            stages: StageGraph::disabled(),
            ..settings()
        });
        let summary = s.run(StopSignal::new()).await.unwrap();
        assert_eq!(summary.completed(), 12);
        assert!(summary.tiles.values().all(|r| r.stages_run.is_empty()));
    }

    #[tokio::test]
    async fn test_workers_bound_to_gpus() {
        let s = scheduler(SchedulerConfig {
            gpus: Some(vec![0, 2]),
            ..settings()
        });
        let summary = s.run(StopSignal::new()).await.unwrap();
        assert_eq!(summary.n_workers, 2);
        assert_eq!(s.metrics.snapshot().workers_initialized, 2);
        assert!(summary.tiles.values().all(|r| r.worker_id < 2));
    }

    #[tokio::test]
    async fn test_run_level_selection() {
        let s = scheduler(SchedulerConfig {
            region_indexes: Some(vec![2]),
            tile_indexes: Some(vec![1, 3]),
            ..settings()
        });
        let summary = s.run(StopSignal::new()).await.unwrap();
        let keys: Vec<_> = summary.tiles.keys().cloned().collect();
        // Snake: tile 0 -> (0, 0), tile 2 -> (1, 1)
        assert_eq!(keys, vec!["R002_X001_Y001", "R002_X002_Y002"]);
    }

    struct Failing;

    impl StageKernel for Failing {
        fn kind(&self) -> StageKind {
            StageKind::BestFocus
        }
        fn run(&self, _tile: &mut TileArray, _ctx: &StageContext<'_>) -> anyhow::Result<Option<Value>> {
            anyhow::bail!("no contrast")
        }
    }

    #[tokio::test]
    async fn test_stage_failure_fails_run() {
        let s = scheduler(SchedulerConfig {
            n_workers: Some(3),
            ..settings()
        })
        .with_kernels(KernelSet::default().with_kernel(Arc::new(Failing)));

        let err = s.run(StopSignal::new()).await.unwrap_err();
        assert!(matches!(err, PipelineError::StageFailure { stage: StageKind::BestFocus, .. }));
        assert!(err.work_unit().is_some());
        assert_eq!(s.state(), RunState::Failed);
    }

    struct FailingLoader;

    #[async_trait::async_trait]
    impl TileLoader for FailingLoader {
        async fn load(&self, _unit: &WorkUnit) -> anyhow::Result<TileArray> {
            anyhow::bail!("missing raw files")
        }
    }

    #[tokio::test]
    async fn test_load_failure_fails_run() {
        let s = Scheduler::new(
            Arc::new(test_config()),
            Arc::new(FailingLoader),
            Metrics::new(),
            settings(),
        );
        let err = s.run(StopSignal::new()).await.unwrap_err();
        assert!(matches!(err, PipelineError::Load { .. }));
        assert!(err.to_string().contains("missing raw files"));
    }

    #[tokio::test]
    async fn test_memory_limit_checked_before_workers() {
        let s = scheduler(SchedulerConfig {
            memory_limit: 1024,
            ..settings()
        });
        let err = s.run(StopSignal::new()).await.unwrap_err();
        assert!(matches!(err, PipelineError::Resource(_)));
        assert_eq!(s.metrics.snapshot().workers_initialized, 0);
    }

    #[tokio::test]
    async fn test_invalid_selection_is_config_error() {
        let s = scheduler(SchedulerConfig {
            tile_indexes: Some(vec![5]),
            ..settings()
        });
        let err = s.run(StopSignal::new()).await.unwrap_err();
        assert!(matches!(err, PipelineError::Config(ConfigError::Range { .. })));
        assert_eq!(s.state(), RunState::Failed);
    }

    #[tokio::test]
    async fn test_stop_before_start() {
        let stop = StopSignal::new();
        stop.stop();

        let s = scheduler(settings());
        let err = s.run(stop.clone()).await.unwrap_err();
        assert!(matches!(err, PipelineError::Cancelled { completed: 0, total: 12 }));

        let s = scheduler(SchedulerConfig {
            partial_on_cancel: true,
            ..settings()
        });
        let summary = s.run(stop).await.unwrap();
        assert!(summary.cancelled);
        assert_eq!(summary.completed(), 0);
    }

    /// Raises the stop signal while processing its first tile.
    struct StopAfterFirst(StopSignal);

    impl StageKernel for StopAfterFirst {
        fn kind(&self) -> StageKind {
            StageKind::Summary
        }
        fn run(&self, _tile: &mut TileArray, _ctx: &StageContext<'_>) -> anyhow::Result<Option<Value>> {
            self.0.stop();
            Ok(None)
        }
    }

    #[tokio::test]
    async fn test_stop_finishes_current_unit() {
        let stop = StopSignal::new();
        let s = scheduler(SchedulerConfig {
            n_workers: Some(1),
            partial_on_cancel: true,
            ..settings()
        })
        .with_kernels(KernelSet::default().with_kernel(Arc::new(StopAfterFirst(stop.clone()))));

        let summary = s.run(stop).await.unwrap();
        assert!(summary.cancelled);
        assert_eq!(summary.completed(), 1);
        assert!(summary.tiles.contains_key("R001_X001_Y001"));
    }

    #[tokio::test]
    async fn test_repeated_regions_run_once() {
        let s = scheduler(SchedulerConfig {
            region_indexes: Some(vec![1, 1]),
            n_workers: Some(2),
            ..settings()
        });
        let summary = s.run(StopSignal::new()).await.unwrap();
        assert_eq!(summary.total_units, 4);
        assert_eq!(summary.completed(), 4);
        assert!(!summary.cancelled);
        assert!(summary.is_complete());
        assert_eq!(s.metrics.snapshot().units_processed, 4);
    }

    #[tokio::test]
    async fn test_zero_prefetch_rejected_before_workers() {
        let s = scheduler(SchedulerConfig {
            prefetch_capacity: 0,
            ..settings()
        });
        let err = s.run(StopSignal::new()).await.unwrap_err();
        assert!(matches!(
            err,
            PipelineError::Config(ConfigError::Validation { ref field, .. }) if field == "tile_prefetch_capacity"
        ));
        assert_eq!(s.metrics.snapshot().workers_initialized, 0);
        assert_eq!(s.state(), RunState::Failed);
    }

    /// Tiles loaded versus tiles handed to processing.
    #[derive(Default)]
    struct Backlog {
        loaded: AtomicUsize,
        taken: AtomicUsize,
        max_ahead: AtomicUsize,
    }

    impl Backlog {
        fn observe(&self) {
            let ahead = self
                .loaded
                .load(Ordering::SeqCst)
                .saturating_sub(self.taken.load(Ordering::SeqCst));
            self.max_ahead.fetch_max(ahead, Ordering::SeqCst);
        }
    }

    struct CountingLoader {
        inner: BlankTileLoader,
        backlog: Arc<Backlog>,
    }

    #[async_trait::async_trait]
    impl TileLoader for CountingLoader {
        async fn load(&self, unit: &WorkUnit) -> anyhow::Result<TileArray> {
            let tile = self.inner.load(unit).await?;
            self.backlog.loaded.fetch_add(1, Ordering::SeqCst);
            self.backlog.observe();
            Ok(tile)
        }
    }

    /// Slow first stage that marks a tile as taken.
    struct SlowTake(Arc<Backlog>);

    impl StageKernel for SlowTake {
        fn kind(&self) -> StageKind {
            StageKind::TileGenerator
        }
        fn run(&self, _tile: &mut TileArray, _ctx: &StageContext<'_>) -> anyhow::Result<Option<Value>> {
            self.0.taken.fetch_add(1, Ordering::SeqCst);
            self.0.observe();
            std::thread::sleep(Duration::from_millis(20));
            Ok(None)
        }
    }

    #[tokio::test]
    async fn test_prefetch_stays_bounded() {
        let prefetch_capacity = 2;
        let backlog = Arc::new(Backlog::default());
        let config = Arc::new(test_config());
        let loader = Arc::new(CountingLoader {
            inner: BlankTileLoader::new(config.tile_dims()),
            backlog: backlog.clone(),
        });
        let s = Scheduler::new(
            config,
            loader,
            Metrics::new(),
            SchedulerConfig {
                n_workers: Some(1),
                prefetch_capacity,
                ..settings()
            },
        )
        .with_kernels(KernelSet::default().with_kernel(Arc::new(SlowTake(backlog.clone()))));

        let summary = s.run(StopSignal::new()).await.unwrap();
        assert_eq!(summary.completed(), 12);
        assert_eq!(backlog.loaded.load(Ordering::SeqCst), 12);

        // Buffered tiles plus the one received but not yet in a stage
        let max_ahead = backlog.max_ahead.load(Ordering::SeqCst);
        assert!(max_ahead <= prefetch_capacity + 1, "loaded {max_ahead} tiles ahead");
        assert!(max_ahead >= 1);
    }

    #[tokio::test]
    async fn test_metrics_saved_to_output_path() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("metrics.json");
        let s = scheduler(SchedulerConfig {
            enable_metrics: true,
            metrics_output_path: Some(path.clone()),
            ..settings()
        });
        s.run(StopSignal::new()).await.unwrap();

        let saved: Value = serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(saved["units_processed"], 12);
    }

    #[test]
    fn test_estimate_counts_distinct_regions() {
        let s = scheduler(SchedulerConfig {
            region_indexes: Some(vec![1, 2, 1]),
            ..settings()
        });
        let estimate = s.estimate_total_work().unwrap();
        assert_eq!(estimate.regions, 2);
        assert_eq!(estimate.total_units, 8);
    }

    #[test]
    fn test_estimate() {
        let s = scheduler(SchedulerConfig {
            gpus: Some(vec![0, 1]),
            prefetch_capacity: 2,
            ..settings()
        });
        let estimate = s.estimate_total_work().unwrap();
        assert_eq!(estimate.total_units, 12);
        assert_eq!(estimate.regions, 3);
        assert_eq!(estimate.n_workers, 2);
        // 2 cycles x 3 z x 2 channels x 12 x 16 f32
        assert_eq!(estimate.tile_bytes, 2 * 3 * 2 * 12 * 16 * 4);
        assert_eq!(estimate.peak_bytes_per_worker, estimate.tile_bytes * 3);
        assert!(estimate.to_string().contains("Work units: 12"));
    }

    #[test]
    fn test_run_state_terminal() {
        assert!(RunState::Done.is_terminal());
        assert!(RunState::Failed.is_terminal());
        assert!(!RunState::Running.is_terminal());
    }
}
