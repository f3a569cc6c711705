//! Progress monitoring and metrics collection.

use crate::pipeline::StageKind;
use serde::{Serialize, Serializer};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::time::interval;

const N_STAGES: usize = StageKind::ORDER.len();

fn serialize_duration<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    serializer.serialize_f64(duration.as_secs_f64())
}

/// Metrics for a pipeline run.
#[derive(Debug, Default)]
pub struct Metrics {
    /// Work units that went through every enabled stage
    pub units_processed: AtomicU64,

    /// Work units that failed to load or process
    pub units_failed: AtomicU64,

    /// Raw tiles handed to workers
    pub tiles_loaded: AtomicU64,

    /// Raw tile bytes handed to workers
    pub bytes_loaded: AtomicU64,

    /// Workers that ran their logging initializer
    pub workers_initialized: AtomicU64,

    /// Stage executions across all units
    pub stages_run: AtomicU64,

    /// Disabled stage slots across all units
    pub stages_skipped: AtomicU64,

    /// Start time
    start_time: Option<Instant>,

    /// Time spent loading tiles (microseconds)
    pub load_us: AtomicU64,

    /// Time spent per stage (microseconds), indexed by [`StageKind::position`]
    stage_us: [AtomicU64; N_STAGES],
}

impl Metrics {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            start_time: Some(Instant::now()),
            ..Default::default()
        })
    }

    pub fn add_unit_processed(&self) {
        self.units_processed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_unit_failed(&self) {
        self.units_failed.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a loaded tile and its size.
    pub fn add_tile_loaded(&self, bytes: u64) {
        self.tiles_loaded.fetch_add(1, Ordering::Relaxed);
        self.bytes_loaded.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn add_worker_initialized(&self) {
        self.workers_initialized.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_stages_skipped(&self, count: u64) {
        self.stages_skipped.fetch_add(count, Ordering::Relaxed);
    }

    pub fn add_load_time(&self, duration: Duration) {
        self.load_us.fetch_add(duration.as_micros() as u64, Ordering::Relaxed);
    }

    /// Record one execution of `stage`.
    pub fn add_stage_time(&self, stage: StageKind, duration: Duration) {
        self.stages_run.fetch_add(1, Ordering::Relaxed);
        self.stage_us[stage.position()].fetch_add(duration.as_micros() as u64, Ordering::Relaxed);
    }

    pub fn elapsed(&self) -> Duration {
        self.start_time.map_or(Duration::ZERO, |t| t.elapsed())
    }

    pub fn units_per_second(&self) -> f64 {
        let units = self.units_processed.load(Ordering::Relaxed);
        let elapsed = self.elapsed().as_secs_f64();
        if elapsed > 0.0 {
            units as f64 / elapsed
        } else {
            0.0
        }
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            units_processed: self.units_processed.load(Ordering::Relaxed),
            units_failed: self.units_failed.load(Ordering::Relaxed),
            tiles_loaded: self.tiles_loaded.load(Ordering::Relaxed),
            bytes_loaded: self.bytes_loaded.load(Ordering::Relaxed),
            workers_initialized: self.workers_initialized.load(Ordering::Relaxed),
            stages_run: self.stages_run.load(Ordering::Relaxed),
            stages_skipped: self.stages_skipped.load(Ordering::Relaxed),
            elapsed: self.elapsed(),
            units_per_second: self.units_per_second(),
            load_secs: self.load_us.load(Ordering::Relaxed) as f64 / 1_000_000.0,
            stage_secs: StageKind::ORDER
                .iter()
                .map(|&kind| {
                    let us = self.stage_us[kind.position()].load(Ordering::Relaxed);
                    (kind, us as f64 / 1_000_000.0)
                })
                .collect(),
        }
    }
}

/// Snapshot of metrics at a point in time.
#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    pub units_processed: u64,
    pub units_failed: u64,
    pub tiles_loaded: u64,
    pub bytes_loaded: u64,
    pub workers_initialized: u64,
    pub stages_run: u64,
    pub stages_skipped: u64,
    #[serde(serialize_with = "serialize_duration")]
    pub elapsed: Duration,
    pub units_per_second: f64,
    /// Total time spent loading tiles (seconds, summed across workers)
    pub load_secs: f64,
    /// Total time per stage (seconds, summed across workers), in execution order
    pub stage_secs: Vec<(StageKind, f64)>,
}

impl MetricsSnapshot {
    /// Save metrics to a JSON file.
    pub fn save_to_file(&self, path: &Path) -> anyhow::Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json)?;
        tracing::info!("Metrics saved to {}", path.display());
        Ok(())
    }

    fn stage_total_secs(&self) -> f64 {
        self.stage_secs.iter().map(|(_, s)| s).sum()
    }
}

impl std::fmt::Display for MetricsSnapshot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Units: {} processed, {} failed | Tiles: {} ({:.2} GB) | \
             Rate: {:.2} units/s | Workers: {} | Elapsed: {:.1}s",
            self.units_processed,
            self.units_failed,
            self.tiles_loaded,
            self.bytes_loaded as f64 / (1024.0 * 1024.0 * 1024.0),
            self.units_per_second,
            self.workers_initialized,
            self.elapsed.as_secs_f64(),
        )?;

        let total = self.stage_total_secs();
        if total > 0.0 {
            write!(f, " | Time:")?;
            for (kind, secs) in self.stage_secs.iter().filter(|(_, s)| *s > 0.0) {
                write!(f, " {} {:.0}%", kind, secs / total * 100.0)?;
            }
        }
        Ok(())
    }
}

/// Periodic metrics reporter.
pub struct MetricsReporter {
    metrics: Arc<Metrics>,
    interval_secs: u64,
    total_units: u64,
}

impl MetricsReporter {
    pub fn new(metrics: Arc<Metrics>, interval_secs: u64, total_units: u64) -> Self {
        Self {
            metrics,
            interval_secs,
            total_units,
        }
    }

    /// Report progress every interval until `shutdown` fires or closes.
    pub async fn run(self, mut shutdown: mpsc::Receiver<()>) {
        let mut ticker = interval(Duration::from_secs(self.interval_secs));

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let snapshot = self.metrics.snapshot();
                    let progress = if self.total_units > 0 {
                        (snapshot.units_processed + snapshot.units_failed) as f64
                            / self.total_units as f64
                            * 100.0
                    } else {
                        0.0
                    };

                    tracing::info!("[{:.1}%] {}", progress, snapshot);
                }
                _ = shutdown.recv() => {
                    tracing::info!("Final: {}", self.metrics.snapshot());
                    break;
                }
            }
        }
    }

    pub fn print_summary(&self) {
        let snapshot = self.metrics.snapshot();

        println!("\n=== Pipeline Summary ===");
        println!("Total time: {:.1}s", snapshot.elapsed.as_secs_f64());
        println!("Units processed: {}/{}", snapshot.units_processed, self.total_units);
        println!("Units failed: {}", snapshot.units_failed);
        println!("Workers initialized: {}", snapshot.workers_initialized);
        println!(
            "Data loaded: {} tiles, {:.2} GB",
            snapshot.tiles_loaded,
            snapshot.bytes_loaded as f64 / (1024.0 * 1024.0 * 1024.0)
        );
        println!("Processing rate: {:.2} units/s", snapshot.units_per_second);
        println!("Stages: {} run, {} skipped", snapshot.stages_run, snapshot.stages_skipped);

        let total = snapshot.stage_total_secs() + snapshot.load_secs;
        if total > 0.0 {
            println!("\n--- Time Breakdown ---");
            println!(
                "{:<20}{:>7.1}s ({:>5.1}%)",
                "load",
                snapshot.load_secs,
                snapshot.load_secs / total * 100.0
            );
            for (kind, secs) in &snapshot.stage_secs {
                println!("{:<20}{:>7.1}s ({:>5.1}%)", kind.as_str(), secs, secs / total * 100.0);
            }
        }
        println!("========================\n");
    }
}
