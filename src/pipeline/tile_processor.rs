//! Per-tile stage execution.

use crate::config::Config;
use crate::error::PipelineError;
use crate::index::WorkUnit;
use crate::pipeline::{
    DeconParams, KernelSet, Metrics, StageContext, StageGraph, StageKind, TileArray, TileReport,
    WorkerSlot,
};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;

/// Runs the enabled stages of a [`StageGraph`] over single tiles.
pub struct TileProcessor {
    config: Arc<Config>,
    graph: StageGraph,
    kernels: KernelSet,
    decon: DeconParams,
    metrics: Arc<Metrics>,
}

impl TileProcessor {
    pub fn new(
        config: Arc<Config>,
        graph: StageGraph,
        kernels: KernelSet,
        decon: DeconParams,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            config,
            graph,
            kernels,
            decon,
            metrics,
        }
    }

    pub fn graph(&self) -> &StageGraph {
        &self.graph
    }

    /// Run every enabled stage over `tile` in order.
    ///
    /// Blocking; call from a blocking thread. The first failing stage aborts
    /// the unit with [`PipelineError::StageFailure`].
    pub fn process(
        &self,
        unit: WorkUnit,
        mut tile: TileArray,
        slot: &WorkerSlot,
    ) -> Result<TileReport, PipelineError> {
        let start = Instant::now();
        let mut applied: Vec<StageKind> = Vec::new();
        let mut outputs = BTreeMap::new();

        for kind in self.graph.enabled() {
            let ctx = StageContext {
                config: &self.config,
                unit: &unit,
                slot,
                decon: &self.decon,
                applied: &applied,
            };

            let stage_start = Instant::now();
            let output = self
                .kernels
                .get(kind)
                .run(&mut tile, &ctx)
                .map_err(|source| PipelineError::StageFailure {
                    unit,
                    stage: kind,
                    source,
                })?;
            self.metrics.add_stage_time(kind, stage_start.elapsed());

            tracing::debug!("{} {} -> {:?}", unit, kind, tile.shape());

            if let Some(output) = output {
                outputs.insert(kind, output);
            }
            applied.push(kind);
        }

        self.metrics
            .add_stages_skipped((StageKind::ORDER.len() - applied.len()) as u64);

        Ok(TileReport {
            unit,
            output_shape: tile.shape().to_vec(),
            stages_run: applied,
            outputs,
            worker_id: slot.worker_id,
            elapsed_secs: start.elapsed().as_secs_f64(),
        })
    }
}
