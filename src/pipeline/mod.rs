//! Tile scheduling, stage execution and metrics.

mod kernels;
mod metrics;
mod resources;
mod scheduler;
mod stages;
mod summary;
mod tile_processor;

pub use kernels::{
    BestFocusKernel, CellObject, ChannelStats, CropKernel, CytometryKernel, DeconvolutionKernel,
    DriftCompensationKernel, KernelSet, StageKernel, SummaryKernel, TileArray, TileGeneratorKernel,
};
pub use metrics::{Metrics, MetricsReporter, MetricsSnapshot};
pub use resources::{ResourcePlan, WorkerSlot};
pub use scheduler::{RunState, Scheduler, SchedulerConfig, StopSignal, WorkEstimate};
pub use stages::{DeconParams, StageContext, StageGraph, StageKind, StageSpec};
pub use summary::{RunSummary, TileReport};
pub use tile_processor::TileProcessor;
