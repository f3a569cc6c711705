//! Worker pool sizing and device binding.

use crate::error::{ConfigError, PipelineError};
use crate::index::TileDims;
use serde::{Deserialize, Serialize};

/// Resources bound to one worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerSlot {
    pub worker_id: usize,
    /// GPU device index, `None` for CPU-only workers
    pub gpu: Option<usize>,
    /// Memory ceiling in bytes
    pub memory_limit: u64,
}

/// Resolved worker pool layout.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourcePlan {
    pub slots: Vec<WorkerSlot>,
}

impl ResourcePlan {
    /// Resolve the worker pool.
    ///
    /// Without an explicit count there is one worker per GPU, or a single
    /// worker when no GPUs are given. Worker `i` uses `gpus[i % gpus.len()]`.
    pub fn resolve(
        n_workers: Option<usize>,
        gpus: Option<&[i64]>,
        memory_limit: u64,
    ) -> Result<Self, ConfigError> {
        let gpus = gpus
            .map(|values| {
                values
                    .iter()
                    .map(|&g| {
                        usize::try_from(g).map_err(|_| {
                            ConfigError::validation(
                                "gpus",
                                format!("expected 0-based device index >= 0 but found {g}"),
                            )
                        })
                    })
                    .collect::<Result<Vec<_>, _>>()
            })
            .transpose()?
            .filter(|g| !g.is_empty());

        let n_workers = match n_workers {
            Some(0) => return Err(ConfigError::validation("n_workers", "must be > 0")),
            Some(n) => n,
            None => gpus.as_ref().map_or(1, Vec::len),
        };

        let slots = (0..n_workers)
            .map(|worker_id| WorkerSlot {
                worker_id,
                gpu: gpus.as_ref().map(|g| g[worker_id % g.len()]),
                memory_limit,
            })
            .collect();

        Ok(Self { slots })
    }

    pub fn n_workers(&self) -> usize {
        self.slots.len()
    }

    /// Check that one worker can hold its prefetched tiles plus the tile in
    /// flight within its memory ceiling.
    pub fn check_memory(&self, dims: &TileDims, prefetch_capacity: usize) -> Result<(), PipelineError> {
        let per_worker = dims
            .size_bytes()
            .saturating_mul((prefetch_capacity as u64).saturating_add(1));
        match self.slots.first() {
            Some(slot) if per_worker > slot.memory_limit => Err(PipelineError::Resource(format!(
                "{} tiles of {} bytes need {} bytes per worker, above the memory limit of {} bytes",
                prefetch_capacity.saturating_add(1),
                dims.size_bytes(),
                per_worker,
                slot.memory_limit
            ))),
            _ => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_worker_count() {
        let plan = ResourcePlan::resolve(None, Some(&[0, 2]), 1_000).unwrap();
        assert_eq!(plan.n_workers(), 2);
        assert_eq!(plan.slots[0].gpu, Some(0));
        assert_eq!(plan.slots[1].gpu, Some(2));

        let plan = ResourcePlan::resolve(None, None, 1_000).unwrap();
        assert_eq!(plan.n_workers(), 1);
        assert_eq!(plan.slots[0].gpu, None);
    }

    #[test]
    fn test_gpu_round_robin() {
        let plan = ResourcePlan::resolve(Some(5), Some(&[1, 3]), 1_000).unwrap();
        let gpus: Vec<_> = plan.slots.iter().map(|s| s.gpu).collect();
        assert_eq!(gpus, vec![Some(1), Some(3), Some(1), Some(3), Some(1)]);
        assert!(plan.slots.iter().all(|s| s.memory_limit == 1_000));
    }

    #[test]
    fn test_invalid_inputs() {
        assert!(ResourcePlan::resolve(Some(0), None, 1_000).is_err());
        assert!(ResourcePlan::resolve(None, Some(&[-1]), 1_000).is_err());
    }

    #[test]
    fn test_memory_check() {
        let dims = TileDims { cycles: 1, z: 1, channels: 1, height: 10, width: 10 };
        let plan = ResourcePlan::resolve(None, None, 800).unwrap();
        assert!(plan.check_memory(&dims, 1).is_ok());
        assert!(plan.check_memory(&dims, 2).is_err());
    }

    #[test]
    fn test_memory_check_does_not_overflow() {
        let dims = TileDims { cycles: 1, z: 1, channels: 1, height: 1 << 20, width: 1 << 20 };
        let plan = ResourcePlan::resolve(None, None, u64::MAX - 1).unwrap();
        assert!(matches!(
            plan.check_memory(&dims, usize::MAX),
            Err(PipelineError::Resource(_))
        ));
    }
}
