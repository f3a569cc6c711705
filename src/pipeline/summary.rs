//! Run-wide aggregation of per-tile outputs.

use crate::index::WorkUnit;
use crate::pipeline::{StageKind, StageSpec};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;

/// Output of one work unit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TileReport {
    pub unit: WorkUnit,

    /// Stages applied, in execution order
    pub stages_run: Vec<StageKind>,

    /// Records returned by stage kernels
    pub outputs: BTreeMap<StageKind, Value>,

    /// Tile shape after the last stage: (cycles, z, channels, height, width)
    pub output_shape: Vec<usize>,

    /// Worker that processed the unit
    pub worker_id: usize,

    pub elapsed_secs: f64,
}

/// Aggregated result of a run, keyed by [`WorkUnit::key`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunSummary {
    pub tiles: BTreeMap<String, TileReport>,

    /// Work units scheduled for the run
    pub total_units: usize,

    /// The run was stopped before every unit completed
    pub cancelled: bool,

    pub n_workers: usize,

    pub stages: Vec<StageSpec>,

    pub elapsed_secs: f64,
}

impl RunSummary {
    /// Aggregate reports.
    ///
    /// The run counts as cancelled when fewer reports than `total_units`
    /// arrived. A later report for the same unit replaces the earlier one.
    pub fn aggregate(
        reports: impl IntoIterator<Item = TileReport>,
        total_units: usize,
        n_workers: usize,
        stages: Vec<StageSpec>,
    ) -> Self {
        let mut received = 0;
        let tiles: BTreeMap<String, TileReport> = reports
            .into_iter()
            .inspect(|_| received += 1)
            .map(|report| (report.unit.key(), report))
            .collect();

        Self {
            cancelled: received < total_units,
            tiles,
            total_units,
            n_workers,
            stages,
            elapsed_secs: 0.0,
        }
    }

    pub fn get(&self, unit: &WorkUnit) -> Option<&TileReport> {
        self.tiles.get(&unit.key())
    }

    pub fn completed(&self) -> usize {
        self.tiles.len()
    }

    pub fn is_complete(&self) -> bool {
        !self.cancelled && self.tiles.len() == self.total_units
    }
}

impl fmt::Display for RunSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{} tiles completed by {} workers in {:.1}s{}",
            self.completed(),
            self.total_units,
            self.n_workers,
            self.elapsed_secs,
            if self.cancelled { " (cancelled)" } else { "" }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn report(region_index: usize, tile_index: usize) -> TileReport {
        TileReport {
            unit: WorkUnit {
                region_index,
                tile_index,
                tile_x: tile_index % 2,
                tile_y: tile_index / 2,
            },
            stages_run: vec![],
            outputs: BTreeMap::new(),
            output_shape: vec![1, 1, 1, 4, 4],
            worker_id: 0,
            elapsed_secs: 0.0,
        }
    }

    #[test]
    fn test_aggregate_keys_by_unit() {
        let summary = RunSummary::aggregate(vec![report(0, 1), report(1, 0)], 2, 1, vec![]);
        assert!(summary.is_complete());
        assert_eq!(summary.completed(), 2);
        assert!(summary.tiles.contains_key("R001_X002_Y001"));
        assert!(summary.tiles.contains_key("R002_X001_Y001"));
        assert!(summary.get(&report(0, 1).unit).is_some());
    }

    #[test]
    fn test_cancelled_counts_reports_not_keys() {
        let summary = RunSummary::aggregate(vec![report(0, 1), report(0, 1)], 2, 1, vec![]);
        assert!(!summary.cancelled);
        assert_eq!(summary.completed(), 1);
    }

    #[test]
    fn test_partial_is_cancelled() {
        let summary = RunSummary::aggregate(vec![report(0, 0)], 3, 1, vec![]);
        assert!(summary.cancelled);
        assert!(!summary.is_complete());
        assert!(summary.to_string().contains("1/3"));
    }

    #[test]
    fn test_serializes_with_stage_names() {
        let mut r = report(0, 0);
        r.stages_run = vec![StageKind::Crop];
        r.outputs.insert(StageKind::Crop, serde_json::json!({"offset": [0, 0]}));
        let summary = RunSummary::aggregate(vec![r], 1, 1, vec![]);
        let json = serde_json::to_value(&summary).unwrap();
        assert_eq!(json["tiles"]["R001_X001_Y001"]["stages_run"][0], "crop");
        assert!(json["tiles"]["R001_X001_Y001"]["outputs"]["crop"].is_object());
    }
}
