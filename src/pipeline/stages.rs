//! Per-tile stage graph.
//!
//! Stages always run in the order of [`StageKind::ORDER`]:
//!
//! ```text
//! tile_generator → crop → drift_compensation → best_focus
//!                → deconvolution → summary → cytometry
//! ```
//!
//! Each stage can be switched off, in which case it is skipped entirely and the
//! next enabled stage receives whatever the previous enabled stage produced.

use crate::config::Config;
use crate::error::ConfigError;
use crate::index::WorkUnit;
use crate::options::StageToggles;
use crate::pipeline::WorkerSlot;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Named processing step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageKind {
    TileGenerator,
    Crop,
    DriftCompensation,
    BestFocus,
    Deconvolution,
    Summary,
    Cytometry,
}

impl StageKind {
    /// Execution order.
    pub const ORDER: [StageKind; 7] = [
        StageKind::TileGenerator,
        StageKind::Crop,
        StageKind::DriftCompensation,
        StageKind::BestFocus,
        StageKind::Deconvolution,
        StageKind::Summary,
        StageKind::Cytometry,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            StageKind::TileGenerator => "tile_generator",
            StageKind::Crop => "crop",
            StageKind::DriftCompensation => "drift_compensation",
            StageKind::BestFocus => "best_focus",
            StageKind::Deconvolution => "deconvolution",
            StageKind::Summary => "summary",
            StageKind::Cytometry => "cytometry",
        }
    }

    /// Position in [`StageKind::ORDER`].
    pub fn position(&self) -> usize {
        *self as usize
    }
}

impl fmt::Display for StageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One entry of the stage graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageSpec {
    pub kind: StageKind,
    pub enabled: bool,
    /// Whether the stage accepts input from which upstream stages were skipped.
    pub tolerates_missing_upstream: bool,
}

/// Deconvolution settings.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DeconParams {
    pub n_iter: u32,
    pub scale_factor: f32,
}

impl Default for DeconParams {
    fn default() -> Self {
        Self {
            n_iter: 25,
            scale_factor: 0.5,
        }
    }
}

/// Ordered stage records for a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageGraph {
    stages: Vec<StageSpec>,
}

impl StageGraph {
    /// Graph in fixed stage order. Stages are enabled per `toggles`, and
    /// deconvolution only when `decon.n_iter > 0`.
    pub fn new(toggles: &StageToggles, decon: &DeconParams) -> Self {
        let enabled = |kind: StageKind| match kind {
            StageKind::TileGenerator => toggles.tile_generator,
            StageKind::Crop => toggles.crop,
            StageKind::DriftCompensation => toggles.drift_compensation,
            StageKind::BestFocus => toggles.best_focus,
            StageKind::Deconvolution => decon.n_iter > 0,
            StageKind::Summary => toggles.summary,
            StageKind::Cytometry => toggles.cytometry,
        };

        Self {
            stages: StageKind::ORDER
                .iter()
                .map(|&kind| StageSpec {
                    kind,
                    enabled: enabled(kind),
                    tolerates_missing_upstream: true,
                })
                .collect(),
        }
    }

    /// Every stage disabled.
    pub fn disabled() -> Self {
        Self::new(
            &StageToggles::all(false),
            &DeconParams {
                n_iter: 0,
                ..DeconParams::default()
            },
        )
    }

    pub fn set_enabled(&mut self, kind: StageKind, enabled: bool) -> &mut Self {
        self.stages[kind.position()].enabled = enabled;
        self
    }

    pub fn set_tolerates_missing_upstream(&mut self, kind: StageKind, tolerates: bool) -> &mut Self {
        self.stages[kind.position()].tolerates_missing_upstream = tolerates;
        self
    }

    pub fn is_enabled(&self, kind: StageKind) -> bool {
        self.stages[kind.position()].enabled
    }

    pub fn specs(&self) -> &[StageSpec] {
        &self.stages
    }

    /// Enabled stages in execution order.
    pub fn enabled(&self) -> impl Iterator<Item = StageKind> + '_ {
        self.stages.iter().filter(|s| s.enabled).map(|s| s.kind)
    }

    /// Reject graphs where an enabled stage needs a skipped upstream stage.
    pub fn validate(&self) -> Result<(), ConfigError> {
        for (i, spec) in self.stages.iter().enumerate() {
            if !spec.enabled || spec.tolerates_missing_upstream {
                continue;
            }
            if let Some(missing) = self.stages[..i].iter().find(|s| !s.enabled) {
                return Err(ConfigError::validation(
                    "stages",
                    format!(
                        "stage {} requires upstream stage {} to be enabled",
                        spec.kind, missing.kind
                    ),
                ));
            }
        }
        Ok(())
    }
}

/// Everything a stage kernel may consult while processing one tile.
pub struct StageContext<'a> {
    pub config: &'a Config,
    pub unit: &'a WorkUnit,
    pub slot: &'a WorkerSlot,
    pub decon: &'a DeconParams,
    /// Stages already applied to the tile, in order
    pub applied: &'a [StageKind],
}

impl StageContext<'_> {
    pub fn was_applied(&self, kind: StageKind) -> bool {
        self.applied.contains(&kind)
    }
}
