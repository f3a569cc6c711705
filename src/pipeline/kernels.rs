//! Stage kernels.
//!
//! A [`StageKernel`] transforms one tile in place and may return a JSON record
//! that ends up in the run summary. Kernels run on blocking threads and must
//! accept input from which any upstream stage was skipped.
//!
//! The built-in kernels are reference implementations meant for dry runs and
//! tests. Production numeric kernels are plugged in with
//! [`KernelSet::with_kernel`].

use crate::config::ChannelCoordinate;
use crate::pipeline::{StageContext, StageKind};
use anyhow::{bail, Result};
use ndarray::{s, Array2, Array5, ArrayView2, Axis, Zip};
use rayon::prelude::*;
use serde::Serialize;
use serde_json::{json, Value};
use std::sync::Arc;

/// Tile layout: (cycles, z, channels, height, width).
pub type TileArray = Array5<f32>;

/// Implementation of one stage.
pub trait StageKernel: Send + Sync {
    fn kind(&self) -> StageKind;

    /// Process `tile` in place, optionally returning a summary record.
    fn run(&self, tile: &mut TileArray, ctx: &StageContext<'_>) -> Result<Option<Value>>;
}

/// One kernel per stage kind.
#[derive(Clone)]
pub struct KernelSet {
    kernels: Vec<Arc<dyn StageKernel>>,
}

impl Default for KernelSet {
    fn default() -> Self {
        let kernels: Vec<Arc<dyn StageKernel>> = vec![
            Arc::new(TileGeneratorKernel),
            Arc::new(CropKernel),
            Arc::new(DriftCompensationKernel::default()),
            Arc::new(BestFocusKernel),
            Arc::new(DeconvolutionKernel),
            Arc::new(SummaryKernel),
            Arc::new(CytometryKernel),
        ];
        debug_assert!(kernels.iter().enumerate().all(|(i, k)| k.kind().position() == i));
        Self { kernels }
    }
}

impl KernelSet {
    /// Replace the kernel for `kernel.kind()`.
    pub fn with_kernel(mut self, kernel: Arc<dyn StageKernel>) -> Self {
        let position = kernel.kind().position();
        self.kernels[position] = kernel;
        self
    }

    pub fn get(&self, kind: StageKind) -> &dyn StageKernel {
        self.kernels[kind.position()].as_ref()
    }
}

fn check_coordinate(tile: &TileArray, coord: ChannelCoordinate, what: &str) -> Result<()> {
    let (cycles, _, channels, _, _) = tile.dim();
    if coord.cycle >= cycles || coord.channel >= channels {
        bail!(
            "{} reference (cycle {}, channel {}) is outside the tile ({} cycles, {} channels)",
            what,
            coord.cycle,
            coord.channel,
            cycles,
            channels
        );
    }
    Ok(())
}

/// Maximum projection over z of one (cycle, channel) stack.
fn max_projection(tile: &TileArray, cycle: usize, channel: usize) -> Array2<f32> {
    tile.slice(s![cycle, .., channel, .., ..])
        .fold_axis(Axis(0), f32::MIN, |&acc, &v| acc.max(v))
}

/// Checks the loaded tile against the configured geometry.
pub struct TileGeneratorKernel;

impl StageKernel for TileGeneratorKernel {
    fn kind(&self) -> StageKind {
        StageKind::TileGenerator
    }

    fn run(&self, tile: &mut TileArray, ctx: &StageContext<'_>) -> Result<Option<Value>> {
        let expected = ctx.config.tile_dims().shape();
        if tile.dim() != expected {
            bail!(
                "raw tile shape {:?} does not match configured shape {:?}",
                tile.dim(),
                expected
            );
        }
        Ok(Some(json!({ "shape": tile.shape() })))
    }
}

/// Removes tile overlap, half from each side.
pub struct CropKernel;

impl StageKernel for CropKernel {
    fn kind(&self) -> StageKind {
        StageKind::Crop
    }

    fn run(&self, tile: &mut TileArray, ctx: &StageContext<'_>) -> Result<Option<Value>> {
        let (_, _, _, height, width) = tile.dim();
        let (overlap_x, overlap_y) = (ctx.config.overlap_x(), ctx.config.overlap_y());
        if overlap_x >= width || overlap_y >= height {
            bail!(
                "overlap {}x{} leaves nothing of a {}x{} tile",
                overlap_x,
                overlap_y,
                width,
                height
            );
        }

        let (x0, y0) = (overlap_x / 2, overlap_y / 2);
        let (x1, y1) = (width - (overlap_x - x0), height - (overlap_y - y0));
        *tile = tile.slice(s![.., .., .., y0..y1, x0..x1]).to_owned();

        Ok(Some(json!({ "offset": [x0, y0], "shape": tile.shape() })))
    }
}

/// Aligns every cycle to the reference cycle by integer translation.
///
/// The shift is the one maximizing the mean product of the z max-projections
/// of the reference channel, searched within `max_shift` pixels.
pub struct DriftCompensationKernel {
    pub max_shift: usize,
}

impl Default for DriftCompensationKernel {
    fn default() -> Self {
        Self { max_shift: 4 }
    }
}

/// Overlapping index ranges when `moving` is displaced by `shift` along one axis.
fn overlap(len: usize, shift: isize) -> Option<(usize, usize, usize)> {
    let len = len as isize;
    let lo = (-shift).max(0);
    let hi = len.min(len - shift);
    if lo >= hi {
        return None;
    }
    Some((lo as usize, hi as usize, (lo + shift) as usize))
}

fn best_shift(reference: ArrayView2<f32>, moving: ArrayView2<f32>, max_shift: usize) -> (isize, isize) {
    let (height, width) = reference.dim();
    let r = max_shift as isize;

    let score = |dy: isize, dx: isize| -> Option<f32> {
        let (y0, y1, my) = overlap(height, dy)?;
        let (x0, x1, mx) = overlap(width, dx)?;
        let a = reference.slice(s![y0..y1, x0..x1]);
        let b = moving.slice(s![my..my + (y1 - y0), mx..mx + (x1 - x0)]);
        let total = Zip::from(&a).and(&b).fold(0.0f32, |acc, &p, &q| acc + p * q);
        Some(total / a.len() as f32)
    };

    let mut best = (0, 0);
    let mut best_score = score(0, 0).unwrap_or(f32::MIN);
    for dy in -r..=r {
        for dx in -r..=r {
            if let Some(s) = score(dy, dx) {
                if s > best_score {
                    best_score = s;
                    best = (dy, dx);
                }
            }
        }
    }
    best
}

impl StageKernel for DriftCompensationKernel {
    fn kind(&self) -> StageKind {
        StageKind::DriftCompensation
    }

    fn run(&self, tile: &mut TileArray, ctx: &StageContext<'_>) -> Result<Option<Value>> {
        let reference = ctx.config.drift_compensation_reference();
        check_coordinate(tile, reference, "drift compensation")?;

        let (cycles, _, _, height, width) = tile.dim();
        let reference_image = max_projection(tile, reference.cycle, reference.channel);

        let mut offsets = Vec::with_capacity(cycles);
        for cycle in 0..cycles {
            if cycle == reference.cycle {
                offsets.push([0, 0]);
                continue;
            }
            let moving = max_projection(tile, cycle, reference.channel);
            let (dy, dx) = best_shift(reference_image.view(), moving.view(), self.max_shift);
            offsets.push([dy, dx]);
            if (dy, dx) == (0, 0) {
                continue;
            }

            // Both overlaps exist: best_shift only returns shifts with one.
            if let (Some((y0, y1, my)), Some((x0, x1, mx))) = (overlap(height, dy), overlap(width, dx)) {
                let source = tile.slice(s![cycle, .., .., .., ..]).to_owned();
                let mut target = tile.slice_mut(s![cycle, .., .., .., ..]);
                target.fill(0.0);
                target
                    .slice_mut(s![.., .., y0..y1, x0..x1])
                    .assign(&source.slice(s![.., .., my..my + (y1 - y0), mx..mx + (x1 - x0)]));
            }
        }

        Ok(Some(json!({
            "reference": reference,
            "offsets": offsets,
        })))
    }
}

/// Keeps the z-plane with the largest gradient energy in the reference channel.
pub struct BestFocusKernel;

fn gradient_energy(plane: ArrayView2<f32>) -> f32 {
    let dx = &plane.slice(s![.., 1..]) - &plane.slice(s![.., ..-1]);
    let dy = &plane.slice(s![1.., ..]) - &plane.slice(s![..-1, ..]);
    dx.mapv(|v| v * v).sum() + dy.mapv(|v| v * v).sum()
}

impl StageKernel for BestFocusKernel {
    fn kind(&self) -> StageKind {
        StageKind::BestFocus
    }

    fn run(&self, tile: &mut TileArray, ctx: &StageContext<'_>) -> Result<Option<Value>> {
        let reference = ctx.config.best_focus_reference();
        check_coordinate(tile, reference, "best focus")?;

        let n_z = tile.dim().1;
        if n_z == 0 {
            bail!("tile has no z planes");
        }

        let scores: Vec<f32> = (0..n_z)
            .map(|z| gradient_energy(tile.slice(s![reference.cycle, z, reference.channel, .., ..])))
            .collect();
        let best_z = scores
            .iter()
            .enumerate()
            .fold(0, |best, (z, &s)| if s > scores[best] { z } else { best });

        *tile = tile.slice(s![.., best_z..best_z + 1, .., .., ..]).to_owned();

        Ok(Some(json!({ "best_z": best_z, "scores": scores })))
    }
}

/// Applies the configured output scale.
///
/// Iterative restoration needs the optics-derived PSF and runs in an external
/// kernel; this one only carries the scaling so downstream intensities match.
pub struct DeconvolutionKernel;

impl StageKernel for DeconvolutionKernel {
    fn kind(&self) -> StageKind {
        StageKind::Deconvolution
    }

    fn run(&self, tile: &mut TileArray, ctx: &StageContext<'_>) -> Result<Option<Value>> {
        let scale = ctx.decon.scale_factor;
        tile.mapv_inplace(|v| v * scale);
        Ok(Some(json!({
            "iterations": ctx.decon.n_iter,
            "scale_factor": scale,
        })))
    }
}

/// Intensity statistics of one (cycle, channel) stack.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChannelStats {
    pub cycle: usize,
    pub channel: usize,
    pub min: f32,
    pub max: f32,
    pub mean: f32,
}

/// Per-(cycle, channel) min, max and mean.
pub struct SummaryKernel;

impl StageKernel for SummaryKernel {
    fn kind(&self) -> StageKind {
        StageKind::Summary
    }

    fn run(&self, tile: &mut TileArray, _ctx: &StageContext<'_>) -> Result<Option<Value>> {
        let (cycles, _, channels, _, _) = tile.dim();
        let view = tile.view();

        let pairs: Vec<(usize, usize)> = (0..cycles)
            .flat_map(|c| (0..channels).map(move |ch| (c, ch)))
            .collect();

        let stats: Vec<ChannelStats> = pairs
            .into_par_iter()
            .map(|(cycle, channel)| {
                let stack = view.slice(s![cycle, .., channel, .., ..]);
                let (min, max, sum) = stack.iter().fold(
                    (f32::INFINITY, f32::NEG_INFINITY, 0.0f64),
                    |(lo, hi, sum), &v| (lo.min(v), hi.max(v), sum + v as f64),
                );
                let n = stack.len();
                ChannelStats {
                    cycle,
                    channel,
                    min: if n > 0 { min } else { 0.0 },
                    max: if n > 0 { max } else { 0.0 },
                    mean: if n > 0 { (sum / n as f64) as f32 } else { 0.0 },
                }
            })
            .collect();

        Ok(Some(serde_json::to_value(stats)?))
    }
}

/// One segmented object.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CellObject {
    pub id: usize,
    pub area: usize,
    pub centroid_x: f32,
    pub centroid_y: f32,
    pub nuclei_intensity: f32,
    pub membrane_intensity: Option<f32>,
}

/// Threshold segmentation of the nuclei channel with per-object quantification.
///
/// Pixels brighter than mean + one standard deviation of the nuclei max
/// projection are grouped into 4-connected objects.
pub struct CytometryKernel;

fn label_objects(image: ArrayView2<f32>, threshold: f32) -> Vec<Vec<(usize, usize)>> {
    let (height, width) = image.dim();
    let mut visited = Array2::from_elem((height, width), false);
    let mut objects = Vec::new();

    for y in 0..height {
        for x in 0..width {
            if visited[[y, x]] || image[[y, x]] <= threshold {
                continue;
            }
            let mut pixels = Vec::new();
            let mut stack = vec![(y, x)];
            visited[[y, x]] = true;
            while let Some((py, px)) = stack.pop() {
                pixels.push((py, px));
                let neighbours = [
                    (py.wrapping_sub(1), px),
                    (py + 1, px),
                    (py, px.wrapping_sub(1)),
                    (py, px + 1),
                ];
                for (ny, nx) in neighbours {
                    if ny < height && nx < width && !visited[[ny, nx]] && image[[ny, nx]] > threshold {
                        visited[[ny, nx]] = true;
                        stack.push((ny, nx));
                    }
                }
            }
            objects.push(pixels);
        }
    }
    objects
}

impl StageKernel for CytometryKernel {
    fn kind(&self) -> StageKind {
        StageKind::Cytometry
    }

    fn run(&self, tile: &mut TileArray, ctx: &StageContext<'_>) -> Result<Option<Value>> {
        let reference = ctx.config.cytometry_reference();
        check_coordinate(tile, reference.nuclei, "cytometry nuclei")?;
        if let Some(membrane) = reference.membrane {
            check_coordinate(tile, membrane, "cytometry membrane")?;
        }

        let nuclei = max_projection(tile, reference.nuclei.cycle, reference.nuclei.channel);
        let membrane = reference
            .membrane
            .map(|m| max_projection(tile, m.cycle, m.channel));

        let objects = if nuclei.is_empty() {
            Vec::new()
        } else {
            let mean = nuclei.mean().unwrap_or(0.0);
            let std = nuclei.std(0.0);
            label_objects(nuclei.view(), mean + std)
        };

        let rows: Vec<CellObject> = objects
            .iter()
            .enumerate()
            .map(|(i, pixels)| {
                let area = pixels.len();
                let n = area as f32;
                let (sum_y, sum_x) = pixels
                    .iter()
                    .fold((0.0f32, 0.0f32), |(sy, sx), &(y, x)| (sy + y as f32, sx + x as f32));
                let mean_of = |img: &Array2<f32>| pixels.iter().map(|&(y, x)| img[[y, x]]).sum::<f32>() / n;
                CellObject {
                    id: i + 1,
                    area,
                    centroid_x: sum_x / n,
                    centroid_y: sum_y / n,
                    nuclei_intensity: mean_of(&nuclei),
                    membrane_intensity: membrane.as_ref().map(mean_of),
                }
            })
            .collect();

        Ok(Some(json!({
            "nuclei": reference.nuclei,
            "membrane": reference.membrane,
            "params": reference.params,
            "n_objects": rows.len(),
            "objects": rows,
        })))
    }
}
