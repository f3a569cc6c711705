//! Raw tile loading.

use crate::index::{TileDims, WorkUnit};
use crate::pipeline::TileArray;
use anyhow::Result;

/// Source of raw tiles.
///
/// Implementations must return arrays shaped `(cycles, z, channels, height,
/// width)`; the tile generator stage rejects anything else.
#[async_trait::async_trait]
pub trait TileLoader: Send + Sync {
    async fn load(&self, unit: &WorkUnit) -> Result<TileArray>;
}

/// Zero-filled tiles for dry runs.
#[derive(Debug, Clone, Copy)]
pub struct BlankTileLoader {
    dims: TileDims,
}

impl BlankTileLoader {
    pub fn new(dims: TileDims) -> Self {
        Self { dims }
    }
}

#[async_trait::async_trait]
impl TileLoader for BlankTileLoader {
    async fn load(&self, _unit: &WorkUnit) -> Result<TileArray> {
        Ok(TileArray::zeros(self.dims.shape()))
    }
}
