//! Work units and tile geometry.

use serde::{Deserialize, Serialize};
use std::fmt;

/// One tile within one region: the unit the scheduler dispatches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct WorkUnit {
    /// 0-based region index
    pub region_index: usize,

    /// 0-based linear tile index within the region
    pub tile_index: usize,

    /// 0-based column in the region grid
    pub tile_x: usize,

    /// 0-based row in the region grid
    pub tile_y: usize,
}

impl WorkUnit {
    /// Stable key used in run summaries, e.g. `R001_X002_Y001`.
    ///
    /// Components are 1-based to match acquisition file naming.
    pub fn key(&self) -> String {
        format!(
            "R{:03}_X{:03}_Y{:03}",
            self.region_index + 1,
            self.tile_x + 1,
            self.tile_y + 1
        )
    }
}

impl fmt::Display for WorkUnit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (tile {})", self.key(), self.tile_index)
    }
}

/// Shape of one raw tile as `(cycles, z, channels, height, width)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TileDims {
    pub cycles: usize,
    pub z: usize,
    pub channels: usize,
    pub height: usize,
    pub width: usize,
}

impl TileDims {
    pub fn shape(&self) -> (usize, usize, usize, usize, usize) {
        (self.cycles, self.z, self.channels, self.height, self.width)
    }

    /// `None` if the element count overflows `usize`.
    pub fn checked_num_elements(&self) -> Option<usize> {
        [self.z, self.channels, self.height, self.width]
            .into_iter()
            .try_fold(self.cycles, usize::checked_mul)
    }

    /// In-memory size of one tile held as `f32`, `None` on overflow.
    pub fn checked_size_bytes(&self) -> Option<u64> {
        self.checked_num_elements()?
            .checked_mul(std::mem::size_of::<f32>())
            .and_then(|n| u64::try_from(n).ok())
    }

    /// Saturates at `usize::MAX`.
    pub fn num_elements(&self) -> usize {
        self.checked_num_elements().unwrap_or(usize::MAX)
    }

    /// Saturates at `u64::MAX`.
    pub fn size_bytes(&self) -> u64 {
        self.checked_size_bytes().unwrap_or(u64::MAX)
    }
}
