//! Index resolution, tile geometry and work-unit enumeration.

mod spec;
mod tiling;
mod work_unit;

pub use spec::{IndexSpec, RawIndexSpec};
pub use tiling::{tiling_by_name, Snake, TilingStrategy, TILING_MODE_SNAKE};
pub use work_unit::{TileDims, WorkUnit};
