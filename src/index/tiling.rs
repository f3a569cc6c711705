//! Tile coordinate strategies.
//!
//! A strategy maps a 0-based linear tile index within a region onto `(x, y)`
//! grid coordinates. Strategies are stateless and looked up by the tiling mode
//! name stored in the experiment configuration.

use crate::error::ConfigError;
use std::fmt::Debug;

/// Name of the serpentine acquisition order.
pub const TILING_MODE_SNAKE: &str = "snake";

/// Maps linear tile indexes to grid coordinates.
pub trait TilingStrategy: Debug + Send + Sync {
    /// Mode name as it appears in configuration.
    fn name(&self) -> &'static str;

    /// Coordinates of `tile_index` in a `width` x `height` region.
    ///
    /// Callers guarantee `tile_index < width * height`.
    fn coordinates_from_index(&self, tile_index: usize, width: usize, height: usize)
        -> (usize, usize);
}

/// Row 0 left to right, row 1 right to left, alternating.
///
/// Consecutive indexes are always grid neighbours, which keeps stage travel
/// short when tiles are acquired in index order.
#[derive(Debug, Clone, Copy, Default)]
pub struct Snake;

impl TilingStrategy for Snake {
    fn name(&self) -> &'static str {
        TILING_MODE_SNAKE
    }

    fn coordinates_from_index(
        &self,
        tile_index: usize,
        width: usize,
        _height: usize,
    ) -> (usize, usize) {
        let y = tile_index / width;
        let offset = tile_index % width;
        let x = if y % 2 == 0 { offset } else { width - 1 - offset };
        (x, y)
    }
}

static SNAKE: Snake = Snake;

/// Look up a strategy by mode name.
pub fn tiling_by_name(name: &str) -> Result<&'static dyn TilingStrategy, ConfigError> {
    match name {
        TILING_MODE_SNAKE => Ok(&SNAKE),
        other => Err(ConfigError::UnsupportedMode(other.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_snake_rows_alternate() {
        let s = Snake;
        let coords: Vec<_> = (0..6).map(|i| s.coordinates_from_index(i, 3, 2)).collect();
        assert_eq!(coords, vec![(0, 0), (1, 0), (2, 0), (2, 1), (1, 1), (0, 1)]);
    }

    #[test]
    fn test_snake_is_bijection() {
        let s = Snake;
        for (w, h) in [(1, 1), (1, 5), (5, 1), (3, 4), (7, 7)] {
            let mut seen = HashSet::new();
            for i in 0..w * h {
                let (x, y) = s.coordinates_from_index(i, w, h);
                assert!(x < w && y < h, "({x}, {y}) outside {w}x{h}");
                assert!(seen.insert((x, y)), "duplicate ({x}, {y}) in {w}x{h}");
            }
            assert_eq!(seen.len(), w * h);
        }
    }

    #[test]
    fn test_snake_neighbours_adjacent() {
        let s = Snake;
        let (w, h) = (4, 3);
        for i in 1..w * h {
            let (x0, y0) = s.coordinates_from_index(i - 1, w, h);
            let (x1, y1) = s.coordinates_from_index(i, w, h);
            assert_eq!(x0.abs_diff(x1) + y0.abs_diff(y1), 1);
        }
    }

    #[test]
    fn test_lookup() {
        assert_eq!(tiling_by_name("snake").unwrap().name(), "snake");
        let err = tiling_by_name("raster").unwrap_err();
        assert!(matches!(err, ConfigError::UnsupportedMode(ref m) if m == "raster"));
    }
}
