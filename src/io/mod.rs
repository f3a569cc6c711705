//! Tile loading and run recording.

mod loader;
pub mod recorder;

pub use loader::{BlankTileLoader, TileLoader};
pub use recorder::{record_execution, record_processor_data};
