pub mod decoder;
pub mod failures;
pub mod loader;
pub mod matrix;
pub mod planner;
pub mod source;
pub mod store;
pub mod tile;

// Re-exports for convenience
pub use decoder::{default_decoder, RawDecoder, TileDecoder};
#[cfg(feature = "image-decode")]
pub use decoder::ImageDecoder;
pub use failures::{FailureLedger, FailureRecord};
pub use loader::{FetchState, LoaderStatsSnapshot, TileEvent, TileLoader, TilePriority};
pub use matrix::TileMatrix;
pub use planner::{FramePlan, PlannedTile, Resolved, ViewportPlanner};
pub use source::{FetchError, HttpTileProvider, ProviderSpec, TileProvider};
pub use store::{DiskStore, ImportReport, MemoryStore, StoreEntry, StoreError, TileStore};
pub use tile::{Layer, Tile, TileImage};
