//! # tilepyramid
//!
//! A slippy-map tile pyramid cache and projection engine.
//!
//! The crate turns geographic viewports into tile grids, fetches the tiles
//! from pluggable providers on a bounded background queue, keeps the decoded
//! results in a zoom-partitioned matrix and answers the renderer's
//! "what should I draw here" question without ever blocking on I/O.
//! Drawing itself is left to the embedding application.

pub mod core;
pub mod prelude;
pub mod projection;
pub mod runtime;
pub mod session;
pub mod tiles;
pub use crate::core::constants;

// Re-export public API
pub use crate::core::{
    config::{AccessMode, LoaderProfile, SessionConfig},
    geo::{GeoPoint, PixelPoint, PixelSize, TileKey, TilePos},
};

pub use projection::{Projection, ProjectionKind};

pub use session::{MapSession, SessionBuilder, TileForDraw};

pub use tiles::{
    DiskStore, FetchError, HttpTileProvider, MemoryStore, ProviderSpec, TileEvent, TileProvider,
    TileStore,
};

pub use runtime::{AsyncSpawner, TokioSpawner};

/// Result type used throughout the library
pub type Result<T> = std::result::Result<T, MapError>;

/// Common error types
#[derive(Debug, thiserror::Error)]
pub enum MapError {
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Store error: {0}")]
    Store(#[from] tiles::StoreError),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Runtime error: {0}")]
    Runtime(String),
}

/// Error type alias for convenience
pub type Error = MapError;
