//! Prelude module for common tilepyramid types and traits
//!
//! This module re-exports the most commonly used types, traits, and functions
//! for easy importing with `use tilepyramid::prelude::*;`

pub use crate::core::{
    config::{AccessMode, Backoff, LoaderProfile, PlaceholderStyle, Rgba, SessionConfig},
    geo::{CropRect, GeoPoint, PixelPoint, PixelSize, TileKey, TilePos},
};

pub use crate::projection::{
    EllipsoidMercatorProjection, Lks94Projection, MercatorProjection, Projection, ProjectionKind,
};

pub use crate::tiles::{
    DiskStore, FailureRecord, FetchError, FetchState, FramePlan, HttpTileProvider, ImportReport,
    Layer, MemoryStore, PlannedTile, ProviderSpec, Tile, TileDecoder, TileEvent, TileImage,
    TileMatrix, TilePriority, TileProvider, TileStore,
};

pub use crate::runtime::{spawn, AsyncHandle, AsyncSpawner, TokioSpawner};

pub use crate::session::{MapSession, SessionBuilder, TileForDraw};

pub use crate::{Error as MapError, Result};

pub use std::{
    pin::Pin,
    sync::Arc,
    time::{Duration, Instant},
};

pub use fxhash::{FxHashMap as HashMap, FxHashSet as HashSet};

pub use futures::Future;
