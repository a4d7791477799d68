//! The context object a rendering consumer talks to
//!
//! A [`MapSession`] owns one tile matrix, failure ledger and loader. Several
//! sessions can live side by side (one per map widget); nothing here is
//! global. The drawing path (`get_tile_for_draw`) only takes the matrix read
//! lock and never waits on a fetch.

use crate::core::config::{LoaderProfile, PlaceholderStyle, SessionConfig};
use crate::core::constants::MAX_ZOOM;
use crate::core::geo::{CropRect, GeoPoint, PixelSize, TileKey, TilePos};
use crate::prelude::Arc;
use crate::projection::Projection;
use crate::runtime::{AsyncSpawner, TokioSpawner};
use crate::tiles::decoder::{default_decoder, TileDecoder};
use crate::tiles::failures::{FailureLedger, FailureRecord};
use crate::tiles::loader::{
    FetchState, LoaderParts, LoaderStatsSnapshot, TileEvent, TileLoader, TilePriority,
};
use crate::tiles::matrix::TileMatrix;
use crate::tiles::planner::{FramePlan, ViewportPlanner};
use crate::tiles::source::TileProvider;
use crate::tiles::store::{DiskStore, ImportReport, TileStore};
use crate::tiles::tile::{Layer, TileImage};
use crate::{MapError, Result};
use crossbeam_channel::Receiver;
use std::path::{Path, PathBuf};

/// What to paint for one grid cell
#[derive(Debug, Clone)]
pub struct TileForDraw {
    pub key: TileKey,
    /// Layers in paint order; empty when nothing is available yet
    pub layers: Vec<Layer>,
    /// Layers come from an ancestor and must be cropped with `crop`
    pub is_fallback: bool,
    pub crop: CropRect,
    /// Set once the tile failed terminally and no fallback covers it
    pub failure: Option<FailureRecord>,
}

impl TileForDraw {
    /// Bottom-most image
    pub fn image(&self) -> Option<&TileImage> {
        self.images().next()
    }

    pub fn images(&self) -> impl Iterator<Item = &TileImage> {
        self.layers.iter().filter_map(|layer| layer.image.as_ref())
    }

    /// Nothing drawable: paint the placeholder style instead
    pub fn needs_placeholder(&self) -> bool {
        self.image().is_none()
    }

    pub fn is_failed(&self) -> bool {
        self.failure.is_some()
    }
}

/// Fluent construction of a [`MapSession`]
pub struct SessionBuilder {
    provider: Arc<dyn TileProvider>,
    profile: LoaderProfile,
    store: Option<Arc<dyn TileStore>>,
    disk_root: Option<PathBuf>,
    decoder: Option<Arc<dyn TileDecoder>>,
    spawner: Option<Arc<dyn AsyncSpawner>>,
    zoom: Option<u8>,
}

impl SessionBuilder {
    pub fn new(provider: Arc<dyn TileProvider>) -> Self {
        Self {
            provider,
            profile: LoaderProfile::default(),
            store: None,
            disk_root: None,
            decoder: None,
            spawner: None,
            zoom: None,
        }
    }

    pub fn with_profile(mut self, profile: LoaderProfile) -> Self {
        self.profile = profile;
        self
    }

    pub fn with_config(self, config: SessionConfig) -> Self {
        self.with_profile(LoaderProfile::Custom(config))
    }

    pub fn with_store(mut self, store: Arc<dyn TileStore>) -> Self {
        self.store = Some(store);
        self.disk_root = None;
        self
    }

    /// Opens a [`DiskStore`] at `root` during [`Self::build`]
    pub fn with_disk_store(mut self, root: impl Into<PathBuf>) -> Self {
        self.disk_root = Some(root.into());
        self.store = None;
        self
    }

    pub fn with_decoder(mut self, decoder: Arc<dyn TileDecoder>) -> Self {
        self.decoder = Some(decoder);
        self
    }

    /// Runtime for the fetch workers; defaults to the caller's tokio runtime
    pub fn with_spawner(mut self, spawner: Arc<dyn AsyncSpawner>) -> Self {
        self.spawner = Some(spawner);
        self
    }

    /// Active zoom from the start; eviction keeps a window around it
    pub fn with_zoom(mut self, zoom: u8) -> Self {
        self.zoom = Some(zoom.min(MAX_ZOOM));
        self
    }

    pub fn build(self) -> Result<MapSession> {
        let config = self.profile.resolve();
        config.validate()?;

        let store = match (self.store, self.disk_root) {
            (Some(store), _) => Some(store),
            (None, Some(root)) => Some(Arc::new(DiskStore::open(root)?) as Arc<dyn TileStore>),
            (None, None) => None,
        };
        let spawner = match self.spawner {
            Some(spawner) => spawner,
            None => TokioSpawner::shared_current()?,
        };

        let matrix = TileMatrix::new();
        let ledger = Arc::new(FailureLedger::new(
            config.retry_cap,
            config.failure_ledger_capacity,
        ));
        let planner = MapSession::planner_for(&config, self.provider.projection());

        let loader = TileLoader::new(LoaderParts {
            config: config.clone(),
            matrix: matrix.clone(),
            ledger: ledger.clone(),
            provider: self.provider.clone(),
            store: store.clone(),
            decoder: self.decoder.unwrap_or_else(default_decoder),
            spawner,
        })?;
        if let Some(zoom) = self.zoom {
            loader.set_zoom_window(zoom, config.levels_keep_in_memory);
        }

        log::info!(
            "map session on {} ({:?}, concurrency {}, store: {})",
            self.provider.id(),
            config.access_mode,
            config.concurrency,
            if store.is_some() { "yes" } else { "no" }
        );

        Ok(MapSession {
            config,
            matrix,
            ledger,
            loader,
            planner,
            store,
            zoom: self.zoom.unwrap_or(0),
        })
    }
}

/// Tile pyramid, loader and planner of one map view
pub struct MapSession {
    config: SessionConfig,
    matrix: TileMatrix,
    ledger: Arc<FailureLedger>,
    loader: TileLoader,
    planner: ViewportPlanner,
    store: Option<Arc<dyn TileStore>>,
    zoom: u8,
}

impl MapSession {
    pub fn builder(provider: Arc<dyn TileProvider>) -> SessionBuilder {
        SessionBuilder::new(provider)
    }

    fn planner_for(config: &SessionConfig, projection: Arc<dyn Projection>) -> ViewportPlanner {
        let fallback_levels = if config.fill_empty_tiles {
            config.max_fallback_levels
        } else {
            0
        };
        ViewportPlanner::new(projection, config.viewport_margin_px, fallback_levels)
    }

    /// Best available content for `zoom`/`pos`: the tile, an ancestor
    /// fallback, or nothing. Never blocks on I/O.
    pub fn get_tile_for_draw(&self, zoom: u8, pos: TilePos) -> TileForDraw {
        let key = TileKey::new(zoom, pos);
        let resolved = self.planner.resolve_or_fallback(&self.matrix, zoom, pos);

        let failure = if resolved.is_empty() {
            self.ledger.get(&key).filter(|record| record.terminal)
        } else {
            None
        };

        TileForDraw {
            key,
            layers: resolved.tile.layers().to_vec(),
            is_fallback: resolved.is_fallback,
            crop: resolved.crop,
            failure,
        }
    }

    /// Fire-and-forget enqueue; false when the request was deduplicated or
    /// `zoom` is past the deepest level. Safe to call while a matrix view is held.
    pub fn request_tile(&self, zoom: u8, pos: TilePos) -> bool {
        self.loader
            .request(TileKey::new(zoom, pos), TilePriority::Visible)
    }

    /// Plans the frame and requests every tile of it, center first
    pub fn request_visible(&self, center: GeoPoint, zoom: u8, viewport: PixelSize) -> FramePlan {
        let plan = self.planner.plan(center, zoom, viewport);
        let queued = self.loader.request_many(plan.keys(), TilePriority::Visible);
        log::trace!(
            "frame at zoom {}: {} tiles, {} queued",
            zoom,
            plan.tiles.len(),
            queued
        );
        plan
    }

    pub fn plan(&self, center: GeoPoint, zoom: u8, viewport: PixelSize) -> FramePlan {
        self.planner.plan(center, zoom, viewport)
    }

    pub fn events(&self) -> Receiver<TileEvent> {
        self.loader.events()
    }

    /// Makes `zoom` the active level and evicts levels outside the window.
    /// Tiles of other levels that finish loading later are evicted once the
    /// queue drains. Returns the number of tiles dropped now.
    pub fn set_zoom(&mut self, zoom: u8) -> usize {
        self.zoom = zoom.min(MAX_ZOOM);
        self.loader
            .set_zoom_window(self.zoom, self.config.levels_keep_in_memory)
    }

    pub fn zoom(&self) -> u8 {
        self.zoom
    }

    pub fn set_levels_kept_in_memory(&mut self, levels: u8) -> usize {
        self.config.levels_keep_in_memory = levels;
        self.loader.set_zoom_window(self.zoom, levels)
    }

    pub fn levels_kept_in_memory(&self) -> u8 {
        self.config.levels_keep_in_memory
    }

    /// Clears the matrix and the failure ledger and invalidates in-flight work
    pub fn reload_map(&self) -> u64 {
        log::info!("reloading map");
        self.loader.reload()
    }

    pub fn set_provider(&mut self, provider: Arc<dyn TileProvider>) -> u64 {
        self.planner = Self::planner_for(&self.config, provider.projection());
        self.loader.set_provider(provider)
    }

    pub fn provider(&self) -> Arc<dyn TileProvider> {
        self.loader.provider()
    }

    pub fn projection(&self) -> &Arc<dyn Projection> {
        self.planner.projection()
    }

    fn store(&self) -> Result<&Arc<dyn TileStore>> {
        self.store
            .as_ref()
            .ok_or_else(|| MapError::Config("session has no tile store".into()))
    }

    /// Writes the whole tile store to an archive; returns the record count
    pub fn export_cache(&self, path: impl AsRef<Path>) -> Result<usize> {
        Ok(self.store()?.export(path.as_ref())?)
    }

    /// Merges an archive into the tile store. Terminal failures are forgotten
    /// afterwards, since imported blobs may now satisfy them.
    pub fn import_cache(&self, path: impl AsRef<Path>) -> Result<ImportReport> {
        let report = self.store()?.import(path.as_ref())?;
        if report.imported + report.replaced > 0 {
            for key in self.ledger.terminal_keys() {
                self.ledger.clear(&key);
            }
        }
        Ok(report)
    }

    /// Deletes the stored tiles of the current provider and its overlays,
    /// then reloads the map
    pub fn clear_cache(&self) -> Result<usize> {
        let store = self.store()?;
        let provider = self.provider();
        let mut removed = store.clear_provider(provider.id())?;
        for overlay in provider.overlays() {
            removed += store.clear_provider(overlay.id())?;
        }
        log::info!("cleared {} stored tiles of {}", removed, provider.id());
        self.loader.reload();
        Ok(removed)
    }

    pub fn failure_for(&self, key: &TileKey) -> Option<FailureRecord> {
        self.ledger.get(key)
    }

    pub fn should_retry(&self, key: &TileKey) -> bool {
        self.ledger.should_retry(key)
    }

    pub fn fetch_state(&self, key: &TileKey) -> Option<FetchState> {
        self.loader.state(key)
    }

    pub fn placeholder_style(&self) -> &PlaceholderStyle {
        &self.config.placeholder
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn matrix(&self) -> &TileMatrix {
        &self.matrix
    }

    pub fn stats(&self) -> LoaderStatsSnapshot {
        self.loader.stats()
    }

    pub fn pending_count(&self) -> usize {
        self.loader.pending_count()
    }

    pub fn cancel_pending(&self) -> u64 {
        self.loader.cancel_pending()
    }

    pub fn generation(&self) -> u64 {
        self.loader.generation()
    }
}
