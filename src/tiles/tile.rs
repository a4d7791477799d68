//! Core data types for one map tile

use crate::core::geo::{CropRect, PixelSize, TileKey};
use std::any::Any;
use std::fmt;
use std::sync::Arc;

/// Decoded image handle produced by a [`crate::tiles::decoder::TileDecoder`].
///
/// The concrete pixel type is owned by the decoder (an `image::RgbaImage`,
/// a GPU texture id, the raw bytes...); the core only moves the handle
/// around. Cloning is cheap.
#[derive(Clone)]
pub struct TileImage {
    size: PixelSize,
    byte_len: usize,
    handle: Arc<dyn Any + Send + Sync>,
}

impl TileImage {
    pub fn new<T: Any + Send + Sync>(size: PixelSize, byte_len: usize, handle: T) -> Self {
        Self {
            size,
            byte_len,
            handle: Arc::new(handle),
        }
    }

    pub fn size(&self) -> PixelSize {
        self.size
    }

    /// Approximate memory held by the decoded image
    pub fn byte_len(&self) -> usize {
        self.byte_len
    }

    pub fn downcast_ref<T: Any>(&self) -> Option<&T> {
        self.handle.downcast_ref::<T>()
    }

    /// Whether two handles point at the same decoded image
    pub fn ptr_eq(&self, other: &TileImage) -> bool {
        Arc::ptr_eq(&self.handle, &other.handle)
    }
}

impl fmt::Debug for TileImage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TileImage")
            .field("size", &self.size)
            .field("byte_len", &self.byte_len)
            .finish()
    }
}

/// One provider's contribution to a tile
#[derive(Debug, Clone)]
pub struct Layer {
    pub provider_id: Arc<str>,
    /// None when the provider resolved the tile as blank
    pub image: Option<TileImage>,
    /// Set when the layer is borrowed from an ancestor tile
    pub is_parent: bool,
    /// Part of `image` covering the child footprint when `is_parent` is set
    pub crop: Option<CropRect>,
}

impl Layer {
    pub fn new(provider_id: Arc<str>, image: TileImage) -> Self {
        Self {
            provider_id,
            image: Some(image),
            is_parent: false,
            crop: None,
        }
    }

    pub fn blank(provider_id: Arc<str>) -> Self {
        Self {
            provider_id,
            image: None,
            is_parent: false,
            crop: None,
        }
    }

    /// Copy of this layer used to paint a descendant tile
    pub fn as_parent(&self, crop: CropRect) -> Self {
        Self {
            provider_id: self.provider_id.clone(),
            image: self.image.clone(),
            is_parent: true,
            crop: Some(crop),
        }
    }

    pub fn is_blank(&self) -> bool {
        self.image.is_none()
    }
}

/// Content of one tile: zero or more composited layers
#[derive(Debug, Clone)]
pub struct Tile {
    key: TileKey,
    layers: Vec<Layer>,
}

impl Tile {
    /// Unresolved tile, returned for every cache miss
    pub fn empty(key: TileKey) -> Self {
        Self {
            key,
            layers: Vec::new(),
        }
    }

    pub fn with_layers(key: TileKey, layers: Vec<Layer>) -> Self {
        Self { key, layers }
    }

    pub fn key(&self) -> TileKey {
        self.key
    }

    pub fn layers(&self) -> &[Layer] {
        &self.layers
    }

    pub fn push_layer(&mut self, layer: Layer) {
        self.layers.push(layer);
    }

    /// True while no provider has resolved this tile
    pub fn is_empty(&self) -> bool {
        self.layers.is_empty()
    }

    pub fn not_empty(&self) -> bool {
        !self.is_empty()
    }

    /// Resolved, but no layer carries imagery
    pub fn is_blank(&self) -> bool {
        !self.layers.is_empty() && self.layers.iter().all(Layer::is_blank)
    }

    /// Decoded images in paint order
    pub fn images(&self) -> impl Iterator<Item = &TileImage> {
        self.layers.iter().filter_map(|layer| layer.image.as_ref())
    }

    pub fn byte_len(&self) -> usize {
        self.images().map(TileImage::byte_len).sum()
    }

    /// Re-key this tile's layers as a cropped fallback for `child`
    pub fn as_parent_of(&self, child: TileKey, crop: CropRect) -> Tile {
        Tile {
            key: child,
            layers: self
                .layers
                .iter()
                .filter(|layer| !layer.is_parent)
                .map(|layer| layer.as_parent(crop))
                .collect(),
        }
    }
}
