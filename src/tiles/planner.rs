//! Which tiles a frame needs, and what to paint while they load
//!
//! The planner is pure: it reads the [`TileMatrix`] but never mutates it and
//! never waits on a fetch.

use crate::core::constants::MAX_ZOOM;
use crate::core::geo::{CropRect, GeoPoint, PixelPoint, PixelSize, TileKey, TilePos};
use crate::projection::Projection;
use crate::tiles::matrix::TileMatrix;
use crate::tiles::tile::Tile;
use std::sync::Arc;

/// Outcome of [`ViewportPlanner::resolve_or_fallback`]
#[derive(Debug, Clone)]
pub struct Resolved {
    /// Requested tile, a re-keyed ancestor, or the empty tile
    pub tile: Tile,
    pub is_fallback: bool,
    /// Key of the ancestor providing the image
    pub ancestor: Option<TileKey>,
    /// Part of the image covering the requested footprint, in the image's
    /// pixel space
    pub crop: CropRect,
}

impl Resolved {
    /// Nothing to paint but a placeholder
    pub fn is_empty(&self) -> bool {
        self.tile.is_empty()
    }
}

/// One tile of a frame and where it lands on screen
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlannedTile {
    pub pos: TilePos,
    /// Tile top-left relative to the viewport top-left
    pub offset: PixelPoint,
}

/// Visible tiles of one frame, center-out
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FramePlan {
    pub zoom: u8,
    /// World pixel under the viewport top-left
    pub origin: PixelPoint,
    pub tile_size: PixelSize,
    pub tiles: Vec<PlannedTile>,
}

impl FramePlan {
    pub fn keys(&self) -> impl Iterator<Item = TileKey> + '_ {
        self.tiles.iter().map(move |t| TileKey::new(self.zoom, t.pos))
    }
}

#[derive(Debug, Clone)]
pub struct ViewportPlanner {
    projection: Arc<dyn Projection>,
    margin_px: i64,
    max_fallback_levels: u8,
}

impl ViewportPlanner {
    pub fn new(projection: Arc<dyn Projection>, margin_px: i64, max_fallback_levels: u8) -> Self {
        Self {
            projection,
            margin_px: margin_px.max(0),
            max_fallback_levels,
        }
    }

    pub fn projection(&self) -> &Arc<dyn Projection> {
        &self.projection
    }

    pub fn max_fallback_levels(&self) -> u8 {
        self.max_fallback_levels
    }

    /// World pixel of the viewport's top-left corner
    fn origin(&self, center: GeoPoint, zoom: u8, viewport: PixelSize) -> PixelPoint {
        let center = self
            .projection
            .from_lat_lng_to_pixel(center.lat, center.lng, zoom);
        center.offset(-viewport.width / 2, -viewport.height / 2)
    }

    /// Tile positions covering the viewport plus the margin, nearest to the
    /// center first. Ties are broken by row, then column.
    pub fn visible_tiles(&self, center: GeoPoint, zoom: u8, viewport: PixelSize) -> Vec<TilePos> {
        if viewport.is_empty() || zoom > MAX_ZOOM {
            return Vec::new();
        }

        let proj = &self.projection;
        let origin = self.origin(center, zoom, viewport);
        let top_left = origin.offset(-self.margin_px, -self.margin_px);
        let bottom_right = origin.offset(
            viewport.width - 1 + self.margin_px,
            viewport.height - 1 + self.margin_px,
        );

        let min = proj.tile_matrix_min_xy(zoom);
        let max = proj.tile_matrix_max_xy(zoom);
        let first = proj.from_pixel_to_tile_xy(top_left);
        let last = proj.from_pixel_to_tile_xy(bottom_right);

        let (x0, x1) = (first.x.max(min.x), last.x.min(max.x));
        let (y0, y1) = (first.y.max(min.y), last.y.min(max.y));
        if x0 > x1 || y0 > y1 {
            return Vec::new();
        }

        let center_px = proj.from_lat_lng_to_pixel(center.lat, center.lng, zoom);
        let center_tile = proj.from_pixel_to_tile_xy(center_px);

        let mut tiles: Vec<TilePos> = (y0..=y1)
            .flat_map(|y| (x0..=x1).map(move |x| TilePos::new(x, y)))
            .collect();
        tiles.sort_by_key(|pos| (pos.distance_sq(&center_tile), pos.y, pos.x));
        tiles
    }

    /// [`Self::visible_tiles`] with screen offsets
    pub fn plan(&self, center: GeoPoint, zoom: u8, viewport: PixelSize) -> FramePlan {
        let origin = self.origin(center, zoom, viewport);
        let tiles = self
            .visible_tiles(center, zoom, viewport)
            .into_iter()
            .map(|pos| {
                let world = self.projection.from_tile_xy_to_pixel(pos);
                PlannedTile {
                    pos,
                    offset: PixelPoint::new(world.x - origin.x, world.y - origin.y),
                }
            })
            .collect();

        FramePlan {
            zoom,
            origin,
            tile_size: self.projection.tile_size(),
            tiles,
        }
    }

    /// The tile at `zoom`/`pos` if loaded, else the nearest loaded ancestor
    /// within `max_fallback_levels`, cropped to this tile's footprint.
    pub fn resolve_or_fallback(&self, matrix: &TileMatrix, zoom: u8, pos: TilePos) -> Resolved {
        let key = TileKey::new(zoom, pos);
        let tile_size = self.projection.tile_size();
        if zoom > MAX_ZOOM {
            return Resolved {
                tile: Tile::empty(key),
                is_fallback: false,
                ancestor: None,
                crop: CropRect::full(tile_size),
            };
        }
        let view = matrix.read();

        if let Some(tile) = view.get_ref(zoom, pos).filter(|t| t.not_empty()) {
            return Resolved {
                tile: tile.clone(),
                is_fallback: false,
                ancestor: None,
                crop: CropRect::full(tile_size),
            };
        }

        // cumulative children per axis between the ancestor and `zoom`
        let (mut ix, mut iy) = (1_i64, 1_i64);
        let mut level = zoom;

        for _ in 0..self.max_fallback_levels {
            if level == 0 {
                break;
            }
            let (rx, ry) = self.projection.tile_ratio(level);
            ix *= rx;
            iy *= ry;
            level -= 1;

            let ancestor_pos = TilePos::new(pos.x.div_euclid(ix), pos.y.div_euclid(iy));
            let Some(ancestor) = view
                .get_ref(level, ancestor_pos)
                .filter(|t| t.not_empty() && !t.is_blank())
            else {
                continue;
            };

            let (w, h) = (tile_size.width as f64, tile_size.height as f64);
            let xoff = pos.x - ancestor_pos.x * ix;
            let yoff = pos.y - ancestor_pos.y * iy;
            let crop = CropRect::new(
                xoff as f64 * w / ix as f64,
                yoff as f64 * h / iy as f64,
                w / ix as f64,
                h / iy as f64,
            );

            return Resolved {
                tile: ancestor.as_parent_of(key, crop),
                is_fallback: true,
                ancestor: Some(TileKey::new(level, ancestor_pos)),
                crop,
            };
        }

        Resolved {
            tile: Tile::empty(key),
            is_fallback: false,
            ancestor: None,
            crop: CropRect::full(tile_size),
        }
    }
}
