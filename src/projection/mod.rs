//! Geographic ⇄ pixel ⇄ tile coordinate math
//!
//! Every tile source is bound to one [`Projection`]. Projections are pure and
//! stateless: they only ever see integer zoom levels, clamp out-of-range
//! coordinates instead of failing, and can be shared freely between threads
//! behind an `Arc<dyn Projection>`.
//!
//! Available variants:
//! - [`MercatorProjection`]: spherical web Mercator (EPSG:3857), 256px tiles
//! - [`EllipsoidMercatorProjection`]: WGS84 ellipsoidal Mercator, 256px tiles
//! - [`Lks94Projection`]: linear 2:1 grid used by the Lithuanian LKS94 sources,
//!   512px tiles

pub mod ellipsoid;
pub mod lks94;
pub mod mercator;

pub use ellipsoid::EllipsoidMercatorProjection;
pub use lks94::Lks94Projection;
pub use mercator::MercatorProjection;

use crate::core::constants::MAX_ZOOM;
use crate::core::geo::{GeoPoint, PixelPoint, PixelSize, TilePos};
use serde::{Deserialize, Serialize};
use std::f64::consts::PI;
use std::fmt::Debug;
use std::sync::Arc;

/// Capability set shared by every projection variant
pub trait Projection: Send + Sync + Debug {
    /// Pixel size of one tile
    fn tile_size(&self) -> PixelSize;

    /// Semi-major axis of the reference ellipsoid, in metres
    fn axis(&self) -> f64;

    /// Flattening of the reference ellipsoid
    fn flattening(&self) -> f64;

    /// Geographic coordinate to world pixel at `zoom`; input is clamped first
    fn from_lat_lng_to_pixel(&self, lat: f64, lng: f64, zoom: u8) -> PixelPoint;

    /// World pixel at `zoom` back to a geographic coordinate
    fn from_pixel_to_lat_lng(&self, x: i64, y: i64, zoom: u8) -> GeoPoint;

    /// Number of tile columns and rows spanning the whole map at `zoom`
    fn tile_matrix_size_xy(&self, zoom: u8) -> (i64, i64) {
        let n = grid_side(zoom);
        (n, n)
    }

    fn from_pixel_to_tile_xy(&self, p: PixelPoint) -> TilePos {
        let size = self.tile_size();
        TilePos::new(p.x.div_euclid(size.width), p.y.div_euclid(size.height))
    }

    fn from_tile_xy_to_pixel(&self, p: TilePos) -> PixelPoint {
        let size = self.tile_size();
        PixelPoint::new(p.x * size.width, p.y * size.height)
    }

    fn tile_matrix_size_pixel(&self, zoom: u8) -> PixelSize {
        let (cols, rows) = self.tile_matrix_size_xy(zoom);
        let size = self.tile_size();
        PixelSize::new(
            cols.saturating_mul(size.width),
            rows.saturating_mul(size.height),
        )
    }

    fn tile_matrix_item_count(&self, zoom: u8) -> i64 {
        let (cols, rows) = self.tile_matrix_size_xy(zoom);
        cols.saturating_mul(rows)
    }

    /// Smallest valid tile position at `zoom`
    fn tile_matrix_min_xy(&self, _zoom: u8) -> TilePos {
        TilePos::new(0, 0)
    }

    /// Largest valid tile position at `zoom`
    fn tile_matrix_max_xy(&self, zoom: u8) -> TilePos {
        let (cols, rows) = self.tile_matrix_size_xy(zoom);
        TilePos::new(cols - 1, rows - 1)
    }

    /// Whether `pos` lies inside the tile grid of `zoom`
    fn contains_tile(&self, zoom: u8, pos: TilePos) -> bool {
        let min = self.tile_matrix_min_xy(zoom);
        let max = self.tile_matrix_max_xy(zoom);
        pos.x >= min.x && pos.y >= min.y && pos.x <= max.x && pos.y <= max.y
    }

    /// Children per axis between `zoom - 1` and `zoom`
    fn tile_ratio(&self, zoom: u8) -> (i64, i64) {
        if zoom == 0 {
            return (1, 1);
        }
        let (cols, rows) = self.tile_matrix_size_xy(zoom);
        let (parent_cols, parent_rows) = self.tile_matrix_size_xy(zoom - 1);
        ((cols / parent_cols).max(1), (rows / parent_rows).max(1))
    }

    /// Metres covered by one pixel at `lat` and `zoom`
    fn ground_resolution(&self, zoom: u8, lat: f64) -> f64 {
        let width = self.tile_matrix_size_pixel(zoom).width as f64;
        (lat.to_radians().cos() * 2.0 * PI * self.axis()) / width
    }
}

/// Tiles per axis of a square power-of-two grid. Zoom levels past
/// [`MAX_ZOOM`] are treated as `MAX_ZOOM`.
pub fn grid_side(zoom: u8) -> i64 {
    1_i64 << zoom.min(MAX_ZOOM)
}

/// Clips a number to the specified minimum and maximum values
pub fn clip(n: f64, min_value: f64, max_value: f64) -> f64 {
    n.max(min_value).min(max_value)
}

/// Serializable selector for the built-in projections
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProjectionKind {
    Mercator,
    EllipsoidMercator,
    Lks94,
}

impl ProjectionKind {
    pub fn build(&self) -> Arc<dyn Projection> {
        match self {
            Self::Mercator => Arc::new(MercatorProjection::new()),
            Self::EllipsoidMercator => Arc::new(EllipsoidMercatorProjection::new()),
            Self::Lks94 => Arc::new(Lks94Projection::new()),
        }
    }
}

impl Default for ProjectionKind {
    fn default() -> Self {
        Self::Mercator
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_grid_consistency_all_variants() {
        for kind in [
            ProjectionKind::Mercator,
            ProjectionKind::EllipsoidMercator,
            ProjectionKind::Lks94,
        ] {
            let proj = kind.build();
            let tile = proj.tile_size();
            for zoom in 0..=18u8 {
                let (cols, rows) = proj.tile_matrix_size_xy(zoom);
                let px = proj.tile_matrix_size_pixel(zoom);
                assert_eq!(px.width, cols * tile.width, "{:?} z{}", kind, zoom);
                assert_eq!(px.height, rows * tile.height, "{:?} z{}", kind, zoom);
                assert_eq!(proj.tile_matrix_item_count(zoom), cols * rows);
            }
        }
    }

    #[test]
    fn test_zoom_past_max_does_not_overflow() {
        for kind in [
            ProjectionKind::Mercator,
            ProjectionKind::EllipsoidMercator,
            ProjectionKind::Lks94,
        ] {
            let proj = kind.build();
            for zoom in [MAX_ZOOM + 1, 55, 64, u8::MAX] {
                assert_eq!(
                    proj.tile_matrix_size_xy(zoom),
                    proj.tile_matrix_size_xy(MAX_ZOOM)
                );
                let pixel = proj.from_lat_lng_to_pixel(10.0, 20.0, zoom);
                assert_eq!(pixel, proj.from_lat_lng_to_pixel(10.0, 20.0, MAX_ZOOM));
                assert!(proj.contains_tile(zoom, TilePos::new(0, 0)));
            }
        }
    }

    #[test]
    fn test_tile_pixel_round_trip() {
        let proj = MercatorProjection::new();
        for (x, y) in [(0, 0), (3, 7), (1023, 511)] {
            let pos = TilePos::new(x, y);
            assert_eq!(proj.from_pixel_to_tile_xy(proj.from_tile_xy_to_pixel(pos)), pos);
        }
        // floor division for pixels inside a tile
        assert_eq!(
            proj.from_pixel_to_tile_xy(PixelPoint::new(511, 256)),
            TilePos::new(1, 1)
        );
        assert_eq!(
            proj.from_pixel_to_tile_xy(PixelPoint::new(-1, -1)),
            TilePos::new(-1, -1)
        );
    }

    #[test]
    fn test_tile_ratio() {
        assert_eq!(MercatorProjection::new().tile_ratio(5), (2, 2));
        assert_eq!(Lks94Projection::new().tile_ratio(5), (2, 2));
        assert_eq!(Lks94Projection::new().tile_ratio(0), (1, 1));
    }

    #[test]
    fn test_contains_tile() {
        let proj = MercatorProjection::new();
        assert!(proj.contains_tile(2, TilePos::new(3, 3)));
        assert!(!proj.contains_tile(2, TilePos::new(4, 0)));
        assert!(!proj.contains_tile(2, TilePos::new(0, -1)));
    }

    #[test]
    fn test_ground_resolution_equator() {
        let proj = MercatorProjection::new();
        // ~156 km per pixel at zoom 0 on the equator
        let res = proj.ground_resolution(0, 0.0);
        assert!((res - 156_543.03).abs() < 1.0);
        assert!((proj.ground_resolution(1, 0.0) - res / 2.0).abs() < 1e-6);
    }

    #[test]
    fn test_clip() {
        assert_eq!(clip(5.0, 0.0, 1.0), 1.0);
        assert_eq!(clip(-5.0, 0.0, 1.0), 0.0);
        assert_eq!(clip(0.5, 0.0, 1.0), 0.5);
    }
}
