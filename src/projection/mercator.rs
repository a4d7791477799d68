use super::{clip, Projection};
use crate::core::constants::{MAX_MERCATOR_LATITUDE, TILE_SIZE, WGS84_AXIS, WGS84_FLATTENING};
use crate::core::geo::{GeoPoint, PixelPoint, PixelSize};
use std::f64::consts::PI;

const MIN_LATITUDE: f64 = -MAX_MERCATOR_LATITUDE;
const MIN_LONGITUDE: f64 = -180.0;
const MAX_LONGITUDE: f64 = 180.0;

/// Spherical web Mercator (EPSG:3857) with a square `2^z` grid
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MercatorProjection {
    tile_size: PixelSize,
}

impl MercatorProjection {
    pub fn new() -> Self {
        Self::with_tile_size(TILE_SIZE)
    }

    /// Same projection served as larger (e.g. 512px retina) tiles
    pub fn with_tile_size(side: i64) -> Self {
        Self {
            tile_size: PixelSize::square(side),
        }
    }
}

impl Default for MercatorProjection {
    fn default() -> Self {
        Self::new()
    }
}

impl Projection for MercatorProjection {
    fn tile_size(&self) -> PixelSize {
        self.tile_size
    }

    fn axis(&self) -> f64 {
        WGS84_AXIS
    }

    fn flattening(&self) -> f64 {
        WGS84_FLATTENING
    }

    fn from_lat_lng_to_pixel(&self, lat: f64, lng: f64, zoom: u8) -> PixelPoint {
        let lat = clip(lat, MIN_LATITUDE, MAX_MERCATOR_LATITUDE);
        let lng = clip(lng, MIN_LONGITUDE, MAX_LONGITUDE);

        let x = (lng + 180.0) / 360.0;
        let sin_lat = lat.to_radians().sin();
        let y = 0.5 - ((1.0 + sin_lat) / (1.0 - sin_lat)).ln() / (4.0 * PI);

        let size = self.tile_matrix_size_pixel(zoom);
        let map_size_x = size.width as f64;
        let map_size_y = size.height as f64;

        PixelPoint::new(
            clip(x * map_size_x + 0.5, 0.0, map_size_x - 1.0) as i64,
            clip(y * map_size_y + 0.5, 0.0, map_size_y - 1.0) as i64,
        )
    }

    fn from_pixel_to_lat_lng(&self, x: i64, y: i64, zoom: u8) -> GeoPoint {
        let size = self.tile_matrix_size_pixel(zoom);
        let map_size_x = size.width as f64;
        let map_size_y = size.height as f64;

        let xx = clip(x as f64, 0.0, map_size_x - 1.0) / map_size_x - 0.5;
        let yy = 0.5 - clip(y as f64, 0.0, map_size_y - 1.0) / map_size_y;

        GeoPoint::new(
            90.0 - 360.0 * (-yy * 2.0 * PI).exp().atan() / PI,
            360.0 * xx,
        )
    }
}
