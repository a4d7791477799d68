use super::{clip, grid_side, Projection};
use crate::core::constants::{GRS80_FLATTENING, MAX_MERCATOR_LATITUDE, WGS84_AXIS};
use crate::core::geo::{GeoPoint, PixelPoint, PixelSize};

// the services publish nothing beyond the Mercator band
const MIN_LATITUDE: f64 = -MAX_MERCATOR_LATITUDE;
const MAX_LATITUDE: f64 = MAX_MERCATOR_LATITUDE;
const MIN_LONGITUDE: f64 = -180.0;
const MAX_LONGITUDE: f64 = 180.0;

/// Grid used by the LKS94 (Lithuania TM, GRS80) tile services.
///
/// The tile pyramid is served as a plain linear lat/lng grid: twice as many
/// columns as rows (`2^(z+1) × 2^z`) and 512px tiles.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Lks94Projection {
    tile_size: PixelSize,
}

impl Lks94Projection {
    pub fn new() -> Self {
        Self {
            tile_size: PixelSize::square(512),
        }
    }

    /// Degrees covered by one pixel at `zoom`
    fn scale(&self, zoom: u8) -> f64 {
        360.0 / self.tile_matrix_size_pixel(zoom).width as f64
    }
}

impl Default for Lks94Projection {
    fn default() -> Self {
        Self::new()
    }
}

impl Projection for Lks94Projection {
    fn tile_size(&self) -> PixelSize {
        self.tile_size
    }

    fn axis(&self) -> f64 {
        WGS84_AXIS
    }

    fn flattening(&self) -> f64 {
        GRS80_FLATTENING
    }

    fn from_lat_lng_to_pixel(&self, lat: f64, lng: f64, zoom: u8) -> PixelPoint {
        let lat = clip(lat, MIN_LATITUDE, MAX_LATITUDE);
        let lng = clip(lng, MIN_LONGITUDE, MAX_LONGITUDE);

        let size = self.tile_matrix_size_pixel(zoom);
        let scale = self.scale(zoom);

        let x = ((lng + 180.0) / scale).floor() as i64;
        let y = ((90.0 - lat) / scale).floor() as i64;

        PixelPoint::new(x.clamp(0, size.width - 1), y.clamp(0, size.height - 1))
    }

    fn from_pixel_to_lat_lng(&self, x: i64, y: i64, zoom: u8) -> GeoPoint {
        let scale = self.scale(zoom);
        GeoPoint::new(90.0 - (y as f64 * scale), (x as f64 * scale) - 180.0)
    }

    fn tile_matrix_size_xy(&self, zoom: u8) -> (i64, i64) {
        let rows = grid_side(zoom);
        (2 * rows, rows)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::geo::TilePos;
    use proptest::prelude::*;

    #[test]
    fn test_two_to_one_grid() {
        let proj = Lks94Projection::new();
        assert_eq!(proj.tile_size(), PixelSize::square(512));
        assert_eq!(proj.tile_matrix_size_xy(0), (2, 1));
        assert_eq!(proj.tile_matrix_size_xy(3), (16, 8));
        assert_eq!(proj.tile_matrix_item_count(3), 128);
        assert_eq!(proj.tile_matrix_max_xy(1), TilePos::new(3, 1));
    }

    #[test]
    fn test_linear_scale() {
        let proj = Lks94Projection::new();
        // zoom 0 is 1024 x 512 pixels for 360 x 180 degrees
        assert_eq!(proj.from_lat_lng_to_pixel(0.0, 0.0, 0), PixelPoint::new(512, 256));
        assert_eq!(proj.from_lat_lng_to_pixel(45.0, -180.0, 0), PixelPoint::new(0, 128));

        let back = proj.from_pixel_to_lat_lng(512, 256, 0);
        assert_eq!(back, GeoPoint::new(0.0, 0.0));
    }

    #[test]
    fn test_latitude_clamped_to_mercator_band() {
        let proj = Lks94Projection::new();
        // (90 - 85.05112878) / (360 / 1024) = 14.08
        assert_eq!(proj.from_lat_lng_to_pixel(89.0, 0.0, 0).y, 14);
        assert_eq!(proj.from_lat_lng_to_pixel(90.0, -180.0, 0), PixelPoint::new(0, 14));
        assert_eq!(
            proj.from_lat_lng_to_pixel(-90.0, 180.0, 0),
            PixelPoint::new(1023, 497)
        );
    }

    proptest! {
        #[test]
        fn prop_round_trip_within_one_pixel(
            lat in -85.0f64..85.0,
            lng in -179.9f64..179.9,
            zoom in 0u8..=18,
        ) {
            let proj = Lks94Projection::new();
            let pixel = proj.from_lat_lng_to_pixel(lat, lng, zoom);
            let back = proj.from_pixel_to_lat_lng(pixel.x, pixel.y, zoom);

            let res = proj.scale(zoom);
            prop_assert!((back.lat - lat).abs() <= res + 1e-9);
            prop_assert!((back.lng - lng).abs() <= res + 1e-9);
        }
    }
}
