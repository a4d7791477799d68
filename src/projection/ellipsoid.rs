use super::{clip, Projection};
use crate::core::constants::{TILE_SIZE, WGS84_AXIS, WGS84_FLATTENING};
use crate::core::geo::{GeoPoint, PixelPoint, PixelSize};
use std::f64::consts::{FRAC_PI_2, FRAC_PI_4, PI};

/// Latitude where the ellipsoidal Mercator y reaches ±π
const MAX_LATITUDE: f64 = 85.08405903;
const MIN_LATITUDE: f64 = -MAX_LATITUDE;

const INVERSE_ITERATIONS: usize = 15;
const INVERSE_TOLERANCE: f64 = 1e-12;

/// WGS84 ellipsoidal Mercator (EPSG:3395), as served by Yandex-style sources
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EllipsoidMercatorProjection {
    tile_size: PixelSize,
    eccentricity: f64,
}

impl EllipsoidMercatorProjection {
    pub fn new() -> Self {
        let f = WGS84_FLATTENING;
        Self {
            tile_size: PixelSize::square(TILE_SIZE),
            eccentricity: (2.0 * f - f * f).sqrt(),
        }
    }

    /// Mercator ordinate in radians for a latitude in radians
    fn ordinate(&self, phi: f64) -> f64 {
        let e = self.eccentricity;
        let con = e * phi.sin();
        ((FRAC_PI_4 + phi / 2.0).tan() * ((1.0 - con) / (1.0 + con)).powf(e / 2.0)).ln()
    }

    /// Inverse of [`Self::ordinate`] by fixed-point iteration
    fn latitude(&self, ordinate: f64) -> f64 {
        let e = self.eccentricity;
        let ts = (-ordinate).exp();
        let mut phi = FRAC_PI_2 - 2.0 * ts.atan();
        for _ in 0..INVERSE_ITERATIONS {
            let con = e * phi.sin();
            let next = FRAC_PI_2 - 2.0 * (ts * ((1.0 - con) / (1.0 + con)).powf(e / 2.0)).atan();
            let delta = (next - phi).abs();
            phi = next;
            if delta < INVERSE_TOLERANCE {
                break;
            }
        }
        phi
    }
}

impl Default for EllipsoidMercatorProjection {
    fn default() -> Self {
        Self::new()
    }
}

impl Projection for EllipsoidMercatorProjection {
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
        let lat = clip(lat, MIN_LATITUDE, MAX_LATITUDE);
        let lng = clip(lng, -180.0, 180.0);

        let x = (lng + 180.0) / 360.0;
        let y = 0.5 - self.ordinate(lat.to_radians()) / (2.0 * PI);

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

        GeoPoint::new(self.latitude(yy * 2.0 * PI).to_degrees(), 360.0 * xx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::projection::MercatorProjection;
    use proptest::prelude::*;

    #[test]
    fn test_equator_matches_spherical() {
        let ellipsoid = EllipsoidMercatorProjection::new();
        let sphere = MercatorProjection::new();
        for zoom in [0u8, 5, 12] {
            assert_eq!(
                ellipsoid.from_lat_lng_to_pixel(0.0, 10.0, zoom),
                sphere.from_lat_lng_to_pixel(0.0, 10.0, zoom)
            );
        }
    }

    #[test]
    fn test_ellipsoid_shifts_south_of_sphere() {
        // the ellipsoid ordinate is smaller, so the same latitude lands further south
        let ellipsoid = EllipsoidMercatorProjection::new();
        let sphere = MercatorProjection::new();
        let e = ellipsoid.from_lat_lng_to_pixel(55.75, 37.62, 10);
        let s = sphere.from_lat_lng_to_pixel(55.75, 37.62, 10);
        assert_eq!(e.x, s.x);
        assert!(e.y > s.y);
    }

    #[test]
    fn test_inverse_of_ordinate() {
        let proj = EllipsoidMercatorProjection::new();
        for lat in [-80.0f64, -45.0, 0.0, 33.3, 60.0, 85.0] {
            let phi = lat.to_radians();
            assert!((proj.latitude(proj.ordinate(phi)) - phi).abs() < 1e-10);
        }
    }

    proptest! {
        #[test]
        fn prop_round_trip_within_one_pixel(
            lat in -85.0f64..85.0,
            lng in -180.0f64..180.0,
            zoom in 0u8..=18,
        ) {
            let proj = EllipsoidMercatorProjection::new();
            let pixel = proj.from_lat_lng_to_pixel(lat, lng, zoom);
            let back = proj.from_pixel_to_lat_lng(pixel.x, pixel.y, zoom);

            let again = proj.from_lat_lng_to_pixel(back.lat, back.lng, zoom);
            prop_assert!((again.x - pixel.x).abs() <= 1);
            prop_assert!((again.y - pixel.y).abs() <= 1);

            let size = proj.tile_matrix_size_pixel(zoom);
            prop_assert!((back.lng - lng).abs() <= 360.0 / size.width as f64 + 1e-9);
        }
    }
}
