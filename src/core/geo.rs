use serde::{Deserialize, Serialize};
use std::fmt;

/// Represents a geographical coordinate with latitude and longitude
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GeoPoint {
    pub lat: f64,
    pub lng: f64,
}

impl GeoPoint {
    /// Creates a new GeoPoint coordinate
    pub fn new(lat: f64, lng: f64) -> Self {
        Self { lat, lng }
    }
}

impl Default for GeoPoint {
    fn default() -> Self {
        Self::new(0.0, 0.0)
    }
}

impl fmt::Display for GeoPoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({:.6}, {:.6})", self.lat, self.lng)
    }
}

/// World pixel coordinate at a specific zoom
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct PixelPoint {
    pub x: i64,
    pub y: i64,
}

impl PixelPoint {
    pub fn new(x: i64, y: i64) -> Self {
        Self { x, y }
    }

    pub fn offset(&self, dx: i64, dy: i64) -> PixelPoint {
        PixelPoint::new(self.x + dx, self.y + dy)
    }
}

/// Width and height in pixels (tile sizes, viewport sizes, full-map sizes)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct PixelSize {
    pub width: i64,
    pub height: i64,
}

impl PixelSize {
    pub fn new(width: i64, height: i64) -> Self {
        Self { width, height }
    }

    pub fn square(side: i64) -> Self {
        Self::new(side, side)
    }

    pub fn is_empty(&self) -> bool {
        self.width <= 0 || self.height <= 0
    }
}

/// Column/row of a tile in the grid of one zoom level
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
pub struct TilePos {
    pub x: i64,
    pub y: i64,
}

impl TilePos {
    pub fn new(x: i64, y: i64) -> Self {
        Self { x, y }
    }

    /// Squared grid distance, used for center-out ordering
    pub fn distance_sq(&self, other: &TilePos) -> i64 {
        let dx = self.x - other.x;
        let dy = self.y - other.y;
        dx * dx + dy * dy
    }
}

impl fmt::Display for TilePos {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{{X={},Y={}}}", self.x, self.y)
    }
}

/// Cache and failure-ledger key: one tile at one zoom level
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TileKey {
    pub zoom: u8,
    pub pos: TilePos,
}

impl TileKey {
    pub fn new(zoom: u8, pos: TilePos) -> Self {
        Self { zoom, pos }
    }

    pub fn from_xyz(x: i64, y: i64, zoom: u8) -> Self {
        Self::new(zoom, TilePos::new(x, y))
    }

    /// Bing-style quadkey for this tile
    pub fn quadkey(&self) -> String {
        let mut key = String::with_capacity(self.zoom as usize);
        for i in (1..=self.zoom).rev() {
            let mask = 1_i64.checked_shl(u32::from(i - 1)).unwrap_or(0);
            let mut digit = b'0';
            if self.pos.x & mask != 0 {
                digit += 1;
            }
            if self.pos.y & mask != 0 {
                digit += 2;
            }
            key.push(digit as char);
        }
        key
    }
}

impl fmt::Display for TileKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.zoom, self.pos.x, self.pos.y)
    }
}

/// Sub-rectangle of a tile image, in that image's pixel space
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct CropRect {
    pub x: f64,
    pub y: f64,
    pub width: f64,
    pub height: f64,
}

impl CropRect {
    pub fn new(x: f64, y: f64, width: f64, height: f64) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }

    /// The whole image, no cropping
    pub fn full(size: PixelSize) -> Self {
        Self::new(0.0, 0.0, size.width as f64, size.height as f64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_geo_point_creation() {
        let coord = GeoPoint::new(54.6872, 25.2797);
        assert_eq!(coord.lat, 54.6872);
        assert_eq!(coord.lng, 25.2797);
    }

    #[test]
    fn test_quadkey() {
        assert_eq!(TileKey::from_xyz(3, 5, 3).quadkey(), "213");
        assert_eq!(TileKey::from_xyz(0, 0, 0).quadkey(), "");
    }

    #[test]
    fn test_tile_key_display() {
        assert_eq!(TileKey::from_xyz(10, 12, 5).to_string(), "5/10/12");
    }
}
