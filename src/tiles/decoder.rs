//! Bytes → [`TileImage`] conversion
//!
//! The core never looks inside an image; it only needs a handle and an
//! approximate memory footprint. Decoding is pluggable so a renderer can
//! upload straight to its own texture type.

use crate::core::geo::PixelSize;
use crate::tiles::source::FetchError;
use crate::tiles::tile::TileImage;
use std::fmt::Debug;
use std::sync::Arc;

pub trait TileDecoder: Send + Sync + Debug {
    /// Decode one non-empty tile payload. `tile_size` is the size advertised
    /// by the provider's projection.
    fn decode(&self, bytes: &[u8], tile_size: PixelSize) -> Result<TileImage, FetchError>;
}

/// Keeps the encoded bytes as the image handle (`Arc<[u8]>`)
#[derive(Debug, Clone, Copy, Default)]
pub struct RawDecoder;

impl TileDecoder for RawDecoder {
    fn decode(&self, bytes: &[u8], tile_size: PixelSize) -> Result<TileImage, FetchError> {
        if bytes.is_empty() {
            return Err(FetchError::Decode("empty payload".into()));
        }
        let data: Arc<[u8]> = Arc::from(bytes);
        Ok(TileImage::new(tile_size, bytes.len(), data))
    }
}

/// Decodes PNG/JPEG payloads into an `image::RgbaImage` handle
#[cfg(feature = "image-decode")]
#[derive(Debug, Clone, Copy, Default)]
pub struct ImageDecoder;

#[cfg(feature = "image-decode")]
impl TileDecoder for ImageDecoder {
    fn decode(&self, bytes: &[u8], tile_size: PixelSize) -> Result<TileImage, FetchError> {
        let decoded =
            image::load_from_memory(bytes).map_err(|err| FetchError::Decode(err.to_string()))?;
        let rgba = decoded.to_rgba8();
        let (width, height) = rgba.dimensions();

        if width as i64 != tile_size.width || height as i64 != tile_size.height {
            log::debug!(
                "tile image is {}x{}, provider advertises {}x{}",
                width,
                height,
                tile_size.width,
                tile_size.height
            );
        }

        let byte_len = rgba.as_raw().len();
        Ok(TileImage::new(
            PixelSize::new(width as i64, height as i64),
            byte_len,
            rgba,
        ))
    }
}

/// Decoder used when the caller does not pick one
pub fn default_decoder() -> Arc<dyn TileDecoder> {
    #[cfg(feature = "image-decode")]
    {
        Arc::new(ImageDecoder)
    }

    #[cfg(not(feature = "image-decode"))]
    {
        Arc::new(RawDecoder)
    }
}
