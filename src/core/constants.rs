//! Core constants shared by projections, the tile matrix and the loader.
//! Keeping them in a single place makes it easier to tweak engine-wide magic numbers.

/// Default square tile size in pixels.
pub const TILE_SIZE: i64 = 256;

/// Latitude limit of the spherical and ellipsoidal Mercator projections.
pub const MAX_MERCATOR_LATITUDE: f64 = 85.05112878;

/// WGS84 / GRS80 semi-major axis in metres.
pub const WGS84_AXIS: f64 = 6378137.0;

/// WGS84 flattening.
pub const WGS84_FLATTENING: f64 = 1.0 / 298.257223563;

/// GRS80 flattening (LKS94 datum).
pub const GRS80_FLATTENING: f64 = 1.0 / 298.257222101;

/// Highest zoom level any projection is asked to handle.
pub const MAX_ZOOM: u8 = 24;

/// Default number of worker tasks fetching tiles in parallel.
pub const DEFAULT_CONCURRENCY: usize = 4;

/// Default number of zoom levels kept decoded next to the active one.
pub const DEFAULT_LEVELS_KEEP_IN_MEMORY: u8 = 5;

/// Upper bound of remembered failures before the ledger starts dropping the oldest.
pub const DEFAULT_FAILURE_LEDGER_CAPACITY: usize = 4096;

/// Default bound of the tile event channel; events past it are dropped.
pub const DEFAULT_EVENT_CAPACITY: usize = 1024;

/// File extension of blobs written by the disk store.
pub const TILE_FILE_EXTENSION: &str = "tile";

/// Magic bytes at the start of an exported cache archive.
pub const ARCHIVE_MAGIC: &[u8; 8] = b"TPYRAMID";

/// Archive format version written by this crate.
pub const ARCHIVE_VERSION: u32 = 1;
