//! In-memory tile pyramid
//!
//! Tiles are partitioned by zoom level. One `RwLock` guards the structure:
//! render passes share the read side while loader workers take the write side
//! only for the final insert. Reads are recursive, so code holding a
//! [`MatrixView`] may keep calling lookups even while a writer is queued.
//! Each level carries an atomic access stamp so a plain lookup can refresh it
//! without upgrading the lock.

use crate::core::geo::{TileKey, TilePos};
use crate::prelude::{Arc, HashMap, HashSet};
use crate::tiles::tile::Tile;
use parking_lot::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Default)]
struct TileLevel {
    tiles: HashMap<TilePos, Tile>,
    last_access: AtomicU64,
}

impl TileLevel {
    fn touch(&self, stamp: u64) {
        self.last_access.fetch_max(stamp, Ordering::Relaxed);
    }
}

#[derive(Debug, Default)]
struct MatrixInner {
    levels: RwLock<HashMap<u8, TileLevel>>,
    clock: AtomicU64,
}

impl MatrixInner {
    fn tick(&self) -> u64 {
        self.clock.fetch_add(1, Ordering::Relaxed) + 1
    }
}

/// Zoom-partitioned cache of decoded tiles
#[derive(Debug, Clone, Default)]
pub struct TileMatrix {
    inner: Arc<MatrixInner>,
}

impl TileMatrix {
    pub fn new() -> Self {
        Self::default()
    }

    /// Tile at `zoom`/`pos`, or the empty tile when absent
    pub fn get(&self, zoom: u8, pos: TilePos) -> Tile {
        self.read().get(zoom, pos)
    }

    pub fn put(&self, zoom: u8, pos: TilePos, tile: Tile) {
        self.put_if(zoom, pos, tile, || true);
    }

    /// Inserts `tile` only if `accept` holds, evaluated under the write lock.
    /// Returns whether the tile was stored.
    pub fn put_if(
        &self,
        zoom: u8,
        pos: TilePos,
        tile: Tile,
        accept: impl FnOnce() -> bool,
    ) -> bool {
        let stamp = self.inner.tick();
        let mut levels = self.write_levels();
        if !accept() {
            return false;
        }
        let level = levels.entry(zoom).or_default();
        level.touch(stamp);
        level.tiles.insert(pos, tile);
        true
    }

    pub fn remove(&self, key: &TileKey) -> Option<Tile> {
        let mut levels = self.write_levels();
        let level = levels.get_mut(&key.zoom)?;
        let removed = level.tiles.remove(&key.pos);
        if level.tiles.is_empty() {
            levels.remove(&key.zoom);
        }
        removed
    }

    /// Whether a resolved (non-empty) tile is cached for `key`
    pub fn contains(&self, key: &TileKey) -> bool {
        self.read_levels()
            .get(&key.zoom)
            .and_then(|level| level.tiles.get(&key.pos))
            .map(Tile::not_empty)
            .unwrap_or(false)
    }

    /// Drops every tile
    pub fn clear(&self) {
        let mut levels = self.write_levels();
        let count: usize = levels.values().map(|level| level.tiles.len()).sum();
        levels.clear();
        log::debug!("tile matrix cleared, {} tiles dropped", count);
    }

    /// Keeps `current_zoom` plus the `levels_to_keep` most recently used levels
    /// inside `[current_zoom - levels_to_keep, current_zoom + levels_to_keep]`.
    /// Returns the number of tiles dropped.
    pub fn evict_outside_window(&self, current_zoom: u8, levels_to_keep: u8) -> usize {
        let low = current_zoom.saturating_sub(levels_to_keep);
        let high = current_zoom.saturating_add(levels_to_keep);

        let mut levels = self.write_levels();

        let mut candidates: Vec<(u8, u64)> = levels
            .iter()
            .filter(|(zoom, _)| **zoom != current_zoom && (low..=high).contains(*zoom))
            .map(|(zoom, level)| (*zoom, level.last_access.load(Ordering::Relaxed)))
            .collect();

        // most recent first, nearest level wins a tie
        candidates.sort_by(|a, b| {
            b.1.cmp(&a.1)
                .then_with(|| a.0.abs_diff(current_zoom).cmp(&b.0.abs_diff(current_zoom)))
        });

        let mut keep: HashSet<u8> = HashSet::default();
        keep.insert(current_zoom);
        keep.extend(
            candidates
                .iter()
                .take(levels_to_keep as usize)
                .map(|(zoom, _)| *zoom),
        );

        let mut evicted = 0;
        levels.retain(|zoom, level| {
            if keep.contains(zoom) {
                true
            } else {
                evicted += level.tiles.len();
                false
            }
        });

        if evicted > 0 {
            log::debug!(
                "evicted {} tiles outside zoom window {}..={} (active {})",
                evicted,
                low,
                high,
                current_zoom
            );
        }
        evicted
    }

    /// Total number of cached tiles
    pub fn len(&self) -> usize {
        self.read_levels().values().map(|level| level.tiles.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn level_count(&self) -> usize {
        self.read_levels().len()
    }

    /// Zoom levels currently holding tiles, ascending
    pub fn zoom_levels(&self) -> Vec<u8> {
        let mut zooms: Vec<u8> = self.read_levels().keys().copied().collect();
        zooms.sort_unstable();
        zooms
    }

    /// Approximate decoded bytes held by the matrix
    pub fn byte_len(&self) -> usize {
        self.read_levels()
            .values()
            .flat_map(|level| level.tiles.values())
            .map(Tile::byte_len)
            .sum()
    }

    /// Holds the read lock for a whole render pass
    pub fn read(&self) -> MatrixView<'_> {
        MatrixView {
            levels: self.read_levels(),
            stamp: self.inner.tick(),
        }
    }

    fn read_levels(&self) -> RwLockReadGuard<'_, HashMap<u8, TileLevel>> {
        self.inner.levels.read_recursive()
    }

    fn write_levels(&self) -> RwLockWriteGuard<'_, HashMap<u8, TileLevel>> {
        self.inner.levels.write()
    }
}

/// Read-locked view of the matrix; lookups through it never take the lock again
pub struct MatrixView<'a> {
    levels: RwLockReadGuard<'a, HashMap<u8, TileLevel>>,
    stamp: u64,
}

impl MatrixView<'_> {
    pub fn get(&self, zoom: u8, pos: TilePos) -> Tile {
        self.get_ref(zoom, pos)
            .cloned()
            .unwrap_or_else(|| Tile::empty(TileKey::new(zoom, pos)))
    }

    /// Borrowed lookup; `None` when absent
    pub fn get_ref(&self, zoom: u8, pos: TilePos) -> Option<&Tile> {
        let level = self.levels.get(&zoom)?;
        level.touch(self.stamp);
        level.tiles.get(&pos)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::geo::PixelSize;
    use crate::tiles::tile::{Layer, TileImage};
    use std::thread;

    fn tile(zoom: u8, x: i64, y: i64) -> Tile {
        let key = TileKey::from_xyz(x, y, zoom);
        let image = TileImage::new(PixelSize::square(256), 16, vec![zoom; 16]);
        Tile::with_layers(key, vec![Layer::new("test".into(), image)])
    }

    #[test]
    fn test_put_get_clear() {
        let matrix = TileMatrix::new();
        let pos = TilePos::new(3, 4);

        assert!(matrix.get(5, pos).is_empty());
        matrix.put(5, pos, tile(5, 3, 4));

        let got = matrix.get(5, pos);
        assert!(got.not_empty());
        assert_eq!(got.key(), TileKey::new(5, pos));
        assert!(matrix.contains(&TileKey::new(5, pos)));
        assert_eq!(matrix.len(), 1);

        matrix.clear();
        assert!(matrix.get(5, pos).is_empty());
        assert!(matrix.is_empty());
    }

    #[test]
    fn test_empty_tile_does_not_count_as_contained() {
        let matrix = TileMatrix::new();
        let key = TileKey::from_xyz(0, 0, 1);
        matrix.put(1, key.pos, Tile::empty(key));
        assert!(!matrix.contains(&key));
    }

    #[test]
    fn test_remove_drops_empty_level() {
        let matrix = TileMatrix::new();
        matrix.put(2, TilePos::new(1, 1), tile(2, 1, 1));
        assert_eq!(matrix.level_count(), 1);
        assert!(matrix.remove(&TileKey::from_xyz(1, 1, 2)).is_some());
        assert_eq!(matrix.level_count(), 0);
    }

    #[test]
    fn test_concurrent_readers_see_put() {
        let matrix = TileMatrix::new();
        let pos = TilePos::new(7, 7);
        matrix.put(9, pos, tile(9, 7, 7));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let matrix = matrix.clone();
                thread::spawn(move || {
                    for _ in 0..100 {
                        assert!(matrix.get(9, pos).not_empty());
                    }
                })
            })
            .collect();

        for handle in handles {
            handle.join().unwrap();
        }
    }

    #[test]
    fn test_put_if_rejects_under_lock() {
        let matrix = TileMatrix::new();
        let pos = TilePos::new(0, 0);
        assert!(!matrix.put_if(0, pos, tile(0, 0, 0), || false));
        assert!(matrix.is_empty());
        assert!(matrix.put_if(0, pos, tile(0, 0, 0), || true));
        assert!(matrix.contains(&TileKey::new(0, pos)));
    }

    #[test]
    fn test_lookups_inside_view_with_writer_queued() {
        let matrix = TileMatrix::new();
        let pos = TilePos::new(1, 1);
        matrix.put(1, pos, tile(1, 1, 1));

        let view = matrix.read();
        let writer = {
            let matrix = matrix.clone();
            thread::spawn(move || matrix.put(2, TilePos::new(0, 0), tile(2, 0, 0)))
        };
        // give the writer time to queue behind the open view
        thread::sleep(std::time::Duration::from_millis(30));

        assert!(view.get_ref(1, pos).is_some());
        assert!(matrix.contains(&TileKey::new(1, pos)));
        assert!(matrix.get(1, pos).not_empty());

        drop(view);
        writer.join().unwrap();
        assert!(matrix.contains(&TileKey::from_xyz(0, 0, 2)));
    }

    #[test]
    fn test_eviction_keeps_window_around_recent_zoom() {
        let matrix = TileMatrix::new();
        let levels_to_keep = 2;

        // zoom in from 3 to 10, one tile per level
        for zoom in 3..=10u8 {
            matrix.put(zoom, TilePos::new(0, 0), tile(zoom, 0, 0));
            matrix.evict_outside_window(zoom, levels_to_keep);
        }

        let zooms = matrix.zoom_levels();
        assert_eq!(zooms, vec![8, 9, 10]);
        assert!(zooms.iter().all(|z| (8..=12).contains(z)));
    }

    #[test]
    fn test_eviction_prefers_recently_used_levels() {
        let matrix = TileMatrix::new();
        for zoom in [4u8, 5, 6, 7, 8] {
            matrix.put(zoom, TilePos::new(0, 0), tile(zoom, 0, 0));
        }
        // level 4 gets read again, 5 and 7 are the stale neighbours
        matrix.get(4, TilePos::new(0, 0));

        let evicted = matrix.evict_outside_window(6, 2);
        assert_eq!(evicted, 2);
        assert_eq!(matrix.zoom_levels(), vec![4, 6, 8]);
    }

    #[test]
    fn test_read_view() {
        let matrix = TileMatrix::new();
        matrix.put(1, TilePos::new(0, 1), tile(1, 0, 1));

        let view = matrix.read();
        assert!(view.get_ref(1, TilePos::new(0, 1)).is_some());
        assert!(view.get_ref(1, TilePos::new(1, 1)).is_none());
        assert!(view.get(2, TilePos::new(0, 0)).is_empty());
    }
}
