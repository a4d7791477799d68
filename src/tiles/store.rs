//! Persistent tile store backing the network provider
//!
//! Blobs are keyed by provider id plus [`TileKey`] and stay opaque to the
//! store. Export/import move a whole store through a single archive file:
//!
//! ```text
//! "TPYRAMID" | version: u32 LE | { len: u32 LE | bincode(ArchiveRecord) }*
//! ```
//!
//! Records are decoded with bincode's default options, which ignore trailing
//! bytes, so a newer writer can append fields to a record without breaking
//! older readers.

use crate::core::constants::{ARCHIVE_MAGIC, ARCHIVE_VERSION, TILE_FILE_EXTENSION};
use crate::core::geo::TileKey;
use crate::prelude::HashMap;
use serde::{Deserialize, Serialize};
use std::fmt::Debug;
use std::fs::{self, File};
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError, RwLock};

/// Upper bound on one archive record, guards against corrupt length prefixes
const MAX_RECORD_LEN: u32 = 64 * 1024 * 1024;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("store I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("archive record encoding error: {0}")]
    Encoding(#[from] bincode::Error),

    #[error("not a tile archive: {0}")]
    BadArchive(String),

    #[error("invalid provider id {0:?}")]
    InvalidProvider(String),
}

/// One stored blob, as listed by [`TileStore::entries`]
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StoreEntry {
    pub provider: String,
    pub key: TileKey,
}

/// Outcome of merging an archive into a store
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ImportReport {
    /// Keys that were not present before
    pub imported: usize,
    /// Keys whose bytes changed
    pub replaced: usize,
    /// Keys already holding identical bytes
    pub skipped: usize,
}

impl ImportReport {
    pub fn total(&self) -> usize {
        self.imported + self.replaced + self.skipped
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct ArchiveRecord {
    provider: String,
    zoom: u8,
    x: i64,
    y: i64,
    bytes: Vec<u8>,
}

pub trait TileStore: Send + Sync + Debug {
    fn has(&self, provider: &str, key: &TileKey) -> bool;

    fn get(&self, provider: &str, key: &TileKey) -> Result<Option<Vec<u8>>, StoreError>;

    fn put(&self, provider: &str, key: &TileKey, bytes: &[u8]) -> Result<(), StoreError>;

    /// Returns whether a blob was removed
    fn remove(&self, provider: &str, key: &TileKey) -> Result<bool, StoreError>;

    /// Drops every blob of `provider`, returning how many were removed
    fn clear_provider(&self, provider: &str) -> Result<usize, StoreError>;

    fn entries(&self) -> Result<Vec<StoreEntry>, StoreError>;

    /// Writes every blob into an archive at `path`; returns the record count
    fn export(&self, path: &Path) -> Result<usize, StoreError> {
        let mut entries = self.entries()?;
        entries.sort();

        let partial = path.with_extension("partial");
        let mut writer = ArchiveWriter::create(&partial)?;
        for entry in &entries {
            // entries may vanish between listing and reading
            if let Some(bytes) = self.get(&entry.provider, &entry.key)? {
                writer.write(&entry.provider, &entry.key, bytes)?;
            }
        }
        let written = writer.finish()?;
        fs::rename(&partial, path)?;

        log::info!("exported {} tiles to {}", written, path.display());
        Ok(written)
    }

    /// Upserts every record of the archive at `path`
    fn import(&self, path: &Path) -> Result<ImportReport, StoreError> {
        let mut reader = ArchiveReader::open(path)?;
        let mut report = ImportReport::default();

        while let Some(record) = reader.next_record()? {
            let key = TileKey::from_xyz(record.x, record.y, record.zoom);
            match self.get(&record.provider, &key)? {
                Some(existing) if existing == record.bytes => report.skipped += 1,
                Some(_) => {
                    self.put(&record.provider, &key, &record.bytes)?;
                    report.replaced += 1;
                }
                None => {
                    self.put(&record.provider, &key, &record.bytes)?;
                    report.imported += 1;
                }
            }
        }

        log::info!(
            "imported {} from {}: {} new, {} replaced, {} unchanged",
            report.total(),
            path.display(),
            report.imported,
            report.replaced,
            report.skipped
        );
        Ok(report)
    }
}

struct ArchiveWriter {
    out: BufWriter<File>,
    written: usize,
}

impl ArchiveWriter {
    fn create(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        let mut out = BufWriter::new(File::create(path)?);
        out.write_all(ARCHIVE_MAGIC)?;
        out.write_all(&ARCHIVE_VERSION.to_le_bytes())?;
        Ok(Self { out, written: 0 })
    }

    fn write(&mut self, provider: &str, key: &TileKey, bytes: Vec<u8>) -> Result<(), StoreError> {
        let record = ArchiveRecord {
            provider: provider.to_string(),
            zoom: key.zoom,
            x: key.pos.x,
            y: key.pos.y,
            bytes,
        };
        let encoded = bincode::serialize(&record)?;
        let len = u32::try_from(encoded.len())
            .ok()
            .filter(|len| *len <= MAX_RECORD_LEN)
            .ok_or_else(|| StoreError::BadArchive(format!("record for {} too large", key)))?;
        self.out.write_all(&len.to_le_bytes())?;
        self.out.write_all(&encoded)?;
        self.written += 1;
        Ok(())
    }

    fn finish(mut self) -> Result<usize, StoreError> {
        self.out.flush()?;
        self.out.get_ref().sync_all()?;
        Ok(self.written)
    }
}

struct ArchiveReader {
    input: BufReader<File>,
}

impl ArchiveReader {
    fn open(path: &Path) -> Result<Self, StoreError> {
        let mut input = BufReader::new(File::open(path)?);

        let mut magic = [0u8; 8];
        input
            .read_exact(&mut magic)
            .map_err(|_| StoreError::BadArchive("file too short".into()))?;
        if &magic != ARCHIVE_MAGIC {
            return Err(StoreError::BadArchive("wrong magic".into()));
        }

        let mut version = [0u8; 4];
        input
            .read_exact(&mut version)
            .map_err(|_| StoreError::BadArchive("missing version".into()))?;
        let version = u32::from_le_bytes(version);
        if version == 0 {
            return Err(StoreError::BadArchive("version 0".into()));
        }
        if version > ARCHIVE_VERSION {
            log::warn!(
                "archive version {} is newer than {}, unknown fields are ignored",
                version,
                ARCHIVE_VERSION
            );
        }

        Ok(Self { input })
    }

    fn next_record(&mut self) -> Result<Option<ArchiveRecord>, StoreError> {
        // a clean end of file only happens on a record boundary
        let mut len = [0u8; 4];
        let mut filled = 0;
        while filled < len.len() {
            match self.input.read(&mut len[filled..]) {
                Ok(0) => break,
                Ok(n) => filled += n,
                Err(err) if err.kind() == io::ErrorKind::Interrupted => {}
                Err(err) => return Err(err.into()),
            }
        }
        match filled {
            0 => return Ok(None),
            4 => {}
            partial => {
                return Err(StoreError::BadArchive(format!(
                    "truncated record length ({} of 4 bytes)",
                    partial
                )))
            }
        }

        let len = u32::from_le_bytes(len);
        if len > MAX_RECORD_LEN {
            return Err(StoreError::BadArchive(format!("record length {}", len)));
        }

        let mut buf = vec![0u8; len as usize];
        self.input
            .read_exact(&mut buf)
            .map_err(|_| StoreError::BadArchive("truncated record".into()))?;
        Ok(Some(bincode::deserialize(&buf)?))
    }
}

/// Provider ids become directory names, so they are restricted to a safe set
fn check_provider(provider: &str) -> Result<(), StoreError> {
    let valid = !provider.is_empty()
        && provider != "."
        && provider != ".."
        && provider
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'));
    if valid {
        Ok(())
    } else {
        Err(StoreError::InvalidProvider(provider.to_string()))
    }
}

/// Filesystem store laid out as `<root>/<provider>/<z>/<x>/<y>.tile`.
///
/// Reads go straight to the filesystem and run concurrently. Writes are
/// serialized and land through a temp file plus rename, so a reader sees
/// either the old blob or the new one.
#[derive(Debug)]
pub struct DiskStore {
    root: PathBuf,
    write_lock: Mutex<()>,
}

impl DiskStore {
    pub fn open(root: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let root = root.into();
        fs::create_dir_all(&root)?;
        log::debug!("disk store at {}", root.display());
        Ok(Self {
            root,
            write_lock: Mutex::new(()),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn provider_dir(&self, provider: &str) -> Result<PathBuf, StoreError> {
        check_provider(provider)?;
        Ok(self.root.join(provider))
    }

    fn tile_path(&self, provider: &str, key: &TileKey) -> Result<PathBuf, StoreError> {
        Ok(self
            .provider_dir(provider)?
            .join(key.zoom.to_string())
            .join(key.pos.x.to_string())
            .join(format!("{}.{}", key.pos.y, TILE_FILE_EXTENSION)))
    }

    fn list_dirs(path: &Path) -> Result<Vec<(String, PathBuf)>, StoreError> {
        let mut dirs = Vec::new();
        for entry in fs::read_dir(path)? {
            let entry = entry?;
            if entry.file_type()?.is_dir() {
                if let Some(name) = entry.file_name().to_str() {
                    dirs.push((name.to_string(), entry.path()));
                }
            }
        }
        Ok(dirs)
    }

    fn provider_entries(&self, provider: &str, dir: &Path) -> Result<Vec<StoreEntry>, StoreError> {
        let mut entries = Vec::new();
        for (zoom, zoom_dir) in Self::list_dirs(dir)? {
            let Ok(zoom) = zoom.parse::<u8>() else { continue };
            for (x, x_dir) in Self::list_dirs(&zoom_dir)? {
                let Ok(x) = x.parse::<i64>() else { continue };
                for file in fs::read_dir(&x_dir)? {
                    let path = file?.path();
                    if path.extension().and_then(|ext| ext.to_str()) != Some(TILE_FILE_EXTENSION) {
                        continue;
                    }
                    let y = path
                        .file_stem()
                        .and_then(|stem| stem.to_str())
                        .and_then(|stem| stem.parse::<i64>().ok());
                    if let Some(y) = y {
                        entries.push(StoreEntry {
                            provider: provider.to_string(),
                            key: TileKey::from_xyz(x, y, zoom),
                        });
                    }
                }
            }
        }
        Ok(entries)
    }
}

impl TileStore for DiskStore {
    fn has(&self, provider: &str, key: &TileKey) -> bool {
        self.tile_path(provider, key)
            .map(|path| path.is_file())
            .unwrap_or(false)
    }

    fn get(&self, provider: &str, key: &TileKey) -> Result<Option<Vec<u8>>, StoreError> {
        let path = self.tile_path(provider, key)?;
        match fs::read(&path) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    fn put(&self, provider: &str, key: &TileKey, bytes: &[u8]) -> Result<(), StoreError> {
        let path = self.tile_path(provider, key)?;
        let partial = path.with_extension("partial");

        let _guard = self.write_lock.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&partial, bytes)?;
        fs::rename(&partial, &path)?;
        Ok(())
    }

    fn remove(&self, provider: &str, key: &TileKey) -> Result<bool, StoreError> {
        let path = self.tile_path(provider, key)?;
        let _guard = self.write_lock.lock().unwrap_or_else(PoisonError::into_inner);
        match fs::remove_file(&path) {
            Ok(()) => Ok(true),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(err) => Err(err.into()),
        }
    }

    fn clear_provider(&self, provider: &str) -> Result<usize, StoreError> {
        let dir = self.provider_dir(provider)?;
        let _guard = self.write_lock.lock().unwrap_or_else(PoisonError::into_inner);
        if !dir.is_dir() {
            return Ok(0);
        }
        let count = self.provider_entries(provider, &dir)?.len();
        fs::remove_dir_all(&dir)?;
        log::info!("cleared {} stored tiles of {}", count, provider);
        Ok(count)
    }

    fn entries(&self) -> Result<Vec<StoreEntry>, StoreError> {
        let mut entries = Vec::new();
        for (provider, dir) in Self::list_dirs(&self.root)? {
            if check_provider(&provider).is_err() {
                continue;
            }
            entries.extend(self.provider_entries(&provider, &dir)?);
        }
        Ok(entries)
    }
}

/// In-process store, handy for tests and short-lived sessions
#[derive(Debug, Default)]
pub struct MemoryStore {
    blobs: RwLock<HashMap<String, HashMap<TileKey, Vec<u8>>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.read().values().map(|tiles| tiles.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, HashMap<String, HashMap<TileKey, Vec<u8>>>> {
        self.blobs.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, HashMap<String, HashMap<TileKey, Vec<u8>>>> {
        self.blobs.write().unwrap_or_else(PoisonError::into_inner)
    }
}

impl TileStore for MemoryStore {
    fn has(&self, provider: &str, key: &TileKey) -> bool {
        self.read()
            .get(provider)
            .map(|tiles| tiles.contains_key(key))
            .unwrap_or(false)
    }

    fn get(&self, provider: &str, key: &TileKey) -> Result<Option<Vec<u8>>, StoreError> {
        Ok(self
            .read()
            .get(provider)
            .and_then(|tiles| tiles.get(key))
            .cloned())
    }

    fn put(&self, provider: &str, key: &TileKey, bytes: &[u8]) -> Result<(), StoreError> {
        check_provider(provider)?;
        self.write()
            .entry(provider.to_string())
            .or_default()
            .insert(*key, bytes.to_vec());
        Ok(())
    }

    fn remove(&self, provider: &str, key: &TileKey) -> Result<bool, StoreError> {
        Ok(self
            .write()
            .get_mut(provider)
            .and_then(|tiles| tiles.remove(key))
            .is_some())
    }

    fn clear_provider(&self, provider: &str) -> Result<usize, StoreError> {
        Ok(self
            .write()
            .remove(provider)
            .map(|tiles| tiles.len())
            .unwrap_or(0))
    }

    fn entries(&self) -> Result<Vec<StoreEntry>, StoreError> {
        Ok(self
            .read()
            .iter()
            .flat_map(|(provider, tiles)| {
                tiles.keys().map(move |key| StoreEntry {
                    provider: provider.clone(),
                    key: *key,
                })
            })
            .collect())
    }
}
