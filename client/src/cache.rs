//! On-disk cache of the last known timestamp of every column, one file per
//! server and dimension.
//!
//! File layout, all big-endian: `i32` format version, `i32` entry count,
//! then `count` pairs of `i64` packed position and `i64` timestamp.

use crate::error::CacheError;
use atomicwrites::{AtomicFile, OverwriteBehavior};
use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use common::DimensionId;
use hashbrown::HashMap;
use std::{
    fs,
    io::{self, BufReader, BufWriter, Read, Write},
    path::{Path, PathBuf},
};
use tracing::{debug, info, warn};

pub const CACHE_FORMAT_VERSION: i32 = 1;
const MAX_ENTRIES: i32 = 2_000_000;

/// Replaces everything outside `[A-Za-z0-9._-]` so a name is safe to use as
/// a single path component.
pub fn sanitize(name: &str) -> String {
    name.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') {
                c
            } else {
                '_'
            }
        })
        .collect()
}

fn read_entry(reader: &mut impl Read) -> io::Result<(i64, i64)> {
    let pos = reader.read_i64::<BigEndian>()?;
    let timestamp = reader.read_i64::<BigEndian>()?;
    Ok((pos, timestamp))
}

#[derive(Clone, Debug)]
pub struct ColumnCacheStore {
    root: PathBuf,
}

impl ColumnCacheStore {
    pub fn new(root: impl Into<PathBuf>) -> Self { Self { root: root.into() } }

    pub fn root(&self) -> &Path { &self.root }

    fn server_dir(&self, server: &str) -> PathBuf { self.root.join(sanitize(server)) }

    pub fn cache_file(&self, server: &str, dimension: &DimensionId) -> PathBuf {
        self.server_dir(server)
            .join(format!("{}.bin", sanitize(dimension.as_str())))
    }

    /// Loads the cache, treating any unreadable file as empty.
    pub fn load(&self, server: &str, dimension: &DimensionId) -> HashMap<i64, i64> {
        match self.try_load(server, dimension) {
            Ok(map) => {
                if !map.is_empty() {
                    info!(entries = map.len(), %dimension, "Loaded column cache");
                }
                map
            },
            Err(e) => {
                warn!(%e, %dimension, "Discarding column cache");
                HashMap::new()
            },
        }
    }

    /// Loads the cache. A missing file is an empty cache. A truncated file
    /// yields the complete entries read before the end.
    pub fn try_load(
        &self,
        server: &str,
        dimension: &DimensionId,
    ) -> Result<HashMap<i64, i64>, CacheError> {
        let path = self.cache_file(server, dimension);
        let file = match fs::File::open(&path) {
            Ok(file) => file,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(HashMap::new()),
            Err(e) => return Err(e.into()),
        };
        let mut reader = BufReader::new(file);

        let version = reader.read_i32::<BigEndian>()?;
        if version != CACHE_FORMAT_VERSION {
            return Err(CacheError::UnsupportedVersion(version));
        }
        let count = reader.read_i32::<BigEndian>()?;
        if !(0..=MAX_ENTRIES).contains(&count) {
            return Err(CacheError::BadCount(count));
        }

        let mut map = HashMap::with_capacity(count as usize);
        for _ in 0..count {
            match read_entry(&mut reader) {
                Ok((pos, timestamp)) => {
                    map.insert(pos, timestamp);
                },
                Err(e) => {
                    warn!(%e, ?path, read = map.len(), declared = count, "Column cache is truncated");
                    break;
                },
            }
        }
        Ok(map)
    }

    /// Atomically replaces the cache file. Empty caches are not written.
    pub fn save(
        &self,
        server: &str,
        dimension: &DimensionId,
        columns: &HashMap<i64, i64>,
    ) -> Result<(), CacheError> {
        if columns.is_empty() {
            return Ok(());
        }
        let path = self.cache_file(server, dimension);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let count = columns.len().min(MAX_ENTRIES as usize);
        AtomicFile::new(&path, OverwriteBehavior::AllowOverwrite).write(|f| {
            let mut writer = BufWriter::new(f);
            writer.write_i32::<BigEndian>(CACHE_FORMAT_VERSION)?;
            writer.write_i32::<BigEndian>(count as i32)?;
            for (pos, timestamp) in columns.iter().take(count) {
                writer.write_i64::<BigEndian>(*pos)?;
                writer.write_i64::<BigEndian>(*timestamp)?;
            }
            writer.flush()
        })?;
        debug!(entries = count, ?path, "Saved column cache");
        Ok(())
    }

    pub fn clear_for_server(&self, server: &str) -> Result<(), CacheError> {
        let dir = self.server_dir(server);
        match fs::remove_dir_all(&dir) {
            Ok(()) => {
                info!(?dir, "Cleared column cache for server");
                Ok(())
            },
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    pub fn clear_all(&self) -> Result<(), CacheError> {
        let entries = match fs::read_dir(&self.root) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e.into()),
        };
        for entry in entries {
            let path = entry?.path();
            if path.is_dir() {
                fs::remove_dir_all(&path)?;
            } else {
                fs::remove_file(&path)?;
            }
        }
        info!(root = ?self.root, "Cleared all column caches");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dim() -> DimensionId { DimensionId::new("minecraft:overworld") }

    fn write_raw(store: &ColumnCacheStore, server: &str, bytes: &[u8]) {
        let path = store.cache_file(server, &dim());
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, bytes).unwrap();
    }

    fn header(version: i32, count: i32) -> Vec<u8> {
        let mut buf = Vec::new();
        buf.write_i32::<BigEndian>(version).unwrap();
        buf.write_i32::<BigEndian>(count).unwrap();
        buf
    }

    #[test]
    fn sanitizes_names() {
        assert_eq!(sanitize("play.example.com:25565"), "play.example.com_25565");
        assert_eq!(sanitize("minecraft:the_nether"), "minecraft_the_nether");
        assert_eq!(sanitize("a/b\\c é"), "a_b_c__");
    }

    #[test]
    fn save_then_load() {
        let dir = tempfile::tempdir().unwrap();
        let store = ColumnCacheStore::new(dir.path());
        let mut columns = HashMap::new();
        columns.insert(100, 1000);
        columns.insert(-200, 0);
        columns.insert(i64::MIN, i64::MAX);

        store.save("server:1", &dim(), &columns).unwrap();
        assert!(dir
            .path()
            .join("server_1")
            .join("minecraft_overworld.bin")
            .exists());
        assert_eq!(store.load("server:1", &dim()), columns);
        // Other servers and dimensions are separate
        assert!(store.load("server:2", &dim()).is_empty());
        assert!(store
            .load("server:1", &DimensionId::new("minecraft:the_end"))
            .is_empty());
    }

    #[test]
    fn empty_cache_is_not_written() {
        let dir = tempfile::tempdir().unwrap();
        let store = ColumnCacheStore::new(dir.path());
        store.save("s", &dim(), &HashMap::new()).unwrap();
        assert!(!store.cache_file("s", &dim()).exists());
    }

    #[test]
    fn wrong_version_or_count_is_discarded() {
        let dir = tempfile::tempdir().unwrap();
        let store = ColumnCacheStore::new(dir.path());

        let mut bytes = header(999, 1);
        bytes.write_i64::<BigEndian>(1).unwrap();
        bytes.write_i64::<BigEndian>(2).unwrap();
        write_raw(&store, "s", &bytes);
        assert!(matches!(
            store.try_load("s", &dim()),
            Err(CacheError::UnsupportedVersion(999))
        ));
        assert!(store.load("s", &dim()).is_empty());

        write_raw(&store, "s", &header(1, 3_000_000));
        assert!(matches!(store.try_load("s", &dim()), Err(CacheError::BadCount(3_000_000))));

        write_raw(&store, "s", &header(1, -1));
        assert!(store.load("s", &dim()).is_empty());

        write_raw(&store, "s", &[0, 0]);
        assert!(matches!(store.try_load("s", &dim()), Err(CacheError::Io(_))));
    }

    #[test]
    fn truncated_file_keeps_complete_entries() {
        let dir = tempfile::tempdir().unwrap();
        let store = ColumnCacheStore::new(dir.path());
        let mut bytes = header(1, 5);
        bytes.write_i64::<BigEndian>(42).unwrap();
        bytes.write_i64::<BigEndian>(100).unwrap();
        bytes.write_i64::<BigEndian>(43).unwrap();
        write_raw(&store, "s", &bytes);

        let loaded = store.load("s", &dim());
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded.get(&42), Some(&100));
    }

    #[test]
    fn clearing() {
        let dir = tempfile::tempdir().unwrap();
        let store = ColumnCacheStore::new(dir.path());
        let mut columns = HashMap::new();
        columns.insert(1, 1);
        store.save("a", &dim(), &columns).unwrap();
        store.save("b", &dim(), &columns).unwrap();

        store.clear_for_server("a").unwrap();
        assert!(store.load("a", &dim()).is_empty());
        assert_eq!(store.load("b", &dim()).len(), 1);
        // Clearing twice is fine
        store.clear_for_server("a").unwrap();

        store.clear_all().unwrap();
        assert!(store.load("b", &dim()).is_empty());
        assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 0);

        ColumnCacheStore::new(dir.path().join("missing")).clear_all().unwrap();
    }
}
