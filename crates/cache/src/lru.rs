//! Persistent LRU cache
//!
//! Every entry is one self-describing file:
//! `u64 timestamp_ms ‖ u32 key_len ‖ key ‖ opaque value`, integers
//! little-endian. Loading sorts by timestamp, trims to capacity and drops
//! unreadable files. Touching rewrites only the 8-byte timestamp prefix.

use std::collections::HashMap;
use std::fs;
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use cachecraft_core::{Error, Result};
use cachecraft_crypto::sha1_digest;
use tracing::{debug, warn};

struct Slot {
    timestamp_ms: u64,
    value: Vec<u8>,
    file: PathBuf,
}

/// An LRU map of string keys to small opaque values, one file per entry,
/// capacity counted in entries.
pub struct PersistentLru {
    dir: PathBuf,
    capacity: usize,
    entries: HashMap<String, Slot>,
}

impl PersistentLru {
    /// Load (or create) the cache directory, repairing what it can:
    /// unreadable entry files are deleted, excess entries are evicted
    /// oldest-first.
    pub fn load(dir: impl Into<PathBuf>, capacity: usize) -> Result<Self> {
        let dir = dir.into();
        if capacity == 0 {
            return Err(Error::Config("LRU capacity must be positive".into()));
        }
        fs::create_dir_all(&dir)?;

        let mut entries = HashMap::new();
        for file in fs::read_dir(&dir)? {
            let path = file?.path();
            if !path.is_file() {
                continue;
            }
            match read_entry_file(&path) {
                Ok((key, slot)) => {
                    entries.insert(key, slot);
                }
                Err(err) => {
                    warn!(?path, %err, "dropping unreadable cache entry");
                    let _ = fs::remove_file(&path);
                }
            }
        }

        let mut lru = Self { dir, capacity, entries };
        lru.trim();
        Ok(lru)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    /// Read a value and mark the entry as freshly used.
    pub fn get(&mut self, key: &str) -> Option<Vec<u8>> {
        self.touch(key);
        self.entries.get(key).map(|slot| slot.value.clone())
    }

    /// Insert or overwrite. Returns the entries evicted to stay in
    /// capacity, with their values.
    pub fn insert(&mut self, key: &str, value: &[u8]) -> Result<Vec<(String, Vec<u8>)>> {
        let timestamp_ms = now_ms();
        let file = self.entry_path(key);
        write_entry_file(&file, timestamp_ms, key, value)?;
        self.entries
            .insert(key.to_string(), Slot { timestamp_ms, value: value.to_vec(), file });
        Ok(self.trim())
    }

    /// Refresh an entry's timestamp, on disk and in memory.
    pub fn touch(&mut self, key: &str) {
        let Some(slot) = self.entries.get_mut(key) else { return };
        slot.timestamp_ms = now_ms();
        if let Err(err) = rewrite_timestamp(&slot.file, slot.timestamp_ms) {
            warn!(key, %err, "failed to persist cache entry timestamp");
        }
    }

    pub fn remove(&mut self, key: &str) {
        if let Some(slot) = self.entries.remove(key) {
            let _ = fs::remove_file(slot.file);
        }
    }

    fn trim(&mut self) -> Vec<(String, Vec<u8>)> {
        let mut evicted = Vec::new();
        while self.entries.len() > self.capacity {
            let oldest = self
                .entries
                .iter()
                .min_by_key(|(_, slot)| slot.timestamp_ms)
                .map(|(k, _)| k.clone())
                .expect("len > capacity > 0");
            debug!(key = %oldest, "evicting least recently used entry");
            let value = self
                .entries
                .get(&oldest)
                .map(|slot| slot.value.clone())
                .unwrap_or_default();
            self.remove(&oldest);
            evicted.push((oldest, value));
        }
        evicted
    }

    fn entry_path(&self, key: &str) -> PathBuf {
        self.dir.join(hex::encode(sha1_digest(key)))
    }
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

fn read_entry_file(path: &Path) -> Result<(String, Slot)> {
    let mut file = fs::File::open(path)?;
    let mut prefix = [0u8; 12];
    file.read_exact(&mut prefix)
        .map_err(|_| Error::StoreCorruption("entry file too short".into()))?;
    let timestamp_ms = u64::from_le_bytes(prefix[..8].try_into().expect("8 bytes"));
    let key_len = u32::from_le_bytes(prefix[8..].try_into().expect("4 bytes")) as usize;
    if key_len > 64 * 1024 {
        return Err(Error::StoreCorruption("implausible key length".into()));
    }
    let mut key = vec![0u8; key_len];
    file.read_exact(&mut key)
        .map_err(|_| Error::StoreCorruption("truncated key".into()))?;
    let key = String::from_utf8(key)
        .map_err(|_| Error::StoreCorruption("non-utf8 key".into()))?;
    let mut value = Vec::new();
    file.read_to_end(&mut value)?;
    Ok((key, Slot { timestamp_ms, value, file: path.to_path_buf() }))
}

fn write_entry_file(path: &Path, timestamp_ms: u64, key: &str, value: &[u8]) -> Result<()> {
    let mut out = Vec::with_capacity(12 + key.len() + value.len());
    out.extend_from_slice(&timestamp_ms.to_le_bytes());
    out.extend_from_slice(&(key.len() as u32).to_le_bytes());
    out.extend_from_slice(key.as_bytes());
    out.extend_from_slice(value);
    fs::write(path, out)?;
    Ok(())
}

fn rewrite_timestamp(path: &Path, timestamp_ms: u64) -> Result<()> {
    let mut file = fs::OpenOptions::new().write(true).open(path)?;
    file.seek(SeekFrom::Start(0))?;
    file.write_all(&timestamp_ms.to_le_bytes())?;
    Ok(())
}
