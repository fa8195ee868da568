//! Group index
//!
//! Maps a DHT group (an opaque short string, conventionally the domain) to
//! the set of cached URLs belonging to it. Layout under `<root>/groups/`:
//!
//! ```text
//! groups/<sha1(group) hex>/name            the group string itself
//! groups/<sha1(group) hex>/items/<sha1(url) hex>       content: the url
//! groups/<sha1(group) hex>/items/<sha1(url) hex>.rm    eviction tombstone
//! ```
//!
//! A tombstone replaces the item file before the store entry is physically
//! removed, so an announcer enumerating the index never sees a url whose
//! data is already gone.

use std::fs;
use std::path::PathBuf;

use cachecraft_core::Result;
use cachecraft_crypto::sha1_digest;
use tracing::warn;

const TOMBSTONE_SUFFIX: &str = ".rm";

pub struct GroupIndex {
    dir: PathBuf,
}

impl GroupIndex {
    pub fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let dir = root.into().join("groups");
        fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    fn group_dir(&self, group: &str) -> PathBuf {
        self.dir.join(hex::encode(sha1_digest(group)))
    }

    fn item_path(&self, group: &str, url: &str) -> PathBuf {
        self.group_dir(group).join("items").join(hex::encode(sha1_digest(url)))
    }

    /// Record that `url` is cached under `group`. Idempotent; clears any
    /// tombstone left by a previous eviction.
    pub fn add(&self, group: &str, url: &str) -> Result<()> {
        let group_dir = self.group_dir(group);
        fs::create_dir_all(group_dir.join("items"))?;
        fs::write(group_dir.join("name"), group.as_bytes())?;
        let item = self.item_path(group, url);
        let tombstone = tombstone_path(&item);
        if tombstone.exists() {
            let _ = fs::remove_file(&tombstone);
        }
        fs::write(item, url.as_bytes())?;
        Ok(())
    }

    /// Replace the item file with a tombstone. Call before removing the
    /// store entry it points to.
    pub fn tombstone(&self, group: &str, url: &str) -> Result<()> {
        let item = self.item_path(group, url);
        if item.exists() {
            fs::rename(&item, tombstone_path(&item))?;
        }
        Ok(())
    }

    /// Drop an item (and any tombstone) for good.
    pub fn remove(&self, group: &str, url: &str) -> Result<()> {
        let item = self.item_path(group, url);
        let _ = fs::remove_file(tombstone_path(&item));
        let _ = fs::remove_file(&item);
        self.drop_group_if_empty(group);
        Ok(())
    }

    /// All groups with at least one live item.
    pub fn groups(&self) -> Vec<String> {
        let mut out = Vec::new();
        let Ok(dir) = fs::read_dir(&self.dir) else { return out };
        for entry in dir.flatten() {
            let name_file = entry.path().join("name");
            let Ok(name) = fs::read_to_string(&name_file) else {
                continue;
            };
            if !self.urls_in(&entry.path()).is_empty() {
                out.push(name);
            }
        }
        out.sort();
        out
    }

    /// Live urls cached under a group; tombstoned entries are skipped.
    pub fn urls(&self, group: &str) -> Vec<String> {
        self.urls_in(&self.group_dir(group))
    }

    fn urls_in(&self, group_dir: &PathBuf) -> Vec<String> {
        let mut out = Vec::new();
        let Ok(dir) = fs::read_dir(group_dir.join("items")) else { return out };
        for entry in dir.flatten() {
            let path = entry.path();
            if path.extension().map_or(false, |e| e == "rm") {
                continue;
            }
            match fs::read_to_string(&path) {
                Ok(url) => out.push(url),
                Err(err) => warn!(?path, %err, "unreadable group index item"),
            }
        }
        out.sort();
        out
    }

    /// Remove a whole group, returning the urls it held (live ones only).
    pub fn purge_group(&self, group: &str) -> Result<Vec<String>> {
        let urls = self.urls(group);
        let dir = self.group_dir(group);
        if dir.exists() {
            fs::remove_dir_all(&dir)?;
        }
        Ok(urls)
    }

    fn drop_group_if_empty(&self, group: &str) {
        let dir = self.group_dir(group);
        let empty = fs::read_dir(dir.join("items"))
            .map(|mut d| d.next().is_none())
            .unwrap_or(false);
        if empty {
            let _ = fs::remove_dir_all(&dir);
        }
    }
}

fn tombstone_path(item: &std::path::Path) -> PathBuf {
    let mut name = item.file_name().unwrap_or_default().to_os_string();
    name.push(TOMBSTONE_SUFFIX);
    item.with_file_name(name)
}
