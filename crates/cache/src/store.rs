//! On-disk content-addressed HTTP store
//!
//! One directory per cached response, keyed by SHA-1 of the url:
//!
//! ```text
//! <root>/data/<2-hex shard>/<sha1(url) hex>/
//!     head    canonical signed head, trailer fields folded in
//!     body    raw concatenated blocks
//!     sigs    one 144-byte record per block:
//!             u64 offset ‖ u64 size ‖ [u8;64] signature ‖ [u8;64] hash
//! ```
//!
//! Integers in `sigs` are little-endian. Writes stream into a sibling
//! `tmp.<random>` directory and become visible in one rename; anything that
//! dies before the rename leaves nothing behind but a temp directory that
//! gets swept on open. Entry count is bounded by an LRU whose persistent
//! index maps url → group, so eviction can tombstone the group index
//! before touching the filesystem.

use std::collections::HashMap;
use std::fs;
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use cachecraft_core::{Error, Result};
use cachecraft_crypto::sha1_digest;
use rand::Rng;
use serde::{Deserialize, Serialize};
use serde_big_array::BigArray;
use tracing::{debug, info, warn};

use crate::codec::{BlockReceipt, SignedBlock};
use crate::group::GroupIndex;
use crate::head::{field, ResponseHead};
use crate::lru::PersistentLru;
use crate::sign::{BlockSigParams, chain_step};

/// One record of the `sigs` file. bincode's default fixed-width
/// little-endian integers make this exactly 144 bytes.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct SigRecord {
    pub offset: u64,
    pub size: u64,
    #[serde(with = "BigArray")]
    pub signature: [u8; 64],
    #[serde(with = "BigArray")]
    pub hash: [u8; 64],
}

pub const SIG_RECORD_LEN: u64 = 144;

pub struct HttpStore {
    root: PathBuf,
    lru: Mutex<PersistentLru>,
    groups: GroupIndex,
    /// Per-key write locks; racing writers on one url serialize here.
    write_locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl HttpStore {
    /// Open (or create) a store rooted at `root`, keeping at most
    /// `capacity` entries. Stale temp directories from interrupted writes
    /// are swept here.
    pub fn open(root: impl Into<PathBuf>, capacity: usize) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(root.join("data"))?;
        let lru = PersistentLru::load(root.join("lru"), capacity)?;
        let groups = GroupIndex::open(&root)?;
        let store = Self {
            root,
            lru: Mutex::new(lru),
            groups,
            write_locks: Mutex::new(HashMap::new()),
        };
        store.sweep_temp_dirs();
        Ok(store)
    }

    pub fn group_index(&self) -> &GroupIndex {
        &self.groups
    }

    pub fn len(&self) -> usize {
        self.lru.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, url: &str) -> bool {
        self.entry_dir(url).join("head").exists()
    }

    fn entry_key(url: &str) -> String {
        hex::encode(sha1_digest(url))
    }

    fn entry_dir(&self, url: &str) -> PathBuf {
        let key = Self::entry_key(url);
        self.root.join("data").join(&key[..2]).join(&key)
    }

    fn key_lock(&self, url: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.write_locks.lock().unwrap();
        locks.entry(url.to_string()).or_default().clone()
    }

    /// Start writing an entry. Returns `None` when another writer
    /// committed the key while we waited for the lock; the caller treats
    /// that as success and writes nothing.
    pub async fn begin_write(&self, url: &str, group: &str) -> Result<Option<StoreWriter<'_>>> {
        let lock = self.key_lock(url);
        let guard = lock.lock_owned().await;
        if self.contains(url) {
            debug!(url, "entry already committed by a racing writer");
            return Ok(None);
        }
        let final_dir = self.entry_dir(url);
        let shard_dir = final_dir.parent().expect("entry dir has a shard parent").to_path_buf();
        fs::create_dir_all(&shard_dir)?;
        let tmp_dir = shard_dir.join(format!("tmp.{:08x}", rand::thread_rng().gen::<u32>()));
        fs::create_dir(&tmp_dir)?;
        let body = fs::File::create(tmp_dir.join("body"))?;
        let sigs = fs::File::create(tmp_dir.join("sigs"))?;
        Ok(Some(StoreWriter {
            store: self,
            url: url.to_string(),
            group: group.to_string(),
            tmp_dir,
            final_dir,
            head: None,
            body,
            sigs,
            committed: false,
            _guard: guard,
        }))
    }

    /// Open an entry for reading and mark it used. A damaged entry is
    /// purged and reported as `NotFound`.
    pub fn read(&self, url: &str) -> Result<StoreEntry> {
        match self.try_read(url) {
            Ok(entry) => {
                self.lru.lock().unwrap().touch(url);
                Ok(entry)
            }
            Err(Error::NotFound) => Err(Error::NotFound),
            Err(err) => {
                warn!(url, %err, "purging damaged store entry");
                let group = self
                    .lru
                    .lock()
                    .unwrap()
                    .get(url)
                    .map(|v| String::from_utf8_lossy(&v).into_owned());
                self.remove(url, group.as_deref().unwrap_or_default());
                Err(Error::NotFound)
            }
        }
    }

    fn try_read(&self, url: &str) -> Result<StoreEntry> {
        let dir = self.entry_dir(url);
        if !dir.join("head").exists() {
            return Err(Error::NotFound);
        }
        let head_raw = fs::read(dir.join("head"))?;
        let (head, _) = ResponseHead::parse(&head_raw)
            .map_err(|e| Error::StoreCorruption(e.to_string()))?;
        let block_size = head
            .header(field::BSIGS)
            .and_then(|v| BlockSigParams::parse(v).ok())
            .map(|b| b.block_size)
            .ok_or_else(|| Error::StoreCorruption("head lacks block parameters".into()))?;
        let data_size: u64 = head
            .header(field::DATA_SIZE)
            .and_then(|v| v.parse().ok())
            .ok_or_else(|| Error::StoreCorruption("head lacks data size".into()))?;
        let body = fs::File::open(dir.join("body"))
            .map_err(|_| Error::StoreCorruption("missing body file".into()))?;
        let sigs = fs::File::open(dir.join("sigs"))
            .map_err(|_| Error::StoreCorruption("missing sigs file".into()))?;
        let sig_len = sigs.metadata()?.len();
        if sig_len % SIG_RECORD_LEN != 0 {
            return Err(Error::StoreCorruption("ragged sigs file".into()));
        }
        let expected_blocks = if data_size == 0 { 0 } else { data_size.div_ceil(block_size) };
        if sig_len / SIG_RECORD_LEN != expected_blocks {
            return Err(Error::StoreCorruption("sigs file does not match data size".into()));
        }
        Ok(StoreEntry { head, block_size, data_size, body, sigs })
    }

    /// Drop an entry: tombstone in the group index first, then the entry
    /// directory, then the index bookkeeping.
    pub fn remove(&self, url: &str, group: &str) {
        if let Err(err) = self.groups.tombstone(group, url) {
            warn!(url, %err, "failed to tombstone evicted entry");
        }
        let dir = self.entry_dir(url);
        if dir.exists() {
            if let Err(err) = fs::remove_dir_all(&dir) {
                warn!(url, %err, "failed to remove entry directory");
            }
        }
        self.lru.lock().unwrap().remove(url);
        let _ = self.groups.remove(group, url);
    }

    /// Remove every entry of a group (administrative purge).
    pub fn purge_group(&self, group: &str) -> Result<usize> {
        let urls = self.groups.purge_group(group)?;
        let count = urls.len();
        for url in urls {
            let dir = self.entry_dir(&url);
            if dir.exists() {
                let _ = fs::remove_dir_all(&dir);
            }
            self.lru.lock().unwrap().remove(&url);
        }
        Ok(count)
    }

    fn finish_commit(&self, url: &str, group: &str) -> Result<()> {
        self.groups.add(group, url)?;
        let evicted = self.lru.lock().unwrap().insert(url, group.as_bytes())?;
        for (old_url, old_group) in evicted {
            let old_group = String::from_utf8_lossy(&old_group).into_owned();
            info!(url = %old_url, "evicting cached response");
            self.remove(&old_url, &old_group);
        }
        Ok(())
    }

    fn sweep_temp_dirs(&self) {
        let Ok(shards) = fs::read_dir(self.root.join("data")) else { return };
        for shard in shards.flatten() {
            let Ok(entries) = fs::read_dir(shard.path()) else { continue };
            for entry in entries.flatten() {
                let name = entry.file_name();
                if name.to_string_lossy().starts_with("tmp.") {
                    debug!(?name, "sweeping interrupted write");
                    let _ = fs::remove_dir_all(entry.path());
                }
            }
        }
    }
}

/// An in-progress entry write. Dropping without `commit` discards the
/// temp directory; nothing becomes visible.
pub struct StoreWriter<'a> {
    store: &'a HttpStore,
    url: String,
    group: String,
    tmp_dir: PathBuf,
    final_dir: PathBuf,
    head: Option<ResponseHead>,
    body: fs::File,
    sigs: fs::File,
    committed: bool,
    _guard: tokio::sync::OwnedMutexGuard<()>,
}

impl StoreWriter<'_> {
    pub fn write_head(&mut self, head: &ResponseHead) -> Result<()> {
        fs::write(self.tmp_dir.join("head"), head.to_bytes())?;
        self.head = Some(head.clone());
        Ok(())
    }

    /// Append one verified block and its signature record.
    pub fn append_block(&mut self, data: &[u8], receipt: &BlockReceipt) -> Result<()> {
        self.body.write_all(data)?;
        let record = SigRecord {
            offset: receipt.offset,
            size: data.len() as u64,
            signature: receipt.signature,
            hash: receipt.chain_hash,
        };
        let raw = bincode::serialize(&record)
            .map_err(|e| Error::StoreCorruption(e.to_string()))?;
        debug_assert_eq!(raw.len() as u64, SIG_RECORD_LEN);
        self.sigs.write_all(&raw)?;
        Ok(())
    }

    /// Fold the verified trailers into the head and flip the entry live
    /// with one rename.
    pub fn commit(mut self, trailers: &[(String, String)]) -> Result<()> {
        let mut head = self
            .head
            .take()
            .ok_or_else(|| Error::protocol("commit without a head"))?;
        for (name, value) in trailers {
            head.set_header(name, value.clone());
        }
        fs::write(self.tmp_dir.join("head"), head.to_bytes())?;
        self.body.flush()?;
        self.sigs.flush()?;

        match fs::rename(&self.tmp_dir, &self.final_dir) {
            Ok(()) => {}
            Err(_) if self.final_dir.exists() => {
                // A racing writer got there first; our copy is redundant.
                let _ = fs::remove_dir_all(&self.tmp_dir);
            }
            Err(err) => return Err(err.into()),
        }
        self.committed = true;
        self.store.finish_commit(&self.url, &self.group)
    }
}

impl Drop for StoreWriter<'_> {
    fn drop(&mut self) {
        if !self.committed {
            let _ = fs::remove_dir_all(&self.tmp_dir);
        }
    }
}

/// A readable committed entry; blocks are fetched by index.
pub struct StoreEntry {
    pub head: ResponseHead,
    pub block_size: u64,
    pub data_size: u64,
    body: fs::File,
    sigs: fs::File,
}

impl StoreEntry {
    pub fn block_count(&self) -> u64 {
        if self.data_size == 0 {
            0
        } else {
            self.data_size.div_ceil(self.block_size)
        }
    }

    /// The trailer fields as recorded in the stored head.
    pub fn trailers(&self) -> Vec<(String, String)> {
        [field::DATA_SIZE, field::DIGEST, field::SIG1]
            .iter()
            .filter_map(|name| {
                self.head.header(name).map(|v| (name.to_string(), v.to_string()))
            })
            .collect()
    }

    /// Read block `index`, or `None` past the end. The fast path trusts
    /// local integrity; [`StoreEntry::verify_chain`] re-checks everything.
    pub fn read_block(&mut self, index: u64) -> Result<Option<SignedBlock>> {
        if index >= self.block_count() {
            return Ok(None);
        }
        let record = self.read_record(index)?;
        self.body.seek(SeekFrom::Start(record.offset))?;
        let mut data = vec![0u8; record.size as usize];
        self.body
            .read_exact(&mut data)
            .map_err(|_| Error::StoreCorruption("truncated body file".into()))?;
        Ok(Some(SignedBlock {
            offset: record.offset,
            data,
            signature: record.signature,
            chain_hash: record.hash,
        }))
    }

    fn read_record(&mut self, index: u64) -> Result<SigRecord> {
        self.sigs.seek(SeekFrom::Start(index * SIG_RECORD_LEN))?;
        let mut raw = [0u8; SIG_RECORD_LEN as usize];
        self.sigs
            .read_exact(&mut raw)
            .map_err(|_| Error::StoreCorruption("truncated sigs file".into()))?;
        bincode::deserialize(&raw).map_err(|e| Error::StoreCorruption(e.to_string()))
    }

    /// Slow path: recompute the whole hash chain against the stored
    /// records.
    pub fn verify_chain(&mut self) -> Result<()> {
        let mut hash = [0u8; 64];
        let mut prev_sig = None;
        for index in 0..self.block_count() {
            let block = self
                .read_block(index)?
                .ok_or_else(|| Error::StoreCorruption("missing block".into()))?;
            hash = chain_step(&hash, prev_sig.as_ref(), &block.data);
            if hash != block.chain_hash {
                return Err(Error::StoreCorruption(format!(
                    "hash chain broken at block {index}"
                )));
            }
            prev_sig = Some(block.signature);
        }
        Ok(())
    }
}

/// Derive the swarm name a group is announced under, and hash it into the
/// infohash used with the DHT tracker.
pub fn swarm_name(cache_key: &cachecraft_crypto::PublicKey, group: &str) -> String {
    format!(
        "{}/v{}/uri/{}",
        cachecraft_crypto::format_key_tag(cache_key),
        crate::head::PROTOCOL_VERSION,
        group
    )
}

pub fn swarm_infohash(
    cache_key: &cachecraft_crypto::PublicKey,
    group: &str,
) -> cachecraft_dht::NodeId {
    cachecraft_dht::NodeId::from_bytes(sha1_digest(swarm_name(cache_key, group)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{sign_response, InjectionMeta, Verifier, DEFAULT_BLOCK_SIZE};
    use cachecraft_crypto::SigningKeypair;

    const URL: &str = "https://example.com/file.bin";
    const GROUP: &str = "example.com";

    fn signed_body(len: usize) -> (crate::codec::SignedResponse, SigningKeypair) {
        let keypair = SigningKeypair::generate();
        let body = vec![0x5au8; len];
        let mut head = ResponseHead::new(200);
        head.set_header("Content-Type", "application/octet-stream");
        let signed = sign_response(
            &head,
            URL,
            &body,
            &keypair,
            &InjectionMeta::generate(1_700_000_000),
            DEFAULT_BLOCK_SIZE,
        )
        .unwrap();
        (signed, keypair)
    }

    async fn write_signed(
        store: &Arc<HttpStore>,
        signed: &crate::codec::SignedResponse,
        keypair: &SigningKeypair,
    ) {
        let mut verifier = Verifier::new(keypair.public_key_bytes());
        let verified = verifier.verify_head(&signed.head).unwrap();
        let mut writer = store.begin_write(URL, GROUP).await.unwrap().unwrap();
        writer.write_head(&verified.head).unwrap();
        for block in &signed.blocks {
            let receipt = verifier.verify_block(&block.data, &block.signature).unwrap();
            writer.append_block(&block.data, &receipt).unwrap();
        }
        verifier.finish(&signed.trailers()).unwrap();
        writer.commit(&signed.trailers()).unwrap();
    }

    #[tokio::test]
    async fn test_write_then_read_blocks() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(HttpStore::open(dir.path(), 16).unwrap());
        let (signed, keypair) = signed_body(150_000);
        write_signed(&store, &signed, &keypair).await;

        let mut entry = store.read(URL).unwrap();
        assert_eq!(entry.data_size, 150_000);
        assert_eq!(entry.block_count(), 3);
        for (i, expected) in signed.blocks.iter().enumerate() {
            let block = entry.read_block(i as u64).unwrap().unwrap();
            assert_eq!(&block.data, &expected.data);
            assert_eq!(block.chain_hash, expected.chain_hash);
        }
        assert!(entry.read_block(3).unwrap().is_none());
        entry.verify_chain().unwrap();
    }

    #[tokio::test]
    async fn test_uncommitted_write_leaves_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(HttpStore::open(dir.path(), 16).unwrap());
        let (signed, keypair) = signed_body(100_000);
        {
            let mut verifier = Verifier::new(keypair.public_key_bytes());
            let verified = verifier.verify_head(&signed.head).unwrap();
            let mut writer = store.begin_write(URL, GROUP).await.unwrap().unwrap();
            writer.write_head(&verified.head).unwrap();
            let receipt = verifier
                .verify_block(&signed.blocks[0].data, &signed.blocks[0].signature)
                .unwrap();
            writer.append_block(&signed.blocks[0].data, &receipt).unwrap();
            // Dropped here, no commit.
        }
        assert!(!store.contains(URL));
        assert!(matches!(store.read(URL), Err(Error::NotFound)));
        // No temp garbage either.
        let store2 = HttpStore::open(dir.path(), 16).unwrap();
        assert_eq!(store2.len(), 0);
    }

    #[tokio::test]
    async fn test_racing_writer_short_circuits() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(HttpStore::open(dir.path(), 16).unwrap());
        let (signed, keypair) = signed_body(10_000);
        write_signed(&store, &signed, &keypair).await;
        assert!(store.begin_write(URL, GROUP).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_eviction_keeps_most_recent() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(HttpStore::open(dir.path(), 2).unwrap());
        let keypair = SigningKeypair::generate();
        for i in 0..4 {
            let url = format!("https://example.com/{i}");
            let signed = sign_response(
                &ResponseHead::new(200),
                &url,
                b"payload",
                &keypair,
                &InjectionMeta::generate(1_700_000_000),
                DEFAULT_BLOCK_SIZE,
            )
            .unwrap();
            let mut verifier = Verifier::new(keypair.public_key_bytes());
            let verified = verifier.verify_head(&signed.head).unwrap();
            let mut writer = store.begin_write(&url, GROUP).await.unwrap().unwrap();
            writer.write_head(&verified.head).unwrap();
            for block in &signed.blocks {
                let receipt = verifier.verify_block(&block.data, &block.signature).unwrap();
                writer.append_block(&block.data, &receipt).unwrap();
            }
            writer.commit(&signed.trailers()).unwrap();
            std::thread::sleep(std::time::Duration::from_millis(2));
        }
        assert_eq!(store.len(), 2);
        assert!(!store.contains("https://example.com/0"));
        assert!(!store.contains("https://example.com/1"));
        assert!(store.contains("https://example.com/2"));
        assert!(store.contains("https://example.com/3"));
        // The group index only lists the survivors.
        assert_eq!(store.group_index().urls(GROUP).len(), 2);
    }

    #[tokio::test]
    async fn test_damaged_entry_purged_as_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(HttpStore::open(dir.path(), 16).unwrap());
        let (signed, keypair) = signed_body(10_000);
        write_signed(&store, &signed, &keypair).await;

        // Truncate the sigs file behind the store's back.
        let entry_dir = store.entry_dir(URL);
        let sigs = fs::read(entry_dir.join("sigs")).unwrap();
        fs::write(entry_dir.join("sigs"), &sigs[..10]).unwrap();

        assert!(matches!(store.read(URL), Err(Error::NotFound)));
        assert!(!store.contains(URL));
    }

    #[test]
    fn test_sig_record_is_144_bytes_little_endian() {
        let record = SigRecord {
            offset: 0x0102030405060708,
            size: 0x1112131415161718,
            signature: [0xaa; 64],
            hash: [0xbb; 64],
        };
        let raw = bincode::serialize(&record).unwrap();
        assert_eq!(raw.len() as u64, SIG_RECORD_LEN);
        // Little-endian offset at the front.
        assert_eq!(&raw[..8], &[0x08, 0x07, 0x06, 0x05, 0x04, 0x03, 0x02, 0x01]);
        let back: SigRecord = bincode::deserialize(&raw).unwrap();
        assert_eq!(back.offset, record.offset);
        assert_eq!(back.hash, record.hash);
    }

    #[test]
    fn test_swarm_infohash_is_stable() {
        let key = [3u8; 32];
        let a = swarm_infohash(&key, "example.com");
        let b = swarm_infohash(&key, "example.com");
        let c = swarm_infohash(&key, "other.org");
        assert_eq!(a, b);
        assert_ne!(a, c);
    }
}
