//! Per-node storage for the tracker and BEP-44 data
//!
//! Swarms hold announced peers per infohash with last-seen timestamps;
//! data items hold mutable/immutable blobs. Entries expire (peers after
//! 30 minutes, items after 2 hours) and a sweeper removes them at a fixed
//! cadence. Peer listing returns a uniformly random subset.

use std::collections::HashMap;
use std::net::SocketAddrV4;
use std::time::{Duration, Instant};

use rand::Rng;

use crate::data::{ImmutableItem, MutableItem};
use crate::node_id::NodeId;

/// How long an announced peer counts as a swarm member.
pub const SWARM_VALIDITY: Duration = Duration::from_secs(30 * 60);
/// How long a stored BEP-44 item stays alive without a refresh.
pub const DATA_VALIDITY: Duration = Duration::from_secs(2 * 60 * 60);
/// Sweep cadence for expired entries.
pub const SWEEP_PERIOD: Duration = Duration::from_secs(60);
/// Peers returned per get_peers reply.
pub const MAX_PEERS_PER_REPLY: usize = 50;

/// What happened to a mutable put. The responder echoes `stored_seq` either
/// way, which is how a stale writer learns it lost.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PutOutcome {
    Stored { seq: i64 },
    Stale { stored_seq: i64 },
}

/// Announced peers for one infohash. The side map gives O(1)
/// touch-on-re-announce; listing shuffles in place with a partial
/// Fisher–Yates so only the returned prefix pays for randomness.
struct Swarm {
    peers: Vec<(SocketAddrV4, Instant)>,
    index: HashMap<SocketAddrV4, usize>,
}

impl Swarm {
    fn new() -> Self {
        Self { peers: Vec::new(), index: HashMap::new() }
    }

    fn add(&mut self, peer: SocketAddrV4, now: Instant) {
        match self.index.get(&peer) {
            Some(&i) => self.peers[i].1 = now,
            None => {
                self.index.insert(peer, self.peers.len());
                self.peers.push((peer, now));
            }
        }
    }

    fn list(&mut self, max: usize, rng: &mut impl Rng) -> Vec<SocketAddrV4> {
        let n = max.min(self.peers.len());
        for i in 0..n {
            let j = rng.gen_range(i..self.peers.len());
            self.peers.swap(i, j);
            self.index.insert(self.peers[i].0, i);
            self.index.insert(self.peers[j].0, j);
        }
        self.peers[..n].iter().map(|(p, _)| *p).collect()
    }

    fn expire(&mut self, cutoff: Instant) {
        self.peers.retain(|(_, seen)| *seen >= cutoff);
        self.index.clear();
        for (i, (peer, _)) in self.peers.iter().enumerate() {
            self.index.insert(*peer, i);
        }
    }
}

impl Default for Swarm {
    fn default() -> Self {
        Self::new()
    }
}

struct StoredMutable {
    item: MutableItem,
    last_touched: Instant,
}

struct StoredImmutable {
    item: ImmutableItem,
    last_touched: Instant,
}

/// The tracker and BEP-44 stores, keyed by 160-bit target.
#[derive(Default)]
pub struct DataStore {
    swarms: HashMap<NodeId, Swarm>,
    mutable: HashMap<NodeId, StoredMutable>,
    immutable: HashMap<NodeId, StoredImmutable>,
}

impl DataStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record an announced peer for an infohash.
    pub fn announce(&mut self, info_hash: NodeId, peer: SocketAddrV4) {
        self.announce_at(Instant::now(), info_hash, peer)
    }

    pub(crate) fn announce_at(&mut self, now: Instant, info_hash: NodeId, peer: SocketAddrV4) {
        self.swarms.entry(info_hash).or_default().add(peer, now);
    }

    /// A random subset of a swarm, at most [`MAX_PEERS_PER_REPLY`] entries.
    pub fn peers(&mut self, info_hash: &NodeId) -> Vec<SocketAddrV4> {
        let mut rng = rand::thread_rng();
        match self.swarms.get_mut(info_hash) {
            Some(swarm) => swarm.list(MAX_PEERS_PER_REPLY, &mut rng),
            None => Vec::new(),
        }
    }

    /// Store a mutable item. The caller must have verified the signature;
    /// this checks only sequence ordering.
    pub fn put_mutable(&mut self, item: MutableItem) -> PutOutcome {
        self.put_mutable_at(Instant::now(), item)
    }

    pub(crate) fn put_mutable_at(&mut self, now: Instant, item: MutableItem) -> PutOutcome {
        let target = item.target();
        if let Some(existing) = self.mutable.get_mut(&target) {
            if existing.item.seq > item.seq {
                existing.last_touched = now;
                return PutOutcome::Stale { stored_seq: existing.item.seq };
            }
        }
        let seq = item.seq;
        self.mutable.insert(target, StoredMutable { item, last_touched: now });
        PutOutcome::Stored { seq }
    }

    /// Fetch a mutable item, refreshing its validity.
    pub fn get_mutable(&mut self, target: &NodeId) -> Option<MutableItem> {
        self.get_mutable_at(Instant::now(), target)
    }

    pub(crate) fn get_mutable_at(&mut self, now: Instant, target: &NodeId) -> Option<MutableItem> {
        let stored = self.mutable.get_mut(target)?;
        stored.last_touched = now;
        Some(stored.item.clone())
    }

    pub fn put_immutable(&mut self, item: ImmutableItem) {
        let target = item.target();
        self.immutable.insert(target, StoredImmutable { item, last_touched: Instant::now() });
    }

    pub fn get_immutable(&mut self, target: &NodeId) -> Option<ImmutableItem> {
        let stored = self.immutable.get_mut(target)?;
        stored.last_touched = Instant::now();
        Some(stored.item.clone())
    }

    /// Drop expired peers and items.
    pub fn sweep(&mut self) {
        self.sweep_at(Instant::now())
    }

    pub(crate) fn sweep_at(&mut self, now: Instant) {
        if let Some(cutoff) = now.checked_sub(SWARM_VALIDITY) {
            for swarm in self.swarms.values_mut() {
                swarm.expire(cutoff);
            }
            self.swarms.retain(|_, s| !s.peers.is_empty());
        }
        if let Some(cutoff) = now.checked_sub(DATA_VALIDITY) {
            self.mutable.retain(|_, s| s.last_touched >= cutoff);
            self.immutable.retain(|_, s| s.last_touched >= cutoff);
        }
    }
}
