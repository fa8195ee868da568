//! Kademlia routing table
//!
//! Buckets own disjoint bit-prefixes that together cover the whole keyspace.
//! Each holds up to `BUCKET_SIZE` verified contacts (a contact is verified
//! only after a successful round trip) plus a small replacement cache of
//! candidates. Only the bucket covering the local id splits, and only when
//! the incoming contact would land on the local side of the split; otherwise
//! a full bucket answers with a ping request for its least-recently-seen
//! entry, and the outcome of that ping decides who stays.

use std::net::SocketAddr;

use tracing::trace;

use crate::node_id::{NodeId, Prefix, NODE_ID_LEN};

/// K: verified contacts per bucket.
pub const BUCKET_SIZE: usize = 8;
/// Replacement-cache capacity per bucket.
const CANDIDATE_CACHE: usize = 8;

/// A known DHT node.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct NodeContact {
    pub id: NodeId,
    pub endpoint: SocketAddr,
}

#[derive(Clone, Copy, Debug)]
struct Entry {
    contact: NodeContact,
    /// Logical timestamp of the last reply (or sighting, for candidates).
    last_seen: u64,
}

#[derive(Debug)]
struct Bucket {
    prefix: Prefix,
    verified: Vec<Entry>,
    candidates: Vec<Entry>,
}

impl Bucket {
    fn new(prefix: Prefix) -> Self {
        Self { prefix, verified: Vec::new(), candidates: Vec::new() }
    }

    fn find_verified(&mut self, contact: &NodeContact) -> Option<&mut Entry> {
        self.verified.iter_mut().find(|e| e.contact == *contact)
    }

    fn find_candidate(&mut self, contact: &NodeContact) -> Option<usize> {
        self.candidates.iter().position(|e| e.contact == *contact)
    }

    fn least_recently_seen(&self) -> Option<&Entry> {
        self.verified.iter().min_by_key(|e| e.last_seen)
    }
}

/// Issued when a verified contact wants into a full, unsplittable bucket:
/// the node pings `stale`, then reports back with [`RoutingTable::ping_outcome`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PingRequest {
    /// Least-recently-seen verified entry of the full bucket.
    pub stale: NodeContact,
    /// The newcomer waiting in the replacement cache.
    pub candidate: NodeContact,
}

pub struct RoutingTable {
    local_id: NodeId,
    buckets: Vec<Bucket>,
    /// Logical clock; bumped on every mutation so recency is total-ordered.
    clock: u64,
}

impl RoutingTable {
    pub fn new(local_id: NodeId) -> Self {
        Self { local_id, buckets: vec![Bucket::new(Prefix::ALL)], clock: 0 }
    }

    pub fn local_id(&self) -> NodeId {
        self.local_id
    }

    pub fn bucket_count(&self) -> usize {
        self.buckets.len()
    }

    pub fn verified_count(&self) -> usize {
        self.buckets.iter().map(|b| b.verified.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.verified_count() == 0
    }

    /// The prefixes currently covering the keyspace, for refresh lookups.
    pub fn bucket_prefixes(&self) -> impl Iterator<Item = Prefix> + '_ {
        self.buckets.iter().map(|b| b.prefix)
    }

    fn tick(&mut self) -> u64 {
        self.clock += 1;
        self.clock
    }

    fn bucket_index(&self, id: &NodeId) -> usize {
        self.buckets
            .iter()
            .position(|b| b.prefix.contains(id))
            .expect("bucket prefixes partition the keyspace")
    }

    /// Offer a contact to the table.
    ///
    /// `is_verified` is true when the contact just answered one of our
    /// queries. Returns a ping request when the contact was parked in a
    /// full bucket's replacement cache.
    pub fn try_add_node(&mut self, contact: NodeContact, is_verified: bool) -> Option<PingRequest> {
        if contact.id == self.local_id {
            return None;
        }
        let now = self.tick();

        loop {
            let idx = self.bucket_index(&contact.id);
            let covers_local = self.buckets[idx].prefix.contains(&self.local_id);
            let bucket = &mut self.buckets[idx];

            if let Some(entry) = bucket.find_verified(&contact) {
                entry.last_seen = now;
                return None;
            }
            if let Some(ci) = bucket.find_candidate(&contact) {
                if is_verified && bucket.verified.len() < BUCKET_SIZE {
                    let mut entry = bucket.candidates.remove(ci);
                    entry.last_seen = now;
                    bucket.verified.push(entry);
                } else {
                    bucket.candidates[ci].last_seen = now;
                }
                return None;
            }

            if !is_verified {
                if bucket.candidates.len() >= CANDIDATE_CACHE {
                    // Drop the oldest hearsay to make room.
                    let oldest = bucket
                        .candidates
                        .iter()
                        .enumerate()
                        .min_by_key(|(_, e)| e.last_seen)
                        .map(|(i, _)| i)
                        .expect("cache is non-empty");
                    bucket.candidates.remove(oldest);
                }
                bucket.candidates.push(Entry { contact, last_seen: now });
                return None;
            }

            if bucket.verified.len() < BUCKET_SIZE {
                bucket.verified.push(Entry { contact, last_seen: now });
                return None;
            }

            // Splitting only helps when the newcomer would land on the local
            // side of the divide; otherwise it would chase the same full
            // half forever.
            let splittable = covers_local
                && bucket.prefix.len() < NODE_ID_LEN * 8 - 1
                && contact.id.bit(bucket.prefix.len()) == self.local_id.bit(bucket.prefix.len());
            if splittable {
                self.split(idx);
                continue;
            }

            let stale = bucket
                .least_recently_seen()
                .expect("full bucket has verified entries")
                .contact;
            if bucket.candidates.len() >= CANDIDATE_CACHE {
                let oldest = bucket
                    .candidates
                    .iter()
                    .enumerate()
                    .min_by_key(|(_, e)| e.last_seen)
                    .map(|(i, _)| i)
                    .expect("cache is non-empty");
                bucket.candidates.remove(oldest);
            }
            bucket.candidates.push(Entry { contact, last_seen: now });
            return Some(PingRequest { stale, candidate: contact });
        }
    }

    fn split(&mut self, idx: usize) {
        let old = std::mem::replace(
            &mut self.buckets[idx],
            Bucket::new(Prefix::ALL), // placeholder
        );
        let zero = Bucket::new(old.prefix.child(false));
        let one = Bucket::new(old.prefix.child(true));
        self.buckets[idx] = zero;
        self.buckets.insert(idx + 1, one);

        for entry in old.verified {
            let i = self.bucket_index(&entry.contact.id);
            self.buckets[i].verified.push(entry);
        }
        for entry in old.candidates {
            let i = self.bucket_index(&entry.contact.id);
            let bucket = &mut self.buckets[i];
            if bucket.candidates.len() < CANDIDATE_CACHE {
                bucket.candidates.push(entry);
            }
        }
        trace!(buckets = self.buckets.len(), "split routing bucket");
    }

    /// Resolve an eviction ping issued by [`try_add_node`].
    pub fn ping_outcome(&mut self, request: &PingRequest, stale_replied: bool) {
        let now = self.tick();
        let idx = self.bucket_index(&request.stale.id);
        let bucket = &mut self.buckets[idx];

        if stale_replied {
            if let Some(entry) = bucket.find_verified(&request.stale) {
                entry.last_seen = now;
            }
            if let Some(ci) = bucket.find_candidate(&request.candidate) {
                bucket.candidates.remove(ci);
            }
            return;
        }

        bucket.verified.retain(|e| e.contact != request.stale);
        if let Some(ci) = bucket.find_candidate(&request.candidate) {
            if bucket.verified.len() < BUCKET_SIZE {
                let mut entry = bucket.candidates.remove(ci);
                entry.last_seen = now;
                bucket.verified.push(entry);
            }
        }
    }

    /// Drop a contact that keeps timing out.
    pub fn remove_node(&mut self, contact: &NodeContact) {
        let idx = self.bucket_index(&contact.id);
        let bucket = &mut self.buckets[idx];
        bucket.verified.retain(|e| e.contact != *contact);
        bucket.candidates.retain(|e| e.contact != *contact);
    }

    /// Drop every contact behind an endpoint (the id is unknown when only
    /// the transport address misbehaved).
    pub fn remove_by_endpoint(&mut self, endpoint: &SocketAddr) {
        for bucket in &mut self.buckets {
            bucket.verified.retain(|e| e.contact.endpoint != *endpoint);
            bucket.candidates.retain(|e| e.contact.endpoint != *endpoint);
        }
    }

    /// Up to `n` verified contacts, sorted by XOR distance to `target`.
    /// Pure and deterministic for a given table state.
    pub fn find_closest(&self, target: &NodeId, n: usize) -> Vec<NodeContact> {
        let mut all: Vec<NodeContact> = self
            .buckets
            .iter()
            .flat_map(|b| b.verified.iter().map(|e| e.contact))
            .collect();
        all.sort_by(|a, b| target.distance_cmp(&a.id, &b.id));
        all.truncate(n);
        all
    }

    /// Replace the local id (after a BEP-42 rederivation) and rebuild.
    /// Returns the contacts that were known so the caller can re-verify them.
    pub fn reset(&mut self, new_local_id: NodeId) -> Vec<NodeContact> {
        let contacts: Vec<NodeContact> = self
            .buckets
            .iter()
            .flat_map(|b| b.verified.iter().map(|e| e.contact))
            .collect();
        self.local_id = new_local_id;
        self.buckets = vec![Bucket::new(Prefix::ALL)];
        contacts
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{Ipv4Addr, SocketAddrV4};

    fn contact(id: NodeId, port: u16) -> NodeContact {
        NodeContact {
            id,
            endpoint: SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::LOCALHOST, port)),
        }
    }

    fn id_with_first_bits(bits: &[bool], tail: u8) -> NodeId {
        let mut id = NodeId::ZERO;
        for (n, b) in bits.iter().enumerate() {
            id.set_bit(n, *b);
        }
        let mut bytes = *id.as_bytes();
        bytes[NODE_ID_LEN - 1] = tail;
        NodeId::from_bytes(bytes)
    }

    #[test]
    fn test_full_bucket_of_far_ids_does_not_split() {
        // Local id all zeros; K+1 contacts starting with bit 1.
        let mut table = RoutingTable::new(NodeId::ZERO);
        for i in 0..=BUCKET_SIZE as u8 {
            table.try_add_node(contact(id_with_first_bits(&[true], i), 7000 + i as u16), true);
        }
        assert_eq!(table.bucket_count(), 1);
        assert_eq!(table.verified_count(), BUCKET_SIZE);
    }

    #[test]
    fn test_near_id_forces_split() {
        // K contacts starting with 1, then one starting with 0: the local
        // bucket splits into sizes K and 1.
        let mut table = RoutingTable::new(NodeId::ZERO);
        for i in 0..BUCKET_SIZE as u8 {
            table.try_add_node(contact(id_with_first_bits(&[true], i), 7000 + i as u16), true);
        }
        table.try_add_node(contact(id_with_first_bits(&[false], 1), 8000), true);
        assert_eq!(table.bucket_count(), 2);
        assert_eq!(table.verified_count(), BUCKET_SIZE + 1);
    }

    #[test]
    fn test_prefixes_partition_after_splits() {
        let mut table = RoutingTable::new(NodeId::ZERO);
        let mut next_port = 7000u16;
        for i in 0u32..64 {
            let mut id = NodeId::random();
            // Half the ids near the local id to provoke splits.
            if i % 2 == 0 {
                id.set_bit(0, false);
                id.set_bit(1, false);
            }
            table.try_add_node(contact(id, next_port), true);
            next_port += 1;
        }
        // Every id belongs to exactly one bucket.
        for _ in 0..256 {
            let id = NodeId::random();
            let owners = table
                .bucket_prefixes()
                .filter(|p| p.contains(&id))
                .count();
            assert_eq!(owners, 1);
        }
    }

    #[test]
    fn test_verified_lists_never_exceed_k() {
        let mut table = RoutingTable::new(NodeId::ZERO);
        for i in 0..512u16 {
            table.try_add_node(contact(NodeId::random(), 1000 + i), true);
        }
        for bucket in &table.buckets {
            assert!(bucket.verified.len() <= BUCKET_SIZE);
        }
    }

    #[test]
    fn test_find_closest_sorted_by_distance() {
        let mut table = RoutingTable::new(NodeId::ZERO);
        for i in 0..128u16 {
            table.try_add_node(contact(NodeId::random(), 1000 + i), true);
        }
        let target = NodeId::random();
        let closest = table.find_closest(&target, BUCKET_SIZE);
        assert!(closest.len() <= BUCKET_SIZE);
        for pair in closest.windows(2) {
            assert_ne!(target.distance_cmp(&pair[0].id, &pair[1].id), std::cmp::Ordering::Greater);
        }
    }

    #[test]
    fn test_eviction_ping_failure_promotes_candidate() {
        let mut table = RoutingTable::new(NodeId::ZERO);
        for i in 0..BUCKET_SIZE as u8 {
            table.try_add_node(contact(id_with_first_bits(&[true], i), 7000 + i as u16), true);
        }
        let newcomer = contact(id_with_first_bits(&[true], 0xee), 9000);
        let req = table.try_add_node(newcomer, true).expect("bucket is full");
        assert_eq!(req.candidate, newcomer);

        table.ping_outcome(&req, false);
        assert_eq!(table.verified_count(), BUCKET_SIZE);
        let closest = table.find_closest(&newcomer.id, BUCKET_SIZE);
        assert!(closest.contains(&newcomer));
        assert!(!closest.contains(&req.stale));
    }

    #[test]
    fn test_eviction_ping_success_discards_candidate() {
        let mut table = RoutingTable::new(NodeId::ZERO);
        for i in 0..BUCKET_SIZE as u8 {
            table.try_add_node(contact(id_with_first_bits(&[true], i), 7000 + i as u16), true);
        }
        let newcomer = contact(id_with_first_bits(&[true], 0xee), 9000);
        let req = table.try_add_node(newcomer, true).expect("bucket is full");

        table.ping_outcome(&req, true);
        assert_eq!(table.verified_count(), BUCKET_SIZE);
        let closest = table.find_closest(&newcomer.id, BUCKET_SIZE);
        assert!(!closest.contains(&newcomer));
        assert!(closest.contains(&req.stale));
    }

    #[test]
    fn test_unverified_contacts_stay_in_cache() {
        let mut table = RoutingTable::new(NodeId::ZERO);
        let c = contact(NodeId::random(), 7000);
        table.try_add_node(c, false);
        assert_eq!(table.verified_count(), 0);
        // A later verified sighting promotes it.
        table.try_add_node(c, true);
        assert_eq!(table.verified_count(), 1);
    }

    #[test]
    fn test_refresh_updates_recency() {
        let mut table = RoutingTable::new(NodeId::ZERO);
        let first = contact(id_with_first_bits(&[true], 0), 7000);
        table.try_add_node(first, true);
        for i in 1..BUCKET_SIZE as u8 {
            table.try_add_node(contact(id_with_first_bits(&[true], i), 7000 + i as u16), true);
        }
        // Refresh the oldest entry, then overflow: the ping must target the
        // new least-recently-seen entry, not the refreshed one.
        table.try_add_node(first, true);
        let req = table
            .try_add_node(contact(id_with_first_bits(&[true], 0xee), 9000), true)
            .expect("bucket is full");
        assert_ne!(req.stale, first);
    }

    #[test]
    fn test_reset_returns_known_contacts() {
        let mut table = RoutingTable::new(NodeId::ZERO);
        for i in 0..4u8 {
            table.try_add_node(contact(id_with_first_bits(&[true], i), 7000 + i as u16), true);
        }
        let contacts = table.reset(NodeId::random());
        assert_eq!(contacts.len(), 4);
        assert!(table.is_empty());
        assert_eq!(table.bucket_count(), 1);
    }
}
