//! 160-bit DHT node identifiers
//!
//! Bit positions are MSB-first: bit 0 is the high bit of byte 0. Identifiers
//! for our own node are derived from the WAN address per BEP-42 so that a
//! node cannot freely choose where in the keyspace it sits.

use std::cmp::Ordering;
use std::fmt;
use std::net::IpAddr;

use crc::{Crc, CRC_32_ISCSI};
use rand::Rng;

pub const NODE_ID_LEN: usize = 20;

const CRC32C: Crc<u32> = Crc::<u32>::new(&CRC_32_ISCSI);

/// A 160-bit identifier in the Kademlia keyspace: node ids, infohashes and
/// BEP-44 targets all share this type.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct NodeId {
    bytes: [u8; NODE_ID_LEN],
}

impl NodeId {
    pub const ZERO: NodeId = NodeId { bytes: [0u8; NODE_ID_LEN] };

    pub fn from_bytes(bytes: [u8; NODE_ID_LEN]) -> Self {
        Self { bytes }
    }

    pub fn from_slice(slice: &[u8]) -> Option<Self> {
        let bytes: [u8; NODE_ID_LEN] = slice.try_into().ok()?;
        Some(Self { bytes })
    }

    pub fn as_bytes(&self) -> &[u8; NODE_ID_LEN] {
        &self.bytes
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.bytes)
    }

    pub fn from_hex(s: &str) -> Option<Self> {
        let raw = hex::decode(s).ok()?;
        Self::from_slice(&raw)
    }

    pub fn random() -> Self {
        let mut bytes = [0u8; NODE_ID_LEN];
        rand::thread_rng().fill(&mut bytes);
        Self { bytes }
    }

    /// MSB-first bit access: bit 0 is the top bit of byte 0.
    pub fn bit(&self, n: usize) -> bool {
        debug_assert!(n < NODE_ID_LEN * 8);
        self.bytes[n / 8] & (1 << (7 - (n % 8))) != 0
    }

    pub fn set_bit(&mut self, n: usize, value: bool) {
        debug_assert!(n < NODE_ID_LEN * 8);
        let mask = 1 << (7 - (n % 8));
        if value {
            self.bytes[n / 8] |= mask;
        } else {
            self.bytes[n / 8] &= !mask;
        }
    }

    /// Order `left` and `right` by XOR distance to `self`.
    pub fn distance_cmp(&self, left: &NodeId, right: &NodeId) -> Ordering {
        for i in 0..NODE_ID_LEN {
            let l = left.bytes[i] ^ self.bytes[i];
            let r = right.bytes[i] ^ self.bytes[i];
            match l.cmp(&r) {
                Ordering::Equal => continue,
                other => return other,
            }
        }
        Ordering::Equal
    }

    /// Is `left` strictly closer to `self` than `right`?
    pub fn closer_to(&self, left: &NodeId, right: &NodeId) -> bool {
        self.distance_cmp(left, right) == Ordering::Less
    }

    /// Derive an id from an address per BEP-42, with the 3-bit random seed
    /// mixed into the checksum input and the whole seed byte kept at the
    /// tail. `rnd` is only fixed by tests; pass `None` otherwise.
    pub fn generate(addr: IpAddr, rnd: Option<u8>) -> Self {
        let mut rng = rand::thread_rng();
        let mut id = NodeId::ZERO;

        id.bytes[NODE_ID_LEN - 1] = rnd.unwrap_or_else(|| rng.gen());

        let checksum = match addr {
            IpAddr::V4(v4) => {
                let mut ip = v4.octets();
                for (i, b) in ip.iter_mut().enumerate() {
                    *b &= 0xff >> (6 - i * 2);
                }
                ip[0] |= (id.bytes[NODE_ID_LEN - 1] & 7) << 5;
                CRC32C.checksum(&ip)
            }
            IpAddr::V6(v6) => {
                let mut ip: [u8; 8] = v6.octets()[..8].try_into().expect("8-byte slice");
                for (i, b) in ip.iter_mut().enumerate() {
                    *b &= 0xff >> (7 - i);
                }
                ip[0] |= (id.bytes[NODE_ID_LEN - 1] & 7) << 5;
                CRC32C.checksum(&ip)
            }
        };

        id.bytes[0] = (checksum >> 24) as u8;
        id.bytes[1] = (checksum >> 16) as u8;
        id.bytes[2] = ((checksum >> 8) as u8 & 0xf8) | (rng.gen::<u8>() & 0x7);
        for b in &mut id.bytes[3..NODE_ID_LEN - 1] {
            *b = rng.gen();
        }

        id
    }

    /// Does `id` satisfy the BEP-42 relation for `addr`? Soft check for
    /// incoming queries; mismatches are logged, not rejected.
    pub fn matches_endpoint(&self, addr: IpAddr) -> bool {
        let expected = NodeId::generate(addr, Some(self.bytes[NODE_ID_LEN - 1]));
        self.bytes[0] == expected.bytes[0]
            && self.bytes[1] == expected.bytes[1]
            && (self.bytes[2] & 0xf8) == (expected.bytes[2] & 0xf8)
    }
}

impl fmt::Debug for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NodeId({})", self.to_hex())
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

/// A bit-prefix of the keyspace: the first `len` bits of `stencil` are
/// significant. Buckets in the routing table each own one prefix, and
/// together the prefixes partition the space.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Prefix {
    stencil: NodeId,
    len: usize,
}

impl Prefix {
    /// The whole keyspace.
    pub const ALL: Prefix = Prefix { stencil: NodeId::ZERO, len: 0 };

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn contains(&self, id: &NodeId) -> bool {
        (0..self.len).all(|n| id.bit(n) == self.stencil.bit(n))
    }

    /// Narrow by one bit.
    pub fn child(&self, bit: bool) -> Prefix {
        debug_assert!(self.len < NODE_ID_LEN * 8);
        let mut stencil = self.stencil;
        stencil.set_bit(self.len, bit);
        Prefix { stencil, len: self.len + 1 }
    }

    /// A uniformly random id inside this prefix, for bucket-refresh lookups.
    pub fn random_id(&self) -> NodeId {
        let mut id = NodeId::random();
        for n in 0..self.len {
            id.set_bit(n, self.stencil.bit(n));
        }
        id
    }
}
