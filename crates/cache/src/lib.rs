//! CacheCraft Cache
//!
//! The signed-HTTP distributed cache: response signing and incremental
//! verification, the on-disk content-addressed store with atomic commits
//! and LRU eviction, the group index, the multi-peer reader that races
//! swarm members for content, the announcer that keeps held content
//! visible in the DHT, LAN peer discovery, and the peer server that hands
//! stored responses to other nodes.

pub mod announcer;
pub mod codec;
pub mod group;
pub mod head;
pub mod lpd;
pub mod lru;
pub mod reader;
pub mod server;
pub mod session;
pub mod sign;
pub mod store;

pub use announcer::{Announcer, AnnounceFn, DEFAULT_SIMULTANEOUS_ANNOUNCEMENTS};
pub use codec::{
    sign_response, BlockReceipt, InjectionMeta, SignedBlock, SignedResponse, VerifiedHead,
    Verifier, DEFAULT_BLOCK_SIZE,
};
pub use group::GroupIndex;
pub use head::{field, ResponseHead, PROTOCOL_VERSION};
pub use lpd::LocalPeerDiscovery;
pub use lru::PersistentLru;
pub use reader::{FetchEvent, MultiPeerReader, PeerResponse, MAX_CONCURRENT_PEERS};
pub use server::PeerServer;
pub use session::{Part, Session};
pub use store::{swarm_infohash, swarm_name, HttpStore, SigRecord, StoreEntry, StoreWriter};
