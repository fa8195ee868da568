//! CacheCraft DHT
//!
//! A self-bootstrapping BitTorrent mainline DHT node: BEP-5 tracker RPCs,
//! BEP-42 node ids, BEP-44 mutable/immutable data, all over one shared UDP
//! socket that also carries µTP stream segments for the transport layer.

pub mod data;
pub mod krpc;
pub mod mux;
pub mod node;
pub mod node_id;
pub mod routing;
pub mod storage;

pub use data::{mutable_target, ImmutableItem, MutableItem};
pub use mux::{Datagram, UdpMultiplexer, DEFAULT_UDP_PORT};
pub use node::{Dht, K};
pub use node_id::{NodeId, Prefix};
pub use routing::{NodeContact, RoutingTable, BUCKET_SIZE};
pub use storage::{DataStore, PutOutcome};
