//! KRPC message codec (BEP-5 with the BEP-44 extension)
//!
//! Bencoded UDP datagrams with a `t` transaction id and a `y` message type.
//! Compact node info is 26 bytes (id ‖ IPv4 ‖ port), compact peer info is
//! 6 bytes (IPv4 ‖ port), ports big-endian in both.

use std::collections::BTreeMap;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};

use cachecraft_bencode::{decode_with_limits, encode, DecodeLimits, Value};
use cachecraft_core::{Error, Result};

use crate::node_id::{NodeId, NODE_ID_LEN};
use crate::routing::NodeContact;

pub const COMPACT_NODE_LEN: usize = NODE_ID_LEN + 6;
pub const COMPACT_PEER_LEN: usize = 6;

/// KRPC error codes used on the wire.
pub mod error_code {
    pub const GENERIC: i64 = 201;
    pub const PROTOCOL: i64 = 203;
    pub const METHOD_UNKNOWN: i64 = 204;
    pub const PUT_TOO_BIG: i64 = 205;
    pub const INVALID_SIGNATURE: i64 = 206;
}

/// Largest accepted BEP-44 value, bencoded.
pub const MAX_PUT_VALUE_LEN: usize = 1000;

/// A query as seen on the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Query {
    Ping,
    FindNode {
        target: NodeId,
    },
    GetPeers {
        info_hash: NodeId,
    },
    AnnouncePeer {
        info_hash: NodeId,
        port: u16,
        implied_port: bool,
        token: Vec<u8>,
    },
    /// BEP-44 read.
    Get {
        target: NodeId,
        seq: Option<i64>,
    },
    /// BEP-44 write; mutable when `key`/`sig`/`seq` are present.
    Put {
        token: Vec<u8>,
        value: Value,
        key: Option<[u8; 32]>,
        salt: Vec<u8>,
        seq: Option<i64>,
        signature: Option<[u8; 64]>,
    },
}

impl Query {
    pub fn method(&self) -> &'static str {
        match self {
            Query::Ping => "ping",
            Query::FindNode { .. } => "find_node",
            Query::GetPeers { .. } => "get_peers",
            Query::AnnouncePeer { .. } => "announce_peer",
            Query::Get { .. } => "get",
            Query::Put { .. } => "put",
        }
    }
}

/// Reply payload; unused fields stay `None`/empty and are omitted on encode.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Reply {
    pub id: Option<NodeId>,
    pub nodes: Vec<NodeContact>,
    pub values: Vec<SocketAddrV4>,
    pub token: Option<Vec<u8>>,
    /// BEP-44 fields.
    pub key: Option<[u8; 32]>,
    pub seq: Option<i64>,
    pub signature: Option<[u8; 64]>,
    pub value: Option<Value>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Body {
    Query { sender: NodeId, query: Query },
    Reply(Reply),
    Error { code: i64, message: String },
}

/// One KRPC datagram.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub tx: Vec<u8>,
    pub body: Body,
    /// Our address as the remote saw it (top-level `ip`, BEP-42).
    pub external_addr: Option<SocketAddrV4>,
}

impl Message {
    pub fn query(tx: Vec<u8>, sender: NodeId, query: Query) -> Self {
        Self { tx, body: Body::Query { sender, query }, external_addr: None }
    }

    pub fn reply(tx: Vec<u8>, reply: Reply) -> Self {
        Self { tx, body: Body::Reply(reply), external_addr: None }
    }

    pub fn error(tx: Vec<u8>, code: i64, message: impl Into<String>) -> Self {
        Self { tx, body: Body::Error { code, message: message.into() }, external_addr: None }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut top = BTreeMap::new();
        top.insert(b"t".to_vec(), Value::Bytes(self.tx.clone()));
        if let Some(addr) = &self.external_addr {
            top.insert(b"ip".to_vec(), Value::Bytes(encode_compact_peer(addr)));
        }
        match &self.body {
            Body::Query { sender, query } => {
                top.insert(b"y".to_vec(), Value::from("q"));
                top.insert(b"q".to_vec(), Value::from(query.method()));
                top.insert(b"a".to_vec(), encode_args(sender, query));
            }
            Body::Reply(reply) => {
                top.insert(b"y".to_vec(), Value::from("r"));
                top.insert(b"r".to_vec(), encode_reply(reply));
            }
            Body::Error { code, message } => {
                top.insert(b"y".to_vec(), Value::from("e"));
                top.insert(
                    b"e".to_vec(),
                    Value::List(vec![Value::Int(*code), Value::from(message.as_str())]),
                );
            }
        }
        encode(&Value::Dict(top))
    }

    pub fn decode(datagram: &[u8]) -> Result<Self> {
        let root = decode_with_limits(datagram, DecodeLimits::default())
            .map_err(Error::protocol)?;
        let tx = root
            .get_bytes("t")
            .ok_or_else(|| Error::protocol("missing transaction id"))?
            .to_vec();
        let external_addr = root
            .get_bytes("ip")
            .and_then(|b| decode_compact_peer(b).ok());
        let body = match root.get_str("y") {
            Some("q") => decode_query(&root)?,
            Some("r") => Body::Reply(decode_reply(
                root.get("r").ok_or_else(|| Error::protocol("missing reply body"))?,
            )?),
            Some("e") => decode_error(&root)?,
            _ => return Err(Error::protocol("missing or unknown message type")),
        };
        Ok(Self { tx, body, external_addr })
    }
}

fn encode_args(sender: &NodeId, query: &Query) -> Value {
    let mut args = BTreeMap::new();
    args.insert(b"id".to_vec(), Value::from(&sender.as_bytes()[..]));
    match query {
        Query::Ping => {}
        Query::FindNode { target } => {
            args.insert(b"target".to_vec(), Value::from(&target.as_bytes()[..]));
        }
        Query::GetPeers { info_hash } => {
            args.insert(b"info_hash".to_vec(), Value::from(&info_hash.as_bytes()[..]));
        }
        Query::AnnouncePeer { info_hash, port, implied_port, token } => {
            args.insert(b"info_hash".to_vec(), Value::from(&info_hash.as_bytes()[..]));
            args.insert(b"port".to_vec(), Value::Int(*port as i64));
            args.insert(b"implied_port".to_vec(), Value::Int(*implied_port as i64));
            args.insert(b"token".to_vec(), Value::Bytes(token.clone()));
        }
        Query::Get { target, seq } => {
            args.insert(b"target".to_vec(), Value::from(&target.as_bytes()[..]));
            if let Some(seq) = seq {
                args.insert(b"seq".to_vec(), Value::Int(*seq));
            }
        }
        Query::Put { token, value, key, salt, seq, signature } => {
            args.insert(b"token".to_vec(), Value::Bytes(token.clone()));
            args.insert(b"v".to_vec(), value.clone());
            if let Some(key) = key {
                args.insert(b"k".to_vec(), Value::from(&key[..]));
            }
            if !salt.is_empty() {
                args.insert(b"salt".to_vec(), Value::Bytes(salt.clone()));
            }
            if let Some(seq) = seq {
                args.insert(b"seq".to_vec(), Value::Int(*seq));
            }
            if let Some(sig) = signature {
                args.insert(b"sig".to_vec(), Value::from(&sig[..]));
            }
        }
    }
    Value::Dict(args)
}

fn decode_query(root: &Value) -> Result<Body> {
    let args = root.get("a").ok_or_else(|| Error::protocol("missing query args"))?;
    let sender = args
        .get_bytes("id")
        .and_then(NodeId::from_slice)
        .ok_or_else(|| Error::protocol("missing sender id"))?;
    let id_arg = |name: &str| -> Result<NodeId> {
        args.get_bytes(name)
            .and_then(NodeId::from_slice)
            .ok_or_else(|| Error::protocol(format!("missing {name}")))
    };
    let query = match root.get_str("q") {
        Some("ping") => Query::Ping,
        Some("find_node") => Query::FindNode { target: id_arg("target")? },
        Some("get_peers") => Query::GetPeers { info_hash: id_arg("info_hash")? },
        Some("announce_peer") => Query::AnnouncePeer {
            info_hash: id_arg("info_hash")?,
            port: args.get_int("port").unwrap_or(0) as u16,
            implied_port: args.get_int("implied_port").unwrap_or(0) != 0,
            token: args
                .get_bytes("token")
                .ok_or_else(|| Error::protocol("missing token"))?
                .to_vec(),
        },
        Some("get") => Query::Get { target: id_arg("target")?, seq: args.get_int("seq") },
        Some("put") => Query::Put {
            token: args
                .get_bytes("token")
                .ok_or_else(|| Error::protocol("missing token"))?
                .to_vec(),
            value: args
                .get("v")
                .cloned()
                .ok_or_else(|| Error::protocol("missing value"))?,
            key: args.get_bytes("k").and_then(|b| b.try_into().ok()),
            salt: args.get_bytes("salt").map(|b| b.to_vec()).unwrap_or_default(),
            seq: args.get_int("seq"),
            signature: args.get_bytes("sig").and_then(|b| b.try_into().ok()),
        },
        Some(other) => return Err(Error::protocol(format!("unknown method {other}"))),
        None => return Err(Error::protocol("missing method name")),
    };
    Ok(Body::Query { sender, query })
}

fn encode_reply(reply: &Reply) -> Value {
    let mut r = BTreeMap::new();
    if let Some(id) = &reply.id {
        r.insert(b"id".to_vec(), Value::from(&id.as_bytes()[..]));
    }
    if !reply.nodes.is_empty() {
        r.insert(b"nodes".to_vec(), Value::Bytes(encode_compact_nodes(&reply.nodes)));
    }
    if !reply.values.is_empty() {
        r.insert(
            b"values".to_vec(),
            Value::List(
                reply
                    .values
                    .iter()
                    .map(|p| Value::Bytes(encode_compact_peer(p)))
                    .collect(),
            ),
        );
    }
    if let Some(token) = &reply.token {
        r.insert(b"token".to_vec(), Value::Bytes(token.clone()));
    }
    if let Some(key) = &reply.key {
        r.insert(b"k".to_vec(), Value::from(&key[..]));
    }
    if let Some(seq) = reply.seq {
        r.insert(b"seq".to_vec(), Value::Int(seq));
    }
    if let Some(sig) = &reply.signature {
        r.insert(b"sig".to_vec(), Value::from(&sig[..]));
    }
    if let Some(value) = &reply.value {
        r.insert(b"v".to_vec(), value.clone());
    }
    Value::Dict(r)
}

fn decode_reply(r: &Value) -> Result<Reply> {
    Ok(Reply {
        id: r.get_bytes("id").and_then(NodeId::from_slice),
        nodes: r
            .get_bytes("nodes")
            .map(decode_compact_nodes)
            .transpose()?
            .unwrap_or_default(),
        values: r
            .get("values")
            .and_then(Value::as_list)
            .map(|items| {
                items
                    .iter()
                    .filter_map(|v| v.as_bytes())
                    .filter_map(|b| decode_compact_peer(b).ok())
                    .collect()
            })
            .unwrap_or_default(),
        token: r.get_bytes("token").map(|b| b.to_vec()),
        key: r.get_bytes("k").and_then(|b| b.try_into().ok()),
        seq: r.get_int("seq"),
        signature: r.get_bytes("sig").and_then(|b| b.try_into().ok()),
        value: r.get("v").cloned(),
    })
}

fn decode_error(root: &Value) -> Result<Body> {
    let list = root
        .get("e")
        .and_then(Value::as_list)
        .ok_or_else(|| Error::protocol("missing error body"))?;
    let code = list
        .first()
        .and_then(Value::as_int)
        .ok_or_else(|| Error::protocol("missing error code"))?;
    let message = list
        .get(1)
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();
    Ok(Body::Error { code, message })
}

pub fn encode_compact_peer(peer: &SocketAddrV4) -> Vec<u8> {
    let mut out = Vec::with_capacity(COMPACT_PEER_LEN);
    out.extend_from_slice(&peer.ip().octets());
    out.extend_from_slice(&peer.port().to_be_bytes());
    out
}

pub fn decode_compact_peer(raw: &[u8]) -> Result<SocketAddrV4> {
    if raw.len() != COMPACT_PEER_LEN {
        return Err(Error::protocol("bad compact peer length"));
    }
    let ip = Ipv4Addr::new(raw[0], raw[1], raw[2], raw[3]);
    let port = u16::from_be_bytes([raw[4], raw[5]]);
    Ok(SocketAddrV4::new(ip, port))
}

pub fn encode_compact_nodes(nodes: &[NodeContact]) -> Vec<u8> {
    let mut out = Vec::with_capacity(nodes.len() * COMPACT_NODE_LEN);
    for node in nodes {
        // Compact node info is IPv4-only; v6 contacts travel via BEP-32
        // (`nodes6`), which we do not speak.
        if let SocketAddr::V4(v4) = node.endpoint {
            out.extend_from_slice(node.id.as_bytes());
            out.extend_from_slice(&encode_compact_peer(&v4));
        }
    }
    out
}

pub fn decode_compact_nodes(raw: &[u8]) -> Result<Vec<NodeContact>> {
    if raw.len() % COMPACT_NODE_LEN != 0 {
        return Err(Error::protocol("bad compact node list length"));
    }
    let mut out = Vec::with_capacity(raw.len() / COMPACT_NODE_LEN);
    for chunk in raw.chunks_exact(COMPACT_NODE_LEN) {
        let id = NodeId::from_slice(&chunk[..NODE_ID_LEN]).expect("chunk is 26 bytes");
        let peer = decode_compact_peer(&chunk[NODE_ID_LEN..])?;
        out.push(NodeContact { id, endpoint: SocketAddr::V4(peer) });
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tx() -> Vec<u8> {
        vec![0x00, 0x2a]
    }

    #[test]
    fn test_ping_roundtrip() {
        let msg = Message::query(tx(), NodeId::random(), Query::Ping);
        let decoded = Message::decode(&msg.encode()).unwrap();
        assert_eq!(decoded, msg);
    }

    #[test]
    fn test_find_node_roundtrip() {
        let msg = Message::query(
            tx(),
            NodeId::random(),
            Query::FindNode { target: NodeId::random() },
        );
        assert_eq!(Message::decode(&msg.encode()).unwrap(), msg);
    }

    #[test]
    fn test_announce_peer_roundtrip() {
        let msg = Message::query(
            tx(),
            NodeId::random(),
            Query::AnnouncePeer {
                info_hash: NodeId::random(),
                port: 6881,
                implied_port: true,
                token: b"tok".to_vec(),
            },
        );
        assert_eq!(Message::decode(&msg.encode()).unwrap(), msg);
    }

    #[test]
    fn test_put_roundtrip() {
        let msg = Message::query(
            tx(),
            NodeId::random(),
            Query::Put {
                token: b"tok".to_vec(),
                value: Value::from("hello"),
                key: Some([7u8; 32]),
                salt: b"s".to_vec(),
                seq: Some(3),
                signature: Some([9u8; 64]),
            },
        );
        assert_eq!(Message::decode(&msg.encode()).unwrap(), msg);
    }

    #[test]
    fn test_reply_roundtrip_with_nodes_and_values() {
        let nodes = vec![
            NodeContact {
                id: NodeId::random(),
                endpoint: "1.2.3.4:6881".parse().unwrap(),
            },
            NodeContact {
                id: NodeId::random(),
                endpoint: "5.6.7.8:51413".parse().unwrap(),
            },
        ];
        let reply = Reply {
            id: Some(NodeId::random()),
            nodes: nodes.clone(),
            values: vec!["9.9.9.9:1000".parse().unwrap()],
            token: Some(b"write-token".to_vec()),
            ..Default::default()
        };
        let mut msg = Message::reply(tx(), reply);
        msg.external_addr = Some("203.0.113.7:6881".parse().unwrap());
        assert_eq!(Message::decode(&msg.encode()).unwrap(), msg);
    }

    #[test]
    fn test_error_roundtrip() {
        let msg = Message::error(tx(), error_code::PROTOCOL, "Protocol Error");
        assert_eq!(Message::decode(&msg.encode()).unwrap(), msg);
    }

    #[test]
    fn test_compact_peer_is_big_endian() {
        let peer: SocketAddrV4 = "1.2.3.4:6881".parse().unwrap();
        assert_eq!(encode_compact_peer(&peer), vec![1, 2, 3, 4, 0x1a, 0xe1]);
    }

    #[test]
    fn test_compact_nodes_reject_ragged_input() {
        assert!(decode_compact_nodes(&[0u8; 27]).is_err());
        assert!(decode_compact_nodes(&[0u8; 52]).is_ok());
    }

    #[test]
    fn test_decode_rejects_non_bencode() {
        assert!(Message::decode(b"\x01\x02\x03").is_err());
        assert!(Message::decode(b"d1:t2:aae").is_err()); // no message type
    }
}
