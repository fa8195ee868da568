//! BEP-44 mutable and immutable data items
//!
//! Immutable items are addressed by the SHA-1 of their bencoding. Mutable
//! items are addressed by SHA-1(pubkey ‖ salt) and signed over the canonical
//! bencoded fragment `salt?, seq, v` (no enclosing dictionary).

use cachecraft_bencode::{encode, Value};
use cachecraft_crypto::{sha1_digest, verify_detached, PublicKey, Signature, SigningKeypair};

use crate::node_id::NodeId;

/// A signed mutable item. `seq` strictly orders updates under one
/// (pubkey, salt); a storing node accepts an update iff the signature
/// verifies and the sequence number is not behind what it already holds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MutableItem {
    pub key: PublicKey,
    pub salt: Vec<u8>,
    pub value: Value,
    pub seq: i64,
    pub signature: Signature,
}

impl MutableItem {
    /// Sign a value, producing a complete item.
    pub fn sign(keypair: &SigningKeypair, salt: Vec<u8>, seq: i64, value: Value) -> Self {
        let signable = signable_fragment(&salt, seq, &value);
        let signature = keypair.sign(&signable);
        Self { key: keypair.public_key_bytes(), salt, value, seq, signature }
    }

    pub fn verify(&self) -> bool {
        let signable = signable_fragment(&self.salt, self.seq, &self.value);
        verify_detached(&self.key, &signable, &self.signature)
    }

    /// The DHT target this item lives under.
    pub fn target(&self) -> NodeId {
        mutable_target(&self.key, &self.salt)
    }
}

/// SHA-1(pubkey ‖ salt), the storage key for a mutable item.
pub fn mutable_target(key: &PublicKey, salt: &[u8]) -> NodeId {
    let mut buf = Vec::with_capacity(key.len() + salt.len());
    buf.extend_from_slice(key);
    buf.extend_from_slice(salt);
    NodeId::from_bytes(sha1_digest(&buf))
}

/// The canonical signing fragment: `4:salt<n>:<salt>` when a salt is
/// present, then `3:seqi<seq>e1:v<bencoded value>`.
pub fn signable_fragment(salt: &[u8], seq: i64, value: &Value) -> Vec<u8> {
    let mut buf = Vec::new();
    if !salt.is_empty() {
        buf.extend_from_slice(b"4:salt");
        buf.extend_from_slice(&encode(&Value::Bytes(salt.to_vec())));
    }
    buf.extend_from_slice(format!("3:seqi{seq}e1:v").as_bytes());
    buf.extend_from_slice(&encode(value));
    buf
}

/// An immutable item: the value is its own address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImmutableItem {
    pub value: Value,
}

impl ImmutableItem {
    pub fn new(value: Value) -> Self {
        Self { value }
    }

    pub fn target(&self) -> NodeId {
        NodeId::from_bytes(sha1_digest(encode(&self.value)))
    }
}
