//! CacheCraft Crypto
//!
//! Ed25519 signing for cache responses and BEP-44 items, digest helpers,
//! and the rolling HMAC secrets behind DHT write tokens.

mod hash;
mod keys;
mod token;

pub use hash::{sha1_digest, sha256_digest, sha512_digest};
pub use keys::{
    format_key_tag, parse_key_tag, sign_detached, verify_detached, KeyError, SigningKeypair,
};
pub use token::TokenSecrets;

/// 32-byte Ed25519 public key
pub type PublicKey = [u8; 32];

/// 64-byte Ed25519 signature
pub type Signature = [u8; 64];
