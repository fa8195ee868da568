use base64::Engine;
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand::rngs::OsRng;
use thiserror::Error;

use crate::PublicKey;

#[derive(Error, Debug)]
pub enum KeyError {
    #[error("Invalid public key")]
    InvalidPublicKey,

    #[error("Invalid key tag")]
    InvalidKeyTag,
}

/// Keypair for signing (Ed25519)
pub struct SigningKeypair {
    pub signing_key: SigningKey,
    pub verifying_key: VerifyingKey,
}

impl Clone for SigningKeypair {
    fn clone(&self) -> Self {
        Self {
            signing_key: SigningKey::from_bytes(&self.signing_key.to_bytes()),
            verifying_key: self.verifying_key,
        }
    }
}

impl SigningKeypair {
    /// Generate a new random signing keypair
    pub fn generate() -> Self {
        let signing_key = SigningKey::generate(&mut OsRng);
        let verifying_key = signing_key.verifying_key();
        Self { signing_key, verifying_key }
    }

    /// Get the public key as bytes
    pub fn public_key_bytes(&self) -> [u8; 32] {
        self.verifying_key.to_bytes()
    }

    /// Get the secret key as bytes
    pub fn secret_key_bytes(&self) -> [u8; 32] {
        self.signing_key.to_bytes()
    }

    /// Create from raw secret key bytes
    pub fn from_secret_bytes(secret: &[u8; 32]) -> Self {
        let signing_key = SigningKey::from_bytes(secret);
        let verifying_key = signing_key.verifying_key();
        Self { signing_key, verifying_key }
    }

    pub fn sign(&self, data: &[u8]) -> [u8; 64] {
        sign_detached(self, data)
    }
}

/// Sign data with a signing keypair
pub fn sign_detached(keypair: &SigningKeypair, data: &[u8]) -> [u8; 64] {
    let signature: Signature = keypair.signing_key.sign(data);
    signature.to_bytes()
}

/// Verify a detached signature
pub fn verify_detached(pubkey: &PublicKey, data: &[u8], signature: &[u8; 64]) -> bool {
    let verifying_key = match VerifyingKey::from_bytes(pubkey) {
        Ok(vk) => vk,
        Err(_) => return false,
    };

    let signature = Signature::from_bytes(signature);

    verifying_key.verify(data, &signature).is_ok()
}

/// Format a public key as its wire tag, `ed25519=<base64>`.
pub fn format_key_tag(pubkey: &PublicKey) -> String {
    format!("ed25519={}", base64::engine::general_purpose::STANDARD.encode(pubkey))
}

/// Parse an `ed25519=<base64>` key tag back into a public key.
pub fn parse_key_tag(tag: &str) -> Result<PublicKey, KeyError> {
    let b64 = tag.strip_prefix("ed25519=").ok_or(KeyError::InvalidKeyTag)?;
    let bytes = base64::engine::general_purpose::STANDARD
        .decode(b64)
        .map_err(|_| KeyError::InvalidKeyTag)?;
    let bytes: [u8; 32] = bytes.try_into().map_err(|_| KeyError::InvalidPublicKey)?;
    Ok(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sign_and_verify() {
        let keypair = SigningKeypair::generate();
        let data = b"Hello, CacheCraft!";

        let signature = sign_detached(&keypair, data);
        assert!(verify_detached(&keypair.public_key_bytes(), data, &signature));

        // Wrong data should fail
        assert!(!verify_detached(&keypair.public_key_bytes(), b"Wrong data", &signature));
    }

    #[test]
    fn test_wrong_pubkey_fails() {
        let keypair1 = SigningKeypair::generate();
        let keypair2 = SigningKeypair::generate();
        let data = b"Test data";

        let signature = sign_detached(&keypair1, data);

        assert!(!verify_detached(&keypair2.public_key_bytes(), data, &signature));
    }

    #[test]
    fn test_keypair_roundtrip() {
        let kp = SigningKeypair::generate();
        let restored = SigningKeypair::from_secret_bytes(&kp.secret_key_bytes());
        assert_eq!(restored.public_key_bytes(), kp.public_key_bytes());
    }

    #[test]
    fn test_key_tag_roundtrip() {
        let kp = SigningKeypair::generate();
        let tag = format_key_tag(&kp.public_key_bytes());
        assert!(tag.starts_with("ed25519="));
        assert_eq!(parse_key_tag(&tag).unwrap(), kp.public_key_bytes());
    }

    #[test]
    fn test_key_tag_rejects_garbage() {
        assert!(parse_key_tag("rsa=abcd").is_err());
        assert!(parse_key_tag("ed25519=!!!").is_err());
        assert!(parse_key_tag("ed25519=aGk=").is_err()); // wrong length
    }
}
